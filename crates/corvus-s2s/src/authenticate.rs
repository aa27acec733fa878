use crate::auth_mutex::RemoteAuthMutex;
use crate::config::S2sConfig;
use crate::domain_pair::DomainPair;
use crate::handshake;
use crate::interfaces::{
    PacketRouter, RemoteServerPolicy, RoutingTable, SessionEventSink, SocketProvider,
};
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::session::{AuthenticationMethod, OutgoingSession};
use stanza::Stanza;
use std::sync::Arc;

/// The outgoing federation engine: owns the session registry and the
/// per-remote authentication locks, and drives establishment and reuse.
/// Collaborators (resolver, routing table, policy, event sinks) are
/// injected so independent instances can coexist.
pub struct S2sEngine {
    pub(crate) config: S2sConfig,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) mutexes: RemoteAuthMutex,
    pub(crate) sockets: Arc<dyn SocketProvider>,
    pub(crate) router: Arc<dyn RoutingTable>,
    pub(crate) packets: Arc<dyn PacketRouter>,
    pub(crate) policy: Arc<dyn RemoteServerPolicy>,
    pub(crate) events: Arc<dyn SessionEventSink>,
    pub(crate) dialback_secret: String,
}

impl S2sEngine {
    pub fn new(
        config: S2sConfig,
        dialback_secret: impl Into<String>,
        sockets: Arc<dyn SocketProvider>,
        router: Arc<dyn RoutingTable>,
        packets: Arc<dyn PacketRouter>,
        policy: Arc<dyn RemoteServerPolicy>,
        events: Arc<dyn SessionEventSink>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            mutexes: RemoteAuthMutex::new(),
            sockets,
            router,
            packets,
            policy,
            events,
            dialback_secret: dialback_secret.into(),
        }
    }

    pub fn config(&self) -> &S2sConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn mutexes(&self) -> &RemoteAuthMutex {
        &self.mutexes
    }

    /// Authenticate the local domain to the remote domain, after which
    /// the remote server accepts stanzas from `pair.local()` over the
    /// resulting session.
    ///
    /// An existing session is re-used when it already serves the pair,
    /// or when it was established with dialback to the same peer (the
    /// pair is then piggybacked onto it). Otherwise a new connection is
    /// negotiated. Attempts for the same remote domain are serialized;
    /// attempts for distinct remotes run in parallel.
    pub async fn authenticate_domain(&self, pair: &DomainPair) -> bool {
        let remote = pair.remote();
        tracing::debug!("{pair}: start domain authentication");
        if remote.is_empty() || remote.contains(char::is_whitespace) {
            tracing::warn!("{pair}: unable to authenticate: remote domain is invalid");
            return false;
        }
        if !self.policy.can_access(remote) {
            tracing::info!(
                "{pair}: unable to authenticate: remote domain is not accessible according to \
                 our configuration (typical causes: federation is disabled, or the domain is \
                 blocklisted)"
            );
            return false;
        }

        let lock = self.mutexes.lock_for(remote);
        let _guard = lock.lock().await;

        if let Some(session) = self.find_reusable_session(pair) {
            if session.check_outgoing_domain_pair(pair) {
                tracing::debug!(
                    "{pair}: authentication successful (already authenticated in a \
                     pre-existing session)"
                );
                self.events.session_created(&session);
                return true;
            }
            if session.authenticate_subdomain(pair).await {
                tracing::debug!(
                    "{pair}: authentication successful (added to a pre-existing session)"
                );
                self.events.session_created(&session);
                return true;
            }
            tracing::warn!(
                "{pair}: unable to authenticate: unable to add authentication to the \
                 pre-existing session"
            );
            return false;
        }

        tracing::debug!("{pair}: unable to re-use an existing session; creating a new one");
        let port = self
            .policy
            .port_for(remote)
            .unwrap_or(self.config.remote_port);
        match handshake::create_outgoing_session(self, pair, port).await {
            Some(session) => {
                session.add_outgoing_domain_pair(pair.clone());
                session.mark_authenticated();
                self.registry.register(&session);
                match session.authentication_method() {
                    AuthenticationMethod::SaslExternal => metrics::SESSIONS_ESTABLISHED_SASL.inc(),
                    AuthenticationMethod::Dialback => metrics::SESSIONS_ESTABLISHED_DIALBACK.inc(),
                }
                self.events.session_created(&session);
                tracing::debug!("{pair}: authentication successful");
                true
            }
            None => {
                metrics::HANDSHAKE_FAILURES.inc();
                tracing::warn!("{pair}: unable to authenticate: failed to create a new session");
                false
            }
        }
    }

    /// The reuse planner: a session can carry `pair` when it serves the
    /// exact pair already, or when it is a dialback session to another
    /// domain validated by the same peer (discovered via that peer's
    /// incoming sessions). Certificate-bound sessions never qualify for
    /// piggybacking.
    fn find_reusable_session(&self, pair: &DomainPair) -> Option<Arc<OutgoingSession>> {
        if let Some(session) = self.registry.get_outgoing(pair) {
            if session.check_outgoing_domain_pair(pair) || session.can_piggyback() {
                return Some(session);
            }
            tracing::debug!(
                "{pair}: dialback was not used for the existing session; it cannot be re-used"
            );
        }

        for incoming in self.registry.incoming_sessions_for(pair.remote()) {
            // The domains the peer may send to us from are expected to
            // be sub- or superdomains of the remote domain.
            for other_remote in incoming.validated_domains() {
                let candidate = DomainPair::new(pair.local(), &other_remote);
                if let Some(session) = self.registry.get_outgoing(&candidate) {
                    if session.can_piggyback() {
                        tracing::debug!(
                            "{pair}: an outgoing dialback session to '{other_remote}' on the \
                             same remote server can be re-used"
                        );
                        return Some(session);
                    }
                    tracing::debug!(
                        "{pair}: dialback was not used for '{other_remote}'; that session \
                         cannot be re-used"
                    );
                }
            }
        }
        None
    }

    /// Send-path gate for `session`; see
    /// [`OutgoingSession::can_process`].
    pub async fn can_process(&self, session: &Arc<OutgoingSession>, stanza: &Stanza) -> bool {
        session.can_process(stanza, &self.mutexes, &self.packets).await
    }

    /// Tear a session down and notify listeners.
    pub async fn close_session(&self, session: &Arc<OutgoingSession>) {
        session.close().await;
        self.events.session_destroyed(session);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TlsPolicy;
    use crate::dialback::dialback_key;
    use crate::registry::IncomingSession;
    use crate::testutil::{
        engine_with, iq_request, read_some, read_until, DenyAllPolicy, ScriptedProvider,
        TEST_SECRET,
    };
    use rfc6120::{StreamClient, StreamTimeouts};
    use stanza::{ErrorCondition, IqKind, Jid, Stanza};
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn test_config() -> S2sConfig {
        S2sConfig {
            timeouts: StreamTimeouts::short_timeouts(),
            ..S2sConfig::default()
        }
    }

    fn pair() -> DomainPair {
        DomainPair::new("a.test", "b.test")
    }

    /// Scripts the responder side of an inline XMPP 1.0 dialback
    /// negotiation on `far`: stream header, features offering dialback,
    /// then a `valid` verdict for the key belonging to `stream_id`.
    fn spawn_dialback_peer(
        mut far: DuplexStream,
        stream_id: &'static str,
        verdict: &'static str,
    ) -> tokio::task::JoinHandle<DuplexStream> {
        tokio::spawn(async move {
            let sent = read_some(&mut far).await;
            assert!(sent.contains("<stream:stream"));
            assert!(sent.contains("version=\"1.0\""));
            far.write_all(
                format!(
                    "<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                     xmlns=\"jabber:server\" xmlns:db=\"jabber:server:dialback\" \
                     id=\"{stream_id}\" version=\"1.0\">\
                     <stream:features><dialback xmlns=\"urn:xmpp:features:dialback\"/>\
                     </stream:features>"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            let sent = read_some(&mut far).await;
            let expected_key = dialback_key(TEST_SECRET, &pair(), stream_id);
            assert!(sent.contains(&expected_key), "unexpected key in {sent}");
            far.write_all(
                format!("<db:result from=\"b.test\" to=\"a.test\" type=\"{verdict}\"/>").as_bytes(),
            )
            .await
            .unwrap();
            far
        })
    }

    #[tokio::test]
    async fn empty_or_whitespace_remote_is_rejected_without_io() {
        let provider = Arc::new(ScriptedProvider::default());
        let (engine, _router, _events, _rx) = engine_with(test_config(), provider.clone());

        assert!(!engine.authenticate_domain(&DomainPair::new("a.test", "")).await);
        assert!(
            !engine
                .authenticate_domain(&DomainPair::new("a.test", "b .test"))
                .await
        );
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blocklisted_remote_is_rejected_without_io() {
        let provider = Arc::new(ScriptedProvider::default());
        let (mut engine, _router, _events, _rx) = engine_with(test_config(), provider.clone());
        engine.policy = Arc::new(DenyAllPolicy);

        assert!(!engine.authenticate_domain(&pair()).await);
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inline_dialback_establishes_and_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::default());
        let (near, far) = tokio::io::duplex(64 * 1024);
        provider.push(near, false);
        let (engine, router, events, _rx) = engine_with(test_config(), provider.clone());
        let peer = spawn_dialback_peer(far, "sid-1", "valid");

        assert!(engine.authenticate_domain(&pair()).await);
        let _far = peer.await.unwrap();

        let session = engine.registry().get_outgoing(&pair()).unwrap();
        assert_eq!(
            session.authentication_method(),
            AuthenticationMethod::Dialback
        );
        assert!(!session.is_encrypted());
        assert_eq!(session.stream_id(), "sid-1");
        assert!(session.check_outgoing_domain_pair(&pair()));
        assert_eq!(router.added(), 1);
        assert_eq!(events.created.load(Ordering::SeqCst), 1);
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 1);

        // A second authentication finds the session and opens no socket
        assert!(engine.authenticate_domain(&pair()).await);
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 1);
        assert_eq!(events.created.load(Ordering::SeqCst), 2);

        engine.close_session(&session).await;
        assert_eq!(events.destroyed.load(Ordering::SeqCst), 1);
        assert!(engine.registry().get_outgoing(&pair()).is_none());
    }

    /// A direct-TLS endpoint that actually speaks plaintext: the TLS
    /// handshake fails on the plaintext stream header, the engine
    /// reconnects to the same address without TLS, and dialback
    /// authenticates over the plain stream.
    #[tokio::test]
    async fn plaintext_in_direct_tls_falls_back_to_plain_connection() {
        let provider = Arc::new(ScriptedProvider::default());
        let (near1, mut far1) = tokio::io::duplex(64 * 1024);
        let (near2, far2) = tokio::io::duplex(64 * 1024);
        provider.push(near1, true);
        provider.push_reconnect(near2);
        let (engine, _router, _events, _rx) = engine_with(test_config(), provider.clone());

        // Answer the TLS client hello with a plaintext stream header
        let plaintext_peer = tokio::spawn(async move {
            far1.write_all(
                b"<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                  xmlns=\"jabber:server\" id=\"plain-1\" version=\"1.0\">",
            )
            .await
            .unwrap();
            // Drain whatever the client hello contained
            let _ = read_some(&mut far1).await;
        });
        let dialback_peer = spawn_dialback_peer(far2, "sid-5", "valid");

        assert!(engine.authenticate_domain(&pair()).await);
        plaintext_peer.await.unwrap();
        let _far2 = dialback_peer.await.unwrap();

        let session = engine.registry().get_outgoing(&pair()).unwrap();
        assert!(!session.is_encrypted());
        assert_eq!(
            session.authentication_method(),
            AuthenticationMethod::Dialback
        );
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 1);
        assert_eq!(provider.reconnect_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tls_required_without_starttls_sends_not_authorized() {
        let provider = Arc::new(ScriptedProvider::default());
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        provider.push(near, false);
        let mut config = test_config();
        config.tls = TlsPolicy::Required;
        let (engine, _router, _events, _rx) = engine_with(config, provider.clone());

        let peer = tokio::spawn(async move {
            let _ = read_some(&mut far).await;
            far.write_all(
                b"<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                  xmlns=\"jabber:server\" id=\"sid-2\" version=\"1.0\">\
                  <stream:features><dialback xmlns=\"urn:xmpp:features:dialback\"/>\
                  </stream:features>",
            )
            .await
            .unwrap();
            let sent = read_until(&mut far, "</stream:stream>").await;
            assert!(sent.contains("<stream:error>"));
            assert!(sent.contains("<not-authorized"));
            assert!(sent.contains("TLS is mandatory, but was not established."));
        });

        assert!(!engine.authenticate_domain(&pair()).await);
        peer.await.unwrap();
        assert!(engine.registry().get_outgoing(&pair()).is_none());
        // The plain dialback fallback must not run when TLS is required
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_xmpp10_peer_is_authenticated_via_plain_dialback_fallback() {
        let provider = Arc::new(ScriptedProvider::default());
        let (near1, mut far1) = tokio::io::duplex(64 * 1024);
        let (near2, mut far2) = tokio::io::duplex(64 * 1024);
        provider.push(near1, false);
        provider.push(near2, false);
        let (engine, _router, _events, _rx) = engine_with(test_config(), provider.clone());

        // First connection: the peer answers with a pre-1.0 stream
        // header, so in-band negotiation cannot proceed.
        let legacy_peer = tokio::spawn(async move {
            let _ = read_some(&mut far1).await;
            far1.write_all(
                b"<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                  xmlns=\"jabber:server\" id=\"legacy-1\">",
            )
            .await
            .unwrap();
            // Our side closes this stream before falling back
            let sent = read_some(&mut far1).await;
            assert!(sent.contains("</stream:stream>"));
        });

        // Second connection: the legacy dialback exchange.
        let fallback_peer = tokio::spawn(async move {
            let sent = read_some(&mut far2).await;
            assert!(sent.contains("<stream:stream"));
            assert!(!sent.contains("version="));
            far2.write_all(
                b"<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                  xmlns=\"jabber:server\" xmlns:db=\"jabber:server:dialback\" id=\"legacy-2\">",
            )
            .await
            .unwrap();
            let sent = read_some(&mut far2).await;
            let expected_key = dialback_key(TEST_SECRET, &pair(), "legacy-2");
            assert!(sent.contains(&expected_key));
            far2.write_all(b"<db:result from=\"b.test\" to=\"a.test\" type=\"valid\"/>")
                .await
                .unwrap();
            far2
        });

        assert!(engine.authenticate_domain(&pair()).await);
        legacy_peer.await.unwrap();
        let _far2 = fallback_peer.await.unwrap();

        let session = engine.registry().get_outgoing(&pair()).unwrap();
        assert_eq!(
            session.authentication_method(),
            AuthenticationMethod::Dialback
        );
        assert!(!session.is_encrypted());
        assert_eq!(session.stream_id(), "legacy-2");
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_negotiation_leaves_no_registry_entry() {
        let provider = Arc::new(ScriptedProvider::default());
        let (near, far) = tokio::io::duplex(64 * 1024);
        provider.push(near, false);
        let mut config = test_config();
        config.dialback_enabled = false;
        let (engine, _router, events, _rx) = engine_with(config, provider.clone());

        // Peer offers nothing usable; with dialback disabled there is no
        // fallback either.
        let peer = spawn_plain_features_peer(far);

        assert!(!engine.authenticate_domain(&pair()).await);
        peer.await.unwrap();
        assert!(engine.registry().get_outgoing(&pair()).is_none());
        assert_eq!(engine.registry().outgoing_count(), 0);
        assert_eq!(events.created.load(Ordering::SeqCst), 0);
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 1);
    }

    fn spawn_plain_features_peer(mut far: DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let sent = read_some(&mut far).await;
            // Dialback is disabled, so our header must not declare it
            assert!(!sent.contains("xmlns:db"));
            far.write_all(
                b"<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                  xmlns=\"jabber:server\" id=\"sid-3\" version=\"1.0\">\
                  <stream:features/>",
            )
            .await
            .unwrap();
            // Orderly close from our side
            let _ = read_some(&mut far).await;
        })
    }

    #[tokio::test]
    async fn piggyback_reuses_session_discovered_via_incoming_link() {
        let provider = Arc::new(ScriptedProvider::default());
        let (engine, _router, events, _rx) = engine_with(test_config(), provider.clone());

        // Pre-existing dialback session for (a.test, b.test)
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let client = StreamClient::with_stream(near, "b.test", StreamTimeouts::short_timeouts());
        let existing = OutgoingSession::new(
            "a.test",
            "b.test",
            "sid-0",
            client,
            AuthenticationMethod::Dialback,
            false,
            engine.router.clone(),
            engine.registry.clone(),
            TEST_SECRET.to_string(),
        );
        existing.add_outgoing_domain_pair(pair());
        existing.mark_authenticated();

        // An incoming link from b.test has validated chat.b.test (and
        // its own domain), marking both as hosted by the same server
        let incoming = IncomingSession::new("b.test");
        incoming.add_validated_domain("b.test");
        incoming.add_validated_domain("chat.b.test");
        engine.registry().register_incoming(&incoming);

        let subdomain_pair = DomainPair::new("a.test", "chat.b.test");
        let peer = tokio::spawn(async move {
            let sent = read_some(&mut far).await;
            assert!(sent.contains("to=\"chat.b.test\""));
            far.write_all(b"<db:result from=\"chat.b.test\" to=\"a.test\" type=\"valid\"/>")
                .await
                .unwrap();
            far
        });

        assert!(engine.authenticate_domain(&subdomain_pair).await);
        let _far = peer.await.unwrap();

        // No new socket was opened; the pair set grew instead
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 0);
        assert_eq!(existing.outgoing_domain_pairs().len(), 2);
        assert!(existing.check_outgoing_domain_pair(&subdomain_pair));
        let found = engine.registry().get_outgoing(&subdomain_pair).unwrap();
        assert!(Arc::ptr_eq(&found, &existing));
        assert_eq!(events.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn piggyback_refusal_fails_without_new_connection() {
        let provider = Arc::new(ScriptedProvider::default());
        let (engine, _router, _events, _rx) = engine_with(test_config(), provider.clone());

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let client = StreamClient::with_stream(near, "b.test", StreamTimeouts::short_timeouts());
        let existing = OutgoingSession::new(
            "a.test",
            "b.test",
            "sid-0",
            client,
            AuthenticationMethod::Dialback,
            false,
            engine.router.clone(),
            engine.registry.clone(),
            TEST_SECRET.to_string(),
        );
        existing.add_outgoing_domain_pair(pair());

        let incoming = IncomingSession::new("b.test");
        incoming.add_validated_domain("b.test");
        incoming.add_validated_domain("chat.b.test");
        engine.registry().register_incoming(&incoming);

        let subdomain_pair = DomainPair::new("a.test", "chat.b.test");
        let peer = tokio::spawn(async move {
            let _ = read_some(&mut far).await;
            far.write_all(b"<db:result from=\"chat.b.test\" to=\"a.test\" type=\"invalid\"/>")
                .await
                .unwrap();
            far
        });

        assert!(!engine.authenticate_domain(&subdomain_pair).await);
        let _far = peer.await.unwrap();
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 0);
        assert!(!existing.check_outgoing_domain_pair(&subdomain_pair));
    }

    #[tokio::test]
    async fn unauthorized_send_bounces_remote_server_not_found() {
        let provider = Arc::new(ScriptedProvider::default());
        let (engine, _router, _events, mut rx) = engine_with(test_config(), provider);

        let (near, _far) = tokio::io::duplex(4096);
        let client = StreamClient::with_stream(near, "b.test", StreamTimeouts::short_timeouts());
        let session = OutgoingSession::new(
            "a.test",
            "b.test",
            "sid-0",
            client,
            AuthenticationMethod::SaslExternal,
            true,
            engine.router.clone(),
            engine.registry.clone(),
            TEST_SECRET.to_string(),
        );
        session.add_outgoing_domain_pair(pair());

        let stanza = Stanza::Iq(stanza::Iq {
            id: "v1".to_string(),
            from: Jid::domain("other.test"),
            to: Jid::domain("b.test"),
            kind: IqKind::Get,
            payload: None,
            error: None,
        });

        assert!(!engine.can_process(&session, &stanza).await);
        let reply = rx.recv().await.unwrap();
        match reply {
            Stanza::Iq(iq) => {
                assert_eq!(iq.kind, IqKind::Error);
                assert_eq!(iq.error, Some(ErrorCondition::RemoteServerNotFound));
                assert_eq!(iq.to, Jid::domain("other.test"));
                assert_eq!(iq.from, Jid::domain("b.test"));
            }
            other => panic!("unexpected bounce {other:?}"),
        }

        // The authorized pair still flows
        assert!(engine.can_process(&session, &iq_request()).await);
    }

    #[tokio::test]
    async fn concurrent_attempts_for_same_remote_share_one_session() {
        let provider = Arc::new(ScriptedProvider::default());
        let (near, far) = tokio::io::duplex(64 * 1024);
        provider.push(near, false);
        let (engine, _router, _events, _rx) = engine_with(test_config(), provider.clone());
        let engine = Arc::new(engine);
        let peer = spawn_dialback_peer(far, "sid-7", "valid");

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.authenticate_domain(&pair()).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }
        let _far = peer.await.unwrap();

        // Only the first attempt performed a handshake
        assert_eq!(provider.connect_count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.registry().outgoing_count(), 1);
    }
}
