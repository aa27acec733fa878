use crate::auth_mutex::RemoteAuthMutex;
use crate::bounce;
use crate::dialback;
use crate::domain_pair::DomainPair;
use crate::interfaces::{PacketRouter, RoutingTable};
use crate::metrics;
use crate::registry::SessionRegistry;
use parking_lot::{Mutex, RwLock};
use rfc6120::StreamClient;
use stanza::{Jid, Stanza};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// Server dialback (XEP-0220). Additional domain pairs may be
    /// piggybacked onto the session.
    Dialback,
    /// SASL EXTERNAL over TLS. The authorization is bound to the
    /// certificate, so the session serves exactly the pairs it was
    /// established for.
    SaslExternal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Authenticated,
    Closed,
}

/// An authenticated outgoing link to one remote server, used only for
/// sending. The same connection carries every `(local, remote)` pair the
/// peer has validated for it; the routing table holds one entry per
/// pair.
pub struct OutgoingSession {
    local_domain: String,
    address: Jid,
    stream_id: String,
    auth_method: AuthenticationMethod,
    encrypted: bool,
    status: Mutex<SessionStatus>,
    detached: AtomicBool,
    pairs: RwLock<HashSet<DomainPair>>,
    client: tokio::sync::Mutex<StreamClient>,
    router: Arc<dyn RoutingTable>,
    registry: Arc<SessionRegistry>,
    dialback_secret: String,
}

impl OutgoingSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local_domain: &str,
        remote_domain: &str,
        stream_id: impl Into<String>,
        client: StreamClient,
        auth_method: AuthenticationMethod,
        encrypted: bool,
        router: Arc<dyn RoutingTable>,
        registry: Arc<SessionRegistry>,
        dialback_secret: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_domain: local_domain.to_ascii_lowercase(),
            address: Jid::domain(remote_domain),
            stream_id: stream_id.into(),
            auth_method,
            encrypted,
            status: Mutex::new(SessionStatus::Connecting),
            detached: AtomicBool::new(false),
            pairs: RwLock::new(HashSet::new()),
            client: tokio::sync::Mutex::new(client),
            router,
            registry,
            dialback_secret,
        })
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// The remote server, as a bare domain JID.
    pub fn address(&self) -> &Jid {
        &self.address
    }

    /// The stream identifier the peer assigned at stream open.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn authentication_method(&self) -> AuthenticationMethod {
        self.auth_method
    }

    pub fn is_using_server_dialback(&self) -> bool {
        self.auth_method == AuthenticationMethod::Dialback
    }

    /// Whether further domain pairs may be authenticated onto this
    /// session. Certificate-bound sessions cannot vouch for other
    /// domains.
    pub fn can_piggyback(&self) -> bool {
        self.is_using_server_dialback()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub(crate) fn mark_authenticated(&self) {
        let mut status = self.status.lock();
        if *status == SessionStatus::Connecting {
            *status = SessionStatus::Authenticated;
        }
    }

    /// Transport severed but the session logically retained for a grace
    /// period, awaiting resumption or final teardown by the routing
    /// layer.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    pub fn set_detached(&self, detached: bool) {
        self.detached.store(detached, Ordering::Relaxed);
    }

    /// Authorize `pair` on this session: remembers it and registers the
    /// route. Idempotent.
    pub fn add_outgoing_domain_pair(self: &Arc<Self>, pair: DomainPair) {
        debug_assert_eq!(pair.local(), self.local_domain);
        if !self.pairs.write().insert(pair.clone()) {
            return;
        }
        self.router.add_server_route(&pair, self);
        self.registry.register_pair(&pair, self);
    }

    pub fn check_outgoing_domain_pair(&self, pair: &DomainPair) -> bool {
        let result = self.pairs.read().contains(pair);
        tracing::trace!("authentication exists for outgoing domain pair {pair}: {result}");
        result
    }

    pub fn outgoing_domain_pairs(&self) -> Vec<DomainPair> {
        self.pairs.read().iter().cloned().collect()
    }

    /// Piggyback authentication of an additional pair via dialback over
    /// this session's stream. Refused outright on certificate-bound
    /// sessions.
    pub async fn authenticate_subdomain(self: &Arc<Self>, pair: &DomainPair) -> bool {
        if !self.can_piggyback() {
            return false;
        }
        let mut client = self.client.lock().await;
        match dialback::authenticate_over_stream(
            &mut client,
            pair,
            &self.stream_id,
            &self.dialback_secret,
        )
        .await
        {
            Ok(true) => {
                drop(client);
                self.add_outgoing_domain_pair(pair.clone());
                metrics::PIGGYBACK_AUTHENTICATIONS.inc();
                true
            }
            Ok(false) => {
                tracing::debug!("{}: peer refused dialback for {pair}", self.address);
                false
            }
            Err(err) => {
                tracing::warn!("{}: dialback for {pair} failed: {err:#}", self.address);
                false
            }
        }
    }

    /// Gate on the send path: a stanza may only go out if its domain
    /// pair is authorized, attempting piggyback authentication first.
    /// Unauthorized stanzas are bounced back to the sender
    /// asynchronously and never delivered.
    pub async fn can_process(
        self: &Arc<Self>,
        stanza: &Stanza,
        mutexes: &RemoteAuthMutex,
        packets: &Arc<dyn PacketRouter>,
    ) -> bool {
        let pair = DomainPair::new(stanza.from().domain_part(), stanza.to().domain_part());
        let lock = mutexes.lock_for(pair.remote());
        let processed = {
            let _guard = lock.lock().await;
            self.check_outgoing_domain_pair(&pair) || self.authenticate_subdomain(&pair).await
        };
        if !processed {
            bounce::return_error_to_sender(stanza.clone(), packets.clone());
        }
        processed
    }

    pub async fn deliver(&self, stanza: &Stanza) -> anyhow::Result<()> {
        let mut client = self.client.lock().await;
        if !client.is_connected() {
            anyhow::bail!("connection to {} is closed", self.address);
        }
        client.deliver_raw_text(&stanza.to_xml()).await?;
        Ok(())
    }

    /// Tear the session down: drop every route, unregister, close the
    /// transport. Safe to call more than once; only the first call acts.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut status = self.status.lock();
            if *status == SessionStatus::Closed {
                return;
            }
            *status = SessionStatus::Closed;
        }
        for pair in self.outgoing_domain_pairs() {
            self.router.remove_server_route(&pair);
        }
        self.registry.unregister(self);
        self.client.lock().await.close().await;
    }
}

impl fmt::Debug for OutgoingSession {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let pairs = self
            .outgoing_domain_pairs()
            .iter()
            .map(DomainPair::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        fmt.debug_struct("OutgoingSession")
            .field("address", &self.address.to_string())
            .field("stream_id", &self.stream_id)
            .field("status", &self.status())
            .field("is_encrypted", &self.encrypted)
            .field("is_detached", &self.is_detached())
            .field("authentication_method", &self.auth_method)
            .field("outgoing_domain_pairs", &pairs)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{make_session, make_session_with, RecordingRouter};
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn pair_bookkeeping_is_idempotent_and_routes_once() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(RecordingRouter::default());
        let (session, _far) =
            make_session_with(&registry, router.clone(), AuthenticationMethod::Dialback);
        let pair = DomainPair::new("a.test", "b.test");

        assert!(!session.check_outgoing_domain_pair(&pair));
        session.add_outgoing_domain_pair(pair.clone());
        session.add_outgoing_domain_pair(pair.clone());

        assert!(session.check_outgoing_domain_pair(&pair));
        assert!(session.check_outgoing_domain_pair(&DomainPair::new("A.test", "B.TEST")));
        assert_eq!(session.outgoing_domain_pairs().len(), 1);
        assert_eq!(router.added(), 1);
        assert!(registry.get_outgoing(&pair).is_some());
    }

    #[tokio::test]
    async fn sasl_external_sessions_refuse_piggybacking() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, _far) = make_session(&registry, AuthenticationMethod::SaslExternal);
        assert!(!session.can_piggyback());
        assert!(
            !session
                .authenticate_subdomain(&DomainPair::new("a.test", "chat.b.test"))
                .await
        );
    }

    #[tokio::test]
    async fn piggyback_adds_pair_on_valid_dialback() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, mut far) = make_session(&registry, AuthenticationMethod::Dialback);
        let pair = DomainPair::new("a.test", "chat.b.test");

        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let n = far.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[0..n]).to_string();
            assert!(sent.contains("to=\"chat.b.test\""));
            far.write_all(b"<db:result from=\"chat.b.test\" to=\"a.test\" type=\"valid\"/>")
                .await
                .unwrap();
            far
        });

        assert!(session.authenticate_subdomain(&pair).await);
        assert!(session.check_outgoing_domain_pair(&pair));
        assert!(registry.get_outgoing(&pair).is_some());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_exactly_once_and_clears_routes() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(RecordingRouter::default());
        let (session, _far) =
            make_session_with(&registry, router.clone(), AuthenticationMethod::Dialback);
        let pair = DomainPair::new("a.test", "b.test");
        session.add_outgoing_domain_pair(pair.clone());
        session.mark_authenticated();
        assert_eq!(session.status(), SessionStatus::Authenticated);

        session.close().await;
        session.close().await;

        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(router.removed(), 1);
        assert!(registry.get_outgoing(&pair).is_none());
        assert!(session.deliver(&crate::testutil::iq_request()).await.is_err());
    }
}
