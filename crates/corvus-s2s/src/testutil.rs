//! Shared fakes for the test modules in this crate.

use crate::domain_pair::DomainPair;
use crate::interfaces::{
    PacketRouter, RemoteServerPolicy, RoutingTable, SessionEventSink, SocketProvider, XmppSocket,
};
use crate::registry::SessionRegistry;
use crate::session::{AuthenticationMethod, OutgoingSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use rfc6120::{BoxedAsyncReadAndWrite, StreamClient, StreamTimeouts};
use stanza::{Iq, IqKind, Jid, Stanza};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;

pub(crate) const TEST_SECRET: &str = "s3cr3t";

#[derive(Default)]
pub(crate) struct RecordingRouter {
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl RecordingRouter {
    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl RoutingTable for RecordingRouter {
    fn add_server_route(&self, _pair: &DomainPair, _session: &Arc<OutgoingSession>) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_server_route(&self, _pair: &DomainPair) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct CollectingPackets {
    tx: tokio::sync::mpsc::UnboundedSender<Stanza>,
}

impl CollectingPackets {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Stanza>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PacketRouter for CollectingPackets {
    fn route(&self, stanza: Stanza) {
        self.tx.send(stanza).ok();
    }
}

#[derive(Default)]
pub(crate) struct CountingEvents {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl SessionEventSink for CountingEvents {
    fn session_created(&self, _session: &Arc<OutgoingSession>) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn session_destroyed(&self, _session: &Arc<OutgoingSession>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct AllowAllPolicy;

impl RemoteServerPolicy for AllowAllPolicy {
    fn can_access(&self, _domain: &str) -> bool {
        true
    }
}

pub(crate) struct DenyAllPolicy;

impl RemoteServerPolicy for DenyAllPolicy {
    fn can_access(&self, _domain: &str) -> bool {
        false
    }
}

/// Hands out pre-scripted duplex streams instead of real sockets and
/// counts how often the engine asked for one.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    sockets: Mutex<VecDeque<XmppSocket>>,
    reconnects: Mutex<VecDeque<BoxedAsyncReadAndWrite>>,
    pub connect_count: AtomicUsize,
    pub reconnect_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn push(&self, stream: DuplexStream, direct_tls: bool) {
        self.sockets.lock().push_back(XmppSocket {
            stream: Box::new(stream),
            addr: test_addr(),
            direct_tls,
        });
    }

    pub fn push_reconnect(&self, stream: DuplexStream) {
        self.reconnects.lock().push_back(Box::new(stream));
    }
}

pub(crate) fn test_addr() -> SocketAddr {
    "192.0.2.7:5269".parse().unwrap()
}

#[async_trait]
impl SocketProvider for ScriptedProvider {
    async fn connect(&self, _domain: &str, _port: u16) -> Option<XmppSocket> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.sockets.lock().pop_front()
    }

    async fn reconnect_plain(&self, _addr: SocketAddr) -> Option<BoxedAsyncReadAndWrite> {
        self.reconnect_count.fetch_add(1, Ordering::SeqCst);
        self.reconnects.lock().pop_front()
    }
}

pub(crate) fn make_session(
    registry: &Arc<SessionRegistry>,
    method: AuthenticationMethod,
) -> (Arc<OutgoingSession>, DuplexStream) {
    make_session_with(registry, Arc::new(RecordingRouter::default()), method)
}

pub(crate) fn make_session_with(
    registry: &Arc<SessionRegistry>,
    router: Arc<dyn RoutingTable>,
    method: AuthenticationMethod,
) -> (Arc<OutgoingSession>, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let client = StreamClient::with_stream(near, "b.test", StreamTimeouts::short_timeouts());
    let session = OutgoingSession::new(
        "a.test",
        "b.test",
        "stream-1".to_string(),
        client,
        method,
        false,
        router,
        registry.clone(),
        TEST_SECRET.to_string(),
    );
    (session, far)
}

pub(crate) fn engine_with(
    config: crate::config::S2sConfig,
    provider: Arc<ScriptedProvider>,
) -> (
    crate::authenticate::S2sEngine,
    Arc<RecordingRouter>,
    Arc<CountingEvents>,
    tokio::sync::mpsc::UnboundedReceiver<Stanza>,
) {
    let router = Arc::new(RecordingRouter::default());
    let events = Arc::new(CountingEvents::default());
    let (packets, rx) = CollectingPackets::new();
    let engine = crate::authenticate::S2sEngine::new(
        config,
        TEST_SECRET,
        provider,
        router.clone(),
        packets,
        Arc::new(AllowAllPolicy),
        events.clone(),
    );
    (engine, router, events, rx)
}

pub(crate) async fn read_some(far: &mut DuplexStream) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 8192];
    let n = far.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[0..n]).to_string()
}

/// Keep reading until `needle` has arrived; tolerates the sender
/// splitting its output over several writes.
pub(crate) async fn read_until(far: &mut DuplexStream, needle: &str) -> String {
    let mut collected = String::new();
    loop {
        collected.push_str(&read_some(far).await);
        if collected.contains(needle) {
            return collected;
        }
    }
}

pub(crate) fn iq_request() -> Stanza {
    Stanza::Iq(Iq {
        id: "iq-1".to_string(),
        from: Jid::domain("a.test"),
        to: Jid::domain("b.test"),
        kind: IqKind::Get,
        payload: Some(stanza::Element::new("query").with_attr("xmlns", "jabber:iq:version")),
        error: None,
    })
}
