use crate::domain_pair::DomainPair;
use crate::session::OutgoingSession;
use async_trait::async_trait;
use rfc6120::BoxedAsyncReadAndWrite;
use stanza::Stanza;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// A connected socket to one of the hosts serving a remote XMPP domain.
pub struct XmppSocket {
    pub stream: BoxedAsyncReadAndWrite,
    /// The address actually connected to, kept for same-address
    /// reconnects during plaintext fallback.
    pub addr: SocketAddr,
    /// The discovered endpoint expects TLS immediately on connect
    /// (an XEP-0368 style direct-TLS service record).
    pub direct_tls: bool,
}

impl std::fmt::Debug for XmppSocket {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("XmppSocket")
            .field("addr", &self.addr)
            .field("direct_tls", &self.direct_tls)
            .finish()
    }
}

/// Host discovery and socket creation. SRV resolution, host preference
/// ordering and connect timeouts all live behind this trait.
#[async_trait]
pub trait SocketProvider: Send + Sync {
    /// Discover hosts for `domain` and return a connected socket to the
    /// first one that accepts, or None when no host is reachable.
    async fn connect(&self, domain: &str, port: u16) -> Option<XmppSocket>;

    /// Re-establish a plain connection to a specific, previously
    /// discovered address.
    async fn reconnect_plain(&self, addr: SocketAddr) -> Option<BoxedAsyncReadAndWrite> {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                Some(Box::new(stream))
            }
            Err(err) => {
                tracing::info!("unable to reconnect to {addr}: {err:#}");
                None
            }
        }
    }
}

/// The server's routing table. Adding a pair makes stanzas from
/// `pair.local` to `pair.remote` flow over `session`.
pub trait RoutingTable: Send + Sync {
    fn add_server_route(&self, pair: &DomainPair, session: &Arc<OutgoingSession>);
    fn remove_server_route(&self, pair: &DomainPair);
}

/// Delivers stanzas originated by this server back into the router,
/// used for bounces.
pub trait PacketRouter: Send + Sync {
    fn route(&self, stanza: Stanza);
}

/// Federation policy: blocklists and per-domain overrides.
pub trait RemoteServerPolicy: Send + Sync {
    /// False when federation is disabled entirely or the domain is
    /// blocklisted.
    fn can_access(&self, domain: &str) -> bool;

    /// Per-domain port override; the configured default applies
    /// otherwise.
    fn port_for(&self, domain: &str) -> Option<u16> {
        let _ = domain;
        None
    }
}

/// Observer for session lifecycle events.
pub trait SessionEventSink: Send + Sync {
    fn session_created(&self, session: &Arc<OutgoingSession>);

    fn session_destroyed(&self, session: &Arc<OutgoingSession>) {
        let _ = session;
    }
}
