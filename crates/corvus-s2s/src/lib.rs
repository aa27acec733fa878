//! Outgoing server-to-server session establishment.
//!
//! Given a `(local domain, remote domain)` pair, obtain a connection over
//! which this server is authorized to send stanzas from the local domain
//! to the remote server, and register it for routing. Establishment
//! prefers TLS + SASL EXTERNAL and falls back to server dialback
//! (XEP-0220), including piggybacking additional domain pairs onto an
//! existing dialback session.

pub mod auth_mutex;
pub mod authenticate;
pub mod bounce;
pub mod config;
pub mod dialback;
pub(crate) mod handshake;
pub mod interfaces;
pub mod metrics;
pub mod registry;
pub mod session;

mod domain_pair;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth_mutex::RemoteAuthMutex;
pub use authenticate::S2sEngine;
pub use config::{S2sConfig, TlsPolicy};
pub use domain_pair::DomainPair;
pub use interfaces::{
    PacketRouter, RemoteServerPolicy, RoutingTable, SessionEventSink, SocketProvider, XmppSocket,
};
pub use registry::{IncomingSession, SessionRegistry};
pub use session::{AuthenticationMethod, OutgoingSession, SessionStatus};
