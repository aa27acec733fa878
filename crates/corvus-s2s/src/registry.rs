use crate::domain_pair::DomainPair;
use crate::session::OutgoingSession;
use dashmap::DashMap;
use parking_lot::RwLock;
use stanza::Jid;
use std::collections::HashSet;
use std::sync::Arc;

/// An inbound server-to-server link, as far as the outgoing engine cares
/// about it: who connected, and which domains the dialback responder has
/// validated on that link. The responder side populates these records;
/// the outgoing engine only reads them to discover sub/superdomains
/// hosted by a peer it already talks to.
#[derive(Debug)]
pub struct IncomingSession {
    address: Jid,
    validated: RwLock<HashSet<String>>,
}

impl IncomingSession {
    pub fn new(remote_domain: &str) -> Arc<Self> {
        Arc::new(Self {
            address: Jid::domain(remote_domain),
            validated: RwLock::new(HashSet::new()),
        })
    }

    pub fn address(&self) -> &Jid {
        &self.address
    }

    pub fn add_validated_domain(&self, domain: &str) {
        self.validated.write().insert(domain.to_ascii_lowercase());
    }

    pub fn has_validated(&self, domain: &str) -> bool {
        self.validated.read().contains(domain)
    }

    pub fn validated_domains(&self) -> Vec<String> {
        self.validated.read().iter().cloned().collect()
    }
}

/// Process-wide directory of live server sessions.
///
/// Outgoing sessions are keyed by the domain pairs they are authorized
/// for; exactly one session serves a pair at a time. Incoming sessions
/// are grouped by the originating remote domain.
///
/// Reads are lock-free snapshots; writes happen on the authenticator's
/// registration path and on session close.
#[derive(Default)]
pub struct SessionRegistry {
    outgoing: DashMap<DomainPair, Arc<OutgoingSession>>,
    incoming: DashMap<String, Vec<Arc<IncomingSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session currently serving `pair`, if any.
    pub fn get_outgoing(&self, pair: &DomainPair) -> Option<Arc<OutgoingSession>> {
        self.outgoing.get(pair).map(|entry| entry.value().clone())
    }

    /// Record a freshly authenticated session under every pair it
    /// carries.
    pub fn register(&self, session: &Arc<OutgoingSession>) {
        for pair in session.outgoing_domain_pairs() {
            self.register_pair(&pair, session);
        }
    }

    pub(crate) fn register_pair(&self, pair: &DomainPair, session: &Arc<OutgoingSession>) {
        if let Some(previous) = self.outgoing.insert(pair.clone(), session.clone()) {
            if !Arc::ptr_eq(&previous, session) {
                tracing::warn!("replaced a live outgoing session for {pair}");
            }
        }
    }

    /// Drop every pair entry pointing at `session`.
    pub fn unregister(&self, session: &Arc<OutgoingSession>) {
        for pair in session.outgoing_domain_pairs() {
            self.outgoing
                .remove_if(&pair, |_, registered| Arc::ptr_eq(registered, session));
        }
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Incoming sessions belonging to `remote`: links the peer opened
    /// from that domain, plus links on which the peer has validated that
    /// domain as one of its own.
    pub fn incoming_sessions_for(&self, remote: &str) -> Vec<Arc<IncomingSession>> {
        let remote = remote.to_ascii_lowercase();
        let mut result = vec![];
        for entry in self.incoming.iter() {
            for session in entry.value() {
                if session.address().domain_part() == remote || session.has_validated(&remote) {
                    result.push(session.clone());
                }
            }
        }
        result
    }

    pub fn register_incoming(&self, session: &Arc<IncomingSession>) {
        self.incoming
            .entry(session.address().domain_part().to_string())
            .or_default()
            .push(session.clone());
    }

    pub fn remove_incoming(&self, session: &Arc<IncomingSession>) {
        if let Some(mut entry) = self.incoming.get_mut(session.address().domain_part()) {
            entry.retain(|registered| !Arc::ptr_eq(registered, session));
        }
    }
}
