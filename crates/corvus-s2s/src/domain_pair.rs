use std::fmt;

/// The authorization unit for outgoing federation traffic: stanzas from
/// `local` may be sent to `remote` once this pair is authenticated on a
/// session. Both sides are folded to lowercase at construction, so
/// equality and hashing are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainPair {
    local: String,
    remote: String,
}

impl DomainPair {
    pub fn new(local: &str, remote: &str) -> Self {
        Self {
            local: local.to_ascii_lowercase(),
            remote: remote.to_ascii_lowercase(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} -> {}", self.local, self.remote)
    }
}
