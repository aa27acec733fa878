use std::fmt;

/// A Jabber ID. The domain part is folded to lowercase at construction;
/// node and resource are left as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.map(|n| n.to_string()),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(|r| r.to_string()),
        }
    }

    /// A bare server JID consisting of only the domain component.
    pub fn domain(domain: &str) -> Self {
        Self::new(None, domain, None)
    }

    pub fn node_part(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    pub fn resource_part(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The bare form (node@domain) of this JID.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(fmt, "{node}@")?;
        }
        write!(fmt, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(fmt, "/{resource}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Jid {
    type Err = InvalidJid;

    fn from_str(s: &str) -> Result<Self, InvalidJid> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        if domain.is_empty() {
            return Err(InvalidJid(s.to_string()));
        }
        Ok(Jid::new(node, domain, resource))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not a valid JID")]
pub struct InvalidJid(pub String);
