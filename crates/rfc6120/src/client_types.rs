use serde::{Deserialize, Serialize};
use stanza::Element;
use std::time::Duration;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
pub struct StreamTimeouts {
    #[serde(
        default = "StreamTimeouts::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,

    /// How long to wait for the peer's `<stream:stream>` response after
    /// sending our own stream header. RFC 6120 peers answer immediately;
    /// this is deliberately short so a dead host fails fast.
    #[serde(
        default = "StreamTimeouts::default_stream_open_timeout",
        with = "humantime_serde"
    )]
    pub stream_open_timeout: Duration,

    #[serde(
        default = "StreamTimeouts::default_features_timeout",
        with = "humantime_serde"
    )]
    pub features_timeout: Duration,

    #[serde(
        default = "StreamTimeouts::default_starttls_timeout",
        with = "humantime_serde"
    )]
    pub starttls_timeout: Duration,

    #[serde(
        default = "StreamTimeouts::default_auth_timeout",
        with = "humantime_serde"
    )]
    pub auth_timeout: Duration,

    /// Dialback verification requires the peer to dial back to the
    /// authoritative server for our domain, so this is the longest wait
    /// in the whole handshake.
    #[serde(
        default = "StreamTimeouts::default_dialback_timeout",
        with = "humantime_serde"
    )]
    pub dialback_timeout: Duration,

    /// The steady-state read timeout restored once stream negotiation is
    /// past the stream-open exchange.
    #[serde(
        default = "StreamTimeouts::default_read_timeout",
        with = "humantime_serde"
    )]
    pub read_timeout: Duration,
}

impl Default for StreamTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            stream_open_timeout: Self::default_stream_open_timeout(),
            features_timeout: Self::default_features_timeout(),
            starttls_timeout: Self::default_starttls_timeout(),
            auth_timeout: Self::default_auth_timeout(),
            dialback_timeout: Self::default_dialback_timeout(),
            read_timeout: Self::default_read_timeout(),
        }
    }
}

impl StreamTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_stream_open_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_features_timeout() -> Duration {
        Duration::from_secs(30)
    }
    fn default_starttls_timeout() -> Duration {
        Duration::from_secs(30)
    }
    fn default_auth_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_dialback_timeout() -> Duration {
        Duration::from_secs(120)
    }
    fn default_read_timeout() -> Duration {
        Duration::from_secs(120)
    }

    pub fn short_timeouts() -> Self {
        let short = Duration::from_secs(5);
        Self {
            connect_timeout: short,
            stream_open_timeout: short,
            features_timeout: short,
            starttls_timeout: short,
            auth_timeout: short,
            dialback_timeout: short,
            read_timeout: short,
        }
    }
}

/// The attributes we care about from the peer's `<stream:stream>`
/// response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub version: Option<(u8, u8)>,
}

impl StreamHeader {
    pub fn from_element(element: &Element) -> Self {
        Self {
            id: element.attr("id").map(|v| v.to_string()),
            from: element.attr("from").map(|v| v.to_string()),
            version: element.attr("version").and_then(decode_version),
        }
    }

    /// Whether the peer advertises XMPP 1.0 or later, which means a
    /// `<stream:features>` element follows.
    pub fn is_version_1(&self) -> bool {
        matches!(self.version, Some((major, _)) if major >= 1)
    }
}

/// Split a `version` attribute into major/minor. Absent or garbage
/// version attributes are treated as pre-1.0.
pub fn decode_version(version: &str) -> Option<(u8, u8)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
}

/// What the peer offered in its `<stream:features>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub sasl_mechanisms: Vec<String>,
    pub dialback: bool,
}

impl StreamFeatures {
    pub fn from_element(element: &Element) -> Self {
        let sasl_mechanisms = element
            .child("mechanisms")
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .filter(|child| child.local_name() == "mechanism")
                    .map(|child| child.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            starttls: element.child("starttls").is_some(),
            sasl_mechanisms,
            dialback: element.child("dialback").is_some(),
        }
    }

    pub fn offers_external(&self) -> bool {
        self.sasl_mechanisms.iter().any(|m| m == "EXTERNAL")
    }
}
