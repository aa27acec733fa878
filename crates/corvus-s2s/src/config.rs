use rfc6120::{StreamTimeouts, TlsOptions};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Do not try to use TLS, even when the peer offers STARTTLS.
    Disabled,
    /// Use STARTTLS if the peer offers it; otherwise continue in the
    /// clear (dialback permitting).
    #[default]
    Optional,
    /// TLS must be established or the attempt fails; the plain dialback
    /// fallback is never taken.
    Required,
}

/// Outgoing federation settings. Every field has a serde default so an
/// empty table deserializes to the stock configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct S2sConfig {
    /// Port used when the resolver does not dictate one
    /// (`xmpp.server.socket.remotePort` in the classic property scheme).
    #[serde(default = "S2sConfig::default_remote_port")]
    pub remote_port: u16,

    #[serde(default)]
    pub tls: TlsPolicy,

    /// Offer and accept server dialback (XEP-0220).
    #[serde(default = "S2sConfig::default_true")]
    pub dialback_enabled: bool,

    /// Allow dialback specifically to rescue peers presenting
    /// self-signed certificates, independent of `dialback_enabled`.
    #[serde(default)]
    pub dialback_for_selfsigned: bool,

    /// Verify peer certificate chains
    /// (`xmpp.server.tls.certificate.verify` / `chain.verify`).
    #[serde(default = "S2sConfig::default_true")]
    pub verify_certificates: bool,

    /// Permit self-signed peer certificates
    /// (`xmpp.server.tls.certificate.accept-selfsigned`).
    #[serde(default)]
    pub accept_selfsigned_certificates: bool,

    /// When the peer's certificate does not validate, abort instead of
    /// letting dialback rescue the encrypted-but-unauthenticated link
    /// (`xmpp.server.strictCertificateValidation`).
    #[serde(default = "S2sConfig::default_true")]
    pub strict_certificate_validation: bool,

    /// When a direct-TLS handshake runs into a plaintext peer, retry the
    /// same address without TLS
    /// (`xmpp.server.tls.on.plain.detection.allow.nondirecttls.fallback`).
    #[serde(default = "S2sConfig::default_true")]
    pub plain_fallback_on_tls_plaintext: bool,

    /// Client certificate presented during TLS, for SASL EXTERNAL.
    #[serde(default)]
    pub certificate_from_pem: Option<Vec<u8>>,
    #[serde(default)]
    pub private_key_from_pem: Option<Vec<u8>>,

    #[serde(flatten)]
    pub timeouts: StreamTimeouts,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            remote_port: Self::default_remote_port(),
            tls: TlsPolicy::default(),
            dialback_enabled: true,
            dialback_for_selfsigned: false,
            verify_certificates: true,
            accept_selfsigned_certificates: false,
            strict_certificate_validation: true,
            plain_fallback_on_tls_plaintext: true,
            certificate_from_pem: None,
            private_key_from_pem: None,
            timeouts: StreamTimeouts::default(),
        }
    }
}

impl S2sConfig {
    fn default_remote_port() -> u16 {
        5269
    }

    fn default_true() -> bool {
        true
    }

    /// Whether our stream headers declare the dialback namespace. The
    /// self-signed escape hatch advertises it even when dialback proper
    /// is off.
    pub fn dialback_advertised(&self) -> bool {
        self.dialback_enabled || self.dialback_for_selfsigned
    }

    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            insecure: !self.verify_certificates || self.accept_selfsigned_certificates,
            certificate_from_pem: self.certificate_from_pem.clone(),
            private_key_from_pem: self.private_key_from_pem.clone(),
        }
    }
}
