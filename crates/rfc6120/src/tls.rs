use std::sync::Arc;
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::crypto::aws_lc_rs as provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate chain verification during the handshake. Identity
    /// checking is always performed separately via
    /// [`TlsOptions::verify_peer_identity`], so an "insecure" handshake is
    /// how encrypted-but-unauthenticated dialback sessions come to be.
    pub insecure: bool,
    /// Client certificate presented to the peer, for SASL EXTERNAL.
    pub certificate_from_pem: Option<Vec<u8>>,
    pub private_key_from_pem: Option<Vec<u8>>,
}

impl TlsOptions {
    pub fn build_tls_connector(&self) -> Result<TlsConnector, String> {
        let provider = Arc::new(provider::default_provider());

        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
            .expect("inconsistent cipher-suite/versions selected");

        let config = if self.insecure {
            config
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                    provider.clone(),
                )))
        } else {
            config
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(
                    rustls_platform_verifier::Verifier::new().with_provider(provider),
                ))
        };

        let config = match (&self.certificate_from_pem, &self.private_key_from_pem) {
            (Some(cert_data), Some(key_data)) => {
                let certs = rustls_pemfile::certs(&mut cert_data.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| format!("invalid client certificate: {err:#}"))?;
                let key = rustls_pemfile::private_key(&mut key_data.as_slice())
                    .map_err(|err| format!("invalid client private key: {err:#}"))?
                    .ok_or_else(|| "no private key found in configured PEM data".to_string())?;
                config
                    .with_client_auth_cert(certs, key)
                    .map_err(|err| format!("client certificate rejected: {err:#}"))?
            }
            _ => config.with_no_client_auth(),
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Check the certificate chain captured during a (possibly tolerant)
    /// handshake against `domain`. The handshake itself accepts any
    /// chain when `insecure` is set; policy decisions about unverified
    /// peers are made by the caller from this result.
    pub fn verify_peer_identity(certs: &[CertificateDer<'static>], domain: &str) -> bool {
        let Ok(server_name) = ServerName::try_from(domain.to_string()) else {
            return false;
        };
        let Some((end_entity, intermediates)) = certs.split_first() else {
            return false;
        };
        let provider = Arc::new(provider::default_provider());
        let verifier = rustls_platform_verifier::Verifier::new().with_provider(provider);
        verifier
            .verify_server_cert(end_entity, intermediates, &server_name, &[], UnixTime::now())
            .is_ok()
    }
}

mod danger {
    use std::sync::Arc;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{
        verify_tls12_signature, verify_tls13_signature, CryptoProvider,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::DigitallySignedStruct;

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
