use crate::client_types::*;
use crate::parser::{extract_item, StreamItem};
use crate::tls::TlsOptions;
use crate::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use stanza::{Element, XmlError};
use std::fmt::Write;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};

const READ_CHUNK: usize = 8192;
const MAX_ELEMENT_LEN: usize = 256 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Malformed XML from peer: {0}")]
    Xml(#[from] XmlError),
    #[error("Unexpected stream content: {0}")]
    MalformedElement(String),
    #[error("Element from peer is too long")]
    ElementTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Timed Out waiting {duration:?} for {phase}")]
    TimeOutResponse {
        phase: &'static str,
        duration: Duration,
    },
    #[error("Timed Out writing after {duration:?}")]
    TimeOutRequest { duration: Duration },
    #[error("Error {error} reading {phase}")]
    ReadError { phase: &'static str, error: String },
    #[error("Error {error} writing")]
    WriteError { error: String },
    #[error("Error {error} flushing send buffer")]
    FlushError { error: String },
    #[error("{0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("Invalid client certificate configured: {error}")]
    InvalidClientCertificate { error: String },
    #[error("STARTTLS was refused: {0}")]
    StartTlsRefused(String),
    #[error("TLS handshake failed: {error}")]
    TlsHandshake {
        error: String,
        /// The peer answered our TLS records with what looks like a
        /// plaintext XMPP stream; callers may retry without TLS.
        plaintext: bool,
        /// The failure was certificate validation, as opposed to a
        /// protocol or transport problem.
        certificate: bool,
    },
    #[error("SASL EXTERNAL failed: {0}")]
    SaslFailure(String),
    #[error("Stream error from peer: {0}")]
    StreamError(String),
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TlsInformation {
    pub cipher: String,
    pub protocol_version: String,
}

/// Initiator side of an XMPP server-to-server stream: a buffered
/// transport that yields one stream item at a time and drives the
/// negotiation exchanges (stream open, STARTTLS, SASL EXTERNAL, dialback
/// results).
///
/// Any read or write failure takes the socket, so a client that has seen
/// an error cannot accidentally be reused.
#[derive(Debug)]
pub struct StreamClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    read_buffer: Vec<u8>,
    timeouts: StreamTimeouts,
    peer_certs: Vec<CertificateDer<'static>>,
    encrypted: bool,
}

impl StreamClient {
    pub async fn connect(
        addr: SocketAddr,
        hostname: &str,
        timeouts: StreamTimeouts,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        // No need for Nagle with the small negotiation exchanges
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, hostname, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        hostname: impl Into<String>,
        timeouts: StreamTimeouts,
    ) -> Self {
        Self::with_boxed_stream(Box::new(stream), hostname, timeouts)
    }

    pub fn with_boxed_stream(
        stream: BoxedAsyncReadAndWrite,
        hostname: impl Into<String>,
        timeouts: StreamTimeouts,
    ) -> Self {
        Self {
            socket: Some(stream),
            hostname: hostname.into(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
            peer_certs: Vec::new(),
            encrypted: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn timeouts(&self) -> &StreamTimeouts {
        &self.timeouts
    }

    /// The certificate chain the peer presented during the TLS
    /// handshake, if any.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certs
    }

    async fn fill_read_buffer(
        &mut self,
        remaining: Duration,
        phase: &'static str,
    ) -> Result<(), ClientError> {
        let mut data = [0u8; READ_CHUNK];
        let size = match self.socket.as_mut() {
            Some(socket) => match timeout(remaining, socket.read(&mut data)).await {
                Ok(Ok(size)) => size,
                Ok(Err(err)) => {
                    self.socket.take();
                    return Err(ClientError::ReadError {
                        phase,
                        error: format!("{err:#}"),
                    });
                }
                Err(_) => {
                    self.socket.take();
                    return Err(ClientError::TimeOutResponse {
                        phase,
                        duration: remaining,
                    });
                }
            },
            None => return Err(ClientError::NotConnected),
        };
        if size == 0 {
            self.socket.take();
            return Err(ClientError::ReadError {
                phase,
                error: "connection closed by peer".to_string(),
            });
        }
        self.read_buffer.extend_from_slice(&data[0..size]);
        Ok(())
    }

    async fn read_item(
        &mut self,
        phase: &'static str,
        timeout_duration: Duration,
    ) -> Result<StreamItem, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout_duration;
        loop {
            if let Some((item, used)) = extract_item(&self.read_buffer)? {
                self.read_buffer.drain(0..used);
                tracing::trace!("recv<-{}: {item:?}", self.hostname);
                return Ok(item);
            }
            if self.read_buffer.len() > MAX_ELEMENT_LEN {
                self.socket.take();
                return Err(ClientError::ElementTooLong);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.socket.take();
                return Err(ClientError::TimeOutResponse {
                    phase,
                    duration: timeout_duration,
                });
            }
            self.fill_read_buffer(remaining, phase).await?;
        }
    }

    /// Await the peer's `<stream:stream>` response.
    pub async fn read_stream_header(
        &mut self,
        timeout_duration: Duration,
    ) -> Result<StreamHeader, ClientError> {
        match self.read_item("stream header", timeout_duration).await? {
            StreamItem::StreamOpen(element) => Ok(StreamHeader::from_element(&element)),
            StreamItem::StreamClose => Err(ClientError::ReadError {
                phase: "stream header",
                error: "peer closed the stream".to_string(),
            }),
            StreamItem::Element(element) => Err(ClientError::MalformedElement(format!(
                "expected a stream header, got <{}>",
                element.name()
            ))),
        }
    }

    /// Read one complete top-level element. Peer stream errors surface as
    /// [`ClientError::StreamError`].
    pub async fn read_element(
        &mut self,
        phase: &'static str,
        timeout_duration: Duration,
    ) -> Result<Element, ClientError> {
        match self.read_item(phase, timeout_duration).await? {
            StreamItem::Element(element) => {
                if element.name() == "stream:error" {
                    self.socket.take();
                    return Err(ClientError::StreamError(element.to_xml()));
                }
                Ok(element)
            }
            StreamItem::StreamClose => {
                self.socket.take();
                Err(ClientError::ReadError {
                    phase,
                    error: "peer closed the stream".to_string(),
                })
            }
            StreamItem::StreamOpen(element) => Err(ClientError::MalformedElement(format!(
                "unexpected stream header <{}>",
                element.name()
            ))),
        }
    }

    pub async fn read_stream_features(
        &mut self,
        timeout_duration: Duration,
    ) -> Result<StreamFeatures, ClientError> {
        let element = self.read_element("stream features", timeout_duration).await?;
        if element.local_name() != "features" {
            return Err(ClientError::MalformedElement(format!(
                "expected <stream:features>, got <{}>",
                element.name()
            )));
        }
        Ok(StreamFeatures::from_element(&element))
    }

    async fn write_all_with_timeout(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let timeout_duration = self.timeouts.read_timeout;
        match self.socket.as_mut() {
            Some(socket) => match timeout(timeout_duration, socket.write_all(bytes)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(ClientError::WriteError {
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    self.socket.take();
                    Err(ClientError::TimeOutRequest {
                        duration: timeout_duration,
                    })
                }
            },
            None => Err(ClientError::NotConnected),
        }
    }

    async fn flush(&mut self) -> Result<(), ClientError> {
        match self.socket.as_mut() {
            Some(socket) => match timeout(self.timeouts.read_timeout, socket.flush()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    self.socket.take();
                    Err(ClientError::FlushError {
                        error: format!("{err:#}"),
                    })
                }
                Err(_) => {
                    self.socket.take();
                    Err(ClientError::FlushError {
                        error: "timed out".to_string(),
                    })
                }
            },
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn deliver_raw_text(&mut self, text: &str) -> Result<(), ClientError> {
        tracing::trace!("send->{}: {text}", self.hostname);
        self.write_all_with_timeout(text.as_bytes()).await?;
        self.flush().await
    }

    /// The stream header this server sends, per RFC 6120 section 4.7 plus
    /// the dialback namespace declaration of XEP-0220.
    pub fn stream_header(
        local: &str,
        remote: &str,
        advertise_dialback: bool,
        version_1: bool,
    ) -> String {
        let mut header = String::with_capacity(256);
        header.push_str("<stream:stream");
        if advertise_dialback {
            header.push_str(" xmlns:db=\"jabber:server:dialback\"");
        }
        header.push_str(" xmlns:stream=\"http://etherx.jabber.org/streams\"");
        header.push_str(" xmlns=\"jabber:server\"");
        let _ = write!(header, " from=\"{local}\"");
        let _ = write!(header, " to=\"{remote}\"");
        if version_1 {
            header.push_str(" version=\"1.0\"");
        }
        header.push('>');
        header
    }

    pub async fn open_stream(
        &mut self,
        local: &str,
        remote: &str,
        advertise_dialback: bool,
    ) -> Result<(), ClientError> {
        self.deliver_raw_text(&Self::stream_header(local, remote, advertise_dialback, true))
            .await
    }

    /// Stream open without a version attribute: the pre-XMPP-1.0 form
    /// used for the plain dialback fallback.
    pub async fn open_legacy_stream(&mut self, local: &str, remote: &str) -> Result<(), ClientError> {
        self.deliver_raw_text(&Self::stream_header(local, remote, true, false))
            .await
    }

    /// Send `<starttls/>`, await `<proceed/>` and negotiate TLS over the
    /// existing stream.
    pub async fn starttls(&mut self, options: &TlsOptions) -> Result<TlsInformation, ClientError> {
        self.deliver_raw_text("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await?;
        let element = self
            .read_element("STARTTLS proceed", self.timeouts.starttls_timeout)
            .await?;
        if element.local_name() != "proceed" {
            return Err(ClientError::StartTlsRefused(element.to_xml()));
        }
        self.tls_handshake(options, false).await
    }

    /// Negotiate TLS immediately on the raw socket (direct TLS).
    pub async fn direct_tls(&mut self, options: &TlsOptions) -> Result<TlsInformation, ClientError> {
        self.tls_handshake(options, true).await
    }

    async fn tls_handshake(
        &mut self,
        options: &TlsOptions,
        direct: bool,
    ) -> Result<TlsInformation, ClientError> {
        let connector = options
            .build_tls_connector()
            .map_err(|error| ClientError::InvalidClientCertificate { error })?;
        let server_name = match IpAddr::from_str(self.hostname.as_str()) {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(self.hostname.clone())
                .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?,
        };
        let stream = self.socket.take().ok_or(ClientError::NotConnected)?;
        // Anything still buffered belongs to the superseded plaintext
        // stream and must not leak into the new one.
        self.read_buffer.clear();

        match timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, stream),
        )
        .await
        {
            Err(_) => Err(ClientError::TimeOutResponse {
                phase: "TLS handshake",
                duration: self.timeouts.starttls_timeout,
            }),
            Ok(Err(err)) => {
                let (plaintext, certificate) = classify_tls_failure(&err, direct);
                Err(ClientError::TlsHandshake {
                    error: format!("{err:#}"),
                    plaintext,
                    certificate,
                })
            }
            Ok(Ok(tls_stream)) => {
                let mut info = TlsInformation::default();
                {
                    let (_, conn) = tls_stream.get_ref();
                    info.cipher = match conn.negotiated_cipher_suite() {
                        Some(suite) => suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
                        None => String::new(),
                    };
                    info.protocol_version = match conn.protocol_version() {
                        Some(version) => version.as_str().unwrap_or("UNKNOWN").to_string(),
                        None => String::new(),
                    };
                    self.peer_certs = conn
                        .peer_certificates()
                        .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                        .unwrap_or_default();
                }
                tracing::trace!("{}: TLS established {info:?}", self.hostname);
                self.socket.replace(Box::new(tls_stream));
                self.encrypted = true;
                Ok(info)
            }
        }
    }

    /// SASL EXTERNAL with the local domain as authorization identity
    /// (RFC 6120 section 6, XEP-0178).
    pub async fn sasl_external(&mut self, authzid: &str) -> Result<(), ClientError> {
        let payload = data_encoding::BASE64.encode(authzid.as_bytes());
        self.deliver_raw_text(&format!(
            "<auth xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\" mechanism=\"EXTERNAL\">{payload}</auth>"
        ))
        .await?;
        let element = self
            .read_element("SASL response", self.timeouts.auth_timeout)
            .await?;
        if element.local_name() == "success" {
            Ok(())
        } else {
            Err(ClientError::SaslFailure(element.to_xml()))
        }
    }

    pub async fn send_dialback_result(
        &mut self,
        local: &str,
        remote: &str,
        key: &str,
    ) -> Result<(), ClientError> {
        let result = Element::new("db:result")
            .with_attr("from", local)
            .with_attr("to", remote)
            .with_text(key);
        self.deliver_raw_text(&result.to_xml()).await
    }

    /// Await the peer's verdict on a previously sent `<db:result>`.
    /// Unrelated elements arriving in the meantime are skipped.
    pub async fn read_dialback_result(
        &mut self,
        local: &str,
        remote: &str,
    ) -> Result<bool, ClientError> {
        let timeout_duration = self.timeouts.dialback_timeout;
        let deadline = tokio::time::Instant::now() + timeout_duration;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.socket.take();
                return Err(ClientError::TimeOutResponse {
                    phase: "dialback result",
                    duration: timeout_duration,
                });
            }
            let element = self.read_element("dialback result", remaining).await?;
            if is_dialback_result(&element) {
                // The peer speaks from its own perspective, so from/to
                // are mirrored relative to the result we sent.
                let from_ok = element
                    .attr("from")
                    .is_none_or(|v| v.eq_ignore_ascii_case(remote));
                let to_ok = element
                    .attr("to")
                    .is_none_or(|v| v.eq_ignore_ascii_case(local));
                if from_ok && to_ok {
                    return Ok(element.attr("type") == Some("valid"));
                }
            }
            tracing::trace!(
                "{}: ignoring <{}> while waiting for dialback result",
                self.hostname,
                element.name()
            );
        }
    }

    /// Orderly close: send the stream close tag and shut the socket down.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = timeout(CLOSE_TIMEOUT, async {
                let _ = socket.write_all(b"</stream:stream>").await;
                let _ = socket.flush().await;
                let _ = socket.shutdown().await;
            })
            .await;
        }
    }

    pub async fn close_with_stream_error(&mut self, condition: &str, text: &str) {
        let mut error = Element::new("stream:error").with_child(
            Element::new(condition).with_attr("xmlns", "urn:ietf:params:xml:ns:xmpp-streams"),
        );
        if !text.is_empty() {
            error = error.with_child(
                Element::new("text")
                    .with_attr("xmlns", "urn:ietf:params:xml:ns:xmpp-streams")
                    .with_text(text),
            );
        }
        let _ = self.deliver_raw_text(&error.to_xml()).await;
        self.close().await;
    }

    /// Drop the socket without sending `</stream>` or any other data, as
    /// RFC 6120 section 5.4.3.2 prescribes after a failed TLS
    /// negotiation.
    pub fn force_close(&mut self) {
        self.socket.take();
    }
}

fn is_dialback_result(element: &Element) -> bool {
    element.name() == "db:result"
        || (element.local_name() == "result"
            && element.attr("xmlns") == Some("jabber:server:dialback"))
}

fn classify_tls_failure(err: &std::io::Error, direct: bool) -> (bool, bool) {
    use tokio_rustls::rustls::Error as RustlsError;
    let Some(rustls_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<RustlsError>())
    else {
        return (false, false);
    };
    match rustls_err {
        // The peer responded with something that is not TLS framing. On a
        // connection we opened in direct TLS mode the likely cause is a
        // plaintext XMPP listener on the advertised port.
        RustlsError::InvalidMessage(_) => (direct, false),
        RustlsError::InvalidCertificate(_) => (false, true),
        _ => (false, false),
    }
}
