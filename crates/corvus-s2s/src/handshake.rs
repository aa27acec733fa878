//! The initiator-side establishment state machine: connect (optionally
//! with direct TLS), open the stream, inspect features, then work down
//! the preference ladder of STARTTLS + SASL EXTERNAL, dialback over TLS,
//! inline dialback, and finally pre-XMPP-1.0 dialback over a fresh plain
//! connection.

use crate::authenticate::S2sEngine;
use crate::config::TlsPolicy;
use crate::dialback;
use crate::domain_pair::DomainPair;
use crate::session::{AuthenticationMethod, OutgoingSession};
use rfc6120::{ClientError, StreamClient, StreamFeatures, TlsOptions};
use std::net::SocketAddr;
use std::sync::Arc;

const TLS_MANDATORY_TEXT: &str = "TLS is mandatory, but was not established.";

/// What a successful negotiation produced; the session itself is only
/// materialized once the transport can be moved into it.
#[derive(Debug)]
struct SessionParts {
    stream_id: String,
    method: AuthenticationMethod,
}

#[derive(Debug)]
enum HandshakeError {
    /// TLS policy is `Required` but could not be satisfied. The stream
    /// is closed with a `not-authorized` stream error and no fallback is
    /// attempted.
    TlsPolicyViolation,
    /// The peer's certificate failed strict validation; no fallback.
    CertificateRejected,
    Client(ClientError),
}

impl From<ClientError> for HandshakeError {
    fn from(err: ClientError) -> Self {
        Self::Client(err)
    }
}

/// Establish a new outgoing session to `pair.remote()`. Returns the
/// authenticated, unregistered session, or None; every failure path
/// closes whatever transport it opened and nothing is registered here.
pub(crate) async fn create_outgoing_session(
    engine: &S2sEngine,
    pair: &DomainPair,
    port: u16,
) -> Option<Arc<OutgoingSession>> {
    tracing::debug!("{pair}: creating a connection to a host of the remote domain");
    let Some(socket) = engine.sockets.connect(pair.remote(), port).await else {
        tracing::info!(
            "{pair}: unable to create a new session: no applicable remote host accepted a connection"
        );
        return None;
    };
    let addr = socket.addr;
    let mut direct_tls = socket.direct_tls;
    tracing::debug!(
        "{pair}: opened a new connection to {addr}{}",
        if direct_tls { " using direct TLS" } else { "" }
    );
    let mut client =
        StreamClient::with_boxed_stream(socket.stream, pair.remote(), engine.config.timeouts);

    match negotiate(engine, pair, &mut client, &mut direct_tls, addr).await {
        Ok(Some(parts)) => {
            tracing::debug!("{pair}: successfully created new session");
            return Some(build_session(engine, pair, client, parts));
        }
        Ok(None) => {
            if engine.config.tls == TlsPolicy::Required {
                tracing::debug!("{pair}: no TLS was established yet TLS is mandatory");
                client
                    .close_with_stream_error("not-authorized", TLS_MANDATORY_TEXT)
                    .await;
                return None;
            }
            tracing::debug!("{pair}: in-band negotiation exhausted, closing the connection");
            client.close().await;
        }
        Err(HandshakeError::TlsPolicyViolation) => {
            client
                .close_with_stream_error("not-authorized", TLS_MANDATORY_TEXT)
                .await;
            return None;
        }
        Err(HandshakeError::CertificateRejected) => {
            tracing::warn!(
                "{pair}: aborting: TLS certificate validation failed and strict validation is enabled"
            );
            client.force_close();
            return None;
        }
        Err(HandshakeError::Client(err @ ClientError::TlsHandshake { .. })) => {
            // RFC 6120 section 5.4.3.2: the socket is closed without
            // sending <failure/> or </stream>.
            tracing::info!("{pair}: TLS negotiation failed, closing the connection: {err:#}");
            client.force_close();
            if engine.config.tls == TlsPolicy::Required {
                return None;
            }
            if let ClientError::TlsHandshake {
                certificate: true, ..
            } = &err
            {
                if engine.config.strict_certificate_validation {
                    tracing::warn!(
                        "{pair}: aborting: certificate-related TLS failure and strict validation is enabled"
                    );
                    return None;
                }
            }
        }
        Err(HandshakeError::Client(err)) => {
            tracing::warn!("{pair}: an error occurred while negotiating the session: {err:#}");
            client.close().await;
            if engine.config.tls == TlsPolicy::Required {
                return None;
            }
        }
    }

    // Step down to server dialback over a fresh plain connection.
    if !engine.config.dialback_enabled {
        tracing::warn!(
            "{pair}: unable to create a new session: exhausted all options \
             (server dialback is disabled by configuration)"
        );
        return None;
    }
    tracing::debug!("{pair}: trying server dialback over a plain connection as a fallback");
    match dialback::plain_session(
        engine.sockets.as_ref(),
        pair,
        port,
        engine.config.timeouts,
        &engine.dialback_secret,
    )
    .await
    {
        Some((client, stream_id)) => {
            tracing::debug!("{pair}: successfully created new session using the dialback fallback");
            Some(build_session(
                engine,
                pair,
                client,
                SessionParts {
                    stream_id,
                    method: AuthenticationMethod::Dialback,
                },
            ))
        }
        None => {
            tracing::warn!("{pair}: unable to create a new session: dialback fallback failed");
            None
        }
    }
}

async fn negotiate(
    engine: &S2sEngine,
    pair: &DomainPair,
    client: &mut StreamClient,
    direct_tls: &mut bool,
    addr: SocketAddr,
) -> Result<Option<SessionParts>, HandshakeError> {
    if *direct_tls {
        match client.direct_tls(&engine.config.tls_options()).await {
            Ok(_info) => {}
            Err(ClientError::TlsHandshake {
                error,
                plaintext: true,
                ..
            }) if engine.config.plain_fallback_on_tls_plaintext => {
                tracing::warn!(
                    "{pair}: plaintext detected on a connection started in direct TLS mode \
                     ({error}); restarting the connection to {addr} without direct TLS"
                );
                let stream = engine
                    .sockets
                    .reconnect_plain(addr)
                    .await
                    .ok_or(ClientError::NotConnected)?;
                *client =
                    StreamClient::with_boxed_stream(stream, pair.remote(), engine.config.timeouts);
                *direct_tls = false;
            }
            Err(err) => return Err(err.into()),
        }
    }

    tracing::debug!("{pair}: sending the stream header and waiting for the response");
    client
        .open_stream(pair.local(), pair.remote(), engine.config.dialback_advertised())
        .await?;
    let header = client
        .read_stream_header(engine.config.timeouts.stream_open_timeout)
        .await?;
    tracing::debug!(
        "{pair}: got a response (stream id {:?}, version {:?})",
        header.id,
        header.version
    );
    if !header.is_version_1() {
        tracing::debug!("{pair}: the remote server is not XMPP 1.0 compliant");
        return Ok(None);
    }

    let features = client
        .read_stream_features(engine.config.timeouts.features_timeout)
        .await?;

    if *direct_tls {
        tracing::debug!("{pair}: connected with direct TLS; authenticating the connection");
        return authenticate(engine, pair, client, header.id, &features).await;
    }

    let use_tls = matches!(engine.config.tls, TlsPolicy::Optional | TlsPolicy::Required);
    if use_tls && features.starttls {
        tracing::debug!("{pair}: both sides support STARTTLS; encrypting and authenticating");
        return encrypt_and_authenticate(engine, pair, client).await;
    }
    if engine.config.tls == TlsPolicy::Required {
        tracing::debug!("{pair}: the peer offers no STARTTLS yet TLS is mandatory");
        return Err(HandshakeError::TlsPolicyViolation);
    }
    if engine.config.dialback_enabled && features.dialback {
        tracing::debug!("{pair}: both sides support dialback; authenticating with dialback");
        let Some(stream_id) = header.id else {
            tracing::debug!("{pair}: peer assigned no stream id, dialback is impossible");
            return Ok(None);
        };
        if dialback::authenticate_over_stream(client, pair, &stream_id, &engine.dialback_secret)
            .await?
        {
            return Ok(Some(SessionParts {
                stream_id,
                method: AuthenticationMethod::Dialback,
            }));
        }
        tracing::debug!("{pair}: unable to authenticate the connection with dialback");
        return Ok(None);
    }
    Ok(None)
}

/// STARTTLS, certificate policy, then the in-band authentication ladder
/// over the restarted stream.
async fn encrypt_and_authenticate(
    engine: &S2sEngine,
    pair: &DomainPair,
    client: &mut StreamClient,
) -> Result<Option<SessionParts>, HandshakeError> {
    let configured = engine.config.tls_options();

    // RFC 7590 section 3.4: for server-to-server links it is reasonable
    // to accept an encrypted but unauthenticated connection when
    // dialback keys will vouch for the peer. The handshake is run
    // tolerantly in that case and identity is checked afterwards, so a
    // failed check can still leave a usable encrypted stream.
    let rescue_possible =
        !engine.config.strict_certificate_validation && engine.config.dialback_advertised();
    let handshake_options = TlsOptions {
        insecure: configured.insecure || rescue_possible,
        ..configured.clone()
    };

    client.starttls(&handshake_options).await?;
    tracing::debug!("{pair}: TLS negotiation was successful; connection encrypted");

    let verified = configured.insecure
        || TlsOptions::verify_peer_identity(client.peer_certificates(), pair.remote());
    if !verified {
        if engine.config.strict_certificate_validation {
            return Err(HandshakeError::CertificateRejected);
        }
        if engine.config.dialback_advertised() {
            tracing::debug!(
                "{pair}: the peer's certificate did not verify; continuing encrypted but \
                 unauthenticated, dialback will have to vouch for it"
            );
        } else {
            tracing::warn!(
                "{pair}: unable to authenticate: the peer's certificate did not verify \
                 and dialback is not available"
            );
            return Ok(None);
        }
    }

    client
        .open_stream(pair.local(), pair.remote(), engine.config.dialback_advertised())
        .await?;
    let header = client
        .read_stream_header(engine.config.timeouts.stream_open_timeout)
        .await?;
    let features = client
        .read_stream_features(engine.config.timeouts.features_timeout)
        .await?;
    authenticate(engine, pair, client, header.id, &features).await
}

/// The in-band authentication ladder: SASL EXTERNAL first, dialback as
/// the fallback.
async fn authenticate(
    engine: &S2sEngine,
    pair: &DomainPair,
    client: &mut StreamClient,
    stream_id: Option<String>,
    features: &StreamFeatures,
) -> Result<Option<SessionParts>, HandshakeError> {
    tracing::debug!(
        "{pair}: remote server offers dialback: {}, EXTERNAL SASL: {}",
        features.dialback,
        features.offers_external()
    );

    if features.offers_external() {
        if let Some(parts) = attempt_sasl_external(engine, pair, client).await? {
            return Ok(Some(parts));
        }
    }

    // SASL unavailable or failed; dialback can still authenticate us.
    if engine.config.dialback_advertised() {
        if let Some(stream_id) = stream_id {
            tracing::debug!("{pair}: trying to authenticate with dialback");
            if dialback::authenticate_over_stream(client, pair, &stream_id, &engine.dialback_secret)
                .await?
            {
                tracing::debug!("{pair}: successfully authenticated with dialback");
                return Ok(Some(SessionParts {
                    stream_id,
                    method: AuthenticationMethod::Dialback,
                }));
            }
            tracing::debug!("{pair}: failed to authenticate with dialback");
        }
    } else {
        tracing::debug!("{pair}: skipping dialback, disabled by local configuration");
    }

    tracing::warn!("{pair}: unable to authenticate the connection: exhausted all options");
    Ok(None)
}

async fn attempt_sasl_external(
    engine: &S2sEngine,
    pair: &DomainPair,
    client: &mut StreamClient,
) -> Result<Option<SessionParts>, HandshakeError> {
    tracing::debug!("{pair}: trying to authenticate with EXTERNAL SASL");
    match client.sasl_external(pair.local()).await {
        Ok(()) => {}
        Err(ClientError::SaslFailure(response)) => {
            tracing::debug!("{pair}: failed to authenticate with EXTERNAL SASL: {response}");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    }

    // SASL was successful, so initiate a new stream and pick up the
    // fresh stream id the peer assigns to it.
    client
        .open_stream(pair.local(), pair.remote(), engine.config.dialback_advertised())
        .await?;
    let header = client
        .read_stream_header(engine.config.timeouts.stream_open_timeout)
        .await?;
    tracing::debug!("{pair}: successfully authenticated with EXTERNAL SASL");
    Ok(Some(SessionParts {
        stream_id: header.id.unwrap_or_default(),
        method: AuthenticationMethod::SaslExternal,
    }))
}

fn build_session(
    engine: &S2sEngine,
    pair: &DomainPair,
    client: StreamClient,
    parts: SessionParts,
) -> Arc<OutgoingSession> {
    let encrypted = client.is_encrypted();
    OutgoingSession::new(
        pair.local(),
        pair.remote(),
        parts.stream_id,
        client,
        parts.method,
        encrypted,
        engine.router.clone(),
        engine.registry.clone(),
        engine.dialback_secret.clone(),
    )
}
