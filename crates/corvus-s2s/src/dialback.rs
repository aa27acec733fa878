use crate::domain_pair::DomainPair;
use crate::interfaces::SocketProvider;
use hmac::{Hmac, Mac};
use rfc6120::{ClientError, StreamClient, StreamTimeouts};
use sha2::{Digest, Sha256};

/// Derive the dialback key for a stream, per the XEP-0185 recommendation:
/// hex(HMAC-SHA256(SHA256(secret), receiving ' ' originating ' ' id)).
/// Keys are deterministic for a given stream so the authoritative server
/// can re-derive them without shared state.
pub fn dialback_key(secret: &str, pair: &DomainPair, stream_id: &str) -> String {
    let hmac_key = Sha256::digest(secret.as_bytes());
    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key.as_slice())
        .expect("HMAC accepts keys of any length");
    mac.update(pair.remote().as_bytes());
    mac.update(b" ");
    mac.update(pair.local().as_bytes());
    mac.update(b" ");
    mac.update(stream_id.as_bytes());
    data_encoding::HEXLOWER.encode(mac.finalize().into_bytes().as_slice())
}

/// Run the initiator side of a dialback exchange over an already open
/// stream: send `<db:result>` carrying our key and await the peer's
/// verdict. The peer performs the authoritative verification out of band
/// over a connection it opens back to us.
pub async fn authenticate_over_stream(
    client: &mut StreamClient,
    pair: &DomainPair,
    stream_id: &str,
    secret: &str,
) -> Result<bool, ClientError> {
    let key = dialback_key(secret, pair, stream_id);
    client
        .send_dialback_result(pair.local(), pair.remote(), &key)
        .await?;
    client.read_dialback_result(pair.local(), pair.remote()).await
}

/// Pre-XMPP-1.0 dialback over a fresh plain connection: open a legacy
/// stream (no version attribute), take the stream id the peer assigns,
/// and run the `<db:result>` exchange. Returns the authenticated client
/// together with the peer's stream id.
pub async fn plain_session(
    sockets: &dyn SocketProvider,
    pair: &DomainPair,
    port: u16,
    timeouts: StreamTimeouts,
    secret: &str,
) -> Option<(StreamClient, String)> {
    let socket = sockets.connect(pair.remote(), port).await?;
    if socket.direct_tls {
        tracing::debug!(
            "{pair}: discovered endpoint {} only speaks direct TLS, \
             which the plain dialback fallback cannot use",
            socket.addr
        );
        return None;
    }

    let mut client = StreamClient::with_boxed_stream(socket.stream, pair.remote(), timeouts);

    let outcome: Result<Option<String>, ClientError> = async {
        client.open_legacy_stream(pair.local(), pair.remote()).await?;
        let header = client
            .read_stream_header(timeouts.stream_open_timeout)
            .await?;
        let Some(stream_id) = header.id else {
            tracing::debug!("{pair}: peer assigned no stream id, dialback is impossible");
            return Ok(None);
        };
        if authenticate_over_stream(&mut client, pair, &stream_id, secret).await? {
            Ok(Some(stream_id))
        } else {
            Ok(None)
        }
    }
    .await;

    match outcome {
        Ok(Some(stream_id)) => Some((client, stream_id)),
        Ok(None) => {
            client.close().await;
            None
        }
        Err(err) => {
            tracing::debug!("{pair}: plain dialback fallback failed: {err:#}");
            client.close().await;
            None
        }
    }
}
