use crate::interfaces::PacketRouter;
use crate::metrics;
use stanza::{ErrorCondition, Iq, IqKind, Message, MessageKind, Presence, PresenceKind, Stanza};
use std::sync::Arc;

/// Build the `remote-server-not-found` reply for a stanza that targeted
/// an unauthorized domain, or None when the rules forbid answering:
/// IQ results/errors are never answered, and error stanzas are never
/// answered with further errors.
pub fn bounce_reply(stanza: &Stanza) -> Option<Stanza> {
    match stanza {
        Stanza::Iq(iq) => {
            if iq.is_response() {
                tracing::debug!("not replying with an IQ error to an IQ response: {}", iq.id);
                return None;
            }
            Some(Stanza::Iq(Iq {
                id: iq.id.clone(),
                to: iq.from.clone(),
                from: iq.to.clone(),
                kind: IqKind::Error,
                payload: iq.payload.clone(),
                error: Some(ErrorCondition::RemoteServerNotFound),
            }))
        }
        Stanza::Presence(presence) => {
            if presence.kind == PresenceKind::Error {
                tracing::debug!("suppressing an error reply to a presence error");
                return None;
            }
            Some(Stanza::Presence(Presence {
                id: presence.id.clone(),
                to: presence.from.clone(),
                from: presence.to.clone(),
                kind: PresenceKind::Error,
                error: Some(ErrorCondition::RemoteServerNotFound),
            }))
        }
        Stanza::Message(message) => {
            if message.kind == MessageKind::Error {
                tracing::debug!("suppressing an error reply to a message error");
                return None;
            }
            Some(Stanza::Message(Message {
                id: message.id.clone(),
                to: message.from.clone(),
                from: message.to.clone(),
                kind: MessageKind::Error,
                thread: message.thread.clone(),
                body: None,
                error: Some(ErrorCondition::RemoteServerNotFound),
            }))
        }
    }
}

/// Bounce `stanza` back to its local sender without blocking the send
/// path: the reply is built and routed on a spawned task.
pub fn return_error_to_sender(stanza: Stanza, packets: Arc<dyn PacketRouter>) {
    tokio::spawn(async move {
        if stanza.has_error() {
            tracing::debug!("possible double bounce: {}", stanza.to_xml());
        }
        if let Some(reply) = bounce_reply(&stanza) {
            metrics::BOUNCES_GENERATED.inc();
            packets.route(reply);
        }
    });
}
