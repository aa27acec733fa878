use crate::element::Element;
use crate::jid::Jid;

/// Stanza-level error conditions emitted by this server
/// (RFC 6120 section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    RemoteServerNotFound,
    RemoteServerTimeout,
    ServiceUnavailable,
    NotAuthorized,
}

impl ErrorCondition {
    pub fn element_name(&self) -> &'static str {
        match self {
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ServiceUnavailable => "service-unavailable",
            Self::NotAuthorized => "not-authorized",
        }
    }

    fn to_element(self) -> Element {
        Element::new("error").with_attr("type", "cancel").with_child(
            Element::new(self.element_name())
                .with_attr("xmlns", "urn:ietf:params:xml:ns:xmpp-stanzas"),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

impl IqKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub from: Jid,
    pub to: Jid,
    pub kind: IqKind,
    pub payload: Option<Element>,
    pub error: Option<ErrorCondition>,
}

impl Iq {
    /// A request expects a reply; results and errors must never be
    /// answered (RFC 6120 section 8.2.3).
    pub fn is_request(&self) -> bool {
        matches!(self.kind, IqKind::Get | IqKind::Set)
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Chat => "chat",
            Self::Groupchat => "groupchat",
            Self::Headline => "headline",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub from: Jid,
    pub to: Jid,
    pub kind: MessageKind,
    pub thread: Option<String>,
    pub body: Option<String>,
    pub error: Option<ErrorCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceKind {
    #[default]
    Available,
    Unavailable,
    Probe,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Error,
}

impl PresenceKind {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::Unavailable => Some("unavailable"),
            Self::Probe => Some("probe"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
            Self::Error => Some("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub id: String,
    pub from: Jid,
    pub to: Jid,
    pub kind: PresenceKind,
    pub error: Option<ErrorCondition>,
}

/// The three stanza kinds routed between servers. Only the fields the
/// server itself inspects are modeled; arbitrary payloads ride along as
/// element trees.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
}

impl Stanza {
    pub fn id(&self) -> &str {
        match self {
            Self::Iq(iq) => &iq.id,
            Self::Message(message) => &message.id,
            Self::Presence(presence) => &presence.id,
        }
    }

    pub fn from(&self) -> &Jid {
        match self {
            Self::Iq(iq) => &iq.from,
            Self::Message(message) => &message.from,
            Self::Presence(presence) => &presence.from,
        }
    }

    pub fn to(&self) -> &Jid {
        match self {
            Self::Iq(iq) => &iq.to,
            Self::Message(message) => &message.to,
            Self::Presence(presence) => &presence.to,
        }
    }

    pub fn has_error(&self) -> bool {
        match self {
            Self::Iq(iq) => iq.error.is_some(),
            Self::Message(message) => message.error.is_some(),
            Self::Presence(presence) => presence.error.is_some(),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Self::Iq(iq) => {
                let mut el = Element::new("iq")
                    .with_attr("from", iq.from.to_string())
                    .with_attr("to", iq.to.to_string())
                    .with_attr("type", iq.kind.as_str());
                if !iq.id.is_empty() {
                    el.set_attr("id", iq.id.as_str());
                }
                if let Some(payload) = &iq.payload {
                    el = el.with_child(payload.clone());
                }
                if let Some(error) = iq.error {
                    el = el.with_child(error.to_element());
                }
                el
            }
            Self::Message(message) => {
                let mut el = Element::new("message")
                    .with_attr("from", message.from.to_string())
                    .with_attr("to", message.to.to_string());
                if message.kind != MessageKind::Normal {
                    el.set_attr("type", message.kind.as_str());
                }
                if !message.id.is_empty() {
                    el.set_attr("id", message.id.as_str());
                }
                if let Some(thread) = &message.thread {
                    el = el.with_child(Element::new("thread").with_text(thread.as_str()));
                }
                if let Some(body) = &message.body {
                    el = el.with_child(Element::new("body").with_text(body.as_str()));
                }
                if let Some(error) = message.error {
                    el = el.with_child(error.to_element());
                }
                el
            }
            Self::Presence(presence) => {
                let mut el = Element::new("presence")
                    .with_attr("from", presence.from.to_string())
                    .with_attr("to", presence.to.to_string());
                if let Some(kind) = presence.kind.as_str() {
                    el.set_attr("type", kind);
                }
                if !presence.id.is_empty() {
                    el.set_attr("id", presence.id.as_str());
                }
                if let Some(error) = presence.error {
                    el = el.with_child(error.to_element());
                }
                el
            }
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }
}
