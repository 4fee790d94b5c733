//! Inbound messaging events.
//!
//! An [`InboundEvent`] is one message seen on the messaging channel, in
//! either direction. Incoming events may trigger a conversation turn;
//! outgoing ones are operator messages and only feed the handoff gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchboard_core::{EventId, Identity};

/// Channel name reported to the model.
pub const CHANNEL: &str = "whatsapp";

/// Language assumed when nothing better is known.
pub const DEFAULT_LANGUAGE: &str = "it";

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the end user.
    Incoming,
    /// Sent by a human operator (or by us) to the end user.
    Outgoing,
}

/// A business record the message is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReference {
    /// Record type, e.g. `Lead`.
    pub kind: String,
    /// Record name or key.
    pub name: String,
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Channel-assigned message id, when the channel supplies one.
    #[serde(default)]
    pub event_id: Option<EventId>,
    /// Sender address.
    pub from: Identity,
    /// Recipient address.
    #[serde(default)]
    pub to: Option<Identity>,
    /// Message direction.
    pub direction: Direction,
    /// Content type (`text`, `image`, `reaction`, ...).
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Message type as reported by the channel (`text`, `template`, ...).
    #[serde(default)]
    pub message_type: Option<String>,
    /// Message body.
    #[serde(default)]
    pub text: String,
    /// When the channel received the message, if it says.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Id of the message this one replies to.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Linked business record.
    #[serde(default)]
    pub reference: Option<RecordReference>,
    /// Attachment URL.
    #[serde(default)]
    pub attachment: Option<String>,
}

fn default_content_type() -> String {
    "text".to_string()
}

impl InboundEvent {
    /// Creates an incoming text event.
    #[must_use]
    pub fn incoming(from: Identity, text: impl Into<String>) -> Self {
        Self {
            event_id: None,
            from,
            to: None,
            direction: Direction::Incoming,
            content_type: default_content_type(),
            message_type: None,
            text: text.into(),
            timestamp: None,
            reply_to: None,
            reference: None,
            attachment: None,
        }
    }

    /// Creates an outgoing (operator) text event addressed to `to`.
    #[must_use]
    pub fn outgoing(from: Identity, to: Identity, text: impl Into<String>) -> Self {
        Self {
            to: Some(to),
            direction: Direction::Outgoing,
            ..Self::incoming(from, text)
        }
    }

    /// Sets the channel message id.
    #[must_use]
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Sets the channel timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Whether this event carries no primary content (reactions).
    #[must_use]
    pub fn is_reaction(&self) -> bool {
        self.content_type.trim().eq_ignore_ascii_case("reaction")
    }

    /// Whether this is a text message.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.content_type.trim().eq_ignore_ascii_case("text")
    }

    /// Builds the provider input for this event.
    ///
    /// Returns `None` for a text message with no text. Non-text messages
    /// without a caption become a `[non-text:<content_type>]` placeholder.
    /// The text is followed by an `[args]` block carrying the channel,
    /// message metadata and `language`.
    #[must_use]
    pub fn compose_input(&self, language: Option<&str>) -> Option<String> {
        let text = self.text.trim();
        let body = if !text.is_empty() {
            text.to_string()
        } else if self.is_text() {
            return None;
        } else {
            format!("[non-text:{}]", self.content_type.trim())
        };

        let args = json!({
            "reference": {
                "kind": self.reference.as_ref().map(|r| r.kind.as_str()),
                "name": self.reference.as_ref().map(|r| r.name.as_str()),
            },
            "channel": CHANNEL,
            "lang": language,
            "message": {
                "id": self.event_id.as_ref().map(EventId::as_str),
                "type": self.message_type,
                "content_type": self.content_type,
                "is_reply": self.reply_to.is_some(),
                "reply_to": self.reply_to,
                "attach": self.attachment,
            },
        });

        Some(format!("{body}\n\n[args]: {args}"))
    }
}

/// Best-effort keyword guess at the language of `text`.
///
/// Recognises Spanish, French, English and Italian greetings and courtesy
/// words; anything else is [`DEFAULT_LANGUAGE`].
#[must_use]
pub fn detect_language(text: &str) -> &'static str {
    const RULES: &[(&str, &[&str])] = &[
        ("es", &["hola", "gracias", "buenos", "por favor"]),
        ("fr", &["bonjour", "merci", "s'il vous plaît", "salut"]),
        ("en", &["hello", "thanks", "please", "hi", "the"]),
        ("it", &["ciao", "grazie", "per favore", "buongiorno"]),
    ];

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();

    RULES
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|keyword| {
                if keyword.contains(' ') {
                    lower.contains(keyword)
                } else {
                    words.contains(keyword)
                }
            })
        })
        .map_or(DEFAULT_LANGUAGE, |(language, _)| *language)
}
