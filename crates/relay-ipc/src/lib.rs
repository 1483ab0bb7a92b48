//! Relay IPC
//!
//! Inbound event model, event bus, and the outbound seams shared by the
//! chat adapter and the core runtime

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Unknown,
}

impl ChatKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "private" => Self::Private,
            "group" => Self::Group,
            "supergroup" => Self::Supergroup,
            "channel" => Self::Channel,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group | Self::Supergroup)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRef {
    pub id: i64,
    pub kind: ChatKind,
}

/// The message an inbound message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: i64,
    #[serde(default)]
    pub author: Option<Sender>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Voice {
        file_id: String,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        duration: Option<i64>,
    },
    Unsupported {
        media: String,
    },
}

/// A single inbound chat message. Every field the platform may omit is
/// optional so malformed updates still decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub id: String,
    pub channel: String,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub sender: Option<Sender>,
    #[serde(default)]
    pub chat: Option<ChatRef>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl InboundEvent {
    pub fn new(channel: &str) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            message_id: None,
            sender: None,
            chat: None,
            text: None,
            caption: None,
            reply_to: None,
            attachment: None,
        }
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_chat(mut self, id: i64, kind: ChatKind) -> Self {
        self.chat = Some(ChatRef { id, kind });
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: ReplyRef) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn sender_id(&self) -> Option<i64> {
        self.sender.as_ref().map(|s| s.id)
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.chat.as_ref().map(|c| c.id)
    }

    /// Non-empty message text, else caption, else empty.
    pub fn text_or_caption(&self) -> &str {
        self.text
            .as_deref()
            .filter(|text| !text.is_empty())
            .or(self.caption.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    pub chat_action: Option<String>,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, text: impl Into<String>, reply_to: Option<i64>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to,
            chat_action: None,
        }
    }

    pub fn action(chat_id: i64, action: &str) -> Self {
        Self {
            chat_id,
            text: String::new(),
            reply_to: None,
            chat_action: Some(action.to_string()),
        }
    }
}

/// Delivers replies back to the chat platform.
#[async_trait::async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, message: OutboundMessage) -> Result<()>;
}

/// Downloads files attached to inbound messages.
#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>>;
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<InboundEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inbound: inbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inbound.receiver_count()
    }

    pub fn publish(&self, event: InboundEvent) -> Result<()> {
        tracing::debug!(
            trace_id = %event.trace_id,
            channel = %event.channel,
            "Publishing inbound event"
        );
        self.inbound.send(event)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
