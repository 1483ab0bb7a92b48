//! Relay Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! message chunking, and voice file downloads

use anyhow::{anyhow, Result};
use relay_config::TelegramConfig;
use relay_ipc::{
    Attachment, ChatKind, EventBus, InboundEvent, MediaSource, OutboundMessage, ReplyRef,
    ReplySink, Sender,
};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const BOT_COMMANDS: &[(&str, &str)] = &[
    ("start", "Greeting and command list"),
    ("help", "Show help"),
    ("model", "Show or set the model (admins)"),
    ("quota", "Show API balance (admins)"),
    ("reset", "Clear conversation history"),
    ("search", "Search the web and summarise"),
];
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramFileRef>>,
    #[serde(default)]
    pub document: Option<TelegramFileRef>,
    #[serde(default)]
    pub video: Option<TelegramFileRef>,
    #[serde(default)]
    pub audio: Option<TelegramFileRef>,
    #[serde(default)]
    pub voice: Option<TelegramVoice>,
    #[serde(default)]
    pub chat: Option<TelegramChat>,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramReplyToMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramFileRef {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramVoice {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramReplyToMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

impl From<&TelegramUser> for Sender {
    fn from(user: &TelegramUser) -> Self {
        Sender {
            id: user.id,
            username: user.username.clone(),
            is_bot: user.is_bot.unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize)]
struct OutgoingText<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    file_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            client: Self::build_client()?,
            bot_token: config.bot_token.clone(),
            api_url: format!("{}/bot{}", TELEGRAM_API_BASE, config.bot_token),
            file_url: format!("{}/file/bot{}", TELEGRAM_API_BASE, config.bot_token),
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs,
            client_recreate_interval_secs: config.client_recreate_interval_secs.max(1),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Result<Client> {
        Ok(ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()?)
    }

    fn offset_path(&self) -> PathBuf {
        let bot_id = relay_config::telegram_account_tag(&self.bot_token);
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", bot_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        let content = fs::read_to_string(self.offset_path()).await.ok()?;
        content.trim().parse().ok()
    }

    async fn write_offset(&self, offset: i64) {
        let path = self.offset_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                debug!("Failed to create runtime dir {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = fs::write(&path, format!("{}\n", offset)).await {
            debug!("Failed to persist offset to {}: {}", path.display(), e);
        }
    }

    /// Raw update objects; decoding happens per update so one malformed
    /// update does not poison the batch.
    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<serde_json::Value>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;

        if !parsed.ok {
            return Err(anyhow!(
                "telegram getUpdates returned ok=false: {}",
                parsed.description.unwrap_or_default()
            ));
        }

        Ok(parsed.result.unwrap_or_default())
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_url);

        for (i, chunk) in Self::chunk_message(text).iter().enumerate() {
            let payload = OutgoingText {
                chat_id,
                text: chunk,
                parse_mode: Some("Markdown"),
                reply_to_message_id: reply_to.filter(|_| i == 0),
            };
            self.deliver_text(&url, payload).await?;
        }

        Ok(())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let url = format!("{}/sendChatAction", self.api_url);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        self.client.post(&url).json(&payload).send().await?;
        Ok(())
    }

    async fn post_checked(&self, url: &str, payload: &impl Serialize) -> Result<(), String> {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, body));
        }
        match serde_json::from_str::<ApiResponse<serde_json::Value>>(&body) {
            Ok(parsed) if parsed.ok => Ok(()),
            Ok(parsed) => Err(format!(
                "ok=false: {}",
                parsed.description.unwrap_or_default()
            )),
            Err(e) => Err(format!("decode failed: {}", e)),
        }
    }

    /// Markdown first, then plain text, then plain text without the reply
    /// reference when Telegram says the replied-to message is gone.
    async fn deliver_text(&self, url: &str, mut payload: OutgoingText<'_>) -> Result<()> {
        let err = match self.post_checked(url, &payload).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!("telegram sendMessage rejected Markdown, resending as plain text: {}", err);

        payload.parse_mode = None;
        let err = match self.post_checked(url, &payload).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !Self::is_reply_target_missing(&err) || payload.reply_to_message_id.take().is_none() {
            return Err(anyhow!("telegram sendMessage failed: {}", err));
        }
        warn!("telegram sendMessage reply target is gone, resending without reply_to_message_id");
        self.post_checked(url, &payload)
            .await
            .map_err(|e| anyhow!("telegram sendMessage failed without reply target: {}", e))
    }

    fn is_reply_target_missing(body: &str) -> bool {
        body.to_ascii_lowercase()
            .contains("message to be replied not found")
    }

    fn chunk_message(text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

            if end < chars.len() {
                if let Some(split) = (start..end)
                    .rev()
                    .find(|&i| matches!(chars[i], '\n' | ' ' | '.' | '!' | '?'))
                {
                    end = split + 1;
                }
            }

            chunks.push(chars[start..end].iter().collect::<String>());
            start = end;
        }

        chunks
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands().await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                debug!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client()?;
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for raw in updates {
                let Some(update_id) = raw.get("update_id").and_then(|v| v.as_i64()) else {
                    warn!("Skipping Telegram update without update_id");
                    continue;
                };
                offset = Some(update_id + 1);
                self.write_offset(update_id + 1).await;

                match serde_json::from_value::<TelegramUpdate>(raw) {
                    Ok(update) => {
                        if let Some(message) = &update.message {
                            self.handle_message(message);
                        }
                    }
                    Err(err) => warn!("Skipping malformed Telegram update {}: {}", update_id, err),
                }
            }
        }
    }

    async fn sync_bot_commands(&self) -> Result<()> {
        let url = format!("{}/setMyCommands", self.api_url);
        let commands: Vec<_> = BOT_COMMANDS
            .iter()
            .map(|(command, description)| {
                serde_json::json!({ "command": command, "description": description })
            })
            .collect();
        self.post_checked(&url, &serde_json::json!({ "commands": commands }))
            .await
            .map_err(|e| anyhow!("telegram setMyCommands {}", e))
    }

    fn handle_message(&self, message: &TelegramMessage) {
        let Some(event) = Self::to_inbound_event(message) else {
            debug!(
                "Ignoring Telegram message {} without text, caption or media",
                message.message_id
            );
            return;
        };

        if let Some(event_bus) = &self.event_bus {
            if let Err(e) = event_bus.publish(event) {
                warn!("Failed to publish message to event bus: {}", e);
            }
        } else {
            info!("No event bus configured, message not forwarded");
        }
    }

    /// Maps a Telegram message onto the channel-neutral event. Messages with
    /// nothing to answer (service messages, stickers) yield `None`.
    pub fn to_inbound_event(message: &TelegramMessage) -> Option<InboundEvent> {
        let attachment = Self::attachment_of(message);
        let has_text = message.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || message.caption.as_deref().is_some_and(|t| !t.trim().is_empty());
        if !has_text && attachment.is_none() {
            return None;
        }

        let mut event = InboundEvent::new("telegram").with_message_id(message.message_id);
        if let Some(user) = &message.from {
            event = event.with_sender(Sender::from(user));
        }
        if let Some(chat) = &message.chat {
            event = event.with_chat(chat.id, ChatKind::parse(&chat.chat_type));
        }
        if let Some(text) = &message.text {
            event = event.with_text(text.clone());
        }
        if let Some(caption) = &message.caption {
            event = event.with_caption(caption.clone());
        }
        if let Some(parent) = &message.reply_to_message {
            event = event.with_reply_to(ReplyRef {
                message_id: parent.message_id,
                author: parent.from.as_ref().map(Sender::from),
                text: parent.text.clone().or_else(|| parent.caption.clone()),
            });
        }
        if let Some(attachment) = attachment {
            event = event.with_attachment(attachment);
        }
        Some(event)
    }

    fn attachment_of(message: &TelegramMessage) -> Option<Attachment> {
        if let Some(voice) = &message.voice {
            return Some(Attachment::Voice {
                file_id: voice.file_id.clone(),
                mime_type: voice.mime_type.clone(),
                duration: voice.duration,
            });
        }
        let media = if message.photo.as_ref().is_some_and(|p| !p.is_empty()) {
            "photo"
        } else if message.document.is_some() {
            "document"
        } else if message.video.is_some() {
            "video"
        } else if message.audio.is_some() {
            "audio"
        } else {
            return None;
        };
        Some(Attachment::Unsupported {
            media: media.to_string(),
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let get_file_url = format!("{}/getFile", self.api_url);
        let resp = self
            .client
            .post(&get_file_url)
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| anyhow!("telegram getFile request failed: {}", e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("telegram getFile failed with HTTP {}", status.as_u16());
        }

        let parsed: ApiResponse<TelegramFile> = serde_json::from_str(&body).map_err(|e| {
            anyhow!(
                "telegram getFile decode failed: {} | body={}",
                e,
                body.chars().take(400).collect::<String>()
            )
        })?;
        if !parsed.ok {
            anyhow::bail!(
                "telegram getFile returned ok=false: {}",
                parsed
                    .description
                    .unwrap_or_else(|| "unknown getFile error".to_string())
            );
        }
        let file_path = parsed
            .result
            .and_then(|file| file.file_path)
            .ok_or_else(|| anyhow!("telegram getFile missing file_path"))?;

        let download_url = format!("{}/{}", self.file_url, file_path);
        let download = self
            .client
            .get(&download_url)
            .timeout(Duration::from_secs(45))
            .send()
            .await?;
        if !download.status().is_success() {
            anyhow::bail!(
                "telegram file download failed with HTTP {}",
                download.status().as_u16()
            );
        }
        Ok(download.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl ReplySink for TelegramAdapter {
    async fn deliver(&self, message: OutboundMessage) -> Result<()> {
        if let Some(action) = &message.chat_action {
            return self.send_chat_action(message.chat_id, action).await;
        }
        self.send_message(message.chat_id, &message.text, message.reply_to)
            .await
    }
}

#[async_trait::async_trait]
impl MediaSource for TelegramAdapter {
    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.download_file(file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::{OutgoingText, TelegramAdapter, TelegramMessage, TelegramUpdate};
    use relay_config::TelegramConfig;
    use relay_ipc::{Attachment, ChatKind};

    fn make_adapter(data_dir: std::path::PathBuf) -> TelegramAdapter {
        let config = TelegramConfig {
            bot_token: "123456:TESTTOKEN".to_string(),
            ..TelegramConfig::default()
        };
        TelegramAdapter::new(&config, data_dir).expect("adapter")
    }

    fn message(json: serde_json::Value) -> TelegramMessage {
        serde_json::from_value(json).expect("valid message")
    }

    #[test]
    fn chunk_message_preserves_content_for_unicode_text() {
        let text = format!("{} {}", "😀".repeat(5000), "fine");
        let chunks = TelegramAdapter::chunk_message(&text);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_message_respects_telegram_limit_by_characters() {
        let text = "abc😀".repeat(1500);
        let chunks = TelegramAdapter::chunk_message(&text);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 4096));
    }

    #[test]
    fn chunk_message_prefers_sentence_boundaries() {
        let sentence = "word ".repeat(900);
        let text = format!("{}.{}", sentence, "x".repeat(200));
        let chunks = TelegramAdapter::chunk_message(&text);
        assert!(chunks[0].ends_with(' ') || chunks[0].ends_with('.'));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn outgoing_text_omits_unset_fields() {
        let payload = OutgoingText {
            chat_id: 123,
            text: "hello",
            parse_mode: None,
            reply_to_message_id: None,
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value, serde_json::json!({ "chat_id": 123, "text": "hello" }));

        let payload = OutgoingText {
            parse_mode: Some("Markdown"),
            reply_to_message_id: Some(42),
            ..payload
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["parse_mode"], "Markdown");
        assert_eq!(value["reply_to_message_id"], 42);
    }

    #[test]
    fn detect_missing_reply_target_error() {
        let body = r#"HTTP 400: {"ok":false,"error_code":400,"description":"Bad Request: message to be replied not found"}"#;
        assert!(TelegramAdapter::is_reply_target_missing(body));
    }

    #[test]
    fn group_reply_maps_author_and_parent_text() {
        let msg = message(serde_json::json!({
            "message_id": 10,
            "text": "and then?",
            "chat": { "id": -1001, "type": "supergroup" },
            "from": { "id": 5, "is_bot": false, "username": "alice" },
            "reply_to_message": {
                "message_id": 9,
                "from": { "id": 77, "is_bot": true, "username": "AssistBot" },
                "text": "The answer is 42."
            }
        }));
        let event = TelegramAdapter::to_inbound_event(&msg).expect("event");
        assert_eq!(event.sender_id(), Some(5));
        assert_eq!(event.chat.as_ref().map(|c| c.kind), Some(ChatKind::Supergroup));
        let reply = event.reply_to.expect("reply");
        assert_eq!(reply.text.as_deref(), Some("The answer is 42."));
        let author = reply.author.expect("author");
        assert!(author.is_bot);
        assert_eq!(author.username.as_deref(), Some("AssistBot"));
    }

    #[test]
    fn voice_and_media_become_attachments() {
        let voice = message(serde_json::json!({
            "message_id": 1,
            "chat": { "id": 5, "type": "private" },
            "from": { "id": 5 },
            "voice": { "file_id": "v1", "mime_type": "audio/ogg", "duration": 4 }
        }));
        let event = TelegramAdapter::to_inbound_event(&voice).expect("event");
        assert!(matches!(
            event.attachment,
            Some(Attachment::Voice { ref file_id, .. }) if file_id == "v1"
        ));

        let photo = message(serde_json::json!({
            "message_id": 2,
            "chat": { "id": 5, "type": "private" },
            "from": { "id": 5 },
            "photo": [ { "file_id": "p1" } ]
        }));
        let event = TelegramAdapter::to_inbound_event(&photo).expect("event");
        assert_eq!(
            event.attachment,
            Some(Attachment::Unsupported {
                media: "photo".to_string()
            })
        );
    }

    #[test]
    fn service_messages_are_skipped() {
        let msg = message(serde_json::json!({
            "message_id": 3,
            "chat": { "id": -1001, "type": "group" }
        }));
        assert!(TelegramAdapter::to_inbound_event(&msg).is_none());
    }

    #[test]
    fn update_without_chat_or_sender_still_decodes() {
        let update: TelegramUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 100,
            "message": { "message_id": 4, "text": "orphan" }
        }))
        .expect("decode");
        let event = TelegramAdapter::to_inbound_event(&update.message.expect("message"))
            .expect("event");
        assert!(event.chat.is_none());
        assert!(event.sender.is_none());
    }

    #[tokio::test]
    async fn offset_roundtrips_through_runtime_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = make_adapter(dir.path().to_path_buf());
        assert_eq!(adapter.read_offset().await, None);

        adapter.write_offset(4242).await;

        assert_eq!(adapter.read_offset().await, Some(4242));
        assert!(dir
            .path()
            .join("runtime")
            .join("telegram.123456.offset")
            .exists());
    }
}
