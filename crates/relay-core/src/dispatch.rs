//! Sends replies and records the assistant turn once delivery succeeded.

use crate::error::{user_facing, RelayError};
use crate::session::Session;
use anyhow::Result;
use relay_ipc::{OutboundMessage, ReplySink};
use relay_providers::ChatMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// Where a reply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub chat_id: i64,
    pub reply_to: Option<i64>,
}

/// Keeps sending the "typing" action until dropped.
pub struct TypingHeartbeat {
    stop: Arc<AtomicBool>,
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    sink: Arc<dyn ReplySink>,
    session: Arc<Session>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn ReplySink>, session: Arc<Session>) -> Self {
        Self { sink, session }
    }

    pub async fn send(&self, target: ReplyTarget, text: &str) -> Result<()> {
        self.sink
            .deliver(OutboundMessage::text(target.chat_id, text, target.reply_to))
            .await
            .map_err(|e| RelayError::Dispatch(format!("{:#}", e)))?;
        Ok(())
    }

    /// Sends `text`; when `remember` names a principal, the answer is
    /// appended to that principal's history only after a successful send.
    pub async fn respond(
        &self,
        target: ReplyTarget,
        text: &str,
        remember: Option<(i64, &str)>,
    ) -> Result<()> {
        self.send(target, text).await?;
        if let Some((principal, answer)) = remember {
            self.session
                .append_turn(principal, ChatMessage::assistant(answer))
                .await;
        }
        Ok(())
    }

    /// Last-resort reply for a failed pipeline. A failure here is only logged.
    pub async fn send_error(&self, target: ReplyTarget, err: &anyhow::Error) {
        let text = user_facing(err);
        if let Err(send_err) = self.send(target, &text).await {
            error!(
                "Failed to deliver error reply to chat {}: {} (original error: {})",
                target.chat_id, send_err, err
            );
        }
    }

    pub fn start_typing(&self, chat_id: i64) -> TypingHeartbeat {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let sink = Arc::clone(&self.sink);

        tokio::spawn(async move {
            while !stop_flag.load(Ordering::Relaxed) {
                if let Err(e) = sink.deliver(OutboundMessage::action(chat_id, "typing")).await {
                    warn!("Failed to send typing action to chat {}: {}", chat_id, e);
                }
                tokio::time::sleep(TYPING_INTERVAL).await;
            }
        });

        TypingHeartbeat { stop }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        fail_text: bool,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait::async_trait]
    impl ReplySink for RecordingSink {
        async fn deliver(&self, message: OutboundMessage) -> Result<()> {
            if self.fail_text && message.chat_action.is_none() {
                return Err(anyhow!("telegram sendMessage HTTP 403: bot was blocked"));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn setup(fail_text: bool) -> (Dispatcher, Arc<RecordingSink>, Arc<Session>) {
        let sink = Arc::new(RecordingSink {
            fail_text,
            ..RecordingSink::default()
        });
        let session = Arc::new(Session::new("gpt-4o", 5).expect("session"));
        (Dispatcher::new(sink.clone(), session.clone()), sink, session)
    }

    const TARGET: ReplyTarget = ReplyTarget {
        chat_id: 42,
        reply_to: Some(7),
    };

    #[tokio::test]
    async fn successful_send_records_assistant_turn() {
        let (dispatcher, sink, session) = setup(false);
        dispatcher
            .respond(TARGET, "🗣️ You said: hi\n\n🤖 Hello!", Some((42, "Hello!")))
            .await
            .expect("respond");

        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_to, Some(7));
        assert_eq!(session.history(42).await, vec![ChatMessage::assistant("Hello!")]);
    }

    #[tokio::test]
    async fn failed_send_leaves_history_untouched() {
        let (dispatcher, _, session) = setup(true);
        let err = dispatcher
            .respond(TARGET, "answer", Some((42, "answer")))
            .await
            .expect_err("dispatch fails");
        assert!(user_facing(&err).starts_with("❌ DispatchError: "));
        assert!(session.history(42).await.is_empty());
    }

    #[tokio::test]
    async fn error_reply_is_formatted() {
        let (dispatcher, sink, _) = setup(false);
        let err: anyhow::Error = RelayError::upstream("openai", anyhow!("rate limited")).into();
        dispatcher.send_error(TARGET, &err).await;
        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent[0].text, "❌ UpstreamError: openai: rate limited");
    }

    #[tokio::test]
    async fn typing_heartbeat_sends_action_until_dropped() {
        let (dispatcher, sink, _) = setup(false);
        let heartbeat = dispatcher.start_typing(42);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(heartbeat);

        let sent = sink.sent.lock().unwrap().clone();
        assert!(!sent.is_empty());
        assert!(sent
            .iter()
            .all(|m| m.chat_action.as_deref() == Some("typing") && m.chat_id == 42));
    }
}
