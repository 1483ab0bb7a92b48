//! Relay Policy
//!
//! Authorization gate: decides per inbound message whether the bot answers,
//! and in which conversation scope

use relay_config::TelegramConfig;
use relay_ipc::InboundEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Regular,
    Elevated,
}

/// Conversation scope of an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Private { principal: i64 },
    Group { chat_id: i64 },
}

impl Scope {
    pub fn id(&self) -> i64 {
        match self {
            Scope::Private { principal } => *principal,
            Scope::Group { chat_id } => *chat_id,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Scope::Private { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
    #[error("malformed event: {0}")]
    MalformedEvent(&'static str),
    #[error("not authorized")]
    NotAuthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow {
        principal: i64,
        role: Role,
        scope: Scope,
    },
    Deny(DenyReason),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AccessGate {
    elevated: HashSet<i64>,
    group_chat_id: Option<i64>,
    bot_username: String,
}

impl AccessGate {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_parts(
            config.admin_set(),
            config.group_chat_id,
            config.bot_username().unwrap_or_default(),
        )
    }

    pub fn with_parts(
        elevated: HashSet<i64>,
        group_chat_id: Option<i64>,
        bot_username: impl Into<String>,
    ) -> Self {
        let bot_username = bot_username
            .into()
            .trim()
            .trim_start_matches('@')
            .to_lowercase();
        Self {
            elevated,
            group_chat_id,
            bot_username,
        }
    }

    pub fn bot_username(&self) -> &str {
        &self.bot_username
    }

    pub fn role_of(&self, principal: i64) -> Role {
        if self.elevated.contains(&principal) {
            Role::Elevated
        } else {
            Role::Regular
        }
    }

    /// Case-insensitive handle match anywhere in the text.
    pub fn is_mentioned(&self, text: &str) -> bool {
        !self.bot_username.is_empty() && text.to_lowercase().contains(&self.bot_username)
    }

    /// The message replies to something the bot itself wrote.
    pub fn is_reply_to_bot(&self, event: &InboundEvent) -> bool {
        if self.bot_username.is_empty() {
            return false;
        }
        event
            .reply_to
            .as_ref()
            .and_then(|reply| reply.author.as_ref())
            .and_then(|author| author.username.as_deref())
            .is_some_and(|username| {
                username.trim_start_matches('@').to_lowercase() == self.bot_username
            })
    }

    /// First matching rule wins: elevated principal in private chat, then
    /// mention or reply-to-bot in the designated group. Everything else,
    /// including events missing sender or chat, is denied.
    pub fn evaluate(&self, event: &InboundEvent) -> GateDecision {
        let text = event.text_or_caption();
        info!(
            "[{}] - {} - {} - {}",
            event
                .sender_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "?".to_string()),
            event
                .chat_id()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "?".to_string()),
            event
                .chat
                .as_ref()
                .map(|chat| chat.kind.as_str())
                .unwrap_or("?"),
            text
        );

        let decision = self.decide(event, text);
        if let GateDecision::Deny(reason) = &decision {
            debug!(trace_id = %event.trace_id, "Gate denied message: {}", reason);
        }
        decision
    }

    fn decide(&self, event: &InboundEvent, text: &str) -> GateDecision {
        let Some(sender) = event.sender.as_ref() else {
            return GateDecision::Deny(DenyReason::MalformedEvent("missing sender"));
        };
        let Some(chat) = event.chat.as_ref() else {
            return GateDecision::Deny(DenyReason::MalformedEvent("missing chat"));
        };
        let role = self.role_of(sender.id);

        if chat.kind == relay_ipc::ChatKind::Private {
            if role == Role::Elevated {
                return GateDecision::Allow {
                    principal: sender.id,
                    role,
                    scope: Scope::Private {
                        principal: sender.id,
                    },
                };
            }
            return GateDecision::Deny(DenyReason::NotAuthorized);
        }

        let is_designated_group =
            chat.kind.is_group() && self.group_chat_id.is_some_and(|id| id == chat.id);
        if is_designated_group && (self.is_mentioned(text) || self.is_reply_to_bot(event)) {
            return GateDecision::Allow {
                principal: sender.id,
                role,
                scope: Scope::Group { chat_id: chat.id },
            };
        }

        GateDecision::Deny(DenyReason::NotAuthorized)
    }

    pub fn is_allowed(&self, event: &InboundEvent) -> bool {
        self.evaluate(event).is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_ipc::{ChatKind, ReplyRef, Sender};

    const ADMIN: i64 = 1091;
    const REGULAR: i64 = 555;
    const GROUP: i64 = -1001785;

    fn gate() -> AccessGate {
        AccessGate::with_parts([ADMIN].into_iter().collect(), Some(GROUP), "@AssistBot")
    }

    fn sender(id: i64) -> Sender {
        Sender {
            id,
            username: Some(format!("user{}", id)),
            is_bot: false,
        }
    }

    fn private(id: i64, text: &str) -> InboundEvent {
        InboundEvent::new("telegram")
            .with_sender(sender(id))
            .with_chat(id, ChatKind::Private)
            .with_text(text)
    }

    fn group(chat_id: i64, from: i64, text: &str) -> InboundEvent {
        InboundEvent::new("telegram")
            .with_sender(sender(from))
            .with_chat(chat_id, ChatKind::Supergroup)
            .with_text(text)
    }

    fn reply_from(username: &str) -> ReplyRef {
        ReplyRef {
            message_id: 7,
            author: Some(Sender {
                id: 999,
                username: Some(username.to_string()),
                is_bot: true,
            }),
            text: Some("earlier answer".to_string()),
        }
    }

    #[test]
    fn elevated_private_allowed_regardless_of_text() {
        for text in ["", "hello", "/model", "no mention at all"] {
            let decision = gate().evaluate(&private(ADMIN, text));
            assert_eq!(
                decision,
                GateDecision::Allow {
                    principal: ADMIN,
                    role: Role::Elevated,
                    scope: Scope::Private { principal: ADMIN },
                }
            );
        }
    }

    #[test]
    fn regular_private_denied() {
        assert!(!gate().is_allowed(&private(REGULAR, "hi @AssistBot")));
    }

    #[test]
    fn group_mention_is_case_insensitive() {
        assert!(gate().is_allowed(&group(GROUP, REGULAR, "hey @assistbot what's up")));
        assert!(gate().is_allowed(&group(GROUP, REGULAR, "ASSISTBOT?")));
    }

    #[test]
    fn group_without_mention_or_reply_denied() {
        assert_eq!(
            gate().evaluate(&group(GROUP, REGULAR, "hello")),
            GateDecision::Deny(DenyReason::NotAuthorized)
        );
    }

    #[test]
    fn group_caption_mention_allowed() {
        let event = InboundEvent::new("telegram")
            .with_sender(sender(REGULAR))
            .with_chat(GROUP, ChatKind::Group)
            .with_caption("photo for @AssistBot");
        assert!(gate().is_allowed(&event));
    }

    #[test]
    fn group_reply_to_bot_allowed_without_mention() {
        let event = group(GROUP, REGULAR, "and then?").with_reply_to(reply_from("AssistBot"));
        assert_eq!(
            gate().evaluate(&event),
            GateDecision::Allow {
                principal: REGULAR,
                role: Role::Regular,
                scope: Scope::Group { chat_id: GROUP },
            }
        );
    }

    #[test]
    fn group_reply_to_someone_else_denied() {
        let event = group(GROUP, REGULAR, "and then?").with_reply_to(reply_from("OtherBot"));
        assert!(!gate().is_allowed(&event));
    }

    #[test]
    fn other_group_denied_even_with_mention() {
        assert!(!gate().is_allowed(&group(-42, ADMIN, "@AssistBot hello")));
        let reply = group(-42, REGULAR, "x").with_reply_to(reply_from("AssistBot"));
        assert!(!gate().is_allowed(&reply));
    }

    #[test]
    fn elevated_in_group_keeps_role() {
        let decision = gate().evaluate(&group(GROUP, ADMIN, "@AssistBot status"));
        assert!(matches!(
            decision,
            GateDecision::Allow {
                role: Role::Elevated,
                scope: Scope::Group { .. },
                ..
            }
        ));
    }

    #[test]
    fn missing_fields_deny_instead_of_panicking() {
        let no_sender = InboundEvent::new("telegram")
            .with_chat(ADMIN, ChatKind::Private)
            .with_text("hi");
        assert_eq!(
            gate().evaluate(&no_sender),
            GateDecision::Deny(DenyReason::MalformedEvent("missing sender"))
        );

        let no_chat = InboundEvent::new("telegram")
            .with_sender(sender(ADMIN))
            .with_text("hi");
        assert_eq!(
            gate().evaluate(&no_chat),
            GateDecision::Deny(DenyReason::MalformedEvent("missing chat"))
        );

        let reply_without_author = group(GROUP, REGULAR, "x").with_reply_to(ReplyRef {
            message_id: 1,
            author: None,
            text: None,
        });
        assert!(!gate().is_allowed(&reply_without_author));
    }

    #[test]
    fn channel_posts_in_designated_chat_denied() {
        let event = InboundEvent::new("telegram")
            .with_sender(sender(REGULAR))
            .with_chat(GROUP, ChatKind::Channel)
            .with_text("@AssistBot");
        assert!(!gate().is_allowed(&event));
    }
}
