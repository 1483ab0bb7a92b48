//! Builds the ordered turn list for a completion call.

use regex::Regex;
use relay_policy::{Role, Scope};
use relay_providers::ChatMessage;

/// History is kept only for elevated principals talking in private.
pub fn keeps_history(role: Role, scope: Scope) -> bool {
    role == Role::Elevated && scope.is_private()
}

pub struct ContextAssembler {
    mention: Option<Regex>,
}

impl ContextAssembler {
    pub fn new(bot_username: &str) -> Self {
        let handle = bot_username.trim().trim_start_matches('@');
        let mention = if handle.is_empty() {
            None
        } else {
            Regex::new(&format!(r"(?i)\s*@?{}\b", regex::escape(handle))).ok()
        };
        Self { mention }
    }

    pub fn strip_mention(&self, text: &str) -> String {
        match &self.mention {
            Some(re) => re.replace_all(text, "").trim().to_string(),
            None => text.trim().to_string(),
        }
    }

    /// Order: replied-to bot message (group only), then history (elevated
    /// private only), then the stripped input exactly once.
    pub fn assemble(
        &self,
        scope: Scope,
        role: Role,
        reply_parent: Option<&str>,
        history: &[ChatMessage],
        raw_input: &str,
    ) -> Vec<ChatMessage> {
        let mut turns = Vec::with_capacity(history.len() + 2);

        if !scope.is_private() {
            if let Some(parent) = reply_parent.map(str::trim).filter(|p| !p.is_empty()) {
                turns.push(ChatMessage::user(parent));
            }
        }

        if keeps_history(role, scope) {
            turns.extend(history.iter().cloned());
        }

        turns.push(ChatMessage::user(self.strip_mention(raw_input)));
        turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_providers::Role as TurnRole;

    const GROUP: Scope = Scope::Group { chat_id: -1001 };
    const PRIVATE: Scope = Scope::Private { principal: 42 };

    fn assembler() -> ContextAssembler {
        ContextAssembler::new("AssistBot")
    }

    #[test]
    fn strips_handle_in_any_case_and_trims() {
        let a = assembler();
        assert_eq!(a.strip_mention("@assistbot what is rust?"), "what is rust?");
        assert_eq!(a.strip_mention("  tell me @ASSISTBOT  "), "tell me");
        assert_eq!(a.strip_mention("hey @AssistBot, thanks"), "hey, thanks");
        assert_eq!(a.strip_mention("@assistbotter stays"), "@assistbotter stays");
    }

    #[test]
    fn group_reply_to_bot_prepends_parent_text() {
        let turns = assembler().assemble(
            GROUP,
            Role::Regular,
            Some("Earlier answer"),
            &[ChatMessage::user("ignored history")],
            "@AssistBot and why?",
        );
        assert_eq!(
            turns,
            vec![
                ChatMessage::user("Earlier answer"),
                ChatMessage::user("and why?"),
            ]
        );
    }

    #[test]
    fn blank_parent_text_is_not_injected() {
        let turns = assembler().assemble(GROUP, Role::Elevated, Some("   "), &[], "hi");
        assert_eq!(turns, vec![ChatMessage::user("hi")]);
    }

    #[test]
    fn elevated_private_gets_history_before_input() {
        let history = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("Hi there!"),
        ];
        let turns = assembler().assemble(
            PRIVATE,
            Role::Elevated,
            Some("parent"),
            &history,
            "how are you",
        );
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0], history[0]);
        assert_eq!(turns[1], history[1]);
        assert_eq!(turns[2].role, TurnRole::User);
        assert_eq!(turns[2].content, "how are you");
    }

    #[test]
    fn regular_principals_are_stateless() {
        let history = vec![ChatMessage::user("old")];
        let turns = assembler().assemble(PRIVATE, Role::Regular, None, &history, "new");
        assert_eq!(turns, vec![ChatMessage::user("new")]);
        assert!(!keeps_history(Role::Elevated, GROUP));
        assert!(keeps_history(Role::Elevated, PRIVATE));
    }
}
