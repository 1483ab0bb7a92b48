//! Slash-command parsing and the fixed reply texts.

use relay_policy::Role;
use relay_providers::{BillingError, CreditGrants};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Model(Option<String>),
    Quota,
    Reset,
    Search(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Command(Command),
    /// `/cmd@otherbot`: meant for someone else.
    Foreign,
    /// Plain text, or a command this bot does not know.
    Text,
}

/// Accepts `/cmd`, `/cmd args` and `/cmd@botname args`.
pub fn parse(text: &str, bot_username: &str) -> Parsed {
    let text = text.trim();
    let Some(rest) = text.strip_prefix('/') else {
        return Parsed::Text;
    };
    let (token, args) = match rest.split_once(char::is_whitespace) {
        Some((token, args)) => (token, args.trim()),
        None => (rest, ""),
    };
    let (name, addressee) = match token.split_once('@') {
        Some((name, addressee)) => (name, Some(addressee)),
        None => (token, None),
    };
    if let Some(addressee) = addressee {
        if !addressee.eq_ignore_ascii_case(bot_username.trim_start_matches('@')) {
            return Parsed::Foreign;
        }
    }

    let command = match name.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "model" => Command::Model(args.split_whitespace().next().map(str::to_string)),
        "quota" => Command::Quota,
        "reset" => Command::Reset,
        "search" => Command::Search(args.to_string()),
        _ => return Parsed::Text,
    };
    Parsed::Command(command)
}

pub const MODEL_DENIED: &str = "🚫 You are not allowed to change the model.";
pub const QUOTA_DENIED: &str = "🚫 You are not allowed to view the quota.";
pub const HISTORY_CLEARED: &str = "🧹 History cleared.";
pub const RESET_PRIVATE_ONLY: &str = "/reset only works in a private chat.";
pub const SEARCH_USAGE: &str = "Usage: /search <query>";
pub const SEARCH_DISABLED: &str = "🔍 Web search is not configured.";
pub const EMPTY_TRANSCRIPT: &str = "I could not recognise any speech in that voice message.";
pub const UNSUPPORTED_ATTACHMENT: &str = "❌ Sorry, I can't process files, images or attachments yet.";

pub fn help_text(role: Role) -> String {
    let mut lines = vec![
        "Available commands:",
        "/start - greeting",
        "/help - this list",
        "/reset - clear our conversation history (private chat)",
        "/search <query> - search the web and summarise the results",
    ];
    if role == Role::Elevated {
        lines.push("/model [name] - show or switch the language model");
        lines.push("/quota - show the OpenAI API balance");
    }
    lines.join("\n")
}

pub fn start_text(role: Role) -> String {
    format!(
        "👋 Hi! Send me a message or a voice note and I'll answer it.\n\n{}",
        help_text(role)
    )
}

pub fn current_model_text(model: &str) -> String {
    format!(
        "Current model: {}\nUsage: /model gpt-4o or /model gpt-3.5-turbo",
        model
    )
}

pub fn model_set_text(model: &str) -> String {
    format!("✅ Model set: {}", model)
}

pub fn quota_text(result: Result<CreditGrants, BillingError>) -> String {
    match result {
        Ok(grants) => format!(
            "💰 OpenAI API balance:\n- Granted: ${:.2}\n- Used: ${:.2}\n- Available: ${:.2}",
            grants.total_granted, grants.total_used, grants.total_available
        ),
        Err(BillingError::Http { status, body }) => {
            format!("Could not fetch quota (HTTP {}): {}", status, body)
        }
        Err(err) => format!("Error fetching quota: {}: {}", err.kind(), err),
    }
}

pub fn voice_reply_text(transcript: &str, answer: &str) -> String {
    format!("🗣️ You said: {}\n\n🤖 {}", transcript, answer)
}
