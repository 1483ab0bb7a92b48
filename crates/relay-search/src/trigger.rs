//! Strategies deciding whether a query needs live web data.

use relay_config::TriggerStrategy;
use relay_providers::{ChatMessage, ChatOptions, Provider};
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait::async_trait]
pub trait SearchTrigger: Send + Sync {
    fn name(&self) -> &'static str;
    /// Never fails: any error resolves to `false`.
    async fn should_search(&self, query: &str, model: &str) -> bool;
}

/// Asks the language model for a YES/NO verdict.
pub struct ModelTrigger {
    provider: Arc<dyn Provider>,
}

impl ModelTrigger {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    fn prompt(query: &str) -> String {
        format!(
            "Decide whether answering needs an internet search. Answer exactly 'YES' or 'NO'.\nQuery: {}",
            query
        )
    }

    fn is_affirmative(answer: &str) -> bool {
        answer.trim().eq_ignore_ascii_case("YES")
    }
}

#[async_trait::async_trait]
impl SearchTrigger for ModelTrigger {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn should_search(&self, query: &str, model: &str) -> bool {
        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: Some(3),
        };
        match self
            .provider
            .chat(model, vec![ChatMessage::user(Self::prompt(query))], &options)
            .await
        {
            Ok(response) => {
                let verdict = Self::is_affirmative(response.text());
                info!(
                    "Search trigger verdict for '{}': {}",
                    query,
                    if verdict { "search" } else { "direct" }
                );
                verdict
            }
            Err(err) => {
                warn!("Search trigger call failed, answering without search: {}", err);
                false
            }
        }
    }
}

/// Fires when the query contains one of the configured keywords.
pub struct KeywordTrigger {
    keywords: Vec<String>,
}

impl KeywordTrigger {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    fn matches(&self, query: &str) -> bool {
        let lowered = query.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

#[async_trait::async_trait]
impl SearchTrigger for KeywordTrigger {
    fn name(&self) -> &'static str {
        "keywords"
    }

    async fn should_search(&self, query: &str, _model: &str) -> bool {
        self.matches(query)
    }
}

pub fn trigger_from_config(
    strategy: TriggerStrategy,
    keywords: &[String],
    provider: Arc<dyn Provider>,
) -> Arc<dyn SearchTrigger> {
    match strategy {
        TriggerStrategy::Model => Arc::new(ModelTrigger::new(provider)),
        TriggerStrategy::Keywords => Arc::new(KeywordTrigger::new(keywords)),
    }
}
