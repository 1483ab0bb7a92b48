//! Turns filtered search items into a cited answer.

use crate::SearchItem;
use anyhow::{bail, Result};
use chrono::NaiveDate;
use relay_providers::{ChatMessage, ChatOptions, Provider};
use std::sync::Arc;

pub const NOTHING_FOUND: &str = "Nothing found for that query.";

const SYNTHESIS_TEMPERATURE: f32 = 0.2;

pub struct Synthesizer {
    provider: Arc<dyn Provider>,
}

impl Synthesizer {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub async fn synthesize(
        &self,
        model: &str,
        query: &str,
        items: &[SearchItem],
    ) -> Result<String> {
        self.synthesize_on(model, query, items, chrono::Utc::now().date_naive())
            .await
    }

    /// Empty input short-circuits to [`NOTHING_FOUND`] without a model call.
    pub async fn synthesize_on(
        &self,
        model: &str,
        query: &str,
        items: &[SearchItem],
        today: NaiveDate,
    ) -> Result<String> {
        if items.is_empty() {
            return Ok(NOTHING_FOUND.to_string());
        }

        let options = ChatOptions {
            temperature: Some(SYNTHESIS_TEMPERATURE),
            max_tokens: None,
        };
        let response = self
            .provider
            .chat(model, Self::build_messages(query, items, today), &options)
            .await?;
        let answer = response.text().trim();
        if answer.is_empty() {
            bail!("empty completion");
        }
        Ok(answer.to_string())
    }

    fn corpus(items: &[SearchItem]) -> String {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}. {}\n{}\n{}", i + 1, item.title, item.snippet, item.link))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn build_messages(query: &str, items: &[SearchItem], today: NaiveDate) -> Vec<ChatMessage> {
        let system = format!(
            "You are an analyst of web search results. You have no internet access of your own.\n\
             Today's date is {}.\n\
             Use ONLY the snippets and links provided below as your source of facts.\n\
             Prefer the most recent and most authoritative-looking sources.\n\
             Do not invent facts that are not in the snippets.\n\
             If the data is insufficient, say so and ask a clarifying question.",
            today.format("%Y-%m-%d")
        );
        let user = format!(
            "Question: {}\n\n\
             Answer the question from the search results below. End your answer with a \
             \"Sources\" section listing 2-4 of the links you actually used.\n\n\
             Search results:\n{}",
            query,
            Self::corpus(items)
        );
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}
