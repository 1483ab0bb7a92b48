//! Google Programmable Search (Custom Search JSON API) backend.

use crate::{SearchBackend, SearchItem, SearchRequest, MAX_RESULTS_PER_CALL};
use relay_config::SearchConfig;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

const UNTITLED: &str = "Untitled";

pub struct GoogleCustomSearch {
    client: Client,
    endpoint: String,
    api_key: String,
    cx: String,
    safe: String,
    interface_language: String,
}

impl GoogleCustomSearch {
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("search.api_key is not configured"))?;
        let cx = config
            .cx
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("search.cx is not configured"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            cx,
            safe: config.safe.clone(),
            interface_language: config.interface_language.clone(),
        })
    }

    fn query_params(&self, request: &SearchRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("key", self.api_key.clone()),
            ("cx", self.cx.clone()),
            ("q", request.query.clone()),
            ("num", request.num.clamp(1, MAX_RESULTS_PER_CALL).to_string()),
            ("safe", self.safe.clone()),
            ("hl", self.interface_language.clone()),
        ];
        if let Some(language) = &request.language {
            params.push(("lr", language.clone()));
        }
        if let Some(date_restrict) = &request.date_restrict {
            params.push(("dateRestrict", date_restrict.clone()));
        }
        params
    }

    fn parse_items(body: &serde_json::Value) -> Vec<SearchItem> {
        let Some(items) = body.get("items").and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| {
                let field = |name: &str| {
                    item.get(name)
                        .and_then(|v| v.as_str())
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_string()
                };
                let link = field("link");
                if link.is_empty() {
                    return None;
                }
                let title = Some(field("title"))
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| UNTITLED.to_string());
                Some(SearchItem {
                    title,
                    snippet: field("snippet"),
                    link,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SearchBackend for GoogleCustomSearch {
    async fn search(&self, request: &SearchRequest) -> Vec<SearchItem> {
        let response = match self
            .client
            .get(&self.endpoint)
            .query(&self.query_params(request))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("Search request failed for '{}': {}", request.query, err);
                return Vec::new();
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Search HTTP {} for '{}': {}",
                status.as_u16(),
                request.query,
                body.chars().take(300).collect::<String>()
            );
            return Vec::new();
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) => Self::parse_items(&body),
            Err(err) => {
                warn!("Search response decode failed for '{}': {}", request.query, err);
                Vec::new()
            }
        }
    }
}
