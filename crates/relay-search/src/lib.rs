//! Relay Web Search
//!
//! Search trigger strategies, the search fallback cascade with a domain
//! deny-list, and synthesis of a cited answer from search snippets

pub mod google;
pub mod synthesize;
pub mod trigger;

pub use google::GoogleCustomSearch;
pub use synthesize::{Synthesizer, NOTHING_FOUND};
pub use trigger::{trigger_from_config, KeywordTrigger, ModelTrigger, SearchTrigger};

use anyhow::Result;
use relay_config::SearchConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const MAX_RESULTS_PER_CALL: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub num: u8,
    pub language: Option<String>,
    pub date_restrict: Option<String>,
}

/// A single call against a search API. Failures are logged by the
/// implementation and come back as an empty list.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Vec<SearchItem>;
}

#[derive(Debug, Clone, Default)]
pub struct DomainDenyList {
    domains: Vec<String>,
}

impl DomainDenyList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// Denied when the host equals a listed domain or is a subdomain of one.
    /// Links without a parsable host are denied too.
    pub fn is_denied(&self, link: &str) -> bool {
        let Some(host) = url::Url::parse(link)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        else {
            return true;
        };
        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn retain_allowed(&self, items: Vec<SearchItem>) -> Vec<SearchItem> {
        items
            .into_iter()
            .filter(|item| !self.is_denied(&item.link))
            .collect()
    }
}

/// Search with a loosening cascade: language + recency, then recency only,
/// then unrestricted. Stops at the first step with results left after
/// deny-list filtering.
pub struct WebSearch {
    backend: Arc<dyn SearchBackend>,
    deny_list: DomainDenyList,
    num_results: u8,
    language: Option<String>,
    date_restrict: Option<String>,
}

impl WebSearch {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &SearchConfig) -> Self {
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            backend,
            deny_list: DomainDenyList::new(&config.deny_domains),
            num_results: config.num_results.clamp(1, MAX_RESULTS_PER_CALL),
            language: clean(&config.language),
            date_restrict: clean(&config.date_restrict),
        }
    }

    pub fn cascade(&self, query: &str) -> Vec<SearchRequest> {
        let step = |language: Option<String>, date_restrict: Option<String>| SearchRequest {
            query: query.to_string(),
            num: self.num_results,
            language,
            date_restrict,
        };
        let candidates = [
            step(self.language.clone(), self.date_restrict.clone()),
            step(None, self.date_restrict.clone()),
            step(None, None),
        ];

        let mut steps: Vec<SearchRequest> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if steps.last() != Some(&candidate) {
                steps.push(candidate);
            }
        }
        steps
    }

    pub async fn search(&self, query: &str) -> Vec<SearchItem> {
        for (idx, request) in self.cascade(query).iter().enumerate() {
            let raw = self.backend.search(request).await;
            let raw_count = raw.len();
            let items = self.deny_list.retain_allowed(raw);
            debug!(
                step = idx + 1,
                raw = raw_count,
                kept = items.len(),
                language = ?request.language,
                date_restrict = ?request.date_restrict,
                "Search cascade step"
            );
            if !items.is_empty() {
                info!("Search '{}' returned {} item(s) at step {}", query, items.len(), idx + 1);
                return items;
            }
        }
        info!("Search '{}' returned nothing", query);
        Vec::new()
    }
}

/// Cascade search followed by synthesis.
pub struct SearchAggregator {
    search: WebSearch,
    synthesizer: Synthesizer,
}

impl SearchAggregator {
    pub fn new(search: WebSearch, synthesizer: Synthesizer) -> Self {
        Self {
            search,
            synthesizer,
        }
    }

    pub async fn answer(&self, model: &str, query: &str) -> Result<String> {
        let items = self.search.search(query).await;
        self.synthesizer.synthesize(model, query, &items).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{SearchBackend, SearchItem, SearchRequest};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays one canned answer per call and records the requests.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub answers: Mutex<VecDeque<Vec<SearchItem>>>,
        pub requests: Mutex<Vec<SearchRequest>>,
    }

    impl ScriptedBackend {
        pub fn new(answers: Vec<Vec<SearchItem>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<SearchRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SearchBackend for ScriptedBackend {
        async fn search(&self, request: &SearchRequest) -> Vec<SearchItem> {
            self.requests.lock().unwrap().push(request.clone());
            self.answers.lock().unwrap().pop_front().unwrap_or_default()
        }
    }

    pub fn item(title: &str, link: &str) -> SearchItem {
        SearchItem {
            title: title.to_string(),
            snippet: format!("snippet about {}", title),
            link: link.to_string(),
        }
    }
}
