//! Process-wide mutable state: the active model and per-principal history.
//!
//! Nothing here is persisted; a restart starts from the configured model and
//! empty histories.

use anyhow::{bail, Result};
use relay_providers::ChatMessage;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Fixed-capacity circular buffer of turns. Once full, each push overwrites
/// the oldest slot.
#[derive(Debug, Clone)]
pub struct TurnRing {
    slots: Vec<Option<ChatMessage>>,
    head: usize,
    len: usize,
}

impl TurnRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, turn: ChatMessage) {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(turn);
            self.len += 1;
        } else {
            self.slots[self.head] = Some(turn);
            self.head = (self.head + 1) % capacity;
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }
}

#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    rings: HashMap<i64, TurnRing>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: HashMap::new(),
        }
    }

    pub fn turns(&self, principal: i64) -> Vec<ChatMessage> {
        self.rings
            .get(&principal)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn append(&mut self, principal: i64, turn: ChatMessage) {
        let capacity = self.capacity;
        self.rings
            .entry(principal)
            .or_insert_with(|| TurnRing::with_capacity(capacity))
            .push(turn);
    }

    pub fn clear(&mut self, principal: i64) {
        if let Some(ring) = self.rings.get_mut(&principal) {
            ring.clear();
        }
    }

    pub fn len(&self, principal: i64) -> usize {
        self.rings.get(&principal).map(TurnRing::len).unwrap_or(0)
    }
}

/// Name of the model every completion call uses. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveModel(String);

impl ActiveModel {
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            bail!("model name must not be empty");
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shared state handed to every handler.
pub struct Session {
    model: Mutex<ActiveModel>,
    history: Mutex<HistoryStore>,
}

impl Session {
    pub fn new(default_model: &str, history_capacity: usize) -> Result<Self> {
        Ok(Self {
            model: Mutex::new(ActiveModel::new(default_model)?),
            history: Mutex::new(HistoryStore::new(history_capacity)),
        })
    }

    pub async fn active_model(&self) -> String {
        self.model.lock().await.as_str().to_string()
    }

    pub async fn set_model(&self, name: &str) -> Result<String> {
        let model = ActiveModel::new(name)?;
        let name = model.as_str().to_string();
        *self.model.lock().await = model;
        Ok(name)
    }

    pub async fn history(&self, principal: i64) -> Vec<ChatMessage> {
        self.history.lock().await.turns(principal)
    }

    pub async fn append_turn(&self, principal: i64, turn: ChatMessage) {
        self.history.lock().await.append(principal, turn);
    }

    pub async fn clear_history(&self, principal: i64) {
        self.history.lock().await.clear(principal);
    }
}
