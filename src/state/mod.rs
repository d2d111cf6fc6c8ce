pub mod json;
pub mod sqlite;

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// High-water mark of handled messages plus attempt counters for deliveries
/// that are still waiting on a retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub last_processed_id: u64,
    pub retry_counters: BTreeMap<u64, u32>,
}

impl Cursor {
    pub fn get_retry_count(&self, message_id: u64) -> u32 {
        self.retry_counters.get(&message_id).copied().unwrap_or(0)
    }

    /// A count of zero removes the entry.
    pub fn set_retry_count(&mut self, message_id: u64, count: u32) {
        if count == 0 {
            self.retry_counters.remove(&message_id);
        } else {
            self.retry_counters.insert(message_id, count);
        }
    }

    /// Move the high-water mark forward. Returns false (and changes nothing)
    /// when `message_id` is not newer than what is already recorded.
    pub fn advance_to(&mut self, message_id: u64) -> bool {
        if message_id > self.last_processed_id {
            self.last_processed_id = message_id;
            true
        } else {
            false
        }
    }

    /// Drop counters for messages at or below the high-water mark unless a
    /// delivery for them is still `active`. Returns how many were dropped.
    pub fn prune_settled(&mut self, active: &HashSet<u64>) -> usize {
        let before = self.retry_counters.len();
        let last = self.last_processed_id;
        self.retry_counters
            .retain(|id, _| *id > last || active.contains(id));
        before - self.retry_counters.len()
    }

    pub fn to_json(&self) -> Result<String> {
        let record = StateRecord {
            last_message_id: self.last_processed_id.to_string(),
            retry_counts: self
                .retry_counters
                .iter()
                .map(|(id, count)| (id.to_string(), *count))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&record)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let record: StateRecord = serde_json::from_str(content)?;
        let last_processed_id = record.last_message_id.trim().parse::<u64>().map_err(|e| {
            anyhow::anyhow!("Invalid last_message_id {:?}: {}", record.last_message_id, e)
        })?;
        let mut cursor = Cursor {
            last_processed_id,
            retry_counters: BTreeMap::new(),
        };
        for (id, count) in record.retry_counts {
            let id = id
                .trim()
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("Invalid retry_counts key {:?}: {}", id, e))?;
            cursor.set_retry_count(id, count);
        }
        Ok(cursor)
    }
}

/// On-disk shape; ids are strings so 64-bit snowflakes survive any JSON reader.
#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    #[serde(default = "default_last_message_id")]
    last_message_id: String,
    #[serde(default)]
    retry_counts: BTreeMap<String, u32>,
}

fn default_last_message_id() -> String {
    "0".to_string()
}

/// Persistence for the cursor. Implementations replace the whole value on save.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The last saved cursor, or a zero cursor when nothing usable is stored.
    /// Unreadable state is logged and treated as empty, never returned as an error.
    async fn load(&self) -> Cursor;

    /// Replace the stored cursor. Readers never observe a partial write.
    async fn save(&self, cursor: &Cursor) -> Result<()>;
}
