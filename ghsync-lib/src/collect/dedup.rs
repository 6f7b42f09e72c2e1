use super::endpoint::RecordKey;
use core::sync::atomic::{AtomicU64, Ordering};
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Instant;
use url::Url;

/// A record paired with the key it will be stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub key: String,
    pub record: Value,
}

/// Records of one batch after dedup.
#[derive(Debug, Default)]
pub struct DedupedBatch {
    pub records: Vec<KeyedRecord>,

    /// Records dropped because an earlier record of the batch had the same key.
    pub dropped: u64,
}

/// Derives record keys and drops in-batch repeats.
///
/// GitHub occasionally returns the same record twice within a single response; only the
/// first occurrence is kept.
#[derive(Debug, Clone, Copy)]
pub struct BatchDeduplicator<'a> {
    key: RecordKey,
    base_url: &'a Url,
    repo: &'a str,
    source_url: &'a str,
    item_key: &'a str,
}

impl<'a> BatchDeduplicator<'a> {
    #[must_use]
    pub const fn new(key: RecordKey, base_url: &'a Url, repo: &'a str, source_url: &'a str) -> Self {
        Self {
            key,
            base_url,
            repo,
            source_url,
            item_key: "",
        }
    }

    /// Sets the key of the work item the batch was fetched for.
    #[must_use]
    pub const fn with_item_key(mut self, item_key: &'a str) -> Self {
        self.item_key = item_key;
        self
    }

    #[must_use]
    pub fn dedup(&self, records: Vec<Value>) -> DedupedBatch {
        let mut seen = FxHashSet::default();
        let mut batch = DedupedBatch {
            records: Vec::with_capacity(records.len()),
            dropped: 0,
        };

        for (index, mut record) in records.into_iter().enumerate() {
            let key = self.key_for(&mut record, index);
            if seen.insert(key.clone()) {
                batch.records.push(KeyedRecord { key, record });
            } else {
                batch.dropped += 1;
            }
        }

        batch
    }

    fn key_for(&self, record: &mut Value, index: usize) -> String {
        match self.key {
            RecordKey::Field(field) => match record.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => self.positional_key(index),
            },
            RecordKey::ItemField(field) => match record.get(field) {
                Some(Value::String(s)) => format!("{}:{s}", self.item_key),
                Some(Value::Number(n)) => format!("{}:{n}", self.item_key),
                _ => self.positional_key(index),
            },
            RecordKey::AlertUrl => {
                let alert = match record.get("number").and_then(Value::as_u64) {
                    Some(number) => number.to_string(),
                    None => format!("fallback-{}-{index}", monotonic_nanos()),
                };

                let key = format!("{}repos/{}/secret-scanning/alerts/{alert}", self.base_url, self.repo);
                if let Value::Object(fields) = record {
                    let _ = fields.insert("alert_url".to_string(), Value::String(key.clone()));
                }

                key
            }
        }
    }

    fn positional_key(&self, index: usize) -> String {
        format!("{}#{index}", self.source_url)
    }
}

/// Nanoseconds since process start, strictly increasing across calls.
fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = u64::try_from(START.get_or_init(Instant::now).elapsed().as_nanos()).unwrap_or(u64::MAX);
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
