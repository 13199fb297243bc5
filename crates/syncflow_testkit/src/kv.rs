//! A last-writer-wins key/value service.
//!
//! Actions:
//! - `put {key, value, ts}` stores `value` unless the key already holds a
//!   write with a later (or equal) timestamp; the output reports `applied`
//! - `get {key}` completes `ok {key, value, _ts}` or `missing {key}`
//!
//! The `entry` relation exposes one row per key with columns `key`, `value`
//! and `_ts`, which is what keyed write targets query for conflicts.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncflow_engine::{
    ConflictResolver, Health, QueryRequest, Resolution, Transport, TransportError,
    TransportResult, Write,
};
use syncflow_log::{CompletionEnvelope, Fields, InvocationEnvelope};

/// Relation listing the stored entries.
pub const ENTRY_RELATION: &str = "entry";

/// Column holding an entry's write timestamp.
pub const VERSION_COLUMN: &str = "_ts";

#[derive(Debug, Clone)]
struct Entry {
    key: Value,
    value: Value,
    ts: u64,
}

impl Entry {
    fn row(&self) -> Fields {
        let mut row = Fields::new();
        row.insert("key".into(), self.key.clone());
        row.insert("value".into(), self.value.clone());
        row.insert(VERSION_COLUMN.into(), Value::from(self.ts));
        row
    }
}

/// Key/value store settling concurrent puts by timestamp.
#[derive(Debug)]
pub struct KvService {
    name: String,
    available: AtomicBool,
    entries: Mutex<BTreeMap<String, Entry>>,
    puts: Mutex<Vec<Fields>>,
}

impl KvService {
    /// Creates an empty, available store.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            available: AtomicBool::new(true),
            entries: Mutex::new(BTreeMap::new()),
            puts: Mutex::new(Vec::new()),
        })
    }

    /// Applies a put directly, bypassing the transport. Returns true if the
    /// value was stored.
    pub fn put(&self, key: impl Into<Value>, value: impl Into<Value>, ts: u64) -> bool {
        let key = key.into();
        let value = value.into();
        let mut entries = self.entries.lock();
        let slot = key.to_string();
        let incoming = Write::new(key.clone(), single("value", value.clone()), ts);
        let accept = match entries.get(&slot) {
            None => true,
            Some(existing) => {
                let existing = Write::new(existing.key.clone(), existing.row(), existing.ts);
                ConflictResolver::default_policy(&existing, &incoming) == Resolution::AcceptIncoming
            }
        };
        if accept {
            entries.insert(slot, Entry { key, value, ts });
        }
        accept
    }

    /// Returns the stored value of a key.
    pub fn value(&self, key: impl Into<Value>) -> Option<Value> {
        let key: Value = key.into();
        self.entries
            .lock()
            .get(&key.to_string())
            .map(|entry| entry.value.clone())
    }

    /// Returns the timestamp of a key's stored write.
    pub fn version(&self, key: impl Into<Value>) -> Option<u64> {
        let key: Value = key.into();
        self.entries.lock().get(&key.to_string()).map(|entry| entry.ts)
    }

    /// Returns the inputs of every `put` invocation received.
    pub fn puts(&self) -> Vec<Fields> {
        self.puts.lock().clone()
    }

    /// Sets availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> TransportResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::unavailable(self.name.clone()))
        }
    }
}

fn single(field: &str, value: Value) -> Fields {
    let mut fields = Fields::new();
    fields.insert(field.to_string(), value);
    fields
}

#[async_trait]
impl Transport for KvService {
    async fn invoke(&self, invocation: InvocationEnvelope) -> TransportResult<CompletionEnvelope> {
        self.check()?;
        let input = &invocation.input;
        let key = input
            .get("key")
            .cloned()
            .ok_or_else(|| TransportError::fatal("missing key"))?;
        match invocation.action.as_str() {
            "put" => {
                self.puts.lock().push(input.clone());
                let value = input.get("value").cloned().unwrap_or(Value::Null);
                let ts = input
                    .get("ts")
                    .and_then(Value::as_u64)
                    .unwrap_or(invocation.timestamp);
                let applied = self.put(key.clone(), value, ts);
                let mut output = single("key", key);
                output.insert("applied".into(), Value::Bool(applied));
                Ok(invocation.complete("ok", output))
            }
            "get" => {
                let entry = self.entries.lock().get(&key.to_string()).cloned();
                Ok(match entry {
                    Some(entry) => invocation.complete("ok", entry.row()),
                    None => invocation.complete("missing", single("key", key)),
                })
            }
            other => Err(TransportError::fatal(format!("unknown action {other}"))),
        }
    }

    async fn query(&self, request: QueryRequest) -> TransportResult<Vec<Fields>> {
        self.check()?;
        if request.relation != ENTRY_RELATION {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .lock()
            .values()
            .map(Entry::row)
            .filter(|row| {
                request
                    .args
                    .iter()
                    .all(|(field, value)| row.get(field) == Some(value))
            })
            .collect())
    }

    async fn health(&self) -> TransportResult<Health> {
        if self.available.load(Ordering::SeqCst) {
            Ok(Health::available(Duration::from_micros(1)))
        } else {
            Ok(Health::unavailable())
        }
    }
}
