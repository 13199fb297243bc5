//! Engine and record fixtures.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncflow_engine::{Engine, EngineConfig, RetryConfig};
use syncflow_log::{ActionLog, CompletionEnvelope, Fields, FileJournal, FlowId, RecordId};
use tempfile::TempDir;

use crate::services::MemoryService;

/// Builds a field map from `(name, value)` pairs.
pub fn fields<'a, I>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (&'a str, Value)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Engine configuration with fast, jitter-free retries.
pub fn test_config(name: &str) -> EngineConfig {
    EngineConfig::new(name).with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false),
    )
}

/// Creates an engine with [`test_config`].
pub fn test_engine(name: &str) -> Arc<Engine> {
    Arc::new(Engine::new(test_config(name)))
}

/// Creates and registers one [`MemoryService`] per name, in order.
pub fn memory_services(engine: &Engine, names: &[&str]) -> Vec<Arc<MemoryService>> {
    names
        .iter()
        .map(|name| {
            let service = MemoryService::new(*name);
            engine.register_service(*name, service.clone());
            service
        })
        .collect()
}

/// A completion that did not come from a logged invocation.
pub fn completion(
    service: &str,
    action: &str,
    input: Fields,
    variant: &str,
    output: Fields,
    flow: FlowId,
) -> CompletionEnvelope {
    CompletionEnvelope {
        id: RecordId::new(),
        service: service.into(),
        action: action.into(),
        input,
        variant: variant.into(),
        output,
        flow,
        timestamp: syncflow_log::now_millis(),
        parent: None,
    }
}

/// A file-backed log in a temporary directory.
pub struct TestJournal {
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
    /// Path of the journal file.
    pub path: PathBuf,
}

impl TestJournal {
    /// Creates a fresh journal location.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("actions.journal");
        Self {
            _temp_dir: temp_dir,
            path,
        }
    }

    /// Opens the journal and recovers a log from it.
    pub fn open_log(&self) -> Arc<ActionLog> {
        let journal = FileJournal::open(&self.path).expect("Failed to open journal");
        Arc::new(ActionLog::recover(Arc::new(journal)).expect("Failed to recover log"))
    }
}

impl Default for TestJournal {
    fn default() -> Self {
        Self::new()
    }
}
