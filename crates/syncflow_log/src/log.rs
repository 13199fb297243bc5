//! The append-only action log.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::archive::LogArchive;
use crate::clock::LogClock;
use crate::edge::{FiringCommit, ProvenanceEdge};
use crate::error::{LogError, LogResult};
use crate::journal::{Journal, JournalEntry};
use crate::record::{ActionRecord, FlowId, RecordId};

/// Append-only arena of action records and provenance edges.
///
/// All records live in one vector; every index stores positions into it, so
/// no record ever holds a reference to another. Reads clone `Arc`s out of the
/// arena and never observe a partially applied append.
///
/// # Invariants
///
/// - A record id maps to exactly one record for the lifetime of the log
/// - Every journaled entry is indexed, and nothing is indexed unless journaled
/// - For a given rule and matched set, at most one edge set is ever committed
pub struct ActionLog {
    state: RwLock<LogState>,
    journal: Option<Arc<dyn Journal>>,
    clock: LogClock,
    subscribers: Mutex<Vec<mpsc::Sender<Arc<ActionRecord>>>>,
}

#[derive(Default)]
struct LogState {
    records: Vec<Arc<ActionRecord>>,
    by_id: HashMap<RecordId, usize>,
    by_flow: HashMap<FlowId, Vec<usize>>,
    flow_order: Vec<FlowId>,
    children: HashMap<RecordId, Vec<usize>>,
    completion_of: HashMap<RecordId, usize>,
    edges: Vec<ProvenanceEdge>,
    edges_from: HashMap<RecordId, Vec<usize>>,
    edges_to: HashMap<RecordId, Vec<usize>>,
}

impl LogState {
    fn insert(&mut self, record: ActionRecord) -> Arc<ActionRecord> {
        let idx = self.records.len();
        let record = Arc::new(record);
        self.by_id.insert(record.id, idx);
        let flow = self.by_flow.entry(record.flow).or_default();
        if flow.is_empty() {
            self.flow_order.push(record.flow);
        }
        flow.push(idx);
        if let Some(parent) = record.parent {
            self.children.entry(parent).or_default().push(idx);
            if record.is_completion() {
                self.completion_of.entry(parent).or_insert(idx);
            }
        }
        self.records.push(Arc::clone(&record));
        record
    }

    fn insert_edge(&mut self, edge: ProvenanceEdge) {
        let idx = self.edges.len();
        self.edges_from.entry(edge.source).or_default().push(idx);
        self.edges_to.entry(edge.produced).or_default().push(idx);
        self.edges.push(edge);
    }

    fn get(&self, id: &RecordId) -> Option<&Arc<ActionRecord>> {
        self.by_id.get(id).map(|&idx| &self.records[idx])
    }

    fn sources_of(&self, produced: &RecordId, rule: &str) -> BTreeSet<RecordId> {
        self.edges_to
            .get(produced)
            .into_iter()
            .flatten()
            .map(|&idx| &self.edges[idx])
            .filter(|edge| edge.rule == rule)
            .map(|edge| edge.source)
            .collect()
    }

    fn fired(&self, matched: &[RecordId], rule: &str) -> bool {
        let wanted: BTreeSet<RecordId> = matched.iter().copied().collect();
        let Some(first) = wanted.iter().next() else {
            return false;
        };
        self.edges_from
            .get(first)
            .into_iter()
            .flatten()
            .map(|&idx| &self.edges[idx])
            .filter(|edge| edge.rule == rule)
            .any(|edge| self.sources_of(&edge.produced, rule) == wanted)
    }

    fn check_new(&self, record: &ActionRecord) -> LogResult<bool> {
        match self.get(&record.id) {
            Some(existing) if **existing == *record => Ok(false),
            Some(_) => Err(LogError::DuplicateRecord { id: record.id }),
            None => Ok(true),
        }
    }

    fn apply(&mut self, entry: JournalEntry) -> LogResult<()> {
        match entry {
            JournalEntry::Record(record) => {
                if self.check_new(&record)? {
                    self.insert(record);
                }
            }
            JournalEntry::Edge(edge) => self.insert_edge(edge),
        }
        Ok(())
    }
}

impl std::fmt::Debug for ActionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ActionLog")
            .field("records", &state.records.len())
            .field("edges", &state.edges.len())
            .field("flows", &state.flow_order.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionLog {
    /// Creates an empty, unjournaled log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
            journal: None,
            clock: LogClock::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Creates an empty log that journals every append.
    #[must_use]
    pub fn with_journal(journal: Arc<dyn Journal>) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    /// Rebuilds a log from the entries of `journal` and keeps journaling to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or holds two different
    /// records under one id.
    pub fn recover(journal: Arc<dyn Journal>) -> LogResult<Self> {
        let entries = journal.read_all()?;
        let log = Self::with_journal(journal);
        {
            let mut state = log.state.write();
            for entry in entries {
                state.apply(entry)?;
            }
            if let Some(latest) = state.records.iter().map(|r| r.timestamp).max() {
                log.clock.observe(latest);
            }
            debug!(
                records = state.records.len(),
                edges = state.edges.len(),
                "recovered action log"
            );
        }
        Ok(log)
    }

    /// Returns the next timestamp of this log's clock.
    pub fn now(&self) -> u64 {
        self.clock.tick()
    }

    /// Appends a record.
    ///
    /// Re-appending a record identical to one already present is a no-op and
    /// returns its id, so redelivered completions are harmless.
    ///
    /// # Errors
    ///
    /// - [`LogError::DuplicateRecord`] if a different record has the same id
    /// - a storage error if the journal write fails; nothing is recorded then
    pub fn append(&self, record: ActionRecord) -> LogResult<RecordId> {
        let id = record.id;
        let appended = {
            let mut state = self.state.write();
            if !state.check_new(&record)? {
                return Ok(id);
            }
            if let Some(journal) = &self.journal {
                journal.write(&[JournalEntry::Record(record.clone())])?;
            }
            self.clock.observe(record.timestamp);
            state.insert(record)
        };
        self.notify(&[appended]);
        Ok(id)
    }

    /// Appends a provenance edge between two recorded records.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownRecord`] if either end is missing, or a
    /// storage error if the journal write fails.
    pub fn add_edge(&self, source: RecordId, produced: RecordId, rule: &str) -> LogResult<()> {
        let mut state = self.state.write();
        for id in [source, produced] {
            if !state.by_id.contains_key(&id) {
                return Err(LogError::UnknownRecord { id });
            }
        }
        let edge = ProvenanceEdge::new(source, produced, rule);
        if let Some(journal) = &self.journal {
            journal.write(&[JournalEntry::Edge(edge.clone())])?;
        }
        state.insert_edge(edge);
        Ok(())
    }

    /// Returns true if `rule` has already fired for exactly this matched set.
    #[must_use]
    pub fn has_edge(&self, matched: &[RecordId], rule: &str) -> bool {
        self.state.read().fired(matched, rule)
    }

    /// Atomically records a rule firing.
    ///
    /// Under one write lock: if an edge set for `rule` over `matched` already
    /// exists, returns [`FiringCommit::AlreadyFired`] and appends nothing.
    /// Otherwise appends every invocation plus one edge per (source, produced)
    /// pair, journaled as a single batch.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::DuplicateRecord`] if an invocation id is taken, or a
    /// storage error if the journal write fails. Nothing is recorded on error.
    pub fn commit_firing(
        &self,
        rule: &str,
        matched: &[RecordId],
        invocations: Vec<ActionRecord>,
    ) -> LogResult<FiringCommit> {
        let appended = {
            let mut state = self.state.write();
            if state.fired(matched, rule) {
                debug!(rule, matched = matched.len(), "firing already committed");
                return Ok(FiringCommit::AlreadyFired);
            }
            for invocation in &invocations {
                if state.by_id.contains_key(&invocation.id) {
                    return Err(LogError::DuplicateRecord { id: invocation.id });
                }
            }

            let mut edges = Vec::with_capacity(invocations.len() * matched.len());
            for invocation in &invocations {
                for source in matched {
                    edges.push(ProvenanceEdge::new(*source, invocation.id, rule));
                }
            }
            if let Some(journal) = &self.journal {
                let batch: Vec<JournalEntry> = invocations
                    .iter()
                    .cloned()
                    .map(JournalEntry::Record)
                    .chain(edges.iter().cloned().map(JournalEntry::Edge))
                    .collect();
                journal.write(&batch)?;
            }

            let mut appended = Vec::with_capacity(invocations.len());
            for invocation in invocations {
                self.clock.observe(invocation.timestamp);
                appended.push(state.insert(invocation));
            }
            for edge in edges {
                state.insert_edge(edge);
            }
            appended
        };
        let ids = appended.iter().map(|r| r.id).collect();
        self.notify(&appended);
        Ok(FiringCommit::Committed { invocations: ids })
    }

    /// Returns a record by id.
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Arc<ActionRecord>> {
        self.state.read().get(id).cloned()
    }

    /// Returns true if a record with this id exists.
    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.read().by_id.contains_key(id)
    }

    /// Returns every record of a flow in arrival order.
    #[must_use]
    pub fn records_for_flow(&self, flow: &FlowId) -> Vec<Arc<ActionRecord>> {
        let state = self.state.read();
        state
            .by_flow
            .get(flow)
            .into_iter()
            .flatten()
            .map(|&idx| Arc::clone(&state.records[idx]))
            .collect()
    }

    /// Returns the completions of a flow in arrival order.
    #[must_use]
    pub fn completions_for_flow(&self, flow: &FlowId) -> Vec<Arc<ActionRecord>> {
        let state = self.state.read();
        state
            .by_flow
            .get(flow)
            .into_iter()
            .flatten()
            .map(|&idx| &state.records[idx])
            .filter(|r| r.is_completion())
            .cloned()
            .collect()
    }

    /// Returns invocations of a flow that have no completion yet.
    #[must_use]
    pub fn outstanding_invocations(&self, flow: &FlowId) -> Vec<Arc<ActionRecord>> {
        let state = self.state.read();
        state
            .by_flow
            .get(flow)
            .into_iter()
            .flatten()
            .map(|&idx| &state.records[idx])
            .filter(|r| r.is_invocation() && !state.completion_of.contains_key(&r.id))
            .cloned()
            .collect()
    }

    /// Returns records whose parent is `id`, in arrival order.
    #[must_use]
    pub fn children_of(&self, id: &RecordId) -> Vec<Arc<ActionRecord>> {
        let state = self.state.read();
        state
            .children
            .get(id)
            .into_iter()
            .flatten()
            .map(|&idx| Arc::clone(&state.records[idx]))
            .collect()
    }

    /// Returns the first completion answering `invocation`.
    #[must_use]
    pub fn completion_for(&self, invocation: &RecordId) -> Option<Arc<ActionRecord>> {
        let state = self.state.read();
        state
            .completion_of
            .get(invocation)
            .map(|&idx| Arc::clone(&state.records[idx]))
    }

    /// Returns edges whose source is `id`.
    #[must_use]
    pub fn edges_from(&self, id: &RecordId) -> Vec<ProvenanceEdge> {
        let state = self.state.read();
        state
            .edges_from
            .get(id)
            .into_iter()
            .flatten()
            .map(|&idx| state.edges[idx].clone())
            .collect()
    }

    /// Returns edges whose produced invocation is `id`.
    #[must_use]
    pub fn edges_to(&self, id: &RecordId) -> Vec<ProvenanceEdge> {
        let state = self.state.read();
        state
            .edges_to
            .get(id)
            .into_iter()
            .flatten()
            .map(|&idx| state.edges[idx].clone())
            .collect()
    }

    /// Returns the direct causes of a record: its parent and its edge sources.
    #[must_use]
    pub fn causes_of(&self, id: &RecordId) -> Vec<RecordId> {
        let state = self.state.read();
        let mut causes = Vec::new();
        if let Some(parent) = state.get(id).and_then(|r| r.parent) {
            causes.push(parent);
        }
        for &idx in state.edges_to.get(id).into_iter().flatten() {
            let source = state.edges[idx].source;
            if !causes.contains(&source) {
                causes.push(source);
            }
        }
        causes
    }

    /// Returns the direct effects of a record: its children and the
    /// invocations produced from it.
    #[must_use]
    pub fn effects_of(&self, id: &RecordId) -> Vec<RecordId> {
        let state = self.state.read();
        let mut effects: Vec<RecordId> = state
            .children
            .get(id)
            .into_iter()
            .flatten()
            .map(|&idx| state.records[idx].id)
            .collect();
        for &idx in state.edges_from.get(id).into_iter().flatten() {
            let produced = state.edges[idx].produced;
            if !effects.contains(&produced) {
                effects.push(produced);
            }
        }
        effects
    }

    /// Returns every flow id in first-seen order.
    #[must_use]
    pub fn flows(&self) -> Vec<FlowId> {
        self.state.read().flow_order.clone()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if the log holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Returns the number of provenance edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    /// Subscribes to newly appended records.
    ///
    /// Records appended after this call are delivered in append order. A
    /// subscriber whose buffer is full misses records rather than blocking
    /// appends; closed subscribers are dropped.
    pub fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Arc<ActionRecord>> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, records: &[Arc<ActionRecord>]) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| {
            for record in records {
                match tx.try_send(Arc::clone(record)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(record = %record.id, "log subscriber lagging, record dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    /// Snapshots the whole log into an archive.
    #[must_use]
    pub fn to_archive(&self) -> LogArchive {
        let state = self.state.read();
        LogArchive::new(
            state.records.iter().map(|r| (**r).clone()).collect(),
            state.edges.clone(),
        )
    }

    /// Encodes the whole log as one CBOR document.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn export_archive(&self) -> LogResult<Vec<u8>> {
        self.to_archive().encode()
    }

    /// Builds an unjournaled log from an archive produced by [`Self::export_archive`].
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed input or an unsupported version.
    pub fn import_archive(bytes: &[u8]) -> LogResult<Self> {
        let archive = LogArchive::decode(bytes)?;
        let log = Self::new();
        {
            let mut state = log.state.write();
            for record in archive.records {
                state.apply(JournalEntry::Record(record))?;
            }
            for edge in archive.edges {
                state.apply(JournalEntry::Edge(edge))?;
            }
            if let Some(latest) = state.records.iter().map(|r| r.timestamp).max() {
                log.clock.observe(latest);
            }
        }
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::record::Fields;
    use serde_json::json;

    struct FailingJournal;

    impl Journal for FailingJournal {
        fn write(&self, _entries: &[JournalEntry]) -> LogResult<()> {
            Err(LogError::storage("disk full"))
        }

        fn read_all(&self) -> LogResult<Vec<JournalEntry>> {
            Ok(Vec::new())
        }
    }

    fn completion(service: &str, flow: FlowId, x: i64) -> ActionRecord {
        let mut output = Fields::new();
        output.insert("x".into(), json!(x));
        ActionRecord::completion(service, "run", Fields::new(), "ok", output, flow)
    }

    #[test]
    fn append_and_query_flow() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let other = FlowId::new();
        let inv = ActionRecord::invocation("A", "run", Fields::new(), flow);
        let done = ActionRecord::completes(&inv, "ok", Fields::new());
        log.append(inv.clone()).unwrap();
        log.append(completion("B", other, 1)).unwrap();
        log.append(done.clone()).unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(log.records_for_flow(&flow).len(), 2);
        let completions = log.completions_for_flow(&flow);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].id, done.id);
        assert_eq!(log.completion_for(&inv.id).unwrap().id, done.id);
        assert_eq!(log.children_of(&inv.id)[0].id, done.id);
        assert_eq!(log.flows(), vec![flow, other]);
        assert!(log.outstanding_invocations(&flow).is_empty());
    }

    #[test]
    fn identical_reappend_is_noop() {
        let log = ActionLog::new();
        let rec = completion("A", FlowId::new(), 1);
        let id = log.append(rec.clone()).unwrap();
        assert_eq!(log.append(rec).unwrap(), id);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn different_record_same_id_rejected() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let rec = completion("A", flow, 1);
        log.append(rec.clone()).unwrap();
        let clash = completion("A", flow, 2).with_id(rec.id);
        assert!(matches!(
            log.append(clash),
            Err(LogError::DuplicateRecord { id }) if id == rec.id
        ));
    }

    #[test]
    fn storage_fault_records_nothing() {
        let log = ActionLog::with_journal(Arc::new(FailingJournal));
        let err = log.append(completion("A", FlowId::new(), 1)).unwrap_err();
        assert!(err.is_storage_fault());
        assert!(log.is_empty());
    }

    #[test]
    fn commit_firing_is_compare_and_append() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let a = completion("A", flow, 1);
        let b = completion("B", flow, 1);
        log.append(a.clone()).unwrap();
        log.append(b.clone()).unwrap();
        let matched = [a.id, b.id];

        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow).with_rule("R");
        let first = log.commit_firing("R", &matched, vec![inv.clone()]).unwrap();
        assert_eq!(first, FiringCommit::Committed { invocations: vec![inv.id] });
        assert!(log.has_edge(&matched, "R"));
        assert!(log.has_edge(&[b.id, a.id], "R"));
        assert!(!log.has_edge(&matched, "Other"));
        assert!(!log.has_edge(&[a.id], "R"));

        let again = ActionRecord::invocation("C", "go", Fields::new(), flow).with_rule("R");
        assert_eq!(
            log.commit_firing("R", &matched, vec![again]).unwrap(),
            FiringCommit::AlreadyFired
        );
        assert_eq!(log.len(), 3);
        assert_eq!(log.edge_count(), 2);
        assert_eq!(log.outstanding_invocations(&flow).len(), 1);
    }

    #[test]
    fn subset_match_is_a_different_firing() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let a = completion("A", flow, 1);
        let b = completion("B", flow, 1);
        log.append(a.clone()).unwrap();
        log.append(b.clone()).unwrap();

        let single = ActionRecord::invocation("C", "go", Fields::new(), flow);
        log.commit_firing("R", &[a.id], vec![single]).unwrap();
        assert!(log.has_edge(&[a.id], "R"));
        assert!(!log.has_edge(&[a.id, b.id], "R"));
    }

    #[test]
    fn failed_commit_leaves_no_trace() {
        let log = ActionLog::with_journal(Arc::new(FailingJournal));
        let flow = FlowId::new();
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        let matched = [RecordId::new()];
        assert!(log.commit_firing("R", &matched, vec![inv]).is_err());
        assert!(!log.has_edge(&matched, "R"));
        assert_eq!(log.edge_count(), 0);
    }

    #[test]
    fn add_edge_requires_known_records() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let a = completion("A", flow, 1);
        log.append(a.clone()).unwrap();
        let missing = RecordId::new();
        assert!(matches!(
            log.add_edge(a.id, missing, "R"),
            Err(LogError::UnknownRecord { id }) if id == missing
        ));

        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        log.append(inv.clone()).unwrap();
        log.add_edge(a.id, inv.id, "R").unwrap();
        assert_eq!(log.edges_from(&a.id).len(), 1);
        assert_eq!(log.edges_to(&inv.id)[0].source, a.id);
        assert!(log.has_edge(&[a.id], "R"));
    }

    #[test]
    fn recover_rebuilds_indexes() {
        let journal = Arc::new(MemoryJournal::new());
        let flow = FlowId::new();
        let a = completion("A", flow, 1);
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow).with_parent(a.id);
        {
            let log = ActionLog::with_journal(journal.clone());
            log.append(a.clone()).unwrap();
            log.commit_firing("R", &[a.id], vec![inv.clone()]).unwrap();
        }
        assert_eq!(journal.len(), 3);

        let log = ActionLog::recover(journal).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.has_edge(&[a.id], "R"));
        assert_eq!(log.children_of(&a.id)[0].id, inv.id);
        assert!(log.now() > inv.timestamp);
    }

    #[test]
    fn causes_and_effects() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let a = completion("A", flow, 1);
        let b = completion("B", flow, 1);
        log.append(a.clone()).unwrap();
        log.append(b.clone()).unwrap();
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow).with_parent(b.id);
        log.commit_firing("R", &[a.id, b.id], vec![inv.clone()]).unwrap();

        let causes = log.causes_of(&inv.id);
        assert_eq!(causes, vec![b.id, a.id]);
        assert_eq!(log.effects_of(&b.id), vec![inv.id]);
        assert_eq!(log.effects_of(&a.id), vec![inv.id]);
    }

    #[tokio::test]
    async fn subscribers_see_appends() {
        let log = ActionLog::new();
        let mut rx = log.subscribe(8);
        let flow = FlowId::new();
        let rec = completion("A", flow, 1);
        log.append(rec.clone()).unwrap();
        log.append(rec.clone()).unwrap();
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        log.commit_firing("R", &[rec.id], vec![inv.clone()]).unwrap();

        assert_eq!(rx.recv().await.unwrap().id, rec.id);
        assert_eq!(rx.recv().await.unwrap().id, inv.id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn archive_roundtrip_preserves_firings() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let a = completion("A", flow, 3);
        log.append(a.clone()).unwrap();
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow).with_parent(a.id);
        log.commit_firing("R", &[a.id], vec![inv]).unwrap();

        let bytes = log.export_archive().unwrap();
        let restored = ActionLog::import_archive(&bytes).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.edge_count(), 1);
        assert!(restored.has_edge(&[a.id], "R"));
        assert_eq!(restored.get(&a.id).unwrap().output().unwrap()["x"], json!(3));
    }
}
