//! # SyncFlow Log
//!
//! Append-only causal history for the SyncFlow engine.
//!
//! This crate provides:
//! - Immutable [`ActionRecord`]s (invocations and completions) and their wire envelopes
//! - The [`ActionLog`] arena with per-flow indexes and provenance edges
//! - Atomic compare-and-append of rule firings ([`ActionLog::commit_firing`])
//! - Durable journals ([`MemoryJournal`], [`FileJournal`]) and whole-log archives
//! - A read-only [`ProvenanceGraph`] view for lineage queries
//!
//! ## Key Invariants
//!
//! - Records are never updated or removed once appended
//! - Records reference each other by id only, never by live pointers
//! - An append is journaled before it is indexed; a failed journal write records nothing
//! - A rule fires at most once per matched set: the edge set is the proof

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod clock;
mod edge;
mod error;
mod journal;
mod log;
mod provenance;
mod record;

pub use archive::{LogArchive, ARCHIVE_VERSION};
pub use clock::{now_millis, LogClock};
pub use edge::{FiringCommit, ProvenanceEdge};
pub use error::{LogError, LogResult};
pub use journal::{FileJournal, Journal, JournalEntry, MemoryJournal};
pub use log::ActionLog;
pub use provenance::{Firing, ProvenanceGraph};
pub use record::{
    ActionRecord, CompletionEnvelope, Fields, FlowId, InvocationEnvelope, RecordId, RecordKind,
};
