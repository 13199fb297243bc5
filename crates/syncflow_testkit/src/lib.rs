//! # SyncFlow Testkit
//!
//! Test utilities for SyncFlow.
//!
//! This crate provides:
//! - In-memory services implementing the engine's `Transport` contract
//! - A last-writer-wins key/value service for conflict scenarios
//! - A fluent builder for compiled rules
//! - Engine and record fixtures
//! - Property-based test generators using proptest
//! - Tracing initialisation for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use syncflow_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn relays_completions() {
//!     let engine = test_engine("test");
//!     let a = MemoryService::new("A");
//!     engine.register_service("A", a.clone());
//!     engine.register_rule(RuleBuilder::new("R").when("A", "run").then("A", "log").build())?;
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod kv;
pub mod logging;
pub mod rules;
pub mod services;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::kv::*;
    pub use crate::logging::*;
    pub use crate::rules::*;
    pub use crate::services::*;
}

pub use fixtures::*;
pub use generators::*;
pub use kv::*;
pub use logging::*;
pub use rules::*;
pub use services::*;
