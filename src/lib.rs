//! # Analytics Validator
//!
//! Scheduled batch validator that navigates to a set of properties in
//! headless Chrome, captures analytics/tag-manager network traffic, and
//! produces a pass/fail verdict per property with a screenshot for
//! evidence. Built around a Two-Phase Scheduler: a fast first pass across
//! all properties, then a slower second pass — with a longer per-property
//! timeout — restricted to properties that didn't resolve in time.
//!
//! ## Architecture
//!
//! - [`property_source`] reads the set of properties to validate.
//! - [`browser_pool`] maintains a fixed pool of headless Chrome instances.
//! - [`capture`] installs the network-event capture layers on a page.
//! - [`detection`] turns captured network events into structured facts.
//! - [`validator`] turns those facts plus a page snapshot into a [`model::Verdict`].
//! - [`scheduler`] runs the Two-Phase Scheduler across a batch of properties.
//! - [`cache`] holds verdicts/screenshots for a run until upload.
//! - [`upload`] drains the cache into the datastore and object store.
//! - [`retry_queue`] resolves properties that failed Phase 2, on its own schedule.
//! - [`coordinator`] owns a run's lifecycle end to end.
//!
//! ## CLI usage
//!
//! ```bash
//! analytics-validator run --config config.json
//! analytics-validator retry
//! analytics-validator validate-config --config config.json
//! analytics-validator health
//! ```

/// Configuration management with serde serialization/deserialization
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// Data model shared across the pipeline
pub mod model;

/// Read-only provider of validation targets
pub mod property_source;

/// Network event capture layers installed on a page
pub mod capture;

/// Pure functions turning captured network events into structured facts
pub mod detection;

/// Verdict construction from page facts
pub mod validator;

/// In-process store of verdicts/screenshots for a running run
pub mod cache;

/// The Two-Phase Scheduler
pub mod scheduler;

/// SQLite realization of the datastore contract
pub mod datastore;

/// Batch Uploader: drains the Temp Cache to the datastore/object store
pub mod upload;

/// Retry Queue Processor
pub mod retry_queue;

/// Run Coordinator: owns a run's lifecycle end to end
pub mod coordinator;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Health checking system for browser instances and backlog
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use browser_pool::*;
pub use cache::TempCache;
pub use cli::*;
pub use config::*;
pub use coordinator::{RunCoordinator, RunLock};
pub use error::*;
pub use health::*;
pub use metrics::*;
pub use model::*;
pub use retry_queue::RetryQueueProcessor;
pub use scheduler::{ProgressEvent, SchedulerOutput, TwoPhaseScheduler};
pub use upload::BatchUploader;
pub use utils::*;
