//! # Dataman Core
//!
//! Coordination layer for an archive of dataset files that several
//! in-process actors read and rewrite concurrently.
//!
//! ## Overview
//!
//! - [`lock`]: reference-counted read/write locks, one per resource key,
//!   created on demand and discarded once unreferenced.
//! - [`executor`]: per-key serial execution of commands on a bounded pool.
//!   Commands sharing a key run one at a time in submission order; commands
//!   for different keys run in parallel.
//! - [`watermark`]: a durable, monotonic "last processed" timestamp used to
//!   resume scanning after a restart.
//! - [`cache`]: a bounded LRU of parsed dataset metadata that follows
//!   directory change batches and notifies listeners.
//! - [`service`]: builds all of the above from a [`config::DatamanConfig`].
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dataman_core::{
//!     cache::{DatasetPatch, MetadataExtractor, QaState},
//!     config::DatamanConfig,
//!     service::DatasetServices,
//! };
//!
//! async fn mark_passed(
//!     extractor: Arc<dyn MetadataExtractor>,
//! ) -> dataman_core::Result<()> {
//!     let services = DatasetServices::new(DatamanConfig::default(), extractor)?;
//!     services.start()?;
//!     services.submit_update(
//!         "N20060627S0003.fits",
//!         DatasetPatch::qa_state(QaState::Pass),
//!     );
//!     services.stop();
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Bounded metadata cache driven by directory changes
pub mod cache;

/// Runtime configuration
pub mod config;

/// Error types shared by every component
pub mod error;

/// Per-key serial command execution
pub mod executor;

/// Keyed reference-counted read/write locks
pub mod lock;

/// Process-level wiring of the components
pub mod service;

/// Durable monotonic watermark
pub mod watermark;

pub use error::{DatamanError, Result};
