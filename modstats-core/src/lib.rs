//! # modstats-core
//!
//! Core library for modstats - an opt-in anonymous device stats reporter.
//!
//! This library provides:
//! - The reporting state machine and its consent/check-in rules
//! - A durable consent store with an injectable backing store
//! - One-shot HTTP report submission
//! - External event dispatch (boot, shutdown, connectivity)
//! - Configuration management and logging infrastructure
//!
//! ## Reporting rules
//!
//! A report attempt is permitted iff the user has opted in and no successful
//! submission has happened since the last boot or shutdown event. At most one
//! submission is in flight per process at any instant.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modstats_core::{
//!     Config, ConsentStore, DeviceEvent, EventDispatcher, HttpReporter,
//!     ReportingStateMachine, SqliteBackend, SystemIdentity,
//! };
//! use modstats_core::machine::ConsentPrompt;
//!
//! struct LogPrompt;
//! impl ConsentPrompt for LogPrompt {
//!     fn prompt_consent(&self) {
//!         tracing::info!("consent required");
//!     }
//! }
//!
//! # async fn run() -> modstats_core::Result<()> {
//! let config = Config::load()?;
//! let mut store = ConsentStore::new(Box::new(SqliteBackend::open(&Config::prefs_path())?));
//! let install_id = store.install_id()?;
//!
//! let machine = ReportingStateMachine::new(
//!     store,
//!     Arc::new(SystemIdentity::new(config.identity.clone(), &install_id)),
//!     Arc::new(HttpReporter::new(&config.report)?),
//!     Arc::new(LogPrompt),
//! );
//!
//! let dispatcher = EventDispatcher::new(machine);
//! dispatcher.dispatch(DeviceEvent::BootCompleted)?;
//! dispatcher.wait_idle().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use dispatch::{DeviceEvent, EventDispatcher};
pub use error::{Error, Result};
pub use identity::{DeviceRecord, IdentitySource, SystemIdentity};
pub use machine::{Phase, ReportingStateMachine, TriggerOutcome};
pub use reporter::{HttpReporter, ReportOutcome, Reporter};
pub use store::{ConsentStore, MemoryBackend, SqliteBackend, StoreBackend};

// Public modules
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod logging;
pub mod machine;
pub mod reporter;
pub mod store;
