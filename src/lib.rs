//! Backup and restore orchestration for platform-bound services.
//!
//! Requests go through the [`Orchestrator`], which holds a single-flight slot
//! per service in the [`StateStore`], runs the service type's [`Executor`]
//! and streams artifacts through the object storage [`Catalog`].

pub mod api;
pub mod config;
pub mod errors;
pub mod executor;
pub mod logger;
pub mod notify;
pub mod orchestrator;
pub mod retention;
pub mod service;
pub mod state;
pub mod storage;

use std::pin::Pin;

use tokio::io::AsyncRead;

/// Owned byte stream passed between executors and storage.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

pub use errors::{BackupError, ErrorKind, Result};
pub use executor::{Executor, ExecutorRegistry};
pub use orchestrator::{BackupRecord, Job, Orchestrator};
pub use service::{ServiceInstance, ServiceKey, ServiceRegistry, ServiceType};
pub use state::{OperationState, Phase, StateStore};
pub use storage::Catalog;
