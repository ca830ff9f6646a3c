//! Per service type backup and restore mechanics.

mod mongodb;
mod mysql;
mod postgres;
pub(crate) mod process;
mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::BoxReader;
use crate::errors::{BackupError, Result};
use crate::service::{ServiceInstance, ServiceType};

pub use mongodb::MongoDbExecutor;
pub use mysql::MysqlExecutor;
pub use postgres::PostgresExecutor;
pub use redis::RedisExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Backup,
    Restore,
}

/// Everything an executor needs for one job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub service: Arc<ServiceInstance>,
    /// Cancelled when the job times out; executors stop their tools on it.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(service: Arc<ServiceInstance>, cancel: CancellationToken) -> Self {
        Self { service, cancel }
    }
}

pub struct BackupOutput {
    pub reader: BoxReader,
    /// Suggested file extension, without the leading dot.
    pub extension: String,
}

impl fmt::Debug for BackupOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupOutput")
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

/// Backup and restore strategy for one service type.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// The operations this executor implements. Must be free of side effects.
    fn supports(&self, operation: Operation) -> bool;

    /// Starts a backup and returns the stream of its output.
    ///
    /// A failure of the underlying tool surfaces as a read error on the
    /// stream, so a truncated dump is never mistaken for a complete one.
    async fn backup(&self, ctx: &ExecutionContext) -> Result<BackupOutput>;

    /// Restores from `reader`, consuming it completely.
    async fn restore(&self, ctx: &ExecutionContext, reader: BoxReader) -> Result<()>;
}

/// Maps service types to their executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ServiceType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tool based executors of every supported type.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(ServiceType::Postgres, Arc::new(PostgresExecutor))
            .with(ServiceType::Mysql, Arc::new(MysqlExecutor))
            .with(ServiceType::Mongodb, Arc::new(MongoDbExecutor))
            .with(ServiceType::Redis, Arc::new(RedisExecutor))
    }

    pub fn with(mut self, service_type: ServiceType, executor: Arc<dyn Executor>) -> Self {
        self.register(service_type, executor);
        self
    }

    pub fn register(&mut self, service_type: ServiceType, executor: Arc<dyn Executor>) {
        self.executors.insert(service_type, executor);
    }

    pub fn get(&self, service_type: ServiceType) -> Result<Arc<dyn Executor>> {
        self.executors.get(&service_type).cloned().ok_or_else(|| {
            BackupError::Unsupported(format!("no executor registered for {service_type}"))
        })
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .executors
            .iter()
            .map(|(t, e)| format!("{t}={}", e.name()))
            .collect();
        names.sort();
        f.debug_tuple("ExecutorRegistry").field(&names).finish()
    }
}
