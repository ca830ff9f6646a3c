//! Job orchestration: validates requests, claims the per-service slot and
//! drives executors against the catalog.
//!
//! Backup and restore run as detached tokio tasks. The caller gets a [`Job`]
//! back as soon as the slot is reserved; errors inside the task are recorded
//! in the state store and never escape it.

mod backup;
mod restore;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::BoxReader;
use crate::errors::{BackupError, ErrorKind, Result};
use crate::executor::ExecutorRegistry;
use crate::notify::{JobEvent, LogNotifier, Notification, Notifier};
use crate::retention::RetentionEnforcer;
use crate::service::{ServiceInstance, ServiceKey, ServiceRegistry, ServiceType, validate_identifier};
use crate::state::{OperationError, OperationKind, OperationState, Phase, StateStore};
use crate::storage::{BackupArtifact, Catalog, artifact_key, service_prefix};

/// A service paired with its artifacts, most recent first.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub service: Arc<ServiceInstance>,
    pub files: Vec<BackupArtifact>,
}

/// Acknowledgement of an accepted backup or restore.
///
/// Dropping it leaves the job running.
#[derive(Debug)]
pub struct Job {
    key: ServiceKey,
    operation_id: Uuid,
    kind: OperationKind,
    handle: JoinHandle<OperationState>,
    state: StateStore,
}

impl Job {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Waits for the job to finish and returns the state it ended in.
    pub async fn wait(self) -> OperationState {
        match self.handle.await {
            Ok(state) => state,
            Err(err) => {
                error!(service = %self.key, operation = %self.operation_id, error = %err, "job task did not complete");
                let state = self.state.query(&self.key);
                if state.operation_id == Some(self.operation_id) {
                    return state;
                }
                // the slot was already taken again, report this job's failure
                OperationState {
                    operation_id: Some(self.operation_id),
                    kind: Some(self.kind),
                    phase: Phase::Failed,
                    last_error: Some(OperationError {
                        kind: ErrorKind::Execution,
                        message: err.to_string(),
                    }),
                    ..OperationState::idle()
                }
            }
        }
    }
}

struct Inner {
    services: ServiceRegistry,
    executors: ExecutorRegistry,
    catalog: Arc<Catalog>,
    retention: RetentionEnforcer,
    state: StateStore,
    notifier: Arc<dyn Notifier>,
    permits: Option<Arc<Semaphore>>,
    disable_restore: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    services: ServiceRegistry,
    catalog: Arc<Catalog>,
    executors: ExecutorRegistry,
    notifier: Arc<dyn Notifier>,
    max_concurrent_jobs: Option<usize>,
    disable_restore: bool,
}

impl OrchestratorBuilder {
    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Caps jobs running at once across all services. `None` or zero means
    /// unbounded.
    pub fn max_concurrent_jobs(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_jobs = limit.filter(|n| *n > 0);
        self
    }

    pub fn disable_restore(mut self, disabled: bool) -> Self {
        self.disable_restore = disabled;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(Inner {
                services: self.services,
                executors: self.executors,
                retention: RetentionEnforcer::new(Arc::clone(&self.catalog)),
                catalog: self.catalog,
                state: StateStore::new(),
                notifier: self.notifier,
                permits: self
                    .max_concurrent_jobs
                    .map(|n| Arc::new(Semaphore::new(n))),
                disable_restore: self.disable_restore,
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder(services: ServiceRegistry, catalog: Arc<Catalog>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            services,
            catalog,
            executors: ExecutorRegistry::with_defaults(),
            notifier: Arc::new(LogNotifier),
            max_concurrent_jobs: None,
            disable_restore: false,
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn status(&self, service: &ServiceKey) -> OperationState {
        self.inner.state.query(service)
    }

    pub async fn list_backups(&self, service: &Arc<ServiceInstance>) -> Result<BackupRecord> {
        let files = self.inner.catalog.list(&service_prefix(&service.key)).await?;
        Ok(BackupRecord {
            service: Arc::clone(service),
            files,
        })
    }

    /// Records of every configured service matching the optional filters.
    ///
    /// A name filter that matches nothing is reported as not found.
    pub async fn get_backups(
        &self,
        service_type: Option<&str>,
        service_name: Option<&str>,
    ) -> Result<Vec<BackupRecord>> {
        let service_type = service_type
            .filter(|t| !t.is_empty())
            .map(str::parse::<ServiceType>)
            .transpose()?;
        let service_name = service_name.filter(|n| !n.is_empty());

        let services = self.inner.services.filter(service_type, service_name);
        if let Some(name) = service_name.filter(|_| services.is_empty()) {
            return Err(BackupError::NotFound(format!("service {name}")));
        }

        let mut records = Vec::with_capacity(services.len());
        for service in &services {
            records.push(self.list_backups(service).await?);
        }
        Ok(records)
    }

    /// The record of `service` narrowed to one artifact.
    pub async fn get_backup(
        &self,
        service: &Arc<ServiceInstance>,
        filename: &str,
    ) -> Result<BackupRecord> {
        validate_identifier("filename", filename)?;
        let mut record = self.list_backups(service).await?;
        record.files.retain(|f| f.filename == filename);
        if record.files.is_empty() {
            return Err(BackupError::NotFound(artifact_key(&service.key, filename)));
        }
        Ok(record)
    }

    /// Deletes one artifact directly, without reserving the service.
    pub async fn delete_backup(&self, service: &ServiceInstance, filename: &str) -> Result<()> {
        validate_identifier("filename", filename)?;
        self.inner
            .catalog
            .delete(&artifact_key(&service.key, filename))
            .await
    }

    /// Opens one artifact for download, decrypted if the catalog encrypts.
    pub async fn read_backup(&self, service: &ServiceInstance, filename: &str) -> Result<BoxReader> {
        validate_identifier("filename", filename)?;
        self.inner
            .catalog
            .get(&artifact_key(&service.key, filename))
            .await
    }
}

impl Inner {
    async fn notify(
        &self,
        event: JobEvent,
        service: &ServiceKey,
        artifact: Option<&str>,
        error: Option<&BackupError>,
    ) {
        self.notifier
            .notify(Notification {
                event,
                service: service.clone(),
                artifact: artifact.map(str::to_string),
                error: error.map(ToString::to_string),
            })
            .await;
    }

    /// Waits for a pool slot. The job stays queued meanwhile.
    async fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.permits {
            Some(permits) => Arc::clone(permits)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|err| BackupError::execution_with("worker pool is closed", err)),
            None => Ok(None),
        }
    }

    /// Runs `work` under the service's timeout. On expiry `cancel` fires and
    /// `work` is dropped, which stops any tool it spawned.
    async fn bounded<T>(
        &self,
        service: &ServiceInstance,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = service.settings.timeout;
        tokio::select! {
            result = work => result,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                warn!(service = %service.key, timeout_secs = timeout.as_secs(), "job timed out");
                Err(BackupError::Timeout(timeout))
            }
        }
    }
}
