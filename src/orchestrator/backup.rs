use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Inner, Job, Orchestrator};
use crate::errors::{BackupError, Result};
use crate::executor::{ExecutionContext, Executor, Operation};
use crate::notify::JobEvent;
use crate::service::ServiceInstance;
use crate::state::{OperationHandle, OperationKind, OperationState};
use crate::storage::{BackupArtifact, artifact_filename, artifact_key};

impl Orchestrator {
    /// Starts a backup of `service` and returns once the slot is reserved.
    ///
    /// Fails synchronously with `Unsupported` when no executor can back the
    /// service up, or `Busy` when another operation holds its slot.
    pub fn create_backup(&self, service: &Arc<ServiceInstance>) -> Result<Job> {
        let executor = self.inner.executors.get(service.service_type())?;
        if !executor.supports(Operation::Backup) {
            return Err(BackupError::Unsupported(format!(
                "{} executor cannot back up {}",
                executor.name(),
                service.key
            )));
        }

        let handle = self
            .inner
            .state
            .reserve(&service.key, OperationKind::Backup, None)?;
        let operation_id = handle.id();
        info!(service = %service.key, operation = %operation_id, "backup queued");

        let inner = Arc::clone(&self.inner);
        let task_service = Arc::clone(service);
        let task =
            tokio::spawn(async move { inner.run_backup(task_service, executor, handle).await });

        Ok(Job {
            key: service.key.clone(),
            operation_id,
            kind: OperationKind::Backup,
            handle: task,
            state: self.inner.state.clone(),
        })
    }
}

impl Inner {
    async fn run_backup(
        &self,
        service: Arc<ServiceInstance>,
        executor: Arc<dyn Executor>,
        handle: OperationHandle,
    ) -> OperationState {
        let key = service.key.clone();
        self.notify(JobEvent::BackupStarted, &key, None, None).await;

        let result = match self.acquire_permit().await {
            Ok(_permit) => {
                self.state.mark_running(&handle);
                let cancel = CancellationToken::new();
                self.bounded(
                    &service,
                    &cancel,
                    self.produce_backup(&service, executor.as_ref(), &cancel),
                )
                .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(artifact) => {
                let state = self.state.mark_succeeded(handle, &artifact.filename);
                info!(service = %key, key = %artifact.key, size = artifact.size, "backup succeeded");
                self.notify(JobEvent::BackupSucceeded, &key, Some(&artifact.filename), None)
                    .await;

                if let Err(err) = self
                    .retention
                    .enforce(&key, service.settings.retention, Some(&artifact.key))
                    .await
                {
                    warn!(service = %key, error = %err, "retention was not enforced");
                }
                state
            }
            Err(err) => {
                error!(service = %key, error = %err, "backup failed");
                let state = self.state.mark_failed(handle, &err);
                self.notify(JobEvent::BackupFailed, &key, None, Some(&err))
                    .await;
                state
            }
        }
    }

    async fn produce_backup(
        &self,
        service: &Arc<ServiceInstance>,
        executor: &dyn Executor,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact> {
        let ctx = ExecutionContext::new(Arc::clone(service), cancel.clone());
        let output = executor.backup(&ctx).await?;

        let filename = artifact_filename(service.name(), Utc::now(), &output.extension);
        let key = artifact_key(&service.key, &filename);
        info!(service = %service.key, %key, executor = executor.name(), "streaming backup to storage");
        self.catalog.put(&key, output.reader).await
    }
}
