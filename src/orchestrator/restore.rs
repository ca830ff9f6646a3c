use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Inner, Job, Orchestrator};
use crate::errors::{BackupError, Result};
use crate::executor::{ExecutionContext, Executor, Operation};
use crate::notify::JobEvent;
use crate::service::{ServiceInstance, validate_identifier};
use crate::state::{OperationHandle, OperationKind, OperationState};
use crate::storage::artifact_key;

impl Orchestrator {
    /// Starts restoring `filename` into `service`.
    ///
    /// Unsupported restores are rejected before any state is touched.
    pub fn restore_backup(&self, service: &Arc<ServiceInstance>, filename: &str) -> Result<Job> {
        validate_identifier("filename", filename)?;
        if self.inner.disable_restore {
            return Err(BackupError::Unsupported(
                "restore is disabled by configuration".into(),
            ));
        }

        let executor = self.inner.executors.get(service.service_type())?;
        if !executor.supports(Operation::Restore) {
            return Err(BackupError::Unsupported(format!(
                "{} executor cannot restore {}",
                executor.name(),
                service.key
            )));
        }

        let handle = self.inner.state.reserve(
            &service.key,
            OperationKind::Restore,
            Some(filename.to_string()),
        )?;
        let operation_id = handle.id();
        info!(service = %service.key, operation = %operation_id, %filename, "restore queued");

        let inner = Arc::clone(&self.inner);
        let task_service = Arc::clone(service);
        let filename = filename.to_string();
        let task = tokio::spawn(async move {
            inner
                .run_restore(task_service, executor, handle, filename)
                .await
        });

        Ok(Job {
            key: service.key.clone(),
            operation_id,
            kind: OperationKind::Restore,
            handle: task,
            state: self.inner.state.clone(),
        })
    }
}

impl Inner {
    async fn run_restore(
        &self,
        service: Arc<ServiceInstance>,
        executor: Arc<dyn Executor>,
        handle: OperationHandle,
        filename: String,
    ) -> OperationState {
        let key = service.key.clone();
        self.notify(JobEvent::RestoreStarted, &key, Some(&filename), None)
            .await;

        let result = match self.acquire_permit().await {
            Ok(_permit) => {
                self.state.mark_running(&handle);
                let cancel = CancellationToken::new();
                let work = async {
                    let reader = self.catalog.get(&artifact_key(&key, &filename)).await?;
                    let ctx = ExecutionContext::new(Arc::clone(&service), cancel.clone());
                    executor.restore(&ctx, reader).await
                };
                self.bounded(&service, &cancel, work).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                info!(service = %key, %filename, "restore succeeded");
                let state = self.state.mark_succeeded(handle, &filename);
                self.notify(JobEvent::RestoreSucceeded, &key, Some(&filename), None)
                    .await;
                state
            }
            Err(err) => {
                error!(service = %key, %filename, error = %err, "restore failed");
                let state = self.state.mark_failed(handle, &err);
                self.notify(JobEvent::RestoreFailed, &key, Some(&filename), Some(&err))
                    .await;
                state
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::executor::testing::{Script, ScriptedExecutor};
    use crate::orchestrator::testing::{HarnessOptions, harness, harness_with};
    use crate::state::Phase;
    use crate::storage::EncryptionKey;

    const FILE: &str = "orders_20240101000000000.bin";

    #[tokio::test]
    async fn restore_feeds_artifact_to_executor() -> anyhow::Result<()> {
        let h = harness(ScriptedExecutor::new(Script::Succeed(vec![])));
        h.backend.insert(&format!("postgres/orders/{FILE}"), "rows", Utc::now());

        let job = h.orchestrator.restore_backup(&h.service, FILE)?;
        assert_eq!(job.kind(), OperationKind::Restore);
        let state = job.wait().await;

        assert_eq!(state.phase, Phase::Succeeded);
        assert_eq!(state.artifact.as_deref(), Some(FILE));
        assert_eq!(*h.executor.restored.lock(), vec![b"rows".to_vec()]);
        assert_eq!(
            h.notifier.events(),
            [JobEvent::RestoreStarted, JobEvent::RestoreSucceeded]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_restore_leaves_state_untouched() {
        let h = harness(ScriptedExecutor::backup_only(Script::Succeed(vec![])));
        h.backend.insert(&format!("postgres/orders/{FILE}"), "rows", Utc::now());

        let err = h.orchestrator.restore_backup(&h.service, FILE).err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Unsupported));
        assert_eq!(h.orchestrator.status(&h.service.key).phase, Phase::Idle);
        assert_eq!(h.executor.calls(), 0);
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn disabled_restore_is_rejected() {
        let h = harness_with(
            ScriptedExecutor::new(Script::Succeed(vec![])),
            HarnessOptions {
                disable_restore: true,
                ..Default::default()
            },
        );
        let err = h.orchestrator.restore_backup(&h.service, FILE).err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Unsupported));
        assert_eq!(h.orchestrator.status(&h.service.key).phase, Phase::Idle);
    }

    #[tokio::test]
    async fn missing_artifact_fails_the_job() -> anyhow::Result<()> {
        let h = harness(ScriptedExecutor::new(Script::Succeed(vec![])));

        let state = h.orchestrator.restore_backup(&h.service, FILE)?.wait().await;
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::NotFound));
        assert_eq!(h.executor.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn executor_failure_is_recorded() -> anyhow::Result<()> {
        let h = harness(ScriptedExecutor::new(Script::Fail("psql: connection refused".into())));
        h.backend.insert(&format!("postgres/orders/{FILE}"), "rows", Utc::now());

        let state = h.orchestrator.restore_backup(&h.service, FILE)?.wait().await;
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::Execution));
        assert_eq!(
            h.notifier.events(),
            [JobEvent::RestoreStarted, JobEvent::RestoreFailed]
        );
        Ok(())
    }

    #[tokio::test]
    async fn backup_then_restore_with_encryption() -> anyhow::Result<()> {
        let h = harness_with(
            ScriptedExecutor::new(Script::Succeed(b"full dump".to_vec())),
            HarnessOptions {
                encryption: Some(EncryptionKey::from_passphrase("passphrase")),
                ..Default::default()
            },
        );

        let backup = h.orchestrator.create_backup(&h.service)?.wait().await;
        let filename = backup.artifact.expect("artifact recorded");

        let restore = h
            .orchestrator
            .restore_backup(&h.service, &filename)?
            .wait()
            .await;
        assert_eq!(restore.phase, Phase::Succeeded);
        assert_eq!(*h.executor.restored.lock(), vec![b"full dump".to_vec()]);
        Ok(())
    }
}
