//! In-memory tracking of the current or last operation per service.
//!
//! The map lives for the lifetime of the process; nothing is persisted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::errors::{BackupError, ErrorKind, Result};
use crate::service::ServiceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    /// Queued and running operations hold the service's single-flight slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Cause of a failed operation, kept so callers can tell a timeout from an
/// execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BackupError> for OperationError {
    fn from(err: &BackupError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationState {
    pub operation_id: Option<Uuid>,
    pub kind: Option<OperationKind>,
    pub phase: Phase,
    /// Artifact produced by a backup, or the one being restored.
    pub artifact: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<OperationError>,
}

impl OperationState {
    pub fn idle() -> Self {
        Self {
            operation_id: None,
            kind: None,
            phase: Phase::Idle,
            artifact: None,
            queued_at: None,
            started_at: None,
            ended_at: None,
            last_error: None,
        }
    }
}

type StateMap = HashMap<ServiceKey, OperationState>;

/// Process-wide operation state, shared by cloning.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    states: Arc<Mutex<StateMap>>,
}

/// Proof of a successful reservation.
///
/// Terminal transitions consume the handle. Dropping it before that marks
/// the operation failed so a service can never stay stuck in `running`.
#[derive(Debug)]
pub struct OperationHandle {
    states: Arc<Mutex<StateMap>>,
    key: ServiceKey,
    id: Uuid,
    kind: OperationKind,
    settled: bool,
}

impl OperationHandle {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let abandoned = OperationError {
            kind: ErrorKind::Execution,
            message: "operation was abandoned before completion".into(),
        };
        transition(&self.states, &self.key, self.id, &[Phase::Queued, Phase::Running], |state| {
            state.phase = Phase::Failed;
            state.ended_at = Some(Utc::now());
            state.last_error = Some(abandoned);
        });
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims the single-flight slot of `key`.
    pub fn reserve(
        &self,
        key: &ServiceKey,
        kind: OperationKind,
        artifact: Option<String>,
    ) -> Result<OperationHandle> {
        let mut states = self.states.lock();
        if states.get(key).is_some_and(|s| s.phase.is_active()) {
            return Err(BackupError::Busy(key.to_string()));
        }

        let id = Uuid::new_v4();
        states.insert(
            key.clone(),
            OperationState {
                operation_id: Some(id),
                kind: Some(kind),
                phase: Phase::Queued,
                artifact,
                queued_at: Some(Utc::now()),
                started_at: None,
                ended_at: None,
                last_error: None,
            },
        );

        Ok(OperationHandle {
            states: Arc::clone(&self.states),
            key: key.clone(),
            id,
            kind,
            settled: false,
        })
    }

    pub fn mark_running(&self, handle: &OperationHandle) {
        transition(&self.states, &handle.key, handle.id, &[Phase::Queued], |state| {
            state.phase = Phase::Running;
            state.started_at = Some(Utc::now());
        });
    }

    /// Returns the terminal state, copied under the lock.
    pub fn mark_succeeded(&self, mut handle: OperationHandle, artifact: &str) -> OperationState {
        handle.settled = true;
        transition(&self.states, &handle.key, handle.id, &[Phase::Running], |state| {
            state.phase = Phase::Succeeded;
            state.ended_at = Some(Utc::now());
            state.artifact = Some(artifact.to_string());
        })
    }

    pub fn mark_failed(&self, mut handle: OperationHandle, err: &BackupError) -> OperationState {
        handle.settled = true;
        transition(
            &self.states,
            &handle.key,
            handle.id,
            &[Phase::Queued, Phase::Running],
            |state| {
                state.phase = Phase::Failed;
                state.ended_at = Some(Utc::now());
                state.last_error = Some(err.into());
            },
        )
    }

    pub fn query(&self, key: &ServiceKey) -> OperationState {
        self.states
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(OperationState::idle)
    }

    /// Copy of every known state, ordered by service key.
    pub fn snapshot(&self) -> Vec<(ServiceKey, OperationState)> {
        let mut all: Vec<_> = self
            .states
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

fn transition(
    states: &Mutex<StateMap>,
    key: &ServiceKey,
    id: Uuid,
    from: &[Phase],
    apply: impl FnOnce(&mut OperationState),
) -> OperationState {
    let mut states = states.lock();
    match states.get_mut(key) {
        Some(state) if state.operation_id == Some(id) && from.contains(&state.phase) => {
            apply(state);
            state.clone()
        }
        current => {
            let phase = current.as_ref().map(|s| s.phase);
            error!(service = %key, operation = %id, ?phase, expected = ?from, "illegal operation state transition");
            debug_assert!(false, "illegal transition for {key}: {phase:?} not in {from:?}");
            current.map(|s| s.clone()).unwrap_or_else(OperationState::idle)
        }
    }
}
