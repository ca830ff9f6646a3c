//! Job lifecycle notifications.
//!
//! Delivery to chat or webhook endpoints lives outside this crate; it plugs
//! in by implementing [`Notifier`].

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::service::ServiceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobEvent {
    BackupStarted,
    BackupSucceeded,
    BackupFailed,
    RestoreStarted,
    RestoreSucceeded,
    RestoreFailed,
}

impl JobEvent {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::BackupFailed | Self::RestoreFailed)
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BackupStarted => "backup-started",
            Self::BackupSucceeded => "backup-success",
            Self::BackupFailed => "backup-failed",
            Self::RestoreStarted => "restore-started",
            Self::RestoreSucceeded => "restore-success",
            Self::RestoreFailed => "restore-failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub event: JobEvent,
    pub service: ServiceKey,
    pub artifact: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification. Implementations must not fail the job, so
    /// delivery errors are theirs to log.
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) {
        let artifact = n.artifact.as_deref().unwrap_or("-");
        if n.event.is_failure() {
            error!(event = %n.event, service = %n.service, artifact, error = n.error.as_deref().unwrap_or(""), "job notification");
        } else {
            info!(event = %n.event, service = %n.service, artifact, "job notification");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Collects notifications for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub received: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn events(&self) -> Vec<JobEvent> {
            self.received.lock().iter().map(|n| n.event).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) {
            self.received.lock().push(notification);
        }
    }
}
