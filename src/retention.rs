//! Retention of backup artifacts.
//!
//! An artifact is kept when it is among the `files` most recent artifacts
//! of its service, or when it is at most `days` old. Only artifacts failing
//! both bounds are deleted. A bound `<= 0` is disabled.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::errors::Result;
use crate::service::ServiceKey;
use crate::storage::{BackupArtifact, Catalog, service_prefix};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum age in days.
    #[serde(default)]
    pub days: i64,
    /// Maximum number of files.
    #[serde(default)]
    pub files: i64,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.days <= 0 && self.files <= 0
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: Vec<BackupArtifact>,
    pub delete: Vec<BackupArtifact>,
}

/// Splits `artifacts` into the ones to keep and the ones to delete.
///
/// `protected` names a key that is kept regardless of the policy.
pub fn plan(
    artifacts: &[BackupArtifact],
    policy: RetentionPolicy,
    now: DateTime<Utc>,
    protected: Option<&str>,
) -> RetentionPlan {
    if policy.is_unbounded() {
        return RetentionPlan {
            keep: artifacts.to_vec(),
            delete: Vec::new(),
        };
    }

    let mut sorted = artifacts.to_vec();
    sorted.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    let max_files = usize::try_from(policy.files).unwrap_or(0);
    let max_age = (policy.days > 0).then(|| Duration::days(policy.days));

    let (keep, delete): (Vec<_>, Vec<_>) = sorted.into_iter().enumerate().partition(|(rank, artifact)| {
        let within_count = *rank < max_files;
        let within_age = max_age.is_some_and(|age| now - artifact.last_modified <= age);
        let is_protected = protected == Some(artifact.key.as_str());
        within_count || within_age || is_protected
    });

    let strip = |v: Vec<(usize, BackupArtifact)>| -> Vec<BackupArtifact> {
        v.into_iter().map(|(_, a)| a).collect()
    };
    RetentionPlan {
        keep: strip(keep),
        delete: strip(delete),
    }
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Applies retention policies against the catalog.
#[derive(Clone)]
pub struct RetentionEnforcer {
    catalog: Arc<Catalog>,
}

impl RetentionEnforcer {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Deletes the artifacts of `service` that fall outside `policy`.
    ///
    /// Deletion is best effort: a failed delete is logged and the remaining
    /// artifacts are still processed.
    pub async fn enforce(
        &self,
        service: &ServiceKey,
        policy: RetentionPolicy,
        protected: Option<&str>,
    ) -> Result<RetentionReport> {
        if policy.is_unbounded() {
            return Ok(RetentionReport::default());
        }

        let artifacts = self.catalog.list(&service_prefix(service)).await?;
        let plan = plan(&artifacts, policy, Utc::now(), protected);

        let mut report = RetentionReport {
            kept: plan.keep.len(),
            ..Default::default()
        };
        for artifact in plan.delete {
            match self.catalog.delete(&artifact.key).await {
                Ok(()) => report.deleted.push(artifact.key),
                Err(err) => {
                    error!(service = %service, key = %artifact.key, error = %err, "could not delete expired artifact");
                    report.failed.push(artifact.key);
                }
            }
        }

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                service = %service,
                kept = report.kept,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "enforced retention"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxReader;
    use crate::errors::BackupError;
    use crate::service::ServiceType;
    use crate::storage::{MemoryBackend, ObjectBackend, ObjectMeta};
    use async_trait::async_trait;

    fn aged(now: DateTime<Utc>, days: &[i64]) -> Vec<BackupArtifact> {
        days.iter()
            .map(|d| BackupArtifact {
                key: format!("postgres/orders/orders_{d}.dump"),
                filepath: "postgres/orders".into(),
                filename: format!("orders_{d}.dump"),
                size: 1,
                last_modified: now - Duration::days(*d) - Duration::minutes(1),
            })
            .collect()
    }

    fn ages(artifacts: &[BackupArtifact], now: DateTime<Utc>) -> Vec<i64> {
        artifacts
            .iter()
            .map(|a| (now - a.last_modified).num_days())
            .collect()
    }

    #[test]
    fn union_of_count_and_age_bounds() {
        let now = Utc::now();
        let artifacts = aged(now, &[0, 1, 8, 9, 10]);
        let plan = plan(&artifacts, RetentionPolicy { days: 7, files: 3 }, now, None);
        assert_eq!(ages(&plan.keep, now), [0, 1, 8]);
        assert_eq!(ages(&plan.delete, now), [9, 10]);
    }

    #[test]
    fn age_bound_keeps_beyond_the_count() {
        let now = Utc::now();
        let artifacts = aged(now, &[0, 1, 2, 3, 20]);
        let plan = plan(&artifacts, RetentionPolicy { days: 7, files: 2 }, now, None);
        assert_eq!(ages(&plan.keep, now), [0, 1, 2, 3]);
        assert_eq!(ages(&plan.delete, now), [20]);
    }

    #[test]
    fn disabled_bounds() {
        let now = Utc::now();
        let artifacts = aged(now, &[0, 5, 40]);

        let none = plan(&artifacts, RetentionPolicy::default(), now, None);
        assert!(none.delete.is_empty());

        let files_only = plan(&artifacts, RetentionPolicy { days: 0, files: 1 }, now, None);
        assert_eq!(ages(&files_only.delete, now), [5, 40]);

        let days_only = plan(&artifacts, RetentionPolicy { days: 10, files: -1 }, now, None);
        assert_eq!(ages(&days_only.delete, now), [40]);
    }

    #[test]
    fn protected_key_survives() {
        let now = Utc::now();
        let artifacts = aged(now, &[30, 31]);
        let protected = artifacts[1].key.clone();
        let plan = plan(
            &artifacts,
            RetentionPolicy { days: 1, files: 0 },
            now,
            Some(&protected),
        );
        assert_eq!(plan.keep.len(), 1);
        assert_eq!(plan.keep[0].key, protected);
    }

    struct FlakyBackend {
        inner: MemoryBackend,
        broken_key: String,
    }

    #[async_trait]
    impl ObjectBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn list(&self, prefix: &str) -> crate::errors::Result<Vec<ObjectMeta>> {
            self.inner.list(prefix).await
        }

        async fn get(&self, key: &str) -> crate::errors::Result<BoxReader> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, body: BoxReader) -> crate::errors::Result<ObjectMeta> {
            self.inner.put(key, body).await
        }

        async fn delete(&self, key: &str) -> crate::errors::Result<()> {
            if key == self.broken_key {
                return Err(BackupError::storage("backend unavailable"));
            }
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn failed_delete_does_not_stop_the_others() -> anyhow::Result<()> {
        let now = Utc::now();
        let backend = FlakyBackend {
            inner: MemoryBackend::new(),
            broken_key: "postgres/orders/orders_9.dump".into(),
        };
        for artifact in aged(now, &[0, 9, 10, 11]) {
            backend.inner.insert(&artifact.key, "x", artifact.last_modified);
        }
        let backend = Arc::new(backend);
        let enforcer = RetentionEnforcer::new(Arc::new(Catalog::new(backend.clone(), None)));
        let service = ServiceKey::new(ServiceType::Postgres, "orders");

        let report = enforcer
            .enforce(&service, RetentionPolicy { days: 1, files: 1 }, None)
            .await?;

        assert_eq!(report.kept, 1);
        assert_eq!(report.failed, ["postgres/orders/orders_9.dump"]);
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(backend.inner.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unbounded_policy_touches_nothing() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("redis/cache/cache_1.rdb", "x", Utc::now() - Duration::days(400));
        let enforcer = RetentionEnforcer::new(Arc::new(Catalog::new(backend.clone(), None)));

        let report = enforcer
            .enforce(
                &ServiceKey::new(ServiceType::Redis, "cache"),
                RetentionPolicy::default(),
                None,
            )
            .await?;
        assert!(report.deleted.is_empty());
        assert_eq!(backend.len(), 1);
        Ok(())
    }
}
