//! JSON projections and status mapping for the REST surface.
//!
//! The HTTP server itself lives outside this crate; these types are what it
//! serialises.

use serde::Serialize;

use crate::errors::{BackupError, ErrorKind};
use crate::orchestrator::BackupRecord;
use crate::retention::RetentionPolicy;
use crate::service::ServiceInstance;
use crate::storage::BackupArtifact;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetentionView {
    pub days: i64,
    pub files: i64,
}

impl From<RetentionPolicy> for RetentionView {
    fn from(policy: RetentionPolicy) -> Self {
        Self {
            days: policy.days,
            files: policy.files,
        }
    }
}

/// Service descriptor without connection details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceView {
    pub name: String,
    #[serde(rename = "Type")]
    pub service_type: String,
    pub schedule: Option<String>,
    /// Seconds.
    pub timeout: u64,
    pub retention: RetentionView,
    #[serde(rename = "DirectS3")]
    pub direct_s3: bool,
}

impl From<&ServiceInstance> for ServiceView {
    fn from(service: &ServiceInstance) -> Self {
        Self {
            name: service.name().to_string(),
            service_type: service.service_type().to_string(),
            schedule: service.settings.schedule.clone(),
            timeout: service.settings.timeout.as_secs(),
            retention: service.settings.retention.into(),
            direct_s3: service.settings.direct_s3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupView {
    pub service: ServiceView,
    pub files: Vec<BackupArtifact>,
}

impl From<&BackupRecord> for BackupView {
    fn from(record: &BackupRecord) -> Self {
        Self {
            service: record.service.as_ref().into(),
            files: record.files.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Status code and body for a failed request.
pub fn error_response(err: &BackupError) -> (u16, ErrorBody) {
    (
        err.http_status(),
        ErrorBody {
            kind: err.kind(),
            message: err.to_string(),
        },
    )
}

/// `Content-Disposition` value for downloading `filename`.
pub fn content_disposition(filename: &str) -> String {
    let mut escaped = String::with_capacity(filename.len());
    for c in filename.chars() {
        match c {
            '"' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            c if c.is_control() => {}
            c => escaped.push(c),
        }
    }
    format!("attachment; filename=\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Binding, ServiceKey, ServiceType};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn backup_view_uses_pascal_case_fields() -> anyhow::Result<()> {
        let mut service = ServiceInstance::new(
            ServiceType::Mysql,
            "shop",
            Binding {
                password: Some("hunter2".into()),
                ..Default::default()
            },
        );
        service.settings.timeout = Duration::from_secs(600);
        service.settings.retention = RetentionPolicy { days: 7, files: 3 };

        let record = BackupRecord {
            service: Arc::new(service),
            files: vec![BackupArtifact {
                key: "mysql/shop/shop_20240101000000000.sql".into(),
                filepath: "mysql/shop".into(),
                filename: "shop_20240101000000000.sql".into(),
                size: 42,
                last_modified: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            }],
        };

        let value = serde_json::to_value(BackupView::from(&record))?;
        assert_eq!(
            value,
            json!({
                "Service": {
                    "Name": "shop",
                    "Type": "mysql",
                    "Schedule": null,
                    "Timeout": 600,
                    "Retention": { "Days": 7, "Files": 3 },
                    "DirectS3": false
                },
                "Files": [{
                    "Key": "mysql/shop/shop_20240101000000000.sql",
                    "Filepath": "mysql/shop",
                    "Filename": "shop_20240101000000000.sql",
                    "Size": 42,
                    "LastModified": "2024-01-01T00:00:00Z"
                }]
            })
        );
        assert!(!value.to_string().contains("hunter2"));
        Ok(())
    }

    #[test]
    fn errors_map_to_statuses() {
        let busy = BackupError::Busy(ServiceKey::new(ServiceType::Redis, "cache").to_string());
        let (status, body) = error_response(&busy);
        assert_eq!(status, 409);
        assert_eq!(body.kind, ErrorKind::Busy);

        assert_eq!(error_response(&BackupError::NotFound("x".into())).0, 404);
        assert_eq!(error_response(&BackupError::Unsupported("x".into())).0, 400);
        assert_eq!(error_response(&BackupError::storage("x")).0, 500);
    }

    #[test]
    fn content_disposition_quotes_filename() {
        assert_eq!(
            content_disposition("orders_1.dump"),
            "attachment; filename=\"orders_1.dump\""
        );
        assert_eq!(
            content_disposition("a\"b\\c\n.sql"),
            "attachment; filename=\"a\\\"b\\\\c.sql\""
        );
    }
}
