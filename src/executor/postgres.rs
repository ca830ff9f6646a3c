// service-backup/src/executor/postgres.rs
use async_trait::async_trait;
use tracing::info;

use super::process::Invocation;
use super::{BackupOutput, ExecutionContext, Executor, Operation};
use crate::BoxReader;
use crate::errors::{BackupError, Result};
use crate::service::{Connection, ServiceInstance};

/// Backs up PostgreSQL databases with `pg_dump` in custom format and
/// restores them with `pg_restore`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresExecutor;

fn connection(service: &ServiceInstance) -> Result<(Connection, String)> {
    let conn = service.binding.connection()?;
    let database = conn.database.clone().ok_or_else(|| {
        BackupError::Validation(format!("postgres binding of {} has no database", service.key))
    })?;
    Ok((conn, database))
}

fn with_pg_env(invocation: Invocation, conn: &Connection, database: &str) -> Invocation {
    let port = conn.port.map(|p| p.to_string());
    invocation
        .env("PGHOST", Some(&conn.host))
        .env("PGPORT", port.as_deref())
        .env("PGUSER", conn.username.as_deref())
        .env("PGPASSWORD", conn.password.as_deref())
        .env("PGDATABASE", Some(database))
}

pub(crate) fn dump_invocation(service: &ServiceInstance) -> Result<Invocation> {
    let (conn, database) = connection(service)?;
    let options = &service.settings.executor;
    let invocation = Invocation::new("pg_dump")
        .args(["--format=custom", "--no-owner", "--no-privileges"])
        .args(
            options
                .ignore_tables
                .iter()
                .map(|table| format!("--exclude-table={table}")),
        )
        .args(&options.backup_options);
    Ok(with_pg_env(invocation, &conn, &database))
}

pub(crate) fn restore_invocation(service: &ServiceInstance) -> Result<Invocation> {
    let (conn, database) = connection(service)?;
    let invocation = Invocation::new("pg_restore")
        .args(["--clean", "--if-exists", "--no-owner", "--no-privileges"])
        .arg(format!("--dbname={database}"))
        .args(&service.settings.executor.restore_options);
    Ok(with_pg_env(invocation, &conn, &database))
}

#[async_trait]
impl Executor for PostgresExecutor {
    fn name(&self) -> &'static str {
        "pg_dump"
    }

    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    async fn backup(&self, ctx: &ExecutionContext) -> Result<BackupOutput> {
        info!(service = %ctx.service.key, "dumping postgres database");
        let reader = dump_invocation(&ctx.service)?.stream_stdout(ctx.cancel.clone())?;
        Ok(BackupOutput {
            reader,
            extension: "dump".into(),
        })
    }

    async fn restore(&self, ctx: &ExecutionContext, reader: BoxReader) -> Result<()> {
        info!(service = %ctx.service.key, "restoring postgres database");
        restore_invocation(&ctx.service)?
            .feed_stdin(reader, &ctx.cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Binding, ServiceType};
    use std::ffi::OsString;

    fn service() -> ServiceInstance {
        let mut service = ServiceInstance::new(
            ServiceType::Postgres,
            "orders",
            Binding {
                uri: Some("postgres://app:pw@db.internal:5432/orders".into()),
                ..Default::default()
            },
        );
        service.settings.executor.ignore_tables = vec!["audit_log".into()];
        service.settings.executor.backup_options = vec!["--no-comments".into()];
        service
    }

    #[test]
    fn dump_excludes_ignored_tables() -> anyhow::Result<()> {
        let invocation = dump_invocation(&service())?;
        assert_eq!(invocation.program, "pg_dump");
        assert!(invocation.args.contains(&OsString::from("--exclude-table=audit_log")));
        assert!(invocation.args.contains(&OsString::from("--no-comments")));
        assert!(invocation.envs.contains(&("PGPASSWORD", "pw".to_string())));
        assert!(invocation.envs.contains(&("PGDATABASE", "orders".to_string())));
        Ok(())
    }

    #[test]
    fn restore_targets_the_bound_database() -> anyhow::Result<()> {
        let invocation = restore_invocation(&service())?;
        assert_eq!(invocation.program, "pg_restore");
        assert!(invocation.args.contains(&OsString::from("--dbname=orders")));
        assert!(invocation.envs.contains(&("PGHOST", "db.internal".to_string())));
        Ok(())
    }

    #[test]
    fn missing_database_is_rejected() {
        let service = ServiceInstance::new(
            ServiceType::Postgres,
            "orders",
            Binding {
                host: Some("db".into()),
                ..Default::default()
            },
        );
        assert!(dump_invocation(&service).is_err());
    }
}
