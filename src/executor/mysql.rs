use async_trait::async_trait;
use tracing::info;

use super::process::Invocation;
use super::{BackupOutput, ExecutionContext, Executor, Operation};
use crate::BoxReader;
use crate::errors::{BackupError, Result};
use crate::service::ServiceInstance;

/// Backs up MySQL and MariaDB with `mysqldump`, restores with `mysql`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlExecutor;

fn base(program: &'static str, service: &ServiceInstance) -> Result<(Invocation, String)> {
    let conn = service.binding.connection()?;
    let database = conn.database.clone().ok_or_else(|| {
        BackupError::Validation(format!("mysql binding of {} has no database", service.key))
    })?;

    let mut invocation = Invocation::new(program).arg(format!("--host={}", conn.host));
    if let Some(port) = conn.port {
        invocation = invocation.arg(format!("--port={port}"));
    }
    if let Some(user) = &conn.username {
        invocation = invocation.arg(format!("--user={user}"));
    }
    Ok((
        invocation.env("MYSQL_PWD", conn.password.as_deref()),
        database,
    ))
}

pub(crate) fn dump_invocation(service: &ServiceInstance) -> Result<Invocation> {
    let (invocation, database) = base("mysqldump", service)?;
    let options = &service.settings.executor;
    let mut invocation = invocation.args(["--single-transaction", "--routines", "--triggers"]);
    if options.disable_column_statistics {
        invocation = invocation.arg("--column-statistics=0");
    }
    Ok(invocation
        .args(
            options
                .ignore_tables
                .iter()
                .map(|table| format!("--ignore-table={database}.{table}")),
        )
        .args(&options.backup_options)
        .arg(database))
}

pub(crate) fn restore_invocation(service: &ServiceInstance) -> Result<Invocation> {
    let (invocation, database) = base("mysql", service)?;
    Ok(invocation
        .args(&service.settings.executor.restore_options)
        .arg(database))
}

#[async_trait]
impl Executor for MysqlExecutor {
    fn name(&self) -> &'static str {
        "mysqldump"
    }

    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    async fn backup(&self, ctx: &ExecutionContext) -> Result<BackupOutput> {
        info!(service = %ctx.service.key, "dumping mysql database");
        Ok(BackupOutput {
            reader: dump_invocation(&ctx.service)?.stream_stdout(ctx.cancel.clone())?,
            extension: "sql".into(),
        })
    }

    async fn restore(&self, ctx: &ExecutionContext, reader: BoxReader) -> Result<()> {
        info!(service = %ctx.service.key, "restoring mysql database");
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

    #[test]
    fn ignored_tables_are_qualified_with_the_database() -> anyhow::Result<()> {
        let mut service = ServiceInstance::new(
            ServiceType::Mysql,
            "shop",
            Binding {
                host: Some("mariadb.internal".into()),
                port: Some(3306),
                username: Some("shop".into()),
                password: Some("pw".into()),
                database: Some("shop_prod".into()),
                ..Default::default()
            },
        );
        service.settings.executor.ignore_tables = vec!["sessions".into()];

        let dump = dump_invocation(&service)?;
        assert!(dump.args.contains(&OsString::from("--ignore-table=shop_prod.sessions")));
        assert_eq!(dump.args.last(), Some(&OsString::from("shop_prod")));
        assert!(dump.envs.contains(&("MYSQL_PWD", "pw".to_string())));
        assert!(!dump.args.contains(&OsString::from("--column-statistics=0")));

        service.settings.executor.disable_column_statistics = true;
        let dump = dump_invocation(&service)?;
        assert!(dump.args.contains(&OsString::from("--column-statistics=0")));
        assert_eq!(dump.args.last(), Some(&OsString::from("shop_prod")));

        let restore = restore_invocation(&service)?;
        assert_eq!(restore.program, "mysql");
        assert!(restore.args.contains(&OsString::from("--port=3306")));
        Ok(())
    }
}
