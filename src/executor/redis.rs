use async_trait::async_trait;
use tracing::{error, info};

use super::process::Invocation;
use super::{BackupOutput, ExecutionContext, Executor, Operation};
use crate::BoxReader;
use crate::errors::{BackupError, Result};
use crate::service::ServiceInstance;

/// Backs up Redis by streaming an RDB snapshot through `redis-cli --rdb`.
///
/// Restoring is not possible through a client connection, so the executor
/// only declares `Backup`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisExecutor;

pub(crate) fn dump_invocation(service: &ServiceInstance) -> Result<Invocation> {
    let conn = service.binding.connection()?;
    let mut invocation = Invocation::new("redis-cli").arg("-h").arg(&conn.host);
    if let Some(port) = conn.port {
        invocation = invocation.arg("-p").arg(port.to_string());
    }
    if let Some(user) = conn.username.as_deref().filter(|u| *u != "default") {
        invocation = invocation.arg("--user").arg(user);
    }
    Ok(invocation
        .env("REDISCLI_AUTH", conn.password.as_deref())
        .args(&service.settings.executor.backup_options)
        .args(["--rdb", "-"]))
}

#[async_trait]
impl Executor for RedisExecutor {
    fn name(&self) -> &'static str {
        "redis-cli"
    }

    fn supports(&self, operation: Operation) -> bool {
        operation == Operation::Backup
    }

    async fn backup(&self, ctx: &ExecutionContext) -> Result<BackupOutput> {
        info!(service = %ctx.service.key, "dumping redis snapshot");
        Ok(BackupOutput {
            reader: dump_invocation(&ctx.service)?.stream_stdout(ctx.cancel.clone())?,
            extension: "rdb".into(),
        })
    }

    async fn restore(&self, ctx: &ExecutionContext, _reader: BoxReader) -> Result<()> {
        error!(service = %ctx.service.key, "restoring redis is not supported, please contact your redis database administrator");
        Err(BackupError::Unsupported(format!(
            "restore is not supported for redis service {}",
            ctx.service.key
        )))
    }
}
