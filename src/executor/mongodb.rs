use async_trait::async_trait;
use tracing::info;
use url::Url;

use super::process::Invocation;
use super::{BackupOutput, ExecutionContext, Executor, Operation};
use crate::BoxReader;
use crate::errors::{BackupError, Result};
use crate::service::ServiceInstance;

/// Backs up MongoDB as a gzipped `mongodump` archive, restores with
/// `mongorestore --drop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDbExecutor;

/// Connection string for the mongo tools. Explicit binding fields override
/// the parts of `uri` they name.
fn connection_uri(service: &ServiceInstance) -> Result<String> {
    let binding = &service.binding;
    let invalid = |what: &str| BackupError::Validation(format!("invalid mongodb {what} for {}", service.key));
    let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);

    let mut url = match binding.uri.as_deref().filter(|u| !u.is_empty()) {
        Some(uri) => {
            let overridden = binding.port.is_some()
                || [&binding.host, &binding.username, &binding.password, &binding.database]
                    .into_iter()
                    .any(|v| non_empty(v).is_some());
            if !overridden {
                return Ok(uri.to_string());
            }
            Url::parse(uri).map_err(|_| invalid("uri"))?
        }
        None => {
            let conn = binding.connection()?;
            Url::parse(&format!("mongodb://{}", conn.host)).map_err(|_| invalid("host"))?
        }
    };

    if let Some(host) = non_empty(&binding.host) {
        url.set_host(Some(&host)).map_err(|_| invalid("host"))?;
    }
    if let Some(port) = binding.port {
        url.set_port(Some(port)).map_err(|()| invalid("port"))?;
    }
    if let Some(user) = non_empty(&binding.username) {
        url.set_username(&user).map_err(|()| invalid("username"))?;
    }
    if let Some(password) = non_empty(&binding.password) {
        url.set_password(Some(&password)).map_err(|()| invalid("password"))?;
    }
    if let Some(database) = non_empty(&binding.database) {
        url.set_path(&format!("/{database}"));
    }
    Ok(url.to_string())
}

pub(crate) fn dump_invocation(service: &ServiceInstance) -> Result<Invocation> {
    let options = &service.settings.executor;
    let mut invocation = Invocation::new("mongodump")
        .arg(format!("--uri={}", connection_uri(service)?))
        .args(["--archive", "--gzip"]);

    if !options.ignore_tables.is_empty() {
        // --excludeCollection only works together with --db
        let database = service.binding.connection()?.database.ok_or_else(|| {
            BackupError::Validation(format!(
                "ignoring collections of {} requires a database in its binding",
                service.key
            ))
        })?;
        invocation = invocation.arg(format!("--db={database}")).args(
            options
                .ignore_tables
                .iter()
                .map(|c| format!("--excludeCollection={c}")),
        );
    }
    Ok(invocation.args(&options.backup_options))
}

pub(crate) fn restore_invocation(service: &ServiceInstance) -> Result<Invocation> {
    Ok(Invocation::new("mongorestore")
        .arg(format!("--uri={}", connection_uri(service)?))
        .args(["--archive", "--gzip", "--drop"])
        .args(&service.settings.executor.restore_options))
}

#[async_trait]
impl Executor for MongoDbExecutor {
    fn name(&self) -> &'static str {
        "mongodump"
    }

    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    async fn backup(&self, ctx: &ExecutionContext) -> Result<BackupOutput> {
        info!(service = %ctx.service.key, "dumping mongodb database");
        Ok(BackupOutput {
            reader: dump_invocation(&ctx.service)?.stream_stdout(ctx.cancel.clone())?,
            extension: "gz".into(),
        })
    }

    async fn restore(&self, ctx: &ExecutionContext, reader: BoxReader) -> Result<()> {
        info!(service = %ctx.service.key, "restoring mongodb database");
        restore_invocation(&ctx.service)?
            .feed_stdin(reader, &ctx.cancel)
            .await
    }
}
