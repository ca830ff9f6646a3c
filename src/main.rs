//! Service Backup/Restore Tool
//!
//! Command line front end over the orchestrator.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use service_backup::api::BackupView;
use service_backup::config::{AppConfig, load_config};
use service_backup::logger::init_logger;
use service_backup::state::Phase;
use service_backup::storage::{Catalog, EncryptionKey, MemoryBackend, ObjectBackend, S3Backend};
use service_backup::{Job, Orchestrator, ServiceRegistry};
use tracing::{info, warn};

const USAGE: &str = "\
usage: service-backup [--config PATH] <command>

commands:
  list [type] [name]                  list stored backups
  backup <type> <name>                take a backup
  restore <type> <name> <file>        restore a backup
  download <type> <name> <file> <dest>
  delete <type> <name> <file>
  status                              show the last operation per service";

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_path = take_config_flag(&mut args)?;
    let config = load_config(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;
    init_logger(&config.log_level, config.logging_timestamp)
        .context("Failed to initialise logging")?;

    let Some((command, rest)) = args.split_first() else {
        println!("{USAGE}");
        bail!("No command given");
    };

    let orchestrator = build_orchestrator(&config).await?;

    match (command.as_str(), rest) {
        ("list", [filters @ ..]) if filters.len() <= 2 => {
            let records = orchestrator
                .get_backups(
                    filters.first().map(String::as_str),
                    filters.get(1).map(String::as_str),
                )
                .await?;
            let views: Vec<BackupView> = records.iter().map(BackupView::from).collect();
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        ("backup", [service_type, name]) => {
            let service = orchestrator.services().lookup(service_type, name)?;
            println!("🚀 Starting backup of {}...", service.key);
            await_job(orchestrator.create_backup(&service)?).await?;
        }
        ("restore", [service_type, name, file]) => {
            let service = orchestrator.services().lookup(service_type, name)?;
            println!("🔄 Restoring {file} into {}...", service.key);
            await_job(orchestrator.restore_backup(&service, file)?).await?;
        }
        ("download", [service_type, name, file, dest]) => {
            let service = orchestrator.services().lookup(service_type, name)?;
            let mut reader = orchestrator.read_backup(&service, file).await?;
            let mut out = tokio::fs::File::create(dest)
                .await
                .context(format!("Failed to create {dest}"))?;
            let bytes = tokio::io::copy(&mut reader, &mut out)
                .await
                .context(format!("Failed to download {file}"))?;
            println!("⬇️ Downloaded {file} ({bytes} bytes) to {dest}");
        }
        ("delete", [service_type, name, file]) => {
            let service = orchestrator.services().lookup(service_type, name)?;
            orchestrator.delete_backup(&service, file).await?;
            println!("🗑 Deleted {file} of {}", service.key);
        }
        ("status", []) => {
            for service in orchestrator.services().all() {
                let state = orchestrator.status(&service.key);
                println!("{}: {}", service.key, serde_json::to_string(&state)?);
            }
        }
        _ => {
            println!("{USAGE}");
            bail!("Invalid command: {}", args.join(" "));
        }
    }
    Ok(())
}

/// Removes `--config PATH` from `args`, defaulting to `config.json`.
fn take_config_flag(args: &mut Vec<String>) -> Result<PathBuf> {
    match args.iter().position(|a| a == "--config") {
        Some(i) => {
            if i + 1 >= args.len() {
                bail!("--config needs a path");
            }
            let path = args.remove(i + 1);
            args.remove(i);
            Ok(PathBuf::from(path))
        }
        None => Ok(PathBuf::from("config.json")),
    }
}

async fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let backend: Arc<dyn ObjectBackend> = match &config.s3 {
        Some(s3) => Arc::new(S3Backend::connect(s3).await),
        None => {
            warn!("no s3 storage configured, artifacts are kept in memory only");
            Arc::new(MemoryBackend::new())
        }
    };
    let encryption = config
        .encryption_key
        .as_deref()
        .map(EncryptionKey::from_passphrase);
    let catalog = Arc::new(Catalog::new(backend, encryption));

    let services = ServiceRegistry::new(config.services.iter().cloned())
        .context("Invalid service configuration")?;
    info!(services = services.len(), encrypted = catalog.is_encrypted(), "configuration loaded");

    Ok(Orchestrator::builder(services, catalog)
        .max_concurrent_jobs(config.max_concurrent_jobs)
        .disable_restore(config.disable_restore)
        .build())
}

async fn await_job(job: Job) -> Result<()> {
    let key = job.key().clone();
    let state = job.wait().await;
    match (state.phase, state.last_error) {
        (Phase::Succeeded, _) => {
            println!(
                "{key}: {}",
                state.artifact.as_deref().unwrap_or("done")
            );
            Ok(())
        }
        (_, Some(err)) => bail!("{key}: {}", err.message),
        (phase, None) => bail!("{key}: job ended in phase {phase:?}"),
    }
}
