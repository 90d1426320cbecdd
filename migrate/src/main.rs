//! Admin CLI: migrate every stream from one event store backend to another.
//!
//! ```text
//! event-store-migrate --from memory --to sql --to-dsn postgres://localhost/events
//! ```
//!
//! Exit codes:
//! - `0` — every stream was already up to date or migrated successfully.
//! - `1` — at least one stream failed to migrate.
//! - `2` — invalid configuration (e.g. a SQL backend named without a DSN).

use clap::{Parser, ValueEnum};
use event_store_core::config::{BackendKind, EventStoreConfig};
use event_store_core::event_store::EventStoreBackend;
use event_store_core::migrator::Migrator;
use event_store_migrate::build_backend;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Selects which concrete backend a `--from`/`--to` flag names.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    /// Non-durable, single-process in-memory backend.
    Memory,
    /// Durable `PostgreSQL` backend.
    Sql,
}

impl BackendArg {
    const fn kind(self) -> BackendKind {
        match self {
            Self::Memory => BackendKind::Memory,
            Self::Sql => BackendKind::Sql,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "event-store-migrate", about = "Migrate event streams between backends")]
struct Cli {
    /// Source backend kind.
    #[arg(long, value_enum)]
    from: BackendArg,

    /// Source backend connection string. Required when `--from sql`.
    #[arg(long)]
    from_dsn: Option<String>,

    /// Destination backend kind.
    #[arg(long, value_enum)]
    to: BackendArg,

    /// Destination backend connection string. Required when `--to sql`.
    #[arg(long)]
    to_dsn: Option<String>,
}

impl Cli {
    fn source_config(&self) -> Result<EventStoreConfig, String> {
        backend_config(self.from, self.from_dsn.clone(), "--from-dsn")
    }

    fn destination_config(&self) -> Result<EventStoreConfig, String> {
        backend_config(self.to, self.to_dsn.clone(), "--to-dsn")
    }
}

fn backend_config(kind: BackendArg, dsn: Option<String>, dsn_flag: &str) -> Result<EventStoreConfig, String> {
    match kind.kind() {
        BackendKind::Memory => Ok(EventStoreConfig::memory()),
        BackendKind::Sql => {
            let dsn = dsn.ok_or_else(|| format!("{dsn_flag} is required when the backend is sql"))?;
            Ok(EventStoreConfig::sql(dsn))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_store_migrate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (source_config, destination_config) = match (cli.source_config(), cli.destination_config()) {
        (Ok(source), Ok(destination)) => (source, destination),
        (Err(e), _) | (_, Err(e)) => {
            error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let source = build_backend(&source_config);
    let destination = build_backend(&destination_config);

    if let Err(e) = source.initialize().await {
        error!("failed to initialize source backend: {e}");
        return ExitCode::from(2);
    }
    if let Err(e) = destination.initialize().await {
        error!("failed to initialize destination backend: {e}");
        return ExitCode::from(2);
    }

    let exit_code = run_migration(source.clone(), destination.clone()).await;

    let _ = source.close().await;
    let _ = destination.close().await;

    exit_code
}

async fn run_migration(source: Arc<dyn EventStoreBackend>, destination: Arc<dyn EventStoreBackend>) -> ExitCode {
    let migrator = Migrator::new(source, destination);
    match migrator.migrate().await {
        Ok(report) => {
            info!(
                migrated = report.migrated,
                skipped = report.skipped,
                failed = report.failed.len(),
                "migration run complete"
            );
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                for (stream_id, error) in &report.failed {
                    error!(%stream_id, %error, "stream migration failed");
                }
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!("migration run failed: {e}");
            ExitCode::from(1)
        }
    }
}
