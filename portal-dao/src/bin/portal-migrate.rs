//! Portal Migrate
//!
//! Copies portal data between backends as described by a migration
//! configuration file.
//!
//! ```text
//! portal-migrate --config migration.json
//! ```

use clap::Parser;
use portal_dao::{MigrationConfig, Migrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Migrate portal data from one backend to another.
#[derive(Parser)]
#[command(name = "portal-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the migration configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines (also enabled by `PORTAL_LOG_FORMAT=json`)
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    let json = cli.json_logs
        || std::env::var("PORTAL_LOG_FORMAT").map_or(false, |f| f.eq_ignore_ascii_case("json"));
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if let Err(e) = result {
        eprintln!("could not initialize logging: {}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match MigrationConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "could not load migration configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut migrator = Migrator::new(config);
    match migrator.migrate().await {
        Ok(summary) => {
            info!(
                users = summary.users,
                registrations = summary.registrations,
                applications = summary.applications,
                subscriptions = summary.subscriptions,
                approvals = summary.approvals,
                skipped_applications = summary.skipped_applications,
                skipped_subscriptions = summary.skipped_subscriptions,
                skipped_approvals = summary.skipped_approvals,
                warnings = migrator.warnings().len(),
                "migration succeeded"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "migration failed");
            ExitCode::FAILURE
        }
    }
}
