//! Transaction Coordination Core
//!
//! Runs one coordinator instance: joins the leader election, and while
//! leading drives cleanup, idempotency GC, saga recovery and job-timeout
//! sweeps.
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌───────────────┐
//! │  Config  │───▶│ CoreServices │───▶│ LeaderElection│──▶ leader jobs
//! │  (YAML)  │    │  (runtime)   │    └───────────────┘
//! └──────────┘    └──────┬───────┘
//!                        ▼
//!                 PostgreSQL (optional)
//! ```

use txn_core::config::AppConfig;
use txn_core::db::{Database, ensure_schema};
use txn_core::runtime::CoreServices;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = txn_core::logging::init_logging(&app_config);

    tracing::info!("Starting transaction coordination core in {} mode", env);

    let pool = match &app_config.postgres_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            ensure_schema(db.pool()).await?;
            tracing::info!("PostgreSQL schema ready");
            Some(db.pool().clone())
        }
        None => {
            tracing::warn!("No postgres_url configured, running with in-memory stores");
            None
        }
    };

    let core = CoreServices::build(app_config, pool)?;
    core.start().await?;
    println!(
        "Coordinator {} up (service '{}')",
        core.instance_id, core.config.election.service_name
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    core.stop().await;

    let health = core.ops.health().await;
    tracing::info!(
        commits = health.lock_metrics.commits,
        timeouts = health.lock_metrics.timeouts,
        "Final lock metrics"
    );
    Ok(())
}
