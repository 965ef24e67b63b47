mod config;
mod db;
mod error;
mod matcher;
mod model;
mod runner;
mod scheduler;
mod service;
mod sim;
mod state;
mod store;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Db;
use runner::Runner;
use service::{Service, ServiceOptions};
use sim::MoistureWalk;
use state::SystemState;
use store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file (zones + schedules) ─────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    if cfg.zones.is_empty() {
        warn!(path = %config_path, "no zones configured");
    }

    // ── Store: SQLite when DB_URL is set, in-memory otherwise ───────
    match env::var("DB_URL") {
        Ok(db_url) => {
            let db = Db::connect(&db_url).await?;
            db.migrate().await?;
            info!(%db_url, "using sqlite store");
            run(Arc::new(db), cfg).await
        }
        Err(_) => {
            info!("DB_URL not set, using in-memory store");
            run(Arc::new(MemoryStore::new()), cfg).await
        }
    }
}

async fn run<S: Store>(store: Arc<S>, cfg: Config) -> Result<()> {
    config::apply(&cfg, store.as_ref()).await?;

    // ── Shared activity log (ephemeral, for the dashboard) ──────────
    let activity = SystemState::shared();
    activity
        .write()
        .await
        .record_system("irrigation dashboard started".to_string());

    let offset = cfg.runner.offset()?;
    let runner = Runner::new(
        Arc::clone(&store),
        Arc::clone(&activity),
        cfg.runner.manual_duration(),
    );

    // ── Schedule polling ────────────────────────────────────────────
    tokio::spawn(scheduler::run(
        runner.clone(),
        Arc::clone(&activity),
        cfg.runner.poll_interval(),
        offset,
    ));

    // ── Moisture simulation ─────────────────────────────────────────
    if cfg.simulation.enabled {
        tokio::spawn(sim::run(
            Arc::clone(&store),
            MoistureWalk::from(&cfg.simulation),
            Duration::from_secs(cfg.simulation.interval_sec),
            Arc::clone(&activity),
        ));
    }

    // ── Web API ─────────────────────────────────────────────────────
    let service = Service::new(
        store,
        runner.clone(),
        Arc::clone(&activity),
        ServiceOptions {
            stop_on_schedule_disable: cfg.runner.stop_on_schedule_disable,
            utc_offset: offset,
        },
    );

    let outcome = tokio::select! {
        res = web::serve(service) => res,
        res = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            res.map_err(anyhow::Error::from)
        }
    };

    // Fail-safe: nothing keeps watering after the process exits.
    runner.shutdown().await;

    if let Err(e) = &outcome {
        error!("exiting with error: {e:#}");
    }
    outcome
}
