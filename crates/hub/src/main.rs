mod alerts;
mod config;
mod db;
mod fanout;
mod generator;
mod registry;
mod sensor;
mod simulation;
mod state;
mod status;
mod web;
mod ws;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use fanout::Broadcaster;
use registry::Registry;
use simulation::Simulation;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:farm.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed zones + sensors) ───────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    let zones = db.load_zones().await?;
    let active = db.load_active_sensors().await?;
    if active.is_empty() {
        warn!("no active sensors configured; ticks will be empty");
    }
    info!(zones = zones.len(), sensors = active.len(), "db ready");

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Fan-out + simulation ────────────────────────────────────────
    let registry = Registry::new(cfg.simulation.subscriber_queue);
    let sink = Arc::new(Broadcaster::new(
        db.clone(),
        registry.clone(),
        cfg.simulation.dedup_window(),
    ));
    let sim = Simulation::start(db.clone(), sink, Arc::clone(&shared), &cfg.simulation).await?;

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        db,
        registry: registry.clone(),
        shared,
    };
    let server = tokio::spawn(web::serve(app, web_port));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for ctrl-c: {e}");
            }
            info!("shutdown requested");
        }
        res = server => {
            match res {
                Ok(Ok(())) => warn!("web server exited"),
                Ok(Err(e)) => error!("web server failed: {e:#}"),
                Err(e) => error!("web server task panicked: {e}"),
            }
        }
    }

    sim.stop().await;
    let closed = registry.close();
    info!(connections = closed, "hub stopped");
    Ok(())
}
