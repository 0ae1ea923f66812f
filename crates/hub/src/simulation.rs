//! Periodic tick driver: load active sensors, generate a batch, hand it to
//! the sink.
//!
//! ## Lifecycle
//!
//! ```text
//! start() ──▶ Running ──[tick every period]──▶ Running
//!                │
//!                └──[stop()]──▶ Stopped (task joined, no further side effects)
//! ```
//!
//! Ticks run one at a time on the loop task.  A tick that outlasts the
//! period makes the ticker skip the missed slots instead of bursting.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SimulationSettings;
use crate::db::Db;
use crate::fanout::{BatchSink, TickReport};
use crate::generator::ValueGenerator;
use crate::state::SharedState;

pub struct Simulation {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Simulation {
    /// Spawn the tick loop with fresh trend state.  The first tick runs
    /// immediately.
    pub async fn start<S: BatchSink>(
        db: Db,
        sink: Arc<S>,
        shared: SharedState,
        settings: &SimulationSettings,
    ) -> Result<Self> {
        let generator = ValueGenerator::new(settings.history_len, settings.utc_offset()?);
        Ok(Self::spawn(db, sink, shared, generator, settings.tick_interval()).await)
    }

    async fn spawn<S: BatchSink>(
        db: Db,
        sink: Arc<S>,
        shared: SharedState,
        mut generator: ValueGenerator,
        period: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        {
            let mut st = shared.write().await;
            st.simulation_running = true;
            st.record_system(format!("simulation started (tick every {period:?})"));
        }
        info!(tick = ?period, "simulation started");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        tick(&db, sink.as_ref(), &shared, &mut generator, OffsetDateTime::now_utc())
                            .await;
                    }
                }
            }

            let mut st = shared.write().await;
            st.simulation_running = false;
            st.record_system("simulation stopped".to_string());
            info!("simulation stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it to finish.  A tick already in
    /// progress completes first.
    pub async fn stop(self) {
        // The receiver is gone only if the task already ended.
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            error!("simulation task failed: {e}");
        }
    }
}

/// Run one tick.  Returns `None` when there was nothing to hand to the sink.
pub async fn tick<S: BatchSink>(
    db: &Db,
    sink: &S,
    shared: &SharedState,
    generator: &mut ValueGenerator,
    now: OffsetDateTime,
) -> Option<TickReport> {
    let sensors = match db.load_active_sensors().await {
        Ok(s) => s,
        Err(e) => {
            error!("tick: failed to load sensors: {e:#}");
            shared
                .write()
                .await
                .record_error(format!("failed to load sensors: {e}"));
            return None;
        }
    };
    if sensors.is_empty() {
        warn!("tick: no active sensors");
        return None;
    }

    let readings = generator.generate(&sensors, now);
    let report = sink.deliver(&sensors, readings).await;
    debug!(
        generated = report.generated,
        persisted = report.persisted,
        alerts = report.alerts.len(),
        "tick complete"
    );

    shared.write().await.record_tick(&report);
    Some(report)
}

// ===========================================================================
// Tests
// ===========================================================================
