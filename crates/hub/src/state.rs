use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::alerts::AlertEvent;
use crate::fanout::TickReport;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub simulation_running: bool,
    pub ticks: u64,
    pub last_tick: Option<OffsetDateTime>,
    pub readings_persisted: u64,
    pub persist_failures: u64,
    pub events_dropped: u64,
    pub alerts_raised: u64,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Tick,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub simulation_running: bool,
    pub ticks: u64,
    pub last_tick: Option<String>,
    pub readings_persisted: u64,
    pub persist_failures: u64,
    pub events_dropped: u64,
    pub alerts_raised: u64,
    pub connected_clients: usize,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            simulation_running: false,
            ticks: 0,
            last_tick: None,
            readings_persisted: 0,
            persist_failures: 0,
            events_dropped: 0,
            alerts_raised: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Fold one tick's outcome into the counters.  Only ticks that lost
    /// something are written to the event ring; alerts get their own entry.
    pub fn record_tick(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.last_tick = Some(OffsetDateTime::now_utc());
        self.readings_persisted += report.persisted as u64;
        self.persist_failures += report.persist_failed as u64;
        self.events_dropped += report.delivery.dropped as u64;

        if report.persist_failed > 0 || report.alert_failures > 0 {
            self.push_event(
                EventKind::Tick,
                format!(
                    "tick {}: {}/{} readings persisted, {} alert failure(s)",
                    self.ticks, report.persisted, report.generated, report.alert_failures
                ),
            );
        }
        for alert in &report.alerts {
            self.record_alert(alert);
        }
    }

    pub fn record_alert(&mut self, alert: &AlertEvent) {
        self.alerts_raised += 1;
        self.push_event(EventKind::Alert, alert.message.clone());
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, connected_clients: usize) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            simulation_running: self.simulation_running,
            ticks: self.ticks,
            last_tick: self.last_tick.and_then(|t| t.format(&Rfc3339).ok()),
            readings_persisted: self.readings_persisted,
            persist_failures: self.persist_failures,
            events_dropped: self.events_dropped,
            alerts_raised: self.alerts_raised,
            connected_clients,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
