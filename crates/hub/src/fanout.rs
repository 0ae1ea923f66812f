//! Persist-then-broadcast fan-out for one tick's batch.
//!
//! Order within a tick:
//!
//! ```text
//! insert each reading ──▶ publish all_sensor_data ──▶ publish zone:<id> ──▶ publish sensor:<id>
//!   (per-sensor,            (persisted readings only)
//!    failures dropped)                                        ──▶ raise + publish alerts
//! ```
//!
//! A reading only reaches subscribers once its row is committed, so a client
//! reacting to a push can always look it up in history.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::AddAssign;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::alerts::{self, AlertEvent};
use crate::db::Db;
use crate::registry::{Channel, Delivery, Event, Registry};
use crate::sensor::{Reading, Sensor};

/// Consumer of generated batches.  Implementations must not fail the tick:
/// every problem is absorbed and reported in the returned `TickReport`.
pub trait BatchSink: Send + Sync + 'static {
    fn deliver(
        &self,
        sensors: &[Sensor],
        readings: Vec<Reading>,
    ) -> impl Future<Output = TickReport> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub generated: usize,
    pub persisted: usize,
    pub persist_failed: usize,
    pub delivery: Delivery,
    pub alerts: Vec<AlertEvent>,
    pub alert_failures: usize,
}

impl AddAssign for Delivery {
    fn add_assign(&mut self, rhs: Self) {
        self.delivered += rhs.delivered;
        self.dropped += rhs.dropped;
        self.closed += rhs.closed;
    }
}

pub struct Broadcaster {
    db: Db,
    registry: Registry,
    dedup_window: Duration,
}

impl Broadcaster {
    pub fn new(db: Db, registry: Registry, dedup_window: Duration) -> Self {
        Self {
            db,
            registry,
            dedup_window,
        }
    }

    fn publish_readings(&self, persisted: &[Reading]) -> Delivery {
        let mut delivery = self.registry.publish(
            &Channel::AllSensorData,
            Event::SensorData {
                channel: Channel::AllSensorData,
                readings: persisted.to_vec(),
            },
        );

        let mut by_zone: BTreeMap<&str, Vec<Reading>> = BTreeMap::new();
        for r in persisted {
            by_zone.entry(r.zone_id.as_str()).or_default().push(r.clone());
        }
        for (zone_id, readings) in by_zone {
            let channel = Channel::Zone(zone_id.to_string());
            if self.registry.subscriber_count(&channel) == 0 {
                continue;
            }
            delivery += self.registry.publish(
                &channel,
                Event::SensorData {
                    channel: channel.clone(),
                    readings,
                },
            );
        }

        for r in persisted {
            let channel = Channel::Sensor(r.sensor_id.clone());
            if self.registry.subscriber_count(&channel) == 0 {
                continue;
            }
            delivery += self
                .registry
                .publish(&channel, Event::SensorUpdate { reading: r.clone() });
        }

        delivery
    }
}

impl BatchSink for Broadcaster {
    async fn deliver(&self, sensors: &[Sensor], readings: Vec<Reading>) -> TickReport {
        let mut report = TickReport {
            generated: readings.len(),
            ..TickReport::default()
        };

        // ── 1. Persist (each sensor independent) ────────────────────
        let mut persisted: Vec<Reading> = Vec::with_capacity(readings.len());
        for r in readings {
            match self.db.insert_reading(&r).await {
                Ok(()) => persisted.push(r),
                Err(e) => {
                    report.persist_failed += 1;
                    error!(sensor = %r.sensor_id, "fanout: reading dropped: {e:#}");
                }
            }
        }
        report.persisted = persisted.len();

        if persisted.is_empty() {
            return report;
        }

        // ── 2. Broadcast what was committed ─────────────────────────
        report.delivery = self.publish_readings(&persisted);
        debug!(
            readings = persisted.len(),
            delivered = report.delivery.delivered,
            dropped = report.delivery.dropped,
            "fanout: batch published"
        );

        // ── 3. Alerts for non-normal readings ───────────────────────
        let by_id: HashMap<&str, &Sensor> =
            sensors.iter().map(|s| (s.sensor_id.as_str(), s)).collect();

        for r in persisted.iter().filter(|r| !r.status.is_normal()) {
            let Some(sensor) = by_id.get(r.sensor_id.as_str()) else {
                continue;
            };
            match alerts::raise(&self.db, sensor, r, self.dedup_window).await {
                Ok(Some(alert)) => {
                    info!(
                        sensor = %alert.sensor_id,
                        severity = %alert.severity,
                        value = alert.value,
                        "fanout: alert raised"
                    );
                    report.delivery += self
                        .registry
                        .publish(&Channel::Alerts, Event::Alert(alert.clone()));
                    report.alerts.push(alert);
                }
                Ok(None) => {}
                Err(e) => {
                    report.alert_failures += 1;
                    error!(sensor = %r.sensor_id, "fanout: alert evaluation failed: {e:#}");
                }
            }
        }

        report
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::DEFAULT_DEDUP_WINDOW;
    use crate::db::ZoneConfig;
    use crate::sensor::{SensorType, Thresholds};
    use crate::registry::Connection;
    use crate::status::{classify, Status};
    use tokio::sync::mpsc;

    fn sensor(id: &str, zone_id: &str) -> Sensor {
        Sensor {
            sensor_id: id.into(),
            name: format!("{id} temperature"),
            zone_id: zone_id.into(),
            sensor_type: SensorType::Temperature,
            unit: "°C".into(),
            thresholds: Thresholds {
                min_critical: 10.0,
                min_warning: 15.0,
                min_normal: 20.0,
                max_normal: 30.0,
                max_warning: 35.0,
                max_critical: 40.0,
            },
            active: true,
        }
    }

    fn reading(s: &Sensor, value: f64, ts: i64) -> Reading {
        Reading {
            sensor_id: s.sensor_id.clone(),
            zone_id: s.zone_id.clone(),
            value,
            unit: s.unit.clone(),
            status: classify(value, &s.thresholds),
            ts,
        }
    }

    /// Two zones, two sensors each.
    async fn setup() -> (Db, Vec<Sensor>) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let mut sensors = Vec::new();
        for zone in ["z1", "z2"] {
            db.upsert_zone(&ZoneConfig {
                zone_id: zone.into(),
                name: zone.to_uppercase(),
            })
            .await
            .unwrap();
            for n in 1..=2 {
                let s = sensor(&format!("{zone}/t{n}"), zone);
                db.upsert_sensor(&s).await.unwrap();
                sensors.push(s);
            }
        }
        (db, sensors)
    }

    fn subscriber(registry: &Registry, channel: Channel) -> (Connection, mpsc::Receiver<Event>) {
        let (conn, rx) = registry.connect();
        let _sub = conn.subscribe(channel);
        (conn, rx)
    }

    #[tokio::test]
    async fn broadcast_batch_is_already_queryable() {
        let (db, sensors) = setup().await;
        let registry = Registry::new(8);
        let (_conn, mut rx) = subscriber(&registry, Channel::AllSensorData);
        let sink = Broadcaster::new(db.clone(), registry.clone(), DEFAULT_DEDUP_WINDOW);

        let batch: Vec<Reading> = sensors.iter().map(|s| reading(s, 25.0, 1_000)).collect();
        let report = sink.deliver(&sensors, batch).await;
        assert_eq!(report.persisted, 4);
        assert_eq!(report.delivery.delivered, 1);

        let Some(Event::SensorData { readings, .. }) = rx.recv().await else {
            panic!("expected a sensor_data event");
        };
        assert_eq!(readings.len(), 4);
        for r in &readings {
            let hist = db.readings_for_sensor(&r.sensor_id, 10).await.unwrap();
            assert!(hist.contains(r), "{} missing from history", r.sensor_id);
        }
        assert!(rx.try_recv().is_err(), "batch must be published exactly once");
    }

    #[tokio::test]
    async fn zone_and_sensor_channels_get_their_share() {
        let (db, sensors) = setup().await;
        let registry = Registry::new(8);
        let (_zc, mut zone_rx) = subscriber(&registry, Channel::Zone("z2".into()));
        let (_sc, mut sensor_rx) = subscriber(&registry, Channel::Sensor("z1-t1".into()));
        let sink = Broadcaster::new(db, registry, DEFAULT_DEDUP_WINDOW);

        let batch: Vec<Reading> = sensors.iter().map(|s| reading(s, 25.0, 1_000)).collect();
        sink.deliver(&sensors, batch).await;

        let Some(Event::SensorData { channel, readings }) = zone_rx.recv().await else {
            panic!("expected zone batch");
        };
        assert_eq!(channel, Channel::Zone("z2".into()));
        assert!(readings.iter().all(|r| r.zone_id == "z2"));
        assert_eq!(readings.len(), 2);

        let Some(Event::SensorUpdate { reading }) = sensor_rx.recv().await else {
            panic!("expected sensor update");
        };
        assert_eq!(reading.sensor_id, "z1-t1");
    }

    #[tokio::test]
    async fn persistence_fault_drops_only_that_reading() {
        let (db, sensors) = setup().await;
        let registry = Registry::new(8);
        let (_conn, mut rx) = subscriber(&registry, Channel::AllSensorData);
        let sink = Broadcaster::new(db.clone(), registry, DEFAULT_DEDUP_WINDOW);

        // "ghost" has no sensors row, so its insert violates the foreign key.
        let ghost = sensor("ghost", "z1");
        let mut batch: Vec<Reading> = sensors.iter().map(|s| reading(s, 25.0, 1_000)).collect();
        batch.insert(1, reading(&ghost, 25.0, 1_000));

        let report = sink.deliver(&sensors, batch).await;
        assert_eq!(report.generated, 5);
        assert_eq!(report.persisted, 4);
        assert_eq!(report.persist_failed, 1);

        let Some(Event::SensorData { readings, .. }) = rx.recv().await else {
            panic!("expected a sensor_data event");
        };
        assert_eq!(readings.len(), 4);
        assert!(readings.iter().all(|r| r.sensor_id != "ghost"));
    }

    #[tokio::test]
    async fn failed_connection_does_not_block_others() {
        let (db, sensors) = setup().await;
        let registry = Registry::new(8);
        let (_dead, dead_rx) = subscriber(&registry, Channel::AllSensorData);
        let (_live, mut live_rx) = subscriber(&registry, Channel::AllSensorData);
        drop(dead_rx);
        let sink = Broadcaster::new(db, registry, DEFAULT_DEDUP_WINDOW);

        let batch: Vec<Reading> = sensors.iter().map(|s| reading(s, 25.0, 1_000)).collect();
        let report = sink.deliver(&sensors, batch).await;

        assert_eq!(report.delivery.delivered, 1);
        assert_eq!(report.delivery.closed, 1);
        assert!(matches!(live_rx.recv().await, Some(Event::SensorData { .. })));
    }

    #[tokio::test]
    async fn consecutive_critical_ticks_raise_one_alert() {
        let (db, sensors) = setup().await;
        let registry = Registry::new(8);
        let (_conn, mut alerts_rx) = subscriber(&registry, Channel::Alerts);
        let sink = Broadcaster::new(db.clone(), registry, DEFAULT_DEDUP_WINDOW);
        let hot = &sensors[0];

        let first = sink.deliver(&sensors, vec![reading(hot, 38.0, 1_000)]).await;
        let second = sink.deliver(&sensors, vec![reading(hot, 39.0, 6_000)]).await;
        assert_eq!(first.alerts.len(), 1);
        assert!(second.alerts.is_empty());

        let Some(Event::Alert(alert)) = alerts_rx.recv().await else {
            panic!("expected an alert event");
        };
        assert_eq!(alert.sensor_id, hot.sensor_id);
        assert_eq!(alert.severity, Status::Critical);
        assert!(alerts_rx.try_recv().is_err());

        let open = db.list_alerts(false, 10).await.unwrap();
        assert_eq!(open.len(), 1);

        // After resolution the next breach alerts again.
        assert!(db.resolve_alert(open[0].id, 7_000).await.unwrap());
        let third = sink.deliver(&sensors, vec![reading(hot, 38.5, 11_000)]).await;
        assert_eq!(third.alerts.len(), 1);
        assert!(matches!(alerts_rx.recv().await, Some(Event::Alert(_))));
    }

    #[tokio::test]
    async fn normal_batch_raises_no_alerts() {
        let (db, sensors) = setup().await;
        let sink = Broadcaster::new(db.clone(), Registry::new(8), DEFAULT_DEDUP_WINDOW);
        let batch: Vec<Reading> = sensors.iter().map(|s| reading(s, 22.0, 1_000)).collect();
        let report = sink.deliver(&sensors, batch).await;
        assert!(report.alerts.is_empty());
        assert!(db.list_alerts(true, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_publishes_nothing() {
        let (db, sensors) = setup().await;
        let registry = Registry::new(8);
        let (_conn, mut rx) = subscriber(&registry, Channel::AllSensorData);
        let sink = Broadcaster::new(db, registry, DEFAULT_DEDUP_WINDOW);

        let report = sink.deliver(&sensors, Vec::new()).await;
        assert_eq!(report.generated, 0);
        assert!(rx.try_recv().is_err());
    }
}
