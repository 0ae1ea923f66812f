use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::sensor::{Reading, Sensor, SensorType, Thresholds};
use crate::status::Status;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneConfig {
    pub zone_id: String,
    pub name: String,
}

/// A persisted alert.  Timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub sensor_id: String,
    pub message: String,
    pub severity: Status,
    pub value: f64,
    pub unit: String,
    pub resolved: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// Fields of an alert about to be inserted.
#[derive(Debug, Clone)]
pub struct NewAlert<'a> {
    pub sensor_id: &'a str,
    pub message: &'a str,
    pub severity: Status,
    pub value: f64,
    pub unit: &'a str,
    pub created_at: i64,
}

// ----------------------------
// Row types
// ----------------------------

#[derive(FromRow)]
struct SensorRow {
    sensor_id: String,
    name: String,
    zone_id: String,
    sensor_type: String,
    unit: String,
    min_critical: f64,
    min_warning: f64,
    min_normal: f64,
    max_normal: f64,
    max_warning: f64,
    max_critical: f64,
    active: bool,
}

impl TryFrom<SensorRow> for Sensor {
    type Error = anyhow::Error;

    fn try_from(r: SensorRow) -> Result<Self> {
        Ok(Sensor {
            sensor_type: SensorType::from_str(&r.sensor_type).map_err(|e| anyhow!(e))?,
            sensor_id: r.sensor_id,
            name: r.name,
            zone_id: r.zone_id,
            unit: r.unit,
            thresholds: Thresholds {
                min_critical: r.min_critical,
                min_warning: r.min_warning,
                min_normal: r.min_normal,
                max_normal: r.max_normal,
                max_warning: r.max_warning,
                max_critical: r.max_critical,
            },
            active: r.active,
        })
    }
}

#[derive(FromRow)]
struct ReadingRow {
    sensor_id: String,
    zone_id: String,
    value: f64,
    unit: String,
    status: String,
    ts: i64,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = anyhow::Error;

    fn try_from(r: ReadingRow) -> Result<Self> {
        Ok(Reading {
            status: Status::from_str(&r.status).map_err(|e| anyhow!(e))?,
            sensor_id: r.sensor_id,
            zone_id: r.zone_id,
            value: r.value,
            unit: r.unit,
            ts: r.ts,
        })
    }
}

#[derive(FromRow)]
struct AlertRow {
    id: i64,
    sensor_id: String,
    message: String,
    severity: String,
    value: f64,
    unit: String,
    resolved: bool,
    created_at: i64,
    resolved_at: Option<i64>,
}

impl TryFrom<AlertRow> for AlertRecord {
    type Error = anyhow::Error;

    fn try_from(r: AlertRow) -> Result<Self> {
        Ok(AlertRecord {
            severity: Status::from_str(&r.severity).map_err(|e| anyhow!(e))?,
            id: r.id,
            sensor_id: r.sensor_id,
            message: r.message,
            value: r.value,
            unit: r.unit,
            resolved: r.resolved,
            created_at: r.created_at,
            resolved_at: r.resolved_at,
        })
    }
}

const SENSOR_COLUMNS: &str = "sensor_id, name, zone_id, sensor_type, unit, \
     min_critical, min_warning, min_normal, max_normal, max_warning, max_critical, active";

const ALERT_COLUMNS: &str =
    "id, sensor_id, message, severity, value, unit, resolved, created_at, resolved_at";

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/farm/farm.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn upsert_zone(&self, z: &ZoneConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (zone_id, name) VALUES (?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET name=excluded.name
            "#,
        )
        .bind(z.zone_id.as_str())
        .bind(z.name.as_str())
        .execute(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<ZoneConfig>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT zone_id, name FROM zones ORDER BY zone_id")
                .fetch_all(&self.pool)
                .await
                .context("load_zones failed")?;

        Ok(rows
            .into_iter()
            .map(|(zone_id, name)| ZoneConfig { zone_id, name })
            .collect())
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    /// Insert or update a sensor, thresholds and active flag included.
    pub async fn upsert_sensor(&self, s: &Sensor) -> Result<()> {
        let t = &s.thresholds;
        sqlx::query(
            r#"
            INSERT INTO sensors (
              sensor_id, name, zone_id, sensor_type, unit,
              min_critical, min_warning, min_normal,
              max_normal, max_warning, max_critical,
              active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              name=excluded.name,
              zone_id=excluded.zone_id,
              sensor_type=excluded.sensor_type,
              unit=excluded.unit,
              min_critical=excluded.min_critical,
              min_warning=excluded.min_warning,
              min_normal=excluded.min_normal,
              max_normal=excluded.max_normal,
              max_warning=excluded.max_warning,
              max_critical=excluded.max_critical,
              active=excluded.active
            "#,
        )
        .bind(s.sensor_id.as_str())
        .bind(s.name.as_str())
        .bind(s.zone_id.as_str())
        .bind(s.sensor_type.as_str())
        .bind(s.unit.as_str())
        .bind(t.min_critical)
        .bind(t.min_warning)
        .bind(t.min_normal)
        .bind(t.max_normal)
        .bind(t.max_warning)
        .bind(t.max_critical)
        .bind(s.active)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    /// Mark every sensor whose id is not in `keep` inactive.  Sensors are
    /// never deleted so their history stays queryable.
    pub async fn deactivate_missing_sensors(&self, keep: &[&str]) -> Result<u64> {
        let mut deactivated = 0;
        for s in self.load_sensors().await? {
            if s.active && !keep.contains(&s.sensor_id.as_str()) {
                sqlx::query("UPDATE sensors SET active = 0 WHERE sensor_id = ?")
                    .bind(s.sensor_id.as_str())
                    .execute(&self.pool)
                    .await
                    .context("deactivate sensor failed")?;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    pub async fn load_sensors(&self) -> Result<Vec<Sensor>> {
        let rows: Vec<SensorRow> =
            sqlx::query_as(&format!("SELECT {SENSOR_COLUMNS} FROM sensors ORDER BY sensor_id"))
                .fetch_all(&self.pool)
                .await
                .context("load_sensors failed")?;

        rows.into_iter().map(Sensor::try_from).collect()
    }

    pub async fn load_active_sensors(&self) -> Result<Vec<Sensor>> {
        let rows: Vec<SensorRow> = sqlx::query_as(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE active = 1 ORDER BY sensor_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("load_active_sensors failed")?;

        rows.into_iter().map(Sensor::try_from).collect()
    }

    pub async fn get_sensor(&self, sensor_id: &str) -> Result<Option<Sensor>> {
        let row: Option<SensorRow> = sqlx::query_as(&format!(
            "SELECT {SENSOR_COLUMNS} FROM sensors WHERE sensor_id = ?"
        ))
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor failed")?;

        row.map(Sensor::try_from).transpose()
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (sensor_id, value, unit, status, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.sensor_id.as_str())
        .bind(r.value)
        .bind(r.unit.as_str())
        .bind(r.status.as_str())
        .bind(r.ts)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_reading failed for sensor {}", r.sensor_id))?;
        Ok(())
    }

    /// Newest `limit` readings of one sensor, newest first.
    pub async fn readings_for_sensor(&self, sensor_id: &str, limit: i64) -> Result<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT r.sensor_id, s.zone_id, r.value, r.unit, r.status, r.ts
            FROM readings r
            JOIN sensors s ON s.sensor_id = r.sensor_id
            WHERE r.sensor_id = ?
            ORDER BY r.ts DESC, r.id DESC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("readings_for_sensor failed")?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    /// The most recent reading of every active sensor.
    pub async fn latest_readings(&self) -> Result<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT r.sensor_id, s.zone_id, r.value, r.unit, r.status, r.ts
            FROM readings r
            JOIN sensors s ON s.sensor_id = r.sensor_id
            WHERE s.active = 1
              AND r.id = (
                SELECT r2.id FROM readings r2
                WHERE r2.sensor_id = r.sensor_id
                ORDER BY r2.ts DESC, r2.id DESC
                LIMIT 1
              )
            ORDER BY r.sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("latest_readings failed")?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, a: &NewAlert<'_>) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (sensor_id, message, severity, value, unit, resolved, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(a.sensor_id)
        .bind(a.message)
        .bind(a.severity.as_str())
        .bind(a.value)
        .bind(a.unit)
        .bind(a.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_alert failed for sensor {}", a.sensor_id))?;
        Ok(result.last_insert_rowid())
    }

    /// An unresolved alert of `severity` for `sensor_id` created at or after
    /// `since_ms`, if one exists.
    pub async fn find_open_alert(
        &self,
        sensor_id: &str,
        severity: Status,
        since_ms: i64,
    ) -> Result<Option<AlertRecord>> {
        let row: Option<AlertRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ALERT_COLUMNS} FROM alerts
            WHERE sensor_id = ? AND severity = ? AND resolved = 0 AND created_at >= ?
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(sensor_id)
        .bind(severity.as_str())
        .bind(since_ms)
        .fetch_optional(&self.pool)
        .await
        .context("find_open_alert failed")?;

        row.map(AlertRecord::try_from).transpose()
    }

    /// Resolve an open alert.  Returns `false` if it does not exist or was
    /// already resolved.
    pub async fn resolve_alert(&self, id: i64, at_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET resolved = 1, resolved_at = ? WHERE id = ? AND resolved = 0",
        )
        .bind(at_ms)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("resolve_alert failed")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_alert(&self, id: i64) -> Result<Option<AlertRecord>> {
        let row: Option<AlertRow> =
            sqlx::query_as(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("get_alert failed")?;

        row.map(AlertRecord::try_from).transpose()
    }

    /// Newest first.
    pub async fn list_alerts(&self, include_resolved: bool, limit: i64) -> Result<Vec<AlertRecord>> {
        let rows: Vec<AlertRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ALERT_COLUMNS} FROM alerts
            WHERE (? OR resolved = 0)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(include_resolved)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_alerts failed")?;

        rows.into_iter().map(AlertRecord::try_from).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_sensor(id: &str) -> Sensor {
        Sensor {
            sensor_id: id.into(),
            name: format!("{id} temperature"),
            zone_id: "z1".into(),
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

    fn reading(sensor_id: &str, value: f64, ts: i64) -> Reading {
        Reading {
            sensor_id: sensor_id.into(),
            zone_id: "z1".into(),
            value,
            unit: "°C".into(),
            status: Status::Normal,
            ts,
        }
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_zone(&ZoneConfig {
            zone_id: "z1".into(),
            name: "Zone 1".into(),
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn sensor_roundtrip_and_threshold_update() {
        let db = test_db().await;
        let mut s = temp_sensor("s1");
        db.upsert_sensor(&s).await.unwrap();
        assert_eq!(db.get_sensor("s1").await.unwrap(), Some(s.clone()));

        s.thresholds.max_critical = 45.0;
        db.upsert_sensor(&s).await.unwrap();
        let loaded = db.get_sensor("s1").await.unwrap().unwrap();
        assert_eq!(loaded.thresholds.max_critical, 45.0);
        assert_eq!(db.load_sensors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deactivate_keeps_rows() {
        let db = test_db().await;
        db.upsert_sensor(&temp_sensor("s1")).await.unwrap();
        db.upsert_sensor(&temp_sensor("s2")).await.unwrap();

        let n = db.deactivate_missing_sensors(&["s1"]).await.unwrap();
        assert_eq!(n, 1);

        let active = db.load_active_sensors().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sensor_id, "s1");
        assert_eq!(db.load_sensors().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reading_for_unknown_sensor_is_rejected() {
        let db = test_db().await;
        assert!(db.insert_reading(&reading("ghost", 1.0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn readings_newest_first_and_latest_per_sensor() {
        let db = test_db().await;
        db.upsert_sensor(&temp_sensor("s1")).await.unwrap();
        db.upsert_sensor(&temp_sensor("s2")).await.unwrap();
        for (i, v) in [21.0, 22.0, 23.0].into_iter().enumerate() {
            db.insert_reading(&reading("s1", v, 1000 + i as i64)).await.unwrap();
        }
        db.insert_reading(&reading("s2", 25.0, 999)).await.unwrap();

        let hist = db.readings_for_sensor("s1", 2).await.unwrap();
        assert_eq!(hist.iter().map(|r| r.value).collect::<Vec<_>>(), vec![23.0, 22.0]);
        assert_eq!(hist[0].zone_id, "z1");

        let latest = db.latest_readings().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].value, 23.0);
        assert_eq!(latest[1].value, 25.0);
    }

    #[tokio::test]
    async fn alert_lifecycle() {
        let db = test_db().await;
        db.upsert_sensor(&temp_sensor("s1")).await.unwrap();

        let id = db
            .insert_alert(&NewAlert {
                sensor_id: "s1",
                message: "too hot",
                severity: Status::Critical,
                value: 41.0,
                unit: "°C",
                created_at: 5_000,
            })
            .await
            .unwrap();

        assert!(db.find_open_alert("s1", Status::Critical, 4_000).await.unwrap().is_some());
        // Outside the window.
        assert!(db.find_open_alert("s1", Status::Critical, 6_000).await.unwrap().is_none());
        // Different severity.
        assert!(db.find_open_alert("s1", Status::Warning, 0).await.unwrap().is_none());

        assert!(db.resolve_alert(id, 7_000).await.unwrap());
        assert!(!db.resolve_alert(id, 8_000).await.unwrap(), "already resolved");
        assert!(db.find_open_alert("s1", Status::Critical, 0).await.unwrap().is_none());

        let a = db.get_alert(id).await.unwrap().unwrap();
        assert!(a.resolved);
        assert_eq!(a.resolved_at, Some(7_000));

        assert!(db.list_alerts(false, 10).await.unwrap().is_empty());
        assert_eq!(db.list_alerts(true, 10).await.unwrap().len(), 1);
    }
}
