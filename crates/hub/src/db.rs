//! SQLite-backed [`Store`], selected when `DB_URL` is set.

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::model::{
    Day, MoistureReading, NewSchedule, NewWateringEvent, Schedule, ScheduleId, Trigger,
    WateringEvent, Zone, ZoneId,
};
use crate::store::Store;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/dashboard.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so keep exactly one alive.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

const ZONE_COLUMNS: &str = "zone_id, name, active, moisture";
const SCHEDULE_COLUMNS: &str = "schedule_id, name, fire_time, days, zones, duration_min, active";
const EVENT_COLUMNS: &str = "event_id, zone_id, ts_start, ts_end, schedule_id";
const READING_COLUMNS: &str = "zone_id, ts, moisture";

fn int<T: TryFrom<i64>>(row: &SqliteRow, column: &str) -> Result<T> {
    let v: i64 = row.try_get(column)?;
    T::try_from(v).map_err(|_| Error::Persistence(format!("{column} out of range: {v}")))
}

fn timestamp(ts: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| Error::Persistence(format!("bad timestamp {ts}: {e}")))
}

fn zone_from_row(row: &SqliteRow) -> Result<Zone> {
    Ok(Zone {
        id: int(row, "zone_id")?,
        name: row.try_get("name")?,
        active: row.try_get("active")?,
        moisture: int(row, "moisture")?,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule> {
    let days: String = row.try_get("days")?;
    let zones: String = row.try_get("zones")?;
    Ok(Schedule {
        id: int(row, "schedule_id")?,
        name: row.try_get("name")?,
        time: row.try_get("fire_time")?,
        days: split_list(&days)
            .map(Day::from_str)
            .collect::<Result<_>>()
            .map_err(|e| Error::Persistence(format!("stored days '{days}': {e}")))?,
        zones: split_list(&zones)
            .map(|z| {
                z.parse::<ZoneId>()
                    .map_err(|_| Error::Persistence(format!("stored zone list '{zones}'")))
            })
            .collect::<Result<_>>()?,
        duration_min: int(row, "duration_min")?,
        active: row.try_get("active")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<WateringEvent> {
    let ts_end: Option<i64> = row.try_get("ts_end")?;
    let schedule_id: Option<i64> = row.try_get("schedule_id")?;
    let trigger = match schedule_id {
        Some(id) => Trigger::Scheduled {
            schedule_id: ScheduleId::try_from(id)
                .map_err(|_| Error::Persistence(format!("schedule_id out of range: {id}")))?,
        },
        None => Trigger::Manual,
    };
    Ok(WateringEvent {
        id: int(row, "event_id")?,
        zone_id: int(row, "zone_id")?,
        start: timestamp(row.try_get("ts_start")?)?,
        end: ts_end.map(timestamp).transpose()?,
        trigger,
    })
}

fn reading_from_row(row: &SqliteRow) -> Result<MoistureReading> {
    Ok(MoistureReading {
        zone_id: int(row, "zone_id")?,
        ts: timestamp(row.try_get("ts")?)?,
        moisture: int(row, "moisture")?,
    })
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty())
}

fn join_list<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Store implementation
// ---------------------------------------------------------------------------

impl Store for Db {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query(&format!("SELECT {ZONE_COLUMNS} FROM zones ORDER BY zone_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(zone_from_row).collect()
    }

    async fn get_zone(&self, id: ZoneId) -> Result<Zone> {
        let row = sqlx::query(&format!("SELECT {ZONE_COLUMNS} FROM zones WHERE zone_id = ?"))
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::zone_not_found(id))?;
        zone_from_row(&row)
    }

    async fn upsert_zone(&self, zone: &Zone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (zone_id, name, active, moisture)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              name=excluded.name,
              active=excluded.active,
              moisture=excluded.moisture
            "#,
        )
        .bind(i64::from(zone.id))
        .bind(&zone.name)
        .bind(zone.active)
        .bind(i64::from(zone.moisture))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_zone_active(&self, id: ZoneId, active: bool) -> Result<Zone> {
        let res = sqlx::query("UPDATE zones SET active = ? WHERE zone_id = ?")
            .bind(active)
            .bind(i64::from(id))
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::zone_not_found(id));
        }
        self.get_zone(id).await
    }

    async fn set_zone_moisture(&self, id: ZoneId, pct: u8) -> Result<Zone> {
        if pct > 100 {
            return Err(Error::invalid_input(format!("moisture {pct} exceeds 100")));
        }
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query("UPDATE zones SET moisture = ? WHERE zone_id = ?")
            .bind(i64::from(pct))
            .bind(i64::from(id))
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::zone_not_found(id));
        }
        sqlx::query("INSERT INTO readings (zone_id, ts, moisture) VALUES (?, ?, ?)")
            .bind(i64::from(id))
            .bind(OffsetDateTime::now_utc().unix_timestamp())
            .bind(i64::from(pct))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.get_zone(id).await
    }

    async fn moisture_history(
        &self,
        zone_id: Option<ZoneId>,
        limit: usize,
    ) -> Result<Vec<MoistureReading>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match zone_id {
            Some(z) => {
                sqlx::query(&format!(
                    "SELECT {READING_COLUMNS} FROM readings WHERE zone_id = ? ORDER BY reading_id DESC LIMIT ?"
                ))
                .bind(i64::from(z))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {READING_COLUMNS} FROM readings ORDER BY reading_id DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        // Newest rows were fetched first.
        rows.iter().rev().map(reading_from_row).collect()
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY schedule_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?"
        ))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::schedule_not_found(id))?;
        schedule_from_row(&row)
    }

    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let res = sqlx::query(
            r#"
            INSERT INTO schedules (name, fire_time, days, zones, duration_min, active)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.name)
        .bind(&new.time)
        .bind(join_list(&new.days))
        .bind(join_list(&new.zones))
        .bind(i64::from(new.duration_min))
        .bind(new.active)
        .execute(&self.pool)
        .await?;
        let id = ScheduleId::try_from(res.last_insert_rowid())
            .map_err(|_| Error::Persistence("schedule id out of range".into()))?;
        Ok(new.into_schedule(id))
    }

    async fn set_schedule_active(&self, id: ScheduleId, active: bool) -> Result<Schedule> {
        let res = sqlx::query("UPDATE schedules SET active = ? WHERE schedule_id = ?")
            .bind(active)
            .bind(i64::from(id))
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::schedule_not_found(id));
        }
        self.get_schedule(id).await
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        let res = sqlx::query("DELETE FROM schedules WHERE schedule_id = ?")
            .bind(i64::from(id))
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::schedule_not_found(id));
        }
        Ok(())
    }

    async fn create_watering_event(&self, new: NewWateringEvent) -> Result<WateringEvent> {
        self.get_zone(new.zone_id).await?;
        let ts_start = new.start.unix_timestamp();
        let schedule_id = match new.trigger {
            Trigger::Scheduled { schedule_id } => Some(i64::from(schedule_id)),
            Trigger::Manual => None,
        };
        let res = sqlx::query(
            r#"
            INSERT INTO watering_events (zone_id, ts_start, ts_end, schedule_id)
            VALUES (?, ?, NULL, ?)
            "#,
        )
        .bind(i64::from(new.zone_id))
        .bind(ts_start)
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(WateringEvent {
            id: u64::try_from(res.last_insert_rowid())
                .map_err(|_| Error::Persistence("event id out of range".into()))?,
            zone_id: new.zone_id,
            start: timestamp(ts_start)?,
            end: None,
            trigger: new.trigger,
        })
    }

    async fn open_watering_event(&self, zone_id: ZoneId) -> Result<Option<WateringEvent>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM watering_events
            WHERE zone_id = ? AND ts_end IS NULL
            ORDER BY event_id
            LIMIT 1
            "#
        ))
        .bind(i64::from(zone_id))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn close_open_watering_event(
        &self,
        zone_id: ZoneId,
        end: OffsetDateTime,
    ) -> Result<Option<WateringEvent>> {
        let Some(mut event) = self.open_watering_event(zone_id).await? else {
            return Ok(None);
        };
        let ts_end = end.unix_timestamp().max(event.start.unix_timestamp());
        sqlx::query("UPDATE watering_events SET ts_end = ? WHERE event_id = ?")
            .bind(ts_end)
            .bind(i64::try_from(event.id).map_err(|_| Error::Persistence("event id out of range".into()))?)
            .execute(&self.pool)
            .await?;
        event.end = Some(timestamp(ts_end)?);
        Ok(Some(event))
    }

    async fn list_watering_events(&self, zone_id: Option<ZoneId>) -> Result<Vec<WateringEvent>> {
        let rows = match zone_id {
            Some(z) => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM watering_events WHERE zone_id = ? ORDER BY event_id"
                ))
                .bind(i64::from(z))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM watering_events ORDER BY event_id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(event_from_row).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
