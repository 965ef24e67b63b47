//! User-facing actions and the dashboard read model.
//!
//! Everything that changes a zone's watering state goes through the
//! [`Runner`]; schedule and sensor edits go straight to the store.

use serde::Serialize;
use std::sync::Arc;
use time::{OffsetDateTime, UtcOffset};
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::matcher;
use crate::model::{
    MoistureReading, NewSchedule, Schedule, ScheduleId, Trigger, WateringEvent, Zone, ZoneId,
};
use crate::runner::{Activation, PendingDeactivation, Runner};
use crate::state::{ActivitySnapshot, SharedState};
use crate::store::Store;

/// Samples returned by [`Service::history`] when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 120;
pub const MAX_HISTORY_LIMIT: usize = 5000;

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Stop zones a schedule is still watering when it is disabled or deleted.
    pub stop_on_schedule_disable: bool,
    /// Offset of the local wall clock.
    pub utc_offset: UtcOffset,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            stop_on_schedule_disable: false,
            utc_offset: UtcOffset::UTC,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ZoneToggle {
    pub zone: Zone,
    /// Present when the toggle turned the zone on.
    pub activation: Option<Activation>,
    /// Present when the toggle turned the zone off.
    pub closed: Option<WateringEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub moisture: u8,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct NextRun {
    pub schedule_id: ScheduleId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub zones: Vec<ZoneId>,
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub active_zones: usize,
    pub total_zones: usize,
    /// Mean moisture across all zones, one decimal. `None` without zones.
    pub average_moisture: Option<f64>,
    pub next_run: Option<NextRun>,
}

#[derive(Debug, Serialize)]
pub struct ZoneStatus {
    #[serde(flatten)]
    pub zone: Zone,
    /// Start of the zone's most recent watering session.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_watered: Option<OffsetDateTime>,
    /// Next fire time of any active schedule covering the zone.
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_scheduled: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub overview: Overview,
    pub zones: Vec<ZoneStatus>,
    pub schedules: Vec<Schedule>,
    pub pending_deactivations: Vec<PendingDeactivation>,
    pub activity: ActivitySnapshot,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct Service<S> {
    store: Arc<S>,
    runner: Runner<S>,
    activity: SharedState,
    options: ServiceOptions,
}

impl<S> Clone for Service<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            runner: self.runner.clone(),
            activity: Arc::clone(&self.activity),
            options: self.options,
        }
    }
}

impl<S: Store> Service<S> {
    pub fn new(
        store: Arc<S>,
        runner: Runner<S>,
        activity: SharedState,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            runner,
            activity,
            options,
        }
    }

    /// Current local wall-clock time.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.options.utc_offset)
    }

    // -- zones ----------------------------------------------------------------

    /// Watering zones are stopped; idle zones start a manual run.
    pub async fn toggle_zone(&self, zone_id: ZoneId) -> Result<ZoneToggle> {
        let zone = self.store.get_zone(zone_id).await?;
        let (activation, closed) = if zone.active {
            (None, self.runner.deactivate_zone(zone_id).await?)
        } else {
            let activation = self.runner.activate_zone(zone_id, Trigger::Manual).await?;
            (Some(activation), None)
        };
        Ok(ZoneToggle {
            zone: self.store.get_zone(zone_id).await?,
            activation,
            closed,
        })
    }

    pub async fn water_zone_now(&self, zone_id: ZoneId) -> Result<Activation> {
        self.runner.activate_zone(zone_id, Trigger::Manual).await
    }

    pub async fn stop_zone(&self, zone_id: ZoneId) -> Result<Option<WateringEvent>> {
        self.store.get_zone(zone_id).await?;
        self.runner.deactivate_zone(zone_id).await
    }

    // -- sensors --------------------------------------------------------------

    pub async fn sensors(&self) -> Result<Vec<SensorReading>> {
        let timestamp = self.now();
        Ok(self
            .store
            .list_zones()
            .await?
            .into_iter()
            .map(|z| SensorReading {
                zone_id: z.id,
                zone_name: z.name,
                moisture: z.moisture,
                active: z.active,
                timestamp,
            })
            .collect())
    }

    /// Recent moisture samples, oldest first. `limit` defaults to
    /// [`DEFAULT_HISTORY_LIMIT`].
    pub async fn history(
        &self,
        zone_id: Option<ZoneId>,
        limit: Option<usize>,
    ) -> Result<Vec<MoistureReading>> {
        if let Some(id) = zone_id {
            self.store.get_zone(id).await?;
        }
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if limit == 0 || limit > MAX_HISTORY_LIMIT {
            return Err(Error::invalid_input(format!(
                "limit {limit} out of range 1-{MAX_HISTORY_LIMIT}"
            )));
        }
        self.store.moisture_history(zone_id, limit).await
    }

    pub async fn update_moisture(&self, zone_id: ZoneId, moisture: u8) -> Result<Zone> {
        if moisture > 100 {
            return Err(Error::invalid_input(format!(
                "moisture {moisture} out of range 0-100"
            )));
        }
        self.store.set_zone_moisture(zone_id, moisture).await
    }

    // -- schedules ------------------------------------------------------------

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.store.list_schedules().await
    }

    /// New schedules always start enabled.
    pub async fn create_schedule(&self, mut new: NewSchedule) -> Result<Schedule> {
        new.validate()?;
        for &zone_id in &new.zones {
            match self.store.get_zone(zone_id).await {
                Ok(_) => {}
                Err(Error::NotFound { .. }) => {
                    return Err(Error::invalid_input(format!(
                        "schedule references unknown zone {zone_id}"
                    )))
                }
                Err(e) => return Err(e),
            }
        }
        new.active = true;

        let schedule = self.store.create_schedule(new).await?;
        info!(schedule = schedule.id, name = %schedule.name, "schedule created");
        self.activity.write().await.record_schedule(format!(
            "{} created ({} on {:?})",
            schedule.name, schedule.time, schedule.days
        ));
        Ok(schedule)
    }

    pub async fn toggle_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        let current = self.store.get_schedule(id).await?;
        let schedule = self.store.set_schedule_active(id, !current.active).await?;

        let state = if schedule.active { "enabled" } else { "disabled" };
        info!(schedule = id, active = schedule.active, "schedule toggled");
        self.activity
            .write()
            .await
            .record_schedule(format!("{} {state}", schedule.name));

        if !schedule.active && self.options.stop_on_schedule_disable {
            self.stop_schedule_zones(&schedule).await;
        }
        Ok(schedule)
    }

    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        let schedule = self.store.get_schedule(id).await?;
        self.store.delete_schedule(id).await?;

        info!(schedule = id, "schedule deleted");
        self.activity
            .write()
            .await
            .record_schedule(format!("{} deleted", schedule.name));

        if self.options.stop_on_schedule_disable {
            self.stop_schedule_zones(&schedule).await;
        }
        Ok(())
    }

    /// Turn off the schedule's zones whose open session it started.
    async fn stop_schedule_zones(&self, schedule: &Schedule) {
        for &zone_id in &schedule.zones {
            if let Err(e) = self.runner.deactivate_if_owned(zone_id, schedule.id).await {
                error!(zone = zone_id, schedule = schedule.id, "could not stop zone: {e}");
                self.activity
                    .write()
                    .await
                    .record_error(format!("zone {zone_id}: stop after {} failed: {e}", schedule.name));
            }
        }
    }

    // -- history & dashboard -------------------------------------------------

    pub async fn events(&self, zone_id: Option<ZoneId>) -> Result<Vec<WateringEvent>> {
        if let Some(id) = zone_id {
            self.store.get_zone(id).await?;
        }
        self.store.list_watering_events(zone_id).await
    }

    /// Everything the dashboard shows, evaluated at local time `now`.
    pub async fn dashboard(&self, now: OffsetDateTime) -> Result<Dashboard> {
        let zones = self.store.list_zones().await?;
        let schedules = self.store.list_schedules().await?;
        let events = self.store.list_watering_events(None).await?;

        let upcoming: Vec<(&Schedule, OffsetDateTime)> = schedules
            .iter()
            .filter(|s| s.active)
            .filter_map(|s| matcher::next_occurrence(s, now).map(|at| (s, at)))
            .collect();

        let next_run = upcoming
            .iter()
            .min_by_key(|(_, at)| *at)
            .map(|(s, at)| NextRun {
                schedule_id: s.id,
                name: s.name.clone(),
                at: *at,
                zones: s.zones.clone(),
            });

        let average_moisture = (!zones.is_empty()).then(|| {
            let sum: u32 = zones.iter().map(|z| u32::from(z.moisture)).sum();
            (f64::from(sum) / zones.len() as f64 * 10.0).round() / 10.0
        });

        let overview = Overview {
            active_zones: zones.iter().filter(|z| z.active).count(),
            total_zones: zones.len(),
            average_moisture,
            next_run,
        };

        let zones = zones
            .into_iter()
            .map(|zone| {
                let last_watered = events
                    .iter()
                    .filter(|e| e.zone_id == zone.id)
                    .map(|e| e.start)
                    .max()
                    .map(|t| t.to_offset(now.offset()));
                let next_scheduled = upcoming
                    .iter()
                    .filter(|(s, _)| s.zones.contains(&zone.id))
                    .map(|(_, at)| *at)
                    .min();
                ZoneStatus {
                    zone,
                    last_watered,
                    next_scheduled,
                }
            })
            .collect();

        Ok(Dashboard {
            generated_at: now,
            overview,
            zones,
            schedules,
            pending_deactivations: self.runner.pending_deactivations().await,
            activity: self.activity.read().await.snapshot(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
