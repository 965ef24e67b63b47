//! Irrigation runner: turns zones on for manual or scheduled watering, keeps a
//! watering-event record per session, and turns each zone off again when its
//! time is up.
//!
//! ## Per-zone serialization
//!
//! Every zone owns a slot behind its own async mutex. Activation, deactivation
//! and timer expiry all take the slot lock before touching the store, so a
//! zone's `active` flag and its open watering event always change together:
//!
//! ```text
//! Off ──activate──▶ On{event, deadline} ──deadline / deactivate──▶ Off
//!                     │        ▲
//!                     └activate┘  (same event, deadline = max(old, new))
//! ```
//!
//! The slot holds at most one pending deactivation timer. Re-arming aborts the
//! previous timer, and each timer carries a generation number so a timer that
//! was already waiting on the lock when it got superseded does nothing.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::matcher;
use crate::model::{EventId, NewWateringEvent, ScheduleId, Trigger, WateringEvent, ZoneId};
use crate::state::SharedState;
use crate::store::Store;

/// How long a manual "water now" runs before the zone turns itself off.
pub const DEFAULT_MANUAL_DURATION: Duration = Duration::from_secs(10 * 60);

/// Delay before a failed timed shut-off is attempted again.
pub const SHUTOFF_RETRY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The zone was off; a new watering event was opened.
    Started,
    /// The zone was already watering; its session was kept and possibly lengthened.
    Extended,
}

#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub zone_id: ZoneId,
    pub event_id: EventId,
    pub outcome: Outcome,
    /// Time left until the zone turns off.
    pub runs_for_secs: u64,
}

/// What one evaluation tick did.
#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub fired: Vec<ScheduleId>,
    pub activations: Vec<Activation>,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingDeactivation {
    pub zone_id: ZoneId,
    pub event_id: EventId,
    pub remaining_secs: u64,
}

// ---------------------------------------------------------------------------
// Per-zone slot
// ---------------------------------------------------------------------------

struct Timer {
    generation: u64,
    deadline: Instant,
    event_id: EventId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ZoneSlot {
    timer: Option<Timer>,
}

impl ZoneSlot {
    fn cancel(&mut self) -> Option<Timer> {
        let timer = self.timer.take()?;
        timer.handle.abort();
        Some(timer)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

struct Inner<S> {
    store: Arc<S>,
    activity: SharedState,
    manual_duration: Duration,
    slots: StdMutex<HashMap<ZoneId, Arc<Mutex<ZoneSlot>>>>,
    generation: AtomicU64,
}

pub struct Runner<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Runner<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store> Runner<S> {
    pub fn new(store: Arc<S>, activity: SharedState, manual_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                activity,
                manual_duration,
                slots: StdMutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Turn a zone on. Manual runs last the configured manual duration,
    /// scheduled runs last the owning schedule's duration.
    pub async fn activate_zone(&self, zone_id: ZoneId, trigger: Trigger) -> Result<Activation> {
        let duration = match trigger {
            Trigger::Manual => self.inner.manual_duration,
            Trigger::Scheduled { schedule_id } => {
                self.inner.store.get_schedule(schedule_id).await?.duration()
            }
        };
        self.activate_for(zone_id, trigger, duration).await
    }

    /// Turn a zone off and close its open watering event. Turning off a zone
    /// that is not watering is a no-op and returns `None`.
    pub async fn deactivate_zone(&self, zone_id: ZoneId) -> Result<Option<WateringEvent>> {
        let slot = self.known_slot(zone_id).await?;
        let mut slot = slot.lock().await;
        let closed = self.close(zone_id).await?;
        slot.cancel();
        Ok(closed)
    }

    /// Turn a zone off only if its open session was started by `schedule_id`.
    /// A manual session, or one another schedule owns, keeps running and
    /// `None` is returned.
    pub async fn deactivate_if_owned(
        &self,
        zone_id: ZoneId,
        schedule_id: ScheduleId,
    ) -> Result<Option<WateringEvent>> {
        let slot = self.known_slot(zone_id).await?;
        let mut slot = slot.lock().await;
        let owner = self
            .inner
            .store
            .open_watering_event(zone_id)
            .await?
            .and_then(|event| event.schedule_id());
        if owner != Some(schedule_id) {
            return Ok(None);
        }
        let closed = self.close(zone_id).await?;
        slot.cancel();
        Ok(closed)
    }

    /// Drop the zone's pending deactivation without turning it off. Returns
    /// whether a timer was pending. The zone keeps watering until
    /// [`Runner::deactivate_zone`] is called.
    pub async fn cancel_pending_deactivation(&self, zone_id: ZoneId) -> bool {
        let Some(slot) = self.existing_slot(zone_id) else {
            return false;
        };
        let cancelled = slot.lock().await.cancel().is_some();
        if cancelled {
            warn!(zone = zone_id, "runner: pending deactivation cancelled");
        }
        cancelled
    }

    /// Evaluate all schedules at `now` and activate the targets of every due
    /// one, schedules in matcher order and zones in configured order. A zone
    /// that fails to start is logged and counted; its siblings still run.
    pub async fn run_due_schedules(&self, now: OffsetDateTime) -> Result<TickReport> {
        let schedules = self.inner.store.list_schedules().await?;
        let due = matcher::find_due_schedules(&schedules, now);
        let mut report = TickReport::default();

        for schedule in due {
            info!(
                schedule = schedule.id,
                name = %schedule.name,
                zones = ?schedule.zones,
                duration_min = schedule.duration_min,
                "runner: schedule due"
            );
            self.inner.activity.write().await.record_schedule(format!(
                "{} fired for zones {:?} ({} min)",
                schedule.name, schedule.zones, schedule.duration_min
            ));
            report.fired.push(schedule.id);

            let trigger = Trigger::Scheduled {
                schedule_id: schedule.id,
            };
            for &zone_id in &schedule.zones {
                match self.activate_for(zone_id, trigger, schedule.duration()).await {
                    Ok(activation) => report.activations.push(activation),
                    Err(e) => {
                        report.failures += 1;
                        error!(
                            zone = zone_id,
                            schedule = schedule.id,
                            "runner: scheduled activation failed: {e}"
                        );
                        self.inner.activity.write().await.record_error(format!(
                            "zone {zone_id}: {} could not start: {e}",
                            schedule.name
                        ));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Zones with a deactivation timer still running, by zone id.
    pub async fn pending_deactivations(&self) -> Vec<PendingDeactivation> {
        let now = Instant::now();
        let mut pending = Vec::new();
        for (zone_id, slot) in self.slots() {
            if let Some(t) = &slot.lock().await.timer {
                pending.push(PendingDeactivation {
                    zone_id,
                    event_id: t.event_id,
                    remaining_secs: t.deadline.saturating_duration_since(now).as_secs(),
                });
            }
        }
        pending.sort_by_key(|p| p.zone_id);
        pending
    }

    /// Fail-safe on exit: turn every active zone off and drop all timers.
    pub async fn shutdown(&self) {
        match self.inner.store.list_zones().await {
            Ok(zones) => {
                for zone in zones.into_iter().filter(|z| z.active) {
                    if let Err(e) = self.deactivate_zone(zone.id).await {
                        error!(zone = zone.id, "runner: shutdown deactivation failed: {e}");
                    }
                }
            }
            Err(e) => error!("runner: shutdown could not list zones: {e}"),
        }
        for (_, slot) in self.slots() {
            slot.lock().await.cancel();
        }
        info!("runner: stopped");
    }

    // -- internals ------------------------------------------------------------

    async fn activate_for(
        &self,
        zone_id: ZoneId,
        trigger: Trigger,
        duration: Duration,
    ) -> Result<Activation> {
        let slot = self.known_slot(zone_id).await?;
        let mut slot = slot.lock().await;
        let store = &self.inner.store;

        let zone = store.get_zone(zone_id).await?;
        let requested = Instant::now() + duration;

        let (event, outcome) = match store.open_watering_event(zone_id).await? {
            Some(event) => {
                if !zone.active {
                    store.set_zone_active(zone_id, true).await?;
                }
                (event, Outcome::Extended)
            }
            None => {
                let start = OffsetDateTime::now_utc();
                let event = store
                    .create_watering_event(NewWateringEvent {
                        zone_id,
                        start,
                        trigger,
                    })
                    .await?;
                if let Err(e) = store.set_zone_active(zone_id, true).await {
                    if let Err(undo) = store.close_open_watering_event(zone_id, start).await {
                        error!(
                            zone = zone_id,
                            event = event.id,
                            "runner: could not close event after failed activation: {undo}"
                        );
                    }
                    return Err(e);
                }
                (event, Outcome::Started)
            }
        };

        let kept = slot
            .timer
            .as_ref()
            .filter(|t| t.event_id == event.id && t.deadline >= requested)
            .map(|t| t.deadline);
        let deadline = match kept {
            Some(deadline) => deadline,
            None => {
                self.arm(&mut slot, zone_id, event.id, requested);
                requested
            }
        };
        let runs_for = deadline.saturating_duration_since(Instant::now());

        info!(
            zone = zone_id,
            event = event.id,
            ?trigger,
            ?outcome,
            runs_for_secs = runs_for.as_secs(),
            "runner: zone watering"
        );
        let how = match (trigger, outcome) {
            (Trigger::Manual, Outcome::Started) => "manual".to_string(),
            (Trigger::Scheduled { schedule_id }, Outcome::Started) => {
                format!("schedule {schedule_id}")
            }
            (_, Outcome::Extended) => "extended".to_string(),
        };
        self.inner.activity.write().await.record_zone(zone_id, true, &how);

        Ok(Activation {
            zone_id,
            event_id: event.id,
            outcome,
            runs_for_secs: runs_for.as_secs(),
        })
    }

    /// Flip the zone off and close its event. Caller holds the zone's slot.
    /// If the event cannot be closed the flag is put back, so the zone never
    /// reads as off while its session is still open.
    async fn close(&self, zone_id: ZoneId) -> Result<Option<WateringEvent>> {
        let store = &self.inner.store;
        let was_active = store.get_zone(zone_id).await?.active;
        if was_active {
            store.set_zone_active(zone_id, false).await?;
        }
        let closed = match store
            .close_open_watering_event(zone_id, OffsetDateTime::now_utc())
            .await
        {
            Ok(closed) => closed,
            Err(e) => {
                if was_active {
                    if let Err(undo) = store.set_zone_active(zone_id, true).await {
                        error!(zone = zone_id, "runner: could not restore active flag: {undo}");
                    }
                }
                return Err(e);
            }
        };
        if let Some(event) = &closed {
            info!(zone = zone_id, event = event.id, "runner: zone off");
            self.inner
                .activity
                .write()
                .await
                .record_zone(zone_id, false, &format!("event {}", event.id));
        }
        Ok(closed)
    }

    fn arm(&self, slot: &mut ZoneSlot, zone_id: ZoneId, event_id: EventId, deadline: Instant) {
        slot.cancel();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            runner.expire(zone_id, generation).await;
        });
        slot.timer = Some(Timer {
            generation,
            deadline,
            event_id,
            handle,
        });
    }

    /// Timer body. Failures stay inside this zone's task, which re-arms
    /// itself to try again after [`SHUTOFF_RETRY`].
    async fn expire(&self, zone_id: ZoneId, generation: u64) {
        let Some(slot) = self.existing_slot(zone_id) else {
            return;
        };
        let mut slot = slot.lock().await;
        let event_id = match &slot.timer {
            Some(t) if t.generation == generation => t.event_id,
            _ => return,
        };
        // Detach rather than abort: this is the task being dropped.
        slot.timer = None;

        if let Err(e) = self.close(zone_id).await {
            error!(
                zone = zone_id,
                event = event_id,
                retry_secs = SHUTOFF_RETRY.as_secs(),
                "runner: timed deactivation failed: {e}"
            );
            self.inner
                .activity
                .write()
                .await
                .record_error(format!("zone {zone_id}: timed shut-off failed: {e}"));
            self.arm(&mut slot, zone_id, event_id, Instant::now() + SHUTOFF_RETRY);
        }
    }

    /// Slot for a zone the store knows about. Unknown ids never get a slot.
    async fn known_slot(&self, zone_id: ZoneId) -> Result<Arc<Mutex<ZoneSlot>>> {
        if let Some(slot) = self.existing_slot(zone_id) {
            return Ok(slot);
        }
        self.inner.store.get_zone(zone_id).await?;
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(slots.entry(zone_id).or_default()))
    }

    fn existing_slot(&self, zone_id: ZoneId) -> Option<Arc<Mutex<ZoneSlot>>> {
        let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&zone_id).map(Arc::clone)
    }

    fn slots(&self) -> Vec<(ZoneId, Arc<Mutex<ZoneSlot>>)> {
        let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.iter().map(|(id, s)| (*id, Arc::clone(s))).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
