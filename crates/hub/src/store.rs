//! Persistence port used by the runner and the user actions, plus the
//! in-memory store that backs the dashboard by default.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{
    EventId, MoistureReading, NewSchedule, NewWateringEvent, Schedule, ScheduleId, WateringEvent,
    Zone, ZoneId,
};

/// Samples kept per zone by [`MemoryStore`]: a day at the default 30 s
/// simulation interval.
pub const MAX_READINGS_PER_ZONE: usize = 2880;

/// Zone, schedule and watering-event storage.
///
/// Unknown ids are reported as [`Error::NotFound`]; rejected writes as
/// [`Error::Persistence`].
pub trait Store: Send + Sync + 'static {
    fn list_zones(&self) -> impl Future<Output = Result<Vec<Zone>>> + Send;

    fn get_zone(&self, id: ZoneId) -> impl Future<Output = Result<Zone>> + Send;

    /// Insert or replace a zone. Only used to seed the fixed zone set at startup.
    fn upsert_zone(&self, zone: &Zone) -> impl Future<Output = Result<()>> + Send;

    fn set_zone_active(&self, id: ZoneId, active: bool)
        -> impl Future<Output = Result<Zone>> + Send;

    /// Update the zone's moisture and record the sample in its history.
    fn set_zone_moisture(&self, id: ZoneId, pct: u8) -> impl Future<Output = Result<Zone>> + Send;

    /// The newest `limit` moisture samples, oldest first, optionally for one zone.
    fn moisture_history(
        &self,
        zone_id: Option<ZoneId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<MoistureReading>>> + Send;

    /// All schedules, in creation order.
    fn list_schedules(&self) -> impl Future<Output = Result<Vec<Schedule>>> + Send;

    fn get_schedule(&self, id: ScheduleId) -> impl Future<Output = Result<Schedule>> + Send;

    fn create_schedule(&self, new: NewSchedule) -> impl Future<Output = Result<Schedule>> + Send;

    fn set_schedule_active(
        &self,
        id: ScheduleId,
        active: bool,
    ) -> impl Future<Output = Result<Schedule>> + Send;

    fn delete_schedule(&self, id: ScheduleId) -> impl Future<Output = Result<()>> + Send;

    fn create_watering_event(
        &self,
        new: NewWateringEvent,
    ) -> impl Future<Output = Result<WateringEvent>> + Send;

    /// The zone's event without an end timestamp, if any.
    fn open_watering_event(
        &self,
        zone_id: ZoneId,
    ) -> impl Future<Output = Result<Option<WateringEvent>>> + Send;

    /// Stamp `end` on the zone's open event. Returns `None` when nothing was open.
    fn close_open_watering_event(
        &self,
        zone_id: ZoneId,
        end: OffsetDateTime,
    ) -> impl Future<Output = Result<Option<WateringEvent>>> + Send;

    /// Events oldest first, optionally restricted to one zone.
    fn list_watering_events(
        &self,
        zone_id: Option<ZoneId>,
    ) -> impl Future<Output = Result<Vec<WateringEvent>>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    zones: BTreeMap<ZoneId, Zone>,
    schedules: Vec<Schedule>,
    events: Vec<WateringEvent>,
    readings: BTreeMap<ZoneId, VecDeque<MoistureReading>>,
    next_schedule_id: ScheduleId,
    next_event_id: EventId,
}

/// Mock store: everything lives in process memory and is lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn list_zones(&self) -> Result<Vec<Zone>> {
        Ok(self.tables.read().await.zones.values().cloned().collect())
    }

    async fn get_zone(&self, id: ZoneId) -> Result<Zone> {
        self.tables
            .read()
            .await
            .zones
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::zone_not_found(id))
    }

    async fn upsert_zone(&self, zone: &Zone) -> Result<()> {
        self.tables.write().await.zones.insert(zone.id, zone.clone());
        Ok(())
    }

    async fn set_zone_active(&self, id: ZoneId, active: bool) -> Result<Zone> {
        let mut t = self.tables.write().await;
        let zone = t.zones.get_mut(&id).ok_or_else(|| Error::zone_not_found(id))?;
        zone.active = active;
        Ok(zone.clone())
    }

    async fn set_zone_moisture(&self, id: ZoneId, pct: u8) -> Result<Zone> {
        if pct > 100 {
            return Err(Error::invalid_input(format!("moisture {pct} exceeds 100")));
        }
        let mut t = self.tables.write().await;
        let zone = t.zones.get_mut(&id).ok_or_else(|| Error::zone_not_found(id))?;
        zone.moisture = pct;
        let zone = zone.clone();

        let history = t.readings.entry(id).or_default();
        if history.len() == MAX_READINGS_PER_ZONE {
            history.pop_front();
        }
        history.push_back(MoistureReading {
            zone_id: id,
            ts: OffsetDateTime::now_utc(),
            moisture: pct,
        });
        Ok(zone)
    }

    async fn moisture_history(
        &self,
        zone_id: Option<ZoneId>,
        limit: usize,
    ) -> Result<Vec<MoistureReading>> {
        let t = self.tables.read().await;
        let mut readings: Vec<MoistureReading> = match zone_id {
            Some(id) => t.readings.get(&id).into_iter().flatten().copied().collect(),
            None => t.readings.values().flatten().copied().collect(),
        };
        readings.sort_by_key(|r| r.ts);
        let skip = readings.len().saturating_sub(limit);
        Ok(readings.split_off(skip))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self.tables.read().await.schedules.clone())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Schedule> {
        self.tables
            .read()
            .await
            .schedules
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::schedule_not_found(id))
    }

    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let mut t = self.tables.write().await;
        t.next_schedule_id += 1;
        let schedule = new.into_schedule(t.next_schedule_id);
        t.schedules.push(schedule.clone());
        Ok(schedule)
    }

    async fn set_schedule_active(&self, id: ScheduleId, active: bool) -> Result<Schedule> {
        let mut t = self.tables.write().await;
        let schedule = t
            .schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::schedule_not_found(id))?;
        schedule.active = active;
        Ok(schedule.clone())
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<()> {
        let mut t = self.tables.write().await;
        let idx = t
            .schedules
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::schedule_not_found(id))?;
        t.schedules.remove(idx);
        Ok(())
    }

    async fn create_watering_event(&self, new: NewWateringEvent) -> Result<WateringEvent> {
        let mut t = self.tables.write().await;
        if !t.zones.contains_key(&new.zone_id) {
            return Err(Error::zone_not_found(new.zone_id));
        }
        t.next_event_id += 1;
        let event = WateringEvent {
            id: t.next_event_id,
            zone_id: new.zone_id,
            start: new.start,
            end: None,
            trigger: new.trigger,
        };
        t.events.push(event.clone());
        Ok(event)
    }

    async fn open_watering_event(&self, zone_id: ZoneId) -> Result<Option<WateringEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .iter()
            .find(|e| e.zone_id == zone_id && e.is_open())
            .cloned())
    }

    async fn close_open_watering_event(
        &self,
        zone_id: ZoneId,
        end: OffsetDateTime,
    ) -> Result<Option<WateringEvent>> {
        let mut t = self.tables.write().await;
        Ok(t
            .events
            .iter_mut()
            .find(|e| e.zone_id == zone_id && e.is_open())
            .map(|e| {
                e.end = Some(end.max(e.start));
                e.clone()
            }))
    }

    async fn list_watering_events(&self, zone_id: Option<ZoneId>) -> Result<Vec<WateringEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .iter()
            .filter(|e| zone_id.map_or(true, |z| e.zone_id == z))
            .cloned()
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Day, Trigger};

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, name) in [(1, "Front Lawn"), (2, "Back Lawn")] {
            store
                .upsert_zone(&Zone {
                    id,
                    name: name.into(),
                    active: false,
                    moisture: 60,
                })
                .await
                .unwrap();
        }
        store
    }

    fn new_schedule(name: &str) -> NewSchedule {
        NewSchedule {
            name: name.into(),
            time: "5:30 AM".into(),
            days: vec![Day::Mon],
            zones: vec![1],
            duration_min: 10,
            active: true,
        }
    }

    #[tokio::test]
    async fn unknown_zone_is_not_found() {
        let store = seeded().await;
        assert!(matches!(store.get_zone(9).await, Err(Error::NotFound { .. })));
        assert!(matches!(
            store.set_zone_active(9, true).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn zones_listed_by_id() {
        let store = seeded().await;
        let ids: Vec<_> = store.list_zones().await.unwrap().iter().map(|z| z.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn moisture_above_hundred_rejected() {
        let store = seeded().await;
        assert!(matches!(
            store.set_zone_moisture(1, 101).await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(store.set_zone_moisture(1, 100).await.unwrap().moisture, 100);
    }

    #[tokio::test]
    async fn moisture_updates_build_history() {
        let store = seeded().await;
        for pct in [58, 57, 59] {
            store.set_zone_moisture(1, pct).await.unwrap();
        }
        store.set_zone_moisture(2, 70).await.unwrap();

        let zone1: Vec<u8> = store
            .moisture_history(Some(1), 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.moisture)
            .collect();
        assert_eq!(zone1, vec![58, 57, 59]);

        let latest = store.moisture_history(Some(1), 2).await.unwrap();
        assert_eq!(latest.iter().map(|r| r.moisture).collect::<Vec<_>>(), vec![57, 59]);

        assert_eq!(store.moisture_history(None, 10).await.unwrap().len(), 4);
        assert!(store.moisture_history(Some(9), 10).await.unwrap().is_empty());

        // Rejected samples are not recorded.
        assert!(store.set_zone_moisture(1, 101).await.is_err());
        assert!(store.set_zone_moisture(9, 50).await.is_err());
        assert_eq!(store.moisture_history(None, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn moisture_history_is_bounded_per_zone() {
        let store = seeded().await;
        for i in 0..MAX_READINGS_PER_ZONE + 5 {
            store.set_zone_moisture(1, (i % 100) as u8).await.unwrap();
        }
        let history = store.moisture_history(Some(1), usize::MAX).await.unwrap();
        assert_eq!(history.len(), MAX_READINGS_PER_ZONE);
        assert_eq!(history[0].moisture, 5);
        assert!(history.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[tokio::test]
    async fn schedules_get_increasing_ids_in_creation_order() {
        let store = seeded().await;
        let a = store.create_schedule(new_schedule("a")).await.unwrap();
        let b = store.create_schedule(new_schedule("b")).await.unwrap();
        assert!(b.id > a.id);
        let names: Vec<_> = store
            .list_schedules()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_schedule_twice_is_not_found() {
        let store = seeded().await;
        let s = store.create_schedule(new_schedule("a")).await.unwrap();
        store.delete_schedule(s.id).await.unwrap();
        assert!(matches!(
            store.delete_schedule(s.id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn close_only_touches_the_open_event() {
        let store = seeded().await;
        let start = OffsetDateTime::now_utc();
        let ev = store
            .create_watering_event(NewWateringEvent {
                zone_id: 1,
                start,
                trigger: Trigger::Manual,
            })
            .await
            .unwrap();
        assert_eq!(store.open_watering_event(1).await.unwrap(), Some(ev.clone()));

        let closed = store
            .close_open_watering_event(1, start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.id, ev.id);
        assert!(closed.end.is_some());

        assert!(store.open_watering_event(1).await.unwrap().is_none());
        assert!(store
            .close_open_watering_event(1, start)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.list_watering_events(Some(1)).await.unwrap().len(), 1);
        assert!(store.list_watering_events(Some(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_for_unknown_zone_rejected() {
        let store = seeded().await;
        let res = store
            .create_watering_event(NewWateringEvent {
                zone_id: 42,
                start: OffsetDateTime::now_utc(),
                trigger: Trigger::Manual,
            })
            .await;
        assert!(matches!(res, Err(Error::NotFound { .. })));
    }
}
