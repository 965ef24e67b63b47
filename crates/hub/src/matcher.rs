//! Decides which schedules are due at a given wall-clock instant.
//!
//! Matching is minute-granular: a schedule is due when the instant's weekday
//! is in its day set and the instant's hour and minute equal its fire time.
//! The caller must evaluate every minute; a skipped minute is never caught up.

use time::{Duration, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::warn;

use crate::model::{Day, FireTime, Schedule};

/// Active schedules due at `now`, in input order.
///
/// `now` is read in its own offset, so pass the local wall-clock time.
/// Schedules whose fire time does not parse are skipped for this call only.
pub fn find_due_schedules<'a>(schedules: &'a [Schedule], now: OffsetDateTime) -> Vec<&'a Schedule> {
    let today = Day::from(now.weekday());
    let (hour, minute) = (now.hour(), now.minute());

    schedules
        .iter()
        .filter(|s| s.active && s.days.contains(&today))
        .filter(|s| match s.fire_time() {
            Ok(t) => t.hour() == hour && t.minute() == minute,
            Err(e) => {
                warn!(schedule = s.id, "matcher: skipping schedule: {e}");
                false
            }
        })
        .collect()
}

/// The next instant strictly after `now` at which `schedule` fires, ignoring
/// its `active` flag. `None` when it has no days or an unparseable time.
pub fn next_occurrence(schedule: &Schedule, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let fire = schedule.fire_time().ok()?;
    let at = fire_time_of_day(fire)?;

    (0..=7).find_map(|offset| {
        let date = now.date().checked_add(Duration::days(offset))?;
        if !schedule.days.contains(&Day::from(date.weekday())) {
            return None;
        }
        let candidate = PrimitiveDateTime::new(date, at).assume_offset(now.offset());
        (candidate > now).then_some(candidate)
    })
}

fn fire_time_of_day(fire: FireTime) -> Option<Time> {
    Time::from_hms(fire.hour(), fire.minute(), 0).ok()
}

// ===========================================================================
// Tests
// ===========================================================================
