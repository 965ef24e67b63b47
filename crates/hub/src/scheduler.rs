//! Schedule polling loop: wakes on a fixed interval, reads the local wall
//! clock, and hands every new minute to the runner once.
//!
//! Polls faster than once a minute so no fire minute is missed; the
//! [`MinuteGate`] drops the extra polls that land in a minute already
//! evaluated. Minutes slept through (suspend, long stalls) are not caught up.

use std::time::Duration;

use time::{Date, OffsetDateTime, UtcOffset};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::runner::{Runner, TickReport};
use crate::state::SharedState;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Minute gate
// ---------------------------------------------------------------------------

/// Remembers the last wall-clock minute that was evaluated.
#[derive(Debug, Default)]
pub struct MinuteGate {
    last: Option<(Date, u8, u8)>,
}

impl MinuteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `now` falls in a minute later than the last evaluated one.
    pub fn is_new(&self, now: OffsetDateTime) -> bool {
        self.last.map_or(true, |last| minute_key(now) > last)
    }

    pub fn mark(&mut self, now: OffsetDateTime) {
        self.last = Some(minute_key(now));
    }
}

fn minute_key(now: OffsetDateTime) -> (Date, u8, u8) {
    (now.date(), now.hour(), now.minute())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the polling loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run<S: Store>(
    runner: Runner<S>,
    activity: SharedState,
    poll_interval: Duration,
    offset: UtcOffset,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gate = MinuteGate::new();

    info!(
        poll_interval_sec = poll_interval.as_secs(),
        %offset,
        "scheduler started"
    );
    activity.write().await.record_system(format!(
        "scheduler started (poll every {}s, clock UTC{offset})",
        poll_interval.as_secs()
    ));

    loop {
        ticker.tick().await;
        let now = OffsetDateTime::now_utc().to_offset(offset);
        tick(&runner, &activity, &mut gate, now).await;
    }
}

/// One poll. Returns the runner's report when `now` opened a new minute.
///
/// A failed evaluation leaves the minute unmarked so the next poll inside
/// the same minute tries again.
pub async fn tick<S: Store>(
    runner: &Runner<S>,
    activity: &SharedState,
    gate: &mut MinuteGate,
    now: OffsetDateTime,
) -> Option<TickReport> {
    if !gate.is_new(now) {
        return None;
    }

    match runner.run_due_schedules(now).await {
        Ok(report) => {
            gate.mark(now);
            if !report.fired.is_empty() {
                info!(
                    fired = ?report.fired,
                    started = report.activations.len(),
                    failures = report.failures,
                    "scheduler: minute evaluated"
                );
            }
            Some(report)
        }
        Err(e) => {
            error!("scheduler: schedule evaluation failed: {e}");
            activity
                .write()
                .await
                .record_error(format!("schedule evaluation failed: {e}"));
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
