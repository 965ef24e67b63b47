//! Simulated soil moisture for local development.
//!
//! Each step nudges every zone's moisture by a small random amount and keeps
//! it inside a plausible band, so the dashboard has live-looking readings
//! without any sensor hardware.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::SimulationSettings;
use crate::error::Result;
use crate::state::SharedState;
use crate::store::Store;

/// Bounded random walk applied to every zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoistureWalk {
    pub min: u8,
    pub max: u8,
    pub max_step: u8,
}

impl From<&SimulationSettings> for MoistureWalk {
    fn from(s: &SimulationSettings) -> Self {
        Self {
            min: s.min_moisture,
            max: s.max_moisture,
            max_step: s.max_step,
        }
    }
}

impl MoistureWalk {
    /// Uniform change in `-max_step..=max_step`.
    pub fn sample_delta(&self, rng: &mut fastrand::Rng) -> i16 {
        let step = i16::from(self.max_step);
        rng.i16(-step..=step)
    }

    /// Apply `delta` to `current` and clamp into `min..=max`. A reading that
    /// starts outside the band is pulled back onto its edge.
    pub fn apply(&self, current: u8, delta: i16) -> u8 {
        let next = i16::from(current) + delta;
        next.clamp(i16::from(self.min), i16::from(self.max)) as u8
    }
}

/// One simulation step over all zones. Returns how many zones were updated.
/// A zone that fails to update is logged and skipped.
pub async fn step<S: Store>(
    store: &S,
    walk: &MoistureWalk,
    rng: &mut fastrand::Rng,
) -> Result<usize> {
    let zones = store.list_zones().await?;
    let mut updated = 0;

    for zone in zones {
        let next = walk.apply(zone.moisture, walk.sample_delta(rng));
        if next == zone.moisture {
            continue;
        }
        match store.set_zone_moisture(zone.id, next).await {
            Ok(_) => {
                debug!(zone = zone.id, from = zone.moisture, to = next, "sim: moisture");
                updated += 1;
            }
            Err(e) => error!(zone = zone.id, "sim: moisture update failed: {e}"),
        }
    }

    Ok(updated)
}

/// Run the simulation loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run<S: Store>(
    store: Arc<S>,
    walk: MoistureWalk,
    interval: Duration,
    activity: SharedState,
) {
    let mut rng = fastrand::Rng::new();
    let mut ticker = tokio::time::interval(interval);

    info!(
        interval_sec = interval.as_secs(),
        min = walk.min,
        max = walk.max,
        max_step = walk.max_step,
        "moisture simulation started"
    );
    activity.write().await.record_system(format!(
        "moisture simulation started ({}..={}%, every {}s)",
        walk.min,
        walk.max,
        interval.as_secs()
    ));

    loop {
        ticker.tick().await;
        if let Err(e) = step(store.as_ref(), &walk, &mut rng).await {
            error!("sim: step failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
