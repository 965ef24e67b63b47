//! TOML config file loading, validation, and store seeding for zones and
//! schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::model::{minutes, NewSchedule, Zone, ZoneId};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub schedules: Vec<NewSchedule>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Seconds between schedule evaluations. At most 60 so no minute is skipped.
    pub poll_interval_sec: u64,
    /// How long "water now" runs.
    pub manual_duration_min: u32,
    /// Offset of the wall clock schedules are written against, e.g. "+02:00".
    pub utc_offset: String,
    /// Turn off zones still watering for a schedule when it is disabled or deleted.
    pub stop_on_schedule_disable: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval_sec: 20,
            manual_duration_min: 10,
            utc_offset: "+00:00".to_string(),
            stop_on_schedule_disable: false,
        }
    }
}

impl RunnerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn manual_duration(&self) -> Duration {
        minutes(self.manual_duration_min)
    }

    pub fn offset(&self) -> Result<UtcOffset> {
        UtcOffset::parse(
            self.utc_offset.trim(),
            format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
        )
        .with_context(|| format!("utc_offset '{}' is not +HH:MM", self.utc_offset))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub enabled: bool,
    pub interval_sec: u64,
    pub min_moisture: u8,
    pub max_moisture: u8,
    /// Largest change applied to a zone in one step, in percentage points.
    pub max_step: u8,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 30,
            min_moisture: 45,
            max_moisture: 85,
            max_step: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub id: ZoneId,
    pub name: String,
    #[serde(default = "default_moisture")]
    pub moisture: u8,
}

fn default_moisture() -> u8 {
    60
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_runner(&mut errors);
        self.validate_simulation(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_runner(&self, errors: &mut Vec<String>) {
        let r = &self.runner;
        if !(1..=60).contains(&r.poll_interval_sec) {
            errors.push(format!(
                "runner: poll_interval_sec must be within 1-60, got {}",
                r.poll_interval_sec
            ));
        }
        if r.manual_duration_min == 0 {
            errors.push("runner: manual_duration_min must be positive".to_string());
        }
        if let Err(e) = r.offset() {
            errors.push(format!("runner: {e}"));
        }
    }

    fn validate_simulation(&self, errors: &mut Vec<String>) {
        let s = &self.simulation;
        if !s.enabled {
            return;
        }
        if s.interval_sec == 0 {
            errors.push("simulation: interval_sec must be positive".to_string());
        }
        if s.max_moisture > 100 {
            errors.push(format!(
                "simulation: max_moisture {} out of range [0, 100]",
                s.max_moisture
            ));
        }
        if s.min_moisture >= s.max_moisture {
            errors.push(format!(
                "simulation: min_moisture ({}) must be less than max_moisture ({})",
                s.min_moisture, s.max_moisture
            ));
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<ZoneId> = HashSet::new();

        for z in &self.zones {
            if !seen_ids.insert(z.id) {
                errors.push(format!("zone {}: duplicate id", z.id));
            }
            if z.name.trim().is_empty() {
                errors.push(format!("zone {}: name is empty", z.id));
            }
            if z.moisture > 100 {
                errors.push(format!(
                    "zone {}: moisture {} out of range [0, 100]",
                    z.id, z.moisture
                ));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<ZoneId> = self.zones.iter().map(|z| z.id).collect();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = if s.name.trim().is_empty() {
                format!("schedules[{i}]")
            } else {
                format!("schedule '{}'", s.name)
            };

            if let Err(e) = s.validate() {
                errors.push(format!("{ctx}: {e}"));
            }
            for zone in &s.zones {
                if !zone_ids.contains(zone) {
                    errors.push(format!("{ctx}: references unknown zone {zone}"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all zones into the store, switched off. Schedules are seeded only
/// into a store that has none yet, so a persistent store keeps user edits.
pub async fn apply<S: Store>(config: &Config, store: &S) -> Result<()> {
    for z in &config.zones {
        store
            .upsert_zone(&Zone {
                id: z.id,
                name: z.name.clone(),
                active: false,
                moisture: z.moisture,
            })
            .await
            .with_context(|| format!("failed to upsert zone {}", z.id))?;

        // A session left open by an unclean exit ends now, with the zone off.
        let closed = store
            .close_open_watering_event(z.id, OffsetDateTime::now_utc())
            .await
            .with_context(|| format!("failed to close stale event for zone {}", z.id))?;
        if let Some(event) = closed {
            tracing::warn!(zone = z.id, event = event.id, "closed watering event left open");
        }
    }

    let existing = store
        .list_schedules()
        .await
        .context("failed to list schedules")?;
    let seeded = if existing.is_empty() {
        for s in &config.schedules {
            store
                .create_schedule(s.clone())
                .await
                .with_context(|| format!("failed to create schedule '{}'", s.name))?;
        }
        config.schedules.len()
    } else {
        0
    };

    tracing::info!(
        zones = config.zones.len(),
        schedules_seeded = seeded,
        schedules_kept = existing.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Day, NewWateringEvent, Trigger};
    use crate::store::MemoryStore;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_zone(id: ZoneId) -> ZoneEntry {
        ZoneEntry {
            id,
            name: format!("Zone {id}"),
            moisture: 62,
        }
    }

    fn valid_schedule() -> NewSchedule {
        NewSchedule {
            name: "Morning Routine".into(),
            time: "5:30 AM".into(),
            days: vec![Day::Mon, Day::Wed, Day::Fri],
            zones: vec![1, 2],
            duration_min: 15,
            active: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            zones: vec![valid_zone(1), valid_zone(2)],
            schedules: vec![valid_schedule()],
            ..Config::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[runner]
poll_interval_sec = 30
utc_offset = "+02:00"

[[zones]]
id = 1
name = "Front Lawn"
moisture = 62

[[schedules]]
name = "Morning Routine"
time = "5:30 AM"
days = ["Mon", "Wed", "Fri"]
zones = [1]
duration_min = 15
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].days, vec![Day::Mon, Day::Wed, Day::Fri]);
        assert!(config.schedules[0].active);
        assert_eq!(config.runner.poll_interval_sec, 30);
        assert_eq!(config.runner.manual_duration_min, 10);
        assert_eq!(
            config.runner.offset().unwrap(),
            UtcOffset::from_hms(2, 0, 0).unwrap()
        );
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.zones.is_empty());
        assert!(config.schedules.is_empty());
        assert_eq!(config.runner.poll_interval(), Duration::from_secs(20));
        assert_eq!(config.runner.manual_duration(), Duration::from_secs(600));
        assert!(config.simulation.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn shipped_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../../../config.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.zones.len(), 6);
        assert_eq!(config.schedules.len(), 3);
        assert!(!config.schedules[2].active);
    }

    #[test]
    fn unknown_day_name_fails_to_parse() {
        let toml_str = r#"
[[schedules]]
name = "x"
time = "5:30 AM"
days = ["Monday"]
zones = [1]
duration_min = 15
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Runner settings ---------------------------------------------------

    #[test]
    fn poll_interval_zero_rejected() {
        let mut cfg = valid_config();
        cfg.runner.poll_interval_sec = 0;
        assert_validation_err(&cfg, "poll_interval_sec");
    }

    #[test]
    fn poll_interval_over_a_minute_rejected() {
        let mut cfg = valid_config();
        cfg.runner.poll_interval_sec = 61;
        assert_validation_err(&cfg, "poll_interval_sec must be within 1-60");
    }

    #[test]
    fn poll_interval_boundary_60_accepted() {
        let mut cfg = valid_config();
        cfg.runner.poll_interval_sec = 60;
        cfg.validate().unwrap();
    }

    #[test]
    fn manual_duration_zero_rejected() {
        let mut cfg = valid_config();
        cfg.runner.manual_duration_min = 0;
        assert_validation_err(&cfg, "manual_duration_min");
    }

    #[test]
    fn bad_utc_offset_rejected() {
        let mut cfg = valid_config();
        cfg.runner.utc_offset = "CET".into();
        assert_validation_err(&cfg, "utc_offset 'CET'");
    }

    #[test]
    fn negative_utc_offset_accepted() {
        let mut cfg = valid_config();
        cfg.runner.utc_offset = "-05:30".into();
        assert_eq!(
            cfg.runner.offset().unwrap(),
            UtcOffset::from_hms(-5, -30, 0).unwrap()
        );
    }

    // -- Simulation --------------------------------------------------------

    #[test]
    fn simulation_bounds_inverted_rejected() {
        let mut cfg = valid_config();
        cfg.simulation.min_moisture = 80;
        cfg.simulation.max_moisture = 50;
        assert_validation_err(&cfg, "must be less than max_moisture");
    }

    #[test]
    fn simulation_max_above_hundred_rejected() {
        let mut cfg = valid_config();
        cfg.simulation.max_moisture = 120;
        assert_validation_err(&cfg, "max_moisture 120");
    }

    #[test]
    fn disabled_simulation_not_validated() {
        let mut cfg = valid_config();
        cfg.simulation.enabled = false;
        cfg.simulation.interval_sec = 0;
        cfg.validate().unwrap();
    }

    // -- Zones -------------------------------------------------------------

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(valid_zone(1));
        assert_validation_err(&cfg, "zone 1: duplicate id");
    }

    #[test]
    fn zone_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn zone_moisture_above_hundred_rejected() {
        let mut cfg = valid_config();
        cfg.zones[1].moisture = 101;
        assert_validation_err(&cfg, "moisture 101");
    }

    // -- Schedules ---------------------------------------------------------

    #[test]
    fn schedule_bad_time_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].time = "13:00 PM".into();
        assert_validation_err(&cfg, "invalid schedule time '13:00 PM'");
    }

    #[test]
    fn schedule_unknown_zone_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].zones = vec![1, 7];
        assert_validation_err(&cfg, "references unknown zone 7");
    }

    #[test]
    fn schedule_zero_duration_rejected() {
        let mut cfg = valid_config();
        cfg.schedules[0].duration_min = 0;
        assert_validation_err(&cfg, "duration_min must be positive");
    }

    #[test]
    fn unnamed_schedule_reported_by_index() {
        let mut cfg = valid_config();
        cfg.schedules[0].name = String::new();
        assert_validation_err(&cfg, "schedules[0]");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.runner.poll_interval_sec = 0;
        cfg.zones[0].name = String::new();
        cfg.schedules[0].days.clear();
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        // Should report many errors, not bail after the first
        assert!(msg.contains("3 errors"), "wrong count in: {msg}");
        assert!(msg.contains("poll_interval_sec"), "missing runner error in: {msg}");
        assert!(msg.contains("name is empty"), "missing zone error in: {msg}");
        assert!(msg.contains("no days"), "missing schedule error in: {msg}");
    }

    // -- Store seeding ----------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_store() {
        let store = MemoryStore::new();
        let config = valid_config();
        apply(&config, &store).await.unwrap();

        let zones = store.list_zones().await.unwrap();
        assert_eq!(zones.len(), 2);
        assert!(zones.iter().all(|z| !z.active));
        assert_eq!(zones[0].moisture, 62);

        let schedules = store.list_schedules().await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].name, "Morning Routine");
    }

    #[tokio::test]
    async fn apply_closes_sessions_left_open() {
        let store = MemoryStore::new();
        let config = valid_config();
        apply(&config, &store).await.unwrap();
        store
            .create_watering_event(NewWateringEvent {
                zone_id: 1,
                start: OffsetDateTime::now_utc(),
                trigger: Trigger::Manual,
            })
            .await
            .unwrap();
        store.set_zone_active(1, true).await.unwrap();

        apply(&config, &store).await.unwrap();
        assert!(!store.get_zone(1).await.unwrap().active);
        assert!(store.open_watering_event(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_twice_does_not_duplicate_schedules() {
        let store = MemoryStore::new();
        let config = valid_config();
        apply(&config, &store).await.unwrap();
        apply(&config, &store).await.unwrap();

        assert_eq!(store.list_zones().await.unwrap().len(), 2);
        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
    }
}
