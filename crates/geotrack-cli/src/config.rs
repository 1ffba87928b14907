use anyhow::{Context, Result};
use serde::Deserialize;

use geotrack_nav::{doctor as nav_doctor, AccuracyGate, FenceConfigError, FenceDef};
use geotrack_store::{load_json, KvStore, KEY_GEOFENCES};
use geotrack_uplink::{doctor as uplink_doctor, SchedulerConfig, SimConfig};
use tracing::warn;

use crate::node::NodeConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub lorawan: LorawanCfg,
    #[serde(default)]
    pub radio: RadioCfg,
    pub gnss: GnssCfg,
    #[serde(default)]
    pub geofence: GeofenceCfg,
    pub storage: StorageCfg,
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Deserialize)]
pub struct LorawanCfg {
    pub dev_eui: String,
    pub join_eui: String,
    pub app_key: String,
    #[serde(flatten)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize)]
pub struct RadioCfg {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
    #[serde(default = "default_spool_max_mb")]
    pub spool_max_mb: u64,
    #[serde(default)]
    pub sim: SimConfig,
}

fn default_backend() -> String {
    "sim".to_string()
}

fn default_spool_dir() -> String {
    "spool".to_string()
}

fn default_spool_max_mb() -> u64 {
    8
}

impl Default for RadioCfg {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            spool_dir: default_spool_dir(),
            spool_max_mb: default_spool_max_mb(),
            sim: SimConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GnssCfg {
    /// JSON-lines fix log replayed as the position source.
    pub fix_log: String,
    #[serde(default = "default_min_sats")]
    pub min_sats: u8,
    #[serde(default = "default_max_hdop")]
    pub max_hdop: f32,
}

fn default_min_sats() -> u8 {
    4
}

fn default_max_hdop() -> f32 {
    10.0
}

impl GnssCfg {
    pub fn gate(&self) -> AccuracyGate {
        AccuracyGate { min_sats: self.min_sats, max_hdop: self.max_hdop }
    }
}

#[derive(Debug, Deserialize)]
pub struct GeofenceCfg {
    #[serde(default = "default_hysteresis_m")]
    pub hysteresis_m: f64,
    #[serde(default)]
    pub fences: Vec<FenceCfg>,
}

fn default_hysteresis_m() -> f64 {
    2.0
}

impl Default for GeofenceCfg {
    fn default() -> Self {
        Self { hysteresis_m: default_hysteresis_m(), fences: Vec::new() }
    }
}

/// Fence as written by an operator: centre in degrees.
#[derive(Debug, Clone, Deserialize)]
pub struct FenceCfg {
    pub id: u8,
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f32,
}

impl FenceCfg {
    pub fn to_def(&self) -> Result<FenceDef, FenceConfigError> {
        FenceDef::from_degrees(self.id, self.lat, self.lon, self.radius_m)
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageCfg {
    pub dir: String,
}

pub fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    parse_config(&s)
}

pub fn parse_config(s: &str) -> Result<Config> {
    toml::from_str(s).context("parse config toml")
}

/// Checks everything that can be judged from the file alone. `run` refuses
/// to start and `doctor` fails on the first problem found.
pub fn check_config(cfg: &Config) -> Result<()> {
    uplink_doctor::check_credentials(&cfg.lorawan.dev_eui, &cfg.lorawan.join_eui, &cfg.lorawan.app_key)?;
    uplink_doctor::check_timing(&cfg.lorawan.scheduler)?;
    match cfg.radio.backend.as_str() {
        "sim" => uplink_doctor::check_sim(&cfg.radio.sim)?,
        "spool" => uplink_doctor::check_spool(&cfg.radio.spool_dir, cfg.radio.spool_max_mb)?,
        other => anyhow::bail!("unknown radio.backend: {}", other),
    }
    nav_doctor::check_accuracy_gate(&cfg.gnss.gate())?;
    anyhow::ensure!(cfg.node.sample_interval_ms >= 1, "node.sample_interval_ms must be >= 1");
    anyhow::ensure!(cfg.node.event_queue >= 1, "node.event_queue must be >= 1");
    Ok(())
}

/// The fence set in force: the persisted one if present and readable,
/// otherwise the configured seed list.
pub fn effective_fences(cfg: &Config, store: &dyn KvStore) -> Result<Vec<FenceDef>> {
    match load_json::<Vec<FenceDef>>(store, KEY_GEOFENCES) {
        Ok(Some(defs)) => match geotrack_nav::geofence::validate(&defs) {
            Ok(()) => return Ok(defs),
            Err(e) => warn!("config: stored geofences invalid ({}), using configured set", e),
        },
        Ok(None) => {}
        Err(e) => warn!("config: stored geofences unreadable ({:#}), using configured set", e),
    }
    cfg.geofence
        .fences
        .iter()
        .map(FenceCfg::to_def)
        .collect::<Result<_, _>>()
        .context("geofence.fences")
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_store::{save_json, MemoryStore};
    use geotrack_uplink::ExhaustionPolicy;

    const SAMPLE: &str = include_str!("../../../config/geotrack.toml");

    #[test]
    fn sample_config_parses() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.lorawan.dev_eui, "58EC3C43CA480000");
        assert_eq!(cfg.lorawan.scheduler.port, 1);
        assert_eq!(cfg.lorawan.scheduler.tx_interval_ms, 60_000);
        assert_eq!(cfg.lorawan.scheduler.join_retry_delay_ms, 30_000);
        assert_eq!(cfg.lorawan.scheduler.max_join_attempts, 10);
        assert_eq!(cfg.radio.backend, "sim");
        assert_eq!(cfg.gnss.gate(), AccuracyGate::default());
        assert_eq!(cfg.geofence.hysteresis_m, 2.0);
        let defs: Vec<FenceDef> = cfg.geofence.fences.iter().map(|f| f.to_def().unwrap()).collect();
        assert_eq!(defs[0], FenceDef { id: 0, lat_e6: -33_448_900, lon_e6: -70_669_300, radius_m: 100.0 });
        geotrack_nav::geofence::validate(&defs).unwrap();
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(
            r#"
            [lorawan]
            dev_eui = "58EC3C43CA480000"
            join_eui = "0000000000000000"
            app_key = "CE8A96F54327D1CB20078F78D4746517"
            on_join_exhausted = "backoff"

            [gnss]
            fix_log = "walk.jsonl"

            [storage]
            dir = "state"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.lorawan.scheduler.on_join_exhausted, ExhaustionPolicy::Backoff);
        assert_eq!(cfg.lorawan.scheduler.max_join_backoff_ms, 600_000);
        assert_eq!(cfg.radio.backend, "sim");
        assert_eq!(cfg.radio.sim.join_after, 1);
        assert!(cfg.geofence.fences.is_empty());
        assert_eq!(cfg.node.sample_interval_ms, 1_000);
        assert!(cfg.node.battery_pct.is_none());
    }

    #[test]
    fn sample_config_is_valid() {
        check_config(&parse_config(SAMPLE).unwrap()).unwrap();
    }

    #[test]
    fn bad_values_fail_the_check() {
        let cases: [(&str, &str); 5] = [
            ("max_join_attempts = 10", "max_join_attempts = 0"),
            ("port = 1", "port = 0"),
            ("fail_rate = 0.1", "fail_rate = nan"),
            ("min_sats = 4", "min_sats = 1"),
            ("backend = \"sim\"", "backend = \"lora\""),
        ];
        for (from, to) in cases {
            assert!(SAMPLE.contains(from), "sample lacks {from}");
            let cfg = parse_config(&SAMPLE.replace(from, to)).unwrap();
            assert!(check_config(&cfg).is_err(), "{to} accepted");
        }
    }

    #[test]
    fn non_finite_fence_centre_is_an_error() {
        let cfg = parse_config(&SAMPLE.replace("lat = -33.4489", "lat = nan")).unwrap();
        assert!(effective_fences(&cfg, &MemoryStore::new()).is_err());
    }

    #[test]
    fn missing_section_is_an_error() {
        assert!(parse_config("[gnss]\nfix_log = \"x\"\n").is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geotrack.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert!(load_config(path.to_str().unwrap()).is_ok());
        assert!(load_config(dir.path().join("nope.toml").to_str().unwrap()).is_err());
    }

    #[test]
    fn persisted_fences_override_config() {
        let cfg = parse_config(SAMPLE).unwrap();
        let mut store = MemoryStore::new();
        assert_eq!(effective_fences(&cfg, &store).unwrap().len(), cfg.geofence.fences.len());

        let stored = vec![FenceDef::from_degrees(3, 10.0, 20.0, 50.0).unwrap()];
        save_json(&mut store, KEY_GEOFENCES, &stored).unwrap();
        assert_eq!(effective_fences(&cfg, &store).unwrap(), stored);

        let bad = vec![FenceDef { id: 9, lat_e6: 10_000_000, lon_e6: 20_000_000, radius_m: 50.0 }];
        save_json(&mut store, KEY_GEOFENCES, &bad).unwrap();
        assert_eq!(effective_fences(&cfg, &store).unwrap().len(), cfg.geofence.fences.len());
    }
}
