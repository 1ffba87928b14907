use crate::credentials::Credentials;
use crate::{ExhaustionPolicy, SchedulerConfig, SimConfig, APP_PORTS};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

pub fn check_credentials(dev_eui: &str, join_eui: &str, app_key: &str) -> Result<Credentials> {
    let creds = Credentials::parse(dev_eui, join_eui, app_key).context("lorawan credentials")?;
    if creds.join_eui == [0u8; 8] {
        warn!("doctor: lorawan.join_eui is all zeros; fine for some networks, check yours");
    }
    anyhow::ensure!(
        creds.app_key().as_bytes().iter().any(|&b| b != 0),
        "lorawan.app_key is all zeros"
    );
    Ok(creds)
}

pub fn check_timing(cfg: &SchedulerConfig) -> Result<()> {
    anyhow::ensure!(
        APP_PORTS.contains(&cfg.port),
        "lorawan.port must be an application port ({:?}), got {}",
        APP_PORTS,
        cfg.port
    );
    anyhow::ensure!(cfg.tx_interval_ms >= 1_000, "lorawan.tx_interval_ms too small; set >= 1000");
    anyhow::ensure!(
        cfg.join_retry_delay_ms >= 1_000,
        "lorawan.join_retry_delay_ms too small; set >= 1000"
    );
    anyhow::ensure!(cfg.max_join_attempts >= 1, "lorawan.max_join_attempts must be >= 1");
    if cfg.on_join_exhausted == ExhaustionPolicy::Backoff {
        anyhow::ensure!(
            cfg.max_join_backoff_ms >= cfg.join_retry_delay_ms,
            "lorawan.max_join_backoff_ms must be >= join_retry_delay_ms"
        );
    }
    Ok(())
}

pub fn check_sim(cfg: &SimConfig) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.fail_rate),
        "radio.sim.fail_rate must be in 0..=1, got {}",
        cfg.fail_rate
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.downlink_rate),
        "radio.sim.downlink_rate must be in 0..=1, got {}",
        cfg.downlink_rate
    );
    Ok(())
}

pub fn check_spool(spool_dir: &str, max_mb: u64) -> Result<()> {
    let p = Path::new(spool_dir);
    if p.exists() {
        anyhow::ensure!(p.is_dir(), "radio.spool_dir is not a dir: {}", spool_dir);
    }
    anyhow::ensure!(max_mb >= 1, "radio.spool_max_mb too small; set >= 1MB");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_defaults_pass() {
        check_timing(&SchedulerConfig::default()).unwrap();
    }

    #[test]
    fn timing_rejects_bad_values() {
        let bad_port = SchedulerConfig { port: 0, ..Default::default() };
        assert!(check_timing(&bad_port).is_err());
        let bad_port = SchedulerConfig { port: 224, ..Default::default() };
        assert!(check_timing(&bad_port).is_err());
        let fast = SchedulerConfig { tx_interval_ms: 10, ..Default::default() };
        assert!(check_timing(&fast).is_err());
        let no_joins = SchedulerConfig { max_join_attempts: 0, ..Default::default() };
        assert!(check_timing(&no_joins).is_err());
        let inverted = SchedulerConfig {
            on_join_exhausted: ExhaustionPolicy::Backoff,
            max_join_backoff_ms: 1_000,
            ..Default::default()
        };
        assert!(check_timing(&inverted).is_err());
    }

    #[test]
    fn sim_rates_checked() {
        check_sim(&SimConfig::default()).unwrap();
        assert!(check_sim(&SimConfig { fail_rate: f64::NAN, ..Default::default() }).is_err());
        assert!(check_sim(&SimConfig { downlink_rate: 1.5, ..Default::default() }).is_err());
    }

    #[test]
    fn credentials_checked() {
        assert!(check_credentials("58EC3C43CA480000", "0000000000000000", "CE8A96F54327D1CB20078F78D4746517").is_ok());
        assert!(check_credentials("58EC3C43CA480000", "0000000000000000", "00000000000000000000000000000000").is_err());
        assert!(check_credentials("58EC", "0000000000000000", "CE8A96F54327D1CB20078F78D4746517").is_err());
    }

    #[test]
    fn spool_dir_must_be_dir() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(check_spool(f.path().to_str().unwrap(), 8).is_err());
        let d = tempfile::tempdir().unwrap();
        check_spool(d.path().to_str().unwrap(), 8).unwrap();
        assert!(check_spool(d.path().to_str().unwrap(), 0).is_err());
    }
}
