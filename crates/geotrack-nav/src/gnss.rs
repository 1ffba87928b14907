use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use time::OffsetDateTime;
use tracing::info;

use crate::position::Position;

/// Anything that can hand the control loop one fix per cycle.
pub trait PositionSource {
    /// `Ok(None)` means the receiver has no fix this cycle.
    fn next_fix(&mut self) -> Result<Option<Position>>;
}

/// One line of a fix log. A record without lat/lon stands for "no fix".
#[derive(Debug, Clone, Deserialize)]
pub struct FixRecord {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(default)]
    pub alt_m: f64,
    #[serde(default)]
    pub sats: u8,
    #[serde(default = "default_hdop")]
    pub hdop: f32,
}

fn default_hdop() -> f32 {
    99.9
}

impl FixRecord {
    pub fn fix(lat: f64, lon: f64, sats: u8, hdop: f32) -> Self {
        Self { lat: Some(lat), lon: Some(lon), alt_m: 0.0, sats, hdop }
    }

    pub fn no_fix() -> Self {
        Self { lat: None, lon: None, alt_m: 0.0, sats: 0, hdop: default_hdop() }
    }

    fn to_position(&self, ts: OffsetDateTime) -> Option<Position> {
        let (lat, lon) = (self.lat?, self.lon?);
        if !(lat.is_finite() && lon.is_finite()) {
            return None;
        }
        Some(Position::from_degrees(lat, lon, self.alt_m, self.sats, self.hdop, ts))
    }
}

/// Replays a JSON-lines fix log, one record per call, looping at the end.
/// Fixes are stamped with the wall clock at the moment they are handed out.
pub struct ReplaySource {
    records: Vec<FixRecord>,
    next: usize,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("open fix log {}", path.display()))?;
        let mut records = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rec: FixRecord = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: bad fix record", path.display(), n + 1))?;
            records.push(rec);
        }
        info!("gnss: loaded {} fix records from {}", records.len(), path.display());
        Self::from_records(records)
    }

    pub fn from_records(records: Vec<FixRecord>) -> Result<Self> {
        anyhow::ensure!(!records.is_empty(), "fix log is empty");
        Ok(Self { records, next: 0 })
    }
}

impl PositionSource for ReplaySource {
    fn next_fix(&mut self) -> Result<Option<Position>> {
        let rec = &self.records[self.next];
        self.next = (self.next + 1) % self.records.len();
        Ok(rec.to_position(OffsetDateTime::now_utc()))
    }
}
