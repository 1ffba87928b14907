use geotrack_proto::GpsReport;
use serde::Deserialize;
use time::OffsetDateTime;

/// One position fix. Coordinates are degrees x 1e6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat_e6: i32,
    pub lon_e6: i32,
    pub alt_m: i16,
    pub sats: u8,
    pub hdop: f32,
    pub ts: OffsetDateTime,
}

impl Position {
    pub fn from_degrees(lat: f64, lon: f64, alt_m: f64, sats: u8, hdop: f32, ts: OffsetDateTime) -> Self {
        Self {
            lat_e6: deg_to_e6(lat),
            lon_e6: deg_to_e6(lon),
            alt_m: alt_m.clamp(i16::MIN as f64, i16::MAX as f64) as i16,
            sats,
            hdop,
            ts,
        }
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat_e6 as f64 / 1e6
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon_e6 as f64 / 1e6
    }

    /// Unix seconds, clamped into the `u32` wire range.
    pub fn timestamp(&self) -> u32 {
        self.ts.unix_timestamp().clamp(0, u32::MAX as i64) as u32
    }

    pub fn to_report(&self) -> GpsReport {
        GpsReport {
            lat_e6: self.lat_e6,
            lon_e6: self.lon_e6,
            alt_m: self.alt_m,
            sats: self.sats,
            hdop: (self.hdop * 10.0).round().clamp(0.0, 255.0) as u8,
        }
    }
}

/// Degrees to fixed point, truncating toward zero.
pub fn deg_to_e6(deg: f64) -> i32 {
    (deg * 1e6) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FixStatus {
    NoFix = 0,
    Degraded = 1,
    Good = 2,
}

/// Minimum fix quality for a position to be acted on.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AccuracyGate {
    pub min_sats: u8,
    pub max_hdop: f32,
}

impl Default for AccuracyGate {
    fn default() -> Self {
        Self { min_sats: 4, max_hdop: 10.0 }
    }
}

impl AccuracyGate {
    pub fn accepts(&self, pos: &Position) -> bool {
        pos.sats >= self.min_sats && pos.hdop.is_finite() && pos.hdop <= self.max_hdop
    }

    pub fn classify(&self, pos: Option<&Position>) -> FixStatus {
        match pos {
            None => FixStatus::NoFix,
            Some(p) if self.accepts(p) => FixStatus::Good,
            Some(_) => FixStatus::Degraded,
        }
    }
}
