//! Circular geofences with a hysteresis band around each boundary.
//!
//! A fence flips OUTSIDE -> INSIDE only once the fix is closer than
//! `radius - H`, and INSIDE -> OUTSIDE only once it is farther than
//! `radius + H`. Anything in between keeps the recorded state, so GPS noise
//! straddling the boundary cannot produce a stream of enter/exit events.

use geotrack_proto::{Crossing, GeofenceReport, TelemetryMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::position::{deg_to_e6, AccuracyGate, Position};

pub const MAX_GEOFENCES: usize = 5;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Persisted fence definition. Centre in degrees x 1e6.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FenceDef {
    pub id: u8,
    pub lat_e6: i32,
    pub lon_e6: i32,
    pub radius_m: f32,
}

impl FenceDef {
    /// Centre given in degrees. Non-finite or out-of-range coordinates are
    /// rejected here, before fixed-point conversion could hide them.
    pub fn from_degrees(id: u8, lat: f64, lon: f64, radius_m: f32) -> Result<Self, FenceConfigError> {
        if !(lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0) {
            return Err(FenceConfigError::BadCenter(id));
        }
        Ok(Self { id, lat_e6: deg_to_e6(lat), lon_e6: deg_to_e6(lon), radius_m })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Unknown,
    Inside,
    Outside,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FenceConfigError {
    #[error("at most {MAX_GEOFENCES} geofences are supported, got {0}")]
    TooMany(usize),

    #[error("geofence id {0} out of range (0..{MAX_GEOFENCES})")]
    IdOutOfRange(u8),

    #[error("duplicate geofence id {0}")]
    DuplicateId(u8),

    #[error("geofence {id}: radius must be > 0, got {radius_m}")]
    BadRadius { id: u8, radius_m: f32 },

    #[error("geofence {0}: centre outside +-90/+-180 degrees")]
    BadCenter(u8),

    #[error("hysteresis must be a non-negative distance, got {0}")]
    BadHysteresis(f64),

    #[error("no geofence with id {0}")]
    UnknownId(u8),
}

/// Checks a fence set the same way at config load and on management commands.
pub fn validate(defs: &[FenceDef]) -> Result<(), FenceConfigError> {
    if defs.len() > MAX_GEOFENCES {
        return Err(FenceConfigError::TooMany(defs.len()));
    }
    for (i, d) in defs.iter().enumerate() {
        if d.id as usize >= MAX_GEOFENCES {
            return Err(FenceConfigError::IdOutOfRange(d.id));
        }
        if !(d.radius_m.is_finite() && d.radius_m > 0.0) {
            return Err(FenceConfigError::BadRadius { id: d.id, radius_m: d.radius_m });
        }
        if d.lat_e6.unsigned_abs() > 90_000_000 || d.lon_e6.unsigned_abs() > 180_000_000 {
            return Err(FenceConfigError::BadCenter(d.id));
        }
        if defs[..i].iter().any(|o| o.id == d.id) {
            return Err(FenceConfigError::DuplicateId(d.id));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Geofence {
    def: FenceDef,
    state: FenceState,
}

impl Geofence {
    fn new(def: FenceDef) -> Self {
        Self { def, state: FenceState::Unknown }
    }

    pub fn def(&self) -> &FenceDef {
        &self.def
    }

    pub fn id(&self) -> u8 {
        self.def.id
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    pub fn distance_m(&self, pos: &Position) -> f64 {
        haversine_m(
            e6_to_deg(self.def.lat_e6),
            e6_to_deg(self.def.lon_e6),
            pos.lat_deg(),
            pos.lon_deg(),
        )
    }

    fn step(&mut self, pos: &Position, hysteresis_m: f64) -> Option<Crossing> {
        let d = self.distance_m(pos);
        let r = self.def.radius_m as f64;
        match self.state {
            // First look: settle on the plain radius, never report a transition.
            FenceState::Unknown => {
                self.state = if d <= r { FenceState::Inside } else { FenceState::Outside };
                debug!("geofence {}: initial state {:?} (d={:.1}m)", self.def.id, self.state, d);
                None
            }
            FenceState::Outside if d < r - hysteresis_m => {
                self.state = FenceState::Inside;
                Some(Crossing::Enter)
            }
            FenceState::Inside if d > r + hysteresis_m => {
                self.state = FenceState::Outside;
                Some(Crossing::Exit)
            }
            _ => None,
        }
    }
}

/// A confirmed boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeofenceEvent {
    pub fence_id: u8,
    pub crossing: Crossing,
    pub lat_e6: i32,
    pub lon_e6: i32,
    pub timestamp: u32,
}

impl From<GeofenceEvent> for GeofenceReport {
    fn from(ev: GeofenceEvent) -> Self {
        GeofenceReport {
            fence_id: ev.fence_id,
            crossing: ev.crossing,
            lat_e6: ev.lat_e6,
            lon_e6: ev.lon_e6,
            timestamp: ev.timestamp,
        }
    }
}

impl From<GeofenceEvent> for TelemetryMessage {
    fn from(ev: GeofenceEvent) -> Self {
        TelemetryMessage::Geofence(ev.into())
    }
}

pub struct GeofenceEngine {
    fences: Vec<Geofence>,
    hysteresis_m: f64,
    gate: AccuracyGate,
}

impl GeofenceEngine {
    pub fn new(defs: Vec<FenceDef>, hysteresis_m: f64, gate: AccuracyGate) -> Result<Self, FenceConfigError> {
        if !(hysteresis_m.is_finite() && hysteresis_m >= 0.0) {
            return Err(FenceConfigError::BadHysteresis(hysteresis_m));
        }
        validate(&defs)?;
        Ok(Self {
            fences: defs.into_iter().map(Geofence::new).collect(),
            hysteresis_m,
            gate,
        })
    }

    pub fn fences(&self) -> &[Geofence] {
        &self.fences
    }

    pub fn definitions(&self) -> Vec<FenceDef> {
        self.fences.iter().map(|f| f.def).collect()
    }

    pub fn hysteresis_m(&self) -> f64 {
        self.hysteresis_m
    }

    pub fn gate(&self) -> &AccuracyGate {
        &self.gate
    }

    /// Adds a fence in UNKNOWN state; the set is re-validated as a whole.
    pub fn add(&mut self, def: FenceDef) -> Result<(), FenceConfigError> {
        let mut defs = self.definitions();
        defs.push(def);
        validate(&defs)?;
        self.fences.push(Geofence::new(def));
        info!("geofence: added fence {} (r={}m)", def.id, def.radius_m);
        Ok(())
    }

    pub fn remove(&mut self, id: u8) -> Result<FenceDef, FenceConfigError> {
        let idx = self
            .fences
            .iter()
            .position(|f| f.def.id == id)
            .ok_or(FenceConfigError::UnknownId(id))?;
        info!("geofence: removed fence {}", id);
        Ok(self.fences.remove(idx).def)
    }

    /// Evaluates every fence against `pos`, yielding at most one event per fence.
    ///
    /// Fences are stepped as the iterator is consumed; a fence not reached
    /// before the iterator is dropped keeps its state until the next call.
    /// A fix that fails the accuracy gate yields nothing and touches nothing.
    pub fn evaluate(&mut self, pos: &Position) -> Evaluation<'_> {
        let fences = if self.gate.accepts(pos) {
            &mut self.fences[..]
        } else {
            debug!("geofence: fix below accuracy gate (sats={}, hdop={})", pos.sats, pos.hdop);
            &mut self.fences[..0]
        };
        Evaluation { fences: fences.iter_mut(), pos: *pos, hysteresis_m: self.hysteresis_m }
    }
}

#[must_use = "fences are only evaluated as the iterator is consumed"]
pub struct Evaluation<'a> {
    fences: std::slice::IterMut<'a, Geofence>,
    pos: Position,
    hysteresis_m: f64,
}

impl Iterator for Evaluation<'_> {
    type Item = GeofenceEvent;

    fn next(&mut self) -> Option<GeofenceEvent> {
        for fence in self.fences.by_ref() {
            if let Some(crossing) = fence.step(&self.pos, self.hysteresis_m) {
                info!("geofence {}: {:?}", fence.def.id, crossing);
                return Some(GeofenceEvent {
                    fence_id: fence.def.id,
                    crossing,
                    lat_e6: self.pos.lat_e6,
                    lon_e6: self.pos.lon_e6,
                    timestamp: self.pos.timestamp(),
                });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.fences.len()))
    }
}

// ----- Geometry -----

fn e6_to_deg(v: i32) -> f64 {
    v as f64 / 1e6
}

pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    const CENTER_LAT: i32 = -33_448_900;
    const CENTER_LON: i32 = -70_669_300;
    // Metres per 1e-6 degree of latitude.
    const M_PER_E6: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0 / 1e6;

    fn engine() -> GeofenceEngine {
        let def = FenceDef { id: 0, lat_e6: CENTER_LAT, lon_e6: CENTER_LON, radius_m: 100.0 };
        GeofenceEngine::new(vec![def], 2.0, AccuracyGate::default()).unwrap()
    }

    /// A good fix `north_m` metres north of the fence centre.
    fn at(north_m: f64) -> Position {
        Position {
            lat_e6: CENTER_LAT + (north_m / M_PER_E6) as i32,
            lon_e6: CENTER_LON,
            alt_m: 500,
            sats: 8,
            hdop: 1.0,
            ts: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        }
    }

    fn eval(e: &mut GeofenceEngine, north_m: f64) -> Vec<GeofenceEvent> {
        e.evaluate(&at(north_m)).collect()
    }

    #[test]
    fn non_finite_centre_rejected() {
        assert_eq!(FenceDef::from_degrees(0, f64::NAN, f64::NAN, 50.0), Err(FenceConfigError::BadCenter(0)));
        assert_eq!(FenceDef::from_degrees(1, 10.0, f64::INFINITY, 50.0), Err(FenceConfigError::BadCenter(1)));
        assert_eq!(FenceDef::from_degrees(2, 91.0, 0.0, 50.0), Err(FenceConfigError::BadCenter(2)));
        let d = FenceDef::from_degrees(3, -33.4489, -70.6693, 50.0).unwrap();
        assert_eq!((d.lat_e6, d.lon_e6), (CENTER_LAT, CENTER_LON));
    }

    #[test]
    fn haversine_matches_meridian_arc() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_194.93).abs() < 0.1, "d={d}");
    }

    #[test]
    fn first_evaluation_settles_without_event() {
        let mut e = engine();
        assert!(eval(&mut e, 50.0).is_empty());
        assert_eq!(e.fences()[0].state(), FenceState::Inside);

        let mut e = engine();
        assert!(eval(&mut e, 101.0).is_empty());
        assert_eq!(e.fences()[0].state(), FenceState::Outside);
    }

    #[test]
    fn enter_then_exit_beyond_band() {
        let mut e = engine();
        assert!(eval(&mut e, 300.0).is_empty());

        let ev = eval(&mut e, 97.0);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].crossing, Crossing::Enter);
        assert_eq!(ev[0].fence_id, 0);
        assert_eq!(ev[0].timestamp, 1_700_000_000);

        let ev = eval(&mut e, 103.0);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].crossing, Crossing::Exit);
        assert_eq!(e.fences()[0].state(), FenceState::Outside);
    }

    #[test]
    fn band_never_changes_state() {
        for start in [10.0, 300.0] {
            let mut e = engine();
            let _ = eval(&mut e, start);
            let before = e.fences()[0].state();
            for d in [98.5, 99.0, 100.0, 101.0, 101.5, 99.5, 100.5] {
                assert!(eval(&mut e, d).is_empty(), "bounced at {d}m");
                assert_eq!(e.fences()[0].state(), before);
            }
        }
    }

    #[test]
    fn degraded_fix_is_ignored() {
        let mut e = engine();
        let _ = eval(&mut e, 300.0);

        let mut p = at(10.0);
        p.sats = 2;
        assert_eq!(e.evaluate(&p).count(), 0);
        assert_eq!(e.fences()[0].state(), FenceState::Outside);

        let mut p = at(10.0);
        p.hdop = 50.0;
        assert_eq!(e.evaluate(&p).count(), 0);
        assert_eq!(e.fences()[0].state(), FenceState::Outside);

        // Unknown fences stay unknown too.
        let mut fresh = engine();
        assert_eq!(fresh.evaluate(&p).count(), 0);
        assert_eq!(fresh.fences()[0].state(), FenceState::Unknown);
    }

    #[test]
    fn one_event_per_fence_per_call() {
        let defs = vec![
            FenceDef { id: 0, lat_e6: CENTER_LAT, lon_e6: CENTER_LON, radius_m: 100.0 },
            FenceDef { id: 3, lat_e6: CENTER_LAT, lon_e6: CENTER_LON, radius_m: 500.0 },
        ];
        let mut e = GeofenceEngine::new(defs, 2.0, AccuracyGate::default()).unwrap();
        let _ = eval(&mut e, 1_000.0);
        let ev = eval(&mut e, 10.0);
        let ids: Vec<u8> = ev.iter().map(|v| v.fence_id).collect();
        assert_eq!(ids, vec![0, 3]);
        assert!(ev.iter().all(|v| v.crossing == Crossing::Enter));
    }

    #[test]
    fn dropped_iterator_leaves_rest_untouched() {
        let defs = vec![
            FenceDef { id: 0, lat_e6: CENTER_LAT, lon_e6: CENTER_LON, radius_m: 100.0 },
            FenceDef { id: 1, lat_e6: CENTER_LAT, lon_e6: CENTER_LON, radius_m: 200.0 },
        ];
        let mut e = GeofenceEngine::new(defs, 2.0, AccuracyGate::default()).unwrap();
        let _ = eval(&mut e, 1_000.0);
        let first = e.evaluate(&at(10.0)).next();
        assert_eq!(first.map(|v| v.fence_id), Some(0));
        assert_eq!(e.fences()[1].state(), FenceState::Outside);
        // Picked up on the next pass.
        assert_eq!(eval(&mut e, 10.0).len(), 1);
    }

    #[test]
    fn rejects_bad_config() {
        let ok = FenceDef { id: 0, lat_e6: 0, lon_e6: 0, radius_m: 10.0 };
        let gate = AccuracyGate::default();
        assert!(matches!(
            GeofenceEngine::new(vec![FenceDef { radius_m: 0.0, ..ok }], 2.0, gate),
            Err(FenceConfigError::BadRadius { id: 0, .. })
        ));
        assert!(matches!(
            GeofenceEngine::new(vec![ok, ok], 2.0, gate),
            Err(FenceConfigError::DuplicateId(0))
        ));
        assert!(matches!(
            GeofenceEngine::new(vec![FenceDef { id: 5, ..ok }], 2.0, gate),
            Err(FenceConfigError::IdOutOfRange(5))
        ));
        assert!(matches!(
            GeofenceEngine::new(vec![FenceDef { lat_e6: 91_000_000, ..ok }], 2.0, gate),
            Err(FenceConfigError::BadCenter(0))
        ));
        assert!(matches!(
            GeofenceEngine::new(vec![ok], -1.0, gate),
            Err(FenceConfigError::BadHysteresis(_))
        ));
        let six: Vec<FenceDef> = (0..6).map(|i| FenceDef { id: i, ..ok }).collect();
        assert!(matches!(GeofenceEngine::new(six, 2.0, gate), Err(FenceConfigError::TooMany(6))));
    }

    #[test]
    fn add_and_remove() {
        let mut e = engine();
        let extra = FenceDef { id: 1, lat_e6: 0, lon_e6: 0, radius_m: 50.0 };
        e.add(extra).unwrap();
        assert_eq!(e.fences().len(), 2);
        assert_eq!(e.add(extra), Err(FenceConfigError::DuplicateId(1)));
        assert_eq!(e.remove(1), Ok(extra));
        assert_eq!(e.remove(1), Err(FenceConfigError::UnknownId(1)));
        assert_eq!(e.definitions().len(), 1);
    }

    #[test]
    fn event_converts_to_report() {
        let ev = GeofenceEvent {
            fence_id: 2,
            crossing: Crossing::Exit,
            lat_e6: 1,
            lon_e6: 2,
            timestamp: 3,
        };
        let msg: TelemetryMessage = ev.into();
        assert_eq!(msg.encoded_len(), 15);
    }
}
