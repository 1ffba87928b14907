pub mod doctor;
pub mod geofence;
pub mod gnss;
pub mod position;

pub use geofence::{
    FenceConfigError, FenceDef, FenceState, Geofence, GeofenceEngine, GeofenceEvent, MAX_GEOFENCES,
};
pub use gnss::{FixRecord, PositionSource, ReplaySource};
pub use position::{AccuracyGate, FixStatus, Position};
