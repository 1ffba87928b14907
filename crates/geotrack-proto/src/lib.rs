pub mod telemetry;

pub use telemetry::{
    decode, encode, CodecError, Crossing, GeofenceReport, GpsReport, MessageType, StatusReport,
    TelemetryMessage, BATTERY_UNKNOWN,
};
