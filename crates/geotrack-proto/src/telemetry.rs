//! Fixed-layout binary telemetry payloads.
//!
//! Every payload starts with a one-byte type tag followed by big-endian
//! fixed-width fields:
//!
//! ```text
//! 0x01 GPS       tag(1) lat:i32 lon:i32 alt:i16 sats:u8 hdop:u8                 13 bytes
//! 0x02 GEOFENCE  tag(1) fence_id:u8 event:u8 lat:i32 lon:i32 timestamp:u32      15 bytes
//! 0x03 STATUS    tag(1) battery:u8 uptime_h:u16 gps_status:u8 system_status:u8  6 bytes
//! ```
//!
//! Latitude/longitude are degrees x 1e6 truncated to `i32`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const GPS_REPORT_LEN: usize = 13;
pub const GEOFENCE_REPORT_LEN: usize = 15;
pub const STATUS_REPORT_LEN: usize = 6;

/// Port 0 carries MAC commands only, never application payloads.
pub const MAC_PORT: u8 = 0;

/// Battery level value meaning "no battery monitor".
pub const BATTERY_UNKNOWN: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Gps = 0x01,
    GeofenceEvent = 0x02,
    Status = 0x03,
    Alert = 0x04,
    Heartbeat = 0x05,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Gps),
            0x02 => Some(Self::GeofenceEvent),
            0x03 => Some(Self::Status),
            0x04 => Some(Self::Alert),
            0x05 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Direction of a fence boundary crossing, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Crossing {
    Exit = 0,
    Enter = 1,
}

impl Crossing {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Exit),
            1 => Some(Self::Enter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsReport {
    pub lat_e6: i32,
    pub lon_e6: i32,
    pub alt_m: i16,
    pub sats: u8,
    /// HDOP x 10, saturated at 255.
    pub hdop: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeofenceReport {
    pub fence_id: u8,
    pub crossing: Crossing,
    pub lat_e6: i32,
    pub lon_e6: i32,
    /// Unix seconds.
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub battery_pct: u8,
    pub uptime_hours: u16,
    pub gps_status: u8,
    pub system_status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryMessage {
    Gps(GpsReport),
    Geofence(GeofenceReport),
    Status(StatusReport),
}

impl TelemetryMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Gps(_) => MessageType::Gps,
            Self::Geofence(_) => MessageType::GeofenceEvent,
            Self::Status(_) => MessageType::Status,
        }
    }

    /// Exact encoded size, tag byte included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Gps(_) => GPS_REPORT_LEN,
            Self::Geofence(_) => GEOFENCE_REPORT_LEN,
            Self::Status(_) => STATUS_REPORT_LEN,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,

    #[error("port {0} is reserved for MAC commands")]
    MacPort(u8),

    #[error("unknown message tag 0x{0:02X}")]
    UnknownTag(u8),

    #[error("{0:?} has no fixed layout")]
    Unsupported(MessageType),

    #[error("{kind:?} payload is {got} bytes, expected {expected}")]
    Length {
        kind: MessageType,
        got: usize,
        expected: usize,
    },

    #[error("invalid crossing value {0}")]
    InvalidCrossing(u8),
}

/// Encodes a message into a buffer sized exactly for it. Total for every input.
pub fn encode(msg: &TelemetryMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(msg.encoded_len());
    buf.put_u8(msg.message_type().tag());
    match msg {
        TelemetryMessage::Gps(g) => {
            buf.put_i32(g.lat_e6);
            buf.put_i32(g.lon_e6);
            buf.put_i16(g.alt_m);
            buf.put_u8(g.sats);
            buf.put_u8(g.hdop);
        }
        TelemetryMessage::Geofence(e) => {
            buf.put_u8(e.fence_id);
            buf.put_u8(e.crossing as u8);
            buf.put_i32(e.lat_e6);
            buf.put_i32(e.lon_e6);
            buf.put_u32(e.timestamp);
        }
        TelemetryMessage::Status(s) => {
            buf.put_u8(s.battery_pct);
            buf.put_u16(s.uptime_hours);
            buf.put_u8(s.gps_status);
            buf.put_u8(s.system_status);
        }
    }
    debug_assert_eq!(buf.len(), msg.encoded_len());
    buf.freeze()
}

/// Best-effort decode, dispatching on the first byte.
pub fn decode(data: &[u8], port: u8) -> Result<TelemetryMessage, CodecError> {
    if port == MAC_PORT {
        return Err(CodecError::MacPort(port));
    }
    let (&tag, mut body) = data.split_first().ok_or(CodecError::Empty)?;
    let kind = MessageType::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

    let expect_len = |expected: usize| {
        if data.len() == expected {
            Ok(())
        } else {
            Err(CodecError::Length { kind, got: data.len(), expected })
        }
    };

    let msg = match kind {
        MessageType::Gps => {
            expect_len(GPS_REPORT_LEN)?;
            TelemetryMessage::Gps(GpsReport {
                lat_e6: body.get_i32(),
                lon_e6: body.get_i32(),
                alt_m: body.get_i16(),
                sats: body.get_u8(),
                hdop: body.get_u8(),
            })
        }
        MessageType::GeofenceEvent => {
            expect_len(GEOFENCE_REPORT_LEN)?;
            let fence_id = body.get_u8();
            let raw = body.get_u8();
            let crossing = Crossing::from_wire(raw).ok_or(CodecError::InvalidCrossing(raw))?;
            TelemetryMessage::Geofence(GeofenceReport {
                fence_id,
                crossing,
                lat_e6: body.get_i32(),
                lon_e6: body.get_i32(),
                timestamp: body.get_u32(),
            })
        }
        MessageType::Status => {
            expect_len(STATUS_REPORT_LEN)?;
            TelemetryMessage::Status(StatusReport {
                battery_pct: body.get_u8(),
                uptime_hours: body.get_u16(),
                gps_status: body.get_u8(),
                system_status: body.get_u8(),
            })
        }
        MessageType::Alert | MessageType::Heartbeat => return Err(CodecError::Unsupported(kind)),
    };
    Ok(msg)
}
