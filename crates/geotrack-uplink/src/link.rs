use crate::credentials::Credentials;
use bytes::Bytes;

/// Failure reported by a radio backend. Codes follow the radio driver's
/// numeric convention so logs line up with the modem firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("radio chip not found")]
    ChipNotFound,
    #[error("packet too long")]
    PacketTooLong,
    #[error("TX timeout")]
    TxTimeout,
    #[error("RX timeout")]
    RxTimeout,
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("network not joined")]
    NoSession,
    #[error("no join accept")]
    NoJoinAccept,
    #[error("radio error {0}")]
    Other(i32),
}

impl LinkError {
    /// `None` for 0, which the driver uses for success.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => return None,
            -2 => Self::ChipNotFound,
            -4 => Self::PacketTooLong,
            -5 => Self::TxTimeout,
            -6 => Self::RxTimeout,
            -7 => Self::CrcMismatch,
            -1101 => Self::NoSession,
            -1116 => Self::NoJoinAccept,
            other => Self::Other(other),
        })
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::ChipNotFound => -2,
            Self::PacketTooLong => -4,
            Self::TxTimeout => -5,
            Self::RxTimeout => -6,
            Self::CrcMismatch => -7,
            Self::NoSession => -1101,
            Self::NoJoinAccept => -1116,
            Self::Other(c) => *c,
        }
    }
}

/// Human-readable text for a raw driver code, including success.
pub fn describe_code(code: i32) -> String {
    match LinkError::from_code(code) {
        None => "success".to_string(),
        Some(e) => e.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Pending,
    Accepted,
    Failed(LinkError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    pub port: u8,
    pub payload: Bytes,
}

/// Radio backend driven by the uplink scheduler.
///
/// `send_receive` may block for the backend's TX plus RX window; everything
/// else is expected to return promptly.
pub trait RadioLink {
    /// Starts an over-the-air join. Completion is observed via `join_status`.
    fn begin_join(&mut self, creds: &Credentials) -> Result<(), LinkError>;

    fn join_status(&mut self) -> JoinStatus;

    /// Sends one confirmed-or-not uplink and waits for the receive windows.
    fn send_receive(&mut self, payload: &[u8], port: u8) -> Result<Option<Downlink>, LinkError>;

    /// Tries to reuse network session keys kept by the backend across a
    /// restart. Returns true if the session is usable without a new join.
    fn resume_session(&mut self) -> bool {
        false
    }

    /// True once if the backend has dropped an established session.
    fn session_lost(&mut self) -> bool {
        false
    }
}

impl<L: RadioLink + ?Sized> RadioLink for Box<L> {
    fn begin_join(&mut self, creds: &Credentials) -> Result<(), LinkError> {
        (**self).begin_join(creds)
    }

    fn join_status(&mut self) -> JoinStatus {
        (**self).join_status()
    }

    fn send_receive(&mut self, payload: &[u8], port: u8) -> Result<Option<Downlink>, LinkError> {
        (**self).send_receive(payload, port)
    }

    fn resume_session(&mut self) -> bool {
        (**self).resume_session()
    }

    fn session_lost(&mut self) -> bool {
        (**self).session_lost()
    }
}
