use crate::credentials::Credentials;
use crate::link::{Downlink, JoinStatus, LinkError, RadioLink};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::debug;

/// Largest application payload the simulated radio accepts (SF7/125 kHz).
pub const SIM_MAX_PAYLOAD: usize = 222;

#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Join requests needed before one is accepted.
    #[serde(default = "default_join_after")]
    pub join_after: u32,
    /// Probability in [0, 1] that a send fails with a TX timeout.
    #[serde(default)]
    pub fail_rate: f64,
    /// Probability in [0, 1] that a successful send carries a downlink.
    #[serde(default)]
    pub downlink_rate: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_join_after() -> u32 {
    1
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            join_after: default_join_after(),
            fail_rate: 0.0,
            downlink_rate: 0.0,
            seed: None,
        }
    }
}

// NaN survives clamp and would panic gen_bool.
fn probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// Pseudo-random radio for bench runs without hardware.
pub struct SimLink {
    cfg: SimConfig,
    rng: StdRng,
    join_requests: u32,
    pending: Option<JoinStatus>,
    joined: bool,
    sent: u64,
}

impl SimLink {
    pub fn new(cfg: SimConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            cfg,
            rng,
            join_requests: 0,
            pending: None,
            joined: false,
            sent: 0,
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent
    }
}

impl RadioLink for SimLink {
    fn begin_join(&mut self, _creds: &Credentials) -> Result<(), LinkError> {
        self.join_requests += 1;
        let status = if self.join_requests >= self.cfg.join_after {
            JoinStatus::Accepted
        } else {
            JoinStatus::Failed(LinkError::NoJoinAccept)
        };
        debug!("sim: join request {} -> {:?}", self.join_requests, status);
        self.pending = Some(status);
        Ok(())
    }

    fn join_status(&mut self) -> JoinStatus {
        match self.pending.take() {
            Some(status) => {
                self.joined = status == JoinStatus::Accepted;
                status
            }
            None => JoinStatus::Pending,
        }
    }

    fn send_receive(&mut self, payload: &[u8], port: u8) -> Result<Option<Downlink>, LinkError> {
        if !self.joined {
            return Err(LinkError::NoSession);
        }
        if payload.len() > SIM_MAX_PAYLOAD {
            return Err(LinkError::PacketTooLong);
        }
        if self.rng.gen_bool(probability(self.cfg.fail_rate)) {
            return Err(LinkError::TxTimeout);
        }
        self.sent += 1;
        if self.rng.gen_bool(probability(self.cfg.downlink_rate)) {
            let seq = (self.sent & 0xFF) as u8;
            return Ok(Some(Downlink {
                port,
                payload: Bytes::copy_from_slice(&[0xAC, seq]),
            }));
        }
        Ok(None)
    }
}
