//! Join lifecycle, duty-cycle gating and transmit accounting for the
//! telemetry uplink.
//!
//! [`UplinkScheduler`] owns the [`SessionState`] and persists it after every
//! change. Link failures never surface as `Err`: they are counted, logged
//! and reported through the returned outcome so the control loop can carry
//! on with its next cycle.

pub mod clock;
pub mod credentials;
pub mod doctor;
pub mod link;
pub mod session;
pub mod sim;
pub mod spool;

pub use clock::{Clock, MockClock, SystemClock};
pub use credentials::{CredentialError, Credentials};
pub use link::{describe_code, Downlink, JoinStatus, LinkError, RadioLink};
pub use session::SessionState;
pub use sim::{SimConfig, SimLink};
pub use spool::SpoolLink;

use std::ops::RangeInclusive;

use geotrack_proto::TelemetryMessage;
use geotrack_store::{load_json, save_json, KvStore, KEY_SESSION};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

/// FPorts that carry application payloads. 0 is MAC commands, 224 and up
/// are reserved.
pub const APP_PORTS: RangeInclusive<u8> = 1..=223;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Signal exhaustion once and stop joining; the owner restarts.
    #[default]
    Restart,
    /// Keep joining with an exponentially growing retry delay.
    Backoff,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_port")]
    pub port: u8,
    #[serde(default = "default_tx_interval_ms")]
    pub tx_interval_ms: u64,
    #[serde(default = "default_join_retry_delay_ms")]
    pub join_retry_delay_ms: u64,
    #[serde(default = "default_max_join_attempts")]
    pub max_join_attempts: u32,
    #[serde(default)]
    pub on_join_exhausted: ExhaustionPolicy,
    #[serde(default = "default_max_join_backoff_ms")]
    pub max_join_backoff_ms: u64,
}

fn default_port() -> u8 {
    1
}

fn default_tx_interval_ms() -> u64 {
    60_000
}

fn default_join_retry_delay_ms() -> u64 {
    30_000
}

fn default_max_join_attempts() -> u32 {
    10
}

fn default_max_join_backoff_ms() -> u64 {
    600_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            tx_interval_ms: default_tx_interval_ms(),
            join_retry_delay_ms: default_join_retry_delay_ms(),
            max_join_attempts: default_max_join_attempts(),
            on_join_exhausted: ExhaustionPolicy::default(),
            max_join_backoff_ms: default_max_join_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Joining,
    Joined,
}

/// Result of [`UplinkScheduler::start_join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPoll {
    AlreadyJoined,
    /// A join request is outstanding; watch [`UplinkScheduler::poll`].
    InProgress,
    RateLimited { retry_in_ms: u64 },
    Started,
    /// The link refused to start the join. Counts as an attempt.
    StartFailed(LinkError),
    /// Join ceiling reached under [`ExhaustionPolicy::Restart`]. Returned once.
    Exhausted,
    /// Exhaustion was already signalled; nothing more is attempted.
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Joined,
    JoinFailed(LinkError),
    SessionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Gate closed; nothing sent, nothing counted.
    Deferred,
    Sent { downlink: bool },
    Failed(LinkError),
    /// Port outside [`APP_PORTS`]; nothing sent, nothing counted.
    Rejected,
}

pub struct UplinkScheduler<L: RadioLink, C: Clock> {
    cfg: SchedulerConfig,
    creds: Credentials,
    link: L,
    clock: C,
    store: Box<dyn KvStore>,
    state: LinkState,
    session: SessionState,
    join_started_ms: Option<u64>,
    last_join_ms: Option<u64>,
    last_tx_ms: Option<u64>,
    downlink: Option<Downlink>,
    exhausted: bool,
    last_error: Option<LinkError>,
}

impl<L: RadioLink, C: Clock> UplinkScheduler<L, C> {
    /// Restores the persisted session. A stored `joined` flag only carries
    /// over if the link can resume that session.
    pub fn new(cfg: SchedulerConfig, creds: Credentials, mut link: L, clock: C, store: Box<dyn KvStore>) -> Self {
        let mut session = match load_json::<SessionState>(store.as_ref(), KEY_SESSION) {
            Ok(Some(s)) => s,
            Ok(None) => SessionState::default(),
            Err(e) => {
                warn!("uplink: stored session unreadable, starting fresh: {:#}", e);
                SessionState::default()
            }
        };
        if session.repair() {
            warn!("uplink: stored counters were inconsistent, repaired");
        }

        let state = if session.joined() && link.resume_session() {
            info!("uplink: resumed previous session");
            LinkState::Joined
        } else {
            session.mark_unjoined();
            LinkState::Uninitialized
        };

        info!(
            "uplink: tx {}/{} ok, {} failed, {} join attempts lifetime",
            session.succeeded(),
            session.attempted(),
            session.failed(),
            session.total_join_attempts()
        );

        Self {
            cfg,
            creds,
            link,
            clock,
            store,
            state,
            session,
            join_started_ms: None,
            last_join_ms: None,
            last_tx_ms: None,
            downlink: None,
            exhausted: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.state == LinkState::Joined
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn last_error(&self) -> Option<LinkError> {
        self.last_error
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Current spacing between join attempts. Under the backoff policy the
    /// base delay doubles for every attempt past the ceiling.
    pub fn join_retry_delay_ms(&self) -> u64 {
        let base = self.cfg.join_retry_delay_ms;
        if self.cfg.on_join_exhausted != ExhaustionPolicy::Backoff {
            return base;
        }
        let attempts = self.session.join_attempts();
        if attempts < self.cfg.max_join_attempts {
            return base;
        }
        let over = (attempts - self.cfg.max_join_attempts + 1).min(16);
        base.saturating_mul(1u64 << over)
            .min(self.cfg.max_join_backoff_ms)
            .max(base)
    }

    pub fn start_join(&mut self) -> JoinPoll {
        if self.exhausted {
            return JoinPoll::Halted;
        }
        if self.state == LinkState::Joined {
            return JoinPoll::AlreadyJoined;
        }
        if self.join_started_ms.is_some() {
            return JoinPoll::InProgress;
        }

        let now = self.clock.now_ms();
        let delay = self.join_retry_delay_ms();
        if let Some(last) = self.last_join_ms {
            let elapsed = now.saturating_sub(last);
            if elapsed < delay {
                return JoinPoll::RateLimited { retry_in_ms: delay - elapsed };
            }
        }

        if self.session.join_attempts() >= self.cfg.max_join_attempts
            && self.cfg.on_join_exhausted == ExhaustionPolicy::Restart
        {
            self.exhausted = true;
            error!(
                "uplink: join failed {} times in a row, giving up",
                self.session.join_attempts()
            );
            return JoinPoll::Exhausted;
        }

        self.state = LinkState::Joining;
        self.last_join_ms = Some(now);
        self.session.record_join_attempt();
        info!(
            "uplink: join attempt {}/{}",
            self.session.join_attempts(),
            self.cfg.max_join_attempts
        );

        let started = self.link.begin_join(&self.creds);
        self.persist();
        match started {
            Ok(()) => {
                self.join_started_ms = Some(now);
                JoinPoll::Started
            }
            Err(e) => {
                warn!("uplink: join request failed: {} (code {})", e, e.code());
                self.last_error = Some(e);
                JoinPoll::StartFailed(e)
            }
        }
    }

    /// Collects completion of an outstanding join and watches for a lost
    /// session. Call once per loop iteration.
    pub fn poll(&mut self) -> Option<LinkEvent> {
        match self.state {
            LinkState::Joined => {
                if !self.link.session_lost() {
                    return None;
                }
                warn!("uplink: network session lost, rejoining");
                self.state = LinkState::Joining;
                self.session.mark_unjoined();
                self.persist();
                Some(LinkEvent::SessionLost)
            }
            LinkState::Joining => {
                let started = self.join_started_ms?;
                match self.link.join_status() {
                    JoinStatus::Accepted => {
                        self.join_started_ms = None;
                        self.state = LinkState::Joined;
                        self.session.mark_joined();
                        self.last_error = None;
                        self.persist();
                        info!("uplink: joined");
                        Some(LinkEvent::Joined)
                    }
                    JoinStatus::Failed(e) => Some(self.join_failed(e)),
                    JoinStatus::Pending => {
                        let waited = self.clock.now_ms().saturating_sub(started);
                        if waited >= self.cfg.join_retry_delay_ms {
                            Some(self.join_failed(LinkError::NoJoinAccept))
                        } else {
                            None
                        }
                    }
                }
            }
            LinkState::Uninitialized => None,
        }
    }

    fn join_failed(&mut self, e: LinkError) -> LinkEvent {
        self.join_started_ms = None;
        self.last_error = Some(e);
        warn!(
            "uplink: join failed: {} (code {}), attempt {}/{}",
            e,
            e.code(),
            self.session.join_attempts(),
            self.cfg.max_join_attempts
        );
        LinkEvent::JoinFailed(e)
    }

    pub fn can_transmit(&self) -> bool {
        self.is_joined() && self.next_tx_in_ms() == 0
    }

    /// Milliseconds until the duty-cycle gate opens. 0 when open or when
    /// not joined.
    pub fn next_tx_in_ms(&self) -> u64 {
        if !self.is_joined() {
            return 0;
        }
        match self.last_tx_ms {
            None => 0,
            Some(last) => {
                let elapsed = self.clock.now_ms().saturating_sub(last);
                self.cfg.tx_interval_ms.saturating_sub(elapsed)
            }
        }
    }

    pub fn send(&mut self, msg: &TelemetryMessage) -> TxOutcome {
        if !self.can_transmit() {
            debug!("uplink: {:?} deferred", msg.message_type());
            return TxOutcome::Deferred;
        }
        let payload = geotrack_proto::encode(msg);
        self.transmit(&payload, self.cfg.port)
    }

    /// Sends a pre-encoded payload through the same gate and accounting as
    /// [`send`](Self::send). Ports outside [`APP_PORTS`] are rejected.
    pub fn send_raw(&mut self, payload: &[u8], port: u8) -> TxOutcome {
        if !self.can_transmit() {
            debug!("uplink: raw payload deferred");
            return TxOutcome::Deferred;
        }
        self.transmit(payload, port)
    }

    fn transmit(&mut self, payload: &[u8], port: u8) -> TxOutcome {
        if !APP_PORTS.contains(&port) {
            warn!("uplink: refusing to send on non-application port {}", port);
            return TxOutcome::Rejected;
        }
        let now = self.clock.now_ms();
        debug!("uplink: sending {} bytes on port {}", payload.len(), port);
        let result = self.link.send_receive(payload, port);
        self.last_tx_ms = Some(now);

        let outcome = match result {
            Ok(downlink) => {
                self.session.record_success(self.clock.unix_s());
                let got = downlink.is_some();
                if let Some(dl) = downlink {
                    info!("uplink: downlink {} bytes on port {}", dl.payload.len(), dl.port);
                    if self.downlink.replace(dl).is_some() {
                        warn!("uplink: previous downlink was never taken, dropped");
                    }
                }
                TxOutcome::Sent { downlink: got }
            }
            Err(e) => {
                self.session.record_failure();
                self.last_error = Some(e);
                warn!("uplink: send failed: {} (code {})", e, e.code());
                TxOutcome::Failed(e)
            }
        };
        self.persist();
        outcome
    }

    /// Hands out the last downlink once.
    pub fn take_downlink(&mut self) -> Option<Downlink> {
        self.downlink.take()
    }

    pub fn success_rate(&self) -> f32 {
        self.session.success_rate()
    }

    /// `(attempted, succeeded, failed)`
    pub fn statistics(&self) -> (u32, u32, u32) {
        (self.session.attempted(), self.session.succeeded(), self.session.failed())
    }

    pub fn reset_statistics(&mut self) {
        self.session.reset_statistics();
        self.persist();
        info!("uplink: statistics reset");
    }

    pub fn status_line(&self) -> String {
        let (attempted, succeeded, failed) = self.statistics();
        let mut line = format!(
            "{:?}: tx {}/{} ok ({:.0}%), {} failed, next tx in {} ms, join attempts {}",
            self.state,
            succeeded,
            attempted,
            self.success_rate(),
            failed,
            self.next_tx_in_ms(),
            self.session.join_attempts()
        );
        if let Some(e) = self.last_error {
            line.push_str(&format!(", last error: {}", e));
        }
        line
    }

    fn persist(&mut self) {
        if let Err(e) = save_json(self.store.as_mut(), KEY_SESSION, &self.session) {
            warn!("uplink: failed to persist session: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_proto::{StatusReport, TelemetryMessage};
    use geotrack_store::MemoryStore;

    #[derive(Default)]
    struct EchoLink {
        accept: bool,
        sent: Vec<(Vec<u8>, u8)>,
    }

    impl RadioLink for EchoLink {
        fn begin_join(&mut self, _: &Credentials) -> Result<(), LinkError> {
            Ok(())
        }
        fn join_status(&mut self) -> JoinStatus {
            if self.accept {
                JoinStatus::Accepted
            } else {
                JoinStatus::Pending
            }
        }
        fn send_receive(&mut self, payload: &[u8], port: u8) -> Result<Option<Downlink>, LinkError> {
            self.sent.push((payload.to_vec(), port));
            Ok(None)
        }
    }

    fn creds() -> Credentials {
        Credentials::parse("58EC3C43CA480000", "0000000000000000", "CE8A96F54327D1CB20078F78D4746517").unwrap()
    }

    fn status() -> TelemetryMessage {
        TelemetryMessage::Status(StatusReport {
            battery_pct: 90,
            uptime_hours: 1,
            gps_status: 2,
            system_status: 0,
        })
    }

    #[test]
    fn joins_then_sends_encoded_payload() {
        let clock = MockClock::new();
        let link = EchoLink { accept: true, ..Default::default() };
        let mut up = UplinkScheduler::new(
            SchedulerConfig::default(),
            creds(),
            link,
            clock.clone(),
            Box::new(MemoryStore::new()),
        );
        assert_eq!(up.state(), LinkState::Uninitialized);
        assert_eq!(up.send(&status()), TxOutcome::Deferred);
        assert_eq!(up.start_join(), JoinPoll::Started);
        assert_eq!(up.start_join(), JoinPoll::InProgress);
        assert_eq!(up.poll(), Some(LinkEvent::Joined));
        assert_eq!(up.start_join(), JoinPoll::AlreadyJoined);

        assert_eq!(up.send(&status()), TxOutcome::Sent { downlink: false });
        assert_eq!(up.link().sent, vec![(vec![0x03, 90, 0, 1, 2, 0], 1)]);
        assert_eq!(up.statistics(), (1, 1, 0));
        assert_eq!(up.session().last_success_unix_s(), Some(0));
    }

    #[test]
    fn join_backoff_doubles_and_caps() {
        let cfg = SchedulerConfig {
            join_retry_delay_ms: 1_000,
            max_join_attempts: 2,
            on_join_exhausted: ExhaustionPolicy::Backoff,
            max_join_backoff_ms: 5_000,
            ..Default::default()
        };
        let clock = MockClock::new();
        let mut up = UplinkScheduler::new(cfg, creds(), EchoLink::default(), clock.clone(), Box::new(MemoryStore::new()));
        assert_eq!(up.join_retry_delay_ms(), 1_000);
        up.session.record_join_attempt();
        up.session.record_join_attempt();
        assert_eq!(up.join_retry_delay_ms(), 2_000);
        up.session.record_join_attempt();
        assert_eq!(up.join_retry_delay_ms(), 4_000);
        up.session.record_join_attempt();
        assert_eq!(up.join_retry_delay_ms(), 5_000);
        for _ in 0..100 {
            up.session.record_join_attempt();
        }
        assert_eq!(up.join_retry_delay_ms(), 5_000);
    }

    #[test]
    fn status_line_mentions_state_and_error() {
        let clock = MockClock::new();
        let mut up = UplinkScheduler::new(
            SchedulerConfig::default(),
            creds(),
            EchoLink::default(),
            clock.clone(),
            Box::new(MemoryStore::new()),
        );
        assert!(up.status_line().starts_with("Uninitialized"));
        up.start_join();
        clock.advance(30_000);
        assert_eq!(up.poll(), Some(LinkEvent::JoinFailed(LinkError::NoJoinAccept)));
        let line = up.status_line();
        assert!(line.starts_with("Joining"), "{line}");
        assert!(line.contains("no join accept"), "{line}");
    }
}
