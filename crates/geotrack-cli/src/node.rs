use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, info, warn};

use geotrack_nav::{FixStatus, GeofenceEngine, GeofenceEvent, PositionSource};
use geotrack_proto::{MessageType, StatusReport, TelemetryMessage, BATTERY_UNKNOWN};
use geotrack_uplink::{Clock, JoinPoll, LinkError, RadioLink, TxOutcome, UplinkScheduler};

const MS_PER_HOUR: u64 = 3_600_000;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_gps_reports")]
    pub gps_reports: bool,
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
    /// Fixed battery level to report; unknown when absent.
    #[serde(default)]
    pub battery_pct: Option<u8>,
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_status_interval_ms() -> u64 {
    MS_PER_HOUR
}

fn default_gps_reports() -> bool {
    true
}

fn default_event_queue() -> usize {
    8
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            status_interval_ms: default_status_interval_ms(),
            gps_reports: default_gps_reports(),
            event_queue: default_event_queue(),
            battery_pct: None,
        }
    }
}

/// What one loop iteration did on the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Sent(MessageType),
    Failed(MessageType, LinkError),
    /// Join ceiling reached; the owner should rebuild the node.
    Exhausted,
}

/// One tracker: a position source, the fence engine and the uplink, driven
/// by a single cooperative loop.
pub struct Node<P: PositionSource, L: RadioLink, C: Clock> {
    cfg: NodeConfig,
    source: P,
    engine: GeofenceEngine,
    uplink: UplinkScheduler<L, C>,
    clock: C,
    started_ms: u64,
    events: VecDeque<GeofenceEvent>,
    last_status_ms: Option<u64>,
    last_tx_failed: bool,
}

impl<P: PositionSource, L: RadioLink, C: Clock> Node<P, L, C> {
    pub fn new(cfg: NodeConfig, source: P, engine: GeofenceEngine, uplink: UplinkScheduler<L, C>, clock: C) -> Self {
        let started_ms = clock.now_ms();
        Self {
            cfg,
            source,
            engine,
            uplink,
            clock,
            started_ms,
            events: VecDeque::new(),
            last_status_ms: None,
            last_tx_failed: false,
        }
    }

    pub fn engine(&self) -> &GeofenceEngine {
        &self.engine
    }

    pub fn uplink(&self) -> &UplinkScheduler<L, C> {
        &self.uplink
    }

    pub fn uplink_mut(&mut self) -> &mut UplinkScheduler<L, C> {
        &mut self.uplink
    }

    pub fn queued_events(&self) -> usize {
        self.events.len()
    }

    /// Join upkeep, one position sample, fence evaluation, then at most one
    /// uplink: a queued fence event first, then a due status report, then a
    /// GPS report of this cycle's fix.
    pub fn tick(&mut self) -> Tick {
        if self.uplink.start_join() == JoinPoll::Exhausted {
            return Tick::Exhausted;
        }
        if let Some(ev) = self.uplink.poll() {
            debug!("node: link event {:?}", ev);
        }

        let fix = match self.source.next_fix() {
            Ok(fix) => fix,
            Err(e) => {
                warn!("node: position source failed: {:#}", e);
                None
            }
        };
        let fix_status = self.engine.gate().classify(fix.as_ref());
        let good_fix = fix.filter(|_| fix_status == FixStatus::Good);

        if let Some(pos) = &good_fix {
            let fresh: Vec<GeofenceEvent> = self.engine.evaluate(pos).collect();
            for ev in fresh {
                debug!("node: queued fence {} {:?}", ev.fence_id, ev.crossing);
                self.enqueue(ev);
            }
        }

        let tick = self.transmit(fix_status, good_fix.map(|p| p.to_report()));

        if let Some(dl) = self.uplink.take_downlink() {
            info!("node: downlink port {}: {}", dl.port, hex::encode(&dl.payload));
        }
        tick
    }

    fn enqueue(&mut self, ev: GeofenceEvent) {
        if self.events.len() >= self.cfg.event_queue.max(1) {
            if let Some(dropped) = self.events.pop_front() {
                warn!(
                    "node: event queue full, dropped fence {} {:?}",
                    dropped.fence_id, dropped.crossing
                );
            }
        }
        self.events.push_back(ev);
    }

    fn transmit(&mut self, fix_status: FixStatus, report: Option<geotrack_proto::GpsReport>) -> Tick {
        if !self.uplink.can_transmit() {
            return Tick::Idle;
        }
        let now = self.clock.now_ms();

        if let Some(ev) = self.events.front().copied() {
            let outcome = self.send(&ev.into());
            // Failed events stay queued for the next window.
            if matches!(outcome, Tick::Sent(_)) {
                self.events.pop_front();
            }
            return outcome;
        }

        let status_due = self
            .last_status_ms
            .map_or(true, |last| now.saturating_sub(last) >= self.cfg.status_interval_ms);
        if status_due {
            let msg = TelemetryMessage::Status(self.status_report(fix_status, now));
            let outcome = self.send(&msg);
            if outcome != Tick::Idle {
                self.last_status_ms = Some(now);
            }
            return outcome;
        }

        match report {
            Some(r) if self.cfg.gps_reports => self.send(&TelemetryMessage::Gps(r)),
            _ => Tick::Idle,
        }
    }

    fn send(&mut self, msg: &TelemetryMessage) -> Tick {
        let kind = msg.message_type();
        match self.uplink.send(msg) {
            TxOutcome::Deferred | TxOutcome::Rejected => Tick::Idle,
            TxOutcome::Sent { .. } => {
                self.last_tx_failed = false;
                Tick::Sent(kind)
            }
            TxOutcome::Failed(e) => {
                self.last_tx_failed = true;
                Tick::Failed(kind, e)
            }
        }
    }

    fn status_report(&self, fix_status: FixStatus, now: u64) -> StatusReport {
        let uptime_h = now.saturating_sub(self.started_ms) / MS_PER_HOUR;
        let system_status = if !self.uplink.is_joined() {
            1
        } else if self.last_tx_failed {
            2
        } else {
            0
        };
        StatusReport {
            battery_pct: self.cfg.battery_pct.unwrap_or(BATTERY_UNKNOWN),
            uptime_hours: uptime_h.min(u16::MAX as u64) as u16,
            gps_status: fix_status as u8,
            system_status,
        }
    }
}
