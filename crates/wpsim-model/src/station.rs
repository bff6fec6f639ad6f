//! Station entity: a PHY plus the traffic it originates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};
use wpsim_common::{
    DropReason, Entity, EntityId, Event, EventPayload, FrameFormat, FrameId, PhyFrame, PhyState, Preamble,
    SimContext, SimError, SimTime, WifiMode,
};
use wpsim_phy::Phy;

/// Flow timers live above the PHY's timer ranges.
const TIMER_FLOW_BASE: u64 = 3 << 32;

/// Frames waiting for the PHY beyond this are discarded.
const MAX_PENDING: usize = 256;

fn default_mode() -> WifiMode {
    WifiMode::OFDM_6
}

fn default_payload_bytes() -> usize {
    1000
}

fn default_burst() -> u16 {
    1
}

/// A traffic flow originating at one node.
///
/// ```yaml
/// traffic:
///   - node: ap
///     mode: ht-mcs7
///     payload_bytes: 1500
///     burst: 4
///     start_s: 0.001
///     interval_s: 0.01
///     count: 20
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficConfig {
    /// Sending node.
    pub node: String,
    /// Modulation and coding.
    #[serde(default = "default_mode")]
    pub mode: WifiMode,
    /// Preamble override; the mode's default otherwise.
    #[serde(default)]
    pub preamble: Option<Preamble>,
    /// Channel width override in MHz.
    #[serde(default)]
    pub channel_width_mhz: Option<u16>,
    /// Spatial streams override.
    #[serde(default)]
    pub nss: Option<u8>,
    /// Payload size of each frame.
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
    /// Packed unit sizes; replaces `payload_bytes` with their sum.
    #[serde(default)]
    pub subframes: Vec<usize>,
    /// Frames per burst. Above one, the first frame carries the preamble and
    /// the rest are sent back to back as continuation subframes.
    #[serde(default = "default_burst")]
    pub burst: u16,
    /// First send time in seconds.
    #[serde(default)]
    pub start_s: f64,
    /// Period in seconds; one-shot when unset.
    #[serde(default)]
    pub interval_s: Option<f64>,
    /// Number of sends; unlimited for periodic flows when unset.
    #[serde(default)]
    pub count: Option<u64>,
    /// Transmit power level index.
    #[serde(default)]
    pub power_level: u8,
    /// Send undecodable energy instead of frames.
    #[serde(default)]
    pub jam: bool,
}

impl TrafficConfig {
    /// Format of the first frame of each send.
    pub fn format(&self) -> FrameFormat {
        let mut format = FrameFormat::for_mode(self.mode);
        if let Some(preamble) = self.preamble {
            format = format.with_preamble(preamble);
        }
        if self.jam {
            format = format.with_preamble(Preamble::Invalid);
        }
        if let Some(width) = self.channel_width_mhz {
            format = format.with_channel_width(width);
        }
        if let Some(nss) = self.nss {
            format = format.with_nss(nss);
        }
        format
    }

    /// Frames of one send, in transmission order.
    pub fn frames(&self, mut next_id: impl FnMut() -> FrameId) -> Vec<PhyFrame> {
        let format = self.format();
        let build = |id: FrameId, format: FrameFormat| {
            let frame = PhyFrame::new(id, format, self.payload_bytes);
            if self.subframes.is_empty() {
                frame
            } else {
                frame.with_subframes(self.subframes.clone())
            }
        };
        if self.burst <= 1 || self.jam {
            return vec![build(next_id(), format)];
        }
        let continuation = format.clone().with_preamble(Preamble::None);
        (0..self.burst)
            .map(|i| {
                let format = if i == 0 { format.clone() } else { continuation.clone() };
                build(next_id(), format).with_burst(self.burst - 1 - i)
            })
            .collect()
    }

    /// True if another send follows one that made the total `sent`.
    fn repeats_after(&self, sent: u64) -> bool {
        self.interval_s.is_some() && self.count.map_or(true, |count| sent < count)
    }
}

/// Per-station outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StationStats {
    /// Frames received successfully.
    pub rx_ok: u64,
    /// Frames not delivered, by reason.
    pub rx_drop: BTreeMap<DropReason, u64>,
    /// Transmissions started.
    pub tx_started: u64,
    /// Transmissions refused (sleeping or off).
    pub tx_dropped: u64,
}

struct Flow {
    config: TrafficConfig,
    sent: u64,
}

/// A node: the PHY, its traffic flows, and the observer of its outcomes.
///
/// The station shares the PHY's entity id. It handles flow timers and the
/// PHY's notifications itself and forwards everything else to the PHY.
/// Frames are held back while the PHY transmits or retunes.
pub struct Station {
    id: EntityId,
    phy: Phy,
    node_index: u64,
    flows: Vec<Flow>,
    pending: VecDeque<(PhyFrame, u8)>,
    next_seq: u64,
    stats: StationStats,
}

impl Station {
    /// Wrap `phy`. Its notifications are routed back to the station.
    pub fn new(phy: Phy, node_index: u32) -> Self {
        let id = phy.entity_id();
        Station {
            id,
            phy: phy.with_observer(id),
            node_index: node_index as u64,
            flows: Vec::new(),
            pending: VecDeque::new(),
            next_seq: 0,
            stats: StationStats::default(),
        }
    }

    /// Add a flow. Returns the timer id that triggers its first send.
    pub fn add_flow(&mut self, config: TrafficConfig) -> u64 {
        self.flows.push(Flow { config, sent: 0 });
        TIMER_FLOW_BASE + (self.flows.len() - 1) as u64
    }

    /// The PHY.
    pub fn phy(&self) -> &Phy {
        &self.phy
    }

    /// Outcome counters.
    pub fn stats(&self) -> &StationStats {
        &self.stats
    }

    /// Frames waiting for the PHY.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn next_frame_id(node_index: u64, next_seq: &mut u64) -> FrameId {
        let id = ((node_index + 1) << 40) | *next_seq;
        *next_seq += 1;
        id
    }

    fn fire_flow(&mut self, index: usize, ctx: &mut SimContext) -> Result<(), SimError> {
        let node_index = self.node_index;
        let next_seq = &mut self.next_seq;
        let Some(flow) = self.flows.get_mut(index) else {
            warn!(node = %self.phy.name(), index, "timer for unknown flow");
            return Ok(());
        };
        flow.sent += 1;
        let frames = flow.config.frames(|| Self::next_frame_id(node_index, next_seq));
        let power_level = flow.config.power_level;
        if flow.config.repeats_after(flow.sent) {
            let interval = SimTime::from_secs(flow.config.interval_s.unwrap_or_default());
            ctx.post_event(
                interval,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_FLOW_BASE + index as u64,
                },
            );
        }

        if self.pending.len() + frames.len() > MAX_PENDING {
            warn!(node = %self.phy.name(), pending = self.pending.len(), "send queue full, discarding frames");
            return Ok(());
        }
        self.pending.extend(frames.into_iter().map(|frame| (frame, power_level)));
        self.flush(ctx)
    }

    /// Hand queued frames to the PHY while it can take them.
    fn flush(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        while !self.pending.is_empty() {
            if matches!(self.phy.state(ctx.time()), PhyState::Tx | PhyState::Switching) {
                break;
            }
            let Some((frame, power_level)) = self.pending.pop_front() else {
                break;
            };
            self.phy.send(frame, power_level, ctx)?;
        }
        Ok(())
    }
}

impl Entity for Station {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } if timer_id >> 32 == TIMER_FLOW_BASE >> 32 => {
                self.fire_flow((timer_id - TIMER_FLOW_BASE) as usize, ctx)
            }
            EventPayload::PhyRxOk(ok) => {
                self.stats.rx_ok += 1;
                debug!(node = %self.phy.name(), frame = ok.frame_id, from = ok.source_phy.0, snr_db = ok.snr_db, "frame received");
                Ok(())
            }
            EventPayload::PhyRxDrop(drop) => {
                *self.stats.rx_drop.entry(drop.reason).or_insert(0) += 1;
                Ok(())
            }
            EventPayload::PhyTxStart { .. } => {
                self.stats.tx_started += 1;
                Ok(())
            }
            EventPayload::PhyTxDrop { .. } => {
                self.stats.tx_dropped += 1;
                Ok(())
            }
            EventPayload::PhyTxEnd { .. } | EventPayload::PhyStateChanged(_) => self.flush(ctx),
            _ => self.phy.handle_event(event, ctx),
        }
    }
}
