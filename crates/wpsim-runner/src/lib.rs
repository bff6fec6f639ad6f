//! # wpsim-runner library
//!
//! Library interface of the wpsim runner.
//!
//! This crate provides:
//! - [`EventLoop`]: pops events in time order, dispatches them to entities,
//!   applies cancellations and collects the events they post
//! - [`SimulationStats`] and [`NodeStats`]: outcome counters gathered from the
//!   PHY notifications flowing through the loop
//! - [`TraceRecorder`]: JSON trace of transmissions, receptions, drops, state
//!   changes and control actions
//! - [`metrics_export`]: an in-memory `metrics` recorder with JSON export

pub mod metrics_export;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};
use wpsim_common::{DropReason, EntityId, Event, EventId, EventPayload, EventQueue, PhyControl, PhyState, SimContext};
use wpsim_metrics::metric_defs;

pub use wpsim_common::SimTime;
pub use wpsim_model::{build_simulation, load_model, load_model_from_str, load_models, BuiltSimulation, NodeInfo};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Model error.
    #[error("Model error: {0}")]
    Model(#[from] wpsim_model::ModelError),

    /// Simulation error.
    #[error("Simulation error: {0}")]
    Simulation(#[from] wpsim_common::SimError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// ============================================================================
// Simulation Statistics
// ============================================================================

/// Per-node outcome counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    /// Frames put on the air.
    pub tx: u64,
    /// Transmissions refused while sleeping or off.
    pub tx_refused: u64,
    /// Frames received successfully.
    pub rx_ok: u64,
    /// Frames not delivered, by reason.
    pub rx_drop: BTreeMap<DropReason, u64>,
    /// State transitions reported.
    pub state_changes: u64,
}

/// Statistics collected during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Total events processed.
    pub total_events: u64,
    /// Frames put on the air.
    pub frames_transmitted: u64,
    /// Frames received successfully.
    pub frames_received: u64,
    /// Frames not delivered.
    pub frames_dropped: u64,
    /// Undelivered frames by reason.
    pub drops_by_reason: BTreeMap<DropReason, u64>,
    /// Transmissions refused while sleeping or off.
    pub tx_refused: u64,
    /// PHY state transitions.
    pub state_changes: u64,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

// ============================================================================
// Trace Recording
// ============================================================================

/// A frame put on the air.
#[derive(Debug, Clone, Serialize)]
pub struct TxPayload {
    /// Frame identifier.
    pub frame_id: u64,
    /// Modulation and coding.
    pub mode: String,
    /// Radiated power in dBm.
    pub tx_power_dbm: f64,
    /// Channel the frame occupies.
    pub channel_number: u16,
    /// Payload size.
    pub payload_bytes: usize,
    /// Air time start in seconds.
    pub start_time_s: f64,
    /// Air time end in seconds.
    pub end_time_s: f64,
}

/// A frame received successfully.
#[derive(Debug, Clone, Serialize)]
pub struct RxPayload {
    /// Transmitting entity.
    pub source_id: u64,
    /// Frame identifier.
    pub frame_id: u64,
    /// Reported SNR in dB.
    pub snr_db: f64,
    /// Packet error rate of the draw.
    pub per: f64,
    /// Time-averaged received power in dBm.
    pub rss_dbm: f64,
    /// Per-subframe decode status.
    pub subframe_ok: Vec<bool>,
    /// Reception start in seconds.
    pub start_time_s: f64,
    /// Reception end in seconds.
    pub end_time_s: f64,
}

/// A frame that was not delivered.
#[derive(Debug, Clone, Serialize)]
pub struct DropPayload {
    /// Transmitting entity.
    pub source_id: u64,
    /// Frame identifier.
    pub frame_id: u64,
    /// Why it was not delivered.
    pub reason: DropReason,
    /// Received power in dBm, when measured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_dbm: Option<f64>,
}

/// A PHY state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatePayload {
    /// State before.
    pub previous: PhyState,
    /// State after.
    pub state: PhyState,
}

/// A control action delivered to a PHY.
#[derive(Debug, Clone, Serialize)]
pub struct ControlPayload {
    /// Action name.
    pub action: &'static str,
    /// Target channel of a switch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
}

/// Payload types for trace entries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TracePayload {
    /// Frame put on the air.
    #[serde(rename = "TX")]
    Tx(TxPayload),
    /// Transmission refused.
    #[serde(rename = "TX_DROP")]
    TxDrop {
        /// Frame identifier.
        frame_id: u64,
        /// Refusing state.
        state: PhyState,
    },
    /// Successful reception.
    #[serde(rename = "RX")]
    Rx(RxPayload),
    /// Undelivered frame.
    #[serde(rename = "DROP")]
    Drop(DropPayload),
    /// State transition.
    #[serde(rename = "STATE")]
    State(StatePayload),
    /// Control action.
    #[serde(rename = "CONTROL")]
    Control(ControlPayload),
}

/// A trace entry for output.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    /// Node name.
    pub origin: String,
    /// Node entity id.
    pub origin_id: u64,
    /// Simulation time in microseconds.
    pub time_us: u64,
    /// Event-specific payload (flattened into this object).
    #[serde(flatten)]
    pub payload: TracePayload,
}

/// Collects trace entries and writes them as a JSON array on flush.
pub struct TraceRecorder {
    output: Option<Box<dyn Write>>,
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    /// Create a trace recorder. Nothing is recorded without an output.
    pub fn new(output: Option<Box<dyn Write>>) -> Self {
        TraceRecorder {
            output,
            entries: Vec::new(),
        }
    }

    /// True if entries are being collected.
    pub fn is_enabled(&self) -> bool {
        self.output.is_some()
    }

    /// Record an entry.
    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    /// Entries recorded so far.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Write all entries to the output.
    pub fn flush(&mut self) -> Result<(), RunnerError> {
        if let Some(ref mut output) = self.output {
            let json = serde_json::to_string_pretty(&self.entries)?;
            writeln!(output, "{}", json)?;
            output.flush()?;
        }
        Ok(())
    }
}

fn control_payload(control: &PhyControl) -> ControlPayload {
    let (action, channel) = match control {
        PhyControl::SwitchChannel { channel } => ("switch_channel", Some(*channel)),
        PhyControl::Sleep => ("sleep", None),
        PhyControl::Resume => ("resume", None),
        PhyControl::PowerOff => ("power_off", None),
        PhyControl::PowerOn => ("power_on", None),
    };
    ControlPayload { action, channel }
}

// ============================================================================
// Event Loop
// ============================================================================

/// The main simulation event loop.
///
/// Events are processed in (time, event id) order, so equal-time events run
/// in the order they were posted and runs with the same seed are identical.
pub struct EventLoop {
    event_queue: EventQueue,
    simulation: BuiltSimulation,
    context: SimContext,
    trace: TraceRecorder,
    stats: SimulationStats,
    /// Per-node statistics, keyed by entity id.
    node_stats: BTreeMap<u64, NodeStats>,
    /// Entity id to (node name, role) for metric labels and traces.
    entity_to_labels: HashMap<u64, (String, String)>,
}

impl EventLoop {
    /// Create an event loop over a built simulation.
    pub fn new(simulation: BuiltSimulation, trace_output: Option<Box<dyn Write>>) -> Self {
        let mut context = SimContext::new();
        let next_id = simulation
            .initial_events
            .iter()
            .map(|e| e.id.0 + 1)
            .max()
            .unwrap_or(0);
        context.reserve_event_ids(next_id);

        let mut event_queue = EventQueue::new();
        event_queue.extend(simulation.initial_events.iter().cloned());

        let mut node_stats = BTreeMap::new();
        let mut entity_to_labels = HashMap::new();
        for node_info in &simulation.node_infos {
            node_stats.insert(node_info.entity_id, NodeStats::default());
            entity_to_labels.insert(node_info.entity_id, (node_info.name.clone(), node_info.role.clone()));
        }

        EventLoop {
            event_queue,
            simulation,
            context,
            trace: TraceRecorder::new(trace_output),
            stats: SimulationStats::default(),
            node_stats,
            entity_to_labels,
        }
    }

    /// Dispatch an event to its targets, recording per-step wall time.
    fn dispatch_event_with_metrics(&mut self, event: &Event) -> Result<(), wpsim_common::SimError> {
        for target in &event.targets {
            let Some(entity) = self.simulation.entities.get_mut(*target) else {
                tracing::error!(target_entity = target.0, kind = event.payload.kind(), "entity not found");
                return Err(wpsim_common::SimError::EntityNotFound(*target));
            };
            self.context.set_source(*target);

            let step_start = Instant::now();
            entity.handle_event(event, &mut self.context)?;
            let step_elapsed = step_start.elapsed();

            if let Some((name, role)) = self.entity_to_labels.get(&target.0) {
                let labels = [
                    ("node", name.clone()),
                    ("role", role.clone()),
                    ("event", event.payload.kind().to_string()),
                ];
                metrics::histogram!(metric_defs::SIMULATION_STEP_TIME.name, &labels)
                    .record(step_elapsed.as_secs_f64() * 1e6);
            }
        }
        Ok(())
    }

    /// Run until `duration` of simulation time has elapsed or no events remain.
    pub fn run(&mut self, duration: SimTime) -> Result<SimulationStats, RunnerError> {
        let start_time = Instant::now();
        info!(duration_s = duration.as_secs_f64(), events = self.event_queue.len(), "simulation started");

        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: duration,
            source: EntityId::new(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.event_queue.pop() {
            self.context.set_time(event.time);
            if matches!(event.payload, EventPayload::SimulationEnd) {
                break;
            }

            self.dispatch_event_with_metrics(&event)?;

            self.event_queue.cancel_all(self.context.take_cancelled());
            self.event_queue.extend(self.context.take_pending_events());

            self.stats.total_events += 1;
            self.update_stats(&event);
            self.record_trace(&event);
        }

        self.stats.simulation_time_us = self.context.time().as_micros();
        self.stats.wall_time_ms = start_time.elapsed().as_millis() as u64;
        info!(
            events = self.stats.total_events,
            received = self.stats.frames_received,
            dropped = self.stats.frames_dropped,
            wall_ms = self.stats.wall_time_ms,
            "simulation finished"
        );

        self.trace.flush()?;
        Ok(self.stats.clone())
    }

    /// Per-node statistics, keyed by entity id.
    pub fn node_stats(&self) -> &BTreeMap<u64, NodeStats> {
        &self.node_stats
    }

    /// Node information of the simulation.
    pub fn node_infos(&self) -> &[NodeInfo] {
        &self.simulation.node_infos
    }

    /// Current statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Trace entries recorded so far.
    pub fn trace_entries(&self) -> &[TraceEntry] {
        self.trace.entries()
    }

    /// Current simulation time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    /// Events still queued.
    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    fn update_stats(&mut self, event: &Event) {
        // notifications come from the PHY, which shares its station's id
        let node = event.source.0;
        match &event.payload {
            EventPayload::TransmitAir(tx) => {
                self.stats.frames_transmitted += 1;
                if let Some(stats) = self.node_stats.get_mut(&tx.phy_id.0) {
                    stats.tx += 1;
                }
            }
            EventPayload::PhyRxOk(_) => {
                self.stats.frames_received += 1;
                if let Some(stats) = self.node_stats.get_mut(&node) {
                    stats.rx_ok += 1;
                }
            }
            EventPayload::PhyRxDrop(drop) => {
                self.stats.frames_dropped += 1;
                *self.stats.drops_by_reason.entry(drop.reason).or_insert(0) += 1;
                if let Some(stats) = self.node_stats.get_mut(&node) {
                    *stats.rx_drop.entry(drop.reason).or_insert(0) += 1;
                }
            }
            EventPayload::PhyTxDrop { .. } => {
                self.stats.tx_refused += 1;
                if let Some(stats) = self.node_stats.get_mut(&node) {
                    stats.tx_refused += 1;
                }
            }
            EventPayload::PhyStateChanged(change) => {
                self.stats.state_changes += 1;
                if let Some(stats) = self.node_stats.get_mut(&node) {
                    stats.state_changes += 1;
                }
                debug!(node, previous = %change.previous, state = %change.state, time = %event.time, "state changed");
            }
            _ => {}
        }
    }

    fn record_trace(&mut self, event: &Event) {
        if !self.trace.is_enabled() {
            return;
        }
        let (origin_id, payload) = match &event.payload {
            EventPayload::TransmitAir(tx) => (
                tx.phy_id.0,
                TracePayload::Tx(TxPayload {
                    frame_id: tx.frame.id,
                    mode: tx.frame.format.mode.to_string(),
                    tx_power_dbm: tx.tx_power_dbm,
                    channel_number: tx.channel_number,
                    payload_bytes: tx.frame.payload_bytes,
                    start_time_s: event.time.as_secs_f64(),
                    end_time_s: (event.time + tx.duration).as_secs_f64(),
                }),
            ),
            EventPayload::PhyTxDrop { frame_id, state } => (
                event.source.0,
                TracePayload::TxDrop {
                    frame_id: *frame_id,
                    state: *state,
                },
            ),
            EventPayload::PhyRxOk(ok) => (
                event.source.0,
                TracePayload::Rx(RxPayload {
                    source_id: ok.source_phy.0,
                    frame_id: ok.frame_id,
                    snr_db: ok.snr_db,
                    per: ok.per,
                    rss_dbm: ok.rss_dbm,
                    subframe_ok: ok.subframe_ok.clone(),
                    start_time_s: ok.start_time.as_secs_f64(),
                    end_time_s: ok.end_time.as_secs_f64(),
                }),
            ),
            EventPayload::PhyRxDrop(drop) => (
                event.source.0,
                TracePayload::Drop(DropPayload {
                    source_id: drop.source_phy.0,
                    frame_id: drop.frame_id,
                    reason: drop.reason,
                    rss_dbm: drop.rss_dbm,
                }),
            ),
            EventPayload::PhyStateChanged(change) => (
                event.source.0,
                TracePayload::State(StatePayload {
                    previous: change.previous,
                    state: change.state,
                }),
            ),
            EventPayload::PhyControl(control) => {
                let Some(target) = event.targets.first() else { return };
                (target.0, TracePayload::Control(control_payload(control)))
            }
            _ => return,
        };

        let origin = self
            .entity_to_labels
            .get(&origin_id)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| format!("Entity_{}", origin_id));
        self.trace.record(TraceEntry {
            origin,
            origin_id,
            time_us: event.time.as_micros(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR: &str = r#"
nodes:
  - name: ap
  - name: sta
links:
  - from: ap
    to: sta
    loss_db: 70
traffic:
  - node: ap
    start_s: 0.001
    interval_s: 0.01
    count: 5
"#;

    fn event_loop(yaml: &str, seed: u64) -> EventLoop {
        let model = load_model_from_str(yaml).unwrap();
        let simulation = build_simulation(&model, seed).unwrap();
        EventLoop::new(simulation, Some(Box::new(std::io::sink())))
    }

    #[test]
    fn test_strong_link_delivers_every_frame() {
        let mut event_loop = event_loop(PAIR, 1);
        let stats = event_loop.run(SimTime::from_millis(100)).unwrap();

        assert_eq!(stats.frames_transmitted, 5);
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.simulation_time_us, 100_000);

        let sta = event_loop.node_infos().iter().find(|n| n.name == "sta").unwrap().entity_id;
        let ap = event_loop.node_infos().iter().find(|n| n.name == "ap").unwrap().entity_id;
        assert_eq!(event_loop.node_stats()[&sta].rx_ok, 5);
        assert_eq!(event_loop.node_stats()[&ap].tx, 5);
        // Rx then Idle per frame at the receiver, Tx then Idle at the sender
        assert_eq!(event_loop.node_stats()[&sta].state_changes, 10);
        assert_eq!(event_loop.node_stats()[&ap].state_changes, 10);
    }

    #[test]
    fn test_trace_entries() {
        let mut event_loop = event_loop(PAIR, 1);
        event_loop.run(SimTime::from_millis(5)).unwrap();

        let kinds: Vec<&str> = event_loop
            .trace_entries()
            .iter()
            .map(|e| match e.payload {
                TracePayload::Tx(_) => "TX",
                TracePayload::Rx(_) => "RX",
                TracePayload::State(_) => "STATE",
                _ => "OTHER",
            })
            .filter(|k| *k != "STATE")
            .collect();
        assert_eq!(kinds, vec!["TX", "RX"]);

        let rx = event_loop
            .trace_entries()
            .iter()
            .find(|e| matches!(e.payload, TracePayload::Rx(_)))
            .unwrap();
        assert_eq!(rx.origin, "sta");
        let json = serde_json::to_value(rx).unwrap();
        assert_eq!(json["type"], "RX");
        assert_eq!(json["frame_id"], 1u64 << 40);
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let lossy = PAIR.replace("loss_db: 70", "loss_db: 109").replace("count: 5", "count: 200");
        let mut first = event_loop(&lossy, 9);
        let mut second = event_loop(&lossy, 9);
        let a = first.run(SimTime::from_secs(3.0)).unwrap();
        let b = second.run(SimTime::from_secs(3.0)).unwrap();
        assert_eq!(a.total_events, b.total_events);
        assert_eq!(a.frames_received, b.frames_received);
        assert_eq!(a.drops_by_reason, b.drops_by_reason);
    }

    #[test]
    fn test_stops_at_duration() {
        let mut event_loop = event_loop(PAIR, 1);
        let stats = event_loop.run(SimTime::from_millis(15)).unwrap();
        assert_eq!(stats.frames_transmitted, 2);
        assert_eq!(event_loop.current_time(), SimTime::from_millis(15));
        assert!(event_loop.pending_events() > 0);
    }

    #[test]
    fn test_control_traced_on_target() {
        let yaml = format!("{PAIR}control:\n  - node: sta\n    at_s: 0.0005\n    action: switch_channel\n    channel: 6\n");
        let mut event_loop = event_loop(&yaml, 1);
        let stats = event_loop.run(SimTime::from_millis(30)).unwrap();
        assert_eq!(stats.frames_received, 0);

        let control = event_loop
            .trace_entries()
            .iter()
            .find(|e| matches!(e.payload, TracePayload::Control(_)))
            .unwrap();
        assert_eq!(control.origin, "sta");
        assert_eq!(control.time_us, 500);
        let json = serde_json::to_value(control).unwrap();
        assert_eq!(json["action"], "switch_channel");
        assert_eq!(json["channel"], 6);
    }
}
