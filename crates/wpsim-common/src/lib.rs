//! # wpsim-common
//!
//! Common types and traits for the wpsim simulation framework.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`], nanosecond resolution)
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`]) with cancellable scheduling ([`EventId`])
//! - Simulation context ([`SimContext`]) acting as clock and scheduler
//! - Entity traits ([`Entity`]) and the [`EntityRegistry`]
//! - A deterministic [`EventQueue`]
//! - Frame format descriptors shared by the PHY and the channel ([`frame`])

pub mod frame;
mod queue;

pub use frame::{
    BurstTag, CodeRate, FrameFormat, FrameId, ModulationClass, PhyFrame, Preamble, WifiMode,
    WifiModeParseError,
};
pub use queue::EventQueue;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
///
/// PHY timing (OFDM symbols, guard intervals, header fields) is specified in
/// fractions of a microsecond, so nanoseconds are the base unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float). Rounds to the nearest nanosecond.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1e9).round().max(0.0) as u64)
    }

    /// Get as nanoseconds.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds (truncated).
    pub fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds (truncated).
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Add duration to time.
    pub fn add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }

    /// Check whether this is the zero time.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for SimTime {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}us", self.0 as f64 / 1_000.0)
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

// ============================================================================
// PHY-visible States and Outcomes
// ============================================================================

/// Receiver state. Exactly one holds at any simulated instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhyState {
    /// Powered off; signals are registered but never decoded.
    Off,
    /// Sleeping; signals are dropped silently.
    Sleep,
    /// Idle and able to synchronize.
    Idle,
    /// Medium sensed busy by energy, but not receiving.
    CcaBusy,
    /// Synchronized on a frame.
    Rx,
    /// Transmitting.
    Tx,
    /// Retuning to a new channel.
    Switching,
}

impl PhyState {
    /// Label used for metrics and traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            PhyState::Off => "OFF",
            PhyState::Sleep => "SLEEP",
            PhyState::Idle => "IDLE",
            PhyState::CcaBusy => "CCA_BUSY",
            PhyState::Rx => "RX",
            PhyState::Tx => "TX",
            PhyState::Switching => "SWITCHING",
        }
    }
}

impl std::fmt::Display for PhyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Why an incoming frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Arrived while switching, receiving or transmitting.
    NotIdle,
    /// Arrived while sleeping.
    Sleeping,
    /// Arrived while powered off.
    Off,
    /// Received power below the energy-detection threshold.
    BelowEdThreshold,
    /// Invalid or unsupported preamble (e.g. jamming energy).
    UndecodableFormat,
    /// Continuation subframe without an active burst.
    BurstDesync,
    /// The driver refused the reception.
    DriverVeto,
    /// Abandoned in favour of a stronger signal.
    Captured,
    /// Aborted by transmit, channel switch or power off.
    Aborted,
    /// Header failed to decode.
    HeaderFailure,
    /// Payload failed the error draw.
    PayloadFailure,
}

impl DropReason {
    /// Label used for metrics and traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            DropReason::NotIdle => "not_idle",
            DropReason::Sleeping => "sleeping",
            DropReason::Off => "off",
            DropReason::BelowEdThreshold => "below_ed_threshold",
            DropReason::UndecodableFormat => "undecodable_format",
            DropReason::BurstDesync => "burst_desync",
            DropReason::DriverVeto => "driver_veto",
            DropReason::Captured => "captured",
            DropReason::Aborted => "aborted",
            DropReason::HeaderFailure => "header_failure",
            DropReason::PayloadFailure => "payload_failure",
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event. Also serves as the cancel token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then posting order)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Transmit air event - sent by a PHY to the channel entity when it starts transmitting.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// PHY that is transmitting.
    pub phy_id: EntityId,
    /// The frame on the air.
    pub frame: PhyFrame,
    /// Radiated power in dBm (power level plus TX gain).
    pub tx_power_dbm: f64,
    /// Channel number the transmitter is tuned to.
    pub channel_number: u16,
    /// Air time of the frame.
    pub duration: SimTime,
}

/// Incoming signal - sent by the channel entity to each receiving PHY.
#[derive(Debug, Clone)]
pub struct IncomingSignalEvent {
    /// PHY that transmitted.
    pub source_phy: EntityId,
    /// The frame on the air.
    pub frame: PhyFrame,
    /// Power at the receiver antenna in dBm, before RX gain.
    pub rx_power_dbm: f64,
    /// Channel number the signal occupies.
    pub channel_number: u16,
    /// Air time of the signal.
    pub duration: SimTime,
}

/// Upper layer asks the PHY to transmit a frame.
#[derive(Debug, Clone)]
pub struct TxRequestEvent {
    /// Frame to transmit.
    pub frame: PhyFrame,
    /// Transmit power level index.
    pub power_level: u8,
}

/// Mode changes requested of the PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PhyControl {
    /// Retune to a new channel number.
    SwitchChannel {
        /// Target channel number.
        channel: u16,
    },
    /// Enter sleep mode (deferred while busy).
    Sleep,
    /// Leave sleep mode.
    Resume,
    /// Power the PHY off.
    PowerOff,
    /// Power the PHY back on.
    PowerOn,
}

/// PHY delivered a frame successfully.
#[derive(Debug, Clone)]
pub struct RxOkEvent {
    /// PHY that transmitted the frame.
    pub source_phy: EntityId,
    /// Frame identifier.
    pub frame_id: FrameId,
    /// Reported SNR in dB.
    pub snr_db: f64,
    /// Packet error rate the outcome was drawn against.
    pub per: f64,
    /// Time-averaged received signal strength in dBm.
    pub rss_dbm: f64,
    /// Per-subframe decode status.
    pub subframe_ok: Vec<bool>,
    /// Reception start.
    pub start_time: SimTime,
    /// Reception end.
    pub end_time: SimTime,
}

/// PHY dropped or failed a frame.
#[derive(Debug, Clone)]
pub struct RxDropEvent {
    /// PHY that transmitted the frame.
    pub source_phy: EntityId,
    /// Frame identifier.
    pub frame_id: FrameId,
    /// Why the frame was not delivered.
    pub reason: DropReason,
    /// Received signal strength in dBm, when measured.
    pub rss_dbm: Option<f64>,
}

/// PHY state machine changed.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    /// Previous state.
    pub previous: PhyState,
    /// New state.
    pub state: PhyState,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Channel Events ===========
    /// A PHY started transmitting (directed to the channel entity).
    TransmitAir(TransmitAirEvent),
    /// A signal reaches a receiver (from the channel entity to a PHY).
    IncomingSignal(IncomingSignalEvent),

    // =========== Upper Layer → PHY ===========
    /// Transmit a frame.
    PhyTxRequest(TxRequestEvent),
    /// Channel switch, sleep, resume or power control.
    PhyControl(PhyControl),

    // =========== PHY → Upper Layer ===========
    /// Successful reception.
    PhyRxOk(RxOkEvent),
    /// Dropped or failed reception.
    PhyRxDrop(RxDropEvent),
    /// State transition.
    PhyStateChanged(StateChangedEvent),
    /// Transmission started.
    PhyTxStart {
        /// Frame identifier.
        frame_id: FrameId,
        /// Radiated power in dBm.
        tx_power_dbm: f64,
        /// Air time.
        duration: SimTime,
    },
    /// Transmission finished.
    PhyTxEnd {
        /// Frame identifier.
        frame_id: FrameId,
    },
    /// Transmission refused (sleeping or off).
    PhyTxDrop {
        /// Frame identifier.
        frame_id: FrameId,
        /// State that refused the transmission.
        state: PhyState,
    },

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

impl EventPayload {
    /// Short label for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TransmitAir(_) => "transmit_air",
            EventPayload::IncomingSignal(_) => "incoming_signal",
            EventPayload::PhyTxRequest(_) => "tx_request",
            EventPayload::PhyControl(_) => "control",
            EventPayload::PhyRxOk(_) => "rx_ok",
            EventPayload::PhyRxDrop(_) => "rx_drop",
            EventPayload::PhyStateChanged(_) => "state_changed",
            EventPayload::PhyTxStart { .. } => "tx_start",
            EventPayload::PhyTxEnd { .. } => "tx_end",
            EventPayload::PhyTxDrop { .. } => "tx_drop",
            EventPayload::Timer { .. } => "timer",
            EventPayload::SimulationEnd => "simulation_end",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// Provides the clock ([`SimContext::time`]) and the scheduler
/// ([`SimContext::post_event`], [`SimContext::cancel`]).
pub struct SimContext {
    time: SimTime,
    pending_events: Vec<Event>,
    cancelled: HashSet<EventId>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context at time zero.
    pub fn new() -> Self {
        SimContext {
            time: SimTime::ZERO,
            pending_events: Vec::new(),
            cancelled: HashSet::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay. Returns a token usable with [`SimContext::cancel`].
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        let id = EventId(self.next_event_id);
        let event = Event {
            id,
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
        id
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventId {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Cancel a previously posted event. Cancelling an event that already fired is a no-op.
    pub fn cancel(&mut self, id: EventId) {
        if let Some(pos) = self.pending_events.iter().position(|e| e.id == id) {
            self.pending_events.remove(pos);
        } else {
            self.cancelled.insert(id);
        }
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Take all cancellations requested since the last call (used by event loop).
    pub fn take_cancelled(&mut self) -> HashSet<EventId> {
        std::mem::take(&mut self.cancelled)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Make sure future event IDs do not collide with externally created ones.
    pub fn reserve_event_ids(&mut self, up_to: u64) {
        if self.next_event_id < up_to {
            self.next_event_id = up_to;
        }
    }
}

impl Default for SimContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                tracing::error!(target_entity = target.0, kind = event.payload.kind(), "entity not found");
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Conversions
// ============================================================================

/// Convert dBm to watts.
pub fn dbm_to_w(dbm: f64) -> f64 {
    10f64.powf((dbm - 30.0) / 10.0)
}

/// Convert watts to dBm. Zero power maps to negative infinity.
pub fn w_to_dbm(w: f64) -> f64 {
    10.0 * w.log10() + 30.0
}

/// Convert dB to a linear ratio.
pub fn db_to_ratio(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Convert a linear ratio to dB.
pub fn ratio_to_db(ratio: f64) -> f64 {
    10.0 * ratio.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_micros(), 1_500_000);
        assert_eq!(time.as_nanos(), 1_500_000_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 1e-9);
        assert_eq!(SimTime::from_micros(250).as_nanos(), 250_000);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_millis(), 150);
        assert_eq!((t1 - t2).as_millis(), 50);
        // Subtraction saturates at zero
        assert_eq!(t2 - t1, SimTime::ZERO);
        assert_eq!(t2.sub(t1), None);
    }

    #[test]
    fn test_event_ordering_time_then_id() {
        let mk = |id: u64, us: u64| Event {
            id: EventId(id),
            time: SimTime::from_micros(us),
            source: EntityId(0),
            targets: vec![],
            payload: EventPayload::Timer { timer_id: id },
        };
        let mut heap = std::collections::BinaryHeap::new();
        heap.push(mk(3, 10));
        heap.push(mk(1, 10));
        heap.push(mk(2, 5));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.id.0).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_cancel_pending_event() {
        let mut ctx = SimContext::new();
        let keep = ctx.post_event(SimTime::from_micros(5), vec![EntityId(1)], EventPayload::Timer { timer_id: 1 });
        let drop = ctx.post_event(SimTime::from_micros(6), vec![EntityId(1)], EventPayload::Timer { timer_id: 2 });
        ctx.cancel(drop);
        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, keep);
        // Already-queued events are reported to the loop instead
        ctx.cancel(keep);
        assert!(ctx.take_cancelled().contains(&keep));
    }

    #[test]
    fn test_power_conversions() {
        assert!((dbm_to_w(30.0) - 1.0).abs() < 1e-12);
        assert!((dbm_to_w(-100.0) - 1e-13).abs() < 1e-25);
        assert!((w_to_dbm(1e-3) - 0.0).abs() < 1e-9);
        assert!((db_to_ratio(6.0) - 3.981).abs() < 1e-3);
        assert!((ratio_to_db(100.0) - 20.0).abs() < 1e-9);
    }
}
