//! The receiver state machine.

use crate::burst::{BurstCheck, BurstTracker};
use crate::config::{PhyConfig, PhyLayerInfo};
use crate::driver::PhyDriver;
use crate::state::StateHelper;
use crate::PhyError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use wpsim_common::{
    dbm_to_w, ratio_to_db, w_to_dbm, DropReason, Entity, EntityId, Event, EventId, EventPayload, FrameId,
    IncomingSignalEvent, PhyControl, PhyFrame, PhyState, RxDropEvent, RxOkEvent, SimContext, SimError,
    SimTime, StateChangedEvent, TransmitAirEvent,
};
use wpsim_interference::{ErrorRateModel, FrameTiming, PowerTimeline, ReferenceErrorRateModel, Signal, SnrPerCalculator};
use wpsim_metrics::{metric_defs, metrics, MetricLabels};

// Timer IDs. Reception timers carry the reception id in the low 32 bits.
const TIMER_TX_END: u64 = 1;
const TIMER_SWITCH_END: u64 = 2;
const TIMER_SLEEP_RETRY: u64 = 3;
const TIMER_SWITCH_RETRY: u64 = 4;
const TIMER_CCA_END: u64 = 5;
const TIMER_RX_END_BASE: u64 = 1 << 32;
const TIMER_HEADER_BASE: u64 = 2 << 32;
const RECEPTION_MASK: u64 = 0xffff_ffff;

/// The reception the PHY is synchronized on.
struct Reception {
    id: u64,
    signal: Arc<Signal>,
    frame: PhyFrame,
    source: EntityId,
    rx_power_dbm: f64,
    rx_end_event: EventId,
    header_event: Option<EventId>,
}

/// A Wi-Fi PHY: receiver state machine plus transmit path.
///
/// The PHY lives in the event loop and is responsible for:
/// 1. Registering every signal on its channel in the [`PowerTimeline`]
/// 2. Deciding whether to synchronize on, drop, or capture incoming frames
/// 3. Resolving each reception with one draw against its packet error rate
/// 4. Transmitting frames through the channel entity
/// 5. Channel switching, sleep and power control
/// 6. Reporting outcomes and state changes to its observer
pub struct Phy {
    id: EntityId,
    name: String,
    config: PhyConfig,
    channel_entity: EntityId,
    observer: Option<EntityId>,
    channel_number: u16,

    timeline: PowerTimeline,
    calculator: SnrPerCalculator,
    state: StateHelper,
    /// Last state reported to the observer.
    reported: PhyState,
    rng: ChaCha8Rng,
    driver: Option<Box<dyn PhyDriver>>,
    burst: BurstTracker,

    reception: Option<Reception>,
    next_reception_id: u64,
    current_tx: Option<PhyFrame>,

    tx_end_event: Option<EventId>,
    switch_end_event: Option<EventId>,
    cca_end_event: Option<EventId>,
    sleep_retry_event: Option<EventId>,
    switch_retry_event: Option<EventId>,
    deferred_sleep: bool,
    deferred_switch: Option<u16>,

    metric_labels: MetricLabels,
}

impl Phy {
    /// Create a PHY. `seed` is used unless the configuration carries its own.
    pub fn new(id: EntityId, name: impl Into<String>, config: PhyConfig, channel_entity: EntityId, seed: u64) -> Self {
        let name = name.into();
        let mut calculator = SnrPerCalculator::new(config.rx_noise_figure_db);
        calculator.set_error_rate_model(Arc::new(ReferenceErrorRateModel));
        let rng = ChaCha8Rng::seed_from_u64(config.seed.unwrap_or(seed));
        let metric_labels = MetricLabels::new(name.clone(), "station");
        Phy {
            id,
            name,
            channel_number: config.channel_number,
            config,
            channel_entity,
            observer: None,
            timeline: PowerTimeline::new(),
            calculator,
            state: StateHelper::default(),
            reported: PhyState::Idle,
            rng,
            driver: None,
            burst: BurstTracker::new(),
            reception: None,
            next_reception_id: 0,
            current_tx: None,
            tx_end_event: None,
            switch_end_event: None,
            cca_end_event: None,
            sleep_retry_event: None,
            switch_retry_event: None,
            deferred_sleep: false,
            deferred_switch: None,
            metric_labels,
        }
    }

    /// Send outcome and state notifications to `observer`.
    pub fn with_observer(mut self, observer: EntityId) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attach a driver. It immediately receives the PHY info.
    pub fn with_driver(mut self, mut driver: Box<dyn PhyDriver>) -> Self {
        driver.on_phy_info(&self.layer_info());
        self.driver = Some(driver);
        self
    }

    /// Replace the error-rate model.
    pub fn with_error_rate_model(mut self, model: Arc<dyn ErrorRateModel>) -> Self {
        self.calculator.set_error_rate_model(model);
        self
    }

    /// Replace the frame timing model.
    pub fn with_frame_timing(mut self, timing: Arc<dyn FrameTiming>) -> Self {
        self.calculator.set_frame_timing(timing);
        self
    }

    /// Replace the metric labels.
    pub fn with_metric_labels(mut self, labels: MetricLabels) -> Self {
        self.metric_labels = labels;
        self
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// State at `now`.
    pub fn state(&self, now: SimTime) -> PhyState {
        self.state.current(now)
    }

    /// Tuned channel.
    pub fn channel_number(&self) -> u16 {
        self.channel_number
    }

    /// Center frequency of the tuned channel in MHz.
    pub fn frequency_mhz(&self) -> u32 {
        self.config.frequency_mhz(self.channel_number)
    }

    /// Interference record.
    pub fn timeline(&self) -> &PowerTimeline {
        &self.timeline
    }

    /// Burst continuity tracker.
    pub fn burst(&self) -> &BurstTracker {
        &self.burst
    }

    /// Metric labels.
    pub fn metric_labels(&self) -> &MetricLabels {
        &self.metric_labels
    }

    /// Transmit power of `level` in dBm, before antenna gain.
    pub fn power_level_dbm(&self, level: u8) -> f64 {
        self.config.power_level_dbm(level)
    }

    /// Noise floor plus aggregate received power at `now`, in watts.
    pub fn measure_rss(&self, now: SimTime) -> f64 {
        let noise = self.calculator.noise_floor_w(self.config.channel_width_mhz);
        self.timeline.current_rss(now, noise)
    }

    /// Facts published to the driver.
    pub fn layer_info(&self) -> PhyLayerInfo {
        PhyLayerInfo {
            channel_number: self.channel_number,
            frequency_mhz: self.frequency_mhz(),
            min_tx_power_dbm: self.config.tx_power_start_dbm,
            max_tx_power_dbm: self.config.tx_power_end_dbm,
            tx_gain_db: self.config.tx_gain_db,
            rx_gain_db: self.config.rx_gain_db,
            channel_switch_delay: self.config.channel_switch_delay(),
        }
    }

    // ------------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------------

    /// A signal reached the antenna.
    pub fn receive_signal(&mut self, incoming: &IncomingSignalEvent, ctx: &mut SimContext) {
        let now = ctx.time();
        if incoming.channel_number != self.channel_number {
            trace!(node = %self.name, channel = incoming.channel_number, "signal on another channel");
            return;
        }

        let rx_power_dbm = incoming.rx_power_dbm + self.config.rx_gain_db;
        let signal = self
            .timeline
            .add(dbm_to_w(rx_power_dbm), now, incoming.duration, incoming.frame.format.clone());
        let labels = self.metric_labels.to_labels();
        metrics::gauge!(metric_defs::TIMELINE_ENTRIES.name, &labels).set(self.timeline.len() as f64);
        if incoming.duration.is_zero() {
            return;
        }

        let state = self.state.current(now);
        trace!(node = %self.name, frame = incoming.frame.id, rx_power_dbm, %state, "incoming signal");
        match state {
            PhyState::Off => self.drop_incoming(incoming, DropReason::Off, rx_power_dbm, ctx),
            PhyState::Sleep => self.drop_incoming(incoming, DropReason::Sleeping, rx_power_dbm, ctx),
            PhyState::Tx | PhyState::Switching => {
                self.drop_incoming(incoming, DropReason::NotIdle, rx_power_dbm, ctx);
                self.cca_after_busy(&signal, ctx);
            }
            PhyState::Rx => {
                if self.captures(&incoming.frame, rx_power_dbm, now) {
                    self.capture(incoming, signal, rx_power_dbm, ctx);
                } else {
                    self.drop_incoming(incoming, DropReason::NotIdle, rx_power_dbm, ctx);
                    self.cca_after_busy(&signal, ctx);
                }
            }
            PhyState::Idle | PhyState::CcaBusy => self.try_synchronize(incoming, signal, rx_power_dbm, ctx),
        }
        self.sync_state(ctx);
    }

    fn try_synchronize(
        &mut self,
        incoming: &IncomingSignalEvent,
        signal: Arc<Signal>,
        rx_power_dbm: f64,
        ctx: &mut SimContext,
    ) {
        let now = ctx.time();
        if rx_power_dbm < self.config.ed_threshold_dbm {
            self.drop_incoming(incoming, DropReason::BelowEdThreshold, rx_power_dbm, ctx);
            self.maybe_cca_busy(ctx);
            return;
        }
        if !self.config.supports(incoming.frame.format.preamble) {
            self.drop_incoming(incoming, DropReason::UndecodableFormat, rx_power_dbm, ctx);
            self.maybe_cca_busy(ctx);
            return;
        }

        let check = self.burst.observe(&incoming.frame);
        self.record_burst_check(check, incoming.frame.id);
        if !check.accepts() {
            self.drop_incoming(incoming, DropReason::BurstDesync, rx_power_dbm, ctx);
            self.maybe_cca_busy(ctx);
            return;
        }

        let measured = self.measure_rss(now);
        if let Some(driver) = self.driver.as_mut() {
            if !driver.admit_reception(&signal, measured) {
                self.drop_incoming(incoming, DropReason::DriverVeto, rx_power_dbm, ctx);
                self.maybe_cca_busy(ctx);
                return;
            }
        }

        self.start_reception(incoming, signal, rx_power_dbm, ctx);
    }

    fn start_reception(
        &mut self,
        incoming: &IncomingSignalEvent,
        signal: Arc<Signal>,
        rx_power_dbm: f64,
        ctx: &mut SimContext,
    ) {
        let now = ctx.time();
        let id = self.next_reception_id;
        self.next_reception_id = (self.next_reception_id + 1) & RECEPTION_MASK;

        self.timeline.notify_reception_start();
        self.state.switch_to_rx(now, signal.duration);
        let rx_end_event = ctx.post_event(
            signal.duration,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_RX_END_BASE + id,
            },
        );
        let header = self.calculator.frame_timing().header_duration(&signal.format);
        let header_event = (self.config.header_check && !header.is_zero() && header < signal.duration).then(|| {
            ctx.post_event(
                header,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_HEADER_BASE + id,
                },
            )
        });

        debug!(
            node = %self.name,
            frame = incoming.frame.id,
            signal = signal.id,
            rx_power_dbm,
            end = %signal.end(),
            "synchronized"
        );
        self.reception = Some(Reception {
            id,
            signal,
            frame: incoming.frame.clone(),
            source: incoming.source_phy,
            rx_power_dbm,
            rx_end_event,
            header_event,
        });
    }

    /// True if `frame` may take over the reception in progress.
    fn captures(&self, frame: &PhyFrame, rx_power_dbm: f64, now: SimTime) -> bool {
        let capture = &self.config.capture;
        let Some(current) = &self.reception else {
            return false;
        };
        capture.enabled
            && now <= self.state.rx_start() + SimTime::from_micros(capture.window_us)
            && rx_power_dbm >= self.config.ed_threshold_dbm
            && rx_power_dbm >= current.rx_power_dbm + capture.margin_db
            && frame.format.preamble.has_preamble()
            && self.config.supports(frame.format.preamble)
    }

    fn capture(&mut self, incoming: &IncomingSignalEvent, signal: Arc<Signal>, rx_power_dbm: f64, ctx: &mut SimContext) {
        debug!(node = %self.name, frame = incoming.frame.id, rx_power_dbm, "capturing stronger frame");
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::PHY_CAPTURE.name, &labels).increment(1);
        self.abort_reception(DropReason::Captured, ctx);
        let check = self.burst.observe(&incoming.frame);
        self.record_burst_check(check, incoming.frame.id);
        self.start_reception(incoming, signal, rx_power_dbm, ctx);
    }

    /// Abandon the reception in progress, cancelling its pending resolution.
    fn abort_reception(&mut self, reason: DropReason, ctx: &mut SimContext) {
        let Some(rx) = self.reception.take() else {
            return;
        };
        let now = ctx.time();
        ctx.cancel(rx.rx_end_event);
        if let Some(header_event) = rx.header_event {
            ctx.cancel(header_event);
        }
        self.timeline.notify_reception_end(now);
        self.state.switch_from_rx(now);
        self.post_drop(rx.source, rx.frame.id, reason, Some(rx.rx_power_dbm), ctx);
    }

    fn end_header(&mut self, reception_id: u64, ctx: &mut SimContext) {
        let Some(rx) = self.reception.as_mut().filter(|r| r.id == reception_id) else {
            trace!(node = %self.name, reception_id, "stale header timer");
            return;
        };
        rx.header_event = None;
        let header = self.calculator.calculate_header_snr_per(&self.timeline, &rx.signal);
        let draw: f64 = self.rng.gen();
        if draw > header.per {
            trace!(node = %self.name, per = header.per, "header decoded");
            return;
        }
        debug!(node = %self.name, per = header.per, "header failed");
        self.abort_reception(DropReason::HeaderFailure, ctx);
        self.maybe_cca_busy(ctx);
        self.sync_state(ctx);
    }

    fn end_reception(&mut self, reception_id: u64, ctx: &mut SimContext) {
        if self.reception.as_ref().map(|r| r.id) != Some(reception_id) {
            trace!(node = %self.name, reception_id, "stale reception timer");
            return;
        }
        let Some(rx) = self.reception.take() else {
            return;
        };
        let now = ctx.time();
        if let Some(header_event) = rx.header_event {
            ctx.cancel(header_event);
        }

        let result = self.calculator.calculate_snr_per(&self.timeline, &rx.signal);
        let subframe_per = self.subframe_pers(&rx);
        let draw: f64 = self.rng.gen();
        let success = draw > result.per;
        let subframe_ok: Vec<bool> = if subframe_per.is_empty() {
            vec![success]
        } else {
            subframe_per
                .iter()
                .map(|per| success && self.rng.gen::<f64>() > *per)
                .collect()
        };

        self.timeline.notify_reception_end(now);
        self.state.switch_from_rx(now);

        let snr_db = ratio_to_db(result.snr);
        let rss_dbm = w_to_dbm(result.packet_rss_w);
        let labels = self.metric_labels.to_labels();
        metrics::histogram!(metric_defs::PHY_RX_SNR.name, &labels).record(snr_db);
        metrics::histogram!(metric_defs::PHY_RX_RSS.name, &labels).record(rss_dbm);
        metrics::histogram!(metric_defs::PHY_PER.name, &labels).record(result.per);

        if success {
            debug!(node = %self.name, frame = rx.frame.id, snr_db, per = result.per, "reception ok");
            metrics::counter!(metric_defs::PHY_RX_OK.name, &labels).increment(1);
            self.notify_observer(
                ctx,
                EventPayload::PhyRxOk(RxOkEvent {
                    source_phy: rx.source,
                    frame_id: rx.frame.id,
                    snr_db,
                    per: result.per,
                    rss_dbm,
                    subframe_ok,
                    start_time: rx.signal.start,
                    end_time: now,
                }),
            );
        } else {
            self.post_drop(rx.source, rx.frame.id, DropReason::PayloadFailure, Some(rss_dbm), ctx);
        }

        if let Some(driver) = self.driver.as_mut() {
            driver.on_rx_end(&rx.signal, result.packet_rss_w, success);
        }
        self.maybe_cca_busy(ctx);
        self.sync_state(ctx);
    }

    /// Packet error rate of each packed unit, empty for single-unit frames.
    fn subframe_pers(&self, rx: &Reception) -> Vec<f64> {
        let lengths = &rx.frame.subframe_lengths;
        if lengths.len() < 2 {
            return Vec::new();
        }
        let timing = self.calculator.frame_timing();
        let payload = rx.signal.duration - timing.header_duration(&rx.signal.format);
        timing
            .subframe_windows(&rx.signal.format, lengths)
            .into_iter()
            .map(|(from, to)| {
                let window = (from.min(payload), to.min(payload));
                self.calculator
                    .calculate_payload_snr_per(&self.timeline, &rx.signal, Some(window))
                    .per
            })
            .collect()
    }

    fn record_burst_check(&self, check: BurstCheck, frame: FrameId) {
        let labels = self.metric_labels.to_labels();
        match check {
            BurstCheck::Clean => {}
            BurstCheck::Incomplete { expected } => {
                info!(node = %self.name, frame, expected, "burst interrupted by a new preamble");
                metrics::counter!(metric_defs::PHY_BURST_INCOMPLETE.name, &labels).increment(1);
            }
            BurstCheck::Gap { expected, declared } => {
                info!(node = %self.name, frame, expected, declared, "missed burst subframes, resynchronizing");
                metrics::counter!(metric_defs::PHY_BURST_RESYNC.name, &labels).increment(1);
            }
            BurstCheck::Mismatch { expected, declared } => {
                info!(node = %self.name, frame, expected, declared, "burst count mismatch, resynchronizing");
                metrics::counter!(metric_defs::PHY_BURST_RESYNC.name, &labels).increment(1);
            }
            BurstCheck::Desync => {
                debug!(node = %self.name, frame, "continuation subframe without a burst");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    /// Transmit `frame` at `power_level`.
    ///
    /// A reception in progress is aborted. Sleeping or powered-off PHYs report
    /// the frame as dropped. Transmitting or switching is a caller error.
    pub fn send(&mut self, frame: PhyFrame, power_level: u8, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let state = self.state.current(now);
        match state {
            PhyState::Off | PhyState::Sleep => {
                debug!(node = %self.name, frame = frame.id, %state, "transmission refused");
                let mut labels = self.metric_labels.to_labels();
                labels.push(("state", state.as_label().to_string()));
                metrics::counter!(metric_defs::PHY_TX_DROP.name, &labels).increment(1);
                self.notify_observer(ctx, EventPayload::PhyTxDrop { frame_id: frame.id, state });
                return Ok(());
            }
            PhyState::Tx | PhyState::Switching => {
                return Err(self.busy("transmit", state));
            }
            PhyState::Rx => {
                debug!(node = %self.name, "aborting reception to transmit");
                self.abort_reception(DropReason::Aborted, ctx);
            }
            PhyState::Idle | PhyState::CcaBusy => {}
        }

        let duration = self
            .calculator
            .frame_timing()
            .frame_duration(&frame.format, frame.payload_bytes);
        let tx_power_dbm = self.config.power_level_dbm(power_level) + self.config.tx_gain_db;
        self.state.switch_to_tx(now, duration);
        if let Some(driver) = self.driver.as_mut() {
            driver.on_tx_start(&frame, tx_power_dbm);
        }

        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::PHY_TX_FRAMES.name, &labels).increment(1);
        debug!(
            node = %self.name,
            frame = frame.id,
            tx_power_dbm,
            duration = %duration,
            jamming = frame.is_jamming(),
            "transmitting"
        );

        ctx.post_immediate(
            vec![self.channel_entity],
            EventPayload::TransmitAir(TransmitAirEvent {
                phy_id: self.id,
                frame: frame.clone(),
                tx_power_dbm,
                channel_number: self.channel_number,
                duration,
            }),
        );
        self.notify_observer(
            ctx,
            EventPayload::PhyTxStart {
                frame_id: frame.id,
                tx_power_dbm,
                duration,
            },
        );
        self.tx_end_event = Some(ctx.post_event(duration, vec![self.id], EventPayload::Timer { timer_id: TIMER_TX_END }));
        self.current_tx = Some(frame);
        self.sync_state(ctx);
        Ok(())
    }

    fn end_tx(&mut self, ctx: &mut SimContext) {
        self.tx_end_event = None;
        let Some(frame) = self.current_tx.take() else {
            return;
        };
        self.state.switch_from_tx(ctx.time());
        self.notify_observer(ctx, EventPayload::PhyTxEnd { frame_id: frame.id });
        if let Some(driver) = self.driver.as_mut() {
            driver.on_tx_end(&frame);
        }
        self.maybe_cca_busy(ctx);
        self.sync_state(ctx);
    }

    // ------------------------------------------------------------------------
    // Mode changes
    // ------------------------------------------------------------------------

    /// Apply a control request.
    pub fn control(&mut self, control: PhyControl, ctx: &mut SimContext) -> Result<(), SimError> {
        match control {
            PhyControl::SwitchChannel { channel } => self.switch_channel(channel, ctx)?,
            PhyControl::Sleep => self.sleep(ctx),
            PhyControl::Resume => self.resume(ctx),
            PhyControl::PowerOff => self.power_off(ctx),
            PhyControl::PowerOn => self.power_on(ctx),
        }
        Ok(())
    }

    /// Retune to `channel`.
    ///
    /// Deferred until the end of a transmission; aborts a reception. Ignored
    /// while sleeping. While off, only the channel number changes.
    pub fn switch_channel(&mut self, channel: u16, ctx: &mut SimContext) -> Result<(), SimError> {
        let now = ctx.time();
        let state = self.state.current(now);
        match state {
            PhyState::Switching => return Err(self.busy("switch channel", state)),
            PhyState::Tx => {
                let delay = self.state.delay_until_idle(now);
                debug!(node = %self.name, channel, delay = %delay, "deferring channel switch");
                self.deferred_switch = Some(channel);
                if let Some(old) = self.switch_retry_event.take() {
                    ctx.cancel(old);
                }
                self.switch_retry_event =
                    Some(ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_SWITCH_RETRY }));
                return Ok(());
            }
            PhyState::Sleep => {
                debug!(node = %self.name, channel, "channel switch ignored while sleeping");
                return Ok(());
            }
            PhyState::Off => {
                self.channel_number = channel;
                return Ok(());
            }
            PhyState::Rx => {
                debug!(node = %self.name, "aborting reception to switch channel");
                self.abort_reception(DropReason::Aborted, ctx);
            }
            PhyState::Idle | PhyState::CcaBusy => {}
        }

        let now = ctx.time();
        let previous = self.channel_number;
        let delay = self.config.channel_switch_delay();
        self.channel_number = channel;
        self.state.switch_to_switching(now, delay);
        self.timeline.erase();
        self.burst.reset();
        if let Some(event) = self.cca_end_event.take() {
            ctx.cancel(event);
        }
        self.switch_end_event = Some(ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_SWITCH_END }));

        let phy_info = self.layer_info();
        if let Some(driver) = self.driver.as_mut() {
            driver.on_phy_info(&phy_info);
        }
        info!(node = %self.name, from = previous, to = channel, frequency_mhz = phy_info.frequency_mhz, "switching channel");
        let labels = self.metric_labels.to_labels();
        metrics::counter!(metric_defs::PHY_CHANNEL_SWITCH.name, &labels).increment(1);
        self.sync_state(ctx);
        Ok(())
    }

    fn end_switching(&mut self, ctx: &mut SimContext) {
        self.switch_end_event = None;
        self.state.switch_from_switching(ctx.time());
        self.maybe_cca_busy(ctx);
        self.sync_state(ctx);
    }

    /// Enter sleep, or once the current TX/RX/switch completes.
    pub fn sleep(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        match self.state.current(now) {
            PhyState::Tx | PhyState::Rx | PhyState::Switching => {
                let delay = self.state.delay_until_idle(now);
                debug!(node = %self.name, delay = %delay, "deferring sleep");
                self.deferred_sleep = true;
                if let Some(old) = self.sleep_retry_event.take() {
                    ctx.cancel(old);
                }
                self.sleep_retry_event =
                    Some(ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_SLEEP_RETRY }));
            }
            PhyState::Idle | PhyState::CcaBusy => {
                self.deferred_sleep = false;
                self.state.switch_to_sleep(now);
                if let Some(event) = self.cca_end_event.take() {
                    ctx.cancel(event);
                }
                debug!(node = %self.name, "sleeping");
                self.sync_state(ctx);
            }
            PhyState::Sleep | PhyState::Off => {
                trace!(node = %self.name, "sleep request ignored");
            }
        }
    }

    /// Leave sleep. Cancels a deferred sleep that has not started yet.
    pub fn resume(&mut self, ctx: &mut SimContext) {
        match self.state.current(ctx.time()) {
            PhyState::Sleep => {
                self.state.switch_to_idle();
                debug!(node = %self.name, "resuming");
                self.maybe_cca_busy(ctx);
                self.sync_state(ctx);
            }
            _ => {
                if self.deferred_sleep {
                    self.deferred_sleep = false;
                    if let Some(event) = self.sleep_retry_event.take() {
                        ctx.cancel(event);
                    }
                    debug!(node = %self.name, "pending sleep cancelled");
                }
            }
        }
    }

    /// Power off: abort everything and forget the medium.
    pub fn power_off(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        if self.state.current(now) == PhyState::Off {
            return;
        }
        self.abort_reception(DropReason::Aborted, ctx);
        let pending = [
            self.tx_end_event.take(),
            self.switch_end_event.take(),
            self.cca_end_event.take(),
            self.sleep_retry_event.take(),
            self.switch_retry_event.take(),
        ];
        for event in pending.into_iter().flatten() {
            ctx.cancel(event);
        }
        if let Some(frame) = self.current_tx.take() {
            warn!(node = %self.name, frame = frame.id, "powered off while transmitting");
        }
        self.deferred_sleep = false;
        self.deferred_switch = None;
        self.timeline.erase();
        self.burst.reset();
        self.state.switch_to_off(now);
        info!(node = %self.name, "powered off");
        self.sync_state(ctx);
    }

    /// Power back on.
    pub fn power_on(&mut self, ctx: &mut SimContext) {
        if self.state.current(ctx.time()) != PhyState::Off {
            return;
        }
        self.state.switch_to_idle();
        info!(node = %self.name, "powered on");
        self.maybe_cca_busy(ctx);
        self.sync_state(ctx);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn handle_timer(&mut self, timer_id: u64, ctx: &mut SimContext) -> Result<(), SimError> {
        match timer_id {
            TIMER_TX_END => self.end_tx(ctx),
            TIMER_SWITCH_END => self.end_switching(ctx),
            TIMER_SLEEP_RETRY => {
                self.sleep_retry_event = None;
                if self.deferred_sleep {
                    self.sleep(ctx);
                }
            }
            TIMER_SWITCH_RETRY => {
                self.switch_retry_event = None;
                if let Some(channel) = self.deferred_switch.take() {
                    self.switch_channel(channel, ctx)?;
                }
            }
            TIMER_CCA_END => {
                self.cca_end_event = None;
                self.sync_state(ctx);
            }
            id if id >> 32 == TIMER_RX_END_BASE >> 32 => self.end_reception(id & RECEPTION_MASK, ctx),
            id if id >> 32 == TIMER_HEADER_BASE >> 32 => self.end_header(id & RECEPTION_MASK, ctx),
            other => warn!(node = %self.name, timer_id = other, "unknown timer"),
        }
        Ok(())
    }

    /// Report the medium busy for as long as energy stays above the CCA threshold.
    fn maybe_cca_busy(&mut self, ctx: &mut SimContext) {
        let now = ctx.time();
        let busy = self
            .timeline
            .energy_duration(dbm_to_w(self.config.cca_threshold_dbm), now);
        if busy.is_zero() {
            return;
        }
        let before = self.state.end_cca_busy();
        self.state.notify_cca_busy(now, busy);
        let end = self.state.end_cca_busy();
        if end > before {
            if let Some(event) = self.cca_end_event.take() {
                ctx.cancel(event);
            }
            self.cca_end_event = Some(ctx.post_event(end - now, vec![self.id], EventPayload::Timer { timer_id: TIMER_CCA_END }));
            let labels = self.metric_labels.to_labels();
            metrics::counter!(metric_defs::PHY_CCA_BUSY.name, &labels).increment(1);
        }
    }

    /// A signal arrived during TX, RX or switching: if it outlasts the busy
    /// period, the medium will still be busy afterwards.
    fn cca_after_busy(&mut self, signal: &Signal, ctx: &mut SimContext) {
        let now = ctx.time();
        if signal.end() > now + self.state.delay_until_idle(now) {
            self.maybe_cca_busy(ctx);
        }
    }

    /// Report a state change to the observer if the visible state moved.
    fn sync_state(&mut self, ctx: &mut SimContext) {
        let state = self.state.current(ctx.time());
        if state == self.reported {
            return;
        }
        let previous = std::mem::replace(&mut self.reported, state);
        trace!(node = %self.name, %previous, %state, "state change");
        self.notify_observer(ctx, EventPayload::PhyStateChanged(StateChangedEvent { previous, state }));
    }

    fn notify_observer(&self, ctx: &mut SimContext, payload: EventPayload) {
        if let Some(observer) = self.observer {
            ctx.post_immediate(vec![observer], payload);
        }
    }

    fn drop_incoming(&self, incoming: &IncomingSignalEvent, reason: DropReason, rx_power_dbm: f64, ctx: &mut SimContext) {
        self.post_drop(incoming.source_phy, incoming.frame.id, reason, Some(rx_power_dbm), ctx);
    }

    fn post_drop(&self, source: EntityId, frame_id: FrameId, reason: DropReason, rss_dbm: Option<f64>, ctx: &mut SimContext) {
        debug!(node = %self.name, frame = frame_id, reason = reason.as_label(), "frame dropped");
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.as_label().to_string()));
        metrics::counter!(metric_defs::PHY_RX_DROP.name, &labels).increment(1);
        self.notify_observer(
            ctx,
            EventPayload::PhyRxDrop(RxDropEvent {
                source_phy: source,
                frame_id,
                reason,
                rss_dbm,
            }),
        );
    }

    fn busy(&self, operation: &'static str, state: PhyState) -> SimError {
        SimError::HandlerError {
            entity: self.id,
            message: PhyError::Busy { operation, state }.to_string(),
        }
    }
}

impl Entity for Phy {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::IncomingSignal(incoming) => {
                self.receive_signal(incoming, ctx);
                Ok(())
            }
            EventPayload::PhyTxRequest(request) => self.send(request.frame.clone(), request.power_level, ctx),
            EventPayload::PhyControl(control) => self.control(*control, ctx),
            EventPayload::Timer { timer_id } => self.handle_timer(*timer_id, ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpsim_common::{FrameFormat, WifiMode};

    fn incoming(frame: PhyFrame, dbm: f64, duration_us: u64) -> IncomingSignalEvent {
        IncomingSignalEvent {
            source_phy: EntityId(9),
            frame,
            rx_power_dbm: dbm,
            channel_number: 1,
            duration: SimTime::from_micros(duration_us),
        }
    }

    #[test]
    fn test_synchronizes_from_idle() {
        let mut phy = Phy::new(EntityId(1), "sta", PhyConfig::default(), EntityId(2), 1);
        let mut ctx = SimContext::new();
        ctx.set_time(SimTime::from_micros(5));
        let frame = PhyFrame::new(7, FrameFormat::for_mode(WifiMode::OFDM_6), 100);
        phy.receive_signal(&incoming(frame, -60.0, 156), &mut ctx);
        assert_eq!(phy.state(ctx.time()), PhyState::Rx);
        assert!(phy.timeline().is_receiving());
        let pending = ctx.take_pending_events();
        assert!(pending
            .iter()
            .any(|e| matches!(e.payload, EventPayload::Timer { timer_id } if timer_id == TIMER_RX_END_BASE)));
    }

    #[test]
    fn test_other_channel_ignored() {
        let mut phy = Phy::new(EntityId(1), "sta", PhyConfig::default(), EntityId(2), 1);
        let mut ctx = SimContext::new();
        let frame = PhyFrame::new(7, FrameFormat::default(), 100);
        let mut event = incoming(frame, -60.0, 156);
        event.channel_number = 11;
        phy.receive_signal(&event, &mut ctx);
        assert_eq!(phy.state(ctx.time()), PhyState::Idle);
        assert!(phy.timeline().is_empty());
    }

    #[test]
    fn test_measure_rss_includes_noise() {
        let mut phy = Phy::new(EntityId(1), "sta", PhyConfig { rx_gain_db: 0.0, ..Default::default() }, EntityId(2), 1);
        let mut ctx = SimContext::new();
        let noise_only = phy.measure_rss(SimTime::ZERO);
        let frame = PhyFrame::new(1, FrameFormat::default(), 100);
        phy.receive_signal(&incoming(frame, -60.0, 156), &mut ctx);
        let with_signal = phy.measure_rss(SimTime::ZERO);
        assert!((with_signal - noise_only - dbm_to_w(-60.0)).abs() < 1e-15);
    }

    #[test]
    fn test_layer_info() {
        let phy = Phy::new(EntityId(1), "sta", PhyConfig::default(), EntityId(2), 1);
        let info = phy.layer_info();
        assert_eq!(info.frequency_mhz, 2412);
        assert_eq!(info.channel_switch_delay, SimTime::from_micros(250));
    }
}
