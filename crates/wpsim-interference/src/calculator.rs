//! SNR, packet error rate and received signal strength of a signal.

use crate::error_model::ErrorRateModel;
use crate::timeline::{PowerTimeline, Signal};
use crate::timing::{FrameTiming, SegmentKind, StandardFrameTiming};
use std::sync::Arc;
use tracing::trace;
use wpsim_common::{db_to_ratio, SimTime, WifiMode};

/// Boltzmann constant in J/K.
pub const BOLTZMANN: f64 = 1.3803e-23;

/// Reference noise temperature in kelvin.
pub const NOISE_TEMPERATURE_K: f64 = 290.0;

/// Outcome of scoring a signal against the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrPerResult {
    /// Linear SNR using the time-averaged interference.
    pub snr: f64,
    /// Packet error rate in `[0, 1]`.
    pub per: f64,
    /// Time-averaged received power including noise, in watts.
    pub packet_rss_w: f64,
}

/// One scored field of a signal, in absolute time.
struct Span {
    kind: SegmentKind,
    start: SimTime,
    end: SimTime,
    mode: WifiMode,
}

/// Scores signals against a [`PowerTimeline`].
///
/// The frame is split into fields by the [`FrameTiming`]; the timeline's change
/// points are intersected with the field boundaries and every resulting piece is
/// scored at its own SNR and field mode. Pieces are assumed to fail
/// independently, so the success probability is the product over pieces.
pub struct SnrPerCalculator {
    noise_figure: f64,
    error_model: Option<Arc<dyn ErrorRateModel>>,
    timing: Arc<dyn FrameTiming>,
}

impl SnrPerCalculator {
    /// Create a calculator for a receiver with the given noise figure.
    pub fn new(noise_figure_db: f64) -> Self {
        SnrPerCalculator {
            noise_figure: db_to_ratio(noise_figure_db),
            error_model: None,
            timing: Arc::new(StandardFrameTiming),
        }
    }

    /// Install the error-rate model. Required before any PER computation.
    pub fn set_error_rate_model(&mut self, model: Arc<dyn ErrorRateModel>) {
        self.error_model = Some(model);
    }

    /// Replace the frame timing model.
    pub fn set_frame_timing(&mut self, timing: Arc<dyn FrameTiming>) {
        self.timing = timing;
    }

    /// Frame timing model in use.
    pub fn frame_timing(&self) -> &Arc<dyn FrameTiming> {
        &self.timing
    }

    /// Thermal noise over a channel of `width_mhz`, scaled by the noise figure.
    pub fn noise_floor_w(&self, width_mhz: u16) -> f64 {
        BOLTZMANN * NOISE_TEMPERATURE_K * width_mhz as f64 * 1e6 * self.noise_figure
    }

    /// Linear SNR of `signal_w` against thermal noise plus `interference_w`.
    pub fn calculate_snr(&self, signal_w: f64, interference_w: f64, width_mhz: u16) -> f64 {
        signal_w / (self.noise_floor_w(width_mhz) + interference_w.max(0.0))
    }

    /// Interference seen by `signal`, averaged over its air time.
    pub fn interference_power(&self, timeline: &PowerTimeline, signal: &Signal) -> f64 {
        if signal.duration.is_zero() {
            return (timeline.current_power(signal.start) - signal.power_w).max(0.0);
        }
        let energy: f64 = pieces(timeline, signal.start, signal.end())
            .map(|(a, b, p)| (p - signal.power_w).max(0.0) * (b - a).as_nanos() as f64)
            .sum();
        energy / signal.duration.as_nanos() as f64
    }

    /// SNR and PER over the header fields and the payload.
    pub fn calculate_snr_per(&self, timeline: &PowerTimeline, signal: &Signal) -> SnrPerResult {
        let spans = self.spans(signal);
        let success = self.success_rate(timeline, signal, &spans, None);
        self.result(timeline, signal, success)
    }

    /// SNR and PER over the header fields only.
    pub fn calculate_header_snr_per(&self, timeline: &PowerTimeline, signal: &Signal) -> SnrPerResult {
        let spans: Vec<Span> = self
            .spans(signal)
            .into_iter()
            .filter(|s| s.kind.is_header())
            .collect();
        let success = self.success_rate(timeline, signal, &spans, None);
        self.result(timeline, signal, success)
    }

    /// SNR and PER over the payload, optionally restricted to `window`.
    ///
    /// The window is relative to the payload start.
    ///
    /// # Panics
    ///
    /// Panics if the window extends past the payload.
    pub fn calculate_payload_snr_per(
        &self,
        timeline: &PowerTimeline,
        signal: &Signal,
        window: Option<(SimTime, SimTime)>,
    ) -> SnrPerResult {
        let header = self.timing.header_duration(&signal.format);
        let payload_start = signal.start + header;
        let absolute = window.map(|(from, to)| {
            assert!(from <= to, "payload window starts after it ends: {from}..{to}");
            assert!(
                payload_start + to <= signal.end(),
                "payload window {from}..{to} exceeds the payload of signal {}",
                signal.id
            );
            (payload_start + from, payload_start + to)
        });
        let spans: Vec<Span> = self
            .spans(signal)
            .into_iter()
            .filter(|s| s.kind == SegmentKind::Payload)
            .collect();
        let success = self.success_rate(timeline, signal, &spans, absolute);
        self.result(timeline, signal, success)
    }

    /// Average of signal plus interference plus noise from the end of the
    /// preamble to the end of the signal.
    pub fn packet_rss(&self, timeline: &PowerTimeline, signal: &Signal) -> f64 {
        let noise = self.noise_floor_w(signal.format.channel_width_mhz);
        let from = (signal.start + self.timing.preamble_duration(&signal.format)).min(signal.end());
        let to = signal.end();
        if from >= to {
            return noise + timeline.current_power(signal.start).max(signal.power_w);
        }
        let energy: f64 = pieces(timeline, from, to)
            .map(|(a, b, p)| (p.max(signal.power_w) + noise) * (b - a).as_nanos() as f64)
            .sum();
        energy / (to - from).as_nanos() as f64
    }

    fn result(&self, timeline: &PowerTimeline, signal: &Signal, success: f64) -> SnrPerResult {
        let interference = self.interference_power(timeline, signal);
        let snr = self.calculate_snr(signal.power_w, interference, signal.format.channel_width_mhz);
        let per = (1.0 - success).clamp(0.0, 1.0);
        trace!(signal = signal.id, snr, per, "scored signal");
        SnrPerResult {
            snr,
            per,
            packet_rss_w: self.packet_rss(timeline, signal),
        }
    }

    /// Scored fields of `signal` laid out from its start.
    fn spans(&self, signal: &Signal) -> Vec<Span> {
        let header = self.timing.header_duration(&signal.format);
        let payload = signal.duration - header;
        let mut at = signal.start;
        let mut spans = Vec::new();
        for segment in self.timing.segments(&signal.format, payload) {
            let start = at;
            at += segment.duration;
            if let Some(mode) = segment.mode {
                spans.push(Span {
                    kind: segment.kind,
                    start,
                    end: at.min(signal.end()),
                    mode,
                });
            }
        }
        spans
    }

    fn success_rate(
        &self,
        timeline: &PowerTimeline,
        signal: &Signal,
        spans: &[Span],
        window: Option<(SimTime, SimTime)>,
    ) -> f64 {
        let model = self
            .error_model
            .as_ref()
            .expect("error rate model must be set before computing PER");
        let format = &signal.format;
        let (lo, hi) = window.unwrap_or((signal.start, signal.end()));

        let mut success = 1.0;
        for (a, b, power) in pieces(timeline, signal.start, signal.end()) {
            let interference = (power - signal.power_w).max(0.0);
            let snr = self.calculate_snr(signal.power_w, interference, format.channel_width_mhz);
            for span in spans {
                let from = a.max(span.start).max(lo);
                let to = b.min(span.end).min(hi);
                if from >= to {
                    continue;
                }
                let rate = if span.kind == SegmentKind::Payload {
                    format.data_rate() / format.nss.max(1) as f64
                } else {
                    span.mode.data_rate(20, 800, 1)
                };
                let nbits = (rate * (to - from).as_secs_f64()) as u64;
                success *= model.chunk_success_rate(&span.mode, format, snr, nbits);
            }
        }
        success
    }
}

/// Constant-power pieces `(from, to, power)` of the timeline over `[from, to)`.
fn pieces(timeline: &PowerTimeline, from: SimTime, to: SimTime) -> impl Iterator<Item = (SimTime, SimTime, f64)> {
    let changes = timeline.power_changes(from, to);
    let ends: Vec<SimTime> = changes.iter().skip(1).map(|(t, _)| *t).chain(std::iter::once(to)).collect();
    changes
        .into_iter()
        .zip(ends)
        .filter(|((a, _), b)| a < b)
        .map(|((a, p), b)| (a, b, p))
}
