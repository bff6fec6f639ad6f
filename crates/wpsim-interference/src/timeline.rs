//! Aggregate received power over time.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;
use wpsim_common::{FrameFormat, SimTime};

/// A signal present on the medium at one receiver.
///
/// Shared between the timeline boundaries it created and the reception that
/// synchronized on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Identifier, unique within one timeline.
    pub id: u64,
    /// Arrival time.
    pub start: SimTime,
    /// Air time.
    pub duration: SimTime,
    /// Received power in watts.
    pub power_w: f64,
    /// How the frame is modulated.
    pub format: FrameFormat,
}

impl Signal {
    /// End of the signal (exclusive).
    pub fn end(&self) -> SimTime {
        self.start + self.duration
    }

    /// True if the signal occupies the medium at `t`.
    pub fn is_active_at(&self, t: SimTime) -> bool {
        self.start <= t && t < self.end()
    }
}

#[derive(Debug, Clone, Default)]
struct TimelineEntry {
    /// Aggregate power valid from this timestamp until the next entry.
    power_w: f64,
    /// Signals starting or ending here.
    signals: Vec<Arc<Signal>>,
}

/// Ordered record of aggregate received power.
///
/// Each entry holds the sum of the powers of all signals whose `[start, end)`
/// interval contains the entry's timestamp. A sentinel entry at time zero with
/// zero power always exists.
///
/// While no reception is in progress, [`PowerTimeline::add`] prunes entries
/// older than the new signal's start. History before that point is not retained:
/// queries there answer zero.
#[derive(Debug)]
pub struct PowerTimeline {
    entries: BTreeMap<SimTime, TimelineEntry>,
    signals: BTreeMap<u64, Arc<Signal>>,
    receiving: bool,
    last_start: SimTime,
    next_signal_id: u64,
}

impl Default for PowerTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerTimeline {
    /// Create a timeline holding only the sentinel.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(SimTime::ZERO, TimelineEntry::default());
        PowerTimeline {
            entries,
            signals: BTreeMap::new(),
            receiving: false,
            last_start: SimTime::ZERO,
            next_signal_id: 0,
        }
    }

    /// Register a signal of `power_w` watts occupying `[start, start + duration)`.
    ///
    /// # Panics
    ///
    /// Panics if the power is negative or not finite, or if `start` is earlier
    /// than the start of a previously added signal.
    pub fn add(&mut self, power_w: f64, start: SimTime, duration: SimTime, format: FrameFormat) -> Arc<Signal> {
        assert!(
            power_w.is_finite() && power_w >= 0.0,
            "signal power must be finite and non-negative, got {power_w}"
        );
        assert!(
            start >= self.last_start,
            "signal start {start} precedes previous start {}",
            self.last_start
        );
        self.last_start = start;

        let signal = Arc::new(Signal {
            id: self.next_signal_id,
            start,
            duration,
            power_w,
            format,
        });
        self.next_signal_id += 1;

        if duration.is_zero() {
            return signal;
        }

        if !self.receiving {
            self.prune(start);
        }

        let end = signal.end();
        self.insert_boundary(start);
        self.insert_boundary(end);
        for (_, entry) in self.entries.range_mut(start..end) {
            entry.power_w += power_w;
        }
        if let Some(entry) = self.entries.get_mut(&start) {
            entry.signals.push(signal.clone());
        }
        if let Some(entry) = self.entries.get_mut(&end) {
            entry.signals.push(signal.clone());
        }
        self.signals.insert(signal.id, signal.clone());
        signal
    }

    /// Aggregate power at the latest entry at or before `now`.
    pub fn current_power(&self, now: SimTime) -> f64 {
        self.entries
            .range(..=now)
            .next_back()
            .map(|(_, e)| e.power_w)
            .unwrap_or(0.0)
    }

    /// Noise floor plus the aggregate power at `now`.
    pub fn current_rss(&self, now: SimTime, noise_floor_w: f64) -> f64 {
        noise_floor_w + self.current_power(now)
    }

    /// How long, from `now`, the aggregate power stays at or above `threshold_w`.
    ///
    /// Returns zero if it is already below.
    pub fn energy_duration(&self, threshold_w: f64, now: SimTime) -> SimTime {
        let first = self
            .entries
            .range(..=now)
            .next_back()
            .map(|(t, _)| *t)
            .unwrap_or(SimTime::ZERO);
        let mut end = first;
        for (t, entry) in self.entries.range(first..) {
            end = *t;
            if entry.power_w < threshold_w {
                break;
            }
        }
        if end > now {
            end - now
        } else {
            SimTime::ZERO
        }
    }

    /// Reset to the sentinel, forgetting every signal.
    pub fn erase(&mut self) {
        self.entries.clear();
        self.entries.insert(SimTime::ZERO, TimelineEntry::default());
        self.signals.clear();
        self.receiving = false;
    }

    /// A reception started: keep history until it ends.
    pub fn notify_reception_start(&mut self) {
        self.receiving = true;
    }

    /// A reception ended at `now`: allow pruning again and rebuild the sums.
    pub fn notify_reception_end(&mut self, now: SimTime) {
        self.receiving = false;
        trace!(now = %now, signals = self.signals.len(), "reception ended, rebuilding sums");
        self.recompute();
    }

    /// Rebuild every entry's aggregate from the live signals.
    pub fn recompute(&mut self) {
        self.recompute_from(SimTime::ZERO);
    }

    /// True while a reception holds history.
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Piecewise-constant power over `[from, to)`.
    ///
    /// The first element is `from` with the power valid there; each following
    /// element is a change point strictly inside the window.
    pub fn power_changes(&self, from: SimTime, to: SimTime) -> Vec<(SimTime, f64)> {
        let mut changes = vec![(from, self.current_power(from))];
        if to > from {
            let inner = self
                .entries
                .range(from..to)
                .filter(|(t, _)| **t > from)
                .map(|(t, e)| (*t, e.power_w));
            changes.extend(inner);
        }
        changes
    }

    /// Number of entries, sentinel included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if only the sentinel remains.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Number of signals still referenced by the timeline.
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    fn insert_boundary(&mut self, t: SimTime) {
        if self.entries.contains_key(&t) {
            return;
        }
        let power_w = self
            .entries
            .range(..t)
            .next_back()
            .map(|(_, e)| e.power_w)
            .unwrap_or(0.0);
        self.entries.insert(t, TimelineEntry { power_w, signals: Vec::new() });
    }

    /// Drop entries older than the latest one at or before `at`, and the
    /// signals that ended by then. The sentinel stays.
    fn prune(&mut self, at: SimTime) {
        let Some(cut) = self.entries.range(..=at).next_back().map(|(t, _)| *t) else {
            return;
        };
        if cut.is_zero() {
            return;
        }
        let stale: Vec<SimTime> = self
            .entries
            .range(..cut)
            .map(|(t, _)| *t)
            .filter(|t| !t.is_zero())
            .collect();
        if stale.is_empty() {
            return;
        }
        trace!(cut = %cut, entries = stale.len(), "pruning timeline");
        for t in stale {
            self.entries.remove(&t);
        }
        self.signals.retain(|_, s| s.end() > cut);
        if let Some(sentinel) = self.entries.get_mut(&SimTime::ZERO) {
            sentinel.power_w = 0.0;
            sentinel.signals.clear();
        }
        self.recompute_from(cut);
    }

    fn recompute_from(&mut self, from: SimTime) {
        let signals = &self.signals;
        for (t, entry) in self.entries.range_mut(from..) {
            let sum: f64 = signals
                .values()
                .filter(|s| s.is_active_at(*t))
                .map(|s| s.power_w)
                .sum();
            entry.power_w = sum.max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn us(v: u64) -> SimTime {
        SimTime::from_micros(v)
    }

    fn add(tl: &mut PowerTimeline, p: f64, start: u64, dur: u64) -> Arc<Signal> {
        tl.add(p, us(start), us(dur), FrameFormat::default())
    }

    #[test]
    fn test_overlapping_signals_sum() {
        let mut tl = PowerTimeline::new();
        tl.notify_reception_start();
        add(&mut tl, 1e-9, 10, 100);
        add(&mut tl, 2e-9, 50, 100);
        assert_eq!(tl.current_power(us(5)), 0.0);
        assert!((tl.current_power(us(10)) - 1e-9).abs() < 1e-21);
        assert!((tl.current_power(us(60)) - 3e-9).abs() < 1e-21);
        assert!((tl.current_power(us(110)) - 2e-9).abs() < 1e-21);
        assert_eq!(tl.current_power(us(150)), 0.0);
    }

    #[test]
    fn test_random_sequences_match_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..20 {
            let mut tl = PowerTimeline::new();
            tl.notify_reception_start();
            let mut placed = Vec::new();
            let mut start = 0u64;
            for _ in 0..30 {
                start += rng.gen_range(0..40);
                let dur = rng.gen_range(0..120);
                let p = rng.gen_range(0.0..1e-9);
                add(&mut tl, p, start, dur);
                placed.push((p, start, start + dur));
            }
            for t in 0..(start + 150) {
                let expected: f64 = placed
                    .iter()
                    .filter(|(_, s, e)| *s <= t && t < *e)
                    .map(|(p, _, _)| p)
                    .sum();
                assert!((tl.current_power(us(t)) - expected).abs() < 1e-18, "t={t}");
            }
        }
    }

    #[test]
    fn test_zero_duration_ignored() {
        let mut tl = PowerTimeline::new();
        add(&mut tl, 1e-9, 10, 0);
        assert_eq!(tl.len(), 1);
        assert_eq!(tl.current_power(us(10)), 0.0);
    }

    #[test]
    #[should_panic(expected = "non-negative")]
    fn test_negative_power_panics() {
        let mut tl = PowerTimeline::new();
        add(&mut tl, -1.0, 0, 10);
    }

    #[test]
    #[should_panic(expected = "precedes")]
    fn test_time_going_backwards_panics() {
        let mut tl = PowerTimeline::new();
        add(&mut tl, 1e-9, 20, 10);
        add(&mut tl, 1e-9, 10, 10);
    }

    #[test]
    fn test_energy_duration() {
        let mut tl = PowerTimeline::new();
        add(&mut tl, 1e-13, 0, 10_000);
        assert_eq!(tl.energy_duration(5e-14, us(0)), SimTime::from_millis(10));
        assert_eq!(tl.energy_duration(5e-14, us(4_000)), SimTime::from_millis(6));
        assert_eq!(tl.energy_duration(5e-14, us(10_000)), SimTime::ZERO);
        assert_eq!(tl.energy_duration(2e-13, us(0)), SimTime::ZERO);
    }

    #[test]
    fn test_erase_returns_to_baseline() {
        let mut tl = PowerTimeline::new();
        tl.notify_reception_start();
        add(&mut tl, 1e-9, 0, 100);
        add(&mut tl, 1e-9, 20, 100);
        tl.erase();
        assert_eq!(tl.current_power(us(50)), 0.0);
        assert_eq!(tl.len(), 1);
        assert!(!tl.is_receiving());
    }

    #[test]
    fn test_prunes_when_not_receiving() {
        let mut tl = PowerTimeline::new();
        for i in 0..100 {
            add(&mut tl, 1e-9, i * 100, 50);
        }
        // sentinel, plus the boundaries of the last couple of signals
        assert!(tl.len() <= 4, "len = {}", tl.len());
        assert!(tl.signal_count() <= 2);
        assert!((tl.current_power(us(9_910)) - 1e-9).abs() < 1e-21);
    }

    #[test]
    fn test_keeps_history_while_receiving() {
        let mut tl = PowerTimeline::new();
        tl.notify_reception_start();
        for i in 0..10 {
            add(&mut tl, 1e-9, i * 100, 50);
        }
        // the first signal starts on the sentinel
        assert_eq!(tl.len(), 20);
        assert!((tl.current_power(us(10)) - 1e-9).abs() < 1e-21);
    }

    #[test]
    fn test_reception_end_rebuilds_sums() {
        let mut tl = PowerTimeline::new();
        add(&mut tl, 2e-9, 0, 1_000);
        tl.notify_reception_start();
        add(&mut tl, 1e-9, 100, 200);
        tl.notify_reception_end(us(300));
        assert!(!tl.is_receiving());
        assert!((tl.current_power(us(200)) - 3e-9).abs() < 1e-21);
        assert!((tl.current_power(us(300)) - 2e-9).abs() < 1e-21);
        assert_eq!(tl.current_power(us(1_000)), 0.0);
    }

    #[test]
    fn test_power_changes_window() {
        let mut tl = PowerTimeline::new();
        tl.notify_reception_start();
        add(&mut tl, 1e-9, 0, 100);
        add(&mut tl, 1e-9, 40, 20);
        let changes = tl.power_changes(us(10), us(100));
        let times: Vec<u64> = changes.iter().map(|(t, _)| t.as_micros()).collect();
        assert_eq!(times, vec![10, 40, 60]);
        assert!((changes[1].1 - 2e-9).abs() < 1e-21);
    }

    #[test]
    fn test_current_rss_adds_noise() {
        let mut tl = PowerTimeline::new();
        add(&mut tl, 1e-9, 0, 100);
        assert!((tl.current_rss(us(10), 1e-12) - (1e-9 + 1e-12)).abs() < 1e-21);
    }
}
