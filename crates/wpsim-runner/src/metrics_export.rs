//! In-memory metrics recorder and JSON export.
//!
//! [`InMemoryRecorder`] implements [`metrics::Recorder`]. Install it before
//! the run, then take a [`MetricsSnapshot`] and write it with [`export_json`].
//! Every series is folded into the totals by metric name, and series carrying
//! a `node` label are folded into that node's view as well.

use metrics::{Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Counter, gauge and histogram values by metric name.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricValues {
    /// Counters.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Gauges.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    /// Histogram summaries.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Everything recorded so far.
#[derive(Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Values over every label set.
    #[serde(flatten)]
    pub totals: MetricValues,
    /// Values of the series labelled with each node.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, MetricValues>,
}

impl MetricsSnapshot {
    fn node(&mut self, node: &str) -> &mut MetricValues {
        self.nodes.entry(node.to_string()).or_default()
    }
}

/// Summary statistics of a histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Number of samples.
    pub count: u64,
    /// Sum of samples.
    pub sum: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Mean of samples.
    pub mean: f64,
    /// Median.
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

/// Write a snapshot as pretty JSON followed by a newline.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

// ============================================================================
// Histograms
// ============================================================================

/// Samples kept per histogram for percentiles; count, sum, min and max stay exact.
const RESERVOIR_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Samples {
    kept: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for Samples {
    fn default() -> Self {
        Samples {
            kept: Vec::new(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Samples {
    fn absorb(&mut self, other: &Samples) {
        self.kept.extend_from_slice(&other.kept);
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn summary(&self) -> HistogramSummary {
        if self.count == 0 || self.kept.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted = self.kept.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let last = sorted.len() - 1;
        let quantile = |q: f64| sorted[((q * last as f64).round() as usize).min(last)];
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.sum / self.count as f64,
            p50: quantile(0.50),
            p90: quantile(0.90),
            p99: quantile(0.99),
        }
    }
}

/// A histogram series: exact totals plus a uniform reservoir (Algorithm R).
#[derive(Debug)]
struct Reservoir {
    samples: Samples,
    lcg: u64,
}

#[derive(Debug)]
struct HistogramState(RwLock<Reservoir>);

impl Default for HistogramState {
    fn default() -> Self {
        HistogramState(RwLock::new(Reservoir {
            samples: Samples::default(),
            lcg: 0x853c_49e6_748f_ea9b,
        }))
    }
}

impl HistogramState {
    fn samples(&self) -> Samples {
        self.0.read().samples.clone()
    }
}

impl HistogramFn for HistogramState {
    fn record(&self, value: f64) {
        let mut reservoir = self.0.write();
        let Reservoir { samples, lcg } = &mut *reservoir;
        samples.count += 1;
        samples.sum += value;
        samples.min = samples.min.min(value);
        samples.max = samples.max.max(value);
        if samples.kept.len() < RESERVOIR_CAPACITY {
            samples.kept.push(value);
            return;
        }
        *lcg = lcg.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        let slot = ((*lcg >> 11) % samples.count) as usize;
        if slot < RESERVOIR_CAPACITY {
            samples.kept[slot] = value;
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// A registered series: metric name, the node it belongs to, and its labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    node: Option<String>,
    labels: Vec<(String, String)>,
}

impl From<&Key> for SeriesKey {
    fn from(key: &Key) -> Self {
        let labels: Vec<(String, String)> = key
            .labels()
            .map(|label| (label.key().to_string(), label.value().to_string()))
            .collect();
        let node = labels.iter().find(|(k, _)| k == "node").map(|(_, v)| v.clone());
        SeriesKey {
            name: key.name().to_string(),
            node,
            labels,
        }
    }
}

type SeriesMap<T> = RwLock<BTreeMap<SeriesKey, Arc<T>>>;

fn series<T: Default>(map: &SeriesMap<T>, key: &Key) -> Arc<T> {
    let series = SeriesKey::from(key);
    if let Some(existing) = map.read().get(&series) {
        return existing.clone();
    }
    map.write().entry(series).or_default().clone()
}

#[derive(Debug, Default)]
struct Series {
    counters: SeriesMap<AtomicU64>,
    /// Gauge values are stored as `f64` bits.
    gauges: SeriesMap<AtomicU64>,
    histograms: SeriesMap<HistogramState>,
}

impl Series {
    fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();

        for (series, counter) in self.counters.read().iter() {
            let value = counter.load(Ordering::Relaxed);
            *snapshot.totals.counters.entry(series.name.clone()).or_default() += value;
            if let Some(node) = &series.node {
                *snapshot.node(node).counters.entry(series.name.clone()).or_default() += value;
            }
        }

        for (series, gauge) in self.gauges.read().iter() {
            let value = f64::from_bits(gauge.load(Ordering::Relaxed));
            *snapshot.totals.gauges.entry(series.name.clone()).or_default() += value;
            if let Some(node) = &series.node {
                *snapshot.node(node).gauges.entry(series.name.clone()).or_default() += value;
            }
        }

        let mut merged: BTreeMap<(Option<String>, String), Samples> = BTreeMap::new();
        for (series, histogram) in self.histograms.read().iter() {
            let samples = histogram.samples();
            merged.entry((None, series.name.clone())).or_default().absorb(&samples);
            if let Some(node) = &series.node {
                merged
                    .entry((Some(node.clone()), series.name.clone()))
                    .or_default()
                    .absorb(&samples);
            }
        }
        for ((node, name), samples) in merged {
            if samples.count == 0 {
                continue;
            }
            let values = match node {
                Some(node) => snapshot.node(&node),
                None => &mut snapshot.totals,
            };
            values.histograms.insert(name, samples.summary());
        }

        snapshot
    }
}

/// Metrics recorder that keeps everything in memory.
///
/// Cloning shares the underlying storage, so a clone can be installed as the
/// global recorder while the original is kept for snapshots.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    series: Arc<Series>,
}

impl InMemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.series.snapshot()
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(series(&self.series.counters, key))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(series(&self.series.gauges, key))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(series(&self.series.histograms, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Label;

    fn meta() -> Metadata<'static> {
        Metadata::new("wpsim", metrics::Level::INFO, None)
    }

    fn node_key(name: &'static str, node: &str, reason: Option<&str>) -> Key {
        let mut labels = vec![Label::new("node", node.to_string()), Label::new("role", "station")];
        if let Some(reason) = reason {
            labels.push(Label::new("reason", reason.to_string()));
        }
        Key::from_parts(name, labels)
    }

    #[test]
    fn test_counters_fold_into_totals_and_nodes() {
        let recorder = InMemoryRecorder::new();
        recorder
            .register_counter(&node_key("wpsim.phy.rx_drop", "a", Some("captured")), &meta())
            .increment(2);
        recorder
            .register_counter(&node_key("wpsim.phy.rx_drop", "b", Some("captured")), &meta())
            .increment(3);
        recorder
            .register_counter(&node_key("wpsim.phy.rx_drop", "b", Some("not_idle")), &meta())
            .increment(1);
        recorder
            .register_counter(&Key::from_static_name("wpsim.phy.rx_ok"), &meta())
            .increment(4);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.totals.counters["wpsim.phy.rx_drop"], 6);
        assert_eq!(snapshot.totals.counters["wpsim.phy.rx_ok"], 4);
        assert_eq!(snapshot.nodes["a"].counters["wpsim.phy.rx_drop"], 2);
        assert_eq!(snapshot.nodes["b"].counters["wpsim.phy.rx_drop"], 4);
        assert!(!snapshot.nodes["b"].counters.contains_key("wpsim.phy.rx_ok"));
    }

    #[test]
    fn test_same_key_shares_state() {
        let recorder = InMemoryRecorder::new();
        let key = node_key("wpsim.phy.tx_frames", "ap", None);
        recorder.register_counter(&key, &meta()).increment(1);
        recorder.register_counter(&key, &meta()).increment(1);
        recorder.register_counter(&key, &meta()).absolute(1);
        assert_eq!(recorder.snapshot().nodes["ap"].counters["wpsim.phy.tx_frames"], 2);
    }

    #[test]
    fn test_gauge_operations() {
        let recorder = InMemoryRecorder::new();
        let gauge = recorder.register_gauge(&node_key("wpsim.timeline.entries", "sta", None), &meta());
        gauge.set(10.0);
        gauge.increment(5.0);
        gauge.decrement(3.0);
        let snapshot = recorder.snapshot();
        assert!((snapshot.totals.gauges["wpsim.timeline.entries"] - 12.0).abs() < f64::EPSILON);
        assert!((snapshot.nodes["sta"].gauges["wpsim.timeline.entries"] - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_summary() {
        let state = HistogramState::default();
        for i in 1..=100 {
            state.record(i as f64);
        }
        let summary = state.samples().summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert!((summary.mean - 50.5).abs() < 1e-12);
        assert!((summary.p50 - 50.0).abs() < 2.0);
        assert!((summary.p99 - 99.0).abs() < 2.0);
    }

    #[test]
    fn test_histogram_reservoir_is_bounded() {
        let state = HistogramState::default();
        for i in 0..(RESERVOIR_CAPACITY * 2) {
            state.record(i as f64);
        }
        let samples = state.samples();
        assert_eq!(samples.kept.len(), RESERVOIR_CAPACITY);
        let summary = samples.summary();
        assert_eq!(summary.count, (RESERVOIR_CAPACITY * 2) as u64);
        assert_eq!(summary.max, (RESERVOIR_CAPACITY * 2 - 1) as f64);
    }

    #[test]
    fn test_node_histograms_merge_into_totals() {
        let recorder = InMemoryRecorder::new();
        recorder
            .register_histogram(&node_key("wpsim.phy.rx_snr_db", "near", None), &meta())
            .record(30.0);
        recorder
            .register_histogram(&node_key("wpsim.phy.rx_snr_db", "far", None), &meta())
            .record(10.0);

        let snapshot = recorder.snapshot();
        let total = &snapshot.totals.histograms["wpsim.phy.rx_snr_db"];
        assert_eq!(total.count, 2);
        assert_eq!(total.min, 10.0);
        assert_eq!(total.max, 30.0);
        assert!((total.mean - 20.0).abs() < 1e-12);
        assert_eq!(snapshot.nodes["far"].histograms["wpsim.phy.rx_snr_db"].count, 1);
    }

    #[test]
    fn test_export_json() {
        let recorder = InMemoryRecorder::new();
        recorder
            .register_histogram(&node_key("wpsim.phy.rx_snr_db", "sta", None), &meta())
            .record(25.0);

        let mut output = Vec::new();
        export_json(&recorder.snapshot(), &mut output).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value["histograms"]["wpsim.phy.rx_snr_db"]["count"], 1);
        assert_eq!(value["nodes"]["sta"]["histograms"]["wpsim.phy.rx_snr_db"]["mean"], 25.0);
    }
}
