//! # wpsim-metrics
//!
//! Metric names, descriptions and label sets used by the simulator.
//!
//! Entities record through the [`metrics`] facade:
//!
//! ```ignore
//! let labels = self.metric_labels.to_labels();
//! metrics::counter!(metric_defs::PHY_RX_OK.name, &labels).increment(1);
//! ```
//!
//! The runner installs a recorder that collects them.

pub use metrics;

use std::fmt;

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic count.
    Counter,
    /// Value that goes up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => f.write_str("counter"),
            MetricKind::Gauge => f.write_str("gauge"),
            MetricKind::Histogram => f.write_str("histogram"),
        }
    }
}

/// Unit of a metric's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Dimensionless count.
    Count,
    /// Decibels.
    Decibels,
    /// Decibels relative to one milliwatt.
    Dbm,
    /// Probability in [0, 1].
    Ratio,
    /// Microseconds.
    Microseconds,
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Metric name.
    pub name: &'static str,
    /// Metric kind.
    pub kind: MetricKind,
    /// Value unit.
    pub unit: MetricUnit,
    /// Human readable description.
    pub description: &'static str,
    /// Labels recorded on top of the node label.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit as printed in `wpsim metrics`.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::Count => "",
            MetricUnit::Decibels => "dB",
            MetricUnit::Dbm => "dBm",
            MetricUnit::Ratio => "ratio",
            MetricUnit::Microseconds => "us",
        }
    }
}

/// Metric definitions.
pub mod metric_defs {
    use super::{MetricDef, MetricKind, MetricUnit};

    /// Frames delivered.
    pub const PHY_RX_OK: MetricDef = MetricDef {
        name: "wpsim.phy.rx_ok",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Frames received successfully",
        labels: &[],
    };

    /// Frames dropped or failed.
    pub const PHY_RX_DROP: MetricDef = MetricDef {
        name: "wpsim.phy.rx_drop",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Frames dropped or failed, by reason",
        labels: &["reason"],
    };

    /// Frames transmitted.
    pub const PHY_TX_FRAMES: MetricDef = MetricDef {
        name: "wpsim.phy.tx_frames",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Frames put on the air",
        labels: &[],
    };

    /// Transmissions refused.
    pub const PHY_TX_DROP: MetricDef = MetricDef {
        name: "wpsim.phy.tx_drop",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Transmissions refused while sleeping or off",
        labels: &["state"],
    };

    /// Burst resynchronizations.
    pub const PHY_BURST_RESYNC: MetricDef = MetricDef {
        name: "wpsim.phy.burst_resync",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Burst counter gaps or mismatches recovered from",
        labels: &[],
    };

    /// Bursts replaced before completion.
    pub const PHY_BURST_INCOMPLETE: MetricDef = MetricDef {
        name: "wpsim.phy.burst_incomplete",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Bursts interrupted by a new preamble before their last subframe",
        labels: &[],
    };

    /// Receptions switched to a stronger frame.
    pub const PHY_CAPTURE: MetricDef = MetricDef {
        name: "wpsim.phy.capture",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Receptions abandoned for a stronger frame",
        labels: &[],
    };

    /// SNR of completed receptions.
    pub const PHY_RX_SNR: MetricDef = MetricDef {
        name: "wpsim.phy.rx_snr_db",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Decibels,
        description: "SNR of completed receptions",
        labels: &[],
    };

    /// RSS of completed receptions.
    pub const PHY_RX_RSS: MetricDef = MetricDef {
        name: "wpsim.phy.rx_rss_dbm",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Dbm,
        description: "Time-averaged received power of completed receptions",
        labels: &[],
    };

    /// PER of completed receptions.
    pub const PHY_PER: MetricDef = MetricDef {
        name: "wpsim.phy.per",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Ratio,
        description: "Packet error rate of completed receptions",
        labels: &[],
    };

    /// Energy-only busy periods.
    pub const PHY_CCA_BUSY: MetricDef = MetricDef {
        name: "wpsim.phy.cca_busy",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Times the medium was reported busy without a reception",
        labels: &[],
    };

    /// Channel switches.
    pub const PHY_CHANNEL_SWITCH: MetricDef = MetricDef {
        name: "wpsim.phy.channel_switch",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Completed channel switch requests",
        labels: &[],
    };

    /// Entries in a PHY's power timeline.
    pub const TIMELINE_ENTRIES: MetricDef = MetricDef {
        name: "wpsim.timeline.entries",
        kind: MetricKind::Gauge,
        unit: MetricUnit::Count,
        description: "Change points held by the power timeline after insertion",
        labels: &[],
    };

    /// Wall clock time spent per simulation step.
    pub const SIMULATION_STEP_TIME: MetricDef = MetricDef {
        name: "wpsim.simulation.step_time",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Microseconds,
        description: "Wall clock time spent dispatching one event",
        labels: &["event"],
    };

    /// Every metric recorded by the simulator.
    pub const ALL: &[MetricDef] = &[
        PHY_RX_OK,
        PHY_RX_DROP,
        PHY_TX_FRAMES,
        PHY_TX_DROP,
        PHY_BURST_RESYNC,
        PHY_BURST_INCOMPLETE,
        PHY_CAPTURE,
        PHY_RX_SNR,
        PHY_RX_RSS,
        PHY_PER,
        PHY_CCA_BUSY,
        PHY_CHANNEL_SWITCH,
        TIMELINE_ENTRIES,
        SIMULATION_STEP_TIME,
    ];
}

/// Labels attached to every metric recorded by one node.
#[derive(Debug, Clone, Default)]
pub struct MetricLabels {
    /// Node name.
    pub node: String,
    /// Node role (e.g. "station", "jammer").
    pub role: String,
    /// Custom grouping tags.
    pub groups: Vec<String>,
}

impl MetricLabels {
    /// Create labels for a node.
    pub fn new(node: impl Into<String>, role: &str) -> Self {
        MetricLabels {
            node: node.into(),
            role: role.to_string(),
            groups: Vec::new(),
        }
    }

    /// Attach grouping tags.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    /// Labels in the form the `metrics` macros accept.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("node", self.node.clone()), ("role", self.role.clone())];
        if !self.groups.is_empty() {
            labels.push(("groups", self.groups.join(",")));
        }
        labels
    }
}
