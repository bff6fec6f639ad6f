//! Frame format descriptors.
//!
//! These types describe what is on the air: the preamble family, the modulation
//! and coding of the payload, the channel width, guard interval and number of
//! spatial streams. They are shared between the transmitting PHY, the channel
//! and the receiving PHY's interference and error-rate calculations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a transmitted frame, unique per scenario.
pub type FrameId = u64;

// ============================================================================
// Preamble and Modulation
// ============================================================================

/// Preamble family of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preamble {
    /// DSSS long preamble (802.11b, 144 us).
    DsssLong,
    /// DSSS short preamble (802.11b, 72 us).
    DsssShort,
    /// Legacy OFDM (802.11a/g).
    Ofdm,
    /// HT mixed format (802.11n).
    HtMixed,
    /// HT greenfield (802.11n, no legacy fields).
    HtGreenfield,
    /// VHT (802.11ac).
    Vht,
    /// HE single user (802.11ax).
    HeSu,
    /// Continuation subframe of an aggregate, no leading preamble.
    None,
    /// Undecodable energy, e.g. a jamming transmission.
    Invalid,
}

impl Preamble {
    /// True for the 802.11b preambles.
    pub fn is_dsss(&self) -> bool {
        matches!(self, Preamble::DsssLong | Preamble::DsssShort)
    }

    /// True if the frame starts with a preamble the receiver can synchronize on.
    pub fn has_preamble(&self) -> bool {
        !matches!(self, Preamble::None | Preamble::Invalid)
    }
}

/// Modulation family of a [`WifiMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationClass {
    /// DSSS / CCK (802.11b).
    Dsss,
    /// Legacy OFDM (802.11a/g).
    Ofdm,
    /// High throughput (802.11n).
    Ht,
    /// Very high throughput (802.11ac).
    Vht,
    /// High efficiency (802.11ax).
    He,
}

/// Forward error correction code rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeRate {
    /// No convolutional coding (DSSS/CCK).
    Uncoded,
    /// Rate 1/2.
    Half,
    /// Rate 2/3.
    TwoThirds,
    /// Rate 3/4.
    ThreeQuarters,
    /// Rate 5/6.
    FiveSixths,
}

impl CodeRate {
    /// Code rate as a fraction.
    pub fn fraction(&self) -> f64 {
        match self {
            CodeRate::Uncoded => 1.0,
            CodeRate::Half => 0.5,
            CodeRate::TwoThirds => 2.0 / 3.0,
            CodeRate::ThreeQuarters => 0.75,
            CodeRate::FiveSixths => 5.0 / 6.0,
        }
    }
}

// (bits per subcarrier, code rate) per MCS index, shared by HT, VHT and HE.
const MCS_TABLE: [(u8, CodeRate); 12] = [
    (1, CodeRate::Half),
    (2, CodeRate::Half),
    (2, CodeRate::ThreeQuarters),
    (4, CodeRate::Half),
    (4, CodeRate::ThreeQuarters),
    (6, CodeRate::TwoThirds),
    (6, CodeRate::ThreeQuarters),
    (6, CodeRate::FiveSixths),
    (8, CodeRate::ThreeQuarters),
    (8, CodeRate::FiveSixths),
    (10, CodeRate::ThreeQuarters),
    (10, CodeRate::FiveSixths),
];

// Legacy OFDM rates 6, 9, 12, 18, 24, 36, 48, 54 Mb/s.
const OFDM_TABLE: [(u8, CodeRate); 8] = [
    (1, CodeRate::Half),
    (1, CodeRate::ThreeQuarters),
    (2, CodeRate::Half),
    (2, CodeRate::ThreeQuarters),
    (4, CodeRate::Half),
    (4, CodeRate::ThreeQuarters),
    (6, CodeRate::TwoThirds),
    (6, CodeRate::ThreeQuarters),
];

const OFDM_RATES_MBPS: [u8; 8] = [6, 9, 12, 18, 24, 36, 48, 54];

const DSSS_RATES_BPS: [f64; 4] = [1e6, 2e6, 5.5e6, 11e6];

/// A modulation and coding scheme.
///
/// `index` selects the rate within the class: DSSS 0..=3 (1, 2, 5.5, 11 Mb/s),
/// OFDM 0..=7 (6..54 Mb/s), HT 0..=7, VHT 0..=9, HE 0..=11 (per-stream MCS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WifiMode {
    class: ModulationClass,
    index: u8,
}

impl WifiMode {
    /// DSSS 1 Mb/s (DBPSK).
    pub const DSSS_1: WifiMode = WifiMode { class: ModulationClass::Dsss, index: 0 };
    /// DSSS 2 Mb/s (DQPSK).
    pub const DSSS_2: WifiMode = WifiMode { class: ModulationClass::Dsss, index: 1 };
    /// CCK 5.5 Mb/s.
    pub const CCK_5_5: WifiMode = WifiMode { class: ModulationClass::Dsss, index: 2 };
    /// CCK 11 Mb/s.
    pub const CCK_11: WifiMode = WifiMode { class: ModulationClass::Dsss, index: 3 };
    /// OFDM 6 Mb/s, the legacy header rate.
    pub const OFDM_6: WifiMode = WifiMode { class: ModulationClass::Ofdm, index: 0 };
    /// OFDM 54 Mb/s.
    pub const OFDM_54: WifiMode = WifiMode { class: ModulationClass::Ofdm, index: 7 };

    /// Modulation family.
    pub fn class(&self) -> ModulationClass {
        self.class
    }

    /// Rate index within the family.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// DSSS/CCK mode for a rate in Mb/s (1, 2, 5.5, 11).
    pub fn dsss(rate_mbps: f64) -> Option<WifiMode> {
        DSSS_RATES_BPS
            .iter()
            .position(|r| (*r - rate_mbps * 1e6).abs() < 1.0)
            .map(|i| WifiMode { class: ModulationClass::Dsss, index: i as u8 })
    }

    /// Legacy OFDM mode for a rate in Mb/s (6, 9, 12, 18, 24, 36, 48, 54).
    pub fn ofdm_legacy(rate_mbps: u8) -> Option<WifiMode> {
        OFDM_RATES_MBPS
            .iter()
            .position(|r| *r == rate_mbps)
            .map(|i| WifiMode { class: ModulationClass::Ofdm, index: i as u8 })
    }

    /// HT MCS 0..=7 (per stream).
    pub fn ht_mcs(mcs: u8) -> Option<WifiMode> {
        (mcs <= 7).then_some(WifiMode { class: ModulationClass::Ht, index: mcs })
    }

    /// VHT MCS 0..=9.
    pub fn vht_mcs(mcs: u8) -> Option<WifiMode> {
        (mcs <= 9).then_some(WifiMode { class: ModulationClass::Vht, index: mcs })
    }

    /// HE MCS 0..=11.
    pub fn he_mcs(mcs: u8) -> Option<WifiMode> {
        (mcs <= 11).then_some(WifiMode { class: ModulationClass::He, index: mcs })
    }

    /// Lowest rate of this mode's family. Used for HT-SIG, SIG-A and training fields.
    pub fn family_base(&self) -> WifiMode {
        WifiMode { class: self.class, index: 0 }
    }

    /// Bits carried per subcarrier (OFDM) or per symbol (DSSS).
    pub fn constellation_bits(&self) -> u8 {
        match self.class {
            ModulationClass::Dsss => [1, 2, 4, 8][self.index as usize],
            ModulationClass::Ofdm => OFDM_TABLE[self.index as usize].0,
            _ => MCS_TABLE[self.index as usize].0,
        }
    }

    /// Code rate of this mode.
    pub fn code_rate(&self) -> CodeRate {
        match self.class {
            ModulationClass::Dsss => CodeRate::Uncoded,
            ModulationClass::Ofdm => OFDM_TABLE[self.index as usize].1,
            _ => MCS_TABLE[self.index as usize].1,
        }
    }

    /// Number of data subcarriers for a channel width.
    pub fn data_subcarriers(&self, channel_width_mhz: u16) -> u32 {
        match self.class {
            ModulationClass::Dsss => 1,
            ModulationClass::Ofdm => 48,
            ModulationClass::Ht => {
                if channel_width_mhz >= 40 { 108 } else { 52 }
            }
            ModulationClass::Vht => match channel_width_mhz {
                0..=20 => 52,
                21..=40 => 108,
                41..=80 => 234,
                _ => 468,
            },
            ModulationClass::He => match channel_width_mhz {
                0..=20 => 234,
                21..=40 => 468,
                41..=80 => 980,
                _ => 1960,
            },
        }
    }

    /// OFDM symbol duration in nanoseconds, guard interval included.
    pub fn symbol_duration_ns(&self, guard_interval_ns: u16) -> u64 {
        match self.class {
            ModulationClass::Dsss => 1_000,
            ModulationClass::Ofdm => 4_000,
            ModulationClass::Ht | ModulationClass::Vht => 3_200 + guard_interval_ns as u64,
            ModulationClass::He => 12_800 + guard_interval_ns as u64,
        }
    }

    /// Data bits per OFDM symbol across all spatial streams.
    pub fn bits_per_symbol(&self, channel_width_mhz: u16, nss: u8) -> f64 {
        let streams = match self.class {
            ModulationClass::Dsss | ModulationClass::Ofdm => 1,
            _ => nss.max(1),
        };
        self.data_subcarriers(channel_width_mhz) as f64
            * self.constellation_bits() as f64
            * self.code_rate().fraction()
            * streams as f64
    }

    /// Data rate in bits per second.
    pub fn data_rate(&self, channel_width_mhz: u16, guard_interval_ns: u16, nss: u8) -> f64 {
        match self.class {
            ModulationClass::Dsss => DSSS_RATES_BPS[self.index as usize],
            _ => {
                let symbol_s = self.symbol_duration_ns(guard_interval_ns) as f64 * 1e-9;
                self.bits_per_symbol(channel_width_mhz, nss) / symbol_s
            }
        }
    }
}

impl fmt::Display for WifiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            ModulationClass::Dsss => match self.index {
                0 => f.write_str("dsss-1"),
                1 => f.write_str("dsss-2"),
                2 => f.write_str("cck-5.5"),
                _ => f.write_str("cck-11"),
            },
            ModulationClass::Ofdm => write!(f, "ofdm-{}", OFDM_RATES_MBPS[self.index as usize]),
            ModulationClass::Ht => write!(f, "ht-mcs{}", self.index),
            ModulationClass::Vht => write!(f, "vht-mcs{}", self.index),
            ModulationClass::He => write!(f, "he-mcs{}", self.index),
        }
    }
}

/// Error parsing a [`WifiMode`] name.
#[derive(Debug, Error)]
#[error("unknown wifi mode '{0}' (expected e.g. dsss-1, cck-11, ofdm-54, ht-mcs7, vht-mcs9, he-mcs11)")]
pub struct WifiModeParseError(pub String);

impl FromStr for WifiMode {
    type Err = WifiModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let err = || WifiModeParseError(s.to_string());
        let mode = match lower.as_str() {
            "dsss-1" => Some(WifiMode::DSSS_1),
            "dsss-2" => Some(WifiMode::DSSS_2),
            "cck-5.5" => Some(WifiMode::CCK_5_5),
            "cck-11" => Some(WifiMode::CCK_11),
            other => {
                if let Some(rate) = other.strip_prefix("ofdm-") {
                    rate.parse().ok().and_then(WifiMode::ofdm_legacy)
                } else if let Some(mcs) = other.strip_prefix("ht-mcs") {
                    mcs.parse().ok().and_then(WifiMode::ht_mcs)
                } else if let Some(mcs) = other.strip_prefix("vht-mcs") {
                    mcs.parse().ok().and_then(WifiMode::vht_mcs)
                } else if let Some(mcs) = other.strip_prefix("he-mcs") {
                    mcs.parse().ok().and_then(WifiMode::he_mcs)
                } else {
                    None
                }
            }
        };
        mode.ok_or_else(err)
    }
}

impl TryFrom<String> for WifiMode {
    type Error = WifiModeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WifiMode> for String {
    fn from(mode: WifiMode) -> Self {
        mode.to_string()
    }
}

// ============================================================================
// Frame Format
// ============================================================================

/// Everything a receiver needs to know about how a frame is modulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFormat {
    /// Preamble family.
    pub preamble: Preamble,
    /// Payload modulation and coding.
    pub mode: WifiMode,
    /// Channel width in MHz.
    pub channel_width_mhz: u16,
    /// Guard interval in nanoseconds.
    pub guard_interval_ns: u16,
    /// Number of spatial streams.
    pub nss: u8,
    /// Part of an aggregate.
    pub aggregation: bool,
}

impl FrameFormat {
    /// Build a format for a mode with the matching default preamble.
    pub fn for_mode(mode: WifiMode) -> Self {
        let preamble = match mode.class {
            ModulationClass::Dsss => Preamble::DsssLong,
            ModulationClass::Ofdm => Preamble::Ofdm,
            ModulationClass::Ht => Preamble::HtMixed,
            ModulationClass::Vht => Preamble::Vht,
            ModulationClass::He => Preamble::HeSu,
        };
        FrameFormat {
            preamble,
            mode,
            channel_width_mhz: if mode.class == ModulationClass::Dsss { 22 } else { 20 },
            guard_interval_ns: 800,
            nss: 1,
            aggregation: false,
        }
    }

    /// Replace the preamble.
    pub fn with_preamble(mut self, preamble: Preamble) -> Self {
        self.preamble = preamble;
        self
    }

    /// Replace the channel width.
    pub fn with_channel_width(mut self, channel_width_mhz: u16) -> Self {
        self.channel_width_mhz = channel_width_mhz;
        self
    }

    /// Replace the number of spatial streams.
    pub fn with_nss(mut self, nss: u8) -> Self {
        self.nss = nss.max(1);
        self
    }

    /// Mark as part of an aggregate.
    pub fn with_aggregation(mut self, aggregation: bool) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Payload data rate in bits per second.
    pub fn data_rate(&self) -> f64 {
        self.mode.data_rate(self.channel_width_mhz, self.guard_interval_ns, self.nss)
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        FrameFormat::for_mode(WifiMode::OFDM_6)
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Aggregate bookkeeping carried by each subframe of a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstTag {
    /// Number of subframes that follow this one.
    pub remaining: u16,
}

/// A frame as transmitted by a PHY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhyFrame {
    /// Frame identifier.
    pub id: FrameId,
    /// Modulation descriptor.
    pub format: FrameFormat,
    /// Payload size in bytes.
    pub payload_bytes: usize,
    /// Aggregate bookkeeping, when part of a burst.
    #[serde(default)]
    pub burst: Option<BurstTag>,
    /// Sizes of the units packed in the payload; empty means one unit.
    #[serde(default)]
    pub subframe_lengths: Vec<usize>,
}

impl PhyFrame {
    /// Create a plain frame.
    pub fn new(id: FrameId, format: FrameFormat, payload_bytes: usize) -> Self {
        PhyFrame {
            id,
            format,
            payload_bytes,
            burst: None,
            subframe_lengths: Vec::new(),
        }
    }

    /// Tag the frame as a burst subframe followed by `remaining` more.
    pub fn with_burst(mut self, remaining: u16) -> Self {
        self.burst = Some(BurstTag { remaining });
        self.format.aggregation = true;
        self
    }

    /// Pack several units into the payload.
    pub fn with_subframes(mut self, lengths: Vec<usize>) -> Self {
        self.payload_bytes = lengths.iter().sum();
        self.subframe_lengths = lengths;
        self
    }

    /// True for a jamming transmission.
    pub fn is_jamming(&self) -> bool {
        self.format.preamble == Preamble::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_rates() {
        for (rate, mode) in [(6u8, WifiMode::OFDM_6), (54, WifiMode::OFDM_54)] {
            let bps = mode.data_rate(20, 800, 1);
            assert!((bps - rate as f64 * 1e6).abs() < 1.0, "{} -> {}", mode, bps);
        }
        assert_eq!(WifiMode::CCK_5_5.data_rate(22, 800, 1), 5.5e6);
    }

    #[test]
    fn test_ht_vht_he_rates() {
        let ht7 = WifiMode::ht_mcs(7).unwrap();
        assert!((ht7.data_rate(20, 800, 1) - 65e6).abs() < 1.0);
        assert!((ht7.data_rate(20, 800, 2) - 130e6).abs() < 1.0);
        let vht9 = WifiMode::vht_mcs(9).unwrap();
        assert!((vht9.data_rate(80, 800, 1) - 390e6).abs() < 1.0);
        let he0 = WifiMode::he_mcs(0).unwrap();
        let expected = 234.0 * 0.5 / 13.6e-6;
        assert!((he0.data_rate(20, 800, 1) - expected).abs() < 1.0);
    }

    #[test]
    fn test_mode_parse_and_display() {
        for name in ["dsss-1", "cck-11", "ofdm-24", "ht-mcs3", "vht-mcs9", "he-mcs11"] {
            let mode: WifiMode = name.parse().unwrap();
            assert_eq!(mode.to_string(), name);
        }
        assert!("ht-mcs8".parse::<WifiMode>().is_err());
        assert!("ofdm-7".parse::<WifiMode>().is_err());
    }

    #[test]
    fn test_constructors_reject_out_of_range_index() {
        let constructors: [fn(u8) -> Option<WifiMode>; 3] = [WifiMode::ht_mcs, WifiMode::vht_mcs, WifiMode::he_mcs];
        for build in constructors {
            for mcs in 0..=u8::MAX {
                if let Some(mode) = build(mcs) {
                    assert_eq!(mode.index(), mcs);
                    assert!(mode.data_rate(20, 800, 1) > 0.0);
                    assert!(mode.constellation_bits() >= 1);
                }
            }
        }
        assert_eq!(WifiMode::ht_mcs(7).map(|m| m.class()), Some(ModulationClass::Ht));
        assert!(WifiMode::he_mcs(12).is_none());
        assert!(WifiMode::ofdm_legacy(55).is_none());
        assert!(WifiMode::dsss(3.0).is_none());
        assert!(serde_json::from_str::<WifiMode>("\"he-mcs12\"").is_err());
    }

    #[test]
    fn test_mode_serde_as_string() {
        let format = FrameFormat::for_mode(WifiMode::vht_mcs(5).unwrap());
        let json = serde_json::to_string(&format).unwrap();
        assert!(json.contains("\"vht-mcs5\""));
        let back: FrameFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, format);
    }

    #[test]
    fn test_burst_tag_marks_aggregation() {
        let frame = PhyFrame::new(1, FrameFormat::default(), 100).with_burst(3);
        assert!(frame.format.aggregation);
        assert_eq!(frame.burst, Some(BurstTag { remaining: 3 }));
        let packed = PhyFrame::new(2, FrameFormat::default(), 0).with_subframes(vec![100, 200]);
        assert_eq!(packed.payload_bytes, 300);
    }
}
