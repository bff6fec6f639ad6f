//! Frame field durations and modes.
//!
//! A frame is a sequence of fields: preamble, signal field (L-SIG or PLCP
//! header), extended header A (HT-SIG, VHT-SIG-A, HE-SIG-A), training fields,
//! extended header B (VHT-SIG-B) and payload. Each field may be sent at a
//! different mode; the SNR/PER walk scores each field at its own mode.

use wpsim_common::{FrameFormat, ModulationClass, Preamble, SimTime, WifiMode};

/// Kind of frame field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Synchronization preamble, not scored.
    Preamble,
    /// L-SIG, PLCP header, or L-SIG + RL-SIG for HE.
    SignalField,
    /// HT-SIG, VHT-SIG-A or HE-SIG-A.
    HeaderA,
    /// STF and LTF training fields.
    Training,
    /// VHT-SIG-B.
    HeaderB,
    /// Data.
    Payload,
}

impl SegmentKind {
    /// True for the fields preceding the payload.
    pub fn is_header(&self) -> bool {
        !matches!(self, SegmentKind::Payload)
    }
}

/// One field of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Field kind.
    pub kind: SegmentKind,
    /// Field duration.
    pub duration: SimTime,
    /// Mode the field is scored at; `None` for unscored fields.
    pub mode: Option<WifiMode>,
}

/// Durations and modes of the fields of a frame.
pub trait FrameTiming: Send + Sync {
    /// Preamble duration.
    fn preamble_duration(&self, format: &FrameFormat) -> SimTime;
    /// Signal field duration.
    fn signal_field_duration(&self, format: &FrameFormat) -> SimTime;
    /// Extended header A duration.
    fn header_a_duration(&self, format: &FrameFormat) -> SimTime;
    /// Training fields duration.
    fn training_duration(&self, format: &FrameFormat) -> SimTime;
    /// Extended header B duration.
    fn header_b_duration(&self, format: &FrameFormat) -> SimTime;
    /// Payload duration for `payload_bytes` bytes.
    fn payload_duration(&self, format: &FrameFormat, payload_bytes: usize) -> SimTime;

    /// Mode of the signal field.
    fn signal_field_mode(&self, format: &FrameFormat) -> WifiMode;
    /// Mode of extended header A.
    fn header_a_mode(&self, format: &FrameFormat) -> WifiMode;
    /// Mode of the training fields and extended header B.
    fn training_mode(&self, format: &FrameFormat) -> WifiMode;

    /// Everything before the payload.
    fn header_duration(&self, format: &FrameFormat) -> SimTime {
        self.preamble_duration(format)
            + self.signal_field_duration(format)
            + self.header_a_duration(format)
            + self.training_duration(format)
            + self.header_b_duration(format)
    }

    /// Full air time.
    fn frame_duration(&self, format: &FrameFormat, payload_bytes: usize) -> SimTime {
        self.header_duration(format) + self.payload_duration(format, payload_bytes)
    }

    /// Non-empty fields in air order, the payload lasting `payload_duration`.
    fn segments(&self, format: &FrameFormat, payload_duration: SimTime) -> Vec<Segment> {
        let fields = [
            (SegmentKind::Preamble, self.preamble_duration(format), None),
            (
                SegmentKind::SignalField,
                self.signal_field_duration(format),
                Some(self.signal_field_mode(format)),
            ),
            (
                SegmentKind::HeaderA,
                self.header_a_duration(format),
                Some(self.header_a_mode(format)),
            ),
            (
                SegmentKind::Training,
                self.training_duration(format),
                Some(self.training_mode(format)),
            ),
            (
                SegmentKind::HeaderB,
                self.header_b_duration(format),
                Some(self.training_mode(format)),
            ),
            (SegmentKind::Payload, payload_duration, Some(format.mode)),
        ];
        fields
            .into_iter()
            .filter(|(_, duration, _)| !duration.is_zero())
            .map(|(kind, duration, mode)| Segment { kind, duration, mode })
            .collect()
    }

    /// Windows of each packed unit, relative to payload start.
    fn subframe_windows(&self, format: &FrameFormat, lengths: &[usize]) -> Vec<(SimTime, SimTime)> {
        let total: usize = lengths.iter().sum();
        let payload = self.payload_duration(format, total);
        let rate = format.data_rate();
        let at = |bytes: usize| {
            let ns = (bytes as f64 * 8.0 / rate * 1e9).round() as u64;
            SimTime::from_nanos(ns).min(payload)
        };
        let mut offset = 0;
        let mut windows = Vec::with_capacity(lengths.len());
        for (i, len) in lengths.iter().enumerate() {
            let from = at(offset);
            offset += len;
            let to = if i + 1 == lengths.len() { payload } else { at(offset) };
            windows.push((from, to));
        }
        windows
    }
}

/// IEEE 802.11 field durations for the DSSS, OFDM, HT, VHT and HE PHYs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFrameTiming;

/// HT/VHT/HE long training fields for 1..=8 spatial streams.
fn ltf_count(nss: u8) -> u64 {
    match nss {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        5 | 6 => 6,
        _ => 8,
    }
}

impl FrameTiming for StandardFrameTiming {
    fn preamble_duration(&self, format: &FrameFormat) -> SimTime {
        match format.preamble {
            Preamble::DsssLong => SimTime::from_micros(144),
            Preamble::DsssShort => SimTime::from_micros(72),
            Preamble::Ofdm
            | Preamble::HtMixed
            | Preamble::HtGreenfield
            | Preamble::Vht
            | Preamble::HeSu => SimTime::from_micros(16),
            Preamble::None | Preamble::Invalid => SimTime::ZERO,
        }
    }

    fn signal_field_duration(&self, format: &FrameFormat) -> SimTime {
        match format.preamble {
            Preamble::DsssLong => SimTime::from_micros(48),
            Preamble::DsssShort => SimTime::from_micros(24),
            Preamble::Ofdm | Preamble::HtMixed | Preamble::Vht => SimTime::from_micros(4),
            Preamble::HeSu => SimTime::from_micros(8),
            Preamble::HtGreenfield | Preamble::None | Preamble::Invalid => SimTime::ZERO,
        }
    }

    fn header_a_duration(&self, format: &FrameFormat) -> SimTime {
        match format.preamble {
            Preamble::HtMixed | Preamble::HtGreenfield | Preamble::Vht | Preamble::HeSu => {
                SimTime::from_micros(8)
            }
            _ => SimTime::ZERO,
        }
    }

    fn training_duration(&self, format: &FrameFormat) -> SimTime {
        let n = ltf_count(format.nss);
        match format.preamble {
            Preamble::HtMixed | Preamble::Vht => SimTime::from_micros(4 + 4 * n),
            Preamble::HtGreenfield => SimTime::from_micros(4 * n),
            Preamble::HeSu => SimTime::from_micros(4 + 8 * n),
            _ => SimTime::ZERO,
        }
    }

    fn header_b_duration(&self, format: &FrameFormat) -> SimTime {
        match format.preamble {
            Preamble::Vht => SimTime::from_micros(4),
            _ => SimTime::ZERO,
        }
    }

    fn payload_duration(&self, format: &FrameFormat, payload_bytes: usize) -> SimTime {
        let mode = format.mode;
        if mode.class() == ModulationClass::Dsss {
            let rate_mbps = format.data_rate() / 1e6;
            let us = (payload_bytes as f64 * 8.0 / rate_mbps).ceil() as u64;
            return SimTime::from_micros(us);
        }
        let nss = match mode.class() {
            ModulationClass::Ofdm => 1,
            _ => format.nss.max(1) as u64,
        };
        let bits = 16 + 8 * payload_bytes as u64 + 6 * nss;
        let per_symbol = mode.bits_per_symbol(format.channel_width_mhz, format.nss);
        let symbols = (bits as f64 / per_symbol).ceil() as u64;
        SimTime::from_nanos(symbols * mode.symbol_duration_ns(format.guard_interval_ns))
    }

    fn signal_field_mode(&self, format: &FrameFormat) -> WifiMode {
        match format.preamble {
            Preamble::DsssLong => WifiMode::DSSS_1,
            Preamble::DsssShort => WifiMode::DSSS_2,
            _ => WifiMode::OFDM_6,
        }
    }

    fn header_a_mode(&self, format: &FrameFormat) -> WifiMode {
        match format.preamble {
            Preamble::HtMixed | Preamble::HtGreenfield | Preamble::Vht => format.mode.family_base(),
            _ => WifiMode::OFDM_6,
        }
    }

    fn training_mode(&self, format: &FrameFormat) -> WifiMode {
        match format.mode.class() {
            ModulationClass::Dsss => WifiMode::DSSS_1,
            ModulationClass::Ofdm => WifiMode::OFDM_6,
            _ => format.mode.family_base(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_ofdm_frame() {
        let timing = StandardFrameTiming;
        let format = FrameFormat::for_mode(WifiMode::OFDM_6);
        assert_eq!(timing.header_duration(&format), SimTime::from_micros(20));
        // (16 + 8000 + 6) / 24 = 334.25 -> 335 symbols of 4 us
        assert_eq!(timing.payload_duration(&format, 1000), SimTime::from_micros(1340));
        let kinds: Vec<_> = timing
            .segments(&format, SimTime::from_micros(1340))
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![SegmentKind::Preamble, SegmentKind::SignalField, SegmentKind::Payload]);
    }

    #[test]
    fn test_dsss_frame() {
        let timing = StandardFrameTiming;
        let long = FrameFormat::for_mode(WifiMode::DSSS_1);
        assert_eq!(timing.header_duration(&long), SimTime::from_micros(192));
        let short = long.clone().with_preamble(Preamble::DsssShort);
        assert_eq!(timing.header_duration(&short), SimTime::from_micros(96));
        let cck = FrameFormat::for_mode(WifiMode::CCK_5_5);
        // 800 bits / 5.5 = 145.45 -> 146 us
        assert_eq!(timing.payload_duration(&cck, 100), SimTime::from_micros(146));
        assert_eq!(timing.signal_field_mode(&short), WifiMode::DSSS_2);
    }

    #[test]
    fn test_vht_header_fields() {
        let timing = StandardFrameTiming;
        let format = FrameFormat::for_mode(WifiMode::vht_mcs(4).unwrap()).with_nss(3);
        // L-STF/L-LTF 16, L-SIG 4, SIG-A 8, STF 4 + 4 LTFs, SIG-B 4
        assert_eq!(timing.header_duration(&format), SimTime::from_micros(16 + 4 + 8 + 20 + 4));
        let segments = timing.segments(&format, SimTime::from_micros(100));
        assert_eq!(segments.len(), 6);
        assert_eq!(segments[1].mode, Some(WifiMode::OFDM_6));
        assert_eq!(segments[2].mode, WifiMode::vht_mcs(0));
        assert_eq!(segments[5].mode, WifiMode::vht_mcs(4));
    }

    #[test]
    fn test_he_and_greenfield_fields() {
        let timing = StandardFrameTiming;
        let he = FrameFormat::for_mode(WifiMode::he_mcs(7).unwrap()).with_nss(2);
        assert_eq!(timing.signal_field_duration(&he), SimTime::from_micros(8));
        assert_eq!(timing.header_a_mode(&he), WifiMode::OFDM_6);
        assert_eq!(timing.training_duration(&he), SimTime::from_micros(4 + 16));
        let gf = FrameFormat::for_mode(WifiMode::ht_mcs(3).unwrap()).with_preamble(Preamble::HtGreenfield);
        assert_eq!(timing.signal_field_duration(&gf), SimTime::ZERO);
        assert_eq!(timing.header_duration(&gf), SimTime::from_micros(16 + 8 + 4));
    }

    #[test]
    fn test_continuation_subframe_is_payload_only() {
        let timing = StandardFrameTiming;
        let format = FrameFormat::for_mode(WifiMode::ht_mcs(7).unwrap()).with_preamble(Preamble::None);
        assert_eq!(timing.header_duration(&format), SimTime::ZERO);
        let segments = timing.segments(&format, SimTime::from_micros(40));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Payload);
    }

    #[test]
    fn test_subframe_windows_cover_payload() {
        let timing = StandardFrameTiming;
        let format = FrameFormat::for_mode(WifiMode::OFDM_54);
        let windows = timing.subframe_windows(&format, &[500, 500, 1000]);
        let payload = timing.payload_duration(&format, 2000);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].0, SimTime::ZERO);
        assert_eq!(windows[0].1, windows[1].0);
        assert_eq!(windows[2].1, payload);
        assert!(windows.iter().all(|(a, b)| a < b));
    }
}
