//! Chunk error-rate models.

use wpsim_common::{CodeRate, FrameFormat, ModulationClass, WifiMode};

/// Probability that a chunk of bits sent at a mode decodes without error.
pub trait ErrorRateModel: Send + Sync {
    /// Success probability of `nbits` bits at linear `snr`.
    ///
    /// Must be in `[0, 1]`, non-decreasing in `snr` and non-increasing in `nbits`.
    fn chunk_success_rate(&self, mode: &WifiMode, format: &FrameFormat, snr: f64, nbits: u64) -> f64;
}

/// Complementary error function, Abramowitz and Stegun 7.1.26.
pub fn erfc(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let result = poly * (-x * x).exp();
    if x >= 0.0 {
        result
    } else {
        2.0 - result
    }
}

/// Uncoded bit error rates per constellation with a fixed coding gain per code rate.
///
/// OFDM families use the Gray-coded M-QAM bit error rate on the per-subcarrier
/// SNR. DSSS/CCK convert SNR to Eb/N0 through the spreading gain of the
/// 11 Mchip/s chip rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceErrorRateModel;

const CHIP_RATE: f64 = 11e6;

impl ReferenceErrorRateModel {
    /// Coding gain in dB applied to the SNR before the uncoded BER.
    pub fn coding_gain_db(code_rate: CodeRate) -> f64 {
        match code_rate {
            CodeRate::Uncoded => 0.0,
            CodeRate::Half => 5.0,
            CodeRate::TwoThirds => 4.0,
            CodeRate::ThreeQuarters => 3.5,
            CodeRate::FiveSixths => 3.0,
        }
    }

    /// Bit error rate of `mode` at linear `snr`.
    pub fn bit_error_rate(&self, mode: &WifiMode, format: &FrameFormat, snr: f64) -> f64 {
        let snr = snr.max(0.0);
        let ber = match mode.class() {
            ModulationClass::Dsss => {
                let rate = mode.data_rate(format.channel_width_mhz, format.guard_interval_ns, 1);
                let ebno = snr * CHIP_RATE / rate;
                if mode.index() == 0 {
                    // DBPSK
                    0.5 * (-ebno).exp()
                } else {
                    0.5 * erfc(ebno.sqrt())
                }
            }
            _ => {
                let gain = 10f64.powf(Self::coding_gain_db(mode.code_rate()) / 10.0);
                qam_ber(mode.constellation_bits(), snr * gain)
            }
        };
        ber.clamp(0.0, 0.5)
    }
}

/// Gray-coded M-QAM bit error rate for `bits` bits per symbol.
fn qam_ber(bits: u8, snr: f64) -> f64 {
    match bits {
        1 => 0.5 * erfc(snr.sqrt()),
        2 => 0.5 * erfc((snr / 2.0).sqrt()),
        _ => {
            let m = 2f64.powi(bits as i32);
            let k = bits as f64;
            (2.0 / k) * (1.0 - 1.0 / m.sqrt()) * erfc((1.5 * snr / (m - 1.0)).sqrt())
        }
    }
}

impl ErrorRateModel for ReferenceErrorRateModel {
    fn chunk_success_rate(&self, mode: &WifiMode, format: &FrameFormat, snr: f64, nbits: u64) -> f64 {
        if nbits == 0 {
            return 1.0;
        }
        let ber = self.bit_error_rate(mode, format, snr);
        (nbits as f64 * (-ber).ln_1p()).exp().clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erfc_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-6);
        assert!((erfc(1.0) - 0.157299).abs() < 1e-6);
        assert!((erfc(-1.0) - 1.842701).abs() < 1e-6);
        assert!(erfc(6.0) < 1e-15);
    }

    #[test]
    fn test_success_monotone_in_snr() {
        let model = ReferenceErrorRateModel;
        for name in ["dsss-1", "cck-11", "ofdm-6", "ofdm-54", "ht-mcs7", "vht-mcs9", "he-mcs11"] {
            let mode: WifiMode = name.parse().unwrap();
            let format = FrameFormat::for_mode(mode);
            let mut last = 0.0;
            for db in -10..40 {
                let snr = 10f64.powf(db as f64 / 10.0);
                let p = model.chunk_success_rate(&mode, &format, snr, 8000);
                assert!((0.0..=1.0).contains(&p));
                assert!(p + 1e-12 >= last, "{name} at {db} dB: {p} < {last}");
                last = p;
            }
            assert!(last > 0.99, "{name} never converges: {last}");
        }
    }

    #[test]
    fn test_success_decreases_with_bits() {
        let model = ReferenceErrorRateModel;
        let mode = WifiMode::OFDM_54;
        let format = FrameFormat::for_mode(mode);
        let short = model.chunk_success_rate(&mode, &format, 100.0, 100);
        let long = model.chunk_success_rate(&mode, &format, 100.0, 10_000);
        assert!(long <= short);
        assert_eq!(model.chunk_success_rate(&mode, &format, 0.0, 0), 1.0);
    }
}
