//! PHY configuration.

use serde::{Deserialize, Serialize};
use wpsim_common::{Preamble, SimTime};

use crate::PhyError;

/// Capture effect settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Allow switching to a stronger frame while receiving.
    pub enabled: bool,
    /// How long after the current reception's start a stronger frame may take over.
    pub window_us: u64,
    /// How much stronger the new frame must be, in dB.
    pub margin_db: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            enabled: false,
            window_us: 20,
            margin_db: 6.0,
        }
    }
}

/// Receiver and transmitter parameters of one PHY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhyConfig {
    /// Minimum received power to attempt synchronization, in dBm.
    pub ed_threshold_dbm: f64,
    /// Aggregate power above which the medium is reported busy, in dBm.
    pub cca_threshold_dbm: f64,
    /// Transmit antenna gain in dB.
    pub tx_gain_db: f64,
    /// Receive antenna gain in dB.
    pub rx_gain_db: f64,
    /// Receiver noise figure in dB.
    pub rx_noise_figure_db: f64,
    /// Power of the lowest transmit level, in dBm.
    pub tx_power_start_dbm: f64,
    /// Power of the highest transmit level, in dBm.
    pub tx_power_end_dbm: f64,
    /// Number of transmit power levels.
    pub tx_power_levels: u8,
    /// Time spent retuning, in microseconds.
    pub channel_switch_delay_us: u64,
    /// Initial channel number.
    pub channel_number: u16,
    /// Frequency of channel zero, in MHz.
    pub channel_starting_frequency_mhz: u32,
    /// Receiver bandwidth, in MHz.
    pub channel_width_mhz: u16,
    /// Capture effect.
    pub capture: CaptureConfig,
    /// Score the header fields before the payload and drop early on failure.
    pub header_check: bool,
    /// Seed of this PHY's random source; derived from the scenario seed when unset.
    pub seed: Option<u64>,
    /// Preambles this PHY can decode.
    pub supported_preambles: Vec<Preamble>,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            ed_threshold_dbm: -140.0,
            cca_threshold_dbm: -140.0,
            tx_gain_db: 1.0,
            rx_gain_db: 1.0,
            rx_noise_figure_db: 7.0,
            tx_power_start_dbm: 16.0206,
            tx_power_end_dbm: 16.0206,
            tx_power_levels: 1,
            channel_switch_delay_us: 250,
            channel_number: 1,
            channel_starting_frequency_mhz: 2407,
            channel_width_mhz: 20,
            capture: CaptureConfig::default(),
            header_check: false,
            seed: None,
            supported_preambles: vec![
                Preamble::DsssLong,
                Preamble::DsssShort,
                Preamble::Ofdm,
                Preamble::HtMixed,
                Preamble::HtGreenfield,
                Preamble::Vht,
                Preamble::HeSu,
                Preamble::None,
            ],
        }
    }
}

impl PhyConfig {
    /// Center frequency of `channel_number` in MHz.
    pub fn frequency_mhz(&self, channel_number: u16) -> u32 {
        self.channel_starting_frequency_mhz + 5 * channel_number as u32
    }

    /// Transmit power of `level` in dBm, before antenna gain.
    ///
    /// Levels are evenly spaced between the start and end power; levels past
    /// the last one use the end power.
    pub fn power_level_dbm(&self, level: u8) -> f64 {
        if self.tx_power_levels <= 1 {
            return self.tx_power_start_dbm;
        }
        let level = level.min(self.tx_power_levels - 1);
        self.tx_power_start_dbm
            + level as f64 * (self.tx_power_end_dbm - self.tx_power_start_dbm) / (self.tx_power_levels - 1) as f64
    }

    /// Retuning time.
    pub fn channel_switch_delay(&self) -> SimTime {
        SimTime::from_micros(self.channel_switch_delay_us)
    }

    /// True if frames with this preamble can be decoded.
    pub fn supports(&self, preamble: Preamble) -> bool {
        preamble != Preamble::Invalid && self.supported_preambles.contains(&preamble)
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<(), PhyError> {
        if self.tx_power_levels == 0 {
            return Err(PhyError::InvalidConfig("tx_power_levels must be at least 1".into()));
        }
        if self.tx_power_end_dbm < self.tx_power_start_dbm {
            return Err(PhyError::InvalidConfig(format!(
                "tx_power_end_dbm ({}) is below tx_power_start_dbm ({})",
                self.tx_power_end_dbm, self.tx_power_start_dbm
            )));
        }
        if self.channel_width_mhz == 0 {
            return Err(PhyError::InvalidConfig("channel_width_mhz must be positive".into()));
        }
        if !self.capture.margin_db.is_finite() || self.capture.margin_db < 0.0 {
            return Err(PhyError::InvalidConfig("capture.margin_db must be non-negative".into()));
        }
        Ok(())
    }
}

/// Static facts about a PHY, published to its driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhyLayerInfo {
    /// Tuned channel.
    pub channel_number: u16,
    /// Center frequency in MHz.
    pub frequency_mhz: u32,
    /// Lowest transmit power in dBm.
    pub min_tx_power_dbm: f64,
    /// Highest transmit power in dBm.
    pub max_tx_power_dbm: f64,
    /// Transmit antenna gain in dB.
    pub tx_gain_db: f64,
    /// Receive antenna gain in dB.
    pub rx_gain_db: f64,
    /// Retuning time.
    pub channel_switch_delay: SimTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PhyConfig::default();
        assert_eq!(config.frequency_mhz(1), 2412);
        assert_eq!(config.frequency_mhz(6), 2437);
        assert_eq!(config.channel_switch_delay(), SimTime::from_micros(250));
        assert!(config.supports(Preamble::None));
        assert!(!config.supports(Preamble::Invalid));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_power_levels() {
        let config = PhyConfig {
            tx_power_start_dbm: 10.0,
            tx_power_end_dbm: 20.0,
            tx_power_levels: 5,
            ..Default::default()
        };
        assert_eq!(config.power_level_dbm(0), 10.0);
        assert_eq!(config.power_level_dbm(2), 15.0);
        assert_eq!(config.power_level_dbm(4), 20.0);
        assert_eq!(config.power_level_dbm(9), 20.0);
        assert_eq!(PhyConfig::default().power_level_dbm(3), 16.0206);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: PhyConfig = serde_yaml::from_str("ed_threshold_dbm: -82\ncapture:\n  enabled: true\n").unwrap();
        assert_eq!(config.ed_threshold_dbm, -82.0);
        assert!(config.capture.enabled);
        assert_eq!(config.capture.margin_db, 6.0);
        assert_eq!(config.channel_number, 1);
    }

    #[test]
    fn test_validate_rejects_bad_levels() {
        let config = PhyConfig {
            tx_power_levels: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
