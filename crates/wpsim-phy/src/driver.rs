//! Driver collaborator hooks.

use crate::config::PhyLayerInfo;
use wpsim_common::{dbm_to_w, PhyFrame};
use wpsim_interference::Signal;

/// Upper-layer hooks called by the PHY.
///
/// Every method has a default, so a driver only overrides what it needs. A PHY
/// without a driver behaves as if every hook were the default.
pub trait PhyDriver: Send {
    /// Decide whether to synchronize on `signal`. `measured_rss_w` is the
    /// noise floor plus the aggregate power at arrival.
    fn admit_reception(&mut self, _signal: &Signal, _measured_rss_w: f64) -> bool {
        true
    }

    /// A transmission started.
    fn on_tx_start(&mut self, _frame: &PhyFrame, _tx_power_dbm: f64) {}

    /// A transmission finished.
    fn on_tx_end(&mut self, _frame: &PhyFrame) {}

    /// A reception was resolved.
    fn on_rx_end(&mut self, _signal: &Signal, _rss_w: f64, _success: bool) {}

    /// PHY parameters changed (construction, channel switch).
    fn on_phy_info(&mut self, _info: &PhyLayerInfo) {}
}

/// Admits receptions only when the measured RSS reaches a threshold.
#[derive(Debug, Clone)]
pub struct RssGateDriver {
    threshold_w: f64,
    admitted: u64,
    vetoed: u64,
    info: Option<PhyLayerInfo>,
}

impl RssGateDriver {
    /// Gate at `threshold_dbm`.
    pub fn new(threshold_dbm: f64) -> Self {
        RssGateDriver {
            threshold_w: dbm_to_w(threshold_dbm),
            admitted: 0,
            vetoed: 0,
            info: None,
        }
    }

    /// Receptions admitted so far.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Receptions refused so far.
    pub fn vetoed(&self) -> u64 {
        self.vetoed
    }

    /// Last published PHY info.
    pub fn info(&self) -> Option<&PhyLayerInfo> {
        self.info.as_ref()
    }
}

impl PhyDriver for RssGateDriver {
    fn admit_reception(&mut self, _signal: &Signal, measured_rss_w: f64) -> bool {
        if measured_rss_w >= self.threshold_w {
            self.admitted += 1;
            true
        } else {
            self.vetoed += 1;
            false
        }
    }

    fn on_phy_info(&mut self, info: &PhyLayerInfo) {
        self.info = Some(info.clone());
    }
}
