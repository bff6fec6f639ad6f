//! # wpsim-phy
//!
//! Wi-Fi receiver state machine for wpsim.
//!
//! This crate provides:
//! - The PHY entity ([`Phy`]): reception, capture, bursts, transmit path,
//!   channel switching, sleep and power control
//! - PHY configuration ([`PhyConfig`], [`CaptureConfig`])
//! - Upper-layer hooks ([`PhyDriver`])
//! - Aggregate continuity tracking ([`BurstTracker`])
//! - State bookkeeping ([`StateHelper`])

mod burst;
mod config;
mod driver;
mod phy;
mod state;

pub use burst::{BurstCheck, BurstTracker};
pub use config::{CaptureConfig, PhyConfig, PhyLayerInfo};
pub use driver::{PhyDriver, RssGateDriver};
pub use phy::Phy;
pub use state::StateHelper;

use thiserror::Error;
use wpsim_common::PhyState;

/// Errors raised by the PHY.
#[derive(Debug, Error)]
pub enum PhyError {
    /// The request cannot be served in the current state.
    #[error("cannot {operation} while {state}")]
    Busy {
        /// What was requested.
        operation: &'static str,
        /// State that refused it.
        state: PhyState,
    },

    /// A configuration value is out of range.
    #[error("Invalid PHY configuration: {0}")]
    InvalidConfig(String),
}
