//! # wpsim-interference
//!
//! Interference accounting and reception quality for wpsim receivers.
//!
//! This crate provides:
//! - [`PowerTimeline`]: aggregate received power over time, built from [`Signal`]s
//! - [`FrameTiming`]: durations and modes of the fields that make up a frame
//! - [`ErrorRateModel`]: chunk success probability for a mode at a given SNR
//! - [`SnrPerCalculator`]: SNR, packet error rate and time-averaged RSS of a signal
//!
//! All times are explicit [`SimTime`](wpsim_common::SimTime) parameters; nothing in
//! this crate reads a global clock.

mod calculator;
mod error_model;
mod timeline;
mod timing;

pub use calculator::{SnrPerCalculator, SnrPerResult, BOLTZMANN, NOISE_TEMPERATURE_K};
pub use error_model::{erfc, ErrorRateModel, ReferenceErrorRateModel};
pub use timeline::{PowerTimeline, Signal};
pub use timing::{FrameTiming, Segment, SegmentKind, StandardFrameTiming};
