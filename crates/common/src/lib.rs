//! Common utilities for the forward-progress workspace
//!
//! This crate provides shared functionality between the provider and the hub
//! controller: the common error type, logging setup, deferral metrics and
//! test utilities.

pub mod error;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{DeferralMetrics, DeferralStats, LatencyStats};
