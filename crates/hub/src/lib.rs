//! Hub controller: consumer of the forward-progress deferral interface
//!
//! The hub resolves the interface from an [`provider::InterfaceRegistry`]
//! when it is wired up, negotiates the highest revision both sides support,
//! and defers its request processing accordingly.

pub mod config;
pub mod controller;
pub mod device;

pub use config::{HubConfig, HubSettings};
pub use controller::{DeferralMode, HubController};
pub use device::HubDevice;
