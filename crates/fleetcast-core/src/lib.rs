//! Shared configuration and error types for the fleetcast workspace.

pub mod config;
pub mod error;

pub use config::{ConnectionConfig, FleetcastConfig, GatewayConfig, HubConfig, PusherConfig};
pub use error::{FleetcastError, Result};
