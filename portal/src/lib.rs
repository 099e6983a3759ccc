//! SAI-Cam status portal.
//!
//! Browser-facing companion process of the edge agent: status JSON,
//! server-sent events, camera thumbnails, WiFi-AP toggling, update status
//! and the fleet control API. It never touches cameras itself; everything
//! camera-shaped is read from the agent's health socket or relayed over its
//! control socket.

pub mod agent_client;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod wifi;

pub use config::PortalConfig;
pub use error::{PortalError, Result};
