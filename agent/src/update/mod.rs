//! Self-update: persistent state record and the periodic controller.

pub mod controller;
pub mod state;

pub use controller::{UpdateController, UpdaterOptions};
pub use state::{version_newer, UpdateState, UpdateStatus};
