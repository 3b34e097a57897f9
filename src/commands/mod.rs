//! One entry point per deployment role.

pub mod firewall;
pub mod path_controller;
pub mod readiness;
pub mod server;
pub mod setup;
pub mod tunnel_controller;

pub type CommandError = Box<dyn std::error::Error + Send + Sync>;
