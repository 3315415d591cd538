#![forbid(unsafe_code)]

//! `uplink` — relays an ACP agent process to a single WebSocket client and
//! implements both sides of the ACP session protocol.

pub mod acp;
pub mod agent;
pub mod bridge;
pub mod client;
pub mod config;
pub mod errors;
pub mod server;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
