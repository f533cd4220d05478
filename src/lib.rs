//! labforge: training-lab provisioning and browser shell gateway.
//!
//! - [`provisioning`]: launch a lab (record writer, compute launcher,
//!   orchestrator).
//! - [`gateway`]: one interactive shell per WebSocket channel.
//! - [`api`]: HTTP trigger for launches.

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod provisioning;
pub mod testing;
