//! # MPC library.
//!
//! This library allows other crates in the workspace, the benchmarks and the integration tests to
//! access items defined inside the MPC executable crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Model predictive controller - computes steering and throttle commands which follow the path
pub mod mpc;

/// Control loop - ties the controller to a telemetry link, one request per cycle
pub mod control_loop;

/// Executable parameters
pub mod params;

/// Telemetry server - receives telemetry frames from the simulator and replies with commands
pub mod telem_server;
