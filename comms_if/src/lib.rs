//! # Communications interface crate.
//!
//! Provides the communications interfaces between the controller and the
//! vehicle (or simulator) it drives.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Telemetry and steering command messages, and their wire framing
pub mod telem;

/// Network module
pub mod net;
