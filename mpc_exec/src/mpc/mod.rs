//! Model predictive control module
//!
//! Each cycle the controller fits a reference curve to the waypoints ahead of the vehicle,
//! projects the vehicle state forward over the actuation latency, and solves a finite horizon
//! nonlinear program for the steering and throttle sequence which best follows the curve. The
//! first actuation of the optimal sequence is commanded.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod curve;
mod latency;
mod layout;
mod model;
mod optimiser;
mod params;
mod problem;
mod solver;
mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
pub use curve::*;
pub use latency::*;
pub use layout::*;
pub use model::*;
pub use optimiser::*;
pub use params::*;
pub use problem::*;
pub use solver::*;
pub use state::*;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors which reject a control cycle.
///
/// None of these are fatal, the cycle produces no command and the controller
/// carries on with the next telemetry message.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Waypoint x and y lists have different lengths ({xs} and {ys})")]
    MismatchedWaypoints { xs: usize, ys: usize },

    #[error("Telemetry field {0} is not finite")]
    NonFinite(&'static str),

    #[error("Could not fit the reference curve: {0}")]
    CurveFit(CurveFitError),
}

/// Errors which can occur while initialising the controller.
#[derive(Debug, thiserror::Error)]
pub enum MpcInitError {
    #[error("Could not load the controller parameters: {0}")]
    LoadError(util::params::LoadError),

    #[error("Invalid controller parameters: {0}")]
    InvalidParams(ParamsError),

    #[error("Could not create the controller archive: {0}")]
    ArchiveError(util::archive::ArchiveError),
}
