//! Kinematic bicycle model
//!
//! The same step function is used to predict the state over the actuation
//! latency and to build the dynamics constraints of the optimisation, so the
//! two can never disagree.
//!
//! Sign convention: a positive steering angle turns the vehicle clockwise,
//! i.e. the heading decreases.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;

use super::{ReferenceCurve, StateChannel, VariableLayout};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// State of the vehicle in the local frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VehicleState {
    /// Units: meters
    pub x_m: f64,

    /// Units: meters
    pub y_m: f64,

    /// Heading.
    ///
    /// Units: radians
    pub psi_rad: f64,

    /// Units: meters/second
    pub v_ms: f64,

    /// Cross track error, reference minus vehicle lateral position.
    ///
    /// Units: meters
    pub cte_m: f64,

    /// Heading error, vehicle heading minus reference tangent heading.
    ///
    /// Units: radians
    pub epsi_rad: f64,
}

/// A steering and throttle pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Actuation {
    /// Steering angle.
    ///
    /// Units: radians
    pub delta_rad: f64,

    /// Normalised throttle, negative values brake. Treated as an
    /// acceleration in the model.
    pub a: f64,
}

/// Discrete kinematic bicycle model.
#[derive(Debug, Clone, Copy)]
pub struct KinematicModel {
    /// Distance from the CoG to the front axle.
    ///
    /// Units: meters
    pub lf_m: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl VehicleState {
    /// Get the value of a single channel.
    pub fn channel(&self, channel: StateChannel) -> f64 {
        match channel {
            StateChannel::X => self.x_m,
            StateChannel::Y => self.y_m,
            StateChannel::Psi => self.psi_rad,
            StateChannel::V => self.v_ms,
            StateChannel::Cte => self.cte_m,
            StateChannel::Epsi => self.epsi_rad,
        }
    }

    /// Read the state at timestep `t` out of a decision vector.
    pub fn from_vars(layout: &VariableLayout, vars: &[f64], t: usize) -> Self {
        Self {
            x_m: vars[layout.state(StateChannel::X, t)],
            y_m: vars[layout.state(StateChannel::Y, t)],
            psi_rad: vars[layout.state(StateChannel::Psi, t)],
            v_ms: vars[layout.state(StateChannel::V, t)],
            cte_m: vars[layout.state(StateChannel::Cte, t)],
            epsi_rad: vars[layout.state(StateChannel::Epsi, t)],
        }
    }

    /// True if every channel is finite.
    pub fn is_finite(&self) -> bool {
        StateChannel::ALL.iter().all(|&c| self.channel(c).is_finite())
    }
}

impl Actuation {
    /// Read the actuation at timestep `t` out of a decision vector.
    pub fn from_vars(layout: &VariableLayout, vars: &[f64], t: usize) -> Self {
        Self {
            delta_rad: vars[layout.delta(t)],
            a: vars[layout.a(t)],
        }
    }
}

impl KinematicModel {
    pub fn new(lf_m: f64) -> Self {
        Self { lf_m }
    }

    /// Advance the state by `dt_s` seconds under the given actuation.
    ///
    /// The errors are propagated against `curve`, evaluated at the state's
    /// current x position.
    pub fn step(
        &self,
        state: &VehicleState,
        act: &Actuation,
        curve: &ReferenceCurve,
        dt_s: f64
    ) -> VehicleState {
        let yaw_rate_rads = state.v_ms * act.delta_rad / self.lf_m;
        let ref_psi_rad = curve.derivative(state.x_m).atan();

        VehicleState {
            x_m: state.x_m + state.v_ms * state.psi_rad.cos() * dt_s,
            y_m: state.y_m + state.v_ms * state.psi_rad.sin() * dt_s,
            psi_rad: state.psi_rad - yaw_rate_rads * dt_s,
            v_ms: state.v_ms + act.a * dt_s,
            cte_m: (curve.eval(state.x_m) - state.y_m)
                + state.v_ms * state.epsi_rad.sin() * dt_s,
            epsi_rad: (state.psi_rad - ref_psi_rad) - yaw_rate_rads * dt_s,
        }
    }
}
