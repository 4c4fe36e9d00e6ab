//! Parameters structure for the model predictive controller

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Deserialize;

use super::SolverOptions;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the model predictive controller.
///
/// Loaded once at startup and never modified afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Params {

    // ---- HORIZON ----

    /// Number of timesteps in the prediction horizon, including the initial
    /// state.
    pub horizon_len: usize,

    /// Duration of one horizon timestep.
    ///
    /// Units: seconds
    pub timestep_s: f64,

    // ---- VEHICLE ----

    /// Distance from the vehicle's centre of gravity to its front axle.
    ///
    /// Units: meters
    pub lf_m: f64,

    /// Speed the controller tries to hold.
    ///
    /// Units: meters/second
    pub ref_speed_ms: f64,

    /// Largest steering angle that can be commanded, the normalised steering
    /// output of 1 maps to this angle.
    ///
    /// Units: radians
    pub max_steer_rad: f64,

    /// Largest normalised throttle (and braking) that can be commanded.
    pub max_throttle: f64,

    /// Factor converting the telemetry's speed into meters/second.
    pub speed_to_ms: f64,

    // ---- LATENCY ----

    /// Latency estimates are clamped to this value.
    ///
    /// Units: seconds
    pub max_latency_s: f64,

    /// Latency used when there is no previous cycle to measure from.
    ///
    /// Units: seconds
    pub default_latency_s: f64,

    // ---- REFERENCE ----

    /// Order of the polynomial fitted to the waypoints.
    pub curve_order: usize,

    // ---- COST & SOLVER ----

    /// Weights of the terms in the cost function.
    pub weights: Weights,

    /// Options passed to the NLP solver.
    pub solver: SolverOptions,
}

/// Weights of each term in the MPC cost function.
#[derive(Debug, Clone, Deserialize)]
pub struct Weights {
    /// Cross track error
    pub cte: f64,

    /// Heading error
    pub epsi: f64,

    /// Deviation from the reference speed
    pub speed: f64,

    /// Steering magnitude
    pub steer: f64,

    /// Throttle magnitude
    pub throttle: f64,

    /// Change in steering between timesteps
    pub steer_rate: f64,

    /// Change in throttle between timesteps
    pub throttle_rate: f64,

    /// Change in cross track error between timesteps
    pub cte_rate: f64,

    /// Change in heading error between timesteps
    pub epsi_rate: f64,

    /// Speed through high curvature sections of the reference
    pub curvature_speed: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reasons the parameters can be rejected.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("The horizon must contain at least 2 timesteps, found {0}")]
    HorizonTooShort(usize),

    #[error("The timestep must be positive, found {0}")]
    InvalidTimestep(f64),

    #[error("The CoG to front axle distance must be positive, found {0}")]
    InvalidLf(f64),

    #[error("{0} must be positive and finite, found {1}")]
    InvalidLimit(&'static str, f64),

    #[error("The curve order must be at least 1, found {0}")]
    InvalidCurveOrder(usize),

    #[error("The {0} weight must be finite and not negative, found {1}")]
    InvalidWeight(&'static str, f64),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Check the parameters are usable.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.horizon_len < 2 {
            return Err(ParamsError::HorizonTooShort(self.horizon_len));
        }

        if !(self.timestep_s.is_finite() && self.timestep_s > 0.0) {
            return Err(ParamsError::InvalidTimestep(self.timestep_s));
        }

        if !(self.lf_m.is_finite() && self.lf_m > 0.0) {
            return Err(ParamsError::InvalidLf(self.lf_m));
        }

        if !self.ref_speed_ms.is_finite() {
            return Err(ParamsError::InvalidLimit("ref_speed_ms", self.ref_speed_ms));
        }

        let limits = [
            ("max_steer_rad", self.max_steer_rad),
            ("max_throttle", self.max_throttle),
            ("speed_to_ms", self.speed_to_ms),
            ("max_latency_s", self.max_latency_s),
            ("solver.max_cpu_time_s", self.solver.max_cpu_time_s),
        ];
        for &(name, value) in limits.iter() {
            if !(value.is_finite() && value > 0.0) {
                return Err(ParamsError::InvalidLimit(name, value));
            }
        }

        // A zero default latency is allowed, it disables first cycle
        // compensation
        if !(self.default_latency_s.is_finite() && self.default_latency_s >= 0.0) {
            return Err(ParamsError::InvalidLimit(
                "default_latency_s",
                self.default_latency_s
            ));
        }

        if self.curve_order < 1 {
            return Err(ParamsError::InvalidCurveOrder(self.curve_order));
        }

        self.weights.validate()
    }
}

impl Weights {
    fn validate(&self) -> Result<(), ParamsError> {
        let weights = [
            ("cte", self.cte),
            ("epsi", self.epsi),
            ("speed", self.speed),
            ("steer", self.steer),
            ("throttle", self.throttle),
            ("steer_rate", self.steer_rate),
            ("throttle_rate", self.throttle_rate),
            ("cte_rate", self.cte_rate),
            ("epsi_rate", self.epsi_rate),
            ("curvature_speed", self.curvature_speed),
        ];

        for &(name, value) in weights.iter() {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ParamsError::InvalidWeight(name, value));
            }
        }

        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            horizon_len: 10,
            timestep_s: 0.1,
            lf_m: 2.67,
            ref_speed_ms: 50.0,
            max_steer_rad: 0.436332,
            max_throttle: 1.0,
            speed_to_ms: 0.44704,
            max_latency_s: 0.25,
            default_latency_s: 0.15,
            curve_order: 3,
            weights: Weights::default(),
            solver: SolverOptions::default(),
        }
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            cte: 10.0,
            epsi: 2.0,
            speed: 1.0,
            steer: 1000.0,
            throttle: 1.0,
            steer_rate: 200.0,
            throttle_rate: 1.0,
            cte_rate: 100.0,
            epsi_rate: 200.0,
            curvature_speed: 1150.0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_params_valid() {
        assert!(Params::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut p = Params::default();
        p.horizon_len = 1;
        assert!(matches!(p.validate(), Err(ParamsError::HorizonTooShort(1))));

        let mut p = Params::default();
        p.timestep_s = 0.0;
        assert!(matches!(p.validate(), Err(ParamsError::InvalidTimestep(_))));

        let mut p = Params::default();
        p.lf_m = -2.67;
        assert!(matches!(p.validate(), Err(ParamsError::InvalidLf(_))));

        let mut p = Params::default();
        p.max_steer_rad = 0.0;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidLimit("max_steer_rad", _))
        ));

        let mut p = Params::default();
        p.solver.max_cpu_time_s = f64::NAN;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidLimit("solver.max_cpu_time_s", _))
        ));

        let mut p = Params::default();
        p.curve_order = 0;
        assert!(matches!(p.validate(), Err(ParamsError::InvalidCurveOrder(0))));

        let mut p = Params::default();
        p.weights.steer_rate = f64::INFINITY;
        assert!(matches!(
            p.validate(),
            Err(ParamsError::InvalidWeight("steer_rate", _))
        ));
    }

    #[test]
    fn test_params_from_toml() {
        let p: Params = util::params::from_toml_str(
            r#"
            horizon_len = 12
            timestep_s = 0.05
            lf_m = 2.67
            ref_speed_ms = 20.0
            max_steer_rad = 0.436332
            max_throttle = 1.0
            speed_to_ms = 0.44704
            max_latency_s = 0.25
            default_latency_s = 0.15
            curve_order = 3

            [weights]
            cte = 10.0
            epsi = 2.0
            speed = 1.0
            steer = 1000.0
            throttle = 1.0
            steer_rate = 200.0
            throttle_rate = 1.0
            cte_rate = 100.0
            epsi_rate = 200.0
            curvature_speed = 1150.0

            [solver]
            max_cpu_time_s = 0.5
            sparse_derivatives = true
            max_outer_iters = 20
            max_inner_iters = 500
            constr_viol_tol = 1e-4
            grad_tol = 1e-6
            initial_penalty = 10.0
            penalty_growth = 10.0
            max_penalty = 1e9
            "#
        ).unwrap();

        assert_eq!(p.horizon_len, 12);
        assert_eq!(p.solver.max_inner_iters, 500);
        assert!(p.validate().is_ok());
    }
}
