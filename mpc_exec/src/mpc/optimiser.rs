//! Trajectory optimiser
//!
//! Builds the bounds and initial guess of the MPC problem, runs the solver,
//! and extracts the first actuation and the predicted path from the result.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::{debug, warn};
use std::time::Instant;

use super::{
    Actuation, MpcProblem, NlpBounds, NlpSolver, Params, ReferenceCurve, SolveStatus,
    StateChannel, VariableLayout, VehicleState, BOUND_INF
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Solves the MPC problem each cycle.
///
/// Holds no state between solves, every call is independent.
pub struct TrajOptimiser<S> {
    params: Params,

    layout: VariableLayout,

    solver: S,
}

/// Result of one trajectory optimisation.
#[derive(Debug, Clone)]
pub struct SolveResult {
    pub status: SolveStatus,

    /// Objective value of the solution.
    pub cost: f64,

    /// First actuation of the optimal sequence. Only present when the solve
    /// succeeded.
    pub actuation: Option<Actuation>,

    /// Predicted x positions for timesteps 1 to N - 1, vehicle frame.
    ///
    /// Units: meters
    pub pred_x_m: Vec<f64>,

    /// Predicted y positions for timesteps 1 to N - 1, vehicle frame.
    ///
    /// Units: meters
    pub pred_y_m: Vec<f64>,

    /// Largest bound violation of the returned solution.
    pub constraint_violation: f64,

    pub iterations: u64,

    /// Units: seconds
    pub solve_time_s: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl<S: NlpSolver> TrajOptimiser<S> {
    /// Create a new optimiser. The parameters must already be validated.
    pub fn new(params: Params, solver: S) -> Self {
        Self {
            layout: VariableLayout::new(params.horizon_len),
            params,
            solver,
        }
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    /// Initial guess, zero apart from the initial state.
    pub fn initial_guess(&self, init: &VehicleState) -> Vec<f64> {
        let mut x0 = vec![0.0; self.layout.num_variables()];

        for &c in StateChannel::ALL.iter() {
            x0[self.layout.state(c, 0)] = init.channel(c);
        }

        x0
    }

    /// Variable and constraint bounds for a solve starting from `init`.
    pub fn bounds(&self, init: &VehicleState) -> NlpBounds {
        let l = &self.layout;
        let n_vars = l.num_variables();
        let n_cons = l.num_constraints();

        // States are unbounded
        let mut var_lower = vec![-BOUND_INF; n_vars];
        let mut var_upper = vec![BOUND_INF; n_vars];

        for t in 0..l.num_actuations() {
            var_lower[l.delta(t)] = -self.params.max_steer_rad;
            var_upper[l.delta(t)] = self.params.max_steer_rad;
            var_lower[l.a(t)] = -self.params.max_throttle;
            var_upper[l.a(t)] = self.params.max_throttle;
        }

        // Dynamics residuals are zero, initial conditions equal the state
        let mut constr_lower = vec![0.0; n_cons];
        let mut constr_upper = vec![0.0; n_cons];

        for &c in StateChannel::ALL.iter() {
            constr_lower[l.state(c, 0)] = init.channel(c);
            constr_upper[l.state(c, 0)] = init.channel(c);
        }

        NlpBounds {
            var_lower,
            var_upper,
            constr_lower,
            constr_upper,
        }
    }

    /// Solve for the actuation sequence starting from `init` and following
    /// `curve`.
    pub fn solve(&self, init: &VehicleState, curve: &ReferenceCurve) -> SolveResult {
        let start = Instant::now();

        let problem = MpcProblem::new(&self.params, self.layout, curve.clone());
        let x0 = self.initial_guess(init);
        let bounds = self.bounds(init);

        let sol = self.solver.solve(&problem, &x0, &bounds);

        let solve_time_s = start.elapsed().as_secs_f64();

        debug!(
            "MPC solve: {:?} in {:.3} s, {} iterations, cost {:.4}, violation {:.2e}",
            sol.status, solve_time_s, sol.iterations, sol.objective, sol.constraint_violation
        );

        let mut result = SolveResult {
            status: sol.status,
            cost: sol.objective,
            actuation: None,
            pred_x_m: Vec::new(),
            pred_y_m: Vec::new(),
            constraint_violation: sol.constraint_violation,
            iterations: sol.iterations,
            solve_time_s,
        };

        if sol.status != SolveStatus::Success {
            return result;
        }

        if sol.x.len() != bounds.var_lower.len() || sol.x.iter().any(|v| !v.is_finite()) {
            warn!("MPC solver reported success with an invalid solution");
            result.status = SolveStatus::SolverError;
            return result;
        }

        // Pull the solution inside the variable bounds, the solver only
        // satisfies them to within its tolerance
        let x: Vec<f64> = sol.x
            .iter()
            .zip(bounds.var_lower.iter().zip(bounds.var_upper.iter()))
            .map(|(&v, (&lo, &hi))| v.max(lo).min(hi))
            .collect();

        let l = &self.layout;

        result.actuation = Some(Actuation::from_vars(l, &x, 0));
        result.pred_x_m = (1..l.horizon_len())
            .map(|t| x[l.state(StateChannel::X, t)])
            .collect();
        result.pred_y_m = (1..l.horizon_len())
            .map(|t| x[l.state(StateChannel::Y, t)])
            .collect();

        result
    }
}

impl SolveResult {
    pub fn is_success(&self) -> bool {
        self.status == SolveStatus::Success && self.actuation.is_some()
    }
}
