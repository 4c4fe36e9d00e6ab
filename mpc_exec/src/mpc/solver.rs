//! Nonlinear program solver
//!
//! Solves problems of the form
//!
//! ```text
//! min f(x)  subject to  g_l <= g(x) <= g_u,  x_l <= x <= x_u
//! ```
//!
//! with a Powell-Hestenes-Rockafellar augmented Lagrangian. Each subproblem is
//! unconstrained and minimised with argmin's L-BFGS. Bounds with a magnitude
//! of at least [`BOUND_INF`] are treated as absent.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use argmin::{
    core::{CostFunction, Error, Executor, Gradient, State},
    solver::{linesearch::MoreThuenteLineSearch, quasinewton::LBFGS},
};
use finitediff::FiniteDiff;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Bounds at or beyond this magnitude are treated as infinite.
pub const BOUND_INF: f64 = 1.0e19;

/// Number of correction pairs kept by L-BFGS.
const LBFGS_MEMORY: usize = 7;

/// The penalty is only increased when a subproblem fails to cut the
/// constraint violation to this fraction of its previous value.
const VIOLATION_REDUCTION: f64 = 0.25;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A nonlinear program.
///
/// Evaluation must be deterministic and free of side effects, solvers call
/// these functions many times per solve.
pub trait NlpProblem {
    /// Length of the decision vector.
    fn num_variables(&self) -> usize;

    /// Length of the constraint vector.
    fn num_constraints(&self) -> usize;

    /// Objective value at `x`.
    fn objective(&self, x: &[f64]) -> f64;

    /// Constraint values at `x`, written into `g`.
    fn constraints(&self, x: &[f64], g: &mut [f64]);

    /// Gradient of the objective at `x`, written into `grad`.
    ///
    /// Defaults to central finite differences.
    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        let fd = x.to_vec().central_diff(&|p: &Vec<f64>| self.objective(p));
        grad.copy_from_slice(&fd);
    }

    /// Nonzero entries of the constraint Jacobian at `x` as `(row, col,
    /// value)` triplets. The entries are appended to `triplets` after it is
    /// cleared.
    ///
    /// Defaults to dense central finite differences.
    fn constraint_jacobian(&self, x: &[f64], triplets: &mut Vec<(usize, usize, f64)>) {
        triplets.clear();

        let m = self.num_constraints();
        let xv = x.to_vec();

        for row in 0..m {
            let grad_row = xv.central_diff(&|p: &Vec<f64>| {
                let mut g = vec![0.0; m];
                self.constraints(p, &mut g);
                g[row]
            });
            for (col, &value) in grad_row.iter().enumerate() {
                if value != 0.0 {
                    triplets.push((row, col, value));
                }
            }
        }
    }
}

/// A solver for [`NlpProblem`]s.
pub trait NlpSolver {
    /// Solve the problem starting from `x0`.
    ///
    /// Failures are reported through the solution's status, never as a
    /// panic.
    fn solve<P: NlpProblem>(&self, problem: &P, x0: &[f64], bounds: &NlpBounds) -> NlpSolution;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Variable and constraint bounds of a problem.
#[derive(Debug, Clone, Default)]
pub struct NlpBounds {
    pub var_lower: Vec<f64>,
    pub var_upper: Vec<f64>,
    pub constr_lower: Vec<f64>,
    pub constr_upper: Vec<f64>,
}

/// The outcome of a solve.
#[derive(Debug, Clone)]
pub struct NlpSolution {
    pub status: SolveStatus,

    /// Final iterate. Only trustworthy when `status` is
    /// [`SolveStatus::Success`].
    pub x: Vec<f64>,

    /// Objective at `x`.
    pub objective: f64,

    /// Largest bound violation of the constraints and variables at `x`.
    pub constraint_violation: f64,

    /// Total number of inner solver iterations.
    pub iterations: u64,
}

/// Solver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SolverOptions {
    /// Wall clock budget for one solve.
    ///
    /// Units: seconds
    pub max_cpu_time_s: f64,

    /// Use the problem's own derivatives. When false the gradient of each
    /// subproblem is found by dense finite differences, which is much
    /// slower.
    pub sparse_derivatives: bool,

    /// Maximum number of multiplier updates.
    pub max_outer_iters: usize,

    /// Maximum number of L-BFGS iterations per subproblem.
    pub max_inner_iters: u64,

    /// Largest bound violation accepted as feasible.
    pub constr_viol_tol: f64,

    /// Subproblem gradient norm at which L-BFGS stops.
    pub grad_tol: f64,

    pub initial_penalty: f64,

    pub penalty_growth: f64,

    pub max_penalty: f64,
}

/// Augmented Lagrangian solver.
#[derive(Debug, Clone)]
pub struct AugLagSolver {
    options: SolverOptions,
}

/// One augmented Lagrangian subproblem, minimised by argmin.
struct Subproblem<'a, P> {
    problem: &'a P,

    /// Constraint bounds with infinities substituted.
    constr_lower: &'a [f64],
    constr_upper: &'a [f64],

    /// Variable bounds with infinities substituted.
    var_lower: &'a [f64],
    var_upper: &'a [f64],

    constr_mult: &'a [f64],
    var_mult: &'a [f64],

    penalty: f64,

    sparse: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolveStatus {
    /// The bounds are met to within `constr_viol_tol`. Optimality is only as good as the last
    /// subproblem's L-BFGS run, no stationarity check is made.
    Success,

    /// No feasible point was found within the iteration or penalty limits.
    Infeasible,

    /// The time budget ran out before a feasible point was found.
    Timeout,

    /// The solver broke down (non-finite values, bad problem dimensions).
    SolverError,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_cpu_time_s: 0.5,
            sparse_derivatives: true,
            max_outer_iters: 20,
            max_inner_iters: 500,
            constr_viol_tol: 1e-4,
            grad_tol: 1e-6,
            initial_penalty: 10.0,
            penalty_growth: 10.0,
            max_penalty: 1e9,
        }
    }
}

impl AugLagSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Run one L-BFGS minimisation of the subproblem from `x`.
    ///
    /// Returns the best point found and the number of iterations.
    fn minimise<P: NlpProblem>(
        &self,
        sub: Subproblem<'_, P>,
        x: &[f64],
        timeout: Duration
    ) -> Result<(Vec<f64>, u64), Error> {
        let linesearch = MoreThuenteLineSearch::new();
        let lbfgs = LBFGS::new(linesearch, LBFGS_MEMORY)
            .with_tolerance_grad(self.options.grad_tol)?;

        let res = Executor::new(sub, lbfgs)
            .configure(|state| {
                state
                    .param(x.to_vec())
                    .max_iters(self.options.max_inner_iters)
            })
            .timeout(timeout)
            .run()?;

        let iters = res.state.get_iter();
        let best = match res.state.get_best_param() {
            Some(p) => p.clone(),
            None => x.to_vec(),
        };

        Ok((best, iters))
    }
}

impl NlpSolver for AugLagSolver {
    fn solve<P: NlpProblem>(&self, problem: &P, x0: &[f64], bounds: &NlpBounds) -> NlpSolution {
        let start = Instant::now();
        let n = problem.num_variables();
        let m = problem.num_constraints();

        let mut x = x0.to_vec();

        // ---- CHECK PROBLEM ----

        if x.len() != n
            || bounds.var_lower.len() != n
            || bounds.var_upper.len() != n
            || bounds.constr_lower.len() != m
            || bounds.constr_upper.len() != m
        {
            warn!(
                "NLP dimensions disagree: {} variables, {} constraints, x0 {}, bounds {}/{}/{}/{}",
                n, m, x.len(),
                bounds.var_lower.len(), bounds.var_upper.len(),
                bounds.constr_lower.len(), bounds.constr_upper.len()
            );
            return NlpSolution::failed(SolveStatus::SolverError, x, f64::NAN);
        }

        let var_lower: Vec<f64> = bounds.var_lower.iter().map(|&b| lower_bound(b)).collect();
        let var_upper: Vec<f64> = bounds.var_upper.iter().map(|&b| upper_bound(b)).collect();
        let constr_lower: Vec<f64> = bounds.constr_lower.iter().map(|&b| lower_bound(b)).collect();
        let constr_upper: Vec<f64> = bounds.constr_upper.iter().map(|&b| upper_bound(b)).collect();

        let bounds_ok = var_lower.iter().zip(var_upper.iter())
            .chain(constr_lower.iter().zip(constr_upper.iter()))
            .all(|(l, u)| l <= u);
        if !bounds_ok {
            warn!("NLP has a lower bound above its upper bound");
            return NlpSolution::failed(SolveStatus::SolverError, x, f64::NAN);
        }

        // ---- OUTER LOOP ----

        let budget = match Duration::try_from_secs_f64(self.options.max_cpu_time_s) {
            Ok(b) => b,
            Err(_) => Duration::from_secs(0),
        };

        let mut constr_mult = vec![0.0; m];
        let mut var_mult = vec![0.0; n];
        let mut penalty = self.options.initial_penalty;
        let mut g = vec![0.0; m];

        let mut iterations = 0u64;
        let mut any_inner_ok = false;
        let mut prev_viol = f64::INFINITY;

        for outer in 0..self.options.max_outer_iters {
            let elapsed = start.elapsed();
            if elapsed >= budget {
                debug!("NLP budget of {:?} exhausted after {} outer iterations", budget, outer);
                return self.finish(
                    problem, x, SolveStatus::Timeout, iterations, &var_lower, &var_upper,
                    &constr_lower, &constr_upper
                );
            }

            let sub = Subproblem {
                problem,
                constr_lower: &constr_lower,
                constr_upper: &constr_upper,
                var_lower: &var_lower,
                var_upper: &var_upper,
                constr_mult: &constr_mult,
                var_mult: &var_mult,
                penalty,
                sparse: self.options.sparse_derivatives,
            };

            match self.minimise(sub, &x, budget - elapsed) {
                Ok((best, iters)) => {
                    iterations += iters;
                    if best.iter().all(|v| v.is_finite()) {
                        x = best;
                        any_inner_ok = true;
                    }
                },
                // Keep the previous iterate, the penalty update below makes
                // the next subproblem different
                Err(e) => debug!("NLP subproblem {} failed: {}", outer, e),
            }

            // ---- UPDATE MULTIPLIERS ----

            problem.constraints(&x, &mut g);
            let viol = max_violation(&x, &g, &var_lower, &var_upper, &constr_lower, &constr_upper);

            trace!(
                "NLP outer {}: violation {:.3e}, penalty {:.1e}, objective {:.6}",
                outer, viol, penalty, problem.objective(&x)
            );

            if !viol.is_finite() {
                return self.finish(
                    problem, x, SolveStatus::SolverError, iterations, &var_lower, &var_upper,
                    &constr_lower, &constr_upper
                );
            }

            if viol <= self.options.constr_viol_tol {
                return self.finish(
                    problem, x, SolveStatus::Success, iterations, &var_lower, &var_upper,
                    &constr_lower, &constr_upper
                );
            }

            for j in 0..m {
                constr_mult[j] = penalty * shifted_residual(
                    g[j], constr_mult[j], penalty, constr_lower[j], constr_upper[j]
                );
            }
            for i in 0..n {
                var_mult[i] = penalty * shifted_residual(
                    x[i], var_mult[i], penalty, var_lower[i], var_upper[i]
                );
            }

            // ---- UPDATE PENALTY ----

            if viol > VIOLATION_REDUCTION * prev_viol {
                if penalty >= self.options.max_penalty {
                    debug!("NLP penalty at its limit with violation {:.3e}", viol);
                    break;
                }
                penalty = (penalty * self.options.penalty_growth).min(self.options.max_penalty);
            }
            prev_viol = viol;
        }

        // Never managing a single subproblem means the solver itself broke
        let status = match any_inner_ok {
            true => SolveStatus::Infeasible,
            false => SolveStatus::SolverError,
        };

        self.finish(
            problem, x, status, iterations, &var_lower, &var_upper, &constr_lower, &constr_upper
        )
    }
}

impl AugLagSolver {
    #[allow(clippy::too_many_arguments)]
    fn finish<P: NlpProblem>(
        &self,
        problem: &P,
        x: Vec<f64>,
        status: SolveStatus,
        iterations: u64,
        var_lower: &[f64],
        var_upper: &[f64],
        constr_lower: &[f64],
        constr_upper: &[f64],
    ) -> NlpSolution {
        let mut g = vec![0.0; problem.num_constraints()];
        problem.constraints(&x, &mut g);

        NlpSolution {
            status,
            objective: problem.objective(&x),
            constraint_violation: max_violation(
                &x, &g, var_lower, var_upper, constr_lower, constr_upper
            ),
            iterations,
            x,
        }
    }
}

impl NlpSolution {
    fn failed(status: SolveStatus, x: Vec<f64>, objective: f64) -> Self {
        Self {
            status,
            x,
            objective,
            constraint_violation: f64::NAN,
            iterations: 0,
        }
    }
}

impl<'a, P: NlpProblem> Subproblem<'a, P> {
    /// Value of the augmented Lagrangian.
    fn value(&self, x: &[f64]) -> f64 {
        let mut g = vec![0.0; self.problem.num_constraints()];
        self.problem.constraints(x, &mut g);

        let rho = self.penalty;
        let mut sum_sq = 0.0;

        for j in 0..g.len() {
            let r = shifted_residual(
                g[j], self.constr_mult[j], rho, self.constr_lower[j], self.constr_upper[j]
            );
            sum_sq += r * r;
        }
        for i in 0..x.len() {
            let r = shifted_residual(
                x[i], self.var_mult[i], rho, self.var_lower[i], self.var_upper[i]
            );
            sum_sq += r * r;
        }

        self.problem.objective(x) + 0.5 * rho * sum_sq
    }

    /// Gradient of the augmented Lagrangian from the problem's derivatives.
    fn exact_gradient(&self, x: &[f64]) -> Vec<f64> {
        let rho = self.penalty;

        let mut grad = vec![0.0; x.len()];
        self.problem.objective_gradient(x, &mut grad);

        let mut g = vec![0.0; self.problem.num_constraints()];
        self.problem.constraints(x, &mut g);

        let weights: Vec<f64> = g
            .iter()
            .enumerate()
            .map(|(j, &gj)| rho * shifted_residual(
                gj, self.constr_mult[j], rho, self.constr_lower[j], self.constr_upper[j]
            ))
            .collect();

        let mut jac = Vec::new();
        self.problem.constraint_jacobian(x, &mut jac);
        for &(row, col, value) in jac.iter() {
            grad[col] += weights[row] * value;
        }

        for i in 0..x.len() {
            grad[i] += rho * shifted_residual(
                x[i], self.var_mult[i], rho, self.var_lower[i], self.var_upper[i]
            );
        }

        grad
    }
}

impl<'a, P: NlpProblem> CostFunction for Subproblem<'a, P> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.value(p))
    }
}

impl<'a, P: NlpProblem> Gradient for Subproblem<'a, P> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, p: &Self::Param) -> Result<Self::Gradient, Error> {
        if self.sparse {
            Ok(self.exact_gradient(p))
        }
        else {
            Ok(p.central_diff(&|x| self.value(x)))
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn lower_bound(b: f64) -> f64 {
    if b <= -BOUND_INF { f64::NEG_INFINITY } else { b }
}

fn upper_bound(b: f64) -> f64 {
    if b >= BOUND_INF { f64::INFINITY } else { b }
}

/// Distance of the multiplier shifted value `c + mult / rho` from `[l, u]`,
/// signed positive above the upper bound.
fn shifted_residual(c: f64, mult: f64, rho: f64, l: f64, u: f64) -> f64 {
    let s = c + mult / rho;
    s - s.max(l).min(u)
}

/// Largest bound violation of the constraints and variables.
fn max_violation(x: &[f64], g: &[f64], xl: &[f64], xu: &[f64], gl: &[f64], gu: &[f64]) -> f64 {
    let var = x.iter().zip(xl.iter().zip(xu.iter()));
    let con = g.iter().zip(gl.iter().zip(gu.iter()));

    var.chain(con).fold(0.0f64, |acc, (&v, (&l, &u))| {
        if !v.is_finite() {
            return f64::INFINITY;
        }
        acc.max(l - v).max(v - u)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    /// min (x0 - 1)^2 + (x1 - 2)^2  s.t.  x0 + x1 = 1,  x1 <= 0.5
    ///
    /// Solution is x = (0.5, 0.5).
    struct Toy;

    impl NlpProblem for Toy {
        fn num_variables(&self) -> usize { 2 }

        fn num_constraints(&self) -> usize { 1 }

        fn objective(&self, x: &[f64]) -> f64 {
            (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2)
        }

        fn constraints(&self, x: &[f64], g: &mut [f64]) {
            g[0] = x[0] + x[1];
        }
    }

    fn toy_bounds() -> NlpBounds {
        NlpBounds {
            var_lower: vec![-BOUND_INF, -BOUND_INF],
            var_upper: vec![BOUND_INF, 0.5],
            constr_lower: vec![1.0],
            constr_upper: vec![1.0],
        }
    }

    fn options() -> SolverOptions {
        SolverOptions {
            max_cpu_time_s: 5.0,
            constr_viol_tol: 1e-8,
            ..Default::default()
        }
    }

    #[test]
    fn test_toy_problem() {
        let solver = AugLagSolver::new(options());
        let sol = solver.solve(&Toy, &[0.0, 0.0], &toy_bounds());

        assert_eq!(sol.status, SolveStatus::Success);
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-5);
        assert_relative_eq!(sol.x[1], 0.5, epsilon = 1e-5);
        assert!(sol.constraint_violation <= 1e-8);
    }

    #[test]
    fn test_success_means_within_tolerance() {
        let tol = 1e-2;
        let solver = AugLagSolver::new(SolverOptions {
            constr_viol_tol: tol,
            ..options()
        });
        let sol = solver.solve(&Toy, &[0.0, 0.0], &toy_bounds());

        // Feasibility is only guaranteed to the tolerance asked for
        assert_eq!(sol.status, SolveStatus::Success);
        assert!(sol.constraint_violation <= tol);
        assert!((sol.x[0] + sol.x[1] - 1.0).abs() <= tol);
        assert!(sol.x[1] <= 0.5 + tol);
    }

    #[test]
    fn test_toy_problem_dense() {
        let solver = AugLagSolver::new(SolverOptions {
            sparse_derivatives: false,
            ..options()
        });
        let sol = solver.solve(&Toy, &[0.0, 0.0], &toy_bounds());

        assert_eq!(sol.status, SolveStatus::Success);
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-4);
        assert_relative_eq!(sol.x[1], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_budget_times_out() {
        let solver = AugLagSolver::new(SolverOptions {
            max_cpu_time_s: 0.0,
            ..options()
        });
        let sol = solver.solve(&Toy, &[0.0, 0.0], &toy_bounds());

        assert_eq!(sol.status, SolveStatus::Timeout);
        assert_eq!(sol.iterations, 0);
    }

    #[test]
    fn test_infeasible_bounds() {
        let solver = AugLagSolver::new(SolverOptions {
            max_outer_iters: 8,
            ..options()
        });
        let mut bounds = toy_bounds();

        // x0 + x1 = 1 cannot hold with both variables at most 0.25
        bounds.var_upper = vec![0.25, 0.25];
        let sol = solver.solve(&Toy, &[0.0, 0.0], &bounds);

        assert_eq!(sol.status, SolveStatus::Infeasible);
    }

    #[test]
    fn test_bad_dimensions() {
        let solver = AugLagSolver::new(options());
        let sol = solver.solve(&Toy, &[0.0], &toy_bounds());

        assert_eq!(sol.status, SolveStatus::SolverError);
    }

    #[test]
    fn test_default_jacobian() {
        let mut jac = Vec::new();
        Toy.constraint_jacobian(&[0.3, -2.0], &mut jac);

        assert_eq!(jac.len(), 2);
        for &(row, _, value) in jac.iter() {
            assert_eq!(row, 0);
            assert_relative_eq!(value, 1.0, epsilon = 1e-6);
        }
    }
}
