//! MPC nonlinear program
//!
//! Maps a decision vector to the tracking cost and the dynamics constraints
//! of the kinematic bicycle model over the horizon. The evaluator only holds
//! copies of the parameters and the reference curve, so it can be built
//! fresh for every solve.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use super::{
    Actuation, KinematicModel, NlpProblem, Params, ReferenceCurve, StateChannel,
    VariableLayout, VehicleState, Weights
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The MPC problem for one control cycle.
#[derive(Debug, Clone)]
pub struct MpcProblem {
    layout: VariableLayout,

    model: KinematicModel,

    curve: ReferenceCurve,

    weights: Weights,

    /// Units: seconds
    timestep_s: f64,

    /// Units: meters/second
    ref_speed_ms: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl MpcProblem {
    pub fn new(params: &Params, layout: VariableLayout, curve: ReferenceCurve) -> Self {
        Self {
            layout,
            model: KinematicModel::new(params.lf_m),
            curve,
            weights: params.weights.clone(),
            timestep_s: params.timestep_s,
            ref_speed_ms: params.ref_speed_ms,
        }
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    pub fn curve(&self) -> &ReferenceCurve {
        &self.curve
    }

    /// Apply the model to timestep `t - 1` of the decision vector, giving the
    /// state it predicts for timestep `t`.
    pub fn predict(&self, vars: &[f64], t: usize) -> VehicleState {
        let prev = VehicleState::from_vars(&self.layout, vars, t - 1);
        let act = Actuation::from_vars(&self.layout, vars, t - 1);

        self.model.step(&prev, &act, &self.curve, self.timestep_s)
    }

    /// Curvature-speed cost term at one point, and its partial derivatives
    /// with respect to x and v.
    fn curvature_term(&self, x: f64, v: f64) -> (f64, f64, f64) {
        let w = self.weights.curvature_speed;

        let d1 = self.curve.derivative(x);
        let d2 = self.curve.second_derivative(x);
        let d3 = self.curve.third_derivative(x);

        let base = 1.0 + d1 * d1;
        let den = base.powf(1.5);
        let kappa = d2.abs() / den;

        // d kappa / dx
        let dkappa_dx = d2.signum() * d3 / den
            - d2.abs() * 3.0 * d1 * d2 * base.sqrt() / (den * den);

        (w * kappa * v, w * v * dkappa_dx, w * kappa)
    }
}

impl NlpProblem for MpcProblem {
    fn num_variables(&self) -> usize {
        self.layout.num_variables()
    }

    fn num_constraints(&self) -> usize {
        self.layout.num_constraints()
    }

    fn objective(&self, vars: &[f64]) -> f64 {
        let l = &self.layout;
        let w = &self.weights;
        let n = l.horizon_len();
        let mut cost = 0.0;

        // Reference state tracking
        for t in 0..n {
            let cte = vars[l.state(StateChannel::Cte, t)];
            let epsi = vars[l.state(StateChannel::Epsi, t)];
            let dv = vars[l.state(StateChannel::V, t)] - self.ref_speed_ms;

            cost += w.cte * cte * cte + w.epsi * epsi * epsi + w.speed * dv * dv;
        }

        // Actuator use
        for t in 0..n - 1 {
            let delta = vars[l.delta(t)];
            let a = vars[l.a(t)];

            cost += w.steer * delta * delta + w.throttle * a * a;
        }

        // Actuator smoothness
        for t in 0..n.saturating_sub(2) {
            let dd = vars[l.delta(t + 1)] - vars[l.delta(t)];
            let da = vars[l.a(t + 1)] - vars[l.a(t)];

            cost += w.steer_rate * dd * dd + w.throttle_rate * da * da;
        }

        // Error smoothness and speed through curves
        for t in 0..n - 1 {
            let dcte = vars[l.state(StateChannel::Cte, t + 1)]
                - vars[l.state(StateChannel::Cte, t)];
            let depsi = vars[l.state(StateChannel::Epsi, t + 1)]
                - vars[l.state(StateChannel::Epsi, t)];

            cost += w.cte_rate * dcte * dcte + w.epsi_rate * depsi * depsi;

            let (curv, _, _) = self.curvature_term(
                vars[l.state(StateChannel::X, t)],
                vars[l.state(StateChannel::V, t)]
            );
            cost += curv;
        }

        cost
    }

    fn constraints(&self, vars: &[f64], g: &mut [f64]) {
        let l = &self.layout;

        // Initial conditions are pinned through the constraint bounds
        for &c in StateChannel::ALL.iter() {
            g[l.state(c, 0)] = vars[l.state(c, 0)];
        }

        for t in 1..l.horizon_len() {
            let model = self.predict(vars, t);

            for &c in StateChannel::ALL.iter() {
                let row = l.state(c, t);
                g[row] = vars[row] - model.channel(c);
            }
        }
    }

    fn objective_gradient(&self, vars: &[f64], grad: &mut [f64]) {
        let l = &self.layout;
        let w = &self.weights;
        let n = l.horizon_len();

        for g in grad.iter_mut() {
            *g = 0.0;
        }

        for t in 0..n {
            let i_cte = l.state(StateChannel::Cte, t);
            let i_epsi = l.state(StateChannel::Epsi, t);
            let i_v = l.state(StateChannel::V, t);

            grad[i_cte] += 2.0 * w.cte * vars[i_cte];
            grad[i_epsi] += 2.0 * w.epsi * vars[i_epsi];
            grad[i_v] += 2.0 * w.speed * (vars[i_v] - self.ref_speed_ms);
        }

        for t in 0..n - 1 {
            grad[l.delta(t)] += 2.0 * w.steer * vars[l.delta(t)];
            grad[l.a(t)] += 2.0 * w.throttle * vars[l.a(t)];
        }

        for t in 0..n.saturating_sub(2) {
            let dd = 2.0 * w.steer_rate * (vars[l.delta(t + 1)] - vars[l.delta(t)]);
            grad[l.delta(t + 1)] += dd;
            grad[l.delta(t)] -= dd;

            let da = 2.0 * w.throttle_rate * (vars[l.a(t + 1)] - vars[l.a(t)]);
            grad[l.a(t + 1)] += da;
            grad[l.a(t)] -= da;
        }

        for t in 0..n - 1 {
            for &(c, weight) in [
                (StateChannel::Cte, w.cte_rate),
                (StateChannel::Epsi, w.epsi_rate)
            ].iter() {
                let d = 2.0 * weight * (vars[l.state(c, t + 1)] - vars[l.state(c, t)]);
                grad[l.state(c, t + 1)] += d;
                grad[l.state(c, t)] -= d;
            }

            let i_x = l.state(StateChannel::X, t);
            let i_v = l.state(StateChannel::V, t);
            let (_, d_dx, d_dv) = self.curvature_term(vars[i_x], vars[i_v]);
            grad[i_x] += d_dx;
            grad[i_v] += d_dv;
        }
    }

    fn constraint_jacobian(&self, vars: &[f64], triplets: &mut Vec<(usize, usize, f64)>) {
        use StateChannel::*;

        let l = &self.layout;
        let dt = self.timestep_s;
        let lf = self.model.lf_m;

        triplets.clear();

        for &c in StateChannel::ALL.iter() {
            triplets.push((l.state(c, 0), l.state(c, 0), 1.0));
        }

        for t in 1..l.horizon_len() {
            let p = t - 1;
            let s = VehicleState::from_vars(l, vars, p);
            let act = Actuation::from_vars(l, vars, p);

            let (sin_psi, cos_psi) = s.psi_rad.sin_cos();
            let (sin_epsi, cos_epsi) = s.epsi_rad.sin_cos();
            let d1 = self.curve.derivative(s.x_m);
            let d2 = self.curve.second_derivative(s.x_m);

            // Every row has +1 on its own variable at t
            for &c in StateChannel::ALL.iter() {
                triplets.push((l.state(c, t), l.state(c, t), 1.0));
            }

            let row = l.state(X, t);
            triplets.push((row, l.state(X, p), -1.0));
            triplets.push((row, l.state(V, p), -cos_psi * dt));
            triplets.push((row, l.state(Psi, p), s.v_ms * sin_psi * dt));

            let row = l.state(Y, t);
            triplets.push((row, l.state(Y, p), -1.0));
            triplets.push((row, l.state(V, p), -sin_psi * dt));
            triplets.push((row, l.state(Psi, p), -s.v_ms * cos_psi * dt));

            let row = l.state(Psi, t);
            triplets.push((row, l.state(Psi, p), -1.0));
            triplets.push((row, l.state(V, p), act.delta_rad * dt / lf));
            triplets.push((row, l.delta(p), s.v_ms * dt / lf));

            let row = l.state(V, t);
            triplets.push((row, l.state(V, p), -1.0));
            triplets.push((row, l.a(p), -dt));

            let row = l.state(Cte, t);
            triplets.push((row, l.state(X, p), -d1));
            triplets.push((row, l.state(Y, p), 1.0));
            triplets.push((row, l.state(V, p), -sin_epsi * dt));
            triplets.push((row, l.state(Epsi, p), -s.v_ms * cos_epsi * dt));

            let row = l.state(Epsi, t);
            triplets.push((row, l.state(Psi, p), -1.0));
            triplets.push((row, l.state(X, p), d2 / (1.0 + d1 * d1)));
            triplets.push((row, l.state(V, p), act.delta_rad * dt / lf));
            triplets.push((row, l.delta(p), s.v_ms * dt / lf));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use finitediff::FiniteDiff;

    fn problem() -> MpcProblem {
        let params = Params::default();
        let curve = ReferenceCurve::new(vec![0.5, 0.1, 0.02, 0.001]);
        MpcProblem::new(&params, VariableLayout::new(params.horizon_len), curve)
    }

    /// A decision vector with every entry different.
    fn test_vars(p: &MpcProblem) -> Vec<f64> {
        let l = p.layout();
        let mut vars = vec![0.0; l.num_variables()];

        for t in 0..l.horizon_len() {
            let tf = t as f64;
            vars[l.state(StateChannel::X, t)] = 1.0 + 4.8 * tf;
            vars[l.state(StateChannel::Y, t)] = 0.3 * tf - 0.01 * tf * tf;
            vars[l.state(StateChannel::Psi, t)] = 0.05 - 0.013 * tf;
            vars[l.state(StateChannel::V, t)] = 48.0 + 0.2 * tf;
            vars[l.state(StateChannel::Cte, t)] = 0.4 - 0.07 * tf;
            vars[l.state(StateChannel::Epsi, t)] = -0.1 + 0.02 * tf;
        }
        for t in 0..l.num_actuations() {
            let tf = t as f64;
            vars[l.delta(t)] = 0.02 * (tf - 3.0);
            vars[l.a(t)] = 0.5 - 0.11 * tf;
        }

        vars
    }

    #[test]
    fn test_residual_matches_model() {
        let p = problem();
        let l = *p.layout();
        let vars = test_vars(&p);

        let mut g = vec![0.0; l.num_constraints()];
        p.constraints(&vars, &mut g);

        for &c in StateChannel::ALL.iter() {
            assert_eq!(g[l.state(c, 0)], vars[l.state(c, 0)]);
        }

        for t in 1..l.horizon_len() {
            let prev = VehicleState::from_vars(&l, &vars, t - 1);
            let act = Actuation::from_vars(&l, &vars, t - 1);
            let model = KinematicModel::new(2.67).step(&prev, &act, p.curve(), 0.1);

            for &c in StateChannel::ALL.iter() {
                let row = l.state(c, t);
                assert_relative_eq!(vars[row] - g[row], model.channel(c), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_model_rollout_is_feasible() {
        let p = problem();
        let l = *p.layout();
        let mut vars = test_vars(&p);

        // Overwrite the states with a rollout of the model from t = 0
        for t in 1..l.horizon_len() {
            let next = p.predict(&vars, t);
            for &c in StateChannel::ALL.iter() {
                vars[l.state(c, t)] = next.channel(c);
            }
        }

        let mut g = vec![0.0; l.num_constraints()];
        p.constraints(&vars, &mut g);

        for t in 1..l.horizon_len() {
            for &c in StateChannel::ALL.iter() {
                assert_eq!(g[l.state(c, t)], 0.0);
            }
        }
    }

    #[test]
    fn test_objective_zero_on_target() {
        let params = Params::default();
        let l = VariableLayout::new(params.horizon_len);
        let p = MpcProblem::new(&params, l, ReferenceCurve::new(vec![0.0; 4]));

        let mut vars = vec![0.0; l.num_variables()];
        for t in 0..l.horizon_len() {
            vars[l.state(StateChannel::V, t)] = params.ref_speed_ms;
        }

        assert_eq!(p.objective(&vars), 0.0);
    }

    #[test]
    fn test_objective_gradient_matches_finite_diff() {
        let p = problem();
        let vars = test_vars(&p);

        let mut grad = vec![0.0; vars.len()];
        p.objective_gradient(&vars, &mut grad);

        let fd = vars.central_diff(&|x: &Vec<f64>| p.objective(x));

        for (a, b) in grad.iter().zip(fd.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-3, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_jacobian_matches_finite_diff() {
        let p = problem();
        let l = *p.layout();
        let vars = test_vars(&p);

        let mut triplets = Vec::new();
        p.constraint_jacobian(&vars, &mut triplets);

        let mut dense = vec![vec![0.0; l.num_variables()]; l.num_constraints()];
        for &(row, col, value) in triplets.iter() {
            dense[row][col] += value;
        }

        for row in 0..l.num_constraints() {
            let fd = vars.central_diff(&|x: &Vec<f64>| {
                let mut g = vec![0.0; l.num_constraints()];
                p.constraints(x, &mut g);
                g[row]
            });

            for col in 0..l.num_variables() {
                assert_relative_eq!(dense[row][col], fd[col], epsilon = 1e-5, max_relative = 1e-5);
            }
        }
    }
}
