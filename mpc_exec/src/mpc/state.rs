//! Implementations for the MpcCtrl state structure

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, trace, warn};
use nalgebra::Point2;
use serde::Serialize;
use std::time::Instant;

// Internal
use super::{
    Actuation, AugLagSolver, InputError, LatencyCompensator, LatencySource, MpcInitError,
    Params, ParamsError, ReferenceCurve, SolveStatus, TrajOptimiser, VehicleState
};
use comms_if::telem::{SteerCmd, Telemetry};
use util::{
    archive::{ArchiveError, Archived, Archiver},
    maths::{lin_map, waypoints_to_local},
    module::State,
    params,
    session::{self, Session},
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Model predictive control module state
pub struct MpcCtrl {
    params: Params,

    compensator: LatencyCompensator,

    optimiser: TrajOptimiser<AugLagSolver>,

    session_state: SessionState,

    report: Option<StatusReport>,
    arch_report: Archiver,
}

/// State carried from one cycle to the next within a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionState {
    /// When the previous cycle was processed, used to measure latency.
    pub last_cycle: Option<Instant>,

    /// The last actuation commanded by this controller.
    pub last_command: Option<Actuation>,
}

/// Input data to MpcCtrl.
#[derive(Debug, Clone)]
pub struct InputData {
    /// The telemetry for this cycle.
    pub telemetry: Telemetry,

    /// When the telemetry was received.
    pub timestamp: Instant,
}

/// Output from MpcCtrl.
#[derive(Debug, Clone)]
pub struct OutputData {
    /// The command frame contents to send to the simulator.
    pub steer_cmd: SteerCmd,

    /// The commanded actuation in physical units.
    pub actuation: Actuation,

    /// True if the solve failed and a previous command is being reused.
    pub fallback: bool,
}

/// Status report for MpcCtrl processing.
///
/// Flat so it can be archived as a CSV row.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Session time of the cycle.
    ///
    /// Units: seconds
    pub time_s: f64,

    pub latency_s: f64,
    pub latency_source: LatencySource,

    pub solve_status: SolveStatus,
    pub cost: f64,
    pub iterations: u64,
    pub solve_time_s: f64,
    pub constraint_violation: f64,

    pub fallback: bool,

    pub steer_rad: f64,
    pub throttle: f64,

    pub speed_ms: f64,
    pub cte_m: f64,
    pub epsi_rad: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl MpcCtrl {
    /// Create a controller from the given parameters, without archiving.
    pub fn new(params: Params) -> Result<Self, ParamsError> {
        params.validate()?;

        Ok(Self::from_valid(params))
    }

    /// Build the controller from parameters which have passed validation.
    fn from_valid(params: Params) -> Self {
        Self {
            compensator: LatencyCompensator::new(&params),
            optimiser: TrajOptimiser::new(
                params.clone(),
                AugLagSolver::new(params.solver.clone())
            ),
            params,
            session_state: SessionState::default(),
            report: None,
            arch_report: Archiver::default(),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session_state
    }

    /// Continue a session from a previously saved state.
    pub fn restore_session(&mut self, state: SessionState) {
        self.session_state = state;
    }

    /// The report from the last successfully processed cycle.
    pub fn report(&self) -> Option<&StatusReport> {
        self.report.as_ref()
    }

    /// Check the telemetry and build the vehicle frame reference.
    ///
    /// Returns the waypoints in the vehicle frame and the fitted curve.
    fn prepare(&self, telem: &Telemetry)
        -> Result<(Vec<f64>, Vec<f64>, ReferenceCurve), InputError>
    {
        if telem.ptsx.len() != telem.ptsy.len() {
            return Err(InputError::MismatchedWaypoints {
                xs: telem.ptsx.len(),
                ys: telem.ptsy.len(),
            });
        }

        let scalars = [
            ("x", telem.x),
            ("y", telem.y),
            ("psi", telem.psi),
            ("speed", telem.speed),
            ("steering_angle", telem.steering_angle),
            ("throttle", telem.throttle),
        ];
        for &(name, value) in scalars.iter() {
            if !value.is_finite() {
                return Err(InputError::NonFinite(name));
            }
        }
        if telem.ptsx.iter().chain(telem.ptsy.iter()).any(|v| !v.is_finite()) {
            return Err(InputError::NonFinite("waypoints"));
        }

        let (xs, ys) = waypoints_to_local(
            &telem.ptsx,
            &telem.ptsy,
            Point2::new(telem.x, telem.y),
            telem.psi
        );

        let curve = ReferenceCurve::fit(&xs, &ys, self.params.curve_order)
            .map_err(InputError::CurveFit)?;

        Ok((xs, ys, curve))
    }

    /// Normalise a steering angle into [-1, 1].
    fn normalise_steer(&self, delta_rad: f64) -> f64 {
        lin_map(
            (-self.params.max_steer_rad, self.params.max_steer_rad),
            (-1.0, 1.0),
            delta_rad
        )
    }

    /// Convert a normalised steering value back into an angle.
    fn denormalise_steer(&self, steer: f64) -> f64 {
        lin_map(
            (-1.0, 1.0),
            (-self.params.max_steer_rad, self.params.max_steer_rad),
            steer
        )
    }
}

impl Default for MpcCtrl {
    /// Controller with the default parameters, which are always valid.
    fn default() -> Self {
        Self::from_valid(Params::default())
    }
}

impl State for MpcCtrl {
    type InitData = &'static str;
    type InitError = MpcInitError;

    type InputData = InputData;
    type OutputData = OutputData;
    type StatusReport = StatusReport;
    type ProcError = InputError;

    /// Initialise the MpcCtrl module.
    ///
    /// Expected init data is the path to the parameter file
    fn init(&mut self, init_data: Self::InitData, session: &Session)
        -> Result<(), Self::InitError>
    {
        // Load the parameters
        let params: Params = params::load(init_data)
            .map_err(MpcInitError::LoadError)?;

        *self = Self::new(params).map_err(MpcInitError::InvalidParams)?;

        // Initialise the archiver
        self.arch_report = Archiver::from_path(session, "mpc_ctrl/status_report.csv")
            .map_err(MpcInitError::ArchiveError)?;

        Ok(())
    }

    /// Perform cyclic processing of MPC.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>
    {
        let telem = &input_data.telemetry;

        // ---- REFERENCE ----

        let (next_x, next_y, curve) = self.prepare(telem)?;

        // ---- LATENCY COMPENSATION ----

        let v_ms = telem.speed * self.params.speed_to_ms;
        let state = VehicleState {
            v_ms,
            cte_m: curve.eval(0.0),
            epsi_rad: -curve.derivative(0.0).atan(),
            ..Default::default()
        };

        // The vehicle is executing whatever it last reported
        let prev_act = Actuation {
            delta_rad: self.denormalise_steer(telem.steering_angle),
            a: telem.throttle,
        };

        let since_last = self.session_state.last_cycle
            .map(|t| input_data.timestamp.saturating_duration_since(t));
        let latency = self.compensator.estimate(since_last);

        let init = self.compensator.compensate(&state, &prev_act, &curve, latency.latency_s);

        trace!("MpcCtrl init state: {:?}", init);

        // ---- SOLVE ----

        let result = self.optimiser.solve(&init, &curve);

        let (actuation, fallback) = match result.actuation {
            Some(a) if result.is_success() => (a, false),
            _ => {
                let a = self.session_state.last_command.unwrap_or_default();
                warn!(
                    "MPC solve failed ({:?}), holding previous command {:?}",
                    result.status, a
                );
                (a, true)
            }
        };

        self.session_state.last_cycle = Some(input_data.timestamp);
        self.session_state.last_command = Some(actuation);

        // ---- OUTPUT ----

        let steer_cmd = SteerCmd {
            steering_angle: self.normalise_steer(actuation.delta_rad),
            throttle: actuation.a,
            mpc_x: result.pred_x_m.clone(),
            mpc_y: result.pred_y_m.clone(),
            next_x,
            next_y,
        };

        debug!(
            "MpcCtrl output: steer {:.4} ({:.4} rad), throttle {:.4}",
            steer_cmd.steering_angle, actuation.delta_rad, actuation.a
        );

        let report = StatusReport {
            time_s: session::get_elapsed_seconds(),
            latency_s: latency.latency_s,
            latency_source: latency.source,
            solve_status: result.status,
            cost: result.cost,
            iterations: result.iterations,
            solve_time_s: result.solve_time_s,
            constraint_violation: result.constraint_violation,
            fallback,
            steer_rad: actuation.delta_rad,
            throttle: actuation.a,
            speed_ms: v_ms,
            cte_m: state.cte_m,
            epsi_rad: state.epsi_rad,
        };
        self.report = Some(report.clone());

        Ok((
            OutputData {
                steer_cmd,
                actuation,
                fallback,
            },
            report
        ))
    }

    fn reset(&mut self) {
        debug!("MpcCtrl session state reset");
        self.session_state = SessionState::default();
        self.report = None;
    }
}

impl Archived for MpcCtrl {
    fn write(&mut self) -> Result<(), ArchiveError> {
        if let Some(ref report) = self.report {
            self.arch_report.serialise(report)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn test_ctrl(ref_speed_ms: f64) -> MpcCtrl {
        let mut params = Params::default();
        params.ref_speed_ms = ref_speed_ms;
        params.solver.max_cpu_time_s = 5.0;
        MpcCtrl::new(params).unwrap()
    }

    /// Telemetry for a vehicle at `(x, y)` heading along `psi` with waypoints
    /// straight ahead of it.
    fn straight_telem(x: f64, y: f64, psi: f64, speed_mph: f64) -> Telemetry {
        let (ptsx, ptsy) = (0..6)
            .map(|i| {
                let d = i as f64 * 10.0;
                (x + d * psi.cos(), y + d * psi.sin())
            })
            .unzip();

        Telemetry {
            ptsx,
            ptsy,
            x,
            y,
            psi,
            speed: speed_mph,
            steering_angle: 0.0,
            throttle: 0.0,
        }
    }

    #[test]
    fn test_straight_cycle() {
        let mut ctrl = test_ctrl(20.0);
        let speed_mph = 20.0 / 0.44704;

        let input = InputData {
            telemetry: straight_telem(100.0, -40.0, 0.7, speed_mph),
            timestamp: Instant::now(),
        };

        let (out, report) = ctrl.proc(&input).unwrap();

        assert!(!out.fallback);
        assert_eq!(report.solve_status, SolveStatus::Success);
        assert_eq!(report.latency_source, LatencySource::Default);
        assert_relative_eq!(report.speed_ms, 20.0, epsilon = 1e-9);
        assert_relative_eq!(report.cte_m, 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.steer_cmd.steering_angle, 0.0, epsilon = 1e-2);
        assert_relative_eq!(out.steer_cmd.throttle, 0.0, epsilon = 1e-2);

        // Waypoints end up ahead of the vehicle on the local x axis
        assert_eq!(out.steer_cmd.next_x.len(), 6);
        assert_relative_eq!(out.steer_cmd.next_x[5], 50.0, epsilon = 1e-9);
        assert_relative_eq!(out.steer_cmd.next_y[5], 0.0, epsilon = 1e-9);
        assert_eq!(out.steer_cmd.mpc_x.len(), 9);

        assert_eq!(ctrl.session_state().last_command, Some(out.actuation));
    }

    #[test]
    fn test_latency_measured_between_cycles() {
        let mut ctrl = test_ctrl(20.0);
        let t0 = Instant::now();
        let telem = straight_telem(0.0, 0.0, 0.0, 20.0 / 0.44704);

        ctrl.proc(&InputData { telemetry: telem.clone(), timestamp: t0 }).unwrap();

        let (_, report) = ctrl.proc(&InputData {
            telemetry: telem.clone(),
            timestamp: t0 + Duration::from_millis(100),
        }).unwrap();
        assert_eq!(report.latency_source, LatencySource::Measured);
        assert_relative_eq!(report.latency_s, 0.1, epsilon = 1e-9);

        let (_, report) = ctrl.proc(&InputData {
            telemetry: telem.clone(),
            timestamp: t0 + Duration::from_millis(1100),
        }).unwrap();
        assert_eq!(report.latency_source, LatencySource::Clamped);
        assert_eq!(report.latency_s, 0.25);

        // A new session starts over with the default latency
        ctrl.reset();
        assert!(ctrl.session_state().last_command.is_none());
        let (_, report) = ctrl.proc(&InputData {
            telemetry: telem,
            timestamp: t0 + Duration::from_millis(1200),
        }).unwrap();
        assert_eq!(report.latency_source, LatencySource::Default);
    }

    #[test]
    fn test_mismatched_waypoints_rejected() {
        let mut ctrl = test_ctrl(20.0);
        let telem = straight_telem(0.0, 0.0, 0.0, 20.0 / 0.44704);

        let (out, _) = ctrl.proc(&InputData {
            telemetry: telem.clone(),
            timestamp: Instant::now(),
        }).unwrap();

        let mut bad = telem;
        bad.ptsy.pop();

        let res = ctrl.proc(&InputData { telemetry: bad, timestamp: Instant::now() });

        assert!(matches!(
            res,
            Err(InputError::MismatchedWaypoints { xs: 6, ys: 5 })
        ));
        assert_eq!(ctrl.session_state().last_command, Some(out.actuation));
    }

    #[test]
    fn test_bad_telemetry_rejected() {
        let mut ctrl = test_ctrl(20.0);

        let mut telem = straight_telem(0.0, 0.0, 0.0, 10.0);
        telem.psi = f64::NAN;
        assert!(matches!(
            ctrl.proc(&InputData { telemetry: telem, timestamp: Instant::now() }),
            Err(InputError::NonFinite("psi"))
        ));

        let mut telem = straight_telem(0.0, 0.0, 0.0, 10.0);
        telem.ptsx.truncate(3);
        telem.ptsy.truncate(3);
        assert!(matches!(
            ctrl.proc(&InputData { telemetry: telem, timestamp: Instant::now() }),
            Err(InputError::CurveFit(_))
        ));

        assert!(ctrl.session_state().last_command.is_none());
        assert!(ctrl.session_state().last_cycle.is_none());
    }

    #[test]
    fn test_failed_solve_falls_back() {
        let mut params = Params::default();
        params.ref_speed_ms = 20.0;
        params.solver.max_cpu_time_s = 5.0;
        let mut ctrl = MpcCtrl::new(params.clone()).unwrap();
        let telem = straight_telem(0.0, 0.0, 0.0, 20.0 / 0.44704);

        let (first, _) = ctrl.proc(&InputData {
            telemetry: telem.clone(),
            timestamp: Instant::now(),
        }).unwrap();

        // Swap in a solver with no time budget, every solve now times out
        params.solver.max_cpu_time_s = 1e-12;
        ctrl.optimiser = TrajOptimiser::new(params.clone(), AugLagSolver::new(params.solver.clone()));

        let (out, report) = ctrl.proc(&InputData {
            telemetry: telem,
            timestamp: Instant::now(),
        }).unwrap();

        assert!(out.fallback);
        assert!(report.fallback);
        assert_eq!(report.solve_status, SolveStatus::Timeout);
        assert_eq!(out.actuation, first.actuation);
        assert!(out.steer_cmd.mpc_x.is_empty());
    }

    #[test]
    fn test_fallback_without_history_is_zero() {
        let mut params = Params::default();
        params.solver.max_cpu_time_s = 1e-12;
        let mut ctrl = MpcCtrl::new(params).unwrap();

        let (out, _) = ctrl.proc(&InputData {
            telemetry: straight_telem(0.0, 0.0, 0.0, 10.0),
            timestamp: Instant::now(),
        }).unwrap();

        assert!(out.fallback);
        assert_eq!(out.actuation, Actuation::default());
        assert_eq!(out.steer_cmd.steering_angle, 0.0);
    }

    #[test]
    fn test_steer_normalisation() {
        let ctrl = MpcCtrl::default();

        assert_relative_eq!(ctrl.normalise_steer(0.436332), 1.0);
        assert_relative_eq!(ctrl.normalise_steer(-0.218166), -0.5);
        assert_relative_eq!(ctrl.denormalise_steer(0.5), 0.218166);
    }

    #[test]
    fn test_default_matches_validated() {
        let default = MpcCtrl::default();
        let validated = MpcCtrl::new(Params::default()).unwrap();

        assert!(default.params().validate().is_ok());
        assert_eq!(default.params().horizon_len, validated.params().horizon_len);
        assert_eq!(
            default.params().solver.max_cpu_time_s,
            validated.params().solver.max_cpu_time_s
        );
        assert!(default.session_state().last_command.is_none());
        assert!(default.report().is_none());
    }
}
