//! Latency compensation
//!
//! Commands reach the actuators some time after the telemetry they were
//! computed from was sampled. During that window the vehicle keeps executing
//! the previous command, so the optimiser starts from the state predicted at
//! the end of the window rather than the measured one.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::trace;
use serde::Serialize;
use std::time::Duration;

use super::{Actuation, KinematicModel, Params, ReferenceCurve, VehicleState};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Projects the vehicle state forward over the actuation latency.
#[derive(Debug, Clone)]
pub struct LatencyCompensator {
    model: KinematicModel,

    max_latency_s: f64,

    default_latency_s: f64,
}

/// The latency chosen for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyEstimate {
    /// Units: seconds
    pub latency_s: f64,

    pub source: LatencySource,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Where a latency estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LatencySource {
    /// The time since the previous cycle.
    Measured,

    /// The measured time exceeded the maximum and was clamped.
    Clamped,

    /// No usable measurement, the default latency was used.
    Default,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl LatencyCompensator {
    pub fn new(params: &Params) -> Self {
        Self {
            model: KinematicModel::new(params.lf_m),
            max_latency_s: params.max_latency_s,
            default_latency_s: params.default_latency_s,
        }
    }

    /// Pick the latency to compensate for.
    ///
    /// `since_last_cycle` is `None` on the first cycle of a session.
    pub fn estimate(&self, since_last_cycle: Option<Duration>) -> LatencyEstimate {
        let measured_s = since_last_cycle.map(|d| d.as_secs_f64());

        match measured_s {
            Some(l) if l.is_finite() && l >= 0.0 => {
                if l >= self.max_latency_s {
                    LatencyEstimate {
                        latency_s: self.max_latency_s,
                        source: LatencySource::Clamped,
                    }
                }
                else {
                    LatencyEstimate {
                        latency_s: l,
                        source: LatencySource::Measured,
                    }
                }
            },
            _ => LatencyEstimate {
                latency_s: self.default_latency_s.min(self.max_latency_s),
                source: LatencySource::Default,
            },
        }
    }

    /// Predict the state at the end of the latency window, assuming the
    /// previous actuation is held for its whole length.
    pub fn compensate(
        &self,
        state: &VehicleState,
        prev_act: &Actuation,
        curve: &ReferenceCurve,
        latency_s: f64
    ) -> VehicleState {
        let comp = self.model.step(state, prev_act, curve, latency_s);

        trace!(
            "Latency compensation over {:.3} s: {:?} -> {:?}",
            latency_s, state, comp
        );

        comp
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn compensator() -> LatencyCompensator {
        LatencyCompensator::new(&Params::default())
    }

    #[test]
    fn test_first_cycle_uses_default() {
        let est = compensator().estimate(None);
        assert_eq!(est.source, LatencySource::Default);
        assert_relative_eq!(est.latency_s, 0.15);
    }

    #[test]
    fn test_latency_clamped() {
        let c = compensator();

        for &ms in [250u64, 260, 400, 10_000].iter() {
            let est = c.estimate(Some(Duration::from_millis(ms)));
            assert_eq!(est.latency_s, 0.25);
            assert_eq!(est.source, LatencySource::Clamped);
        }

        let est = c.estimate(Some(Duration::from_millis(120)));
        assert_relative_eq!(est.latency_s, 0.12);
        assert_eq!(est.source, LatencySource::Measured);
    }

    #[test]
    fn test_compensation_matches_closed_form() {
        let params = Params::default();
        let lf = params.lf_m;
        let c = LatencyCompensator::new(&params);

        // Curve with offset and slope at the origin, errors consistent with it
        let curve = ReferenceCurve::new(vec![0.4, -0.1, 0.01, 0.0]);
        let cte = curve.eval(0.0);
        let epsi = -curve.derivative(0.0).atan();
        let v = 12.0;
        let state = VehicleState {
            v_ms: v,
            cte_m: cte,
            epsi_rad: epsi,
            ..Default::default()
        };
        let prev = Actuation { delta_rad: 0.05, a: 0.3 };
        let lat = 0.1;

        let comp = c.compensate(&state, &prev, &curve, lat);

        assert_relative_eq!(comp.x_m, v * lat);
        assert_relative_eq!(comp.y_m, 0.0);
        assert_relative_eq!(comp.psi_rad, -v / lf * prev.delta_rad * lat);
        assert_relative_eq!(comp.v_ms, v + prev.a * lat);
        assert_relative_eq!(comp.cte_m, cte + v * epsi.sin() * lat, epsilon = 1e-12);
        assert_relative_eq!(
            comp.epsi_rad,
            epsi - v / lf * prev.delta_rad * lat,
            epsilon = 1e-12
        );
    }
}
