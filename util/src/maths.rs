//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Point2, Rotation2, Vector2};
use num_traits::Float;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Map a value from one range into another.
pub fn lin_map<T>(source_range: (T, T), target_range: (T, T), value: T) -> T
where
    T: Float
{
    target_range.0
        + ((value - source_range.0)
        * (target_range.1 - target_range.0)
        / (source_range.1 - source_range.0))
}

/// Transform a point from the global (map) frame into the vehicle frame.
///
/// The vehicle frame has its origin at `(px, py)` and its x axis pointing
/// along the heading `psi_rad`, so the vehicle itself sits at the origin with
/// zero heading.
pub fn global_to_local(
    point_m_g: Point2<f64>,
    vehicle_m_g: Point2<f64>,
    psi_rad: f64
) -> Point2<f64> {
    let offset: Vector2<f64> = point_m_g - vehicle_m_g;
    Point2::from(Rotation2::new(-psi_rad) * offset)
}

/// Transform a sequence of global waypoints into the vehicle frame.
///
/// The inputs must have the same length, pairs are formed by zipping them.
pub fn waypoints_to_local(
    xs_m_g: &[f64],
    ys_m_g: &[f64],
    vehicle_m_g: Point2<f64>,
    psi_rad: f64
) -> (Vec<f64>, Vec<f64>) {
    xs_m_g
        .iter()
        .zip(ys_m_g.iter())
        .map(|(&x, &y)| {
            let p = global_to_local(Point2::new(x, y), vehicle_m_g, psi_rad);
            (p.x, p.y)
        })
        .unzip()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_lin_map() {
        assert_eq!(lin_map((-0.5f64, 0.5), (-1.0, 1.0), 0.25), 0.5);
        assert_eq!(lin_map((0f64, 10.0), (0.0, 1.0), 10.0), 1.0);
    }

    #[test]
    fn test_global_to_local_translation() {
        let p = global_to_local(Point2::new(3.0, 4.0), Point2::new(1.0, 1.0), 0.0);
        assert_relative_eq!(p.x, 2.0);
        assert_relative_eq!(p.y, 3.0);
    }

    #[test]
    fn test_global_to_local_rotation() {
        // Vehicle facing +y, a point ahead of it along +y lies on the local +x
        // axis, and a point to the global -x is on the vehicle's left (+y).
        let ahead = global_to_local(Point2::new(0.0, 5.0), Point2::origin(), FRAC_PI_2);
        assert_relative_eq!(ahead.x, 5.0, epsilon = 1e-12);
        assert_relative_eq!(ahead.y, 0.0, epsilon = 1e-12);

        let left = global_to_local(Point2::new(-2.0, 0.0), Point2::origin(), FRAC_PI_2);
        assert_relative_eq!(left.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(left.y, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_waypoints_to_local() {
        let (xs, ys) = waypoints_to_local(
            &[1.0, 2.0, 3.0],
            &[1.0, 1.0, 1.0],
            Point2::new(1.0, 1.0),
            0.0
        );
        assert_eq!(xs, vec![0.0, 1.0, 2.0]);
        assert_eq!(ys, vec![0.0, 0.0, 0.0]);
    }
}
