//! Reference curve fitting
//!
//! The waypoints ahead of the vehicle are converted into the vehicle frame
//! and a low order polynomial `y = c0 + c1 x + c2 x^2 + ...` is fitted to
//! them by least squares.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{DMatrix, DVector};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Smallest ratio between the smallest and largest diagonal entries of the
/// fit's R factor before the system is treated as singular.
const MIN_PIVOT_RATIO: f64 = 1e-12;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A polynomial reference curve in the vehicle frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCurve {
    /// Coefficients in ascending power order.
    coeffs: Vec<f64>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CurveFitError {
    #[error("Fitting an order {order} curve needs at least {} points, found {points}", order + 1)]
    TooFewPoints { points: usize, order: usize },

    #[error("Waypoint x and y lists have different lengths ({xs} and {ys})")]
    LengthMismatch { xs: usize, ys: usize },

    #[error("The waypoints do not define a unique curve (repeated x values?)")]
    Singular,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ReferenceCurve {
    /// Create a curve from its coefficients, in ascending power order.
    pub fn new(coeffs: Vec<f64>) -> Self {
        Self { coeffs }
    }

    /// Least squares fit of an `order` polynomial through the points.
    pub fn fit(xs: &[f64], ys: &[f64], order: usize) -> Result<Self, CurveFitError> {
        if xs.len() != ys.len() {
            return Err(CurveFitError::LengthMismatch {
                xs: xs.len(),
                ys: ys.len()
            });
        }

        let num_coeffs = order + 1;
        if xs.len() < num_coeffs {
            return Err(CurveFitError::TooFewPoints {
                points: xs.len(),
                order
            });
        }

        // Vandermonde matrix, A c = y
        let a = DMatrix::from_fn(xs.len(), num_coeffs, |i, j| xs[i].powi(j as i32));
        let b = DVector::from_column_slice(ys);

        let qr = a.qr();
        let q = qr.q();
        let r = qr.r();

        // Reject rank deficient systems rather than returning a garbage fit
        let diag = r.diagonal().map(f64::abs);
        let max_pivot = diag.max();
        if !(max_pivot > 0.0) || diag.min() < MIN_PIVOT_RATIO * max_pivot {
            return Err(CurveFitError::Singular);
        }

        let coeffs = r
            .solve_upper_triangular(&(q.transpose() * b))
            .ok_or(CurveFitError::Singular)?;

        if coeffs.iter().any(|c| !c.is_finite()) {
            return Err(CurveFitError::Singular);
        }

        Ok(Self {
            coeffs: coeffs.iter().cloned().collect()
        })
    }

    /// The coefficients, in ascending power order.
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// Evaluate the curve at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        self.nth_derivative(x, 0)
    }

    /// Evaluate the first derivative (slope) at `x`.
    pub fn derivative(&self, x: f64) -> f64 {
        self.nth_derivative(x, 1)
    }

    pub fn second_derivative(&self, x: f64) -> f64 {
        self.nth_derivative(x, 2)
    }

    pub fn third_derivative(&self, x: f64) -> f64 {
        self.nth_derivative(x, 3)
    }

    /// Unsigned curvature at `x`, `|f''| / (1 + f'^2)^1.5`.
    pub fn curvature(&self, x: f64) -> f64 {
        let slope = self.derivative(x);
        self.second_derivative(x).abs() / (1.0 + slope * slope).powf(1.5)
    }

    /// Evaluate the `n`th derivative at `x` using Horner's method.
    pub fn nth_derivative(&self, x: f64, n: usize) -> f64 {
        self.coeffs
            .iter()
            .enumerate()
            .skip(n)
            .rev()
            .fold(0.0, |acc, (i, &c)| {
                // i! / (i - n)!
                let factor: f64 = ((i - n + 1)..=i).map(|k| k as f64).product();
                acc * x + c * factor
            })
    }
}
