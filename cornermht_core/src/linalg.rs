//! Fixed-size matrix support for the Kalman filter.
//!
//! The state space is 4-dimensional (x, ẋ, y, ẏ) and the measurement
//! space 2-dimensional (x, y), so everything here is a stack-allocated
//! nalgebra type. Inversion is checked: a singular matrix surfaces a
//! [`NumericError`] which callers treat as a non-validating hypothesis.

use crate::error::NumericError;

pub type Vector2 = nalgebra::Vector2<f64>;
pub type Vector4 = nalgebra::Vector4<f64>;
pub type Matrix2 = nalgebra::Matrix2<f64>;
pub type Matrix4 = nalgebra::Matrix4<f64>;
pub type Matrix2x4 = nalgebra::Matrix2x4<f64>;
pub type Matrix4x2 = nalgebra::Matrix4x2<f64>;

/// Relative tolerance for symmetry checks.
const SYMMETRY_TOL: f64 = 1e-9;

/// Inverts a 2×2 matrix, failing on singular input.
pub fn invert2(m: &Matrix2, what: &str) -> Result<Matrix2, NumericError> {
    let det = m.determinant();
    if !det.is_finite() || det.abs() < f64::MIN_POSITIVE {
        return Err(NumericError::singular(what));
    }
    m.try_inverse().ok_or_else(|| NumericError::singular(what))
}

/// Inverts a 4×4 matrix, failing on singular input.
pub fn invert4(m: &Matrix4, what: &str) -> Result<Matrix4, NumericError> {
    m.try_inverse().ok_or_else(|| NumericError::singular(what))
}

/// Checks that a 4×4 matrix is symmetric to within a relative tolerance.
pub fn is_symmetric(m: &Matrix4) -> bool {
    for i in 0..4 {
        for j in (i + 1)..4 {
            let a = m[(i, j)];
            let b = m[(j, i)];
            let scale = a.abs().max(b.abs()).max(1.0);
            if (a - b).abs() > SYMMETRY_TOL * scale {
                return false;
            }
        }
    }
    true
}

/// Checks that a 4×4 covariance is symmetric positive-definite.
pub fn is_spd(m: &Matrix4) -> bool {
    is_symmetric(m) && m.cholesky().is_some()
}

/// Symmetrises a covariance in place, damping the drift that builds up
/// from repeated P − WSWᵀ updates.
pub fn symmetrize(m: &mut Matrix4) {
    let t = m.transpose();
    *m = (*m + t) * 0.5;
}
