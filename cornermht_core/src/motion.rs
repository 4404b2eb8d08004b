//! Constant-velocity Kalman model shared by all tracks.
//!
//! A state estimate carries the mean (x, ẋ, y, ẏ), its covariance, and a
//! lazily computed "derived" record with everything the filter can work
//! out before seeing a report: the prediction, the innovation-covariance
//! inverse, the gain, the next covariance and the Gaussian normalisation
//! coefficient. The derived record is only built when a state first
//! takes part in gating, and it is dropped with the owning tree node.

use crate::config::TrackerParams;
use crate::error::NumericError;
use crate::linalg::{invert2, is_spd, symmetrize, Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use crate::patch::{Patch, PatchTest};
use crate::report::Report;

/// Constant part of the Gaussian likelihood normalisation for the
/// two-dimensional measurement space.
pub const LOG_NORM_FACTOR: f64 = 1.5963597;

/// Floor added to probabilities before taking logs.
pub const PROB_EPSILON: f64 = 1e-14;

/// Time step between scans; one frame per scan.
pub const TIME_STEP: f64 = 1.0;

fn transition_matrix() -> Matrix4 {
    let ds = TIME_STEP;
    Matrix4::new(
        1.0, ds, 0.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 1.0, ds,
        0.0, 0.0, 0.0, 1.0,
    )
}

fn process_covariance(process_variance: f64) -> Matrix4 {
    let ds = TIME_STEP;
    let ds2 = ds * ds;
    let ds3 = ds2 * ds;
    Matrix4::new(
        ds3 / 3.0, ds2 / 2.0, 0.0, 0.0,
        ds2 / 2.0, ds, 0.0, 0.0,
        0.0, 0.0, ds3 / 3.0, ds2 / 2.0,
        0.0, 0.0, ds2 / 2.0, ds,
    ) * process_variance
}

fn measurement_matrix() -> Matrix2x4 {
    Matrix2x4::new(
        1.0, 0.0, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
    )
}

/// Report-independent filter quantities, computed once per state.
#[derive(Debug, Clone)]
struct Derived {
    /// Predicted mean F·x.
    x1: Vector4,
    /// Inverse innovation covariance S⁻¹.
    s_inv: Matrix2,
    /// Filter gain W = P1·Hᵀ·S⁻¹.
    gain: Matrix4x2,
    /// Updated covariance P1 − W·S·Wᵀ.
    p_next: Matrix4,
    /// −(LOG_NORM_FACTOR + ln det S / 2).
    log_norm_coef: f64,
}

/// One Kalman estimate inside a hypothesis node.
#[derive(Debug, Clone)]
pub struct KalmanState {
    x: Vector4,
    p: Matrix4,
    num_skipped: u32,
    /// Log-likelihood increment of the edge that produced this state.
    log_likelihood: f64,
    patch: Patch,
    derived: Option<Box<Derived>>,
}

impl KalmanState {
    pub fn x(&self) -> f64 {
        self.x[0]
    }

    pub fn y(&self) -> f64 {
        self.x[2]
    }

    pub fn vx(&self) -> f64 {
        self.x[1]
    }

    pub fn vy(&self) -> f64 {
        self.x[3]
    }

    pub fn mean(&self) -> &Vector4 {
        &self.x
    }

    pub fn covariance(&self) -> &Matrix4 {
        &self.p
    }

    pub fn num_skipped(&self) -> u32 {
        self.num_skipped
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    /// Whether the covariance is symmetric positive-definite.
    pub fn covariance_is_spd(&self) -> bool {
        is_spd(&self.p)
    }

    /// A track that has just started carries no velocity estimate yet.
    fn is_unseeded(&self) -> bool {
        self.x[1] == 0.0 && self.x[3] == 0.0
    }

    /// Computes the derived record if this state doesn't have one yet.
    fn setup(&mut self, model: &MotionModel) -> Result<&Derived, NumericError> {
        if self.derived.is_none() {
            let f = transition_matrix();
            let q = process_covariance(model.process_variance);
            let h = measurement_matrix();

            let p1 = f * self.p * f.transpose() + q;
            let s = h * p1 * h.transpose() + model.r;
            let det = s.determinant();
            if !det.is_finite() || det <= 0.0 {
                return Err(NumericError::singular("innovation covariance"));
            }
            let s_inv = invert2(&s, "innovation covariance")?;
            let gain = p1 * h.transpose() * s_inv;
            let mut p_next = p1 - gain * s * gain.transpose();
            symmetrize(&mut p_next);

            self.derived = Some(Box::new(Derived {
                x1: f * self.x,
                s_inv,
                gain,
                p_next,
                log_norm_coef: -(LOG_NORM_FACTOR + det.ln() / 2.0),
            }));
        }
        Ok(self.derived.as_deref().expect("derived record just built"))
    }
}

/// The shared constant-velocity model: builds new states from old ones
/// and scores the hypothesis edges between them.
#[derive(Debug, Clone)]
pub struct MotionModel {
    start_log_lik: f64,
    /// Decay constant of the ending probability (probEnd).
    lambda_x: f64,
    skip_log_lik: f64,
    detect_log_lik: f64,
    max_distance: f64,
    process_variance: f64,
    intensity_variance: f64,
    intensity_threshold: f64,
    patch_test: PatchTest,
    /// Measurement covariance R.
    r: Matrix2,
    /// Covariance of a freshly started track.
    start_p: Matrix4,
}

impl MotionModel {
    pub fn new(params: &TrackerParams) -> Self {
        Self {
            start_log_lik: params.mean_new.ln(),
            lambda_x: params.prob_end,
            skip_log_lik: (1.0 - params.prob_detect).ln(),
            detect_log_lik: params.prob_detect.ln(),
            max_distance: params.max_distance2,
            process_variance: params.process_variance,
            intensity_variance: params.intensity_variance,
            intensity_threshold: params.intensity_threshold,
            patch_test: params.patch_test,
            r: Matrix2::new(
                params.position_variance_x, 0.0,
                0.0, params.position_variance_y,
            ),
            start_p: Matrix4::from_diagonal(&Vector4::new(
                params.position_variance_x,
                params.state_variance,
                params.position_variance_y,
                params.state_variance,
            )),
        }
    }

    /// State of a track started from a single report: position taken
    /// from the report, zero velocity, start covariance and likelihood.
    pub fn initial_state(&self, report: &Report) -> KalmanState {
        KalmanState {
            x: Vector4::new(report.x, 0.0, report.y, 0.0),
            p: self.start_p,
            num_skipped: 0,
            log_likelihood: self.start_log_lik,
            patch: report.patch,
            derived: None,
        }
    }

    /// Runs the validation gate for (state, report) and, on acceptance,
    /// returns the updated continuation state.
    ///
    /// The gate is the Mahalanobis test against `maxDistance` followed
    /// by the patch score against `intensityThreshold`. A state that has
    /// not yet acquired a velocity estimate seeds it from the candidate
    /// report, making the prediction land on the report exactly.
    pub fn validate(
        &self,
        state: &mut KalmanState,
        report: &Report,
    ) -> Result<Option<KalmanState>, NumericError> {
        let unseeded = state.is_unseeded();
        let prev_patch = state.patch;
        let (px, py) = (state.x[0], state.x[2]);
        let derived = state.setup(self)?;

        let (x1, innovation, dist2) = if unseeded {
            let x1 = Vector4::new(report.x, report.x - px, report.y, report.y - py);
            (x1, Vector2::zeros(), 0.0)
        } else {
            let x1 = derived.x1;
            let v = Vector2::new(report.x - x1[0], report.y - x1[2]);
            let dist2 = v.dot(&(derived.s_inv * v));
            (x1, v, dist2)
        };

        if dist2 > self.max_distance {
            return Ok(None);
        }

        let score = self
            .patch_test
            .score(&prev_patch, &report.patch, self.intensity_variance);
        if score < self.intensity_threshold {
            return Ok(None);
        }

        Ok(Some(KalmanState {
            x: x1 + derived.gain * innovation,
            p: derived.p_next,
            num_skipped: 0,
            log_likelihood: derived.log_norm_coef - dist2 / 2.0,
            patch: report.patch,
            derived: None,
        }))
    }

    /// Continuation when no report is associated this scan: the state
    /// coasts on its prediction and the skip count grows.
    pub fn skip_state(&self, state: &mut KalmanState) -> Result<KalmanState, NumericError> {
        let num_skipped = state.num_skipped + 1;
        let patch = state.patch;
        let derived = state.setup(self)?;
        Ok(KalmanState {
            x: derived.x1,
            p: derived.p_next,
            num_skipped,
            log_likelihood: 0.0,
            patch,
            derived: None,
        })
    }

    fn end_prob(&self, state: &KalmanState) -> f64 {
        let m = f64::from(state.num_skipped);
        let p = 1.0 - (-m / self.lambda_x).exp();
        if p == 0.0 {
            PROB_EPSILON
        } else {
            p
        }
    }

    /// Log-likelihood that the track has ended, given its skip count.
    pub fn log_likelihood_end(&self, state: &KalmanState) -> f64 {
        self.end_prob(state).ln()
    }

    /// Log-likelihood that the track continues past this scan.
    pub fn log_likelihood_continue(&self, state: &KalmanState) -> f64 {
        (1.0 - self.end_prob(state)).ln()
    }

    /// Log-likelihood of not detecting a live track this scan.
    pub fn log_likelihood_skip(&self) -> f64 {
        self.skip_log_lik
    }

    /// Log-likelihood of detecting a live track this scan.
    pub fn log_likelihood_detect(&self) -> f64 {
        self.detect_log_lik
    }

    /// Log-likelihood of a track starting on a given report.
    pub fn start_log_likelihood(&self) -> f64 {
        self.start_log_lik
    }
}
