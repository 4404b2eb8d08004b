//! Multiple-hypothesis tracker for corner features in image sequences.
//!
//! Given a time-ordered stream of frames, each carrying 2D corner
//! positions with a 5×5 intensity patch around each corner, the tracker
//! recovers persistent point trajectories by reasoning jointly over
//! competing data-association hypotheses inside a sliding N-scan
//! window:
//!
//! 1. **Gate**: each live hypothesis predicts with a constant-velocity
//!    Kalman filter and validates reports by Mahalanobis distance plus
//!    a patch-correlation test.
//! 2. **Cluster**: trees whose leaves compete for the same reports are
//!    grouped; each cluster ranks its K best global hypotheses through
//!    a generalised-assignment solver.
//! 3. **Prune**: once ambiguity slides out of the window, the root
//!    decision commits, confirmed track elements are emitted, and
//!    reports no hypothesis claimed become false alarms.

pub mod assign;
pub mod cluster;
pub mod config;
pub mod error;
pub mod io;
pub mod linalg;
pub mod motion;
pub mod patch;
pub mod report;
pub mod scanner;
pub mod tracker;
pub mod tree;

// Re-export key types for convenience
pub use config::TrackerParams;
pub use error::{NumericError, TrackError};
pub use patch::{Patch, PatchTest};
pub use report::{Report, ReportId};
pub use scanner::{ConfirmedElement, FalseAlarm, Phase};
pub use tracker::{Corner, CornerTracker};
pub use tree::TrackId;
