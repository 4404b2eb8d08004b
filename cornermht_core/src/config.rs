//! Tracker parameters and the line-oriented parameter file.
//!
//! The parameter file carries one value per line, in a fixed order;
//! lines beginning with ';' are comments. Every value is parsed and
//! kept even when the constant-velocity model does not consume it, so
//! existing parameter files keep working unchanged.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrackError;
use crate::patch::PatchTest;

/// Runtime configuration for the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerParams {
    pub position_variance_x: f64,
    pub position_variance_y: f64,
    pub gradient_variance: f64,
    pub intensity_variance: f64,
    pub process_variance: f64,
    pub prob_detect: f64,
    /// Decay constant of the track-ending probability
    /// p_end(m) = 1 − exp(−m / probEnd) over m consecutive skips.
    pub prob_end: f64,
    pub mean_new: f64,
    pub mean_falarms: f64,
    /// Number of global hypotheses kept per cluster (K of K-best).
    pub max_g_hypos: usize,
    /// N-scan window depth.
    pub max_depth: usize,
    /// Hypotheses worse than best · minGHypoRatio are discarded.
    pub min_g_hypo_ratio: f64,
    pub intensity_threshold: f64,
    pub max_distance1: f64,
    /// Mahalanobis gate bound used by the constant-velocity model.
    pub max_distance2: f64,
    pub max_distance3: f64,
    pub state_variance: f64,
    /// Last frame label processed before the tracker drains.
    pub end_scan: usize,
    pub pos2vel_likelihood: f64,
    pub vel2curv_likelihood: f64,
    pub start_a: i64,
    pub start_b: i64,
    pub start_c: i64,

    // Runtime switches not carried by the parameter file.
    /// Whether reports may start new tracks after the first scan.
    pub allow_new_tracks: bool,
    /// Which appearance test the gate runs.
    pub patch_test: PatchTest,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            position_variance_x: 1.0,
            position_variance_y: 1.0,
            gradient_variance: 0.5,
            intensity_variance: 100.0,
            process_variance: 0.1,
            prob_detect: 0.9,
            prob_end: 0.5,
            mean_new: 0.01,
            mean_falarms: 0.001,
            max_g_hypos: 10,
            max_depth: 3,
            min_g_hypo_ratio: 0.01,
            intensity_threshold: 0.9,
            max_distance1: 9.2,
            max_distance2: 9.2,
            max_distance3: 9.2,
            state_variance: 5.0,
            end_scan: usize::MAX,
            pos2vel_likelihood: 0.0,
            vel2curv_likelihood: 0.0,
            start_a: 0,
            start_b: 0,
            start_c: 0,
            allow_new_tracks: false,
            patch_test: PatchTest::CorrCoeff,
        }
    }
}

impl TrackerParams {
    /// Reads the 23 ordered values from a parameter file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            TrackError::config(format!("couldn't open parameter file {}: {e}", path.display()))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Reads the 23 ordered values from any buffered reader.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, TrackError> {
        let mut lines = ValueLines::new(reader);
        let params = Self {
            position_variance_x: lines.next_value("positionVarianceX")?,
            position_variance_y: lines.next_value("positionVarianceY")?,
            gradient_variance: lines.next_value("gradientVariance")?,
            intensity_variance: lines.next_value("intensityVariance")?,
            process_variance: lines.next_value("processVariance")?,
            prob_detect: lines.next_value("probDetect")?,
            prob_end: lines.next_value("probEnd")?,
            mean_new: lines.next_value("meanNew")?,
            mean_falarms: lines.next_value("meanFalarms")?,
            max_g_hypos: lines.next_value("maxGHypos")?,
            max_depth: lines.next_value("maxDepth")?,
            min_g_hypo_ratio: lines.next_value("minGHypoRatio")?,
            intensity_threshold: lines.next_value("intensityThreshold")?,
            max_distance1: lines.next_value("maxDistance1")?,
            max_distance2: lines.next_value("maxDistance2")?,
            max_distance3: lines.next_value("maxDistance3")?,
            state_variance: lines.next_value("stateVariance")?,
            end_scan: lines.next_value("endScan")?,
            pos2vel_likelihood: lines.next_value("pos2velLikelihood")?,
            vel2curv_likelihood: lines.next_value("vel2curvLikelihood")?,
            start_a: lines.next_value("startA")?,
            start_b: lines.next_value("startB")?,
            start_c: lines.next_value("startC")?,
            ..Self::default()
        };
        params.validate()?;
        Ok(params)
    }

    /// Fail-fast sanity checks run at start-up.
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.max_depth == 0 {
            return Err(TrackError::config("maxDepth must be at least 1"));
        }
        if self.max_g_hypos == 0 {
            return Err(TrackError::config("maxGHypos must be at least 1"));
        }
        if !(self.min_g_hypo_ratio > 0.0 && self.min_g_hypo_ratio <= 1.0) {
            return Err(TrackError::config("minGHypoRatio must lie in (0, 1]"));
        }
        if !(self.prob_detect > 0.0 && self.prob_detect < 1.0) {
            return Err(TrackError::config("probDetect must lie in (0, 1)"));
        }
        if self.prob_end <= 0.0 {
            return Err(TrackError::config("probEnd must be positive"));
        }
        for (name, v) in [
            ("positionVarianceX", self.position_variance_x),
            ("positionVarianceY", self.position_variance_y),
            ("processVariance", self.process_variance),
            ("intensityVariance", self.intensity_variance),
            ("stateVariance", self.state_variance),
            ("meanNew", self.mean_new),
            ("meanFalarms", self.mean_falarms),
        ] {
            if v <= 0.0 {
                return Err(TrackError::config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Cursor over the non-comment lines of a parameter file.
struct ValueLines<R> {
    reader: R,
    line_no: usize,
}

impl<R: BufRead> ValueLines<R> {
    fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }

    fn next_value<T: FromStr>(&mut self, name: &str) -> Result<T, TrackError> {
        loop {
            let mut buf = String::new();
            let read = self
                .reader
                .read_line(&mut buf)
                .map_err(|e| TrackError::config(format!("read failed at {name}: {e}")))?;
            if read == 0 {
                return Err(TrackError::config(format!(
                    "parameter file ended before {name}"
                )));
            }
            self.line_no += 1;
            if buf.starts_with(';') {
                continue;
            }
            let token = buf.trim();
            if token.is_empty() {
                continue;
            }
            return token.parse::<T>().map_err(|_| {
                TrackError::config(format!(
                    "line {}: couldn't parse {name} from {token:?}",
                    self.line_no
                ))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const FULL: &str = "\
; measurement variances
1.5
2.5
0.25
; appearance
150.0
0.2
0.85
0.4
0.02
0.004
8
4
0.05
0.92
7.5
9.2
11.0
4.0
120
0.1
0.2
1
2
3
";

    #[test]
    fn full_file_parses_field_by_field() {
        let p = TrackerParams::from_reader(Cursor::new(FULL)).unwrap();
        assert_eq!(p.position_variance_x, 1.5);
        assert_eq!(p.position_variance_y, 2.5);
        assert_eq!(p.gradient_variance, 0.25);
        assert_eq!(p.intensity_variance, 150.0);
        assert_eq!(p.process_variance, 0.2);
        assert_eq!(p.prob_detect, 0.85);
        assert_eq!(p.prob_end, 0.4);
        assert_eq!(p.mean_new, 0.02);
        assert_eq!(p.mean_falarms, 0.004);
        assert_eq!(p.max_g_hypos, 8);
        assert_eq!(p.max_depth, 4);
        assert_eq!(p.min_g_hypo_ratio, 0.05);
        assert_eq!(p.intensity_threshold, 0.92);
        assert_eq!(p.max_distance1, 7.5);
        assert_eq!(p.max_distance2, 9.2);
        assert_eq!(p.max_distance3, 11.0);
        assert_eq!(p.state_variance, 4.0);
        assert_eq!(p.end_scan, 120);
        assert_eq!(p.pos2vel_likelihood, 0.1);
        assert_eq!(p.vel2curv_likelihood, 0.2);
        assert_eq!(p.start_a, 1);
        assert_eq!(p.start_b, 2);
        assert_eq!(p.start_c, 3);
    }

    #[test]
    fn missing_line_is_a_config_error() {
        // Drop the last line.
        let truncated: String = FULL.lines().take(FULL.lines().count() - 1).fold(
            String::new(),
            |mut acc, l| {
                acc.push_str(l);
                acc.push('\n');
                acc
            },
        );
        let err = TrackerParams::from_reader(Cursor::new(truncated)).unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[test]
    fn malformed_value_is_a_config_error() {
        let broken = FULL.replacen("0.85", "not-a-number", 1);
        let err = TrackerParams::from_reader(Cursor::new(broken)).unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[test]
    fn defaults_validate() {
        TrackerParams::default().validate().unwrap();
    }

    #[test]
    fn zero_depth_rejected() {
        let p = TrackerParams { max_depth: 0, ..TrackerParams::default() };
        assert!(p.validate().is_err());
    }
}
