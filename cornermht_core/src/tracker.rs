//! Public driver: feed frames in, stream finalised tracks out.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrackerParams;
use crate::error::TrackError;
use crate::patch::Patch;
use crate::report::Report;
use crate::scanner::{ConfirmedElement, FalseAlarm, Phase, Scanner};

/// One corner observation as produced by the detection front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corner {
    pub x: f64,
    pub y: f64,
    pub patch: Patch,
}

/// The tracker facade. Frames go in strictly increasing order; once the
/// tracker drains (explicitly or through `endScan`) no more frames are
/// accepted. Confirmed elements and false alarms accumulate until taken.
#[derive(Debug)]
pub struct CornerTracker {
    scanner: Scanner,
    falarm_log_lik: f64,
    last_frame: Option<usize>,
}

impl CornerTracker {
    pub fn new(params: TrackerParams) -> Result<Self, TrackError> {
        params.validate()?;
        Ok(Self {
            scanner: Scanner::new(&params),
            falarm_log_lik: params.mean_falarms.ln(),
            last_frame: None,
        })
    }

    /// Runs one scan over a frame's corners.
    pub fn submit(&mut self, frame: usize, corners: &[Corner]) -> Result<(), TrackError> {
        match self.scanner.phase() {
            Phase::Draining | Phase::Done => {
                return Err(TrackError::protocol("frame submitted after draining"));
            }
            Phase::FirstScan | Phase::Steady => {}
        }
        if let Some(last) = self.last_frame {
            if frame <= last {
                return Err(TrackError::protocol(format!(
                    "frame {frame} submitted after frame {last}; frames must strictly increase"
                )));
            }
        }
        self.last_frame = Some(frame);

        let reports: Vec<Report> = corners
            .iter()
            .map(|c| Report {
                frame,
                x: c.x,
                y: c.y,
                patch: c.patch,
                falarm_log_lik: self.falarm_log_lik,
            })
            .collect();
        debug!(frame, corners = reports.len(), "submitting frame");
        self.scanner.scan(frame, reports);
        Ok(())
    }

    /// Flushes all remaining ambiguity; the tracker accepts no further
    /// frames afterwards. Idempotent.
    pub fn drain(&mut self) {
        self.scanner.drain();
    }

    /// True once `drain` ran or `endScan` was reached.
    pub fn is_done(&self) -> bool {
        self.scanner.is_done()
    }

    /// Takes every confirmed track element finalised so far. Elements
    /// of one track come out in ascending frame order.
    pub fn take_confirmed(&mut self) -> Vec<ConfirmedElement> {
        self.scanner.take_confirmed()
    }

    /// Takes every false alarm finalised so far, in frame order.
    pub fn take_false_alarms(&mut self) -> Vec<FalseAlarm> {
        self.scanner.take_false_alarms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PATCH_LEN;
    use std::collections::BTreeMap;

    fn textured_patch() -> Patch {
        let mut samples = [0u16; PATCH_LEN];
        for (i, s) in samples.iter_mut().enumerate() {
            *s = (i as u16) * 13 + 1;
        }
        Patch::new(samples)
    }

    fn corner(x: f64, y: f64) -> Corner {
        Corner { x, y, patch: textured_patch() }
    }

    fn by_track(elements: &[ConfirmedElement]) -> BTreeMap<u32, Vec<&ConfirmedElement>> {
        let mut map: BTreeMap<u32, Vec<&ConfirmedElement>> = BTreeMap::new();
        for e in elements {
            map.entry(e.track_id).or_default().push(e);
        }
        map
    }

    #[test]
    fn single_track_straight_line() {
        // One report per frame moving two pixels right each scan.
        let mut tracker = CornerTracker::new(TrackerParams::default()).unwrap();
        for (f, x) in [(0usize, 10.0), (1, 12.0), (2, 14.0), (3, 16.0), (4, 18.0)] {
            tracker.submit(f, &[corner(x, 10.0)]).unwrap();
        }
        tracker.drain();

        let confirmed = tracker.take_confirmed();
        let falarms = tracker.take_false_alarms();
        assert!(falarms.is_empty());

        let tracks = by_track(&confirmed);
        assert_eq!(tracks.len(), 1);
        let track = &tracks.values().next().unwrap()[..];
        assert_eq!(track.len(), 5);
        for (i, e) in track.iter().enumerate() {
            assert_eq!(e.frame, i);
            let (rx, ry) = e.measurement.expect("every element is measurement-backed");
            assert!((e.sx - rx).abs() <= 0.2, "sx {} vs rx {}", e.sx, rx);
            assert!((e.sy - ry).abs() <= 0.2, "sy {} vs ry {}", e.sy, ry);
        }
    }

    #[test]
    fn gated_out_intruder_becomes_a_false_alarm() {
        let mut tracker = CornerTracker::new(TrackerParams::default()).unwrap();
        tracker.submit(0, &[corner(0.0, 0.0)]).unwrap();
        tracker.submit(1, &[corner(1.0, 0.0)]).unwrap();
        tracker.submit(2, &[corner(2.0, 0.0)]).unwrap();
        tracker.submit(3, &[corner(100.0, 100.0)]).unwrap();
        tracker.drain();

        let confirmed = tracker.take_confirmed();
        let falarms = tracker.take_false_alarms();

        let tracks = by_track(&confirmed);
        assert_eq!(tracks.len(), 1);
        let track = &tracks.values().next().unwrap()[..];
        assert_eq!(track.len(), 4);
        assert_eq!(track[3].frame, 3);
        assert!(track[3].measurement.is_none(), "the intruder frame must be a skip");

        assert_eq!(falarms.len(), 1);
        assert_eq!((falarms[0].x, falarms[0].y, falarms[0].frame), (100.0, 100.0, 3));
    }

    #[test]
    fn ambiguous_crossing_resolves_into_two_full_tracks() {
        let params = TrackerParams { max_g_hypos: 4, ..TrackerParams::default() };
        let mut tracker = CornerTracker::new(params).unwrap();
        let frames: [[(f64, f64); 2]; 5] = [
            [(0.0, 0.0), (10.0, 0.0)],
            [(2.0, 1.0), (8.0, 1.0)],
            [(5.0, 2.0), (5.0, 2.0)],
            [(8.0, 3.0), (2.0, 3.0)],
            [(10.0, 4.0), (0.0, 4.0)],
        ];
        for (f, pair) in frames.iter().enumerate() {
            let corners: Vec<Corner> = pair.iter().map(|&(x, y)| corner(x, y)).collect();
            tracker.submit(f, &corners).unwrap();
        }
        tracker.drain();

        let confirmed = tracker.take_confirmed();
        let falarms = tracker.take_false_alarms();
        assert!(falarms.is_empty());

        let tracks = by_track(&confirmed);
        assert_eq!(tracks.len(), 2);
        for track in tracks.values() {
            assert_eq!(track.len(), 5);
            for (i, e) in track.iter().enumerate() {
                assert_eq!(e.frame, i);
                assert!(e.measurement.is_some());
            }
        }

        // The two tracks end at opposite sides of the crossing.
        let finals: Vec<(f64, f64)> = tracks
            .values()
            .map(|t| t[4].measurement.unwrap())
            .collect();
        assert!(finals.contains(&(10.0, 4.0)));
        assert!(finals.contains(&(0.0, 4.0)));
    }

    #[test]
    fn missed_detection_resumes_with_a_skip_element() {
        let mut tracker = CornerTracker::new(TrackerParams::default()).unwrap();
        tracker.submit(0, &[corner(0.0, 0.0)]).unwrap();
        tracker.submit(1, &[corner(1.0, 0.0)]).unwrap();
        tracker.submit(2, &[]).unwrap();
        tracker.submit(3, &[corner(3.0, 0.0)]).unwrap();
        tracker.submit(4, &[corner(4.0, 0.0)]).unwrap();
        tracker.drain();

        let confirmed = tracker.take_confirmed();
        assert!(tracker.take_false_alarms().is_empty());

        let tracks = by_track(&confirmed);
        assert_eq!(tracks.len(), 1);
        let track = &tracks.values().next().unwrap()[..];
        assert_eq!(track.len(), 5);

        let skip = track[2];
        assert_eq!(skip.frame, 2);
        assert!(skip.measurement.is_none());
        assert!((skip.sx - 2.0).abs() < 0.05, "coasted state x: {}", skip.sx);
        assert!(skip.sy.abs() < 0.05, "coasted state y: {}", skip.sy);
    }

    #[test]
    fn reports_beyond_the_gate_all_become_false_alarms() {
        let mut tracker = CornerTracker::new(TrackerParams::default()).unwrap();
        tracker.submit(0, &[corner(0.0, 0.0)]).unwrap();
        tracker.submit(1, &[corner(1.0, 0.0)]).unwrap();
        for f in 2..=5 {
            tracker.submit(f, &[corner(500.0, 500.0 + f as f64)]).unwrap();
        }
        tracker.drain();

        let confirmed = tracker.take_confirmed();
        let falarms = tracker.take_false_alarms();

        assert_eq!(falarms.len(), 4);
        assert_eq!(
            falarms.iter().map(|f| f.frame).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );
        // The established track keeps its two measurement-backed
        // elements; everything after frame 1 is skips or the end.
        let measured: Vec<usize> = confirmed
            .iter()
            .filter(|e| e.measurement.is_some())
            .map(|e| e.frame)
            .collect();
        assert_eq!(measured, vec![0, 1]);
    }

    #[test]
    fn duplicate_reports_never_feed_the_same_track_twice() {
        let params = TrackerParams { max_g_hypos: 4, ..TrackerParams::default() };
        let mut tracker = CornerTracker::new(params).unwrap();
        for f in 0..4usize {
            let x = f as f64;
            tracker.submit(f, &[corner(x, 5.0), corner(x, 5.0)]).unwrap();
        }
        tracker.drain();

        let confirmed = tracker.take_confirmed();
        let falarms = tracker.take_false_alarms();

        // Per frame, at most two elements may be measurement-backed:
        // each duplicate report feeds at most one track.
        let mut per_frame: BTreeMap<usize, usize> = BTreeMap::new();
        for e in confirmed.iter().filter(|e| e.measurement.is_some()) {
            *per_frame.entry(e.frame).or_default() += 1;
        }
        for (&frame, &count) in &per_frame {
            assert!(count <= 2, "frame {frame} claimed {count} times");
        }
        let claimed: usize = per_frame.values().sum();
        assert_eq!(claimed + falarms.len(), 8, "every duplicate resolves exactly once");
    }

    #[test]
    fn out_of_order_frames_are_a_protocol_error() {
        let mut tracker = CornerTracker::new(TrackerParams::default()).unwrap();
        tracker.submit(3, &[corner(0.0, 0.0)]).unwrap();
        let err = tracker.submit(3, &[corner(1.0, 0.0)]).unwrap_err();
        assert!(matches!(err, TrackError::Protocol(_)));
        let err = tracker.submit(1, &[corner(1.0, 0.0)]).unwrap_err();
        assert!(matches!(err, TrackError::Protocol(_)));
    }

    #[test]
    fn submitting_after_drain_is_a_protocol_error() {
        let mut tracker = CornerTracker::new(TrackerParams::default()).unwrap();
        tracker.submit(0, &[corner(0.0, 0.0)]).unwrap();
        tracker.drain();
        let err = tracker.submit(1, &[corner(1.0, 0.0)]).unwrap_err();
        assert!(matches!(err, TrackError::Protocol(_)));
    }

    #[test]
    fn end_scan_drains_the_tracker() {
        let params = TrackerParams { end_scan: 2, ..TrackerParams::default() };
        let mut tracker = CornerTracker::new(params).unwrap();
        for (f, x) in [(0usize, 0.0), (1, 1.0), (2, 2.0)] {
            tracker.submit(f, &[corner(x, 0.0)]).unwrap();
        }
        assert!(tracker.is_done());
        let confirmed = tracker.take_confirmed();
        assert_eq!(confirmed.len(), 3);
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let run = || {
            let params = TrackerParams { max_g_hypos: 4, ..TrackerParams::default() };
            let mut tracker = CornerTracker::new(params).unwrap();
            let frames: [[(f64, f64); 2]; 5] = [
                [(0.0, 0.0), (10.0, 0.0)],
                [(2.0, 1.0), (8.0, 1.0)],
                [(5.0, 2.0), (5.0, 2.0)],
                [(8.0, 3.0), (2.0, 3.0)],
                [(10.0, 4.0), (0.0, 4.0)],
            ];
            for (f, pair) in frames.iter().enumerate() {
                let corners: Vec<Corner> = pair.iter().map(|&(x, y)| corner(x, y)).collect();
                tracker.submit(f, &corners).unwrap();
            }
            tracker.drain();
            (tracker.take_confirmed(), tracker.take_false_alarms())
        };

        let (c1, f1) = run();
        let (c2, f2) = run();
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.track_id, b.track_id);
            assert_eq!(a.frame, b.frame);
            assert_eq!(a.measurement, b.measurement);
            assert_eq!(a.sx, b.sx);
            assert_eq!(a.sy, b.sy);
            assert_eq!(a.log_likelihood, b.log_likelihood);
        }
        assert_eq!(f1.len(), f2.len());
    }
}
