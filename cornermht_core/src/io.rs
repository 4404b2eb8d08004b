//! Corner-stream reading and track-file writing.
//!
//! The corner stream starts with `<basename> <totalFrames> <startFrame>`
//! and one corner count per frame; the corners themselves live in one
//! file per frame named `<basename>.<frame>`, one corner per line as
//! `x y i1 … i25` with 16-bit intensities forming the 5×5 patch
//! row-major. The output track file carries a '#' comment block with
//! the parameters, the track and false-alarm counts, and one line per
//! track element or false alarm.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::config::TrackerParams;
use crate::error::TrackError;
use crate::patch::{Patch, PATCH_LEN};
use crate::scanner::{ConfirmedElement, FalseAlarm};
use crate::tracker::Corner;
use crate::tree::TrackId;

/// All corners of one input frame.
#[derive(Debug, Clone)]
pub struct CornerFrame {
    /// Frame label (`startFrame + i`).
    pub frame: usize,
    pub corners: Vec<Corner>,
}

/// Reads the corner specification stream and the per-frame corner files
/// it names from `dir`.
pub fn read_corner_stream(
    spec: &mut impl BufRead,
    dir: &Path,
) -> Result<Vec<CornerFrame>, TrackError> {
    let mut text = String::new();
    spec.read_to_string(&mut text)
        .map_err(|e| TrackError::input(format!("couldn't read corner spec: {e}")))?;
    let mut tokens = text.split_whitespace();

    let basename = tokens
        .next()
        .ok_or_else(|| TrackError::input("corner spec missing basename"))?
        .to_string();
    let total_frames: usize = parse_token(tokens.next(), "totalFrames")?;
    let start_frame: usize = parse_token(tokens.next(), "startFrame")?;

    let mut counts = Vec::with_capacity(total_frames);
    for i in 0..total_frames {
        counts.push(parse_token(tokens.next(), &format!("corner count {i}"))?);
    }

    let mut frames = Vec::with_capacity(total_frames);
    for (i, &count) in counts.iter().enumerate() {
        let frame = start_frame + i;
        let path = dir.join(format!("{basename}.{frame}"));
        let corners = read_corner_file(&path, count)?;
        frames.push(CornerFrame { frame, corners });
    }
    Ok(frames)
}

fn parse_token<T: std::str::FromStr>(token: Option<&str>, what: &str) -> Result<T, TrackError> {
    let token = token.ok_or_else(|| TrackError::input(format!("corner spec missing {what}")))?;
    token
        .parse()
        .map_err(|_| TrackError::input(format!("couldn't parse {what} from {token:?}")))
}

fn read_corner_file(path: &Path, count: usize) -> Result<Vec<Corner>, TrackError> {
    let file = File::open(path)
        .map_err(|e| TrackError::input(format!("couldn't open {}: {e}", path.display())))?;
    let reader = BufReader::new(file);

    let mut corners = Vec::with_capacity(count);
    for line in reader.lines() {
        if corners.len() >= count {
            break;
        }
        let line =
            line.map_err(|e| TrackError::input(format!("read failed in {}: {e}", path.display())))?;
        if line.trim().is_empty() {
            continue;
        }
        corners.push(parse_corner_line(&line, path)?);
    }
    if corners.len() < count {
        return Err(TrackError::input(format!(
            "{} is under-length: expected {count} corners, found {}",
            path.display(),
            corners.len()
        )));
    }
    Ok(corners)
}

fn parse_corner_line(line: &str, path: &Path) -> Result<Corner, TrackError> {
    let mut fields = line.split_whitespace();
    let x: f64 = parse_field(fields.next(), "x", path)?;
    let y: f64 = parse_field(fields.next(), "y", path)?;
    let mut samples = [0u16; PATCH_LEN];
    for (i, s) in samples.iter_mut().enumerate() {
        *s = parse_field(fields.next(), &format!("intensity {}", i + 1), path)?;
    }
    Ok(Corner { x, y, patch: Patch::new(samples) })
}

fn parse_field<T: std::str::FromStr>(
    token: Option<&str>,
    what: &str,
    path: &Path,
) -> Result<T, TrackError> {
    let token = token.ok_or_else(|| {
        TrackError::input(format!("{}: corner line missing {what}", path.display()))
    })?;
    token.parse().map_err(|_| {
        TrackError::input(format!(
            "{}: couldn't parse {what} from {token:?}",
            path.display()
        ))
    })
}

/// Groups confirmed elements into tracks in first-confirmation order.
pub fn collect_tracks(confirmed: &[ConfirmedElement]) -> Vec<(TrackId, Vec<&ConfirmedElement>)> {
    let mut order: Vec<TrackId> = Vec::new();
    let mut groups: std::collections::BTreeMap<TrackId, Vec<&ConfirmedElement>> =
        std::collections::BTreeMap::new();
    for e in confirmed {
        if !groups.contains_key(&e.track_id) {
            order.push(e.track_id);
        }
        groups.entry(e.track_id).or_default().push(e);
    }
    order
        .into_iter()
        .map(|id| {
            let elements = groups.remove(&id).expect("group exists");
            (id, elements)
        })
        .collect()
}

/// Writes the track file: parameter comment block, counts, per-track
/// element lines, then one line per false alarm. Track ids are
/// renumbered sequentially in first-confirmation order.
pub fn write_track_file(
    w: &mut impl Write,
    params: &TrackerParams,
    confirmed: &[ConfirmedElement],
    false_alarms: &[FalseAlarm],
) -> std::io::Result<()> {
    writeln!(w, "#INFORMATION REGARDING THIS CORNER TRACKER")?;
    writeln!(w, "#___________________________________________")?;
    writeln!(w, "#")?;
    writeln!(w, "#")?;
    writeln!(w, "#    Parameters: ")?;
    writeln!(w, "#")?;
    writeln!(w, "#         PositionVarianceX:  {:.6}", params.position_variance_x)?;
    writeln!(w, "#")?;
    writeln!(w, "#         PositionVarianceY:  {:.6}", params.position_variance_y)?;
    writeln!(w, "#")?;
    writeln!(w, "#         GradientVariance:  {:.6}", params.gradient_variance)?;
    writeln!(w, "#")?;
    writeln!(w, "#         intensityVariance:  {:.6}", params.intensity_variance)?;
    writeln!(w, "#")?;
    writeln!(w, "#         ProcessVariance:  {:.6}", params.process_variance)?;
    writeln!(w, "#")?;
    writeln!(w, "#         StateVariance:  {:.6}", params.state_variance)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Prob. Of Detection:  {:.6}", params.prob_detect)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Prob Of Track Ending:  {:.6}", params.prob_end)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Mean New Tracks:  {:.6}", params.mean_new)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Mean False Alarms:  {:.6}", params.mean_falarms)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Max Global Hypo:  {}", params.max_g_hypos)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Max Depth:  {}", params.max_depth)?;
    writeln!(w, "#")?;
    writeln!(w, "#         MinGHypoRatio:  {:.6}", params.min_g_hypo_ratio)?;
    writeln!(w, "#")?;
    writeln!(w, "#         intensity Threshold:  {:.6}", params.intensity_threshold)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Max Mahalinobus Dist1:  {:.6}", params.max_distance1)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Max Mahalinobus Dist2:  {:.6}", params.max_distance2)?;
    writeln!(w, "#")?;
    writeln!(w, "#         Max Mahalinobus Dist3:  {:.6}", params.max_distance3)?;
    writeln!(w, "#")?;

    let tracks = collect_tracks(confirmed);
    writeln!(w, "{}", tracks.len())?;
    writeln!(w, "{}", false_alarms.len())?;

    for (seq, (_, elements)) in tracks.iter().enumerate() {
        writeln!(w, "{} {}", seq, elements.len())?;
        for e in elements {
            let (code, rx, ry) = match e.measurement {
                Some((rx, ry)) => ('M', rx, ry),
                None => ('S', 0.0, 0.0),
            };
            writeln!(
                w,
                "{} {:.6} {:.6} {:.6} {:.6} {:.6} {} {} CONSTANT VELOCITY",
                code, rx, ry, e.sx, e.sy, e.log_likelihood, e.time, e.frame
            )?;
        }
    }

    for f in false_alarms {
        writeln!(w, "{:.6} {:.6} {}", f.x, f.y, f.frame)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn element(
        track_id: TrackId,
        frame: usize,
        measurement: Option<(f64, f64)>,
        sx: f64,
        sy: f64,
    ) -> ConfirmedElement {
        ConfirmedElement {
            track_id,
            frame,
            time: frame,
            measurement,
            sx,
            sy,
            log_likelihood: -1.25,
        }
    }

    #[test]
    fn tracks_group_in_first_confirmation_order() {
        let confirmed = vec![
            element(5, 0, Some((1.0, 1.0)), 1.0, 1.0),
            element(2, 0, Some((9.0, 9.0)), 9.0, 9.0),
            element(5, 1, None, 2.0, 1.0),
        ];
        let tracks = collect_tracks(&confirmed);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].0, 5);
        assert_eq!(tracks[0].1.len(), 2);
        assert_eq!(tracks[1].0, 2);
    }

    #[test]
    fn writer_emits_the_fixed_layout() {
        let confirmed = vec![
            element(3, 0, Some((10.0, 10.0)), 10.0, 10.0),
            element(3, 1, None, 12.0, 10.0),
        ];
        let falarms = vec![FalseAlarm { x: 100.0, y: 100.0, frame: 3 }];

        let mut out = Vec::new();
        write_track_file(&mut out, &TrackerParams::default(), &confirmed, &falarms).unwrap();
        let text = String::from_utf8(out).unwrap();

        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data[0], "1", "track count");
        assert_eq!(data[1], "1", "false alarm count");
        assert_eq!(data[2], "0 2", "track header renumbers ids from zero");
        assert_eq!(
            data[3],
            "M 10.000000 10.000000 10.000000 10.000000 -1.250000 0 0 CONSTANT VELOCITY"
        );
        assert_eq!(
            data[4],
            "S 0.000000 0.000000 12.000000 10.000000 -1.250000 1 1 CONSTANT VELOCITY"
        );
        assert_eq!(data[5], "100.000000 100.000000 3");
    }

    #[test]
    fn reader_roundtrips_corner_files() {
        let dir = std::env::temp_dir().join(format!("cornermht_io_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let patch_line = |x: i32, y: i32, base: u16| {
            let mut line = format!("{x} {y}");
            for i in 0..PATCH_LEN {
                line.push_str(&format!(" {}", base + i as u16));
            }
            line
        };
        std::fs::write(
            dir.join("seq.4"),
            format!("{}\n{}\n", patch_line(10, 20, 100), patch_line(30, 40, 200)),
        )
        .unwrap();
        std::fs::write(dir.join("seq.5"), format!("{}\n", patch_line(11, 21, 300))).unwrap();

        let spec = "seq 2 4\n2\n1\n";
        let frames = read_corner_stream(&mut Cursor::new(spec), &dir).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame, 4);
        assert_eq!(frames[0].corners.len(), 2);
        assert_eq!(frames[0].corners[1].x, 30.0);
        assert_eq!(frames[0].corners[1].patch.get(0, 0), 200.0);
        assert_eq!(frames[1].frame, 5);
        assert_eq!(frames[1].corners[0].y, 21.0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn under_length_corner_file_is_an_input_error() {
        let dir = std::env::temp_dir().join(format!("cornermht_short_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("seq.0"), "1 2 3\n").unwrap();

        let spec = "seq 1 0\n2\n";
        let err = read_corner_stream(&mut Cursor::new(spec), &dir).unwrap_err();
        assert!(matches!(err, TrackError::Input(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_corner_file_is_an_input_error() {
        let dir = std::env::temp_dir().join("cornermht_nonexistent_dir");
        let spec = "nope 1 0\n1\n";
        let err = read_corner_stream(&mut Cursor::new(spec), &dir).unwrap_err();
        assert!(matches!(err, TrackError::Input(_)));
    }
}
