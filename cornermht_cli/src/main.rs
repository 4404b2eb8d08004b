//! Corner tracker CLI
//!
//! Reads the corner specification from stdin, runs the tracker over
//! every frame, and writes the finalised track file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cornermht_core::io::{collect_tracks, read_corner_stream, write_track_file};
use cornermht_core::{CornerTracker, PatchTest, TrackError, TrackerParams};

/// Group corner reports from an image sequence into persistent tracks.
#[derive(Parser, Debug)]
#[command(name = "cornermht")]
#[command(about = "Multiple-hypothesis tracking of image corners", long_about = None)]
struct Args {
    /// Output track file
    out_file: PathBuf,

    /// Parameter file; lines beginning with ';' are comments
    #[arg(short = 'p', long = "params", default_value = "Parameters")]
    param_file: PathBuf,

    /// Directory holding the per-frame corner files
    #[arg(short = 'd', long = "corner-dir", default_value = ".")]
    corner_dir: PathBuf,

    /// Allow tracks to start after the first frame
    #[arg(long)]
    new_tracks: bool,

    /// Appearance test: corr (cross-correlation) or ssd (squared differences)
    #[arg(long, default_value = "corr")]
    patch_test: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print a JSON run summary to stdout
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    match run(&args) {
        Ok(summary) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary).unwrap());
            }
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<serde_json::Value, TrackError> {
    let mut params = TrackerParams::from_file(&args.param_file)?;
    params.allow_new_tracks = args.new_tracks;
    params.patch_test = match args.patch_test.as_str() {
        "corr" => PatchTest::CorrCoeff,
        "ssd" => PatchTest::SumSquareDiff,
        other => {
            return Err(TrackError::config(format!(
                "unknown patch test {other:?}; expected corr or ssd"
            )))
        }
    };
    info!("Using parameter file: {}", args.param_file.display());

    let stdin = std::io::stdin();
    let frames = read_corner_stream(&mut stdin.lock(), &args.corner_dir)?;
    info!("Read {} frames of corners", frames.len());

    let mut tracker = CornerTracker::new(params.clone())?;
    for frame in &frames {
        if tracker.is_done() {
            info!("endScan reached at frame {}", frame.frame);
            break;
        }
        tracker.submit(frame.frame, &frame.corners)?;
    }
    tracker.drain();

    let confirmed = tracker.take_confirmed();
    let false_alarms = tracker.take_false_alarms();
    let num_tracks = collect_tracks(&confirmed).len();
    info!(
        "Finished: {} tracks, {} elements, {} false alarms",
        num_tracks,
        confirmed.len(),
        false_alarms.len()
    );

    let out = File::create(&args.out_file)?;
    let mut writer = BufWriter::new(out);
    write_track_file(&mut writer, &params, &confirmed, &false_alarms)?;
    writer.flush()?;
    info!("Wrote {}", args.out_file.display());

    Ok(serde_json::json!({
        "frames": frames.len(),
        "tracks": num_tracks,
        "elements": confirmed.len(),
        "false_alarms": false_alarms.len(),
        "out_file": args.out_file.display().to_string(),
    }))
}
