//! kinect-capture - dump Kinect frame sets to disk
//!
//! `save` captures a fixed number of frame sets and exits once every save has
//! been written. `record` captures continuously until Ctrl-C (or `--seconds`).
//!
//! Each frame set produces `kinect/<Kind>-<W>x<H>-<Format>-seq<N>.bin` for
//! Color, Infrared and Depth plus `gesturenet/160x160-BGRX-seq<N>.bin` under
//! the output directory.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kinect_capture::{CaptureConfig, DiskSink, Kinect, SessionLog, SyntheticDriver};

#[derive(Parser, Debug)]
#[command(
    name = "kinect-capture",
    about = "Capture Kinect color, infrared and depth frames to disk"
)]
struct Args {
    /// Output root; overrides the config file.
    #[arg(long, env = "KINECT_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture N frame sets, then wait for every save.
    Save {
        #[arg(long, default_value_t = 10)]
        frames: u32,
    },
    /// Record until Ctrl-C, or for a fixed number of seconds.
    Record {
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        exit_with_error(format_args!("{:#}", e));
    }
}

fn run(args: Args) -> Result<()> {
    let mut cfg = CaptureConfig::load()?;
    if let Some(dir) = args.output_dir {
        cfg.output_dir = dir;
    }
    log::info!(
        "capturing to {} with the {} pipeline",
        cfg.output_dir.display(),
        cfg.pipeline
    );

    let sink = match DiskSink::new(&cfg.output_dir) {
        Ok(sink) => Arc::new(sink),
        Err(e) => exit_with_error(format_args!("{:#}", e)),
    };
    let mut driver = SyntheticDriver::default();
    let mut kinect = Kinect::open(&cfg, &mut driver, sink, SessionLog::global())?;

    let captured = match args.command {
        Command::Save { frames } => kinect.capture_bounded(frames),
        Command::Record { seconds } => record(&mut kinect, seconds.map(Duration::from_secs)),
    };

    let stats = kinect.stats();
    // Teardown runs even when capture failed; the capture error wins.
    let shutdown = kinect.shutdown();
    captured?;
    let report = shutdown?;
    log::info!(
        "captured {} frame set(s), {} save(s) written, {} failed",
        stats.frame_sets,
        stats.saves_completed + report.drain.completed as u64,
        stats.saves_failed + report.drain.failed as u64
    );
    Ok(())
}

fn record(kinect: &mut Kinect, limit: Option<Duration>) -> Result<(), kinect_capture::CaptureError> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| anyhow::anyhow!("error setting Ctrl-C handler: {}", e))?;

    kinect.start_recording()?;
    log::info!("recording, press Ctrl-C to stop");
    let started = Instant::now();
    loop {
        if interrupted.load(Ordering::SeqCst) {
            log::info!("interrupted");
            break;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        // The recorder stopped on its own (timeout or device failure).
        if !kinect.is_recording() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    kinect.stop_recording();
    Ok(())
}

#[track_caller]
fn exit_with_error(message: impl fmt::Display) -> ! {
    let caller = std::panic::Location::caller();
    eprintln!("{}:{} - {}", caller.file(), caller.line(), message);
    eprintln!("Exiting with return code 1");
    std::process::exit(1);
}
