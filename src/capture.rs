//! Capture orchestration.
//!
//! `Kinect` owns the device and one `CaptureSession`. A capture cycle:
//! 1. release the previous frame set back to the driver
//! 2. wait for the next synchronized frame set (bounded by the frame timeout)
//! 3. register depth onto the color viewpoint (scratch buffers, capture thread only)
//! 4. dispatch raw Color / Infrared / Depth saves plus one GestureNet conversion
//!    to the save task group
//!
//! Dispatch for cycle k happens before the wait for cycle k+1. Save tasks
//! complete in any order; file names carry the sensor sequence number.
//!
//! Continuous recording moves the session into a single background thread and
//! gets it back when that thread is joined, so the task group only ever has
//! one writer. Teardown order: stop and join the recorder, drain every save
//! task, release the last frame set, stop the device, close the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::{CaptureConfig, TimeoutPolicy};
use crate::convert::convert;
use crate::frame::{FrameSet, ScratchFrame};
use crate::logging::SessionLog;
use crate::sensor::{Device, FrameListener, Pipeline, Registration, SensorDriver};
use crate::sink::FrameSink;
use crate::tasks::{DrainReport, SaveTaskGroup, TaskCounters};

const RECORDER_TARGET: &str = "kinect_capture::recorder";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no device connected")]
    NoDevice,
    #[error("pipeline {0} is not supported")]
    UnsupportedPipeline(Pipeline),
    #[error("could not open device {0}")]
    DeviceOpen(String),
    #[error("could not start device {0}")]
    DeviceStart(String),
    #[error("waited {0:?} without receiving a frame set")]
    Timeout(Duration),
    #[error("continuous recording is already running")]
    AlreadyRecording,
    #[error("recording thread panicked")]
    RecorderPanicked,
    #[error("capture session is gone")]
    SessionLost,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Progress counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frame_sets: u64,
    pub saves_dispatched: u64,
    pub saves_completed: u64,
    pub saves_failed: u64,
    pub recording: bool,
}

/// What teardown did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drain: DrainReport,
    pub released_frame_set: bool,
    pub device_stopped: bool,
    pub device_closed: bool,
}

// ----------------------------------------------------------------------------
// CaptureSession: everything one capture thread touches
// ----------------------------------------------------------------------------

struct CaptureSession {
    listener: Box<dyn FrameListener>,
    registration: Box<dyn Registration>,
    undistorted: ScratchFrame,
    registered: ScratchFrame,
    /// Frame set of the latest cycle; released at the start of the next cycle.
    current: Option<FrameSet>,
    tasks: SaveTaskGroup,
    sink: Arc<dyn FrameSink>,
    frame_timeout: Duration,
    timeout_policy: TimeoutPolicy,
    frame_sets: Arc<AtomicU64>,
    log: SessionLog,
}

impl CaptureSession {
    fn next_frame_set(&mut self) -> Result<FrameSet, CaptureError> {
        if let Some(previous) = self.current.take() {
            self.listener.release(previous);
        }
        let mut timeouts = 0u32;
        loop {
            if let Some(frames) = self.listener.wait_for_new_frame(self.frame_timeout) {
                self.current = Some(frames.clone());
                self.frame_sets.fetch_add(1, Ordering::SeqCst);
                return Ok(frames);
            }
            timeouts += 1;
            match self.timeout_policy {
                TimeoutPolicy::Retry { max_attempts } if timeouts < max_attempts => {
                    self.log.warn(format_args!(
                        "no frame set after {:?}, retrying ({}/{})",
                        self.frame_timeout, timeouts, max_attempts
                    ));
                }
                _ => return Err(CaptureError::Timeout(self.frame_timeout)),
            }
        }
    }

    /// One wait-register-dispatch cycle. Returns the frame set sequence number.
    fn run_cycle(&mut self) -> Result<u32, CaptureError> {
        let frames = self.next_frame_set()?;
        self.registration.apply(
            &frames.color,
            &frames.depth,
            &mut self.undistorted,
            &mut self.registered,
        );
        let sequence = frames.sequence();
        self.dispatch(frames)?;
        self.log
            .debug(format_args!("dispatched 4 saves for frame set {}", sequence));

        let reaped = self.tasks.reap();
        if reaped.failed > 0 {
            self.log.warn(format_args!(
                "{} save task(s) failed before frame set {}",
                reaped.failed, sequence
            ));
        }
        Ok(sequence)
    }

    fn dispatch(&mut self, frames: FrameSet) -> Result<(), CaptureError> {
        let converted_source = frames.color.clone();
        for frame in frames.into_frames() {
            let sink = self.sink.clone();
            let label = frame.file_name();
            self.tasks.spawn(label, move || sink.save_raw(&frame).map(|_| ()))?;
        }

        let sink = self.sink.clone();
        let label = format!("GestureNet seq{}", converted_source.sequence);
        self.tasks.spawn(label, move || {
            let converted = convert(&converted_source)?;
            sink.save_converted(&converted, converted_source.sequence)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Drain the task group, then hand the last frame set back.
    fn finish(&mut self) -> (DrainReport, bool) {
        let drain = self.tasks.shutdown();
        let released = match self.current.take() {
            Some(frames) => {
                self.listener.release(frames);
                true
            }
            None => false,
        };
        (drain, released)
    }
}

struct RecorderExit {
    session: CaptureSession,
    error: Option<CaptureError>,
}

struct RecorderThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<RecorderExit>,
}

// ----------------------------------------------------------------------------
// Kinect
// ----------------------------------------------------------------------------

pub struct Kinect {
    device: Box<dyn Device>,
    session: Option<CaptureSession>,
    recorder: Option<RecorderThread>,
    /// Fatal error raised by a recorder that was already joined.
    recorder_error: Option<CaptureError>,
    task_counters: Arc<TaskCounters>,
    frame_sets: Arc<AtomicU64>,
    log: SessionLog,
    closed: bool,
}

impl Kinect {
    /// Open and start the configured device.
    ///
    /// Every error here is a setup failure; no session exists afterwards.
    pub fn open(
        config: &CaptureConfig,
        driver: &mut dyn SensorDriver,
        sink: Arc<dyn FrameSink>,
        log: SessionLog,
    ) -> Result<Self, CaptureError> {
        if config.pipeline == Pipeline::Other || !driver.supports(config.pipeline) {
            return Err(CaptureError::UnsupportedPipeline(config.pipeline));
        }
        if driver.enumerate_devices() == 0 {
            return Err(CaptureError::NoDevice);
        }
        let serial = config
            .device_serial
            .clone()
            .or_else(|| driver.default_serial())
            .ok_or(CaptureError::NoDevice)?;
        log.info(format_args!("serial device: {}", serial));

        let mut device = driver
            .open_device(&serial, config.pipeline)
            .ok_or_else(|| CaptureError::DeviceOpen(serial.clone()))?;
        let listener = device.frame_listener();
        if !device.start() {
            return Err(CaptureError::DeviceStart(serial));
        }
        log.info(format_args!(
            "device started, serial number: {}, firmware version: {}",
            device.serial_number(),
            device.firmware_version()
        ));

        let registration =
            driver.registration(device.ir_camera_params(), device.color_camera_params());
        let tasks = SaveTaskGroup::new(config.save_workers, log.clone())?;
        let task_counters = tasks.counters();
        let frame_sets = Arc::new(AtomicU64::new(0));

        let session = CaptureSession {
            listener,
            registration,
            undistorted: ScratchFrame::depth_sized(),
            registered: ScratchFrame::depth_sized(),
            current: None,
            tasks,
            sink,
            frame_timeout: config.frame_timeout,
            timeout_policy: config.timeout_policy,
            frame_sets: frame_sets.clone(),
            log: log.clone(),
        };

        Ok(Self {
            device,
            session: Some(session),
            recorder: None,
            recorder_error: None,
            task_counters,
            frame_sets,
            log,
            closed: false,
        })
    }

    /// Capture `n` frame sets, blocking until each has been dispatched.
    ///
    /// Saves keep running in the background; `shutdown` waits for them.
    pub fn capture_bounded(&mut self, n: u32) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Err(CaptureError::AlreadyRecording);
        }
        self.reclaim_session()?;
        let session = self.session.as_mut().ok_or(CaptureError::SessionLost)?;
        for saved in 1..=n {
            let sequence = session.run_cycle()?;
            self.log.info(format_args!(
                "saving frame {} of {} (seq {})",
                saved, n, sequence
            ));
        }
        Ok(())
    }

    /// Start continuous recording on a background thread. Non-blocking.
    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Err(CaptureError::AlreadyRecording);
        }
        self.reclaim_session()?;
        let mut session = self.session.take().ok_or(CaptureError::SessionLost)?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let log = self.log.clone().with_target(RECORDER_TARGET);
        let handle = thread::spawn(move || {
            let mut error = None;
            while flag.load(Ordering::SeqCst) {
                if let Err(e) = session.run_cycle() {
                    log.error(format_args!("recording stopped: {}", e));
                    error = Some(e);
                    break;
                }
            }
            flag.store(false, Ordering::SeqCst);
            RecorderExit { session, error }
        });

        self.log.info(format_args!("recording started"));
        self.recorder = Some(RecorderThread { running, handle });
        Ok(())
    }

    /// Ask the recorder to stop after its current cycle. Does not wait.
    pub fn stop_recording(&mut self) {
        if let Some(recorder) = &self.recorder {
            if recorder.running.swap(false, Ordering::SeqCst) {
                self.log.info(format_args!("recording stop requested"));
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder
            .as_ref()
            .map(|recorder| recorder.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frame_sets: self.frame_sets.load(Ordering::SeqCst),
            saves_dispatched: self.task_counters.spawned(),
            saves_completed: self.task_counters.completed(),
            saves_failed: self.task_counters.failed(),
            recording: self.is_recording(),
        }
    }

    /// Tear down in order and report what happened.
    ///
    /// Returns the fatal error that ended continuous recording, if any, after
    /// the teardown has completed.
    pub fn shutdown(mut self) -> Result<ShutdownReport, CaptureError> {
        self.teardown()
    }

    /// Join a recorder that was asked to stop (or died) and take its session back.
    fn reclaim_session(&mut self) -> Result<(), CaptureError> {
        let Some(recorder) = self.recorder.take() else {
            return Ok(());
        };
        match recorder.handle.join() {
            Ok(exit) => {
                self.session = Some(exit.session);
                match exit.error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Err(_) => Err(CaptureError::RecorderPanicked),
        }
    }

    fn teardown(&mut self) -> Result<ShutdownReport, CaptureError> {
        self.closed = true;
        self.stop_recording();
        if let Err(e) = self.reclaim_session() {
            self.recorder_error = Some(e);
        }

        let mut report = ShutdownReport::default();
        if let Some(mut session) = self.session.take() {
            let (drain, released) = session.finish();
            report.drain = drain;
            report.released_frame_set = released;
        }

        report.device_stopped = self.device.stop();
        if !report.device_stopped {
            self.log.warn(format_args!("could not stop device"));
        }
        report.device_closed = self.device.close();
        if !report.device_closed {
            self.log.warn(format_args!("could not close device"));
        }
        self.log.info(format_args!(
            "capture closed: {} save(s) drained, {} failed",
            report.drain.completed, report.drain.failed
        ));

        match self.recorder_error.take() {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

impl Drop for Kinect {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.teardown() {
            self.log.error(format_args!("capture teardown: {}", e));
        }
    }
}
