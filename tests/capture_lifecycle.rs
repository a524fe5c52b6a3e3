use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use kinect_capture::sensor::CameraParams;
use kinect_capture::{
    CaptureConfig, ConvertedFrame, Device, DiskSink, FrameKind, FrameListener, FrameSet,
    FrameSink, Kinect, MemoryLog, Pipeline, RawFrame, Registration, SensorDriver, SessionLog,
    SyntheticConfig, SyntheticDriver,
};

type Journal = Arc<Mutex<Vec<&'static str>>>;

// ----------------------------------------------------------------------------
// Journaling wrappers around the synthetic backend
// ----------------------------------------------------------------------------

struct JournalDriver {
    inner: SyntheticDriver,
    journal: Journal,
}

impl SensorDriver for JournalDriver {
    fn enumerate_devices(&mut self) -> usize {
        self.inner.enumerate_devices()
    }

    fn default_serial(&mut self) -> Option<String> {
        self.inner.default_serial()
    }

    fn supports(&self, pipeline: Pipeline) -> bool {
        self.inner.supports(pipeline)
    }

    fn open_device(&mut self, serial: &str, pipeline: Pipeline) -> Option<Box<dyn Device>> {
        let inner = self.inner.open_device(serial, pipeline)?;
        Some(Box::new(JournalDevice {
            inner,
            journal: self.journal.clone(),
        }))
    }

    fn registration(&self, ir: CameraParams, color: CameraParams) -> Box<dyn Registration> {
        self.inner.registration(ir, color)
    }
}

struct JournalDevice {
    inner: Box<dyn Device>,
    journal: Journal,
}

impl Device for JournalDevice {
    fn serial_number(&self) -> String {
        self.inner.serial_number()
    }

    fn firmware_version(&self) -> String {
        self.inner.firmware_version()
    }

    fn ir_camera_params(&self) -> CameraParams {
        self.inner.ir_camera_params()
    }

    fn color_camera_params(&self) -> CameraParams {
        self.inner.color_camera_params()
    }

    fn frame_listener(&mut self) -> Box<dyn FrameListener> {
        Box::new(JournalListener {
            inner: self.inner.frame_listener(),
            journal: self.journal.clone(),
        })
    }

    fn start(&mut self) -> bool {
        self.inner.start()
    }

    fn stop(&mut self) -> bool {
        self.journal.lock().unwrap().push("stop");
        self.inner.stop()
    }

    fn close(&mut self) -> bool {
        self.journal.lock().unwrap().push("close");
        self.inner.close()
    }
}

struct JournalListener {
    inner: Box<dyn FrameListener>,
    journal: Journal,
}

impl FrameListener for JournalListener {
    fn wait_for_new_frame(&mut self, timeout: Duration) -> Option<FrameSet> {
        self.inner.wait_for_new_frame(timeout)
    }

    fn release(&mut self, frames: FrameSet) {
        self.journal.lock().unwrap().push("release");
        self.inner.release(frames)
    }
}

/// Takes its time so saves are still in flight when teardown starts.
struct SlowSink {
    delay: Duration,
    journal: Journal,
}

impl FrameSink for SlowSink {
    fn save_raw(&self, frame: &RawFrame) -> Result<PathBuf> {
        thread::sleep(self.delay);
        self.journal.lock().unwrap().push("saved");
        Ok(PathBuf::from(frame.file_name()))
    }

    fn save_converted(&self, _frame: &ConvertedFrame, sequence: u32) -> Result<PathBuf> {
        thread::sleep(self.delay);
        self.journal.lock().unwrap().push("saved");
        Ok(PathBuf::from(ConvertedFrame::file_name(sequence)))
    }
}

/// Refuses every depth frame.
struct DepthlessSink {
    inner: DiskSink,
}

impl FrameSink for DepthlessSink {
    fn save_raw(&self, frame: &RawFrame) -> Result<PathBuf> {
        if frame.kind == FrameKind::Depth {
            return Err(anyhow!("depth volume is read-only"));
        }
        self.inner.save_raw(frame)
    }

    fn save_converted(&self, frame: &ConvertedFrame, sequence: u32) -> Result<PathBuf> {
        self.inner.save_converted(frame, sequence)
    }
}

fn fast_driver() -> SyntheticDriver {
    SyntheticDriver::new(SyntheticConfig {
        frame_interval: Duration::ZERO,
        ..SyntheticConfig::default()
    })
}

fn test_config(output_dir: &Path) -> CaptureConfig {
    CaptureConfig {
        output_dir: output_dir.to_path_buf(),
        frame_timeout: Duration::from_millis(500),
        save_workers: 2,
        ..CaptureConfig::default()
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read output dir")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[test]
fn teardown_drains_saves_before_releasing_and_closing() {
    let journal: Journal = Arc::default();
    let mut driver = JournalDriver {
        inner: fast_driver(),
        journal: journal.clone(),
    };
    let sink = Arc::new(SlowSink {
        delay: Duration::from_millis(15),
        journal: journal.clone(),
    });
    let dir = tempfile::tempdir().expect("tempdir");

    let mut kinect = Kinect::open(
        &test_config(dir.path()),
        &mut driver,
        sink,
        SessionLog::new(MemoryLog::new()),
    )
    .expect("open");
    kinect.capture_bounded(3).expect("capture");
    let report = kinect.shutdown().expect("shutdown");
    assert!(report.released_frame_set);

    let journal = journal.lock().unwrap().clone();
    let saved = journal.iter().filter(|entry| **entry == "saved").count();
    assert_eq!(saved, 12);

    let last_saved = journal.iter().rposition(|entry| *entry == "saved").unwrap();
    let last_release = journal.iter().rposition(|entry| *entry == "release").unwrap();
    let stop = journal.iter().position(|entry| *entry == "stop").unwrap();
    let close = journal.iter().position(|entry| *entry == "close").unwrap();
    assert!(last_saved < last_release, "journal: {:?}", journal);
    assert!(last_release < stop, "journal: {:?}", journal);
    assert!(stop < close, "journal: {:?}", journal);
    // Two releases between cycles, one at teardown.
    assert_eq!(journal.iter().filter(|entry| **entry == "release").count(), 3);
}

#[test]
fn bounded_capture_writes_four_files_per_frame_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path());
    let sink = Arc::new(DiskSink::new(&cfg.output_dir).expect("sink"));
    let mut driver = fast_driver();

    let mut kinect = Kinect::open(&cfg, &mut driver, sink, SessionLog::new(MemoryLog::new()))
        .expect("open");
    kinect.capture_bounded(2).expect("capture");
    let report = kinect.shutdown().expect("shutdown");
    assert_eq!(report.drain.failed, 0);
    assert!(report.device_stopped);
    assert!(report.device_closed);

    assert_eq!(
        files_in(&dir.path().join("kinect")),
        [
            "Color-1920x1080-BGRX-seq0.bin",
            "Color-1920x1080-BGRX-seq1.bin",
            "Depth-512x424-Float-seq0.bin",
            "Depth-512x424-Float-seq1.bin",
            "Infrared-512x424-Float-seq0.bin",
            "Infrared-512x424-Float-seq1.bin",
        ]
    );
    assert_eq!(
        files_in(&dir.path().join("gesturenet")),
        ["160x160-BGRX-seq0.bin", "160x160-BGRX-seq1.bin"]
    );

    let color = fs::read(dir.path().join("kinect/Color-1920x1080-BGRX-seq1.bin")).unwrap();
    assert_eq!(color.len(), 1920 * 1080 * 4);
    let depth = fs::read(dir.path().join("kinect/Depth-512x424-Float-seq0.bin")).unwrap();
    assert_eq!(depth.len(), 512 * 424 * 4);
    let converted = fs::read(dir.path().join("gesturenet/160x160-BGRX-seq0.bin")).unwrap();
    assert_eq!(converted.len(), 160 * 160 * 3);

    let stats = driver.stats();
    assert_eq!(stats.frame_sets_delivered, 2);
    assert_eq!(stats.frame_sets_released, 2);
    assert!(stats.closed);
}

#[test]
fn failing_saves_are_reported_and_capture_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path());
    let sink = Arc::new(DepthlessSink {
        inner: DiskSink::new(&cfg.output_dir).expect("sink"),
    });
    let memory = MemoryLog::new();
    let mut driver = fast_driver();

    let mut kinect =
        Kinect::open(&cfg, &mut driver, sink, SessionLog::new(memory.clone())).expect("open");
    kinect.capture_bounded(3).expect("capture keeps going");
    let failed_before = kinect.stats().saves_failed;
    let report = kinect.shutdown().expect("shutdown");

    assert_eq!(failed_before + report.drain.failed as u64, 3);
    assert!(memory.contains(log::Level::Error, "depth volume is read-only"));
    assert_eq!(files_in(&dir.path().join("kinect")).len(), 6);
    assert_eq!(files_in(&dir.path().join("gesturenet")).len(), 3);
}

#[test]
fn recording_writes_complete_frame_sets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path());
    let sink = Arc::new(DiskSink::new(&cfg.output_dir).expect("sink"));
    let mut driver = SyntheticDriver::new(SyntheticConfig {
        frame_interval: Duration::from_millis(5),
        ..SyntheticConfig::default()
    });

    let mut kinect = Kinect::open(&cfg, &mut driver, sink, SessionLog::new(MemoryLog::new()))
        .expect("open");
    kinect.start_recording().expect("start");
    while kinect.stats().frame_sets < 3 {
        thread::sleep(Duration::from_millis(5));
    }
    kinect.stop_recording();
    let report = kinect.shutdown().expect("shutdown");
    assert_eq!(report.drain.failed, 0);

    let raw = files_in(&dir.path().join("kinect")).len();
    let converted = files_in(&dir.path().join("gesturenet")).len();
    assert!(converted >= 3);
    assert_eq!(raw, 3 * converted);
}

#[test]
fn recorder_timeout_surfaces_at_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = CaptureConfig {
        frame_timeout: Duration::from_millis(20),
        ..test_config(dir.path())
    };
    let sink = Arc::new(DiskSink::new(&cfg.output_dir).expect("sink"));
    let mut driver = SyntheticDriver::new(SyntheticConfig {
        frame_interval: Duration::ZERO,
        frame_limit: Some(2),
        ..SyntheticConfig::default()
    });

    let mut kinect = Kinect::open(&cfg, &mut driver, sink, SessionLog::new(MemoryLog::new()))
        .expect("open");
    kinect.start_recording().expect("start");
    while kinect.is_recording() {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        kinect.shutdown(),
        Err(kinect_capture::CaptureError::Timeout(_))
    ));
    // Saves of the two delivered frame sets were still drained.
    assert_eq!(files_in(&dir.path().join("gesturenet")).len(), 2);
    assert!(driver.stats().closed);
}
