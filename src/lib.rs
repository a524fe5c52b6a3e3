//! Kinect v2 frame capture.
//!
//! Captures synchronized Color / Infrared / Depth frame sets, dumps every raw
//! frame to disk, and derives a 160x160 RGB frame per color frame for the
//! GestureNet classifier.
//!
//! # Module Structure
//!
//! - `frame`: sensor frame model (RawFrame, FrameSet, ScratchFrame)
//! - `convert`: 1920x1080 BGRX -> 160x160 RGB box downsampling
//! - `sensor`: driver capability traits + synthetic `stub://` backend
//! - `sink`: raw and converted frame persistence
//! - `tasks`: save task group drained at teardown
//! - `capture`: the `Kinect` orchestrator (bounded capture, continuous recording)
//! - `config`: file + environment configuration
//! - `logging`: injected logging sink

pub mod capture;
pub mod config;
pub mod convert;
pub mod frame;
pub mod logging;
pub mod sensor;
pub mod sink;
pub mod tasks;

pub use capture::{CaptureError, CaptureStats, Kinect, ShutdownReport};
pub use config::{CaptureConfig, TimeoutPolicy};
pub use convert::{convert, ConversionError, ConvertedFrame, Pixel};
pub use frame::{FrameFormat, FrameKind, FrameSet, RawFrame, ScratchFrame};
pub use logging::{MemoryLog, SessionLog};
pub use sensor::{
    CameraParams, Device, FrameListener, Pipeline, Registration, SensorDriver, SyntheticConfig,
    SyntheticDriver,
};
pub use sink::{DiskSink, FrameSink};
pub use tasks::{DrainReport, SaveTaskGroup};
