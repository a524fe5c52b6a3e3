//! Capability surface of the depth sensor driver.
//!
//! The capture loop only needs a handful of driver operations:
//! - enumerate devices and open one with a packet pipeline
//! - start / stop / close the device
//! - block for the next synchronized frame set, then release it
//! - register depth onto the color camera's viewpoint
//!
//! Backends implement these traits. The built-in `synthetic` backend serves
//! `stub://` serials and is used by tests and the capture binary.

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::frame::{FrameSet, RawFrame, ScratchFrame};

pub mod synthetic;

pub use synthetic::{SyntheticConfig, SyntheticDriver, SyntheticStats};

/// Packet processing backend used by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Pipeline {
    #[default]
    Cpu,
    OpenGl,
    Cuda { device_id: i32 },
    /// Anything the driver was not built with. Always a configuration error.
    Other,
}

impl Pipeline {
    /// Parse a pipeline name (`cpu`, `opengl`, `cuda`, `other`).
    pub fn parse(name: &str, gpu_device_id: i32) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Pipeline::Cpu),
            "opengl" | "gl" => Ok(Pipeline::OpenGl),
            "cuda" => Ok(Pipeline::Cuda {
                device_id: gpu_device_id,
            }),
            "other" => Ok(Pipeline::Other),
            other => Err(anyhow!(
                "unknown pipeline '{}' (expected cpu, opengl or cuda)",
                other
            )),
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Cpu => f.write_str("cpu"),
            Pipeline::OpenGl => f.write_str("opengl"),
            Pipeline::Cuda { device_id } => write!(f, "cuda:{}", device_id),
            Pipeline::Other => f.write_str("other"),
        }
    }
}

/// Pinhole intrinsics of one camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraParams {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl CameraParams {
    /// Factory defaults of the Kinect v2 IR camera.
    pub fn kinect_ir() -> Self {
        Self {
            fx: 365.456,
            fy: 365.456,
            cx: 254.878,
            cy: 205.395,
        }
    }

    /// Factory defaults of the Kinect v2 color camera.
    pub fn kinect_color() -> Self {
        Self {
            fx: 1081.372,
            fy: 1081.372,
            cx: 959.5,
            cy: 539.5,
        }
    }
}

pub trait SensorDriver: Send {
    /// Number of connected devices.
    fn enumerate_devices(&mut self) -> usize;

    fn default_serial(&mut self) -> Option<String>;

    /// Returns true when the driver was built with `pipeline`.
    fn supports(&self, pipeline: Pipeline) -> bool;

    fn open_device(&mut self, serial: &str, pipeline: Pipeline) -> Option<Box<dyn Device>>;

    /// Registration context for a device's calibrated camera pair.
    fn registration(&self, ir: CameraParams, color: CameraParams) -> Box<dyn Registration>;
}

pub trait Device: Send {
    fn serial_number(&self) -> String;

    fn firmware_version(&self) -> String;

    fn ir_camera_params(&self) -> CameraParams;

    fn color_camera_params(&self) -> CameraParams;

    /// Listener receiving synchronized Color, Infrared and Depth frames.
    fn frame_listener(&mut self) -> Box<dyn FrameListener>;

    fn start(&mut self) -> bool;

    fn stop(&mut self) -> bool;

    fn close(&mut self) -> bool;
}

pub trait FrameListener: Send {
    /// Block until the next frame set arrives or `timeout` elapses.
    fn wait_for_new_frame(&mut self, timeout: Duration) -> Option<FrameSet>;

    /// Give a frame set back to the driver. Must happen before the next wait.
    fn release(&mut self, frames: FrameSet);
}

pub trait Registration: Send {
    /// Map depth onto the color viewpoint.
    ///
    /// `undistorted` receives the undistorted depth image, `registered` the
    /// color pixel seen by each depth pixel. Both are depth-resolution buffers.
    fn apply(
        &self,
        color: &RawFrame,
        depth: &RawFrame,
        undistorted: &mut ScratchFrame,
        registered: &mut ScratchFrame,
    );
}
