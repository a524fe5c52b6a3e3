//! Sensor frame model.
//!
//! - `RawFrame`: one frame as handed out by the sensor. Pixels live in a shared,
//!   read-only buffer; cloning a `RawFrame` clones the view, never the bytes.
//! - `FrameSet`: one synchronized Color + Infrared + Depth bundle.
//! - `ScratchFrame`: owned buffers the capture thread rewrites every cycle.
//!
//! The buffer reference count is the release token. A sensor may only recycle a
//! buffer once every view handed out to a save task has been dropped, see
//! `RawFrame::reclaim_buffer`.

use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::Arc;

/// Kinect v2 color camera resolution.
pub const COLOR_WIDTH: u32 = 1920;
pub const COLOR_HEIGHT: u32 = 1080;

/// Kinect v2 IR/depth camera resolution.
pub const DEPTH_WIDTH: u32 = 512;
pub const DEPTH_HEIGHT: u32 = 424;

/// Every Kinect v2 frame type uses 4 bytes per pixel (BGRX or f32).
pub const SENSOR_BYTES_PER_PIXEL: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Color,
    Infrared,
    Depth,
}

impl FrameKind {
    pub const ALL: [FrameKind; 3] = [FrameKind::Color, FrameKind::Infrared, FrameKind::Depth];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Color => "Color",
            FrameKind::Infrared => "Infrared",
            FrameKind::Depth => "Depth",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel encoding tag reported by the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    Invalid,
    Raw,
    Float,
    Bgrx,
    Rgbx,
    Gray,
}

impl FrameFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameFormat::Invalid => "Invalid",
            FrameFormat::Raw => "Raw",
            FrameFormat::Float => "Float",
            FrameFormat::Bgrx => "BGRX",
            FrameFormat::Rgbx => "RGBX",
            FrameFormat::Gray => "Gray",
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// RawFrame: borrowed view of a sensor-owned buffer
// ----------------------------------------------------------------------------

/// One frame from the sensor.
///
/// The pixel buffer is shared and read-only. Save tasks receive clones of the
/// frame (cheap, reference counted) so a slow disk write never holds the
/// capture thread, and the sensor cannot recycle the buffer underneath them.
#[derive(Clone)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    /// Monotonically increasing counter assigned by the sensor.
    pub sequence: u32,
    /// Sensor capture time in device ticks.
    pub timestamp: u32,
    data: Arc<Vec<u8>>,
}

impl RawFrame {
    /// Wrap a sensor buffer. The buffer length must match the dimensions exactly.
    pub fn new(
        kind: FrameKind,
        format: FrameFormat,
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(bytes_per_pixel))
            .ok_or_else(|| anyhow!("{} frame dimensions overflow", kind))?;
        if data.len() != expected {
            return Err(anyhow!(
                "{} frame length mismatch: expected {}, got {}",
                kind,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            kind,
            format,
            width,
            height,
            bytes_per_pixel,
            sequence: 0,
            timestamp: 0,
            data: Arc::new(data),
        })
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Row-major pixel bytes, `width * height * bytes_per_pixel` long.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Bytes in one row of pixels.
    pub fn row_stride(&self) -> usize {
        self.width as usize * self.bytes_per_pixel
    }

    /// Number of live views of this buffer, including this one.
    pub fn view_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Hand the buffer back to its owner for reuse.
    ///
    /// Returns `None` while another view (e.g. an in-flight save task) still
    /// reads the buffer; the bytes are then freed by whichever view drops last.
    pub fn reclaim_buffer(self) -> Option<Vec<u8>> {
        Arc::try_unwrap(self.data).ok()
    }

    /// Raw dump file name: `<Kind>-<W>x<H>-<Format>-seq<N>.bin`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}x{}-{}-seq{}.bin",
            self.kind, self.width, self.height, self.format, self.sequence
        )
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_pixel", &self.bytes_per_pixel)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One synchronized capture cycle.
#[derive(Clone, Debug)]
pub struct FrameSet {
    pub color: RawFrame,
    pub infrared: RawFrame,
    pub depth: RawFrame,
}

impl FrameSet {
    pub fn get(&self, kind: FrameKind) -> &RawFrame {
        match kind {
            FrameKind::Color => &self.color,
            FrameKind::Infrared => &self.infrared,
            FrameKind::Depth => &self.depth,
        }
    }

    /// Sequence number of the color frame, which names the converted output.
    pub fn sequence(&self) -> u32 {
        self.color.sequence
    }

    pub fn into_frames(self) -> [RawFrame; 3] {
        [self.color, self.infrared, self.depth]
    }
}

// ----------------------------------------------------------------------------
// ScratchFrame: registration output, owned by the capture thread
// ----------------------------------------------------------------------------

/// Mutable buffer rewritten in place every cycle. Never shared with save tasks.
pub struct ScratchFrame {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    data: Vec<u8>,
}

impl ScratchFrame {
    pub fn new(width: u32, height: u32, bytes_per_pixel: usize) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            data: vec![0u8; width as usize * height as usize * bytes_per_pixel],
        }
    }

    /// Depth-resolution buffer used for undistorted depth and registered color.
    pub fn depth_sized() -> Self {
        Self::new(DEPTH_WIDTH, DEPTH_HEIGHT, SENSOR_BYTES_PER_PIXEL)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
