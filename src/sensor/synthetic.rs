//! Synthetic Kinect v2 for `stub://` serials.
//!
//! Produces deterministic frame sets at sensor resolutions:
//! - Color: 1920x1080 BGRX, a gradient shifted by the sequence number
//! - Infrared / Depth: 512x424 little-endian f32
//!
//! Buffers are pooled the way a real driver pools them. On release, a buffer
//! returns to the pool only if no save task still holds a view of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::{CameraParams, Device, FrameListener, Pipeline, Registration, SensorDriver};
use crate::frame::{
    FrameFormat, FrameKind, FrameSet, RawFrame, ScratchFrame, COLOR_HEIGHT, COLOR_WIDTH,
    DEPTH_HEIGHT, DEPTH_WIDTH, SENSOR_BYTES_PER_PIXEL,
};

const POOLED_BUFFERS_PER_KIND: usize = 2;
/// IR-to-color camera baseline of the Kinect v2, in millimetres.
const BASELINE_MM: f32 = 52.0;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub serial: String,
    pub device_count: usize,
    /// CUDA devices the driver pretends to have. CUDA pipelines need `device_id < cuda_devices`.
    pub cuda_devices: u32,
    /// Pause between frame sets (the real sensor runs at ~30 fps).
    pub frame_interval: Duration,
    /// Stop delivering frames after this many sets; later waits time out.
    pub frame_limit: Option<u32>,
    /// Make `Device::start` fail.
    pub fail_start: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            serial: "stub://kinect-v2".to_string(),
            device_count: 1,
            cuda_devices: 0,
            frame_interval: Duration::from_millis(33),
            frame_limit: None,
            fail_start: false,
        }
    }
}

/// Counters shared by the driver, its device and listener.
#[derive(Clone, Debug, Default)]
pub struct SyntheticStats {
    pub frame_sets_delivered: u64,
    pub frame_sets_released: u64,
    pub buffers_reclaimed: u64,
    pub buffers_detached: u64,
    pub started: bool,
    pub stopped: bool,
    pub closed: bool,
}

struct Shared {
    streaming: AtomicBool,
    stats: Mutex<SyntheticStats>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut SyntheticStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

pub struct SyntheticDriver {
    config: SyntheticConfig,
    shared: Arc<Shared>,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                streaming: AtomicBool::new(false),
                stats: Mutex::new(SyntheticStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> SyntheticStats {
        self.shared
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

impl Default for SyntheticDriver {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

impl SensorDriver for SyntheticDriver {
    fn enumerate_devices(&mut self) -> usize {
        self.config.device_count
    }

    fn default_serial(&mut self) -> Option<String> {
        (self.config.device_count > 0).then(|| self.config.serial.clone())
    }

    fn supports(&self, pipeline: Pipeline) -> bool {
        match pipeline {
            Pipeline::Cpu | Pipeline::OpenGl => true,
            Pipeline::Cuda { device_id } => {
                device_id >= 0 && (device_id as u32) < self.config.cuda_devices
            }
            Pipeline::Other => false,
        }
    }

    fn open_device(&mut self, serial: &str, pipeline: Pipeline) -> Option<Box<dyn Device>> {
        if self.config.device_count == 0 || serial != self.config.serial {
            return None;
        }
        if !self.supports(pipeline) {
            return None;
        }
        log::debug!("synthetic device {} opened with {} pipeline", serial, pipeline);
        Some(Box::new(SyntheticDevice {
            config: self.config.clone(),
            shared: self.shared.clone(),
        }))
    }

    fn registration(&self, ir: CameraParams, color: CameraParams) -> Box<dyn Registration> {
        Box::new(PinholeRegistration { ir, color })
    }
}

struct SyntheticDevice {
    config: SyntheticConfig,
    shared: Arc<Shared>,
}

impl Device for SyntheticDevice {
    fn serial_number(&self) -> String {
        self.config.serial.clone()
    }

    fn firmware_version(&self) -> String {
        "synthetic-2.0".to_string()
    }

    fn ir_camera_params(&self) -> CameraParams {
        CameraParams::kinect_ir()
    }

    fn color_camera_params(&self) -> CameraParams {
        CameraParams::kinect_color()
    }

    fn frame_listener(&mut self) -> Box<dyn FrameListener> {
        Box::new(SyntheticListener {
            config: self.config.clone(),
            shared: self.shared.clone(),
            next_sequence: 0,
            created_at: Instant::now(),
            last_delivery: None,
            pools: Default::default(),
        })
    }

    fn start(&mut self) -> bool {
        if self.config.fail_start {
            return false;
        }
        self.shared.streaming.store(true, Ordering::SeqCst);
        self.shared.update(|stats| stats.started = true);
        true
    }

    fn stop(&mut self) -> bool {
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.shared.update(|stats| stats.stopped = true);
        true
    }

    fn close(&mut self) -> bool {
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.shared.update(|stats| stats.closed = true);
        true
    }
}

struct SyntheticListener {
    config: SyntheticConfig,
    shared: Arc<Shared>,
    next_sequence: u32,
    created_at: Instant,
    last_delivery: Option<Instant>,
    /// Recycled buffers indexed by frame kind.
    pools: [Vec<Vec<u8>>; 3],
}

impl SyntheticListener {
    fn exhausted(&self) -> bool {
        self.config
            .frame_limit
            .map(|limit| self.next_sequence >= limit)
            .unwrap_or(false)
    }

    fn take_buffer(&mut self, kind: FrameKind, len: usize) -> Vec<u8> {
        let mut buffer = self.pools[pool_index(kind)].pop().unwrap_or_default();
        buffer.resize(len, 0);
        buffer
    }

    fn generate(&mut self) -> Option<FrameSet> {
        let sequence = self.next_sequence;
        let timestamp = (self.created_at.elapsed().as_micros() / 100) as u32;

        let color_len = (COLOR_WIDTH * COLOR_HEIGHT) as usize * SENSOR_BYTES_PER_PIXEL;
        let mut color = self.take_buffer(FrameKind::Color, color_len);
        fill_color(&mut color, sequence);

        let depth_len = (DEPTH_WIDTH * DEPTH_HEIGHT) as usize * SENSOR_BYTES_PER_PIXEL;
        let mut infrared = self.take_buffer(FrameKind::Infrared, depth_len);
        fill_float(&mut infrared, |x, y| ((x * y + sequence as usize) % 65_535) as f32);
        let mut depth = self.take_buffer(FrameKind::Depth, depth_len);
        fill_float(&mut depth, |x, y| {
            500.0 + ((x + y + sequence as usize) % 4_000) as f32
        });

        let frames = FrameSet {
            color: sensor_frame(FrameKind::Color, FrameFormat::Bgrx, color)?,
            infrared: sensor_frame(FrameKind::Infrared, FrameFormat::Float, infrared)?,
            depth: sensor_frame(FrameKind::Depth, FrameFormat::Float, depth)?,
        };
        let stamp = |frame: RawFrame| frame.with_sequence(sequence).with_timestamp(timestamp);
        let frames = FrameSet {
            color: stamp(frames.color),
            infrared: stamp(frames.infrared),
            depth: stamp(frames.depth),
        };
        self.next_sequence += 1;
        Some(frames)
    }
}

impl FrameListener for SyntheticListener {
    fn wait_for_new_frame(&mut self, timeout: Duration) -> Option<FrameSet> {
        if !self.shared.streaming.load(Ordering::SeqCst) || self.exhausted() {
            thread::sleep(timeout);
            return None;
        }
        if let Some(last) = self.last_delivery {
            let elapsed = last.elapsed();
            if elapsed < self.config.frame_interval {
                let wait = self.config.frame_interval - elapsed;
                if wait > timeout {
                    thread::sleep(timeout);
                    return None;
                }
                thread::sleep(wait);
            }
        }

        let frames = self.generate()?;
        self.last_delivery = Some(Instant::now());
        self.shared.update(|stats| stats.frame_sets_delivered += 1);
        Some(frames)
    }

    fn release(&mut self, frames: FrameSet) {
        let mut reclaimed = 0;
        let mut detached = 0;
        for frame in frames.into_frames() {
            let index = pool_index(frame.kind);
            match frame.reclaim_buffer() {
                Some(buffer) => {
                    reclaimed += 1;
                    if self.pools[index].len() < POOLED_BUFFERS_PER_KIND {
                        self.pools[index].push(buffer);
                    }
                }
                None => detached += 1,
            }
        }
        self.shared.update(|stats| {
            stats.frame_sets_released += 1;
            stats.buffers_reclaimed += reclaimed;
            stats.buffers_detached += detached;
        });
    }
}

fn pool_index(kind: FrameKind) -> usize {
    match kind {
        FrameKind::Color => 0,
        FrameKind::Infrared => 1,
        FrameKind::Depth => 2,
    }
}

fn sensor_frame(kind: FrameKind, format: FrameFormat, data: Vec<u8>) -> Option<RawFrame> {
    let (width, height) = match kind {
        FrameKind::Color => (COLOR_WIDTH, COLOR_HEIGHT),
        FrameKind::Infrared | FrameKind::Depth => (DEPTH_WIDTH, DEPTH_HEIGHT),
    };
    match RawFrame::new(kind, format, width, height, SENSOR_BYTES_PER_PIXEL, data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("synthetic frame rejected: {}", e);
            None
        }
    }
}

fn fill_color(buffer: &mut [u8], sequence: u32) {
    let width = COLOR_WIDTH as usize;
    for (index, pixel) in buffer.chunks_exact_mut(SENSOR_BYTES_PER_PIXEL).enumerate() {
        let (x, y) = (index % width, index / width);
        pixel[0] = ((x / 12) as u32).wrapping_add(sequence) as u8;
        pixel[1] = (y / 7) as u8;
        pixel[2] = (x ^ y) as u8;
        pixel[3] = 0xFF;
    }
}

fn fill_float(buffer: &mut [u8], value: impl Fn(usize, usize) -> f32) {
    let width = DEPTH_WIDTH as usize;
    for (index, sample) in buffer.chunks_exact_mut(SENSOR_BYTES_PER_PIXEL).enumerate() {
        sample.copy_from_slice(&value(index % width, index / width).to_le_bytes());
    }
}

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

/// Undistortion-free pinhole registration with a horizontal baseline.
struct PinholeRegistration {
    ir: CameraParams,
    color: CameraParams,
}

impl PinholeRegistration {
    fn color_coordinates(&self, x: f32, y: f32, depth_mm: f32) -> (f32, f32) {
        let world_x = (x - self.ir.cx) * depth_mm / self.ir.fx + BASELINE_MM;
        let u = self.color.fx * world_x / depth_mm + self.color.cx;
        let v = self.color.fy * (y - self.ir.cy) / self.ir.fy + self.color.cy;
        (u, v)
    }
}

impl Registration for PinholeRegistration {
    fn apply(
        &self,
        color: &RawFrame,
        depth: &RawFrame,
        undistorted: &mut ScratchFrame,
        registered: &mut ScratchFrame,
    ) {
        let depth_bytes = depth.data();
        if undistorted.as_bytes().len() != depth_bytes.len()
            || registered.as_bytes().len() != depth_bytes.len()
        {
            log::warn!(
                "registration skipped: scratch buffers do not match {}x{} depth",
                depth.width,
                depth.height
            );
            return;
        }
        undistorted.as_bytes_mut().copy_from_slice(depth_bytes);

        let width = depth.width as usize;
        let color_stride = color.row_stride();
        let color_bytes = color.data();
        let out = registered.as_bytes_mut();
        for (index, sample) in depth_bytes.chunks_exact(SENSOR_BYTES_PER_PIXEL).enumerate() {
            let target = &mut out[index * SENSOR_BYTES_PER_PIXEL..(index + 1) * SENSOR_BYTES_PER_PIXEL];
            let depth_mm = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
            if depth_mm <= 0.0 {
                target.fill(0);
                continue;
            }
            let (u, v) =
                self.color_coordinates((index % width) as f32, (index / width) as f32, depth_mm);
            let (u, v) = (u.round(), v.round());
            if u < 0.0 || v < 0.0 || u >= color.width as f32 || v >= color.height as f32 {
                target.fill(0);
                continue;
            }
            let offset = v as usize * color_stride + u as usize * color.bytes_per_pixel;
            target.copy_from_slice(&color_bytes[offset..offset + SENSOR_BYTES_PER_PIXEL]);
        }
    }
}
