use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sensor::Pipeline;

const DEFAULT_OUTPUT_DIR: &str = "kinect-frames";
const DEFAULT_PIPELINE: &str = "cpu";
const DEFAULT_GPU_DEVICE_ID: i32 = 0;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 10 * 1_000;
const DEFAULT_SAVE_WORKERS: usize = 4;
const DEFAULT_TIMEOUT_RETRIES: u32 = 3;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    output_dir: Option<PathBuf>,
    pipeline: Option<String>,
    gpu_device_id: Option<i32>,
    device_serial: Option<String>,
    capture: Option<CaptureSectionFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureSectionFile {
    frame_timeout_ms: Option<u64>,
    save_workers: Option<usize>,
    on_timeout: Option<String>,
    timeout_retries: Option<u32>,
}

/// File settings that only matter once an env override re-parses the
/// pipeline or the timeout policy.
#[derive(Clone, Copy, Debug)]
struct EnvFallback {
    gpu_device_id: i32,
    timeout_retries: u32,
}

impl EnvFallback {
    fn from_file(file: &CaptureConfigFile) -> Self {
        Self {
            gpu_device_id: file.gpu_device_id.unwrap_or(DEFAULT_GPU_DEVICE_ID),
            timeout_retries: file
                .capture
                .as_ref()
                .and_then(|capture| capture.timeout_retries)
                .unwrap_or(DEFAULT_TIMEOUT_RETRIES),
        }
    }
}

/// What to do when no frame set arrives within the frame timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Fail the capture. The binary exits non-zero.
    #[default]
    Abort,
    /// Wait again, up to `max_attempts` waits in total.
    Retry { max_attempts: u32 },
}

impl TimeoutPolicy {
    fn parse(name: &str, retries: u32) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(TimeoutPolicy::Abort),
            "retry" => Ok(TimeoutPolicy::Retry {
                max_attempts: retries,
            }),
            other => Err(anyhow!(
                "unknown timeout policy '{}' (expected abort or retry)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub output_dir: PathBuf,
    pub pipeline: Pipeline,
    /// Serial of the device to open; the driver's default device when unset.
    pub device_serial: Option<String>,
    pub frame_timeout: Duration,
    pub save_workers: usize,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            pipeline: Pipeline::Cpu,
            device_serial: None,
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            save_workers: DEFAULT_SAVE_WORKERS,
            timeout_policy: TimeoutPolicy::Abort,
        }
    }
}

impl CaptureConfig {
    /// Load from `KINECT_CONFIG` (JSON, or TOML for `.toml` files), then apply
    /// `KINECT_*` environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("KINECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let file_cfg = file_cfg.unwrap_or_default();
        let fallback = EnvFallback::from_file(&file_cfg);
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env(fallback)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let output_dir = file
            .output_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let pipeline = Pipeline::parse(
            file.pipeline.as_deref().unwrap_or(DEFAULT_PIPELINE),
            file.gpu_device_id.unwrap_or(DEFAULT_GPU_DEVICE_ID),
        )?;
        let capture = file.capture.unwrap_or_default();
        let frame_timeout = Duration::from_millis(
            capture
                .frame_timeout_ms
                .unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
        );
        let save_workers = capture.save_workers.unwrap_or(DEFAULT_SAVE_WORKERS);
        let timeout_policy = match capture.on_timeout.as_deref() {
            Some(name) => TimeoutPolicy::parse(
                name,
                capture.timeout_retries.unwrap_or(DEFAULT_TIMEOUT_RETRIES),
            )?,
            None => TimeoutPolicy::Abort,
        };
        Ok(Self {
            output_dir,
            pipeline,
            device_serial: file.device_serial,
            frame_timeout,
            save_workers,
            timeout_policy,
        })
    }

    fn apply_env(&mut self, fallback: EnvFallback) -> Result<()> {
        if let Ok(dir) = std::env::var("KINECT_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(name) = std::env::var("KINECT_PIPELINE") {
            if !name.trim().is_empty() {
                let gpu_device_id = match self.pipeline {
                    Pipeline::Cuda { device_id } => device_id,
                    _ => fallback.gpu_device_id,
                };
                self.pipeline = Pipeline::parse(&name, gpu_device_id)?;
            }
        }
        if let Ok(id) = std::env::var("KINECT_GPU_DEVICE_ID") {
            let id: i32 = id
                .parse()
                .map_err(|_| anyhow!("KINECT_GPU_DEVICE_ID must be an integer"))?;
            if let Pipeline::Cuda { device_id } = &mut self.pipeline {
                *device_id = id;
            }
        }
        if let Ok(serial) = std::env::var("KINECT_DEVICE_SERIAL") {
            if !serial.trim().is_empty() {
                self.device_serial = Some(serial);
            }
        }
        if let Ok(timeout) = std::env::var("KINECT_FRAME_TIMEOUT_MS") {
            let ms: u64 = timeout.parse().map_err(|_| {
                anyhow!("KINECT_FRAME_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.frame_timeout = Duration::from_millis(ms);
        }
        if let Ok(workers) = std::env::var("KINECT_SAVE_WORKERS") {
            self.save_workers = workers
                .parse()
                .map_err(|_| anyhow!("KINECT_SAVE_WORKERS must be an integer"))?;
        }
        if let Ok(policy) = std::env::var("KINECT_ON_TIMEOUT") {
            if !policy.trim().is_empty() {
                self.timeout_policy = TimeoutPolicy::parse(&policy, fallback.timeout_retries)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline == Pipeline::Other {
            return Err(anyhow!("pipeline 'other' is not supported"));
        }
        if self.frame_timeout.is_zero() {
            return Err(anyhow!("frame timeout must be greater than zero"));
        }
        if self.save_workers == 0 {
            return Err(anyhow!("at least one save worker is required"));
        }
        if let TimeoutPolicy::Retry { max_attempts: 0 } = self.timeout_policy {
            return Err(anyhow!("timeout retries must be greater than zero"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("output directory must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
