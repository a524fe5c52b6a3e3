//! Persistence sinks for captured and converted frames.
//!
//! On-disk layout under the output directory:
//! - `kinect/<Kind>-<W>x<H>-<Format>-seq<N>.bin`: raw sensor bytes, no header
//! - `gesturenet/160x160-BGRX-seq<N>.bin`: 160x160x3 RGB bytes, no header
//!
//! Sinks run on save worker threads, never on the capture thread.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::convert::ConvertedFrame;
use crate::frame::RawFrame;

pub const RAW_SUBDIR: &str = "kinect";
pub const CONVERTED_SUBDIR: &str = "gesturenet";

pub trait FrameSink: Send + Sync {
    /// Dump a raw sensor frame. Returns the written path.
    fn save_raw(&self, frame: &RawFrame) -> Result<PathBuf>;

    /// Dump a converted frame produced from color frame `sequence`.
    fn save_converted(&self, frame: &ConvertedFrame, sequence: u32) -> Result<PathBuf>;
}

/// Writes frames as header-less binary files.
#[derive(Clone, Debug)]
pub struct DiskSink {
    raw_dir: PathBuf,
    converted_dir: PathBuf,
}

impl DiskSink {
    /// Create both output directories if they are missing.
    pub fn new(output_dir: &Path) -> Result<Self> {
        let raw_dir = output_dir.join(RAW_SUBDIR);
        let converted_dir = output_dir.join(CONVERTED_SUBDIR);
        for dir in [&raw_dir, &converted_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create directory: {}", dir.display()))?;
        }
        log::info!("writing frames to {}", output_dir.display());
        Ok(Self {
            raw_dir,
            converted_dir,
        })
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn converted_dir(&self) -> &Path {
        &self.converted_dir
    }

    pub fn raw_path(&self, frame: &RawFrame) -> PathBuf {
        self.raw_dir.join(frame.file_name())
    }

    pub fn converted_path(&self, sequence: u32) -> PathBuf {
        self.converted_dir.join(ConvertedFrame::file_name(sequence))
    }
}

impl FrameSink for DiskSink {
    fn save_raw(&self, frame: &RawFrame) -> Result<PathBuf> {
        let path = self.raw_path(frame);
        log::debug!("saving frame to {}", path.display());
        fs::write(&path, frame.data())
            .with_context(|| format!("could not open output stream: {}", path.display()))?;
        Ok(path)
    }

    fn save_converted(&self, frame: &ConvertedFrame, sequence: u32) -> Result<PathBuf> {
        let path = self.converted_path(sequence);
        log::debug!("saving GestureNet frame to {}", path.display());
        fs::write(&path, frame.to_rgb_bytes())
            .with_context(|| format!("could not open output stream: {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFormat, FrameKind};

    #[test]
    fn creates_both_subdirectories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DiskSink::new(&dir.path().join("frames"))?;
        assert!(sink.raw_dir().is_dir());
        assert!(sink.converted_dir().is_dir());
        Ok(())
    }

    #[test]
    fn output_dir_under_a_file_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("plain");
        fs::write(&plain, b"not a directory")?;

        let err = DiskSink::new(&plain).unwrap_err();
        assert!(err.to_string().contains("could not create directory"));
        assert!(!plain.join(RAW_SUBDIR).exists());
        Ok(())
    }

    #[test]
    fn raw_dump_is_headerless() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DiskSink::new(dir.path())?;
        let frame = RawFrame::new(FrameKind::Infrared, FrameFormat::Float, 2, 2, 4, (0..16).collect())?
            .with_sequence(3);

        let path = sink.save_raw(&frame)?;
        assert_eq!(path, dir.path().join("kinect/Infrared-2x2-Float-seq3.bin"));
        assert_eq!(fs::read(path)?, (0..16).collect::<Vec<u8>>());
        Ok(())
    }

    #[test]
    fn unwritable_output_reports_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DiskSink::new(dir.path())?;
        fs::remove_dir_all(sink.raw_dir())?;
        let frame = RawFrame::new(FrameKind::Depth, FrameFormat::Float, 1, 1, 4, vec![0; 4])?;

        let err = sink.save_raw(&frame).unwrap_err();
        assert!(err.to_string().contains("could not open output stream"));
        Ok(())
    }
}
