//! Kinect color frame -> GestureNet input frame.
//!
//! Box downsampling from 1920x1080 BGRX to 160x160 RGB.
//!
//! - Width: 1920 / 160 = 12, so each output pixel spans 12 source columns.
//! - Height: 1080 / 160 = 6.75 does not divide evenly. Output row `r` spans
//!   source rows `floor(r * 1080 / 160) .. floor((r + 1) * 1080 / 160)`, which
//!   yields groups of 6, 7, 7, 7 rows repeating 40 times. Every source row
//!   belongs to exactly one group.
//!
//! Each output channel is the sum over its whole 12 x k box divided once by
//! `12 * k` with integer (truncating) division. For a single-row box this is
//! exactly `reduce_row`.
//!
//! The X byte of BGRX is ignored, and channel order is swapped to RGB.

use std::ops::Range;
use thiserror::Error;

use crate::frame::{FrameFormat, FrameKind, RawFrame, COLOR_HEIGHT, COLOR_WIDTH};

pub const GESTURENET_WIDTH: usize = 160;
pub const GESTURENET_HEIGHT: usize = 160;
pub const GESTURENET_BYTES_PER_PIXEL: usize = 3;

/// Source pixels merged into one output pixel along a row.
pub const PIXELS_PER_GROUP: usize = COLOR_WIDTH as usize / GESTURENET_WIDTH;

const BGRX_LEN: usize = 4;
const COLOR_ROW_BYTES: usize = COLOR_WIDTH as usize * BGRX_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("cannot convert {0} frame to a GestureNet frame")]
    WrongFrameKind(FrameKind),
    #[error("cannot convert chunk of length {0} to a GestureNet pixel")]
    BadPixelLength(usize),
    #[error("expected BGRX color frame with 4 bytes per pixel, got {format} with {bytes_per_pixel}")]
    UnexpectedFormat {
        format: FrameFormat,
        bytes_per_pixel: usize,
    },
    #[error("expected 1920x1080 color frame, got {width}x{height}")]
    UnexpectedDimensions { width: u32, height: u32 },
}

/// One GestureNet pixel. No alpha.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pixel {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Pixel {
    /// Convert one BGRX chunk. The X byte is dropped, but the chunk must still be
    /// exactly 4 bytes since that is what a Kinect color pixel is.
    pub fn from_bgrx(chunk: &[u8]) -> Result<Self, ConversionError> {
        match *chunk {
            [blue, green, red, _] => Ok(Self { red, green, blue }),
            _ => Err(ConversionError::BadPixelLength(chunk.len())),
        }
    }

    pub fn to_bytes(self) -> [u8; GESTURENET_BYTES_PER_PIXEL] {
        [self.red, self.green, self.blue]
    }
}

/// Running channel sums for one output pixel.
#[derive(Clone, Copy, Default)]
struct BoxSum {
    red: u32,
    green: u32,
    blue: u32,
    samples: u32,
}

impl BoxSum {
    fn add(&mut self, pixel: Pixel) {
        self.red += u32::from(pixel.red);
        self.green += u32::from(pixel.green);
        self.blue += u32::from(pixel.blue);
        self.samples += 1;
    }

    fn mean(&self) -> Pixel {
        if self.samples == 0 {
            return Pixel::default();
        }
        Pixel {
            red: (self.red / self.samples) as u8,
            green: (self.green / self.samples) as u8,
            blue: (self.blue / self.samples) as u8,
        }
    }
}

/// Source rows averaged into output row `output_row`.
pub fn source_rows(output_row: usize) -> Range<usize> {
    let height = COLOR_HEIGHT as usize;
    let start = output_row * height / GESTURENET_HEIGHT;
    let end = (output_row + 1) * height / GESTURENET_HEIGHT;
    start..end
}

fn accumulate_row(row: &[u8], sums: &mut [BoxSum]) -> Result<(), ConversionError> {
    for (index, chunk) in row.chunks(BGRX_LEN).enumerate() {
        let pixel = Pixel::from_bgrx(chunk)?;
        sums[index / PIXELS_PER_GROUP].add(pixel);
    }
    Ok(())
}

/// Reduce one 1920-pixel BGRX row to 160 pixels, each the truncated mean of 12.
pub fn reduce_row(row: &[u8]) -> Result<Vec<Pixel>, ConversionError> {
    let trailing = row.len() % BGRX_LEN;
    if trailing != 0 {
        return Err(ConversionError::BadPixelLength(trailing));
    }
    if row.len() != COLOR_ROW_BYTES {
        return Err(ConversionError::UnexpectedDimensions {
            width: (row.len() / BGRX_LEN) as u32,
            height: 1,
        });
    }
    let mut sums = [BoxSum::default(); GESTURENET_WIDTH];
    accumulate_row(row, &mut sums)?;
    Ok(sums.iter().map(BoxSum::mean).collect())
}

/// Convert a Kinect color frame into a GestureNet frame.
pub fn convert(frame: &RawFrame) -> Result<ConvertedFrame, ConversionError> {
    if frame.kind != FrameKind::Color {
        return Err(ConversionError::WrongFrameKind(frame.kind));
    }
    if frame.format != FrameFormat::Bgrx || frame.bytes_per_pixel != BGRX_LEN {
        return Err(ConversionError::UnexpectedFormat {
            format: frame.format,
            bytes_per_pixel: frame.bytes_per_pixel,
        });
    }
    if frame.width != COLOR_WIDTH || frame.height != COLOR_HEIGHT {
        return Err(ConversionError::UnexpectedDimensions {
            width: frame.width,
            height: frame.height,
        });
    }

    let data = frame.data();
    let mut pixels = Vec::with_capacity(GESTURENET_WIDTH * GESTURENET_HEIGHT);
    for output_row in 0..GESTURENET_HEIGHT {
        let mut sums = [BoxSum::default(); GESTURENET_WIDTH];
        for source_row in source_rows(output_row) {
            let start = source_row * COLOR_ROW_BYTES;
            accumulate_row(&data[start..start + COLOR_ROW_BYTES], &mut sums)?;
        }
        pixels.extend(sums.iter().map(BoxSum::mean));
    }

    Ok(ConvertedFrame { pixels })
}

/// 160x160 RGB input frame for GestureNet. Immutable once built.
///
/// Only `convert` builds one; the pixel grid is private:
///
/// ```compile_fail
/// use kinect_capture::convert::{ConvertedFrame, Pixel};
/// let frame = ConvertedFrame { pixels: vec![Pixel::default(); 160 * 160] };
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ConvertedFrame {
    pixels: Vec<Pixel>,
}

impl ConvertedFrame {
    pub fn width(&self) -> usize {
        GESTURENET_WIDTH
    }

    pub fn height(&self) -> usize {
        GESTURENET_HEIGHT
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Pixel> {
        if x >= GESTURENET_WIDTH || y >= GESTURENET_HEIGHT {
            return None;
        }
        Some(self.pixels[y * GESTURENET_WIDTH + x])
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Pixel]> + '_ {
        self.pixels.chunks_exact(GESTURENET_WIDTH)
    }

    /// Row-major RGB bytes, 160 * 160 * 3 long, no header.
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.pixels.len() * GESTURENET_BYTES_PER_PIXEL);
        for pixel in &self.pixels {
            bytes.extend_from_slice(&pixel.to_bytes());
        }
        bytes
    }

    /// File name for the frame converted from color frame `sequence`.
    ///
    /// The name says BGRX for compatibility with existing consumers; the
    /// content is 3-byte RGB.
    pub fn file_name(sequence: u32) -> String {
        format!(
            "{}x{}-BGRX-seq{}.bin",
            GESTURENET_WIDTH, GESTURENET_HEIGHT, sequence
        )
    }
}

impl std::fmt::Debug for ConvertedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertedFrame")
            .field("width", &GESTURENET_WIDTH)
            .field("height", &GESTURENET_HEIGHT)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SENSOR_BYTES_PER_PIXEL;

    fn color_frame(data: Vec<u8>) -> RawFrame {
        RawFrame::new(
            FrameKind::Color,
            FrameFormat::Bgrx,
            COLOR_WIDTH,
            COLOR_HEIGHT,
            SENSOR_BYTES_PER_PIXEL,
            data,
        )
        .unwrap()
    }

    fn filled(byte: u8) -> Vec<u8> {
        vec![byte; COLOR_WIDTH as usize * COLOR_HEIGHT as usize * SENSOR_BYTES_PER_PIXEL]
    }

    fn row_from_pixels(pixels: &[[u8; 4]]) -> Vec<u8> {
        pixels.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn always_160_by_160() {
        for byte in [0x00, 0xFF] {
            let converted = convert(&color_frame(filled(byte))).unwrap();
            assert_eq!(converted.rows().count(), GESTURENET_HEIGHT);
            assert!(converted.rows().all(|row| row.len() == GESTURENET_WIDTH));
            assert_eq!(
                converted.to_rgb_bytes().len(),
                GESTURENET_WIDTH * GESTURENET_HEIGHT * GESTURENET_BYTES_PER_PIXEL
            );
            let expected = Pixel {
                red: byte,
                green: byte,
                blue: byte,
            };
            assert!(converted.rows().flatten().all(|p| *p == expected));
        }
    }

    #[test]
    fn row_groups_cover_every_source_row_once() {
        let mut next = 0;
        for output_row in 0..GESTURENET_HEIGHT {
            let rows = source_rows(output_row);
            assert_eq!(rows.start, next);
            assert!(rows.len() == 6 || rows.len() == 7, "group {:?}", rows);
            next = rows.end;
        }
        assert_eq!(next, COLOR_HEIGHT as usize);
        assert_eq!(
            (0..4).map(|r| source_rows(r).len()).collect::<Vec<_>>(),
            [6, 7, 7, 7]
        );
    }

    #[test]
    fn from_bgrx_requires_four_bytes() {
        assert_eq!(
            Pixel::from_bgrx(&[1, 2, 3]),
            Err(ConversionError::BadPixelLength(3))
        );
        assert_eq!(
            Pixel::from_bgrx(&[1, 2, 3, 4, 5]),
            Err(ConversionError::BadPixelLength(5))
        );
        assert_eq!(
            Pixel::from_bgrx(&[10, 20, 30, 40]),
            Ok(Pixel {
                red: 30,
                green: 20,
                blue: 10
            })
        );
    }

    #[test]
    fn group_average_truncates() {
        // Blue values 0, 11, ..., 121 sum to 726; 726 / 12 = 60.5 truncates to 60.
        let mut group: Vec<[u8; 4]> = (0..12u8).map(|i| [i * 11, 0, 0, 0xFF]).collect();
        group[0][1] = 11; // green sums to 11, below one full step
        let mut pixels = group.clone();
        pixels.resize(COLOR_WIDTH as usize, [0, 0, 0, 0]);

        let reduced = reduce_row(&row_from_pixels(&pixels)).unwrap();
        assert_eq!(reduced.len(), GESTURENET_WIDTH);
        assert_eq!(reduced[0].blue, 60);
        assert_eq!(reduced[0].green, 0);
        assert_eq!(reduced[1], Pixel::default());
    }

    #[test]
    fn group_average_ignores_pixel_order() {
        let group: Vec<[u8; 4]> = (0..12u8)
            .map(|i| [i * 21, 255 - i * 7, i * 3 + 1, i])
            .collect();
        let mut reversed = group.clone();
        reversed.reverse();
        let mut rotated = group.clone();
        rotated.rotate_left(5);

        let reduce = |g: &[[u8; 4]]| {
            let mut pixels = g.to_vec();
            pixels.resize(COLOR_WIDTH as usize, [0, 0, 0, 0]);
            reduce_row(&row_from_pixels(&pixels)).unwrap()[0]
        };
        assert_eq!(reduce(&group), reduce(&reversed));
        assert_eq!(reduce(&group), reduce(&rotated));
    }

    #[test]
    fn reduce_row_reports_trailing_chunk() {
        let mut row = vec![0u8; COLOR_ROW_BYTES];
        row.push(1);
        row.push(2);
        row.push(3);
        assert_eq!(reduce_row(&row), Err(ConversionError::BadPixelLength(3)));
    }

    #[test]
    fn uniform_rows_match_reduce_row() {
        let row: Vec<u8> = (0..COLOR_WIDTH as usize)
            .flat_map(|x| [(x % 256) as u8, (x / 8) as u8, 255 - (x % 200) as u8, 0])
            .collect();
        let data = row.repeat(COLOR_HEIGHT as usize);
        let converted = convert(&color_frame(data)).unwrap();
        let expected = reduce_row(&row).unwrap();
        for output_row in converted.rows() {
            assert_eq!(output_row, expected.as_slice());
        }
    }

    #[test]
    fn averages_across_row_group() {
        // Output row 0 covers source rows 0..6: five rows of 0 and one of 60 -> 10.
        let mut data = filled(0);
        let row_six_start = 5 * COLOR_ROW_BYTES;
        for chunk in data[row_six_start..row_six_start + COLOR_ROW_BYTES].chunks_mut(4) {
            chunk.copy_from_slice(&[60, 60, 60, 0]);
        }
        let converted = convert(&color_frame(data)).unwrap();
        assert_eq!(
            converted.pixel(0, 0),
            Some(Pixel {
                red: 10,
                green: 10,
                blue: 10
            })
        );
        assert_eq!(converted.pixel(0, 1), Some(Pixel::default()));
        assert_eq!(converted.pixel(160, 0), None);
    }

    #[test]
    fn rejects_non_color_frames() {
        for kind in [FrameKind::Infrared, FrameKind::Depth] {
            let frame = RawFrame::new(kind, FrameFormat::Float, 512, 424, 4, vec![0u8; 512 * 424 * 4])
                .unwrap();
            assert_eq!(convert(&frame), Err(ConversionError::WrongFrameKind(kind)));
        }
    }

    #[test]
    fn rejects_unexpected_color_dimensions() {
        let frame =
            RawFrame::new(FrameKind::Color, FrameFormat::Bgrx, 640, 480, 4, vec![0u8; 640 * 480 * 4])
                .unwrap();
        assert_eq!(
            convert(&frame),
            Err(ConversionError::UnexpectedDimensions {
                width: 640,
                height: 480
            })
        );
    }

    #[test]
    fn converted_file_name_depends_only_on_sequence() {
        assert_eq!(ConvertedFrame::file_name(17), "160x160-BGRX-seq17.bin");
        assert_eq!(ConvertedFrame::file_name(17), ConvertedFrame::file_name(17));
    }
}
