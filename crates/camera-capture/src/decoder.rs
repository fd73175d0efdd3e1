//! Frame decoding
//!
//! Turns a raw device buffer into a shaped array: `(height, width)` for
//! single-channel formats, `(height, width, channels)` otherwise.

use image::{DynamicImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use ndarray::{ArrayD, IxDyn};

use crate::codec::{self, LeElement};
use crate::pixel_format::PixelFormat;
use crate::CameraError;

/// Decoded frame pixels
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
}

impl FrameData {
    /// Array shape
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::U8(a) => a.shape(),
            Self::U16(a) => a.shape(),
            Self::U32(a) => a.shape(),
        }
    }

    /// Bytes per element
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U32(_) => 4,
        }
    }

    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        match self {
            Self::U8(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<&ArrayD<u16>> {
        match self {
            Self::U16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<&ArrayD<u32>> {
        match self {
            Self::U32(a) => Some(a),
            _ => None,
        }
    }

    /// Wrap the pixels in an image container, channel order as stored.
    ///
    /// Works for 8 and 16-bit data with 1 to 4 channels.
    pub fn to_image(&self) -> Option<DynamicImage> {
        let (height, width, channels) = match *self.shape() {
            [height, width] => (height, width, 1),
            [height, width, channels] => (height, width, channels),
            _ => return None,
        };
        let (height, width) = (u32::try_from(height).ok()?, u32::try_from(width).ok()?);

        match self {
            Self::U8(a) => {
                let raw: Vec<u8> = a.iter().copied().collect();
                match channels {
                    1 => ImageBuffer::<Luma<u8>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageLuma8),
                    2 => ImageBuffer::<LumaA<u8>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageLumaA8),
                    3 => ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageRgb8),
                    4 => ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageRgba8),
                    _ => None,
                }
            }
            Self::U16(a) => {
                let raw: Vec<u16> = a.iter().copied().collect();
                match channels {
                    1 => ImageBuffer::<Luma<u16>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageLuma16),
                    2 => ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageLumaA16),
                    3 => ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageRgb16),
                    4 => ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, raw)
                        .map(DynamicImage::ImageRgba16),
                    _ => None,
                }
            }
            Self::U32(_) => None,
        }
    }
}

/// Decode a tightly packed buffer
pub fn decode(
    raw: &[u8],
    width: u32,
    height: u32,
    format: &PixelFormat,
) -> Result<FrameData, CameraError> {
    let row_bytes = width as usize * format.bytes_per_pixel()?;
    decode_with_pitch(raw, width, height, row_bytes, format)
}

/// Decode a buffer whose rows start every `pitch` bytes
pub fn decode_with_pitch(
    raw: &[u8],
    width: u32,
    height: u32,
    pitch: usize,
    format: &PixelFormat,
) -> Result<FrameData, CameraError> {
    let layout = format.layout()?;
    let element_bytes = format.element_bytes()?;
    let row_bytes = width as usize * format.bytes_per_pixel()?;
    let rows = height as usize;

    let mut shape = vec![rows, width as usize];
    if layout.channels > 1 {
        shape.push(layout.channels as usize);
    }

    let packed;
    let bytes = if pitch == row_bytes {
        let expected = row_bytes * rows;
        raw.get(..expected).ok_or(CameraError::BufferSize {
            expected,
            actual: raw.len(),
        })?
    } else {
        let mut buffer = vec![0u8; row_bytes * rows];
        codec::copy_strided(raw, &mut buffer, rows, row_bytes, pitch, 0)?;
        packed = buffer;
        &packed[..]
    };

    match element_bytes {
        1 => shaped(bytes, &shape).map(FrameData::U8),
        2 => shaped(bytes, &shape).map(FrameData::U16),
        4 => shaped(bytes, &shape).map(FrameData::U32),
        other => Err(CameraError::UnsupportedFormat(format!(
            "{}: {}-byte elements",
            format.name, other
        ))),
    }
}

fn shaped<T: LeElement>(bytes: &[u8], shape: &[usize]) -> Result<ArrayD<T>, CameraError> {
    let elements = codec::decode_le::<T>(bytes);
    let actual = elements.len() * T::WIDTH;
    ArrayD::from_shape_vec(IxDyn(shape), elements).map_err(|_| CameraError::BufferSize {
        expected: shape.iter().product::<usize>() * T::WIDTH,
        actual,
    })
}
