//! Decoded frame payloads held by the frame cache.
//!
//! The cache never looks inside a payload. All it needs is the byte size,
//! exposed through [`FramePayload::mem`].
//!
//! # Pixel Formats
//!
//! - `PixelBuffer::U8`: LDR images (JPG/PNG), 1 byte per channel
//! - `PixelBuffer::F16`: EXR HALF, 2 bytes per channel
//! - `PixelBuffer::F32`: EXR FLOAT, 4 bytes per channel

use half::f16 as F16;

/// Anything the frame cache can hold.
///
/// `mem()` must stay constant for the lifetime of the payload, the cache
/// adds it on insert and subtracts the same value on eviction.
pub trait FramePayload: Send + Sync + 'static {
    /// Size in bytes accounted against the cache budget.
    fn mem(&self) -> usize;
}

/// Pixel buffer format - stores different precision levels
#[derive(Debug, Clone)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    F16(Vec<F16>),
    F32(Vec<f32>),
}

impl PixelBuffer {
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::F16(v) => v.len(),
            PixelBuffer::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded RGBA frame.
#[derive(Debug, Clone)]
pub struct Frame {
    buffer: PixelBuffer,
    width: usize,
    height: usize,
}

impl Frame {
    /// Wrap an 8-bit RGBA buffer.
    pub fn from_u8_buffer(buf: Vec<u8>, width: usize, height: usize) -> Self {
        Self { buffer: PixelBuffer::U8(buf), width, height }
    }

    /// Wrap a half-float RGBA buffer.
    pub fn from_f16_buffer(buf: Vec<F16>, width: usize, height: usize) -> Self {
        Self { buffer: PixelBuffer::F16(buf), width, height }
    }

    /// Wrap a full-float RGBA buffer.
    pub fn from_f32_buffer(buf: Vec<f32>, width: usize, height: usize) -> Self {
        Self { buffer: PixelBuffer::F32(buf), width, height }
    }

    /// Solid black 8-bit frame, used as a stand-in when no decoder is wired.
    pub fn blank(width: usize, height: usize) -> Self {
        Self::from_u8_buffer(vec![0u8; width * height * 4], width, height)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    /// Memory footprint of the pixel data in bytes.
    pub fn mem(&self) -> usize {
        match &self.buffer {
            PixelBuffer::U8(vec) => vec.len(),
            PixelBuffer::F16(vec) => vec.len() * 2,
            PixelBuffer::F32(vec) => vec.len() * 4,
        }
    }
}

impl FramePayload for Frame {
    fn mem(&self) -> usize {
        Frame::mem(self)
    }
}
