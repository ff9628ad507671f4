// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for camera preview ports

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel encodings a preview port can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Opaque GPU-resident buffer; only a handle crosses the port
    Opaque,
    /// Planar YUV 4:2:0 (Y plane, then U, then V)
    I420,
    /// Packed 8-bit RGBA
    Rgba,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Opaque => write!(f, "OPQV"),
            Encoding::I420 => write!(f, "I420"),
            Encoding::Rgba => write!(f, "RGBA"),
        }
    }
}

/// Frame rate as a fraction; `0/1` means variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Frame interval, or `None` for a variable rate
    pub fn frame_interval(&self) -> Option<std::time::Duration> {
        if self.num == 0 || self.den == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs_f64(
                self.den as f64 / self.num as f64,
            ))
        }
    }
}

/// Visible region inside the (aligned) frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Format negotiated on a preview port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFormat {
    /// Transfer encoding
    pub encoding: Encoding,
    /// Layout of the pixels behind an opaque handle
    pub encoding_variant: Encoding,
    /// Aligned frame width
    pub width: u32,
    /// Aligned frame height
    pub height: u32,
    pub crop: Crop,
    pub frame_rate: Rational,
}

impl Default for PortFormat {
    fn default() -> Self {
        Self {
            encoding: Encoding::Opaque,
            encoding_variant: Encoding::I420,
            width: 0,
            height: 0,
            crop: Crop::default(),
            frame_rate: Rational::new(0, 1),
        }
    }
}

impl PortFormat {
    /// Geometry of the frames this format produces
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            width: self.width,
            height: self.height,
        }
    }
}

/// Dimensions of an I420 frame stored in a pool buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width of the U and V planes
    pub fn chroma_width(&self) -> u32 {
        self.width.div_ceil(2)
    }

    /// Height of the U and V planes
    pub fn chroma_height(&self) -> u32 {
        self.height.div_ceil(2)
    }

    /// Size in bytes of one I420 frame
    pub fn i420_size(&self) -> usize {
        let luma = self.width as usize * self.height as usize;
        let chroma = self.chroma_width() as usize * self.chroma_height() as usize;
        luma + 2 * chroma
    }
}

/// Buffer count/size limits reported by a port after format commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequirements {
    pub num_min: u32,
    pub num_recommended: u32,
    pub size_min: usize,
    pub size_recommended: usize,
}

impl BufferRequirements {
    /// Count and size to allocate: the recommendation, never below the minimum
    pub fn negotiated(&self) -> (u32, usize) {
        (
            self.num_recommended.max(self.num_min),
            self.size_recommended.max(self.size_min),
        )
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two).
///
/// `None` when the result does not fit in a `u32`.
pub const fn align_up(value: u32, alignment: u32) -> Option<u32> {
    match value.checked_add(alignment - 1) {
        Some(sum) => Some(sum & !(alignment - 1)),
        None => None,
    }
}

/// Result type for port operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for port operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Backend is not available on this system
    NotAvailable(String),
    /// Camera device not found
    DeviceNotFound(String),
    /// Format not supported
    FormatNotSupported(String),
    /// A port parameter was rejected
    ParameterRejected(String),
    /// Operation invalid in the port's current state
    InvalidState(String),
    /// General I/O error
    IoError(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::NotAvailable(msg) => write!(f, "Backend not available: {}", msg),
            BackendError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            BackendError::FormatNotSupported(msg) => write!(f, "Format not supported: {}", msg),
            BackendError::ParameterRejected(msg) => write!(f, "Parameter rejected: {}", msg),
            BackendError::InvalidState(msg) => write!(f, "Invalid port state: {}", msg),
            BackendError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(1024, 32), Some(1024));
        assert_eq!(align_up(1000, 32), Some(1024));
        assert_eq!(align_up(768, 16), Some(768));
        assert_eq!(align_up(770, 16), Some(784));
    }

    #[test]
    fn align_up_reports_overflow() {
        assert_eq!(align_up(u32::MAX - 3, 32), None);
        assert_eq!(align_up(u32::MAX - 31, 32), Some(u32::MAX - 31));
    }

    #[test]
    fn i420_size_accounts_for_odd_dimensions() {
        assert_eq!(FrameGeometry::new(4, 2).i420_size(), 8 + 2 + 2);
        assert_eq!(FrameGeometry::new(3, 3).i420_size(), 9 + 4 + 4);
    }

    #[test]
    fn negotiated_never_below_minimum() {
        let reqs = BufferRequirements {
            num_min: 2,
            num_recommended: 1,
            size_min: 4096,
            size_recommended: 128,
        };
        assert_eq!(reqs.negotiated(), (2, 4096));
    }

    #[test]
    fn variable_frame_rate_has_no_interval() {
        assert_eq!(Rational::new(0, 1).frame_interval(), None);
        let interval = Rational::new(30, 1).frame_interval().unwrap();
        assert!((interval.as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);
    }
}
