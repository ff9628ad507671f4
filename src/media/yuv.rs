// SPDX-License-Identifier: GPL-3.0-only

//! I420 helpers: plane access, conversion to RGBA and the test pattern
//!
//! I420 stores a full-resolution Y plane followed by quarter-resolution U and
//! V planes. Conversion uses BT.601 coefficients, matching what the VideoCore
//! driver does when it imports an opaque camera buffer as an external image.

use crate::backends::camera::types::FrameGeometry;

/// Borrowed Y, U and V planes of one I420 frame
#[derive(Debug, Clone, Copy)]
pub struct I420Planes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
}

/// Split `data` into its three planes, or `None` if it is too short
pub fn split_planes(data: &[u8], geometry: FrameGeometry) -> Option<I420Planes<'_>> {
    let luma = geometry.width as usize * geometry.height as usize;
    let chroma = geometry.chroma_width() as usize * geometry.chroma_height() as usize;
    if data.len() < luma + 2 * chroma {
        return None;
    }
    let (y, rest) = data.split_at(luma);
    let (u, rest) = rest.split_at(chroma);
    Some(I420Planes {
        y,
        u,
        v: &rest[..chroma],
    })
}

/// Convert one YUV sample to RGB (BT.601)
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;

    (r, g, b)
}

/// Convert an I420 frame to packed RGBA
pub fn i420_to_rgba(planes: &I420Planes<'_>, geometry: FrameGeometry) -> Vec<u8> {
    let width = geometry.width as usize;
    let height = geometry.height as usize;
    let chroma_width = geometry.chroma_width() as usize;
    let mut rgba = vec![0u8; width * height * 4];

    for (row, out_row) in rgba.chunks_exact_mut(width * 4).enumerate() {
        let y_row = &planes.y[row * width..(row + 1) * width];
        let c_start = (row / 2) * chroma_width;
        let u_row = &planes.u[c_start..c_start + chroma_width];
        let v_row = &planes.v[c_start..c_start + chroma_width];

        for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
            let (r, g, b) = yuv_to_rgb(y_row[col], u_row[col / 2], v_row[col / 2]);
            px.copy_from_slice(&[r, g, b, 255]);
        }
    }

    rgba
}

/// Expand a single 8-bit plane to RGBA the way a luminance texture samples
pub fn plane_to_rgba(plane: &[u8], width: u32, height: u32) -> Vec<u8> {
    let count = width as usize * height as usize;
    let mut rgba = Vec::with_capacity(count * 4);
    for &value in plane.iter().take(count) {
        rgba.extend_from_slice(&[value, value, value, 255]);
    }
    rgba.resize(count * 4, 0);
    rgba
}

/// Colour bars in (Y, U, V): white, yellow, cyan, green, magenta, red, blue, black
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Pixels the bars scroll per frame
const PATTERN_STEP: u64 = 4;

/// Write frame `frame` of the scrolling colour-bar pattern into `data`
pub fn fill_test_pattern(data: &mut [u8], geometry: FrameGeometry, frame: u64) {
    let width = geometry.width as usize;
    let height = geometry.height as usize;
    if width == 0 || height == 0 {
        return;
    }
    let chroma_width = geometry.chroma_width() as usize;
    let chroma_height = geometry.chroma_height() as usize;
    let luma = width * height;
    let chroma = chroma_width * chroma_height;
    if data.len() < luma + 2 * chroma {
        return;
    }

    let shift = (frame * PATTERN_STEP) as usize % width;
    let bar_at = |x: usize| {
        let pos = (x + shift) % width;
        BARS[pos * BARS.len() / width]
    };

    let (y_plane, rest) = data.split_at_mut(luma);
    let (u_plane, rest) = rest.split_at_mut(chroma);
    let v_plane = &mut rest[..chroma];

    for row in y_plane.chunks_exact_mut(width) {
        for (x, value) in row.iter_mut().enumerate() {
            *value = bar_at(x).0;
        }
    }
    for row in 0..chroma_height {
        for cx in 0..chroma_width {
            let (_, u, v) = bar_at((cx * 2).min(width - 1));
            u_plane[row * chroma_width + cx] = u;
            v_plane[row * chroma_width + cx] = v;
        }
    }
}
