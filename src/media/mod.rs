// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format helpers
//!
//! Camera frames arrive as I420 (YUV 4:2:0). The [`yuv`] module splits them
//! into planes, converts them to RGBA for external images and generates the
//! virtual port's test pattern.

pub mod yuv;

pub use yuv::{I420Planes, i420_to_rgba, split_planes, yuv_to_rgb};
