// SPDX-License-Identifier: MPL-2.0

//! Processing pipelines
//!
//! # Modules
//!
//! - [`preview`]: camera buffers to GPU textures to the screen

pub mod preview;
