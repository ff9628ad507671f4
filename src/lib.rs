// SPDX-License-Identifier: MPL-2.0

//! picam - Raspberry Pi camera preview through a GPU scene pipeline
//!
//! A camera preview port fills frame buffers; a render worker thread binds
//! them as external textures, runs a [`Scene`](scenes::Scene) and presents
//! the result. Buffers go back to the camera only after a newer frame has
//! been bound in their place.
//!
//! # Architecture
//!
//! - [`backends`]: camera ports (virtual test pattern, V4L2) and the buffer pool
//! - [`pipelines`]: port negotiation, render worker and lifecycle controller
//! - [`scenes`]: the pluggable renderers
//! - [`gpu`]: the GPU boundary, its wgpu device and a CPU test double
//! - [`shaders`]: WGSL scene programs and their validation
//! - [`session`]: programmatic entry points
//! - [`config`]: user configuration
//!
//! # Example
//!
//! ```ignore
//! let session = picam::PreviewSession::start_preview(0, 0, 1024, 768, 5000)?;
//! session.run_until_timeout_or_stopped();
//! session.stop_and_teardown();
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod gpu;
pub mod media;
pub mod pipelines;
pub mod scenes;
pub mod session;
pub mod shaders;

// Re-export commonly used types
pub use config::Config;
pub use errors::{AppError, PreviewError, PreviewResult};
pub use scenes::SceneKind;
pub use session::{PreviewSession, RunOutcome, TeardownReport, Timeout};
