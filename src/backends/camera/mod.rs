// SPDX-License-Identifier: GPL-3.0-only

//! Camera preview port abstraction
//!
//! The preview renderer only ever talks to a camera through [`PreviewPort`]
//! (configuration) and [`BufferSink`] (returning empty buffers once the port
//! is enabled). Filled buffers come back through the [`PortCallback`] on a
//! port-owned execution context.
//!
//! ```text
//! ┌─────────────────────┐
//! │   PreviewRenderer   │
//! └──────────┬──────────┘
//!            │ configure / enable
//!            ▼
//! ┌─────────────────────┐
//! │  PreviewPort trait  │
//! └──────────┬──────────┘
//!       ┌────┴─────┐
//!       ▼          ▼
//!   ┌───────┐  ┌───────┐
//!   │Virtual│  │ V4L2  │
//!   └───────┘  └───────┘
//! ```

pub mod buffer;
pub mod component;
pub mod frame_loop;
pub mod port_core;
pub mod types;
#[cfg(feature = "v4l2")]
pub mod v4l2_port;
pub mod virtual_port;

pub use buffer::{BufferPool, ClientBuffer, ExchangeQueue, FrameBuffer, PoolStats};
pub use types::*;

use std::fmt;
use std::sync::Arc;

/// Completion callback invoked by the port for every filled buffer.
///
/// Runs on the port's own execution context and must return quickly.
pub type PortCallback = Box<dyn Fn(FrameBuffer) + Send + Sync>;

/// A buffer the port refused, handed back to the caller
pub struct SendError {
    pub buffer: FrameBuffer,
    pub error: BackendError,
}

impl fmt::Debug for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("buffer", &self.buffer.index())
            .field("error", &self.error)
            .finish()
    }
}

/// Accepts empty buffers for the port to fill
pub trait BufferSink: Send + Sync {
    /// Hand an empty buffer to the port.
    ///
    /// On failure the buffer is returned so the caller can release it.
    fn send_buffer(&self, buffer: FrameBuffer) -> Result<(), SendError>;
}

/// Camera preview output port
pub trait PreviewPort: Send {
    /// Port name used in logs
    fn name(&self) -> &str;

    /// Toggle zero-copy transfer (only the opaque handle crosses the port)
    fn set_zero_copy(&mut self, enabled: bool) -> BackendResult<()>;

    /// Format that will be applied by the next commit
    fn format(&self) -> &PortFormat;

    /// Mutable access to the pending format
    fn format_mut(&mut self) -> &mut PortFormat;

    /// Apply the pending format
    fn commit_format(&mut self) -> BackendResult<()>;

    /// Buffer limits for the committed format
    fn buffer_requirements(&self) -> BufferRequirements;

    /// Set the number and size of buffers the client will provide
    fn set_buffers(&mut self, count: u32, size: usize) -> BackendResult<()>;

    /// Start the port; every filled buffer is passed to `callback`
    fn enable(&mut self, callback: PortCallback) -> BackendResult<Arc<dyn BufferSink>>;

    /// Stop the port and release any buffers it still holds
    fn disable(&mut self) -> BackendResult<()>;

    fn is_enabled(&self) -> bool;
}
