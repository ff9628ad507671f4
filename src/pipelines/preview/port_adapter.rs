// SPDX-License-Identifier: MPL-2.0

//! Preview port negotiation and the completion callback
//!
//! [`configure`] performs the port calls in a fixed order and stops at the
//! first one that fails, naming it in the error:
//!
//! 1. `set_zero_copy`
//! 2. `commit_format`
//! 3. `set_buffers` with the negotiated count and size
//! 4. buffer pool and filled queue allocation
//! 5. `enable` with the completion callback

use super::PreviewShared;
use crate::backends::camera::{
    BackendError, BufferPool, BufferSink, ExchangeQueue, FrameBuffer, FrameGeometry, PoolStats,
    PortCallback, PreviewPort,
};
use crate::constants::MIN_PREVIEW_BUFFERS;
use crate::errors::{PreviewError, PreviewResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

fn port_call(call: &'static str) -> impl FnOnce(BackendError) -> PreviewError {
    move |err| PreviewError::Configuration {
        call,
        reason: err.to_string(),
    }
}

/// An enabled preview port with its buffer pool and filled queue
pub struct ConfiguredPort {
    port: Box<dyn PreviewPort>,
    pool: Arc<BufferPool>,
    filled: ExchangeQueue,
    sink: Arc<dyn BufferSink>,
    geometry: FrameGeometry,
}

/// Negotiate `port` and start it delivering into a new filled queue
pub fn configure(
    mut port: Box<dyn PreviewPort>,
    shared: &PreviewShared,
) -> PreviewResult<ConfiguredPort> {
    let name = port.name().to_string();

    port.set_zero_copy(true).map_err(port_call("set_zero_copy"))?;
    port.commit_format().map_err(port_call("commit_format"))?;

    let requirements = port.buffer_requirements();
    let (recommended, size) = requirements.negotiated();
    let count = recommended.max(MIN_PREVIEW_BUFFERS);
    port.set_buffers(count, size).map_err(port_call("set_buffers"))?;

    let pool = BufferPool::create(count as usize, size)?;
    let filled = ExchangeQueue::with_capacity(pool.count());

    let callback = completion_callback(filled.clone(), shared.stop_flag());
    let sink = port.enable(callback).map_err(port_call("enable"))?;

    let geometry = port.format().geometry();
    info!(
        port = %name,
        count,
        size,
        width = geometry.width,
        height = geometry.height,
        "Preview port configured"
    );

    Ok(ConfiguredPort {
        port,
        pool: Arc::new(pool),
        filled,
        sink,
        geometry,
    })
}

/// The callback run on the port's context for every filled buffer.
///
/// Never blocks and never touches GPU state.
pub fn completion_callback(filled: ExchangeQueue, stop: Arc<AtomicBool>) -> PortCallback {
    Box::new(move |buffer: FrameBuffer| {
        if buffer.length == 0 {
            debug!(index = buffer.index(), "End of stream, stopping preview");
            stop.store(true, Ordering::SeqCst);
            buffer.release();
            return;
        }

        if buffer.data().is_none() {
            trace!(index = buffer.index(), "Buffer without payload");
            buffer.release();
            return;
        }

        if let Err(buffer) = filled.enqueue(buffer) {
            warn!(index = buffer.index(), "Filled queue rejected buffer, releasing");
            buffer.release();
        }
    })
}

impl ConfiguredPort {
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.pool.stats()
    }

    pub fn filled(&self) -> ExchangeQueue {
        self.filled.clone()
    }

    pub fn sink(&self) -> Arc<dyn BufferSink> {
        Arc::clone(&self.sink)
    }

    pub fn is_enabled(&self) -> bool {
        self.port.is_enabled()
    }

    /// Stop the port; buffers it held go back to the pool
    pub fn disable(&mut self) -> PreviewResult<()> {
        if !self.port.is_enabled() {
            return Ok(());
        }
        self.port.disable().map_err(port_call("disable"))
    }

    /// Disable the port and free the pool and queue.
    ///
    /// Returns how many buffers were not home; zero after a clean shutdown.
    pub fn destroy(mut self) -> usize {
        if let Err(e) = self.disable() {
            warn!(error = %e, "Failed to disable preview port");
        }
        let drained = self.filled.release_all();
        if drained > 0 {
            debug!(drained, "Released buffers left in the filled queue");
        }
        drop(self.sink);

        match Arc::try_unwrap(self.pool) {
            Ok(pool) => pool.destroy(),
            Err(pool) => {
                warn!("Buffer pool still shared at teardown");
                pool.count().saturating_sub(pool.available())
            }
        }
    }
}
