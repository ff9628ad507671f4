// SPDX-License-Identifier: GPL-3.0-only

//! Preview buffer pool and exchange queue
//!
//! Buffers are move-only [`FrameBuffer`] values. A buffer is always owned by
//! exactly one party: the pool's empty queue, the camera port, the filled
//! [`ExchangeQueue`], or the render worker. [`FrameBuffer::release`] hands it
//! back to the pool it came from.
//!
//! ```text
//!  BufferPool ──acquire_empty──▶ render worker ──send_buffer──▶ port
//!      ▲                              │                          │
//!      │                          release                   (callback)
//!      └──────────────────────────────┘◀──── ExchangeQueue ◀─────┘
//! ```

use super::types::{BackendError, BackendResult, FrameGeometry};
use crate::errors::{PreviewError, PreviewResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Opaque handles are unique per process, like VideoCore buffer handles
static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

/// Counters shared by a pool and every buffer it allocated
#[derive(Debug, Default)]
pub struct PoolStats {
    live_allocations: AtomicUsize,
    releases: AtomicU64,
    hazards: AtomicU64,
}

impl PoolStats {
    /// Buffer memories that have not been freed yet
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    /// Total number of `FrameBuffer::release` calls
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    /// Times a port overwrote memory the GPU still referenced
    pub fn hazards(&self) -> u64 {
        self.hazards.load(Ordering::SeqCst)
    }
}

/// Pixel contents of one pool slot
#[derive(Debug)]
pub struct FrameData {
    pub geometry: FrameGeometry,
    pub bytes: Vec<u8>,
}

/// Backing memory of one pool slot
#[derive(Debug)]
struct BufferMemory {
    handle: u32,
    frame: RwLock<FrameData>,
    gpu_refs: AtomicUsize,
    stats: Arc<PoolStats>,
}

impl Drop for BufferMemory {
    fn drop(&mut self) {
        self.stats.live_allocations.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The opaque payload of a buffer: what a zero-copy port passes instead of pixels.
///
/// The GPU resolves it to pixel data when creating an external image.
#[derive(Debug, Clone)]
pub struct ClientBuffer(Arc<BufferMemory>);

impl ClientBuffer {
    pub fn handle(&self) -> u32 {
        self.0.handle
    }

    /// Read access to the frame behind the handle
    pub fn frame(&self) -> RwLockReadGuard<'_, FrameData> {
        self.0.frame.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the memory as referenced by a GPU image until the guard drops
    pub fn gpu_ref(&self) -> GpuRef {
        self.0.gpu_refs.fetch_add(1, Ordering::SeqCst);
        GpuRef(Arc::clone(&self.0))
    }

    /// Number of GPU images currently referencing this memory
    pub fn gpu_ref_count(&self) -> usize {
        self.0.gpu_refs.load(Ordering::SeqCst)
    }
}

/// Keeps a buffer's memory marked as in use by the GPU
#[derive(Debug)]
pub struct GpuRef(Arc<BufferMemory>);

impl Drop for GpuRef {
    fn drop(&mut self) {
        self.0.gpu_refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A preview buffer header
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    /// Bytes of valid data; zero signals end of stream
    pub length: usize,
    /// Frame counter stamped by the port when filling
    pub sequence: u64,
    data: Option<ClientBuffer>,
    memory: Arc<BufferMemory>,
    recycler: Sender<FrameBuffer>,
}

impl FrameBuffer {
    /// Slot index inside the owning pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Allocated size of the slot
    pub fn capacity(&self) -> usize {
        self.memory
            .frame
            .read()
            .map(|f| f.bytes.len())
            .unwrap_or_else(|e| e.into_inner().bytes.len())
    }

    /// The opaque payload, if the port attached one
    pub fn data(&self) -> Option<&ClientBuffer> {
        self.data.as_ref()
    }

    /// Detach the payload (a port delivering a header without a handle)
    pub fn clear_data(&mut self) {
        self.data = None;
    }

    /// Write a frame into the slot and set `length`.
    ///
    /// `write` receives the slot bytes truncated to the frame size.
    pub fn fill<F>(&mut self, geometry: FrameGeometry, sequence: u64, write: F) -> BackendResult<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let needed = geometry.i420_size();
        if self.memory.gpu_refs.load(Ordering::SeqCst) > 0 {
            self.memory.stats.hazards.fetch_add(1, Ordering::SeqCst);
            warn!(
                index = self.index,
                handle = self.memory.handle,
                "Port is overwriting a buffer the GPU still references"
            );
        }

        let mut frame = self.memory.frame.write().unwrap_or_else(|e| e.into_inner());
        if needed > frame.bytes.len() {
            return Err(BackendError::FormatNotSupported(format!(
                "{}x{} frame needs {} bytes, buffer holds {}",
                geometry.width,
                geometry.height,
                needed,
                frame.bytes.len()
            )));
        }
        frame.geometry = geometry;
        write(&mut frame.bytes[..needed]);
        drop(frame);

        self.length = needed;
        self.sequence = sequence;
        self.data = Some(ClientBuffer(Arc::clone(&self.memory)));
        Ok(())
    }

    /// Mark the buffer as an end-of-stream marker
    pub fn set_end_of_stream(&mut self) {
        self.length = 0;
    }

    /// Return the buffer to the pool it was allocated from
    pub fn release(mut self) {
        self.length = 0;
        self.data = Some(ClientBuffer(Arc::clone(&self.memory)));
        self.memory.stats.releases.fetch_add(1, Ordering::SeqCst);

        let recycler = self.recycler.clone();
        if let Err(err) = recycler.try_send(self) {
            // Pool already destroyed; the memory goes with the buffer
            trace!(index = err.into_inner().index, "Released buffer after pool teardown");
        }
    }
}

/// Fixed set of preview buffers plus the queue of empty ones
pub struct BufferPool {
    empty: Receiver<FrameBuffer>,
    count: usize,
    size: usize,
    stats: Arc<PoolStats>,
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes
    pub fn create(count: usize, size: usize) -> PreviewResult<Self> {
        if count == 0 || size == 0 {
            return Err(PreviewError::ResourceExhaustion(format!(
                "cannot create a pool of {} buffers of {} bytes",
                count, size
            )));
        }

        let stats = Arc::new(PoolStats::default());
        let (recycler, empty) = crossbeam_channel::bounded(count);

        for index in 0..count {
            let mut bytes = Vec::new();
            bytes.try_reserve_exact(size).map_err(|e| {
                PreviewError::ResourceExhaustion(format!(
                    "buffer {} of {} ({} bytes): {}",
                    index, count, size, e
                ))
            })?;
            bytes.resize(size, 0);

            stats.live_allocations.fetch_add(1, Ordering::SeqCst);
            let memory = Arc::new(BufferMemory {
                handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
                frame: RwLock::new(FrameData {
                    geometry: FrameGeometry::default(),
                    bytes,
                }),
                gpu_refs: AtomicUsize::new(0),
                stats: Arc::clone(&stats),
            });

            let buffer = FrameBuffer {
                index,
                length: 0,
                sequence: 0,
                data: Some(ClientBuffer(Arc::clone(&memory))),
                memory,
                recycler: recycler.clone(),
            };
            if recycler.try_send(buffer).is_err() {
                return Err(PreviewError::ResourceExhaustion(
                    "buffer pool queue rejected a new buffer".into(),
                ));
            }
        }

        debug!(count, size, "Created preview buffer pool");
        Ok(Self {
            empty,
            count,
            size,
            stats,
        })
    }

    /// Take an empty buffer without blocking
    pub fn acquire_empty(&self) -> Option<FrameBuffer> {
        self.empty.try_recv().ok()
    }

    /// Buffers currently sitting in the empty queue
    pub fn available(&self) -> usize {
        self.empty.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Free the pool, returning how many buffers were not home.
    ///
    /// Must be called after the port and the render worker have stopped
    /// touching buffers; anything still held elsewhere is freed when its
    /// holder drops it.
    pub fn destroy(self) -> usize {
        let mut home = 0;
        while let Ok(buffer) = self.empty.try_recv() {
            home += 1;
            drop(buffer);
        }

        let outstanding = self.count.saturating_sub(home);
        if outstanding > 0 {
            warn!(outstanding, count = self.count, "Destroying pool with buffers still in use");
        } else {
            debug!(count = self.count, "Destroyed preview buffer pool");
        }
        outstanding
    }
}

/// FIFO of filled buffers travelling from the port callback to the renderer
#[derive(Clone)]
pub struct ExchangeQueue {
    sender: Sender<FrameBuffer>,
    receiver: Receiver<FrameBuffer>,
}

impl ExchangeQueue {
    /// Queue able to hold every buffer of a pool of `capacity`
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Enqueue without blocking; hands the buffer back if the queue is full
    pub fn enqueue(&self, buffer: FrameBuffer) -> Result<(), FrameBuffer> {
        self.sender.try_send(buffer).map_err(|e| e.into_inner())
    }

    /// Dequeue without blocking
    pub fn dequeue(&self) -> Option<FrameBuffer> {
        self.receiver.try_recv().ok()
    }

    /// Dequeue, waiting at most `timeout` for a buffer to arrive
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<FrameBuffer> {
        match self.receiver.recv_timeout(timeout) {
            Ok(buffer) => Some(buffer),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Release every queued buffer back to its pool, returning how many
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while let Some(buffer) = self.dequeue() {
            buffer.release();
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_frame() -> FrameGeometry {
        FrameGeometry::new(4, 4)
    }

    #[test]
    fn test_create_rejects_empty_pool() {
        assert!(matches!(
            BufferPool::create(0, 128),
            Err(PreviewError::ResourceExhaustion(_))
        ));
        assert!(matches!(
            BufferPool::create(3, 0),
            Err(PreviewError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn test_acquire_until_drained() {
        let pool = BufferPool::create(3, 64).unwrap();
        let a = pool.acquire_empty().unwrap();
        let b = pool.acquire_empty().unwrap();
        let c = pool.acquire_empty().unwrap();
        assert!(pool.acquire_empty().is_none());

        a.release();
        assert_eq!(pool.available(), 1);
        b.release();
        c.release();
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.stats().releases(), 3);
    }

    #[test]
    fn test_release_resets_length() {
        let pool = BufferPool::create(1, 64).unwrap();
        let mut buf = pool.acquire_empty().unwrap();
        buf.fill(small_frame(), 7, |bytes| bytes.fill(0x80)).unwrap();
        assert_eq!(buf.length, small_frame().i420_size());
        buf.clear_data();
        buf.release();

        let buf = pool.acquire_empty().unwrap();
        assert_eq!(buf.length, 0);
        assert!(buf.data().is_some());
    }

    #[test]
    fn test_fill_rejects_oversized_frame() {
        let pool = BufferPool::create(1, 8).unwrap();
        let mut buf = pool.acquire_empty().unwrap();
        let result = buf.fill(FrameGeometry::new(16, 16), 0, |_| {});
        assert!(matches!(result, Err(BackendError::FormatNotSupported(_))));
        assert_eq!(buf.length, 0);
    }

    #[test]
    fn test_fill_while_gpu_bound_is_a_hazard() {
        let pool = BufferPool::create(1, 64).unwrap();
        let stats = pool.stats();
        let mut buf = pool.acquire_empty().unwrap();
        let guard = buf.data().unwrap().gpu_ref();

        buf.fill(small_frame(), 1, |_| {}).unwrap();
        assert_eq!(stats.hazards(), 1);

        drop(guard);
        buf.fill(small_frame(), 2, |_| {}).unwrap();
        assert_eq!(stats.hazards(), 1);
    }

    #[test]
    fn test_destroy_reports_outstanding_and_frees() {
        let pool = BufferPool::create(4, 32).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.live_allocations(), 4);

        let held = pool.acquire_empty().unwrap();
        assert_eq!(pool.destroy(), 1);
        assert_eq!(stats.live_allocations(), 1);

        // Releasing after teardown frees the memory instead of dangling
        held.release();
        assert_eq!(stats.live_allocations(), 0);
    }

    #[test]
    fn test_exchange_queue_is_fifo() {
        let pool = BufferPool::create(3, 64).unwrap();
        let queue = ExchangeQueue::with_capacity(pool.count());
        for seq in 0..3 {
            let mut buf = pool.acquire_empty().unwrap();
            buf.fill(small_frame(), seq, |_| {}).unwrap();
            queue.enqueue(buf).unwrap();
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue())
            .map(|b| {
                let seq = b.sequence;
                b.release();
                seq
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_dequeue_timeout_returns_none_when_idle() {
        let queue = ExchangeQueue::with_capacity(2);
        assert!(queue.dequeue_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_release_all_drains_queue() {
        let pool = BufferPool::create(2, 64).unwrap();
        let queue = ExchangeQueue::with_capacity(2);
        queue.enqueue(pool.acquire_empty().unwrap()).unwrap();
        queue.enqueue(pool.acquire_empty().unwrap()).unwrap();
        assert_eq!(queue.release_all(), 2);
        assert!(queue.is_empty());
        assert_eq!(pool.available(), 2);
    }
}
