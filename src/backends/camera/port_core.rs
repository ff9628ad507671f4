// SPDX-License-Identifier: GPL-3.0-only

//! Buffer bookkeeping shared by the in-tree preview ports
//!
//! A port owns the buffers the client has sent it until it fills them. The
//! capture thread takes one, asks the [`FrameSource`] to write the next frame
//! into it and hands it to the completion callback.

use super::buffer::FrameBuffer;
use super::frame_loop::{FrameLoopController, LoopAction};
use super::types::{BackendError, BackendResult};
use super::{BufferSink, PortCallback, SendError};
use crate::constants::PORT_BUFFER_WAIT;
use crate::constants::timing::WORKER_INIT_TIMEOUT_SECS;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a source produced for one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// A frame was written into the buffer
    Frame,
    /// The source is exhausted; the buffer becomes an end-of-stream marker
    EndOfStream,
}

/// Producer of frames for a port's capture thread.
///
/// Lives on the capture thread for its whole life.
pub trait FrameSource: 'static {
    /// Write the next frame into `buffer`.
    ///
    /// May block until the frame is due.
    fn next_frame(&mut self, buffer: &mut FrameBuffer, sequence: u64) -> BackendResult<SourceStatus>;
}

struct CoreSink {
    enabled: Arc<AtomicBool>,
    sent: Sender<FrameBuffer>,
}

impl BufferSink for CoreSink {
    fn send_buffer(&self, buffer: FrameBuffer) -> Result<(), SendError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(SendError {
                buffer,
                error: BackendError::InvalidState("port is disabled".into()),
            });
        }
        self.sent.send(buffer).map_err(|e| SendError {
            buffer: e.into_inner(),
            error: BackendError::InvalidState("port queue closed".into()),
        })
    }
}

/// Sent-buffer queue plus the capture thread driving a [`FrameSource`]
pub struct PortCore {
    name: String,
    enabled: Arc<AtomicBool>,
    sent_tx: Sender<FrameBuffer>,
    sent_rx: Receiver<FrameBuffer>,
    capture: Option<FrameLoopController>,
}

impl PortCore {
    pub fn new(name: &str) -> Self {
        let (sent_tx, sent_rx) = crossbeam_channel::unbounded();
        Self {
            name: name.to_string(),
            enabled: Arc::new(AtomicBool::new(false)),
            sent_tx,
            sent_rx,
            capture: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Start the capture thread and return the sink clients send buffers to.
    ///
    /// `open` runs on the capture thread and builds the source there; its
    /// failure is returned from here and the port stays disabled.
    pub fn enable<S, I>(&mut self, open: I, callback: PortCallback) -> BackendResult<Arc<dyn BufferSink>>
    where
        S: FrameSource,
        I: FnOnce() -> BackendResult<S> + Send + 'static,
    {
        if self.is_enabled() {
            return Err(BackendError::InvalidState(format!(
                "{} is already enabled",
                self.name
            )));
        }

        let sent = self.sent_rx.clone();
        let name = self.name.clone();
        let mut sequence = 0u64;

        let (mut capture, init) = FrameLoopController::start_with_init(
            &format!("{}-capture", self.name),
            Arc::new(AtomicBool::new(false)),
            open,
            move |source: &mut S| {
                let Ok(mut buffer) = sent.recv_timeout(PORT_BUFFER_WAIT) else {
                    // Starved: the client has not returned any buffer yet
                    return LoopAction::Continue;
                };

                match source.next_frame(&mut buffer, sequence) {
                    Ok(SourceStatus::Frame) => {
                        sequence += 1;
                        callback(buffer);
                        LoopAction::Continue
                    }
                    Ok(SourceStatus::EndOfStream) => {
                        info!(port = %name, frames = sequence, "Source exhausted, sending end of stream");
                        buffer.set_end_of_stream();
                        callback(buffer);
                        LoopAction::Stop
                    }
                    Err(e) => {
                        warn!(port = %name, error = %e, "Capture failed, sending end of stream");
                        buffer.set_end_of_stream();
                        callback(buffer);
                        LoopAction::Stop
                    }
                }
            },
            |_source| {},
        )?;

        match init.recv_timeout(Duration::from_secs(WORKER_INIT_TIMEOUT_SECS)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                capture.join();
                return Err(e);
            }
            Err(_) => {
                capture.stop();
                return Err(BackendError::IoError(format!(
                    "{} capture thread did not start",
                    self.name
                )));
            }
        }

        self.enabled.store(true, Ordering::SeqCst);
        self.capture = Some(capture);
        Ok(Arc::new(CoreSink {
            enabled: Arc::clone(&self.enabled),
            sent: self.sent_tx.clone(),
        }))
    }

    /// Stop the capture thread and release every buffer still held
    pub fn disable(&mut self) -> usize {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        let mut released = 0;
        while let Ok(buffer) = self.sent_rx.try_recv() {
            buffer.release();
            released += 1;
        }
        debug!(port = %self.name, released, "Port disabled");
        released
    }

    /// Buffers sent to the port and not yet filled
    pub fn held(&self) -> usize {
        self.sent_rx.len()
    }
}

impl Drop for PortCore {
    fn drop(&mut self) {
        if self.is_enabled() || self.capture.is_some() {
            self.disable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::buffer::BufferPool;
    use crate::backends::camera::types::FrameGeometry;

    struct CountingSource {
        limit: u64,
    }

    impl FrameSource for CountingSource {
        fn next_frame(
            &mut self,
            buffer: &mut FrameBuffer,
            sequence: u64,
        ) -> BackendResult<SourceStatus> {
            if sequence >= self.limit {
                return Ok(SourceStatus::EndOfStream);
            }
            buffer.fill(FrameGeometry::new(2, 2), sequence, |bytes| bytes.fill(1))?;
            Ok(SourceStatus::Frame)
        }
    }

    #[test]
    fn test_frames_then_end_of_stream() {
        let pool = BufferPool::create(3, 64).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut core = PortCore::new("test");
        let sink = core
            .enable(
                || Ok(CountingSource { limit: 2 }),
                Box::new(move |buf| {
                    let _ = tx.send((buf.length, buf.sequence));
                    buf.release();
                }),
            )
            .unwrap();

        while let Some(buf) = pool.acquire_empty() {
            sink.send_buffer(buf).unwrap();
        }

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let eos = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, (6, 0));
        assert_eq!(second, (6, 1));
        assert_eq!(eos.0, 0);

        core.disable();
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_disabled_sink_returns_buffer() {
        let pool = BufferPool::create(1, 64).unwrap();
        let mut core = PortCore::new("test");
        let sink = core
            .enable(|| Ok(CountingSource { limit: 0 }), Box::new(|buf| buf.release()))
            .unwrap();
        core.disable();

        let err = sink.send_buffer(pool.acquire_empty().unwrap()).unwrap_err();
        assert!(matches!(err.error, BackendError::InvalidState(_)));
        err.buffer.release();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_open_failure_leaves_port_disabled() {
        let mut core = PortCore::new("test");
        let result = core.enable(
            || Err::<CountingSource, _>(BackendError::DeviceNotFound("/dev/video9".into())),
            Box::new(|buf| buf.release()),
        );
        assert!(matches!(result, Err(BackendError::DeviceNotFound(_))));
        assert!(!core.is_enabled());
    }
}
