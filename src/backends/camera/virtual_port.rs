// SPDX-License-Identifier: GPL-3.0-only

//! Simulated camera preview port
//!
//! Produces an animated I420 test pattern at the committed frame rate so the
//! whole preview pipeline runs without camera hardware. An optional frame
//! limit ends the stream with a zero-length buffer, like a camera component
//! being torn down underneath the preview.

use super::buffer::FrameBuffer;
use super::port_core::{FrameSource, PortCore, SourceStatus};
use super::types::*;
use super::{BufferSink, PortCallback, PreviewPort};
use crate::constants::MIN_PREVIEW_BUFFERS;
use crate::media::yuv;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Options for the simulated port
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualPortOptions {
    /// Send end of stream after this many frames
    pub frame_limit: Option<u64>,
}

pub struct VirtualPreviewPort {
    name: String,
    options: VirtualPortOptions,
    zero_copy: bool,
    pending: PortFormat,
    committed: Option<PortFormat>,
    buffers: Option<(u32, usize)>,
    core: PortCore,
}

impl VirtualPreviewPort {
    pub fn new(options: VirtualPortOptions) -> Self {
        Self {
            name: "vc.ril.camera:out:0".to_string(),
            options,
            zero_copy: false,
            pending: PortFormat::default(),
            committed: None,
            buffers: None,
            core: PortCore::new("virtual"),
        }
    }

    /// Whether zero-copy was requested by the client
    pub fn zero_copy(&self) -> bool {
        self.zero_copy
    }

    /// Buffers the port holds waiting to be filled
    pub fn held_buffers(&self) -> usize {
        self.core.held()
    }
}

impl PreviewPort for VirtualPreviewPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_zero_copy(&mut self, enabled: bool) -> BackendResult<()> {
        if self.core.is_enabled() {
            return Err(BackendError::InvalidState(
                "zero copy cannot change while enabled".into(),
            ));
        }
        self.zero_copy = enabled;
        Ok(())
    }

    fn format(&self) -> &PortFormat {
        &self.pending
    }

    fn format_mut(&mut self) -> &mut PortFormat {
        &mut self.pending
    }

    fn commit_format(&mut self) -> BackendResult<()> {
        let format = &self.pending;
        if format.encoding == Encoding::Rgba || format.encoding_variant == Encoding::Rgba {
            return Err(BackendError::FormatNotSupported(format!(
                "{}/{} is not produced by the preview port",
                format.encoding, format.encoding_variant
            )));
        }
        if format.width == 0 || format.height == 0 {
            return Err(BackendError::ParameterRejected(format!(
                "invalid frame size {}x{}",
                format.width, format.height
            )));
        }
        let crop_right = u64::from(format.crop.x) + u64::from(format.crop.width);
        let crop_bottom = u64::from(format.crop.y) + u64::from(format.crop.height);
        if crop_right > u64::from(format.width) || crop_bottom > u64::from(format.height) {
            return Err(BackendError::ParameterRejected(
                "crop rectangle exceeds the frame".into(),
            ));
        }

        debug!(
            width = format.width,
            height = format.height,
            encoding = %format.encoding,
            variant = %format.encoding_variant,
            "Committed virtual port format"
        );
        self.committed = Some(format.clone());
        Ok(())
    }

    fn buffer_requirements(&self) -> BufferRequirements {
        let size = self
            .committed
            .as_ref()
            .map(|f| f.geometry().i420_size())
            .unwrap_or(0);
        BufferRequirements {
            num_min: 1,
            num_recommended: MIN_PREVIEW_BUFFERS,
            size_min: size,
            size_recommended: size,
        }
    }

    fn set_buffers(&mut self, count: u32, size: usize) -> BackendResult<()> {
        let reqs = self.buffer_requirements();
        if count < reqs.num_min || size < reqs.size_min {
            return Err(BackendError::ParameterRejected(format!(
                "{} buffers of {} bytes is below the minimum of {} x {}",
                count, size, reqs.num_min, reqs.size_min
            )));
        }
        self.buffers = Some((count, size));
        Ok(())
    }

    fn enable(&mut self, callback: PortCallback) -> BackendResult<Arc<dyn BufferSink>> {
        let format = self
            .committed
            .clone()
            .ok_or_else(|| BackendError::InvalidState("format not committed".into()))?;
        if self.buffers.is_none() {
            return Err(BackendError::InvalidState("buffers not configured".into()));
        }

        info!(
            width = format.width,
            height = format.height,
            frame_limit = ?self.options.frame_limit,
            "Enabling virtual preview port"
        );
        let source = PatternSource {
            geometry: format.geometry(),
            interval: format.frame_rate.frame_interval(),
            frame_limit: self.options.frame_limit,
            next_due: None,
        };
        self.core.enable(move || Ok(source), callback)
    }

    fn disable(&mut self) -> BackendResult<()> {
        if !self.core.is_enabled() {
            return Err(BackendError::InvalidState("port is not enabled".into()));
        }
        self.core.disable();
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }
}

struct PatternSource {
    geometry: FrameGeometry,
    interval: Option<Duration>,
    frame_limit: Option<u64>,
    next_due: Option<Instant>,
}

impl FrameSource for PatternSource {
    fn next_frame(&mut self, buffer: &mut FrameBuffer, sequence: u64) -> BackendResult<SourceStatus> {
        if self.frame_limit.is_some_and(|limit| sequence >= limit) {
            return Ok(SourceStatus::EndOfStream);
        }

        if let Some(interval) = self.interval {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + interval);
        }

        let geometry = self.geometry;
        buffer.fill(geometry, sequence, |bytes| {
            yuv::fill_test_pattern(bytes, geometry, sequence)
        })?;
        Ok(SourceStatus::Frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::buffer::BufferPool;

    fn committed_port(limit: Option<u64>) -> VirtualPreviewPort {
        let mut port = VirtualPreviewPort::new(VirtualPortOptions { frame_limit: limit });
        let format = port.format_mut();
        format.width = 64;
        format.height = 48;
        format.crop = Crop {
            x: 0,
            y: 0,
            width: 64,
            height: 48,
        };
        port.commit_format().unwrap();
        port
    }

    #[test]
    fn test_commit_rejects_zero_size() {
        let mut port = VirtualPreviewPort::new(VirtualPortOptions::default());
        assert!(matches!(
            port.commit_format(),
            Err(BackendError::ParameterRejected(_))
        ));
    }

    #[test]
    fn test_requirements_follow_committed_format() {
        let port = committed_port(None);
        let reqs = port.buffer_requirements();
        assert_eq!(reqs.size_min, FrameGeometry::new(64, 48).i420_size());
        assert_eq!(reqs.num_recommended, MIN_PREVIEW_BUFFERS);
    }

    #[test]
    fn test_enable_requires_buffers() {
        let mut port = committed_port(None);
        let result = port.enable(Box::new(|buf| buf.release()));
        assert!(matches!(result, Err(BackendError::InvalidState(_))));
    }

    #[test]
    fn test_frame_limit_ends_stream() {
        let mut port = committed_port(Some(2));
        let (count, size) = port.buffer_requirements().negotiated();
        port.set_buffers(count, size).unwrap();
        let pool = BufferPool::create(count as usize, size).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = port
            .enable(Box::new(move |buf| {
                let _ = tx.send(buf.length);
                buf.release();
            }))
            .unwrap();
        while let Some(buf) = pool.acquire_empty() {
            sink.send_buffer(buf).unwrap();
        }

        let lengths: Vec<usize> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(lengths[0], size);
        assert_eq!(lengths[1], size);
        assert_eq!(lengths[2], 0);

        port.disable().unwrap();
        assert_eq!(pool.available(), count as usize);
    }
}
