// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 capture device as a preview port
//!
//! Drives a kernel capture node (the Pi's `bcm2835-v4l2` or any UVC camera)
//! in YU12, which is I420 under its V4L2 name, and copies each captured frame
//! into the pool buffer the client handed over.

use super::buffer::FrameBuffer;
use super::port_core::{FrameSource, PortCore, SourceStatus};
use super::types::*;
use super::{BufferSink, PortCallback, PreviewPort};
use crate::constants::MIN_PREVIEW_BUFFERS;
use std::sync::Arc;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;
use v4l::{Format, FourCC};

/// Kernel buffers queued in the mmap stream
const STREAM_BUFFERS: u32 = 4;

/// A V4L2 node found by [`list_devices`]
#[derive(Debug, Clone)]
pub struct V4l2DeviceInfo {
    pub index: usize,
    pub path: String,
    pub name: String,
}

/// Enumerate V4L2 capture nodes
pub fn list_devices() -> Vec<V4l2DeviceInfo> {
    v4l::context::enum_devices()
        .into_iter()
        .map(|node| V4l2DeviceInfo {
            index: node.index(),
            path: node.path().to_string_lossy().to_string(),
            name: node.name().unwrap_or_else(|| "unknown".to_string()),
        })
        .collect()
}

fn yu12() -> FourCC {
    FourCC::new(b"YU12")
}

pub struct V4l2PreviewPort {
    path: String,
    zero_copy: bool,
    pending: PortFormat,
    committed: Option<PortFormat>,
    buffers: Option<(u32, usize)>,
    core: PortCore,
}

impl V4l2PreviewPort {
    /// Open the device once to check it exists and can capture
    pub fn open(path: &str) -> BackendResult<Self> {
        let dev = Device::with_path(path)
            .map_err(|e| BackendError::DeviceNotFound(format!("{}: {}", path, e)))?;
        let caps = dev.query_caps()?;
        info!(path, card = %caps.card, driver = %caps.driver, "Opened V4L2 device");

        Ok(Self {
            path: path.to_string(),
            zero_copy: false,
            pending: PortFormat::default(),
            committed: None,
            buffers: None,
            core: PortCore::new("v4l2"),
        })
    }
}

impl PreviewPort for V4l2PreviewPort {
    fn name(&self) -> &str {
        &self.path
    }

    fn set_zero_copy(&mut self, enabled: bool) -> BackendResult<()> {
        if enabled {
            // Frames are copied out of the kernel's mmap buffers either way
            debug!(path = %self.path, "V4L2 port copies frames into pool buffers");
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
        let dev = Device::with_path(&self.path)?;
        let requested = Format::new(self.pending.width, self.pending.height, yu12());
        let applied = dev
            .set_format(&requested)
            .map_err(|e| BackendError::ParameterRejected(format!("set_format: {}", e)))?;

        if applied.fourcc != yu12() {
            return Err(BackendError::FormatNotSupported(format!(
                "device offers {} instead of YU12",
                applied.fourcc
            )));
        }

        if self.pending.frame_rate.num > 0 {
            let params = Parameters::with_fps(self.pending.frame_rate.num / self.pending.frame_rate.den.max(1));
            if let Err(e) = dev.set_params(&params) {
                warn!(path = %self.path, error = %e, "Could not set frame rate");
            }
        }

        // The driver may round the size; the crop stays within what it chose
        let mut format = self.pending.clone();
        format.width = applied.width;
        format.height = applied.height;
        format.crop.width = format.crop.width.min(applied.width);
        format.crop.height = format.crop.height.min(applied.height);
        format.encoding_variant = Encoding::I420;

        info!(
            path = %self.path,
            width = format.width,
            height = format.height,
            "Committed V4L2 format"
        );
        self.pending = format.clone();
        self.committed = Some(format);
        Ok(())
    }

    fn buffer_requirements(&self) -> BufferRequirements {
        let size = self
            .committed
            .as_ref()
            .map(|f| f.geometry().i420_size())
            .unwrap_or(0);
        BufferRequirements {
            num_min: 2,
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

        let path = self.path.clone();
        self.core
            .enable(move || CaptureSource::open(&path, format.geometry()), callback)
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

/// Streaming state, created on the capture thread
struct CaptureSource {
    stream: MmapStream<'static>,
    geometry: FrameGeometry,
    // Keeps the device node open for the stream's lifetime
    _device: Device,
}

impl CaptureSource {
    fn open(path: &str, geometry: FrameGeometry) -> BackendResult<Self> {
        let device = Device::with_path(path)?;
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| BackendError::IoError(format!("Failed to create buffer stream: {}", e)))?;
        info!(path, "V4L2 capture stream started");
        Ok(Self {
            stream,
            geometry,
            _device: device,
        })
    }
}

impl FrameSource for CaptureSource {
    fn next_frame(&mut self, buffer: &mut FrameBuffer, sequence: u64) -> BackendResult<SourceStatus> {
        let (data, meta) = self.stream.next()?;
        let expected = self.geometry.i420_size();
        if data.len() < expected {
            warn!(
                got = data.len(),
                expected,
                kernel_sequence = meta.sequence,
                "Short V4L2 frame"
            );
        }

        let copy = data.len().min(expected);
        buffer.fill(self.geometry, sequence, |bytes| {
            bytes[..copy].copy_from_slice(&data[..copy]);
            bytes[copy..].fill(0);
        })?;
        Ok(SourceStatus::Frame)
    }
}
