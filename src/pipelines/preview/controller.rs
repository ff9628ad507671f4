// SPDX-License-Identifier: MPL-2.0

//! Preview renderer lifecycle
//!
//! ```text
//! new ──configure──▶ configured ──start──▶ running ──stop──▶ stopped ──destroy
//! ```
//!
//! The GPU device and the scene move onto the worker thread at `start`.
//! Stopping sets the shared flag, joins the worker (which tears down its
//! GPU objects and returns its buffers) and then disables the port.

use super::port_adapter::{self, ConfiguredPort};
use super::worker::{RenderState, WorkerContext};
use super::PreviewShared;
use crate::backends::camera::frame_loop::FrameLoopController;
use crate::backends::camera::{PoolStats, PreviewPort};
use crate::constants::timing;
use crate::errors::{PreviewError, PreviewResult};
use crate::gpu::{GpuDevice, RgbaFrame};
use crate::scenes::Scene;
use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Owns the preview port, the render worker and the state they share
pub struct PreviewRenderer {
    shared: Arc<PreviewShared>,
    /// Handed to the worker at `start`
    pending: Option<(Box<dyn GpuDevice>, Box<dyn Scene>)>,
    port: Option<ConfiguredPort>,
    worker: Option<FrameLoopController>,
}

impl PreviewRenderer {
    pub fn new(shared: Arc<PreviewShared>, gpu: Box<dyn GpuDevice>, scene: Box<dyn Scene>) -> Self {
        Self {
            shared,
            pending: Some((gpu, scene)),
            port: None,
            worker: None,
        }
    }

    pub fn shared(&self) -> &Arc<PreviewShared> {
        &self.shared
    }

    /// Negotiate the preview port and start it delivering buffers
    pub fn configure(&mut self, port: Box<dyn PreviewPort>) -> PreviewResult<()> {
        if self.port.is_some() {
            warn!("Preview port already configured, replacing it");
            if let Some(old) = self.port.take() {
                old.destroy();
            }
        }
        self.port = Some(port_adapter::configure(port, &self.shared)?);
        Ok(())
    }

    pub fn pool_stats(&self) -> Option<Arc<PoolStats>> {
        self.port.as_ref().map(ConfiguredPort::pool_stats)
    }

    /// Spawn the render worker and wait for it to initialise
    pub fn start(&mut self) -> PreviewResult<()> {
        let port = self.port.as_ref().ok_or(PreviewError::NotConfigured)?;
        if self.worker.is_some() {
            debug!("Render worker already started");
            return Ok(());
        }
        let (gpu, scene) = self.pending.take().ok_or(PreviewError::NotRunning)?;

        let ctx = WorkerContext {
            gpu,
            scene,
            shared: Arc::clone(&self.shared),
            pool: port.pool(),
            filled: port.filled(),
            sink: port.sink(),
        };

        let (mut worker, init_rx) = FrameLoopController::start_with_init(
            "preview-worker",
            self.shared.stop_flag(),
            move || RenderState::init(ctx),
            RenderState::iteration,
            RenderState::teardown,
        )
        .map_err(|e| PreviewError::ThreadCreation(e.to_string()))?;

        let init_timeout = Duration::from_secs(timing::WORKER_INIT_TIMEOUT_SECS);
        match init_rx.recv_timeout(init_timeout) {
            Ok(Ok(())) => {
                info!("Preview renderer started");
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Render worker failed to initialise");
                worker.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(?init_timeout, "Render worker did not initialise in time");
                worker.stop();
                Err(PreviewError::ThreadCreation(format!(
                    "worker did not initialise within {} s",
                    init_timeout.as_secs()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                worker.join();
                Err(PreviewError::ThreadCreation(
                    "worker exited during initialisation".into(),
                ))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(FrameLoopController::is_running)
    }

    /// Stop the worker and the port. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shared.request_stop();
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!(frames = self.shared.frames_drawn(), "Preview renderer stopped");
        }
        if let Some(port) = self.port.as_mut()
            && let Err(e) = port.disable()
        {
            warn!(error = %e, "Failed to disable preview port");
        }
    }

    /// Read back the next frame the worker draws
    pub fn capture(&self, timeout: Duration) -> PreviewResult<RgbaFrame> {
        if !self.is_running() {
            return Err(PreviewError::NotRunning);
        }
        let reply = self.shared.capture().request();
        match reply.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(PreviewError::CaptureTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PreviewError::NotRunning),
        }
    }

    /// Stop everything and free the buffer pool.
    ///
    /// Returns how many buffers were still outstanding.
    pub fn destroy(mut self) -> usize {
        self.stop();
        self.port.take().map(ConfiguredPort::destroy).unwrap_or(0)
    }
}

impl Drop for PreviewRenderer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
        if let Some(port) = self.port.take() {
            port.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::virtual_port::{VirtualPortOptions, VirtualPreviewPort};
    use crate::gpu::present::HeadlessPresenter;
    use crate::gpu::software::SoftwareGpu;
    use crate::gpu::Viewport;
    use crate::scenes::{Publisher, SceneKind, WindowGeometry};

    fn renderer(kind: SceneKind) -> PreviewRenderer {
        let shared = PreviewShared::new(WindowGeometry::from_preview(Viewport::new(0, 0, 64, 48)));
        let gpu = SoftwareGpu::new(Box::new(HeadlessPresenter::new()));
        PreviewRenderer::new(shared, Box::new(gpu), kind.create(Publisher::new()))
    }

    fn port() -> Box<VirtualPreviewPort> {
        let mut port = VirtualPreviewPort::new(VirtualPortOptions::default());
        let format = port.format_mut();
        format.width = 64;
        format.height = 48;
        format.crop.width = 64;
        format.crop.height = 48;
        Box::new(port)
    }

    #[test]
    fn test_start_requires_configured_port() {
        let mut renderer = renderer(SceneKind::Passthrough);
        assert_eq!(renderer.start(), Err(PreviewError::NotConfigured));
        assert!(!renderer.is_running());
    }

    #[test]
    fn test_capture_requires_running_worker() {
        let renderer = renderer(SceneKind::Passthrough);
        assert_eq!(
            renderer.capture(Duration::from_millis(10)),
            Err(PreviewError::NotRunning)
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut renderer = renderer(SceneKind::Yuv);
        renderer.configure(port()).unwrap();
        renderer.start().unwrap();
        assert!(renderer.is_running());

        renderer.stop();
        renderer.stop();
        assert!(!renderer.is_running());
        assert_eq!(renderer.destroy(), 0);
    }
}
