// SPDX-License-Identifier: GPL-3.0-only

//! Programmatic preview entry points
//!
//! A [`PreviewSession`] strings the pieces together the way the `picam`
//! binary uses them:
//!
//! ```ignore
//! let session = PreviewSession::builder()
//!     .scene(SceneKind::VcsmSquare)
//!     .start_preview(0, 0, 1024, 768, 0)?;
//! session.register_overlay_rect(100, 100, 200, 150);
//! let outcome = session.run_until_timeout_or_stopped();
//! let report = session.stop_and_teardown();
//! ```

use crate::backends::camera::component::{PreviewFormatSettings, setup_preview_port};
use crate::backends::camera::virtual_port::{VirtualPortOptions, VirtualPreviewPort};
use crate::backends::camera::{PoolStats, PreviewPort};
use crate::constants::{DEFAULT_TIMEOUT_MS, timing};
use crate::errors::{PreviewError, PreviewResult};
use crate::gpu::{GpuDevice, HeadlessPresenter, RgbaFrame, Viewport, WgpuDevice};
use crate::pipelines::preview::{OverlayRect, PreviewRenderer, PreviewShared};
use crate::scenes::{Publisher, Scene, SceneKind, WindowGeometry};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long [`PreviewSession::run_until_timeout_or_stopped`] runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    RunFor(Duration),
    /// Only an explicit stop, end of stream or a render failure ends the run
    UntilStopped,
}

impl Timeout {
    /// Negative means "not set" and falls back to the default; zero runs
    /// until stopped.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Timeout::UntilStopped,
            ms if ms < 0 => Timeout::RunFor(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            ms => Timeout::RunFor(Duration::from_millis(ms as u64)),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::RunFor(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }
}

/// Why a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    TimedOut,
    /// Stop requested by the caller or end of stream from the port
    Stopped,
    /// The render loop hit a fatal error
    Failed(PreviewError),
}

/// What teardown found
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownReport {
    /// Buffers that never made it back to the pool
    pub outstanding: usize,
    pub frames: u64,
    pub buffers: u64,
    pub failure: Option<PreviewError>,
}

enum SceneChoice {
    Kind(SceneKind),
    Custom(Box<dyn Scene>),
}

/// Options for [`PreviewSession`]; anything not set uses the in-tree
/// virtual port and a headless [`WgpuDevice`]
pub struct SessionBuilder {
    scene: SceneChoice,
    port: Option<Box<dyn PreviewPort>>,
    gpu: Option<Box<dyn GpuDevice>>,
    gl_window: Option<Viewport>,
    full_res_preview: bool,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            scene: SceneChoice::Kind(SceneKind::default()),
            port: None,
            gpu: None,
            gl_window: None,
            full_res_preview: false,
        }
    }
}

impl SessionBuilder {
    pub fn scene(mut self, kind: SceneKind) -> Self {
        self.scene = SceneChoice::Kind(kind);
        self
    }

    /// Use a scene not provided by [`SceneKind`]
    pub fn custom_scene(mut self, scene: Box<dyn Scene>) -> Self {
        self.scene = SceneChoice::Custom(scene);
        self
    }

    pub fn port(mut self, port: Box<dyn PreviewPort>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn gpu(mut self, gpu: Box<dyn GpuDevice>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    /// GL window in display coordinates; defaults to the preview rectangle
    pub fn gl_window(mut self, window: Viewport) -> Self {
        self.gl_window = Some(window);
        self
    }

    pub fn full_res_preview(mut self, enabled: bool) -> Self {
        self.full_res_preview = enabled;
        self
    }

    /// Configure the camera port and start rendering into the rectangle
    /// `x, y, width, height`.
    ///
    /// `duration_ms` is kept for [`PreviewSession::run_until_timeout_or_stopped`]:
    /// negative selects the default, zero runs until stopped.
    pub fn start_preview(
        self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        duration_ms: i64,
    ) -> PreviewResult<PreviewSession> {
        let preview = Viewport::new(x, y, width, height);
        let window = WindowGeometry {
            native: self.gl_window.unwrap_or(preview),
            preview,
        };
        let shared = PreviewShared::new(window);

        let scene = match self.scene {
            SceneChoice::Kind(kind) => kind.create(shared.publisher().clone()),
            SceneChoice::Custom(scene) => scene,
        };

        let mut port = self.port.unwrap_or_else(|| {
            debug!("No camera port given, using the virtual port");
            Box::new(VirtualPreviewPort::new(VirtualPortOptions::default()))
        });
        setup_preview_port(
            port.as_mut(),
            &PreviewFormatSettings {
                preview_width: width,
                preview_height: height,
                full_res_preview: self.full_res_preview,
                ..Default::default()
            },
        )
        .map_err(|e| PreviewError::Configuration {
            call: "set_format",
            reason: e.to_string(),
        })?;

        let gpu = self
            .gpu
            .unwrap_or_else(|| Box::new(WgpuDevice::new(Box::new(HeadlessPresenter::new()))));

        let scene_name = scene.name();
        let mut renderer = PreviewRenderer::new(shared, gpu, scene);
        renderer.configure(port)?;
        renderer.start()?;

        let timeout = Timeout::from_millis(duration_ms);
        info!(
            scene = scene_name,
            x,
            y,
            width,
            height,
            ?timeout,
            "Preview started"
        );
        Ok(PreviewSession { renderer, timeout })
    }
}

/// A running preview
pub struct PreviewSession {
    renderer: PreviewRenderer,
    timeout: Timeout,
}

impl PreviewSession {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Start with the default scene, virtual port and a headless wgpu device
    pub fn start_preview(
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        duration_ms: i64,
    ) -> PreviewResult<Self> {
        Self::builder().start_preview(x, y, width, height, duration_ms)
    }

    fn shared(&self) -> &Arc<PreviewShared> {
        self.renderer.shared()
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Add an overlay rectangle in preview-window pixels.
    ///
    /// Returns its index; indices start at 0 and never get reused.
    pub fn register_overlay_rect(&self, x: i32, y: i32, width: i32, height: i32) -> usize {
        let index = self
            .shared()
            .register_overlay(OverlayRect::new(x, y, width, height));
        debug!(index, x, y, width, height, "Registered overlay rectangle");
        index
    }

    /// Handle for installing a CPU callback on the shared-memory surface
    pub fn publisher(&self) -> &Publisher {
        self.shared().publisher()
    }

    /// The flag a signal handler sets to end the run
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.shared().stop_flag()
    }

    pub fn request_stop(&self) {
        self.shared().request_stop();
    }

    pub fn frames_drawn(&self) -> u64 {
        self.shared().frames_drawn()
    }

    pub fn pool_stats(&self) -> Option<Arc<PoolStats>> {
        self.renderer.pool_stats()
    }

    /// Read back the next frame the worker draws
    pub fn capture(&self) -> PreviewResult<RgbaFrame> {
        self.renderer
            .capture(Duration::from_secs(timing::CAPTURE_TIMEOUT_SECS))
    }

    /// Block until the timeout elapses or something requests a stop
    pub fn run_until_timeout_or_stopped(&self) -> RunOutcome {
        let poll = Duration::from_millis(timing::RUN_POLL_INTERVAL_MS);
        let started = Instant::now();

        let outcome = loop {
            if self.shared().stop_requested() || !self.renderer.is_running() {
                break match self.shared().failure() {
                    Some(e) => RunOutcome::Failed(e),
                    None => RunOutcome::Stopped,
                };
            }
            if let Timeout::RunFor(limit) = self.timeout
                && started.elapsed() >= limit
            {
                break RunOutcome::TimedOut;
            }
            std::thread::sleep(poll);
        };

        debug!(?outcome, elapsed = ?started.elapsed(), "Preview run finished");
        outcome
    }

    /// Stop rendering, disable the port and free every buffer
    pub fn stop_and_teardown(self) -> TeardownReport {
        let shared = Arc::clone(self.shared());
        let outstanding = self.renderer.destroy();
        if outstanding > 0 {
            warn!(outstanding, "Buffers still outstanding after teardown");
        }

        let report = TeardownReport {
            outstanding,
            frames: shared.frames_drawn(),
            buffers: shared.buffers_rendered(),
            failure: shared.failure(),
        };
        info!(
            frames = report.frames,
            buffers = report.buffers,
            outstanding,
            "Preview torn down"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareGpu;

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(Timeout::from_millis(0), Timeout::UntilStopped);
        assert_eq!(
            Timeout::from_millis(-1),
            Timeout::RunFor(Duration::from_millis(DEFAULT_TIMEOUT_MS))
        );
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::RunFor(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_short_run_times_out_and_tears_down() {
        let session = PreviewSession::builder()
            .scene(SceneKind::Passthrough)
            .gpu(Box::new(SoftwareGpu::new(Box::new(HeadlessPresenter::new()))))
            .start_preview(0, 0, 64, 48, 100)
            .unwrap();
        assert_eq!(session.run_until_timeout_or_stopped(), RunOutcome::TimedOut);

        let report = session.stop_and_teardown();
        assert_eq!(report.outstanding, 0);
        assert_eq!(report.failure, None);
    }

    #[test]
    fn test_oversized_preview_is_a_configuration_error() {
        let err = PreviewSession::start_preview(0, 0, u32::MAX, 1, 100)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PreviewError::Configuration {
                call: "set_format",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_size_preview_fails_in_commit() {
        let err = PreviewSession::start_preview(0, 0, 0, 0, 100).err().unwrap();
        assert!(matches!(
            err,
            PreviewError::Configuration {
                call: "commit_format",
                ..
            }
        ));
    }
}
