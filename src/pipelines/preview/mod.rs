// SPDX-License-Identifier: MPL-2.0

//! GL preview pipeline
//!
//! Filled camera buffers travel from the port's completion callback through
//! an [`ExchangeQueue`](crate::backends::camera::ExchangeQueue) into a render
//! worker thread that owns the GPU device and the scene.
//!
//! ```text
//! ┌────────────┐ callback ┌───────────────┐ dequeue ┌───────────────┐
//! │ PreviewPort│ ───────▶ │ ExchangeQueue │ ──────▶ │ render worker │──▶ swap
//! └────────────┘          └───────────────┘         └───────┬───────┘
//!       ▲                                                   │
//!       └───────────────── send_buffer (empty) ─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`port_adapter`]: port negotiation, pool creation and the callback
//! - [`worker`]: the render loop
//! - [`controller`]: start, stop and teardown
//! - [`textures`]: external textures bound to camera buffers
//! - [`overlay`]: overlay rectangles
//! - [`capture`]: read-back requests served by the worker

pub mod capture;
pub mod controller;
pub mod overlay;
pub mod port_adapter;
pub mod textures;
pub mod worker;

pub use capture::CaptureRequests;
pub use controller::PreviewRenderer;
pub use overlay::{OverlayList, OverlayLoop, OverlayRect};
pub use port_adapter::ConfiguredPort;

use crate::errors::PreviewError;
use crate::scenes::{Publisher, WindowGeometry};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// State shared by the session, the port callback and the render worker
#[derive(Debug)]
pub struct PreviewShared {
    stop: Arc<AtomicBool>,
    window: WindowGeometry,
    overlays: OverlayList,
    publisher: Publisher,
    capture: CaptureRequests,
    frames_drawn: AtomicU64,
    buffers_rendered: AtomicU64,
    failure: Mutex<Option<PreviewError>>,
}

impl PreviewShared {
    pub fn new(window: WindowGeometry) -> Arc<Self> {
        Arc::new(Self {
            stop: Arc::new(AtomicBool::new(false)),
            window,
            overlays: OverlayList::new(),
            publisher: Publisher::new(),
            capture: CaptureRequests::new(),
            frames_drawn: AtomicU64::new(0),
            buffers_rendered: AtomicU64::new(0),
            failure: Mutex::new(None),
        })
    }

    pub fn window(&self) -> WindowGeometry {
        self.window
    }

    /// The flag every party polls; set by stop, end of stream or a fatal error
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn overlays(&self) -> &OverlayList {
        &self.overlays
    }

    /// Register an overlay in preview-window pixels
    pub fn register_overlay(&self, rect: OverlayRect) -> usize {
        self.overlays
            .register(rect, self.window.preview.width, self.window.preview.height)
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn capture(&self) -> &CaptureRequests {
        &self.capture
    }

    /// Frames presented so far
    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn.load(Ordering::SeqCst)
    }

    /// Camera buffers bound to textures so far
    pub fn buffers_rendered(&self) -> u64 {
        self.buffers_rendered.load(Ordering::SeqCst)
    }

    /// The error that ended the render loop, if any
    pub fn failure(&self) -> Option<PreviewError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Remember the first fatal error and ask everyone to stop
    pub(crate) fn fail(&self, error: PreviewError) {
        if let Ok(mut failure) = self.failure.lock()
            && failure.is_none()
        {
            *failure = Some(error);
        }
        self.request_stop();
    }

    pub(crate) fn count_frame(&self) {
        self.frames_drawn.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_buffer(&self) {
        self.buffers_rendered.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Viewport;

    #[test]
    fn test_overlays_use_preview_size() {
        let shared = PreviewShared::new(WindowGeometry::from_preview(Viewport::new(
            10, 20, 200, 100,
        )));
        assert_eq!(shared.register_overlay(OverlayRect::new(0, 0, 100, 50)), 0);
        shared
            .overlays()
            .with_loops(|loops| assert_eq!(loops[0], [[-1.0, 0.0], [-1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]));
    }

    #[test]
    fn test_stop_flag_is_shared() {
        let shared = PreviewShared::new(WindowGeometry::from_preview(Viewport::new(0, 0, 4, 4)));
        let flag = shared.stop_flag();
        assert!(!shared.stop_requested());
        flag.store(true, Ordering::SeqCst);
        assert!(shared.stop_requested());
    }
}
