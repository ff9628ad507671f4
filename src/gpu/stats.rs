// SPDX-License-Identifier: GPL-3.0-only

//! Counters readable while a device lives on the render thread

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct GpuStats {
    swaps: AtomicU64,
    draw_calls: AtomicU64,
    live_images: AtomicUsize,
    live_programs: AtomicUsize,
    surface_locks: AtomicU64,
    frame_line_loops: Mutex<Vec<Vec<[f32; 2]>>>,
    last_line_loops: Mutex<Vec<Vec<[f32; 2]>>>,
}

impl GpuStats {
    /// Frames presented
    pub fn swaps(&self) -> u64 {
        self.swaps.load(Ordering::SeqCst)
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls.load(Ordering::SeqCst)
    }

    /// External and surface images not yet destroyed
    pub fn live_images(&self) -> usize {
        self.live_images.load(Ordering::SeqCst)
    }

    /// Linked programs not yet deleted
    pub fn live_programs(&self) -> usize {
        self.live_programs.load(Ordering::SeqCst)
    }

    pub fn surface_locks(&self) -> u64 {
        self.surface_locks.load(Ordering::SeqCst)
    }

    /// Vertices of every line loop drawn in the last presented frame
    pub fn last_frame_line_loops(&self) -> Vec<Vec<[f32; 2]>> {
        self.last_line_loops
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    pub(crate) fn image_created(&self) {
        self.live_images.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn image_destroyed(&self) {
        self.live_images.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn program_built(&self) {
        self.live_programs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn program_deleted(&self) {
        self.live_programs.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn surface_locked(&self) {
        self.surface_locks.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a draw; window line loops are kept for the frame being built
    pub(crate) fn drew(&self, line_loop: Option<&[[f32; 2]]>) {
        self.draw_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(vertices) = line_loop
            && let Ok(mut lines) = self.frame_line_loops.lock()
        {
            lines.push(vertices.to_vec());
        }
    }

    pub(crate) fn swapped(&self) {
        self.swaps.fetch_add(1, Ordering::SeqCst);
        if let (Ok(mut frame), Ok(mut last)) = (self.frame_line_loops.lock(), self.last_line_loops.lock()) {
            *last = std::mem::take(&mut *frame);
        }
    }
}
