// SPDX-License-Identifier: GPL-3.0-only

//! Overlay rectangles drawn over the preview
//!
//! Rectangles are given in window pixels with the origin at the top-left
//! corner and stored as four NDC corners, ready for a line loop.

use std::sync::RwLock;
use tracing::debug;

/// Rectangle in window pixels, origin top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// NDC corners of a registered rectangle, in line-loop order:
/// bottom-left, top-left, top-right, bottom-right
pub type OverlayLoop = [[f32; 2]; 4];

impl OverlayRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Convert to NDC against a `window_width` x `window_height` window
    pub fn to_ndc(&self, window_width: u32, window_height: u32) -> OverlayLoop {
        // Far edges can lie past i32::MAX
        let w = f64::from(window_width.max(1));
        let h = f64::from(window_height.max(1));
        let left = f64::from(self.x);
        let top = f64::from(self.y);
        let right = left + f64::from(self.width);
        let bottom = top + f64::from(self.height);

        let x1 = (2.0 * (left / w) - 1.0) as f32;
        let y1 = (-2.0 * (top / h) + 1.0) as f32;
        let x2 = (2.0 * (right / w) - 1.0) as f32;
        let y2 = (-2.0 * (bottom / h) + 1.0) as f32;

        [[x1, y2], [x1, y1], [x2, y1], [x2, y2]]
    }
}

/// Append-only overlay list shared between registration and the render loop
#[derive(Debug, Default)]
pub struct OverlayList {
    loops: RwLock<Vec<OverlayLoop>>,
}

impl OverlayList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rectangle; returns its index (0, 1, 2, ...)
    pub fn register(&self, rect: OverlayRect, window_width: u32, window_height: u32) -> usize {
        let ndc = rect.to_ndc(window_width, window_height);
        let mut loops = match self.loops.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loops.push(ndc);
        let index = loops.len() - 1;
        debug!(index, ?rect, ?ndc, "Registered overlay rectangle");
        index
    }

    pub fn len(&self) -> usize {
        self.loops.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with the registered loops under the read lock
    pub fn with_loops<R>(&self, f: impl FnOnce(&[OverlayLoop]) -> R) -> R {
        match self.loops.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}
