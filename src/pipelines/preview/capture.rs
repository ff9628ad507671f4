// SPDX-License-Identifier: MPL-2.0

//! Frame read-back requests
//!
//! A caller posts a request and waits on the returned receiver; the render
//! worker answers it right after the next redraw, before the buffers swap.

use crate::errors::PreviewResult;
use crate::gpu::RgbaFrame;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Mutex;

type Reply = Sender<PreviewResult<RgbaFrame>>;

#[derive(Debug, Default)]
pub struct CaptureRequests {
    pending: Mutex<Vec<Reply>>,
}

impl CaptureRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for the next drawn frame
    pub fn request(&self) -> Receiver<PreviewResult<RgbaFrame>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        match self.pending.lock() {
            Ok(mut pending) => pending.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().map(|p| !p.is_empty()).unwrap_or(false)
    }

    /// Take every waiting request
    pub(crate) fn take(&self) -> Vec<Reply> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}
