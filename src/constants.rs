// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// How long the render worker waits for a filled buffer before redrawing
/// the current textures
pub const IDLE_REDRAW_INTERVAL: Duration = Duration::from_millis(16);

/// How long a port's capture thread waits for the client to send a buffer
/// before checking its stop flag again
pub const PORT_BUFFER_WAIT: Duration = Duration::from_millis(20);

/// Preview run time used when no timeout is given
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Interval between frame-rate log lines
pub const FPS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum number of preview buffers, whatever the port recommends
pub const MIN_PREVIEW_BUFFERS: u32 = 3;

/// Preview rectangle defaults; the GL window follows the preview unless set
pub mod window {
    pub const PREVIEW_X: i32 = 0;
    pub const PREVIEW_Y: i32 = 0;
    pub const PREVIEW_WIDTH: u32 = 1024;
    pub const PREVIEW_HEIGHT: u32 = 768;
}

/// Camera port format constants
pub mod format {
    /// Frame width alignment required by the ISP
    pub const WIDTH_ALIGN: u32 = 32;
    /// Frame height alignment required by the ISP
    pub const HEIGHT_ALIGN: u32 = 16;

    /// Preview frame rate
    pub const PREVIEW_FRAME_RATE_NUM: u32 = 30;
    pub const PREVIEW_FRAME_RATE_DEN: u32 = 1;

    /// Frame rate when the preview is generated at full sensor resolution
    pub const FULL_RES_PREVIEW_FRAME_RATE_NUM: u32 = 15;
    pub const FULL_RES_PREVIEW_FRAME_RATE_DEN: u32 = 1;

    /// OV5647 (camera module v1) full resolution
    pub const SENSOR_WIDTH: u32 = 2592;
    pub const SENSOR_HEIGHT: u32 = 1944;
}

/// Shared-memory scene constants
pub mod vcsm {
    /// Side of the square offscreen framebuffer backed by the shared surface
    pub const FB_SIZE: u32 = 1024;
    /// Width of the moving bar drawn by the default pattern generator
    pub const BAR_WIDTH: u32 = 32;
}

/// Timing constants
pub mod timing {
    /// How long `start` waits for the render worker to initialize
    pub const WORKER_INIT_TIMEOUT_SECS: u64 = 5;

    /// Poll interval of the session's run loop
    pub const RUN_POLL_INTERVAL_MS: u64 = 10;

    /// Default wait for a captured frame
    pub const CAPTURE_TIMEOUT_SECS: u64 = 2;
}

/// Process exit codes (sysexits.h)
pub mod exit_code {
    pub const USAGE: i32 = 64;
    pub const SOFTWARE: i32 = 70;
}
