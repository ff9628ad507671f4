// SPDX-License-Identifier: MPL-2.0

//! Backend abstraction layer for camera capture
//!
//! The backend layer hides where preview frames come from behind the
//! [`PreviewPort`](camera::PreviewPort) trait:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Preview pipeline              │
//! └────────────────────┬────────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────────┐
//! │                Backend Layer                │
//! │  ┌──────────────────┐  ┌─────────────────┐  │
//! │  │   Virtual port   │  │    V4L2 port    │  │
//! │  │  (test pattern)  │  │ (/dev/videoN)   │  │
//! │  └──────────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`camera`]: port trait, buffer pool and port implementations

pub mod camera;
