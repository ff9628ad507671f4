// SPDX-License-Identifier: GPL-3.0-only

//! User configuration
//!
//! Stored as JSON in `$XDG_CONFIG_HOME/picam/config.json`. A missing file
//! means defaults; command-line flags override whatever the file sets.

use crate::constants::{DEFAULT_TIMEOUT_MS, window};
use crate::errors::{AppError, AppResult};
use crate::gpu::Viewport;
use crate::scenes::SceneKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// A rectangle in display pixels, written `x,y,width,height`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowRect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.x, self.y, self.width, self.height)
    }
}

impl FromStr for WindowRect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, width, height] = parts.as_slice() else {
            return Err(format!("expected x,y,width,height but got '{}'", s));
        };
        let x = x.parse().map_err(|_| format!("bad x in '{}'", s))?;
        let y = y.parse().map_err(|_| format!("bad y in '{}'", s))?;
        let width: u32 = width.parse().map_err(|_| format!("bad width in '{}'", s))?;
        let height: u32 = height.parse().map_err(|_| format!("bad height in '{}'", s))?;
        if width == 0 || height == 0 {
            return Err(format!("empty rectangle '{}'", s));
        }
        Ok(Self::new(x, y, width, height))
    }
}

impl fmt::Display for WindowRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// Where preview frames come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Animated test pattern, no hardware needed
    #[default]
    Virtual,
    /// A V4L2 capture device
    V4l2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preview rectangle on the display
    pub preview: WindowRect,
    /// GL window; the preview rectangle when unset
    pub gl_window: Option<WindowRect>,
    pub scene: SceneKind,
    pub source: SourceKind,
    /// V4L2 device node used by the `v4l2` source
    pub device: String,
    /// Run time in milliseconds; 0 runs until interrupted, negative uses the default
    pub timeout_ms: i64,
    /// Generate the preview from the full sensor resolution
    pub full_res_preview: bool,
    /// End the virtual stream after this many frames
    pub frame_limit: Option<u64>,
    /// Overlay rectangles registered at startup, in preview pixels
    pub overlays: Vec<WindowRect>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preview: WindowRect::new(
                window::PREVIEW_X,
                window::PREVIEW_Y,
                window::PREVIEW_WIDTH,
                window::PREVIEW_HEIGHT,
            ),
            gl_window: None,
            scene: SceneKind::default(),
            source: SourceKind::default(),
            device: "/dev/video0".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS as i64,
            full_res_preview: false,
            frame_limit: None,
            overlays: Vec::new(),
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/picam/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("picam").join("config.json"))
    }

    /// Read `path`; a missing file gives the defaults
    pub fn load(path: &Path) -> AppResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config: Config = serde_json::from_str(&text)
                    .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
                debug!(path = %path.display(), "Loaded configuration");
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load from [`default_path`](Self::default_path), or defaults when
    /// there is no config directory
    pub fn load_default() -> AppResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(AppError::Config(format!(
                "preview rectangle {} is empty",
                self.preview
            )));
        }
        if let Some(gl) = self.gl_window
            && (gl.width == 0 || gl.height == 0)
        {
            return Err(AppError::Config(format!("GL window {} is empty", gl)));
        }
        Ok(())
    }
}
