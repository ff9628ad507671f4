// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the preview pipeline and the application

use crate::backends::camera::types::BackendError;
use crate::gpu::GpuError;
use std::fmt;

/// Result type alias using PreviewError
pub type PreviewResult<T> = Result<T, PreviewError>;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised while configuring, starting or running the preview renderer
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewError {
    /// A camera port call failed while negotiating the preview port
    Configuration {
        /// The port operation that failed first
        call: &'static str,
        reason: String,
    },
    /// Buffer pool, queue or GPU object allocation failed
    ResourceExhaustion(String),
    /// A shader program failed to compile or link
    ShaderCompile { program: String, log: String },
    /// Texture update or drawing failed inside the render loop
    Draw(String),
    /// The render worker thread could not be spawned
    ThreadCreation(String),
    /// `start` was called before the preview port was configured
    NotConfigured,
    /// The render worker is not running
    NotRunning,
    /// No frame was drawn before the capture deadline
    CaptureTimeout(std::time::Duration),
}

/// Top-level application error
#[derive(Debug)]
pub enum AppError {
    /// Preview pipeline errors
    Preview(PreviewError),
    /// Invalid configuration or command-line values
    Config(String),
    /// Filesystem errors (config files, snapshots)
    Io(std::io::Error),
    /// Generic error with message
    Other(String),
}

impl fmt::Display for PreviewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviewError::Configuration { call, reason } => {
                write!(f, "Preview port configuration failed in {}: {}", call, reason)
            }
            PreviewError::ResourceExhaustion(msg) => write!(f, "Out of resources: {}", msg),
            PreviewError::ShaderCompile { program, log } => {
                write!(f, "Shader program '{}' failed to build: {}", program, log)
            }
            PreviewError::Draw(msg) => write!(f, "Draw failed: {}", msg),
            PreviewError::ThreadCreation(msg) => {
                write!(f, "Failed to start render worker: {}", msg)
            }
            PreviewError::NotConfigured => write!(f, "Preview port has not been configured"),
            PreviewError::NotRunning => write!(f, "Preview renderer is not running"),
            PreviewError::CaptureTimeout(timeout) => {
                write!(f, "No frame drawn within {} ms", timeout.as_millis())
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Preview(e) => write!(f, "Preview error: {}", e),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Io(e) => write!(f, "I/O error: {}", e),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PreviewError {}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Preview(e) => Some(e),
            AppError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for PreviewError {
    fn from(err: GpuError) -> Self {
        match err {
            GpuError::OutOfMemory(msg) => PreviewError::ResourceExhaustion(msg),
            GpuError::ShaderCompile { program, log } => {
                PreviewError::ShaderCompile { program, log }
            }
            other => PreviewError::Draw(other.to_string()),
        }
    }
}

impl From<BackendError> for PreviewError {
    fn from(err: BackendError) -> Self {
        PreviewError::Configuration {
            call: "port",
            reason: err.to_string(),
        }
    }
}

impl From<PreviewError> for AppError {
    fn from(err: PreviewError) -> Self {
        AppError::Preview(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_out_of_memory_maps_to_resource_exhaustion() {
        let err: PreviewError = GpuError::OutOfMemory("texture".into()).into();
        assert_eq!(err, PreviewError::ResourceExhaustion("texture".into()));
    }

    #[test]
    fn gpu_shader_error_keeps_program_name() {
        let err: PreviewError = GpuError::ShaderCompile {
            program: "line".into(),
            log: "missing main".into(),
        }
        .into();
        assert!(matches!(err, PreviewError::ShaderCompile { ref program, .. } if program == "line"));
    }

    #[test]
    fn other_gpu_errors_are_draw_errors() {
        let err: PreviewError = GpuError::InvalidOperation("no context".into()).into();
        assert!(matches!(err, PreviewError::Draw(_)));
    }
}
