// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! - Running the preview from flags layered over the config file
//! - Listing V4L2 capture devices

use crate::PreviewArgs;
use chrono::Local;
use picam::backends::camera::PreviewPort;
use picam::backends::camera::virtual_port::{VirtualPortOptions, VirtualPreviewPort};
use picam::config::{Config, SourceKind, WindowRect};
use picam::errors::{AppError, AppResult};
use picam::gpu::{GpuDevice, HeadlessPresenter, Presenter, RgbaFrame, TerminalPresenter, WgpuDevice};
use picam::session::{PreviewSession, RunOutcome};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Default folder name for saving snapshots
const DEFAULT_SAVE_FOLDER: &str = "picam";

/// Run the preview until the timeout, Ctrl+C or end of stream
pub fn run_preview(args: PreviewArgs) -> AppResult<()> {
    let config = resolve_config(&args)?;

    let port = open_port(&config)?;
    let presenter: Box<dyn Presenter> = if args.terminal {
        Box::new(TerminalPresenter::new()?)
    } else {
        Box::new(HeadlessPresenter::new())
    };
    let gpu: Box<dyn GpuDevice> = Box::new(WgpuDevice::new(presenter));

    let mut builder = PreviewSession::builder()
        .scene(config.scene)
        .port(port)
        .gpu(gpu)
        .full_res_preview(config.full_res_preview);
    if let Some(gl) = config.gl_window {
        builder = builder.gl_window(gl.viewport());
    }

    let preview = config.preview;
    let session = builder.start_preview(
        preview.x,
        preview.y,
        preview.width,
        preview.height,
        config.timeout_ms,
    )?;

    for rect in &config.overlays {
        let (width, height) = overlay_size(rect)?;
        session.register_overlay_rect(rect.x, rect.y, width, height);
    }

    let stop_flag = session.stop_flag();
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| AppError::Other(format!("Failed to install Ctrl+C handler: {}", e)))?;

    if let Some(path) = &args.snapshot {
        let path = match path {
            Some(path) => path.clone(),
            None => {
                let dir = get_default_snapshot_dir();
                std::fs::create_dir_all(&dir)?;
                dir
            }
        };
        match session.capture() {
            Ok(frame) => {
                let saved = save_snapshot(&frame, &path)?;
                if !args.terminal {
                    println!("Snapshot saved: {}", saved.display());
                }
            }
            Err(e) => warn!(error = %e, "Snapshot failed"),
        }
    }

    let outcome = session.run_until_timeout_or_stopped();
    let report = session.stop_and_teardown();
    info!(
        frames = report.frames,
        outstanding = report.outstanding,
        ?outcome,
        "Preview finished"
    );

    match outcome {
        RunOutcome::Failed(e) => Err(e.into()),
        RunOutcome::TimedOut | RunOutcome::Stopped => Ok(()),
    }
}

/// Config file values with command-line flags on top
fn resolve_config(args: &PreviewArgs) -> AppResult<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(timeout) = args.timeout {
        config.timeout_ms = timeout;
    }
    if args.full_res_preview {
        config.full_res_preview = true;
    }
    if let Some(preview) = args.preview {
        config.preview = preview;
    }
    if let Some(gl) = args.gl_window {
        config.gl_window = Some(gl);
    }
    if let Some(scene) = args.scene {
        config.scene = scene;
    }
    if let Some(source) = args.source {
        config.source = source;
    }
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if args.frame_limit.is_some() {
        config.frame_limit = args.frame_limit;
    }
    config.overlays.extend(args.rects.iter().copied());

    config.validate()?;
    Ok(config)
}

/// Overlay width and height as the signed sizes overlays are registered with
fn overlay_size(rect: &WindowRect) -> AppResult<(i32, i32)> {
    let too_large = |_| AppError::Config(format!("overlay rectangle {} is too large", rect));
    Ok((
        i32::try_from(rect.width).map_err(too_large)?,
        i32::try_from(rect.height).map_err(too_large)?,
    ))
}

fn open_port(config: &Config) -> AppResult<Box<dyn PreviewPort>> {
    match config.source {
        SourceKind::Virtual => Ok(Box::new(VirtualPreviewPort::new(VirtualPortOptions {
            frame_limit: config.frame_limit,
        }))),
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => {
            let port = picam::backends::camera::v4l2_port::V4l2PreviewPort::open(&config.device)
                .map_err(|e| AppError::Preview(e.into()))?;
            Ok(Box::new(port))
        }
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(AppError::Config(
            "picam was built without V4L2 support".to_string(),
        )),
    }
}

/// List V4L2 capture devices
#[cfg(feature = "v4l2")]
pub fn list_devices() -> AppResult<()> {
    let devices = picam::backends::camera::v4l2_port::list_devices();

    if devices.is_empty() {
        println!("No V4L2 devices found.");
        return Ok(());
    }

    println!("Available V4L2 devices:");
    println!();
    for device in &devices {
        println!("  [{}] {} ({})", device.index, device.name, device.path);
    }
    Ok(())
}

#[cfg(not(feature = "v4l2"))]
pub fn list_devices() -> AppResult<()> {
    Err(AppError::Config(
        "picam was built without V4L2 support".to_string(),
    ))
}

/// Write `frame` as PNG. A directory gets a timestamped file name.
fn save_snapshot(frame: &RgbaFrame, path: &Path) -> AppResult<PathBuf> {
    let output = if path.is_dir() {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        path.join(format!("snapshot_{}.png", timestamp))
    } else {
        path.to_path_buf()
    };
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let image = image::RgbaImage::from_raw(frame.width, frame.height, frame.pixels.clone())
        .ok_or_else(|| AppError::Other("Captured frame has the wrong size".to_string()))?;
    image
        .save_with_format(&output, image::ImageFormat::Png)
        .map_err(|e| AppError::Other(format!("Failed to write {}: {}", output.display(), e)))?;

    info!(path = %output.display(), "Snapshot saved");
    Ok(output)
}

/// Default snapshot directory
fn get_default_snapshot_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(DEFAULT_SAVE_FOLDER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use picam::scenes::SceneKind;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "scene": "yuv", "timeout_ms": 100 }"#).unwrap();

        let args = PreviewArgs {
            config: Some(path),
            timeout: Some(0),
            rects: vec!["1,2,3,4".parse().unwrap()],
            ..Default::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.scene, SceneKind::Yuv);
        assert_eq!(config.timeout_ms, 0);
        assert_eq!(config.overlays.len(), 1);
    }

    #[test]
    fn test_overlay_wider_than_i32_is_a_config_error() {
        let rect = WindowRect::new(0, 0, u32::MAX, 10);
        assert!(matches!(overlay_size(&rect), Err(AppError::Config(_))));
        assert_eq!(overlay_size(&WindowRect::new(5, 5, 20, 10)).unwrap(), (20, 10));
    }

    #[test]
    fn test_snapshot_into_directory_gets_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let frame = RgbaFrame {
            width: 2,
            height: 1,
            pixels: vec![255; 8],
        };
        let saved = save_snapshot(&frame, dir.path()).unwrap();
        assert!(saved.starts_with(dir.path()));
        assert_eq!(saved.extension().and_then(|e| e.to_str()), Some("png"));
        assert!(saved.exists());
    }
}
