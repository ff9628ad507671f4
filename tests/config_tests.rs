// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration module

use picam::Config;
use picam::config::{SourceKind, WindowRect};
use picam::constants::DEFAULT_TIMEOUT_MS;
use picam::scenes::SceneKind;

#[test]
fn test_config_default() {
    let config = Config::default();

    assert_eq!(config.preview, WindowRect::new(0, 0, 1024, 768));
    assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS as i64);
    assert_eq!(config.scene, SceneKind::VcsmSquare);
    assert_eq!(config.source, SourceKind::Virtual);
    assert!(config.overlays.is_empty());
}

#[test]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.json")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{ "scene": "passthrough", "source": "v4l2", "overlays": [{ "x": 1, "y": 2, "width": 3, "height": 4 }] }"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.scene, SceneKind::Passthrough);
    assert_eq!(config.source, SourceKind::V4l2);
    assert_eq!(config.overlays, vec![WindowRect::new(1, 2, 3, 4)]);
    assert_eq!(config.device, "/dev/video0");
}

#[test]
fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");
    let config = Config {
        timeout_ms: 0,
        gl_window: Some(WindowRect::new(0, 0, 1024, 1024)),
        ..Default::default()
    };
    config.save(&path).unwrap();
    assert_eq!(Config::load(&path).unwrap(), config);
}

#[test]
fn test_invalid_json_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        Config::load(&path),
        Err(picam::AppError::Config(_))
    ));
}

#[test]
fn test_empty_preview_is_rejected() {
    let config = Config {
        preview: WindowRect::new(0, 0, 0, 10),
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_window_rect_parsing() {
    assert_eq!(
        "10, 20,640,480".parse::<WindowRect>().unwrap(),
        WindowRect::new(10, 20, 640, 480)
    );
    assert_eq!("-5,0,8,8".parse::<WindowRect>().unwrap().x, -5);
    assert!("1,2,3".parse::<WindowRect>().is_err());
    assert!("0,0,0,10".parse::<WindowRect>().is_err());
    assert!("a,b,c,d".parse::<WindowRect>().is_err());
    assert_eq!(WindowRect::new(1, 2, 3, 4).to_string(), "1,2,3,4");
}
