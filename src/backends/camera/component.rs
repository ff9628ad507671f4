// SPDX-License-Identifier: GPL-3.0-only

//! Camera component setup for the preview output
//!
//! Fills in the pending format of a preview port: opaque transfer of I420
//! frames, dimensions aligned to what the ISP writes, a crop rectangle equal
//! to the visible size and the preview frame rate. The format is committed
//! later by the port adapter.

use super::PreviewPort;
use super::types::{BackendError, BackendResult, Crop, Encoding, PortFormat, Rational, align_up};
use crate::constants::format::*;
use tracing::debug;

/// Inputs to the preview format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewFormatSettings {
    /// Visible preview width
    pub preview_width: u32,
    /// Visible preview height
    pub preview_height: u32,
    /// Generate the preview from the full capture resolution
    pub full_res_preview: bool,
    /// Capture resolution used by a full resolution preview
    pub capture_width: u32,
    pub capture_height: u32,
}

impl Default for PreviewFormatSettings {
    fn default() -> Self {
        Self {
            preview_width: crate::constants::window::PREVIEW_WIDTH,
            preview_height: crate::constants::window::PREVIEW_HEIGHT,
            full_res_preview: false,
            capture_width: SENSOR_WIDTH,
            capture_height: SENSOR_HEIGHT,
        }
    }
}

/// Compute the preview port format for `settings`
pub fn preview_format(settings: &PreviewFormatSettings) -> BackendResult<PortFormat> {
    let (width, height, frame_rate) = if settings.full_res_preview {
        // Full resolution runs at a max of 15fps with the OV5647 sensor
        (
            settings.capture_width,
            settings.capture_height,
            Rational::new(FULL_RES_PREVIEW_FRAME_RATE_NUM, FULL_RES_PREVIEW_FRAME_RATE_DEN),
        )
    } else {
        (
            settings.preview_width,
            settings.preview_height,
            Rational::new(PREVIEW_FRAME_RATE_NUM, PREVIEW_FRAME_RATE_DEN),
        )
    };

    let aligned = align_up(width, WIDTH_ALIGN).zip(align_up(height, HEIGHT_ALIGN));
    let Some((aligned_width, aligned_height)) = aligned else {
        return Err(BackendError::ParameterRejected(format!(
            "preview size {}x{} cannot be aligned to {}x{}",
            width, height, WIDTH_ALIGN, HEIGHT_ALIGN
        )));
    };

    Ok(PortFormat {
        encoding: Encoding::Opaque,
        encoding_variant: Encoding::I420,
        width: aligned_width,
        height: aligned_height,
        crop: Crop {
            x: 0,
            y: 0,
            width,
            height,
        },
        frame_rate,
    })
}

/// Write the preview format into the port's pending format
pub fn setup_preview_port(
    port: &mut dyn PreviewPort,
    settings: &PreviewFormatSettings,
) -> BackendResult<()> {
    let format = preview_format(settings)?;
    debug!(
        port = port.name(),
        width = format.width,
        height = format.height,
        crop_width = format.crop.width,
        crop_height = format.crop.height,
        fps = format.frame_rate.num,
        "Setting preview format"
    );
    *port.format_mut() = format;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_dimensions_are_aligned() {
        let format = preview_format(&PreviewFormatSettings {
            preview_width: 1000,
            preview_height: 750,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(format.width, 1024);
        assert_eq!(format.height, 752);
        assert_eq!(format.crop.width, 1000);
        assert_eq!(format.crop.height, 750);
        assert_eq!(format.frame_rate, Rational::new(30, 1));
        assert_eq!(format.encoding, Encoding::Opaque);
        assert_eq!(format.encoding_variant, Encoding::I420);
    }

    #[test]
    fn test_full_res_preview_uses_capture_size() {
        let format = preview_format(&PreviewFormatSettings {
            full_res_preview: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(format.width, 2592);
        assert_eq!(format.height, 1952);
        assert_eq!(format.crop.height, 1944);
        assert_eq!(format.frame_rate, Rational::new(15, 1));
    }

    #[test]
    fn test_unalignable_size_is_rejected() {
        let err = preview_format(&PreviewFormatSettings {
            preview_width: u32::MAX - 3,
            preview_height: 1,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, BackendError::ParameterRejected(_)));
    }
}
