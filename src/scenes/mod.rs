// SPDX-License-Identifier: GPL-3.0-only

//! Pluggable GL scenes
//!
//! A [`Scene`] decides which views of the camera buffer it consumes and how
//! the preview window is drawn from them. The render worker drives every
//! hook from its own thread:
//!
//! ```text
//! create_native_window → gl_init → { update_texture* → update_model → redraw → capture? } → gl_term → destroy_native_window
//! ```

pub mod passthrough;
pub mod vcsm_square;
pub mod yuv;

pub use passthrough::PassthroughScene;
pub use vcsm_square::{Publisher, VcsmSquareScene};
pub use yuv::YuvScene;

use crate::backends::camera::ClientBuffer;
use crate::gpu::{
    EglConfig, Fill, GpuDevice, GpuResult, ImagePlane, Primitive, ProgramId, RgbaFrame, Viewport,
};
use crate::pipelines::preview::overlay::OverlayLoop;
use crate::pipelines::preview::textures::TextureSet;
use crate::shaders::QUAD_VERTICES;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Native GL window and the preview rectangle drawn inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    /// The window the GL surface is created on, in display coordinates
    pub native: Viewport,
    /// The preview rectangle, in display coordinates
    pub preview: Viewport,
}

impl WindowGeometry {
    /// Use the preview rectangle as the GL window too
    pub fn from_preview(preview: Viewport) -> Self {
        Self {
            native: preview,
            preview,
        }
    }

    /// Preview rectangle relative to the GL window
    pub fn preview_viewport(&self) -> Viewport {
        Viewport::new(
            self.preview.x - self.native.x,
            self.preview.y - self.native.y,
            self.preview.width,
            self.preview.height,
        )
    }
}

/// Per-draw inputs a scene reads
pub struct RedrawContext<'a> {
    pub window: WindowGeometry,
    pub textures: &'a TextureSet,
    pub overlays: &'a [OverlayLoop],
}

/// The pluggable renderer run by the preview worker
pub trait Scene: Send {
    fn name(&self) -> &'static str;

    /// EGL attributes for the context
    fn egl_config(&self) -> EglConfig {
        EglConfig::default()
    }

    fn create_native_window(
        &mut self,
        gpu: &mut dyn GpuDevice,
        window: &WindowGeometry,
    ) -> GpuResult<()> {
        gpu.create_native_window(window.native)
    }

    /// Build shader programs and GPU objects; the context is current
    fn gl_init(&mut self, gpu: &mut dyn GpuDevice, window: &WindowGeometry) -> GpuResult<()>;

    /// Views of the camera buffer this scene samples
    fn planes(&self) -> &'static [ImagePlane];

    fn update_texture(
        &mut self,
        gpu: &mut dyn GpuDevice,
        textures: &mut TextureSet,
        plane: ImagePlane,
        buffer: &ClientBuffer,
    ) -> GpuResult<()> {
        textures.update(gpu, plane, buffer)
    }

    fn update_model(&mut self) -> GpuResult<()> {
        Ok(())
    }

    fn redraw(&mut self, gpu: &mut dyn GpuDevice, ctx: &RedrawContext<'_>) -> GpuResult<()>;

    /// Read back the frame just drawn
    fn capture(&mut self, gpu: &mut dyn GpuDevice) -> GpuResult<RgbaFrame> {
        gpu.read_pixels()
    }

    /// Release the GPU objects created in `gl_init`
    fn gl_term(&mut self, gpu: &mut dyn GpuDevice);

    fn destroy_native_window(&mut self, gpu: &mut dyn GpuDevice) {
        gpu.destroy_native_window();
    }
}

/// Scene selected at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    /// Camera image across the whole window
    Passthrough,
    /// RGB, Y, U and V in the four quadrants
    Yuv,
    /// Luma through a CPU-editable shared-memory framebuffer, with overlays
    #[default]
    #[value(name = "vcsm_square", alias = "vcsm-square")]
    VcsmSquare,
}

impl SceneKind {
    pub const ALL: [SceneKind; 3] = [SceneKind::Passthrough, SceneKind::Yuv, SceneKind::VcsmSquare];

    pub fn create(self, publisher: Publisher) -> Box<dyn Scene> {
        match self {
            SceneKind::Passthrough => Box::new(PassthroughScene::new()),
            SceneKind::Yuv => Box::new(YuvScene::new()),
            SceneKind::VcsmSquare => Box::new(VcsmSquareScene::new(publisher)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SceneKind::Passthrough => "passthrough",
            SceneKind::Yuv => "yuv",
            SceneKind::VcsmSquare => "vcsm_square",
        }
    }
}

impl fmt::Display for SceneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Draw `plane`'s texture as a full quad into the current viewport
pub(crate) fn draw_plane(
    gpu: &mut dyn GpuDevice,
    program: ProgramId,
    textures: &TextureSet,
    plane: ImagePlane,
) -> GpuResult<()> {
    match textures.texture(plane) {
        Some(texture) if textures.image(plane).is_some() => gpu.draw(
            program,
            Primitive::Triangles,
            &QUAD_VERTICES,
            &Fill::Texture(texture),
        ),
        // No frame for this plane yet
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backends::camera::{BufferPool, FrameBuffer, FrameGeometry};
    use crate::gpu::{HeadlessPresenter, SoftwareGpu};

    /// A context-ready software GPU for `scene`
    pub fn gpu_for(scene: &mut dyn Scene, window: &WindowGeometry) -> SoftwareGpu {
        let mut gpu = SoftwareGpu::new(Box::new(HeadlessPresenter::new()));
        scene.create_native_window(&mut gpu, window).unwrap();
        gpu.init_context(&scene.egl_config()).unwrap();
        scene.gl_init(&mut gpu, window).unwrap();
        gpu
    }

    /// A filled I420 buffer whose planes hold constant values
    pub fn filled_buffer(pool: &BufferPool, geometry: FrameGeometry, yuv: [u8; 3]) -> FrameBuffer {
        let mut buf = pool.acquire_empty().unwrap();
        let luma = geometry.width as usize * geometry.height as usize;
        let chroma = geometry.chroma_width() as usize * geometry.chroma_height() as usize;
        buf.fill(geometry, 1, |bytes| {
            bytes[..luma].fill(yuv[0]);
            bytes[luma..luma + chroma].fill(yuv[1]);
            bytes[luma + chroma..].fill(yuv[2]);
        })
        .unwrap();
        buf
    }
}
