// SPDX-License-Identifier: GPL-3.0-only

//! Camera image across the preview rectangle

use super::{RedrawContext, Scene, WindowGeometry, draw_plane};
use crate::gpu::{GpuDevice, GpuResult, ImagePlane, ProgramId};
use crate::shaders::QUAD_EXTERNAL;

#[derive(Debug, Default)]
pub struct PassthroughScene {
    program: Option<ProgramId>,
}

impl PassthroughScene {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scene for PassthroughScene {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn gl_init(&mut self, gpu: &mut dyn GpuDevice, _window: &WindowGeometry) -> GpuResult<()> {
        self.program = Some(gpu.build_program(&QUAD_EXTERNAL)?);
        gpu.clear_color([0.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    fn planes(&self) -> &'static [ImagePlane] {
        &[ImagePlane::Rgb]
    }

    fn redraw(&mut self, gpu: &mut dyn GpuDevice, ctx: &RedrawContext<'_>) -> GpuResult<()> {
        let Some(program) = self.program else {
            return Ok(());
        };
        gpu.bind_framebuffer(None)?;
        gpu.clear()?;
        gpu.viewport(ctx.window.preview_viewport());
        draw_plane(gpu, program, ctx.textures, ImagePlane::Rgb)
    }

    fn gl_term(&mut self, gpu: &mut dyn GpuDevice) {
        if let Some(program) = self.program.take() {
            gpu.delete_program(program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{BufferPool, FrameGeometry};
    use crate::gpu::Viewport;
    use crate::pipelines::preview::textures::TextureSet;
    use crate::scenes::test_support::{filled_buffer, gpu_for};

    #[test]
    fn test_draws_converted_frame() {
        let window = WindowGeometry::from_preview(Viewport::new(0, 0, 8, 8));
        let mut scene = PassthroughScene::new();
        let mut gpu = gpu_for(&mut scene, &window);

        let geometry = FrameGeometry::new(8, 8);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        // Neutral chroma: grey stays grey
        let buf = filled_buffer(&pool, geometry, [128, 128, 128]);

        let mut textures = TextureSet::new();
        textures.create(&mut gpu).unwrap();
        scene
            .update_texture(&mut gpu, &mut textures, ImagePlane::Rgb, buf.data().unwrap())
            .unwrap();

        let ctx = RedrawContext {
            window,
            textures: &textures,
            overlays: &[],
        };
        scene.redraw(&mut gpu, &ctx).unwrap();
        let frame = scene.capture(&mut gpu).unwrap();
        let px = &frame.pixels[..4];
        assert!(px[0] == px[1] && px[1] == px[2] && px[3] == 255, "{:?}", px);
        assert!(px[0] > 100 && px[0] < 160);

        textures.delete(&mut gpu);
        scene.gl_term(&mut gpu);
        buf.release();
    }
}
