// SPDX-License-Identifier: GPL-3.0-only

//! RGB and the three I420 planes side by side
//!
//! ```text
//! ┌─────┬─────┐
//! │ RGB │  Y  │
//! ├─────┼─────┤
//! │  U  │  V  │
//! └─────┴─────┘
//! ```

use super::{RedrawContext, Scene, WindowGeometry, draw_plane};
use crate::gpu::{GpuDevice, GpuResult, ImagePlane, ProgramId, Viewport};
use crate::shaders::QUAD_EXTERNAL;

#[derive(Debug, Default)]
pub struct YuvScene {
    program: Option<ProgramId>,
}

impl YuvScene {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Quadrant of `area` showing `plane`
fn quadrant(area: Viewport, plane: ImagePlane) -> Viewport {
    let half_w = area.width / 2;
    let half_h = area.height / 2;
    // GL viewports grow upwards, so the top row sits at y + half_h
    let (col, row) = match plane {
        ImagePlane::Rgb => (0, 1),
        ImagePlane::Y => (1, 1),
        ImagePlane::U => (0, 0),
        ImagePlane::V => (1, 0),
    };
    Viewport::new(
        area.x + (col * half_w) as i32,
        area.y + (row * half_h) as i32,
        half_w,
        half_h,
    )
}

impl Scene for YuvScene {
    fn name(&self) -> &'static str {
        "yuv"
    }

    fn gl_init(&mut self, gpu: &mut dyn GpuDevice, _window: &WindowGeometry) -> GpuResult<()> {
        self.program = Some(gpu.build_program(&QUAD_EXTERNAL)?);
        gpu.clear_color([0.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    fn planes(&self) -> &'static [ImagePlane] {
        &ImagePlane::ALL
    }

    fn redraw(&mut self, gpu: &mut dyn GpuDevice, ctx: &RedrawContext<'_>) -> GpuResult<()> {
        let Some(program) = self.program else {
            return Ok(());
        };
        gpu.bind_framebuffer(None)?;
        gpu.clear()?;
        let area = ctx.window.preview_viewport();
        for plane in ImagePlane::ALL {
            gpu.viewport(quadrant(area, plane));
            draw_plane(gpu, program, ctx.textures, plane)?;
        }
        Ok(())
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
    use crate::pipelines::preview::textures::TextureSet;
    use crate::scenes::test_support::{filled_buffer, gpu_for};

    fn pixel(frame: &crate::gpu::RgbaFrame, col: u32, row: u32) -> [u8; 4] {
        let idx = ((row * frame.width + col) * 4) as usize;
        [
            frame.pixels[idx],
            frame.pixels[idx + 1],
            frame.pixels[idx + 2],
            frame.pixels[idx + 3],
        ]
    }

    #[test]
    fn test_quadrants() {
        let area = Viewport::new(0, 0, 100, 80);
        assert_eq!(quadrant(area, ImagePlane::Rgb), Viewport::new(0, 40, 50, 40));
        assert_eq!(quadrant(area, ImagePlane::V), Viewport::new(50, 0, 50, 40));
    }

    #[test]
    fn test_planes_land_in_their_quadrants() {
        let window = WindowGeometry::from_preview(Viewport::new(0, 0, 8, 8));
        let mut scene = YuvScene::new();
        let mut gpu = gpu_for(&mut scene, &window);

        let geometry = FrameGeometry::new(4, 4);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        let buf = filled_buffer(&pool, geometry, [200, 60, 20]);

        let mut textures = TextureSet::new();
        textures.create(&mut gpu).unwrap();
        for plane in scene.planes() {
            scene
                .update_texture(&mut gpu, &mut textures, *plane, buf.data().unwrap())
                .unwrap();
        }

        let ctx = RedrawContext {
            window,
            textures: &textures,
            overlays: &[],
        };
        scene.redraw(&mut gpu, &ctx).unwrap();
        let frame = scene.capture(&mut gpu).unwrap();

        // Top-right is Y, bottom-left U, bottom-right V
        assert_eq!(pixel(&frame, 6, 1), [200, 200, 200, 255]);
        assert_eq!(pixel(&frame, 1, 6), [60, 60, 60, 255]);
        assert_eq!(pixel(&frame, 6, 6), [20, 20, 20, 255]);

        textures.delete(&mut gpu);
        scene.gl_term(&mut gpu);
        buf.release();
    }
}
