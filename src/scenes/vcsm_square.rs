// SPDX-License-Identifier: GPL-3.0-only

//! Render into CPU-accessible shared memory
//!
//! The camera's luma plane is drawn into a framebuffer whose colour
//! attachment is a shared-memory surface. After `finish` the surface is
//! locked and handed to the [`Publisher`] callback (or the moving-bar
//! pattern when none is registered), which may read or modify it in raster
//! order. The surface is then drawn to the window as an ordinary texture,
//! followed by the registered overlay rectangles.

use super::{RedrawContext, Scene, WindowGeometry, draw_plane};
use crate::constants::vcsm::{BAR_WIDTH, FB_SIZE};
use crate::gpu::{
    Fill, FramebufferId, GpuDevice, GpuResult, ImagePlane, Primitive, ProgramId, SurfaceId,
    SurfaceView, TextureId, TextureTarget, Viewport,
};
use crate::shaders::{OVERLAY_LINE, QUAD_EXTERNAL, QUAD_TEXTURE_2D, QUAD_VERTICES};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Callback receiving the locked shared-memory frame
pub type PublishFn = Box<dyn FnMut(SurfaceView<'_>) + Send>;

/// Handle for registering the shared-memory frame consumer
///
/// Clones share the same slot, so a session can set the callback while the
/// scene is running on the render thread. The callback runs without the slot
/// locked and may call back into its own publisher.
#[derive(Clone, Default)]
pub struct Publisher {
    slot: Arc<Mutex<Slot>>,
}

#[derive(Default)]
struct Slot {
    callback: Option<PublishFn>,
    /// Bumped by every `set` and `clear`
    generation: u64,
    /// Generation of the callback running outside the lock
    running: Option<u64>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("is_set", &self.is_set())
            .finish()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the consumer of every locked frame
    pub fn set<F>(&self, callback: F)
    where
        F: FnMut(SurfaceView<'_>) + Send + 'static,
    {
        let mut slot = self.lock();
        slot.callback = Some(Box::new(callback));
        slot.generation += 1;
    }

    /// Go back to the built-in pattern
    pub fn clear(&self) {
        let mut slot = self.lock();
        slot.callback = None;
        slot.generation += 1;
    }

    pub fn is_set(&self) -> bool {
        let slot = self.lock();
        slot.callback.is_some() || slot.running == Some(slot.generation)
    }

    /// Give `view` to the registered callback; `false` if there is none
    fn publish(&self, view: SurfaceView<'_>) -> bool {
        let (mut callback, generation) = {
            let mut slot = self.lock();
            let Some(callback) = slot.callback.take() else {
                return false;
            };
            slot.running = Some(slot.generation);
            (callback, slot.generation)
        };

        callback(view);

        let mut slot = self.lock();
        slot.running = None;
        if slot.generation == generation {
            slot.callback = Some(callback);
        } else {
            trace!("Publisher changed while its callback ran");
        }
        true
    }
}

/// White bar sliding one pixel right per frame
#[derive(Debug, Default)]
pub struct BarPattern {
    x_offset: u32,
}

impl BarPattern {
    pub fn x_offset(&self) -> u32 {
        self.x_offset
    }

    pub fn draw(&mut self, mut view: SurfaceView<'_>) {
        let width = view.width.min(BAR_WIDTH);
        let travel = view.width - width;
        self.x_offset = if travel == 0 {
            0
        } else {
            (self.x_offset + 1) % travel
        };

        let white: [u8; 4] = bytemuck::cast(!0u32);
        let start = self.x_offset as usize * 4;
        let end = start + width as usize * 4;
        for row in view.pixels.chunks_mut(view.stride).take(view.height as usize) {
            if let Some(span) = row.get_mut(start..end) {
                for px in span.chunks_exact_mut(4) {
                    px.copy_from_slice(&white);
                }
            }
        }
    }
}

const RED: [u8; 4] = [255, 0, 0, 255];
const MAGENTA: [u8; 4] = [255, 0, 255, 255];

/// Per-vertex colours of an overlay loop: magenta right of the centre line
fn overlay_colors(vertices: &[[f32; 2]]) -> Vec<[u8; 4]> {
    vertices
        .iter()
        .map(|v| if v[0] > 0.0 { MAGENTA } else { RED })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Objects {
    oes_program: ProgramId,
    quad_program: ProgramId,
    line_program: ProgramId,
    surface: SurfaceId,
    fb_texture: TextureId,
    framebuffer: FramebufferId,
}

/// Objects `gl_init` has created so far
#[derive(Debug, Default)]
struct Built {
    programs: Vec<ProgramId>,
    surface: Option<SurfaceId>,
    fb_texture: Option<TextureId>,
}

impl Built {
    /// Release everything in reverse creation order
    fn unwind(self, gpu: &mut dyn GpuDevice) {
        if let Some(texture) = self.fb_texture {
            gpu.delete_texture(texture);
        }
        if let Some(surface) = self.surface {
            gpu.destroy_shared_surface(surface);
        }
        for program in self.programs.into_iter().rev() {
            gpu.delete_program(program);
        }
    }
}

fn build_objects(gpu: &mut dyn GpuDevice, built: &mut Built) -> GpuResult<Objects> {
    for source in [&QUAD_EXTERNAL, &QUAD_TEXTURE_2D, &OVERLAY_LINE] {
        built.programs.push(gpu.build_program(source)?);
    }

    let (surface, image) = gpu.create_shared_surface(FB_SIZE, FB_SIZE)?;
    built.surface = Some(surface);
    let fb_texture = gpu.gen_texture()?;
    built.fb_texture = Some(fb_texture);
    gpu.bind_image(fb_texture, TextureTarget::Texture2D, image)?;
    let framebuffer = gpu.create_framebuffer(fb_texture)?;

    Ok(Objects {
        oes_program: built.programs[0],
        quad_program: built.programs[1],
        line_program: built.programs[2],
        surface,
        fb_texture,
        framebuffer,
    })
}

pub struct VcsmSquareScene {
    publisher: Publisher,
    pattern: BarPattern,
    objects: Option<Objects>,
}

impl VcsmSquareScene {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            publisher,
            pattern: BarPattern::default(),
            objects: None,
        }
    }
}

impl Scene for VcsmSquareScene {
    fn name(&self) -> &'static str {
        "vcsm_square"
    }

    fn gl_init(&mut self, gpu: &mut dyn GpuDevice, _window: &WindowGeometry) -> GpuResult<()> {
        let mut built = Built::default();
        match build_objects(gpu, &mut built) {
            Ok(objects) => {
                gpu.clear_color([0.1, 0.1, 0.1, 0.5]);
                debug!(
                    size = FB_SIZE,
                    surface = objects.surface.raw(),
                    "Shared-memory framebuffer ready"
                );
                self.objects = Some(objects);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Shared-memory scene setup failed");
                built.unwind(gpu);
                Err(e)
            }
        }
    }

    fn planes(&self) -> &'static [ImagePlane] {
        &[ImagePlane::Y]
    }

    fn redraw(&mut self, gpu: &mut dyn GpuDevice, ctx: &RedrawContext<'_>) -> GpuResult<()> {
        let Some(objects) = self.objects else {
            return Ok(());
        };

        // Camera luma into the shared-memory framebuffer
        gpu.bind_framebuffer(Some(objects.framebuffer))?;
        gpu.viewport(Viewport::new(0, 0, FB_SIZE, FB_SIZE));
        gpu.clear()?;
        draw_plane(gpu, objects.oes_program, ctx.textures, ImagePlane::Y)?;
        gpu.finish()?;

        let publisher = &self.publisher;
        let pattern = &mut self.pattern;
        gpu.with_locked_surface(objects.surface, &mut |mut view: SurfaceView<'_>| {
            if !publisher.publish(SurfaceView {
                width: view.width,
                height: view.height,
                stride: view.stride,
                pixels: &mut *view.pixels,
            }) {
                pattern.draw(view);
            }
        })?;
        trace!(x_offset = self.pattern.x_offset(), "Shared surface published");

        // Shared memory back to the window
        gpu.bind_framebuffer(None)?;
        gpu.clear()?;
        gpu.viewport(ctx.window.preview_viewport());
        gpu.draw(
            objects.quad_program,
            Primitive::Triangles,
            &QUAD_VERTICES,
            &Fill::Texture(objects.fb_texture),
        )?;

        for overlay in ctx.overlays {
            gpu.draw(
                objects.line_program,
                Primitive::LineLoop,
                overlay,
                &Fill::VertexColors(overlay_colors(overlay)),
            )?;
        }
        Ok(())
    }

    fn gl_term(&mut self, gpu: &mut dyn GpuDevice) {
        if let Some(objects) = self.objects.take() {
            gpu.bind_framebuffer(None).ok();
            gpu.delete_framebuffer(objects.framebuffer);
            gpu.delete_texture(objects.fb_texture);
            gpu.destroy_shared_surface(objects.surface);
            gpu.delete_program(objects.line_program);
            gpu.delete_program(objects.quad_program);
            gpu.delete_program(objects.oes_program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{BufferPool, FrameGeometry};
    use crate::gpu::{GpuError, HeadlessPresenter, RgbaFrame, SoftwareGpu};
    use crate::pipelines::preview::overlay::OverlayRect;
    use crate::pipelines::preview::textures::TextureSet;
    use crate::scenes::test_support::{filled_buffer, gpu_for};

    fn pixel(frame: &RgbaFrame, col: u32, row: u32) -> [u8; 4] {
        let idx = ((row * frame.width + col) * 4) as usize;
        [
            frame.pixels[idx],
            frame.pixels[idx + 1],
            frame.pixels[idx + 2],
            frame.pixels[idx + 3],
        ]
    }

    #[test]
    fn test_bar_pattern_moves_one_pixel() {
        let (width, height) = (64u32, 2u32);
        let mut pixels = vec![0u8; (width * height * 4) as usize];
        let mut pattern = BarPattern::default();

        pattern.draw(SurfaceView {
            width,
            height,
            stride: width as usize * 4,
            pixels: &mut pixels,
        });
        assert_eq!(pattern.x_offset(), 1);
        // Columns 1..33 are white on every row
        for row in 0..height as usize {
            let base = row * width as usize * 4;
            assert_eq!(pixels[base], 0);
            assert_eq!(&pixels[base + 4..base + 8], &[255; 4]);
            assert_eq!(&pixels[base + 32 * 4..base + 33 * 4], &[255; 4]);
            assert_eq!(pixels[base + 33 * 4], 0);
        }
    }

    #[test]
    fn test_bar_pattern_wraps() {
        let mut pattern = BarPattern { x_offset: 31 };
        let mut pixels = vec![0u8; 64 * 4];
        pattern.draw(SurfaceView {
            width: 64,
            height: 1,
            stride: 64 * 4,
            pixels: &mut pixels,
        });
        // 64 - 32 = 32 positions
        assert_eq!(pattern.x_offset(), 0);
    }

    #[test]
    fn test_overlay_colors_follow_vertex_x() {
        let ndc = OverlayRect::new(0, 0, 100, 100).to_ndc(100, 100);
        assert_eq!(overlay_colors(&ndc), vec![RED, RED, MAGENTA, MAGENTA]);
    }

    fn publish_blank(publisher: &Publisher) -> bool {
        let mut pixels = vec![0u8; 4 * 4];
        publisher.publish(SurfaceView {
            width: 2,
            height: 2,
            stride: 8,
            pixels: &mut pixels,
        })
    }

    #[test]
    fn test_callback_can_clear_its_own_publisher() {
        let publisher = Publisher::new();
        let inner = publisher.clone();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_cb = Arc::clone(&calls);
        publisher.set(move |_view: SurfaceView<'_>| {
            calls_cb.lock().unwrap().push(inner.is_set());
            inner.clear();
            calls_cb.lock().unwrap().push(inner.is_set());
        });

        assert!(publish_blank(&publisher));
        assert_eq!(*calls.lock().unwrap(), vec![true, false]);
        assert!(!publisher.is_set());
        assert!(!publish_blank(&publisher));
    }

    #[test]
    fn test_callback_can_replace_itself() {
        let publisher = Publisher::new();
        let inner = publisher.clone();
        let replaced = Arc::new(Mutex::new(0u32));
        let replaced_cb = Arc::clone(&replaced);
        publisher.set(move |_view: SurfaceView<'_>| {
            let counter = Arc::clone(&replaced_cb);
            inner.set(move |_view: SurfaceView<'_>| *counter.lock().unwrap() += 1);
        });

        assert!(publish_blank(&publisher));
        assert!(publisher.is_set());
        assert!(publish_blank(&publisher));
        assert!(publish_blank(&publisher));
        assert_eq!(*replaced.lock().unwrap(), 2);
    }

    #[test]
    fn test_failed_setup_releases_partial_objects() {
        let mut gpu = SoftwareGpu::new(Box::new(HeadlessPresenter::new())).with_memory_limit(1024);
        let stats = gpu.stats();
        let window = WindowGeometry::from_preview(Viewport::new(0, 0, 16, 16));
        let mut scene = VcsmSquareScene::new(Publisher::new());
        scene.create_native_window(&mut gpu, &window).unwrap();
        gpu.init_context(&scene.egl_config()).unwrap();

        let err = scene.gl_init(&mut gpu, &window).unwrap_err();
        assert!(matches!(err, GpuError::OutOfMemory(_)));
        assert!(scene.objects.is_none());
        assert_eq!(stats.live_programs(), 0);
        assert_eq!(stats.live_images(), 0);
    }

    #[test]
    fn test_publisher_sees_camera_luma_and_edits_reach_window() {
        let window = WindowGeometry::from_preview(Viewport::new(0, 0, 64, 64));
        let publisher = Publisher::new();
        let mut scene = VcsmSquareScene::new(publisher.clone());
        let mut gpu = gpu_for(&mut scene, &window);

        let geometry = FrameGeometry::new(16, 16);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        let buf = filled_buffer(&pool, geometry, [90, 128, 128]);
        let mut textures = TextureSet::new();
        textures.create(&mut gpu).unwrap();
        scene
            .update_texture(&mut gpu, &mut textures, ImagePlane::Y, buf.data().unwrap())
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);
        publisher.set(move |mut view: SurfaceView<'_>| {
            *seen_cb.lock().unwrap() = Some((view.width, view.stride, view.pixels[0]));
            // Paint the top 16 rows blue
            for px in view.pixels[..view.stride * 16].chunks_exact_mut(4) {
                px.copy_from_slice(&[0, 0, 255, 255]);
            }
        });

        let overlay = OverlayRect::new(8, 8, 48, 48).to_ndc(64, 64);
        let ctx = RedrawContext {
            window,
            textures: &textures,
            overlays: &[overlay],
        };
        scene.redraw(&mut gpu, &ctx).unwrap();
        let frame = scene.capture(&mut gpu).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            Some((FB_SIZE, FB_SIZE as usize * 4, 90))
        );
        assert_eq!(pixel(&frame, 20, 0), [0, 0, 255, 255]);
        assert_eq!(pixel(&frame, 20, 30), [90, 90, 90, 255]);
        // Left edge of the overlay is red, right edge magenta
        assert_eq!(pixel(&frame, 8, 30), RED);
        assert_eq!(pixel(&frame, 56, 30), MAGENTA);

        publisher.clear();
        assert!(!publisher.is_set());
        textures.delete(&mut gpu);
        scene.gl_term(&mut gpu);
        buf.release();
    }
}
