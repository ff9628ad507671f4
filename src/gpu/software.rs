// SPDX-License-Identifier: GPL-3.0-only

//! CPU implementation of [`GpuDevice`] used as a test double
//!
//! Keeps GL-style object tables and renders with [`raster`](super::raster),
//! so scene and worker tests run without an adapter. Programs go through the
//! same naga validation as on [`WgpuDevice`](super::WgpuDevice).
//! External images are imported the way the VideoCore driver imports an
//! opaque camera buffer: the RGB plane is converted from I420 once at import,
//! the Y/U/V planes are exposed as luminance images. Each image keeps the
//! camera buffer marked as GPU-referenced until it is destroyed.

use super::raster::{self, Shade, Target, TextureView};
use super::{
    EglConfig, Fill, FramebufferId, GpuDevice, GpuError, GpuResult, ImageId, ImagePlane,
    Presenter, Primitive, ProgramId, RgbaFrame, SurfaceId, SurfaceView, TextureId, TextureTarget,
    Viewport,
};
use super::present::FrameView;
use super::stats::GpuStats;
use crate::backends::camera::{ClientBuffer, buffer::GpuRef};
use crate::media::yuv;
use crate::shaders::{self, SamplerKind, ShaderProgramSource};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

struct Program {
    name: String,
    sampler: SamplerKind,
}

#[derive(Default)]
struct Texture {
    binding: Option<(TextureTarget, ImageId)>,
}

enum Image {
    External {
        width: u32,
        height: u32,
        rgba: Vec<u8>,
        _gpu_ref: GpuRef,
    },
    Surface(SurfaceId),
}

struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

struct Window {
    viewport: Viewport,
    pixels: Vec<u8>,
}

/// Software GLES 2.0 device presenting through a [`Presenter`]
pub struct SoftwareGpu {
    presenter: Box<dyn Presenter>,
    memory_limit: Option<usize>,
    memory_used: usize,
    next_id: u32,
    window: Option<Window>,
    context: Option<EglConfig>,
    programs: HashMap<ProgramId, Program>,
    textures: HashMap<TextureId, Texture>,
    images: HashMap<ImageId, Image>,
    surfaces: HashMap<SurfaceId, Surface>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    bound_framebuffer: Option<FramebufferId>,
    viewport: Viewport,
    clear_rgba: [u8; 4],
    stats: Arc<GpuStats>,
}

impl SoftwareGpu {
    pub fn new(presenter: Box<dyn Presenter>) -> Self {
        Self {
            presenter,
            memory_limit: None,
            memory_used: 0,
            next_id: 1,
            window: None,
            context: None,
            programs: HashMap::new(),
            textures: HashMap::new(),
            images: HashMap::new(),
            surfaces: HashMap::new(),
            framebuffers: HashMap::new(),
            bound_framebuffer: None,
            viewport: Viewport::new(0, 0, 0, 0),
            clear_rgba: [0, 0, 0, 255],
            stats: Arc::new(GpuStats::default()),
        }
    }

    /// Cap image and surface memory, like the VideoCore GPU memory split
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn stats(&self) -> Arc<GpuStats> {
        Arc::clone(&self.stats)
    }

    fn next<T>(&mut self, make: fn(u32) -> T) -> T {
        let id = self.next_id;
        self.next_id += 1;
        make(id)
    }

    fn require_context(&self, call: &str) -> GpuResult<()> {
        if self.context.is_none() {
            return Err(GpuError::InvalidOperation(format!("{}: no current context", call)));
        }
        Ok(())
    }

    fn reserve(&mut self, bytes: usize, what: &str) -> GpuResult<()> {
        if let Some(limit) = self.memory_limit
            && self.memory_used + bytes > limit
        {
            return Err(GpuError::OutOfMemory(format!(
                "{} needs {} bytes, {} of {} in use",
                what, bytes, self.memory_used, limit
            )));
        }
        self.memory_used += bytes;
        Ok(())
    }

    fn release_image_memory(&mut self, image: &Image) {
        if let Image::External { rgba, .. } = image {
            self.memory_used = self.memory_used.saturating_sub(rgba.len());
        }
    }

    /// Pixels and size of the image bound to `texture`
    fn texture_view(&self, texture: TextureId, expected: SamplerKind) -> GpuResult<TextureView<'_>> {
        let tex = self
            .textures
            .get(&texture)
            .ok_or_else(|| GpuError::InvalidHandle(format!("texture {}", texture.0)))?;
        let (target, image) = tex.binding.ok_or_else(|| {
            GpuError::InvalidOperation(format!("texture {} has no image", texture.0))
        })?;

        let target_kind = match target {
            TextureTarget::External => SamplerKind::External,
            TextureTarget::Texture2D => SamplerKind::Texture2D,
        };
        if target_kind != expected {
            return Err(GpuError::InvalidOperation(format!(
                "texture {} is bound as {:?} but the program samples {:?}",
                texture.0, target, expected
            )));
        }

        match self.images.get(&image) {
            Some(Image::External {
                width,
                height,
                rgba,
                ..
            }) => Ok(TextureView {
                pixels: rgba,
                width: *width,
                height: *height,
            }),
            Some(Image::Surface(surface)) => {
                let surface = self
                    .surfaces
                    .get(surface)
                    .ok_or_else(|| GpuError::InvalidHandle(format!("surface {}", surface.0)))?;
                Ok(TextureView {
                    pixels: &surface.pixels,
                    width: surface.width,
                    height: surface.height,
                })
            }
            None => Err(GpuError::InvalidHandle(format!("image {}", image.0))),
        }
    }

    fn samples_surface(&self, texture: TextureId, surface: SurfaceId) -> bool {
        self.textures
            .get(&texture)
            .and_then(|t| t.binding)
            .is_some_and(|(_, image)| {
                matches!(self.images.get(&image), Some(Image::Surface(s)) if *s == surface)
            })
    }

    /// Surface the bound framebuffer renders into, `None` for the window
    fn target_surface(&self) -> GpuResult<Option<SurfaceId>> {
        let Some(fb) = self.bound_framebuffer else {
            return Ok(None);
        };
        let texture = self
            .framebuffers
            .get(&fb)
            .ok_or_else(|| GpuError::InvalidHandle(format!("framebuffer {}", fb.0)))?;
        match self.textures.get(texture).and_then(|t| t.binding) {
            Some((_, image)) => match self.images.get(&image) {
                Some(Image::Surface(surface)) => Ok(Some(*surface)),
                _ => Err(GpuError::InvalidOperation(format!(
                    "framebuffer {} is incomplete",
                    fb.0
                ))),
            },
            None => Err(GpuError::InvalidOperation(format!(
                "framebuffer {} is incomplete",
                fb.0
            ))),
        }
    }

    /// Move the current render target's pixels out so sources can be borrowed
    fn take_target(&mut self) -> GpuResult<(Option<SurfaceId>, Vec<u8>, u32, u32)> {
        match self.target_surface()? {
            Some(id) => {
                let surface = self
                    .surfaces
                    .get_mut(&id)
                    .ok_or_else(|| GpuError::InvalidHandle(format!("surface {}", id.0)))?;
                Ok((
                    Some(id),
                    std::mem::take(&mut surface.pixels),
                    surface.width,
                    surface.height,
                ))
            }
            None => {
                let window = self
                    .window
                    .as_mut()
                    .ok_or_else(|| GpuError::Context("no native window".into()))?;
                Ok((
                    None,
                    std::mem::take(&mut window.pixels),
                    window.viewport.width,
                    window.viewport.height,
                ))
            }
        }
    }

    fn restore_target(&mut self, surface: Option<SurfaceId>, pixels: Vec<u8>) {
        match surface {
            Some(id) => {
                if let Some(surface) = self.surfaces.get_mut(&id) {
                    surface.pixels = pixels;
                }
            }
            None => {
                if let Some(window) = self.window.as_mut() {
                    window.pixels = pixels;
                }
            }
        }
    }

    fn render(
        &self,
        mut target: Target<'_>,
        program: &Program,
        primitive: Primitive,
        vertices: &[[f32; 2]],
        fill: &Fill,
    ) -> GpuResult<()> {
        let shade = match fill {
            Fill::Texture(texture) => {
                if program.sampler == SamplerKind::None {
                    return Err(GpuError::InvalidOperation(format!(
                        "program '{}' has no sampler",
                        program.name
                    )));
                }
                Shade::Texture(self.texture_view(*texture, program.sampler)?)
            }
            Fill::Color(rgba) => Shade::Color(*rgba),
            Fill::VertexColors(colors) => {
                if colors.len() < vertices.len() {
                    return Err(GpuError::InvalidOperation(format!(
                        "{} colours for {} vertices",
                        colors.len(),
                        vertices.len()
                    )));
                }
                Shade::VertexColors(colors)
            }
        };

        let written = match primitive {
            Primitive::Triangles => raster::fill_triangles(&mut target, &self.viewport, vertices, &shade),
            Primitive::LineLoop => {
                if matches!(shade, Shade::Texture(_)) {
                    return Err(GpuError::InvalidOperation(
                        "line loops cannot be textured".into(),
                    ));
                }
                raster::draw_line_loop(&mut target, &self.viewport, vertices, &shade)
            }
        };
        trace!(program = %program.name, ?primitive, written, "Draw");
        Ok(())
    }
}

impl GpuDevice for SoftwareGpu {
    fn create_native_window(&mut self, viewport: Viewport) -> GpuResult<()> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(GpuError::Context(format!(
                "invalid window size {}x{}",
                viewport.width, viewport.height
            )));
        }
        let bytes = viewport.width as usize * viewport.height as usize * 4;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(bytes).map_err(|e| {
            GpuError::OutOfMemory(format!(
                "window {}x{}: {}",
                viewport.width, viewport.height, e
            ))
        })?;
        pixels.resize(bytes, 0);
        self.window = Some(Window { viewport, pixels });
        self.viewport = Viewport::new(0, 0, viewport.width, viewport.height);
        debug!(
            x = viewport.x,
            y = viewport.y,
            width = viewport.width,
            height = viewport.height,
            "Created native window"
        );
        Ok(())
    }

    fn destroy_native_window(&mut self) {
        if self.window.take().is_some() {
            debug!("Destroyed native window");
        }
    }

    fn init_context(&mut self, config: &EglConfig) -> GpuResult<()> {
        if self.window.is_none() {
            return Err(GpuError::Context("eglCreateWindowSurface: no native window".into()));
        }
        if config.red_size > 8 || config.green_size > 8 || config.blue_size > 8 || config.alpha_size > 8 {
            return Err(GpuError::Context(format!("no EGL config matches {:?}", config)));
        }
        info!(?config, "Software GLES context created");
        self.context = Some(*config);
        Ok(())
    }

    fn terminate_context(&mut self) {
        if self.context.take().is_none() {
            return;
        }
        let images: Vec<ImageId> = self.images.keys().copied().collect();
        for image in images {
            self.destroy_image(image);
        }
        self.surfaces.clear();
        self.framebuffers.clear();
        self.textures.clear();
        for _ in self.programs.drain() {
            self.stats.program_deleted();
        }
        self.bound_framebuffer = None;
        self.memory_used = 0;
        debug!("Software GLES context terminated");
    }

    fn build_program(&mut self, source: &ShaderProgramSource) -> GpuResult<ProgramId> {
        self.require_context("build_program")?;
        shaders::validate(source).map_err(|log| GpuError::ShaderCompile {
            program: source.name.to_string(),
            log,
        })?;
        let id = self.next(ProgramId);
        debug!(program = source.name, id = id.0, sampler = ?source.sampler, "Built shader program");
        self.programs.insert(
            id,
            Program {
                name: source.name.to_string(),
                sampler: source.sampler,
            },
        );
        self.stats.program_built();
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.stats.program_deleted();
        }
    }

    fn gen_texture(&mut self) -> GpuResult<TextureId> {
        self.require_context("gen_texture")?;
        let id = self.next(TextureId);
        self.textures.insert(id, Texture::default());
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn create_external_image(
        &mut self,
        buffer: &ClientBuffer,
        plane: ImagePlane,
    ) -> GpuResult<ImageId> {
        self.require_context("eglCreateImageKHR")?;
        let frame = buffer.frame();
        let geometry = frame.geometry;
        let planes = yuv::split_planes(&frame.bytes, geometry).ok_or_else(|| {
            GpuError::InvalidOperation(format!(
                "buffer {} does not hold a {}x{} I420 frame",
                buffer.handle(),
                geometry.width,
                geometry.height
            ))
        })?;

        let (width, height) = match plane {
            ImagePlane::Rgb | ImagePlane::Y => (geometry.width, geometry.height),
            ImagePlane::U | ImagePlane::V => (geometry.chroma_width(), geometry.chroma_height()),
        };
        self.reserve(width as usize * height as usize * 4, "external image")?;

        let rgba = match plane {
            ImagePlane::Rgb => yuv::i420_to_rgba(&planes, geometry),
            ImagePlane::Y => yuv::plane_to_rgba(planes.y, width, height),
            ImagePlane::U => yuv::plane_to_rgba(planes.u, width, height),
            ImagePlane::V => yuv::plane_to_rgba(planes.v, width, height),
        };
        drop(frame);

        let id = self.next(ImageId);
        self.images.insert(
            id,
            Image::External {
                width,
                height,
                rgba,
                _gpu_ref: buffer.gpu_ref(),
            },
        );
        self.stats.image_created();
        trace!(handle = buffer.handle(), plane = plane.name(), image = id.0, "Imported external image");
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        if let Some(removed) = self.images.remove(&image) {
            self.release_image_memory(&removed);
            self.stats.image_destroyed();
            for texture in self.textures.values_mut() {
                if texture.binding.is_some_and(|(_, bound)| bound == image) {
                    texture.binding = None;
                }
            }
        }
    }

    fn bind_image(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        image: ImageId,
    ) -> GpuResult<()> {
        if !self.images.contains_key(&image) {
            return Err(GpuError::InvalidHandle(format!("image {}", image.0)));
        }
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| GpuError::InvalidHandle(format!("texture {}", texture.0)))?;
        tex.binding = Some((target, image));
        Ok(())
    }

    fn create_shared_surface(
        &mut self,
        width: u32,
        height: u32,
    ) -> GpuResult<(SurfaceId, ImageId)> {
        self.require_context("create_shared_surface")?;
        // Shared-memory surfaces must have power-of-two dimensions
        if !width.is_power_of_two() || !height.is_power_of_two() {
            return Err(GpuError::InvalidOperation(format!(
                "shared surface {}x{} is not a power of two",
                width, height
            )));
        }
        let bytes = width as usize * height as usize * 4;
        self.reserve(bytes, "shared surface")?;

        let surface = self.next(SurfaceId);
        self.surfaces.insert(
            surface,
            Surface {
                width,
                height,
                pixels: vec![0; bytes],
            },
        );
        let image = self.next(ImageId);
        self.images.insert(image, Image::Surface(surface));
        self.stats.image_created();
        debug!(surface = surface.0, width, height, "Created shared surface");
        Ok((surface, image))
    }

    fn destroy_shared_surface(&mut self, surface: SurfaceId) {
        if let Some(removed) = self.surfaces.remove(&surface) {
            self.memory_used = self.memory_used.saturating_sub(removed.pixels.len());
            let images: Vec<ImageId> = self
                .images
                .iter()
                .filter(|(_, image)| matches!(image, Image::Surface(s) if *s == surface))
                .map(|(id, _)| *id)
                .collect();
            for image in images {
                self.destroy_image(image);
            }
        }
    }

    fn with_locked_surface(
        &mut self,
        surface: SurfaceId,
        access: &mut dyn FnMut(SurfaceView<'_>),
    ) -> GpuResult<()> {
        let entry = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("surface {}", surface.0)))?;
        self.stats.surface_locked();
        access(SurfaceView {
            width: entry.width,
            height: entry.height,
            stride: entry.width as usize * 4,
            pixels: &mut entry.pixels,
        });
        Ok(())
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> GpuResult<FramebufferId> {
        self.require_context("create_framebuffer")?;
        let binding = self
            .textures
            .get(&texture)
            .ok_or_else(|| GpuError::InvalidHandle(format!("texture {}", texture.0)))?
            .binding;
        match binding.and_then(|(_, image)| self.images.get(&image)) {
            Some(Image::Surface(_)) => {}
            _ => {
                return Err(GpuError::InvalidOperation(format!(
                    "texture {} cannot be a colour attachment",
                    texture.0
                )));
            }
        }
        let id = self.next(FramebufferId);
        self.framebuffers.insert(id, texture);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()> {
        if let Some(fb) = framebuffer
            && !self.framebuffers.contains_key(&fb)
        {
            return Err(GpuError::InvalidHandle(format!("framebuffer {}", fb.0)));
        }
        self.bound_framebuffer = framebuffer;
        Ok(())
    }

    fn viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_rgba = rgba.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    }

    fn clear(&mut self) -> GpuResult<()> {
        self.require_context("clear")?;
        let (surface, mut pixels, width, height) = self.take_target()?;
        raster::clear(
            &mut Target {
                pixels: &mut pixels,
                width,
                height,
            },
            self.clear_rgba,
        );
        self.restore_target(surface, pixels);
        Ok(())
    }

    fn draw(
        &mut self,
        program: ProgramId,
        primitive: Primitive,
        vertices: &[[f32; 2]],
        fill: &Fill,
    ) -> GpuResult<()> {
        self.require_context("draw")?;
        if !self.programs.contains_key(&program) {
            return Err(GpuError::InvalidHandle(format!("program {}", program.0)));
        }

        let (surface, mut pixels, width, height) = self.take_target()?;
        let result = match self.programs.get(&program) {
            Some(prog) => {
                if let (Some(target), Fill::Texture(texture)) = (surface, fill)
                    && self.samples_surface(*texture, target)
                {
                    Err(GpuError::InvalidOperation(
                        "texture is also the render target".into(),
                    ))
                } else {
                    let target = Target {
                        pixels: &mut pixels,
                        width,
                        height,
                    };
                    self.render(target, prog, primitive, vertices, fill)
                }
            }
            None => Err(GpuError::InvalidHandle(format!("program {}", program.0))),
        };
        self.restore_target(surface, pixels);
        result?;

        let window_loop = primitive == Primitive::LineLoop && surface.is_none();
        self.stats.drew(window_loop.then_some(vertices));
        Ok(())
    }

    fn finish(&mut self) -> GpuResult<()> {
        self.require_context("finish")
    }

    fn read_pixels(&mut self) -> GpuResult<RgbaFrame> {
        self.require_context("read_pixels")?;
        let window = self
            .window
            .as_ref()
            .ok_or_else(|| GpuError::Context("no native window".into()))?;
        Ok(RgbaFrame {
            width: window.viewport.width,
            height: window.viewport.height,
            pixels: window.pixels.clone(),
        })
    }

    fn swap_buffers(&mut self) -> GpuResult<()> {
        self.require_context("swap_buffers")?;
        let window = self
            .window
            .as_ref()
            .ok_or_else(|| GpuError::Context("no native window".into()))?;
        self.presenter.present(FrameView {
            width: window.viewport.width,
            height: window.viewport.height,
            pixels: &window.pixels,
        })?;

        self.stats.swapped();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::BufferPool;
    use crate::backends::camera::types::FrameGeometry;
    use crate::gpu::HeadlessPresenter;
    use crate::shaders::{OVERLAY_LINE, QUAD_EXTERNAL, QUAD_TEXTURE_2D, QUAD_VERTICES};

    fn gpu_with_window(width: u32, height: u32) -> SoftwareGpu {
        let mut gpu = SoftwareGpu::new(Box::new(HeadlessPresenter::new()));
        gpu.create_native_window(Viewport::new(0, 0, width, height))
            .unwrap();
        gpu.init_context(&EglConfig::default()).unwrap();
        gpu
    }

    #[test]
    fn test_objects_need_a_context() {
        let mut gpu = SoftwareGpu::new(Box::new(HeadlessPresenter::new()));
        assert!(matches!(
            gpu.gen_texture(),
            Err(GpuError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_build_program_reports_compile_errors() {
        let mut gpu = gpu_with_window(4, 4);
        let broken = ShaderProgramSource {
            source: "fn vs_main( {",
            ..QUAD_TEXTURE_2D
        };
        let err = gpu.build_program(&broken).unwrap_err();
        assert!(matches!(err, GpuError::ShaderCompile { ref program, .. } if program == "quad_2d"));
    }

    #[test]
    fn test_external_image_holds_buffer_reference() {
        let mut gpu = gpu_with_window(4, 4);
        let geometry = FrameGeometry::new(4, 4);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        let mut buf = pool.acquire_empty().unwrap();
        buf.fill(geometry, 0, |bytes| bytes.fill(128)).unwrap();

        let client = buf.data().unwrap().clone();
        let image = gpu.create_external_image(&client, ImagePlane::Rgb).unwrap();
        assert_eq!(client.gpu_ref_count(), 1);
        assert_eq!(gpu.stats().live_images(), 1);

        gpu.destroy_image(image);
        assert_eq!(client.gpu_ref_count(), 0);
        assert_eq!(gpu.stats().live_images(), 0);
        buf.release();
    }

    #[test]
    fn test_memory_limit_is_out_of_memory() {
        let mut gpu = SoftwareGpu::new(Box::new(HeadlessPresenter::new())).with_memory_limit(1024);
        gpu.create_native_window(Viewport::new(0, 0, 4, 4)).unwrap();
        gpu.init_context(&EglConfig::default()).unwrap();
        assert!(matches!(
            gpu.create_shared_surface(64, 64),
            Err(GpuError::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_sampler_must_match_texture_target() {
        let mut gpu = gpu_with_window(4, 4);
        let program = gpu.build_program(&QUAD_TEXTURE_2D).unwrap();
        let geometry = FrameGeometry::new(2, 2);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        let mut buf = pool.acquire_empty().unwrap();
        buf.fill(geometry, 0, |bytes| bytes.fill(200)).unwrap();

        let texture = gpu.gen_texture().unwrap();
        let image = gpu
            .create_external_image(buf.data().unwrap(), ImagePlane::Y)
            .unwrap();
        gpu.bind_image(texture, TextureTarget::External, image).unwrap();

        let result = gpu.draw(program, Primitive::Triangles, &QUAD_VERTICES, &Fill::Texture(texture));
        assert!(matches!(result, Err(GpuError::InvalidOperation(_))));
        gpu.terminate_context();
        buf.release();
    }

    #[test]
    fn test_render_to_surface_then_window() {
        let mut gpu = gpu_with_window(4, 4);
        let oes = gpu.build_program(&QUAD_EXTERNAL).unwrap();
        let quad = gpu.build_program(&QUAD_TEXTURE_2D).unwrap();

        let geometry = FrameGeometry::new(4, 4);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        let mut buf = pool.acquire_empty().unwrap();
        buf.fill(geometry, 0, |bytes| bytes.fill(255)).unwrap();

        let camera = gpu.gen_texture().unwrap();
        let image = gpu
            .create_external_image(buf.data().unwrap(), ImagePlane::Y)
            .unwrap();
        gpu.bind_image(camera, TextureTarget::External, image).unwrap();

        let (surface, surface_image) = gpu.create_shared_surface(4, 4).unwrap();
        let fb_texture = gpu.gen_texture().unwrap();
        gpu.bind_image(fb_texture, TextureTarget::Texture2D, surface_image)
            .unwrap();
        let fb = gpu.create_framebuffer(fb_texture).unwrap();

        gpu.bind_framebuffer(Some(fb)).unwrap();
        gpu.viewport(Viewport::new(0, 0, 4, 4));
        gpu.draw(oes, Primitive::Triangles, &QUAD_VERTICES, &Fill::Texture(camera))
            .unwrap();

        let mut seen = 0u8;
        gpu.with_locked_surface(surface, &mut |mut view: SurfaceView<'_>| {
            seen = view.pixels[0];
            view.pixels[..4].copy_from_slice(&[0, 0, 255, 255]);
        })
        .unwrap();
        assert_eq!(seen, 255);

        gpu.bind_framebuffer(None).unwrap();
        gpu.draw(quad, Primitive::Triangles, &QUAD_VERTICES, &Fill::Texture(fb_texture))
            .unwrap();
        let frame = gpu.read_pixels().unwrap();
        assert_eq!(&frame.pixels[..4], &[0, 0, 255, 255]);
        assert_eq!(&frame.pixels[4..8], &[255, 255, 255, 255]);

        gpu.terminate_context();
        buf.release();
    }

    #[test]
    fn test_swap_records_line_loops_of_the_frame() {
        let mut gpu = gpu_with_window(8, 8);
        let line = gpu.build_program(&OVERLAY_LINE).unwrap();
        let vertices = [[-0.5, -0.5], [-0.5, 0.5], [0.5, 0.5], [0.5, -0.5]];
        gpu.draw(line, Primitive::LineLoop, &vertices, &Fill::Color([255, 0, 0, 255]))
            .unwrap();
        assert!(gpu.stats().last_frame_line_loops().is_empty());

        gpu.swap_buffers().unwrap();
        assert_eq!(gpu.stats().last_frame_line_loops(), vec![vertices.to_vec()]);
        assert_eq!(gpu.stats().swaps(), 1);
    }
}
