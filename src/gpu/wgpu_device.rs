// SPDX-License-Identifier: GPL-3.0-only

//! [`GpuDevice`] on wgpu
//!
//! Renders into an offscreen RGBA texture that stands in for the native
//! window surface; [`swap_buffers`](GpuDevice::swap_buffers) reads it back
//! and hands it to the [`Presenter`]. Each imported camera plane is one
//! texture upload. Shared-memory surfaces are render-target textures that
//! are read back for CPU access and written again when the lock ends.
//!
//! wgpu reports validation and allocation failures asynchronously; every
//! recorded operation runs inside an error scope so those come back as a
//! [`GpuError`] instead of reaching the uncaptured-error handler.

use super::present::FrameView;
use super::stats::GpuStats;
use super::{
    EglConfig, Fill, FramebufferId, GpuDevice, GpuError, GpuResult, ImageId, ImagePlane,
    Presenter, Primitive, ProgramId, RgbaFrame, SurfaceId, SurfaceView, TextureId, TextureTarget,
    Viewport,
};
use crate::backends::camera::{ClientBuffer, buffer::GpuRef};
use crate::media::yuv;
use crate::shaders::{self, SamplerKind, ShaderProgramSource};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use wgpu::util::DeviceExt;

/// Format of the window target, surfaces and imported planes
const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const POSITION_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];
const COLOR_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Unorm8x4];

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ColorVertex {
    position: [f32; 2],
    color: [u8; 4],
}

/// Adapter the context was created on
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: wgpu::Backend,
}

/// Create a device and queue for rendering the preview
pub async fn create_render_device(
    label: &str,
) -> Result<(Arc<wgpu::Device>, Arc<wgpu::Queue>, AdapterSummary), String> {
    info!(label = label, "Creating GPU device for preview rendering");

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| format!("Failed to find suitable GPU adapter: {}", e))?;

    let adapter_info = adapter.get_info();
    info!(
        adapter = %adapter_info.name,
        backend = ?adapter_info.backend,
        "GPU adapter selected for preview"
    );

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some(label),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        })
        .await
        .map_err(|e| format!("Failed to create GPU device: {}", e))?;

    let summary = AdapterSummary {
        name: adapter_info.name,
        backend: adapter_info.backend,
    };
    Ok((Arc::new(device), Arc::new(queue), summary))
}

/// Run `work` inside validation and out-of-memory error scopes
fn scoped<T>(
    device: &wgpu::Device,
    what: &str,
    work: impl FnOnce() -> GpuResult<T>,
) -> GpuResult<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let result = work();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    if let Some(e) = out_of_memory {
        return Err(GpuError::OutOfMemory(format!("{}: {}", what, e)));
    }
    if let Some(e) = validation {
        return Err(GpuError::InvalidOperation(format!("{}: {}", what, e)));
    }
    result
}

fn wait_idle(device: &wgpu::Device) -> GpuResult<()> {
    device
        .poll(wgpu::PollType::wait_indefinitely())
        .map(|_| ())
        .map_err(|e| GpuError::Context(format!("device poll failed: {}", e)))
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

struct Context {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    texture_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    window: wgpu::Texture,
    window_view: wgpu::TextureView,
}

impl Context {
    fn create_texture(&self, label: &str, width: u32, height: u32, usage: wgpu::TextureUsages) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage,
            view_formats: &[],
        })
    }

    fn upload(&self, texture: &wgpu::Texture, width: u32, height: u32, rgba: &[u8]) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            extent(width, height),
        );
    }

    /// Copy a texture into a mappable buffer and return its rows unpadded
    fn read_back(&self, texture: &wgpu::Texture, width: u32, height: u32) -> GpuResult<Vec<u8>> {
        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let buffer = scoped(&self.device, "read back", || {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("picam_readback"),
                size: padded as u64 * height as u64,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("picam_readback_encoder"),
                });
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &buffer,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded),
                        rows_per_image: Some(height),
                    },
                },
                extent(width, height),
            );
            self.queue.submit(Some(encoder.finish()));
            Ok(buffer)
        })?;

        let slice = buffer.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        wait_idle(&self.device)?;
        receiver
            .recv()
            .map_err(|_| GpuError::Context("buffer mapping was dropped".into()))?
            .map_err(|e| GpuError::InvalidOperation(format!("failed to map buffer: {:?}", e)))?;

        let mut pixels = Vec::with_capacity(unpadded as usize * height as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded as usize).take(height as usize) {
                pixels.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        buffer.unmap();
        Ok(pixels)
    }
}

struct Program {
    name: String,
    sampler: SamplerKind,
    triangles: wgpu::RenderPipeline,
    /// Colour programs only; sampled programs cannot draw line loops
    lines: Option<wgpu::RenderPipeline>,
}

#[derive(Default)]
struct Texture {
    binding: Option<(TextureTarget, ImageId)>,
}

enum Image {
    External {
        view: wgpu::TextureView,
        _texture: wgpu::Texture,
        _gpu_ref: GpuRef,
    },
    Surface(SurfaceId),
}

struct Surface {
    width: u32,
    height: u32,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// Hardware device presenting through a [`Presenter`]
pub struct WgpuDevice {
    presenter: Box<dyn Presenter>,
    next_id: u32,
    window: Option<Viewport>,
    context: Option<Context>,
    programs: HashMap<ProgramId, Program>,
    textures: HashMap<TextureId, Texture>,
    images: HashMap<ImageId, Image>,
    surfaces: HashMap<SurfaceId, Surface>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    bound_framebuffer: Option<FramebufferId>,
    viewport: Viewport,
    clear_rgba: wgpu::Color,
    stats: Arc<GpuStats>,
}

impl WgpuDevice {
    pub fn new(presenter: Box<dyn Presenter>) -> Self {
        Self {
            presenter,
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
            clear_rgba: wgpu::Color::BLACK,
            stats: Arc::new(GpuStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<GpuStats> {
        Arc::clone(&self.stats)
    }

    fn next<T>(&mut self, make: fn(u32) -> T) -> T {
        let id = self.next_id;
        self.next_id += 1;
        make(id)
    }

    fn context(&self, call: &str) -> GpuResult<&Context> {
        self.context
            .as_ref()
            .ok_or_else(|| GpuError::InvalidOperation(format!("{}: no current context", call)))
    }

    fn window_size(&self) -> GpuResult<(u32, u32)> {
        self.window
            .map(|w| (w.width, w.height))
            .ok_or_else(|| GpuError::Context("no native window".into()))
    }

    fn create_pipeline(
        ctx: &Context,
        source: &ShaderProgramSource,
        module: &wgpu::ShaderModule,
        topology: wgpu::PrimitiveTopology,
    ) -> wgpu::RenderPipeline {
        let sampled = source.sampler != SamplerKind::None;
        let bind_group_layouts: &[&wgpu::BindGroupLayout] = if sampled {
            &[&ctx.texture_layout]
        } else {
            &[]
        };
        let layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{}_pipeline_layout", source.name)),
                bind_group_layouts,
                push_constant_ranges: &[],
            });

        let vertex_buffer = if sampled {
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &POSITION_ATTRIBUTES,
            }
        } else {
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<ColorVertex>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &COLOR_ATTRIBUTES,
            }
        };

        ctx.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&format!("{}_{:?}_pipeline", source.name, topology)),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some(source.vertex_entry),
                    compilation_options: Default::default(),
                    buffers: &[vertex_buffer],
                },
                primitive: wgpu::PrimitiveState {
                    topology,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: Some(source.fragment_entry),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            })
    }

    /// View of the image bound to `texture`, checked against the program's sampler
    fn sampled_view(&self, texture: TextureId, expected: SamplerKind) -> GpuResult<&wgpu::TextureView> {
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
            Some(Image::External { view, .. }) => Ok(view),
            Some(Image::Surface(surface)) => self
                .surfaces
                .get(surface)
                .map(|s| &s.view)
                .ok_or_else(|| GpuError::InvalidHandle(format!("surface {}", surface.0))),
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
        match self
            .textures
            .get(texture)
            .and_then(|t| t.binding)
            .and_then(|(_, image)| self.images.get(&image))
        {
            Some(Image::Surface(surface)) => Ok(Some(*surface)),
            _ => Err(GpuError::InvalidOperation(format!(
                "framebuffer {} is incomplete",
                fb.0
            ))),
        }
    }

    /// Current render target view and size
    fn target<'a>(
        &'a self,
        ctx: &'a Context,
    ) -> GpuResult<(Option<SurfaceId>, &'a wgpu::TextureView, u32, u32)> {
        match self.target_surface()? {
            Some(id) => {
                let surface = self
                    .surfaces
                    .get(&id)
                    .ok_or_else(|| GpuError::InvalidHandle(format!("surface {}", id.0)))?;
                Ok((Some(id), &surface.view, surface.width, surface.height))
            }
            None => {
                let (width, height) = self.window_size()?;
                Ok((None, &ctx.window_view, width, height))
            }
        }
    }

    fn encode_draw(
        &self,
        ctx: &Context,
        program: &Program,
        primitive: Primitive,
        vertices: &[[f32; 2]],
        fill: &Fill,
    ) -> GpuResult<bool> {
        let (surface, view, width, height) = self.target(ctx)?;

        let bind_group = match fill {
            Fill::Texture(texture) => {
                if program.sampler == SamplerKind::None {
                    return Err(GpuError::InvalidOperation(format!(
                        "program '{}' has no sampler",
                        program.name
                    )));
                }
                if let Some(target) = surface
                    && self.samples_surface(*texture, target)
                {
                    return Err(GpuError::InvalidOperation(
                        "texture is also the render target".into(),
                    ));
                }
                let sampled = self.sampled_view(*texture, program.sampler)?;
                Some(ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("picam_texture_bind_group"),
                    layout: &ctx.texture_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(sampled),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::Sampler(&ctx.sampler),
                        },
                    ],
                }))
            }
            Fill::Color(_) | Fill::VertexColors(_) if program.sampler != SamplerKind::None => {
                return Err(GpuError::InvalidOperation(format!(
                    "program '{}' samples a texture",
                    program.name
                )));
            }
            Fill::Color(_) | Fill::VertexColors(_) => None,
        };

        let pipeline = match primitive {
            Primitive::Triangles => &program.triangles,
            Primitive::LineLoop => program.lines.as_ref().ok_or_else(|| {
                GpuError::InvalidOperation("line loops cannot be textured".into())
            })?,
        };

        // Line loops close back to their first vertex
        let mut order: Vec<usize> = (0..vertices.len()).collect();
        if primitive == Primitive::LineLoop && !vertices.is_empty() {
            order.push(0);
        }

        let contents: Vec<u8> = match fill {
            Fill::Texture(_) => {
                let positions: Vec<[f32; 2]> = order.iter().map(|&i| vertices[i]).collect();
                bytemuck::cast_slice(&positions).to_vec()
            }
            Fill::Color(rgba) => {
                let colored: Vec<ColorVertex> = order
                    .iter()
                    .map(|&i| ColorVertex {
                        position: vertices[i],
                        color: *rgba,
                    })
                    .collect();
                bytemuck::cast_slice(&colored).to_vec()
            }
            Fill::VertexColors(colors) => {
                if colors.len() < vertices.len() {
                    return Err(GpuError::InvalidOperation(format!(
                        "{} colours for {} vertices",
                        colors.len(),
                        vertices.len()
                    )));
                }
                let colored: Vec<ColorVertex> = order
                    .iter()
                    .map(|&i| ColorVertex {
                        position: vertices[i],
                        color: colors[i],
                    })
                    .collect();
                bytemuck::cast_slice(&colored).to_vec()
            }
        };
        if order.is_empty() {
            return Ok(surface.is_none());
        }

        // Viewports count from the bottom edge; wgpu's from the top
        let vp = self.viewport;
        let top = height as i64 - (vp.y as i64 + vp.height as i64);
        let clip_x0 = (vp.x as i64).clamp(0, width as i64);
        let clip_x1 = (vp.x as i64 + vp.width as i64).clamp(0, width as i64);
        let clip_y0 = top.clamp(0, height as i64);
        let clip_y1 = (top + vp.height as i64).clamp(0, height as i64);
        if clip_x0 >= clip_x1 || clip_y0 >= clip_y1 {
            trace!(program = %program.name, ?vp, "Viewport lies outside the target");
            return Ok(surface.is_none());
        }

        let vertex_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("picam_vertices"),
                contents: &contents,
                usage: wgpu::BufferUsages::VERTEX,
            });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("picam_draw_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("picam_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                ..Default::default()
            });
            pass.set_pipeline(pipeline);
            if let Some(bind_group) = &bind_group {
                pass.set_bind_group(0, bind_group, &[]);
            }
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            pass.set_viewport(
                vp.x as f32,
                top as f32,
                vp.width as f32,
                vp.height as f32,
                0.0,
                1.0,
            );
            pass.set_scissor_rect(
                clip_x0 as u32,
                clip_y0 as u32,
                (clip_x1 - clip_x0) as u32,
                (clip_y1 - clip_y0) as u32,
            );
            pass.draw(0..order.len() as u32, 0..1);
        }
        ctx.queue.submit(Some(encoder.finish()));
        trace!(program = %program.name, ?primitive, vertices = order.len(), "Draw");
        Ok(surface.is_none())
    }
}

impl GpuDevice for WgpuDevice {
    fn create_native_window(&mut self, viewport: Viewport) -> GpuResult<()> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(GpuError::Context(format!(
                "invalid window size {}x{}",
                viewport.width, viewport.height
            )));
        }
        self.window = Some(viewport);
        self.viewport = Viewport::new(0, 0, viewport.width, viewport.height);
        debug!(
            x = viewport.x,
            y = viewport.y,
            width = viewport.width,
            height = viewport.height,
            "Created offscreen window"
        );
        Ok(())
    }

    fn destroy_native_window(&mut self) {
        if self.window.take().is_some() {
            debug!("Destroyed offscreen window");
        }
    }

    fn init_context(&mut self, config: &EglConfig) -> GpuResult<()> {
        let (width, height) = self.window_size()?;
        if config.red_size > 8 || config.green_size > 8 || config.blue_size > 8 || config.alpha_size > 8 {
            return Err(GpuError::Context(format!("no framebuffer format matches {:?}", config)));
        }

        let (device, queue, adapter) =
            pollster::block_on(create_render_device("picam_preview")).map_err(GpuError::Context)?;

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("picam_texture_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("picam_nearest_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let window = scoped(&device, "window target", || {
            Ok(device.create_texture(&wgpu::TextureDescriptor {
                label: Some("picam_window"),
                size: extent(width, height),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TARGET_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            }))
        })?;
        let window_view = window.create_view(&wgpu::TextureViewDescriptor::default());

        info!(
            adapter = %adapter.name,
            backend = ?adapter.backend,
            width,
            height,
            ?config,
            "GPU context created"
        );
        self.context = Some(Context {
            device,
            queue,
            texture_layout,
            sampler,
            window,
            window_view,
        });
        Ok(())
    }

    fn terminate_context(&mut self) {
        if self.context.is_none() {
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
        if let Some(ctx) = self.context.take() {
            let _ = wait_idle(&ctx.device);
        }
        debug!("GPU context terminated");
    }

    fn build_program(&mut self, source: &ShaderProgramSource) -> GpuResult<ProgramId> {
        let ctx = self.context("build_program")?;
        shaders::validate(source).map_err(|log| GpuError::ShaderCompile {
            program: source.name.to_string(),
            log,
        })?;

        let program = scoped(&ctx.device, source.name, || {
            let module = ctx
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&format!("{}_shader", source.name)),
                    source: wgpu::ShaderSource::Wgsl(source.source.into()),
                });
            let triangles =
                Self::create_pipeline(ctx, source, &module, wgpu::PrimitiveTopology::TriangleList);
            let lines = (source.sampler == SamplerKind::None).then(|| {
                Self::create_pipeline(ctx, source, &module, wgpu::PrimitiveTopology::LineStrip)
            });
            Ok(Program {
                name: source.name.to_string(),
                sampler: source.sampler,
                triangles,
                lines,
            })
        })
        .map_err(|e| GpuError::ShaderCompile {
            program: source.name.to_string(),
            log: e.to_string(),
        })?;

        let id = self.next(ProgramId);
        debug!(program = source.name, id = id.0, "Built render pipeline");
        self.programs.insert(id, program);
        self.stats.program_built();
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.stats.program_deleted();
        }
    }

    fn gen_texture(&mut self) -> GpuResult<TextureId> {
        self.context("gen_texture")?;
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
        let ctx = self.context("create_external_image")?;
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
        let rgba = match plane {
            ImagePlane::Rgb => yuv::i420_to_rgba(&planes, geometry),
            ImagePlane::Y => yuv::plane_to_rgba(planes.y, width, height),
            ImagePlane::U => yuv::plane_to_rgba(planes.u, width, height),
            ImagePlane::V => yuv::plane_to_rgba(planes.v, width, height),
        };
        drop(frame);

        let texture = scoped(&ctx.device, "external image", || {
            let texture = ctx.create_texture(
                "picam_external_image",
                width,
                height,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            );
            ctx.upload(&texture, width, height, &rgba);
            Ok(texture)
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.next(ImageId);
        self.images.insert(
            id,
            Image::External {
                view,
                _texture: texture,
                _gpu_ref: buffer.gpu_ref(),
            },
        );
        self.stats.image_created();
        trace!(handle = buffer.handle(), plane = plane.name(), image = id.0, "Uploaded external image");
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        if self.images.remove(&image).is_some() {
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
        let ctx = self.context("create_shared_surface")?;
        // Shared-memory surfaces must have power-of-two dimensions
        if !width.is_power_of_two() || !height.is_power_of_two() {
            return Err(GpuError::InvalidOperation(format!(
                "shared surface {}x{} is not a power of two",
                width, height
            )));
        }
        let texture = scoped(&ctx.device, "shared surface", || {
            Ok(ctx.create_texture(
                "picam_shared_surface",
                width,
                height,
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
            ))
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let surface = self.next(SurfaceId);
        self.surfaces.insert(
            surface,
            Surface {
                width,
                height,
                texture,
                view,
            },
        );
        let image = self.next(ImageId);
        self.images.insert(image, Image::Surface(surface));
        self.stats.image_created();
        debug!(surface = surface.0, width, height, "Created shared surface");
        Ok((surface, image))
    }

    fn destroy_shared_surface(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(&surface).is_some() {
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
        let ctx = self.context("with_locked_surface")?;
        let entry = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| GpuError::InvalidHandle(format!("surface {}", surface.0)))?;

        let mut pixels = ctx.read_back(&entry.texture, entry.width, entry.height)?;
        access(SurfaceView {
            width: entry.width,
            height: entry.height,
            stride: entry.width as usize * 4,
            pixels: &mut pixels,
        });
        scoped(&ctx.device, "surface unlock", || {
            ctx.upload(&entry.texture, entry.width, entry.height, &pixels);
            Ok(())
        })?;
        self.stats.surface_locked();
        Ok(())
    }

    fn create_framebuffer(&mut self, texture: TextureId) -> GpuResult<FramebufferId> {
        self.context("create_framebuffer")?;
        let binding = self
            .textures
            .get(&texture)
            .ok_or_else(|| GpuError::InvalidHandle(format!("texture {}", texture.0)))?
            .binding;
        if !matches!(
            binding.and_then(|(_, image)| self.images.get(&image)),
            Some(Image::Surface(_))
        ) {
            return Err(GpuError::InvalidOperation(format!(
                "texture {} cannot be a colour attachment",
                texture.0
            )));
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
        let [r, g, b, a] = rgba.map(|c| f64::from(c.clamp(0.0, 1.0)));
        self.clear_rgba = wgpu::Color { r, g, b, a };
    }

    fn clear(&mut self) -> GpuResult<()> {
        let ctx = self.context("clear")?;
        let (_, view, _, _) = self.target(ctx)?;
        scoped(&ctx.device, "clear", || {
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("picam_clear_encoder"),
                });
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("picam_clear_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(self.clear_rgba),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                ..Default::default()
            });
            ctx.queue.submit(Some(encoder.finish()));
            Ok(())
        })
    }

    fn draw(
        &mut self,
        program: ProgramId,
        primitive: Primitive,
        vertices: &[[f32; 2]],
        fill: &Fill,
    ) -> GpuResult<()> {
        let ctx = self.context("draw")?;
        let prog = self
            .programs
            .get(&program)
            .ok_or_else(|| GpuError::InvalidHandle(format!("program {}", program.0)))?;

        let to_window = scoped(&ctx.device, &prog.name, || {
            self.encode_draw(ctx, prog, primitive, vertices, fill)
        })?;

        let window_loop = primitive == Primitive::LineLoop && to_window;
        self.stats.drew(window_loop.then_some(vertices));
        Ok(())
    }

    fn finish(&mut self) -> GpuResult<()> {
        let ctx = self.context("finish")?;
        wait_idle(&ctx.device)
    }

    fn read_pixels(&mut self) -> GpuResult<RgbaFrame> {
        let ctx = self.context("read_pixels")?;
        let (width, height) = self.window_size()?;
        let pixels = ctx.read_back(&ctx.window, width, height)?;
        Ok(RgbaFrame {
            width,
            height,
            pixels,
        })
    }

    fn swap_buffers(&mut self) -> GpuResult<()> {
        let frame = self.read_pixels()?;
        self.presenter.present(FrameView {
            width: frame.width,
            height: frame.height,
            pixels: &frame.pixels,
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

    /// A device with a window and context, or `None` on machines without an adapter
    fn gpu_with_window(width: u32, height: u32) -> Option<WgpuDevice> {
        let mut gpu = WgpuDevice::new(Box::new(HeadlessPresenter::new()));
        gpu.create_native_window(Viewport::new(0, 0, width, height))
            .unwrap();
        match gpu.init_context(&EglConfig::default()) {
            Ok(()) => Some(gpu),
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
                None
            }
        }
    }

    #[test]
    fn test_context_needs_a_window() {
        let mut gpu = WgpuDevice::new(Box::new(HeadlessPresenter::new()));
        assert!(matches!(
            gpu.init_context(&EglConfig::default()),
            Err(GpuError::Context(_))
        ));
        assert!(matches!(
            gpu.gen_texture(),
            Err(GpuError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_clear_reads_back_unpadded_rows() {
        // 5 * 4 bytes per row needs padding to the copy alignment
        let Some(mut gpu) = gpu_with_window(5, 3) else {
            return;
        };
        gpu.clear_color([1.0, 0.0, 0.0, 1.0]);
        gpu.clear().unwrap();
        let frame = gpu.read_pixels().unwrap();
        assert_eq!((frame.width, frame.height), (5, 3));
        assert_eq!(frame.pixels.len(), 5 * 3 * 4);
        assert!(frame.pixels.chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
    }

    #[test]
    fn test_build_program_reports_compile_errors() {
        let Some(mut gpu) = gpu_with_window(4, 4) else {
            return;
        };
        let broken = ShaderProgramSource {
            source: "fn vs_main( {",
            ..QUAD_TEXTURE_2D
        };
        let err = gpu.build_program(&broken).unwrap_err();
        assert!(matches!(err, GpuError::ShaderCompile { ref program, .. } if program == "quad_2d"));
        assert_eq!(gpu.stats().live_programs(), 0);
    }

    #[test]
    fn test_external_plane_upload_holds_buffer_reference() {
        let Some(mut gpu) = gpu_with_window(4, 4) else {
            return;
        };
        let program = gpu.build_program(&QUAD_EXTERNAL).unwrap();
        let geometry = FrameGeometry::new(4, 4);
        let pool = BufferPool::create(1, geometry.i420_size()).unwrap();
        let mut buf = pool.acquire_empty().unwrap();
        buf.fill(geometry, 0, |bytes| bytes.fill(255)).unwrap();

        let client = buf.data().unwrap().clone();
        let texture = gpu.gen_texture().unwrap();
        let image = gpu.create_external_image(&client, ImagePlane::Y).unwrap();
        gpu.bind_image(texture, TextureTarget::External, image).unwrap();
        assert_eq!(client.gpu_ref_count(), 1);

        gpu.draw(program, Primitive::Triangles, &QUAD_VERTICES, &Fill::Texture(texture))
            .unwrap();
        let frame = gpu.read_pixels().unwrap();
        assert!(frame.pixels.chunks_exact(4).all(|px| px == [255, 255, 255, 255]));

        gpu.destroy_image(image);
        assert_eq!(client.gpu_ref_count(), 0);
        assert_eq!(gpu.stats().live_images(), 0);
        gpu.terminate_context();
        buf.release();
    }

    #[test]
    fn test_sampler_must_match_texture_target() {
        let Some(mut gpu) = gpu_with_window(4, 4) else {
            return;
        };
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
        let Some(mut gpu) = gpu_with_window(4, 4) else {
            return;
        };
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
        // Sampling the surface while rendering into it is refused
        assert!(matches!(
            gpu.draw(quad, Primitive::Triangles, &QUAD_VERTICES, &Fill::Texture(fb_texture)),
            Err(GpuError::InvalidOperation(_))
        ));

        let mut seen = 0u8;
        gpu.with_locked_surface(surface, &mut |mut view: SurfaceView<'_>| {
            seen = view.pixels[0];
            view.pixels[..4].copy_from_slice(&[0, 0, 255, 255]);
        })
        .unwrap();
        assert_eq!(seen, 255);
        assert_eq!(gpu.stats().surface_locks(), 1);

        gpu.bind_framebuffer(None).unwrap();
        gpu.draw(quad, Primitive::Triangles, &QUAD_VERTICES, &Fill::Texture(fb_texture))
            .unwrap();
        let frame = gpu.read_pixels().unwrap();
        assert_eq!(&frame.pixels[..4], &[0, 0, 255, 255]);
        assert_eq!(&frame.pixels[4..8], &[255, 255, 255, 255]);

        gpu.terminate_context();
        assert_eq!(gpu.stats().live_images(), 0);
        assert_eq!(gpu.stats().live_programs(), 0);
        buf.release();
    }

    #[test]
    fn test_line_loop_presented_on_swap() {
        let presenter = HeadlessPresenter::new();
        let presented = presenter.stats();
        let mut gpu = WgpuDevice::new(Box::new(presenter));
        gpu.create_native_window(Viewport::new(0, 0, 8, 8)).unwrap();
        if let Err(e) = gpu.init_context(&EglConfig::default()) {
            println!("Skipping test (no GPU): {}", e);
            return;
        }

        let line = gpu.build_program(&OVERLAY_LINE).unwrap();
        let vertices = [[-0.5, -0.5], [-0.5, 0.5], [0.5, 0.5], [0.5, -0.5]];
        gpu.clear().unwrap();
        gpu.draw(line, Primitive::LineLoop, &vertices, &Fill::Color([255, 0, 0, 255]))
            .unwrap();
        assert!(gpu.stats().last_frame_line_loops().is_empty());

        gpu.swap_buffers().unwrap();
        assert_eq!(gpu.stats().last_frame_line_loops(), vec![vertices.to_vec()]);
        assert_eq!(presented.frames(), 1);
        let frame = presented.last_frame().unwrap();
        assert!(frame.pixels.chunks_exact(4).any(|px| px == [255, 0, 0, 255]));
        // The centre stays clear
        let centre = ((4 * 8 + 4) * 4) as usize;
        assert_eq!(&frame.pixels[centre..centre + 4], &[0, 0, 0, 255]);
    }
}
