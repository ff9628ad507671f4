// SPDX-License-Identifier: GPL-3.0-only

//! GPU boundary for the preview renderer
//!
//! [`GpuDevice`] is the EGL/GLES-shaped interface the render worker and the scenes
//! talk to: native window and context lifetime, shader programs, textures
//! bound to external images imported from camera buffers, framebuffers,
//! shared-memory surfaces and presentation. The device is moved into the
//! render worker and only ever used from that thread.
//!
//! [`WgpuDevice`] renders on the GPU into an offscreen target and presents
//! by reading it back. [`SoftwareGpu`] is a CPU test double with the same
//! object model, for tests that must run without an adapter.

pub mod present;
pub mod raster;
pub mod software;
pub mod stats;
pub mod wgpu_device;

pub use present::{FrameView, HeadlessPresenter, Presenter, PresenterStats, TerminalPresenter};
pub use software::SoftwareGpu;
pub use stats::GpuStats;
pub use wgpu_device::WgpuDevice;

use crate::backends::camera::ClientBuffer;
use crate::shaders::ShaderProgramSource;
use std::fmt;

/// Result type for GPU operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Errors raised by a GPU device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// GPU memory could not be allocated
    OutOfMemory(String),
    /// A shader failed to compile or the program failed to link
    ShaderCompile { program: String, log: String },
    /// An object id does not name a live object
    InvalidHandle(String),
    /// The call is not valid in the current state
    InvalidOperation(String),
    /// Native window, display or context failure
    Context(String),
    /// Presenting the back buffer failed
    Present(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::OutOfMemory(msg) => write!(f, "GPU out of memory: {}", msg),
            GpuError::ShaderCompile { program, log } => {
                write!(f, "Shader program '{}' failed: {}", program, log)
            }
            GpuError::InvalidHandle(msg) => write!(f, "Invalid GPU handle: {}", msg),
            GpuError::InvalidOperation(msg) => write!(f, "Invalid GPU operation: {}", msg),
            GpuError::Context(msg) => write!(f, "GPU context error: {}", msg),
            GpuError::Present(msg) => write!(f, "Present failed: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {}

macro_rules! gpu_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(&self) -> u32 {
                self.0
            }
        }
    };
}

gpu_id!(
    /// A linked shader program
    ProgramId
);
gpu_id!(
    /// A texture name
    TextureId
);
gpu_id!(
    /// An EGL image
    ImageId
);
gpu_id!(
    /// A framebuffer object
    FramebufferId
);
gpu_id!(
    /// A CPU-lockable shared-memory surface
    SurfaceId
);

/// Which view of a camera buffer an external image exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImagePlane {
    /// The whole frame converted to RGB
    Rgb,
    /// Luma plane
    Y,
    /// Blue-difference chroma plane
    U,
    /// Red-difference chroma plane
    V,
}

impl ImagePlane {
    pub const ALL: [ImagePlane; 4] = [ImagePlane::Rgb, ImagePlane::Y, ImagePlane::U, ImagePlane::V];

    pub fn name(&self) -> &'static str {
        match self {
            ImagePlane::Rgb => "RGB",
            ImagePlane::Y => "Y",
            ImagePlane::U => "U",
            ImagePlane::V => "V",
        }
    }
}

/// Texture binding target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureTarget {
    /// An imported camera plane (`GL_TEXTURE_EXTERNAL_OES` on GLES)
    External,
    /// A render texture (`GL_TEXTURE_2D` on GLES)
    Texture2D,
}

/// Primitive assembly for a draw call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Triangles,
    LineLoop,
}

/// Fragment input of a draw call
#[derive(Debug, Clone, PartialEq)]
pub enum Fill {
    /// Sample a texture through the quad mapping `texcoord = (vertex + 1) / 2`
    Texture(TextureId),
    /// Constant colour
    Color([u8; 4]),
    /// One colour per vertex, interpolated along the primitive
    VertexColors(Vec<[u8; 4]>),
}

/// EGL framebuffer configuration requested by a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EglConfig {
    pub red_size: u8,
    pub green_size: u8,
    pub blue_size: u8,
    pub alpha_size: u8,
    pub depth_size: u8,
}

impl Default for EglConfig {
    fn default() -> Self {
        Self {
            red_size: 8,
            green_size: 8,
            blue_size: 8,
            alpha_size: 8,
            depth_size: 0,
        }
    }
}

/// Rectangle in window pixels, origin bottom-left as GL viewports use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// CPU view of a locked shared surface
///
/// Pixels are RGBA, rows top to bottom, `stride` bytes apart.
pub struct SurfaceView<'a> {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub pixels: &'a mut [u8],
}

/// An RGBA frame read back from the GPU, rows top to bottom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// The EGL/GLES operations the preview renderer needs
pub trait GpuDevice: Send {
    /// Create the native window the context renders into
    fn create_native_window(&mut self, viewport: Viewport) -> GpuResult<()>;

    fn destroy_native_window(&mut self);

    /// Create the display, surface and context for `config`
    fn init_context(&mut self, config: &EglConfig) -> GpuResult<()>;

    /// Tear down the context and every object created in it
    fn terminate_context(&mut self);

    /// Validate a program and build its pipelines
    fn build_program(&mut self, source: &ShaderProgramSource) -> GpuResult<ProgramId>;

    fn delete_program(&mut self, program: ProgramId);

    fn gen_texture(&mut self) -> GpuResult<TextureId>;

    fn delete_texture(&mut self, texture: TextureId);

    /// Import one plane of a camera buffer as an EGL image.
    ///
    /// The image references the buffer memory until it is destroyed.
    fn create_external_image(
        &mut self,
        buffer: &ClientBuffer,
        plane: ImagePlane,
    ) -> GpuResult<ImageId>;

    fn destroy_image(&mut self, image: ImageId);

    /// Attach an image to a texture (`glEGLImageTargetTexture2DOES`)
    fn bind_image(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        image: ImageId,
    ) -> GpuResult<()>;

    /// Allocate a CPU-lockable surface and the image that exposes it
    fn create_shared_surface(&mut self, width: u32, height: u32)
    -> GpuResult<(SurfaceId, ImageId)>;

    fn destroy_shared_surface(&mut self, surface: SurfaceId);

    /// Lock the surface for CPU access for the duration of `access`
    fn with_locked_surface(
        &mut self,
        surface: SurfaceId,
        access: &mut dyn FnMut(SurfaceView<'_>),
    ) -> GpuResult<()>;

    /// Create a framebuffer rendering into `texture`
    fn create_framebuffer(&mut self, texture: TextureId) -> GpuResult<FramebufferId>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    /// Select the render target; `None` is the window
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()>;

    fn viewport(&mut self, viewport: Viewport);

    fn clear_color(&mut self, rgba: [f32; 4]);

    /// Clear the whole current render target
    fn clear(&mut self) -> GpuResult<()>;

    fn draw(
        &mut self,
        program: ProgramId,
        primitive: Primitive,
        vertices: &[[f32; 2]],
        fill: &Fill,
    ) -> GpuResult<()>;

    /// Wait for all queued rendering to complete
    fn finish(&mut self) -> GpuResult<()>;

    /// Read the window back buffer as RGBA
    fn read_pixels(&mut self) -> GpuResult<RgbaFrame>;

    /// Present the window back buffer
    fn swap_buffers(&mut self) -> GpuResult<()>;
}
