//! Device seam between the rendering core and a concrete graphics backend.
//!
//! The core talks to the GPU through [`GpuDevice`], a small handle-based
//! interface: every resource is an opaque id, every method takes `&self`, and
//! draws are fully described by a [`DrawCall`]. [`WgpuDevice`] drives a real
//! adapter; [`HeadlessDevice`] compiles shaders with naga and records what was
//! asked of it, which is what the tests run against.

pub mod depth;
pub mod headless;
pub mod reflect;
pub mod surface;
pub mod wgpu_device;

use std::fmt;
use std::rc::Rc;

pub use headless::{Command, HeadlessDevice};
pub use reflect::{ProgramLog, ProgramReflection};
pub use surface::SurfaceContext;
pub use wgpu_device::WgpuDevice;

/// Reference-counted device shared by every object that owns GPU resources.
pub type SharedGpu = Rc<dyn GpuDevice>;

macro_rules! gpu_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);

            impl $name {
                pub(crate) fn new(raw: u32) -> Self {
                    Self(raw)
                }
            }
        )*
    };
}

gpu_id!(
    /// Linked vertex + fragment program.
    ProgramId,
    /// Texture name; storage is defined separately by `allocate_texture`.
    TextureId,
    /// Buffer name; storage is defined separately by `allocate_buffer`.
    BufferId,
    /// Depth attachment for offscreen targets.
    RenderbufferId,
    FramebufferId,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rg8,
    /// Three-channel 8-bit; backends without a native RGB format pad to RGBA.
    Rgb8,
    Rgba8,
    Rg16Float,
    Rgba16Float,
}

impl TextureFormat {
    /// Size of one pixel as the caller uploads it.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
            TextureFormat::Rgb8 => 3,
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rg16Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }

    pub fn is_renderable(self) -> bool {
        matches!(
            self,
            TextureFormat::R8
                | TextureFormat::Rg8
                | TextureFormat::Rgba8
                | TextureFormat::Rg16Float
                | TextureFormat::Rgba16Float
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
}

impl SamplerDesc {
    pub fn clamped() -> Self {
        Self {
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub format: TextureFormat,
    pub sampler: SamplerDesc,
    /// Whether the texture may be attached to a framebuffer.
    pub render_target: bool,
}

impl TextureDesc {
    pub fn new(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            levels: 1,
            format,
            sampler: SamplerDesc::default(),
            render_target: false,
        }
    }

    pub fn with_levels(mut self, levels: u32) -> Self {
        self.levels = levels.max(1);
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn render_target(mut self) -> Self {
        self.render_target = true;
        self
    }
}

/// Size of mip `level` for a base extent; never below one pixel.
pub fn mip_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    let shift = level.min(31);
    ((width >> shift).max(1), (height >> shift).max(1))
}

/// Number of levels in a full mip chain down to 1x1.
pub fn mip_chain_len(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Topology {
    Points,
    Lines,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    I8,
    U8,
    I16,
    U16,
    U32,
    F32,
}

impl ComponentType {
    pub fn size(self) -> u32 {
        match self {
            ComponentType::I8 | ComponentType::U8 => 1,
            ComponentType::I16 | ComponentType::U16 => 2,
            ComponentType::U32 | ComponentType::F32 => 4,
        }
    }
}

/// One enabled vertex attribute: where the shader reads it and how the bytes
/// in `buffer` are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub buffer: BufferId,
    pub components: u32,
    pub component_type: ComponentType,
    pub normalized: bool,
    /// Zero means tightly packed.
    pub stride: u32,
    pub offset: u64,
}

impl VertexAttribute {
    pub fn element_size(&self) -> u32 {
        self.components * self.component_type.size()
    }

    pub fn effective_stride(&self) -> u32 {
        if self.stride == 0 {
            self.element_size()
        } else {
            self.stride
        }
    }
}

/// Where a named uniform lives inside a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformLocation {
    /// Member of the program's uniform block.
    Block { offset: u32, size: u32 },
    /// Texture slot; its sampler sits at `binding + 1` when present.
    Texture { group: u32, binding: u32 },
}

/// A texture bound to a sampler slot for one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    pub unit: u32,
    pub group: u32,
    pub binding: u32,
    pub texture: TextureId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    Screen,
    Framebuffer(FramebufferId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    MissingAttachment,
    IncompleteAttachment,
    IncompleteDimensions,
}

impl FramebufferStatus {
    pub fn is_complete(self) -> bool {
        self == FramebufferStatus::Complete
    }
}

impl fmt::Display for FramebufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FramebufferStatus::Complete => "complete",
            FramebufferStatus::MissingAttachment => "missing attachment",
            FramebufferStatus::IncompleteAttachment => "incomplete attachment",
            FramebufferStatus::IncompleteDimensions => "attachment dimensions differ",
        };
        f.write_str(text)
    }
}

/// Attachment facts a backend knows about a framebuffer's color texture.
#[derive(Debug, Clone, Copy)]
pub struct ColorAttachmentInfo {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub format: TextureFormat,
    pub render_target: bool,
}

/// Completeness rules shared by every backend.
pub fn check_framebuffer(
    color: Option<ColorAttachmentInfo>,
    level: u32,
    depth: Option<(u32, u32)>,
    max_dimension: u32,
) -> FramebufferStatus {
    let (Some(color), Some(depth)) = (color, depth) else {
        return FramebufferStatus::MissingAttachment;
    };
    if !color.render_target || !color.format.is_renderable() || level >= color.levels {
        return FramebufferStatus::IncompleteAttachment;
    }
    let (depth_width, depth_height) = depth;
    if depth_width == 0
        || depth_height == 0
        || depth_width > max_dimension
        || depth_height > max_dimension
    {
        return FramebufferStatus::IncompleteAttachment;
    }
    if mip_extent(color.width, color.height, level) != depth {
        return FramebufferStatus::IncompleteDimensions;
    }
    FramebufferStatus::Complete
}

/// Everything a backend needs to issue one indexed draw.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub uniforms: &'a [u8],
    pub textures: &'a [TextureBinding],
    pub attributes: &'a [VertexAttribute],
    pub index_buffer: BufferId,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub topology: Topology,
}

pub trait GpuDevice {
    /// Compiles and links a program. Always returns an id; inspect
    /// [`GpuDevice::program_log`] to find out whether linking succeeded.
    fn create_program(&self, label: &str, vertex: &str, fragment: &str) -> ProgramId;
    fn program_log(&self, program: ProgramId) -> ProgramLog;
    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation>;
    fn attrib_location(&self, program: ProgramId, name: &str) -> Option<u32>;
    fn uniform_block_size(&self, program: ProgramId) -> usize;
    fn destroy_program(&self, program: ProgramId);

    /// Largest width or height a texture may have.
    fn max_texture_dimension(&self) -> u32;
    fn create_texture(&self) -> TextureId;
    /// Defines (or redefines) the storage behind a texture name. The extent
    /// is clamped to [`GpuDevice::max_texture_dimension`] and the level count
    /// to the mip chain that extent can hold.
    fn allocate_texture(&self, texture: TextureId, desc: &TextureDesc);
    fn write_texture(&self, texture: TextureId, level: u32, data: &[u8]);
    fn texture_size(&self, texture: TextureId, level: u32) -> Option<(u32, u32)>;
    /// Destroying an unknown or already destroyed texture is a no-op.
    fn destroy_texture(&self, texture: TextureId);

    fn create_buffer(&self, kind: BufferKind) -> BufferId;
    fn allocate_buffer(&self, buffer: BufferId, size: u64);
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]);
    fn destroy_buffer(&self, buffer: BufferId);

    fn create_renderbuffer(&self, width: u32, height: u32) -> RenderbufferId;
    fn destroy_renderbuffer(&self, renderbuffer: RenderbufferId);
    fn create_framebuffer(
        &self,
        color: TextureId,
        level: u32,
        depth: RenderbufferId,
    ) -> FramebufferId;
    fn framebuffer_status(&self, framebuffer: FramebufferId) -> FramebufferStatus;
    fn destroy_framebuffer(&self, framebuffer: FramebufferId);

    fn clear(&self, target: RenderTarget, color: [f32; 4]);
    fn draw(&self, target: RenderTarget, call: &DrawCall<'_>);
}
