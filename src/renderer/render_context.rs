use crate::gpu::{BufferId, BufferKind, IndexFormat, RenderTarget, SharedGpu, Topology};
use crate::renderer::ShaderProgram;

/// Geometry half of a draw: which indices to read and how to assemble them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedDraw {
    pub index_buffer: BufferId,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub topology: Topology,
}

/// Something that owns geometry buffers and can draw them with a program
/// the caller has already made current.
pub trait RenderContext {
    fn buffers(&self) -> &BufferPair;

    /// Draws into `target` using the uniforms, attributes and textures that
    /// `program` currently holds. Call [`ShaderProgram::use_program`] first.
    fn render(&self, program: &ShaderProgram, target: RenderTarget);
}

/// One vertex buffer and one index buffer, created together and released
/// together.
pub struct BufferPair {
    gpu: SharedGpu,
    vertex: BufferId,
    index: BufferId,
}

impl BufferPair {
    pub fn new(gpu: &SharedGpu) -> Self {
        Self {
            gpu: SharedGpu::clone(gpu),
            vertex: gpu.create_buffer(BufferKind::Vertex),
            index: gpu.create_buffer(BufferKind::Index),
        }
    }

    pub fn vertex(&self) -> BufferId {
        self.vertex
    }

    pub fn index(&self) -> BufferId {
        self.index
    }

    pub fn gpu(&self) -> &SharedGpu {
        &self.gpu
    }
}

impl Drop for BufferPair {
    fn drop(&mut self) {
        self.gpu.destroy_buffer(self.vertex);
        self.gpu.destroy_buffer(self.index);
    }
}
