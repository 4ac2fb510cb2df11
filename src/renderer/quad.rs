use crate::gpu::{ComponentType, IndexFormat, RenderTarget, SharedGpu, Topology};
use crate::renderer::{BufferPair, IndexedDraw, RenderContext, ShaderProgram};

const QUAD_VERTICES: [f32; 8] = [
    -1.0, -1.0, //
    1.0, -1.0, //
    1.0, 1.0, //
    -1.0, 1.0,
];

const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// Full-screen quad used by every convolution and display pass.
pub struct QuadRenderContext {
    buffers: BufferPair,
}

impl QuadRenderContext {
    /// Uploads the quad and wires `aPosition` of `program` to it.
    pub fn new(gpu: &SharedGpu, program: &mut ShaderProgram) -> Self {
        let buffers = BufferPair::new(gpu);

        let vertices: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        gpu.allocate_buffer(buffers.vertex(), vertices.len() as u64);
        gpu.write_buffer(buffers.vertex(), 0, vertices);

        let indices: &[u8] = bytemuck::cast_slice(&QUAD_INDICES);
        gpu.allocate_buffer(buffers.index(), indices.len() as u64);
        gpu.write_buffer(buffers.index(), 0, indices);

        let quad = Self { buffers };
        quad.attach(program);
        quad
    }

    /// Points `aPosition` of another program at this quad.
    pub fn attach(&self, program: &mut ShaderProgram) {
        program.vertex_attrib_pointer(
            "aPosition",
            self.buffers.vertex(),
            2,
            ComponentType::F32,
            false,
            0,
            0,
        );
    }

    fn geometry(&self) -> IndexedDraw {
        IndexedDraw {
            index_buffer: self.buffers.index(),
            index_format: IndexFormat::Uint32,
            index_count: QUAD_INDICES.len() as u32,
            topology: Topology::Triangles,
        }
    }
}

impl RenderContext for QuadRenderContext {
    fn buffers(&self) -> &BufferPair {
        &self.buffers
    }

    fn render(&self, program: &ShaderProgram, target: RenderTarget) {
        program.draw(target, &self.geometry(), &[]);
    }
}
