//! A device without an adapter.
//!
//! Shaders are compiled and reflected for real (through naga), resource
//! lifetimes are tracked, and every request is appended to a command log.
//! Nothing is rasterised. Useful for tests and for validating assets and
//! shaders on machines without a GPU.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use super::reflect::{self, ProgramLog, ProgramReflection};
use super::{
    check_framebuffer, mip_chain_len, mip_extent, BufferId, BufferKind, ColorAttachmentInfo, DrawCall,
    FramebufferId, FramebufferStatus, GpuDevice, IndexFormat, ProgramId, RenderTarget,
    RenderbufferId, TextureBinding, TextureDesc, TextureId, Topology, UniformLocation,
    VertexAttribute,
};

const DEFAULT_MAX_DIMENSION: u32 = 8192;

/// One recorded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateProgram { program: ProgramId, label: String },
    DestroyProgram(ProgramId),
    UniformQuery { program: ProgramId, name: String },
    AttribQuery { program: ProgramId, name: String },
    CreateTexture(TextureId),
    AllocateTexture { texture: TextureId, width: u32, height: u32, levels: u32 },
    WriteTexture { texture: TextureId, level: u32, len: usize },
    DestroyTexture(TextureId),
    CreateBuffer { buffer: BufferId, kind: BufferKind },
    AllocateBuffer { buffer: BufferId, size: u64 },
    WriteBuffer { buffer: BufferId, offset: u64, len: usize },
    DestroyBuffer(BufferId),
    CreateRenderbuffer { renderbuffer: RenderbufferId, width: u32, height: u32 },
    DestroyRenderbuffer(RenderbufferId),
    CreateFramebuffer { framebuffer: FramebufferId, color: TextureId, level: u32 },
    DestroyFramebuffer(FramebufferId),
    Clear(RenderTarget),
    Draw(RecordedDraw),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDraw {
    pub target: RenderTarget,
    pub program: ProgramId,
    pub uniforms: Vec<u8>,
    pub textures: Vec<TextureBinding>,
    pub attributes: Vec<VertexAttribute>,
    pub index_buffer: BufferId,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub topology: Topology,
}

struct ProgramRecord {
    log: ProgramLog,
    reflection: Option<ProgramReflection>,
}

#[derive(Debug, Clone)]
struct TextureRecord {
    desc: Option<TextureDesc>,
}

struct BufferRecord {
    data: Option<Vec<u8>>,
}

struct FramebufferRecord {
    color: TextureId,
    level: u32,
    depth: RenderbufferId,
}

#[derive(Default)]
struct HeadlessState {
    programs: HashMap<ProgramId, ProgramRecord>,
    textures: BTreeMap<TextureId, TextureRecord>,
    buffers: BTreeMap<BufferId, BufferRecord>,
    renderbuffers: BTreeMap<RenderbufferId, (u32, u32)>,
    framebuffers: BTreeMap<FramebufferId, FramebufferRecord>,
    commands: Vec<Command>,
}

pub struct HeadlessDevice {
    next_id: Cell<u32>,
    max_dimension: u32,
    max_texture_dimension: u32,
    state: RefCell<HeadlessState>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_max_dimension(DEFAULT_MAX_DIMENSION)
    }

    /// Renderbuffers larger than `max_dimension` cannot be backed, which
    /// makes any framebuffer using them incomplete.
    pub fn with_max_dimension(max_dimension: u32) -> Self {
        Self {
            next_id: Cell::new(1),
            max_dimension,
            max_texture_dimension: DEFAULT_MAX_DIMENSION,
            state: RefCell::new(HeadlessState::default()),
        }
    }

    /// Caps texture extents, independently of the renderbuffer limit.
    pub fn with_max_texture_dimension(mut self, max_texture_dimension: u32) -> Self {
        self.max_texture_dimension = max_texture_dimension;
        self
    }

    fn next(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn record(&self, command: Command) {
        self.state.borrow_mut().commands.push(command);
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    pub fn draws(&self) -> Vec<RecordedDraw> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter_map(|command| match command {
                Command::Draw(draw) => Some(draw.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_textures(&self) -> Vec<TextureId> {
        self.state.borrow().textures.keys().copied().collect()
    }

    pub fn is_texture_live(&self, texture: TextureId) -> bool {
        self.state.borrow().textures.contains_key(&texture)
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        self.state
            .borrow()
            .textures
            .get(&texture)
            .and_then(|record| record.desc.clone())
    }

    pub fn live_buffers(&self) -> Vec<BufferId> {
        self.state.borrow().buffers.keys().copied().collect()
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .buffers
            .get(&buffer)
            .and_then(|record| record.data.clone())
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn live_renderbuffers(&self) -> usize {
        self.state.borrow().renderbuffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.borrow().programs.len()
    }

    fn color_info(state: &HeadlessState, texture: TextureId) -> Option<ColorAttachmentInfo> {
        let desc = state.textures.get(&texture)?.desc.as_ref()?;
        Some(ColorAttachmentInfo {
            width: desc.width,
            height: desc.height,
            levels: desc.levels,
            format: desc.format,
            render_target: desc.render_target,
        })
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_program(&self, label: &str, vertex: &str, fragment: &str) -> ProgramId {
        let program = ProgramId::new(self.next());
        let output = reflect::link(vertex, fragment);
        let mut state = self.state.borrow_mut();
        state.programs.insert(
            program,
            ProgramRecord {
                log: output.log,
                reflection: output.reflection,
            },
        );
        state.commands.push(Command::CreateProgram {
            program,
            label: label.to_string(),
        });
        program
    }

    fn program_log(&self, program: ProgramId) -> ProgramLog {
        self.state
            .borrow()
            .programs
            .get(&program)
            .map(|record| record.log.clone())
            .unwrap_or_default()
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        self.record(Command::UniformQuery {
            program,
            name: name.to_string(),
        });
        let state = self.state.borrow();
        let location = state.programs.get(&program)?.reflection.as_ref()?.uniform(name);
        location
    }

    fn attrib_location(&self, program: ProgramId, name: &str) -> Option<u32> {
        self.record(Command::AttribQuery {
            program,
            name: name.to_string(),
        });
        let state = self.state.borrow();
        let reflection = state.programs.get(&program)?.reflection.as_ref()?;
        let location = reflection.attribute(name).map(|info| info.location);
        location
    }

    fn uniform_block_size(&self, program: ProgramId) -> usize {
        self.state
            .borrow()
            .programs
            .get(&program)
            .and_then(|record| record.reflection.as_ref())
            .map(ProgramReflection::block_size)
            .unwrap_or(0)
    }

    fn destroy_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        if state.programs.remove(&program).is_some() {
            state.commands.push(Command::DestroyProgram(program));
        }
    }

    fn max_texture_dimension(&self) -> u32 {
        self.max_texture_dimension
    }

    fn create_texture(&self) -> TextureId {
        let texture = TextureId::new(self.next());
        let mut state = self.state.borrow_mut();
        state.textures.insert(texture, TextureRecord { desc: None });
        state.commands.push(Command::CreateTexture(texture));
        texture
    }

    fn allocate_texture(&self, texture: TextureId, desc: &TextureDesc) {
        let mut state = self.state.borrow_mut();
        let Some(record) = state.textures.get_mut(&texture) else {
            log::warn!("allocate_texture on unknown texture {:?}", texture);
            return;
        };
        let mut stored = desc.clone();
        stored.width = desc.width.clamp(1, self.max_texture_dimension);
        stored.height = desc.height.clamp(1, self.max_texture_dimension);
        stored.levels = desc.levels.clamp(1, mip_chain_len(stored.width, stored.height));
        let command = Command::AllocateTexture {
            texture,
            width: stored.width,
            height: stored.height,
            levels: stored.levels,
        };
        record.desc = Some(stored);
        state.commands.push(command);
    }

    fn write_texture(&self, texture: TextureId, level: u32, data: &[u8]) {
        self.record(Command::WriteTexture {
            texture,
            level,
            len: data.len(),
        });
    }

    fn texture_size(&self, texture: TextureId, level: u32) -> Option<(u32, u32)> {
        let state = self.state.borrow();
        let desc = state.textures.get(&texture)?.desc.as_ref()?;
        (level < desc.levels).then(|| mip_extent(desc.width, desc.height, level))
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut state = self.state.borrow_mut();
        if state.textures.remove(&texture).is_some() {
            state.commands.push(Command::DestroyTexture(texture));
        }
    }

    fn create_buffer(&self, kind: BufferKind) -> BufferId {
        let buffer = BufferId::new(self.next());
        let mut state = self.state.borrow_mut();
        state.buffers.insert(buffer, BufferRecord { data: None });
        state.commands.push(Command::CreateBuffer { buffer, kind });
        buffer
    }

    fn allocate_buffer(&self, buffer: BufferId, size: u64) {
        let mut state = self.state.borrow_mut();
        let Some(record) = state.buffers.get_mut(&buffer) else {
            log::warn!("allocate_buffer on unknown buffer {:?}", buffer);
            return;
        };
        record.data = Some(vec![0; size as usize]);
        state.commands.push(Command::AllocateBuffer { buffer, size });
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        let Some(storage) = state
            .buffers
            .get_mut(&buffer)
            .and_then(|record| record.data.as_mut())
        else {
            log::warn!("write_buffer on unallocated buffer {:?}", buffer);
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            log::warn!(
                "write of {} bytes at {} overflows buffer {:?} ({} bytes)",
                data.len(),
                offset,
                buffer,
                storage.len()
            );
            return;
        }
        storage[start..end].copy_from_slice(data);
        state.commands.push(Command::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state.borrow_mut();
        if state.buffers.remove(&buffer).is_some() {
            state.commands.push(Command::DestroyBuffer(buffer));
        }
    }

    fn create_renderbuffer(&self, width: u32, height: u32) -> RenderbufferId {
        let renderbuffer = RenderbufferId::new(self.next());
        let mut state = self.state.borrow_mut();
        state.renderbuffers.insert(renderbuffer, (width, height));
        state.commands.push(Command::CreateRenderbuffer {
            renderbuffer,
            width,
            height,
        });
        renderbuffer
    }

    fn destroy_renderbuffer(&self, renderbuffer: RenderbufferId) {
        let mut state = self.state.borrow_mut();
        if state.renderbuffers.remove(&renderbuffer).is_some() {
            state.commands.push(Command::DestroyRenderbuffer(renderbuffer));
        }
    }

    fn create_framebuffer(
        &self,
        color: TextureId,
        level: u32,
        depth: RenderbufferId,
    ) -> FramebufferId {
        let framebuffer = FramebufferId::new(self.next());
        let mut state = self.state.borrow_mut();
        state.framebuffers.insert(
            framebuffer,
            FramebufferRecord {
                color,
                level,
                depth,
            },
        );
        state.commands.push(Command::CreateFramebuffer {
            framebuffer,
            color,
            level,
        });
        framebuffer
    }

    fn framebuffer_status(&self, framebuffer: FramebufferId) -> FramebufferStatus {
        let state = self.state.borrow();
        let Some(record) = state.framebuffers.get(&framebuffer) else {
            return FramebufferStatus::MissingAttachment;
        };
        check_framebuffer(
            Self::color_info(&state, record.color),
            record.level,
            state.renderbuffers.get(&record.depth).copied(),
            self.max_dimension,
        )
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        let mut state = self.state.borrow_mut();
        if state.framebuffers.remove(&framebuffer).is_some() {
            state.commands.push(Command::DestroyFramebuffer(framebuffer));
        }
    }

    fn clear(&self, target: RenderTarget, _color: [f32; 4]) {
        self.record(Command::Clear(target));
    }

    fn draw(&self, target: RenderTarget, call: &DrawCall<'_>) {
        let linked = self
            .state
            .borrow()
            .programs
            .get(&call.program)
            .is_some_and(|record| record.log.linked);
        if !linked {
            log::warn!("Skipping draw with unlinked program {:?}", call.program);
            return;
        }
        self.record(Command::Draw(RecordedDraw {
            target,
            program: call.program,
            uniforms: call.uniforms.to_vec(),
            textures: call.textures.to_vec(),
            attributes: call.attributes.to_vec(),
            index_buffer: call.index_buffer,
            index_format: call.index_format,
            index_count: call.index_count,
            topology: call.topology,
        }));
    }
}
