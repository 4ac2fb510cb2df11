//! [`GpuDevice`] on top of a real wgpu device.
//!
//! Pipelines use wgpu's automatic layouts and are cached per program,
//! vertex layout, target format and topology. Each clear or draw records and
//! submits its own encoder, so uniform writes issued through the queue land
//! before the draw that reads them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::depth::{Depth, DEPTH_FORMAT};
use super::reflect::{
    self, AttributeInfo, InputKind, ProgramLog, ProgramReflection, TextureSlot,
};
use super::{
    check_framebuffer, mip_chain_len, mip_extent, BufferId, BufferKind, ColorAttachmentInfo,
    ComponentType, DrawCall, FilterMode, FramebufferId, FramebufferStatus, GpuDevice, IndexFormat,
    ProgramId, RenderTarget, RenderbufferId, SamplerDesc, TextureBinding, TextureDesc,
    TextureFormat, TextureId, Topology, UniformLocation, VertexAttribute, WrapMode,
};

const ZERO_BUFFER_SIZE: u64 = 16;
const VERTEX_ALIGNMENT: u64 = 4;

struct StageModules {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
}

struct ProgramEntry {
    label: String,
    log: ProgramLog,
    reflection: Option<ProgramReflection>,
    modules: Option<StageModules>,
    uniform_buffer: Option<wgpu::Buffer>,
}

struct TextureStorage {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

struct BufferEntry {
    kind: BufferKind,
    storage: Option<(wgpu::Buffer, u64)>,
}

struct FramebufferEntry {
    color: TextureId,
    level: u32,
    depth: RenderbufferId,
}

struct ScreenTarget {
    view: Option<wgpu::TextureView>,
    depth: Depth,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VertexSlotKey {
    location: u32,
    format: wgpu::VertexFormat,
    stride: u64,
    step_mode: wgpu::VertexStepMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    format: wgpu::TextureFormat,
    topology: Topology,
    index_format: IndexFormat,
    slots: Vec<VertexSlotKey>,
}

impl PipelineKey {
    fn new(call: &DrawCall<'_>, format: wgpu::TextureFormat, slots: Vec<VertexSlotKey>) -> Self {
        Self {
            program: call.program,
            format,
            topology: call.topology,
            index_format: call.index_format,
            slots,
        }
    }
}

struct VertexSlot {
    key: VertexSlotKey,
    buffer: wgpu::Buffer,
    offset: u64,
}

struct ResolvedTarget {
    color: wgpu::TextureView,
    depth: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

#[derive(Default)]
struct WgpuState {
    programs: HashMap<ProgramId, ProgramEntry>,
    textures: HashMap<TextureId, Option<TextureStorage>>,
    buffers: HashMap<BufferId, BufferEntry>,
    renderbuffers: HashMap<RenderbufferId, Depth>,
    framebuffers: HashMap<FramebufferId, FramebufferEntry>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    screen: Option<ScreenTarget>,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_format: wgpu::TextureFormat,
    fallback_view: wgpu::TextureView,
    fallback_sampler: wgpu::Sampler,
    zero_buffer: wgpu::Buffer,
    next_id: Cell<u32>,
    state: RefCell<WgpuState>,
}

impl WgpuDevice {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        surface_format: wgpu::TextureFormat,
    ) -> Self {
        let (fallback_view, fallback_sampler) = create_fallback_texture(&device, &queue);
        let zero_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Zero Attribute Buffer"),
            size: ZERO_BUFFER_SIZE,
            usage: wgpu::BufferUsages::VERTEX,
            mapped_at_creation: false,
        });
        Self {
            device,
            queue,
            surface_format,
            fallback_view,
            fallback_sampler,
            zero_buffer,
            next_id: Cell::new(1),
            state: RefCell::new(WgpuState::default()),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Makes `view` the target of [`RenderTarget::Screen`] until
    /// [`WgpuDevice::end_frame`].
    pub fn begin_frame(&self, view: wgpu::TextureView, width: u32, height: u32) {
        let mut state = self.state.borrow_mut();
        let depth = match state.screen.take() {
            Some(screen) if screen.depth.matches(width, height) => screen.depth,
            _ => Depth::new(&self.device, "Screen Depth", width, height),
        };
        state.screen = Some(ScreenTarget {
            view: Some(view),
            depth,
        });
    }

    /// Releases the swapchain view. The screen depth buffer is kept for the
    /// next frame.
    pub fn end_frame(&self) {
        if let Some(screen) = self.state.borrow_mut().screen.as_mut() {
            screen.view = None;
        }
    }

    fn next(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn resolve_target(&self, state: &WgpuState, target: RenderTarget) -> Option<ResolvedTarget> {
        match target {
            RenderTarget::Screen => {
                let screen = state.screen.as_ref()?;
                Some(ResolvedTarget {
                    color: screen.view.clone()?,
                    depth: screen.depth.view.clone(),
                    format: self.surface_format,
                })
            }
            RenderTarget::Framebuffer(framebuffer) => {
                let entry = state.framebuffers.get(&framebuffer)?;
                let status = check_framebuffer(
                    color_info(state, entry.color),
                    entry.level,
                    state
                        .renderbuffers
                        .get(&entry.depth)
                        .map(|depth| (depth.width, depth.height)),
                    self.max_texture_dimension(),
                );
                if !status.is_complete() {
                    log::warn!("Framebuffer {:?} is {}", framebuffer, status);
                    return None;
                }
                let storage = state.textures.get(&entry.color)?.as_ref()?;
                let depth = state.renderbuffers.get(&entry.depth)?;
                let format = wgpu_texture_format(storage.desc.format);
                let color = storage.texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("Framebuffer Color"),
                    format: Some(format),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    usage: Some(wgpu::TextureUsages::RENDER_ATTACHMENT),
                    aspect: wgpu::TextureAspect::All,
                    base_mip_level: entry.level,
                    mip_level_count: Some(1),
                    base_array_layer: 0,
                    array_layer_count: Some(1),
                });
                Some(ResolvedTarget {
                    color,
                    depth: depth.view.clone(),
                    format,
                })
            }
        }
    }

    /// Pairs each enabled attribute with the shader input it feeds and fills
    /// the inputs nobody provided from a zeroed buffer.
    fn vertex_slots(
        &self,
        state: &WgpuState,
        reflection: &ProgramReflection,
        attributes: &[VertexAttribute],
    ) -> Vec<VertexSlot> {
        let mut slots = Vec::new();
        for (name, input) in reflection.attributes() {
            let resolved = attributes
                .iter()
                .find(|attribute| attribute.location == input.location)
                .and_then(|attribute| {
                    let key = attribute_slot_key(name, input, attribute)?;
                    let (buffer, _) = state.buffers.get(&attribute.buffer)?.storage.as_ref()?;
                    Some(VertexSlot {
                        key,
                        buffer: buffer.clone(),
                        offset: attribute.offset,
                    })
                });
            slots.push(resolved.unwrap_or_else(|| VertexSlot {
                key: zero_slot_key(input),
                buffer: self.zero_buffer.clone(),
                offset: 0,
            }));
        }
        slots.sort_by_key(|slot| slot.key.location);
        slots
    }

    fn create_pipeline(
        &self,
        program: &ProgramEntry,
        modules: &StageModules,
        reflection: &ProgramReflection,
        key: &PipelineKey,
    ) -> wgpu::RenderPipeline {
        let attributes: Vec<[wgpu::VertexAttribute; 1]> = key
            .slots
            .iter()
            .map(|slot| {
                [wgpu::VertexAttribute {
                    format: slot.format,
                    offset: 0,
                    shader_location: slot.location,
                }]
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout> = key
            .slots
            .iter()
            .zip(&attributes)
            .map(|(slot, attributes)| wgpu::VertexBufferLayout {
                array_stride: slot.stride,
                step_mode: slot.step_mode,
                attributes,
            })
            .collect();

        let strip_index_format = matches!(key.topology, Topology::LineStrip | Topology::TriangleStrip)
            .then(|| wgpu_index_format(key.index_format));

        log::debug!("Creating pipeline for program '{}'", program.label);
        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(program.label.as_str()),
                layout: None,
                vertex: wgpu::VertexState {
                    module: &modules.vertex,
                    entry_point: Some(reflection.vertex_entry()),
                    buffers: &buffers,
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &modules.fragment,
                    entry_point: Some(reflection.fragment_entry()),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: key.format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu_topology(key.topology),
                    strip_index_format,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
    }

    fn create_bind_groups(
        &self,
        state: &WgpuState,
        pipeline: &wgpu::RenderPipeline,
        program: &ProgramEntry,
        reflection: &ProgramReflection,
        call: &DrawCall<'_>,
    ) -> Vec<wgpu::BindGroup> {
        (0..reflection.group_count())
            .map(|group| {
                let mut entries = Vec::new();
                if let (Some(block), Some(buffer)) = (reflection.block(), &program.uniform_buffer) {
                    if block.group == group {
                        entries.push(wgpu::BindGroupEntry {
                            binding: block.binding,
                            resource: buffer.as_entire_binding(),
                        });
                    }
                }
                for (name, slot) in reflection.texture_slots() {
                    if slot.group != group {
                        continue;
                    }
                    let storage = bound_texture(call.textures, slot)
                        .and_then(|texture| state.textures.get(&texture))
                        .and_then(Option::as_ref);
                    if storage.is_none() {
                        log::trace!("Sampler '{}' has no texture bound, using fallback", name);
                    }
                    let (view, sampler) = storage
                        .map(|storage| (&storage.view, &storage.sampler))
                        .unwrap_or((&self.fallback_view, &self.fallback_sampler));
                    entries.push(wgpu::BindGroupEntry {
                        binding: slot.binding,
                        resource: wgpu::BindingResource::TextureView(view),
                    });
                    if let Some(sampler_binding) = slot.sampler {
                        entries.push(wgpu::BindGroupEntry {
                            binding: sampler_binding,
                            resource: wgpu::BindingResource::Sampler(sampler),
                        });
                    }
                }
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(program.label.as_str()),
                    layout: &pipeline.get_bind_group_layout(group),
                    entries: &entries,
                })
            })
            .collect()
    }
}

impl GpuDevice for WgpuDevice {
    fn create_program(&self, label: &str, vertex: &str, fragment: &str) -> ProgramId {
        let program = ProgramId::new(self.next());
        let output = reflect::link(vertex, fragment);

        let modules = output.log.linked.then(|| StageModules {
            vertex: self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(format!("{label} (vertex)").as_str()),
                    source: wgpu::ShaderSource::Wgsl(vertex.into()),
                }),
            fragment: self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(format!("{label} (fragment)").as_str()),
                    source: wgpu::ShaderSource::Wgsl(fragment.into()),
                }),
        });

        let uniform_buffer = output
            .reflection
            .as_ref()
            .map(ProgramReflection::block_size)
            .filter(|size| *size > 0)
            .map(|size| {
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(format!("{label} Uniforms").as_str()),
                    size: align_to(size as u64, 16),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            });

        self.state.borrow_mut().programs.insert(
            program,
            ProgramEntry {
                label: label.to_string(),
                log: output.log,
                reflection: output.reflection,
                modules,
                uniform_buffer,
            },
        );
        program
    }

    fn program_log(&self, program: ProgramId) -> ProgramLog {
        self.state
            .borrow()
            .programs
            .get(&program)
            .map(|entry| entry.log.clone())
            .unwrap_or_default()
    }

    fn uniform_location(&self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        let state = self.state.borrow();
        let location = state.programs.get(&program)?.reflection.as_ref()?.uniform(name);
        location
    }

    fn attrib_location(&self, program: ProgramId, name: &str) -> Option<u32> {
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
            .and_then(|entry| entry.reflection.as_ref())
            .map(ProgramReflection::block_size)
            .unwrap_or(0)
    }

    fn destroy_program(&self, program: ProgramId) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.programs.remove(&program) {
            if let Some(buffer) = entry.uniform_buffer {
                buffer.destroy();
            }
            state.pipelines.retain(|key, _| key.program != program);
        }
    }

    fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn create_texture(&self) -> TextureId {
        let texture = TextureId::new(self.next());
        self.state.borrow_mut().textures.insert(texture, None);
        texture
    }

    fn allocate_texture(&self, texture: TextureId, desc: &TextureDesc) {
        let mut state = self.state.borrow_mut();
        let Some(slot) = state.textures.get_mut(&texture) else {
            log::warn!("allocate_texture on unknown texture {:?}", texture);
            return;
        };

        let max = self.max_texture_dimension();
        let width = desc.width.clamp(1, max);
        let height = desc.height.clamp(1, max);
        if (width, height) != (desc.width, desc.height) {
            log::warn!(
                "Texture '{}' clamped from {}x{} to {}x{}",
                desc.label,
                desc.width,
                desc.height,
                width,
                height
            );
        }
        let levels = desc.levels.clamp(1, mip_chain_len(width, height));

        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if desc.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let format = wgpu_texture_format(desc.format);
        let created = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label.as_str()),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = created.create_view(&wgpu::TextureViewDescriptor {
            label: Some(desc.label.as_str()),
            usage: Some(wgpu::TextureUsages::TEXTURE_BINDING),
            ..Default::default()
        });
        let sampler = create_sampler(&self.device, &desc.label, &desc.sampler);

        let mut stored = desc.clone();
        stored.width = width;
        stored.height = height;
        stored.levels = levels;
        if let Some(previous) = slot.replace(TextureStorage {
            desc: stored,
            texture: created,
            view,
            sampler,
        }) {
            previous.texture.destroy();
        }
    }

    fn write_texture(&self, texture: TextureId, level: u32, data: &[u8]) {
        let state = self.state.borrow();
        let Some(storage) = state.textures.get(&texture).and_then(Option::as_ref) else {
            log::warn!("write_texture on unallocated texture {:?}", texture);
            return;
        };
        if level >= storage.desc.levels {
            log::warn!(
                "Texture '{}' has no mip level {}",
                storage.desc.label,
                level
            );
            return;
        }

        let (width, height) = mip_extent(storage.desc.width, storage.desc.height, level);
        let bytes_per_pixel = storage.desc.format.bytes_per_pixel();
        let expected = (width * height * bytes_per_pixel) as usize;
        if data.len() < expected {
            log::warn!(
                "Texture '{}' level {} expects {} bytes, got {}",
                storage.desc.label,
                level,
                expected,
                data.len()
            );
            return;
        }

        let (pixels, row_bytes) = if storage.desc.format == TextureFormat::Rgb8 {
            (expand_rgb8(&data[..expected]), width * 4)
        } else {
            (data[..expected].to_vec(), width * bytes_per_pixel)
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &storage.texture,
                mip_level: level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row_bytes),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn texture_size(&self, texture: TextureId, level: u32) -> Option<(u32, u32)> {
        let state = self.state.borrow();
        let storage = state.textures.get(&texture)?.as_ref()?;
        (level < storage.desc.levels)
            .then(|| mip_extent(storage.desc.width, storage.desc.height, level))
    }

    fn destroy_texture(&self, texture: TextureId) {
        if let Some(Some(storage)) = self.state.borrow_mut().textures.remove(&texture) {
            storage.texture.destroy();
        }
    }

    fn create_buffer(&self, kind: BufferKind) -> BufferId {
        let buffer = BufferId::new(self.next());
        self.state
            .borrow_mut()
            .buffers
            .insert(buffer, BufferEntry { kind, storage: None });
        buffer
    }

    fn allocate_buffer(&self, buffer: BufferId, size: u64) {
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.buffers.get_mut(&buffer) else {
            log::warn!("allocate_buffer on unknown buffer {:?}", buffer);
            return;
        };
        let usage = match entry.kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;
        let created = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match entry.kind {
                BufferKind::Vertex => "Vertex Buffer",
                BufferKind::Index => "Index Buffer",
            }),
            size: align_to(size.max(1), wgpu::COPY_BUFFER_ALIGNMENT),
            usage,
            mapped_at_creation: false,
        });
        if let Some((previous, _)) = entry.storage.replace((created, size)) {
            previous.destroy();
        }
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) {
        let state = self.state.borrow();
        let Some((storage, size)) = state
            .buffers
            .get(&buffer)
            .and_then(|entry| entry.storage.as_ref())
        else {
            log::warn!("write_buffer on unallocated buffer {:?}", buffer);
            return;
        };
        if offset + data.len() as u64 > *size {
            log::warn!(
                "write of {} bytes at {} overflows buffer {:?} ({} bytes)",
                data.len(),
                offset,
                buffer,
                size
            );
            return;
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            log::warn!("Unaligned write at offset {} to buffer {:?}", offset, buffer);
            return;
        }
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(storage, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_to(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(storage, offset, &padded);
        }
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(entry) = self.state.borrow_mut().buffers.remove(&buffer) {
            if let Some((storage, _)) = entry.storage {
                storage.destroy();
            }
        }
    }

    fn create_renderbuffer(&self, width: u32, height: u32) -> RenderbufferId {
        let renderbuffer = RenderbufferId::new(self.next());
        let max = self.max_texture_dimension();
        if width == 0 || height == 0 || width > max || height > max {
            log::warn!(
                "Renderbuffer {}x{} exceeds device limits ({})",
                width,
                height,
                max
            );
            return renderbuffer;
        }
        let depth = Depth::new(&self.device, "Renderbuffer", width, height);
        self.state
            .borrow_mut()
            .renderbuffers
            .insert(renderbuffer, depth);
        renderbuffer
    }

    fn destroy_renderbuffer(&self, renderbuffer: RenderbufferId) {
        self.state.borrow_mut().renderbuffers.remove(&renderbuffer);
    }

    fn create_framebuffer(
        &self,
        color: TextureId,
        level: u32,
        depth: RenderbufferId,
    ) -> FramebufferId {
        let framebuffer = FramebufferId::new(self.next());
        self.state.borrow_mut().framebuffers.insert(
            framebuffer,
            FramebufferEntry {
                color,
                level,
                depth,
            },
        );
        framebuffer
    }

    fn framebuffer_status(&self, framebuffer: FramebufferId) -> FramebufferStatus {
        let state = self.state.borrow();
        let Some(entry) = state.framebuffers.get(&framebuffer) else {
            return FramebufferStatus::MissingAttachment;
        };
        check_framebuffer(
            color_info(&state, entry.color),
            entry.level,
            state
                .renderbuffers
                .get(&entry.depth)
                .map(|depth| (depth.width, depth.height)),
            self.max_texture_dimension(),
        )
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferId) {
        self.state.borrow_mut().framebuffers.remove(&framebuffer);
    }

    fn clear(&self, target: RenderTarget, color: [f32; 4]) {
        let state = self.state.borrow();
        let Some(resolved) = self.resolve_target(&state, target) else {
            log::warn!("Skipping clear of unavailable target {:?}", target);
            return;
        };
        drop(state);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Clear Encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &resolved.color,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(color[0]),
                            g: f64::from(color[1]),
                            b: f64::from(color[2]),
                            a: f64::from(color[3]),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &resolved.depth,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
    }

    fn draw(&self, target: RenderTarget, call: &DrawCall<'_>) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let Some(program) = state.programs.get(&call.program) else {
            log::warn!("Skipping draw with unknown program {:?}", call.program);
            return;
        };
        let (Some(reflection), Some(modules)) = (&program.reflection, &program.modules) else {
            log::warn!(
                "Skipping draw with unlinked program '{}'",
                program.label
            );
            return;
        };
        let Some(resolved) = self.resolve_target(state, target) else {
            log::warn!("Skipping draw to unavailable target {:?}", target);
            return;
        };
        let Some((index_buffer, index_bytes)) = state
            .buffers
            .get(&call.index_buffer)
            .and_then(|entry| entry.storage.as_ref())
        else {
            log::warn!("Skipping draw without an index buffer");
            return;
        };
        if u64::from(call.index_count) * u64::from(call.index_format.size()) > *index_bytes {
            log::warn!(
                "Skipping draw of {} indices from a {} byte buffer",
                call.index_count,
                index_bytes
            );
            return;
        }

        let slots = self.vertex_slots(state, reflection, call.attributes);
        let key = PipelineKey::new(
            call,
            resolved.format,
            slots.iter().map(|slot| slot.key.clone()).collect(),
        );
        let pipeline = match state.pipelines.get(&key) {
            Some(pipeline) => pipeline.clone(),
            None => self.create_pipeline(program, modules, reflection, &key),
        };

        if let Some(buffer) = &program.uniform_buffer {
            let mut data = call.uniforms.to_vec();
            data.resize(buffer.size() as usize, 0);
            self.queue.write_buffer(buffer, 0, &data);
        }

        let bind_groups = self.create_bind_groups(state, &pipeline, program, reflection, call);
        let index_buffer = index_buffer.clone();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Draw Encoder"),
            });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(program.label.as_str()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &resolved.color,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &resolved.depth,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            rpass.set_pipeline(&pipeline);
            for (group, bind_group) in bind_groups.iter().enumerate() {
                rpass.set_bind_group(group as u32, bind_group, &[]);
            }
            for (slot_index, slot) in slots.iter().enumerate() {
                rpass.set_vertex_buffer(slot_index as u32, slot.buffer.slice(slot.offset..));
            }
            rpass.set_index_buffer(index_buffer.slice(..), wgpu_index_format(call.index_format));
            rpass.draw_indexed(0..call.index_count, 0, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));

        state.pipelines.entry(key).or_insert(pipeline);
    }
}

fn color_info(state: &WgpuState, texture: TextureId) -> Option<ColorAttachmentInfo> {
    let storage = state.textures.get(&texture)?.as_ref()?;
    Some(ColorAttachmentInfo {
        width: storage.desc.width,
        height: storage.desc.height,
        levels: storage.desc.levels,
        format: storage.desc.format,
        render_target: storage.desc.render_target,
    })
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn expand_rgb8(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(3)
        .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], u8::MAX])
        .collect()
}

fn wgpu_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::Rgb8 | TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
    }
}

fn wgpu_index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

fn wgpu_topology(topology: Topology) -> wgpu::PrimitiveTopology {
    match topology {
        Topology::Points => wgpu::PrimitiveTopology::PointList,
        Topology::Lines => wgpu::PrimitiveTopology::LineList,
        Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
        Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn address_mode(mode: WrapMode) -> wgpu::AddressMode {
    match mode {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
    }
}

fn filter_mode(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn create_sampler(device: &wgpu::Device, label: &str, desc: &SamplerDesc) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: address_mode(desc.wrap_s),
        address_mode_v: address_mode(desc.wrap_t),
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter_mode(desc.mag_filter),
        min_filter: filter_mode(desc.min_filter),
        mipmap_filter: filter_mode(desc.mipmap_filter),
        ..Default::default()
    })
}

/// Bound wherever a sampler slot has no texture; reads as opaque white.
fn create_fallback_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
) -> (wgpu::TextureView, wgpu::Sampler) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Fallback Texture"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba16Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let white = [half::f16::ONE.to_bits(); 4];
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(&white),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(8),
            rows_per_image: Some(1),
        },
        wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let sampler = create_sampler(device, "Fallback Sampler", &SamplerDesc::default());
    (view, sampler)
}

/// Maps an attribute layout onto a wgpu vertex format. Three-component
/// 8/16-bit layouts have no native equivalent.
fn vertex_format(attribute: &VertexAttribute) -> Option<wgpu::VertexFormat> {
    use wgpu::VertexFormat as F;
    let format = match (attribute.component_type, attribute.components, attribute.normalized) {
        (ComponentType::F32, 1, _) => F::Float32,
        (ComponentType::F32, 2, _) => F::Float32x2,
        (ComponentType::F32, 3, _) => F::Float32x3,
        (ComponentType::F32, 4, _) => F::Float32x4,
        (ComponentType::U32, 1, _) => F::Uint32,
        (ComponentType::U32, 2, _) => F::Uint32x2,
        (ComponentType::U32, 3, _) => F::Uint32x3,
        (ComponentType::U32, 4, _) => F::Uint32x4,
        (ComponentType::U8, 2, true) => F::Unorm8x2,
        (ComponentType::U8, 4, true) => F::Unorm8x4,
        (ComponentType::U8, 2, false) => F::Uint8x2,
        (ComponentType::U8, 4, false) => F::Uint8x4,
        (ComponentType::I8, 2, true) => F::Snorm8x2,
        (ComponentType::I8, 4, true) => F::Snorm8x4,
        (ComponentType::I8, 2, false) => F::Sint8x2,
        (ComponentType::I8, 4, false) => F::Sint8x4,
        (ComponentType::U16, 2, true) => F::Unorm16x2,
        (ComponentType::U16, 4, true) => F::Unorm16x4,
        (ComponentType::U16, 2, false) => F::Uint16x2,
        (ComponentType::U16, 4, false) => F::Uint16x4,
        (ComponentType::I16, 2, true) => F::Snorm16x2,
        (ComponentType::I16, 4, true) => F::Snorm16x4,
        (ComponentType::I16, 2, false) => F::Sint16x2,
        (ComponentType::I16, 4, false) => F::Sint16x4,
        (component_type, components, normalized) => {
            log::warn!(
                "No vertex format for {} x {:?} (normalized: {})",
                components,
                component_type,
                normalized
            );
            return None;
        }
    };
    Some(format)
}

/// Layout for an attribute feeding `input`, or `None` when the attribute
/// cannot feed it and the input falls back to zeros.
fn attribute_slot_key(
    name: &str,
    input: AttributeInfo,
    attribute: &VertexAttribute,
) -> Option<VertexSlotKey> {
    let format = vertex_format(attribute)?;
    if format_kind(format) != input.kind {
        log::warn!(
            "Attribute '{}' is {:?} but the shader reads {:?}; using zeros",
            name,
            format,
            input.kind
        );
        return None;
    }
    let stride = u64::from(attribute.effective_stride());
    if stride % VERTEX_ALIGNMENT != 0 || attribute.offset % VERTEX_ALIGNMENT != 0 {
        log::warn!("Attribute '{}' is not 4-byte aligned; using zeros", name);
        return None;
    }
    Some(VertexSlotKey {
        location: input.location,
        format,
        stride,
        step_mode: wgpu::VertexStepMode::Vertex,
    })
}

/// One zeroed element repeated for every vertex.
fn zero_slot_key(input: AttributeInfo) -> VertexSlotKey {
    VertexSlotKey {
        location: input.location,
        format: zero_format(input.kind, input.components),
        stride: 0,
        step_mode: wgpu::VertexStepMode::Instance,
    }
}

/// Texture bound at `slot`; unbound slots sample the fallback texture.
fn bound_texture(textures: &[TextureBinding], slot: TextureSlot) -> Option<TextureId> {
    textures
        .iter()
        .find(|bound| bound.group == slot.group && bound.binding == slot.binding)
        .map(|bound| bound.texture)
}

fn format_kind(format: wgpu::VertexFormat) -> InputKind {
    use wgpu::VertexFormat as F;
    match format {
        F::Uint8x2 | F::Uint8x4 | F::Uint16x2 | F::Uint16x4 | F::Uint32 | F::Uint32x2
        | F::Uint32x3 | F::Uint32x4 => InputKind::Uint,
        F::Sint8x2 | F::Sint8x4 | F::Sint16x2 | F::Sint16x4 | F::Sint32 | F::Sint32x2
        | F::Sint32x3 | F::Sint32x4 => InputKind::Sint,
        _ => InputKind::Float,
    }
}

fn zero_format(kind: InputKind, components: u32) -> wgpu::VertexFormat {
    use wgpu::VertexFormat as F;
    match (kind, components) {
        (InputKind::Float, 1) => F::Float32,
        (InputKind::Float, 2) => F::Float32x2,
        (InputKind::Float, 3) => F::Float32x3,
        (InputKind::Float, _) => F::Float32x4,
        (InputKind::Sint, 1) => F::Sint32,
        (InputKind::Sint, 2) => F::Sint32x2,
        (InputKind::Sint, 3) => F::Sint32x3,
        (InputKind::Sint, _) => F::Sint32x4,
        (InputKind::Uint, 1) => F::Uint32,
        (InputKind::Uint, 2) => F::Uint32x2,
        (InputKind::Uint, 3) => F::Uint32x3,
        (InputKind::Uint, _) => F::Uint32x4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(component_type: ComponentType, components: u32, normalized: bool) -> VertexAttribute {
        VertexAttribute {
            location: 0,
            buffer: BufferId::new(1),
            components,
            component_type,
            normalized,
            stride: 0,
            offset: 0,
        }
    }

    fn float_input(location: u32, components: u32) -> AttributeInfo {
        AttributeInfo {
            location,
            components,
            kind: InputKind::Float,
        }
    }

    fn draw_call<'a>(attributes: &'a [VertexAttribute], topology: Topology) -> DrawCall<'a> {
        DrawCall {
            program: ProgramId::new(7),
            uniforms: &[],
            textures: &[],
            attributes,
            index_buffer: BufferId::new(2),
            index_format: IndexFormat::Uint16,
            index_count: 3,
            topology,
        }
    }

    #[test]
    fn float_and_normalized_formats_feed_float_inputs() {
        let position = vertex_format(&attribute(ComponentType::F32, 3, false));
        assert_eq!(position, Some(wgpu::VertexFormat::Float32x3));

        let uv = vertex_format(&attribute(ComponentType::U16, 2, true));
        assert_eq!(uv, Some(wgpu::VertexFormat::Unorm16x2));
        assert_eq!(format_kind(wgpu::VertexFormat::Unorm16x2), InputKind::Float);

        let joints = vertex_format(&attribute(ComponentType::U8, 4, false));
        assert_eq!(joints.map(format_kind), Some(InputKind::Uint));
    }

    #[test]
    fn three_component_bytes_have_no_format() {
        assert_eq!(vertex_format(&attribute(ComponentType::U8, 3, true)), None);
    }

    #[test]
    fn rgb8_is_padded_with_opaque_alpha() {
        assert_eq!(expand_rgb8(&[1, 2, 3, 4, 5, 6]), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(5, 4), 8);
        assert_eq!(align_to(80, 16), 80);
    }

    #[test]
    fn packed_attribute_steps_per_vertex() {
        let position = attribute(ComponentType::F32, 3, false);
        let key = attribute_slot_key("POSITION", float_input(0, 3), &position).expect("usable");
        assert_eq!(key.format, wgpu::VertexFormat::Float32x3);
        assert_eq!(key.stride, 12);
        assert_eq!(key.step_mode, wgpu::VertexStepMode::Vertex);
    }

    #[test]
    fn unusable_attributes_fall_back_to_zeros() {
        let joints = attribute(ComponentType::U8, 4, false);
        assert_eq!(attribute_slot_key("JOINTS_0", float_input(3, 4), &joints), None);

        let mut uv = attribute(ComponentType::U16, 2, true);
        uv.offset = 2;
        assert_eq!(attribute_slot_key("TEXCOORD_0", float_input(2, 2), &uv), None);

        let zero = zero_slot_key(float_input(2, 2));
        assert_eq!(zero.format, wgpu::VertexFormat::Float32x2);
        assert_eq!(zero.stride, 0);
        assert_eq!(zero.step_mode, wgpu::VertexStepMode::Instance);
    }

    #[test]
    fn equivalent_draws_share_a_pipeline() {
        let position = attribute(ComponentType::F32, 3, false);
        let keys = vec![
            attribute_slot_key("POSITION", float_input(0, 3), &position).expect("usable"),
            zero_slot_key(float_input(1, 3)),
        ];
        let format = wgpu::TextureFormat::Rgba16Float;
        let attributes = [position];
        let key = |topology, format| {
            PipelineKey::new(&draw_call(&attributes, topology), format, keys.clone())
        };

        let mut cache = std::collections::HashSet::new();
        cache.insert(key(Topology::Triangles, format));
        cache.insert(key(Topology::Triangles, format));
        assert_eq!(cache.len(), 1);

        cache.insert(key(Topology::LineStrip, format));
        cache.insert(key(Topology::Triangles, wgpu::TextureFormat::Bgra8UnormSrgb));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn unbound_samplers_use_the_fallback() {
        let albedo = TextureId::new(9);
        let bound = [TextureBinding {
            unit: 1,
            group: 1,
            binding: 2,
            texture: albedo,
        }];
        let slot = |binding| TextureSlot {
            group: 1,
            binding,
            sampler: Some(binding + 1),
        };

        assert_eq!(bound_texture(&bound, slot(2)), Some(albedo));
        assert_eq!(bound_texture(&bound, slot(0)), None);
    }
}
