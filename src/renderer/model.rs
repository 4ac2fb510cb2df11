//! Arming: turning the first primitive of a glTF asset into GPU buffers and
//! sampler bindings for a program.
//!
//! All attribute streams are measured first so the vertex buffer is
//! allocated exactly once, then each stream is uploaded at a running offset
//! and wired to the program attribute of the same name (`POSITION`,
//! `NORMAL`, `TEXCOORD_0`, ...). Streams the program does not declare are
//! uploaded but stay inert.

use std::borrow::Cow;

use glam::{Vec2, Vec3, Vec4};

use crate::asset::GltfAsset;
use crate::error::{RenderError, Result};
use crate::gpu::{
    ComponentType, IndexFormat, RenderTarget, SharedGpu, TextureBinding, TextureDesc, Topology,
    UniformLocation,
};
use crate::renderer::texture::{image_pixels, sampler_from_gltf};
use crate::renderer::{BufferPair, IndexedDraw, OwnedTexture, RenderContext, ShaderProgram};

/// Sub-uploads start on 4-byte boundaries.
const UPLOAD_ALIGNMENT: u64 = 4;

/// Where one accessor's bytes live and how they are laid out.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeBufferInfo {
    pub name: String,
    pub buffer_index: usize,
    pub byte_offset: usize,
    pub elements: usize,
    pub components: u32,
    pub bytes_per_component: u32,
    pub byte_length: usize,
    pub component_type: ComponentType,
    pub normalized: bool,
    /// Distance between elements in the source view; `None` when packed.
    pub source_stride: Option<usize>,
}

impl AttributeBufferInfo {
    pub fn from_accessor(name: &str, accessor: &gltf::Accessor<'_>) -> Result<Self> {
        let Some(view) = accessor.view() else {
            return Err(RenderError::Asset(format!(
                "accessor {} ('{}') has no buffer view",
                accessor.index(),
                name
            )));
        };
        let component_type = component_type(accessor.data_type());
        let components = components(accessor.dimensions());
        let bytes_per_component = component_type.size();
        let elements = accessor.count();
        let element_size = (components * bytes_per_component) as usize;
        let source_stride = view.stride().filter(|stride| *stride != element_size);

        Ok(Self {
            name: name.to_string(),
            buffer_index: view.buffer().index(),
            byte_offset: view.offset() + accessor.offset(),
            elements,
            components,
            bytes_per_component,
            byte_length: elements * element_size,
            component_type,
            normalized: accessor.normalized(),
            source_stride,
        })
    }

    pub fn element_size(&self) -> usize {
        (self.components * self.bytes_per_component) as usize
    }

    /// The accessor's bytes, tightly packed. Interleaved views are gathered
    /// into a copy.
    pub fn gather<'a>(&self, buffers: &'a [gltf::buffer::Data]) -> Result<Cow<'a, [u8]>> {
        let source = buffers
            .get(self.buffer_index)
            .map(|data| data.0.as_slice())
            .ok_or_else(|| {
                RenderError::Asset(format!(
                    "'{}' reads missing buffer {}",
                    self.name, self.buffer_index
                ))
            })?;

        let element_size = self.element_size();
        let stride = self.source_stride.unwrap_or(element_size);
        let needed = match self.elements {
            0 => 0,
            n => self.byte_offset + (n - 1) * stride + element_size,
        };
        if needed > source.len() {
            return Err(RenderError::Asset(format!(
                "'{}' needs {} bytes of buffer {} but it holds {}",
                self.name,
                needed,
                self.buffer_index,
                source.len()
            )));
        }

        if stride == element_size {
            let end = self.byte_offset + self.byte_length;
            return Ok(Cow::Borrowed(&source[self.byte_offset..end]));
        }

        let mut packed = Vec::with_capacity(self.byte_length);
        for element in 0..self.elements {
            let start = self.byte_offset + element * stride;
            packed.extend_from_slice(&source[start..start + element_size]);
        }
        Ok(Cow::Owned(packed))
    }
}

/// Index reshaping needed for topologies the device cannot draw directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRewrite {
    /// Line loop drawn as a strip that returns to its first vertex.
    CloseLoop,
    /// Triangle fan expanded into a triangle list.
    FanToList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexBufferInfo {
    /// `None` for non-indexed primitives.
    pub accessor: Option<AttributeBufferInfo>,
    pub vertex_count: usize,
    pub rewrite: Option<IndexRewrite>,
}

/// Index data ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIndices<'a> {
    pub format: IndexFormat,
    pub count: u32,
    pub bytes: Cow<'a, [u8]>,
}

impl IndexBufferInfo {
    pub fn resolve<'a>(&self, buffers: &'a [gltf::buffer::Data]) -> Result<ResolvedIndices<'a>> {
        let Some(accessor) = &self.accessor else {
            let sequential: Vec<u32> = (0..self.vertex_count as u32).collect();
            return Ok(self.rewritten(sequential));
        };

        let bytes = accessor.gather(buffers)?;
        match (accessor.component_type, self.rewrite) {
            (ComponentType::U16, None) => Ok(ResolvedIndices {
                format: IndexFormat::Uint16,
                count: accessor.elements as u32,
                bytes,
            }),
            (ComponentType::U32, None) => Ok(ResolvedIndices {
                format: IndexFormat::Uint32,
                count: accessor.elements as u32,
                bytes,
            }),
            (ComponentType::U8, None) => {
                let widened: Vec<u16> = bytes.iter().map(|index| u16::from(*index)).collect();
                Ok(ResolvedIndices {
                    format: IndexFormat::Uint16,
                    count: widened.len() as u32,
                    bytes: Cow::Owned(bytemuck::cast_slice(&widened).to_vec()),
                })
            }
            (ComponentType::U8 | ComponentType::U16 | ComponentType::U32, Some(_)) => {
                let indices = decode_indices(&bytes, accessor.component_type);
                Ok(self.rewritten(indices))
            }
            (other, _) => Err(RenderError::Asset(format!(
                "index accessor has component type {:?}",
                other
            ))),
        }
    }

    fn rewritten(&self, indices: Vec<u32>) -> ResolvedIndices<'static> {
        let indices = match self.rewrite {
            Some(IndexRewrite::CloseLoop) => {
                let mut closed = indices;
                if let Some(&first) = closed.first() {
                    closed.push(first);
                }
                closed
            }
            Some(IndexRewrite::FanToList) => fan_to_list(&indices),
            None => indices,
        };
        ResolvedIndices {
            format: IndexFormat::Uint32,
            count: indices.len() as u32,
            bytes: Cow::Owned(bytemuck::cast_slice(&indices).to_vec()),
        }
    }
}

fn decode_indices(bytes: &[u8], component_type: ComponentType) -> Vec<u32> {
    match component_type {
        ComponentType::U8 => bytes.iter().map(|index| u32::from(*index)).collect(),
        ComponentType::U16 => bytes
            .chunks_exact(2)
            .map(|index| u32::from(u16::from_le_bytes([index[0], index[1]])))
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|index| u32::from_le_bytes([index[0], index[1], index[2], index[3]]))
            .collect(),
    }
}

fn fan_to_list(indices: &[u32]) -> Vec<u32> {
    let Some((&hub, rest)) = indices.split_first() else {
        return Vec::new();
    };
    rest.windows(2)
        .flat_map(|edge| [hub, edge[0], edge[1]])
        .collect()
}

/// Material texture slots the model program knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialSlotKind {
    BaseColor,
    MetallicRoughness,
    Normal,
    Emissive,
    Occlusion,
}

impl MaterialSlotKind {
    pub const ALL: [MaterialSlotKind; 5] = [
        MaterialSlotKind::BaseColor,
        MaterialSlotKind::MetallicRoughness,
        MaterialSlotKind::Normal,
        MaterialSlotKind::Emissive,
        MaterialSlotKind::Occlusion,
    ];

    pub fn uniform_name(self) -> &'static str {
        match self {
            MaterialSlotKind::BaseColor => "uAlbedoMap",
            MaterialSlotKind::MetallicRoughness => "uMetallicRoughness",
            MaterialSlotKind::Normal => "uNormalMap",
            MaterialSlotKind::Emissive => "uEmissiveMap",
            MaterialSlotKind::Occlusion => "uOcclusionMap",
        }
    }

    /// Bit set in `uTextureMask` when the slot is bound.
    pub fn mask_bit(self) -> u32 {
        match self {
            MaterialSlotKind::BaseColor => 1,
            MaterialSlotKind::MetallicRoughness => 1 << 1,
            MaterialSlotKind::Normal => 1 << 2,
            MaterialSlotKind::Emissive => 1 << 3,
            MaterialSlotKind::Occlusion => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialSlot {
    pub kind: MaterialSlotKind,
    pub texture_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialFactors {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: [f32; 3],
}

impl Default for MaterialFactors {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            metallic: 1.0,
            roughness: 1.0,
            emissive: [0.0; 3],
        }
    }
}

/// Everything arming needs, computed from the document alone.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmingPlan {
    pub attributes: Vec<AttributeBufferInfo>,
    pub indices: IndexBufferInfo,
    pub topology: Topology,
    pub slots: Vec<MaterialSlot>,
    pub factors: MaterialFactors,
}

impl ArmingPlan {
    /// Plans the default (or first) scene's first node's mesh's first
    /// primitive. Everything else in the asset is ignored.
    pub fn for_first_primitive(document: &gltf::Document) -> Result<Self> {
        let scene = document
            .default_scene()
            .or_else(|| document.scenes().next())
            .ok_or_else(|| RenderError::Asset("asset has no scene".to_string()))?;
        let node = scene
            .nodes()
            .next()
            .ok_or_else(|| RenderError::Asset(format!("scene {} has no nodes", scene.index())))?;
        let mesh = node
            .mesh()
            .ok_or_else(|| RenderError::Asset(format!("node {} has no mesh", node.index())))?;
        let primitive = mesh
            .primitives()
            .next()
            .ok_or_else(|| RenderError::Asset(format!("mesh {} has no primitives", mesh.index())))?;

        if document.scenes().count() > 1
            || scene.nodes().count() > 1
            || mesh.primitives().count() > 1
        {
            log::warn!("Only the first primitive of the first node is rendered");
        }

        let attributes = primitive
            .attributes()
            .map(|(semantic, accessor)| {
                AttributeBufferInfo::from_accessor(&semantic.to_string(), &accessor)
            })
            .collect::<Result<Vec<_>>>()?;

        let vertex_count = primitive
            .get(&gltf::Semantic::Positions)
            .map(|accessor| accessor.count())
            .or_else(|| attributes.first().map(|info| info.elements))
            .unwrap_or(0);

        let (topology, rewrite) = topology(primitive.mode());
        let accessor = primitive
            .indices()
            .map(|accessor| AttributeBufferInfo::from_accessor("indices", &accessor))
            .transpose()?;

        let material = primitive.material();
        let pbr = material.pbr_metallic_roughness();
        let slots = [
            (
                MaterialSlotKind::BaseColor,
                pbr.base_color_texture().map(|info| info.texture().index()),
            ),
            (
                MaterialSlotKind::MetallicRoughness,
                pbr.metallic_roughness_texture()
                    .map(|info| info.texture().index()),
            ),
            (
                MaterialSlotKind::Normal,
                material.normal_texture().map(|info| info.texture().index()),
            ),
            (
                MaterialSlotKind::Emissive,
                material.emissive_texture().map(|info| info.texture().index()),
            ),
            (
                MaterialSlotKind::Occlusion,
                material.occlusion_texture().map(|info| info.texture().index()),
            ),
        ]
        .into_iter()
        .filter_map(|(kind, texture_index)| {
            texture_index.map(|texture_index| MaterialSlot {
                kind,
                texture_index,
            })
        })
        .collect();

        let factors = MaterialFactors {
            base_color: pbr.base_color_factor(),
            metallic: pbr.metallic_factor(),
            roughness: pbr.roughness_factor(),
            emissive: material.emissive_factor(),
        };

        Ok(Self {
            attributes,
            indices: IndexBufferInfo {
                accessor,
                vertex_count,
                rewrite,
            },
            topology,
            slots,
            factors,
        })
    }

    /// Size of the single vertex allocation.
    pub fn vertex_bytes(&self) -> u64 {
        self.attributes
            .iter()
            .map(|info| align_upload(info.byte_length as u64))
            .sum()
    }
}

fn align_upload(length: u64) -> u64 {
    length.div_ceil(UPLOAD_ALIGNMENT) * UPLOAD_ALIGNMENT
}

fn component_type(data_type: gltf::accessor::DataType) -> ComponentType {
    use gltf::accessor::DataType;
    match data_type {
        DataType::I8 => ComponentType::I8,
        DataType::U8 => ComponentType::U8,
        DataType::I16 => ComponentType::I16,
        DataType::U16 => ComponentType::U16,
        DataType::U32 => ComponentType::U32,
        DataType::F32 => ComponentType::F32,
    }
}

fn components(dimensions: gltf::accessor::Dimensions) -> u32 {
    use gltf::accessor::Dimensions;
    match dimensions {
        Dimensions::Scalar => 1,
        Dimensions::Vec2 => 2,
        Dimensions::Vec3 => 3,
        Dimensions::Vec4 | Dimensions::Mat2 => 4,
        Dimensions::Mat3 => 9,
        Dimensions::Mat4 => 16,
    }
}

/// Device topology for a glTF primitive mode.
pub fn topology(mode: gltf::mesh::Mode) -> (Topology, Option<IndexRewrite>) {
    use gltf::mesh::Mode;
    match mode {
        Mode::Points => (Topology::Points, None),
        Mode::Lines => (Topology::Lines, None),
        Mode::LineLoop => (Topology::LineStrip, Some(IndexRewrite::CloseLoop)),
        Mode::LineStrip => (Topology::LineStrip, None),
        Mode::Triangles => (Topology::Triangles, None),
        Mode::TriangleStrip => (Topology::TriangleStrip, None),
        Mode::TriangleFan => {
            log::warn!("Triangle fans are drawn as triangle lists");
            (Topology::Triangles, Some(IndexRewrite::FanToList))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedSlot {
    kind: MaterialSlotKind,
    group: u32,
    binding: u32,
    texture_index: usize,
}

/// Geometry and textures of one glTF primitive.
pub struct ModelRenderContext {
    buffers: BufferPair,
    textures: Vec<OwnedTexture>,
    slots: Vec<ArmedSlot>,
    geometry: Option<IndexedDraw>,
}

impl ModelRenderContext {
    pub fn new(gpu: &SharedGpu) -> Self {
        Self {
            buffers: BufferPair::new(gpu),
            textures: Vec::new(),
            slots: Vec::new(),
            geometry: None,
        }
    }

    /// Creates one GPU texture per texture the asset declares.
    pub fn upload_textures(&mut self, asset: &GltfAsset) -> Result<()> {
        let gpu = SharedGpu::clone(self.buffers.gpu());
        let mut uploaded = Vec::with_capacity(asset.images.len());
        for texture in asset.document.textures() {
            let image_index = texture.source().index();
            let image = asset.images.get(image_index).ok_or_else(|| {
                RenderError::Asset(format!(
                    "texture {} uses missing image {}",
                    texture.index(),
                    image_index
                ))
            })?;
            let (format, pixels) = image_pixels(image_index, image)?;
            let desc = TextureDesc::new(
                format!("glTF texture {}", texture.index()),
                image.width,
                image.height,
                format,
            )
            .with_sampler(sampler_from_gltf(&texture.sampler()));

            log::debug!(
                "Uploading texture {} ({}x{} {:?})",
                texture.index(),
                image.width,
                image.height,
                format
            );
            uploaded.push(OwnedTexture::upload(&gpu, &desc, &pixels)?);
        }
        self.textures = uploaded;
        Ok(())
    }

    /// Uploads the first primitive of `asset` and wires it to `program`.
    pub fn arm(&mut self, program: &mut ShaderProgram, asset: &GltfAsset) -> Result<()> {
        let plan = ArmingPlan::for_first_primitive(&asset.document)?;
        let gpu = SharedGpu::clone(self.buffers.gpu());
        let vertex_buffer = self.buffers.vertex();

        let total = plan.vertex_bytes();
        log::debug!("Vertex streams total {} bytes", total);
        gpu.allocate_buffer(vertex_buffer, total);

        let mut offset = 0u64;
        for info in &plan.attributes {
            let bytes = info.gather(&asset.buffers)?;
            log::trace!("Filling attribute {} at offset {}", info.name, offset);
            gpu.write_buffer(vertex_buffer, offset, &bytes);
            let wired = program.vertex_attrib_pointer(
                &info.name,
                vertex_buffer,
                info.components,
                info.component_type,
                info.normalized,
                0,
                offset,
            );
            if !wired {
                log::debug!("Attribute {} is not read by {}", info.name, program.label());
            }
            offset += align_upload(info.byte_length as u64);
        }

        let indices = plan.indices.resolve(&asset.buffers)?;
        log::debug!(
            "Buffering {} indices ({:?}, {} bytes)",
            indices.count,
            indices.format,
            indices.bytes.len()
        );
        gpu.allocate_buffer(self.buffers.index(), indices.bytes.len() as u64);
        gpu.write_buffer(self.buffers.index(), 0, &indices.bytes);
        self.geometry = Some(IndexedDraw {
            index_buffer: self.buffers.index(),
            index_format: indices.format,
            index_count: indices.count,
            topology: plan.topology,
        });

        self.slots.clear();
        let mut mask = 0u32;
        for slot in &plan.slots {
            match program.ensure_uniform(slot.kind.uniform_name()) {
                Some(UniformLocation::Texture { group, binding }) => {
                    log::debug!("Found {:?} texture {}", slot.kind, slot.texture_index);
                    mask |= slot.kind.mask_bit();
                    self.slots.push(ArmedSlot {
                        kind: slot.kind,
                        group,
                        binding,
                        texture_index: slot.texture_index,
                    });
                }
                Some(UniformLocation::Block { .. }) | None => {}
            }
        }

        let factors = plan.factors;
        program.uniform_vec4("uBaseColorFactor", Vec4::from_array(factors.base_color));
        program.uniform_vec2(
            "uMetallicRoughnessFactor",
            Vec2::new(factors.metallic, factors.roughness),
        );
        program.uniform_vec3("uEmissiveFactor", Vec3::from_array(factors.emissive));
        program.uniform_u32("uTextureMask", mask);
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.geometry.is_some()
    }

    pub fn geometry(&self) -> Option<IndexedDraw> {
        self.geometry
    }

    pub fn index_count(&self) -> u32 {
        self.geometry.map(|geometry| geometry.index_count).unwrap_or(0)
    }

    pub fn index_format(&self) -> Option<IndexFormat> {
        self.geometry.map(|geometry| geometry.index_format)
    }

    pub fn active_texture_count(&self) -> usize {
        self.slots.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Bindings for the armed material slots. Units continue after the
    /// `first_unit` already taken by the program's own textures.
    pub fn material_bindings(&self, first_unit: u32) -> Vec<TextureBinding> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let texture = self.textures.get(slot.texture_index)?;
                Some((slot, texture.id()))
            })
            .enumerate()
            .map(|(offset, (slot, texture))| TextureBinding {
                unit: first_unit + offset as u32,
                group: slot.group,
                binding: slot.binding,
                texture,
            })
            .collect()
    }
}

impl RenderContext for ModelRenderContext {
    fn buffers(&self) -> &BufferPair {
        &self.buffers
    }

    fn render(&self, program: &ShaderProgram, target: RenderTarget) {
        let Some(geometry) = self.geometry else {
            log::warn!("Model rendered before being armed");
            return;
        };
        let material = self.material_bindings(program.next_texture_unit());
        program.draw(target, &geometry, &material);
    }
}
