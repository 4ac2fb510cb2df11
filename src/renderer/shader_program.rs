use std::collections::HashMap;
use std::path::Path;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};

use crate::error::{RenderError, Result};
use crate::gpu::{
    BufferId, ComponentType, DrawCall, ProgramId, RenderTarget, SharedGpu, TextureBinding,
    UniformLocation, VertexAttribute,
};
use crate::io;
use crate::renderer::texture::{Texture, TextureRegistry};
use crate::renderer::IndexedDraw;

/// Prepended to both stages of every program loaded from disk.
pub const COMMON_SHADER: &str = "common.wgsl";

/// One linked program with its lazily filled location caches, its enabled
/// vertex attributes and the textures bound to its samplers.
pub struct ShaderProgram {
    gpu: SharedGpu,
    label: String,
    program: ProgramId,
    uniforms: HashMap<String, Option<UniformLocation>>,
    attributes: HashMap<String, Option<u32>>,
    enabled: Vec<VertexAttribute>,
    textures: TextureRegistry,
    bound: Vec<TextureBinding>,
    uniform_data: Vec<u8>,
}

impl ShaderProgram {
    /// Reads both stages from disk. When `common.wgsl` sits next to the
    /// vertex stage it is prepended to each of them.
    pub fn from_files(
        gpu: &SharedGpu,
        vertex_path: impl AsRef<Path>,
        fragment_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let vertex_path = vertex_path.as_ref();
        let fragment_path = fragment_path.as_ref();

        let common = match vertex_path.parent() {
            Some(dir) => io::read_optional_text(&dir.join(COMMON_SHADER))?,
            None => None,
        };
        let vertex = io::read_text(vertex_path)?;
        let fragment = io::read_text(fragment_path)?;

        let label = format!(
            "{} + {}",
            display_name(vertex_path),
            display_name(fragment_path)
        );
        match common {
            Some(common) => Self::from_sources(
                gpu,
                &label,
                &format!("{common}\n{vertex}"),
                &format!("{common}\n{fragment}"),
            ),
            None => Self::from_sources(gpu, &label, &vertex, &fragment),
        }
    }

    pub fn from_sources(gpu: &SharedGpu, label: &str, vertex: &str, fragment: &str) -> Result<Self> {
        let program = gpu.create_program(label, vertex, fragment);
        let log = gpu.program_log(program);

        if !log.vertex.is_empty() {
            log::warn!("{} vertex stage:\n{}", label, log.vertex);
        }
        if !log.fragment.is_empty() {
            log::warn!("{} fragment stage:\n{}", label, log.fragment);
        }
        if !log.linked {
            log::error!("Program {} failed to link:\n{}", label, log.link);
            gpu.destroy_program(program);
            return Err(RenderError::ShaderLink {
                label: label.to_string(),
                log: log.to_string(),
            });
        }

        log::debug!("Linked program {}", label);
        let block_size = gpu.uniform_block_size(program);
        Ok(Self {
            gpu: SharedGpu::clone(gpu),
            label: label.to_string(),
            program,
            uniforms: HashMap::new(),
            attributes: HashMap::new(),
            enabled: Vec::new(),
            textures: TextureRegistry::new(),
            bound: Vec::new(),
            uniform_data: vec![0; block_size],
        })
    }

    pub fn id(&self) -> ProgramId {
        self.program
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn gpu(&self) -> &SharedGpu {
        &self.gpu
    }

    /// Makes the program current: every registered texture gets the next
    /// texture unit, in registration order, and its sampler is pointed at it.
    pub fn use_program(&mut self) {
        let registered: Vec<(String, Texture)> = self
            .textures
            .iter()
            .map(|(name, texture)| (name.to_string(), texture))
            .collect();

        self.bound.clear();
        for (unit, (name, texture)) in registered.into_iter().enumerate() {
            match self.ensure_uniform(&name) {
                Some(UniformLocation::Texture { group, binding }) => {
                    self.bound.push(TextureBinding {
                        unit: unit as u32,
                        group,
                        binding,
                        texture: texture.id,
                    });
                }
                Some(UniformLocation::Block { .. }) => {
                    log::warn!("{}: '{}' is not a sampler", self.label, name);
                }
                None => {}
            }
        }
    }

    /// Cached uniform location; `None` (not present) is cached as well.
    pub fn ensure_uniform(&mut self, name: &str) -> Option<UniformLocation> {
        if let Some(location) = self.uniforms.get(name) {
            return *location;
        }
        let location = self.gpu.uniform_location(self.program, name);
        if location.is_none() {
            log::warn!("{}: uniform '{}' not found", self.label, name);
        }
        self.uniforms.insert(name.to_string(), location);
        location
    }

    /// Cached attribute location; `None` (not present) is cached as well.
    pub fn ensure_attrib(&mut self, name: &str) -> Option<u32> {
        if let Some(location) = self.attributes.get(name) {
            return *location;
        }
        let location = self.gpu.attrib_location(self.program, name);
        if location.is_none() {
            log::debug!("{}: attribute '{}' not used", self.label, name);
        }
        self.attributes.insert(name.to_string(), location);
        location
    }

    /// Enables attribute `name` and records how to read it from `buffer`.
    /// Returns `false`, changing nothing, when the program has no such
    /// attribute.
    #[allow(clippy::too_many_arguments)]
    pub fn vertex_attrib_pointer(
        &mut self,
        name: &str,
        buffer: BufferId,
        components: u32,
        component_type: ComponentType,
        normalized: bool,
        stride: u32,
        offset: u64,
    ) -> bool {
        let Some(location) = self.ensure_attrib(name) else {
            return false;
        };
        let attribute = VertexAttribute {
            location,
            buffer,
            components,
            component_type,
            normalized,
            stride,
            offset,
        };
        match self
            .enabled
            .iter_mut()
            .find(|enabled| enabled.location == location)
        {
            Some(enabled) => *enabled = attribute,
            None => self.enabled.push(attribute),
        }
        true
    }

    pub fn enabled_attributes(&self) -> &[VertexAttribute] {
        &self.enabled
    }

    /// Texture registered under `name`, creating an owned one if there is
    /// none yet.
    pub fn get_texture(&mut self, name: &str) -> Texture {
        if let Some(texture) = self.textures.get(name) {
            return texture;
        }
        let texture = Texture::owned(self.gpu.create_texture());
        self.textures.insert(name, texture);
        texture
    }

    /// Installs `texture` under `name`. Whatever was registered before is
    /// forgotten, not freed.
    pub fn register_texture(&mut self, name: &str, texture: Texture) -> Texture {
        if let Some(previous) = self.textures.insert(name, texture) {
            if !previous.persistent && previous.id != texture.id {
                log::debug!(
                    "{}: texture {:?} replaced under '{}' without being freed",
                    self.label,
                    previous.id,
                    name
                );
            }
        }
        texture
    }

    pub fn textures(&self) -> &TextureRegistry {
        &self.textures
    }

    /// Sampler bindings computed by the last [`ShaderProgram::use_program`].
    pub fn bound_textures(&self) -> &[TextureBinding] {
        &self.bound
    }

    /// First unit past every registered texture. Registrations without a
    /// matching sampler still hold their unit.
    pub fn next_texture_unit(&self) -> u32 {
        self.textures.len() as u32
    }

    pub fn uniform_data(&self) -> &[u8] {
        &self.uniform_data
    }

    fn write_uniform(&mut self, name: &str, bytes: &[u8]) {
        match self.ensure_uniform(name) {
            Some(UniformLocation::Block { offset, size }) => {
                let start = offset as usize;
                let len = bytes.len().min(size as usize);
                if let Some(slot) = self.uniform_data.get_mut(start..start + len) {
                    slot.copy_from_slice(&bytes[..len]);
                }
            }
            Some(UniformLocation::Texture { .. }) => {
                log::warn!("{}: '{}' is a sampler, not a value", self.label, name);
            }
            None => {}
        }
    }

    pub fn uniform_f32(&mut self, name: &str, value: f32) {
        self.write_uniform(name, bytemuck::bytes_of(&value));
    }

    pub fn uniform_u32(&mut self, name: &str, value: u32) {
        self.write_uniform(name, bytemuck::bytes_of(&value));
    }

    pub fn uniform_vec2(&mut self, name: &str, value: Vec2) {
        self.write_uniform(name, bytemuck::cast_slice(&value.to_array()));
    }

    pub fn uniform_vec3(&mut self, name: &str, value: Vec3) {
        self.write_uniform(name, bytemuck::cast_slice(&value.to_array()));
    }

    pub fn uniform_vec4(&mut self, name: &str, value: Vec4) {
        self.write_uniform(name, bytemuck::cast_slice(&value.to_array()));
    }

    /// `mat3x3<f32>` columns are padded to 16 bytes in uniform memory.
    pub fn uniform_mat3(&mut self, name: &str, value: Mat3) {
        let columns = [
            value.x_axis.extend(0.0).to_array(),
            value.y_axis.extend(0.0).to_array(),
            value.z_axis.extend(0.0).to_array(),
        ];
        self.write_uniform(name, bytemuck::cast_slice(&columns));
    }

    pub fn uniform_mat4(&mut self, name: &str, value: Mat4) {
        self.write_uniform(name, bytemuck::cast_slice(&value.to_cols_array()));
    }

    /// Issues one indexed draw with the program's current uniforms, enabled
    /// attributes and bound textures, plus any `extra_textures`.
    pub fn draw(&self, target: RenderTarget, geometry: &IndexedDraw, extra_textures: &[TextureBinding]) {
        let textures: Vec<TextureBinding> = self
            .bound
            .iter()
            .chain(extra_textures)
            .copied()
            .collect();
        self.gpu.draw(
            target,
            &DrawCall {
                program: self.program,
                uniforms: &self.uniform_data,
                textures: &textures,
                attributes: &self.enabled,
                index_buffer: geometry.index_buffer,
                index_format: geometry.index_format,
                index_count: geometry.index_count,
                topology: geometry.topology,
            },
        );
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        self.enabled.clear();
        for texture in self.textures.take_owned() {
            self.gpu.destroy_texture(texture);
        }
        self.gpu.destroy_program(self.program);
    }
}

impl std::fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("label", &self.label)
            .field("program", &self.program)
            .field("textures", &self.textures.len())
            .finish()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::gpu::HeadlessDevice;

    const VERTEX: &str = r#"
struct Uniforms {
    uScale: vec2<f32>,
    uColor: vec4<f32>,
    uBasis: mat3x3<f32>,
};
@group(0) @binding(0) var<uniform> u: Uniforms;

@vertex
fn vs_main(@location(0) aPosition: vec2<f32>) -> @builtin(position) vec4<f32> {
    let p = u.uBasis * vec3<f32>(aPosition * u.uScale, 1.0);
    return vec4<f32>(p, 1.0);
}
"#;

    const FRAGMENT: &str = r#"
struct Uniforms {
    uScale: vec2<f32>,
    uColor: vec4<f32>,
    uBasis: mat3x3<f32>,
};
@group(0) @binding(0) var<uniform> u: Uniforms;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return u.uColor;
}
"#;

    fn floats(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect()
    }

    fn program() -> (Rc<HeadlessDevice>, ShaderProgram) {
        let device = Rc::new(HeadlessDevice::new());
        let gpu: SharedGpu = device.clone();
        let program = ShaderProgram::from_sources(&gpu, "test", VERTEX, FRAGMENT).expect("links");
        (device, program)
    }

    #[test]
    fn uniform_values_land_at_block_offsets() {
        let (_device, mut program) = program();
        program.uniform_vec2("uScale", Vec2::new(2.0, 3.0));
        program.uniform_vec4("uColor", Vec4::new(0.1, 0.2, 0.3, 1.0));

        let values = floats(program.uniform_data());
        assert_eq!(values.len(), 20);
        assert_eq!(&values[0..2], &[2.0, 3.0]);
        assert_eq!(&values[4..8], &[0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn mat3_columns_are_padded() {
        let (_device, mut program) = program();
        program.uniform_mat3("uBasis", Mat3::from_cols(Vec3::X, Vec3::Y * 2.0, Vec3::Z * 3.0));

        let values = floats(program.uniform_data());
        assert_eq!(&values[8..12], &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(&values[12..16], &[0.0, 2.0, 0.0, 0.0]);
        assert_eq!(&values[16..20], &[0.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn unknown_uniform_is_a_no_op() {
        let (_device, mut program) = program();
        let before = program.uniform_data().to_vec();
        program.uniform_f32("uMissing", 4.0);
        assert_eq!(program.uniform_data(), before.as_slice());
    }

    #[test]
    fn link_failure_is_an_error_and_frees_the_program() {
        let device = Rc::new(HeadlessDevice::new());
        let gpu: SharedGpu = device.clone();
        let result = ShaderProgram::from_sources(&gpu, "broken", VERTEX, "fn nope( {");
        assert!(matches!(result, Err(RenderError::ShaderLink { .. })));
        assert_eq!(device.live_programs(), 0);
    }

    #[test]
    fn drop_releases_program() {
        let (device, program) = program();
        assert_eq!(device.live_programs(), 1);
        drop(program);
        assert_eq!(device.live_programs(), 0);
    }
}
