//! WGSL compilation and program reflection built on naga.
//!
//! A program is a vertex stage and a fragment stage compiled separately and
//! then "linked": entry points are located, the resources each entry point
//! actually touches are collected, and the two stages are checked against
//! each other. Only resources statically used by an entry point are
//! reported, so a uniform the compiler can see is dead is "not found".
//!
//! Binding conventions:
//! - at most one uniform block (`var<uniform>`), whose member names are the
//!   uniform names; a non-struct uniform is a block of one member named after
//!   the variable
//! - each `texture_2d` variable names a texture slot; a sampler bound at the
//!   next binding of the same group is its sampler

use std::collections::HashMap;
use std::fmt;

use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, Handle, Module, ScalarKind, ShaderStage, Type, TypeInner};

use super::UniformLocation;

/// Compiler and linker output for one program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramLog {
    pub vertex: String,
    pub fragment: String,
    pub link: String,
    pub linked: bool,
}

impl ProgramLog {
    pub fn has_messages(&self) -> bool {
        !(self.vertex.is_empty() && self.fragment.is_empty() && self.link.is_empty())
    }
}

impl fmt::Display for ProgramLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (stage, text) in [
            ("vertex", &self.vertex),
            ("fragment", &self.fragment),
            ("link", &self.link),
        ] {
            if !text.is_empty() {
                writeln!(f, "[{stage}] {}", text.trim_end())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Float,
    Sint,
    Uint,
}

/// A vertex-stage input as declared by the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInfo {
    pub location: u32,
    pub components: u32,
    pub kind: InputKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub group: u32,
    pub binding: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSlot {
    pub group: u32,
    pub binding: u32,
    pub sampler: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockMember {
    offset: u32,
    size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ProgramReflection {
    vertex_entry: String,
    fragment_entry: String,
    attributes: HashMap<String, AttributeInfo>,
    members: HashMap<String, BlockMember>,
    block: Option<BlockInfo>,
    textures: HashMap<String, TextureSlot>,
}

impl ProgramReflection {
    pub fn vertex_entry(&self) -> &str {
        &self.vertex_entry
    }

    pub fn fragment_entry(&self) -> &str {
        &self.fragment_entry
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeInfo> {
        self.attributes.get(name).copied()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, AttributeInfo)> + '_ {
        self.attributes.iter().map(|(name, info)| (name.as_str(), *info))
    }

    pub fn uniform(&self, name: &str) -> Option<UniformLocation> {
        if let Some(member) = self.members.get(name) {
            return Some(UniformLocation::Block {
                offset: member.offset,
                size: member.size,
            });
        }
        self.textures
            .get(name)
            .map(|slot| UniformLocation::Texture {
                group: slot.group,
                binding: slot.binding,
            })
    }

    pub fn block(&self) -> Option<BlockInfo> {
        self.block
    }

    pub fn block_size(&self) -> usize {
        self.block.map(|block| block.size as usize).unwrap_or(0)
    }

    pub fn texture_slots(&self) -> impl Iterator<Item = (&str, TextureSlot)> + '_ {
        self.textures.iter().map(|(name, slot)| (name.as_str(), *slot))
    }

    /// Number of bind groups a pipeline for this program needs.
    pub fn group_count(&self) -> u32 {
        let block_groups = self.block.iter().map(|block| block.group + 1);
        let texture_groups = self.textures.values().map(|slot| slot.group + 1);
        block_groups.chain(texture_groups).max().unwrap_or(0)
    }
}

pub struct LinkOutput {
    pub log: ProgramLog,
    pub reflection: Option<ProgramReflection>,
}

struct CompiledStage {
    module: Module,
    info: ModuleInfo,
    entry: usize,
}

#[derive(Default)]
struct StageResources {
    members: HashMap<String, BlockMember>,
    block: Option<BlockInfo>,
    textures: HashMap<String, TextureSlot>,
}

/// Compiles both stages and links them into a reflection table.
pub fn link(vertex_source: &str, fragment_source: &str) -> LinkOutput {
    let mut log = ProgramLog::default();

    let vertex = compile_stage(vertex_source, ShaderStage::Vertex, &mut log.vertex);
    let fragment = compile_stage(fragment_source, ShaderStage::Fragment, &mut log.fragment);
    let (Some(vertex), Some(fragment)) = (vertex, fragment) else {
        log.link = "link skipped: a stage failed to compile".to_string();
        return LinkOutput {
            log,
            reflection: None,
        };
    };

    match link_stages(&vertex, &fragment) {
        Ok(reflection) => {
            log.linked = true;
            LinkOutput {
                log,
                reflection: Some(reflection),
            }
        }
        Err(message) => {
            log.link = message;
            LinkOutput {
                log,
                reflection: None,
            }
        }
    }
}

fn compile_stage(source: &str, stage: ShaderStage, log: &mut String) -> Option<CompiledStage> {
    let module = match naga::front::wgsl::parse_str(source) {
        Ok(module) => module,
        Err(err) => {
            *log = err.emit_to_string(source);
            return None;
        }
    };

    let info = match Validator::new(ValidationFlags::all(), Capabilities::empty()).validate(&module)
    {
        Ok(info) => info,
        Err(err) => {
            *log = err.emit_to_string(source);
            return None;
        }
    };

    let Some(entry) = module.entry_points.iter().position(|ep| ep.stage == stage) else {
        *log = format!("no {stage:?} entry point");
        return None;
    };

    Some(CompiledStage {
        module,
        info,
        entry,
    })
}

fn link_stages(vertex: &CompiledStage, fragment: &CompiledStage) -> Result<ProgramReflection, String> {
    let vertex_ep = &vertex.module.entry_points[vertex.entry];
    let fragment_ep = &fragment.module.entry_points[fragment.entry];

    let mut attributes = HashMap::new();
    for (name, location, ty) in argument_locations(&vertex.module, &vertex_ep.function.arguments) {
        let Some((components, kind)) = input_shape(&vertex.module.types[ty].inner) else {
            return Err(format!("vertex input '{name}' has an unsupported type"));
        };
        attributes.insert(
            name,
            AttributeInfo {
                location,
                components,
                kind,
            },
        );
    }

    let outputs: Vec<u32> = vertex_ep
        .function
        .result
        .as_ref()
        .map(|result| match &result.binding {
            Some(Binding::Location { location, .. }) => vec![*location],
            Some(_) => Vec::new(),
            None => struct_locations(&vertex.module, result.ty)
                .into_iter()
                .map(|(_, location, _)| location)
                .collect(),
        })
        .unwrap_or_default();
    for (name, location, _) in argument_locations(&fragment.module, &fragment_ep.function.arguments)
    {
        if !outputs.contains(&location) {
            return Err(format!(
                "fragment input '{name}' at location {location} is not written by the vertex stage"
            ));
        }
    }

    let vertex_resources = stage_resources(vertex)?;
    let fragment_resources = stage_resources(fragment)?;

    let block = match (vertex_resources.block, fragment_resources.block) {
        (Some(a), Some(b)) if (a.group, a.binding) != (b.group, b.binding) => {
            return Err("stages bind their uniform blocks at different slots".to_string());
        }
        (Some(a), Some(b)) => Some(BlockInfo {
            size: a.size.max(b.size),
            ..a
        }),
        (a, b) => a.or(b),
    };

    let mut members = vertex_resources.members;
    for (name, member) in fragment_resources.members {
        match members.get(&name) {
            Some(existing) if *existing != member => {
                return Err(format!("uniform '{name}' is laid out differently in each stage"));
            }
            _ => {
                members.insert(name, member);
            }
        }
    }

    let mut textures = vertex_resources.textures;
    for (name, slot) in fragment_resources.textures {
        match textures.get(&name) {
            Some(existing) if (existing.group, existing.binding) != (slot.group, slot.binding) => {
                return Err(format!("texture '{name}' is bound differently in each stage"));
            }
            Some(existing) => {
                let sampler = existing.sampler.or(slot.sampler);
                textures.insert(name, TextureSlot { sampler, ..slot });
            }
            None => {
                textures.insert(name, slot);
            }
        }
    }

    Ok(ProgramReflection {
        vertex_entry: vertex_ep.name.clone(),
        fragment_entry: fragment_ep.name.clone(),
        attributes,
        members,
        block,
        textures,
    })
}

fn argument_locations(
    module: &Module,
    arguments: &[naga::FunctionArgument],
) -> Vec<(String, u32, Handle<Type>)> {
    let mut found = Vec::new();
    for argument in arguments {
        match &argument.binding {
            Some(Binding::Location { location, .. }) => {
                found.push((argument.name.clone().unwrap_or_default(), *location, argument.ty));
            }
            Some(Binding::BuiltIn(_)) => {}
            None => found.extend(struct_locations(module, argument.ty)),
        }
    }
    found
}

fn struct_locations(module: &Module, ty: Handle<Type>) -> Vec<(String, u32, Handle<Type>)> {
    let TypeInner::Struct { members, .. } = &module.types[ty].inner else {
        return Vec::new();
    };
    members
        .iter()
        .filter_map(|member| match &member.binding {
            Some(Binding::Location { location, .. }) => {
                Some((member.name.clone().unwrap_or_default(), *location, member.ty))
            }
            _ => None,
        })
        .collect()
}

fn input_shape(inner: &TypeInner) -> Option<(u32, InputKind)> {
    let (components, scalar) = match inner {
        TypeInner::Scalar(scalar) => (1, scalar),
        TypeInner::Vector { size, scalar } => (*size as u32, scalar),
        _ => return None,
    };
    let kind = match scalar.kind {
        ScalarKind::Float => InputKind::Float,
        ScalarKind::Sint => InputKind::Sint,
        ScalarKind::Uint => InputKind::Uint,
        _ => return None,
    };
    Some((components, kind))
}

fn stage_resources(stage: &CompiledStage) -> Result<StageResources, String> {
    let module = &stage.module;
    let usage = stage.info.get_entry_point(stage.entry);
    let mut resources = StageResources::default();
    let mut samplers = Vec::new();

    for (handle, variable) in module.global_variables.iter() {
        if usage[handle].is_empty() {
            continue;
        }
        let Some(binding) = variable.binding.as_ref() else {
            continue;
        };
        let name = variable.name.clone().unwrap_or_default();
        let inner = &module.types[variable.ty].inner;

        match (&variable.space, inner) {
            (AddressSpace::Uniform, _) => {
                if resources.block.is_some() {
                    return Err(format!(
                        "uniform '{name}': only one uniform block per stage is supported"
                    ));
                }
                resources.block = Some(BlockInfo {
                    group: binding.group,
                    binding: binding.binding,
                    size: inner.size(module.to_ctx()),
                });
                match inner {
                    TypeInner::Struct { members, .. } => {
                        for member in members {
                            let member_name = member.name.clone().unwrap_or_default();
                            let size = module.types[member.ty].inner.size(module.to_ctx());
                            resources.members.insert(
                                member_name,
                                BlockMember {
                                    offset: member.offset,
                                    size,
                                },
                            );
                        }
                    }
                    _ => {
                        let size = inner.size(module.to_ctx());
                        resources.members.insert(name, BlockMember { offset: 0, size });
                    }
                }
            }
            (_, TypeInner::Image { .. }) => {
                resources.textures.insert(
                    name,
                    TextureSlot {
                        group: binding.group,
                        binding: binding.binding,
                        sampler: None,
                    },
                );
            }
            (_, TypeInner::Sampler { .. }) => samplers.push((binding.group, binding.binding)),
            _ => {}
        }
    }

    for slot in resources.textures.values_mut() {
        if samplers.contains(&(slot.group, slot.binding + 1)) {
            slot.sampler = Some(slot.binding + 1);
        }
    }

    Ok(resources)
}
