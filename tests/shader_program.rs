//! Location caching, attribute wiring and texture ownership of
//! `ShaderProgram`, checked against the recording headless device.

use std::rc::Rc;

use ibl_viewer::gpu::{
    BufferKind, Command, ComponentType, HeadlessDevice, ProgramId, SharedGpu,
    TextureDesc, TextureFormat, UniformLocation,
};
use ibl_viewer::renderer::{ShaderProgram, Texture};

const VERTEX: &str = r#"
struct Uniforms {
    uOffset: vec2<f32>,
    uTint: vec4<f32>,
};
@group(0) @binding(0) var<uniform> u: Uniforms;

struct Output {
    @builtin(position) position: vec4<f32>,
    @location(0) vUv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) aPosition: vec2<f32>, @location(1) aUv: vec2<f32>) -> Output {
    var out: Output;
    out.position = vec4<f32>(aPosition + u.uOffset, 0.0, 1.0);
    out.vUv = aUv;
    return out;
}
"#;

const FRAGMENT: &str = r#"
struct Uniforms {
    uOffset: vec2<f32>,
    uTint: vec4<f32>,
};
@group(0) @binding(0) var<uniform> u: Uniforms;
@group(1) @binding(0) var uFirst: texture_2d<f32>;
@group(1) @binding(1) var uFirstSampler: sampler;
@group(1) @binding(2) var uSecond: texture_2d<f32>;
@group(1) @binding(3) var uSecondSampler: sampler;
@group(1) @binding(4) var uThird: texture_2d<f32>;
@group(1) @binding(5) var uThirdSampler: sampler;

@fragment
fn fs_main(@location(0) vUv: vec2<f32>) -> @location(0) vec4<f32> {
    let a = textureSample(uFirst, uFirstSampler, vUv);
    let b = textureSample(uSecond, uSecondSampler, vUv);
    let c = textureSample(uThird, uThirdSampler, vUv);
    return (a + b + c) * u.uTint;
}
"#;

fn setup() -> (Rc<HeadlessDevice>, SharedGpu, ShaderProgram) {
    let device = Rc::new(HeadlessDevice::new());
    let gpu: SharedGpu = device.clone();
    let program = ShaderProgram::from_sources(&gpu, "program test", VERTEX, FRAGMENT)
        .expect("test program links");
    (device, gpu, program)
}

fn uniform_queries(device: &HeadlessDevice, program: ProgramId, wanted: &str) -> usize {
    device
        .commands()
        .iter()
        .filter(|command| {
            matches!(command, Command::UniformQuery { program: p, name } if *p == program && name == wanted)
        })
        .count()
}

fn attrib_queries(device: &HeadlessDevice, program: ProgramId, wanted: &str) -> usize {
    device
        .commands()
        .iter()
        .filter(|command| {
            matches!(command, Command::AttribQuery { program: p, name } if *p == program && name == wanted)
        })
        .count()
}

#[test]
fn uniform_locations_are_resolved_once() {
    let (device, _gpu, mut program) = setup();

    let first = program.ensure_uniform("uTint");
    let second = program.ensure_uniform("uTint");

    assert!(matches!(first, Some(UniformLocation::Block { offset: 16, size: 16 })));
    assert_eq!(first, second);
    assert_eq!(uniform_queries(&device, program.id(), "uTint"), 1);
}

#[test]
fn missing_uniform_answer_is_cached_too() {
    let (device, _gpu, mut program) = setup();

    assert_eq!(program.ensure_uniform("uNowhere"), None);
    assert_eq!(program.ensure_uniform("uNowhere"), None);
    program.uniform_f32("uNowhere", 1.0);

    assert_eq!(uniform_queries(&device, program.id(), "uNowhere"), 1);
}

#[test]
fn attribute_locations_are_resolved_once() {
    let (device, _gpu, mut program) = setup();

    assert_eq!(program.ensure_attrib("aUv"), Some(1));
    assert_eq!(program.ensure_attrib("aUv"), Some(1));
    assert_eq!(program.ensure_attrib("aMissing"), None);
    assert_eq!(program.ensure_attrib("aMissing"), None);

    assert_eq!(attrib_queries(&device, program.id(), "aUv"), 1);
    assert_eq!(attrib_queries(&device, program.id(), "aMissing"), 1);
}

#[test]
fn absent_attribute_is_not_enabled() {
    let (_device, gpu, mut program) = setup();
    let buffer = gpu.create_buffer(BufferKind::Vertex);

    assert!(program.vertex_attrib_pointer("aPosition", buffer, 2, ComponentType::F32, false, 0, 0));
    let before = program.enabled_attributes().to_vec();

    let wired = program.vertex_attrib_pointer("NORMAL", buffer, 3, ComponentType::F32, false, 0, 8);

    assert!(!wired);
    assert_eq!(program.enabled_attributes(), before.as_slice());
    gpu.destroy_buffer(buffer);
}

#[test]
fn every_enabled_attribute_has_a_cached_location() {
    let (_device, gpu, mut program) = setup();
    let buffer = gpu.create_buffer(BufferKind::Vertex);

    program.vertex_attrib_pointer("aPosition", buffer, 2, ComponentType::F32, false, 0, 0);
    program.vertex_attrib_pointer("aUv", buffer, 2, ComponentType::F32, false, 0, 32);
    program.vertex_attrib_pointer("aUv", buffer, 2, ComponentType::F32, false, 0, 48);

    let enabled = program.enabled_attributes();
    assert_eq!(enabled.len(), 2);
    for attribute in enabled {
        assert!(attribute.location == 0 || attribute.location == 1);
    }
    let uv = enabled.iter().find(|attribute| attribute.location == 1).expect("aUv enabled");
    assert_eq!(uv.offset, 48);
    gpu.destroy_buffer(buffer);
}

#[test]
fn get_texture_returns_the_same_entry() {
    let (device, _gpu, mut program) = setup();

    let first = program.get_texture("uFirst");
    let second = program.get_texture("uFirst");

    assert_eq!(first, second);
    assert!(!first.persistent);
    assert!(device.is_texture_live(first.id));
}

#[test]
fn reregistration_does_not_free_the_previous_texture() {
    let (device, gpu, mut program) = setup();
    let original = program.get_texture("uFirst");
    let replacement = gpu.create_texture();

    program.register_texture("uFirst", Texture::owned(replacement));

    assert_eq!(program.get_texture("uFirst").id, replacement);
    assert!(device.is_texture_live(original.id));
    gpu.destroy_texture(original.id);
}

#[test]
fn drop_frees_exactly_the_owned_textures() {
    let (device, gpu, mut program) = setup();
    let shared = gpu.create_texture();
    gpu.allocate_texture(shared, &TextureDesc::new("shared", 4, 4, TextureFormat::Rgba8));

    let owned: Vec<_> = ["uFirst", "uSecond", "uThird"]
        .into_iter()
        .map(|name| program.get_texture(name).id)
        .collect();
    program.register_texture("uShared", Texture::persistent(shared));
    device.clear_commands();

    drop(program);

    let freed: Vec<_> = device
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::DestroyTexture(texture) => Some(texture),
            _ => None,
        })
        .collect();
    assert_eq!(freed, owned);
    assert!(device.is_texture_live(shared));
    assert_eq!(device.live_programs(), 0);
}

#[test]
fn use_program_assigns_units_in_registration_order() {
    let (_device, _gpu, mut program) = setup();
    let third = program.get_texture("uThird");
    let first = program.get_texture("uFirst");
    let second = program.get_texture("uSecond");

    program.use_program();

    let bound = program.bound_textures();
    assert_eq!(bound.len(), 3);
    assert_eq!((bound[0].unit, bound[0].texture, bound[0].binding), (0, third.id, 4));
    assert_eq!((bound[1].unit, bound[1].texture, bound[1].binding), (1, first.id, 0));
    assert_eq!((bound[2].unit, bound[2].texture, bound[2].binding), (2, second.id, 2));
}

#[test]
fn units_are_recomputed_on_every_use() {
    let (_device, gpu, mut program) = setup();
    program.get_texture("uFirst");
    program.use_program();
    assert_eq!(program.bound_textures().len(), 1);

    let extra = gpu.create_texture();
    program.register_texture("uSecond", Texture::owned(extra));
    program.use_program();

    let units: Vec<u32> = program.bound_textures().iter().map(|binding| binding.unit).collect();
    assert_eq!(units, vec![0, 1]);
}

#[test]
fn failed_compile_reports_stage_diagnostics() {
    let device = Rc::new(HeadlessDevice::new());
    let gpu: SharedGpu = device.clone();

    let err = ShaderProgram::from_sources(&gpu, "broken", VERTEX, "@fragment fn fs_main() -> f32 {")
        .expect_err("fragment does not parse");

    let message = err.to_string();
    assert!(message.contains("broken"));
    assert!(message.contains("[fragment]"));
    assert_eq!(device.live_programs(), 0);
}
