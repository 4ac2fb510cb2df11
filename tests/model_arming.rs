//! Arming the first primitive of small in-memory glTF documents against the
//! shipped model program.

use std::path::PathBuf;
use std::rc::Rc;

use gltf::image::Format;
use ibl_viewer::asset::GltfAsset;
use ibl_viewer::gpu::{
    BufferId, Command, HeadlessDevice, IndexFormat, RenderTarget, SharedGpu, Topology,
    UniformLocation,
};
use ibl_viewer::renderer::{ModelRenderContext, RenderContext, ShaderProgram, Texture};
use ibl_viewer::RenderError;
use serde_json::{json, Value};

const VERTICES: usize = 3;

fn shader_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders"))
}

fn setup() -> (Rc<HeadlessDevice>, SharedGpu, ShaderProgram) {
    let device = Rc::new(HeadlessDevice::new());
    let gpu: SharedGpu = device.clone();
    let dir = shader_dir();
    let program = ShaderProgram::from_files(
        &gpu,
        dir.join("model.vert.wgsl"),
        dir.join("model.frag.wgsl"),
    )
    .expect("model program links");
    (device, gpu, program)
}

/// Positions at 0, texture coordinates at 36, indices at 60.
fn triangle_bytes(indices: &[u8]) -> Vec<u8> {
    let positions: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    let uvs: [f32; 6] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    let mut bytes = Vec::new();
    bytes.extend_from_slice(bytemuck::cast_slice(&positions));
    bytes.extend_from_slice(bytemuck::cast_slice(&uvs));
    bytes.extend_from_slice(indices);
    bytes.resize(68, 0);
    bytes
}

fn u16_indices() -> Vec<u8> {
    bytemuck::cast_slice(&[0u16, 1, 2]).to_vec()
}

fn document(index_accessor: Option<Value>, material: Option<Value>) -> Value {
    let mut accessors = vec![
        json!({
            "bufferView": 0,
            "componentType": 5126,
            "count": VERTICES,
            "type": "VEC3",
            "min": [0.0, 0.0, 0.0],
            "max": [1.0, 1.0, 0.0]
        }),
        json!({ "bufferView": 1, "componentType": 5126, "count": VERTICES, "type": "VEC2" }),
    ];
    let mut primitive = json!({ "attributes": { "POSITION": 0, "TEXCOORD_0": 1 } });
    if let Some(index_accessor) = index_accessor {
        accessors.push(index_accessor);
        primitive["indices"] = json!(2);
    }

    let mut root = json!({
        "asset": { "version": "2.0" },
        "buffers": [{ "byteLength": 68, "uri": "data.bin" }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 24 },
            { "buffer": 0, "byteOffset": 60, "byteLength": 8 }
        ],
        "accessors": accessors,
        "meshes": [{ "primitives": [primitive] }],
        "nodes": [{ "mesh": 0 }],
        "scenes": [{ "nodes": [0] }],
        "scene": 0
    });
    if let Some(material) = material {
        root["images"] = json!([{ "uri": "albedo.png" }]);
        root["textures"] = json!([{ "source": 0 }]);
        root["materials"] = json!([material]);
        root["meshes"][0]["primitives"][0]["material"] = json!(0);
    }
    root
}

fn asset(root: &Value, buffer: Vec<u8>, images: Vec<gltf::image::Data>) -> GltfAsset {
    let json = serde_json::to_vec(root).expect("serializable");
    let gltf = gltf::Gltf::from_slice(&json).expect("valid glTF");
    GltfAsset::from_parts(gltf.document, vec![gltf::buffer::Data(buffer)], images)
}

fn indexed_asset() -> GltfAsset {
    let indices = json!({ "bufferView": 2, "componentType": 5123, "count": 3, "type": "SCALAR" });
    asset(&document(Some(indices), None), triangle_bytes(&u16_indices()), Vec::new())
}

fn albedo_image(format: Format, bytes_per_pixel: usize) -> gltf::image::Data {
    gltf::image::Data {
        pixels: vec![200; 2 * 2 * bytes_per_pixel],
        format,
        width: 2,
        height: 2,
    }
}

fn textured_asset(image: gltf::image::Data) -> GltfAsset {
    let indices = json!({ "bufferView": 2, "componentType": 5123, "count": 3, "type": "SCALAR" });
    let material = json!({
        "pbrMetallicRoughness": {
            "baseColorTexture": { "index": 0 },
            "baseColorFactor": [0.5, 0.5, 0.5, 1.0]
        }
    });
    asset(
        &document(Some(indices), Some(material)),
        triangle_bytes(&u16_indices()),
        vec![image],
    )
}

fn allocations(device: &HeadlessDevice, buffer: BufferId) -> Vec<u64> {
    device
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::AllocateBuffer { buffer: b, size } if b == buffer => Some(size),
            _ => None,
        })
        .collect()
}

fn writes(device: &HeadlessDevice, buffer: BufferId) -> Vec<(u64, usize)> {
    device
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::WriteBuffer { buffer: b, offset, len } if b == buffer => Some((offset, len)),
            _ => None,
        })
        .collect()
}

fn uniform_u32(program: &mut ShaderProgram, uniforms: &[u8], name: &str) -> u32 {
    let Some(UniformLocation::Block { offset, .. }) = program.ensure_uniform(name) else {
        panic!("{name} is not a block member");
    };
    let offset = offset as usize;
    u32::from_le_bytes(uniforms[offset..offset + 4].try_into().expect("four bytes"))
}

#[test]
fn streams_share_one_vertex_allocation() {
    let (device, gpu, mut program) = setup();
    let asset = indexed_asset();
    let mut model = ModelRenderContext::new(&gpu);

    model.arm(&mut program, &asset).expect("armed");

    let vertex = model.buffers().vertex();
    assert_eq!(allocations(&device, vertex), vec![(VERTICES * (12 + 8)) as u64]);
    let mut uploads = writes(&device, vertex);
    uploads.sort();
    let mut lengths: Vec<usize> = uploads.iter().map(|(_, len)| *len).collect();
    lengths.sort();
    assert_eq!(lengths, vec![VERTICES * 8, VERTICES * 12]);
    assert_eq!(uploads[0].0, 0);
    assert_eq!(uploads[1].0, uploads[0].1 as u64);

    let index = model.buffers().index();
    assert_eq!(allocations(&device, index), vec![6]);
    assert_eq!(model.index_count(), 3);
    assert_eq!(model.index_format(), Some(IndexFormat::Uint16));
    assert!(model.is_armed());
}

#[test]
fn armed_streams_feed_the_matching_inputs() {
    let (device, gpu, mut program) = setup();
    let asset = indexed_asset();
    let mut model = ModelRenderContext::new(&gpu);
    model.arm(&mut program, &asset).expect("armed");

    let position = program.ensure_attrib("POSITION").expect("POSITION declared");
    let uv = program.ensure_attrib("TEXCOORD_0").expect("TEXCOORD_0 declared");
    program.use_program();
    model.render(&program, RenderTarget::Screen);

    let draws = device.draws();
    assert_eq!(draws.len(), 1);
    let draw = &draws[0];
    assert_eq!(draw.index_count, 3);
    assert_eq!(draw.index_format, IndexFormat::Uint16);
    assert_eq!(draw.topology, Topology::Triangles);
    assert_eq!(draw.attributes.len(), 2);
    let position_attribute = draw
        .attributes
        .iter()
        .find(|attribute| attribute.location == position)
        .expect("positions wired");
    let uv_attribute = draw
        .attributes
        .iter()
        .find(|attribute| attribute.location == uv)
        .expect("uvs wired");
    assert_eq!((position_attribute.components, uv_attribute.components), (3, 2));
    assert_ne!(position_attribute.offset, uv_attribute.offset);

    let vertex = device
        .buffer_contents(model.buffers().vertex())
        .expect("vertex buffer allocated");
    let uploaded = &vertex[position_attribute.offset as usize..][..VERTICES * 12];
    assert_eq!(uploaded, &triangle_bytes(&[])[..VERTICES * 12]);
}

#[test]
fn unarmed_model_draws_nothing() {
    let (device, gpu, mut program) = setup();
    let model = ModelRenderContext::new(&gpu);

    program.use_program();
    model.render(&program, RenderTarget::Screen);

    assert!(!model.is_armed());
    assert!(device.draws().is_empty());
}

#[test]
fn material_units_follow_the_program_textures() {
    let (device, gpu, mut program) = setup();
    let asset = textured_asset(albedo_image(Format::R8G8B8A8, 4));
    let mut model = ModelRenderContext::new(&gpu);
    let irradiance = gpu.create_texture();
    program.register_texture("uIrradianceMap", Texture::persistent(irradiance));

    model.upload_textures(&asset).expect("textures uploaded");
    model.arm(&mut program, &asset).expect("armed");
    program.use_program();
    model.render(&program, RenderTarget::Screen);

    assert_eq!(model.texture_count(), 1);
    assert_eq!(model.active_texture_count(), 1);
    let draw = device.draws().pop().expect("one draw");
    assert_eq!(draw.textures.len(), 2);
    assert_eq!((draw.textures[0].unit, draw.textures[0].texture), (0, irradiance));
    let albedo = draw.textures[1];
    assert_eq!(albedo.unit, 1);
    assert_eq!((albedo.group, albedo.binding), (1, 0));
    assert!(device.is_texture_live(albedo.texture));

    let mask = uniform_u32(&mut program, &draw.uniforms, "uTextureMask");
    assert_eq!(mask, 1);
}

#[test]
fn material_units_skip_registrations_without_a_sampler() {
    let (device, gpu, mut program) = setup();
    let asset = textured_asset(albedo_image(Format::R8G8B8A8, 4));
    let mut model = ModelRenderContext::new(&gpu);
    let stale = gpu.create_texture();
    let irradiance = gpu.create_texture();
    program.register_texture("uRetiredMap", Texture::persistent(stale));
    program.register_texture("uIrradianceMap", Texture::persistent(irradiance));

    model.upload_textures(&asset).expect("textures uploaded");
    model.arm(&mut program, &asset).expect("armed");
    program.use_program();
    model.render(&program, RenderTarget::Screen);

    let draw = device.draws().pop().expect("one draw");
    let units: Vec<u32> = draw.textures.iter().map(|binding| binding.unit).collect();
    assert_eq!(units, vec![1, 2]);
    assert_eq!(draw.textures[0].texture, irradiance);
}

#[test]
fn images_past_the_device_limit_are_rejected() {
    let device = Rc::new(HeadlessDevice::new().with_max_texture_dimension(1));
    let gpu: SharedGpu = device.clone();
    let asset = textured_asset(albedo_image(Format::R8G8B8A8, 4));
    let mut model = ModelRenderContext::new(&gpu);

    let err = model.upload_textures(&asset).expect_err("2x2 image on a 1x1 device");

    assert!(matches!(
        err,
        RenderError::TextureTooLarge { width: 2, height: 2, max: 1, .. }
    ));
    assert_eq!(model.texture_count(), 0);
    assert!(device.live_textures().is_empty());
}

#[test]
fn sixteen_bit_images_upload_as_eight_bit() {
    let (device, gpu, _program) = setup();
    let asset = textured_asset(albedo_image(Format::R16G16B16A16, 8));
    let mut model = ModelRenderContext::new(&gpu);

    model.upload_textures(&asset).expect("textures uploaded");

    let written: Vec<usize> = device
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            Command::WriteTexture { len, .. } => Some(len),
            _ => None,
        })
        .collect();
    assert_eq!(written, vec![2 * 2 * 4]);
}

#[test]
fn float_images_are_rejected() {
    let (_device, gpu, _program) = setup();
    let asset = textured_asset(albedo_image(Format::R32G32B32FLOAT, 12));
    let mut model = ModelRenderContext::new(&gpu);

    let err = model.upload_textures(&asset).expect_err("float image");

    assert!(matches!(err, RenderError::UnsupportedImageFormat { index: 0, .. }));
    assert_eq!(model.texture_count(), 0);
}

#[test]
fn non_indexed_primitives_get_sequential_indices() {
    let (device, gpu, mut program) = setup();
    let asset = asset(&document(None, None), triangle_bytes(&[]), Vec::new());
    let mut model = ModelRenderContext::new(&gpu);

    model.arm(&mut program, &asset).expect("armed");

    assert_eq!(model.index_count(), 3);
    assert_eq!(model.index_format(), Some(IndexFormat::Uint32));
    let contents = device
        .buffer_contents(model.buffers().index())
        .expect("index buffer allocated");
    let expected: Vec<u8> = bytemuck::cast_slice(&[0u32, 1, 2]).to_vec();
    assert_eq!(contents, expected);
}

#[test]
fn byte_indices_are_widened() {
    let (device, gpu, mut program) = setup();
    let indices = json!({ "bufferView": 2, "componentType": 5121, "count": 3, "type": "SCALAR" });
    let asset = asset(&document(Some(indices), None), triangle_bytes(&[2, 1, 0]), Vec::new());
    let mut model = ModelRenderContext::new(&gpu);

    model.arm(&mut program, &asset).expect("armed");

    assert_eq!(model.index_format(), Some(IndexFormat::Uint16));
    let contents = device
        .buffer_contents(model.buffers().index())
        .expect("index buffer allocated");
    let expected: Vec<u8> = bytemuck::cast_slice(&[2u16, 1, 0]).to_vec();
    assert_eq!(contents, expected);
}

#[test]
fn asset_without_scenes_is_an_error() {
    let (_device, gpu, mut program) = setup();
    let mut root = document(None, None);
    root.as_object_mut().expect("object").remove("scenes");
    root.as_object_mut().expect("object").remove("scene");
    let asset = asset(&root, triangle_bytes(&[]), Vec::new());
    let mut model = ModelRenderContext::new(&gpu);

    let err = model.arm(&mut program, &asset).expect_err("no scene");

    assert!(matches!(err, RenderError::Asset(_)));
    assert!(!model.is_armed());
}
