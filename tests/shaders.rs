//! Every shipped program must link and expose the names the renderer binds.

use std::path::PathBuf;
use std::rc::Rc;

use ibl_viewer::gpu::{HeadlessDevice, SharedGpu, UniformLocation};
use ibl_viewer::renderer::ShaderProgram;

fn link(vertex: &str, fragment: &str) -> ShaderProgram {
    let device = Rc::new(HeadlessDevice::new());
    let gpu: SharedGpu = device;
    let dir = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders"));
    ShaderProgram::from_files(&gpu, dir.join(vertex), dir.join(fragment))
        .unwrap_or_else(|err| panic!("{vertex} + {fragment}: {err}"))
}

fn assert_block_member(program: &mut ShaderProgram, name: &str) {
    assert!(
        matches!(program.ensure_uniform(name), Some(UniformLocation::Block { .. })),
        "{} has no uniform {}",
        program.label(),
        name
    );
}

fn assert_texture(program: &mut ShaderProgram, name: &str) {
    assert!(
        matches!(program.ensure_uniform(name), Some(UniformLocation::Texture { group: 1, .. })),
        "{} has no texture {}",
        program.label(),
        name
    );
}

#[test]
fn convolution_programs_link() {
    let mut irradiance = link("quad.vert.wgsl", "irradiance.frag.wgsl");
    assert_eq!(irradiance.ensure_attrib("aPosition"), Some(0));
    assert_block_member(&mut irradiance, "uSampleDelta");
    assert_texture(&mut irradiance, "uEnvironment");

    let mut specular = link("quad.vert.wgsl", "specular.frag.wgsl");
    assert_block_member(&mut specular, "uRoughness");
    assert_block_member(&mut specular, "uSampleCount");
    assert_texture(&mut specular, "uEnvironment");

    let mut brdf = link("quad.vert.wgsl", "brdf.frag.wgsl");
    assert_block_member(&mut brdf, "uSampleCount");
    assert_eq!(brdf.ensure_uniform("uEnvironment"), None);
}

#[test]
fn skybox_program_links() {
    let mut skybox = link("quad.vert.wgsl", "skybox.frag.wgsl");
    for name in ["uInvP", "uV", "uExposure", "uLod"] {
        assert_block_member(&mut skybox, name);
    }
    assert_texture(&mut skybox, "uEnvironment");
}

#[test]
fn preview_program_links() {
    let mut preview = link("preview.vert.wgsl", "preview.frag.wgsl");
    assert_eq!(preview.ensure_attrib("aPosition"), Some(0));
    assert_block_member(&mut preview, "uRect");
    assert_block_member(&mut preview, "uExposure");
    assert_texture(&mut preview, "uTexture");
}

#[test]
fn model_program_links() {
    let mut model = link("model.vert.wgsl", "model.frag.wgsl");
    for attribute in ["POSITION", "NORMAL", "TEXCOORD_0"] {
        assert!(model.ensure_attrib(attribute).is_some(), "missing {attribute}");
    }
    for name in [
        "uP",
        "uV",
        "uCameraPos",
        "uExposure",
        "uBaseColorFactor",
        "uEmissiveFactor",
        "uSpecularLevels",
        "uMetallicRoughnessFactor",
        "uTextureMask",
    ] {
        assert_block_member(&mut model, name);
    }
    for name in [
        "uAlbedoMap",
        "uMetallicRoughness",
        "uNormalMap",
        "uEmissiveMap",
        "uOcclusionMap",
        "uIrradianceMap",
        "uSpecularMap",
        "uBrdfLut",
    ] {
        assert_texture(&mut model, name);
    }
}
