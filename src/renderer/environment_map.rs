//! Panoramic HDR environment and the lighting maps derived from it.
//!
//! Every derived map is produced the same way: allocate the destination,
//! attach one of its levels to a scratch framebuffer with a matching depth
//! renderbuffer, verify completeness, then draw a full-screen quad with a
//! convolution program that reads the equirectangular source.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::gpu::{
    mip_chain_len, FramebufferId, RenderTarget, RenderbufferId, SamplerDesc, SharedGpu,
    TextureDesc, TextureFormat, TextureId,
};
use crate::io::{self, HdrImage};
use crate::renderer::{OwnedTexture, QuadRenderContext, RenderContext, ShaderProgram};
use crate::scene::FrameData;

pub const QUAD_VERTEX_SHADER: &str = "quad.vert.wgsl";
pub const SKYBOX_SHADER: &str = "skybox.frag.wgsl";
pub const IRRADIANCE_SHADER: &str = "irradiance.frag.wgsl";
pub const SPECULAR_SHADER: &str = "specular.frag.wgsl";
pub const BRDF_SHADER: &str = "brdf.frag.wgsl";

/// Sampler name every environment-reading program uses for its input.
pub const ENVIRONMENT_UNIFORM: &str = "uEnvironment";

const IRRADIANCE_SAMPLE_DELTA: f32 = 0.05;
const SPECULAR_SAMPLE_COUNT: u32 = 1024;
const BRDF_SAMPLE_COUNT: u32 = 1024;

/// Which map the skybox shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Background {
    #[default]
    Source,
    Irradiance,
    Specular,
}

impl Background {
    pub fn next(self) -> Self {
        match self {
            Background::Source => Background::Irradiance,
            Background::Irradiance => Background::Specular,
            Background::Specular => Background::Source,
        }
    }
}

/// Framebuffer plus depth renderbuffer that live for one offscreen draw.
struct ScratchTarget<'a> {
    gpu: &'a SharedGpu,
    framebuffer: FramebufferId,
    depth: RenderbufferId,
}

impl<'a> ScratchTarget<'a> {
    fn attach(gpu: &'a SharedGpu, color: TextureId, level: u32, width: u32, height: u32) -> Self {
        let depth = gpu.create_renderbuffer(width, height);
        let framebuffer = gpu.create_framebuffer(color, level, depth);
        Self {
            gpu,
            framebuffer,
            depth,
        }
    }

    fn target(&self) -> RenderTarget {
        RenderTarget::Framebuffer(self.framebuffer)
    }
}

impl Drop for ScratchTarget<'_> {
    fn drop(&mut self) {
        self.gpu.destroy_framebuffer(self.framebuffer);
        self.gpu.destroy_renderbuffer(self.depth);
    }
}

pub struct EnvironmentMap {
    gpu: SharedGpu,
    shader_dir: PathBuf,
    source: OwnedTexture,
    irradiance: Option<OwnedTexture>,
    specular: Option<OwnedTexture>,
    specular_levels: u32,
    brdf_lut: Option<OwnedTexture>,
    skybox: ShaderProgram,
    quad: QuadRenderContext,
    background: Background,
    exposure: f32,
}

impl EnvironmentMap {
    pub fn load(gpu: &SharedGpu, path: impl AsRef<Path>, shader_dir: impl AsRef<Path>) -> Result<Self> {
        let image = io::load_hdr(path.as_ref())?;
        Self::from_hdr(gpu, &image, shader_dir)
    }

    /// Uploads `image` as a half-float, edge-clamped texture and builds the
    /// skybox program that displays it.
    pub fn from_hdr(gpu: &SharedGpu, image: &HdrImage, shader_dir: impl AsRef<Path>) -> Result<Self> {
        let shader_dir = shader_dir.as_ref().to_path_buf();

        let desc = TextureDesc::new(
            "environment",
            image.width,
            image.height,
            TextureFormat::Rgba16Float,
        )
        .with_sampler(SamplerDesc::clamped());
        let source = OwnedTexture::upload(gpu, &desc, &image.to_rgba16f_bytes())?;

        let mut skybox = ShaderProgram::from_files(
            gpu,
            shader_dir.join(QUAD_VERTEX_SHADER),
            shader_dir.join(SKYBOX_SHADER),
        )?;
        skybox.register_texture(ENVIRONMENT_UNIFORM, source.shared());
        let quad = QuadRenderContext::new(gpu, &mut skybox);

        Ok(Self {
            gpu: SharedGpu::clone(gpu),
            shader_dir,
            source,
            irradiance: None,
            specular: None,
            specular_levels: 0,
            brdf_lut: None,
            skybox,
            quad,
            background: Background::Source,
            exposure: 1.0,
        })
    }

    pub fn source(&self) -> TextureId {
        self.source.id()
    }

    pub fn source_size(&self) -> Option<(u32, u32)> {
        self.source.size()
    }

    pub fn irradiance(&self) -> Option<TextureId> {
        self.irradiance.as_ref().map(OwnedTexture::id)
    }

    pub fn irradiance_size(&self) -> Option<(u32, u32)> {
        self.irradiance.as_ref().and_then(OwnedTexture::size)
    }

    pub fn specular(&self) -> Option<TextureId> {
        self.specular.as_ref().map(OwnedTexture::id)
    }

    pub fn specular_levels(&self) -> u32 {
        self.specular_levels
    }

    pub fn brdf_lut(&self) -> Option<TextureId> {
        self.brdf_lut.as_ref().map(OwnedTexture::id)
    }

    pub fn background(&self) -> Background {
        self.background
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        self.exposure = exposure;
    }

    /// Diffuse convolution of the source. `size` defaults to the source
    /// extent. Returns whether the map was produced by this call.
    pub fn precompute_irradiance(&mut self, size: Option<(u32, u32)>) -> Result<bool> {
        if self.irradiance.is_some() {
            log::debug!("Irradiance map already present");
            return Ok(false);
        }
        let Some((width, height)) = size.or_else(|| self.source.size()) else {
            log::warn!("Environment source has no storage, skipping irradiance");
            return Ok(false);
        };

        log::info!("Precomputing irradiance map ({}x{})", width, height);
        let desc = TextureDesc::new("irradiance", width, height, TextureFormat::Rgba16Float)
            .with_sampler(SamplerDesc::clamped())
            .render_target();
        let destination = OwnedTexture::allocate(&self.gpu, &desc);

        let drawn = self.convolve(IRRADIANCE_SHADER, &destination, 1, true, |program, _| {
            program.uniform_f32("uSampleDelta", IRRADIANCE_SAMPLE_DELTA);
        })?;
        if drawn {
            self.irradiance = Some(destination);
        }
        Ok(drawn)
    }

    /// GGX prefiltered mip chain; level `i` is convolved with roughness
    /// `i / (levels - 1)`.
    pub fn precompute_specular(&mut self, size: Option<(u32, u32)>, levels: u32) -> Result<bool> {
        if self.specular.is_some() {
            log::debug!("Specular map already present");
            return Ok(false);
        }
        let Some((width, height)) = size.or_else(|| self.source.size()) else {
            log::warn!("Environment source has no storage, skipping specular prefilter");
            return Ok(false);
        };
        let max = self.gpu.max_texture_dimension();
        let chain = mip_chain_len(width.min(max), height.min(max));
        if levels > chain {
            log::warn!(
                "{}x{} specular map holds {} levels, not {}",
                width,
                height,
                chain,
                levels
            );
        }
        let levels = levels.clamp(1, chain);

        log::info!(
            "Precomputing specular map ({}x{}, {} levels)",
            width,
            height,
            levels
        );
        let desc = TextureDesc::new("specular", width, height, TextureFormat::Rgba16Float)
            .with_levels(levels)
            .with_sampler(SamplerDesc::clamped())
            .render_target();
        let destination = OwnedTexture::allocate(&self.gpu, &desc);

        let drawn = self.convolve(SPECULAR_SHADER, &destination, levels, true, |program, level| {
            program.uniform_f32("uRoughness", roughness_for_level(level, levels));
            program.uniform_u32("uSampleCount", SPECULAR_SAMPLE_COUNT);
        })?;
        if drawn {
            self.specular = Some(destination);
            self.specular_levels = levels;
        }
        Ok(drawn)
    }

    /// Split-sum BRDF integration table, `size` x `size`, red = scale and
    /// green = bias.
    pub fn precompute_brdf_lut(&mut self, size: u32) -> Result<bool> {
        if self.brdf_lut.is_some() {
            log::debug!("BRDF LUT already present");
            return Ok(false);
        }

        log::info!("Precomputing BRDF LUT ({}x{})", size, size);
        let desc = TextureDesc::new("brdf lut", size, size, TextureFormat::Rg16Float)
            .with_sampler(SamplerDesc::clamped())
            .render_target();
        let destination = OwnedTexture::allocate(&self.gpu, &desc);

        let drawn = self.convolve(BRDF_SHADER, &destination, 1, false, |program, _| {
            program.uniform_u32("uSampleCount", BRDF_SAMPLE_COUNT);
        })?;
        if drawn {
            self.brdf_lut = Some(destination);
        }
        Ok(drawn)
    }

    /// Runs `fragment` over every level of `destination`. Any incomplete
    /// level aborts the pass; the caller then drops the destination.
    fn convolve(
        &self,
        fragment: &str,
        destination: &OwnedTexture,
        levels: u32,
        reads_source: bool,
        mut configure: impl FnMut(&mut ShaderProgram, u32),
    ) -> Result<bool> {
        let mut program = ShaderProgram::from_files(
            &self.gpu,
            self.shader_dir.join(QUAD_VERTEX_SHADER),
            self.shader_dir.join(fragment),
        )?;
        if reads_source {
            program.register_texture(ENVIRONMENT_UNIFORM, self.source.shared());
        }
        let quad = QuadRenderContext::new(&self.gpu, &mut program);

        for level in 0..levels {
            let Some((width, height)) = self.gpu.texture_size(destination.id(), level) else {
                log::warn!("{}: level {} has no storage, skipping pass", fragment, level);
                return Ok(false);
            };

            let scratch = ScratchTarget::attach(&self.gpu, destination.id(), level, width, height);
            let status = self.gpu.framebuffer_status(scratch.framebuffer);
            if !status.is_complete() {
                log::warn!(
                    "{}: offscreen framebuffer for level {} ({}x{}) is incomplete ({}), skipping pass",
                    fragment,
                    level,
                    width,
                    height,
                    status
                );
                return Ok(false);
            }

            log::debug!("{}: rendering level {} ({}x{})", fragment, level, width, height);
            configure(&mut program, level);
            program.use_program();
            self.gpu.clear(scratch.target(), [0.0, 0.0, 0.0, 1.0]);
            quad.render(&program, scratch.target());
        }
        Ok(true)
    }

    /// Registers the derived maps that exist into a lighting program. The
    /// environment keeps ownership.
    pub fn bind_lighting(&self, program: &mut ShaderProgram) {
        if let Some(irradiance) = &self.irradiance {
            program.register_texture("uIrradianceMap", irradiance.shared());
        }
        if let Some(specular) = &self.specular {
            program.register_texture("uSpecularMap", specular.shared());
            program.uniform_f32("uSpecularLevels", self.specular_levels as f32);
        }
        if let Some(brdf_lut) = &self.brdf_lut {
            program.register_texture("uBrdfLut", brdf_lut.shared());
        }
    }

    /// Switches the skybox to `background`, falling back to the source when
    /// that map has not been computed.
    pub fn set_background(&mut self, background: Background) {
        let texture = match background {
            Background::Source => Some(&self.source),
            Background::Irradiance => self.irradiance.as_ref(),
            Background::Specular => self.specular.as_ref(),
        };
        match texture {
            Some(texture) => {
                self.skybox
                    .register_texture(ENVIRONMENT_UNIFORM, texture.shared());
                self.background = background;
            }
            None => {
                log::warn!("{:?} map not computed, showing source", background);
                self.skybox
                    .register_texture(ENVIRONMENT_UNIFORM, self.source.shared());
                self.background = Background::Source;
            }
        }
        log::info!("Background: {:?}", self.background);
    }

    /// Draws the selected background behind everything else on screen.
    pub fn render(&mut self, frame: &FrameData) {
        let lod = match self.background {
            Background::Specular => (self.specular_levels.saturating_sub(1) as f32 * 0.5).floor(),
            Background::Source | Background::Irradiance => 0.0,
        };
        self.skybox.uniform_mat4("uInvP", frame.inverse_projection);
        self.skybox.uniform_mat4("uV", frame.view);
        self.skybox.uniform_f32("uExposure", self.exposure);
        self.skybox.uniform_f32("uLod", lod);
        self.skybox.use_program();
        self.quad.render(&self.skybox, RenderTarget::Screen);
    }

    pub fn skybox(&self) -> &ShaderProgram {
        &self.skybox
    }
}

impl std::fmt::Debug for EnvironmentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentMap")
            .field("source", &self.source)
            .field("irradiance", &self.irradiance)
            .field("specular", &self.specular)
            .field("brdf_lut", &self.brdf_lut)
            .field("background", &self.background)
            .finish()
    }
}

/// Roughness convolved into mip `level` of a chain of `levels`.
pub fn roughness_for_level(level: u32, levels: u32) -> f32 {
    if levels <= 1 {
        return 0.0;
    }
    level as f32 / (levels - 1) as f32
}
