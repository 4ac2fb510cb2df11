use std::path::Path;

use glam::{Vec2, Vec4};

use crate::error::Result;
use crate::gpu::{RenderTarget, SharedGpu, TextureId};
use crate::renderer::{QuadRenderContext, RenderContext, ShaderProgram, Texture};

pub const PREVIEW_VERTEX_SHADER: &str = "preview.vert.wgsl";
pub const PREVIEW_FRAGMENT_SHADER: &str = "preview.frag.wgsl";

/// Thumbnail width in pixels.
const PREVIEW_WIDTH: f32 = 256.0;

/// Draws textures as small thumbnails along the bottom of the screen.
pub struct TexturePreview {
    program: ShaderProgram,
    quad: QuadRenderContext,
}

impl TexturePreview {
    pub fn new(gpu: &SharedGpu, shader_dir: &Path) -> Result<Self> {
        let mut program = ShaderProgram::from_files(
            gpu,
            shader_dir.join(PREVIEW_VERTEX_SHADER),
            shader_dir.join(PREVIEW_FRAGMENT_SHADER),
        )?;
        let quad = QuadRenderContext::new(gpu, &mut program);
        Ok(Self { program, quad })
    }

    /// Draws `texture` into thumbnail slot `index`.
    pub fn draw(&mut self, texture: TextureId, index: u32, screen: Vec2, exposure: f32) {
        let rect = preview_rect(index, screen, PREVIEW_WIDTH);
        self.program
            .register_texture("uTexture", Texture::persistent(texture));
        self.program.uniform_vec4("uRect", Vec4::from_array(rect));
        self.program.uniform_f32("uExposure", exposure);
        self.program.use_program();
        self.quad.render(&self.program, RenderTarget::Screen);
    }
}

/// Rectangle `[x, y, width, height]` in normalized device coordinates of the
/// thumbnail `index` slots in from the bottom left. Thumbnails are 2:1 like
/// the equirectangular maps they show.
pub fn preview_rect(index: u32, screen: Vec2, width_px: f32) -> [f32; 4] {
    let width = 2.0 * width_px / screen.x.max(1.0);
    let height = width_px / screen.y.max(1.0);
    let margin = 0.02;
    let x = -1.0 + margin + index as f32 * (width + margin);
    let y = -1.0 + margin;
    [x, y, width, height]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnails_keep_two_to_one_aspect() {
        let screen = Vec2::new(1000.0, 500.0);
        let [_, _, width, height] = preview_rect(0, screen, 200.0);
        assert!((width * screen.x - 2.0 * height * screen.y).abs() < 1e-3);
    }

    #[test]
    fn thumbnails_do_not_overlap() {
        let screen = Vec2::new(1000.0, 500.0);
        let first = preview_rect(0, screen, 200.0);
        let second = preview_rect(1, screen, 200.0);
        assert!(second[0] > first[0] + first[2]);
    }
}
