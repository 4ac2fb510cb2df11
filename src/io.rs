use std::path::Path;

use half::f16;
use rayon::prelude::*;

use crate::error::{RenderError, Result};

/// A decoded panoramic image: `width * height` RGB triples of linear floats,
/// row major from the top row.
#[derive(Debug, Clone, PartialEq)]
pub struct HdrImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl HdrImage {
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(RenderError::Asset(format!(
                "HDR image of {}x{} needs {} floats, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Uniformly colored image, handy for tests and placeholders.
    pub fn solid(width: u32, height: u32, color: [f32; 3]) -> Self {
        let count = width as usize * height as usize;
        Self {
            width,
            height,
            pixels: color.iter().copied().cycle().take(count * 3).collect(),
        }
    }

    /// Pixels as RGBA half floats, the layout of an `Rgba16Float` upload.
    pub fn to_rgba16f_bytes(&self) -> Vec<u8> {
        let texels: Vec<[u16; 4]> = self
            .pixels
            .par_chunks_exact(3)
            .map(|rgb| {
                [
                    f16::from_f32(rgb[0]).to_bits(),
                    f16::from_f32(rgb[1]).to_bits(),
                    f16::from_f32(rgb[2]).to_bits(),
                    f16::ONE.to_bits(),
                ]
            })
            .collect();
        bytemuck::cast_slice(&texels).to_vec()
    }
}

/// Decodes a Radiance HDR (or any float-capable format `image` knows).
pub fn load_hdr(path: &Path) -> Result<HdrImage> {
    let image = image::open(path)
        .map_err(|source| RenderError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb32f();

    let (width, height) = image.dimensions();
    log::info!("Loaded environment {:?} ({}x{})", path, width, height);
    HdrImage::new(width, height, image.into_raw())
}

pub fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`read_text`], but a missing file is `Ok(None)`.
pub fn read_optional_text(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RenderError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
