use std::path::{Path, PathBuf};

use crate::error::{RenderError, Result};

/// A parsed glTF file with its buffers and images already decoded.
pub struct GltfAsset {
    pub path: PathBuf,
    pub document: gltf::Document,
    pub buffers: Vec<gltf::buffer::Data>,
    pub images: Vec<gltf::image::Data>,
}

impl GltfAsset {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading glTF model {:?}", path);
        let (document, buffers, images) =
            gltf::import(path).map_err(|source| RenderError::Gltf {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!(
            "Loaded {:?}: {} meshes, {} materials, {} textures",
            path,
            document.meshes().len(),
            document.materials().len(),
            document.textures().len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            document,
            buffers,
            images,
        })
    }

    /// Builds an asset from already decoded parts.
    pub fn from_parts(
        document: gltf::Document,
        buffers: Vec<gltf::buffer::Data>,
        images: Vec<gltf::image::Data>,
    ) -> Self {
        Self {
            path: PathBuf::new(),
            document,
            buffers,
            images,
        }
    }
}
