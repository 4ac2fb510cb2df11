//! Crate-wide error type.
//!
//! Only fatal conditions end up here. Recoverable GPU problems (missing
//! uniforms, incomplete framebuffers) are logged where they happen and the
//! affected operation is skipped.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to import glTF {path:?}: {source}")]
    Gltf {
        path: PathBuf,
        #[source]
        source: gltf::Error,
    },

    #[error("asset error: {0}")]
    Asset(String),

    #[error("image {index} has unsupported pixel format {format}")]
    UnsupportedImageFormat { index: usize, format: String },

    #[error("texture '{label}' is {width}x{height}, the device allows at most {max}")]
    TextureTooLarge {
        label: String,
        width: u32,
        height: u32,
        max: u32,
    },

    #[error("shader program '{label}' failed to link:\n{log}")]
    ShaderLink { label: String, log: String },

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("surface error: {0}")]
    Surface(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;
