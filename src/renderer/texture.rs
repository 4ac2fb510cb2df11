use std::borrow::Cow;

use crate::error::{RenderError, Result};
use crate::gpu::{
    FilterMode, SamplerDesc, SharedGpu, TextureDesc, TextureFormat, TextureId, WrapMode,
};

/// A texture handle plus the ownership flag that decides who frees it.
///
/// Registries destroy non-persistent textures when they are dropped and
/// leave persistent ones alone, so a texture shared between several programs
/// must be registered as persistent everywhere except in its single owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texture {
    pub id: TextureId,
    pub persistent: bool,
}

impl Texture {
    pub fn owned(id: TextureId) -> Self {
        Self {
            id,
            persistent: false,
        }
    }

    pub fn persistent(id: TextureId) -> Self {
        Self {
            id,
            persistent: true,
        }
    }
}

/// Name → texture mapping that remembers registration order.
#[derive(Debug, Default)]
pub struct TextureRegistry {
    entries: Vec<(String, Texture)>,
}

impl TextureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Texture> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, texture)| *texture)
    }

    /// Installs `texture` under `name`. A previous entry keeps its position
    /// and is returned without being freed.
    pub fn insert(&mut self, name: &str, texture: Texture) -> Option<Texture> {
        match self.entries.iter_mut().find(|(entry, _)| entry == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, texture)),
            None => {
                self.entries.push((name.to_string(), texture));
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Texture)> + '_ {
        self.entries
            .iter()
            .map(|(name, texture)| (name.as_str(), *texture))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the registry, returning the textures it owned.
    pub fn take_owned(&mut self) -> Vec<TextureId> {
        self.entries
            .drain(..)
            .filter(|(_, texture)| !texture.persistent)
            .map(|(_, texture)| texture.id)
            .collect()
    }
}

/// A texture destroyed when this value is dropped.
pub struct OwnedTexture {
    gpu: SharedGpu,
    id: TextureId,
}

impl OwnedTexture {
    /// Creates a texture name and defines its storage in one step.
    pub fn allocate(gpu: &SharedGpu, desc: &TextureDesc) -> Self {
        let id = gpu.create_texture();
        gpu.allocate_texture(id, desc);
        Self {
            gpu: SharedGpu::clone(gpu),
            id,
        }
    }

    /// Allocates level 0 and fills it with `pixels`. Image data is never
    /// resampled, so an extent past the device limit is an error.
    pub fn upload(gpu: &SharedGpu, desc: &TextureDesc, pixels: &[u8]) -> Result<Self> {
        let max = gpu.max_texture_dimension();
        if desc.width > max || desc.height > max {
            return Err(RenderError::TextureTooLarge {
                label: desc.label.clone(),
                width: desc.width,
                height: desc.height,
                max,
            });
        }
        let texture = Self::allocate(gpu, desc);
        gpu.write_texture(texture.id, 0, pixels);
        Ok(texture)
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    /// Handle suitable for registering in a program that must not free it.
    pub fn shared(&self) -> Texture {
        Texture::persistent(self.id)
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.gpu.texture_size(self.id, 0)
    }
}

impl Drop for OwnedTexture {
    fn drop(&mut self) {
        self.gpu.destroy_texture(self.id);
    }
}

impl std::fmt::Debug for OwnedTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OwnedTexture").field(&self.id).finish()
    }
}

/// Picks a texture format for a decoded glTF image and returns its pixels in
/// that format. 16-bit channels are narrowed to 8 bits; float images are not
/// supported.
pub fn image_pixels(index: usize, image: &gltf::image::Data) -> Result<(TextureFormat, Cow<'_, [u8]>)> {
    use gltf::image::Format;

    let narrow = |pixels: &[u8]| -> Vec<u8> {
        // Little-endian u16 channels; keep the high byte.
        pixels.chunks_exact(2).map(|channel| channel[1]).collect()
    };

    let converted = match image.format {
        Format::R8 => (TextureFormat::R8, Cow::Borrowed(image.pixels.as_slice())),
        Format::R8G8 => (TextureFormat::Rg8, Cow::Borrowed(image.pixels.as_slice())),
        Format::R8G8B8 => (TextureFormat::Rgb8, Cow::Borrowed(image.pixels.as_slice())),
        Format::R8G8B8A8 => (TextureFormat::Rgba8, Cow::Borrowed(image.pixels.as_slice())),
        Format::R16 => (TextureFormat::R8, Cow::Owned(narrow(&image.pixels))),
        Format::R16G16 => (TextureFormat::Rg8, Cow::Owned(narrow(&image.pixels))),
        Format::R16G16B16 => (TextureFormat::Rgb8, Cow::Owned(narrow(&image.pixels))),
        Format::R16G16B16A16 => (TextureFormat::Rgba8, Cow::Owned(narrow(&image.pixels))),
        other => {
            return Err(RenderError::UnsupportedImageFormat {
                index,
                format: format!("{:?}", other),
            })
        }
    };
    Ok(converted)
}

/// Translates a glTF sampler into the device's sampler description.
pub fn sampler_from_gltf(sampler: &gltf::texture::Sampler<'_>) -> SamplerDesc {
    use gltf::texture::{MagFilter, MinFilter, WrappingMode};

    let wrap = |mode: WrappingMode| match mode {
        WrappingMode::ClampToEdge => WrapMode::ClampToEdge,
        WrappingMode::MirroredRepeat => WrapMode::MirroredRepeat,
        WrappingMode::Repeat => WrapMode::Repeat,
    };

    let mag_filter = match sampler.mag_filter() {
        Some(MagFilter::Nearest) => FilterMode::Nearest,
        Some(MagFilter::Linear) | None => FilterMode::Linear,
    };
    let (min_filter, mipmap_filter) = match sampler.min_filter() {
        Some(MinFilter::Nearest) | Some(MinFilter::NearestMipmapNearest) => {
            (FilterMode::Nearest, FilterMode::Nearest)
        }
        Some(MinFilter::NearestMipmapLinear) => (FilterMode::Nearest, FilterMode::Linear),
        Some(MinFilter::LinearMipmapNearest) => (FilterMode::Linear, FilterMode::Nearest),
        Some(MinFilter::Linear) | Some(MinFilter::LinearMipmapLinear) | None => {
            (FilterMode::Linear, FilterMode::Linear)
        }
    };

    SamplerDesc {
        wrap_s: wrap(sampler.wrap_s()),
        wrap_t: wrap(sampler.wrap_t()),
        min_filter,
        mag_filter,
        mipmap_filter,
    }
}
