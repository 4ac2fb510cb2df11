pub mod environment_map;
pub mod model;
pub mod preview;
pub mod quad;
pub mod render_context;
pub mod shader_program;
pub mod texture;

pub use environment_map::{Background, EnvironmentMap};
pub use model::ModelRenderContext;
pub use preview::TexturePreview;
pub use quad::QuadRenderContext;
pub use render_context::{BufferPair, IndexedDraw, RenderContext};
pub use shader_program::ShaderProgram;
pub use texture::{OwnedTexture, Texture, TextureRegistry};
