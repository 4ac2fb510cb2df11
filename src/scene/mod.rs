pub mod camera;
pub mod trackball;

pub use camera::{Camera, FrameData, Projection};
pub use trackball::{MouseButton, TrackballControls};
