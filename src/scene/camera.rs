use glam::{Mat4, Vec2, Vec3};

#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    pub fn position(&self) -> Vec3 {
        self.eye
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 0.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
        }
    }
}

/// Perspective projection, recomputed only when the viewport changes.
#[derive(Clone, Copy, Debug)]
pub struct Projection {
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
    aspect: f32,
    matrix: Mat4,
    inverse: Mat4,
}

impl Projection {
    pub fn new(fov_y_radians: f32, near: f32, far: f32, width: u32, height: u32) -> Self {
        let mut projection = Self {
            fov_y_radians,
            near,
            far,
            aspect: 1.0,
            matrix: Mat4::IDENTITY,
            inverse: Mat4::IDENTITY,
        };
        projection.resize(width, height);
        projection
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.aspect = width.max(1) as f32 / height.max(1) as f32;
        self.matrix = Mat4::perspective_rh(self.fov_y_radians, self.aspect, self.near, self.far);
        self.inverse = self.matrix.inverse();
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn matrix(&self) -> Mat4 {
        self.matrix
    }

    pub fn inverse(&self) -> Mat4 {
        self.inverse
    }
}

/// Per-frame camera state handed to every pass that draws to the screen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameData {
    pub view: Mat4,
    pub projection: Mat4,
    pub inverse_projection: Mat4,
    pub eye: Vec3,
    pub screen_size: Vec2,
}

impl FrameData {
    pub fn new(camera: &Camera, projection: &Projection, screen_size: Vec2) -> Self {
        Self {
            view: camera.view(),
            projection: projection.matrix(),
            inverse_projection: projection.inverse(),
            eye: camera.position(),
            screen_size,
        }
    }
}
