//! Trackball camera controller: drag to orbit the target, right-drag to pan,
//! scroll to zoom. Motion keeps easing out after release unless
//! `static_moving` is set.

use glam::{Quat, Vec2, Vec3};

use super::Camera;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Rotate,
    Pan,
}

#[derive(Debug, Clone)]
pub struct TrackballControls {
    pub enabled: bool,
    pub rotate_speed: f32,
    pub zoom_speed: f32,
    pub pan_speed: f32,
    pub no_rotate: bool,
    pub no_zoom: bool,
    pub no_pan: bool,
    pub no_roll: bool,
    pub static_moving: bool,
    pub dynamic_damping_factor: f32,
    pub min_distance: f32,
    pub max_distance: f32,

    target: Vec3,
    screen: Vec2,
    state: State,
    rotate_start: Vec3,
    rotate_end: Vec3,
    zoom_start: Vec2,
    zoom_end: Vec2,
    pan_start: Vec2,
    pan_end: Vec2,
}

impl TrackballControls {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            enabled: true,
            rotate_speed: 1.0,
            zoom_speed: 1.2,
            pan_speed: 0.3,
            no_rotate: false,
            no_zoom: false,
            no_pan: false,
            no_roll: false,
            static_moving: false,
            dynamic_damping_factor: 0.2,
            min_distance: 0.0,
            max_distance: f32::INFINITY,
            target: Vec3::ZERO,
            screen: Vec2::new(width.max(1) as f32, height.max(1) as f32),
            state: State::Idle,
            rotate_start: Vec3::ZERO,
            rotate_end: Vec3::ZERO,
            zoom_start: Vec2::ZERO,
            zoom_end: Vec2::ZERO,
            pan_start: Vec2::ZERO,
            pan_end: Vec2::ZERO,
        }
    }

    pub fn target(&self) -> Vec3 {
        self.target
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.screen = Vec2::new(width.max(1) as f32, height.max(1) as f32);
    }

    pub fn mouse_down(&mut self, camera: &Camera, button: MouseButton, cursor: Vec2) {
        if !self.enabled {
            return;
        }
        if self.state == State::Idle {
            self.state = match button {
                MouseButton::Right => State::Pan,
                MouseButton::Left | MouseButton::Middle => State::Rotate,
            };
        }
        match self.state {
            State::Rotate if !self.no_rotate => {
                self.rotate_start = self.project_on_ball(camera, cursor);
                self.rotate_end = self.rotate_start;
            }
            State::Pan if !self.no_pan => {
                self.pan_start = self.mouse_on_screen(cursor);
                self.pan_end = self.pan_start;
            }
            _ => {}
        }
    }

    pub fn mouse_move(&mut self, camera: &Camera, cursor: Vec2) {
        if !self.enabled {
            return;
        }
        match self.state {
            State::Rotate if !self.no_rotate => {
                self.rotate_end = self.project_on_ball(camera, cursor);
            }
            State::Pan if !self.no_pan => {
                self.pan_end = self.mouse_on_screen(cursor);
            }
            _ => {}
        }
    }

    pub fn mouse_up(&mut self) {
        if self.enabled {
            self.state = State::Idle;
        }
    }

    /// `lines` is the vertical scroll amount in lines, positive away from
    /// the user.
    pub fn mouse_wheel(&mut self, lines: f32) {
        if !self.enabled {
            return;
        }
        self.zoom_start.y += lines / 3.0 * 0.05;
    }

    /// Applies pending rotation, zoom and pan to `camera`.
    pub fn update(&mut self, camera: &mut Camera) {
        let mut eye = camera.eye - self.target;

        if !self.no_rotate {
            self.rotate(camera, &mut eye);
        }
        if !self.no_zoom {
            self.zoom(&mut eye);
        }
        if !self.no_pan {
            self.pan(camera, eye);
        }

        camera.eye = self.target + eye;
        self.check_distances(camera, eye);
        camera.target = self.target;
    }

    fn rotate(&mut self, camera: &mut Camera, eye: &mut Vec3) {
        let lengths = self.rotate_start.length() * self.rotate_end.length();
        if lengths == 0.0 {
            return;
        }
        let angle = (self.rotate_start.dot(self.rotate_end) / lengths)
            .clamp(-1.0, 1.0)
            .acos();
        if angle.is_nan() || angle == 0.0 {
            return;
        }
        let axis = self.rotate_start.cross(self.rotate_end).normalize_or_zero();
        if axis == Vec3::ZERO {
            return;
        }

        let angle = angle * self.rotate_speed;
        let quaternion = Quat::from_axis_angle(axis, -angle);
        *eye = quaternion * *eye;
        camera.up = quaternion * camera.up;
        self.rotate_end = quaternion * self.rotate_end;

        if self.static_moving {
            self.rotate_start = self.rotate_end;
        } else {
            let damping =
                Quat::from_axis_angle(axis, angle * (self.dynamic_damping_factor - 1.0));
            self.rotate_start = damping * self.rotate_start;
        }
    }

    fn zoom(&mut self, eye: &mut Vec3) {
        let factor = 1.0 + (self.zoom_end.y - self.zoom_start.y) * self.zoom_speed;
        if factor == 1.0 || factor <= 0.0 {
            return;
        }
        *eye *= factor;
        if self.static_moving {
            self.zoom_start = self.zoom_end;
        } else {
            self.zoom_start.y += (self.zoom_end.y - self.zoom_start.y) * self.dynamic_damping_factor;
        }
    }

    fn pan(&mut self, camera: &mut Camera, eye: Vec3) {
        let change = self.pan_end - self.pan_start;
        if change.length_squared() == 0.0 {
            return;
        }
        let change = change * eye.length() * self.pan_speed;
        let side = eye.cross(camera.up).normalize_or_zero() * change.x;
        let pan = side + camera.up.normalize_or_zero() * change.y;

        camera.eye += pan;
        self.target += pan;

        if self.static_moving {
            self.pan_start = self.pan_end;
        } else {
            self.pan_start += (self.pan_end - self.pan_start) * self.dynamic_damping_factor;
        }
    }

    fn check_distances(&self, camera: &mut Camera, eye: Vec3) {
        if self.no_zoom && self.no_pan {
            return;
        }
        if camera.eye.length_squared() > self.max_distance * self.max_distance {
            camera.eye = camera.eye.normalize_or_zero() * self.max_distance;
        }
        if eye.length_squared() < self.min_distance * self.min_distance {
            camera.eye = self.target + eye.normalize_or_zero() * self.min_distance;
        }
    }

    fn mouse_on_screen(&self, cursor: Vec2) -> Vec2 {
        cursor / self.screen
    }

    fn project_on_ball(&self, camera: &Camera, cursor: Vec2) -> Vec3 {
        let half = self.screen * 0.5;
        let mut on_ball = Vec3::new(
            (cursor.x - half.x) / half.x,
            (half.y - cursor.y) / half.y,
            0.0,
        );
        let length = on_ball.length();

        if self.no_roll {
            on_ball.z = if length < std::f32::consts::FRAC_1_SQRT_2 {
                (1.0 - length * length).sqrt()
            } else {
                0.5 / length
            };
        } else if length > 1.0 {
            on_ball = on_ball.normalize();
        } else {
            on_ball.z = (1.0 - length * length).sqrt();
        }

        let to_target = self.target - camera.eye;
        let up = camera.up.normalize_or_zero();
        let side = camera.up.cross(to_target).normalize_or_zero();

        up * on_ball.y + side * on_ball.x + to_target.normalize_or_zero() * on_ball.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrolling_moves_the_camera_closer() {
        let mut camera = Camera::default();
        let mut controls = TrackballControls::new(800, 600);
        controls.static_moving = true;

        controls.mouse_wheel(3.0);
        controls.update(&mut camera);

        assert!(camera.eye.length() < 5.0);
        assert!(camera.eye.length() > 0.0);
    }

    #[test]
    fn dragging_orbits_at_constant_distance() {
        let mut camera = Camera::default();
        let mut controls = TrackballControls::new(800, 600);
        controls.static_moving = true;

        controls.mouse_down(&camera, MouseButton::Left, Vec2::new(400.0, 300.0));
        controls.mouse_move(&camera, Vec2::new(500.0, 300.0));
        controls.update(&mut camera);
        controls.mouse_up();

        assert!((camera.eye.length() - 5.0).abs() < 1e-4);
        assert!(camera.eye.x.abs() > 1e-3);
        assert_eq!(camera.target, Vec3::ZERO);
    }

    #[test]
    fn right_drag_pans_target_and_eye_together() {
        let mut camera = Camera::default();
        let mut controls = TrackballControls::new(800, 600);
        controls.static_moving = true;

        controls.mouse_down(&camera, MouseButton::Right, Vec2::new(400.0, 300.0));
        controls.mouse_move(&camera, Vec2::new(480.0, 300.0));
        controls.update(&mut camera);

        assert!(controls.target().x.abs() > 1e-3);
        let offset = camera.eye - camera.target;
        assert!(offset.abs_diff_eq(Vec3::new(0.0, 0.0, 5.0), 1e-4));
    }

    #[test]
    fn max_distance_clamps_zoom() {
        let mut camera = Camera::default();
        let mut controls = TrackballControls::new(800, 600);
        controls.static_moving = true;
        controls.max_distance = 6.0;

        controls.mouse_wheel(-60.0);
        controls.update(&mut camera);

        assert!(camera.eye.length() <= 6.0 + 1e-4);
    }

    #[test]
    fn disabled_controls_ignore_input() {
        let mut camera = Camera::default();
        let mut controls = TrackballControls::new(800, 600);
        controls.enabled = false;

        controls.mouse_wheel(30.0);
        controls.update(&mut camera);

        assert_eq!(camera.eye, Vec3::new(0.0, 0.0, 5.0));
    }
}
