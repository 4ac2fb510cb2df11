//! Math behind the skybox and convolution shaders, mirrored in glam.
//!
//! Conventions used in this codebase:
//! - Right-handed view space (camera looks down -Z).
//! - Equirectangular u wraps around +Y starting at -X; v = 0 is straight up.
//! - Full-screen quad UVs have v = 0 on the top row.
//!
use std::f32::consts::{PI, TAU};

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use ibl_viewer::scene::{Camera, FrameData, Projection};

fn dir_to_equirect(dir: Vec3) -> Vec2 {
    let longitude = dir.z.atan2(dir.x) / TAU + 0.5;
    let latitude = dir.y.clamp(-1.0, 1.0).acos() / PI;
    Vec2::new(longitude, latitude)
}

fn equirect_to_dir(uv: Vec2) -> Vec3 {
    let phi = (uv.x - 0.5) * TAU;
    let theta = uv.y * PI;
    Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin())
}

fn ndc_to_uv(ndc: Vec2) -> Vec2 {
    Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5)
}

/// World direction seen through a quad fragment at `ndc`.
fn skybox_ray(ndc: Vec2, inverse_projection: Mat4, view: Mat4) -> Vec3 {
    let ray = inverse_projection * Vec4::new(ndc.x, ndc.y, 1.0, 1.0);
    let view_dir = ray.truncate() / ray.w;
    let rotation = Mat3::from_mat4(view);
    (rotation.transpose() * view_dir).normalize()
}

fn radical_inverse_vdc(value: u32) -> f32 {
    value.reverse_bits() as f32 * 2.328_306_4e-10
}

fn importance_sample_ggx(xi: Vec2, n: Vec3, roughness: f32) -> Vec3 {
    let a = roughness * roughness;
    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    let h = Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta);

    let up = if n.z.abs() < 0.999 { Vec3::Z } else { Vec3::X };
    let tangent = up.cross(n).normalize();
    let bitangent = n.cross(tangent);
    (tangent * h.x + bitangent * h.y + n * h.z).normalize()
}

fn approx_eq3(a: Vec3, b: Vec3, eps: f32) -> bool {
    (a - b).abs().max_element() <= eps
}

fn frame(camera: &Camera) -> FrameData {
    let projection = Projection::new(45f32.to_radians(), 0.1, 100.0, 800, 600);
    FrameData::new(camera, &projection, Vec2::new(800.0, 600.0))
}

#[test]
fn screen_center_looks_at_the_target() {
    let camera = Camera::default();
    let frame = frame(&camera);

    let ray = skybox_ray(Vec2::ZERO, frame.inverse_projection, frame.view);

    let expected = (camera.target - camera.eye).normalize();
    assert!(approx_eq3(ray, expected, 1e-4), "{:?} vs {:?}", ray, expected);
}

#[test]
fn skybox_ignores_camera_translation() {
    let near = Camera::default();
    let far = Camera {
        eye: near.eye + Vec3::new(30.0, -4.0, 12.0),
        target: near.target + Vec3::new(30.0, -4.0, 12.0),
        ..near
    };

    for ndc in [Vec2::new(0.5, 0.5), Vec2::new(-0.9, 0.2), Vec2::new(0.1, -0.7)] {
        let a = skybox_ray(ndc, frame(&near).inverse_projection, frame(&near).view);
        let b = skybox_ray(ndc, frame(&far).inverse_projection, frame(&far).view);
        assert!(approx_eq3(a, b, 1e-4), "ndc {:?}: {:?} vs {:?}", ndc, a, b);
    }
}

#[test]
fn top_of_screen_looks_upward() {
    let camera = Camera::default();
    let frame = frame(&camera);

    let top = skybox_ray(Vec2::new(0.0, 0.9), frame.inverse_projection, frame.view);
    let bottom = skybox_ray(Vec2::new(0.0, -0.9), frame.inverse_projection, frame.view);

    assert!(top.y > 0.0);
    assert!(bottom.y < 0.0);
}

#[test]
fn equirect_mapping_inverts() {
    let samples = [
        Vec2::new(0.25, 0.5),
        Vec2::new(0.5, 0.25),
        Vec2::new(0.75, 0.75),
        Vec2::new(0.1, 0.9),
    ];
    for &uv in &samples {
        let back = dir_to_equirect(equirect_to_dir(uv));
        assert!((uv - back).abs().max_element() < 1e-4, "{:?} -> {:?}", uv, back);
    }
}

#[test]
fn poles_map_to_top_and_bottom_rows() {
    assert!(dir_to_equirect(Vec3::Y).y.abs() < 1e-6);
    assert!((dir_to_equirect(-Vec3::Y).y - 1.0).abs() < 1e-6);
}

#[test]
fn quad_corners_cover_the_texture() {
    assert_eq!(ndc_to_uv(Vec2::new(-1.0, 1.0)), Vec2::new(0.0, 0.0));
    assert_eq!(ndc_to_uv(Vec2::new(1.0, -1.0)), Vec2::new(1.0, 1.0));
}

#[test]
fn van_der_corput_sequence_starts_halving() {
    let values: Vec<f32> = (0..4).map(radical_inverse_vdc).collect();
    let expected = [0.0, 0.5, 0.25, 0.75];
    for (value, expected) in values.iter().zip(expected) {
        assert!((value - expected).abs() < 1e-6, "{} vs {}", value, expected);
    }
}

#[test]
fn smooth_surfaces_sample_along_the_normal() {
    let normal = Vec3::new(0.3, 0.8, 0.2).normalize();
    for i in 0..16u32 {
        let xi = Vec2::new(i as f32 / 16.0, radical_inverse_vdc(i));
        let h = importance_sample_ggx(xi, normal, 0.0);
        assert!(approx_eq3(h, normal, 1e-4), "sample {}: {:?}", i, h);
    }
}

#[test]
fn rough_samples_stay_in_the_upper_hemisphere() {
    let normal = Vec3::Z;
    for i in 0..64u32 {
        let xi = Vec2::new(i as f32 / 64.0, radical_inverse_vdc(i));
        let h = importance_sample_ggx(xi, normal, 1.0);
        assert!(h.dot(normal) >= -1e-6);
        assert!((h.length() - 1.0).abs() < 1e-4);
    }
}
