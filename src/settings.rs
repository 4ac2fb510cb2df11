use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Startup configuration, read from `viewer.json` when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerSettings {
    #[serde(default = "ViewerSettings::default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "ViewerSettings::default_environment_path")]
    pub environment_path: PathBuf,
    #[serde(default = "ViewerSettings::default_shader_dir")]
    pub shader_dir: PathBuf,
    /// `None` keeps the source environment's dimensions.
    #[serde(default = "ViewerSettings::default_irradiance_size")]
    pub irradiance_size: Option<[u32; 2]>,
    #[serde(default)]
    pub specular_size: Option<[u32; 2]>,
    #[serde(default = "ViewerSettings::default_specular_levels")]
    pub specular_levels: u32,
    #[serde(default = "ViewerSettings::default_brdf_lut_size")]
    pub brdf_lut_size: u32,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub present_mode: PresentModeSetting,
    #[serde(default = "ViewerSettings::default_exposure")]
    pub exposure: f32,
    #[serde(default = "ViewerSettings::default_fov_y_degrees")]
    pub fov_y_degrees: f32,
    #[serde(default = "ViewerSettings::default_near")]
    pub near: f32,
    #[serde(default = "ViewerSettings::default_far")]
    pub far: f32,
    #[serde(default)]
    pub show_previews: bool,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            model_path: Self::default_model_path(),
            environment_path: Self::default_environment_path(),
            shader_dir: Self::default_shader_dir(),
            irradiance_size: Self::default_irradiance_size(),
            specular_size: None,
            specular_levels: Self::default_specular_levels(),
            brdf_lut_size: Self::default_brdf_lut_size(),
            resolution: Resolution::default(),
            present_mode: PresentModeSetting::default(),
            exposure: Self::default_exposure(),
            fov_y_degrees: Self::default_fov_y_degrees(),
            near: Self::default_near(),
            far: Self::default_far(),
            show_previews: false,
        }
    }
}

impl ViewerSettings {
    pub fn load() -> Self {
        Self::load_from_path("viewer.json")
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<ViewerSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded viewer settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default viewer settings.",
                        path, err
                    );
                    ViewerSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Viewer settings file {:?} not found. Using default settings.",
                    path
                );
                ViewerSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default viewer settings.",
                    path, err
                );
                ViewerSettings::default()
            }
        }
    }

    /// Positional overrides: `ibl-viewer [model.gltf] [environment.hdr]`.
    pub fn with_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        if let Some(model) = args.next() {
            self.model_path = PathBuf::from(model);
        }
        if let Some(environment) = args.next() {
            self.environment_path = PathBuf::from(environment);
        }
        self
    }

    pub fn validate(mut self) -> Self {
        if matches!(self.irradiance_size, Some([w, h]) if w == 0 || h == 0) {
            warn!("Irradiance size must be greater than zero. Using the source size instead.");
            self.irradiance_size = None;
        }

        if matches!(self.specular_size, Some([w, h]) if w == 0 || h == 0) {
            warn!("Specular size must be greater than zero. Using the source size instead.");
            self.specular_size = None;
        }

        if self.specular_levels == 0 {
            warn!("Specular levels must be greater than zero. Using default value.");
            self.specular_levels = Self::default_specular_levels();
        }

        if self.brdf_lut_size == 0 {
            warn!("BRDF LUT size must be greater than zero. Using default value.");
            self.brdf_lut_size = Self::default_brdf_lut_size();
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        if !(self.near > 0.0 && self.far > self.near) {
            warn!("Clip planes must satisfy 0 < near < far. Using default planes.");
            self.near = Self::default_near();
            self.far = Self::default_far();
        }

        if !(self.fov_y_degrees > 1.0 && self.fov_y_degrees < 179.0) {
            warn!("Field of view out of range. Using default value.");
            self.fov_y_degrees = Self::default_fov_y_degrees();
        }

        self
    }

    pub fn present_mode(&self, available: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        let desired = self.present_mode.to_wgpu();
        if available.contains(&desired) {
            return desired;
        }

        warn!(
            "Requested present mode {:?} is not supported. Falling back to FIFO.",
            desired
        );

        if available.contains(&wgpu::PresentMode::Fifo) {
            wgpu::PresentMode::Fifo
        } else {
            available
                .first()
                .copied()
                .unwrap_or(wgpu::PresentMode::Fifo)
        }
    }

    pub fn irradiance_extent(&self) -> Option<(u32, u32)> {
        self.irradiance_size.map(|[w, h]| (w, h))
    }

    pub fn specular_extent(&self) -> Option<(u32, u32)> {
        self.specular_size.map(|[w, h]| (w, h))
    }

    fn default_model_path() -> PathBuf {
        PathBuf::from("DamagedHelmet/DamagedHelmet.gltf")
    }

    fn default_environment_path() -> PathBuf {
        PathBuf::from("environment.hdr")
    }

    fn default_shader_dir() -> PathBuf {
        PathBuf::from("shaders")
    }

    fn default_irradiance_size() -> Option<[u32; 2]> {
        Some([256, 128])
    }

    const fn default_specular_levels() -> u32 {
        5
    }

    const fn default_brdf_lut_size() -> u32 {
        512
    }

    const fn default_exposure() -> f32 {
        1.0
    }

    const fn default_fov_y_degrees() -> f32 {
        60.0
    }

    const fn default_near() -> f32 {
        0.1
    }

    const fn default_far() -> f32 {
        100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    #[default]
    Fifo,
    FifoRelaxed,
    Immediate,
    Mailbox,
    AutoVsync,
    AutoNoVsync,
}

impl PresentModeSetting {
    fn to_wgpu(&self) -> wgpu::PresentMode {
        match self {
            PresentModeSetting::Fifo => wgpu::PresentMode::Fifo,
            PresentModeSetting::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
            PresentModeSetting::Immediate => wgpu::PresentMode::Immediate,
            PresentModeSetting::Mailbox => wgpu::PresentMode::Mailbox,
            PresentModeSetting::AutoVsync => wgpu::PresentMode::AutoVsync,
            PresentModeSetting::AutoNoVsync => wgpu::PresentMode::AutoNoVsync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let invalid = ViewerSettings {
            irradiance_size: Some([0, 64]),
            specular_levels: 0,
            brdf_lut_size: 0,
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            near: 5.0,
            far: 1.0,
            ..ViewerSettings::default()
        };

        let validated = invalid.validate();

        assert_eq!(validated.irradiance_size, None);
        assert_eq!(
            validated.specular_levels,
            ViewerSettings::default().specular_levels
        );
        assert_eq!(validated.brdf_lut_size, ViewerSettings::default().brdf_lut_size);
        assert_eq!(validated.resolution.width, Resolution::default().width);
        assert!(validated.near < validated.far);
    }

    #[test]
    fn partial_json_uses_field_defaults() {
        let settings: ViewerSettings =
            serde_json::from_str(r#"{ "irradiance_size": null, "specular_levels": 3 }"#)
                .expect("parse");

        assert_eq!(settings.irradiance_extent(), None);
        assert_eq!(settings.specular_levels, 3);
        assert_eq!(settings.shader_dir, PathBuf::from("shaders"));
        assert_eq!(settings.brdf_lut_size, 512);
    }

    #[test]
    fn positional_args_override_paths() {
        let settings = ViewerSettings::default()
            .with_args(["helmet.gltf".to_string(), "studio.hdr".to_string()]);

        assert_eq!(settings.model_path, PathBuf::from("helmet.gltf"));
        assert_eq!(settings.environment_path, PathBuf::from("studio.hdr"));
    }

    #[test]
    fn present_mode_falls_back_to_fifo_when_desired_missing() {
        let settings = ViewerSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..ViewerSettings::default()
        };

        let available = [wgpu::PresentMode::Fifo, wgpu::PresentMode::Immediate];

        assert_eq!(settings.present_mode(&available), wgpu::PresentMode::Fifo);
    }
}
