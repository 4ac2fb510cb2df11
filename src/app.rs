use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec2;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::*,
    event_loop::ActiveEventLoop,
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::asset::GltfAsset;
use crate::error::{RenderError, Result};
use crate::gpu::{RenderTarget, SharedGpu, SurfaceContext};
use crate::renderer::{
    EnvironmentMap, ModelRenderContext, RenderContext, ShaderProgram, TexturePreview,
};
use crate::scene::{Camera, FrameData, MouseButton as TrackballButton, Projection, TrackballControls};
use crate::settings::ViewerSettings;
use crate::time::FrameTimer;

pub const MODEL_VERTEX_SHADER: &str = "model.vert.wgsl";
pub const MODEL_FRAGMENT_SHADER: &str = "model.frag.wgsl";

const CLEAR_COLOR: [f32; 4] = [0.45, 0.55, 0.60, 1.0];

/// Pixels of touchpad scroll that count as one wheel line.
const PIXELS_PER_LINE: f32 = 20.0;

/// Everything that exists once a window and device are up.
struct Viewer {
    window: Arc<Window>,
    surface: SurfaceContext,
    gpu: SharedGpu,
    environment: EnvironmentMap,
    model_program: ShaderProgram,
    model: ModelRenderContext,
    preview: TexturePreview,
    show_previews: bool,
    exposure: f32,
    camera: Camera,
    projection: Projection,
    controls: TrackballControls,
    cursor: Vec2,
    timer: FrameTimer,
}

impl Viewer {
    fn new(window: Arc<Window>, settings: &ViewerSettings) -> Result<Self> {
        let surface = pollster::block_on(SurfaceContext::new(Arc::clone(&window), settings))?;
        let gpu: SharedGpu = surface.gpu();
        let shader_dir = settings.shader_dir.as_path();

        let mut environment =
            EnvironmentMap::load(&gpu, &settings.environment_path, shader_dir)?;
        environment.precompute_irradiance(settings.irradiance_extent())?;
        environment.precompute_specular(settings.specular_extent(), settings.specular_levels)?;
        environment.precompute_brdf_lut(settings.brdf_lut_size)?;
        environment.set_exposure(settings.exposure);

        let asset = GltfAsset::load(&settings.model_path)?;
        let mut model_program = load_model_program(&gpu, shader_dir)?;
        environment.bind_lighting(&mut model_program);

        let mut model = ModelRenderContext::new(&gpu);
        model.upload_textures(&asset)?;
        model.arm(&mut model_program, &asset)?;
        log::info!(
            "Armed {:?}: {} indices, {} material textures",
            asset.path,
            model.index_count(),
            model.active_texture_count()
        );

        let preview = TexturePreview::new(&gpu, shader_dir)?;

        let size = surface.size();
        let projection = Projection::new(
            settings.fov_y_degrees.to_radians(),
            settings.near,
            settings.far,
            size.width,
            size.height,
        );

        Ok(Self {
            window,
            surface,
            gpu,
            environment,
            model_program,
            model,
            preview,
            show_previews: settings.show_previews,
            exposure: settings.exposure,
            camera: Camera::default(),
            projection,
            controls: TrackballControls::new(size.width, size.height),
            cursor: Vec2::ZERO,
            timer: FrameTimer::default(),
        })
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        self.surface.resize(size);
        self.projection.resize(size.width, size.height);
        self.controls.resize(size.width, size.height);
    }

    fn redraw(&mut self) {
        let Some(frame) = self.surface.begin_frame() else {
            return;
        };

        self.controls.update(&mut self.camera);
        let size = self.surface.size();
        let frame_data = FrameData::new(
            &self.camera,
            &self.projection,
            Vec2::new(size.width as f32, size.height as f32),
        );

        self.gpu.clear(RenderTarget::Screen, CLEAR_COLOR);
        self.environment.render(&frame_data);

        self.model_program.uniform_mat4("uP", frame_data.projection);
        self.model_program.uniform_mat4("uV", frame_data.view);
        self.model_program.uniform_vec3("uCameraPos", frame_data.eye);
        self.model_program.uniform_f32("uExposure", self.exposure);
        self.model_program.use_program();
        self.model.render(&self.model_program, RenderTarget::Screen);

        if self.show_previews {
            self.preview
                .draw(self.environment.source(), 0, frame_data.screen_size, self.exposure);
            if let Some(irradiance) = self.environment.irradiance() {
                self.preview
                    .draw(irradiance, 1, frame_data.screen_size, self.exposure);
            }
        }

        self.surface.end_frame(frame);

        let (_, average) = self.timer.tick(Instant::now());
        if let Some(average) = average {
            log::info!(
                "Average frame time {:.2} ms ({:.0} fps)",
                average.as_secs_f64() * 1000.0,
                1.0 / average.as_secs_f64().max(f64::EPSILON)
            );
        }
    }

    fn key_pressed(&mut self, key: &Key) {
        match key {
            Key::Character(c) if c.eq_ignore_ascii_case("b") => {
                let next = self.environment.background().next();
                self.environment.set_background(next);
            }
            Key::Character(c) if c.eq_ignore_ascii_case("p") => {
                self.show_previews = !self.show_previews;
                log::info!("Texture previews {}", if self.show_previews { "on" } else { "off" });
            }
            _ => {}
        }
    }

    fn mouse_input(&mut self, state: ElementState, button: winit::event::MouseButton) {
        let button = match button {
            winit::event::MouseButton::Left => TrackballButton::Left,
            winit::event::MouseButton::Right => TrackballButton::Right,
            winit::event::MouseButton::Middle => TrackballButton::Middle,
            _ => return,
        };
        match state {
            ElementState::Pressed => self.controls.mouse_down(&self.camera, button, self.cursor),
            ElementState::Released => self.controls.mouse_up(),
        }
    }

    fn cursor_moved(&mut self, x: f64, y: f64) {
        self.cursor = Vec2::new(x as f32, y as f32);
        self.controls.mouse_move(&self.camera, self.cursor);
    }

    fn mouse_wheel(&mut self, delta: MouseScrollDelta) {
        let lines = match delta {
            MouseScrollDelta::LineDelta(_, y) => y,
            MouseScrollDelta::PixelDelta(position) => position.y as f32 / PIXELS_PER_LINE,
        };
        self.controls.mouse_wheel(lines);
    }
}

fn load_model_program(gpu: &SharedGpu, shader_dir: &Path) -> Result<ShaderProgram> {
    ShaderProgram::from_files(
        gpu,
        shader_dir.join(MODEL_VERTEX_SHADER),
        shader_dir.join(MODEL_FRAGMENT_SHADER),
    )
}

pub struct App {
    settings: ViewerSettings,
    viewer: Option<Viewer>,
    error: Option<RenderError>,
}

impl App {
    pub fn new(settings: ViewerSettings) -> Self {
        Self {
            settings,
            viewer: None,
            error: None,
        }
    }

    /// The startup error that ended the event loop, if any.
    pub fn take_error(&mut self) -> Option<RenderError> {
        self.error.take()
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.viewer.is_some() {
            return;
        }

        let resolution = &self.settings.resolution;
        let attributes = Window::default_attributes()
            .with_title("IBL viewer")
            .with_inner_size(PhysicalSize::new(resolution.width, resolution.height));
        let window = Arc::new(event_loop.create_window(attributes).expect("create window"));

        match Viewer::new(Arc::clone(&window), &self.settings) {
            Ok(viewer) => {
                window.request_redraw();
                self.viewer = Some(viewer);
            }
            Err(err) => {
                log::error!("Startup failed: {}", err);
                self.error = Some(err);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let Some(viewer) = self.viewer.as_mut() else {
            return;
        };
        if id != viewer.window.id() {
            return;
        }

        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                viewer.resize(size);
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = viewer.window.inner_size();
                viewer.resize(size);
            }
            WindowEvent::RedrawRequested => {
                viewer.redraw();
                viewer.window.request_redraw();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                event_loop.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => {
                viewer.key_pressed(&logical_key);
            }
            WindowEvent::CursorMoved { position, .. } => {
                viewer.cursor_moved(position.x, position.y);
            }
            WindowEvent::MouseInput { state, button, .. } => {
                viewer.mouse_input(state, button);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                viewer.mouse_wheel(delta);
            }
            _ => {}
        }
    }
}
