pub mod app;
pub mod asset;
pub mod error;
pub mod gpu;
pub mod io;
pub mod renderer;
pub mod scene;
pub mod settings;
pub mod time;

use app::App;
use settings::ViewerSettings;
use winit::event_loop::EventLoop;

pub use error::{RenderError, Result};

pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Runs the viewer until the window closes. Startup failures (missing
/// files, shader link errors) end the loop and are returned.
pub fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let settings = ViewerSettings::load().with_args(std::env::args().skip(1));
    log::info!(
        "Starting IBL viewer: model {:?}, environment {:?}",
        settings.model_path,
        settings.environment_path
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(settings);

    let result = event_loop.run_app(&mut app);
    if let Err(ref err) = result {
        log::error!("Application error: {}", err);
    }
    result?;

    if let Some(err) = app.take_error() {
        return Err(err.into());
    }

    log::info!("Application shutdown complete");
    Ok(())
}
