// =============================================================================
// VULKAN TRIANGLE RENDERER
// =============================================================================
//
// Opens one window and draws a single hard-coded triangle every frame until
// the window is closed.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  main: CLI + config + logging + winit window                    │
// │    └── FrameSynchronizer (acquire -> submit -> present loop)    │
// │          └── Renderer (owns every GPU object)                   │
// │                └── backend/ (instance, device, swapchain, ...)  │
// └─────────────────────────────────────────────────────────────────┘
//
// The loop is pull-style: the synchronizer pumps window events once per
// iteration instead of winit calling into us.
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame;
mod renderer;

use anyhow::{Context, Result};
use backend::ShaderBytecode;
use clap::Parser;
use config::Config;
use frame::{FrameSynchronizer, WindowEvents};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use renderer::{Renderer, RendererSettings};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

/// How long to block for events while there is nothing to draw.
const MINIMIZED_POLL: Duration = Duration::from_millis(16);

#[derive(Parser, Debug)]
#[command(author, version, about = "Draws a triangle with Vulkan", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Force the Khronos validation layer on
    #[arg(long, conflicts_with = "no_validation")]
    validation: bool,

    /// Force the Khronos validation layer off
    #[arg(long)]
    no_validation: bool,
}

impl Args {
    fn validation_override(&self) -> Option<bool> {
        match (self.validation, self.no_validation) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let mut config = Config::load_from_path(&args.config)?;
    if let Some(validation) = args.validation_override() {
        config.debug.validation_layers = validation;
    }

    log::info!("Starting triangle renderer");
    log::info!(
        "Window: {}x{}, validation {}",
        config.window.width,
        config.window.height,
        if config.debug.validation_layers { "on" } else { "off" }
    );

    // Read shaders before touching the GPU so a bad path fails fast.
    let shaders = ShaderBytecode::load(&config.shaders.vertex, &config.shaders.fragment)?;

    let mut events = WindowLoop::new(&config)?;
    let window = events.wait_for_window()?;

    let mut renderer = Renderer::new(
        window.raw_display_handle(),
        window.raw_window_handle(),
        &RendererSettings::from_config(&config),
        shaders,
    )
    .context("Failed to initialize Vulkan")?;

    let extent = renderer.swapchain_extent();
    log::info!("Rendering at {}x{}", extent.width, extent.height);

    let mut frames = FrameSynchronizer::for_driver(&renderer);
    let result = frames.run(&mut renderer, &mut events);
    log::info!("Frame loop finished after {} frames", frames.frames_presented());

    // The surface must go before the window it was created from.
    drop(renderer);
    drop(window);
    drop(events);

    result.context("Frame loop failed")?;
    log::info!("Shutdown complete");
    Ok(())
}

fn init_logging() {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
}

// =============================================================================
// WINDOW
// =============================================================================

/// Window state updated by winit callbacks, read by the frame loop.
struct App {
    attributes: WindowAttributes,
    window: Option<Rc<Window>>,
    create_error: Option<winit::error::OsError>,
    close_requested: bool,
    minimized: bool,
    resized: Option<(u32, u32)>,
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(Rc::new(window)),
            Err(e) => {
                self.create_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.minimized = true;
                } else {
                    self.minimized = false;
                    self.resized = Some((size.width, size.height));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }
}

/// Owns the event loop and pumps it on demand.
///
/// `app` is declared first so the window drops before the event loop.
struct WindowLoop {
    app: App,
    event_loop: EventLoop<()>,
}

impl WindowLoop {
    fn new(config: &Config) -> Result<Self> {
        let event_loop = EventLoop::new().context("Failed to create event loop")?;

        let attributes = WindowAttributes::default()
            .with_title(&config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                config.window.width,
                config.window.height,
            ))
            .with_resizable(config.window.resizable);

        Ok(Self {
            app: App {
                attributes,
                window: None,
                create_error: None,
                close_requested: false,
                minimized: false,
                resized: None,
            },
            event_loop,
        })
    }

    /// Pump until winit has created the window.
    fn wait_for_window(&mut self) -> Result<Rc<Window>> {
        loop {
            if let Some(window) = &self.app.window {
                return Ok(window.clone());
            }
            if let Some(e) = self.app.create_error.take() {
                return Err(e).context("Failed to create window");
            }
            if self.app.close_requested {
                anyhow::bail!("Event loop exited before a window was created");
            }
            self.pump();
        }
    }
}

impl WindowEvents for WindowLoop {
    fn pump(&mut self) {
        let timeout = if self.app.minimized { Some(MINIMIZED_POLL) } else { Some(Duration::ZERO) };

        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.app) {
            log::debug!("Event loop exited with code {}", code);
            self.app.close_requested = true;
        }
    }

    fn should_close(&self) -> bool {
        self.app.close_requested
    }

    fn is_minimized(&self) -> bool {
        self.app.minimized
    }

    fn take_resized(&mut self) -> Option<(u32, u32)> {
        self.app.resized.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_flags() {
        let args = Args::parse_from(["triangle-renderer", "--validation"]);
        assert_eq!(args.validation_override(), Some(true));

        let args = Args::parse_from(["triangle-renderer", "--no-validation"]);
        assert_eq!(args.validation_override(), Some(false));

        let args = Args::parse_from(["triangle-renderer"]);
        assert_eq!(args.validation_override(), None);
        assert_eq!(args.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn test_conflicting_validation_flags_rejected() {
        let result = Args::try_parse_from(["triangle-renderer", "--validation", "--no-validation"]);
        assert!(result.is_err());
    }
}
