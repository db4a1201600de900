//! Platform abstraction for the Ferrite engine.
//!
//! Provides a winit window driven by pumping the event loop from the caller's
//! own render loop, and implements the RHI's [`WindowHost`] contract on it.

use std::time::Duration;

use ferrite_rhi::WindowHost;
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use thiserror::Error;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Pump iterations allowed before giving up on the initial window.
const WINDOW_CREATION_ATTEMPTS: u32 = 64;

/// Window configuration.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
    /// Treat the Escape key as a close request.
    pub close_on_escape: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Ferrite".to_string(),
            width: 800,
            height: 600,
            resizable: true,
            close_on_escape: true,
        }
    }
}

impl WindowConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Allow or forbid user resizing.
    pub fn with_resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }

    /// Close on Escape or not.
    pub fn with_close_on_escape(mut self, close: bool) -> Self {
        self.close_on_escape = close;
        self
    }
}

/// Framebuffer size as the renderer should see it: zero while minimized.
pub fn drawable_size(inner: PhysicalSize<u32>, minimized: Option<bool>) -> (u32, u32) {
    if minimized == Some(true) {
        (0, 0)
    } else {
        (inner.width, inner.height)
    }
}

/// Event handler state shared with winit while pumping.
struct WindowState {
    config: WindowConfig,
    window: Option<Window>,
    error: Option<PlatformError>,
    close_requested: bool,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(self.config.resizable);

        match event_loop.create_window(attrs) {
            Ok(window) => {
                tracing::info!(
                    width = self.config.width,
                    height = self.config.height,
                    "Window created"
                );
                self.window = Some(window);
            }
            Err(e) => {
                tracing::error!("Failed to create window: {e}");
                self.error = Some(PlatformError::WindowCreation(e.to_string()));
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("Close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                tracing::debug!("Window resized to {}x{}", size.width, size.height);
            }
            WindowEvent::KeyboardInput { event, .. }
                if self.config.close_on_escape
                    && event.state == ElementState::Pressed
                    && event.logical_key == Key::Named(NamedKey::Escape) =>
            {
                self.close_requested = true;
            }
            _ => {}
        }
    }
}

/// A single window whose events are pumped by the owner.
pub struct PlatformWindow {
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl PlatformWindow {
    /// Open a window and return once it exists.
    pub fn new(config: WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().map_err(|e| PlatformError::EventLoop(e.to_string()))?;
        event_loop.set_control_flow(ControlFlow::Wait);

        let mut this = Self {
            event_loop,
            state: WindowState {
                config,
                window: None,
                error: None,
                close_requested: false,
            },
        };

        for _ in 0..WINDOW_CREATION_ATTEMPTS {
            this.pump(Some(Duration::ZERO))?;
            if this.state.window.is_some() {
                return Ok(this);
            }
        }
        Err(PlatformError::WindowCreation(
            "event loop never resumed".to_string(),
        ))
    }

    fn pump(&mut self, timeout: Option<Duration>) -> Result<()> {
        let status = self
            .event_loop
            .pump_app_events(timeout, &mut self.state);
        if let Some(e) = self.state.error.take() {
            return Err(e);
        }
        if let PumpStatus::Exit(code) = status {
            tracing::info!(code, "Event loop exited");
            self.state.close_requested = true;
        }
        Ok(())
    }

    /// Process pending events without blocking.
    pub fn poll_events(&mut self) -> Result<()> {
        self.pump(Some(Duration::ZERO))
    }

    pub const fn should_close(&self) -> bool {
        self.state.close_requested
    }

    pub const fn config(&self) -> &WindowConfig {
        &self.state.config
    }

    pub const fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }

    fn handle_window(&self) -> std::result::Result<&Window, HandleError> {
        self.state.window.as_ref().ok_or(HandleError::Unavailable)
    }
}

impl WindowHost for PlatformWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        self.state.window.as_ref().map_or((0, 0), |window| {
            drawable_size(window.inner_size(), window.is_minimized())
        })
    }

    fn wait_events(&mut self) {
        if let Err(e) = self.pump(None) {
            tracing::error!("Event loop failed while waiting: {e}");
        }
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
        self.handle_window()?.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
        self.handle_window()?.display_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_a_resizable_800x600() {
        let config = WindowConfig::default();
        assert_eq!((config.width, config.height), (800, 600));
        assert!(config.resizable);
        assert!(config.close_on_escape);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = WindowConfig::new("Viewer")
            .with_size(1024, 768)
            .with_resizable(false)
            .with_close_on_escape(false);
        assert_eq!(config.title, "Viewer");
        assert_eq!((config.width, config.height), (1024, 768));
        assert!(!config.resizable);
        assert!(!config.close_on_escape);
    }

    #[test]
    fn minimized_window_has_no_drawable_area() {
        let size = PhysicalSize::new(1024, 768);
        assert_eq!(drawable_size(size, Some(true)), (0, 0));
        assert_eq!(drawable_size(size, Some(false)), (1024, 768));
        // Platforms that cannot report minimization fall back to the inner size.
        assert_eq!(drawable_size(size, None), (1024, 768));
        assert_eq!(drawable_size(PhysicalSize::new(0, 0), None), (0, 0));
    }
}
