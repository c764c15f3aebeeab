#![allow(clippy::too_many_arguments, clippy::missing_safety_doc)]
pub mod app;
pub mod callback;
pub mod camera;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod model;
pub mod owned;
pub mod pipeline;
pub mod swapchain;
pub mod texture;
pub mod transfer;

use anyhow::Result;
use log::*;
use winit::dpi::LogicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::WindowBuilder;

use crate::app::{framebuffer_extent, App};
use crate::config::{EngineConfig, MAX_FRAMES_IN_FLIGHT};
use crate::frame::{FrameLoop, FrameOutcome, ResizeSignal};

fn main() -> Result<()> {
    pretty_env_logger::init();
    let config = EngineConfig::from_env()?;
    info!("Starting with {:?}", config);

    // Window

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title(&config.title)
        .with_inner_size(LogicalSize::new(config.width, config.height))
        .build(&event_loop)?;

    // App

    let resized = ResizeSignal::default();
    let mut frames = FrameLoop::new(MAX_FRAMES_IN_FLIGHT, resized.clone(), config.frame_timeout);
    let mut app = Some(unsafe { App::create(&window, &config)? });
    event_loop.run(move |event, _, control_flow| match event {
        // Render a frame while our Vulkan app is alive.
        Event::MainEventsCleared => {
            if let Some(inner) = app.as_mut() {
                match frames.render(inner, framebuffer_extent(&window)) {
                    // Minimized: block until the next window event.
                    Ok(FrameOutcome::Stalled) => *control_flow = ControlFlow::Wait,
                    Ok(_) => *control_flow = ControlFlow::Poll,
                    Err(e) => {
                        error!("Rendering failed: {:?}", e);
                        app = None;
                        *control_flow = ControlFlow::ExitWithCode(1);
                    }
                }
            }
        }
        Event::WindowEvent { event: WindowEvent::Resized(_), .. } => resized.raise(),
        // Destroy our Vulkan app.
        Event::WindowEvent { event: WindowEvent::CloseRequested, .. } => {
            info!("Close requested, shutting down.");
            app = None;
            *control_flow = ControlFlow::Exit;
        }
        _ => {}
    });
}
