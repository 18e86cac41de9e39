// =============================================================================
// SHADERBOX - Vulkan shader viewer with hot reload
// =============================================================================
//
// A continuously rendering window that draws a full-screen fragment shader
// and rebuilds the pipeline when the shader sources change on disk.
//
// FRAME FLOW:
// 1. Drain file-watcher events (rebuild pipeline if a source was replaced)
// 2. Recreate the swapchain if a resize is pending
// 3. Acquire swapchain image
// 4. Wait that image's fence, re-record its push-constant command buffer
// 5. Submit both command buffers and present
//
// =============================================================================

mod backend;
mod config;

use anyhow::{Context, Result};
use ash::vk;
use backend::{
    Acquired, DeviceContext, FrameSync, PipelineError, PipelineState, PresentStatus,
    RendererError, Surface,
};
use config::Config;
use glam::{Vec3, Vec4};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting Shaderbox");
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// PUSH CONSTANTS
// =============================================================================

/// Per-frame uniform block handed to both shader stages, shadertoy layout.
/// Must stay within the 128-byte portable push-constant budget.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PushConstants {
    /// xy: cursor while the left button is down, zw: cursor at release
    mouse: Vec4,
    time: f32,
    time_delta: f32,
    frame_rate: f32,
    frame: i32,
    resolution: Vec3,
    _pad: f32,
}

const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

/// Editors commonly save by writing a temp file and replacing the original,
/// which reaches the watcher as a removal of the watched path. Removal is
/// therefore the rebuild trigger; plain modifications are ignored.
fn should_rebuild(kind: &notify::EventKind) -> bool {
    matches!(kind, notify::EventKind::Remove(_))
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Everything the frame loop touches, passed by reference instead of living
/// in statics. Destroyed in reverse order of creation in Drop.
pub struct App {
    config: Config,

    window: Option<Arc<Window>>,

    device: Option<DeviceContext>,
    surface: Option<Surface>,
    pipeline: Option<PipelineState>,

    /// One pre-recorded draw command buffer per swapchain image
    draw_commands: Vec<vk::CommandBuffer>,
    /// Per-image transient command buffer + guard fence
    frame_sync: Vec<FrameSync>,

    watcher: Option<RecommendedWatcher>,
    watcher_events: Option<Receiver<notify::Result<notify::Event>>>,

    push_constants: PushConstants,
    cursor_pos: (f64, f64),

    /// Set on window resize or a suboptimal/out-of-date presentation status
    needs_resize: bool,
    /// Set when a watched shader source was replaced on disk
    needs_rebuild: bool,
    /// Window has zero extent; skip rendering entirely
    is_minimized: bool,

    start: Instant,
    last_frame: Instant,
    frame: i32,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            device: None,
            surface: None,
            pipeline: None,
            draw_commands: Vec::new(),
            frame_sync: Vec::new(),
            watcher: None,
            watcher_events: None,
            push_constants: bytemuck::Zeroable::zeroed(),
            cursor_pos: (0.0, 0.0),
            needs_resize: false,
            needs_rebuild: false,
            is_minimized: false,
            start: now,
            last_frame: now,
            frame: 0,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = DeviceContext::new(
            &self.config.window.title,
            PUSH_CONSTANT_SIZE,
            enable_validation,
        )?;

        let surface = Surface::create(
            &device,
            window,
            self.config.get_present_mode(),
            self.config.get_sample_count(),
        )?;

        let pipeline = PipelineState::build(
            &device,
            &surface,
            Path::new(&self.config.shaders.vertex),
            Path::new(&self.config.shaders.fragment),
            PUSH_CONSTANT_SIZE,
        )
        .context("failed to build initial pipeline")?;

        let num_images = surface.num_images();
        let draw_commands = device.allocate_command_buffers(num_images as u32)?;
        let frame_sync = FrameSync::for_images(&device, num_images)?;

        record_draw_commands(
            &device,
            &surface,
            &pipeline,
            &draw_commands,
            self.config.graphics.clear_color,
        )?;

        let extent = surface.extent();
        self.push_constants.resolution = resolution_for(extent);

        self.device = Some(device);
        self.surface = Some(surface);
        self.pipeline = Some(pipeline);
        self.draw_commands = draw_commands;
        self.frame_sync = frame_sync;

        self.init_watcher();

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    /// Watch both shader sources. Watcher failures are logged and non-fatal;
    /// the app just runs without hot reload.
    fn init_watcher(&mut self) {
        let (tx, rx) = channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                log::error!("file watcher unavailable: {}", e);
                return;
            }
        };

        for path in [&self.config.shaders.vertex, &self.config.shaders.fragment] {
            if let Err(e) = watcher.watch(Path::new(path), RecursiveMode::NonRecursive) {
                log::error!("watching {} failed: {}", path, e);
            }
        }

        self.watcher = Some(watcher);
        self.watcher_events = Some(rx);
    }

    /// Drain pending watcher events on the render thread. Only a removal of
    /// a watched source schedules a rebuild (see should_rebuild).
    fn poll_shader_changes(&mut self) {
        let Some(events) = self.watcher_events.as_ref() else {
            return;
        };

        for event in events.try_iter() {
            match event {
                Ok(event) if should_rebuild(&event.kind) => {
                    log::info!("Shader source replaced: {:?}", event.paths);
                    self.needs_rebuild = true;
                }
                Ok(_) => {}
                Err(e) => log::warn!("file watcher error: {}", e),
            }
        }
    }

    // =========================================================================
    // RESIZE / REBUILD
    // =========================================================================

    /// Rebuild the swapchain and everything sized to it. The surface keeps
    /// its previous resources if the rebuild fails partway.
    fn recreate_surface(&mut self) -> Result<()> {
        let window = self.window.clone().context("window not initialized")?;

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;

        let ctx = self.device.as_ref().context("device not initialized")?;
        let surface = self.surface.as_mut().context("surface not initialized")?;

        surface.resize(
            ctx,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )?;

        // A new swapchain may report a different image count; the command
        // buffer and fence sets must track it.
        let num_images = surface.num_images();
        if num_images != self.draw_commands.len() {
            ctx.free_command_buffers(&mut self.draw_commands);
            self.draw_commands = ctx.allocate_command_buffers(num_images as u32)?;

            let mut transient: Vec<_> =
                self.frame_sync.iter().map(|f| f.command_buffer).collect();
            for frame in &self.frame_sync {
                frame.destroy(ctx);
            }
            ctx.free_command_buffers(&mut transient);
            self.frame_sync = FrameSync::for_images(ctx, num_images)?;
        }

        let extent = surface.extent();
        self.push_constants.resolution = resolution_for(extent);

        let pipeline = self.pipeline.as_ref().context("pipeline not initialized")?;
        record_draw_commands(
            ctx,
            surface,
            pipeline,
            &self.draw_commands,
            self.config.graphics.clear_color,
        )?;

        self.needs_resize = false;
        Ok(())
    }

    /// Swap in a freshly built pipeline. The old shader modules, layout, and
    /// pipeline are destroyed only after the new command buffers referencing
    /// the new pipeline have been recorded.
    fn rebuild_pipeline(&mut self) -> Result<()> {
        log::info!("Rebuilding pipeline");

        let ctx = self.device.as_ref().context("device not initialized")?;
        let surface = self.surface.as_ref().context("surface not initialized")?;

        let new_pipeline = match PipelineState::build(
            ctx,
            surface,
            Path::new(&self.config.shaders.vertex),
            Path::new(&self.config.shaders.fragment),
            PUSH_CONSTANT_SIZE,
        ) {
            Ok(pipeline) => pipeline,
            Err(PipelineError::Shader(err)) => {
                // Keep drawing with the current pipeline until the source
                // compiles again.
                log::error!("shader rebuild failed: {}", err);
                self.needs_rebuild = false;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        ctx.free_command_buffers(&mut self.draw_commands);
        self.draw_commands = ctx.allocate_command_buffers(surface.num_images() as u32)?;
        record_draw_commands(
            ctx,
            surface,
            &new_pipeline,
            &self.draw_commands,
            self.config.graphics.clear_color,
        )?;

        if let Some(mut old) = self.pipeline.replace(new_pipeline) {
            old.destroy(ctx);
        }

        self.needs_rebuild = false;
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame. Returns false when the frame was skipped
    /// (minimized, or the swapchain went out of date).
    pub fn render_frame(&mut self) -> Result<bool> {
        if self.needs_resize {
            self.recreate_surface()?;
        }
        if self.is_minimized {
            return Ok(false);
        }
        if self.needs_rebuild {
            self.rebuild_pipeline()?;
        }

        let ctx = self.device.as_ref().context("device not initialized")?;
        let surface = self.surface.as_ref().context("surface not initialized")?;
        let pipeline = self.pipeline.as_ref().context("pipeline not initialized")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let mut schedule_resize = false;
        let image_index = match surface.acquire_next_image(ctx)? {
            Acquired::Ready(index) => index,
            Acquired::Suboptimal(index) => {
                // Still usable this frame; recreate on the next iteration.
                schedule_resize = true;
                index
            }
            Acquired::OutOfDate => {
                self.needs_resize = true;
                return Ok(false);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Wait this image's fence, then re-record its transient buffer
        // ─────────────────────────────────────────────────────────────────────
        // The fence is the only CPU-GPU ordering primitive: once it signals,
        // the previous submission using this command buffer has retired.
        let sync = &self.frame_sync[image_index as usize];
        sync.wait_and_reset(ctx)?;
        update_push_constants(ctx, sync, pipeline.layout, &self.push_constants)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Submit and present
        // ─────────────────────────────────────────────────────────────────────
        let buffers = [sync.command_buffer, self.draw_commands[image_index as usize]];
        match surface.submit_present(ctx, &buffers, image_index, sync.fence)? {
            PresentStatus::Complete => {}
            PresentStatus::NeedsResize => schedule_resize = true,
        }

        if schedule_resize {
            self.needs_resize = true;
        }

        Ok(true)
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    1000.0 / fps.max(1.0),
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// COMMAND RECORDING
// =============================================================================

/// Record the transient per-image command buffer: a single push-constant
/// upload. Caller must have waited and reset the image's fence first.
fn update_push_constants(
    ctx: &DeviceContext,
    sync: &FrameSync,
    layout: vk::PipelineLayout,
    constants: &PushConstants,
) -> Result<(), RendererError> {
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

    unsafe {
        ctx.device
            .begin_command_buffer(sync.command_buffer, &begin_info)?;
        ctx.device.cmd_push_constants(
            sync.command_buffer,
            layout,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            0,
            bytemuck::bytes_of(constants),
        );
        ctx.device.end_command_buffer(sync.command_buffer)?;
    }

    Ok(())
}

/// Pre-record one draw command buffer per swapchain image: set dynamic
/// viewport/scissor, one render pass, bind the pipeline, draw the
/// full-screen triangle.
fn record_draw_commands(
    ctx: &DeviceContext,
    surface: &Surface,
    pipeline: &PipelineState,
    commands: &[vk::CommandBuffer],
    clear_color: [f32; 4],
) -> Result<(), RendererError> {
    // Clear values by attachment index: multisampled color, resolve target
    // (not cleared), multisampled depth.
    let clear_values = [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        },
        vk::ClearValue::default(),
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ];

    for (i, &cmd) in commands.iter().enumerate() {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        unsafe {
            ctx.device.begin_command_buffer(cmd, &begin_info)?;

            ctx.device.cmd_set_viewport(cmd, 0, &[surface.viewport()]);
            ctx.device.cmd_set_scissor(cmd, 0, &[surface.scissor()]);

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(surface.render_pass())
                .framebuffer(surface.framebuffer(i))
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: surface.extent(),
                })
                .clear_values(&clear_values);

            ctx.device
                .cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            ctx.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            ctx.device.cmd_draw(cmd, 3, 1, 0, 0);
            ctx.device.cmd_end_render_pass(cmd);

            ctx.device.end_command_buffer(cmd)?;
        }
    }

    Ok(())
}

fn resolution_for(extent: vk::Extent2D) -> Vec3 {
    Vec3::new(
        extent.width as f32,
        extent.height as f32,
        extent.width as f32 / extent.height as f32,
    )
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                let elapsed = now.duration_since(self.start).as_secs_f32();
                let delta = now.duration_since(self.last_frame).as_secs_f32();
                self.last_frame = now;

                self.push_constants.time = elapsed;
                self.push_constants.time_delta = delta;
                self.push_constants.frame = self.frame;
                self.push_constants.frame_rate = if elapsed > 0.0 {
                    self.frame as f32 / elapsed
                } else {
                    0.0
                };

                match self.render_frame() {
                    Ok(rendered) => {
                        if rendered {
                            self.frame += 1;
                            self.update_fps();
                        }
                    }
                    Err(e) => {
                        // Anything past the transient statuses is fatal.
                        log::error!("Render error: {:?}", e);
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::CursorMoved { position, .. } => {
                self.cursor_pos = (position.x, position.y);
            }

            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => match state {
                ElementState::Pressed => {
                    self.push_constants.mouse.x = self.cursor_pos.0 as f32;
                    self.push_constants.mouse.y = self.cursor_pos.1 as f32;
                }
                ElementState::Released => {
                    self.push_constants.mouse.z = self.cursor_pos.0 as f32;
                    self.push_constants.mouse.w = self.cursor_pos.1 as f32;
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// Watcher events are drained here, on the render thread, and a redraw
    /// is requested for continuous rendering.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.poll_shader_changes();

        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(ctx) = self.device.as_ref() {
            // Wait for GPU to finish before destroying anything
            let _ = ctx.wait_idle();

            // Destroy in reverse order of creation!
            let mut transient: Vec<_> = self.frame_sync.iter().map(|f| f.command_buffer).collect();
            for frame in &self.frame_sync {
                frame.destroy(ctx);
            }
            ctx.free_command_buffers(&mut transient);
            self.frame_sync.clear();

            ctx.free_command_buffers(&mut self.draw_commands);

            if let Some(mut pipeline) = self.pipeline.take() {
                pipeline.destroy(ctx);
            }
            if let Some(mut surface) = self.surface.take() {
                surface.destroy(ctx);
            }
        }

        // DeviceContext::drop tears down the pool, device, and instance.
        self.device = None;

        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, EventKind, ModifyKind, RemoveKind};

    #[test]
    fn push_constants_fit_the_minimum_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= 128);
        // Push-constant ranges must be a multiple of 4 bytes; the block is
        // 16-aligned for the leading vec4.
        assert_eq!(std::mem::size_of::<PushConstants>() % 16, 0);
        assert_eq!(std::mem::align_of::<PushConstants>(), 16);
    }

    #[test]
    fn removal_triggers_a_rebuild() {
        assert!(should_rebuild(&EventKind::Remove(RemoveKind::File)));
        assert!(should_rebuild(&EventKind::Remove(RemoveKind::Any)));
    }

    #[test]
    fn other_changes_do_not_trigger_a_rebuild() {
        assert!(!should_rebuild(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(!should_rebuild(&EventKind::Modify(ModifyKind::Any)));
        assert!(!should_rebuild(&EventKind::Create(CreateKind::File)));
        assert!(!should_rebuild(&EventKind::Access(
            notify::event::AccessKind::Any
        )));
    }

    #[test]
    fn resolution_carries_aspect_ratio() {
        let resolution = resolution_for(vk::Extent2D {
            width: 900,
            height: 900,
        });
        assert_eq!(resolution, Vec3::new(900.0, 900.0, 1.0));

        let wide = resolution_for(vk::Extent2D {
            width: 1920,
            height: 1080,
        });
        assert!((wide.z - 16.0 / 9.0).abs() < f32::EPSILON);
    }
}
