// Presentation surface - swapchain, attachments, framebuffers
//
// A Surface owns every GPU object whose lifetime is tied to the window:
// the native surface, swapchain, color images/views, the depth buffer, the
// multisampled color/depth targets, and one framebuffer per swapchain image.
// The render pass and the two frame semaphores are created once and survive
// swapchain recreation (they depend on formats, not on extent).
//
// Resize is a transaction: a complete new resource set is built next to the
// old one, the old set is released only after every step succeeded, and any
// partial failure unwinds exactly what this call created. The render loop
// never observes a half-constructed surface.

use super::device::DeviceContext;
use super::error::RendererError;
use super::image::{create_image_and_view, create_image_view, ImageBundle};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

/// Preferred color format; the device may override it during negotiation.
const DESIRED_COLOR_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

pub struct Surface {
    pub(crate) surface: vk::SurfaceKHR,

    pub(crate) color_format: vk::SurfaceFormatKHR,
    pub(crate) depth_format: vk::Format,
    pub(crate) samples: vk::SampleCountFlags,
    pub(crate) present_mode: vk::PresentModeKHR,

    pub(crate) image_available: vk::Semaphore,
    pub(crate) render_finished: vk::Semaphore,
    pub(crate) render_pass: vk::RenderPass,

    pub(crate) capabilities: vk::SurfaceCapabilitiesKHR,
    pub(crate) extent: vk::Extent2D,
    pub(crate) viewport: vk::Viewport,
    pub(crate) scissor: vk::Rect2D,
    pub(crate) swapchain: vk::SwapchainKHR,

    pub(crate) color_images: Vec<vk::Image>,
    pub(crate) color_image_views: Vec<vk::ImageView>,

    pub(crate) depth_image: ImageBundle,
    pub(crate) color_target: ImageBundle,
    pub(crate) depth_target: ImageBundle,

    pub(crate) framebuffers: Vec<vk::Framebuffer>,
}

/// The new resource set a resize builds before touching the old one. All
/// handles start null; `destroy` unwinds in reverse creation order and is
/// safe on partially built sets.
struct SwapchainResources {
    swapchain: vk::SwapchainKHR,
    color_images: Vec<vk::Image>,
    color_image_views: Vec<vk::ImageView>,
    depth_image: ImageBundle,
    color_target: ImageBundle,
    depth_target: ImageBundle,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainResources {
    fn null() -> Self {
        Self {
            swapchain: vk::SwapchainKHR::null(),
            color_images: Vec::new(),
            color_image_views: Vec::new(),
            depth_image: ImageBundle::null(),
            color_target: ImageBundle::null(),
            depth_target: ImageBundle::null(),
            framebuffers: Vec::new(),
        }
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                ctx.device.destroy_framebuffer(framebuffer, None);
            }
            self.framebuffers.clear();

            self.depth_target.destroy(ctx);
            self.color_target.destroy(ctx);
            self.depth_image.destroy(ctx);

            for &view in &self.color_image_views {
                ctx.device.destroy_image_view(view, None);
            }
            self.color_image_views.clear();
            // Color images are owned by the swapchain; they go with it.
            self.color_images.clear();

            if self.swapchain != vk::SwapchainKHR::null() {
                ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }
}

impl Surface {
    /// Create a surface for `window` and size it to the window's current
    /// extent. `desired_present_mode` is used when the device lists it;
    /// FIFO otherwise.
    pub fn create(
        ctx: &DeviceContext,
        window: &Window,
        desired_present_mode: vk::PresentModeKHR,
        samples: vk::SampleCountFlags,
    ) -> Result<Self, RendererError> {
        let mut surface = Self {
            surface: vk::SurfaceKHR::null(),
            color_format: DESIRED_COLOR_FORMAT,
            depth_format: DEPTH_FORMAT,
            samples,
            present_mode: vk::PresentModeKHR::FIFO,
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            render_pass: vk::RenderPass::null(),
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            extent: vk::Extent2D::default(),
            viewport: vk::Viewport::default(),
            scissor: vk::Rect2D::default(),
            swapchain: vk::SwapchainKHR::null(),
            color_images: Vec::new(),
            color_image_views: Vec::new(),
            depth_image: ImageBundle::null(),
            color_target: ImageBundle::null(),
            depth_target: ImageBundle::null(),
            framebuffers: Vec::new(),
        };

        match surface.init(ctx, window, desired_present_mode) {
            Ok(()) => Ok(surface),
            Err(err) => {
                surface.destroy(ctx);
                Err(err)
            }
        }
    }

    fn init(
        &mut self,
        ctx: &DeviceContext,
        window: &Window,
        desired_present_mode: vk::PresentModeKHR,
    ) -> Result<(), RendererError> {
        self.surface = create_native_surface(ctx, window)?;

        let supported = unsafe {
            ctx.surface_loader.get_physical_device_surface_support(
                ctx.physical_device,
                ctx.graphics_queue_family,
                self.surface,
            )
        }?;
        if !supported {
            return Err(RendererError::SurfaceNotSupported);
        }

        let formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(ctx.physical_device, self.surface)
        }?;
        self.color_format = choose_surface_format(&formats, DESIRED_COLOR_FORMAT);

        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(ctx.physical_device, self.surface)
        }?;
        self.present_mode = choose_present_mode(&present_modes, desired_present_mode);
        log::info!(
            "Surface format {:?}, present mode {:?}",
            self.color_format.format,
            self.present_mode
        );

        self.image_available = create_semaphore(ctx)?;
        self.render_finished = create_semaphore(ctx)?;

        // Built once; depends only on formats and sample count, so every
        // swapchain this surface ever has renders through it.
        self.render_pass =
            create_render_pass(ctx, self.color_format.format, self.depth_format, self.samples)?;

        let size = window.inner_size();
        self.resize(
            ctx,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )
    }

    /// Rebuild all extent-dependent resources. Called once at startup and on
    /// every window resize or out-of-date/suboptimal presentation status.
    ///
    /// On failure the previous swapchain, images, and framebuffers remain
    /// installed and usable; only the partially built new set is destroyed.
    pub fn resize(
        &mut self,
        ctx: &DeviceContext,
        requested: vk::Extent2D,
    ) -> Result<(), RendererError> {
        let capabilities = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, self.surface)
        }?;

        let extent = clamp_extent(&capabilities, requested);
        log::debug!(
            "Resizing surface: requested {}x{}, actual {}x{}",
            requested.width,
            requested.height,
            extent.width,
            extent.height
        );

        let mut new = SwapchainResources::null();
        if let Err(err) = self.build_resources(ctx, &capabilities, extent, &mut new) {
            new.destroy(ctx);
            return Err(err);
        }

        // Every new resource exists; now it is safe to drop the old set.
        if self.swapchain != vk::SwapchainKHR::null() {
            self.release(ctx);
        }

        self.capabilities = capabilities;
        self.extent = extent;
        self.viewport = viewport_for(extent);
        self.scissor = scissor_for(extent);
        self.swapchain = new.swapchain;
        self.color_images = std::mem::take(&mut new.color_images);
        self.color_image_views = std::mem::take(&mut new.color_image_views);
        self.depth_image = new.depth_image;
        self.color_target = new.color_target;
        self.depth_target = new.depth_target;
        self.framebuffers = std::mem::take(&mut new.framebuffers);

        Ok(())
    }

    fn build_resources(
        &self,
        ctx: &DeviceContext,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        extent: vk::Extent2D,
        new: &mut SwapchainResources,
    ) -> Result<(), RendererError> {
        // Passing the old swapchain lets the device recycle its images.
        new.swapchain = create_swapchain(
            ctx,
            self.surface,
            capabilities,
            extent,
            self.color_format,
            self.present_mode,
            self.swapchain,
        )?;

        new.color_images = unsafe { ctx.swapchain_loader.get_swapchain_images(new.swapchain) }?;
        for &image in &new.color_images {
            let view = create_image_view(
                ctx,
                image,
                self.color_format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            new.color_image_views.push(view);
        }
        log::info!("Created swapchain with {} images", new.color_images.len());

        new.depth_image = create_image_and_view(
            ctx,
            self.depth_format,
            extent,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageAspectFlags::DEPTH,
        )?;
        transition_depth_image(ctx, new.depth_image.image)?;

        new.color_target = create_image_and_view(
            ctx,
            self.color_format.format,
            extent,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            self.samples,
            vk::ImageAspectFlags::COLOR,
        )?;

        new.depth_target = create_image_and_view(
            ctx,
            self.depth_format,
            extent,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            self.samples,
            vk::ImageAspectFlags::DEPTH,
        )?;

        for &view in &new.color_image_views {
            let attachments = [
                new.color_target.view,
                view,
                new.depth_target.view,
                new.depth_image.view,
            ];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer =
                unsafe { ctx.device.create_framebuffer(&framebuffer_info, None) }?;
            new.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Destroy all swapchain-dependent resources in dependency order. The
    /// render pass, semaphores, and native surface survive.
    fn release(&mut self, ctx: &DeviceContext) {
        // Coarse barrier: nothing below may still be referenced by in-flight
        // work when it is destroyed.
        let _ = ctx.wait_idle();

        unsafe {
            for &framebuffer in &self.framebuffers {
                ctx.device.destroy_framebuffer(framebuffer, None);
            }
            self.framebuffers.clear();

            self.depth_target.destroy(ctx);
            self.color_target.destroy(ctx);
            self.depth_image.destroy(ctx);

            for &view in &self.color_image_views {
                ctx.device.destroy_image_view(view, None);
            }
            self.color_image_views.clear();
            self.color_images.clear();

            if self.swapchain != vk::SwapchainKHR::null() {
                ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
    }

    /// Full teardown, including the resources that survive resizes.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        self.release(ctx);

        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                ctx.device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
            if self.render_finished != vk::Semaphore::null() {
                ctx.device.destroy_semaphore(self.render_finished, None);
                self.render_finished = vk::Semaphore::null();
            }
            if self.image_available != vk::Semaphore::null() {
                ctx.device.destroy_semaphore(self.image_available, None);
                self.image_available = vk::Semaphore::null();
            }
            if self.surface != vk::SurfaceKHR::null() {
                ctx.surface_loader.destroy_surface(self.surface, None);
                self.surface = vk::SurfaceKHR::null();
            }
        }
    }

    pub fn num_images(&self) -> usize {
        self.color_images.len()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        self.framebuffers[index]
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    pub fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }
}

// =============================================================================
// CREATION HELPERS
// =============================================================================

#[cfg(target_os = "windows")]
fn create_native_surface(
    ctx: &DeviceContext,
    window: &Window,
) -> Result<vk::SurfaceKHR, RendererError> {
    use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

    let window_handle = window
        .window_handle()
        .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
        .as_raw();
    let display_handle = window
        .display_handle()
        .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
        .as_raw();

    match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = ash::extensions::khr::Win32Surface::new(ctx.entry(), &ctx.instance);
            let surface = unsafe { loader.create_win32_surface(&create_info, None) }?;
            Ok(surface)
        }
        _ => Err(RendererError::InitializationFailed(
            "unsupported window handle type".into(),
        )),
    }
}

#[cfg(not(target_os = "windows"))]
fn create_native_surface(
    ctx: &DeviceContext,
    window: &Window,
) -> Result<vk::SurfaceKHR, RendererError> {
    use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

    let window_handle = window
        .window_handle()
        .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
        .as_raw();
    let display_handle = window
        .display_handle()
        .map_err(|e| RendererError::InitializationFailed(e.to_string()))?
        .as_raw();

    match (display_handle, window_handle) {
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .ok_or_else(|| {
                    RendererError::InitializationFailed("no Xlib display connection".into())
                })?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(handle.window);
            let loader = ash::extensions::khr::XlibSurface::new(ctx.entry(), &ctx.instance);
            let surface = unsafe { loader.create_xlib_surface(&create_info, None) }?;
            Ok(surface)
        }
        _ => Err(RendererError::InitializationFailed(
            "unsupported window handle type".into(),
        )),
    }
}

fn create_semaphore(ctx: &DeviceContext) -> Result<vk::Semaphore, RendererError> {
    let create_info = vk::SemaphoreCreateInfo::builder();
    let semaphore = unsafe { ctx.device.create_semaphore(&create_info, None) }?;
    Ok(semaphore)
}

/// Render pass with four attachments: multisampled color (cleared, resolved
/// into the swapchain image), the swapchain image itself, multisampled depth,
/// and a single-sample depth resolve image.
fn create_render_pass(
    ctx: &DeviceContext,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass, RendererError> {
    let attachments = [
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build(),
        vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build(),
        vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
        vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build(),
    ];

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let resolve_ref = [vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 2,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .resolve_attachments(&resolve_ref)
        .depth_stencil_attachment(&depth_ref)
        .build();

    let dependencies = [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
    ];

    let subpasses = [subpass];
    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { ctx.device.create_render_pass(&render_pass_info, None) }?;
    Ok(render_pass)
}

fn create_swapchain(
    ctx: &DeviceContext,
    surface: vk::SurfaceKHR,
    capabilities: &vk::SurfaceCapabilitiesKHR,
    extent: vk::Extent2D,
    color_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    old_swapchain: vk::SwapchainKHR,
) -> Result<vk::SwapchainKHR, RendererError> {
    // One more than the minimum so acquire rarely blocks on the driver.
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(color_format.format)
        .image_color_space(color_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None) }?;
    Ok(swapchain)
}

/// Move the fresh depth buffer out of UNDEFINED before its first use as an
/// attachment. Submitted one-time and waited on synchronously; the command
/// buffer is freed immediately after the fenced wait.
fn transition_depth_image(ctx: &DeviceContext, image: vk::Image) -> Result<(), RendererError> {
    let buffers = ctx.allocate_command_buffers(1)?;
    let cmd = buffers[0];

    let result = (|| {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            ctx.device.begin_command_buffer(cmd, &begin_info)?;

            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .build();

            ctx.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );

            ctx.device.end_command_buffer(cmd)?;
        }

        ctx.submit(&buffers, true)
    })();

    ctx.free_completed(&buffers);
    result
}

// =============================================================================
// NEGOTIATION (pure; unit-tested below)
// =============================================================================

/// Prefer `desired` when the device reports "any format" or lists it
/// explicitly; fall back to the first reported format.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> vk::SurfaceFormatKHR {
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        return desired;
    }

    formats
        .iter()
        .copied()
        .find(|f| f.format == desired.format && f.color_space == desired.color_space)
        .unwrap_or_else(|| formats[0])
}

/// Prefer `desired` when listed; otherwise FIFO, the one mode Vulkan
/// requires every device to support.
fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    desired: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&desired) {
        desired
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// A fixed `current_extent` is mandatory; otherwise clamp the request into
/// the supported range.
fn clamp_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

fn viewport_for(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

fn scissor_for(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_uses_device_fixed_current_extent() {
        let caps = capabilities((1024, 768), (1, 1), (4096, 4096));
        let extent = clamp_extent(&caps, vk::Extent2D { width: 900, height: 900 });
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn extent_is_clamped_into_supported_range() {
        let caps = capabilities((u32::MAX, u32::MAX), (64, 64), (2048, 2048));

        let small = clamp_extent(&caps, vk::Extent2D { width: 1, height: 1 });
        assert_eq!((small.width, small.height), (64, 64));

        let large = clamp_extent(&caps, vk::Extent2D { width: 8192, height: 8192 });
        assert_eq!((large.width, large.height), (2048, 2048));

        let fits = clamp_extent(&caps, vk::Extent2D { width: 900, height: 900 });
        assert_eq!((fits.width, fits.height), (900, 900));
    }

    #[test]
    fn viewport_covers_the_whole_extent() {
        // Window created at 900x900: viewport (0,0,900,900), depth [0,1].
        let viewport = viewport_for(vk::Extent2D { width: 900, height: 900 });
        assert_eq!(viewport.x, 0.0);
        assert_eq!(viewport.y, 0.0);
        assert_eq!(viewport.width, 900.0);
        assert_eq!(viewport.height, 900.0);
        assert_eq!(viewport.min_depth, 0.0);
        assert_eq!(viewport.max_depth, 1.0);

        let scissor = scissor_for(vk::Extent2D { width: 900, height: 900 });
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
        assert_eq!(scissor.extent.width, 900);
        assert_eq!(scissor.extent.height, 900);
    }

    #[test]
    fn any_format_report_yields_desired_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let chosen = choose_surface_format(&formats, DESIRED_COLOR_FORMAT);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn listed_desired_format_wins() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats, DESIRED_COLOR_FORMAT);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn unlisted_desired_format_falls_back_to_first() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats, DESIRED_COLOR_FORMAT);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn listed_present_mode_wins() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn unlisted_present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }
}
