// Frame synchronization
//
// GPU-side ordering comes from the surface's two semaphores: image-available
// gates color output until the image is really acquired, render-finished
// gates presentation until rendering completes. The per-image fence here is
// the only CPU-GPU ordering primitive; waiting on it is what makes it safe
// to re-record that image's transient command buffer.

use super::device::DeviceContext;
use super::error::RendererError;
use super::surface::Surface;
use ash::vk;

/// Per-swapchain-image transient state: the command buffer re-recorded every
/// frame (push-constant updates) and the fence that guards its reuse.
pub struct FrameSync {
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
}

impl FrameSync {
    /// One FrameSync per swapchain image. Fences start signaled so the first
    /// wait on each image passes immediately.
    pub fn for_images(ctx: &DeviceContext, count: usize) -> Result<Vec<Self>, RendererError> {
        let command_buffers = ctx.allocate_command_buffers(count as u32)?;

        let mut frames = Vec::with_capacity(count);
        for command_buffer in command_buffers {
            let fence = match ctx.create_fence(true) {
                Ok(fence) => fence,
                Err(err) => {
                    for frame in &frames {
                        Self::destroy(frame, ctx);
                    }
                    return Err(err);
                }
            };
            frames.push(Self {
                command_buffer,
                fence,
            });
        }
        Ok(frames)
    }

    /// Block until the previous submission that used this image's command
    /// buffer finished, then reset the fence for the coming submit. Must
    /// precede every re-record.
    pub fn wait_and_reset(&self, ctx: &DeviceContext) -> Result<(), RendererError> {
        ctx.wait_fences(&[self.fence], true, u64::MAX)?;
        ctx.reset_fences(&[self.fence])
    }

    pub fn destroy(&self, ctx: &DeviceContext) {
        ctx.destroy_fence(self.fence);
        // Command buffers are freed in bulk through the pool.
    }
}

/// Result of acquiring a swapchain image. Suboptimal still yields a usable
/// index; OutOfDate means the frame must be skipped. Both schedule a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Ready(u32),
    Suboptimal(u32),
    OutOfDate,
}

/// Result of a submit-then-present that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Complete,
    NeedsResize,
}

impl Surface {
    /// Block (device-side, unbounded) until a swapchain image is ready.
    /// Transient statuses are values, not errors; anything else is fatal.
    pub fn acquire_next_image(&self, ctx: &DeviceContext) -> Result<Acquired, RendererError> {
        let result = unsafe {
            ctx.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(Acquired::Ready(index)),
            Ok((index, true)) => Ok(Acquired::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(err) => Err(err.into()),
        }
    }

    /// Submit `buffers` (waiting on image-available, signaling
    /// render-finished and the optional `fence`), then present the image
    /// (waiting on render-finished). `image_index` must come from an
    /// immediately preceding acquire on this surface.
    pub fn submit_present(
        &self,
        ctx: &DeviceContext,
        buffers: &[vk::CommandBuffer],
        image_index: u32,
        fence: vk::Fence,
    ) -> Result<PresentStatus, RendererError> {
        let wait_semaphores = [self.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            ctx.device
                .queue_submit(ctx.graphics_queue, &[submit_info], fence)?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            ctx.swapchain_loader
                .queue_present(ctx.graphics_queue, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentStatus::Complete),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::NeedsResize),
            Err(err) => Err(err.into()),
        }
    }
}
