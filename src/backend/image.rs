// Attachment image utilities
//
// Depth buffers and multisampled render targets are device-local images the
// surface owns directly: image + memory + view, bound together and destroyed
// together.

use super::device::DeviceContext;
use super::error::RendererError;
use ash::vk;

/// An image, its backing device memory, and a view over it. Handles are null
/// until created; `destroy` is null-handle aware so partially built bundles
/// can be unwound.
#[derive(Clone, Copy)]
pub struct ImageBundle {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

impl ImageBundle {
    pub fn null() -> Self {
        Self {
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
        }
    }

    /// Destroy view, image, then memory. Safe to call on a partially built
    /// or already destroyed bundle.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        unsafe {
            if self.view != vk::ImageView::null() {
                ctx.device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                ctx.device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
            if self.memory != vk::DeviceMemory::null() {
                ctx.device.free_memory(self.memory, None);
                self.memory = vk::DeviceMemory::null();
            }
        }
    }
}

pub fn create_image_view(
    ctx: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView, RendererError> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe { ctx.device.create_image_view(&create_info, None) }?;
    Ok(view)
}

/// Create a device-local 2D image with bound memory and a view. On any
/// failure whatever was created inside this call is destroyed before the
/// error is returned.
pub fn create_image_and_view(
    ctx: &DeviceContext,
    format: vk::Format,
    extent: vk::Extent2D,
    usage: vk::ImageUsageFlags,
    samples: vk::SampleCountFlags,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<ImageBundle, RendererError> {
    let mut bundle = ImageBundle::null();

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(samples)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    bundle.image = unsafe { ctx.device.create_image(&image_info, None) }?;

    match bind_memory_and_view(ctx, &mut bundle, format, aspect_mask) {
        Ok(()) => Ok(bundle),
        Err(err) => {
            bundle.destroy(ctx);
            Err(err)
        }
    }
}

fn bind_memory_and_view(
    ctx: &DeviceContext,
    bundle: &mut ImageBundle,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<(), RendererError> {
    let requirements = unsafe { ctx.device.get_image_memory_requirements(bundle.image) };

    let memory_type_index = ctx.find_memory_type(
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    bundle.memory = unsafe { ctx.device.allocate_memory(&alloc_info, None) }?;

    unsafe { ctx.device.bind_image_memory(bundle.image, bundle.memory, 0) }?;

    bundle.view = create_image_view(ctx, bundle.image, format, aspect_mask)?;
    Ok(())
}
