use std::fmt;
use std::rc::Rc;

use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::KhrSwapchainExtension;

use crate::device::DeviceContext;

/// A device-level Vulkan handle that knows how to destroy itself.
pub trait DeviceObject: Copy + fmt::Debug {
    /// # Safety
    /// The handle must have been created from `device` and be unused by the GPU.
    unsafe fn destroy(self, device: &Device);
}

macro_rules! device_objects {
    ($($ty:ty => $destroy:ident),* $(,)?) => {
        $(
            impl DeviceObject for $ty {
                unsafe fn destroy(self, device: &Device) {
                    device.$destroy(self, None);
                }
            }
        )*
    };
}

device_objects! {
    vk::Buffer => destroy_buffer,
    vk::DeviceMemory => free_memory,
    vk::Image => destroy_image,
    vk::ImageView => destroy_image_view,
    vk::Sampler => destroy_sampler,
    vk::Framebuffer => destroy_framebuffer,
    vk::RenderPass => destroy_render_pass,
    vk::ShaderModule => destroy_shader_module,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::CommandPool => destroy_command_pool,
    vk::Semaphore => destroy_semaphore,
    vk::Fence => destroy_fence,
    vk::SwapchainKHR => destroy_swapchain_khr,
}

/// Owns a handle and destroys it when dropped.
///
/// Holding the `Rc<DeviceContext>` keeps the logical device alive until every
/// child object is gone, so a failure half way through setup releases the
/// objects built so far in reverse order.
pub struct Owned<T: DeviceObject> {
    handle: T,
    context: Rc<DeviceContext>,
}

impl<T: DeviceObject> Owned<T> {
    pub fn new(context: &Rc<DeviceContext>, handle: T) -> Self {
        Self { handle, context: Rc::clone(context) }
    }

    #[inline]
    pub fn handle(&self) -> T {
        self.handle
    }
}

impl<T: DeviceObject> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}

impl<T: DeviceObject> Drop for Owned<T> {
    fn drop(&mut self) {
        unsafe { self.handle.destroy(self.context.device()) };
    }
}
