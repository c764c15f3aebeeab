use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::KhrSwapchainExtension;
use winit::window::Window;

use crate::camera::UniformBufferObject;
use crate::config::{EngineConfig, MAX_FRAMES_IN_FLIGHT};
use crate::descriptor::Descriptors;
use crate::device::DeviceContext;
use crate::frame::{AcquireStatus, FenceStatus, FrameBackend, FrameSlot, PresentStatus};
use crate::instance::InstanceContext;
use crate::model::{GeometryBuffer, INDICES, VERTICES};
use crate::owned::Owned;
use crate::pipeline::Pipeline;
use crate::swapchain::Swapchain;
use crate::texture::{Texels, Texture};
use crate::transfer::Transfer;

const CHECKERBOARD_SIZE: u32 = 256;
const CHECKERBOARD_CELL: u32 = 32;

/// The window's drawable size in physical pixels.
pub fn framebuffer_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D { width: size.width, height: size.height }
}

/// Our Vulkan app: everything needed to draw the cube.
///
/// Fields drop in declaration order, so per-frame objects go first and the
/// device context, which owns the logical device, goes last.
pub struct App {
    slots: Vec<FrameSlot>,
    descriptors: Descriptors,
    geometry: GeometryBuffer,
    _texture: Texture,
    swapchain: Swapchain,
    pipeline: Pipeline,
    _command_pool: Owned<vk::CommandPool>,
    context: Rc<DeviceContext>,
}

impl App {
    pub unsafe fn create(window: &Window, config: &EngineConfig) -> Result<Self> {
        let instance = Rc::new(InstanceContext::create(window, config)?);
        let context = DeviceContext::create(instance, config)?;
        let command_pool = create_command_pool(&context)?;

        let mut swapchain = Swapchain::create(&context, framebuffer_extent(window))?;
        let pipeline = Pipeline::create(&context, swapchain.format())?;
        swapchain.build_targets(pipeline.render_pass())?;

        let transfer = Transfer::new(&context, command_pool.handle());
        let texels = match &config.texture {
            Some(path) => Texels::load(path)?,
            None => Texels::checkerboard(CHECKERBOARD_SIZE, CHECKERBOARD_CELL),
        };
        let texture = Texture::create(&context, &transfer, &texels)?;
        let geometry = GeometryBuffer::create(&context, &transfer, &VERTICES, INDICES)?;

        let slots = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::create(&context, command_pool.handle()))
            .collect::<Result<Vec<_>>>()?;
        let uniform_buffers = slots.iter().map(|s| s.uniform_buffer()).collect::<Vec<_>>();
        let descriptors = Descriptors::create(&context, pipeline.descriptor_set_layout(), &uniform_buffers, &texture)?;

        info!(
            "Ready: {} swapchain images, {} frames in flight, {}x{} texture.",
            swapchain.image_count(),
            slots.len(),
            texels.width,
            texels.height
        );
        Ok(Self {
            slots,
            descriptors,
            geometry,
            _texture: texture,
            swapchain,
            pipeline,
            _command_pool: command_pool,
            context,
        })
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.context.wait_idle() } {
            error!("Failed to wait for device idle: {}", e);
        }
    }
}

impl FrameBackend for App {
    fn wait_for_slot(&mut self, frame: usize, timeout: u64) -> Result<FenceStatus> {
        let fence = self.slots[frame].in_flight.handle();
        let status = unsafe { self.context.device().wait_for_fences(&[fence], true, timeout)? };
        Ok(match status {
            vk::SuccessCode::TIMEOUT => FenceStatus::TimedOut,
            _ => FenceStatus::Signaled,
        })
    }

    fn acquire_image(&mut self, frame: usize, timeout: u64) -> Result<AcquireStatus> {
        let semaphore = self.slots[frame].image_available.handle();
        let result = unsafe {
            self.context
                .device()
                .acquire_next_image_khr(self.swapchain.handle(), timeout, semaphore, vk::Fence::null())
        };
        // A suboptimal image is still acquired; presenting it reports the condition.
        match result {
            Ok((_, vk::SuccessCode::TIMEOUT)) | Ok((_, vk::SuccessCode::NOT_READY)) => Ok(AcquireStatus::TimedOut),
            Ok((image_index, _)) => Ok(AcquireStatus::Ready(image_index)),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(e) => Err(anyhow!(e)),
        }
    }

    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    fn write_uniforms(&mut self, frame: usize, ubo: &UniformBufferObject) -> Result<()> {
        unsafe { self.slots[frame].write_uniforms(ubo) };
        Ok(())
    }

    fn record_commands(&mut self, frame: usize, image_index: u32) -> Result<()> {
        let device = self.context.device();
        let command_buffer = self.slots[frame].command_buffer;
        let extent = self.swapchain.extent();

        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(command_buffer, &info)?;

            let render_area = vk::Rect2D::builder()
                .offset(vk::Offset2D::default())
                .extent(extent);
            let color_clear_value = vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] },
            };
            let depth_clear_value = vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            };
            // One per attachment: color, depth, resolve.
            let clear_values = &[color_clear_value, depth_clear_value, color_clear_value];
            let info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.pipeline.render_pass())
                .framebuffer(self.swapchain.framebuffer(image_index as usize))
                .render_area(render_area)
                .clear_values(clear_values);
            device.cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);

            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
            let viewport = vk::Viewport::builder()
                .x(0.0)
                .y(0.0)
                .width(extent.width as f32)
                .height(extent.height as f32)
                .min_depth(0.0)
                .max_depth(1.0);
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);

            device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.geometry.vertices.handle()], &[0]);
            device.cmd_bind_index_buffer(command_buffer, self.geometry.indices.handle(), 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                0,
                &[self.descriptors.set(frame)],
                &[],
            );
            device.cmd_draw_indexed(command_buffer, self.geometry.index_count, 1, 0, 0, 0);

            device.cmd_end_render_pass(command_buffer);
            device.end_command_buffer(command_buffer)?;
        }
        Ok(())
    }

    fn reset_fence(&mut self, frame: usize) -> Result<()> {
        unsafe { self.context.device().reset_fences(&[self.slots[frame].in_flight.handle()])? };
        Ok(())
    }

    fn submit(&mut self, frame: usize) -> Result<()> {
        let slot = &self.slots[frame];
        let wait_semaphores = &[slot.image_available.handle()];
        let wait_stages = &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = &[slot.command_buffer];
        let signal_semaphores = &[slot.render_finished.handle()];
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);
        unsafe {
            self.context
                .device()
                .queue_submit(self.context.graphics_queue, &[info], slot.in_flight.handle())?
        };
        Ok(())
    }

    fn present(&mut self, frame: usize, image_index: u32) -> Result<PresentStatus> {
        let wait_semaphores = &[self.slots[frame].render_finished.handle()];
        let swapchains = &[self.swapchain.handle()];
        let image_indices = &[image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);
        let result = unsafe { self.context.device().queue_present_khr(self.context.present_queue, &info) };
        match result {
            Ok(vk::SuccessCode::SUBOPTIMAL_KHR) => Ok(PresentStatus::Suboptimal),
            Ok(_) => Ok(PresentStatus::Presented),
            Err(vk::ErrorCode::OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(anyhow!(e)),
        }
    }

    fn recreate_swapchain(&mut self, framebuffer: vk::Extent2D) -> Result<()> {
        unsafe { self.swapchain.recreate(self.pipeline.render_pass(), framebuffer) }
    }
}

unsafe fn create_command_pool(context: &Rc<DeviceContext>) -> Result<Owned<vk::CommandPool>> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(context.indices.graphics);
    Ok(Owned::new(context, context.device().create_command_pool(&info, None)?))
}
