use std::mem::size_of;
use std::ptr::copy_nonoverlapping as memcpy;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use vulkanalia::prelude::v1_0::*;

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::owned::Owned;

/// Index of the first memory type allowed by `type_bits` that has every flag in `properties`.
pub fn find_memory_type(
    types: &[vk::MemoryPropertyFlags],
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, flags)| type_bits & (1 << i) != 0 && flags.contains(properties))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| anyhow!(EngineError::NoMemoryType { type_bits, properties }))
}

unsafe fn allocate(
    context: &Rc<DeviceContext>,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<Owned<vk::DeviceMemory>> {
    let memory_type = find_memory_type(&context.memory_types(), requirements.memory_type_bits, properties)?;
    let info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);
    let memory = context.device().allocate_memory(&info, None)?;
    Ok(Owned::new(context, memory))
}

/// A buffer bound to its own allocation.
#[derive(Debug)]
pub struct Buffer {
    pub buffer: Owned<vk::Buffer>,
    pub memory: Owned<vk::DeviceMemory>,
    pub size: vk::DeviceSize,
}

impl Buffer {
    pub unsafe fn create(
        context: &Rc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = context.device();
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = Owned::new(context, device.create_buffer(&info, None)?);
        let requirements = device.get_buffer_memory_requirements(buffer.handle());
        let memory = allocate(context, requirements, properties)?;
        device.bind_buffer_memory(buffer.handle(), memory.handle(), 0)?;
        Ok(Self { buffer, memory, size })
    }

    /// A host-visible, coherent buffer used as a transfer source.
    pub unsafe fn staging<T: Copy>(context: &Rc<DeviceContext>, data: &[T]) -> Result<Self> {
        let size = (size_of::<T>() * data.len()) as vk::DeviceSize;
        let staging = Self::create(
            context,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_COHERENT | vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;
        staging.write(context.device(), data)?;
        Ok(staging)
    }

    /// Copies `data` to the start of host-visible memory.
    pub unsafe fn write<T: Copy>(&self, device: &Device, data: &[T]) -> Result<()> {
        let size = (size_of::<T>() * data.len()) as vk::DeviceSize;
        let memory = device.map_memory(self.memory.handle(), 0, size, vk::MemoryMapFlags::empty())?;
        memcpy(data.as_ptr(), memory.cast(), data.len());
        device.unmap_memory(self.memory.handle());
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }
}

/// An image bound to its own allocation.
#[derive(Debug)]
pub struct ImageAllocation {
    pub image: Owned<vk::Image>,
    pub memory: Owned<vk::DeviceMemory>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

impl ImageAllocation {
    pub unsafe fn create(
        context: &Rc<DeviceContext>,
        desc: ImageDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let device = context.device();
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::_2D)
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(desc.samples);
        let image = Owned::new(context, device.create_image(&info, None)?);
        let requirements = device.get_image_memory_requirements(image.handle());
        let memory = allocate(context, requirements, properties)?;
        device.bind_image_memory(image.handle(), memory.handle(), 0)?;
        Ok(Self { image, memory })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image.handle()
    }
}

pub unsafe fn create_image_view(
    context: &Rc<DeviceContext>,
    image: vk::Image,
    format: vk::Format,
    aspects: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<Owned<vk::ImageView>> {
    let subresource_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(aspects)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(1);
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::_2D)
        .format(format)
        .subresource_range(subresource_range);
    Ok(Owned::new(context, context.device().create_image_view(&info, None)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;

    fn types() -> Vec<vk::MemoryPropertyFlags> {
        vec![
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]
    }

    #[test]
    fn first_matching_type_wins() {
        assert_eq!(find_memory_type(&types(), 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(find_memory_type(&types(), 0b1111, HOST | vk::MemoryPropertyFlags::HOST_COHERENT).unwrap(), 2);
    }

    #[test]
    fn type_filter_is_respected() {
        assert_eq!(find_memory_type(&types(), 0b1010, HOST).unwrap(), 1);
        assert_eq!(find_memory_type(&types(), 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(), 3);
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(find_memory_type(&types(), 0b0001, HOST).is_err());
        assert!(find_memory_type(&types(), 0, vk::MemoryPropertyFlags::empty()).is_err());
        assert!(find_memory_type(&types(), 0b1111, vk::MemoryPropertyFlags::LAZILY_ALLOCATED).is_err());
    }
}
