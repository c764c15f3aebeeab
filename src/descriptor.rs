use std::mem::size_of;
use std::rc::Rc;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;

use crate::camera::UniformBufferObject;
use crate::device::DeviceContext;
use crate::owned::Owned;
use crate::texture::Texture;

/// One uniform buffer and one combined image sampler per set.
pub fn pool_sizes(sets: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize::builder()
            .type_(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(sets)
            .build(),
        vk::DescriptorPoolSize::builder()
            .type_(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(sets)
            .build(),
    ]
}

/// A pool holding exactly one descriptor set per frame slot.
#[derive(Debug)]
pub struct Descriptors {
    sets: Vec<vk::DescriptorSet>,
    _pool: Owned<vk::DescriptorPool>,
}

impl Descriptors {
    /// Set `i` points at `uniform_buffers[i]` and the shared texture.
    pub unsafe fn create(
        context: &Rc<DeviceContext>,
        layout: vk::DescriptorSetLayout,
        uniform_buffers: &[vk::Buffer],
        texture: &Texture,
    ) -> Result<Self> {
        let device = context.device();
        let count = uniform_buffers.len() as u32;

        let sizes = pool_sizes(count);
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(count);
        let pool = Owned::new(context, device.create_descriptor_pool(&info, None)?);

        let layouts = vec![layout; uniform_buffers.len()];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool.handle())
            .set_layouts(&layouts);
        let sets = device.allocate_descriptor_sets(&info)?;

        for (set, buffer) in sets.iter().zip(uniform_buffers) {
            let buffer_info = vk::DescriptorBufferInfo::builder()
                .buffer(*buffer)
                .offset(0)
                .range(size_of::<UniformBufferObject>() as u64);
            let buffer_infos = &[buffer_info];
            let ubo_write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(buffer_infos);

            let image_info = vk::DescriptorImageInfo::builder()
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image_view(texture.view())
                .sampler(texture.sampler());
            let image_infos = &[image_info];
            let sampler_write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(1)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(image_infos);

            device.update_descriptor_sets(&[ubo_write, sampler_write], &[] as &[vk::CopyDescriptorSet]);
        }

        Ok(Self { sets, _pool: pool })
    }

    #[inline]
    pub fn set(&self, frame: usize) -> vk::DescriptorSet {
        self.sets[frame]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_covers_both_bindings_for_every_set() {
        let sizes = pool_sizes(2);
        assert_eq!(sizes[0].type_, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[1].type_, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert!(sizes.iter().all(|s| s.descriptor_count == 2));
    }
}
