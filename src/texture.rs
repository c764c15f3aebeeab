use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::memory::{create_image_view, Buffer, ImageAllocation, ImageDesc};
use crate::owned::Owned;
use crate::transfer::{mip_levels, Transfer};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
const MAX_ANISOTROPY: f32 = 16.0;

/// Tightly packed RGBA8 pixels, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texels {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Texels {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening texture `{}`", path.display()))?;
        let mut decoder = png::Decoder::new(file);
        decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut reader = decoder.read_info()?;
        let mut buffer = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buffer)?;
        buffer.truncate(info.buffer_size());

        let pixels = to_rgba(info.color_type, buffer)?;
        debug!("Loaded texture `{}` ({}x{}, {:?}).", path.display(), info.width, info.height, info.color_type);
        Ok(Self { width: info.width, height: info.height, pixels })
    }

    /// A `size` x `size` board of `cell` pixel squares, light in the top left.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let light = (x / cell + y / cell) % 2 == 0;
                let value = if light { 0xF0 } else { 0x50 };
                pixels.extend_from_slice(&[value, value, value, 0xFF]);
            }
        }
        Self { width: size, height: size, pixels }
    }
}

/// Widens 8-bit RGB to RGBA; RGBA passes through.
pub fn to_rgba(color_type: png::ColorType, data: Vec<u8>) -> Result<Vec<u8>> {
    match color_type {
        png::ColorType::Rgba => Ok(data),
        png::ColorType::Rgb => Ok(data.chunks_exact(3).flat_map(|p| [p[0], p[1], p[2], 0xFF]).collect()),
        other => Err(anyhow!(EngineError::UnsupportedTexture(other))),
    }
}

pub fn sampler_anisotropy(device_limit: f32) -> f32 {
    device_limit.min(MAX_ANISOTROPY).max(1.0)
}

/// Sampled image with its full mip chain, view and sampler.
#[derive(Debug)]
pub struct Texture {
    sampler: Owned<vk::Sampler>,
    view: Owned<vk::ImageView>,
    _image: ImageAllocation,
}

impl Texture {
    pub unsafe fn create(context: &Rc<DeviceContext>, transfer: &Transfer, texels: &Texels) -> Result<Self> {
        let staging = Buffer::staging(context, &texels.pixels)?;

        let features = context
            .instance()
            .get_physical_device_format_properties(context.physical_device, TEXTURE_FORMAT)
            .optimal_tiling_features;
        let mip_levels = if features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
            mip_levels(texels.width, texels.height)
        } else {
            warn!("{:?} does not support linear blitting, skipping mipmaps.", TEXTURE_FORMAT);
            1
        };

        let desc = ImageDesc {
            width: texels.width,
            height: texels.height,
            mip_levels,
            samples: vk::SampleCountFlags::_1,
            format: TEXTURE_FORMAT,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
        };
        let image = ImageAllocation::create(context, desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        transfer.transition_image_layout(
            image.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            mip_levels,
        )?;
        transfer.copy_buffer_to_image(staging.handle(), image.handle(), texels.width, texels.height)?;
        if mip_levels > 1 {
            transfer.generate_mipmaps(image.handle(), texels.width, texels.height, mip_levels)?;
        } else {
            transfer.transition_image_layout(
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                1,
            )?;
        }

        let view = create_image_view(context, image.handle(), TEXTURE_FORMAT, vk::ImageAspectFlags::COLOR, mip_levels)?;
        let sampler = create_sampler(context, mip_levels)?;
        if context.validation() {
            debug!("Created {}x{} texture with {} mip levels.", texels.width, texels.height, mip_levels);
        }
        Ok(Self { sampler, view, _image: image })
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    #[inline]
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }
}

unsafe fn create_sampler(context: &Rc<DeviceContext>, mip_levels: u32) -> Result<Owned<vk::Sampler>> {
    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(sampler_anisotropy(context.max_sampler_anisotropy))
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .mip_lod_bias(0.0);
    Ok(Owned::new(context, context.device().create_sampler(&info, None)?))
}
