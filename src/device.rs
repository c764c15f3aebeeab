use std::collections::HashSet;
use std::os::raw::c_char;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use thiserror::Error;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::KhrSurfaceExtension;

use crate::config::{EngineConfig, DEVICE_EXTENSIONS, PORTABILITY_EXTENSIONS, VALIDATION_LAYER};
use crate::error::EngineError;
use crate::instance::InstanceContext;
use crate::swapchain::SwapchainSupport;

/// Added to the score of discrete GPUs.
pub const DISCRETE_GPU_BONUS: u32 = 1000;

#[derive(Debug, Error)]
#[error("Missing {0}.")]
pub struct SuitabilityError(pub &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// The first graphics-capable family and the first family that can present.
    pub fn resolve(families: &[vk::QueueFlags], present_support: &[bool]) -> Option<Self> {
        let graphics = families
            .iter()
            .position(|flags| flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);
        let present = present_support.iter().position(|supported| *supported).map(|i| i as u32);
        match (graphics, present) {
            (Some(graphics), Some(present)) => Some(Self { graphics, present }),
            _ => None,
        }
    }

    pub fn unique(&self) -> Vec<u32> {
        let mut indices = vec![self.graphics];
        if self.present != self.graphics {
            indices.push(self.present);
        }
        indices
    }
}

/// What the selector needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub geometry_shader: bool,
    pub sampler_anisotropy: bool,
    pub extensions_supported: bool,
    pub surface_formats: usize,
    pub present_modes: usize,
    pub color_sample_counts: vk::SampleCountFlags,
    pub depth_sample_counts: vk::SampleCountFlags,
}

/// The two queries device selection depends on.
pub trait DeviceQuery {
    type Device: Copy;

    fn capabilities(&self, device: Self::Device) -> Result<DeviceCapabilities>;
    fn queue_families(&self, device: Self::Device) -> Result<Option<QueueFamilyIndices>>;
}

#[derive(Debug, Clone, Copy)]
pub struct Selection<D> {
    pub device: D,
    pub indices: QueueFamilyIndices,
    pub msaa_samples: vk::SampleCountFlags,
    pub score: u32,
}

pub fn check_suitability(caps: &DeviceCapabilities, indices: Option<QueueFamilyIndices>) -> Result<QueueFamilyIndices> {
    if !caps.extensions_supported {
        return Err(anyhow!(SuitabilityError("required device extensions")));
    }
    if caps.surface_formats == 0 || caps.present_modes == 0 {
        return Err(anyhow!(SuitabilityError("sufficient swapchain support")));
    }
    if !caps.sampler_anisotropy {
        return Err(anyhow!(SuitabilityError("sampler anisotropy")));
    }
    indices.ok_or_else(|| anyhow!(SuitabilityError("graphics or present queue family")))
}

/// Zero disqualifies the device.
pub fn score_device(caps: &DeviceCapabilities) -> u32 {
    if !caps.geometry_shader {
        return 0;
    }
    let bonus = if caps.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        DISCRETE_GPU_BONUS
    } else {
        0
    };
    bonus.saturating_add(caps.max_image_dimension_2d)
}

pub fn max_usable_sample_count(color: vk::SampleCountFlags, depth: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let counts = color & depth;
    [
        vk::SampleCountFlags::_64,
        vk::SampleCountFlags::_32,
        vk::SampleCountFlags::_16,
        vk::SampleCountFlags::_8,
        vk::SampleCountFlags::_4,
        vk::SampleCountFlags::_2,
    ]
    .iter()
    .cloned()
    .find(|c| counts.contains(*c))
    .unwrap_or(vk::SampleCountFlags::_1)
}

/// Picks the highest scoring suitable device; the last enumerated one wins a tie.
pub fn select_device<Q: DeviceQuery>(
    query: &Q,
    candidates: &[Q::Device],
    verbose: bool,
) -> Result<Selection<Q::Device>> {
    if candidates.is_empty() {
        return Err(anyhow!(EngineError::NoVulkanDevice));
    }

    let mut best: Option<((bool, bool, u32), Selection<Q::Device>)> = None;
    for &device in candidates {
        let caps = query.capabilities(device)?;
        let indices = match check_suitability(&caps, query.queue_families(device)?) {
            Ok(indices) => indices,
            Err(error) => {
                warn!("Skipping physical device (`{}`): {}", caps.name, error);
                continue;
            }
        };
        let score = score_device(&caps);
        if verbose {
            debug!(
                "Device `{}`: type {:?}, max 2D {}, geometry shader {}, score {}",
                caps.name, caps.device_type, caps.max_image_dimension_2d, caps.geometry_shader, score
            );
        }
        let rank = device_rank(&caps, score);
        if best.as_ref().map_or(true, |(best_rank, _)| rank >= *best_rank) {
            let selection = Selection {
                device,
                indices,
                msaa_samples: max_usable_sample_count(caps.color_sample_counts, caps.depth_sample_counts),
                score,
            };
            best = Some((rank, selection));
        }
    }

    match best {
        Some((_, selection)) if selection.score > 0 => Ok(selection),
        _ => Err(anyhow!(EngineError::NoSuitableDevice)),
    }
}

/// Orders candidates: usable before disqualified, discrete before anything
/// else, then by score. The discrete bonus therefore always dominates even
/// when another device reports a larger image dimension.
fn device_rank(caps: &DeviceCapabilities, score: u32) -> (bool, bool, u32) {
    let discrete = caps.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
    (score > 0, discrete && score > 0, score)
}

/// `DeviceQuery` over a live instance and window surface.
pub struct VulkanDeviceQuery<'a> {
    pub instance: &'a Instance,
    pub surface: vk::SurfaceKHR,
}

impl DeviceQuery for VulkanDeviceQuery<'_> {
    type Device = vk::PhysicalDevice;

    fn capabilities(&self, device: vk::PhysicalDevice) -> Result<DeviceCapabilities> {
        unsafe {
            let properties = self.instance.get_physical_device_properties(device);
            let features = self.instance.get_physical_device_features(device);
            let extensions = self
                .instance
                .enumerate_device_extension_properties(device, None)?
                .iter()
                .map(|e| e.extension_name)
                .collect::<HashSet<_>>();
            let extensions_supported = DEVICE_EXTENSIONS.iter().all(|e| extensions.contains(e));
            let (surface_formats, present_modes) = if extensions_supported {
                let support = SwapchainSupport::get(self.instance, self.surface, device)?;
                (support.formats.len(), support.present_modes.len())
            } else {
                (0, 0)
            };
            Ok(DeviceCapabilities {
                name: properties.device_name.to_string(),
                device_type: properties.device_type,
                max_image_dimension_2d: properties.limits.max_image_dimension_2d,
                geometry_shader: features.geometry_shader == vk::TRUE,
                sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
                extensions_supported,
                surface_formats,
                present_modes,
                color_sample_counts: properties.limits.framebuffer_color_sample_counts,
                depth_sample_counts: properties.limits.framebuffer_depth_sample_counts,
            })
        }
    }

    fn queue_families(&self, device: vk::PhysicalDevice) -> Result<Option<QueueFamilyIndices>> {
        unsafe {
            let families = self
                .instance
                .get_physical_device_queue_family_properties(device)
                .iter()
                .map(|p| p.queue_flags)
                .collect::<Vec<_>>();
            let mut present = Vec::with_capacity(families.len());
            for index in 0..families.len() {
                let supported =
                    self.instance.get_physical_device_surface_support_khr(device, index as u32, self.surface)?;
                present.push(supported);
            }
            Ok(QueueFamilyIndices::resolve(&families, &present))
        }
    }
}

/// The chosen physical device, its logical device and queues.
pub struct DeviceContext {
    device: Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub indices: QueueFamilyIndices,
    pub msaa_samples: vk::SampleCountFlags,
    pub depth_format: vk::Format,
    pub max_sampler_anisotropy: f32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    instance: Rc<InstanceContext>,
}

impl DeviceContext {
    pub unsafe fn create(instance: Rc<InstanceContext>, config: &EngineConfig) -> Result<Rc<Self>> {
        let selection = {
            let query = VulkanDeviceQuery { instance: instance.instance(), surface: instance.surface };
            let candidates = instance.instance().enumerate_physical_devices()?;
            select_device(&query, &candidates, config.validation)?
        };
        let physical_device = selection.device;
        let vk_instance = instance.instance();
        let properties = vk_instance.get_physical_device_properties(physical_device);
        info!(
            "Selected physical device (`{}`), score {}, {:?} MSAA.",
            properties.device_name, selection.score, selection.msaa_samples
        );

        let depth_format = pick_format(
            &[vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT],
            |format| vk_instance.get_physical_device_format_properties(physical_device, format).optimal_tiling_features,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or_else(|| anyhow!(EngineError::NoDepthFormat))?;

        let device = create_logical_device(vk_instance, physical_device, selection.indices, config)?;
        let graphics_queue = device.get_device_queue(selection.indices.graphics, 0);
        let present_queue = device.get_device_queue(selection.indices.present, 0);
        let memory_properties = vk_instance.get_physical_device_memory_properties(physical_device);

        Ok(Rc::new(Self {
            device,
            physical_device,
            graphics_queue,
            present_queue,
            indices: selection.indices,
            msaa_samples: selection.msaa_samples,
            depth_format,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            memory_properties,
            instance,
        }))
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        self.instance.instance()
    }

    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.instance.surface
    }

    #[inline]
    pub fn validation(&self) -> bool {
        self.instance.validation()
    }

    /// Property flags of each memory type, indexed by memory type index.
    pub fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count].iter().map(|t| t.property_flags).collect()
    }

    pub unsafe fn wait_idle(&self) -> Result<()> {
        self.device.device_wait_idle()?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };
    }
}

/// The first candidate whose optimal-tiling features include `required`.
pub fn pick_format<F>(candidates: &[vk::Format], features: F, required: vk::FormatFeatureFlags) -> Option<vk::Format>
where
    F: Fn(vk::Format) -> vk::FormatFeatureFlags,
{
    candidates.iter().cloned().find(|f| features(*f).contains(required))
}

unsafe fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
    config: &EngineConfig,
) -> Result<Device> {
    let queue_priorities = &[1.0];
    let queue_infos = indices
        .unique()
        .iter()
        .map(|i| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(*i)
                .queue_priorities(queue_priorities)
        })
        .collect::<Vec<_>>();

    let layers: Vec<*const c_char> = if config.validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let mut extensions = DEVICE_EXTENSIONS.iter().map(|n| n.as_ptr()).collect::<Vec<_>>();
    if cfg!(target_os = "macos") {
        extensions.extend(PORTABILITY_EXTENSIONS.iter().map(|n| n.as_ptr()));
    }

    let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);
    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_layer_names(&layers)
        .enabled_features(&features)
        .enabled_extension_names(&extensions);
    let device = instance.create_device(physical_device, &info, None)?;
    if config.validation {
        debug!("Created logical device with queue families {:?}.", indices);
    }
    Ok(device)
}
