use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{Handle, KhrSurfaceExtension, KhrSwapchainExtension};

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::memory::{create_image_view, ImageAllocation, ImageDesc};
use crate::owned::Owned;

/// What the surface offers a physical device.
#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: instance.get_physical_device_surface_capabilities_khr(physical_device, surface)?,
            formats: instance.get_physical_device_surface_formats_khr(physical_device, surface)?,
            present_modes: instance.get_physical_device_surface_present_modes_khr(physical_device, surface)?,
        })
    }
}

/// BGRA8 sRGB when offered anywhere in the list, the first format otherwise.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .cloned()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first().cloned())
}

pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .cloned()
        .find(|m| *m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, framebuffer: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: framebuffer.width.clamp(min.width, max.width.max(min.width)),
        height: framebuffer.height.clamp(min.height, max.height.max(min.height)),
    }
}

/// One more than the minimum, capped at the maximum (zero means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// Everything the create call needs, derived only from the surface support
/// and the current framebuffer size.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(support: &SwapchainSupport, framebuffer: vk::Extent2D) -> Result<Self> {
        let format = choose_surface_format(&support.formats).ok_or_else(|| anyhow!(EngineError::NoSurfaceFormat))?;
        Ok(Self {
            format,
            present_mode: choose_present_mode(&support.present_modes),
            extent: choose_extent(&support.capabilities, framebuffer),
            image_count: choose_image_count(&support.capabilities),
            transform: support.capabilities.current_transform,
        })
    }
}

/// A resolution-sized render target.
#[derive(Debug)]
pub struct Attachment {
    pub view: Owned<vk::ImageView>,
    pub image: ImageAllocation,
}

impl Attachment {
    unsafe fn create(
        context: &Rc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspects: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let desc = ImageDesc {
            width: extent.width,
            height: extent.height,
            mip_levels: 1,
            samples: context.msaa_samples,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
        };
        let image = ImageAllocation::create(context, desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let view = create_image_view(context, image.handle(), format, aspects, 1)?;
        Ok(Self { view, image })
    }
}

/// One view and, once a render pass exists, one framebuffer per chain image.
///
/// Rebuilding the views drops every framebuffer first, so the two lists never
/// describe different generations of the chain.
#[derive(Debug)]
pub struct ImageTargets<V, F> {
    framebuffers: Vec<F>,
    views: Vec<V>,
}

impl<V, F> ImageTargets<V, F> {
    pub fn new() -> Self {
        Self { framebuffers: Vec::new(), views: Vec::new() }
    }

    /// Framebuffers go before the views they reference.
    pub fn clear(&mut self) {
        self.framebuffers.clear();
        self.views.clear();
    }

    pub fn build_views<I>(&mut self, images: &[I], make: impl FnMut(&I) -> Result<V>) -> Result<()> {
        self.clear();
        self.views = images.iter().map(make).collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn build_framebuffers(&mut self, make: impl FnMut(&V) -> Result<F>) -> Result<()> {
        self.framebuffers.clear();
        self.framebuffers = self.views.iter().map(make).collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn framebuffer(&self, image_index: usize) -> &F {
        &self.framebuffers[image_index]
    }
}

impl<V, F> Default for ImageTargets<V, F> {
    fn default() -> Self {
        Self::new()
    }
}

/// The presentable image chain and everything sized by it.
///
/// Field order is drop order: framebuffers and image views, then the
/// attachments, then the chain itself.
pub struct Swapchain {
    targets: ImageTargets<Owned<vk::ImageView>, Owned<vk::Framebuffer>>,
    color: Option<Attachment>,
    depth: Option<Attachment>,
    images: Vec<vk::Image>,
    handle: Owned<vk::SwapchainKHR>,
    plan: SwapchainPlan,
    context: Rc<DeviceContext>,
}

impl Swapchain {
    /// Creates the chain and its image views. Framebuffers and attachments
    /// follow in `build_targets` once the render pass exists.
    pub unsafe fn create(context: &Rc<DeviceContext>, framebuffer: vk::Extent2D) -> Result<Self> {
        let (handle, plan) = create_chain(context, framebuffer, vk::SwapchainKHR::null())?;
        let mut swapchain = Self {
            targets: ImageTargets::new(),
            color: None,
            depth: None,
            images: Vec::new(),
            handle,
            plan,
            context: Rc::clone(context),
        };
        swapchain.build_views()?;
        Ok(swapchain)
    }

    /// Rebuilds the chain for `framebuffer` in place.
    pub unsafe fn recreate(&mut self, render_pass: vk::RenderPass, framebuffer: vk::Extent2D) -> Result<()> {
        self.context.wait_idle()?;

        self.targets.clear();
        self.color = None;
        self.depth = None;
        self.images.clear();

        let (handle, plan) = create_chain(&self.context, framebuffer, self.handle.handle())?;
        // Dropping the previous owner destroys the old chain.
        self.handle = handle;
        self.plan = plan;

        self.build_views()?;
        self.build_targets(render_pass)?;
        info!(
            "Recreated swapchain: {}x{}, {} images.",
            plan.extent.width,
            plan.extent.height,
            self.images.len()
        );
        Ok(())
    }

    unsafe fn build_views(&mut self) -> Result<()> {
        self.images = self.context.device().get_swapchain_images_khr(self.handle.handle())?;
        let context = &self.context;
        let format = self.plan.format.format;
        self.targets.build_views(&self.images, |image| {
            create_image_view(context, *image, format, vk::ImageAspectFlags::COLOR, 1)
        })
    }

    /// Creates the MSAA color target, the depth target and one framebuffer per image.
    pub unsafe fn build_targets(&mut self, render_pass: vk::RenderPass) -> Result<()> {
        let extent = self.plan.extent;
        let color = Attachment::create(
            &self.context,
            extent,
            self.plan.format.format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
        )?;
        let depth = Attachment::create(
            &self.context,
            extent,
            self.context.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;

        let context = &self.context;
        let (color_view, depth_view) = (color.view.handle(), depth.view.handle());
        self.targets.build_framebuffers(|view| {
            let attachments = &[color_view, depth_view, view.handle()];
            let info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            Ok(Owned::new(context, context.device().create_framebuffer(&info, None)?))
        })?;
        debug!(
            "Built {} framebuffers over {} image views.",
            self.targets.framebuffer_count(),
            self.targets.view_count()
        );

        self.color = Some(color);
        self.depth = Some(depth);
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle.handle()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.plan.format.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image_index: usize) -> vk::Framebuffer {
        self.targets.framebuffer(image_index).handle()
    }
}

unsafe fn create_chain(
    context: &Rc<DeviceContext>,
    framebuffer: vk::Extent2D,
    old_swapchain: vk::SwapchainKHR,
) -> Result<(Owned<vk::SwapchainKHR>, SwapchainPlan)> {
    let support = SwapchainSupport::get(context.instance(), context.surface(), context.physical_device)?;
    let plan = SwapchainPlan::new(&support, framebuffer)?;
    if context.validation() {
        debug!("Swapchain plan: {:?}", plan);
    }

    let indices = context.indices;
    let mut queue_family_indices = vec![];
    let image_sharing_mode = if indices.graphics != indices.present {
        queue_family_indices.push(indices.graphics);
        queue_family_indices.push(indices.present);
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    };

    let info = vk::SwapchainCreateInfoKHR::builder()
        .surface(context.surface())
        .min_image_count(plan.image_count)
        .image_format(plan.format.format)
        .image_color_space(plan.format.color_space)
        .image_extent(plan.extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(image_sharing_mode)
        .queue_family_indices(&queue_family_indices)
        .pre_transform(plan.transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(plan.present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let handle = context.device().create_swapchain_khr(&info, None)?;
    if old_swapchain.is_null() {
        info!(
            "Created swapchain: {}x{}, {:?}, {:?}.",
            plan.extent.width, plan.extent.height, plan.format.format, plan.present_mode
        );
    }
    Ok((Owned::new(context, handle), plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn capabilities(min_count: u32, max_count: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 64, height: 48 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2160 },
            ..Default::default()
        }
    }

    const ANY_EXTENT: vk::Extent2D = vk::Extent2D { width: u32::MAX, height: u32::MAX };

    fn support(caps: vk::SurfaceCapabilitiesKHR) -> SwapchainSupport {
        SwapchainSupport {
            capabilities: caps,
            formats: vec![
                format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn preferred_format_found_at_any_position() {
        let preferred = format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let others = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
        ];
        for position in 0..=others.len() {
            let mut formats = others.to_vec();
            formats.insert(position, preferred);
            let chosen = choose_surface_format(&formats).unwrap();
            assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
            assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        }
    }

    #[test]
    fn format_falls_back_to_first_offered() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn mailbox_preferred_over_fifo() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&[]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn fixed_current_extent_is_used_exactly() {
        let current = vk::Extent2D { width: 1280, height: 720 };
        let extent = choose_extent(&capabilities(2, 3, current), vk::Extent2D { width: 10, height: 10000 });
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn derived_extent_stays_within_bounds() {
        let caps = capabilities(2, 3, ANY_EXTENT);
        for width in [1, 63, 64, 65, 800, 1920, 4095, 4096, 4097, 10_000] {
            for height in [1, 47, 48, 600, 1080, 2160, 2161, 9_999] {
                let extent = choose_extent(&caps, vk::Extent2D { width, height });
                assert!((64..=4096).contains(&extent.width), "{}x{}", width, height);
                assert!((48..=2160).contains(&extent.height), "{}x{}", width, height);
                if (64..=4096).contains(&width) {
                    assert_eq!(extent.width, width);
                }
                if (48..=2160).contains(&height) {
                    assert_eq!(extent.height, height);
                }
            }
        }
    }

    #[test]
    fn image_count_within_surface_limits() {
        for min in 1..6 {
            for max in [0, min, min + 1, min + 4] {
                let count = choose_image_count(&capabilities(min, max, ANY_EXTENT));
                let upper = max.max(min + 1);
                assert!(count >= min && count <= upper, "min {} max {} -> {}", min, max, count);
                if max == 0 {
                    assert_eq!(count, min + 1);
                }
            }
        }
    }

    #[test]
    fn plan_depends_only_on_final_size() {
        let support = support(capabilities(2, 8, ANY_EXTENT));
        let sizes = [(800, 600), (1, 1), (0, 0), (3000, 200), (1024, 768)];
        let repeated = sizes
            .iter()
            .map(|&(width, height)| SwapchainPlan::new(&support, vk::Extent2D { width, height }).unwrap())
            .last()
            .unwrap();
        let single = SwapchainPlan::new(&support, vk::Extent2D { width: 1024, height: 768 }).unwrap();

        assert_eq!(repeated.format.format, single.format.format);
        assert_eq!(repeated.format.color_space, single.format.color_space);
        assert_eq!(repeated.present_mode, single.present_mode);
        assert_eq!((repeated.extent.width, repeated.extent.height), (single.extent.width, single.extent.height));
        assert_eq!(repeated.image_count, single.image_count);

        assert_eq!(single.format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(single.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(single.image_count, 3);
    }

    #[test]
    fn plan_requires_a_format() {
        let mut support = support(capabilities(2, 3, ANY_EXTENT));
        support.formats.clear();
        assert!(SwapchainPlan::new(&support, vk::Extent2D { width: 800, height: 600 }).is_err());
    }
    /// Stands in for a handle; records its own destruction.
    struct Tracked(&'static str, usize, Rc<RefCell<Vec<(&'static str, usize)>>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.2.borrow_mut().push((self.0, self.1));
        }
    }

    fn tracked_targets(
        targets: &mut ImageTargets<Tracked, Tracked>,
        images: &[usize],
        log: &Rc<RefCell<Vec<(&'static str, usize)>>>,
    ) -> Result<()> {
        targets.build_views(images, |&i| Ok(Tracked("view", i, Rc::clone(log))))?;
        targets.build_framebuffers(|view| Ok(Tracked("framebuffer", view.1, Rc::clone(log))))
    }

    #[test]
    fn one_view_and_framebuffer_per_image_across_recreation() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut targets = ImageTargets::new();
        tracked_targets(&mut targets, &[0, 1, 2], &log).unwrap();
        assert_eq!((targets.view_count(), targets.framebuffer_count()), (3, 3));
        assert_eq!(targets.framebuffer(2).1, 2);

        // The recreated chain hands out a different number of images.
        targets.clear();
        assert_eq!((targets.view_count(), targets.framebuffer_count()), (0, 0));
        tracked_targets(&mut targets, &[0, 1, 2, 3], &log).unwrap();
        assert_eq!((targets.view_count(), targets.framebuffer_count()), (4, 4));

        tracked_targets(&mut targets, &[0, 1], &log).unwrap();
        assert_eq!((targets.view_count(), targets.framebuffer_count()), (2, 2));
    }

    #[test]
    fn framebuffers_are_destroyed_before_views() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut targets = ImageTargets::new();
        tracked_targets(&mut targets, &[0, 1], &log).unwrap();
        targets.clear();
        let kinds = log.borrow().iter().map(|&(kind, _)| kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec!["framebuffer", "framebuffer", "view", "view"]);
    }

    #[test]
    fn rebuilding_views_discards_stale_framebuffers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut targets = ImageTargets::new();
        tracked_targets(&mut targets, &[0, 1, 2], &log).unwrap();
        targets.build_views(&[0, 1], |&i| Ok(Tracked("view", i, Rc::clone(&log)))).unwrap();
        assert_eq!((targets.view_count(), targets.framebuffer_count()), (2, 0));

        let failed = targets.build_framebuffers(|view| {
            if view.1 == 1 {
                Err(anyhow!("out of device memory"))
            } else {
                Ok(Tracked("framebuffer", view.1, Rc::clone(&log)))
            }
        });
        assert!(failed.is_err());
        assert_eq!(targets.framebuffer_count(), 0);
    }
}
