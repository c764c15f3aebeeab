use std::collections::HashSet;
use std::os::raw::c_char;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::loader::{LibloadingLoader, LIBRARY};
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{ExtDebugUtilsExtension, KhrSurfaceExtension};
use vulkanalia::window as vk_window;
use winit::window::Window;

use crate::callback::debug_callback;
use crate::config::{EngineConfig, VALIDATION_LAYER};
use crate::error::EngineError;

/// The Vulkan entry point, instance, debug messenger and window surface.
///
/// Destroyed last: every `DeviceContext` keeps an `Rc` to it.
pub struct InstanceContext {
    pub surface: vk::SurfaceKHR,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    instance: Instance,
    _entry: Entry,
    validation: bool,
}

impl InstanceContext {
    pub unsafe fn create(window: &Window, config: &EngineConfig) -> Result<Self> {
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;
        let (instance, messenger) = create_instance(window, &entry, config)?;
        let surface = match vk_window::create_surface(&instance, window) {
            Ok(surface) => surface,
            Err(e) => {
                if let Some(messenger) = messenger {
                    instance.destroy_debug_utils_messenger_ext(messenger, None);
                }
                instance.destroy_instance(None);
                return Err(anyhow!("failed to create window surface: {}", e));
            }
        };
        if config.validation {
            debug!("Created window surface.");
        }
        Ok(Self { surface, messenger, instance, _entry: entry, validation: config.validation })
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[inline]
    pub fn validation(&self) -> bool {
        self.validation
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_surface_khr(self.surface, None);
            if let Some(messenger) = self.messenger.take() {
                self.instance.destroy_debug_utils_messenger_ext(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn create_instance(
    window: &Window,
    entry: &Entry,
    config: &EngineConfig,
) -> Result<(Instance, Option<vk::DebugUtilsMessengerEXT>)> {
    // Application Info

    let application_info = vk::ApplicationInfo::builder()
        .application_name(b"Cube Engine\0")
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(b"No Engine\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 0, 0));

    // Layers

    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();
    if config.validation && !available_layers.contains(&VALIDATION_LAYER) {
        return Err(anyhow!(EngineError::ValidationUnavailable));
    }

    let layers: Vec<*const c_char> = if config.validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    // Extensions

    let mut extensions = vk_window::get_required_instance_extensions(window)
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    let flags = if cfg!(target_os = "macos") {
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());
        extensions.push(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_EXTENSION.name.as_ptr());
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    if config.validation {
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    // Create

    let mut info = vk::InstanceCreateInfo::builder()
        .flags(flags)
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
        .message_type(vk::DebugUtilsMessageTypeFlagsEXT::all())
        .user_callback(Some(debug_callback));

    if config.validation {
        info = info.push_next(&mut debug_info);
    }

    let instance = entry.create_instance(&info, None)?;

    // Messenger

    let messenger = if config.validation {
        match instance.create_debug_utils_messenger_ext(&debug_info, None) {
            Ok(messenger) => Some(messenger),
            Err(e) => {
                instance.destroy_instance(None);
                return Err(anyhow!("failed to set up debug messenger: {}", e));
            }
        }
    } else {
        None
    };

    info!("Created Vulkan instance (validation: {}).", config.validation);
    Ok((instance, messenger))
}
