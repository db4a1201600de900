//! Validation message forwarding and command buffer labels.

use std::borrow::Cow;
use std::ffi::{c_void, CStr, CString};

use ash::vk;

use crate::error::Result;

/// Messenger forwarding validation output to `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install a messenger filtered to warnings and errors.
    ///
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils`.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = loader.create_debug_utils_messenger(&create_info, None)?;

        Ok(Self { loader, messenger })
    }

    /// Remove the messenger.
    ///
    /// # Safety
    /// Must run before the instance is destroyed.
    pub unsafe fn destroy(&mut self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
        self.messenger = vk::DebugUtilsMessengerEXT::null();
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader passes a valid callback data pointer for the call's duration.
    let callback_data = unsafe { &*p_callback_data };
    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        // SAFETY: p_message is a NUL-terminated string owned by the loader.
        unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy()
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "[{message_type:?}] {message}");
    } else {
        tracing::warn!(target: "vulkan", "[{message_type:?}] {message}");
    }

    vk::FALSE
}

/// Device-level debug-utils entry points.
///
/// When debug labels are disabled, or the extension is missing, every call is
/// a no-op.
pub struct DebugLabels {
    loader: Option<ash::ext::debug_utils::Device>,
}

impl DebugLabels {
    /// Labels backed by the device's debug-utils entry points.
    pub fn new(instance: &ash::Instance, device: &ash::Device, enabled: bool) -> Self {
        Self {
            loader: enabled.then(|| ash::ext::debug_utils::Device::new(instance, device)),
        }
    }

    /// Labels that record nothing.
    pub const fn disabled() -> Self {
        Self { loader: None }
    }

    pub const fn is_enabled(&self) -> bool {
        self.loader.is_some()
    }

    /// Open a labelled region.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn begin(&self, cmd: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        if let Some(loader) = &self.loader {
            let name = label_name(name);
            let label = vk::DebugUtilsLabelEXT::default()
                .label_name(&name)
                .color(color);
            loader.cmd_begin_debug_utils_label(cmd, &label);
        }
    }

    /// Close the innermost labelled region.
    ///
    /// # Safety
    /// The command buffer must be recording with an open label.
    pub unsafe fn end(&self, cmd: vk::CommandBuffer) {
        if let Some(loader) = &self.loader {
            loader.cmd_end_debug_utils_label(cmd);
        }
    }

    /// Insert a single label.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn insert(&self, cmd: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        if let Some(loader) = &self.loader {
            let name = label_name(name);
            let label = vk::DebugUtilsLabelEXT::default()
                .label_name(&name)
                .color(color);
            loader.cmd_insert_debug_utils_label(cmd, &label);
        }
    }

    /// Attach a debug name to a native object.
    ///
    /// # Safety
    /// The handle must belong to this device.
    pub unsafe fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if let Some(loader) = &self.loader {
            let name = label_name(name);
            let info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(&name);
            if let Err(e) = loader.set_debug_utils_object_name(&info) {
                tracing::debug!("Failed to name object {name:?}: {e}");
            }
        }
    }
}

/// Labels may come from user strings; interior NULs are stripped.
fn label_name(name: &str) -> CString {
    CString::new(name.replace('\0', "")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_name_strips_interior_nul() {
        assert_eq!(label_name("shadow\0pass").as_bytes(), b"shadowpass");
        assert_eq!(label_name("gbuffer").as_bytes(), b"gbuffer");
    }

    #[test]
    fn disabled_labels_report_disabled() {
        assert!(!DebugLabels::disabled().is_enabled());
    }
}
