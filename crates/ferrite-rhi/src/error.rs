//! RHI error types.

use ash::vk;
use thiserror::Error;

/// Errors surfaced by the render hardware interface.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No adapter passed the suitability checks.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// None of the candidate formats is supported by the adapter.
    #[error("No supported format among candidates: {0}")]
    NoSupportedFormat(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A create descriptor violated a shape invariant.
    #[error("Invalid {kind} descriptor: {reason}")]
    InvalidDescriptor {
        kind: &'static str,
        reason: String,
    },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A fence wait or submission failed mid-frame.
    #[error("Device lost: {0}")]
    DeviceLost(String),
}

impl RhiError {
    /// Build an [`RhiError::InvalidDescriptor`] and log it.
    pub(crate) fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!(kind, "{reason}");
        Self::InvalidDescriptor { kind, reason }
    }

    /// Whether the error should end the render loop.
    ///
    /// Descriptor violations are caller bugs on a single call; everything else
    /// leaves the device in a state the loop cannot recover from.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidDescriptor { .. })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_errors_are_not_fatal() {
        let err = RhiError::InvalidDescriptor {
            kind: "render pass",
            reason: "resolve count".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(RhiError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(RhiError::NoSuitableDevice.is_fatal());
    }

    #[test]
    fn descriptor_error_message_names_kind() {
        let err = RhiError::invalid("framebuffer", "expected 2 attachments, got 1");
        assert_eq!(
            err.to_string(),
            "Invalid framebuffer descriptor: expected 2 attachments, got 1"
        );
    }
}
