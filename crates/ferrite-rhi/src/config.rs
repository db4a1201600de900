//! RHI configuration.

use ash::vk;

/// Platform family, as far as loader setup is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    Windows,
    MacOs,
    Other,
}

impl TargetPlatform {
    /// The platform this crate was compiled for.
    pub const fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Other
        }
    }
}

/// Loader search paths injected into the process environment at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderEnvironment {
    /// Directory holding the validation layer manifests (`VK_LAYER_PATH`).
    pub layer_path: Option<String>,
    /// ICD manifest for the portability driver (`VK_ICD_FILENAMES`, macOS only).
    pub icd_filenames: Option<String>,
}

impl LoaderEnvironment {
    /// Paths baked in at compile time through `FERRITE_VK_LAYER_PATH` and
    /// `FERRITE_VK_ICD_FILENAMES`.
    pub fn from_build() -> Self {
        Self {
            layer_path: option_env!("FERRITE_VK_LAYER_PATH").map(String::from),
            icd_filenames: option_env!("FERRITE_VK_ICD_FILENAMES").map(String::from),
        }
    }

    /// Variables to set for the given platform, in the order they are applied.
    pub fn variables(&self, platform: TargetPlatform) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if let Some(path) = &self.layer_path {
            vars.push(("VK_LAYER_PATH", path.clone()));
        }
        match platform {
            TargetPlatform::MacOs => {
                if let Some(icd) = &self.icd_filenames {
                    vars.push(("VK_ICD_FILENAMES", icd.clone()));
                }
            }
            TargetPlatform::Windows => {
                // The AMD switchable-graphics implicit layer breaks adapter enumeration.
                vars.push(("DISABLE_LAYER_AMD_SWITCHABLE_GRAPHICS_1", "1".to_string()));
            }
            TargetPlatform::Other => {}
        }
        vars
    }

    /// Write the variables for the current platform into the process environment.
    ///
    /// Must run before the Vulkan loader is opened.
    pub fn apply(&self) {
        for (key, value) in self.variables(TargetPlatform::current()) {
            tracing::debug!("Setting {key}={value}");
            std::env::set_var(key, value);
        }
    }
}

/// Sizing of the global descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBudget {
    /// Upper bound on materials with their own descriptor set.
    pub max_material_count: u32,
    /// Upper bound on skinned meshes with their own joint-matrix set.
    pub max_vertex_blending_mesh_count: u32,
}

impl Default for DescriptorBudget {
    fn default() -> Self {
        Self {
            max_material_count: 256,
            max_vertex_blending_mesh_count: 256,
        }
    }
}

impl DescriptorBudget {
    /// Per-type descriptor counts for the global pool.
    pub fn pool_sizes(&self) -> [vk::DescriptorPoolSize; 7] {
        let size = |ty, descriptor_count| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        };
        [
            size(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 17),
            size(
                vk::DescriptorType::STORAGE_BUFFER,
                2 + self.max_vertex_blending_mesh_count,
            ),
            size(vk::DescriptorType::UNIFORM_BUFFER, self.max_material_count),
            size(
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                5 + 5 * self.max_material_count,
            ),
            size(vk::DescriptorType::INPUT_ATTACHMENT, 8),
            size(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 3),
            size(vk::DescriptorType::STORAGE_IMAGE, 1),
        ]
    }

    /// Maximum number of sets the global pool hands out.
    pub const fn max_sets(&self) -> u32 {
        5 + self.max_material_count + self.max_vertex_blending_mesh_count
    }
}

/// Configuration consumed by [`crate::Rhi::new`].
#[derive(Debug, Clone)]
pub struct RhiConfig {
    pub app_name: String,
    /// Request `VK_LAYER_KHRONOS_validation` and install the debug messenger.
    pub enable_validation: bool,
    /// Record debug labels into command buffers.
    pub enable_debug_labels: bool,
    /// Enable the geometry-shader feature used by point-light shadows.
    pub enable_point_light_shadow: bool,
    pub descriptor_budget: DescriptorBudget,
    pub loader_environment: LoaderEnvironment,
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            app_name: "Ferrite".to_string(),
            enable_validation: cfg!(debug_assertions),
            enable_debug_labels: cfg!(debug_assertions),
            // MoltenVK has no geometry shaders.
            enable_point_light_shadow: !cfg!(target_os = "macos"),
            descriptor_budget: DescriptorBudget::default(),
            loader_environment: LoaderEnvironment::from_build(),
        }
    }
}

impl RhiConfig {
    /// Create a configuration with build-dependent defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Enable or disable command buffer debug labels.
    pub fn debug_labels(mut self, enable: bool) -> Self {
        self.enable_debug_labels = enable;
        self
    }

    /// Enable or disable the point-light shadow technique.
    pub fn point_light_shadow(mut self, enable: bool) -> Self {
        self.enable_point_light_shadow = enable;
        self
    }

    /// Override the global descriptor pool sizing.
    pub fn descriptor_budget(mut self, budget: DescriptorBudget) -> Self {
        self.descriptor_budget = budget;
        self
    }

    /// Override the loader search paths.
    pub fn loader_environment(mut self, env: LoaderEnvironment) -> Self {
        self.loader_environment = env;
        self
    }

    /// Whether the debug-utils instance extension is needed.
    pub const fn needs_debug_utils(&self) -> bool {
        self.enable_validation || self.enable_debug_labels
    }
}
