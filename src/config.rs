// =============================================================================
// CONFIGURATION - Load instance/device/swapchain/compute settings from TOML
// =============================================================================
//
// The presence of a [swapchain] table selects windowed mode; without it the
// program runs headless. Everything Vulkan-specific is resolved here so the
// backend only sees typed values.

use anyhow::{bail, Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config file looked up when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Elements summed by one compute work group
pub const WORKGROUP_SIZE: u32 = 32;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub device: DeviceConfig,
    pub swapchain: Option<SwapchainConfig>,
    pub compute: ComputeConfig,
    pub debug: DebugConfig,
    /// File the configuration was read from; `None` for built-in defaults
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Instance creation parameters
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub application_name: String,
    pub application_version: [u32; 3],
    pub engine_name: String,
    pub engine_version: [u32; 3],
    pub api_version: [u32; 2],
    pub layers: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            application_name: "vk-array-sum".to_string(),
            application_version: [0, 1, 0],
            engine_name: "none".to_string(),
            engine_version: [0, 1, 0],
            api_version: [1, 3],
            layers: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

/// Logical device parameters
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// One entry per queue; each entry lists the capabilities it needs.
    /// All queues are created from a single family.
    pub queues: Vec<Vec<String>>,
    pub layers: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queues: vec![vec!["COMPUTE".to_string(), "TRANSFER".to_string()]],
            layers: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

/// Swapchain settings (windowed mode only)
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SwapchainConfig {
    pub title: String,
    pub image_width: u32,
    pub image_height: u32,
    pub min_image_count: u32,
    pub present_mode: String,
    pub frames_in_flight: u32,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            title: "vk-array-sum".to_string(),
            image_width: 800,
            image_height: 600,
            min_image_count: 3,
            present_mode: "FIFO".to_string(),
            frames_in_flight: 2,
        }
    }
}

/// Workload settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub element_count: u32,
    pub staging_capacity: u64,
    pub shader: String,
    pub shader_dir: String,
    /// Units of work executed in headless mode
    pub iterations: u32,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            element_count: 10 << 20,
            staging_capacity: 50 << 20,
            shader: "array_sum".to_string(),
            shader_dir: "shaders".to_string(),
            iterations: 1,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: true,
            log_level: "info".to_string(),
        }
    }
}

/// Capabilities the selected queue family must provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub flags: vk::QueueFlags,
    pub present: bool,
    pub count: u32,
}

impl Config {
    /// Load configuration. An explicit path must exist; the default path
    /// falls back to built-in defaults when the file is missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if !path.exists() {
                    let config = Config::default();
                    config.validate()?;
                    return Ok(config);
                }
                Self::load_from_path(path)
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_headless(&self) -> bool {
        self.swapchain.is_none()
    }

    /// Reject combinations the backend cannot honor
    pub fn validate(&self) -> Result<()> {
        self.instance.vk_api_version()?;
        let queues = self.device.queue_request()?;

        match &self.swapchain {
            Some(swapchain) => {
                if !queues.present {
                    bail!("[swapchain] is configured but no queue requests PRESENT");
                }
                swapchain.vk_present_mode()?;
                if swapchain.frames_in_flight == 0 {
                    bail!("frames_in_flight must be at least 1");
                }
            }
            None if queues.present => {
                bail!("a queue requests PRESENT but no [swapchain] is configured");
            }
            None => {}
        }

        self.compute.validate()
    }
}

impl InstanceConfig {
    pub fn vk_api_version(&self) -> Result<u32> {
        match self.api_version {
            [1, 0] => Ok(vk::API_VERSION_1_0),
            [1, 1] => Ok(vk::API_VERSION_1_1),
            [1, 2] => Ok(vk::API_VERSION_1_2),
            [1, 3] => Ok(vk::API_VERSION_1_3),
            [major, minor] => bail!("Unsupported Vulkan API version {}.{}", major, minor),
        }
    }

    pub fn vk_application_version(&self) -> u32 {
        let [major, minor, patch] = self.application_version;
        vk::make_api_version(0, major, minor, patch)
    }

    pub fn vk_engine_version(&self) -> u32 {
        let [major, minor, patch] = self.engine_version;
        vk::make_api_version(0, major, minor, patch)
    }
}

impl DeviceConfig {
    /// Fold the per-queue capability lists into one family requirement
    pub fn queue_request(&self) -> Result<QueueRequest> {
        if self.queues.is_empty() {
            bail!("[device] must request at least one queue");
        }

        let mut request = QueueRequest {
            flags: vk::QueueFlags::empty(),
            present: false,
            count: self.queues.len() as u32,
        };

        for capability in self.queues.iter().flatten() {
            match capability.as_str() {
                "GRAPHICS" => request.flags |= vk::QueueFlags::GRAPHICS,
                "COMPUTE" => request.flags |= vk::QueueFlags::COMPUTE,
                "TRANSFER" => request.flags |= vk::QueueFlags::TRANSFER,
                "SPARSE" => request.flags |= vk::QueueFlags::SPARSE_BINDING,
                "PRESENT" => request.present = true,
                other => bail!("Unknown queue capability '{}'", other),
            }
        }

        Ok(request)
    }
}

impl SwapchainConfig {
    /// Get present mode as Vulkan enum
    pub fn vk_present_mode(&self) -> Result<vk::PresentModeKHR> {
        match self.present_mode.to_uppercase().as_str() {
            "IMMEDIATE" => Ok(vk::PresentModeKHR::IMMEDIATE),
            "MAILBOX" => Ok(vk::PresentModeKHR::MAILBOX),
            "FIFO" => Ok(vk::PresentModeKHR::FIFO),
            "FIFO_RELAXED" => Ok(vk::PresentModeKHR::FIFO_RELAXED),
            _ => bail!("Invalid present mode '{}'", self.present_mode),
        }
    }
}

impl ComputeConfig {
    pub fn input_size(&self) -> vk::DeviceSize {
        self.element_count as vk::DeviceSize * std::mem::size_of::<u32>() as vk::DeviceSize
    }

    pub fn group_count(&self) -> u32 {
        self.element_count / WORKGROUP_SIZE
    }

    pub fn validate(&self) -> Result<()> {
        if self.element_count == 0 || self.element_count % WORKGROUP_SIZE != 0 {
            bail!(
                "element_count {} must be a non-zero multiple of {}",
                self.element_count,
                WORKGROUP_SIZE
            );
        }
        // The initial upload and the per-frame zero are flushed separately
        if self.input_size() >= self.staging_capacity {
            bail!(
                "staging_capacity {} is too small for {} input bytes",
                self.staging_capacity,
                self.input_size()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWED: &str = r#"
        [instance]
        application_name = "sum"
        api_version = [1, 2]
        layers = ["VK_LAYER_KHRONOS_validation"]

        [device]
        queues = [["COMPUTE", "TRANSFER", "PRESENT"]]
        extensions = ["VK_KHR_swapchain"]

        [swapchain]
        image_width = 640
        image_height = 480
        present_mode = "mailbox"
        frames_in_flight = 3

        [compute]
        element_count = 1024
        staging_capacity = 8192
    "#;

    #[test]
    fn defaults_are_headless_and_valid() {
        let config = Config::default();
        assert!(config.is_headless());
        config.validate().unwrap();
        assert_eq!(config.compute.group_count(), (10 << 20) / 32);
    }

    #[test]
    fn parses_windowed_config() {
        let config = Config::from_toml_str(WINDOWED).unwrap();
        assert!(!config.is_headless());
        assert_eq!(config.instance.vk_api_version().unwrap(), vk::API_VERSION_1_2);
        assert_eq!(config.instance.engine_name, "none");

        let swapchain = config.swapchain.as_ref().unwrap();
        assert_eq!(swapchain.vk_present_mode().unwrap(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(swapchain.frames_in_flight, 3);
        assert_eq!(swapchain.min_image_count, 3);

        let queues = config.device.queue_request().unwrap();
        assert_eq!(queues.flags, vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER);
        assert!(queues.present);
        assert_eq!(queues.count, 1);
    }

    #[test]
    fn queue_count_follows_entries() {
        let device = DeviceConfig {
            queues: vec![vec!["COMPUTE".into()], vec!["TRANSFER".into(), "SPARSE".into()]],
            ..Default::default()
        };
        let request = device.queue_request().unwrap();
        assert_eq!(request.count, 2);
        assert_eq!(
            request.flags,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING
        );
    }

    #[test]
    fn rejects_unknown_api_version() {
        let err = Config::from_toml_str("[instance]\napi_version = [2, 0]").unwrap_err();
        assert!(err.to_string().contains("2.0"));
    }

    #[test]
    fn rejects_unknown_queue_capability() {
        assert!(Config::from_toml_str("[device]\nqueues = [[\"VIDEO\"]]").is_err());
    }

    #[test]
    fn present_requires_swapchain_and_back() {
        assert!(Config::from_toml_str("[device]\nqueues = [[\"COMPUTE\", \"PRESENT\"]]").is_err());
        assert!(Config::from_toml_str("[swapchain]\nimage_width = 10").is_err());
    }

    #[test]
    fn rejects_bad_present_mode() {
        let toml = WINDOWED.replace("mailbox", "vsync");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn compute_limits_are_checked() {
        let not_multiple = ComputeConfig {
            element_count: 33,
            ..Default::default()
        };
        assert!(not_multiple.validate().is_err());

        // 1024 elements = 4096 bytes, which must stay below capacity
        let full = ComputeConfig {
            element_count: 1024,
            staging_capacity: 4096,
            ..Default::default()
        };
        assert!(full.validate().is_err());

        let tight = ComputeConfig {
            staging_capacity: 4097,
            ..full
        };
        tight.validate().unwrap();
    }

    #[test]
    fn loading_a_file_records_its_path() {
        let path = std::env::temp_dir().join(format!("vk-array-sum-config-{}.toml", std::process::id()));
        std::fs::write(&path, WINDOWED).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        assert!(Config::from_toml_str(WINDOWED).unwrap().source.is_none());

        std::fs::remove_file(&path).unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn shipped_configs_parse() {
        let windowed = Config::from_toml_str(include_str!("../config.toml")).unwrap();
        assert!(!windowed.is_headless());

        let headless = Config::from_toml_str(include_str!("../headless.toml")).unwrap();
        assert!(headless.is_headless());
        assert_eq!(headless.compute.iterations, 3);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/vk-array-sum.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
