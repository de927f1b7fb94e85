//! Device configuration
//!
//! [`DeviceConfig`] selects the backend family and device for a
//! [`DeviceContext`](super::DeviceContext). It can be built in code, read
//! from the environment, or parsed from JSON.

use std::env;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, EmulatedConfig, MULTI_QUEUE_COUNT};
use crate::error::{MemError, MemResult};

/// Environment variable selecting the backend (`cpu`, `single`, `multi`)
pub const BACKEND_ENV: &str = "FORGEMEM_BACKEND";

/// Environment variable for the physical device id
pub const DEVICE_ID_ENV: &str = "FORGEMEM_DEVICE_ID";

/// Environment variable for the position in the device list
pub const LIST_ID_ENV: &str = "FORGEMEM_LIST_ID";

/// Environment variable overriding the multi-queue count
pub const QUEUE_COUNT_ENV: &str = "FORGEMEM_QUEUE_COUNT";

/// Configuration for one device context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device family
    pub backend: Backend,

    /// Physical device id
    pub device_id: usize,

    /// Position of the device in the ordered device list
    pub list_id: usize,

    /// Queues of a multi-queue device (ignored by the other families)
    pub queue_count: usize,

    /// Use the in-process accelerator even when native support is built in
    pub emulate: bool,

    /// Work-item limits reported by an emulated device
    pub work_item_sizes: Option<[usize; 3]>,

    /// Extension string reported by an emulated device
    pub extensions: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            backend: Backend::Cpu,
            device_id: 0,
            list_id: 0,
            queue_count: MULTI_QUEUE_COUNT,
            emulate: false,
            work_item_sizes: None,
            extensions: None,
        }
    }
}

impl DeviceConfig {
    /// Create a new device config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_device_id(mut self, device_id: usize) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_list_id(mut self, list_id: usize) -> Self {
        self.list_id = list_id;
        self
    }

    pub fn with_queue_count(mut self, queue_count: usize) -> Self {
        self.queue_count = queue_count;
        self
    }

    pub fn with_emulation(mut self, emulate: bool) -> Self {
        self.emulate = emulate;
        self
    }

    pub fn with_work_item_sizes(mut self, sizes: [usize; 3]) -> Self {
        self.work_item_sizes = Some(sizes);
        self
    }

    pub fn with_extensions(mut self, extensions: &str) -> Self {
        self.extensions = Some(extensions.to_string());
        self
    }

    /// Read overrides of the defaults from `FORGEMEM_*` environment variables
    pub fn from_env() -> MemResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var(BACKEND_ENV) {
            config.backend = value
                .parse()
                .map_err(|e: String| MemError::InvalidConfiguration(format!("{}: {}", BACKEND_ENV, e)))?;
        }
        if let Some(id) = parse_env_usize(DEVICE_ID_ENV)? {
            config.device_id = id;
        }
        if let Some(id) = parse_env_usize(LIST_ID_ENV)? {
            config.list_id = id;
        }
        if let Some(count) = parse_env_usize(QUEUE_COUNT_ENV)? {
            config.queue_count = count;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> MemResult<Self> {
        let config: DeviceConfig = serde_json::from_str(json)
            .map_err(|e| MemError::InvalidConfiguration(format!("device config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MemResult<()> {
        if self.backend == Backend::MultiQueue && self.queue_count < 2 {
            return Err(MemError::InvalidConfiguration(format!(
                "a multi-queue device needs at least 2 queues, got {}",
                self.queue_count
            )));
        }
        Ok(())
    }

    /// Queue count a context built from this config reports
    pub fn num_queues(&self) -> usize {
        match self.backend {
            Backend::MultiQueue => self.queue_count,
            Backend::Cpu | Backend::SingleQueue => 1,
        }
    }

    /// Emulated device description matching this config
    pub fn emulated_config(&self) -> EmulatedConfig {
        let mut emulated = match self.backend {
            Backend::MultiQueue => EmulatedConfig::multi_queue().with_max_queues(self.queue_count),
            Backend::Cpu | Backend::SingleQueue => EmulatedConfig::single_queue(),
        }
        .with_name(&format!("emulated-{}:{}", self.backend, self.device_id));

        if let Some(sizes) = self.work_item_sizes {
            emulated = emulated.with_work_item_sizes(sizes);
        }
        if let Some(extensions) = &self.extensions {
            emulated = emulated.with_extensions(extensions);
        }
        emulated
    }
}

fn parse_env_usize(name: &str) -> MemResult<Option<usize>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| MemError::InvalidConfiguration(format!("{}='{}': {}", name, value, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [BACKEND_ENV, DEVICE_ID_ENV, LIST_ID_ENV, QUEUE_COUNT_ENV] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.queue_count, MULTI_QUEUE_COUNT);
        assert_eq!(config.num_queues(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new()
            .with_backend(Backend::MultiQueue)
            .with_device_id(2)
            .with_list_id(1)
            .with_queue_count(4)
            .with_work_item_sizes([256, 256, 16]);

        assert_eq!(config.device_id, 2);
        assert_eq!(config.list_id, 1);
        assert_eq!(config.num_queues(), 4);
        assert_eq!(config.emulated_config().max_work_item_sizes, [256, 256, 16]);
        assert_eq!(config.emulated_config().max_queues, 4);
    }

    #[test]
    fn test_multi_queue_needs_two_queues() {
        let config = DeviceConfig::new()
            .with_backend(Backend::MultiQueue)
            .with_queue_count(1);
        assert!(matches!(
            config.validate(),
            Err(MemError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_from_json_partial() {
        let config = DeviceConfig::from_json(r#"{"backend": "multi_queue", "device_id": 3}"#).unwrap();
        assert_eq!(config.backend, Backend::MultiQueue);
        assert_eq!(config.device_id, 3);
        assert_eq!(config.queue_count, MULTI_QUEUE_COUNT);

        assert!(DeviceConfig::from_json(r#"{"backend": "vulkan"}"#).is_err());
        assert!(DeviceConfig::from_json(r#"{"backend": "multi_queue", "queue_count": 0}"#).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var(BACKEND_ENV, "opencl");
        env::set_var(DEVICE_ID_ENV, "1");
        env::set_var(QUEUE_COUNT_ENV, "4");

        let config = DeviceConfig::from_env().unwrap();
        assert_eq!(config.backend, Backend::MultiQueue);
        assert_eq!(config.device_id, 1);
        assert_eq!(config.list_id, 0);
        assert_eq!(config.queue_count, 4);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        env::set_var(DEVICE_ID_ENV, "first");
        assert!(DeviceConfig::from_env().is_err());

        clear_env();
        env::set_var(BACKEND_ENV, "tpu");
        assert!(DeviceConfig::from_env().is_err());
        clear_env();
    }
}
