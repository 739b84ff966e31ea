//! Manager configuration.
//!
//! Everything has a default; the builder methods override one field at a
//! time. With the `serde` feature a configuration can also be read from TOML:
//!
//! ```toml
//! connect_timeout_ms = 5000
//! service_filter = ["FFE0"]
//! rssi_interval_ms = 2000
//!
//! [[templates]]
//! name = "Ble-Nano"
//! service = "FFE0"
//! rx = "FFE1"
//! ```
//!
//! When `templates` is present it replaces the built-in list.

use std::time::Duration;

use uuid::Uuid;

use crate::ble::connection::DEFAULT_CONNECT_TIMEOUT;
use crate::template::{Template, TemplateRegistry};

/// Default capacity of the listener broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a [`DeviceManager`](crate::DeviceManager) or
/// [`ScanController`](crate::ble::ScanController).
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// How long a connect attempt may take before it is abandoned.
    pub connect_timeout: Duration,
    /// Only report devices advertising one of these services.
    pub service_filter: Option<Vec<Uuid>>,
    /// Serial profiles to recognise, in priority order.
    pub templates: TemplateRegistry,
    /// Listener channel capacity.
    pub event_capacity: usize,
    /// Poll RSSI of connected devices at this interval.
    pub rssi_interval: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            service_filter: None,
            templates: TemplateRegistry::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            rssi_interval: None,
        }
    }
}

impl ManagerConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_service_filter(mut self, services: Vec<Uuid>) -> Self {
        self.service_filter = Some(services);
        self
    }

    /// Scan only for services some template could match.
    pub fn with_template_filter(mut self) -> Self {
        self.service_filter = Some(self.templates.service_uuids());
        self
    }

    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    /// Append a template at the lowest priority.
    pub fn with_template(mut self, template: Template) -> Self {
        self.templates = self.templates.with(template);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_rssi_interval(mut self, interval: Duration) -> Self {
        self.rssi_interval = Some(interval);
        self
    }
}

#[cfg(feature = "serde")]
mod file {
    use serde::Deserialize;

    use crate::template::TemplateEntry;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub(super) struct ConfigFile {
        pub connect_timeout_ms: Option<u64>,
        pub service_filter: Option<Vec<String>>,
        pub event_capacity: Option<usize>,
        pub rssi_interval_ms: Option<u64>,
        pub templates: Option<Vec<TemplateEntry>>,
    }
}

#[cfg(feature = "serde")]
impl ManagerConfig {
    /// Parse a TOML configuration on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for malformed TOML and
    /// [`Error::InvalidUuid`](crate::Error::InvalidUuid) or
    /// [`Error::InvalidTemplate`](crate::Error::InvalidTemplate) for bad values.
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let file: file::ConfigFile = toml::from_str(text)?;
        let mut config = Self::default();

        if let Some(ms) = file.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(filter) = file.service_filter {
            config.service_filter = Some(
                filter
                    .iter()
                    .map(|s| crate::ble::uuids::parse_uuid(s))
                    .collect::<crate::Result<Vec<_>>>()?,
            );
        }
        if let Some(capacity) = file.event_capacity {
            config = config.with_event_capacity(capacity);
        }
        if let Some(ms) = file.rssi_interval_ms {
            config.rssi_interval = Some(Duration::from_millis(ms));
        }
        if let Some(entries) = file.templates {
            config.templates = TemplateRegistry::from_entries(entries)?;
        }

        Ok(config)
    }
}
