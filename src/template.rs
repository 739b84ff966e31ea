//! Serial profile templates.
//!
//! A [`Template`] names the service that carries a serial channel and the
//! characteristics used to receive (RX) and transmit (TX). Some modules use
//! one characteristic for both directions; others split them.

use std::fmt;

use uuid::Uuid;

use crate::ble::uuids::{
    display_uuid, parse_uuid, BLE_NANO_RXTX_UUID, BLE_NANO_SERVICE_UUID, UART_RX_UUID,
    UART_SERVICE_UUID, UART_TX_UUID,
};
use crate::error::{Error, Result};

/// A recognised serial-over-BLE hardware profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Template {
    service: Uuid,
    rx: Uuid,
    tx: Uuid,
    name: String,
}

impl Template {
    /// Create a template with separate RX and TX characteristics.
    pub fn new(name: impl Into<String>, service: Uuid, rx: Uuid, tx: Uuid) -> Self {
        Self {
            service,
            rx,
            tx,
            name: name.into(),
        }
    }

    /// Create a template whose single characteristic carries both directions.
    pub fn bidirectional(name: impl Into<String>, service: Uuid, rxtx: Uuid) -> Self {
        Self::new(name, service, rxtx, rxtx)
    }

    /// Build a template from UUID strings in short or full form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTemplate`] if any UUID does not parse.
    pub fn parse(name: &str, service: &str, rx: &str, tx: &str) -> Result<Self> {
        let field = |label: &str, value: &str| {
            parse_uuid(value).map_err(|_| Error::InvalidTemplate {
                name: name.to_string(),
                reason: format!("bad {} UUID '{}'", label, value),
            })
        };

        Ok(Self::new(
            name,
            field("service", service)?,
            field("rx", rx)?,
            field("tx", tx)?,
        ))
    }

    /// Service UUID.
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Receive characteristic UUID.
    pub fn rx(&self) -> Uuid {
        self.rx
    }

    /// Transmit characteristic UUID.
    pub fn tx(&self) -> Uuid {
        self.tx
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether RX and TX are the same characteristic.
    pub fn is_bidirectional(&self) -> bool {
        self.rx == self.tx
    }

    /// The distinct characteristics this template needs.
    pub fn characteristics(&self) -> Vec<Uuid> {
        if self.is_bidirectional() {
            vec![self.rx]
        } else {
            vec![self.rx, self.tx]
        }
    }

    /// Full match: same service and both RX and TX present.
    pub fn is_implemented_by<F>(&self, service: Uuid, has_characteristic: F) -> bool
    where
        F: Fn(&Uuid) -> bool,
    {
        self.service == service && has_characteristic(&self.rx) && has_characteristic(&self.tx)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: service={} rx={} tx={}",
            self.name,
            display_uuid(&self.service),
            display_uuid(&self.rx),
            display_uuid(&self.tx)
        )
    }
}

/// Serialisable form of a template, with UUIDs as text.
///
/// `tx` may be omitted for single-characteristic profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemplateEntry {
    /// Human-readable name.
    pub name: String,
    /// Service UUID.
    pub service: String,
    /// Receive characteristic UUID.
    pub rx: String,
    /// Transmit characteristic UUID; defaults to `rx`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub tx: Option<String>,
}

impl TryFrom<TemplateEntry> for Template {
    type Error = Error;

    fn try_from(entry: TemplateEntry) -> Result<Self> {
        let tx = entry.tx.as_deref().unwrap_or(&entry.rx);
        Template::parse(&entry.name, &entry.service, &entry.rx, tx)
    }
}

impl From<&Template> for TemplateEntry {
    fn from(template: &Template) -> Self {
        Self {
            name: template.name.clone(),
            service: display_uuid(&template.service),
            rx: display_uuid(&template.rx),
            tx: Some(display_uuid(&template.tx)),
        }
    }
}

/// Ordered list of templates. Order matters: the first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRegistry {
    templates: Vec<Template>,
}

impl TemplateRegistry {
    /// Create a registry from templates, in priority order.
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    /// An empty registry; nothing will match.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load templates from text entries.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed entry.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = TemplateEntry>,
    {
        let templates = entries
            .into_iter()
            .map(Template::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(templates))
    }

    /// Append a template at the lowest priority.
    pub fn with(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    /// Iterate templates in priority order.
    pub fn iter(&self) -> std::slice::Iter<'_, Template> {
        self.templates.iter()
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the registry holds no templates.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Cheap pre-check on the service UUID alone.
    ///
    /// Only decides whether characteristic discovery is worth running.
    pub fn weak_match(&self, service: &Uuid) -> Option<&Template> {
        self.templates.iter().find(|t| t.service == *service)
    }

    /// First template fully implemented by a service.
    pub fn match_service<F>(&self, service: Uuid, has_characteristic: F) -> Option<&Template>
    where
        F: Fn(&Uuid) -> bool,
    {
        self.templates
            .iter()
            .find(|t| t.is_implemented_by(service, &has_characteristic))
    }

    /// Distinct service UUIDs, usable as a scan filter.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut uuids: Vec<Uuid> = Vec::with_capacity(self.templates.len());
        for template in &self.templates {
            if !uuids.contains(&template.service) {
                uuids.push(template.service);
            }
        }
        uuids
    }

    /// Text form of every template.
    pub fn entries(&self) -> Vec<TemplateEntry> {
        self.templates.iter().map(TemplateEntry::from).collect()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new(vec![
            Template::bidirectional("Ble-Nano", BLE_NANO_SERVICE_UUID, BLE_NANO_RXTX_UUID),
            // NUS names its characteristics from the peripheral's side.
            Template::new("Nordic UART", UART_SERVICE_UUID, UART_TX_UUID, UART_RX_UUID),
        ])
    }
}

impl<'a> IntoIterator for &'a TemplateRegistry {
    type Item = &'a Template;
    type IntoIter = std::slice::Iter<'a, Template>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
