//! Per-service discovery and template matching.
//!
//! A service moves `Waiting -> DiscoveringCharacteristics -> Ready`. Each
//! completed discovery replaces the characteristic set and re-evaluates the
//! template match; only a flip of the match flag is reported upward.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::characteristic::Characteristic;
use crate::ble::events::ServiceInfo;
use crate::ble::platform::{BlePlatform, CharacteristicPath, DeviceId, DiscoveredCharacteristic};
use crate::ble::uuids::display_uuid;
use crate::template::{Template, TemplateRegistry};

/// Characteristic discovery state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceState {
    /// Nothing requested yet, or reset.
    #[default]
    Waiting,
    /// Characteristic discovery in flight.
    DiscoveringCharacteristics,
    /// Characteristics known.
    Ready,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// A GATT service on one peripheral.
#[derive(Debug, Clone)]
pub struct Service {
    /// Service UUID.
    uuid: Uuid,
    /// Owning device.
    device: DeviceId,
    /// Characteristics from the last completed discovery.
    characteristics: BTreeMap<Uuid, Characteristic>,
    /// Template bound by the last evaluation.
    matched_template: Option<Template>,
    /// Result of the last evaluation.
    matched: bool,
    /// Discovery state.
    state: ServiceState,
    /// Characteristics that were notifying when the service was reset.
    resubscribe: BTreeSet<Uuid>,
}

impl Service {
    /// Create a service in `Waiting`.
    pub fn new(device: DeviceId, uuid: Uuid) -> Self {
        Self {
            uuid,
            device,
            characteristics: BTreeMap::new(),
            matched_template: None,
            matched: false,
            state: ServiceState::Waiting,
            resubscribe: BTreeSet::new(),
        }
    }

    /// Service UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Owning device.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Discovery state.
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Whether the last evaluation bound a template.
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    /// The bound template.
    pub fn matched_template(&self) -> Option<&Template> {
        self.matched_template.as_ref()
    }

    /// Look up a characteristic.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.get(uuid)
    }

    /// Look up a characteristic for mutation.
    pub fn characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut Characteristic> {
        self.characteristics.get_mut(uuid)
    }

    /// Iterate characteristics in UUID order.
    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.characteristics.values()
    }

    /// Whether a characteristic is present.
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains_key(uuid)
    }

    /// Cheap service-UUID check deciding whether discovery is worth running.
    ///
    /// Never changes the match flag.
    pub fn is_weak_match(&self, templates: &TemplateRegistry) -> bool {
        templates.weak_match(&self.uuid).is_some()
    }

    /// Start characteristic discovery. Only valid from `Waiting`.
    pub fn run(&mut self, platform: &dyn BlePlatform) -> bool {
        if self.state != ServiceState::Waiting {
            debug!(
                "Service {} on {}: run ignored in state {}",
                display_uuid(&self.uuid),
                self.device,
                self.state
            );
            return false;
        }

        debug!(
            "Service {} on {}: discovering characteristics",
            display_uuid(&self.uuid),
            self.device
        );
        self.state = ServiceState::DiscoveringCharacteristics;
        platform.discover_characteristics(&self.device, self.uuid, None);
        true
    }

    /// Handle completed characteristic discovery.
    ///
    /// Returns the new match state if it changed.
    pub fn handle_characteristics_discovered(
        &mut self,
        found: &[DiscoveredCharacteristic],
        templates: &TemplateRegistry,
        platform: &dyn BlePlatform,
    ) -> Option<bool> {
        if self.state != ServiceState::DiscoveringCharacteristics {
            debug!(
                "Service {} on {}: unexpected characteristic discovery in state {}",
                display_uuid(&self.uuid),
                self.device,
                self.state
            );
            return None;
        }

        self.characteristics = found
            .iter()
            .map(|c| {
                (
                    c.uuid,
                    Characteristic::discovered(self.device.clone(), self.uuid, c),
                )
            })
            .collect();
        self.state = ServiceState::Ready;
        debug!(
            "Service {} on {}: {} characteristics",
            display_uuid(&self.uuid),
            self.device,
            self.characteristics.len()
        );

        let changed = self.evaluate_match(templates);

        for characteristic in self.characteristics.values() {
            characteristic.read(platform);
        }

        changed
    }

    /// Re-evaluate the template match against the current characteristics.
    ///
    /// The first template in registry order that the service fully
    /// implements is bound. Returns the new match state if it changed.
    pub fn evaluate_match(&mut self, templates: &TemplateRegistry) -> Option<bool> {
        let characteristics = &self.characteristics;
        self.matched_template = templates
            .match_service(self.uuid, |uuid| characteristics.contains_key(uuid))
            .cloned();

        let matched = self.matched_template.is_some();
        if matched == self.matched {
            return None;
        }

        self.matched = matched;
        match &self.matched_template {
            Some(template) => info!(
                "Service {} on {} matched template '{}'",
                display_uuid(&self.uuid),
                self.device,
                template.name()
            ),
            None => info!(
                "Service {} on {} no longer matches any template",
                display_uuid(&self.uuid),
                self.device
            ),
        }
        Some(matched)
    }

    /// Characteristic discovery failed; nothing from this cycle is kept.
    pub fn handle_discovery_failed(&mut self, reason: &str) {
        warn!(
            "Service {} on {}: characteristic discovery failed: {}",
            display_uuid(&self.uuid),
            self.device,
            reason
        );
        self.characteristics.clear();
        self.state = ServiceState::Waiting;
    }

    /// Back to `Waiting`, discarding every characteristic.
    ///
    /// Returns the characteristics that had notifications on.
    pub fn reset(&mut self) -> Vec<Characteristic> {
        debug!("Service {} on {}: reset", display_uuid(&self.uuid), self.device);
        self.state = ServiceState::Waiting;
        let closed: Vec<Characteristic> = std::mem::take(&mut self.characteristics)
            .into_values()
            .filter(Characteristic::is_notifying)
            .collect();
        self.resubscribe.extend(closed.iter().map(Characteristic::uuid));
        closed
    }

    /// Turn notifications back on for characteristics that had them before
    /// the last reset and came back in the latest discovery.
    ///
    /// Returns the restored paths.
    pub fn resubscribe(&mut self, platform: &dyn BlePlatform) -> Vec<CharacteristicPath> {
        if self.state != ServiceState::Ready {
            return Vec::new();
        }

        let mut restored = Vec::new();
        for uuid in std::mem::take(&mut self.resubscribe) {
            if let Some(c) = self.characteristics.get_mut(&uuid) {
                c.notify(platform, true);
                restored.push(c.path().clone());
            }
        }
        if !restored.is_empty() {
            debug!(
                "Service {} on {}: {} subscriptions restored",
                display_uuid(&self.uuid),
                self.device,
                restored.len()
            );
        }
        restored
    }

    /// Record a value for one characteristic. Returns it if it should be forwarded.
    pub fn handle_value(&mut self, characteristic: &Uuid, value: Bytes) -> Option<Bytes> {
        match self.characteristics.get_mut(characteristic) {
            Some(c) => c.handle_value(value),
            None => {
                debug!(
                    "Service {} on {}: value for unknown characteristic {}",
                    display_uuid(&self.uuid),
                    self.device,
                    display_uuid(characteristic)
                );
                None
            }
        }
    }

    /// Snapshot.
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            uuid: self.uuid,
            state: self.state,
            matched_template: self.matched_template.clone(),
            characteristics: self.characteristics.values().map(Characteristic::info).collect(),
        }
    }
}
