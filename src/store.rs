//! State-store boundary: asset events and the sinks that receive them.

pub mod hub;
pub mod jsonl;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

/// Anything the scheduler can push asset events into. Pushes are one-way;
/// the error is only used for logging.
pub trait StateStore: Send + Sync {
    fn push(&self, event: &AssetEvent) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ZoneKind {
    Power,
    Thermal,
    Drawer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitKind {
    Psu,
    Fan,
    Drawer,
    Sled,
}

/// Addresses one hot-pluggable unit under a CM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitRef {
    pub kind: UnitKind,
    /// 1-based slot within its zone (or within its drawer for sleds)
    pub slot: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawer: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
}

impl UnitRef {
    pub fn new(kind: UnitKind, slot: u8, uuid: Option<Uuid>) -> Self {
        Self { kind, slot, drawer: None, uuid }
    }

    pub fn sled(drawer: u8, slot: u8, uuid: Option<Uuid>) -> Self {
        Self {
            kind: UnitKind::Sled,
            slot,
            drawer: Some(drawer),
            uuid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadingKind {
    PowerIn,
    CurrentOut,
    PowerOut,
    PowerCap,
    TotalPowerCap,
    FanSpeed,
    AverageRpm,
    Pwm,
    Temperature,
    InletTemperature,
    SledPower,
    DrawerPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityField {
    Serial,
    Manufacturer,
    Model,
    Firmware,
    SledType,
    IpAddress,
    IpSource,
    SubnetMask,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    CmAdded {
        uuid: Uuid,
    },
    CmRemoved {
        uuid: Uuid,
    },
    CmVersion {
        device_id: u8,
        revision: u8,
        firmware: String,
        ipmi_version: String,
    },
    ZoneAdded {
        zone: ZoneKind,
        uuid: Uuid,
    },
    Presence {
        zone: ZoneKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        drawer: Option<u8>,
        bitmap: u8,
    },
    UnitAdded {
        unit: UnitRef,
    },
    UnitRemoved {
        unit: UnitRef,
    },
    Reading {
        unit: UnitRef,
        reading: ReadingKind,
        value: i64,
    },
    ZoneReading {
        zone: ZoneKind,
        reading: ReadingKind,
        value: i64,
    },
    Identity {
        unit: UnitRef,
        field: IdentityField,
        value: String,
    },
    Health {
        unit: UnitRef,
        status: u16,
    },
    Alert {
        bitmap: u8,
    },
    PsuState {
        unit: UnitRef,
        enabled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetEvent {
    pub cm: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventKind,
}

impl AssetEvent {
    pub fn now(cm: u8, event: EventKind) -> Self {
        Self {
            cm,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Per-CM push interface used by operation handlers.
#[derive(Clone)]
pub struct Notifier {
    cm: u8,
    store: Arc<dyn StateStore>,
}

impl Notifier {
    pub fn new(cm: u8, store: Arc<dyn StateStore>) -> Self {
        Self { cm, store }
    }

    fn push(&self, event: EventKind) {
        let event = AssetEvent::now(self.cm, event);
        if let Err(e) = self.store.push(&event) {
            warn!(cm = self.cm, "Failed to push asset event: {}", e);
        }
    }

    pub fn cm_added(&self, uuid: Uuid) {
        self.push(EventKind::CmAdded { uuid });
    }

    pub fn cm_removed(&self, uuid: Uuid) {
        self.push(EventKind::CmRemoved { uuid });
    }

    pub fn cm_version(&self, device_id: u8, revision: u8, firmware: &str, ipmi_version: &str) {
        self.push(EventKind::CmVersion {
            device_id,
            revision,
            firmware: firmware.to_string(),
            ipmi_version: ipmi_version.to_string(),
        });
    }

    pub fn zone_added(&self, zone: ZoneKind, uuid: Uuid) {
        self.push(EventKind::ZoneAdded { zone, uuid });
    }

    pub fn presence(&self, zone: ZoneKind, drawer: Option<u8>, bitmap: u8) {
        self.push(EventKind::Presence { zone, drawer, bitmap });
    }

    pub fn unit_added(&self, unit: UnitRef) {
        self.push(EventKind::UnitAdded { unit });
    }

    pub fn unit_removed(&self, unit: UnitRef) {
        self.push(EventKind::UnitRemoved { unit });
    }

    pub fn reading(&self, unit: UnitRef, reading: ReadingKind, value: i64) {
        self.push(EventKind::Reading { unit, reading, value });
    }

    pub fn zone_reading(&self, zone: ZoneKind, reading: ReadingKind, value: i64) {
        self.push(EventKind::ZoneReading { zone, reading, value });
    }

    pub fn identity(&self, unit: UnitRef, field: IdentityField, value: &str) {
        self.push(EventKind::Identity {
            unit,
            field,
            value: value.to_string(),
        });
    }

    pub fn health(&self, unit: UnitRef, status: u16) {
        self.push(EventKind::Health { unit, status });
    }

    pub fn alert(&self, bitmap: u8) {
        self.push(EventKind::Alert { bitmap });
    }

    pub fn psu_state(&self, unit: UnitRef, enabled: bool) {
        self.push(EventKind::PsuState { unit, enabled });
    }
}

/// Recording store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    events: std::sync::Mutex<Vec<AssetEvent>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn events(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .expect("store lock")
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("store lock").clear();
    }
}

#[cfg(test)]
impl StateStore for MemoryStore {
    fn push(&self, event: &AssetEvent) -> Result<(), StoreError> {
        self.events.lock().expect("store lock").push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = AssetEvent::now(
            2,
            EventKind::Reading {
                unit: UnitRef::new(UnitKind::Psu, 1, None),
                reading: ReadingKind::PowerIn,
                value: 663,
            },
        );
        let json = serde_json::to_value(&event).expect("serializes");

        assert_eq!(json["type"], "reading");
        assert_eq!(json["cm"], 2);
        assert_eq!(json["reading"], "powerIn");
        assert_eq!(json["unit"]["kind"], "psu");
        assert_eq!(json["unit"]["slot"], 1);
        assert!(json["unit"].get("drawer").is_none());
        assert_eq!(json["value"], 663);
    }

    #[test]
    fn test_struct_variant_fields_are_camel_case() {
        let event = AssetEvent::now(
            1,
            EventKind::CmVersion {
                device_id: 0x20,
                revision: 1,
                firmware: "3.45".to_string(),
                ipmi_version: "2.0".to_string(),
            },
        );
        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["type"], "cmVersion");
        assert_eq!(json["deviceId"], 0x20);
        assert_eq!(json["ipmiVersion"], "2.0");
    }

    #[test]
    fn test_notifier_stamps_cm() {
        let store = Arc::new(MemoryStore::default());
        let notifier = Notifier::new(4, store.clone());
        notifier.alert(0b0010);

        let recorded = store.events.lock().expect("store lock");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].cm, 4);
        assert_eq!(recorded[0].event, EventKind::Alert { bitmap: 0b0010 });
    }
}
