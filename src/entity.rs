//! Entities owned by the directories: one tracker sensor and one alarm
//! collection per device. Each keeps its observable state behind a lock so the
//! MQTT task and the HTTP API can share it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};

use serde_json::Value;

use crate::payload::AlarmRecord;

pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";
pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";

/// Attribute naming which kind of bridge entity a persisted state belongs to.
pub const KIND_ATTRIBUTE: &str = "bridge_kind";
/// Attribute carrying the entity's unique id (`<name>_<device>`).
pub const DEVICE_ID_ATTRIBUTE: &str = "device_id";
/// Attribute carrying the bridge instance name that owns the entity.
pub const INSTANCE_ATTRIBUTE: &str = "instance";
/// Attribute naming the alarm a per-alarm entity mirrors.
pub const ALARM_ID_ATTRIBUTE: &str = "alarm_id";

pub type Attributes = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Tracker,
    Alarms,
    Alarm,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Tracker => "tracker",
            EntityKind::Alarms => "alarms",
            EntityKind::Alarm => "alarm",
        }
    }

    pub fn from_attributes(attributes: &Attributes) -> Option<Self> {
        match attributes.get(KIND_ATTRIBUTE)?.as_str()? {
            "tracker" => Some(EntityKind::Tracker),
            "alarms" => Some(EntityKind::Alarms),
            "alarm" => Some(EntityKind::Alarm),
            _ => None,
        }
    }
}

/// Lowercase, with anything outside `[a-z0-9]` turned into `_`.
pub fn slugify(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Identity attributes every bridge entity carries.
fn identity(kind: EntityKind, instance: &str, unique_id: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(KIND_ATTRIBUTE.to_string(), Value::from(kind.as_str()));
    attrs.insert(INSTANCE_ATTRIBUTE.to_string(), Value::from(instance));
    attrs.insert(DEVICE_ID_ATTRIBUTE.to_string(), Value::from(unique_id));
    attrs
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub state: String,
    pub attributes: Attributes,
}

// ── Sleep tracker sensor ─────────────────────────────────

/// `sensor.<name>_<device>`: the last tracker event and its values.
pub struct SleepTrackerSensor {
    instance: String,
    device_name: String,
    unique_id: String,
    entity_id: String,
    observed: RwLock<Observed>,
}

impl SleepTrackerSensor {
    pub fn new(instance: &str, device_name: &str, unique_id: &str) -> Self {
        Self {
            instance: instance.to_string(),
            device_name: device_name.to_string(),
            unique_id: unique_id.to_string(),
            entity_id: format!("sensor.{}", slugify(unique_id)),
            observed: RwLock::new(Observed {
                state: STATE_UNKNOWN.to_string(),
                attributes: identity(EntityKind::Tracker, instance, unique_id),
            }),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Replace state and payload attributes; identity attributes are kept.
    pub fn update(&self, state: &str, mut attributes: Attributes) -> Observed {
        attributes.extend(identity(EntityKind::Tracker, &self.instance, &self.unique_id));
        let mut observed = self.observed.write().unwrap_or_else(|e| e.into_inner());
        observed.state = state.to_string();
        observed.attributes = attributes;
        observed.clone()
    }
}

// ── Alarm collection ─────────────────────────────────────

#[derive(Default)]
struct AlarmSet {
    alarms: Vec<AlarmRecord>,
    /// Persisted `enabled` flags, only consulted until the first batch.
    restored: HashMap<i64, bool>,
    received: bool,
}

/// Alarm set as left by [`AlarmCollection::replace`].
#[derive(Debug, Clone)]
pub struct Replaced {
    /// Ids known before the call that are gone now.
    pub stale: Vec<i64>,
    pub alarms: Vec<AlarmRecord>,
}

/// Outcome of a local enable/disable.
#[derive(Debug, Clone, PartialEq)]
pub enum Toggled {
    /// The alarm is in the current set; this is its updated record.
    Live(AlarmRecord),
    /// Only a restored flag exists, no batch has arrived yet.
    Restored,
}

/// `binary_sensor.<name>_<device>_alarms` plus one
/// `binary_sensor.<name>_<device>_alarm_<id>` per alarm.
pub struct AlarmCollection {
    instance: String,
    device_name: String,
    unique_id: String,
    entity_id: String,
    set: RwLock<AlarmSet>,
    /// Held across a change and the publishing of its entities.
    publishing: Mutex<()>,
}

impl AlarmCollection {
    pub fn new(instance: &str, device_name: &str, unique_id: &str) -> Self {
        Self {
            instance: instance.to_string(),
            device_name: device_name.to_string(),
            unique_id: unique_id.to_string(),
            entity_id: format!("binary_sensor.{}_alarms", slugify(unique_id)),
            set: RwLock::new(AlarmSet::default()),
            publishing: Mutex::new(()),
        }
    }

    /// Serializes batches and local overrides, so entity writes land in the
    /// same order as the changes behind them.
    pub fn publishing(&self) -> MutexGuard<'_, ()> {
        self.publishing.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Per-alarm entity id. Negative ids (unassigned alarms) get an `n` prefix.
    pub fn alarm_entity_id(&self, alarm_id: i64) -> String {
        let suffix = if alarm_id < 0 {
            format!("n{}", alarm_id.unsigned_abs())
        } else {
            alarm_id.to_string()
        };
        format!("binary_sensor.{}_alarm_{}", slugify(&self.unique_id), suffix)
    }

    pub fn alarms(&self) -> Vec<AlarmRecord> {
        self.set
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .alarms
            .clone()
    }

    /// Record a persisted `enabled` flag. Ignored once a batch has arrived.
    pub fn restore_enabled(&self, alarm_id: i64, enabled: bool) {
        let mut set = self.set.write().unwrap_or_else(|e| e.into_inner());
        if !set.received {
            set.restored.insert(alarm_id, enabled);
        }
    }

    /// Current enabled flag of an alarm: the live record if any, else the
    /// restored value.
    #[cfg(test)]
    pub fn is_enabled(&self, alarm_id: i64) -> Option<bool> {
        let set = self.set.read().unwrap_or_else(|e| e.into_inner());
        set.alarms
            .iter()
            .find(|a| a.id == alarm_id)
            .map(|a| a.enabled)
            .or_else(|| set.restored.get(&alarm_id).copied())
    }

    /// Replace the whole alarm set. Duplicate ids keep the last record.
    /// Previously known ids (live and restored) missing from the new set are
    /// reported as stale.
    pub fn replace(&self, records: Vec<AlarmRecord>) -> Replaced {
        let mut deduped: Vec<AlarmRecord> = Vec::with_capacity(records.len());
        for record in records {
            match deduped.iter_mut().find(|a| a.id == record.id) {
                Some(existing) => *existing = record,
                None => deduped.push(record),
            }
        }

        let mut set = self.set.write().unwrap_or_else(|e| e.into_inner());
        let mut stale: Vec<i64> = set.alarms.iter().map(|a| a.id).collect();
        stale.extend(set.restored.keys().copied());
        stale.retain(|id| !deduped.iter().any(|a| a.id == *id));
        stale.sort_unstable();
        stale.dedup();

        set.alarms = deduped;
        set.restored.clear();
        set.received = true;
        Replaced {
            stale,
            alarms: set.alarms.clone(),
        }
    }

    /// Local enable/disable override. Before the first batch a restored flag
    /// can be overridden too. `None` if the alarm is unknown.
    pub fn set_enabled(&self, alarm_id: i64, enabled: bool) -> Option<Toggled> {
        let mut set = self.set.write().unwrap_or_else(|e| e.into_inner());
        if let Some(alarm) = set.alarms.iter_mut().find(|a| a.id == alarm_id) {
            alarm.enabled = enabled;
            return Some(Toggled::Live(alarm.clone()));
        }
        if set.received {
            return None;
        }
        let restored = set.restored.get_mut(&alarm_id)?;
        *restored = enabled;
        Some(Toggled::Restored)
    }

    /// `on` when at least one alarm is enabled.
    pub fn state(&self) -> &'static str {
        let set = self.set.read().unwrap_or_else(|e| e.into_inner());
        let any_enabled = set.alarms.iter().any(|a| a.enabled)
            || (!set.received && set.restored.values().any(|e| *e));
        if any_enabled {
            STATE_ON
        } else {
            STATE_OFF
        }
    }

    pub fn attributes(&self) -> Attributes {
        let set = self.set.read().unwrap_or_else(|e| e.into_inner());
        let mut attrs = identity(EntityKind::Alarms, &self.instance, &self.unique_id);
        let alarms = serde_json::to_value(&set.alarms).unwrap_or_else(|_| Value::Array(vec![]));
        attrs.insert("alarms".to_string(), alarms);
        attrs.insert("count".to_string(), Value::from(set.alarms.len()));
        attrs.insert(
            "enabled_count".to_string(),
            Value::from(set.alarms.iter().filter(|a| a.enabled).count()),
        );
        attrs
    }

    /// Attributes of one per-alarm entity: every record field except `id`
    /// and `enabled`, with nulls reported as unavailable.
    pub fn alarm_attributes(&self, record: &AlarmRecord) -> Attributes {
        let mut attrs = Attributes::new();
        if let Ok(Value::Object(fields)) = serde_json::to_value(record) {
            for (key, value) in fields {
                if key == "id" || key == "enabled" {
                    continue;
                }
                let value = if value.is_null() {
                    Value::from(STATE_UNAVAILABLE)
                } else {
                    value
                };
                attrs.insert(key, value);
            }
        }
        attrs.extend(self.restored_alarm_attributes(record.id));
        attrs
    }

    /// Identity of a per-alarm entity whose record is not known.
    pub fn restored_alarm_attributes(&self, alarm_id: i64) -> Attributes {
        let mut attrs = identity(EntityKind::Alarm, &self.instance, &self.unique_id);
        attrs.insert(ALARM_ID_ATTRIBUTE.to_string(), Value::from(alarm_id));
        attrs
    }
}

pub fn on_off(enabled: bool) -> &'static str {
    if enabled {
        STATE_ON
    } else {
        STATE_OFF
    }
}
