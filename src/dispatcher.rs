//! Routes inbound MQTT messages to the entity of their device and publishes
//! the result: entity states in the state machine, domain events and device
//! triggers on the bus.
//!
//! Decode failures never escape this module. A bad message is logged and
//! dropped so one misbehaving phone cannot disturb the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::BridgeConfig;
use crate::directory::EntityDirectory;
use crate::entity::{
    on_off, AlarmCollection, Attributes, EntityKind, SleepTrackerSensor, Toggled,
    ALARM_ID_ATTRIBUTE, DEVICE_ID_ATTRIBUTE, INSTANCE_ATTRIBUTE, STATE_ON, STATE_UNAVAILABLE,
};
use crate::payload::{decode_alarms, decode_state, AlarmRecord, SleepStateRecord};
use crate::state::{Context, EntityState, EventBus, StateMachine};
use crate::topic::TopicResolver;
use crate::triggers::{alarm_signal, TriggerSet, TRIGGER_EVENT};

pub struct Dispatcher {
    name: String,
    resolver: TopicResolver,
    trackers: EntityDirectory<SleepTrackerSensor>,
    alarms: EntityDirectory<AlarmCollection>,
    triggers: TriggerSet,
    /// Payload key → attribute name for tracker state.
    attribute_map: BTreeMap<String, String>,
    states: Arc<StateMachine>,
    bus: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(config: &BridgeConfig, states: Arc<StateMachine>, bus: Arc<EventBus>) -> Self {
        Self {
            name: config.name.clone(),
            resolver: TopicResolver::with_placeholder(
                &config.topic_template,
                &config.device_placeholder,
            ),
            trackers: EntityDirectory::new(),
            alarms: EntityDirectory::new(),
            triggers: TriggerSet::new(config.triggers.iter().cloned()),
            attribute_map: config.attributes.clone(),
            states,
            bus,
        }
    }

    pub fn resolver(&self) -> &TopicResolver {
        &self.resolver
    }

    /// Unique id of a device's entities: `<name>_<device>`.
    pub fn create_entity_id(&self, device_name: &str) -> String {
        format!("{}_{}", self.name, device_name)
    }

    /// Inverse of [`create_entity_id`](Self::create_entity_id). `None` for ids
    /// belonging to another instance.
    pub fn device_name_from_entity_id(&self, unique_id: &str) -> Option<String> {
        unique_id
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|device| !device.is_empty())
            .map(|device| device.to_string())
    }

    /// Route one MQTT publish. Returns false when the topic belongs to
    /// neither pattern.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        if self.resolver.is_alarm_topic(topic) {
            self.handle_alarm_message(topic, payload);
            true
        } else if self.resolver.is_state_topic(topic) {
            self.handle_state_message(topic, payload);
            true
        } else {
            tracing::trace!("Ignoring message on unrelated topic {}", topic);
            false
        }
    }

    // ── Tracker state ────────────────────────────────────

    pub fn handle_state_message(&self, topic: &str, payload: &[u8]) {
        let device = self.resolver.device_name(topic);
        let sensor = self.tracker(&device);

        match decode_state(payload) {
            Ok(record) => {
                self.apply_state(&sensor, &record);
            }
            Err(e) => {
                tracing::warn!(
                    "sleep tracker {}: dropping message on {} ({:?}): {}",
                    device,
                    topic,
                    e.kind(),
                    e
                );
            }
        }
    }

    /// Copy the configured fields into the sensor, publish its state and fire
    /// the domain event. Fields missing from `record` become "unavailable".
    pub fn apply_state(&self, sensor: &SleepTrackerSensor, record: &SleepStateRecord) -> EntityState {
        let mut attributes = Attributes::new();
        for (key, attribute) in &self.attribute_map {
            let value = record
                .get(key)
                .map(Value::from)
                .unwrap_or_else(|| Value::from(STATE_UNAVAILABLE));
            attributes.insert(attribute.clone(), value);
        }

        let event = record.event();
        let observed = sensor.update(event, attributes);
        let context = Context::new();
        let state = self.states.set_with_context(
            sensor.entity_id().to_string(),
            observed.state,
            observed.attributes,
            context.clone(),
        );

        let payload = serde_json::to_value(record).unwrap_or(Value::Null);
        self.bus
            .fire(sensor.entity_id(), payload, Context::child_of(&context));
        self.fire_trigger(sensor.unique_id(), event, &context);

        state
    }

    // ── Alarms ───────────────────────────────────────────

    pub fn handle_alarm_message(&self, topic: &str, payload: &[u8]) {
        let device = self.resolver.device_name_for_alarms(topic);
        let collection = self.alarm_collection(&device);

        match decode_alarms(payload) {
            Ok(batch) => {
                if !batch.rejected.is_empty() {
                    tracing::warn!(
                        "alarms {}: skipped {} of {} alarms",
                        device,
                        batch.rejected.len(),
                        batch.rejected.len() + batch.records.len()
                    );
                }
                self.apply_alarm_batch(&collection, batch.records);
            }
            Err(e) => {
                tracing::warn!(
                    "alarms {}: dropping message on {} ({:?}): {}",
                    device,
                    topic,
                    e.kind(),
                    e
                );
            }
        }
    }

    /// Replace the device's alarm set, rewrite the per-alarm entities and
    /// fire one trigger per alarm whose signal is configured. Returns the
    /// number of triggers fired.
    pub fn apply_alarm_batch(&self, collection: &AlarmCollection, records: Vec<AlarmRecord>) -> usize {
        let _publishing = collection.publishing();
        let replaced = collection.replace(records);
        let alarms = replaced.alarms;
        let context = Context::new();

        for stale in &replaced.stale {
            let entity_id = collection.alarm_entity_id(*stale);
            if self.states.remove(&entity_id) {
                tracing::debug!("alarms {}: removed {}", collection.device_name(), entity_id);
            }
        }

        for alarm in &alarms {
            self.publish_alarm(collection, alarm, &context);
        }
        self.publish_collection(collection, &context);

        let payload = serde_json::to_value(&alarms).unwrap_or(Value::Null);
        self.bus
            .fire(collection.entity_id(), payload, Context::child_of(&context));

        alarms
            .iter()
            .filter(|alarm| self.fire_trigger(collection.unique_id(), alarm_signal(alarm), &context))
            .count()
    }

    /// Local enable/disable of one alarm. Returns the per-alarm entity as
    /// written, or `None` when the device or alarm is unknown.
    pub fn set_alarm_enabled(&self, device: &str, alarm_id: i64, enabled: bool) -> Option<EntityState> {
        let collection = self.alarms.get(device)?;
        let _publishing = collection.publishing();
        let toggled = collection.set_enabled(alarm_id, enabled)?;

        let context = Context::new();
        let state = match toggled {
            Toggled::Live(alarm) => {
                let state = self.publish_alarm(&collection, &alarm, &context);
                self.publish_collection(&collection, &context);
                state
            }
            Toggled::Restored => {
                self.publish_restored_alarm(&collection, alarm_id, enabled, &context)
            }
        };
        self.bus.fire(
            &collection.alarm_entity_id(alarm_id),
            json!({ "event": on_off(enabled) }),
            Context::child_of(&context),
        );
        tracing::info!(
            "alarms {}: alarm {} turned {}",
            device,
            alarm_id,
            on_off(enabled)
        );
        Some(state)
    }

    fn publish_alarm(&self, collection: &AlarmCollection, alarm: &AlarmRecord, parent: &Context) -> EntityState {
        self.states.set_with_context(
            collection.alarm_entity_id(alarm.id),
            on_off(alarm.enabled).to_string(),
            collection.alarm_attributes(alarm),
            Context::child_of(parent),
        )
    }

    /// No record yet: flip the states of the persisted entities and keep
    /// their attributes.
    fn publish_restored_alarm(
        &self,
        collection: &AlarmCollection,
        alarm_id: i64,
        enabled: bool,
        context: &Context,
    ) -> EntityState {
        let entity_id = collection.alarm_entity_id(alarm_id);
        let attributes = self
            .states
            .get(&entity_id)
            .map(|s| s.attributes)
            .unwrap_or_else(|| collection.restored_alarm_attributes(alarm_id));
        let state = self.states.set_with_context(
            entity_id,
            on_off(enabled).to_string(),
            attributes,
            Context::child_of(context),
        );

        let mut attributes = self
            .states
            .get(collection.entity_id())
            .map(|s| s.attributes)
            .unwrap_or_else(|| collection.attributes());
        let enabled_count = attributes
            .get_mut("alarms")
            .and_then(Value::as_array_mut)
            .map(|alarms| {
                for alarm in alarms.iter_mut().filter(|a| a["id"] == alarm_id) {
                    if let Some(fields) = alarm.as_object_mut() {
                        fields.insert("enabled".to_string(), Value::from(enabled));
                    }
                }
                alarms.iter().filter(|a| a["enabled"] == true).count()
            });
        if let Some(count) = enabled_count {
            attributes.insert("enabled_count".to_string(), Value::from(count));
        }
        self.states.set_with_context(
            collection.entity_id().to_string(),
            collection.state().to_string(),
            attributes,
            context.clone(),
        );
        state
    }

    fn publish_collection(&self, collection: &AlarmCollection, context: &Context) {
        self.states.set_with_context(
            collection.entity_id().to_string(),
            collection.state().to_string(),
            collection.attributes(),
            context.clone(),
        );
    }

    // ── Triggers ─────────────────────────────────────────

    /// Fire the device trigger for `trigger_type` if it is configured.
    fn fire_trigger(&self, device_id: &str, trigger_type: &str, parent: &Context) -> bool {
        if !self.triggers.contains(trigger_type) {
            tracing::debug!(
                "Got {} event, but it is not a configured trigger: not firing it",
                trigger_type
            );
            return false;
        }
        self.bus.fire(
            TRIGGER_EVENT,
            json!({ "device_id": device_id, "type": trigger_type }),
            Context::child_of(parent),
        );
        true
    }

    // ── Directories ──────────────────────────────────────

    fn tracker(&self, device: &str) -> Arc<SleepTrackerSensor> {
        let unique_id = self.create_entity_id(device);
        let (sensor, created) = self
            .trackers
            .resolve(device, |name| SleepTrackerSensor::new(&self.name, name, &unique_id));
        if created {
            tracing::info!(
                "New sleep tracker {} ({})",
                sensor.device_name(),
                sensor.entity_id()
            );
        }
        sensor
    }

    fn alarm_collection(&self, device: &str) -> Arc<AlarmCollection> {
        let unique_id = self.create_entity_id(device);
        let (collection, created) = self
            .alarms
            .resolve(device, |name| AlarmCollection::new(&self.name, name, &unique_id));
        if created {
            tracing::info!("New alarm collection {} ({})", device, collection.entity_id());
        }
        collection
    }

    /// Recreate directory entries for every persisted entity carrying this
    /// instance's name. Per-alarm `enabled` flags are handed to their collection and
    /// hold until the first alarm batch arrives. Returns the number of
    /// entities recognized.
    pub fn restore_entities(&self) -> usize {
        let mut restored = 0;
        for state in self.states.get_all() {
            let Some(kind) = EntityKind::from_attributes(&state.attributes) else {
                continue;
            };
            let owner = state.attributes.get(INSTANCE_ATTRIBUTE).and_then(Value::as_str);
            if owner != Some(self.name.as_str()) {
                continue;
            }
            let Some(device) = state
                .attributes
                .get(DEVICE_ID_ATTRIBUTE)
                .and_then(Value::as_str)
                .and_then(|unique_id| self.device_name_from_entity_id(unique_id))
            else {
                continue;
            };

            tracing::debug!("Restoring {} for device {}", state.entity_id, device);
            match kind {
                EntityKind::Tracker => {
                    let sensor = self.tracker(&device);
                    let mut attributes = state.attributes.clone();
                    attributes.remove(DEVICE_ID_ATTRIBUTE);
                    sensor.update(&state.state, attributes);
                }
                EntityKind::Alarms => {
                    self.alarm_collection(&device);
                }
                EntityKind::Alarm => {
                    let collection = self.alarm_collection(&device);
                    if let Some(alarm_id) = state.attributes.get(ALARM_ID_ATTRIBUTE).and_then(Value::as_i64) {
                        collection.restore_enabled(alarm_id, state.state == STATE_ON);
                    }
                }
            }
            restored += 1;
        }
        restored
    }

    pub fn tracker_devices(&self) -> Vec<String> {
        self.trackers.names()
    }

    pub fn alarm_devices(&self) -> Vec<String> {
        self.alarms.names()
    }

    pub fn alarms_for(&self, device: &str) -> Option<Vec<AlarmRecord>> {
        self.alarms.get(device).map(|c| c.alarms())
    }
}
