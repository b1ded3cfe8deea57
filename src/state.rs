use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::entity::Attributes;

/// Observable state of one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }

    /// A context caused by another one, e.g. the trigger fired by a state update.
    pub fn child_of(parent: &Context) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: Some(parent.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Event fired when state changes
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: Option<EntityState>,
}

/// Metrics counters for state machine operations
pub struct Metrics {
    pub state_changes: AtomicU64,
    /// Cumulative nanoseconds for state transitions (for average calculation)
    pub total_transition_ns: AtomicU64,
    /// Max transition time in nanoseconds
    pub max_transition_ns: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            state_changes: AtomicU64::new(0),
            total_transition_ns: AtomicU64::new(0),
            max_transition_ns: AtomicU64::new(0),
        }
    }
}

/// Entity states published by the bridge.
pub struct StateMachine {
    states: Arc<DashMap<String, EntityState>>,
    event_tx: broadcast::Sender<StateChangedEvent>,
    pub metrics: Metrics,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: Arc::new(DashMap::new()),
            event_tx,
            metrics: Metrics::new(),
        }
    }

    /// Get all entity states, ordered by entity id
    pub fn get_all(&self) -> Vec<EntityState> {
        let mut all: Vec<EntityState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    /// Get a single entity state
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Set entity state and broadcast the change.
    #[cfg(test)]
    pub fn set(&self, entity_id: String, state: String, attributes: Attributes) -> EntityState {
        self.set_with_context(entity_id, state, attributes, Context::new())
    }

    pub fn set_with_context(
        &self,
        entity_id: String,
        state: String,
        attributes: Attributes,
        context: Context,
    ) -> EntityState {
        let start = std::time::Instant::now();
        let now = Utc::now();

        let old_state = self.states.get(&entity_id).map(|e| e.value().clone());

        // last_changed moves on state changes only, last_updated also on
        // attribute changes, last_reported on every write
        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state {
                    now
                } else {
                    prev.last_changed
                };
                let updated = if prev.state != state || prev.attributes != attributes {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated,
            last_reported: now,
            context,
        };

        self.states.insert(entity_id.clone(), new_state.clone());

        // Ignore error if no subscribers
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        let elapsed_ns = start.elapsed().as_nanos() as u64;
        self.metrics.state_changes.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_transition_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.metrics.max_transition_ns.fetch_max(elapsed_ns, Ordering::Relaxed);

        new_state
    }

    /// Load a persisted state without broadcasting it.
    pub fn restore(&self, state: EntityState) {
        self.states.insert(state.entity_id.clone(), state);
    }

    /// Remove an entity. Broadcasts a change with no new state so the
    /// recorder can drop it too. Returns true if it existed.
    pub fn remove(&self, entity_id: &str) -> bool {
        match self.states.remove(entity_id) {
            Some((entity_id, old)) => {
                let _ = self.event_tx.send(StateChangedEvent {
                    entity_id,
                    old_state: Some(old),
                    new_state: None,
                });
                true
            }
            None => false,
        }
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    /// Number of entities currently tracked
    pub fn len(&self) -> usize {
        self.states.len()
    }
}

/// An event on the bus: domain events named after an entity and the
/// trigger event.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event_type: String,
    pub data: serde_json::Value,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    fired: AtomicU64,
}

impl EventBus {
    pub fn new(channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            tx,
            fired: AtomicU64::new(0),
        }
    }

    pub fn fire(&self, event_type: &str, data: serde_json::Value, context: Context) -> BusEvent {
        let event = BusEvent {
            event_type: event_type.to_string(),
            data,
            time_fired: Utc::now(),
            context,
        };
        tracing::debug!("Firing '{}' with payload: {}", event.event_type, event.data);
        let _ = self.tx.send(event.clone());
        self.fired.fetch_add(1, Ordering::Relaxed);
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_tracks_timestamps() {
        let sm = StateMachine::new(16);
        let first = sm.set("sensor.a".to_string(), "awake".to_string(), Attributes::new());
        assert_eq!(first.last_changed, first.last_updated);

        let second = sm.set("sensor.a".to_string(), "awake".to_string(), Attributes::new());
        assert_eq!(second.last_changed, first.last_changed);
        assert_eq!(second.last_updated, first.last_updated);
        assert!(second.last_reported >= first.last_reported);

        let mut attrs = Attributes::new();
        attrs.insert("label".to_string(), json!("x"));
        let third = sm.set("sensor.a".to_string(), "awake".to_string(), attrs);
        assert_eq!(third.last_changed, first.last_changed);
        assert!(third.last_updated >= second.last_updated);
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_set_broadcasts() {
        let sm = StateMachine::new(16);
        let mut rx = sm.subscribe();
        sm.set("sensor.a".to_string(), "rem".to_string(), Attributes::new());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.entity_id, "sensor.a");
        assert!(event.old_state.is_none());
        assert_eq!(event.new_state.unwrap().state, "rem");
    }

    #[test]
    fn test_restore_is_silent_and_remove_broadcasts() {
        let sm = StateMachine::new(16);
        let state = sm.set("sensor.a".to_string(), "rem".to_string(), Attributes::new());
        let mut rx = sm.subscribe();

        sm.restore(EntityState {
            entity_id: "sensor.b".to_string(),
            ..state
        });
        assert!(rx.try_recv().is_err());
        assert!(sm.get("sensor.b").is_some());

        assert!(sm.remove("sensor.b"));
        let event = rx.try_recv().unwrap();
        assert!(event.new_state.is_none());
        assert!(!sm.remove("sensor.b"));
    }

    #[test]
    fn test_event_bus() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let parent = Context::new();
        bus.fire("sleep_as_ha_event", json!({"type": "awake"}), Context::child_of(&parent));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "sleep_as_ha_event");
        assert_eq!(event.data["type"], "awake");
        assert_eq!(event.context.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(bus.fired(), 1);
    }
}
