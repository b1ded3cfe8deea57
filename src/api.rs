use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::payload::AlarmRecord;
use crate::recorder::{self, HistoryEntry};
use crate::state::{EntityState, EventBus, StateMachine};

/// Shared application state
pub struct AppState {
    pub states: Arc<StateMachine>,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub db_path: PathBuf,
    pub started_at: std::time::Instant,
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    entity_count: usize,
    tracker_devices: usize,
    alarm_devices: usize,
    state_changes: u64,
    events_fired: u64,
    avg_transition_us: f64,
    max_transition_us: f64,
}

#[derive(Serialize)]
struct DevicesResponse {
    trackers: Vec<String>,
    alarms: Vec<String>,
    state_topic: String,
    alarm_topic: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    100
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/health", get(health))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/history/:entity_id", get(get_history))
        .route("/api/devices", get(get_devices))
        .route("/api/devices/:device/alarms", get(get_alarms))
        .route(
            "/api/devices/:device/alarms/:alarm_id/:action",
            post(alarm_action),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/ — API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/health — counters for monitoring
async fn health(State(app): State<Arc<AppState>>) -> Json<HealthResponse> {
    let metrics = &app.states.metrics;
    let changes = metrics.state_changes.load(Ordering::Relaxed);
    let total_ns = metrics.total_transition_ns.load(Ordering::Relaxed);
    let avg_transition_us = if changes > 0 {
        total_ns as f64 / changes as f64 / 1000.0
    } else {
        0.0
    };

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: app.started_at.elapsed().as_secs(),
        entity_count: app.states.len(),
        tracker_devices: app.dispatcher.tracker_devices().len(),
        alarm_devices: app.dispatcher.alarm_devices().len(),
        state_changes: changes,
        events_fired: app.bus.fired(),
        avg_transition_us,
        max_transition_us: metrics.max_transition_ns.load(Ordering::Relaxed) as f64 / 1000.0,
    })
}

/// GET /api/states — return all entity states
async fn get_states(State(app): State<Arc<AppState>>) -> Json<Vec<EntityState>> {
    Json(app.states.get_all())
}

/// GET /api/states/{entity_id} — return single entity state
async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    app.states
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/history/{entity_id}?limit=N — recorded states, newest first
async fn get_history(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, StatusCode> {
    let db_path = app.db_path.clone();
    let limit = query.limit.min(10_000);
    let result = tokio::task::spawn_blocking(move || {
        recorder::query_history(&db_path, &entity_id, limit)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match result {
        Ok(entries) => Ok(Json(entries)),
        Err(e) => {
            tracing::error!("History query failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/devices — devices seen on either topic
async fn get_devices(State(app): State<Arc<AppState>>) -> Json<DevicesResponse> {
    let resolver = app.dispatcher.resolver();
    Json(DevicesResponse {
        trackers: app.dispatcher.tracker_devices(),
        alarms: app.dispatcher.alarm_devices(),
        state_topic: resolver.state_pattern().to_string(),
        alarm_topic: resolver.alarm_pattern().to_string(),
    })
}

/// GET /api/devices/{device}/alarms — decoded alarms of a device
async fn get_alarms(
    State(app): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Result<Json<Vec<AlarmRecord>>, StatusCode> {
    app.dispatcher
        .alarms_for(&device)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/devices/{device}/alarms/{alarm_id}/{turn_on|turn_off}
async fn alarm_action(
    State(app): State<Arc<AppState>>,
    Path((device, alarm_id, action)): Path<(String, i64, String)>,
) -> Result<Json<EntityState>, StatusCode> {
    let enabled = match action.as_str() {
        "turn_on" => true,
        "turn_off" => false,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    app.dispatcher
        .set_alarm_enabled(&device, alarm_id, enabled)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use serde_json::json;

    fn make_app(db_path: PathBuf) -> Arc<AppState> {
        let states = Arc::new(StateMachine::new(256));
        let bus = Arc::new(EventBus::new(256));
        let dispatcher = Arc::new(Dispatcher::new(
            &BridgeConfig::default(),
            states.clone(),
            bus.clone(),
        ));
        Arc::new(AppState {
            states,
            bus,
            dispatcher,
            db_path,
            started_at: std::time::Instant::now(),
        })
    }

    fn feed_alarms(app: &AppState) {
        let payload = serde_json::to_vec(&json!([
            {"id": 1, "hour": 6, "minutes": 45, "daysOfWeek": {"weekRepeat": 0, "days": 31}}
        ]))
        .unwrap();
        app.dispatcher.handle_message("SleepAsHA/pixel/alarms", &payload);
    }

    #[tokio::test]
    async fn test_states_endpoints() {
        let app = make_app(PathBuf::from("unused.db"));
        app.dispatcher
            .handle_message("SleepAsHA/pixel", br#"{"event":"awake"}"#);

        let Json(all) = get_states(State(app.clone())).await;
        assert_eq!(all.len(), 1);

        let Json(one) = get_state(State(app.clone()), Path("sensor.sleepasha_pixel".to_string()))
            .await
            .unwrap();
        assert_eq!(one.state, "awake");

        let missing = get_state(State(app.clone()), Path("sensor.nope".to_string())).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);

        let Json(health) = health(State(app)).await;
        assert_eq!(health.entity_count, 1);
        assert_eq!(health.tracker_devices, 1);
        assert_eq!(health.events_fired, 2);
    }

    #[tokio::test]
    async fn test_devices_and_alarms() {
        let app = make_app(PathBuf::from("unused.db"));
        feed_alarms(&app);

        let Json(devices) = get_devices(State(app.clone())).await;
        assert!(devices.trackers.is_empty());
        assert_eq!(devices.alarms, vec!["pixel".to_string()]);
        assert_eq!(devices.state_topic, "SleepAsHA/+");
        assert_eq!(devices.alarm_topic, "SleepAsHA/+/alarms");

        let Json(alarms) = get_alarms(State(app.clone()), Path("pixel".to_string()))
            .await
            .unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].minute, 45);

        let missing = get_alarms(State(app), Path("other".to_string())).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_alarm_actions() {
        let app = make_app(PathBuf::from("unused.db"));
        feed_alarms(&app);

        let Json(alarm) = alarm_action(
            State(app.clone()),
            Path(("pixel".to_string(), 1, "turn_off".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(alarm.state, "off");
        assert!(!app.dispatcher.alarms_for("pixel").unwrap()[0].enabled);
        assert_eq!(
            app.states
                .get("binary_sensor.sleepasha_pixel_alarm_1")
                .unwrap()
                .state,
            "off"
        );

        let bad = alarm_action(
            State(app.clone()),
            Path(("pixel".to_string(), 1, "toggle".to_string())),
        )
        .await;
        assert_eq!(bad.unwrap_err(), StatusCode::BAD_REQUEST);

        let unknown = alarm_action(
            State(app),
            Path(("pixel".to_string(), 2, "turn_on".to_string())),
        )
        .await;
        assert_eq!(unknown.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(dir.path().join("bridge.db"));

        let Json(entries) = get_history(
            State(app),
            Path("sensor.sleepasha_pixel".to_string()),
            Query(HistoryQuery { limit: 5 }),
        )
        .await
        .unwrap();
        assert!(entries.is_empty());
    }
}
