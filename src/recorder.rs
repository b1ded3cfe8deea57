//! State persistence via SQLite + WAL.
//!
//! Write-through on every state change with batch coalescing (100ms).
//! On startup, restores all entity states before the MQTT loop starts so the
//! dispatcher can recreate its devices. History older than the retention
//! window is purged hourly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tokio::sync::mpsc;

use crate::entity::Attributes;
use crate::state::{Context, EntityState, StateChangedEvent, StateMachine};

/// A state change queued for persistence. `None` state means the entity was
/// removed.
struct PendingWrite {
    entity_id: String,
    state: Option<PersistedState>,
}

struct PersistedState {
    state: String,
    attributes_json: String,
    last_changed: String,
    last_updated: String,
}

/// Open (or create) the SQLite database with WAL mode.
fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entity_states (
            entity_id   TEXT PRIMARY KEY,
            state       TEXT NOT NULL,
            attributes  TEXT NOT NULL DEFAULT '{}',
            last_changed TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS state_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id   TEXT NOT NULL,
            state       TEXT NOT NULL,
            attributes  TEXT NOT NULL DEFAULT '{}',
            last_changed TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            recorded_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_history_entity
            ON state_history(entity_id, recorded_at);
        CREATE INDEX IF NOT EXISTS idx_history_recorded
            ON state_history(recorded_at);",
    )?;

    Ok(conn)
}

/// Restore all persisted entity states into the state machine without
/// broadcasting them. Called once at startup.
pub fn restore(db_path: &Path, state_machine: &StateMachine) -> anyhow::Result<usize> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT entity_id, state, attributes, last_changed, last_updated FROM entity_states",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let now = Utc::now();
    let mut count = 0usize;
    for row in rows {
        let (entity_id, state, attrs_json, last_changed, last_updated) = row?;
        let attributes: Attributes = match serde_json::from_str(&attrs_json) {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::warn!("Recorder: bad attributes for {}: {}", entity_id, e);
                Attributes::new()
            }
        };
        state_machine.restore(EntityState {
            entity_id,
            state,
            attributes,
            last_changed: parse_time(&last_changed).unwrap_or(now),
            last_updated: parse_time(&last_updated).unwrap_or(now),
            last_reported: now,
            context: Context::new(),
        });
        count += 1;
    }

    Ok(count)
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Spawn the persistence writer.
///
/// Returns an mpsc sender. The caller feeds StateChangedEvents into it;
/// the writer batches them with 100ms coalescing and writes to SQLite.
pub fn spawn_writer(db_path: PathBuf, retention_days: u32) -> mpsc::UnboundedSender<StateChangedEvent> {
    let (tx, rx) = mpsc::unbounded_channel::<StateChangedEvent>();

    // The SQLite writer runs on a dedicated blocking thread so it never
    // starves the tokio runtime.
    tokio::task::spawn_blocking(move || {
        writer_loop(db_path, retention_days, rx);
    });

    tx
}

/// The blocking writer loop. Drains the channel with 100ms coalescing.
fn writer_loop(db_path: PathBuf, retention_days: u32, mut rx: mpsc::UnboundedReceiver<StateChangedEvent>) {
    let conn = match open_db(&db_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Recorder: failed to open DB: {}", e);
            return;
        }
    };

    if let Err(e) = purge_history(&conn, retention_days) {
        tracing::warn!("Recorder: purge error: {}", e);
    }

    let mut batch: Vec<PendingWrite> = Vec::with_capacity(128);
    let coalesce = Duration::from_millis(100);
    let purge_interval = Duration::from_secs(3600);
    let mut last_purge = std::time::Instant::now();

    while let Some(event) = rx.blocking_recv() {
        batch.push(to_pending(&event));

        // UnboundedReceiver has no recv timeout; poll with short sleeps
        // until the coalescing window closes
        let deadline = std::time::Instant::now() + coalesce;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.try_recv() {
                Ok(event) => batch.push(to_pending(&event)),
                Err(mpsc::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(10).min(remaining));
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !batch.is_empty() {
                        flush_batch(&conn, &batch);
                    }
                    return;
                }
            }
        }

        if !batch.is_empty() {
            flush_batch(&conn, &batch);
            batch.clear();
        }

        if last_purge.elapsed() >= purge_interval {
            if let Err(e) = purge_history(&conn, retention_days) {
                tracing::warn!("Recorder: purge error: {}", e);
            }
            match conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(2)?))
            }) {
                Ok((busy, checkpointed)) => {
                    tracing::debug!(
                        "Recorder: WAL checkpoint busy={}, checkpointed={}",
                        busy,
                        checkpointed
                    );
                }
                Err(e) => tracing::warn!("Recorder: WAL checkpoint error: {}", e),
            }
            last_purge = std::time::Instant::now();
        }
    }
}

fn to_pending(event: &StateChangedEvent) -> PendingWrite {
    PendingWrite {
        entity_id: event.entity_id.clone(),
        state: event.new_state.as_ref().map(|new_state| PersistedState {
            state: new_state.state.clone(),
            attributes_json: serde_json::to_string(&new_state.attributes)
                .unwrap_or_else(|_| "{}".to_string()),
            last_changed: new_state.last_changed.to_rfc3339(),
            last_updated: new_state.last_updated.to_rfc3339(),
        }),
    }
}

fn flush_batch(conn: &Connection, batch: &[PendingWrite]) {
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Recorder: begin tx failed: {}", e);
            return;
        }
    };

    for w in batch {
        let Some(s) = &w.state else {
            if let Err(e) = tx.execute(
                "DELETE FROM entity_states WHERE entity_id = ?1",
                params![w.entity_id],
            ) {
                tracing::error!("Recorder: delete error: {}", e);
            }
            continue;
        };

        if let Err(e) = tx.execute(
            "INSERT INTO entity_states (entity_id, state, attributes, last_changed, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_id) DO UPDATE SET
                state = excluded.state,
                attributes = excluded.attributes,
                last_changed = excluded.last_changed,
                last_updated = excluded.last_updated",
            params![w.entity_id, s.state, s.attributes_json, s.last_changed, s.last_updated],
        ) {
            tracing::error!("Recorder: upsert error: {}", e);
        }

        if let Err(e) = tx.execute(
            "INSERT INTO state_history (entity_id, state, attributes, last_changed, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![w.entity_id, s.state, s.attributes_json, s.last_changed, s.last_updated],
        ) {
            tracing::error!("Recorder: history insert error: {}", e);
        }
    }

    if let Err(e) = tx.commit() {
        tracing::error!("Recorder: commit failed: {}", e);
    }
}

#[derive(Debug, serde::Serialize)]
pub struct HistoryEntry {
    pub state: String,
    pub attributes: serde_json::Value,
    pub last_changed: String,
    pub recorded_at: String,
}

/// Most recent history rows of an entity, newest first.
pub fn query_history(db_path: &Path, entity_id: &str, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT state, attributes, last_changed, recorded_at
         FROM state_history
         WHERE entity_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![entity_id, limit as i64], |row| {
        let attributes: String = row.get(1)?;
        Ok(HistoryEntry {
            state: row.get(0)?,
            attributes: serde_json::from_str(&attributes).unwrap_or(serde_json::Value::Null),
            last_changed: row.get(2)?,
            recorded_at: row.get(3)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn purge_history(conn: &Connection, retention_days: u32) -> rusqlite::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let cutoff_str = cutoff.to_rfc3339_opts(SecondsFormat::Millis, true);
    let deleted = conn.execute(
        "DELETE FROM state_history WHERE recorded_at < ?1",
        params![cutoff_str],
    )?;
    if deleted > 0 {
        tracing::info!(
            "Recorder: purged {} history rows older than {} days",
            deleted,
            retention_days
        );
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes(rx: &mut tokio::sync::broadcast::Receiver<StateChangedEvent>) -> Vec<PendingWrite> {
        let mut pending = Vec::new();
        while let Ok(event) = rx.try_recv() {
            pending.push(to_pending(&event));
        }
        pending
    }

    #[test]
    fn test_flush_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");

        let sm = StateMachine::new(64);
        let mut rx = sm.subscribe();
        let mut attrs = Attributes::new();
        attrs.insert("label".to_string(), json!("work"));
        sm.set("sensor.sleepasha_pixel".to_string(), "rem".to_string(), attrs);
        sm.set("binary_sensor.sleepasha_pixel_alarm_1".to_string(), "on".to_string(), Attributes::new());

        let conn = open_db(&db).unwrap();
        flush_batch(&conn, &changes(&mut rx));

        let restored = StateMachine::new(64);
        let mut restored_rx = restored.subscribe();
        assert_eq!(restore(&db, &restored).unwrap(), 2);
        assert!(restored_rx.try_recv().is_err());

        let sensor = restored.get("sensor.sleepasha_pixel").unwrap();
        assert_eq!(sensor.state, "rem");
        assert_eq!(sensor.attributes["label"], "work");
        let original = sm.get("sensor.sleepasha_pixel").unwrap();
        assert_eq!(
            sensor.last_changed.timestamp_millis(),
            original.last_changed.timestamp_millis()
        );
    }

    #[test]
    fn test_upsert_keeps_latest_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");

        let sm = StateMachine::new(64);
        let mut rx = sm.subscribe();
        sm.set("sensor.a".to_string(), "awake".to_string(), Attributes::new());
        sm.set("sensor.a".to_string(), "deep_sleep".to_string(), Attributes::new());

        let conn = open_db(&db).unwrap();
        flush_batch(&conn, &changes(&mut rx));

        let restored = StateMachine::new(64);
        assert_eq!(restore(&db, &restored).unwrap(), 1);
        assert_eq!(restored.get("sensor.a").unwrap().state, "deep_sleep");

        let history = query_history(&db, "sensor.a", 10).unwrap();
        let states: Vec<&str> = history.iter().map(|h| h.state.as_str()).collect();
        assert_eq!(states, vec!["deep_sleep", "awake"]);
    }

    #[test]
    fn test_removed_entity_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");

        let sm = StateMachine::new(64);
        let mut rx = sm.subscribe();
        sm.set("binary_sensor.x_alarm_1".to_string(), "on".to_string(), Attributes::new());
        sm.remove("binary_sensor.x_alarm_1");

        let conn = open_db(&db).unwrap();
        flush_batch(&conn, &changes(&mut rx));

        let restored = StateMachine::new(64);
        assert_eq!(restore(&db, &restored).unwrap(), 0);
    }

    #[test]
    fn test_purge_history() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(&dir.path().join("bridge.db")).unwrap();
        conn.execute(
            "INSERT INTO state_history (entity_id, state, last_changed, last_updated, recorded_at)
             VALUES ('sensor.a', 'old', 'x', 'x', '2000-01-01T00:00:00.000Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO state_history (entity_id, state, last_changed, last_updated)
             VALUES ('sensor.a', 'new', 'x', 'x')",
            [],
        )
        .unwrap();

        assert_eq!(purge_history(&conn, 10).unwrap(), 1);
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM state_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn test_writer_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");

        let sm = StateMachine::new(64);
        let mut rx = sm.subscribe();
        let tx = spawn_writer(db.clone(), 10);
        sm.set("sensor.a".to_string(), "rem".to_string(), Attributes::new());
        tx.send(rx.recv().await.unwrap()).unwrap();
        drop(tx);

        // The writer flushes on disconnect; poll until the row lands
        let mut restored = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            restored = restore(&db, &StateMachine::new(8)).unwrap();
            if restored == 1 {
                break;
            }
        }
        assert_eq!(restored, 1);
    }
}
