//! Persistent beacon and task records backed by `SQLite`.
//!
//! # Schema
//!
//! The `tasks` table holds one row per operator command: `task_id`
//! (autoincrement), `msg_id`, `beacon_id`, `req_param`, `rsp_param`,
//! `status`, timestamps. Status moves CREATED → DISPATCHED → DONE and
//! never regresses; the CREATED → DISPATCHED transition is a single
//! conditional `UPDATE … RETURNING`, so concurrent heartbeat and push
//! workers can never dispatch the same task twice.
//!
//! The `beacons` table holds one row per beacon id with its last observed
//! address and serialized host detail. Deletion is soft (`deleted_at`);
//! a soft-deleted beacon stays deleted even if it keeps heartbeating.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use prost::Message;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use scarab_core::messages::{BeaconInfo, BeaconsRsp, MapValueData, TaskData};

/// Display format for record timestamps on the operator plane.
const TIME_DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Task lifecycle states as stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TaskStatus {
    /// Recorded at operator publish, not yet delivered.
    Created = 0,
    /// Handed to the beacon by either delivery path.
    Dispatched = 1,
    /// Response received and recorded.
    Done = 2,
}

/// One completed task as returned by [`TaskStore::get_task_responses`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    /// Task identifier.
    pub task_id: u64,
    /// Beacon that executed the task.
    pub beacon_id: String,
    /// Command code of the task.
    pub msg_id: i32,
    /// Recorded response bytes.
    pub rsp_param: Vec<u8>,
}

/// Errors surfaced by the repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The shared connection lock was poisoned by a panicking thread.
    #[error("connection lock poisoned")]
    LockPoisoned,

    /// No CREATED task is pending for the beacon.
    #[error("no pending task for beacon {beacon_id}")]
    NoTask {
        /// The beacon that had nothing queued.
        beacon_id: String,
    },
}

/// Task repository: the operator-to-beacon command queue.
pub trait TaskStore: Send + Sync {
    /// Records a new CREATED task, returning its id.
    fn add_task(&self, msg_id: i32, beacon_id: &str, req_param: &[u8]) -> Result<u64, StoreError>;

    /// Returns the oldest CREATED task for `beacon_id`, atomically moving
    /// it to DISPATCHED. [`StoreError::NoTask`] when nothing is queued.
    fn get_task(&self, beacon_id: &str) -> Result<TaskData, StoreError>;

    /// Records the response for a DISPATCHED task and moves it to DONE.
    /// A task in any other state is left untouched.
    fn update_task(&self, task_id: u64, rsp_param: &[u8]) -> Result<(), StoreError>;

    /// All DONE tasks whose command code equals `msg_id`.
    fn get_task_responses(&self, msg_id: i32) -> Result<Vec<TaskResponse>, StoreError>;
}

/// Beacon repository: the persistent fleet roster.
pub trait BeaconStore: Send + Sync {
    /// Creates the beacon row or refreshes its address and detail blob.
    /// Soft-deleted beacons are not resurrected.
    fn upsert_beacon(&self, beacon_id: &str, ip_addr: &str, detail: &[u8])
        -> Result<(), StoreError>;

    /// Soft-deletes the beacon row. Missing or already-deleted rows are a
    /// no-op.
    fn delete_beacon(&self, beacon_id: &str) -> Result<(), StoreError>;

    /// Enumerates live beacons with display-formatted timestamps and the
    /// detail blob rendered for operators.
    fn list_beacons(&self) -> Result<BeaconsRsp, StoreError>;
}

/// Combined repository capability handed to the session plane.
pub trait Store: TaskStore + BeaconStore {}

impl<T: TaskStore + BeaconStore> Store for T {}

/// `SQLite`-backed implementation of both repositories.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the file cannot be opened or
    /// the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests and ephemeral deployments.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when schema creation fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates both tables and their indexes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error on DDL failure.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id INTEGER PRIMARY KEY AUTOINCREMENT,
                msg_id INTEGER NOT NULL,
                beacon_id TEXT NOT NULL,
                req_param BLOB NOT NULL,
                rsp_param BLOB,
                status INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_beacon_status
             ON tasks(beacon_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS beacons (
                beacon_id TEXT PRIMARY KEY,
                ip_addr TEXT NOT NULL,
                detail BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn display_time(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map_or_else(|_| raw.to_string(), |t| t.format(TIME_DISPLAY_FORMAT).to_string())
}

/// Renders the serialized host detail map as `key:value, ` pairs, keys
/// sorted for stable output.
fn render_detail(detail: &[u8]) -> String {
    let Ok(value) = MapValueData::decode(detail) else {
        return String::new();
    };
    let mut entries: Vec<_> = value.dict_value.into_iter().collect();
    entries.sort();
    entries
        .into_iter()
        .map(|(k, v)| format!("{k}:{v}, "))
        .collect()
}

impl TaskStore for SqliteStore {
    fn add_task(&self, msg_id: i32, beacon_id: &str, req_param: &[u8]) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let stamp = now();
        conn.execute(
            "INSERT INTO tasks (msg_id, beacon_id, req_param, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![msg_id, beacon_id, req_param, TaskStatus::Created as i64, stamp],
        )?;
        #[allow(clippy::cast_sign_loss)] // rowids are non-negative
        Ok(conn.last_insert_rowid() as u64)
    }

    fn get_task(&self, beacon_id: &str) -> Result<TaskData, StoreError> {
        let conn = self.lock()?;
        // Single conditional UPDATE: selection and the CREATED → DISPATCHED
        // transition happen in one statement, so two workers racing on the
        // same beacon can never both claim a task.
        conn.query_row(
            "UPDATE tasks SET status = ?1, updated_at = ?2
             WHERE task_id = (
                 SELECT task_id FROM tasks
                 WHERE beacon_id = ?3 AND status = ?4
                 ORDER BY task_id LIMIT 1
             ) AND status = ?4
             RETURNING task_id, msg_id, beacon_id, req_param",
            params![
                TaskStatus::Dispatched as i64,
                now(),
                beacon_id,
                TaskStatus::Created as i64
            ],
            |row| {
                Ok(TaskData {
                    task_id: row.get::<_, i64>(0)? as u64,
                    msg_id: row.get(1)?,
                    beacon_id: row.get(2)?,
                    byte_value: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NoTask {
            beacon_id: beacon_id.to_string(),
        })
    }

    fn update_task(&self, task_id: u64, rsp_param: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        // Only DISPATCHED tasks accept a response; anything else no-ops so
        // the lifecycle can never move backwards.
        conn.execute(
            "UPDATE tasks SET rsp_param = ?1, status = ?2, updated_at = ?3
             WHERE task_id = ?4 AND status = ?5",
            params![
                rsp_param,
                TaskStatus::Done as i64,
                now(),
                task_id as i64,
                TaskStatus::Dispatched as i64
            ],
        )?;
        Ok(())
    }

    fn get_task_responses(&self, msg_id: i32) -> Result<Vec<TaskResponse>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, beacon_id, msg_id, rsp_param FROM tasks
             WHERE msg_id = ?1 AND status = ?2 ORDER BY task_id",
        )?;
        let rows = stmt.query_map(params![msg_id, TaskStatus::Done as i64], |row| {
            Ok(TaskResponse {
                task_id: row.get::<_, i64>(0)? as u64,
                beacon_id: row.get(1)?,
                msg_id: row.get(2)?,
                rsp_param: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl BeaconStore for SqliteStore {
    fn upsert_beacon(
        &self,
        beacon_id: &str,
        ip_addr: &str,
        detail: &[u8],
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let stamp = now();
        // The WHERE guard keeps soft-deleted rows deleted.
        conn.execute(
            "INSERT INTO beacons (beacon_id, ip_addr, detail, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(beacon_id) DO UPDATE SET
                 ip_addr = excluded.ip_addr,
                 detail = excluded.detail,
                 updated_at = excluded.updated_at
             WHERE beacons.deleted_at IS NULL",
            params![beacon_id, ip_addr, detail, stamp],
        )?;
        Ok(())
    }

    fn delete_beacon(&self, beacon_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE beacons SET deleted_at = ?1 WHERE beacon_id = ?2 AND deleted_at IS NULL",
            params![now(), beacon_id],
        )?;
        Ok(())
    }

    fn list_beacons(&self) -> Result<BeaconsRsp, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT beacon_id, ip_addr, detail, created_at, updated_at FROM beacons
             WHERE deleted_at IS NULL ORDER BY beacon_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let detail: Vec<u8> = row.get(2)?;
            let created: String = row.get(3)?;
            let updated: String = row.get(4)?;
            Ok(BeaconInfo {
                beacon_id: row.get(0)?,
                ip_addr: row.get(1)?,
                detail_info: render_detail(&detail),
                create_tm: display_time(&created),
                update_tm: display_time(&updated),
            })
        })?;
        Ok(BeaconsRsp {
            beacon: rows.collect::<Result<Vec<_>, _>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::thread;

    use super::*;

    fn detail_blob(entries: &[(&str, &str)]) -> Vec<u8> {
        let value = MapValueData {
            dict_value: entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<HashMap<_, _>>(),
        };
        value.encode_to_vec()
    }

    #[test]
    fn task_lifecycle_created_dispatched_done() {
        let store = SqliteStore::open_in_memory().unwrap();

        let task_id = store.add_task(42, "b1", b"arg").unwrap();

        let task = store.get_task("b1").unwrap();
        assert_eq!(task.task_id, task_id);
        assert_eq!(task.msg_id, 42);
        assert_eq!(task.beacon_id, "b1");
        assert_eq!(task.byte_value, b"arg");

        // Dispatched exactly once.
        assert!(matches!(
            store.get_task("b1"),
            Err(StoreError::NoTask { .. })
        ));

        store.update_task(task_id, b"out").unwrap();
        let responses = store.get_task_responses(42).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].task_id, task_id);
        assert_eq!(responses[0].rsp_param, b"out");
    }

    #[test]
    fn tasks_drain_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.add_task(1, "b1", b"first").unwrap();
        let second = store.add_task(1, "b1", b"second").unwrap();

        assert_eq!(store.get_task("b1").unwrap().task_id, first);
        assert_eq!(store.get_task("b1").unwrap().task_id, second);
    }

    #[test]
    fn tasks_are_scoped_to_their_beacon() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_task(1, "b1", b"x").unwrap();
        assert!(matches!(
            store.get_task("b2"),
            Err(StoreError::NoTask { .. })
        ));
    }

    #[test]
    fn update_before_dispatch_is_a_no_op() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task_id = store.add_task(1, "b1", b"x").unwrap();

        // Still CREATED, so the response must not land.
        store.update_task(task_id, b"early").unwrap();
        assert!(store.get_task_responses(1).unwrap().is_empty());

        // And the task is still deliverable.
        assert_eq!(store.get_task("b1").unwrap().task_id, task_id);
    }

    #[test]
    fn done_task_never_regresses() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task_id = store.add_task(1, "b1", b"x").unwrap();
        store.get_task("b1").unwrap();
        store.update_task(task_id, b"out").unwrap();

        // A second response attempt leaves the recorded one in place.
        store.update_task(task_id, b"other").unwrap();
        let responses = store.get_task_responses(1).unwrap();
        assert_eq!(responses[0].rsp_param, b"out");

        assert!(matches!(
            store.get_task("b1"),
            Err(StoreError::NoTask { .. })
        ));
    }

    #[test]
    fn concurrent_pulls_dispatch_exactly_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_task(7, "b1", b"only").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || store.get_task("b1").is_ok()));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn beacon_upsert_and_listing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_beacon("b1", "10.0.0.5:4444", &detail_blob(&[("os", "linux")]))
            .unwrap();

        let listed = store.list_beacons().unwrap();
        assert_eq!(listed.beacon.len(), 1);
        let info = &listed.beacon[0];
        assert_eq!(info.beacon_id, "b1");
        assert_eq!(info.ip_addr, "10.0.0.5:4444");
        assert_eq!(info.detail_info, "os:linux, ");
        // Display-formatted timestamp, not RFC 3339.
        assert!(!info.create_tm.contains('T'));

        // Re-upsert refreshes address and detail.
        store
            .upsert_beacon(
                "b1",
                "10.0.0.9:5555",
                &detail_blob(&[("os", "linux"), ("hostname", "ws01")]),
            )
            .unwrap();
        let listed = store.list_beacons().unwrap();
        assert_eq!(listed.beacon.len(), 1);
        assert_eq!(listed.beacon[0].ip_addr, "10.0.0.9:5555");
        assert_eq!(listed.beacon[0].detail_info, "hostname:ws01, os:linux, ");
    }

    #[test]
    fn soft_delete_hides_and_sticks() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_beacon("b1", "10.0.0.5:4444", &[]).unwrap();
        store.delete_beacon("b1").unwrap();
        assert!(store.list_beacons().unwrap().beacon.is_empty());

        // A later heartbeat does not resurrect the record.
        store.upsert_beacon("b1", "10.0.0.5:4444", &[]).unwrap();
        assert!(store.list_beacons().unwrap().beacon.is_empty());

        // Deleting again is harmless.
        store.delete_beacon("b1").unwrap();
        store.delete_beacon("never-seen").unwrap();
    }

    #[test]
    fn malformed_detail_renders_empty() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_beacon("b1", "10.0.0.5:4444", &[0xFF, 0xFF, 0xFF])
            .unwrap();
        let listed = store.list_beacons().unwrap();
        assert_eq!(listed.beacon[0].detail_info, "");
    }

    #[test]
    fn open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scarab.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.add_task(1, "b1", b"x").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_task("b1").is_ok());
    }
}
