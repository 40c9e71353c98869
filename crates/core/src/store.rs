use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{named_params, Connection};
use tracing::warn;
use ulid::{Generator, Ulid};

use crate::cache::CacheRow;
use crate::config::AppConfig;
use crate::model::{Group, MutationOp, OutboxEntry, Project, Task};

const LAST_SYNC_KEY: &str = "last_sync";

/// One read across all durable tables.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub tasks: Vec<Task>,
    pub projects: Vec<Project>,
    pub groups: Vec<Group>,
    pub last_sync: Option<String>,
}

#[derive(Default)]
struct MemoryTables {
    tasks: BTreeMap<String, Task>,
    projects: BTreeMap<String, Project>,
    groups: BTreeMap<String, Group>,
    outbox: BTreeMap<String, OutboxEntry>,
    meta: BTreeMap<String, String>,
    cache: BTreeMap<String, CacheRow>,
}

enum Backend {
    Sqlite(Connection),
    Memory(MemoryTables),
}

/// Durable record store for tasks, projects, groups, the mutation outbox,
/// the last-sync marker, and the KV cache table.
///
/// When the sqlite backend cannot be opened the store degrades to an
/// in-process map that does not survive reload; callers must treat that mode
/// as a performance cache only. Every method is a single transaction;
/// cross-call sequences (read a batch, remove it after replay) are not
/// atomic as a pair, so replay of an already-applied batch must be tolerated
/// upstream.
pub struct DurableStore {
    backend: Mutex<Backend>,
    durable: bool,
    // Monotonic ulids keep outbox ids ordered even within one millisecond.
    id_gen: Mutex<Generator>,
}

impl DurableStore {
    pub fn open(config: &AppConfig) -> Self {
        Self::open_at(config.db_path())
    }

    pub fn open_at(path: &Path) -> Self {
        match Self::open_sqlite(path) {
            Ok(conn) => Self {
                backend: Mutex::new(Backend::Sqlite(conn)),
                durable: true,
                id_gen: Mutex::new(Generator::new()),
            },
            Err(err) => {
                warn!(
                    "durable store unavailable at {}, falling back to memory: {err:#}",
                    path.display()
                );
                Self::in_memory()
            }
        }
    }

    /// Memory-only store; also the fallback mode when sqlite is unavailable.
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(MemoryTables::default())),
            durable: false,
            id_gen: Mutex::new(Generator::new()),
        }
    }

    fn next_entry_id(&self) -> String {
        let mut generator = self.id_gen.lock();
        generator.generate().unwrap_or_else(|_| Ulid::new()).to_string()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    fn open_sqlite(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to configure WAL mode")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (id TEXT PRIMARY KEY, record TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS projects (id TEXT PRIMARY KEY, record TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS groups (id TEXT PRIMARY KEY, record TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS outbox (
                id TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                enqueued_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_outbox_order ON outbox(enqueued_at, id);
             CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                written_at TEXT NOT NULL,
                version INTEGER NOT NULL
             );",
        )
        .context("Failed to apply store migrations")?;
        Ok(conn)
    }

    pub fn load_snapshot(&self) -> Result<StoreSnapshot> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                let snapshot = StoreSnapshot {
                    tasks: read_records(&tx, "tasks")?,
                    projects: read_records(&tx, "projects")?,
                    groups: read_records(&tx, "groups")?,
                    last_sync: read_meta(&tx, LAST_SYNC_KEY)?,
                };
                tx.commit()?;
                Ok(snapshot)
            }
            Backend::Memory(tables) => Ok(StoreSnapshot {
                tasks: tables.tasks.values().cloned().collect(),
                projects: tables.projects.values().cloned().collect(),
                groups: tables.groups.values().cloned().collect(),
                last_sync: tables.meta.get(LAST_SYNC_KEY).cloned(),
            }),
        }
    }

    /// Keyed replace-or-insert. Callers pass full merged records; this layer
    /// never merges fields.
    pub fn upsert_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for task in tasks {
                    write_record(&tx, "tasks", &task.id, task)?;
                }
                tx.commit()?;
                Ok(())
            }
            Backend::Memory(tables) => {
                for task in tasks {
                    tables.tasks.insert(task.id.clone(), task.clone());
                }
                Ok(())
            }
        }
    }

    pub fn upsert_projects(&self, projects: &[Project]) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for project in projects {
                    write_record(&tx, "projects", &project.id, project)?;
                }
                tx.commit()?;
                Ok(())
            }
            Backend::Memory(tables) => {
                for project in projects {
                    tables.projects.insert(project.id.clone(), project.clone());
                }
                Ok(())
            }
        }
    }

    pub fn upsert_groups(&self, groups: &[Group]) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for group in groups {
                    write_record(&tx, "groups", &group.id, group)?;
                }
                tx.commit()?;
                Ok(())
            }
            Backend::Memory(tables) => {
                for group in groups {
                    tables.groups.insert(group.id.clone(), group.clone());
                }
                Ok(())
            }
        }
    }

    /// Used when a temp-id record is replaced or a failed create is undone.
    pub fn remove_tasks(&self, ids: &[String]) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for id in ids {
                    tx.execute("DELETE FROM tasks WHERE id = :id", named_params![":id": id])?;
                }
                tx.commit()?;
                Ok(())
            }
            Backend::Memory(tables) => {
                for id in ids {
                    tables.tasks.remove(id);
                }
                Ok(())
            }
        }
    }

    /// Persists a mutation and assigns it queue order. Returns the stored
    /// entry including its enqueue timestamp.
    pub fn enqueue_outbox(&self, op: MutationOp, prior: Option<Task>) -> Result<OutboxEntry> {
        let entry = OutboxEntry {
            id: self.next_entry_id(),
            op,
            enqueued_at: Utc::now(),
            prior,
        };
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let record = serde_json::to_string(&entry)?;
                conn.execute(
                    "INSERT INTO outbox (id, record, enqueued_at) VALUES (:id, :record, :enqueued)",
                    named_params![
                        ":id": &entry.id,
                        ":record": record,
                        ":enqueued": entry.enqueued_at.to_rfc3339(),
                    ],
                )?;
            }
            Backend::Memory(tables) => {
                tables.outbox.insert(entry.id.clone(), entry.clone());
            }
        }
        Ok(entry)
    }

    /// Oldest entries first, FIFO by enqueue time.
    pub fn read_outbox_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let mut stmt = conn.prepare(
                    "SELECT record FROM outbox ORDER BY enqueued_at ASC, id ASC LIMIT :limit",
                )?;
                let mut rows = stmt.query(named_params![":limit": limit as i64])?;
                let mut entries = Vec::new();
                while let Some(row) = rows.next()? {
                    let record: String = row.get(0)?;
                    entries.push(serde_json::from_str(&record)?);
                }
                Ok(entries)
            }
            Backend::Memory(tables) => {
                let mut entries: Vec<OutboxEntry> = tables.outbox.values().cloned().collect();
                entries.sort_by(|a, b| {
                    (a.enqueued_at, &a.id).cmp(&(b.enqueued_at, &b.id))
                });
                entries.truncate(limit);
                Ok(entries)
            }
        }
    }

    pub fn remove_outbox_entries(&self, ids: &[String]) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for id in ids {
                    tx.execute(
                        "DELETE FROM outbox WHERE id = :id",
                        named_params![":id": id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            }
            Backend::Memory(tables) => {
                for id in ids {
                    tables.outbox.remove(id);
                }
                Ok(())
            }
        }
    }

    pub fn outbox_len(&self) -> Result<usize> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
                Ok(count as usize)
            }
            Backend::Memory(tables) => Ok(tables.outbox.len()),
        }
    }

    pub fn get_last_sync(&self) -> Result<Option<String>> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => read_meta(conn, LAST_SYNC_KEY),
            Backend::Memory(tables) => Ok(tables.meta.get(LAST_SYNC_KEY).cloned()),
        }
    }

    pub fn set_last_sync(&self, value: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES (:key, :value)
                     ON CONFLICT(key) DO UPDATE SET value = :value",
                    named_params![":key": LAST_SYNC_KEY, ":value": value],
                )?;
                Ok(())
            }
            Backend::Memory(tables) => {
                tables.meta.insert(LAST_SYNC_KEY.into(), value.into());
                Ok(())
            }
        }
    }

    pub fn cache_load_all(&self) -> Result<Vec<(String, CacheRow)>> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let mut stmt =
                    conn.prepare("SELECT key, value, written_at, version FROM cache")?;
                let mut rows = stmt.query([])?;
                let mut entries = Vec::new();
                while let Some(row) = rows.next()? {
                    let key: String = row.get(0)?;
                    let value: String = row.get(1)?;
                    let written_at: String = row.get(2)?;
                    let version: i64 = row.get(3)?;
                    let Ok(value) = serde_json::from_str(&value) else {
                        continue;
                    };
                    let Ok(written_at) = written_at.parse() else {
                        continue;
                    };
                    entries.push((
                        key,
                        CacheRow {
                            value,
                            written_at,
                            version: version as u32,
                        },
                    ));
                }
                Ok(entries)
            }
            Backend::Memory(tables) => Ok(tables
                .cache
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
        }
    }

    pub fn cache_put(&self, key: &str, row: &CacheRow) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                conn.execute(
                    "INSERT INTO cache (key, value, written_at, version)
                     VALUES (:key, :value, :written, :version)
                     ON CONFLICT(key) DO UPDATE SET
                        value = :value, written_at = :written, version = :version",
                    named_params![
                        ":key": key,
                        ":value": serde_json::to_string(&row.value)?,
                        ":written": row.written_at.to_rfc3339(),
                        ":version": row.version as i64,
                    ],
                )?;
                Ok(())
            }
            Backend::Memory(tables) => {
                tables.cache.insert(key.into(), row.clone());
                Ok(())
            }
        }
    }

    pub fn cache_delete(&self, key: &str) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                conn.execute(
                    "DELETE FROM cache WHERE key = :key",
                    named_params![":key": key],
                )?;
                Ok(())
            }
            Backend::Memory(tables) => {
                tables.cache.remove(key);
                Ok(())
            }
        }
    }

    pub fn cache_clear(&self) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                conn.execute("DELETE FROM cache", [])?;
                Ok(())
            }
            Backend::Memory(tables) => {
                tables.cache.clear();
                Ok(())
            }
        }
    }

    /// Drops every table (logout/reset).
    pub fn wipe(&self) -> Result<()> {
        let mut backend = self.backend.lock();
        match &mut *backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for table in ["tasks", "projects", "groups", "outbox", "meta", "cache"] {
                    tx.execute(&format!("DELETE FROM {table}"), [])?;
                }
                tx.commit()?;
                Ok(())
            }
            Backend::Memory(tables) => {
                *tables = MemoryTables::default();
                Ok(())
            }
        }
    }
}

fn read_records<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    table: &str,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(&format!("SELECT record FROM {table} ORDER BY id"))?;
    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let record: String = row.get(0)?;
        records.push(
            serde_json::from_str(&record)
                .with_context(|| format!("Corrupt record in table {table}"))?,
        );
    }
    Ok(records)
}

fn write_record<T: serde::Serialize>(
    conn: &Connection,
    table: &str,
    id: &str,
    record: &T,
) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, record) VALUES (:id, :record)
             ON CONFLICT(id) DO UPDATE SET record = :record"
        ),
        named_params![":id": id, ":record": serde_json::to_string(record)?],
    )?;
    Ok(())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = :key LIMIT 1")?;
    let mut rows = stmt.query(named_params![":key": key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RepeatKind, RepeatRule, TaskStatus};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sqlite_store() -> (DurableStore, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let store = DurableStore::open_at(&dir.path().join("daylist.sqlite3"));
        assert!(store.is_durable());
        (store, dir)
    }

    fn sample_task() -> Task {
        let mut task = Task::new("t1".into(), "Renew passport".into());
        task.notes = Some("bring photos".into());
        task.status = TaskStatus::Open;
        task.deadline = NaiveDate::from_ymd_opt(2026, 9, 15);
        task.repeat = Some(RepeatRule::every(RepeatKind::Monthly, 1));
        task.group_id = Some("g1".into());
        task
    }

    #[test]
    fn snapshot_round_trips_all_tables() {
        let (store, _dir) = sqlite_store();
        let task = sample_task();
        store.upsert_tasks(std::slice::from_ref(&task)).expect("tasks");
        store
            .upsert_projects(&[Project {
                id: "p1".into(),
                title: "Admin".into(),
                group_id: Some("g1".into()),
            }])
            .expect("projects");
        store
            .upsert_groups(&[Group {
                id: "g1".into(),
                title: "Life".into(),
            }])
            .expect("groups");
        store.set_last_sync("2026-08-30T10:00:00Z").expect("marker");

        let snapshot = store.load_snapshot().expect("snapshot");
        assert_eq!(snapshot.tasks, vec![task]);
        assert_eq!(snapshot.projects.len(), 1);
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.last_sync.as_deref(), Some("2026-08-30T10:00:00Z"));
    }

    #[test]
    fn upsert_replaces_whole_record() {
        let (store, _dir) = sqlite_store();
        let mut task = sample_task();
        store.upsert_tasks(std::slice::from_ref(&task)).expect("insert");
        task.title = "Renew passport (urgent)".into();
        task.notes = None;
        store.upsert_tasks(std::slice::from_ref(&task)).expect("replace");

        let snapshot = store.load_snapshot().expect("snapshot");
        assert_eq!(snapshot.tasks, vec![task]);
    }

    #[test]
    fn outbox_preserves_enqueue_order() {
        let (store, _dir) = sqlite_store();
        for i in 0..5 {
            store
                .enqueue_outbox(
                    MutationOp::Rename {
                        id: format!("t{i}"),
                        title: format!("title {i}"),
                    },
                    None,
                )
                .expect("enqueue");
        }

        let batch = store.read_outbox_batch(3).expect("batch");
        assert_eq!(batch.len(), 3);
        let targets: Vec<&str> = batch.iter().map(|e| e.op.target_id()).collect();
        assert_eq!(targets, vec!["t0", "t1", "t2"]);

        let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
        store.remove_outbox_entries(&ids).expect("remove");
        assert_eq!(store.outbox_len().expect("len"), 2);

        let rest = store.read_outbox_batch(10).expect("rest");
        assert_eq!(rest[0].op.target_id(), "t3");
    }

    #[test]
    fn memory_outbox_replays_fifo_within_one_millisecond() {
        let store = DurableStore::in_memory();
        for i in 0..50 {
            store
                .enqueue_outbox(
                    MutationOp::Rename {
                        id: format!("t{i:02}"),
                        title: format!("title {i}"),
                    },
                    None,
                )
                .expect("enqueue");
        }

        let batch = store.read_outbox_batch(50).expect("batch");
        let targets: Vec<String> = batch
            .iter()
            .map(|e| e.op.target_id().to_string())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| format!("t{i:02}")).collect();
        assert_eq!(targets, expected);
    }

    #[test]
    fn outbox_entries_keep_prior_snapshot() {
        let (store, _dir) = sqlite_store();
        let prior = sample_task();
        store
            .enqueue_outbox(
                MutationOp::Trash { id: "t1".into() },
                Some(prior.clone()),
            )
            .expect("enqueue");
        let batch = store.read_outbox_batch(1).expect("batch");
        assert_eq!(batch[0].prior, Some(prior));
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("daylist.sqlite3");
        {
            let store = DurableStore::open_at(&path);
            store.upsert_tasks(&[sample_task()]).expect("insert");
            store
                .enqueue_outbox(MutationOp::Complete { id: "t1".into() }, None)
                .expect("enqueue");
        }
        let store = DurableStore::open_at(&path);
        let snapshot = store.load_snapshot().expect("snapshot");
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(store.outbox_len().expect("len"), 1);
    }

    #[test]
    fn unopenable_path_degrades_to_memory() {
        let dir = TempDir::new().expect("temp dir");
        // A directory is not a valid sqlite file path target.
        let store = DurableStore::open_at(dir.path());
        assert!(!store.is_durable());
        store.upsert_tasks(&[sample_task()]).expect("memory insert");
        assert_eq!(store.load_snapshot().expect("snapshot").tasks.len(), 1);
    }

    #[test]
    fn wipe_clears_every_table() {
        let (store, _dir) = sqlite_store();
        store.upsert_tasks(&[sample_task()]).expect("insert");
        store
            .enqueue_outbox(MutationOp::Complete { id: "t1".into() }, None)
            .expect("enqueue");
        store.set_last_sync("x").expect("marker");
        store.wipe().expect("wipe");

        let snapshot = store.load_snapshot().expect("snapshot");
        assert!(snapshot.tasks.is_empty());
        assert!(snapshot.last_sync.is_none());
        assert_eq!(store.outbox_len().expect("len"), 0);
    }
}
