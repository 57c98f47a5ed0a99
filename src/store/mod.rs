//! Content-addressed dedup store.
//!
//! The only shared mutable state in the pipeline. Files are keyed by the
//! SHA-256 of their raw bytes and stored at most once per workspace; every
//! observation of a file adds a path row. The backing engine is an embedded
//! SQLite database behind one mutex-guarded connection — the narrow API
//! here is the swap point for a server-based engine.

mod schema;
mod single_flight;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::config::RuleSet;
use crate::constants::{MAX_RETRIES, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_SECS};
use crate::models::HostSpec;

pub use single_flight::{FlightGuard, SingleFlight};

/// A previously stored file row, as returned by [`Store::lookup`].
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: i64,
    pub match_rule_id: Option<i64>,
    pub category: Option<String>,
}

/// Parameters for one path observation. Paths are never coalesced: a file
/// observed at N locations yields N rows.
pub struct NewPath<'a> {
    pub workspace_id: i64,
    pub host_id: i64,
    pub file_id: i64,
    pub full_path: &'a str,
    pub archive_chain: &'a str,
    pub match_rule_id: Option<i64>,
    pub access_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
}

/// One finding in review order.
#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub file_id: i64,
    pub priority: i64,
    pub category: String,
    pub full_path: String,
    pub archive_chain: String,
}

/// Aggregates shown to the operator at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkspaceSummary {
    pub hosts: u64,
    pub hosts_completed: u64,
    pub files: u64,
    pub unique_contents: u64,
    pub paths: u64,
    pub matches_low: u64,
    pub matches_medium: u64,
    pub matches_high: u64,
}

pub struct Store {
    conn: Mutex<Connection>,
    flight: SingleFlight,
}

impl Store {
    /// Open (creating if missing) the database file.
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)
            .context(format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Store> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Store> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Store {
            conn: Mutex::new(conn),
            flight: SingleFlight::default(),
        })
    }

    /// Claim a sha256 for insertion; concurrent workers with the same
    /// digest block here and find the row already present afterwards.
    pub fn claim_sha256(&self, sha256: &str) -> FlightGuard<'_> {
        self.flight.acquire(sha256)
    }

    /// Run an operation, retrying transient lock contention with bounded
    /// exponential backoff.
    fn with_retry<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let max_delay = Duration::from_secs(RETRY_MAX_DELAY_SECS);
        let mut attempt = 0;
        loop {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt + 1 < MAX_RETRIES => {
                    drop(conn);
                    attempt += 1;
                    warn!(
                        "database busy, retrying in {:?} (attempt {}/{})",
                        delay, attempt, MAX_RETRIES
                    );
                    thread::sleep(delay);
                    delay = (delay * 2).min(max_delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.with_retry(schema::create_all)
    }

    pub fn drop_schema(&self) -> Result<()> {
        self.with_retry(schema::drop_all)
    }

    /// Create a workspace, returning its id. Idempotent by name.
    pub fn add_workspace(&self, name: &str) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO workspace (name) VALUES (?1)",
                params![name],
            )?;
            conn.query_row(
                "SELECT id FROM workspace WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
        })
    }

    pub fn workspace_id(&self, name: &str) -> Result<Option<i64>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT id FROM workspace WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn list_workspaces(&self) -> Result<Vec<String>> {
        self.with_retry(|conn| {
            let mut statement = conn.prepare("SELECT name FROM workspace ORDER BY name")?;
            let rows = statement.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Register a host within a workspace, returning its id. Idempotent by
    /// the (protocol, address, port, share) identity.
    pub fn add_host(&self, workspace_id: i64, host: &HostSpec) -> Result<i64> {
        let protocol = host.protocol.as_str();
        let port = host.port.map(i64::from).unwrap_or(0);
        let share = host.share.clone().unwrap_or_default();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO host (workspace_id, protocol, address, port, share)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![workspace_id, protocol, host.address, port, share],
            )?;
            conn.query_row(
                "SELECT id FROM host
                 WHERE workspace_id = ?1 AND protocol = ?2 AND address = ?3
                   AND port = ?4 AND share = ?5",
                params![workspace_id, protocol, host.address, port, share],
                |row| row.get(0),
            )
        })
    }

    pub fn host_completed(&self, host_id: i64) -> Result<bool> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT completed FROM host WHERE id = ?1",
                params![host_id],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
        })
    }

    /// Written exactly once per host, when its driver exits cleanly.
    pub fn mark_host_complete(&self, host_id: i64) -> Result<()> {
        self.with_retry(|conn| {
            conn.execute(
                "UPDATE host SET completed = 1 WHERE id = ?1",
                params![host_id],
            )
            .map(|_| ())
        })
    }

    /// Persist the rules used for this run and return the mapping from
    /// descriptor index to `match_rule` row id.
    pub fn snapshot_rules(&self, rules: &RuleSet) -> Result<HashMap<usize, i64>> {
        let mut ids = HashMap::with_capacity(rules.len());
        for rule in rules.all() {
            let id = self.with_retry(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO match_rule
                       (search_location, search_pattern, category, relevance, accuracy, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        rule.search_location.as_str(),
                        rule.search_pattern,
                        rule.category,
                        rule.relevance.as_str(),
                        rule.accuracy.as_str(),
                        rule.priority,
                    ],
                )?;
                conn.query_row(
                    "SELECT id FROM match_rule WHERE search_location = ?1 AND search_pattern = ?2",
                    params![rule.search_location.as_str(), rule.search_pattern],
                    |row| row.get(0),
                )
            })?;
            ids.insert(rule.index, id);
        }
        Ok(ids)
    }

    /// Look up an existing content row by digest.
    pub fn lookup(&self, workspace_id: i64, sha256: &str) -> Result<Option<StoredFile>> {
        self.with_retry(|conn| {
            conn.query_row(
                "SELECT id, match_rule_id, category FROM file
                 WHERE workspace_id = ?1 AND sha256 = ?2",
                params![workspace_id, sha256],
                |row| {
                    Ok(StoredFile {
                        id: row.get(0)?,
                        match_rule_id: row.get(1)?,
                        category: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Insert a content row if absent; idempotent by sha256 within the
    /// workspace. When another writer commits the same digest first, its
    /// match rule and category stand and this call converges on a lookup.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_file(
        &self,
        workspace_id: i64,
        sha256: &str,
        content: Option<&[u8]>,
        size_bytes: u64,
        type_hint: Option<&str>,
        category: &str,
        match_rule_id: Option<i64>,
    ) -> Result<i64> {
        let inserted = self.with_retry(|conn| {
            let result = conn.execute(
                "INSERT INTO file
                   (workspace_id, sha256, size_bytes, content, type_hint, category, match_rule_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    workspace_id,
                    sha256,
                    size_bytes as i64,
                    content,
                    type_hint,
                    category,
                    match_rule_id,
                ],
            );
            match result {
                Ok(_) => Ok(Some(conn.last_insert_rowid())),
                Err(err) if is_unique_violation(&err) => Ok(None),
                Err(err) => Err(err),
            }
        })?;
        match inserted {
            Some(id) => Ok(id),
            None => {
                debug!("sha256 {} raced another writer, converging on lookup", sha256);
                let existing = self
                    .lookup(workspace_id, sha256)?
                    .context("file row vanished after unique collision")?;
                Ok(existing.id)
            }
        }
    }

    /// A file that was size-gated out: no digest, no bytes, one row per
    /// observation.
    pub fn add_gated_file(
        &self,
        workspace_id: i64,
        size_bytes: u64,
        category: &str,
        match_rule_id: Option<i64>,
    ) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO file (workspace_id, size_bytes, category, match_rule_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![workspace_id, size_bytes as i64, category, match_rule_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Record one observation of a file. Never coalesced.
    pub fn add_path(&self, path: &NewPath<'_>) -> Result<i64> {
        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO path
                   (workspace_id, host_id, file_id, full_path, archive_chain, match_rule_id,
                    access_time, modified_time, creation_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    path.workspace_id,
                    path.host_id,
                    path.file_id,
                    path.full_path,
                    path.archive_chain,
                    path.match_rule_id,
                    path.access_time.map(|t| t.to_rfc3339()),
                    path.modified_time.map(|t| t.to_rfc3339()),
                    path.creation_time.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Findings in the deterministic order the review console presents
    /// them: highest rule priority first, then category, then path.
    /// Computed at query time; collection order is irrelevant.
    pub fn review_queue(&self, workspace_id: i64) -> Result<Vec<ReviewItem>> {
        self.with_retry(|conn| {
            let mut statement = conn.prepare(
                "SELECT f.id, m.priority, f.category, p.full_path, p.archive_chain
                 FROM file f
                 JOIN match_rule m ON m.id = f.match_rule_id
                 JOIN path p ON p.file_id = f.id
                 WHERE f.workspace_id = ?1
                 ORDER BY m.priority DESC, f.category ASC, p.full_path ASC, p.archive_chain ASC",
            )?;
            let rows = statement.query_map(params![workspace_id], |row| {
                Ok(ReviewItem {
                    file_id: row.get(0)?,
                    priority: row.get(1)?,
                    category: row.get(2)?,
                    full_path: row.get(3)?,
                    archive_chain: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn summary(&self, workspace_id: i64) -> Result<WorkspaceSummary> {
        self.with_retry(|conn| {
            let mut summary = WorkspaceSummary::default();
            summary.hosts = conn.query_row(
                "SELECT COUNT(*) FROM host WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get::<_, i64>(0),
            )? as u64;
            summary.hosts_completed = conn.query_row(
                "SELECT COUNT(*) FROM host WHERE workspace_id = ?1 AND completed = 1",
                params![workspace_id],
                |row| row.get::<_, i64>(0),
            )? as u64;
            summary.files = conn.query_row(
                "SELECT COUNT(*) FROM file WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get::<_, i64>(0),
            )? as u64;
            summary.unique_contents = conn.query_row(
                "SELECT COUNT(*) FROM file WHERE workspace_id = ?1 AND sha256 IS NOT NULL",
                params![workspace_id],
                |row| row.get::<_, i64>(0),
            )? as u64;
            summary.paths = conn.query_row(
                "SELECT COUNT(*) FROM path WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get::<_, i64>(0),
            )? as u64;
            let mut statement = conn.prepare(
                "SELECT m.relevance, COUNT(*) FROM file f
                 JOIN match_rule m ON m.id = f.match_rule_id
                 WHERE f.workspace_id = ?1
                 GROUP BY m.relevance",
            )?;
            let rows = statement.query_map(params![workspace_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for row in rows {
                let (relevance, count) = row?;
                match relevance.as_str() {
                    "low" => summary.matches_low = count,
                    "medium" => summary.matches_medium = count,
                    "high" => summary.matches_high = count,
                    _ => {}
                }
            }
            Ok(summary)
        })
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::DatabaseBusy || inner.code == ErrorCode::DatabaseLocked
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;

    fn test_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    fn host() -> HostSpec {
        HostSpec {
            protocol: Protocol::Local,
            address: "127.0.0.1".to_string(),
            port: None,
            share: None,
        }
    }

    #[test]
    fn workspace_creation_is_idempotent() {
        let store = test_store();
        let first = store.add_workspace("engagement").unwrap();
        let second = store.add_workspace("engagement").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_workspaces().unwrap(), vec!["engagement"]);
    }

    #[test]
    fn upsert_file_is_idempotent_by_sha256() {
        let store = test_store();
        let ws = store.add_workspace("ws").unwrap();
        let first = store
            .upsert_file(ws, "abc", Some(b"data"), 4, None, "Password", None)
            .unwrap();
        // Second writer with a different (lower-priority) rule: the first
        // committed row stands untouched.
        let second = store
            .upsert_file(ws, "abc", Some(b"data"), 4, None, "Backup File", None)
            .unwrap();
        assert_eq!(first, second);
        let stored = store.lookup(ws, "abc").unwrap().unwrap();
        assert_eq!(stored.category.as_deref(), Some("Password"));
    }

    #[test]
    fn same_sha_in_two_workspaces_is_two_rows() {
        let store = test_store();
        let ws1 = store.add_workspace("one").unwrap();
        let ws2 = store.add_workspace("two").unwrap();
        let a = store
            .upsert_file(ws1, "abc", Some(b"data"), 4, None, "x", None)
            .unwrap();
        let b = store
            .upsert_file(ws2, "abc", Some(b"data"), 4, None, "x", None)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn gated_files_may_repeat() {
        let store = test_store();
        let ws = store.add_workspace("ws").unwrap();
        let a = store.add_gated_file(ws, 10 << 20, "Backup File", None).unwrap();
        let b = store.add_gated_file(ws, 10 << 20, "Backup File", None).unwrap();
        assert_ne!(a, b);
        let summary = store.summary(ws).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.unique_contents, 0);
    }

    #[test]
    fn paths_are_never_coalesced() {
        let store = test_store();
        let ws = store.add_workspace("ws").unwrap();
        let host_id = store.add_host(ws, &host()).unwrap();
        let file_id = store
            .upsert_file(ws, "abc", Some(b"data"), 4, None, "x", None)
            .unwrap();
        for _ in 0..2 {
            store
                .add_path(&NewPath {
                    workspace_id: ws,
                    host_id,
                    file_id,
                    full_path: "/srv/a.txt",
                    archive_chain: "",
                    match_rule_id: None,
                    access_time: None,
                    modified_time: None,
                    creation_time: None,
                })
                .unwrap();
        }
        assert_eq!(store.summary(ws).unwrap().paths, 2);
    }

    #[test]
    fn host_completion_round_trip() {
        let store = test_store();
        let ws = store.add_workspace("ws").unwrap();
        let host_id = store.add_host(ws, &host()).unwrap();
        assert!(!store.host_completed(host_id).unwrap());
        store.mark_host_complete(host_id).unwrap();
        assert!(store.host_completed(host_id).unwrap());
        // Re-registering the same endpoint resolves to the same row.
        assert_eq!(store.add_host(ws, &host()).unwrap(), host_id);
    }

    #[test]
    fn review_queue_orders_by_priority_then_category_then_path() {
        let store = test_store();
        let ws = store.add_workspace("ws").unwrap();
        let host_id = store.add_host(ws, &host()).unwrap();
        let rules = crate::config::HuntConfig::default().compile_rules().unwrap();
        let ids = store.snapshot_rules(&rules).unwrap();
        // Two findings via rules of different priority
        let high = rules.all()[0].clone();
        let low = rules.all().last().unwrap().clone();
        for (sha, rule) in [("aaa", &low), ("bbb", &high)] {
            let file_id = store
                .upsert_file(
                    ws,
                    sha,
                    Some(b"x"),
                    1,
                    None,
                    &rule.category,
                    ids.get(&rule.index).copied(),
                )
                .unwrap();
            store
                .add_path(&NewPath {
                    workspace_id: ws,
                    host_id,
                    file_id,
                    full_path: "/srv/file",
                    archive_chain: "",
                    match_rule_id: ids.get(&rule.index).copied(),
                    access_time: None,
                    modified_time: None,
                    creation_time: None,
                })
                .unwrap();
        }
        let queue = store.review_queue(ws).unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue[0].priority > queue[1].priority);
        assert_eq!(queue[0].category, high.category);
    }

    #[test]
    fn rule_snapshot_maps_descriptor_indices() {
        use crate::config::HuntConfig;
        let store = test_store();
        let rules = HuntConfig::default().compile_rules().unwrap();
        let ids = store.snapshot_rules(&rules).unwrap();
        assert_eq!(ids.len(), rules.len());
        // Snapshotting twice must not duplicate rows.
        let again = store.snapshot_rules(&rules).unwrap();
        assert_eq!(ids, again);
    }
}
