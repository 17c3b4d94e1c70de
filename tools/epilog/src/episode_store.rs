use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::diff::{diff_episodes, EpisodeDiff};
use crate::episode::{Episode, EpisodeStatus, EpisodeSummary, NewEpisode, Step};
use crate::errors::EpilogError;
use crate::logging::append_run_log;
use crate::replay::{build_replay, EpisodeReplay};

const READ_POOL_SIZE: usize = 4;

type StoreResult<T> = Result<T, EpilogError>;

/// Optional, conjunctive list filters. Model/provider/tool match exactly
/// against the per-step facet index, never by substring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    pub agent_id: Option<String>,
    pub status: Option<EpisodeStatus>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tool: Option<String>,
}

/// Filters accepted by the bulk exporter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportFilter {
    pub agent_id: Option<String>,
    pub status: Option<EpisodeStatus>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
}

#[derive(Debug)]
enum WriteCmd {
    Insert {
        episode: Episode,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

/// Durable, queryable episode storage.
///
/// One writer thread owns the write connection; all mutations are funneled
/// through a bounded command channel and committed before the caller's call
/// returns. Reads go through a small pool of read-only connections, so a
/// reader is never blocked behind an in-flight write (WAL journal mode).
pub struct EpisodeStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl Drop for EpisodeStore {
    fn drop(&mut self) {
        // Close the sender first so the writer loop exits.
        drop(self.write_tx.take());
        // Then join the writer thread to flush any in-flight writes.
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl EpisodeStore {
    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| EpilogError::Database("store is closed".to_string()))
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "episode_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EpilogError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();

        // Reject zero-byte files — they indicate prior corruption.
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| EpilogError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(EpilogError::Database(format!(
                    "episode database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        // Run quick_check on existing databases to catch corruption early.
        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(EpilogError::Database(format!(
                    "episode database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Insert { episode, reply } => {
                        let result = insert_episode(&mut write_conn, &episode);
                        let _ = reply.send(result);
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        append_run_log(
            "info",
            "episode_store.opened",
            json!({ "path": path.display().to_string() }),
        );

        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Persists a new episode from an ingest payload.
    ///
    /// Assigns the episode id and timestamps, stamps any step that arrived
    /// without a timestamp, computes aggregates, and commits the row plus
    /// its facet index in one transaction before returning.
    pub fn create(&self, payload: NewEpisode) -> StoreResult<Episode> {
        payload.validate()?;

        let now = system_time_unix();
        let mut steps = payload.steps;
        for step in &mut steps {
            if step.timestamp_ms.is_none() {
                step.timestamp_ms = Some(now);
            }
        }

        let mut episode = Episode {
            episode_id: Uuid::new_v4().to_string(),
            agent_id: payload.agent_id,
            status: payload.status,
            steps,
            tools_used: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            step_count: 0,
            started_at_ms: now,
            ended_at_ms: (payload.status != EpisodeStatus::Running).then_some(now),
            metadata: payload.metadata,
        };
        episode.compute_aggregates();

        append_run_log(
            "debug",
            "episode.create",
            json!({
                "episode_id": episode.episode_id,
                "agent_id": episode.agent_id,
                "status": episode.status.as_str(),
                "step_count": episode.step_count,
            }),
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(WriteCmd::Insert {
                episode: episode.clone(),
                reply: reply_tx,
            })
            .map_err(|e| EpilogError::Database(e.to_string()))?;
        let result = reply_rx
            .blocking_recv()
            .map_err(|e| EpilogError::Database(e.to_string()))?;

        match result {
            Ok(()) => {
                append_run_log(
                    "info",
                    "episode.created",
                    json!({
                        "episode_id": episode.episode_id,
                        "agent_id": episode.agent_id,
                        "total_tokens": episode.total_tokens,
                        "tools_used": episode.tools_used,
                    }),
                );
                Ok(episode)
            }
            Err(e) => {
                append_run_log(
                    "error",
                    "episode.create.failed",
                    json!({
                        "episode_id": episode.episode_id,
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    /// Exact lookup by id, including the full step sequence.
    pub fn get(&self, episode_id: &str) -> StoreResult<Option<Episode>> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE episode_id = ?1"),
                [episode_id],
                row_to_episode,
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// Summaries only — listing never deserializes step payloads.
    pub fn list(
        &self,
        filter: &ListFilter,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<EpisodeSummary>> {
        let (where_sql, mut params) = list_where_clause(filter);
        params.push(SqlValue::from(i64::from(limit)));
        params.push(SqlValue::from(i64::from(offset)));

        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {SUMMARY_COLUMNS} FROM episodes WHERE 1=1{where_sql} \
                     ORDER BY started_at_ms DESC, rowid DESC LIMIT ? OFFSET ?"
                ))
                .map_err(db_err)?;
            let rows = statement
                .query_map(params_from_iter(params.iter()), row_to_summary)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    /// Cardinality of episodes matching the optional agent/status filters.
    pub fn count(
        &self,
        agent_id: Option<&str>,
        status: Option<EpisodeStatus>,
    ) -> StoreResult<u64> {
        let mut where_sql = String::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(agent_id) = agent_id {
            where_sql.push_str(" AND agent_id = ?");
            params.push(SqlValue::from(agent_id.to_string()));
        }
        if let Some(status) = status {
            where_sql.push_str(" AND status = ?");
            params.push(SqlValue::from(status.as_str().to_string()));
        }

        self.read_pool.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM episodes WHERE 1=1{where_sql}"),
                params_from_iter(params.iter()),
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err)
            .map(|count| count as u64)
        })
    }

    /// Streams every matching episode, full steps included, in list order,
    /// visiting one record at a time. Returns how many were visited.
    pub fn export<F>(&self, filter: &ExportFilter, mut visit: F) -> StoreResult<u64>
    where
        F: FnMut(Episode) -> StoreResult<()>,
    {
        let (where_sql, params) = export_where_clause(filter);

        let exported = self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {EPISODE_COLUMNS} FROM episodes WHERE 1=1{where_sql} \
                     ORDER BY started_at_ms DESC, rowid DESC"
                ))
                .map_err(db_err)?;
            let mut rows = statement
                .query(params_from_iter(params.iter()))
                .map_err(db_err)?;

            let mut exported = 0u64;
            while let Some(row) = rows.next().map_err(db_err)? {
                let episode = row_to_episode(row).map_err(db_err)?;
                visit(episode)?;
                exported += 1;
            }
            Ok(exported)
        })?;

        append_run_log(
            "info",
            "episode.export.completed",
            json!({ "exported": exported }),
        );
        Ok(exported)
    }

    /// Replay-ready view of a stored episode. `None` when it is absent.
    pub fn get_replay(&self, episode_id: &str) -> StoreResult<Option<EpisodeReplay>> {
        Ok(self.get(episode_id)?.map(|episode| build_replay(&episode)))
    }

    /// Positional step diff of two stored episodes. `None` when either side
    /// is absent; which side failed is deliberately not distinguished.
    pub fn diff(&self, left_id: &str, right_id: &str) -> StoreResult<Option<EpisodeDiff>> {
        let left = self.get(left_id)?;
        let right = self.get(right_id)?;
        match (left, right) {
            (Some(left), Some(right)) => Ok(Some(diff_episodes(&left, &right))),
            _ => Ok(None),
        }
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| EpilogError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

const EPISODE_COLUMNS: &str = "episode_id, agent_id, status, steps, tools_used, total_tokens, \
     total_cost_usd, total_duration_ms, step_count, started_at_ms, ended_at_ms, metadata";

const SUMMARY_COLUMNS: &str = "episode_id, agent_id, status, tools_used, total_tokens, \
     total_cost_usd, total_duration_ms, step_count, started_at_ms, ended_at_ms";

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_episodes.sql"))];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();

        if exists {
            continue;
        }

        append_run_log(
            "info",
            "episode_store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "episode_store.migration.applied",
            json!({ "version": version }),
        );
    }

    Ok(())
}

/// Episode row plus its facet index rows, committed as one unit. A failed
/// create leaves no partial record.
fn insert_episode(conn: &mut Connection, episode: &Episode) -> StoreResult<()> {
    let steps_json =
        serde_json::to_string(&episode.steps).map_err(|e| EpilogError::Database(e.to_string()))?;
    let tools_json = serde_json::to_string(&episode.tools_used)
        .map_err(|e| EpilogError::Database(e.to_string()))?;
    let metadata_json = serde_json::to_string(&episode.metadata)
        .map_err(|e| EpilogError::Database(e.to_string()))?;

    let tx = conn.transaction().map_err(db_err)?;
    tx.execute(
        "INSERT INTO episodes (
            episode_id, agent_id, status, steps, tools_used,
            total_tokens, total_cost_usd, total_duration_ms, step_count,
            started_at_ms, ended_at_ms, metadata
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            episode.episode_id,
            episode.agent_id,
            episode.status.as_str(),
            steps_json,
            tools_json,
            episode.total_tokens as i64,
            episode.total_cost_usd,
            episode.total_duration_ms as i64,
            episode.step_count as i64,
            episode.started_at_ms,
            episode.ended_at_ms,
            metadata_json,
        ],
    )
    .map_err(db_err)?;

    for (facet, value) in step_facets(&episode.steps) {
        tx.execute(
            "INSERT INTO step_facets (episode_id, facet, value) VALUES (?1, ?2, ?3)",
            params![episode.episode_id, facet, value],
        )
        .map_err(db_err)?;
    }

    tx.commit().map_err(db_err)
}

fn step_facets(steps: &[Step]) -> BTreeSet<(&'static str, String)> {
    let mut facets = BTreeSet::new();
    for step in steps {
        if let Some(model) = step.model.as_deref().filter(|v| !v.is_empty()) {
            facets.insert(("model", model.to_string()));
        }
        if let Some(provider) = step.provider.as_deref().filter(|v| !v.is_empty()) {
            facets.insert(("provider", provider.to_string()));
        }
        if let Some(tool) = step.tool_name.as_deref().filter(|v| !v.is_empty()) {
            facets.insert(("tool", tool.to_string()));
        }
    }
    facets
}

fn facet_exists_clause(facet: &str) -> String {
    format!(
        " AND EXISTS (SELECT 1 FROM step_facets f \
         WHERE f.episode_id = episodes.episode_id AND f.facet = '{facet}' AND f.value = ?)"
    )
}

fn list_where_clause(filter: &ListFilter) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(agent_id) = &filter.agent_id {
        sql.push_str(" AND agent_id = ?");
        params.push(SqlValue::from(agent_id.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        params.push(SqlValue::from(status.as_str().to_string()));
    }
    if let Some(since_ms) = filter.since_ms {
        sql.push_str(" AND started_at_ms >= ?");
        params.push(SqlValue::from(since_ms));
    }
    if let Some(until_ms) = filter.until_ms {
        sql.push_str(" AND started_at_ms <= ?");
        params.push(SqlValue::from(until_ms));
    }
    if let Some(model) = &filter.model {
        sql.push_str(&facet_exists_clause("model"));
        params.push(SqlValue::from(model.clone()));
    }
    if let Some(provider) = &filter.provider {
        sql.push_str(&facet_exists_clause("provider"));
        params.push(SqlValue::from(provider.clone()));
    }
    if let Some(tool) = &filter.tool {
        sql.push_str(&facet_exists_clause("tool"));
        params.push(SqlValue::from(tool.clone()));
    }

    (sql, params)
}

fn export_where_clause(filter: &ExportFilter) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(agent_id) = &filter.agent_id {
        sql.push_str(" AND agent_id = ?");
        params.push(SqlValue::from(agent_id.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        params.push(SqlValue::from(status.as_str().to_string()));
    }
    if let Some(since_ms) = filter.since_ms {
        sql.push_str(" AND started_at_ms >= ?");
        params.push(SqlValue::from(since_ms));
    }
    if let Some(until_ms) = filter.until_ms {
        sql.push_str(" AND started_at_ms <= ?");
        params.push(SqlValue::from(until_ms));
    }

    (sql, params)
}

fn invalid_column<E>(index: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
}

fn invalid_status(index: usize) -> rusqlite::Error {
    invalid_column(
        index,
        std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid status"),
    )
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let status = row.get::<_, String>(2)?;
    let steps_json = row.get::<_, String>(3)?;
    let tools_json = row.get::<_, String>(4)?;
    let metadata_json = row.get::<_, String>(11)?;

    Ok(Episode {
        episode_id: row.get(0)?,
        agent_id: row.get(1)?,
        status: EpisodeStatus::from_db(&status).ok_or_else(|| invalid_status(2))?,
        steps: serde_json::from_str(&steps_json).map_err(|e| invalid_column(3, e))?,
        tools_used: serde_json::from_str(&tools_json).map_err(|e| invalid_column(4, e))?,
        total_tokens: row.get::<_, i64>(5)? as u64,
        total_cost_usd: row.get(6)?,
        total_duration_ms: row.get::<_, i64>(7)? as u64,
        step_count: row.get::<_, i64>(8)? as u64,
        started_at_ms: row.get(9)?,
        ended_at_ms: row.get(10)?,
        metadata: serde_json::from_str(&metadata_json).map_err(|e| invalid_column(11, e))?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodeSummary> {
    let status = row.get::<_, String>(2)?;
    let tools_json = row.get::<_, String>(3)?;

    Ok(EpisodeSummary {
        episode_id: row.get(0)?,
        agent_id: row.get(1)?,
        status: EpisodeStatus::from_db(&status).ok_or_else(|| invalid_status(2))?,
        tools_used: serde_json::from_str(&tools_json).map_err(|e| invalid_column(3, e))?,
        total_tokens: row.get::<_, i64>(4)? as u64,
        total_cost_usd: row.get(5)?,
        total_duration_ms: row.get::<_, i64>(6)? as u64,
        step_count: row.get::<_, i64>(7)? as u64,
        started_at_ms: row.get(8)?,
        ended_at_ms: row.get(9)?,
    })
}

fn db_err(error: rusqlite::Error) -> EpilogError {
    EpilogError::Database(error.to_string())
}

pub fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
