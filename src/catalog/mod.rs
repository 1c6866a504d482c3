// Catalog - authoritative metadata store for versions, blocks, labels,
// storages, tombstones and advisory locks

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::CatalogError;
use crate::filter;
use crate::types::{self, VersionStatus, VersionUid};
use crate::validation;
use crate::{Config, Result};

pub mod schema;

mod blocks;
mod export;
mod gc;
mod locking;

pub use blocks::{Block, BlockIter, NewBlock, DEFAULT_BLOCK_YIELD_PER};
pub use gc::{DeleteCandidates, DEFAULT_GC_GRACE_SECONDS};

/// How long block writes may ride in an open transaction before `set_block`
/// and `create_blocks` force a commit.
pub const BLOCKS_COMMIT_INTERVAL: Duration = Duration::from_secs(20);

const VERSION_SELECT: &str = "SELECT v.id, v.uid, v.date, v.volume, v.snapshot, v.size, \
     v.block_size, v.storage_id, s.name, v.status, v.protected, v.bytes_read, \
     v.bytes_written, v.bytes_deduplicated, v.bytes_sparse, v.duration \
     FROM versions v JOIN storages s ON s.id = v.storage_id";

/// A snapshot record. The storage name is fetched as part of every read so
/// the value stays usable after the catalog is gone.
#[derive(Debug, Clone)]
pub struct Version {
    pub id: i64,
    pub uid: VersionUid,
    pub date: NaiveDateTime,
    pub volume: String,
    pub snapshot: String,
    pub size: u64,
    pub block_size: u32,
    pub storage_id: i64,
    pub storage_name: String,
    pub status: VersionStatus,
    pub protected: bool,
    pub bytes_read: Option<u64>,
    pub bytes_written: Option<u64>,
    pub bytes_deduplicated: Option<u64>,
    pub bytes_sparse: Option<u64>,
    pub duration: Option<u64>,
}

impl Version {
    /// Number of block slots in this version, sparse slots included.
    pub fn blocks_count(&self) -> u64 {
        self.size.div_ceil(u64::from(self.block_size))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.uid.cmp(&other.uid)
    }
}

/// Post-backup statistics, set in one atomic update.
#[derive(Debug, Clone, Copy)]
pub struct VersionStatistics {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse: u64,
    pub duration: u64,
}

/// A named target backend where block payloads live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub id: i64,
    pub name: String,
}

/// Attribute filters for [`Catalog::get_versions`], AND-combined.
#[derive(Debug, Clone, Default)]
pub struct VersionFilter<'a> {
    pub uid: Option<&'a VersionUid>,
    pub volume: Option<&'a str>,
    pub snapshot: Option<&'a str>,
    pub labels: &'a [(&'a str, &'a str)],
}

/// The metadata catalog session. One instance owns one connection and
/// performs all operations sequentially; cross-process exclusion happens
/// through the lock table, not through this struct.
pub struct Catalog {
    conn: Connection,
    last_blocks_commit: Instant,
    host: String,
    process_id: String,
}

impl Catalog {
    /// Connect without verifying the schema revision. Used by `init` and
    /// `migrate`, which operate on not-yet-current databases.
    pub fn connect(config: &Config) -> Result<Catalog> {
        let conn = match database_path(&config.database_engine)? {
            Some(path) => Connection::open(path)?,
            None => {
                info!("Running with ephemeral in-memory database.");
                Connection::open_in_memory()?
            }
        };
        Self::from_connection(conn)
    }

    /// Connect and verify that the schema is initialized and at the head
    /// revision.
    pub fn open(config: &Config) -> Result<Catalog> {
        let catalog = Self::connect(config)?;
        schema::check(&catalog.conn)?;
        Ok(catalog)
    }

    /// Ephemeral catalog with no backing file. The schema still needs `init`.
    pub fn open_in_memory() -> Result<Catalog> {
        info!("Running with ephemeral in-memory database.");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Catalog> {
        // Absorb transient cross-process contention instead of surfacing
        // "database is locked" immediately.
        conn.busy_timeout(BLOCKS_COMMIT_INTERVAL * 3)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Catalog {
            conn,
            last_blocks_commit: Instant::now(),
            host: sys_info::hostname().unwrap_or_else(|_| "unknown".to_string()),
            process_id: Uuid::new_v4().simple().to_string(),
        })
    }

    pub fn init(&mut self) -> Result<()> {
        schema::init(&mut self.conn)
    }

    pub fn migrate(&mut self) -> Result<()> {
        schema::migrate(&mut self.conn)
    }

    /// Commit the session transaction, if one is open.
    pub fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Commit outstanding work and release every lock this instance holds.
    pub fn close(mut self) -> Result<()> {
        self.commit()?;
        self.unlock_all();
        Ok(())
    }

    fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    fn rollback_quietly(&self) {
        if !self.conn.is_autocommit() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }

    /// Run a mutating operation; on failure the session transaction is
    /// rolled back and the error re-surfaced.
    fn with_rollback<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin()?;
        match f(self) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.rollback_quietly();
                Err(error)
            }
        }
    }

    pub(crate) fn conditional_blocks_commit(&mut self, caller: &str) -> Result<()> {
        if self.last_blocks_commit.elapsed() >= BLOCKS_COMMIT_INTERVAL {
            let started = Instant::now();
            self.commit()?;
            debug!(
                "Committed database transaction in {} in {:.2}s",
                caller,
                started.elapsed().as_secs_f64()
            );
            self.last_blocks_commit = Instant::now();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_version(
        &mut self,
        uid: &VersionUid,
        volume: &str,
        snapshot: &str,
        size: u64,
        block_size: u32,
        storage_id: i64,
        status: VersionStatus,
        protected: bool,
    ) -> Result<Version> {
        if !validation::is_volume_name(volume) {
            return Err(CatalogError::InputData(format!(
                "Volume name {} is invalid.",
                volume
            )));
        }
        if !validation::is_snapshot_name(snapshot) {
            return Err(CatalogError::InputData(format!(
                "Snapshot name {} is invalid.",
                snapshot
            )));
        }
        self.with_rollback(|catalog| {
            catalog
                .conn
                .prepare_cached(
                    "INSERT INTO versions (uid, date, volume, snapshot, size, block_size, \
                     storage_id, status, protected) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        uid,
                        types::utc_now(),
                        volume,
                        snapshot,
                        size,
                        block_size,
                        storage_id,
                        status,
                        protected
                    ])
                })
                .map_err(|e| {
                    if unique_violation(&e) {
                        CatalogError::AlreadyExists(format!("Version {} already exists.", uid))
                    } else {
                        e.into()
                    }
                })?;
            catalog.commit()?;
            catalog.get_version(uid)
        })
    }

    pub fn set_version_stats(
        &mut self,
        uid: &VersionUid,
        statistics: &VersionStatistics,
    ) -> Result<()> {
        self.with_rollback(|catalog| {
            let changed = catalog
                .conn
                .prepare_cached(
                    "UPDATE versions SET bytes_read = ?, bytes_written = ?, \
                     bytes_deduplicated = ?, bytes_sparse = ?, duration = ? WHERE uid = ?",
                )?
                .execute(params![
                    statistics.bytes_read,
                    statistics.bytes_written,
                    statistics.bytes_deduplicated,
                    statistics.bytes_sparse,
                    statistics.duration,
                    uid
                ])?;
            if changed == 0 {
                return Err(CatalogError::NotFound(format!(
                    "Version {} not found.",
                    uid
                )));
            }
            catalog.commit()
        })
    }

    /// Partial update of status and protection. Callers drive the lifecycle;
    /// only the schema's range check constrains the transition.
    pub fn set_version(
        &mut self,
        uid: &VersionUid,
        status: Option<VersionStatus>,
        protected: Option<bool>,
    ) -> Result<()> {
        self.with_rollback(|catalog| {
            catalog.get_version(uid)?;
            if let Some(status) = status {
                catalog
                    .conn
                    .prepare_cached("UPDATE versions SET status = ? WHERE uid = ?")?
                    .execute(params![status, uid])?;
            }
            if let Some(protected) = protected {
                catalog
                    .conn
                    .prepare_cached("UPDATE versions SET protected = ? WHERE uid = ?")?
                    .execute(params![protected, uid])?;
            }
            catalog.commit()?;
            if let Some(status) = status {
                if status == VersionStatus::Invalid {
                    error!("Set status of version {} to {}.", uid, status);
                } else {
                    info!("Set status of version {} to {}.", uid, status);
                }
            }
            if let Some(protected) = protected {
                info!(
                    "Marked version {} as {}.",
                    uid,
                    if protected { "protected" } else { "unprotected" }
                );
            }
            Ok(())
        })
    }

    pub fn get_version(&self, uid: &VersionUid) -> Result<Version> {
        let sql = format!("{VERSION_SELECT} WHERE v.uid = ?");
        let version = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![uid], version_from_row)
            .optional()?;
        version.ok_or_else(|| CatalogError::NotFound(format!("Version {} not found.", uid)))
    }

    /// Enumerate versions matching the given attribute filters, ordered by
    /// volume and creation date.
    pub fn get_versions(&self, version_filter: &VersionFilter<'_>) -> Result<Vec<Version>> {
        let mut sql = String::from(VERSION_SELECT);
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(uid) = version_filter.uid {
            clauses.push("v.uid = ?");
            values.push(uid.as_str().to_string().into());
        }
        if let Some(volume) = version_filter.volume {
            clauses.push("v.volume = ?");
            values.push(volume.to_string().into());
        }
        if let Some(snapshot) = version_filter.snapshot {
            clauses.push("v.snapshot = ?");
            values.push(snapshot.to_string().into());
        }
        for (name, value) in version_filter.labels {
            clauses.push("v.id IN (SELECT version_id FROM labels WHERE name = ? AND value = ?)");
            values.push(name.to_string().into());
            values.push(value.to_string().into());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY v.volume, v.date");
        let mut stmt = self.conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params_from_iter(values.iter()), version_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    /// Enumerate versions matching a filter expression, ordered by volume
    /// and creation date. An empty expression matches everything.
    pub fn get_versions_with_filter(
        &self,
        filter_expression: Option<&str>,
    ) -> Result<Vec<Version>> {
        let mut sql = String::from(VERSION_SELECT);
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(expression) = filter_expression.filter(|e| !e.trim().is_empty()) {
            let ast = filter::parse(expression)?;
            let (predicate, params) = filter::to_sql_predicate(&ast)?;
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
            values = params;
        }
        sql.push_str(" ORDER BY v.volume, v.date");
        let mut stmt = self.conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params_from_iter(values.iter()), version_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    /// Attach or replace a label on a version.
    pub fn add_label(&mut self, uid: &VersionUid, name: &str, value: &str) -> Result<()> {
        if !validation::is_label_name(name) {
            return Err(CatalogError::InputData(format!(
                "Label name {} is invalid.",
                name
            )));
        }
        if !validation::is_label_value(value) {
            return Err(CatalogError::InputData(format!(
                "Label value {} is invalid.",
                value
            )));
        }
        self.with_rollback(|catalog| {
            let version = catalog.get_version(uid)?;
            catalog
                .conn
                .prepare_cached(
                    "INSERT INTO labels (version_id, name, value) VALUES (?, ?, ?) \
                     ON CONFLICT (version_id, name) DO UPDATE SET value = excluded.value",
                )?
                .execute(params![version.id, name, value])?;
            catalog.commit()
        })
    }

    pub fn rm_label(&mut self, uid: &VersionUid, name: &str) -> Result<()> {
        self.with_rollback(|catalog| {
            let version = catalog.get_version(uid)?;
            catalog
                .conn
                .prepare_cached("DELETE FROM labels WHERE version_id = ? AND name = ?")?
                .execute(params![version.id, name])?;
            catalog.commit()
        })
    }

    pub fn get_labels(&self, uid: &VersionUid) -> Result<BTreeMap<String, String>> {
        let version = self.get_version(uid)?;
        self.labels_for(version.id)
    }

    fn labels_for(&self, version_id: i64) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, value FROM labels WHERE version_id = ? ORDER BY name")?;
        let labels = stmt
            .query_map(params![version_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(labels)
    }

    /// Find or create the storage with the given name. A pre-assigned id
    /// from the configuration must match an existing row exactly.
    pub fn sync_storage(&mut self, storage_name: &str, storage_id: Option<i64>) -> Result<Storage> {
        self.with_rollback(|catalog| {
            if let Some(storage) = catalog.get_storage_by_name(storage_name)? {
                if let Some(id) = storage_id {
                    if storage.id != id {
                        return Err(CatalogError::Configuration(format!(
                            "Storage ids of {} do not match between configuration and database ({} != {}).",
                            storage_name, id, storage.id
                        )));
                    }
                }
                debug!(
                    "Found existing storage {} with id {}.",
                    storage.name, storage.id
                );
                return Ok(storage);
            }
            catalog
                .conn
                .prepare_cached("INSERT INTO storages (id, name) VALUES (?, ?)")?
                .execute(params![storage_id, storage_name])?;
            let id = storage_id.unwrap_or_else(|| catalog.conn.last_insert_rowid());
            catalog.commit()?;
            debug!("Created new storage {} with id {}.", storage_name, id);
            Ok(Storage {
                id,
                name: storage_name.to_string(),
            })
        })
    }

    pub fn get_storage_by_name(&self, storage_name: &str) -> Result<Option<Storage>> {
        let storage = self
            .conn
            .prepare_cached("SELECT id, name FROM storages WHERE name = ?")?
            .query_row(params![storage_name], |row| {
                Ok(Storage {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .optional()?;
        Ok(storage)
    }

    pub fn get_storage_by_id(&self, storage_id: i64) -> Result<Option<Storage>> {
        let storage = self
            .conn
            .prepare_cached("SELECT id, name FROM storages WHERE id = ?")?
            .query_row(params![storage_id], |row| {
                Ok(Storage {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .optional()?;
        Ok(storage)
    }
}

fn database_path(url: &str) -> Result<Option<PathBuf>> {
    let rest = url.strip_prefix("sqlite:").ok_or_else(|| {
        CatalogError::Configuration(format!("Unsupported database engine URL {}.", url))
    })?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    if rest.is_empty() || rest == ":memory:" {
        Ok(None)
    } else {
        Ok(Some(PathBuf::from(rest)))
    }
}

fn unique_violation(error: &rusqlite::Error) -> bool {
    matches!(error, rusqlite::Error::SqliteFailure(e, _)
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: row.get(0)?,
        uid: row.get(1)?,
        date: row.get(2)?,
        volume: row.get(3)?,
        snapshot: row.get(4)?,
        size: row.get(5)?,
        block_size: row.get(6)?,
        storage_id: row.get(7)?,
        storage_name: row.get(8)?,
        status: row.get(9)?,
        protected: row.get(10)?,
        bytes_read: row.get(11)?,
        bytes_written: row.get(12)?,
        bytes_deduplicated: row.get(13)?,
        bytes_sparse: row.get(14)?,
        duration: row.get(15)?,
    })
}
