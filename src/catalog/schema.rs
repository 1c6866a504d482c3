// Relational schema and migration driver
//
// Constraint and index names are explicit so that migration diffs stay
// stable across schema revisions.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::CatalogError;
use crate::Result;

pub struct Migration {
    pub revision: &'static str,
    sql: &'static str,
}

/// Ordered schema history. `init` applies the whole list; `migrate` applies
/// everything after the currently stamped revision.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        revision: "4f9a7c21b83d",
        sql: "\
CREATE TABLE storages (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    name VARCHAR(255) NOT NULL,
    CONSTRAINT uq_storages_name UNIQUE (name)
);

CREATE TABLE versions (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    uid VARCHAR(255) NOT NULL,
    date DATETIME NOT NULL,
    volume VARCHAR(255) NOT NULL,
    snapshot VARCHAR(255) NOT NULL,
    size BIGINT NOT NULL,
    block_size INTEGER NOT NULL,
    storage_id INTEGER NOT NULL,
    status INTEGER NOT NULL,
    protected BOOLEAN NOT NULL,
    CONSTRAINT uq_versions_uid UNIQUE (uid),
    CONSTRAINT ck_versions_status CHECK (status >= 1 AND status <= 3),
    CONSTRAINT fk_versions_storage_id_storages FOREIGN KEY (storage_id) REFERENCES storages (id)
);
CREATE INDEX ix_versions_volume ON versions (volume);

CREATE TABLE labels (
    version_id INTEGER NOT NULL,
    name VARCHAR(255) NOT NULL,
    value VARCHAR(255) NOT NULL,
    CONSTRAINT pk_labels PRIMARY KEY (version_id, name),
    CONSTRAINT fk_labels_version_id_versions FOREIGN KEY (version_id) REFERENCES versions (id) ON DELETE CASCADE
);
CREATE INDEX ix_labels_name ON labels (name);
CREATE INDEX ix_labels_value ON labels (value);

CREATE TABLE blocks (
    idx INTEGER NOT NULL,
    uid_right INTEGER,
    uid_left INTEGER,
    size INTEGER,
    version_id INTEGER NOT NULL,
    valid BOOLEAN NOT NULL,
    checksum BLOB,
    CONSTRAINT pk_blocks PRIMARY KEY (version_id, idx),
    CONSTRAINT fk_blocks_version_id_versions FOREIGN KEY (version_id) REFERENCES versions (id) ON DELETE CASCADE
);
CREATE INDEX ix_blocks_uid_left_uid_right ON blocks (uid_left, uid_right);
CREATE INDEX ix_blocks_checksum ON blocks (checksum);

CREATE TABLE deleted_blocks (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    date DATETIME NOT NULL,
    storage_id INTEGER NOT NULL,
    uid_left INTEGER NOT NULL,
    uid_right INTEGER NOT NULL,
    CONSTRAINT fk_deleted_blocks_storage_id_storages FOREIGN KEY (storage_id) REFERENCES storages (id)
);
CREATE INDEX ix_deleted_blocks_uid_left_uid_right ON deleted_blocks (uid_left, uid_right);

CREATE TABLE locks (
    lock_name VARCHAR(255) NOT NULL,
    host VARCHAR(255) NOT NULL,
    process_id VARCHAR(255) NOT NULL,
    reason VARCHAR(255),
    date DATETIME NOT NULL,
    CONSTRAINT pk_locks PRIMARY KEY (lock_name)
);

CREATE TABLE schema_revision (
    revision VARCHAR(32) NOT NULL
);
",
    },
    // Statistics were folded into the versions table.
    Migration {
        revision: "c87b30d1e5f2",
        sql: "\
ALTER TABLE versions ADD COLUMN bytes_read BIGINT;
ALTER TABLE versions ADD COLUMN bytes_written BIGINT;
ALTER TABLE versions ADD COLUMN bytes_deduplicated BIGINT;
ALTER TABLE versions ADD COLUMN bytes_sparse BIGINT;
ALTER TABLE versions ADD COLUMN duration BIGINT;
",
    },
];

pub fn head_revision() -> &'static str {
    MIGRATIONS[MIGRATIONS.len() - 1].revision
}

/// Names of all user tables, ignoring SQLite's internal bookkeeping table.
pub fn database_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name != 'sqlite_sequence' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tables)
}

pub fn current_revision(conn: &Connection) -> Result<Option<String>> {
    if !database_tables(conn)?
        .iter()
        .any(|table| table == "schema_revision")
    {
        return Ok(None);
    }
    let revision = conn
        .query_row("SELECT revision FROM schema_revision", [], |row| row.get(0))
        .optional()?;
    Ok(revision)
}

/// Verify that the database is initialized and stamped at the head revision.
/// Migration is an explicit administrative action and never happens here.
pub fn check(conn: &Connection) -> Result<()> {
    if database_tables(conn)?.is_empty() {
        return Err(CatalogError::Configuration(
            "Database schema appears to be empty, it needs to be initialized.".to_string(),
        ));
    }
    let current = current_revision(conn)?;
    let head = head_revision();
    debug!(
        "Current database schema revision: {}.",
        current.as_deref().unwrap_or("<unknown>")
    );
    debug!("Expected database schema revision: {}.", head);
    match current {
        Some(revision) if revision == head => Ok(()),
        Some(revision) => Err(CatalogError::MigrationRequired(format!(
            "Database schema revision {} does not match the expected revision {}.",
            revision, head
        ))),
        None => Err(CatalogError::Configuration(format!(
            "Database schema carries no revision stamp, expected revision {}.",
            head
        ))),
    }
}

/// Create the schema from scratch and stamp it at head. Refuses to touch a
/// database that already contains tables.
pub fn init(conn: &mut Connection) -> Result<()> {
    let tables = database_tables(conn)?;
    if !tables.is_empty() {
        debug!("Existing tables: {}", tables.join(", "));
        return Err(CatalogError::AlreadyExists(
            "Database schema already contains tables. Not touching anything.".to_string(),
        ));
    }
    let tx = conn.transaction()?;
    for migration in MIGRATIONS {
        tx.execute_batch(migration.sql)?;
    }
    tx.execute(
        "INSERT INTO schema_revision (revision) VALUES (?)",
        [head_revision()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Upgrade the schema to the head revision, one revision per transaction.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    if database_tables(conn)?.is_empty() {
        return Err(CatalogError::Configuration(
            "Database schema appears to be empty, it needs to be initialized.".to_string(),
        ));
    }
    let current = current_revision(conn)?.ok_or_else(|| {
        CatalogError::Configuration(
            "Database schema carries no revision stamp.".to_string(),
        )
    })?;
    let position = MIGRATIONS
        .iter()
        .position(|migration| migration.revision == current)
        .ok_or_else(|| {
            CatalogError::Configuration(format!(
                "Unknown database schema revision {}.",
                current
            ))
        })?;
    if position + 1 == MIGRATIONS.len() {
        info!("Current database schema revision: {}.", current);
        info!("The database schema is up-to-date.");
        return Ok(());
    }
    info!(
        "Migrating from database schema revision {} to {}.",
        current,
        head_revision()
    );
    for migration in &MIGRATIONS[position + 1..] {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "UPDATE schema_revision SET revision = ?",
            [migration.revision],
        )?;
        tx.commit()?;
    }
    Ok(())
}
