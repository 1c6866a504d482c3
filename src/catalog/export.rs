// Versioned JSON import and export of the catalog
//
// The export document pins its key order: `metadata_version` first, and
// within each version the columns before `labels` and `blocks`, so a
// streaming parser can resolve the version before its children arrive.
// Import dispatches on the major of `metadata_version` and upgrades older
// documents to the canonical layout before ingesting them.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::params;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{Catalog, Storage};
use crate::error::CatalogError;
use crate::types::{self, VersionStatus, VersionUid};
#[cfg(test)]
use crate::types::BlockUid;
use crate::validation;
use crate::Result;

const METADATA_VERSION_KEY: &str = "metadata_version";
const METADATA_VERSION_CURRENT: &str = "3.0.0";

static METADATA_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap());

const EXPORT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const IMPORT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

#[derive(Serialize)]
struct ExportDocument {
    metadata_version: String,
    versions: Vec<VersionExport>,
}

// Field order is the document order; labels and blocks stay last.
#[derive(Serialize)]
struct VersionExport {
    uid: String,
    date: String,
    volume: String,
    snapshot: String,
    size: u64,
    block_size: u32,
    storage: String,
    status: String,
    protected: bool,
    bytes_read: Option<u64>,
    bytes_written: Option<u64>,
    bytes_deduplicated: Option<u64>,
    bytes_sparse: Option<u64>,
    duration: Option<u64>,
    labels: BTreeMap<String, String>,
    blocks: Vec<BlockExport>,
}

#[derive(Serialize)]
struct BlockExport {
    idx: u64,
    uid: BlockUidExport,
    size: u64,
    checksum: Option<String>,
    valid: bool,
}

#[derive(Serialize)]
struct BlockUidExport {
    left: Option<u64>,
    right: Option<u64>,
}

impl Catalog {
    /// Export the given versions as a JSON document. Compact output emits no
    /// whitespace; the default indents by two spaces.
    pub fn export<W: Write>(
        &self,
        version_uids: &[VersionUid],
        writer: W,
        compact: bool,
    ) -> Result<()> {
        let document = ExportDocument {
            metadata_version: METADATA_VERSION_CURRENT.to_string(),
            versions: version_uids
                .iter()
                .map(|uid| self.export_version(uid))
                .collect::<Result<_>>()?,
        };
        if compact {
            serde_json::to_writer(writer, &document)?;
        } else {
            serde_json::to_writer_pretty(writer, &document)?;
        }
        Ok(())
    }

    fn export_version(&self, uid: &VersionUid) -> Result<VersionExport> {
        let version = self.get_version(uid)?;
        let labels = self.labels_for(version.id)?;
        // Only stored rows are exported; sparse slots stay implicit.
        let mut stmt = self.conn.prepare_cached(
            "SELECT idx, uid_left, uid_right, size, checksum, valid FROM blocks \
             WHERE version_id = ? ORDER BY idx",
        )?;
        let blocks = stmt
            .query_map(params![version.id], |row| {
                let checksum: Option<Vec<u8>> = row.get(4)?;
                Ok(BlockExport {
                    idx: row.get(0)?,
                    uid: BlockUidExport {
                        left: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                        right: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                    },
                    size: row.get(3)?,
                    checksum: checksum.map(hex::encode),
                    valid: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(VersionExport {
            uid: version.uid.to_string(),
            date: format!("{}Z", version.date.format(EXPORT_DATE_FORMAT)),
            volume: version.volume,
            snapshot: version.snapshot,
            size: version.size,
            block_size: version.block_size,
            storage: version.storage_name,
            status: version.status.to_string(),
            protected: version.protected,
            bytes_read: version.bytes_read,
            bytes_written: version.bytes_written,
            bytes_deduplicated: version.bytes_deduplicated,
            bytes_sparse: version.bytes_sparse,
            duration: version.duration,
            labels,
            blocks,
        })
    }

    /// Import a metadata document, dispatching on its major format version.
    /// The whole file is one transaction: any validation failure rolls back
    /// every version in the batch.
    pub fn import<R: Read>(&mut self, reader: R) -> Result<Vec<VersionUid>> {
        let document: Value = serde_json::from_reader(reader)
            .map_err(|_| CatalogError::InputData("Import file is invalid.".to_string()))?;
        if document.is_null() {
            return Err(CatalogError::InputData("Import file is empty.".to_string()));
        }
        let root = document.as_object().ok_or_else(|| {
            CatalogError::InputData("Import file is invalid.".to_string())
        })?;

        let metadata_version = root
            .get(METADATA_VERSION_KEY)
            .ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Import file is missing required key \"{}\".",
                    METADATA_VERSION_KEY
                ))
            })?
            .as_str()
            .ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Wrong data type for {}.",
                    METADATA_VERSION_KEY
                ))
            })?;
        if !METADATA_VERSION_RE.is_match(metadata_version) {
            return Err(CatalogError::InputData(format!(
                "Import file has an invalid version of \"{}\".",
                metadata_version
            )));
        }
        let parsed = semver::Version::parse(metadata_version).map_err(|_| {
            CatalogError::InputData(format!(
                "Import file has an invalid version of \"{}\".",
                metadata_version
            ))
        })?;
        if !(1..=3).contains(&parsed.major) {
            return Err(CatalogError::InputData(format!(
                "Unsupported metadata version \"{}\".",
                metadata_version
            )));
        }

        let versions = root
            .get("versions")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                CatalogError::InputData("Missing or malformed versions list.".to_string())
            })?;

        self.with_rollback(|catalog| {
            let uids = match parsed.major {
                1 => catalog.import_v1(&parsed, versions),
                _ => catalog.import_v3(&parsed, versions),
            }?;
            catalog.commit()?;
            Ok(uids)
        })
    }

    /// Upgrade a major-1 document in place, then ingest it as v3: attribute
    /// renames, label list to map, numeric uid, date suffix, storage by id.
    fn import_v1(
        &mut self,
        metadata_version: &semver::Version,
        versions: &[Value],
    ) -> Result<Vec<VersionUid>> {
        let mut upgraded = Vec::with_capacity(versions.len());
        for version_value in versions {
            let mut dict = version_value
                .as_object()
                .ok_or_else(|| {
                    CatalogError::InputData(
                        "Wrong data type for versions list element.".to_string(),
                    )
                })?
                .clone();

            let uid_number = dict
                .get("uid")
                .ok_or_else(|| {
                    CatalogError::InputData("Missing attribute uid in version.".to_string())
                })?
                .as_u64()
                .ok_or_else(|| {
                    CatalogError::InputData("Wrong data type for uid in version.".to_string())
                })?;
            let uid = VersionUid::from_number(uid_number)?;
            dict.insert("uid".to_string(), Value::String(uid.to_string()));

            for attribute in ["labels", "blocks", "date", "storage_id", "name"] {
                if !dict.contains_key(attribute) {
                    return Err(CatalogError::InputData(format!(
                        "Missing attribute {} in version {}.",
                        attribute, uid
                    )));
                }
            }

            let volume = dict.remove("name").unwrap();
            dict.insert("volume".to_string(), volume);

            // Statistics only arrived with the 1.1 layout; fake them for 1.0.
            if metadata_version.minor == 0 {
                for attribute in [
                    "bytes_read",
                    "bytes_written",
                    "bytes_deduplicated",
                    "bytes_sparse",
                    "duration",
                ] {
                    dict.insert(attribute.to_string(), Value::Null);
                }
            } else {
                let deduplicated = dict.remove("bytes_dedup").ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Missing attribute bytes_dedup in version {}.",
                        uid
                    ))
                })?;
                dict.insert("bytes_deduplicated".to_string(), deduplicated);
            }

            let labels = dict
                .get("labels")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for labels in version {}.",
                        uid
                    ))
                })?;
            let mut labels_map = Map::new();
            for label in labels {
                let label = label.as_object().ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for labels list element in version {}.",
                        uid
                    ))
                })?;
                for attribute in ["name", "value"] {
                    if !label.contains_key(attribute) {
                        return Err(CatalogError::InputData(format!(
                            "Missing attribute {} in labels list in version {}.",
                            attribute, uid
                        )));
                    }
                }
                let name = label.get("name").and_then(Value::as_str).ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for label name in version {}.",
                        uid
                    ))
                })?;
                labels_map.insert(name.to_string(), label.get("value").unwrap().clone());
            }
            dict.insert("labels".to_string(), Value::Object(labels_map));

            let blocks = dict
                .get_mut("blocks")
                .and_then(Value::as_array_mut)
                .ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for blocks in version {}.",
                        uid
                    ))
                })?;
            for block_value in blocks {
                let block = block_value.as_object_mut().ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for block list element in version {}.",
                        uid
                    ))
                })?;
                let idx = block.remove("id").ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Missing id attribute in block list of version {}.",
                        uid
                    ))
                })?;
                block.insert("idx".to_string(), idx);
            }

            let date = dict.get("date").and_then(Value::as_str).ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Wrong data type for date in version {}.",
                    uid
                ))
            })?;
            dict.insert("date".to_string(), Value::String(format!("{}Z", date)));

            let storage_id = dict
                .remove("storage_id")
                .unwrap()
                .as_i64()
                .ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for storage_id in version {}.",
                        uid
                    ))
                })?;
            let storage = self.get_storage_by_id(storage_id)?.ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Storage id {} is not defined in the configuration.",
                    storage_id
                ))
            })?;
            dict.insert("storage".to_string(), Value::String(storage.name));

            let snapshot = dict.remove("snapshot_name").ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Missing attribute snapshot_name in version {}.",
                    uid
                ))
            })?;
            dict.insert("snapshot".to_string(), snapshot);

            upgraded.push(Value::Object(dict));
        }

        self.import_v3(metadata_version, &upgraded)
    }

    /// Ingest a canonical (major-3) document.
    fn import_v3(
        &mut self,
        _metadata_version: &semver::Version,
        versions: &[Value],
    ) -> Result<Vec<VersionUid>> {
        let mut version_uids = Vec::with_capacity(versions.len());
        for version_value in versions {
            let dict = version_value.as_object().ok_or_else(|| {
                CatalogError::InputData("Wrong data type for versions list element.".to_string())
            })?;

            let uid_str = dict
                .get("uid")
                .ok_or_else(|| {
                    CatalogError::InputData("Missing attribute uid in version.".to_string())
                })?
                .as_str()
                .ok_or_else(|| {
                    CatalogError::InputData("Wrong data type for uid in version.".to_string())
                })?;
            let uid = VersionUid::new(uid_str)?;

            for attribute in [
                "date",
                "volume",
                "snapshot",
                "size",
                "storage",
                "block_size",
                "status",
                "protected",
                "blocks",
                "labels",
                "bytes_read",
                "bytes_written",
                "bytes_deduplicated",
                "bytes_sparse",
                "duration",
            ] {
                if !dict.contains_key(attribute) {
                    return Err(CatalogError::InputData(format!(
                        "Missing attribute {} in version {}.",
                        attribute, uid
                    )));
                }
            }

            let volume = require_str(dict, "volume", &uid)?;
            if !validation::is_volume_name(volume) {
                return Err(CatalogError::InputData(format!(
                    "Volume name {} in version {} is invalid.",
                    volume, uid
                )));
            }
            let snapshot = require_str(dict, "snapshot", &uid)?;
            if !validation::is_snapshot_name(snapshot) {
                return Err(CatalogError::InputData(format!(
                    "Snapshot name {} in version {} is invalid.",
                    snapshot, uid
                )));
            }

            let labels = dict.get("labels").and_then(Value::as_object).ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Wrong data type for labels in version {}.",
                    uid
                ))
            })?;
            let blocks = dict.get("blocks").and_then(Value::as_array).ok_or_else(|| {
                CatalogError::InputData(format!(
                    "Wrong data type for blocks in version {}.",
                    uid
                ))
            })?;

            for (name, value) in labels {
                if !validation::is_label_name(name) {
                    return Err(CatalogError::InputData(format!(
                        "Label name {} in version {} is invalid.",
                        name, uid
                    )));
                }
                let value = value.as_str().ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for label {} in version {}.",
                        name, uid
                    ))
                })?;
                if !validation::is_label_value(value) {
                    return Err(CatalogError::InputData(format!(
                        "Label value {} in version {} is invalid.",
                        value, uid
                    )));
                }
            }

            for block_value in blocks {
                let block = block_value.as_object().ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Wrong data type for block list element in version {}.",
                        uid
                    ))
                })?;
                for attribute in ["idx", "uid", "size", "valid", "checksum"] {
                    if !block.contains_key(attribute) {
                        return Err(CatalogError::InputData(format!(
                            "Missing attribute {} in block list in version {}.",
                            attribute, uid
                        )));
                    }
                }
            }

            let storage_name = require_str(dict, "storage", &uid)?;
            let storage: Storage =
                self.get_storage_by_name(storage_name)?.ok_or_else(|| {
                    CatalogError::InputData(format!(
                        "Storage {} is not defined in the configuration.",
                        storage_name
                    ))
                })?;

            if self.get_version(&uid).is_ok() {
                return Err(CatalogError::AlreadyExists(format!(
                    "Version {} already exists and so cannot be imported.",
                    uid
                )));
            }

            let date_str = require_str(dict, "date", &uid)?;
            let date = NaiveDateTime::parse_from_str(date_str, IMPORT_DATE_FORMAT)
                .map_err(|_| {
                    CatalogError::InputData(format!(
                        "Invalid date and time specification: {}.",
                        date_str
                    ))
                })?;
            let status: VersionStatus = require_str(dict, "status", &uid)?.parse()?;

            self.conn
                .prepare_cached(
                    "INSERT INTO versions (uid, date, volume, snapshot, size, block_size, \
                     storage_id, status, protected, bytes_read, bytes_written, \
                     bytes_deduplicated, bytes_sparse, duration) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?
                .execute(params![
                    uid,
                    date,
                    volume,
                    snapshot,
                    require_u64(dict, "size", &uid)?,
                    require_u64(dict, "block_size", &uid)?,
                    storage.id,
                    status,
                    require_bool(dict, "protected", &uid)?,
                    optional_u64(dict, "bytes_read", &uid)?,
                    optional_u64(dict, "bytes_written", &uid)?,
                    optional_u64(dict, "bytes_deduplicated", &uid)?,
                    optional_u64(dict, "bytes_sparse", &uid)?,
                    optional_u64(dict, "duration", &uid)?,
                ])?;
            let version_id = self.conn.last_insert_rowid();

            {
                let mut insert_block = self.conn.prepare_cached(
                    "INSERT INTO blocks (version_id, idx, uid_left, uid_right, size, \
                     checksum, valid) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )?;
                for block_value in blocks {
                    let block = block_value.as_object().unwrap();
                    let block_uid = block.get("uid").and_then(Value::as_object).ok_or_else(|| {
                        CatalogError::InputData(format!(
                            "Wrong data type for block uid in version {}.",
                            uid
                        ))
                    })?;
                    for attribute in ["left", "right"] {
                        if !block_uid.contains_key(attribute) {
                            return Err(CatalogError::InputData(format!(
                                "Missing attribute {} in block uid of version {}.",
                                attribute, uid
                            )));
                        }
                    }
                    let checksum = match block.get("checksum").unwrap() {
                        Value::Null => None,
                        Value::String(hex_str) => Some(types::checksum_to_bytes(hex_str)?),
                        _ => {
                            return Err(CatalogError::InputData(format!(
                                "Wrong data type for block checksum in version {}.",
                                uid
                            )))
                        }
                    };
                    insert_block.execute(params![
                        version_id,
                        require_u64(block, "idx", &uid)?,
                        optional_u64(block_uid, "left", &uid)?.map(|v| v as i64),
                        optional_u64(block_uid, "right", &uid)?.map(|v| v as i64),
                        require_u64(block, "size", &uid)?,
                        checksum,
                        require_bool(block, "valid", &uid)?
                    ])?;
                }
            }

            {
                let mut insert_label = self.conn.prepare_cached(
                    "INSERT INTO labels (version_id, name, value) VALUES (?, ?, ?)",
                )?;
                for (name, value) in labels {
                    insert_label.execute(params![
                        version_id,
                        name,
                        value.as_str().unwrap()
                    ])?;
                }
            }

            version_uids.push(uid);
        }
        Ok(version_uids)
    }
}

fn require_str<'a>(
    dict: &'a Map<String, Value>,
    attribute: &str,
    uid: &VersionUid,
) -> Result<&'a str> {
    dict.get(attribute).and_then(Value::as_str).ok_or_else(|| {
        CatalogError::InputData(format!(
            "Wrong data type for {} in version {}.",
            attribute, uid
        ))
    })
}

fn require_u64(dict: &Map<String, Value>, attribute: &str, uid: &VersionUid) -> Result<u64> {
    dict.get(attribute).and_then(Value::as_u64).ok_or_else(|| {
        CatalogError::InputData(format!(
            "Wrong data type for {} in version {}.",
            attribute, uid
        ))
    })
}

fn require_bool(dict: &Map<String, Value>, attribute: &str, uid: &VersionUid) -> Result<bool> {
    dict.get(attribute).and_then(Value::as_bool).ok_or_else(|| {
        CatalogError::InputData(format!(
            "Wrong data type for {} in version {}.",
            attribute, uid
        ))
    })
}

fn optional_u64(
    dict: &Map<String, Value>,
    attribute: &str,
    uid: &VersionUid,
) -> Result<Option<u64>> {
    match dict.get(attribute) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            CatalogError::InputData(format!(
                "Wrong data type for {} in version {}.",
                attribute, uid
            ))
        }),
    }
}
