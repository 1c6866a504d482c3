// Block slot operations and sparse-block synthesis
//
// A slot that is entirely zero at full block size is never stored; readers
// see it synthesized on the fly so every version iterates as a dense
// sequence 0..blocks_count.

use std::collections::VecDeque;

use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{Catalog, Version};
use crate::error::CatalogError;
use crate::types::{self, BlockUid, VersionUid};
use crate::Result;

/// Window size for [`Catalog::get_blocks_by_version`].
pub const DEFAULT_BLOCK_YIELD_PER: u64 = 10_000;

const BLOCK_SELECT: &str =
    "SELECT uid_left, uid_right, version_id, idx, size, checksum, valid FROM blocks";

/// One slot of a version. `uid` is `None` for sparse slots; the checksum is
/// carried in transport form (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub uid: Option<BlockUid>,
    pub version_id: i64,
    pub idx: u64,
    pub checksum: Option<String>,
    pub size: u64,
    pub valid: bool,
}

impl Block {
    pub fn uid_left(&self) -> Option<u64> {
        self.uid.map(|uid| uid.left)
    }

    pub fn uid_right(&self) -> Option<u64> {
        self.uid.map(|uid| uid.right)
    }
}

/// Input row for [`Catalog::create_blocks`].
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub idx: u64,
    pub uid: Option<BlockUid>,
    pub size: u64,
    pub checksum: Option<String>,
    pub valid: bool,
}

impl Catalog {
    /// Write one block slot, idempotently. A fully sparse slot is stored as
    /// row absence. The commit is deferred to bound write load; callers that
    /// need synchronous durability call [`Catalog::commit`] afterwards.
    pub fn set_block(
        &mut self,
        version: &Version,
        idx: u64,
        uid: Option<BlockUid>,
        checksum: Option<&str>,
        size: u64,
        valid: bool,
    ) -> Result<()> {
        let checksum = checksum.map(types::checksum_to_bytes).transpose()?;
        self.with_rollback(|catalog| {
            let present = catalog
                .conn
                .prepare_cached("SELECT 1 FROM blocks WHERE version_id = ? AND idx = ?")?
                .query_row(params![version.id, idx], |_| Ok(()))
                .optional()?
                .is_some();
            let fully_sparse = uid.is_none() && size == u64::from(version.block_size);

            if !present && fully_sparse {
                // Nothing stored and nothing to store.
                return Ok(());
            } else if present && fully_sparse {
                catalog
                    .conn
                    .prepare_cached("DELETE FROM blocks WHERE version_id = ? AND idx = ?")?
                    .execute(params![version.id, idx])?;
            } else if !present {
                catalog
                    .conn
                    .prepare_cached(
                        "INSERT INTO blocks (version_id, idx, uid_left, uid_right, size, \
                         checksum, valid) VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )?
                    .execute(params![
                        version.id,
                        idx,
                        uid.map(|u| u.left as i64),
                        uid.map(|u| u.right as i64),
                        size,
                        checksum,
                        valid
                    ])?;
            } else {
                catalog
                    .conn
                    .prepare_cached(
                        "UPDATE blocks SET uid_left = ?, uid_right = ?, size = ?, \
                         checksum = ?, valid = ? WHERE version_id = ? AND idx = ?",
                    )?
                    .execute(params![
                        uid.map(|u| u.left as i64),
                        uid.map(|u| u.right as i64),
                        size,
                        checksum,
                        valid,
                        version.id,
                        idx
                    ])?;
            }

            catalog.conditional_blocks_commit("set_block")
        })
    }

    /// Bulk insertion for initial version population. Fully sparse rows are
    /// filtered out before insertion.
    pub fn create_blocks(&mut self, version: &Version, blocks: &[NewBlock]) -> Result<()> {
        self.with_rollback(|catalog| {
            let block_size = u64::from(version.block_size);
            {
                let mut stmt = catalog.conn.prepare_cached(
                    "INSERT INTO blocks (version_id, idx, uid_left, uid_right, size, \
                     checksum, valid) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )?;
                for block in blocks
                    .iter()
                    .filter(|block| block.uid.is_some() || block.size != block_size)
                {
                    let checksum = block
                        .checksum
                        .as_deref()
                        .map(types::checksum_to_bytes)
                        .transpose()?;
                    stmt.execute(params![
                        version.id,
                        block.idx,
                        block.uid.map(|u| u.left as i64),
                        block.uid.map(|u| u.right as i64),
                        block.size,
                        checksum,
                        block.valid
                    ])?;
                }
            }
            catalog.conditional_blocks_commit("create_blocks")
        })
    }

    /// Mark every row carrying this UID as invalid and invalidate every
    /// owning version. Returns the affected version UIDs for reporting.
    pub fn set_block_invalid(&mut self, block_uid: BlockUid) -> Result<Vec<VersionUid>> {
        self.with_rollback(|catalog| {
            let affected: Vec<VersionUid> = catalog
                .conn
                .prepare_cached(
                    "SELECT DISTINCT v.uid FROM versions v JOIN blocks b \
                     ON b.version_id = v.id WHERE b.uid_left = ? AND b.uid_right = ?",
                )?
                .query_map(
                    params![block_uid.left as i64, block_uid.right as i64],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<_>>()?;
            if affected.is_empty() {
                return Err(CatalogError::Internal(format!(
                    "No version references block with UID {}.",
                    block_uid
                )));
            }

            catalog
                .conn
                .prepare_cached("UPDATE blocks SET valid = 0 WHERE uid_left = ? AND uid_right = ?")?
                .execute(params![block_uid.left as i64, block_uid.right as i64])?;
            catalog.commit()?;

            tracing::error!(
                "Marked block with UID {} as invalid. Affected versions: {}.",
                block_uid,
                affected
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            for uid in &affected {
                catalog.set_version(uid, Some(types::VersionStatus::Invalid), None)?;
            }
            catalog.commit()?;
            Ok(affected)
        })
    }

    /// Any persisted block carrying this UID, if one exists.
    pub fn get_block(&self, block_uid: BlockUid) -> Result<Option<Block>> {
        let sql = format!("{BLOCK_SELECT} WHERE uid_left = ? AND uid_right = ? LIMIT 1");
        let block = self
            .conn
            .prepare_cached(&sql)?
            .query_row(
                params![block_uid.left as i64, block_uid.right as i64],
                block_from_row,
            )
            .optional()?;
        Ok(block)
    }

    /// The block at a slot, synthesizing a sparse one if no row is stored.
    pub fn get_block_by_idx(&self, version: &Version, idx: u64) -> Result<Block> {
        let sql = format!("{BLOCK_SELECT} WHERE version_id = ? AND idx = ?");
        let block = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![version.id, idx], block_from_row)
            .optional()?;
        Ok(block.unwrap_or_else(|| sparse_block(version.id, u64::from(version.block_size), idx)))
    }

    /// Any valid block in the given storage with this checksum. Used for
    /// deduplication, so any match will do.
    pub fn get_block_by_checksum(
        &self,
        checksum: &str,
        storage_id: i64,
    ) -> Result<Option<Block>> {
        let checksum = types::checksum_to_bytes(checksum)?;
        let block = self
            .conn
            .prepare_cached(
                "SELECT b.uid_left, b.uid_right, b.version_id, b.idx, b.size, b.checksum, \
                 b.valid FROM blocks b JOIN versions v ON v.id = b.version_id \
                 WHERE b.checksum = ? AND b.valid = 1 AND v.storage_id = ? LIMIT 1",
            )?
            .query_row(params![checksum, storage_id], block_from_row)
            .optional()?;
        Ok(block)
    }

    /// Stream the dense block sequence of a version in windows of
    /// `yield_per` slots, synthesizing sparse rows for index gaps.
    pub fn get_blocks_by_version<'a>(
        &'a self,
        version: &Version,
        yield_per: u64,
    ) -> Result<BlockIter<'a>> {
        if yield_per == 0 {
            return Err(CatalogError::Internal(
                "yield_per must be greater than zero.".to_string(),
            ));
        }
        Ok(BlockIter {
            catalog: self,
            version_id: version.id,
            block_size: u64::from(version.block_size),
            blocks_count: version.blocks_count(),
            yield_per,
            next_start: 0,
            buffer: VecDeque::new(),
            finished: false,
        })
    }

    /// Remove a version. Every stored block with a present UID leaves a
    /// tombstone behind for the garbage-collection planner; the version row
    /// cascade-deletes its blocks and labels. Returns the number of blocks
    /// that were attached.
    pub fn rm_version(&mut self, uid: &VersionUid) -> Result<u64> {
        self.with_rollback(|catalog| {
            let version = catalog.get_version(uid)?;
            let num_blocks: u64 = catalog
                .conn
                .prepare_cached("SELECT COUNT(*) FROM blocks WHERE version_id = ?")?
                .query_row(params![version.id], |row| row.get(0))?;
            {
                let mut select = catalog.conn.prepare_cached(
                    "SELECT uid_left, uid_right FROM blocks \
                     WHERE version_id = ? AND uid_left IS NOT NULL",
                )?;
                let mut insert = catalog.conn.prepare_cached(
                    "INSERT INTO deleted_blocks (date, storage_id, uid_left, uid_right) \
                     VALUES (?, ?, ?, ?)",
                )?;
                let uids = select
                    .query_map(params![version.id], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (left, right) in uids {
                    insert.execute(params![
                        types::utc_now(),
                        version.storage_id,
                        left,
                        right
                    ])?;
                }
            }
            catalog
                .conn
                .prepare_cached("DELETE FROM versions WHERE id = ?")?
                .execute(params![version.id])?;
            catalog.commit()?;
            Ok(num_blocks)
        })
    }

    /// Number of sparse slots of a version, stored or synthesized.
    pub fn sparse_blocks_count(&self, version: &Version) -> Result<u64> {
        let present: u64 = self
            .conn
            .prepare_cached(
                "SELECT COUNT(*) FROM blocks WHERE version_id = ? AND uid_left IS NOT NULL",
            )?
            .query_row(params![version.id], |row| row.get(0))?;
        Ok(version.blocks_count().saturating_sub(present))
    }
}

/// Windowed scan over a version's dense block sequence. Sparse slots are
/// synthesized so consumers always see indexes 0..blocks_count in order.
pub struct BlockIter<'a> {
    catalog: &'a Catalog,
    version_id: i64,
    block_size: u64,
    blocks_count: u64,
    yield_per: u64,
    next_start: u64,
    buffer: VecDeque<Block>,
    finished: bool,
}

impl BlockIter<'_> {
    fn fetch_window(&mut self) -> Result<()> {
        if self.next_start >= self.blocks_count {
            self.finished = true;
            return Ok(());
        }
        let start = self.next_start;
        let end = (start + self.yield_per).min(self.blocks_count);
        self.next_start = end;

        let sql = format!(
            "{BLOCK_SELECT} WHERE version_id = ? AND idx >= ? AND idx < ? ORDER BY idx"
        );
        let mut stmt = self.catalog.conn.prepare_cached(&sql)?;
        let stored = stmt
            .query_map(params![self.version_id, start, end], block_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut idx = start;
        for block in stored {
            if idx < block.idx {
                debug!("Synthesizing sparse blocks {} to {}.", idx, block.idx - 1);
            }
            while idx < block.idx {
                self.buffer
                    .push_back(sparse_block(self.version_id, self.block_size, idx));
                idx += 1;
            }
            self.buffer.push_back(block);
            idx += 1;
        }
        if idx < end {
            debug!(
                "Synthesizing sparse blocks {} to {} at end of slice.",
                idx,
                end - 1
            );
        }
        while idx < end {
            self.buffer
                .push_back(sparse_block(self.version_id, self.block_size, idx));
            idx += 1;
        }

        if self.next_start >= self.blocks_count {
            self.finished = true;
        }
        Ok(())
    }
}

impl Iterator for BlockIter<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(block) = self.buffer.pop_front() {
                return Some(Ok(block));
            }
            if self.finished {
                return None;
            }
            if let Err(error) = self.fetch_window() {
                self.finished = true;
                return Some(Err(error));
            }
        }
    }
}

fn sparse_block(version_id: i64, block_size: u64, idx: u64) -> Block {
    Block {
        uid: None,
        version_id,
        idx,
        checksum: None,
        size: block_size,
        valid: true,
    }
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
    let uid_left: Option<i64> = row.get(0)?;
    let uid_right: Option<i64> = row.get(1)?;
    let checksum: Option<Vec<u8>> = row.get(5)?;
    Ok(Block {
        uid: match (uid_left, uid_right) {
            (Some(left), Some(right)) => Some(BlockUid::new(left as u64, right as u64)),
            _ => None,
        },
        version_id: row.get(2)?,
        idx: row.get(3)?,
        size: row.get(4)?,
        checksum: checksum.map(hex::encode),
        valid: row.get(6)?,
    })
}
