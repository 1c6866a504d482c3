// Garbage-collection planner
//
// Tombstones are resolved in two phases: a candidate must be past its grace
// period AND no live block row may still reference its UID. The grace period
// gives an in-flight deduplication hit that found the block before a
// concurrent rm_version time to write its re-reference.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::{debug, info};

use super::Catalog;
use crate::types::{self, BlockUid};
use crate::Result;

/// Default tombstone grace period in seconds.
pub const DEFAULT_GC_GRACE_SECONDS: u64 = 3600;

const CANDIDATE_BATCH_LIMIT: u32 = 250;

struct Candidate {
    uid: BlockUid,
    storage_name: String,
}

impl Catalog {
    /// Start a resumable sweep over expired tombstones. Each call to
    /// [`DeleteCandidates::next_batch`] yields a mapping of storage name to
    /// the block UIDs believed safely deletable; the caller removes the
    /// objects before asking for the next batch.
    pub fn delete_candidates(&mut self, grace_seconds: u64) -> DeleteCandidates<'_> {
        let cutoff = types::utc_now() - chrono::Duration::seconds(grace_seconds as i64);
        DeleteCandidates {
            catalog: self,
            cutoff,
            rounds: 0,
            false_positive_count: 0,
            hit_count: 0,
            pending_commit: false,
            finished: false,
        }
    }
}

pub struct DeleteCandidates<'a> {
    catalog: &'a mut Catalog,
    cutoff: chrono::NaiveDateTime,
    rounds: u64,
    false_positive_count: u64,
    hit_count: u64,
    pending_commit: bool,
    finished: bool,
}

impl DeleteCandidates<'_> {
    /// One round of the sweep. Returns `None` once no expired tombstones
    /// remain; the transaction covering the previously returned batch is
    /// committed at the start of the next call, after the caller has removed
    /// the objects.
    pub fn next_batch(&mut self) -> Result<Option<HashMap<String, HashSet<BlockUid>>>> {
        if self.finished {
            return Ok(None);
        }
        if self.pending_commit {
            self.catalog.commit()?;
            self.pending_commit = false;
        }

        loop {
            let candidates = self.fetch_candidates()?;
            if candidates.is_empty() {
                self.finished = true;
                self.catalog.commit()?;
                info!(
                    "Cleanup finished. {} false positives, {} data deletions.",
                    self.false_positive_count, self.hit_count
                );
                return Ok(None);
            }

            self.catalog.begin()?;
            let mut false_positives: HashSet<BlockUid> = HashSet::new();
            let mut hit_list: HashMap<String, HashSet<BlockUid>> = HashMap::new();
            for candidate in candidates {
                self.rounds += 1;
                if self.rounds % 1000 == 0 {
                    info!(
                        "Cleanup: {} false positives, {} data deletions.",
                        self.false_positive_count, self.hit_count
                    );
                }

                let referenced = self
                    .catalog
                    .conn
                    .prepare_cached(
                        "SELECT 1 FROM blocks WHERE uid_left = ? AND uid_right = ? LIMIT 1",
                    )?
                    .query_row(
                        params![candidate.uid.left as i64, candidate.uid.right as i64],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if referenced {
                    // Re-introduced by a restore or a deduplication hit since
                    // the tombstone was written; the object must stay.
                    false_positives.insert(candidate.uid);
                    self.false_positive_count += 1;
                } else {
                    hit_list
                        .entry(candidate.storage_name)
                        .or_default()
                        .insert(candidate.uid);
                    self.hit_count += 1;
                }
            }

            if !false_positives.is_empty() {
                debug!(
                    "Cleanup: Removing {} false positives from delete candidates.",
                    false_positives.len()
                );
                self.delete_tombstones(&false_positives)?;
            }
            if !hit_list.is_empty() {
                for uids in hit_list.values() {
                    self.delete_tombstones(uids)?;
                }
                self.pending_commit = true;
                return Ok(Some(hit_list));
            }
            // The whole batch were false positives; keep sweeping.
        }
    }

    fn fetch_candidates(&self) -> Result<Vec<Candidate>> {
        let mut stmt = self.catalog.conn.prepare_cached(
            "SELECT d.uid_left, d.uid_right, s.name FROM deleted_blocks d \
             JOIN storages s ON s.id = d.storage_id WHERE d.date < ? LIMIT ?",
        )?;
        let candidates = stmt
            .query_map(params![self.cutoff, CANDIDATE_BATCH_LIMIT], |row| {
                Ok(Candidate {
                    uid: BlockUid::new(
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                    ),
                    storage_name: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    fn delete_tombstones(&self, uids: &HashSet<BlockUid>) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let predicate = vec!["(uid_left = ? AND uid_right = ?)"; uids.len()].join(" OR ");
        let sql = format!("DELETE FROM deleted_blocks WHERE {predicate}");
        let params: Vec<i64> = uids
            .iter()
            .flat_map(|uid| [uid.left as i64, uid.right as i64])
            .collect();
        self.catalog
            .conn
            .execute(&sql, params_from_iter(params.iter()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NewBlock, Version};
    use crate::types::{VersionStatus, VersionUid};

    fn test_catalog() -> Result<Catalog> {
        let mut catalog = Catalog::open_in_memory()?;
        catalog.init()?;
        Ok(catalog)
    }

    fn uid(n: u64) -> VersionUid {
        VersionUid::from_number(n).unwrap()
    }

    fn create_version(catalog: &mut Catalog, n: u64) -> Result<Version> {
        let storage = catalog.sync_storage("s1", None)?;
        catalog.create_version(
            &uid(n),
            "vol",
            "snap",
            1024,
            512,
            storage.id,
            VersionStatus::Incomplete,
            false,
        )
    }

    fn data_block(idx: u64, left: u64, right: u64) -> NewBlock {
        NewBlock {
            idx,
            uid: Some(BlockUid::new(left, right)),
            size: 512,
            checksum: Some("aa".to_string()),
            valid: true,
        }
    }

    #[test]
    fn test_unreferenced_tombstone_is_yielded_once() -> Result<()> {
        let mut catalog = test_catalog()?;
        let version = create_version(&mut catalog, 1)?;
        catalog.create_blocks(&version, &[data_block(0, 1, 2)])?;
        catalog.rm_version(&uid(1))?;

        let mut sweep = catalog.delete_candidates(0);
        let batch = sweep.next_batch()?.expect("one batch expected");
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.get("s1"),
            Some(&HashSet::from([BlockUid::new(1, 2)]))
        );
        assert!(sweep.next_batch()?.is_none());
        // Idempotent once finished.
        assert!(sweep.next_batch()?.is_none());

        let remaining: u64 =
            catalog
                .conn
                .query_row("SELECT COUNT(*) FROM deleted_blocks", [], |row| row.get(0))?;
        assert_eq!(remaining, 0);
        Ok(())
    }

    #[test]
    fn test_rereferenced_uid_is_a_false_positive() -> Result<()> {
        let mut catalog = test_catalog()?;
        let version_a = create_version(&mut catalog, 1)?;
        let version_b = create_version(&mut catalog, 2)?;
        catalog.create_blocks(&version_a, &[data_block(0, 1, 2)])?;
        catalog.create_blocks(&version_b, &[data_block(0, 1, 2)])?;
        catalog.rm_version(&uid(1))?;

        let mut sweep = catalog.delete_candidates(0);
        assert!(sweep.next_batch()?.is_none());

        // The tombstone was consumed without deleting anything.
        let remaining: u64 =
            catalog
                .conn
                .query_row("SELECT COUNT(*) FROM deleted_blocks", [], |row| row.get(0))?;
        assert_eq!(remaining, 0);
        assert!(catalog.get_block(BlockUid::new(1, 2))?.is_some());
        Ok(())
    }

    #[test]
    fn test_grace_period_defers_candidates() -> Result<()> {
        let mut catalog = test_catalog()?;
        let version = create_version(&mut catalog, 1)?;
        catalog.create_blocks(&version, &[data_block(0, 1, 2)])?;
        catalog.rm_version(&uid(1))?;

        // A fresh tombstone is not yet a candidate under the default grace.
        let mut sweep = catalog.delete_candidates(DEFAULT_GC_GRACE_SECONDS);
        assert!(sweep.next_batch()?.is_none());
        let remaining: u64 =
            catalog
                .conn
                .query_row("SELECT COUNT(*) FROM deleted_blocks", [], |row| row.get(0))?;
        assert_eq!(remaining, 1);
        Ok(())
    }

    #[test]
    fn test_hits_are_grouped_by_storage() -> Result<()> {
        let mut catalog = test_catalog()?;
        let storage_a = catalog.sync_storage("s1", None)?;
        let storage_b = catalog.sync_storage("s2", None)?;
        for (n, storage_id) in [(1, storage_a.id), (2, storage_b.id)] {
            let version = catalog.create_version(
                &uid(n),
                "vol",
                "snap",
                1024,
                512,
                storage_id,
                VersionStatus::Incomplete,
                false,
            )?;
            catalog.create_blocks(&version, &[data_block(0, n, n)])?;
        }
        catalog.rm_version(&uid(1))?;
        catalog.rm_version(&uid(2))?;

        let mut sweep = catalog.delete_candidates(0);
        let batch = sweep.next_batch()?.expect("one batch expected");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get("s1"), Some(&HashSet::from([BlockUid::new(1, 1)])));
        assert_eq!(batch.get("s2"), Some(&HashSet::from([BlockUid::new(2, 2)])));
        assert!(sweep.next_batch()?.is_none());
        Ok(())
    }
}
