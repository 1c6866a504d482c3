// End-to-end scenarios for the metadata catalog: version lifecycle, sparse
// block handling, tombstone garbage collection, cross-process locking and
// the filter language.

use std::collections::HashSet;

use blockvault::catalog::{Catalog, NewBlock, VersionFilter};
use blockvault::types::{BlockUid, VersionStatus, VersionUid};
use blockvault::{CatalogError, Config, Result};

fn fresh_catalog() -> Result<Catalog> {
    let mut catalog = Catalog::open_in_memory()?;
    catalog.init()?;
    Ok(catalog)
}

fn uid(n: u64) -> VersionUid {
    VersionUid::from_number(n).unwrap()
}

#[test]
fn test_version_lifecycle() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    let version = catalog.create_version(
        &uid(1),
        "vol",
        "snap",
        1024,
        512,
        storage.id,
        VersionStatus::Incomplete,
        false,
    )?;
    assert_eq!(version.blocks_count(), 2);
    assert_eq!(version.status, VersionStatus::Incomplete);

    catalog.set_version(&uid(1), Some(VersionStatus::Valid), None)?;
    assert!(catalog.get_version(&uid(1))?.status.is_valid());
    Ok(())
}

#[test]
fn test_sparse_blocks_are_absent_rows() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    let version = catalog.create_version(
        &uid(1),
        "vol",
        "snap",
        1024,
        512,
        storage.id,
        VersionStatus::Incomplete,
        false,
    )?;
    catalog.create_blocks(
        &version,
        &[
            NewBlock {
                idx: 0,
                uid: Some(BlockUid::new(1, 2)),
                size: 512,
                checksum: Some("aa".to_string()),
                valid: true,
            },
            NewBlock {
                idx: 1,
                uid: None,
                size: 512,
                checksum: None,
                valid: true,
            },
        ],
    )?;
    catalog.commit()?;

    let blocks = catalog
        .get_blocks_by_version(&version, 100)?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].uid, Some(BlockUid::new(1, 2)));
    // The second row was filtered before insertion and synthesized on read.
    assert_eq!(blocks[1].uid, None);
    assert_eq!(blocks[1].size, 512);
    assert!(blocks[1].valid);
    assert_eq!(catalog.sparse_blocks_count(&version)?, 1);
    Ok(())
}

#[test]
fn test_removed_version_feeds_the_gc_planner() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    let version = catalog.create_version(
        &uid(1),
        "vol",
        "snap",
        1024,
        512,
        storage.id,
        VersionStatus::Incomplete,
        false,
    )?;
    catalog.create_blocks(
        &version,
        &[NewBlock {
            idx: 0,
            uid: Some(BlockUid::new(1, 2)),
            size: 512,
            checksum: Some("aa".to_string()),
            valid: true,
        }],
    )?;

    catalog.rm_version(&uid(1))?;
    assert!(matches!(
        catalog.get_version(&uid(1)),
        Err(CatalogError::NotFound(_))
    ));

    let mut sweep = catalog.delete_candidates(0);
    let batch = sweep.next_batch()?.expect("first batch should have hits");
    assert_eq!(batch.get("s1"), Some(&HashSet::from([BlockUid::new(1, 2)])));
    assert!(sweep.next_batch()?.is_none());
    Ok(())
}

#[test]
fn test_rereferenced_block_survives_gc() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    for n in [1, 2] {
        let version = catalog.create_version(
            &uid(n),
            "vol",
            "snap",
            1024,
            512,
            storage.id,
            VersionStatus::Incomplete,
            false,
        )?;
        // Both versions reference the same deduplicated block.
        catalog.create_blocks(
            &version,
            &[NewBlock {
                idx: 0,
                uid: Some(BlockUid::new(1, 2)),
                size: 512,
                checksum: Some("aa".to_string()),
                valid: true,
            }],
        )?;
    }

    catalog.rm_version(&uid(1))?;
    let mut sweep = catalog.delete_candidates(0);
    // The tombstone resolves as a false positive; nothing may be deleted.
    assert!(sweep.next_batch()?.is_none());
    assert!(catalog.get_block(BlockUid::new(1, 2))?.is_some());
    Ok(())
}

#[test]
fn test_version_locks_across_instances() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        database_engine: format!("sqlite:{}", dir.path().join("catalog.sqlite").display()),
    };
    let mut first = Catalog::connect(&config)?;
    first.init()?;
    let mut second = Catalog::open(&config)?;

    first.lock_version(&uid(1), Some("backup"), false)?;
    assert!(matches!(
        second.lock_version(&uid(1), Some("backup"), false),
        Err(CatalogError::AlreadyLocked(_))
    ));

    // Override replaces the first holder's row.
    second.lock_version(&uid(1), Some("recovery"), true)?;
    second.unlock_version(&uid(1))?;
    assert!(matches!(
        first.unlock_version(&uid(1)),
        Err(CatalogError::Internal(_))
    ));
    Ok(())
}

#[test]
fn test_filter_expressions_select_versions() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    for (n, volume) in [(1, "vol"), (2, "vol"), (3, "other")] {
        catalog.create_version(
            &uid(n),
            volume,
            "snap",
            1024,
            512,
            storage.id,
            VersionStatus::Incomplete,
            false,
        )?;
    }
    catalog.add_label(&uid(1), "env", "prod")?;
    catalog.add_label(&uid(2), "env", "staging")?;

    let hits = catalog
        .get_versions_with_filter(Some("volume == \"vol\" and labels[\"env\"] == \"prod\""))?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, uid(1));

    let unlabeled = catalog.get_versions_with_filter(Some("not labels[\"env\"]"))?;
    assert_eq!(unlabeled.len(), 1);
    assert_eq!(unlabeled[0].uid, uid(3));

    assert_eq!(catalog.get_versions_with_filter(Some(""))?.len(), 3);
    assert_eq!(catalog.get_versions_with_filter(None)?.len(), 3);

    assert!(matches!(
        catalog.get_versions_with_filter(Some("labels[\"env\"] == labels[\"owner\"]")),
        Err(CatalogError::Usage(_))
    ));
    Ok(())
}

#[test]
fn test_attribute_filters_match_filter_language() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    for (n, volume, snapshot) in [(1, "vol", "daily"), (2, "vol", "weekly")] {
        catalog.create_version(
            &uid(n),
            volume,
            snapshot,
            1024,
            512,
            storage.id,
            VersionStatus::Incomplete,
            false,
        )?;
    }
    catalog.add_label(&uid(2), "env", "prod")?;

    let by_attributes = catalog.get_versions(&VersionFilter {
        volume: Some("vol"),
        snapshot: Some("weekly"),
        labels: &[("env", "prod")],
        ..Default::default()
    })?;
    let by_expression = catalog.get_versions_with_filter(Some(
        "volume == \"vol\" and snapshot == \"weekly\" and labels[\"env\"] == \"prod\"",
    ))?;
    assert_eq!(by_attributes, by_expression);
    assert_eq!(by_attributes.len(), 1);
    assert_eq!(by_attributes[0].uid, uid(2));
    Ok(())
}

#[test]
fn test_export_round_trips_through_import() -> Result<()> {
    let mut source = fresh_catalog()?;
    let storage = source.sync_storage("s1", None)?;
    let version = source.create_version(
        &uid(1),
        "vol",
        "snap",
        1536,
        512,
        storage.id,
        VersionStatus::Valid,
        false,
    )?;
    source.create_blocks(
        &version,
        &[
            NewBlock {
                idx: 0,
                uid: Some(BlockUid::new(1, 2)),
                size: 512,
                checksum: Some("aa".to_string()),
                valid: true,
            },
            NewBlock {
                idx: 2,
                uid: Some(BlockUid::new(3, 4)),
                size: 512,
                checksum: Some("bb".to_string()),
                valid: true,
            },
        ],
    )?;
    source.add_label(&uid(1), "env", "prod")?;
    source.commit()?;

    let mut document = Vec::new();
    source.export(&[uid(1)], &mut document, true)?;

    let mut target = fresh_catalog()?;
    target.sync_storage("s1", None)?;
    assert_eq!(target.import(document.as_slice())?, vec![uid(1)]);

    let restored = target.get_version(&uid(1))?;
    assert_eq!(restored.blocks_count(), 3);
    assert_eq!(target.get_labels(&uid(1))?.len(), 1);
    let blocks = target
        .get_blocks_by_version(&restored, 100)?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].uid, Some(BlockUid::new(1, 2)));
    assert_eq!(blocks[1].uid, None);
    assert_eq!(blocks[2].uid, Some(BlockUid::new(3, 4)));
    Ok(())
}

#[test]
fn test_corrupt_block_invalidates_owning_versions() -> Result<()> {
    let mut catalog = fresh_catalog()?;
    let storage = catalog.sync_storage("s1", None)?;
    for n in [1, 2] {
        let version = catalog.create_version(
            &uid(n),
            "vol",
            "snap",
            512,
            512,
            storage.id,
            VersionStatus::Valid,
            false,
        )?;
        catalog.create_blocks(
            &version,
            &[NewBlock {
                idx: 0,
                uid: Some(BlockUid::new(9, 9)),
                size: 512,
                checksum: Some("cc".to_string()),
                valid: true,
            }],
        )?;
    }

    let mut affected = catalog.set_block_invalid(BlockUid::new(9, 9))?;
    affected.sort();
    assert_eq!(affected, vec![uid(1), uid(2)]);
    for n in [1, 2] {
        assert_eq!(catalog.get_version(&uid(n))?.status, VersionStatus::Invalid);
    }
    Ok(())
}
