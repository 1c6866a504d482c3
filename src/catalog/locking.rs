// Process-global advisory locks
//
// Locks are rows keyed by name. The holder is identified by host name plus
// a UUID generated once per catalog instance, so a restarted process never
// collides with its previous incarnation. Locks survive crashes; recovery
// is manual via override.

use rusqlite::{params, OptionalExtension};
use tracing::{error, warn};

use super::{unique_violation, Catalog};
use crate::error::CatalogError;
use crate::types::{self, VersionUid};
use crate::Result;

fn version_lock_name(uid: &VersionUid) -> String {
    format!("Version {}", uid)
}

impl Catalog {
    /// Acquire a named lock. Acquiring a name this instance already holds is
    /// a bug and fails with an internal error; losing the race to another
    /// instance fails with `AlreadyLocked`. With `override_lock` an existing
    /// row is replaced, as an escape hatch for recovering abandoned locks.
    pub fn lock(
        &mut self,
        lock_name: &str,
        reason: Option<&str>,
        locked_msg: Option<&str>,
        override_lock: bool,
    ) -> Result<()> {
        self.with_rollback(|catalog| {
            let held = catalog
                .conn
                .prepare_cached(
                    "SELECT 1 FROM locks WHERE host = ? AND lock_name = ? AND process_id = ?",
                )?
                .query_row(
                    params![catalog.host, lock_name, catalog.process_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if held {
                return Err(CatalogError::Internal(format!(
                    "Attempt to acquire lock {} twice.",
                    lock_name
                )));
            }

            let insert = if override_lock {
                warn!("Will override any existing lock.");
                "INSERT INTO locks (lock_name, host, process_id, reason, date) \
                 VALUES (?, ?, ?, ?, ?) ON CONFLICT (lock_name) DO UPDATE SET \
                 host = excluded.host, process_id = excluded.process_id, \
                 reason = excluded.reason, date = excluded.date"
            } else {
                "INSERT INTO locks (lock_name, host, process_id, reason, date) \
                 VALUES (?, ?, ?, ?, ?)"
            };
            catalog
                .conn
                .prepare_cached(insert)
                .and_then(|mut stmt| {
                    stmt.execute(params![
                        lock_name,
                        catalog.host,
                        catalog.process_id,
                        reason,
                        types::utc_now()
                    ])
                })
                .map_err(|e| {
                    if unique_violation(&e) {
                        CatalogError::AlreadyLocked(match locked_msg {
                            Some(msg) => msg.to_string(),
                            None => format!("Lock {} is already taken.", lock_name),
                        })
                    } else {
                        e.into()
                    }
                })?;
            catalog.commit()
        })
    }

    pub fn is_locked(&self, lock_name: &str) -> Result<bool> {
        let locked = self
            .conn
            .prepare_cached("SELECT 1 FROM locks WHERE lock_name = ?")?
            .query_row(params![lock_name], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(locked)
    }

    /// Update the reason of a lock held by this instance.
    pub fn update_lock(&mut self, lock_name: &str, reason: Option<&str>) -> Result<()> {
        self.with_rollback(|catalog| {
            let changed = catalog
                .conn
                .prepare_cached(
                    "UPDATE locks SET reason = ? WHERE host = ? AND lock_name = ? \
                     AND process_id = ?",
                )?
                .execute(params![reason, catalog.host, lock_name, catalog.process_id])?;
            if changed == 0 {
                return Err(CatalogError::Internal(format!(
                    "Lock {} isn't held by this instance or doesn't exist.",
                    lock_name
                )));
            }
            catalog.commit()
        })
    }

    /// Release a lock held by this instance.
    pub fn unlock(&mut self, lock_name: &str) -> Result<()> {
        self.with_rollback(|catalog| {
            let deleted = catalog
                .conn
                .prepare_cached(
                    "DELETE FROM locks WHERE host = ? AND lock_name = ? AND process_id = ?",
                )?
                .execute(params![catalog.host, lock_name, catalog.process_id])?;
            if deleted == 0 {
                return Err(CatalogError::Internal(format!(
                    "Lock {} isn't held by this instance or doesn't exist.",
                    lock_name
                )));
            }
            catalog.commit()
        })
    }

    /// Release everything this instance still holds. Called on shutdown,
    /// which is already the failure path, so errors are swallowed.
    pub fn unlock_all(&mut self) {
        let _ = self.with_rollback(|catalog| {
            let names: Vec<String> = catalog
                .conn
                .prepare_cached("SELECT lock_name FROM locks WHERE host = ? AND process_id = ?")?
                .query_map(params![catalog.host, catalog.process_id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            for lock_name in &names {
                error!("Lock {} not released correctly, releasing it now.", lock_name);
                catalog
                    .conn
                    .prepare_cached(
                        "DELETE FROM locks WHERE lock_name = ? AND host = ? AND process_id = ?",
                    )?
                    .execute(params![lock_name, catalog.host, catalog.process_id])?;
            }
            catalog.commit()
        });
    }

    pub fn lock_version(
        &mut self,
        uid: &VersionUid,
        reason: Option<&str>,
        override_lock: bool,
    ) -> Result<()> {
        self.lock(
            &version_lock_name(uid),
            reason,
            Some(&format!("Version {} is already locked.", uid)),
            override_lock,
        )
    }

    pub fn is_version_locked(&self, uid: &VersionUid) -> Result<bool> {
        self.is_locked(&version_lock_name(uid))
    }

    pub fn update_version_lock(&mut self, uid: &VersionUid, reason: Option<&str>) -> Result<()> {
        self.update_lock(&version_lock_name(uid), reason)
    }

    pub fn unlock_version(&mut self, uid: &VersionUid) -> Result<()> {
        self.unlock(&version_lock_name(uid))
    }

    /// Run `f` under a named lock, releasing it on every exit path. When `f`
    /// succeeds and `unlock` is false the lock is deliberately kept for a
    /// longer-running workflow.
    pub fn with_lock<T>(
        &mut self,
        lock_name: &str,
        reason: Option<&str>,
        locked_msg: Option<&str>,
        unlock: bool,
        override_lock: bool,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.lock(lock_name, reason, locked_msg, override_lock)?;
        match f(self) {
            Ok(value) => {
                if unlock {
                    self.unlock(lock_name)?;
                }
                Ok(value)
            }
            Err(err) => {
                let _ = self.unlock(lock_name);
                Err(err)
            }
        }
    }

    /// [`Catalog::with_lock`] for the per-version lock name.
    pub fn with_version_lock<T>(
        &mut self,
        uid: &VersionUid,
        reason: Option<&str>,
        unlock: bool,
        override_lock: bool,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.lock_version(uid, reason, override_lock)?;
        match f(self) {
            Ok(value) => {
                if unlock {
                    self.unlock_version(uid)?;
                }
                Ok(value)
            }
            Err(err) => {
                let _ = self.unlock_version(uid);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn test_catalog() -> Result<Catalog> {
        let mut catalog = Catalog::open_in_memory()?;
        catalog.init()?;
        Ok(catalog)
    }

    fn shared_catalogs() -> Result<(tempfile::TempDir, Catalog, Catalog)> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_engine: format!("sqlite:{}", dir.path().join("catalog.sqlite").display()),
        };
        let mut first = Catalog::connect(&config)?;
        first.init()?;
        let second = Catalog::open(&config)?;
        Ok((dir, first, second))
    }

    fn uid(n: u64) -> VersionUid {
        VersionUid::from_number(n).unwrap()
    }

    #[test]
    fn test_double_acquire_same_instance_is_a_bug() -> Result<()> {
        let mut catalog = test_catalog()?;
        catalog.lock("backup", Some("nightly"), None, false)?;
        assert!(matches!(
            catalog.lock("backup", Some("nightly"), None, false),
            Err(CatalogError::Internal(_))
        ));
        catalog.unlock("backup")?;
        Ok(())
    }

    #[test]
    fn test_lock_race_between_instances() -> Result<()> {
        let (_dir, mut first, mut second) = shared_catalogs()?;
        first.lock_version(&uid(1), Some("backup"), false)?;
        assert!(second.is_version_locked(&uid(1))?);
        assert!(matches!(
            second.lock_version(&uid(1), Some("backup"), false),
            Err(CatalogError::AlreadyLocked(_))
        ));

        // Override replaces the abandoned row; the new owner can release it.
        second.lock_version(&uid(1), Some("recovery"), true)?;
        second.unlock_version(&uid(1))?;
        assert!(!first.is_version_locked(&uid(1))?);

        // The original holder no longer owns the lock.
        assert!(matches!(
            first.unlock_version(&uid(1)),
            Err(CatalogError::Internal(_))
        ));
        Ok(())
    }

    #[test]
    fn test_update_lock_requires_ownership() -> Result<()> {
        let mut catalog = test_catalog()?;
        assert!(matches!(
            catalog.update_lock("backup", Some("still running")),
            Err(CatalogError::Internal(_))
        ));
        catalog.lock("backup", Some("starting"), None, false)?;
        catalog.update_lock("backup", Some("still running"))?;
        catalog.unlock("backup")?;
        Ok(())
    }

    #[test]
    fn test_with_lock_releases_on_every_exit_path() -> Result<()> {
        let mut catalog = test_catalog()?;

        let value = catalog.with_lock("scrub", None, None, true, false, |_| Ok(17))?;
        assert_eq!(value, 17);
        assert!(!catalog.is_locked("scrub")?);

        let failed: Result<()> = catalog.with_lock("scrub", None, None, true, false, |_| {
            Err(CatalogError::InputData("boom".to_string()))
        });
        assert!(matches!(failed, Err(CatalogError::InputData(_))));
        assert!(!catalog.is_locked("scrub")?);

        // Opting out of release keeps the lock for a longer workflow.
        catalog.with_lock("scrub", None, None, false, false, |_| Ok(()))?;
        assert!(catalog.is_locked("scrub")?);
        catalog.unlock("scrub")?;
        Ok(())
    }

    #[test]
    fn test_unlock_all_releases_only_own_locks() -> Result<()> {
        let (_dir, mut first, mut second) = shared_catalogs()?;
        first.lock("a", None, None, false)?;
        first.lock("b", None, None, false)?;
        second.lock("c", None, None, false)?;

        first.unlock_all();
        assert!(!second.is_locked("a")?);
        assert!(!second.is_locked("b")?);
        assert!(second.is_locked("c")?);
        Ok(())
    }
}
