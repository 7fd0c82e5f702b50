//! In-memory registry of migration records.
//!
//! Each record sits behind its own mutex so the workflow task and readers
//! polling progress never overwrite each other's changes. All mutation goes
//! through [`MigrationStore::update`], which holds only that record's lock
//! for the duration of the closure.

use crate::model::MigrationRecord;
use crate::FerryError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type RecordHandle = Arc<Mutex<MigrationRecord>>;

#[derive(Default)]
pub struct MigrationStore {
    records: RwLock<HashMap<String, RecordHandle>>,
    /// Target device -> id of the running migration that holds it.
    reservations: Mutex<HashMap<String, String>>,
}

impl MigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any record with the same id.
    pub async fn put(&self, record: MigrationRecord) {
        let existing = self.records.read().await.get(&record.migration_id).cloned();
        match existing {
            Some(handle) => *handle.lock().await = record,
            None => {
                self.records
                    .write()
                    .await
                    .insert(record.migration_id.clone(), Arc::new(Mutex::new(record)));
            }
        }
    }

    /// Insert a record whose id must not be in use yet.
    pub async fn insert_new(&self, record: MigrationRecord) -> Result<(), FerryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.migration_id) {
            return Err(FerryError::DuplicateId(record.migration_id));
        }
        records.insert(record.migration_id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.contains_key(id)
    }

    /// Snapshot of one record.
    pub async fn get(&self, id: &str) -> Option<MigrationRecord> {
        let handle = self.records.read().await.get(id).cloned()?;
        let record = handle.lock().await.clone();
        Some(record)
    }

    /// Snapshots of every record, ordered by id.
    pub async fn list(&self) -> Vec<MigrationRecord> {
        let handles: Vec<RecordHandle> = self.records.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.lock().await.clone());
        }
        records.sort_by(|a, b| a.migration_id.cmp(&b.migration_id));
        records
    }

    /// Read-modify-write under the record's lock.
    pub async fn update<T, F>(&self, id: &str, f: F) -> Result<T, FerryError>
    where
        F: FnOnce(&mut MigrationRecord) -> T,
    {
        let handle = self
            .records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FerryError::NotFound(id.to_string()))?;
        let mut record = handle.lock().await;
        Ok(f(&mut record))
    }

    pub async fn remove(&self, id: &str) -> Option<MigrationRecord> {
        let handle = self.records.write().await.remove(id)?;
        self.release_targets(id).await;
        let record = handle.lock().await.clone();
        Some(record)
    }

    /// Claim `devices` for migration `id`. Fails without claiming anything
    /// if another migration holds one of them.
    pub async fn reserve_targets(&self, id: &str, devices: &[String]) -> Result<(), FerryError> {
        let mut reservations = self.reservations.lock().await;
        for device in devices {
            if let Some(holder) = reservations.get(device) {
                if holder != id {
                    return Err(FerryError::TargetInUse {
                        device: device.clone(),
                        migration_id: holder.clone(),
                    });
                }
            }
        }
        for device in devices {
            reservations.insert(device.clone(), id.to_string());
        }
        Ok(())
    }

    pub async fn release_targets(&self, id: &str) {
        self.reservations
            .lock()
            .await
            .retain(|_, holder| holder != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationStatus;

    fn record(id: &str) -> MigrationRecord {
        MigrationRecord::new(id, "/dev/sdb1", vec!["/dev/sdc1".to_string()])
    }

    #[tokio::test]
    async fn test_insert_get_list() {
        let store = MigrationStore::new();
        store.insert_new(record("b")).await.unwrap();
        store.insert_new(record("a")).await.unwrap();

        assert!(matches!(
            store.insert_new(record("a")).await,
            Err(FerryError::DuplicateId(_))
        ));
        assert_eq!(store.get("a").await.unwrap().migration_id, "a");
        let ids: Vec<_> = store.list().await.into_iter().map(|r| r.migration_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let store = MigrationStore::new();
        let result = store.update("missing", |r| r.files_migrated).await;
        assert!(matches!(result, Err(FerryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_put_replaces_in_place() {
        let store = MigrationStore::new();
        store.put(record("a")).await;
        let mut changed = record("a");
        changed.transition(MigrationStatus::Analyzing).unwrap();
        store.put(changed).await;
        assert_eq!(store.get("a").await.unwrap().status, MigrationStatus::Analyzing);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MigrationStore::new());
        let mut r = record("a");
        r.set_totals(1000, 0);
        store.put(r).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store
                        .update("a", |r| {
                            let next = r.files_migrated + 1;
                            r.record_files_done(next);
                        })
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.get("a").await.unwrap().files_migrated, 500);
    }

    #[tokio::test]
    async fn test_target_reservations() {
        let store = MigrationStore::new();
        let sdc = vec!["/dev/sdc1".to_string()];
        store.reserve_targets("a", &sdc).await.unwrap();
        store.reserve_targets("a", &sdc).await.unwrap();

        let err = store
            .reserve_targets("b", &["/dev/sdd1".to_string(), "/dev/sdc1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, FerryError::TargetInUse { ref migration_id, .. } if migration_id == "a"));

        // The failed claim must not have taken sdd1.
        store.reserve_targets("c", &["/dev/sdd1".to_string()]).await.unwrap();

        store.release_targets("a").await;
        store.reserve_targets("b", &sdc).await.unwrap();
    }
}
