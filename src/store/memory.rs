//! In-Memory Repository
//!
//! Reference implementation of the persistence port. Rows live in an ordered
//! map behind a `parking_lot` lock and ids are handed out monotonically, so
//! "latest by parent" is simply the highest id.

use crate::domain::model::{Entity, EntityId};
use crate::domain::ports::{Repository, RowEdit};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Repository backed by a `BTreeMap`
pub struct MemoryRepository<T: Entity> {
    rows: RwLock<BTreeMap<EntityId, T>>,
    next_id: AtomicU64,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn create(&self, mut entity: T) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entity.set_id(id);
        self.rows.write().insert(id, entity.clone());
        Ok(entity)
    }

    async fn get(&self, id: EntityId) -> Result<Option<T>> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn update(&self, entity: T) -> Result<T> {
        let mut rows = self.rows.write();
        match rows.get_mut(&entity.id()) {
            Some(row) => {
                *row = entity.clone();
                Ok(entity)
            }
            None => Err(Error::not_found(T::KIND, entity.id())),
        }
    }

    async fn modify(&self, id: EntityId, edit: RowEdit<T>) -> Result<T> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(T::KIND, id))?;
        edit(row);
        Ok(row.clone())
    }

    async fn delete(&self, id: EntityId) -> Result<bool> {
        Ok(self.rows.write().remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.rows.read().values().cloned().collect())
    }

    async fn list_by_parent(&self, parent_id: EntityId) -> Result<Vec<T>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.parent_id() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn latest_by_parent(&self, parent_id: EntityId) -> Result<Option<T>> {
        Ok(self
            .rows
            .read()
            .values()
            .rev()
            .find(|row| row.parent_id() == Some(parent_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Disk, ShareUsage};
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn usage(share_id: EntityId, referenced: u64) -> ShareUsage {
        ShareUsage {
            id: 0,
            share_id,
            referenced_bytes: referenced,
            exclusive_bytes: 0,
            count: 1,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let repo = MemoryRepository::<Disk>::new();
        let a = repo.create(Disk::new("sdb", "A")).await.unwrap();
        let b = repo.create(Disk::new("sdc", "B")).await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.get(a.id).await.unwrap().unwrap().name, "sdb");
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let repo = MemoryRepository::<Disk>::new();
        let mut disk = Disk::new("sdb", "A");
        disk.id = 42;
        let err = repo.update(disk).await.unwrap_err();
        assert_matches!(err, Error::NotFound { .. });
        assert_matches!(repo.require(42).await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_modify_touches_only_edited_fields() {
        let repo = MemoryRepository::<Disk>::new();
        let disk = repo.create(Disk::new("sdb", "A")).await.unwrap();

        let mut owned = disk.clone();
        owned.pool_id = Some(3);
        repo.update(owned).await.unwrap();

        let edited = repo
            .modify(disk.id, Box::new(|d: &mut Disk| d.allocated_bytes = 4096))
            .await
            .unwrap();
        assert_eq!(edited.allocated_bytes, 4096);
        assert_eq!(edited.pool_id, Some(3));

        let err = repo.modify(99, Box::new(|_: &mut Disk| {})).await.unwrap_err();
        assert_matches!(err, Error::NotFound { .. });
    }

    #[tokio::test]
    async fn test_list_and_latest_by_parent() {
        let repo = MemoryRepository::<ShareUsage>::new();
        repo.create(usage(1, 10)).await.unwrap();
        repo.create(usage(2, 20)).await.unwrap();
        repo.create(usage(1, 30)).await.unwrap();

        let rows = repo.list_by_parent(1).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            repo.latest_by_parent(1).await.unwrap().unwrap().referenced_bytes,
            30
        );
        assert!(repo.latest_by_parent(3).await.unwrap().is_none());

        assert!(repo.delete(rows[0].id).await.unwrap());
        assert!(!repo.delete(rows[0].id).await.unwrap());
    }
}
