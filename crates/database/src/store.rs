use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::SlotRow;
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use sqlx::SqlitePool;
use stash_storage::error::{ErrorKind as StorageErrorKind, Result as StorageResult};
use stash_storage::{ByteStore, FileId, Slot};
use time::UtcDateTime;

/// A [`ByteStore`] persisted in one SQLite table.
///
/// Enumeration order comes from a database-wide write sequence, so
/// [`list_ids()`](ByteStore::list_ids) is newest-first even when two writes
/// land in the same clock tick.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
}
impl SqliteStore {
    pub fn new(db: &Database, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: db.pool().clone(),
        }
    }

    async fn get_inner(&self, id: &FileId) -> Result<Option<Slot>> {
        let row: Option<SlotRow> = sqlx::query_as(include_str!("../queries/get_slot.sql"))
            .bind(&self.name)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Slot::try_from).transpose()
    }

    async fn set_inner(&self, id: &FileId, slot: &Slot) -> Result<()> {
        let blob = slot.blob();
        sqlx::query(include_str!("../queries/upsert_slot.sql"))
            .bind(&self.name)
            .bind(id.as_str())
            .bind(blob.map(|b| b.mime_type.as_str()))
            .bind(blob.map(|b| b.bytes.as_slice()))
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn delete_inner(&self, id: &FileId) -> Result<()> {
        sqlx::query(include_str!("../queries/delete_slot.sql"))
            .bind(&self.name)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn list_inner(&self) -> Result<Vec<FileId>> {
        let rows: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_ids.sql"))
            .bind(&self.name)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter()
            .map(|id| FileId::new(id).ok().ok_or_raise(|| ErrorKind::InvalidData("file id")))
            .collect()
    }

    async fn reset_inner(&self) -> Result<()> {
        sqlx::query(include_str!("../queries/reset_store.sql"))
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    async fn contains_inner(&self, id: &FileId) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(include_str!("../queries/contains_slot.sql"))
            .bind(&self.name)
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    fn backend_error(&self) -> impl FnOnce() -> StorageErrorKind + '_ {
        || StorageErrorKind::BackendError(format!("sqlite store {}", self.name))
    }
}

#[async_trait]
impl ByteStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &FileId) -> StorageResult<Option<Slot>> {
        self.get_inner(id).await.or_raise(self.backend_error())
    }

    async fn set(&self, id: &FileId, slot: Slot) -> StorageResult<Slot> {
        self.set_inner(id, &slot).await.or_raise(self.backend_error())?;
        Ok(slot)
    }

    async fn delete(&self, id: &FileId) -> StorageResult<()> {
        self.delete_inner(id).await.or_raise(self.backend_error())
    }

    async fn list_ids(&self) -> StorageResult<Vec<FileId>> {
        self.list_inner().await.or_raise(self.backend_error())
    }

    async fn reset(&self) -> StorageResult<()> {
        self.reset_inner().await.or_raise(self.backend_error())
    }

    async fn contains(&self, id: &FileId) -> StorageResult<bool> {
        self.contains_inner(id).await.or_raise(self.backend_error())
    }
}
