//! Remote persistence seam for notifications.

use async_trait::async_trait;
use db::{DBService, models::notification::Notification};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotificationStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Table-level CRUD the notification service needs from a backing store
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Inserts all records in a single call; all or nothing.
    async fn insert(&self, notifications: &[Notification]) -> Result<(), NotificationStoreError>;

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, NotificationStoreError>;

    async fn unread_count(&self, user_id: Uuid) -> Result<i64, NotificationStoreError>;

    async fn mark_read(&self, id: Uuid) -> Result<bool, NotificationStoreError>;

    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, NotificationStoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, NotificationStoreError>;
}

#[async_trait]
impl NotificationStore for DBService {
    async fn insert(&self, notifications: &[Notification]) -> Result<(), NotificationStoreError> {
        match notifications {
            [] => Ok(()),
            [single] => Ok(Notification::insert(&self.pool, single).await?),
            many => Ok(Notification::insert_many(&self.pool, many).await?),
        }
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, NotificationStoreError> {
        Ok(Notification::find_by_user_id(&self.pool, user_id, limit).await?)
    }

    async fn unread_count(&self, user_id: Uuid) -> Result<i64, NotificationStoreError> {
        Ok(Notification::count_unread(&self.pool, user_id).await?)
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, NotificationStoreError> {
        Ok(Notification::mark_read(&self.pool, id).await?)
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, NotificationStoreError> {
        Ok(Notification::mark_all_read(&self.pool, user_id).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, NotificationStoreError> {
        Ok(Notification::delete(&self.pool, id).await?)
    }
}
