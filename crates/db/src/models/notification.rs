use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// What a notification is about
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString, Display)]
#[sqlx(type_name = "notification_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    TaskAssigned,
    TaskCompleted,
    TaskDue,
    ProjectUpdate,
    Comment,
    Like,
    Follow,
    Message,
    System,
}

/// Who triggered the notification, for display next to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
pub struct NotificationSender {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, TS)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid, // Recipient
    pub kind: NotificationKind,
    pub title: String,
    pub body: Option<String>,
    pub related_id: Option<Uuid>, // Project, task or post the notification points at
    pub sender_id: Option<Uuid>,
    pub sender_name: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: Option<String>,
    pub related_id: Option<Uuid>,
    pub sender: Option<NotificationSender>,
}

impl CreateNotification {
    pub fn new(user_id: Uuid, kind: NotificationKind, title: impl Into<String>) -> Self {
        Self {
            user_id,
            kind,
            title: title.into(),
            body: None,
            related_id: None,
            sender: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_related(mut self, related_id: Uuid) -> Self {
        self.related_id = Some(related_id);
        self
    }

    pub fn with_sender(mut self, sender: NotificationSender) -> Self {
        self.sender = Some(sender);
        self
    }
}

impl Notification {
    /// Builds the record that will be stored or emitted; id and timestamp are fixed here.
    pub fn from_create(data: CreateNotification) -> Self {
        let (sender_id, sender_name, sender_avatar_url) = match data.sender {
            Some(sender) => (Some(sender.id), Some(sender.name), sender.avatar_url),
            None => (None, None, None),
        };
        Self {
            id: Uuid::new_v4(),
            user_id: data.user_id,
            kind: data.kind,
            title: data.title,
            body: data.body,
            related_id: data.related_id,
            sender_id,
            sender_name,
            sender_avatar_url,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    pub async fn insert<'e, E>(executor: E, notification: &Notification) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"INSERT INTO notifications
                (id, user_id, kind, title, body, related_id, sender_id, sender_name,
                 sender_avatar_url, is_read, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(notification.kind)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.related_id)
        .bind(notification.sender_id)
        .bind(&notification.sender_name)
        .bind(&notification.sender_avatar_url)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Inserts all rows in one transaction; either every row lands or none does.
    pub async fn insert_many(
        pool: &SqlitePool,
        notifications: &[Notification],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for notification in notifications {
            Self::insert(&mut *tx, notification).await?;
        }
        tx.commit().await
    }

    /// Newest first.
    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Notification>(
            r#"SELECT id, user_id, kind, title, body, related_id, sender_id, sender_name,
                      sender_avatar_url, is_read, created_at
               FROM notifications
               WHERE user_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn count_unread(pool: &SqlitePool, user_id: Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = 0",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
    }

    /// Returns whether a row was updated.
    pub async fn mark_read(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the number of notifications that changed from unread to read.
    pub async fn mark_all_read(pool: &SqlitePool, user_id: Uuid) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = $1 AND is_read = 0")
                .bind(user_id)
                .execute(pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
