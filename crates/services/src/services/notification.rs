//! Notification persistence with in-process fan-out as the fallback.

use std::sync::Arc;

use db::models::notification::{
    CreateNotification, Notification, NotificationKind, NotificationSender,
};
use tracing::{debug, info, warn};
use utils::listeners::{ListenerId, ListenerRegistry};
use uuid::Uuid;

use super::{
    database_availability::AvailabilityManager,
    desktop::{DesktopNotifier, NoopNotifier},
    notification_store::NotificationStore,
};

/// Creates, reads and updates user notifications.
///
/// Writes go to the store when one is configured and reachable. Otherwise the
/// record is handed to in-process subscribers instead. None of the operations
/// return errors: failures are logged and mapped to a fallback value.
#[derive(Clone)]
pub struct NotificationService {
    store: Option<Arc<dyn NotificationStore>>,
    availability: Option<AvailabilityManager>,
    desktop: Arc<dyn DesktopNotifier>,
    listeners: Arc<ListenerRegistry<Notification>>,
}

impl NotificationService {
    pub fn new(store: Option<Arc<dyn NotificationStore>>) -> Self {
        Self {
            store,
            availability: None,
            desktop: Arc::new(NoopNotifier),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Consults `availability` before writes and reports write outcomes to it.
    pub fn with_availability(mut self, availability: AvailabilityManager) -> Self {
        self.availability = Some(availability);
        self
    }

    pub fn with_desktop_notifier(mut self, desktop: Arc<dyn DesktopNotifier>) -> Self {
        self.desktop = desktop;
        self
    }

    pub fn is_store_configured(&self) -> bool {
        self.store.is_some()
    }

    /// Returns `true` if the notification was persisted. Otherwise it has been
    /// emitted to local subscribers and `false` is returned.
    pub async fn create_notification(&self, data: CreateNotification) -> bool {
        let notification = Notification::from_create(data);

        self.desktop
            .show(&notification.title, notification.body.as_deref());

        if self.persist(std::slice::from_ref(&notification)).await {
            debug!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                kind = %notification.kind,
                "Notification stored"
            );
            return true;
        }

        self.emit_local(&notification);
        false
    }

    /// Persists every notification in one store call, or emits each locally.
    pub async fn create_bulk(&self, data: Vec<CreateNotification>) -> bool {
        if data.is_empty() {
            return true;
        }
        let notifications: Vec<Notification> =
            data.into_iter().map(Notification::from_create).collect();

        if self.persist(&notifications).await {
            info!(count = notifications.len(), "Bulk notifications stored");
            return true;
        }

        for notification in &notifications {
            self.emit_local(notification);
        }
        false
    }

    pub async fn notify_task_assigned(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        task_title: &str,
        assigned_by: Option<NotificationSender>,
    ) -> bool {
        let mut data =
            CreateNotification::new(user_id, NotificationKind::TaskAssigned, "New task assigned")
                .with_body(format!("You have been assigned to \"{task_title}\""))
                .with_related(task_id);
        data.sender = assigned_by;
        self.create_notification(data).await
    }

    pub async fn notify_new_message(
        &self,
        user_id: Uuid,
        sender: NotificationSender,
        preview: &str,
    ) -> bool {
        let title = format!("New message from {}", sender.name);
        let data = CreateNotification::new(user_id, NotificationKind::Message, title)
            .with_body(preview)
            .with_sender(sender);
        self.create_notification(data).await
    }

    pub async fn notify_system(&self, user_id: Uuid, title: &str, body: &str) -> bool {
        let data =
            CreateNotification::new(user_id, NotificationKind::System, title).with_body(body);
        self.create_notification(data).await
    }

    /// Newest first; empty when the store is missing or failing.
    pub async fn get_notifications(&self, user_id: Uuid, limit: i64) -> Vec<Notification> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        store
            .list_for_user(user_id, limit)
            .await
            .unwrap_or_else(|e| {
                warn!(user_id = %user_id, error = %e, "Failed to load notifications");
                Vec::new()
            })
    }

    pub async fn unread_count(&self, user_id: Uuid) -> i64 {
        let Some(store) = &self.store else {
            return 0;
        };
        store.unread_count(user_id).await.unwrap_or_else(|e| {
            warn!(user_id = %user_id, error = %e, "Failed to count unread notifications");
            0
        })
    }

    pub async fn mark_as_read(&self, notification_id: Uuid) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        store.mark_read(notification_id).await.unwrap_or_else(|e| {
            warn!(
                notification_id = %notification_id,
                error = %e,
                "Failed to mark notification read"
            );
            false
        })
    }

    pub async fn mark_all_as_read(&self, user_id: Uuid) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.mark_all_read(user_id).await {
            Ok(updated) => {
                debug!(user_id = %user_id, updated, "Marked notifications read");
                true
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to mark all notifications read");
                false
            }
        }
    }

    pub async fn delete_notification(&self, notification_id: Uuid) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        store.delete(notification_id).await.unwrap_or_else(|e| {
            warn!(
                notification_id = %notification_id,
                error = %e,
                "Failed to delete notification"
            );
            false
        })
    }

    /// Registers `listener` for notifications that could not be persisted.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn persist(&self, notifications: &[Notification]) -> bool {
        let Some(store) = &self.store else {
            debug!("No notification store configured, using local fan-out");
            return false;
        };

        if let Some(availability) = &self.availability {
            if !availability.is_available().await {
                debug!("Notification store unavailable, using local fan-out");
                return false;
            }
        }

        match store.insert(notifications).await {
            Ok(()) => {
                if let Some(availability) = &self.availability {
                    availability.mark_available();
                }
                true
            }
            Err(e) => {
                warn!(
                    count = notifications.len(),
                    error = %e,
                    "Failed to store notifications, falling back to local fan-out"
                );
                if let Some(availability) = &self.availability {
                    availability.mark_unavailable(e.to_string());
                }
                false
            }
        }
    }

    fn emit_local(&self, notification: &Notification) {
        let delivered = self.listeners.emit(notification);
        debug!(
            notification_id = %notification.id,
            listeners = delivered,
            "Notification emitted locally"
        );
    }
}
