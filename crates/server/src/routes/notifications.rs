//! Routes for user notifications.

use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{
        Json as ResponseJson,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use db::models::notification::{CreateNotification, Notification};
use serde::{Deserialize, Serialize};
use services::services::notification::NotificationService;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, wrappers::UnboundedReceiverStream};
use tracing::debug;
use ts_rs::TS;
use utils::{listeners::ListenerId, response::ApiResponse};
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

/// Whether the notification reached the store (`false` means local delivery only)
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateNotificationResponse {
    pub persisted: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

fn validate(payload: &CreateNotification) -> Result<(), ApiError> {
    if payload.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    Ok(())
}

fn require_store(deployment: &DeploymentImpl) -> Result<&NotificationService, ApiError> {
    let notifications = deployment.notifications();
    if !notifications.is_store_configured() {
        return Err(ApiError::StoreNotConfigured);
    }
    Ok(notifications)
}

/// POST /api/notifications
pub async fn create_notification(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateNotification>,
) -> Result<ResponseJson<ApiResponse<CreateNotificationResponse>>, ApiError> {
    validate(&payload)?;
    let persisted = deployment.notifications().create_notification(payload).await;
    Ok(ResponseJson(ApiResponse::success(CreateNotificationResponse {
        persisted,
    })))
}

/// POST /api/notifications/bulk
pub async fn create_bulk(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<Vec<CreateNotification>>,
) -> Result<ResponseJson<ApiResponse<CreateNotificationResponse>>, ApiError> {
    payload.iter().try_for_each(validate)?;
    let persisted = deployment.notifications().create_bulk(payload).await;
    Ok(ResponseJson(ApiResponse::success(CreateNotificationResponse {
        persisted,
    })))
}

/// POST /api/notifications/{notification_id}/read
pub async fn mark_read(
    State(deployment): State<DeploymentImpl>,
    Path(notification_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<bool>>, ApiError> {
    let updated = require_store(&deployment)?
        .mark_as_read(notification_id)
        .await;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

/// DELETE /api/notifications/{notification_id}
pub async fn delete_notification(
    State(deployment): State<DeploymentImpl>,
    Path(notification_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<bool>>, ApiError> {
    let deleted = require_store(&deployment)?
        .delete_notification(notification_id)
        .await;
    Ok(ResponseJson(ApiResponse::success(deleted)))
}

/// GET /api/users/{user_id}/notifications?limit=N
pub async fn list_notifications(
    State(deployment): State<DeploymentImpl>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Notification>>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    let notifications = require_store(&deployment)?
        .get_notifications(user_id, limit)
        .await;
    Ok(ResponseJson(ApiResponse::success(notifications)))
}

/// GET /api/users/{user_id}/notifications/unread-count
pub async fn unread_count(
    State(deployment): State<DeploymentImpl>,
    Path(user_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<i64>>, ApiError> {
    let count = require_store(&deployment)?.unread_count(user_id).await;
    Ok(ResponseJson(ApiResponse::success(count)))
}

/// POST /api/users/{user_id}/notifications/read-all
pub async fn mark_all_read(
    State(deployment): State<DeploymentImpl>,
    Path(user_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<bool>>, ApiError> {
    let updated = require_store(&deployment)?.mark_all_as_read(user_id).await;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

/// Removes the listener when the SSE client goes away.
struct StreamSubscription {
    service: NotificationService,
    id: ListenerId,
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.service.unsubscribe(self.id);
        debug!(
            remaining = self.service.listener_count(),
            "Notification stream closed"
        );
    }
}

/// GET /api/users/{user_id}/notifications/stream
/// Notifications for this user that were delivered in-process instead of stored
pub async fn stream_notifications(
    State(deployment): State<DeploymentImpl>,
    Path(user_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let service = deployment.notifications().clone();
    let id = service.subscribe(move |notification: &Notification| {
        if notification.user_id == user_id {
            let _ = tx.send(notification.clone());
        }
    });
    let subscription = StreamSubscription { service, id };

    let stream = UnboundedReceiverStream::new(rx).map(move |notification| {
        let _subscription = &subscription;
        Ok(notification_event(&notification))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn notification_event(notification: &Notification) -> Event {
    Event::default()
        .event("notification")
        .json_data(notification)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .nest(
            "/notifications",
            Router::new()
                .route("/", post(create_notification))
                .route("/bulk", post(create_bulk))
                .route("/{notification_id}", delete(delete_notification))
                .route("/{notification_id}/read", post(mark_read)),
        )
        .nest(
            "/users/{user_id}/notifications",
            Router::new()
                .route("/", get(list_notifications))
                .route("/unread-count", get(unread_count))
                .route("/read-all", post(mark_all_read))
                .route("/stream", get(stream_notifications)),
        )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use db::{DBService, models::notification::NotificationKind};
    use serde_json::{Value, json};
    use services::services::config::Config;
    use tower::ServiceExt;

    use super::*;
    use crate::routes;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.notifications.desktop_enabled = false;
        config
    }

    async fn with_store() -> DeploymentImpl {
        let db = DBService::new_in_memory().await.unwrap();
        DeploymentImpl::from_parts(test_config(), Some(db))
    }

    fn without_store() -> DeploymentImpl {
        DeploymentImpl::from_parts(
            Config {
                database_url: None,
                ..test_config()
            },
            None,
        )
    }

    async fn send(deployment: &DeploymentImpl, request: Request<Body>) -> (StatusCode, Value) {
        let response = routes::router(deployment.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_list_and_count() {
        let deployment = with_store().await;
        let user_id = Uuid::new_v4();

        let (status, body) = send(
            &deployment,
            post_json(
                "/api/notifications",
                json!({
                    "user_id": user_id,
                    "kind": "task_completed",
                    "title": "Task done",
                    "body": null,
                    "related_id": null,
                    "sender": null
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["persisted"], json!(true));

        let (_, body) = send(
            &deployment,
            get_request(&format!("/api/users/{user_id}/notifications")),
        )
        .await;
        let list = body["data"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["kind"], json!("task_completed"));

        let (_, body) = send(
            &deployment,
            get_request(&format!("/api/users/{user_id}/notifications/unread-count")),
        )
        .await;
        assert_eq!(body["data"], json!(1));
    }

    #[tokio::test]
    async fn test_empty_title_is_rejected() {
        let deployment = with_store().await;
        let payload = serde_json::to_value(CreateNotification::new(
            Uuid::new_v4(),
            NotificationKind::System,
            "  ",
        ))
        .unwrap();

        let (status, body) = send(&deployment, post_json("/api/notifications", payload)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn test_limit_out_of_range() {
        let deployment = with_store().await;
        let (status, _) = send(
            &deployment,
            get_request(&format!("/api/users/{}/notifications?limit=0", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_without_store_writes_fall_back_and_reads_are_unavailable() {
        let deployment = without_store();
        let user_id = Uuid::new_v4();
        let payload = serde_json::to_value(CreateNotification::new(
            user_id,
            NotificationKind::Follow,
            "New follower",
        ))
        .unwrap();

        let (status, body) = send(&deployment, post_json("/api/notifications", payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["persisted"], json!(false));

        let (status, _) = send(
            &deployment,
            get_request(&format!("/api/users/{user_id}/notifications")),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = send(&deployment, get_request("/api/health/database")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_database_health_reports_available() {
        let deployment = with_store().await;

        let (status, body) = send(&deployment, get_request("/api/health/database")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], json!("available"));

        let (status, body) = send(
            &deployment,
            Request::builder()
                .method("POST")
                .uri("/api/health/database/check")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["last_error"], Value::Null);
    }

    #[tokio::test]
    async fn test_stream_delivers_only_this_users_fallback_notifications() {
        let deployment = without_store();
        let notifications = deployment.notifications().clone();
        let user_id = Uuid::new_v4();

        let response = routes::router(deployment.clone())
            .oneshot(get_request(&format!(
                "/api/users/{user_id}/notifications/stream"
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(notifications.listener_count(), 1);

        notifications
            .notify_system(Uuid::new_v4(), "Someone else", "")
            .await;
        notifications
            .notify_system(user_id, "Deploy finished", "")
            .await;

        let mut body = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("event before timeout")
            .expect("stream still open")
            .unwrap();
        let frame = String::from_utf8(frame.to_vec()).unwrap();
        assert!(frame.starts_with("event: notification\n"), "{frame}");
        assert!(frame.contains("Deploy finished"), "{frame}");
        assert!(!frame.contains("Someone else"), "{frame}");

        drop(body);
        assert_eq!(notifications.listener_count(), 0);
    }
}
