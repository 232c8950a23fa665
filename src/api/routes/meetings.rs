//! Meeting API endpoints.
//!
//! - `GET /meetings` lists meetings (`?limit=`, `?status=`)
//! - `GET /meetings/:id` returns one meeting with its analysis results
//! - `POST /meetings` registers a manual entry and triggers it immediately
//! - `POST /meetings/:id/cancel` forces a non-terminal meeting to `failed(cancelled)`

use crate::api::error::{ApiError, ApiResult};
use crate::db::{MeetingStore, UpdateOutcome};
use crate::intake::{self, Invitation, Trigger};
use crate::meeting::{validate_meeting_url, AnalysisKind, MeetingStatus};
use crate::scheduler::SchedulerHandle;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Shared state for meeting routes.
#[derive(Clone)]
pub struct MeetingState {
    pub store: Arc<dyn MeetingStore>,
    pub scheduler: SchedulerHandle,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub status: Option<String>,
}

/// Manual meeting entry. The meeting is triggered right away.
#[derive(Debug, Deserialize)]
pub struct CreateMeetingRequest {
    pub meeting_url: String,
    pub owner_email: String,
    pub title: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub owner_name: Option<String>,
    pub owner_company: Option<String>,
    pub owner_role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

pub fn router(state: MeetingState) -> Router {
    Router::new()
        .route("/meetings", get(list_meetings).post(create_meeting))
        .route("/meetings/:id", get(get_meeting))
        .route("/meetings/:id/cancel", post(cancel_meeting))
        .with_state(state)
}

async fn list_meetings(
    Query(params): Query<ListParams>,
    State(state): State<MeetingState>,
) -> ApiResult<Json<Value>> {
    let meetings = match params.status.as_deref() {
        Some(status) => {
            let status = MeetingStatus::parse(status)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            state.store.list_by_status(status).await?
        }
        None => state.store.list(params.limit.unwrap_or(20)).await?,
    };

    let entries: Vec<Value> = meetings
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "title": m.title,
                "url": m.url,
                "status": m.status,
                "scheduled_time": m.scheduled_time,
                "failure": m.failure,
            })
        })
        .collect();

    Ok(Json(json!({ "meetings": entries })))
}

async fn get_meeting(
    Path(id): Path<i64>,
    State(state): State<MeetingState>,
) -> ApiResult<Json<Value>> {
    let meeting = state.store.get(id).await?.ok_or(ApiError::not_found(id))?;
    let analytics = state.store.analysis(id, AnalysisKind::Analytics).await?;
    let insights = state.store.analysis(id, AnalysisKind::Insights).await?;

    Ok(Json(json!({
        "meeting": meeting,
        "analytics": analytics.map(|r| r.payload),
        "insights": insights.map(|r| r.payload),
    })))
}

async fn create_meeting(
    State(state): State<MeetingState>,
    Json(req): Json<CreateMeetingRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate_meeting_url(&req.meeting_url).map_err(|e| ApiError::bad_request(e.to_string()))?;
    if req.owner_email.trim().is_empty() {
        return Err(ApiError::bad_request("owner_email is required"));
    }

    let invitation = Invitation {
        meeting_url: req.meeting_url,
        title: req.title,
        scheduled_time: req.scheduled_time.unwrap_or_else(Utc::now),
        owner_email: req.owner_email,
        owner_name: req.owner_name,
        owner_company: req.owner_company,
        owner_role: req.owner_role,
    };

    let meeting =
        intake::intake(state.store.as_ref(), &state.scheduler, invitation, Trigger::Now).await?;
    info!("Meeting {} registered via API", meeting.id);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "meeting": meeting,
        })),
    ))
}

async fn cancel_meeting(
    Path(id): Path<i64>,
    State(state): State<MeetingState>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<Value>> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "Cancelled by operator".to_string());

    match state.store.cancel(id, &reason).await? {
        UpdateOutcome::Updated => {
            // A meeting still waiting for its trigger never needs to fire.
            state.scheduler.unschedule(id)?;
            info!("Meeting {} cancelled via API", id);
            Ok(Json(json!({
                "success": true,
                "meeting_id": id,
                "message": reason,
            })))
        }
        UpdateOutcome::Conflict { actual } => Err(ApiError::conflict(format!(
            "Meeting {} is already {}",
            id, actual
        ))),
        UpdateOutcome::NotFound => Err(ApiError::not_found(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteMeetingStore;
    use crate::meeting::{FailureStage, NewMeeting};
    use crate::scheduler::{RunTrigger, Scheduler, SchedulerSettings};
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingTrigger {
        fired: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl RunTrigger for RecordingTrigger {
        async fn trigger(&self, meeting_id: i64) {
            self.fired.lock().unwrap().push(meeting_id);
        }
    }

    async fn setup() -> (Arc<SqliteMeetingStore>, Arc<RecordingTrigger>, Scheduler, Router) {
        let store = Arc::new(SqliteMeetingStore::in_memory().unwrap());
        let trigger = Arc::new(RecordingTrigger::default());
        let scheduler = Scheduler::start(store.clone(), trigger.clone(), SchedulerSettings::default())
            .await
            .unwrap();
        let app = router(MeetingState {
            store: store.clone(),
            scheduler: scheduler.handle(),
        });
        (store, trigger, scheduler, app)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_meeting_triggers_immediately() {
        let (store, trigger, scheduler, app) = setup().await;

        let response = app
            .oneshot(post_json(
                "/meetings",
                json!({
                    "meeting_url": "https://zoom.us/j/42",
                    "owner_email": "lee@example.com",
                    "title": "Backend interview",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        let id = body["meeting"]["id"].as_i64().unwrap();
        assert_eq!(body["meeting"]["status"], "scheduled");

        for _ in 0..50 {
            if !trigger.fired.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*trigger.fired.lock().unwrap(), vec![id]);
        assert!(store.get(id).await.unwrap().is_some());

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_meeting_rejects_bad_url() {
        let (_store, _trigger, scheduler, app) = setup().await;

        let response = app
            .oneshot(post_json(
                "/meetings",
                json!({ "meeting_url": "not a url", "owner_email": "lee@example.com" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_and_cancel_meeting() {
        let (store, _trigger, scheduler, app) = setup().await;
        let meeting = store
            .create(NewMeeting {
                owner_hash_key: "owner".to_string(),
                url: "https://zoom.us/j/1".to_string(),
                title: None,
                scheduled_time: Utc::now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/meetings/{}", meeting.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["meeting"]["id"], meeting.id);

        let cancel_uri = format!("/meetings/{}/cancel", meeting.id);
        let response = app
            .clone()
            .oneshot(post_json(&cancel_uri, json!({ "reason": "candidate withdrew" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cancelled = store.get(meeting.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, MeetingStatus::Failed);
        let failure = cancelled.failure.unwrap();
        assert_eq!(failure.stage, FailureStage::Cancelled);
        assert_eq!(failure.message, "candidate withdrew");

        let response = app
            .clone()
            .oneshot(post_json(&cancel_uri, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/meetings/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let (store, _trigger, scheduler, app) = setup().await;
        store
            .create(NewMeeting {
                owner_hash_key: "owner".to_string(),
                url: "https://zoom.us/j/1".to_string(),
                title: None,
                scheduled_time: Utc::now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        let list = |uri: &'static str| {
            let app = app.clone();
            async move {
                let response = app
                    .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                (response.status(), body_json(response).await)
            }
        };

        let (status, body) = list("/meetings?status=scheduled").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meetings"].as_array().unwrap().len(), 1);

        let (_, body) = list("/meetings?status=completed").await;
        assert!(body["meetings"].as_array().unwrap().is_empty());

        let (status, _) = list("/meetings?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        scheduler.stop().await.unwrap();
    }
}
