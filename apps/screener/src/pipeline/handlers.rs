use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::AppError;
use crate::pipeline::item::WorkItem;
use crate::pipeline::manager::{Submission, SubmissionReceipt};
use crate::pipeline::orchestrator::ForceDispatchReport;
use crate::pipeline::settings::{EngineSettings, SettingsUpdate};
use crate::pipeline::status::{BatchProgress, EngineStatus, ItemDetail};
use crate::pipeline::timeout_policy::ModelClass;
use crate::state::AppState;

/// One document. `id` wins over `filename`; one of them is required.
#[derive(Deserialize)]
pub struct DocumentInput {
    pub id: Option<String>,
    pub filename: Option<String>,
    pub text: String,
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub documents: Vec<DocumentInput>,
}

fn to_submission(doc: DocumentInput) -> Result<Submission, AppError> {
    let id = match (doc.id, doc.filename) {
        (Some(id), _) if !id.trim().is_empty() => id.trim().to_string(),
        (_, Some(name)) if !name.trim().is_empty() => WorkItem::id_from_filename(&name),
        _ => {
            return Err(AppError::Validation(
                "every document needs an id or a filename".to_string(),
            ))
        }
    };
    Ok(Submission {
        id,
        payload: doc.text,
    })
}

/// POST /api/v1/batches
pub async fn handle_submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmissionReceipt>), AppError> {
    if req.documents.is_empty() {
        return Err(AppError::Validation("no documents submitted".to_string()));
    }
    let submissions = req
        .documents
        .into_iter()
        .map(to_submission)
        .collect::<Result<Vec<_>, _>>()?;
    let receipt = state.queues().submit(submissions).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// GET /api/v1/batches/:batch_id
pub async fn handle_batch_progress(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchProgress>, AppError> {
    state
        .queues()
        .batch_progress(batch_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Batch {batch_id} not found")))
}

/// GET /api/v1/status
/// Queue counts plus what the scheduler is doing.
pub async fn handle_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status().await)
}

/// GET /api/v1/items/:id
pub async fn handle_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ItemDetail>, AppError> {
    state
        .queues()
        .item(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Item {id} not found")))
}

/// GET /api/v1/items/:id/result
pub async fn handle_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(state.queues().result(&id).await?))
}

#[derive(Serialize)]
pub struct ConsumedResult {
    pub id: String,
    pub batch_id: Uuid,
    pub quality_score: Option<f32>,
    pub quality_issues: Vec<String>,
    pub result: Value,
}

/// DELETE /api/v1/items/:id/result
pub async fn handle_take_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConsumedResult>, AppError> {
    let item = state.queues().take_result(&id).await?;
    Ok(Json(ConsumedResult {
        id: item.id,
        batch_id: item.batch_id,
        quality_score: item.quality_score,
        quality_issues: item.quality_issues,
        result: item.result.unwrap_or(Value::Null),
    }))
}

/// POST /api/v1/items/:id/retry
pub async fn handle_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ItemDetail>, AppError> {
    state.queues().manual_retry(&id).await?;
    state
        .queues()
        .item(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Item {id} not found")))
}

#[derive(Deserialize)]
pub struct DispatchRequest {
    pub ids: Vec<String>,
}

/// POST /api/v1/dispatch
pub async fn handle_dispatch(
    State(state): State<AppState>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<ForceDispatchReport>, AppError> {
    if req.ids.is_empty() {
        return Err(AppError::Validation("no ids to dispatch".to_string()));
    }
    Ok(Json(state.engine.force_dispatch(&req.ids).await))
}

#[derive(Serialize)]
pub struct EngineConfigResponse {
    pub model: String,
    pub model_class: ModelClass,
    pub settings: EngineSettings,
}

async fn engine_config(state: &AppState) -> EngineConfigResponse {
    EngineConfigResponse {
        model: state.engine.model_id().to_string(),
        model_class: state.engine.model_class(),
        settings: state.engine.settings().await,
    }
}

/// GET /api/v1/engine/config
pub async fn handle_get_config(State(state): State<AppState>) -> Json<EngineConfigResponse> {
    Json(engine_config(&state).await)
}

/// PATCH /api/v1/engine/config
pub async fn handle_update_config(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<EngineConfigResponse>, AppError> {
    state.engine.update_settings(update).await?;
    Ok(Json(engine_config(&state).await))
}

/// POST /api/v1/engine/pause
pub async fn handle_pause(State(state): State<AppState>) -> Json<EngineStatus> {
    state.engine.pause();
    Json(state.engine.status().await)
}

/// POST /api/v1/engine/resume
pub async fn handle_resume(State(state): State<AppState>) -> Json<EngineStatus> {
    state.engine.resume();
    Json(state.engine.status().await)
}

/// POST /api/v1/session/reset
pub async fn handle_reset(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.queues().reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::backoff::RetryPolicies;
    use crate::pipeline::classifier::ResponseClassifier;
    use crate::pipeline::client::tests::ScriptedClient;
    use crate::pipeline::manager::tests::FlakyStore;
    use crate::pipeline::manager::RetryQueueManager;
    use crate::pipeline::settings::LowQualityPolicy;
    use crate::pipeline::Orchestrator;
    use crate::routes::build_router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_with_store(store: Arc<FlakyStore>) -> (Router, AppState) {
        let manager = Arc::new(RetryQueueManager::open(store, RetryPolicies::default()).unwrap());
        let engine = Arc::new(Orchestrator::new(
            manager,
            Arc::new(ScriptedClient::new("claude-sonnet-4-5")),
            ResponseClassifier::new(4.0),
            LowQualityPolicy::Retry,
            None,
            EngineSettings::default(),
            Duration::from_secs(1),
        ));
        let state = AppState::new(engine);
        (build_router(state.clone()), state)
    }

    fn app() -> (Router, AppState) {
        app_with_store(Arc::new(FlakyStore::default()))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn batch(docs: Value) -> Option<Value> {
        Some(serde_json::json!({ "documents": docs }))
    }

    async fn submit_one(app: &Router, id: &str) {
        let docs = serde_json::json!([{"id": id, "text": "x"}]);
        let (status, _) = send(app, "POST", "/api/v1/batches", batch(docs)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_submit_then_poll_status_and_item() {
        let (app, _) = app();
        let (status, receipt) = send(
            &app,
            "POST",
            "/api/v1/batches",
            batch(serde_json::json!([
                {"filename": "Jane Doe 123 RESUME.pdf", "text": "Rust, storage"},
                {"id": "cand-2", "text": "Go, networking"}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            receipt["accepted"],
            serde_json::json!(["Jane_Doe_123_RESUME_pdf", "cand-2"])
        );

        let (status, snap) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snap["total"], 2);
        assert_eq!(snap["in_quick_retry"], 2);
        assert_eq!(snap["scheduler"], "processing");

        let (status, item) = send(&app, "GET", "/api/v1/items/cand-2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["queue"], "quick_retry");
        assert_eq!(item["attempts"], 0);
        assert!(item.get("payload").is_none());

        let batch_id = receipt["batch_id"].as_str().unwrap();
        let uri = format!("/api/v1/batches/{batch_id}");
        let (status, progress) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["pending"], 2);
        assert_eq!(progress["complete"], false);
    }

    #[tokio::test]
    async fn test_resubmitted_ids_are_skipped() {
        let (app, _) = app();
        let docs = serde_json::json!([{"id": "a", "text": "x"}]);
        send(&app, "POST", "/api/v1/batches", batch(docs.clone())).await;
        let (status, receipt) = send(&app, "POST", "/api/v1/batches", batch(docs)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(receipt["accepted"], serde_json::json!([]));
        assert_eq!(receipt["skipped"], serde_json::json!(["a"]));
    }

    #[tokio::test]
    async fn test_submit_validation_errors() {
        let (app, _) = app();
        let (status, body) =
            send(&app, "POST", "/api/v1/batches", batch(serde_json::json!([]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/batches",
            batch(serde_json::json!([{"text": "anonymous"}])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let (app, _) = app();
        for uri in [
            "/api/v1/items/ghost".to_string(),
            "/api/v1/items/ghost/result".to_string(),
            format!("/api/v1/batches/{}", Uuid::new_v4()),
        ] {
            let (status, body) = send(&app, "GET", &uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["error"]["code"], "NOT_FOUND");
        }
        let (status, _) = send(&app, "POST", "/api/v1/items/ghost/retry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_of_queued_item_conflicts() {
        let (app, _) = app();
        submit_one(&app, "a").await;
        let (status, body) = send(&app, "POST", "/api/v1/items/a/retry", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");

        let (status, _) = send(&app, "GET", "/api/v1/items/a/result", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_result_read_and_consume() {
        let (app, state) = app();
        submit_one(&app, "a").await;
        let queues = state.queues();
        queues.claim_ready(chrono::Utc::now(), 1, 1, 3).await.unwrap();
        queues
            .complete(
                "a",
                crate::pipeline::queues::Completion::Accepted {
                    record: serde_json::json!({"nickname": "Ledger Whisperer"}),
                    quality_score: 9.0,
                    issues: vec![],
                },
                chrono::Utc::now(),
                3,
            )
            .await
            .unwrap();

        let (status, result) = send(&app, "GET", "/api/v1/items/a/result", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["nickname"], "Ledger Whisperer");

        let (status, consumed) = send(&app, "DELETE", "/api/v1/items/a/result", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(consumed["result"]["nickname"], "Ledger Whisperer");

        let (_, snap) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(snap["processed_ok"], 1);
        assert_eq!(snap["progress_percent"], 100);
    }

    #[tokio::test]
    async fn test_config_read_and_update() {
        let (app, _) = app();
        let (status, config) = send(&app, "GET", "/api/v1/engine/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(config["model"], "claude-sonnet-4-5");
        assert_eq!(config["model_class"], "fast");
        assert_eq!(config["settings"]["max_retries"], 3);

        let (status, config) = send(
            &app,
            "PATCH",
            "/api/v1/engine/config",
            Some(serde_json::json!({"max_retries": 5, "concurrency_limit": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(config["settings"]["max_retries"], 5);
        assert_eq!(config["settings"]["concurrency_limit"], 4);

        let (status, _) = send(
            &app,
            "PATCH",
            "/api/v1/engine/config",
            Some(serde_json::json!({"batch_size": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dispatch_reports_rejections() {
        let (app, _) = app();
        let (status, report) = send(
            &app,
            "POST",
            "/api/v1/dispatch",
            Some(serde_json::json!({"ids": ["ghost"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["dispatched"], serde_json::json!([]));
        assert_eq!(report["rejected"][0]["id"], "ghost");

        let empty = Some(serde_json::json!({"ids": []}));
        let (status, _) = send(&app, "POST", "/api/v1/dispatch", empty).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reset_drops_everything() {
        let (app, _) = app();
        submit_one(&app, "a").await;
        let (status, _) = send(&app, "POST", "/api/v1/session/reset", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, snap) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(snap["total"], 0);
    }

    #[tokio::test]
    async fn test_persistence_fault_surfaces_as_503() {
        let store = Arc::new(FlakyStore::default());
        let (app, _) = app_with_store(store.clone());
        store.fail.store(true, Ordering::SeqCst);
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/batches",
            batch(serde_json::json!([{"id": "a", "text": "x"}])),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "PERSISTENCE_FAULT");

        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["persistence_faults"], 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_report_scheduler_state() {
        let (app, state) = app();
        let (_, status) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status["scheduler"], "idle");

        submit_one(&app, "a").await;
        let (code, body) = send(&app, "POST", "/api/v1/engine/pause", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["scheduler"], "paused");
        assert_eq!(body["in_quick_retry"], 1);
        assert!(state.engine.is_paused());

        let (_, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(health["scheduler"], "paused");

        let (code, body) = send(&app, "POST", "/api/v1/engine/resume", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["scheduler"], "processing");
        assert!(!state.engine.is_paused());
    }
}
