use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::sse::{KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::BridgeError;
use crate::manager::BridgeManager;
use crate::model::{lookup_model, ModelAlias};
use crate::types::{ChatCompletionRequest, ModelObject, ModelsListResponse};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BridgeManager>,
}

// Fixed creation time advertised for the static model list.
const MODEL_CREATED: u64 = 1_700_000_000;

// Prompts go over stdin, so request bodies may be far larger than axum's 2 MB default.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub async fn chat_completions(
    State(state): State<AppState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            tracing::warn!(error = %rejection.body_text(), "Rejected malformed chat completion request");
            return BridgeError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    tracing::info!(
        model = req.model.as_deref().unwrap_or("<default>"),
        message_count = req.messages.len(),
        stream = req.stream,
        "Received chat completion request"
    );

    if req.stream {
        tracing::debug!("Routing to streaming handler");
        return chat_completions_stream(state, req).await;
    }

    match state.manager.run_completion(&req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Chat completion failed");
            e.into_response()
        }
    }
}

async fn chat_completions_stream(state: AppState, req: ChatCompletionRequest) -> Response {
    let frames = match state.manager.run_completion_stream(&req).await {
        Ok(frames) => frames,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start streaming completion");
            return e.into_response();
        }
    };

    let sse_stream = frames.map(|frame| Ok::<_, Infallible>(frame.into_event()));
    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn model_object(alias: ModelAlias) -> ModelObject {
    ModelObject {
        id: alias.canonical_id().to_string(),
        object: "model",
        created: MODEL_CREATED,
        owned_by: "anthropic",
    }
}

pub async fn list_models() -> Json<ModelsListResponse> {
    Json(ModelsListResponse {
        object: "list",
        data: ModelAlias::ALL.into_iter().map(model_object).collect(),
    })
}

pub async fn get_model(Path(model_id): Path<String>) -> Response {
    match lookup_model(&model_id) {
        Some(alias) => {
            let mut model = model_object(alias);
            model.id = model_id;
            Json(model).into_response()
        }
        None => {
            tracing::warn!(model_id = %model_id, "Model not found");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": {
                        "message": format!("Model '{}' not found", model_id),
                        "type": "invalid_request_error",
                        "code": "model_not_found"
                    }
                })),
            )
                .into_response()
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    let binary = match state.manager.ensure_binary().await {
        Ok(binary) => binary,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unavailable",
                    "error": e.to_string(),
                })),
            )
                .into_response();
        }
    };

    let version = binary.version().await.ok();
    Json(serde_json::json!({
        "status": "ok",
        "cli": {
            "path": binary.path().display().to_string(),
            "version": version,
        },
        "available_slots": state.manager.available_permits(),
    }))
    .into_response()
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        // Wildcard so provider-prefixed ids such as `anthropic/claude-sonnet-4` match.
        .route("/v1/models/*model", get(get_model))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
