//! REST handlers

use super::AppState;
use crate::portforward::{ForwardError, ForwardRequest, PortForward};
use crate::store::{self, ClusterContext, StoreError};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Uniform error envelope: `{success:false, message, error?}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: None,
            status,
        }
    }

    fn with_detail(status: StatusCode, message: impl Into<String>, detail: String) -> Self {
        Self {
            error: Some(detail),
            ..Self::new(status, message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(&self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::UnknownContext(_) => {
                ApiError::new(StatusCode::NOT_FOUND, e.to_string())
            }
            StoreError::InvalidConfig(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            _ => ApiError::with_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "context store error",
                e.to_string(),
            ),
        }
    }
}

impl From<ForwardError> for ApiError {
    fn from(e: ForwardError) -> Self {
        let status = match e {
            ForwardError::ClusterUnknown(_) | ForwardError::NotFound => StatusCode::NOT_FOUND,
            ForwardError::PortInUse(_) | ForwardError::AlreadyExists(_) => StatusCode::CONFLICT,
            ForwardError::PodUnavailable(_) => StatusCode::BAD_GATEWAY,
            ForwardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

pub async fn list_contexts(State(state): State<AppState>) -> Json<Vec<ClusterContext>> {
    let contexts = state
        .store
        .list()
        .into_iter()
        .map(|c| (*c).clone())
        .collect();
    Json(contexts)
}

pub async fn get_context(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClusterContext>, ApiError> {
    state
        .store
        .get(&name)
        .map(|c| Json((*c).clone()))
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown context: {}", name)))
}

pub async fn delete_context(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.remove(&name) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("unknown context: {}", name),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub content: String,
    pub source_name: String,
    /// Seconds until expiry; 0 means never
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub contexts_added: Vec<String>,
    pub errors: Vec<String>,
}

pub async fn upload_kubeconfig(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    if request.source_name.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "sourceName is required",
        ));
    }
    let added = store::upload_raw(
        &state.store,
        &request.content,
        &request.source_name,
        request.ttl,
    )?;
    Ok(Json(UploadResponse {
        contexts_added: added,
        errors: Vec::new(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub ok: bool,
    pub context_count: usize,
    pub errors: Vec<String>,
}

pub async fn validate_kubeconfig(
    Json(request): Json<ValidateRequest>,
) -> Json<ValidateResponse> {
    match store::validate_raw(&request.content) {
        Ok(count) => Json(ValidateResponse {
            ok: true,
            context_count: count,
            errors: Vec::new(),
        }),
        Err(e) => Json(ValidateResponse {
            ok: false,
            context_count: 0,
            errors: vec![e.to_string()],
        }),
    }
}

pub async fn start_portforward(
    State(state): State<AppState>,
    Json(request): Json<ForwardRequest>,
) -> Result<Json<PortForward>, ApiError> {
    let forward = state.forwards.start(request).await?;
    Ok(Json(forward))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub id: String,
    pub cluster: String,
    #[serde(default)]
    pub stop_or_delete: bool,
}

pub async fn stop_portforward(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .forwards
        .stop(&request.cluster, &request.id, request.stop_or_delete)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ForwardQuery {
    pub cluster: Option<String>,
}

pub async fn list_portforwards(
    State(state): State<AppState>,
    Query(query): Query<ForwardQuery>,
) -> Json<Vec<PortForward>> {
    Json(state.forwards.list(query.cluster.as_deref()))
}

pub async fn get_portforward(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ForwardQuery>,
) -> Result<Json<PortForward>, ApiError> {
    let cluster = query.cluster.ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "cluster query parameter is required")
    })?;
    state
        .forwards
        .get(&cluster, &id)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("forward not found: {}", id)))
}
