//! HTTP 接口（axum）
//!
//! - `GET /health`
//! - `GET /trends/top?q=<种子词,逗号分隔>&proxies=<代理,逗号分隔>` → `{trend}`
//! - `POST /automation/grok` → `{ok, result: {download_url, local_path}}`
//! - `POST /automation/upload` → `{ok, result: {post_url, cookies}}`
//!
//! 错误体为 `{detail}`；凭据被拒 401，人机验证 / 封禁 403，不支持的平台 400，其余 500。

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::anomaly::AnomalyKind;
use crate::core::builder::AutomationBuilder;
use crate::core::error::TaskError;
use crate::tasks::trends::parse_seeds;
use crate::tasks::{GenerationOutput, Platform, UploadOutput, UploadRequest};

/// 路由共享状态
pub struct AppState {
    pub builder: AutomationBuilder,
}

impl AppState {
    pub fn new(builder: AutomationBuilder) -> Self {
        Self { builder }
    }
}

/// 带状态码的错误响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response()
    }
}

/// 生成任务的错误映射
fn grok_error(err: &TaskError) -> ApiError {
    match err {
        TaskError::AuthenticationFailure { .. } => ApiError::new(StatusCode::UNAUTHORIZED, err.to_string()),
        TaskError::AnomalyDetected {
            kind: AnomalyKind::Challenge | AnomalyKind::Blocked,
            ..
        } => ApiError::new(StatusCode::FORBIDDEN, err.to_string()),
        _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Grok error: {err}")),
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    q: Option<String>,
    proxies: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrendResponse {
    pub trend: String,
}

#[derive(Debug, Deserialize)]
pub struct GrokRequest {
    prompt: String,
    headless: Option<bool>,
    proxies: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    video_path: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    cookies_path: Option<String>,
    headless: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct Completed<T> {
    pub ok: bool,
    pub result: T,
}

impl<T> Completed<T> {
    fn ok(result: T) -> Json<Self> {
        Json(Self { ok: true, result })
    }
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// GET /trends/top：永不失败，全部种子失败时返回兜底趋势
async fn top_trend(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrendQuery>,
) -> Json<TrendResponse> {
    let builder = &state.builder;
    let seeds = match query.q.as_deref() {
        Some(q) => parse_seeds(q),
        None => builder.config().trends.default_seeds.clone(),
    };
    let scout = builder.trend_scout(builder.proxies_for(query.proxies.as_deref()));
    let trend = scout.top_trend(&seeds).await;
    Json(TrendResponse { trend })
}

/// POST /automation/grok：阻塞直到生成完成或失败
async fn automation_grok(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GrokRequest>,
) -> Result<Json<Completed<GenerationOutput>>, ApiError> {
    let builder = &state.builder;
    let generator = builder
        .content_generator(builder.proxies_for(req.proxies.as_deref()), req.headless)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Grok error: {e}")))?;
    match generator.generate(&req.prompt).await {
        Ok(output) => Ok(Completed::ok(output)),
        Err(e) => {
            tracing::warn!(error = %e, "grok automation failed");
            Err(grok_error(&e))
        }
    }
}

/// POST /automation/upload
async fn automation_upload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadBody>,
) -> Result<Json<Completed<UploadOutput>>, ApiError> {
    let platform: Platform = req
        .platform
        .as_deref()
        .unwrap_or("tiktok")
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Unsupported platform"))?;

    let mut request = UploadRequest::new(
        PathBuf::from(&req.video_path),
        req.caption.unwrap_or_default(),
        platform,
    );
    if let Some(cookies) = req.cookies_path {
        request = request.with_cookies(cookies);
    }

    let builder = &state.builder;
    let uploader = builder
        .social_uploader(builder.shared_proxies(), req.headless)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Upload error: {e}")))?;
    match uploader.upload(&request).await {
        Ok(output) => Ok(Completed::ok(output)),
        Err(e) => {
            tracing::warn!(platform = %platform, error = %e, "upload failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Upload error: {e}")))
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trends/top", get(top_trend))
        .route("/automation/grok", post(automation_grok))
        .route("/automation/upload", post(automation_upload))
        .with_state(state)
}
