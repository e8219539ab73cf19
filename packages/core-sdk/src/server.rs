use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::{
    config::AppConfig,
    context::{self, SYSTEM_PROMPT},
    error::{ExecutionError, VaultError},
    execution::{
        ErrorBanner, ExecutionClient, HttpExecutionClient, Language, SubmissionBuilder,
        SubmissionInput, SubmissionOutcome,
    },
    gateway::{ChatReply, CompletionRequest, Gateway},
    llm::{ClientFactory, HttpClientFactory},
    models::{ChatMessage, ChatSession, CodeContext, ProblemContext},
    orchestrator::{LanguageCatalog, SubmissionOrchestrator},
    registry::{ProviderDescriptor, ProviderId, Registry},
    telemetry,
    vault::{SaveOutcome, SqliteCredentialStore, StorageMode, Vault},
};

/** \brief 设置保存失败时的统一提示。 */
pub const SAVE_FALLBACK: &str = "Backend Error";

type ApiError = (StatusCode, String);

/**
 * \brief 服务共享状态；所有依赖显式注入，便于测试替换。
 */
pub struct AppState {
    pub vault: Arc<Vault>,
    pub gateway: Arc<Gateway>,
    execution: Arc<dyn ExecutionClient>,
    builder: SubmissionBuilder,
    /** \brief 语言目录与用户无关，整个进程共享一份。 */
    catalog: Arc<LanguageCatalog>,
    /** \brief 仅记录提交中的用户，请求结束即移除。 */
    in_flight: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(
        vault: Arc<Vault>,
        gateway: Arc<Gateway>,
        execution: Arc<dyn ExecutionClient>,
        builder: SubmissionBuilder,
    ) -> Self {
        let catalog = Arc::new(LanguageCatalog::new(execution.clone()));
        Self {
            vault,
            gateway,
            execution,
            builder,
            catalog,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /**
     * \brief 按进程配置装配全部组件。
     */
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteCredentialStore::open(&config.db_path)
            .with_context(|| format!("open credential store at {}", config.db_path))?;
        let vault = Arc::new(Vault::new(config.codec.clone(), Box::new(store)));
        let registry = Registry::with_overrides(&config.provider_base_urls);
        let factory: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(config.http_timeout)?);
        let gateway = Arc::new(Gateway::new(registry, vault.clone(), factory));
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let execution: Arc<dyn ExecutionClient> =
            Arc::new(HttpExecutionClient::new(http, &config.execution_url));
        Ok(Self::new(
            vault,
            gateway,
            execution,
            SubmissionBuilder::new(config.limits),
        ))
    }

    /**
     * \brief 为一次提交创建编排器，语言目录共享。
     */
    pub fn orchestrator(&self) -> SubmissionOrchestrator {
        SubmissionOrchestrator::with_catalog(
            self.execution.clone(),
            self.builder,
            self.catalog.clone(),
        )
    }

    pub async fn languages(&self, owner: &str) -> Result<Vec<Language>, ExecutionError> {
        self.catalog.languages(owner).await
    }

    /** \brief 当前提交中的用户数。 */
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /**
     * \brief 标记该用户提交中；已有提交时返回 None。
     */
    fn begin_submission(&self, owner: &str) -> Option<InFlightGuard<'_>> {
        if !self.lock_in_flight().insert(owner.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            state: self,
            owner: owner.to_string(),
        })
    }
}

/**
 * \brief 提交结束（含取消、出错）时自动移除标记。
 */
struct InFlightGuard<'a> {
    state: &'a AppState,
    owner: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.lock_in_flight().remove(&self.owner);
    }
}

/**
 * \brief 构造 API 路由（不含静态资源）。
 */
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/providers", get(list_providers))
        .route(
            "/api/credentials/{provider}",
            get(get_credential).put(save_credential),
        )
        .route("/api/credentials/{provider}/model", put(set_default_model))
        .route("/api/chat", post(chat))
        .route("/api/submissions", post(submit))
        .route("/api/languages", get(list_languages))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供 API 与可选的静态前端。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, config: &AppConfig) -> Result<()> {
    let state = Arc::new(AppState::from_config(config)?);
    let mut app = router(state);
    if let Some(ui_root) = config.ui_dir.as_deref() {
        if std::path::Path::new(ui_root).exists() {
            let static_handler = ServeDir::new(ui_root).append_index_html_on_directories(true);
            app = app.fallback_service(get_service(static_handler));
        } else {
            tracing::warn!("ui dir {} does not exist, serving API only", ui_root);
        }
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::log_event("server.start", &format!("listening on http://{}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 从 X-User-Id 头读取当前用户。
 */
fn owner_of(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or((StatusCode::UNAUTHORIZED, "missing X-User-Id".to_string()))
}

/**
 * \brief 凭据库失败：记录错误码后只返回统一提示，不外露存储层原文。
 */
fn vault_failure(category: &str, provider: ProviderId, owner: &str, err: VaultError) -> ApiError {
    telemetry::log_error(
        category,
        &format!("provider={} owner={} code={}", provider, owner, err.code()),
    );
    let status = match err {
        VaultError::InvalidMode => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, SAVE_FALLBACK.to_string())
}

fn parse_provider(raw: &str) -> Result<ProviderId, ApiError> {
    raw.parse::<ProviderId>()
        .map_err(|e| (StatusCode::NOT_FOUND, e))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderDescriptor>> {
    Json(state.gateway.registry().all().to_vec())
}

#[derive(Serialize, Debug)]
struct CredentialStatus {
    provider: ProviderId,
    present: bool,
    mode: StorageMode,
    default_model: Option<String>,
}

/**
 * \brief 查询保存状态；从不返回密钥本身。
 */
async fn get_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<CredentialStatus>, ApiError> {
    let owner = owner_of(&headers)?;
    let provider = parse_provider(&provider)?;
    let mode = state
        .vault
        .stored_mode(&owner, provider)
        .map_err(|e| vault_failure("vault.status", provider, &owner, e))?;
    let default_model = state
        .vault
        .default_model(&owner, provider)
        .map_err(|e| vault_failure("vault.status", provider, &owner, e))?;
    Ok(Json(CredentialStatus {
        provider,
        present: mode == StorageMode::Persisted,
        mode,
        default_model,
    }))
}

#[derive(Deserialize, Debug)]
struct SaveCredentialRequest {
    api_key: String,
    mode: StorageMode,
}

#[derive(Serialize, Debug)]
struct SaveCredentialResponse {
    ok: bool,
    mode: StorageMode,
    /** \brief 本地模式下交还给客户端保存。 */
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/**
 * \brief 保存密钥；任何存储失败都只返回统一提示。
 */
async fn save_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(input): Json<SaveCredentialRequest>,
) -> Result<(StatusCode, Json<SaveCredentialResponse>), ApiError> {
    let owner = owner_of(&headers)?;
    let provider = parse_provider(&provider)?;
    match state
        .vault
        .save(&owner, provider, &input.api_key, input.mode)
    {
        Ok(SaveOutcome::Persisted) => Ok((
            StatusCode::OK,
            Json(SaveCredentialResponse {
                ok: true,
                mode: StorageMode::Persisted,
                api_key: None,
                message: None,
            }),
        )),
        Ok(SaveOutcome::ReturnedToCaller(key)) => Ok((
            StatusCode::OK,
            Json(SaveCredentialResponse {
                ok: true,
                mode: StorageMode::Ephemeral,
                api_key: Some(key.expose().to_string()),
                message: None,
            }),
        )),
        Err(err) => {
            let (status, message) = vault_failure("vault.save", provider, &owner, err);
            Ok((
                status,
                Json(SaveCredentialResponse {
                    ok: false,
                    mode: input.mode,
                    api_key: None,
                    message: Some(message),
                }),
            ))
        }
    }
}

#[derive(Deserialize, Debug)]
struct ModelRequest {
    model: String,
}

async fn set_default_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(input): Json<ModelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = owner_of(&headers)?;
    let provider = parse_provider(&provider)?;
    let model = input.model.trim();
    if model.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "model must not be empty".to_string()));
    }
    state
        .vault
        .set_default_model(&owner, provider, model)
        .map_err(|e| vault_failure("vault.model", provider, &owner, e))?;
    Ok(Json(serde_json::json!({ "ok": true, "model": model })))
}

#[derive(Deserialize, Debug)]
struct ChatRequest {
    provider: ProviderId,
    #[serde(default)]
    model: String,
    prompt: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default)]
    problem: Option<ProblemContext>,
    #[serde(default)]
    code: Option<CodeContext>,
    /** \brief 本地模式下客户端持有的密钥。 */
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    mode: StorageMode,
}

/**
 * \brief 单轮对话：组装上下文后交给网关，失败时返回兜底文本（仍为 200）。
 */
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    let owner = owner_of(&headers)?;
    let session = ChatSession::from_history(input.history);
    let messages = context::assemble(
        SYSTEM_PROMPT,
        input.problem.as_ref(),
        input.code.as_ref(),
        session.history(),
        &input.prompt,
    );
    let request = CompletionRequest {
        owner,
        provider: input.provider,
        model: input.model,
        messages,
        supplied_key: input.api_key,
        mode: input.mode,
    };
    // 客户端断开时 handler future 被丢弃，请求随之终止
    let cancel = CancellationToken::new();
    Ok(Json(state.gateway.reply(&request, &cancel).await))
}

#[derive(Serialize, Debug)]
struct SubmissionResponse {
    outcome: SubmissionOutcome,
    banner: Option<ErrorBanner>,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<SubmissionInput>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    let owner = owner_of(&headers)?;
    let _guard = state.begin_submission(&owner).ok_or((
        StatusCode::CONFLICT,
        "a submission is already running".to_string(),
    ))?;
    let outcome = state
        .orchestrator()
        .submit(&owner, input, &CancellationToken::new())
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.user_message()))?;
    let banner = outcome.banner();
    Ok(Json(SubmissionResponse { outcome, banner }))
}

async fn list_languages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Language>>, ApiError> {
    let owner = owner_of(&headers)?;
    let languages = state
        .languages(&owner)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.user_message()))?;
    Ok(Json(languages))
}
