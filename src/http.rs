//! JSON over HTTP front of the manager store.
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use engine_api::PluginConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::{AllowAll, AuthorizationPolicy, Decision};
use crate::chain::ChainConfig;
use crate::config::ServerOptions;
use crate::store::{ManagerStore, StoreError};

/// Header carrying the caller's identity for the authorization policy.
pub const PRINCIPAL_HEADER: &str = "x-principal";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ManagerStore>,
    pub policy: Arc<dyn AuthorizationPolicy>,
    /// Used by `/init` when the request names no plugins.
    pub default_plugins: Arc<Vec<PluginConfig>>,
}

impl AppState {
    pub fn new(store: Arc<ManagerStore>) -> Self {
        Self { store, policy: Arc::new(AllowAll), default_plugins: Arc::new(Vec::new()) }
    }

    /// Use `policy` for every session-keyed route. The policy also hears
    /// about sessions the store drops on its own (eviction, shutdown).
    pub fn with_policy(mut self, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        let listener = Arc::clone(&policy);
        self.store
            .set_removal_hook(Arc::new(move |session_id: &str| listener.on_session_removed(session_id)));
        self.policy = policy;
        self
    }

    pub fn with_default_plugins(mut self, plugins: Vec<PluginConfig>) -> Self {
        self.default_plugins = Arc::new(plugins);
        self
    }

    fn authorize(&self, headers: &HeaderMap, session_id: &str) -> Result<(), ApiError> {
        match self.policy.authorize(session_id, principal(headers)) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(ApiError::Forbidden(session_id.to_string())),
        }
    }
}

fn principal(headers: &HeaderMap) -> Option<&str> {
    headers.get(PRINCIPAL_HEADER).and_then(|value| value.to_str().ok())
}

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    Forbidden(String),
    PluginNotFound(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Store(err) => {
                let status = match err {
                    StoreError::SessionNotFound(_) | StoreError::ChainNotFound(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::BAD_REQUEST,
                };
                let payload = err.payload();
                (status, payload.kind, payload.message)
            }
            ApiError::Forbidden(session_id) => (
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("Access to sessionId={session_id} denied"),
            ),
            ApiError::PluginNotFound(name) => {
                (StatusCode::BAD_REQUEST, "plugin_not_found", format!("No plugin named {name}"))
            }
        };
        let body = json!({ "success": false, "error": { "kind": kind, "message": message } });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    #[serde(default)]
    plugin_configs: Option<Vec<PluginConfig>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunPluginRequest {
    session_id: String,
    plugin_name: String,
    #[serde(default)]
    plugin_params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginRequest {
    plugin_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChainRequest {
    session_id: String,
    chain_id: String,
    chain_config: ChainConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunChainRequest {
    session_id: String,
    chain_id: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainOutputRequest {
    session_id: String,
    chain_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutSharedRequest {
    session_id: String,
    key: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetSharedRequest {
    session_id: String,
    key: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/init", post(init))
        .route("/runPlugin", post(run_plugin))
        .route("/getPlugin", post(get_plugin))
        .route("/getPlugins", post(get_plugins))
        .route("/createChain", post(create_chain))
        .route("/runChain", post(run_chain))
        .route("/getChainOutput", post(get_chain_output))
        .route("/removeManager", post(remove_manager))
        .route("/putSharedData", post(put_shared_data))
        .route("/getSharedData", post(get_shared_data))
        .route("/listManagers", post(list_managers))
        .route("/shutdownAll", post(shutdown_all))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn init(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<InitRequest>) -> ApiResult {
    let configs = req.plugin_configs.unwrap_or_else(|| state.default_plugins.as_ref().clone());
    let session_id = state.store.create_session(configs).await?;
    state.policy.on_session_created(&session_id, principal(&headers));
    if !state.store.contains(&session_id).await {
        // dropped between creation and registration; the hook already ran
        state.policy.on_session_removed(&session_id);
    }
    Ok(Json(json!({
        "success": true,
        "sessionID": session_id,
        "message": "Manager created or initializing.",
    })))
}

async fn run_plugin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RunPluginRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    let result = state.store.run_plugin(&req.session_id, &req.plugin_name, req.plugin_params).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

async fn get_plugin(State(state): State<AppState>, Json(req): Json<PluginRequest>) -> ApiResult {
    let plugin = state
        .store
        .factory()
        .plugin(&req.plugin_name)
        .await
        .ok_or(ApiError::PluginNotFound(req.plugin_name))?;
    Ok(Json(json!({ "success": true, "result": plugin })))
}

async fn get_plugins(State(state): State<AppState>) -> ApiResult {
    let plugins = state.store.factory().plugins().await;
    Ok(Json(json!({ "success": true, "result": plugins })))
}

async fn create_chain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateChainRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    state.store.create_chain(&req.session_id, &req.chain_id, req.chain_config).await?;
    Ok(Json(json!({ "success": true })))
}

async fn run_chain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RunChainRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    let result = state.store.run_chain(&req.session_id, &req.chain_id, req.input).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

async fn get_chain_output(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChainOutputRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    let result = state.store.chain_output(&req.session_id, &req.chain_id).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

async fn remove_manager(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    let removed = state.store.remove(&req.session_id).await;
    Ok(Json(json!({ "success": removed })))
}

async fn put_shared_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PutSharedRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    state.store.put_shared(&req.session_id, &req.key, req.data).await?;
    Ok(Json(json!({ "success": true })))
}

async fn get_shared_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GetSharedRequest>,
) -> ApiResult {
    state.authorize(&headers, &req.session_id)?;
    let value = state.store.get_shared(&req.session_id, &req.key).await?;
    Ok(Json(json!({ "success": true, "value": value })))
}

async fn list_managers(State(state): State<AppState>) -> ApiResult {
    let data = state.store.list_sessions().await;
    Ok(Json(json!({ "success": true, "data": data })))
}

async fn shutdown_all(State(state): State<AppState>) -> ApiResult {
    state.store.shutdown_all().await;
    Ok(Json(json!({ "success": true })))
}

/// Bind, serve until Ctrl-C, then drop every session.
pub async fn serve(state: AppState, server: &ServerOptions) -> Result<()> {
    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Langpong running at http://{addr}");

    let store = Arc::clone(&state.store);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    store.shutdown_all().await;
    info!("Langpong stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {err}");
        // no signal to wait for; keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OwnershipPolicy;
    use crate::config::StoreOptions;
    use axum::body::Body;
    use axum::http::Request;
    use engine_api::engine_test_util::MockEngine;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        let store = ManagerStore::new(StoreOptions::default(), Arc::new(MockEngine::new()));
        AppState::new(store).with_default_plugins(vec![PluginConfig::new("echo")])
    }

    async fn call(app: &Router, path: &str, principal: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(principal) = principal {
            builder = builder.header(PRINCIPAL_HEADER, principal);
        }
        let req = builder.body(Body::from(body.to_string())).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn init_then_run_plugin() {
        let app = router(app_state());
        let (status, body) = call(&app, "/init", None, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let sid = body["sessionID"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "/runPlugin",
            None,
            json!({"sessionId": sid, "pluginName": "echo", "pluginParams": {"q": 1}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["params"]["q"], 1);
    }

    #[tokio::test]
    async fn unknown_session_maps_to_404() {
        let app = router(app_state());
        let (status, body) = call(&app, "/runPlugin", None, json!({"sessionId": "nope", "pluginName": "echo"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "session_not_found");
    }

    #[tokio::test]
    async fn engine_failure_maps_to_400() {
        let app = router(app_state());
        let (_, body) = call(&app, "/init", None, json!({})).await;
        let sid = body["sessionID"].as_str().unwrap();

        let (status, body) = call(&app, "/runPlugin", None, json!({"sessionId": sid, "pluginName": "fail"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "engine_execution_error");
    }

    #[tokio::test]
    async fn chains_and_shared_data_round_trip() {
        let app = router(app_state());
        let (_, body) = call(&app, "/init", None, json!({})).await;
        let sid = body["sessionID"].as_str().unwrap();

        let (status, _) = call(
            &app,
            "/createChain",
            None,
            json!({"sessionId": sid, "chainId": "c1", "chainConfig": {"type": "LLM"}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "/runChain", None, json!({"sessionId": sid, "chainId": "c1", "input": "hi"})).await;
        assert_eq!(body["result"], json!({"chainType": "LLM", "input": "hi"}));

        let (_, body) = call(&app, "/getChainOutput", None, json!({"sessionId": sid, "chainId": "c1"})).await;
        assert_eq!(body["result"]["input"], "hi");

        let (status, body) = call(&app, "/runChain", None, json!({"sessionId": sid, "chainId": "c2"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "chain_not_found");

        call(&app, "/putSharedData", None, json!({"sessionId": sid, "key": "k", "data": [1, 2]})).await;
        let (_, body) = call(&app, "/getSharedData", None, json!({"sessionId": sid, "key": "k"})).await;
        assert_eq!(body["value"], json!([1, 2]));
    }

    #[tokio::test]
    async fn list_remove_and_shutdown() {
        let app = router(app_state());
        let (_, body) = call(&app, "/init", None, json!({})).await;
        let sid = body["sessionID"].as_str().unwrap().to_string();
        call(&app, "/init", None, json!({})).await;

        let (_, body) = call(&app, "/listManagers", None, json!({})).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"][0]["sessionId"], sid.as_str());
        assert_eq!(body["data"][0]["status"], "READY");

        let (_, body) = call(&app, "/removeManager", None, json!({"sessionId": sid})).await;
        assert_eq!(body["success"], true);
        let (_, body) = call(&app, "/removeManager", None, json!({"sessionId": sid})).await;
        assert_eq!(body["success"], false);

        call(&app, "/shutdownAll", None, json!({})).await;
        let (_, body) = call(&app, "/listManagers", None, json!({})).await;
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn plugin_catalogue() {
        let app = router(app_state());
        let (_, body) = call(&app, "/getPlugins", None, json!({})).await;
        assert_eq!(body["result"].as_array().unwrap().len(), 3);

        let (status, body) = call(&app, "/getPlugin", None, json!({"pluginName": "echo"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["name"], "echo");

        let (status, body) = call(&app, "/getPlugin", None, json!({"pluginName": "ocr"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "plugin_not_found");
    }

    #[tokio::test]
    async fn ownership_policy_blocks_other_principals() {
        let state = app_state().with_policy(Arc::new(OwnershipPolicy::new()));
        let app = router(state);
        let (_, body) = call(&app, "/init", Some("alice"), json!({})).await;
        let sid = body["sessionID"].as_str().unwrap();

        let (status, body) = call(&app, "/putSharedData", Some("bob"), json!({"sessionId": sid, "key": "k"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["kind"], "forbidden");

        let (status, _) = call(&app, "/putSharedData", Some("alice"), json!({"sessionId": sid, "key": "k"})).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_sessions_lose_their_owner() {
        let options = StoreOptions { max_idle_time_ms: 100, cleanup_interval_ms: 50, ..StoreOptions::default() };
        let store = ManagerStore::new(options, Arc::new(MockEngine::new()));
        let policy = Arc::new(OwnershipPolicy::new());
        let app = router(AppState::new(Arc::clone(&store)).with_policy(policy.clone()));

        let (_, body) = call(&app, "/init", Some("alice"), json!({})).await;
        let sid = body["sessionID"].as_str().unwrap().to_string();
        assert_eq!(policy.owner_of(&sid).as_deref(), Some("alice"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.session_count().await, 0);
        assert_eq!(policy.owner_of(&sid), None);
    }

    #[tokio::test]
    async fn shutdown_and_removal_forget_owners() {
        let store = ManagerStore::new(StoreOptions::default(), Arc::new(MockEngine::new()));
        let policy = Arc::new(OwnershipPolicy::new());
        let app = router(AppState::new(store).with_policy(policy.clone()));

        let (_, body) = call(&app, "/init", Some("alice"), json!({})).await;
        let first = body["sessionID"].as_str().unwrap().to_string();
        let (_, body) = call(&app, "/init", Some("bob"), json!({})).await;
        let second = body["sessionID"].as_str().unwrap().to_string();

        call(&app, "/removeManager", Some("alice"), json!({"sessionId": first})).await;
        assert_eq!(policy.owner_of(&first), None);
        assert_eq!(policy.owner_of(&second).as_deref(), Some("bob"));

        call(&app, "/shutdownAll", None, json!({})).await;
        assert_eq!(policy.owner_of(&second), None);
    }
}
