//! Request handlers.
//!
//! Dispatcher calls block on file I/O and lock polling, so every handler
//! moves its work onto the blocking pool.

use axum::extract::{Path, State};
use axum::response::Json;
use kiln_core::{Dispatcher, Options};
use kiln_registry::DispatchError;
use kiln_types::{Oid, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ServerError, ServerResult};

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub allow_flush: bool,
}

type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub module: String,
    pub oids: Vec<String>,
    #[serde(default)]
    pub opts: JsonMap,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub module: String,
    pub oids: Vec<String>,
    #[serde(default)]
    pub opts: JsonMap,
    #[serde(default)]
    pub lock: bool,
}

#[derive(Debug, Serialize)]
pub struct FailureBody {
    pub oid: String,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub module: String,
    pub success: bool,
    pub cached: usize,
    pub computed: usize,
    pub failures: Vec<FailureBody>,
}

fn parse_oid(hex: &str) -> ServerResult<Oid> {
    Oid::from_hex(hex).map_err(|e| ServerError::Dispatch(DispatchError::from(e)))
}

fn parse_oids(hexes: &[String]) -> ServerResult<Vec<Oid>> {
    if hexes.is_empty() {
        return Err(ServerError::BadRequest("no OIDs given".into()));
    }
    hexes.iter().map(|h| parse_oid(h)).collect()
}

fn options_from_json(map: &JsonMap) -> Options {
    map.iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect()
}

async fn blocking<T, F>(f: F) -> ServerResult<T>
where
    F: FnOnce() -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(format!("worker task failed: {e}")))?
}

/// Health check handler.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "name": "kiln-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /v1/process`
pub async fn process_handler(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> ServerResult<Json<ProcessResponse>> {
    let oids = parse_oids(&req.oids)?;
    let opts = options_from_json(&req.opts);
    let d = state.dispatcher;
    let report = blocking(move || Ok(d.process_report(&req.module, &oids, &opts, req.force)?)).await?;
    Ok(Json(ProcessResponse {
        success: report.is_success(),
        cached: report.cached,
        computed: report.computed,
        failures: report
            .failures
            .into_iter()
            .map(|f| {
                let kind = ServerError::Dispatch(f.error);
                FailureBody {
                    oid: f.oid.to_hex(),
                    kind: kind.kind(),
                    error: kind.to_string(),
                }
            })
            .collect(),
        module: report.module,
    }))
}

/// `POST /v1/retrieve`
pub async fn retrieve_handler(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> ServerResult<Json<serde_json::Value>> {
    let oids = parse_oids(&req.oids)?;
    let opts = options_from_json(&req.opts);
    let d = state.dispatcher;
    let value = blocking(move || Ok(d.retrieve(&req.module, &oids, &opts, req.lock)?)).await?;
    Ok(Json(json!({
        "result": value.map(|v| v.to_json()),
    })))
}

/// `GET /v1/exists/{module}/{oid}`
pub async fn exists_handler(
    State(state): State<AppState>,
    Path((module, oid)): Path<(String, String)>,
) -> ServerResult<Json<serde_json::Value>> {
    let oid = parse_oid(&oid)?;
    let d = state.dispatcher;
    let exists = blocking(move || Ok(d.exists(&module, &oid, &Options::new())?)).await?;
    Ok(Json(json!({ "exists": exists })))
}

/// `GET /v1/field/{module}/{oid}/{field}`
pub async fn field_handler(
    State(state): State<AppState>,
    Path((module, oid, field)): Path<(String, String, String)>,
) -> ServerResult<Json<serde_json::Value>> {
    let oid = parse_oid(&oid)?;
    let d = state.dispatcher;
    let value = blocking(move || Ok(d.get_field(&module, &oid, &field, &Options::new())?)).await?;
    Ok(Json(json!({ "value": value.map(|v| v.to_json()) })))
}

/// `DELETE /v1/oids/{oid}`
pub async fn flush_oid_handler(
    State(state): State<AppState>,
    Path(oid): Path<String>,
) -> ServerResult<Json<serde_json::Value>> {
    if !state.allow_flush {
        return Err(ServerError::FlushDisabled);
    }
    let oid = parse_oid(&oid)?;
    let d = state.dispatcher;
    let report = blocking(move || Ok(d.flush_oid(&oid)?)).await?;
    Ok(Json(json!({
        "artifacts": report.artifacts,
        "recreated": report
            .recreated
            .iter()
            .map(|(old, new)| json!({ "old": old.to_hex(), "new": new.to_hex() }))
            .collect::<Vec<_>>(),
        "deleted_collections": report
            .deleted_collections
            .iter()
            .map(Oid::to_hex)
            .collect::<Vec<_>>(),
    })))
}

/// `DELETE /v1/modules/{module}`
pub async fn flush_module_handler(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> ServerResult<Json<serde_json::Value>> {
    if !state.allow_flush {
        return Err(ServerError::FlushDisabled);
    }
    let d = state.dispatcher;
    let removed = blocking(move || Ok(d.flush_module(&module)?)).await?;
    Ok(Json(json!({ "removed": removed })))
}

/// `GET /v1/modules`
pub async fn modules_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let modules: Vec<serde_json::Value> = state
        .dispatcher
        .context()
        .registry()
        .modules()
        .into_iter()
        .map(|info| {
            json!({
                "name": info.name,
                "kind": info.kind.to_string(),
                "atomic": info.atomic,
                "set": info.set,
                "meta": info.meta,
                "description": info.description,
                "options": info.opts,
            })
        })
        .collect();
    Json(json!({ "modules": modules }))
}

/// `GET /v1/modules/{module}`
pub async fn module_doc_handler(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> ServerResult<Json<serde_json::Value>> {
    let doc = state
        .dispatcher
        .context()
        .registry()
        .documentation(&module)
        .ok_or(ServerError::Dispatch(DispatchError::UnknownModule(module)))?;
    Ok(Json(json!({ "documentation": doc })))
}
