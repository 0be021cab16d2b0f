//! Kestrel Hosting Service
//!
//! Serves a [`MemoryHost`] over HTTP so agents running in separate processes,
//! each with its own passcode, share one hosting service and one network.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use clap::Parser;
use kestrel_core::event::SignedEvent;
use kestrel_core::exchange::SignedExchange;
use kestrel_host::http::CONTROLLER_HEADER;
use kestrel_host::types::{
    ErrorBody, InceptRequest, IssueRequest, OobiRequest, QueryRequest, RegistryRequest,
};
use kestrel_host::{
    AgentInfo, ControllerBootstrap, HostError, HostingService, IdentifierRecord, MemoryHost,
    Network, Notification, Operation, RegistryRecord,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kestrel-host")]
#[command(about = "Kestrel hosting service")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3901")]
    port: u16,

    /// Base URL advertised in OOBIs (defaults to this service's own URL)
    #[arg(long)]
    oobi_base: Option<String>,
}

type AppState = Arc<MemoryHost>;

struct ApiError(HostError);

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::BAD_REQUEST);
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn controller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(CONTROLLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError(HostError::Unauthorized(format!(
                "missing {CONTROLLER_HEADER} header"
            )))
        })
}

async fn connect(
    State(host): State<AppState>,
    Json(bootstrap): Json<ControllerBootstrap>,
) -> ApiResult<AgentInfo> {
    Ok(Json(host.connect(&bootstrap).await?))
}

async fn operation(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Operation> {
    Ok(Json(host.operation(&controller(&headers)?, &name).await?))
}

async fn resolve_oobi(
    State(host): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OobiRequest>,
) -> ApiResult<Operation> {
    let controller = controller(&headers)?;
    Ok(Json(
        host.resolve_oobi(&controller, &request.url, &request.alias)
            .await?,
    ))
}

async fn query_key_state(
    State(host): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Operation> {
    let controller = controller(&headers)?;
    Ok(Json(host.query_key_state(&controller, &request.prefix).await?))
}

async fn key_event_log(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(prefix): Path<String>,
) -> ApiResult<Vec<SignedEvent>> {
    Ok(Json(host.key_event_log(&controller(&headers)?, &prefix).await?))
}

async fn identifier(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(alias): Path<String>,
) -> ApiResult<IdentifierRecord> {
    Ok(Json(host.identifier(&controller(&headers)?, &alias).await?))
}

async fn incept(
    State(host): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InceptRequest>,
) -> ApiResult<Operation> {
    let controller = controller(&headers)?;
    Ok(Json(
        host.incept(&controller, &request.alias, request.event)
            .await?,
    ))
}

async fn interact(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(alias): Path<String>,
    Json(event): Json<SignedEvent>,
) -> ApiResult<Operation> {
    Ok(Json(host.interact(&controller(&headers)?, &alias, event).await?))
}

async fn registries(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(alias): Path<String>,
) -> ApiResult<Vec<RegistryRecord>> {
    Ok(Json(host.registries(&controller(&headers)?, &alias).await?))
}

async fn create_registry(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(alias): Path<String>,
    Json(request): Json<RegistryRequest>,
) -> ApiResult<Operation> {
    let controller = controller(&headers)?;
    Ok(Json(
        host.create_registry(&controller, &alias, request.registry, request.anchor)
            .await?,
    ))
}

async fn schema(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(said): Path<String>,
) -> ApiResult<Value> {
    Ok(Json(host.schema(&controller(&headers)?, &said).await?))
}

/// Publish a schema on the network.
async fn publish_schema(
    State(host): State<AppState>,
    Json(document): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let said = host
        .network()
        .publish_schema(document)
        .map_err(HostError::from)?;
    info!(said = %said, "Published schema");
    Ok((StatusCode::CREATED, Json(json!({ "said": said }))))
}

async fn issue_credential(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(alias): Path<String>,
    Json(request): Json<IssueRequest>,
) -> ApiResult<Operation> {
    let controller = controller(&headers)?;
    Ok(Json(
        host.issue_credential(&controller, &alias, request.credential, request.anchor)
            .await?,
    ))
}

async fn submit_exchange(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(alias): Path<String>,
    Json(exchange): Json<SignedExchange>,
) -> ApiResult<Operation> {
    let controller = controller(&headers)?;
    Ok(Json(
        host.submit_exchange(&controller, &alias, exchange)
            .await?,
    ))
}

async fn exchange(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(said): Path<String>,
) -> ApiResult<SignedExchange> {
    Ok(Json(host.exchange(&controller(&headers)?, &said).await?))
}

async fn notifications(
    State(host): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Vec<Notification>> {
    Ok(Json(host.notifications(&controller(&headers)?).await?))
}

async fn mark_notification(
    State(host): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    host.mark_notification(&controller(&headers)?, &id).await?;
    Ok(Json(json!({ "id": id, "read": true })))
}

/// Published key events of a prefix, as an OOBI endpoint would serve them.
async fn oobi(
    State(host): State<AppState>,
    Path(prefix): Path<String>,
) -> ApiResult<Vec<SignedEvent>> {
    host.network()
        .kel(&prefix)
        .map(Json)
        .ok_or_else(|| ApiError(HostError::NotFound(format!("key event log of {prefix}"))))
}

/// Health check.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "kestrel-host"
    }))
}

fn router(host: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/connect", post(connect))
        .route("/operations/{name}", get(operation))
        .route("/oobis", post(resolve_oobi))
        .route("/oobi/{prefix}", get(oobi))
        .route("/queries", post(query_key_state))
        .route("/kels/{prefix}", get(key_event_log))
        .route("/identifiers", post(incept))
        .route("/identifiers/{alias}", get(identifier))
        .route("/identifiers/{alias}/events", post(interact))
        .route(
            "/identifiers/{alias}/registries",
            get(registries).post(create_registry),
        )
        .route("/identifiers/{alias}/credentials", post(issue_credential))
        .route("/identifiers/{alias}/exchanges", post(submit_exchange))
        .route("/schemas", post(publish_schema))
        .route("/schemas/{said}", get(schema))
        .route("/exchanges/{said}", get(exchange))
        .route("/notifications", get(notifications))
        .route("/notifications/{id}", put(mark_notification))
        .layer(TraceLayer::new_for_http())
        .with_state(host)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let oobi_base = args
        .oobi_base
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", args.port));
    let host = Arc::new(MemoryHost::new(Network::new(oobi_base.clone())));

    let addr = format!("0.0.0.0:{}", args.port);
    info!(addr = %addr, oobi_base = %oobi_base, "Kestrel hosting service listening");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Could not bind");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, router(host)).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
