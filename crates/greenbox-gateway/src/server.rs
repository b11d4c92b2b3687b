//! HTTP server — accept a repository, run it in the sandbox, report its energy use

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use greenbox_core::config::Config;
use greenbox_core::fetch::{CodeFetcher, FetchError};
use greenbox_core::runner::{RunJob, RunReport, Runner};
use greenbox_core::workspace::{remove_dir_force, resolve_code_base};
use greenbox_core::{ConfigError, ContainerEngine, ResolvedRun};

use crate::protocol::{ErrorBody, LIVENESS, RunResults, UploadRequest, UploadResponse};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    runner: Arc<Runner>,
    fetcher: Arc<dyn CodeFetcher>,
    permits: Arc<Semaphore>,
}

/// Why an upload was refused, mapped onto an HTTP status
#[derive(Debug)]
enum ApiError {
    NotJson,
    InvalidJson(String),
    Fetch(FetchError),
    Config(ConfigError),
    Backend(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotJson => (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string()),
            ApiError::InvalidJson(e) => (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)),
            ApiError::Fetch(e) => (
                StatusCode::BAD_REQUEST,
                format!("Failed to clone repository: {}", e),
            ),
            ApiError::Config(e) => (
                StatusCode::BAD_REQUEST,
                format!("Failed to update configuration: {}", e),
            ),
            ApiError::Backend(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Backend execution failed: {}", e),
            ),
        };
        (status, Json(ErrorBody::new(message))).into_response()
    }
}

/// The gateway HTTP server
pub struct GatewayServer {
    state: AppState,
    cors: CorsLayer,
}

impl GatewayServer {
    pub fn new(
        config: Config,
        engine: Arc<dyn ContainerEngine>,
        fetcher: Arc<dyn CodeFetcher>,
    ) -> Result<Self> {
        let cors = cors_layer(&config.server.cors_origins)?;
        let runner = Runner::new(engine, &config);
        let permits = Semaphore::new(config.server.max_concurrent_runs.max(1));
        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                runner: Arc::new(runner),
                fetcher,
                permits: Arc::new(permits),
            },
            cors,
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/upload_data", post(upload_data))
            .layer(self.cors.clone())
            .with_state(self.state.clone())
    }

    /// Bind `server.host:server.port` and serve until Ctrl-C
    pub async fn start(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind gateway to {}", addr))?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gateway shutting down");
        })
        .await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        info!("Gateway listening on http://{}", local);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("Gateway server error")
    }
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let allow = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let values = origins
            .iter()
            .map(|o| {
                HeaderValue::from_str(o).with_context(|| format!("Invalid CORS origin '{}'", o))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(values)
    };
    Ok(CorsLayer::new()
        .allow_origin(allow)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]))
}

/// `application/json` or any `application/*+json`
fn is_json(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let mime = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

async fn index() -> &'static str {
    LIVENESS
}

async fn upload_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    if !is_json(&headers) {
        return Err(ApiError::NotJson);
    }
    let request: UploadRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let patch = request.data;
    debug!("Gateway: upload request {:?}", patch);

    let repo_url = patch
        .repo_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidJson("missing field `repo_url`".to_string()))?;

    let resolved = state.config.resolve(&patch).map_err(ApiError::Config)?;
    let base_dir = resolve_code_base(
        &state.config.fetch.workspace_root,
        resolved.code_dir_relative.as_deref(),
    )
    .map_err(ApiError::Config)?;

    // A dropped request must not cut the run short or skip its cleanup
    let co2_rate = resolved.co2_rate;
    let task = tokio::spawn(execute(state, repo_url.clone(), base_dir, resolved));
    let report = task.await.map_err(|e| ApiError::Backend(e.to_string()))??;

    info!(
        "Gateway: {} finished with exit code {} ({} kWh)",
        repo_url, report.exit_code, report.energy_kwh
    );
    debug!("Gateway: container logs:\n{}", report.logs);
    Ok(Json(UploadResponse::completed(RunResults::from_report(
        &report, co2_rate,
    ))))
}

/// Fetch, run and clean up one upload while holding a run permit
async fn execute(
    state: AppState,
    repo_url: String,
    base_dir: PathBuf,
    resolved: ResolvedRun,
) -> Result<RunReport, ApiError> {
    let _permit = state
        .permits
        .acquire()
        .await
        .map_err(|e| ApiError::Backend(e.to_string()))?;

    let code_dir = state
        .fetcher
        .fetch(&repo_url, &base_dir)
        .await
        .map_err(|e| {
            warn!("Gateway: failed to fetch {}: {}", repo_url, e);
            ApiError::Fetch(e)
        })?;

    let job = RunJob {
        code_dir: code_dir.clone(),
        entrypoint: resolved.entrypoint,
        power: resolved.power,
        co2_rate: resolved.co2_rate,
        timeout: None,
    };
    let result = state.runner.run(&job).await;

    if let Err(e) = remove_dir_force(&code_dir).await {
        warn!("Gateway: could not remove {}: {}", code_dir.display(), e);
    }

    result.map_err(|e| {
        warn!("Gateway: backend execution failed for {}: {}", repo_url, e);
        ApiError::Backend(e.to_string())
    })
}
