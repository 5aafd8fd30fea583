// ABOUTME: HTTP host for the video-to-GIF clip handler
// ABOUTME: Serves raw multipart uploads and serverless trigger events over HTTP/1 and HTTP/2

use anyhow::Result;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, options, post},
    Router,
};
use gifclip::{ClipResponse, ClipService, Config, IncomingRequest, TriggerEvent};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tower::Service;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Room for multipart framing and form fields on top of the file ceiling
const FRAMING_ALLOWANCE: u64 = 1024 * 1024;

// App state shared across handlers
struct AppState {
    service: ClipService,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gifclip=info".parse()?),
        )
        .init();

    let config = Config::from_env();
    let port = config.port;
    tokio::fs::create_dir_all(&config.temp_dir).await?;

    info!(
        ffmpeg = %config.ffmpeg_path.display(),
        temp_dir = %config.temp_dir.display(),
        max_upload_bytes = config.max_upload_bytes,
        "Loaded configuration"
    );

    // Trigger events carry the upload as base64, a third larger than the raw bytes
    let body_limit = usize::try_from((config.max_upload_bytes + FRAMING_ALLOWANCE) / 3 * 4 + 4)
        .unwrap_or(usize::MAX);

    let state = Arc::new(AppState {
        service: ClipService::with_ffmpeg(config),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(86400));

    // Method checks belong to the clip handler, so every verb reaches it
    let app = Router::new()
        .route("/create-gif", options(handle_cors_preflight).fallback(handle_create_gif))
        .route("/", options(handle_cors_preflight).fallback(handle_create_gif))
        .route("/invoke", post(handle_invoke))
        .route("/version", get(handle_version))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting HTTP/2 server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // hyper's auto builder speaks both HTTP/1 and HTTP/2
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let app = app.clone();

        tokio::spawn(async move {
            let builder = Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection(
                    io,
                    hyper::service::service_fn(move |req| {
                        let mut app = app.clone();
                        async move { app.call(req).await }
                    }),
                )
                .await
            {
                error!("Connection error: {}", e);
            }
        });
    }
}

async fn handle_cors_preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn handle_version() -> impl IntoResponse {
    env!("CARGO_PKG_VERSION")
}

/// ANY /create-gif - raw multipart upload, binary GIF reply
async fn handle_create_gif(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    // Streamed into the ingestor, which enforces the upload ceiling itself
    let response = state
        .service
        .handle_stream(method, &headers, body.into_data_stream())
        .await;
    into_http(response)
}

/// POST /invoke - serverless trigger event in, trigger response out
async fn handle_invoke(
    State(state): State<Arc<AppState>>,
    Json(event): Json<TriggerEvent>,
) -> Response {
    let response = state.service.handle(IncomingRequest::from(event)).await;
    (StatusCode::OK, Json(response)).into_response()
}

/// Convert a trigger-style response to a plain HTTP one, decoding base64 bodies
fn into_http(clip: ClipResponse) -> Response {
    let status = StatusCode::from_u16(clip.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = clip.body_bytes();

    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;

    for (name, value) in &clip.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            resp.headers_mut().insert(name, value);
        }
    }

    resp
}
