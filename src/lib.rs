pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod utils;

use crate::api::middleware::request_id::REQUEST_ID_HEADER;
use crate::config::AppConfig;
use crate::services::extraction::{ExtractionService, ExtractionSettings};
use crate::services::gemini::GeminiApi;
use axum::{
    Router,
    http::HeaderValue,
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::extract::extract,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::extract::ExtractForm,
            api::handlers::extract::ExtractResponse,
            api::handlers::health::HealthResponse,
            models::RemoteFile,
            models::Notice,
            models::NoticeLevel,
        )
    ),
    tags(
        (name = "extract", description = "Bank detail extraction"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<ExtractionService>,
    pub config: AppConfig,
}

impl AppState {
    /// Wires the shared Gemini client into a fresh extraction service
    pub fn new(gemini: Arc<dyn GeminiApi>, config: AppConfig) -> Self {
        Self::with_settings(gemini, ExtractionSettings::from(&config), config)
    }

    pub fn with_settings(
        gemini: Arc<dyn GeminiApi>,
        settings: ExtractionSettings,
        config: AppConfig,
    ) -> Self {
        Self {
            extractor: Arc::new(ExtractionService::new(gemini, settings)),
            config,
        }
    }
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(api::handlers::page::index))
        .route("/health", get(api::handlers::health::health_check))
        .route("/extract", post(api::handlers::extract::extract))
        // Inside the request-id layer so the span sees the minted id
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                    info!("📥 {} {}", request.method(), request.uri());
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        info!(
                            "📤 Finished in {:?} with status {}",
                            latency,
                            response.status()
                        );
                    },
                ),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors_layer(&state.config))
        .layer(axum::extract::DefaultBodyLimit::max(
            state.config.max_file_size + 1024 * 1024, // 1MB for multipart overhead
        ))
        .with_state(state)
}
