use crate::{
    config::{DispatcherConfig, RegistryConfig},
    core::{
        EndpointSpec, KubeModelClient, LoadBalancer, ModelClient, ModelDescriptor,
        StaticModelClient,
    },
    logging::{self, LoggingConfig},
    messenger::Messenger,
    metrics,
    protocols::request::LABEL_SELECTOR_HEADER,
    routers::{http::models, ModelProxy},
    service_discovery::start_pod_reconciler,
    types::{error_response, ConfigurationError},
};
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use http::header::HeaderName;
use reqwest::Client;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, signal, spawn, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};

const DEFAULT_REQUEST_ID_HEADERS: [&str; 4] =
    ["x-request-id", "x-correlation-id", "x-trace-id", "request-id"];

pub struct AppContext {
    pub client: Client,
    pub config: DispatcherConfig,
    pub load_balancer: Arc<LoadBalancer>,
    pub model_client: Arc<dyn ModelClient>,
    pub proxy: ModelProxy,
    /// Fires on shutdown; HTTP requests still waiting for an endpoint give up.
    pub shutdown: CancellationToken,
    ready: AtomicBool,
}

impl AppContext {
    pub fn new(
        config: DispatcherConfig,
        client: Client,
        load_balancer: Arc<LoadBalancer>,
        model_client: Arc<dyn ModelClient>,
    ) -> Self {
        let proxy = ModelProxy::new(
            client.clone(),
            load_balancer.clone(),
            model_client.clone(),
            config.max_retries,
            config.retry_codes.iter().copied(),
        );
        Self {
            client,
            config,
            load_balancer,
            model_client,
            proxy,
            shutdown: CancellationToken::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub context: Arc<AppContext>,
}

// Fallback handler for unmatched routes
async fn sink_handler() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn liveness() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    if state.context.is_ready() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response()
    }
}

async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, state.context.config.max_payload_size).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("reading request body: {e}"),
            )
        }
    };
    // Nested routes see the URI with the `/openai` prefix already stripped.
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| parts.uri.path());

    state
        .context
        .proxy
        .serve(
            state.context.shutdown.child_token(),
            parts.method.clone(),
            path_and_query,
            parts.headers,
            body,
        )
        .await
}

async fn v1_models(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let features: Vec<String> = req
        .uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(k, _)| k == "feature")
                .map(|(_, v)| v.into_owned())
                .collect()
        })
        .unwrap_or_default();
    let selectors: Vec<String> = req
        .headers()
        .get_all(LABEL_SELECTOR_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();

    match models::list_models(state.context.model_client.as_ref(), &features, &selectors).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            warn!("Listing models failed: {}", e);
            e.into_response()
        }
    }
}

/// Reuses an inbound id from the first configured header present, else a fresh UUID.
#[derive(Clone)]
struct RequestIdFromHeaders {
    headers: Arc<Vec<HeaderName>>,
}

impl MakeRequestId for RequestIdFromHeaders {
    fn make_request_id<B>(&mut self, request: &http::Request<B>) -> Option<RequestId> {
        let existing = self
            .headers
            .iter()
            .find_map(|name| request.headers().get(name))
            .cloned();
        let value = existing.or_else(|| uuid::Uuid::new_v4().to_string().parse().ok())?;
        Some(RequestId::new(value))
    }
}

fn inference_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chat/completions", post(proxy_handler))
        .route("/v1/completions", post(proxy_handler))
        .route("/v1/embeddings", post(proxy_handler))
        .route("/v1/audio/transcriptions", post(proxy_handler))
        .route("/v1/models", get(v1_models))
}

/// Build the Axum application with all routes and middleware
pub fn build_app(
    app_state: Arc<AppState>,
    max_payload_size: usize,
    request_id_headers: Vec<String>,
    cors_allowed_origins: Vec<String>,
) -> Router {
    let mut id_headers: Vec<HeaderName> = request_id_headers
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();
    if id_headers.is_empty() {
        id_headers.push(HeaderName::from_static(DEFAULT_REQUEST_ID_HEADERS[0]));
    }
    let primary = id_headers[0].clone();

    let span_header = primary.clone();
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(move |req: &http::Request<Body>| {
            let request_id = req
                .headers()
                .get(&span_header)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!(
                "http_request",
                method = %req.method(),
                uri = %req.uri(),
                request_id = %request_id,
            )
        });

    Router::new()
        .merge(inference_routes())
        .nest("/openai", inference_routes())
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .fallback(sink_handler)
        // Request body size limiting
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            max_payload_size,
        ))
        .layer(PropagateRequestIdLayer::new(primary.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(
            primary,
            RequestIdFromHeaders {
                headers: Arc::new(id_headers),
            },
        ))
        .layer(create_cors_layer(cors_allowed_origins))
        .with_state(app_state)
}

fn logging_config(config: &DispatcherConfig) -> LoggingConfig {
    let level = config
        .log_level
        .as_deref()
        .and_then(|s| {
            let level = logging::parse_level(s);
            if level.is_none() {
                eprintln!("Invalid log level string: '{s}'. Defaulting to INFO.");
            }
            level
        })
        .unwrap_or(Level::INFO);
    LoggingConfig {
        level,
        json_format: config.log_json,
        log_dir: config.log_dir.clone(),
        ..Default::default()
    }
}

/// Endpoints of statically configured models, keyed by address.
pub fn static_endpoints(config: &DispatcherConfig) -> HashMap<String, HashMap<String, EndpointSpec>> {
    let RegistryConfig::Static { models } = &config.registry else {
        return HashMap::new();
    };
    models
        .iter()
        .map(|model| {
            let endpoints = model
                .endpoints
                .iter()
                .map(|address| {
                    (
                        address.clone(),
                        EndpointSpec::new(address.clone(), model.adapters.iter().cloned()),
                    )
                })
                .collect();
            (model.name.clone(), endpoints)
        })
        .collect()
}

/// Model registry for the configured mode, plus the pod reconciler task when
/// endpoints come from the cluster.
async fn create_model_client(
    config: &DispatcherConfig,
    load_balancer: Arc<LoadBalancer>,
    shutdown: &CancellationToken,
) -> anyhow::Result<(Arc<dyn ModelClient>, Option<JoinHandle<()>>)> {
    match &config.registry {
        RegistryConfig::Kubernetes => {
            let kube_client = kube::Client::try_default()
                .await
                .map_err(|e| ConfigurationError(format!("connecting to Kubernetes: {e}")))?;
            let model_client = KubeModelClient::new(
                kube_client.clone(),
                &config.model_servers.namespace,
                config.chwbl,
            );
            let reconciler = start_pod_reconciler(
                kube_client,
                config.model_servers.clone(),
                load_balancer,
                shutdown.child_token(),
            );
            Ok((Arc::new(model_client), Some(reconciler)))
        }
        RegistryConfig::Static { models } => {
            for (model, endpoints) in static_endpoints(config) {
                info!("Static model {} with {} endpoints", model, endpoints.len());
                load_balancer.reconcile(&model, endpoints);
            }
            let descriptors = models
                .iter()
                .map(|m| ModelDescriptor::from_static(m, &config.chwbl));
            Ok((Arc::new(StaticModelClient::new(descriptors)), None))
        }
    }
}

pub async fn startup(config: DispatcherConfig) -> anyhow::Result<()> {
    config.validate()?;

    // Only initialize logging once per process
    static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);
    let _log_guard = if !LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        Some(logging::init_logging(logging_config(&config)))
    } else {
        None
    };

    if let Some(prometheus_config) = config.prometheus.clone() {
        metrics::start_prometheus(prometheus_config);
    }

    info!(
        "Starting dispatcher on {}:{} | max_retries: {} | retry_codes: {:?} | max_payload: {}MB",
        config.host,
        config.port,
        config.max_retries,
        config.retry_codes,
        config.max_payload_size / (1024 * 1024)
    );

    let client = Client::builder()
        .pool_idle_timeout(Some(Duration::from_secs(50)))
        .pool_max_idle_per_host(500)
        .timeout(config.request_timeout)
        .connect_timeout(Duration::from_secs(10))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .build()
        .map_err(|e| ConfigurationError(format!("failed to create HTTP client: {e}")))?;

    let load_balancer = Arc::new(LoadBalancer::new(
        config.chwbl.default_replication,
        config.await_endpoint_timeout,
    ));
    let shutdown = CancellationToken::new();
    let (model_client, reconciler) =
        create_model_client(&config, load_balancer.clone(), &shutdown).await?;

    let mut context = AppContext::new(
        config.clone(),
        client.clone(),
        load_balancer.clone(),
        model_client.clone(),
    );
    context.shutdown = shutdown.clone();
    let context = Arc::new(context);

    let mut messengers = Vec::with_capacity(config.messaging.streams.len());
    for stream in &config.messaging.streams {
        let messenger = Arc::new(
            Messenger::new(
                stream,
                config.messaging.error_max_backoff,
                model_client.clone(),
                load_balancer.clone(),
                client.clone(),
            )
            .await?,
        );
        info!(
            "Consuming {} -> {} with {} handlers",
            stream.requests_url, stream.responses_url, stream.max_handlers
        );
        let cancel = shutdown.child_token();
        messengers.push(spawn(async move {
            let url = messenger.requests_url().to_string();
            if let Err(e) = messenger.run(cancel).await {
                error!("Messenger for {} failed: {:#}", url, e);
            }
        }));
    }

    let request_id_headers = config.request_id_headers.clone().unwrap_or_else(|| {
        DEFAULT_REQUEST_ID_HEADERS
            .iter()
            .map(|h| h.to_string())
            .collect()
    });

    let app_state = Arc::new(AppState {
        context: context.clone(),
    });
    let app = build_app(
        app_state,
        config.max_payload_size,
        request_id_headers,
        config.cors_allowed_origins.clone(),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    context.set_ready(true);
    info!("Listening on {}", addr);

    let signal_token = shutdown.clone();
    let served = serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await;

    context.set_ready(false);
    shutdown.cancel();
    for handle in messengers {
        if let Err(e) = handle.await {
            error!("Messenger task failed: {:?}", e);
        }
    }
    if let Some(reconciler) = reconciler {
        if let Err(e) = reconciler.await {
            error!("Pod reconciler task failed: {:?}", e);
        }
    }
    info!("Shutdown complete");

    served.map_err(Into::into)
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

// CORS Layer Creation
fn create_cors_layer(allowed_origins: Vec<String>) -> tower_http::cors::CorsLayer {
    use tower_http::cors::Any;

    let cors = if allowed_origins.is_empty() {
        // Allow all origins if none specified
        tower_http::cors::CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any)
    } else {
        let origins: Vec<http::HeaderValue> = allowed_origins
            .into_iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        tower_http::cors::CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
            .allow_headers([
                http::header::CONTENT_TYPE,
                http::header::AUTHORIZATION,
                HeaderName::from_static(LABEL_SELECTOR_HEADER),
            ])
            .expose_headers([HeaderName::from_static(DEFAULT_REQUEST_ID_HEADERS[0])])
    };

    cors.max_age(Duration::from_secs(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticModelConfig;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn static_config(endpoints: Vec<String>) -> DispatcherConfig {
        DispatcherConfig {
            registry: RegistryConfig::Static {
                models: vec![StaticModelConfig {
                    name: "m0".to_string(),
                    owner: "acme".to_string(),
                    features: vec!["TextGeneration".to_string()],
                    adapters: vec!["a1".to_string()],
                    endpoints,
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
    }

    async fn test_app(config: DispatcherConfig) -> (Router, Arc<AppContext>) {
        let load_balancer = Arc::new(LoadBalancer::default());
        let (model_client, _) =
            create_model_client(&config, load_balancer.clone(), &CancellationToken::new())
                .await
                .unwrap();
        let context = Arc::new(AppContext::new(
            config.clone(),
            Client::new(),
            load_balancer,
            model_client,
        ));
        let app = build_app(
            Arc::new(AppState {
                context: context.clone(),
            }),
            config.max_payload_size,
            vec!["x-request-id".to_string()],
            vec![],
        );
        (app, context)
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_liveness_and_readiness() {
        let (app, context) = test_app(static_config(vec![])).await;

        let resp = app
            .clone()
            .oneshot(http::Request::get("/liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(http::Request::get("/readiness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        context.set_ready(true);
        let resp = app
            .oneshot(http::Request::get("/readiness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_models_listed_with_and_without_prefix() {
        let (app, _) = test_app(static_config(vec![])).await;

        for uri in ["/v1/models", "/openai/v1/models"] {
            let resp = app
                .clone()
                .oneshot(http::Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
            let body = body_json(resp).await;
            assert_eq!(body["object"], "list");
            let ids: Vec<&str> = body["data"]
                .as_array()
                .unwrap()
                .iter()
                .map(|m| m["id"].as_str().unwrap())
                .collect();
            assert_eq!(ids, vec!["m0", "m0/a1"]);
        }
    }

    #[tokio::test]
    async fn test_models_feature_filter_and_bad_selector() {
        let (app, _) = test_app(static_config(vec![])).await;

        let resp = app
            .clone()
            .oneshot(
                http::Request::get("/v1/models?feature=TextEmbedding")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await["data"].as_array().unwrap().is_empty());

        let resp = app
            .oneshot(
                http::Request::get("/v1/models")
                    .header(LABEL_SELECTOR_HEADER, "tier in (a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_with_request_id() {
        let (app, _) = test_app(static_config(vec![])).await;

        let resp = app
            .clone()
            .oneshot(http::Request::get("/v2/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().contains_key("x-request-id"));

        let resp = app
            .oneshot(
                http::Request::get("/liveness")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn test_openai_prefix_is_stripped_before_proxying() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&upstream)
            .await;

        let (app, context) = test_app(static_config(vec![upstream.address().to_string()])).await;
        let resp = app
            .oneshot(
                http::Request::post("/openai/v1/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model": "m0", "prompt": "hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"ok": true}));
        assert_eq!(context.load_balancer.model_in_flight("m0"), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let (app, _) = test_app(static_config(vec![])).await;
        let resp = app
            .oneshot(
                http::Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model": "nope", "messages": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_static_endpoints_carry_adapters() {
        let config = static_config(vec!["10.0.0.1:8000".to_string()]);
        let endpoints = static_endpoints(&config);
        let spec = &endpoints["m0"]["10.0.0.1:8000"];
        assert_eq!(spec.address, "10.0.0.1:8000");
        assert!(spec.adapters.contains("a1"));
    }
}
