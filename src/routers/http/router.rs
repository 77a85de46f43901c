//! Reverse proxy from the OpenAI-compatible surface to model workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::{InFlightGuard, LoadBalancer, ModelClient};
use crate::metrics::{ActiveRequestGuard, DispatcherMetrics, RequestType};
use crate::protocols::request::{parse_request, Request};
use crate::routers::header_utils;
use crate::types::{error_response, DispatchError};

/// Outcome of one upstream attempt
enum Attempt {
    Response(reqwest::Response),
    Transport(reqwest::Error),
}

/// Forwards inference requests to the endpoint chosen by the load balancer,
/// retrying on configured status codes and connection failures.
#[derive(Clone)]
pub struct ModelProxy {
    client: reqwest::Client,
    load_balancer: Arc<LoadBalancer>,
    model_client: Arc<dyn ModelClient>,
    max_retries: u32,
    retry_codes: Arc<HashSet<u16>>,
}

impl std::fmt::Debug for ModelProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProxy")
            .field("max_retries", &self.max_retries)
            .field("retry_codes", &self.retry_codes)
            .finish()
    }
}

impl ModelProxy {
    pub fn new(
        client: reqwest::Client,
        load_balancer: Arc<LoadBalancer>,
        model_client: Arc<dyn ModelClient>,
        max_retries: u32,
        retry_codes: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            client,
            load_balancer,
            model_client,
            max_retries,
            retry_codes: Arc::new(retry_codes.into_iter().collect()),
        }
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn model_client(&self) -> &Arc<dyn ModelClient> {
        &self.model_client
    }

    fn is_retriable(&self, status: StatusCode) -> bool {
        self.retry_codes.contains(&status.as_u16())
    }

    /// Serve one client request. `path_and_query` is forwarded unchanged;
    /// only scheme and authority are replaced by the selected endpoint.
    pub async fn serve(
        &self,
        cancel: CancellationToken,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let start = Instant::now();
        let path = path_and_query
            .split_once('?')
            .map_or(path_and_query, |(p, _)| p);

        let request = match parse_request(self.model_client.as_ref(), body, path, &headers).await {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting request on {}: {}", path, e);
                return e.into_response();
            }
        };

        let active = ActiveRequestGuard::new(&request.model, RequestType::Http);

        if let Err(e) = self
            .model_client
            .scale_at_least_one_replica(&request.model)
            .await
        {
            error!(
                request_id = %request.id,
                "Failed to scale model {} to at least one replica: {:#}", request.model, e
            );
            return self.finish(
                &request,
                start,
                DispatchError::Internal(format!("scale model: {e}")).into_response(),
            );
        }

        let forward_headers = header_utils::forward_request_headers(&headers);
        let mut attempt: u32 = 0;
        loop {
            let (address, guard) = match self
                .load_balancer
                .await_best_address(&cancel, &request)
                .await
            {
                Ok(selected) => selected,
                Err(e) => {
                    warn!(request_id = %request.id, "No endpoint for model {}: {}", request.model, e);
                    return self.finish(&request, start, e.into_response());
                }
            };

            let url = format!("http://{address}{path_and_query}");
            debug!(
                request_id = %request.id,
                attempt,
                "Proxying {} {} to {}", method, path, url
            );

            let outcome = self
                .send(&cancel, &method, &url, &forward_headers, &request)
                .await;
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    drop(guard);
                    return self.finish(&request, start, DispatchError::Cancelled.into_response());
                }
            };

            let can_retry = attempt < self.max_retries;
            match outcome {
                Attempt::Response(res) if can_retry && self.is_retriable(res.status()) => {
                    warn!(
                        request_id = %request.id,
                        "Endpoint {} returned {}, retrying ({}/{})",
                        address,
                        res.status(),
                        attempt + 1,
                        self.max_retries
                    );
                    DispatcherMetrics::record_retry(&request.model, Some(res.status().as_u16()));
                    drop(res);
                    drop(guard);
                }
                Attempt::Response(res) => {
                    let response = stream_response(res, guard, active);
                    return self.finish(&request, start, response);
                }
                Attempt::Transport(e) if can_retry => {
                    warn!(
                        request_id = %request.id,
                        "Request to {} failed: {}, retrying ({}/{})",
                        address,
                        e,
                        attempt + 1,
                        self.max_retries
                    );
                    DispatcherMetrics::record_retry(&request.model, None);
                    drop(guard);
                }
                Attempt::Transport(e) => {
                    error!(
                        request_id = %request.id,
                        "Request to {} failed: {}, giving up", address, e
                    );
                    drop(guard);
                    let response = error_response(
                        StatusCode::BAD_GATEWAY,
                        &format!("proxy: exceeded retries: {}/{}", attempt, self.max_retries),
                    );
                    return self.finish(&request, start, response);
                }
            }
            attempt += 1;
        }
    }

    /// Returns `None` when `cancel` fired before the upstream answered.
    async fn send(
        &self,
        cancel: &CancellationToken,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        request: &Request,
    ) -> Option<Attempt> {
        let builder = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(request.body.clone());

        tokio::select! {
            result = builder.send() => Some(match result {
                Ok(res) => Attempt::Response(res),
                Err(e) => Attempt::Transport(e),
            }),
            _ = cancel.cancelled() => None,
        }
    }

    fn finish(&self, request: &Request, start: Instant, response: Response) -> Response {
        DispatcherMetrics::record_request(
            &request.model,
            RequestType::Http,
            response.status().as_u16(),
        );
        DispatcherMetrics::record_request_duration(&request.model, RequestType::Http, start.elapsed());
        response
    }
}

/// Stream the upstream body to the client. The in-flight slot and the
/// active request gauge are held until the stream ends or the client leaves.
fn stream_response(
    res: reqwest::Response,
    guard: InFlightGuard,
    active: ActiveRequestGuard,
) -> Response {
    let status = res.status();
    let headers = header_utils::preserve_response_headers(res.headers());
    let mut stream = res.bytes_stream();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();

    tokio::spawn(async move {
        let _guard = guard;
        let _active = active;
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if tx.send(Ok(bytes)).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Upstream stream error: {}", e);
                        let _ = tx.send(Err(std::io::Error::other(e)));
                        break;
                    }
                    None => break,
                },
                _ = tx.closed() => {
                    debug!("Client went away before the upstream stream ended");
                    break;
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(UnboundedReceiverStream::new(rx)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::LoadBalancing;
    use crate::core::{EndpointSpec, ModelDescriptor, StaticModelClient};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy_for(server: &MockServer, max_retries: u32) -> ModelProxy {
        let lb = Arc::new(LoadBalancer::default());
        let mut observed = HashMap::new();
        observed.insert(
            "pod-0".to_string(),
            EndpointSpec::new(server.address().to_string(), ["lora"]),
        );
        lb.reconcile("m", observed);
        let models = StaticModelClient::new([
            ModelDescriptor::new("m", LoadBalancing::LeastLoad).with_adapters(["lora"])
        ]);
        ModelProxy::new(
            reqwest::Client::new(),
            lb,
            Arc::new(models),
            max_retries,
            crate::config::DEFAULT_RETRY_CODES,
        )
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        headers
    }

    #[tokio::test]
    async fn test_forwards_rewritten_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .and(body_json(serde_json::json!({"model": "lora", "prompt": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let proxy = proxy_for(&server, 0);
        let response = proxy
            .serve(
                CancellationToken::new(),
                Method::POST,
                "/v1/completions",
                json_headers(),
                Bytes::from(r#"{"model":"m/lora","prompt":"hi"}"#),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
        assert_eq!(proxy.load_balancer().model_in_flight("m"), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let server = MockServer::start().await;
        let proxy = proxy_for(&server, 0);
        let response = proxy
            .serve(
                CancellationToken::new(),
                Method::POST,
                "/v1/completions",
                json_headers(),
                Bytes::from(r#"{"model":"nope","prompt":"hi"}"#),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_non_retriable_status_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(1)
            .mount(&server)
            .await;

        let proxy = proxy_for(&server, 3);
        let response = proxy
            .serve(
                CancellationToken::new(),
                Method::POST,
                "/v1/completions",
                json_headers(),
                Bytes::from(r#"{"model":"m","prompt":"hi"}"#),
            )
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_scale_nudge_before_routing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let lb = Arc::new(LoadBalancer::default());
        lb.reconcile(
            "m",
            HashMap::from([(
                "pod-0".to_string(),
                EndpointSpec::new(server.address().to_string(), Vec::<String>::new()),
            )]),
        );
        let models = Arc::new(StaticModelClient::new([ModelDescriptor::new(
            "m",
            LoadBalancing::LeastLoad,
        )]));
        let proxy = ModelProxy::new(reqwest::Client::new(), lb, models.clone(), 0, [503]);

        let response = proxy
            .serve(
                CancellationToken::new(),
                Method::POST,
                "/v1/embeddings",
                json_headers(),
                Bytes::from(r#"{"model":"m","input":"x"}"#),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(models.scale_requests("m"), 1);
    }
}
