//! Turning an inbound HTTP or message payload into a routable [`Request`].

use bytes::{BufMut, Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use tracing::debug;

use super::spec::InferenceRequest;
use crate::core::model::LoadBalancing;
use crate::core::model_client::ModelClient;
use crate::policies::RoutingHints;
use crate::types::DispatchError;

pub const LABEL_SELECTOR_HEADER: &str = "x-label-selector";
pub const ROUTING_KEY_HEADER: &str = "routing-key";

const ADAPTER_SEPARATOR: char = '/';
const MULTIPART_FORM_DATA: &str = "multipart/form-data";

/// Splits a requested model name on the first `/` into model and adapter.
pub fn split_model_adapter(requested: &str) -> (String, String) {
    match requested.split_once(ADAPTER_SEPARATOR) {
        Some((model, adapter)) => (model.to_string(), adapter.to_string()),
        None => (requested.to_string(), String::new()),
    }
}

pub fn merge_model_adapter(model: &str, adapter: &str) -> String {
    if adapter.is_empty() {
        model.to_string()
    } else {
        format!("{model}{ADAPTER_SEPARATOR}{adapter}")
    }
}

/// A parsed inference request. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub id: String,
    /// Model as the client sent it, possibly `model/adapter`
    pub requested_model: String,
    pub model: String,
    pub adapter: String,
    pub selectors: Vec<String>,
    pub prefix: String,
    pub routing_key: String,
    pub load_balancing: LoadBalancing,
    pub path: String,
    /// Body to forward, rewritten when the adapter or multipart form required it
    pub body: Bytes,
    pub content_length: usize,
}

impl Request {
    /// A request for `model` with no body, used where routing is exercised
    /// without a client payload.
    pub fn new(model: impl Into<String>, load_balancing: LoadBalancing) -> Self {
        let model = model.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requested_model: model.clone(),
            model,
            load_balancing,
            ..Default::default()
        }
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = adapter.into();
        self.requested_model = merge_model_adapter(&self.model, &self.adapter);
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn routing_hints(&self) -> RoutingHints<'_> {
        RoutingHints {
            adapter: &self.adapter,
            prefix: &self.prefix,
            routing_key: &self.routing_key,
        }
    }
}

/// Parse `body` received on `path`, resolve the model through `client` and
/// compute the routing prefix when the model hashes on it.
pub async fn parse_request(
    client: &dyn ModelClient,
    body: Bytes,
    path: &str,
    headers: &HeaderMap,
) -> Result<Request, DispatchError> {
    let mut request = Request {
        id: uuid::Uuid::new_v4().to_string(),
        path: path.to_string(),
        selectors: headers
            .get_all(LABEL_SELECTOR_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect(),
        routing_key: headers
            .get(ROUTING_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    };

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let inference = if media_type == MULTIPART_FORM_DATA {
        let boundary = multer::parse_boundary(content_type).map_err(|e| {
            DispatchError::BadRequest(format!("reading multipart form data: {e}"))
        })?;
        let (rewritten, model) = strip_model_part(body, &boundary)
            .await
            .map_err(|e| DispatchError::BadRequest(format!("reading multipart form data: {e}")))?;
        let model = model.ok_or_else(|| {
            DispatchError::BadRequest("missing 'model' field in multipart form".to_string())
        })?;
        request.requested_model = model;
        request.body = rewritten;
        None
    } else {
        let mut inference = InferenceRequest::from_slice(path, &body)
            .ok_or_else(|| DispatchError::BadRequest(format!("unknown path: {path:?}")))?
            .map_err(|e| DispatchError::BadRequest(format!("reading model from body: {e}")))?;
        if inference.model().is_empty() {
            return Err(DispatchError::BadRequest(
                "missing 'model' field".to_string(),
            ));
        }
        request.requested_model = inference.model().to_string();
        let (_, adapter) = split_model_adapter(&request.requested_model);
        if !adapter.is_empty() {
            // vLLM expects the adapter name in the model field
            inference.set_model(adapter);
        }
        request.body = inference
            .to_vec()
            .map(Bytes::from)
            .map_err(|e| DispatchError::BadRequest(format!("re-encoding body: {e}")))?;
        Some(inference)
    };

    let (model, adapter) = split_model_adapter(&request.requested_model);
    request.model = model;
    request.adapter = adapter;
    request.content_length = request.body.len();

    let descriptor = client
        .lookup_model(&request.model, &request.adapter, &request.selectors)
        .await
        .map_err(|e| DispatchError::Internal(format!("lookup model: {e:#}")))?
        .ok_or_else(|| DispatchError::ModelNotFound(format!("{:?}", request.requested_model)))?;

    request.load_balancing = descriptor.load_balancing;
    if let (
        LoadBalancing::PrefixHash {
            prefix_char_length, ..
        },
        Some(inference),
    ) = (&request.load_balancing, &inference)
    {
        request.prefix = inference.prefix(*prefix_char_length);
    }

    debug!(
        request_id = %request.id,
        model = %request.model,
        adapter = %request.adapter,
        "Parsed inference request"
    );
    Ok(request)
}

/// Re-emit a multipart form without its `model` part, keeping the boundary.
/// Returns the new body and the value of the removed `model` part.
pub async fn strip_model_part(
    body: Bytes,
    boundary: &str,
) -> Result<(Bytes, Option<String>), multer::Error> {
    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut out = BytesMut::new();
    let mut model = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("model") {
            model = Some(field.text().await?);
            continue;
        }

        out.put_slice(b"--");
        out.put_slice(boundary.as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in field.headers() {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        let data = field.bytes().await?;
        out.put_slice(&data);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"--");
    out.put_slice(boundary.as_bytes());
    out.put_slice(b"--\r\n");

    Ok((out.freeze(), model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_model_adapter() {
        assert_eq!(split_model_adapter("m/a"), ("m".into(), "a".into()));
        assert_eq!(split_model_adapter("m/a/b"), ("m".into(), "a/b".into()));
        assert_eq!(split_model_adapter("m"), ("m".into(), "".into()));
    }

    #[test]
    fn test_merge_model_adapter() {
        assert_eq!(merge_model_adapter("m", ""), "m");
        assert_eq!(merge_model_adapter("m", "a"), "m/a");
        let (m, a) = split_model_adapter(&merge_model_adapter("m", "a/b"));
        assert_eq!((m.as_str(), a.as_str()), ("m", "a/b"));
    }

    #[tokio::test]
    async fn test_strip_model_part_keeps_other_fields() {
        let body = "--xyz\r\n\
            Content-Disposition: form-data; name=\"model\"\r\n\r\n\
            whisper\r\n\
            --xyz\r\n\
            Content-Disposition: form-data; name=\"language\"\r\n\r\n\
            en\r\n\
            --xyz--\r\n";
        let (out, model) = strip_model_part(Bytes::from(body), "xyz").await.unwrap();
        assert_eq!(model.as_deref(), Some("whisper"));

        let out = String::from_utf8(out.to_vec()).unwrap();
        assert!(out.starts_with("--xyz\r\n"));
        assert!(out.contains("name=\"language\""));
        assert!(out.contains("\r\n\r\nen\r\n"));
        assert!(!out.contains("whisper"));
        assert!(out.ends_with("--xyz--\r\n"));
    }
}
