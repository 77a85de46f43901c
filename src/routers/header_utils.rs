use http::header::{HeaderName, CONTENT_LENGTH, HOST};
use http::HeaderMap;

/// Hop-by-hop headers, never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Headers to send upstream for a proxied request.
///
/// The inbound `Host` is kept so the worker sees the host the client used.
/// `Content-Length` is dropped because the body may have been rewritten.
pub fn forward_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound.iter() {
        if is_hop_by_hop(name) || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Headers to return to the client from an upstream response.
/// The body is re-streamed, so framing headers are left to the server.
pub fn preserve_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream.iter() {
        if is_hop_by_hop(name) || name == CONTENT_LENGTH || name == HOST {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
    use http::HeaderValue;

    #[test]
    fn test_forward_request_headers_keeps_host_and_drops_framing() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("api.example.com"));
        inbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.append("x-label-selector", HeaderValue::from_static("a=b"));
        inbound.append("x-label-selector", HeaderValue::from_static("c=d"));

        let out = forward_request_headers(&inbound);
        assert_eq!(out.get(HOST).unwrap(), "api.example.com");
        assert_eq!(out.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(out.get(CONTENT_LENGTH).is_none());
        assert!(out.get(CONNECTION).is_none());
        assert_eq!(out.get_all("x-label-selector").iter().count(), 2);
    }

    #[test]
    fn test_preserve_response_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        upstream.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        upstream.insert("x-worker", HeaderValue::from_static("pod-1"));

        let out = preserve_response_headers(&upstream);
        assert_eq!(out.get(CONTENT_TYPE).unwrap(), "text/event-stream");
        assert_eq!(out.get("x-worker").unwrap(), "pod-1");
        assert!(out.get(TRANSFER_ENCODING).is_none());
        assert!(out.get(CONTENT_LENGTH).is_none());
    }
}
