//! HTTP interaction engine.
//!
//! Builds, sends and records a single HTTP exchange. Every status code is a
//! completed interaction; only transport-level failures (timeout, refused
//! connection, DNS) produce an error, with a typed message. Retry policy
//! lives a layer up, never here.
//!
//! Alongside the decoded snapshots the engine renders two diagnostic
//! strings per request: a reproducible `curl` invocation and the raw
//! HTTP/1.1 wire form. Persisted snapshots keep header order as observed;
//! casing is best-effort since the transport normalizes names.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::info;

use crate::errors::ErrorCode;
use crate::suite::HttpMethod;

/// A fully interpolated request, ready to send.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// What was actually sent, plus the reproducible diagnostic strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    pub curl_command: String,
    pub raw_request: String,
}

/// The decoded response plus its raw form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,

    /// Parsed JSON when the payload is JSON, the raw string otherwise.
    pub body: Value,

    /// UTF-8 length of the raw payload.
    pub size_bytes: usize,

    pub response_time_ms: u64,
    pub raw_response: String,
}

impl ResponseSnapshot {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of one exchange: the request always, the response when the
/// transport produced one, a typed error otherwise.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
}

pub struct HttpEngine {
    /// Shared client so the connection pool survives across steps.
    client: Client,
}

impl HttpEngine {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Sends one request. Statuses are never errors here.
    #[tracing::instrument(
        name = "http_request",
        skip_all,
        fields(
            step.name = %step_name,
            http.method = %request.method,
            http.url = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
            http.duration_ms = tracing::field::Empty,
            otel.kind = "client"
        )
    )]
    pub async fn execute(
        &self,
        step_name: &str,
        request: &ResolvedRequest,
        base_url: Option<&str>,
    ) -> HttpOutcome {
        let span = tracing::Span::current();

        let url = assemble_url(&request.url, base_url);
        let url = append_query(&url, &request.params);
        let headers = sanitize_headers(&request.headers);
        span.record("http.url", url.as_str());

        let snapshot = build_request_snapshot(request.method, &url, &headers, request.body.as_ref());

        let method = to_reqwest_method(request.method);
        let mut builder = self.client.request(method, &url).timeout(request.timeout);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let result = builder.send().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        span.record("http.duration_ms", duration_ms as i64);

        match result {
            Ok(response) => {
                let status = response.status();
                span.record("http.status_code", status.as_u16() as i64);

                let response_headers: Vec<(String, String)> = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                    })
                    .collect();

                let raw_body = response.text().await.unwrap_or_default();
                let size_bytes = raw_body.len();
                let body: Value = serde_json::from_str(&raw_body)
                    .unwrap_or_else(|_| Value::String(raw_body.clone()));

                let raw_response =
                    build_raw_response(status.as_u16(), status.canonical_reason(), &response_headers, &raw_body);

                info!(
                    step = %step_name,
                    status = status.as_u16(),
                    duration_ms,
                    size_bytes,
                    "http exchange finished"
                );

                HttpOutcome {
                    request: snapshot,
                    response: Some(ResponseSnapshot {
                        status_code: status.as_u16(),
                        headers: response_headers,
                        body,
                        size_bytes,
                        response_time_ms: duration_ms,
                        raw_response,
                    }),
                    error: None,
                    error_code: None,
                }
            }
            Err(e) => {
                let (message, code) = classify_transport_error(&e, request.timeout);
                info!(step = %step_name, error = %message, code = %code, "http exchange failed");
                HttpOutcome {
                    request: snapshot,
                    response: None,
                    error: Some(message),
                    error_code: Some(code),
                }
            }
        }
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// Absolute URLs pass through; relative ones join the base with exactly one
/// slash between.
pub fn assemble_url(url: &str, base_url: Option<&str>) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    match base_url {
        Some(base) if !base.is_empty() => {
            let base = base.trim_end_matches('/');
            if url.starts_with('/') {
                format!("{base}{url}")
            } else {
                format!("{base}/{url}")
            }
        }
        _ => url.to_string(),
    }
}

/// Appends URL-encoded query parameters, preserving declaration order.
pub fn append_query(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    let separator = if url.contains('?') { "&" } else { "?" };
    format!("{}{}{}", url, separator, query.join("&"))
}

/// Strips characters outside printable ASCII from names and values and
/// drops entries left empty. Keeps order.
pub fn sanitize_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name: String = name.chars().filter(|c| (' '..='~').contains(c)).collect();
            let name = name.trim().to_string();
            let value: String = value.chars().filter(|c| (' '..='~').contains(c)).collect();
            let value = value.trim().to_string();
            if name.is_empty() || value.is_empty() {
                None
            } else {
                Some((name, value))
            }
        })
        .collect()
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_default()
}

fn path_and_query(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(u) => {
            let mut p = u.path().to_string();
            if let Some(q) = u.query() {
                p.push('?');
                p.push_str(q);
            }
            p
        }
        Err(_) => url.to_string(),
    }
}

fn build_request_snapshot(
    method: HttpMethod,
    url: &str,
    headers: &[(String, String)],
    body: Option<&Value>,
) -> RequestSnapshot {
    let body_text = body.map(|b| serde_json::to_string(b).unwrap_or_default());

    let mut curl = format!("curl -X {} '{}'", method.as_str(), url);
    for (name, value) in headers {
        curl.push_str(&format!(" -H '{name}: {value}'"));
    }
    if let Some(text) = &body_text {
        curl.push_str(" -H 'Content-Type: application/json'");
        curl.push_str(&format!(" -d '{text}'"));
    }

    let mut raw = format!("{} {} HTTP/1.1\r\n", method.as_str(), path_and_query(url));
    raw.push_str(&format!("Host: {}\r\n", host_of(url)));
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(text) = &body_text {
        if method.carries_body() {
            raw.push_str(&format!("Content-Length: {}\r\n", text.len()));
        }
    }
    raw.push_str("\r\n");
    if let Some(text) = &body_text {
        raw.push_str(text);
    }

    RequestSnapshot {
        method: method.as_str().to_string(),
        url: url.to_string(),
        headers: headers.to_vec(),
        body: body.cloned(),
        curl_command: curl,
        raw_request: raw,
    }
}

fn build_raw_response(
    status: u16,
    reason: Option<&str>,
    headers: &[(String, String)],
    body: &str,
) -> String {
    let mut raw = format!("HTTP/1.1 {} {}\r\n", status, reason.unwrap_or(""));
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    raw
}

/// Maps a transport failure onto the fixed message taxonomy.
fn classify_transport_error(error: &reqwest::Error, timeout: Duration) -> (String, ErrorCode) {
    if error.is_timeout() {
        return (
            format!("Timeout after {}ms", timeout.as_millis()),
            ErrorCode::HTTP_TIMEOUT,
        );
    }
    if let Some(status) = error.status() {
        return (
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown")
            ),
            ErrorCode::HTTP_TRANSPORT,
        );
    }
    if error.is_connect() {
        let chain = source_chain(error);
        if chain.contains("refused") {
            return (
                "Connection refused by server".to_string(),
                ErrorCode::HTTP_CONNECTION_REFUSED,
            );
        }
        if chain.contains("dns") || chain.contains("lookup") {
            return ("Server not found (DNS)".to_string(), ErrorCode::HTTP_DNS);
        }
        return (
            "No response from server".to_string(),
            ErrorCode::HTTP_NO_RESPONSE,
        );
    }
    if error.is_request() && error.is_body() {
        return (
            "No response from server".to_string(),
            ErrorCode::HTTP_NO_RESPONSE,
        );
    }
    (error.to_string(), ErrorCode::HTTP_TRANSPORT)
}

fn source_chain(error: &dyn std::error::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absolute_urls_pass_through() {
        assert_eq!(
            assemble_url("https://api.example.com/x", Some("http://base")),
            "https://api.example.com/x"
        );
    }

    #[test]
    fn relative_urls_join_the_base_with_one_slash() {
        assert_eq!(
            assemble_url("/ping", Some("http://base/")),
            "http://base/ping"
        );
        assert_eq!(assemble_url("ping", Some("http://base")), "http://base/ping");
        assert_eq!(assemble_url("/ping", None), "/ping");
    }

    #[test]
    fn query_params_are_encoded_in_order() {
        let params = vec![
            ("q".to_string(), "a b".to_string()),
            ("page".to_string(), "2".to_string()),
        ];
        assert_eq!(
            append_query("http://x/s", &params),
            "http://x/s?q=a%20b&page=2"
        );
        assert_eq!(
            append_query("http://x/s?k=1", &params),
            "http://x/s?k=1&q=a%20b&page=2"
        );
    }

    #[test]
    fn header_sanitization_strips_non_printable_and_drops_empties() {
        let headers = vec![
            ("X-Ok".to_string(), "value".to_string()),
            ("X-Ctl\u{7}".to_string(), "va\u{1}lue".to_string()),
            ("\u{2}\u{3}".to_string(), "gone".to_string()),
            ("X-Empty".to_string(), "\u{0}".to_string()),
        ];
        let sanitized = sanitize_headers(&headers);
        assert_eq!(
            sanitized,
            vec![
                ("X-Ok".to_string(), "value".to_string()),
                ("X-Ctl".to_string(), "value".to_string()),
            ]
        );
    }

    #[test]
    fn raw_request_has_method_host_headers_and_body_once_in_order() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer T".to_string()),
            ("X-One".to_string(), "1".to_string()),
        ];
        let body = json!({"a": 1});
        let snapshot = build_request_snapshot(
            HttpMethod::Post,
            "http://api.example.com:8080/users?active=true",
            &headers,
            Some(&body),
        );

        let raw = &snapshot.raw_request;
        assert!(raw.starts_with("POST /users?active=true HTTP/1.1\r\n"));
        assert_eq!(raw.matches("Host: api.example.com:8080").count(), 1);
        assert_eq!(raw.matches("Authorization: Bearer T").count(), 1);
        assert_eq!(raw.matches("Content-Length:").count(), 1);
        assert_eq!(raw.matches(r#"{"a":1}"#).count(), 1);

        let host_pos = raw.find("Host:").unwrap();
        let auth_pos = raw.find("Authorization:").unwrap();
        let one_pos = raw.find("X-One:").unwrap();
        assert!(host_pos < auth_pos && auth_pos < one_pos);
    }

    #[test]
    fn get_requests_have_no_content_length() {
        let snapshot =
            build_request_snapshot(HttpMethod::Get, "http://x/ping", &[], None);
        assert!(!snapshot.raw_request.contains("Content-Length"));
        assert!(snapshot.raw_request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn curl_command_is_reproducible() {
        let headers = vec![("X-Token".to_string(), "abc".to_string())];
        let body = json!({"k": "v"});
        let snapshot =
            build_request_snapshot(HttpMethod::Put, "http://x/item/1", &headers, Some(&body));
        assert_eq!(
            snapshot.curl_command,
            "curl -X PUT 'http://x/item/1' -H 'X-Token: abc' -H 'Content-Type: application/json' -d '{\"k\":\"v\"}'"
        );
    }

    #[test]
    fn raw_response_includes_status_line_headers_and_body() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let raw = build_raw_response(404, Some("Not Found"), &headers, r#"{"error":"nope"}"#);
        assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(raw.contains("content-type: application/json\r\n"));
        assert!(raw.ends_with(r#"{"error":"nope"}"#));
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let snapshot = ResponseSnapshot {
            status_code: 200,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: Value::Null,
            size_bytes: 0,
            response_time_ms: 1,
            raw_response: String::new(),
        };
        assert_eq!(snapshot.header("content-type"), Some("text/plain"));
        assert_eq!(snapshot.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(snapshot.header("x-missing"), None);
    }

    #[tokio::test]
    async fn refused_connection_maps_to_typed_message() {
        let engine = HttpEngine::new();
        let request = ResolvedRequest {
            method: HttpMethod::Get,
            url: "http://127.0.0.1:1/unreachable".to_string(),
            headers: vec![],
            params: vec![],
            body: None,
            timeout: Duration::from_secs(2),
        };
        let outcome = engine.execute("refused", &request, None).await;
        assert!(outcome.response.is_none());
        let error = outcome.error.unwrap();
        assert!(
            error == "Connection refused by server" || error == "No response from server",
            "unexpected error: {error}"
        );
    }
}
