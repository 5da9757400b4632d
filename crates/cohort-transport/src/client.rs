//! The request primitive.
//!
//! One call, one network request, two outcomes: the decoded JSON body, or an
//! [`AjaxRejection`]. Nothing is retried here; whether a failed request may be
//! repeated depends on server-side side effects the transport cannot see.

use crate::error::Result;
use crate::rejection::{AjaxRejection, Method, Payload};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How POST payloads are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyEncoding {
    /// `application/x-www-form-urlencoded`, nested values JSON-encoded.
    #[default]
    Form,
    /// `application/json`.
    Json,
}

impl std::str::FromStr for BodyEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "form" => Ok(Self::Form),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown body encoding: {other}")),
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Experiment server root; routes are resolved against it.
    pub base_url: Url,
    /// Per-request timeout.
    pub timeout: Duration,
    /// POST body encoding.
    pub body_encoding: BodyEncoding,
}

impl TransportConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: DEFAULT_TIMEOUT,
            body_encoding: BodyEncoding::default(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_body_encoding(mut self, encoding: BodyEncoding) -> Self {
        self.body_encoding = encoding;
        self
    }
}

/// Uniform HTTP request helper for the experiment API.
#[derive(Debug, Clone)]
pub struct Transport {
    base_url: Url,
    client: Client,
    body_encoding: BodyEncoding,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            base_url: config.base_url,
            client,
            body_encoding: config.body_encoding,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The underlying HTTP client, for callers that post outside the
    /// JSON request/response contract.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve a route (which may carry its own query string) against the
    /// server root.
    pub fn resolve(&self, route: &str) -> std::result::Result<Url, url::ParseError> {
        self.base_url.join(route)
    }

    pub async fn get(&self, route: &str, data: Option<&Payload>) -> std::result::Result<Value, AjaxRejection> {
        self.request(Method::Get, route, data).await
    }

    pub async fn post(&self, route: &str, data: Option<&Payload>) -> std::result::Result<Value, AjaxRejection> {
        self.request(Method::Post, route, data).await
    }

    /// Issue exactly one request.
    pub async fn request(
        &self,
        method: Method,
        route: &str,
        data: Option<&Payload>,
    ) -> std::result::Result<Value, AjaxRejection> {
        let empty = Payload::new();
        let payload = data.unwrap_or(&empty);
        let reject = |status: u16, html: String, reason: String| {
            let rejection = AjaxRejection::new(method, route, payload, status, html, reason);
            warn!(
                method = %method,
                route = %route,
                status = rejection.status,
                reason = %rejection.reason,
                "Request rejected"
            );
            rejection
        };

        let url = self
            .resolve(route)
            .map_err(|e| reject(0, String::new(), format!("invalid route: {e}")))?;

        let builder = match method {
            Method::Get => {
                let builder = self.client.get(url);
                match data {
                    Some(data) => builder.query(&flatten(data)),
                    None => builder,
                }
            }
            Method::Post => {
                let builder = self.client.post(url);
                match (data, self.body_encoding) {
                    (Some(data), BodyEncoding::Form) => builder.form(&flatten(data)),
                    (Some(data), BodyEncoding::Json) => builder.json(data),
                    (None, _) => builder,
                }
            }
        };

        debug!(method = %method, route = %route, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| reject(0, String::new(), e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| reject(status.as_u16(), String::new(), e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| {
                reject(
                    status.as_u16(),
                    String::new(),
                    format!("undecodable response body: {e}"),
                )
            })
        } else {
            Err(reject(status.as_u16(), error_page(&body), format!("HTTP {status}")))
        }
    }
}

/// Flatten a payload into string pairs for query and form encoding.
fn flatten(data: &Payload) -> Vec<(String, String)> {
    data.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Extract a server-rendered error page from a failure body.
fn error_page(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("html").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> Transport {
        let base = Url::parse(&server.uri()).unwrap();
        Transport::new(TransportConfig::new(base)).unwrap()
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn resolves_with_decoded_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/participant/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"participant": {"id": 42}})),
            )
            .mount(&server)
            .await;

        let resp = transport(&server).get("/participant/42", None).await.unwrap();
        assert_eq!(resp["participant"]["id"], 42);
    }

    #[tokio::test]
    async fn server_error_page_is_captured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/node/1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"html": "<div>oops</div>"})))
            .mount(&server)
            .await;

        let rejection = transport(&server).post("/node/1", None).await.unwrap_err();
        assert_eq!(rejection.status, 500);
        assert_eq!(rejection.html, "<div>oops</div>");
        assert_eq!(rejection.route, "/node/1");
        assert_eq!(rejection.method, Method::Post);
        assert!(rejection.data.is_empty());
    }

    #[tokio::test]
    async fn plain_failure_has_empty_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let rejection = transport(&server).get("/info/1/2", None).await.unwrap_err();
        assert_eq!(rejection.status, 404);
        assert!(rejection.html.is_empty());
    }

    #[tokio::test]
    async fn undecodable_success_body_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let rejection = transport(&server).get("/experiment/quorum", None).await.unwrap_err();
        assert_eq!(rejection.status, 200);
        assert!(rejection.reason.contains("undecodable"));
    }

    #[tokio::test]
    async fn get_payload_becomes_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/node/3/transmissions"))
            .and(query_param("status", "pending"))
            .and(query_param("direction", "incoming"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"transmissions": []})))
            .mount(&server)
            .await;

        let data = payload(json!({"status": "pending", "direction": "incoming"}));
        let resp = transport(&server)
            .get("/node/3/transmissions", Some(&data))
            .await
            .unwrap();
        assert_eq!(resp["transmissions"], json!([]));
    }

    #[tokio::test]
    async fn post_payload_is_form_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/worker_complete"))
            .and(body_string_contains("participant_id=42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .mount(&server)
            .await;

        let data = payload(json!({"participant_id": 42}));
        let resp = transport(&server)
            .post("/worker_complete", Some(&data))
            .await
            .unwrap();
        assert_eq!(resp["status"], "success");
    }

    #[tokio::test]
    async fn post_payload_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/participant"))
            .and(body_string_contains("\"entry_information\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"participant": {"id": 1}})))
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).unwrap();
        let transport = Transport::new(
            TransportConfig::new(base).with_body_encoding(BodyEncoding::Json),
        )
        .unwrap();
        let data = payload(json!({"entry_information": {"worker_id": "W1"}}));
        assert!(transport.post("/participant", Some(&data)).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_rejects_with_status_zero() {
        let base = Url::parse("http://127.0.0.1:9").unwrap();
        let transport = Transport::new(
            TransportConfig::new(base).with_timeout(Duration::from_secs(2)),
        )
        .unwrap();

        let data = payload(json!({"participant_id": "7"}));
        let rejection = transport.post("/worker_complete", Some(&data)).await.unwrap_err();
        assert!(rejection.is_network());
        assert_eq!(rejection.data["participant_id"], "7");
        assert!(rejection.request_json.contains("/worker_complete"));
    }

    #[test]
    fn flatten_encodes_nested_values() {
        let data = payload(json!({"a": "x", "b": 2, "c": {"d": true}, "e": null}));
        let pairs = flatten(&data);
        assert!(pairs.contains(&("a".into(), "x".into())));
        assert!(pairs.contains(&("b".into(), "2".into())));
        assert!(pairs.contains(&("c".into(), "{\"d\":true}".into())));
        assert!(pairs.contains(&("e".into(), String::new())));
    }
}
