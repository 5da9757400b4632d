//! Structured request failures.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Request payload: a flat JSON object.
pub type Payload = Map<String, Value>;

/// HTTP method used by the experiment API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic copy of a request, in the shape the server's error handler
/// replays: `data` is itself a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub route: String,
    pub data: String,
    pub method: Method,
}

impl RequestSnapshot {
    pub fn new(method: Method, route: &str, data: &Payload) -> Self {
        Self {
            route: route.to_string(),
            data: Value::Object(data.clone()).to_string(),
            method,
        }
    }

    /// Serialized form, as attached to error reports.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "route": self.route,
            "data": self.data,
            "method": self.method,
        })
        .to_string()
    }
}

/// Failure of a single request: non-2xx status, no response at all, or an
/// undecodable body.
///
/// `status` is the HTTP status, or `0` when no response was received.
/// `html` is the server-rendered error page, empty unless the failing response
/// carried one.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{method} {route} failed with status {status}: {reason}")]
pub struct AjaxRejection {
    pub route: String,
    pub method: Method,
    pub data: Payload,
    pub status: u16,
    pub html: String,
    #[serde(rename = "requestJSON")]
    pub request_json: String,
    pub reason: String,
}

impl AjaxRejection {
    pub fn new(
        method: Method,
        route: &str,
        data: &Payload,
        status: u16,
        html: String,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            route: route.to_string(),
            method,
            data: data.clone(),
            status,
            html,
            request_json: RequestSnapshot::new(method, route, data).to_json(),
            reason: reason.into(),
        }
    }

    /// Whether the server answered with this status code.
    pub fn is_status(&self, code: u16) -> bool {
        self.status == code
    }

    /// True when no HTTP response was received.
    pub fn is_network(&self) -> bool {
        self.status == 0
    }

    /// True when the server supplied an error page to display.
    pub fn has_html(&self) -> bool {
        !self.html.is_empty()
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot::new(self.method, &self.route, &self.data)
    }
}
