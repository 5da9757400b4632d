//! Error Reporter: the single sink for unhandled request failures.
//!
//! Every report carries the participant id, a replayable snapshot of the
//! failed request and the current recruitment identifiers, so the server can
//! compensate without the participant re-entering anything.

use crate::error::{Error, Result};
use async_trait::async_trait;
use cohort_identity::{HitParams, Identity};
use cohort_transport::AjaxRejection;
use html5ever::tendril::TendrilSink;
use html5ever::{parse_document, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

/// Route the synthesized recovery form posts to.
pub const ERROR_ROUTE: &str = "/error-page";

/// `id` of the recovery form inside a server-rendered error page.
pub const RECOVERY_FORM_ID: &str = "error-response";

/// A form of hidden fields destined for the server's error handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryForm {
    pub action: String,
    pub fields: Vec<(String, String)>,
    /// Submitted without participant interaction.
    pub auto_submit: bool,
}

impl RecoveryForm {
    pub fn new(action: impl Into<String>, auto_submit: bool) -> Self {
        Self {
            action: action.into(),
            fields: Vec::new(),
            auto_submit,
        }
    }

    /// Set a hidden field, replacing any earlier value of the same name.
    /// Missing and empty values are skipped.
    pub fn add_hidden(&mut self, name: &str, value: Option<&str>) {
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            return;
        };
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(field) => field.1 = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// How a report was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The server's error page is showing with the fields attached; its own
    /// controls take over from here.
    Displayed { html: String, form: RecoveryForm },
    /// A synthesized form was submitted.
    Submitted(RecoveryForm),
}

/// The page the participant is looking at.
#[async_trait]
pub trait HostPage: Send + Sync {
    /// Replace the page with server-rendered HTML and attach `form`'s fields
    /// to the recovery form inside it.
    async fn show_error_page(&self, html: &str, form: &RecoveryForm) -> Result<()>;

    /// Submit a form.
    async fn submit_form(&self, form: &RecoveryForm) -> Result<()>;
}

/// Builds recovery forms and hands them to a [`HostPage`].
#[derive(Clone)]
pub struct ErrorReporter {
    page: Arc<dyn HostPage>,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter").finish_non_exhaustive()
    }
}

impl ErrorReporter {
    pub fn new(page: Arc<dyn HostPage>) -> Self {
        Self { page }
    }

    /// Report a failed request.
    ///
    /// When the server rendered an error page, the fields go onto the
    /// recovery form inside it, keeping that form's action and inputs.
    pub async fn report(&self, rejection: &AjaxRejection, identity: &Identity) -> Result<ReportOutcome> {
        let displayed = rejection.has_html();
        let mut form = RecoveryForm::new(ERROR_ROUTE, !displayed);
        if displayed {
            match find_recovery_form(&rejection.html) {
                Ok(Some(embedded)) => {
                    debug!(action = ?embedded.action, "Using recovery form from server page");
                    if let Some(action) = embedded.action {
                        form.action = action;
                    }
                    for (name, value) in &embedded.fields {
                        form.add_hidden(name, Some(value));
                    }
                }
                Ok(None) => warn!("Server error page has no recovery form"),
                Err(e) => warn!(error = %e, "Could not read server error page"),
            }
        }
        attach_fields(&mut form, rejection, identity);

        error!(
            route = %rejection.route,
            method = %rejection.method,
            status = rejection.status,
            server_page = displayed,
            "Reporting failed request"
        );

        if displayed {
            self.page.show_error_page(&rejection.html, &form).await?;
            Ok(ReportOutcome::Displayed {
                html: rejection.html.clone(),
                form,
            })
        } else {
            self.page.submit_form(&form).await?;
            Ok(ReportOutcome::Submitted(form))
        }
    }
}

fn attach_fields(form: &mut RecoveryForm, rejection: &AjaxRejection, identity: &Identity) {
    let participant_id = rejection
        .data
        .get("participant_id")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .or_else(|| match identity.participant_id() {
            Ok(id) => id.map(|id| id.to_string()),
            Err(e) => {
                warn!(error = %e, "Could not read participant id for error report");
                None
            }
        });
    let params = identity.hit_params().unwrap_or_else(|e| {
        warn!(error = %e, "Could not read identity for error report");
        HitParams::default()
    });

    form.add_hidden("participant_id", participant_id.as_deref());
    form.add_hidden("request_data", Some(&rejection.snapshot().to_json()));
    form.add_hidden("worker_id", params.worker_id.as_deref());
    form.add_hidden("hit_id", params.hit_id.as_deref());
    form.add_hidden("assignment_id", params.assignment_id.as_deref());
    form.add_hidden("mode", params.mode.as_ref().map(|m| m.as_str()));
    form.add_hidden("fingerprint_hash", params.fingerprint_hash.as_deref());
    form.add_hidden("recruiter", params.recruiter.as_deref());
}

/// The recovery form found in a server error page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedForm {
    /// The form's `action`, when it has a non-empty one.
    pub action: Option<String>,
    /// Named inputs the server already filled in.
    pub fields: Vec<(String, String)>,
}

/// Look for `form#error-response` in server-rendered HTML.
pub fn find_recovery_form(html: &str) -> Result<Option<EmbeddedForm>> {
    let dom = parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .read_from(&mut io::Cursor::new(html.as_bytes()))
        .map_err(|e| Error::Report(format!("failed to parse error page: {e}")))?;

    let Some(form) = descendants(&dom.document)
        .into_iter()
        .find(|node| is_element(node, "form") && attr(node, "id").as_deref() == Some(RECOVERY_FORM_ID))
    else {
        return Ok(None);
    };

    let fields = descendants(&form)
        .iter()
        .filter(|node| is_element(node, "input"))
        .filter_map(|input| Some((attr(input, "name")?, attr(input, "value").unwrap_or_default())))
        .collect();
    Ok(Some(EmbeddedForm {
        action: attr(&form, "action").filter(|a| !a.trim().is_empty()),
        fields,
    }))
}

/// Pre-order walk without recursion.
fn descendants(root: &Handle) -> Vec<Handle> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        stack.extend(node.children.borrow().iter().rev().cloned());
        out.push(node);
    }
    out
}

fn is_element(node: &Handle, tag: &str) -> bool {
    matches!(&node.data, NodeData::Element { name, .. } if name.local.as_ref().eq_ignore_ascii_case(tag))
}

fn attr(node: &Handle, wanted: &str) -> Option<String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|a| a.name.local.as_ref().eq_ignore_ascii_case(wanted))
            .map(|a| a.value.to_string()),
        _ => None,
    }
}

/// Host page for runs without a browser. Nobody is there to press the error
/// page's button, so its recovery form is submitted straight away; the page
/// itself is kept for inspection.
#[derive(Debug)]
pub struct HttpHostPage {
    client: Client,
    base_url: Url,
    last_page: Mutex<Option<String>>,
}

impl HttpHostPage {
    pub fn new(client: Client, base_url: Url) -> Self {
        Self {
            client,
            base_url,
            last_page: Mutex::new(None),
        }
    }

    /// The most recent server error page shown.
    pub fn last_page(&self) -> Option<String> {
        self.last_page.lock().ok().and_then(|page| page.clone())
    }

    async fn post(&self, form: &RecoveryForm) -> Result<()> {
        let url = self.base_url.join(&form.action)?;
        let response = self
            .client
            .post(url.clone())
            .form(&form.fields)
            .send()
            .await
            .map_err(|e| Error::Report(e.to_string()))?;
        info!(url = %url, status = %response.status(), "Recovery form submitted");
        Ok(())
    }
}

#[async_trait]
impl HostPage for HttpHostPage {
    async fn show_error_page(&self, html: &str, form: &RecoveryForm) -> Result<()> {
        if let Ok(mut page) = self.last_page.lock() {
            *page = Some(html.to_string());
        }
        info!(fields = form.fields.len(), "Server error page displayed");
        self.post(form).await
    }

    async fn submit_form(&self, form: &RecoveryForm) -> Result<()> {
        self.post(form).await
    }
}

/// What a [`RecordingHostPage`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPageEvent {
    Shown { html: String, form: RecoveryForm },
    Submitted(RecoveryForm),
}

/// Host page that only records.
#[derive(Debug, Default)]
pub struct RecordingHostPage {
    events: Mutex<Vec<HostPageEvent>>,
}

impl RecordingHostPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HostPageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: HostPageEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl HostPage for RecordingHostPage {
    async fn show_error_page(&self, html: &str, form: &RecoveryForm) -> Result<()> {
        self.push(HostPageEvent::Shown {
            html: html.to_string(),
            form: form.clone(),
        });
        Ok(())
    }

    async fn submit_form(&self, form: &RecoveryForm) -> Result<()> {
        self.push(HostPageEvent::Submitted(form.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_identity::Storage;
    use cohort_transport::{Method, Payload, Transport, TransportConfig};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity() -> Identity {
        let url = Url::parse(
            "http://localhost/ad?hit_id=H1&worker_id=W1&assignment_id=A1&mode=debug&recruiter=hotair",
        )
        .unwrap();
        Identity::initialize(Storage::memory(), &url).unwrap()
    }

    fn rejection(html: &str) -> AjaxRejection {
        let data: Payload = json!({"participant_id": 42}).as_object().cloned().unwrap();
        AjaxRejection::new(Method::Post, "/worker_complete", &data, 500, html.into(), "HTTP 500")
    }

    #[tokio::test]
    async fn synthesized_form_is_submitted() {
        let page = Arc::new(RecordingHostPage::new());
        let reporter = ErrorReporter::new(page.clone());

        let outcome = reporter.report(&rejection(""), &identity()).await.unwrap();

        let ReportOutcome::Submitted(form) = outcome else {
            panic!("expected submission");
        };
        assert!(form.auto_submit);
        assert_eq!(form.action, ERROR_ROUTE);
        assert_eq!(form.field("participant_id"), Some("42"));
        assert_eq!(form.field("worker_id"), Some("W1"));
        assert_eq!(form.field("hit_id"), Some("H1"));
        assert_eq!(form.field("assignment_id"), Some("A1"));
        assert_eq!(form.field("mode"), Some("debug"));
        assert_eq!(form.field("recruiter"), Some("hotair"));
        // no fingerprint yet, so no empty field
        assert_eq!(form.field("fingerprint_hash"), None);

        let snapshot: Value = serde_json::from_str(form.field("request_data").unwrap()).unwrap();
        assert_eq!(snapshot["route"], "/worker_complete");
        assert_eq!(snapshot["method"], "post");

        assert_eq!(page.events(), vec![HostPageEvent::Submitted(form)]);
    }

    #[tokio::test]
    async fn server_page_is_shown_not_submitted() {
        let page = Arc::new(RecordingHostPage::new());
        let reporter = ErrorReporter::new(page.clone());

        let outcome = reporter
            .report(&rejection("<div>oops</div>"), &identity())
            .await
            .unwrap();

        let ReportOutcome::Displayed { html, form } = outcome else {
            panic!("expected display");
        };
        assert_eq!(html, "<div>oops</div>");
        assert!(!form.auto_submit);
        assert!(matches!(
            page.events().as_slice(),
            [HostPageEvent::Shown { .. }]
        ));
    }

    #[tokio::test]
    async fn participant_id_falls_back_to_identity() {
        let identity = identity();
        identity
            .set_participant_id(&cohort_identity::ParticipantId::new("7"))
            .unwrap();
        let reporter = ErrorReporter::new(Arc::new(RecordingHostPage::new()));
        let data = Payload::new();
        let rejection = AjaxRejection::new(Method::Get, "/node/7/infos", &data, 0, String::new(), "down");

        let ReportOutcome::Submitted(form) = reporter.report(&rejection, &identity).await.unwrap() else {
            panic!("expected submission");
        };
        assert_eq!(form.field("participant_id"), Some("7"));
    }

    #[tokio::test]
    async fn http_host_page_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ERROR_ROUTE))
            .and(body_string_contains("worker_id=W1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).unwrap();
        let page = HttpHostPage::new(Client::new(), base);
        let mut form = RecoveryForm::new(ERROR_ROUTE, true);
        form.add_hidden("worker_id", Some("W1"));
        form.add_hidden("hit_id", Some(""));
        assert_eq!(form.fields.len(), 1);

        page.submit_form(&form).await.unwrap();
    }

    const RECOVERY_PAGE: &str = r#"<html><body>
        <p>Something went wrong.</p>
        <form id="error-response" action="/custom-recovery" method="POST">
            <input type="hidden" name="error_type" value="timeout">
            <input type="hidden" name="worker_id" value="stale">
            <input type="text" name="comments">
            <button type="submit">Send</button>
        </form>
    </body></html>"#;

    #[test]
    fn recovery_form_is_found_in_server_page() {
        let form = find_recovery_form(RECOVERY_PAGE).unwrap().unwrap();
        assert_eq!(form.action.as_deref(), Some("/custom-recovery"));
        assert_eq!(
            form.fields,
            vec![
                ("error_type".to_string(), "timeout".to_string()),
                ("worker_id".to_string(), "stale".to_string()),
                ("comments".to_string(), String::new()),
            ]
        );

        assert_eq!(find_recovery_form("<div>oops</div>").unwrap(), None);
        let bare = find_recovery_form(r#"<form id="error-response"></form>"#).unwrap().unwrap();
        assert_eq!(bare.action, None);
    }

    #[tokio::test]
    async fn server_page_form_is_submitted_to_its_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/worker_complete"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(json!({"status": "error", "html": RECOVERY_PAGE})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/custom-recovery"))
            .and(body_string_contains("error_type=timeout"))
            .and(body_string_contains("worker_id=W1"))
            .and(body_string_contains("participant_id=42"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(ERROR_ROUTE))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).unwrap();
        let transport = Transport::new(TransportConfig::new(base.clone())).unwrap();
        let data: Payload = json!({"participant_id": 42}).as_object().cloned().unwrap();
        let rejection = transport.post("/worker_complete", Some(&data)).await.unwrap_err();
        assert!(rejection.has_html());

        let page = Arc::new(HttpHostPage::new(transport.client().clone(), base));
        let reporter = ErrorReporter::new(page.clone());
        let ReportOutcome::Displayed { form, .. } = reporter.report(&rejection, &identity()).await.unwrap()
        else {
            panic!("expected the server page");
        };

        assert_eq!(form.action, "/custom-recovery");
        // identity values win over what the page carried
        assert_eq!(form.field("worker_id"), Some("W1"));
        assert_eq!(form.field("error_type"), Some("timeout"));
        assert_eq!(page.last_page().as_deref(), Some(RECOVERY_PAGE));
    }
}
