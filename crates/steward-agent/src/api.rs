//! HTTP surface of the agent.
//!
//! Two public routes carry the wire protocols: a POST endpoint for the
//! legacy envelope and the site root for the query-parameter token
//! surfaces (`stwc` commands, `stwi` probes). A status route serves the
//! operator. The handlers translate pipeline dispositions into HTTP; all
//! protocol decisions stay in the library crates.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use serde::{Deserialize, Serialize};

use steward_core::command::{
    CommandDisposition, CommandPipeline, ConfirmationPage, ExecutionReport, PrincipalContext,
};
use steward_core::errors::CoreError;
use steward_core::legacy::{DispatchStatsSnapshot, LegacyDispatcher};
use steward_core::pairing::{PairingService, TrustReport};
use steward_core::trust::KeyRing;
use steward_core::types::{AgentSnapshot, AGENT_VERSION};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CommandPipeline>,
    pub dispatcher: Arc<LegacyDispatcher>,
    pub pairing: PairingService,
    pub keyring: KeyRing,
}

/// Header the demo deployment uses to convey the requesting principal.
///
/// A real embedding replaces [`principal_from_headers`] with the host's
/// own session lookup; nothing else in the agent trusts this header.
pub const PRINCIPAL_HEADER: &str = "x-steward-principal";

fn principal_from_headers(headers: &HeaderMap) -> PrincipalContext {
    match headers.get(PRINCIPAL_HEADER).and_then(|v| v.to_str().ok()) {
        Some("manager") => PrincipalContext::Authenticated { can_manage: true },
        Some(_) => PrincipalContext::Authenticated { can_manage: false },
        None => PrincipalContext::Anonymous,
    }
}

fn request_url(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Hidden field posted back by the confirmation form.
#[derive(Debug, Deserialize)]
pub struct ConfirmForm {
    #[serde(default)]
    pub form_token: String,
}

// GET /?stwi=... (probe) or /?stwc=... (command confirmation)
pub async fn public_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Some(token) = params.get("stwi") {
        return match state.pipeline.handle_probe(token) {
            CommandDisposition::ProbeImage(png) => probe_response(png),
            _ => not_found(),
        };
    }

    let Some(token) = params.get("stwc") else {
        return not_found();
    };
    let principal = principal_from_headers(&headers);
    match state
        .pipeline
        .handle_get(token, principal, &request_url(&uri))
        .await
    {
        Ok(disposition) => disposition_response(disposition),
        Err(err) => internal_error(&err),
    }
}

// POST /?stwc=... (confirmed command execution)
pub async fn public_post(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
    Form(form): Form<ConfirmForm>,
) -> Response {
    let Some(token) = params.get("stwc") else {
        return not_found();
    };
    let principal = principal_from_headers(&headers);
    match state
        .pipeline
        .handle_post(token, principal, &request_url(&uri), &form.form_token)
        .await
    {
        Ok(disposition) => disposition_response(disposition),
        Err(err) => internal_error(&err),
    }
}

// POST /steward/rpc
pub async fn legacy_rpc(State(state): State<AppState>, body: String) -> Response {
    let encoded = state.dispatcher.dispatch(&body).await;
    ([(header::CONTENT_TYPE, "text/plain")], encoded).into_response()
}

#[derive(Serialize)]
struct StatusBody {
    agent_version: &'static str,
    paired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairing: Option<AgentSnapshot>,
    trust: TrustReport,
    dispatch: DispatchStatsSnapshot,
}

// GET /steward/status (manage capability required)
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !matches!(
        principal_from_headers(&headers),
        PrincipalContext::Authenticated { can_manage: true }
    ) {
        return (StatusCode::FORBIDDEN, "permission denied").into_response();
    }

    let paired = match state.pairing.is_paired().await {
        Ok(paired) => paired,
        Err(err) => return internal_error(&err),
    };
    let pairing = if paired {
        match state.pairing.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => return internal_error(&err),
        }
    } else {
        None
    };
    let trust = match state.pairing.trust_report(&state.keyring).await {
        Ok(report) => report,
        Err(err) => return internal_error(&err),
    };

    axum::Json(StatusBody {
        agent_version: AGENT_VERSION,
        paired,
        pairing,
        trust,
        dispatch: state.dispatcher.stats().snapshot(),
    })
    .into_response()
}

fn disposition_response(disposition: CommandDisposition) -> Response {
    match disposition {
        CommandDisposition::NotForUs => not_found(),
        CommandDisposition::ErrorPage { message } => error_page(&message),
        CommandDisposition::LoginRedirect { return_to } => login_redirect(&return_to),
        CommandDisposition::Confirm(page) => confirm_page(&page),
        CommandDisposition::ProbeImage(png) => probe_response(png),
        CommandDisposition::Executed(report) => report_page(&report),
    }
}

fn render_page(title: &str, body_html: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <title>{}</title></head><body>{}</body></html>",
        escape_html(title),
        body_html
    ))
}

fn error_page(message: &str) -> Response {
    render_page(
        "Command refused",
        &format!("<p>{}</p>", escape_html(message)),
    )
    .into_response()
}

fn confirm_page(page: &ConfirmationPage) -> Response {
    let body = format!(
        "<p>The controller asks to run: <strong>{}</strong></p>\
         <form method=\"post\" action=\"{}\">\
         <input type=\"hidden\" name=\"form_token\" value=\"{}\">\
         <button type=\"submit\">Run command</button>\
         </form>",
        escape_html(&page.label),
        escape_html(&page.form_action),
        escape_html(&page.form_token),
    );
    render_page("Confirm command", &body).into_response()
}

fn report_page(report: &ExecutionReport) -> Response {
    let mut body = format!("<p>{}</p>", escape_html(&report.summary));
    if let Some(output) = &report.output {
        body.push_str(&format!("<pre>{}</pre>", escape_html(output)));
    }
    render_page("Command executed", &body).into_response()
}

fn login_redirect(return_to: &str) -> Response {
    let encoded: String = url::form_urlencoded::byte_serialize(return_to.as_bytes()).collect();
    Redirect::to(&format!("/login?return_to={encoded}")).into_response()
}

fn probe_response(png: &'static [u8]) -> Response {
    ([(header::CONTENT_TYPE, "image/png")], png).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn internal_error(err: &CoreError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.public_message()).into_response()
}

/// Labels and reports carry controller-chosen text; everything rendered
/// into a page goes through here.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
