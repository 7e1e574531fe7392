use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use cid::Cid;
use serde::Deserialize;

use crate::AppState;

pub mod canonical;
mod car;
mod file;
mod listing;
mod notfound;
mod read;
mod write;

pub(crate) const IMMUTABLE_CACHE: &str = "public, max-age=29030400, immutable";

/// Hostname under which the gateway is reachable, injected by upstream
/// subdomain/DNSLink rewriters. Display-only: the listing template links
/// back through it.
#[derive(Debug, Clone)]
pub struct GatewayHostname(pub String);

/// A redirect scheduled by an upstream rewriter. It wins over any listing
/// body this handler would otherwise stream.
#[derive(Debug, Clone)]
pub struct ScheduledLocation(pub String);

#[derive(Deserialize, Default, Debug)]
pub(crate) struct GatewayParams {
    pub uri: Option<String>,
    pub format: Option<String>,
    pub filename: Option<String>,
    pub download: Option<String>,
    #[serde(rename = "go-get")]
    pub go_get: Option<String>,
}

pub(crate) fn parse_params(uri: &http::Uri) -> GatewayParams {
    uri.query()
        .and_then(|query| serde_urlencoded::from_str(query).ok())
        .unwrap_or_default()
}

/// Strong etag derived from a resolved CID.
fn etag_value(cid: &Cid) -> String {
    format!("\"{cid}\"")
}

/// `If-None-Match` is matched on the `<cid>"` suffix so that both plain
/// `"<cid>"` etags and directory-listing etags (which embed the CID last)
/// short-circuit to 304.
fn etag_matches(if_none_match: &str, cid: &Cid) -> bool {
    if_none_match.ends_with(&format!("{cid}\""))
}

pub(crate) fn web_error(
    prefix: &str,
    err: impl std::fmt::Display,
    status: StatusCode,
) -> Response {
    let message = format!("{prefix}: {err}");
    if status.is_server_error() {
        tracing::error!(%status, message, "request failed");
    } else {
        tracing::debug!(%status, message, "request rejected");
    }
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message))
        .unwrap_or_default()
}

fn method_not_allowed() -> Response {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(header::ALLOW, "GET, HEAD, OPTIONS")
        .body(Body::empty())
        .unwrap_or_default()
}

/// Parse `--header "Name: Value"` flags into a header map. Invalid specs are
/// rejected at startup, not silently dropped.
pub fn user_header_map(specs: &[String]) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for spec in specs {
        let (name, value) = spec
            .split_once(':')
            .ok_or_else(|| format!("header {spec:?} is missing a ':'"))?;
        let name = name
            .trim()
            .parse::<HeaderName>()
            .map_err(|e| format!("header {spec:?}: {e}"))?;
        let value = value
            .trim()
            .parse::<HeaderValue>()
            .map_err(|e| format!("header {spec:?}: {e}"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Headers the responder already set (Content-Type, Etag, ...) win over the
/// operator's; repeated `--header` values for one name all survive.
fn apply_user_headers(response: &mut Response, headers: &HeaderMap) {
    for name in headers.keys() {
        if response.headers().contains_key(name) {
            continue;
        }
        for value in headers.get_all(name) {
            response.headers_mut().append(name, value.clone());
        }
    }
}

/// Method dispatch for the whole gateway surface. Writable verbs are only
/// reachable with `--writable`; everything else is answered with an explicit
/// Allow set.
#[axum::debug_handler]
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let writable = state.config.writable;
    let method = request.method().clone();
    let mut response = match method.as_str() {
        "GET" | "HEAD" => read::serve(state.clone(), request).await,
        "OPTIONS" => Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap_or_default(),
        "POST" if writable => write::add(state.clone(), request).await,
        "PUT" if writable => write::put(state.clone(), request).await,
        "DELETE" if writable => write::delete(state.clone(), request).await,
        "POST" | "PUT" | "DELETE" => method_not_allowed(),
        method if writable => web_error(
            "method",
            format!("{method} is not supported"),
            StatusCode::BAD_REQUEST,
        ),
        _ => method_not_allowed(),
    };
    apply_user_headers(&mut response, &state.user_headers);
    response
}

pub fn routes() -> axum::Router<AppState> {
    axum::Router::new().fallback(dispatch)
}
