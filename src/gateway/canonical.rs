// Path canonicalization for GET/HEAD: sub-path prefix adoption, the
// `?uri=` protocol-handler redirect, the Service-Worker scope guard, the
// `/ipfs/ipfs/...` repair page, and LogicalPath validation.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header, request::Parts};
use axum::response::Response;
use maud::{DOCTYPE, html};

use super::{GatewayParams, web_error};
use crate::path::LogicalPath;

pub(crate) enum Canonical {
    Proceed { logical: LogicalPath, prefix: String },
    Done(Response),
}

pub(crate) fn canonicalize(
    allowed_prefixes: &[String],
    parts: &Parts,
    params: &GatewayParams,
) -> Canonical {
    let path = parts.uri.path();
    let prefix = requested_prefix(&parts.headers, allowed_prefixes);

    if let Some(uri) = params.uri.as_deref() {
        return Canonical::Done(uri_redirect(&prefix, uri));
    }

    if parts
        .headers
        .get("Service-Worker")
        .is_some_and(|v| v.as_bytes() == b"script")
        && is_namespace_root(path)
    {
        return Canonical::Done(web_error(
            "navigator.serviceWorker",
            "registration is not allowed for this scope",
            StatusCode::BAD_REQUEST,
        ));
    }

    if prefix.is_empty() && (path.starts_with("/ipfs/ipfs/") || path.starts_with("/ipfs/ipns/")) {
        let stripped = path.strip_prefix("/ipfs").unwrap_or(path);
        return Canonical::Done(superfluous_namespace_page(stripped, parts.uri.query()));
    }

    match path.parse::<LogicalPath>() {
        Ok(logical) => Canonical::Proceed { logical, prefix },
        Err(e) => Canonical::Done(web_error("invalid ipfs path", e, StatusCode::BAD_REQUEST)),
    }
}

/// Adopt the `X-Ipfs-Gateway-Prefix` value when it equals an allowed prefix
/// or extends one at a `/` boundary; ignore it otherwise.
fn requested_prefix(headers: &HeaderMap, allowed: &[String]) -> String {
    let Some(value) = headers
        .get("X-Ipfs-Gateway-Prefix")
        .and_then(|v| v.to_str().ok())
    else {
        return String::new();
    };
    for candidate in allowed {
        if value == candidate || value.starts_with(&format!("{candidate}/")) {
            return value.to_string();
        }
    }
    String::new()
}

/// `^/ip[fn]s/[^/]+$`
fn is_namespace_root(path: &str) -> bool {
    let rest = match path
        .strip_prefix("/ipfs/")
        .or_else(|| path.strip_prefix("/ipns/"))
    {
        Some(rest) => rest,
        None => return false,
    };
    !rest.is_empty() && !rest.contains('/')
}

/// Target of `navigator.registerProtocolHandler`: turn `ipfs://<host>/<path>`
/// into a permanent redirect under this gateway.
fn uri_redirect(prefix: &str, raw: &str) -> Response {
    let parsed = match url::Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            return web_error(
                "failed to parse uri query parameter",
                e,
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let scheme = parsed.scheme();
    if scheme != "ipfs" && scheme != "ipns" {
        return web_error(
            "uri query parameter scheme must be ipfs or ipns",
            scheme,
            StatusCode::BAD_REQUEST,
        );
    }

    let mut target = format!(
        "{prefix}/{scheme}/{}{}",
        parsed.host_str().unwrap_or_default(),
        parsed.path()
    );
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, target)
        .body(Body::empty())
        .unwrap_or_default()
}

/// 400 page for `/ipfs/ipfs/...` and `/ipfs/ipns/...`: tells humans and
/// crawlers where the content actually lives, and meta-refreshes there.
fn superfluous_namespace_page(stripped: &str, query: Option<&str>) -> Response {
    let target = match query {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    };
    let markup = html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                title { "400 Bad Request" }
                link rel="canonical" href=(target);
                meta http-equiv="refresh" content=(format!("10;url={target}"));
            }
            body {
                h1 { "400 Bad Request" }
                p {
                    "The namespace appears twice in the requested path. "
                    "The content lives at "
                    a href=(target) { (target) }
                    "."
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(markup.into_string()))
        .unwrap_or_default()
}
