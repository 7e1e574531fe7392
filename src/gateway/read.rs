// GET/HEAD pipeline: canonicalize, resolve, conditional-request check,
// standard headers, representation negotiation, responder fan-out.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header, request::Parts};
use axum::response::Response;

use super::canonical::{Canonical, canonicalize};
use super::{
    GatewayParams, car, etag_matches, etag_value, file, listing, notfound, parse_params, web_error,
};
use crate::AppState;
use crate::backend::{Error as BackendError, UnixFsNode};
use crate::path::{LogicalPath, ResolvedPath};

/// Everything the responders need about the request in flight.
pub(crate) struct ReadContext {
    pub state: AppState,
    pub parts: Parts,
    pub logical: LogicalPath,
    pub prefix: String,
    pub head_only: bool,
    pub params: GatewayParams,
}

enum Representation {
    Raw,
    Car,
    Unsupported(String),
    UnixFs,
}

pub(crate) async fn serve(state: AppState, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let head_only = parts.method == axum::http::Method::HEAD;
    let params = parse_params(&parts.uri);

    let (logical, prefix) = match canonicalize(&state.config.path_prefix, &parts, &params) {
        Canonical::Proceed { logical, prefix } => (logical, prefix),
        Canonical::Done(response) => return response,
    };

    let resolved = match state.backend.resolve_path(&logical).await {
        Ok(resolved) => resolved,
        Err(err) => return resolve_error(&state, &parts, &logical, err).await,
    };

    if let Some(inm) = parts
        .headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        && etag_matches(inm, &resolved.cid)
    {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag_value(&resolved.cid))
            .body(Body::empty())
            .unwrap_or_default();
    }

    let roots = match roots_list(&state, &resolved).await {
        Ok(roots) => roots,
        Err(err) => {
            return web_error(
                "error while resolving the root paths",
                err,
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
    };

    let ctx = ReadContext {
        state,
        parts,
        logical,
        prefix,
        head_only,
        params,
    };

    let mut response = match negotiate(&ctx.params, &ctx.parts.headers) {
        Representation::Raw => car::serve_raw_block(&ctx, &resolved).await,
        Representation::Car => car::serve_car(&ctx, &resolved).await,
        Representation::Unsupported(format) => web_error(
            "unsupported format",
            format,
            StatusCode::BAD_REQUEST,
        ),
        Representation::UnixFs => serve_unixfs(&ctx, &resolved).await,
    };

    let headers = response.headers_mut();
    if let Ok(value) = ctx.parts.uri.path().parse() {
        headers.insert("x-ipfs-path", value);
    }
    if let Ok(value) = roots.parse() {
        headers.insert("x-ipfs-roots", value);
    }
    response
}

/// Backend failure to HTTP status, with the pretty-404 attempt for every
/// resolver failure that is not transient.
async fn resolve_error(
    state: &AppState,
    parts: &Parts,
    logical: &LogicalPath,
    err: BackendError,
) -> Response {
    match err {
        BackendError::Offline(_) => {
            web_error("ipfs resolve -r", err, StatusCode::SERVICE_UNAVAILABLE)
        }
        BackendError::Timeout => web_error("ipfs resolve -r", err, StatusCode::REQUEST_TIMEOUT),
        err => match notfound::serve_if_present(state, parts, logical).await {
            Some(response) => response,
            None => web_error("ipfs resolve -r", err, StatusCode::NOT_FOUND),
        },
    }
}

/// One CID per non-empty path prefix, joined with commas. The terminal
/// prefix is the request itself, so its resolution is reused.
async fn roots_list(state: &AppState, resolved: &ResolvedPath) -> Result<String, BackendError> {
    let logical = &resolved.logical;
    let count = logical.segments().len();
    let mut roots = Vec::with_capacity(count);
    for (index, prefix) in logical.prefixes().enumerate() {
        if index + 1 == count {
            roots.push(resolved.cid.to_string());
        } else {
            roots.push(state.backend.resolve_path(&prefix).await?.cid.to_string());
        }
    }
    Ok(roots.join(","))
}

fn negotiate(params: &GatewayParams, headers: &HeaderMap) -> Representation {
    match params.format.as_deref() {
        Some("raw") => return Representation::Raw,
        Some("car") => return Representation::Car,
        Some(other) => return Representation::Unsupported(other.to_string()),
        None => {}
    }

    for value in headers.get_all(header::ACCEPT) {
        let Ok(value) = value.to_str() else { continue };
        for media in value.split(',') {
            let media = media.trim();
            let (essence, attrs) = media.split_once(';').unwrap_or((media, ""));
            match essence.trim() {
                "application/vnd.ipld.raw" => return Representation::Raw,
                "application/vnd.ipld.car" => {
                    let version = attrs
                        .split(';')
                        .filter_map(|attr| attr.trim().split_once('='))
                        .find(|(key, _)| key.trim() == "version")
                        .map(|(_, v)| v.trim().trim_matches('"').to_string());
                    return match version.as_deref() {
                        None | Some("1") => Representation::Car,
                        Some(other) => {
                            Representation::Unsupported(format!("car version {other}"))
                        }
                    };
                }
                essence if essence.starts_with("application/vnd.") => {
                    return Representation::Unsupported(essence.to_string());
                }
                _ => {}
            }
        }
    }

    Representation::UnixFs
}

async fn serve_unixfs(ctx: &ReadContext, resolved: &ResolvedPath) -> Response {
    match ctx.state.backend.unixfs_get(resolved).await {
        Ok(UnixFsNode::File(node)) => file::serve_file(ctx, &resolved.cid, node, None).await,
        Ok(UnixFsNode::Directory(dir)) => listing::serve_directory(ctx, resolved, dir).await,
        Ok(UnixFsNode::Symlink { target }) => file::serve_symlink(ctx, &resolved.cid, &target),
        Ok(UnixFsNode::Unknown) => web_error(
            "ipfs cat",
            "unsupported entry type",
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        Err(BackendError::Offline(msg)) => {
            web_error("ipfs cat", msg, StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(BackendError::Timeout) => web_error(
            "ipfs cat",
            BackendError::Timeout,
            StatusCode::REQUEST_TIMEOUT,
        ),
        Err(err) => web_error("ipfs cat", err, StatusCode::NOT_FOUND),
    }
}
