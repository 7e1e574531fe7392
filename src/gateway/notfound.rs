// Pretty 404: a user-authored `ipfs-404.html` in the closest ancestor
// directory replaces the plain-text 404 for HTML-accepting clients.

use axum::body::Body;
use axum::http::{StatusCode, header, request::Parts};
use axum::response::Response;
use futures::StreamExt;

use crate::AppState;
use crate::backend::UnixFsNode;
use crate::path::LogicalPath;

const PRETTY_404_FILE: &str = "ipfs-404.html";

pub(crate) async fn serve_if_present(
    state: &AppState,
    parts: &Parts,
    logical: &LogicalPath,
) -> Option<Response> {
    if !accepts_html(parts) {
        return None;
    }

    // Deepest prefix first, up to and including the root CID.
    for prefix in logical.prefixes().rev() {
        let probe = prefix.join(PRETTY_404_FILE);
        let Ok(resolved) = state.backend.resolve_path(&probe).await else {
            continue;
        };
        let Ok(UnixFsNode::File(node)) = state.backend.unixfs_get(&resolved).await else {
            continue;
        };
        let Ok(mut stream) = node.open(None).await else {
            continue;
        };

        let mut body = Vec::new();
        let mut failed = false;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => body.extend_from_slice(&chunk),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            continue;
        }

        tracing::debug!(path = %probe, "serving pretty 404");
        return Some(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header(header::CONTENT_LENGTH, body.len())
                .body(Body::from(body))
                .unwrap_or_default(),
        );
    }

    None
}

fn accepts_html(parts: &Parts) -> bool {
    parts.headers.get_all(header::ACCEPT).iter().any(|value| {
        value.to_str().is_ok_and(|value| {
            value.split(',').any(|media| {
                let essence = media.trim().split(';').next().unwrap_or_default().trim();
                matches!(essence, "*/*" | "text/*" | "text/html")
            })
        })
    })
}
