// Writable overlay: POST adds a blob, PUT splices a file into an existing
// root, DELETE unlinks from one. Every operation is single-request atomic
// and answers with the new root in `IPFS-Hash`.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::Response;
use cid::Cid;

use super::web_error;
use crate::AppState;
use crate::backend::{Error as BackendError, NodeKind, WritableSession};
use crate::path::{LogicalPath, Namespace};

fn created(cid: &Cid, location: String) -> Response {
    Response::builder()
        .status(StatusCode::CREATED)
        .header("IPFS-Hash", cid.to_string())
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_default()
}

async fn whole_body(body: Body) -> Result<bytes::Bytes, Response> {
    axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| web_error("failed to read request body", e, StatusCode::BAD_REQUEST))
}

pub(crate) async fn add(state: AppState, request: Request) -> Response {
    let (_parts, body) = request.into_parts();
    let content = match whole_body(body).await {
        Ok(content) => content,
        Err(response) => return response,
    };

    match state.backend.unixfs_add(content).await {
        Ok(cid) => created(&cid, format!("/ipfs/{cid}")),
        Err(e) => web_error("ipfs add", e, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// `/ipfs/<rootCid>/<interior>` with a non-empty interior, or a 400.
fn split_writable_path(path: &str) -> Result<(Cid, String), Response> {
    let logical: LogicalPath = path
        .parse()
        .map_err(|e| web_error("invalid path", e, StatusCode::BAD_REQUEST))?;
    if logical.namespace() != Namespace::Ipfs {
        return Err(web_error(
            "invalid path",
            "writable operations need an /ipfs/ root",
            StatusCode::BAD_REQUEST,
        ));
    }
    if logical.segments().len() < 2 {
        return Err(web_error(
            "invalid path",
            "a path inside the root is required",
            StatusCode::BAD_REQUEST,
        ));
    }
    let root = logical
        .root()
        .parse::<Cid>()
        .map_err(|e| web_error("invalid path", e, StatusCode::BAD_REQUEST))?;
    Ok((root, logical.interior()))
}

fn split_parent(interior: &str) -> (String, String) {
    match interior.rsplit_once('/') {
        Some((directory, name)) => (directory.to_string(), name.to_string()),
        None => (String::new(), interior.to_string()),
    }
}

async fn open_session(
    state: &AppState,
    root: &Cid,
) -> Result<Box<dyn WritableSession>, Response> {
    state.backend.writable_session(root).await.map_err(|e| {
        let status = match e {
            BackendError::NotDagPb(_) => StatusCode::BAD_REQUEST,
            BackendError::NoLink(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        web_error("could not open the root object", e, status)
    })
}

pub(crate) async fn put(state: AppState, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let (root, interior) = match split_writable_path(parts.uri.path()) {
        Ok(split) => split,
        Err(response) => return response,
    };
    let content = match whole_body(body).await {
        Ok(content) => content,
        Err(response) => return response,
    };

    let new_file = match state.backend.unixfs_add(content).await {
        Ok(cid) => cid,
        Err(e) => return web_error("ipfs add", e, StatusCode::INTERNAL_SERVER_ERROR),
    };

    let mut session = match open_session(&state, &root).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let (directory, filename) = split_parent(&interior);
    if !directory.is_empty()
        && let Err(e) = session.mkdir(&directory, true).await
    {
        session.abort().await;
        return web_error("mkdir", e, StatusCode::INTERNAL_SERVER_ERROR);
    }

    match session.lookup(&directory).await {
        Ok(NodeKind::Directory) => {}
        Ok(_) => {
            session.abort().await;
            return web_error(
                "put",
                "target parent is not a directory",
                StatusCode::BAD_REQUEST,
            );
        }
        Err(e) => {
            session.abort().await;
            return web_error("put", e, StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    if let Err(e) = session.unlink(&directory, &filename).await {
        session.abort().await;
        return web_error("put", e, StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Err(e) = session.add_child(&directory, &filename, &new_file).await {
        session.abort().await;
        return web_error("put", e, StatusCode::INTERNAL_SERVER_ERROR);
    }

    match session.finalize().await {
        Ok(new_root) => {
            tracing::debug!(%root, %new_root, path = %interior, "put finalized");
            created(&new_root, format!("/ipfs/{new_root}/{interior}"))
        }
        Err(e) => web_error("put", e, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub(crate) async fn delete(state: AppState, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let (root, interior) = match split_writable_path(parts.uri.path()) {
        Ok(split) => split,
        Err(response) => return response,
    };

    let mut session = match open_session(&state, &root).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let (directory, filename) = split_parent(&interior);
    match session.lookup(&directory).await {
        Ok(NodeKind::Directory) => {}
        Ok(_) => {
            session.abort().await;
            return web_error(
                "delete",
                "target parent is not a directory",
                StatusCode::BAD_REQUEST,
            );
        }
        Err(e) => {
            session.abort().await;
            return web_error("delete", e, StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    if let Err(e) = session.unlink(&directory, &filename).await {
        session.abort().await;
        return web_error("delete", e, StatusCode::INTERNAL_SERVER_ERROR);
    }

    match session.finalize().await {
        Ok(new_root) => {
            tracing::debug!(%root, %new_root, path = %interior, "delete finalized");
            let location = if directory.is_empty() {
                format!("/ipfs/{new_root}")
            } else {
                format!("/ipfs/{new_root}/{directory}")
            };
            created(&new_root, location)
        }
        Err(e) => web_error("delete", e, StatusCode::INTERNAL_SERVER_ERROR),
    }
}
