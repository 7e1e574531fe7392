// Block-level representations: raw blocks and CARv1 streams.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;

use super::read::ReadContext;
use super::{IMMUTABLE_CACHE, etag_value, web_error};
use crate::backend::Error as BackendError;
use crate::path::ResolvedPath;

fn block_error(prefix: &str, err: BackendError) -> Response {
    let status = match err {
        BackendError::Offline(_) => StatusCode::SERVICE_UNAVAILABLE,
        BackendError::Timeout => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::NOT_FOUND,
    };
    web_error(prefix, err, status)
}

pub(crate) async fn serve_raw_block(ctx: &ReadContext, resolved: &ResolvedPath) -> Response {
    let block = match ctx.state.backend.raw_block(&resolved.cid).await {
        Ok(block) => block,
        Err(e) => return block_error("ipfs block get", e),
    };

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, "application/vnd.ipld.raw")
        .header(header::ETAG, etag_value(&resolved.cid))
        .header(header::CACHE_CONTROL, IMMUTABLE_CACHE)
        .header(header::CONTENT_LENGTH, block.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.bin\"", resolved.cid),
        );

    let body = if ctx.head_only {
        Body::empty()
    } else {
        Body::from(block)
    };
    builder.body(body).unwrap_or_default()
}

pub(crate) async fn serve_car(ctx: &ReadContext, resolved: &ResolvedPath) -> Response {
    let stream = match ctx.state.backend.car_stream(&resolved.cid).await {
        Ok(stream) => stream,
        Err(e) => return block_error("ipfs dag export", e),
    };

    // CARs are produced on the fly: no Content-Length, and a weak etag so
    // it never collides with the plain-CID conditional check.
    let builder = Response::builder()
        .header(
            header::CONTENT_TYPE,
            "application/vnd.ipld.car; version=1",
        )
        .header(header::ETAG, format!("W/\"{}.car\"", resolved.cid))
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.car\"", resolved.cid),
        );

    let body = if ctx.head_only {
        Body::empty()
    } else {
        Body::from_stream(stream)
    };
    builder.body(body).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};

    use super::super::testutil::{app, body_bytes, send};
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn format_raw_serves_the_block() {
        let backend = MemoryBackend::new();
        let file = backend.add_file(b"hello");
        let app = app(backend);

        let response = send(
            &app,
            Request::builder()
                .uri(format!("/ipfs/{file}?format=raw"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.ipld.raw"
        );
        assert_eq!(response.headers()[header::ETAG], format!("\"{file}\""));
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"{file}.bin\"")
        );
        assert!(!body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn format_car_streams_header_then_blocks() {
        let backend = MemoryBackend::new();
        let file = backend.add_file(b"hello");
        let root = backend.add_dir(&[("f", file)]);
        let app = app(backend);

        let response = send(
            &app,
            Request::builder()
                .uri(format!("/ipfs/{root}"))
                .header(header::ACCEPT, "application/vnd.ipld.car")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.ipld.car; version=1"
        );
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

        let body = body_bytes(response).await;
        // uvarint header length, then the dag-cbor header with both roots
        // and the version key.
        let header_len = body[0] as usize;
        assert!(body.len() > header_len + 1);
        let header = &body[1..1 + header_len];
        assert_eq!(header[0], 0xa2);
        let root_bytes = root.to_bytes();
        assert!(
            header
                .windows(root_bytes.len())
                .any(|window| window == root_bytes)
        );
        // Both blocks follow.
        let rest = &body[1 + header_len..];
        let file_bytes = file.to_bytes();
        assert!(
            rest.windows(root_bytes.len())
                .any(|window| window == root_bytes)
        );
        assert!(
            rest.windows(file_bytes.len())
                .any(|window| window == file_bytes)
        );
    }
}
