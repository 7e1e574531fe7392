// UnixFS file responder: first-block latency metric, caching headers,
// content disposition, content-type detection, single-range support.

use std::time::Instant;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use percent_encoding::{AsciiSet, percent_encode};

use super::read::ReadContext;
use super::{GatewayParams, IMMUTABLE_CACHE, etag_value, web_error};
use crate::backend::{ByteStream, FileNode};

/// Everything but unreserved characters, as filenames end up inside a
/// quoted-ish header parameter.
const FILENAME_ENCODE_SET: AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const SNIFF_LEN: usize = 512;

/// `served_name` is the name of the file actually being streamed when it is
/// not the request's own basename (the directory responder serving
/// `index.html` under a directory URL).
pub(crate) async fn serve_file(
    ctx: &ReadContext,
    cache_cid: &Cid,
    node: FileNode,
    served_name: Option<&str>,
) -> Response {
    let started = Instant::now();

    let name = served_name
        .map(str::to_string)
        .or_else(|| display_name(ctx));
    let ext_mime = match name.as_deref() {
        Some(name) => mime_guess::from_path(name).first_raw(),
        None => None,
    };

    let range = if node.seekable && ext_mime.is_some() {
        ctx.parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, node.size))
    } else {
        None
    };

    let stream = match node.open(range).await {
        Ok(stream) => stream,
        Err(e) => return web_error("ipfs cat", e, StatusCode::INTERNAL_SERVER_ERROR),
    };
    let (head, rest) = match buffer_head(stream, SNIFF_LEN).await {
        Ok(buffered) => buffered,
        Err(e) => return web_error("ipfs cat", e, StatusCode::INTERNAL_SERVER_ERROR),
    };
    metrics::histogram!(
        "gateway_unixfs_first_block_seconds",
        "namespace" => ctx.logical.namespace().as_str()
    )
    .record(started.elapsed().as_secs_f64());

    let content_type = match ext_mime {
        Some(mime) => mime.to_string(),
        None => sniff(&head),
    };

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ETAG, etag_value(cache_cid));
    if ctx.logical.is_mutable() {
        builder = builder.header(header::LAST_MODIFIED, http_date_now());
    } else {
        builder = builder.header(header::CACHE_CONTROL, IMMUTABLE_CACHE);
    }
    if let Some(disposition) = content_disposition(&ctx.params, name.as_deref()) {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }
    if node.seekable {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    let builder = match range {
        Some((offset, length)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_LENGTH, length)
            .header(
                header::CONTENT_RANGE,
                match node.size {
                    Some(total) => format!("bytes {offset}-{}/{total}", offset + length - 1),
                    None => format!("bytes {offset}-{}/*", offset + length - 1),
                },
            ),
        None => match node.size {
            Some(size) => builder.header(header::CONTENT_LENGTH, size),
            None => builder,
        },
    };

    if ctx.head_only {
        return builder.body(Body::empty()).unwrap_or_default();
    }

    let body = futures::stream::iter([Ok(Bytes::from(head))]).chain(rest);
    builder
        .body(Body::from_stream(body))
        .unwrap_or_default()
}

/// Symlinks surface as their target path; browsers cannot follow them
/// through an immutable store.
pub(crate) fn serve_symlink(ctx: &ReadContext, cache_cid: &Cid, target: &str) -> Response {
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, "inode/symlink")
        .header(header::ETAG, etag_value(cache_cid))
        .header(header::CONTENT_LENGTH, target.len());
    if ctx.logical.is_mutable() {
        builder = builder.header(header::LAST_MODIFIED, http_date_now());
    } else {
        builder = builder.header(header::CACHE_CONTROL, IMMUTABLE_CACHE);
    }
    let body = if ctx.head_only {
        Body::empty()
    } else {
        Body::from(target.to_string())
    };
    builder.body(body).unwrap_or_default()
}

/// Name used for disposition and extension lookup: `?filename` wins, then
/// the last path segment. A bare `/ipfs/<cid>` has no usable name.
fn display_name(ctx: &ReadContext) -> Option<String> {
    if let Some(filename) = &ctx.params.filename {
        return Some(filename.clone());
    }
    let segments = ctx.logical.segments();
    if segments.len() >= 2 {
        Some(segments[segments.len() - 1].clone())
    } else {
        None
    }
}

/// The filename travels twice: ASCII-sanitized for legacy parsers and
/// RFC 5987 encoded for everyone else. `?filename` names the download;
/// without it, `?download=true` falls back to the served basename (which is
/// empty for a bare `/ipfs/<cid>`).
fn content_disposition(params: &GatewayParams, default_name: Option<&str>) -> Option<String> {
    let download = params.download.as_deref() == Some("true");
    let filename = match (params.filename.as_deref(), download) {
        (Some(filename), _) => filename,
        (None, true) => default_name.unwrap_or(""),
        (None, false) => return None,
    };
    let disposition = if download { "attachment" } else { "inline" };
    if filename.is_empty() {
        return Some(disposition.to_string());
    }

    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let ascii = percent_encode(ascii.as_bytes(), &FILENAME_ENCODE_SET);
    let utf8 = percent_encode(filename.as_bytes(), &FILENAME_ENCODE_SET);
    Some(format!(
        "{disposition}; filename={ascii}; filename*=UTF-8''{utf8}"
    ))
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Pull chunks until `limit` bytes are buffered or the stream ends. The
/// buffered head is re-chained in front of the remainder when serving.
async fn buffer_head(
    mut stream: ByteStream,
    limit: usize,
) -> Result<(Vec<u8>, ByteStream), crate::backend::Error> {
    let mut head = Vec::with_capacity(limit);
    while head.len() < limit {
        match stream.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => break,
        }
    }
    Ok((head, stream))
}

/// Content sniffing for extension-less paths: magic numbers first, then a
/// UTF-8 text heuristic, octet-stream otherwise.
fn sniff(head: &[u8]) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if std::str::from_utf8(head).is_ok() {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

/// Single `bytes=` range. Unsatisfiable or multi-part ranges fall back to
/// the full body.
fn parse_range(value: &str, size: Option<u64>) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start, end) {
        ("", suffix) => {
            let suffix: u64 = suffix.parse().ok()?;
            let size = size?;
            if suffix == 0 {
                return None;
            }
            let length = suffix.min(size);
            Some((size - length, length))
        }
        (start, "") => {
            let start: u64 = start.parse().ok()?;
            let size = size?;
            (start < size).then(|| (start, size - start))
        }
        (start, end) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if end < start {
                return None;
            }
            let length = end - start + 1;
            match size {
                Some(size) if start >= size => None,
                Some(size) => Some((start, length.min(size - start))),
                None => Some((start, length)),
            }
        }
    }
}
