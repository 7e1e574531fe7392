// Directory responder: index.html probe and redirect, then the HTML
// listing itself.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use maud::{DOCTYPE, Markup, html};

use super::read::ReadContext;
use super::{GatewayHostname, ScheduledLocation, file, web_error};
use crate::backend::{DirNode, Error as BackendError, UnixFsNode};
use crate::path::{Namespace, ResolvedPath};

/// Changes with every release; the listing markup is compiled in, so the
/// crate version plays the role of an asset-bundle hash in the etag.
const ASSET_TAG: &str = env!("CARGO_PKG_VERSION");

struct DirectoryItem {
    name: String,
    path: String,
    cid: String,
    short_cid: String,
    size: String,
}

pub(crate) async fn serve_directory(
    ctx: &ReadContext,
    resolved: &ResolvedPath,
    dir: DirNode,
) -> Response {
    let index_path = ctx.logical.join("index.html");
    match ctx.state.backend.resolve_path(&index_path).await {
        Ok(index) => {
            let has_slash = ctx.parts.uri.path().ends_with('/');
            let go_get = ctx.params.go_get.as_deref() == Some("1");
            if !has_slash && !go_get {
                // Trailing slash makes browsers resolve relative links
                // against the directory.
                let mut location = format!("{}{}/", ctx.prefix, ctx.parts.uri.path());
                if let Some(query) = ctx.parts.uri.query() {
                    location.push('?');
                    location.push_str(query);
                }
                return Response::builder()
                    .status(StatusCode::FOUND)
                    .header(header::LOCATION, location)
                    .body(Body::empty())
                    .unwrap_or_default();
            }

            return match ctx.state.backend.unixfs_get(&index).await {
                // The directory CID drives caching: the index file is only
                // reachable through it. The served name is index.html, not
                // the request basename.
                Ok(UnixFsNode::File(node)) => {
                    file::serve_file(ctx, &resolved.cid, node, Some("index.html")).await
                }
                Ok(_) => web_error(
                    "ipfs cat",
                    "index.html is not a file",
                    StatusCode::INTERNAL_SERVER_ERROR,
                ),
                Err(e) => web_error("ipfs cat", e, StatusCode::INTERNAL_SERVER_ERROR),
            };
        }
        Err(BackendError::NoLink(_)) => {}
        Err(e) => return web_error("ipfs resolve", e, StatusCode::INTERNAL_SERVER_ERROR),
    }

    render_listing(ctx, resolved, dir).await
}

async fn render_listing(ctx: &ReadContext, resolved: &ResolvedPath, dir: DirNode) -> Response {
    // An upstream rewriter may have scheduled a redirect; it wins over the
    // listing body.
    if let Some(ScheduledLocation(location)) = ctx.parts.extensions.get::<ScheduledLocation>() {
        return Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, location.as_str())
            .body(Body::empty())
            .unwrap_or_default();
    }

    // If-None-Match against this etag is already answered upstream: the
    // conditional check before negotiation matches on the `<cid>"` suffix,
    // which every DirIndex etag carries.
    let etag = format!("\"DirIndex-v{ASSET_TAG}_CID-{}\"", resolved.cid);

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::ETAG, etag.as_str());

    if ctx.head_only {
        return builder.body(Body::empty()).unwrap_or_default();
    }

    let base = format!("{}{}", ctx.prefix, ctx.parts.uri.path());
    let mut items = Vec::with_capacity(dir.entries.len());
    for entry in &dir.entries {
        // Children without a known CID are resolved for display; a child
        // that cannot be resolved cannot be linked, which fails the page.
        let cid = match entry.cid {
            Some(cid) => cid,
            None => {
                let child = ctx.logical.join(&entry.name);
                match ctx.state.backend.resolve_path(&child).await {
                    Ok(resolved) => resolved.cid,
                    Err(e) => {
                        return web_error(
                            "error while resolving a listing entry",
                            e,
                            StatusCode::INTERNAL_SERVER_ERROR,
                        );
                    }
                }
            }
        };
        let cid = cid.to_string();
        items.push(DirectoryItem {
            path: join_url(&base, &entry.name),
            short_cid: short_cid(&cid),
            cid,
            size: human_size(entry.size),
            name: entry.name.clone(),
        });
    }

    let back_link = back_link(&base);
    let gateway_url = ctx
        .parts
        .extensions
        .get::<GatewayHostname>()
        .map(|GatewayHostname(host)| format!("//{host}"));
    let dnslink = is_dnslink(ctx, gateway_url.as_deref());

    let markup = listing_page(
        &base,
        &resolved.cid.to_string(),
        &items,
        back_link.as_deref(),
        gateway_url.as_deref(),
        dnslink,
    );
    builder
        .body(Body::from(markup.into_string()))
        .unwrap_or_default()
}

fn join_url(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// No back-link at the namespace root; otherwise step up relative to the
/// presence of a trailing slash.
fn back_link(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.len() {
        0..=3 => None,
        4 if parts[3].is_empty() => None,
        _ if path.ends_with('/') => Some(format!("{path}./..")),
        _ => Some(format!("{path}/..")),
    }
}

fn short_cid(cid: &str) -> String {
    if cid.len() > 9 {
        format!("{}\u{2026}{}", &cid[..4], &cid[cid.len() - 4..])
    } else {
        cid.to_string()
    }
}

fn human_size(size: Option<u64>) -> String {
    let Some(size) = size else {
        return "?".to_string();
    };
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Display-only: whether the gateway host itself is the DNSLink name being
/// browsed.
fn is_dnslink(ctx: &ReadContext, gateway_url: Option<&str>) -> bool {
    match gateway_url {
        Some(url) => {
            ctx.logical.namespace() == Namespace::Ipns
                && url.trim_start_matches('/') == ctx.logical.root()
        }
        None => false,
    }
}

fn listing_page(
    path: &str,
    dir_cid: &str,
    items: &[DirectoryItem],
    back_link: Option<&str>,
    gateway_url: Option<&str>,
    dnslink: bool,
) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "Index of " (path) }
            }
            body {
                header {
                    h1 {
                        "Index of " (path)
                        @if dnslink {
                            " " small { "(DNSLink)" }
                        }
                    }
                    p {
                        span title="Content identifier of this directory" {
                            code { (dir_cid) }
                        }
                        @if let Some(gateway_url) = gateway_url {
                            " via " a href=(gateway_url) { (gateway_url) }
                        }
                    }
                }
                main {
                    table {
                        thead {
                            tr {
                                th { "Name" }
                                th { "CID" }
                                th { "Size" }
                            }
                        }
                        tbody {
                            @if let Some(back_link) = back_link {
                                tr {
                                    td { a href=(back_link) { ".." } }
                                    td {}
                                    td {}
                                }
                            }
                            @for item in items {
                                tr {
                                    td { a href=(item.path) { (item.name) } }
                                    td { a href=(format!("/ipfs/{}", item.cid)) title=(item.cid) { code { (item.short_cid) } } }
                                    td { (item.size) }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
