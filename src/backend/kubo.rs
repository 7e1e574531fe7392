// Kubo RPC adapter for the gateway backend.
// Uses ipfs-api-backend-hyper to talk to the node; writable sessions are
// staged in an MFS scratch tree so finalize can stat the new root CID.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::{StreamExt, TryFutureExt, TryStreamExt, io::Cursor};
use http::Uri;
use ipfs_api_backend_hyper::{IpfsApi, IpfsClient as HyperIpfsClient, TryFromUri};
use tracing_futures::Instrument;

use super::{
    Backend, ByteStream, DirEntry, DirNode, Error, FileNode, FileOpener, NodeKind, UnixFsNode,
    WritableSession, car_frame, car_header,
};
use crate::path::{LogicalPath, Namespace, ResolvedPath};

const DAG_PB: u64 = 0x70;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct KuboBackend {
    client: HyperIpfsClient,
    scratch_prefix: String,
}

fn classify(err: ipfs_api_backend_hyper::Error) -> Error {
    let msg = err.to_string();
    if msg.contains("no link named")
        || msg.contains("no link by that name")
        || msg.contains("does not exist")
    {
        Error::NoLink(msg)
    } else if msg.contains("deadline exceeded") || msg.contains("timed out") {
        Error::Timeout
    } else if msg.contains("error trying to connect") || msg.contains("connection refused") {
        Error::Offline(msg)
    } else {
        Error::Other(msg)
    }
}

fn not_exist(err: &ipfs_api_backend_hyper::Error) -> bool {
    let msg = err.to_string();
    msg.contains("does not exist") || msg.contains("not found")
}

impl KuboBackend {
    pub fn new_with_config(
        rpc_address: Uri,
        credentials: Option<(String, String)>,
        scratch_prefix: String,
    ) -> Self {
        let client = HyperIpfsClient::build_with_base_uri(rpc_address);
        let client = match credentials {
            Some((username, password)) => client.with_credentials(username, password),
            _ => client,
        };
        KuboBackend {
            client,
            scratch_prefix,
        }
    }

    /// Rewrite an /ipns/ path to the /ipfs/ path it currently points at.
    async fn to_immutable(&self, path: &LogicalPath) -> Result<String, Error> {
        match path.namespace() {
            Namespace::Ipfs => Ok(path.to_string()),
            Namespace::Ipns => {
                let resolved = self
                    .client
                    .name_resolve(Some(path.root()), true, false)
                    .instrument(tracing::debug_span!("ipns resolve", name = path.root()))
                    .await
                    .map_err(classify)?;
                let mut joined = resolved.path;
                for segment in &path.segments()[1..] {
                    joined.push('/');
                    joined.push_str(segment);
                }
                Ok(joined)
            }
        }
    }
}

struct CatOpener {
    client: HyperIpfsClient,
    path: String,
}

#[async_trait]
impl FileOpener for CatOpener {
    async fn open(&self, _range: Option<(u64, u64)>) -> Result<ByteStream, Error> {
        // cat has no offset support over the RPC API; the node is reported
        // as non-seekable so the file responder never asks for a range.
        Ok(self.client.cat(&self.path).map_err(classify).boxed())
    }
}

#[async_trait]
impl Backend for KuboBackend {
    #[tracing::instrument(skip(self), fields(%path))]
    async fn resolve_path(&self, path: &LogicalPath) -> Result<ResolvedPath, Error> {
        let ipfs_path = self.to_immutable(path).await?;
        let stat = self.client.files_stat(&ipfs_path).await.map_err(classify)?;
        let cid: Cid = stat.hash.parse()?;
        Ok(ResolvedPath {
            logical: path.clone(),
            cid,
        })
    }

    async fn unixfs_get(&self, resolved: &ResolvedPath) -> Result<UnixFsNode, Error> {
        let ipfs_path = format!("/ipfs/{}", resolved.cid);
        let stat = self.client.files_stat(&ipfs_path).await.map_err(classify)?;
        match stat.typ.as_str() {
            "directory" => {
                let listing = self.client.ls(&ipfs_path).await.map_err(classify)?;
                let entries = listing
                    .objects
                    .into_iter()
                    .flat_map(|object| object.links)
                    .map(|link| DirEntry {
                        cid: link.hash.parse().ok(),
                        size: Some(link.size),
                        name: link.name,
                    })
                    .collect();
                Ok(UnixFsNode::Directory(DirNode {
                    entries,
                    size: Some(stat.cumulative_size),
                }))
            }
            "file" => Ok(UnixFsNode::File(FileNode {
                size: Some(stat.size),
                seekable: false,
                opener: Box::new(CatOpener {
                    client: self.client.clone(),
                    path: ipfs_path,
                }),
            })),
            _ => Ok(UnixFsNode::Unknown),
        }
    }

    #[tracing::instrument(err, skip_all)]
    async fn unixfs_add(&self, content: Bytes) -> Result<Cid, Error> {
        let added = self
            .client
            .add_async(Cursor::new(content.to_vec()))
            .inspect_ok(|_| tracing::debug!("added"))
            .instrument(tracing::debug_span!("ipfs add"))
            .await
            .map_err(classify)?;
        Ok(added.hash.parse()?)
    }

    async fn raw_block(&self, cid: &Cid) -> Result<Bytes, Error> {
        let mut stream = self.client.block_get(&cid.to_string());
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(classify)?);
        }
        Ok(Bytes::from(buf))
    }

    async fn car_stream(&self, root: &Cid) -> Result<ByteStream, Error> {
        struct Walk {
            client: HyperIpfsClient,
            header: Option<Bytes>,
            queue: Vec<Cid>,
        }

        let walk = Walk {
            client: self.client.clone(),
            header: Some(car_header(root)),
            queue: vec![*root],
        };

        // Depth-first, matching the header-then-blocks framing.
        let stream = futures::stream::try_unfold(walk, |mut walk| async move {
            if let Some(header) = walk.header.take() {
                return Ok(Some((header, walk)));
            }
            let Some(cid) = walk.queue.pop() else {
                return Ok(None);
            };

            let mut data = Vec::new();
            let mut chunks = walk.client.block_get(&cid.to_string());
            while let Some(chunk) = chunks.next().await {
                data.extend_from_slice(&chunk.map_err(classify)?);
            }
            drop(chunks);

            if cid.codec() == DAG_PB {
                let links = walk
                    .client
                    .object_links(&cid.to_string())
                    .await
                    .map_err(classify)?;
                for link in links.links.into_iter().rev() {
                    if let Ok(child) = link.hash.parse() {
                        walk.queue.push(child);
                    }
                }
            }

            Ok(Some((car_frame(&cid, &data), walk)))
        })
        .boxed();

        Ok(stream)
    }

    async fn writable_session(&self, root: &Cid) -> Result<Box<dyn WritableSession>, Error> {
        if root.codec() != DAG_PB {
            return Err(Error::NotDagPb(*root));
        }

        let scratch = format!(
            "{}/{}-{}",
            self.scratch_prefix,
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed),
        );
        let session_root = format!("{scratch}/root");

        self.client
            .files_mkdir(&scratch, true)
            .await
            .map_err(classify)?;
        self.client
            .files_cp(&format!("/ipfs/{root}"), &session_root)
            .inspect_ok(|()| tracing::debug!("staged session root"))
            .instrument(tracing::debug_span!("mfs stage", %root))
            .await
            .map_err(classify)?;

        Ok(Box::new(MfsSession {
            client: self.client.clone(),
            scratch,
            root: session_root,
        }))
    }

    async fn healthy(&self) -> bool {
        self.client.version().await.is_ok()
    }
}

struct MfsSession {
    client: HyperIpfsClient,
    scratch: String,
    root: String,
}

impl MfsSession {
    fn abs(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{rel}", self.root)
        }
    }

    fn child(&self, dir: &str, name: &str) -> String {
        format!("{}/{name}", self.abs(dir))
    }
}

#[async_trait]
impl WritableSession for MfsSession {
    async fn mkdir(&mut self, path: &str, make_parents: bool) -> Result<(), Error> {
        self.client
            .files_mkdir(&self.abs(path), make_parents)
            .await
            .map_err(classify)
    }

    async fn lookup(&mut self, path: &str) -> Result<NodeKind, Error> {
        let stat = match self.client.files_stat(&self.abs(path)).await {
            Ok(stat) => stat,
            Err(e) if not_exist(&e) => return Err(Error::NoLink(e.to_string())),
            Err(e) => return Err(classify(e)),
        };
        Ok(match stat.typ.as_str() {
            "directory" => NodeKind::Directory,
            "file" => NodeKind::File,
            _ => NodeKind::Unknown,
        })
    }

    async fn add_child(&mut self, dir: &str, name: &str, cid: &Cid) -> Result<(), Error> {
        self.client
            .files_cp_with_options(ipfs_api_backend_hyper::request::FilesCp {
                path: &format!("/ipfs/{cid}"),
                dest: &self.child(dir, name),
                parents: Some(true),
                force: Some(true),
            })
            .inspect_ok(|()| tracing::debug!("mfs cp"))
            .instrument(tracing::debug_span!("mfs link", %cid))
            .await
            .map_err(classify)
    }

    async fn unlink(&mut self, dir: &str, name: &str) -> Result<(), Error> {
        match self.client.files_rm(&self.child(dir, name), true).await {
            Ok(()) => Ok(()),
            Err(e) if not_exist(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn finalize(&mut self) -> Result<Cid, Error> {
        self.client
            .files_flush(Some(&self.root))
            .await
            .map_err(classify)?;
        let stat = self.client.files_stat(&self.root).await.map_err(classify)?;
        let cid: Cid = stat.hash.parse()?;
        self.abort().await;
        Ok(cid)
    }

    async fn abort(&mut self) {
        if let Err(e) = self.client.files_rm(&self.scratch, true).await {
            tracing::debug!(error = %e, scratch = self.scratch, "scratch cleanup failed");
        }
    }
}
