// Content-addressed backend consumed by the gateway.
// The gateway only sees this trait; the Kubo RPC adapter lives in `kubo`.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;

use crate::path::{LogicalPath, ResolvedPath};

pub mod kubo;
#[cfg(test)]
pub mod memory;

pub type ByteStream = BoxStream<'static, Result<Bytes, Error>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A named segment does not exist under its parent node.
    #[error("{0}")]
    NoLink(String),

    /// The node is offline or the content is unroutable.
    #[error("{0}")]
    Offline(String),

    #[error("context deadline exceeded")]
    Timeout,

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is not a dag-pb node")]
    NotDagPb(Cid),

    #[error("invalid cid: {0}")]
    Cid(#[from] cid::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Opens the byte stream behind a UnixFS file. `range` is `(offset, length)`
/// and is only honored by seekable backends.
#[async_trait]
pub trait FileOpener: Send + Sync {
    async fn open(&self, range: Option<(u64, u64)>) -> Result<ByteStream, Error>;
}

pub struct FileNode {
    pub size: Option<u64>,
    /// Whether `open` honors byte ranges. Range requests are refused
    /// without it.
    pub seekable: bool,
    pub opener: Box<dyn FileOpener>,
}

impl FileNode {
    pub async fn open(&self, range: Option<(u64, u64)>) -> Result<ByteStream, Error> {
        self.opener.open(range).await
    }
}

pub struct DirEntry {
    pub name: String,
    /// Child CID when the backend already knows it; the listing renderer
    /// resolves the child path otherwise.
    pub cid: Option<Cid>,
    pub size: Option<u64>,
}

pub struct DirNode {
    pub entries: Vec<DirEntry>,
    pub size: Option<u64>,
}

pub enum UnixFsNode {
    File(FileNode),
    Directory(DirNode),
    Symlink { target: String },
    Unknown,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolve a logical path to the CID of the node it terminally refers to.
    async fn resolve_path(&self, path: &LogicalPath) -> Result<ResolvedPath, Error>;

    async fn unixfs_get(&self, resolved: &ResolvedPath) -> Result<UnixFsNode, Error>;

    /// Import a blob through the UnixFS adder, returning its CID.
    async fn unixfs_add(&self, content: Bytes) -> Result<Cid, Error>;

    async fn raw_block(&self, cid: &Cid) -> Result<Bytes, Error>;

    /// CARv1 serialization of the DAG under `cid`: roots header first, then
    /// blocks in traversal order.
    async fn car_stream(&self, cid: &Cid) -> Result<ByteStream, Error>;

    /// Open a per-request mutable tree over an existing dag-pb root.
    async fn writable_session(&self, root: &Cid) -> Result<Box<dyn WritableSession>, Error>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Transient mutable tree used by the writable overlay. Lives for a single
/// request; exactly one `finalize` is expected.
#[async_trait]
pub trait WritableSession: Send {
    async fn mkdir(&mut self, path: &str, make_parents: bool) -> Result<(), Error>;

    async fn lookup(&mut self, path: &str) -> Result<NodeKind, Error>;

    async fn add_child(&mut self, dir: &str, name: &str, cid: &Cid) -> Result<(), Error>;

    /// Unlinking a name that does not exist is not an error.
    async fn unlink(&mut self, dir: &str, name: &str) -> Result<(), Error>;

    async fn finalize(&mut self) -> Result<Cid, Error>;

    /// Best-effort cleanup for error paths that never reach `finalize`.
    async fn abort(&mut self);
}

pub(crate) fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Framed CARv1 header: dag-cbor `{"roots": [root], "version": 1}` behind a
/// uvarint length prefix.
pub(crate) fn car_header(root: &Cid) -> Bytes {
    let cid_bytes = root.to_bytes();
    let mut body = Vec::with_capacity(cid_bytes.len() + 24);
    body.push(0xa2); // map(2)
    body.push(0x65); // text(5)
    body.extend_from_slice(b"roots");
    body.push(0x81); // array(1)
    body.extend_from_slice(&[0xd8, 0x2a]); // tag(42)
    body.push(0x58); // bytes, one-byte length
    body.push((cid_bytes.len() + 1) as u8);
    body.push(0x00); // multibase identity prefix
    body.extend_from_slice(&cid_bytes);
    body.push(0x67); // text(7)
    body.extend_from_slice(b"version");
    body.push(0x01); // uint(1)

    let mut framed = Vec::with_capacity(body.len() + 2);
    write_uvarint(&mut framed, body.len() as u64);
    framed.extend_from_slice(&body);
    Bytes::from(framed)
}

/// One CAR block frame: uvarint(len(cid) + len(data)), cid bytes, data.
pub(crate) fn car_frame(cid: &Cid, data: &[u8]) -> Bytes {
    let cid_bytes = cid.to_bytes();
    let mut frame = Vec::with_capacity(cid_bytes.len() + data.len() + 4);
    write_uvarint(&mut frame, (cid_bytes.len() + data.len()) as u64);
    frame.extend_from_slice(&cid_bytes);
    frame.extend_from_slice(data);
    Bytes::from(frame)
}
