// Deterministic in-memory backend used by the handler tests. Nodes are
// content-addressed for real: CIDs are minted from a canonical encoding of
// the node, so writable-overlay tests observe genuine root changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use multihash_codetable::{Code, MultihashDigest};

use super::{
    Backend, ByteStream, DirEntry, DirNode, Error, FileNode, FileOpener, NodeKind, UnixFsNode,
    WritableSession, car_frame, car_header,
};
use crate::path::{LogicalPath, Namespace, ResolvedPath};

#[derive(Debug, Clone)]
enum Node {
    File(Bytes),
    Dir(BTreeMap<String, Cid>),
    Symlink(String),
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        match self {
            Node::File(bytes) => {
                let mut buf = b"file\n".to_vec();
                buf.extend_from_slice(bytes);
                buf
            }
            Node::Dir(entries) => {
                let mut buf = b"dir\n".to_vec();
                for (name, cid) in entries {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(b'=');
                    buf.extend_from_slice(cid.to_string().as_bytes());
                    buf.push(b'\n');
                }
                buf
            }
            Node::Symlink(target) => {
                let mut buf = b"link\n".to_vec();
                buf.extend_from_slice(target.as_bytes());
                buf
            }
        }
    }

    fn cid(&self) -> Cid {
        let digest = Code::Sha2_256.digest(&self.encode());
        Cid::new_v0(digest).expect("sha2-256 digest is a valid cidv0 multihash")
    }
}

#[derive(Default)]
struct Store {
    nodes: HashMap<Cid, Node>,
    ipns: HashMap<String, Cid>,
    offline: bool,
    hide_child_cids: bool,
}

impl Store {
    fn insert(&mut self, node: Node) -> Cid {
        let cid = node.cid();
        self.nodes.insert(cid, node);
        cid
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, content: &[u8]) -> Cid {
        self.store
            .lock()
            .unwrap()
            .insert(Node::File(Bytes::copy_from_slice(content)))
    }

    pub fn add_symlink(&self, target: &str) -> Cid {
        self.store
            .lock()
            .unwrap()
            .insert(Node::Symlink(target.to_string()))
    }

    pub fn add_dir(&self, entries: &[(&str, Cid)]) -> Cid {
        let map = entries
            .iter()
            .map(|(name, cid)| (name.to_string(), *cid))
            .collect();
        self.store.lock().unwrap().insert(Node::Dir(map))
    }

    pub fn publish_name(&self, name: &str, cid: Cid) {
        self.store.lock().unwrap().ipns.insert(name.to_string(), cid);
    }

    pub fn set_offline(&self, offline: bool) {
        self.store.lock().unwrap().offline = offline;
    }

    /// Force the listing renderer down its resolve-per-child path.
    pub fn set_hide_child_cids(&self, hide: bool) {
        self.store.lock().unwrap().hide_child_cids = hide;
    }

    fn resolve_segments(&self, path: &LogicalPath) -> Result<Cid, Error> {
        let store = self.store.lock().unwrap();
        if store.offline {
            return Err(Error::Offline("backend is offline".to_string()));
        }

        let mut cid = match path.namespace() {
            Namespace::Ipfs => path.root().parse::<Cid>()?,
            Namespace::Ipns => *store
                .ipns
                .get(path.root())
                .ok_or_else(|| Error::Other(format!("could not resolve name {:?}", path.root())))?,
        };

        for segment in &path.segments()[1..] {
            match store.nodes.get(&cid) {
                Some(Node::Dir(entries)) => {
                    cid = *entries.get(segment).ok_or_else(|| {
                        Error::NoLink(format!("no link named {segment:?} under {cid}"))
                    })?;
                }
                Some(_) => {
                    return Err(Error::NoLink(format!(
                        "no link named {segment:?} under {cid}"
                    )));
                }
                None => return Err(Error::Other(format!("block {cid} not found"))),
            }
        }
        Ok(cid)
    }
}

struct MemOpener {
    bytes: Bytes,
}

#[async_trait]
impl FileOpener for MemOpener {
    async fn open(&self, range: Option<(u64, u64)>) -> Result<ByteStream, Error> {
        let bytes = match range {
            Some((offset, length)) => {
                let start = (offset as usize).min(self.bytes.len());
                let end = (start + length as usize).min(self.bytes.len());
                self.bytes.slice(start..end)
            }
            None => self.bytes.clone(),
        };
        Ok(futures::stream::iter([Ok(bytes)]).boxed())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn resolve_path(&self, path: &LogicalPath) -> Result<ResolvedPath, Error> {
        let cid = self.resolve_segments(path)?;
        Ok(ResolvedPath {
            logical: path.clone(),
            cid,
        })
    }

    async fn unixfs_get(&self, resolved: &ResolvedPath) -> Result<UnixFsNode, Error> {
        let store = self.store.lock().unwrap();
        match store.nodes.get(&resolved.cid) {
            Some(Node::File(bytes)) => Ok(UnixFsNode::File(FileNode {
                size: Some(bytes.len() as u64),
                seekable: true,
                opener: Box::new(MemOpener {
                    bytes: bytes.clone(),
                }),
            })),
            Some(Node::Dir(entries)) => {
                let items = entries
                    .iter()
                    .map(|(name, cid)| DirEntry {
                        name: name.clone(),
                        cid: (!store.hide_child_cids).then_some(*cid),
                        size: match store.nodes.get(cid) {
                            Some(Node::File(bytes)) => Some(bytes.len() as u64),
                            _ => None,
                        },
                    })
                    .collect();
                Ok(UnixFsNode::Directory(DirNode {
                    entries: items,
                    size: None,
                }))
            }
            Some(Node::Symlink(target)) => Ok(UnixFsNode::Symlink {
                target: target.clone(),
            }),
            None => Ok(UnixFsNode::Unknown),
        }
    }

    async fn unixfs_add(&self, content: Bytes) -> Result<Cid, Error> {
        Ok(self.store.lock().unwrap().insert(Node::File(content)))
    }

    async fn raw_block(&self, cid: &Cid) -> Result<Bytes, Error> {
        let store = self.store.lock().unwrap();
        let node = store
            .nodes
            .get(cid)
            .ok_or_else(|| Error::Other(format!("block {cid} not found")))?;
        Ok(Bytes::from(node.encode()))
    }

    async fn car_stream(&self, root: &Cid) -> Result<ByteStream, Error> {
        let store = self.store.lock().unwrap();
        let mut frames = vec![Ok(car_header(root))];
        let mut queue = vec![*root];
        while let Some(cid) = queue.pop() {
            let Some(node) = store.nodes.get(&cid) else {
                continue;
            };
            frames.push(Ok(car_frame(&cid, &node.encode())));
            if let Node::Dir(entries) = node {
                queue.extend(entries.values().rev());
            }
        }
        Ok(futures::stream::iter(frames).boxed())
    }

    async fn writable_session(&self, root: &Cid) -> Result<Box<dyn WritableSession>, Error> {
        if root.codec() != 0x70 {
            return Err(Error::NotDagPb(*root));
        }
        let tree = load(&self.store.lock().unwrap(), root)?;
        Ok(Box::new(MemSession {
            backend: self.clone(),
            root: tree,
        }))
    }
}

#[derive(Debug, Clone)]
enum MutNode {
    Leaf(Cid),
    Dir(BTreeMap<String, MutNode>),
}

fn load(store: &Store, cid: &Cid) -> Result<MutNode, Error> {
    match store.nodes.get(cid) {
        Some(Node::Dir(entries)) => {
            let mut children = BTreeMap::new();
            for (name, child) in entries {
                children.insert(name.clone(), load(store, child)?);
            }
            Ok(MutNode::Dir(children))
        }
        Some(_) => Ok(MutNode::Leaf(*cid)),
        None => Err(Error::Other(format!("block {cid} not found"))),
    }
}

struct MemSession {
    backend: MemoryBackend,
    root: MutNode,
}

impl MemSession {
    fn descend<'a>(node: &'a mut MutNode, path: &str) -> Result<&'a mut MutNode, Error> {
        let mut current = node;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = match current {
                MutNode::Dir(children) => children
                    .get_mut(segment)
                    .ok_or_else(|| Error::NoLink(format!("no link named {segment:?}")))?,
                MutNode::Leaf(_) => return Err(Error::NotADirectory(segment.to_string())),
            };
        }
        Ok(current)
    }
}

#[async_trait]
impl WritableSession for MemSession {
    async fn mkdir(&mut self, path: &str, _make_parents: bool) -> Result<(), Error> {
        // The overlay always asks for parents; missing components are
        // created on demand.
        let mut current = &mut self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = match current {
                MutNode::Dir(children) => children
                    .entry(segment.to_string())
                    .or_insert_with(|| MutNode::Dir(BTreeMap::new())),
                MutNode::Leaf(_) => return Err(Error::NotADirectory(segment.to_string())),
            };
        }
        Ok(())
    }

    async fn lookup(&mut self, path: &str) -> Result<NodeKind, Error> {
        let node = Self::descend(&mut self.root, path)?;
        Ok(match node {
            MutNode::Dir(_) => NodeKind::Directory,
            MutNode::Leaf(cid) => match self.backend.store.lock().unwrap().nodes.get(cid) {
                Some(Node::File(_)) => NodeKind::File,
                Some(Node::Symlink(_)) => NodeKind::Symlink,
                Some(Node::Dir(_)) | None => NodeKind::Unknown,
            },
        })
    }

    async fn add_child(&mut self, dir: &str, name: &str, cid: &Cid) -> Result<(), Error> {
        match Self::descend(&mut self.root, dir)? {
            MutNode::Dir(children) => {
                children.insert(name.to_string(), MutNode::Leaf(*cid));
                Ok(())
            }
            MutNode::Leaf(_) => Err(Error::NotADirectory(dir.to_string())),
        }
    }

    async fn unlink(&mut self, dir: &str, name: &str) -> Result<(), Error> {
        if let MutNode::Dir(children) = Self::descend(&mut self.root, dir)? {
            children.remove(name);
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Cid, Error> {
        fn commit(store: &mut Store, node: &MutNode) -> Cid {
            match node {
                MutNode::Leaf(cid) => *cid,
                MutNode::Dir(children) => {
                    let entries = children
                        .iter()
                        .map(|(name, child)| (name.clone(), commit(store, child)))
                        .collect();
                    store.insert(Node::Dir(entries))
                }
            }
        }

        let mut store = self.backend.store.lock().unwrap();
        Ok(commit(&mut store, &self.root))
    }

    async fn abort(&mut self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn resolves_nested_paths() {
        let backend = MemoryBackend::new();
        let file = backend.add_file(b"hello");
        let inner = backend.add_dir(&[("bar", file)]);
        let root = backend.add_dir(&[("foo", inner)]);

        let path: LogicalPath = format!("/ipfs/{root}/foo/bar").parse().unwrap();
        let resolved = backend.resolve_path(&path).await.unwrap();
        assert_eq!(resolved.cid, file);
    }

    #[tokio::test]
    async fn missing_link_is_no_link() {
        let backend = MemoryBackend::new();
        let root = backend.add_dir(&[]);
        let path: LogicalPath = format!("/ipfs/{root}/nope").parse().unwrap();
        assert!(matches!(
            backend.resolve_path(&path).await,
            Err(Error::NoLink(_))
        ));
    }

    #[tokio::test]
    async fn session_roundtrip_changes_root() {
        let backend = MemoryBackend::new();
        let file = backend.add_file(b"old");
        let root = backend.add_dir(&[("a", file)]);

        let replacement = backend.add_file(b"new");
        let mut session = backend.writable_session(&root).await.unwrap();
        session.unlink("", "a").await.unwrap();
        session.add_child("", "a", &replacement).await.unwrap();
        let new_root = session.finalize().await.unwrap();

        assert_ne!(new_root, root);
        let path: LogicalPath = format!("/ipfs/{new_root}/a").parse().unwrap();
        let resolved = backend.resolve_path(&path).await.unwrap();
        assert_eq!(resolved.cid, replacement);
    }
}
