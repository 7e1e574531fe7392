// Logical gateway paths: /ipfs/<cid>[/...] and /ipns/<name>[/...]

use std::fmt;
use std::str::FromStr;

use cid::Cid;
use percent_encoding::percent_decode_str;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("path does not begin with /ipfs/ or /ipns/")]
    UnknownNamespace,

    #[error("path is missing a root after the namespace")]
    MissingRoot,

    #[error("invalid cid {0:?}: {1}")]
    InvalidCid(String, cid::Error),

    #[error("invalid escaping in segment {0:?}")]
    BadEscape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Ipfs,
    Ipns,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Ipfs => "ipfs",
            Namespace::Ipns => "ipns",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated gateway path. Segments are stored URL-unescaped; the first
/// segment is a CID under `/ipfs/` and a routable name under `/ipns/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPath {
    namespace: Namespace,
    segments: Vec<String>,
}

impl LogicalPath {
    pub fn from_cid(cid: &Cid) -> Self {
        LogicalPath {
            namespace: Namespace::Ipfs,
            segments: vec![cid.to_string()],
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// True iff resolution of this path may change over time.
    pub fn is_mutable(&self) -> bool {
        self.namespace == Namespace::Ipns
    }

    /// The CID or routable name directly after the namespace.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Segments below the root, joined back into a relative path.
    pub fn interior(&self) -> String {
        self.segments[1..].join("/")
    }

    pub fn join(&self, name: &str) -> LogicalPath {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        LogicalPath {
            namespace: self.namespace,
            segments,
        }
    }

    /// Every non-empty prefix of the path, shortest first. The last entry
    /// is the path itself.
    pub fn prefixes(&self) -> impl DoubleEndedIterator<Item = LogicalPath> + '_ {
        (1..=self.segments.len()).map(|end| LogicalPath {
            namespace: self.namespace,
            segments: self.segments[..end].to_vec(),
        })
    }
}

impl FromStr for LogicalPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let rest = s.strip_prefix('/').ok_or(Error::UnknownNamespace)?;
        let (namespace, rest) = if let Some(rest) = rest.strip_prefix("ipfs/") {
            (Namespace::Ipfs, rest)
        } else if let Some(rest) = rest.strip_prefix("ipns/") {
            (Namespace::Ipns, rest)
        } else {
            return Err(Error::UnknownNamespace);
        };

        let segments = rest
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                percent_decode_str(segment)
                    .decode_utf8()
                    .map(|decoded| decoded.into_owned())
                    .map_err(|_| Error::BadEscape(segment.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if segments.is_empty() {
            return Err(Error::MissingRoot);
        }

        if namespace == Namespace::Ipfs {
            segments[0]
                .parse::<Cid>()
                .map_err(|e| Error::InvalidCid(segments[0].clone(), e))?;
        }

        Ok(LogicalPath {
            namespace,
            segments,
        })
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.namespace)?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// A logical path paired with the CID it terminally refers to.
/// Produced by the backend resolver only.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub logical: LogicalPath,
    pub cid: Cid,
}
