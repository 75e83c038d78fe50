//! Error taxonomy for the 9P2000 client and server runtime.

use std::io;

use thiserror::Error;

/// Canonical 9P error strings, sent over the wire in `Rerror.ename`.
///
/// Servers should prefer these over ad-hoc strings so that clients across
/// implementations can match on them.
pub mod estr {
    pub const BADATTACH: &str = "unknown specifier in attach";
    pub const BADOFFSET: &str = "bad offset";
    pub const BADCOUNT: &str = "bad count";
    pub const BOTCH: &str = "9P protocol botch";
    pub const CREATENONDIR: &str = "create in non-directory";
    pub const DUPFID: &str = "duplicate fid";
    pub const DUPTAG: &str = "duplicate tag";
    pub const ISDIR: &str = "is a directory";
    pub const NOCREATE: &str = "create prohibited";
    pub const NOMEM: &str = "out of memory";
    pub const NOREMOVE: &str = "remove prohibited";
    pub const NOSTAT: &str = "stat prohibited";
    pub const NOTFOUND: &str = "file not found";
    pub const NOWRITE: &str = "write prohibited";
    pub const NOWSTAT: &str = "wstat prohibited";
    pub const PERM: &str = "permission denied";
    pub const UNKNOWNFID: &str = "unknown fid";
    pub const UNKNOWNTAG: &str = "unknown tag";
    pub const BADDIR: &str = "bad directory in wstat";
    pub const WALKNODIR: &str = "walk in non-directory";
}

/// Errors produced by channels, transports and sessions.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection, transport or pool has been shut down.
    #[error("closed")]
    Closed,

    /// A read or write missed its deadline.
    #[error("fcall timeout")]
    Timeout,

    /// A message did not fit within the negotiated msize.
    #[error("fcall of {size} bytes exceeds msize of {msize}")]
    Overflow { size: u32, msize: u32 },

    /// The byte stream carried an unparseable or misframed fcall.
    /// Terminal for the connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// An `Rerror` received from the remote, or a canonical 9P error raised
    /// locally. Displays as the bare `ename`.
    #[error("{0}")]
    Rerror(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a wire error from an `ename`, typically one of [`estr`].
    pub fn rerror(ename: impl Into<String>) -> Error {
        Error::Rerror(ename.into())
    }

    /// Number of bytes by which a message exceeded msize, if this is an
    /// overflow error.
    pub fn overflow(&self) -> Option<u32> {
        match self {
            Error::Overflow { size, msize } => Some(size.saturating_sub(*msize)),
            _ => None,
        }
    }

    /// The remote error string, if this is a wire error.
    pub fn ename(&self) -> Option<&str> {
        match self {
            Error::Rerror(ename) => Some(ename),
            _ => None,
        }
    }

    /// Whether this is a transient read condition (deadline pump) that a
    /// receive loop should retry rather than treat as terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
