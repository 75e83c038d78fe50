//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with `Rversion` when the server does not
/// understand the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: Tag = !0;

/// Special value which `Tattach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that
/// authentication is not required, the afid field in the attach message
/// should be set to `NOFID`
pub const NOFID: Fid = !0;

/// Ample room for `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Overhead of an `Rread` reply: size[4] Rread[1] tag[2] count[4]
pub const RREADHDRSZ: u32 = 11;

/// Maximum number of path elements in a single `Twalk`
pub const MAXWELEM: usize = 16;

/// Default maximum message size offered during version negotiation
pub const DEFAULT_MSIZE: u32 = 65536;

/// Smallest msize a channel will operate with: room for the smallest R-reply
/// header plus one byte of payload
pub const MIN_MSIZE: u32 = 24;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// A client-chosen handle onto a server resource
pub type Fid = u32;

/// A client-chosen identifier correlating a request with its reply
pub type Tag = u16;

/// The type of I/O requested by `Topen`/`Tcreate`
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 0x10;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 0x20;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 0x40;
}

/// Bits in `Dir.mode`
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in `Qid.typ`
    ///
    /// QidType can be constructed from std::fs::FileType via From trait
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<::std::fs::FileType> for QidType {
    fn from(typ: ::std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a ::std::fs::FileType> for QidType {
    fn from(typ: &'a ::std::fs::FileType) -> Self {
        if typ.is_dir() {
            QidType::DIR
        } else {
            QidType::FILE
        }
    }
}

/// Server side unique identification for the resource behind a fid
///
/// Two resources on one server are the same if and only if their qids are
/// equal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QidType,
    /// Version number for a file; typically incremented every time the file
    /// is modified
    pub version: u32,
    /// An integer unique among all files in the hierarchy
    pub path: u64,
}

impl Qid {
    /// Encoded length: typ[1] version[4] path[8]
    pub const WIRE_SIZE: u32 = 13;
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// Carried by `Rstat`/`Twstat` and, one record after another, in the payload
/// of a directory read. Times are 32-bit Unix epoch seconds (UTC).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dir {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: Qid,
    /// Permissions, a union of `dm` bits
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Dir {
    /// Byte count of the encoded fields, excluding the record's own two-byte
    /// size prefix.
    pub fn size(&self) -> u16 {
        (size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + Qid::WIRE_SIZE as usize
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    /// A stat record whose every field carries the "don't touch" value, the
    /// starting point for a `Twstat` that changes only selected fields.
    pub fn keep() -> Dir {
        Dir {
            typ: !0,
            dev: !0,
            qid: Qid {
                typ: QidType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }
}

/// Payload of `Rread` and `Twrite`
///
/// On the wire this carries a four-byte count, unlike strings, which carry
/// two.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        Terror          = 106,  // Illegal, never sent
        Rerror,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Topen           = 112,
        Ropen,
        Tcreate         = 114,
        Rcreate,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
        Tstat           = 124,
        Rstat,
        Twstat          = 126,
        Rwstat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            Rversion
                | Rauth
                | Rattach
                | Rerror
                | Rflush
                | Rwalk
                | Ropen
                | Rcreate
                | Rread
                | Rwrite
                | Rclunk
                | Rremove
                | Rstat
                | Rwstat
        )
    }
}

impl<'a> From<&'a Fcall> for MsgType {
    fn from(fcall: &'a Fcall) -> MsgType {
        match *fcall {
            Fcall::Tversion { .. } => MsgType::Tversion,
            Fcall::Rversion { .. } => MsgType::Rversion,
            Fcall::Tauth { .. } => MsgType::Tauth,
            Fcall::Rauth { .. } => MsgType::Rauth,
            Fcall::Tattach { .. } => MsgType::Tattach,
            Fcall::Rattach { .. } => MsgType::Rattach,
            Fcall::Rerror { .. } => MsgType::Rerror,
            Fcall::Tflush { .. } => MsgType::Tflush,
            Fcall::Rflush => MsgType::Rflush,
            Fcall::Twalk { .. } => MsgType::Twalk,
            Fcall::Rwalk { .. } => MsgType::Rwalk,
            Fcall::Topen { .. } => MsgType::Topen,
            Fcall::Ropen { .. } => MsgType::Ropen,
            Fcall::Tcreate { .. } => MsgType::Tcreate,
            Fcall::Rcreate { .. } => MsgType::Rcreate,
            Fcall::Tread { .. } => MsgType::Tread,
            Fcall::Rread { .. } => MsgType::Rread,
            Fcall::Twrite { .. } => MsgType::Twrite,
            Fcall::Rwrite { .. } => MsgType::Rwrite,
            Fcall::Tclunk { .. } => MsgType::Tclunk,
            Fcall::Rclunk => MsgType::Rclunk,
            Fcall::Tremove { .. } => MsgType::Tremove,
            Fcall::Rremove => MsgType::Rremove,
            Fcall::Tstat { .. } => MsgType::Tstat,
            Fcall::Rstat { .. } => MsgType::Rstat,
            Fcall::Twstat { .. } => MsgType::Twstat,
            Fcall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: Fid,
        uname: String,
        aname: String,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: Fid,
        afid: Fid,
        uname: String,
        aname: String,
    },
    Rattach {
        qid: Qid,
    },
    Rerror {
        ename: String,
    },
    Tflush {
        oldtag: Tag,
    },
    Rflush,
    Twalk {
        fid: Fid,
        newfid: Fid,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Topen {
        fid: Fid,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: Fid,
        name: String,
        perm: u32,
        mode: u8,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: Fid,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: Fid,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: Fid,
    },
    Rclunk,
    Tremove {
        fid: Fid,
    },
    Rremove,
    Tstat {
        fid: Fid,
    },
    Rstat {
        stat: Dir,
    },
    Twstat {
        fid: Fid,
        stat: Dir,
    },
    Rwstat,
}

impl Fcall {
    /// Get the fids which self contains
    pub fn fids(&self) -> Vec<Fid> {
        match *self {
            Fcall::Tattach { fid, afid, .. } if afid != NOFID => vec![fid, afid],
            Fcall::Tattach { fid, .. } => vec![fid],
            Fcall::Tauth { afid, .. } => vec![afid],
            Fcall::Twalk { fid, .. } => vec![fid],
            Fcall::Topen { fid, .. } => vec![fid],
            Fcall::Tcreate { fid, .. } => vec![fid],
            Fcall::Tread { fid, .. } => vec![fid],
            Fcall::Twrite { fid, .. } => vec![fid],
            Fcall::Tclunk { fid } => vec![fid],
            Fcall::Tremove { fid } => vec![fid],
            Fcall::Tstat { fid } => vec![fid],
            Fcall::Twstat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// Get the fid this request introduces, if any
    pub fn newfid(&self) -> Option<Fid> {
        match *self {
            Fcall::Tauth { afid, .. } => Some(afid),
            Fcall::Tattach { fid, .. } => Some(fid),
            Fcall::Twalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }

    /// Get the qids which self contains
    pub fn qids(&self) -> Vec<Qid> {
        match *self {
            Fcall::Rauth { aqid } => vec![aqid],
            Fcall::Rattach { qid } => vec![qid],
            Fcall::Ropen { qid, .. } => vec![qid],
            Fcall::Rcreate { qid, .. } => vec![qid],
            Fcall::Rwalk { ref wqids } => wqids.clone(),
            _ => Vec::new(),
        }
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: Tag,
    /// Message body encapsulating the various 9P messages
    pub body: Fcall,
}

impl Msg {
    pub fn new(tag: Tag, body: Fcall) -> Msg {
        Msg { tag, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fid_accessors() {
        let walk = Fcall::Twalk {
            fid: 3,
            newfid: 4,
            wnames: vec!["usr".to_owned()],
        };
        assert_eq!(walk.fids(), vec![3]);
        assert_eq!(walk.newfid(), Some(4));

        let attach = Fcall::Tattach {
            fid: 1,
            afid: NOFID,
            uname: "u".to_owned(),
            aname: "/".to_owned(),
        };
        assert_eq!(attach.fids(), vec![1], "NOFID is not a real fid");
        assert_eq!(attach.newfid(), Some(1));

        assert_eq!(Fcall::Rflush.newfid(), None);
    }

    #[test]
    fn qid_accessors() {
        let qid = Qid {
            typ: QidType::DIR,
            version: 7,
            path: 11,
        };
        assert_eq!(Fcall::Rattach { qid }.qids(), vec![qid]);
        assert_eq!(
            Fcall::Rwalk {
                wqids: vec![qid, qid]
            }
            .qids()
            .len(),
            2
        );
        assert!(Fcall::Rclunk.qids().is_empty());
    }

    #[test]
    fn message_type_parity() {
        assert!(MsgType::Tversion.is_t());
        assert!(MsgType::Rversion.is_r());
        assert_eq!(MsgType::Tversion as u8, 100);
        assert_eq!(MsgType::Rwstat as u8, 127);
        assert_eq!(MsgType::Terror as u8, 106);
    }

    #[test]
    fn dir_sizes_track_string_lengths() {
        let mut dir = Dir::default();
        let fixed = dir.size();
        dir.name = "four".to_owned();
        assert_eq!(dir.size(), fixed + 4);
    }
}
