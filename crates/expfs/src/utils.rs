use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Mutex;

use ninep::{Dir, Error, Qid, dm, estr};

/// Derive a qid from host metadata. The inode doubles as the path field and
/// the mtime as a cheap version counter.
pub fn qid_from_metadata(attr: &Metadata) -> Qid {
    Qid {
        typ: From::from(attr.file_type()),
        version: attr.mtime() as u32,
        path: attr.ino(),
    }
}

/// Build a stat record for one directory entry or file.
pub fn dir_from_metadata(name: &str, attr: &Metadata) -> Dir {
    let mode = (attr.mode() & 0o777) | if attr.is_dir() { dm::DIR } else { 0 };
    let uid = user_name(attr.uid());

    Dir {
        typ: 0,
        dev: attr.dev() as u32,
        qid: qid_from_metadata(attr),
        mode,
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if attr.is_dir() { 0 } else { attr.size() },
        name: name.to_owned(),
        uid: uid.clone(),
        gid: group_name(attr.gid()),
        muid: uid,
    }
}

/// The name component of a path, `/` for the root itself.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_owned())
}

/// Map host I/O failures onto the canonical 9P error strings where one
/// fits.
pub fn host_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::rerror(estr::NOTFOUND),
        io::ErrorKind::PermissionDenied => Error::rerror(estr::PERM),
        io::ErrorKind::AlreadyExists => Error::rerror("file already exists"),
        _ => Error::Io(e),
    }
}

// uid/gid lookups hit the passwd database; memoize them for the lifetime of
// the process.
static USERS: Mutex<Option<HashMap<u32, String>>> = Mutex::new(None);
static GROUPS: Mutex<Option<HashMap<u32, String>>> = Mutex::new(None);

fn user_name(uid: u32) -> String {
    let mut cache = USERS.lock().unwrap();
    let cache = cache.get_or_insert_with(HashMap::new);
    cache
        .entry(uid)
        .or_insert_with(|| {
            nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|u| u.name)
                .unwrap_or_else(|| uid.to_string())
        })
        .clone()
}

fn group_name(gid: u32) -> String {
    let mut cache = GROUPS.lock().unwrap();
    let cache = cache.get_or_insert_with(HashMap::new);
    cache
        .entry(gid)
        .or_insert_with(|| {
            nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
                .ok()
                .flatten()
                .map(|g| g.name)
                .unwrap_or_else(|| gid.to_string())
        })
        .clone()
}
