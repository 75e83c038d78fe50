//! A [`Session`] backend serving a real directory tree.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use filetime::FileTime;
use log::warn;
use ninep::codec::encode_dir;
use ninep::{
    DEFAULT_MSIZE, Dir, Error, Fid, IOHDRSZ, MAXWELEM, Qid, Result, Session, dm, estr, om,
};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::utils::{base_name, dir_from_metadata, host_err, qid_from_metadata};

/// Largest read this backend will answer in one message.
const IOUNIT: u32 = DEFAULT_MSIZE - IOHDRSZ;

/// Directory reads stream whole stat records; the client must resume
/// exactly where the previous read stopped.
struct DirReader {
    entries: Vec<Vec<u8>>,
    next: usize,
    served: u64,
}

impl DirReader {
    fn empty() -> DirReader {
        DirReader {
            entries: Vec::new(),
            next: 0,
            served: 0,
        }
    }
}

struct OpenState {
    file: Option<File>,
    mode: u8,
    remove_on_clunk: bool,
    dir: Option<DirReader>,
}

struct FidEntry {
    path: RwLock<PathBuf>,
    open: Mutex<Option<OpenState>>,
}

impl FidEntry {
    fn new(path: PathBuf) -> Arc<FidEntry> {
        Arc::new(FidEntry {
            path: RwLock::new(path),
            open: Mutex::new(None),
        })
    }
}

/// Serve a directory of the host filesystem over 9P2000.
///
/// One instance carries the fid table of one connection; hand
/// `ExportFs::new` results to the connection factory of
/// [`ninep::server::serve`].
pub struct ExportFs {
    root: PathBuf,
    fids: RwLock<HashMap<Fid, Arc<FidEntry>>>,
}

impl ExportFs {
    pub fn new(root: PathBuf) -> ExportFs {
        ExportFs {
            root,
            fids: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, fid: Fid) -> Result<Arc<FidEntry>> {
        self.fids
            .read()
            .await
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::rerror(estr::UNKNOWNFID))
    }

    /// One lexical walk step. `..` clamps at the export root so a client
    /// can never escape it.
    fn step(&self, cur: &Path, name: &str) -> Result<PathBuf> {
        match name {
            "" | "." => Ok(cur.to_owned()),
            ".." => {
                if cur == self.root {
                    Ok(cur.to_owned())
                } else {
                    Ok(cur.parent().unwrap_or(&self.root).to_owned())
                }
            }
            _ if name.contains('/') => Err(Error::rerror(estr::BOTCH)),
            _ => Ok(cur.join(name)),
        }
    }

    async fn snapshot(&self, path: &Path) -> Result<DirReader> {
        let mut rd = fs::read_dir(path).await.map_err(host_err)?;
        let mut entries = Vec::new();

        while let Some(ent) = rd.next_entry().await.map_err(host_err)? {
            let attr = match ent.metadata().await {
                Ok(attr) => attr,
                Err(e) => {
                    warn!("expfs: skipping unreadable entry {:?}: {}", ent.path(), e);
                    continue;
                }
            };

            let record = dir_from_metadata(&ent.file_name().to_string_lossy(), &attr);
            let mut buf = Vec::new();
            encode_dir(&mut buf, &record)?;
            entries.push(buf);
        }

        Ok(DirReader {
            entries,
            next: 0,
            served: 0,
        })
    }
}

fn wants_write(mode: u8) -> bool {
    matches!(mode & 3, om::WRITE | om::RDWR) || mode & om::TRUNC != 0
}

fn readable(mode: u8) -> bool {
    matches!(mode & 3, om::READ | om::RDWR | om::EXEC)
}

fn writable(mode: u8) -> bool {
    matches!(mode & 3, om::WRITE | om::RDWR)
}

fn open_options(mode: u8) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match mode & 3 {
        om::WRITE => {
            opts.write(true);
        }
        om::RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if mode & om::TRUNC != 0 && mode & 3 != om::EXEC {
        opts.write(true).truncate(true);
    }
    opts
}

#[async_trait]
impl Session for ExportFs {
    async fn attach(&self, fid: Fid, _afid: Fid, _uname: &str, aname: &str) -> Result<Qid> {
        if !aname.is_empty() && aname != "/" {
            return Err(Error::rerror(estr::BADATTACH));
        }

        let attr = fs::symlink_metadata(&self.root).await.map_err(host_err)?;

        let mut fids = self.fids.write().await;
        if fids.contains_key(&fid) {
            return Err(Error::rerror(estr::DUPFID));
        }
        fids.insert(fid, FidEntry::new(self.root.clone()));

        Ok(qid_from_metadata(&attr))
    }

    async fn walk(&self, fid: Fid, newfid: Fid, names: &[String]) -> Result<Vec<Qid>> {
        let entry = self.entry(fid).await?;
        if names.len() > MAXWELEM {
            return Err(Error::rerror(estr::BOTCH));
        }
        if entry.open.lock().await.is_some() {
            return Err(Error::rerror(estr::BOTCH));
        }

        let mut path = entry.path.read().await.clone();
        let mut qids = Vec::new();

        for (i, name) in names.iter().enumerate() {
            let attr = fs::symlink_metadata(&path).await.map_err(host_err)?;
            if !attr.is_dir() {
                if i == 0 {
                    return Err(Error::rerror(estr::WALKNODIR));
                }
                return Ok(qids);
            }

            let next = self.step(&path, name)?;
            match fs::symlink_metadata(&next).await {
                Ok(attr) => {
                    qids.push(qid_from_metadata(&attr));
                    path = next;
                }
                Err(e) => {
                    if i == 0 {
                        return Err(host_err(e));
                    }
                    // partial success: the walked prefix is reported and
                    // newfid stays unallocated
                    return Ok(qids);
                }
            }
        }

        let mut fids = self.fids.write().await;
        if newfid != fid && fids.contains_key(&newfid) {
            return Err(Error::rerror(estr::DUPFID));
        }
        fids.insert(newfid, FidEntry::new(path));

        Ok(qids)
    }

    async fn open(&self, fid: Fid, mode: u8) -> Result<(Qid, u32)> {
        let entry = self.entry(fid).await?;
        let path = entry.path.read().await.clone();
        let mut open = entry.open.lock().await;
        if open.is_some() {
            return Err(Error::rerror(estr::BOTCH));
        }

        let attr = fs::symlink_metadata(&path).await.map_err(host_err)?;
        let qid = qid_from_metadata(&attr);

        if attr.is_dir() {
            if wants_write(mode) || mode & om::RCLOSE != 0 {
                return Err(Error::rerror(estr::ISDIR));
            }
            *open = Some(OpenState {
                file: None,
                mode,
                remove_on_clunk: false,
                dir: Some(DirReader::empty()),
            });
        } else {
            let file = open_options(mode).open(&path).await.map_err(host_err)?;
            *open = Some(OpenState {
                file: Some(file),
                mode,
                remove_on_clunk: mode & om::RCLOSE != 0,
                dir: None,
            });
        }

        Ok((qid, IOUNIT))
    }

    async fn create(&self, fid: Fid, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::rerror(estr::BOTCH));
        }

        let entry = self.entry(fid).await?;
        let parent = entry.path.read().await.clone();
        let mut open = entry.open.lock().await;
        if open.is_some() {
            return Err(Error::rerror(estr::BOTCH));
        }

        let attr = fs::symlink_metadata(&parent).await.map_err(host_err)?;
        if !attr.is_dir() {
            return Err(Error::rerror(estr::CREATENONDIR));
        }

        let path = parent.join(name);

        let (qid, state) = if perm & dm::DIR != 0 {
            fs::create_dir(&path).await.map_err(host_err)?;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(perm & 0o777))
                .await
                .map_err(host_err)?;

            let attr = fs::symlink_metadata(&path).await.map_err(host_err)?;
            (
                qid_from_metadata(&attr),
                OpenState {
                    file: None,
                    mode,
                    remove_on_clunk: false,
                    dir: Some(DirReader::empty()),
                },
            )
        } else {
            // The creating open is read-write regardless of the requested
            // mode; the mode still governs later reads and writes on this
            // fid.
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(perm & 0o777)
                .open(&path)
                .await
                .map_err(host_err)?;

            let attr = file.metadata().await.map_err(host_err)?;
            (
                qid_from_metadata(&attr),
                OpenState {
                    file: Some(file),
                    mode,
                    remove_on_clunk: mode & om::RCLOSE != 0,
                    dir: None,
                },
            )
        };

        // the fid now names the created file
        *entry.path.write().await = path;
        *open = Some(state);

        Ok((qid, IOUNIT))
    }

    async fn read(&self, fid: Fid, offset: u64, count: u32) -> Result<Vec<u8>> {
        let entry = self.entry(fid).await?;
        let path = entry.path.read().await.clone();
        let mut open = entry.open.lock().await;
        let state = open
            .as_mut()
            .ok_or_else(|| Error::rerror(estr::BOTCH))?;
        if !readable(state.mode) {
            return Err(Error::rerror(estr::PERM));
        }

        let count = count.min(IOUNIT);

        if let Some(dir) = state.dir.as_mut() {
            if offset == 0 {
                *dir = self.snapshot(&path).await?;
            } else if offset != dir.served {
                return Err(Error::rerror(estr::BADOFFSET));
            }

            let mut out = Vec::new();
            while dir.next < dir.entries.len() {
                let record = &dir.entries[dir.next];
                if out.len() + record.len() > count as usize {
                    break;
                }
                out.extend_from_slice(record);
                dir.next += 1;
            }
            dir.served += out.len() as u64;
            return Ok(out);
        }

        match state.file.as_mut() {
            Some(file) => {
                file.seek(SeekFrom::Start(offset)).await.map_err(host_err)?;
                let mut buf = vec![0u8; count as usize];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await.map_err(host_err)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            None => Err(Error::rerror(estr::BOTCH)),
        }
    }

    async fn write(&self, fid: Fid, offset: u64, data: &[u8]) -> Result<u32> {
        let entry = self.entry(fid).await?;
        let mut open = entry.open.lock().await;
        let state = open
            .as_mut()
            .ok_or_else(|| Error::rerror(estr::BOTCH))?;

        if state.dir.is_some() {
            return Err(Error::rerror(estr::ISDIR));
        }
        if !writable(state.mode) {
            return Err(Error::rerror(estr::PERM));
        }

        match state.file.as_mut() {
            Some(file) => {
                file.seek(SeekFrom::Start(offset)).await.map_err(host_err)?;
                file.write_all(data).await.map_err(host_err)?;
                Ok(data.len() as u32)
            }
            None => Err(Error::rerror(estr::BOTCH)),
        }
    }

    async fn clunk(&self, fid: Fid) -> Result<()> {
        let entry = self
            .fids
            .write()
            .await
            .remove(&fid)
            .ok_or_else(|| Error::rerror(estr::UNKNOWNFID))?;

        let open = entry.open.lock().await.take();
        if let Some(state) = open {
            drop(state.file);
            if state.remove_on_clunk {
                let path = entry.path.read().await.clone();
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("expfs: remove-on-close of {:?} failed: {}", path, e);
                }
            }
        }

        Ok(())
    }

    async fn remove(&self, fid: Fid) -> Result<()> {
        // the fid is clunked whether or not the removal succeeds
        let entry = self
            .fids
            .write()
            .await
            .remove(&fid)
            .ok_or_else(|| Error::rerror(estr::UNKNOWNFID))?;

        let path = entry.path.read().await.clone();
        let attr = fs::symlink_metadata(&path).await.map_err(host_err)?;
        if attr.is_dir() {
            fs::remove_dir(&path).await.map_err(host_err)?;
        } else {
            fs::remove_file(&path).await.map_err(host_err)?;
        }

        Ok(())
    }

    async fn stat(&self, fid: Fid) -> Result<Dir> {
        let entry = self.entry(fid).await?;
        let path = entry.path.read().await.clone();
        let attr = fs::symlink_metadata(&path).await.map_err(host_err)?;
        Ok(dir_from_metadata(&base_name(&path), &attr))
    }

    async fn wstat(&self, fid: Fid, dir: &Dir) -> Result<()> {
        let entry = self.entry(fid).await?;
        let path = entry.path.read().await.clone();
        let keep = Dir::keep();

        if !dir.uid.is_empty() || !dir.gid.is_empty() || !dir.muid.is_empty() {
            return Err(Error::rerror(estr::NOWSTAT));
        }
        if dir.typ != keep.typ || dir.dev != keep.dev || dir.qid != keep.qid {
            return Err(Error::rerror(estr::BADDIR));
        }

        // an all-defaults wstat asks for the file to be flushed to stable
        // storage
        if dir.mode == keep.mode
            && dir.length == keep.length
            && dir.atime == keep.atime
            && dir.mtime == keep.mtime
            && dir.name.is_empty()
        {
            let mut open = entry.open.lock().await;
            if let Some(state) = open.as_mut() {
                if let Some(file) = state.file.as_mut() {
                    file.sync_all().await.map_err(host_err)?;
                }
            }
            return Ok(());
        }

        if !dir.name.is_empty() {
            if dir.name == "." || dir.name == ".." || dir.name.contains('/') {
                return Err(Error::rerror(estr::BADDIR));
            }
            let parent = path
                .parent()
                .ok_or_else(|| Error::rerror(estr::NOWSTAT))?;
            let renamed = parent.join(&dir.name);
            fs::rename(&path, &renamed).await.map_err(host_err)?;
            *entry.path.write().await = renamed.clone();

            return self.apply_times_and_bits(&renamed, dir, &keep).await;
        }

        self.apply_times_and_bits(&path, dir, &keep).await
    }
}

impl ExportFs {
    async fn apply_times_and_bits(&self, path: &Path, dir: &Dir, keep: &Dir) -> Result<()> {
        if dir.mode != keep.mode {
            fs::set_permissions(path, std::fs::Permissions::from_mode(dir.mode & 0o777))
                .await
                .map_err(host_err)?;
        }

        if dir.length != keep.length {
            let attr = fs::symlink_metadata(path).await.map_err(host_err)?;
            if attr.is_dir() {
                return Err(Error::rerror(estr::ISDIR));
            }
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(host_err)?;
            file.set_len(dir.length).await.map_err(host_err)?;
        }

        if dir.atime != keep.atime || dir.mtime != keep.mtime {
            let attr = fs::symlink_metadata(path).await.map_err(host_err)?;
            let atime = if dir.atime != keep.atime {
                FileTime::from_unix_time(dir.atime as i64, 0)
            } else {
                FileTime::from_last_access_time(&attr)
            };
            let mtime = if dir.mtime != keep.mtime {
                FileTime::from_unix_time(dir.mtime as i64, 0)
            } else {
                FileTime::from_last_modification_time(&attr)
            };

            let path = path.to_owned();
            tokio::task::spawn_blocking(move || filetime::set_file_times(&path, atime, mtime))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))?
                .map_err(host_err)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ninep::NOFID;
    use ninep::codec::decode_dir;

    use super::*;

    async fn fixture() -> (tempfile::TempDir, ExportFs) {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("hello.txt"), b"hello from the host\n").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/inner.txt"), b"inner").unwrap();

        let fs = ExportFs::new(tmp.path().to_owned());
        fs.attach(0, NOFID, "anyone", "/").await.unwrap();
        (tmp, fs)
    }

    #[tokio::test]
    async fn walk_open_read_a_file() {
        let (_tmp, fs) = fixture().await;

        let qids = fs.walk(0, 1, &["hello.txt".to_owned()]).await.unwrap();
        assert_eq!(qids.len(), 1);
        assert!(!qids[0].typ.contains(ninep::QidType::DIR));

        let (qid, iounit) = fs.open(1, om::READ).await.unwrap();
        assert_eq!(qid, qids[0]);
        assert!(iounit > 0);

        let data = fs.read(1, 0, 4096).await.unwrap();
        assert_eq!(data, b"hello from the host\n");

        // reads past EOF are empty
        assert!(fs.read(1, data.len() as u64, 4096).await.unwrap().is_empty());
        fs.clunk(1).await.unwrap();
    }

    #[tokio::test]
    async fn partial_walk_leaves_newfid_unallocated() {
        let (_tmp, fs) = fixture().await;

        let qids = fs
            .walk(0, 1, &["sub".to_owned(), "missing".to_owned()])
            .await
            .unwrap();
        assert_eq!(qids.len(), 1, "only the walked prefix is reported");

        // fid 1 was never bound
        let err = fs.open(1, om::READ).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::UNKNOWNFID));

        // and a first-element miss is a hard error
        let err = fs.walk(0, 1, &["missing".to_owned()]).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::NOTFOUND));
    }

    #[tokio::test]
    async fn dotdot_is_clamped_at_the_export_root() {
        let (_tmp, fs) = fixture().await;

        let qids = fs
            .walk(0, 1, &["..".to_owned(), "..".to_owned(), "hello.txt".to_owned()])
            .await
            .unwrap();
        assert_eq!(qids.len(), 3, "dotdot above the root resolves to the root");
    }

    #[tokio::test]
    async fn directory_read_streams_stat_records() {
        let (_tmp, fs) = fixture().await;

        fs.walk(0, 1, &[]).await.unwrap();
        fs.open(1, om::READ).await.unwrap();

        let mut payload = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk = fs.read(1, offset, 128).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            payload.extend_from_slice(&chunk);
        }

        let mut rd = std::io::Cursor::new(&payload[..]);
        let mut names = Vec::new();
        while (rd.position() as usize) < payload.len() {
            names.push(decode_dir(&mut rd).unwrap().name);
        }
        names.sort();
        assert_eq!(names, vec!["hello.txt".to_owned(), "sub".to_owned()]);

        // resuming anywhere but the previous end is refused
        let err = fs.read(1, offset + 3, 128).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::BADOFFSET));
    }

    #[tokio::test]
    async fn open_directory_for_writing_is_refused() {
        let (_tmp, fs) = fixture().await;
        fs.walk(0, 1, &[]).await.unwrap();
        let err = fs.open(1, om::WRITE).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::ISDIR));
    }

    #[tokio::test]
    async fn create_write_readback_remove() {
        let (tmp, fs) = fixture().await;

        fs.walk(0, 1, &[]).await.unwrap();
        let (qid, _) = fs.create(1, "fresh.txt", 0o644, om::RDWR).await.unwrap();
        assert!(!qid.typ.contains(ninep::QidType::DIR));

        assert_eq!(fs.write(1, 0, b"payload").await.unwrap(), 7);
        assert_eq!(fs.read(1, 0, 64).await.unwrap(), b"payload");
        assert!(tmp.path().join("fresh.txt").exists());

        // creating it again collides
        fs.walk(0, 2, &[]).await.unwrap();
        assert!(fs.create(2, "fresh.txt", 0o644, om::WRITE).await.is_err());
        fs.clunk(2).await.unwrap();

        fs.remove(1).await.unwrap();
        assert!(!tmp.path().join("fresh.txt").exists());

        // remove clunked the fid
        let err = fs.read(1, 0, 16).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::UNKNOWNFID));
    }

    #[tokio::test]
    async fn wstat_renames_and_truncates() {
        let (tmp, fs) = fixture().await;

        fs.walk(0, 1, &["hello.txt".to_owned()]).await.unwrap();

        let mut change = Dir::keep();
        change.name = "renamed.txt".to_owned();
        change.length = 5;
        fs.wstat(1, &change).await.unwrap();

        assert!(!tmp.path().join("hello.txt").exists());
        assert_eq!(
            std::fs::read(tmp.path().join("renamed.txt")).unwrap(),
            b"hello"
        );

        // changing ownership is refused
        let mut change = Dir::keep();
        change.uid = "root".to_owned();
        let err = fs.wstat(1, &change).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::NOWSTAT));
    }

    #[tokio::test]
    async fn write_through_read_only_fid_is_refused() {
        let (_tmp, fs) = fixture().await;
        fs.walk(0, 1, &["hello.txt".to_owned()]).await.unwrap();
        fs.open(1, om::READ).await.unwrap();
        let err = fs.write(1, 0, b"nope").await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::PERM));
    }
}
