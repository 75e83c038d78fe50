//! The `Session` abstraction and the server-side dispatch onto it.

use async_trait::async_trait;

use crate::error::{Error, estr};
use crate::fcall::*;
use crate::utils::Result;

/// The central abstraction for a 9P connection: the operation set covered in
/// section 5 of the Plan 9 manual, one method per T-message.
///
/// Clients implement sessions over a transport and servers serve sessions,
/// so a session can be proxied by serving up a client session. Version and
/// flush are absent on purpose: the handshake belongs to connection setup
/// and request cancellation is driven by dropping the pending call.
#[async_trait]
pub trait Session: Send + Sync {
    /// Establish an authentication file for `uname`/`aname` on `afid`.
    async fn auth(&self, afid: Fid, uname: &str, aname: &str) -> Result<Qid> {
        let _ = (afid, uname, aname);
        Err(Error::rerror("authentication unsupported"))
    }

    /// Bind `fid` to the root of the tree named by `aname`, returning its
    /// qid.
    async fn attach(&self, fid: Fid, afid: Fid, uname: &str, aname: &str) -> Result<Qid>;

    /// Navigate from `fid` by up to [`MAXWELEM`] names, binding the result
    /// to `newfid`. On partial success the qids of the walked prefix are
    /// returned and `newfid` stays unallocated.
    async fn walk(&self, fid: Fid, newfid: Fid, names: &[String]) -> Result<Vec<Qid>>;

    /// Prepare `fid` for I/O. Returns the qid and the iounit (0 if the
    /// server has no preference).
    async fn open(&self, fid: Fid, mode: u8) -> Result<(Qid, u32)>;

    /// Create `name` in the directory bound to `fid` and open it; `fid`
    /// comes to represent the new file.
    async fn create(&self, fid: Fid, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)>;

    /// Read up to `count` bytes at `offset`. An empty result signals EOF.
    async fn read(&self, fid: Fid, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes accepted.
    async fn write(&self, fid: Fid, offset: u64, data: &[u8]) -> Result<u32>;

    /// Release `fid` without touching the resource behind it.
    async fn clunk(&self, fid: Fid) -> Result<()>;

    /// Remove the resource behind `fid`. The fid is clunked whether or not
    /// the removal succeeded.
    async fn remove(&self, fid: Fid) -> Result<()>;

    async fn stat(&self, fid: Fid) -> Result<Dir>;

    /// Update metadata; fields carrying the "don't touch" values of
    /// [`Dir::keep`] are left alone.
    async fn wstat(&self, fid: Fid, dir: &Dir) -> Result<()>;
}

/// A server-side request processor, one call per inbound request.
///
/// Errors become `Rerror` replies carrying the error's display string.
/// Handlers run concurrently; a handler future is dropped when its request
/// is flushed, so implementations must be cancel-safe at await points.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &Fcall) -> Result<Fcall>;
}

/// Routes fcalls to a [`Session`].
///
/// `Tversion` and `Tflush` never reach the dispatcher; the serve loop owns
/// them. Any other unexpected message is a protocol botch.
pub struct Dispatcher<S> {
    session: S,
}

/// Wrap a session in a [`Handler`] suitable for [`crate::server::serve_conn`].
pub fn dispatch<S: Session>(session: S) -> Dispatcher<S> {
    Dispatcher { session }
}

#[async_trait]
impl<S: Session> Handler for Dispatcher<S> {
    async fn handle(&self, req: &Fcall) -> Result<Fcall> {
        let resp = match *req {
            Fcall::Tauth {
                afid,
                ref uname,
                ref aname,
            } => Fcall::Rauth {
                aqid: self.session.auth(afid, uname, aname).await?,
            },
            Fcall::Tattach {
                fid,
                afid,
                ref uname,
                ref aname,
            } => Fcall::Rattach {
                qid: self.session.attach(fid, afid, uname, aname).await?,
            },
            Fcall::Twalk {
                fid,
                newfid,
                ref wnames,
            } => Fcall::Rwalk {
                wqids: self.session.walk(fid, newfid, wnames).await?,
            },
            Fcall::Topen { fid, mode } => {
                let (qid, iounit) = self.session.open(fid, mode).await?;
                Fcall::Ropen { qid, iounit }
            }
            Fcall::Tcreate {
                fid,
                ref name,
                perm,
                mode,
            } => {
                let (qid, iounit) = self.session.create(fid, name, perm, mode).await?;
                Fcall::Rcreate { qid, iounit }
            }
            Fcall::Tread { fid, offset, count } => Fcall::Rread {
                data: Data(self.session.read(fid, offset, count).await?),
            },
            Fcall::Twrite {
                fid,
                offset,
                ref data,
            } => Fcall::Rwrite {
                count: self.session.write(fid, offset, &data.0).await?,
            },
            Fcall::Tclunk { fid } => {
                self.session.clunk(fid).await?;
                Fcall::Rclunk
            }
            Fcall::Tremove { fid } => {
                self.session.remove(fid).await?;
                Fcall::Rremove
            }
            Fcall::Tstat { fid } => Fcall::Rstat {
                stat: self.session.stat(fid).await?,
            },
            Fcall::Twstat { fid, ref stat } => {
                self.session.wstat(fid, stat).await?;
                Fcall::Rwstat
            }
            _ => return Err(Error::rerror(estr::BOTCH)),
        };

        Ok(resp)
    }
}
