//! Client side: a tagged round-trip transport and the session built on it.
//!
//! The transport multiplexes many logical calls over one channel. One task
//! reads frames off the wire; one task owns the tag map and serializes
//! writes. A call blocks on its waiter slot until the matching tagged reply
//! arrives; dropping the pending call (for example via
//! `tokio::time::timeout`) emits a `Tflush` for its tag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::error::{Error, estr};
use crate::fcall::*;
use crate::session::Session;
use crate::tags::TagPool;
use crate::utils::Result;

struct Request {
    msg: Msg,
    reply: oneshot::Sender<Result<Msg>>,
}

enum Control {
    /// A caller abandoned its pending send; flush the tag.
    Cancel(Tag),
    /// The flush exchange for this tag has run its course.
    Flushed(Tag),
}

struct Waiter {
    reply: Option<oneshot::Sender<Result<Msg>>>,
    flushing: bool,
}

/// Cloneable handle to the multiplexer task.
#[derive(Clone)]
struct Handle {
    requests: mpsc::UnboundedSender<Request>,
    control: mpsc::UnboundedSender<Control>,
    tags: Arc<TagPool>,
    shutdown: CancellationToken,
}

impl Handle {
    /// Perform one tagged round trip. `Rerror` replies surface as errors.
    async fn send(&self, body: Fcall) -> Result<Fcall> {
        if let Fcall::Tversion { .. } = body {
            // version is negotiated directly on the channel under NOTAG,
            // never through the transport
            return Err(Error::rerror(estr::BOTCH));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let tag = self.tags.get().await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .requests
            .send(Request {
                msg: Msg::new(tag, body),
                reply: reply_tx,
            })
            .is_err()
        {
            self.tags.put(tag);
            return Err(Error::Closed);
        }

        let mut guard = FlushGuard {
            tag,
            control: self.control.clone(),
            armed: true,
        };

        let res = reply_rx.await;
        guard.armed = false;

        match res {
            Ok(Ok(msg)) => match msg.body {
                Fcall::Rerror { ename } => Err(Error::Rerror(ename)),
                body => Ok(body),
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Closed),
        }
    }
}

/// Fires when a pending send is dropped before its reply arrives.
struct FlushGuard {
    tag: Tag,
    control: mpsc::UnboundedSender<Control>,
    armed: bool,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.control.send(Control::Cancel(self.tag));
        }
    }
}

/// Spawn the reader and multiplexer tasks for `channel`.
fn start_transport<S>(channel: Channel<S>, tags: TagPool) -> Handle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let channel = Arc::new(channel);
    let tags = Arc::new(tags);
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<Request>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();
    let (responses_tx, mut responses_rx) = mpsc::channel::<Msg>(1);
    let shutdown = CancellationToken::new();

    let handle = Handle {
        requests: requests_tx,
        control: control_tx,
        tags: tags.clone(),
        shutdown: shutdown.clone(),
    };

    // Reader: pump frames off the wire, retrying deadline ticks.
    {
        let channel = channel.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    res = channel.read_fcall() => match res {
                        Ok(msg) => {
                            if responses_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        Err(e) if e.is_transient() => continue,
                        Err(e) => {
                            error!("transport: read error: {}", e);
                            shutdown.cancel();
                            return;
                        }
                    }
                }
            }
        });
    }

    // Multiplexer: sole owner of the tag map.
    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut outstanding: HashMap<Tag, Waiter> = HashMap::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,

                    req = requests_rx.recv() => {
                        let Some(mut req) = req else { break };
                        let tag = req.msg.tag;
                        if req.reply.is_closed() {
                            // the caller gave up before the message hit the
                            // wire; nothing to flush
                            tags.put(tag);
                            continue;
                        }
                        match channel.write_fcall(&mut req.msg).await {
                            Ok(()) => {
                                outstanding.insert(tag, Waiter {
                                    reply: Some(req.reply),
                                    flushing: false,
                                });
                            }
                            Err(e) => {
                                let _ = req.reply.send(Err(e));
                                tags.put(tag);
                            }
                        }
                    }

                    resp = responses_rx.recv() => {
                        let Some(msg) = resp else { break };
                        let tag = msg.tag;
                        match outstanding.remove(&tag) {
                            Some(w) => {
                                if let Some(tx) = w.reply {
                                    let _ = tx.send(Ok(msg));
                                }
                                tags.put(tag);
                            }
                            None => {
                                // a reply we never asked for poisons the
                                // whole connection
                                error!("transport: response for unknown tag {}", tag);
                                break;
                            }
                        }
                    }

                    ctl = control_rx.recv() => {
                        match ctl {
                            None => break,
                            Some(Control::Cancel(tag)) => {
                                if let Some(w) = outstanding.get_mut(&tag) {
                                    if !w.flushing {
                                        w.flushing = true;
                                        w.reply = None;
                                        let h = handle.clone();
                                        tokio::spawn(async move {
                                            debug!("transport: flushing tag {}", tag);
                                            if let Err(e) = h.send(Fcall::Tflush { oldtag: tag }).await {
                                                debug!("transport: flush of tag {} failed: {}", tag, e);
                                            }
                                            let _ = h.control.send(Control::Flushed(tag));
                                        });
                                    }
                                }
                            }
                            Some(Control::Flushed(tag)) => {
                                // release unless the original reply already
                                // did
                                if outstanding.remove(&tag).is_some() {
                                    tags.put(tag);
                                }
                            }
                        }
                    }
                }
            }

            shutdown.cancel();
            for (_, w) in outstanding.drain() {
                if let Some(tx) = w.reply {
                    let _ = tx.send(Err(Error::Closed));
                }
            }
            tags.close();
        });
    }

    handle
}

/// A 9P2000 client session over one connection.
///
/// Created with [`Client::connect`], which runs the version handshake and
/// then multiplexes all calls over the stream. Dropping the client shuts the
/// transport down and fails any in-flight calls.
pub struct Client {
    handle: Handle,
    msize: u32,
    version: String,
}

impl Client {
    /// Negotiate with default msize and version, then start the transport.
    pub async fn connect<S>(stream: S) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Client::connect_with(stream, DEFAULT_MSIZE, P92000).await
    }

    /// Negotiate `version` with an offered `msize`, then start the
    /// transport. The negotiated msize is the minimum of both sides'.
    pub async fn connect_with<S>(stream: S, msize: u32, version: &str) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Channel::new(stream, msize);

        let (server_msize, server_version) = channel.version(channel.msize(), version).await?;
        if server_version == VERSION_UNKNOWN || server_version != version {
            return Err(Error::rerror(format!(
                "server does not speak {}: offered {:?}",
                version, server_version
            )));
        }
        if server_msize < MIN_MSIZE {
            return Err(Error::rerror(format!(
                "server msize {} below minimum {}",
                server_msize, MIN_MSIZE
            )));
        }

        let msize = channel.msize().min(server_msize);
        channel.set_msize(msize).await;

        let handle = start_transport(channel, TagPool::default());

        Ok(Client {
            handle,
            msize,
            version: server_version,
        })
    }

    /// The negotiated msize and version.
    pub fn version(&self) -> (u32, &str) {
        (self.msize, &self.version)
    }

    async fn send(&self, body: Fcall) -> Result<Fcall> {
        self.handle.send(body).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.shutdown.cancel();
    }
}

fn unexpected(op: &str, resp: &Fcall) -> Error {
    Error::rerror(format!(
        "unexpected {:?} response for {}",
        MsgType::from(resp),
        op
    ))
}

#[async_trait]
impl Session for Client {
    async fn auth(&self, afid: Fid, uname: &str, aname: &str) -> Result<Qid> {
        let resp = self
            .send(Fcall::Tauth {
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?;

        match resp {
            Fcall::Rauth { aqid } => Ok(aqid),
            resp => Err(unexpected("auth", &resp)),
        }
    }

    async fn attach(&self, fid: Fid, afid: Fid, uname: &str, aname: &str) -> Result<Qid> {
        let resp = self
            .send(Fcall::Tattach {
                fid,
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?;

        match resp {
            Fcall::Rattach { qid } => Ok(qid),
            resp => Err(unexpected("attach", &resp)),
        }
    }

    async fn walk(&self, fid: Fid, newfid: Fid, names: &[String]) -> Result<Vec<Qid>> {
        if names.len() > MAXWELEM {
            // callers must decompose long paths into chained walks, each
            // producing a fresh intermediate fid
            return Err(Error::rerror(format!(
                "walk of {} names exceeds the {}-element limit",
                names.len(),
                MAXWELEM
            )));
        }

        let resp = self
            .send(Fcall::Twalk {
                fid,
                newfid,
                wnames: names.to_vec(),
            })
            .await?;

        match resp {
            Fcall::Rwalk { wqids } => Ok(wqids),
            resp => Err(unexpected("walk", &resp)),
        }
    }

    async fn open(&self, fid: Fid, mode: u8) -> Result<(Qid, u32)> {
        match self.send(Fcall::Topen { fid, mode }).await? {
            Fcall::Ropen { qid, iounit } => Ok((qid, iounit)),
            resp => Err(unexpected("open", &resp)),
        }
    }

    async fn create(&self, fid: Fid, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        let resp = self
            .send(Fcall::Tcreate {
                fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?;

        match resp {
            Fcall::Rcreate { qid, iounit } => Ok((qid, iounit)),
            resp => Err(unexpected("create", &resp)),
        }
    }

    async fn read(&self, fid: Fid, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.send(Fcall::Tread { fid, offset, count }).await? {
            Fcall::Rread { data } => Ok(data.0),
            resp => Err(unexpected("read", &resp)),
        }
    }

    async fn write(&self, fid: Fid, offset: u64, data: &[u8]) -> Result<u32> {
        let resp = self
            .send(Fcall::Twrite {
                fid,
                offset,
                data: Data(data.to_vec()),
            })
            .await?;

        match resp {
            Fcall::Rwrite { count } => Ok(count),
            resp => Err(unexpected("write", &resp)),
        }
    }

    async fn clunk(&self, fid: Fid) -> Result<()> {
        match self.send(Fcall::Tclunk { fid }).await? {
            Fcall::Rclunk => Ok(()),
            resp => Err(unexpected("clunk", &resp)),
        }
    }

    async fn remove(&self, fid: Fid) -> Result<()> {
        match self.send(Fcall::Tremove { fid }).await? {
            Fcall::Rremove => Ok(()),
            resp => Err(unexpected("remove", &resp)),
        }
    }

    async fn stat(&self, fid: Fid) -> Result<Dir> {
        match self.send(Fcall::Tstat { fid }).await? {
            Fcall::Rstat { stat } => Ok(stat),
            resp => Err(unexpected("stat", &resp)),
        }
    }

    async fn wstat(&self, fid: Fid, dir: &Dir) -> Result<()> {
        let resp = self
            .send(Fcall::Twstat {
                fid,
                stat: dir.clone(),
            })
            .await?;

        match resp {
            Fcall::Rwstat => Ok(()),
            resp => Err(unexpected("wstat", &resp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};
    use tokio::time::{sleep, timeout};

    use super::*;

    /// Transport over an in-memory pipe, returning the peer channel for
    /// scripting the server side by hand.
    fn harness(outstanding: u32) -> (Handle, Arc<Channel<DuplexStream>>) {
        let (a, b) = duplex(1 << 20);
        let handle = start_transport(Channel::new(a, 8192), TagPool::new(outstanding));
        (handle, Arc::new(Channel::new(b, 8192)))
    }

    async fn read_request(peer: &Channel<DuplexStream>) -> Msg {
        loop {
            match peer.read_fcall().await {
                Ok(msg) => return msg,
                Err(e) if e.is_transient() => continue,
                Err(e) => panic!("peer read failed: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn concurrent_sends_use_distinct_tags() {
        const N: usize = 32;
        let (handle, peer) = harness(0xFFFE);

        let server = tokio::spawn(async move {
            let mut tags = Vec::new();
            for _ in 0..N {
                let req = read_request(&peer).await;
                assert!(matches!(req.body, Fcall::Tstat { .. }));
                tags.push(req.tag);
            }
            // reply only after all requests arrived, so all are in flight
            // at once
            for tag in &tags {
                let mut resp = Msg::new(*tag, Fcall::Rwstat);
                peer.write_fcall(&mut resp).await.unwrap();
            }
            tags
        });

        let mut calls = Vec::new();
        for _ in 0..N {
            let h = handle.clone();
            calls.push(tokio::spawn(
                async move { h.send(Fcall::Tstat { fid: 1 }).await },
            ));
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        let tags = server.await.unwrap();
        let unique: HashSet<_> = tags.iter().collect();
        assert_eq!(unique.len(), N, "tags must be pairwise distinct");
    }

    #[tokio::test]
    async fn rerror_surfaces_as_error() {
        let (handle, peer) = harness(0xFFFE);

        tokio::spawn(async move {
            let req = read_request(&peer).await;
            let mut resp = Msg::new(
                req.tag,
                Fcall::Rerror {
                    ename: estr::NOTFOUND.to_owned(),
                },
            );
            peer.write_fcall(&mut resp).await.unwrap();
        });

        let err = handle.send(Fcall::Tstat { fid: 1 }).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::NOTFOUND));
    }

    #[tokio::test]
    async fn tversion_is_rejected_from_the_send_path() {
        let (handle, _peer) = harness(0xFFFE);
        let err = handle
            .send(Fcall::Tversion {
                msize: 1024,
                version: P92000.to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.ename(), Some(estr::BOTCH));
    }

    #[tokio::test]
    async fn cancelled_send_emits_tflush_and_releases_the_tag() {
        let (handle, peer) = harness(2);

        // never answered; the caller gives up
        let h = handle.clone();
        let cancelled = timeout(Duration::from_millis(50), async move {
            h.send(Fcall::Tstat { fid: 1 }).await
        })
        .await;
        assert!(cancelled.is_err(), "send should still be pending");

        let original = read_request(&peer).await;
        assert!(matches!(original.body, Fcall::Tstat { .. }));

        let flush = read_request(&peer).await;
        let flush_tag = flush.tag;
        match flush.body {
            Fcall::Tflush { oldtag } => assert_eq!(oldtag, original.tag),
            other => panic!("expected Tflush, got {:?}", other),
        }
        assert_ne!(flush_tag, original.tag);

        let mut resp = Msg::new(flush_tag, Fcall::Rflush);
        peer.write_fcall(&mut resp).await.unwrap();

        // both tags drain back into a pool of two, so further traffic works
        sleep(Duration::from_millis(50)).await;
        let probe = tokio::spawn({
            let handle = handle.clone();
            async move { handle.send(Fcall::Tclunk { fid: 1 }).await }
        });

        let req = read_request(&peer).await;
        assert!(matches!(req.body, Fcall::Tclunk { .. }));
        assert!(
            req.tag == original.tag || req.tag == flush_tag,
            "tag {} was not reclaimed",
            req.tag
        );
        let mut resp = Msg::new(req.tag, Fcall::Rclunk);
        peer.write_fcall(&mut resp).await.unwrap();
        probe.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn original_reply_after_flush_is_dropped_quietly() {
        let (handle, peer) = harness(2);

        let h = handle.clone();
        let _ = timeout(Duration::from_millis(50), async move {
            h.send(Fcall::Tstat { fid: 1 }).await
        })
        .await;

        let original = read_request(&peer).await;
        let flush = read_request(&peer).await;
        assert!(matches!(flush.body, Fcall::Tflush { .. }));

        // the server races the flush and answers the original first
        let mut late = Msg::new(
            original.tag,
            Fcall::Rstat {
                stat: Dir::default(),
            },
        );
        peer.write_fcall(&mut late).await.unwrap();
        let mut resp = Msg::new(flush.tag, Fcall::Rflush);
        peer.write_fcall(&mut resp).await.unwrap();

        // the transport survives and keeps serving
        tokio::spawn(async move {
            let req = read_request(&peer).await;
            let mut resp = Msg::new(req.tag, Fcall::Rclunk);
            peer.write_fcall(&mut resp).await.unwrap();
        });
        handle.send(Fcall::Tclunk { fid: 1 }).await.unwrap();
    }
}
