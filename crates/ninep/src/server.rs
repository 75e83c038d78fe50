//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::error::estr;
use crate::fcall::*;
use crate::io_err;
use crate::session::Handler;
use crate::utils::{self, Result};

struct ActiveRequest {
    cancel: CancellationToken,
    /// Set once a flush has answered for this tag; the handler's own reply
    /// is then suppressed.
    responded: bool,
}

/// Serve one connection: negotiate, then read frames, dispatch to `handler`
/// and write tagged replies until the stream fails or closes.
///
/// Handlers run concurrently, one task per in-flight request. `Tflush` is
/// handled synchronously by the loop itself: the target request's context is
/// cancelled and its eventual reply suppressed. A request reusing an active
/// tag is answered with `Rerror("duplicate tag")` and not dispatched.
pub async fn serve_conn<S, H>(stream: S, handler: H) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler + 'static,
{
    serve_conn_msize(stream, handler, DEFAULT_MSIZE).await
}

/// [`serve_conn`] with an explicit msize ceiling for the negotiation.
pub async fn serve_conn_msize<S, H>(stream: S, handler: H, msize: u32) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: Handler + 'static,
{
    let channel = Arc::new(Channel::new(stream, msize));

    // Bounded by the channel's default deadline.
    let msize = channel.negotiate(P92000).await?;
    debug!("server: negotiated msize {}", msize);

    let handler = Arc::new(handler);
    let shutdown = CancellationToken::new();
    let (frames_tx, mut frames_rx) = mpsc::channel::<Result<Msg>>(1);
    let (done_tx, mut done_rx) = mpsc::channel::<(Tag, Option<Msg>)>(32);

    // Reader: pump frames, retrying deadline ticks; any other failure is
    // forwarded and ends the connection.
    {
        let channel = channel.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    res = channel.read_fcall() => match res {
                        Ok(msg) => {
                            if frames_tx.send(Ok(msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) if e.is_transient() => continue,
                        Err(e) => {
                            let _ = frames_tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    let mut active: HashMap<Tag, ActiveRequest> = HashMap::new();

    let served: Result<()> = async {
        loop {
            tokio::select! {
                frame = frames_rx.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let msg = frame?;

                    match msg.body {
                        Fcall::Tversion { .. } => {
                            // re-negotiation mid-session is not supported
                            let mut resp = Msg::new(msg.tag, Fcall::Rversion {
                                msize: channel.msize(),
                                version: VERSION_UNKNOWN.to_owned(),
                            });
                            channel.write_fcall(&mut resp).await?;
                        }

                        Fcall::Tflush { oldtag } => {
                            let body = match active.get_mut(&oldtag) {
                                Some(req) => {
                                    debug!("server: flushing tag {}", oldtag);
                                    req.cancel.cancel();
                                    req.responded = true;
                                    Fcall::Rflush
                                }
                                None => Fcall::Rerror {
                                    ename: estr::UNKNOWNTAG.to_owned(),
                                },
                            };
                            let mut resp = Msg::new(msg.tag, body);
                            channel.write_fcall(&mut resp).await?;
                        }

                        _ if active.contains_key(&msg.tag) => {
                            info!("server: duplicate tag {}", msg.tag);
                            let mut resp = Msg::new(msg.tag, Fcall::Rerror {
                                ename: estr::DUPTAG.to_owned(),
                            });
                            channel.write_fcall(&mut resp).await?;
                        }

                        _ => {
                            let cancel = CancellationToken::new();
                            active.insert(msg.tag, ActiveRequest {
                                cancel: cancel.clone(),
                                responded: false,
                            });

                            let handler = handler.clone();
                            let done_tx = done_tx.clone();
                            tokio::spawn(async move {
                                let tag = msg.tag;
                                let reply = tokio::select! {
                                    _ = cancel.cancelled() => None,
                                    res = handler.handle(&msg.body) => Some(match res {
                                        Ok(body) if MsgType::from(&body).is_r() => {
                                            Msg::new(tag, body)
                                        }
                                        Ok(body) => {
                                            error!(
                                                "server: handler returned {:?} for tag {}",
                                                MsgType::from(&body), tag
                                            );
                                            Msg::new(tag, Fcall::Rerror {
                                                ename: estr::BOTCH.to_owned(),
                                            })
                                        }
                                        Err(e) => Msg::new(tag, Fcall::Rerror {
                                            ename: e.to_string(),
                                        }),
                                    }),
                                };
                                let _ = done_tx.send((tag, reply)).await;
                            });
                        }
                    }
                }

                done = done_rx.recv() => {
                    let Some((tag, reply)) = done else { return Ok(()) };
                    let entry = active.remove(&tag);
                    if let (Some(entry), Some(mut reply)) = (entry, reply) {
                        if !entry.responded {
                            channel.write_fcall(&mut reply).await?;
                        }
                    }
                }
            }
        }
    }
    .await;

    shutdown.cancel();
    for (_, req) in active.drain() {
        req.cancel.cancel();
    }

    served
}

/// Serve sessions on `addr`, building a fresh handler per connection.
///
/// Supported addresses: `tcp!host!port` and `unix!path!suffix`.
pub async fn serve<H, F>(addr: &str, factory: F) -> Result<()>
where
    H: Handler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    let (proto, listen_addr, port) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => serve_tcp(factory, &format!("{}:{}", listen_addr, port)).await,
        "unix" => serve_unix(factory, listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

async fn serve_tcp<H, F>(factory: F, addr: &str) -> Result<()>
where
    H: Handler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let handler = factory();
        tokio::spawn(async move {
            if let Err(e) = serve_conn(stream, handler).await {
                error!("connection ended: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn serve_unix<H, F>(factory: F, addr: &str) -> Result<()>
where
    H: Handler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let handler = factory();
                tokio::spawn(async move {
                    if let Err(e) = serve_conn(stream, handler).await {
                        error!("connection ended: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{DuplexStream, duplex};
    use tokio::sync::Mutex;
    use tokio::time::sleep;

    use super::*;
    use crate::client::Client;
    use crate::error::Error;
    use crate::session::{Session, dispatch};

    const ROOT_QID: Qid = Qid {
        typ: QidType::DIR,
        version: 0,
        path: 1,
    };
    const HELLO_QID: Qid = Qid {
        typ: QidType::FILE,
        version: 0,
        path: 2,
    };
    const HELLO_DATA: &[u8] = b"hello, 9p world\n";

    /// A two-node in-memory tree: `/` and `/hello`.
    struct MockFs {
        fids: Mutex<HashMap<Fid, Qid>>,
    }

    impl MockFs {
        fn new() -> MockFs {
            MockFs {
                fids: Mutex::new(HashMap::new()),
            }
        }

        async fn lookup(&self, fid: Fid) -> Result<Qid> {
            self.fids
                .lock()
                .await
                .get(&fid)
                .copied()
                .ok_or_else(|| Error::rerror(estr::UNKNOWNFID))
        }
    }

    #[async_trait]
    impl Session for MockFs {
        async fn attach(&self, fid: Fid, _afid: Fid, _uname: &str, _aname: &str) -> Result<Qid> {
            let mut fids = self.fids.lock().await;
            if fids.contains_key(&fid) {
                return Err(Error::rerror(estr::DUPFID));
            }
            fids.insert(fid, ROOT_QID);
            Ok(ROOT_QID)
        }

        async fn walk(&self, fid: Fid, newfid: Fid, names: &[String]) -> Result<Vec<Qid>> {
            let from = self.lookup(fid).await?;
            let mut fids = self.fids.lock().await;
            if newfid != fid && fids.contains_key(&newfid) {
                return Err(Error::rerror(estr::DUPFID));
            }

            let mut qids = Vec::new();
            let mut at = from;
            for name in names {
                if at != ROOT_QID {
                    return Err(Error::rerror(estr::WALKNODIR));
                }
                match name.as_str() {
                    "hello" => at = HELLO_QID,
                    "." => {}
                    _ => {
                        if qids.is_empty() {
                            return Err(Error::rerror(estr::NOTFOUND));
                        }
                        // partial success: report the walked prefix, leave
                        // newfid unallocated
                        return Ok(qids);
                    }
                }
                qids.push(at);
            }

            fids.insert(newfid, at);
            Ok(qids)
        }

        async fn open(&self, fid: Fid, _mode: u8) -> Result<(Qid, u32)> {
            Ok((self.lookup(fid).await?, 0))
        }

        async fn create(&self, _fid: Fid, _name: &str, _perm: u32, _mode: u8) -> Result<(Qid, u32)> {
            Err(Error::rerror(estr::NOCREATE))
        }

        async fn read(&self, fid: Fid, offset: u64, count: u32) -> Result<Vec<u8>> {
            if self.lookup(fid).await? != HELLO_QID {
                return Err(Error::rerror(estr::ISDIR));
            }
            let start = (offset as usize).min(HELLO_DATA.len());
            let end = (start + count as usize).min(HELLO_DATA.len());
            Ok(HELLO_DATA[start..end].to_vec())
        }

        async fn write(&self, _fid: Fid, _offset: u64, _data: &[u8]) -> Result<u32> {
            Err(Error::rerror(estr::NOWRITE))
        }

        async fn clunk(&self, fid: Fid) -> Result<()> {
            self.fids.lock().await.remove(&fid);
            Ok(())
        }

        async fn remove(&self, fid: Fid) -> Result<()> {
            self.fids.lock().await.remove(&fid);
            Err(Error::rerror(estr::NOREMOVE))
        }

        async fn stat(&self, fid: Fid) -> Result<Dir> {
            let qid = self.lookup(fid).await?;
            Ok(Dir {
                qid,
                mode: if qid == ROOT_QID { dm::DIR | 0o755 } else { 0o644 },
                length: if qid == ROOT_QID { 0 } else { HELLO_DATA.len() as u64 },
                name: if qid == ROOT_QID { "/".to_owned() } else { "hello".to_owned() },
                uid: "none".to_owned(),
                gid: "none".to_owned(),
                muid: "none".to_owned(),
                ..Dir::default()
            })
        }

        async fn wstat(&self, _fid: Fid, _dir: &Dir) -> Result<()> {
            Err(Error::rerror(estr::NOWSTAT))
        }
    }

    fn spawn_server(handler: impl Handler + 'static) -> DuplexStream {
        let (a, b) = duplex(1 << 20);
        tokio::spawn(async move {
            let _ = serve_conn(b, handler).await;
        });
        a
    }

    #[tokio::test]
    async fn attach_walk_open_read_clunk() {
        let stream = spawn_server(dispatch(MockFs::new()));
        let client = Client::connect(stream).await.unwrap();

        let root = client.attach(0, NOFID, "anyone", "/").await.unwrap();
        assert_eq!(root, ROOT_QID);

        let qids = client.walk(0, 1, &["hello".to_owned()]).await.unwrap();
        assert_eq!(qids, vec![HELLO_QID]);

        let (qid, _iounit) = client.open(1, om::READ).await.unwrap();
        assert_eq!(qid, HELLO_QID);

        let data = client.read(1, 0, 8192).await.unwrap();
        assert_eq!(data, HELLO_DATA);

        // offset past EOF reads empty
        let eof = client.read(1, HELLO_DATA.len() as u64, 8192).await.unwrap();
        assert!(eof.is_empty());

        let stat = client.stat(1).await.unwrap();
        assert_eq!(stat.qid, HELLO_QID);
        assert_eq!(stat.length, HELLO_DATA.len() as u64);

        client.clunk(1).await.unwrap();

        // the fid is gone now
        let err = client.read(1, 0, 16).await.unwrap_err();
        assert_eq!(err.ename(), Some(estr::UNKNOWNFID));
    }

    #[tokio::test]
    async fn walk_with_unknown_name_fails_and_newfid_stays_free() {
        let stream = spawn_server(dispatch(MockFs::new()));
        let client = Client::connect(stream).await.unwrap();

        client.attach(0, NOFID, "anyone", "/").await.unwrap();
        let err = client
            .walk(0, 7, &["missing".to_owned()])
            .await
            .unwrap_err();
        assert_eq!(err.ename(), Some(estr::NOTFOUND));

        // the failed walk must not have allocated fid 7
        let qids = client.walk(0, 7, &["hello".to_owned()]).await.unwrap();
        assert_eq!(qids, vec![HELLO_QID]);
    }

    #[tokio::test]
    async fn walk_limit_is_enforced_client_side() {
        let stream = spawn_server(dispatch(MockFs::new()));
        let client = Client::connect(stream).await.unwrap();
        client.attach(0, NOFID, "anyone", "/").await.unwrap();

        let names = vec!["x".to_owned(); MAXWELEM + 1];
        assert!(client.walk(0, 1, &names).await.is_err());
    }

    /// A handler that stalls until cancelled or a long delay passes.
    struct SlowHandler;

    #[async_trait]
    impl Handler for SlowHandler {
        async fn handle(&self, req: &Fcall) -> Result<Fcall> {
            match req {
                Fcall::Tstat { .. } => {
                    sleep(Duration::from_millis(250)).await;
                    Ok(Fcall::Rstat {
                        stat: Dir::default(),
                    })
                }
                _ => Err(Error::rerror(estr::BOTCH)),
            }
        }
    }

    async fn raw_client(stream: DuplexStream) -> Channel<DuplexStream> {
        let channel = Channel::new(stream, 8192);
        let (_msize, version) = channel.version(8192, P92000).await.unwrap();
        assert_eq!(version, P92000);
        channel
    }

    async fn read_reply(channel: &Channel<DuplexStream>) -> Msg {
        loop {
            match channel.read_fcall().await {
                Ok(msg) => return msg,
                Err(e) if e.is_transient() => continue,
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn duplicate_tag_yields_one_rerror() {
        let stream = spawn_server(SlowHandler);
        let channel = raw_client(stream).await;

        let mut first = Msg::new(5, Fcall::Tstat { fid: 1 });
        let mut second = Msg::new(5, Fcall::Tstat { fid: 1 });
        channel.write_fcall(&mut first).await.unwrap();
        channel.write_fcall(&mut second).await.unwrap();

        // the duplicate is refused immediately, before the slow handler
        // finishes
        let refused = read_reply(&channel).await;
        assert_eq!(refused.tag, 5);
        match refused.body {
            Fcall::Rerror { ename } => assert_eq!(ename, estr::DUPTAG),
            other => panic!("expected Rerror, got {:?}", other),
        }

        let settled = read_reply(&channel).await;
        assert_eq!(settled.tag, 5);
        assert!(matches!(settled.body, Fcall::Rstat { .. }));
    }

    #[tokio::test]
    async fn flush_suppresses_the_original_reply() {
        let stream = spawn_server(SlowHandler);
        let channel = raw_client(stream).await;

        let mut req = Msg::new(1, Fcall::Tstat { fid: 1 });
        channel.write_fcall(&mut req).await.unwrap();

        let mut flush = Msg::new(2, Fcall::Tflush { oldtag: 1 });
        channel.write_fcall(&mut flush).await.unwrap();

        let resp = read_reply(&channel).await;
        assert_eq!(resp.tag, 2);
        assert!(matches!(resp.body, Fcall::Rflush));

        // the flushed request's reply never surfaces
        sleep(Duration::from_millis(400)).await;
        assert!(matches!(
            channel.read_fcall().await.unwrap_err(),
            crate::error::Error::Timeout
        ));
    }

    #[tokio::test]
    async fn flush_of_unknown_tag_is_an_error() {
        let stream = spawn_server(SlowHandler);
        let channel = raw_client(stream).await;

        let mut flush = Msg::new(3, Fcall::Tflush { oldtag: 99 });
        channel.write_fcall(&mut flush).await.unwrap();

        let resp = read_reply(&channel).await;
        assert_eq!(resp.tag, 3);
        match resp.body {
            Fcall::Rerror { ename } => assert_eq!(ename, estr::UNKNOWNTAG),
            other => panic!("expected Rerror, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn handler_errors_become_rerror() {
        let stream = spawn_server(SlowHandler);
        let channel = raw_client(stream).await;

        let mut req = Msg::new(4, Fcall::Tclunk { fid: 9 });
        channel.write_fcall(&mut req).await.unwrap();

        let resp = read_reply(&channel).await;
        assert_eq!(resp.tag, 4);
        match resp.body {
            Fcall::Rerror { ename } => assert_eq!(ename, estr::BOTCH),
            other => panic!("expected Rerror, got {:?}", other),
        }
    }
}
