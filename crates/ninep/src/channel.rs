//! Bidirectional protocol framing for 9P over a reliable byte stream.
//!
//! A [`Channel`] does no protocol processing except to send and receive
//! message frames and to run the `Tversion`/`Rversion` exchange that brackets
//! a session. Reads and writes may be carried out concurrently, supporting
//! separate read and write loops, but neither operation may be invoked
//! concurrently with itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::BytesMut;
use log::debug;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::codec::{Codec, FRAME_HDRSZ};
use crate::error::Error;
use crate::fcall::*;
use crate::utils::Result;

/// Default read/write deadline applied when the caller does not supply one.
pub const DEFAULT_RW_TIMEOUT: Duration = Duration::from_secs(1);

struct ReadSide<S> {
    rd: BufReader<io::ReadHalf<S>>,
    buf: BytesMut,
}

struct WriteSide<S> {
    wr: BufWriter<io::WriteHalf<S>>,
    buf: BytesMut,
}

/// Message channel over one byte stream.
///
/// The channel owns its stream and a pair of scratch buffers sized to the
/// negotiated msize. The read and write paths take separate locks, so a
/// reader task and a writer task can share one channel without contention.
pub struct Channel<S> {
    rd: Mutex<ReadSide<S>>,
    wr: Mutex<WriteSide<S>>,
    codec: Codec,
    msize: AtomicU32,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Wrap a stream, with scratch buffers and buffered I/O sized to
    /// `msize`.
    pub fn new(stream: S, msize: u32) -> Channel<S> {
        let msize = msize.max(MIN_MSIZE);
        let (r, w) = io::split(stream);

        // msize may not be the optimal buffer size for the underlying
        // buffered reader and writer, but it is never too small.
        Channel {
            rd: Mutex::new(ReadSide {
                rd: BufReader::with_capacity(msize as usize, r),
                buf: scratch(msize),
            }),
            wr: Mutex::new(WriteSide {
                wr: BufWriter::with_capacity(msize as usize, w),
                buf: scratch(msize),
            }),
            codec: Codec::new(),
            msize: AtomicU32::new(msize),
        }
    }

    /// The current maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    /// Resize the scratch buffers for use with a new msize.
    ///
    /// Must not be called while a read or write is in progress; both locks
    /// are taken to enforce that. The underlying buffered reader and writer
    /// keep their original capacity.
    pub async fn set_msize(&self, msize: u32) {
        let msize = msize.max(MIN_MSIZE);
        let mut rd = self.rd.lock().await;
        let mut wr = self.wr.lock().await;

        self.msize.store(msize, Ordering::Relaxed);
        rd.buf.resize(msize as usize, 0);
        wr.buf.resize(msize as usize, 0);
    }

    /// Read the next message from the channel, applying the default
    /// deadline.
    pub async fn read_fcall(&self) -> Result<Msg> {
        self.read_fcall_deadline(DEFAULT_RW_TIMEOUT).await
    }

    /// Read the next message, blocking at most `deadline`.
    pub async fn read_fcall_deadline(&self, deadline: Duration) -> Result<Msg> {
        let mut side = self.rd.lock().await;
        match timeout(deadline, self.read_locked(&mut side)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn read_locked(&self, side: &mut ReadSide<S>) -> Result<Msg> {
        let ReadSide { rd, buf } = side;

        let size = rd.read_u32_le().await?;
        if size < FRAME_HDRSZ {
            return Err(Error::Framing(format!("frame size {} below minimum", size)));
        }

        let cap = buf.len();
        if size as usize > cap {
            // The frame is larger than the negotiated msize. Read what fits
            // and drain the remainder so the stream stays frame aligned,
            // then report the excess.
            rd.read_exact(&mut buf[4..cap]).await?;

            let mut remaining = size as usize - cap;
            let mut sink = [0u8; 1024];
            while remaining > 0 {
                let chunk = remaining.min(sink.len());
                let n = rd.read(&mut sink[..chunk]).await?;
                if n == 0 {
                    return Err(Error::Framing(
                        "connection closed inside an oversized frame".to_owned(),
                    ));
                }
                remaining -= n;
            }

            return Err(Error::Overflow {
                size,
                msize: cap as u32,
            });
        }

        LittleEndian::write_u32(&mut buf[..4], size);
        rd.read_exact(&mut buf[4..size as usize]).await?;

        let msg = self.codec.unmarshal(&buf[..size as usize])?;
        debug!("channel: recv {:?}", msg);
        Ok(msg)
    }

    /// Marshal and send one message, applying the default deadline.
    ///
    /// The msize rewriting rules are applied: a too-large `Tread` count is
    /// lowered and a too-large `Twrite` payload is truncated, both in place
    /// on `msg`; any other oversized message fails with `Error::Overflow`.
    pub async fn write_fcall(&self, msg: &mut Msg) -> Result<()> {
        self.write_fcall_deadline(msg, DEFAULT_RW_TIMEOUT).await
    }

    /// Marshal and send one message, blocking at most `deadline`.
    pub async fn write_fcall_deadline(&self, msg: &mut Msg, deadline: Duration) -> Result<()> {
        let mut side = self.wr.lock().await;
        match timeout(deadline, self.write_locked(&mut side, msg)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn write_locked(&self, side: &mut WriteSide<S>, msg: &mut Msg) -> Result<()> {
        let WriteSide { wr, buf } = side;

        let m = self.codec.marshal(&mut buf[..], msg)?;
        if m.overflow > 0 {
            debug!(
                "channel: send truncated write payload by {} bytes to honor msize",
                m.overflow
            );
        }
        debug!("channel: send {:?}", msg);

        wr.write_all(&buf[..m.bytes]).await?;
        wr.flush().await?;
        Ok(())
    }

    /// Client side of the handshake: send `Tversion`, return the server's
    /// msize and version.
    ///
    /// The caller decides what to do with the response, typically adopting
    /// the msize via [`Channel::set_msize`] and treating a
    /// [`VERSION_UNKNOWN`] reply as terminal.
    pub async fn version(&self, msize: u32, version: &str) -> Result<(u32, String)> {
        let mut req = Msg::new(
            NOTAG,
            Fcall::Tversion {
                msize,
                version: version.to_owned(),
            },
        );
        self.write_fcall(&mut req).await?;

        let resp = self.read_fcall().await?;
        match resp.body {
            Fcall::Rversion { msize, version } => Ok((msize, version)),
            _ => Err(Error::Framing(format!(
                "invalid response for version message: {:?}",
                resp
            ))),
        }
    }

    /// Server side of the handshake: block until a version message arrives
    /// (bounded by the default deadline), reply, and adopt the negotiated
    /// msize. A version mismatch is answered with [`VERSION_UNKNOWN`] and
    /// then reported as an error; the caller must treat it as terminal.
    pub async fn negotiate(&self, version: &str) -> Result<u32> {
        let req = self.read_fcall().await?;

        let (client_msize, client_version) = match req.body {
            Fcall::Tversion { msize, version } => (msize, version),
            _ => {
                return Err(Error::Framing(format!(
                    "expected version message, got {:?}",
                    req
                )));
            }
        };

        let msize = self.msize().min(client_msize).max(MIN_MSIZE);
        let agreed = client_version == version;

        let mut resp = Msg::new(
            req.tag,
            Fcall::Rversion {
                msize,
                version: if agreed {
                    version.to_owned()
                } else {
                    VERSION_UNKNOWN.to_owned()
                },
            },
        );
        self.write_fcall(&mut resp).await?;

        if !agreed {
            return Err(Error::Framing(format!(
                "unsupported version: {}",
                client_version
            )));
        }

        if msize < self.msize() {
            self.set_msize(msize).await;
        }

        Ok(msize)
    }
}

fn scratch(msize: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(msize as usize);
    buf.resize(msize as usize, 0);
    buf
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;

    fn pair(client_msize: u32, server_msize: u32) -> (Channel<DuplexStream>, Channel<DuplexStream>) {
        let (a, b) = duplex(1 << 20);
        (Channel::new(a, client_msize), Channel::new(b, server_msize))
    }

    #[tokio::test]
    async fn truncated_twrite_frame_is_exactly_msize() {
        const MSIZE: u32 = 500;
        let (ch, peer) = pair(MSIZE, MSIZE);

        let mut msg = Msg::new(
            1,
            Fcall::Twrite {
                fid: 1,
                offset: 0,
                data: Data(vec![0x61; 2 * MSIZE as usize]),
            },
        );
        ch.write_fcall(&mut msg).await.unwrap();
        drop(ch);

        // Inspect the raw bytes on the other end of the pipe.
        let mut raw = Vec::new();
        let mut rd = peer.rd.into_inner().rd;
        rd.read_to_end(&mut raw).await.unwrap();

        assert_eq!(raw.len(), MSIZE as usize);
        assert_eq!(
            u32::from_le_bytes(raw[..4].try_into().unwrap()),
            MSIZE,
            "size header must equal msize after truncation"
        );
    }

    #[tokio::test]
    async fn concatenated_frames_read_back_as_two() {
        let (ch, peer) = pair(1024, 1024);

        let mut first = Msg::new(
            7,
            Fcall::Twalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["bin".to_owned()],
            },
        );
        let mut second = Msg::new(
            8,
            Fcall::Rread {
                data: Data(b"contents".to_vec()),
            },
        );

        ch.write_fcall(&mut first).await.unwrap();
        ch.write_fcall(&mut second).await.unwrap();

        assert_eq!(peer.read_fcall().await.unwrap(), first);
        assert_eq!(peer.read_fcall().await.unwrap(), second);
    }

    #[tokio::test]
    async fn oversized_inbound_frame_is_drained() {
        // The writer believes in a large msize; the reader negotiated a
        // small one.
        let (ch, peer) = pair(4096, 100);

        let mut big = Msg::new(
            1,
            Fcall::Rread {
                data: Data(vec![0x42; 189]),
            },
        );
        let sent = Codec::new().size(&big);
        ch.write_fcall(&mut big).await.unwrap();

        let err = peer.read_fcall().await.unwrap_err();
        assert_eq!(err.overflow(), Some(sent - 100));

        // The stream is still frame aligned: the next message parses.
        let mut small = Msg::new(2, Fcall::Rclunk);
        ch.write_fcall(&mut small).await.unwrap();
        assert_eq!(peer.read_fcall().await.unwrap(), small);
    }

    #[tokio::test]
    async fn undersized_frame_is_a_framing_error() {
        let (ch, peer) = pair(1024, 1024);

        {
            let mut wr = ch.wr.lock().await;
            wr.wr.write_all(&3u32.to_le_bytes()).await.unwrap();
            wr.wr.flush().await.unwrap();
        }

        assert!(matches!(
            peer.read_fcall().await.unwrap_err(),
            Error::Framing(_)
        ));
    }

    #[tokio::test]
    async fn handshake_negotiates_minimum_msize() {
        let (client, server) = pair(8192, 4096);

        let negotiation = tokio::spawn(async move {
            let msize = server.negotiate(P92000).await.unwrap();
            (msize, server)
        });

        let (msize, version) = client.version(8192, P92000).await.unwrap();
        assert_eq!(msize, 4096);
        assert_eq!(version, P92000);
        client.set_msize(msize).await;

        let (server_msize, server) = negotiation.await.unwrap();
        assert_eq!(server_msize, 4096);
        assert_eq!(server.msize(), 4096);
    }

    #[tokio::test]
    async fn handshake_version_mismatch_is_terminal() {
        let (client, server) = pair(1024, 1024);

        let negotiation = tokio::spawn(async move { server.negotiate(P92000).await });

        let (_, version) = client.version(1024, "9P1999").await.unwrap();
        assert_eq!(version, VERSION_UNKNOWN);
        assert!(negotiation.await.unwrap().is_err());
    }
}
