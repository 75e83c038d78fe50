//! Serialize/deserialize 9P messages into/from binary.
//!
//! Wire form of one message: `size[4] type[1] tag[2] body[size-7]`, all
//! integers little-endian. [`Codec::marshal`] produces the whole frame
//! including the size header and applies the msize rewriting rules; see the
//! crate documentation for the overflow policy.

use std::io::{Cursor, Read};
use std::mem;
use std::ops::{Shl, Shr};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use crate::error::Error;
use crate::fcall::*;
use crate::io_err;

type IoResult<T> = ::std::io::Result<T>;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> IoResult<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> IoResult<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> IoResult<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
///
/// `size` must predict exactly what `encode` will produce, without
/// allocating.
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize>;

    /// Exact encoded length in bytes
    fn size(&self) -> u32;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
    fn size(&self) -> u32 {
        mem::size_of::<Self>() as u32
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
    fn size(&self) -> u32 {
        (mem::size_of::<u16>() + self.len()) as u32
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
    fn size(&self) -> u32 {
        Qid::WIRE_SIZE
    }
}

impl Encodable for Dir {
    /// A stat record is self-described on the wire: a two-byte count of the
    /// bytes that follow, then the fields.
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        match Encoder::new(w)
            << &Dir::size(self)
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
    fn size(&self) -> u32 {
        mem::size_of::<u16>() as u32 + Dir::size(self) as u32
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
    fn size(&self) -> u32 {
        (mem::size_of::<u32>() + self.0.len()) as u32
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
    fn size(&self) -> u32 {
        self.iter()
            .fold(mem::size_of::<u16>() as u32, |acc, s| acc + s.size())
    }
}

impl Encodable for Fcall {
    /// Encode the message body only; the envelope header is written by
    /// `Encodable for Msg`.
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        use crate::Fcall::*;

        let buf = SResult(Ok(Encoder::new(w)));
        let buf = match *self {
            Tversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Rversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            Rwalk { ref wqids } => buf << wqids,
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            Rcreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            // The stat payload carries a redundant outer length in addition
            // to the record's own size prefix; see stat(5).
            Rstat { ref stat } => buf << &(stat.size() + 2) << stat,
            Twstat { ref fid, ref stat } => buf << fid << &(stat.size() + 2) << stat,
            Rwstat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }

    fn size(&self) -> u32 {
        use crate::Fcall::*;

        match *self {
            Tversion {
                ref msize,
                ref version,
            } => msize.size() + version.size(),
            Rversion {
                ref msize,
                ref version,
            } => msize.size() + version.size(),
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => afid.size() + uname.size() + aname.size(),
            Rauth { ref aqid } => aqid.size(),
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => fid.size() + afid.size() + uname.size() + aname.size(),
            Rattach { ref qid } => qid.size(),
            Rerror { ref ename } => ename.size(),
            Tflush { ref oldtag } => oldtag.size(),
            Rflush => 0,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => fid.size() + newfid.size() + wnames.size(),
            Rwalk { ref wqids } => wqids.size(),
            Topen { ref fid, ref mode } => fid.size() + mode.size(),
            Ropen {
                ref qid,
                ref iounit,
            } => qid.size() + iounit.size(),
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => fid.size() + name.size() + perm.size() + mode.size(),
            Rcreate {
                ref qid,
                ref iounit,
            } => qid.size() + iounit.size(),
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => fid.size() + offset.size() + count.size(),
            Rread { ref data } => data.size(),
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => fid.size() + offset.size() + data.size(),
            Rwrite { ref count } => count.size(),
            Tclunk { ref fid } => fid.size(),
            Rclunk => 0,
            Tremove { ref fid } => fid.size(),
            Rremove => 0,
            Tstat { ref fid } => fid.size(),
            Rstat { ref stat } => mem::size_of::<u16>() as u32 + Encodable::size(stat),
            Twstat { ref fid, ref stat } => {
                fid.size() + mem::size_of::<u16>() as u32 + Encodable::size(stat)
            }
            Rwstat => 0,
        }
    }
}

impl Encodable for Msg {
    /// Encode the full wire frame: `size[4] type[1] tag[2] body`.
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> IoResult<usize> {
        let typ = MsgType::from(&self.body);
        match Encoder::new(w) << &Encodable::size(self) << &(typ as u8) << &self.tag << &self.body {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }

    fn size(&self) -> u32 {
        FRAME_HDRSZ + self.body.size()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        Ok(Qid {
            typ: QidType::from_bits_retain(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Dir {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        // The record's own size prefix; the fields are self-describing, so
        // the value is not needed to drive the parse.
        let _size: u16 = Decodable::decode(r)?;
        Ok(Dir {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> IoResult<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Decode a message body whose type byte has already been consumed.
fn decode_body<R: ReadBytesExt>(typ: MsgType, mut buf: R) -> IoResult<Fcall> {
    use crate::MsgType::*;

    let body = match typ {
        Tversion => Fcall::Tversion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Rversion => Fcall::Rversion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Tauth => Fcall::Tauth {
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        Rauth => Fcall::Rauth { aqid: decode!(buf) },
        Tattach => Fcall::Tattach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        Rattach => Fcall::Rattach { qid: decode!(buf) },
        Rerror => Fcall::Rerror {
            ename: decode!(buf),
        },
        Tflush => Fcall::Tflush {
            oldtag: decode!(buf),
        },
        Rflush => Fcall::Rflush,
        Twalk => Fcall::Twalk {
            fid: decode!(buf),
            newfid: decode!(buf),
            wnames: decode!(buf),
        },
        Rwalk => Fcall::Rwalk {
            wqids: decode!(buf),
        },
        Topen => Fcall::Topen {
            fid: decode!(buf),
            mode: decode!(buf),
        },
        Ropen => Fcall::Ropen {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Tcreate => Fcall::Tcreate {
            fid: decode!(buf),
            name: decode!(buf),
            perm: decode!(buf),
            mode: decode!(buf),
        },
        Rcreate => Fcall::Rcreate {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Tread => Fcall::Tread {
            fid: decode!(buf),
            offset: decode!(buf),
            count: decode!(buf),
        },
        Rread => Fcall::Rread { data: decode!(buf) },
        Twrite => Fcall::Twrite {
            fid: decode!(buf),
            offset: decode!(buf),
            data: decode!(buf),
        },
        Rwrite => Fcall::Rwrite {
            count: decode!(buf),
        },
        Tclunk => Fcall::Tclunk { fid: decode!(buf) },
        Rclunk => Fcall::Rclunk,
        Tremove => Fcall::Tremove { fid: decode!(buf) },
        Rremove => Fcall::Rremove,
        Tstat => Fcall::Tstat { fid: decode!(buf) },
        Rstat => {
            let _nstat: u16 = decode!(buf);
            Fcall::Rstat { stat: decode!(buf) }
        }
        Twstat => {
            let fid = decode!(buf);
            let _nstat: u16 = decode!(buf);
            Fcall::Twstat {
                fid,
                stat: decode!(buf),
            }
        }
        Rwstat => Fcall::Rwstat,
        Terror => return Err(io_err!(InvalidData, "Terror is never valid on the wire")),
    };

    Ok(body)
}

/// Frame header overhead: size[4] type[1] tag[2]
pub const FRAME_HDRSZ: u32 = 7;

/// Deterministic marshal/unmarshal of framed fcalls, with the msize
/// rewriting rules applied on the way out.
#[derive(Clone, Copy, Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Codec {
        Codec
    }

    /// Exact encoded length of the fcall including the four-byte size
    /// header. Does not allocate.
    pub fn size(&self, msg: &Msg) -> u32 {
        Encodable::size(msg)
    }

    /// Marshal one fcall into `buf`, whose length is the negotiated msize.
    ///
    /// Messages are rewritten in place where the protocol allows it:
    /// a `Tread` count is lowered so the eventual `Rread` reply fits, and a
    /// `Twrite` payload is truncated to the largest length that fits, with
    /// the number of bytes dropped reported in [`Marshaled::overflow`]. Any
    /// other message larger than msize fails with [`Error::Overflow`].
    pub fn marshal(&self, buf: &mut [u8], msg: &mut Msg) -> Result<Marshaled, Error> {
        let msize = buf.len() as u32;
        let mut dropped = 0u32;

        // The reply must fit too: count <= msize - (4 + 1 + 2 + 4).
        if let Fcall::Tread { ref mut count, .. } = msg.body {
            let limit = msize.saturating_sub(RREADHDRSZ);
            if *count > limit {
                *count = limit;
            }
        }

        let mut size = Encodable::size(&*msg);
        if size > msize {
            if let Fcall::Twrite { ref mut data, .. } = msg.body {
                let excess = (size - msize) as usize;
                if data.0.len() < excess {
                    return Err(Error::Overflow { size, msize });
                }
                let keep = data.0.len() - excess;
                data.0.truncate(keep);
                dropped = excess as u32;
                size = msize;
            } else {
                return Err(Error::Overflow { size, msize });
            }
        }

        let mut cursor = Cursor::new(&mut buf[..size as usize]);
        let n = msg.encode(&mut cursor)?;

        Ok(Marshaled {
            bytes: n,
            overflow: dropped,
        })
    }

    /// Parse one framed fcall from `buf`, which must hold exactly one frame
    /// including its size header.
    pub fn unmarshal(&self, buf: &[u8]) -> Result<Msg, Error> {
        if buf.len() < FRAME_HDRSZ as usize {
            return Err(Error::Framing(format!("short frame: {} bytes", buf.len())));
        }

        let mut cursor = Cursor::new(buf);
        let size = cursor.read_u32::<LittleEndian>().map_err(framing)?;
        if size as usize != buf.len() {
            return Err(Error::Framing(format!(
                "size header {} does not match frame of {} bytes",
                size,
                buf.len()
            )));
        }

        let typ_byte = cursor.read_u8().map_err(framing)?;
        let typ = MsgType::from_u8(typ_byte)
            .ok_or_else(|| Error::Framing(format!("unknown message type: {}", typ_byte)))?;
        let tag = cursor.read_u16::<LittleEndian>().map_err(framing)?;

        let body = decode_body(typ, &mut cursor).map_err(framing)?;

        if cursor.position() != buf.len() as u64 {
            return Err(Error::Framing(format!(
                "{} trailing bytes after {:?} body",
                buf.len() as u64 - cursor.position(),
                typ
            )));
        }

        Ok(Msg { tag, body })
    }
}

fn framing(e: ::std::io::Error) -> Error {
    Error::Framing(e.to_string())
}

/// Outcome of a marshal: bytes produced and, for `Twrite`, payload bytes
/// dropped to honor msize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Marshaled {
    pub bytes: usize,
    pub overflow: u32,
}

/// Helper to append one stat record to a directory-read payload.
pub fn encode_dir<W: WriteBytesExt>(w: &mut W, d: &Dir) -> IoResult<usize> {
    d.encode(w)
}

/// Helper to read one stat record off a directory-read payload.
pub fn decode_dir<R: ReadBytesExt>(r: &mut R) -> IoResult<Dir> {
    Decodable::decode(r)
}
