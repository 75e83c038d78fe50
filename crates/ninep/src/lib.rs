#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client and server library for Rust.
//!
//! This crate provides a tokio-based implementation of the base 9P2000
//! protocol: the wire codec, the framed message channel with its version
//! handshake, a multiplexing client transport, and a per-connection server
//! loop that dispatches to a user-supplied backend.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed
//! operating system. A server exports a hierarchical namespace of files over
//! any reliable byte stream; a client navigates it with client-chosen
//! handles (fids) and correlates concurrent requests with 16-bit tags.
//!
//! Data flows `stream <-> Channel <-> Codec <-> (Client | serve_conn)
//! <-> Session`.
//!
//! # Serving
//!
//! Implement [`session::Session`] for your resource tree, wrap it with
//! [`session::dispatch`] and hand connections to [`server::serve_conn`], or
//! let [`server::serve`] listen for you:
//!
//! ```no_run
//! use ninep::{Result, server, session};
//! # use ninep::session::Session;
//! # #[derive(Clone)]
//! # struct MyFs;
//! # #[async_trait::async_trait]
//! # impl Session for MyFs {
//! #     async fn attach(&self, _: u32, _: u32, _: &str, _: &str) -> Result<ninep::Qid> { todo!() }
//! #     async fn walk(&self, _: u32, _: u32, _: &[String]) -> Result<Vec<ninep::Qid>> { todo!() }
//! #     async fn open(&self, _: u32, _: u8) -> Result<(ninep::Qid, u32)> { todo!() }
//! #     async fn create(&self, _: u32, _: &str, _: u32, _: u8) -> Result<(ninep::Qid, u32)> { todo!() }
//! #     async fn read(&self, _: u32, _: u64, _: u32) -> Result<Vec<u8>> { todo!() }
//! #     async fn write(&self, _: u32, _: u64, _: &[u8]) -> Result<u32> { todo!() }
//! #     async fn clunk(&self, _: u32) -> Result<()> { todo!() }
//! #     async fn remove(&self, _: u32) -> Result<()> { todo!() }
//! #     async fn stat(&self, _: u32) -> Result<ninep::Dir> { todo!() }
//! #     async fn wstat(&self, _: u32, _: &ninep::Dir) -> Result<()> { todo!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     server::serve("tcp!127.0.0.1!564", || session::dispatch(MyFs)).await
//! }
//! ```
//!
//! # Calling
//!
//! [`client::Client`] negotiates the version on a fresh stream and then
//! implements [`session::Session`] by multiplexing tagged requests over it.
//! Calls may run concurrently; a call abandoned mid-flight (for example via
//! `tokio::time::timeout`) flushes its tag on the wire.
//!
//! # Message size
//!
//! Both sides negotiate an msize, the largest fcall either will send. The
//! codec rewrites outgoing `Tread`/`Twrite` messages to honor it and refuses
//! anything else that cannot fit; oversized inbound frames are drained so
//! the stream stays aligned. See [`codec::Codec::marshal`].
pub mod channel;
pub mod client;
pub mod codec;
pub mod error;
pub mod fcall;
pub mod server;
pub mod session;
pub mod tags;
#[macro_use]
pub mod utils;

pub use crate::client::Client;
pub use crate::error::Error;
pub use crate::error::estr;
pub use crate::fcall::*;
pub use crate::session::{Handler, Session, dispatch};
pub use crate::utils::Result;
