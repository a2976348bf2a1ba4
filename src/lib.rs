//! Ssrwire is a ShadowsocksR (SSR) client transport: it turns a reliable,
//! ordered stream to an SSR relay into an encrypted, obfuscated tunnel to an
//! arbitrary destination.
//!
//! ## Quick Start
//!
//! Ssrwire provides two interfaces: [`Tunnel`] and [`SsrStream`].
//!
//! * [`Tunnel`]
//!
//!   The `Tunnel` is a deterministic state machine implementation of one SSR
//!   connection, following the sans-I/O principle. It does not include any
//!   network I/O code or spawn internal threads, focusing solely on the
//!   three transformation layers.
//!
//!   When using `Tunnel`, it needs to be bound to a reliable, ordered stream
//!   that implements the [`Read`] and [`Write`] traits (e.g., [`TcpStream`]).
//!
//! * [`SsrStream`]
//!
//!   For convenient use in asynchronous scenarios, Ssrwire provides a
//!   ready-to-use asynchronous stream implementation based on tokio. It
//!   requires the underlying transport to implement the [`AsyncRead`] and
//!   [`AsyncWrite`] traits and the `tokio-stream-impl` feature to be enabled.
//!   The same feature provides [`dial`], which connects to a relay and sends
//!   the destination, and the [`pipe`] and [`relay`] copy loops.
//!
//! ## Layers
//!
//! Every SSR connection stacks three layers, always in this order:
//!
//! ```text
//!   caller  <->  protocol  <->  stream cipher  <->  obfs  <->  socket
//! ```
//!
//! 1. Protocol, named by the relay's `protocol`. It frames and authenticates
//!    the plaintext, see [`protocol`].
//!
//! 2. Stream cipher, named by the relay's `method` and keyed from its
//!    password. The send IV precedes the first encrypted byte; the receive
//!    IV is taken from the first bytes the relay sends.
//!
//! 3. Obfs, named by the relay's `obfs`. It disguises the wire bytes, for
//!    example as HTTP or TLS, see [`obfs`].
//!
//! The first plaintext of every connection is the SOCKS5 address record of
//! the destination, see [`SocksAddr`].
//!
//! ## Configuration
//!
//! A relay is described by a [`ServerDescriptor`], parsed from an `ssr://`
//! link with [`link::parse`] or built with [`ServerDescriptor::builder_with_address`].
//! Wrap it in a [`Backend`] to share plugin state between connections to
//! the same relay. For details, refer to the [`config`] module.
//!
//! [`Read`]: std::io::Read
//! [`Write`]: std::io::Write
//! [`TcpStream`]: std::net::TcpStream
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
//! [`dial`]: fn@dial
//! [`pipe`]: fn@pipe
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod leaky_buf;
pub mod link;
pub mod obfs;
pub mod plugin;
pub mod protocol;

mod crypto;
mod socks;
mod specification;
mod tunnel;

#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod dial;
#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod pipe;
#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod tokio_stream_impl;

pub use config::{Backend, PipeConfig, ServerDescriptor};
pub use crypto::Method;
pub use error::Error;
pub use leaky_buf::LeakyBuf;
pub use socks::SocksAddr;
pub use tunnel::{Reader, Tunnel, Writer};

#[cfg(feature = "tokio-stream-impl")]
pub use dial::dial;
#[cfg(feature = "tokio-stream-impl")]
pub use pipe::{pipe, relay};
#[cfg(feature = "tokio-stream-impl")]
pub use tokio_stream_impl::SsrStream;
