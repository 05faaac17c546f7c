//! # rustls-pump
//!
//! rustls-pump drives a synchronous TLS engine from an asynchronous,
//! non-blocking transport.  The engine reads and writes ciphertext
//! through a pair of in-memory buffers as if they were a blocking socket;
//! the transport fills and drains those buffers whenever its event loop
//! says so.  Neither side ever waits for the other.
//!
//! ```text
//!            feed_ciphertext()                 decrypt_to_plaintext()
//! transport ------------------> [ incoming ] ----> engine ----> application
//!            drain_ciphertext()                 encrypt_plaintext()
//! transport <------------------ [ outgoing ] <---- engine <---- application
//! ```
//!
//! The pieces are:
//!
//! - [`SegmentedBuffer`]: a growable FIFO of fixed-size chunks, readable and
//!   writable through `std::io` so that rustls' `read_tls`/`write_tls` can
//!   use it directly.
//! - [`HandshakeEngine`]: the contract a synchronous engine follows.
//!   [`RustlsEngine`] implements it with rustls.
//! - [`TlsAdapter`]: the state machine that owns both buffers and the
//!   engine, and pumps data through them in discrete steps.
//! - [`CertificateSelectionLatch`]: lets a server suspend its handshake
//!   while the embedder picks a certificate, possibly much later, and
//!   resume it exactly once with [`TlsAdapter::supply_decision`].
//!
//! ## Getting started
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # fn example(config: Arc<rustls::ServerConfig>) -> Result<(), rustls_pump::Error> {
//! use rustls_pump::{AdapterConfig, RustlsEngine, Status, TlsAdapter};
//!
//! let engine = RustlsEngine::server(config)?;
//! let mut tls = TlsAdapter::new(engine, &AdapterConfig::default());
//!
//! // whenever the socket is readable:
//! # let received = [0u8; 0];
//! tls.feed_ciphertext(&received);
//!
//! let mut plaintext = [0u8; 4096];
//! match tls.decrypt_to_plaintext(&mut plaintext)? {
//!     Status::Transferred(n) => println!("got {:?}", &plaintext[..n]),
//!     Status::PeerClosed => tls.close(),
//!     _ => {}
//! }
//!
//! // whenever the socket is writable:
//! let mut out = [0u8; 4096];
//! let n = tls.drain_ciphertext(&mut out);
//! # let _ = n;
//! # Ok(())
//! # }
//! ```
//!
//! ## Asynchronous certificate selection
//!
//! A server built with [`RustlsEngine::server_with_selection`] reads the
//! ClientHello and then reports [`Status::AwaitingCertificate`].  The
//! [`SelectionContext`] (server name, ALPN offers) is available from
//! [`TlsAdapter::selection_context`] and [`Observer::certificate_needed`].
//! Once a `ServerConfig` has been chosen, pass it to
//! [`TlsAdapter::supply_decision`] and carry on pumping.
//!
//! # Crate features
//!
//! - `logging`: this makes the crate depend on the `log` crate (and turns
//!   on rustls' own logging).  State transitions are logged at `debug!`,
//!   buffer traffic at `trace!`, and fatal errors at `warn!`.  This feature
//!   is in the default set.
//!
//! - `ring`: use rustls' *ring* cryptography provider.  This feature is in
//!   the default set.

// Require docs for public APIs, deny unsafe code, etc.
#![forbid(unsafe_code, unused_must_use)]
#![deny(
    clippy::clone_on_ref_ptr,
    clippy::use_self,
    trivial_casts,
    trivial_numeric_casts,
    missing_docs,
    unreachable_pub,
    unused_import_braces,
    unused_extern_crates
)]
#![warn(unused_qualifications)]
// Relax these clippy lints:
// - single_component_path_imports: our top-level `use log` import causes
//   a false positive, https://github.com/rust-lang/rust-clippy/issues/5210
// - new_without_default: for internal constructors, the indirection is not
//   helpful
#![allow(clippy::single_component_path_imports, clippy::new_without_default)]
// Enable documentation for all features on docs.rs
#![cfg_attr(docsrs, feature(doc_cfg))]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
mod log {
    macro_rules! trace    ( ($($tt:tt)*) => {{}} );
    macro_rules! debug    ( ($($tt:tt)*) => {{}} );
    macro_rules! _warn    ( ($($tt:tt)*) => {{}} );
    pub(crate) use {_warn as warn, debug, trace};
}

mod adapter;
mod buffer;
mod engine;
mod error;
mod hello;
mod latch;
mod observer;
mod rustls_engine;

// The public interface is:
pub use crate::adapter::{AdapterConfig, EofPolicy, State, Status, TlsAdapter};
pub use crate::buffer::{
    SegmentedBuffer, GROWTH_CHUNK_SIZE, INITIAL_CHUNK_SIZE, INITIAL_CLIENT_CHUNK_SIZE,
};
pub use crate::engine::{EngineContext, Endpoints, HandshakeEngine, Progress, ResumeFn, Role};
pub use crate::error::{Error, Misuse};
pub use crate::hello::{ClientHello, ClientHelloMode, MAX_CLIENT_HELLO_RECORD};
pub use crate::latch::{CertificateSelectionLatch, SelectionContext};
pub use crate::observer::Observer;
pub use crate::rustls_engine::RustlsEngine;
