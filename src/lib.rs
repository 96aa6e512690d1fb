//! An asynchronous TLS stream layer built on [mio](https://docs.rs/mio) and
//! [rustls](https://docs.rs/rustls).
//!
//! - **Awaitable per-connection state machines:** `connect → handshake →
//!   send/recv → shutdown → close`, each step a one-shot future that
//!   suspends until the socket is ready and the TLS record layer can make
//!   progress
//! - **In-memory record engine:** the TLS library never touches a socket;
//!   ciphertext flows through per-connection byte queues, which keeps
//!   partial records, interleaved handshake traffic, and read/write
//!   dependencies manageable under edge-triggered readiness
//! - **Shared contexts:** configure certificates, verification policy,
//!   ALPN, cipher suites, and session caching once, then derive any number
//!   of connections
//! - **Cooperative single-threaded scheduling:** a bundled [`Driver`] fuses
//!   a `futures` LocalPool with the readiness reactor; run one driver per
//!   thread
//!
//! # Quick Start
//!
//! ## Echo server
//!
//! ```no_run
//! use std::sync::Arc;
//! use tlscomm::{Driver, FileFormat, TlsContext, TlsListener, TlsMethod};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = TlsContext::new(TlsMethod::TlsServer);
//!     ctx.load_certificate("server.crt", FileFormat::Pem)?;
//!     ctx.load_private_key("server.key", FileFormat::Pem)?;
//!     let ctx = Arc::new(ctx);
//!
//!     let mut driver = Driver::new()?;
//!     let reactor = driver.reactor();
//!     driver.block_on(async move {
//!         let mut listener = TlsListener::bind(&reactor, ctx, "0.0.0.0:8443".parse()?)?;
//!         loop {
//!             let (mut stream, peer) = listener.accept().await?;
//!             println!("connection from {peer}");
//!             stream.handshake().await?;
//!
//!             let mut buf = vec![0u8; 16 * 1024];
//!             loop {
//!                 let n = stream.recv(&mut buf).await?;
//!                 if n == 0 {
//!                     break;
//!                 }
//!                 stream.send(&buf[..n]).await?;
//!             }
//!             stream.shutdown().await?;
//!             stream.close()?;
//!         }
//!         # #[allow(unreachable_code)]
//!         # Ok::<(), Box<dyn std::error::Error>>(())
//!     })
//! }
//! ```
//!
//! ## Client
//!
//! ```no_run
//! use std::sync::Arc;
//! use tlscomm::{Driver, TlsContext, TlsMethod, TlsStream, VerifyMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ctx = TlsContext::new(TlsMethod::TlsClient);
//!     ctx.set_verify_mode(VerifyMode::Peer, None);
//!     ctx.use_default_ca()?;
//!     let ctx = Arc::new(ctx);
//!
//!     let mut driver = Driver::new()?;
//!     let reactor = driver.reactor();
//!     driver.block_on(async move {
//!         let mut stream = TlsStream::new(&reactor, ctx);
//!         stream.set_hostname("example.com")?;
//!         stream.connect("93.184.215.14:443".parse()?).await?;
//!         stream.handshake().await?;
//!         println!("negotiated {}", stream.protocol_version().unwrap_or("?"));
//!
//!         stream.send(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n").await?;
//!         let mut buf = vec![0u8; 16 * 1024];
//!         let n = stream.recv(&mut buf).await?;
//!         println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!         stream.shutdown().await?;
//!         stream.close()?;
//!         Ok(())
//!     })
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Type | Responsibility |
//! |-------|------|----------------|
//! | Configuration | [`TlsContext`] | certificates, verification policy, ALPN, versions, session cache; shared read-only |
//! | Record engine | [`TlsEngine`] | per-connection record layer with in-memory ciphertext queues |
//! | Stream | [`TlsStream`] / [`TlsListener`] | socket + engine + reactor registration; hands out awaitables |
//! | Awaitables | [`Handshake`], [`Recv`], [`Send`], [`Shutdown`] | state machines driving the engine from readiness callbacks |
//! | Runtime | [`Reactor`], [`Driver`] | readiness notification, timers, task scheduling |
//!
//! The engine decouples the record layer from the socket: ciphertext read
//! off the wire is pushed into the engine's inbound queue, ciphertext the
//! record layer produces accumulates in the outbound queue, and every
//! plaintext-level operation reports whether it needs the socket to become
//! readable or writable before it can continue. The awaitables translate
//! those verdicts into raw-I/O turns, each of which loops its syscall until
//! `WouldBlock` — under edge-triggered notification, stopping early can eat
//! the only edge the reactor will ever deliver.
//!
//! # Threading
//!
//! Everything here is cooperatively scheduled and single-threaded: a
//! [`Reactor`], its streams, and their awaitables must stay on one thread.
//! [`TlsContext`] is `Send + Sync`; derive connections for as many
//! reactor threads as you like from one shared context.

pub mod awaitable;
pub(crate) mod buffer;
pub mod context;
pub mod engine;
pub mod error;
pub mod reactor;
pub mod stream;

pub use awaitable::{Handshake, Recv, Send, Shutdown};
pub use context::{
    FileFormat, SessionCacheMode, TlsContext, TlsMethod, TlsSession, TlsVersion, VerifyCallback,
    VerifyContext, VerifyMode,
};
pub use engine::{HandshakeState, Role, TlsEngine, TlsIoResult};
pub use error::{Error, ErrorKind};
pub use reactor::{timeout, Driver, IoController, Reactor, Sleep, Timeout};
pub use stream::{Accept, Connect, TlsListener, TlsStream};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::context::{FileFormat, TlsContext, TlsMethod, VerifyMode};
    pub use crate::error::{Error, ErrorKind};
    pub use crate::reactor::{Driver, Reactor};
    pub use crate::stream::{TlsListener, TlsStream};
}
