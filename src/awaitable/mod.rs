//! Awaitable state machines driving the engine over a non-blocking socket.
//!
//! Each public stream operation hands out one of four one-shot futures:
//! [`Handshake`], [`Recv`], [`Send`], and [`Shutdown`]. All four follow the
//! same shape: consult the engine, and depending on its verdict either
//! resolve, flush staged ciphertext to the socket, or read ciphertext from
//! the socket into the engine — then consult the engine again. The socket
//! work is expressed as raw-I/O sub-task turns shared by every future.
//!
//! Three invariants hold across all of them:
//!
//! 1. **Drain to `WouldBlock`.** The reactor's notifications are
//!    edge-triggered; a turn that stops short of `WouldBlock` can eat the
//!    edge and hang the connection. Every sub-task turn loops its syscall
//!    until the socket pushes back.
//! 2. **Single resolution.** A resolved future is fused; polling it again
//!    panics in debug and returns `Pending` in release rather than running
//!    I/O for a dead await.
//! 3. **Bounded staging.** Ciphertext is staged through a growable scratch
//!    buffer: at least one TLS record, at most 64 KiB per drain, capacity
//!    kept for the connection's lifetime.

mod handshake;
mod recv;
mod send;
mod shutdown;

pub use handshake::Handshake;
pub use recv::Recv;
pub use send::Send;
pub use shutdown::Shutdown;

use crate::buffer::{CipherBuf, MAX_CHUNK};
use crate::engine::TlsEngine;
use crate::error::{is_disconnect, is_not_ready};
use crate::reactor::IoController;
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::task::Context;
use tracing::trace;

/// Outcome of one raw-send sub-task turn.
#[derive(Debug)]
pub(crate) enum FlushOutcome {
    /// The staged chunk is fully on the wire.
    Flushed,
    /// The socket pushed back; a send waker is registered.
    Suspended,
    /// The peer is gone.
    Disconnected,
    /// A hard I/O failure.
    Failed(io::Error),
}

/// Pushes the staged ciphertext to the socket until it is gone or the socket
/// pushes back. One readiness turn of a raw-send sub-task.
pub(crate) fn flush_chunk(
    socket: &mut TcpStream,
    controller: &IoController,
    cx: &mut Context<'_>,
    chunk: &mut CipherBuf,
) -> FlushOutcome {
    while !chunk.is_empty() {
        match socket.write(chunk.unsent()) {
            Ok(0) => return FlushOutcome::Disconnected,
            Ok(n) => {
                trace!(len = n, "raw send");
                chunk.advance(n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_not_ready(e) => {
                controller.register_send_waker(cx.waker());
                return FlushOutcome::Suspended;
            }
            Err(ref e) if is_disconnect(e) => return FlushOutcome::Disconnected,
            Err(e) => return FlushOutcome::Failed(e),
        }
    }
    FlushOutcome::Flushed
}

/// Outcome of one raw-recv sub-task turn.
#[derive(Debug)]
pub(crate) enum FillOutcome {
    /// At least one chunk of ciphertext was fed to the engine.
    Fed,
    /// The socket reported end-of-stream before anything was read.
    Eof,
    /// The socket pushed back before anything was read; a recv waker is
    /// registered.
    Suspended,
    /// A hard I/O failure.
    Failed(io::Error),
}

/// Reads ciphertext from the socket into the engine until `WouldBlock`,
/// feeding every chunk. One readiness turn of a raw-recv sub-task.
///
/// When data and end-of-stream arrive on the same turn the data wins; the
/// next turn reports [`FillOutcome::Eof`].
pub(crate) fn fill_engine(
    socket: &mut TcpStream,
    controller: &IoController,
    cx: &mut Context<'_>,
    engine: &mut TlsEngine,
    scratch: &mut [u8],
) -> FillOutcome {
    let mut fed = false;
    let mut eof = false;
    loop {
        match socket.read(scratch) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => {
                trace!(len = n, "raw recv");
                engine.feed_cipher(&scratch[..n]);
                fed = true;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_not_ready(e) => break,
            Err(ref e) if is_disconnect(e) => {
                eof = true;
                break;
            }
            Err(e) => return FillOutcome::Failed(e),
        }
    }
    if fed {
        FillOutcome::Fed
    } else if eof {
        FillOutcome::Eof
    } else {
        controller.register_recv_waker(cx.waker());
        FillOutcome::Suspended
    }
}

/// Stages up to [`MAX_CHUNK`] bytes of the engine's pending outbound
/// ciphertext into the scratch buffer. Returns the staged byte count.
pub(crate) fn stage_pending_cipher(engine: &mut TlsEngine, chunk: &mut CipherBuf) -> usize {
    let want = engine.pending_cipher().min(MAX_CHUNK);
    if want == 0 {
        return 0;
    }
    chunk.refill(want, |buf| engine.extract_cipher(buf))
}

/// Builds an [`Error`](crate::error::Error) of the given kind carrying the
/// engine's sticky record-layer error, when one is recorded.
pub(crate) fn engine_error(engine: &TlsEngine, kind: crate::error::ErrorKind) -> crate::error::Error {
    match engine.last_error() {
        Some(err) => crate::error::Error::with_tls(kind, err.clone()),
        None => crate::error::Error::new(kind),
    }
}
