//! The application-read awaitable.
//!
//! The hardest of the four state machines: a read may have to toggle between
//! pulling ciphertext off the socket and flushing ciphertext the engine
//! queued while decoding (a read that cannot progress until a write
//! flushes). Partial plaintext always wins ties: once any bytes have been
//! decoded into the caller's buffer, pending write obligations and even
//! record-layer errors are deferred to the next call.

use super::{engine_error, fill_engine, flush_chunk, stage_pending_cipher, FillOutcome, FlushOutcome};
use crate::buffer::{CipherBuf, MIN_CHUNK};
use crate::engine::{TlsEngine, TlsIoResult};
use crate::error::{Error, ErrorKind};
use crate::stream::TlsStream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

// Verdict of one plaintext-draining pass over the engine.
enum Drain {
    Completed(Result<usize, Error>),
    NeedRecv,
    NeedSend,
}

// Decodes as much plaintext as the engine can produce into `buf`,
// accumulating into `*filled`, until the buffer is full, more ciphertext is
// needed, a write obligation blocks progress, or a terminal condition
// occurs.
fn drain_plaintext(engine: &mut TlsEngine, buf: &mut [u8], filled: &mut usize) -> Drain {
    loop {
        if *filled == buf.len() {
            return Drain::Completed(Ok(*filled));
        }
        let (result, n) = engine.read(&mut buf[*filled..]);
        match result {
            TlsIoResult::Success => *filled += n,
            TlsIoResult::WantRead => {
                return if *filled > 0 {
                    Drain::Completed(Ok(*filled))
                } else {
                    Drain::NeedRecv
                };
            }
            TlsIoResult::WantWrite => {
                // With bytes in hand, resolve now; the next recv observes
                // the write dependency.
                return if *filled > 0 {
                    Drain::Completed(Ok(*filled))
                } else {
                    Drain::NeedSend
                };
            }
            TlsIoResult::ZeroReturn => return Drain::Completed(Ok(*filled)),
            TlsIoResult::Error | TlsIoResult::Syscall => {
                return if *filled > 0 {
                    Drain::Completed(Ok(*filled))
                } else {
                    Drain::Completed(Err(engine_error(engine, ErrorKind::ReadFailed)))
                };
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Drain,
    Fill,
    Flush,
}

/// One-shot future decoding plaintext into the caller's buffer.
///
/// Created by [`TlsStream::recv`]. Resolves with the number of plaintext
/// bytes produced; `Ok(0)` marks the peer's end-of-stream (and every
/// subsequent `recv` resolves `Ok(0)` again). A zero-length buffer resolves
/// `Ok(0)` immediately without touching the socket.
pub struct Recv<'a> {
    stream: &'a mut TlsStream,
    buf: &'a mut [u8],
    filled: usize,
    phase: Phase,
    chunk: CipherBuf,
    scratch: Vec<u8>,
    early: Option<Error>,
    done: bool,
}

impl<'a> Recv<'a> {
    pub(crate) fn new(stream: &'a mut TlsStream, buf: &'a mut [u8]) -> Self {
        let early = stream.ensure_engine().err();
        Self {
            stream,
            buf,
            filled: 0,
            phase: Phase::Drain,
            chunk: CipherBuf::new(),
            scratch: vec![0u8; MIN_CHUNK],
            early,
            done: false,
        }
    }

    fn resolve(&mut self, result: Result<usize, Error>) -> Poll<Result<usize, Error>> {
        self.done = true;
        self.stream.controller_clear_wakers();
        Poll::Ready(result)
    }
}

impl Future for Recv<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "recv polled after resolution");
        if this.done {
            return Poll::Pending;
        }
        if let Some(err) = this.early.take() {
            return this.resolve(Err(err));
        }
        if this.buf.is_empty() {
            return this.resolve(Ok(0));
        }

        loop {
            match this.phase {
                Phase::Drain => {
                    let (_, _, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match drain_plaintext(engine, this.buf, &mut this.filled) {
                        Drain::Completed(result) => return this.resolve(result),
                        Drain::NeedRecv => this.phase = Phase::Fill,
                        Drain::NeedSend => {
                            stage_pending_cipher(engine, &mut this.chunk);
                            this.phase = Phase::Flush;
                        }
                    }
                }
                Phase::Fill => {
                    let (socket, controller, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match fill_engine(socket, controller, cx, engine, &mut this.scratch) {
                        FillOutcome::Fed => this.phase = Phase::Drain,
                        // Raw end-of-stream maps to the empty payload; the
                        // partial count, if any, is handed over as-is.
                        FillOutcome::Eof => {
                            let filled = this.filled;
                            return this.resolve(Ok(filled));
                        }
                        FillOutcome::Suspended => return Poll::Pending,
                        FillOutcome::Failed(err) => {
                            return this.resolve(Err(Error::with_io(ErrorKind::ReadFailed, err)));
                        }
                    }
                }
                Phase::Flush => {
                    let (socket, controller, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    if this.chunk.is_empty() && stage_pending_cipher(engine, &mut this.chunk) == 0 {
                        // Outbound queue drained; decoding can continue.
                        this.phase = Phase::Drain;
                        continue;
                    }
                    match flush_chunk(socket, controller, cx, &mut this.chunk) {
                        FlushOutcome::Flushed => {}
                        FlushOutcome::Suspended => return Poll::Pending,
                        FlushOutcome::Disconnected => {
                            let filled = this.filled;
                            return this.resolve(Ok(filled));
                        }
                        FlushOutcome::Failed(err) => {
                            return this.resolve(Err(Error::with_io(ErrorKind::ReadFailed, err)));
                        }
                    }
                }
            }
        }
    }
}
