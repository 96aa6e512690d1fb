//! The graceful-shutdown awaitable.
//!
//! Structured like the handshake future, but close is best-effort: every
//! terminal error collapses to `Ok(())` so callers never need defensive
//! retries at teardown. Only the transient want-read/want-write states gate
//! further I/O turns. The caller is expected to `close()` afterwards.

use super::{fill_engine, flush_chunk, stage_pending_cipher, FillOutcome, FlushOutcome};
use crate::buffer::{CipherBuf, MIN_CHUNK};
use crate::engine::TlsIoResult;
use crate::error::Error;
use crate::stream::TlsStream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Drive,
    Flush { then_fill: bool },
    Fill,
}

/// One-shot future driving the TLS close handshake.
///
/// Created by [`TlsStream::shutdown`].
pub struct Shutdown<'a> {
    stream: &'a mut TlsStream,
    phase: Phase,
    chunk: CipherBuf,
    scratch: Vec<u8>,
    skip: bool,
    done: bool,
}

impl<'a> Shutdown<'a> {
    pub(crate) fn new(stream: &'a mut TlsStream) -> Self {
        // Shutting down a stream whose engine never came up is a no-op.
        let skip = stream.ensure_engine().is_err();
        Self {
            stream,
            phase: Phase::Drive,
            chunk: CipherBuf::new(),
            scratch: vec![0u8; MIN_CHUNK],
            skip,
            done: false,
        }
    }

    fn resolve(&mut self) -> Poll<Result<(), Error>> {
        self.done = true;
        self.stream.controller_clear_wakers();
        Poll::Ready(Ok(()))
    }
}

impl Future for Shutdown<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "shutdown polled after resolution");
        if this.done {
            return Poll::Pending;
        }
        if this.skip {
            return this.resolve();
        }

        loop {
            match this.phase {
                Phase::Drive => {
                    let (_, _, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(_) => return this.resolve(),
                    };
                    match engine.shutdown() {
                        TlsIoResult::Success => return this.resolve(),
                        TlsIoResult::WantWrite => {
                            if stage_pending_cipher(engine, &mut this.chunk) == 0 {
                                return this.resolve();
                            }
                            this.phase = Phase::Flush { then_fill: false };
                        }
                        TlsIoResult::WantRead => {
                            if stage_pending_cipher(engine, &mut this.chunk) > 0 {
                                this.phase = Phase::Flush { then_fill: true };
                            } else {
                                this.phase = Phase::Fill;
                            }
                        }
                        TlsIoResult::ZeroReturn
                        | TlsIoResult::Error
                        | TlsIoResult::Syscall => {
                            debug!("collapsing shutdown error to success");
                            return this.resolve();
                        }
                    }
                }
                Phase::Flush { then_fill } => {
                    let (socket, controller, _) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(_) => return this.resolve(),
                    };
                    match flush_chunk(socket, controller, cx, &mut this.chunk) {
                        FlushOutcome::Flushed => {
                            this.phase = if then_fill { Phase::Fill } else { Phase::Drive };
                        }
                        FlushOutcome::Suspended => return Poll::Pending,
                        FlushOutcome::Disconnected | FlushOutcome::Failed(_) => {
                            return this.resolve();
                        }
                    }
                }
                Phase::Fill => {
                    let (socket, controller, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(_) => return this.resolve(),
                    };
                    match fill_engine(socket, controller, cx, engine, &mut this.scratch) {
                        FillOutcome::Fed => this.phase = Phase::Drive,
                        FillOutcome::Eof => return this.resolve(),
                        FillOutcome::Suspended => return Poll::Pending,
                        FillOutcome::Failed(_) => return this.resolve(),
                    }
                }
            }
        }
    }
}
