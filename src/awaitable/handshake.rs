//! The handshake awaitable.

use super::{engine_error, fill_engine, flush_chunk, stage_pending_cipher, FillOutcome, FlushOutcome};
use crate::buffer::{CipherBuf, MIN_CHUNK};
use crate::engine::TlsIoResult;
use crate::error::{Error, ErrorKind};
use crate::stream::TlsStream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

// What to do once the staged ciphertext is on the wire.
#[derive(Debug, Clone, Copy)]
enum AfterFlush {
    // Consult the engine again.
    Drive,
    // The flush was preparatory; read the peer's response without
    // re-entering the engine first.
    Fill,
    // The handshake already succeeded; this was the trailing output.
    Resolve,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Drive,
    Flush(AfterFlush),
    Fill,
}

/// One-shot future driving the TLS handshake to completion.
///
/// Created by [`TlsStream::handshake`]. The first poll consults the engine
/// synchronously, so a handshake whose bytes are already queued resolves
/// without suspending.
pub struct Handshake<'a> {
    stream: &'a mut TlsStream,
    phase: Phase,
    chunk: CipherBuf,
    scratch: Vec<u8>,
    early: Option<Error>,
    done: bool,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(stream: &'a mut TlsStream) -> Self {
        let early = stream.ensure_engine().err();
        Self {
            stream,
            phase: Phase::Drive,
            chunk: CipherBuf::new(),
            scratch: vec![0u8; MIN_CHUNK],
            early,
            done: false,
        }
    }

    fn resolve<T>(&mut self, result: Result<T, Error>) -> Poll<Result<T, Error>> {
        self.done = true;
        self.stream.controller_clear_wakers();
        Poll::Ready(result)
    }
}

impl Future for Handshake<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "handshake polled after resolution");
        if this.done {
            return Poll::Pending;
        }
        if let Some(err) = this.early.take() {
            return this.resolve(Err(err));
        }

        loop {
            match this.phase {
                Phase::Drive => {
                    let (_, _, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match engine.do_handshake() {
                        TlsIoResult::Success => {
                            if engine.pending_cipher() == 0 {
                                return this.resolve(Ok(()));
                            }
                            // TLS 1.3 servers finish with output still queued
                            // (tickets, Finished); flush it before resolving.
                            stage_pending_cipher(engine, &mut this.chunk);
                            this.phase = Phase::Flush(AfterFlush::Resolve);
                        }
                        TlsIoResult::WantWrite => {
                            if stage_pending_cipher(engine, &mut this.chunk) == 0 {
                                return this
                                    .resolve(Err(Error::new(ErrorKind::HandshakeFailed)));
                            }
                            this.phase = Phase::Flush(AfterFlush::Drive);
                        }
                        TlsIoResult::WantRead => {
                            if stage_pending_cipher(engine, &mut this.chunk) > 0 {
                                this.phase = Phase::Flush(AfterFlush::Fill);
                            } else {
                                this.phase = Phase::Fill;
                            }
                        }
                        TlsIoResult::ZeroReturn => {
                            return this.resolve(Err(Error::new(ErrorKind::PeerClosed)));
                        }
                        TlsIoResult::Error | TlsIoResult::Syscall => {
                            let err = engine_error(engine, ErrorKind::HandshakeFailed);
                            debug!(%err, "handshake failed");
                            return this.resolve(Err(err));
                        }
                    }
                }
                Phase::Flush(then) => {
                    let (socket, controller, _) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match flush_chunk(socket, controller, cx, &mut this.chunk) {
                        FlushOutcome::Flushed => match then {
                            AfterFlush::Drive => this.phase = Phase::Drive,
                            AfterFlush::Fill => this.phase = Phase::Fill,
                            AfterFlush::Resolve => return this.resolve(Ok(())),
                        },
                        FlushOutcome::Suspended => return Poll::Pending,
                        FlushOutcome::Disconnected => {
                            // An abort mid-handshake is a handshake failure,
                            // not a clean peer close.
                            return this.resolve(Err(Error::new(ErrorKind::HandshakeFailed)));
                        }
                        FlushOutcome::Failed(err) => {
                            return this
                                .resolve(Err(Error::with_io(ErrorKind::HandshakeFailed, err)));
                        }
                    }
                }
                Phase::Fill => {
                    let (socket, controller, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match fill_engine(socket, controller, cx, engine, &mut this.scratch) {
                        FillOutcome::Fed => this.phase = Phase::Drive,
                        FillOutcome::Eof => {
                            return this.resolve(Err(Error::new(ErrorKind::HandshakeFailed)));
                        }
                        FillOutcome::Suspended => return Poll::Pending,
                        FillOutcome::Failed(err) => {
                            return this
                                .resolve(Err(Error::with_io(ErrorKind::HandshakeFailed, err)));
                        }
                    }
                }
            }
        }
    }
}
