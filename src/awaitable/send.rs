//! The application-write awaitable.
//!
//! Streams the caller's plaintext through the engine in bounded chunks:
//! each cycle drains the engine's pending outbound ciphertext into the
//! scratch buffer, pushes it to the socket (advancing a cursor across
//! partial sends), and only then feeds the engine the next plaintext slice.
//! The future resolves with the original plaintext length, never the
//! ciphertext byte count.

use super::{engine_error, fill_engine, flush_chunk, stage_pending_cipher, FillOutcome, FlushOutcome};
use crate::buffer::{CipherBuf, MAX_CHUNK, MIN_CHUNK};
use crate::engine::{TlsEngine, TlsIoResult};
use crate::error::{Error, ErrorKind};
use crate::stream::TlsStream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

// What the next staged chunk looks like.
enum NextChunk {
    // Ciphertext is staged and ready for a raw send.
    Ready,
    // Every plaintext byte is consumed and every record is on the wire.
    AllDone,
    // The engine needs inbound ciphertext before it can accept more
    // plaintext.
    NeedRead,
}

// Stages the next ciphertext chunk: drain what is already pending, else
// feed the engine more plaintext and drain that.
fn fill_next_send_chunk(
    engine: &mut TlsEngine,
    src: &[u8],
    consumed: &mut usize,
    chunk: &mut CipherBuf,
) -> Result<NextChunk, Error> {
    if stage_pending_cipher(engine, chunk) > 0 {
        return Ok(NextChunk::Ready);
    }
    while *consumed < src.len() {
        let (result, n) = engine.write(&src[*consumed..]);
        match result {
            TlsIoResult::Success => {
                *consumed += n;
                if engine.pending_cipher() >= MAX_CHUNK {
                    break;
                }
            }
            TlsIoResult::WantWrite => break,
            TlsIoResult::WantRead => return Ok(NextChunk::NeedRead),
            TlsIoResult::ZeroReturn => return Err(Error::new(ErrorKind::PeerClosed)),
            TlsIoResult::Error | TlsIoResult::Syscall => {
                return Err(engine_error(engine, ErrorKind::WriteFailed));
            }
        }
    }
    if stage_pending_cipher(engine, chunk) > 0 {
        Ok(NextChunk::Ready)
    } else if *consumed == src.len() {
        Ok(NextChunk::AllDone)
    } else {
        // The engine accepted nothing and produced nothing.
        Err(Error::new(ErrorKind::WriteFailed))
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Prepare,
    Flush,
    Fill,
}

/// One-shot future encrypting and sending the caller's plaintext.
///
/// Created by [`TlsStream::send`]. Resolves with the full plaintext length
/// on success. A zero-length send resolves `Ok(0)` without queueing any
/// socket work.
pub struct Send<'a> {
    stream: &'a mut TlsStream,
    src: &'a [u8],
    consumed: usize,
    phase: Phase,
    chunk: CipherBuf,
    scratch: Vec<u8>,
    early: Option<Error>,
    done: bool,
}

impl<'a> Send<'a> {
    pub(crate) fn new(stream: &'a mut TlsStream, src: &'a [u8]) -> Self {
        let early = stream.ensure_engine().err();
        Self {
            stream,
            src,
            consumed: 0,
            phase: Phase::Prepare,
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

impl Future for Send<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "send polled after resolution");
        if this.done {
            return Poll::Pending;
        }
        if let Some(err) = this.early.take() {
            return this.resolve(Err(err));
        }
        if this.src.is_empty() {
            return this.resolve(Ok(0));
        }

        loop {
            match this.phase {
                Phase::Prepare => {
                    let (_, _, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match fill_next_send_chunk(engine, this.src, &mut this.consumed, &mut this.chunk)
                    {
                        Ok(NextChunk::Ready) => this.phase = Phase::Flush,
                        Ok(NextChunk::AllDone) => {
                            let len = this.src.len();
                            return this.resolve(Ok(len));
                        }
                        Ok(NextChunk::NeedRead) => this.phase = Phase::Fill,
                        Err(err) => return this.resolve(Err(err)),
                    }
                }
                Phase::Flush => {
                    let (socket, controller, _) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match flush_chunk(socket, controller, cx, &mut this.chunk) {
                        FlushOutcome::Flushed => this.phase = Phase::Prepare,
                        FlushOutcome::Suspended => return Poll::Pending,
                        FlushOutcome::Disconnected => {
                            return this.resolve(Err(Error::new(ErrorKind::WriteFailed)));
                        }
                        FlushOutcome::Failed(err) => {
                            return this.resolve(Err(Error::with_io(ErrorKind::WriteFailed, err)));
                        }
                    }
                }
                Phase::Fill => {
                    let (socket, controller, engine) = match this.stream.parts() {
                        Ok(parts) => parts,
                        Err(err) => return this.resolve(Err(err)),
                    };
                    match fill_engine(socket, controller, cx, engine, &mut this.scratch) {
                        FillOutcome::Fed => this.phase = Phase::Prepare,
                        FillOutcome::Eof => {
                            return this.resolve(Err(Error::new(ErrorKind::PeerClosed)));
                        }
                        FillOutcome::Suspended => return Poll::Pending,
                        FillOutcome::Failed(err) => {
                            return this.resolve(Err(Error::with_io(ErrorKind::WriteFailed, err)));
                        }
                    }
                }
            }
        }
    }
}
