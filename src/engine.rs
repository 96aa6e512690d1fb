//! Per-connection TLS record-layer engine with in-memory ciphertext queues.
//!
//! A [`TlsEngine`] wraps a rustls session configured so that the TLS library
//! never touches a socket: ciphertext arriving from the network is pushed in
//! with [`TlsEngine::feed_cipher`], ciphertext produced by the library is
//! pulled out with [`TlsEngine::extract_cipher`], and the plaintext-level
//! operations (`do_handshake`, `read`, `write`, `shutdown`) report a
//! [`TlsIoResult`] telling the caller which direction of socket I/O, if any,
//! is required to make further progress.
//!
//! The engine is the synchronous half of the transport; the awaitable state
//! machines in [`crate::awaitable`] drive it from readiness callbacks.

use crate::context::{TlsContext, TlsSession};
use crate::error::{Error, ErrorKind};
use bytes::{Buf, BufMut, BytesMut};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConnection, HandshakeKind, ProtocolVersion, ServerConnection};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, trace};

/// Which side of the handshake this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake.
    Client,
    /// Accepts the handshake.
    Server,
}

/// Outcome of a plaintext-level engine operation.
///
/// This is the single classification used by every awaitable to decide
/// between resolving, flushing outbound ciphertext, and waiting for inbound
/// ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsIoResult {
    /// The operation completed.
    Success,
    /// More inbound ciphertext is required; feed the engine after the next
    /// readable edge.
    WantRead,
    /// Outbound ciphertext (or plaintext backpressure) must drain first;
    /// extract and send, then retry.
    WantWrite,
    /// The peer closed the connection cleanly.
    ZeroReturn,
    /// The operation failed at the record layer.
    Error,
    /// The operation failed below the record layer.
    Syscall,
}

/// Handshake progress of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// `do_handshake` has not been called.
    NotStarted,
    /// The handshake is underway.
    InProgress,
    /// The record layer reported handshake success.
    Completed,
    /// The handshake failed terminally.
    Failed,
}

// Plaintext the record layer will buffer before write() reports WantWrite.
const PLAINTEXT_BUFFER_LIMIT: usize = 64 * 1024;

// SNI fallback when the caller never names the server.
const DEFAULT_SERVER_NAME: &str = "localhost";

// Role-erased rustls session. Client and server connections share no common
// trait for the record-layer surface, so the dispatch lives here.
enum Session {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Session {
    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(c) => c.is_handshaking(),
            Self::Server(s) => s.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_read(),
            Self::Server(s) => s.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(c) => c.wants_write(),
            Self::Server(s) => s.wants_write(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Self::Client(c) => c.reader(),
            Self::Server(s) => s.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Self::Client(c) => c.writer(),
            Self::Server(s) => s.writer(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            Self::Client(c) => c.read_tls(rd),
            Self::Server(s) => s.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match self {
            Self::Client(c) => c.write_tls(wr),
            Self::Server(s) => s.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Client(c) => c.process_new_packets(),
            Self::Server(s) => s.process_new_packets(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(c) => c.send_close_notify(),
            Self::Server(s) => s.send_close_notify(),
        }
    }

    fn set_buffer_limit(&mut self, limit: Option<usize>) {
        match self {
            Self::Client(c) => c.set_buffer_limit(limit),
            Self::Server(s) => s.set_buffer_limit(limit),
        }
    }

    fn protocol_version(&self) -> Option<ProtocolVersion> {
        match self {
            Self::Client(c) => c.protocol_version(),
            Self::Server(s) => s.protocol_version(),
        }
    }

    fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            Self::Client(c) => c.negotiated_cipher_suite(),
            Self::Server(s) => s.negotiated_cipher_suite(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Self::Client(c) => c.alpn_protocol(),
            Self::Server(s) => s.alpn_protocol(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            Self::Client(c) => c.peer_certificates(),
            Self::Server(s) => s.peer_certificates(),
        }
    }

    fn handshake_kind(&self) -> Option<HandshakeKind> {
        match self {
            Self::Client(c) => c.handshake_kind(),
            Self::Server(s) => s.handshake_kind(),
        }
    }

    fn server_name(&self) -> Option<&str> {
        match self {
            Self::Client(_) => None,
            Self::Server(s) => s.server_name(),
        }
    }
}

/// Per-connection record-layer facade with in-memory I/O.
pub struct TlsEngine {
    ctx: Arc<TlsContext>,
    role: Role,
    hostname: Option<String>,
    session: Option<Session>,
    inbound: BytesMut,
    outbound: BytesMut,
    state: HandshakeState,
    close_notify_sent: bool,
    peer_closed: bool,
    last_error: Option<rustls::Error>,
    verify_error: Option<rustls::Error>,
}

impl TlsEngine {
    /// Creates an engine bound to a shared context.
    ///
    /// The role defaults to the side the context's method names; an accepted
    /// connection overrides it via [`TlsEngine::set_role`] before
    /// initialization.
    pub fn new(ctx: Arc<TlsContext>) -> Self {
        let role = if ctx.method().is_client() {
            Role::Client
        } else {
            Role::Server
        };
        Self {
            ctx,
            role,
            hostname: None,
            session: None,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            state: HandshakeState::NotStarted,
            close_notify_sent: false,
            peer_closed: false,
            last_error: None,
            verify_error: None,
        }
    }

    /// Whether the engine can still derive or drive a session.
    pub fn is_valid(&self) -> bool {
        self.ctx.is_valid()
    }

    /// Whether [`TlsEngine::init_in_memory_io`] has run.
    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// Sets the handshake role. Must precede [`TlsEngine::init_in_memory_io`].
    pub fn set_role(&mut self, role: Role) {
        debug_assert!(self.session.is_none());
        self.role = role;
    }

    /// The configured handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets the SNI hostname and enables hostname verification of the leaf
    /// certificate. Client engines only; must precede initialization.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<(), Error> {
        if self.role != Role::Client || self.session.is_some() {
            return Err(Error::new(ErrorKind::SNISetFailed));
        }
        ServerName::try_from(hostname.to_string())
            .map_err(|e| Error::with_tls(ErrorKind::SNISetFailed, rustls::Error::General(e.to_string())))?;
        self.hostname = Some(hostname.to_string());
        Ok(())
    }

    /// Installs the in-memory ciphertext queues as the record layer's I/O
    /// endpoints and creates the session.
    ///
    /// Idempotent: calling it again on an initialized engine succeeds and
    /// does not reset session state. Must be called before any handshake,
    /// read, write, or shutdown operation.
    pub fn init_in_memory_io(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut session = match self.role {
            Role::Client => {
                let config = self.ctx.client_config()?;
                let name = self
                    .hostname
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
                let server_name = ServerName::try_from(name)
                    .map_err(|e| Error::with_tls(ErrorKind::SNISetFailed, rustls::Error::General(e.to_string())))?;
                Session::Client(
                    ClientConnection::new(config, server_name)
                        .map_err(|e| Error::with_tls(ErrorKind::SslCreateFailed, e))?,
                )
            }
            Role::Server => {
                let config = self.ctx.server_config()?;
                Session::Server(
                    ServerConnection::new(config)
                        .map_err(|e| Error::with_tls(ErrorKind::SslCreateFailed, e))?,
                )
            }
        };
        session.set_buffer_limit(Some(PLAINTEXT_BUFFER_LIMIT));
        self.session = Some(session);
        debug!(role = ?self.role, "engine initialized with in-memory I/O");
        Ok(())
    }

    // ========================================================================
    // Ciphertext queue access
    // ========================================================================

    /// Appends network ciphertext to the inbound queue. Returns the number of
    /// bytes accepted (always all of them; the queue is unbounded).
    pub fn feed_cipher(&mut self, data: &[u8]) -> usize {
        self.inbound.extend_from_slice(data);
        trace!(len = data.len(), queued = self.inbound.len(), "fed ciphertext");
        data.len()
    }

    /// Drains up to `buf.len()` bytes of outbound ciphertext. Returns the
    /// number of bytes copied; `0` means the queue is empty.
    pub fn extract_cipher(&mut self, buf: &mut [u8]) -> usize {
        let n = self.outbound.len().min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&self.outbound[..n]);
            self.outbound.advance(n);
            trace!(len = n, remaining = self.outbound.len(), "extracted ciphertext");
        }
        n
    }

    /// Bytes of ciphertext currently queued for the socket.
    pub fn pending_cipher(&self) -> usize {
        self.outbound.len()
    }

    // ========================================================================
    // Plaintext-level operations
    // ========================================================================

    /// Advances the handshake as far as the queued ciphertext allows.
    pub fn do_handshake(&mut self) -> TlsIoResult {
        if self.session.is_none() {
            return TlsIoResult::Error;
        }
        if self.state == HandshakeState::NotStarted {
            self.state = HandshakeState::InProgress;
        }
        if let Err(err) = self.pump() {
            self.state = HandshakeState::Failed;
            return self.record_error(err);
        }
        let session = self.session.as_ref().expect("session initialized above");
        if !session.is_handshaking() {
            if self.state != HandshakeState::Completed {
                self.state = HandshakeState::Completed;
                debug!(
                    version = self.protocol_version().unwrap_or("unknown"),
                    resumed = self.is_session_reused(),
                    "handshake completed"
                );
            }
            return TlsIoResult::Success;
        }
        if self.peer_closed {
            self.state = HandshakeState::Failed;
            return TlsIoResult::ZeroReturn;
        }
        // With unbounded in-memory queues the record layer is never blocked
        // on output, so an unfinished handshake always waits for input. The
        // caller must still flush pending_cipher() before reading.
        TlsIoResult::WantRead
    }

    /// Decodes queued ciphertext into `buf`.
    ///
    /// Returns the outcome and the number of plaintext bytes produced.
    /// [`TlsIoResult::ZeroReturn`] reports the peer's clean close.
    pub fn read(&mut self, buf: &mut [u8]) -> (TlsIoResult, usize) {
        if self.session.is_none() {
            return (TlsIoResult::Error, 0);
        }
        if buf.is_empty() {
            return (TlsIoResult::Success, 0);
        }
        if let Err(err) = self.pump() {
            return (self.record_error(err), 0);
        }
        let session = self.session.as_mut().expect("session initialized above");
        match session.reader().read(buf) {
            Ok(0) => (TlsIoResult::ZeroReturn, 0),
            Ok(n) => {
                trace!(len = n, "decoded plaintext");
                (TlsIoResult::Success, n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if self.peer_closed {
                    (TlsIoResult::ZeroReturn, 0)
                } else {
                    (TlsIoResult::WantRead, 0)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => (TlsIoResult::ZeroReturn, 0),
            Err(_) => (TlsIoResult::Error, 0),
        }
    }

    /// Encrypts plaintext from `buf` into the outbound queue.
    ///
    /// Returns the outcome and the number of plaintext bytes consumed.
    /// [`TlsIoResult::WantWrite`] means the record layer's plaintext buffer
    /// is full: drain the outbound queue to the socket and retry.
    pub fn write(&mut self, buf: &[u8]) -> (TlsIoResult, usize) {
        if self.session.is_none() {
            return (TlsIoResult::Error, 0);
        }
        if buf.is_empty() {
            return (TlsIoResult::Success, 0);
        }
        if let Err(err) = self.pump() {
            return (self.record_error(err), 0);
        }
        if self.peer_closed {
            return (TlsIoResult::ZeroReturn, 0);
        }
        let session = self.session.as_mut().expect("session initialized above");
        let written = match session.writer().write(buf) {
            Ok(n) => n,
            Err(_) => return (TlsIoResult::Error, 0),
        };
        if written == 0 {
            return (TlsIoResult::WantWrite, 0);
        }
        if let Err(err) = self.pump() {
            return (self.record_error(err), 0);
        }
        trace!(len = written, pending = self.outbound.len(), "encrypted plaintext");
        (TlsIoResult::Success, written)
    }

    /// Drives the close handshake.
    ///
    /// Queues the close_notify alert once. Returns
    /// [`TlsIoResult::WantWrite`] while the alert waits in the outbound
    /// queue, [`TlsIoResult::WantRead`] while the peer's close_notify is
    /// outstanding, and [`TlsIoResult::Success`] when both directions are
    /// closed.
    pub fn shutdown(&mut self) -> TlsIoResult {
        let Some(session) = self.session.as_mut() else {
            return TlsIoResult::Success;
        };
        if !self.close_notify_sent {
            session.send_close_notify();
            self.close_notify_sent = true;
        }
        if let Err(err) = self.pump() {
            return self.record_error(err);
        }
        if !self.outbound.is_empty() {
            return TlsIoResult::WantWrite;
        }
        if !self.peer_closed {
            return TlsIoResult::WantRead;
        }
        TlsIoResult::Success
    }

    // Moves bytes between the queues and the record layer until neither side
    // can make progress. The sole writer of `peer_closed`.
    fn pump(&mut self) -> Result<(), rustls::Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        loop {
            let mut progressed = false;

            while session.wants_write() {
                match session.write_tls(&mut (&mut self.outbound).writer()) {
                    Ok(0) => break,
                    Ok(_) => progressed = true,
                    Err(_) => break,
                }
            }

            // wants_read() is false while decoded plaintext awaits the
            // caller, which keeps the record layer's buffers bounded. Never
            // hand the record layer an empty source: it would read it as EOF.
            if !self.inbound.is_empty() && session.wants_read() {
                match session.read_tls(&mut (&mut self.inbound).reader()) {
                    Ok(0) => {}
                    Ok(_) => {
                        progressed = true;
                        match session.process_new_packets() {
                            Ok(state) => {
                                if state.peer_has_closed() {
                                    self.peer_closed = true;
                                }
                            }
                            Err(err) => {
                                // The failure may have queued an alert for
                                // the peer; make it extractable.
                                while session.wants_write() {
                                    match session.write_tls(&mut (&mut self.outbound).writer()) {
                                        Ok(0) | Err(_) => break,
                                        Ok(_) => {}
                                    }
                                }
                                return Err(err);
                            }
                        }
                    }
                    Err(_) => {}
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn record_error(&mut self, err: rustls::Error) -> TlsIoResult {
        if matches!(err, rustls::Error::InvalidCertificate(_)) && self.verify_error.is_none() {
            self.verify_error = Some(err.clone());
        }
        debug!(%err, "record layer error");
        self.last_error = Some(err);
        TlsIoResult::Error
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// The current handshake state.
    pub fn handshake_state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the record layer has reported handshake success.
    pub fn is_handshake_completed(&self) -> bool {
        self.state == HandshakeState::Completed
    }

    /// The peer's certificate chain, leaf first, once the handshake has
    /// progressed far enough to know it.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.session
            .as_ref()
            .and_then(Session::peer_certificates)
            .and_then(|chain| chain.first().cloned())
    }

    /// The certificate-verification failure recorded during the handshake,
    /// if verification failed.
    pub fn verify_result(&self) -> Option<&rustls::Error> {
        self.verify_error.as_ref()
    }

    /// The negotiated protocol version as a display string, e.g. "TLSv1.3".
    pub fn protocol_version(&self) -> Option<&'static str> {
        self.session
            .as_ref()
            .and_then(Session::protocol_version)
            .map(|v| match v {
                ProtocolVersion::TLSv1_2 => "TLSv1.2",
                ProtocolVersion::TLSv1_3 => "TLSv1.3",
                _ => "unknown",
            })
    }

    /// The negotiated cipher suite's IANA name.
    pub fn cipher(&self) -> Option<String> {
        self.session
            .as_ref()
            .and_then(Session::negotiated_cipher_suite)
            .map(|suite| {
                let name = format!("{:?}", suite.suite());
                // The record layer spells TLS 1.3 suites TLS13_*; IANA says TLS_*.
                name.replacen("TLS13_", "TLS_", 1)
            })
    }

    /// The agreed ALPN protocol; empty when none was negotiated.
    pub fn alpn_protocol(&self) -> Vec<u8> {
        self.session
            .as_ref()
            .and_then(Session::alpn_protocol)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// The SNI hostname the client sent; server engines only.
    pub fn server_name(&self) -> Option<&str> {
        self.session.as_ref().and_then(Session::server_name)
    }

    /// Installs a previously captured session handle for reuse.
    ///
    /// Client engines only, before initialization. The record layer keeps
    /// the session state itself; installing a handle points this connection
    /// at the context's cache entry for the session's server name (setting
    /// the SNI hostname when none was chosen yet). Returns `true` when the
    /// engine will attempt resumption with that session — the handle's
    /// entry still exists and its server name matches the connection's.
    /// Check [`TlsEngine::is_session_reused`] after the handshake for the
    /// outcome.
    pub fn set_session(&mut self, session: &TlsSession) -> bool {
        if self.role != Role::Client || self.session.is_some() {
            return false;
        }
        if self.ctx.cached_session(session.server_name()).is_none() {
            return false;
        }
        match &self.hostname {
            None => {
                self.hostname = Some(session.server_name().to_string());
                true
            }
            Some(name) => name == session.server_name(),
        }
    }

    /// The session handle the context has cached for this connection's
    /// server name, once the handshake has stored one.
    ///
    /// Client engines only. The handle is metadata over the record layer's
    /// private session state; pass it to [`TlsEngine::set_session`] on a
    /// later connection to request resumption.
    pub fn get_session(&self) -> Option<TlsSession> {
        if self.role != Role::Client {
            return None;
        }
        let name = self.hostname.as_deref().unwrap_or(DEFAULT_SERVER_NAME);
        self.ctx.cached_session(name)
    }

    /// Whether the handshake resumed a cached session.
    pub fn is_session_reused(&self) -> bool {
        self.session
            .as_ref()
            .and_then(Session::handshake_kind)
            .map(|kind| kind == HandshakeKind::Resumed)
            .unwrap_or(false)
    }

    /// The most recent record-layer error, kept until the engine is dropped.
    pub fn last_error(&self) -> Option<&rustls::Error> {
        self.last_error.as_ref()
    }

    /// Whether the peer's clean close has been observed.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}
