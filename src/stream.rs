//! User-facing TLS stream and listener.
//!
//! A [`TlsStream`] binds a non-blocking socket, a per-connection
//! [`TlsEngine`], and a reactor [`IoController`], and hands out the
//! awaitables that drive them: `connect → handshake → send/recv → shutdown →
//! close`. A [`TlsListener`] accepts raw TCP connections and wraps each in a
//! server-role stream; the TLS handshake runs when the caller awaits
//! [`TlsStream::handshake`].
//!
//! Socket-plane operations (`bind`, `connect`, `accept`, `close`) report
//! `io::Error`; record-layer operations report [`crate::Error`].

use crate::awaitable::{Handshake, Recv, Send, Shutdown};
use crate::context::{TlsContext, TlsSession};
use crate::engine::{Role, TlsEngine};
use crate::error::{Error, ErrorKind};
use crate::reactor::{timeout, IoController, Reactor};
use mio::net::{TcpListener, TcpStream};
use rustls::pki_types::CertificateDer;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::mem::ManuallyDrop;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An asynchronous TLS connection.
///
/// All operations return one-shot awaitables that suspend until the socket
/// is ready and the TLS state machine has made progress. The destructor
/// does **not** release the socket: teardown is `shutdown().await` followed
/// by [`TlsStream::close`], and a stream dropped without `close()` leaves
/// its handle open (a warning is logged; [`TlsStream::handle`] exposes the
/// descriptor for callers that need to reclaim it).
pub struct TlsStream {
    // ManuallyDrop keeps the descriptor alive when the stream is dropped
    // without close(); only close() releases it.
    socket: Option<ManuallyDrop<TcpStream>>,
    controller: Option<IoController>,
    reactor: Reactor,
    engine: TlsEngine,
    role: Role,
}

impl TlsStream {
    /// Creates an unconnected client stream sharing `ctx`.
    pub fn new(reactor: &Reactor, ctx: Arc<TlsContext>) -> Self {
        Self {
            socket: None,
            controller: None,
            reactor: reactor.clone(),
            engine: TlsEngine::new(ctx),
            role: Role::Client,
        }
    }

    /// Wraps a socket produced by [`TlsListener::accept`] in a server-role
    /// stream.
    pub fn from_accepted(
        reactor: &Reactor,
        ctx: Arc<TlsContext>,
        mut socket: TcpStream,
    ) -> io::Result<Self> {
        socket.set_nodelay(true)?;
        let controller = reactor.attach(&mut socket)?;
        Ok(Self {
            socket: Some(ManuallyDrop::new(socket)),
            controller: Some(controller),
            reactor: reactor.clone(),
            engine: TlsEngine::new(ctx),
            role: Role::Server,
        })
    }

    // ========================================================================
    // Socket plane
    // ========================================================================

    /// Starts a non-blocking connect and returns the awaitable that resolves
    /// once the TCP connection is established.
    ///
    /// The TLS handshake is a separate step: await [`TlsStream::handshake`]
    /// after the connect resolves.
    pub fn connect(&mut self, addr: SocketAddr) -> Connect<'_> {
        self.role = Role::Client;
        let early = self.start_connect(addr).err();
        Connect {
            stream: self,
            early,
            done: false,
        }
    }

    fn start_connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut socket = TcpStream::connect(addr)?;
        socket.set_nodelay(true)?;
        let controller = self.reactor.attach(&mut socket)?;
        info!(%addr, "connecting");
        self.socket = Some(ManuallyDrop::new(socket));
        self.controller = Some(controller);
        Ok(())
    }

    /// Deregisters and releases the socket. The stream is invalid afterwards.
    ///
    /// This is the only path that closes the descriptor; dropping the stream
    /// does not.
    pub fn close(&mut self) -> io::Result<()> {
        if let (Some(socket), Some(controller)) = (self.socket.take(), self.controller.take()) {
            let mut socket = ManuallyDrop::into_inner(socket);
            controller.deregister(&mut socket)?;
            debug!("stream closed");
        }
        Ok(())
    }

    /// Enables or disables Nagle's algorithm on the socket.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.socket_ref()?.set_nodelay(nodelay)
    }

    /// The local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket_ref()?.local_addr()
    }

    /// The peer address of the socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket_ref()?.peer_addr()
    }

    /// The raw socket handle, while the stream is open.
    #[cfg(unix)]
    pub fn handle(&self) -> Option<RawFd> {
        self.socket.as_deref().map(AsRawFd::as_raw_fd)
    }

    fn socket_ref(&self) -> io::Result<&TcpStream> {
        self.socket
            .as_deref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    // ========================================================================
    // TLS plane
    // ========================================================================

    /// Sets the SNI hostname and enables hostname verification. Client
    /// streams only; must precede the handshake.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<(), Error> {
        self.engine.set_hostname(hostname)
    }

    /// Returns the awaitable driving the TLS handshake to completion.
    pub fn handshake(&mut self) -> Handshake<'_> {
        Handshake::new(self)
    }

    /// Like [`TlsStream::handshake`], bounded by a deadline; expiry resolves
    /// with [`ErrorKind::HandshakeTimeout`].
    pub async fn handshake_timed(&mut self, duration: Duration) -> Result<(), Error> {
        let reactor = self.reactor.clone();
        match timeout(&reactor, duration, self.handshake()).await {
            Err(err) if err.kind() == ErrorKind::Timeout => {
                Err(Error::new(ErrorKind::HandshakeTimeout))
            }
            other => other,
        }
    }

    /// Returns the awaitable decoding plaintext into `buf`.
    ///
    /// Resolves with the byte count; `Ok(0)` marks the peer's end-of-stream.
    pub fn recv<'a>(&'a mut self, buf: &'a mut [u8]) -> Recv<'a> {
        Recv::new(self, buf)
    }

    /// Returns the awaitable encrypting and sending all of `buf`.
    ///
    /// Resolves with `buf.len()` on success.
    pub fn send<'a>(&'a mut self, buf: &'a [u8]) -> Send<'a> {
        Send::new(self, buf)
    }

    /// Returns the awaitable driving the close handshake. Best-effort:
    /// terminal errors resolve `Ok(())`.
    pub fn shutdown(&mut self) -> Shutdown<'_> {
        Shutdown::new(self)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Whether the stream still owns a socket and a usable engine.
    pub fn is_valid(&self) -> bool {
        self.socket.is_some() && self.engine.is_valid()
    }

    /// Whether the TLS handshake has completed.
    pub fn is_handshake_completed(&self) -> bool {
        self.engine.is_handshake_completed()
    }

    /// The negotiated protocol version, e.g. `"TLSv1.3"`.
    pub fn protocol_version(&self) -> Option<&'static str> {
        self.engine.protocol_version()
    }

    /// The negotiated cipher suite's IANA name.
    pub fn cipher(&self) -> Option<String> {
        self.engine.cipher()
    }

    /// The agreed ALPN protocol; empty when none was negotiated.
    pub fn alpn_protocol(&self) -> Vec<u8> {
        self.engine.alpn_protocol()
    }

    /// The peer's end-entity certificate.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.engine.peer_certificate()
    }

    /// The certificate-verification failure, if verification failed.
    pub fn verify_result(&self) -> Option<&rustls::Error> {
        self.engine.verify_result()
    }

    /// The SNI hostname the client sent; server streams only.
    pub fn server_name(&self) -> Option<&str> {
        self.engine.server_name()
    }

    /// Whether the handshake resumed a cached session.
    pub fn is_session_reused(&self) -> bool {
        self.engine.is_session_reused()
    }

    /// Installs a session handle captured from an earlier connection.
    /// Client streams only, before the handshake. Returns `true` when
    /// resumption with that session will be attempted.
    pub fn set_session(&mut self, session: &TlsSession) -> bool {
        self.engine.set_session(session)
    }

    /// The session handle cached for this connection's server name, once
    /// the handshake has stored one. Client streams only.
    pub fn get_session(&self) -> Option<TlsSession> {
        self.engine.get_session()
    }

    /// Direct access to the engine.
    pub fn engine(&self) -> &TlsEngine {
        &self.engine
    }

    // ========================================================================
    // Awaitable support
    // ========================================================================

    // Initializes the engine exactly once, with the role fixed at
    // construction (server for accepted sockets, client otherwise).
    pub(crate) fn ensure_engine(&mut self) -> Result<(), Error> {
        if self.socket.is_none() {
            return Err(Error::new(ErrorKind::SslSetFdFailed));
        }
        if !self.engine.is_initialized() {
            self.engine.set_role(self.role);
            self.engine.init_in_memory_io()?;
        }
        Ok(())
    }

    // Splits the stream into the pieces an awaitable needs for one turn.
    pub(crate) fn parts(
        &mut self,
    ) -> Result<(&mut TcpStream, &IoController, &mut TlsEngine), Error> {
        match (self.socket.as_mut(), self.controller.as_ref()) {
            (Some(socket), Some(controller)) => Ok((&mut **socket, controller, &mut self.engine)),
            _ => Err(Error::new(ErrorKind::SslSetFdFailed)),
        }
    }

    pub(crate) fn controller_clear_wakers(&self) {
        if let Some(controller) = &self.controller {
            controller.clear_wakers();
        }
    }
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("role", &self.role)
            .field("open", &self.socket.is_some())
            .field("engine", &self.engine)
            .finish()
    }
}

impl Drop for TlsStream {
    fn drop(&mut self) {
        // The socket is wrapped in ManuallyDrop, so falling out of scope
        // leaves the descriptor open and registered. Releasing it requires
        // an explicit close().
        if self.socket.is_some() {
            warn!("stream dropped without close(); socket handle left open");
        }
    }
}

/// Awaitable TCP connection establishment.
///
/// Resolves once the non-blocking connect completes or fails.
pub struct Connect<'a> {
    stream: &'a mut TlsStream,
    early: Option<io::Error>,
    done: bool,
}

impl Future for Connect<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "connect polled after resolution");
        if this.done {
            return Poll::Pending;
        }
        if let Some(err) = this.early.take() {
            this.done = true;
            return Poll::Ready(Err(err));
        }
        let (Some(socket), Some(controller)) =
            (this.stream.socket.as_mut(), this.stream.controller.as_ref())
        else {
            this.done = true;
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
        };
        // The connect result is known once the socket reports writable:
        // peer_addr succeeds on success, take_error holds the failure.
        match socket.peer_addr() {
            Ok(addr) => {
                this.done = true;
                debug!(%addr, "connected");
                Poll::Ready(Ok(()))
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {
                match socket.take_error() {
                    Ok(Some(err)) => {
                        this.done = true;
                        Poll::Ready(Err(err))
                    }
                    Ok(None) => {
                        controller.register_send_waker(cx.waker());
                        Poll::Pending
                    }
                    Err(err) => {
                        this.done = true;
                        Poll::Ready(Err(err))
                    }
                }
            }
            Err(err) => {
                this.done = true;
                Poll::Ready(Err(err))
            }
        }
    }
}

/// Listening socket producing server-role [`TlsStream`]s.
pub struct TlsListener {
    listener: TcpListener,
    controller: IoController,
    reactor: Reactor,
    ctx: Arc<TlsContext>,
}

impl TlsListener {
    /// Binds `addr` and listens with a default backlog of 1024.
    pub fn bind(reactor: &Reactor, ctx: Arc<TlsContext>, addr: SocketAddr) -> io::Result<Self> {
        Self::bind_with_backlog(reactor, ctx, addr, 1024)
    }

    /// Binds `addr` with an explicit listen backlog. The socket reuses the
    /// local address and is non-blocking.
    pub fn bind_with_backlog(
        reactor: &Reactor,
        ctx: Arc<TlsContext>,
        addr: SocketAddr,
        backlog: i32,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let mut listener = TcpListener::from_std(socket.into());
        let controller = reactor.attach(&mut listener)?;
        let local = listener.local_addr()?;
        info!(addr = %local, backlog, "listening");
        Ok(Self {
            listener,
            controller,
            reactor: reactor.clone(),
            ctx,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the awaitable accepting the next connection.
    pub fn accept(&mut self) -> Accept<'_> {
        Accept {
            listener: self,
            done: false,
        }
    }

    /// Deregisters and releases the listening socket.
    pub fn close(mut self) -> io::Result<()> {
        self.controller.deregister(&mut self.listener)
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

/// Awaitable accept of one incoming connection.
///
/// Resolves with a server-role [`TlsStream`] whose handshake has not yet
/// run, plus the peer address.
pub struct Accept<'a> {
    listener: &'a mut TlsListener,
    done: bool,
}

impl Future for Accept<'_> {
    type Output = io::Result<(TlsStream, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "accept polled after resolution");
        if this.done {
            return Poll::Pending;
        }
        loop {
            match this.listener.listener.accept() {
                Ok((socket, addr)) => {
                    this.done = true;
                    info!(%addr, "accepted connection");
                    let stream = TlsStream::from_accepted(
                        &this.listener.reactor,
                        this.listener.ctx.clone(),
                        socket,
                    )?;
                    return Poll::Ready(Ok((stream, addr)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    this.listener.controller.register_recv_waker(cx.waker());
                    return Poll::Pending;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The connection died between arrival and accept; keep going.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    this.done = true;
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}
