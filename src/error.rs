//! Error model for the TLS transport layer.
//!
//! Every fallible operation in this crate reports an [`Error`]: a stable
//! [`ErrorKind`] plus, where one exists, the underlying rustls or I/O error
//! that produced it. Transient conditions (the engine needs the socket to
//! become readable or writable) are normally absorbed by the awaitables and
//! never reach the caller; when they do surface, [`Error::needs_retry`]
//! distinguishes them from hard failures.

use std::fmt;
use std::io;
use thiserror::Error;

/// Stable classification of TLS transport failures.
///
/// The kind is what callers should match on; the attached library error (if
/// any) is for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Not an error. Present so an [`Error`] value can represent "no error"
    /// in result slots; regular APIs return `Result` and never construct it.
    #[error("success")]
    Success,
    /// The TLS context could not be created from the selected method.
    #[error("context creation failed")]
    ContextCreateFailed,
    /// A certificate file could not be loaded or parsed.
    #[error("certificate load failed")]
    CertificateLoadFailed,
    /// A private key file could not be loaded or parsed.
    #[error("private key load failed")]
    PrivateKeyLoadFailed,
    /// The loaded private key does not match the leaf certificate.
    #[error("private key does not match certificate")]
    PrivateKeyMismatch,
    /// A CA certificate file or directory could not be loaded.
    #[error("CA certificate load failed")]
    CACertificateLoadFailed,
    /// The per-connection TLS session could not be created.
    #[error("TLS session creation failed")]
    SslCreateFailed,
    /// The socket handle could not be attached to the TLS session.
    #[error("attaching socket to TLS session failed")]
    SslSetFdFailed,
    /// The TLS handshake failed.
    #[error("TLS handshake failed")]
    HandshakeFailed,
    /// The TLS handshake did not complete within the allotted time.
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
    /// The handshake needs the socket to become readable; retry the await.
    #[error("handshake wants read")]
    HandshakeWantRead,
    /// The handshake needs the socket to become writable; retry the await.
    #[error("handshake wants write")]
    HandshakeWantWrite,
    /// An application-data read failed at the record layer.
    #[error("TLS read failed")]
    ReadFailed,
    /// An application-data write failed at the record layer.
    #[error("TLS write failed")]
    WriteFailed,
    /// The close handshake failed.
    #[error("TLS shutdown failed")]
    ShutdownFailed,
    /// The peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,
    /// Peer certificate verification failed.
    #[error("certificate verification failed")]
    VerificationFailed,
    /// The SNI hostname could not be applied.
    #[error("setting SNI hostname failed")]
    SNISetFailed,
    /// The ALPN protocol list could not be applied.
    #[error("setting ALPN protocols failed")]
    ALPNSetFailed,
    /// The operation did not complete within the allotted time.
    #[error("operation timed out")]
    Timeout,
    /// An error that fits no other kind.
    #[error("unknown TLS error")]
    Unknown,
}

/// Underlying error retained alongside an [`ErrorKind`].
#[derive(Debug)]
pub enum LibraryError {
    /// Error reported by the rustls record layer.
    Tls(rustls::Error),
    /// Error reported by the operating system.
    Io(io::Error),
}

impl fmt::Display for LibraryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

/// The error type for TLS transport operations.
///
/// Carries a stable [`ErrorKind`] and, when available, the rustls or I/O
/// error underneath it.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    library: Option<LibraryError>,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.library {
            Some(LibraryError::Tls(e)) => Some(e),
            Some(LibraryError::Io(e)) => Some(e),
            None => None,
        }
    }
}

impl Error {
    /// Creates an error from a kind with no underlying library error.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            library: None,
        }
    }

    /// Creates an error retaining the rustls error that caused it.
    pub fn with_tls(kind: ErrorKind, err: rustls::Error) -> Self {
        Self {
            kind,
            library: Some(LibraryError::Tls(err)),
        }
    }

    /// Creates an error retaining the I/O error that caused it.
    pub fn with_io(kind: ErrorKind, err: io::Error) -> Self {
        Self {
            kind,
            library: Some(LibraryError::Io(err)),
        }
    }

    /// The stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The underlying rustls or I/O error, if one was retained.
    pub fn library_error(&self) -> Option<&LibraryError> {
        self.library.as_ref()
    }

    /// Whether this value represents "no error".
    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::Success
    }

    /// Whether the operation should simply be awaited again once the socket
    /// reports readiness.
    pub fn needs_retry(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::HandshakeWantRead | ErrorKind::HandshakeWantWrite
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(lib) => write!(f, "{}: {lib}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

// ============================================================================
// Raw-I/O classification
// ============================================================================

/// Returns true when a raw read/write should suspend and keep its reactor
/// registration: the socket simply has no capacity on this readiness edge.
pub(crate) fn is_not_ready(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Returns true when a raw read/write failed because the peer is gone.
/// Awaitables treat this like an end-of-stream, not an I/O fault.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_predicate_covers_want_read_and_want_write_only() {
        assert!(Error::new(ErrorKind::HandshakeWantRead).needs_retry());
        assert!(Error::new(ErrorKind::HandshakeWantWrite).needs_retry());
        assert!(!Error::new(ErrorKind::HandshakeFailed).needs_retry());
        assert!(!Error::new(ErrorKind::Timeout).needs_retry());
        assert!(!Error::new(ErrorKind::Success).needs_retry());
    }

    #[test]
    fn success_kind_is_not_an_error_state() {
        let err = Error::new(ErrorKind::Success);
        assert!(err.is_success());
        assert!(!Error::new(ErrorKind::ReadFailed).is_success());
    }

    #[test]
    fn io_classification() {
        let would_block = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(is_not_ready(&would_block));
        assert!(!is_disconnect(&would_block));

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_disconnect(&reset));
        assert!(!is_not_ready(&reset));

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(!is_not_ready(&refused));
        assert!(!is_disconnect(&refused));
    }

    #[test]
    fn display_includes_library_error() {
        let err = Error::with_io(
            ErrorKind::ReadFailed,
            io::Error::new(io::ErrorKind::Other, "boom"),
        );
        let text = err.to_string();
        assert!(text.contains("TLS read failed"));
        assert!(text.contains("boom"));
    }
}
