//! Reusable TLS configuration from which per-connection engines are derived.
//!
//! A [`TlsContext`] is configured mutably (certificates, verification policy,
//! cipher lists, ALPN, protocol versions, session cache knobs), then shared
//! behind an `Arc` by any number of connections. The underlying rustls
//! `ClientConfig`/`ServerConfig` is built lazily when the first engine is
//! derived and cached from then on; because configuration requires `&mut self`
//! and derivation requires `Arc<TlsContext>`, the configuration is immutable
//! once the first connection exists.
//!
//! Construction failures are stored on the context rather than returned: a
//! context that failed to initialize reports `is_valid() == false` and
//! refuses to derive engines.

use crate::error::{Error, ErrorKind};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{
    ClientSessionMemoryCache, ClientSessionStore, Resumption, Tls12ClientSessionValue,
    Tls13ClientSessionValue, WebPkiServerVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{NoServerSessionStorage, ServerSessionMemoryCache, WebPkiClientVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, NamedGroup, RootCertStore,
    ServerConfig, SignatureScheme, SupportedCipherSuite,
};
use rustls_pemfile::{certs, private_key};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Protocol method selecting role, record layer, and version-clamp policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMethod {
    /// TLS client, highest version negotiated.
    TlsClient,
    /// TLS server, highest version negotiated.
    TlsServer,
    /// TLS 1.2 client (min and max clamped to 1.2).
    Tls12Client,
    /// TLS 1.2 server (min and max clamped to 1.2).
    Tls12Server,
    /// TLS 1.3 client (min and max clamped to 1.3).
    Tls13Client,
    /// TLS 1.3 server (min and max clamped to 1.3).
    Tls13Server,
    /// DTLS client. The method slot exists; the record-layer backend provides
    /// no datagram factory, so deriving an engine fails.
    DtlsClient,
    /// DTLS server. See [`TlsMethod::DtlsClient`].
    DtlsServer,
}

impl TlsMethod {
    /// Whether this method configures the client side of the handshake.
    pub fn is_client(self) -> bool {
        matches!(
            self,
            Self::TlsClient | Self::Tls12Client | Self::Tls13Client | Self::DtlsClient
        )
    }

    /// Whether this method selects the datagram record layer.
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::DtlsClient | Self::DtlsServer)
    }

    fn fixed_version(self) -> Option<TlsVersion> {
        match self {
            Self::Tls12Client | Self::Tls12Server => Some(TlsVersion::Tls12),
            Self::Tls13Client | Self::Tls13Server => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

/// TLS protocol version bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2.
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// Peer certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Do not verify the peer. Clients accept any server certificate;
    /// servers request no client certificate.
    None,
    /// Verify the peer certificate when one is presented. Servers request a
    /// client certificate but accept connections without one.
    Peer,
    /// Like [`VerifyMode::Peer`], but servers reject peers that present no
    /// certificate.
    FailIfNoPeerCert,
    /// Verify the client certificate once at connection setup. The record
    /// layer performs no renegotiation, so this behaves like
    /// [`VerifyMode::Peer`].
    ClientOnce,
}

/// On-disk encoding of certificate and key files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// PEM-armored.
    Pem,
    /// Raw ASN.1/DER.
    Der,
}

/// Which sides of a connection cache sessions for resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCacheMode {
    /// No session caching.
    Off,
    /// Client-side resumption only.
    Client,
    /// Server-side session store only.
    Server,
    /// Both sides (the default).
    Both,
}

/// Facts handed to a verify callback about the certificate under review.
pub struct VerifyContext<'a> {
    /// The peer's end-entity certificate.
    pub end_entity: &'a CertificateDer<'a>,
    /// Intermediates presented by the peer, leaf-first.
    pub intermediates: &'a [CertificateDer<'a>],
    /// The server name the client asked for, when verifying a server.
    pub server_name: Option<String>,
    /// The verification error, when the built-in verifier rejected the chain.
    pub error: Option<&'a rustls::Error>,
}

/// Application hook consulted after the built-in verifier ran.
///
/// Receives the built-in verifier's verdict and the verification context and
/// returns whether to accept the peer. Returning `true` overrides a failed
/// pre-verification; returning `false` rejects an otherwise valid peer.
pub type VerifyCallback = Arc<dyn Fn(bool, &VerifyContext<'_>) -> bool + Send + Sync>;

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
const SESSION_CACHE_CAPACITY: usize = 256;

/// Opaque handle to a cached client session, keyed by the server name it was
/// negotiated under.
///
/// The record layer owns the actual session state (ticket bytes, secrets)
/// and never exposes it; a `TlsSession` carries the metadata needed to
/// re-select that state on a later connection — the cache key plus a
/// synthetic identifier. Obtain one from
/// [`TlsEngine::get_session`](crate::TlsEngine::get_session) after a
/// completed client handshake and install it on a fresh engine with
/// [`TlsEngine::set_session`](crate::TlsEngine::set_session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSession {
    server_name: String,
    id: Vec<u8>,
    created: SystemTime,
}

impl TlsSession {
    /// The server name the session was negotiated under.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// A synthetic session identifier. Unique per cached session, but not
    /// the on-wire TLS session ID (the record layer keeps that private).
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// When the session was cached.
    pub fn created_at(&self) -> SystemTime {
        self.created
    }
}

// The on-wire session ID is not accessible, so derive a stable stand-in
// from the cache key and the insertion time.
fn synthetic_session_id(server_name: &str, created: SystemTime) -> Vec<u8> {
    let mut hasher = DefaultHasher::new();
    server_name.hash(&mut hasher);
    created
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    let first = hasher.finish();
    let mut second = DefaultHasher::new();
    first.hash(&mut second);
    server_name.hash(&mut second);
    let mut id = first.to_be_bytes().to_vec();
    id.extend_from_slice(&second.finish().to_be_bytes());
    id
}

// Client session store that delegates resumption to the in-memory cache and
// records a per-server-name session handle each time the record layer caches
// something. The record layer's session values are opaque; only the metadata
// is observable.
#[derive(Debug)]
struct SessionTracker {
    inner: Arc<ClientSessionMemoryCache>,
    sessions: Mutex<HashMap<String, TlsSession>>,
}

impl SessionTracker {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ClientSessionMemoryCache::new(capacity)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, server_name: &ServerName<'static>) {
        let name = server_name.to_str().into_owned();
        let created = SystemTime::now();
        let session = TlsSession {
            id: synthetic_session_id(&name, created),
            server_name: name.clone(),
            created,
        };
        self.sessions
            .lock()
            .expect("session metadata lock poisoned")
            .insert(name, session);
    }

    fn forget(&self, server_name: &ServerName<'_>) {
        let name = server_name.to_str();
        self.sessions
            .lock()
            .expect("session metadata lock poisoned")
            .remove(name.as_ref());
    }

    fn lookup(&self, server_name: &str) -> Option<TlsSession> {
        self.sessions
            .lock()
            .expect("session metadata lock poisoned")
            .get(server_name)
            .cloned()
    }
}

impl ClientSessionStore for SessionTracker {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.inner.set_kx_hint(server_name, group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.inner.kx_hint(server_name)
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.record(&server_name);
        self.inner.set_tls12_session(server_name, value);
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.inner.tls12_session(server_name)
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.forget(server_name);
        self.inner.remove_tls12_session(server_name);
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.record(&server_name);
        self.inner.insert_tls13_ticket(server_name, value);
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        // Tickets are single-use and consumed here, but the handle stays
        // valid: the server refills the cache on the resumed connection.
        self.inner.take_tls13_ticket(server_name)
    }
}

fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Reusable TLS configuration shared by many connections.
pub struct TlsContext {
    method: TlsMethod,
    error: Option<Error>,

    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Option<PrivateKeyDer<'static>>,
    roots: RootCertStore,

    verify_mode: VerifyMode,
    verify_depth: Option<usize>,
    verify_callback: Option<VerifyCallback>,

    ciphers_tls12: Option<Vec<SupportedCipherSuite>>,
    ciphers_tls13: Option<Vec<SupportedCipherSuite>>,
    alpn: Vec<Vec<u8>>,

    min_version: TlsVersion,
    max_version: TlsVersion,

    cache_mode: SessionCacheMode,
    session_timeout: Duration,
    session_tracker: Arc<SessionTracker>,

    client_config: OnceLock<Arc<ClientConfig>>,
    server_config: OnceLock<Arc<ServerConfig>>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("method", &self.method)
            .field("verify_mode", &self.verify_mode)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cache_mode", &self.cache_mode)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Construction
// ============================================================================

impl TlsContext {
    /// Creates a context for the given protocol method.
    ///
    /// Installs the process-wide crypto provider on first use. Defaults:
    /// session caching enabled on both sides with a 300 second timeout;
    /// clients verify the peer, servers request no client certificate; the
    /// version range is clamped to a single version for version-fixing
    /// methods.
    ///
    /// Construction does not fail, but a context built from a method the
    /// record layer cannot serve (DTLS) stores its error for inspection via
    /// [`TlsContext::error`] and derives no engines.
    pub fn new(method: TlsMethod) -> Self {
        let (min_version, max_version) = match method.fixed_version() {
            Some(v) => (v, v),
            None => (TlsVersion::Tls12, TlsVersion::Tls13),
        };

        let error = method.is_datagram().then(|| {
            warn!(?method, "datagram methods have no record-layer factory");
            Error::new(ErrorKind::ContextCreateFailed)
        });

        Self {
            method,
            error,
            cert_chain: Vec::new(),
            private_key: None,
            roots: RootCertStore::empty(),
            verify_mode: if method.is_client() {
                VerifyMode::Peer
            } else {
                VerifyMode::None
            },
            verify_depth: None,
            verify_callback: None,
            ciphers_tls12: None,
            ciphers_tls13: None,
            alpn: Vec::new(),
            min_version,
            max_version,
            cache_mode: SessionCacheMode::Both,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            session_tracker: Arc::new(SessionTracker::new(SESSION_CACHE_CAPACITY)),
            client_config: OnceLock::new(),
            server_config: OnceLock::new(),
        }
    }

    /// Whether the context initialized successfully.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// The construction error, if the context failed to initialize.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The method this context was created with.
    pub fn method(&self) -> TlsMethod {
        self.method
    }

    fn check_valid(&self) -> Result<(), Error> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::ContextCreateFailed))
        }
    }
}

// ============================================================================
// Certificate and key material
// ============================================================================

impl TlsContext {
    /// Loads the leaf certificate (and any trailing chain certificates) from
    /// a PEM or DER file.
    pub fn load_certificate(
        &mut self,
        path: impl AsRef<Path>,
        format: FileFormat,
    ) -> Result<(), Error> {
        self.check_valid()?;
        let chain = read_certificates(path.as_ref(), format, ErrorKind::CertificateLoadFailed)?;
        debug!(count = chain.len(), "loaded certificate");
        self.cert_chain = chain;
        self.check_key_matches_certificate()
    }

    /// Loads a full PEM certificate chain, leaf first.
    pub fn load_certificate_chain(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.load_certificate(path, FileFormat::Pem)
    }

    /// Loads the private key from a PEM or DER file.
    ///
    /// When a certificate is already loaded, the key is checked against its
    /// leaf; a mismatch fails with [`ErrorKind::PrivateKeyMismatch`].
    pub fn load_private_key(
        &mut self,
        path: impl AsRef<Path>,
        format: FileFormat,
    ) -> Result<(), Error> {
        self.check_valid()?;
        let key = read_private_key(path.as_ref(), format)?;
        self.private_key = Some(key);
        self.check_key_matches_certificate()
    }

    /// Adds the CA certificates in `path` to the trust store.
    pub fn load_ca_certificate(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.check_valid()?;
        let cas = read_certificates(
            path.as_ref(),
            FileFormat::Pem,
            ErrorKind::CACertificateLoadFailed,
        )?;
        for ca in cas {
            self.roots
                .add(ca)
                .map_err(|e| Error::with_tls(ErrorKind::CACertificateLoadFailed, e))?;
        }
        Ok(())
    }

    /// Adds every parseable certificate file in a directory to the trust
    /// store.
    pub fn load_ca_path(&mut self, dir: impl AsRef<Path>) -> Result<(), Error> {
        self.check_valid()?;
        let entries = std::fs::read_dir(dir.as_ref())
            .map_err(|e| Error::with_io(ErrorKind::CACertificateLoadFailed, e))?;
        let mut added = 0usize;
        for entry in entries {
            let entry = entry.map_err(|e| Error::with_io(ErrorKind::CACertificateLoadFailed, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match read_certificates(&path, FileFormat::Pem, ErrorKind::CACertificateLoadFailed) {
                Ok(cas) => {
                    for ca in cas {
                        if self.roots.add(ca).is_ok() {
                            added += 1;
                        }
                    }
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping unparseable CA file");
                }
            }
        }
        if added == 0 {
            return Err(Error::new(ErrorKind::CACertificateLoadFailed));
        }
        debug!(added, "loaded CA directory");
        Ok(())
    }

    /// Trusts the bundled Mozilla root certificates.
    pub fn use_default_ca(&mut self) -> Result<(), Error> {
        self.check_valid()?;
        self.roots
            .extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Ok(())
    }

    fn check_key_matches_certificate(&self) -> Result<(), Error> {
        let (Some(key), Some(_leaf)) = (&self.private_key, self.cert_chain.first()) else {
            return Ok(());
        };
        let signer = provider()
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|e| Error::with_tls(ErrorKind::PrivateKeyLoadFailed, e))?;
        let certified = rustls::sign::CertifiedKey::new(self.cert_chain.clone(), signer);
        certified
            .keys_match()
            .map_err(|e| Error::with_tls(ErrorKind::PrivateKeyMismatch, e))
    }
}

// ============================================================================
// Verification policy
// ============================================================================

impl TlsContext {
    /// Sets the peer verification mode and an optional per-certificate
    /// callback.
    ///
    /// The callback wraps the built-in verifier: it receives the built-in
    /// verdict plus a [`VerifyContext`] and has the final say. It is ignored
    /// under [`VerifyMode::None`].
    pub fn set_verify_mode(&mut self, mode: VerifyMode, callback: Option<VerifyCallback>) {
        self.verify_mode = mode;
        self.verify_callback = callback;
    }

    /// Caps the accepted certificate chain length (leaf plus intermediates).
    pub fn set_verify_depth(&mut self, depth: usize) {
        self.verify_depth = Some(depth);
    }
}

// ============================================================================
// Cipher suites, ALPN, versions, session cache
// ============================================================================

impl TlsContext {
    /// Restricts the TLS 1.2 cipher suites to the named ones.
    ///
    /// Names are IANA cipher suite names separated by `:` or `,`; unknown
    /// names are skipped. Fails if no name matches a supported suite.
    pub fn set_ciphers(&mut self, list: &str) -> Result<(), Error> {
        self.check_valid()?;
        let suites = parse_cipher_names(list, false);
        if suites.is_empty() {
            return Err(Error::new(ErrorKind::Unknown));
        }
        self.ciphers_tls12 = Some(suites);
        Ok(())
    }

    /// Restricts the TLS 1.3 cipher suites to the named ones.
    ///
    /// Accepts IANA names with or without the record-layer's `TLS13_` prefix.
    pub fn set_ciphersuites(&mut self, list: &str) -> Result<(), Error> {
        self.check_valid()?;
        let suites = parse_cipher_names(list, true);
        if suites.is_empty() {
            return Err(Error::new(ErrorKind::Unknown));
        }
        self.ciphers_tls13 = Some(suites);
        Ok(())
    }

    /// Sets the ALPN protocol list, most preferred first.
    ///
    /// The wire form is a length-prefixed concatenation (`len:u8 || bytes`);
    /// entries longer than 255 bytes cannot be encoded and are skipped.
    pub fn set_alpn_protocols<I, P>(&mut self, protocols: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.check_valid()?;
        self.alpn.clear();
        for proto in protocols {
            let bytes = proto.as_ref();
            if bytes.len() > u8::MAX as usize {
                warn!(len = bytes.len(), "skipping oversized ALPN entry");
                continue;
            }
            self.alpn.push(bytes.to_vec());
        }
        Ok(())
    }

    /// Sets the minimum negotiated protocol version.
    pub fn set_min_protocol_version(&mut self, version: TlsVersion) {
        self.min_version = version;
    }

    /// Sets the maximum negotiated protocol version.
    pub fn set_max_protocol_version(&mut self, version: TlsVersion) {
        self.max_version = version;
    }

    /// Selects which sides cache sessions for resumption.
    pub fn set_session_cache_mode(&mut self, mode: SessionCacheMode) {
        self.cache_mode = mode;
    }

    /// Sets the session lifetime hint for cached sessions.
    pub fn set_session_timeout(&mut self, timeout: Duration) {
        self.session_timeout = timeout;
    }

    /// The configured session lifetime hint.
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// The session handle cached under `server_name`, if the record layer
    /// has stored one.
    pub(crate) fn cached_session(&self, server_name: &str) -> Option<TlsSession> {
        self.session_tracker.lookup(server_name)
    }
}

// ============================================================================
// Config derivation (frozen on first use)
// ============================================================================

impl TlsContext {
    fn versions(&self) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, Error> {
        if self.min_version > self.max_version {
            return Err(Error::new(ErrorKind::ContextCreateFailed));
        }
        let mut versions = Vec::new();
        if self.min_version <= TlsVersion::Tls12 && self.max_version >= TlsVersion::Tls12 {
            versions.push(&rustls::version::TLS12);
        }
        if self.max_version >= TlsVersion::Tls13 {
            versions.push(&rustls::version::TLS13);
        }
        Ok(versions)
    }

    fn effective_provider(&self) -> Arc<CryptoProvider> {
        if self.ciphers_tls12.is_none() && self.ciphers_tls13.is_none() {
            return provider();
        }
        let base = provider();
        let mut suites: Vec<SupportedCipherSuite> = Vec::new();
        match &self.ciphers_tls13 {
            Some(list) => suites.extend(list.iter().copied()),
            None => suites.extend(
                base.cipher_suites
                    .iter()
                    .copied()
                    .filter(|s| matches!(s, SupportedCipherSuite::Tls13(_))),
            ),
        }
        match &self.ciphers_tls12 {
            Some(list) => suites.extend(list.iter().copied()),
            None => suites.extend(
                base.cipher_suites
                    .iter()
                    .copied()
                    .filter(|s| matches!(s, SupportedCipherSuite::Tls12(_))),
            ),
        }
        Arc::new(CryptoProvider {
            cipher_suites: suites,
            ..(*base).clone()
        })
    }

    /// Derives (and caches) the client configuration.
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        self.check_valid()?;
        if let Some(config) = self.client_config.get() {
            return Ok(config.clone());
        }
        let built = self.build_client_config()?;
        Ok(self.client_config.get_or_init(|| built).clone())
    }

    /// Derives (and caches) the server configuration.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        self.check_valid()?;
        if let Some(config) = self.server_config.get() {
            return Ok(config.clone());
        }
        let built = self.build_server_config()?;
        Ok(self.server_config.get_or_init(|| built).clone())
    }

    fn build_client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        let provider = self.effective_provider();
        let versions = self.versions()?;
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)
            .map_err(|e| Error::with_tls(ErrorKind::ContextCreateFailed, e))?;

        let builder = match self.verify_mode {
            VerifyMode::None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier::new(&provider))),
            _ => {
                let inner = WebPkiServerVerifier::builder_with_provider(
                    Arc::new(self.roots.clone()),
                    provider,
                )
                .build()
                .map_err(|e| {
                    Error::with_tls(ErrorKind::CACertificateLoadFailed, rustls::Error::General(e.to_string()))
                })?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(CallbackServerVerifier {
                        inner,
                        callback: self.verify_callback.clone(),
                        max_depth: self.verify_depth,
                    }))
            }
        };

        let mut config = match (&self.private_key, self.cert_chain.is_empty()) {
            (Some(key), false) => builder
                .with_client_auth_cert(self.cert_chain.clone(), key.clone_key())
                .map_err(|e| Error::with_tls(ErrorKind::PrivateKeyMismatch, e))?,
            _ => builder.with_no_client_auth(),
        };

        config.alpn_protocols = self.alpn.clone();
        if matches!(
            self.cache_mode,
            SessionCacheMode::Off | SessionCacheMode::Server
        ) {
            config.resumption = Resumption::disabled();
        } else {
            // Route resumption through the tracking store so per-connection
            // session handles can observe what was cached.
            config.resumption = Resumption::store(self.session_tracker.clone());
        }
        Ok(Arc::new(config))
    }

    fn build_server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        let provider = self.effective_provider();
        let versions = self.versions()?;
        let builder = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)
            .map_err(|e| Error::with_tls(ErrorKind::ContextCreateFailed, e))?;

        let builder = match self.verify_mode {
            VerifyMode::None => builder.with_no_client_auth(),
            mode => {
                let roots = Arc::new(self.roots.clone());
                let verifier_builder = WebPkiClientVerifier::builder(roots);
                let verifier_builder = if mode == VerifyMode::FailIfNoPeerCert {
                    verifier_builder
                } else {
                    verifier_builder.allow_unauthenticated()
                };
                let inner = verifier_builder.build().map_err(|e| {
                    Error::with_tls(ErrorKind::CACertificateLoadFailed, rustls::Error::General(e.to_string()))
                })?;
                builder.with_client_cert_verifier(Arc::new(CallbackClientVerifier {
                    inner,
                    callback: self.verify_callback.clone(),
                    max_depth: self.verify_depth,
                }))
            }
        };

        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::PrivateKeyLoadFailed))?;
        if self.cert_chain.is_empty() {
            return Err(Error::new(ErrorKind::CertificateLoadFailed));
        }
        let mut config = builder
            .with_single_cert(self.cert_chain.clone(), key.clone_key())
            .map_err(|e| Error::with_tls(ErrorKind::PrivateKeyMismatch, e))?;

        config.alpn_protocols = self.alpn.clone();
        if matches!(
            self.cache_mode,
            SessionCacheMode::Off | SessionCacheMode::Client
        ) {
            config.session_storage = Arc::new(NoServerSessionStorage {});
            config.send_tls13_tickets = 0;
        } else {
            config.session_storage = ServerSessionMemoryCache::new(SESSION_CACHE_CAPACITY);
        }
        Ok(Arc::new(config))
    }
}

// ============================================================================
// File loading
// ============================================================================

fn read_certificates(
    path: &Path,
    format: FileFormat,
    kind: ErrorKind,
) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::with_io(kind, e))?;
    let chain = match format {
        FileFormat::Pem => certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::with_io(kind, e))?,
        FileFormat::Der => {
            let bytes = std::fs::read(path).map_err(|e| Error::with_io(kind, e))?;
            vec![CertificateDer::from(bytes)]
        }
    };
    if chain.is_empty() {
        return Err(Error::new(kind));
    }
    Ok(chain)
}

fn read_private_key(path: &Path, format: FileFormat) -> Result<PrivateKeyDer<'static>, Error> {
    match format {
        FileFormat::Pem => {
            let file =
                File::open(path).map_err(|e| Error::with_io(ErrorKind::PrivateKeyLoadFailed, e))?;
            private_key(&mut BufReader::new(file))
                .map_err(|e| Error::with_io(ErrorKind::PrivateKeyLoadFailed, e))?
                .ok_or_else(|| Error::new(ErrorKind::PrivateKeyLoadFailed))
        }
        FileFormat::Der => {
            let bytes =
                std::fs::read(path).map_err(|e| Error::with_io(ErrorKind::PrivateKeyLoadFailed, e))?;
            PrivateKeyDer::try_from(bytes)
                .map_err(|msg| Error::with_tls(ErrorKind::PrivateKeyLoadFailed, rustls::Error::General(msg.to_string())))
        }
    }
}

// ============================================================================
// Cipher suite name parsing
// ============================================================================

fn parse_cipher_names(list: &str, tls13: bool) -> Vec<SupportedCipherSuite> {
    let base = provider();
    list.split([':', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| {
            let found = base.cipher_suites.iter().copied().find(|s| {
                matches!(s, SupportedCipherSuite::Tls13(_)) == tls13
                    && cipher_name_matches(*s, name)
            });
            if found.is_none() {
                warn!(name, "unknown cipher suite name, skipping");
            }
            found
        })
        .collect()
}

fn cipher_name_matches(suite: SupportedCipherSuite, name: &str) -> bool {
    let rustls_name = format!("{:?}", suite.suite());
    // TLS 1.3 suites are named TLS13_* by the record layer but TLS_* by IANA.
    rustls_name == name || rustls_name.replacen("TLS13_", "TLS_", 1) == name
}

/// Encodes an ALPN protocol list into its wire form: `len:u8 || bytes` per
/// entry, concatenated. Oversized entries are skipped.
pub(crate) fn encode_alpn<'a>(protocols: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols {
        if proto.len() > u8::MAX as usize {
            continue;
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto);
    }
    wire
}

// ============================================================================
// Verifiers
// ============================================================================

// Accepts any server certificate. Installed only under VerifyMode::None.
#[derive(Debug)]
struct AcceptAllVerifier {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAllVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

// Runs the webpki verifier, enforces the optional depth ceiling, then gives
// the application callback the final say.
struct CallbackServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    callback: Option<VerifyCallback>,
    max_depth: Option<usize>,
}

impl fmt::Debug for CallbackServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackServerVerifier")
            .field("has_callback", &self.callback.is_some())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn depth_exceeded(max_depth: Option<usize>, intermediates: &[CertificateDer<'_>]) -> bool {
    max_depth.is_some_and(|depth| intermediates.len() + 1 > depth)
}

fn consult_callback(
    callback: &Option<VerifyCallback>,
    pre: Result<(), rustls::Error>,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    server_name: Option<String>,
) -> Result<(), rustls::Error> {
    let Some(callback) = callback else {
        return pre;
    };
    let report = VerifyContext {
        end_entity,
        intermediates,
        server_name,
        error: pre.as_ref().err(),
    };
    if callback(pre.is_ok(), &report) {
        Ok(())
    } else {
        Err(pre.err().unwrap_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        )))
    }
}

impl ServerCertVerifier for CallbackServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let pre = if depth_exceeded(self.max_depth, intermediates) {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        } else {
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ())
        };
        let name = match server_name {
            ServerName::DnsName(dns) => Some(dns.as_ref().to_string()),
            other => Some(format!("{other:?}")),
        };
        consult_callback(&self.callback, pre, end_entity, intermediates, name)
            .map(|()| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// Server-side analog of CallbackServerVerifier for client certificates.
struct CallbackClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    callback: Option<VerifyCallback>,
    max_depth: Option<usize>,
}

impl fmt::Debug for CallbackClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackClientVerifier")
            .field("has_callback", &self.callback.is_some())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl ClientCertVerifier for CallbackClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let pre = if depth_exceeded(self.max_depth, intermediates) {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        } else {
            self.inner
                .verify_client_cert(end_entity, intermediates, now)
                .map(|_| ())
        };
        consult_callback(&self.callback, pre, end_entity, intermediates, None)
            .map(|()| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
