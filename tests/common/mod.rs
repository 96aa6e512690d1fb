#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tlscomm::{FileFormat, TlsContext, TlsMethod, VerifyMode};

/// Guard holding the temporary certificate files; they are deleted on drop.
pub struct CertFixture {
    pub cert_file: NamedTempFile,
    pub key_file: NamedTempFile,
}

/// Generates a self-signed certificate for the given DNS names and writes
/// cert and key to temporary PEM files.
pub fn generate_certs(names: &[&str]) -> CertFixture {
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();

    let mut cert_file = NamedTempFile::new().unwrap();
    cert_file
        .write_all(certified.cert.pem().as_bytes())
        .unwrap();
    cert_file.flush().unwrap();

    let mut key_file = NamedTempFile::new().unwrap();
    key_file
        .write_all(certified.key_pair.serialize_pem().as_bytes())
        .unwrap();
    key_file.flush().unwrap();

    CertFixture {
        cert_file,
        key_file,
    }
}

/// Server context using the fixture's certificate and key.
pub fn server_ctx(fixture: &CertFixture) -> Arc<TlsContext> {
    let mut ctx = TlsContext::new(TlsMethod::TlsServer);
    ctx.load_certificate(fixture.cert_file.path(), FileFormat::Pem)
        .unwrap();
    ctx.load_private_key(fixture.key_file.path(), FileFormat::Pem)
        .unwrap();
    Arc::new(ctx)
}

/// Client context trusting the fixture's (self-signed) certificate.
pub fn client_ctx(fixture: &CertFixture) -> Arc<TlsContext> {
    let mut ctx = TlsContext::new(TlsMethod::TlsClient);
    ctx.set_verify_mode(VerifyMode::Peer, None);
    ctx.load_ca_certificate(fixture.cert_file.path()).unwrap();
    Arc::new(ctx)
}
