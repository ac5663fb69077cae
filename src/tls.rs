//! TLS configuration for both connection roles.
//!
//! Clients get a [`TlsConnector`] built from the webpki root set (plus any
//! caller-supplied PEM roots), or with verification disabled for test rigs
//! and self-signed deployments. Servers get a [`TlsAcceptor`] from a
//! PEM-encoded certificate chain and private key.

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::{
        self, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

/// How a client checks the server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Verify the chain against the trust store. The default.
    #[default]
    Full,
    /// Accept any certificate. Self-signed test servers only; the
    /// connection is still encrypted but not authenticated.
    Disabled,
}

/// Server identity: PEM-encoded certificate chain and private key files.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// Path to the PEM certificate chain.
    pub cert_path: PathBuf,
    /// Path to the PEM private key.
    pub key_path: PathBuf,
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// Build a client connector for `verify_mode`, trusting the webpki roots
/// plus any certificates found in `extra_roots` PEM files.
pub fn connector(verify_mode: VerifyMode, extra_roots: &[PathBuf]) -> io::Result<TlsConnector> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| invalid_input(format!("unsupported TLS versions: {e}")))?;

    let config = match verify_mode {
        VerifyMode::Full => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            for path in extra_roots {
                for cert in read_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| invalid_input(format!("bad root certificate: {e}")))?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        VerifyMode::Disabled => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a server acceptor from a PEM identity.
pub fn acceptor(identity: &TlsIdentity) -> io::Result<TlsAcceptor> {
    let certs = read_certs(&identity.cert_path)?;
    let key = rustls_pemfile::private_key(&mut pem_reader(&identity.key_path)?)?
        .ok_or_else(|| invalid_input(format!("no private key in {:?}", identity.key_path)))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| invalid_input(format!("unsupported TLS versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| invalid_input(format!("bad certificate or key: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn pem_reader(path: &Path) -> io::Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

fn read_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut pem_reader(path)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(invalid_input(format!("no certificates in {path:?}")));
    }
    Ok(certs)
}

/// Verifier that waves every certificate through while still checking
/// handshake signatures with the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
