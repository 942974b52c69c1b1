//! TLS/SSL handling for the SSTP transport
//!
//! The engine only needs [`TlsTerminal`]: an async byte stream that can also
//! hand out the server certificate for crypto binding. [`TlsConfig`] builds
//! the rustls client configuration from [`ServerConfig`].

use crate::config::ServerConfig;
use crate::error::{Result, VpnError};
use log::{debug, info};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Byte stream over a secure socket, plus the peer certificate
pub trait TlsTerminal: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// DER encoding of the server's end-entity certificate
    fn peer_certificate(&self) -> Option<Vec<u8>>;
}

impl TlsTerminal for TlsStream<TcpStream> {
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        let (_, connection) = self.get_ref();
        connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }
}

/// Certificate verifier that accepts any server certificate but still checks
/// handshake signatures against it
#[derive(Debug)]
struct AcceptAllVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// Prioritize ring if both features are enabled (for CI --all-features)
#[cfg(feature = "ring-crypto")]
fn default_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-crypto", not(feature = "ring-crypto")))]
fn default_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>> {
    if names.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }
    names
        .iter()
        .map(|name| match name.as_str() {
            "1.2" => Ok(&rustls::version::TLS12),
            "1.3" => Ok(&rustls::version::TLS13),
            other => Err(VpnError::Config(format!("Unsupported TLS version '{other}'"))),
        })
        .collect()
}

/// Restricts the provider to the named cipher suites
fn restrict_cipher_suites(provider: &mut CryptoProvider, names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    for name in names {
        if !provider
            .cipher_suites
            .iter()
            .any(|suite| format!("{:?}", suite.suite()) == *name)
        {
            return Err(VpnError::Config(format!("Unknown cipher suite '{name}'")));
        }
    }
    provider
        .cipher_suites
        .retain(|suite| names.contains(&format!("{:?}", suite.suite())));
    Ok(())
}

fn root_store(ca_certificate_path: Option<&str>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_certificate_path {
        let file = File::open(path)
            .map_err(|e| VpnError::Config(format!("Cannot open certificate file: {e}")))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VpnError::Config(format!("Invalid certificate: {e}")))?;
        if certs.is_empty() {
            return Err(VpnError::Config(format!("No certificates found in {path}")));
        }
        for cert in certs {
            root_store.add(cert)?;
        }
        debug!("Loaded custom CA bundle from {path}");
    }
    Ok(root_store)
}

/// TLS configuration for VPN connections
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let mut provider = default_provider();
        restrict_cipher_suites(&mut provider, &server.cipher_suites)?;
        let algorithms = provider.signature_verification_algorithms;
        let provider = Arc::new(provider);
        let versions = protocol_versions(&server.tls_versions)?;

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)?;

        let client_config = if server.verify_certificate {
            let roots = Arc::new(root_store(server.ca_certificate_path.as_deref())?);
            let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| VpnError::Tls(format!("Verifier setup failed: {e}")))?;
            builder
                .with_webpki_verifier(verifier)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier { algorithms }))
                .with_no_client_auth()
        };

        Ok(Self {
            client_config: Arc::new(client_config),
        })
    }

    /// Get the client configuration
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Open a TCP connection and run the TLS handshake
    pub async fn connect(&self, hostname: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| VpnError::Network(format!("Invalid hostname: {e}")))?;

        let tcp_stream = TcpStream::connect((hostname, port))
            .await
            .map_err(|e| VpnError::Network(format!("TCP connection failed: {e}")))?;
        tcp_stream.set_nodelay(true)?;

        let stream = TlsConnector::from(self.client_config())
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| VpnError::Tls(format!("TLS handshake failed: {e}")))?;

        let (_, connection) = stream.get_ref();
        info!(
            "TLS established with {hostname}:{port} ({:?}, {:?})",
            connection.protocol_version(),
            connection.negotiated_cipher_suite().map(|s| s.suite())
        );
        Ok(stream)
    }
}
