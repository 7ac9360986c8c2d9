//! # TLS Configuration
//!
//! Certificate and key loading plus rustls configs for every secure transport.
//!
//! - TCP uses [`TlsServerConfig::acceptor`] (TLS 1.2 and 1.3).
//! - QUIC uses [`TlsServerConfig::load_quic_server_config`] (TLS 1.3 only, ALPN
//!   [`ALPN_PROTOCOL`]).
//! - DTLS reads the same PEM files through [`TlsServerConfig::read_pem`].
//!
//! ## Responsibilities
//! - Parse PEM certificate chains and private keys
//! - Build server and client configs on the ring crypto provider
//! - Generate self-signed certificates for development and tests
//!
//! ## Security
//! - Clients verify servers against an explicit root store; there is no
//!   verification bypass
//! - TLS 1.2 is the minimum on TCP

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument};

use crate::config;
use crate::error::{ProtocolError, Result};

/// ALPN identifier negotiated by QUIC endpoints
pub const ALPN_PROTOCOL: &[u8] = b"opwire";

static TCP_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
static QUIC_VERSIONS: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server certificate chain and key on disk
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Certificate pair from the server section, if both paths are set
    pub fn from_server_config(server: &config::ServerConfig) -> Option<Self> {
        match (&server.cert_file, &server.key_file) {
            (Some(cert), Some(key)) => Some(Self::new(cert, key)),
            _ => None,
        }
    }

    /// Generate a self-signed certificate for `localhost` and write both PEM files
    pub fn generate_self_signed<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let generated = generate_self_signed(vec!["localhost".to_string()])?;

        let mut cert_file = File::create(&cert_path)?;
        cert_file.write_all(generated.cert_pem.as_bytes())?;

        let mut key_file = File::create(&key_path)?;
        key_file.write_all(generated.key_pem.as_bytes())?;

        Ok(Self::new(cert_path, key_path))
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Raw PEM text of the certificate chain and key
    pub fn read_pem(&self) -> Result<(String, String)> {
        let cert = std::fs::read_to_string(&self.cert_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to read cert file: {e}")))?;
        let key = std::fs::read_to_string(&self.key_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to read key file: {e}")))?;
        Ok((cert, key))
    }

    /// Parse the certificate chain and private key
    pub fn load_certified_key(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_chain = load_certs(&self.cert_path)?;

        let key_file = File::open(&self.key_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| ProtocolError::TlsError(format!("Failed to parse private key: {e}")))?
            .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))?;

        Ok((cert_chain, key))
    }

    /// rustls config for TLS over TCP
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        self.build_server_config(TCP_VERSIONS)
    }

    /// rustls config for QUIC: TLS 1.3 with the opwire ALPN
    pub fn load_quic_server_config(&self, allow_0rtt: bool) -> Result<ServerConfig> {
        let mut config = self.build_server_config(QUIC_VERSIONS)?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        if allow_0rtt {
            // QUIC only accepts 0 or u32::MAX here
            config.max_early_data_size = u32::MAX;
        }
        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }

    fn build_server_config(&self, versions: &[&'static SupportedProtocolVersion]) -> Result<ServerConfig> {
        let (cert_chain, key) = self.load_certified_key()?;
        debug!(
            certs = cert_chain.len(),
            path = %self.cert_path.display(),
            "Loaded server certificate"
        );

        ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(versions)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }
}

/// Client-side trust settings
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    root_files: Vec<PathBuf>,
    roots: Vec<CertificateDer<'static>>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            root_files: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Trust every certificate in a PEM file
    pub fn with_root_cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.root_files.push(path.as_ref().to_path_buf());
        self
    }

    /// Trust one DER certificate
    pub fn with_root_cert(mut self, cert: CertificateDer<'static>) -> Self {
        self.roots.push(cert);
        self
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        let from_files = self
            .root_files
            .iter()
            .map(|path| load_certs(path))
            .collect::<Result<Vec<_>>>()?;

        for cert in from_files.into_iter().flatten().chain(self.roots.iter().cloned()) {
            store.add(cert).map_err(|e| {
                ProtocolError::TlsError(format!("Failed to add cert to root store: {e}"))
            })?;
        }

        if store.is_empty() {
            return Err(ProtocolError::TlsError("No trusted root certificates configured".into()));
        }
        Ok(store)
    }

    fn build_client_config(&self, versions: &[&'static SupportedProtocolVersion]) -> Result<ClientConfig> {
        Ok(ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(versions)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth())
    }

    /// rustls config for TLS over TCP
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        self.build_client_config(TCP_VERSIONS)
    }

    /// rustls config for QUIC
    pub fn load_quic_client_config(&self) -> Result<ClientConfig> {
        let mut config = self.build_client_config(QUIC_VERSIONS)?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        Ok(config)
    }

    pub fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.server_name.as_str())
            .map(|name| name.to_owned())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }

    /// Name as given, for APIs that take a `&str`
    pub fn server_name_str(&self) -> &str {
        &self.server_name
    }
}

/// Connect to a TLS server over TCP
#[instrument(skip(config), fields(address = %addr))]
pub async fn connect(addr: &str, config: &TlsClientConfig) -> Result<ClientTlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(config.load_client_config()?));

    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    connector
        .connect(config.server_name()?, stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))
}

/// Self-signed certificate in PEM and DER form
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// Generate a self-signed certificate for the given subject names
pub fn generate_self_signed(names: Vec<String>) -> Result<SelfSigned> {
    let generated = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ProtocolError::TlsError(format!("Certificate generation error: {e}")))?;

    Ok(SelfSigned {
        cert_pem: generated.cert.pem(),
        key_pem: generated.signing_key.serialize_pem(),
        cert_der: generated.cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            generated.signing_key.serialize_der(),
        )),
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| ProtocolError::TlsError(format!("Failed to parse certificate: {e}")))?;

    if certs.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}
