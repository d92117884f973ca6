//! TLS configuration
//!
//! Builders for the client side (the probe) and the server side (loopback
//! targets in tests). Builders only collect settings; the OpenSSL context is
//! created in `build()`, so every OpenSSL failure surfaces as a `TlsError`.

use super::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use openssl::pkey::PKey;
use openssl::ssl::{AlpnError, SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" | "1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" | "1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// Encode protocol names as an ALPN wire list (length-prefixed)
pub(crate) fn encode_alpn(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    if protocols.is_empty() {
        return Err(TlsError::InvalidConfig("Empty ALPN protocol list".to_string()));
    }

    let mut wire = Vec::new();
    for proto in protocols {
        if proto.is_empty() || proto.len() > 255 {
            return Err(TlsError::InvalidConfig(format!(
                "Invalid ALPN protocol name: {:?}",
                proto
            )));
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Iterate the protocol names of an ALPN wire list
fn alpn_entries(wire: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        let len = *wire.get(pos)? as usize;
        let entry = wire.get(pos + 1..pos + 1 + len)?;
        pos += 1 + len;
        Some(entry)
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    let mut pem = Vec::new();
    File::open(path)?.read_to_end(&mut pem)?;
    Ok(pem)
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
    pub(crate) handshake_timeout: Option<Duration>,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Create a new server configuration builder
    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// SNI / verification name of a client configuration
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// Whether the peer certificate chain is verified
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout
    }

    /// Run the client handshake on an already-connected socket
    pub fn connect(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self.clone())
    }

    /// Run the server handshake on an accepted socket
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self.clone())
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Vec<u8>,
    servername: Option<String>,
    verify_peer: bool,
    ca_file: Option<PathBuf>,
    ca_pem: Vec<Vec<u8>>,
    handshake_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    fn new() -> Self {
        ClientConfigBuilder {
            min_version: None,
            max_version: None,
            alpn: Vec::new(),
            servername: None,
            verify_peer: true,
            ca_file: None,
            ca_pem: Vec::new(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set ALPN protocols, in order of preference
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        self.alpn = encode_alpn(protocols)?;
        Ok(self)
    }

    /// Set the SNI servername, also used for hostname verification
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trust the CA certificates in a PEM file instead of the system store
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Trust a PEM-encoded CA certificate held in memory
    pub fn ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_pem.push(pem.into());
        self
    }

    /// Bound the handshake duration; `None` waits indefinitely
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;

        if let Some(min) = self.min_version {
            ctx_builder.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            ctx_builder.set_max_proto_version(Some(max.to_openssl_version()))?;
        }

        if !self.alpn.is_empty() {
            ctx_builder.set_alpn_protos(&self.alpn)?;
        }

        if self.verify_peer {
            ctx_builder.set_verify(SslVerifyMode::PEER);

            let custom_trust = self.ca_file.is_some() || !self.ca_pem.is_empty();
            if let Some(path) = &self.ca_file {
                ctx_builder.set_ca_file(path)?;
            }
            for pem in &self.ca_pem {
                let cert = X509::from_pem(pem)
                    .map_err(|e| TlsError::Certificate(format!("Failed to load CA: {}", e)))?;
                ctx_builder.cert_store_mut().add_cert(cert)?;
            }
            if !custom_trust {
                ctx_builder.set_default_verify_paths()?;
            }
        } else {
            warn!("TLS peer verification disabled");
            ctx_builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(TlsConfig {
            ctx: ctx_builder.build(),
            is_server: false,
            servername: self.servername,
            verify_peer: self.verify_peer,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// Server configuration builder
pub struct ServerConfigBuilder {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    alpn: Option<Vec<Vec<u8>>>,
    cert_pem: Option<Vec<u8>>,
    handshake_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    fn new() -> Self {
        ServerConfigBuilder {
            min_version: None,
            max_version: None,
            alpn: None,
            cert_pem: None,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Set the protocols the server will select from
    ///
    /// The first client protocol that appears in this list wins. If none
    /// match, the server continues the handshake without ALPN.
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        encode_alpn(protocols)?;
        self.alpn = Some(protocols.iter().map(|p| p.as_bytes().to_vec()).collect());
        Ok(self)
    }

    /// Load server certificate and private key from one PEM file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        self.cert_pem = Some(read_pem(path.as_ref())?);
        Ok(self)
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the TLS configuration
    ///
    /// Without a certificate file the built-in self-signed certificate
    /// for `example.com` is used.
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_server())?;

        if let Some(min) = self.min_version {
            ctx_builder.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            ctx_builder.set_max_proto_version(Some(max.to_openssl_version()))?;
        }

        let pem = self
            .cert_pem
            .unwrap_or_else(|| super::builtin_cert::BUILTIN_CERT.as_bytes().to_vec());
        let cert = X509::from_pem(&pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        ctx_builder.set_certificate(&cert)?;
        let key = PKey::private_key_from_pem(&pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        ctx_builder.set_private_key(&key)?;

        if let Some(protocols) = self.alpn {
            ctx_builder.set_alpn_select_callback(move |_ssl, client_protos| {
                for proto in &protocols {
                    if let Some(found) =
                        alpn_entries(client_protos).find(|entry| *entry == proto.as_slice())
                    {
                        return Ok(found);
                    }
                }
                Err(AlpnError::NOACK)
            });
        }

        Ok(TlsConfig {
            ctx: ctx_builder.build(),
            is_server: true,
            servername: None,
            verify_peer: false,
            handshake_timeout: self.handshake_timeout,
        })
    }
}
