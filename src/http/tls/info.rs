//! Negotiated TLS session details

use super::cert::{get_cert_chain, CertInfo};
use openssl::ssl::{NameType, SslRef};
use openssl::x509::X509VerifyResult;

/// What a completed handshake negotiated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub version: String,
    /// Negotiated cipher suite
    pub cipher: String,
    /// SNI servername sent by the client
    pub servername: Option<String>,
    /// Protocol selected through ALPN, if any
    pub alpn: Option<String>,
    /// Peer certificate chain, leaf first
    pub cert_chain: Vec<CertInfo>,
    /// Chain verification outcome, when it did not pass
    pub verify_error: Option<String>,
}

impl TlsInfo {
    /// Collect details from an established SSL connection
    pub fn from_ssl(ssl: &SslRef) -> Self {
        let verify = ssl.verify_result();

        TlsInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).to_string()),
            cert_chain: get_cert_chain(ssl),
            verify_error: (verify != X509VerifyResult::OK)
                .then(|| verify.error_string().to_string()),
        }
    }

    /// The negotiated application protocol
    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    /// Whether HTTP/2 was negotiated
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some("h2")
    }

    /// The peer's own certificate
    pub fn peer_cert(&self) -> Option<&CertInfo> {
        self.cert_chain.first()
    }
}
