//! Peer certificate details
//!
//! Subject, issuer and subject alternative names of the certificates a
//! server presented, for display after the handshake.

use openssl::nid::Nid;
use openssl::ssl::SslRef;
use openssl::x509::{X509NameRef, X509Ref};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
        }
    }

    /// Whether the certificate is self-issued
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

impl fmt::Display for CertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject={} issuer={}", self.subject, self.issuer)?;
        if !self.subject_alt_names.is_empty() {
            write!(f, " san=[{}]", self.subject_alt_names.join(", "))?;
        }
        Ok(())
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };

    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            let ip = name.ipaddress()?;
            let addr = match ip.len() {
                4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(ip);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                _ => return None,
            };
            Some(format!("IP:{}", addr))
        })
        .collect()
}

/// Certificates presented by the peer, leaf first
pub fn get_cert_chain(ssl: &SslRef) -> Vec<CertInfo> {
    if let Some(chain) = ssl.peer_cert_chain() {
        if chain.len() > 0 {
            return chain.iter().map(CertInfo::from_x509).collect();
        }
    }

    ssl.peer_certificate()
        .map(|cert| vec![CertInfo::from_x509(&cert)])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::builtin_cert::BUILTIN_CERT;
    use openssl::x509::{X509NameBuilder, X509};

    #[test]
    fn test_cert_info_from_builtin() {
        let cert = X509::from_pem(BUILTIN_CERT.as_bytes()).unwrap();
        let info = CertInfo::from_x509(&cert);

        assert_eq!(info.subject, "example.com");
        assert_eq!(info.issuer, "example.com");
        assert!(info.is_self_issued());
        assert_eq!(
            info.subject_alt_names,
            vec!["DNS:example.com".to_string(), "DNS:*.example.com".to_string()]
        );
    }

    #[test]
    fn test_common_name_keeps_every_byte() {
        let mut builder = X509NameBuilder::new().unwrap();
        builder
            .append_entry_by_nid(Nid::COMMONNAME, "example.com\0.attacker.test")
            .unwrap();
        let name = builder.build();
        assert_eq!(common_name(&name), "example.com\u{0}.attacker.test");

        let empty = X509NameBuilder::new().unwrap().build();
        assert_eq!(common_name(&empty), "<undef>");
    }

    #[test]
    fn test_display() {
        let info = CertInfo {
            subject: "www.google.com".to_string(),
            issuer: "WR2".to_string(),
            subject_alt_names: vec!["DNS:www.google.com".to_string()],
        };
        assert_eq!(
            info.to_string(),
            "subject=www.google.com issuer=WR2 san=[DNS:www.google.com]"
        );
    }
}
