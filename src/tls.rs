//! TLS client configuration for ldaps:// connections and StartTLS upgrades.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, SignatureScheme};
use rustls_pki_types::ServerName;
use std::fs;
use std::sync::Arc;

/// URI scheme of an LDAP server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdapScheme {
    Plain,
    Tls,
}

impl LdapScheme {
    pub fn default_port(&self) -> u16 {
        match self {
            LdapScheme::Plain => 389,
            LdapScheme::Tls => 636,
        }
    }
}

/// Parse "ldap://host[:port]" or "ldaps://host[:port]".
pub fn parse_ldap_uri(uri: &str) -> Result<(LdapScheme, String, u16)> {
    let (scheme, rest) = if let Some(rest) = uri.strip_prefix("ldaps://") {
        (LdapScheme::Tls, rest)
    } else if let Some(rest) = uri.strip_prefix("ldap://") {
        (LdapScheme::Plain, rest)
    } else {
        anyhow::bail!("Invalid LDAP URI scheme: {}", uri);
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        anyhow::bail!("No host in URI: {}", uri);
    }
    match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .with_context(|| format!("Invalid port in URI: {}", uri))?;
            Ok((scheme, host.to_string(), port))
        }
        None => Ok((scheme, rest.to_string(), scheme.default_port())),
    }
}

/// Owned ServerName for the TLS handshake SNI.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .with_context(|| format!("Invalid TLS server name: {}", host))
}

/// Build the TLS client config: system roots, plus an optional extra CA
/// bundle, or certificate verification disabled entirely.
pub fn client_config(skip_verify: bool, extra_ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    if skip_verify {
        return client_config_insecure();
    }
    let pem = match extra_ca_file {
        Some(path) => Some(fs::read(path).with_context(|| format!("Open CA file: {}", path))?),
        None => None,
    };
    client_config_with_ca(pem.as_deref())
}

fn system_root_store() -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    Ok(root_store)
}

fn client_config_with_ca(extra_ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let mut root_store = system_root_store()?;
    if let Some(pem) = extra_ca_pem {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert = cert.map_err(|e| anyhow::anyhow!("Parse CA PEM: {}", e))?;
            let _ = root_store.add(cert);
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client config that skips server certificate verification (lab and
/// self-signed deployments).
fn client_config_insecure() -> Result<Arc<ClientConfig>> {
    let root_store = system_root_store()?;
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_uri_with_port() {
        let (scheme, host, port) = parse_ldap_uri("ldap://dc01.example.com:3268").unwrap();
        assert_eq!(scheme, LdapScheme::Plain);
        assert_eq!(host, "dc01.example.com");
        assert_eq!(port, 3268);
    }

    #[test]
    fn parses_tls_uri_with_default_port() {
        let (scheme, host, port) = parse_ldap_uri("ldaps://dc01.example.com").unwrap();
        assert_eq!(scheme, LdapScheme::Tls);
        assert_eq!(host, "dc01.example.com");
        assert_eq!(port, 636);
    }

    #[test]
    fn default_plain_port_is_389() {
        let (_, _, port) = parse_ldap_uri("ldap://dc01/").unwrap();
        assert_eq!(port, 389);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(parse_ldap_uri("http://x").is_err());
        assert!(parse_ldap_uri("ldap://").is_err());
        assert!(parse_ldap_uri("ldap://host:notaport").is_err());
    }

    #[test]
    fn server_name_accepts_hostname_and_ip() {
        assert!(server_name("dc01.example.com").is_ok());
        assert!(server_name("10.0.0.5").is_ok());
        assert!(server_name("bad host name").is_err());
    }
}
