//! TLS configuration: certificate loading for listeners and client
//! configuration for dialing.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::Item;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::error::{Error, Result};

/// Read every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("open certificate {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("read certificate {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Read the first PKCS#8, RSA or SEC1 private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("open private key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::Tls(format!("read private key {}: {}", path.display(), e)))?;
        match item {
            Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) | Some(Item::ECKey(key)) => {
                return Ok(PrivateKey(key));
            }
            Some(_) => continue,
            None => {
                return Err(Error::Tls(format!("no private key found in {}", path.display())));
            }
        }
    }
}

/// Acceptor for a listener serving `cert` with `key`
pub fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| Error::Tls(format!("server configuration: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector verifying servers against the webpki roots, or accepting any
/// certificate when `insecure_skip_verify` is set.
pub fn connector(insecure_skip_verify: bool) -> TlsConnector {
    let builder = ClientConfig::builder().with_safe_defaults();
    let config = if insecure_skip_verify {
        warn!("TLS server certificate verification is disabled");
        builder
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Server name to present for `host` (bare, without IPv6 brackets)
pub fn server_name(host: &str) -> Result<ServerName> {
    ServerName::try_from(host).map_err(|e| Error::Tls(format!("invalid server name {}: {}", host, e)))
}

struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("sipflow-tls-{}-{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_generated_pair() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = write_temp("cert.pem", &cert.serialize_pem().unwrap());
        let key_path = write_temp("key.pem", &cert.serialize_private_key_pem());

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        load_private_key(&key_path).unwrap();
        acceptor(&cert_path, &key_path).unwrap();

        // A certificate file holds no key.
        assert!(load_private_key(&cert_path).is_err());
        assert!(load_certs(&key_path).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
