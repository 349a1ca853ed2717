//! TLS assembly for HTTPS, HTTP/2, and WSS endpoints.
//!
//! Certificate material is accepted either as a filesystem path or as a
//! literal PEM string (detected by the `-----` prefix). Assembly follows the
//! managed modes: `auto` uses key+cert only, `manual` additionally honors CA,
//! cipher list, and protocol version, `mutual_tls` requires and verifies
//! client certificates.

use crate::config::{Protocol, SslConfig, SslMode};
use crate::ServeError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::io::BufReader;
use std::sync::Arc;

/// Resolves a certificate field to PEM text: literals pass through
/// unchanged, paths are read from disk. Missing files fail with a clear
/// error.
pub fn pem_material(value: &str) -> Result<String, ServeError> {
    if value.starts_with("-----") {
        return Ok(value.to_string());
    }
    std::fs::read_to_string(value).map_err(|e| {
        ServeError::ConfigInvalid(format!("cannot read certificate file '{}': {}", value, e))
    })
}

/// Loads a certificate chain from a path or PEM literal.
pub fn load_certs(value: &str) -> Result<Vec<CertificateDer<'static>>, ServeError> {
    let pem = pem_material(value)?;
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ServeError::ConfigInvalid(format!("invalid certificate material: {}", e)))?;
    if certs.is_empty() {
        return Err(ServeError::ConfigInvalid(
            "certificate material contains no certificates".into(),
        ));
    }
    Ok(certs)
}

/// Loads a private key from a path or PEM literal.
pub fn load_private_key(value: &str) -> Result<PrivateKeyDer<'static>, ServeError> {
    let pem = pem_material(value)?;
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServeError::ConfigInvalid(format!("invalid private key material: {}", e)))?
        .ok_or_else(|| ServeError::ConfigInvalid("no private key found in material".into()))
}

/// ALPN protocol list for one endpoint protocol.
pub fn alpn_protocols(protocol: Protocol, allow_http1: bool) -> Vec<Vec<u8>> {
    match protocol {
        Protocol::Http2 => {
            if allow_http1 {
                vec![b"h2".to_vec(), b"http/1.1".to_vec()]
            } else {
                vec![b"h2".to_vec()]
            }
        }
        Protocol::Grpc => vec![b"h2".to_vec()],
        _ => vec![b"http/1.1".to_vec()],
    }
}

fn protocol_versions(
    ssl: &SslConfig,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, ServeError> {
    // Version pins apply in manual and mutual modes only.
    if ssl.effective_mode() == SslMode::Auto {
        return Ok(vec![&rustls::version::TLS12, &rustls::version::TLS13]);
    }
    match ssl.secure_protocol.as_deref() {
        None | Some("TLS") => Ok(vec![&rustls::version::TLS12, &rustls::version::TLS13]),
        Some("TLSv1.2") => Ok(vec![&rustls::version::TLS12]),
        Some("TLSv1.3") => Ok(vec![&rustls::version::TLS13]),
        Some(other) => Err(ServeError::ConfigInvalid(format!(
            "unsupported secure_protocol '{}'",
            other
        ))),
    }
}

fn cipher_filtered_provider(ciphers: &str) -> Result<rustls::crypto::CryptoProvider, ServeError> {
    let tokens: Vec<String> = ciphers
        .split([':', ','])
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_uppercase().replace('-', "_"))
        .collect();
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        tokens.iter().any(|t| name.contains(t.as_str()))
    });
    if provider.cipher_suites.is_empty() {
        return Err(ServeError::ConfigInvalid(format!(
            "cipher list '{}' matches no supported suites",
            ciphers
        )));
    }
    Ok(provider)
}

fn root_store(ca: &str) -> Result<Arc<RootCertStore>, ServeError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca)? {
        store
            .add(cert)
            .map_err(|e| ServeError::ConfigInvalid(format!("invalid CA certificate: {}", e)))?;
    }
    Ok(Arc::new(store))
}

/// Assembles a rustls server configuration per the managed SSL modes.
pub fn build_server_config(
    ssl: &SslConfig,
    protocol: Protocol,
) -> Result<Arc<ServerConfig>, ServeError> {
    ssl.validate()?;
    let key_source = ssl
        .key
        .as_deref()
        .ok_or_else(|| ServeError::ConfigInvalid("ssl.key is required".into()))?;
    let cert_source = ssl
        .cert
        .as_deref()
        .ok_or_else(|| ServeError::ConfigInvalid("ssl.cert is required".into()))?;
    let certs = load_certs(cert_source)?;
    let key = load_private_key(key_source)?;
    let versions = protocol_versions(ssl)?;

    let provider = match (&ssl.ciphers, ssl.effective_mode()) {
        (Some(ciphers), SslMode::Manual | SslMode::MutualTls) => {
            Arc::new(cipher_filtered_provider(ciphers)?)
        }
        _ => Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
    };

    let builder = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)
        .map_err(|e| ServeError::ConfigInvalid(format!("TLS configuration rejected: {}", e)))?;

    let mode = ssl.effective_mode();
    let wants_cert = match mode {
        SslMode::MutualTls => true,
        SslMode::Manual => ssl.request_cert == Some(true),
        SslMode::Auto => false,
    };

    let mut config = if wants_cert {
        let ca = ssl
            .ca
            .as_deref()
            .ok_or_else(|| ServeError::ConfigInvalid("ssl.ca is required for client auth".into()))?;
        let roots = root_store(ca)?;
        let verifier_builder = WebPkiClientVerifier::builder(roots);
        let verifier = if ssl.rejects_unauthorized() {
            verifier_builder.build()
        } else {
            verifier_builder.allow_unauthenticated().build()
        }
        .map_err(|e| ServeError::ConfigInvalid(format!("client verifier rejected: {}", e)))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| ServeError::ConfigInvalid(format!("certificate/key rejected: {}", e)))?;

    let allow_http1 = protocol != Protocol::Http2 || ssl.allow_http1;
    config.alpn_protocols = alpn_protocols(protocol, allow_http1);
    Ok(Arc::new(config))
}
