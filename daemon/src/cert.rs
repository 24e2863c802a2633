//! TLS material for the listener and the proxy link.
//!
//! Peers are never verified by certificate: trust comes from the password
//! exchange that follows the handshake. The certificate only exists so the
//! link is encrypted, and is self-signed on first run.

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, Local};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::secret::write_private_file;

const VALIDITY_DAYS: i64 = 365;

pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsMaterial {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsMaterial {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("failed to parse certificates: {e}"))?;
        if certs.is_empty() {
            return Err(anyhow!("no certificates found"));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| anyhow!("failed to parse private key: {e}"))?;
        Ok(Self { certs, key })
    }
}

/// Self-signed certificate for `host`, valid for a year. Returns (cert, key) PEM.
///
/// The key is ECDSA P-256 (rcgen's default) rather than 2048-bit RSA: rcgen
/// with the ring backend cannot generate RSA keys. Peers skip certificate
/// verification, so any key type the handshake supports will do.
pub fn generate_self_signed(host: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::new(vec![host.to_string()])
        .or_else(|_| CertificateParams::new(vec!["localhost".to_string()]))
        .context("Failed to build certificate parameters")?;
    params.distinguished_name.push(DnType::CommonName, host);
    let today = Local::now().date_naive();
    let expiry = today + Duration::days(VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    let key = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params.self_signed(&key).context("Failed to self-sign certificate")?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Loads `cert_path`/`key_path`, generating and writing both if either is missing.
pub fn load_or_generate(cert_path: &Path, key_path: &Path, host: &str) -> Result<TlsMaterial> {
    if !cert_path.exists() || !key_path.exists() {
        info!("generating self-signed certificate for {host}");
        let (cert_pem, key_pem) = generate_self_signed(host)?;
        std::fs::write(cert_path, &cert_pem)
            .with_context(|| format!("Failed to write certificate {}", cert_path.display()))?;
        write_private_file(key_path, key_pem.as_bytes())?;
    }
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read certificate {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read private key {}", key_path.display()))?;
    TlsMaterial::from_pem(&cert_pem, &key_pem)
        .with_context(|| format!("Invalid TLS material in {}", cert_path.display()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(material.certs.clone(), material.key.clone_key())
        .context("server config error")?;
    Ok(Arc::new(config))
}

/// Client config for the proxy link: presents our own certificate and
/// accepts any server certificate.
pub fn client_config(material: &TlsMaterial) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_client_auth_cert(material.certs.clone(), material.key.clone_key())
        .context("client config error")?;
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
