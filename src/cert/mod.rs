//! Serving certificate for the HTTPS listener.
//!
//! Exactly one [`CertBundle`] is current at a time. Strategies in [`file`] and
//! [`csr`] replace it from the background; TLS handshakes read it through
//! [`CertStore`]'s rustls resolver and never block on a rotation.

pub mod csr;
pub mod file;

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls_pemfile::Item;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::{self, CertifiedKey};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tracing::*;

use crate::{Error, Result};

/// Rotate once this fraction of the certificate lifetime has elapsed
const ROTATION_THRESHOLD: f64 = 0.8;

/// A certificate chain with its private key and the leaf's validity bounds
pub struct CertBundle {
    key: Arc<CertifiedKey>,
    pub not_before: i64,
    pub not_after: i64,
    pub common_name: String,
}

impl CertBundle {
    /// Parse a PEM certificate chain and its PEM private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain: Vec<Certificate> = rustls_pemfile::read_all(&mut &cert_pem[..])?
            .into_iter()
            .filter_map(|item| match item {
                Item::X509Certificate(der) => Some(Certificate(der)),
                _ => None,
            })
            .collect();
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Tls("no certificate found in PEM".to_owned()))?;

        let key = rustls_pemfile::read_all(&mut &key_pem[..])?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
                _ => None,
            })
            .ok_or_else(|| Error::Tls("no private key found in PEM".to_owned()))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(&leaf.0)
            .map_err(|e| Error::Tls(format!("failed to parse certificate: {e}")))?;
        check_key_matches(parsed.public_key().raw, key_pem)?;

        let not_before = parsed.validity().not_before.timestamp();
        let not_after = parsed.validity().not_after.timestamp();
        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_owned();

        let signing_key = sign::any_supported_type(&key)
            .map_err(|_| Error::Tls("unsupported private key type".to_owned()))?;

        Ok(CertBundle {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_before,
            not_after,
            common_name,
        })
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.key.clone()
    }

    /// DER of the leaf certificate
    pub fn leaf_der(&self) -> &[u8] {
        self.key.cert.first().map(|c| c.0.as_slice()).unwrap_or_default()
    }

    fn rotation_at(&self) -> i64 {
        let lifetime = (self.not_after - self.not_before) as f64;
        self.not_before + (lifetime * ROTATION_THRESHOLD) as i64
    }

    pub fn needs_rotation(&self) -> bool {
        unix_now() >= self.rotation_at()
    }

    /// Time left until [`CertBundle::needs_rotation`] turns true
    pub fn until_rotation(&self) -> Duration {
        Duration::from_secs((self.rotation_at() - unix_now()).max(0) as u64)
    }
}

/// Reject a key that does not belong to the certificate.
///
/// Returns whether the comparison ran: keys rcgen cannot read are left to
/// rustls, which only fails on the first handshake if they do not match.
fn check_key_matches(leaf_spki: &[u8], key_pem: &[u8]) -> Result<bool> {
    let Ok(key_pem) = std::str::from_utf8(key_pem) else {
        debug!("private key is not UTF-8 PEM, skipping certificate match check");
        return Ok(false);
    };
    match rcgen::KeyPair::from_pem(key_pem) {
        Ok(pair) if pair.public_key_der() != leaf_spki => Err(Error::Tls(
            "private key does not match certificate".to_owned(),
        )),
        Ok(_) => Ok(true),
        Err(err) => {
            debug!(error = %err, "unsupported private key format, skipping certificate match check");
            Ok(false)
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Holder of the current bundle: one rotating writer, many handshake readers.
///
/// Writers swap a whole `Arc`, so a reader sees either the old pair or the new
/// one, never a certificate with the wrong key.
#[derive(Default)]
pub struct CertStore {
    current: RwLock<Option<Arc<CertBundle>>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current bundle, or [`Error::NoCertificate`] until one has been loaded
    pub fn current(&self) -> Result<Arc<CertBundle>> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.clone().ok_or(Error::NoCertificate)
    }

    pub fn replace(&self, bundle: CertBundle) {
        info!(
            common_name = %bundle.common_name,
            not_after = bundle.not_after,
            "serving certificate updated"
        );
        let bundle = Arc::new(bundle);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(bundle);
    }

    /// True when there is no bundle yet or the current one is due for rotation
    pub fn needs_rotation(&self) -> bool {
        self.current().map(|b| b.needs_rotation()).unwrap_or(true)
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        match self.current() {
            Ok(bundle) => Some(bundle.certified_key()),
            Err(err) => {
                warn!(error = %err, "rejecting TLS handshake");
                None
            }
        }
    }
}

/// rustls server configuration answering every handshake from `store`
pub fn server_config(store: Arc<CertStore>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(store);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
pub(crate) mod testing {
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

    /// Self-signed `(cert_pem, key_pem)` for `name`
    pub fn self_signed(name: &str) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_owned()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(name.to_owned()));
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }
}
