//! Access to the TLS library behind a trust context.
//!
//! [TlsProvider] supplies the crypto backend and loads trust anchors
//! and local identities. [RustlsProvider] is the implementation used
//! outside of tests.

use crate::error::ProviderError;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::{Arc, Once};

pub use rustls::crypto::aws_lc_rs::default_provider;

/// Capabilities a trust context is built from.
pub trait TlsProvider: Send + Sync {
    /// Process-wide, one-time initialization of the TLS library.
    ///
    /// Must be idempotent and safe to call from concurrent threads.
    fn init(&self);

    /// Crypto backend used by contexts and verifiers.
    fn crypto_provider(&self) -> Result<Arc<CryptoProvider>, ProviderError>;

    /// Load the CA certificates in the given PEM file.
    fn load_trust_anchors(&self, path: &Path) -> Result<RootCertStore, ProviderError>;

    /// Trust anchors to use when no CA file is configured.
    fn default_trust_anchors(&self) -> Result<RootCertStore, ProviderError>;

    /// Load a PEM-encoded private key.
    fn load_private_key(&self, path: &Path) -> Result<PrivateKeyDer<'static>, ProviderError>;

    /// Load a PEM-encoded certificate chain, end-entity first.
    fn load_cert_chain(&self, path: &Path)
    -> Result<Vec<CertificateDer<'static>>, ProviderError>;
}

static INIT: Once = Once::new();

/// [TlsProvider] backed by rustls with aws-lc-rs.
///
/// Default trust anchors are the Mozilla root program, from
/// `webpki-roots`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsProvider;

impl TlsProvider for RustlsProvider {
    fn init(&self) {
        INIT.call_once(|| {
            // Someone else may have installed a provider already; theirs wins.
            if default_provider().install_default().is_ok() {
                log::debug!("installed aws-lc-rs as process crypto provider");
            }
        });
    }

    fn crypto_provider(&self) -> Result<Arc<CryptoProvider>, ProviderError> {
        CryptoProvider::get_default()
            .cloned()
            .ok_or(ProviderError::NoCryptoProvider)
    }

    fn load_trust_anchors(&self, path: &Path) -> Result<RootCertStore, ProviderError> {
        let mut store = RootCertStore::empty();
        for cert in read_certs(path)? {
            store.add(cert)?;
        }

        Ok(store)
    }

    fn default_trust_anchors(&self) -> Result<RootCertStore, ProviderError> {
        let mut store = RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if store.is_empty() {
            return Err(ProviderError::Other("no default trust anchors".to_string()));
        }

        Ok(store)
    }

    fn load_private_key(&self, path: &Path) -> Result<PrivateKeyDer<'static>, ProviderError> {
        Ok(PrivateKeyDer::from_pem_file(path)?)
    }

    fn load_cert_chain(
        &self,
        path: &Path,
    ) -> Result<Vec<CertificateDer<'static>>, ProviderError> {
        read_certs(path)
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProviderError> {
    let certs = CertificateDer::pem_file_iter(path)?.collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ProviderError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPki;

    #[test]
    fn init_is_idempotent() {
        let provider = RustlsProvider;
        provider.init();
        provider.init();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| provider.init());
            }
        });

        assert!(provider.crypto_provider().is_ok());
    }

    #[test]
    fn load_pem_material() -> anyhow::Result<()> {
        let pki = TestPki::new()?;
        let id = pki.issue("holder", &["localhost"])?;
        let provider = RustlsProvider;

        assert_eq!(provider.load_trust_anchors(pki.ca_cert())?.len(), 1);
        assert_eq!(provider.load_cert_chain(&id.cert)?.len(), 1);
        provider.load_private_key(&id.key)?;

        Ok(())
    }

    #[test]
    fn load_missing_file() {
        let provider = RustlsProvider;
        let path = Path::new("/nonexistent/tlspeer/ca.pem");

        assert!(matches!(
            provider.load_trust_anchors(path),
            Err(ProviderError::Pem(_))
        ));
        assert!(provider.load_private_key(path).is_err());
    }

    #[test]
    fn load_file_without_certificates() -> anyhow::Result<()> {
        let pki = TestPki::new()?;
        let id = pki.issue("holder", &["localhost"])?;
        let provider = RustlsProvider;

        // A key file is valid PEM, but holds no certificate.
        assert!(matches!(
            provider.load_cert_chain(&id.key),
            Err(ProviderError::NoCertificates(_))
        ));

        Ok(())
    }

    #[test]
    fn default_anchors_not_empty() -> anyhow::Result<()> {
        assert!(!RustlsProvider.default_trust_anchors()?.is_empty());

        Ok(())
    }
}
