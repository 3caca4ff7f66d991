//! Trust context construction.
//!
//! A trust context is the rustls configuration of one side of a
//! connection: protocol floor, peer verification, trust anchors and
//! local identity. It is built once per peer and shared by every
//! session the peer creates.

use crate::config::PeerConfig;
use crate::error::ConfigError;
use crate::peer::Role;
use crate::provider::TlsProvider;
use base64::Engine as _;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::version::{TLS12, TLS13};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme, SupportedProtocolVersion,
};
use sha2::Digest as _;
use std::sync::Arc;

/// Maximum number of intermediate certificates in a peer chain.
pub const MAX_VERIFY_DEPTH: usize = 5;

/// Protocol versions offered. TLS 1.2 is the floor.
static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

/// Certificate chain and private key of the local peer.
type LocalIdentity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Handshake configuration of one peer.
#[derive(Clone, Debug)]
pub enum TrustContext {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

impl TrustContext {
    pub fn role(&self) -> Role {
        match self {
            TrustContext::Client(_) => Role::Client,
            TrustContext::Server(_) => Role::Server,
        }
    }
}

/// A peer presented more intermediates than [MAX_VERIFY_DEPTH].
#[derive(Debug, thiserror::Error)]
#[error(
    "certificate chain too deep: {intermediates} intermediates, at most {max}",
    max = MAX_VERIFY_DEPTH
)]
pub struct ChainTooDeep {
    pub intermediates: usize,
}

/// Build the trust context for a peer of the given role.
///
/// Initializes the TLS library on first use. No network I/O happens
/// here.
pub fn make_trust_context(
    provider: &dyn TlsProvider,
    role: Role,
    config: &PeerConfig,
) -> Result<TrustContext, ConfigError> {
    provider.init();
    log::debug!("using TLS {role} method");

    let crypto = provider.crypto_provider().map_err(|err| {
        log::error!("error creating new TLS context: {err}");
        ConfigError::ContextCreation(err.to_string())
    })?;
    let roots = Arc::new(load_roots(provider, config)?);
    let identity = load_identity(provider, config)?;

    match role {
        Role::Client => make_client_config(crypto, roots, identity).map(TrustContext::Client),
        Role::Server => {
            make_server_config(crypto, roots, identity, config.require_client_cert)
                .map(TrustContext::Server)
        }
    }
}

fn make_client_config(
    crypto: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    identity: Option<LocalIdentity>,
) -> Result<Arc<ClientConfig>, ConfigError> {
    let verifier =
        WebPkiServerVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&crypto))
            .build()
            .map_err(|err| context_error("failed to create server certificate verifier", err))?;
    let builder = ClientConfig::builder_with_provider(crypto)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(protocol_floor_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DepthLimitedVerifier::new(verifier, roots)));
    let config = match identity {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|err| context_error("failed to set client identity", err))?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

fn make_server_config(
    crypto: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    identity: Option<LocalIdentity>,
    require_client_cert: bool,
) -> Result<Arc<ServerConfig>, ConfigError> {
    let Some((chain, key)) = identity else {
        log::error!("server requires a local private key and certificate");
        return Err(ConfigError::ContextCreation(
            "server requires a local private key and certificate".to_string(),
        ));
    };
    let builder =
        WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&crypto));
    let builder = if require_client_cert {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    let verifier = builder
        .build()
        .map_err(|err| context_error("failed to create client certificate verifier", err))?;
    let config = ServerConfig::builder_with_provider(crypto)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(protocol_floor_error)?
        .with_client_cert_verifier(Arc::new(DepthLimitedVerifier::new(verifier, roots)))
        .with_single_cert(chain, key)
        .map_err(|err| context_error("failed to set server identity", err))?;

    Ok(Arc::new(config))
}

fn load_roots(
    provider: &dyn TlsProvider,
    config: &PeerConfig,
) -> Result<RootCertStore, ConfigError> {
    match &config.ca_cert {
        Some(path) => {
            let roots = provider.load_trust_anchors(path).map_err(|err| {
                log::error!("failed to enable custom CA certificate ({}): {err}", path.display());
                ConfigError::TrustAnchorLoad {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            })?;
            log::debug!("using custom CA certificate ({})", path.display());

            Ok(roots)
        }
        None => {
            let roots = provider.default_trust_anchors().map_err(|err| {
                log::error!("failed to enable default CA verify paths: {err}");
                ConfigError::DefaultTrustAnchor(err.to_string())
            })?;
            log::debug!("using default CA verify paths ({} anchors)", roots.len());

            Ok(roots)
        }
    }
}

fn load_identity(
    provider: &dyn TlsProvider,
    config: &PeerConfig,
) -> Result<Option<LocalIdentity>, ConfigError> {
    let key = match &config.local_key {
        Some(path) => {
            let key = provider.load_private_key(path).map_err(|err| {
                log::error!("failed to set local private key ({}): {err}", path.display());
                ConfigError::LocalKeyLoad {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            })?;
            log::debug!("set local private key ({})", path.display());
            Some(key)
        }
        None => None,
    };
    let chain = match &config.local_cert {
        Some(path) => {
            let chain = provider.load_cert_chain(path).map_err(|err| {
                log::error!("failed to load local certificate ({}): {err}", path.display());
                ConfigError::LocalCertLoad {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            })?;
            log::debug!("set local certificate ({})", path.display());
            Some(chain)
        }
        None => None,
    };

    match (chain, key) {
        (Some(chain), Some(key)) => Ok(Some((chain, key))),
        (None, None) => Ok(None),
        (Some(_), None) | (None, Some(_)) => {
            log::error!("local private key and certificate must be configured together");
            Err(ConfigError::ContextCreation(
                "local private key and certificate must be configured together".to_string(),
            ))
        }
    }
}

fn context_error(step: &str, err: impl std::fmt::Display) -> ConfigError {
    log::error!("{step}: {err}");
    ConfigError::ContextCreation(format!("{step}: {err}"))
}

fn protocol_floor_error(err: rustls::Error) -> ConfigError {
    log::error!("failed to disable deprecated TLS versions: {err}");
    ConfigError::ProtocolFloor(err.to_string())
}

/// Fingerprint of a certificate, as shown in logs.
///
/// This is the base64-encoded SHA-256 of the certificate DER.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    base64::prelude::BASE64_STANDARD.encode(sha2::Sha256::digest(cert))
}

/// Certificate verifier that bounds the chain depth of the
/// WebPKI verifier it wraps.
///
/// Presented certificates that are trust anchors don't count toward
/// the depth, since the path ends at the anchor.
#[derive(Debug)]
pub(crate) struct DepthLimitedVerifier<V: ?Sized> {
    inner: Arc<V>,
    roots: Arc<RootCertStore>,
}

impl<V: ?Sized> DepthLimitedVerifier<V> {
    pub(crate) fn new(inner: Arc<V>, roots: Arc<RootCertStore>) -> Self {
        Self { inner, roots }
    }
}

/// Run `verify` on the presented intermediates, failing with
/// [ChainTooDeep] unless a path with at most [MAX_VERIFY_DEPTH]
/// intermediates verifies.
///
/// Peers send their chain closest first, so a path within the limit
/// runs through the first [MAX_VERIFY_DEPTH] candidates.
fn verify_within_depth<T>(
    roots: &RootCertStore,
    intermediates: &[CertificateDer<'_>],
    verify: impl Fn(&[CertificateDer<'_>]) -> Result<T, rustls::Error>,
) -> Result<T, rustls::Error> {
    let candidates = intermediates
        .iter()
        .filter(|cert| !is_trust_anchor(roots, cert))
        .cloned()
        .collect::<Vec<_>>();
    if candidates.len() <= MAX_VERIFY_DEPTH {
        return verify(&candidates);
    }
    if let Ok(verified) = verify(&candidates[..MAX_VERIFY_DEPTH]) {
        return Ok(verified);
    }

    // Report other verification failures, such as an unknown issuer,
    // as they are. WebPKI's own path depth limit surfaces as Other.
    match verify(&candidates) {
        Ok(_) | Err(rustls::Error::InvalidCertificate(CertificateError::Other(_))) => {
            Err(chain_too_deep(candidates.len()))
        }
        Err(err) => Err(err),
    }
}

fn chain_too_deep(intermediates: usize) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(rustls::OtherError(Arc::new(
        ChainTooDeep { intermediates },
    ))))
}

/// Whether `cert` is one of the trust anchors in `roots`.
fn is_trust_anchor(roots: &RootCertStore, cert: &CertificateDer<'_>) -> bool {
    let mut presented = RootCertStore::empty();
    if presented.add(cert.clone()).is_err() {
        return false;
    }

    presented.roots.iter().any(|anchor| {
        roots.roots.iter().any(|root| {
            root.subject == anchor.subject
                && root.subject_public_key_info == anchor.subject_public_key_info
        })
    })
}

impl<V: ServerCertVerifier + ?Sized> ServerCertVerifier for DepthLimitedVerifier<V> {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        verify_within_depth(&self.roots, intermediates, |intermediates| {
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

impl<V: ClientCertVerifier + ?Sized> ClientCertVerifier for DepthLimitedVerifier<V> {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        verify_within_depth(&self.roots, intermediates, |intermediates| {
            self.inner.verify_client_cert(end_entity, intermediates, now)
        })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
