use crate::peer::Role;
use std::path::PathBuf;

/// Errors returned by the material-loading side of a [crate::provider::TlsProvider].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("PEM error: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no crypto provider available")]
    NoCryptoProvider,

    #[error("{0}")]
    Other(String),
}

/// Errors building a trust context or preparing a transport chain.
///
/// All of these are terminal for the attempt. Fix the configuration
/// and configure again from scratch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to create TLS context: {0}")]
    ContextCreation(String),

    #[error("failed to set minimum protocol version: {0}")]
    ProtocolFloor(String),

    #[error("failed to load CA certificate ({}): {reason}", path.display())]
    TrustAnchorLoad { path: PathBuf, reason: String },

    #[error("failed to load default trust anchors: {0}")]
    DefaultTrustAnchor(String),

    #[error("failed to load local private key ({}): {reason}", path.display())]
    LocalKeyLoad { path: PathBuf, reason: String },

    #[error("failed to load local certificate ({}): {reason}", path.display())]
    LocalCertLoad { path: PathBuf, reason: String },

    #[error("{actual} peer cannot run a {expected}-only operation")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("trust context not configured")]
    NotConfigured,

    #[error("invalid transport configuration: {0}")]
    TransportConfig(String),

    #[error("invalid identity configuration: {0}")]
    IdentityConfig(String),

    #[error("failed to listen on {addr}: {source}")]
    ListenSetup {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up accept: {0}")]
    AcceptSetup(#[source] std::io::Error),
}

/// Client handshake failure.
///
/// A handshake failure doesn't say whether the network or the
/// certificate check failed. Ask [crate::verify::report_verification]
/// for that.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect called before prepare_connect")]
    NotPrepared,

    #[error("{actual} peer cannot run a {expected}-only operation")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("cannot resolve {0}")]
    Resolve(String, #[source] std::io::Error),

    #[error("cannot connect to {0}")]
    Tcp(String, #[source] std::io::Error),

    #[error("TLS handshake with {0} failed")]
    Handshake(String, #[source] std::io::Error),
}

/// Server accept or handshake failure.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("accept called before prepare_accept")]
    NotPrepared,

    #[error("{actual} peer cannot run a {expected}-only operation")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("failed to accept connection")]
    Accept(#[source] std::io::Error),

    #[error("failed to create TLS session")]
    Session(#[source] rustls::Error),

    #[error("TLS handshake with {0} failed")]
    Handshake(String, #[source] std::io::Error),
}

/// Failure to send a framed message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid message size: {0}")]
    InvalidSize(usize),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no established session")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to receive a framed message.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("declared message size {0} is invalid")]
    InvalidSize(u16),

    #[error("short read: {read} of {expected} bytes")]
    ShortRead { expected: usize, read: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no established session")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verification was queried on a peer with no TLS session.
///
/// This is a setup bug in the caller, not a fault of the remote peer.
#[derive(Debug, thiserror::Error)]
#[error("no TLS session to report on")]
pub struct NoSessionError;
