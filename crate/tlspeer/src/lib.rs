//! tlspeer - TLS peers for key retrieval
//!
//! This crate sets up the TLS connection between a retriever
//! (client) and a key holder (server) and exchanges length-prefixed
//! messages over it. All I/O is blocking.
//!
//! # Main Components
//!
//! - `peer`: Peer lifecycle: configure, connect or accept, teardown.
//! - `security`: Trust context construction and peer verification.
//! - `message`: 2-byte big-endian length-prefixed framing.
//! - `verify`: Explains why a handshake failed certificate checks.
//! - `provider`: Loading of keys, certificates and trust anchors.
//! - `config`: Peer configuration, loadable from TOML.
//! - `utils`: Logging helpers.

pub mod config;
pub mod error;
pub mod message;
pub mod peer;
pub mod provider;
pub mod security;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;
pub mod verify;

pub use config::PeerConfig;
pub use error::{AcceptError, ConfigError, ConnectError, NoSessionError, RecvError, SendError};
pub use message::{MAX_MSG_SIZE, Message};
pub use peer::{Role, TlsPeer};
pub use provider::{RustlsProvider, TlsProvider};
pub use security::TrustContext;
pub use verify::{FailureKind, VerificationOutcome, VerifyFailure, report_verification};
