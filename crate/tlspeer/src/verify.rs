//! Explain handshake failures.
//!
//! A failed connect or accept doesn't say whether the network or the
//! certificate check was at fault. [report_verification] looks at the
//! session left behind by the failed handshake and answers that.

use crate::error::NoSessionError;
use crate::peer::TlsPeer;
use crate::security::ChainTooDeep;
use rustls::{AlertDescription, CertificateError};
use std::fmt;

/// Result of certificate-chain verification of the last handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Verification didn't fail, or wasn't reached.
    Ok,
    Failed(VerifyFailure),
}

/// Category of a verification failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    HostnameMismatch,
    Expired,
    NotYetValid,
    UntrustedChain,
    BadSignature,
    Revoked,
    ChainTooDeep,
    /// The remote peer sent no certificate, but one was required.
    MissingPeerCertificate,
    /// The remote peer rejected the certificate we presented.
    RejectedByPeer,
    Other,
}

/// Why verification failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Report on certificate verification of the peer's last handshake.
///
/// This is diagnostic only; it never fails the connection itself.
pub fn report_verification(peer: &TlsPeer) -> Result<VerificationOutcome, NoSessionError> {
    Ok(match peer.handshake_error()? {
        None => VerificationOutcome::Ok,
        Some(err) => match classify(err) {
            Some(failure) => VerificationOutcome::Failed(failure),
            None => VerificationOutcome::Ok,
        },
    })
}

/// Turn a handshake error into a verification failure, if it is one.
fn classify(err: &rustls::Error) -> Option<VerifyFailure> {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => Some(classify_certificate(cert_err)),
        rustls::Error::NoCertificatesPresented => Some(VerifyFailure {
            kind: FailureKind::MissingPeerCertificate,
            reason: "peer did not present a certificate".to_string(),
        }),
        rustls::Error::AlertReceived(alert) if is_certificate_alert(*alert) => {
            Some(VerifyFailure {
                kind: FailureKind::RejectedByPeer,
                reason: format!("peer rejected our certificate: {alert:?}"),
            })
        }
        _ => None,
    }
}

fn classify_certificate(err: &CertificateError) -> VerifyFailure {
    let (kind, reason) = match err {
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            (FailureKind::HostnameMismatch, format!("hostname mismatch: {err}"))
        }
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
            (FailureKind::Expired, "certificate has expired".to_string())
        }
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            (FailureKind::NotYetValid, "certificate is not yet valid".to_string())
        }
        CertificateError::UnknownIssuer => (
            FailureKind::UntrustedChain,
            "unable to get local issuer certificate".to_string(),
        ),
        CertificateError::BadSignature => (
            FailureKind::BadSignature,
            "certificate signature failure".to_string(),
        ),
        CertificateError::Revoked => (FailureKind::Revoked, "certificate revoked".to_string()),
        CertificateError::Other(other) if other.0.downcast_ref::<ChainTooDeep>().is_some() => {
            (FailureKind::ChainTooDeep, other.to_string())
        }
        _ => (FailureKind::Other, err.to_string()),
    };

    VerifyFailure { kind, reason }
}

fn is_certificate_alert(alert: AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied
            | AlertDescription::CertificateRequired
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn classify_hostname_mismatch() {
        let failure = classify(&rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName,
        ))
        .unwrap();

        assert_eq!(failure.kind, FailureKind::HostnameMismatch);
        assert!(failure.reason.contains("hostname mismatch"));
    }

    #[test]
    fn classify_expired() {
        let failure =
            classify(&rustls::Error::InvalidCertificate(CertificateError::Expired)).unwrap();

        assert_eq!(failure.kind, FailureKind::Expired);
        assert_eq!(failure.to_string(), "certificate has expired");
    }

    #[test]
    fn classify_chain_too_deep() {
        let err = rustls::Error::InvalidCertificate(CertificateError::Other(rustls::OtherError(
            Arc::new(ChainTooDeep { intermediates: 6 }),
        )));

        assert_eq!(classify(&err).unwrap().kind, FailureKind::ChainTooDeep);
    }

    #[test]
    fn classify_alert_from_peer() {
        let failure =
            classify(&rustls::Error::AlertReceived(AlertDescription::UnknownCA)).unwrap();

        assert_eq!(failure.kind, FailureKind::RejectedByPeer);
    }

    #[test]
    fn transport_errors_are_not_verification_failures() {
        assert_eq!(
            classify(&rustls::Error::AlertReceived(AlertDescription::HandshakeFailure)),
            None
        );
        assert_eq!(classify(&rustls::Error::DecryptError), None);
    }
}
