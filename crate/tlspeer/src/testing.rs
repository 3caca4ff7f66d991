//! Throwaway PKI for tests.
//!
//! Certificates and keys are generated with rcgen and written as PEM
//! files to a temporary directory that's removed on drop.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Key and certificate files of one identity.
#[derive(Clone, Debug)]
pub struct Identity {
    pub key: PathBuf,
    pub cert: PathBuf,
}

/// A CA, and the directory the files it issues are written to.
pub struct TestPki {
    dir: TempDir,
    ca_cert_path: PathBuf,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    /// Create a new CA, named "Test CA".
    pub fn new() -> anyhow::Result<Self> {
        Self::with_name("Test CA")
    }

    /// Create a new CA with the given common name.
    pub fn with_name(name: &str) -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params(name)?.self_signed(&ca_key)?;
        let ca_cert_path = dir.path().join("ca.pem");
        fs::write(&ca_cert_path, ca_cert.pem())?;

        Ok(Self {
            dir,
            ca_cert_path,
            ca_cert,
            ca_key,
        })
    }

    /// Path to the PEM file of the CA certificate.
    pub fn ca_cert(&self) -> &Path {
        &self.ca_cert_path
    }

    /// Directory the PKI files are written to.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Issue a certificate valid for the given DNS names.
    pub fn issue(&self, name: &str, dns_names: &[&str]) -> anyhow::Result<Identity> {
        let params = leaf_params(name, dns_names)?;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        self.write_identity(name, &key, &[cert.pem()])
    }

    /// Issue a certificate that expired long ago.
    pub fn issue_expired(&self, name: &str, dns_names: &[&str]) -> anyhow::Result<Identity> {
        let mut params = leaf_params(name, dns_names)?;
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        self.write_identity(name, &key, &[cert.pem()])
    }

    /// Issue a certificate through a chain of `depth` intermediate CAs.
    ///
    /// The certificate file contains the end-entity certificate
    /// followed by the intermediates, closest first.
    pub fn issue_chained(
        &self,
        name: &str,
        dns_names: &[&str],
        depth: usize,
    ) -> anyhow::Result<Identity> {
        let mut intermediates: Vec<(Certificate, KeyPair)> = Vec::new();
        for i in 0..depth {
            let params = ca_params(&format!("{name} intermediate {i}"))?;
            let key = KeyPair::generate()?;
            let cert = match intermediates.last() {
                Some((issuer, issuer_key)) => params.signed_by(&key, issuer, issuer_key)?,
                None => params.signed_by(&key, &self.ca_cert, &self.ca_key)?,
            };
            intermediates.push((cert, key));
        }

        let params = leaf_params(name, dns_names)?;
        let key = KeyPair::generate()?;
        let cert = match intermediates.last() {
            Some((issuer, issuer_key)) => params.signed_by(&key, issuer, issuer_key)?,
            None => params.signed_by(&key, &self.ca_cert, &self.ca_key)?,
        };

        let mut pems = vec![cert.pem()];
        pems.extend(intermediates.iter().rev().map(|(c, _)| c.pem()));
        self.write_identity(name, &key, &pems)
    }

    fn write_identity(
        &self,
        name: &str,
        key: &KeyPair,
        cert_pems: &[String],
    ) -> anyhow::Result<Identity> {
        let key_path = self.dir.path().join(format!("{name}.key"));
        let cert_path = self.dir.path().join(format!("{name}.pem"));
        fs::write(&key_path, key.serialize_pem())?;
        fs::write(&cert_path, cert_pems.concat())?;

        Ok(Identity {
            key: key_path,
            cert: cert_path,
        })
    }
}

fn ca_params(name: &str) -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    Ok(params)
}

fn leaf_params(name: &str, dns_names: &[&str]) -> anyhow::Result<CertificateParams> {
    let mut params =
        CertificateParams::new(dns_names.iter().map(|s| s.to_string()).collect::<Vec<_>>())?;
    params.distinguished_name.push(DnType::CommonName, name);

    Ok(params)
}
