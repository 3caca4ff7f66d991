use std::path::PathBuf;

/// Configuration of one end of a TLS connection.
///
/// Which fields are required depends on the role, and is only
/// checked once the trust context is built or a transport is
/// prepared.
#[derive(Clone, Default, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Host to connect to (client) or address to listen on (server).
    ///
    /// A server listens on all IPv4 interfaces if this is unset.
    pub host: Option<String>,

    /// Port to connect to (client) or listen on (server).
    ///
    /// A server given port 0 listens on an ephemeral port; see
    /// [crate::peer::TlsPeer::local_addr].
    pub port: Option<u16>,

    /// PEM file containing the CA certificates to trust.
    ///
    /// If unset, the default trust anchors of the provider are used.
    pub ca_cert: Option<PathBuf>,

    /// PEM-encoded private key identifying this peer.
    pub local_key: Option<PathBuf>,

    /// PEM-encoded certificate chain identifying this peer, end-entity first.
    pub local_cert: Option<PathBuf>,

    /// Reject clients that don't present a certificate.
    ///
    /// Server only. Client certificates that are presented are always
    /// verified, whatever this is set to.
    #[serde(default)]
    pub require_client_cert: bool,
}

impl PeerConfig {
    /// Configuration for a client connecting to `host:port`.
    pub fn client(host: &str, port: u16) -> Self {
        Self {
            host: Some(host.to_string()),
            port: Some(port),
            ..Default::default()
        }
    }

    /// Configuration for a server listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    pub fn with_identity(mut self, key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        self.local_key = Some(key.into());
        self.local_cert = Some(cert.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer_config() {
        let toml_str = r#"
            host = "holder.example"
            port = 7000
            ca_cert = "/etc/tlspeer/ca.pem"
            local_key = "/etc/tlspeer/client.key"
            local_cert = "/etc/tlspeer/client.pem"
        "#;

        let config: PeerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config,
            PeerConfig {
                host: Some("holder.example".to_string()),
                port: Some(7000),
                ca_cert: Some(PathBuf::from("/etc/tlspeer/ca.pem")),
                local_key: Some(PathBuf::from("/etc/tlspeer/client.key")),
                local_cert: Some(PathBuf::from("/etc/tlspeer/client.pem")),
                require_client_cert: false,
            }
        );
    }

    #[test]
    fn parse_minimal_server_config() {
        let config: PeerConfig = toml::from_str("port = 7000\nrequire_client_cert = true").unwrap();
        assert_eq!(config.host, None);
        assert_eq!(config.port, Some(7000));
        assert!(config.require_client_cert);
    }

    #[test]
    fn wrong_field_name() {
        let toml_str = r#"
            port = 7000
            ca_certificate = "/etc/tlspeer/ca.pem"
        "#;

        assert!(toml::from_str::<PeerConfig>(toml_str).is_err());
    }

    #[test]
    fn builders() {
        let config = PeerConfig::client("localhost", 7000)
            .with_ca_cert("ca.pem")
            .with_identity("a.key", "a.pem");
        assert_eq!(config.host.as_deref(), Some("localhost"));
        assert_eq!(config.port, Some(7000));
        assert_eq!(config.ca_cert, Some(PathBuf::from("ca.pem")));
        assert_eq!(config.local_key, Some(PathBuf::from("a.key")));
        assert_eq!(config.local_cert, Some(PathBuf::from("a.pem")));
    }
}
