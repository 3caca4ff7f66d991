use super::*;
use crate::testing::{Identity, TestPki};
use crate::verify::FailureKind;
use std::thread::{self, JoinHandle};

const HOST: &str = "localhost";

struct Fixture {
    pki: TestPki,
    holder: Identity,
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let _ = env_logger::try_init();
        let pki = TestPki::new()?;
        let holder = pki.issue("holder", &[HOST])?;

        Ok(Self { pki, holder })
    }

    fn server_config(&self) -> PeerConfig {
        PeerConfig::server(0)
            .with_ca_cert(self.pki.ca_cert())
            .with_identity(&self.holder.key, &self.holder.cert)
    }

    fn client_config(&self, port: u16) -> PeerConfig {
        PeerConfig::client(HOST, port).with_ca_cert(self.pki.ca_cert())
    }
}

/// Configure a server peer and start listening on an ephemeral port.
fn listen(config: PeerConfig) -> anyhow::Result<(TlsPeer, u16)> {
    let mut server = TlsPeer::new(Role::Server, config);
    server.configure()?;
    server.prepare_accept()?;
    let port = server
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("server not listening"))?
        .port();

    Ok((server, port))
}

/// Accept one connection in the background and echo back one message.
fn serve_echo(mut server: TlsPeer) -> JoinHandle<(TlsPeer, anyhow::Result<()>)> {
    thread::spawn(move || {
        let result = accept_and_echo(&mut server);
        (server, result)
    })
}

fn accept_and_echo(server: &mut TlsPeer) -> anyhow::Result<()> {
    server.accept()?;
    let request = server.receive()?;
    server.send(&request)?;

    Ok(())
}

/// Accept one connection in the background, and nothing else.
fn serve_handshake(mut server: TlsPeer) -> JoinHandle<(TlsPeer, Result<(), AcceptError>)> {
    thread::spawn(move || {
        let result = server.accept();
        (server, result)
    })
}

fn connect(config: PeerConfig) -> anyhow::Result<TlsPeer> {
    let mut client = TlsPeer::new(Role::Client, config);
    client.configure()?;
    client.prepare_connect()?;
    client.connect()?;

    Ok(client)
}

fn join<T>(handle: JoinHandle<T>) -> anyhow::Result<T> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))
}

fn cert_fingerprint(path: &std::path::Path) -> anyhow::Result<String> {
    let chain = RustlsProvider.load_cert_chain(path)?;

    Ok(security::fingerprint(&chain[0]))
}

fn failure_kind(peer: &TlsPeer) -> anyhow::Result<Option<FailureKind>> {
    Ok(match verify::report_verification(peer)? {
        VerificationOutcome::Ok => None,
        VerificationOutcome::Failed(failure) => Some(failure.kind),
    })
}

#[test]
fn exchange_messages() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, port) = listen(fixture.server_config())?;
    let handle = serve_echo(server);

    let mut client = connect(fixture.client_config(port))?;
    assert!(client.is_connected());
    client.send(&Message::from(&b"hello"[..]))?;
    let reply = client.receive()?;
    assert_eq!(reply.body(), b"hello");
    assert_eq!(
        verify::report_verification(&client)?,
        VerificationOutcome::Ok
    );

    let (server, result) = join(handle)?;
    result?;
    assert_eq!(
        verify::report_verification(&server)?,
        VerificationOutcome::Ok
    );
    // No client certificate was presented.
    assert_eq!(server.peer_fingerprint(), None);

    Ok(())
}

#[test]
fn exchange_largest_message() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, port) = listen(fixture.server_config())?;
    let handle = serve_echo(server);

    let body: Vec<u8> = (0..message::MAX_MSG_SIZE).map(|i| (i % 7) as u8).collect();
    let mut client = connect(fixture.client_config(port))?;
    client.send(&Message::from(body.clone()))?;
    assert_eq!(client.receive()?.into_body(), body);

    join(handle)?.1?;

    Ok(())
}

#[test]
fn mutual_authentication() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let retriever = fixture.pki.issue("retriever", &["retriever.example"])?;
    let mut server_config = fixture.server_config();
    server_config.require_client_cert = true;
    let (server, port) = listen(server_config)?;
    let handle = serve_echo(server);

    let mut client = connect(
        fixture
            .client_config(port)
            .with_identity(&retriever.key, &retriever.cert),
    )?;
    client.send(&Message::from(&b"key please"[..]))?;
    assert_eq!(client.receive()?.body(), b"key please");
    assert_eq!(
        client.peer_fingerprint(),
        Some(cert_fingerprint(&fixture.holder.cert)?)
    );

    let (server, result) = join(handle)?;
    result?;
    assert_eq!(
        server.peer_fingerprint(),
        Some(cert_fingerprint(&retriever.cert)?)
    );

    Ok(())
}

#[test]
fn server_requires_client_certificate() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let mut server_config = fixture.server_config();
    server_config.require_client_cert = true;
    let (server, port) = listen(server_config)?;
    let handle = serve_handshake(server);

    // With TLS 1.3 the client may see its side of the handshake
    // complete before the server rejects it.
    let mut client = TlsPeer::new(Role::Client, fixture.client_config(port));
    client.configure()?;
    client.prepare_connect()?;
    let connected = client.connect().is_ok();

    let (server, result) = join(handle)?;
    assert!(matches!(result, Err(AcceptError::Handshake(_, _))));
    assert!(!server.is_connected());
    assert_eq!(
        failure_kind(&server)?,
        Some(FailureKind::MissingPeerCertificate)
    );

    if connected {
        assert!(client.receive().is_err());
    }

    Ok(())
}

#[test]
fn hostname_mismatch() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let other = fixture.pki.issue("other", &["other.example"])?;
    let (server, port) = listen(
        PeerConfig::server(0)
            .with_ca_cert(fixture.pki.ca_cert())
            .with_identity(&other.key, &other.cert),
    )?;
    let handle = serve_handshake(server);

    let mut client = TlsPeer::new(Role::Client, fixture.client_config(port));
    client.configure()?;
    client.prepare_connect()?;
    assert!(matches!(client.connect(), Err(ConnectError::Handshake(_, _))));
    assert!(!client.is_connected());
    assert_eq!(failure_kind(&client)?, Some(FailureKind::HostnameMismatch));

    let (server, result) = join(handle)?;
    assert!(result.is_err());
    assert_eq!(failure_kind(&server)?, Some(FailureKind::RejectedByPeer));

    Ok(())
}

#[test]
fn untrusted_server_certificate() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let other_pki = TestPki::with_name("Other CA")?;
    let (server, port) = listen(fixture.server_config())?;
    let handle = serve_handshake(server);

    let mut client = TlsPeer::new(
        Role::Client,
        PeerConfig::client(HOST, port).with_ca_cert(other_pki.ca_cert()),
    );
    client.configure()?;
    client.prepare_connect()?;
    assert!(client.connect().is_err());
    assert_eq!(failure_kind(&client)?, Some(FailureKind::UntrustedChain));

    let (server, result) = join(handle)?;
    assert!(result.is_err());
    assert_eq!(failure_kind(&server)?, Some(FailureKind::RejectedByPeer));

    Ok(())
}

#[test]
fn expired_server_certificate() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let expired = fixture.pki.issue_expired("expired", &[HOST])?;
    let (server, port) = listen(
        PeerConfig::server(0)
            .with_ca_cert(fixture.pki.ca_cert())
            .with_identity(&expired.key, &expired.cert),
    )?;
    let handle = serve_handshake(server);

    let mut client = TlsPeer::new(Role::Client, fixture.client_config(port));
    client.configure()?;
    client.prepare_connect()?;
    assert!(client.connect().is_err());
    assert_eq!(failure_kind(&client)?, Some(FailureKind::Expired));

    let (server, result) = join(handle)?;
    assert!(result.is_err());
    assert_eq!(failure_kind(&server)?, Some(FailureKind::RejectedByPeer));

    Ok(())
}

#[test]
fn chain_within_depth_limit() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let chained = fixture
        .pki
        .issue_chained("chained", &[HOST], security::MAX_VERIFY_DEPTH)?;
    let (server, port) = listen(
        PeerConfig::server(0)
            .with_ca_cert(fixture.pki.ca_cert())
            .with_identity(&chained.key, &chained.cert),
    )?;
    let handle = serve_echo(server);

    let mut client = connect(fixture.client_config(port))?;
    client.send(&Message::from(&b"deep"[..]))?;
    assert_eq!(client.receive()?.body(), b"deep");

    join(handle)?.1?;

    Ok(())
}

#[test]
fn chain_ending_with_root_within_depth_limit() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let chained = fixture
        .pki
        .issue_chained("chained", &[HOST], security::MAX_VERIFY_DEPTH)?;
    let mut pem = std::fs::read_to_string(&chained.cert)?;
    pem.push_str(&std::fs::read_to_string(fixture.pki.ca_cert())?);
    std::fs::write(&chained.cert, pem)?;
    let (server, port) = listen(
        PeerConfig::server(0)
            .with_ca_cert(fixture.pki.ca_cert())
            .with_identity(&chained.key, &chained.cert),
    )?;
    let handle = serve_echo(server);

    let mut client = connect(fixture.client_config(port))?;
    client.send(&Message::from(&b"deep"[..]))?;
    assert_eq!(client.receive()?.body(), b"deep");

    join(handle)?.1?;

    Ok(())
}

#[test]
fn chain_too_deep() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let chained =
        fixture
            .pki
            .issue_chained("chained", &[HOST], security::MAX_VERIFY_DEPTH + 1)?;
    let (server, port) = listen(
        PeerConfig::server(0)
            .with_ca_cert(fixture.pki.ca_cert())
            .with_identity(&chained.key, &chained.cert),
    )?;
    let handle = serve_handshake(server);

    let mut client = TlsPeer::new(Role::Client, fixture.client_config(port));
    client.configure()?;
    client.prepare_connect()?;
    assert!(client.connect().is_err());
    assert_eq!(failure_kind(&client)?, Some(FailureKind::ChainTooDeep));

    let (server, result) = join(handle)?;
    assert!(result.is_err());
    assert_eq!(failure_kind(&server)?, Some(FailureKind::RejectedByPeer));

    Ok(())
}

#[test]
fn connection_refused() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let mut client = TlsPeer::new(
        Role::Client,
        PeerConfig::client("127.0.0.1", port).with_ca_cert(fixture.pki.ca_cert()),
    );
    client.configure()?;
    client.prepare_connect()?;
    assert!(matches!(client.connect(), Err(ConnectError::Tcp(_, _))));
    // Verification was never reached.
    assert_eq!(
        verify::report_verification(&client)?,
        VerificationOutcome::Ok
    );

    Ok(())
}

#[test]
fn report_without_session() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let client = TlsPeer::new(Role::Client, fixture.client_config(7000));
    assert!(verify::report_verification(&client).is_err());

    let (server, _) = listen(fixture.server_config())?;
    assert!(verify::report_verification(&server).is_err());

    Ok(())
}

#[test]
fn send_and_receive_without_session() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let mut client = TlsPeer::new(Role::Client, fixture.client_config(7000));
    client.configure()?;
    client.prepare_connect()?;

    assert!(matches!(
        client.send(&Message::from(&b"hello"[..])),
        Err(SendError::NotConnected)
    ));
    assert!(matches!(client.receive(), Err(RecvError::NotConnected)));

    Ok(())
}

#[test]
fn operations_out_of_order() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;

    let mut client = TlsPeer::new(Role::Client, fixture.client_config(7000));
    assert!(matches!(
        client.prepare_connect(),
        Err(ConfigError::NotConfigured)
    ));
    assert!(matches!(client.connect(), Err(ConnectError::NotPrepared)));

    let mut server = TlsPeer::new(Role::Server, fixture.server_config());
    assert!(matches!(
        server.prepare_accept(),
        Err(ConfigError::NotConfigured)
    ));
    assert!(matches!(server.accept(), Err(AcceptError::NotPrepared)));

    Ok(())
}

#[test]
fn role_mismatch() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;

    let mut client = TlsPeer::new(Role::Client, fixture.client_config(7000));
    client.configure()?;
    assert!(matches!(
        client.prepare_accept(),
        Err(ConfigError::RoleMismatch {
            expected: Role::Server,
            actual: Role::Client
        })
    ));

    let mut server = TlsPeer::new(Role::Server, fixture.server_config());
    server.configure()?;
    assert!(matches!(
        server.prepare_connect(),
        Err(ConfigError::RoleMismatch {
            expected: Role::Client,
            actual: Role::Server
        })
    ));
    // Nothing was set up by the failed calls.
    assert_eq!(server.local_addr(), None);

    assert!(matches!(
        server.connect(),
        Err(ConnectError::RoleMismatch {
            expected: Role::Client,
            actual: Role::Server
        })
    ));
    assert!(matches!(
        client.accept(),
        Err(AcceptError::RoleMismatch {
            expected: Role::Server,
            actual: Role::Client
        })
    ));

    // The role is checked before the transport.
    let (mut server, _) = listen(fixture.server_config())?;
    assert!(matches!(
        server.connect(),
        Err(ConnectError::RoleMismatch { .. })
    ));
    assert!(server.local_addr().is_some());

    Ok(())
}

#[test]
fn missing_remote_address() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;

    let mut no_host = TlsPeer::new(
        Role::Client,
        PeerConfig::default().with_ca_cert(fixture.pki.ca_cert()),
    );
    no_host.configure()?;
    assert!(matches!(
        no_host.prepare_connect(),
        Err(ConfigError::TransportConfig(_))
    ));

    let mut no_port = TlsPeer::new(Role::Client, fixture.client_config(0));
    no_port.configure()?;
    assert!(matches!(
        no_port.prepare_connect(),
        Err(ConfigError::TransportConfig(_))
    ));

    let mut no_listen_port = TlsPeer::new(
        Role::Server,
        PeerConfig {
            port: None,
            ..fixture.server_config()
        },
    );
    no_listen_port.configure()?;
    assert!(matches!(
        no_listen_port.prepare_accept(),
        Err(ConfigError::TransportConfig(_))
    ));

    Ok(())
}

#[test]
fn invalid_server_name() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let mut client = TlsPeer::new(
        Role::Client,
        PeerConfig::client("not a host name", 7000).with_ca_cert(fixture.pki.ca_cert()),
    );
    client.configure()?;

    assert!(matches!(
        client.prepare_connect(),
        Err(ConfigError::IdentityConfig(_))
    ));

    Ok(())
}

#[test]
fn listen_on_address_in_use() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (_server, port) = listen(fixture.server_config())?;

    let mut second = TlsPeer::new(
        Role::Server,
        PeerConfig {
            host: Some("0.0.0.0".to_string()),
            port: Some(port),
            ..fixture.server_config()
        },
    );
    second.configure()?;
    assert!(matches!(
        second.prepare_accept(),
        Err(ConfigError::ListenSetup { .. })
    ));

    Ok(())
}

#[test]
fn teardown_releases_everything() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (mut server, port) = listen(fixture.server_config())?;

    server.teardown();
    assert_eq!(server.role(), Role::Server);
    assert!(server.trust_context().is_none());
    assert_eq!(server.config(), &PeerConfig::default());
    assert_eq!(server.local_addr(), None);

    // Idempotent.
    server.teardown();

    // The port is free again.
    let (_server, rebound) = listen(PeerConfig {
        port: Some(port),
        ..fixture.server_config()
    })?;
    assert_eq!(rebound, port);

    Ok(())
}

#[test]
fn repeated_setup_and_teardown() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;

    for _ in 0..20 {
        let (mut server, _) = listen(fixture.server_config())?;
        server.teardown();

        let mut client = TlsPeer::new(Role::Client, fixture.client_config(7000));
        client.configure()?;
        client.prepare_connect()?;
        client.teardown();
    }

    Ok(())
}

#[test]
fn repeated_sessions_release_resources() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (server, port) = listen(fixture.server_config())?;
    drop(server);

    for i in 0..10u8 {
        // Binding the same port again fails if the last listener leaked.
        let (mut server, bound) = listen(PeerConfig {
            port: Some(port),
            ..fixture.server_config()
        })?;
        assert_eq!(bound, port);
        let handle = thread::spawn(move || -> anyhow::Result<TlsPeer> {
            accept_and_echo(&mut server)?;
            server.teardown();

            Ok(server)
        });

        let mut client = connect(fixture.client_config(port))?;
        client.send(&Message::new(vec![i + 1; 32]))?;
        assert_eq!(client.receive()?.body(), &[i + 1; 32]);

        let server = join(handle)??;
        assert!(!server.is_connected());
        assert_eq!(server.local_addr(), None);
        // The server closed its session with the client.
        assert!(matches!(client.receive(), Err(RecvError::ConnectionClosed)));

        client.teardown();
        assert!(!client.is_connected());
        assert!(client.trust_context().is_none());
    }

    Ok(())
}

#[test]
fn configure_again_resets_transport() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (mut server, _) = listen(fixture.server_config())?;

    server.configure()?;
    assert!(server.trust_context().is_some());
    assert_eq!(server.local_addr(), None);

    Ok(())
}

#[test]
fn accept_sequential_clients() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (mut server, port) = listen(fixture.server_config())?;
    let handle = thread::spawn(move || -> anyhow::Result<()> {
        for _ in 0..3 {
            accept_and_echo(&mut server)?;
        }

        Ok(())
    });

    for i in 0..3u8 {
        let mut client = connect(fixture.client_config(port))?;
        client.send(&Message::new(vec![i + 1; 10]))?;
        assert_eq!(client.receive()?.body(), &[i + 1; 10]);
        client.teardown();
    }

    join(handle)??;

    Ok(())
}

#[test]
fn receive_after_remote_teardown() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let (mut server, port) = listen(fixture.server_config())?;
    let handle = thread::spawn(move || -> anyhow::Result<()> {
        server.accept()?;
        server.teardown();

        Ok(())
    });

    let mut client = connect(fixture.client_config(port))?;
    join(handle)??;
    assert!(matches!(client.receive(), Err(RecvError::ConnectionClosed)));

    Ok(())
}
