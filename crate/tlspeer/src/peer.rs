//! One end of a TLS connection.
//!
//! A [TlsPeer] goes through configure, then prepare_connect/connect
//! (client) or prepare_accept/accept (server), then exchanges
//! messages. All operations block.
//!
//! ```no_run
//! use tlspeer::{Message, PeerConfig, Role, TlsPeer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PeerConfig::client("holder.example", 7000).with_ca_cert("ca.pem");
//! let mut peer = TlsPeer::new(Role::Client, config);
//! peer.configure()?;
//! peer.prepare_connect()?;
//! peer.connect()?;
//! peer.send(&Message::from(&b"hello"[..]))?;
//! let reply = peer.receive()?;
//! # let _ = reply;
//! peer.teardown();
//! # Ok(())
//! # }
//! ```

use crate::config::PeerConfig;
use crate::error::{AcceptError, ConfigError, ConnectError, NoSessionError, RecvError, SendError};
use crate::message::{self, Message};
use crate::provider::{RustlsProvider, TlsProvider};
use crate::security::{self, TrustContext};
use crate::verify::{self, VerificationOutcome};
use rustls::pki_types::ServerName;
use rustls::{
    ClientConnection, ConnectionCommon, ServerConfig, ServerConnection, SideData, StreamOwned,
};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs as _};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Which side of the handshake a peer runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// State of one end of a TLS connection.
///
/// The role is fixed at creation. The trust context and transport
/// are owned by the peer and released by [TlsPeer::teardown] or on
/// drop.
pub struct TlsPeer {
    role: Role,
    provider: Arc<dyn TlsProvider>,
    config: PeerConfig,
    context: Option<TrustContext>,
    transport: Option<Transport>,
}

/// Transport chain of a peer.
enum Transport {
    /// Client side, ready to connect.
    Connector(Connector),
    /// Client side, after a handshake attempt.
    Client(Session<ClientConnection>),
    /// Server side, listening. Holds the last accepted session, if any.
    Listener(Listener),
}

struct Connector {
    host: String,
    port: u16,
    conn: ClientConnection,
}

struct Listener {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    session: Option<Session<ServerConnection>>,
}

/// A TLS session over TCP, and how its handshake went.
struct Session<C> {
    stream: StreamOwned<C, TcpStream>,
    remote: String,
    error: Option<rustls::Error>,
}

trait ReadWrite: Read + Write {}
impl<T: Read + Write> ReadWrite for T {}

impl TlsPeer {
    /// Create a peer using the rustls provider.
    pub fn new(role: Role, config: PeerConfig) -> Self {
        Self::with_provider(role, config, Arc::new(RustlsProvider))
    }

    /// Create a peer using the given provider.
    pub fn with_provider(role: Role, config: PeerConfig, provider: Arc<dyn TlsProvider>) -> Self {
        Self {
            role,
            provider,
            config,
            context: None,
            transport: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The trust context, once configured.
    pub fn trust_context(&self) -> Option<&TrustContext> {
        self.context.as_ref()
    }

    /// Build the trust context.
    ///
    /// Replaces any previous context and drops any transport built
    /// with it.
    pub fn configure(&mut self) -> Result<(), ConfigError> {
        self.close_transport();
        self.context = None;
        let context = security::make_trust_context(&*self.provider, self.role, &self.config)?;
        self.context = Some(context);

        Ok(())
    }

    /// Build the client transport chain.
    ///
    /// The remote host is used both for SNI and to verify the
    /// identity in the server certificate.
    pub fn prepare_connect(&mut self) -> Result<(), ConfigError> {
        self.check_role(Role::Client, |expected, actual| ConfigError::RoleMismatch {
            expected,
            actual,
        })?;
        let Some(TrustContext::Client(config)) = &self.context else {
            log::error!("client connection prepared before configuring the TLS context");
            return Err(ConfigError::NotConfigured);
        };
        let host = match self.config.host.as_deref() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                log::error!("no remote host configured");
                return Err(ConfigError::TransportConfig("no remote host".to_string()));
            }
        };
        let port = match self.config.port {
            Some(port) if port != 0 => port,
            _ => {
                log::error!("no remote port configured for {host}");
                return Err(ConfigError::TransportConfig(format!(
                    "no remote port for {host}"
                )));
            }
        };
        let server_name = ServerName::try_from(host.clone()).map_err(|err| {
            log::error!("invalid server name {host:?}: {err}");
            ConfigError::IdentityConfig(format!("{host:?}: {err}"))
        })?;
        let conn = ClientConnection::new(Arc::clone(config), server_name).map_err(|err| {
            log::error!("failed to create TLS session for {host}: {err}");
            ConfigError::IdentityConfig(format!("{host}: {err}"))
        })?;

        self.close_transport();
        self.transport = Some(Transport::Connector(Connector { host, port, conn }));

        Ok(())
    }

    /// Connect and run the client handshake.
    ///
    /// On handshake failure, the verification outcome is logged; call
    /// [verify::report_verification] to get it.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        self.check_role(Role::Client, |expected, actual| ConnectError::RoleMismatch {
            expected,
            actual,
        })?;
        let connector = match self.transport.take() {
            Some(Transport::Connector(connector)) => connector,
            other => {
                self.transport = other;
                log::error!("connect called before prepare_connect");
                return Err(ConnectError::NotPrepared);
            }
        };
        let target = format!("{}:{}", connector.host, connector.port);

        let sock = match connect_tcp(&connector.host, connector.port) {
            Ok(sock) => sock,
            Err(err) => {
                self.transport = Some(Transport::Connector(connector));
                self.log_verification(&target);
                return Err(err);
            }
        };

        let (session, result) =
            Session::establish(StreamOwned::new(connector.conn, sock), target.clone());
        self.transport = Some(Transport::Client(session));
        if let Err(err) = result {
            log::error!("TLS handshake with {target} failed: {err}");
            self.log_verification(&target);
            return Err(ConnectError::Handshake(target, err));
        }

        Ok(())
    }

    /// Build the server transport chain and listen.
    ///
    /// Every accepted connection is wrapped in TLS before the caller
    /// sees it. Reads and writes issued while the handshake is still
    /// in progress are completed transparently rather than returned
    /// short.
    pub fn prepare_accept(&mut self) -> Result<(), ConfigError> {
        self.check_role(Role::Server, |expected, actual| ConfigError::RoleMismatch {
            expected,
            actual,
        })?;
        let Some(TrustContext::Server(config)) = &self.context else {
            log::error!("server accept prepared before configuring the TLS context");
            return Err(ConfigError::NotConfigured);
        };
        let Some(port) = self.config.port else {
            log::error!("no listen port configured");
            return Err(ConfigError::TransportConfig("no listen port".to_string()));
        };
        let host = self
            .config
            .host
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let config = Arc::clone(config);

        // Release any previous listener before binding again.
        self.close_transport();
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind((host.as_str(), port)).map_err(|err| {
            log::error!("failed to create new accept socket on {addr}: {err}");
            ConfigError::ListenSetup { addr, source: err }
        })?;
        let local_addr = listener.local_addr().map_err(|err| {
            log::error!("error setting up accept socket: {err}");
            ConfigError::AcceptSetup(err)
        })?;
        log::info!("Listening for TLS connections on {local_addr}");

        self.transport = Some(Transport::Listener(Listener {
            listener,
            config,
            session: None,
        }));

        Ok(())
    }

    /// Wait for one client and run the server handshake.
    ///
    /// Any session from a previous accept is closed first.
    pub fn accept(&mut self) -> Result<(), AcceptError> {
        self.check_role(Role::Server, |expected, actual| AcceptError::RoleMismatch {
            expected,
            actual,
        })?;
        let Some(Transport::Listener(listener)) = self.transport.as_mut() else {
            log::error!("accept called before prepare_accept");
            return Err(AcceptError::NotPrepared);
        };
        if let Some(mut previous) = listener.session.take() {
            previous.close();
        }

        let (sock, addr) = listener.listener.accept().map_err(|err| {
            log::error!("error accepting client connection: {err}");
            AcceptError::Accept(err)
        })?;
        let remote = addr.to_string();
        if let Err(err) = sock.set_nodelay(true) {
            log::debug!("{remote}: cannot set TCP_NODELAY: {err}");
        }
        let conn = ServerConnection::new(Arc::clone(&listener.config)).map_err(|err| {
            log::error!("failed to create TLS session for {remote}: {err}");
            AcceptError::Session(err)
        })?;

        let (session, result) = Session::establish(StreamOwned::new(conn, sock), remote.clone());
        listener.session = Some(session);
        if let Err(err) = result {
            log::error!("error accepting client connection from {remote}: {err}");
            self.log_verification(&remote);
            return Err(AcceptError::Handshake(remote, err));
        }

        Ok(())
    }

    /// Send one message over the established session.
    pub fn send(&mut self, message: &Message) -> Result<(), SendError> {
        let Some(stream) = self.established_stream() else {
            log::error!("cannot send: no established TLS session");
            return Err(SendError::NotConnected);
        };

        message::send(stream, message)
    }

    /// Receive one message from the established session.
    pub fn receive(&mut self) -> Result<Message, RecvError> {
        let Some(stream) = self.established_stream() else {
            log::error!("cannot receive: no established TLS session");
            return Err(RecvError::NotConnected);
        };

        message::receive(stream)
    }

    /// Whether a handshake completed and the session can carry messages.
    pub fn is_connected(&self) -> bool {
        match &self.transport {
            Some(Transport::Client(session)) => session.is_established(),
            Some(Transport::Listener(Listener {
                session: Some(session),
                ..
            })) => session.is_established(),
            _ => false,
        }
    }

    /// Address a server peer is listening on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.transport {
            Some(Transport::Listener(listener)) => listener.listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Fingerprint of the certificate the remote peer presented.
    ///
    /// See [security::fingerprint].
    pub fn peer_fingerprint(&self) -> Option<String> {
        match &self.transport {
            Some(Transport::Client(session)) => session.peer_fingerprint(),
            Some(Transport::Listener(Listener {
                session: Some(session),
                ..
            })) => session.peer_fingerprint(),
            _ => None,
        }
    }

    /// Release the transport chain, trust context and configuration.
    ///
    /// An established session is closed with a close_notify first.
    /// The peer is left empty but keeps its role; calling this again
    /// does nothing.
    pub fn teardown(&mut self) {
        self.close_transport();
        self.context = None;
        self.config = PeerConfig::default();
    }

    /// Handshake error of the current session.
    ///
    /// `Ok(None)` when there is a session whose handshake didn't fail,
    /// or that hasn't been attempted yet.
    pub(crate) fn handshake_error(&self) -> Result<Option<&rustls::Error>, NoSessionError> {
        match &self.transport {
            Some(Transport::Connector(_)) => Ok(None),
            Some(Transport::Client(session)) => Ok(session.error.as_ref()),
            Some(Transport::Listener(Listener {
                session: Some(session),
                ..
            })) => Ok(session.error.as_ref()),
            Some(Transport::Listener(Listener { session: None, .. })) | None => {
                Err(NoSessionError)
            }
        }
    }

    fn check_role<E>(
        &self,
        expected: Role,
        mismatch: impl FnOnce(Role, Role) -> E,
    ) -> Result<(), E> {
        if self.role != expected {
            log::error!("{} config inappropriate for {} connection", self.role, expected);
            return Err(mismatch(expected, self.role));
        }

        Ok(())
    }

    fn established_stream(&mut self) -> Option<&mut dyn ReadWrite> {
        match &mut self.transport {
            Some(Transport::Client(session)) if session.is_established() => {
                Some(&mut session.stream as &mut dyn ReadWrite)
            }
            Some(Transport::Listener(Listener {
                session: Some(session),
                ..
            })) if session.is_established() => Some(&mut session.stream as &mut dyn ReadWrite),
            _ => None,
        }
    }

    fn log_verification(&self, remote: &str) {
        match verify::report_verification(self) {
            Ok(VerificationOutcome::Ok) => {}
            Ok(VerificationOutcome::Failed(failure)) => {
                log::error!("{remote}: certificate verification failed: {failure}");
            }
            Err(err) => log::error!("{remote}: {err}"),
        }
    }

    fn close_transport(&mut self) {
        match self.transport.take() {
            Some(Transport::Client(mut session)) => session.close(),
            Some(Transport::Listener(Listener {
                session: Some(mut session),
                ..
            })) => session.close(),
            _ => {}
        }
    }
}

impl Drop for TlsPeer {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for TlsPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPeer")
            .field("role", &self.role)
            .field("config", &self.config)
            .field("configured", &self.context.is_some())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let target = format!("{host}:{port}");
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| {
            log::error!("failed to resolve {target}: {err}");
            ConnectError::Resolve(target.clone(), err)
        })?
        .collect::<Vec<_>>();
    let sock = TcpStream::connect(&addrs[..]).map_err(|err| {
        log::error!("failed to connect to {target}: {err}");
        ConnectError::Tcp(target.clone(), err)
    })?;
    if let Err(err) = sock.set_nodelay(true) {
        log::debug!("{target}: cannot set TCP_NODELAY: {err}");
    }

    Ok(sock)
}

impl<C, S> Session<C>
where
    C: DerefMut + Deref<Target = ConnectionCommon<S>>,
    S: SideData,
{
    /// Run the handshake to completion on a new stream.
    ///
    /// The session is returned even if the handshake fails, so the
    /// failure can be reported on.
    fn establish(mut stream: StreamOwned<C, TcpStream>, remote: String) -> (Self, io::Result<()>) {
        let mut result = Ok(());
        while stream.conn.is_handshaking() {
            if let Err(err) = stream.conn.complete_io(&mut stream.sock) {
                result = Err(err);
                break;
            }
        }
        let error = result.as_ref().err().and_then(tls_error);
        let session = Session {
            stream,
            remote,
            error,
        };
        if result.is_ok() {
            log::info!(
                "TLS session with {} established ({:?}, peer certificate {})",
                session.remote,
                session.stream.conn.protocol_version(),
                session
                    .peer_fingerprint()
                    .unwrap_or_else(|| "none".to_string()),
            );
        }

        (session, result)
    }

    fn is_established(&self) -> bool {
        self.error.is_none() && !self.stream.conn.is_handshaking()
    }

    fn peer_fingerprint(&self) -> Option<String> {
        self.stream
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(security::fingerprint)
    }

    /// Send close_notify, if possible, and shut the socket down.
    ///
    /// Never blocks waiting for the remote peer.
    fn close(&mut self) {
        if self.is_established() {
            self.stream.conn.send_close_notify();
            while self.stream.conn.wants_write() {
                match self.stream.conn.write_tls(&mut self.stream.sock) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
        let _ = self.stream.sock.shutdown(Shutdown::Both);
        log::debug!("closed TLS session with {}", self.remote);
    }
}

/// The TLS-level error inside an I/O error, if any.
fn tls_error(err: &io::Error) -> Option<rustls::Error> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .cloned()
}

#[cfg(test)]
mod tests;
