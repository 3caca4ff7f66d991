use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::{fs, io, process};
use tlspeer::utils::logging;
use tlspeer::{MAX_MSG_SIZE, Message, PeerConfig, Role, TlsPeer};

/// Hand a key over TLS from a holder to a retriever.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Cli {
    /// Path to a TOML config file describing this peer.
    ///
    /// Fields: host, port, ca_cert, local_key, local_cert and
    /// require_client_cert.
    #[arg(long, required = true)]
    config: PathBuf,

    /// Host to connect to, or address to listen on.
    ///
    /// Overrides the host set in the config file.
    #[arg(long)]
    host: Option<String>,

    /// Port to connect to, or to listen on.
    ///
    /// Overrides the port set in the config file. A server given
    /// port 0 listens on an ephemeral port.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the key holder: answer each request with a payload.
    ///
    /// The address actually listened on is printed to stdout as
    /// "Listening on <addr>" once the server is ready.
    Serve {
        /// File whose content is sent in reply to every request.
        #[arg(long, required = true)]
        payload: PathBuf,

        /// Exit after answering one request.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Run the key retriever: send one request, get one reply.
    Fetch {
        /// Request message to send.
        #[arg(long, default_value = "key")]
        request: String,

        /// File to write the reply to. Defaults to stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init_with_info_modules(vec!["tlspeer"]);

    let status = match execute(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("ERROR: {err:#}");

            1
        }
    };
    process::exit(status);
}

fn execute(cli: &Cli) -> anyhow::Result<()> {
    let mut config = parse_config(&cli.config)
        .with_context(|| format!("{}: failed to read TOML config file", cli.config.display()))?;
    if let Some(host) = &cli.host {
        config.host = Some(host.clone());
    }
    if let Some(port) = cli.port {
        config.port = Some(port);
    }

    match &cli.command {
        Command::Serve { payload, once } => {
            let payload = read_payload(payload)?;
            serve(config, payload, *once)
        }
        Command::Fetch { request, output } => {
            let reply = fetch(config, request)?;
            write_output(output.as_deref(), &reply)
        }
    }
}

fn parse_config(path: &Path) -> anyhow::Result<PeerConfig> {
    let content = fs::read_to_string(path)?;

    Ok(toml::from_str(&content)?)
}

fn read_payload(path: &Path) -> anyhow::Result<Message> {
    let payload =
        fs::read(path).with_context(|| format!("{}: failed to read payload", path.display()))?;
    if payload.is_empty() || payload.len() > MAX_MSG_SIZE {
        anyhow::bail!(
            "{}: payload must be between 1 and {MAX_MSG_SIZE} bytes, got {}",
            path.display(),
            payload.len()
        );
    }

    Ok(Message::new(payload))
}

fn serve(config: PeerConfig, payload: Message, once: bool) -> anyhow::Result<()> {
    let mut peer = TlsPeer::new(Role::Server, config);
    peer.configure().context("failed to configure TLS")?;
    peer.prepare_accept().context("failed to listen")?;
    let addr = peer
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("server is not listening"))?;
    println!("Listening on {addr}");
    io::stdout().flush()?;

    loop {
        match answer(&mut peer, &payload) {
            Ok(()) if once => break,
            Ok(()) => {}
            Err(err) if once => return Err(err),
            Err(err) => log::warn!("request failed: {err:#}"),
        }
    }
    peer.teardown();

    Ok(())
}

fn answer(peer: &mut TlsPeer, payload: &Message) -> anyhow::Result<()> {
    peer.accept().context("failed to accept connection")?;
    let request = peer.receive().context("failed to receive request")?;
    log::info!("Received request of {} bytes", request.size());
    peer.send(payload).context("failed to send reply")?;

    Ok(())
}

fn fetch(config: PeerConfig, request: &str) -> anyhow::Result<Message> {
    let mut peer = TlsPeer::new(Role::Client, config);
    peer.configure().context("failed to configure TLS")?;
    peer.prepare_connect().context("failed to prepare connection")?;
    if let Err(err) = peer.connect() {
        return Err(explain_handshake(&peer, err.into()));
    }
    peer.send(&Message::from(request.as_bytes())).context("failed to send request")?;
    let reply = peer.receive().context("failed to receive reply")?;
    peer.teardown();

    Ok(reply)
}

/// Add the verification failure, if there is one, to a connect error.
fn explain_handshake(peer: &TlsPeer, err: anyhow::Error) -> anyhow::Error {
    match tlspeer::report_verification(peer) {
        Ok(tlspeer::VerificationOutcome::Failed(failure)) => {
            err.context(format!("certificate verification failed: {failure}"))
        }
        _ => err.context("failed to connect"),
    }
}

fn write_output(output: Option<&Path>, reply: &Message) -> anyhow::Result<()> {
    match output {
        Some(path) => fs::write(path, reply.body())
            .with_context(|| format!("{}: failed to write reply", path.display())),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(reply.body())?;
            stdout.flush()?;

            Ok(())
        }
    }
}
