//! `evsock` command line tool.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use evsock::{
    Address, AddressFamily, ConsoleAppTraits, EventFlags, Socket, SocketConfig, SocketError,
    SocketEvent, SocketId, SocketKind, SocketSystem,
};
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Drives evsock sockets from the command line.
///
/// Addresses are `host:port`, `[ipv6]:port`, or Unix socket paths starting with `/`, `./` or
/// `../`.
#[derive(Parser, Debug)]
#[command(disable_help_subcommand = true, version)]
struct Arguments {
    /// How long blocking operations wait, in milliseconds.
    #[arg(long, env = "EVSOCK_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Echoes everything received back to its sender.
    EchoServer {
        /// The address to serve on.
        #[arg(long, env = "EVSOCK_ADDRESS")]
        address: Address,

        /// Use datagrams instead of a stream.
        #[arg(long)]
        datagram: bool,
    },

    /// Sends one message and prints the reply.
    Send {
        /// The address to send to.
        #[arg(long, env = "EVSOCK_ADDRESS")]
        address: Address,

        /// Use datagrams instead of a stream.
        #[arg(long)]
        datagram: bool,

        /// Do not wait for a reply.
        #[arg(long)]
        no_reply: bool,

        message: String,
    },

    /// Shows how an address is interpreted.
    InspectAddress { address: Address },
}

type EventQueue = Rc<RefCell<VecDeque<(SocketId, SocketEvent)>>>;

fn enqueue(queue: &EventQueue) -> impl FnMut(SocketId, SocketEvent) + 'static {
    let queue = queue.clone();
    move |socket, event| queue.borrow_mut().push_back((socket, event))
}

fn kind(datagram: bool) -> SocketKind {
    if datagram {
        SocketKind::Datagram
    } else {
        SocketKind::Stream
    }
}

/// Writes all of `data`, giving up on the rest when the peer cannot take it right now.
fn write_all(socket: &Socket, mut data: &[u8]) -> evsock::Result<()> {
    while !data.is_empty() {
        match socket.write(data) {
            Ok(written) => data = &data[written..],
            Err(SocketError::WouldBlock) => {
                tracing::warn!(socket = %socket.id(), dropped = data.len(), "peer is not reading");
                return Ok(());
            }
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

/// Echoes until the socket has nothing more to read, returns `false` once the peer is gone.
fn echo(socket: &Socket) -> evsock::Result<bool> {
    let mut buffer = [0; 4096];
    loop {
        match socket.read(&mut buffer) {
            Ok(0) if socket.kind() == SocketKind::Stream => return Ok(false),
            Ok(read) => write_all(socket, &buffer[..read])?,
            Err(SocketError::WouldBlock) => return Ok(true),
            Err(error) => return Err(error),
        }
    }
}

fn accept_all(
    server: &Socket,
    queue: &EventQueue,
    clients: &mut BTreeMap<SocketId, Socket>,
) -> eyre::Result<()> {
    loop {
        let client = match server.accept() {
            Ok(client) => client,
            Err(SocketError::WouldBlock) => return Ok(()),
            Err(error) => return Err(error).wrap_err("accepting connection"),
        };
        client.set_handler_for(EventFlags::INPUT | EventFlags::LOST, enqueue(queue))?;
        tracing::info!(client = %client.id(), peer = %client.peer()?, "client connected");
        clients.insert(client.id(), client);
    }
}

fn echo_server(system: &SocketSystem, address: &Address, kind: SocketKind) -> eyre::Result<()> {
    let queue = EventQueue::default();
    let server = system.socket(kind)?;
    server.set_non_blocking(true)?;
    if address.family() != AddressFamily::Unix {
        server.set_reusable()?;
    }
    server
        .bind(address)
        .wrap_err_with(|| format!("binding {address}"))?;
    match kind {
        SocketKind::Stream => {
            server.listen()?;
            server.set_handler(SocketEvent::Connection, enqueue(&queue))?;
        }
        SocketKind::Datagram => server.set_handler(SocketEvent::Input, enqueue(&queue))?,
    }
    tracing::info!(address = %server.local()?, ?kind, "echo server running");

    let mut clients = BTreeMap::new();
    loop {
        system.poll(None)?;
        let events: Vec<_> = queue.borrow_mut().drain(..).collect();
        for (id, event) in events {
            tracing::trace!(socket = %id, %event, "event");
            match event {
                SocketEvent::Connection => accept_all(&server, &queue, &mut clients)?,
                SocketEvent::Input if id == server.id() => {
                    echo(&server)?;
                }
                SocketEvent::Input => {
                    let Some(client) = clients.get(&id) else {
                        continue;
                    };
                    match echo(client) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::info!(client = %id, "client disconnected");
                            clients.remove(&id);
                        }
                        Err(error) => {
                            tracing::warn!(client = %id, %error, "dropping client");
                            clients.remove(&id);
                        }
                    }
                }
                SocketEvent::Lost => {
                    tracing::info!(client = %id, "connection lost");
                    clients.remove(&id);
                }
                SocketEvent::Output => {}
            }
        }
    }
}

fn send(
    system: &SocketSystem,
    address: &Address,
    kind: SocketKind,
    message: &str,
    reply: bool,
) -> eyre::Result<()> {
    let socket = system.socket(kind)?;
    match kind {
        SocketKind::Stream => socket
            .connect(address)
            .wrap_err_with(|| format!("connecting to {address}"))?,
        SocketKind::Datagram => socket.set_peer(address)?,
    }

    let mut data = message.as_bytes();
    while !data.is_empty() {
        let written = socket.write(data).wrap_err("sending message")?;
        data = &data[written..];
    }
    tracing::debug!(bytes = message.len(), "message sent");

    if reply {
        let mut buffer = [0; 4096];
        let read = socket.read(&mut buffer).wrap_err("waiting for reply")?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&buffer[..read])?;
        writeln!(stdout)?;
    }
    socket.close();
    Ok(())
}

fn inspect_address(address: &Address) -> eyre::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "family: {:?}", address.family())?;
    match address.family() {
        AddressFamily::None => {}
        AddressFamily::Inet => {
            writeln!(stdout, "host: {}", address.inet_host_name()?)?;
            writeln!(stdout, "host address: {:#010x}", address.inet_host_address()?)?;
            writeln!(stdout, "port: {}", address.inet_port()?)?;
        }
        AddressFamily::Inet6 => {
            writeln!(stdout, "host: {}", address.inet6_host_name()?)?;
            writeln!(stdout, "host address: {}", address.inet6_host_address()?)?;
            writeln!(stdout, "port: {}", address.inet6_port()?)?;
        }
        AddressFamily::Unix => {
            writeln!(stdout, "path: {}", address.unix_path()?)?;
        }
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    let args = Arguments::parse();

    eyre::set_hook(Box::new(eyre::DefaultHandler::default_with))?;

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("EVSOCK_LOG")
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .compact()
            .finish(),
    )?;

    let config = SocketConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        ..SocketConfig::default()
    };
    let system = SocketSystem::builder()
        .app_traits(&ConsoleAppTraits)
        .config(config)
        .build()
        .wrap_err("starting socket system")?;

    match args.command {
        Command::EchoServer { address, datagram } => {
            echo_server(&system, &address, kind(datagram))?
        }
        Command::Send {
            address,
            datagram,
            no_reply,
            message,
        } => send(&system, &address, kind(datagram), &message, !no_reply)?,
        Command::InspectAddress { address } => inspect_address(&address)?,
    }

    system.cleanup();
    Ok(())
}
