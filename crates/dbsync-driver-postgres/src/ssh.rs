//! SSH tunnel to the source database
//!
//! The tunnel binds an ephemeral loopback port, then runs two threads: a
//! listener that accepts local connections, and a single multiplexer that
//! owns the SSH session and relays every accepted connection through its own
//! direct-tcpip channel. Keeping all channel I/O on one thread means the
//! session's blocking mode is never toggled concurrently. Dropping the
//! tunnel (the command's cleanup path, including signal teardown) stops both
//! threads and disconnects the session.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, info, warn};

use dbsync_core::{SshAuth, TunnelConfig};

const RELAY_BUF: usize = 32 * 1024;
const LOCAL_READ_TIMEOUT: Duration = Duration::from_millis(5);
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Error types for SSH tunnel operations
#[derive(Debug, thiserror::Error)]
pub enum SshTunnelError {
    #[error("cannot reach SSH server {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("SSH handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("SSH authentication failed for '{username}': {reason}")]
    Auth { username: String, reason: String },

    #[error("could not set up the local tunnel endpoint: {0}")]
    Bind(#[from] std::io::Error),
}

/// Traffic counters accumulated over the tunnel's lifetime.
///
/// `forward_failures` counts connections that could not be relayed (channel
/// open refused, or an I/O error mid-stream); a rising count explains why
/// reads through the tunnel needed the retry operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub connections: u64,
    pub forward_failures: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Debug, Default)]
struct TunnelCounters {
    connections: AtomicU64,
    forward_failures: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// State shared between the tunnel handle and its worker threads
struct TunnelShared {
    remote_host: String,
    remote_port: u16,
    shutdown: AtomicBool,
    counters: TunnelCounters,
}

impl TunnelShared {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// An SSH tunnel forwarding a local loopback port to the remote database
/// server.
pub struct SshTunnel {
    session: Session,
    shared: Arc<TunnelShared>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
    pump_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("local_addr", &self.local_addr)
            .field("remote_host", &self.shared.remote_host)
            .field("remote_port", &self.shared.remote_port)
            .field("shut_down", &self.shared.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl SshTunnel {
    /// Open the SSH session, authenticate, and start forwarding.
    ///
    /// `remote_host`/`remote_port` name the database server as seen from the
    /// SSH server. The local endpoint is bound before this returns, so
    /// callers can dial it immediately.
    pub fn connect(
        config: &TunnelConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self, SshTunnelError> {
        info!(
            ssh_host = %config.host,
            ssh_port = config.port,
            remote = format!("{remote_host}:{remote_port}"),
            "establishing SSH tunnel"
        );

        let auth = config.auth().map_err(|e| SshTunnelError::Auth {
            username: config.username.clone(),
            reason: e.to_string(),
        })?;

        let endpoint = format!("{}:{}", config.host, config.port);
        let timeout = Duration::from_secs(config.timeout_seconds.max(1) as u64);
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| SshTunnelError::Connect {
                endpoint: endpoint.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| SshTunnelError::Connect {
                endpoint: endpoint.clone(),
                source: std::io::Error::new(ErrorKind::NotFound, "hostname resolved to nothing"),
            })?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            SshTunnelError::Connect {
                endpoint: endpoint.clone(),
                source: e,
            }
        })?;

        let mut session = Session::new().map_err(|e| SshTunnelError::Handshake {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        session.set_timeout(timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| SshTunnelError::Handshake {
            endpoint,
            reason: e.to_string(),
        })?;

        authenticate(&session, &config.username, &auth)?;

        if config.keepalive_seconds > 0 {
            session.set_keepalive(true, config.keepalive_seconds);
        }

        // bind before spawning anything so the local endpoint is usable as
        // soon as connect returns
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(TunnelShared {
            remote_host: remote_host.to_string(),
            remote_port,
            shutdown: AtomicBool::new(false),
            counters: TunnelCounters::default(),
        });

        let (jobs_tx, jobs_rx) = mpsc::channel();
        let accept_thread = thread::Builder::new()
            .name("dbsync-tunnel-accept".to_string())
            .spawn({
                let shared = shared.clone();
                move || accept_loop(listener, jobs_tx, shared)
            })?;
        let pump_thread = thread::Builder::new()
            .name("dbsync-tunnel-pump".to_string())
            .spawn({
                let session = session.clone();
                let shared = shared.clone();
                move || pump_loop(session, jobs_rx, shared)
            })?;

        info!(local_port = local_addr.port(), "SSH tunnel ready");
        Ok(Self {
            session,
            shared,
            local_addr,
            accept_thread: Some(accept_thread),
            pump_thread: Some(pump_thread),
        })
    }

    /// Local address of the tunnel entrance
    pub fn local_host(&self) -> &'static str {
        "127.0.0.1"
    }

    /// The local port to dial instead of the remote database address
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Traffic counters so far
    pub fn stats(&self) -> TunnelStats {
        let counters = &self.shared.counters;
        TunnelStats {
            connections: counters.connections.load(Ordering::Relaxed),
            forward_failures: counters.forward_failures.load(Ordering::Relaxed),
            bytes_up: counters.bytes_up.load(Ordering::Relaxed),
            bytes_down: counters.bytes_down.load(Ordering::Relaxed),
        }
    }

    /// Stop forwarding and disconnect. Idempotent; also runs on Drop.
    pub fn close(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(local_port = self.local_addr.port(), "closing SSH tunnel");

        // poke the listener so its blocking accept wakes up and sees the flag
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.pump_thread.take() {
            let _ = handle.join();
        }

        if let Err(e) = self.session.disconnect(None, "tunnel closed", None) {
            debug!(error = %e, "SSH disconnect reported an error");
        }
        debug!("SSH tunnel closed");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

fn authenticate(session: &Session, username: &str, auth: &SshAuth) -> Result<(), SshTunnelError> {
    let auth_err = |reason: String| SshTunnelError::Auth {
        username: username.to_string(),
        reason,
    };

    match auth {
        SshAuth::Password(password) => {
            debug!("authenticating with password");
            session
                .userauth_password(username, password)
                .map_err(|e| auth_err(e.to_string()))?;
        }
        SshAuth::PrivateKey { path, passphrase } => {
            debug!(path = %path.display(), "authenticating with private key");
            if !path.is_file() {
                return Err(auth_err(format!(
                    "private key {} does not exist",
                    path.display()
                )));
            }
            session
                .userauth_pubkey_file(username, None, path, passphrase.as_deref())
                .map_err(|e| auth_err(format!("private key {}: {e}", path.display())))?;
        }
        SshAuth::Agent => {
            debug!("authenticating with SSH agent");
            let mut agent = session.agent().map_err(|e| auth_err(e.to_string()))?;
            agent.connect().map_err(|e| auth_err(e.to_string()))?;
            agent
                .list_identities()
                .map_err(|e| auth_err(format!("cannot list agent identities: {e}")))?;
            let identities = agent.identities().map_err(|e| auth_err(e.to_string()))?;
            if identities.is_empty() {
                return Err(auth_err("SSH agent holds no identities".to_string()));
            }
            let accepted = identities
                .iter()
                .any(|identity| agent.userauth(username, identity).is_ok() && session.authenticated());
            if !accepted {
                return Err(auth_err("no agent identity was accepted".to_string()));
            }
        }
    }

    if !session.authenticated() {
        return Err(auth_err("server did not confirm authentication".to_string()));
    }
    debug!("SSH authentication successful");
    Ok(())
}

/// Accept local connections and hand them to the multiplexer.
fn accept_loop(listener: TcpListener, jobs: mpsc::Sender<TcpStream>, shared: Arc<TunnelShared>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shared.is_shut_down() {
                    break;
                }
                debug!(peer = %peer, "tunnel connection accepted");
                shared.counters.connections.fetch_add(1, Ordering::Relaxed);
                if jobs.send(stream).is_err() {
                    break;
                }
            }
            Err(e) => {
                if shared.is_shut_down() {
                    break;
                }
                warn!(error = %e, "tunnel listener accept failed");
            }
        }
    }
    debug!("tunnel listener stopped");
}

/// Sole owner of the SSH session: adopts accepted connections and relays all
/// of them in one loop, so blocking-mode changes never race.
fn pump_loop(session: Session, jobs: mpsc::Receiver<TcpStream>, shared: Arc<TunnelShared>) {
    session.set_blocking(false);
    let mut relays: Vec<Relay> = Vec::new();
    let mut buf = vec![0u8; RELAY_BUF];

    'pump: while !shared.is_shut_down() {
        loop {
            match jobs.try_recv() {
                Ok(local) => match Relay::open(&session, &shared, local) {
                    Ok(relay) => relays.push(relay),
                    Err(e) => {
                        shared.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "could not open forwarding channel");
                    }
                },
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => break 'pump,
            }
        }

        let mut moved = 0u64;
        relays.retain_mut(|relay| match relay.service(&session, &mut buf, &shared.counters) {
            Ok(Serviced::Open { bytes }) => {
                moved += bytes;
                true
            }
            Ok(Serviced::Closed) => {
                relay.shut_down(&session);
                false
            }
            Err(e) => {
                shared.counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "forwarded connection failed");
                relay.shut_down(&session);
                false
            }
        });

        if moved == 0 {
            thread::sleep(IDLE_WAIT);
        }
    }

    for mut relay in relays {
        relay.shut_down(&session);
    }
    debug!("tunnel pump stopped");
}

enum Serviced {
    Open { bytes: u64 },
    Closed,
}

/// One local connection paired with its direct-tcpip channel
struct Relay {
    local: TcpStream,
    channel: ssh2::Channel,
}

impl Relay {
    fn open(
        session: &Session,
        shared: &TunnelShared,
        local: TcpStream,
    ) -> std::io::Result<Relay> {
        // the local side stays blocking with a short read timeout; writes to
        // it then never truncate
        local.set_read_timeout(Some(LOCAL_READ_TIMEOUT))?;
        session.set_blocking(true);
        let opened =
            session.channel_direct_tcpip(&shared.remote_host, shared.remote_port, None);
        session.set_blocking(false);
        let channel = opened.map_err(std::io::Error::other)?;
        Ok(Relay { local, channel })
    }

    /// Move at most one buffer of data in each direction.
    fn service(
        &mut self,
        session: &Session,
        buf: &mut [u8],
        counters: &TunnelCounters,
    ) -> std::io::Result<Serviced> {
        let mut bytes = 0u64;

        // client -> remote
        match self.local.read(buf) {
            Ok(0) => return Ok(Serviced::Closed),
            Ok(n) => {
                session.set_blocking(true);
                let written = self.channel.write_all(&buf[..n]);
                session.set_blocking(false);
                written?;
                counters.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                bytes += n as u64;
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e),
        }

        // remote -> client
        match self.channel.read(buf) {
            Ok(0) => {
                if self.channel.eof() {
                    return Ok(Serviced::Closed);
                }
            }
            Ok(n) => {
                self.local.write_all(&buf[..n])?;
                counters.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
                bytes += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        Ok(Serviced::Open { bytes })
    }

    fn shut_down(&mut self, session: &Session) {
        session.set_blocking(true);
        let _ = self.channel.send_eof();
        let _ = self.channel.wait_close();
        session.set_blocking(false);
        let _ = self.local.shutdown(Shutdown::Both);
    }
}
