//! TFTP Listeners
//!
//! A listener owns the well-known socket of one configured address. It
//! only ever sees the first datagram of a transfer and hands each one to a
//! new session task.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::{EndpointConfig, IpVersion, ServerConfig};
use crate::options::SessionLimits;
use crate::protocol::{TftpOpcode, get_tftp_opcode};
use crate::session::{SessionContext, serve_request};

/// Largest request datagram accepted on a listen socket
const MAX_REQUEST_LEN: usize = 4096;

/// Pause after a receive error that is not caused by a remote peer
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// One configured listen address
pub struct Listener {
    endpoint: EndpointConfig,
    local_addr: SocketAddr,
    max_block_size: u16,
    socket: Option<StdUdpSocket>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind the socket for `endpoint`
    ///
    /// IPv6 sockets are IPv6-only so an IPv4 and an IPv6 listener can share
    /// a port.
    pub fn bind(endpoint: EndpointConfig, max_block_size: u16) -> Result<Self> {
        let addr = endpoint.socket_addr();

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .with_context(|| format!("Failed to create socket for {}", addr))?;

        if endpoint.ip_version() == IpVersion::V6 {
            socket
                .set_only_v6(true)
                .with_context(|| format!("Failed to set IPV6_V6ONLY on {}", addr))?;
        }

        socket
            .set_nonblocking(true)
            .context("Failed to set socket to non-blocking mode")?;

        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind TFTP listener to {}", addr))?;

        let socket: StdUdpSocket = socket.into();
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        Ok(Self {
            endpoint,
            local_addr,
            max_block_size,
            socket: Some(socket),
            cancel: CancellationToken::new(),
            task: None,
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Bound address, with the real port when port 0 was configured
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_block_size(&self) -> u16 {
        self.max_block_size
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start accepting requests
    ///
    /// Sessions are spawned on `tracker`. The accept loop stops when
    /// `shutdown` (or the parent token) is cancelled. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        &mut self,
        config: &ServerConfig,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let Some(socket) = self.socket.take() else {
            bail!("Listener on {} already started", self.local_addr);
        };
        let socket = UdpSocket::from_std(socket).context("Failed to convert to Tokio socket")?;

        let ctx = Arc::new(SessionContext {
            root: config.working_directory.clone(),
            local_addr: self.local_addr,
            limits: SessionLimits::new(self.max_block_size, config.timeout()),
            max_retries: config.max_retries,
        });

        self.cancel = shutdown.child_token();
        let cancel = self.cancel.clone();
        let tracker = tracker.clone();

        tracing::info!(
            "TFTP listening on {} ({}), max block size {}",
            self.local_addr,
            self.endpoint.ip_version(),
            self.max_block_size
        );

        self.task = Some(tokio::spawn(accept_loop(socket, ctx, tracker, cancel)));
        Ok(())
    }

    /// Stop accepting requests and wait for the accept loop to exit
    ///
    /// Sessions already spawned keep running.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.socket = None;

        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!("Listener on {} ended abnormally: {}", self.local_addr, e);
        }
    }
}

async fn accept_loop(socket: UdpSocket, ctx: Arc<SessionContext>, tracker: TaskTracker, cancel: CancellationToken) {
    let mut buffer = vec![0u8; MAX_REQUEST_LEN];

    loop {
        let (len, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(e) => {
                    if recover(&e, ctx.local_addr, &cancel).await {
                        continue;
                    }
                    break;
                }
            },
        };

        if len < 2 {
            tracing::debug!("Dropping {} byte datagram from {}", len, peer);
            continue;
        }
        // ERROR packets are never answered
        if get_tftp_opcode(&buffer[..len]) == Some(TftpOpcode::Error) {
            tracing::debug!("Dropping ERROR datagram from {}", peer);
            continue;
        }

        tracing::debug!("Request from {} ({} bytes)", peer, len);

        let datagram = buffer[..len].to_vec();
        let ctx = Arc::clone(&ctx);
        let span = tracing::info_span!("session", %peer, file = tracing::field::Empty);
        tracker.spawn(async move { serve_request(&ctx, peer, &datagram).await }.instrument(span));
    }

    tracing::info!("Listener on {} stopped", ctx.local_addr);
}

/// Errors a remote peer can provoke, such as an ICMP port unreachable
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Decide whether the accept loop carries on after `error`
///
/// Other errors wait out a backoff so a broken socket cannot spin. Returns
/// false when cancelled meanwhile.
async fn recover(error: &io::Error, local_addr: SocketAddr, cancel: &CancellationToken) -> bool {
    if is_transient(error) {
        tracing::debug!("Receive failed on {}: {}", local_addr, error);
        return true;
    }

    tracing::warn!("Receive failed on {}: {}", local_addr, error);
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(RECV_ERROR_BACKOFF) => true,
    }
}
