//! TFTP Transfer Sessions
//!
//! One session serves one request from start to finish on its own socket.
//! The socket is bound to the interface the request arrived on, with an
//! ephemeral port, so the port pair identifies the transfer.
//!
//! Every outbound packet that expects an answer goes through
//! [`Session::exchange`], which owns the retransmission policy: resend the
//! identical datagram when the timeout expires, give up after
//! `max_retries` retransmissions.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use crate::options::{Negotiated, OptionSet, SessionLimits};
use crate::protocol::{
    DEFAULT_BLOCK_SIZE, HEADER_LEN, MAX_BLOCK_ID, Packet, RequestKind, TftpError, TftpRequest, TransferMode,
    build_ack, build_data, build_error, build_oack,
};
use crate::transfer::{BlockReader, BlockWriter, create_target, ensure_capacity, open_source, resolve_path};

/// Everything a session needs from the listener that spawned it
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Directory requests are resolved under
    pub root: PathBuf,
    /// Address of the listener socket the request arrived on
    pub local_addr: SocketAddr,
    pub limits: SessionLimits,
    pub max_retries: u32,
}

/// Why a session ended early
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reported to the peer in an ERROR packet
    #[error("{0}")]
    Protocol(#[from] TftpError),
    #[error("peer aborted with error {code}: {message}")]
    Peer { code: u16, message: String },
    #[error("no response for block {block}, giving up")]
    RetriesExhausted { block: u16 },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Result of waiting for the peer
#[derive(Debug)]
pub enum Received {
    Packet(Packet),
    TimedOut,
}

/// Serve one request datagram
///
/// Errors never leave the session. Protocol errors are reported to the
/// peer, everything else is logged.
pub async fn serve_request(ctx: &SessionContext, peer: SocketAddr, datagram: &[u8]) {
    let mut local = ctx.local_addr;
    local.set_port(0);

    let socket = match UdpSocket::bind(local).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("Failed to bind transfer socket on {}: {}", local, e);
            return;
        }
    };

    let mut session = Session::new(socket, peer, ctx);
    let result = session.run(datagram).await;
    session.report(result).await;
}

/// State of one transfer
pub struct Session<'a> {
    ctx: &'a SessionContext,
    socket: UdpSocket,
    peer: SocketAddr,
    block_size: u16,
    timeout: Duration,
    buf: Vec<u8>,
}

impl<'a> Session<'a> {
    /// Create a session pinned to `peer`
    pub fn new(socket: UdpSocket, peer: SocketAddr, ctx: &'a SessionContext) -> Self {
        let mut session = Self {
            ctx,
            socket,
            peer,
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: ctx.limits.default_timeout,
            buf: Vec::new(),
        };
        session.set_block_size(ctx.limits.default_block_size());
        session
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle the request in `datagram` to completion
    pub async fn run(&mut self, datagram: &[u8]) -> Result<(), SessionError> {
        let request = TftpRequest::parse(datagram)?;
        tracing::Span::current().record("file", request.filename.as_str());
        tracing::info!(
            "{} for '{}' in {} mode (options: {:?})",
            request.kind,
            request.filename,
            request.mode,
            request.options
        );

        let options = OptionSet::from_request(&request.options)?;
        let path = resolve_path(&self.ctx.root, &request.filename)?;

        match request.kind {
            RequestKind::Read => self.serve_read(&path, request.mode, &options).await,
            RequestKind::Write => self.serve_write(&path, request.mode, &options).await,
        }
    }

    async fn serve_read(&mut self, path: &Path, mode: TransferMode, options: &OptionSet) -> Result<(), SessionError> {
        let (mut reader, size) = open_source(path, mode).await?;
        let negotiated = options.negotiate(RequestKind::Read, &self.ctx.limits, Some(size));
        negotiated.check_transfer_size()?;
        self.apply(&negotiated);

        if negotiated.needs_oack() {
            let oack = build_oack(&negotiated.oack_options());
            self.exchange(&oack, 0, |packet| acknowledges(packet, 0)).await?;
        }

        let blocks = self.send_blocks(&mut reader).await?;
        tracing::info!("Sent {} bytes in {} blocks to {}", size, blocks, self.peer);
        Ok(())
    }

    async fn send_blocks<R: AsyncRead + Unpin>(&mut self, reader: &mut BlockReader<R>) -> Result<u16, SessionError> {
        let block_size = usize::from(self.block_size);
        let mut block: u16 = 1;

        loop {
            let data = reader
                .next_block(block_size)
                .await
                .map_err(|e| TftpError::not_defined(format!("Read failed: {}", e)))?;

            let packet = build_data(block, &data);
            self.exchange(&packet, block, |packet| acknowledges(packet, block)).await?;

            if data.len() < block_size {
                return Ok(block);
            }
            if block == MAX_BLOCK_ID {
                return Err(TftpError::access_violation("File too large for this block size").into());
            }
            block += 1;
        }
    }

    async fn serve_write(&mut self, path: &Path, mode: TransferMode, options: &OptionSet) -> Result<(), SessionError> {
        let negotiated = options.negotiate(RequestKind::Write, &self.ctx.limits, None);
        let file = create_target(path).await?;

        let admitted = negotiated.check_transfer_size().and_then(|()| match negotiated.transfer_size {
            Some(size) => ensure_capacity(path.parent().unwrap_or(&self.ctx.root), size),
            None => Ok(()),
        });
        if let Err(e) = admitted {
            drop(file);
            discard(path).await;
            return Err(e.into());
        }
        self.apply(&negotiated);

        let first_reply = if negotiated.needs_oack() {
            build_oack(&negotiated.oack_options())
        } else {
            build_ack(0)
        };

        self.store(path, BlockWriter::new(file, mode), first_reply).await
    }

    /// Receive the upload into `writer`, removing `path` if it fails
    async fn store<W: AsyncWrite + Unpin>(
        &mut self,
        path: &Path,
        mut writer: BlockWriter<W>,
        first_reply: Vec<u8>,
    ) -> Result<(), SessionError> {
        let result = match self.receive_blocks(&mut writer, first_reply).await {
            Ok(blocks) => {
                let received = writer.received();
                match writer.finish().await {
                    Ok(_) => Ok((blocks, received)),
                    Err(e) => {
                        tracing::warn!("Failed to flush {}: {}", path.display(), e);
                        Err(TftpError::disk_full().into())
                    }
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((blocks, received)) => {
                // the final ACK goes out only once the file is on disk
                self.socket.send_to(&build_ack(blocks), self.peer).await?;
                tracing::info!("Received {} bytes in {} blocks from {}", received, blocks, self.peer);
                Ok(())
            }
            Err(e) => {
                discard(path).await;
                Err(e)
            }
        }
    }

    async fn receive_blocks<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut BlockWriter<W>,
        first_reply: Vec<u8>,
    ) -> Result<u16, SessionError> {
        let block_size = usize::from(self.block_size);
        let mut reply = first_reply;
        let mut expected: u16 = 1;

        loop {
            let data = self
                .exchange(&reply, expected, |packet| data_for(packet, expected))
                .await?;

            if data.len() > block_size {
                return Err(TftpError::illegal(format!(
                    "Block {} carries {} bytes, block size is {}",
                    expected,
                    data.len(),
                    block_size
                ))
                .into());
            }

            if let Err(e) = writer.write_block(&data).await {
                tracing::warn!("Failed to persist block {}: {}", expected, e);
                return Err(TftpError::disk_full().into());
            }

            if data.len() < block_size {
                return Ok(expected);
            }
            if expected == MAX_BLOCK_ID {
                return Err(TftpError::access_violation("File too large for this block size").into());
            }
            reply = build_ack(expected);
            expected += 1;
        }
    }

    fn apply(&mut self, negotiated: &Negotiated) {
        self.timeout = negotiated.timeout;
        self.set_block_size(negotiated.block_size);
        tracing::debug!(
            "Negotiated blksize={} timeout={:?} tsize={:?}",
            negotiated.block_size,
            negotiated.timeout,
            negotiated.transfer_size
        );
    }

    fn set_block_size(&mut self, block_size: u16) {
        self.block_size = block_size;
        // one spare byte so an oversized DATA is detected rather than truncated
        self.buf.resize(usize::from(block_size) + HEADER_LEN + 1, 0);
    }

    /// Send `outgoing` until `accept` yields a value
    ///
    /// `accept` returns `Ok(None)` for packets to ignore, such as a stale
    /// duplicate, and an error for packets that break the protocol. An
    /// ERROR from the peer always ends the exchange.
    async fn exchange<T>(
        &mut self,
        outgoing: &[u8],
        block: u16,
        mut accept: impl FnMut(Packet) -> Result<Option<T>, SessionError>,
    ) -> Result<T, SessionError> {
        for attempt in 0..=self.ctx.max_retries {
            if attempt > 0 {
                tracing::debug!("Timeout on block {}, retransmitting (attempt {})", block, attempt);
            }
            self.socket.send_to(outgoing, self.peer).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                match self.recv(deadline).await? {
                    Received::TimedOut => break,
                    Received::Packet(Packet::Error { code, message }) => {
                        return Err(SessionError::Peer { code, message });
                    }
                    Received::Packet(packet) => {
                        if let Some(value) = accept(packet)? {
                            return Ok(value);
                        }
                    }
                }
            }
        }

        Err(SessionError::RetriesExhausted { block })
    }

    /// Wait until `deadline` for a datagram from the pinned peer
    ///
    /// Datagrams from any other source are dropped.
    pub async fn recv(&mut self, deadline: Instant) -> Result<Received, SessionError> {
        loop {
            let (len, src) = match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await {
                Ok(result) => result?,
                Err(_) => return Ok(Received::TimedOut),
            };

            if src != self.peer {
                tracing::debug!("Dropping datagram from unknown peer {}", src);
                continue;
            }

            return Ok(Received::Packet(Packet::parse(&self.buf[..len])?));
        }
    }

    /// Log how the session ended and tell the peer about protocol errors
    pub async fn report(&self, result: Result<(), SessionError>) {
        match result {
            Ok(()) => {}
            Err(SessionError::Protocol(error)) => {
                tracing::warn!("Transfer failed: {}", error);
                self.send_error(&error).await;
            }
            Err(e @ SessionError::Peer { .. }) => tracing::info!("{}", e),
            Err(e) => tracing::warn!("Transfer failed: {}", e),
        }
    }

    /// Report `error` to the peer, once
    pub async fn send_error(&self, error: &TftpError) {
        if let Err(e) = self.socket.send_to(&build_error(error), self.peer).await {
            tracing::debug!("Failed to send error to {}: {}", self.peer, e);
        }
    }
}

/// Classify a packet received while waiting for ACK(`block`)
fn acknowledges(packet: Packet, block: u16) -> Result<Option<()>, SessionError> {
    match packet {
        Packet::Ack(n) if n == block => Ok(Some(())),
        Packet::Ack(n) if n < block => {
            tracing::debug!("Ignoring stale ACK {} while waiting for {}", n, block);
            Ok(None)
        }
        Packet::Ack(n) => Err(TftpError::illegal(format!("ACK for unsent block {}", n)).into()),
        other => Err(TftpError::illegal(format!("Unexpected {} while waiting for ACK", other.opcode())).into()),
    }
}

/// Remove a partially written upload
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!("Failed to remove partial {}: {}", path.display(), e);
    }
}

/// Classify a packet received while waiting for DATA(`block`)
///
/// Any block id other than `block` is a protocol error, a repeat of the
/// previous block included.
fn data_for(packet: Packet, block: u16) -> Result<Option<Vec<u8>>, SessionError> {
    match packet {
        Packet::Data { block: n, data } if n == block => Ok(Some(data)),
        Packet::Data { block: n, .. } => {
            Err(TftpError::illegal(format!("Expected block {}, got {}", block, n)).into())
        }
        other => Err(TftpError::illegal(format!("Unexpected {} while waiting for DATA", other.opcode())).into()),
    }
}
