//! TFTP (Trivial File Transfer Protocol) Server
//!
//! An RFC 1350 server with the option extensions of RFC 2347, 2348 and 2349:
//! - Read (RRQ) and write (WRQ) requests
//! - Binary (octet) and text (netascii) transfer modes
//! - Block size negotiation capped per interface MTU (`blksize`)
//! - Per-transfer timeout negotiation (`timeout`)
//! - Transfer size reporting (`tsize`)
//! - Any number of IPv4 and IPv6 listen addresses
//! - Graceful shutdown that lets running transfers finish
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//!
//! use tftp::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::new("/srv/tftp")
//!         .with_endpoint("0.0.0.0:69".parse::<SocketAddr>()?)
//!         .with_endpoint("[::]:69".parse::<SocketAddr>()?)
//!         .with_block_size(1468);
//!
//!     let mut server = Server::configure(config)?;
//!     server.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Security
//!
//! Request filenames are confined to the working directory. Absolute
//! paths, `..` components and symlinks leading outside are refused with an
//! access violation, and existing files are never overwritten.

mod config;
mod listener;
mod mtu;
mod options;
mod protocol;
mod server;
mod session;
mod transfer;

pub mod netascii;

pub use config::*;
pub use listener::Listener;
pub use mtu::{InterfaceAddress, InterfaceMtuProbe};
pub use options::*;
pub use protocol::*;
pub use server::Server;
pub use session::{Received, Session, SessionContext, SessionError, serve_request};
pub use transfer::*;
