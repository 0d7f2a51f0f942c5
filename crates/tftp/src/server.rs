//! TFTP Server Implementation
//!
//! The server owns one [`Listener`] per configured address and the set of
//! running sessions. Shutdown stops every listener first, then waits for
//! the sessions already in flight to finish on their own.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::listener::Listener;
use crate::mtu::InterfaceMtuProbe;

/// Main TFTP server
pub struct Server {
    config: ServerConfig,
    listeners: Vec<Listener>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

impl Server {
    /// Validate `config`, probe interface MTUs and bind every listen address
    ///
    /// Nothing is served until [`Server::start`] is called.
    pub fn configure(config: ServerConfig) -> Result<Self> {
        config.validate().context("Invalid server configuration")?;

        let probe = InterfaceMtuProbe::probe()?;
        let mut listeners = Vec::with_capacity(config.endpoints.len());

        for endpoint in &config.endpoints {
            let cap = probe.block_size_cap(&endpoint.address, config.default_block_size);
            match probe.find(&endpoint.address) {
                Some(ifa) => tracing::debug!(
                    "{} is on {} (mtu {:?}), block size capped at {}",
                    endpoint,
                    ifa.name,
                    ifa.mtu,
                    cap
                ),
                None => tracing::debug!("{} matches no interface, block size capped at {}", endpoint, cap),
            }

            listeners.push(Listener::bind(*endpoint, cap)?);
        }

        Ok(Self {
            config,
            listeners,
            sessions: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start every listener
    ///
    /// Returns once all of them are accepting requests. Must be called
    /// from within a Tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        for listener in &mut self.listeners {
            listener.start(&self.config, &self.sessions, &self.shutdown)?;
        }

        tracing::info!(
            "TFTP server started on {} address(es), serving files from {}",
            self.listeners.len(),
            self.config.working_directory.display()
        );
        Ok(())
    }

    /// Bound address of every listener, in configuration order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Number of sessions still running
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the listeners and wait for every running session to finish
    pub async fn shutdown(mut self) {
        self.stop_listeners().await;
        self.sessions.wait().await;
        tracing::info!("TFTP server stopped");
    }

    /// Like [`Server::shutdown`], but stop waiting for sessions after `deadline`
    ///
    /// Returns `false` if sessions were still running at the deadline. They
    /// are left to finish in the background.
    pub async fn shutdown_with_deadline(mut self, deadline: Duration) -> bool {
        self.stop_listeners().await;

        match tokio::time::timeout(deadline, self.sessions.wait()).await {
            Ok(()) => {
                tracing::info!("TFTP server stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    "{} session(s) still running after {:?}",
                    self.sessions.len(),
                    deadline
                );
                false
            }
        }
    }

    async fn stop_listeners(&mut self) {
        let active = self.sessions.len();
        tracing::info!("Shutting down, waiting for {} active session(s)", active);

        self.shutdown.cancel();
        for listener in &mut self.listeners {
            listener.shutdown().await;
        }
        self.sessions.close();
    }
}
