//! Server configuration
//!
//! The configuration is built once, validated by [`ServerConfig::validate`]
//! and then shared read-only between every listener and session.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::protocol::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;

/// Default per-block timeout in seconds, also the ceiling for the `timeout` option
pub const DEFAULT_TIMEOUT_SECS: u8 = 3;

/// Default number of retransmissions of one packet before a session gives up
pub const DEFAULT_MAX_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// One address the server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl EndpointConfig {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn ip_version(&self) -> IpVersion {
        match self.address {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for EndpointConfig {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for EndpointConfig {
    type Err = anyhow::Error;

    /// Accepts `addr`, `addr,port`, `v4:port` and `[v6]:port`
    ///
    /// # Examples
    /// ```
    /// use tftp::EndpointConfig;
    ///
    /// let endpoint: EndpointConfig = "127.0.0.1,6969".parse().unwrap();
    /// assert_eq!(endpoint.port, 6969);
    ///
    /// let endpoint: EndpointConfig = "::1".parse().unwrap();
    /// assert_eq!(endpoint.port, 69);
    /// ```
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some((address, port)) = s.split_once(',') {
            let address = address
                .trim()
                .parse()
                .with_context(|| format!("Invalid listen address '{}'", address))?;
            let port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid port '{}'", port))?;
            return Ok(Self::new(address, port));
        }

        if let Ok(address) = s.parse::<IpAddr>() {
            return Ok(Self::new(address, DEFAULT_PORT));
        }

        s.parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| anyhow!("Invalid listen endpoint '{}'", s))
    }
}

/// Parse a `;`-separated endpoint list such as `0.0.0.0,69;::,69`
pub fn parse_endpoint_list(s: &str) -> Result<Vec<EndpointConfig>> {
    s.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory files are served from and written to
    pub working_directory: PathBuf,
    /// Addresses to listen on, in order
    pub endpoints: Vec<EndpointConfig>,
    /// Operator cap on the negotiated block size
    pub default_block_size: Option<u16>,
    /// Default timeout in seconds and ceiling for the `timeout` option
    pub default_timeout: u8,
    /// Retransmissions of one packet before a session is abandoned
    pub max_retries: u32,
}

impl ServerConfig {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            endpoints: Vec::new(),
            default_block_size: None,
            default_timeout: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<EndpointConfig>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_block_size(mut self, block_size: u16) -> Self {
        self.default_block_size = Some(block_size);
        self
    }

    pub fn with_timeout(mut self, seconds: u8) -> Self {
        self.default_timeout = seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout.into())
    }

    /// Check everything that can be checked before binding sockets
    pub fn validate(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.working_directory).with_context(|| {
            format!(
                "Working directory {} is not accessible",
                self.working_directory.display()
            )
        })?;
        if !metadata.is_dir() {
            bail!("{} is not a directory", self.working_directory.display());
        }

        if self.endpoints.is_empty() {
            bail!("At least one listen address is required");
        }

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if self.endpoints[..i].contains(endpoint) {
                bail!("Listen address {} is configured twice", endpoint);
            }
        }

        if self.default_timeout == 0 {
            bail!("Timeout must be between 1 and 255 seconds");
        }

        if let Some(size) = self.default_block_size
            && !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size)
        {
            bail!(
                "Block size {} is outside {}..={}",
                size,
                MIN_BLOCK_SIZE,
                MAX_BLOCK_SIZE
            );
        }

        if self.max_retries == 0 {
            bail!("Retry count must be at least 1");
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
            .with_endpoint(EndpointConfig::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT))
    }
}
