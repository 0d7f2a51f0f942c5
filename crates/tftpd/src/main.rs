//! tftpd - Main executable
//!
//! Serves one directory over TFTP on any number of IPv4 and IPv6 addresses.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, Server, ServerConfig, parse_endpoint_list};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDRESSES: &str = "0.0.0.0,69;::,69";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server with blksize, timeout and tsize option support",
    example = "Serve /srv/tftp on every IPv4 and IPv6 address:\n  {command_name} -d /srv/tftp",
    example = "Listen on two addresses with a 1468 byte block size cap:\n  {command_name} -d /srv/tftp -a \"10.0.0.1,69;fe80::1,69\" -s 1468",
    example = "Non-root testing on a high port:\n  {command_name} -d ./files -a 127.0.0.1,6969"
)]
struct CliConfig {
    #[argh(option, short = 'd', description = "directory to serve files from and store uploads in")]
    directory: PathBuf,

    #[argh(
        option,
        short = 'a',
        description = "listen addresses as \"addr,port;addr,port\"",
        default = "DEFAULT_ADDRESSES.to_string()"
    )]
    addresses: String,

    #[argh(
        option,
        short = 't',
        description = "default timeout in seconds, also the largest a client may negotiate",
        default = "DEFAULT_TIMEOUT_SECS"
    )]
    timeout: u8,

    #[argh(option, short = 's', description = "largest block size any client may negotiate")]
    block_size: Option<u16>,

    #[argh(
        option,
        short = 'r',
        description = "retransmissions before a transfer is abandoned",
        default = "DEFAULT_MAX_RETRIES"
    )]
    retries: u32,

    #[argh(
        option,
        description = "seconds to wait for running transfers on shutdown, forever if unset"
    )]
    drain_timeout: Option<u64>,
}

impl CliConfig {
    fn into_server_config(self) -> Result<ServerConfig> {
        let endpoints = parse_endpoint_list(&self.addresses)
            .with_context(|| format!("Invalid listen addresses: {}", self.addresses))?;

        let mut config = ServerConfig::new(self.directory)
            .with_timeout(self.timeout)
            .with_max_retries(self.retries);
        config.endpoints = endpoints;
        config.default_block_size = self.block_size;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_config: CliConfig = argh::from_env();
    let drain_timeout = cli_config.drain_timeout.map(Duration::from_secs);
    let server_config = cli_config.into_server_config()?;

    let mut server = Server::configure(server_config)?;
    server.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    match drain_timeout {
        Some(deadline) => {
            if !server.shutdown_with_deadline(deadline).await {
                tracing::warn!("Exiting with transfers still in progress");
            }
        }
        None => server.shutdown().await,
    }

    Ok(())
}
