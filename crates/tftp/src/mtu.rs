//! Per-interface block size caps
//!
//! A listen address bound to a local interface should not negotiate blocks
//! larger than that interface's MTU. The probe enumerates interface
//! addresses once at configure time and answers cap queries from memory.

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;

use crate::protocol::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// One address assigned to a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub name: String,
    pub address: IpAddr,
    /// `None` when the MTU could not be read
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceMtuProbe {
    interfaces: Vec<InterfaceAddress>,
}

impl InterfaceMtuProbe {
    /// Enumerate local interfaces and their MTUs
    ///
    /// Failing to enumerate interfaces is fatal. An interface whose MTU
    /// cannot be read is kept without one.
    pub fn probe() -> Result<Self> {
        let mut mtus: HashMap<String, Option<u32>> = HashMap::new();
        let mut interfaces = Vec::new();

        for ifa in getifaddrs().context("Failed to enumerate network interfaces")? {
            let Some(address) = ifa.address.as_ref().and_then(|addr| {
                addr.as_sockaddr_in()
                    .map(|sin| IpAddr::V4(sin.ip()))
                    .or_else(|| addr.as_sockaddr_in6().map(|sin6| IpAddr::V6(sin6.ip())))
            }) else {
                continue;
            };

            let mtu = *mtus
                .entry(ifa.interface_name.clone())
                .or_insert_with(|| interface_mtu(&ifa.interface_name));

            interfaces.push(InterfaceAddress {
                name: ifa.interface_name,
                address,
                mtu,
            });
        }

        Ok(Self::from_interfaces(interfaces))
    }

    pub fn from_interfaces(interfaces: Vec<InterfaceAddress>) -> Self {
        Self { interfaces }
    }

    pub fn interfaces(&self) -> &[InterfaceAddress] {
        &self.interfaces
    }

    /// Interface that owns `address`, if any
    pub fn find(&self, address: &IpAddr) -> Option<&InterfaceAddress> {
        self.interfaces.iter().find(|ifa| &ifa.address == address)
    }

    /// Largest block size a session on `address` may negotiate
    ///
    /// `min(interface MTU, 65464, operator cap)`. Addresses matching no
    /// interface, such as the unspecified address, are capped only by the
    /// protocol and the operator.
    pub fn block_size_cap(&self, address: &IpAddr, operator_cap: Option<u16>) -> u16 {
        let mut cap = MAX_BLOCK_SIZE;

        if let Some(mtu) = self.find(address).and_then(|ifa| ifa.mtu) {
            cap = cap.min(u16::try_from(mtu).unwrap_or(u16::MAX));
        }
        if let Some(operator_cap) = operator_cap {
            cap = cap.min(operator_cap);
        }

        cap.max(MIN_BLOCK_SIZE)
    }
}

#[cfg(target_os = "linux")]
fn interface_mtu(name: &str) -> Option<u32> {
    let path = format!("/sys/class/net/{}/mtu", name);
    match std::fs::read_to_string(&path) {
        Ok(contents) => contents.trim().parse().ok(),
        Err(e) => {
            tracing::debug!("Cannot read MTU of {}: {}", name, e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn interface_mtu(name: &str) -> Option<u32> {
    tracing::debug!("MTU lookup unsupported on this platform, {} uncapped", name);
    None
}
