//! Address range helpers for IP pools
//!
//! Turns a pool's CIDR and gateway into the list of addresses that may be
//! handed to VMs.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Longest prefix we accept; anything longer leaves no room for hosts
const MAX_PREFIX: u8 = 30;
/// Every address gets a row, so very large ranges are refused
const MIN_PREFIX: u8 = 16;

/// Network settings of a pool
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub cidr: Ipv4Network,
    pub gateway: Ipv4Addr,
}

impl NetworkConfig {
    /// Parse and validate a CIDR / gateway pair
    pub fn parse(cidr: &str, gateway: &str) -> Result<Self> {
        let net: Ipv4Network = cidr
            .trim()
            .parse()
            .map_err(|e| Error::InvalidNetwork(format!("bad CIDR '{}': {}", cidr, e)))?;
        let gateway: Ipv4Addr = gateway
            .trim()
            .parse()
            .map_err(|e| Error::InvalidNetwork(format!("bad gateway '{}': {}", gateway, e)))?;

        if net.prefix() > MAX_PREFIX {
            return Err(Error::InvalidNetwork(format!(
                "network {} has no usable hosts",
                cidr
            )));
        }
        if net.prefix() < MIN_PREFIX {
            return Err(Error::InvalidNetwork(format!(
                "network {} is larger than /{}",
                cidr, MIN_PREFIX
            )));
        }
        // Normalise host bits away, e.g. 172.16.0.7/24 -> 172.16.0.0/24
        let net = Ipv4Network::new(net.network(), net.prefix())
            .map_err(|e| Error::InvalidNetwork(e.to_string()))?;

        if !net.contains(gateway) {
            return Err(Error::InvalidNetwork(format!(
                "gateway {} is outside {}",
                gateway, net
            )));
        }

        Ok(Self { cidr: net, gateway })
    }

    /// Usable host addresses: the range minus network, broadcast and gateway
    pub fn assignable_hosts(&self) -> Vec<Ipv4Addr> {
        let network = self.cidr.network();
        let broadcast = self.cidr.broadcast();
        self.cidr
            .iter()
            .filter(|ip| *ip != network && *ip != broadcast && *ip != self.gateway)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignable_hosts_excludes_gateway() {
        let config = NetworkConfig::parse("172.16.0.0/24", "172.16.0.1").unwrap();
        let hosts = config.assignable_hosts();
        assert_eq!(hosts.len(), 253);
        assert_eq!(hosts[0], Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(hosts[hosts.len() - 1], Ipv4Addr::new(172, 16, 0, 254));
        assert!(!hosts.contains(&Ipv4Addr::new(172, 16, 0, 1)));
    }

    #[test]
    fn test_small_network() {
        let config = NetworkConfig::parse("10.0.0.0/30", "10.0.0.1").unwrap();
        assert_eq!(config.assignable_hosts(), vec![Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn test_normalises_host_bits() {
        let config = NetworkConfig::parse("10.1.2.99/29", "10.1.2.97").unwrap();
        assert_eq!(config.cidr.to_string(), "10.1.2.96/29");
    }

    #[test]
    fn test_invalid_networks() {
        assert!(matches!(NetworkConfig::parse("nope", "10.0.0.1"), Err(Error::InvalidNetwork(_))));
        assert!(matches!(NetworkConfig::parse("10.0.0.0/24", "nope"), Err(Error::InvalidNetwork(_))));
        assert!(matches!(NetworkConfig::parse("10.0.0.0/31", "10.0.0.1"), Err(Error::InvalidNetwork(_))));
        assert!(matches!(NetworkConfig::parse("10.0.0.0/24", "10.0.1.1"), Err(Error::InvalidNetwork(_))));
        assert!(matches!(NetworkConfig::parse("10.0.0.0/8", "10.0.0.1"), Err(Error::InvalidNetwork(_))));
    }
}
