//! Network interface model

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Addressing mode, derived from which static configs are present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingMode {
    Dhcp,
    StaticIpv4,
    StaticIpv6,
    DualStack,
}

impl AddressingMode {
    pub fn is_static(&self) -> bool {
        *self != AddressingMode::Dhcp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Config {
    pub address: Ipv4Addr,
    pub prefix_length: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Config {
    pub address: Ipv6Addr,
    pub prefix_length: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv6Addr>,
}

/// A declared network interface, attached to the port group named by `label`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Config>,
}

impl NetworkInterfaceSpec {
    pub fn dhcp(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ipv4: None,
            ipv6: None,
        }
    }

    pub fn ipv4(mut self, address: Ipv4Addr, prefix_length: u8) -> Self {
        self.ipv4 = Some(Ipv4Config {
            address,
            prefix_length,
            gateway: None,
        });
        self
    }

    pub fn ipv4_gateway(mut self, gateway: Ipv4Addr) -> Self {
        if let Some(ref mut ipv4) = self.ipv4 {
            ipv4.gateway = Some(gateway);
        }
        self
    }

    pub fn ipv6(mut self, address: Ipv6Addr, prefix_length: u8) -> Self {
        self.ipv6 = Some(Ipv6Config {
            address,
            prefix_length,
            gateway: None,
        });
        self
    }

    pub fn ipv6_gateway(mut self, gateway: Ipv6Addr) -> Self {
        if let Some(ref mut ipv6) = self.ipv6 {
            ipv6.gateway = Some(gateway);
        }
        self
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        match (&self.ipv4, &self.ipv6) {
            (None, None) => AddressingMode::Dhcp,
            (Some(_), None) => AddressingMode::StaticIpv4,
            (None, Some(_)) => AddressingMode::StaticIpv6,
            (Some(_), Some(_)) => AddressingMode::DualStack,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.label.is_empty() {
            return Err(crate::Error::Config("network interface label cannot be empty".into()));
        }
        if let Some(ref ipv4) = self.ipv4 {
            if ipv4.prefix_length == 0 || ipv4.prefix_length > 32 {
                return Err(crate::Error::Config(format!(
                    "ipv4_prefix_length must be between 1 and 32, got {}",
                    ipv4.prefix_length
                )));
            }
        }
        if let Some(ref ipv6) = self.ipv6 {
            if ipv6.prefix_length == 0 || ipv6.prefix_length > 128 {
                return Err(crate::Error::Config(format!(
                    "ipv6_prefix_length must be between 1 and 128, got {}",
                    ipv6.prefix_length
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addressing_mode() {
        let nic = NetworkInterfaceSpec::dhcp("LAN");
        assert_eq!(nic.addressing_mode(), AddressingMode::Dhcp);
        assert!(!nic.addressing_mode().is_static());

        let nic = nic.ipv4(Ipv4Addr::new(10, 0, 0, 5), 24);
        assert_eq!(nic.addressing_mode(), AddressingMode::StaticIpv4);

        let nic = nic.ipv6("fd00::5".parse().unwrap(), 64);
        assert_eq!(nic.addressing_mode(), AddressingMode::DualStack);
    }

    #[test]
    fn test_gateway_requires_address() {
        let nic = NetworkInterfaceSpec::dhcp("LAN").ipv4_gateway(Ipv4Addr::new(10, 0, 0, 1));
        assert!(nic.ipv4.is_none());

        let nic = NetworkInterfaceSpec::dhcp("LAN")
            .ipv4(Ipv4Addr::new(10, 0, 0, 5), 24)
            .ipv4_gateway(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(nic.ipv4.unwrap().gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_prefix_validation() {
        let nic = NetworkInterfaceSpec::dhcp("LAN").ipv4(Ipv4Addr::new(10, 0, 0, 5), 33);
        assert!(nic.validate().is_err());

        let nic = NetworkInterfaceSpec::dhcp("LAN").ipv6("fd00::5".parse().unwrap(), 64);
        assert!(nic.validate().is_ok());

        assert!(NetworkInterfaceSpec::dhcp("").validate().is_err());
    }
}
