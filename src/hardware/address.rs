//! VISA-style resource strings.
//!
//! Supported forms (interface prefix is case-insensitive, board number optional):
//! - `TCPIP0::192.168.1.100::INSTR`: raw SCPI socket on port 5025
//! - `TCPIP0::192.168.1.100::inst0::INSTR`: same; the LAN device name is ignored
//! - `TCPIP0::192.168.1.100::5025::SOCKET`: raw SCPI socket on an explicit port

use crate::error::DaqError;
use std::fmt;
use std::str::FromStr;

/// Port of the raw SCPI socket on Keithley LAN instruments.
pub const RAW_SOCKET_PORT: u16 = 5025;

/// A parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// Raw SCPI socket.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl ResourceAddress {
    /// Parse a VISA resource string; anything but a TCPIP resource is rejected.
    pub fn parse(address: &str) -> Result<Self, DaqError> {
        let invalid = |reason: &str| DaqError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = address.trim().split("::").collect();
        let interface = parts[0].to_ascii_uppercase();
        let Some(board) = interface.strip_prefix("TCPIP") else {
            return Err(invalid("only TCPIP resources are supported"));
        };
        if !board.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("malformed TCPIP board number"));
        }

        let host = parts
            .get(1)
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        let class = parts.last().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
        match (parts.len(), class.as_str()) {
            (3, "INSTR") | (4, "INSTR") => Ok(ResourceAddress::Tcp {
                host,
                port: RAW_SOCKET_PORT,
            }),
            (4, "SOCKET") => {
                let port = parts[2]
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| invalid("socket port is not a number"))?;
                Ok(ResourceAddress::Tcp { host, port })
            }
            _ => Err(invalid("expected <host>::INSTR or <host>::<port>::SOCKET")),
        }
    }
}

impl FromStr for ResourceAddress {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Tcp { host, port } => write!(f, "TCPIP::{host}::{port}::SOCKET"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> ResourceAddress {
        ResourceAddress::Tcp {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_instr_resource_uses_raw_socket_port() {
        assert_eq!(
            ResourceAddress::parse("TCPIP::192.0.2.5::INSTR").unwrap(),
            tcp("192.0.2.5", 5025)
        );
        assert_eq!(
            ResourceAddress::parse("tcpip0::k2470.lab::inst0::instr").unwrap(),
            tcp("k2470.lab", 5025)
        );
    }

    #[test]
    fn test_socket_resource() {
        let address: ResourceAddress = "TCPIP0::127.0.0.1::5555::SOCKET".parse().unwrap();
        assert_eq!(address, tcp("127.0.0.1", 5555));
        assert_eq!(address.to_string(), "TCPIP::127.0.0.1::5555::SOCKET");
    }

    #[test]
    fn test_rejected_resources() {
        for bad in [
            "GPIB0::18::INSTR",
            "USB0::0x05E6::0x2470::04412345::INSTR",
            "ASRL3::INSTR",
            "TCPIP::::INSTR",
            "TCPIP::192.0.2.5",
            "TCPIP::192.0.2.5::port::SOCKET",
            "TCPIPX::192.0.2.5::INSTR",
            "",
        ] {
            assert!(
                matches!(ResourceAddress::parse(bad), Err(DaqError::InvalidAddress { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
