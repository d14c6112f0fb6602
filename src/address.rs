use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        if s.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Empty address",
            ));
        }

        // Accept bracketed IPv6 literals as they appear in URLs and CONNECT lines.
        let unbracketed = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);

        if let Ok(addr) = unbracketed.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(addr));
        }

        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(addr));
        }

        let valid_hostname = s
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'.' || c == b'_');
        if valid_hostname {
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Failed to parse address: {s}"),
        ))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(hostname) => Some(hostname),
            _ => None,
        }
    }

    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Address::Ipv4(i) => write!(f, "{i}"),
            Address::Ipv6(i) => write!(f, "{i}"),
            Address::Hostname(h) => write!(f, "{h}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub const fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        let (address_str, port) = match s.rfind(':') {
            Some(i) => {
                // The ':' could be from an unbracketed ipv6 address.
                match s[i + 1..].parse::<u16>() {
                    Ok(port) if !s[..i].contains(':') || s[..i].ends_with(']') => {
                        (&s[0..i], Some(port))
                    }
                    _ => (s, default_port),
                }
            }
            None => (s, default_port),
        };

        let address = Address::from(address_str)?;
        let port = port.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("No port: {s}"))
        })?;

        Ok(Self { address, port })
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as used in an HTTP CONNECT request line, with IPv6
    /// addresses in brackets.
    pub fn authority(&self) -> String {
        match self.address {
            Address::Ipv6(ref addr) => format!("[{}]:{}", addr, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        self.address
            .ip_addr()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.authority())
    }
}

impl<'de> Deserialize<'de> for NetLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        NetLocation::from_str(&value, None).map_err(serde::de::Error::custom)
    }
}
