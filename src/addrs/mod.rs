// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Addresses, endpoints, and networks.
//!
//! This module provides the address vocabulary shared by the stages,
//! the connectors, and the SOCKS5 codec:
//!
//! - [Address]: a tagged union of IPv4, IPv6, and domain-name
//!   addresses.  This mirrors the three SOCKS5 address types.
//!
//! - [Endpoint]: an [Address] paired with a 16-bit port.
//!
//! - [Network]: the stream networks that can be dialed or listened
//!   on (`tcp`, `tcp4`, `tcp6`, and `unix`).
//!
//! Domain names are kept as names until they are dialed; resolution
//! happens at connection time through [Endpoint::socket_addrs].
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;

/// Destination addresses.
///
/// The variants correspond exactly to the SOCKS5 address types.  Use
/// [Address::parse] to build one from a host string; IP literals
/// become [IPv4](Address::IPv4) or [IPv6](Address::IPv6), and
/// everything else is kept as a [Domain](Address::Domain).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Address {
    /// An IPv4 address.
    IPv4(Ipv4Addr),
    /// An IPv6 address.
    IPv6(Ipv6Addr),
    /// A domain name, to be resolved when dialed.
    Domain(String)
}

/// An [Address] and a port.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    addr: Address,
    port: u16
}

/// Stream networks.
///
/// These are parsed from the network names used in configurations.
/// Datagram networks (`udp` and friends) are deliberately absent.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Network {
    /// TCP over either IPv4 or IPv6.
    ///
    /// The configuration name of this value is `tcp`.
    TCP,
    /// TCP restricted to IPv4.
    ///
    /// The configuration name of this value is `tcp4`.
    TCP4,
    /// TCP restricted to IPv6.
    ///
    /// The configuration name of this value is `tcp6`.
    TCP6,
    /// Unix domain stream sockets.
    ///
    /// The configuration name of this value is `unix`.
    #[cfg(feature = "unix")]
    Unix
}

/// Errors that can occur when parsing a [Network] name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkParseError {
    /// The name is not a known network.
    Unknown {
        /// The offending name.
        name: String
    },
    /// The name is a datagram network, which is not supported.
    Datagram {
        /// The offending name.
        name: String
    }
}

impl Address {
    /// Interpret `host` as an address.
    ///
    /// IP literals (including bracketed IPv6 literals) produce IP
    /// addresses; anything else is treated as a domain name.
    pub fn parse(host: &str) -> Address {
        let trimmed = host
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(host);

        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::from(ip),
            Err(_) => Address::Domain(String::from(host))
        }
    }

    /// Check whether this is a domain name.
    #[inline]
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }
}

impl Endpoint {
    /// Create an `Endpoint` from its components.
    #[inline]
    pub fn new(
        addr: Address,
        port: u16
    ) -> Self {
        Endpoint {
            addr: addr,
            port: port
        }
    }

    /// Create an `Endpoint` from a host string and a port.
    ///
    /// See [Address::parse] for how `host` is interpreted.
    #[inline]
    pub fn parse(
        host: &str,
        port: u16
    ) -> Self {
        Endpoint::new(Address::parse(host), port)
    }

    /// Get the address.
    #[inline]
    pub fn addr(&self) -> &Address {
        &self.addr
    }

    /// Get the port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve this endpoint into socket addresses.
    ///
    /// IP addresses resolve to themselves; domain names are resolved
    /// using the system resolver.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, Error> {
        match &self.addr {
            Address::IPv4(ip) => {
                Ok(vec![SocketAddr::new(IpAddr::V4(*ip), self.port)])
            }
            Address::IPv6(ip) => {
                Ok(vec![SocketAddr::new(IpAddr::V6(*ip), self.port)])
            }
            Address::Domain(name) => {
                let addrs: Vec<SocketAddr> =
                    (name.as_str(), self.port).to_socket_addrs()?.collect();

                if addrs.is_empty() {
                    Err(Error::new(
                        ErrorKind::NotFound,
                        format!("no addresses found for {}", name)
                    ))
                } else {
                    Ok(addrs)
                }
            }
        }
    }

    /// Decompose this `Endpoint` into its address and port.
    #[inline]
    pub fn take(self) -> (Address, u16) {
        (self.addr, self.port)
    }
}

impl Network {
    /// Check whether a resolved socket address can be used on this
    /// network.
    #[inline]
    pub fn accepts(
        &self,
        addr: &SocketAddr
    ) -> bool {
        match self {
            Network::TCP => true,
            Network::TCP4 => addr.is_ipv4(),
            Network::TCP6 => addr.is_ipv6(),
            #[cfg(feature = "unix")]
            Network::Unix => false
        }
    }

    /// Get the configuration name of this network.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Network::TCP => "tcp",
            Network::TCP4 => "tcp4",
            Network::TCP6 => "tcp6",
            #[cfg(feature = "unix")]
            Network::Unix => "unix"
        }
    }
}

impl From<IpAddr> for Address {
    #[inline]
    fn from(ip: IpAddr) -> Address {
        match ip {
            IpAddr::V4(ip) => Address::IPv4(ip),
            IpAddr::V6(ip) => Address::IPv6(ip)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    #[inline]
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint::new(Address::from(addr.ip()), addr.port())
    }
}

impl TryFrom<&'_ str> for Network {
    type Error = NetworkParseError;

    fn try_from(name: &str) -> Result<Network, NetworkParseError> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::TCP),
            "tcp4" => Ok(Network::TCP4),
            "tcp6" => Ok(Network::TCP6),
            #[cfg(feature = "unix")]
            "unix" => Ok(Network::Unix),
            "udp" | "udp4" | "udp6" | "unixgram" => {
                Err(NetworkParseError::Datagram {
                    name: String::from(name)
                })
            }
            _ => Err(NetworkParseError::Unknown {
                name: String::from(name)
            })
        }
    }
}

impl ScopedError for NetworkParseError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl Display for Address {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            Address::IPv4(ip) => ip.fmt(f),
            Address::IPv6(ip) => ip.fmt(f),
            Address::Domain(name) => name.fmt(f)
        }
    }
}

impl Display for Endpoint {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match &self.addr {
            Address::IPv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            addr => write!(f, "{}:{}", addr, self.port)
        }
    }
}

impl Display for Network {
    #[inline]
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.name())
    }
}

impl Display for NetworkParseError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NetworkParseError::Unknown { name } => {
                write!(f, "unknown network \"{}\"", name)
            }
            NetworkParseError::Datagram { name } => {
                write!(f, "datagram network \"{}\" is not supported", name)
            }
        }
    }
}

#[test]
fn test_parse_ipv4() {
    crate::init();

    assert_eq!(
        Address::parse("10.1.2.3"),
        Address::IPv4(Ipv4Addr::new(10, 1, 2, 3))
    );
}

#[test]
fn test_parse_ipv6_bracketed() {
    crate::init();

    assert_eq!(Address::parse("[::1]"), Address::IPv6(Ipv6Addr::LOCALHOST));
    assert_eq!(Address::parse("::1"), Address::IPv6(Ipv6Addr::LOCALHOST));
}

#[test]
fn test_parse_domain() {
    crate::init();

    assert_eq!(
        Address::parse("en.wikipedia.org"),
        Address::Domain(String::from("en.wikipedia.org"))
    );
}

#[test]
fn test_endpoint_display() {
    crate::init();

    assert_eq!(Endpoint::parse("::1", 1080).to_string(), "[::1]:1080");
    assert_eq!(Endpoint::parse("127.0.0.1", 80).to_string(), "127.0.0.1:80");
    assert_eq!(
        Endpoint::parse("example.com", 443).to_string(),
        "example.com:443"
    );
}

#[test]
fn test_endpoint_resolve_ip() {
    crate::init();

    let endpoint = Endpoint::parse("127.0.0.1", 8080);
    let addrs = endpoint.socket_addrs().expect("Expected success");

    assert_eq!(addrs, vec![SocketAddr::from(([127, 0, 0, 1], 8080))]);
}

#[test]
fn test_network_names() {
    crate::init();

    assert_eq!(Network::try_from("tcp"), Ok(Network::TCP));
    assert_eq!(Network::try_from("TCP6"), Ok(Network::TCP6));
    assert_eq!(
        Network::try_from("udp"),
        Err(NetworkParseError::Datagram {
            name: String::from("udp")
        })
    );
    assert_eq!(
        Network::try_from("sctp"),
        Err(NetworkParseError::Unknown {
            name: String::from("sctp")
        })
    );
}

#[test]
fn test_network_accepts() {
    crate::init();

    let v4 = SocketAddr::from(([127, 0, 0, 1], 1));
    let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 1));

    assert!(Network::TCP.accepts(&v4));
    assert!(Network::TCP.accepts(&v6));
    assert!(Network::TCP4.accepts(&v4));
    assert!(!Network::TCP4.accepts(&v6));
    assert!(Network::TCP6.accepts(&v6));
    assert!(!Network::TCP6.accepts(&v4));
}
