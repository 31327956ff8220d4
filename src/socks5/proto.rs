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


//! SOCKS5 wire format.
//!
//! All multi-byte integers are big-endian.  The messages handled
//! here are:
//!
//! - Method request: `[ver:1][nmethods:1][methods:nmethods]`
//! - Method reply: `[ver:1][method:1]`
//! - Request: `[ver:1][cmd:1][rsv:1][atyp:1][addr][port:2]`
//! - Reply: `[ver:1][rep:1][rsv:1][atyp:1][addr][port:2]`
//!
//! Addresses are 4 bytes for IPv4, 16 bytes for IPv6, and
//! `[len:1][name:len]` for domain names.
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
#[cfg(test)]
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use log::trace;

use crate::addrs::Address;
use crate::addrs::Endpoint;
use crate::net::DialError;
use crate::pipeline::Pipeline;
use crate::pipeline::PipelineIO;
use crate::socks5::error::SOCKS5Error;

pub const SOCKS5_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum length of a domain name on the wire.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Reply codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Reply {
    /// `0x00`: the request succeeded.
    Succeeded,
    /// `0x01`: general server failure.
    ServerFailure,
    /// `0x02`: connection not allowed by ruleset.
    NotAllowed,
    /// `0x03`: network unreachable.
    NetworkUnreachable,
    /// `0x04`: host unreachable.
    HostUnreachable,
    /// `0x05`: connection refused.
    ConnectionRefused,
    /// `0x06`: TTL expired.
    TTLExpired,
    /// `0x07`: command not supported.
    CmdNotSupported,
    /// `0x08`: address type not supported.
    AddrTypeNotSupported,
    /// Any other code.
    Unassigned(u8)
}

impl From<u8> for Reply {
    fn from(code: u8) -> Reply {
        match code {
            0x00 => Reply::Succeeded,
            0x01 => Reply::ServerFailure,
            0x02 => Reply::NotAllowed,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TTLExpired,
            0x07 => Reply::CmdNotSupported,
            0x08 => Reply::AddrTypeNotSupported,
            code => Reply::Unassigned(code)
        }
    }
}

impl From<Reply> for u8 {
    fn from(reply: Reply) -> u8 {
        match reply {
            Reply::Succeeded => 0x00,
            Reply::ServerFailure => 0x01,
            Reply::NotAllowed => 0x02,
            Reply::NetworkUnreachable => 0x03,
            Reply::HostUnreachable => 0x04,
            Reply::ConnectionRefused => 0x05,
            Reply::TTLExpired => 0x06,
            Reply::CmdNotSupported => 0x07,
            Reply::AddrTypeNotSupported => 0x08,
            Reply::Unassigned(code) => code
        }
    }
}

impl From<&'_ DialError> for Reply {
    fn from(err: &DialError) -> Reply {
        match err {
            DialError::Resolve { .. } | DialError::NoAddrs { .. } => {
                Reply::HostUnreachable
            }
            DialError::Connect { error, .. } => match error.kind() {
                ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                ErrorKind::TimedOut => Reply::HostUnreachable,
                ErrorKind::AddrNotAvailable => Reply::NetworkUnreachable,
                _ => Reply::ServerFailure
            }
        }
    }
}

impl Display for Reply {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            Reply::Succeeded => write!(f, "succeeded"),
            Reply::ServerFailure => write!(f, "general server failure"),
            Reply::NotAllowed => write!(f, "connection not allowed"),
            Reply::NetworkUnreachable => write!(f, "network unreachable"),
            Reply::HostUnreachable => write!(f, "host unreachable"),
            Reply::ConnectionRefused => write!(f, "connection refused"),
            Reply::TTLExpired => write!(f, "TTL expired"),
            Reply::CmdNotSupported => write!(f, "command not supported"),
            Reply::AddrTypeNotSupported => {
                write!(f, "address type not supported")
            }
            Reply::Unassigned(code) => write!(f, "unassigned code {:#04x}", code)
        }
    }
}

#[inline]
fn read_exact(
    stream: &dyn Pipeline,
    buf: &mut [u8]
) -> Result<(), SOCKS5Error> {
    PipelineIO::new(stream).read_exact(buf)?;

    Ok(())
}

#[inline]
fn read_u8(stream: &dyn Pipeline) -> Result<u8, SOCKS5Error> {
    let mut buf = [0; 1];

    read_exact(stream, &mut buf)?;

    Ok(buf[0])
}

#[inline]
fn write_all(
    stream: &dyn Pipeline,
    buf: &[u8]
) -> Result<(), SOCKS5Error> {
    trace!(target: "socks5-proto",
           "sending {:02x?}",
           buf);

    PipelineIO::new(stream).write_all(buf)?;

    Ok(())
}

#[inline]
fn check_version(version: u8) -> Result<(), SOCKS5Error> {
    if version == SOCKS5_VERSION {
        Ok(())
    } else {
        Err(SOCKS5Error::UnsupportedProtocol { version: version })
    }
}

/// Append the wire encoding of `endpoint` (address type, address,
/// and port) to `buf`.
pub fn encode_endpoint(
    buf: &mut Vec<u8>,
    endpoint: &Endpoint
) -> Result<(), SOCKS5Error> {
    match endpoint.addr() {
        Address::IPv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Address::IPv6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Domain(name) => {
            let len = u8::try_from(name.len())
                .map_err(|_| SOCKS5Error::NameTooLong { len: name.len() })?;

            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(name.as_bytes());
        }
    }

    buf.extend_from_slice(&endpoint.port().to_be_bytes());

    Ok(())
}

/// Read an address of type `atyp`, followed by a port.
pub fn read_endpoint(
    stream: &dyn Pipeline,
    atyp: u8
) -> Result<Endpoint, SOCKS5Error> {
    let addr = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0; 4];

            read_exact(stream, &mut buf)?;

            Address::IPv4(Ipv4Addr::from(buf))
        }
        ATYP_IPV6 => {
            let mut buf = [0; 16];

            read_exact(stream, &mut buf)?;

            Address::IPv6(Ipv6Addr::from(buf))
        }
        ATYP_DOMAIN => {
            let len = read_u8(stream)? as usize;
            let mut buf = vec![0; len];

            read_exact(stream, &mut buf)?;

            let name =
                String::from_utf8(buf).map_err(|_| SOCKS5Error::BadDomainName)?;

            Address::Domain(name)
        }
        atyp => return Err(SOCKS5Error::UnknownAddressType { atyp: atyp })
    };
    let mut port = [0; 2];

    read_exact(stream, &mut port)?;

    Ok(Endpoint::new(addr, u16::from_be_bytes(port)))
}

/// Read a method request, returning the offered methods.
///
/// The version is checked before anything else is read.
pub fn read_method_request(
    stream: &dyn Pipeline
) -> Result<Vec<u8>, SOCKS5Error> {
    check_version(read_u8(stream)?)?;

    let nmethods = read_u8(stream)? as usize;
    let mut methods = vec![0; nmethods];

    read_exact(stream, &mut methods)?;

    Ok(methods)
}

/// Write a method request offering `methods`.
pub fn write_method_request(
    stream: &dyn Pipeline,
    methods: &[u8]
) -> Result<(), SOCKS5Error> {
    let nmethods = u8::try_from(methods.len()).map_err(|_| {
        SOCKS5Error::TooManyMethods {
            count: methods.len()
        }
    })?;
    let mut buf = Vec::with_capacity(methods.len() + 2);

    buf.push(SOCKS5_VERSION);
    buf.push(nmethods);
    buf.extend_from_slice(methods);

    write_all(stream, &buf)
}

/// Read a method reply, returning the selected method.
pub fn read_method_reply(stream: &dyn Pipeline) -> Result<u8, SOCKS5Error> {
    let mut buf = [0; 2];

    read_exact(stream, &mut buf)?;
    check_version(buf[0])?;

    Ok(buf[1])
}

/// Write a method reply selecting `method`.
#[inline]
pub fn write_method_reply(
    stream: &dyn Pipeline,
    method: u8
) -> Result<(), SOCKS5Error> {
    write_all(stream, &[SOCKS5_VERSION, method])
}

/// Read a request header, returning the command and address type.
pub fn read_request_header(
    stream: &dyn Pipeline
) -> Result<(u8, u8), SOCKS5Error> {
    let mut buf = [0; 4];

    read_exact(stream, &mut buf)?;
    check_version(buf[0])?;

    Ok((buf[1], buf[3]))
}

/// Write a request for `command` to `target`.
pub fn write_request(
    stream: &dyn Pipeline,
    command: u8,
    target: &Endpoint
) -> Result<(), SOCKS5Error> {
    let mut buf = Vec::with_capacity(22);

    buf.push(SOCKS5_VERSION);
    buf.push(command);
    buf.push(0);
    encode_endpoint(&mut buf, target)?;

    write_all(stream, &buf)
}

/// Read a reply, returning the bound endpoint.
///
/// Any reply code other than success is an error.
pub fn read_reply(stream: &dyn Pipeline) -> Result<Endpoint, SOCKS5Error> {
    let mut buf = [0; 4];

    read_exact(stream, &mut buf)?;
    check_version(buf[0])?;

    match Reply::from(buf[1]) {
        Reply::Succeeded => read_endpoint(stream, buf[3]),
        reply => Err(SOCKS5Error::ConnectFailed { reply: reply })
    }
}

/// Write a reply with code `reply` and bound endpoint `bound`.
pub fn write_reply(
    stream: &dyn Pipeline,
    reply: Reply,
    bound: &Endpoint
) -> Result<(), SOCKS5Error> {
    let mut buf = Vec::with_capacity(22);

    buf.push(SOCKS5_VERSION);
    buf.push(u8::from(reply));
    buf.push(0);
    encode_endpoint(&mut buf, bound)?;

    write_all(stream, &buf)
}

#[cfg(test)]
use crate::pipeline::duplex::DuplexPipeline;

#[test]
fn test_encode_ipv4() {
    crate::init();

    let mut buf = Vec::new();

    encode_endpoint(&mut buf, &Endpoint::parse("1.2.3.4", 0x1337))
        .expect("Expected success");

    assert_eq!(buf, [0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37]);
}

#[test]
fn test_encode_domain() {
    crate::init();

    let mut buf = Vec::new();

    encode_endpoint(&mut buf, &Endpoint::parse("ABCD", 0x1337))
        .expect("Expected success");

    assert_eq!(buf, [0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x13, 0x37]);
}

#[test]
fn test_encode_ipv6() {
    crate::init();

    let mut buf = Vec::new();

    encode_endpoint(&mut buf, &Endpoint::parse("::1", 80))
        .expect("Expected success");

    let mut expected = vec![0x04];

    expected.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
    expected.extend_from_slice(&[0x00, 0x50]);

    assert_eq!(buf, expected);
}

#[test]
fn test_encode_domain_too_long() {
    crate::init();

    let mut buf = Vec::new();
    let name = "a".repeat(MAX_DOMAIN_LEN + 1);

    match encode_endpoint(&mut buf, &Endpoint::parse(&name, 80)) {
        Err(SOCKS5Error::NameTooLong { len }) => assert_eq!(len, 256),
        res => panic!("Expected NameTooLong, got {:?}", res)
    }
}

#[test]
fn test_encode_domain_max_len() {
    crate::init();

    let mut buf = Vec::new();
    let name = "a".repeat(MAX_DOMAIN_LEN);

    encode_endpoint(&mut buf, &Endpoint::parse(&name, 80))
        .expect("Expected success");

    assert_eq!(buf.len(), 1 + 1 + MAX_DOMAIN_LEN + 2);
    assert_eq!(buf[1], 0xff);
}

#[test]
fn test_read_endpoint_unknown_type() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();

    a.write(&[0x01, 0x02]).expect("Expected success");

    match read_endpoint(&b, 0x02) {
        Err(SOCKS5Error::UnknownAddressType { atyp }) => assert_eq!(atyp, 2),
        res => panic!("Expected UnknownAddressType, got {:?}", res)
    }
}

#[test]
fn test_read_endpoint_truncated() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();

    a.write(&[0x01, 0x02, 0x03]).expect("Expected success");
    a.close().expect("Expected success");

    match read_endpoint(&b, ATYP_IPV4) {
        Err(SOCKS5Error::IOError { error }) => {
            assert_eq!(error.kind(), ErrorKind::UnexpectedEof)
        }
        res => panic!("Expected IOError, got {:?}", res)
    }
}

#[test]
fn test_read_endpoint_bad_utf8() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();

    a.write(&[0x02, 0xc3, 0x28, 0x00, 0x50]).expect("Expected success");

    assert!(matches!(
        read_endpoint(&b, ATYP_DOMAIN),
        Err(SOCKS5Error::BadDomainName)
    ));
}

#[test]
fn test_read_reply_failure_code() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();

    a.write(&[0x05, 0x05, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37])
        .expect("Expected success");

    match read_reply(&b) {
        Err(SOCKS5Error::ConnectFailed { reply }) => {
            assert_eq!(reply, Reply::ConnectionRefused);
            assert_eq!(reply.to_string(), "connection refused");
        }
        res => panic!("Expected ConnectFailed, got {:?}", res)
    }
}

#[test]
fn test_reply_codes_round_trip() {
    crate::init();

    for code in 0..=0x09u8 {
        assert_eq!(u8::from(Reply::from(code)), code);
    }

    assert_eq!(Reply::from(0x09), Reply::Unassigned(0x09));
}

#[test]
fn test_write_method_request_too_many() {
    crate::init();

    let (a, _b) = DuplexPipeline::pair();
    let methods: Vec<u8> = (0..=255u8).collect();

    assert!(matches!(
        write_method_request(&a, &methods),
        Err(SOCKS5Error::TooManyMethods { count: 256 })
    ));
    assert!(write_method_request(&a, &methods[..255]).is_ok());
}

#[test]
fn test_dial_error_reply_codes() {
    crate::init();

    let refused = DialError::Connect {
        endpoint: String::from("127.0.0.1:1"),
        error: Error::from(ErrorKind::ConnectionRefused)
    };
    let timeout = DialError::Connect {
        endpoint: String::from("192.0.2.1:80"),
        error: Error::from(ErrorKind::TimedOut)
    };

    assert_eq!(Reply::from(&refused), Reply::ConnectionRefused);
    assert_eq!(Reply::from(&timeout), Reply::HostUnreachable);
}
