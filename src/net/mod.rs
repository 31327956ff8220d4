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


//! Transport primitives: dialing and listening.
//!
//! This module provides the raw connections that feed the first
//! stage of a chain, and that stages and connectors establish as
//! their outputs:
//!
//! - [dial] connects to an [Endpoint] over a [Network], trying each
//!   resolved address in turn.
//!
//! - [Listener] accepts connections on a TCP port or a Unix socket.
//!
//! Both produce [Connection]s, which are [Pipeline]s.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use log::debug;
use log::info;
use log::trace;
#[cfg(feature = "unix")]
use log::warn;

use crate::addrs::Endpoint;
use crate::addrs::Network;
use crate::net::tcp::TCPPipeline;
#[cfg(feature = "unix")]
use crate::net::unix::UnixPipeline;
use crate::pipeline::Pipeline;

pub mod tcp;
#[cfg(feature = "unix")]
pub mod unix;

/// A raw connection.
#[derive(Debug)]
pub enum Connection {
    /// A TCP connection.
    TCP(TCPPipeline),
    /// A Unix domain socket connection.
    #[cfg(feature = "unix")]
    Unix(UnixPipeline)
}

/// A listening socket.
///
/// Listeners are non-blocking; [accept](Listener::accept) returns
/// `None` when no connection is pending.  Accepted connections are
/// blocking.
pub enum Listener {
    /// A TCP listener.
    TCP {
        /// The listening socket.
        listener: TcpListener
    },
    /// A Unix domain socket listener.
    ///
    /// The socket file is removed when this is dropped.
    #[cfg(feature = "unix")]
    Unix {
        /// The listening socket.
        listener: std::os::unix::net::UnixListener
    }
}

/// Errors that can occur when dialing.
#[derive(Debug)]
pub enum DialError {
    /// The endpoint could not be resolved.
    Resolve {
        /// The endpoint being dialed.
        endpoint: String,
        /// The resolver error.
        error: Error
    },
    /// No resolved address is usable on the network.
    NoAddrs {
        /// The endpoint being dialed.
        endpoint: String,
        /// The network being dialed.
        network: Network
    },
    /// Every address failed.
    Connect {
        /// The endpoint being dialed.
        endpoint: String,
        /// The error from the last attempt.
        error: Error
    }
}

impl Connection {
    /// Set (or clear) the read and write timeouts.
    pub fn set_timeout(
        &self,
        timeout: Option<Duration>
    ) -> Result<(), Error> {
        match self {
            Connection::TCP(stream) => stream.set_timeout(timeout),
            #[cfg(feature = "unix")]
            Connection::Unix(stream) => stream.set_timeout(timeout)
        }
    }
}

impl Pipeline for Connection {
    #[inline]
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        match self {
            Connection::TCP(stream) => stream.read(buf),
            #[cfg(feature = "unix")]
            Connection::Unix(stream) => stream.read(buf)
        }
    }

    #[inline]
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        match self {
            Connection::TCP(stream) => stream.write(buf),
            #[cfg(feature = "unix")]
            Connection::Unix(stream) => stream.write(buf)
        }
    }

    #[inline]
    fn close(&self) -> Result<(), Error> {
        match self {
            Connection::TCP(stream) => stream.close(),
            #[cfg(feature = "unix")]
            Connection::Unix(stream) => stream.close()
        }
    }

    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::TCP(stream) => stream.local_addr(),
            #[cfg(feature = "unix")]
            Connection::Unix(stream) => stream.local_addr()
        }
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::TCP(stream) => stream.peer_addr(),
            #[cfg(feature = "unix")]
            Connection::Unix(stream) => stream.peer_addr()
        }
    }
}

fn connect_tcp(
    addr: &SocketAddr,
    timeout: Option<Duration>
) -> Result<TcpStream, Error> {
    match timeout {
        Some(timeout) => TcpStream::connect_timeout(addr, timeout),
        None => TcpStream::connect(addr)
    }
}

/// Connect to `endpoint` over `network`.
///
/// For TCP networks, the endpoint is resolved, and each address the
/// network accepts is tried in order until one succeeds.  For the
/// `unix` network, the endpoint's address is the socket path, and
/// the port is ignored.  If `timeout` is given, it bounds each
/// connection attempt.
pub fn dial(
    network: Network,
    endpoint: &Endpoint,
    timeout: Option<Duration>
) -> Result<Connection, DialError> {
    #[cfg(feature = "unix")]
    if network == Network::Unix {
        let path = endpoint.addr().to_string();

        debug!(target: "dial",
               "attempting connection to unix socket {}",
               path);

        return match std::os::unix::net::UnixStream::connect(&path) {
            Ok(stream) => Ok(Connection::Unix(UnixPipeline::from(stream))),
            Err(error) => Err(DialError::Connect {
                endpoint: path,
                error: error
            })
        };
    }

    let addrs = endpoint.socket_addrs().map_err(|error| DialError::Resolve {
        endpoint: endpoint.to_string(),
        error: error
    })?;
    let mut last = None;

    for addr in addrs.iter().filter(|addr| network.accepts(addr)) {
        debug!(target: "dial",
               "attempting connection to {}",
               addr);

        match connect_tcp(addr, timeout) {
            Ok(stream) => {
                trace!(target: "dial",
                       "connected to {} ({})",
                       endpoint, addr);

                return Ok(Connection::TCP(TCPPipeline::from(stream)));
            }
            Err(err) => {
                info!(target: "dial",
                      "error connecting to {} ({}): {}, trying next address",
                      endpoint, addr, err);

                last = Some(err)
            }
        }
    }

    match last {
        Some(error) => Err(DialError::Connect {
            endpoint: endpoint.to_string(),
            error: error
        }),
        None => Err(DialError::NoAddrs {
            endpoint: endpoint.to_string(),
            network: network
        })
    }
}

impl Listener {
    /// Bind a listener.
    ///
    /// For TCP networks, `address` and `port` are resolved, and the
    /// first address the network accepts is bound.  For the `unix`
    /// network, `address` is the socket path, and the port is
    /// ignored.
    pub fn bind(
        network: Network,
        address: &str,
        port: u16
    ) -> Result<Listener, Error> {
        #[cfg(feature = "unix")]
        if network == Network::Unix {
            let listener = std::os::unix::net::UnixListener::bind(address)?;

            listener.set_nonblocking(true)?;

            return Ok(Listener::Unix { listener: listener });
        }

        let host = address
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(address);
        let mut last = Error::new(
            ErrorKind::AddrNotAvailable,
            format!("no {} address for {}", network, address)
        );

        for addr in (host, port).to_socket_addrs()? {
            if network.accepts(&addr) {
                match TcpListener::bind(addr) {
                    Ok(listener) => {
                        listener.set_nonblocking(true)?;

                        return Ok(Listener::TCP { listener: listener });
                    }
                    Err(err) => last = err
                }
            }
        }

        Err(last)
    }

    /// Accept a pending connection, if there is one.
    pub fn accept(&self) -> Result<Option<Connection>, Error> {
        match self {
            Listener::TCP { listener } => match listener.accept() {
                Ok((stream, addr)) => {
                    trace!(target: "listener",
                           "accepted connection from {}",
                           addr);

                    stream.set_nonblocking(false)?;

                    Ok(Some(Connection::TCP(TCPPipeline::from(stream))))
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err)
            },
            #[cfg(feature = "unix")]
            Listener::Unix { listener } => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;

                    Ok(Some(Connection::Unix(UnixPipeline::from(stream))))
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err)
            }
        }
    }

    /// Get the local TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::TCP { listener } => listener.local_addr().ok(),
            #[cfg(feature = "unix")]
            Listener::Unix { .. } => None
        }
    }
}

impl DialError {
    /// Get the kind of the underlying IO error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DialError::Resolve { error, .. } => error.kind(),
            DialError::NoAddrs { .. } => ErrorKind::AddrNotAvailable,
            DialError::Connect { error, .. } => error.kind()
        }
    }
}

#[cfg(feature = "unix")]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { listener } = self {
            match listener.local_addr() {
                Ok(addr) => {
                    if let Some(path) = addr.as_pathname() {
                        match std::fs::remove_file(path) {
                            Ok(()) => {
                                info!(target: "listener",
                                      "cleaned up unix socket {}",
                                      path.to_string_lossy())
                            }
                            Err(err) => {
                                warn!(target: "listener",
                                      "error cleaning up unix socket {} ({})",
                                      path.to_string_lossy(), err)
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "listener",
                          "error getting listener address ({})",
                          err)
                }
            }
        }
    }
}

impl Debug for Listener {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self)
    }
}

impl Display for Listener {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            Listener::TCP { listener } => match listener.local_addr() {
                Ok(addr) => write!(f, "tcp {}", addr),
                Err(_) => write!(f, "tcp (unknown address)")
            },
            #[cfg(feature = "unix")]
            Listener::Unix { listener } => match listener.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => write!(f, "unix {}", path.to_string_lossy()),
                    None => write!(f, "unix (unnamed)")
                },
                Err(_) => write!(f, "unix (unknown address)")
            }
        }
    }
}

impl ScopedError for DialError {
    fn scope(&self) -> ErrorScope {
        match self {
            DialError::Resolve { error, .. } => error.scope(),
            DialError::NoAddrs { .. } => ErrorScope::External,
            DialError::Connect { error, .. } => error.scope()
        }
    }
}

impl Display for DialError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            DialError::Resolve { endpoint, error } => {
                write!(f, "error resolving {}: {}", endpoint, error)
            }
            DialError::NoAddrs { endpoint, network } => {
                write!(f, "no {} addresses for {}", network, endpoint)
            }
            DialError::Connect { endpoint, error } => {
                write!(f, "error connecting to {}: {}", endpoint, error)
            }
        }
    }
}

#[cfg(test)]
use std::thread::sleep;
#[cfg(test)]
use std::thread::spawn;

#[test]
fn test_dial_and_accept() {
    crate::init();

    let listener =
        Listener::bind(Network::TCP4, "127.0.0.1", 0).expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");
    let dialer = spawn(move || {
        let conn = dial(Network::TCP, &Endpoint::from(addr), None)
            .expect("Expected success");

        conn.write(b"hi").expect("Expected success");
        conn
    });
    let accepted = loop {
        match listener.accept().expect("Expected success") {
            Some(conn) => break conn,
            None => sleep(Duration::from_millis(10))
        }
    };
    let mut buf = [0; 2];
    let conn = dialer.join().expect("Expected success");

    assert_eq!(accepted.read(&mut buf).expect("Expected success"), 2);
    assert_eq!(&buf, b"hi");

    conn.close().expect("Expected success");
}

#[test]
fn test_dial_wrong_family() {
    crate::init();

    let endpoint = Endpoint::parse("127.0.0.1", 9);

    assert!(matches!(
        dial(Network::TCP6, &endpoint, None),
        Err(DialError::NoAddrs { .. })
    ));
}

#[test]
fn test_dial_refused() {
    crate::init();

    let listener =
        TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");

    drop(listener);

    let err = dial(Network::TCP, &Endpoint::from(addr), None)
        .expect_err("Expected failure");

    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}
