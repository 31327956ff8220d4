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


//! SOCKS5 stage and connector.
//!
//! The [SOCKS5StageConfig] stage speaks the responder side of a
//! SOCKS5 CONNECT exchange on its input, and establishes the
//! requested destination as its output.  The destination is reached
//! in one of three ways:
//!
//! - If the stage was given a pre-supplied output (because it is not
//!   the last stage in a chain), that output is used, and the reply
//!   reports `0.0.0.0:0` as the bound address.
//! - If an upstream SOCKS5 server is configured, a [SOCKS5Connector]
//!   asks that server to connect to the destination.
//! - Otherwise, the destination is dialed directly.
//!
//! The [SOCKS5Connector] is also available on its own, as the
//! `socks5` connector (see [connector](crate::connector)).
//!
//! # Nesting
//!
//! Upstream servers can themselves be somersault listeners with a
//! SOCKS5 stage, so a misconfiguration can send a request around a
//! loop.  While an upstream handshake is in progress, the local
//! address of its connection is recorded along with its depth.  A
//! stage whose client connects from one of those addresses is one
//! hop deeper than the stage that dialed it.  A stage at `max-depth`
//! refuses to go upstream, and replies with
//! [NotAllowed](crate::socks5::proto::Reply::NotAllowed).
//!
//! Only nesting within one process is seen this way, and Unix sockets
//! carry no address to record.  Upstream dials and handshakes are
//! also bound by `timeout`, which ends any loop that escapes the
//! depth limit.
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::io::Error;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::trace;

use crate::addrs::Endpoint;
use crate::addrs::Network;
use crate::config::ConfigError;
use crate::config::ConfigField;
use crate::config::Configurable;
use crate::config::FieldKind;
use crate::config::TypedValue;
use crate::connector::millis_timeout;
use crate::connector::Connector;
use crate::connector::ConnectorConfig;
use crate::connector::ConnectorError;
use crate::context::Context;
use crate::net::dial;
use crate::net::Connection;
use crate::pipeline::relay::Relay;
use crate::pipeline::relay::RelayCloseError;
use crate::pipeline::Pipeline;
use crate::pipeline::Stage;
use crate::pipeline::StageConfig;
use crate::pipeline::StageError;
use crate::socks5::auth::AuthMethods;
use crate::socks5::error::SOCKS5Error;
use crate::socks5::handshake::connect;
use crate::socks5::handshake::handshake;
use crate::socks5::handshake::handshake_reply;

pub mod auth;
pub mod error;
pub mod handshake;
pub mod proto;

/// Default timeout for upstream dials and handshakes.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(10000);

/// Default limit on nested upstream handshakes.
pub const DEFAULT_MAX_DEPTH: usize = 8;

const STAGE_FIELDS: &[ConfigField] = &[
    ConfigField::new("network", FieldKind::Str),
    ConfigField::new("address", FieldKind::Str),
    ConfigField::new("port", FieldKind::UInt),
    ConfigField::new("timeout", FieldKind::UInt),
    ConfigField::new("max-depth", FieldKind::UInt)
];

const CONNECTOR_FIELDS: &[ConfigField] = &[
    ConfigField::new("network", FieldKind::Str),
    ConfigField::new("address", FieldKind::Str),
    ConfigField::new("port", FieldKind::UInt),
    ConfigField::new("timeout", FieldKind::UInt)
];

/// Configuration for the SOCKS5 stage.
///
/// # YAML Format
///
/// All fields are optional:
///
/// - `network`: Network used to reach the upstream server (`tcp`,
///   `tcp4`, `tcp6`, or `unix`).  Default is `tcp`.
/// - `address`: Address of an upstream SOCKS5 server.  If empty (the
///   default), destinations are dialed directly.
/// - `port`: Port of the upstream server.
/// - `timeout`: Timeout for the upstream dial and handshake, in
///   milliseconds.  `0` means no timeout.  Default is `10000`.
/// - `max-depth`: Limit on nested upstream handshakes, counting
///   stages reached from this process's own upstream connections.
///   Default is `8`.
///
/// ## Examples
///
/// The following is an example of a chain entry forwarding through
/// an upstream server:
///
/// ```yaml
/// protocol: socks5
/// config:
///   address: proxy.example.com
///   port: 1080
///   timeout: 5000
/// ```
#[derive(Clone)]
pub struct SOCKS5StageConfig {
    network: Network,
    address: String,
    port: u16,
    timeout: Option<Duration>,
    max_depth: usize,
    auth: Arc<AuthMethods>,
    hops: Arc<UpstreamHops>
}

/// A SOCKS5 stage, relaying between a client and its destination.
pub struct SOCKS5Stage {
    relay: Relay,
    target: Endpoint
}

/// Configuration for the `socks5` connector.
///
/// # YAML Format
///
/// - `network`: Network used to reach the server.  Default is `tcp`.
/// - `address`: Address of the SOCKS5 server.  Required.
/// - `port`: Port of the SOCKS5 server.  Required, except for `unix`.
/// - `timeout`: Timeout for the dial and handshake, in milliseconds.
///   Default is `10000`.
#[derive(Clone)]
pub struct SOCKS5ConnectorConfig {
    network: Network,
    address: String,
    port: u16,
    timeout: Option<Duration>,
    auth: Arc<AuthMethods>
}

/// Connector that reaches its targets through a SOCKS5 server.
pub struct SOCKS5Connector {
    network: Network,
    server: Endpoint,
    timeout: Option<Duration>,
    auth: Arc<AuthMethods>,
    hops: Arc<UpstreamHops>,
    depth: usize,
    max_depth: usize,
    closed: AtomicBool
}

/// Local addresses of upstream connections that are still
/// handshaking, with the depth of the stage that made each one.
#[derive(Debug, Default)]
struct UpstreamHops {
    inflight: Mutex<HashMap<SocketAddr, usize>>
}

struct HopGuard<'a> {
    hops: &'a UpstreamHops,
    addr: Option<SocketAddr>
}

impl UpstreamHops {
    /// Get the depth of a stage whose client connected from `peer`.
    fn depth_of(
        &self,
        peer: Option<SocketAddr>
    ) -> usize {
        let peer = match peer {
            Some(peer) => peer,
            None => return 0
        };

        match self.inflight.lock() {
            Ok(guard) => guard.get(&peer).map_or(0, |depth| depth + 1),
            Err(_) => {
                error!(target: "socks5-stage",
                       "mutex poisoned, assuming top-level client");

                0
            }
        }
    }

    fn enter(
        &self,
        local: Option<SocketAddr>,
        depth: usize
    ) -> HopGuard<'_> {
        let addr = match (local, self.inflight.lock()) {
            (Some(local), Ok(mut guard)) => {
                guard.insert(local, depth);

                Some(local)
            }
            (Some(_), Err(_)) => {
                error!(target: "socks5-initiator",
                       "mutex poisoned, not recording upstream hop");

                None
            }
            (None, _) => None
        };

        HopGuard {
            hops: self,
            addr: addr
        }
    }
}

impl Drop for HopGuard<'_> {
    fn drop(&mut self) {
        if let Some(addr) = self.addr {
            match self.hops.inflight.lock() {
                Ok(mut guard) => {
                    guard.remove(&addr);
                }
                Err(_) => {
                    error!(target: "socks5-initiator",
                           "mutex poisoned, upstream hop {} left behind",
                           addr);
                }
            }
        }
    }
}

fn upstream_endpoint(
    network: Network,
    address: &str,
    port: u16
) -> Option<Endpoint> {
    if address.is_empty() {
        return None;
    }

    #[cfg(feature = "unix")]
    if network == Network::Unix {
        return Some(Endpoint::parse(address, 0));
    }

    if port == 0 {
        None
    } else {
        Some(Endpoint::parse(address, port))
    }
}

impl SOCKS5StageConfig {
    /// Create a `SOCKS5StageConfig` with default settings.
    ///
    /// `auth` is used for method negotiation, both as a responder and
    /// with the upstream server.
    pub fn new(auth: Arc<AuthMethods>) -> Self {
        SOCKS5StageConfig {
            network: Network::TCP,
            address: String::new(),
            port: 0,
            timeout: Some(DEFAULT_UPSTREAM_TIMEOUT),
            max_depth: DEFAULT_MAX_DEPTH,
            auth: auth,
            hops: Arc::new(UpstreamHops::default())
        }
    }

    /// Get the upstream server, if one is configured.
    #[inline]
    pub fn upstream(&self) -> Option<Endpoint> {
        upstream_endpoint(self.network, &self.address, self.port)
    }

    /// Get the upstream timeout.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Get the limit on nested upstream handshakes.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn connector(
        &self,
        server: Endpoint,
        depth: usize
    ) -> SOCKS5Connector {
        SOCKS5Connector {
            network: self.network,
            server: server,
            timeout: self.timeout,
            auth: self.auth.clone(),
            hops: self.hops.clone(),
            depth: depth,
            max_depth: self.max_depth,
            closed: AtomicBool::new(false)
        }
    }

    fn establish(
        &self,
        peer: Option<SocketAddr>,
        target: &Endpoint,
        output: Option<Arc<dyn Pipeline>>
    ) -> Result<(Arc<dyn Pipeline>, Option<SocketAddr>), SOCKS5Error> {
        if let Some(output) = output {
            trace!(target: "socks5-stage",
                   "using pre-supplied output for {}",
                   target);

            return Ok((output, None));
        }

        let conn = match self.upstream() {
            Some(server) => {
                let depth = self.hops.depth_of(peer);

                debug!(target: "socks5-stage",
                       "connecting to {} through upstream {} (depth {})",
                       target, server, depth);

                self.connector(server, depth).connect_to(target)?
            }
            None => dial(Network::TCP, target, None)?
        };
        let bound = conn.local_addr();

        Ok((Arc::new(conn), bound))
    }
}

impl Configurable for SOCKS5StageConfig {
    #[inline]
    fn fields(&self) -> &'static [ConfigField] {
        STAGE_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        match field.key() {
            "network" => self.network = value.into_network(field)?,
            "address" => self.address = value.into_string(field)?,
            "port" => self.port = value.into_uint(field)?,
            "timeout" => self.timeout = millis_timeout(value.into_uint(field)?),
            "max-depth" => self.max_depth = value.into_uint(field)?,
            _ => {}
        }

        Ok(())
    }
}

impl StageConfig for SOCKS5StageConfig {
    #[inline]
    fn duplicate(&self) -> Box<dyn StageConfig> {
        Box::new(self.clone())
    }

    fn create(
        &self,
        ctx: &Context,
        input: Arc<dyn Pipeline>,
        output: Option<Arc<dyn Pipeline>>
    ) -> Result<Arc<dyn Stage>, StageError> {
        if ctx.is_cancelled() {
            if let Some(output) = output {
                if let Err(err) = output.close() {
                    debug!(target: "socks5-stage",
                           "error closing output: {}",
                           err);
                }
            }

            return Err(StageError::Cancelled);
        }

        // Unblock the handshake if the context is cancelled.
        let hook_input = input.clone();
        let hook = ctx.on_cancel(move || {
            if let Err(err) = hook_input.close() {
                debug!(target: "socks5-stage",
                       "error closing input on cancellation: {}",
                       err);
            }
        });
        let spare = output.clone();
        let peer = input.peer_addr();
        let res = handshake_reply(input.as_ref(), &self.auth, |target| {
            self.establish(peer, target, output)
        });

        drop(hook);

        let (target, output) = match res {
            Ok(out) => out,
            Err(err) => {
                if let Some(output) = spare {
                    if let Err(err) = output.close() {
                        debug!(target: "socks5-stage",
                               "error closing output: {}",
                               err);
                    }
                }

                if ctx.is_cancelled() {
                    return Err(StageError::Cancelled);
                }

                return Err(StageError::SOCKS5 { err: err });
            }
        };
        let name = match input.peer_addr() {
            Some(peer) => format!("socks5 {} -> {}", peer, target),
            None => format!("socks5 -> {}", target)
        };

        info!(target: "socks5-stage",
              "{}: established",
              name);

        Ok(Arc::new(SOCKS5Stage {
            relay: Relay::new(ctx, name, input, output),
            target: target
        }))
    }
}

impl Debug for SOCKS5StageConfig {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("SOCKS5StageConfig")
            .field("network", &self.network)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl SOCKS5Stage {
    /// Get the destination requested by the client.
    #[inline]
    pub fn target(&self) -> &Endpoint {
        &self.target
    }
}

impl Pipeline for SOCKS5Stage {
    #[inline]
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.relay.read(buf)
    }

    #[inline]
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.relay.write(buf)
    }

    #[inline]
    fn close(&self) -> Result<(), Error> {
        self.relay.close()
    }

    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.relay.local_addr()
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.relay.peer_addr()
    }
}

impl Stage for SOCKS5Stage {
    #[inline]
    fn transport(&self) -> Result<(), RelayCloseError> {
        self.relay.transport()
    }
}

impl Debug for SOCKS5Stage {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("SOCKS5Stage")
            .field("relay", &self.relay)
            .field("target", &self.target)
            .finish()
    }
}

impl SOCKS5ConnectorConfig {
    /// Create a `SOCKS5ConnectorConfig` with no server.
    pub fn new(auth: Arc<AuthMethods>) -> Self {
        SOCKS5ConnectorConfig {
            network: Network::TCP,
            address: String::new(),
            port: 0,
            timeout: Some(DEFAULT_UPSTREAM_TIMEOUT),
            auth: auth
        }
    }
}

impl Configurable for SOCKS5ConnectorConfig {
    #[inline]
    fn fields(&self) -> &'static [ConfigField] {
        CONNECTOR_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        match field.key() {
            "network" => self.network = value.into_network(field)?,
            "address" => self.address = value.into_string(field)?,
            "port" => self.port = value.into_uint(field)?,
            "timeout" => self.timeout = millis_timeout(value.into_uint(field)?),
            _ => {}
        }

        Ok(())
    }
}

impl ConnectorConfig for SOCKS5ConnectorConfig {
    #[inline]
    fn duplicate(&self) -> Box<dyn ConnectorConfig> {
        Box::new(self.clone())
    }

    fn create(&self) -> Result<Box<dyn Connector>, ConnectorError> {
        match upstream_endpoint(self.network, &self.address, self.port) {
            Some(server) => Ok(Box::new(SOCKS5Connector::new(
                self.network,
                server,
                self.timeout,
                self.auth.clone()
            ))),
            None => Err(ConnectorError::Config {
                err: ConfigError::Invalid {
                    key: "address",
                    reason: String::from("SOCKS5 server address and port required")
                }
            })
        }
    }
}

impl Debug for SOCKS5ConnectorConfig {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("SOCKS5ConnectorConfig")
            .field("network", &self.network)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SOCKS5Connector {
    /// Create a `SOCKS5Connector` for `server`, reached over
    /// `network`.
    pub fn new(
        network: Network,
        server: Endpoint,
        timeout: Option<Duration>,
        auth: Arc<AuthMethods>
    ) -> Self {
        SOCKS5Connector {
            network: network,
            server: server,
            timeout: timeout,
            auth: auth,
            hops: Arc::new(UpstreamHops::default()),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            closed: AtomicBool::new(false)
        }
    }

    /// Get the SOCKS5 server.
    #[inline]
    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    /// Check whether the connector has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connector.
    #[inline]
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst)
    }

    /// Connect to `target` through the server.
    ///
    /// The server is dialed, method negotiation is run, and a CONNECT
    /// request is made for `target`.  The timeout applies to the dial
    /// and to every read and write during the exchange, and is
    /// cleared on the returned connection.
    pub fn connect_to(
        &self,
        target: &Endpoint
    ) -> Result<Connection, SOCKS5Error> {
        if self.depth >= self.max_depth {
            return Err(SOCKS5Error::DepthExceeded {
                max: self.max_depth
            });
        }

        let conn = dial(self.network, &self.server, self.timeout)?;
        let hop = self.hops.enter(conn.local_addr(), self.depth);
        let res = self.negotiate(&conn, target);

        drop(hop);

        match res {
            Ok(()) => Ok(conn),
            Err(err) => {
                if let Err(err) = conn.close() {
                    debug!(target: "socks5-initiator",
                           "error closing connection to {}: {}",
                           self.server, err);
                }

                Err(err)
            }
        }
    }

    fn negotiate(
        &self,
        conn: &Connection,
        target: &Endpoint
    ) -> Result<(), SOCKS5Error> {
        conn.set_timeout(self.timeout)?;
        handshake(conn, &self.auth)?;
        connect(conn, target)?;
        conn.set_timeout(None)?;

        Ok(())
    }
}

impl Debug for SOCKS5Connector {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("SOCKS5Connector")
            .field("network", &self.network)
            .field("server", &self.server)
            .field("timeout", &self.timeout)
            .field("depth", &self.depth)
            .field("max_depth", &self.max_depth)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
use std::io::Read;
#[cfg(test)]
use std::io::Write;
#[cfg(test)]
use std::net::TcpListener;
#[cfg(test)]
use std::thread::spawn;
#[cfg(test)]
use std::thread::JoinHandle;

#[cfg(test)]
use crate::addrs::Address;
#[cfg(test)]
use crate::config::project;
#[cfg(test)]
use crate::config::ConfigValue;
#[cfg(test)]
use crate::config::RawConfig;
#[cfg(test)]
use crate::net::tcp::TCPPipeline;
#[cfg(test)]
use crate::pipeline::duplex::DuplexPipeline;
#[cfg(test)]
use crate::pipeline::PipelineIO;
#[cfg(test)]
use crate::socks5::proto::Reply;

// Echo server that answers one connection.
#[cfg(test)]
fn echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");
    let handle = spawn(move || {
        let (mut stream, _) = listener.accept().expect("Expected success");
        let mut buf = [0; 64];

        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => stream.write_all(&buf[..n]).expect("Expected success")
            }
        }
    });

    (addr, handle)
}

// SOCKS5 server that answers one connection with a stage.
#[cfg(test)]
fn socks5_server(
    config: SOCKS5StageConfig
) -> (SocketAddr, JoinHandle<Result<(), String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");
    let handle = spawn(move || {
        let (stream, _) = listener.accept().expect("Expected success");
        let ctx = Context::new();
        let input: Arc<dyn Pipeline> = Arc::new(TCPPipeline::from(stream));
        let stage = config
            .create(&ctx, input.clone(), None)
            .map_err(|err| {
                input.close().expect("Expected success");

                err.to_string()
            })?;

        stage.transport().map_err(|err| err.to_string())
    });

    (addr, handle)
}

#[cfg(test)]
fn ping(stream: &dyn Pipeline) {
    let mut io = PipelineIO::new(stream);
    let mut buf = [0; 5];

    io.write_all(b"hello").expect("Expected success");
    io.read_exact(&mut buf).expect("Expected success");

    assert_eq!(&buf, b"hello");
}

#[test]
fn test_stage_direct_destination() {
    crate::init();

    let (echo, echo_handle) = echo_server();
    let (client, server) = DuplexPipeline::pair();
    let config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));
    let handle = spawn(move || {
        let ctx = Context::new();
        let stage = config
            .create(&ctx, Arc::new(server), None)
            .expect("Expected success");

        stage.transport()
    });
    let auth = AuthMethods::new();

    handshake(&client, &auth).expect("Expected success");

    let bound = connect(&client, &Endpoint::from(echo)).expect("Expected success");

    assert_eq!(bound.addr(), &Address::parse("127.0.0.1"));
    assert_ne!(bound.port(), 0);

    ping(&client);
    client.close().expect("Expected success");

    assert!(handle.join().expect("Expected success").is_ok());
    echo_handle.join().expect("Expected success");
}

#[test]
fn test_stage_presupplied_output() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();
    let (output, far) = DuplexPipeline::pair();
    let config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));
    let handle = spawn(move || {
        let ctx = Context::new();
        let stage = config
            .create(&ctx, Arc::new(server), Some(Arc::new(output)))
            .expect("Expected success");

        stage.transport()
    });
    let auth = AuthMethods::new();
    let target = Endpoint::new(Address::Domain(String::from("example.com")), 443);

    handshake(&client, &auth).expect("Expected success");

    let bound = connect(&client, &target).expect("Expected success");

    assert_eq!(bound.to_string(), "0.0.0.0:0");

    let mut io = PipelineIO::new(&client);
    let mut buf = [0; 4];

    io.write_all(b"ping").expect("Expected success");
    PipelineIO::new(&far)
        .read_exact(&mut buf)
        .expect("Expected success");

    assert_eq!(&buf, b"ping");

    far.close().expect("Expected success");
    client.close().expect("Expected success");

    assert!(handle.join().expect("Expected success").is_ok());
}

#[test]
fn test_stage_connect_refused() {
    crate::init();

    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");

        listener.local_addr().expect("Expected success")
    };
    let (client, server) = DuplexPipeline::pair();
    let config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));
    let handle = spawn(move || {
        let ctx = Context::new();

        config.create(&ctx, Arc::new(server), None).map(|_| ())
    });
    let auth = AuthMethods::new();

    handshake(&client, &auth).expect("Expected success");

    assert!(matches!(
        connect(&client, &Endpoint::from(addr)),
        Err(SOCKS5Error::ConnectFailed {
            reply: Reply::ConnectionRefused
        })
    ));
    assert!(matches!(
        handle.join().expect("Expected success"),
        Err(StageError::SOCKS5 { .. })
    ));
}

#[test]
fn test_stage_through_upstream() {
    crate::init();

    let auth = Arc::new(AuthMethods::new());
    let (echo, echo_handle) = echo_server();
    let (upstream, upstream_handle) =
        socks5_server(SOCKS5StageConfig::new(auth.clone()));
    let mut config = SOCKS5StageConfig::new(auth.clone());
    let mut raw = RawConfig::new();

    raw.insert(String::from("address"), ConfigValue::Str(String::from("127.0.0.1")));
    raw.insert(String::from("port"), ConfigValue::UInt(upstream.port() as u64));
    project(&mut config, &raw).expect("Expected success");

    assert!(config.upstream().is_some());

    let (client, server) = DuplexPipeline::pair();
    let handle = spawn(move || {
        let ctx = Context::new();
        let stage = config
            .create(&ctx, Arc::new(server), None)
            .expect("Expected success");

        stage.transport()
    });

    handshake(&client, &auth).expect("Expected success");
    connect(&client, &Endpoint::from(echo)).expect("Expected success");
    ping(&client);
    client.close().expect("Expected success");

    assert!(handle.join().expect("Expected success").is_ok());
    assert!(upstream_handle.join().expect("Expected success").is_ok());
    echo_handle.join().expect("Expected success");
}

#[test]
fn test_stage_depth_exceeded() {
    crate::init();

    let mut config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));
    let mut raw = RawConfig::new();

    raw.insert(String::from("address"), ConfigValue::Str(String::from("127.0.0.1")));
    raw.insert(String::from("port"), ConfigValue::Str(String::from("1")));
    raw.insert(String::from("max-depth"), ConfigValue::Int(0));
    project(&mut config, &raw).expect("Expected success");

    let (client, server) = DuplexPipeline::pair();
    let handle = spawn(move || {
        let ctx = Context::new();

        config.create(&ctx, Arc::new(server), None).map(|_| ())
    });
    let auth = AuthMethods::new();

    handshake(&client, &auth).expect("Expected success");

    assert!(matches!(
        connect(&client, &Endpoint::parse("127.0.0.1", 80)),
        Err(SOCKS5Error::ConnectFailed {
            reply: Reply::NotAllowed
        })
    ));
    assert!(matches!(
        handle.join().expect("Expected success"),
        Err(StageError::SOCKS5 {
            err: SOCKS5Error::DepthExceeded { max: 0 }
        })
    ));
}

#[test]
fn test_stage_cancelled_during_handshake() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();
    let ctx = Context::new();
    let stage_ctx = ctx.clone();
    let config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));
    let handle = spawn(move || {
        config
            .create(&stage_ctx, Arc::new(server), None)
            .map(|_| ())
    });

    std::thread::sleep(Duration::from_millis(50));
    ctx.cancel();

    assert!(matches!(
        handle.join().expect("Expected success"),
        Err(StageError::Cancelled)
    ));

    client.close().expect("Expected success");
}

#[test]
fn test_stage_config_projection() {
    crate::init();

    let config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));

    assert_eq!(config.upstream(), None);
    assert_eq!(config.timeout(), Some(DEFAULT_UPSTREAM_TIMEOUT));
    assert_eq!(config.max_depth(), DEFAULT_MAX_DEPTH);

    let mut config = config;
    let mut raw = RawConfig::new();

    raw.insert(String::from("network"), ConfigValue::Str(String::from("udp")));

    assert!(matches!(
        project(&mut config, &raw),
        Err(ConfigError::Invalid { key: "network", .. })
    ));

    let mut raw = RawConfig::new();

    raw.insert(String::from("address"), ConfigValue::Str(String::from("::1")));
    raw.insert(String::from("port"), ConfigValue::Float(1080.0));
    raw.insert(String::from("timeout"), ConfigValue::UInt(0));
    project(&mut config, &raw).expect("Expected success");

    assert_eq!(
        config.upstream().map(|endpoint| endpoint.to_string()),
        Some(String::from("[::1]:1080"))
    );
    assert_eq!(config.timeout(), None);
}

#[test]
fn test_connector_requires_server() {
    crate::init();

    let config = SOCKS5ConnectorConfig::new(Arc::new(AuthMethods::new()));

    assert!(matches!(
        config.create(),
        Err(ConnectorError::Config { .. })
    ));
}

#[test]
fn test_connector_through_server() {
    crate::init();

    let auth = Arc::new(AuthMethods::new());
    let (echo, echo_handle) = echo_server();
    let (server, server_handle) =
        socks5_server(SOCKS5StageConfig::new(auth.clone()));
    let mut config = SOCKS5ConnectorConfig::new(auth);
    let mut raw = RawConfig::new();

    raw.insert(String::from("address"), ConfigValue::Str(String::from("127.0.0.1")));
    raw.insert(String::from("port"), ConfigValue::UInt(server.port() as u64));
    project(&mut config, &raw).expect("Expected success");

    let connector = config.create().expect("Expected success");
    let conn = connector
        .connect(Network::TCP, &Endpoint::from(echo))
        .expect("Expected success");

    ping(&conn);
    conn.close().expect("Expected success");

    assert!(server_handle.join().expect("Expected success").is_ok());
    echo_handle.join().expect("Expected success");

    connector.close();

    assert!(matches!(
        connector.connect(Network::TCP, &Endpoint::from(echo)),
        Err(ConnectorError::Closed)
    ));
}

#[test]
fn test_connector_refused_by_server() {
    crate::init();

    let auth = Arc::new(AuthMethods::new());
    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");

        listener.local_addr().expect("Expected success")
    };
    let (server, server_handle) =
        socks5_server(SOCKS5StageConfig::new(auth.clone()));
    let connector = SOCKS5Connector::new(
        Network::TCP,
        Endpoint::from(server),
        Some(Duration::from_secs(5)),
        auth
    );

    assert!(matches!(
        connector.connect_to(&Endpoint::from(refused)),
        Err(SOCKS5Error::ConnectFailed {
            reply: Reply::ConnectionRefused
        })
    ));
    assert!(server_handle.join().expect("Expected success").is_err());
}

#[test]
fn test_upstream_hop_depth() {
    crate::init();

    let hops = UpstreamHops::default();
    let local: SocketAddr = "127.0.0.1:40000".parse().expect("Expected success");
    let other: SocketAddr = "127.0.0.1:40001".parse().expect("Expected success");

    assert_eq!(hops.depth_of(None), 0);
    assert_eq!(hops.depth_of(Some(local)), 0);

    let hop = hops.enter(Some(local), 2);

    assert_eq!(hops.depth_of(Some(local)), 3);
    assert_eq!(hops.depth_of(Some(other)), 0);

    drop(hop);

    assert_eq!(hops.depth_of(Some(local)), 0);

    let hop = hops.enter(None, 5);

    assert_eq!(hops.depth_of(None), 0);

    drop(hop);
}

#[test]
fn test_concurrent_upstream_handshakes() {
    crate::init();

    // Connections land in the backlog, but nothing ever answers.
    let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let server = Endpoint::from(listener.local_addr().expect("Expected success"));
    let mut config = SOCKS5StageConfig::new(Arc::new(AuthMethods::new()));
    let mut raw = RawConfig::new();

    raw.insert(String::from("max-depth"), ConfigValue::UInt(1));
    raw.insert(String::from("timeout"), ConfigValue::UInt(300));
    project(&mut config, &raw).expect("Expected success");

    let handles: Vec<JoinHandle<Result<(), SOCKS5Error>>> = (0..4)
        .map(|_| {
            let config = config.clone();
            let server = server.clone();

            spawn(move || {
                config
                    .connector(server, 0)
                    .connect_to(&Endpoint::parse("127.0.0.1", 80))
                    .map(|_| ())
            })
        })
        .collect();

    for handle in handles {
        let res = handle.join().expect("Expected success");

        assert!(res.is_err());
        assert!(!matches!(res, Err(SOCKS5Error::DepthExceeded { .. })));
    }

    drop(listener);
}
