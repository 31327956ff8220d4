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


//! Outbound connectors.
//!
//! A [Connector] establishes an outbound stream to a target
//! [Endpoint], possibly through some intermediary.  Connectors are
//! created from a [ConnectorConfig], which is materialized from an
//! untyped configuration in the same way as stage configurations
//! (see [project](crate::config::project)).
//!
//! Two connectors are built in, registered by
//! [ConnectorRegistry::with_builtins]:
//!
//! - `direct`: a [DirectConnector], which dials the target itself.
//! - `socks5`: a [SOCKS5Connector], which dials a SOCKS5 server and
//!   asks it to connect to the target.
//!
//! # YAML Format
//!
//! Connector configurations are flat mappings.  The `direct`
//! connector accepts one optional field:
//!
//! - `timeout`: Connection timeout in milliseconds.  `0` (the
//!   default) means no timeout.
//!
//! See [SOCKS5ConnectorConfig] for the fields accepted by `socks5`.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use log::debug;
use log::trace;

use crate::addrs::Address;
use crate::addrs::Endpoint;
use crate::addrs::Network;
use crate::config::project;
use crate::config::ConfigError;
use crate::config::ConfigField;
use crate::config::Configurable;
use crate::config::FieldKind;
use crate::config::RawConfig;
use crate::config::TypedValue;
use crate::net::dial;
use crate::net::Connection;
use crate::net::DialError;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::socks5::auth::AuthMethods;
use crate::socks5::error::SOCKS5Error;
use crate::socks5::SOCKS5Connector;
use crate::socks5::SOCKS5ConnectorConfig;

/// An outbound session establisher.
pub trait Connector: Debug + Send + Sync {
    /// Establish a stream to `target` over `network`.
    fn connect(
        &self,
        network: Network,
        target: &Endpoint
    ) -> Result<Connection, ConnectorError>;

    /// Release the connector.
    ///
    /// Subsequent calls to [connect](Connector::connect) fail with
    /// [Closed](ConnectorError::Closed).  Streams that were already
    /// established are not affected.
    fn close(&self);
}

/// Typed configuration and constructor for a [Connector].
pub trait ConnectorConfig: Configurable + Debug + Send + Sync {
    /// Get a boxed copy of this configuration.
    fn duplicate(&self) -> Box<dyn ConnectorConfig>;

    /// Create a connector.
    fn create(&self) -> Result<Box<dyn Connector>, ConnectorError>;
}

/// Registry of connector prototypes, keyed by protocol name.
#[derive(Debug)]
pub struct ConnectorRegistry {
    registry: Registry<String, Arc<dyn ConnectorConfig>>
}

/// Configuration for a [DirectConnector].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirectConnectorConfig {
    timeout: Option<Duration>
}

/// A connector that dials its targets directly.
#[derive(Debug)]
pub struct DirectConnector {
    timeout: Option<Duration>,
    closed: AtomicBool
}

/// Errors that can occur when using a connector.
#[derive(Debug)]
pub enum ConnectorError {
    /// The connector configuration was not valid.
    Config {
        /// The configuration error.
        err: ConfigError
    },
    /// The target or intermediary could not be reached.
    Dial {
        /// The error from the dial.
        err: DialError
    },
    /// The SOCKS5 exchange failed.
    SOCKS5 {
        /// The protocol error.
        err: SOCKS5Error
    },
    /// The connector cannot reach the target over the requested
    /// network.
    UnsupportedNetwork {
        /// The requested network.
        network: Network,
        /// The target.
        target: Endpoint
    },
    /// The connector has been closed.
    Closed
}

const DIRECT_FIELDS: &[ConfigField] =
    &[ConfigField::new("timeout", FieldKind::UInt)];

/// Interpret a millisecond count, where `0` means no timeout.
#[inline]
pub(crate) fn millis_timeout(millis: u64) -> Option<Duration> {
    if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis))
    }
}

impl ConnectorRegistry {
    /// Create an empty `ConnectorRegistry`.
    #[inline]
    pub fn new() -> Self {
        ConnectorRegistry {
            registry: Registry::new("connector")
        }
    }

    /// Create a `ConnectorRegistry` holding the built-in connectors.
    ///
    /// The `socks5` connector uses `auth` for method negotiation.
    pub fn with_builtins(
        auth: Arc<AuthMethods>
    ) -> Result<Self, RegistryError> {
        let registry = ConnectorRegistry::new();

        registry.register("direct", Arc::new(DirectConnectorConfig::default()))?;
        registry.register("socks5", Arc::new(SOCKS5ConnectorConfig::new(auth)))?;

        Ok(registry)
    }

    /// Register a prototype configuration under `name`.
    #[inline]
    pub fn register<S>(
        &self,
        name: S,
        proto: Arc<dyn ConnectorConfig>
    ) -> Result<(), RegistryError>
    where
        S: Into<String> {
        self.registry.register(name.into(), proto)
    }

    /// Look up `name` and materialize its configuration from `raw`.
    pub fn lookup(
        &self,
        name: &str,
        raw: &RawConfig
    ) -> Result<Box<dyn ConnectorConfig>, RegistryError> {
        let proto = self.registry.get(name)?;
        let mut config = proto.duplicate();

        project(config.as_mut(), raw).map_err(|err| RegistryError::Config {
            name: String::from(name),
            err: err
        })?;

        debug!(target: "connector-registry",
               "materialized connector \"{}\": {:?}",
               name, config);

        Ok(config)
    }
}

impl Default for ConnectorRegistry {
    #[inline]
    fn default() -> Self {
        ConnectorRegistry::new()
    }
}

impl Configurable for DirectConnectorConfig {
    #[inline]
    fn fields(&self) -> &'static [ConfigField] {
        DIRECT_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        if field.key() == "timeout" {
            self.timeout = millis_timeout(value.into_uint(field)?)
        }

        Ok(())
    }
}

impl ConnectorConfig for DirectConnectorConfig {
    #[inline]
    fn duplicate(&self) -> Box<dyn ConnectorConfig> {
        Box::new(self.clone())
    }

    #[inline]
    fn create(&self) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(DirectConnector::new(self.timeout)))
    }
}

impl DirectConnector {
    /// Create a `DirectConnector` with a connection timeout.
    #[inline]
    pub fn new(timeout: Option<Duration>) -> Self {
        DirectConnector {
            timeout: timeout,
            closed: AtomicBool::new(false)
        }
    }
}

impl Connector for DirectConnector {
    fn connect(
        &self,
        network: Network,
        target: &Endpoint
    ) -> Result<Connection, ConnectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::Closed);
        }

        Ok(dial(network, target, self.timeout)?)
    }

    #[inline]
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst)
    }
}

// A SOCKS5 server only makes TCP connections.  Literal addresses
// must also match the requested address family.
fn socks5_reaches(
    network: Network,
    target: &Endpoint
) -> bool {
    match target.addr() {
        Address::IPv4(ip) => {
            network.accepts(&SocketAddr::new(IpAddr::V4(*ip), target.port()))
        }
        Address::IPv6(ip) => {
            network.accepts(&SocketAddr::new(IpAddr::V6(*ip), target.port()))
        }
        Address::Domain(_) => match network {
            #[cfg(feature = "unix")]
            Network::Unix => false,
            _ => true
        }
    }
}

impl Connector for SOCKS5Connector {
    fn connect(
        &self,
        network: Network,
        target: &Endpoint
    ) -> Result<Connection, ConnectorError> {
        if self.is_closed() {
            return Err(ConnectorError::Closed);
        }

        if !socks5_reaches(network, target) {
            return Err(ConnectorError::UnsupportedNetwork {
                network: network,
                target: target.clone()
            });
        }

        trace!(target: "socks5-connector",
               "requesting {} connection to {} from {}",
               network, target, self.server());

        self.connect_to(target).map_err(|err| match err {
            SOCKS5Error::Dial { err } => ConnectorError::Dial { err: err },
            err => ConnectorError::SOCKS5 { err: err }
        })
    }

    #[inline]
    fn close(&self) {
        self.shutdown()
    }
}

impl From<ConfigError> for ConnectorError {
    #[inline]
    fn from(err: ConfigError) -> ConnectorError {
        ConnectorError::Config { err: err }
    }
}

impl From<DialError> for ConnectorError {
    #[inline]
    fn from(err: DialError) -> ConnectorError {
        ConnectorError::Dial { err: err }
    }
}

impl ScopedError for ConnectorError {
    fn scope(&self) -> ErrorScope {
        match self {
            ConnectorError::Config { err } => err.scope(),
            ConnectorError::Dial { err } => err.scope(),
            ConnectorError::SOCKS5 { err } => err.scope(),
            ConnectorError::UnsupportedNetwork { .. } => ErrorScope::Session,
            ConnectorError::Closed => ErrorScope::Shutdown
        }
    }
}

impl Display for ConnectorError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ConnectorError::Config { err } => Display::fmt(err, f),
            ConnectorError::Dial { err } => Display::fmt(err, f),
            ConnectorError::SOCKS5 { err } => Display::fmt(err, f),
            ConnectorError::UnsupportedNetwork { network, target } => write!(
                f,
                "cannot reach {} over {} through a SOCKS5 server",
                target, network
            ),
            ConnectorError::Closed => write!(f, "connector closed")
        }
    }
}

#[cfg(test)]
use std::net::TcpListener;

#[cfg(test)]
use crate::config::ConfigValue;
#[cfg(test)]
use crate::pipeline::Pipeline;

#[test]
fn test_builtin_connectors() {
    crate::init();

    let registry = ConnectorRegistry::with_builtins(Arc::new(AuthMethods::new()))
        .expect("Expected success");

    assert!(registry.lookup("direct", &RawConfig::new()).is_ok());
    assert!(registry.lookup("socks5", &RawConfig::new()).is_ok());
    assert!(matches!(
        registry.lookup("http", &RawConfig::new()),
        Err(RegistryError::NotFound { .. })
    ));
    assert!(matches!(
        registry.register("direct", Arc::new(DirectConnectorConfig::default())),
        Err(RegistryError::Duplicate { .. })
    ));
}

#[test]
fn test_direct_connector() {
    crate::init();

    let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");
    let registry = ConnectorRegistry::with_builtins(Arc::new(AuthMethods::new()))
        .expect("Expected success");
    let mut raw = RawConfig::new();

    raw.insert(String::from("timeout"), ConfigValue::Str(String::from("500")));

    let connector = registry
        .lookup("direct", &raw)
        .expect("Expected success")
        .create()
        .expect("Expected success");
    let conn = connector
        .connect(Network::TCP, &Endpoint::from(addr))
        .expect("Expected success");
    let (accepted, _) = listener.accept().expect("Expected success");

    assert_eq!(conn.peer_addr(), Some(addr));
    assert_eq!(conn.local_addr(), accepted.peer_addr().ok());

    connector.close();

    assert!(matches!(
        connector.connect(Network::TCP, &Endpoint::from(addr)),
        Err(ConnectorError::Closed)
    ));
}

#[test]
fn test_direct_connector_bad_timeout() {
    crate::init();

    let registry = ConnectorRegistry::with_builtins(Arc::new(AuthMethods::new()))
        .expect("Expected success");
    let mut raw = RawConfig::new();

    raw.insert(String::from("timeout"), ConfigValue::Int(-5));

    assert!(matches!(
        registry.lookup("direct", &raw),
        Err(RegistryError::Config { .. })
    ));
}

#[test]
fn test_socks5_connector_rejects_network() {
    crate::init();

    // Never dialed: the request is refused before reaching the server.
    let connector = SOCKS5Connector::new(
        Network::TCP,
        Endpoint::parse("127.0.0.1", 1),
        None,
        Arc::new(AuthMethods::new())
    );

    assert!(matches!(
        connector.connect(Network::TCP6, &Endpoint::parse("192.0.2.1", 80)),
        Err(ConnectorError::UnsupportedNetwork {
            network: Network::TCP6,
            ..
        })
    ));
    assert!(matches!(
        connector.connect(Network::TCP4, &Endpoint::parse("2001:db8::1", 80)),
        Err(ConnectorError::UnsupportedNetwork { .. })
    ));

    #[cfg(feature = "unix")]
    assert!(matches!(
        connector.connect(Network::Unix, &Endpoint::parse("example.com", 80)),
        Err(ConnectorError::UnsupportedNetwork { .. })
    ));

    assert!(socks5_reaches(Network::TCP4, &Endpoint::parse("example.com", 80)));
    assert!(socks5_reaches(Network::TCP, &Endpoint::parse("2001:db8::1", 80)));
}
