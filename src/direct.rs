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


//! Direct stage.
//!
//! The direct stage connects its input to a fixed destination, given
//! in its configuration.  It is registered under the names `tcp` and
//! `direct`.
//!
//! If the stage is given a pre-supplied output, it does not dial
//! anything, and simply relays between its input and that output.
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::info;

use crate::addrs::Endpoint;
use crate::addrs::Network;
use crate::config::ConfigError;
use crate::config::ConfigField;
use crate::config::Configurable;
use crate::config::FieldKind;
use crate::config::TypedValue;
use crate::connector::millis_timeout;
use crate::context::Context;
use crate::net::dial;
use crate::pipeline::relay::Relay;
use crate::pipeline::Pipeline;
use crate::pipeline::Stage;
use crate::pipeline::StageConfig;
use crate::pipeline::StageError;

const DIRECT_FIELDS: &[ConfigField] = &[
    ConfigField::new("network", FieldKind::Str),
    ConfigField::new("address", FieldKind::Str),
    ConfigField::new("port", FieldKind::UInt),
    ConfigField::new("timeout", FieldKind::UInt)
];

/// Configuration for the direct stage.
///
/// # YAML Format
///
/// - `network`: Network to dial (`tcp`, `tcp4`, `tcp6`, or `unix`).
///   Default is `tcp`.
/// - `address`: Address of the destination.  Default is `0.0.0.0`.
/// - `port`: Port of the destination.  Required, except for `unix`.
/// - `timeout`: Connection timeout in milliseconds.  `0` (the default)
///   means no timeout.
///
/// ## Examples
///
/// ```yaml
/// protocol: tcp
/// config:
///   address: 10.0.0.5
///   port: 8080
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct DirectStageConfig {
    network: String,
    address: String,
    port: u16,
    timeout: Option<Duration>
}

impl Default for DirectStageConfig {
    #[inline]
    fn default() -> Self {
        DirectStageConfig {
            network: String::from("tcp"),
            address: String::from("0.0.0.0"),
            port: 0,
            timeout: None
        }
    }
}

impl DirectStageConfig {
    /// Get the network and destination, if they are usable.
    pub fn destination(&self) -> Result<(Network, Endpoint), StageError> {
        if self.network.is_empty() {
            return Err(StageError::InvalidAddress {
                reason: String::from("network is empty")
            });
        }

        let network = Network::try_from(self.network.as_str()).map_err(|err| {
            StageError::InvalidAddress {
                reason: err.to_string()
            }
        })?;

        #[cfg(feature = "unix")]
        if network == Network::Unix {
            return Ok((network, Endpoint::parse(&self.address, 0)));
        }

        if self.port == 0 {
            return Err(StageError::InvalidAddress {
                reason: format!("no port given for {}", self.address)
            });
        }

        Ok((network, Endpoint::parse(&self.address, self.port)))
    }
}

impl Configurable for DirectStageConfig {
    #[inline]
    fn fields(&self) -> &'static [ConfigField] {
        DIRECT_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        match field.key() {
            "network" => self.network = value.into_string(field)?,
            "address" => self.address = value.into_string(field)?,
            "port" => self.port = value.into_uint(field)?,
            "timeout" => self.timeout = millis_timeout(value.into_uint(field)?),
            _ => {}
        }

        Ok(())
    }
}

impl StageConfig for DirectStageConfig {
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
                    debug!(target: "direct-stage",
                           "error closing output: {}",
                           err);
                }
            }

            return Err(StageError::Cancelled);
        }

        let (output, name) = match output {
            Some(output) => {
                debug!(target: "direct-stage",
                       "passing through to pre-supplied output");

                (output, String::from("direct passthrough"))
            }
            None => {
                let (network, dest) = self.destination()?;
                let conn = dial(network, &dest, self.timeout)?;
                let name = match input.peer_addr() {
                    Some(peer) => format!("direct {} -> {}", peer, dest),
                    None => format!("direct -> {}", dest)
                };

                info!(target: "direct-stage",
                      "{}: connected",
                      name);

                (Arc::new(conn) as Arc<dyn Pipeline>, name)
            }
        };

        Ok(Arc::new(Relay::new(ctx, name, input, output)))
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
use crate::config::project;
#[cfg(test)]
use crate::config::ConfigValue;
#[cfg(test)]
use crate::config::RawConfig;
#[cfg(test)]
use crate::pipeline::duplex::DuplexPipeline;
#[cfg(test)]
use crate::pipeline::PipelineIO;

#[cfg(test)]
fn direct_config(
    network: &str,
    port: u64
) -> DirectStageConfig {
    let mut config = DirectStageConfig::default();
    let mut raw = RawConfig::new();

    raw.insert(String::from("network"), ConfigValue::Str(String::from(network)));
    raw.insert(String::from("address"), ConfigValue::Str(String::from("127.0.0.1")));
    raw.insert(String::from("port"), ConfigValue::UInt(port));
    project(&mut config, &raw).expect("Expected success");

    config
}

#[test]
fn test_direct_defaults() {
    crate::init();

    let config = DirectStageConfig::default();

    assert!(matches!(
        config.destination(),
        Err(StageError::InvalidAddress { .. })
    ));
}

#[test]
fn test_direct_empty_network() {
    crate::init();

    let config = direct_config("", 8080);
    let (input, _client) = DuplexPipeline::pair();
    let ctx = Context::new();

    assert!(matches!(
        config.create(&ctx, Arc::new(input), None),
        Err(StageError::InvalidAddress { .. })
    ));
}

#[test]
fn test_direct_relays_to_destination() {
    crate::init();

    let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let port = listener.local_addr().expect("Expected success").port();
    let server = spawn(move || {
        let (mut stream, _) = listener.accept().expect("Expected success");
        let mut buf = [0; 5];

        stream.read_exact(&mut buf).expect("Expected success");
        stream.write_all(b"world").expect("Expected success");

        buf
    });
    let config = direct_config("tcp", port as u64);
    let (input, client) = DuplexPipeline::pair();
    let ctx = Context::new();
    let stage = config
        .create(&ctx, Arc::new(input), None)
        .expect("Expected success");
    let relay = spawn(move || stage.transport());
    let mut io = PipelineIO::new(&client);
    let mut buf = Vec::new();

    io.write_all(b"hello").expect("Expected success");
    io.read_to_end(&mut buf).expect("Expected success");

    assert_eq!(&server.join().expect("Expected success"), b"hello");
    assert_eq!(buf, b"world");
    assert!(relay.join().expect("Expected success").is_ok());
}

#[test]
fn test_direct_connect_failed() {
    crate::init();

    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");

        listener.local_addr().expect("Expected success").port()
    };
    let config = direct_config("tcp4", port as u64);
    let (input, _client) = DuplexPipeline::pair();
    let ctx = Context::new();

    assert!(matches!(
        config.create(&ctx, Arc::new(input), None),
        Err(StageError::ConnectFailed { .. })
    ));
}

#[test]
fn test_direct_passthrough() {
    crate::init();

    let config = DirectStageConfig::default();
    let (input, client) = DuplexPipeline::pair();
    let (output, far) = DuplexPipeline::pair();
    let ctx = Context::new();
    let stage = config
        .create(&ctx, Arc::new(input), Some(Arc::new(output)))
        .expect("Expected success");
    let relay = spawn(move || stage.transport());
    let mut buf = [0; 3];

    PipelineIO::new(&client)
        .write_all(b"abc")
        .expect("Expected success");
    PipelineIO::new(&far)
        .read_exact(&mut buf)
        .expect("Expected success");

    assert_eq!(&buf, b"abc");

    client.close().expect("Expected success");

    assert!(relay.join().expect("Expected success").is_ok());
}
