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


//! Pipelines and pipeline stages.
//!
//! A [Pipeline] is the uniform bidirectional stream contract shared by
//! raw connections, in-memory pipes, and pipeline stages.  It mirrors
//! [Read] and [Write], but takes `&self` so that a single stream can
//! be read by one thread and written by another, and adds an explicit
//! [close](Pipeline::close).
//!
//! # Stages and Chains
//!
//! A [Stage] is one link in a listener's chain.  Stages are created
//! from a [StageConfig] with an *input* (the stream it speaks to on
//! the near side) and an optional pre-supplied *output*.  A stage
//! that is given an output uses it instead of establishing its own;
//! this is how adjacent stages in a chain are connected, using a
//! [DuplexPipeline](crate::pipeline::duplex::DuplexPipeline) pair.
//! Every stage holds a [Relay](crate::pipeline::relay::Relay), which
//! copies bytes between the input and the output once
//! [transport](Stage::transport) is called.
//!
//! # Plugin Interface
//!
//! New stage types are added by implementing [StageConfig] (and
//! [Configurable]) and registering a prototype with a
//! [StageRegistry].  Lookups duplicate the prototype and project the
//! chain entry's untyped configuration onto the copy, so prototypes
//! are never modified.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use log::debug;

use crate::config::project;
use crate::config::ConfigError;
use crate::config::Configurable;
use crate::config::RawConfig;
use crate::context::Context;
use crate::direct::DirectStageConfig;
use crate::echo::EchoStageConfig;
use crate::net::DialError;
use crate::pipeline::relay::RelayCloseError;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::socks5::auth::AuthMethods;
use crate::socks5::error::SOCKS5Error;
use crate::socks5::SOCKS5StageConfig;

pub mod duplex;
pub mod relay;

/// A bidirectional byte stream.
///
/// All methods take `&self`; implementations must allow one thread to
/// read while another writes, and must allow [close](Pipeline::close)
/// to be called concurrently with either, in which case blocked calls
/// return promptly.
pub trait Pipeline: Debug + Send + Sync {
    /// Read bytes into `buf`.
    ///
    /// A return value of `Ok(0)` indicates end-of-stream.
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error>;

    /// Write bytes from `buf`, returning how many were written.
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error>;

    /// Close the stream in both directions.
    ///
    /// This must be idempotent.
    fn close(&self) -> Result<(), Error>;

    /// Get the local address of the stream, if it has one.
    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Get the remote address of the stream, if it has one.
    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A pipeline stage.
///
/// Stages read and write through their relay, as in the [Pipeline]
/// instance: reads come from the output side, and writes go to the
/// input side.
pub trait Stage: Pipeline {
    /// Run the stage's relay until both directions end.
    ///
    /// This blocks, and returns the aggregated result of closing both
    /// sides.
    fn transport(&self) -> Result<(), RelayCloseError>;
}

/// Typed configuration and constructor for a stage.
pub trait StageConfig: Configurable + Debug + Send + Sync {
    /// Get a boxed copy of this configuration.
    fn duplicate(&self) -> Box<dyn StageConfig>;

    /// Create a stage.
    ///
    /// The stage takes ownership of `input` and `output`.  If
    /// `output` is `None`, the stage establishes its own.  On failure,
    /// `input` is left open, and any output is closed.
    fn create(
        &self,
        ctx: &Context,
        input: Arc<dyn Pipeline>,
        output: Option<Arc<dyn Pipeline>>
    ) -> Result<Arc<dyn Stage>, StageError>;
}

/// Registry of stage prototypes, keyed by protocol name.
#[derive(Debug)]
pub struct StageRegistry {
    registry: Registry<String, Arc<dyn StageConfig>>
}

/// Adapter providing [Read] and [Write] for a [Pipeline].
pub struct PipelineIO<'a> {
    pipeline: &'a dyn Pipeline
}

/// Errors that can occur when creating a stage.
#[derive(Debug)]
pub enum StageError {
    /// The stage configuration was rejected.
    Config {
        /// The configuration error.
        err: ConfigError
    },
    /// The stage's configured destination is not usable.
    InvalidAddress {
        /// Description of the problem.
        reason: String
    },
    /// The stage could not reach its destination.
    ConnectFailed {
        /// The error from the dial.
        err: DialError
    },
    /// The SOCKS5 handshake failed.
    SOCKS5 {
        /// The protocol error.
        err: SOCKS5Error
    },
    /// An IO error occurred on the input or output.
    IO {
        /// The underlying error.
        error: Error
    },
    /// The context was cancelled during creation.
    Cancelled
}

impl<P> Pipeline for Arc<P>
where
    P: Pipeline + ?Sized
{
    #[inline]
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.as_ref().read(buf)
    }

    #[inline]
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.as_ref().write(buf)
    }

    #[inline]
    fn close(&self) -> Result<(), Error> {
        self.as_ref().close()
    }

    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.as_ref().local_addr()
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.as_ref().peer_addr()
    }
}

impl StageRegistry {
    /// Create an empty `StageRegistry`.
    #[inline]
    pub fn new() -> Self {
        StageRegistry {
            registry: Registry::new("stage")
        }
    }

    /// Create a `StageRegistry` holding the built-in stages.
    ///
    /// These are `socks5`, `tcp` and `direct` (the same stage under
    /// two names), and `echo`.  The `socks5` stage uses `auth` for
    /// method negotiation.
    pub fn with_builtins(
        auth: Arc<AuthMethods>
    ) -> Result<Self, RegistryError> {
        let registry = StageRegistry::new();

        registry.register("socks5", Arc::new(SOCKS5StageConfig::new(auth)))?;
        registry.register("tcp", Arc::new(DirectStageConfig::default()))?;
        registry.register("direct", Arc::new(DirectStageConfig::default()))?;
        registry.register("echo", Arc::new(EchoStageConfig::default()))?;

        Ok(registry)
    }

    /// Register a prototype configuration under `name`.
    #[inline]
    pub fn register<S>(
        &self,
        name: S,
        proto: Arc<dyn StageConfig>
    ) -> Result<(), RegistryError>
    where
        S: Into<String> {
        self.registry.register(name.into(), proto)
    }

    /// Look up `name` and materialize its configuration from `raw`.
    ///
    /// The registered prototype is duplicated, and `raw` is projected
    /// onto the copy.
    pub fn lookup(
        &self,
        name: &str,
        raw: &RawConfig
    ) -> Result<Box<dyn StageConfig>, RegistryError> {
        let proto = self.registry.get(name)?;
        let mut config = proto.duplicate();

        project(config.as_mut(), raw).map_err(|err| RegistryError::Config {
            name: String::from(name),
            err: err
        })?;

        debug!(target: "stage-registry",
               "materialized stage \"{}\": {:?}",
               name, config);

        Ok(config)
    }

    /// Get all registered stage names.
    #[inline]
    pub fn names(&self) -> Result<Vec<String>, RegistryError> {
        self.registry.keys()
    }
}

impl Default for StageRegistry {
    #[inline]
    fn default() -> Self {
        StageRegistry::new()
    }
}

impl<'a> PipelineIO<'a> {
    /// Wrap a [Pipeline].
    #[inline]
    pub fn new(pipeline: &'a dyn Pipeline) -> Self {
        PipelineIO { pipeline: pipeline }
    }
}

impl Read for PipelineIO<'_> {
    #[inline]
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.pipeline.read(buf)
    }
}

impl Write for PipelineIO<'_> {
    #[inline]
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.pipeline.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl From<ConfigError> for StageError {
    #[inline]
    fn from(err: ConfigError) -> StageError {
        StageError::Config { err: err }
    }
}

impl From<DialError> for StageError {
    #[inline]
    fn from(err: DialError) -> StageError {
        StageError::ConnectFailed { err: err }
    }
}

impl From<SOCKS5Error> for StageError {
    #[inline]
    fn from(err: SOCKS5Error) -> StageError {
        StageError::SOCKS5 { err: err }
    }
}

impl From<Error> for StageError {
    #[inline]
    fn from(error: Error) -> StageError {
        StageError::IO { error: error }
    }
}

impl From<StageError> for Error {
    fn from(err: StageError) -> Error {
        match err {
            StageError::IO { error } => error,
            err => {
                let kind = match &err {
                    StageError::Cancelled => ErrorKind::Interrupted,
                    StageError::ConnectFailed { .. } => {
                        ErrorKind::ConnectionRefused
                    }
                    _ => ErrorKind::Other
                };

                Error::new(kind, err.to_string())
            }
        }
    }
}

impl ScopedError for StageError {
    fn scope(&self) -> ErrorScope {
        match self {
            StageError::Config { err } => err.scope(),
            StageError::InvalidAddress { .. } => ErrorScope::Unrecoverable,
            StageError::ConnectFailed { err } => err.scope(),
            StageError::SOCKS5 { err } => err.scope(),
            StageError::IO { error } => error.scope(),
            StageError::Cancelled => ErrorScope::Shutdown
        }
    }
}

impl Display for StageError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            StageError::Config { err } => write!(f, "{}", err),
            StageError::InvalidAddress { reason } => {
                write!(f, "invalid address: {}", reason)
            }
            StageError::ConnectFailed { err } => {
                write!(f, "connect failed: {}", err)
            }
            StageError::SOCKS5 { err } => write!(f, "{}", err),
            StageError::IO { error } => write!(f, "{}", error),
            StageError::Cancelled => write!(f, "cancelled")
        }
    }
}

#[cfg(test)]
use crate::config::ConfigField;
#[cfg(test)]
use crate::config::ConfigValue;
#[cfg(test)]
use crate::config::FieldKind;
#[cfg(test)]
use crate::config::TypedValue;

#[cfg(test)]
#[derive(Clone, Debug)]
struct NullStageConfig {
    label: String
}

#[cfg(test)]
const NULL_FIELDS: &[ConfigField] = &[ConfigField::new("label", FieldKind::Str)];

#[cfg(test)]
impl Configurable for NullStageConfig {
    fn fields(&self) -> &'static [ConfigField] {
        NULL_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        self.label = value.into_string(field)?;

        Ok(())
    }
}

#[cfg(test)]
impl StageConfig for NullStageConfig {
    fn duplicate(&self) -> Box<dyn StageConfig> {
        Box::new(self.clone())
    }

    fn create(
        &self,
        _ctx: &Context,
        _input: Arc<dyn Pipeline>,
        _output: Option<Arc<dyn Pipeline>>
    ) -> Result<Arc<dyn Stage>, StageError> {
        Err(StageError::InvalidAddress {
            reason: self.label.clone()
        })
    }
}

#[test]
fn test_stage_registry_lookup_projects_copy() {
    crate::init();

    let registry = StageRegistry::new();
    let proto = Arc::new(NullStageConfig {
        label: String::from("proto")
    });

    registry
        .register("null", proto.clone())
        .expect("Expected success");

    let mut raw = RawConfig::new();

    raw.insert(String::from("label"), ConfigValue::Int(42));

    let config = registry.lookup("null", &raw).expect("Expected success");
    let (input, _) = crate::pipeline::duplex::DuplexPipeline::pair();
    let err = config
        .create(&Context::new(), Arc::new(input), None)
        .err()
        .expect("Expected failure");

    assert_eq!(err.to_string(), "invalid address: 42");
    assert_eq!(proto.label, "proto");
}

#[test]
fn test_stage_registry_duplicate() {
    crate::init();

    let registry = StageRegistry::new();

    registry
        .register(
            "null",
            Arc::new(NullStageConfig {
                label: String::from("first")
            })
        )
        .expect("Expected success");

    assert!(matches!(
        registry.register(
            "null",
            Arc::new(NullStageConfig {
                label: String::from("second")
            })
        ),
        Err(RegistryError::Duplicate { .. })
    ));
}

#[test]
fn test_stage_registry_not_found() {
    crate::init();

    let registry = StageRegistry::new();

    assert!(matches!(
        registry.lookup("missing", &RawConfig::new()),
        Err(RegistryError::NotFound { .. })
    ));
}

#[test]
fn test_stage_registry_builtins() {
    crate::init();

    let registry = StageRegistry::with_builtins(Arc::new(AuthMethods::new()))
        .expect("Expected success");
    let mut names = registry.names().expect("Expected success");

    names.sort();

    assert_eq!(names, vec!["direct", "echo", "socks5", "tcp"]);

    let mut raw = RawConfig::new();

    raw.insert(String::from("port"), ConfigValue::Str(String::from("http")));

    assert!(matches!(
        registry.lookup("tcp", &raw),
        Err(RegistryError::Config { .. })
    ));
}
