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


//! Configuration structures.
//!
//! This module contains two kinds of configuration:
//!
//! - The top-level configuration of the proxy, given by
//!   [SomersaultConfig], [ListenerConfig], and [StageEntryConfig].
//!   Each of these types has a YAML format, which can be parsed using
//!   `serde_yaml`, thus allowing configurations to be easily loaded
//!   from text files.
//!
//! - The untyped per-stage configuration [RawConfig], which is
//!   projected onto a typed stage configuration using [project].
//!
//! # Projection
//!
//! Stage and connector configurations do not derive `Deserialize`.
//! Instead, they implement [Configurable], which declares a schema
//! (a list of [ConfigField]s) and a setter.  The [project] routine
//! walks the schema, looks up each key in the [RawConfig], coerces
//! the value to the declared [FieldKind], and assigns it.  Keys that
//! are not in the schema are ignored, and keys that are absent leave
//! the compiled-in default in place.
//!
//! Coercion is best-effort:
//!
//! - Integers accept integers, floats (truncated), decimal strings,
//!   and booleans (as `1` or `0`).
//! - Unsigned integers are the same, except that negative values are
//!   rejected.
//! - Floats accept any number, numeric strings, and booleans.
//! - Strings accept anything scalar; floats are formatted with six
//!   decimal digits, and booleans become `true` or `false`.
//! - Booleans accept booleans, numbers (positive values are true),
//!   and the strings `true` and `false` (case-insensitive) or numeric
//!   strings.
//!
//! Anything else, including `null`, lists, and maps, is a
//! [TypeMismatch](ConfigError::TypeMismatch).
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use serde::Deserialize;
use serde::Serialize;

use crate::addrs::Network;

/// An untyped configuration value.
///
/// This is the value type of a [RawConfig], and can hold anything a
/// YAML (or JSON) document can.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// The `null` value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer too large for `i64`.
    UInt(u64),
    /// A floating-point number.
    Float(f64),
    /// A string.
    Str(String),
    /// A list of values.
    List(Vec<ConfigValue>),
    /// A nested mapping.
    Map(RawConfig)
}

/// An untyped mapping from keys to values.
///
/// This is the form in which stage configurations appear in a
/// [StageEntryConfig], before they are projected onto a typed
/// configuration.
pub type RawConfig = BTreeMap<String, ConfigValue>;

/// Semantic types of configuration fields.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FieldKind {
    /// Signed integers.
    Int,
    /// Unsigned integers.
    UInt,
    /// Floating-point numbers.
    Float,
    /// Strings.
    Str,
    /// Booleans.
    Bool
}

/// A declared field in a [Configurable] schema.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConfigField {
    key: &'static str,
    kind: FieldKind
}

/// A value that has been coerced to a [FieldKind].
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A floating-point number.
    Float(f64),
    /// A string.
    Str(String),
    /// A boolean.
    Bool(bool)
}

/// Errors that can occur when projecting a [RawConfig].
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// A value could not be coerced to the type of its field.
    TypeMismatch {
        /// The key of the field.
        key: &'static str,
        /// The declared type of the field.
        expected: FieldKind,
        /// The value that was supplied.
        found: ConfigValue
    },
    /// A value had the right type, but was not acceptable.
    Invalid {
        /// The key of the field.
        key: &'static str,
        /// Description of the problem.
        reason: String
    }
}

/// Typed configurations that can be materialized from a [RawConfig].
///
/// Implementors declare their fields with [fields](Configurable::fields)
/// and receive coerced values through
/// [assign](Configurable::assign).  See [project] for the projection
/// rules.
pub trait Configurable {
    /// Get the schema of this configuration.
    fn fields(&self) -> &'static [ConfigField];

    /// Assign a coerced value to a field.
    ///
    /// The `field` is always one of those returned by
    /// [fields](Configurable::fields), and `value` always has the
    /// variant corresponding to its [FieldKind].
    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError>;
}

/// Top-level configuration of the proxy.
///
/// # YAML Format
///
/// The YAML format has one field:
///
/// - `listeners`: A list of [ListenerConfig] structures.  The key
///   `config` is accepted as an alias.
///
/// ## Examples
///
/// The following is an example of the YAML format:
///
/// ```yaml
/// listeners:
///   - address: 127.0.0.1
///     port: 1080
///     chain:
///       - protocol: socks5
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SomersaultConfig {
    #[serde(default)]
    #[serde(alias = "config")]
    listeners: Vec<ListenerConfig>
}

/// Configuration for a single listener.
///
/// A listener accepts stream connections and passes each of them
/// through its chain of stages.  A listener with an empty address,
/// a zero port, or an empty chain is disabled.
///
/// # YAML Format
///
/// The YAML format has four fields:
///
/// - `network`: The network to listen on.  This is optional, and
///   defaults to `tcp`.
///
/// - `address`: The address to listen on.  For the `unix` network,
///   this is the socket path.
///
/// - `port`: The port to listen on.
///
/// - `chain`: A list of [StageEntryConfig] structures, evaluated in
///   order.  The key `pipeline` is accepted as an alias.
///
/// ## Examples
///
/// The following is an example of a SOCKS5 listener that forwards
/// through a second SOCKS5 server:
///
/// ```yaml
/// network: tcp
/// address: 0.0.0.0
/// port: 1080
/// chain:
///   - protocol: socks5
///     config:
///       address: 10.0.0.1
///       port: 1080
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerConfig {
    #[serde(default = "ListenerConfig::default_network")]
    network: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    #[serde(alias = "pipeline")]
    chain: Vec<StageEntryConfig>
}

/// A single entry in a listener's chain.
///
/// # YAML Format
///
/// The YAML format has two fields:
///
/// - `protocol`: The name under which the stage is registered.
///
/// - `config`: An untyped mapping, which is projected onto the
///   stage's configuration.  This is optional, and defaults to an
///   empty mapping.
///
/// ## Examples
///
/// ```yaml
/// protocol: tcp
/// config:
///   address: 192.168.1.10
///   port: 22
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StageEntryConfig {
    protocol: String,
    #[serde(default)]
    config: RawConfig
}

impl ConfigValue {
    /// Get a short name for the type of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::UInt(_) => "uint",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "string",
            ConfigValue::List(_) => "list",
            ConfigValue::Map(_) => "map"
        }
    }
}

impl ConfigField {
    /// Declare a field.
    #[inline]
    pub const fn new(
        key: &'static str,
        kind: FieldKind
    ) -> Self {
        ConfigField {
            key: key,
            kind: kind
        }
    }

    /// Get the external key of this field.
    #[inline]
    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Get the semantic type of this field.
    #[inline]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Coerce `value` to the type of this field.
    pub fn coerce(
        &self,
        value: &ConfigValue
    ) -> Result<TypedValue, ConfigError> {
        let out = match self.kind {
            FieldKind::Int => coerce_int(value).map(TypedValue::Int),
            FieldKind::UInt => coerce_uint(value).map(TypedValue::UInt),
            FieldKind::Float => coerce_float(value).map(TypedValue::Float),
            FieldKind::Str => coerce_str(value).map(TypedValue::Str),
            FieldKind::Bool => coerce_bool(value).map(TypedValue::Bool)
        };

        out.ok_or_else(|| self.mismatch(value.clone()))
    }

    #[inline]
    fn mismatch(
        &self,
        found: ConfigValue
    ) -> ConfigError {
        ConfigError::TypeMismatch {
            key: self.key,
            expected: self.kind,
            found: found
        }
    }
}

impl TypedValue {
    fn as_config_value(&self) -> ConfigValue {
        match self {
            TypedValue::Int(val) => ConfigValue::Int(*val),
            TypedValue::UInt(val) => ConfigValue::UInt(*val),
            TypedValue::Float(val) => ConfigValue::Float(*val),
            TypedValue::Str(val) => ConfigValue::Str(val.clone()),
            TypedValue::Bool(val) => ConfigValue::Bool(*val)
        }
    }

    /// Extract a signed integer, narrowing it to `T`.
    ///
    /// Values that do not fit in `T` are a type mismatch.
    pub fn into_int<T>(
        self,
        field: &ConfigField
    ) -> Result<T, ConfigError>
    where
        T: TryFrom<i64> {
        match self {
            TypedValue::Int(val) => {
                T::try_from(val).map_err(|_| field.mismatch(ConfigValue::Int(val)))
            }
            other => Err(field.mismatch(other.as_config_value()))
        }
    }

    /// Extract an unsigned integer, narrowing it to `T`.
    ///
    /// Values that do not fit in `T` are a type mismatch.
    pub fn into_uint<T>(
        self,
        field: &ConfigField
    ) -> Result<T, ConfigError>
    where
        T: TryFrom<u64> {
        match self {
            TypedValue::UInt(val) => T::try_from(val)
                .map_err(|_| field.mismatch(ConfigValue::UInt(val))),
            other => Err(field.mismatch(other.as_config_value()))
        }
    }

    /// Extract a floating-point number.
    pub fn into_float(
        self,
        field: &ConfigField
    ) -> Result<f64, ConfigError> {
        match self {
            TypedValue::Float(val) => Ok(val),
            other => Err(field.mismatch(other.as_config_value()))
        }
    }

    /// Extract a string.
    pub fn into_string(
        self,
        field: &ConfigField
    ) -> Result<String, ConfigError> {
        match self {
            TypedValue::Str(val) => Ok(val),
            other => Err(field.mismatch(other.as_config_value()))
        }
    }

    /// Extract a network name, and parse it as a [Network].
    pub fn into_network(
        self,
        field: &ConfigField
    ) -> Result<Network, ConfigError> {
        let name = self.into_string(field)?;

        Network::try_from(name.as_str()).map_err(|err| ConfigError::Invalid {
            key: field.key(),
            reason: err.to_string()
        })
    }

    /// Extract a boolean.
    pub fn into_bool(
        self,
        field: &ConfigField
    ) -> Result<bool, ConfigError> {
        match self {
            TypedValue::Bool(val) => Ok(val),
            other => Err(field.mismatch(other.as_config_value()))
        }
    }
}

impl SomersaultConfig {
    /// Create a `SomersaultConfig` from its components.
    #[inline]
    pub fn new(listeners: Vec<ListenerConfig>) -> Self {
        SomersaultConfig {
            listeners: listeners
        }
    }

    /// Get the listener configurations.
    #[inline]
    pub fn listeners(&self) -> &[ListenerConfig] {
        &self.listeners
    }
}

impl ListenerConfig {
    #[inline]
    fn default_network() -> String {
        String::from("tcp")
    }

    /// Create a `ListenerConfig` from its components.
    #[inline]
    pub fn new(
        network: String,
        address: String,
        port: u16,
        chain: Vec<StageEntryConfig>
    ) -> Self {
        ListenerConfig {
            network: network,
            address: address,
            port: port,
            chain: chain
        }
    }

    /// Get the network name.
    #[inline]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Get the listen address.
    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the listen port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the chain of stages.
    #[inline]
    pub fn chain(&self) -> &[StageEntryConfig] {
        &self.chain
    }
}

impl StageEntryConfig {
    /// Create a `StageEntryConfig` from its components.
    #[inline]
    pub fn new(
        protocol: String,
        config: RawConfig
    ) -> Self {
        StageEntryConfig {
            protocol: protocol,
            config: config
        }
    }

    /// Get the protocol name.
    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Get the untyped stage configuration.
    #[inline]
    pub fn config(&self) -> &RawConfig {
        &self.config
    }
}

/// Project `raw` onto `config`.
///
/// Every field declared by `config` whose key is present in `raw` is
/// coerced and assigned.  Unknown keys are ignored, and missing keys
/// leave the existing value in place.  The first failure aborts the
/// projection.
pub fn project<C>(
    config: &mut C,
    raw: &RawConfig
) -> Result<(), ConfigError>
where
    C: Configurable + ?Sized {
    for field in config.fields() {
        if let Some(value) = raw.get(field.key()) {
            let typed = field.coerce(value)?;

            config.assign(field, typed)?;
        }
    }

    Ok(())
}

fn coerce_int(value: &ConfigValue) -> Option<i64> {
    match value {
        ConfigValue::Int(val) => Some(*val),
        ConfigValue::UInt(val) => i64::try_from(*val).ok(),
        ConfigValue::Float(val) => float_to_int(*val),
        ConfigValue::Str(val) => val.trim().parse().ok(),
        ConfigValue::Bool(val) => Some(*val as i64),
        _ => None
    }
}

fn coerce_uint(value: &ConfigValue) -> Option<u64> {
    match value {
        ConfigValue::Int(val) => u64::try_from(*val).ok(),
        ConfigValue::UInt(val) => Some(*val),
        ConfigValue::Float(val) => {
            float_to_int(*val).and_then(|val| u64::try_from(val).ok())
        }
        ConfigValue::Str(val) => val.trim().parse().ok(),
        ConfigValue::Bool(val) => Some(*val as u64),
        _ => None
    }
}

fn coerce_float(value: &ConfigValue) -> Option<f64> {
    match value {
        ConfigValue::Int(val) => Some(*val as f64),
        ConfigValue::UInt(val) => Some(*val as f64),
        ConfigValue::Float(val) => Some(*val),
        ConfigValue::Str(val) => val.trim().parse().ok(),
        ConfigValue::Bool(true) => Some(1.0),
        ConfigValue::Bool(false) => Some(0.0),
        _ => None
    }
}

fn coerce_str(value: &ConfigValue) -> Option<String> {
    match value {
        ConfigValue::Int(val) => Some(val.to_string()),
        ConfigValue::UInt(val) => Some(val.to_string()),
        ConfigValue::Float(val) => Some(format!("{:.6}", val)),
        ConfigValue::Str(val) => Some(val.clone()),
        ConfigValue::Bool(val) => Some(val.to_string()),
        _ => None
    }
}

fn coerce_bool(value: &ConfigValue) -> Option<bool> {
    match value {
        ConfigValue::Int(val) => Some(*val > 0),
        ConfigValue::UInt(val) => Some(*val > 0),
        ConfigValue::Float(val) => Some(*val > 0.0),
        ConfigValue::Bool(val) => Some(*val),
        ConfigValue::Str(val) => {
            let trimmed = val.trim();

            if trimmed.eq_ignore_ascii_case("true") {
                Some(true)
            } else if trimmed.eq_ignore_ascii_case("false") {
                Some(false)
            } else {
                trimmed.parse::<f64>().ok().map(|val| val > 0.0)
            }
        }
        _ => None
    }
}

// Truncates toward zero; NaN and out-of-range values are rejected.
fn float_to_int(val: f64) -> Option<i64> {
    if val.is_finite() && val >= i64::MIN as f64 && val < i64::MAX as f64 {
        Some(val.trunc() as i64)
    } else {
        None
    }
}

impl ScopedError for ConfigError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl Display for FieldKind {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            FieldKind::Int => write!(f, "integer"),
            FieldKind::UInt => write!(f, "unsigned integer"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Str => write!(f, "string"),
            FieldKind::Bool => write!(f, "boolean")
        }
    }
}

impl Display for ConfigError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ConfigError::TypeMismatch {
                key,
                expected,
                found
            } => write!(
                f,
                "type mismatch for \"{}\": expected {}, got {} ({:?})",
                key,
                expected,
                found.type_name(),
                found
            ),
            ConfigError::Invalid { key, reason } => {
                write!(f, "invalid value for \"{}\": {}", key, reason)
            }
        }
    }
}

#[cfg(test)]
struct TestConfig {
    port: u16,
    ratio: f64,
    name: String,
    enabled: bool,
    offset: i32
}

#[cfg(test)]
const TEST_FIELDS: &[ConfigField] = &[
    ConfigField::new("port", FieldKind::UInt),
    ConfigField::new("ratio", FieldKind::Float),
    ConfigField::new("name", FieldKind::Str),
    ConfigField::new("enabled", FieldKind::Bool),
    ConfigField::new("offset", FieldKind::Int)
];

#[cfg(test)]
impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            port: 1080,
            ratio: 0.5,
            name: String::from("default"),
            enabled: false,
            offset: 0
        }
    }
}

#[cfg(test)]
impl Configurable for TestConfig {
    fn fields(&self) -> &'static [ConfigField] {
        TEST_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        match field.key() {
            "port" => self.port = value.into_uint(field)?,
            "ratio" => self.ratio = value.into_float(field)?,
            "name" => self.name = value.into_string(field)?,
            "enabled" => self.enabled = value.into_bool(field)?,
            "offset" => self.offset = value.into_int(field)?,
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
fn raw(yaml: &str) -> RawConfig {
    serde_yaml::from_str(yaml).expect("Expected success")
}

#[test]
fn test_project_port_from_string() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("port: \"8080\"")).expect("Expected success");

    assert_eq!(config.port, 8080);
}

#[test]
fn test_project_port_from_float() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("port: 8080.0")).expect("Expected success");

    assert_eq!(config.port, 8080);
}

#[test]
fn test_project_port_from_int() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("port: 8080")).expect("Expected success");

    assert_eq!(config.port, 8080);
}

#[test]
fn test_project_port_unparsable() {
    crate::init();

    let mut config = TestConfig::default();
    let err = project(&mut config, &raw("port: eighty"))
        .expect_err("Expected failure");

    assert_eq!(
        err,
        ConfigError::TypeMismatch {
            key: "port",
            expected: FieldKind::UInt,
            found: ConfigValue::Str(String::from("eighty"))
        }
    );
    assert_eq!(config.port, 1080);
}

#[test]
fn test_project_port_out_of_range() {
    crate::init();

    let mut config = TestConfig::default();
    let err = project(&mut config, &raw("port: 70000"))
        .expect_err("Expected failure");

    assert!(matches!(err, ConfigError::TypeMismatch { key: "port", .. }));
}

#[test]
fn test_project_negative_uint() {
    crate::init();

    let mut config = TestConfig::default();

    assert!(project(&mut config, &raw("port: -1")).is_err());
}

#[test]
fn test_project_missing_and_unknown_keys() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("color: blue\nname: proxy"))
        .expect("Expected success");

    assert_eq!(config.port, 1080);
    assert_eq!(config.name, "proxy");
    assert!(!config.enabled);
}

#[test]
fn test_project_float_to_string() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("name: 1.5")).expect("Expected success");

    assert_eq!(config.name, "1.500000");
}

#[test]
fn test_project_bool_coercions() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("enabled: \"TRUE\"")).expect("Expected success");
    assert!(config.enabled);

    project(&mut config, &raw("enabled: 0")).expect("Expected success");
    assert!(!config.enabled);

    project(&mut config, &raw("enabled: 3")).expect("Expected success");
    assert!(config.enabled);

    assert!(project(&mut config, &raw("enabled: maybe")).is_err());
}

#[test]
fn test_project_int_coercions() {
    crate::init();

    let mut config = TestConfig::default();

    project(&mut config, &raw("offset: -7.9")).expect("Expected success");
    assert_eq!(config.offset, -7);

    project(&mut config, &raw("offset: true")).expect("Expected success");
    assert_eq!(config.offset, 1);

    project(&mut config, &raw("ratio: \"0.25\"")).expect("Expected success");
    assert_eq!(config.ratio, 0.25);
}

#[test]
fn test_project_null_and_list_rejected() {
    crate::init();

    let mut config = TestConfig::default();

    assert!(project(&mut config, &raw("name: ~")).is_err());
    assert!(project(&mut config, &raw("name: [a, b]")).is_err());
}

#[test]
fn test_somersault_config_yaml() {
    crate::init();

    let yaml = concat!(
        "listeners:\n",
        "  - address: 127.0.0.1\n",
        "    port: 1080\n",
        "    chain:\n",
        "      - protocol: socks5\n",
        "        config:\n",
        "          address: 10.0.0.1\n",
        "          port: 1081\n",
        "      - protocol: echo\n"
    );
    let config: SomersaultConfig =
        serde_yaml::from_str(yaml).expect("Expected success");
    let listener = &config.listeners()[0];

    assert_eq!(listener.network(), "tcp");
    assert_eq!(listener.address(), "127.0.0.1");
    assert_eq!(listener.port(), 1080);
    assert_eq!(listener.chain().len(), 2);
    assert_eq!(listener.chain()[0].protocol(), "socks5");
    assert_eq!(
        listener.chain()[0].config().get("port"),
        Some(&ConfigValue::Int(1081))
    );
    assert!(listener.chain()[1].config().is_empty());
}

#[test]
fn test_somersault_config_aliases() {
    crate::init();

    let yaml = concat!(
        "config:\n",
        "  - network: tcp4\n",
        "    address: 0.0.0.0\n",
        "    port: 9000\n",
        "    pipeline:\n",
        "      - protocol: tcp\n",
        "        config:\n",
        "          address: 10.0.0.2\n",
        "          port: \"22\"\n"
    );
    let config: SomersaultConfig =
        serde_yaml::from_str(yaml).expect("Expected success");
    let listener = &config.listeners()[0];

    assert_eq!(listener.network(), "tcp4");
    assert_eq!(listener.chain()[0].protocol(), "tcp");
    assert_eq!(
        listener.chain()[0].config().get("port"),
        Some(&ConfigValue::Str(String::from("22")))
    );
}
