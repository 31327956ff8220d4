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


//! Name-keyed registries of pluggable units.
//!
//! A [Registry] maps keys to values under a single reader/writer
//! lock.  Entries are added once, typically before any listener
//! starts, and are never removed or replaced; attempting to register
//! a key twice fails with [Duplicate](RegistryError::Duplicate).
//! Lookups take only the read lock, so concurrent lookups never
//! block each other.
//!
//! Registries are explicit objects.  The stage and connector
//! registries ([StageRegistry](crate::pipeline::StageRegistry) and
//! [ConnectorRegistry](crate::connector::ConnectorRegistry)) and the
//! SOCKS5 [AuthMethods](crate::socks5::auth::AuthMethods) are all
//! built on this type, and are created once and passed by reference.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::sync::RwLock;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use log::debug;
use log::error;
use log::trace;

use crate::config::ConfigError;

/// A thread-safe, append-only map.
///
/// The `kind` is a human-readable name for what the registry holds,
/// used in errors and log messages.
pub struct Registry<K, V> {
    kind: &'static str,
    entries: RwLock<HashMap<K, V>>
}

/// Errors that can occur when using a registry.
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryError {
    /// The name was already registered.
    Duplicate {
        /// What the registry holds.
        kind: &'static str,
        /// The duplicate name.
        name: String
    },
    /// The name was not registered.
    NotFound {
        /// What the registry holds.
        kind: &'static str,
        /// The missing name.
        name: String
    },
    /// The configuration supplied with a lookup was not valid.
    Config {
        /// The name being looked up.
        name: String,
        /// The projection error.
        err: ConfigError
    },
    /// The registry lock was poisoned.
    MutexPoison
}

impl<K, V> Registry<K, V>
where
    K: Display + Eq + Hash,
    V: Clone
{
    /// Create an empty `Registry`.
    #[inline]
    pub fn new(kind: &'static str) -> Self {
        Registry {
            kind: kind,
            entries: RwLock::new(HashMap::new())
        }
    }

    /// Get the kind of entry held by this registry.
    #[inline]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register `value` under `key`.
    ///
    /// This fails if `key` is already registered, in which case the
    /// existing entry is left untouched.
    pub fn register(
        &self,
        key: K,
        value: V
    ) -> Result<(), RegistryError> {
        match self.entries.write() {
            Ok(mut guard) => {
                if guard.contains_key(&key) {
                    debug!(target: "registry",
                           "rejecting duplicate {} \"{}\"",
                           self.kind, key);

                    Err(RegistryError::Duplicate {
                        kind: self.kind,
                        name: key.to_string()
                    })
                } else {
                    debug!(target: "registry",
                           "registered {} \"{}\"",
                           self.kind, key);

                    guard.insert(key, value);

                    Ok(())
                }
            }
            Err(_) => {
                error!(target: "registry",
                       "mutex poisoned in {} registry",
                       self.kind);

                Err(RegistryError::MutexPoison)
            }
        }
    }

    /// Get a copy of the value registered under `key`.
    pub fn get<Q>(
        &self,
        key: &Q
    ) -> Result<V, RegistryError>
    where
        K: Borrow<Q>,
        Q: Display + Eq + Hash + ?Sized {
        match self.entries.read() {
            Ok(guard) => match guard.get(key) {
                Some(value) => {
                    trace!(target: "registry",
                           "found {} \"{}\"",
                           self.kind, key);

                    Ok(value.clone())
                }
                None => Err(RegistryError::NotFound {
                    kind: self.kind,
                    name: key.to_string()
                })
            },
            Err(_) => {
                error!(target: "registry",
                       "mutex poisoned in {} registry",
                       self.kind);

                Err(RegistryError::MutexPoison)
            }
        }
    }

    /// Check whether `key` is registered.
    pub fn contains<Q>(
        &self,
        key: &Q
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized {
        match self.entries.read() {
            Ok(guard) => guard.contains_key(key),
            Err(_) => false
        }
    }

    /// Get all registered keys, in no particular order.
    pub fn keys(&self) -> Result<Vec<K>, RegistryError>
    where
        K: Clone {
        match self.entries.read() {
            Ok(guard) => Ok(guard.keys().cloned().collect()),
            Err(_) => Err(RegistryError::MutexPoison)
        }
    }
}

impl<K, V> Debug for Registry<K, V>
where
    K: Debug
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        let mut out = f.debug_struct("Registry");

        out.field("kind", &self.kind);

        if let Ok(guard) = self.entries.read() {
            out.field("keys", &guard.keys().collect::<Vec<&K>>());
        }

        out.finish()
    }
}

impl ScopedError for RegistryError {
    fn scope(&self) -> ErrorScope {
        match self {
            RegistryError::Duplicate { .. } => ErrorScope::Unrecoverable,
            RegistryError::NotFound { .. } => ErrorScope::Unrecoverable,
            RegistryError::Config { err, .. } => err.scope(),
            RegistryError::MutexPoison => ErrorScope::Unrecoverable
        }
    }
}

impl Display for RegistryError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            RegistryError::Duplicate { kind, name } => {
                write!(f, "duplicate {} named \"{}\"", kind, name)
            }
            RegistryError::NotFound { kind, name } => {
                write!(f, "no {} named \"{}\"", kind, name)
            }
            RegistryError::Config { name, err } => {
                write!(f, "bad configuration for \"{}\": {}", name, err)
            }
            RegistryError::MutexPoison => write!(f, "mutex poisoned")
        }
    }
}

#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::thread::spawn;

#[test]
fn test_register_and_get() {
    crate::init();

    let registry: Registry<String, u32> = Registry::new("widget");

    registry
        .register(String::from("first"), 1)
        .expect("Expected success");
    registry
        .register(String::from("second"), 2)
        .expect("Expected success");

    assert_eq!(registry.get("first"), Ok(1));
    assert_eq!(registry.get("second"), Ok(2));

    let mut keys = registry.keys().expect("Expected success");

    keys.sort();

    assert_eq!(keys, vec![String::from("first"), String::from("second")]);
}

#[test]
fn test_duplicate_rejected() {
    crate::init();

    let registry: Registry<String, u32> = Registry::new("widget");

    registry
        .register(String::from("name"), 1)
        .expect("Expected success");

    assert_eq!(
        registry.register(String::from("name"), 2),
        Err(RegistryError::Duplicate {
            kind: "widget",
            name: String::from("name")
        })
    );
    assert_eq!(registry.get("name"), Ok(1));
}

#[test]
fn test_not_found() {
    crate::init();

    let registry: Registry<u8, u32> = Registry::new("method");

    assert_eq!(
        registry.get(&7),
        Err(RegistryError::NotFound {
            kind: "method",
            name: String::from("7")
        })
    );
    assert!(!registry.contains(&7));
}

#[test]
fn test_concurrent_lookups() {
    crate::init();

    let registry: Arc<Registry<String, usize>> =
        Arc::new(Registry::new("widget"));

    for i in 0..16 {
        registry
            .register(format!("entry-{}", i), i)
            .expect("Expected success");
    }

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();

            spawn(move || {
                for i in 0..16 {
                    let name = format!("entry-{}", i);

                    assert_eq!(registry.get(name.as_str()), Ok(i));
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("Expected success");
    }
}
