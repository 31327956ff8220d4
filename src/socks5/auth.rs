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


//! SOCKS5 authentication methods.
//!
//! Authentication methods are keyed by their one-byte method code.
//! Each [AuthMethod] is a pair of functions: one run by the
//! initiator and one by the responder, after method negotiation has
//! selected the method.  Only method `0x00` (no authentication) is
//! built in; other methods (such as RFC 1929 username/password) are
//! added by registering them with an [AuthMethods] instance.
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use log::error;

use crate::pipeline::Pipeline;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::socks5::error::SOCKS5Error;
use crate::socks5::proto::METHOD_NO_AUTH;

/// A function that runs one side of an authentication exchange.
pub type AuthFn =
    Arc<dyn Fn(&dyn Pipeline) -> Result<(), SOCKS5Error> + Send + Sync>;

/// An authentication method.
#[derive(Clone)]
pub struct AuthMethod {
    initiate: AuthFn,
    respond: AuthFn
}

/// Registry of authentication methods, keyed by method code.
#[derive(Debug)]
pub struct AuthMethods {
    registry: Registry<u8, AuthMethod>
}

impl AuthMethod {
    /// Create an `AuthMethod` from its two halves.
    #[inline]
    pub fn new(
        initiate: AuthFn,
        respond: AuthFn
    ) -> Self {
        AuthMethod {
            initiate: initiate,
            respond: respond
        }
    }

    /// The "no authentication" method, which exchanges nothing.
    pub fn no_auth() -> Self {
        AuthMethod::new(Arc::new(no_auth_exchange), Arc::new(no_auth_exchange))
    }

    /// Run the initiator side of the method.
    #[inline]
    pub fn initiate(
        &self,
        stream: &dyn Pipeline
    ) -> Result<(), SOCKS5Error> {
        (self.initiate)(stream)
    }

    /// Run the responder side of the method.
    #[inline]
    pub fn respond(
        &self,
        stream: &dyn Pipeline
    ) -> Result<(), SOCKS5Error> {
        (self.respond)(stream)
    }
}

#[inline]
fn no_auth_exchange(_stream: &dyn Pipeline) -> Result<(), SOCKS5Error> {
    Ok(())
}

impl AuthMethods {
    /// Create an `AuthMethods` containing only method `0x00`.
    pub fn new() -> Self {
        let methods = AuthMethods::empty();

        if let Err(err) = methods.register(METHOD_NO_AUTH, AuthMethod::no_auth())
        {
            error!(target: "socks5-auth",
                   "failed to register no-auth method: {}",
                   err);
        }

        methods
    }

    /// Create an `AuthMethods` with no methods at all.
    #[inline]
    pub fn empty() -> Self {
        AuthMethods {
            registry: Registry::new("authentication method")
        }
    }

    /// Register `method` under `code`.
    #[inline]
    pub fn register(
        &self,
        code: u8,
        method: AuthMethod
    ) -> Result<(), RegistryError> {
        self.registry.register(code, method)
    }

    /// Get the method registered under `code`.
    #[inline]
    pub fn get(
        &self,
        code: u8
    ) -> Result<AuthMethod, RegistryError> {
        self.registry.get(&code)
    }

    /// Get all registered method codes, in ascending order.
    pub fn codes(&self) -> Result<Vec<u8>, RegistryError> {
        let mut codes = self.registry.keys()?;

        codes.sort_unstable();

        Ok(codes)
    }
}

impl Default for AuthMethods {
    #[inline]
    fn default() -> Self {
        AuthMethods::new()
    }
}

impl Debug for AuthMethod {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.write_str("AuthMethod")
    }
}

#[cfg(test)]
fn reject_exchange(_stream: &dyn Pipeline) -> Result<(), SOCKS5Error> {
    Err(SOCKS5Error::AuthNFailed { method: 0x80 })
}

#[test]
fn test_default_methods() {
    crate::init();

    let methods = AuthMethods::new();

    assert_eq!(methods.codes().expect("Expected success"), vec![0x00]);
    assert!(methods.get(0x02).is_err());
}

#[test]
fn test_register_method() {
    crate::init();

    let methods = AuthMethods::new();
    let reject =
        AuthMethod::new(Arc::new(reject_exchange), Arc::new(reject_exchange));

    methods.register(0x80, reject).expect("Expected success");

    assert!(methods.register(0x00, AuthMethod::no_auth()).is_err());
    assert_eq!(methods.codes().expect("Expected success"), vec![0x00, 0x80]);

    let (stream, _) = crate::pipeline::duplex::DuplexPipeline::pair();
    let method = methods.get(0x80).expect("Expected success");

    assert!(matches!(
        method.initiate(&stream),
        Err(SOCKS5Error::AuthNFailed { method: 0x80 })
    ));
}
