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


//! Errors for the SOCKS5 protocol.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;

use crate::net::DialError;
use crate::registry::RegistryError;
use crate::socks5::proto::Reply;

/// Errors that can occur during a SOCKS5 exchange.
#[derive(Debug)]
pub enum SOCKS5Error {
    /// The peer sent a version other than 5.
    UnsupportedProtocol {
        /// The version that was received.
        version: u8
    },
    /// The server accepted none of the offered methods.
    NoAcceptableMethods,
    /// The server selected a method that is not registered.
    UnsupportedAuthMethod {
        /// The selected method.
        method: u8
    },
    /// An authentication method failed.
    AuthNFailed {
        /// The method that failed.
        method: u8
    },
    /// The client requested a command other than CONNECT.
    UnsupportedCommand {
        /// The requested command.
        command: u8
    },
    /// The address type is not one of IPv4, IPv6, or domain.
    UnknownAddressType {
        /// The address type that was received.
        atyp: u8
    },
    /// A domain name is too long to be encoded.
    NameTooLong {
        /// Length of the name, in bytes.
        len: usize
    },
    /// A domain name was not valid UTF-8.
    BadDomainName,
    /// More methods were offered than fit in a method request.
    TooManyMethods {
        /// Number of methods.
        count: usize
    },
    /// The server refused the CONNECT request.
    ConnectFailed {
        /// The reply from the server.
        reply: Reply
    },
    /// The destination could not be reached.
    Dial {
        /// The error from the dial.
        err: DialError
    },
    /// Too many upstream handshakes are nested.
    DepthExceeded {
        /// The configured limit.
        max: usize
    },
    /// Error looking up an authentication method.
    Registry {
        /// The registry error.
        err: RegistryError
    },
    /// An IO error occurred.
    IOError {
        /// The underlying error.
        error: Error
    }
}

impl SOCKS5Error {
    /// Get the reply code to send to a client for this error.
    pub fn reply(&self) -> Reply {
        match self {
            SOCKS5Error::UnsupportedCommand { .. } => Reply::CmdNotSupported,
            SOCKS5Error::UnknownAddressType { .. } => {
                Reply::AddrTypeNotSupported
            }
            SOCKS5Error::ConnectFailed { reply } => *reply,
            SOCKS5Error::Dial { err } => Reply::from(err),
            SOCKS5Error::DepthExceeded { .. } => Reply::NotAllowed,
            _ => Reply::ServerFailure
        }
    }
}

impl From<Error> for SOCKS5Error {
    #[inline]
    fn from(error: Error) -> SOCKS5Error {
        SOCKS5Error::IOError { error: error }
    }
}

impl From<DialError> for SOCKS5Error {
    #[inline]
    fn from(err: DialError) -> SOCKS5Error {
        SOCKS5Error::Dial { err: err }
    }
}

impl From<RegistryError> for SOCKS5Error {
    #[inline]
    fn from(err: RegistryError) -> SOCKS5Error {
        SOCKS5Error::Registry { err: err }
    }
}

impl ScopedError for SOCKS5Error {
    fn scope(&self) -> ErrorScope {
        match self {
            SOCKS5Error::Dial { err } => err.scope(),
            SOCKS5Error::Registry { err } => err.scope(),
            SOCKS5Error::IOError { error } => error.scope(),
            SOCKS5Error::ConnectFailed { .. } => ErrorScope::External,
            _ => ErrorScope::Session
        }
    }
}

impl Display for SOCKS5Error {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SOCKS5Error::UnsupportedProtocol { version } => {
                write!(f, "unsupported protocol version {}", version)
            }
            SOCKS5Error::NoAcceptableMethods => {
                write!(f, "no acceptable authentication methods")
            }
            SOCKS5Error::UnsupportedAuthMethod { method } => {
                write!(f, "unsupported authentication method {:#04x}", method)
            }
            SOCKS5Error::AuthNFailed { method } => {
                write!(f, "authentication failed (method {:#04x})", method)
            }
            SOCKS5Error::UnsupportedCommand { command } => {
                write!(f, "unsupported command {:#04x}", command)
            }
            SOCKS5Error::UnknownAddressType { atyp } => {
                write!(f, "unknown address type {:#04x}", atyp)
            }
            SOCKS5Error::NameTooLong { len } => {
                write!(f, "domain name too long ({} bytes)", len)
            }
            SOCKS5Error::BadDomainName => {
                write!(f, "domain name is not valid UTF-8")
            }
            SOCKS5Error::TooManyMethods { count } => {
                write!(f, "too many authentication methods ({})", count)
            }
            SOCKS5Error::ConnectFailed { reply } => {
                write!(f, "connect failed: {}", reply)
            }
            SOCKS5Error::Dial { err } => err.fmt(f),
            SOCKS5Error::DepthExceeded { max } => {
                write!(f, "upstream nesting exceeds {}", max)
            }
            SOCKS5Error::Registry { err } => err.fmt(f),
            SOCKS5Error::IOError { error } => error.fmt(f)
        }
    }
}
