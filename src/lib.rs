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


#![allow(clippy::redundant_field_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]

//! Composable tunneling proxy.
//!
//! This package accepts inbound connections on configured listeners
//! and passes each one through a *chain* of pipeline stages.  Each
//! stage reads from its input, transforms or routes the bytes, and
//! writes to its output, which is either the next stage's input or
//! an outbound connection.  The built-in stages are:
//!
//!  - `socks5`: a SOCKS5 CONNECT responder, which connects to the
//!    destination requested by the client, optionally through an
//!    upstream SOCKS5 server.  See the [socks5] module.
//!
//!  - `tcp` (also `direct`): a direct connection to a fixed
//!    destination.  See the [direct] module.
//!
//!  - `echo`: a sink that prints what it receives.  See the [echo]
//!    module.
//!
//! New stages are added by implementing
//! [StageConfig](crate::pipeline::StageConfig) and registering it
//! with a [StageRegistry](crate::pipeline::StageRegistry).
//!
//! # Configuration
//!
//! The proxy is configured with a [SomersaultConfig], which can be
//! parsed from YAML using `serde_yaml`.  Each chain entry carries an
//! untyped configuration, which is projected onto the stage's typed
//! configuration when the listener starts (see [config]).
//!
//! # Running
//!
//! A [Somersault] instance binds every usable listener and serves
//! connections on background threads until it is shut down:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use somersault::config::SomersaultConfig;
//! # use somersault::pipeline::StageRegistry;
//! # use somersault::socks5::auth::AuthMethods;
//! # use somersault::Somersault;
//! let yaml = concat!(
//!     "listeners:\n",
//!     "  - address: 127.0.0.1\n",
//!     "    port: 1080\n",
//!     "    chain:\n",
//!     "      - protocol: socks5\n"
//! );
//! let config: SomersaultConfig = serde_yaml::from_str(yaml).unwrap();
//! let stages = StageRegistry::with_builtins(Arc::new(AuthMethods::new()))
//!     .unwrap();
//! let mut somersault = Somersault::new(&config, &stages).unwrap();
//!
//! somersault.close();
//! ```
pub mod addrs;
pub mod config;
pub mod connector;
pub mod context;
pub mod direct;
pub mod echo;
pub mod net;
pub mod pipeline;
pub mod registry;
pub mod socks5;
pub mod somersault;

pub use crate::config::SomersaultConfig;
pub use crate::somersault::Somersault;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
