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


//! The proxy orchestrator.
//!
//! A [Somersault] instance runs one accept loop per configured
//! listener.  Each accepted connection is handed to its own thread,
//! which builds the listener's chain of stages on top of it.
//!
//! # Chains
//!
//! The first stage's input is the accepted connection.  Each stage
//! except the last is given one end of a
//! [DuplexPipeline](crate::pipeline::duplex::DuplexPipeline) as its
//! output, and the next stage's input is the other end.  The last
//! stage establishes its own output.  Stages are created in order,
//! and each stage's relay is started before the next stage is
//! created, since later stages read what earlier stages forward.
//!
//! If any stage fails to be created, the connection's context is
//! cancelled, which closes every stage created so far, and the
//! accepted connection is closed.  Other connections are not affected.
//!
//! # Skipped Listeners
//!
//! A listener with an unknown network, an empty address, a zero port
//! (except for `unix`), an empty chain, or a chain naming an
//! unregistered stage is skipped with a warning.  A chain entry whose
//! configuration cannot be projected is a fatal error, as is a
//! listener that cannot be bound.
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::sleep;
use std::thread::spawn;
use std::thread::JoinHandle;
use std::time::Duration;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use constellation_common::shutdown::ShutdownFlag;
use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use crate::addrs::Network;
use crate::config::ListenerConfig;
use crate::config::SomersaultConfig;
use crate::context::Context;
use crate::net::Connection;
use crate::net::Listener;
use crate::pipeline::duplex::DuplexPipeline;
use crate::pipeline::Pipeline;
use crate::pipeline::Stage;
use crate::pipeline::StageConfig;
use crate::pipeline::StageRegistry;
use crate::registry::RegistryError;

/// How long the accept loop sleeps when no connection is pending.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The running proxy.
pub struct Somersault {
    ctx: Context,
    listeners: Vec<ListenerHandle>
}

/// Errors that can occur when starting the proxy.
#[derive(Debug)]
pub enum SomersaultError {
    /// A chain entry could not be materialized.
    Chain {
        /// Name of the listener.
        listener: String,
        /// The registry error.
        err: RegistryError
    },
    /// A listener could not be bound.
    Bind {
        /// Name of the listener.
        listener: String,
        /// The underlying error.
        error: Error
    }
}

struct ListenerHandle {
    name: String,
    addr: Option<SocketAddr>,
    shutdown: ShutdownFlag,
    join: Option<JoinHandle<()>>
}

struct ListenerThread {
    name: String,
    listener: Listener,
    chain: Arc<Vec<(String, Box<dyn StageConfig>)>>,
    ctx: Context,
    shutdown: ShutdownFlag
}

fn listener_name(config: &ListenerConfig) -> String {
    if config.address().contains(':') {
        format!("{} [{}]:{}", config.network(), config.address(), config.port())
    } else {
        format!("{} {}:{}", config.network(), config.address(), config.port())
    }
}

fn close_quietly(
    pipeline: &dyn Pipeline,
    what: &str
) {
    if let Err(err) = pipeline.close() {
        debug!(target: "somersault",
               "error closing {}: {}",
               what, err);
    }
}

// Returns None if the listener should be skipped.
fn resolve_chain(
    name: &str,
    config: &ListenerConfig,
    stages: &StageRegistry
) -> Result<Option<Vec<(String, Box<dyn StageConfig>)>>, SomersaultError> {
    if config.chain().is_empty() {
        warn!(target: "somersault",
              "listener {} has an empty chain, skipping",
              name);

        return Ok(None);
    }

    let mut chain = Vec::with_capacity(config.chain().len());

    for entry in config.chain() {
        match stages.lookup(entry.protocol(), entry.config()) {
            Ok(stage) => chain.push((String::from(entry.protocol()), stage)),
            Err(RegistryError::NotFound { name: stage, .. }) => {
                warn!(target: "somersault",
                      "listener {} uses unknown stage \"{}\", skipping",
                      name, stage);

                return Ok(None);
            }
            Err(err) => {
                return Err(SomersaultError::Chain {
                    listener: String::from(name),
                    err: err
                })
            }
        }
    }

    Ok(Some(chain))
}

// Build the chain on `conn`.  Returns the running stages' threads.
fn build_chain(
    ctx: &Context,
    name: &str,
    chain: &[(String, Box<dyn StageConfig>)],
    conn: Arc<dyn Pipeline>
) -> Result<Vec<JoinHandle<()>>, ()> {
    let mut input = conn;
    let mut threads = Vec::with_capacity(chain.len());

    for (i, (protocol, config)) in chain.iter().enumerate() {
        let (output, next): (Option<Arc<dyn Pipeline>>, Option<Arc<dyn Pipeline>>) =
            if i + 1 < chain.len() {
                let (near, far) = DuplexPipeline::pair();

                (Some(Arc::new(near)), Some(Arc::new(far)))
            } else {
                (None, None)
            };

        trace!(target: "somersault",
               "{}: creating stage {} ({})",
               name, i, protocol);

        match config.create(ctx, input.clone(), output) {
            Ok(stage) => threads.push(spawn_transport(name, protocol, stage)),
            Err(err) => {
                warn!(target: "somersault",
                      "{}: stage {} ({}) failed: {}",
                      name, i, protocol, err);

                ctx.cancel();
                close_quietly(input.as_ref(), "stage input");

                if let Some(next) = next {
                    close_quietly(next.as_ref(), "stage link");
                }

                for thread in threads {
                    if thread.join().is_err() {
                        error!(target: "somersault",
                               "{}: stage thread panicked",
                               name);
                    }
                }

                return Err(());
            }
        }

        if let Some(next) = next {
            input = next
        }
    }

    Ok(threads)
}

fn spawn_transport(
    name: &str,
    protocol: &str,
    stage: Arc<dyn Stage>
) -> JoinHandle<()> {
    let name = format!("{} ({})", name, protocol);

    spawn(move || {
        if let Err(err) = stage.transport() {
            debug!(target: "somersault",
                   "{}: errors closing stage: {}",
                   name, err);
        }

        trace!(target: "somersault",
               "{}: stage finished",
               name);
    })
}

fn handle_connection(
    root: Context,
    name: String,
    chain: Arc<Vec<(String, Box<dyn StageConfig>)>>,
    conn: Connection
) {
    let ctx = root.child();
    let conn: Arc<dyn Pipeline> = Arc::new(conn);
    let name = match conn.peer_addr() {
        Some(peer) => format!("{} <- {}", name, peer),
        None => name
    };

    debug!(target: "somersault",
           "{}: building chain",
           name);

    match build_chain(&ctx, &name, &chain, conn.clone()) {
        Ok(threads) => {
            info!(target: "somersault",
                  "{}: chain established",
                  name);

            for thread in threads {
                if thread.join().is_err() {
                    error!(target: "somersault",
                           "{}: stage thread panicked",
                           name);
                }
            }

            debug!(target: "somersault",
                   "{}: connection finished",
                   name);
        }
        Err(()) => close_quietly(conn.as_ref(), "connection")
    }
}

impl ListenerThread {
    fn run(self) {
        let ListenerThread {
            name,
            listener,
            chain,
            ctx,
            shutdown
        } = self;

        info!(target: "somersault",
              "listening on {}",
              name);

        while shutdown.is_live() {
            match listener.accept() {
                Ok(Some(conn)) => {
                    let ctx = ctx.clone();
                    let chain = chain.clone();
                    let name = name.clone();

                    spawn(move || handle_connection(ctx, name, chain, conn));
                }
                Ok(None) => sleep(ACCEPT_POLL_INTERVAL),
                Err(err) => {
                    warn!(target: "somersault",
                          "error accepting on {}: {}",
                          name, err);

                    sleep(ACCEPT_POLL_INTERVAL)
                }
            }
        }

        info!(target: "somersault",
              "stopped listening on {}",
              name);
    }
}

impl Somersault {
    /// Start the proxy.
    ///
    /// Every listener in `config` is checked, its chain is resolved
    /// against `stages`, and it is bound and started.  On error, any
    /// listeners already started are shut down.
    pub fn new(
        config: &SomersaultConfig,
        stages: &StageRegistry
    ) -> Result<Self, SomersaultError> {
        let mut out = Somersault {
            ctx: Context::new(),
            listeners: Vec::with_capacity(config.listeners().len())
        };

        for listener in config.listeners() {
            if let Some(handle) = out.start_listener(listener, stages)? {
                out.listeners.push(handle)
            }
        }

        if out.listeners.is_empty() {
            warn!(target: "somersault",
                  "no listeners were started");
        }

        Ok(out)
    }

    fn start_listener(
        &self,
        config: &ListenerConfig,
        stages: &StageRegistry
    ) -> Result<Option<ListenerHandle>, SomersaultError> {
        let name = listener_name(config);
        let network = match Network::try_from(config.network()) {
            Ok(network) => network,
            Err(err) => {
                warn!(target: "somersault",
                      "listener {}: {}, skipping",
                      name, err);

                return Ok(None);
            }
        };

        if config.address().is_empty() {
            warn!(target: "somersault",
                  "listener {} has no address, skipping",
                  name);

            return Ok(None);
        }

        #[cfg(feature = "unix")]
        let needs_port = network != Network::Unix;
        #[cfg(not(feature = "unix"))]
        let needs_port = true;

        if needs_port && config.port() == 0 {
            warn!(target: "somersault",
                  "listener {} has no port, skipping",
                  name);

            return Ok(None);
        }

        let chain = match resolve_chain(&name, config, stages)? {
            Some(chain) => chain,
            None => return Ok(None)
        };
        let listener = Listener::bind(network, config.address(), config.port())
            .map_err(|error| SomersaultError::Bind {
                listener: name.clone(),
                error: error
            })?;
        let addr = listener.local_addr();
        let shutdown = ShutdownFlag::new();
        let thread = ListenerThread {
            name: name.clone(),
            listener: listener,
            chain: Arc::new(chain),
            ctx: self.ctx.clone(),
            shutdown: shutdown.clone()
        };
        let join = spawn(|| thread.run());

        Ok(Some(ListenerHandle {
            name: name,
            addr: addr,
            shutdown: shutdown,
            join: Some(join)
        }))
    }

    /// Get the names of the running listeners.
    pub fn listeners(&self) -> Vec<&str> {
        self.listeners
            .iter()
            .map(|handle| handle.name.as_str())
            .collect()
    }

    /// Get the bound addresses of the running TCP listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|handle| handle.addr)
            .collect()
    }

    /// Stop accepting connections.
    ///
    /// Connections that are already established continue until they
    /// end on their own.
    pub fn shutdown(&mut self) {
        for handle in &self.listeners {
            handle.shutdown.set()
        }

        for handle in &mut self.listeners {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    error!(target: "somersault",
                           "listener thread for {} panicked",
                           handle.name);
                }
            }
        }
    }

    /// Stop accepting connections, and close every connection.
    pub fn close(&mut self) {
        self.shutdown();
        self.ctx.cancel();
    }
}

impl Drop for Somersault {
    fn drop(&mut self) {
        self.shutdown()
    }
}

impl ScopedError for SomersaultError {
    fn scope(&self) -> ErrorScope {
        match self {
            SomersaultError::Chain { err, .. } => err.scope(),
            SomersaultError::Bind { error, .. } => error.scope()
        }
    }
}

impl Display for SomersaultError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SomersaultError::Chain { listener, err } => {
                write!(f, "bad chain for listener {}: {}", listener, err)
            }
            SomersaultError::Bind { listener, error } => {
                write!(f, "cannot bind listener {}: {}", listener, error)
            }
        }
    }
}

#[cfg(test)]
use std::io::ErrorKind;
#[cfg(test)]
use std::io::Read;
#[cfg(test)]
use std::io::Write;
#[cfg(test)]
use std::net::TcpListener;
#[cfg(test)]
use std::net::TcpStream;

#[cfg(test)]
use crate::addrs::Endpoint;
#[cfg(test)]
use crate::config::ConfigValue;
#[cfg(test)]
use crate::config::RawConfig;
#[cfg(test)]
use crate::config::StageEntryConfig;
#[cfg(test)]
use crate::net::tcp::TCPPipeline;
#[cfg(test)]
use crate::socks5::auth::AuthMethods;
#[cfg(test)]
use crate::socks5::error::SOCKS5Error;
#[cfg(test)]
use crate::socks5::handshake::connect;
#[cfg(test)]
use crate::socks5::handshake::handshake;
#[cfg(test)]
use crate::socks5::proto::Reply;

#[cfg(test)]
fn builtins() -> StageRegistry {
    StageRegistry::with_builtins(Arc::new(AuthMethods::new()))
        .expect("Expected success")
}

#[cfg(test)]
fn stage(
    protocol: &str,
    entries: &[(&str, ConfigValue)]
) -> StageEntryConfig {
    let mut raw = RawConfig::new();

    for (key, value) in entries {
        raw.insert(String::from(*key), value.clone());
    }

    StageEntryConfig::new(String::from(protocol), raw)
}

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

#[test]
fn test_skipped_listeners() {
    crate::init();

    let config = SomersaultConfig::new(vec![
        ListenerConfig::new(
            String::from("udp"),
            String::from("127.0.0.1"),
            27101,
            vec![stage("echo", &[])]
        ),
        ListenerConfig::new(
            String::from("tcp"),
            String::new(),
            27102,
            vec![stage("echo", &[])]
        ),
        ListenerConfig::new(
            String::from("tcp"),
            String::from("127.0.0.1"),
            0,
            vec![stage("echo", &[])]
        ),
        ListenerConfig::new(
            String::from("tcp"),
            String::from("127.0.0.1"),
            27103,
            vec![]
        ),
        ListenerConfig::new(
            String::from("tcp"),
            String::from("127.0.0.1"),
            27104,
            vec![stage("socks5", &[]), stage("http", &[])]
        )
    ]);
    let mut somersault =
        Somersault::new(&config, &builtins()).expect("Expected success");

    assert!(somersault.listeners().is_empty());

    somersault.close();
}

#[test]
fn test_bad_stage_config_fatal() {
    crate::init();

    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27105,
        vec![stage("tcp", &[("port", ConfigValue::Str(String::from("http")))])]
    )]);

    assert!(matches!(
        Somersault::new(&config, &builtins()),
        Err(SomersaultError::Chain { .. })
    ));
}

#[test]
fn test_socks5_chain_end_to_end() {
    crate::init();

    let (echo, echo_handle) = echo_server();
    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27106,
        vec![stage("socks5", &[])]
    )]);
    let mut somersault =
        Somersault::new(&config, &builtins()).expect("Expected success");

    assert_eq!(somersault.listeners(), vec!["tcp 127.0.0.1:27106"]);

    let stream = TcpStream::connect("127.0.0.1:27106").expect("Expected success");
    let client = TCPPipeline::from(stream);
    let auth = AuthMethods::new();

    handshake(&client, &auth).expect("Expected success");
    connect(&client, &Endpoint::from(echo)).expect("Expected success");

    let mut buf = [0; 5];

    client.write(b"hello").expect("Expected success");
    client.stream().read_exact(&mut buf).expect("Expected success");

    assert_eq!(&buf, b"hello");

    client.close().expect("Expected success");
    somersault.close();
    echo_handle.join().expect("Expected success");
}

#[test]
fn test_socks5_then_direct_chain() {
    crate::init();

    let (echo, echo_handle) = echo_server();
    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27107,
        vec![
            stage("socks5", &[]),
            stage(
                "tcp",
                &[
                    ("address", ConfigValue::Str(String::from("127.0.0.1"))),
                    ("port", ConfigValue::UInt(echo.port() as u64))
                ]
            )
        ]
    )]);
    let mut somersault =
        Somersault::new(&config, &builtins()).expect("Expected success");
    let stream = TcpStream::connect("127.0.0.1:27107").expect("Expected success");
    let client = TCPPipeline::from(stream);
    let auth = AuthMethods::new();

    handshake(&client, &auth).expect("Expected success");

    // The requested destination is ignored; the last stage decides.
    let bound = connect(&client, &Endpoint::parse("192.0.2.1", 9))
        .expect("Expected success");

    assert_eq!(bound.to_string(), "0.0.0.0:0");

    let mut buf = [0; 5];

    client.write(b"chain").expect("Expected success");
    client.stream().read_exact(&mut buf).expect("Expected success");

    assert_eq!(&buf, b"chain");

    client.close().expect("Expected success");
    somersault.close();
    echo_handle.join().expect("Expected success");
}

#[test]
fn test_failed_chain_closes_connection() {
    crate::init();

    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");

        listener.local_addr().expect("Expected success")
    };
    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27108,
        vec![stage(
            "direct",
            &[
                ("address", ConfigValue::Str(String::from("127.0.0.1"))),
                ("port", ConfigValue::UInt(refused.port() as u64))
            ]
        )]
    )]);
    let mut somersault =
        Somersault::new(&config, &builtins()).expect("Expected success");

    for _ in 0..2 {
        let mut stream =
            TcpStream::connect("127.0.0.1:27108").expect("Expected success");
        let mut buf = Vec::new();

        assert!(matches!(stream.read_to_end(&mut buf), Ok(0) | Err(_)));
    }

    somersault.close();
}

#[test]
fn test_bind_failure_fatal() {
    crate::init();

    let taken = TcpListener::bind("127.0.0.1:27109").expect("Expected success");
    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27109,
        vec![stage("echo", &[])]
    )]);

    assert!(matches!(
        Somersault::new(&config, &builtins()),
        Err(SomersaultError::Bind { .. })
    ));

    drop(taken);
}

#[test]
fn test_upstream_self_loop_refused() {
    crate::init();

    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27110,
        vec![stage(
            "socks5",
            &[
                ("address", ConfigValue::Str(String::from("127.0.0.1"))),
                ("port", ConfigValue::UInt(27110)),
                ("max-depth", ConfigValue::UInt(3))
            ]
        )]
    )]);
    let mut somersault =
        Somersault::new(&config, &builtins()).expect("Expected success");
    let stream = TcpStream::connect("127.0.0.1:27110").expect("Expected success");
    let client = TCPPipeline::from(stream);
    let auth = AuthMethods::new();

    handshake(&client, &auth).expect("Expected success");

    assert!(matches!(
        connect(&client, &Endpoint::parse("192.0.2.1", 9)),
        Err(SOCKS5Error::ConnectFailed {
            reply: Reply::NotAllowed
        })
    ));

    client.close().expect("Expected success");
    somersault.close();
}

#[test]
fn test_failed_later_stage_closes_earlier_stages() {
    crate::init();

    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Expected success");

        listener.local_addr().expect("Expected success")
    };
    let config = SomersaultConfig::new(vec![ListenerConfig::new(
        String::from("tcp"),
        String::from("127.0.0.1"),
        27111,
        vec![
            stage("socks5", &[]),
            stage(
                "direct",
                &[
                    ("address", ConfigValue::Str(String::from("127.0.0.1"))),
                    ("port", ConfigValue::UInt(refused.port() as u64))
                ]
            )
        ]
    )]);
    let mut somersault =
        Somersault::new(&config, &builtins()).expect("Expected success");
    let auth = AuthMethods::new();

    for _ in 0..2 {
        let stream =
            TcpStream::connect("127.0.0.1:27111").expect("Expected success");
        let client = TCPPipeline::from(stream);

        handshake(&client, &auth).expect("Expected success");

        // The socks5 stage answers before the direct stage dials.
        let bound = connect(&client, &Endpoint::parse("192.0.2.1", 9))
            .expect("Expected success");

        assert_eq!(bound.to_string(), "0.0.0.0:0");

        client
            .stream()
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("Expected success");

        // The socks5 stage is torn down, closing the client.
        let mut buf = [0; 16];

        match client.stream().read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(err) => assert!(
                err.kind() != ErrorKind::WouldBlock &&
                    err.kind() != ErrorKind::TimedOut
            )
        }

        client.close().expect("Expected success");
    }

    somersault.close();
}
