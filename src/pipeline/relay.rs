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


//! The relay engine shared by all stages.
//!
//! A [Relay] owns an *input* and an *output* [Pipeline] and copies
//! bytes between them in both directions.  Its lifecycle is
//! `Constructed -> Running -> Closed`:
//!
//! - [new](Relay::new) creates a relay in the `Constructed` state, and
//!   registers it with a [Context], so that cancelling the context
//!   closes the relay.
//!
//! - [transport](Relay::transport) moves to `Running`, and runs two
//!   copy loops (input to output, and output to input), each with its
//!   own buffer.  A loop ends on end-of-stream or any error, and then
//!   closes the *destination* of its direction, which in turn causes
//!   the opposite loop to end.  Once both loops have ended, any side
//!   that is still open is closed, and the relay is `Closed`.
//!
//! - [shutdown](Relay::shutdown) closes both sides exactly once.  It
//!   may be called at any time, including concurrently with
//!   `transport`, and any number of times; every call returns the
//!   same aggregated result.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::scope;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use log::debug;
use log::error;
use log::trace;
use log::warn;

use crate::context::CancelGuard;
use crate::context::Context;
use crate::pipeline::Pipeline;
use crate::pipeline::Stage;

/// Size of the buffer used by each copy loop.
pub const RELAY_BUF_SIZE: usize = 1024;

/// A failure to close one side of a relay.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseFailure {
    side: &'static str,
    kind: ErrorKind,
    msg: String
}

/// Aggregated failures from closing a relay.
///
/// This holds one [CloseFailure] for each side that failed to close.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayCloseError {
    failures: Vec<CloseFailure>
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RelayState {
    Constructed,
    Running,
    Closed
}

struct RelaySide {
    name: &'static str,
    stream: Arc<dyn Pipeline>,
    closed: Mutex<Option<Result<(), CloseFailure>>>
}

struct RelayInner {
    name: String,
    input: RelaySide,
    output: RelaySide,
    state: Mutex<RelayState>,
    result: Mutex<Option<Result<(), RelayCloseError>>>,
    hook: Mutex<Option<CancelGuard>>
}

/// Bidirectional copy engine between an input and an output.
///
/// Cloning a `Relay` produces another handle to the same relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>
}

impl CloseFailure {
    /// Get the name of the side that failed to close.
    #[inline]
    pub fn side(&self) -> &'static str {
        self.side
    }

    /// Get the kind of the underlying IO error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl RelayCloseError {
    /// Get the individual failures.
    #[inline]
    pub fn failures(&self) -> &[CloseFailure] {
        &self.failures
    }
}

impl RelaySide {
    fn new(
        name: &'static str,
        stream: Arc<dyn Pipeline>
    ) -> Self {
        RelaySide {
            name: name,
            stream: stream,
            closed: Mutex::new(None)
        }
    }

    fn close(&self) -> Result<(), CloseFailure> {
        match self.closed.lock() {
            Ok(mut guard) => match &*guard {
                Some(res) => res.clone(),
                None => {
                    let res = self.stream.close().map_err(|err| CloseFailure {
                        side: self.name,
                        kind: err.kind(),
                        msg: err.to_string()
                    });

                    *guard = Some(res.clone());

                    res
                }
            },
            Err(_) => Err(CloseFailure {
                side: self.name,
                kind: ErrorKind::Other,
                msg: String::from("mutex poisoned")
            })
        }
    }

    fn write_all(
        &self,
        mut buf: &[u8]
    ) -> Result<(), Error> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::WriteZero,
                        "failed to write whole buffer"
                    ))
                }
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err)
            }
        }

        Ok(())
    }
}

impl RelayInner {
    // Copy from one side to the other until either fails, then close
    // the destination.  Returns the number of bytes forwarded.
    fn pump(
        &self,
        from: &RelaySide,
        to: &RelaySide
    ) -> u64 {
        let mut buf = [0; RELAY_BUF_SIZE];
        let mut total = 0;

        loop {
            match from.stream.read(&mut buf) {
                Ok(0) => {
                    trace!(target: "relay",
                           "{}: end of stream on {}",
                           self.name, from.name);

                    break;
                }
                Ok(n) => {
                    trace!(target: "relay",
                           "{}: {} -> {}: {} bytes",
                           self.name, from.name, to.name, n);

                    if let Err(err) = to.write_all(&buf[..n]) {
                        debug!(target: "relay",
                               "{}: write to {} failed: {}",
                               self.name, to.name, err);

                        break;
                    }

                    total += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(target: "relay",
                           "{}: read from {} failed: {}",
                           self.name, from.name, err);

                    break;
                }
            }
        }

        if let Err(err) = to.close() {
            debug!(target: "relay",
                   "{}: error closing {}: {}",
                   self.name, to.name, err);
        }

        total
    }

    fn set_state(
        &self,
        state: RelayState
    ) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(_) => {
                error!(target: "relay",
                       "{}: mutex poisoned",
                       self.name);
            }
        }
    }

    // Moves Constructed to Running; returns false for any other state.
    fn start(&self) -> bool {
        match self.state.lock() {
            Ok(mut guard) => {
                if *guard == RelayState::Constructed {
                    *guard = RelayState::Running;

                    true
                } else {
                    false
                }
            }
            Err(_) => {
                error!(target: "relay",
                       "{}: mutex poisoned",
                       self.name);

                false
            }
        }
    }

    fn shutdown(&self) -> Result<(), RelayCloseError> {
        let mut guard = match self.result.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!(target: "relay",
                       "{}: mutex poisoned",
                       self.name);

                return Err(RelayCloseError {
                    failures: vec![CloseFailure {
                        side: "relay",
                        kind: ErrorKind::Other,
                        msg: String::from("mutex poisoned")
                    }]
                });
            }
        };

        if let Some(res) = &*guard {
            return res.clone();
        }

        debug!(target: "relay",
               "{}: closing",
               self.name);

        let mut failures = Vec::with_capacity(2);

        if let Err(err) = self.input.close() {
            failures.push(err)
        }

        if let Err(err) = self.output.close() {
            failures.push(err)
        }

        let res = if failures.is_empty() {
            Ok(())
        } else {
            Err(RelayCloseError { failures: failures })
        };

        self.set_state(RelayState::Closed);
        *guard = Some(res.clone());

        res
    }
}

impl Relay {
    /// Create a relay between `input` and `output`.
    ///
    /// The relay is closed when `ctx` is cancelled.  If `ctx` is
    /// already cancelled, the relay is closed immediately.
    pub fn new<S>(
        ctx: &Context,
        name: S,
        input: Arc<dyn Pipeline>,
        output: Arc<dyn Pipeline>
    ) -> Self
    where
        S: Into<String> {
        let inner = Arc::new(RelayInner {
            name: name.into(),
            input: RelaySide::new("input", input),
            output: RelaySide::new("output", output),
            state: Mutex::new(RelayState::Constructed),
            result: Mutex::new(None),
            hook: Mutex::new(None)
        });
        let weak = Arc::downgrade(&inner);
        let guard = ctx.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                debug!(target: "relay",
                       "{}: cancelled",
                       inner.name);

                if let Err(err) = inner.shutdown() {
                    debug!(target: "relay",
                           "{}: error closing after cancellation: {}",
                           inner.name, err);
                }
            }
        });

        if let Ok(mut hook) = inner.hook.lock() {
            *hook = Some(guard)
        }

        Relay { inner: inner }
    }

    /// Get the name used for this relay in log messages.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the input stream.
    #[inline]
    pub fn input(&self) -> &Arc<dyn Pipeline> {
        &self.inner.input.stream
    }

    /// Get the output stream.
    #[inline]
    pub fn output(&self) -> &Arc<dyn Pipeline> {
        &self.inner.output.stream
    }

    /// Check whether the relay has been closed.
    pub fn is_closed(&self) -> bool {
        match self.inner.state.lock() {
            Ok(guard) => *guard == RelayState::Closed,
            Err(_) => true
        }
    }

    /// Copy bytes in both directions until both directions end.
    ///
    /// This blocks until the relay is closed, and returns the same
    /// result as [shutdown](Relay::shutdown).  Calling this on a relay
    /// that is already running or closed does not start new loops.
    pub fn transport(&self) -> Result<(), RelayCloseError> {
        if !self.inner.start() {
            warn!(target: "relay",
                  "{}: transport called on a relay that is not fresh",
                  self.inner.name);

            return self.inner.shutdown();
        }

        debug!(target: "relay",
               "{}: running",
               self.inner.name);

        let inner = &self.inner;
        let (inbound, outbound) = scope(|s| {
            let forward = s.spawn(|| inner.pump(&inner.input, &inner.output));
            let backward = s.spawn(|| inner.pump(&inner.output, &inner.input));
            let forward = forward.join().unwrap_or_else(|_| {
                error!(target: "relay",
                       "{}: copy loop panicked",
                       inner.name);

                0
            });
            let backward = backward.join().unwrap_or_else(|_| {
                error!(target: "relay",
                       "{}: copy loop panicked",
                       inner.name);

                0
            });

            (forward, backward)
        });

        debug!(target: "relay",
               "{}: finished ({} bytes forward, {} bytes back)",
               self.inner.name, inbound, outbound);

        self.inner.shutdown()
    }

    /// Close both sides of the relay.
    ///
    /// This is idempotent: only the first call closes anything, and
    /// every call returns the same aggregated result.
    #[inline]
    pub fn shutdown(&self) -> Result<(), RelayCloseError> {
        self.inner.shutdown()
    }
}

impl Pipeline for Relay {
    #[inline]
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.inner.output.stream.read(buf)
    }

    #[inline]
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.inner.input.stream.write(buf)
    }

    #[inline]
    fn close(&self) -> Result<(), Error> {
        self.shutdown().map_err(Error::from)
    }

    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.output.stream.local_addr()
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.input.stream.peer_addr()
    }
}

impl Stage for Relay {
    #[inline]
    fn transport(&self) -> Result<(), RelayCloseError> {
        Relay::transport(self)
    }
}

impl Debug for Relay {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("Relay")
            .field("name", &self.inner.name)
            .field("input", &self.inner.input.stream)
            .field("output", &self.inner.output.stream)
            .finish()
    }
}

impl From<RelayCloseError> for Error {
    fn from(err: RelayCloseError) -> Error {
        let kind = match err.failures.first() {
            Some(failure) => failure.kind,
            None => ErrorKind::Other
        };

        Error::new(kind, err.to_string())
    }
}

impl ScopedError for RelayCloseError {
    #[inline]
    fn scope(&self) -> ErrorScope {
        ErrorScope::Session
    }
}

impl Display for CloseFailure {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}: {}", self.side, self.msg)
    }
}

impl Display for RelayCloseError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        let mut first = true;

        for failure in &self.failures {
            if first {
                first = false;
            } else {
                write!(f, "\t")?;
            }

            write!(f, "{}", failure)?;
        }

        Ok(())
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::atomic::Ordering;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::pipeline::duplex::DuplexPipeline;

#[cfg(test)]
#[derive(Debug)]
struct FailingClose {
    inner: DuplexPipeline,
    closes: AtomicUsize
}

#[cfg(test)]
impl Pipeline for FailingClose {
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.inner.read(buf)
    }

    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.inner.write(buf)
    }

    fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()?;

        Err(Error::new(ErrorKind::Other, "close failed"))
    }
}

// Relay between two duplex pairs; the test drives the far ends.
#[cfg(test)]
fn relay_fixture(
    ctx: &Context
) -> (Relay, DuplexPipeline, DuplexPipeline) {
    let (input, client) = DuplexPipeline::pair();
    let (output, server) = DuplexPipeline::pair();
    let relay = Relay::new(ctx, "test", Arc::new(input), Arc::new(output));

    (relay, client, server)
}

#[cfg(test)]
fn read_to_end(pipeline: &dyn Pipeline) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0; 512];

    loop {
        match pipeline.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) => panic!("read failed: {}", err)
        }
    }

    out
}

#[cfg(test)]
fn write_all(
    pipeline: &dyn Pipeline,
    mut buf: &[u8]
) {
    while !buf.is_empty() {
        let n = pipeline.write(buf).expect("Expected success");

        buf = &buf[n..];
    }
}

#[cfg(test)]
fn check_fidelity(len: usize) {
    use std::io::Read;

    use crate::pipeline::PipelineIO;

    crate::init();

    let ctx = Context::new();
    let (relay, client, server) = relay_fixture(&ctx);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let reply: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
    let runner = relay.clone();
    let transport = spawn(move || runner.transport());
    let client_data = data.clone();
    let client_thread = spawn(move || {
        write_all(&client, &client_data);

        read_to_end(&client)
    });
    let server_reply = reply.clone();
    let server_thread = spawn(move || {
        let mut got = vec![0; len];

        PipelineIO::new(&server)
            .read_exact(&mut got)
            .expect("Expected success");
        write_all(&server, &server_reply);
        server.close().expect("Expected success");

        got
    });

    let server_got = server_thread.join().expect("Expected success");
    let client_got = client_thread.join().expect("Expected success");

    transport
        .join()
        .expect("Expected success")
        .expect("Expected success");

    assert_eq!(server_got, data);
    assert_eq!(client_got, reply);
    assert!(relay.is_closed());
}

#[test]
fn test_relay_fidelity_0() {
    check_fidelity(0)
}

#[test]
fn test_relay_fidelity_1() {
    check_fidelity(1)
}

#[test]
fn test_relay_fidelity_1023() {
    check_fidelity(1023)
}

#[test]
fn test_relay_fidelity_1024() {
    check_fidelity(1024)
}

#[test]
fn test_relay_fidelity_4096() {
    check_fidelity(4096)
}

#[test]
fn test_relay_close_propagates_to_input() {
    crate::init();

    let ctx = Context::new();
    let (relay, client, server) = relay_fixture(&ctx);
    let runner = relay.clone();
    let transport = spawn(move || runner.transport());

    server.close().expect("Expected success");

    let mut buf = [0; 16];

    assert_eq!(client.read(&mut buf).expect("Expected success"), 0);
    assert!(transport.join().expect("Expected success").is_ok());
    assert!(client.write(b"late").is_err());
}

#[test]
fn test_relay_close_propagates_to_output() {
    crate::init();

    let ctx = Context::new();
    let (relay, client, server) = relay_fixture(&ctx);
    let runner = relay.clone();
    let transport = spawn(move || runner.transport());

    client.close().expect("Expected success");

    let mut buf = [0; 16];

    assert_eq!(server.read(&mut buf).expect("Expected success"), 0);
    assert!(transport.join().expect("Expected success").is_ok());
}

#[test]
fn test_relay_shutdown_idempotent() {
    crate::init();

    let ctx = Context::new();
    let (input, _client) = DuplexPipeline::pair();
    let (output, _server) = DuplexPipeline::pair();
    let input = Arc::new(FailingClose {
        inner: input,
        closes: AtomicUsize::new(0)
    });
    let output = Arc::new(FailingClose {
        inner: output,
        closes: AtomicUsize::new(0)
    });
    let relay = Relay::new(&ctx, "test", input.clone(), output.clone());
    let first = relay.shutdown().expect_err("Expected failure");
    let second = relay.shutdown().expect_err("Expected failure");

    assert_eq!(first, second);
    assert_eq!(first.failures().len(), 2);
    assert_eq!(first.failures()[0].side(), "input");
    assert_eq!(first.failures()[1].side(), "output");
    assert_eq!(first.to_string(), "input: close failed\toutput: close failed");
    assert_eq!(input.closes.load(Ordering::SeqCst), 1);
    assert_eq!(output.closes.load(Ordering::SeqCst), 1);
    assert!(relay.is_closed());
}

#[test]
fn test_relay_shutdown_during_transport() {
    crate::init();

    let ctx = Context::new();
    let (relay, client, server) = relay_fixture(&ctx);
    let runner = relay.clone();
    let transport = spawn(move || runner.transport());

    write_all(&client, b"hello");

    let mut buf = [0; 5];

    std::io::Read::read_exact(&mut crate::pipeline::PipelineIO::new(&server), &mut buf)
        .expect("Expected success");
    assert_eq!(&buf, b"hello");

    relay.shutdown().expect("Expected success");

    assert!(transport.join().expect("Expected success").is_ok());
    assert_eq!(read_to_end(&client), Vec::<u8>::new());
    assert_eq!(read_to_end(&server), Vec::<u8>::new());
}

#[test]
fn test_relay_cancelled_by_context() {
    crate::init();

    let ctx = Context::new();
    let (relay, client, _server) = relay_fixture(&ctx);
    let runner = relay.clone();
    let transport = spawn(move || runner.transport());

    ctx.cancel();

    assert!(transport.join().expect("Expected success").is_ok());
    assert!(relay.is_closed());
    assert_eq!(read_to_end(&client), Vec::<u8>::new());
}

#[test]
fn test_relay_created_on_cancelled_context() {
    crate::init();

    let ctx = Context::new();

    ctx.cancel();

    let (relay, _client, _server) = relay_fixture(&ctx);

    assert!(relay.is_closed());
    assert!(relay.transport().is_ok());
}

#[test]
fn test_relay_pipeline_read_write() {
    crate::init();

    let ctx = Context::new();
    let (relay, client, server) = relay_fixture(&ctx);
    let mut buf = [0; 4];

    write_all(&server, b"down");
    assert_eq!(relay.read(&mut buf).expect("Expected success"), 4);
    assert_eq!(&buf, b"down");

    write_all(&relay, b"up");
    assert_eq!(client.read(&mut buf).expect("Expected success"), 2);
    assert_eq!(&buf[..2], b"up");
}
