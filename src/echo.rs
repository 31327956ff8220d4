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


//! Echo stage.
//!
//! The echo stage is a sink: everything the client sends is written
//! to the process's standard output (or standard error), and nothing
//! is ever sent back.  The client sees end-of-stream once the stage
//! is closed.  This is mostly useful for inspecting what earlier
//! stages in a chain produce.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::stderr;
use std::io::stdout;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use log::debug;
use log::error;
use log::warn;

use crate::config::ConfigError;
use crate::config::ConfigField;
use crate::config::Configurable;
use crate::config::FieldKind;
use crate::config::TypedValue;
use crate::context::Context;
use crate::pipeline::relay::Relay;
use crate::pipeline::Pipeline;
use crate::pipeline::Stage;
use crate::pipeline::StageConfig;
use crate::pipeline::StageError;

const ECHO_FIELDS: &[ConfigField] = &[ConfigField::new("sink", FieldKind::Str)];

/// Where an [EchoSink] writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EchoTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr
}

/// Configuration for the echo stage.
///
/// # YAML Format
///
/// - `sink`: Either `stdout` (the default) or `stderr`.
///
/// ## Examples
///
/// ```yaml
/// protocol: echo
/// config:
///   sink: stderr
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct EchoStageConfig {
    sink: EchoTarget
}

/// A write-only [Pipeline].
///
/// Writes go to the underlying writer.  Reads block until the sink is
/// closed, and then report end-of-stream.
pub struct EchoSink {
    writer: Mutex<Box<dyn Write + Send>>,
    closed: Mutex<bool>,
    cond: Condvar
}

impl Default for EchoStageConfig {
    #[inline]
    fn default() -> Self {
        EchoStageConfig {
            sink: EchoTarget::Stdout
        }
    }
}

impl EchoStageConfig {
    /// Get the sink target.
    #[inline]
    pub fn sink(&self) -> EchoTarget {
        self.sink
    }
}

impl Configurable for EchoStageConfig {
    #[inline]
    fn fields(&self) -> &'static [ConfigField] {
        ECHO_FIELDS
    }

    fn assign(
        &mut self,
        field: &ConfigField,
        value: TypedValue
    ) -> Result<(), ConfigError> {
        let name = value.into_string(field)?;

        self.sink = match name.to_ascii_lowercase().as_str() {
            "stdout" => EchoTarget::Stdout,
            "stderr" => EchoTarget::Stderr,
            _ => {
                return Err(ConfigError::Invalid {
                    key: field.key(),
                    reason: format!("unknown sink \"{}\"", name)
                })
            }
        };

        Ok(())
    }
}

impl StageConfig for EchoStageConfig {
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
        if let Some(output) = output {
            warn!(target: "echo-stage",
                  "echo is a sink, closing pre-supplied output");

            if let Err(err) = output.close() {
                debug!(target: "echo-stage",
                       "error closing output: {}",
                       err);
            }
        }

        if ctx.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let name = match input.peer_addr() {
            Some(peer) => format!("echo {} -> {}", peer, self.sink),
            None => format!("echo -> {}", self.sink)
        };
        let sink = Arc::new(EchoSink::new(self.sink));

        Ok(Arc::new(Relay::new(ctx, name, input, sink)))
    }
}

impl EchoSink {
    /// Create an `EchoSink` writing to `target`.
    #[inline]
    pub fn new(target: EchoTarget) -> Self {
        match target {
            EchoTarget::Stdout => EchoSink::with_writer(stdout()),
            EchoTarget::Stderr => EchoSink::with_writer(stderr())
        }
    }

    /// Create an `EchoSink` writing to an arbitrary writer.
    pub fn with_writer<W>(writer: W) -> Self
    where
        W: 'static + Write + Send {
        EchoSink {
            writer: Mutex::new(Box::new(writer)),
            closed: Mutex::new(false),
            cond: Condvar::new()
        }
    }

    fn is_closed(&self) -> Result<bool, Error> {
        match self.closed.lock() {
            Ok(guard) => Ok(*guard),
            Err(_) => {
                error!(target: "echo-stage",
                       "mutex poisoned");

                Err(Error::new(ErrorKind::Other, "mutex poisoned"))
            }
        }
    }
}

impl Pipeline for EchoSink {
    fn read(
        &self,
        _buf: &mut [u8]
    ) -> Result<usize, Error> {
        let mut guard = match self.closed.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!(target: "echo-stage",
                       "mutex poisoned");

                return Err(Error::new(ErrorKind::Other, "mutex poisoned"));
            }
        };

        while !*guard {
            guard = match self.cond.wait(guard) {
                Ok(guard) => guard,
                Err(_) => {
                    error!(target: "echo-stage",
                           "mutex poisoned");

                    return Err(Error::new(ErrorKind::Other, "mutex poisoned"));
                }
            };
        }

        Ok(0)
    }

    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        if self.is_closed()? {
            return Err(Error::new(ErrorKind::BrokenPipe, "sink closed"));
        }

        match self.writer.lock() {
            Ok(mut writer) => {
                writer.write_all(buf)?;
                writer.flush()?;

                Ok(buf.len())
            }
            Err(_) => {
                error!(target: "echo-stage",
                       "mutex poisoned");

                Err(Error::new(ErrorKind::Other, "mutex poisoned"))
            }
        }
    }

    fn close(&self) -> Result<(), Error> {
        match self.closed.lock() {
            Ok(mut guard) => {
                *guard = true;
                self.cond.notify_all();

                Ok(())
            }
            Err(_) => {
                error!(target: "echo-stage",
                       "mutex poisoned");

                Err(Error::new(ErrorKind::Other, "mutex poisoned"))
            }
        }
    }
}

impl Debug for EchoSink {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("EchoSink")
            .field("closed", &self.is_closed().unwrap_or(true))
            .finish()
    }
}

impl Display for EchoTarget {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EchoTarget::Stdout => write!(f, "stdout"),
            EchoTarget::Stderr => write!(f, "stderr")
        }
    }
}

#[cfg(test)]
use std::io::Read;
#[cfg(test)]
use std::thread::sleep;
#[cfg(test)]
use std::thread::spawn;
#[cfg(test)]
use std::time::Duration;

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
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedBuf {
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.0
            .lock()
            .expect("Expected success")
            .extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[test]
fn test_echo_sink_read_blocks_until_close() {
    crate::init();

    let sink = Arc::new(EchoSink::with_writer(SharedBuf::default()));
    let reader = sink.clone();
    let handle = spawn(move || {
        let mut buf = [0; 16];

        reader.read(&mut buf)
    });

    sleep(Duration::from_millis(50));

    assert!(!handle.is_finished());

    sink.close().expect("Expected success");

    assert_eq!(handle.join().expect("Expected success").expect("Expected success"), 0);
    assert!(matches!(
        sink.write(b"late"),
        Err(err) if err.kind() == ErrorKind::BrokenPipe
    ));
}

#[test]
fn test_echo_sink_writes() {
    crate::init();

    let buf = SharedBuf::default();
    let sink = EchoSink::with_writer(buf.clone());

    assert_eq!(sink.write(b"hello ").expect("Expected success"), 6);
    assert_eq!(sink.write(b"world").expect("Expected success"), 5);
    assert_eq!(&*buf.0.lock().expect("Expected success"), b"hello world");
}

#[test]
fn test_echo_stage_relays_to_sink() {
    crate::init();

    let (input, client) = DuplexPipeline::pair();
    let ctx = Context::new();
    let config = EchoStageConfig::default();
    let stage = config
        .create(&ctx, Arc::new(input), None)
        .expect("Expected success");
    let relay = spawn(move || stage.transport());
    let mut io = PipelineIO::new(&client);
    let mut buf = Vec::new();

    io.write_all(b"to stdout\n").expect("Expected success");
    client.close().expect("Expected success");
    io.read_to_end(&mut buf).expect("Expected success");

    assert!(buf.is_empty());
    assert!(relay.join().expect("Expected success").is_ok());
}

#[test]
fn test_echo_stage_closes_presupplied_output() {
    crate::init();

    let (input, _client) = DuplexPipeline::pair();
    let (output, far) = DuplexPipeline::pair();
    let ctx = Context::new();
    let stage = EchoStageConfig::default()
        .create(&ctx, Arc::new(input), Some(Arc::new(output)))
        .expect("Expected success");
    let mut buf = [0; 4];

    assert_eq!(far.read(&mut buf).expect("Expected success"), 0);

    stage.close().expect("Expected success");
}

#[test]
fn test_echo_config_sink() {
    crate::init();

    let mut config = EchoStageConfig::default();
    let mut raw = RawConfig::new();

    assert_eq!(config.sink(), EchoTarget::Stdout);

    raw.insert(String::from("sink"), ConfigValue::Str(String::from("STDERR")));
    project(&mut config, &raw).expect("Expected success");

    assert_eq!(config.sink(), EchoTarget::Stderr);

    raw.insert(String::from("sink"), ConfigValue::Str(String::from("syslog")));

    assert!(matches!(
        project(&mut config, &raw),
        Err(ConfigError::Invalid { key: "sink", .. })
    ));
}
