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


//! In-memory duplex pipes.
//!
//! [DuplexPipeline::pair] creates two connected [Pipeline] ends:
//! bytes written to one end are read from the other, in both
//! directions.  Each direction has a bounded buffer, so a writer
//! blocks when its peer stops reading.
//!
//! Closing either end closes both directions, like shutting down a
//! TCP socket in both directions.  Data already buffered can still
//! be read by the peer, which then sees end-of-stream; writes to a
//! closed pipe fail with [BrokenPipe](ErrorKind::BrokenPipe).
//!
//! These are used to link adjacent stages in a chain, and as a
//! stand-in for sockets in tests.
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use log::trace;

use crate::pipeline::Pipeline;

/// Capacity of each direction of a [DuplexPipeline].
pub const DUPLEX_CAPACITY: usize = 64 * 1024;

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool
}

struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar
}

/// One end of an in-memory duplex pipe.
pub struct DuplexPipeline {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>
}

fn poisoned() -> Error {
    Error::new(ErrorKind::Other, "mutex poisoned")
}

impl Pipe {
    fn new() -> Self {
        Pipe {
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                closed: false
            }),
            readable: Condvar::new(),
            writable: Condvar::new()
        }
    }

    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.state.lock().map_err(|_| poisoned())?;

        while guard.buf.is_empty() && !guard.closed {
            guard = self.readable.wait(guard).map_err(|_| poisoned())?;
        }

        let n = buf.len().min(guard.buf.len());

        for (dst, src) in buf.iter_mut().zip(guard.buf.drain(..n)) {
            *dst = src
        }

        self.writable.notify_all();

        Ok(n)
    }

    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.state.lock().map_err(|_| poisoned())?;

        while guard.buf.len() >= DUPLEX_CAPACITY && !guard.closed {
            guard = self.writable.wait(guard).map_err(|_| poisoned())?;
        }

        if guard.closed {
            return Err(Error::new(ErrorKind::BrokenPipe, "pipe closed"));
        }

        let n = buf.len().min(DUPLEX_CAPACITY - guard.buf.len());

        guard.buf.extend(&buf[..n]);
        self.readable.notify_all();

        Ok(n)
    }

    fn close(&self) -> Result<(), Error> {
        let mut guard = self.state.lock().map_err(|_| poisoned())?;

        guard.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();

        Ok(())
    }

    fn buffered(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.buf.len(),
            Err(_) => 0
        }
    }
}

impl DuplexPipeline {
    /// Create a connected pair of pipe ends.
    pub fn pair() -> (DuplexPipeline, DuplexPipeline) {
        let forward = Arc::new(Pipe::new());
        let backward = Arc::new(Pipe::new());

        trace!(target: "duplex",
               "created duplex pipe");

        (
            DuplexPipeline {
                rx: backward.clone(),
                tx: forward.clone()
            },
            DuplexPipeline {
                rx: forward,
                tx: backward
            }
        )
    }
}

impl Pipeline for DuplexPipeline {
    #[inline]
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.rx.read(buf)
    }

    #[inline]
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.tx.write(buf)
    }

    fn close(&self) -> Result<(), Error> {
        self.tx.close()?;
        self.rx.close()
    }
}

impl Debug for DuplexPipeline {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("DuplexPipeline")
            .field("readable", &self.rx.buffered())
            .field("pending", &self.tx.buffered())
            .finish()
    }
}

#[cfg(test)]
use std::thread::spawn;

#[test]
fn test_duplex_both_directions() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();
    let mut buf = [0; 8];

    assert_eq!(a.write(b"ping").expect("Expected success"), 4);
    assert_eq!(b.read(&mut buf).expect("Expected success"), 4);
    assert_eq!(&buf[..4], b"ping");

    assert_eq!(b.write(b"pong").expect("Expected success"), 4);
    assert_eq!(a.read(&mut buf).expect("Expected success"), 4);
    assert_eq!(&buf[..4], b"pong");
}

#[test]
fn test_duplex_close_drains_then_eof() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();
    let mut buf = [0; 8];

    a.write(b"last").expect("Expected success");
    a.close().expect("Expected success");
    a.close().expect("Expected success");

    assert_eq!(b.read(&mut buf).expect("Expected success"), 4);
    assert_eq!(b.read(&mut buf).expect("Expected success"), 0);
    assert_eq!(
        b.write(b"x").expect_err("Expected failure").kind(),
        ErrorKind::BrokenPipe
    );
    assert_eq!(a.read(&mut buf).expect("Expected success"), 0);
}

#[test]
fn test_duplex_close_unblocks_reader() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();
    let reader = spawn(move || {
        let mut buf = [0; 8];

        b.read(&mut buf)
    });

    a.close().expect("Expected success");

    assert_eq!(
        reader
            .join()
            .expect("Expected success")
            .expect("Expected success"),
        0
    );
}

#[test]
fn test_duplex_backpressure() {
    crate::init();

    let (a, b) = DuplexPipeline::pair();
    let data = vec![7; DUPLEX_CAPACITY + 100];

    assert_eq!(a.write(&data).expect("Expected success"), DUPLEX_CAPACITY);

    let writer = spawn(move || a.write(&[1; 100]));
    let mut buf = [0; 200];

    assert_eq!(b.read(&mut buf).expect("Expected success"), 200);
    assert_eq!(
        writer
            .join()
            .expect("Expected success")
            .expect("Expected success"),
        100
    );
}
