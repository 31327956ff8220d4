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


//! Pipelines over Unix domain stream sockets.
//!
//! Unix sockets are referenced by a filesystem path, and are strictly
//! local to a machine.  They can be used wherever a TCP connection to
//! `localhost` would be, both for listeners and for dialing.
use std::fmt::Debug;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::trace;

use crate::pipeline::Pipeline;

/// A [Pipeline] over a [UnixStream].
pub struct UnixPipeline {
    stream: UnixStream,
    closed: AtomicBool
}

impl UnixPipeline {
    /// Set (or clear) the read and write timeouts on the socket.
    pub fn set_timeout(
        &self,
        timeout: Option<Duration>
    ) -> Result<(), Error> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }
}

impl From<UnixStream> for UnixPipeline {
    #[inline]
    fn from(stream: UnixStream) -> UnixPipeline {
        UnixPipeline {
            stream: stream,
            closed: AtomicBool::new(false)
        }
    }
}

impl Pipeline for UnixPipeline {
    #[inline]
    fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        (&self.stream).read(buf)
    }

    #[inline]
    fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        (&self.stream).write(buf)
    }

    fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        trace!(target: "unix-pipeline",
               "shutting down unix stream");

        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            res => res
        }
    }
}

impl Debug for UnixPipeline {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("UnixPipeline")
            .field("local", &self.stream.local_addr().ok())
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

#[test]
fn test_unix_pipeline_pair() {
    crate::init();

    let (a, b) = UnixStream::pair().expect("Expected success");
    let a = UnixPipeline::from(a);
    let b = UnixPipeline::from(b);
    let mut buf = [0; 4];

    a.write(b"unix").expect("Expected success");
    assert_eq!(b.read(&mut buf).expect("Expected success"), 4);
    assert_eq!(&buf, b"unix");

    a.close().expect("Expected success");
    a.close().expect("Expected success");
    assert_eq!(b.read(&mut buf).expect("Expected success"), 0);
}
