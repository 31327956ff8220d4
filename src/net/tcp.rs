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


//! Pipelines over TCP sockets.
use std::fmt::Debug;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::trace;

use crate::pipeline::Pipeline;

/// A [Pipeline] over a [TcpStream].
///
/// Closing shuts down both directions of the socket; the descriptor
/// itself is released when the `TCPPipeline` is dropped.
pub struct TCPPipeline {
    stream: TcpStream,
    closed: AtomicBool
}

impl TCPPipeline {
    /// Set (or clear) the read and write timeouts on the socket.
    pub fn set_timeout(
        &self,
        timeout: Option<Duration>
    ) -> Result<(), Error> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    /// Get the underlying stream.
    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl From<TcpStream> for TCPPipeline {
    #[inline]
    fn from(stream: TcpStream) -> TCPPipeline {
        TCPPipeline {
            stream: stream,
            closed: AtomicBool::new(false)
        }
    }
}

impl Pipeline for TCPPipeline {
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

        trace!(target: "tcp-pipeline",
               "shutting down TCP stream to {:?}",
               self.stream.peer_addr().ok());

        match self.stream.shutdown(Shutdown::Both) {
            // The peer may already have torn down the connection.
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            res => res
        }
    }

    #[inline]
    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

impl Debug for TCPPipeline {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("TCPPipeline")
            .field("local", &self.stream.local_addr().ok())
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

#[cfg(test)]
use std::net::TcpListener;
#[cfg(test)]
use std::thread::spawn;

#[test]
fn test_tcp_pipeline_send_recv_close() {
    crate::init();

    const FIRST_BYTES: [u8; 8] =
        [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
    const SECOND_BYTES: [u8; 8] =
        [0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f];
    let listener =
        TcpListener::bind("127.0.0.1:0").expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");
    let listen = spawn(move || {
        let (stream, _) = listener.accept().expect("Expected success");
        let pipeline = TCPPipeline::from(stream);
        let mut buf = [0; FIRST_BYTES.len()];
        let mut nread = 0;

        while nread < buf.len() {
            nread += pipeline.read(&mut buf[nread..]).expect("Expected success");
        }

        pipeline.write(&SECOND_BYTES).expect("Expected success");
        pipeline.close().expect("Expected success");

        assert_eq!(FIRST_BYTES, buf);
    });

    let pipeline = TCPPipeline::from(
        TcpStream::connect(addr).expect("Expected success")
    );

    assert_eq!(pipeline.peer_addr(), Some(addr));

    pipeline.write(&FIRST_BYTES).expect("Expected success");

    let mut buf = [0; SECOND_BYTES.len()];
    let mut nread = 0;

    while nread < buf.len() {
        nread += pipeline.read(&mut buf[nread..]).expect("Expected success");
    }

    assert_eq!(SECOND_BYTES, buf);
    assert_eq!(pipeline.read(&mut buf).expect("Expected success"), 0);

    listen.join().expect("Expected success");

    pipeline.close().expect("Expected success");
    pipeline.close().expect("Expected success");
}
