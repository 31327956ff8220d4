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


//! SOCKS5 handshakes for both roles.
//!
//! # Responder
//!
//! [handshake_reply] runs the server side of a CONNECT exchange:
//!
//! 1. Read the method request.  A version other than 5 fails before
//!    anything else is read.
//! 2. Select method `0x00`, regardless of what was offered, and run
//!    its responder function.
//! 3. Read the request.  Only CONNECT is supported; BIND and UDP
//!    ASSOCIATE are refused, and no destination is attempted.
//! 4. Establish the destination using a caller-supplied function.
//! 5. Reply with the bound address of the established connection.
//!
//! Refusals after method negotiation are reported to the client with
//! a failure reply before the error is returned.
//!
//! # Initiator
//!
//! [handshake] offers every registered method and runs the one the
//! server selects; [connect] then requests a connection to a target
//! and validates the reply.
use std::net::Ipv4Addr;
use std::net::SocketAddr;

use log::debug;
use log::trace;
use log::warn;

use crate::addrs::Address;
use crate::addrs::Endpoint;
use crate::pipeline::Pipeline;
use crate::socks5::auth::AuthMethods;
use crate::socks5::error::SOCKS5Error;
use crate::socks5::proto::read_endpoint;
use crate::socks5::proto::read_method_reply;
use crate::socks5::proto::read_method_request;
use crate::socks5::proto::read_reply;
use crate::socks5::proto::read_request_header;
use crate::socks5::proto::write_method_reply;
use crate::socks5::proto::write_method_request;
use crate::socks5::proto::write_reply;
use crate::socks5::proto::write_request;
use crate::socks5::proto::Reply;
use crate::socks5::proto::ATYP_DOMAIN;
use crate::socks5::proto::ATYP_IPV4;
use crate::socks5::proto::ATYP_IPV6;
use crate::socks5::proto::CMD_CONNECT;
use crate::socks5::proto::METHOD_NO_ACCEPTABLE;
use crate::socks5::proto::METHOD_NO_AUTH;

#[inline]
fn unspecified() -> Endpoint {
    Endpoint::new(Address::IPv4(Ipv4Addr::UNSPECIFIED), 0)
}

// Best-effort; the original error takes precedence.
fn refuse(
    input: &dyn Pipeline,
    reply: Reply
) {
    debug!(target: "socks5-responder",
           "refusing request: {}",
           reply);

    if let Err(err) = write_reply(input, reply, &unspecified()) {
        debug!(target: "socks5-responder",
               "error sending failure reply: {}",
               err);
    }
}

/// Run the responder side of a SOCKS5 CONNECT exchange on `input`.
///
/// Once the request has been decoded, `establish` is called with the
/// requested destination.  It returns the established connection and
/// its bound address, which is reported to the client (or `0.0.0.0:0`
/// if there is none).  The established connection is returned.
pub fn handshake_reply<F, T>(
    input: &dyn Pipeline,
    auth: &AuthMethods,
    establish: F
) -> Result<(Endpoint, T), SOCKS5Error>
where
    F: FnOnce(&Endpoint) -> Result<(T, Option<SocketAddr>), SOCKS5Error> {
    let methods = read_method_request(input)?;

    trace!(target: "socks5-responder",
           "client offered methods {:02x?}",
           methods);

    if !methods.contains(&METHOD_NO_AUTH) {
        warn!(target: "socks5-responder",
              "client did not offer no-auth, selecting it anyway");
    }

    write_method_reply(input, METHOD_NO_AUTH)?;
    auth.get(METHOD_NO_AUTH)?.respond(input)?;

    let (command, atyp) = read_request_header(input)?;

    if command != CMD_CONNECT {
        refuse(input, Reply::CmdNotSupported);

        return Err(SOCKS5Error::UnsupportedCommand { command: command });
    }

    if atyp != ATYP_IPV4 && atyp != ATYP_IPV6 && atyp != ATYP_DOMAIN {
        refuse(input, Reply::AddrTypeNotSupported);

        return Err(SOCKS5Error::UnknownAddressType { atyp: atyp });
    }

    let target = match read_endpoint(input, atyp) {
        Ok(target) => target,
        Err(err) => {
            refuse(input, err.reply());

            return Err(err);
        }
    };

    debug!(target: "socks5-responder",
           "CONNECT request for {}",
           target);

    let (conn, bound) = match establish(&target) {
        Ok(out) => out,
        Err(err) => {
            refuse(input, err.reply());

            return Err(err);
        }
    };
    let bound = match bound {
        Some(addr) => Endpoint::from(addr),
        None => unspecified()
    };

    write_reply(input, Reply::Succeeded, &bound)?;

    debug!(target: "socks5-responder",
           "connected to {} (bound {})",
           target, bound);

    Ok((target, conn))
}

/// Run the initiator's method negotiation on `stream`.
///
/// Every method registered in `auth` is offered, and the function for
/// the method the server selects is run.  Returns the selected
/// method.
pub fn handshake(
    stream: &dyn Pipeline,
    auth: &AuthMethods
) -> Result<u8, SOCKS5Error> {
    let codes = auth.codes()?;

    trace!(target: "socks5-initiator",
           "offering methods {:02x?}",
           codes);

    write_method_request(stream, &codes)?;

    let method = read_method_reply(stream)?;

    if method == METHOD_NO_ACCEPTABLE {
        return Err(SOCKS5Error::NoAcceptableMethods);
    }

    let selected = auth
        .get(method)
        .map_err(|_| SOCKS5Error::UnsupportedAuthMethod { method: method })?;

    debug!(target: "socks5-initiator",
           "server selected method {:#04x}",
           method);

    selected.initiate(stream)?;

    Ok(method)
}

/// Request a connection to `target` on a negotiated `stream`.
///
/// Returns the bound address reported by the server.
pub fn connect(
    stream: &dyn Pipeline,
    target: &Endpoint
) -> Result<Endpoint, SOCKS5Error> {
    write_request(stream, CMD_CONNECT, target)?;

    let bound = read_reply(stream)?;

    debug!(target: "socks5-initiator",
           "connected to {} (bound {})",
           target, bound);

    Ok(bound)
}

#[cfg(test)]
use std::sync::atomic::AtomicBool;
#[cfg(test)]
use std::sync::atomic::Ordering;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::pipeline::duplex::DuplexPipeline;
#[cfg(test)]
use crate::socks5::auth::AuthMethod;
#[cfg(test)]
use crate::socks5::proto::CMD_BIND;
#[cfg(test)]
use crate::socks5::proto::CMD_UDP_ASSOCIATE;

#[cfg(test)]
fn round_trip(target: Endpoint) {
    crate::init();

    let (client, server) = DuplexPipeline::pair();
    let bound: SocketAddr = "10.0.0.1:4242".parse().expect("Expected success");
    let responder = spawn(move || {
        let auth = AuthMethods::new();

        handshake_reply(&server, &auth, |target| {
            Ok((target.clone(), Some(bound)))
        })
    });
    let auth = AuthMethods::new();
    let method = handshake(&client, &auth).expect("Expected success");
    let got_bound = connect(&client, &target).expect("Expected success");
    let (requested, established) = responder
        .join()
        .expect("Expected success")
        .expect("Expected success");

    assert_eq!(method, METHOD_NO_AUTH);
    assert_eq!(requested, target);
    assert_eq!(established, target);
    assert_eq!(got_bound, Endpoint::from(bound));
}

#[test]
fn test_round_trip_ipv4() {
    round_trip(Endpoint::parse("1.2.3.4", 0x1337))
}

#[test]
fn test_round_trip_ipv6() {
    round_trip(Endpoint::parse("2001:db8::7", 443))
}

#[test]
fn test_round_trip_domain() {
    round_trip(Endpoint::parse("en.wikipedia.org", 443))
}

#[test]
fn test_round_trip_domain_max_len() {
    round_trip(Endpoint::parse(&"d".repeat(255), 80))
}

#[test]
fn test_responder_bytes() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    client
        .write(&[0x05, 0x01, 0x00])
        .expect("Expected success");
    client
        .write(&[0x05, 0x01, 0x00, 0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x13, 0x37])
        .expect("Expected success");

    let (target, ()) = handshake_reply(&server, &AuthMethods::new(), |_| {
        Ok(((), None))
    })
    .expect("Expected success");

    assert_eq!(target, Endpoint::parse("ABCD", 0x1337));

    let mut buf = [0; 12];
    let mut nread = 0;

    while nread < buf.len() {
        nread += client.read(&mut buf[nread..]).expect("Expected success");
    }

    assert_eq!(
        buf,
        [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn test_bad_version_rejected_early() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    client
        .write(&[0x04, 0x01, 0x00, 0x99])
        .expect("Expected success");

    let called = AtomicBool::new(false);

    match handshake_reply(&server, &AuthMethods::new(), |_| {
        called.store(true, Ordering::SeqCst);

        Ok(((), None))
    }) {
        Err(SOCKS5Error::UnsupportedProtocol { version }) => {
            assert_eq!(version, 4)
        }
        res => panic!("Expected UnsupportedProtocol, got {:?}", res)
    }

    assert!(!called.load(Ordering::SeqCst));

    // Only the version byte was consumed.
    let mut buf = [0; 3];
    let mut nread = 0;

    while nread < buf.len() {
        nread += server.read(&mut buf[nread..]).expect("Expected success");
    }

    assert_eq!(buf, [0x01, 0x00, 0x99]);
}

#[cfg(test)]
fn check_unsupported_command(command: u8) {
    crate::init();

    let (client, server) = DuplexPipeline::pair();
    let called = AtomicBool::new(false);

    client
        .write(&[0x05, 0x01, 0x00])
        .expect("Expected success");
    client
        .write(&[0x05, command, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37])
        .expect("Expected success");

    match handshake_reply(&server, &AuthMethods::new(), |_| {
        called.store(true, Ordering::SeqCst);

        Ok(((), None))
    }) {
        Err(SOCKS5Error::UnsupportedCommand { command: got }) => {
            assert_eq!(got, command)
        }
        res => panic!("Expected UnsupportedCommand, got {:?}", res)
    }

    assert!(!called.load(Ordering::SeqCst));

    let mut buf = [0; 12];
    let mut nread = 0;

    while nread < buf.len() {
        nread += client.read(&mut buf[nread..]).expect("Expected success");
    }

    assert_eq!(&buf[..2], &[0x05, 0x00]);
    assert_eq!(&buf[2..6], &[0x05, 0x07, 0x00, 0x01]);
}

#[test]
fn test_bind_rejected() {
    check_unsupported_command(CMD_BIND)
}

#[test]
fn test_udp_associate_rejected() {
    check_unsupported_command(CMD_UDP_ASSOCIATE)
}

#[test]
fn test_unknown_address_type() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    client
        .write(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x02])
        .expect("Expected success");

    match handshake_reply(&server, &AuthMethods::new(), |_| Ok(((), None))) {
        Err(SOCKS5Error::UnknownAddressType { atyp }) => assert_eq!(atyp, 2),
        res => panic!("Expected UnknownAddressType, got {:?}", res)
    }
}

#[test]
fn test_establish_failure_reply() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    client
        .write(&[0x05, 0x01, 0x00])
        .expect("Expected success");
    client
        .write(&[0x05, 0x01, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37])
        .expect("Expected success");

    let res: Result<(Endpoint, ()), SOCKS5Error> =
        handshake_reply(&server, &AuthMethods::new(), |_| {
            Err(SOCKS5Error::ConnectFailed {
                reply: Reply::HostUnreachable
            })
        });

    assert!(matches!(res, Err(SOCKS5Error::ConnectFailed { .. })));

    let mut buf = [0; 12];
    let mut nread = 0;

    while nread < buf.len() {
        nread += client.read(&mut buf[nread..]).expect("Expected success");
    }

    assert_eq!(&buf[2..4], &[0x05, 0x04]);
}

#[test]
fn test_initiator_no_acceptable_methods() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    server.write(&[0x05, 0xff]).expect("Expected success");

    match handshake(&client, &AuthMethods::new()) {
        Err(SOCKS5Error::NoAcceptableMethods) => {}
        res => panic!("Expected NoAcceptableMethods, got {:?}", res)
    }

    let mut buf = [0; 3];

    assert_eq!(server.read(&mut buf).expect("Expected success"), 3);
    assert_eq!(buf, [0x05, 0x01, 0x00]);
}

#[test]
fn test_initiator_unregistered_method() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    server.write(&[0x05, 0x02]).expect("Expected success");

    match handshake(&client, &AuthMethods::new()) {
        Err(SOCKS5Error::UnsupportedAuthMethod { method }) => {
            assert_eq!(method, 2)
        }
        res => panic!("Expected UnsupportedAuthMethod, got {:?}", res)
    }
}

#[cfg(test)]
fn failing_exchange(_stream: &dyn Pipeline) -> Result<(), SOCKS5Error> {
    Err(SOCKS5Error::AuthNFailed { method: 0x02 })
}

#[test]
fn test_initiator_offers_registered_methods() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();
    let auth = AuthMethods::new();

    auth.register(
        0x02,
        AuthMethod::new(Arc::new(failing_exchange), Arc::new(failing_exchange))
    )
    .expect("Expected success");
    server.write(&[0x05, 0x02]).expect("Expected success");

    assert!(matches!(
        handshake(&client, &auth),
        Err(SOCKS5Error::AuthNFailed { method: 0x02 })
    ));

    let mut buf = [0; 4];

    assert_eq!(server.read(&mut buf).expect("Expected success"), 4);
    assert_eq!(buf, [0x05, 0x02, 0x00, 0x02]);
}

#[test]
fn test_initiator_connect_refused() {
    crate::init();

    let (client, server) = DuplexPipeline::pair();

    server
        .write(&[0x05, 0x05, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37])
        .expect("Expected success");

    match connect(&client, &Endpoint::parse("ABCD", 0x1337)) {
        Err(SOCKS5Error::ConnectFailed { reply }) => {
            assert_eq!(reply, Reply::ConnectionRefused)
        }
        res => panic!("Expected ConnectFailed, got {:?}", res)
    }

    let mut buf = [0; 11];

    assert_eq!(server.read(&mut buf).expect("Expected success"), 11);
    assert_eq!(
        buf,
        [0x05, 0x01, 0x00, 0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x13, 0x37]
    );
}
