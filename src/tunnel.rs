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

//! Establishing tunnels and communicating over them.
//!
//! A [Negotiator] dials the proxy, runs the
//! [NegotiateState](crate::state::NegotiateState) machine over the
//! connection, and hands back either a [Tunnel] or a [TunnelError]
//! that still owns the connection.
use std::fmt::Debug;
use std::fmt::Formatter;
use std::io::Error;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

use constellation_streams::state_machine::OnceMachineAction;
use constellation_streams::state_machine::RawStateMachine;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::error;

use crate::error::NegotiateError;
use crate::error::TunnelError;
use crate::params::NegotiateParams;
use crate::params::ProxyTarget;
use crate::proto::ConnectReply;
use crate::secctx::system_provider;
use crate::secctx::SecurityContextProvider;
use crate::spn::Resolver;
use crate::spn::ServicePrincipal;
use crate::spn::SystemResolver;
use crate::state::NegotiateResult;
use crate::state::NegotiateState;
use crate::trace::NegotiateStep;
use crate::trace::NoTrace;
use crate::trace::StepOutcome;
use crate::trace::TraceSink;

/// Establishes Negotiate-authenticated CONNECT tunnels.
///
/// A `Negotiator` holds no per-attempt state and can be reused for
/// any number of attempts.
#[derive(Clone)]
pub struct Negotiator {
    /// Source of Negotiate tokens.
    provider: Arc<dyn SecurityContextProvider>,
    /// DNS resolver for service principal names.
    resolver: Arc<dyn Resolver>,
    /// Diagnostic trace sink.
    trace: Arc<dyn TraceSink>
}

/// An established tunnel through the proxy.
///
/// Reads and writes pass straight through to the underlying stream.
pub struct Tunnel<Stream: Read + Write> {
    /// Connection to the proxy.
    stream: Stream,
    /// Result of the negotiation.
    result: NegotiateResult
}

impl Default for Negotiator {
    #[inline]
    fn default() -> Self {
        Negotiator::new(system_provider())
    }
}

impl Negotiator {
    /// Create a `Negotiator` getting tokens from `provider`.
    ///
    /// This uses the system resolver, and no tracing.
    #[inline]
    pub fn new(provider: Arc<dyn SecurityContextProvider>) -> Self {
        Negotiator {
            provider: provider,
            resolver: Arc::new(SystemResolver),
            trace: Arc::new(NoTrace)
        }
    }

    /// Use `resolver` for service principal name lookups.
    #[inline]
    pub fn with_resolver(
        mut self,
        resolver: Arc<dyn Resolver>
    ) -> Self {
        self.resolver = resolver;
        self
    }

    /// Send diagnostic trace records to `trace`.
    #[inline]
    pub fn with_trace(
        mut self,
        trace: Arc<dyn TraceSink>
    ) -> Self {
        self.trace = trace;
        self
    }

    /// Dial the proxy with `dial` and open a tunnel to `dest`.
    ///
    /// On failure, the connection is returned in the [TunnelError]
    /// unless dialing itself failed.  It is never closed here.
    pub fn connect<Stream, F>(
        &self,
        target: &ProxyTarget,
        dest: &str,
        dial: F
    ) -> Result<Tunnel<Stream>, TunnelError<Stream>>
    where
        Stream: Read + Write,
        F: FnOnce() -> Result<Stream, Error> {
        self.trace.record(NegotiateStep::Dial, StepOutcome::Enter);

        let mut stream = match dial() {
            Ok(stream) => {
                self.trace.record(NegotiateStep::Dial, StepOutcome::Success);

                stream
            }
            Err(err) => {
                #[cfg(feature = "log")]
                error!(target: "negotiate-protocol",
                       "could not connect to proxy {} ({})",
                       target, err);

                let err = NegotiateError::Dial { error: err };

                self.trace
                    .record(NegotiateStep::Dial, StepOutcome::Failure(&err));

                return Err(TunnelError::new(None, err));
            }
        };

        #[cfg(feature = "log")]
        debug!(target: "negotiate-protocol",
               "connected to proxy {}, negotiating tunnel to {}",
               target, dest);

        let params = NegotiateParams::new(
            target.clone(),
            dest.to_string(),
            self.provider.clone(),
            self.resolver.clone(),
            self.trace.clone()
        );
        let mut machine: RawStateMachine<NegotiateState> =
            RawStateMachine::new(params);

        loop {
            machine = match machine.end() {
                OnceMachineAction::Continue(machine) => machine,
                OnceMachineAction::Stop(Ok(result)) => {
                    return Ok(Tunnel {
                        stream: stream,
                        result: result
                    })
                }
                OnceMachineAction::Stop(Err(err)) => {
                    return Err(TunnelError::new(Some(stream), err))
                }
            };

            machine.step(&mut stream);
        }
    }

    /// Open a tunnel to `dest` over a TCP connection to the proxy.
    #[inline]
    pub fn connect_tcp(
        &self,
        target: &ProxyTarget,
        dest: &str
    ) -> Result<Tunnel<TcpStream>, TunnelError<TcpStream>> {
        self.connect(target, dest, || TcpStream::connect(target.endpoint()))
    }
}

impl<Stream> Tunnel<Stream>
where
    Stream: Read + Write
{
    /// Get the service principal the proxy authenticated.
    #[inline]
    pub fn spn(&self) -> &ServicePrincipal {
        self.result.spn()
    }

    /// Get the proxy's reply to the CONNECT request.
    #[inline]
    pub fn reply(&self) -> &ConnectReply {
        self.result.reply()
    }

    /// Get a reference to the underlying stream.
    #[inline]
    pub fn get_ref(&self) -> &Stream {
        &self.stream
    }

    /// Get the underlying stream, discarding the negotiation result.
    #[inline]
    pub fn into_inner(self) -> Stream {
        self.stream
    }
}

impl<Stream> Read for Tunnel<Stream>
where
    Stream: Read + Write
{
    #[inline]
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.stream.read(buf)
    }
}

impl<Stream> Write for Tunnel<Stream>
where
    Stream: Read + Write
{
    #[inline]
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.stream.write(buf)
    }

    #[inline]
    fn write_all(
        &mut self,
        buf: &[u8]
    ) -> Result<(), Error> {
        self.stream.write_all(buf)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush()
    }
}

impl Debug for Negotiator {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "Negotiator")
    }
}

impl<Stream> Debug for Tunnel<Stream>
where
    Stream: Read + Write + Debug
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Tunnel {{ stream: {:?}, spn: {} }}",
            self.stream,
            self.result.spn()
        )
    }
}

#[cfg(test)]
use std::io::ErrorKind;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::secctx::StubProvider;
#[cfg(test)]
use crate::spn::FixedResolver;
#[cfg(test)]
use crate::state::DoubleDeque;
#[cfg(test)]
use crate::trace::RecordingTrace;

#[test]
fn test_tunnel_established() {
    init();

    let provider = Arc::new(StubProvider::new(&[0xde, 0xad, 0xbe, 0xef]));
    let negotiator = Negotiator::new(provider.clone())
        .with_resolver(Arc::new(FixedResolver::default()));
    let target = ProxyTarget::new(String::from("proxy.corp.example"), 8080);
    let link =
        DoubleDeque::new(b"HTTP/1.1 200 Connection established\r\n\r\nhello");
    let mut tunnel = negotiator
        .connect(&target, "dest.example:443", || Ok(link))
        .expect("Expected success");
    let mut buf = [0; 5];

    tunnel.read_exact(&mut buf).expect("Expected success");
    tunnel.write_all(b"ping").expect("Expected success");

    assert_eq!(&buf, b"hello");
    assert_eq!(tunnel.spn().to_string(), "HTTP/proxy.corp.example");
    assert_eq!(tunnel.reply().status(), 200);
    assert_eq!(provider.released(), 1);

    let mut link = tunnel.into_inner();
    let sent = link.sent();

    assert!(sent.starts_with("CONNECT dest.example:443 HTTP/1.1\r\n"));
    assert!(sent.contains("Proxy-Authorization: Negotiate 3q2+7w==\r\n"));
    assert!(sent.ends_with("\r\n\r\nping"));
}

#[test]
fn test_tunnel_rejected_returns_stream() {
    init();

    let provider = Arc::new(StubProvider::new(&[0xde, 0xad, 0xbe, 0xef]));
    let negotiator = Negotiator::new(provider.clone())
        .with_resolver(Arc::new(FixedResolver::default()));
    let target = ProxyTarget::new(String::from("proxy.corp.example"), 8080);
    let link = DoubleDeque::new(
        b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"
    );

    match negotiator.connect(&target, "dest.example:443", || Ok(link)) {
        Err(err) => {
            assert!(err.stream().is_some());
            assert_eq!(err.to_string(), "Proxy Authentication Required");

            let (stream, err) = err.take();

            assert!(stream.is_some());
            assert!(err.is_rejection());
        }
        Ok(_) => panic!("Expected rejection")
    }

    assert_eq!(provider.acquired(), 1);
    assert_eq!(provider.released(), 1);
}

#[test]
fn test_tunnel_dial_fail() {
    init();

    let provider = Arc::new(StubProvider::new(&[0x01]));
    let trace = Arc::new(RecordingTrace::default());
    let negotiator = Negotiator::new(provider.clone())
        .with_resolver(Arc::new(FixedResolver::default()))
        .with_trace(trace.clone());
    let target = ProxyTarget::new(String::from("proxy.corp.example"), 8080);
    let res = negotiator.connect::<DoubleDeque, _>(
        &target,
        "dest.example:443",
        || Err(Error::new(ErrorKind::ConnectionRefused, "connection refused"))
    );

    match res {
        Err(err) => {
            assert!(err.stream().is_none());
            assert_eq!(err.to_string(), "connection refused");
        }
        Ok(_) => panic!("Expected dial error")
    }

    assert_eq!(provider.acquired(), 0);
    assert_eq!(
        trace.records(),
        vec![
            (NegotiateStep::Dial, String::from("enter")),
            (NegotiateStep::Dial, String::from("fail"))
        ]
    );
}

#[test]
fn test_negotiator_shared_between_threads() {
    init();

    fn assert_send_sync<T: Send + Sync>() {}

    assert_send_sync::<Negotiator>();

    let provider = Arc::new(StubProvider::new(&[0x01]));
    let negotiator = Negotiator::new(provider.clone())
        .with_resolver(Arc::new(FixedResolver::default()));
    let target = ProxyTarget::new(String::from("proxy.corp.example"), 8080);

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                let link = DoubleDeque::new(b"HTTP/1.1 200 OK\r\n\r\n");

                negotiator
                    .connect(&target, "dest.example:443", || Ok(link))
                    .map(|_| ())
                    .expect("Expected success")
            });
        }
    });

    assert_eq!(provider.acquired(), 2);
    assert_eq!(provider.released(), 2);
}
