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

//! Negotiate tunnel state machine implementation.
//!
//! This module contains the state machine that takes a connection to
//! the proxy from freshly dialed to an established tunnel, using the
//! [RawMachineState](constellation_streams::state_machine::RawStateMachine)
//! framework.  Running it to completion yields a [NegotiateResult],
//! which [Tunnel](crate::tunnel::Tunnel) combines with the stream.
//!
//! Steps that do no I/O (service principal resolution and context
//! negotiation) are carried out in `read_select` without touching the
//! stream.
use std::io::Read;
use std::io::Write;

use constellation_streams::state_machine::OnceMachineAction;
use constellation_streams::state_machine::RawMachineState;
use constellation_streams::state_machine::RawOnceMachineState;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::warn;

use crate::error::NegotiateError;
use crate::params::NegotiateParams;
use crate::proto;
use crate::proto::ConnectReply;
use crate::secctx::OutboundToken;
use crate::spn;
use crate::spn::ServicePrincipal;
use crate::trace::NegotiateStep;
use crate::trace::StepOutcome;
use crate::trace::TraceSink;

/// Negotiate tunnel state machine states.
///
/// This also functions as the primary state machine object.  Use
/// [start](RawMachineState::start) to create an instance.
pub enum NegotiateState {
    /// Build the service principal name for the proxy.
    Resolve,
    /// Obtain a token from the security context provider.
    Context {
        /// Principal for the proxy.
        spn: ServicePrincipal
    },
    /// Send the CONNECT request, read and check the reply.
    Connect {
        /// Principal for the proxy.
        spn: ServicePrincipal,
        /// Token to send, holding the security context.
        token: OutboundToken
    },
    /// Success end-state.
    Success {
        /// Protocol result.
        result: NegotiateResult
    },
    /// Error end-state.
    Error {
        /// The protocol error.
        error: NegotiateError
    }
}

/// Result of a successful negotiation.
#[derive(Clone, Debug)]
pub struct NegotiateResult {
    /// Principal the token was issued for.
    spn: ServicePrincipal,
    /// The proxy's reply.
    reply: ConnectReply
}

impl NegotiateResult {
    /// Get the service principal the token was issued for.
    #[inline]
    pub fn spn(&self) -> &ServicePrincipal {
        &self.spn
    }

    /// Get the proxy's reply.
    #[inline]
    pub fn reply(&self) -> &ConnectReply {
        &self.reply
    }
}

/// Report the outcome of `step` to `trace`, passing `res` through.
fn traced<T>(
    trace: &dyn TraceSink,
    step: NegotiateStep,
    res: Result<T, NegotiateError>
) -> Result<T, NegotiateError> {
    match &res {
        Ok(_) => trace.record(step, StepOutcome::Success),
        Err(err) => trace.record(step, StepOutcome::Failure(err))
    }

    res
}

impl RawMachineState for NegotiateState {
    type Error = NegotiateError;
    type Params = NegotiateParams;
    type Value = NegotiateResult;

    #[inline]
    fn start(_params: &NegotiateParams) -> NegotiateState {
        NegotiateState::Resolve
    }

    #[inline]
    fn error(
        _params: &NegotiateParams,
        error: NegotiateError
    ) -> NegotiateState {
        NegotiateState::Error { error: error }
    }

    fn write<W>(
        &mut self,
        params: &NegotiateParams,
        stream: &mut W
    ) -> Result<(), NegotiateError>
    where
        W: Write {
        match self {
            // Send the CONNECT request.
            NegotiateState::Connect { token, .. } => {
                #[cfg(feature = "log")]
                debug!(target: "negotiate-protocol",
                       "sending CONNECT to {} for {}",
                       params.target(), params.dest());

                params.trace().record(NegotiateStep::Inject, StepOutcome::Enter);

                traced(
                    params.trace(),
                    NegotiateStep::Inject,
                    proto::write_connect(
                        stream,
                        params.dest(),
                        params.target().headers(),
                        token.token()
                    )
                )
            }
            _ => Ok(())
        }
    }

    fn read_select<R>(
        self,
        params: &NegotiateParams,
        stream: &mut R
    ) -> Result<Self, NegotiateError>
    where
        R: Read {
        match self {
            // Canonicalize the proxy name.
            NegotiateState::Resolve => {
                let target = params.target();

                params.trace().record(NegotiateStep::Resolve, StepOutcome::Enter);

                let spn = traced(
                    params.trace(),
                    NegotiateStep::Resolve,
                    spn::proxy_principal(
                        params.resolver(),
                        target.host(),
                        target.canonicalize()
                    )
                )?;

                #[cfg(feature = "log")]
                debug!(target: "negotiate-protocol",
                       "using service principal {} for {}",
                       spn, target.host());

                Ok(NegotiateState::Context { spn: spn })
            }
            // Get a token for the principal.
            NegotiateState::Context { spn } => {
                params.trace().record(NegotiateStep::Context, StepOutcome::Enter);

                let token = traced(
                    params.trace(),
                    NegotiateStep::Context,
                    params.provider().negotiate(params.target(), &spn)
                )?;

                #[cfg(feature = "log")]
                debug!(target: "negotiate-protocol",
                       "obtained {} byte token for {}",
                       token.token().len(), spn);

                Ok(NegotiateState::Connect {
                    spn: spn,
                    token: token
                })
            }
            // Read and check the reply.
            NegotiateState::Connect { spn, token } => {
                params
                    .trace()
                    .record(NegotiateStep::Validate, StepOutcome::Enter);

                let res = proto::parse_connect_reply(stream);

                // The token is spent either way.
                token.release();

                match traced(params.trace(), NegotiateStep::Validate, res) {
                    Ok(reply) => {
                        #[cfg(feature = "log")]
                        debug!(target: "negotiate-protocol",
                               "proxy {} accepted CONNECT to {}",
                               params.target(), params.dest());

                        Ok(NegotiateState::Success {
                            result: NegotiateResult {
                                spn: spn,
                                reply: reply
                            }
                        })
                    }
                    Err(err) => {
                        #[cfg(feature = "log")]
                        warn!(target: "negotiate-protocol",
                              "CONNECT to {} failed ({})",
                              params.dest(), err);

                        Err(err)
                    }
                }
            }
            // End states.
            end => Ok(end)
        }
    }
}

impl RawOnceMachineState for NegotiateState {
    #[inline]
    fn end(
        self,
        params: &NegotiateParams
    ) -> OnceMachineAction<Self, Result<NegotiateResult, NegotiateError>> {
        match self {
            NegotiateState::Success { result } => {
                #[cfg(feature = "log")]
                debug!(target: "negotiate-protocol",
                       "negotiation has reached an end state");

                params
                    .trace()
                    .record(NegotiateStep::Established, StepOutcome::Enter);
                params
                    .trace()
                    .record(NegotiateStep::Established, StepOutcome::Success);

                OnceMachineAction::Stop(Ok(result))
            }
            NegotiateState::Error { error } => {
                #[cfg(feature = "log")]
                debug!(target: "negotiate-protocol",
                       "terminating negotiation with error ({})",
                       error);

                OnceMachineAction::Stop(Err(error))
            }
            out => OnceMachineAction::Continue(out)
        }
    }
}

#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::io::Error;
#[cfg(test)]
use std::io::ErrorKind;
#[cfg(test)]
use std::net::IpAddr;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use constellation_streams::state_machine::RawStateMachine;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::params::Headers;
#[cfg(test)]
use crate::params::ProxyTarget;
#[cfg(test)]
use crate::secctx::StubProvider;
#[cfg(test)]
use crate::spn::FailingResolver;
#[cfg(test)]
use crate::spn::FixedResolver;
#[cfg(test)]
use crate::trace::RecordingTrace;

#[cfg(test)]
pub(crate) struct DoubleDeque {
    pub(crate) uplink: VecDeque<u8>,
    pub(crate) downlink: VecDeque<u8>
}

#[cfg(test)]
impl DoubleDeque {
    pub(crate) fn new(reply: &[u8]) -> DoubleDeque {
        DoubleDeque {
            uplink: VecDeque::with_capacity(256),
            downlink: VecDeque::from(reply.to_vec())
        }
    }

    pub(crate) fn sent(&mut self) -> String {
        let msg: Vec<u8> = self.uplink.drain(..).collect();

        String::from_utf8(msg).expect("Expected UTF-8")
    }
}

#[cfg(test)]
impl Read for DoubleDeque {
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.downlink.read(buf)
    }
}

#[cfg(test)]
impl Write for DoubleDeque {
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.uplink.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        self.uplink.flush()
    }
}

/// Link that accepts no writes.
#[cfg(test)]
struct BrokenUplink {
    downlink: VecDeque<u8>
}

#[cfg(test)]
impl Read for BrokenUplink {
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.downlink.read(buf)
    }
}

#[cfg(test)]
impl Write for BrokenUplink {
    fn write(
        &mut self,
        _buf: &[u8]
    ) -> Result<usize, Error> {
        Err(Error::new(ErrorKind::BrokenPipe, "broken pipe"))
    }

    #[inline]
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
fn proxy_resolver() -> FixedResolver {
    let addr = IpAddr::from([10, 0, 0, 1]);
    let mut resolver = FixedResolver::default();

    resolver.hosts.insert(String::from("proxy"), vec![addr]);
    resolver
        .addrs
        .insert(addr, vec![String::from("proxy01.corp.example.")]);

    resolver
}

#[cfg(test)]
fn run_machine(
    params: NegotiateParams,
    link: &mut DoubleDeque
) -> Result<NegotiateResult, NegotiateError> {
    let mut machine: RawStateMachine<NegotiateState> =
        RawStateMachine::new(params);

    loop {
        machine = match machine.end() {
            OnceMachineAction::Continue(machine) => machine,
            OnceMachineAction::Stop(res) => return res
        };

        machine.step(&mut *link);
    }
}

#[test]
fn test_connect_write_fail() {
    init();

    let mut link = BrokenUplink {
        downlink: VecDeque::from(b"HTTP/1.1 200 OK\r\n\r\n".to_vec())
    };
    let provider = Arc::new(StubProvider::new(&[0x01]));
    let trace = Arc::new(RecordingTrace::default());
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        provider.clone(),
        Arc::new(proxy_resolver()),
        trace.clone()
    );
    let mut machine: RawStateMachine<NegotiateState> =
        RawStateMachine::new(params);
    let res = loop {
        machine = match machine.end() {
            OnceMachineAction::Continue(machine) => machine,
            OnceMachineAction::Stop(res) => break res
        };

        machine.step(&mut link);
    };

    match res {
        Err(NegotiateError::Write { error }) => {
            assert_eq!(error.kind(), ErrorKind::BrokenPipe)
        }
        res => panic!("Expected write error, got {:?}", res)
    }

    assert_eq!(provider.acquired(), 1);
    assert_eq!(provider.released(), 1);
    assert_eq!(
        trace.records().last(),
        Some(&(NegotiateStep::Inject, String::from("fail")))
    );
    assert!(!trace
        .records()
        .contains(&(NegotiateStep::Validate, String::from("enter"))));
}

#[test]
fn test_connect_succeed() {
    init();

    let mut link =
        DoubleDeque::new(b"HTTP/1.1 200 Connection established\r\n\r\n");
    let provider = Arc::new(StubProvider::new(&[0xde, 0xad, 0xbe, 0xef]));
    let trace = Arc::new(RecordingTrace::default());
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        provider.clone(),
        Arc::new(proxy_resolver()),
        trace.clone()
    );
    let res = run_machine(params, &mut link).expect("Expected success");
    let expected = concat!(
        "CONNECT dest.example:443 HTTP/1.1\r\n",
        "Host: dest.example:443\r\n",
        "Proxy-Authorization: Negotiate 3q2+7w==\r\n",
        "Proxy-Connection: Keep-Alive\r\n",
        "\r\n"
    );

    assert_eq!(link.sent(), expected);
    assert_eq!(res.spn().to_string(), "HTTP/proxy01.corp.example");
    assert_eq!(res.reply().status(), 200);
    assert_eq!(provider.acquired(), 1);
    assert_eq!(provider.released(), 1);
    assert_eq!(
        trace.records(),
        vec![
            (NegotiateStep::Resolve, String::from("enter")),
            (NegotiateStep::Resolve, String::from("ok")),
            (NegotiateStep::Context, String::from("enter")),
            (NegotiateStep::Context, String::from("ok")),
            (NegotiateStep::Inject, String::from("enter")),
            (NegotiateStep::Inject, String::from("ok")),
            (NegotiateStep::Validate, String::from("enter")),
            (NegotiateStep::Validate, String::from("ok")),
            (NegotiateStep::Established, String::from("enter")),
            (NegotiateStep::Established, String::from("ok"))
        ]
    );
}

#[test]
fn test_connect_proxy_auth_required() {
    init();

    let mut link = DoubleDeque::new(concat!(
        "HTTP/1.1 407 Go Away\r\n",
        "Proxy-Authenticate: Negotiate\r\n",
        "Content-Length: 0\r\n",
        "\r\n"
    ).as_bytes());
    let provider = Arc::new(StubProvider::new(&[0x01, 0x02]));
    let trace = Arc::new(RecordingTrace::default());
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        provider.clone(),
        Arc::new(proxy_resolver()),
        trace.clone()
    );

    match run_machine(params, &mut link) {
        Err(err) => {
            assert_eq!(err.status(), Some(407));
            assert_eq!(err.to_string(), "Proxy Authentication Required");
        }
        res => panic!("Expected rejection, got {:?}", res)
    }

    assert_eq!(provider.released(), 1);
    assert_eq!(
        trace.records().last(),
        Some(&(NegotiateStep::Validate, String::from("fail")))
    );
}

#[test]
fn test_connect_headers_not_mutated() {
    init();

    let mut link = DoubleDeque::new(b"HTTP/1.1 200 OK\r\n\r\n");
    let provider = Arc::new(StubProvider::new(&[0x01]));
    let mut headers = Headers::new();

    headers.add("User-Agent", "agent/1.0");
    headers.add("proxy-authorization", "Basic Zm9vOmJhcg==");

    let target = ProxyTarget::new(String::from("proxy"), 8080)
        .with_headers(headers.clone())
        .canonicalize_spn(false);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        provider,
        Arc::new(FailingResolver),
        Arc::new(RecordingTrace::default())
    );
    let check = params.clone();
    let res = run_machine(params, &mut link).expect("Expected success");
    let sent = link.sent();

    assert_eq!(check.target().headers(), &headers);
    assert_eq!(res.spn().to_string(), "HTTP/proxy");
    assert!(sent.contains("User-Agent: agent/1.0\r\n"));
    assert!(sent.contains("Proxy-Authorization: Negotiate AQ==\r\n"));
    assert!(!sent.contains("Basic"));
}

#[test]
fn test_connect_resolve_fail() {
    init();

    let mut link = DoubleDeque::new(b"");
    let provider = Arc::new(StubProvider::new(&[0x01]));
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        provider.clone(),
        Arc::new(FailingResolver),
        Arc::new(RecordingTrace::default())
    );

    match run_machine(params, &mut link) {
        Err(NegotiateError::Resolve { host, .. }) => assert_eq!(host, "proxy"),
        res => panic!("Expected resolve error, got {:?}", res)
    }

    assert!(link.uplink.is_empty());
    assert_eq!(provider.acquired(), 0);
    assert_eq!(provider.released(), 0);
}

#[test]
fn test_connect_context_fail() {
    init();

    let mut link = DoubleDeque::new(b"");
    let trace = Arc::new(RecordingTrace::default());
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        Arc::new(StubProvider::failing()),
        Arc::new(proxy_resolver()),
        trace.clone()
    );

    match run_machine(params, &mut link) {
        Err(NegotiateError::AuthNSetup { .. }) => {}
        res => panic!("Expected setup error, got {:?}", res)
    }

    assert!(link.uplink.is_empty());
    assert_eq!(
        trace.records().last(),
        Some(&(NegotiateStep::Context, String::from("fail")))
    );
}

#[test]
fn test_connect_closed_before_reply() {
    init();

    let mut link = DoubleDeque::new(b"HTTP/1.1 200");
    let provider = Arc::new(StubProvider::new(&[0x01]));
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let params = NegotiateParams::new(
        target,
        String::from("dest.example:443"),
        provider.clone(),
        Arc::new(proxy_resolver()),
        Arc::new(RecordingTrace::default())
    );

    match run_machine(params, &mut link) {
        Err(NegotiateError::Closed) => {}
        res => panic!("Expected closed, got {:?}", res)
    }

    assert_eq!(provider.acquired(), 1);
    assert_eq!(provider.released(), 1);
}
