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

//! Low-level HTTP CONNECT encoding and decoding functions.
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::error;
#[cfg(feature = "log")]
use log::trace;

use crate::error::NegotiateError;
use crate::params::Headers;

const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
const PROXY_CONNECTION: &str = "Proxy-Connection";
const CONTENT_LENGTH: &str = "Content-Length";
const NEGOTIATE: &str = "Negotiate";
const KEEP_ALIVE: &str = "Keep-Alive";

const STATUS_OK: u16 = 200;

/// Largest reply header accepted from the proxy.
pub const MAX_HEAD_LEN: usize = 32 * 1024;
/// Largest number of reply headers accepted from the proxy.
const MAX_HEADERS: usize = 64;
/// Largest rejection body that will be drained.
const MAX_DRAIN_LEN: u64 = 64 * 1024;

/// The proxy's reply to a CONNECT request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectReply {
    /// HTTP status code.
    status: u16,
    /// Reason phrase from the status line.
    reason: String,
    /// Reply headers.
    headers: Headers
}

impl ConnectReply {
    /// Get the HTTP status code.
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Get the reason phrase sent by the proxy.
    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the reply headers.
    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get the Negotiate challenge, if the proxy sent one.
    pub fn challenge(&self) -> Option<&str> {
        self.headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(PROXY_AUTHENTICATE))
            .map(|(_, value)| value)
            .find(|value| {
                value
                    .split_whitespace()
                    .next()
                    .map_or(false, |scheme| {
                        scheme.eq_ignore_ascii_case(NEGOTIATE)
                    })
            })
    }

    /// Get the declared body length, if any.
    fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|len| len.trim().parse().ok())
    }
}

/// Get the standard text for an HTTP status code.
pub fn status_text(status: u16) -> Option<&'static str> {
    let text = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => return None
    };

    Some(text)
}

/// Build the CONNECT request headers.
///
/// This clones `base` and sets the Negotiate authorization and
/// keep-alive headers on the copy.
pub fn connect_headers(
    base: &Headers,
    token: &[u8]
) -> Headers {
    let mut headers = base.clone();

    headers.set(
        PROXY_AUTHORIZATION,
        format!("{} {}", NEGOTIATE, STANDARD.encode(token))
    );
    headers.set(PROXY_CONNECTION, KEEP_ALIVE);

    headers
}

/// Check that `dest` can stand as both request target and `Host`.
fn valid_dest(dest: &str) -> bool {
    !dest.is_empty() &&
        dest.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=:[]%".contains(&b)
        })
}

/// Check that `name` is an HTTP token.
fn valid_header_name(name: &str) -> bool {
    !name.is_empty() &&
        name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// Append one header line to `buf`.
///
/// Line breaks inside `value` become spaces.
fn push_header(
    buf: &mut String,
    name: &str,
    value: &str
) {
    buf.push_str(name);
    buf.push_str(": ");
    buf.extend(value.chars().map(|c| match c {
        '\r' | '\n' => ' ',
        c => c
    }));
    buf.push_str("\r\n");
}

/// Write a CONNECT request for `dest` carrying `token`.
///
/// The request is assembled in full and written with a single call.
/// Nothing is written if `dest` or a header name is malformed.
pub fn write_connect<S>(
    stream: &mut S,
    dest: &str,
    base: &Headers,
    token: &[u8]
) -> Result<(), NegotiateError>
where
    S: Write {
    if !valid_dest(dest) {
        #[cfg(feature = "log")]
        error!(target: "negotiate-protocol",
               "refusing to send CONNECT to malformed destination {:?}",
               dest);

        return Err(NegotiateError::BadDest {
            dest: dest.to_string()
        });
    }

    let headers = connect_headers(base, token);
    let mut buf = format!("CONNECT {} HTTP/1.1\r\n", dest);

    push_header(&mut buf, "Host", dest);

    for (name, value) in headers.iter() {
        if !valid_header_name(name) {
            #[cfg(feature = "log")]
            error!(target: "negotiate-protocol",
                   "refusing to send malformed header name {:?}",
                   name);

            return Err(NegotiateError::BadHeader {
                name: name.to_string()
            });
        }

        // Host is always the destination.
        if !name.eq_ignore_ascii_case("Host") {
            push_header(&mut buf, name, value);
        }
    }

    buf.push_str("\r\n");

    #[cfg(feature = "log")]
    trace!(target: "negotiate-protocol",
           "sending CONNECT {} ({} headers, {} byte token)",
           dest, headers.len(), token.len());

    stream
        .write_all(buf.as_bytes())
        .and_then(|_| stream.flush())
        .map_err(|err| {
            #[cfg(feature = "log")]
            error!(target: "negotiate-protocol",
                   "could not write CONNECT request to proxy ({})",
                   err);

            NegotiateError::Write { error: err }
        })
}

/// Read the reply header from `stream`.
///
/// This reads exactly up to the blank line ending the header, so that
/// no bytes belonging to the tunnel are consumed.
fn read_head<S>(stream: &mut S) -> Result<Vec<u8>, NegotiateError>
where
    S: Read {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_LEN {
            #[cfg(feature = "log")]
            error!(target: "negotiate-protocol",
                   "proxy reply header exceeds {} bytes",
                   MAX_HEAD_LEN);

            return Err(NegotiateError::HeadTooLong {
                limit: MAX_HEAD_LEN
            });
        }

        match stream.read(&mut byte) {
            Ok(0) => return Err(NegotiateError::Closed),
            Ok(_) => head.push(byte[0]),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(NegotiateError::Read { error: err })
        }
    }

    Ok(head)
}

/// Parse a complete reply header.
fn parse_head(head: &[u8]) -> Result<ConnectReply, NegotiateError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw);

    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => {
            let status = resp.code.ok_or_else(|| NegotiateError::BadResponse {
                msg: String::from("missing status code")
            })?;
            let reason = resp.reason.unwrap_or("").to_string();
            let mut headers = Headers::new();

            for header in resp.headers.iter() {
                headers.add(
                    header.name,
                    String::from_utf8_lossy(header.value).into_owned()
                );
            }

            Ok(ConnectReply {
                status: status,
                reason: reason,
                headers: headers
            })
        }
        Ok(httparse::Status::Partial) => Err(NegotiateError::BadResponse {
            msg: String::from("incomplete reply header")
        }),
        Err(err) => Err(NegotiateError::BadResponse {
            msg: err.to_string()
        })
    }
}

/// Discard a rejection body, if it is small enough.
fn drain_body<S>(
    stream: &mut S,
    reply: &ConnectReply
) where
    S: Read {
    if let Some(len) = reply.content_length() {
        if len <= MAX_DRAIN_LEN {
            let mut sink = std::io::sink();

            // The rejection is what gets reported, not this.
            if let Err(_err) =
                std::io::copy(&mut stream.by_ref().take(len), &mut sink)
            {
                #[cfg(feature = "log")]
                debug!(target: "negotiate-protocol",
                       "error draining rejection body ({})",
                       _err);
            }
        }
    }
}

/// Read the proxy's reply to the CONNECT request.
///
/// A status of 200 yields the reply.  Any other status yields
/// [NegotiateError::Rejected] with the standard text for the status
/// code as its message.
pub fn parse_connect_reply<S>(
    stream: &mut S
) -> Result<ConnectReply, NegotiateError>
where
    S: Read {
    #[cfg(feature = "log")]
    trace!(target: "negotiate-protocol",
           "reading CONNECT reply");

    let head = read_head(stream)?;
    let reply = parse_head(&head)?;

    if reply.status == STATUS_OK {
        #[cfg(feature = "log")]
        debug!(target: "negotiate-protocol",
               "proxy accepted CONNECT ({} {})",
               reply.status, reply.reason);

        Ok(reply)
    } else {
        #[cfg(feature = "log")]
        debug!(target: "negotiate-protocol",
               "expected {} as reply status, got {}",
               STATUS_OK, reply.status);

        drain_body(stream, &reply);

        let text = match status_text(reply.status) {
            Some(text) => text.to_string(),
            None => reply.reason.clone()
        };

        Err(NegotiateError::Rejected {
            status: reply.status,
            text: text,
            challenge: reply.challenge().map(String::from)
        })
    }
}

#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::io::Error;

#[cfg(test)]
struct BrokenPipe;

#[cfg(test)]
impl Write for BrokenPipe {
    fn write(
        &mut self,
        _buf: &[u8]
    ) -> Result<usize, Error> {
        Err(Error::new(ErrorKind::BrokenPipe, "broken pipe"))
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[test]
fn test_connect_headers_clone() {
    let mut base = Headers::new();

    base.add("User-Agent", "agent/1.0");
    base.add("Proxy-Connection", "close");

    let before = base.clone();
    let headers = connect_headers(&base, &[0xde, 0xad, 0xbe, 0xef]);

    assert_eq!(base, before);
    assert_eq!(headers.get("User-Agent"), Some("agent/1.0"));
    assert_eq!(headers.get("Proxy-Authorization"), Some("Negotiate 3q2+7w=="));
    assert_eq!(headers.get("Proxy-Connection"), Some("Keep-Alive"));
    assert_eq!(headers.len(), 3);
}

#[test]
fn test_write_connect() {
    let mut buf = VecDeque::new();
    let mut base = Headers::new();

    base.add("User-Agent", "agent/1.0");
    write_connect(&mut buf, "dest.example:443", &base, &[0xde, 0xad, 0xbe, 0xef])
        .expect("Expected success");

    let msg = String::from_utf8(buf.make_contiguous().to_vec())
        .expect("Expected UTF-8");
    let expected = concat!(
        "CONNECT dest.example:443 HTTP/1.1\r\n",
        "Host: dest.example:443\r\n",
        "User-Agent: agent/1.0\r\n",
        "Proxy-Authorization: Negotiate 3q2+7w==\r\n",
        "Proxy-Connection: Keep-Alive\r\n",
        "\r\n"
    );

    assert_eq!(msg, expected);
}

#[test]
fn test_write_connect_ignores_base_host() {
    let mut buf = VecDeque::new();
    let mut base = Headers::new();

    base.add("host", "elsewhere.example");
    write_connect(&mut buf, "dest.example:443", &base, &[0x01])
        .expect("Expected success");

    let msg = String::from_utf8(buf.make_contiguous().to_vec())
        .expect("Expected UTF-8");

    assert!(!msg.contains("elsewhere"));
    assert!(msg.starts_with("CONNECT dest.example:443 HTTP/1.1\r\n"));
}

#[test]
fn test_write_connect_bad_dest() {
    let mut buf = VecDeque::new();

    match write_connect(
        &mut buf,
        "dest:443\r\nX-Smuggled: yes",
        &Headers::new(),
        &[0x01]
    ) {
        Err(NegotiateError::BadDest { dest }) => {
            assert_eq!(dest, "dest:443\r\nX-Smuggled: yes")
        }
        res => panic!("Expected bad destination, got {:?}", res)
    }

    match write_connect(&mut buf, "", &Headers::new(), &[0x01]) {
        Err(NegotiateError::BadDest { .. }) => {}
        res => panic!("Expected bad destination, got {:?}", res)
    }

    assert!(buf.is_empty());
}

#[test]
fn test_write_connect_ipv6_dest() {
    let mut buf = VecDeque::new();

    write_connect(&mut buf, "[2001:db8::1]:443", &Headers::new(), &[0x01])
        .expect("Expected success");

    let msg = String::from_utf8(buf.make_contiguous().to_vec())
        .expect("Expected UTF-8");

    assert!(msg.starts_with("CONNECT [2001:db8::1]:443 HTTP/1.1\r\n"));
}

#[test]
fn test_write_connect_bad_header_name() {
    let mut buf = VecDeque::new();
    let mut base = Headers::new();

    base.add("X-Bad\r\nX-Smuggled", "yes");

    match write_connect(&mut buf, "dest:443", &base, &[0x01]) {
        Err(NegotiateError::BadHeader { name }) => {
            assert_eq!(name, "X-Bad\r\nX-Smuggled")
        }
        res => panic!("Expected bad header, got {:?}", res)
    }

    assert!(buf.is_empty());
}

#[test]
fn test_write_connect_header_value_line_breaks() {
    let mut buf = VecDeque::new();
    let mut base = Headers::new();

    base.add("User-Agent", "agent\r\nX-Smuggled: yes");
    write_connect(&mut buf, "dest:443", &base, &[0x01])
        .expect("Expected success");

    let msg = String::from_utf8(buf.make_contiguous().to_vec())
        .expect("Expected UTF-8");

    assert!(msg.contains("User-Agent: agent  X-Smuggled: yes\r\n"));
    assert!(!msg.contains("\r\nX-Smuggled"));
    assert_eq!(msg.matches("\r\n").count(), 6);
}

#[test]
fn test_write_connect_error() {
    match write_connect(&mut BrokenPipe, "dest:443", &Headers::new(), &[0x01]) {
        Err(NegotiateError::Write { error }) => {
            assert_eq!(error.kind(), ErrorKind::BrokenPipe)
        }
        res => panic!("Expected write error, got {:?}", res)
    }
}

#[test]
fn test_parse_connect_reply_success() {
    let msg = b"HTTP/1.1 200 Connection Established\r\n\r\ntunnel";
    let mut buf = VecDeque::from(msg.to_vec());
    let reply = parse_connect_reply(&mut buf).expect("Expected success");

    assert_eq!(reply.status(), 200);
    assert_eq!(reply.reason(), "Connection Established");
    assert_eq!(buf.make_contiguous(), b"tunnel");
}

#[test]
fn test_parse_connect_reply_rejected() {
    let msg = concat!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n",
        "Proxy-Authenticate: Basic realm=\"corp\"\r\n",
        "Proxy-Authenticate: Negotiate oRQwEqADCgEBoQsGCSqGSIb3EgECAg==\r\n",
        "Content-Length: 4\r\n",
        "\r\n",
        "denyX"
    );
    let mut buf = VecDeque::from(msg.as_bytes().to_vec());

    match parse_connect_reply(&mut buf) {
        Err(NegotiateError::Rejected {
            status,
            text,
            challenge
        }) => {
            assert_eq!(status, 407);
            assert_eq!(text, "Proxy Authentication Required");
            assert_eq!(
                challenge.as_deref(),
                Some("Negotiate oRQwEqADCgEBoQsGCSqGSIb3EgECAg==")
            );
        }
        res => panic!("Expected rejection, got {:?}", res)
    }

    assert_eq!(buf.make_contiguous(), b"X");
}

#[test]
fn test_parse_connect_reply_status_text_not_reason() {
    let msg = b"HTTP/1.1 502 Upstream Unhappy\r\n\r\n";
    let mut buf = VecDeque::from(msg.to_vec());

    match parse_connect_reply(&mut buf) {
        Err(err) => {
            assert_eq!(err.status(), Some(502));
            assert_eq!(err.to_string(), "Bad Gateway");
        }
        res => panic!("Expected rejection, got {:?}", res)
    }
}

#[test]
fn test_parse_connect_reply_unknown_status() {
    let msg = b"HTTP/1.1 599 Custom Failure\r\n\r\n";
    let mut buf = VecDeque::from(msg.to_vec());

    match parse_connect_reply(&mut buf) {
        Err(err) => assert_eq!(err.to_string(), "Custom Failure"),
        res => panic!("Expected rejection, got {:?}", res)
    }
}

#[test]
fn test_parse_connect_reply_closed() {
    let msg = b"HTTP/1.1 200 Conn";
    let mut buf = VecDeque::from(msg.to_vec());

    match parse_connect_reply(&mut buf) {
        Err(NegotiateError::Closed) => {}
        res => panic!("Expected closed, got {:?}", res)
    }
}

#[test]
fn test_parse_connect_reply_garbage() {
    let msg = b"SSH-2.0-OpenSSH_9.6\r\n\r\n";
    let mut buf = VecDeque::from(msg.to_vec());

    match parse_connect_reply(&mut buf) {
        Err(NegotiateError::BadResponse { .. }) => {}
        res => panic!("Expected bad response, got {:?}", res)
    }
}

#[test]
fn test_parse_connect_reply_too_long() {
    let mut msg = b"HTTP/1.1 200 OK\r\nX-Filler: ".to_vec();

    msg.extend(std::iter::repeat(b'a').take(MAX_HEAD_LEN));

    let mut buf = VecDeque::from(msg);

    match parse_connect_reply(&mut buf) {
        Err(NegotiateError::HeadTooLong { limit }) => {
            assert_eq!(limit, MAX_HEAD_LEN)
        }
        res => panic!("Expected head too long, got {:?}", res)
    }
}

#[test]
fn test_status_text() {
    assert_eq!(status_text(200), Some("OK"));
    assert_eq!(status_text(403), Some("Forbidden"));
    assert_eq!(status_text(407), Some("Proxy Authentication Required"));
    assert_eq!(status_text(299), None);
}
