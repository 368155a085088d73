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

//! Errors that can occur while negotiating a proxy tunnel.
//!
//! Every variant of [NegotiateError] identifies the negotiation step
//! that failed, so that the error alone is enough to tell a dial
//! failure from a DNS failure, a credential failure, or a rejection
//! by the proxy.  [TunnelError] pairs an error with whatever
//! connection existed when it occurred.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::path::PathBuf;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;

/// Errors that can occur in the Negotiate tunnel protocol.
#[derive(Debug)]
pub enum NegotiateError {
    /// The base dial function failed.
    Dial {
        /// The IO-level error.
        error: Error
    },
    /// DNS resolution of the proxy host failed.
    Resolve {
        /// The host name being resolved.
        host: String,
        /// The resolver error.
        error: Error
    },
    /// The Kerberos realm configuration could not be read.
    KrbConfig {
        /// Path to the configuration file.
        path: PathBuf,
        /// The IO-level error.
        error: Error
    },
    /// The keytab could not be read.
    Keytab {
        /// Path to the keytab.
        path: PathBuf,
        /// The IO-level error.
        error: Error
    },
    #[cfg(all(feature = "gssapi", not(windows)))]
    /// A GSSAPI error occurred.
    GSSAPIError {
        /// The GSSAPI error.
        error: libgssapi::error::Error
    },
    #[cfg(windows)]
    /// An SSPI call failed.
    SSPIError {
        /// Name of the failing call.
        call: &'static str,
        /// The Windows error.
        error: windows::core::Error
    },
    /// A security context provider failed to produce a token.
    AuthNSetup {
        /// Description of the failure.
        msg: String
    },
    /// No security context provider is available on this platform.
    NoProvider,
    /// The destination is not a valid `host:port` authority.
    BadDest {
        /// The destination.
        dest: String
    },
    /// A base header name is not a valid HTTP token.
    BadHeader {
        /// The header name.
        name: String
    },
    /// Writing the CONNECT request failed.
    Write {
        /// The IO-level error.
        error: Error
    },
    /// Reading the proxy's reply failed.
    Read {
        /// The IO-level error.
        error: Error
    },
    /// The proxy closed the connection before replying.
    Closed,
    /// The proxy's reply header exceeded the size limit.
    HeadTooLong {
        /// The size limit.
        limit: usize
    },
    /// The proxy's reply could not be parsed.
    BadResponse {
        /// Description of the parse failure.
        msg: String
    },
    /// The proxy rejected the CONNECT request.
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Status text.
        text: String,
        /// `Proxy-Authenticate` challenge offered with the reply.
        challenge: Option<String>
    }
}

/// Errors that can occur when parsing a proxy URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProxyURLError {
    /// The URL had no `scheme://` prefix.
    NoScheme {
        /// The URL.
        url: String
    },
    /// The scheme was not `http` or `https`.
    BadScheme {
        /// The scheme.
        scheme: String
    },
    /// The URL had no host.
    NoHost {
        /// The URL.
        url: String
    },
    /// The port could not be parsed.
    BadPort {
        /// The port string.
        port: String
    }
}

/// A failed negotiation, with the connection it was attempted on.
///
/// The connection is `None` only if dialing itself failed.  It is
/// never closed by the negotiator; the caller decides its fate.
pub struct TunnelError<Stream> {
    /// Connection to the proxy, if one was established.
    stream: Option<Stream>,
    /// The negotiation error.
    error: NegotiateError
}

impl NegotiateError {
    /// Get the HTTP status code if the proxy rejected the request.
    #[inline]
    pub fn status(&self) -> Option<u16> {
        match self {
            NegotiateError::Rejected { status, .. } => Some(*status),
            _ => None
        }
    }

    /// Check whether this is a rejection by the proxy.
    ///
    /// Callers wishing to fall back to a different authentication
    /// scheme should key off of this.
    #[inline]
    pub fn is_rejection(&self) -> bool {
        matches!(self, NegotiateError::Rejected { .. })
    }
}

impl<Stream> TunnelError<Stream> {
    /// Create a `TunnelError` from its components.
    #[inline]
    pub fn new(
        stream: Option<Stream>,
        error: NegotiateError
    ) -> Self {
        TunnelError {
            stream: stream,
            error: error
        }
    }

    /// Get the negotiation error.
    #[inline]
    pub fn error(&self) -> &NegotiateError {
        &self.error
    }

    /// Get the connection, if one was established.
    #[inline]
    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_ref()
    }

    /// Decompose this into its components.
    #[inline]
    pub fn take(self) -> (Option<Stream>, NegotiateError) {
        (self.stream, self.error)
    }
}

impl ScopedError for NegotiateError {
    fn scope(&self) -> ErrorScope {
        match self {
            // Transport errors take the scope of the underlying error.
            NegotiateError::Dial { error } |
            NegotiateError::Write { error } |
            NegotiateError::Read { error } => error.scope(),
            // Issues with the proxy or network.
            NegotiateError::Resolve { .. } |
            NegotiateError::Rejected { .. } => ErrorScope::External,
            // Protocol errors that kill the session.
            NegotiateError::Closed |
            NegotiateError::HeadTooLong { .. } |
            NegotiateError::BadResponse { .. } |
            NegotiateError::AuthNSetup { .. } => ErrorScope::Session,
            #[cfg(all(feature = "gssapi", not(windows)))]
            NegotiateError::GSSAPIError { .. } => ErrorScope::Session,
            #[cfg(windows)]
            NegotiateError::SSPIError { .. } => ErrorScope::Session,
            // Local configuration problems.
            NegotiateError::KrbConfig { .. } |
            NegotiateError::Keytab { .. } |
            NegotiateError::BadDest { .. } |
            NegotiateError::BadHeader { .. } |
            NegotiateError::NoProvider => ErrorScope::Unrecoverable
        }
    }
}

impl<Stream> ScopedError for TunnelError<Stream> {
    #[inline]
    fn scope(&self) -> ErrorScope {
        self.error.scope()
    }
}

impl std::error::Error for NegotiateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NegotiateError::Dial { error } |
            NegotiateError::Resolve { error, .. } |
            NegotiateError::KrbConfig { error, .. } |
            NegotiateError::Keytab { error, .. } |
            NegotiateError::Write { error } |
            NegotiateError::Read { error } => Some(error),
            #[cfg(all(feature = "gssapi", not(windows)))]
            NegotiateError::GSSAPIError { error } => Some(error),
            #[cfg(windows)]
            NegotiateError::SSPIError { error, .. } => Some(error),
            _ => None
        }
    }
}

impl<Stream> std::error::Error for TunnelError<Stream> {
    #[inline]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl Display for NegotiateError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NegotiateError::Dial { error } |
            NegotiateError::Write { error } |
            NegotiateError::Read { error } => write!(f, "{}", error),
            NegotiateError::Resolve { error, .. } => write!(f, "{}", error),
            NegotiateError::KrbConfig { path, error } => write!(
                f,
                "error loading Kerberos configuration {} ({})",
                path.display(),
                error
            ),
            NegotiateError::Keytab { path, error } => write!(
                f,
                "error loading keytab {} ({})",
                path.display(),
                error
            ),
            #[cfg(all(feature = "gssapi", not(windows)))]
            NegotiateError::GSSAPIError { error } => {
                write!(f, "GSSAPI error ({})", error)
            }
            #[cfg(windows)]
            NegotiateError::SSPIError { call, error } => {
                write!(f, "{} failed ({})", call, error)
            }
            NegotiateError::AuthNSetup { msg } => {
                write!(f, "authentication setup failed ({})", msg)
            }
            NegotiateError::NoProvider => {
                write!(f, "no Negotiate security provider on this platform")
            }
            NegotiateError::BadDest { dest } => {
                write!(f, "invalid CONNECT destination {:?}", dest)
            }
            NegotiateError::BadHeader { name } => {
                write!(f, "invalid header name {:?}", name)
            }
            NegotiateError::Closed => {
                write!(f, "proxy closed connection before replying")
            }
            NegotiateError::HeadTooLong { limit } => {
                write!(f, "proxy reply header exceeds {} bytes", limit)
            }
            NegotiateError::BadResponse { msg } => {
                write!(f, "malformed proxy reply ({})", msg)
            }
            NegotiateError::Rejected { text, .. } => write!(f, "{}", text)
        }
    }
}

impl std::error::Error for ProxyURLError {}

impl Display for ProxyURLError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ProxyURLError::NoScheme { url } => {
                write!(f, "proxy URL {} has no scheme", url)
            }
            ProxyURLError::BadScheme { scheme } => {
                write!(f, "unsupported proxy scheme {}", scheme)
            }
            ProxyURLError::NoHost { url } => {
                write!(f, "proxy URL {} has no host", url)
            }
            ProxyURLError::BadPort { port } => {
                write!(f, "bad proxy port {}", port)
            }
        }
    }
}

impl<Stream> Debug for TunnelError<Stream> {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "TunnelError {{ connected: {}, error: {:?} }}",
            self.stream.is_some(),
            self.error
        )
    }
}

impl<Stream> Display for TunnelError<Stream> {
    #[inline]
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        Display::fmt(&self.error, f)
    }
}

#[cfg(test)]
use std::io::ErrorKind;

#[test]
fn test_rejected_display_is_status_text() {
    let err = NegotiateError::Rejected {
        status: 407,
        text: String::from("Proxy Authentication Required"),
        challenge: Some(String::from("Negotiate"))
    };

    assert_eq!(err.to_string(), "Proxy Authentication Required");
    assert_eq!(err.status(), Some(407));
    assert!(err.is_rejection());
}

#[test]
fn test_transport_display_is_verbatim() {
    let err = NegotiateError::Write {
        error: Error::new(ErrorKind::BrokenPipe, "pipe went away")
    };

    assert_eq!(err.to_string(), "pipe went away");
    assert_eq!(err.status(), None);
    assert!(!err.is_rejection());
}

#[test]
fn test_tunnel_error_take() {
    let err: TunnelError<Vec<u8>> =
        TunnelError::new(Some(vec![1, 2, 3]), NegotiateError::Closed);

    assert_eq!(err.stream(), Some(&vec![1, 2, 3]));
    assert_eq!(err.to_string(), NegotiateError::Closed.to_string());

    let (stream, error) = err.take();

    assert_eq!(stream, Some(vec![1, 2, 3]));
    assert!(matches!(error, NegotiateError::Closed));
}
