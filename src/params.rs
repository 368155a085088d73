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

//! Parameters for a Negotiate tunnel attempt.
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::MapAccess;
use serde::de::Visitor;
use serde::ser::SerializeMap;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::error::ProxyURLError;
use crate::secctx::SecurityContextProvider;
use crate::spn::Resolver;
use crate::trace::TraceSink;

const HTTP_PROXY_PORT: u16 = 80;
const HTTPS_PROXY_PORT: u16 = 443;

/// Ordered set of HTTP headers.
///
/// Header names compare case-insensitively.  Serialized as a map from
/// header name to value, in order and keeping repeated names.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>
}

/// Description of the proxy to authenticate to.
///
/// This is the caller-owned input to a negotiation attempt.  The
/// negotiator only ever reads it; in particular, the base
/// [Headers] are cloned before the authentication headers are
/// added.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProxyTarget {
    /// Proxy host name or address.
    host: String,
    /// Proxy port.
    port: u16,
    /// Client user name.
    #[serde(default)]
    username: Option<String>,
    /// Client domain (Kerberos realm).
    #[serde(default)]
    domain: Option<String>,
    /// Client password.  Only used by SSPI.  Never serialized.
    #[serde(default, skip_serializing)]
    password: Option<String>,
    /// Client keytab.  Only used by GSSAPI.
    #[serde(default)]
    keytab: Option<PathBuf>,
    /// Base headers to send with the CONNECT request.
    #[serde(default)]
    headers: Headers,
    /// Whether to canonicalize the proxy host name with DNS before
    /// building the service principal.
    #[serde(default = "ProxyTarget::default_canonicalize")]
    canonicalize: bool
}

/// Parameters for the Negotiate tunnel state machine.
///
/// This combines the [ProxyTarget] with the destination address and
/// the collaborators used to carry out the negotiation.
#[derive(Clone)]
pub struct NegotiateParams {
    /// The proxy.
    target: ProxyTarget,
    /// Destination `host:port` to request from the proxy.
    dest: String,
    /// Security context provider.
    provider: Arc<dyn SecurityContextProvider>,
    /// DNS resolver.
    resolver: Arc<dyn Resolver>,
    /// Diagnostic trace sink.
    trace: Arc<dyn TraceSink>
}

impl Headers {
    /// Create an empty header set.
    #[inline]
    pub fn new() -> Self {
        Headers::default()
    }

    /// Get the first value for `name`.
    pub fn get(
        &self,
        name: &str
    ) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Add a value for `name`, keeping any existing values.
    #[inline]
    pub fn add<N, V>(
        &mut self,
        name: N,
        value: V
    ) where
        N: Into<String>,
        V: Into<String> {
        self.entries.push((name.into(), value.into()))
    }

    /// Set `name` to `value`, replacing all existing values.
    pub fn set<N, V>(
        &mut self,
        name: N,
        value: V
    ) where
        N: Into<String>,
        V: Into<String> {
        let name = name.into();

        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()))
    }

    /// Remove all values for `name`.
    #[inline]
    pub fn remove(
        &mut self,
        name: &str
    ) {
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name))
    }

    /// Iterate over all header names and values in order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct HeadersVisitor;

impl<'de> Visitor<'de> for HeadersVisitor {
    type Value = Headers;

    fn expecting(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "a map from header names to values")
    }

    fn visit_map<A>(
        self,
        mut access: A
    ) -> Result<Headers, A::Error>
    where
        A: MapAccess<'de> {
        let mut headers = Headers::new();

        while let Some((name, value)) =
            access.next_entry::<String, String>()?
        {
            headers.add(name, value)
        }

        Ok(headers)
    }
}

impl<'de> Deserialize<'de> for Headers {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Headers, D::Error>
    where
        D: Deserializer<'de> {
        deserializer.deserialize_map(HeadersVisitor)
    }
}

impl Serialize for Headers {
    fn serialize<S>(
        &self,
        serializer: S
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;

        for (name, value) in self.entries.iter() {
            map.serialize_entry(name, value)?;
        }

        map.end()
    }
}

impl ProxyTarget {
    #[inline]
    fn default_canonicalize() -> bool {
        true
    }

    /// Create a `ProxyTarget` for `host:port` using the default
    /// credentials of the current user.
    #[inline]
    pub fn new(
        host: String,
        port: u16
    ) -> ProxyTarget {
        ProxyTarget {
            host: host,
            port: port,
            username: None,
            domain: None,
            password: None,
            keytab: None,
            headers: Headers::default(),
            canonicalize: true
        }
    }

    /// Create a `ProxyTarget` from a proxy URL such as
    /// `http://proxy.example.com:3128`.
    ///
    /// Only the `http` and `https` schemes are accepted.  If no port
    /// is given, 80 is used for `http` and 443 for `https`.  Any
    /// path component is ignored.
    pub fn from_url(url: &str) -> Result<ProxyTarget, ProxyURLError> {
        let (scheme, rest) = match url.split_once("://") {
            Some(split) => split,
            None => {
                return Err(ProxyURLError::NoScheme {
                    url: url.to_string()
                })
            }
        };
        let default_port = if scheme.eq_ignore_ascii_case("http") {
            HTTP_PROXY_PORT
        } else if scheme.eq_ignore_ascii_case("https") {
            HTTPS_PROXY_PORT
        } else {
            return Err(ProxyURLError::BadScheme {
                scheme: scheme.to_string()
            });
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        // Drop any userinfo.
        let authority = match authority.rsplit_once('@') {
            Some((_, hostport)) => hostport,
            None => authority
        };
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[')
        {
            // IPv6 literal.
            match bracketed.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, port)) => match port.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(ProxyURLError::BadPort {
                            port: port.to_string()
                        })
                    }
                },
                None => {
                    return Err(ProxyURLError::NoHost {
                        url: url.to_string()
                    })
                }
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None)
            }
        };

        if host.is_empty() {
            return Err(ProxyURLError::NoHost {
                url: url.to_string()
            });
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| {
                ProxyURLError::BadPort {
                    port: port.to_string()
                }
            })?,
            None => default_port
        };

        Ok(ProxyTarget::new(host.to_string(), port))
    }

    /// Set the user name and domain to authenticate as.
    #[inline]
    pub fn with_user(
        mut self,
        username: String,
        domain: String
    ) -> Self {
        self.username = Some(username);
        self.domain = Some(domain);
        self
    }

    /// Set the password (SSPI only).
    #[inline]
    pub fn with_password(
        mut self,
        password: String
    ) -> Self {
        self.password = Some(password);
        self
    }

    /// Set the keytab (GSSAPI only).
    #[inline]
    pub fn with_keytab(
        mut self,
        keytab: PathBuf
    ) -> Self {
        self.keytab = Some(keytab);
        self
    }

    /// Set the base headers sent with the CONNECT request.
    #[inline]
    pub fn with_headers(
        mut self,
        headers: Headers
    ) -> Self {
        self.headers = headers;
        self
    }

    /// Set whether to canonicalize the proxy host name before
    /// building the service principal.
    #[inline]
    pub fn canonicalize_spn(
        mut self,
        canonicalize: bool
    ) -> Self {
        self.canonicalize = canonicalize;
        self
    }

    /// Get the proxy host.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the proxy port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the user name, if one is set.
    ///
    /// If this is not set, the backend uses the credentials of the
    /// current user.
    #[inline]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Get the domain, if one is set.
    #[inline]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Get the password, if one is set.
    #[inline]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Get the keytab path, if one is set.
    #[inline]
    pub fn keytab(&self) -> Option<&Path> {
        self.keytab.as_deref()
    }

    /// Get the base headers.
    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn canonicalize(&self) -> bool {
        self.canonicalize
    }

    /// Get the `host:port` address of the proxy, suitable for
    /// connecting to.
    #[inline]
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl NegotiateParams {
    /// Create `NegotiateParams` from their components.
    #[inline]
    pub fn new(
        target: ProxyTarget,
        dest: String,
        provider: Arc<dyn SecurityContextProvider>,
        resolver: Arc<dyn Resolver>,
        trace: Arc<dyn TraceSink>
    ) -> NegotiateParams {
        NegotiateParams {
            target: target,
            dest: dest,
            provider: provider,
            resolver: resolver,
            trace: trace
        }
    }

    /// Get the proxy description.
    #[inline]
    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Get the destination address.
    #[inline]
    pub fn dest(&self) -> &str {
        &self.dest
    }

    /// Get the security context provider.
    #[inline]
    pub fn provider(&self) -> &dyn SecurityContextProvider {
        self.provider.as_ref()
    }

    /// Get the DNS resolver.
    #[inline]
    pub fn resolver(&self) -> &dyn Resolver {
        self.resolver.as_ref()
    }

    /// Get the trace sink.
    #[inline]
    pub fn trace(&self) -> &dyn TraceSink {
        self.trace.as_ref()
    }
}

impl Debug for ProxyTarget {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("ProxyTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keytab", &self.keytab)
            .field("headers", &self.headers)
            .field("canonicalize", &self.canonicalize)
            .finish()
    }
}

impl Display for ProxyTarget {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match (&self.username, &self.domain) {
            (Some(username), Some(domain)) => {
                write!(f, "{}@{} via {}", username, domain, self.endpoint())
            }
            (Some(username), None) => {
                write!(f, "{} via {}", username, self.endpoint())
            }
            _ => write!(f, "{}", self.endpoint())
        }
    }
}

#[test]
fn test_headers_set_replaces_case_insensitive() {
    let mut headers = Headers::new();

    headers.add("User-Agent", "agent/1.0");
    headers.add("proxy-connection", "close");
    headers.set("Proxy-Connection", "Keep-Alive");

    assert_eq!(headers.len(), 2);
    assert_eq!(headers.get("PROXY-CONNECTION"), Some("Keep-Alive"));
    assert_eq!(headers.get("user-agent"), Some("agent/1.0"));
}

#[test]
fn test_headers_remove() {
    let mut headers = Headers::new();

    headers.add("X-One", "1");
    headers.add("x-one", "2");
    headers.add("X-Two", "2");
    headers.remove("X-ONE");

    assert_eq!(headers.len(), 1);
    assert_eq!(headers.get("x-one"), None);
}

#[test]
fn test_from_url_http_default_port() {
    let target =
        ProxyTarget::from_url("http://proxy.corp.example").expect("Expected success");

    assert_eq!(target.host(), "proxy.corp.example");
    assert_eq!(target.port(), 80);
    assert_eq!(target.endpoint(), "proxy.corp.example:80");
    assert!(target.canonicalize());
}

#[test]
fn test_from_url_explicit_port_and_path() {
    let target = ProxyTarget::from_url("HTTP://user@proxy.corp.example:3128/x")
        .expect("Expected success");

    assert_eq!(target.host(), "proxy.corp.example");
    assert_eq!(target.port(), 3128);
    assert_eq!(target.endpoint(), "proxy.corp.example:3128");
}

#[test]
fn test_from_url_ipv6() {
    let target =
        ProxyTarget::from_url("https://[fe80::1]").expect("Expected success");

    assert_eq!(target.host(), "fe80::1");
    assert_eq!(target.port(), 443);
    assert_eq!(target.endpoint(), "[fe80::1]:443");

    let target =
        ProxyTarget::from_url("http://[fe80::1]:3128").expect("Expected success");

    assert_eq!(target.port(), 3128);
}

#[test]
fn test_from_url_errors() {
    match ProxyTarget::from_url("proxy.corp.example:8080") {
        Err(ProxyURLError::NoScheme { .. }) => {}
        res => panic!("Expected no scheme error, got {:?}", res)
    }

    match ProxyTarget::from_url("socks5://proxy:1080") {
        Err(ProxyURLError::BadScheme { scheme }) => assert_eq!(scheme, "socks5"),
        res => panic!("Expected bad scheme error, got {:?}", res)
    }

    match ProxyTarget::from_url("http://proxy:http") {
        Err(ProxyURLError::BadPort { port }) => assert_eq!(port, "http"),
        res => panic!("Expected bad port error, got {:?}", res)
    }

    match ProxyTarget::from_url("http://:8080") {
        Err(ProxyURLError::NoHost { .. }) => {}
        res => panic!("Expected no host error, got {:?}", res)
    }
}

#[test]
fn test_deserialize_target() {
    let json = r#"{
        "host": "proxy.corp.example",
        "port": 3128,
        "username": "alice",
        "domain": "CORP",
        "keytab": "/etc/alice.keytab",
        "headers": { "User-Agent": "agent/1.0" }
    }"#;
    let target: ProxyTarget =
        serde_json::from_str(json).expect("Expected success");

    assert_eq!(target.username(), Some("alice"));
    assert_eq!(target.domain(), Some("CORP"));
    assert_eq!(target.password(), None);
    assert_eq!(target.keytab(), Some(Path::new("/etc/alice.keytab")));
    assert_eq!(target.headers().get("user-agent"), Some("agent/1.0"));
    assert!(target.canonicalize());
    assert_eq!(target.to_string(), "alice@CORP via proxy.corp.example:3128");
}

#[test]
fn test_debug_redacts_password() {
    let target = ProxyTarget::new(String::from("proxy"), 8080)
        .with_user(String::from("alice"), String::from("CORP"))
        .with_password(String::from("hunter2"));
    let debug = format!("{:?}", target);

    assert!(!debug.contains("hunter2"));
    assert!(debug.contains("<redacted>"));
}

#[test]
fn test_serialize_skips_password() {
    let target = ProxyTarget::new(String::from("proxy"), 3128)
        .with_user(String::from("alice"), String::from("CORP"))
        .with_password(String::from("hunter2"));
    let json = serde_json::to_string(&target).expect("Expected success");

    assert!(!json.contains("hunter2"));
    assert!(!json.contains("password"));
    assert!(json.contains("\"username\":\"alice\""));
}

#[test]
fn test_headers_serde_keeps_order_and_repeats() {
    let mut headers = Headers::new();

    headers.add("X-Zulu", "1");
    headers.add("X-Alpha", "2");
    headers.add("x-alpha", "3");

    let json = serde_json::to_string(&headers).expect("Expected success");

    assert_eq!(json, r#"{"X-Zulu":"1","X-Alpha":"2","x-alpha":"3"}"#);

    let back: Headers = serde_json::from_str(&json).expect("Expected success");

    assert_eq!(back, headers);
    assert_eq!(back.len(), 3);
}
