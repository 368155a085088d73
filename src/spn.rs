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

//! Service principal names for HTTP proxies.
//!
//! Kerberos issues service tickets for a host's canonical name, which
//! need not be the name used to reach it.  [canonicalize] maps a host
//! name to its canonical name with a forward lookup followed by a
//! reverse lookup of the first address, and [ServicePrincipal] builds
//! the `HTTP/<host>` principal from the result.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::net::IpAddr;

#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::trace;

use crate::error::NegotiateError;

const HTTP_SERVICE: &str = "HTTP";

/// Forward and reverse DNS lookups.
pub trait Resolver: Send + Sync {
    /// Look up the addresses for `host`.
    fn lookup_host(
        &self,
        host: &str
    ) -> Result<Vec<IpAddr>, Error>;

    /// Look up the names for `addr`.
    fn lookup_addr(
        &self,
        addr: &IpAddr
    ) -> Result<Vec<String>, Error>;
}

/// [Resolver] using the system resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

/// A service principal name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ServicePrincipal {
    /// Service class.
    service: String,
    /// Host name.
    host: String
}

impl Resolver for SystemResolver {
    #[inline]
    fn lookup_host(
        &self,
        host: &str
    ) -> Result<Vec<IpAddr>, Error> {
        let _env = crate::env_lock();

        dns_lookup::lookup_host(host)
    }

    fn lookup_addr(
        &self,
        addr: &IpAddr
    ) -> Result<Vec<String>, Error> {
        let name = {
            let _env = crate::env_lock();

            dns_lookup::lookup_addr(addr)?
        };

        // getnameinfo hands back the numeric form when there is no
        // PTR record.
        if name.parse::<IpAddr>().is_ok() {
            Ok(vec![])
        } else {
            Ok(vec![name])
        }
    }
}

impl ServicePrincipal {
    /// Create a `ServicePrincipal` for the HTTP service on `host`.
    #[inline]
    pub fn http(host: String) -> ServicePrincipal {
        ServicePrincipal {
            service: String::from(HTTP_SERVICE),
            host: host
        }
    }

    /// Get the service class.
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get the host part.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the GSSAPI host-based service form, `service@host`.
    #[inline]
    pub fn hostbased(&self) -> String {
        format!("{}@{}", self.service, self.host)
    }
}

/// Get the canonical name for `host`.
///
/// If the forward lookup yields no addresses, or the reverse lookup
/// of the first address yields no names, `host` is returned
/// unchanged.  Otherwise the first name is returned with any trailing
/// root separator removed.  Lookup errors are returned as
/// [NegotiateError::Resolve].
pub fn canonicalize<R>(
    resolver: &R,
    host: &str
) -> Result<String, NegotiateError>
where
    R: Resolver + ?Sized {
    #[cfg(feature = "log")]
    trace!(target: "negotiate-spn",
           "canonicalizing host name {}",
           host);

    let addrs = resolver.lookup_host(host).map_err(|err| {
        NegotiateError::Resolve {
            host: host.to_string(),
            error: err
        }
    })?;
    let addr = match addrs.first() {
        Some(addr) => addr,
        None => {
            #[cfg(feature = "log")]
            debug!(target: "negotiate-spn",
                   "no addresses for {}, using it as is",
                   host);

            return Ok(host.to_string());
        }
    };
    let names = resolver.lookup_addr(addr).map_err(|err| {
        NegotiateError::Resolve {
            host: addr.to_string(),
            error: err
        }
    })?;

    match names.first() {
        Some(name) => {
            let name = name.trim_end_matches('.');

            #[cfg(feature = "log")]
            debug!(target: "negotiate-spn",
                   "canonical name for {} ({}) is {}",
                   host, addr, name);

            Ok(name.to_string())
        }
        None => {
            #[cfg(feature = "log")]
            debug!(target: "negotiate-spn",
                   "no names for {}, using {} as is",
                   addr, host);

            Ok(host.to_string())
        }
    }
}

/// Build the service principal for the proxy at `host`.
///
/// If `canonical` is set, the host name is first canonicalized with
/// [canonicalize].
pub fn proxy_principal<R>(
    resolver: &R,
    host: &str,
    canonical: bool
) -> Result<ServicePrincipal, NegotiateError>
where
    R: Resolver + ?Sized {
    let host = if canonical {
        canonicalize(resolver, host)?
    } else {
        host.to_string()
    };

    Ok(ServicePrincipal::http(host))
}

impl Display for ServicePrincipal {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.service, self.host)
    }
}

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::io::ErrorKind;

/// [Resolver] answering from fixed tables.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FixedResolver {
    pub(crate) hosts: HashMap<String, Vec<IpAddr>>,
    pub(crate) addrs: HashMap<IpAddr, Vec<String>>
}

#[cfg(test)]
impl Resolver for FixedResolver {
    fn lookup_host(
        &self,
        host: &str
    ) -> Result<Vec<IpAddr>, Error> {
        Ok(self.hosts.get(host).cloned().unwrap_or_default())
    }

    fn lookup_addr(
        &self,
        addr: &IpAddr
    ) -> Result<Vec<String>, Error> {
        Ok(self.addrs.get(addr).cloned().unwrap_or_default())
    }
}

/// [Resolver] that always fails.
#[cfg(test)]
pub(crate) struct FailingResolver;

#[cfg(test)]
impl Resolver for FailingResolver {
    fn lookup_host(
        &self,
        _host: &str
    ) -> Result<Vec<IpAddr>, Error> {
        Err(Error::new(ErrorKind::NotFound, "no such host"))
    }

    fn lookup_addr(
        &self,
        _addr: &IpAddr
    ) -> Result<Vec<String>, Error> {
        Err(Error::new(ErrorKind::NotFound, "no such address"))
    }
}

#[test]
fn test_canonicalize_no_addrs() {
    let resolver = FixedResolver::default();
    let host = canonicalize(&resolver, "proxy.corp.example")
        .expect("Expected success");

    assert_eq!(host, "proxy.corp.example");
}

#[test]
fn test_canonicalize_no_names() {
    let mut resolver = FixedResolver::default();

    resolver.hosts.insert(
        String::from("proxy"),
        vec![IpAddr::from([10, 0, 0, 1])]
    );

    let host = canonicalize(&resolver, "proxy").expect("Expected success");

    assert_eq!(host, "proxy");
}

#[test]
fn test_canonicalize_strips_root() {
    let addr = IpAddr::from([10, 0, 0, 1]);
    let mut resolver = FixedResolver::default();

    resolver.hosts.insert(String::from("proxy"), vec![addr]);
    resolver.addrs.insert(
        addr,
        vec![
            String::from("host.example.com."),
            String::from("other.example.com.")
        ]
    );

    let host = canonicalize(&resolver, "proxy").expect("Expected success");

    assert_eq!(host, "host.example.com");
}

#[test]
fn test_canonicalize_first_addr_only() {
    let first = IpAddr::from([10, 0, 0, 1]);
    let second = IpAddr::from([10, 0, 0, 2]);
    let mut resolver = FixedResolver::default();

    resolver.hosts.insert(String::from("proxy"), vec![first, second]);
    resolver
        .addrs
        .insert(second, vec![String::from("second.example.com.")]);

    let host = canonicalize(&resolver, "proxy").expect("Expected success");

    assert_eq!(host, "proxy");
}

#[test]
fn test_canonicalize_error() {
    match canonicalize(&FailingResolver, "proxy") {
        Err(NegotiateError::Resolve { host, error }) => {
            assert_eq!(host, "proxy");
            assert_eq!(error.to_string(), "no such host");
        }
        res => panic!("Expected resolve error, got {:?}", res)
    }
}

#[test]
fn test_proxy_principal() {
    let addr = IpAddr::from([10, 0, 0, 1]);
    let mut resolver = FixedResolver::default();

    resolver.hosts.insert(String::from("proxy"), vec![addr]);
    resolver
        .addrs
        .insert(addr, vec![String::from("proxy01.corp.example.")]);

    let spn =
        proxy_principal(&resolver, "proxy", true).expect("Expected success");

    assert_eq!(spn.to_string(), "HTTP/proxy01.corp.example");
    assert_eq!(spn.hostbased(), "HTTP@proxy01.corp.example");

    let spn =
        proxy_principal(&resolver, "proxy", false).expect("Expected success");

    assert_eq!(spn.to_string(), "HTTP/proxy");
    assert_eq!(spn.host(), "proxy");
    assert_eq!(spn.service(), "HTTP");
}
