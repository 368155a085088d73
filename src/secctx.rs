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

//! Platform-independent security context interface.
//!
//! A [SecurityContextProvider] acquires credentials for the client,
//! initializes a security context for a service principal, and hands
//! back the initial token as an [OutboundToken].  The token owns a
//! [ContextGuard] that releases the credential and context exactly
//! once, when the token is dropped or explicitly released.
//!
//! Two providers exist: [GSSAPIProvider](crate::gssapi::GSSAPIProvider)
//! for Kerberos through GSSAPI, and
//! [SSPIProvider](crate::sspi::SSPIProvider) for the Windows security
//! support provider interface.  [system_provider] picks the one for
//! the platform.
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;

use crate::error::NegotiateError;
use crate::params::ProxyTarget;
use crate::spn::ServicePrincipal;

/// Source of Negotiate tokens.
///
/// Each call creates its own credential and context; nothing may be
/// shared between calls.  Providers are shared between threads
/// opening tunnels concurrently.
pub trait SecurityContextProvider: Send + Sync {
    /// Get an initial Negotiate token for `spn` on behalf of the
    /// client described by `target`.
    fn negotiate(
        &self,
        target: &ProxyTarget,
        spn: &ServicePrincipal
    ) -> Result<OutboundToken, NegotiateError>;
}

/// Releases the state behind a security context once.
pub struct ContextGuard {
    release: Option<Box<dyn FnOnce() + Send>>
}

/// Initial token produced by a [SecurityContextProvider].
pub struct OutboundToken {
    /// Raw token bytes.
    token: Vec<u8>,
    /// Guard for the context that produced the token.
    guard: ContextGuard
}

impl ContextGuard {
    /// Create a `ContextGuard` that runs `release` when dropped.
    #[inline]
    pub fn new<F>(release: F) -> ContextGuard
    where
        F: FnOnce() + Send + 'static {
        ContextGuard {
            release: Some(Box::new(release))
        }
    }

    /// Create a `ContextGuard` with nothing to release.
    #[inline]
    pub fn empty() -> ContextGuard {
        ContextGuard { release: None }
    }

    /// Create a `ContextGuard` that drops `state` when dropped.
    #[inline]
    pub fn holding<T>(state: T) -> ContextGuard
    where
        T: Send + 'static {
        ContextGuard::new(move || drop(state))
    }

    /// Release the context now.
    #[inline]
    pub fn release(mut self) {
        self.run()
    }

    #[inline]
    fn run(&mut self) {
        if let Some(release) = self.release.take() {
            release()
        }
    }
}

impl Drop for ContextGuard {
    #[inline]
    fn drop(&mut self) {
        self.run()
    }
}

impl OutboundToken {
    /// Create an `OutboundToken` from its components.
    #[inline]
    pub fn new(
        token: Vec<u8>,
        guard: ContextGuard
    ) -> OutboundToken {
        OutboundToken {
            token: token,
            guard: guard
        }
    }

    /// Get the raw token.
    #[inline]
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Release the underlying context now.
    #[inline]
    pub fn release(self) {
        self.guard.release()
    }
}

impl Debug for ContextGuard {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "ContextGuard {{ pending: {} }}",
            self.release.is_some()
        )
    }
}

impl Debug for OutboundToken {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "OutboundToken {{ len: {} }}", self.token.len())
    }
}

/// Provider that fails every request, for platforms with none.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProvider;

impl SecurityContextProvider for NoProvider {
    #[inline]
    fn negotiate(
        &self,
        _target: &ProxyTarget,
        _spn: &ServicePrincipal
    ) -> Result<OutboundToken, NegotiateError> {
        Err(NegotiateError::NoProvider)
    }
}

#[cfg(windows)]
/// Get the security context provider for this platform.
#[inline]
pub fn system_provider() -> Arc<dyn SecurityContextProvider> {
    Arc::new(crate::sspi::SSPIProvider::default())
}

#[cfg(all(not(windows), feature = "gssapi"))]
/// Get the security context provider for this platform.
#[inline]
pub fn system_provider() -> Arc<dyn SecurityContextProvider> {
    Arc::new(crate::gssapi::GSSAPIProvider::default())
}

#[cfg(all(not(windows), not(feature = "gssapi")))]
/// Get the security context provider for this platform.
#[inline]
pub fn system_provider() -> Arc<dyn SecurityContextProvider> {
    Arc::new(NoProvider)
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::atomic::Ordering;

/// Provider returning a fixed token and counting releases.
#[cfg(test)]
pub(crate) struct StubProvider {
    pub(crate) token: Vec<u8>,
    pub(crate) acquired: Arc<AtomicUsize>,
    pub(crate) released: Arc<AtomicUsize>,
    pub(crate) fail: bool
}

#[cfg(test)]
impl StubProvider {
    pub(crate) fn new(token: &[u8]) -> StubProvider {
        StubProvider {
            token: token.to_vec(),
            acquired: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
            fail: false
        }
    }

    pub(crate) fn failing() -> StubProvider {
        let mut out = StubProvider::new(&[]);

        out.fail = true;
        out
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SecurityContextProvider for StubProvider {
    fn negotiate(
        &self,
        _target: &ProxyTarget,
        _spn: &ServicePrincipal
    ) -> Result<OutboundToken, NegotiateError> {
        if self.fail {
            Err(NegotiateError::AuthNSetup {
                msg: String::from("no credentials")
            })
        } else {
            let released = self.released.clone();

            self.acquired.fetch_add(1, Ordering::SeqCst);

            Ok(OutboundToken::new(
                self.token.clone(),
                ContextGuard::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
            ))
        }
    }
}

#[test]
fn test_guard_releases_on_drop() {
    let provider = StubProvider::new(&[0xde, 0xad]);
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let spn = ServicePrincipal::http(String::from("proxy"));
    let token = provider.negotiate(&target, &spn).expect("Expected success");

    assert_eq!(token.token(), &[0xde, 0xad]);
    assert_eq!(provider.released(), 0);

    drop(token);

    assert_eq!(provider.acquired(), 1);
    assert_eq!(provider.released(), 1);
}

#[test]
fn test_guard_explicit_release_once() {
    let provider = StubProvider::new(&[0x01]);
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let spn = ServicePrincipal::http(String::from("proxy"));
    let token = provider.negotiate(&target, &spn).expect("Expected success");

    token.release();

    assert_eq!(provider.released(), 1);
}

#[test]
fn test_guard_holding() {
    let count = Arc::new(AtomicUsize::new(0));

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let guard = ContextGuard::holding(Counted(count.clone()));

    assert_eq!(count.load(Ordering::SeqCst), 0);

    drop(guard);

    assert_eq!(count.load(Ordering::SeqCst), 1);

    ContextGuard::empty().release();
}

#[test]
fn test_no_provider() {
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let spn = ServicePrincipal::http(String::from("proxy"));

    match NoProvider.negotiate(&target, &spn) {
        Err(NegotiateError::NoProvider) => {}
        res => panic!("Expected no provider error, got {:?}", res)
    }
}
