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

//! Kerberos security contexts through GSSAPI.
//!
//! The client principal is `username@DOMAIN`, with its keys taken
//! from the keytab in the [ProxyTarget] when one is given.  If no
//! user name is given, the default credentials (usually the ticket
//! cache) are used.  The token is produced by a single step of a
//! SPNEGO client context for the `HTTP@host` host-based service.
use std::env;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use libgssapi::context::ClientCtx;
use libgssapi::context::CtxFlags;
use libgssapi::credential::Cred;
use libgssapi::credential::CredUsage;
use libgssapi::name::Name;
use libgssapi::oid::OidSet;
use libgssapi::oid::GSS_MECH_KRB5;
use libgssapi::oid::GSS_MECH_SPNEGO;
use libgssapi::oid::GSS_NT_HOSTBASED_SERVICE;
use libgssapi::oid::GSS_NT_USER_NAME;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::error;
#[cfg(feature = "log")]
use log::trace;

use crate::error::NegotiateError;
use crate::params::ProxyTarget;
use crate::secctx::ContextGuard;
use crate::secctx::OutboundToken;
use crate::secctx::SecurityContextProvider;
use crate::spn::ServicePrincipal;

const DEFAULT_KRB5_CONF: &str = "/etc/krb5.conf";
const KRB5_CONFIG_VAR: &str = "KRB5_CONFIG";
const KRB5_CLIENT_KTNAME_VAR: &str = "KRB5_CLIENT_KTNAME";

/// Environment variables overridden for the duration of one attempt.
///
/// libkrb5 reads its configuration and client keytab locations from
/// the process environment.  The previous values are put back on
/// drop.  The [env_lock](crate::env_lock) must be held for the whole
/// lifetime of an `EnvOverride`.
struct EnvOverride {
    saved: Vec<(&'static str, Option<OsString>)>
}

/// Owned client context.
///
/// A context is only ever used from one thread at a time; it moves
/// with the token that came from it.
struct OwnedCtx(#[allow(dead_code)] ClientCtx);

unsafe impl Send for OwnedCtx {}

impl EnvOverride {
    /// Set each variable to its value, or remove it if `None`.
    fn set(vars: &[(&'static str, Option<&OsStr>)]) -> EnvOverride {
        let saved = vars
            .iter()
            .map(|(name, value)| {
                let prev = env::var_os(name);

                match value {
                    Some(value) => env::set_var(name, value),
                    None => env::remove_var(name)
                }

                (*name, prev)
            })
            .collect();

        EnvOverride { saved: saved }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        for (name, prev) in self.saved.drain(..).rev() {
            match prev {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name)
            }
        }
    }
}

/// [SecurityContextProvider] for Kerberos through GSSAPI.
#[derive(Clone, Debug)]
pub struct GSSAPIProvider {
    /// Path to the Kerberos realm configuration.
    config: PathBuf
}

impl Default for GSSAPIProvider {
    #[inline]
    fn default() -> Self {
        GSSAPIProvider {
            config: PathBuf::from(DEFAULT_KRB5_CONF)
        }
    }
}

impl GSSAPIProvider {
    /// Use the Kerberos realm configuration at `config` instead of
    /// `/etc/krb5.conf`.
    #[inline]
    pub fn with_config(config: PathBuf) -> Self {
        GSSAPIProvider { config: config }
    }

    /// Get the path to the Kerberos realm configuration.
    #[inline]
    pub fn config(&self) -> &Path {
        &self.config
    }
}

/// Check that `path` can be opened for reading.
#[inline]
fn check_readable(path: &Path) -> Result<(), std::io::Error> {
    File::open(path).map(|_| ())
}

/// Get the client principal name for `target`, if it names a user.
fn client_name(target: &ProxyTarget) -> Option<String> {
    match (target.username(), target.domain()) {
        (Some(username), Some(domain))
            if !username.is_empty() && !domain.is_empty() =>
        {
            Some(format!("{}@{}", username, domain))
        }
        (Some(username), _) if !username.is_empty() => {
            Some(username.to_string())
        }
        _ => None
    }
}

/// Acquire the credential and create the client context.
fn prepare_gssapi(
    target: &ProxyTarget,
    spn: &ServicePrincipal
) -> Result<ClientCtx, NegotiateError> {
    // Prepare the mechanisms.
    let mut mechs =
        OidSet::new().map_err(|err| NegotiateError::GSSAPIError { error: err })?;

    mechs
        .add(&GSS_MECH_SPNEGO)
        .map_err(|err| NegotiateError::GSSAPIError { error: err })?;

    // Prepare the principal name.
    let cred = match client_name(target) {
        // A principal name was provided.
        Some(name) => {
            #[cfg(feature = "log")]
            trace!(target: "negotiate-gssapi",
                   "acquiring credentials for {}",
                   name);

            let name = Name::new(name.as_bytes(), Some(&GSS_NT_USER_NAME))
                .map_err(|err| NegotiateError::GSSAPIError { error: err })?;

            Cred::acquire(Some(&name), None, CredUsage::Initiate, Some(&mechs))
                .map_err(|err| NegotiateError::GSSAPIError { error: err })?
        }
        // No principal name was provided.
        None => {
            #[cfg(feature = "log")]
            trace!(target: "negotiate-gssapi",
                   "acquiring default credentials");

            Cred::acquire(None, None, CredUsage::Initiate, Some(&mechs))
                .map_err(|err| NegotiateError::GSSAPIError { error: err })?
        }
    };

    // Prepare the service name.
    let service =
        Name::new(spn.hostbased().as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE))
            .map_err(|err| NegotiateError::GSSAPIError { error: err })?;
    let service = service
        .canonicalize(Some(&GSS_MECH_KRB5))
        .map_err(|err| NegotiateError::GSSAPIError { error: err })?;

    Ok(ClientCtx::new(
        cred,
        service,
        CtxFlags::empty(),
        Some(&GSS_MECH_SPNEGO)
    ))
}

impl SecurityContextProvider for GSSAPIProvider {
    fn negotiate(
        &self,
        target: &ProxyTarget,
        spn: &ServicePrincipal
    ) -> Result<OutboundToken, NegotiateError> {
        check_readable(&self.config).map_err(|err| {
            #[cfg(feature = "log")]
            error!(target: "negotiate-gssapi",
                   "error loading {} ({})",
                   self.config.display(), err);

            NegotiateError::KrbConfig {
                path: self.config.clone(),
                error: err
            }
        })?;

        if let Some(keytab) = target.keytab() {
            check_readable(keytab).map_err(|err| {
                #[cfg(feature = "log")]
                error!(target: "negotiate-gssapi",
                       "error loading keytab {} ({})",
                       keytab.display(), err);

                NegotiateError::Keytab {
                    path: keytab.to_path_buf(),
                    error: err
                }
            })?;
        }

        let _env = crate::env_lock();
        let _vars = EnvOverride::set(&[
            (KRB5_CONFIG_VAR, Some(self.config.as_os_str())),
            (KRB5_CLIENT_KTNAME_VAR, target.keytab().map(Path::as_os_str))
        ]);
        let mut ctx = prepare_gssapi(target, spn)?;

        #[cfg(feature = "log")]
        debug!(target: "negotiate-gssapi",
               "initializing security context for {}",
               spn);

        match ctx.step(None, None) {
            Ok(Some(token)) => {
                let token = token.to_vec();

                #[cfg(feature = "log")]
                debug!(target: "negotiate-gssapi",
                       "got {} byte token for {}",
                       token.len(), spn);

                Ok(OutboundToken::new(
                    token,
                    ContextGuard::holding(OwnedCtx(ctx))
                ))
            }
            Ok(None) => {
                #[cfg(feature = "log")]
                error!(target: "negotiate-gssapi",
                       "context for {} produced no initial token",
                       spn);

                Err(NegotiateError::AuthNSetup {
                    msg: String::from("no initial token from GSSAPI context")
                })
            }
            Err(err) => {
                #[cfg(feature = "log")]
                error!(target: "negotiate-gssapi",
                       "could not initialize context for {} ({})",
                       spn, err);

                Err(NegotiateError::GSSAPIError { error: err })
            }
        }
    }
}

#[test]
fn test_client_name() {
    let target = ProxyTarget::new(String::from("proxy"), 8080);

    assert_eq!(client_name(&target), None);

    let target = target.with_user(String::from("alice"), String::from("CORP"));

    assert_eq!(client_name(&target), Some(String::from("alice@CORP")));

    let target = ProxyTarget::new(String::from("proxy"), 8080)
        .with_user(String::from("alice"), String::new());

    assert_eq!(client_name(&target), Some(String::from("alice")));
}

#[test]
fn test_missing_config() {
    let provider =
        GSSAPIProvider::with_config(PathBuf::from("/nonexistent/krb5.conf"));
    let target = ProxyTarget::new(String::from("proxy"), 8080);
    let spn = ServicePrincipal::http(String::from("proxy"));

    match provider.negotiate(&target, &spn) {
        Err(NegotiateError::KrbConfig { path, .. }) => {
            assert_eq!(path, PathBuf::from("/nonexistent/krb5.conf"))
        }
        res => panic!("Expected config error, got {:?}", res)
    }
}

#[test]
fn test_missing_keytab() {
    // Any readable file stands in for the configuration.
    let provider = GSSAPIProvider::with_config(PathBuf::from("Cargo.toml"));
    let target = ProxyTarget::new(String::from("proxy"), 8080)
        .with_user(String::from("alice"), String::from("CORP"))
        .with_keytab(PathBuf::from("/nonexistent/alice.keytab"));
    let spn = ServicePrincipal::http(String::from("proxy"));

    match provider.negotiate(&target, &spn) {
        Err(NegotiateError::Keytab { path, .. }) => {
            assert_eq!(path, PathBuf::from("/nonexistent/alice.keytab"))
        }
        res => panic!("Expected keytab error, got {:?}", res)
    }
}

#[test]
fn test_env_override_restores() {
    const SET_VAR: &str = "NEGOTIATE_TUNNEL_TEST_PREVIOUSLY_SET";
    const UNSET_VAR: &str = "NEGOTIATE_TUNNEL_TEST_PREVIOUSLY_UNSET";

    let _env = crate::env_lock();

    env::set_var(SET_VAR, "before");
    env::remove_var(UNSET_VAR);

    {
        let _vars = EnvOverride::set(&[
            (SET_VAR, None),
            (UNSET_VAR, Some(OsStr::new("/etc/alice.keytab")))
        ]);

        assert_eq!(env::var_os(SET_VAR), None);
        assert_eq!(
            env::var_os(UNSET_VAR),
            Some(OsString::from("/etc/alice.keytab"))
        );
    }

    assert_eq!(env::var_os(SET_VAR), Some(OsString::from("before")));
    assert_eq!(env::var_os(UNSET_VAR), None);

    env::remove_var(SET_VAR);
}

#[test]
fn test_owned_ctx_is_send() {
    fn assert_send<T: Send>() {}

    assert_send::<OwnedCtx>();
    assert_send::<OutboundToken>();
}
