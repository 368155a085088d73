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

//! Negotiate security contexts through the Windows SSPI.
//!
//! Explicit credentials are used when the [ProxyTarget] supplies a
//! domain, user name, and password; otherwise the credentials of the
//! current process identity are used.
use std::ffi::c_void;

#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::error;
#[cfg(feature = "log")]
use log::trace;
use windows::core::w;
use windows::core::PCWSTR;
use windows::Win32::Security::Authentication::Identity::AcquireCredentialsHandleW;
use windows::Win32::Security::Authentication::Identity::DeleteSecurityContext;
use windows::Win32::Security::Authentication::Identity::FreeCredentialsHandle;
use windows::Win32::Security::Authentication::Identity::InitializeSecurityContextW;
use windows::Win32::Security::Authentication::Identity::SecBuffer;
use windows::Win32::Security::Authentication::Identity::SecBufferDesc;
use windows::Win32::Security::Authentication::Identity::ISC_REQ_CONNECTION;
use windows::Win32::Security::Authentication::Identity::SECBUFFER_TOKEN;
use windows::Win32::Security::Authentication::Identity::SECBUFFER_VERSION;
use windows::Win32::Security::Authentication::Identity::SECPKG_CRED_OUTBOUND;
use windows::Win32::Security::Authentication::Identity::SECURITY_NATIVE_DREP;
use windows::Win32::Security::Authentication::Identity::SEC_WINNT_AUTH_IDENTITY_UNICODE;
use windows::Win32::Security::Authentication::Identity::SEC_WINNT_AUTH_IDENTITY_W;
use windows::Win32::Security::Credentials::SecHandle;

use crate::error::NegotiateError;
use crate::params::ProxyTarget;
use crate::secctx::ContextGuard;
use crate::secctx::OutboundToken;
use crate::secctx::SecurityContextProvider;
use crate::spn::ServicePrincipal;

/// Upper bound on the size of a Negotiate token.
const MAX_TOKEN_SIZE: usize = 48256;

/// [SecurityContextProvider] for the Windows `Negotiate` package.
#[derive(Clone, Copy, Debug, Default)]
pub struct SSPIProvider;

/// Owned credential handle.
struct CredHandle(SecHandle);

/// Owned context handle.
struct CtxtHandle(SecHandle);

/// Explicit user credentials as UTF-16, kept alive across the
/// credential acquisition call.
struct UserIdentity {
    user: Vec<u16>,
    domain: Vec<u16>,
    password: Vec<u16>
}

#[inline]
fn is_unset(handle: &SecHandle) -> bool {
    handle.dwLower == 0 && handle.dwUpper == 0
}

#[inline]
fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

impl Drop for CredHandle {
    fn drop(&mut self) {
        if !is_unset(&self.0) {
            #[cfg(feature = "log")]
            trace!(target: "negotiate-sspi",
                   "releasing credential handle");

            let _ = unsafe { FreeCredentialsHandle(&self.0) };
        }
    }
}

impl Drop for CtxtHandle {
    fn drop(&mut self) {
        if !is_unset(&self.0) {
            #[cfg(feature = "log")]
            trace!(target: "negotiate-sspi",
                   "releasing context handle");

            let _ = unsafe { DeleteSecurityContext(&self.0) };
        }
    }
}

impl UserIdentity {
    /// Get explicit credentials from `target`, if all of domain,
    /// user name, and password are present.
    fn from_target(target: &ProxyTarget) -> Option<UserIdentity> {
        match (target.domain(), target.username(), target.password()) {
            (Some(domain), Some(user), Some(password))
                if !domain.is_empty() &&
                    !user.is_empty() &&
                    !password.is_empty() =>
            {
                Some(UserIdentity {
                    user: wide(user),
                    domain: wide(domain),
                    password: wide(password)
                })
            }
            _ => None
        }
    }

    fn auth_identity(&mut self) -> SEC_WINNT_AUTH_IDENTITY_W {
        SEC_WINNT_AUTH_IDENTITY_W {
            User: self.user.as_mut_ptr(),
            UserLength: self.user.len() as u32,
            Domain: self.domain.as_mut_ptr(),
            DomainLength: self.domain.len() as u32,
            Password: self.password.as_mut_ptr(),
            PasswordLength: self.password.len() as u32,
            Flags: SEC_WINNT_AUTH_IDENTITY_UNICODE
        }
    }
}

/// Acquire outbound credentials for the `Negotiate` package.
fn acquire_credentials(
    target: &ProxyTarget
) -> Result<CredHandle, NegotiateError> {
    let mut handle = CredHandle(SecHandle::default());
    let mut expiry = 0i64;
    let mut user = UserIdentity::from_target(target);
    let mut identity = user.as_mut().map(|user| user.auth_identity());
    let auth_data = identity
        .as_mut()
        .map(|identity| identity as *mut SEC_WINNT_AUTH_IDENTITY_W as *const c_void);

    #[cfg(feature = "log")]
    debug!(target: "negotiate-sspi",
           "acquiring {} credentials",
           if auth_data.is_some() { "explicit" } else { "current user" });

    unsafe {
        AcquireCredentialsHandleW(
            PCWSTR::null(),
            w!("Negotiate"),
            SECPKG_CRED_OUTBOUND,
            None,
            auth_data,
            None,
            None,
            &mut handle.0,
            Some(&mut expiry)
        )
    }
    .map_err(|err| {
        #[cfg(feature = "log")]
        error!(target: "negotiate-sspi",
               "could not acquire credentials ({})",
               err);

        NegotiateError::SSPIError {
            call: "AcquireCredentialsHandleW",
            error: err
        }
    })?;

    Ok(handle)
}

/// Create a client context for `spn`, returning it with its initial
/// token.
fn initialize_context(
    cred: &CredHandle,
    spn: &ServicePrincipal
) -> Result<(CtxtHandle, Vec<u8>), NegotiateError> {
    let target_name: Vec<u16> = spn
        .to_string()
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let mut buf = vec![0u8; MAX_TOKEN_SIZE];
    let mut out = SecBuffer {
        cbBuffer: buf.len() as u32,
        BufferType: SECBUFFER_TOKEN,
        pvBuffer: buf.as_mut_ptr() as *mut c_void
    };
    let mut out_desc = SecBufferDesc {
        ulVersion: SECBUFFER_VERSION,
        cBuffers: 1,
        pBuffers: &mut out
    };
    let mut ctx = CtxtHandle(SecHandle::default());
    let mut attrs = 0u32;
    let mut expiry = 0i64;
    let status = unsafe {
        InitializeSecurityContextW(
            Some(&cred.0),
            None,
            Some(target_name.as_ptr()),
            ISC_REQ_CONNECTION,
            0,
            SECURITY_NATIVE_DREP,
            None,
            0,
            Some(&mut ctx.0),
            Some(&mut out_desc),
            &mut attrs,
            Some(&mut expiry)
        )
    };

    if status.is_err() {
        let err = windows::core::Error::from(status);

        #[cfg(feature = "log")]
        error!(target: "negotiate-sspi",
               "could not initialize context for {} ({})",
               spn, err);

        return Err(NegotiateError::SSPIError {
            call: "InitializeSecurityContextW",
            error: err
        });
    }

    let len = (out.cbBuffer as usize).min(buf.len());

    buf.truncate(len);

    Ok((ctx, buf))
}

impl SecurityContextProvider for SSPIProvider {
    fn negotiate(
        &self,
        target: &ProxyTarget,
        spn: &ServicePrincipal
    ) -> Result<OutboundToken, NegotiateError> {
        let cred = acquire_credentials(target)?;
        let (ctx, token) = initialize_context(&cred, spn)?;

        #[cfg(feature = "log")]
        debug!(target: "negotiate-sspi",
               "got {} byte token for {}",
               token.len(), spn);

        // The context must go before the credential it was made from.
        Ok(OutboundToken::new(
            token,
            ContextGuard::new(move || {
                drop(ctx);
                drop(cred);
            })
        ))
    }
}

#[test]
fn test_user_identity_requires_all() {
    let target = ProxyTarget::new(String::from("proxy"), 8080)
        .with_user(String::from("alice"), String::from("CORP"));

    assert!(UserIdentity::from_target(&target).is_none());

    let target = target.with_password(String::from("secret"));
    let mut identity =
        UserIdentity::from_target(&target).expect("Expected identity");
    let auth = identity.auth_identity();

    assert_eq!(auth.UserLength, 5);
    assert_eq!(auth.DomainLength, 4);
    assert_eq!(auth.PasswordLength, 6);
}

#[test]
fn test_handles_are_send() {
    fn assert_send<T: Send>() {}

    assert_send::<CredHandle>();
    assert_send::<CtxtHandle>();
}
