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

//! HTTP CONNECT tunnels through Negotiate-authenticating proxies.
//!
//! This package establishes tunnels through HTTP proxies that require
//! SPNEGO/Kerberos ("Negotiate") authentication, as described in
//! [RFC 4559](https://www.rfc-editor.org/rfc/rfc4559).  The following
//! functionality is provided:
//!
//! * Canonicalization of proxy host names into `HTTP/<host>` service principal
//!   names.
//!
//! * Initial Negotiate tokens from Kerberos through GSSAPI, or from the Windows
//!   SSPI `Negotiate` package.
//!
//! * A single authenticated `CONNECT` request, and validation of the reply.
//!
//! * A [Tunnel](crate::tunnel::Tunnel) stream ([Read](std::io::Read),
//!   [Write](std::io::Write)) over the established connection.
//!
//! The following functionality is *not* implemented:
//!
//! * Multi-round Negotiate exchanges
//!
//! * Basic, Digest, or NTLM authentication
//!
//! # Usage
//!
//! The negotiation uses the protocol state-machine abstraction
//! provided by
//! [RawMachineState](constellation_streams::state_machine::RawStateMachine).
//! Most callers will not drive it directly, but will use a
//! [Negotiator](crate::tunnel::Negotiator):
//!
//! 1. Describe the proxy and client identity with a
//!    [ProxyTarget](crate::params::ProxyTarget).
//!
//! 1. Create a [Negotiator](crate::tunnel::Negotiator), usually with the
//!    [system_provider](crate::secctx::system_provider) for the platform.
//!
//! 1. Call [connect](crate::tunnel::Negotiator::connect) with the destination
//!    and a function that dials the proxy, or
//!    [connect_tcp](crate::tunnel::Negotiator::connect_tcp).
//!
//! 1. This yields a [Tunnel](crate::tunnel::Tunnel) on success, or a
//!    [TunnelError](crate::error::TunnelError) holding the connection and the
//!    failure.  The connection is never closed on the caller's behalf.
//!
//! Progress through each step can be observed by supplying a
//! [TraceSink](crate::trace::TraceSink).
#![allow(clippy::redundant_field_names)]
#![allow(clippy::upper_case_acronyms)]
mod proto;

pub mod error;
#[cfg(all(feature = "gssapi", not(windows)))]
pub mod gssapi;
pub mod params;
pub mod secctx;
pub mod spn;
#[cfg(windows)]
pub mod sspi;
pub mod state;
pub mod trace;
pub mod tunnel;

pub use crate::proto::status_text;
pub use crate::proto::ConnectReply;

use std::sync::Mutex;
use std::sync::MutexGuard;

/// Guards the process environment.
///
/// Held while the Kerberos backend overrides environment variables,
/// and by the system resolver, whose lookups read the environment.
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Take the process environment lock.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    // Poisoning leaves nothing to repair; the environment is restored
    // by whoever held the lock as it unwound.
    ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
