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

//! Diagnostic tracing of negotiation steps.
//!
//! A [TraceSink] receives one record when each negotiation step is
//! entered and one when it is left.  Records are informational only;
//! the authoritative outcome of a negotiation is always the returned
//! error value.
use std::fmt::Display;
use std::fmt::Formatter;

#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::warn;

use crate::error::NegotiateError;

/// Steps of a negotiation attempt.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum NegotiateStep {
    /// Dialing the proxy.
    Dial,
    /// Building the service principal name.
    Resolve,
    /// Obtaining a token from the security context provider.
    Context,
    /// Writing the CONNECT request.
    Inject,
    /// Reading and checking the proxy's reply.
    Validate,
    /// The tunnel is established.
    Established
}

/// Outcome reported for a step.
#[derive(Debug)]
pub enum StepOutcome<'a> {
    /// The step was entered.
    Enter,
    /// The step succeeded.
    Success,
    /// The step failed.
    Failure(&'a NegotiateError)
}

/// Receiver for diagnostic trace records.
pub trait TraceSink: Send + Sync {
    /// Record `outcome` for `step`.
    fn record(
        &self,
        step: NegotiateStep,
        outcome: StepOutcome<'_>
    );
}

/// [TraceSink] that discards all records.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTrace;

#[cfg(feature = "log")]
/// [TraceSink] that forwards records to the [log] facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTrace;

impl TraceSink for NoTrace {
    #[inline]
    fn record(
        &self,
        _step: NegotiateStep,
        _outcome: StepOutcome<'_>
    ) {
    }
}

#[cfg(feature = "log")]
impl TraceSink for LogTrace {
    fn record(
        &self,
        step: NegotiateStep,
        outcome: StepOutcome<'_>
    ) {
        match outcome {
            StepOutcome::Enter => {
                debug!(target: "negotiate-trace", "negotiate> {}: begin", step)
            }
            StepOutcome::Success => {
                debug!(target: "negotiate-trace", "negotiate> {}: ok", step)
            }
            StepOutcome::Failure(err) => {
                warn!(target: "negotiate-trace",
                      "negotiate> {}: failed ({})",
                      step, err)
            }
        }
    }
}

impl Display for NegotiateStep {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NegotiateStep::Dial => write!(f, "dial"),
            NegotiateStep::Resolve => write!(f, "SPN resolution"),
            NegotiateStep::Context => write!(f, "context negotiation"),
            NegotiateStep::Inject => write!(f, "token injection"),
            NegotiateStep::Validate => write!(f, "response validation"),
            NegotiateStep::Established => write!(f, "established")
        }
    }
}

#[cfg(test)]
use std::sync::Mutex;

/// [TraceSink] that keeps every record, for checking step order.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingTrace {
    records: Mutex<Vec<(NegotiateStep, String)>>
}

#[cfg(test)]
impl RecordingTrace {
    pub(crate) fn records(&self) -> Vec<(NegotiateStep, String)> {
        self.records.lock().expect("Expected lock").clone()
    }
}

#[cfg(test)]
impl TraceSink for RecordingTrace {
    fn record(
        &self,
        step: NegotiateStep,
        outcome: StepOutcome<'_>
    ) {
        let outcome = match outcome {
            StepOutcome::Enter => String::from("enter"),
            StepOutcome::Success => String::from("ok"),
            StepOutcome::Failure(_) => String::from("fail")
        };

        self.records
            .lock()
            .expect("Expected lock")
            .push((step, outcome))
    }
}

#[test]
fn test_step_display() {
    assert_eq!(NegotiateStep::Resolve.to_string(), "SPN resolution");
    assert_eq!(NegotiateStep::Inject.to_string(), "token injection");
}

#[test]
fn test_recording_trace() {
    let trace = RecordingTrace::default();
    let err = NegotiateError::Closed;

    trace.record(NegotiateStep::Validate, StepOutcome::Enter);
    trace.record(NegotiateStep::Validate, StepOutcome::Failure(&err));
    NoTrace.record(NegotiateStep::Validate, StepOutcome::Success);

    assert_eq!(
        trace.records(),
        vec![
            (NegotiateStep::Validate, String::from("enter")),
            (NegotiateStep::Validate, String::from("fail"))
        ]
    );
}
