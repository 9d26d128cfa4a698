/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2023 Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use snafu::prelude::*;

/// Errors raised while configuring a phase or a trajectory.
///
/// These are always raised synchronously, either by the setter receiving the invalid value or by
/// `initialize`, and are fatal to the run.
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("invalid {field} = {value}, expected {expected}"))]
    InvalidValue {
        field: &'static str,
        value: String,
        expected: String,
    },
    #[snafu(display("unsupported {field} `{value}`, supported options are {supported}"))]
    UnsupportedOption {
        field: &'static str,
        value: String,
        supported: String,
    },
    #[snafu(display(
        "size mismatch: {left} has {left_len} entries but {right} has {right_len} entries"
    ))]
    SizeMismatch {
        left: &'static str,
        left_len: usize,
        right: &'static str,
        right_len: usize,
    },
    #[snafu(display("invalid mesh: {reason}"))]
    InvalidMesh { reason: String },
    #[snafu(display("{what} must be configured before {action}"))]
    MissingConfiguration {
        what: &'static str,
        action: &'static str,
    },
    #[snafu(display("{what} must be initialized before {action}"))]
    NotInitialized {
        what: &'static str,
        action: &'static str,
    },
    #[snafu(display("unknown unit `{name}`"))]
    UnknownUnit { name: String },
    #[snafu(display("could not read configuration {path}: {msg}"))]
    ConfigFile { path: String, msg: String },
}

/// Error returned by user path and point functions.
///
/// The context selectors are public so that user code can write
/// `OutOfDomainSnafu { msg: "p <= 0" }.fail()`.
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum UserFunctionError {
    /// The function cannot be evaluated at the provided inputs (e.g. a degenerate orbit).
    #[snafu(display("input out of domain: {msg}"))]
    OutOfDomain { msg: String },
    /// Any other failure of the user code.
    #[snafu(display("{msg}"))]
    Failed { msg: String },
    /// A phase index outside of the trajectory was requested from a point function input.
    #[snafu(display("phase {phase} requested but the trajectory has {num_phases} phases"))]
    UnknownPhase { phase: usize, num_phases: usize },
}

/// Errors raised while evaluating the transcribed problem at a decision vector.
///
/// These are locally recoverable: the NLP adapter turns them into an "evaluation failed" answer
/// so that the solver may try another iterate.
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EvaluationError {
    #[snafu(display("path function failed in phase {phase} at node {node}: {source}"))]
    UserFunction {
        phase: usize,
        node: usize,
        source: UserFunctionError,
    },
    #[snafu(display("path function panicked in phase {phase} at node {node}: {msg}"))]
    UserPanic {
        phase: usize,
        node: usize,
        msg: String,
    },
    #[snafu(display("path function returned a non-finite {quantity} in phase {phase} at node {node}"))]
    NonFinite {
        phase: usize,
        node: usize,
        quantity: &'static str,
    },
    #[snafu(display("path function set {quantity} with {actual} values in phase {phase} at node {node}, expected {expected}"))]
    OutputSize {
        phase: usize,
        node: usize,
        quantity: &'static str,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("{failed} of {total} nodes failed in phase {phase}, first failure: {first}"))]
    NodesFailed {
        phase: usize,
        failed: usize,
        total: usize,
        first: String,
    },
    #[snafu(display("point function failed: {source}"))]
    PointFunction { source: UserFunctionError },
    #[snafu(display("point function panicked: {msg}"))]
    PointPanic { msg: String },
    #[snafu(display("point function returned an invalid {quantity}: {msg}"))]
    PointOutput { quantity: &'static str, msg: String },
    #[snafu(display("decision vector has {actual} entries, expected {expected}"))]
    DecisionVectorSize { expected: usize, actual: usize },
    #[snafu(display("solver buffer for the {quantity} has {actual} entries, expected {expected}"))]
    BufferSize {
        quantity: &'static str,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("{actual} constraint multipliers provided, expected {expected}"))]
    MultiplierSize { expected: usize, actual: usize },
    #[snafu(display("{action} requires an initialized trajectory"))]
    Uninitialized { action: &'static str },
}

/// Top level error of this crate.
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CollocationError {
    #[snafu(display("configuration error: {source}"))]
    Configuration { source: ConfigError },
    #[snafu(display("evaluation error: {source}"))]
    Evaluation { source: EvaluationError },
}

impl From<ConfigError> for CollocationError {
    fn from(source: ConfigError) -> Self {
        Self::Configuration { source }
    }
}

impl From<EvaluationError> for CollocationError {
    fn from(source: EvaluationError) -> Self {
        Self::Evaluation { source }
    }
}

/// Turns the payload of a caught panic into a readable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod ut_errors {
    use super::*;

    #[test]
    fn size_mismatch_names_both_arrays() {
        let err = SizeMismatchSnafu {
            left: "state lower bound",
            left_len: 7_usize,
            right: "state upper bound",
            right_len: 6_usize,
        }
        .build();
        let msg = format!("{err}");
        assert!(msg.contains("state lower bound has 7"));
        assert!(msg.contains("state upper bound has 6"));
    }

    #[test]
    fn panic_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(caught), "boom");
    }
}
