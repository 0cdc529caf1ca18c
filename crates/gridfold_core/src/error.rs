//! Failure taxonomy shared by the sweep, the analyzer and the transient engine.
//!
//! None of these are used for ordinary control flow. A sweep that runs into
//! [`NonConvergence`] ends normally and reports it in its stop reason; a
//! [`BuildFailure`] inside a sweep only clears that point's stability flag.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum NonConvergenceReason {
    #[error("iteration limit reached")]
    IterationLimit,
    #[error("power flow Jacobian is singular")]
    SingularJacobian,
    #[error("mismatch became non-finite")]
    Diverged,
    #[error("time budget exhausted")]
    Timeout,
}

/// The power flow could not find an operating point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("power flow did not converge after {iterations} iterations (mismatch {mismatch:e}): {reason}")]
pub struct NonConvergence {
    pub reason: NonConvergenceReason,
    pub iterations: usize,
    pub mismatch: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum BuildFailureReason {
    #[error("model has no machines")]
    NoMachines,
    #[error("operating point does not satisfy the network equations (residual {0:e})")]
    UnsolvedOperatingPoint(f64),
    #[error("machine is connected to the slack bus")]
    MachineAtSlack,
    #[error("unknown generator {0}")]
    UnknownGenerator(String),
    #[error("invalid parameter {0}")]
    InvalidParameter(String),
    #[error("algebraic Jacobian is singular")]
    SingularAlgebraicJacobian,
    #[error("non-finite entry in {0}")]
    NonFinite(String),
    #[error("eigen-decomposition failed")]
    Eigen,
}

/// The linear model could not be assembled at an operating point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub struct BuildFailure {
    pub component: Option<String>,
    pub reason: BuildFailureReason,
}

impl BuildFailure {
    pub fn new(reason: BuildFailureReason) -> Self {
        Self {
            component: None,
            reason,
        }
    }

    pub fn at(component: impl Into<String>, reason: BuildFailureReason) -> Self {
        Self {
            component: Some(component.into()),
            reason,
        }
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(component) => write!(f, "cannot build model at {}: {}", component, self.reason),
            None => write!(f, "cannot build model: {}", self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum IntegrationFailureReason {
    #[error("step size fell below the minimum")]
    StepSizeUnderflow,
    #[error("step limit of {0} reached")]
    StepLimit(usize),
    #[error("time budget exhausted")]
    Timeout,
    #[error("algebraic re-initialization after the perturbation did not converge")]
    Reinitialization,
    #[error("unknown state {0}")]
    UnknownState(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Build(#[from] BuildFailure),
}

/// The transient run could not reach its horizon within tolerances.
///
/// `state` holds the last accepted differential and algebraic values by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("integration failed at t = {time} (h = {step_size:e}): {reason}")]
pub struct IntegrationFailure {
    pub time: f64,
    pub step_size: f64,
    pub reason: IntegrationFailureReason,
    pub state: Vec<(String, f64)>,
}

impl IntegrationFailure {
    pub(crate) fn before_start(reason: IntegrationFailureReason) -> Self {
        Self {
            time: 0.0,
            step_size: 0.0,
            reason,
            state: Vec::new(),
        }
    }
}

impl From<BuildFailure> for IntegrationFailure {
    fn from(failure: BuildFailure) -> Self {
        Self::before_start(IntegrationFailureReason::Build(failure))
    }
}
