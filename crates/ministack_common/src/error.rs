//! Error types for ministack.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// The declared-state document is malformed or invalid.
///
/// Every problem found is collected so the operator can fix them in one pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("declared state in {origin} is invalid: {}", .problems.join("; "))]
pub struct ConfigurationError {
    pub origin: String,
    pub problems: Vec<String>,
}

impl ConfigurationError {
    pub fn new(origin: impl Into<String>, problems: Vec<String>) -> Self {
        Self {
            origin: origin.into(),
            problems,
        }
    }

    pub fn single(origin: impl Into<String>, problem: impl Into<String>) -> Self {
        Self::new(origin, vec![problem.into()])
    }
}

/// A subsystem's read interface could not answer.
///
/// Distinct from "not installed", which is a valid observation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{target}: probe unavailable: {reason}")]
pub struct ProbeUnavailable {
    pub target: String,
    pub reason: String,
}

impl ProbeUnavailable {
    pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a mutating adapter call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionFailure {
    /// Operator can likely fix it and re-run (network hiccup, failed download)
    #[error("{0}")]
    Recoverable(String),

    /// Desired state needs an out-of-band human step before re-running
    #[error("{reason}")]
    ManualIntervention { reason: String, hint: String },
}

impl ActionFailure {
    pub fn recoverable(message: impl Into<String>) -> Self {
        ActionFailure::Recoverable(message.into())
    }

    pub fn manual(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        ActionFailure::ManualIntervention {
            reason: reason.into(),
            hint: hint.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MinistackError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Settings error in {path}: {message}")]
    Settings { path: PathBuf, message: String },

    #[error("Preflight refused: {0}")]
    Preflight(String),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MinistackError {
    /// Stable numeric code, used in JSON output and the run log
    pub fn code(&self) -> i32 {
        match self {
            MinistackError::Configuration(_) => -32010,
            MinistackError::Settings { .. } => -32011,
            MinistackError::Preflight(_) => -32012,
            MinistackError::Io { .. } => -32006,
        }
    }
}
