//! ministack common - reconciliation engine for a single-host local LLM stack
//!
//! Declared state (YAML) -> probe -> plan -> execute -> verify.
//! The host itself is the only source of truth: nothing is remembered between runs.

pub mod adapters;
pub mod command_exec;
pub mod declared;
pub mod error;
pub mod executor;
pub mod fake;
pub mod host;
pub mod model;
pub mod planner;
pub mod preflight;
pub mod probe;
pub mod reconcile;
pub mod safety;
pub mod settings;
pub mod verifier;

pub use adapters::SystemHost;
pub use declared::{ComponentKind, ComponentSpec, DeclaredState, DesiredVersion};
pub use error::{ActionFailure, ConfigurationError, MinistackError, ProbeUnavailable};
pub use executor::{ExecutionReport, ExecutionResult, ExecutionStatus, Executor, Halt, RunControl};
pub use host::{ComponentAdapter, Host, ModelRegistry, MANUAL_LAUNCH_HINT};
pub use model::{ModelEntry, ModelName, ModelState};
pub use planner::{plan, Blocked, Plan, ReconciliationAction, Target, Verb};
pub use probe::{Observation, ObservedState, Probe, RegistryObservation};
pub use reconcile::{Outcome, ReconcileReport, Reconciler};
pub use safety::{SafetySwitch, SafetySwitches};
pub use settings::Settings;
pub use verifier::{verify, VerificationEntry, VerificationReport, VerificationStatus};
