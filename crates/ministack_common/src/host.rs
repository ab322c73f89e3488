//! Capability interfaces between the engine and the host.
//!
//! The planner and executor only ever see these traits. Production wiring is
//! in [`crate::adapters`]; tests use [`crate::fake::FakeHost`].

use crate::declared::{ComponentKind, ComponentSpec};
use crate::error::{ActionFailure, ProbeUnavailable};
use crate::model::ModelName;
use crate::probe::Observation;
use std::collections::BTreeSet;

/// Remediation for a service whose first start needs a human (Docker Desktop)
pub const MANUAL_LAUNCH_HINT: &str = "launch the application and re-run";

/// One subsystem's read and mutate operations.
///
/// `probe` must never change host state. The mutating calls must be safe to
/// repeat: the executor re-probes before calling them, but an operator may
/// re-run after a partial failure at any point.
pub trait ComponentAdapter {
    /// Observe installed/version/running. "Not installed" is an `Ok`.
    fn probe(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable>;

    fn install(&self, component: &ComponentSpec) -> Result<(), ActionFailure>;

    /// Bring a service-backed component to its running state
    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure>;

    fn upgrade(&self, component: &ComponentSpec) -> Result<(), ActionFailure>;
}

/// The model runtime's own model store
pub trait ModelRegistry {
    /// Models currently on the host, in canonical form
    fn list(&self) -> Result<BTreeSet<ModelName>, ProbeUnavailable>;

    fn pull(&self, name: &ModelName) -> Result<(), ActionFailure>;

    fn remove(&self, name: &ModelName) -> Result<(), ActionFailure>;
}

/// Everything the engine may touch on one host
pub trait Host {
    fn adapter(&self, kind: ComponentKind) -> &dyn ComponentAdapter;

    fn models(&self) -> &dyn ModelRegistry;
}
