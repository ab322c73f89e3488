//! Probe: read-only observation of the host.
//!
//! Probing is sequential; there are rarely more than a handful of components.

use crate::declared::{ComponentSpec, DeclaredState};
use crate::error::ProbeUnavailable;
use crate::host::Host;
use crate::model::ModelName;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Observed state of one component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub installed: bool,
    pub version: Option<String>,
    /// Only set for service-backed components
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Set when the component cannot reach its running state without a human
    /// step (first GUI launch, privileged helper approval). Holds the hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_manual: Option<String>,
    /// Set when the component's own query interface is down (a compose app
    /// while the Docker daemon is stopped), so `installed` is not known.
    /// Holds the reason. Planned as if absent; re-checked before each action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unconfirmed: Option<String>,
}

impl Observation {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn installed(version: Option<&str>) -> Self {
        Self {
            installed: true,
            version: version.map(str::to_string),
            ..Self::default()
        }
    }

    /// State unknown because whatever answers for it is down
    pub fn unconfirmed(reason: impl Into<String>) -> Self {
        Self {
            unconfirmed: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running == Some(true)
    }
}

/// Observed model registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegistryObservation {
    Listed { models: BTreeSet<ModelName> },
    /// The runtime is declared but not running yet, so there is nothing to
    /// ask. Planned as if empty; the executor re-checks before each action.
    Deferred { reason: String },
}

impl RegistryObservation {
    pub fn contains(&self, name: &ModelName) -> bool {
        match self {
            RegistryObservation::Listed { models } => models.contains(name),
            RegistryObservation::Deferred { .. } => false,
        }
    }
}

/// Snapshot of everything the planner needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedState {
    pub components: BTreeMap<String, Result<Observation, ProbeUnavailable>>,
    pub registry: Result<RegistryObservation, ProbeUnavailable>,
}

impl ObservedState {
    pub fn component(&self, name: &str) -> Option<&Result<Observation, ProbeUnavailable>> {
        self.components.get(name)
    }
}

pub struct Probe<'a> {
    host: &'a dyn Host,
}

impl<'a> Probe<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    pub fn component(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        let result = self.host.adapter(component.kind).probe(component);
        match &result {
            Ok(Observation {
                unconfirmed: Some(reason),
                ..
            }) => debug!("Probed {} ({}): unknown, {}", component.name, component.kind, reason),
            Ok(obs) => debug!(
                "Probed {} ({}): installed={} version={:?} running={:?}",
                component.name, component.kind, obs.installed, obs.version, obs.running
            ),
            Err(e) => warn!("{}", e),
        }
        result
    }

    /// Read the model registry, given what was observed for the runtime
    pub fn registry(
        &self,
        declared: &DeclaredState,
        runtime: Option<&Result<Observation, ProbeUnavailable>>,
    ) -> Result<RegistryObservation, ProbeUnavailable> {
        if let Some(spec) = declared.model_runtime() {
            match runtime {
                Some(Ok(obs)) if !obs.is_running() => {
                    return Ok(RegistryObservation::Deferred {
                        reason: format!("model runtime '{}' is not running", spec.name),
                    })
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(ProbeUnavailable::new(
                        "models",
                        format!("model runtime '{}' could not be probed: {}", spec.name, e.reason),
                    ))
                }
                None => {
                    return Err(ProbeUnavailable::new(
                        "models",
                        format!("model runtime '{}' was not probed", spec.name),
                    ))
                }
            }
        }

        let models = self.host.models().list()?;
        debug!("Model registry lists {} models", models.len());
        Ok(RegistryObservation::Listed { models })
    }

    /// Probe every declared component, then the registry
    pub fn observe(&self, declared: &DeclaredState) -> ObservedState {
        let components: BTreeMap<_, _> = declared
            .ordered_components()
            .map(|c| (c.name.clone(), self.component(c)))
            .collect();

        let runtime = declared
            .model_runtime()
            .and_then(|spec| components.get(&spec.name));
        let registry = self.registry(declared, runtime);
        if let Err(e) = &registry {
            warn!("{}", e);
        }

        ObservedState {
            components,
            registry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declared::{ComponentKind, ComponentSpec};
    use crate::fake::FakeHost;
    use crate::model::ModelEntry;

    fn runtime_state() -> DeclaredState {
        DeclaredState::new(
            vec![ComponentSpec::new("ollama", ComponentKind::ModelRuntime)],
            vec![ModelEntry::present("llama3.1:8b").unwrap()],
        )
        .unwrap()
    }

    #[test]
    fn test_not_installed_is_an_observation() {
        let host = FakeHost::new();
        let observed = Probe::new(&host).observe(&runtime_state());
        assert_eq!(observed.component("ollama"), Some(&Ok(Observation::absent())));
    }

    #[test]
    fn test_registry_deferred_until_runtime_runs() {
        let host = FakeHost::new();
        host.install_component("ollama", Some("0.5.7"), false);
        host.add_model("llama3.1:8b");
        let observed = Probe::new(&host).observe(&runtime_state());
        assert!(matches!(
            observed.registry,
            Ok(RegistryObservation::Deferred { .. })
        ));
    }

    #[test]
    fn test_registry_listed_when_runtime_running() {
        let host = FakeHost::new();
        host.install_component("ollama", Some("0.5.7"), true);
        host.add_model("llama3.1:8b");
        let observed = Probe::new(&host).observe(&runtime_state());
        let registry = observed.registry.unwrap();
        assert!(registry.contains(&ModelName::canonical("llama3.1:8b").unwrap()));
    }

    #[test]
    fn test_runtime_probe_failure_makes_registry_unavailable() {
        let host = FakeHost::new();
        host.fail_probe("ollama", "brew is broken");
        let observed = Probe::new(&host).observe(&runtime_state());
        assert!(observed.component("ollama").unwrap().is_err());
        assert!(observed.registry.unwrap_err().reason.contains("could not be probed"));
    }

    #[test]
    fn test_probe_does_not_mutate() {
        let host = FakeHost::new();
        Probe::new(&host).observe(&runtime_state());
        assert!(host.mutations().is_empty());
    }
}
