//! In-memory host for exercising the engine without touching a machine.
//!
//! State lives behind a `RefCell` because the capability traits take `&self`.
//! Every adapter call is recorded so tests can assert on what ran.

use crate::declared::{ComponentKind, ComponentSpec};
use crate::error::{ActionFailure, ProbeUnavailable};
use crate::host::{ComponentAdapter, Host, ModelRegistry};
use crate::model::ModelName;
use crate::probe::Observation;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

pub use crate::host::MANUAL_LAUNCH_HINT;

#[derive(Debug, Clone, Default)]
pub struct FakeComponent {
    pub installed: bool,
    pub version: Option<String>,
    pub running: bool,
    /// Version reported after `install`; falls back to the declared pin
    pub install_version: Option<String>,
    /// Version reported after `upgrade`; falls back to the declared pin
    pub upgrade_version: Option<String>,
    /// `start` fails with manual intervention until `launch_manually`
    pub manual_launch_required: bool,
    pub probe_error: Option<String>,
    /// Probe reports the state as unknown for this reason
    pub unconfirmed: Option<String>,
    pub fail_install: Option<ActionFailure>,
    pub fail_start: Option<ActionFailure>,
    pub fail_upgrade: Option<ActionFailure>,
}

#[derive(Debug, Default)]
struct FakeHostState {
    components: BTreeMap<String, FakeComponent>,
    models: BTreeSet<ModelName>,
    registry_error: Option<String>,
    failing_pulls: BTreeMap<ModelName, ActionFailure>,
    failing_removes: BTreeMap<ModelName, ActionFailure>,
    calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeHost {
    state: RefCell<FakeHostState>,
}

fn model(name: &str) -> ModelName {
    match ModelName::canonical(name) {
        Some(name) => name,
        None => panic!("invalid model name in test setup: {:?}", name),
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_component<R>(&self, name: &str, f: impl FnOnce(&mut FakeComponent) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(state.components.entry(name.to_string()).or_default())
    }

    fn record(&self, call: String) {
        self.state.borrow_mut().calls.push(call);
    }

    pub fn set_component(&self, name: &str, component: FakeComponent) {
        self.state
            .borrow_mut()
            .components
            .insert(name.to_string(), component);
    }

    pub fn install_component(&self, name: &str, version: Option<&str>, running: bool) {
        self.with_component(name, |c| {
            c.installed = true;
            c.version = version.map(str::to_string);
            c.running = running;
        });
    }

    pub fn stop_component(&self, name: &str) {
        self.with_component(name, |c| c.running = false);
    }

    pub fn require_manual_launch(&self, name: &str) {
        self.with_component(name, |c| c.manual_launch_required = true);
    }

    /// The operator opens the app by hand
    pub fn launch_manually(&self, name: &str) {
        self.with_component(name, |c| {
            c.manual_launch_required = false;
            if c.installed {
                c.running = true;
            }
        });
    }

    pub fn set_install_version(&self, name: &str, version: &str) {
        self.with_component(name, |c| c.install_version = Some(version.to_string()));
    }

    pub fn set_upgrade_version(&self, name: &str, version: &str) {
        self.with_component(name, |c| c.upgrade_version = Some(version.to_string()));
    }

    /// The component's query interface is down, e.g. a compose app while the
    /// Docker daemon is stopped. Cleared by `confirm`.
    pub fn set_unconfirmed(&self, name: &str, reason: &str) {
        self.with_component(name, |c| c.unconfirmed = Some(reason.to_string()));
    }

    pub fn confirm(&self, name: &str) {
        self.with_component(name, |c| c.unconfirmed = None);
    }

    pub fn fail_probe(&self, name: &str, reason: &str) {
        self.with_component(name, |c| c.probe_error = Some(reason.to_string()));
    }

    pub fn fail_install(&self, name: &str, failure: ActionFailure) {
        self.with_component(name, |c| c.fail_install = Some(failure));
    }

    pub fn fail_start(&self, name: &str, failure: ActionFailure) {
        self.with_component(name, |c| c.fail_start = Some(failure));
    }

    pub fn fail_upgrade(&self, name: &str, failure: ActionFailure) {
        self.with_component(name, |c| c.fail_upgrade = Some(failure));
    }

    pub fn add_model(&self, name: &str) {
        self.state.borrow_mut().models.insert(model(name));
    }

    pub fn fail_registry(&self, reason: &str) {
        self.state.borrow_mut().registry_error = Some(reason.to_string());
    }

    pub fn fail_pull(&self, name: &str, failure: ActionFailure) {
        self.state
            .borrow_mut()
            .failing_pulls
            .insert(model(name), failure);
    }

    pub fn fail_remove(&self, name: &str, failure: ActionFailure) {
        self.state
            .borrow_mut()
            .failing_removes
            .insert(model(name), failure);
    }

    pub fn component(&self, name: &str) -> FakeComponent {
        self.state
            .borrow()
            .components
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn models_on_host(&self) -> Vec<String> {
        self.state
            .borrow()
            .models
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    /// Every call, e.g. `probe ollama`, `install ollama`, `pull llama3.1:8b`
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    /// Calls that would have changed the host
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("probe ") && c != "list models")
            .collect()
    }
}

impl ComponentAdapter for FakeHost {
    fn probe(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        self.record(format!("probe {}", component.name));
        let fake = self.component(&component.name);
        if let Some(reason) = fake.probe_error {
            return Err(ProbeUnavailable::new(&component.name, reason));
        }
        if let Some(reason) = fake.unconfirmed {
            return Ok(Observation::unconfirmed(reason));
        }
        if !fake.installed {
            return Ok(Observation::absent());
        }
        let mut obs = Observation::installed(fake.version.as_deref());
        if component.kind.is_service_backed() {
            obs = obs.with_running(fake.running);
            if fake.manual_launch_required && !fake.running {
                obs.pending_manual = Some(MANUAL_LAUNCH_HINT.to_string());
            }
        }
        Ok(obs)
    }

    fn install(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.record(format!("install {}", component.name));
        self.with_component(&component.name, |c| {
            if let Some(failure) = c.fail_install.clone() {
                return Err(failure);
            }
            c.installed = true;
            c.version = c
                .install_version
                .clone()
                .or_else(|| component.version.pinned().map(str::to_string))
                .or_else(|| c.version.clone());
            Ok(())
        })
    }

    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.record(format!("start {}", component.name));
        self.with_component(&component.name, |c| {
            if let Some(failure) = c.fail_start.clone() {
                return Err(failure);
            }
            if !c.installed {
                return Err(ActionFailure::recoverable(format!(
                    "{} is not installed",
                    component.name
                )));
            }
            if c.manual_launch_required {
                return Err(ActionFailure::manual(
                    format!(
                        "{} is installed but its daemon needs a first manual launch",
                        component.name
                    ),
                    MANUAL_LAUNCH_HINT,
                ));
            }
            c.running = true;
            Ok(())
        })?;
        // With the daemon up, compose apps can be asked again
        if component.kind == ComponentKind::ContainerRuntime {
            for c in self.state.borrow_mut().components.values_mut() {
                c.unconfirmed = None;
            }
        }
        Ok(())
    }

    fn upgrade(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.record(format!("upgrade {}", component.name));
        self.with_component(&component.name, |c| {
            if let Some(failure) = c.fail_upgrade.clone() {
                return Err(failure);
            }
            c.version = c
                .upgrade_version
                .clone()
                .or_else(|| component.version.pinned().map(str::to_string))
                .or_else(|| c.version.clone());
            Ok(())
        })
    }
}

impl ModelRegistry for FakeHost {
    fn list(&self) -> Result<BTreeSet<ModelName>, ProbeUnavailable> {
        self.record("list models".to_string());
        let state = self.state.borrow();
        match &state.registry_error {
            Some(reason) => Err(ProbeUnavailable::new("models", reason.clone())),
            None => Ok(state.models.clone()),
        }
    }

    fn pull(&self, name: &ModelName) -> Result<(), ActionFailure> {
        self.record(format!("pull {}", name));
        let mut state = self.state.borrow_mut();
        if let Some(failure) = state.failing_pulls.get(name) {
            return Err(failure.clone());
        }
        state.models.insert(name.clone());
        Ok(())
    }

    fn remove(&self, name: &ModelName) -> Result<(), ActionFailure> {
        self.record(format!("remove {}", name));
        let mut state = self.state.borrow_mut();
        if let Some(failure) = state.failing_removes.get(name) {
            return Err(failure.clone());
        }
        state.models.remove(name);
        Ok(())
    }
}

impl Host for FakeHost {
    fn adapter(&self, _kind: ComponentKind) -> &dyn ComponentAdapter {
        self
    }

    fn models(&self) -> &dyn ModelRegistry {
        self
    }
}
