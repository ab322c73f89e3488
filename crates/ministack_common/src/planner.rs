//! Planner: observed state + declared state + safety switches -> ordered actions.
//!
//! Pure function. Given the same three inputs it always produces the same plan.
//!
//! Ordering:
//! - components in dependency order, declaration order breaking ties
//! - all actions for one component are contiguous (install, upgrade, start)
//! - model actions last, after the model runtime has been brought up
//!
//! Gating:
//! - `upgrade` only with `allow_upgrade`; otherwise a `no-op` that says why
//! - forced `pull` of a present model only with `refresh_models`
//! - `remove` of an undeclared model only with `prune_models`; models declared
//!   `absent` are always removed

use crate::declared::{ComponentKind, ComponentSpec, DeclaredState};
use crate::model::{ModelName, ModelState};
use crate::probe::{Observation, ObservedState, RegistryObservation};
use crate::safety::{SafetySwitch, SafetySwitches};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// What an action does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Install,
    Start,
    Upgrade,
    Pull,
    Remove,
    NoOp,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Install => "install",
            Verb::Start => "start",
            Verb::Upgrade => "upgrade",
            Verb::Pull => "pull",
            Verb::Remove => "remove",
            Verb::NoOp => "no-op",
        }
    }

    pub fn is_mutating(&self) -> bool {
        *self != Verb::NoOp
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action applies to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Component { name: String, kind: ComponentKind },
    Model { name: ModelName },
    /// The model store as a whole (pruning)
    Registry,
}

impl Target {
    pub fn component(spec: &ComponentSpec) -> Self {
        Target::Component {
            name: spec.name.clone(),
            kind: spec.kind,
        }
    }

    pub fn model(name: &ModelName) -> Self {
        Target::Model { name: name.clone() }
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Component { name, .. } => name,
            Target::Model { name } => name.as_str(),
            Target::Registry => "models",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Component { name, .. } => write!(f, "{}", name),
            Target::Model { name } => write!(f, "model {}", name),
            Target::Registry => f.write_str("model registry"),
        }
    }
}

/// One unit of planned work. Consumed by the executor; deliberately not `Clone`.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct ReconciliationAction {
    pub target: Target,
    pub verb: Verb,
    /// Switch that authorized this action, or for a `no-op`, the switch that
    /// would have turned it into one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<SafetySwitch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Pull even if already present
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl ReconciliationAction {
    pub fn new(target: Target, verb: Verb) -> Self {
        Self {
            target,
            verb,
            gate: None,
            detail: None,
            force: false,
        }
    }

    fn gated(mut self, switch: SafetySwitch) -> Self {
        self.gate = Some(switch);
        self
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

impl fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.target)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// A target the planner could not plan for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocked {
    pub target: Target,
    pub reason: String,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub actions: Vec<ReconciliationAction>,
    pub blocked: Vec<Blocked>,
}

impl Plan {
    /// Nothing to change and nothing unknown
    pub fn is_converged(&self) -> bool {
        self.blocked.is_empty() && self.actions.iter().all(|a| !a.verb.is_mutating())
    }

    pub fn mutating(&self) -> impl Iterator<Item = &ReconciliationAction> {
        self.actions.iter().filter(|a| a.verb.is_mutating())
    }
}

/// Kahn's algorithm, always taking the earliest-declared ready component.
///
/// Returns indices into `components`. Unknown and self dependencies are
/// ignored here (the store reports them); on a cycle, returns the names of
/// every component that could not be ordered.
pub fn topological_order(components: &[ComponentSpec]) -> Result<Vec<usize>, Vec<String>> {
    let index: HashMap<&str, usize> = components
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();

    let deps: Vec<Vec<usize>> = components
        .iter()
        .enumerate()
        .map(|(i, c)| {
            c.depends_on
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .filter(|&d| d != i)
                .collect()
        })
        .collect();

    let mut placed = vec![false; components.len()];
    let mut order = Vec::with_capacity(components.len());
    while order.len() < components.len() {
        let ready = (0..components.len()).find(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]));
        match ready {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                return Err(components
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .map(|(_, c)| c.name.clone())
                    .collect())
            }
        }
    }
    Ok(order)
}

/// Compute the plan
pub fn plan(declared: &DeclaredState, observed: &ObservedState, switches: &SafetySwitches) -> Plan {
    let mut plan = Plan::default();
    let mut blocked: BTreeSet<String> = BTreeSet::new();

    for component in declared.ordered_components() {
        let target = Target::component(component);

        if let Some(dep) = component.depends_on.iter().find(|d| blocked.contains(*d)) {
            plan.blocked.push(Blocked {
                target,
                reason: format!("depends on '{}', which could not be planned", dep),
            });
            blocked.insert(component.name.clone());
            continue;
        }

        match observed.component(&component.name) {
            Some(Ok(obs)) => plan_component(component, obs, switches, &mut plan.actions),
            Some(Err(e)) => {
                plan.blocked.push(Blocked {
                    target,
                    reason: format!("probe unavailable: {}", e.reason),
                });
                blocked.insert(component.name.clone());
            }
            None => {
                plan.blocked.push(Blocked {
                    target,
                    reason: "not probed".to_string(),
                });
                blocked.insert(component.name.clone());
            }
        }
    }

    plan_models(declared, observed, switches, &blocked, &mut plan);
    plan
}

fn plan_component(
    component: &ComponentSpec,
    obs: &Observation,
    switches: &SafetySwitches,
    actions: &mut Vec<ReconciliationAction>,
) {
    let target = Target::component(component);
    let service = component.kind.is_service_backed();

    if !obs.installed {
        // Unknown state is planned as absent; the executor re-probes first
        let recheck = obs
            .unconfirmed
            .as_ref()
            .map(|reason| format!("{}; re-checked before applying", reason));
        let detail: Vec<String> = component
            .version
            .pinned()
            .map(|pin| format!("version {}", pin))
            .into_iter()
            .chain(recheck.clone())
            .collect();
        let install = ReconciliationAction::new(target.clone(), Verb::Install);
        actions.push(if detail.is_empty() {
            install
        } else {
            install.detail(detail.join(", "))
        });
        if service {
            let start = ReconciliationAction::new(target, Verb::Start);
            actions.push(match recheck {
                Some(recheck) => start.detail(recheck),
                None => start,
            });
        }
        return;
    }

    let before = actions.len();

    if !component.version.is_satisfied_by(obs.version.as_deref()) {
        let pin = component.version.pinned().unwrap_or_default();
        let current = obs.version.as_deref().unwrap_or("unknown");
        if switches.is_enabled(SafetySwitch::AllowUpgrade) {
            actions.push(
                ReconciliationAction::new(target.clone(), Verb::Upgrade)
                    .gated(SafetySwitch::AllowUpgrade)
                    .detail(format!("{} -> {}", current, pin)),
            );
        } else {
            actions.push(
                ReconciliationAction::new(target.clone(), Verb::NoOp)
                    .gated(SafetySwitch::AllowUpgrade)
                    .detail(format!(
                        "installed {} does not satisfy {}; upgrade withheld without {}",
                        current,
                        pin,
                        SafetySwitch::AllowUpgrade.flag()
                    )),
            );
        }
    }

    if service && !obs.is_running() {
        let start = ReconciliationAction::new(target.clone(), Verb::Start);
        actions.push(match &obs.pending_manual {
            Some(hint) => start.detail(format!("needs manual step: {}", hint)),
            None => start,
        });
    }

    if actions.len() == before {
        actions.push(ReconciliationAction::new(target, Verb::NoOp).detail("already in desired state"));
    }
}

fn plan_models(
    declared: &DeclaredState,
    observed: &ObservedState,
    switches: &SafetySwitches,
    blocked: &BTreeSet<String>,
    plan: &mut Plan,
) {
    let prune = switches.is_enabled(SafetySwitch::PruneModels);
    if declared.models().is_empty() && !prune {
        return;
    }

    let block_reason = match (declared.model_runtime(), &observed.registry) {
        (Some(runtime), _) if blocked.contains(&runtime.name) => {
            Some(format!("model runtime '{}' could not be planned", runtime.name))
        }
        (_, Err(e)) => Some(format!("probe unavailable: {}", e.reason)),
        _ => None,
    };

    let registry = match (&observed.registry, block_reason) {
        (Ok(registry), None) => registry,
        (_, reason) => {
            let reason = reason.unwrap_or_else(|| "model registry unavailable".to_string());
            for model in declared.models() {
                plan.blocked.push(Blocked {
                    target: Target::model(&model.name),
                    reason: reason.clone(),
                });
            }
            if prune {
                plan.blocked.push(Blocked {
                    target: Target::Registry,
                    reason: format!("cannot prune: {}", reason),
                });
            }
            return;
        }
    };

    let deferred = matches!(registry, RegistryObservation::Deferred { .. });
    // A runtime that is not installed yet has no models to remove
    let runtime_missing = declared.model_runtime().is_some_and(|runtime| {
        matches!(observed.component(&runtime.name), Some(Ok(obs)) if !obs.installed)
    });

    for model in declared.models() {
        let target = Target::model(&model.name);
        let on_host = registry.contains(&model.name);
        let action = match model.state {
            ModelState::Present if !on_host => {
                let pull = ReconciliationAction::new(target, Verb::Pull);
                if deferred {
                    pull.detail("runtime not running yet; re-checked before pulling")
                } else {
                    pull
                }
            }
            ModelState::Present if switches.is_enabled(SafetySwitch::RefreshModels) => {
                ReconciliationAction::new(target, Verb::Pull)
                    .gated(SafetySwitch::RefreshModels)
                    .forced()
                    .detail("refresh")
            }
            ModelState::Present => {
                ReconciliationAction::new(target, Verb::NoOp).detail("already present")
            }
            ModelState::Absent if on_host => ReconciliationAction::new(target, Verb::Remove),
            ModelState::Absent if deferred && runtime_missing => {
                ReconciliationAction::new(target, Verb::NoOp)
                    .detail("runtime not installed yet; re-checked on the next run")
            }
            // Installed but stopped: models may be on disk, re-checked once it is up
            ModelState::Absent if deferred => ReconciliationAction::new(target, Verb::Remove)
                .detail("runtime not running yet; re-checked before removing"),
            ModelState::Absent => {
                ReconciliationAction::new(target, Verb::NoOp).detail("already absent")
            }
        };
        plan.actions.push(action);
    }

    if !prune {
        return;
    }
    match registry {
        RegistryObservation::Listed { models } => {
            for name in models.iter().filter(|m| declared.model(m).is_none()) {
                plan.actions.push(
                    ReconciliationAction::new(Target::model(name), Verb::Remove)
                        .gated(SafetySwitch::PruneModels)
                        .detail("not declared"),
                );
            }
        }
        RegistryObservation::Deferred { reason } => {
            plan.actions.push(
                ReconciliationAction::new(Target::Registry, Verb::NoOp)
                    .gated(SafetySwitch::PruneModels)
                    .detail(format!("prune skipped: {}; re-run once it is up", reason)),
            );
        }
    }
}
