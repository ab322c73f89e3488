//! Verifier: re-probe everything and compare with the declared state.
//!
//! Read-only. Never retries; the operator re-runs the whole pipeline instead.

use crate::declared::{ComponentSpec, DeclaredState};
use crate::error::ProbeUnavailable;
use crate::host::Host;
use crate::model::ModelState;
use crate::planner::Target;
use crate::probe::{Observation, Probe, RegistryObservation};
use crate::safety::SafetySwitch;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationStatus {
    Matches,
    ManualInterventionPending,
    Mismatch,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Matches => "matches",
            VerificationStatus::ManualInterventionPending => "manual-intervention-pending",
            VerificationStatus::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationEntry {
    pub target: Target,
    pub status: VerificationStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl VerificationEntry {
    fn new(target: Target, status: VerificationStatus, detail: impl Into<String>) -> Self {
        Self {
            target,
            status,
            detail: detail.into(),
            hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub entries: Vec<VerificationEntry>,
}

impl VerificationReport {
    pub fn all_match(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status == VerificationStatus::Matches)
    }

    pub fn count(&self, status: VerificationStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn has(&self, status: VerificationStatus) -> bool {
        self.count(status) > 0
    }

    pub fn entry(&self, name: &str) -> Option<&VerificationEntry> {
        self.entries.iter().find(|e| e.target.name() == name)
    }
}

/// Verify every declared component and model against the live host
pub fn verify(host: &dyn Host, declared: &DeclaredState) -> VerificationReport {
    let observed = Probe::new(host).observe(declared);
    let mut report = VerificationReport::default();
    let mut statuses: BTreeMap<&str, VerificationStatus> = BTreeMap::new();

    for component in declared.ordered_components() {
        let entry = match observed.component(&component.name) {
            Some(result) => verify_component(component, result, &statuses),
            None => VerificationEntry::new(
                Target::component(component),
                VerificationStatus::Mismatch,
                "not probed",
            ),
        };
        statuses.insert(&component.name, entry.status);
        report.entries.push(entry);
    }

    let runtime_pending = declared.model_runtime().and_then(|runtime| {
        (statuses.get(runtime.name.as_str()) == Some(&VerificationStatus::ManualInterventionPending))
            .then_some(runtime.name.as_str())
    });

    for model in declared.models() {
        let target = Target::model(&model.name);
        let entry = match (&observed.registry, runtime_pending) {
            (_, Some(runtime)) => VerificationEntry::new(
                target,
                VerificationStatus::ManualInterventionPending,
                format!("waiting on '{}'", runtime),
            ),
            (Err(e), None) => VerificationEntry::new(
                target,
                VerificationStatus::Mismatch,
                format!("cannot read model registry: {}", e.reason),
            ),
            (Ok(RegistryObservation::Deferred { reason }), None) => {
                let detail = match model.state {
                    ModelState::Present => format!("not available: {}", reason),
                    ModelState::Absent => format!("cannot confirm absence: {}", reason),
                };
                VerificationEntry::new(target, VerificationStatus::Mismatch, detail)
            }
            (Ok(registry), None) => match (model.state, registry.contains(&model.name)) {
                (ModelState::Present, true) => {
                    VerificationEntry::new(target, VerificationStatus::Matches, "present")
                }
                (ModelState::Absent, false) => {
                    VerificationEntry::new(target, VerificationStatus::Matches, "absent")
                }
                (ModelState::Present, false) => {
                    VerificationEntry::new(target, VerificationStatus::Mismatch, "not pulled")
                }
                (ModelState::Absent, true) => {
                    VerificationEntry::new(target, VerificationStatus::Mismatch, "still present")
                }
            },
        };
        report.entries.push(entry);
    }

    report
}

fn verify_component(
    component: &ComponentSpec,
    result: &Result<Observation, ProbeUnavailable>,
    earlier: &BTreeMap<&str, VerificationStatus>,
) -> VerificationEntry {
    let target = Target::component(component);
    let obs = match result {
        Ok(obs) => obs,
        Err(e) => {
            return VerificationEntry::new(
                target,
                VerificationStatus::Mismatch,
                format!("probe unavailable: {}", e.reason),
            )
        }
    };

    let satisfied = obs.installed
        && component.version.is_satisfied_by(obs.version.as_deref())
        && (!component.kind.is_service_backed() || obs.is_running());
    if satisfied {
        let detail = match &obs.version {
            Some(v) => format!("installed {}", v),
            None => "installed".to_string(),
        };
        let detail = if component.kind.is_service_backed() {
            format!("{}, running", detail)
        } else {
            detail
        };
        return VerificationEntry::new(target, VerificationStatus::Matches, detail);
    }

    if let Some(dep) = component.depends_on.iter().find(|d| {
        earlier.get(d.as_str()) == Some(&VerificationStatus::ManualInterventionPending)
    }) {
        return VerificationEntry::new(
            target,
            VerificationStatus::ManualInterventionPending,
            format!("waiting on '{}'", dep),
        );
    }

    if let Some(reason) = &obs.unconfirmed {
        return VerificationEntry::new(
            target,
            VerificationStatus::Mismatch,
            format!("cannot confirm: {}", reason),
        );
    }

    if !obs.installed {
        return VerificationEntry::new(target, VerificationStatus::Mismatch, "not installed");
    }

    if !component.version.is_satisfied_by(obs.version.as_deref()) {
        let entry = VerificationEntry::new(
            target,
            VerificationStatus::Mismatch,
            format!(
                "installed {} does not satisfy {}",
                obs.version.as_deref().unwrap_or("unknown version"),
                component.version
            ),
        );
        return if component.version.is_ahead_of(obs.version.as_deref()) {
            entry.hint(format!(
                "re-run with {} to upgrade",
                SafetySwitch::AllowUpgrade.flag()
            ))
        } else {
            entry.hint("installed version is newer than the pin; change the pin or downgrade by hand")
        };
    }

    match &obs.pending_manual {
        Some(hint) => VerificationEntry::new(
            target,
            VerificationStatus::ManualInterventionPending,
            "installed but not running",
        )
        .hint(hint.clone()),
        None => VerificationEntry::new(target, VerificationStatus::Mismatch, "not running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declared::ComponentKind;
    use crate::fake::{FakeHost, MANUAL_LAUNCH_HINT};
    use crate::model::ModelEntry;

    fn declared() -> DeclaredState {
        DeclaredState::new(
            vec![
                ComponentSpec::new("docker", ComponentKind::ContainerRuntime),
                ComponentSpec::new("webui", ComponentKind::ContainerApp)
                    .with_compose_file("compose.yml")
                    .depending_on(&["docker"]),
                ComponentSpec::new("ollama", ComponentKind::ModelRuntime).with_version("0.5"),
            ],
            vec![
                ModelEntry::present("llama3.1:8b").unwrap(),
                ModelEntry::absent("old:7b").unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_everything_matches() {
        let host = FakeHost::new();
        host.install_component("docker", Some("27.3.1"), true);
        host.install_component("webui", None, true);
        host.install_component("ollama", Some("0.5.7"), true);
        host.add_model("llama3.1:8b");
        let report = verify(&host, &declared());
        assert!(report.all_match(), "{:?}", report);
        assert!(host.mutations().is_empty());
    }

    #[test]
    fn test_manual_launch_pending_propagates_to_dependents() {
        let host = FakeHost::new();
        host.install_component("docker", Some("27.3.1"), false);
        host.require_manual_launch("docker");
        host.install_component("ollama", Some("0.5.7"), true);
        host.add_model("llama3.1:8b");
        let report = verify(&host, &declared());

        let docker = report.entry("docker").unwrap();
        assert_eq!(docker.status, VerificationStatus::ManualInterventionPending);
        assert_eq!(docker.hint.as_deref(), Some(MANUAL_LAUNCH_HINT));
        assert_eq!(
            report.entry("webui").unwrap().status,
            VerificationStatus::ManualInterventionPending
        );
        assert_eq!(
            report.entry("ollama").unwrap().status,
            VerificationStatus::Matches
        );
    }

    #[test]
    fn test_version_mismatch_suggests_upgrade_switch() {
        let host = FakeHost::new();
        host.install_component("ollama", Some("0.4.2"), true);
        let report = verify(&host, &declared());
        let ollama = report.entry("ollama").unwrap();
        assert_eq!(ollama.status, VerificationStatus::Mismatch);
        assert!(ollama.hint.as_deref().unwrap().contains("--allow-upgrade"));
    }

    #[test]
    fn test_newer_than_pin_does_not_suggest_upgrade_switch() {
        let host = FakeHost::new();
        host.install_component("ollama", Some("0.6.1"), true);
        let report = verify(&host, &declared());
        let ollama = report.entry("ollama").unwrap();
        assert_eq!(ollama.status, VerificationStatus::Mismatch);
        let hint = ollama.hint.as_deref().unwrap();
        assert!(!hint.contains("--allow-upgrade"));
        assert!(hint.contains("newer than the pin"));
    }

    #[test]
    fn test_app_behind_stopped_daemon_is_unconfirmed_not_missing() {
        let host = FakeHost::new();
        host.install_component("docker", Some("27.3.1"), false);
        host.install_component("webui", None, true);
        host.set_unconfirmed("webui", "Docker daemon not running");
        let report = verify(&host, &declared());
        let webui = report.entry("webui").unwrap();
        assert_eq!(webui.status, VerificationStatus::Mismatch);
        assert_eq!(webui.detail, "cannot confirm: Docker daemon not running");
    }

    #[test]
    fn test_models_compared_with_registry() {
        let host = FakeHost::new();
        host.install_component("ollama", Some("0.5.7"), true);
        host.add_model("old:7b");
        let report = verify(&host, &declared());
        assert_eq!(report.entry("llama3.1:8b").unwrap().detail, "not pulled");
        assert_eq!(report.entry("old:7b").unwrap().detail, "still present");
    }

    #[test]
    fn test_stopped_runtime_means_models_cannot_be_confirmed() {
        let host = FakeHost::new();
        host.install_component("ollama", Some("0.5.7"), false);
        let report = verify(&host, &declared());
        assert_eq!(
            report.entry("ollama").unwrap().status,
            VerificationStatus::Mismatch
        );
        let old = report.entry("old:7b").unwrap();
        assert_eq!(old.status, VerificationStatus::Mismatch);
        assert!(old.detail.starts_with("cannot confirm absence"));
    }

    #[test]
    fn test_probe_failure_is_mismatch_not_silence() {
        let host = FakeHost::new();
        host.fail_probe("docker", "docker info hung");
        let report = verify(&host, &declared());
        let docker = report.entry("docker").unwrap();
        assert_eq!(docker.status, VerificationStatus::Mismatch);
        assert!(docker.detail.contains("docker info hung"));
    }
}
