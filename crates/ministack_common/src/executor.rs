//! Executor: applies a plan, one action at a time.
//!
//! - Strictly sequential, in plan order.
//! - Re-probes the target before every mutating action; if it is already
//!   satisfied the action becomes `skipped-noop`.
//! - A recoverable failure blocks the failed component's dependents and
//!   nothing else.
//! - A manual-intervention failure halts the run.
//! - Deadline and interrupt are checked between actions only. An action that
//!   has started always runs to completion, and nothing is rolled back.

use crate::declared::{ComponentSpec, DeclaredState};
use crate::error::{ActionFailure, ProbeUnavailable};
use crate::host::Host;
use crate::planner::{Blocked, Plan, ReconciliationAction, Target, Verb};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const RECOVERABLE_REMEDIATION: &str =
    "fix the cause and re-run; actions that already succeeded will be skipped";

const PIN_REMEDIATION: &str =
    "pin a version the package manager can install, or install it by hand, then re-run";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    Applied,
    SkippedNoop,
    FailedRecoverable,
    FailedManualInterventionRequired,
    /// Not attempted: a dependency failed or the run halted first
    Blocked,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Applied => "applied",
            ExecutionStatus::SkippedNoop => "skipped-noop",
            ExecutionStatus::FailedRecoverable => "failed-recoverable",
            ExecutionStatus::FailedManualInterventionRequired => {
                "failed-manual-intervention-required"
            }
            ExecutionStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub target: Target,
    pub verb: Verb,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// What the operator must do before re-running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl ExecutionResult {
    fn new(action: &ReconciliationAction, status: ExecutionStatus) -> Self {
        Self {
            target: action.target.clone(),
            verb: action.verb,
            status,
            diagnostic: None,
            remediation: None,
        }
    }

    fn diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    fn remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

/// Why the executor stopped before the end of the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Halt {
    ManualIntervention { target: String },
    DeadlineExceeded,
    Interrupted,
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::ManualIntervention { target } => {
                write!(f, "{} needs manual intervention", target)
            }
            Halt::DeadlineExceeded => f.write_str("run timeout reached"),
            Halt::Interrupted => f.write_str("interrupted"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<ExecutionResult>,
    /// Targets the planner could not plan for
    pub unplanned: Vec<Blocked>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<Halt>,
}

impl ExecutionReport {
    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn has(&self, status: ExecutionStatus) -> bool {
        self.count(status) > 0
    }
}

/// Run-level bounds, checked between actions
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    deadline: Option<Instant>,
    stop: Option<Arc<AtomicBool>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Flag set from outside (Ctrl-C) to stop before the next action
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn check(&self) -> Option<Halt> {
        if self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst)) {
            return Some(Halt::Interrupted);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(Halt::DeadlineExceeded);
        }
        None
    }
}

pub struct Executor<'a> {
    host: &'a dyn Host,
    declared: &'a DeclaredState,
    control: RunControl,
}

impl<'a> Executor<'a> {
    pub fn new(host: &'a dyn Host, declared: &'a DeclaredState, control: RunControl) -> Self {
        Self {
            host,
            declared,
            control,
        }
    }

    /// Apply the plan. Consumes it: actions are never replayed.
    pub fn execute(&self, plan: Plan) -> ExecutionReport {
        let mut report = ExecutionReport {
            results: Vec::with_capacity(plan.actions.len()),
            unplanned: plan.blocked,
            halted: None,
        };
        // Components whose branch is broken for the rest of the run
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut actions = plan.actions.into_iter();

        while let Some(action) = actions.next() {
            if let Some(halt) = self.control.check() {
                warn!("Stopping before {}: {}", action, halt);
                report.results.push(not_attempted(&action, &halt));
                report
                    .results
                    .extend(actions.by_ref().map(|a| not_attempted(&a, &halt)));
                report.halted = Some(halt);
                break;
            }

            if action.verb.is_mutating() {
                if let Some(dep) = self.failed_dependency(&action.target, &failed) {
                    info!("Skipping {}: '{}' failed earlier in this run", action, dep);
                    if let Target::Component { name, .. } = &action.target {
                        failed.insert(name.clone());
                    }
                    report.results.push(
                        ExecutionResult::new(&action, ExecutionStatus::Blocked)
                            .diagnostic(format!("not attempted: '{}' failed earlier in this run", dep)),
                    );
                    continue;
                }
            }

            let result = self.apply(&action);
            match result.status {
                ExecutionStatus::FailedRecoverable => {
                    if let Target::Component { name, .. } = &action.target {
                        failed.insert(name.clone());
                    }
                }
                ExecutionStatus::FailedManualInterventionRequired => {
                    let halt = Halt::ManualIntervention {
                        target: action.target.name().to_string(),
                    };
                    report.results.push(result);
                    report
                        .results
                        .extend(actions.by_ref().map(|a| not_attempted(&a, &halt)));
                    report.halted = Some(halt);
                    break;
                }
                _ => {}
            }
            report.results.push(result);
        }

        report
    }

    /// Name of a failed component this target depends on (or is)
    fn failed_dependency(&self, target: &Target, failed: &BTreeSet<String>) -> Option<String> {
        if failed.is_empty() {
            return None;
        }
        let root = match target {
            Target::Component { name, .. } => name.clone(),
            Target::Model { .. } | Target::Registry => match self.declared.model_runtime() {
                Some(runtime) => runtime.name.clone(),
                None => return None,
            },
        };
        if failed.contains(&root) {
            return Some(root);
        }
        self.declared
            .dependencies_of(&root)
            .into_iter()
            .find(|dep| failed.contains(dep))
    }

    fn apply(&self, action: &ReconciliationAction) -> ExecutionResult {
        if !action.verb.is_mutating() {
            let result = ExecutionResult::new(action, ExecutionStatus::SkippedNoop);
            return match &action.detail {
                Some(detail) => result.diagnostic(detail.clone()),
                None => result,
            };
        }

        match self.already_satisfied(action) {
            Ok(true) => {
                info!("{} already satisfied on re-check, skipping", action.target);
                return ExecutionResult::new(action, ExecutionStatus::SkippedNoop)
                    .diagnostic("already satisfied when re-checked");
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Re-check before {} failed: {}", action, e);
                return ExecutionResult::new(action, ExecutionStatus::FailedRecoverable)
                    .diagnostic(e.to_string())
                    .remediation(RECOVERABLE_REMEDIATION);
            }
        }

        info!("Applying {}", action);
        let outcome = match &action.target {
            Target::Component { name, kind } => match self.declared.component(name) {
                Some(spec) => {
                    let adapter = self.host.adapter(*kind);
                    match action.verb {
                        Verb::Install => adapter.install(spec),
                        Verb::Start => adapter.start(spec),
                        Verb::Upgrade => adapter.upgrade(spec),
                        verb => Err(unsupported(verb, &action.target)),
                    }
                }
                None => Err(ActionFailure::recoverable(format!(
                    "'{}' is not a declared component",
                    name
                ))),
            },
            Target::Model { name } => match action.verb {
                Verb::Pull => self.host.models().pull(name),
                Verb::Remove => self.host.models().remove(name),
                verb => Err(unsupported(verb, &action.target)),
            },
            Target::Registry => Err(unsupported(action.verb, &action.target)),
        };

        match outcome {
            Ok(()) => {
                if let Some(missed) = self.check_pin(action) {
                    return missed;
                }
                info!("Applied {} {}", action.verb, action.target);
                let result = ExecutionResult::new(action, ExecutionStatus::Applied);
                match &action.detail {
                    Some(detail) => result.diagnostic(detail.clone()),
                    None => result,
                }
            }
            Err(ActionFailure::Recoverable(message)) => {
                warn!("{} {} failed: {}", action.verb, action.target, message);
                ExecutionResult::new(action, ExecutionStatus::FailedRecoverable)
                    .diagnostic(message)
                    .remediation(RECOVERABLE_REMEDIATION)
            }
            Err(ActionFailure::ManualIntervention { reason, hint }) => {
                warn!(
                    "{} {} needs manual intervention: {} ({})",
                    action.verb, action.target, reason, hint
                );
                ExecutionResult::new(action, ExecutionStatus::FailedManualInterventionRequired)
                    .diagnostic(reason)
                    .remediation(hint)
            }
        }
    }

    /// After an install or upgrade of a pinned component, confirm the pin
    /// landed. `None` when it did, or when there is no pin to check.
    fn check_pin(&self, action: &ReconciliationAction) -> Option<ExecutionResult> {
        let Target::Component { name, kind } = &action.target else {
            return None;
        };
        if !matches!(action.verb, Verb::Install | Verb::Upgrade) {
            return None;
        }
        let spec = self.declared.component(name)?;
        let pin = spec.version.pinned()?;
        let diagnostic = match self.host.adapter(*kind).probe(spec) {
            Ok(obs) if version_ok(spec, obs.version.as_deref()) => return None,
            Ok(obs) => format!(
                "installed {} does not satisfy pin {}; the package manager cannot install that version",
                obs.version.as_deref().unwrap_or("unknown version"),
                pin
            ),
            Err(e) => format!(
                "{} finished but the installed version could not be read: {}",
                action.verb, e.reason
            ),
        };
        warn!("{} {}: {}", action.verb, action.target, diagnostic);
        Some(
            ExecutionResult::new(action, ExecutionStatus::FailedRecoverable)
                .diagnostic(diagnostic)
                .remediation(PIN_REMEDIATION),
        )
    }

    /// Re-probe just this target
    fn already_satisfied(&self, action: &ReconciliationAction) -> Result<bool, ProbeUnavailable> {
        match &action.target {
            Target::Component { name, kind } => {
                let Some(spec) = self.declared.component(name) else {
                    return Ok(false);
                };
                let obs = self.host.adapter(*kind).probe(spec)?;
                Ok(match action.verb {
                    Verb::Install => obs.installed,
                    Verb::Start => obs.is_running(),
                    Verb::Upgrade => obs.installed && version_ok(spec, obs.version.as_deref()),
                    _ => false,
                })
            }
            Target::Model { name } => {
                let models = self.host.models().list()?;
                Ok(match action.verb {
                    Verb::Pull => !action.force && models.contains(name),
                    Verb::Remove => !models.contains(name),
                    _ => false,
                })
            }
            Target::Registry => Ok(false),
        }
    }
}

fn version_ok(spec: &ComponentSpec, observed: Option<&str>) -> bool {
    spec.version.is_satisfied_by(observed)
}

fn unsupported(verb: Verb, target: &Target) -> ActionFailure {
    ActionFailure::recoverable(format!("{} is not supported for {}", verb, target))
}

fn not_attempted(action: &ReconciliationAction, halt: &Halt) -> ExecutionResult {
    ExecutionResult::new(action, ExecutionStatus::Blocked)
        .diagnostic(format!("not attempted: run halted ({})", halt))
}
