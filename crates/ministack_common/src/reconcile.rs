//! Full pipeline: probe -> plan -> execute -> verify.

use crate::declared::DeclaredState;
use crate::executor::{ExecutionReport, ExecutionStatus, Executor, Halt, RunControl};
use crate::host::Host;
use crate::planner::{self, Plan};
use crate::probe::Probe;
use crate::safety::SafetySwitches;
use crate::verifier::{self, VerificationReport, VerificationStatus};
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Overall result of a run, mapped to the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every component and model matches
    Success,
    /// Nothing failed, but an operator step is pending
    ActionRequired,
    /// A mismatch or unresolved failure
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ActionRequired => "action_required",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub switches: SafetySwitches,
    /// Absent for verify-only runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
    pub verification: VerificationReport,
    pub outcome: Outcome,
}

/// Outcome of a verify-only run
pub fn verification_outcome(verification: &VerificationReport) -> Outcome {
    if verification.has(VerificationStatus::Mismatch) {
        Outcome::Failure
    } else if verification.has(VerificationStatus::ManualInterventionPending) {
        Outcome::ActionRequired
    } else {
        Outcome::Success
    }
}

/// Outcome of a reconcile run.
///
/// A halt for manual intervention is `ActionRequired` even though later
/// actions were never attempted: the operator's next step is the manual one.
pub fn outcome(execution: &ExecutionReport, verification: &VerificationReport) -> Outcome {
    let failed = execution.has(ExecutionStatus::FailedRecoverable)
        || !execution.unplanned.is_empty()
        || matches!(
            execution.halted,
            Some(Halt::DeadlineExceeded) | Some(Halt::Interrupted)
        );
    if failed {
        return Outcome::Failure;
    }
    if matches!(execution.halted, Some(Halt::ManualIntervention { .. })) {
        return Outcome::ActionRequired;
    }
    verification_outcome(verification)
}

pub struct Reconciler<'a> {
    host: &'a dyn Host,
    switches: SafetySwitches,
    control: RunControl,
}

impl<'a> Reconciler<'a> {
    pub fn new(host: &'a dyn Host, switches: SafetySwitches) -> Self {
        Self {
            host,
            switches,
            control: RunControl::default(),
        }
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    /// Probe and plan without changing anything
    pub fn plan(&self, declared: &DeclaredState) -> Plan {
        let observed = Probe::new(self.host).observe(declared);
        planner::plan(declared, &observed, &self.switches)
    }

    pub fn reconcile(&self, declared: &DeclaredState) -> ReconcileReport {
        let enabled: Vec<&str> = self.switches.enabled().iter().map(|s| s.as_str()).collect();
        info!(
            "Reconciling {} components and {} models (switches: {})",
            declared.components().len(),
            declared.models().len(),
            if enabled.is_empty() {
                "none".to_string()
            } else {
                enabled.join(", ")
            }
        );

        let plan = self.plan(declared);
        info!(
            "Planned {} actions ({} mutating), {} blocked",
            plan.actions.len(),
            plan.mutating().count(),
            plan.blocked.len()
        );

        let execution = Executor::new(self.host, declared, self.control.clone()).execute(plan);
        let verification = verifier::verify(self.host, declared);
        let outcome = outcome(&execution, &verification);
        info!("Reconcile finished: {}", outcome);

        ReconcileReport {
            switches: self.switches,
            execution: Some(execution),
            verification,
            outcome,
        }
    }

    /// Read-only check of the live host
    pub fn verify_only(&self, declared: &DeclaredState) -> ReconcileReport {
        let verification = verifier::verify(self.host, declared);
        let outcome = verification_outcome(&verification);
        ReconcileReport {
            switches: self.switches,
            execution: None,
            verification,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declared::{ComponentKind, ComponentSpec};
    use crate::error::ActionFailure;
    use crate::fake::FakeHost;
    use crate::model::ModelEntry;

    fn declared() -> DeclaredState {
        DeclaredState::new(
            vec![
                ComponentSpec::new("brew", ComponentKind::PackageManager),
                ComponentSpec::new("ollama", ComponentKind::ModelRuntime).depending_on(&["brew"]),
            ],
            vec![ModelEntry::present("llama3.1:8b").unwrap()],
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_host_reconciles_to_success() {
        let host = FakeHost::new();
        let report = Reconciler::new(&host, SafetySwitches::default()).reconcile(&declared());
        assert_eq!(report.outcome, Outcome::Success);
        assert!(report.verification.all_match());
    }

    #[test]
    fn test_second_run_is_all_noop() {
        let host = FakeHost::new();
        let reconciler = Reconciler::new(&host, SafetySwitches::default());
        reconciler.reconcile(&declared());
        assert!(reconciler.plan(&declared()).is_converged());
    }

    #[test]
    fn test_recoverable_failure_is_failure() {
        let host = FakeHost::new();
        host.fail_pull("llama3.1:8b", ActionFailure::recoverable("registry timeout"));
        let report = Reconciler::new(&host, SafetySwitches::default()).reconcile(&declared());
        assert_eq!(report.outcome, Outcome::Failure);
    }

    #[test]
    fn test_manual_halt_is_action_required() {
        let host = FakeHost::new();
        host.require_manual_launch("ollama");
        let report = Reconciler::new(&host, SafetySwitches::default()).reconcile(&declared());
        assert_eq!(report.outcome, Outcome::ActionRequired);
    }

    #[test]
    fn test_verify_only_does_not_mutate() {
        let host = FakeHost::new();
        let report = Reconciler::new(&host, SafetySwitches::default()).verify_only(&declared());
        assert_eq!(report.outcome, Outcome::Failure);
        assert!(report.execution.is_none());
        assert!(host.mutations().is_empty());
    }
}
