//! Output formatting - ASCII-only terminal reports and `--json` documents
//!
//! Renderers return strings so they can be tested without a terminal; color is
//! decided once by the caller.

use ministack_common::{
    Blocked, ConfigurationError, DeclaredState, ExecutionResult, ExecutionStatus, MinistackError,
    Outcome, Plan, ReconcileReport, SafetySwitches, VerificationEntry, VerificationStatus, Verb,
};
use owo_colors::{OwoColorize, Style};
use serde::Serialize;
use std::fmt::Write;

/// Width of the status column, e.g. `[MISMATCH]`
const TAG_WIDTH: usize = 10;

fn paint(text: &str, style: Style, color: bool) -> String {
    if color {
        text.style(style).to_string()
    } else {
        text.to_string()
    }
}

fn tag(label: &str, style: Style, color: bool) -> String {
    let padded = format!("{:<width$}", format!("[{}]", label), width = TAG_WIDTH);
    paint(&padded, style, color)
}

fn header(label: &str, color: bool) -> String {
    paint(&format!("[{}]", label), Style::new().bold(), color)
}

fn enabled_switches(switches: &SafetySwitches) -> String {
    let names: Vec<&str> = switches.enabled().iter().map(|s| s.flag()).collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(" ")
    }
}

/// Human-readable plan
pub fn render_plan(plan: &Plan, switches: &SafetySwitches, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} actions, {} would change the host (switches: {})",
        header("PLAN", color),
        plan.actions.len(),
        plan.mutating().count(),
        enabled_switches(switches)
    );
    for action in &plan.actions {
        let style = if action.verb == Verb::NoOp {
            Style::new().dimmed()
        } else {
            Style::new().cyan()
        };
        let _ = write!(out, "  {} {}", tag(action.verb.as_str(), style, color), action.target);
        if let Some(detail) = &action.detail {
            let _ = write!(out, ": {}", detail);
        }
        if let Some(gate) = action.gate {
            let _ = write!(out, " ({})", gate.flag());
        }
        out.push('\n');
    }
    render_blocked(&mut out, &plan.blocked, color);
    if plan.is_converged() {
        let _ = writeln!(out, "{} host already matches", tag("OK", Style::new().green(), color));
    }
    out
}

fn render_blocked(out: &mut String, blocked: &[Blocked], color: bool) {
    if blocked.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}", header("UNPLANNED", color));
    for entry in blocked {
        let _ = writeln!(
            out,
            "  {} {}: {}",
            tag("BLOCKED", Style::new().red(), color),
            entry.target,
            entry.reason
        );
    }
}

fn execution_line(result: &ExecutionResult, color: bool) -> String {
    let (label, style) = match result.status {
        ExecutionStatus::Applied => ("OK", Style::new().green()),
        ExecutionStatus::SkippedNoop => ("SKIP", Style::new().dimmed()),
        ExecutionStatus::FailedRecoverable => ("FAIL", Style::new().red()),
        ExecutionStatus::FailedManualInterventionRequired => ("MANUAL", Style::new().yellow()),
        ExecutionStatus::Blocked => ("BLOCKED", Style::new().red()),
    };
    let mut line = format!("  {} {} {}", tag(label, style, color), result.verb, result.target);
    if let Some(diagnostic) = &result.diagnostic {
        let _ = write!(line, ": {}", diagnostic);
    }
    if let Some(remediation) = &result.remediation {
        let _ = write!(line, "\n  {:width$} -> {}", "", remediation, width = TAG_WIDTH);
    }
    line
}

fn verification_line(entry: &VerificationEntry, color: bool) -> String {
    let (label, style) = match entry.status {
        VerificationStatus::Matches => ("OK", Style::new().green()),
        VerificationStatus::ManualInterventionPending => ("PENDING", Style::new().yellow()),
        VerificationStatus::Mismatch => ("MISMATCH", Style::new().red()),
    };
    let mut line = format!("  {} {}: {}", tag(label, style, color), entry.target, entry.detail);
    if let Some(hint) = &entry.hint {
        let _ = write!(line, "\n  {:width$} -> {}", "", hint, width = TAG_WIDTH);
    }
    line
}

/// Human-readable reconcile or verify report
pub fn render_report(report: &ReconcileReport, color: bool) -> String {
    let mut out = String::new();
    if let Some(execution) = &report.execution {
        let _ = writeln!(
            out,
            "{} (switches: {})",
            header("EXECUTION", color),
            enabled_switches(&report.switches)
        );
        for result in &execution.results {
            let _ = writeln!(out, "{}", execution_line(result, color));
        }
        render_blocked(&mut out, &execution.unplanned, color);
        if let Some(halt) = &execution.halted {
            let _ = writeln!(out, "  halted: {}", halt);
        }
    }

    let _ = writeln!(out, "{}", header("VERIFY", color));
    for entry in &report.verification.entries {
        let _ = writeln!(out, "{}", verification_line(entry, color));
    }

    let outcome = report.outcome.as_str();
    let outcome = match report.outcome {
        Outcome::Success => paint(outcome, Style::new().green(), color),
        Outcome::ActionRequired => paint(outcome, Style::new().yellow(), color),
        Outcome::Failure => paint(outcome, Style::new().red(), color),
    };
    let _ = writeln!(out, "{} {}", header("RESULT", color), outcome);
    out
}

/// Summary of a valid declared-state document
pub fn render_validation(declared: &DeclaredState, color: bool) -> String {
    let order: Vec<&str> = declared
        .ordered_components()
        .map(|c| c.name.as_str())
        .collect();
    let mut out = format!(
        "{} {} components, {} models\n",
        paint("[OK]", Style::new().green(), color),
        declared.components().len(),
        declared.models().len()
    );
    if !order.is_empty() {
        let _ = writeln!(out, "  order: {}", order.join(" -> "));
    }
    out
}

/// Error text for stderr, one problem per line
pub fn render_error(err: &MinistackError, color: bool) -> String {
    let mut out = format!("{} ", paint("[ERROR]", Style::new().red(), color));
    match err {
        MinistackError::Configuration(ConfigurationError { origin, problems }) => {
            let _ = writeln!(out, "declared state in {} is invalid:", origin);
            for problem in problems {
                let _ = writeln!(out, "  * {}", problem);
            }
        }
        other => {
            let _ = writeln!(out, "{}", other);
        }
    }
    out
}

#[derive(Serialize)]
struct JsonError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    problems: Vec<String>,
}

/// `--json` document for an error raised before the engine ran
pub fn error_json(err: &MinistackError) -> serde_json::Value {
    let error = JsonError {
        code: err.code(),
        message: err.to_string(),
        problems: match err {
            MinistackError::Configuration(e) => e.problems.clone(),
            _ => Vec::new(),
        },
    };
    serde_json::json!({
        "ok": false,
        "error": error,
    })
}

/// `--json` document for a plan
pub fn plan_json(plan: &Plan, switches: &SafetySwitches) -> serde_json::Value {
    serde_json::json!({
        "switches": switches,
        "converged": plan.is_converged(),
        "plan": plan,
    })
}

/// `--json` document for a valid declared state
pub fn validation_json(declared: &DeclaredState) -> serde_json::Value {
    let order: Vec<&str> = declared
        .ordered_components()
        .map(|c| c.name.as_str())
        .collect();
    serde_json::json!({
        "ok": true,
        "order": order,
        "declared": declared,
    })
}

/// Print a JSON document on stdout
pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ministack_common::fake::FakeHost;
    use ministack_common::{
        ActionFailure, ComponentKind, ComponentSpec, ModelEntry, Reconciler, SafetySwitch,
    };

    fn declared() -> DeclaredState {
        DeclaredState::new(
            vec![
                ComponentSpec::new("homebrew", ComponentKind::PackageManager),
                ComponentSpec::new("docker", ComponentKind::ContainerRuntime)
                    .depending_on(&["homebrew"]),
            ],
            vec![ModelEntry::present("llama3.1:8b").unwrap()],
        )
        .unwrap()
    }

    #[test]
    fn test_plan_text_lists_actions_and_switches() {
        let host = FakeHost::new();
        let switches = SafetySwitches::default().enable(SafetySwitch::PruneModels);
        let plan = Reconciler::new(&host, switches).plan(&declared());
        let text = render_plan(&plan, &switches, false);
        assert!(text.starts_with("[PLAN] 4 actions, 4 would change the host (switches: --prune-models)"));
        assert!(text.contains("[install]  homebrew"));
        assert!(text.contains("[pull]     model llama3.1:8b"));
        assert!(!text.contains("\u{1b}["));
    }

    #[test]
    fn test_report_shows_remediation_for_manual_step() {
        let host = FakeHost::new();
        host.require_manual_launch("docker");
        let report = Reconciler::new(&host, SafetySwitches::default()).reconcile(&declared());
        let text = render_report(&report, false);
        assert!(text.contains("[MANUAL]   start docker"));
        assert!(text.contains("-> launch the application and re-run"));
        assert!(text.contains("halted: docker needs manual intervention"));
        assert!(text.contains("[RESULT] action_required"));
    }

    #[test]
    fn test_report_shows_failures() {
        let host = FakeHost::new();
        host.fail_install("docker", ActionFailure::recoverable("cask download failed"));
        let report = Reconciler::new(&host, SafetySwitches::default()).reconcile(&declared());
        let text = render_report(&report, false);
        assert!(text.contains("[FAIL]     install docker: cask download failed"));
        assert!(text.contains("[MISMATCH]"));
        assert!(text.contains("[RESULT] failure"));
    }

    #[test]
    fn test_color_adds_escape_codes() {
        let plan = Plan::default();
        let text = render_plan(&plan, &SafetySwitches::default(), true);
        assert!(text.contains("\u{1b}["));
    }

    #[test]
    fn test_validation_summary() {
        let text = render_validation(&declared(), false);
        assert!(text.contains("2 components, 1 models"));
        assert!(text.contains("order: homebrew -> docker"));
    }

    #[test]
    fn test_configuration_error_lists_problems() {
        let err = MinistackError::from(ConfigurationError::new(
            "state.yml",
            vec!["first".to_string(), "second".to_string()],
        ));
        let text = render_error(&err, false);
        assert!(text.starts_with("[ERROR] declared state in state.yml is invalid:"));
        assert!(text.contains("  * first\n  * second\n"));

        let json = error_json(&err);
        assert_eq!(json["error"]["code"], -32010);
        assert_eq!(json["error"]["problems"][1], "second");
    }

    #[test]
    fn test_plan_json_shape() {
        let host = FakeHost::new();
        let switches = SafetySwitches::default();
        let plan = Reconciler::new(&host, switches).plan(&declared());
        let json = plan_json(&plan, &switches);
        assert_eq!(json["converged"], false);
        assert_eq!(json["plan"]["actions"][0]["verb"], "install");
        assert_eq!(json["plan"]["actions"][0]["target"]["type"], "component");
        assert_eq!(json["switches"]["prune_models"], false);
    }
}
