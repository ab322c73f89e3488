//! Command dispatch
//!
//! Settings are loaded once here and passed down by reference. Every
//! invocation, successful or not, leaves one record in the run log.

use crate::cli::{Cli, Command};
use crate::errors::{exit_code_for, exit_code_for_error, EXIT_SUCCESS};
use crate::logging::{self, ErrorDetails, RunLogEntry, RunSummary};
use crate::output;
use anyhow::{Context, Result};
use ministack_common::command_exec::SystemRunner;
use ministack_common::{
    preflight, DeclaredState, Host, MinistackError, Outcome, Plan, ReconcileReport, Reconciler,
    RunControl, SafetySwitches, Settings, SystemHost,
};
use std::io::IsTerminal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// What a command produced, before rendering
#[derive(Debug)]
pub enum Completed {
    Validated(DeclaredState),
    Planned { plan: Plan, switches: SafetySwitches },
    Report(ReconcileReport),
}

impl Completed {
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Completed::Report(report) => Some(report.outcome),
            Completed::Validated(_) | Completed::Planned { .. } => None,
        }
    }

    /// `validate` and `plan` only fail before this point
    pub fn exit_code(&self) -> i32 {
        self.outcome().map(exit_code_for).unwrap_or(EXIT_SUCCESS)
    }

    fn render(&self, json: bool, color: bool) -> Result<()> {
        match (self, json) {
            (Completed::Validated(declared), true) => {
                output::print_json(&output::validation_json(declared))
            }
            (Completed::Validated(declared), false) => {
                print!("{}", output::render_validation(declared, color));
                Ok(())
            }
            (Completed::Planned { plan, switches }, true) => {
                output::print_json(&output::plan_json(plan, switches))
            }
            (Completed::Planned { plan, switches }, false) => {
                print!("{}", output::render_plan(plan, switches, color));
                Ok(())
            }
            (Completed::Report(report), true) => output::print_json(report),
            (Completed::Report(report), false) => {
                print!("{}", output::render_report(report, color));
                Ok(())
            }
        }
    }
}

/// Run one invocation end to end and return the process exit status
pub fn run(cli: &Cli, stop: Arc<AtomicBool>) -> Result<i32> {
    let started = Instant::now();
    let command = &cli.command;
    let json = command.state().json;

    let mut entry = RunLogEntry::new(command.name(), command.state_file());
    entry.switches = command
        .switches()
        .enabled()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

    let result = match Settings::load(cli.settings.as_deref()) {
        Ok((settings, source)) => {
            logging::init_tracing(cli.log_level.as_deref(), &settings.log.level);
            match source {
                Some(path) => debug!("Settings loaded from {}", path.display()),
                None => debug!("No settings file found, using defaults"),
            }
            dispatch(command, &settings, stop)
        }
        Err(e) => {
            logging::init_tracing(cli.log_level.as_deref(), "info");
            Err(e)
        }
    };

    let exit_code = match result {
        Ok(completed) => {
            completed
                .render(json, !json && std::io::stdout().is_terminal())
                .context("Failed to write report")?;
            entry.outcome = completed.outcome().map(|o| o.as_str().to_string());
            if let Completed::Report(report) = &completed {
                entry.summary = Some(RunSummary::from_report(report));
            }
            completed.exit_code()
        }
        Err(err) => {
            error!("{} failed: {}", command.name(), err);
            if json {
                output::print_json(&output::error_json(&err)).context("Failed to write error")?;
            } else {
                eprint!("{}", output::render_error(&err, std::io::stderr().is_terminal()));
            }
            entry.error = Some(ErrorDetails {
                code: err.code(),
                message: err.to_string(),
            });
            exit_code_for_error(&err)
        }
    };

    entry.exit_code = exit_code;
    entry.ok = exit_code == EXIT_SUCCESS;
    entry.duration_ms = started.elapsed().as_millis() as u64;
    if let Err(e) = entry.write() {
        warn!("Could not write run log: {}", e);
    }

    Ok(exit_code)
}

/// Load the declared state and run the command against the real host
pub fn dispatch(
    command: &Command,
    settings: &Settings,
    stop: Arc<AtomicBool>,
) -> Result<Completed, MinistackError> {
    let declared = DeclaredState::load(command.state_file())?;
    if let Command::Validate { .. } = command {
        return Ok(Completed::Validated(declared));
    }
    let runner = SystemRunner;
    let host = SystemHost::new(settings, &runner);
    execute(command, settings, declared, &host, stop)
}

/// Run the engine part of a command against any host
pub fn execute(
    command: &Command,
    settings: &Settings,
    declared: DeclaredState,
    host: &dyn Host,
    stop: Arc<AtomicBool>,
) -> Result<Completed, MinistackError> {
    match command {
        Command::Validate { .. } => Ok(Completed::Validated(declared)),
        Command::Plan { switches, .. } => {
            let switches = switches.to_switches();
            let plan = Reconciler::new(host, switches).plan(&declared);
            Ok(Completed::Planned { plan, switches })
        }
        Command::Verify { .. } => Ok(Completed::Report(
            Reconciler::new(host, SafetySwitches::default()).verify_only(&declared),
        )),
        Command::Reconcile {
            switches, timeout, ..
        } => {
            preflight::check_current(settings.run.allow_non_darwin)?;
            let mut control = RunControl::new().with_stop_flag(stop);
            if let Some(limit) = timeout.map(Duration::from_secs).or_else(|| settings.run_timeout()) {
                control = control.with_timeout(limit);
            }
            let report = Reconciler::new(host, switches.to_switches())
                .with_control(control)
                .reconcile(&declared);
            Ok(Completed::Report(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{EXIT_ACTION_REQUIRED, EXIT_FAILURE};
    use clap::Parser;
    use ministack_common::fake::FakeHost;
    use ministack_common::{ComponentKind, ComponentSpec, ExecutionStatus, Halt, ModelEntry};
    use std::sync::atomic::Ordering;

    fn command(args: &[&str]) -> Command {
        let mut argv = vec!["ministackctl"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).command
    }

    fn permissive() -> Settings {
        let mut settings = Settings::default();
        settings.run.allow_non_darwin = true;
        settings
    }

    fn declared() -> DeclaredState {
        DeclaredState::new(
            vec![
                ComponentSpec::new("homebrew", ComponentKind::PackageManager),
                ComponentSpec::new("ollama", ComponentKind::ModelRuntime)
                    .depending_on(&["homebrew"]),
            ],
            vec![ModelEntry::present("llama3.1:8b").unwrap()],
        )
        .unwrap()
    }

    fn no_stop() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_plan_never_mutates() {
        let host = FakeHost::new();
        let done = execute(
            &command(&["plan", "s.yml", "--prune-models"]),
            &permissive(),
            declared(),
            &host,
            no_stop(),
        )
        .unwrap();
        assert!(host.mutations().is_empty());
        assert_eq!(done.exit_code(), EXIT_SUCCESS);
        match done {
            Completed::Planned { plan, switches } => {
                assert_eq!(plan.mutating().count(), 4);
                assert!(switches.prune_models);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_verify_on_fresh_host_is_failure() {
        let host = FakeHost::new();
        let done = execute(&command(&["verify", "s.yml"]), &permissive(), declared(), &host, no_stop())
            .unwrap();
        assert_eq!(done.exit_code(), EXIT_FAILURE);
        assert!(host.mutations().is_empty());
    }

    #[test]
    fn test_reconcile_converges() {
        let host = FakeHost::new();
        let done = execute(&command(&["reconcile", "s.yml"]), &permissive(), declared(), &host, no_stop())
            .unwrap();
        assert_eq!(done.outcome(), Some(Outcome::Success));
        assert_eq!(done.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_reconcile_manual_step_exits_action_required() {
        let host = FakeHost::new();
        host.require_manual_launch("ollama");
        let done = execute(&command(&["reconcile", "s.yml"]), &permissive(), declared(), &host, no_stop())
            .unwrap();
        assert_eq!(done.exit_code(), EXIT_ACTION_REQUIRED);
    }

    #[test]
    fn test_stop_flag_halts_reconcile() {
        let host = FakeHost::new();
        let stop = no_stop();
        stop.store(true, Ordering::SeqCst);
        let done = execute(&command(&["reconcile", "s.yml"]), &permissive(), declared(), &host, stop)
            .unwrap();
        let Completed::Report(report) = done else {
            panic!("expected a report");
        };
        let execution = report.execution.unwrap();
        assert_eq!(execution.halted, Some(Halt::Interrupted));
        assert!(execution
            .results
            .iter()
            .all(|r| r.status == ExecutionStatus::Blocked));
        assert!(host.mutations().is_empty());
    }

    #[test]
    fn test_reconcile_refused_off_macos_without_override() {
        if cfg!(target_os = "macos") {
            return;
        }
        let host = FakeHost::new();
        let err = execute(
            &command(&["reconcile", "s.yml"]),
            &Settings::default(),
            declared(),
            &host,
            no_stop(),
        )
        .unwrap_err();
        assert!(matches!(err, MinistackError::Preflight(_)));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_dispatch_validate_reads_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.yml");
        std::fs::write(
            &path,
            "components:\n  homebrew:\n    kind: package_manager\nmodels:\n  - name: mistral\n",
        )
        .unwrap();
        let cmd = command(&["validate", path.to_str().unwrap()]);
        let done = dispatch(&cmd, &Settings::default(), no_stop()).unwrap();
        match done {
            Completed::Validated(declared) => assert_eq!(declared.models().len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_missing_state_file_is_io_error() {
        let cmd = command(&["validate", "/nonexistent/ministack/state.yml"]);
        let err = dispatch(&cmd, &Settings::default(), no_stop()).unwrap_err();
        assert!(matches!(err, MinistackError::Io { .. }));
    }
}
