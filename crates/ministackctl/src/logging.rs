//! Logging for ministackctl
//!
//! Two streams:
//! - diagnostics through `tracing`, always on stderr so `--json` stdout stays clean
//! - one JSONL audit record per invocation, appended to the run log

use ministack_common::{ExecutionStatus, ReconcileReport, VerificationStatus};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Environment override for the run log location
pub const LOG_FILE_ENV: &str = "MINISTACK_LOG_FILE";

/// Install the tracing subscriber.
///
/// `--log-level` wins, then `RUST_LOG`, then the settings file.
pub fn init_tracing(cli_level: Option<&str>, settings_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings_level)),
    };
    // A second init (tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Audit record for each ministackctl invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// ISO 8601 timestamp
    pub ts: String,

    /// Request ID (UUID)
    pub req_id: String,

    /// Subcommand name
    pub command: String,

    /// Declared-state document given on the command line
    pub state_file: String,

    /// Safety switches in effect, by name
    #[serde(default)]
    pub switches: Vec<String>,

    /// Run outcome (absent when the run never got that far)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,

    pub exit_code: i32,

    /// Duration in milliseconds
    pub duration_ms: u64,

    /// Success flag
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,

    /// Error details if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Per-status counts from a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub blocked: usize,
    pub matches: usize,
    pub pending: usize,
    pub mismatches: usize,
}

impl RunSummary {
    pub fn from_report(report: &ReconcileReport) -> Self {
        let mut summary = RunSummary {
            matches: report.verification.count(VerificationStatus::Matches),
            pending: report
                .verification
                .count(VerificationStatus::ManualInterventionPending),
            mismatches: report.verification.count(VerificationStatus::Mismatch),
            ..RunSummary::default()
        };
        if let Some(execution) = &report.execution {
            summary.applied = execution.count(ExecutionStatus::Applied);
            summary.skipped = execution.count(ExecutionStatus::SkippedNoop);
            summary.failed = execution.count(ExecutionStatus::FailedRecoverable)
                + execution.count(ExecutionStatus::FailedManualInterventionRequired);
            summary.blocked = execution.count(ExecutionStatus::Blocked) + execution.unplanned.len();
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: i32,
    pub message: String,
}

impl RunLogEntry {
    pub fn new(command: &str, state_file: &Path) -> Self {
        Self {
            ts: Self::now(),
            req_id: Self::generate_req_id(),
            command: command.to_string(),
            state_file: state_file.display().to_string(),
            switches: Vec::new(),
            outcome: None,
            exit_code: 0,
            duration_ms: 0,
            ok: false,
            summary: None,
            error: None,
        }
    }

    /// Discover log file path with fallback chain
    ///
    /// Priority:
    /// 1. $MINISTACK_LOG_FILE (explicit override)
    /// 2. $XDG_STATE_HOME/ministack/runs.jsonl
    /// 3. ~/.local/state/ministack/runs.jsonl
    pub fn discover_log_path() -> Option<PathBuf> {
        log_path_from(|key| std::env::var(key).ok())
    }

    /// Append to the run log, falling back to stderr on failure
    pub fn write(&self) -> Result<(), std::io::Error> {
        let json = serde_json::to_string(self)?;

        if let Some(path) = Self::discover_log_path() {
            if Self::write_line(&json, &path).is_ok() {
                return Ok(());
            }
        }

        eprintln!("{}", json);
        Ok(())
    }

    /// Append this entry to a specific file
    pub fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string(self)?;
        Self::write_line(&json, path)
    }

    fn write_line(json: &str, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Generate request ID
    pub fn generate_req_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Get current timestamp in ISO 8601 format
    pub fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

fn log_path_from(var: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = var(LOG_FILE_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    if let Some(state) = var("XDG_STATE_HOME").filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(state).join("ministack/runs.jsonl"));
    }
    var("HOME")
        .filter(|p| !p.is_empty())
        .map(|home| PathBuf::from(home).join(".local/state/ministack/runs.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_path_fallback_chain() {
        let all = env(&[
            ("MINISTACK_LOG_FILE", "/tmp/x.jsonl"),
            ("XDG_STATE_HOME", "/state"),
            ("HOME", "/home/op"),
        ]);
        assert_eq!(log_path_from(all), Some(PathBuf::from("/tmp/x.jsonl")));

        let xdg = env(&[("XDG_STATE_HOME", "/state"), ("HOME", "/home/op")]);
        assert_eq!(
            log_path_from(xdg),
            Some(PathBuf::from("/state/ministack/runs.jsonl"))
        );

        let home = env(&[("HOME", "/home/op")]);
        assert_eq!(
            log_path_from(home),
            Some(PathBuf::from("/home/op/.local/state/ministack/runs.jsonl"))
        );

        assert_eq!(log_path_from(env(&[])), None);
    }

    #[test]
    fn test_entries_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/runs.jsonl");

        let mut first = RunLogEntry::new("reconcile", Path::new("state.yml"));
        first.switches = vec!["allow_upgrade".to_string()];
        first.outcome = Some("success".to_string());
        first.ok = true;
        first.write_to(&path).unwrap();

        let mut second = RunLogEntry::new("validate", Path::new("state.yml"));
        second.exit_code = 78;
        second.error = Some(ErrorDetails {
            code: -32010,
            message: "bad document".to_string(),
        });
        second.write_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: RunLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, first);
        assert!(!lines[0].contains("\"error\""));
        assert!(lines[1].contains("\"code\":-32010"));
    }

    #[test]
    fn test_req_ids_are_unique() {
        assert_ne!(RunLogEntry::generate_req_id(), RunLogEntry::generate_req_id());
    }
}
