//! CLI integration tests for ministackctl
//!
//! Only commands that never touch the host are driven here:
//! - ministackctl --help
//! - ministackctl validate STATE [--json]
//! - usage and settings errors

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const VALID: &str = r#"
components:
  homebrew:
    kind: package_manager
  ollama:
    kind: model_runtime
    depends_on: [homebrew]
models:
  - name: llama3.1:8b
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.toml"), "[log]\nlevel = \"warn\"\n").unwrap();
        Self { dir }
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn log_file(&self) -> PathBuf {
        self.dir.path().join("runs.jsonl")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_ministackctl"))
            .args(args)
            .arg("--settings")
            .arg(self.dir.path().join("settings.toml"))
            .env("MINISTACK_LOG_FILE", self.log_file())
            .env_remove("MINISTACK_SETTINGS")
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to run ministackctl")
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_ministackctl"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["reconcile", "plan", "verify", "validate"] {
        assert!(stdout.contains(sub), "help should mention {}", sub);
    }
}

#[test]
fn test_missing_subcommand_is_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_ministackctl"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_read_only_commands_reject_switches() {
    let ws = Workspace::new();
    let state = ws.file("state.yml", VALID);
    let output = ws.run(&["verify", path_arg(&state), "--prune-models"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_validate_valid_document() {
    let ws = Workspace::new();
    let state = ws.file("state.yml", VALID);
    let output = ws.run(&["validate", path_arg(&state)]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[OK] 2 components, 1 models"));
    assert!(stdout.contains("order: homebrew -> ollama"));
}

#[test]
fn test_validate_invalid_document_exits_ex_config() {
    let ws = Workspace::new();
    let state = ws.file(
        "state.yml",
        "models:\n  - name: mistral\n  - name: mistral:latest\nprune_models: true\n",
    );
    let output = ws.run(&["validate", path_arg(&state)]);
    assert_eq!(output.status.code(), Some(78));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Duplicate model name: 'mistral:latest'"));
    assert!(stderr.contains("--prune-models"));
}

#[test]
fn test_validate_json_reports_problems() {
    let ws = Workspace::new();
    let state = ws.file("state.yml", "components:\n  docker:\n    kind: hypervisor\n");
    let output = ws.run(&["validate", path_arg(&state), "--json"]);
    assert_eq!(output.status.code(), Some(78));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["code"], -32010);
    assert!(json["error"]["problems"][0]
        .as_str()
        .unwrap()
        .starts_with("components.docker"));
}

#[test]
fn test_validate_json_valid_document() {
    let ws = Workspace::new();
    let state = ws.file("state.yml", VALID);
    let output = ws.run(&["validate", path_arg(&state), "--json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["order"], serde_json::json!(["homebrew", "ollama"]));
}

#[test]
fn test_missing_state_file_exits_ex_config() {
    let ws = Workspace::new();
    let missing = ws.dir.path().join("absent.yml");
    let output = ws.run(&["validate", path_arg(&missing)]);
    assert_eq!(output.status.code(), Some(78));
}

#[test]
fn test_broken_settings_file_exits_ex_config() {
    let ws = Workspace::new();
    let state = ws.file("state.yml", VALID);
    ws.file("settings.toml", "[ollama]\napi_url = \"localhost:11434\"\n");
    let output = ws.run(&["validate", path_arg(&state)]);
    assert_eq!(output.status.code(), Some(78));
    assert!(String::from_utf8_lossy(&output.stderr).contains("api_url"));
}

#[test]
fn test_every_invocation_is_logged() {
    let ws = Workspace::new();
    let state = ws.file("state.yml", VALID);
    ws.run(&["validate", path_arg(&state)]);
    let bad = ws.file("bad.yml", "components: [1, 2]\n");
    ws.run(&["validate", path_arg(&bad)]);

    let content = std::fs::read_to_string(ws.log_file()).unwrap();
    let entries: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["command"], "validate");
    assert_eq!(entries[0]["exit_code"], 0);
    assert_eq!(entries[0]["ok"], true);
    assert_eq!(entries[1]["exit_code"], 78);
    assert_eq!(entries[1]["error"]["code"], -32010);
    assert_ne!(entries[0]["req_id"], entries[1]["req_id"]);
}
