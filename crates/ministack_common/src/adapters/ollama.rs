//! Ollama: model runtime component and the model registry behind it.
//!
//! Endpoints used:
//! - GET /api/version - liveness
//! - GET /api/tags - installed models
//!
//! Pulls and removals go through the `ollama` CLI so progress and errors are
//! reported by the tool itself.

use super::homebrew::Brew;
use super::{http_ok, wait_until};
use crate::command_exec::{CommandError, CommandRunner};
use crate::declared::ComponentSpec;
use crate::error::{ActionFailure, ProbeUnavailable};
use crate::host::{ComponentAdapter, ModelRegistry};
use crate::model::ModelName;
use crate::probe::Observation;
use crate::settings::{HomebrewSettings, OllamaSettings};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// Model info from /api/tags
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
}

/// Response from /api/tags
#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<OllamaModel>,
}

pub struct OllamaAdapter<'a> {
    settings: &'a OllamaSettings,
    brew: Brew<'a>,
    runner: &'a dyn CommandRunner,
}

impl<'a> OllamaAdapter<'a> {
    pub fn new(
        settings: &'a OllamaSettings,
        homebrew: &HomebrewSettings,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            settings,
            brew: Brew::new(homebrew, runner),
            runner,
        }
    }

    fn binary(&self) -> String {
        self.settings.binary.display().to_string()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_secs)
    }

    fn health_url(&self, component: &ComponentSpec) -> String {
        component
            .health_url
            .clone()
            .unwrap_or_else(|| format!("{}/api/version", self.settings.api_url))
    }

    fn is_running(&self, component: &ComponentSpec) -> bool {
        http_ok(&self.health_url(component), self.request_timeout())
    }

    fn cli(&self, args: &[&str]) -> Result<(), ActionFailure> {
        let out = self.runner.run(&self.binary(), args, &[]).map_err(|e| match e {
            CommandError::NotFound { program } => {
                ActionFailure::recoverable(format!("{} not found; is the model runtime installed?", program))
            }
            other => ActionFailure::recoverable(other.to_string()),
        })?;
        if out.success() {
            Ok(())
        } else {
            Err(ActionFailure::recoverable(out.failure_summary()))
        }
    }
}

/// Pull the version out of `ollama --version`.
///
/// With the server down it prints a warning first and then
/// "Warning: client version is 0.5.7"; with it up, "ollama version is 0.5.7".
pub fn parse_ollama_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.split_once("version is ")
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Parse a /api/tags body into canonical model names
pub fn parse_tags(body: &str) -> Result<BTreeSet<ModelName>, String> {
    let tags: TagsResponse = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let mut names = BTreeSet::new();
    for model in tags.models {
        match ModelName::canonical(&model.name) {
            Some(name) => {
                names.insert(name);
            }
            None => warn!("Ignoring unparseable model name from runtime: {:?}", model.name),
        }
    }
    Ok(names)
}

impl ComponentAdapter for OllamaAdapter<'_> {
    fn probe(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        let out = match self.runner.run(&self.binary(), &["--version"], &[]) {
            Ok(out) => out,
            Err(CommandError::NotFound { .. }) => return Ok(Observation::absent()),
            Err(e) => return Err(ProbeUnavailable::new(&component.name, e.to_string())),
        };
        // `--version` exits 0 even when the server is down; the text says so
        let text = format!("{}\n{}", out.stdout, out.stderr);
        let version = parse_ollama_version(&text);
        if !out.success() && version.is_none() {
            return Err(ProbeUnavailable::new(&component.name, out.failure_summary()));
        }
        Ok(Observation::installed(version.as_deref()).with_running(self.is_running(component)))
    }

    fn install(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.brew
            .install_version(component.package_name(), false, &component.version)
    }

    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        info!("Starting {} as a Homebrew service", component.name);
        // A pin may have been served by a versioned formula, which owns the service
        let service = match component.version.pinned() {
            Some(_) => self
                .brew
                .installed_keg(component.package_name(), false, &component.version)
                .ok()
                .flatten()
                .map(|(formula, _)| formula)
                .unwrap_or_else(|| component.package_name().to_string()),
            None => component.package_name().to_string(),
        };
        self.brew.service_start(&service)?;
        let timeout = Duration::from_secs(self.settings.start_timeout_secs);
        if wait_until(timeout, || self.is_running(component)) {
            Ok(())
        } else {
            Err(ActionFailure::recoverable(format!(
                "{} did not answer on {} within {}s",
                component.name,
                self.health_url(component),
                timeout.as_secs()
            )))
        }
    }

    fn upgrade(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.brew
            .upgrade_version(component.package_name(), false, &component.version)
    }
}

impl ModelRegistry for OllamaAdapter<'_> {
    fn list(&self) -> Result<BTreeSet<ModelName>, ProbeUnavailable> {
        let url = format!("{}/api/tags", self.settings.api_url);
        let unavailable = |reason: String| ProbeUnavailable::new("models", reason);

        let client = reqwest::blocking::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .map_err(|e| unavailable(e.to_string()))?;
        let resp = client.get(&url).send().map_err(|e| {
            if e.is_timeout() {
                unavailable(format!("{} timed out", url))
            } else {
                unavailable(format!("{} unreachable: {}", url, e))
            }
        })?;
        if !resp.status().is_success() {
            return Err(unavailable(format!("{} returned {}", url, resp.status())));
        }
        let body = resp.text().map_err(|e| unavailable(e.to_string()))?;
        parse_tags(&body).map_err(|e| unavailable(format!("unexpected /api/tags body: {}", e)))
    }

    fn pull(&self, name: &ModelName) -> Result<(), ActionFailure> {
        info!("Pulling model {}", name);
        self.cli(&["pull", name.as_str()])
    }

    fn remove(&self, name: &ModelName) -> Result<(), ActionFailure> {
        info!("Removing model {}", name);
        self.cli(&["rm", name.as_str()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_exec::{Scripted, ScriptedRunner};
    use crate::declared::ComponentKind;
    use std::path::PathBuf;

    /// Nothing listens here, so every HTTP check fails fast
    fn settings() -> OllamaSettings {
        OllamaSettings {
            binary: PathBuf::from("ollama"),
            api_url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 1,
            start_timeout_secs: 0,
        }
    }

    fn homebrew() -> HomebrewSettings {
        HomebrewSettings {
            brew_path: PathBuf::from("brew"),
            ..HomebrewSettings::default()
        }
    }

    fn spec() -> ComponentSpec {
        ComponentSpec::new("ollama", ComponentKind::ModelRuntime)
    }

    #[test]
    fn test_parse_version_server_up_and_down() {
        assert_eq!(
            parse_ollama_version("ollama version is 0.5.7\n"),
            Some("0.5.7".to_string())
        );
        assert_eq!(
            parse_ollama_version(
                "Warning: could not connect to a running Ollama instance\nWarning: client version is 0.5.7\n"
            ),
            Some("0.5.7".to_string())
        );
        assert_eq!(parse_ollama_version("garbage"), None);
    }

    #[test]
    fn test_parse_tags_canonicalizes() {
        let body = r#"{"models":[{"name":"llama3.1:8b","size":4920753328},{"name":"nomic-embed-text"}]}"#;
        let names = parse_tags(body).unwrap();
        assert!(names.contains(&ModelName::canonical("llama3.1:8b").unwrap()));
        assert!(names.contains(&ModelName::canonical("nomic-embed-text:latest").unwrap()));
        assert!(parse_tags(r#"{}"#).unwrap().is_empty());
        assert!(parse_tags("<html>").is_err());
    }

    #[test]
    fn test_probe_missing_binary_is_absent() {
        let runner = ScriptedRunner::new();
        let settings = settings();
        let adapter = OllamaAdapter::new(&settings, &homebrew(), &runner);
        assert_eq!(adapter.probe(&spec()).unwrap(), Observation::absent());
    }

    #[test]
    fn test_probe_installed_but_not_serving() {
        let runner = ScriptedRunner::new().on(
            "ollama --version",
            Scripted::ok("Warning: could not connect to a running Ollama instance\nWarning: client version is 0.5.7\n"),
        );
        let settings = settings();
        let adapter = OllamaAdapter::new(&settings, &homebrew(), &runner);
        let obs = adapter.probe(&spec()).unwrap();
        assert!(obs.installed);
        assert_eq!(obs.version.as_deref(), Some("0.5.7"));
        assert_eq!(obs.running, Some(false));
    }

    #[test]
    fn test_list_unreachable_is_probe_unavailable() {
        let runner = ScriptedRunner::new();
        let settings = settings();
        let adapter = OllamaAdapter::new(&settings, &homebrew(), &runner);
        let err = adapter.list().unwrap_err();
        assert_eq!(err.target, "models");
    }

    #[test]
    fn test_start_times_out_as_recoverable() {
        let runner = ScriptedRunner::new().on("brew services start ollama", Scripted::ok(""));
        let settings = settings();
        let adapter = OllamaAdapter::new(&settings, &homebrew(), &runner);
        let err = adapter.start(&spec()).unwrap_err();
        assert!(matches!(err, ActionFailure::Recoverable(_)));
        assert_eq!(runner.calls(), vec!["brew services start ollama"]);
    }

    #[test]
    fn test_pinned_install_and_start_follow_versioned_formula() {
        let runner = ScriptedRunner::new()
            .on("brew info --formula ollama@0.5", Scripted::ok("==> ollama@0.5\n"))
            .on("brew install ollama@0.5", Scripted::ok(""))
            .on("brew list --versions ollama@0.5", Scripted::ok("ollama@0.5 0.5.7\n"))
            .on("brew list --versions ollama", Scripted::fail(1, ""))
            .on("brew services start ollama@0.5", Scripted::ok(""));
        let settings = settings();
        let adapter = OllamaAdapter::new(&settings, &homebrew(), &runner);
        let pinned = spec().with_version("0.5");
        adapter.install(&pinned).unwrap();
        // nothing answers on the API, so start reports a timeout after launching
        assert!(adapter.start(&pinned).is_err());
        let calls = runner.calls();
        assert!(calls.contains(&"brew install ollama@0.5".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("brew services start ollama@0.5"));
    }

    #[test]
    fn test_pull_and_remove_use_cli() {
        let runner = ScriptedRunner::new()
            .on("ollama pull", Scripted::ok("success\n"))
            .on("ollama rm", Scripted::fail(1, "Error: model 'x:1' not found"));
        let settings = settings();
        let adapter = OllamaAdapter::new(&settings, &homebrew(), &runner);
        let name = ModelName::canonical("llama3.1:8b").unwrap();
        adapter.pull(&name).unwrap();
        let err = adapter.remove(&ModelName::canonical("x:1").unwrap()).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert_eq!(runner.calls(), vec!["ollama pull llama3.1:8b", "ollama rm x:1"]);
    }
}
