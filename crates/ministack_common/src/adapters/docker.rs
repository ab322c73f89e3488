//! Docker Desktop (container runtime) and compose-deployed apps.
//!
//! Docker Desktop is the one component that routinely needs a human: its
//! first launch asks for license acceptance and privileged-helper approval.
//! Until that happens the CLI symlinks under /usr/local/bin do not exist,
//! which is how a pending first launch is detected.

use super::homebrew::Brew;
use super::{http_ok, wait_until};
use crate::command_exec::{CommandError, CommandOutput, CommandRunner};
use crate::declared::ComponentSpec;
use crate::error::{ActionFailure, ProbeUnavailable};
use crate::host::{ComponentAdapter, MANUAL_LAUNCH_HINT};
use crate::probe::Observation;
use crate::settings::{DockerSettings, HomebrewSettings};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Cask used when the component does not name one
const DOCKER_CASK: &str = "docker";

/// stderr fragments meaning the daemon is down rather than the command broken
const DAEMON_DOWN: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "docker.sock",
];

/// Why a compose app's state is unknown while the daemon is down
pub const DAEMON_NOT_RUNNING: &str = "Docker daemon not running";

/// "Docker version 27.3.1, build ce12230" -> "27.3.1"
pub fn parse_docker_version(stdout: &str) -> Option<String> {
    let rest = stdout.trim().strip_prefix("Docker version ")?;
    let version = rest.split(',').next()?.trim();
    (!version.is_empty()).then(|| version.to_string())
}

fn daemon_down(out: &CommandOutput) -> bool {
    DAEMON_DOWN.iter().any(|s| out.stderr.contains(s))
}

pub struct DockerAdapter<'a> {
    settings: &'a DockerSettings,
    brew: Brew<'a>,
    runner: &'a dyn CommandRunner,
}

impl<'a> DockerAdapter<'a> {
    pub fn new(
        settings: &'a DockerSettings,
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

    fn cask<'s>(&self, component: &'s ComponentSpec) -> &'s str {
        component.package.as_deref().unwrap_or(DOCKER_CASK)
    }

    /// CLI version, `None` when the CLI is not linked yet
    fn cli_version(&self) -> Result<Option<String>, ProbeUnavailable> {
        match self.runner.run(&self.binary(), &["--version"], &[]) {
            Ok(out) if out.success() => Ok(parse_docker_version(&out.stdout)),
            Ok(out) => Err(ProbeUnavailable::new("docker", out.failure_summary())),
            Err(CommandError::NotFound { .. }) => Ok(None),
            Err(e) => Err(ProbeUnavailable::new("docker", e.to_string())),
        }
    }

    fn daemon_running(&self) -> bool {
        match self
            .runner
            .run(&self.binary(), &["info", "--format", "{{.ServerVersion}}"], &[])
        {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("docker info: {}", e);
                false
            }
        }
    }

    fn app_present(&self) -> bool {
        self.settings.app_path.exists()
    }
}

impl ComponentAdapter for DockerAdapter<'_> {
    fn probe(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        let cli = self.cli_version()?;
        let app = self.app_present();

        if cli.is_none() && !app {
            // Cask installed somewhere else?
            return Ok(
                match self.brew.installed_version(self.cask(component), true)? {
                    Some(version) => Observation::installed(Some(&version)).with_running(false),
                    None => Observation::absent(),
                },
            );
        }

        let running = cli.is_some() && self.daemon_running();
        let mut obs = Observation::installed(cli.as_deref()).with_running(running);
        if !running && cli.is_none() {
            obs.pending_manual = Some(MANUAL_LAUNCH_HINT.to_string());
        }
        Ok(obs)
    }

    fn install(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.brew
            .install_version(self.cask(component), true, &component.version)
    }

    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        let app = self.settings.app_path.display().to_string();
        let first_launch = matches!(self.cli_version(), Ok(None));

        info!("Launching {}", app);
        let out = self
            .runner
            .run("open", &["-g", "-a", &app], &[])
            .map_err(|e| ActionFailure::recoverable(e.to_string()))?;
        if !out.success() {
            return Err(ActionFailure::recoverable(out.failure_summary()));
        }

        let timeout = Duration::from_secs(self.settings.start_timeout_secs);
        if wait_until(timeout, || self.daemon_running()) {
            return Ok(());
        }

        let reason = if first_launch {
            format!(
                "{} has never completed its first launch; it needs interactive approval",
                component.name
            )
        } else {
            format!(
                "{} daemon did not come up within {}s; Docker Desktop is probably waiting on a dialog",
                component.name,
                timeout.as_secs()
            )
        };
        Err(ActionFailure::manual(reason, MANUAL_LAUNCH_HINT))
    }

    fn upgrade(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.brew
            .upgrade_version(self.cask(component), true, &component.version)
    }
}

/// One entry of `docker compose ps --format json`
#[derive(Debug, Clone, Deserialize)]
pub struct ComposeContainer {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Health", default)]
    pub health: String,
}

impl ComposeContainer {
    pub fn is_up(&self) -> bool {
        self.state == "running" && self.health != "unhealthy" && self.health != "starting"
    }
}

/// Older compose prints one JSON array, newer prints one object per line
pub fn parse_compose_ps(stdout: &str) -> Result<Vec<ComposeContainer>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| e.to_string());
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| e.to_string()))
        .collect()
}

/// A `docker compose` project
pub struct ComposeAdapter<'a> {
    settings: &'a DockerSettings,
    runner: &'a dyn CommandRunner,
}

impl<'a> ComposeAdapter<'a> {
    pub fn new(settings: &'a DockerSettings, runner: &'a dyn CommandRunner) -> Self {
        Self { settings, runner }
    }

    fn compose(
        &self,
        component: &ComponentSpec,
        args: &[&str],
    ) -> Result<CommandOutput, CommandError> {
        let file = component
            .compose_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let mut full = vec!["compose", "-f", file.as_str(), "-p", component.project_name()];
        full.extend_from_slice(args);
        let env: Vec<(&str, &str)> = component
            .environment
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.runner
            .run(&self.settings.binary.display().to_string(), &full, &env)
    }

    fn mutate(&self, component: &ComponentSpec, args: &[&str]) -> Result<(), ActionFailure> {
        let out = self.compose(component, args).map_err(|e| match e {
            CommandError::NotFound { program } => ActionFailure::recoverable(format!(
                "{} not found; declare the container runtime as a dependency",
                program
            )),
            other => ActionFailure::recoverable(other.to_string()),
        })?;
        if out.success() {
            Ok(())
        } else if daemon_down(&out) {
            Err(ActionFailure::recoverable(format!(
                "Docker daemon is not running: {}",
                out.failure_summary()
            )))
        } else {
            Err(ActionFailure::recoverable(out.failure_summary()))
        }
    }

    fn healthy(&self, component: &ComponentSpec) -> bool {
        match &component.health_url {
            Some(url) => http_ok(url, Duration::from_secs(self.settings.request_timeout_secs)),
            None => true,
        }
    }
}

impl ComponentAdapter for ComposeAdapter<'_> {
    fn probe(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        if let Some(file) = &component.compose_file {
            if !file.exists() {
                return Err(ProbeUnavailable::new(
                    &component.name,
                    format!("compose file {} does not exist", file.display()),
                ));
            }
        }

        let out = match self.compose(component, &["ps", "--all", "--format", "json"]) {
            Ok(out) => out,
            Err(CommandError::NotFound { .. }) => return Ok(Observation::absent()),
            Err(e) => return Err(ProbeUnavailable::new(&component.name, e.to_string())),
        };
        if !out.success() {
            if daemon_down(&out) {
                return Ok(Observation::unconfirmed(DAEMON_NOT_RUNNING));
            }
            return Err(ProbeUnavailable::new(&component.name, out.failure_summary()));
        }

        let containers = parse_compose_ps(&out.stdout).map_err(|e| {
            ProbeUnavailable::new(&component.name, format!("unexpected compose ps output: {}", e))
        })?;
        if containers.is_empty() {
            return Ok(Observation::absent());
        }
        let running = containers.iter().all(ComposeContainer::is_up) && self.healthy(component);
        Ok(Observation::installed(None).with_running(running))
    }

    /// Pull images and create containers without starting them
    fn install(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        info!("Deploying {} (create)", component.name);
        self.mutate(component, &["create"])
    }

    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        info!("Deploying {} (up)", component.name);
        self.mutate(component, &["up", "-d"])?;
        if component.health_url.is_none() {
            return Ok(());
        }
        let timeout = Duration::from_secs(self.settings.health_timeout_secs);
        if wait_until(timeout, || self.healthy(component)) {
            Ok(())
        } else {
            Err(ActionFailure::recoverable(format!(
                "{} started but {} did not become healthy within {}s",
                component.name,
                component.health_url.as_deref().unwrap_or_default(),
                timeout.as_secs()
            )))
        }
    }

    fn upgrade(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        Err(ActionFailure::recoverable(format!(
            "{} is versioned by the image tags in its compose file",
            component.name
        )))
    }
}
