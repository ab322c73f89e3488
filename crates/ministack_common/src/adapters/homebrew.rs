//! Homebrew: the package manager itself, and formulae/casks installed with it.
//!
//! Brew is always invoked by absolute path so a fresh bootstrap works before
//! the operator's shell profile puts /opt/homebrew/bin on PATH.

use crate::command_exec::{CommandError, CommandOutput, CommandRunner};
use crate::declared::{ComponentSpec, DesiredVersion};
use crate::error::{ActionFailure, ProbeUnavailable};
use crate::host::ComponentAdapter;
use crate::probe::Observation;
use crate::settings::HomebrewSettings;
use tracing::{debug, info, warn};

/// Environment for every mutating brew call
const BREW_ENV: &[(&str, &str)] = &[
    ("NONINTERACTIVE", "1"),
    ("HOMEBREW_NO_AUTO_UPDATE", "1"),
    ("HOMEBREW_NO_ENV_HINTS", "1"),
];

/// Thin wrapper over the brew CLI
pub struct Brew<'a> {
    path: String,
    runner: &'a dyn CommandRunner,
}

impl<'a> Brew<'a> {
    pub fn new(settings: &HomebrewSettings, runner: &'a dyn CommandRunner) -> Self {
        Self {
            path: settings.brew_path.display().to_string(),
            runner,
        }
    }

    fn run(&self, args: &[&str], env: &[(&str, &str)]) -> Result<CommandOutput, CommandError> {
        self.runner.run(&self.path, args, env)
    }

    /// Homebrew's own version; `None` when brew is not installed
    pub fn version(&self) -> Result<Option<String>, ProbeUnavailable> {
        match self.run(&["--version"], &[]) {
            Ok(out) if out.success() => Ok(parse_brew_version(&out.stdout)),
            Ok(out) => Err(ProbeUnavailable::new("homebrew", out.failure_summary())),
            Err(CommandError::NotFound { .. }) => Ok(None),
            Err(e) => Err(ProbeUnavailable::new("homebrew", e.to_string())),
        }
    }

    /// Installed version of a formula or cask; `None` when not installed
    /// (including when brew itself is missing)
    pub fn installed_version(
        &self,
        package: &str,
        cask: bool,
    ) -> Result<Option<String>, ProbeUnavailable> {
        let mut args = vec!["list"];
        if cask {
            args.push("--cask");
        }
        args.extend(["--versions", package]);

        match self.run(&args, &[]) {
            // brew exits 1 with no output for packages that are not installed
            Ok(out) if out.success() => Ok(parse_list_versions(&out.stdout)),
            Ok(out) if out.stderr.trim().is_empty() => Ok(None),
            Ok(out) if out.stderr.contains("No such keg") || out.stderr.contains("is not installed") => {
                Ok(None)
            }
            Ok(out) => Err(ProbeUnavailable::new(package, out.failure_summary())),
            Err(CommandError::NotFound { .. }) => Ok(None),
            Err(e) => Err(ProbeUnavailable::new(package, e.to_string())),
        }
    }

    pub fn install(&self, package: &str, cask: bool) -> Result<(), ActionFailure> {
        self.mutate("install", package, cask)
    }

    pub fn upgrade(&self, package: &str, cask: bool) -> Result<(), ActionFailure> {
        self.mutate("upgrade", package, cask)
    }

    /// Whether Homebrew has a formula by exactly this name
    fn formula_exists(&self, formula: &str) -> bool {
        matches!(self.run(&["info", "--formula", formula], &[]), Ok(out) if out.success())
    }

    /// Versioned formula (`python@3.12`) that serves `pin`, most specific first
    pub fn versioned_formula(&self, package: &str, pin: &str) -> Option<String> {
        versioned_candidates(package, pin)
            .into_iter()
            .find(|formula| self.formula_exists(formula))
    }

    fn pinned_formula(&self, package: &str, cask: bool, version: &DesiredVersion) -> Option<String> {
        let pin = version.pinned()?;
        if cask {
            warn!("{} is a cask; casks cannot be pinned, installing the current release", package);
            return None;
        }
        let formula = self.versioned_formula(package, pin);
        if formula.is_none() {
            warn!("Homebrew has no versioned formula for {} {}; using {}", package, pin, package);
        }
        formula
    }

    /// Install, using the versioned formula for a pin when Homebrew has one.
    /// The caller still checks the result against the pin.
    pub fn install_version(
        &self,
        package: &str,
        cask: bool,
        version: &DesiredVersion,
    ) -> Result<(), ActionFailure> {
        match self.pinned_formula(package, cask, version) {
            Some(formula) => self.install(&formula, false),
            None => self.install(package, cask),
        }
    }

    /// Move toward a pin. With a versioned formula that means installing it;
    /// otherwise `brew upgrade` to the current release.
    pub fn upgrade_version(
        &self,
        package: &str,
        cask: bool,
        version: &DesiredVersion,
    ) -> Result<(), ActionFailure> {
        match self.pinned_formula(package, cask, version) {
            Some(formula) => self.install(&formula, false),
            None => self.upgrade(package, cask),
        }
    }

    /// Installed version of a package. When the plain formula misses the pin,
    /// versioned kegs for the pin are checked too.
    pub fn installed_version_for(
        &self,
        package: &str,
        cask: bool,
        version: &DesiredVersion,
    ) -> Result<Option<String>, ProbeUnavailable> {
        Ok(self.installed_keg(package, cask, version)?.map(|(_, v)| v))
    }

    /// Installed formula name and version, preferring the plain formula
    pub fn installed_keg(
        &self,
        package: &str,
        cask: bool,
        version: &DesiredVersion,
    ) -> Result<Option<(String, String)>, ProbeUnavailable> {
        let plain = self.installed_version(package, cask)?;
        let pin = match version.pinned() {
            Some(pin) if !cask && !version.is_satisfied_by(plain.as_deref()) => pin,
            _ => return Ok(plain.map(|v| (package.to_string(), v))),
        };
        for formula in versioned_candidates(package, pin) {
            if let Some(v) = self.installed_version(&formula, false)? {
                debug!("Found versioned keg {} {}", formula, v);
                return Ok(Some((formula, v)));
            }
        }
        Ok(plain.map(|v| (package.to_string(), v)))
    }

    /// `brew services start`: registers a launchd agent so it survives reboot
    pub fn service_start(&self, service: &str) -> Result<(), ActionFailure> {
        let out = self
            .run(&["services", "start", service], BREW_ENV)
            .map_err(|e| self.missing(e))?;
        if out.success() {
            Ok(())
        } else {
            Err(ActionFailure::recoverable(out.failure_summary()))
        }
    }

    fn mutate(&self, verb: &str, package: &str, cask: bool) -> Result<(), ActionFailure> {
        let mut args = vec![verb];
        if cask {
            args.push("--cask");
        }
        args.push(package);

        info!("brew {} {}", verb, package);
        let out = self.run(&args, BREW_ENV).map_err(|e| self.missing(e))?;
        if out.success() {
            Ok(())
        } else if out.stderr.contains("sudo") || out.stderr.contains("password") {
            Err(ActionFailure::manual(
                format!("brew {} {} needs administrator access", verb, package),
                "run `sudo -v` in a terminal on the host, then re-run",
            ))
        } else {
            Err(ActionFailure::recoverable(out.failure_summary()))
        }
    }

    fn missing(&self, err: CommandError) -> ActionFailure {
        match err {
            CommandError::NotFound { .. } => ActionFailure::recoverable(format!(
                "Homebrew is not installed at {}; declare a package_manager component and depend on it",
                self.path
            )),
            other => ActionFailure::recoverable(other.to_string()),
        }
    }
}

/// "python", "3.12.1" -> ["python@3.12.1", "python@3.12", "python@3"]
fn versioned_candidates(package: &str, pin: &str) -> Vec<String> {
    let fields: Vec<&str> = pin
        .trim()
        .trim_start_matches('v')
        .split('.')
        .filter(|f| !f.is_empty())
        .collect();
    (1..=fields.len())
        .rev()
        .map(|n| format!("{}@{}", package, fields[..n].join(".")))
        .collect()
}

/// "Homebrew 4.4.2\nHomebrew/homebrew-core ..." -> "4.4.2"
fn parse_brew_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .next()?
        .strip_prefix("Homebrew ")
        .map(|v| v.trim().to_string())
}

/// "ollama 0.5.6 0.5.7" -> "0.5.7" (the last listed is the linked one)
fn parse_list_versions(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split_whitespace();
    fields.next()?;
    fields.last().map(str::to_string)
}

/// Homebrew itself
pub struct PackageManagerAdapter<'a> {
    brew: Brew<'a>,
    install_script_url: String,
    runner: &'a dyn CommandRunner,
}

impl<'a> PackageManagerAdapter<'a> {
    pub fn new(settings: &HomebrewSettings, runner: &'a dyn CommandRunner) -> Self {
        Self {
            brew: Brew::new(settings, runner),
            install_script_url: settings.install_script_url.clone(),
            runner,
        }
    }
}

impl ComponentAdapter for PackageManagerAdapter<'_> {
    fn probe(&self, _component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        Ok(match self.brew.version()? {
            Some(version) => Observation::installed(Some(&version)),
            None => Observation::absent(),
        })
    }

    fn install(&self, _component: &ComponentSpec) -> Result<(), ActionFailure> {
        info!("Bootstrapping Homebrew from {}", self.install_script_url);
        let script = format!(
            r#"/bin/bash -c "$(curl -fsSL {})""#,
            self.install_script_url
        );
        let out = self
            .runner
            .run("/bin/bash", &["-c", &script], &[("NONINTERACTIVE", "1")])
            .map_err(|e| ActionFailure::recoverable(e.to_string()))?;
        if out.success() {
            return Ok(());
        }
        let text = format!("{}\n{}", out.stdout, out.stderr);
        if text.contains("Need sudo access") {
            Err(ActionFailure::manual(
                "the Homebrew installer needs administrator access",
                "run `sudo -v` in a terminal on the host (or install Homebrew by hand), then re-run",
            ))
        } else {
            Err(ActionFailure::recoverable(out.failure_summary()))
        }
    }

    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        Err(ActionFailure::recoverable(format!(
            "{} is not a service",
            component.name
        )))
    }

    /// Homebrew upgrades itself with `brew update`
    fn upgrade(&self, _component: &ComponentSpec) -> Result<(), ActionFailure> {
        let out = self
            .brew
            .run(&["update"], BREW_ENV)
            .map_err(|e| self.brew.missing(e))?;
        if out.success() {
            Ok(())
        } else {
            Err(ActionFailure::recoverable(out.failure_summary()))
        }
    }
}

/// A formula or cask
pub struct PackageAdapter<'a> {
    brew: Brew<'a>,
}

impl<'a> PackageAdapter<'a> {
    pub fn new(settings: &HomebrewSettings, runner: &'a dyn CommandRunner) -> Self {
        Self {
            brew: Brew::new(settings, runner),
        }
    }
}

impl ComponentAdapter for PackageAdapter<'_> {
    fn probe(&self, component: &ComponentSpec) -> Result<Observation, ProbeUnavailable> {
        Ok(
            match self.brew.installed_version_for(
                component.package_name(),
                component.cask,
                &component.version,
            )? {
                Some(version) => Observation::installed(Some(&version)),
                None => Observation::absent(),
            },
        )
    }

    fn install(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.brew
            .install_version(component.package_name(), component.cask, &component.version)
    }

    fn start(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        Err(ActionFailure::recoverable(format!(
            "{} is not a service",
            component.name
        )))
    }

    fn upgrade(&self, component: &ComponentSpec) -> Result<(), ActionFailure> {
        self.brew
            .upgrade_version(component.package_name(), component.cask, &component.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_exec::{Scripted, ScriptedRunner};
    use crate::declared::ComponentKind;
    use std::path::PathBuf;

    fn settings() -> HomebrewSettings {
        HomebrewSettings {
            brew_path: PathBuf::from("brew"),
            ..HomebrewSettings::default()
        }
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!(
            parse_brew_version("Homebrew 4.4.2\nHomebrew/homebrew-core (git revision 1a2b)\n"),
            Some("4.4.2".to_string())
        );
        assert_eq!(parse_brew_version("brew: command not found"), None);
        assert_eq!(
            parse_list_versions("ollama 0.5.6 0.5.7\n"),
            Some("0.5.7".to_string())
        );
        assert_eq!(parse_list_versions(""), None);
    }

    #[test]
    fn test_missing_brew_means_not_installed() {
        let runner = ScriptedRunner::new().on("brew", Scripted::NotFound);
        let adapter = PackageManagerAdapter::new(&settings(), &runner);
        let obs = adapter
            .probe(&ComponentSpec::new("homebrew", ComponentKind::PackageManager))
            .unwrap();
        assert!(!obs.installed);
    }

    #[test]
    fn test_package_probe_uses_package_name_and_cask() {
        let runner = ScriptedRunner::new().on(
            "brew list --cask --versions visual-studio-code",
            Scripted::ok("visual-studio-code 1.95.3\n"),
        );
        let adapter = PackageAdapter::new(&settings(), &runner);
        let mut spec = ComponentSpec::new("vscode", ComponentKind::Package);
        spec.package = Some("visual-studio-code".to_string());
        spec.cask = true;
        let obs = adapter.probe(&spec).unwrap();
        assert_eq!(obs.version.as_deref(), Some("1.95.3"));
        assert_eq!(obs.running, None);
    }

    #[test]
    fn test_not_installed_package() {
        let runner = ScriptedRunner::new().on("brew list", Scripted::fail(1, ""));
        let adapter = PackageAdapter::new(&settings(), &runner);
        let obs = adapter
            .probe(&ComponentSpec::new("jq", ComponentKind::Package))
            .unwrap();
        assert_eq!(obs, Observation::absent());
    }

    #[test]
    fn test_broken_brew_is_probe_unavailable() {
        let runner = ScriptedRunner::new().on(
            "brew list",
            Scripted::fail(1, "Error: Permission denied @ dir_s_mkdir"),
        );
        let adapter = PackageAdapter::new(&settings(), &runner);
        assert!(adapter
            .probe(&ComponentSpec::new("jq", ComponentKind::Package))
            .is_err());
    }

    #[test]
    fn test_install_failure_is_recoverable() {
        let runner = ScriptedRunner::new().on(
            "brew install jq",
            Scripted::fail(1, "Error: Failed to download resource"),
        );
        let adapter = PackageAdapter::new(&settings(), &runner);
        let err = adapter
            .install(&ComponentSpec::new("jq", ComponentKind::Package))
            .unwrap_err();
        assert!(matches!(err, ActionFailure::Recoverable(_)));
        assert!(err.to_string().contains("Failed to download resource"));
    }

    #[test]
    fn test_versioned_candidates() {
        assert_eq!(
            versioned_candidates("python", "3.12.1"),
            vec!["python@3.12.1", "python@3.12", "python@3"]
        );
        assert_eq!(versioned_candidates("jq", "v1.6"), vec!["jq@1.6", "jq@1"]);
    }

    #[test]
    fn test_pinned_install_uses_versioned_formula() {
        let runner = ScriptedRunner::new()
            .on("brew info --formula jq@1.6", Scripted::ok("==> jq@1.6: stable 1.6\n"))
            .on("brew install jq@1.6", Scripted::ok(""));
        let adapter = PackageAdapter::new(&settings(), &runner);
        let spec = ComponentSpec::new("jq", ComponentKind::Package).with_version("1.6");
        adapter.install(&spec).unwrap();
        assert_eq!(
            runner.calls(),
            vec!["brew info --formula jq@1.6", "brew install jq@1.6"]
        );
    }

    #[test]
    fn test_pin_without_versioned_formula_falls_back() {
        let runner = ScriptedRunner::new()
            .on("brew info", Scripted::fail(1, "Error: No available formula with the name \"jq@1\"."))
            .on("brew upgrade jq", Scripted::ok(""));
        let adapter = PackageAdapter::new(&settings(), &runner);
        let spec = ComponentSpec::new("jq", ComponentKind::Package).with_version("1.6");
        adapter.upgrade(&spec).unwrap();
        assert_eq!(runner.calls().last().map(String::as_str), Some("brew upgrade jq"));
        assert!(!runner.calls().iter().any(|c| c.starts_with("brew install")));
    }

    #[test]
    fn test_probe_finds_versioned_keg_for_pin() {
        let runner = ScriptedRunner::new()
            .on("brew list --versions node@20", Scripted::ok("node@20 20.18.0\n"))
            .on("brew list --versions node", Scripted::ok("node 23.1.0\n"));
        let adapter = PackageAdapter::new(&settings(), &runner);
        let spec = ComponentSpec::new("node", ComponentKind::Package).with_version("20");
        let obs = adapter.probe(&spec).unwrap();
        assert_eq!(obs.version.as_deref(), Some("20.18.0"));

        let unpinned = ComponentSpec::new("node", ComponentKind::Package);
        let obs = adapter.probe(&unpinned).unwrap();
        assert_eq!(obs.version.as_deref(), Some("23.1.0"));
    }

    #[test]
    fn test_bootstrap_needing_sudo_is_manual() {
        let runner = ScriptedRunner::new().on(
            "/bin/bash -c",
            Scripted::fail(1, "==> Checking for `sudo` access\nNeed sudo access on macOS"),
        );
        let adapter = PackageManagerAdapter::new(&settings(), &runner);
        let err = adapter
            .install(&ComponentSpec::new("homebrew", ComponentKind::PackageManager))
            .unwrap_err();
        assert!(matches!(err, ActionFailure::ManualIntervention { .. }));
    }
}
