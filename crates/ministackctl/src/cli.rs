//! Command-line surface

use clap::{Args, Parser, Subcommand};
use ministack_common::{SafetySwitch, SafetySwitches};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "ministackctl",
    about = "Reconcile a Mac mini LLM server with its declared state",
    version
)]
pub struct Cli {
    /// Settings file (default: $MINISTACK_SETTINGS, then the standard locations)
    #[arg(long, global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Log level or filter (overrides RUST_LOG and the settings file)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe the host, apply the plan, then verify
    Reconcile {
        #[command(flatten)]
        state: StateArgs,

        #[command(flatten)]
        switches: SwitchArgs,

        /// Stop starting new actions after this many seconds
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },

    /// Show what reconcile would do, without changing anything
    Plan {
        #[command(flatten)]
        state: StateArgs,

        #[command(flatten)]
        switches: SwitchArgs,
    },

    /// Compare the live host with the declared state (read-only)
    Verify {
        #[command(flatten)]
        state: StateArgs,
    },

    /// Check the declared-state document without touching the host
    Validate {
        #[command(flatten)]
        state: StateArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// Declared-state YAML document
    #[arg(value_name = "STATE")]
    pub file: PathBuf,

    /// Print a JSON report on stdout instead of text
    #[arg(long)]
    pub json: bool,
}

/// Safety switches. All default off and are never read from a file.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct SwitchArgs {
    /// Upgrade installed components whose version does not satisfy the pin
    #[arg(long)]
    pub allow_upgrade: bool,

    /// Pull declared models again even if present
    #[arg(long)]
    pub refresh_models: bool,

    /// Remove models that are on the host but not declared
    #[arg(long)]
    pub prune_models: bool,
}

impl SwitchArgs {
    pub fn to_switches(self) -> SafetySwitches {
        let mut switches = SafetySwitches::default();
        for (on, switch) in [
            (self.allow_upgrade, SafetySwitch::AllowUpgrade),
            (self.refresh_models, SafetySwitch::RefreshModels),
            (self.prune_models, SafetySwitch::PruneModels),
        ] {
            if on {
                switches = switches.enable(switch);
            }
        }
        switches
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reconcile { .. } => "reconcile",
            Command::Plan { .. } => "plan",
            Command::Verify { .. } => "verify",
            Command::Validate { .. } => "validate",
        }
    }

    pub fn state(&self) -> &StateArgs {
        match self {
            Command::Reconcile { state, .. }
            | Command::Plan { state, .. }
            | Command::Verify { state }
            | Command::Validate { state } => state,
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state().file
    }

    /// Switches in effect; always off for read-only commands without flags
    pub fn switches(&self) -> SafetySwitches {
        match self {
            Command::Reconcile { switches, .. } | Command::Plan { switches, .. } => {
                switches.to_switches()
            }
            Command::Verify { .. } | Command::Validate { .. } => SafetySwitches::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_switches_default_off() {
        let cli = Cli::try_parse_from(["ministackctl", "reconcile", "state.yml"]).unwrap();
        assert_eq!(cli.command.switches(), SafetySwitches::default());
        assert_eq!(cli.command.state_file(), Path::new("state.yml"));
    }

    #[test]
    fn test_switch_flags_enable_switches() {
        let cli = Cli::try_parse_from([
            "ministackctl",
            "plan",
            "state.yml",
            "--allow-upgrade",
            "--prune-models",
            "--json",
        ])
        .unwrap();
        let switches = cli.command.switches();
        assert!(switches.is_enabled(SafetySwitch::AllowUpgrade));
        assert!(!switches.is_enabled(SafetySwitch::RefreshModels));
        assert!(switches.is_enabled(SafetySwitch::PruneModels));
        assert!(cli.command.state().json);
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ministackctl",
            "verify",
            "state.yml",
            "--settings",
            "/etc/ministack/settings.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(
            cli.settings.as_deref(),
            Some(Path::new("/etc/ministack/settings.toml"))
        );
    }

    #[test]
    fn test_verify_takes_no_switches() {
        assert!(Cli::try_parse_from(["ministackctl", "verify", "s.yml", "--prune-models"]).is_err());
    }

    #[test]
    fn test_timeout_must_be_positive() {
        assert!(Cli::try_parse_from(["ministackctl", "reconcile", "s.yml", "--timeout", "0"]).is_err());
        let cli = Cli::try_parse_from(["ministackctl", "reconcile", "s.yml", "--timeout", "600"]).unwrap();
        assert!(matches!(cli.command, Command::Reconcile { timeout: Some(600), .. }));
    }
}
