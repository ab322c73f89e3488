//! Safety switches
//!
//! Default-off flags gating destructive or version-changing actions. They are
//! only ever set from invocation-time flags: the type is `Serialize` (so runs
//! can be audited) but deliberately not `Deserialize`.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetySwitch {
    /// Upgrade installed components whose version does not satisfy the pin
    AllowUpgrade,
    /// Re-pull models that are already present
    RefreshModels,
    /// Remove observed models that are not declared at all
    PruneModels,
}

impl SafetySwitch {
    pub const ALL: [SafetySwitch; 3] = [
        SafetySwitch::AllowUpgrade,
        SafetySwitch::RefreshModels,
        SafetySwitch::PruneModels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetySwitch::AllowUpgrade => "allow_upgrade",
            SafetySwitch::RefreshModels => "refresh_models",
            SafetySwitch::PruneModels => "prune_models",
        }
    }

    /// Command-line flag that enables this switch
    pub fn flag(&self) -> &'static str {
        match self {
            SafetySwitch::AllowUpgrade => "--allow-upgrade",
            SafetySwitch::RefreshModels => "--refresh-models",
            SafetySwitch::PruneModels => "--prune-models",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|switch| switch.as_str() == s)
    }
}

impl fmt::Display for SafetySwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective switch settings for one run. `Default` is all off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SafetySwitches {
    pub allow_upgrade: bool,
    pub refresh_models: bool,
    pub prune_models: bool,
}

impl SafetySwitches {
    pub fn is_enabled(&self, switch: SafetySwitch) -> bool {
        match switch {
            SafetySwitch::AllowUpgrade => self.allow_upgrade,
            SafetySwitch::RefreshModels => self.refresh_models,
            SafetySwitch::PruneModels => self.prune_models,
        }
    }

    pub fn enable(mut self, switch: SafetySwitch) -> Self {
        match switch {
            SafetySwitch::AllowUpgrade => self.allow_upgrade = true,
            SafetySwitch::RefreshModels => self.refresh_models = true,
            SafetySwitch::PruneModels => self.prune_models = true,
        }
        self
    }

    pub fn enabled(&self) -> Vec<SafetySwitch> {
        SafetySwitch::ALL
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }
}
