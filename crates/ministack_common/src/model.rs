//! Declared models
//!
//! Ollama reports every model with a tag (`llama3.2:latest`), while operators
//! often write the bare name. Names are kept in canonical `name:tag` form so
//! declared and observed sets compare cleanly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag Ollama assumes when none is given
pub const IMPLICIT_TAG: &str = "latest";

/// Canonical, fully-qualified model name (`name:tag`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ModelName(String);

impl ModelName {
    /// Parse a raw name. Returns the canonical name and whether the tag was
    /// implicit. Registry/namespace prefixes (`hf.co/org/repo:Q4_K_M`) are
    /// kept; only a `:` after the last `/` counts as a tag separator.
    pub fn parse(raw: &str) -> Option<(ModelName, bool)> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return None;
        }
        let last_segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
        match last_segment.split_once(':') {
            Some((base, tag)) if !base.is_empty() && !tag.is_empty() => {
                Some((ModelName(trimmed.to_string()), false))
            }
            Some(_) => None,
            None => Some((ModelName(format!("{}:{}", trimmed, IMPLICIT_TAG)), true)),
        }
    }

    /// Canonical form of a name reported by the runtime
    pub fn canonical(raw: &str) -> Option<ModelName> {
        Self::parse(raw).map(|(name, _)| name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tag(&self) -> &str {
        self.0.rsplit_once(':').map(|(_, tag)| tag).unwrap_or(IMPLICIT_TAG)
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired state of a declared model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    #[default]
    Present,
    Absent,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Present => "present",
            ModelState::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(ModelState::Present),
            "absent" => Some(ModelState::Absent),
            _ => None,
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub name: ModelName,
    pub state: ModelState,
}

impl ModelEntry {
    pub fn present(name: &str) -> Option<Self> {
        ModelName::canonical(name).map(|name| Self {
            name,
            state: ModelState::Present,
        })
    }

    pub fn absent(name: &str) -> Option<Self> {
        ModelName::canonical(name).map(|name| Self {
            name,
            state: ModelState::Absent,
        })
    }
}
