//! Declared State Store
//!
//! Parses and validates the operator-authored desired state:
//!
//! ```yaml
//! components:
//!   homebrew:
//!     kind: package_manager
//!   ollama:
//!     kind: model_runtime
//!     version: "0.5"
//!     depends_on: [homebrew]
//!   docker:
//!     kind: container_runtime
//!     depends_on: [homebrew]
//!   open-webui:
//!     kind: container_app
//!     compose_file: /opt/ministack/open-webui/compose.yml
//!     depends_on: [docker, ollama]
//! models:
//!   - name: llama3.1:8b
//!   - name: qwen2.5:7b
//!     state: absent
//! ```
//!
//! Pure read: the only side effect is reading the document and logging
//! warnings. Every problem is collected before failing, and unknown fields are
//! rejected rather than ignored.

use crate::error::{ConfigurationError, MinistackError};
use crate::model::{ModelEntry, ModelName, ModelState};
use crate::planner::topological_order;
use crate::safety::SafetySwitch;
use serde::{Deserialize, Serialize, Serializer};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Kind of managed subsystem; selects the adapter that manages it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Homebrew itself
    PackageManager,
    /// A formula or cask installed through the package manager
    Package,
    /// Ollama: installed package plus a service answering on a local port
    ModelRuntime,
    /// Docker Desktop: installed app plus a daemon
    ContainerRuntime,
    /// Compose-deployed application (Open WebUI)
    ContainerApp,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::PackageManager => "package_manager",
            ComponentKind::Package => "package",
            ComponentKind::ModelRuntime => "model_runtime",
            ComponentKind::ContainerRuntime => "container_runtime",
            ComponentKind::ContainerApp => "container_app",
        }
    }

    /// Service-backed kinds have a running state in addition to installed
    pub fn is_service_backed(&self) -> bool {
        matches!(
            self,
            ComponentKind::ModelRuntime | ComponentKind::ContainerRuntime | ComponentKind::ContainerApp
        )
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared version: unpinned, or a version prefix that must be satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredVersion {
    Any,
    Pinned(String),
}

impl DesiredVersion {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("any") || raw == "*" {
            DesiredVersion::Any
        } else {
            DesiredVersion::Pinned(raw.to_string())
        }
    }

    pub fn pinned(&self) -> Option<&str> {
        match self {
            DesiredVersion::Any => None,
            DesiredVersion::Pinned(v) => Some(v),
        }
    }

    /// An unknown observed version never satisfies a pin
    pub fn is_satisfied_by(&self, observed: Option<&str>) -> bool {
        match self {
            DesiredVersion::Any => true,
            DesiredVersion::Pinned(pinned) => {
                observed.is_some_and(|observed| version_satisfies(observed, pinned))
            }
        }
    }

    /// Whether the pin is above the observed version, so an upgrade could
    /// reach it. An unknown observed version counts as below.
    pub fn is_ahead_of(&self, observed: Option<&str>) -> bool {
        match self {
            DesiredVersion::Any => false,
            DesiredVersion::Pinned(pinned) => {
                observed.map_or(true, |observed| version_older_than(observed, pinned))
            }
        }
    }
}

impl fmt::Display for DesiredVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredVersion::Any => f.write_str("any"),
            DesiredVersion::Pinned(v) => f.write_str(v),
        }
    }
}

impl Serialize for DesiredVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// `0.5` is satisfied by `0.5` and `0.5.7`, not by `0.50`. A leading `v` is ignored.
pub fn version_satisfies(observed: &str, pinned: &str) -> bool {
    let observed = observed.trim().trim_start_matches('v');
    let pinned = pinned.trim().trim_start_matches('v');
    observed == pinned || observed.starts_with(&format!("{}.", pinned))
}

/// Whether `observed` sorts below `pinned`, field by field over the fields the
/// pin names. `0.4.9` and `0.5` are older than `0.5.1`; `0.5.7` is not older
/// than `0.5`. Non-numeric fields count as 0.
pub fn version_older_than(observed: &str, pinned: &str) -> bool {
    fn fields(version: &str) -> Vec<u64> {
        version
            .trim()
            .trim_start_matches('v')
            .split('.')
            .map(|field| {
                let digits: String = field.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
    let observed = fields(observed);
    let pinned = fields(pinned);
    let observed = (0..pinned.len()).map(|i| observed.get(i).copied().unwrap_or(0));
    observed.lt(pinned.iter().copied())
}

/// One declared component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSpec {
    pub name: String,
    pub kind: ComponentKind,
    pub version: DesiredVersion,
    pub depends_on: Vec<String>,
    /// Formula/cask name when it differs from the component name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Install a `package` as a cask
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cask: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

impl ComponentSpec {
    pub fn new(name: &str, kind: ComponentKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            version: DesiredVersion::Any,
            depends_on: Vec::new(),
            package: None,
            cask: false,
            compose_file: None,
            project: None,
            environment: BTreeMap::new(),
            health_url: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = DesiredVersion::parse(version);
        self
    }

    pub fn depending_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_compose_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.compose_file = Some(path.into());
        self
    }

    /// Formula or cask to hand to the package manager
    pub fn package_name(&self) -> &str {
        self.package.as_deref().unwrap_or(&self.name)
    }

    /// Compose project name
    pub fn project_name(&self) -> &str {
        self.project.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawComponent {
    kind: ComponentKind,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    cask: bool,
    #[serde(default)]
    compose_file: Option<PathBuf>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    health_url: Option<String>,
}

/// Validated desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredState {
    components: Vec<ComponentSpec>,
    models: Vec<ModelEntry>,
    /// Indices into `components`, dependencies first
    #[serde(skip)]
    order: Vec<usize>,
}

impl DeclaredState {
    /// Build from already-typed values, applying the same validation as a document
    pub fn new(
        components: Vec<ComponentSpec>,
        models: Vec<ModelEntry>,
    ) -> Result<Self, ConfigurationError> {
        let mut problems = Vec::new();
        let order = validate(&components, &models, &mut problems);
        if problems.is_empty() {
            Ok(Self {
                components,
                models,
                order,
            })
        } else {
            Err(ConfigurationError::new("declared state", problems))
        }
    }

    /// Load and validate a declared-state file
    pub fn load(path: &Path) -> Result<Self, MinistackError> {
        let content = fs::read_to_string(path).map_err(|source| MinistackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let state = Self::from_yaml_str(&content, &path.display().to_string())?;
        debug!(
            "Loaded declared state from {}: {} components, {} models",
            path.display(),
            state.components.len(),
            state.models.len()
        );
        Ok(state)
    }

    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, ConfigurationError> {
        let doc: Value = serde_yaml::from_str(content)
            .map_err(|e| ConfigurationError::single(origin, format!("not valid YAML: {}", e)))?;

        let top = match doc {
            Value::Mapping(map) => map,
            Value::Null => return Err(ConfigurationError::single(origin, "document is empty")),
            other => {
                return Err(ConfigurationError::single(
                    origin,
                    format!("top level must be a mapping, got {}", value_kind(&other)),
                ))
            }
        };

        let mut problems = Vec::new();
        let mut components = Vec::new();
        let mut models = Vec::new();
        let mut models_key: Option<String> = None;

        for (key, value) in top {
            let Some(key) = key.as_str().map(str::to_string) else {
                problems.push(format!("top-level key {:?} must be a string", key));
                continue;
            };
            match key.as_str() {
                "components" => components = parse_components(value, &mut problems),
                // `ollama_models` is the variable name the playbooks used
                "models" | "ollama_models" => {
                    if let Some(previous) = &models_key {
                        problems.push(format!(
                            "both '{}' and '{}' declare models; keep one",
                            previous, key
                        ));
                        continue;
                    }
                    models = parse_models(value, &mut problems);
                    models_key = Some(key);
                }
                "safety" => problems.push(
                    "safety switches cannot be declared in the state document; pass \
                     --allow-upgrade, --refresh-models or --prune-models at invocation"
                        .to_string(),
                ),
                other => match SafetySwitch::parse(other) {
                    Some(switch) => problems.push(format!(
                        "'{}' is a safety switch and cannot be persisted; pass {} at invocation",
                        other,
                        switch.flag()
                    )),
                    None => problems.push(format!("unknown top-level field '{}'", other)),
                },
            }
        }

        let order = validate(&components, &models, &mut problems);
        if problems.is_empty() {
            Ok(Self {
                components,
                models,
                order,
            })
        } else {
            Err(ConfigurationError::new(origin, problems))
        }
    }

    /// Components in declaration order
    pub fn components(&self) -> &[ComponentSpec] {
        &self.components
    }

    /// Components with every dependency before its dependents
    pub fn ordered_components(&self) -> impl Iterator<Item = &ComponentSpec> {
        self.order.iter().map(|&i| &self.components[i])
    }

    pub fn models(&self) -> &[ModelEntry] {
        &self.models
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }

    /// The component that hosts the model registry, if declared
    pub fn model_runtime(&self) -> Option<&ComponentSpec> {
        self.components
            .iter()
            .find(|c| c.kind == ComponentKind::ModelRuntime)
    }

    pub fn model(&self, name: &ModelName) -> Option<&ModelEntry> {
        self.models.iter().find(|m| &m.name == name)
    }

    /// Transitive dependencies of a component (not including itself)
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![name];
        while let Some(current) = stack.pop() {
            if let Some(component) = self.component(current) {
                for dep in &component.depends_on {
                    if seen.insert(dep.clone()) {
                        stack.push(dep);
                    }
                }
            }
        }
        seen
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn parse_components(value: Value, problems: &mut Vec<String>) -> Vec<ComponentSpec> {
    let map = match value {
        Value::Null => return Vec::new(),
        Value::Mapping(map) => map,
        other => {
            problems.push(format!(
                "components must be a mapping of name to component, got {}",
                value_kind(&other)
            ));
            return Vec::new();
        }
    };

    let mut components = Vec::new();
    for (key, value) in map {
        let Some(name) = key.as_str().map(str::to_string) else {
            problems.push(format!("component name {:?} must be a string", key));
            continue;
        };
        if name.trim().is_empty() {
            problems.push("component name cannot be empty".to_string());
            continue;
        }
        match serde_yaml::from_value::<RawComponent>(value) {
            Ok(raw) => {
                if let Some(component) = convert_component(&name, raw, problems) {
                    components.push(component);
                }
            }
            Err(e) => problems.push(format!("components.{}: {}", name, e)),
        }
    }
    components
}

fn convert_component(
    name: &str,
    raw: RawComponent,
    problems: &mut Vec<String>,
) -> Option<ComponentSpec> {
    let version = match raw.version {
        None | Some(Value::Null) => DesiredVersion::Any,
        Some(Value::String(s)) if s.trim().is_empty() => {
            problems.push(format!("components.{}.version cannot be empty", name));
            return None;
        }
        Some(Value::String(s)) => DesiredVersion::parse(&s),
        Some(Value::Number(n)) => {
            problems.push(format!(
                "components.{}.version must be a string; quote it (\"{}\") so it is not read as a number",
                name, n
            ));
            return None;
        }
        Some(other) => {
            problems.push(format!(
                "components.{}.version must be a string, got {}",
                name,
                value_kind(&other)
            ));
            return None;
        }
    };

    Some(ComponentSpec {
        name: name.to_string(),
        kind: raw.kind,
        version,
        depends_on: raw.depends_on,
        package: raw.package,
        cask: raw.cask,
        compose_file: raw.compose_file,
        project: raw.project,
        environment: raw.environment,
        health_url: raw.health_url,
    })
}

fn parse_models(value: Value, problems: &mut Vec<String>) -> Vec<ModelEntry> {
    let items = match value {
        Value::Null => return Vec::new(),
        Value::Sequence(items) => items,
        other => {
            problems.push(format!("models must be a list, got {}", value_kind(&other)));
            return Vec::new();
        }
    };

    let mut models = Vec::new();
    for (idx, item) in items.into_iter().enumerate() {
        let Value::Mapping(map) = item else {
            problems.push(format!(
                "Model at index {} must be a mapping, got {}",
                idx,
                value_kind(&item)
            ));
            continue;
        };

        for key in map.keys() {
            match key.as_str() {
                Some("name") | Some("state") => {}
                Some(other) => problems.push(format!("Model at index {}: unknown field '{}'", idx, other)),
                None => problems.push(format!("Model at index {}: field {:?} must be a string", idx, key)),
            }
        }

        let raw_name = match map.get("name") {
            None => {
                problems.push(format!("Model at index {} missing required 'name' field", idx));
                continue;
            }
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                problems.push(format!("Model at index {}: 'name' must be a string", idx));
                continue;
            }
        };

        let name = match ModelName::parse(&raw_name) {
            Some((name, implicit_tag)) => {
                if implicit_tag {
                    warn!(
                        "Model '{}' has no tag; treating it as '{}'",
                        raw_name.trim(),
                        name
                    );
                }
                name
            }
            None if raw_name.trim().is_empty() => {
                problems.push(format!("Model at index {}: 'name' cannot be empty", idx));
                continue;
            }
            None => {
                problems.push(format!(
                    "Model at index {}: '{}' is not a valid model name",
                    idx, raw_name
                ));
                continue;
            }
        };

        let state = match map.get("state") {
            None => ModelState::Present,
            Some(Value::String(s)) => match ModelState::parse(s) {
                Some(state) => state,
                None => {
                    problems.push(format!(
                        "Model '{}': 'state' must be 'present' or 'absent', got '{}'",
                        name, s
                    ));
                    continue;
                }
            },
            Some(other) => {
                problems.push(format!(
                    "Model '{}': 'state' must be 'present' or 'absent', got {}",
                    name,
                    value_kind(other)
                ));
                continue;
            }
        };

        models.push(ModelEntry { name, state });
    }
    models
}

/// Cross-field rules. Returns the dependency order (empty when invalid).
fn validate(
    components: &[ComponentSpec],
    models: &[ModelEntry],
    problems: &mut Vec<String>,
) -> Vec<usize> {
    let before = problems.len();

    let mut names = HashSet::new();
    for component in components {
        if !names.insert(component.name.as_str()) {
            problems.push(format!("Duplicate component name: '{}'", component.name));
        }
    }

    for component in components {
        let prefix = format!("components.{}", component.name);
        let mut seen_deps = HashSet::new();
        for dep in &component.depends_on {
            if dep == &component.name {
                problems.push(format!("{} cannot depend on itself", prefix));
            } else if !names.contains(dep.as_str()) {
                problems.push(format!(
                    "{}.depends_on: '{}' is not a declared component",
                    prefix, dep
                ));
            } else if !seen_deps.insert(dep.as_str()) {
                problems.push(format!("{}.depends_on lists '{}' twice", prefix, dep));
            }
        }
        validate_kind_fields(component, &prefix, problems);
    }

    let runtimes: Vec<&str> = components
        .iter()
        .filter(|c| c.kind == ComponentKind::ModelRuntime)
        .map(|c| c.name.as_str())
        .collect();
    if runtimes.len() > 1 {
        problems.push(format!(
            "at most one model_runtime may be declared, found: {}",
            runtimes.join(", ")
        ));
    }

    let mut seen_models = HashSet::new();
    for model in models {
        if !seen_models.insert(&model.name) {
            problems.push(format!("Duplicate model name: '{}'", model.name));
        }
    }

    if problems.len() > before {
        return Vec::new();
    }

    match topological_order(components) {
        Ok(order) => order,
        Err(cycle) => {
            problems.push(format!(
                "dependency cycle between components: {}",
                cycle.join(", ")
            ));
            Vec::new()
        }
    }
}

fn validate_kind_fields(component: &ComponentSpec, prefix: &str, problems: &mut Vec<String>) {
    let kind = component.kind;
    let is_app = kind == ComponentKind::ContainerApp;

    if is_app && component.compose_file.is_none() {
        problems.push(format!("{}: container_app requires 'compose_file'", prefix));
    }
    if !is_app {
        for (field, set) in [
            ("compose_file", component.compose_file.is_some()),
            ("project", component.project.is_some()),
            ("environment", !component.environment.is_empty()),
        ] {
            if set {
                problems.push(format!(
                    "{}: '{}' is only valid for container_app, not {}",
                    prefix, field, kind
                ));
            }
        }
    }
    if is_app && component.package.is_some() {
        problems.push(format!("{}: 'package' is not valid for container_app", prefix));
    }
    if component.cask && kind != ComponentKind::Package {
        problems.push(format!("{}: 'cask' is only valid for package, not {}", prefix, kind));
    }
    if is_app && component.version.pinned().is_some() {
        problems.push(format!(
            "{}: version pinning is not supported for container_app; pin the image tag in the compose file",
            prefix
        ));
    }
    if let Some(url) = &component.health_url {
        if !kind.is_service_backed() {
            problems.push(format!(
                "{}: 'health_url' is only valid for service-backed components",
                prefix
            ));
        } else if !url.starts_with("http://") && !url.starts_with("https://") {
            problems.push(format!("{}: health_url must be an http(s) URL", prefix));
        }
    }
}
