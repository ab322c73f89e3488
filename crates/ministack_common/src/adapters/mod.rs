//! Production adapters: one per subsystem, all driving native tools through a
//! [`CommandRunner`] plus a couple of local HTTP endpoints.
//!
//! | kind              | adapter                  | native interface                  |
//! |-------------------|--------------------------|-----------------------------------|
//! | package_manager   | [`PackageManagerAdapter`]| `brew --version`, install script  |
//! | package           | [`PackageAdapter`]       | `brew list/install/upgrade`       |
//! | model_runtime     | [`OllamaAdapter`]        | brew + `brew services` + HTTP API |
//! | container_runtime | [`DockerAdapter`]        | Docker.app, `docker info`         |
//! | container_app     | [`ComposeAdapter`]       | `docker compose`                  |

pub mod docker;
pub mod homebrew;
pub mod ollama;

pub use docker::{ComposeAdapter, DockerAdapter};
pub use homebrew::{Brew, PackageAdapter, PackageManagerAdapter};
pub use ollama::OllamaAdapter;

use crate::command_exec::CommandRunner;
use crate::declared::ComponentKind;
use crate::host::{ComponentAdapter, Host, ModelRegistry};
use crate::settings::Settings;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Interval between readiness checks while waiting for a service
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The real host, wired from settings
pub struct SystemHost<'a> {
    package_manager: PackageManagerAdapter<'a>,
    packages: PackageAdapter<'a>,
    ollama: OllamaAdapter<'a>,
    docker: DockerAdapter<'a>,
    compose: ComposeAdapter<'a>,
}

impl<'a> SystemHost<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn CommandRunner) -> Self {
        Self {
            package_manager: PackageManagerAdapter::new(&settings.homebrew, runner),
            packages: PackageAdapter::new(&settings.homebrew, runner),
            ollama: OllamaAdapter::new(&settings.ollama, &settings.homebrew, runner),
            docker: DockerAdapter::new(&settings.docker, &settings.homebrew, runner),
            compose: ComposeAdapter::new(&settings.docker, runner),
        }
    }
}

impl Host for SystemHost<'_> {
    fn adapter(&self, kind: ComponentKind) -> &dyn ComponentAdapter {
        match kind {
            ComponentKind::PackageManager => &self.package_manager,
            ComponentKind::Package => &self.packages,
            ComponentKind::ModelRuntime => &self.ollama,
            ComponentKind::ContainerRuntime => &self.docker,
            ComponentKind::ContainerApp => &self.compose,
        }
    }

    fn models(&self) -> &dyn ModelRegistry {
        &self.ollama
    }
}

/// GET `url` and report whether it answered 2xx within `timeout`
pub fn http_ok(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            debug!("Could not build HTTP client: {}", e);
            return false;
        }
    };
    match client.get(url).send() {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            debug!("GET {} failed: {}", url, e);
            false
        }
    }
}

/// Poll `ready` until it returns true or `timeout` passes. Always checks once.
pub fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if ready() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_exec::ScriptedRunner;

    #[test]
    fn test_wait_until_checks_once_with_zero_timeout() {
        let mut checks = 0;
        assert!(!wait_until(Duration::ZERO, || {
            checks += 1;
            false
        }));
        assert_eq!(checks, 1);
    }

    #[test]
    fn test_wait_until_returns_as_soon_as_ready() {
        assert!(wait_until(Duration::from_secs(30), || true));
    }

    #[test]
    fn test_http_ok_false_when_nothing_listens() {
        assert!(!http_ok("http://127.0.0.1:9/", Duration::from_millis(200)));
    }

    #[test]
    fn test_system_host_routes_kinds() {
        let settings = Settings::default();
        let runner = ScriptedRunner::new();
        let host = SystemHost::new(&settings, &runner);
        // Every kind resolves to an adapter; nothing runs until one is called
        for kind in [
            ComponentKind::PackageManager,
            ComponentKind::Package,
            ComponentKind::ModelRuntime,
            ComponentKind::ContainerRuntime,
            ComponentKind::ContainerApp,
        ] {
            let _ = host.adapter(kind);
        }
        assert!(runner.calls().is_empty());
    }
}
