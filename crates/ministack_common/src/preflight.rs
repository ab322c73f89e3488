//! Host guard for mutating runs.
//!
//! Everything the adapters drive (Homebrew under /opt/homebrew, Docker
//! Desktop, `open -a`) is macOS-specific. `plan` and `verify` only read and
//! may run anywhere; `reconcile` refuses other platforms unless
//! `run.allow_non_darwin` is set.

use crate::error::MinistackError;
use tracing::warn;

/// Check an OS/arch pair (as in `std::env::consts`). Returns warnings.
pub fn check(os: &str, arch: &str, allow_non_darwin: bool) -> Result<Vec<String>, MinistackError> {
    let mut warnings = Vec::new();

    if os != "macos" {
        if !allow_non_darwin {
            return Err(MinistackError::Preflight(format!(
                "this host runs {}, but the managed stack is macOS-only (set run.allow_non_darwin to override)",
                os
            )));
        }
        warnings.push(format!("running on {} with run.allow_non_darwin set", os));
    } else if arch != "aarch64" {
        warnings.push(format!(
            "architecture is {}; default tool paths assume Apple Silicon (/opt/homebrew)",
            arch
        ));
    }

    for warning in &warnings {
        warn!("Preflight: {}", warning);
    }
    Ok(warnings)
}

/// Check the running host
pub fn check_current(allow_non_darwin: bool) -> Result<Vec<String>, MinistackError> {
    check(std::env::consts::OS, std::env::consts::ARCH, allow_non_darwin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apple_silicon_passes_clean() {
        assert!(check("macos", "aarch64", false).unwrap().is_empty());
    }

    #[test]
    fn test_intel_mac_warns() {
        let warnings = check("macos", "x86_64", false).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("/opt/homebrew"));
    }

    #[test]
    fn test_linux_refused_without_override() {
        let err = check("linux", "x86_64", false).unwrap_err();
        assert!(matches!(err, MinistackError::Preflight(_)));
        assert!(err.to_string().contains("allow_non_darwin"));
    }

    #[test]
    fn test_linux_allowed_with_override() {
        let warnings = check("linux", "x86_64", true).unwrap();
        assert_eq!(warnings.len(), 1);
    }
}
