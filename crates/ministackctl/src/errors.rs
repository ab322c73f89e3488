//! Exit status for ministackctl
//!
//! Scripts and launchd wrappers branch on these, so they are stable.

use ministack_common::{MinistackError, Outcome};

/// Exit code for success
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for a mismatch or an unresolved failure
pub const EXIT_FAILURE: i32 = 1;

/// Exit code for bad command-line usage (clap's own)
pub const EXIT_USAGE: i32 = 2;

/// Exit code when an operator step is pending before the next run can converge
pub const EXIT_ACTION_REQUIRED: i32 = 3;

/// Exit code for an invalid declared-state document or settings file (EX_CONFIG)
pub const EXIT_CONFIG: i32 = 78;

/// Map a run outcome to the process exit status
pub fn exit_code_for(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Success => EXIT_SUCCESS,
        Outcome::ActionRequired => EXIT_ACTION_REQUIRED,
        Outcome::Failure => EXIT_FAILURE,
    }
}

/// Map an error raised before the engine ran
pub fn exit_code_for_error(err: &MinistackError) -> i32 {
    match err {
        MinistackError::Configuration(_)
        | MinistackError::Settings { .. }
        | MinistackError::Io { .. } => EXIT_CONFIG,
        MinistackError::Preflight(_) => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ministack_common::ConfigurationError;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(exit_code_for(Outcome::Success), 0);
        assert_eq!(exit_code_for(Outcome::ActionRequired), 3);
        assert_eq!(exit_code_for(Outcome::Failure), 1);
    }

    #[test]
    fn test_configuration_errors_are_ex_config() {
        let err = MinistackError::from(ConfigurationError::single("s.yml", "bad"));
        assert_eq!(exit_code_for_error(&err), EXIT_CONFIG);
        let refused = MinistackError::Preflight("linux".to_string());
        assert_eq!(exit_code_for_error(&refused), EXIT_FAILURE);
    }
}
