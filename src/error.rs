use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("failed to load config from {path}")]
    #[diagnostic(code(executor::config))]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    #[diagnostic(code(executor::config))]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    #[diagnostic(code(executor::config))]
    Validation { message: String },

    #[error("provisioning failed: {message}")]
    #[diagnostic(code(executor::provision))]
    Provision {
        message: String,
        #[help]
        hint: String,
    },

    #[error("storage operation failed: {message}")]
    #[diagnostic(code(executor::storage))]
    Storage {
        message: String,
        #[help]
        hint: String,
    },

    #[error("timed out after {seconds}s waiting for {what}")]
    #[diagnostic(code(executor::timeout))]
    Timeout { what: String, seconds: u64 },

    #[error("remote session failed: {message}")]
    #[diagnostic(code(executor::remote))]
    Remote {
        message: String,
        #[help]
        hint: String,
    },

    #[error("remote command `{command}` exited with status {exit_code}")]
    #[diagnostic(code(executor::remote_command))]
    RemoteCommand { command: String, exit_code: i32 },

    #[error("VM '{name}' not found")]
    #[diagnostic(code(executor::not_found))]
    NotFound { name: String },

    #[error("{context}")]
    #[diagnostic(code(executor::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutorError {
    /// Exit status of a failed remote command, if this is one.
    pub fn command_exit_code(&self) -> Option<i32> {
        match self {
            ExecutorError::RemoteCommand { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Exit codes handed to us by the CI runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitCodes {
    pub build_failure: Option<i32>,
    pub system_failure: Option<i32>,
}

/// Used when the runner does not provide `SYSTEM_FAILURE_EXIT_CODE`.
pub const DEFAULT_SYSTEM_FAILURE: i32 = 2;

impl ExitCodes {
    /// Map a stage failure to the process exit code.
    ///
    /// A job script that exits non-zero is a build failure; everything else
    /// (libvirt, storage, SSH plumbing, config) is a system failure.
    pub fn for_error(&self, err: &ExecutorError) -> i32 {
        match err.command_exit_code() {
            Some(code) => self.build_failure.unwrap_or(code),
            None => self.system_failure.unwrap_or(DEFAULT_SYSTEM_FAILURE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_failure(exit_code: i32) -> ExecutorError {
        ExecutorError::RemoteCommand {
            command: "./runner/scripts/build.sh".into(),
            exit_code,
        }
    }

    #[test]
    fn script_failure_uses_build_failure_code() {
        let codes = ExitCodes {
            build_failure: Some(17),
            system_failure: Some(18),
        };
        assert_eq!(codes.for_error(&command_failure(1)), 17);
    }

    #[test]
    fn script_failure_propagates_own_status_without_runner_code() {
        let codes = ExitCodes::default();
        assert_eq!(codes.for_error(&command_failure(1)), 1);
        assert_eq!(codes.for_error(&command_failure(42)), 42);
    }

    #[test]
    fn other_faults_are_system_failures() {
        let err = ExecutorError::NotFound {
            name: "gitlab-runner-abc123".into(),
        };
        assert_eq!(ExitCodes::default().for_error(&err), DEFAULT_SYSTEM_FAILURE);

        let codes = ExitCodes {
            build_failure: Some(1),
            system_failure: Some(9),
        };
        let err = ExecutorError::Timeout {
            what: "an IPv4 address".into(),
            seconds: 60,
        };
        assert_eq!(codes.for_error(&err), 9);
    }

    #[test]
    fn messages_name_the_fault() {
        let err = ExecutorError::Timeout {
            what: "SSH on 192.168.122.10".into(),
            seconds: 30,
        };
        assert_eq!(
            err.to_string(),
            "timed out after 30s waiting for SSH on 192.168.122.10"
        );
        assert_eq!(
            command_failure(3).to_string(),
            "remote command `./runner/scripts/build.sh` exited with status 3"
        );
    }
}
