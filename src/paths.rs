use std::path::{Path, PathBuf};

/// Executor config directory: `~/.config/libvirt-executor/`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("libvirt-executor")
}

/// Config file read when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// SSH identity used when `ssh.identity` is not set.
pub fn default_identity() -> PathBuf {
    config_dir().join("id_ed25519")
}

/// Per-job log file: `<log_dir>/<vm-name>.log`
pub fn job_log_path(log_dir: &Path, vm_name: &str) -> PathBuf {
    log_dir.join(format!("{vm_name}.log"))
}

/// Where a job script lands on the guest.
pub fn remote_script_path(script: &Path) -> String {
    let base = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".into());
    format!("{}/scripts/{base}", crate::ssh::RUNNER_DIR)
}
