use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::ExecutorError;
use crate::paths;
use crate::poll::PollSpec;
use crate::ssh::SshSettings;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub libvirt: LibvirtConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub timeouts: TimeoutsConfig,
    #[facet(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LibvirtConfig {
    #[facet(default = "qemu:///system")]
    pub uri: String,
    #[facet(default = "default")]
    pub storage_pool: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
            storage_pool: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    /// Private key path; empty means `paths::default_identity()`.
    #[facet(default)]
    pub identity: String,
    #[facet(default = "runner")]
    pub user: String,
    #[facet(default = 30)]
    pub connect_timeout_s: u64,
    #[facet(default = "ssh")]
    pub ssh_program: String,
    #[facet(default = "sftp")]
    pub sftp_program: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            user: "runner".into(),
            connect_timeout_s: 30,
            ssh_program: "ssh".into(),
            sftp_program: "sftp".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TimeoutsConfig {
    /// Address discovery bound.
    #[facet(default = 60)]
    pub address_s: u64,
    /// SSH readiness bound.
    #[facet(default = 30)]
    pub ready_s: u64,
    #[facet(default = 1000)]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            address_s: 60,
            ready_s: 30,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ExecutorConfig {
    #[facet(default = "gitlab-runner")]
    pub name_prefix: String,
    #[facet(default = "qcow2")]
    pub volume_extension: String,
    /// Shell reported to the runner by the `config` stage.
    #[facet(default = "bash")]
    pub shell: String,
    #[facet(default = true)]
    pub rollback_on_failure: bool,
    pub log_dir: Option<String>,
    /// Copy each stage's `CUSTOM_ENV_*` variables and job scripts into
    /// `log_dir`. The copies can contain CI secrets.
    #[facet(default)]
    pub dump_job_files: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name_prefix: "gitlab-runner".into(),
            volume_extension: "qcow2".into(),
            shell: "bash".into(),
            rollback_on_failure: true,
            log_dir: None,
            dump_job_files: false,
        }
    }
}

impl Config {
    /// `<name_prefix>-<job_id>`
    pub fn vm_name(&self, job_id: &str) -> String {
        format!("{}-{job_id}", self.executor.name_prefix)
    }

    pub fn identity_path(&self) -> PathBuf {
        if self.ssh.identity.is_empty() {
            paths::default_identity()
        } else {
            PathBuf::from(&self.ssh.identity)
        }
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            identity: self.identity_path(),
            user: self.ssh.user.clone(),
            ssh_program: self.ssh.ssh_program.clone(),
            sftp_program: self.ssh.sftp_program.clone(),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_s),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_interval_ms)
    }

    pub fn address_poll(&self) -> PollSpec {
        PollSpec::covering(
            Duration::from_secs(self.timeouts.address_s),
            self.poll_interval(),
        )
    }

    pub fn ready_poll(&self) -> PollSpec {
        PollSpec::covering(Duration::from_secs(self.timeouts.ready_s), self.poll_interval())
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.executor.log_dir.as_ref().map(PathBuf::from)
    }
}

// ── validation ────────────────────────────────────────────

fn require_non_empty(field: &str, value: &str) -> Result<(), ExecutorError> {
    if value.trim().is_empty() {
        return Err(ExecutorError::Validation {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

fn require_positive(field: &str, value: u64) -> Result<(), ExecutorError> {
    if value == 0 {
        return Err(ExecutorError::Validation {
            message: format!("{field} must be greater than 0"),
        });
    }
    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ExecutorError> {
    require_non_empty("libvirt.uri", &config.libvirt.uri)?;
    require_non_empty("libvirt.storage_pool", &config.libvirt.storage_pool)?;
    require_non_empty("ssh.user", &config.ssh.user)?;
    require_non_empty("ssh.ssh_program", &config.ssh.ssh_program)?;
    require_non_empty("ssh.sftp_program", &config.ssh.sftp_program)?;
    require_non_empty("executor.name_prefix", &config.executor.name_prefix)?;
    require_non_empty("executor.volume_extension", &config.executor.volume_extension)?;
    require_non_empty("executor.shell", &config.executor.shell)?;

    require_positive("ssh.connect_timeout_s", config.ssh.connect_timeout_s)?;
    require_positive("timeouts.address_s", config.timeouts.address_s)?;
    require_positive("timeouts.ready_s", config.timeouts.ready_s)?;
    require_positive("timeouts.poll_interval_ms", config.timeouts.poll_interval_ms)?;

    if !is_name_safe(&config.executor.name_prefix) {
        return Err(ExecutorError::Validation {
            message: format!(
                "executor.name_prefix must match [A-Za-z0-9._-]+ (got '{}')",
                config.executor.name_prefix
            ),
        });
    }
    if config.executor.volume_extension.contains('/') {
        return Err(ExecutorError::Validation {
            message: "executor.volume_extension must not contain '/'".into(),
        });
    }
    if config.executor.dump_job_files && config.executor.log_dir.is_none() {
        return Err(ExecutorError::Validation {
            message: "executor.dump_job_files needs executor.log_dir".into(),
        });
    }
    Ok(())
}

fn is_name_safe(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Job ids end up in VM and volume names.
pub fn validate_job_id(id: &str) -> Result<(), ExecutorError> {
    if !is_name_safe(id) {
        return Err(ExecutorError::Validation {
            message: format!("job id must match [A-Za-z0-9._-]+ (got '{id}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config, ExecutorError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ExecutorError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| ExecutorError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    Ok(config)
}

/// Explicit path if given, else the default config file if present, else
/// built-in defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<Config, ExecutorError> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let default_path = paths::default_config_path();
    if default_path.is_file() {
        tracing::debug!(path = %default_path.display(), "using default config file");
        return load_config(&default_path);
    }
    let config = Config::default();
    validate_config(&config)?;
    Ok(config)
}
