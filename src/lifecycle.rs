//! The executor stages: config, prepare, run, cleanup.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::backend::Hypervisor;
use crate::config::Config;
use crate::error::ExecutorError;
use crate::network;
use crate::paths;
use crate::poll::{self, PollSpec};
use crate::provisioner::{Provisioner, VmInstance};
use crate::ssh::{self, Connector, RUNNER_DIR, RemoteShell};
use crate::vm_state::{self, LifecycleState};
use crate::volume;

/// Environment variable carrying the job id between stages.
pub const JOB_ID_ENV: &str = "LIBVIRT_EXECUTOR_ID";

#[derive(Debug, Facet)]
struct DriverInfo {
    name: String,
    version: String,
}

#[derive(Debug, Facet)]
struct DriverConfig {
    builds_dir: String,
    cache_dir: String,
    builds_dir_is_shared: bool,
    shell: String,
    driver: DriverInfo,
    job_env: BTreeMap<String, String>,
}

/// JSON document the `config` stage prints for the runner.
pub fn driver_config_json(config: &Config, job_id: &str) -> Result<String, ExecutorError> {
    let doc = DriverConfig {
        builds_dir: format!("{RUNNER_DIR}/build"),
        cache_dir: format!("{RUNNER_DIR}/cache"),
        builds_dir_is_shared: false,
        shell: config.executor.shell.clone(),
        driver: DriverInfo {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
        job_env: BTreeMap::from([(JOB_ID_ENV.to_string(), job_id.to_string())]),
    };
    facet_json::to_string(&doc).map_err(|e| ExecutorError::Io {
        context: "serializing driver config".into(),
        source: std::io::Error::other(e.to_string()),
    })
}

pub struct Lifecycle<'a, H: ?Sized, C> {
    hv: &'a H,
    provisioner: Provisioner<'a, H>,
    connector: C,
    vm_name: String,
    address_poll: PollSpec,
    ready_poll: PollSpec,
    connect_timeout: Duration,
    rollback_on_failure: bool,
}

impl<'a, H, C> Lifecycle<'a, H, C>
where
    H: Hypervisor + ?Sized,
    C: Connector,
{
    pub fn new(hv: &'a H, connector: C, config: &Config, job_id: &str) -> Self {
        Self {
            hv,
            provisioner: Provisioner::new(
                hv,
                &config.libvirt.storage_pool,
                &config.executor.volume_extension,
            ),
            connector,
            vm_name: config.vm_name(job_id),
            address_poll: config.address_poll(),
            ready_poll: config.ready_poll(),
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout_s),
            rollback_on_failure: config.executor.rollback_on_failure,
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Clone `template`, boot it and prepare the runner layout.
    /// Returns the guest's address.
    pub async fn prepare(&self, template: &str) -> Result<Ipv4Addr, ExecutorError> {
        tracing::info!(name = %self.vm_name, template, "preparing VM");
        // A failed clone reclaims its own volume and must not touch a VM that
        // already exists under this name.
        let vm = self.provisioner.clone_definition(template, &self.vm_name)?;

        match self.boot(&vm).await {
            Ok(ip) => {
                tracing::info!(name = %self.vm_name, %ip, "VM ready");
                Ok(ip)
            }
            Err(e) => {
                if self.rollback_on_failure {
                    tracing::warn!(name = %self.vm_name, error = %e, "prepare failed, rolling back");
                    if let Err(cleanup_err) = self.cleanup().await {
                        tracing::warn!(name = %self.vm_name, error = %cleanup_err, "rollback incomplete");
                    }
                }
                Err(e)
            }
        }
    }

    async fn boot(&self, vm: &VmInstance) -> Result<Ipv4Addr, ExecutorError> {
        self.provisioner.start(vm)?;
        let ip = network::wait_for_address(self.hv, &self.vm_name, self.address_poll).await?;
        let shell = self.wait_ready(ip).await?;
        shell.setup_environment().await?;
        Ok(ip)
    }

    async fn wait_ready(&self, ip: Ipv4Addr) -> Result<C::Shell, ExecutorError> {
        tracing::info!(%ip, budget_s = self.ready_poll.budget().as_secs(), "waiting for SSH");
        let started = tokio::time::Instant::now();
        let shell = self.connector.connect(ip);
        let probe = &shell;
        let connect_timeout = self.connect_timeout;
        // A single connect attempt never gets more time than the poll has left.
        let ready = poll::poll_until(self.ready_poll, move |_, remaining| async move {
            probe
                .test_connect(connect_timeout.min(remaining))
                .await
                .then_some(())
        })
        .await;

        match ready {
            Some(()) => Ok(shell),
            None => Err(ExecutorError::Timeout {
                what: format!("SSH on {ip}"),
                seconds: started.elapsed().as_secs(),
            }),
        }
    }

    /// Upload `script` and execute it on the guest. The script's exit status
    /// is the stage result.
    pub async fn run(&self, script: &Path, stage: &str) -> Result<(), ExecutorError> {
        if !script.is_file() {
            return Err(ExecutorError::Io {
                context: format!("reading job script {}", script.display()),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        match vm_state::detect_state(&self.provisioner, &self.vm_name)? {
            LifecycleState::Running => {}
            LifecycleState::Cleaned => {
                return Err(ExecutorError::NotFound {
                    name: self.vm_name.clone(),
                });
            }
            LifecycleState::Prepared => {
                return Err(ExecutorError::Provision {
                    message: format!("VM '{}' is not running", self.vm_name),
                    hint: "run the prepare stage again, or check `virsh list --all`".into(),
                });
            }
        }

        // Addresses are never carried over from prepare.
        let ip = network::wait_for_address(self.hv, &self.vm_name, self.address_poll).await?;
        let shell = self.connector.connect(ip);

        let remote = paths::remote_script_path(script);
        shell.copy_file(script, &remote).await?;

        tracing::info!(stage, script = %remote, %ip, "executing script");
        shell
            .run_command(&ssh::shell_escape(&format!("./{remote}")))
            .await?;
        tracing::info!(stage, "stage completed");
        Ok(())
    }

    /// Tear down the job's VM and volume. Safe to call repeatedly.
    pub async fn cleanup(&self) -> Result<(), ExecutorError> {
        match self.provisioner.destroy(&self.vm_name) {
            Ok(()) => {
                tracing::info!(name = %self.vm_name, "VM destroyed");
                Ok(())
            }
            Err(ExecutorError::NotFound { .. }) => {
                tracing::info!(name = %self.vm_name, "VM already gone");
                // A crashed prepare or an earlier failed delete can leave the
                // volume behind without its VM.
                let orphan = self.provisioner.conventional_volume(&self.vm_name);
                if volume::reclaim(self.hv, &orphan.pool, &orphan.volume)? {
                    tracing::info!(volume = %orphan.volume, "reclaimed orphaned volume");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
