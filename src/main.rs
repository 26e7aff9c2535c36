use std::path::Path;

use clap::Parser;

use libvirt_executor::backend;
use libvirt_executor::cli::{Cli, Command};
use libvirt_executor::config::{self, Config};
use libvirt_executor::dump;
use libvirt_executor::error::{ExecutorError, ExitCodes};
use libvirt_executor::lifecycle::{self, Lifecycle};
use libvirt_executor::logging::{self, DeferredFileHandle};
use libvirt_executor::ssh::SshConnector;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let file_handle = logging::init(cli.verbose);

    let codes = ExitCodes {
        build_failure: cli.build_failure_exit_code,
        system_failure: cli.system_failure_exit_code,
    };
    let stage = cli.command.name();

    if let Err(e) = run(cli, &file_handle).await {
        let code = codes.for_error(&e);
        tracing::error!(stage, exit_code = code, error = %e, "stage failed");
        eprintln!("{stage} stage failed: {:?}", miette::Report::new(e));
        std::process::exit(code);
    }
}

fn resolve_job_id(cli: &Cli) -> Result<String, ExecutorError> {
    let id = match &cli.job_id {
        Some(id) => id.clone(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            if !matches!(cli.command, Command::Config | Command::Prepare { .. }) {
                tracing::warn!(
                    job_id = %id,
                    "{} is not set; this stage cannot find the job's VM",
                    lifecycle::JOB_ID_ENV
                );
            }
            id
        }
    };
    config::validate_job_id(&id)?;
    Ok(id)
}

async fn run(cli: Cli, file_handle: &DeferredFileHandle) -> Result<(), ExecutorError> {
    let config = config::resolve_config(cli.config.as_deref())?;
    let job_id = resolve_job_id(&cli)?;
    let vm_name = config.vm_name(&job_id);

    if let Some(log_dir) = config.log_dir() {
        logging::attach_job_log(file_handle, &log_dir, &vm_name);
        if config.executor.dump_job_files {
            dump_stage_files(&log_dir, &vm_name, &cli.command);
        }
    }
    tracing::debug!(stage = cli.command.name(), vm = %vm_name, "starting stage");

    match cli.command {
        Command::Config => {
            println!("{}", lifecycle::driver_config_json(&config, &job_id)?);
        }
        Command::Prepare { image } => {
            let image = image.filter(|i| !i.is_empty()).ok_or_else(|| ExecutorError::Validation {
                message: "no template VM given: set CUSTOM_ENV_CI_JOB_IMAGE (the job's `image:`) or pass --image".into(),
            })?;
            let connector = checked_connector(&config)?;
            let hv = backend::create_backend(&config.libvirt.uri)?;
            let ip = Lifecycle::new(&hv, connector, &config, &job_id)
                .prepare(&image)
                .await?;
            tracing::info!(vm = %vm_name, %ip, "prepare stage done");
        }
        Command::Run { script, stage } => {
            let connector = checked_connector(&config)?;
            let hv = backend::create_backend(&config.libvirt.uri)?;
            Lifecycle::new(&hv, connector, &config, &job_id)
                .run(&script, &stage)
                .await?;
        }
        Command::Cleanup => {
            // Teardown never opens a session, so the identity is not checked.
            let connector = SshConnector::new(config.ssh_settings());
            let hv = backend::create_backend(&config.libvirt.uri)?;
            Lifecycle::new(&hv, connector, &config, &job_id)
                .cleanup()
                .await?;
        }
    }
    Ok(())
}

fn checked_connector(config: &Config) -> Result<SshConnector, ExecutorError> {
    let connector = SshConnector::new(config.ssh_settings());
    connector.check_identity()?;
    Ok(connector)
}

/// Best effort: a failed debug copy never fails the stage.
fn dump_stage_files(dir: &Path, vm_name: &str, command: &Command) {
    let stage = match command {
        Command::Run { stage, .. } => stage.as_str(),
        other => other.name(),
    };
    let env = dump::job_env(std::env::vars());
    match dump::dump_env(dir, vm_name, stage, &env) {
        Ok(path) => tracing::debug!(path = %path.display(), "dumped job environment"),
        Err(e) => tracing::warn!(error = %e, "could not dump job environment"),
    }
    if let Command::Run { script, .. } = command {
        match dump::dump_script(dir, vm_name, stage, script) {
            Ok(path) => tracing::debug!(path = %path.display(), "dumped job script"),
            Err(e) => tracing::warn!(error = %e, "could not dump job script"),
        }
    }
}
