use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "libvirt-executor",
    version,
    about = "GitLab custom executor running each job in a disposable libvirt VM"
)]
pub struct Cli {
    /// Path to config file [default: ~/.config/libvirt-executor/config.toml if present]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Job id shared by all stages of a job; generated when absent
    #[arg(long, global = true, env = "LIBVIRT_EXECUTOR_ID")]
    pub job_id: Option<String>,

    /// Exit code for a failed job script
    #[arg(long, global = true, env = "BUILD_FAILURE_EXIT_CODE", hide = true)]
    pub build_failure_exit_code: Option<i32>,

    /// Exit code for executor/system failures
    #[arg(long, global = true, env = "SYSTEM_FAILURE_EXIT_CODE", hide = true)]
    pub system_failure_exit_code: Option<i32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the driver configuration JSON for the runner
    Config,

    /// Clone the template VM, boot it and prepare it for the job
    Prepare {
        /// Template VM to clone
        #[arg(long, env = "CUSTOM_ENV_CI_JOB_IMAGE")]
        image: Option<String>,
    },

    /// Upload a job script to the VM and execute it
    Run {
        /// Script generated by the runner
        script: PathBuf,

        /// Name of the job stage (e.g. build_script)
        stage: String,
    },

    /// Destroy the VM and its disk
    Cleanup,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Config => "config",
            Command::Prepare { .. } => "prepare",
            Command::Run { .. } => "run",
            Command::Cleanup => "cleanup",
        }
    }
}
