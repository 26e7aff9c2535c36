//! Debug copies of what the runner handed each stage, kept next to the job log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ExecutorError;

/// Prefix the runner puts on job variables forwarded to the executor.
pub const JOB_ENV_PREFIX: &str = "CUSTOM_ENV_";

/// The forwarded job variables out of `vars`, sorted by name.
pub fn job_env(vars: impl IntoIterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter(|(k, _)| k.starts_with(JOB_ENV_PREFIX))
        .collect()
}

fn file_stem(vm_name: &str, kind: &str, stage: &str) -> String {
    let stage: String = stage
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{vm_name}.{kind}-{stage}")
}

fn io_fault(context: String) -> impl FnOnce(std::io::Error) -> ExecutorError {
    move |source| ExecutorError::Io { context, source }
}

/// Write `env` as JSON to `<dir>/<vm_name>.env-<stage>.json`.
pub fn dump_env(
    dir: &Path,
    vm_name: &str,
    stage: &str,
    env: &BTreeMap<String, String>,
) -> Result<PathBuf, ExecutorError> {
    let json = facet_json::to_string(env).map_err(|e| ExecutorError::Io {
        context: "serializing job environment".into(),
        source: std::io::Error::other(e.to_string()),
    })?;
    std::fs::create_dir_all(dir).map_err(io_fault(format!("creating {}", dir.display())))?;
    let path = dir.join(format!("{}.json", file_stem(vm_name, "env", stage)));
    std::fs::write(&path, json).map_err(io_fault(format!("writing {}", path.display())))?;
    Ok(path)
}

/// Copy `script` to `<dir>/<vm_name>.script-<stage>`.
pub fn dump_script(
    dir: &Path,
    vm_name: &str,
    stage: &str,
    script: &Path,
) -> Result<PathBuf, ExecutorError> {
    std::fs::create_dir_all(dir).map_err(io_fault(format!("creating {}", dir.display())))?;
    let path = dir.join(file_stem(vm_name, "script", stage));
    std::fs::copy(script, &path).map_err(io_fault(format!(
        "copying {} to {}",
        script.display(),
        path.display()
    )))?;
    Ok(path)
}
