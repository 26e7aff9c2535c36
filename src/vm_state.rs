//! Where a job's VM is in its lifecycle.
//!
//! Never stored: reconstructed from libvirt on every invocation, since each
//! executor stage is a separate process.

use std::fmt;

use crate::backend::Hypervisor;
use crate::error::ExecutorError;
use crate::provisioner::Provisioner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Defined but not running.
    Prepared,
    /// Defined and running.
    Running,
    /// No VM exists under the job's name, either never created or torn down.
    Cleaned,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Prepared => "prepared",
            LifecycleState::Running => "running",
            LifecycleState::Cleaned => "cleaned",
        })
    }
}

pub fn detect_state<H: Hypervisor + ?Sized>(
    provisioner: &Provisioner<'_, H>,
    name: &str,
) -> Result<LifecycleState, ExecutorError> {
    match provisioner.lookup(name) {
        Ok(vm) if vm.active => Ok(LifecycleState::Running),
        Ok(_) => Ok(LifecycleState::Prepared),
        Err(ExecutorError::NotFound { .. }) => Ok(LifecycleState::Cleaned),
        Err(e) => Err(e),
    }
}
