pub mod libvirt;

#[cfg(test)]
pub mod fake;

use thiserror::Error;

/// Failure of a single hypervisor call.
///
/// Components translate these into the fault kinds of `ExecutorError`; the
/// only distinction they need from the backend is "absent" vs. "refused".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{op} failed: {message}")]
    Call { op: &'static str, message: String },
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

/// One NIC as reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    /// Empty when the agent reports no hardware address (e.g. tunnels).
    pub hwaddr: String,
    /// Addresses in agent order, IPv4 and IPv6 mixed.
    pub addrs: Vec<String>,
}

/// The libvirt calls the lifecycle needs. Domains and volumes are addressed
/// by name; volumes always live in an explicitly named pool.
pub trait Hypervisor {
    /// Inactive, secure XML of a defined domain.
    fn domain_xml(&self, name: &str) -> Result<String, BackendError>;
    fn define_domain(&self, xml: &str) -> Result<(), BackendError>;
    fn domain_is_active(&self, name: &str) -> Result<bool, BackendError>;
    fn start_domain(&self, name: &str) -> Result<(), BackendError>;
    fn force_stop_domain(&self, name: &str) -> Result<(), BackendError>;
    fn undefine_domain(&self, name: &str) -> Result<(), BackendError>;
    fn guest_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>, BackendError>;

    /// Capacity in bytes of the volume at `path`, in whatever pool holds it.
    fn volume_capacity(&self, path: &str) -> Result<u64, BackendError>;
    /// Register a volume from its XML descriptor. Returns the new volume's path.
    fn create_volume(&self, pool: &str, xml: &str) -> Result<String, BackendError>;
    fn volume_exists(&self, pool: &str, name: &str) -> Result<bool, BackendError>;
    fn wipe_volume(&self, pool: &str, name: &str) -> Result<(), BackendError>;
    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), BackendError>;
}

pub fn create_backend(uri: &str) -> Result<libvirt::LibvirtBackend, crate::error::ExecutorError> {
    libvirt::LibvirtBackend::connect(uri)
}
