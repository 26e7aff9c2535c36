use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorNumber};
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;

use super::{BackendError, GuestInterface, Hypervisor};
use crate::error::ExecutorError;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// `Hypervisor` over a single libvirt connection, held for the whole stage.
pub struct LibvirtBackend {
    conn: ConnGuard,
}

impl LibvirtBackend {
    pub fn connect(uri: &str) -> Result<Self, ExecutorError> {
        // libvirt's default handler prints every error to stderr; we surface
        // them through Result instead.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| ExecutorError::Provision {
            message: format!("failed to connect to libvirt: {e}"),
            hint: format!("ensure libvirtd is running and you have access to {uri}"),
        })?;
        tracing::debug!(uri, "connected to libvirt");
        Ok(Self {
            conn: ConnGuard(conn),
        })
    }

    fn domain(&self, name: &str) -> Result<Domain, BackendError> {
        Domain::lookup_by_name(&self.conn, name).map_err(lookup_failed(
            ErrorNumber::NoDomain,
            "looking up domain",
            format!("domain '{name}'"),
        ))
    }

    fn pool(&self, pool: &str) -> Result<StoragePool, BackendError> {
        StoragePool::lookup_by_name(&self.conn, pool).map_err(lookup_failed(
            ErrorNumber::NoStoragePool,
            "looking up storage pool",
            format!("storage pool '{pool}'"),
        ))
    }

    fn volume(&self, pool: &str, name: &str) -> Result<StorageVol, BackendError> {
        let pool = self.pool(pool)?;
        StorageVol::lookup_by_name(&pool, name).map_err(lookup_failed(
            ErrorNumber::NoStorageVolume,
            "looking up volume",
            format!("volume '{name}'"),
        ))
    }
}

fn call_failed(op: &'static str) -> impl FnOnce(virt_error::Error) -> BackendError {
    move |e| BackendError::Call {
        op,
        message: e.to_string(),
    }
}

/// Only libvirt's "no such object" code means absent. Connection drops,
/// permission errors and daemon restarts stay call failures.
fn lookup_failed(
    absent: ErrorNumber,
    op: &'static str,
    what: String,
) -> impl FnOnce(virt_error::Error) -> BackendError {
    move |e| classify_lookup(e.code(), absent, op, what, e.to_string())
}

fn classify_lookup(
    code: ErrorNumber,
    absent: ErrorNumber,
    op: &'static str,
    what: String,
    message: String,
) -> BackendError {
    if code == absent {
        BackendError::NotFound { what }
    } else {
        BackendError::Call { op, message }
    }
}

impl Hypervisor for LibvirtBackend {
    fn domain_xml(&self, name: &str) -> Result<String, BackendError> {
        let flags = virt::sys::VIR_DOMAIN_XML_SECURE | virt::sys::VIR_DOMAIN_XML_INACTIVE;
        self.domain(name)?
            .get_xml_desc(flags)
            .map_err(call_failed("reading domain XML"))
    }

    fn define_domain(&self, xml: &str) -> Result<(), BackendError> {
        Domain::define_xml(&self.conn, xml)
            .map(|_| ())
            .map_err(call_failed("defining domain"))
    }

    fn domain_is_active(&self, name: &str) -> Result<bool, BackendError> {
        self.domain(name)?
            .is_active()
            .map_err(call_failed("querying domain state"))
    }

    fn start_domain(&self, name: &str) -> Result<(), BackendError> {
        self.domain(name)?
            .create()
            .map(|_| ())
            .map_err(call_failed("starting domain"))
    }

    fn force_stop_domain(&self, name: &str) -> Result<(), BackendError> {
        self.domain(name)?
            .destroy()
            .map(|_| ())
            .map_err(call_failed("force-stopping domain"))
    }

    fn undefine_domain(&self, name: &str) -> Result<(), BackendError> {
        // Clones get a private NVRAM store; remove it with the definition.
        self.domain(name)?
            .undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_NVRAM)
            .map(|_| ())
            .map_err(call_failed("undefining domain"))
    }

    fn guest_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>, BackendError> {
        let ifaces = self
            .domain(name)?
            .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0)
            .map_err(call_failed("querying guest agent"))?;

        Ok(ifaces
            .iter()
            .map(|iface| GuestInterface {
                name: iface.name.clone(),
                hwaddr: iface.hwaddr.clone(),
                addrs: iface.addrs.iter().map(|a| a.addr.clone()).collect(),
            })
            .collect())
    }

    fn volume_capacity(&self, path: &str) -> Result<u64, BackendError> {
        let vol = StorageVol::lookup_by_path(&self.conn, path).map_err(lookup_failed(
            ErrorNumber::NoStorageVolume,
            "looking up volume",
            format!("volume at {path}"),
        ))?;
        let info = vol.get_info().map_err(call_failed("reading volume info"))?;
        Ok(info.capacity)
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<String, BackendError> {
        let pool = self.pool(pool)?;
        let vol = StorageVol::create_xml(&pool, xml, 0).map_err(call_failed("creating volume"))?;
        vol.get_path().map_err(call_failed("reading volume path"))
    }

    fn volume_exists(&self, pool: &str, name: &str) -> Result<bool, BackendError> {
        // A missing pool is an error, not an absent volume.
        let pool = self.pool(pool)?;
        match StorageVol::lookup_by_name(&pool, name) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorNumber::NoStorageVolume => Ok(false),
            Err(e) => Err(call_failed("looking up volume")(e)),
        }
    }

    fn wipe_volume(&self, pool: &str, name: &str) -> Result<(), BackendError> {
        self.volume(pool, name)?
            .wipe(0)
            .map(|_| ())
            .map_err(call_failed("wiping volume"))
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), BackendError> {
        self.volume(pool, name)?
            .delete(0)
            .map(|_| ())
            .map_err(call_failed("deleting volume"))
    }
}
