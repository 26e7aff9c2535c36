//! Cloning, booting and destroying VM instances.

use uuid::Uuid;

use crate::backend::{BackendError, Hypervisor};
use crate::domain_xml::{self, CloneIdentity, DomainDefinition, MacAddress, VolumeAssociation};
use crate::error::ExecutorError;
use crate::volume;

/// A defined VM instance as seen by the hypervisor right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInstance {
    pub name: String,
    pub uuid: Option<String>,
    pub active: bool,
    pub macs: Vec<String>,
    /// Volumes owned by the instance.
    pub volumes: Vec<VolumeAssociation>,
}

fn provision_fault(message: String, e: &BackendError) -> ExecutorError {
    ExecutorError::Provision {
        message: format!("{message}: {e}"),
        hint: "see `virsh list --all` and the libvirtd journal".into(),
    }
}

pub struct Provisioner<'a, H: ?Sized> {
    hv: &'a H,
    pool: String,
    volume_extension: String,
}

impl<'a, H: Hypervisor + ?Sized> Provisioner<'a, H> {
    pub fn new(hv: &'a H, pool: &str, volume_extension: &str) -> Self {
        Self {
            hv,
            pool: pool.into(),
            volume_extension: volume_extension.into(),
        }
    }

    /// Volume an instance owns under the naming convention.
    pub fn conventional_volume(&self, name: &str) -> VolumeAssociation {
        VolumeAssociation {
            pool: self.pool.clone(),
            volume: volume::volume_name(name, &self.volume_extension),
        }
    }

    /// Define `name` as a stopped clone of `template` on a fresh backed volume.
    pub fn clone_definition(&self, template: &str, name: &str) -> Result<VmInstance, ExecutorError> {
        let template_xml = self.hv.domain_xml(template).map_err(|e| match e {
            BackendError::NotFound { .. } => ExecutorError::Provision {
                message: format!("template VM '{template}' does not exist"),
                hint: "CI_JOB_IMAGE must name a stopped libvirt domain".into(),
            },
            e => provision_fault(format!("reading template '{template}'"), &e),
        })?;
        let template_def = DomainDefinition::parse(&template_xml)?;
        let backing = template_def
            .primary_disk_source()
            .ok_or_else(|| ExecutorError::Provision {
                message: format!("template '{template}' has no file-backed disk"),
                hint: "the template's primary disk must be a file in a storage pool".into(),
            })?
            .to_string();

        let assoc = self.conventional_volume(name);
        let vol = volume::create_backed_volume(
            self.hv,
            &assoc.pool,
            &assoc.volume,
            &backing,
            template_def.primary_disk_format(),
        )?;

        let identity = CloneIdentity {
            name: name.into(),
            uuid: Uuid::new_v4(),
            disk_path: vol.path.clone(),
            volume: assoc,
        };
        let defined = domain_xml::clone_definition(&template_def, &identity, MacAddress::random)
            .and_then(|def| {
                self.hv
                    .define_domain(&def.to_xml())
                    .map_err(|e| provision_fault(format!("defining '{name}'"), &e))
                    .map(|()| def)
            });

        let def = match defined {
            Ok(def) => def,
            Err(e) => {
                if let Err(reclaim_err) = volume::reclaim(self.hv, &vol.pool, &vol.name) {
                    tracing::warn!(volume = %vol.name, error = %reclaim_err, "could not reclaim volume of rejected clone");
                }
                return Err(e);
            }
        };

        tracing::info!(name, template, uuid = %identity.uuid, "defined clone");
        Ok(VmInstance {
            name: name.into(),
            uuid: def.uuid(),
            active: false,
            macs: def.mac_addresses(),
            volumes: vec![identity.volume],
        })
    }

    pub fn start(&self, instance: &VmInstance) -> Result<(), ExecutorError> {
        self.hv
            .start_domain(&instance.name)
            .map_err(|e| provision_fault(format!("starting '{}'", instance.name), &e))?;
        tracing::info!(name = %instance.name, "started VM");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<VmInstance, ExecutorError> {
        let xml = self.hv.domain_xml(name).map_err(|e| match e {
            BackendError::NotFound { .. } => ExecutorError::NotFound { name: name.into() },
            e => provision_fault(format!("reading '{name}'"), &e),
        })?;
        let active = self.hv.domain_is_active(name).map_err(|e| match e {
            BackendError::NotFound { .. } => ExecutorError::NotFound { name: name.into() },
            e => provision_fault(format!("querying state of '{name}'"), &e),
        })?;
        let def = DomainDefinition::parse(&xml)?;
        let volumes = match def.volume_association() {
            Some(assoc) => vec![assoc],
            None => vec![self.conventional_volume(name)],
        };
        Ok(VmInstance {
            name: name.into(),
            uuid: def.uuid(),
            active,
            macs: def.mac_addresses(),
            volumes,
        })
    }

    /// Power off if running, undefine, then reclaim the instance's volumes.
    ///
    /// An instance that is already stopped, or whose volume is already gone,
    /// is torn down without error.
    pub fn destroy(&self, name: &str) -> Result<(), ExecutorError> {
        let instance = self.lookup(name)?;

        if instance.active
            && let Err(e) = self.hv.force_stop_domain(name)
        {
            // It may have shut down, or been removed, since the lookup.
            match self.hv.domain_is_active(name) {
                Ok(false) => tracing::debug!(name, "VM stopped on its own"),
                Err(BackendError::NotFound { .. }) => {
                    tracing::debug!(name, "VM vanished while stopping")
                }
                _ => return Err(provision_fault(format!("force-stopping '{name}'"), &e)),
            }
        }

        match self.hv.undefine_domain(name) {
            Ok(()) => tracing::info!(name, "undefined VM"),
            Err(BackendError::NotFound { .. }) => tracing::debug!(name, "VM already undefined"),
            Err(e) => return Err(provision_fault(format!("undefining '{name}'"), &e)),
        }

        let mut first_err = None;
        for assoc in &instance.volumes {
            if let Err(e) = volume::reclaim(self.hv, &assoc.pool, &assoc.volume) {
                tracing::warn!(name, volume = %assoc.volume, error = %e, "volume teardown failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
