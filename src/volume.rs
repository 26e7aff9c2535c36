use crate::backend::{BackendError, Hypervisor};
use crate::error::ExecutorError;
use crate::volume_xml;

/// A copy-on-write disk volume registered in a storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub pool: String,
    pub name: String,
    pub path: String,
    pub capacity: u64,
}

/// Conventional volume name for an instance: `<instance>.<extension>`.
pub fn volume_name(instance: &str, extension: &str) -> String {
    format!("{instance}.{extension}")
}

fn storage_fault(message: String, e: &BackendError) -> ExecutorError {
    ExecutorError::Storage {
        message: format!("{message}: {e}"),
        hint: "check the pool with `virsh vol-list <pool>`".into(),
    }
}

/// Create a qcow2 volume in `pool` layered on the volume at `backing_path`,
/// with the same capacity as the backing volume.
pub fn create_backed_volume<H: Hypervisor + ?Sized>(
    hv: &H,
    pool: &str,
    name: &str,
    backing_path: &str,
    backing_format: &str,
) -> Result<Volume, ExecutorError> {
    let capacity = hv
        .volume_capacity(backing_path)
        .map_err(|e| storage_fault(format!("reading backing volume {backing_path}"), &e))?;

    let xml = volume_xml::backed_volume_xml(name, capacity, backing_path, backing_format)?;
    let path = hv
        .create_volume(pool, &xml)
        .map_err(|e| storage_fault(format!("creating volume {name} in pool {pool}"), &e))?;

    tracing::info!(pool, name, backing = backing_path, capacity, "created backed volume");
    Ok(Volume {
        pool: pool.into(),
        name: name.into(),
        path,
        capacity,
    })
}

/// Erase the volume's contents, then remove it from the pool.
pub fn wipe_and_delete<H: Hypervisor + ?Sized>(
    hv: &H,
    pool: &str,
    name: &str,
) -> Result<(), ExecutorError> {
    hv.wipe_volume(pool, name)
        .map_err(|e| storage_fault(format!("wiping volume {name}"), &e))?;
    hv.delete_volume(pool, name)
        .map_err(|e| storage_fault(format!("deleting wiped volume {name}"), &e))?;
    tracing::info!(pool, name, "wiped and deleted volume");
    Ok(())
}

/// `wipe_and_delete` if the volume is still present. Returns whether it was.
///
/// A volume left "wiped but present" by an earlier failed delete is picked up
/// here again, so repeated cleanups converge.
pub fn reclaim<H: Hypervisor + ?Sized>(
    hv: &H,
    pool: &str,
    name: &str,
) -> Result<bool, ExecutorError> {
    let exists = hv
        .volume_exists(pool, name)
        .map_err(|e| storage_fault(format!("looking up volume {name}"), &e))?;
    if !exists {
        tracing::debug!(pool, name, "volume already gone");
        return Ok(false);
    }
    wipe_and_delete(hv, pool, name)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeHypervisor, TEMPLATE_CAPACITY, TEMPLATE_DISK};

    #[test]
    fn naming_convention() {
        assert_eq!(
            volume_name("gitlab-runner-abc123", "qcow2"),
            "gitlab-runner-abc123.qcow2"
        );
    }

    #[test]
    fn backed_volume_matches_backing_capacity() {
        let hv = FakeHypervisor::with_template();
        let vol = create_backed_volume(
            &hv,
            "default",
            "gitlab-runner-abc123.qcow2",
            TEMPLATE_DISK,
            "qcow2",
        )
        .unwrap();

        assert_eq!(vol.capacity, TEMPLATE_CAPACITY);
        let stored = hv.volume("default", "gitlab-runner-abc123.qcow2").unwrap();
        assert_eq!(stored.capacity, TEMPLATE_CAPACITY);
        assert_eq!(stored.backing.as_deref(), Some(TEMPLATE_DISK));
        assert_eq!(stored.path, vol.path);
        // The backing store is never written.
        assert!(!hv.volume("default", "base-image.qcow2").unwrap().wiped);
    }

    #[test]
    fn missing_backing_volume_is_storage_fault() {
        let hv = FakeHypervisor::default();
        let err =
            create_backed_volume(&hv, "default", "x.qcow2", "/nowhere.qcow2", "qcow2").unwrap_err();
        assert!(matches!(err, ExecutorError::Storage { .. }));
    }

    #[test]
    fn name_collision_is_storage_fault() {
        let hv = FakeHypervisor::with_template();
        create_backed_volume(&hv, "default", "dup.qcow2", TEMPLATE_DISK, "qcow2").unwrap();
        let err =
            create_backed_volume(&hv, "default", "dup.qcow2", TEMPLATE_DISK, "qcow2").unwrap_err();
        assert!(matches!(err, ExecutorError::Storage { .. }));
    }

    #[test]
    fn wipe_precedes_delete() {
        let hv = FakeHypervisor::with_template();
        create_backed_volume(&hv, "default", "v.qcow2", TEMPLATE_DISK, "qcow2").unwrap();
        wipe_and_delete(&hv, "default", "v.qcow2").unwrap();

        let calls = hv.calls();
        let wipe = calls.iter().position(|c| c == "wipe v.qcow2").unwrap();
        let delete = calls.iter().position(|c| c == "delete v.qcow2").unwrap();
        assert!(wipe < delete);
        assert!(hv.volume("default", "v.qcow2").is_none());
    }

    #[test]
    fn wiped_but_present_volume_is_reclaimed_later() {
        let hv = FakeHypervisor::with_template();
        create_backed_volume(&hv, "default", "v.qcow2", TEMPLATE_DISK, "qcow2").unwrap();

        hv.fail_delete_volume(true);
        assert!(reclaim(&hv, "default", "v.qcow2").is_err());
        assert!(hv.volume("default", "v.qcow2").unwrap().wiped);

        hv.fail_delete_volume(false);
        assert!(reclaim(&hv, "default", "v.qcow2").unwrap());
        assert!(!reclaim(&hv, "default", "v.qcow2").unwrap());
    }
}
