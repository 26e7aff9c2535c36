//! In-memory `Hypervisor` for unit tests.
//!
//! Records every mutating call in order so tests can assert sequencing
//! (e.g. undefine before volume deletion).

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{BackendError, GuestInterface, Hypervisor};

pub const TEMPLATE_XML: &str = r#"<domain type="kvm">
  <name>base-image</name>
  <uuid>6f2b4c1e-8a0d-4e5f-9b3c-2d1e0f9a8b7c</uuid>
  <memory unit="KiB">4194304</memory>
  <vcpu placement="static">2</vcpu>
  <os>
    <type arch="x86_64" machine="pc-q35-8.2">hvm</type>
    <boot dev="hd"/>
  </os>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2"/>
      <source file="/var/lib/libvirt/images/base-image.qcow2"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <disk type="file" device="cdrom">
      <driver name="qemu" type="raw"/>
      <target dev="sda" bus="sata"/>
      <readonly/>
    </disk>
    <interface type="network">
      <mac address="52:54:00:aa:bb:cc"/>
      <source network="default"/>
      <model type="virtio"/>
    </interface>
    <channel type="unix">
      <target type="virtio" name="org.qemu.guest_agent.0"/>
    </channel>
  </devices>
</domain>"#;

pub const TEMPLATE_DISK: &str = "/var/lib/libvirt/images/base-image.qcow2";
pub const TEMPLATE_CAPACITY: u64 = 40 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub xml: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub path: String,
    pub capacity: u64,
    pub backing: Option<String>,
    pub xml: String,
    pub wiped: bool,
}

#[derive(Default)]
struct State {
    domains: BTreeMap<String, FakeDomain>,
    /// Keyed by (pool, name).
    volumes: BTreeMap<(String, String), FakeVolume>,
    /// Interfaces every domain reports once started.
    boot_interfaces: Vec<GuestInterface>,
    /// Agent queries that fail before the agent "comes up".
    agent_failures: usize,
    agent_queries: usize,
    fail_define: bool,
    fail_start: bool,
    fail_force_stop: bool,
    fail_delete_volume: bool,
    /// The domain disappears (someone else removed it) at this call.
    vanish_on_force_stop: bool,
    vanish_on_undefine: bool,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<State>,
}

fn xml_name(xml: &str) -> String {
    let doc = roxmltree::Document::parse(xml).expect("fake: well-formed XML");
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text())
        .unwrap_or_default()
        .to_string()
}

impl FakeHypervisor {
    /// A hypervisor holding the `base-image` template in pool `default`.
    pub fn with_template() -> Self {
        let hv = Self::default();
        hv.add_domain(TEMPLATE_XML, false);
        hv.add_volume("default", "base-image.qcow2", TEMPLATE_DISK, TEMPLATE_CAPACITY);
        hv
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_domain(&self, xml: &str, active: bool) {
        let name = xml_name(xml);
        self.state().domains.insert(
            name,
            FakeDomain {
                xml: xml.to_string(),
                active,
            },
        );
    }

    pub fn add_volume(&self, pool: &str, name: &str, path: &str, capacity: u64) {
        self.state().volumes.insert(
            (pool.to_string(), name.to_string()),
            FakeVolume {
                path: path.to_string(),
                capacity,
                backing: None,
                xml: String::new(),
                wiped: false,
            },
        );
    }

    pub fn set_boot_interfaces(&self, ifaces: Vec<GuestInterface>) {
        self.state().boot_interfaces = ifaces;
    }

    pub fn set_agent_failures(&self, n: usize) {
        self.state().agent_failures = n;
    }

    pub fn fail_define(&self) {
        self.state().fail_define = true;
    }

    pub fn fail_start(&self) {
        self.state().fail_start = true;
    }

    pub fn fail_force_stop(&self) {
        self.state().fail_force_stop = true;
    }

    pub fn fail_delete_volume(&self, fail: bool) {
        self.state().fail_delete_volume = fail;
    }

    pub fn vanish_on_force_stop(&self) {
        self.state().vanish_on_force_stop = true;
    }

    pub fn vanish_on_undefine(&self) {
        self.state().vanish_on_undefine = true;
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state().domains.get(name).cloned()
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<FakeVolume> {
        self.state()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_active(&self, name: &str, active: bool) {
        if let Some(d) = self.state().domains.get_mut(name) {
            d.active = active;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn agent_queries(&self) -> usize {
        self.state().agent_queries
    }
}

fn not_found(what: String) -> BackendError {
    BackendError::NotFound { what }
}

fn refused(op: &'static str, message: &str) -> BackendError {
    BackendError::Call {
        op,
        message: message.to_string(),
    }
}

impl Hypervisor for FakeHypervisor {
    fn domain_xml(&self, name: &str) -> Result<String, BackendError> {
        self.state()
            .domains
            .get(name)
            .map(|d| d.xml.clone())
            .ok_or_else(|| not_found(format!("domain '{name}'")))
    }

    fn define_domain(&self, xml: &str) -> Result<(), BackendError> {
        let mut st = self.state();
        if st.fail_define {
            return Err(refused("defining domain", "XML error: invalid device"));
        }
        let name = xml_name(xml);
        if st.domains.contains_key(&name) {
            return Err(refused("defining domain", "domain already exists"));
        }
        st.calls.push(format!("define {name}"));
        st.domains.insert(
            name,
            FakeDomain {
                xml: xml.to_string(),
                active: false,
            },
        );
        Ok(())
    }

    fn domain_is_active(&self, name: &str) -> Result<bool, BackendError> {
        self.state()
            .domains
            .get(name)
            .map(|d| d.active)
            .ok_or_else(|| not_found(format!("domain '{name}'")))
    }

    fn start_domain(&self, name: &str) -> Result<(), BackendError> {
        let mut st = self.state();
        if st.fail_start {
            return Err(refused("starting domain", "cannot allocate memory"));
        }
        let dom = st
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(format!("domain '{name}'")))?;
        dom.active = true;
        st.calls.push(format!("start {name}"));
        Ok(())
    }

    fn force_stop_domain(&self, name: &str) -> Result<(), BackendError> {
        let mut st = self.state();
        if st.vanish_on_force_stop {
            st.domains.remove(name);
            return Err(not_found(format!("domain '{name}'")));
        }
        let fail = st.fail_force_stop;
        let dom = st
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(format!("domain '{name}'")))?;
        if fail || !dom.active {
            return Err(refused("force-stopping domain", "domain is not running"));
        }
        dom.active = false;
        st.calls.push(format!("force-stop {name}"));
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> Result<(), BackendError> {
        let mut st = self.state();
        if st.vanish_on_undefine {
            st.domains.remove(name);
        }
        st.domains
            .remove(name)
            .ok_or_else(|| not_found(format!("domain '{name}'")))?;
        st.calls.push(format!("undefine {name}"));
        Ok(())
    }

    fn guest_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>, BackendError> {
        let mut st = self.state();
        st.agent_queries += 1;
        let active = st
            .domains
            .get(name)
            .map(|d| d.active)
            .ok_or_else(|| not_found(format!("domain '{name}'")))?;
        if !active {
            return Err(refused("querying guest agent", "domain is not running"));
        }
        if st.agent_failures > 0 {
            st.agent_failures -= 1;
            return Err(refused("querying guest agent", "guest agent is not connected"));
        }
        Ok(st.boot_interfaces.clone())
    }

    fn volume_capacity(&self, path: &str) -> Result<u64, BackendError> {
        self.state()
            .volumes
            .values()
            .find(|v| v.path == path)
            .map(|v| v.capacity)
            .ok_or_else(|| not_found(format!("volume at {path}")))
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<String, BackendError> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| refused("creating volume", &e.to_string()))?;
        let root = doc.root_element();
        let text = |tag: &str| {
            root.descendants()
                .find(|n| n.has_tag_name(tag))
                .and_then(|n| n.text())
                .map(str::to_string)
        };
        let name = text("name").ok_or_else(|| refused("creating volume", "missing name"))?;
        let capacity = text("capacity")
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| refused("creating volume", "missing capacity"))?;
        let backing = root
            .descendants()
            .find(|n| n.has_tag_name("backingStore"))
            .and_then(|b| b.children().find(|n| n.has_tag_name("path")))
            .and_then(|n| n.text())
            .map(str::to_string);

        let mut st = self.state();
        let key = (pool.to_string(), name.clone());
        if st.volumes.contains_key(&key) {
            return Err(refused("creating volume", "storage volume already exists"));
        }
        let path = format!("/var/lib/libvirt/images/{name}");
        st.calls.push(format!("create-volume {name}"));
        st.volumes.insert(
            key,
            FakeVolume {
                path: path.clone(),
                capacity,
                backing,
                xml: xml.to_string(),
                wiped: false,
            },
        );
        Ok(path)
    }

    fn volume_exists(&self, pool: &str, name: &str) -> Result<bool, BackendError> {
        Ok(self.volume(pool, name).is_some())
    }

    fn wipe_volume(&self, pool: &str, name: &str) -> Result<(), BackendError> {
        let mut st = self.state();
        let vol = st
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("volume '{name}'")))?;
        vol.wiped = true;
        st.calls.push(format!("wipe {name}"));
        Ok(())
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), BackendError> {
        let mut st = self.state();
        if st.fail_delete_volume {
            return Err(refused("deleting volume", "device or resource busy"));
        }
        st.volumes
            .remove(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("volume '{name}'")))?;
        st.calls.push(format!("delete {name}"));
        Ok(())
    }
}
