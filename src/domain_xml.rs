//! Domain definitions: reading a template's XML and rewriting it into a clone.

use std::fmt;

use rand_core::{OsRng, RngCore};
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::xml::Element;

/// Namespace of the executor's element under `<metadata>`.
pub const METADATA_NS: &str = "https://gitlab.com/gitlab-org/libvirt-executor/xmlns/1.0";
const METADATA_PREFIX: &str = "executor";
const DEFAULT_DISK_FORMAT: &str = "qcow2";

/// Locally administered unicast address under the QEMU/KVM OUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn random() -> Self {
        let mut tail = [0u8; 3];
        OsRng.fill_bytes(&mut tail);
        Self::from_tail(tail)
    }

    pub fn from_tail(tail: [u8; 3]) -> Self {
        Self([0x52, 0x54, 0x00, tail[0], tail[1], tail[2]])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Which volume an instance owns, as recorded in its definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeAssociation {
    pub pool: String,
    pub volume: String,
}

/// Identity fields a clone receives.
#[derive(Debug, Clone)]
pub struct CloneIdentity {
    pub name: String,
    pub uuid: Uuid,
    /// Path of the clone's own disk volume.
    pub disk_path: String,
    pub volume: VolumeAssociation,
}

/// A parsed domain definition.
#[derive(Debug, Clone)]
pub struct DomainDefinition {
    root: Element,
}

impl DomainDefinition {
    pub fn parse(xml: &str) -> Result<Self, ExecutorError> {
        let root = Element::parse(xml).map_err(|e| ExecutorError::Provision {
            message: format!("unreadable domain definition: {e}"),
            hint: "check the template with `virsh dumpxml`".into(),
        })?;
        if root.name != "domain" {
            return Err(ExecutorError::Provision {
                message: format!("expected <domain>, found <{}>", root.name),
                hint: "check the template with `virsh dumpxml`".into(),
            });
        }
        Ok(Self { root })
    }

    pub fn name(&self) -> Option<String> {
        self.root.child("name").map(Element::text)
    }

    pub fn uuid(&self) -> Option<String> {
        self.root.child("uuid").map(|u| u.text().trim().to_string())
    }

    /// Source file of the first disk-device disk.
    pub fn primary_disk_source(&self) -> Option<&str> {
        self.primary_disk()?.child("source")?.attr("file")
    }

    /// Image format of the primary disk, from its `<driver type>`.
    pub fn primary_disk_format(&self) -> &str {
        self.primary_disk()
            .and_then(|d| d.child("driver"))
            .and_then(|d| d.attr("type"))
            .unwrap_or(DEFAULT_DISK_FORMAT)
    }

    pub fn mac_addresses(&self) -> Vec<String> {
        self.interfaces()
            .filter_map(|i| i.child("mac")?.attr("address"))
            .map(str::to_ascii_lowercase)
            .collect()
    }

    pub fn volume_association(&self) -> Option<VolumeAssociation> {
        let el = self
            .root
            .child("metadata")?
            .elements()
            .find(|e| is_association(e))?;
        Some(VolumeAssociation {
            pool: el.attr("pool")?.to_string(),
            volume: el.attr("volume")?.to_string(),
        })
    }

    pub fn to_xml(&self) -> String {
        self.root.to_xml()
    }

    fn primary_disk(&self) -> Option<&Element> {
        self.root
            .child("devices")?
            .elements()
            .find(|e| e.name == "disk" && e.attr("device").unwrap_or("disk") == "disk")
    }

    fn interfaces(&self) -> impl Iterator<Item = &Element> {
        self.root
            .child("devices")
            .into_iter()
            .flat_map(|d| d.elements())
            .filter(|e| e.name == "interface")
    }
}

fn is_association(el: &Element) -> bool {
    match el.name.split_once(':') {
        Some((prefix, "volume")) => el.attr(&format!("xmlns:{prefix}")) == Some(METADATA_NS),
        _ => false,
    }
}

/// Rewrite `template` into the definition of a new instance.
///
/// Sets name and UUID, points the primary disk at the clone's qcow2 volume,
/// gives every interface a MAC drawn from `next_mac` that collides with no
/// template MAC, drops the template's NVRAM path and records the volume
/// association under `<metadata>`. The template value is left untouched.
pub fn clone_definition(
    template: &DomainDefinition,
    identity: &CloneIdentity,
    mut next_mac: impl FnMut() -> MacAddress,
) -> Result<DomainDefinition, ExecutorError> {
    if template.primary_disk_source().is_none() {
        return Err(ExecutorError::Provision {
            message: format!(
                "template '{}' has no file-backed disk to clone",
                template.name().unwrap_or_default()
            ),
            hint: "the template's primary disk must be a file in a storage pool".into(),
        });
    }

    let mut root = template.root.clone();
    root.ensure_child("name").set_text(&identity.name);
    root.ensure_child("uuid")
        .set_text(&identity.uuid.hyphenated().to_string());

    let mut taken = template.mac_addresses();
    if let Some(devices) = root.child_mut("devices") {
        let mut disk_done = false;
        for dev in devices.elements_mut() {
            match dev.name.as_str() {
                "disk" if !disk_done && dev.attr("device").unwrap_or("disk") == "disk" => {
                    dev.set_attr("type", "file");
                    dev.ensure_child("driver").set_attr("type", "qcow2");
                    let source = dev.ensure_child("source");
                    source.attributes.clear();
                    source.set_attr("file", &identity.disk_path);
                    disk_done = true;
                }
                "interface" => {
                    let mac = loop {
                        let candidate = next_mac().to_string();
                        if !taken.contains(&candidate) {
                            break candidate;
                        }
                    };
                    dev.ensure_child("mac").set_attr("address", &mac);
                    taken.push(mac);
                }
                _ => {}
            }
        }
    }

    if let Some(os) = root.child_mut("os") {
        os.retain_elements(|e| e.name != "nvram");
    }

    let metadata = root.ensure_child("metadata");
    metadata.retain_elements(|e| !is_association(e));
    metadata.children.push(crate::xml::Node::Element(
        Element::new(format!("{METADATA_PREFIX}:volume"))
            .with_attr(&format!("xmlns:{METADATA_PREFIX}"), METADATA_NS)
            .with_attr("pool", &identity.volume.pool)
            .with_attr("volume", &identity.volume.volume),
    ));

    Ok(DomainDefinition { root })
}
