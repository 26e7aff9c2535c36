//! Storage volume XML generation using facet-xml struct serialization.

use facet::Facet;
use facet_xml as xml;

use crate::error::ExecutorError;

#[derive(Debug, Facet)]
#[facet(rename = "volume")]
struct VolumeDef {
    #[facet(xml::attribute)]
    #[facet(rename = "type")]
    kind: String,
    name: String,
    /// Zero keeps the overlay thin; it grows as the guest writes.
    allocation: u64,
    /// Bytes.
    capacity: u64,
    target: VolumeTarget,
    #[facet(rename = "backingStore")]
    backing_store: BackingStore,
}

#[derive(Debug, Facet)]
struct VolumeTarget {
    format: Format,
}

#[derive(Debug, Facet)]
struct BackingStore {
    path: String,
    format: Format,
}

#[derive(Debug, Facet)]
struct Format {
    #[facet(xml::attribute)]
    #[facet(rename = "type")]
    kind: String,
}

/// XML for a qcow2 volume of `capacity` bytes layered on `backing_path`.
pub fn backed_volume_xml(
    name: &str,
    capacity: u64,
    backing_path: &str,
    backing_format: &str,
) -> Result<String, ExecutorError> {
    let vol = VolumeDef {
        kind: "file".into(),
        name: name.into(),
        allocation: 0,
        capacity,
        target: VolumeTarget {
            format: Format {
                kind: "qcow2".into(),
            },
        },
        backing_store: BackingStore {
            path: backing_path.into(),
            format: Format {
                kind: backing_format.into(),
            },
        },
    };

    facet_xml::to_string(&vol).map_err(|e| ExecutorError::Storage {
        message: format!("serializing volume XML for {name}: {e}"),
        hint: "this is a bug in libvirt-executor".into(),
    })
}
