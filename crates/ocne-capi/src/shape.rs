//! Compute shapes, architectures and image capability correction

use std::collections::BTreeSet;

use serde_json::json;
use tracing::{debug, info};

use ocne_common::Result;

use crate::oci::OciClient;

/// Architecture name for x86-64 images
pub const ARCH_AMD64: &str = "amd64";
/// Architecture name for aarch64 images
pub const ARCH_ARM64: &str = "arm64";

/// Substrings identifying Ampere shapes
const ARM_SHAPE_MARKERS: &[&str] = &[".A1.", ".A2.", ".A4."];

/// Wildcard compatibility entry kept on every image
const GENERIC_SHAPE: &str = "*";

/// Shapes an arm64 image must be compatible with
pub const ARM_SHAPES: &[&str] = &[
    "VM.Standard.A1.Flex",
    "VM.Standard.A2.Flex",
    "BM.Standard.A1.160",
];

/// True for Ampere shapes
pub fn is_arm_shape(shape: &str) -> bool {
    ARM_SHAPE_MARKERS.iter().any(|m| shape.contains(m))
}

/// Image architecture needed by a shape
pub fn arch_from_shape(shape: &str) -> &'static str {
    if is_arm_shape(shape) {
        ARCH_ARM64
    } else {
        ARCH_AMD64
    }
}

/// Capability schema declaring UEFI firmware and paravirtualized launch
pub fn capability_schema() -> serde_json::Value {
    json!({
        "Compute.Firmware": {
            "descriptorType": "enumstring",
            "source": "IMAGE",
            "defaultValue": "UEFI_64",
            "values": ["UEFI_64"]
        },
        "Compute.LaunchMode": {
            "descriptorType": "enumstring",
            "source": "IMAGE",
            "defaultValue": "PARAVIRTUALIZED",
            "values": ["PARAVIRTUALIZED"]
        }
    })
}

/// Shape entries to drop from and add to an arm64 image
pub fn arm_shape_changes(existing: &[String]) -> (Vec<String>, Vec<String>) {
    let remove = existing
        .iter()
        .filter(|s| !is_arm_shape(s) && s.as_str() != GENERIC_SHAPE)
        .cloned()
        .collect();
    let present: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
    let add = ARM_SHAPES
        .iter()
        .filter(|s| !present.contains(*s))
        .map(|s| s.to_string())
        .collect();
    (remove, add)
}

/// Apply the capability schema and, for arm64 images, fix shape compatibility
pub async fn correct_image_capabilities(
    oci: &dyn OciClient,
    compartment: &str,
    image_id: &str,
    arch: &str,
) -> Result<()> {
    oci.create_capability_schema(compartment, image_id, &capability_schema())
        .await?;
    debug!(image = %image_id, "Applied capability schema");

    if arch != ARCH_ARM64 {
        return Ok(());
    }
    let existing = oci.list_shape_compatibilities(image_id).await?;
    let (remove, add) = arm_shape_changes(&existing);
    for shape in &remove {
        oci.remove_shape_compatibility(image_id, shape).await?;
    }
    for shape in &add {
        oci.add_shape_compatibility(image_id, shape).await?;
    }
    info!(
        image = %image_id,
        removed = remove.len(),
        added = add.len(),
        "Corrected arm64 shape compatibility"
    );
    Ok(())
}
