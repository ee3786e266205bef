//! Typed handles over raw DRM kernel object ids (spec §3 / §4.A).
//!
//! Construction here is a pure data layer: every constructor reads the object's properties once at
//! discovery time, caches the ids this crate will need later, and either returns a fully built value
//! or an error — a partially read object is never published. Ownership is always Device → Objects;
//! a resource's link back to its current connector is a [`std::sync::Weak`], never a strong ref, so
//! the graph can't cycle.

pub mod connector_mode;
pub mod crtc;
pub mod device;
pub mod encoder;
pub mod plane;
pub mod property_blob;

pub use connector_mode::ConnectorMode;
pub use crtc::Crtc;
pub use device::{ClientCapabilities, Device, DeviceCapabilities};
pub use encoder::Encoder;
pub use plane::{Plane, PlaneType};
pub use property_blob::PropertyBlob;

use drm::control::{property, Device as ControlDevice, ResourceHandle};

use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};

/// Looks up the property ids for `names` on `handle`, in order, leaving `None` where a kernel
/// object doesn't expose that property (some drivers omit `VRR_ENABLED`, `IN_FENCE_FD`, ...).
pub(crate) fn property_ids<H: ResourceHandle>(
    fd: &DeviceFd,
    handle: H,
    names: &[&'static str],
) -> Result<Vec<Option<property::Handle>>, Error> {
    let set = fd.get_properties(handle).map_err(|source| Error::Kernel {
        errmsg: "failed to query object properties",
        dev: fd.dev_path(),
        source,
    })?;
    let (ids, _) = set.as_props_and_values();

    let mut found = vec![None; names.len()];
    for id in ids {
        let Ok(info) = fd.get_property(*id) else {
            continue;
        };
        let Ok(name) = info.name().to_str() else {
            continue;
        };
        if let Some(pos) = names.iter().position(|n| *n == name) {
            found[pos] = Some(*id);
        }
    }
    Ok(found)
}

/// Reads the current raw value of a single property already known to exist on `handle`.
pub(crate) fn property_value<H: ResourceHandle>(
    fd: &DeviceFd,
    handle: H,
    prop: property::Handle,
) -> Result<u64, Error> {
    let set = fd.get_properties(handle).map_err(|source| Error::Kernel {
        errmsg: "failed to query object properties",
        dev: fd.dev_path(),
        source,
    })?;
    let (ids, values) = set.as_props_and_values();
    ids.iter()
        .zip(values.iter())
        .find(|(id, _)| **id == prop)
        .map(|(_, value)| *value)
        .ok_or(Error::Invalid("property id no longer present on object"))
}
