//! Device enumeration, capability negotiation and renderer-device assignment (spec §4.B).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;

use crate::error::Error;
use crate::fd::{DeviceFd, RestrictedFdOps};
use crate::node::DrmNode;
use crate::object::{Crtc, Device, DeviceCapabilities, Encoder, Plane};
use crate::strategy::Strategy;

/// Every `Device` this crate has opened, plus the renderer-device assignment computed over them.
///
/// Construction is the only place that enumerates `/dev/dri`; the hotplug dispatcher (§4.G) updates
/// an existing `Registry` in place rather than rebuilding it from scratch.
#[derive(Debug)]
pub struct Registry {
    devices: Vec<Arc<Device>>,
}

impl Registry {
    /// Opens every primary DRM node under `/dev/dri`, builds its object tree, and assigns a
    /// rendering strategy to each device.
    pub fn open_all(ops: Arc<dyn RestrictedFdOps>) -> Result<Registry, Error> {
        let mut devices = Vec::new();
        for path in discover_primary_nodes()? {
            let span = tracing::info_span!("drm_device", path = %path.display());
            let _guard = span.enter();
            match open_device(ops.clone(), &path) {
                Ok(device) => devices.push(device),
                Err(err) => tracing::warn!(%err, "failed to open drm device, skipping"),
            }
        }

        if devices.is_empty() {
            return Err(Error::NotSupported {
                what: "no usable DRM device found under /dev/dri",
                dev: None,
            });
        }

        assign_renderer_devices(&devices);

        Ok(Registry { devices })
    }

    /// All opened devices, in discovery order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Registers a newly attached device and re-runs renderer-device assignment over the whole set.
    pub(crate) fn add_device(&mut self, device: Arc<Device>) {
        self.devices.push(device);
        assign_renderer_devices(&self.devices);
    }

    /// Removes a departed device. Returns it so the hotplug dispatcher can drive its connectors to
    /// `Uninitializing` before it is dropped.
    pub(crate) fn remove_device(&mut self, node: DrmNode) -> Option<Arc<Device>> {
        let idx = self.devices.iter().position(|d| d.node() == Some(node))?;
        let removed = self.devices.remove(idx);
        assign_renderer_devices(&self.devices);
        Some(removed)
    }
}

fn discover_primary_nodes() -> Result<Vec<PathBuf>, Error> {
    let read = fs::read_dir("/dev/dri").map_err(Error::Io)?;
    let mut paths: Vec<PathBuf> = read
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("card"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

pub(crate) fn open_device(ops: Arc<dyn RestrictedFdOps>, path: &Path) -> Result<Arc<Device>, Error> {
    let fd = DeviceFd::open(ops, path, libc::O_RDWR | libc::O_CLOEXEC)?;
    let node = DrmNode::from_path(path).ok();

    let driver_name = fd
        .get_driver()
        .map(|driver| driver.name().to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let client_caps = Device::negotiate_client_capabilities(&fd);
    let device_caps = Device::query_device_capabilities(&fd);

    let res_handles = fd.resource_handles().map_err(|source| Error::Kernel {
        errmsg: "failed to query drm resources",
        dev: fd.dev_path(),
        source,
    })?;

    // Crtcs first: Encoders and Planes both resolve "possible crtcs" bitmasks against this list,
    // and the bit order only makes sense if it matches the kernel's own resource-handle order.
    let crtcs: Vec<Arc<Crtc>> = res_handles
        .crtcs()
        .iter()
        .filter_map(|handle| match Crtc::from_kernel(&fd, *handle, client_caps) {
            Ok(crtc) => Some(Arc::new(crtc)),
            Err(err) => {
                tracing::warn!(%err, ?handle, "failed to read crtc, skipping");
                None
            }
        })
        .collect();

    let encoders: Vec<Arc<Encoder>> = res_handles
        .encoders()
        .iter()
        .filter_map(|handle| match Encoder::from_kernel(&fd, *handle, &res_handles) {
            Ok(encoder) => Some(Arc::new(encoder)),
            Err(err) => {
                tracing::warn!(%err, ?handle, "failed to read encoder, skipping");
                None
            }
        })
        .collect();

    let planes: Vec<Arc<Plane>> = fd
        .plane_handles()
        .map_err(|source| Error::Kernel {
            errmsg: "failed to list planes",
            dev: fd.dev_path(),
            source,
        })?
        .iter()
        .filter_map(|handle| match Plane::from_kernel(&fd, *handle, &res_handles) {
            Ok(plane) => Some(Arc::new(plane)),
            Err(err) => {
                tracing::warn!(%err, ?handle, "failed to read plane, skipping");
                None
            }
        })
        .collect();

    tracing::info!(
        driver = %driver_name,
        crtcs = crtcs.len(),
        encoders = encoders.len(),
        planes = planes.len(),
        "opened drm device"
    );

    let device = Arc::new(Device::new(
        fd,
        node,
        driver_name,
        client_caps,
        device_caps,
        crtcs,
        encoders,
        planes,
    ));

    let connectors = res_handles
        .connectors()
        .iter()
        .filter_map(
            |handle| match crate::connector::Connector::from_kernel(*handle, &device) {
                Ok(connector) => Some(connector),
                Err(err) => {
                    tracing::warn!(%err, ?handle, "failed to read connector, skipping");
                    None
                }
            },
        )
        .collect();
    device.set_connectors(connectors);

    Ok(device)
}

/// Runs the Self → Prime → Dumb → CPU assignment for every device in `devices` (spec §4.B).
///
/// A device can render for itself if it exposes its own render node (a proxy for "this GPU has a
/// rendering engine", which the original always pairs with a GBM-capable node). Otherwise we look
/// for another self-rendering device: `Prime` if this device negotiated PRIME import, `Dumb` if it
/// at least supports dumb buffers, `CPU` unconditionally as the last resort. Ties between otherwise
/// equally good renderer candidates favor the boot-VGA device.
fn assign_renderer_devices(devices: &[Arc<Device>]) {
    let self_renderers: Vec<&Arc<Device>> = devices.iter().filter(|d| can_render_self(d)).collect();

    for device in devices {
        if can_render_self(device) {
            device.set_renderer_device(Arc::downgrade(device));
            device.set_strategy(Strategy::SelfRender);
            continue;
        }

        let Some(renderer) = pick_renderer(&self_renderers) else {
            tracing::warn!(
                node = ?device.node(),
                "no self-rendering device available; connectors on this device will not initialize"
            );
            continue;
        };

        let strategy = if device.device_capabilities().contains(DeviceCapabilities::PRIME_IMPORT) {
            Strategy::Prime
        } else if device.device_capabilities().contains(DeviceCapabilities::DUMB_BUFFER) {
            Strategy::Dumb
        } else {
            Strategy::Cpu
        };

        device.set_renderer_device(Arc::downgrade(renderer));
        device.set_strategy(strategy);
    }
}

fn can_render_self(device: &Device) -> bool {
    device.node().map(|node| node.has_render()).unwrap_or(false)
}

fn pick_renderer<'a>(candidates: &[&'a Arc<Device>]) -> Option<&'a Arc<Device>> {
    candidates
        .iter()
        .find(|device| is_boot_vga(device))
        .or_else(|| candidates.first())
        .copied()
}

fn is_boot_vga(device: &Device) -> bool {
    let Some(node) = device.node() else {
        return false;
    };
    let path = format!(
        "/sys/dev/char/{}:{}/device/boot_vga",
        node.major(),
        node.minor()
    );
    fs::read_to_string(path)
        .map(|contents| contents.trim() == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_renderer_prefers_boot_vga_when_tied() {
        // `is_boot_vga` depends on sysfs state we can't fabricate in a unit test; this exercises
        // the tie-break plumbing with an empty candidate list instead.
        let empty: Vec<&Arc<Device>> = Vec::new();
        assert!(pick_renderer(&empty).is_none());
    }
}
