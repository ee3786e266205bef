//! One opened DRM node and everything it owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bitflags::bitflags;
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use gbm::Device as GbmDevice;
use once_cell::sync::OnceCell;

use super::{Crtc, Encoder, Plane};
use crate::connector::Connector;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};
use crate::lease::{Lease, LeaseResources};
use crate::node::DrmNode;
use crate::strategy::Strategy;

bitflags! {
    /// Client capabilities this crate was able to negotiate with the kernel.
    ///
    /// Each bit corresponds to one `DRM_IOCTL_SET_CLIENT_CAP` call; failure to enable one is never
    /// fatal; it just means the corresponding bit stays clear and the rest of the crate degrades
    /// (e.g. without `ATOMIC`, the connector falls back to legacy `SetCrtc`/page-flip ioctls).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientCapabilities: u32 {
        /// `DRM_CLIENT_CAP_UNIVERSAL_PLANES`.
        const UNIVERSAL_PLANES = 1 << 0;
        /// `DRM_CLIENT_CAP_ATOMIC`.
        const ATOMIC = 1 << 1;
        /// `DRM_CLIENT_CAP_WRITEBACK_CONNECTORS`.
        const WRITEBACK = 1 << 2;
        /// `DRM_CLIENT_CAP_ASPECT_RATIO`.
        const ASPECT_RATIO = 1 << 3;
        /// `DRM_CLIENT_CAP_STEREO_3D`.
        const STEREO_3D = 1 << 4;
    }
}

bitflags! {
    /// Device capabilities queried via `DRM_IOCTL_GET_CAP`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCapabilities: u32 {
        /// `DRM_CAP_DUMB_BUFFER`.
        const DUMB_BUFFER = 1 << 0;
        /// `DRM_CAP_PRIME` bit 0.
        const PRIME_IMPORT = 1 << 1;
        /// `DRM_CAP_PRIME` bit 1.
        const PRIME_EXPORT = 1 << 2;
        /// `DRM_CAP_ADDFB2_MODIFIERS`.
        const ADD_FB2_MODIFIERS = 1 << 3;
        /// `DRM_CAP_ASYNC_PAGE_FLIP`.
        const ASYNC_PAGE_FLIP = 1 << 4;
        /// `DRM_CAP_TIMESTAMP_MONOTONIC`.
        const MONOTONIC_TIMESTAMP = 1 << 5;
    }
}

const PRIME_CAP_IMPORT: u64 = 1 << 0;
const PRIME_CAP_EXPORT: u64 = 1 << 1;

/// One opened DRM node and the Crtc/Encoder/Plane/Connector trees discovered on it.
#[derive(Debug)]
pub struct Device {
    fd: DeviceFd,
    node: Option<DrmNode>,
    driver_name: String,
    client_caps: ClientCapabilities,
    device_caps: DeviceCapabilities,
    crtcs: Vec<Arc<Crtc>>,
    encoders: Vec<Arc<Encoder>>,
    planes: Vec<Arc<Plane>>,
    connectors: RwLock<Vec<Arc<Connector>>>,
    renderer_device: RwLock<Weak<Device>>,
    strategy: RwLock<Strategy>,
    enabled: AtomicBool,
    gbm: OnceCell<GbmDevice<DeviceFd>>,
}

impl Device {
    /// Assembles a `Device` from its already-discovered children.
    ///
    /// Called exclusively by the device registry once it has negotiated capabilities and built the
    /// Crtc/Encoder/Plane lists in kernel discovery order; the connector list starts empty and is
    /// populated by the same pass immediately afterwards.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        fd: DeviceFd,
        node: Option<DrmNode>,
        driver_name: String,
        client_caps: ClientCapabilities,
        device_caps: DeviceCapabilities,
        crtcs: Vec<Arc<Crtc>>,
        encoders: Vec<Arc<Encoder>>,
        planes: Vec<Arc<Plane>>,
    ) -> Device {
        Device {
            fd,
            node,
            driver_name,
            client_caps,
            device_caps,
            crtcs,
            encoders,
            planes,
            connectors: RwLock::new(Vec::new()),
            renderer_device: RwLock::new(Weak::new()),
            strategy: RwLock::new(Strategy::SelfRender),
            enabled: AtomicBool::new(true),
            gbm: OnceCell::new(),
        }
    }

    /// Best-effort client capability negotiation; unsupported bits are simply left clear.
    pub(crate) fn negotiate_client_capabilities(fd: &DeviceFd) -> ClientCapabilities {
        let mut caps = ClientCapabilities::empty();
        let wanted = [
            (ClientCapability::UniversalPlanes, ClientCapabilities::UNIVERSAL_PLANES),
            (ClientCapability::Atomic, ClientCapabilities::ATOMIC),
            (ClientCapability::AspectRatio, ClientCapabilities::ASPECT_RATIO),
        ];
        for (raw, bit) in wanted {
            if fd.set_client_capability(raw, true).is_ok() {
                caps |= bit;
            }
        }
        // Writeback connectors and stereo-3D both require atomic to already be enabled.
        if caps.contains(ClientCapabilities::ATOMIC) {
            if fd.set_client_capability(ClientCapability::WritebackConnectors, true).is_ok() {
                caps |= ClientCapabilities::WRITEBACK;
            }
        }
        if fd.set_client_capability(ClientCapability::Stereo3D, true).is_ok() {
            caps |= ClientCapabilities::STEREO_3D;
        }
        caps
    }

    /// Queries device-wide capabilities via `DRM_IOCTL_GET_CAP`.
    pub(crate) fn query_device_capabilities(fd: &DeviceFd) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::empty();
        if matches!(fd.get_driver_capability(DriverCapability::DumbBuffer), Ok(1)) {
            caps |= DeviceCapabilities::DUMB_BUFFER;
        }
        if let Ok(prime) = fd.get_driver_capability(DriverCapability::Prime) {
            if prime & PRIME_CAP_IMPORT != 0 {
                caps |= DeviceCapabilities::PRIME_IMPORT;
            }
            if prime & PRIME_CAP_EXPORT != 0 {
                caps |= DeviceCapabilities::PRIME_EXPORT;
            }
        }
        if matches!(fd.get_driver_capability(DriverCapability::AddFB2Modifiers), Ok(1)) {
            caps |= DeviceCapabilities::ADD_FB2_MODIFIERS;
        }
        if matches!(fd.get_driver_capability(DriverCapability::ASyncPageFlip), Ok(1)) {
            caps |= DeviceCapabilities::ASYNC_PAGE_FLIP;
        }
        if matches!(fd.get_driver_capability(DriverCapability::MonotonicTimestamp), Ok(1)) {
            caps |= DeviceCapabilities::MONOTONIC_TIMESTAMP;
        }
        caps
    }

    /// The device's restricted fd.
    pub fn fd(&self) -> &DeviceFd {
        &self.fd
    }

    /// The classified DRM node this device was opened from, if classification succeeded.
    pub fn node(&self) -> Option<DrmNode> {
        self.node
    }

    /// Driver name as reported by `DRM_IOCTL_VERSION`.
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Successfully negotiated client capabilities.
    pub fn client_capabilities(&self) -> ClientCapabilities {
        self.client_caps
    }

    /// Device capabilities.
    pub fn device_capabilities(&self) -> DeviceCapabilities {
        self.device_caps
    }

    /// CRTCs owned by this device, in discovery order.
    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    /// Encoders owned by this device, in discovery order.
    pub fn encoders(&self) -> &[Arc<Encoder>] {
        &self.encoders
    }

    /// Planes owned by this device, in discovery order.
    pub fn planes(&self) -> &[Arc<Plane>] {
        &self.planes
    }

    /// Connectors currently attached to this device.
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().unwrap().clone()
    }

    /// Replaces the connector list. Only the hotplug dispatcher calls this, and only while every
    /// connector whose membership is changing has its render thread joined (spec §5).
    pub(crate) fn set_connectors(&self, connectors: Vec<Arc<Connector>>) {
        *self.connectors.write().unwrap() = connectors;
    }

    /// The device that renders frames for this device: itself for `Self` strategy devices, another
    /// device for `Prime`/`Dumb`/`CPU` strategy devices.
    pub fn renderer_device(&self) -> Option<Arc<Device>> {
        self.renderer_device.read().unwrap().upgrade()
    }

    pub(crate) fn set_renderer_device(&self, device: Weak<Device>) {
        *self.renderer_device.write().unwrap() = device;
    }

    /// The rendering strategy assigned to this device.
    pub fn strategy(&self) -> Strategy {
        *self.strategy.read().unwrap()
    }

    pub(crate) fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write().unwrap() = strategy;
    }

    /// Whether this device currently participates in scanout.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// The GBM device wrapping this node's fd, opened lazily on first use and cached thereafter.
    ///
    /// Devices assigned the `Dumb`/`CPU` strategies never allocate GBM buffers of their own but
    /// may still need this (the Prime strategy imports into a GBM device on the scanout side), so
    /// opening happens on demand rather than eagerly in [`Device::new`].
    pub(crate) fn gbm(&self) -> Result<&GbmDevice<DeviceFd>, Error> {
        self.gbm.get_or_try_init(|| {
            GbmDevice::new(self.fd.clone()).map_err(|source| Error::Alloc { dev: self.fd.dev_path(), source })
        })
    }

    /// Leases `resources` to another process, marking each resource `leased` for as long as the
    /// returned [`Lease`] lives (spec §4.F).
    pub fn create_lease(self: &Arc<Self>, resources: LeaseResources) -> Result<Lease, Error> {
        Lease::create(self, resources)
    }
}
