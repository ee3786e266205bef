//! The CRTC: the scanout engine that reads a framebuffer and drives a connector at a mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use drm::control::{crtc, Device as ControlDevice};

use super::device::ClientCapabilities;
use super::property_ids;
use crate::connector::Connector;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};

const PROP_NAMES: &[&str] = &["ACTIVE", "MODE_ID", "GAMMA_LUT", "GAMMA_LUT_SIZE", "VRR_ENABLED"];

/// Property ids a [`Crtc`] needs for atomic commits, cached once at discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrtcPropertyIds {
    /// Whether the CRTC is driving output at all.
    pub active: Option<drm::control::property::Handle>,
    /// The MODE_ID blob currently bound to the CRTC.
    pub mode_id: Option<drm::control::property::Handle>,
    /// The GAMMA_LUT blob, if this CRTC supports an atomic gamma LUT.
    pub gamma_lut: Option<drm::control::property::Handle>,
    /// Size (entry count) the GAMMA_LUT blob must have.
    pub gamma_lut_size: Option<drm::control::property::Handle>,
    /// Variable refresh rate toggle, absent on most hardware.
    pub vrr_enabled: Option<drm::control::property::Handle>,
}

/// A CRTC.
#[derive(Debug)]
pub struct Crtc {
    handle: crtc::Handle,
    props: CrtcPropertyIds,
    legacy_gamma_size: u32,
    atomic_gamma_size: Option<u32>,
    current_connector: Mutex<Weak<Connector>>,
    leased: AtomicBool,
}

impl Crtc {
    /// Reads a CRTC's properties and gamma size off the kernel.
    ///
    /// The atomic gamma size comes from the `GAMMA_LUT_SIZE` property, and only when `caps` has
    /// negotiated `ATOMIC`: a driver can expose the property while the client still only talks
    /// legacy ioctls, in which case the legacy `drmModeCrtcGetGamma` size is the one that actually
    /// governs `drmModeCrtcSetGamma` calls. Drivers with no atomic gamma support at all fall back to
    /// the legacy size unconditionally.
    pub(crate) fn from_kernel(fd: &DeviceFd, handle: crtc::Handle, caps: ClientCapabilities) -> Result<Crtc, Error> {
        let ids = property_ids(fd, handle, PROP_NAMES)?;
        let props = CrtcPropertyIds {
            active: ids[0],
            mode_id: ids[1],
            gamma_lut: ids[2],
            gamma_lut_size: ids[3],
            vrr_enabled: ids[4],
        };

        let info = fd.get_crtc(handle).map_err(|source| Error::Kernel {
            errmsg: "failed to query crtc info",
            dev: fd.dev_path(),
            source,
        })?;
        let legacy_gamma_size = info.gamma_length();

        let atomic_gamma_size = if caps.contains(ClientCapabilities::ATOMIC) {
            props.gamma_lut_size.and_then(|id| super::property_value(fd, handle, id).ok()).map(|v| v as u32)
        } else {
            None
        };

        Ok(Crtc {
            handle,
            props,
            legacy_gamma_size,
            atomic_gamma_size,
            current_connector: Mutex::new(Weak::new()),
            leased: AtomicBool::new(false),
        })
    }

    /// The kernel object id.
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Cached property ids.
    pub fn property_ids(&self) -> CrtcPropertyIds {
        self.props
    }

    /// Gamma LUT size to use: the atomic `GAMMA_LUT_SIZE` value when the client negotiated atomic
    /// and the driver exposed one, otherwise the legacy `drmModeCrtcGetGamma` size.
    pub fn gamma_size(&self) -> u32 {
        self.atomic_gamma_size.unwrap_or(self.legacy_gamma_size)
    }

    /// The connector currently bound to this CRTC, if any and still alive.
    pub fn current_connector(&self) -> Option<std::sync::Arc<Connector>> {
        self.current_connector.lock().unwrap().upgrade()
    }

    /// Updates the weak back-link. Called by the connector that just claimed or released this CRTC.
    pub(crate) fn set_current_connector(&self, connector: Weak<Connector>) {
        *self.current_connector.lock().unwrap() = connector;
    }

    /// Whether a lease currently holds this CRTC; an immovable veto for configuration search.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Release);
    }
}
