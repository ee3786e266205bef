//! Encoder: translates CRTC pixels into a connector's signal format.

use std::sync::{Arc, Mutex, Weak};

use drm::control::{crtc, encoder, Device as ControlDevice, ResourceHandles};

use crate::connector::Connector;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};

/// An encoder and the CRTCs it can be driven by.
#[derive(Debug)]
pub struct Encoder {
    handle: encoder::Handle,
    possible_crtcs: Vec<crtc::Handle>,
    current_connector: Mutex<Weak<Connector>>,
}

impl Encoder {
    /// Reads an encoder's possible-CRTC bitmask and resolves it against `res_handles`'s CRTC list.
    ///
    /// `res_handles` must be the same resource listing the device built its own `Crtc`s from, in the
    /// same order, since the kernel's "possible CRTCs" bitmask is positional: bit *i* means the
    /// *i*-th CRTC reported by `DRM_IOCTL_MODE_GETRESOURCES`.
    pub(crate) fn from_kernel(
        fd: &DeviceFd,
        handle: encoder::Handle,
        res_handles: &ResourceHandles,
    ) -> Result<Encoder, Error> {
        let info = fd.get_encoder(handle).map_err(|source| Error::Kernel {
            errmsg: "failed to query encoder info",
            dev: fd.dev_path(),
            source,
        })?;

        Ok(Encoder {
            handle,
            possible_crtcs: res_handles.filter_crtcs(info.possible_crtcs()),
            current_connector: Mutex::new(Weak::new()),
        })
    }

    /// The kernel object id.
    pub fn handle(&self) -> encoder::Handle {
        self.handle
    }

    /// CRTCs this encoder can be driven by, in discovery order.
    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    /// The connector currently using this encoder, if any and still alive.
    pub fn current_connector(&self) -> Option<Arc<Connector>> {
        self.current_connector.lock().unwrap().upgrade()
    }

    pub(crate) fn set_current_connector(&self, connector: Weak<Connector>) {
        *self.current_connector.lock().unwrap() = connector;
    }
}
