//! DRM/KMS resource leases (spec §4.F).
//!
//! Grounded on `examples/original_source/src/CZ/SRM/SRMLease.cpp`'s revoke-on-drop shape, adapted to
//! this crate's `Arc`-owned object graph, and on the teacher's own lease client in
//! `src/wayland/drm_lease/mod.rs` (`DrmLeaseBuilder::build`/`DrmLease`'s `drm.create_lease`/
//! `drm.revoke_lease` calls and fd ownership).

use std::num::NonZeroU32;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use drm::control::{connector, crtc, plane, Device as ControlDevice, RawResourceHandle};
use rustix::fs::OFlags;

use crate::connector::Connector;
use crate::error::Error;
use crate::fd::DevPath;
use crate::object::{Crtc, Device, Plane};

/// The set of resources a [`Lease`] hands to another process.
#[derive(Debug, Default, Clone)]
pub struct LeaseResources {
    pub connectors: Vec<Arc<Connector>>,
    pub crtcs: Vec<Arc<Crtc>>,
    pub planes: Vec<Arc<Plane>>,
}

impl LeaseResources {
    fn raw_handles(&self) -> Vec<RawResourceHandle> {
        self.connectors
            .iter()
            .map(|c| RawResourceHandle::from(c.handle()))
            .chain(self.crtcs.iter().map(|c| RawResourceHandle::from(c.handle())))
            .chain(self.planes.iter().map(|p| RawResourceHandle::from(p.handle())))
            .collect()
    }

    fn set_leased(&self, leased: bool) {
        for connector in &self.connectors {
            connector.set_leased(leased);
        }
        for crtc in &self.crtcs {
            crtc.set_leased(leased);
        }
        for plane in &self.planes {
            plane.set_leased(leased);
        }
    }
}

/// A temporary delegation of connectors, CRTCs and planes to another process.
///
/// Created via [`Device::create_lease`]. Every leased resource is marked `leased` for as long as
/// this value lives, vetoing it out of this crate's own configuration search (spec §4.C); dropping
/// the lease revokes it with the kernel, closes the fd and clears the flags.
pub struct Lease {
    resources: LeaseResources,
    device: Weak<Device>,
    fd: OwnedFd,
    lessee: NonZeroU32,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("lessee", &self.lessee).finish()
    }
}

impl Lease {
    pub(crate) fn create(device: &Arc<Device>, resources: LeaseResources) -> Result<Lease, Error> {
        let handles = resources.raw_handles();
        if handles.is_empty() {
            return Err(Error::Invalid("lease must cover at least one resource"));
        }

        let fd = device.fd();
        let (lessee, lease_fd) = fd
            .create_lease(&handles, OFlags::CLOEXEC.bits())
            .map_err(|source| Error::Kernel {
                errmsg: "failed to create lease",
                dev: fd.dev_path(),
                source,
            })?;

        resources.set_leased(true);

        Ok(Lease {
            resources,
            device: Arc::downgrade(device),
            fd: lease_fd,
            lessee,
        })
    }

    /// The fd handed to the lessee process; valid for the lifetime of this `Lease`.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The resources this lease covers.
    pub fn resources(&self) -> &LeaseResources {
        &self.resources
    }

    /// The kernel lessee id.
    pub fn id(&self) -> u32 {
        self.lessee.get()
    }

    pub fn connectors(&self) -> impl Iterator<Item = connector::Handle> + '_ {
        self.resources.connectors.iter().map(|c| c.handle())
    }

    pub fn crtcs(&self) -> impl Iterator<Item = crtc::Handle> + '_ {
        self.resources.crtcs.iter().map(|c| c.handle())
    }

    pub fn planes(&self) -> impl Iterator<Item = plane::Handle> + '_ {
        self.resources.planes.iter().map(|p| p.handle())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(device) = self.device.upgrade() else {
            tracing::error!(lessee = self.lessee.get(), "failed to revoke lease (device already destroyed)");
            self.resources.set_leased(false);
            return;
        };

        if let Err(err) = device.fd().revoke_lease(self.lessee) {
            tracing::warn!(%err, lessee = self.lessee.get(), "failed to revoke lease");
        }
        self.resources.set_leased(false);
        tracing::trace!(lessee = self.lessee.get(), "lease revoked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_resources_have_no_raw_handles() {
        let resources = LeaseResources::default();
        assert!(resources.raw_handles().is_empty());
    }
}
