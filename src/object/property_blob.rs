//! An opaque kernel-side property blob (e.g. a MODE_ID or GAMMA_LUT payload).

use std::fmt;
use std::sync::Arc;

use drm::control::{property, Device as ControlDevice};

use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};

struct Inner {
    fd: DeviceFd,
    value: property::Value<'static>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.fd.destroy_property_blob(self.value.into()) {
            tracing::warn!(%err, "failed to destroy property blob");
        }
    }
}

/// A kernel blob, shared so it stays alive for at least as long as the longest atomic request that
/// references it.
///
/// Blobs are reference counted by `Arc` rather than by the kernel's own blob refcount: this crate
/// only ever creates a blob right before attaching it to a request, and the kernel destroys it once
/// every clone of this handle — every request holding it — has been dropped.
#[derive(Clone)]
pub struct PropertyBlob(Arc<Inner>);

impl fmt::Debug for PropertyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBlob").field("value", &self.0.value).finish()
    }
}

impl PropertyBlob {
    /// Uploads `data` as a new kernel blob.
    pub(crate) fn create<T>(fd: &DeviceFd, data: &T) -> Result<PropertyBlob, Error> {
        let value = fd.create_property_blob(data).map_err(|source| Error::Kernel {
            errmsg: "failed to create property blob",
            dev: fd.dev_path(),
            source,
        })?;
        Ok(PropertyBlob(Arc::new(Inner {
            fd: fd.clone(),
            value,
        })))
    }

    /// Uploads a slice of fixed-layout kernel structs as a blob, for payloads whose length is only
    /// known at runtime (e.g. a `GAMMA_LUT` array sized to the CRTC's reported gamma size).
    ///
    /// `Device::create_property_blob` only serializes a single `&T`, so a dynamically sized payload
    /// goes through the lower-level ffi call directly instead, the same way a damage-clip rect list
    /// does. Takes `data` mutably because the ffi call wants a `&mut [u8]`, even though it only
    /// reads the bytes back into the kernel.
    pub(crate) fn create_from_slice<T: Copy>(fd: &DeviceFd, data: &mut [T]) -> Result<PropertyBlob, Error> {
        use std::os::unix::io::AsRawFd;

        let bytes = unsafe {
            std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, std::mem::size_of_val(data))
        };
        let blob = drm_ffi::mode::create_property_blob(fd.as_raw_fd(), bytes).map_err(|source| Error::Kernel {
            errmsg: "failed to create property blob",
            dev: fd.dev_path(),
            source,
        })?;
        Ok(PropertyBlob(Arc::new(Inner {
            fd: fd.clone(),
            value: property::Value::Blob(blob.blob_id.into()),
        })))
    }

    /// The raw property value to attach to an atomic request.
    pub(crate) fn value(&self) -> property::Value<'static> {
        self.0.value
    }
}
