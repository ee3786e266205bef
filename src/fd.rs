//! The restricted-fd open/close boundary (spec §6) and the ref-counted device fd built on top of it.

use std::{
    fmt,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;

/// Caller-supplied pair used to open and close every DRM character device this crate touches.
///
/// Letting the caller intermediate `open`/`close` allows a seat manager (logind, libseat, a custom
/// compositor session) to hand out already-privileged file descriptors without this crate ever
/// needing to know how the seat is managed — that negotiation is explicitly out of scope (spec §1).
pub trait RestrictedFdOps: Send + Sync {
    /// Opens `path` with the given `libc` `open(2)` flags, returning an owned fd on success.
    fn open(&self, path: &Path, flags: i32) -> std::io::Result<OwnedFd>;

    /// Closes a previously-opened fd. Called exactly once per successful `open`.
    fn close(&self, fd: OwnedFd);
}

/// Returns the path of an open fd via `/proc/self/fd`, best-effort.
pub trait DevPath {
    /// Best-effort path of this open file descriptor.
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsRawFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.as_raw_fd())).ok()
    }
}

struct Inner {
    fd: OwnedFd,
    ops: Arc<dyn RestrictedFdOps>,
    privileged: bool,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("fd", &self.fd.as_raw_fd())
            .field("privileged", &self.privileged)
            .finish()
    }
}

impl AsFd for Inner {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for Inner {}
impl ControlDevice for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        tracing::info!(path = ?self.dev_path(), "closing DRM device");
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                tracing::error!(%err, "failed to release drm master lock");
            }
        }
        // Swap a dummy fd in so we can hand ownership to the caller's close callback.
        let fd = std::mem::replace(&mut self.fd, dummy_fd());
        self.ops.close(fd);
    }
}

fn dummy_fd() -> OwnedFd {
    // /dev/null always exists and is cheap to (re)open; only used to satisfy `OwnedFd`'s move
    // semantics while handing the real fd to the caller's close callback in `Drop`.
    std::fs::File::open("/dev/null")
        .expect("/dev/null must exist")
        .into()
}

/// A ref-counted, restricted-open DRM device file descriptor.
///
/// Cloning is cheap (an `Arc` bump); the underlying fd and DRM-master lock are released exactly
/// once, when the last clone is dropped, via the caller's [`RestrictedFdOps::close`].
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<Inner>);

impl DeviceFd {
    /// Opens `path` via `ops`, attempting to also become DRM master.
    ///
    /// Becoming master is best-effort: on modern kernels a session manager typically already
    /// grants the permissions a modeset needs without an explicit `SET_MASTER`, so failure here is
    /// only logged, never propagated.
    pub fn open(ops: Arc<dyn RestrictedFdOps>, path: &Path, flags: i32) -> std::io::Result<DeviceFd> {
        let fd = ops.open(path, flags)?;
        let mut inner = Inner {
            fd,
            ops,
            privileged: false,
        };

        if inner.acquire_master_lock().is_ok() {
            inner.privileged = true;
        } else {
            tracing::warn!(?path, "unable to become drm master, assuming unprivileged mode");
        }

        Ok(DeviceFd(Arc::new(inner)))
    }

    /// Whether this handle holds the DRM master lock.
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }
}

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl BasicDevice for DeviceFd {}
impl ControlDevice for DeviceFd {}
