//! The error taxonomy shared by every layer of the rendering manager.

use std::path::PathBuf;

/// Errors produced by this crate.
///
/// Variants carry the minimum context needed to log a useful line: a best-effort device path and,
/// where applicable, the underlying kernel error. The render loop only ever recovers from
/// [`Error::Busy`] (retried until it clears or the connector is torn down) and [`Error::Kernel`]
/// raised from a steady-state commit (downgraded to a `discarded` notification); everything else
/// propagates to the caller of `initialize`/`set_mode`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested capability is unavailable on this device (e.g. atomic modesetting disabled).
    #[error("not supported on device {dev:?}: {what}")]
    NotSupported {
        /// What was requested.
        what: &'static str,
        /// Best-effort path of the device involved.
        dev: Option<PathBuf>,
    },

    /// No (encoder, crtc, plane) triple satisfies the connector's constraints.
    #[error("no viable encoder/crtc/plane combination for connector {connector}")]
    NoResources {
        /// The connector the search was run for.
        connector: u32,
    },

    /// Buffer or property-blob allocation was refused by the kernel or allocator.
    #[error("allocation failed on device {dev:?}: {source}")]
    Alloc {
        /// Best-effort path of the device involved.
        dev: Option<PathBuf>,
        /// The underlying allocator/kernel error.
        #[source]
        source: std::io::Error,
    },

    /// An ioctl failed with an errno other than `EBUSY`.
    #[error("kernel rejected {errmsg} on device {dev:?}: {source}")]
    Kernel {
        /// Human-readable description of the failed operation.
        errmsg: &'static str,
        /// Best-effort path of the device involved.
        dev: Option<PathBuf>,
        /// The underlying system error.
        #[source]
        source: std::io::Error,
    },

    /// The kernel returned `EBUSY`; the caller should retry.
    #[error("device {dev:?} reported EBUSY")]
    Busy {
        /// Best-effort path of the device involved.
        dev: Option<PathBuf>,
    },

    /// The caller violated a precondition (e.g. a mode that does not belong to the connector).
    #[error("invalid request: {0}")]
    Invalid(&'static str),

    /// The resource is currently held by a [`crate::lease::Lease`].
    #[error("resource {id} is currently leased")]
    Leased {
        /// The kernel object id of the leased resource.
        id: u32,
    },

    /// A plain I/O error, e.g. while opening a DRM node.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if the render loop should transparently retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }
}

/// Classifies a raw ioctl return value as "transiently busy" vs. a hard failure.
///
/// `drmModeAtomicCommit`/`drmModeSetCrtc` and friends return `-EBUSY` when another atomic commit is
/// in flight; the atomic request builder (§4.E) retries on this specific errno and nothing else.
pub(crate) fn is_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(rustix::io::Errno::BUSY.raw_os_error())
}
