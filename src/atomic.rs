//! Append-only atomic request builder with a TEST_ONLY-probe-then-commit retry loop.
//!
//! Grounded directly on `SRMAtomicRequest::commit`'s `goto retry` on `-EBUSY` and on the
//! `AtomicModeReq`/`AtomicCommitFlags` usage throughout the teacher's atomic modesetting surface.

use std::os::unix::io::OwnedFd;
use std::thread;
use std::time::Duration;

use drm::control::{atomic::AtomicModeReq, property, AtomicCommitFlags, Device as ControlDevice, ResourceHandle};

use crate::error::{is_busy, Error};
use crate::fd::{DeviceFd, DevPath};
use crate::object::PropertyBlob;

/// How long to sleep between EBUSY retries during an atomic commit.
pub const ATOMIC_RETRY_SLEEP: Duration = Duration::from_millis(2);

/// An append-only (object, property, value) builder plus the blobs and fds it must keep alive.
#[derive(Debug, Default)]
pub struct AtomicRequest {
    req: AtomicModeReq,
    blobs: Vec<PropertyBlob>,
    fds: Vec<OwnedFd>,
}

impl AtomicRequest {
    /// An empty request.
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    /// Appends one (object, property, value) triple.
    pub fn add_property<H: ResourceHandle>(&mut self, object: H, property: property::Handle, value: property::Value<'static>) {
        self.req.add_property(object, property, value);
    }

    /// Keeps a property blob alive for at least as long as this request and whatever it's attached
    /// to (e.g. the mode blob bound to `MODE_ID` must outlive the commit that references it).
    pub fn keep_alive_blob(&mut self, blob: PropertyBlob) {
        self.blobs.push(blob);
    }

    /// Keeps an fd (e.g. an in-fence) open until this request is dropped.
    pub fn keep_alive_fd(&mut self, fd: OwnedFd) {
        self.fds.push(fd);
    }

    /// Commits once, with no retry: the `forceRetry = false` path of `commit(flags, userData,
    /// forceRetry)` (spec §4.E).
    pub fn commit_once(&self, fd: &DeviceFd, flags: AtomicCommitFlags) -> Result<(), Error> {
        fd.atomic_commit(flags, self.req.clone())
            .map_err(|source| classify(fd, source))
    }

    /// `commit(flags, userData, forceRetry)` (spec §4.E). When `force_retry` is false this is just
    /// [`AtomicRequest::commit_once`]. When true, runs a `TEST_ONLY` probe first, retrying on
    /// `EBUSY` until it either clears or fails with a different error, then issues the real commit.
    ///
    /// The probe loop has no attempt bound (spec §5 "the atomic retry has no time bound but must be
    /// cancellable by uninitialization"): `cancelled` is polled between retries instead, so a
    /// connector being torn down can interrupt a stuck retry loop.
    pub fn commit_with_retry(
        &self,
        fd: &DeviceFd,
        flags: AtomicCommitFlags,
        force_retry: bool,
        cancelled: &std::sync::atomic::AtomicBool,
    ) -> Result<(), Error> {
        if !force_retry {
            return self.commit_once(fd, flags);
        }

        let probe_flags = flags | AtomicCommitFlags::TEST_ONLY;
        retry_until_not_busy(
            || fd.atomic_commit(probe_flags, self.req.clone()).map_err(|source| classify(fd, source)),
            cancelled,
        )?;

        self.commit_once(fd, flags)
    }
}

/// Repeats `attempt` until it succeeds, is cancelled, or fails with a non-retryable error.
fn retry_until_not_busy<F>(mut attempt: F, cancelled: &std::sync::atomic::AtomicBool) -> Result<(), Error>
where
    F: FnMut() -> Result<(), Error>,
{
    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(err) => {
                if !err.is_retryable() || cancelled.load(std::sync::atomic::Ordering::Acquire) {
                    return Err(err);
                }
                thread::sleep(ATOMIC_RETRY_SLEEP);
            }
        }
    }
}

fn classify(fd: &DeviceFd, source: std::io::Error) -> Error {
    if is_busy(&source) {
        Error::Busy { dev: fd.dev_path() }
    } else {
        Error::Kernel {
            errmsg: "atomic commit failed",
            dev: fd.dev_path(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn new_request_has_no_keep_alives() {
        let req = AtomicRequest::new();
        assert!(req.blobs.is_empty());
        assert!(req.fds.is_empty());
    }

    #[test]
    fn retry_until_not_busy_succeeds_after_transient_busy_errors() {
        // Testable property 10: a commit that would EBUSY 5 times and then succeed reports success.
        let attempts = AtomicU32::new(0);
        let cancelled = AtomicBool::new(false);
        let result = retry_until_not_busy(
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) < 5 {
                    Err(Error::Busy { dev: None })
                } else {
                    Ok(())
                }
            },
            &cancelled,
        );
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn retry_until_not_busy_stops_immediately_once_cancelled() {
        let cancelled = AtomicBool::new(true);
        let attempts = AtomicU32::new(0);
        let result = retry_until_not_busy(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::Busy { dev: None })
            },
            &cancelled,
        );
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
