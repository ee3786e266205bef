//! A minimal, crate-local DMA-BUF handle used by the Prime strategy to hand a rendered buffer from
//! the renderer Device to the scanout Device.
//!
//! Adapted from `backend/allocator/dmabuf.rs`'s plane layout, but fds are owned (closed on drop)
//! rather than raw, matching how the rest of this crate tracks fd lifetime (`atomic::AtomicRequest`,
//! `fd::DeviceFd`).

use std::os::unix::io::OwnedFd;

use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

const MAX_PLANES: usize = 4;

/// One exported GPU buffer, described plane-by-plane so it can be imported on another Device.
#[derive(Debug)]
pub struct Dmabuf {
    width: u32,
    height: u32,
    format: Fourcc,
    modifier: Modifier,
    num_planes: usize,
    fds: [Option<OwnedFd>; MAX_PLANES],
    strides: [u32; MAX_PLANES],
    offsets: [u32; MAX_PLANES],
}

impl Dmabuf {
    /// Builds a single-plane dmabuf, the common case for the scanout formats this crate deals with.
    pub(crate) fn single_plane(
        width: u32,
        height: u32,
        format: Fourcc,
        modifier: Modifier,
        fd: OwnedFd,
        stride: u32,
        offset: u32,
    ) -> Dmabuf {
        let mut fds: [Option<OwnedFd>; MAX_PLANES] = Default::default();
        let mut strides = [0u32; MAX_PLANES];
        let mut offsets = [0u32; MAX_PLANES];
        fds[0] = Some(fd);
        strides[0] = stride;
        offsets[0] = offset;
        Dmabuf {
            width,
            height,
            format,
            modifier,
            num_planes: 1,
            fds,
            strides,
            offsets,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn num_planes(&self) -> usize {
        self.num_planes
    }

    pub(crate) fn fd(&self, plane: usize) -> Option<std::os::unix::io::BorrowedFd<'_>> {
        use std::os::unix::io::AsFd;
        self.fds[plane].as_ref().map(|fd| fd.as_fd())
    }

    pub(crate) fn stride(&self, plane: usize) -> u32 {
        self.strides[plane]
    }

    pub(crate) fn offset(&self, plane: usize) -> u32 {
        self.offsets[plane]
    }
}
