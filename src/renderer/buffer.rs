//! Concrete buffer types backing [`super::Image`] across the four rendering strategies.
//!
//! GBM allocation is adapted from `backend/allocator/gbm.rs`'s `GbmAllocator`, simplified to this
//! crate's single target triple (no `AddFb2Modifiers2`/legacy cfg branching, since that tracked
//! build-time feature flags this crate doesn't carry). Dumb-buffer mapping follows the borrowed,
//! short-lived wrapper shape of `backend/drm/compositor/render_target/dumb.rs`'s
//! `DumbBufferRenderTarget`: the mapping borrows the buffer for exactly one paint, never stored
//! alongside it.

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{dumbbuffer, Device as ControlDevice};
use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use gbm::{BufferObject as GbmBuffer, BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};

use super::dmabuf::Dmabuf;
use super::Image;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};

fn alloc_err(source: impl std::fmt::Display) -> Error {
    Error::Alloc {
        dev: None,
        source: std::io::Error::other(source.to_string()),
    }
}

/// A GBM-backed buffer: the render-ring buffer for Self/Prime/Dumb, and the scanout-ring buffer for
/// Self/Prime.
pub struct GbmBacked {
    buffer: GbmBuffer<()>,
    format: Fourcc,
}

impl GbmBacked {
    pub(crate) fn allocate(
        gbm: &GbmDevice<DeviceFd>,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<GbmBacked, Error> {
        let flags = GbmBufferFlags::SCANOUT | GbmBufferFlags::RENDERING;
        let buffer: GbmBuffer<()> = if modifiers.iter().all(|m| *m == Modifier::Invalid || *m == Modifier::Linear) {
            gbm.create_buffer_object(width, height, format, flags)
        } else {
            gbm.create_buffer_object_with_modifiers(width, height, format, modifiers.iter().copied())
        }
        .map_err(alloc_err)?;
        Ok(GbmBacked { buffer, format })
    }

    /// Wraps an already-imported buffer (Prime strategy: the scanout Device's half of the handoff).
    pub(crate) fn from_imported(buffer: GbmBuffer<()>, format: Fourcc) -> GbmBacked {
        GbmBacked { buffer, format }
    }

    pub(crate) fn handle(&self) -> &GbmBuffer<()> {
        &self.buffer
    }

    pub(crate) fn modifier(&self) -> Modifier {
        self.buffer.modifier().unwrap_or(Modifier::Invalid)
    }

    /// Exports this buffer as a dma-buf, for the Prime strategy's renderer-to-scanout handoff.
    pub(crate) fn export(&self) -> Result<Dmabuf, Error> {
        let fd = self.buffer.fd().map_err(alloc_err)?;
        let stride = self.buffer.stride_for_plane(0).map_err(alloc_err)?;
        let offset = self.buffer.offset(0).map_err(alloc_err)?;
        Ok(Dmabuf::single_plane(
            self.buffer.width().unwrap_or(0),
            self.buffer.height().unwrap_or(0),
            self.format,
            self.modifier(),
            fd,
            stride,
            offset,
        ))
    }

    /// Imports `dmabuf` into `gbm`, producing the scanout-side half of a Prime handoff.
    pub(crate) fn import(gbm: &GbmDevice<DeviceFd>, dmabuf: &Dmabuf, usage: GbmBufferFlags) -> Result<GbmBacked, Error> {
        let fd = dmabuf.fd(0).ok_or(Error::Invalid("dmabuf has no plane 0"))?;
        let buffer: GbmBuffer<()> = gbm
            .import_buffer_object_from_dma_buf(
                fd,
                dmabuf.width(),
                dmabuf.height(),
                dmabuf.stride(0),
                dmabuf.format(),
                if dmabuf.modifier() == Modifier::Linear {
                    usage | GbmBufferFlags::LINEAR
                } else {
                    usage
                },
            )
            .map_err(alloc_err)?;
        Ok(GbmBacked::from_imported(buffer, dmabuf.format()))
    }
}

impl Image for GbmBacked {
    fn size(&self) -> (u32, u32) {
        (self.buffer.width().unwrap_or(0), self.buffer.height().unwrap_or(0))
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn dmabuf(&self) -> Option<Dmabuf> {
        self.export().ok()
    }

    fn gbm_buffer(&self) -> Option<&GbmBuffer<()>> {
        Some(&self.buffer)
    }

    fn as_mut_slice(&mut self) -> Option<(&mut [u8], u32)> {
        None
    }
}

/// An owned dumb buffer: always linear, always CPU-mappable, the final scanout target for the
/// Dumb and CPU strategies.
pub struct DumbBacked {
    fd: DeviceFd,
    handle: dumbbuffer::DumbBuffer,
    format: Fourcc,
}

impl DumbBacked {
    pub(crate) fn allocate(fd: &DeviceFd, width: u32, height: u32, format: Fourcc) -> Result<DumbBacked, Error> {
        let handle = fd
            .create_dumb_buffer((width, height), format, 32)
            .map_err(|source| Error::Alloc { dev: fd.dev_path(), source })?;
        Ok(DumbBacked {
            fd: fd.clone(),
            handle,
            format,
        })
    }

    pub(crate) fn handle(&self) -> &dumbbuffer::DumbBuffer {
        &self.handle
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        self.handle.size()
    }

    pub(crate) fn pitch(&self) -> u32 {
        self.handle.pitch()
    }

    /// Maps this buffer for exactly the duration of one write; the mapping borrows `self` and must
    /// not outlive the paint/copy it serves.
    pub(crate) fn map(&mut self) -> Result<dumbbuffer::DumbMapping<'_>, Error> {
        let dev_path = self.fd.dev_path();
        self.fd
            .map_dumb_buffer(&mut self.handle)
            .map_err(|source| Error::Alloc { dev: dev_path, source })
    }
}

impl Drop for DumbBacked {
    fn drop(&mut self) {
        if let Err(err) = self.fd.destroy_dumb_buffer(self.handle) {
            tracing::warn!(%err, "failed to destroy dumb buffer");
        }
    }
}

/// The short-lived [`Image`] view over a [`DumbBacked`] buffer, mapped for one paint. Used directly
/// by the Dumb and CPU strategies' render ring (CPU never touches GBM at all).
pub struct DumbImage<'b> {
    mapping: dumbbuffer::DumbMapping<'b>,
    format: Fourcc,
    size: (u32, u32),
    stride: u32,
}

impl<'b> DumbImage<'b> {
    pub(crate) fn from_buffer(buffer: &'b mut DumbBacked) -> Result<DumbImage<'b>, Error> {
        let size = buffer.size();
        let stride = buffer.pitch();
        let format = buffer.format;
        let mapping = buffer.map()?;
        Ok(DumbImage {
            mapping,
            format,
            size,
            stride,
        })
    }
}

impl Image for DumbImage<'_> {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn dmabuf(&self) -> Option<Dmabuf> {
        None
    }

    fn gbm_buffer(&self) -> Option<&GbmBuffer<()>> {
        None
    }

    fn as_mut_slice(&mut self) -> Option<(&mut [u8], u32)> {
        Some((self.mapping.as_mut(), self.stride))
    }
}
