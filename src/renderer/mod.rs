//! Per-connector rendering/strategy engine (spec §4.D).
//!
//! One [`Engine`] lives inside each initialized connector's render thread. It owns the swap
//! chain(s) appropriate to the connector's assigned [`Strategy`], hands the render thread a
//! paintable [`Image`] each frame, and turns the painted result into a framebuffer ready to bind to
//! a plane. Actual pixel rendering stays outside this crate (spec Non-goals: no software
//! rasterization) — `Image` only exposes the capabilities a renderer needs to write into or import
//! from a buffer, never how to draw into it.

pub mod buffer;
pub mod dmabuf;

use std::os::unix::io::OwnedFd;
use std::time::Duration;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::{framebuffer, Device as ControlDevice};
use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};
use gbm::{BufferObjectFlags as GbmBufferFlags, Device as GbmDevice};

use self::buffer::{DumbBacked, GbmBacked};
use self::dmabuf::Dmabuf;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};
use crate::strategy::Strategy;
use crate::swapchain::Swapchain;

/// The capability surface a caller's rendering API is given to write a frame into, or read a
/// frame's result from. What "rendering" means is entirely up to the caller; this crate supplies
/// only buffer plumbing.
pub trait Image: Send {
    /// Width and height in pixels.
    fn size(&self) -> (u32, u32);
    /// Pixel format.
    fn format(&self) -> Fourcc;
    /// A dma-buf view of this image, for GPU-API import (Self/Prime strategies).
    fn dmabuf(&self) -> Option<Dmabuf>;
    /// The underlying GBM buffer object, for GPU-API import that prefers a local handle over an
    /// fd round-trip.
    fn gbm_buffer(&self) -> Option<&gbm::BufferObject<()>>;
    /// A directly writable CPU mapping (Dumb/CPU strategies).
    fn as_mut_slice(&mut self) -> Option<(&mut [u8], u32)>;
    /// Takes ownership of a sync fence fd the rendering API produced for this frame, if any. Its
    /// presence becomes the commit's `IN_FENCE_FD` (spec §4.D "fence discipline").
    fn take_render_fence(&mut self) -> Option<OwnedFd> {
        None
    }
}

/// Timing information synthesized from a page-flip event (spec §4.D step 6, §6).
#[derive(Debug, Clone, Copy)]
pub struct PresentationInfo {
    /// Monotonic timestamp the kernel reported for the flip, if the driver supports it.
    pub timestamp: Option<Duration>,
    /// The kernel's vblank sequence counter at the time of the flip.
    pub sequence: u32,
    /// The connector's refresh period, for callers that want to detect missed frames.
    pub refresh_period: Duration,
}

/// A buffer written to directly in main memory, backing the CPU strategy's render ring (spec §4.D
/// "CPU: ... reads pixels through the renderer API into main memory first").
struct CpuBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: Fourcc,
}

impl CpuBuffer {
    fn new(width: u32, height: u32, format: Fourcc) -> CpuBuffer {
        CpuBuffer {
            data: vec![0u8; stride_for(width) as usize * height as usize],
            width,
            height,
            format,
        }
    }

    fn stride(&self) -> u32 {
        stride_for(self.width)
    }
}

fn stride_for(width: u32) -> u32 {
    width * 4
}

impl Image for CpuBuffer {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> Fourcc {
        self.format
    }

    fn dmabuf(&self) -> Option<Dmabuf> {
        None
    }

    fn gbm_buffer(&self) -> Option<&gbm::BufferObject<()>> {
        None
    }

    fn as_mut_slice(&mut self) -> Option<(&mut [u8], u32)> {
        let stride = self.stride();
        Some((&mut self.data, stride))
    }
}

/// The per-strategy ring configuration (spec §4.D "Strategy specialization").
enum Rings {
    SelfRender {
        ring: Swapchain<GbmBacked>,
    },
    Prime {
        render: Swapchain<GbmBacked>,
        scanout: Swapchain<GbmBacked>,
        scanout_gbm: GbmDevice<DeviceFd>,
    },
    Dumb {
        render: Swapchain<GbmBacked>,
        scanout: Swapchain<DumbBacked>,
    },
    Cpu {
        render: Swapchain<CpuBuffer>,
        scanout: Swapchain<DumbBacked>,
    },
}

/// Owns the buffers behind one initialized connector and turns painted frames into a framebuffer
/// ready to bind to the primary plane.
pub struct Engine {
    rings: Rings,
    format: Fourcc,
    render_index: Option<usize>,
    scanout_index: Option<usize>,
    last_fb: Option<framebuffer::Handle>,
}

impl Engine {
    /// Allocates a fresh swap chain (or pair of swap chains) for `strategy` at `width`x`height`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn allocate(
        strategy: Strategy,
        render_fd: &DeviceFd,
        render_gbm: Option<&GbmDevice<DeviceFd>>,
        scanout_fd: &DeviceFd,
        scanout_gbm: Option<&GbmDevice<DeviceFd>>,
        width: u32,
        height: u32,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Engine, Error> {
        let rings = match strategy {
            Strategy::SelfRender => {
                let gbm = render_gbm.ok_or(Error::NotSupported {
                    what: "Self strategy requires a GBM device",
                    dev: render_fd.dev_path(),
                })?;
                let mut ring = Swapchain::new();
                while ring.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    ring.push(GbmBacked::allocate(gbm, width, height, format, modifiers)?);
                }
                Rings::SelfRender { ring }
            }
            Strategy::Prime => {
                let render_gbm = render_gbm.ok_or(Error::NotSupported {
                    what: "Prime strategy requires a renderer GBM device",
                    dev: render_fd.dev_path(),
                })?;
                let scanout_gbm = scanout_gbm.ok_or(Error::NotSupported {
                    what: "Prime strategy requires a scanout GBM device",
                    dev: scanout_fd.dev_path(),
                })?;
                let mut render = Swapchain::new();
                while render.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    render.push(GbmBacked::allocate(render_gbm, width, height, format, modifiers)?);
                }
                Rings::Prime {
                    render,
                    scanout: Swapchain::new(),
                    scanout_gbm: scanout_gbm.clone(),
                }
            }
            Strategy::Dumb => {
                let render_gbm = render_gbm.ok_or(Error::NotSupported {
                    what: "Dumb strategy requires a renderer GBM device",
                    dev: render_fd.dev_path(),
                })?;
                let mut render = Swapchain::new();
                while render.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    render.push(GbmBacked::allocate(render_gbm, width, height, format, modifiers)?);
                }
                let mut scanout = Swapchain::new();
                while scanout.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    scanout.push(DumbBacked::allocate(scanout_fd, width, height, format)?);
                }
                Rings::Dumb { render, scanout }
            }
            Strategy::Cpu => {
                let mut render = Swapchain::new();
                while render.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    render.push(CpuBuffer::new(width, height, format));
                }
                let mut scanout = Swapchain::new();
                while scanout.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    scanout.push(DumbBacked::allocate(scanout_fd, width, height, format)?);
                }
                Rings::Cpu { render, scanout }
            }
        };

        Ok(Engine {
            rings,
            format,
            render_index: None,
            scanout_index: None,
            last_fb: None,
        })
    }

    /// Tears down the current swap chain(s) and reinstantiates them at `width`x`height` (spec
    /// §4.C `setMode`: "tears down mode-dependent state (swap chain, framebuffers) ... reinstantiates
    /// the swap chain"). The previously displayed framebuffer is left bound to the CRTC until the
    /// next successful commit; `mark_presented` destroys it then, once it's actually off screen.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reallocate(
        &mut self,
        render_fd: &DeviceFd,
        render_gbm: Option<&GbmDevice<DeviceFd>>,
        scanout_fd: &DeviceFd,
        scanout_gbm: Option<&GbmDevice<DeviceFd>>,
        width: u32,
        height: u32,
        modifiers: &[Modifier],
    ) -> Result<(), Error> {
        let format = self.format;
        match &mut self.rings {
            Rings::SelfRender { ring } => {
                let gbm = render_gbm.ok_or(Error::NotSupported {
                    what: "Self strategy requires a GBM device",
                    dev: render_fd.dev_path(),
                })?;
                ring.clear();
                while ring.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    ring.push(GbmBacked::allocate(gbm, width, height, format, modifiers)?);
                }
            }
            Rings::Prime { render, scanout, scanout_gbm: ring_scanout_gbm } => {
                let render_gbm = render_gbm.ok_or(Error::NotSupported {
                    what: "Prime strategy requires a renderer GBM device",
                    dev: render_fd.dev_path(),
                })?;
                render.clear();
                while render.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    render.push(GbmBacked::allocate(render_gbm, width, height, format, modifiers)?);
                }
                if let Some(scanout_gbm) = scanout_gbm {
                    *ring_scanout_gbm = scanout_gbm.clone();
                }
                scanout.clear();
            }
            Rings::Dumb { render, scanout } => {
                let render_gbm = render_gbm.ok_or(Error::NotSupported {
                    what: "Dumb strategy requires a renderer GBM device",
                    dev: render_fd.dev_path(),
                })?;
                render.clear();
                while render.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    render.push(GbmBacked::allocate(render_gbm, width, height, format, modifiers)?);
                }
                scanout.clear();
                while scanout.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    scanout.push(DumbBacked::allocate(scanout_fd, width, height, format)?);
                }
            }
            Rings::Cpu { render, scanout } => {
                render.clear();
                while render.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    render.push(CpuBuffer::new(width, height, format));
                }
                scanout.clear();
                while scanout.len() < crate::swapchain::SRM_MAX_BUFFERING {
                    scanout.push(DumbBacked::allocate(scanout_fd, width, height, format)?);
                }
            }
        }

        self.render_index = None;
        self.scanout_index = None;
        Ok(())
    }

    /// Step 2: hands the render thread the next free render-ring image to paint into.
    pub(crate) fn paint(&mut self) -> Result<&mut dyn Image, Error> {
        let no_slot = || Error::Invalid("swap chain has no slots");
        let image: &mut dyn Image = match &mut self.rings {
            Rings::SelfRender { ring } => {
                let idx = ring.next_index().ok_or_else(no_slot)?;
                self.render_index = Some(idx);
                ring.get_mut(idx)
            }
            Rings::Prime { render, .. } | Rings::Dumb { render, .. } => {
                let idx = render.next_index().ok_or_else(no_slot)?;
                self.render_index = Some(idx);
                render.get_mut(idx)
            }
            Rings::Cpu { render, .. } => {
                let idx = render.next_index().ok_or_else(no_slot)?;
                self.render_index = Some(idx);
                render.get_mut(idx)
            }
        };
        Ok(image)
    }

    /// Step 3: for Prime/Dumb/CPU, moves the just-painted render image onto the scanout ring.
    /// For Self, the painted image already *is* the scanout image.
    pub(crate) fn prepare_scanout(&mut self) -> Result<(), Error> {
        let render_index = self.render_index.take().ok_or(Error::Invalid("paint was not called"))?;

        match &mut self.rings {
            Rings::SelfRender { .. } => {
                self.scanout_index = Some(render_index);
                Ok(())
            }
            Rings::Prime { render, scanout, scanout_gbm } => {
                let dmabuf = render
                    .get(render_index)
                    .export()
                    .map_err(|_| Error::Alloc {
                        dev: None,
                        source: std::io::Error::other("failed to export render buffer"),
                    })?;
                render.mark_presented(render_index);

                let imported = GbmBacked::import(scanout_gbm, &dmabuf, GbmBufferFlags::SCANOUT)?;
                if !scanout.push(imported) {
                    // Ring already full: reuse the oldest slot instead of growing past capacity.
                    let idx = scanout.next_index().ok_or(Error::Invalid("scanout ring empty"))?;
                    *scanout.get_mut(idx) = GbmBacked::import(scanout_gbm, &dmabuf, GbmBufferFlags::SCANOUT)?;
                    self.scanout_index = Some(idx);
                } else {
                    self.scanout_index = Some(scanout.len() - 1);
                }
                Ok(())
            }
            Rings::Dumb { render, scanout } => {
                let idx = scanout.next_index().ok_or(Error::Invalid("scanout ring empty"))?;
                copy_gbm_to_dumb(render.get_mut(render_index), scanout.get_mut(idx))?;
                render.mark_presented(render_index);
                self.scanout_index = Some(idx);
                Ok(())
            }
            Rings::Cpu { render, scanout } => {
                let idx = scanout.next_index().ok_or(Error::Invalid("scanout ring empty"))?;
                copy_cpu_to_dumb(render.get_mut(render_index), scanout.get_mut(idx))?;
                render.mark_presented(render_index);
                self.scanout_index = Some(idx);
                Ok(())
            }
        }
    }

    /// Step 4 (partial): creates a framebuffer for the current scanout image and returns it along
    /// with the scanout buffer's size, so the caller can bind `FB_ID`/`CRTC_W`/`CRTC_H`.
    pub(crate) fn framebuffer(&mut self, fd: &DeviceFd) -> Result<(framebuffer::Handle, u32, u32), Error> {
        let idx = self.scanout_index.ok_or(Error::Invalid("prepare_scanout was not called"))?;
        let (depth, bpp) = depth_bpp_for(self.format);

        let (handle, size) = match &self.rings {
            Rings::SelfRender { ring } => {
                let buf = ring.get(idx);
                (fd.add_framebuffer(buf.handle(), depth, bpp), buf.size())
            }
            Rings::Prime { scanout, .. } => {
                let buf = scanout.get(idx);
                (fd.add_framebuffer(buf.handle(), depth, bpp), buf.size())
            }
            Rings::Dumb { scanout, .. } | Rings::Cpu { scanout, .. } => {
                let buf = scanout.get(idx);
                (fd.add_framebuffer(buf.handle(), depth, bpp), buf.size())
            }
        };

        let handle = handle.map_err(|source| Error::Kernel {
            errmsg: "failed to create framebuffer",
            dev: fd.dev_path(),
            source,
        })?;
        Ok((handle, size.0, size.1))
    }

    /// Step 6: the scanout image at the current index has just been shown. Resets its age,
    /// increments every other scanout slot's age, and destroys the previous frame's now-unused
    /// framebuffer.
    pub(crate) fn mark_presented(&mut self, fd: &DeviceFd, new_fb: framebuffer::Handle) {
        if let Some(idx) = self.scanout_index {
            match &mut self.rings {
                Rings::SelfRender { ring } => ring.mark_presented(idx),
                Rings::Prime { scanout, .. } => scanout.mark_presented(idx),
                Rings::Dumb { scanout, .. } | Rings::Cpu { scanout, .. } => scanout.mark_presented(idx),
            }
        }
        if let Some(old_fb) = self.last_fb.replace(new_fb) {
            if let Err(err) = fd.destroy_framebuffer(old_fb) {
                tracing::warn!(%err, "failed to destroy stale framebuffer");
            }
        }
    }
}

/// Copies a GBM render buffer into a dumb scanout buffer (Dumb strategy). The GBM side has no
/// portable CPU-mapping entry point of its own, so the copy goes through the same dma-buf export
/// used for the Prime handoff and an `mmap` of the resulting fd, rather than guessing at a GBM
/// mapping API this crate has no other use for.
fn copy_gbm_to_dumb(src: &mut GbmBacked, dst: &mut DumbBacked) -> Result<(), Error> {
    let dmabuf = src.export()?;
    let src_stride = dmabuf.stride(0) as usize;
    let src_offset = dmabuf.offset(0) as usize;
    let (_, height) = src.size();
    let map_len = src_offset + src_stride * height as usize;

    let src_fd = dmabuf.fd(0).ok_or(Error::Invalid("dmabuf has no plane 0"))?;
    // SAFETY: `src_fd` is a valid dma-buf fd for `map_len` bytes; the mapping is read-only and
    // dropped before this function returns.
    let src_map = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            map_len,
            rustix::mm::ProtFlags::READ,
            rustix::mm::MapFlags::SHARED,
            src_fd,
            0,
        )
        .map_err(|source| Error::Alloc { dev: None, source: std::io::Error::from(source) })?
    };
    let src_buf = unsafe { std::slice::from_raw_parts(src_map.cast::<u8>().add(src_offset), map_len - src_offset) };

    let dst_stride = dst.pitch() as usize;
    let mut dst_mapping = dst.map()?;
    let row_bytes = src_stride.min(dst_stride);
    for row in 0..height as usize {
        let src_row = &src_buf[row * src_stride..row * src_stride + row_bytes];
        let dst_row = &mut dst_mapping.as_mut()[row * dst_stride..row * dst_stride + row_bytes];
        dst_row.copy_from_slice(src_row);
    }
    drop(dst_mapping);

    // SAFETY: `src_map`/`map_len` are exactly the region just mapped above.
    unsafe {
        let _ = rustix::mm::munmap(src_map, map_len);
    }
    Ok(())
}

fn copy_cpu_to_dumb(src: &mut CpuBuffer, dst: &mut DumbBacked) -> Result<(), Error> {
    let src_stride = src.stride() as usize;
    let dst_stride = dst.pitch() as usize;
    let height = src.height as usize;
    let row_bytes = src_stride.min(dst_stride);
    let mut dst_mapping = dst.map()?;
    for row in 0..height {
        let src_row = &src.data[row * src_stride..row * src_stride + row_bytes];
        let dst_row = &mut dst_mapping.as_mut()[row * dst_stride..row * dst_stride + row_bytes];
        dst_row.copy_from_slice(src_row);
    }
    Ok(())
}

fn depth_bpp_for(format: Fourcc) -> (u32, u32) {
    match format {
        Fourcc::Xrgb8888 | Fourcc::Xbgr8888 => (24, 32),
        _ => (32, 32),
    }
}
