//! Plane: a hardware compositor layer that reads a framebuffer and composites into a CRTC.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use drm::control::{crtc, plane, property, Device as ControlDevice, ResourceHandles};
use drm_fourcc::{DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier};

use super::property_ids;
use crate::connector::Connector;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};

const PROP_NAMES: &[&str] = &[
    "FB_ID",
    "FB_DAMAGE_CLIPS",
    "IN_FENCE_FD",
    "CRTC_ID",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "rotation",
    "type",
];

/// Property ids a [`Plane`] needs for atomic commits, cached once at discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanePropertyIds {
    /// Framebuffer bound to the plane.
    pub fb_id: Option<property::Handle>,
    /// Per-frame damage clip list, if the driver tracks it.
    pub fb_damage_clips: Option<property::Handle>,
    /// In-fence fd the compositor attaches to delay scanout until the GPU finished rendering.
    pub in_fence_fd: Option<property::Handle>,
    /// CRTC this plane is bound to.
    pub crtc_id: Option<property::Handle>,
    /// Destination rectangle on the CRTC.
    pub crtc_x: Option<property::Handle>,
    pub crtc_y: Option<property::Handle>,
    pub crtc_w: Option<property::Handle>,
    pub crtc_h: Option<property::Handle>,
    /// Source rectangle within the framebuffer, in 16.16 fixed point.
    pub src_x: Option<property::Handle>,
    pub src_y: Option<property::Handle>,
    pub src_w: Option<property::Handle>,
    pub src_h: Option<property::Handle>,
    /// Plane rotation/reflection, absent on most overlay planes.
    pub rotation: Option<property::Handle>,
    /// The plane's own `type` property (Overlay/Primary/Cursor), read once at discovery.
    pub r#type: Option<property::Handle>,
}

/// The role a plane plays in scanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    /// Composites below the primary plane.
    Overlay,
    /// Carries the main scanout image.
    Primary,
    /// Carries the mouse cursor image.
    Cursor,
    /// Reported by the kernel with a value this crate doesn't recognize.
    ///
    /// The original SRM clamps an out-of-range type into its `{Overlay, Primary, Cursor, Unknown}`
    /// lookup table rather than rejecting it; this variant is the same fallback, made explicit
    /// instead of relying on an index that happens to land on a fourth array slot.
    Unknown,
}

impl PlaneType {
    fn from_raw(raw: u64) -> PlaneType {
        match raw {
            0 => PlaneType::Overlay,
            1 => PlaneType::Primary,
            2 => PlaneType::Cursor,
            _ => PlaneType::Unknown,
        }
    }
}

/// A plane and the (format, modifier) pairs it can scan out.
#[derive(Debug)]
pub struct Plane {
    handle: plane::Handle,
    ty: PlaneType,
    formats: HashSet<Format>,
    props: PlanePropertyIds,
    possible_crtcs: Vec<crtc::Handle>,
    current_connector: Mutex<Weak<Connector>>,
    leased: AtomicBool,
}

impl Plane {
    /// Reads a plane's type, property ids, possible-CRTC list and supported (format, modifier) set.
    pub(crate) fn from_kernel(
        fd: &DeviceFd,
        handle: plane::Handle,
        res_handles: &ResourceHandles,
    ) -> Result<Plane, Error> {
        let ids = property_ids(fd, handle, PROP_NAMES)?;
        let props = PlanePropertyIds {
            fb_id: ids[0],
            fb_damage_clips: ids[1],
            in_fence_fd: ids[2],
            crtc_id: ids[3],
            crtc_x: ids[4],
            crtc_y: ids[5],
            crtc_w: ids[6],
            crtc_h: ids[7],
            src_x: ids[8],
            src_y: ids[9],
            src_w: ids[10],
            src_h: ids[11],
            rotation: ids[12],
            r#type: ids[13],
        };

        let ty = match props.r#type {
            Some(id) => PlaneType::from_raw(super::property_value(fd, handle, id)?),
            None => PlaneType::Unknown,
        };

        let info = fd.get_plane(handle).map_err(|source| Error::Kernel {
            errmsg: "failed to query plane info",
            dev: fd.dev_path(),
            source,
        })?;
        let possible_crtcs = res_handles.filter_crtcs(info.possible_crtcs());

        let mut formats = supported_formats(fd, handle, &info, ty)?;
        if formats.is_empty() {
            formats.insert(Format {
                code: Fourcc::Argb8888,
                modifier: Modifier::Invalid,
            });
        }

        Ok(Plane {
            handle,
            ty,
            formats,
            props,
            possible_crtcs,
            current_connector: Mutex::new(Weak::new()),
            leased: AtomicBool::new(false),
        })
    }

    /// The kernel object id.
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// Overlay, Primary or Cursor.
    pub fn plane_type(&self) -> PlaneType {
        self.ty
    }

    /// Supported (format, modifier) pairs.
    pub fn formats(&self) -> &HashSet<Format> {
        &self.formats
    }

    /// Cached property ids.
    pub fn property_ids(&self) -> PlanePropertyIds {
        self.props
    }

    /// CRTCs this plane can be bound to, in discovery order.
    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    /// The connector currently using this plane, if any and still alive.
    pub fn current_connector(&self) -> Option<Arc<Connector>> {
        self.current_connector.lock().unwrap().upgrade()
    }

    pub(crate) fn set_current_connector(&self, connector: Weak<Connector>) {
        *self.current_connector.lock().unwrap() = connector;
    }

    /// Whether a lease currently holds this plane; an immovable veto for configuration search.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Release);
    }
}

/// Builds the supported format set: from the `IN_FORMATS` blob when the driver negotiated
/// `AddFb2Modifiers`, otherwise one entry per legacy format with an implicit (`Invalid`) modifier.
fn supported_formats(
    fd: &DeviceFd,
    handle: plane::Handle,
    info: &plane::Info,
    _ty: PlaneType,
) -> Result<HashSet<Format>, Error> {
    if let Ok(1) = fd.get_driver_capability(drm::DriverCapability::AddFB2Modifiers) {
        if let Some(blob_formats) = in_formats_blob(fd, handle)? {
            return Ok(blob_formats);
        }
    }

    Ok(info
        .formats()
        .iter()
        .flat_map(|raw| Fourcc::try_from(*raw).ok())
        .map(|code| Format {
            code,
            modifier: Modifier::Invalid,
        })
        .collect())
}

/// Decodes the `IN_FORMATS` blob into (format, modifier) pairs, if the plane exposes one.
///
/// The blob layout is `drm_format_modifier_blob`: a formats array followed by a modifier array,
/// where each modifier entry carries a bitmask of which format-array indices it applies to. There is
/// no alignment guarantee inside the blob, so every field is read with `read_unaligned`.
fn in_formats_blob(fd: &DeviceFd, handle: plane::Handle) -> Result<Option<HashSet<Format>>, Error> {
    let set = fd.get_properties(handle).map_err(|source| Error::Kernel {
        errmsg: "failed to query plane properties",
        dev: fd.dev_path(),
        source,
    })?;
    let (ids, values) = set.as_props_and_values();

    let Some((prop, raw_value)) = ids
        .iter()
        .zip(values.iter())
        .find(|(id, _)| {
            fd.get_property(**id)
                .map(|info| info.name().to_str() == Ok("IN_FORMATS"))
                .unwrap_or(false)
        })
        .map(|(id, value)| (*id, *value))
    else {
        return Ok(None);
    };

    let prop_info = fd.get_property(prop).map_err(|source| Error::Kernel {
        errmsg: "failed to query IN_FORMATS property",
        dev: fd.dev_path(),
        source,
    })?;
    let property::Value::Blob(blob_id) = prop_info.value_type().convert_value(raw_value) else {
        return Ok(None);
    };

    let data = fd.get_property_blob(blob_id).map_err(|source| Error::Kernel {
        errmsg: "failed to query IN_FORMATS blob",
        dev: fd.dev_path(),
        source,
    })?;

    let mut formats = HashSet::new();
    // SAFETY: `data` is a kernel-provided `drm_format_modifier_blob` of at least its own declared
    // size; every field access below stays within offsets the kernel itself reports.
    unsafe {
        let blob_ptr = data.as_ptr() as *const drm_ffi::drm_format_modifier_blob;
        let blob = &*blob_ptr;

        let formats_ptr = blob_ptr.cast::<u8>().offset(blob.formats_offset as isize) as *const u32;
        let modifiers_ptr =
            blob_ptr.cast::<u8>().offset(blob.modifiers_offset as isize) as *const drm_ffi::drm_format_modifier;

        for i in 0..blob.count_modifiers {
            let entry = modifiers_ptr.offset(i as isize).read_unaligned();
            for bit in 0..64 {
                if entry.formats & (1u64 << bit) == 0 {
                    continue;
                }
                let code = formats_ptr.offset((bit + entry.offset) as isize).read_unaligned();
                if let Ok(code) = Fourcc::try_from(code) {
                    formats.insert(Format {
                        code,
                        modifier: Modifier::from(entry.modifier),
                    });
                }
            }
        }
    }
    Ok(Some(formats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plane_type_is_explicit_not_clamped() {
        assert_eq!(PlaneType::from_raw(0), PlaneType::Overlay);
        assert_eq!(PlaneType::from_raw(1), PlaneType::Primary);
        assert_eq!(PlaneType::from_raw(2), PlaneType::Cursor);
        assert_eq!(PlaneType::from_raw(3), PlaneType::Unknown);
        assert_eq!(PlaneType::from_raw(u64::MAX), PlaneType::Unknown);
    }
}
