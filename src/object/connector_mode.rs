//! An immutable resolution/refresh-rate entry as reported by the kernel for one connector.

use drm::control::Mode;

/// One entry from a connector's mode list.
///
/// Wraps the raw [`Mode`] drm-rs returns from `DRM_IOCTL_MODE_GETCONNECTOR`; this type exists so
/// the rest of the crate works with a value that is explicitly immutable and explicitly scoped to a
/// single connector, rather than passing the kernel's raw mode struct around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorMode {
    mode: Mode,
}

impl ConnectorMode {
    pub(crate) fn new(mode: Mode) -> ConnectorMode {
        ConnectorMode { mode }
    }

    /// The underlying drm-rs mode, e.g. to pass to `create_property_blob`.
    pub fn raw(&self) -> Mode {
        self.mode
    }

    /// Width and height in pixels.
    pub fn size(&self) -> (u16, u16) {
        self.mode.size()
    }

    /// Vertical refresh rate in Hz.
    pub fn refresh_rate(&self) -> u32 {
        self.mode.vrefresh()
    }
}
