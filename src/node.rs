//! Classification of DRM device nodes (primary / control / render).

use std::{
    fmt::{self, Display, Formatter},
    fs, io,
    os::unix::io::AsFd,
    path::{Path, PathBuf},
};

use rustix::fs::{fstat, major, minor, stat, Dev as dev_t, Stat};

const PRIMARY_NAME: &str = "card";
const CONTROL_NAME: &str = "controlD";
const RENDER_NAME: &str = "renderD";

/// A node referring to one of the three character devices a DRM driver exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrmNode {
    dev: dev_t,
    ty: NodeType,
}

impl DrmNode {
    /// Creates a [`DrmNode`] from an already-open DRM device. Does not take ownership of `file`.
    pub fn from_file<A: AsFd>(file: A) -> Result<DrmNode, CreateDrmNodeError> {
        let stat = fstat(file).map_err(Into::<io::Error>::into)?;
        DrmNode::from_stat(stat)
    }

    /// Creates a [`DrmNode`] from a filesystem path.
    pub fn from_path<A: AsRef<Path>>(path: A) -> Result<DrmNode, CreateDrmNodeError> {
        let stat = stat(path.as_ref()).map_err(Into::<io::Error>::into)?;
        DrmNode::from_stat(stat)
    }

    fn from_stat(stat: Stat) -> Result<DrmNode, CreateDrmNodeError> {
        DrmNode::from_dev_id(stat.st_rdev)
    }

    /// Creates a [`DrmNode`] from a raw `dev_t`, classifying it by minor-number range.
    ///
    /// 0-63 -> Primary, 64-127 -> Control, 128-255 -> Render.
    pub fn from_dev_id(dev: dev_t) -> Result<DrmNode, CreateDrmNodeError> {
        if !is_device_drm(dev) {
            return Err(CreateDrmNodeError::NotDrmNode);
        }

        let ty = match minor(dev) >> 6 {
            0 => NodeType::Primary,
            1 => NodeType::Control,
            2 => NodeType::Render,
            _ => return Err(CreateDrmNodeError::NotDrmNode),
        };

        Ok(DrmNode { dev, ty })
    }

    /// The node's type.
    pub fn ty(&self) -> NodeType {
        self.ty
    }

    /// The underlying `dev_t`.
    pub fn dev_id(&self) -> dev_t {
        self.dev
    }

    /// Path to this node, if it still exists.
    pub fn dev_path(&self) -> Option<PathBuf> {
        node_path(self, self.ty).ok()
    }

    /// Path to a sibling node of the given type from the same physical device.
    pub fn dev_path_with_type(&self, ty: NodeType) -> Option<PathBuf> {
        node_path(self, ty).ok()
    }

    /// A sibling node of the given type, if present.
    pub fn node_with_type(&self, ty: NodeType) -> Option<Result<DrmNode, CreateDrmNodeError>> {
        self.dev_path_with_type(ty).map(DrmNode::from_path)
    }

    /// Major device number.
    pub fn major(&self) -> u32 {
        major(self.dev_id())
    }

    /// Minor device number.
    pub fn minor(&self) -> u32 {
        minor(self.dev_id())
    }

    /// Whether a render node sibling exists for this device.
    pub fn has_render(&self) -> bool {
        node_path(self, NodeType::Render).is_ok()
    }
}

impl Display for DrmNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty.minor_name_prefix(), minor(self.dev_id()))
    }
}

/// The role a DRM character device node plays.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum NodeType {
    /// Usable both for mode-setting and (on most drivers) buffer allocation.
    Primary,
    /// Usable for mode-setting only. Rarely exposed by modern drivers.
    Control,
    /// Usable for buffer allocation/rendering, never for mode-setting.
    Render,
}

impl NodeType {
    fn minor_name_prefix(&self) -> &'static str {
        match self {
            NodeType::Primary => PRIMARY_NAME,
            NodeType::Control => CONTROL_NAME,
            NodeType::Render => RENDER_NAME,
        }
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeType::Primary => "Primary",
            NodeType::Control => "Control",
            NodeType::Render => "Render",
        })
    }
}

/// Error constructing a [`DrmNode`].
#[derive(Debug, thiserror::Error)]
pub enum CreateDrmNodeError {
    /// The underlying stat/fstat call failed.
    #[error("{0}")]
    Io(io::Error),
    /// The device is not a DRM character device.
    #[error("the provided file descriptor does not refer to a DRM node")]
    NotDrmNode,
}

impl From<io::Error> for CreateDrmNodeError {
    fn from(err: io::Error) -> Self {
        CreateDrmNodeError::Io(err)
    }
}

fn is_device_drm(dev: dev_t) -> bool {
    let path = format!("/sys/dev/char/{}:{}/device/drm", major(dev), minor(dev));
    stat(path.as_str()).is_ok()
}

fn node_path(node: &DrmNode, ty: NodeType) -> io::Result<PathBuf> {
    dev_path(node.dev, ty)
}

fn dev_path(dev: dev_t, ty: NodeType) -> io::Result<PathBuf> {
    use io::ErrorKind;

    if !is_device_drm(dev) {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("{}:{} is no DRM device", major(dev), minor(dev)),
        ));
    }

    let read = fs::read_dir(format!("/sys/dev/char/{}:{}/device/drm", major(dev), minor(dev)))?;

    for entry in read.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        // Only one node of each type can exist per device, so the first match is sufficient.
        if name.starts_with(ty.minor_name_prefix()) {
            let path = ["/", "dev", "dri", &name].iter().collect::<PathBuf>();
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(io::Error::new(
        ErrorKind::NotFound,
        format!(
            "could not find a {} node sibling of DRM device {}:{}",
            ty,
            major(dev),
            minor(dev)
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_display_matches_prefix_family() {
        assert_eq!(NodeType::Primary.to_string(), "Primary");
        assert_eq!(NodeType::Control.to_string(), "Control");
        assert_eq!(NodeType::Render.to_string(), "Render");
    }

    #[test]
    fn from_dev_id_rejects_non_drm_major() {
        // Major 1 is never a DRM device on Linux.
        let fake = rustix::fs::makedev(1, 0);
        assert!(matches!(
            DrmNode::from_dev_id(fake),
            Err(CreateDrmNodeError::NotDrmNode)
        ));
    }
}
