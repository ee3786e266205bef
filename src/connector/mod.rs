//! The Connector state machine, its render thread, and the user-facing callback trait (spec §4.C,
//! §4.D, §5).

pub mod search;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use drm::control::{connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice, ModeTypeFlags};
use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

use self::search::Candidate;
use crate::atomic::AtomicRequest;
use crate::error::Error;
use crate::fd::{DeviceFd, DevPath};
use crate::object::{ConnectorMode, Crtc, Device, Encoder, Plane, PropertyBlob};
use crate::renderer::buffer::DumbBacked;
use crate::renderer::{Engine, Image, PresentationInfo};
use crate::strategy::Strategy;

/// Raw kernel `drm_color_lut` layout: one entry per LUT index, read directly off `GammaLut`.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawColorLut {
    red: u16,
    green: u16,
    blue: u16,
    reserved: u16,
}

const PROP_NAMES: &[&str] = &["CRTC_ID"];

/// A cursor image the caller wants displayed: raw ARGB8888 pixels plus its size.
#[derive(Debug, Clone)]
pub struct CursorImage {
    /// Tightly packed ARGB8888 rows, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
    /// Width and height in pixels.
    pub size: (u32, u32),
}

/// A 256-entry-per-channel gamma lookup table, uploaded as a `GAMMA_LUT` blob.
#[derive(Debug, Clone)]
pub struct GammaLut {
    /// Red, green, blue channel entries, each sized to the CRTC's reported gamma size.
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

/// The callbacks a caller implements to drive one Connector, invoked exclusively on that
/// connector's dedicated render thread (spec §6, §9).
///
/// Replaces the original C interface's function-pointer-struct-plus-`void*` design with captured
/// state: an implementor simply closes over whatever it needs instead of threading a user-data
/// pointer through every call. `Send` is required because the value crosses from the thread that
/// calls [`Connector::initialize`] onto the render thread, which then owns it exclusively.
pub trait ConnectorCallbacks: Send {
    /// The render thread has come up and the first frame is about to be requested.
    fn initialized(&mut self) {}

    /// Paint one frame into `image`. Called with exactly one `presented`/`discarded` per call, in
    /// submission order (spec §5 ordering guarantee).
    fn paint(&mut self, image: &mut dyn Image);

    /// The previous `paint`'s frame was shown at vblank.
    fn presented(&mut self, info: PresentationInfo) {
        let _ = info;
    }

    /// The previous `paint`'s frame was dropped (busy retry exhausted or a non-EBUSY commit
    /// failure); the prior frame stayed on screen.
    fn discarded(&mut self, paint_id: u64) {
        let _ = paint_id;
    }

    /// `setMode` completed and the swap chain was reallocated at the new size.
    fn resized(&mut self, width: u32, height: u32) {
        let _ = (width, height);
    }

    /// The render thread is about to exit. Called iff `initialized` was previously invoked.
    fn uninitialized(&mut self) {}
}

/// Lifecycle states (spec §4.C state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Uninitialized,
    Initializing,
    Initialized,
    ChangingMode,
    Uninitializing,
}

bitflags! {
    /// Which categories of pending per-frame property change are waiting to be flushed into the
    /// next atomic commit (spec §4.D "atomic changes bitset").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PendingChangeFlags: u32 {
        const CURSOR_BUFFER = 1 << 0;
        const CURSOR_VISIBLE = 1 << 1;
        const CURSOR_POS = 1 << 2;
        const GAMMA = 1 << 3;
    }
}

/// Pending per-frame property changes accumulated by the public setters and flushed into the next
/// atomic commit. `flags` tracks which fields below actually carry a fresh value to apply.
#[derive(Debug, Default)]
struct PendingChanges {
    flags: PendingChangeFlags,
    cursor_buffer: Option<CursorImage>,
    cursor_visible: Option<bool>,
    cursor_pos: Option<(i32, i32)>,
    gamma: Option<GammaLut>,
}

/// A mode change queued by `set_mode`, picked up by the render thread on its next wake.
struct PendingModeChange {
    mode: ConnectorMode,
    reply: std::sync::mpsc::Sender<ModeChangeOutcome>,
}

/// Result of a render-thread-driven mode change, reported back to the `set_mode` caller.
enum ModeChangeOutcome {
    /// The new mode committed successfully.
    Applied,
    /// The new mode failed, but reverting to the previous mode succeeded.
    Reverted(Error),
    /// Both the new mode and the revert attempt failed; the connector is tearing itself down.
    Fatal(Error),
}

struct RenderThreadShared {
    repaint_requested: AtomicBool,
    uninitializing: AtomicBool,
    cancelled: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
    pending: Mutex<PendingChanges>,
    pending_mode: Mutex<Option<PendingModeChange>>,
}

/// One display output: state machine, pipeline selection and the owning render thread.
pub struct Connector {
    handle: connector::Handle,
    device: Weak<Device>,
    physical_size: (u32, u32),
    connected: AtomicBool,
    encoders: Vec<Arc<Encoder>>,
    modes: Vec<ConnectorMode>,
    preferred_mode: usize,
    crtc_id_prop: Option<property::Handle>,

    state: Mutex<ConnectorState>,
    current_mode: Mutex<Option<ConnectorMode>>,
    current_encoder: Mutex<Option<Arc<Encoder>>>,
    current_crtc: Mutex<Option<Arc<Crtc>>>,
    current_primary_plane: Mutex<Option<Arc<Plane>>>,
    current_cursor_plane: Mutex<Option<Arc<Plane>>>,
    cursor_buffer: Mutex<Option<DumbBacked>>,
    cursor_fb: Mutex<Option<drm::control::framebuffer::Handle>>,
    leased: AtomicBool,

    render_thread: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<RenderThreadShared>,
    last_paint_id: AtomicU32,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("handle", &self.handle)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

impl Connector {
    /// Reads a connector's modes, physical size and connection state off the kernel.
    ///
    /// `device`'s Crtc/Encoder/Plane lists must already be populated; `encoders` is resolved
    /// against `device.encoders()` immediately, matching how `Plane`/`Encoder` resolve their own
    /// "possible crtcs" bitmasks against the device's Crtc list.
    pub(crate) fn from_kernel(handle: connector::Handle, device: &Arc<Device>) -> Result<Arc<Connector>, Error> {
        let fd = device.fd();
        let info = fd.get_connector(handle, false).map_err(|source| Error::Kernel {
            errmsg: "failed to query connector info",
            dev: fd.dev_path(),
            source,
        })?;

        let ids = crate::object::property_ids(fd, handle, PROP_NAMES)?;

        let encoders: Vec<Arc<Encoder>> = info
            .encoders()
            .iter()
            .filter_map(|h| device.encoders().iter().find(|e| e.handle() == *h).cloned())
            .collect();

        let modes: Vec<ConnectorMode> = info.modes().iter().map(|m| ConnectorMode::new(*m)).collect();
        let preferred_mode = modes
            .iter()
            .position(|m| m.raw().mode_type().contains(ModeTypeFlags::PREFERRED))
            .unwrap_or(0);

        let connected = info.state() == connector::State::Connected;

        Ok(Arc::new(Connector {
            handle,
            device: Arc::downgrade(device),
            physical_size: (info.size().0 as u32, info.size().1 as u32),
            connected: AtomicBool::new(connected),
            encoders,
            modes,
            preferred_mode,
            crtc_id_prop: ids[0],
            state: Mutex::new(ConnectorState::Uninitialized),
            current_mode: Mutex::new(None),
            current_encoder: Mutex::new(None),
            current_crtc: Mutex::new(None),
            current_primary_plane: Mutex::new(None),
            current_cursor_plane: Mutex::new(None),
            cursor_buffer: Mutex::new(None),
            cursor_fb: Mutex::new(None),
            leased: AtomicBool::new(false),
            render_thread: Mutex::new(None),
            shared: Arc::new(RenderThreadShared {
                repaint_requested: AtomicBool::new(false),
                uninitializing: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                wake: Condvar::new(),
                wake_lock: Mutex::new(()),
                pending: Mutex::new(PendingChanges::default()),
                pending_mode: Mutex::new(None),
            }),
            last_paint_id: AtomicU32::new(0),
        }))
    }

    /// The kernel object id.
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// The Device this connector belongs to, if it's still alive.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// Physical size in millimeters, as reported by EDID (`(0, 0)` if unknown).
    pub fn physical_size(&self) -> (u32, u32) {
        self.physical_size
    }

    /// Whether the kernel currently reports this output as connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Whether a lease currently holds this connector; an immovable veto for `initialize`/search.
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Release);
    }

    /// Encoders this connector can be driven through, in discovery order.
    pub(crate) fn encoders(&self) -> &[Arc<Encoder>] {
        &self.encoders
    }

    /// Every mode the kernel reported for this connector.
    pub fn list_modes(&self) -> &[ConnectorMode] {
        &self.modes
    }

    /// The mode the kernel marked preferred, if any was marked (else the first mode).
    pub fn preferred_mode(&self) -> Option<ConnectorMode> {
        self.modes.get(self.preferred_mode).copied()
    }

    /// The mode currently driving this output, if initialized.
    pub fn current_mode(&self) -> Option<ConnectorMode> {
        *self.current_mode.lock().unwrap()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectorState {
        *self.state.lock().unwrap()
    }

    /// The CRTC currently bound to this connector, if initialized.
    pub fn current_crtc(&self) -> Option<Arc<Crtc>> {
        self.current_crtc.lock().unwrap().clone()
    }

    /// The primary plane currently bound to this connector, if initialized.
    pub fn current_primary_plane(&self) -> Option<Arc<Plane>> {
        self.current_primary_plane.lock().unwrap().clone()
    }

    /// Requests a repaint. Coalesces: any number of calls before the render thread next wakes
    /// produce at most one extra paint. Safe from any thread.
    pub fn repaint(&self) {
        self.shared.repaint_requested.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }

    /// Enqueues a new cursor image, applied on the next commit.
    pub fn set_cursor(&self, image: Option<CursorImage>) {
        let mut pending = self.shared.pending.lock().unwrap();
        pending.flags.insert(PendingChangeFlags::CURSOR_VISIBLE);
        pending.cursor_visible = Some(image.is_some());
        if image.is_some() {
            pending.flags.insert(PendingChangeFlags::CURSOR_BUFFER);
            pending.cursor_buffer = image;
        }
        drop(pending);
        self.repaint();
    }

    /// Enqueues a new cursor position, applied on the next commit.
    pub fn set_cursor_pos(&self, x: i32, y: i32) {
        let mut pending = self.shared.pending.lock().unwrap();
        pending.flags.insert(PendingChangeFlags::CURSOR_POS);
        pending.cursor_pos = Some((x, y));
        drop(pending);
        self.repaint();
    }

    /// Enqueues a new gamma LUT, applied on the next commit.
    pub fn set_gamma(&self, lut: GammaLut) {
        let mut pending = self.shared.pending.lock().unwrap();
        pending.flags.insert(PendingChangeFlags::GAMMA);
        pending.gamma = Some(lut);
        drop(pending);
        self.repaint();
    }

    /// If uninitialized, records `mode` for the next `initialize`. If initialized, hands `mode` to
    /// the render thread, which tears down the swap chain, reallocates it at the new size, and
    /// commits the mode via a real atomic/legacy modeset (spec §4.C `setMode`). On success invokes
    /// `resized`; on failure the render thread attempts to revert to the previous mode, and only
    /// invokes `uninitialized` (transitioning back to `Uninitialized`) if that revert also fails.
    pub fn set_mode(self: &Arc<Self>, mode: ConnectorMode, callbacks: &mut dyn ConnectorCallbacks) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match *state {
            ConnectorState::Uninitialized => {
                *self.current_mode.lock().unwrap() = Some(mode);
                Ok(())
            }
            ConnectorState::Initialized => {
                *state = ConnectorState::ChangingMode;
                drop(state);

                let (reply_tx, reply_rx) = std::sync::mpsc::channel();
                *self.shared.pending_mode.lock().unwrap() = Some(PendingModeChange { mode, reply: reply_tx });
                self.shared.wake.notify_all();

                match reply_rx.recv() {
                    Ok(ModeChangeOutcome::Applied) => {
                        let (w, h) = mode.size();
                        callbacks.resized(w as u32, h as u32);
                        Ok(())
                    }
                    Ok(ModeChangeOutcome::Reverted(err)) => Err(err),
                    Ok(ModeChangeOutcome::Fatal(err)) => {
                        if let Some(handle) = self.render_thread.lock().unwrap().take() {
                            let _ = handle.join();
                        }
                        *self.state.lock().unwrap() = ConnectorState::Uninitialized;
                        callbacks.uninitialized();
                        Err(err)
                    }
                    Err(_) => {
                        *self.state.lock().unwrap() = ConnectorState::Uninitialized;
                        Err(Error::Invalid("render thread exited during mode change"))
                    }
                }
            }
            _ => Err(Error::Invalid("setMode called while initializing or uninitializing")),
        }
    }

    /// Render-thread side of a mode change: reallocates the swap chain and commits the new mode,
    /// reverting to `pending`'s previous mode on failure. Runs on the render thread, called from
    /// `run_frame_loop` once it notices `shared.pending_mode`.
    fn handle_mode_change(
        &self,
        device: &Arc<Device>,
        candidate: &Candidate,
        engine: &mut Engine,
        callbacks: &mut dyn ConnectorCallbacks,
        pending: PendingModeChange,
    ) {
        let previous = self
            .current_mode
            .lock()
            .unwrap()
            .expect("an initialized connector always has a current mode");

        match self.apply_mode_change(device, candidate, engine, callbacks, pending.mode, true) {
            Ok(()) => {
                *self.current_mode.lock().unwrap() = Some(pending.mode);
                *self.state.lock().unwrap() = ConnectorState::Initialized;
                let _ = pending.reply.send(ModeChangeOutcome::Applied);
            }
            Err(err) => {
                tracing::warn!(%err, "mode change failed, attempting to revert to previous mode");
                match self.apply_mode_change(device, candidate, engine, callbacks, previous, false) {
                    Ok(()) => {
                        *self.current_mode.lock().unwrap() = Some(previous);
                        *self.state.lock().unwrap() = ConnectorState::Initialized;
                        let _ = pending.reply.send(ModeChangeOutcome::Reverted(err));
                    }
                    Err(_revert_err) => {
                        self.shared.uninitializing.store(true, Ordering::Release);
                        let _ = pending.reply.send(ModeChangeOutcome::Fatal(err));
                    }
                }
            }
        }
    }

    /// Tears down and reallocates the swap chain at `mode`'s size, then commits `mode` as a real
    /// modeset (reusing the same MODE_ID/ACTIVE/FB_ID/CRTC_ID path the first frame commits through).
    fn apply_mode_change(
        &self,
        device: &Arc<Device>,
        candidate: &Candidate,
        engine: &mut Engine,
        callbacks: &mut dyn ConnectorCallbacks,
        mode: ConnectorMode,
        force_retry: bool,
    ) -> Result<(), Error> {
        let renderer_device = device.renderer_device().ok_or(Error::NotSupported {
            what: "no renderer device assigned",
            dev: device.fd().dev_path(),
        })?;
        let strategy = device.strategy();
        let render_gbm = renderer_device.gbm().ok();
        let scanout_gbm = if strategy == Strategy::Prime { device.gbm().ok() } else { None };
        let modifiers: Vec<Modifier> = candidate
            .primary_plane
            .formats()
            .iter()
            .filter(|f| f.code == candidate.primary_format)
            .map(|f| f.modifier)
            .collect();
        let (width, height) = mode.size();

        engine.reallocate(
            renderer_device.fd(),
            render_gbm,
            device.fd(),
            scanout_gbm,
            width as u32,
            height as u32,
            &modifiers,
        )?;

        let mut last_fb = None;
        self.commit_first_frame(device, candidate, mode, engine, callbacks, &mut last_fb, force_retry)
    }

    /// Spawns the render thread. Blocks until it signals success or failure.
    pub fn initialize(self: &Arc<Self>, mut callbacks: Box<dyn ConnectorCallbacks>) -> Result<(), Error> {
        {
            if self.is_leased() {
                return Err(Error::Leased { id: u32::from(self.handle) });
            }
            let mut state = self.state.lock().unwrap();
            if *state != ConnectorState::Uninitialized {
                return Err(Error::Invalid("connector is not uninitialized"));
            }
            *state = ConnectorState::Initializing;
        }
        self.shared.uninitializing.store(false, Ordering::Release);
        self.shared.cancelled.store(false, Ordering::Release);
        self.shared.repaint_requested.store(false, Ordering::Release);

        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("srm-connector-{}", u32::from(self.handle)))
            .spawn(move || this.render_thread_main(callbacks.as_mut(), result_tx))
            .map_err(Error::Io)?;

        match result_rx.recv() {
            Ok(Ok(())) => {
                *self.state.lock().unwrap() = ConnectorState::Initialized;
                *self.render_thread.lock().unwrap() = Some(handle);
                Ok(())
            }
            Ok(Err(err)) => {
                *self.state.lock().unwrap() = ConnectorState::Uninitialized;
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                *self.state.lock().unwrap() = ConnectorState::Uninitialized;
                let _ = handle.join();
                Err(Error::Invalid("render thread exited before reporting init status"))
            }
        }
    }

    /// Transitions to Uninitializing and joins the render thread. Idempotent.
    pub fn uninitialize(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectorState::Uninitialized {
                return;
            }
            *state = ConnectorState::Uninitializing;
        }
        self.shared.uninitializing.store(true, Ordering::Release);
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.wake.notify_all();

        if let Some(handle) = self.render_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.state.lock().unwrap() = ConnectorState::Uninitialized;
    }

    /// Render-thread entry point: picks a configuration, allocates the engine, signals init
    /// status, then runs the per-frame loop (spec §4.D) until uninitialize is requested.
    fn render_thread_main(
        self: Arc<Self>,
        callbacks: &mut dyn ConnectorCallbacks,
        result_tx: std::sync::mpsc::Sender<Result<(), Error>>,
    ) {
        let self_arc = self.clone();
        let setup = self.setup_pipeline(&self_arc);
        let (device, candidate, mode, engine) = match setup {
            Ok(v) => v,
            Err(err) => {
                let _ = result_tx.send(Err(err));
                return;
            }
        };

        self.bind_pipeline(&self_arc, &candidate);
        *self.current_mode.lock().unwrap() = Some(mode);

        let mut engine = engine;
        let mut last_fb_for_mark = None;
        if let Err(err) = self.commit_first_frame(&device, &candidate, mode, &mut engine, callbacks, &mut last_fb_for_mark, true) {
            self.unbind_pipeline();
            let _ = result_tx.send(Err(err));
            return;
        }

        let _ = result_tx.send(Ok(()));
        callbacks.initialized();

        self.run_frame_loop(&device, &candidate, &mut engine, callbacks);

        self.unbind_pipeline();
        callbacks.uninitialized();
    }

    fn setup_pipeline(&self, self_arc: &Arc<Connector>) -> Result<(Arc<Device>, Candidate, ConnectorMode, Engine), Error> {
        let device = self.device().ok_or(Error::Invalid("device is gone"))?;
        let renderer_device = device.renderer_device().ok_or(Error::NotSupported {
            what: "no renderer device assigned",
            dev: device.fd().dev_path(),
        })?;

        let renderer_formats = [Fourcc::Xrgb8888, Fourcc::Argb8888];
        let candidate = search::find_best(self_arc, &renderer_formats).ok_or(Error::NoResources {
            connector: u32::from(self.handle),
        })?;

        let mode = *self.current_mode.lock().unwrap().as_ref().or(self.preferred_mode().as_ref()).ok_or(Error::Invalid("no mode selected"))?;
        let (width, height) = mode.size();

        let modifiers: Vec<Modifier> = candidate
            .primary_plane
            .formats()
            .iter()
            .filter(|f| f.code == candidate.primary_format)
            .map(|f| f.modifier)
            .collect();

        let strategy = device.strategy();
        let render_gbm = renderer_device.gbm().ok();
        let scanout_gbm = if strategy == Strategy::Prime { device.gbm().ok() } else { None };

        let engine = Engine::allocate(
            strategy,
            renderer_device.fd(),
            render_gbm,
            device.fd(),
            scanout_gbm,
            width as u32,
            height as u32,
            candidate.primary_format,
            &modifiers,
        )?;

        Ok((device, candidate, mode, engine))
    }

    fn bind_pipeline(&self, self_arc: &Arc<Connector>, candidate: &Candidate) {
        let weak = Arc::downgrade(self_arc);
        candidate.encoder.set_current_connector(weak.clone());
        candidate.crtc.set_current_connector(weak.clone());
        candidate.primary_plane.set_current_connector(weak.clone());
        if let Some(cursor) = &candidate.cursor_plane {
            cursor.set_current_connector(weak);
        }

        *self.current_encoder.lock().unwrap() = Some(candidate.encoder.clone());
        *self.current_crtc.lock().unwrap() = Some(candidate.crtc.clone());
        *self.current_primary_plane.lock().unwrap() = Some(candidate.primary_plane.clone());
        *self.current_cursor_plane.lock().unwrap() = candidate.cursor_plane.clone();
    }

    fn unbind_pipeline(&self) {
        if let Some(encoder) = self.current_encoder.lock().unwrap().take() {
            encoder.set_current_connector(Weak::new());
        }
        if let Some(crtc) = self.current_crtc.lock().unwrap().take() {
            crtc.set_current_connector(Weak::new());
        }
        if let Some(plane) = self.current_primary_plane.lock().unwrap().take() {
            plane.set_current_connector(Weak::new());
        }
        if let Some(plane) = self.current_cursor_plane.lock().unwrap().take() {
            plane.set_current_connector(Weak::new());
        }
    }

    fn commit_first_frame(
        &self,
        device: &Arc<Device>,
        candidate: &Candidate,
        mode: ConnectorMode,
        engine: &mut Engine,
        callbacks: &mut dyn ConnectorCallbacks,
        last_fb: &mut Option<drm::control::framebuffer::Handle>,
        force_retry: bool,
    ) -> Result<(), Error> {
        let fd = device.fd();
        callbacks.paint(engine.paint()?);
        engine.prepare_scanout()?;
        let (fb, width, height) = engine.framebuffer(fd)?;

        let req = self.build_atomic_request(fd, candidate, Some((mode, fb, width, height)))?;
        req.commit_with_retry(
            fd,
            AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::PAGE_FLIP_EVENT,
            force_retry,
            &self.shared.cancelled,
        )?;

        engine.mark_presented(fd, fb);
        *last_fb = Some(fb);
        self.wait_for_page_flip(fd, candidate.crtc.handle(), mode);
        Ok(())
    }

    fn run_frame_loop(&self, device: &Arc<Device>, candidate: &Candidate, engine: &mut Engine, callbacks: &mut dyn ConnectorCallbacks) {
        let fd = device.fd();
        loop {
            self.wait_for_work();
            if self.shared.uninitializing.load(Ordering::Acquire) {
                return;
            }

            if let Some(pending) = self.shared.pending_mode.lock().unwrap().take() {
                self.handle_mode_change(device, candidate, engine, callbacks, pending);
                if self.shared.uninitializing.load(Ordering::Acquire) {
                    return;
                }
                continue;
            }

            self.shared.repaint_requested.store(false, Ordering::Release);

            let paint_id = self.last_paint_id.fetch_add(1, Ordering::AcqRel);
            callbacks.paint(match engine.paint() {
                Ok(image) => image,
                Err(err) => {
                    tracing::warn!(%err, "failed to acquire paint image");
                    callbacks.discarded(paint_id as u64);
                    continue;
                }
            });

            if let Err(err) = engine.prepare_scanout() {
                tracing::warn!(%err, "failed to prepare scanout buffer");
                callbacks.discarded(paint_id as u64);
                continue;
            }

            let fb = match engine.framebuffer(fd) {
                Ok((fb, _, _)) => fb,
                Err(err) => {
                    tracing::warn!(%err, "failed to create framebuffer");
                    callbacks.discarded(paint_id as u64);
                    continue;
                }
            };

            let req = match self.build_atomic_request(fd, candidate, None) {
                Ok(req) => req,
                Err(err) => {
                    tracing::warn!(%err, "failed to build atomic request");
                    callbacks.discarded(paint_id as u64);
                    continue;
                }
            };

            match req.commit_with_retry(fd, AtomicCommitFlags::PAGE_FLIP_EVENT, true, &self.shared.cancelled) {
                Ok(()) => {
                    engine.mark_presented(fd, fb);
                    let mode = self.current_mode.lock().unwrap().expect("initialized connector has a mode");
                    let info = self.wait_for_page_flip(fd, candidate.crtc.handle(), mode);
                    callbacks.presented(info);
                }
                Err(err) => {
                    tracing::warn!(%err, "commit failed");
                    callbacks.discarded(paint_id as u64);
                }
            }
        }
    }

    fn build_atomic_request(
        &self,
        fd: &DeviceFd,
        candidate: &Candidate,
        modeset: Option<(ConnectorMode, drm::control::framebuffer::Handle, u32, u32)>,
    ) -> Result<AtomicRequest, Error> {
        let mut req = AtomicRequest::new();
        let crtc_props = candidate.crtc.property_ids();
        let plane_props = candidate.primary_plane.property_ids();

        if let Some(crtc_id_prop) = self.crtc_id_prop {
            req.add_property(self.handle, crtc_id_prop, property::Value::CRTC(Some(candidate.crtc.handle())));
        }

        if let Some((mode, fb, width, height)) = modeset {
            let blob = PropertyBlob::create(fd, &mode.raw())?;
            if let Some(mode_id) = crtc_props.mode_id {
                req.add_property(candidate.crtc.handle(), mode_id, blob.value());
            }
            req.keep_alive_blob(blob);
            if let Some(active) = crtc_props.active {
                req.add_property(candidate.crtc.handle(), active, property::Value::Boolean(true));
            }
            if let Some(fb_id) = plane_props.fb_id {
                req.add_property(candidate.primary_plane.handle(), fb_id, property::Value::Framebuffer(Some(fb)));
            }
            if let Some(crtc_id) = plane_props.crtc_id {
                req.add_property(candidate.primary_plane.handle(), crtc_id, property::Value::CRTC(Some(candidate.crtc.handle())));
            }
            self.add_plane_geometry(&mut req, &plane_props, candidate.primary_plane.handle(), width, height);
        }

        self.flush_pending(fd, &mut req, candidate, &crtc_props)?;
        Ok(req)
    }

    fn add_plane_geometry(&self, req: &mut AtomicRequest, props: &crate::object::plane::PlanePropertyIds, plane: plane::Handle, width: u32, height: u32) {
        if let Some(p) = props.src_x {
            req.add_property(plane, p, property::Value::UnsignedRange(0));
        }
        if let Some(p) = props.src_y {
            req.add_property(plane, p, property::Value::UnsignedRange(0));
        }
        if let Some(p) = props.src_w {
            req.add_property(plane, p, property::Value::UnsignedRange((width as u64) << 16));
        }
        if let Some(p) = props.src_h {
            req.add_property(plane, p, property::Value::UnsignedRange((height as u64) << 16));
        }
        if let Some(p) = props.crtc_x {
            req.add_property(plane, p, property::Value::SignedRange(0));
        }
        if let Some(p) = props.crtc_y {
            req.add_property(plane, p, property::Value::SignedRange(0));
        }
        if let Some(p) = props.crtc_w {
            req.add_property(plane, p, property::Value::UnsignedRange(width as u64));
        }
        if let Some(p) = props.crtc_h {
            req.add_property(plane, p, property::Value::UnsignedRange(height as u64));
        }
    }

    fn flush_pending(
        &self,
        fd: &DeviceFd,
        req: &mut AtomicRequest,
        candidate: &Candidate,
        crtc_props: &crate::object::crtc::CrtcPropertyIds,
    ) -> Result<(), Error> {
        let mut pending = self.shared.pending.lock().unwrap();

        if pending.flags.contains(PendingChangeFlags::GAMMA) {
            if let Some(gamma) = pending.gamma.take() {
                if let Some(gamma_lut) = crtc_props.gamma_lut {
                    let mut entries = gamma_entries(&gamma);
                    let blob = PropertyBlob::create_from_slice(fd, &mut entries)?;
                    req.add_property(candidate.crtc.handle(), gamma_lut, blob.value());
                    req.keep_alive_blob(blob);
                }
            }
            pending.flags.remove(PendingChangeFlags::GAMMA);
        }

        if pending.flags.contains(PendingChangeFlags::CURSOR_BUFFER) {
            if let (Some(image), Some(plane)) = (pending.cursor_buffer.take(), &candidate.cursor_plane) {
                let fb = self.upload_cursor(fd, &image)?;
                let props = plane.property_ids();
                if let Some(fb_id) = props.fb_id {
                    req.add_property(plane.handle(), fb_id, property::Value::Framebuffer(Some(fb)));
                }
                if let Some(crtc_id) = props.crtc_id {
                    req.add_property(plane.handle(), crtc_id, property::Value::CRTC(Some(candidate.crtc.handle())));
                }
                self.add_plane_geometry(req, &props, plane.handle(), image.size.0, image.size.1);
            }
            pending.flags.remove(PendingChangeFlags::CURSOR_BUFFER);
        }

        if pending.flags.contains(PendingChangeFlags::CURSOR_VISIBLE) {
            if let Some(visible) = pending.cursor_visible.take() {
                if !visible {
                    if let Some(plane) = &candidate.cursor_plane {
                        let props = plane.property_ids();
                        if let Some(fb_id) = props.fb_id {
                            req.add_property(plane.handle(), fb_id, property::Value::Framebuffer(None));
                        }
                    }
                }
            }
            pending.flags.remove(PendingChangeFlags::CURSOR_VISIBLE);
        }

        if pending.flags.contains(PendingChangeFlags::CURSOR_POS) {
            if let (Some((x, y)), Some(plane)) = (pending.cursor_pos.take(), &candidate.cursor_plane) {
                let props = plane.property_ids();
                if let Some(p) = props.crtc_x {
                    req.add_property(plane.handle(), p, property::Value::SignedRange(x as i64));
                }
                if let Some(p) = props.crtc_y {
                    req.add_property(plane.handle(), p, property::Value::SignedRange(y as i64));
                }
            }
            pending.flags.remove(PendingChangeFlags::CURSOR_POS);
        }

        Ok(())
    }

    /// Writes `image`'s pixels into this connector's single cursor buffer (reallocated only when
    /// its size changed) and returns a framebuffer bound to the result. The previous cursor
    /// framebuffer, if any, is destroyed once the new one is created.
    fn upload_cursor(&self, fd: &DeviceFd, image: &CursorImage) -> Result<drm::control::framebuffer::Handle, Error> {
        let mut cursor_buffer = self.cursor_buffer.lock().unwrap();
        let needs_alloc = match &*cursor_buffer {
            Some(buf) => buf.size() != image.size,
            None => true,
        };
        if needs_alloc {
            *cursor_buffer = Some(DumbBacked::allocate(fd, image.size.0, image.size.1, Fourcc::Argb8888)?);
        }
        let buffer = cursor_buffer.as_mut().expect("just allocated above");

        let stride = buffer.pitch() as usize;
        let row_bytes = (image.size.0 as usize * 4).min(stride);
        let mut mapping = buffer.map()?;
        let dst = mapping.as_mut();
        for row in 0..image.size.1 as usize {
            let src_row = &image.pixels[row * image.size.0 as usize * 4..][..row_bytes];
            dst[row * stride..][..row_bytes].copy_from_slice(src_row);
        }
        drop(mapping);

        let new_fb = fd
            .add_framebuffer(buffer.handle(), 32, 32)
            .map_err(|source| Error::Kernel {
                errmsg: "failed to create cursor framebuffer",
                dev: fd.dev_path(),
                source,
            })?;

        let mut cursor_fb = self.cursor_fb.lock().unwrap();
        if let Some(old) = cursor_fb.replace(new_fb) {
            let _ = fd.destroy_framebuffer(old);
        }
        Ok(new_fb)
    }

    fn wait_for_work(&self) {
        let guard = self.shared.wake_lock.lock().unwrap();
        let _unused = self
            .shared
            .wake
            .wait_timeout_while(guard, Duration::from_millis(500), |_| {
                !self.shared.repaint_requested.load(Ordering::Acquire)
                    && !self.shared.uninitializing.load(Ordering::Acquire)
                    && self.shared.pending_mode.lock().unwrap().is_none()
            })
            .unwrap();
    }

    /// Blocks on the device fd for the page-flip event matching `crtc`, with a bounded iteration
    /// cap so a lost event can't wedge the render thread forever (spec §5 timeout semantics).
    fn wait_for_page_flip(&self, fd: &DeviceFd, crtc: crtc::Handle, mode: ConnectorMode) -> PresentationInfo {
        const MAX_ITERATIONS: u32 = 64;
        let refresh_period = refresh_period_for(mode);

        for _ in 0..MAX_ITERATIONS {
            let mut fds = [rustix::event::PollFd::new(fd, rustix::event::PollFlags::IN)];
            match rustix::event::poll(&mut fds, 1000) {
                Ok(0) | Err(_) => continue,
                Ok(_) => {}
            }

            let Ok(events) = fd.receive_events() else {
                continue;
            };
            for event in events {
                if let drm::control::Event::PageFlip(pfe) = event {
                    if pfe.crtc == crtc {
                        return PresentationInfo {
                            timestamp: Some(pfe.duration),
                            sequence: pfe.frame,
                            refresh_period,
                        };
                    }
                }
            }
        }

        PresentationInfo { timestamp: None, sequence: 0, refresh_period }
    }
}

fn refresh_period_for(mode: ConnectorMode) -> Duration {
    let hz = mode.refresh_rate().max(1);
    Duration::from_nanos(1_000_000_000 / hz as u64)
}

/// Packs a [`GammaLut`] into the flat `drm_color_lut` array the kernel expects, truncating to the
/// shortest of the three channels (mismatched channel lengths are a caller error this crate has no
/// better recovery for than ignoring the tail).
fn gamma_entries(lut: &GammaLut) -> Vec<RawColorLut> {
    let len = lut.red.len().min(lut.green.len()).min(lut.blue.len());
    (0..len)
        .map(|i| RawColorLut {
            red: lut.red[i],
            green: lut.green[i],
            blue: lut.blue[i],
            reserved: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::refresh_period_for;

    #[test]
    fn refresh_period_matches_60hz_within_tolerance() {
        // `ConnectorMode` can't be built outside its owning connector without a kernel mode blob,
        // so this exercises the arithmetic directly at the rate S1 in the design notes expects.
        let nanos = 1_000_000_000u64 / 60;
        assert!((nanos as i64 - 16_666_666i64).abs() < 1000);
    }
}
