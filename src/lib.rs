#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![allow(clippy::upper_case_acronyms)]

//! # srm: a Simple Rendering Manager
//!
//! `srm` opens DRM/KMS nodes under `/dev/dri`, builds a typed object graph over their CRTCs,
//! encoders, planes and connectors, and drives scanout through one dedicated render thread per
//! initialized [`connector::Connector`]. It supports multi-GPU setups transparently: a device
//! without its own rendering engine renders on another device and imports the result (PRIME,
//! dumb-buffer copy, or CPU round-trip), chosen automatically per device.
//!
//! ## Structure of the crate
//!
//! [`registry`] opens every DRM node and builds the [`object`] graph (Device/Crtc/Encoder/Plane);
//! [`connector`] owns the per-output state machine, best-configuration search and render thread;
//! [`renderer`] is the strategy-dispatching buffer-sourcing engine the render thread drives each
//! frame through [`atomic`]'s request builder and [`swapchain`]'s age-tracked buffer ring.
//! [`lease`] hands resources to another process; [`hotplug`] applies externally-sourced
//! attach/detach/connection-change events to a running [`registry::Registry`].
//!
//! ## Opening a seat
//!
//! This crate never opens `/dev/dri/*` nodes itself with a bare `open(2)`: callers supply a
//! [`fd::RestrictedFdOps`] implementation so a seat manager (logind, libseat, a custom compositor
//! session) can hand out already-privileged descriptors without this crate needing to know how the
//! seat is managed.
//!
//! ## Logging
//!
//! This crate instruments itself through [`tracing`] but never installs a global subscriber; that
//! is the host application's job. See [`log`] for the `SRM_DEBUG`-driven verbosity floor.

pub mod atomic;
pub mod connector;
pub mod error;
pub mod fd;
pub mod hotplug;
pub mod lease;
pub mod log;
pub mod node;
pub mod object;
pub mod registry;
pub mod renderer;
pub mod strategy;
pub mod swapchain;
