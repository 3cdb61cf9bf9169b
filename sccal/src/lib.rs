//! An implementation of the calibration protocol spoken by SC pedal
//! controllers.
//!
//! The firmware exposes a single vendor-specific HID interface (vendor
//! `0x16C0`, product `0x0476`) exchanging fixed 64-byte reports. Every
//! request carries a session-scoped communications ID and a per-request
//! packet ID, which the firmware echoes back so replies can be matched to the
//! request that caused them. Replies that do not match are silently dropped.
//!
//! The crate is organized in layers:
//!
//! - [`transport`] moves raw reports across a HID channel you provide.
//! - [`packet`] encodes requests and decodes replies.
//! - [`device`] implements the request/reply exchange for a single open
//!   device, including the handshake assigning the communications ID.
//! - [`discovery`] finds and opens devices that are not open yet.
//! - [`context`] mirrors the state of one physical unit, identified by its
//!   serial number, and keeps it in sync with the firmware.
//! - [`manager`] ties all of the above into a non-blocking poll loop.
//!
//! # Quickstart
//!
//! This crate does not talk to the operating system's HID stack itself. The
//! traits bridging your HID implementation to this crate are
//! [`transport::RawHidChannel`] and [`discovery::HidBackend`]. Both define
//! async methods using [`mod@async_trait`], which is re-exported for
//! annotating your implementing types. An in-memory implementation of both
//! is provided by the [`sim`] module.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use sccal::{config::PollConfig, manager::HardwareManager, sim::SimulatedBackend};
//!
//! # async fn run() {
//! let backend = SimulatedBackend::new();
//! backend.add_device("sim-0", "SC-0001");
//!
//! let mut manager = HardwareManager::new(
//!     backend,
//!     PollConfig::default(),
//!     tokio::runtime::Handle::current(),
//! );
//!
//! // The poll loop never blocks. Call it once per rendered frame.
//! loop {
//!     manager.tick();
//!
//!     for context in manager.contexts() {
//!         let snapshot = context.snapshot();
//!         for (i, axis) in snapshot.axes.iter().enumerate() {
//!             println!("{} axis {i}: {:.1}%", context.serial(), axis.output_fraction * 100.0);
//!         }
//!     }
//!
//!     tokio::time::sleep(Duration::from_millis(16)).await;
//! }
//! # }
//! ```

pub use async_trait::async_trait;

pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod manager;
pub mod model;
pub mod packet;
pub mod sim;
pub mod transport;
