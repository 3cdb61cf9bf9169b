//! Mirrors the state of a physical device and keeps it in sync.
//!
//! A [`DeviceContext`] is identified by the serial number of a device, not by
//! its handle. Handles come and go as a device is unplugged and plugged in
//! again, while its context, including everything the user staged for it,
//! stays around.
//!
//! ```text
//! Unbound ──attach──▶ BoundUnsynced ──update ok──▶ BoundSynced
//!    ▲                      │                          │
//!    └──── update failed ───┴──────────────────────────┘
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

use crate::{
    device::{DeviceError, DeviceHandle},
    model::{AxisEditState, AxisState, BezierModel, FirmwareVersion, MODEL_COUNT},
    transport::RawHidChannel,
};

/// The coarse state of a [`DeviceContext`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ContextState {
    /// No device is attached.
    Unbound,

    /// A device is attached but its state was not fully read yet.
    BoundUnsynced,

    /// A device is attached and its state was read at least once.
    BoundSynced,
}

/// The part of a context visible to its users.
///
/// The live values ([`Self::version`], [`Self::axes`]) are refreshed by every
/// [`DeviceContext::update`]. Staged values ([`Self::axes_edit`],
/// [`Self::models`]) are only seeded from the device during the first sync
/// after a device was attached and belong to the user afterwards.
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SharedState {
    pub version: Option<FirmwareVersion>,
    pub axes: Vec<AxisState>,
    pub axes_edit: Vec<AxisEditState>,
    pub models: [BezierModel; MODEL_COUNT],
    pub initial_communication_complete: bool,
}

struct Inner<T: RawHidChannel> {
    handle: Option<Arc<DeviceHandle<T>>>,
    last_communication: Option<Instant>,
    shared: SharedState,
}

/// Represents a physical device identified by its serial number.
pub struct DeviceContext<T: RawHidChannel> {
    name: String,
    serial: String,
    debounce: Duration,

    /// Never locked across an `.await`.
    inner: Mutex<Inner<T>>,
}

impl<T: RawHidChannel> DeviceContext<T> {
    /// Creates a context for the device behind a handle and attaches the
    /// handle.
    ///
    /// Calls to [`Self::update`] within `debounce` after the last one do
    /// nothing.
    pub fn new(handle: Arc<DeviceHandle<T>>, debounce: Duration) -> Self {
        let name = handle.identity().name.clone();
        let serial = handle.identity().serial.clone();

        Self {
            name,
            serial,
            debounce,
            inner: Mutex::new(Inner {
                handle: Some(handle),
                last_communication: None,
                shared: SharedState::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The currently attached handle, if any.
    pub fn handle(&self) -> Option<Arc<DeviceHandle<T>>> {
        self.lock().handle.clone()
    }

    pub fn state(&self) -> ContextState {
        let inner = self.lock();
        match (&inner.handle, inner.shared.initial_communication_complete) {
            (None, _) => ContextState::Unbound,
            (Some(_), false) => ContextState::BoundUnsynced,
            (Some(_), true) => ContextState::BoundSynced,
        }
    }

    /// Clones the shared state, e.g. for rendering.
    pub fn snapshot(&self) -> SharedState {
        self.lock().shared.clone()
    }

    /// Runs a closure with exclusive access to the shared state.
    ///
    /// This is how staged values are edited. The closure must not block.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        f(&mut self.lock().shared)
    }

    /// Attaches a handle to the context.
    ///
    /// If the handle differs from the attached one, the context has to be
    /// synced again and its staged values will be re-seeded from the device.
    ///
    /// Returns whether the handle was changed.
    pub fn attach(&self, handle: Arc<DeviceHandle<T>>) -> bool {
        let mut inner = self.lock();
        if inner
            .handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &handle))
        {
            return false;
        }

        inner.handle = Some(handle);
        inner.last_communication = None;
        inner.shared.initial_communication_complete = false;
        true
    }

    /// Detaches a handle from the context, if it is still attached.
    ///
    /// Returns whether the handle was detached.
    pub fn detach(&self, handle: &Arc<DeviceHandle<T>>) -> bool {
        let mut inner = self.lock();
        if !inner
            .handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            return false;
        }

        inner.handle = None;
        inner.shared.initial_communication_complete = false;
        true
    }

    /// Reads the current state of the device into the context.
    ///
    /// This does nothing if no handle is attached or the last update
    /// happened less than the debounce window ago. Otherwise the firmware
    /// version and all axes are read. During the first sync after a handle
    /// was attached, the staged axis values and all Bezier models are seeded
    /// from the device as well.
    ///
    /// If any request fails, the handle is detached and the error is
    /// returned.
    pub async fn update(&self) -> Result<(), DeviceError> {
        let (handle, synced) = {
            let inner = self.lock();
            let Some(handle) = inner.handle.clone() else {
                return Ok(());
            };

            if inner
                .last_communication
                .is_some_and(|last| last.elapsed() < self.debounce)
            {
                return Ok(());
            }

            (handle, inner.shared.initial_communication_complete)
        };

        let result = {
            let _stamp = CommunicationStamp(self);
            self.sync(&handle, synced).await
        };

        if let Err(err) = &result {
            if self.detach(&handle) {
                debug!(serial = %self.serial, %err, "detached device after failed update");
            }
        }

        result
    }

    async fn sync(&self, handle: &Arc<DeviceHandle<T>>, synced: bool) -> Result<(), DeviceError> {
        let version = handle.get_version().await?;
        self.lock().shared.version = Some(version);

        let count = handle.get_num_axes().await?;
        {
            let mut inner = self.lock();
            inner
                .shared
                .axes
                .resize(usize::from(count), AxisState::default());
            inner
                .shared
                .axes_edit
                .resize(usize::from(count), AxisEditState::default());
        }

        for axis in 0..count {
            let state = handle.get_axis_state(axis).await?;

            let mut inner = self.lock();
            let shared = &mut inner.shared;
            if !synced {
                if let Some(edit) = shared.axes_edit.get_mut(usize::from(axis)) {
                    *edit = AxisEditState::from(&state);
                }
            }
            if let Some(slot) = shared.axes.get_mut(usize::from(axis)) {
                *slot = state;
            }
        }

        if !synced {
            for model in 0..MODEL_COUNT as u8 {
                let label = handle.get_bezier_label(model).await?;
                let points = handle.get_bezier_model(model).await?;

                let mut inner = self.lock();
                if let Some(slot) = inner.shared.models.get_mut(usize::from(model)) {
                    if !label.is_empty() {
                        slot.label = Some(label);
                    }
                    slot.set_from_wire(&points);
                }
            }
        }

        let mut inner = self.lock();
        if inner
            .handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            inner.shared.initial_communication_complete = true;
        }

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records the time of the last communication when dropped, no matter how
/// the update ended.
struct CommunicationStamp<'a, T: RawHidChannel>(&'a DeviceContext<T>);

impl<T: RawHidChannel> Drop for CommunicationStamp<'_, T> {
    fn drop(&mut self) {
        self.0.lock().last_communication = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{CurvePoint, MODEL_POINTS, PercentPoint},
        sim::{SimulatedChannel, SimulatedDevice},
    };

    async fn bound(device: &SimulatedDevice) -> Arc<DeviceHandle<SimulatedChannel>> {
        let handle = DeviceHandle::new(device.identity(), device.open_channel());
        handle
            .get_new_communications_id()
            .await
            .expect("the handshake should succeed");
        Arc::new(handle)
    }

    fn context(handle: Arc<DeviceHandle<SimulatedChannel>>) -> DeviceContext<SimulatedChannel> {
        DeviceContext::new(handle, Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn first_sync_seeds_staged_values() -> Result<(), DeviceError> {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        device.preset_label(3, "Stiff");
        let ctx = context(bound(&device).await);
        assert_eq!(ctx.state(), ContextState::BoundUnsynced);

        ctx.update().await?;
        assert_eq!(ctx.state(), ContextState::BoundSynced);

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.version.map(|v| v.major), Some(1));
        assert_eq!(snapshot.axes.len(), 3);
        assert_eq!(snapshot.axes_edit.len(), 3);
        assert!(snapshot.axes.iter().all(|axis| axis.enabled));
        assert_eq!(snapshot.axes_edit[0], AxisEditState::default());
        assert_eq!(snapshot.models[3].label.as_deref(), Some("Stiff"));
        assert_eq!(snapshot.models[0].label, None);
        assert_eq!(snapshot.models[4], BezierModel::default());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn later_syncs_keep_staged_values() -> Result<(), DeviceError> {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        let handle = bound(&device).await;
        let ctx = context(Arc::clone(&handle));
        ctx.update().await?;

        ctx.with_state(|state| {
            state.axes_edit[1].range_min = 1234;
            state.models[0].points[2] = PercentPoint { x: 40, y: 10 };
        });

        handle.set_axis_range(1, 100, 50000, 5, 90).await?;
        device.nudge_input(1, 25050);

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.update().await?;

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.axes[1].range_min, 100);
        assert_eq!(snapshot.axes[1].input, 25050);
        assert!(snapshot.axes[1].output_fraction > 0.4);
        assert_eq!(snapshot.axes_edit[1].range_min, 1234);
        assert_eq!(snapshot.models[0].points[2], PercentPoint { x: 40, y: 10 });
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn updates_are_debounced() -> Result<(), DeviceError> {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        let ctx = context(bound(&device).await);

        ctx.update().await?;
        let after_first = device.last_packet_id();

        ctx.update().await?;
        assert_eq!(device.last_packet_id(), after_first);

        tokio::time::sleep(Duration::from_millis(11)).await;
        ctx.update().await?;
        assert_ne!(device.last_packet_id(), after_first);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_unbinds() {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        let ctx = context(bound(&device).await);
        ctx.update().await.expect("the first sync should succeed");

        device.set_fail_reads(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = ctx.update().await.expect_err("reads are failing");
        assert!(!err.to_string().is_empty());
        assert_eq!(ctx.state(), ContextState::Unbound);
        assert!(ctx.handle().is_none());
        assert!(!ctx.snapshot().initial_communication_complete);

        assert!(ctx.update().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_first_sync_stays_incomplete() {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        device.set_mute_models(true);
        let ctx = context(bound(&device).await);

        let result = ctx.update().await;
        assert!(matches!(result, Err(DeviceError::Timeout { .. })));
        assert_eq!(ctx.state(), ContextState::Unbound);
        assert!(ctx.handle().is_none());

        // Version and axes were read before the models timed out.
        let snapshot = ctx.snapshot();
        assert!(!snapshot.initial_communication_complete);
        assert_eq!(snapshot.version.map(|v| v.major), Some(1));
        assert_eq!(snapshot.axes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attaching_a_new_handle_resyncs() -> Result<(), DeviceError> {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        let first = bound(&device).await;
        let ctx = context(Arc::clone(&first));
        ctx.update().await?;

        assert!(!ctx.attach(Arc::clone(&first)));
        assert_eq!(ctx.state(), ContextState::BoundSynced);

        ctx.with_state(|state| state.axes_edit[0].limit = 42);

        let again = device.replugged_at("sim-1");
        let second = bound(&again).await;
        assert!(ctx.attach(second));
        assert_eq!(ctx.state(), ContextState::BoundUnsynced);

        ctx.update().await?;
        assert_eq!(ctx.state(), ContextState::BoundSynced);
        assert_eq!(ctx.snapshot().axes_edit[0].limit, 100);
        assert!(!ctx.detach(&first));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn models_are_converted_to_percent() -> Result<(), DeviceError> {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        let handle = bound(&device).await;

        let mut points = [CurvePoint::default(); MODEL_POINTS];
        points[5] = CurvePoint { x: 1.0, y: 0.756 };
        handle.set_bezier_model(1, &points).await?;

        let ctx = context(handle);
        ctx.update().await?;
        assert_eq!(ctx.snapshot().models[1].points[5], PercentPoint { x: 100, y: 76 });
        Ok(())
    }
}
