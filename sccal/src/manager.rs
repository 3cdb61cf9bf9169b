//! Ties discovery and device contexts into a non-blocking poll loop.
//!
//! A [`HardwareManager`] is meant to be driven from a UI loop by calling
//! [`HardwareManager::tick`] once per frame. All I/O happens on background
//! tasks. A tick only spawns new tasks and collects finished ones, so it
//! never waits on a device.

use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::PollConfig,
    context::DeviceContext,
    device::{DeviceError, DeviceHandle},
    discovery::{self, DiscoveryError, HidBackend},
    model::BezierModel,
};

type Handles<B> = Vec<Arc<DeviceHandle<<B as HidBackend>::Channel>>>;

/// A context together with its in-flight update, if any.
struct TrackedContext<B: HidBackend> {
    context: Arc<DeviceContext<B::Channel>>,

    /// The handle the update was started with and the update itself.
    update: Option<(
        Arc<DeviceHandle<B::Channel>>,
        JoinHandle<Result<(), DeviceError>>,
    )>,
}

/// Owns all open devices and their contexts.
pub struct HardwareManager<B: HidBackend> {
    backend: Arc<B>,
    config: PollConfig,
    runtime: Handle,

    /// All open handles, including ones not attached to a context yet.
    devices: Handles<B>,

    contexts: Vec<TrackedContext<B>>,

    scan: Option<JoinHandle<Result<Handles<B>, DiscoveryError>>>,

    /// When the last scan completed.
    last_scan: Option<Instant>,
}

impl<B: HidBackend> HardwareManager<B> {
    /// Creates a manager spawning its tasks onto `runtime`.
    ///
    /// Nothing happens until the first call to [`Self::tick`].
    pub fn new(backend: B, config: PollConfig, runtime: Handle) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
            runtime,
            devices: Vec::new(),
            contexts: Vec::new(),
            scan: None,
            last_scan: None,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// All open handles.
    pub fn devices(&self) -> &[Arc<DeviceHandle<B::Channel>>] {
        &self.devices
    }

    /// All contexts, in the order their devices were first seen.
    pub fn contexts(&self) -> impl Iterator<Item = &Arc<DeviceContext<B::Channel>>> {
        self.contexts.iter().map(|tracked| &tracked.context)
    }

    /// Looks up the context of a device by its serial number.
    pub fn context(&self, serial: &str) -> Option<&Arc<DeviceContext<B::Channel>>> {
        self.contexts().find(|context| context.serial() == serial)
    }

    /// Whether a discovery scan is in flight.
    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    /// Advances the poll loop without blocking.
    ///
    /// This collects the result of a finished discovery scan or starts a new
    /// one once [`PollConfig::discovery_interval`] has passed since the last
    /// one completed. Finished context updates are collected next. A context
    /// whose update failed loses its handle, which is closed. Then handles
    /// are matched to contexts by serial number, creating contexts for
    /// unknown devices. Finally, new updates are started.
    pub fn tick(&mut self) {
        self.poll_discovery();
        self.collect_updates();
        self.reconcile_contexts();
        self.spawn_updates();
    }

    fn poll_discovery(&mut self) {
        if let Some(scan) = self.scan.take() {
            if !scan.is_finished() {
                self.scan = Some(scan);
                return;
            }

            self.last_scan = Some(Instant::now());
            match scan.now_or_never() {
                Some(Ok(Ok(found))) => {
                    if !found.is_empty() {
                        debug!(count = found.len(), "discovered new devices");
                    }
                    self.devices.extend(found);
                },
                Some(Ok(Err(err))) => warn!(%err, "device discovery failed"),
                Some(Err(err)) => error!(%err, "device discovery task failed"),
                None => {},
            }
            return;
        }

        let due = self
            .last_scan
            .is_none_or(|last| last.elapsed() >= self.config.discovery_interval);
        if !due {
            return;
        }

        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let existing = self.devices.clone();
        self.scan = Some(self.runtime.spawn(async move {
            discovery::discover(backend.as_ref(), &config, Some(existing.as_slice())).await
        }));
    }

    fn reconcile_contexts(&mut self) {
        for device in &self.devices {
            let serial = &device.identity().serial;

            let known = self
                .contexts
                .iter()
                .position(|tracked| tracked.context.serial() == serial);
            let Some(pos) = known else {
                info!(%serial, name = %device.identity().name, "created device context");
                self.contexts.push(TrackedContext {
                    context: Arc::new(DeviceContext::new(
                        Arc::clone(device),
                        self.config.update_debounce,
                    )),
                    update: None,
                });
                continue;
            };

            // A handle with an update in flight is the one the context last
            // had. Its update decides whether it is still alive.
            let tracked = &self.contexts[pos];
            if tracked
                .update
                .as_ref()
                .is_some_and(|(handle, _)| Arc::ptr_eq(handle, device))
            {
                continue;
            }

            // Another open handle of the same device keeps the current one.
            let context = &tracked.context;
            let current_is_open = context.handle().is_some_and(|current| {
                self.devices
                    .iter()
                    .any(|other| Arc::ptr_eq(other, &current))
            });
            if !current_is_open && context.attach(Arc::clone(device)) {
                info!(%serial, "applied new handle to device context");
            }
        }
    }

    fn collect_updates(&mut self) {
        let mut lost = Vec::new();

        for tracked in &mut self.contexts {
            let Some((handle, task)) = tracked.update.take() else {
                continue;
            };
            if !task.is_finished() {
                tracked.update = Some((handle, task));
                continue;
            }

            match task.now_or_never() {
                Some(Ok(Ok(()))) | None => {},
                Some(Ok(Err(err))) => {
                    error!(serial = %tracked.context.serial(), %err, "device context error");
                    lost.push(handle);
                },
                Some(Err(err)) => {
                    error!(serial = %tracked.context.serial(), %err, "device context update task failed");
                    tracked.context.detach(&handle);
                    lost.push(handle);
                },
            }
        }

        if !lost.is_empty() {
            self.devices
                .retain(|device| !lost.iter().any(|handle| Arc::ptr_eq(handle, device)));
        }
    }

    fn spawn_updates(&mut self) {
        for tracked in &mut self.contexts {
            if tracked.update.is_some() {
                continue;
            }
            let Some(handle) = tracked.context.handle() else {
                continue;
            };

            let context = Arc::clone(&tracked.context);
            let task = self.runtime.spawn(async move { context.update().await });
            tracked.update = Some((handle, task));
        }
    }

    /// Drops all contexts and closes all devices.
    ///
    /// In-flight tasks are aborted. The next discovery scan starts after
    /// [`PollConfig::discovery_interval`].
    pub fn release_all(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }

        for tracked in self.contexts.drain(..) {
            if let Some((_, task)) = tracked.update {
                task.abort();
            }
        }

        self.devices.clear();
        self.last_scan = Some(Instant::now());
        info!("released all devices");
    }

    /// Enables or disables an axis.
    pub fn set_axis_enabled(
        &self,
        context: &Arc<DeviceContext<B::Channel>>,
        axis: u8,
        enabled: bool,
    ) -> Result<CommandTicket<()>, CommandError> {
        self.dispatch(context, move |handle| async move {
            handle.set_axis_enabled(axis, enabled).await
        })
    }

    /// Sends the staged range, deadzone and limit of an axis.
    pub fn push_axis_range(
        &self,
        context: &Arc<DeviceContext<B::Channel>>,
        axis: u8,
    ) -> Result<CommandTicket<()>, CommandError> {
        let range = context
            .with_state(|state| state.axes_edit.get(usize::from(axis)).map(|edit| edit.range()))
            .ok_or(CommandError::UnknownAxis { axis })?;

        self.dispatch(context, move |handle| async move {
            handle
                .set_axis_range(axis, range.min, range.max, range.deadzone, range.limit)
                .await
        })
    }

    /// Sends the staged control points of a Bezier model.
    pub fn push_bezier_model(
        &self,
        context: &Arc<DeviceContext<B::Channel>>,
        model: u8,
    ) -> Result<CommandTicket<()>, CommandError> {
        let points = context
            .with_state(|state| state.models.get(usize::from(model)).map(BezierModel::to_wire))
            .ok_or(DeviceError::InvalidModelIndex { index: model })?;

        self.dispatch(context, move |handle| async move {
            handle.set_bezier_model(model, &points).await
        })
    }

    /// Sends a new label for a Bezier model.
    ///
    /// Once the device confirmed the label, it is stored in the context.
    pub fn push_bezier_label(
        &self,
        context: &Arc<DeviceContext<B::Channel>>,
        model: u8,
        label: String,
    ) -> Result<CommandTicket<()>, CommandError> {
        let target = Arc::clone(context);

        self.dispatch(context, move |handle| async move {
            handle.set_bezier_label(model, &label).await?;

            target.with_state(|state| {
                if let Some(slot) = state.models.get_mut(usize::from(model)) {
                    slot.label = (!label.is_empty()).then_some(label);
                }
            });
            Ok::<(), DeviceError>(())
        })
    }

    /// Applies the staged Bezier model selection of an axis.
    pub fn activate_bezier_model(
        &self,
        context: &Arc<DeviceContext<B::Channel>>,
        axis: u8,
    ) -> Result<CommandTicket<()>, CommandError> {
        let curve = context
            .with_state(|state| {
                state
                    .axes_edit
                    .get(usize::from(axis))
                    .map(|edit| edit.curve_edit_index)
            })
            .ok_or(CommandError::UnknownAxis { axis })?;

        self.dispatch(context, move |handle| async move {
            handle.set_axis_bezier_index(axis, curve).await
        })
    }

    /// Persists the settings of a device.
    pub fn commit(
        &self,
        context: &Arc<DeviceContext<B::Channel>>,
    ) -> Result<CommandTicket<()>, CommandError> {
        self.dispatch(context, |handle| async move { handle.commit().await })
    }

    /// Runs a command against the handle of a context on a background task.
    fn dispatch<R, F, Fut>(
        &self,
        context: &DeviceContext<B::Channel>,
        command: F,
    ) -> Result<CommandTicket<R>, CommandError>
    where
        R: Send + 'static,
        F: FnOnce(Arc<DeviceHandle<B::Channel>>) -> Fut,
        Fut: Future<Output = Result<R, DeviceError>> + Send + 'static,
    {
        let handle = context.handle().ok_or(CommandError::Unbound)?;
        let serial = context.serial().to_owned();
        let command = command(handle);

        let task = self.runtime.spawn(async move {
            let result = command.await;
            if let Err(err) = &result {
                warn!(%serial, %err, "command failed");
            }
            result
        });

        Ok(CommandTicket { task: Some(task) })
    }
}

/// The pending result of a command started by a [`HardwareManager`].
pub struct CommandTicket<R> {
    task: Option<JoinHandle<Result<R, DeviceError>>>,
}

impl<R> CommandTicket<R> {
    /// Whether the command has finished.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Takes the result of the command without blocking.
    ///
    /// Returns [`None`] while the command is running and after the result
    /// was taken.
    pub fn try_take(&mut self) -> Option<Result<R, CommandError>> {
        if !self.task.as_ref()?.is_finished() {
            return None;
        }

        let result = self.task.take()?.now_or_never()?;
        Some(result.map_err(CommandError::from).and_then(|r| r.map_err(CommandError::from)))
    }

    /// Waits for the result of the command.
    pub async fn wait(mut self) -> Result<R, CommandError> {
        let task = self.task.take().ok_or(CommandError::Consumed)?;
        Ok(task.await??)
    }
}

/// Represents an error occurring while running a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Indicates that the device returned an error.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Indicates that the context has no device attached.
    #[error("the device context is not bound to a device")]
    Unbound,

    /// Indicates that the context has no axis with the given index.
    #[error("there is no axis with index {axis}")]
    UnknownAxis { axis: u8 },

    /// Indicates that the task running the command panicked or was
    /// cancelled.
    #[error("the command task failed")]
    Task(#[from] JoinError),

    /// Indicates that the result was already taken.
    #[error("the result of the command was already taken")]
    Consumed,
}
