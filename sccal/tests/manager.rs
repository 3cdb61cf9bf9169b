use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use sccal::{
    async_trait,
    config::PollConfig,
    context::ContextState,
    device::DeviceError,
    discovery::{HidBackend, HidDeviceInfo},
    manager::{CommandError, HardwareManager},
    model::{AxisEditState, CurvePoint, PercentPoint},
    sim::{SimulatedBackend, SimulatedChannel},
};
use tokio::runtime::Handle;

const FRAME: Duration = Duration::from_millis(16);

fn manager(backend: SimulatedBackend) -> HardwareManager<SimulatedBackend> {
    HardwareManager::new(backend, PollConfig::default(), Handle::current())
}

/// Ticks the manager once per frame until `done` holds, for at most ten
/// seconds of (virtual) time.
async fn tick_until<B: HidBackend>(
    manager: &mut HardwareManager<B>,
    mut done: impl FnMut(&HardwareManager<B>) -> bool,
) -> bool {
    for _ in 0..625 {
        manager.tick();
        if done(manager) {
            return true;
        }
        tokio::time::sleep(FRAME).await;
    }
    false
}

fn all_synced<B: HidBackend>(manager: &HardwareManager<B>, count: usize) -> bool {
    manager.contexts().count() == count
        && manager
            .contexts()
            .all(|context| context.state() == ContextState::BoundSynced)
}

#[tokio::test(start_paused = true)]
async fn discovers_and_syncs_devices() {
    let backend = SimulatedBackend::new();
    backend.add_device("sim-0", "SC-0001");
    backend.add_device("sim-1", "SC-0002");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 2)).await);
    assert_eq!(manager.devices().len(), 2);

    let context = manager.context("SC-0002").expect("a context for the second device");
    assert_eq!(context.name(), "SC pedals (simulated)");

    let snapshot = context.snapshot();
    assert!(snapshot.version.is_some());
    assert_eq!(snapshot.axes.len(), 3);
    assert!(snapshot.initial_communication_complete);
}

#[tokio::test(start_paused = true)]
async fn live_axis_values_follow_the_device() {
    let backend = SimulatedBackend::new();
    let device = backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);

    device.nudge_input(2, u16::MAX);
    assert!(
        tick_until(&mut manager, |m| {
            m.context("SC-0001")
                .is_some_and(|context| context.snapshot().axes[2].output_fraction == 1.0)
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn context_survives_reconnect() {
    let backend = SimulatedBackend::new();
    let device = backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend.clone());
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);
    let before = Arc::clone(manager.context("SC-0001").expect("a context"));

    backend.unplug("sim-0");
    assert!(
        tick_until(&mut manager, |m| {
            m.devices().is_empty()
                && m.context("SC-0001")
                    .is_some_and(|context| context.state() == ContextState::Unbound)
        })
        .await
    );
    assert!(before.handle().is_none());

    backend.plug(device.replugged_at("sim-7"));
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);

    let after = manager.context("SC-0001").expect("the same context");
    assert!(Arc::ptr_eq(&before, after));
    assert_eq!(
        after.handle().map(|handle| handle.identity().uuid.clone()),
        Some("sim-7".to_owned())
    );
}

#[tokio::test(start_paused = true)]
async fn lost_device_does_not_affect_others() {
    let backend = SimulatedBackend::new();
    let broken = backend.add_device("sim-0", "SC-0001");
    backend.add_device("sim-1", "SC-0002");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 2)).await);

    broken.set_fail_reads(true);
    assert!(
        tick_until(&mut manager, |m| {
            m.context("SC-0001")
                .is_some_and(|context| context.state() == ContextState::Unbound)
        })
        .await
    );

    let healthy = manager.context("SC-0002").expect("a context");
    assert_eq!(healthy.state(), ContextState::BoundSynced);
    assert_eq!(manager.devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_device_is_not_reattached() {
    let backend = SimulatedBackend::new();
    let device = backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);

    device.set_mute(true);
    assert!(
        tick_until(&mut manager, |m| {
            m.context("SC-0001")
                .is_some_and(|context| context.state() == ContextState::Unbound)
        })
        .await
    );
    assert!(manager.devices().is_empty());

    // Rescans keep failing their handshake while the device stays silent.
    for _ in 0..250 {
        manager.tick();
        let context = manager.context("SC-0001").expect("a context");
        assert_eq!(context.state(), ContextState::Unbound);
        assert!(context.handle().is_none());
        assert!(manager.devices().is_empty());
        tokio::time::sleep(FRAME).await;
    }

    device.set_mute(false);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);
}

#[derive(Clone)]
struct CountingBackend {
    inner: SimulatedBackend,
    scans: Arc<AtomicUsize>,
}

#[async_trait]
impl HidBackend for CountingBackend {
    type Channel = SimulatedChannel;

    async fn enumerate(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<HidDeviceInfo>, Box<dyn Error + Sync + Send>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.enumerate(vendor_id, product_id).await
    }

    async fn open(
        &self,
        info: &HidDeviceInfo,
    ) -> Result<SimulatedChannel, Box<dyn Error + Sync + Send>> {
        self.inner.open(info).await
    }
}

#[tokio::test(start_paused = true)]
async fn scans_are_rate_limited() {
    let scans = Arc::new(AtomicUsize::new(0));
    let backend = CountingBackend {
        inner: SimulatedBackend::new(),
        scans: Arc::clone(&scans),
    };

    let mut manager = HardwareManager::new(backend, PollConfig::default(), Handle::current());
    let started = tokio::time::Instant::now();
    while started.elapsed() < Duration::from_millis(2500) {
        manager.tick();
        tokio::time::sleep(FRAME).await;
    }

    let count = scans.load(Ordering::SeqCst);
    assert!((2..=3).contains(&count), "{count} scans in 2.5 seconds");
}

#[tokio::test(start_paused = true)]
async fn staged_values_are_pushed() -> Result<(), CommandError> {
    let backend = SimulatedBackend::new();
    let device = backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);
    let context = Arc::clone(manager.context("SC-0001").expect("a context"));

    context.with_state(|state| {
        state.axes_edit[1] = AxisEditState {
            range_min: 100,
            range_max: 50000,
            deadzone: 5,
            limit: 90,
            curve_edit_index: 2,
        };
        state.models[2].points[1] = PercentPoint { x: 20, y: 5 };
    });

    manager.push_axis_range(&context, 1)?.wait().await?;
    let axis = device.axis(1).expect("the axis exists");
    assert_eq!((axis.range_min, axis.range_max), (100, 50000));
    assert_eq!((axis.deadzone, axis.limit), (5, 90));

    manager.activate_bezier_model(&context, 1)?.wait().await?;
    assert_eq!(device.axis(1).map(|axis| axis.curve_index), Some(2));

    manager.push_bezier_model(&context, 2)?.wait().await?;
    let stored = device.model(2).expect("the model exists");
    assert!(stored[1].bitwise_eq(&CurvePoint {
        x: 20.0 / 100.0,
        y: 5.0 / 100.0
    }));

    manager
        .push_bezier_label(&context, 2, "Soft".to_owned())?
        .wait()
        .await?;
    assert_eq!(device.label(2).as_deref(), Some("Soft"));
    assert_eq!(context.snapshot().models[2].label.as_deref(), Some("Soft"));

    manager.set_axis_enabled(&context, 0, false)?.wait().await?;
    assert_eq!(device.axis(0).map(|axis| axis.enabled), Some(false));

    manager.commit(&context)?.wait().await?;
    assert_eq!(device.commit_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn tickets_can_be_polled() -> Result<(), CommandError> {
    let backend = SimulatedBackend::new();
    backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);
    let context = Arc::clone(manager.context("SC-0001").expect("a context"));

    let mut ticket = manager.commit(&context)?;
    let result = loop {
        if let Some(result) = ticket.try_take() {
            break result;
        }
        manager.tick();
        tokio::time::sleep(FRAME).await;
    };

    assert!(result.is_ok());
    assert!(ticket.is_finished());
    assert!(ticket.try_take().is_none());
    assert!(matches!(ticket.wait().await, Err(CommandError::Consumed)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_commands_keep_staged_values() -> Result<(), CommandError> {
    let backend = SimulatedBackend::new();
    let device = backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);
    let context = Arc::clone(manager.context("SC-0001").expect("a context"));

    device.set_reject_commit(true);
    let result = manager.commit(&context)?.wait().await;
    assert!(matches!(
        result,
        Err(CommandError::Device(DeviceError::CommitRejected { .. }))
    ));

    let result = manager
        .push_bezier_label(&context, 0, "x".repeat(60))?
        .wait()
        .await;
    assert!(matches!(
        result,
        Err(CommandError::Device(DeviceError::LabelTooLong { len: 60 }))
    ));
    assert_eq!(context.snapshot().models[0].label, None);

    assert!(matches!(
        manager.push_axis_range(&context, 9),
        Err(CommandError::UnknownAxis { axis: 9 })
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn commands_need_a_bound_context() {
    let backend = SimulatedBackend::new();
    let device = backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);
    let context = Arc::clone(manager.context("SC-0001").expect("a context"));

    device.unplug();
    assert!(tick_until(&mut manager, |_| context.state() == ContextState::Unbound).await);

    assert!(matches!(
        manager.commit(&context),
        Err(CommandError::Unbound)
    ));
}

#[tokio::test(start_paused = true)]
async fn release_all_drops_everything() {
    let backend = SimulatedBackend::new();
    backend.add_device("sim-0", "SC-0001");

    let mut manager = manager(backend);
    assert!(tick_until(&mut manager, |m| all_synced(m, 1)).await);

    manager.release_all();
    assert_eq!(manager.contexts().count(), 0);
    assert!(manager.devices().is_empty());
    assert!(!manager.is_scanning());
}
