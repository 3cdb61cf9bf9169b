//! An in-process emulation of the firmware.
//!
//! [`SimulatedBackend`] implements [`HidBackend`] and [`SimulatedChannel`]
//! implements [`RawHidChannel`], so the whole stack can be driven without any
//! hardware attached. The firmware state of a [`SimulatedDevice`] outlives
//! its channels, which makes it possible to unplug a device and plug it in
//! again under a different path, as real devices do.
//!
//! Faults can be injected per device to exercise error handling.

use std::{
    error::Error,
    io,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tracing::trace;

use crate::{
    config::{DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID},
    device::DeviceIdentity,
    discovery::{HidBackend, HidDeviceInfo},
    model::{
        AXIS_RAW_MAX,
        AxisState,
        BezierModel,
        CurvePoint,
        FirmwareVersion,
        MODEL_COUNT,
        MODEL_POINTS,
    },
    packet::{
        HANDSHAKE_MAGIC,
        HANDSHAKE_REPLY_MAGIC,
        HandshakeReply,
        HandshakeRequest,
        LABEL_LENGTH,
        Label,
        PacketHeader,
        Reply,
        Request,
        decode_label,
        encode_label,
    },
    transport::{REPORT_LENGTH, RawHidChannel, Report},
};

/// The amount of axes a simulated device has unless configured otherwise.
pub const DEFAULT_AXES: u8 = 3;

/// The firmware version simulated devices report.
pub const FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion {
    major: 1,
    minor: 2,
    revision: 0,
};

/// Faults that can be injected into a simulated device.
#[derive(Default)]
struct Faults {
    fail_reads: AtomicBool,
    mute: AtomicBool,
    reject_commit: AtomicBool,
    refuse_handshake: AtomicBool,
    inject_stale: AtomicBool,
    mute_models: AtomicBool,
}

/// The persistent state of the emulated firmware.
struct Firmware {
    communications_id: Option<u16>,
    last_packet_id: Option<u16>,
    axes: Vec<AxisState>,
    models: [[CurvePoint; MODEL_POINTS]; MODEL_COUNT],
    labels: [Label; MODEL_COUNT],
    commits: usize,
}

impl Firmware {
    fn new(axes: u8) -> Self {
        let axis = AxisState {
            enabled: true,
            ..Default::default()
        };

        Self {
            communications_id: None,
            last_packet_id: None,
            axes: vec![axis; usize::from(axes)],
            models: [BezierModel::default().to_wire(); MODEL_COUNT],
            labels: [[0; LABEL_LENGTH]; MODEL_COUNT],
            commits: 0,
        }
    }

    /// Processes a single packet, returning the packets sent in response.
    fn respond(&mut self, packet: &Report, faults: &Faults) -> Vec<Report> {
        if let Some(handshake) = HandshakeRequest::from_bytes(packet) {
            if faults.refuse_handshake.load(Ordering::SeqCst) {
                return Vec::new();
            }

            let communications_id = random_communications_id();
            self.communications_id = Some(communications_id);
            return vec![
                HandshakeReply {
                    communications_id,
                    nonce: handshake.nonce,
                }
                .to_bytes(),
            ];
        }

        let Some((header, request)) = Request::from_bytes(packet) else {
            return Vec::new();
        };
        self.last_packet_id = Some(header.packet_id);

        let reads_model = matches!(
            request,
            Request::GetBezierLabel { .. } | Request::GetBezierModel { .. }
        );
        if reads_model && faults.mute_models.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let Some(reply) = self.apply(request, faults) else {
            return Vec::new();
        };

        let mut packets = Vec::with_capacity(3);
        if faults.inject_stale.load(Ordering::SeqCst) {
            packets.push(reply.to_bytes(PacketHeader {
                communications_id: header.communications_id.wrapping_add(1),
                ..header
            }));
            packets.push(reply.to_bytes(PacketHeader {
                packet_id: header.packet_id.wrapping_sub(1),
                ..header
            }));
        }
        packets.push(reply.to_bytes(header));
        packets
    }

    /// Applies a request to the firmware state.
    ///
    /// Returns [`None`] for requests addressing a non-existent axis or model,
    /// which the firmware ignores.
    fn apply(&mut self, request: Request, faults: &Faults) -> Option<Reply> {
        let reply = match request {
            Request::GetVersion => Reply::Version(FIRMWARE_VERSION),
            Request::GetNumAxes => Reply::NumAxes(u8::try_from(self.axes.len()).unwrap_or(u8::MAX)),
            Request::GetAxisState { axis } => Reply::AxisState {
                axis,
                state: *self.axes.get(usize::from(axis))?,
            },
            Request::SetAxisEnabled { axis, enabled } => {
                self.axes.get_mut(usize::from(axis))?.enabled = enabled;
                Reply::AxisEnabled { axis, enabled }
            },
            Request::SetAxisRange { axis, range } => {
                let state = self.axes.get_mut(usize::from(axis))?;
                state.range_min = range.min;
                state.range_max = range.max;
                state.deadzone = range.deadzone;
                state.limit = range.limit;
                recompute_output(state);
                Reply::AxisRange { axis, range }
            },
            Request::SetAxisBezierIndex { axis, curve } => {
                if !(-1..MODEL_COUNT as i8).contains(&curve) {
                    return None;
                }
                self.axes.get_mut(usize::from(axis))?.curve_index = curve;
                Reply::AxisBezierIndex { axis, curve }
            },
            Request::SetBezierModel { model, points } => {
                *self.models.get_mut(usize::from(model))? = points;
                Reply::BezierModelStored { model, points }
            },
            Request::GetBezierModel { model } => Reply::BezierModel {
                model,
                points: *self.models.get(usize::from(model))?,
            },
            Request::SetBezierLabel { model, label } => {
                *self.labels.get_mut(usize::from(model))? = label;
                Reply::BezierLabelStored { model, label }
            },
            Request::GetBezierLabel { model } => Reply::BezierLabel {
                model,
                label: *self.labels.get(usize::from(model))?,
            },
            Request::Commit => {
                if faults.reject_commit.load(Ordering::SeqCst) {
                    Reply::Commit { status: 0 }
                } else {
                    self.commits += 1;
                    Reply::Commit { status: 1 }
                }
            },
        };

        Some(reply)
    }
}

/// Picks a communications ID that cannot be mistaken for handshake framing.
fn random_communications_id() -> u16 {
    loop {
        let id = rand::random::<u16>();
        let [low, _] = id.to_le_bytes();
        if low != HANDSHAKE_MAGIC[2] && low != HANDSHAKE_REPLY_MAGIC[2] {
            return id;
        }
    }
}

/// Maps the raw input of an axis linearly onto its calibrated range.
fn recompute_output(state: &mut AxisState) {
    let span = u32::from(state.range_max.saturating_sub(state.range_min)).max(1);
    let offset = u32::from(state.input.saturating_sub(state.range_min)).min(span);
    let scaled = offset * u32::from(AXIS_RAW_MAX) / span;
    let limited = scaled * u32::from(state.limit.min(100)) / 100;

    state.output = u16::try_from(limited).unwrap_or(AXIS_RAW_MAX);
}

/// A simulated device that can be plugged into a [`SimulatedBackend`].
///
/// Clones share the same firmware, faults and connection state.
#[derive(Clone)]
pub struct SimulatedDevice {
    info: HidDeviceInfo,
    firmware: Arc<Mutex<Firmware>>,
    faults: Arc<Faults>,
    connected: Arc<AtomicBool>,
}

impl SimulatedDevice {
    /// Creates a device with [`DEFAULT_AXES`] axes.
    pub fn new(path: impl Into<String>, serial: impl Into<String>) -> Self {
        Self::with_axes(path, serial, DEFAULT_AXES)
    }

    /// Creates a device with a specific amount of axes.
    pub fn with_axes(path: impl Into<String>, serial: impl Into<String>, axes: u8) -> Self {
        Self {
            info: HidDeviceInfo {
                path: path.into(),
                vendor_id: DEFAULT_VENDOR_ID,
                product_id: DEFAULT_PRODUCT_ID,
                manufacturer: Some("SC".to_owned()),
                product: Some("SC pedals (simulated)".to_owned()),
                serial: Some(serial.into()),
            },
            firmware: Arc::new(Mutex::new(Firmware::new(axes))),
            faults: Arc::new(Faults::default()),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Makes the serial number of the device undecodable.
    pub fn without_serial(mut self) -> Self {
        self.info.serial = None;
        self
    }

    pub fn info(&self) -> &HidDeviceInfo {
        &self.info
    }

    /// The identity a host would derive from this device.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.info.vendor_id,
            product_id: self.info.product_id,
            organization: self.info.manufacturer.clone().unwrap_or_default(),
            name: self.info.product.clone().unwrap_or_default(),
            uuid: self.info.path.clone(),
            serial: self.info.serial.clone().unwrap_or_default(),
        }
    }

    /// Opens a new channel to the device.
    pub fn open_channel(&self) -> SimulatedChannel {
        let (tx, rx) = flume::unbounded();

        SimulatedChannel {
            device: self.clone(),
            tx,
            rx,
        }
    }

    /// Whether the device is currently plugged in.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Disconnects the device. Every I/O on its open channels fails from now
    /// on.
    pub fn unplug(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Creates the device a host sees after plugging this one in again under
    /// a different path.
    ///
    /// The firmware state and faults are shared with this device.
    pub fn replugged_at(&self, path: impl Into<String>) -> Self {
        let mut info = self.info.clone();
        info.path = path.into();

        Self {
            info,
            firmware: Arc::clone(&self.firmware),
            faults: Arc::clone(&self.faults),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Makes all reads of open channels fail.
    pub fn set_fail_reads(&self, value: bool) {
        self.faults.fail_reads.store(value, Ordering::SeqCst);
    }

    /// Makes the firmware stop replying.
    pub fn set_mute(&self, value: bool) {
        self.faults.mute.store(value, Ordering::SeqCst);
    }

    /// Makes the firmware report a failure for every commit.
    pub fn set_reject_commit(&self, value: bool) {
        self.faults.reject_commit.store(value, Ordering::SeqCst);
    }

    /// Makes the firmware ignore handshakes.
    pub fn set_refuse_handshake(&self, value: bool) {
        self.faults.refuse_handshake.store(value, Ordering::SeqCst);
    }

    /// Makes the firmware send replies with a foreign communications ID and
    /// an outdated packet ID before every actual reply.
    pub fn set_inject_stale(&self, value: bool) {
        self.faults.inject_stale.store(value, Ordering::SeqCst);
    }

    /// Makes the firmware ignore requests reading Bezier models and labels.
    pub fn set_mute_models(&self, value: bool) {
        self.faults.mute_models.store(value, Ordering::SeqCst);
    }

    /// Moves the raw sensor reading of an axis.
    pub fn nudge_input(&self, axis: u8, input: u16) {
        if let Some(state) = self.firmware().axes.get_mut(usize::from(axis)) {
            state.input = input;
            recompute_output(state);
        }
    }

    /// The state of an axis as stored by the firmware.
    pub fn axis(&self, axis: u8) -> Option<AxisState> {
        self.firmware().axes.get(usize::from(axis)).copied()
    }

    /// The control points of a model as stored by the firmware.
    pub fn model(&self, model: u8) -> Option<[CurvePoint; MODEL_POINTS]> {
        self.firmware().models.get(usize::from(model)).copied()
    }

    /// The label of a model as stored by the firmware.
    pub fn label(&self, model: u8) -> Option<String> {
        self.firmware().labels.get(usize::from(model)).map(decode_label)
    }

    /// Stores a label directly in the firmware.
    ///
    /// Labels longer than [`LABEL_LENGTH`] bytes are ignored.
    pub fn preset_label(&self, model: u8, label: &str) {
        let Some(encoded) = encode_label(label) else {
            return;
        };

        if let Some(slot) = self.firmware().labels.get_mut(usize::from(model)) {
            *slot = encoded;
        }
    }

    /// The communications ID assigned by the last handshake.
    pub fn firmware_communications_id(&self) -> Option<u16> {
        self.firmware().communications_id
    }

    /// The packet ID of the last regular request received.
    pub fn last_packet_id(&self) -> Option<u16> {
        self.firmware().last_packet_id
    }

    /// The amount of successful commits.
    pub fn commit_count(&self) -> usize {
        self.firmware().commits
    }

    fn firmware(&self) -> MutexGuard<'_, Firmware> {
        self.firmware.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_connected(&self) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "the simulated device was unplugged",
            ));
        }

        Ok(())
    }
}

/// An open channel to a [`SimulatedDevice`].
pub struct SimulatedChannel {
    device: SimulatedDevice,
    tx: flume::Sender<Report>,
    rx: flume::Receiver<Report>,
}

#[async_trait]
impl RawHidChannel for SimulatedChannel {
    async fn write_report(&self, src: &[u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        self.device.check_connected()?;

        // The first byte is the report ID.
        let payload = src.get(1..).unwrap_or_default();
        let len = payload.len().min(REPORT_LENGTH);
        let mut packet = [0u8; REPORT_LENGTH];
        packet[..len].copy_from_slice(&payload[..len]);

        let replies = self.device.firmware().respond(&packet, &self.device.faults);
        if !self.device.faults.mute.load(Ordering::SeqCst) {
            for reply in replies {
                self.tx.send(reply)?;
            }
        }

        Ok(src.len())
    }

    async fn read_report(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Box<dyn Error + Sync + Send>> {
        self.device.check_connected()?;
        if self.device.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated read failure").into());
        }

        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(report) => {
                let report = report?;
                let len = buf.len().min(REPORT_LENGTH);
                buf[..len].copy_from_slice(&report[..len]);
                trace!(path = %self.device.info.path, "simulated reply delivered");
                Ok(len)
            },
            Err(_elapsed) => Ok(0),
        }
    }
}

/// A set of simulated devices, enumerable like real HID devices.
#[derive(Clone, Default)]
pub struct SimulatedBackend {
    devices: Arc<Mutex<Vec<SimulatedDevice>>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device with [`DEFAULT_AXES`] axes and plugs it in.
    pub fn add_device(&self, path: impl Into<String>, serial: impl Into<String>) -> SimulatedDevice {
        let device = SimulatedDevice::new(path, serial);
        self.plug(device.clone());
        device
    }

    /// Makes a device visible to enumeration.
    pub fn plug(&self, device: SimulatedDevice) {
        self.lock().push(device);
    }

    /// Disconnects the device with the given path and removes it.
    pub fn unplug(&self, path: &str) -> Option<SimulatedDevice> {
        let mut devices = self.lock();
        let pos = devices.iter().position(|device| device.info.path == path)?;

        let device = devices.remove(pos);
        device.unplug();
        Some(device)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SimulatedDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HidBackend for SimulatedBackend {
    type Channel = SimulatedChannel;

    async fn enumerate(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<HidDeviceInfo>, Box<dyn Error + Sync + Send>> {
        Ok(self
            .lock()
            .iter()
            .filter(|device| device.is_connected())
            .filter(|device| device.info.vendor_id == vendor_id && device.info.product_id == product_id)
            .map(|device| device.info.clone())
            .collect())
    }

    async fn open(&self, info: &HidDeviceInfo) -> Result<SimulatedChannel, Box<dyn Error + Sync + Send>> {
        let devices = self.lock();
        let device = devices
            .iter()
            .find(|device| device.info.path == info.path && device.is_connected())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device at {}", info.path)))?;

        Ok(device.open_channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_follows_range_and_limit() {
        let mut state = AxisState {
            range_min: 1000,
            range_max: 3000,
            input: 2000,
            ..Default::default()
        };
        recompute_output(&mut state);
        assert_eq!(state.output, 32767);

        state.limit = 50;
        state.input = 5000;
        recompute_output(&mut state);
        assert_eq!(state.output, 32767);

        state.input = 0;
        recompute_output(&mut state);
        assert_eq!(state.output, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unplugged_devices_vanish() -> Result<(), Box<dyn Error + Sync + Send>> {
        let backend = SimulatedBackend::new();
        let device = backend.add_device("sim-0", "SC-0001");
        backend.add_device("sim-1", "SC-0002");

        let channel = device.open_channel();
        assert_eq!(backend.enumerate(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).await?.len(), 2);
        assert!(backend.enumerate(0x046d, DEFAULT_PRODUCT_ID).await?.is_empty());

        backend.unplug("sim-0");
        let infos = backend.enumerate(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).await?;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, "sim-1");

        let mut buf = [0u8; REPORT_LENGTH];
        assert!(channel.read_report(&mut buf, Duration::from_millis(5)).await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn replugged_device_keeps_firmware_state() {
        let device = SimulatedDevice::new("sim-0", "SC-0001");
        device.preset_label(1, "Rally");
        device.unplug();

        let again = device.replugged_at("sim-7");
        assert!(again.is_connected());
        assert_eq!(again.info().path, "sim-7");
        assert_eq!(again.info().serial.as_deref(), Some("SC-0001"));
        assert_eq!(again.label(1).as_deref(), Some("Rally"));
    }
}
