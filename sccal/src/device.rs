//! Implements the request/reply exchange with a single opened device.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, trace};

use crate::{
    model::{AxisRange, AxisState, CurvePoint, FirmwareVersion, MODEL_COUNT, MODEL_POINTS},
    packet::{
        HandshakeReply,
        HandshakeRequest,
        LABEL_LENGTH,
        NONCE_LENGTH,
        PacketHeader,
        Reply,
        Request,
        decode_label,
        encode_label,
    },
    transport::{RawHidChannel, Report, ReportTransport, TransportError},
};

/// How long to wait for the reply to a single request by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Static information describing an opened device.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,

    /// The manufacturer string reported by the device.
    pub organization: String,

    /// The product string reported by the device.
    pub name: String,

    /// The platform path the device was opened from.
    ///
    /// This is only unique while the device stays connected and usually
    /// changes when it is plugged in again.
    pub uuid: String,

    /// The serial number of the device, which is stable across reconnects.
    pub serial: String,
}

/// The protocol state of a single open device.
struct Session {
    /// The ID assigned by the last successful handshake, if any.
    communications_id: Option<u16>,

    /// The packet ID of the last sent request.
    next_packet_id: u16,
}

impl Session {
    fn next_header(&mut self) -> Option<PacketHeader> {
        let communications_id = self.communications_id?;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        Some(PacketHeader {
            communications_id,
            packet_id: self.next_packet_id,
        })
    }
}

/// Represents a single opened device.
///
/// Every request waits for its matching reply before the next one is sent,
/// so a handle can safely be shared between tasks.
pub struct DeviceHandle<T: RawHidChannel> {
    identity: DeviceIdentity,
    transport: ReportTransport<T>,

    /// Held for the whole duration of an exchange.
    session: Mutex<Session>,

    timeout: Duration,
}

impl<T: RawHidChannel> DeviceHandle<T> {
    /// Wraps an opened raw channel.
    ///
    /// The handle cannot be used for anything but
    /// [`Self::get_new_communications_id`] until that succeeded once.
    pub fn new(identity: DeviceIdentity, raw: T) -> Self {
        Self {
            identity,
            transport: ReportTransport::new(raw),
            session: Mutex::new(Session {
                communications_id: None,
                next_packet_id: 0,
            }),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets how long to wait for the reply to a single request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Provides access to the underlying raw channel.
    pub fn raw(&self) -> &T {
        self.transport.raw()
    }

    /// The communications ID of the current session, if a handshake
    /// succeeded.
    pub async fn communications_id(&self) -> Option<u16> {
        self.session.lock().await.communications_id
    }

    /// Starts a new session by requesting a communications ID from the
    /// firmware.
    ///
    /// The request carries a random nonce. Only a reply echoing exactly this
    /// nonce is accepted, so replies to handshakes of earlier sessions are
    /// ignored. On success, the packet ID counter starts over.
    pub async fn get_new_communications_id(&self) -> Result<u16, DeviceError> {
        let mut session = self.session.lock().await;

        let request = HandshakeRequest {
            nonce: random_nonce(),
        };
        let communications_id = self
            .correlate(&request.to_bytes(), |raw| {
                HandshakeReply::from_bytes(raw)
                    .filter(|reply| reply.answers(&request))
                    .map(|reply| reply.communications_id)
            })
            .await?;

        session.communications_id = Some(communications_id);
        session.next_packet_id = 0;

        debug!(
            serial = %self.identity.serial,
            communications_id,
            "negotiated new session"
        );
        Ok(communications_id)
    }

    pub async fn get_version(&self) -> Result<FirmwareVersion, DeviceError> {
        self.exchange(Request::GetVersion, |reply| match reply {
            Reply::Version(version) => Some(version),
            _ => None,
        })
        .await
    }

    /// Retrieves the amount of axes the device has.
    pub async fn get_num_axes(&self) -> Result<u8, DeviceError> {
        self.exchange(Request::GetNumAxes, |reply| match reply {
            Reply::NumAxes(count) => Some(count),
            _ => None,
        })
        .await
    }

    /// Retrieves the live state of a single axis.
    pub async fn get_axis_state(&self, axis: u8) -> Result<AxisState, DeviceError> {
        self.exchange(Request::GetAxisState { axis }, |reply| match reply {
            Reply::AxisState { state, .. } => Some(state),
            _ => None,
        })
        .await
    }

    pub async fn set_axis_enabled(&self, axis: u8, enabled: bool) -> Result<(), DeviceError> {
        self.exchange(Request::SetAxisEnabled { axis, enabled }, |reply| {
            matches!(reply, Reply::AxisEnabled { .. }).then_some(())
        })
        .await
    }

    /// Sets the calibration parameters of a single axis.
    ///
    /// `deadzone` and `limit` are percentages.
    pub async fn set_axis_range(
        &self,
        axis: u8,
        min: u16,
        max: u16,
        deadzone: u8,
        limit: u8,
    ) -> Result<(), DeviceError> {
        let range = AxisRange {
            min,
            max,
            deadzone,
            limit,
        };

        self.exchange(Request::SetAxisRange { axis, range }, |reply| {
            matches!(reply, Reply::AxisRange { .. }).then_some(())
        })
        .await
    }

    /// Selects the Bezier model applied to an axis.
    ///
    /// A `curve` of `-1` selects a linear response.
    pub async fn set_axis_bezier_index(&self, axis: u8, curve: i8) -> Result<(), DeviceError> {
        self.exchange(Request::SetAxisBezierIndex { axis, curve }, |reply| {
            matches!(reply, Reply::AxisBezierIndex { .. }).then_some(())
        })
        .await
    }

    /// Stores the control points of a Bezier model.
    ///
    /// The reply has to echo the points bit by bit.
    pub async fn set_bezier_model(
        &self,
        model: u8,
        points: &[CurvePoint; MODEL_POINTS],
    ) -> Result<(), DeviceError> {
        check_model_index(model)?;

        self.exchange(
            Request::SetBezierModel {
                model,
                points: *points,
            },
            |reply| matches!(reply, Reply::BezierModelStored { .. }).then_some(()),
        )
        .await
    }

    /// Retrieves the control points of a Bezier model.
    pub async fn get_bezier_model(&self, model: u8) -> Result<[CurvePoint; MODEL_POINTS], DeviceError> {
        check_model_index(model)?;

        self.exchange(Request::GetBezierModel { model }, |reply| match reply {
            Reply::BezierModel { points, .. } => Some(points),
            _ => None,
        })
        .await
    }

    /// Stores the label of a Bezier model.
    ///
    /// Returns [`DeviceError::LabelTooLong`] without sending anything if the
    /// label exceeds [`LABEL_LENGTH`] bytes.
    pub async fn set_bezier_label(&self, model: u8, label: &str) -> Result<(), DeviceError> {
        check_model_index(model)?;
        let label = encode_label(label).ok_or(DeviceError::LabelTooLong { len: label.len() })?;

        self.exchange(Request::SetBezierLabel { model, label }, |reply| {
            matches!(reply, Reply::BezierLabelStored { .. }).then_some(())
        })
        .await
    }

    /// Retrieves the label of a Bezier model.
    ///
    /// An empty string means the model has no label.
    pub async fn get_bezier_label(&self, model: u8) -> Result<String, DeviceError> {
        check_model_index(model)?;

        self.exchange(Request::GetBezierLabel { model }, |reply| match reply {
            Reply::BezierLabel { label, .. } => Some(decode_label(&label)),
            _ => None,
        })
        .await
    }

    /// Persists all settings to the non-volatile memory of the device.
    ///
    /// Returns [`DeviceError::CommitRejected`] if the firmware reports a
    /// non-positive status.
    pub async fn commit(&self) -> Result<(), DeviceError> {
        let status = self
            .exchange(Request::Commit, |reply| match reply {
                Reply::Commit { status } => Some(status),
                _ => None,
            })
            .await?;

        if status <= 0 {
            return Err(DeviceError::CommitRejected { status });
        }

        Ok(())
    }

    /// Sends a request within the current session and waits for its reply.
    ///
    /// Replies with a different header, to a different command or with
    /// echoed arguments not matching the request are dropped.
    async fn exchange<R>(
        &self,
        request: Request,
        extract: impl Fn(Reply) -> Option<R>,
    ) -> Result<R, DeviceError> {
        let mut session = self.session.lock().await;
        let header = session.next_header().ok_or(DeviceError::NoSession)?;

        self.correlate(&request.to_bytes(header), |raw| {
            let (reply_header, reply) = Reply::from_bytes(raw)?;
            if reply_header != header || !reply.answers(&request) {
                return None;
            }

            extract(reply)
        })
        .await
    }

    /// Writes a packet and reads incoming packets until `accept` returns a
    /// value or the request timeout has elapsed.
    async fn correlate<R>(
        &self,
        packet: &Report,
        mut accept: impl FnMut(&Report) -> Option<R>,
    ) -> Result<R, DeviceError> {
        let started = Instant::now();
        self.transport.write(packet).await?;

        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(DeviceError::Timeout {
                    elapsed: started.elapsed(),
                });
            }

            let Some(raw) = self.transport.read(Some(remaining)).await? else {
                continue;
            };

            match accept(&raw) {
                Some(value) => return Ok(value),
                None => trace!("dropping unrelated packet: {:02x?}", &raw[..]),
            }
        }
    }
}

fn check_model_index(model: u8) -> Result<(), DeviceError> {
    if usize::from(model) >= MODEL_COUNT {
        return Err(DeviceError::InvalidModelIndex { index: model });
    }

    Ok(())
}

fn random_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce[..]);
    nonce
}

/// Represents an error occurring while talking to a device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Indicates that the underlying transport returned an error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Indicates that no matching reply arrived in time.
    #[error("the device did not reply within {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Indicates that the firmware could not persist its settings.
    #[error("the device rejected the commit with status {status}")]
    CommitRejected { status: i8 },

    /// Indicates that a command was issued before a session was negotiated.
    #[error("no session has been negotiated with the device")]
    NoSession,

    /// Indicates that a label does not fit into a single packet.
    #[error("labels are limited to {max} bytes, got {len}", max = LABEL_LENGTH)]
    LabelTooLong { len: usize },

    /// Indicates that there is no Bezier model with the given index.
    #[error("there is no Bezier model with index {index}")]
    InvalidModelIndex { index: u8 },
}
