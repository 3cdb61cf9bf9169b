//! Implements raw report I/O across HID channels.
//!
//! Every packet of the protocol is exactly [`REPORT_LENGTH`] bytes long. The
//! HID layer expects a report ID in front of it, which is always `0x00` as the
//! firmware does not use numbered reports.

use std::{error::Error, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

/// The length of a single packet, excluding the report ID.
pub const REPORT_LENGTH: usize = 64;

/// The report ID prepended to every outgoing packet.
const REPORT_ID: u8 = 0x00;

/// A single packet as transferred across the wire.
pub type Report = [u8; REPORT_LENGTH];

/// Represents an arbitrary HID communication channel that is both readable and
/// writable. It has to support async I/O.
///
/// Any type this trait is implemented for can be used to talk to the
/// firmware.
#[async_trait]
pub trait RawHidChannel: Send + Sync + 'static {
    /// Writes a raw report, including its leading report ID, to the channel.
    ///
    /// Returns the exact amount of written bytes on success.
    async fn write_report(&self, src: &[u8]) -> Result<usize, Box<dyn Error + Sync + Send>>;

    /// Reads a single input report from the channel, waiting at most
    /// `timeout` for one to arrive.
    ///
    /// If the buffer is not large enough to fit the whole report, its
    /// remainder should be discarded.
    ///
    /// Returns the exact amount of read bytes on success, which is `0` if no
    /// report arrived in time.
    async fn read_report(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Box<dyn Error + Sync + Send>>;
}

/// Moves fixed-length packets across a [`RawHidChannel`].
///
/// Accesses to the underlying channel are serialized, so reads and writes of
/// different tasks never interleave on the wire.
pub struct ReportTransport<T: RawHidChannel> {
    raw: T,
    io: Mutex<()>,
}

impl<T: RawHidChannel> ReportTransport<T> {
    /// Wraps a raw channel.
    pub fn new(raw: T) -> Self {
        Self {
            raw,
            io: Mutex::new(()),
        }
    }

    /// Provides access to the underlying raw channel.
    pub fn raw(&self) -> &T {
        &self.raw
    }

    /// Writes a single packet to the channel.
    ///
    /// Returns [`TransportError::ShortWrite`] if the channel accepted fewer
    /// bytes than the packet plus its report ID.
    pub async fn write(&self, packet: &Report) -> Result<(), TransportError> {
        let mut buf = [0u8; REPORT_LENGTH + 1];
        buf[0] = REPORT_ID;
        buf[1..].copy_from_slice(packet);

        let _io = self.io.lock().await;
        trace!("TX {} bytes: {:02x?}", buf.len(), &buf[1..]);
        let written = self.raw.write_report(&buf).await.map_err(TransportError::Io)?;

        if written < buf.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: buf.len(),
            });
        }

        Ok(())
    }

    /// Reads a single packet from the channel, waiting at most `timeout`.
    ///
    /// A timeout of [`None`] does not wait at all and only returns a packet
    /// that is already queued.
    ///
    /// Returns `Ok(None)` if no packet arrived in time. Reports shorter than
    /// [`REPORT_LENGTH`] are zero-padded.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<Option<Report>, TransportError> {
        let mut buf = [0u8; REPORT_LENGTH];

        let _io = self.io.lock().await;
        let len = self
            .raw
            .read_report(&mut buf, timeout.unwrap_or(Duration::ZERO))
            .await
            .map_err(TransportError::Io)?;

        if len == 0 {
            return Ok(None);
        }

        trace!("RX {} bytes: {:02x?}", len, &buf[..len.min(REPORT_LENGTH)]);
        Ok(Some(buf))
    }
}

/// Represents an error occurring while moving packets across a channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Indicates that the underlying [`RawHidChannel`] returned an error.
    #[error("the HID channel returned an error: {0}")]
    Io(#[source] Box<dyn Error + Sync + Send>),

    /// Indicates that the channel did not accept the whole packet.
    #[error("only {written} of {expected} bytes could be written to the device")]
    ShortWrite { written: usize, expected: usize },
}
