//! Finds and opens devices connected to the local machine.
//!
//! Enumerating and opening HID devices is left to an implementation of
//! [`HidBackend`]. Every device found is opened and greeted with a handshake
//! before it is handed out, so callers only ever see devices ready to accept
//! commands.

use std::{collections::HashSet, error::Error, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::PollConfig,
    device::{DeviceHandle, DeviceIdentity},
    transport::RawHidChannel,
};

/// Describes a HID device as reported by the platform.
///
/// String descriptors that are missing or could not be decoded are [`None`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HidDeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl TryFrom<&HidDeviceInfo> for DeviceIdentity {
    type Error = EncodingError;

    fn try_from(info: &HidDeviceInfo) -> Result<Self, Self::Error> {
        let require = |value: &Option<String>, field: &'static str| {
            value.clone().ok_or_else(|| EncodingError {
                path: info.path.clone(),
                field,
            })
        };

        Ok(Self {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            organization: require(&info.manufacturer, "manufacturer")?,
            name: require(&info.product, "product")?,
            uuid: info.path.clone(),
            serial: require(&info.serial, "serial number")?,
        })
    }
}

/// Represents a platform HID stack able to enumerate and open devices.
#[async_trait]
pub trait HidBackend: Send + Sync + 'static {
    /// The channel type of opened devices.
    type Channel: RawHidChannel;

    /// Lists all connected devices with the given vendor and product ID.
    ///
    /// The same path may be listed more than once.
    async fn enumerate(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<HidDeviceInfo>, Box<dyn Error + Sync + Send>>;

    /// Opens a previously enumerated device.
    async fn open(&self, info: &HidDeviceInfo) -> Result<Self::Channel, Box<dyn Error + Sync + Send>>;
}

/// Searches for devices that are not open yet and opens them.
///
/// Devices whose path matches the [`DeviceIdentity::uuid`] of a handle in
/// `existing` are skipped. Devices that cannot be opened, report undecodable
/// strings or do not complete the handshake are skipped as well.
///
/// Returns only the newly opened handles, each with an established session.
pub async fn discover<B: HidBackend>(
    backend: &B,
    config: &PollConfig,
    existing: Option<&[Arc<DeviceHandle<B::Channel>>]>,
) -> Result<Vec<Arc<DeviceHandle<B::Channel>>>, DiscoveryError> {
    let candidates = backend
        .enumerate(config.vendor_id, config.product_id)
        .await
        .map_err(DiscoveryError::Backend)?;

    let mut seen = HashSet::<String>::with_capacity(candidates.len());
    let mut opened = Vec::new();

    for info in candidates {
        if !seen.insert(info.path.clone()) {
            continue;
        }

        let already_open = existing.is_some_and(|handles| {
            handles
                .iter()
                .any(|handle| handle.identity().uuid == info.path)
        });
        if already_open {
            debug!(path = %info.path, "device is already open");
            continue;
        }

        let channel = match backend.open(&info).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(path = %info.path, %err, "could not open device");
                continue;
            },
        };

        let identity = match DeviceIdentity::try_from(&info) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%err, "skipping device");
                continue;
            },
        };

        let handle = DeviceHandle::new(identity, channel).with_timeout(config.request_timeout);
        match handle.get_new_communications_id().await {
            Ok(communications_id) => {
                info!(
                    serial = %handle.identity().serial,
                    path = %info.path,
                    communications_id,
                    "opened device"
                );
                opened.push(Arc::new(handle));
            },
            Err(err) => warn!(path = %info.path, %err, "handshake failed"),
        }
    }

    Ok(opened)
}

/// Indicates that a string descriptor of a device could not be decoded.
#[derive(Debug, Error)]
#[error("the {field} of {path} could not be decoded")]
pub struct EncodingError {
    pub path: String,
    pub field: &'static str,
}

/// Represents an error occurring while searching for devices.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Indicates that the backend could not enumerate devices.
    #[error("could not enumerate HID devices: {0}")]
    Backend(#[source] Box<dyn Error + Sync + Send>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedBackend, SimulatedDevice};

    #[tokio::test(start_paused = true)]
    async fn opens_all_devices() -> Result<(), DiscoveryError> {
        let backend = SimulatedBackend::new();
        backend.add_device("sim-0", "SC-0001");
        backend.add_device("sim-1", "SC-0002");

        let handles = discover(&backend, &PollConfig::default(), None).await?;
        assert_eq!(handles.len(), 2);

        for handle in &handles {
            assert!(handle.communications_id().await.is_some());
            assert_eq!(handle.identity().organization, "SC");
        }
        assert_eq!(handles[0].identity().serial, "SC-0001");
        assert_eq!(handles[1].identity().uuid, "sim-1");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn skips_open_devices() -> Result<(), DiscoveryError> {
        let backend = SimulatedBackend::new();
        backend.add_device("sim-0", "SC-0001");

        let config = PollConfig::default();
        let first = discover(&backend, &config, None).await?;
        assert_eq!(first.len(), 1);

        let second = discover(&backend, &config, Some(first.as_slice())).await?;
        assert!(second.is_empty());

        backend.add_device("sim-1", "SC-0002");
        let third = discover(&backend, &config, Some(first.as_slice())).await?;
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].identity().serial, "SC-0002");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn skips_undecodable_and_silent_devices() -> Result<(), DiscoveryError> {
        let backend = SimulatedBackend::new();
        backend.plug(SimulatedDevice::new("sim-0", "SC-0001").without_serial());
        let silent = backend.add_device("sim-1", "SC-0002");
        silent.set_refuse_handshake(true);
        backend.add_device("sim-2", "SC-0003");

        let handles = discover(&backend, &PollConfig::default(), None).await?;
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].identity().serial, "SC-0003");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_paths_are_opened_once() -> Result<(), DiscoveryError> {
        let backend = SimulatedBackend::new();
        let device = backend.add_device("sim-0", "SC-0001");
        backend.plug(device);

        let handles = discover(&backend, &PollConfig::default(), None).await?;
        assert_eq!(handles.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_strings_are_encoding_errors() {
        let info = SimulatedDevice::new("sim-0", "SC-0001")
            .without_serial()
            .info()
            .clone();

        let err = DeviceIdentity::try_from(&info).expect_err("the serial is missing");
        assert_eq!(err.field, "serial number");
        assert_eq!(err.to_string(), "the serial number of sim-0 could not be decoded");
    }
}
