//! Implements HID communication using the `hidapi` crate.
//!
//! `hidapi` only offers blocking calls, so every call runs on the blocking
//! thread pool of tokio.

use std::{
    error::Error,
    ffi::CString,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use hidapi::{HidApi, HidDevice};
use itertools::Itertools;
use sccal::{
    async_trait,
    discovery::{HidBackend, HidDeviceInfo},
    transport::RawHidChannel,
};
use tokio::task;
use tracing::trace;

/// The HID stack of the local machine.
pub struct HidapiBackend {
    api: Arc<Mutex<HidApi>>,
}

impl HidapiBackend {
    pub fn new() -> Result<Self> {
        let api = HidApi::new_without_enumerate().context("could not initialize hidapi")?;

        Ok(Self {
            api: Arc::new(Mutex::new(api)),
        })
    }
}

#[async_trait]
impl HidBackend for HidapiBackend {
    type Channel = HidapiChannel;

    async fn enumerate(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<HidDeviceInfo>, Box<dyn Error + Sync + Send>> {
        let api = Arc::clone(&self.api);

        let infos = task::spawn_blocking(move || {
            let mut api = lock(&api);
            api.refresh_devices()?;

            Ok::<_, hidapi::HidError>(
                api.device_list()
                    .filter(|info| info.vendor_id() == vendor_id && info.product_id() == product_id)
                    .unique_by(|info| info.path().to_owned())
                    .map(|info| HidDeviceInfo {
                        path: info.path().to_string_lossy().into_owned(),
                        vendor_id: info.vendor_id(),
                        product_id: info.product_id(),
                        manufacturer: info.manufacturer_string().map(str::to_owned),
                        product: info.product_string().map(str::to_owned),
                        serial: info.serial_number().map(str::to_owned),
                    })
                    .collect_vec(),
            )
        })
        .await??;

        Ok(infos)
    }

    async fn open(&self, info: &HidDeviceInfo) -> Result<HidapiChannel, Box<dyn Error + Sync + Send>> {
        let api = Arc::clone(&self.api);
        let path = CString::new(info.path.as_str())?;

        let device = task::spawn_blocking(move || lock(&api).open_path(&path)).await??;

        Ok(HidapiChannel {
            path: info.path.clone(),
            device: Arc::new(Mutex::new(device)),
        })
    }
}

/// An open HID device.
pub struct HidapiChannel {
    path: String,
    device: Arc<Mutex<HidDevice>>,
}

#[async_trait]
impl RawHidChannel for HidapiChannel {
    async fn write_report(&self, src: &[u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        let device = Arc::clone(&self.device);
        let data = src.to_vec();

        let written = task::spawn_blocking(move || lock(&device).write(&data)).await??;
        trace!(path = %self.path, written, "wrote report");
        Ok(written)
    }

    async fn read_report(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Box<dyn Error + Sync + Send>> {
        let device = Arc::clone(&self.device);
        let mut data = vec![0u8; buf.len()];
        let millis = timeout_millis(timeout);

        let (read, data) = task::spawn_blocking(move || {
            let read = lock(&device).read_timeout(&mut data, millis)?;
            Ok::<_, hidapi::HidError>((read, data))
        })
        .await??;

        buf[..read].copy_from_slice(&data[..read]);
        Ok(read)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts a read timeout to the whole milliseconds hidapi expects.
///
/// Partial milliseconds are rounded up so a short remaining wait still
/// blocks instead of polling.
fn timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_round_up_to_whole_milliseconds() {
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_micros(300)), 1);
        assert_eq!(timeout_millis(Duration::from_micros(1500)), 2);
        assert_eq!(timeout_millis(Duration::from_millis(2000)), 2000);
        assert_eq!(timeout_millis(Duration::MAX), i32::MAX);
    }
}
