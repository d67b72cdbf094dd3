//! Thread-safe asynchronous client for the HP 3478A multimeter.
//!
//! This module provides a high-level API (`SafeClient` struct) that wraps
//! [`Hp3478a`] in a shared mutex, so the instrument can be driven from
//! several tasks. The instrument cannot interleave conversations: every
//! command/reply pair must complete before the next begins, and the mutex
//! enforces exactly that.
//!
//! All client methods are `async` and must be `.await`ed.

use crate::tokio_async_client::Hp3478a;
use crate::tokio_common::Result;
use crate::transport::Transport;
use crate::{calram, protocol as proto};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Cloneable, mutex-guarded handle to an HP 3478A client.
///
/// Each method takes the lock for the duration of one complete instrument
/// conversation, so concurrent callers are serialized and replies can never
/// be attributed to the wrong command.
#[derive(Debug)]
pub struct SafeClient<T> {
    inner: Arc<Mutex<Hp3478a<T>>>,
}

impl<T> Clone for SafeClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> SafeClient<T> {
    /// Creates a new `SafeClient` owning the given client.
    pub fn new(client: Hp3478a<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(client)),
        }
    }

    /// Creates a new `SafeClient` from an already shared client.
    pub fn from_shared(inner: Arc<Mutex<Hp3478a<T>>>) -> Self {
        Self { inner }
    }

    /// Clones the shared client handle.
    pub fn clone_shared(&self) -> Arc<Mutex<Hp3478a<T>>> {
        self.inner.clone()
    }

    /// Sets the per-operation timeout.
    pub async fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().await.set_timeout(timeout);
    }

    /// Resets the instrument and transitions into the connected state.
    pub async fn connect(&self) -> Result<()> {
        self.inner.lock().await.connect().await
    }

    /// Returns the instrument to local control and disconnects.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.lock().await.disconnect().await
    }

    /// Emulated SCPI identification tuple.
    pub async fn get_id(&self) -> [&'static str; 4] {
        self.inner.lock().await.get_id()
    }

    /// Resets the instrument to its power-on state (Selected Device Clear).
    pub async fn device_clear(&self) -> Result<()> {
        self.inner.lock().await.device_clear().await
    }

    /// Clears the serial poll register.
    pub async fn clear_serial_poll_register(&self) -> Result<()> {
        self.inner.lock().await.clear_serial_poll_register().await
    }

    /// Resets the instrument to DCV, autorange, autozero, single trigger.
    pub async fn reset(&self) -> Result<()> {
        self.inner.lock().await.reset().await
    }

    /// Returns the instrument to local (front panel) control.
    pub async fn local(&self) -> Result<()> {
        self.inner.lock().await.local().await
    }

    /// Selects the measurement function.
    pub async fn set_function(&self, value: proto::FunctionType) -> Result<()> {
        self.inner.lock().await.set_function(value).await
    }

    /// Sets the measurement range.
    pub async fn set_range(&self, value: proto::Range) -> Result<()> {
        self.inner.lock().await.set_range(value).await
    }

    /// Sets the trigger mode.
    pub async fn set_trigger(&self, value: proto::TriggerType) -> Result<()> {
        self.inner.lock().await.set_trigger(value).await
    }

    /// Sets a custom display text or returns the display to measurements.
    pub async fn set_display(&self, value: proto::DisplayType, text: &str) -> Result<()> {
        self.inner.lock().await.set_display(value, text).await
    }

    /// Enables or disables auto-zeroing between readings.
    pub async fn set_autozero(&self, enable: bool) -> Result<()> {
        self.inner.lock().await.set_autozero(enable).await
    }

    /// Sets the number of displayed digits (3 to 5).
    pub async fn set_number_of_digits(&self, digits: u8) -> Result<()> {
        self.inner.lock().await.set_number_of_digits(digits).await
    }

    /// Sets the service request mask.
    pub async fn set_srq_mask(&self, mask: proto::SrqMask) -> Result<()> {
        self.inner.lock().await.set_srq_mask(mask).await
    }

    /// Sets the thermistor parameters for the NTC pseudo-functions.
    pub async fn set_ntc_parameters(&self, parameters: proto::NtcParameters) {
        self.inner.lock().await.set_ntc_parameters(parameters);
    }

    /// Reads a single value.
    pub async fn read(&self) -> Result<f64> {
        self.inner.lock().await.read().await
    }

    /// Produces an unbounded stream of readings. The lock is taken per
    /// item, so other tasks can interleave commands between readings.
    pub fn read_all(&self) -> impl futures::Stream<Item = Result<f64>> {
        let shared = self.inner.clone();
        futures::stream::try_unfold((shared, false), |(shared, started)| async move {
            let value = {
                let mut client = shared.lock().await;
                if !started {
                    client.set_srq_mask(proto::SrqMask::DATA_READY).await?;
                }
                client.wait_data_ready().await?;
                client.read().await?
            };
            Ok(Some((value, (shared, true))))
        })
    }

    /// Reads the 5-byte binary status register.
    pub async fn get_status(&self) -> Result<proto::DmmStatus> {
        self.inner.lock().await.get_status().await
    }

    /// Reads the error register.
    pub async fn get_error_register(&self) -> Result<proto::ErrorFlags> {
        self.inner.lock().await.get_error_register().await
    }

    /// Serial-polls the instrument.
    pub async fn serial_poll(&self) -> Result<proto::SerialPollFlags> {
        self.inner.lock().await.serial_poll().await
    }

    /// Reports whether the front or rear binding posts are active.
    pub async fn get_front_rear_switch_position(&self) -> Result<proto::FrontRearSwitchPosition> {
        self.inner.lock().await.get_front_rear_switch_position().await
    }

    /// Dumps the raw calibration memory.
    pub async fn get_cal_ram_raw(&self) -> Result<Vec<u8>> {
        self.inner.lock().await.get_cal_ram_raw().await
    }

    /// Dumps and decodes the calibration memory.
    pub async fn get_cal_ram(&self) -> Result<calram::CalMemory> {
        self.inner.lock().await.get_cal_ram().await
    }

    /// Writes a raw calibration block to the NVRAM.
    pub async fn set_cal_ram_raw(&self, raw: &[u8]) -> Result<()> {
        self.inner.lock().await.set_cal_ram_raw(raw).await
    }

    /// Encodes and writes calibration records to the NVRAM.
    pub async fn set_cal_ram(&self, memory: &calram::CalMemory) -> Result<()> {
        self.inner.lock().await.set_cal_ram(memory).await
    }
}
