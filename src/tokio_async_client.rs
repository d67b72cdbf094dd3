//! Asynchronous client for the HP 3478A multimeter.
//!
//! This module provides a high-level API (`Hp3478a` struct) that drives the
//! instrument through any [`Transport`]. It renders commands with the
//! `crate::protocol` module, sequences the write/read pairs the instrument
//! expects and decodes the replies.
//!
//! All operations on one client are strictly sequential: the instrument has
//! no request/response correlation, so a second command must never be put
//! on the wire while a reply is outstanding. Clone-and-share use goes
//! through [`crate::tokio_async_safe_client::SafeClient`].
//!
//! # Example
//!
//! ```no_run
//! use hp3478a_lib::protocol::{FunctionType, Range, TriggerType};
//! use hp3478a_lib::tokio_async_client::Hp3478a;
//! use hp3478a_lib::transport::PrologixTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = PrologixTransport::connect("192.168.1.100:1234", 27).await?;
//!     let mut dmm = Hp3478a::new(transport);
//!     dmm.connect().await?;
//!
//!     dmm.set_function(FunctionType::Dcv).await?;
//!     dmm.set_range(Range::Range30).await?;
//!     dmm.set_trigger(TriggerType::Internal).await?;
//!     println!("reading: {}", dmm.read().await?);
//!
//!     dmm.disconnect().await?;
//!     Ok(())
//! }
//! ```

use crate::protocol as proto;
use crate::tokio_common::{Error, Result};
use crate::transport::Transport;
use crate::{calram, protocol::SerialPollFlags};
use log::{debug, trace};
use std::time::Duration;

/// Default per-operation timeout. The instrument needs up to 10 power line
/// cycles before it can answer during a conversion, so the deadline has to
/// cover that on top of the network round-trip to the adapter.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between serial polls while waiting for data ready.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The slowest reading rate is 1.9 readings/s; give the instrument this
/// long to finish a reading before dropping to local on disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Asynchronous client for the HP 3478A 5.5 digit multimeter.
///
/// The client owns its transport for the whole session and releases it when
/// dropped, no matter how the session ended.
#[derive(Debug)]
pub struct Hp3478a<T> {
    transport: T,
    timeout: Duration,
    connected: bool,
    /// Active NTC pseudo-function, if one was selected. The instrument
    /// itself only knows the underlying resistance mode.
    special_function: Option<proto::FunctionType>,
    ntc_parameters: proto::NtcParameters,
}

impl<T: Transport> Hp3478a<T> {
    /// Creates a client over an already-open transport. Call
    /// [`connect`](Self::connect) before any other operation.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            connected: false,
            special_function: None,
            ntc_parameters: proto::NtcParameters::default(),
        }
    }

    /// Sets the per-operation timeout, covering one write/read pair.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Borrows the underlying transport.
    pub fn transport_ref(&self) -> &T {
        &self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The HP 3478A predates `*IDN?`; this constant emulates the SCPI
    /// identification tuple for compatibility with other drivers.
    pub fn get_id(&self) -> [&'static str; 4] {
        ["HEWLETT-PACKARD", "3478A", "0", "0"]
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Resets the instrument to its power-on state with a Selected Device
    /// Clear, then applies the driver defaults (normal display, no SRQs).
    /// Transitions the client into the connected state.
    pub async fn connect(&mut self) -> Result<()> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.transport.selected_device_clear()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        }
        self.connected = true;
        self.set_display(proto::DisplayType::Normal, "").await?;
        self.set_srq_mask(proto::SrqMask::empty()).await?;
        debug!("instrument connected and reset");
        Ok(())
    }

    /// Returns the instrument to local control and marks the client
    /// disconnected. Idempotent; transport failures during the handover
    /// are ignored so the teardown always completes.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        if self.local().await.is_ok() {
            // Let a reading in progress finish before we let go.
            tokio::time::sleep(DISCONNECT_GRACE).await;
        }
        self.connected = false;
        debug!("instrument disconnected");
        Ok(())
    }

    /// Writes a rendered command to the instrument. Configuration writes
    /// are not acknowledged by the instrument, so this returns as soon as
    /// the write completes.
    async fn write(&mut self, command: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        trace!("command: {command:02x?}");
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.transport.write(command)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Writes a command and reads its reply, either `length` bytes or one
    /// terminated line.
    async fn query(&mut self, command: &[u8], length: Option<usize>) -> Result<Vec<u8>> {
        self.write(command).await?;
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.transport.read(length)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Re-issues the Selected Device Clear. Runs the self-test and resets
    /// the instrument to its power-on state; safe to call at any time.
    pub async fn device_clear(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.transport.selected_device_clear()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Clears the serial poll register (`K`).
    pub async fn clear_serial_poll_register(&mut self) -> Result<()> {
        self.write(proto::CLEAR_SERIAL_POLL_COMMAND).await
    }

    /// Places the instrument in DCV, autorange, autozero, single trigger,
    /// 4.5 digit mode and erases buffered output (`H0`).
    pub async fn reset(&mut self) -> Result<()> {
        self.write(proto::RESET_COMMAND).await
    }

    /// Returns the instrument to local (front panel) control.
    pub async fn local(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.transport.set_local()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Selects the measurement function. The NTC pseudo-functions select
    /// resistance mode on the instrument and enable the thermistor
    /// conversion for subsequent readings.
    pub async fn set_function(&mut self, value: proto::FunctionType) -> Result<()> {
        self.special_function = value.is_ntc().then_some(value);
        self.write(&proto::function_command(value)).await
    }

    /// Sets the measurement range. Which ranges are meaningful depends on
    /// the selected function; the instrument ignores inapplicable ones.
    pub async fn set_range(&mut self, value: proto::Range) -> Result<()> {
        self.write(&proto::range_command(value)).await
    }

    pub async fn set_trigger(&mut self, value: proto::TriggerType) -> Result<()> {
        self.write(&proto::trigger_command(value)).await
    }

    /// Sets a custom display text or returns the display to measurements.
    /// The text is validated before any I/O occurs.
    pub async fn set_display(&mut self, value: proto::DisplayType, text: &str) -> Result<()> {
        let command = proto::display_command(value, text)?;
        self.write(&command).await
    }

    /// Enables or disables auto-zeroing between readings.
    pub async fn set_autozero(&mut self, enable: bool) -> Result<()> {
        self.write(&proto::autozero_command(enable)).await
    }

    /// Sets the number of displayed digits (3 to 5, plus the half digit).
    /// This also selects the integration time. Out-of-range values are
    /// rejected before any write occurs.
    pub async fn set_number_of_digits(&mut self, digits: u8) -> Result<()> {
        let command = proto::number_of_digits_command(digits)?;
        self.write(&command).await
    }

    /// Sets the service request mask: which conditions raise the GPIB SRQ
    /// line.
    pub async fn set_srq_mask(&mut self, mask: proto::SrqMask) -> Result<()> {
        self.write(&proto::srq_mask_command(mask)).await
    }

    /// Sets the thermistor parameters used by the NTC pseudo-functions.
    /// Purely client-side: the instrument has no such command, the
    /// coefficients only configure the resistance-to-temperature
    /// conversion applied to readings.
    pub fn set_ntc_parameters(&mut self, parameters: proto::NtcParameters) {
        self.ntc_parameters = parameters;
    }

    /// Applies the NTC conversion when a pseudo-function is active.
    fn post_process(&self, value: f64) -> Result<f64> {
        if self.special_function.is_some() {
            Ok(self.ntc_parameters.temperature_from_resistance(value)?)
        } else {
            Ok(value)
        }
    }

    /// Reads a single value. The measurement itself is produced according
    /// to the current trigger mode; this waits for the reply line and
    /// decodes it.
    ///
    /// # Errors
    ///
    /// [`Error::Overload`] if the input exceeds the range,
    /// [`Error::Timeout`] if no reply arrives within the deadline.
    pub async fn read(&mut self) -> Result<f64> {
        self.ensure_connected()?;
        let timeout = self.timeout;
        let reply = match tokio::time::timeout(timeout, self.transport.read(None)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };
        match proto::decode_reading(&reply)? {
            proto::Reading::Value(value) => self.post_process(value),
            proto::Reading::Overload => Err(Error::Overload),
        }
    }

    /// Serial-polls until the instrument signals data ready. Fails with
    /// [`Error::NotReady`] when the instrument requests service for a
    /// different condition and with [`Error::Timeout`] when nothing
    /// happens within the deadline.
    pub(crate) async fn wait_data_ready(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let flags = self.serial_poll().await?;
            if flags.contains(SerialPollFlags::SRQ_ON_DATA_READY) {
                return Ok(());
            }
            if flags.contains(SerialPollFlags::SRQ_ON_HAS_SRQ) {
                return Err(Error::NotReady(flags));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Produces an unbounded stream of readings. Enables the data-ready
    /// SRQ and serial-polls before every read so the transport is never
    /// blocked mid-frame; the stream is therefore safe to drop between
    /// items. The per-item deadline is the configured timeout, the stream
    /// as a whole never expires.
    pub fn read_all(&mut self) -> impl futures::Stream<Item = Result<f64>> + '_ {
        futures::stream::try_unfold((self, false), |(client, started)| async move {
            if !started {
                client.set_srq_mask(proto::SrqMask::DATA_READY).await?;
            }
            client.wait_data_ready().await?;
            let value = client.read().await?;
            Ok(Some((value, (client, true))))
        })
    }

    /// Reads the 5-byte binary status register (`B` query).
    ///
    /// When an NTC pseudo-function is active and the instrument is still
    /// in the matching resistance mode, the reported function is the
    /// pseudo-function; if the instrument was switched elsewhere the
    /// pseudo-function is dropped.
    pub async fn get_status(&mut self) -> Result<proto::DmmStatus> {
        // The B reply has no terminator, read exactly 5 bytes.
        let reply = self
            .query(proto::STATUS_QUERY, Some(proto::STATUS_REPLY_LENGTH))
            .await?;
        let mut status = proto::decode_status(&reply)?;
        match self.special_function {
            Some(special) if special.wire_code() == status.function as u8 => {
                status.function = special;
            }
            _ => self.special_function = None,
        }
        Ok(status)
    }

    /// Reads the error register (`E` query), the result of the power-on
    /// self-test.
    pub async fn get_error_register(&mut self) -> Result<proto::ErrorFlags> {
        let reply = self.query(proto::ERROR_REGISTER_QUERY, None).await?;
        Ok(proto::decode_error_register(&reply)?)
    }

    /// Serial-polls the instrument. Use together with the SRQ mask to find
    /// out whether the instrument requested service and why.
    pub async fn serial_poll(&mut self) -> Result<proto::SerialPollFlags> {
        self.ensure_connected()?;
        let timeout = self.timeout;
        let byte = match tokio::time::timeout(timeout, self.transport.serial_poll()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };
        Ok(proto::decode_serial_poll(byte))
    }

    /// Reports whether the front or rear binding posts are active (`S`
    /// query).
    pub async fn get_front_rear_switch_position(
        &mut self,
    ) -> Result<proto::FrontRearSwitchPosition> {
        let reply = self.query(proto::FRONT_REAR_SWITCH_QUERY, None).await?;
        Ok(proto::decode_front_rear_switch(&reply)?)
    }

    /// Dumps the raw calibration memory, one `W` query per address.
    /// Undocumented; useful to back up the calibration before the internal
    /// battery fails.
    pub async fn get_cal_ram_raw(&mut self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(calram::BLOCK_LENGTH);
        for address in 0..=u8::MAX {
            let reply = self
                .query(&proto::cal_read_command(address), Some(1))
                .await?;
            match reply.first() {
                Some(&byte) => raw.push(byte),
                None => {
                    return Err(proto::Error::ReplyLength {
                        expected: 1,
                        actual: reply.len(),
                    }
                    .into());
                }
            }
        }
        Ok(raw)
    }

    /// Dumps and decodes the calibration memory.
    pub async fn get_cal_ram(&mut self) -> Result<calram::CalMemory> {
        let raw = self.get_cal_ram_raw().await?;
        Ok(calram::decode_cal_data(&raw)?)
    }

    /// Writes a raw calibration block to the NVRAM.
    ///
    /// Writing garbage can brick the calibration, so the block length is
    /// validated and the front panel CAL switch is checked first: when the
    /// switch is off the instrument silently drops `X` writes, so this
    /// fails with [`Error::CalRamProtected`] before sending any data.
    pub async fn set_cal_ram_raw(&mut self, raw: &[u8]) -> Result<()> {
        if raw.len() != calram::BLOCK_LENGTH {
            return Err(Error::Calram(calram::Error::BlockLength {
                expected: calram::BLOCK_LENGTH,
                actual: raw.len(),
            }));
        }
        let status = self.get_status().await?;
        if !status.status.contains(proto::StatusFlags::CAL_RAM_ENABLED) {
            return Err(Error::CalRamProtected);
        }
        for (address, &value) in raw.iter().enumerate() {
            self.write(&proto::cal_write_command(address as u8, value))
                .await?;
        }
        debug!("calibration memory written");
        Ok(())
    }

    /// Encodes and writes calibration records to the NVRAM. Checksums are
    /// recomputed from the current gain/offset values.
    pub async fn set_cal_ram(&mut self, memory: &calram::CalMemory) -> Result<()> {
        let raw = calram::encode_cal_data(memory)?;
        self.set_cal_ram_raw(&raw).await
    }
}
