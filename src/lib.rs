//! A library for controlling the HP 3478A 5.5 digit bench multimeter via
//! GPIB.
//!
//! This crate provides two main ways to interact with the instrument:
//!
//! 1.  **High-Level, Safe Client**: A stateful, thread-safe client that is easy to share and use in concurrent applications. This is the recommended approach for most users. See [`tokio_async_safe_client::SafeClient`].
//!
//! 2.  **Low-Level Client**: The single-owner [`tokio_async_client::Hp3478a`]
//!     client. Same API without the mutex, for applications that already
//!     serialize access themselves.
//!
//! The instrument speaks plain GPIB; access to the bus goes through the
//! [`transport::Transport`] trait. A ready-made implementation for the
//! Prologix GPIB-Ethernet adapter is provided as
//! [`transport::PrologixTransport`].
//!
//! ## Features
//!
//! - **Protocol Implementation**: Complete command set of the HP 3478A, including the undocumented calibration memory access.
//! - **Stateful, Thread-Safe Client**: For easy and safe concurrent use.
//! - **Calibration Codec**: Bit-exact decoder/encoder for the battery-backed calibration NVRAM, for backups and repairs.
//! - **NTC Thermistor Support**: Pseudo-functions that convert resistance readings to temperature via the Steinhart-Hart equation.
//! - **Strongly-Typed API**: Utilizes Rust's type system for protocol correctness (e.g., `FunctionType`, `Range`, `SrqMask`).
//!
//! ## Quick Start
//!
//! ```no_run
//! use hp3478a_lib::{
//!     protocol::{FunctionType, Range, TriggerType},
//!     tokio_async_client::Hp3478a,
//!     transport::PrologixTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect to the GPIB-Ethernet adapter; the instrument is at GPIB address 27.
//!     let transport = PrologixTransport::connect("192.168.1.100:1234", 27).await?;
//!     let mut dmm = Hp3478a::new(transport);
//!     dmm.connect().await?;
//!
//!     dmm.set_function(FunctionType::Dcv).await?;
//!     dmm.set_range(Range::Auto).await?;
//!     dmm.set_trigger(TriggerType::Internal).await?;
//!
//!     println!("Successfully read: {} V", dmm.read().await?);
//!
//!     dmm.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! For more details, see the documentation for the specific client you wish to use.

pub mod calram;
pub mod protocol;
pub mod tokio_async_client;
pub mod tokio_async_safe_client;
pub mod tokio_common;
pub mod transport;
