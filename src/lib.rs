//! # Voltage IEC 104
//!
//! High-performance IEC 60870-5-104 master/client implementation for SCADA
//! and substation telecontrol, with the following features:
//!
//! - **Pure codec layer**: bit-exact APCI and ASDU encoding/decoding for the
//!   common monitoring, control and system type identifiers, including
//!   CP56Time2a time tags and quality descriptors
//! - **Full link state machine**: STARTDT/STOPDT/TESTFR handshakes, the
//!   T0..T3 supervision timers and k/w sliding-window acknowledgement, run by
//!   a dedicated I/O task per connection
//! - **Session layer**: command correlation with select-before-execute,
//!   interrogation scheduling and a bounded spontaneous-data queue
//! - **Driver registry**: one client per `(IP, port, COA)` with periodic
//!   device readers feeding a host data sink
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use voltage_iec104::{
//!     CommandValue, DeviceSettings, Iec104Driver, MeasurementSink, PointUpdate,
//! };
//!
//! struct PrintSink;
//!
//! #[async_trait::async_trait]
//! impl MeasurementSink for PrintSink {
//!     async fn store(&self, updates: Vec<PointUpdate>) {
//!         for update in updates {
//!             println!("{} = {:?}", update.address, update.element);
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = DeviceSettings::from_device_string("192.168.1.50|2404|1|12|8|30|15|10|20|20|300|");
//!     let driver = Iec104Driver::new();
//!     driver.add_device(&settings);
//!
//!     let reader = driver.create_reader(settings, Arc::new(PrintSink))?;
//!     reader.start().await;
//!
//!     // Switch a breaker with select-before-execute.
//!     reader.send_command(6001, CommandValue::Single(true), true).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     reader.stop().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod asdu;
pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod frame;
pub mod reader;
pub mod time;
pub mod types;

pub use address::{DataCategory, Iec104Address};
pub use asdu::{Asdu, Element, InformationObject};
pub use client::{ClientConfig, ClientStatistics, CommandValue, Iec104Client, PointUpdate};
pub use config::{BlockMode, BlockRange, DeviceSettings};
pub use connection::{Connection, ConnectionConfig, ConnectionStats, LinkEvent, LinkState};
pub use driver::Iec104Driver;
pub use error::{Iec104Error, Result};
pub use frame::{Apci, Apdu, ApduCodec, UFunction};
pub use reader::{DeviceReader, MeasurementSink, ReaderStatus};
pub use types::{Cause, Cot, Dpi, Qds, StepDirection, TypeId};
