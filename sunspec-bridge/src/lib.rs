//! A Shelly Pro 3EM to SunSpec meter bridge built on [tokio-modbus](https://github.com/slowtec/tokio-modbus).
//!
//! The bridge polls a Shelly three-phase energy meter over HTTP, derives the
//! electrical quantities the meter does not report (apparent and reactive
//! power, power factor, line-to-line voltages) and serves them as a SunSpec
//! Model 213 meter over Modbus TCP, so an inverter can use it as its grid
//! meter.
//!
//! ## Pipeline
//!
//! - [`meter`] fetches a [`snapshot::TelemetrySnapshot`],
//! - [`model::derive`] turns it into an [`model::ElectricalModel`],
//! - [`encoder::RegisterEncoder`] lays it out as a [`registers::RegisterImage`],
//! - [`registers::RegisterTable`] publishes the image atomically,
//! - [`server`] answers read holding registers requests from it.
//!
//! [`poller::Poller`] drives the first four steps once per interval.
//!
//! ## Consumer workarounds
//!
//! The register layout targets Fronius inverters, which deviate from the
//! published Model 213 in two ways (see [`layout`]):
//!
//! - energy counters are read as `float32` although documented as `uint32`,
//! - several voltage and power fields are read at other addresses than
//!   documented. When two fields end up on the same register, grid frequency
//!   wins and the other field is not exposed.
//!
//! Register numbers are 1-based SunSpec numbers: the Model 213 header at
//! register 40070 is read with Modbus PDU address 40069.

pub mod codec;
pub mod config;
pub mod encoder;
pub mod layout;
pub mod logging;
pub mod meter;
pub mod model;
pub mod poller;
pub mod registers;
pub mod server;
pub mod snapshot;
