//! `scalelink-transport` – byte-level channels to the weighing indicator.
//!
//! Nothing in this crate knows what the bytes mean.  Each adapter opens a
//! link, pushes inbound chunks into a channel and writes outbound bytes when
//! the Connection Manager asks it to.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`] trait every adapter implements, plus
//!   the [`TransportFactory`] seam used to swap adapters in tests.
//! - [`serial`] – legacy USB-serial via the `serialport` crate, with a
//!   fallback to [`manual`] input when the serial capability is missing.
//! - [`manual`] – paste-based input path: text typed by the operator is fed
//!   in as if it had arrived on the wire.
//! - [`tcp`] – raw TCP socket (USB-as-Ethernet or Wi-Fi).
//! - [`bluetooth`] – Bluetooth LE GATT UART; device matching is always
//!   available, the radio backend needs the `bluetooth` feature.

pub mod bluetooth;
pub mod manual;
pub mod serial;
pub mod tcp;
pub mod transport;

pub use bluetooth::{BluetoothTransport, DeviceChooser, DiscoveredDevice, FirstMatchChooser};
pub use manual::ManualFeed;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use transport::{Endpoint, Inbound, SystemTransports, Transport, TransportFactory};
