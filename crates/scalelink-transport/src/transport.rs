//! The adapter contract.
//!
//! The Connection Manager never speaks to a serial port or socket directly.
//! It asks a [`TransportFactory`] for a [`Transport`] matching the configured
//! [`TransportKind`], opens it, and from then on only sees byte chunks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scalelink_types::{ConnectionConfig, TransportError, TransportKind};
use tokio::sync::mpsc;

use crate::bluetooth::{BluetoothTransport, DeviceChooser, FirstMatchChooser};
use crate::manual::ManualFeed;
use crate::serial::SerialTransport;
use crate::tcp::TcpTransport;

/// Buffered inbound chunks per open link.
pub(crate) const INBOUND_CAPACITY: usize = 256;

/// Push-based stream of inbound data for one open link.
///
/// The channel closing means the link ended; an `Err` item reports why.
pub type Inbound = mpsc::Receiver<Result<Vec<u8>, TransportError>>;

pub(crate) type InboundSender = mpsc::Sender<Result<Vec<u8>, TransportError>>;

pub(crate) fn inbound_channel() -> (InboundSender, Inbound) {
    mpsc::channel(INBOUND_CAPACITY)
}

/// Something a user can pick as a connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: TransportKind,
    /// Port name, `host:port` or Bluetooth peripheral id.
    pub id: String,
    /// Human-readable description for pickers.
    pub label: String,
}

impl Endpoint {
    pub fn new(kind: TransportKind, id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Every byte-level adapter implements this trait.
///
/// # Contract
///
/// * `list_available` – best effort; may return a static catalog when the
///   environment cannot enumerate devices.
/// * `open` – establishes the link and returns the [`Inbound`] stream.
/// * `send` – writes raw bytes to the open link.
/// * `close` – tears the link down; calling it on a closed adapter is a
///   no-op that returns `Ok(())`.
///
/// No method panics on I/O failure: every failure is a [`TransportError`].
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn list_available(&self) -> Result<Vec<Endpoint>, TransportError>;

    async fn open(&mut self, config: &ConnectionConfig) -> Result<Inbound, TransportError>;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Builds a fresh adapter for a transport kind.
pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport>;
}

/// Production factory wiring the real adapters.
#[derive(Clone)]
pub struct SystemTransports {
    connect_timeout: Duration,
    manual: Option<ManualFeed>,
    chooser: Arc<dyn DeviceChooser>,
}

impl SystemTransports {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            manual: None,
            chooser: Arc::new(FirstMatchChooser),
        }
    }

    /// Serial adapters fall back to this feed when no port can be opened.
    pub fn with_manual_feed(mut self, feed: ManualFeed) -> Self {
        self.manual = Some(feed);
        self
    }

    /// Chooser consulted when no paired Bluetooth indicator is found.
    pub fn with_device_chooser(mut self, chooser: Arc<dyn DeviceChooser>) -> Self {
        self.chooser = chooser;
        self
    }
}

impl Default for SystemTransports {
    fn default() -> Self {
        Self::new(Duration::from_secs(8))
    }
}

impl TransportFactory for SystemTransports {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::Serial => {
                let serial = SerialTransport::new();
                match &self.manual {
                    Some(feed) => Box::new(serial.with_manual_fallback(feed.clone())),
                    None => Box::new(serial),
                }
            }
            TransportKind::Tcp => Box::new(TcpTransport::new(self.connect_timeout)),
            TransportKind::Bluetooth => Box::new(BluetoothTransport::new(Arc::clone(&self.chooser))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_matching_kinds() {
        let factory = SystemTransports::default();
        for kind in [TransportKind::Serial, TransportKind::Tcp, TransportKind::Bluetooth] {
            assert_eq!(factory.create(kind).kind(), kind);
        }
    }

    #[tokio::test]
    async fn tcp_catalog_lists_indicator_address() {
        let factory = SystemTransports::default();
        let endpoints = factory
            .create(TransportKind::Tcp)
            .list_available()
            .await
            .expect("static catalog");
        assert!(endpoints.iter().any(|e| e.id == "192.168.7.1:9000"));
    }
}
