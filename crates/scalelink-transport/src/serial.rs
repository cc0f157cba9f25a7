//! Legacy USB-serial adapter.
//!
//! The `serialport` API is blocking, so a dedicated reader runs under
//! [`tokio::task::spawn_blocking`] and pushes chunks into the inbound
//! channel.  Writes go through a cloned port handle.
//!
//! When a port cannot be opened because the capability is missing (no such
//! device, permission denied) and a [`ManualFeed`] is attached, the adapter
//! switches to the paste-based input path instead of failing.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scalelink_types::{ConnectionConfig, TransportEndpoint, TransportError, TransportKind};
use serialport::SerialPort;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manual::ManualFeed;
use crate::transport::{Endpoint, Inbound, InboundSender, Transport, inbound_channel};

/// Read timeout on the port; bounds how long the reader takes to notice a
/// stop request.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

const READ_BUFFER: usize = 1024;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

enum Link {
    Port {
        writer: SharedPort,
        stop: Arc<AtomicBool>,
    },
    Manual {
        task: JoinHandle<()>,
    },
}

/// Serial adapter.  See the module docs.
pub struct SerialTransport {
    manual: Option<ManualFeed>,
    link: Option<Link>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            manual: None,
            link: None,
        }
    }

    /// Fall back to `feed` when the serial capability is unavailable.
    pub fn with_manual_fallback(mut self, feed: ManualFeed) -> Self {
        self.manual = Some(feed);
        self
    }

    /// `true` when the open link is the manual feed rather than a port.
    pub fn is_manual(&self) -> bool {
        matches!(self.link, Some(Link::Manual { .. }))
    }

    fn fallback_catalog() -> Vec<Endpoint> {
        let names: &[&str] = if cfg!(windows) {
            &["COM1", "COM2", "COM3", "COM4"]
        } else if cfg!(target_os = "macos") {
            &["/dev/cu.usbserial", "/dev/cu.usbmodem"]
        } else {
            &["/dev/ttyUSB0", "/dev/ttyACM0"]
        };
        names
            .iter()
            .map(|n| Endpoint::new(TransportKind::Serial, *n, format!("{n} (not verified)")))
            .collect()
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a `serialport` error onto the transport taxonomy.
pub(crate) fn map_serial_error(err: &serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => TransportError::Unavailable(err.to_string()),
        serialport::ErrorKind::InvalidInput => TransportError::Unavailable(err.to_string()),
        serialport::ErrorKind::Io(kind) => {
            TransportError::from_io(&std::io::Error::new(kind, err.description.clone()))
        }
        serialport::ErrorKind::Unknown => TransportError::Unavailable(err.to_string()),
    }
}

fn is_capability_missing(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Unavailable(_) | TransportError::PermissionDenied(_)
    )
}

fn spawn_reader(mut port: Box<dyn SerialPort>, tx: InboundSender, stop: Arc<AtomicBool>) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER];
        while !stop.load(Ordering::Acquire) {
            match port.read(&mut buffer) {
                Ok(0) => {}
                Ok(n) => {
                    if tx.blocking_send(Ok(buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    let _ = tx.blocking_send(Err(TransportError::from_io(&e)));
                    break;
                }
            }
        }
        debug!("serial reader stopped");
    });
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn list_available(&self) -> Result<Vec<Endpoint>, TransportError> {
        match serialport::available_ports() {
            Ok(ports) => Ok(ports
                .into_iter()
                .map(|p| {
                    let label = match &p.port_type {
                        serialport::SerialPortType::UsbPort(usb) => format!(
                            "{} ({})",
                            p.port_name,
                            usb.product
                                .as_deref()
                                .or(usb.manufacturer.as_deref())
                                .unwrap_or("USB serial")
                        ),
                        _ => p.port_name.clone(),
                    };
                    Endpoint::new(TransportKind::Serial, p.port_name, label)
                })
                .collect()),
            Err(e) => {
                warn!(error = %e, "serial enumeration unavailable; returning static catalog");
                Ok(Self::fallback_catalog())
            }
        }
    }

    async fn open(&mut self, config: &ConnectionConfig) -> Result<Inbound, TransportError> {
        self.close().await?;

        let TransportEndpoint::Serial { port, baud_rate } = &config.endpoint else {
            return Err(TransportError::Unavailable(format!(
                "serial adapter cannot open {}",
                config.endpoint
            )));
        };

        info!(port = %port, baud = baud_rate, "opening serial port");
        let opened = serialport::new(port.as_str(), *baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| map_serial_error(&e));

        let port_handle = match opened {
            Ok(handle) => handle,
            Err(err) => match &self.manual {
                Some(feed) if is_capability_missing(&err) => {
                    warn!(port = %port, error = %err, "serial unavailable; falling back to manual input");
                    let (inbound, task) = feed.attach();
                    self.link = Some(Link::Manual { task });
                    return Ok(inbound);
                }
                _ => return Err(err),
            },
        };

        let reader = port_handle.try_clone().map_err(|e| map_serial_error(&e))?;
        let (tx, rx) = inbound_channel();
        let stop = Arc::new(AtomicBool::new(false));
        spawn_reader(reader, tx, Arc::clone(&stop));

        self.link = Some(Link::Port {
            writer: Arc::new(Mutex::new(port_handle)),
            stop,
        });
        info!(port = %port, "serial port open");
        Ok(rx)
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match &self.link {
            None => Err(TransportError::Unavailable("serial port not open".to_string())),
            Some(Link::Manual { .. }) => {
                debug!(len = bytes.len(), "manual input mode; outbound bytes dropped");
                Ok(())
            }
            Some(Link::Port { writer, .. }) => {
                let writer = Arc::clone(writer);
                let data = bytes.to_vec();
                tokio::task::spawn_blocking(move || {
                    let mut port = writer.lock().map_err(|_| {
                        TransportError::Unavailable("serial writer poisoned".to_string())
                    })?;
                    port.write_all(&data)
                        .and_then(|_| port.flush())
                        .map_err(|e| TransportError::from_io(&e))
                })
                .await
                .map_err(|e| TransportError::Unavailable(format!("serial write task failed: {e}")))?
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.link.take() {
            Some(Link::Port { stop, .. }) => {
                stop.store(true, Ordering::Release);
                info!("serial port closed");
            }
            Some(Link::Manual { task }) => {
                task.abort();
                info!("manual input detached");
            }
            None => {}
        }
        Ok(())
    }
}
