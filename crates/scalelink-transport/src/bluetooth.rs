//! Bluetooth LE adapter.
//!
//! Indicators expose a serial-over-GATT ("UART") service: one characteristic
//! notifies inbound bytes, one accepts writes.  Some modules use a single
//! characteristic for both directions.
//!
//! Device matching and characteristic resolution are plain functions that
//! are always compiled.  The radio backend uses `btleplug` and is only built
//! with the `bluetooth` feature; without it every discovery or open reports
//! the capability as unavailable.

use std::sync::Arc;

use async_trait::async_trait;
use scalelink_types::{ConnectionConfig, TransportEndpoint, TransportError, TransportKind};
use uuid::Uuid;

use tracing::info;

use crate::transport::{Endpoint, Inbound, Transport};

// ────────────────────────────────────────────────────────────────────────────
// Well-known UART services
// ────────────────────────────────────────────────────────────────────────────

/// Name prefixes advertised by supported indicators.
pub const DEVICE_NAME_PREFIXES: [&str; 3] = ["XR", "Tru-Test", "5000"];

/// Nordic UART service.
pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Nordic UART RX (central writes here).
pub const NORDIC_UART_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Nordic UART TX (peripheral notifies here).
pub const NORDIC_UART_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// HM-10 style modules: one characteristic in both directions.
pub const HM10_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub const HM10_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Microchip transparent UART.
pub const MICROCHIP_SERVICE: Uuid = Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);
pub const MICROCHIP_TX: Uuid = Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);
pub const MICROCHIP_RX: Uuid = Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);

/// Services used as a scan filter when the user did not name one.
pub const UART_SERVICES: [Uuid; 3] = [NORDIC_UART_SERVICE, HM10_SERVICE, MICROCHIP_SERVICE];

/// `true` when an advertised name belongs to a supported indicator, or to
/// the device the user asked for.
pub fn name_matches(name: &str, wanted: Option<&str>) -> bool {
    let name = name.to_ascii_lowercase();
    match wanted {
        Some(w) if !w.trim().is_empty() => name.starts_with(&w.trim().to_ascii_lowercase()),
        _ => DEVICE_NAME_PREFIXES
            .iter()
            .any(|p| name.starts_with(&p.to_ascii_lowercase())),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Characteristic resolution
// ────────────────────────────────────────────────────────────────────────────

/// The parts of a GATT characteristic that matter for picking a UART pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub notify: bool,
    pub write: bool,
}

/// Which characteristic(s) carry the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartChannels {
    /// One characteristic notifies and accepts writes.
    Single(Uuid),
    /// Separate notify (`rx` from our side) and write (`tx`) characteristics.
    Split { notify: Uuid, write: Uuid },
}

impl UartChannels {
    pub fn notify_uuid(&self) -> Uuid {
        match *self {
            UartChannels::Single(u) => u,
            UartChannels::Split { notify, .. } => notify,
        }
    }

    pub fn write_uuid(&self) -> Uuid {
        match *self {
            UartChannels::Single(u) => u,
            UartChannels::Split { write, .. } => write,
        }
    }
}

/// Pick the UART characteristics out of a discovered GATT table.
///
/// Known vendor layouts win; otherwise the first notify+write
/// characteristic, otherwise the first notify paired with the first write.
pub fn resolve_characteristics(chars: &[CharacteristicInfo]) -> Option<UartChannels> {
    let find = |uuid: Uuid| chars.iter().find(|c| c.uuid == uuid);

    for (notify, write) in [(NORDIC_UART_TX, NORDIC_UART_RX), (MICROCHIP_TX, MICROCHIP_RX)] {
        if let (Some(n), Some(w)) = (find(notify), find(write))
            && n.notify
            && w.write
        {
            return Some(UartChannels::Split { notify, write });
        }
    }
    if let Some(c) = find(HM10_CHARACTERISTIC)
        && c.notify
        && c.write
    {
        return Some(UartChannels::Single(c.uuid));
    }

    if let Some(c) = chars.iter().find(|c| c.notify && c.write) {
        return Some(UartChannels::Single(c.uuid));
    }
    let notify = chars.iter().find(|c| c.notify)?;
    let write = chars.iter().find(|c| c.write)?;
    Some(UartChannels::Split {
        notify: notify.uuid,
        write: write.uuid,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Device selection
// ────────────────────────────────────────────────────────────────────────────

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
    /// Already known to the host (paired or cached) before scanning began.
    pub known: bool,
}

/// Picks a device when no known indicator is available.
///
/// A UI implements this with a picker dialog.  Returning `None` cancels.
pub trait DeviceChooser: Send + Sync {
    fn choose(&self, candidates: &[DiscoveredDevice]) -> Option<usize>;
}

/// Takes the strongest signal, or the first candidate when RSSI is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMatchChooser;

impl DeviceChooser for FirstMatchChooser {
    fn choose(&self, candidates: &[DiscoveredDevice]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(i, d)| (d.rssi.unwrap_or(i16::MIN), std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }
}

/// Known matching devices are reused without asking; otherwise the chooser
/// picks among the matching candidates.
pub fn pick_device(
    devices: &[DiscoveredDevice],
    wanted: Option<&str>,
    chooser: &dyn DeviceChooser,
) -> Option<DiscoveredDevice> {
    let matching: Vec<DiscoveredDevice> = devices
        .iter()
        .filter(|d| name_matches(&d.name, wanted))
        .cloned()
        .collect();

    if let Some(known) = matching.iter().find(|d| d.known) {
        return Some(known.clone());
    }
    let index = chooser.choose(&matching)?;
    matching.get(index).cloned()
}

// ────────────────────────────────────────────────────────────────────────────
// Transport
// ────────────────────────────────────────────────────────────────────────────

/// Bluetooth LE adapter.  See the module docs.
pub struct BluetoothTransport {
    chooser: Arc<dyn DeviceChooser>,
    link: Option<backend::Link>,
}

impl BluetoothTransport {
    pub fn new(chooser: Arc<dyn DeviceChooser>) -> Self {
        Self {
            chooser,
            link: None,
        }
    }
}

fn bluetooth_target(config: &ConnectionConfig) -> Result<(Option<String>, Option<Uuid>), TransportError> {
    match &config.endpoint {
        TransportEndpoint::Bluetooth {
            device_name,
            service_uuid,
        } => Ok((device_name.clone(), *service_uuid)),
        other => Err(TransportError::Unavailable(format!(
            "bluetooth adapter cannot open {other}"
        ))),
    }
}

/// Runs the chooser off the async workers; interactive choosers block.
async fn choose_device(
    devices: Vec<DiscoveredDevice>,
    wanted: Option<String>,
    chooser: Arc<dyn DeviceChooser>,
) -> Result<DiscoveredDevice, TransportError> {
    tokio::task::spawn_blocking(move || pick_device(&devices, wanted.as_deref(), chooser.as_ref()))
        .await
        .map_err(|e| TransportError::Unavailable(format!("device chooser failed: {e}")))?
        .ok_or_else(|| TransportError::Unavailable("no matching bluetooth indicator found".to_string()))
}

#[async_trait]
impl Transport for BluetoothTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    async fn list_available(&self) -> Result<Vec<Endpoint>, TransportError> {
        let devices = backend::discover(&UART_SERVICES).await?;
        Ok(devices
            .into_iter()
            .filter(|d| name_matches(&d.name, None))
            .map(|d| {
                let label = match d.rssi {
                    Some(rssi) => format!("{} ({rssi} dBm)", d.name),
                    None => d.name.clone(),
                };
                Endpoint::new(TransportKind::Bluetooth, d.id, label)
            })
            .collect())
    }

    async fn open(&mut self, config: &ConnectionConfig) -> Result<Inbound, TransportError> {
        self.close().await?;
        let (device_name, service_uuid) = bluetooth_target(config)?;

        let services: Vec<Uuid> = match service_uuid {
            Some(u) => vec![u],
            None => UART_SERVICES.to_vec(),
        };
        let devices = backend::discover(&services).await?;
        let chosen = choose_device(devices, device_name, Arc::clone(&self.chooser)).await?;
        info!(device = %chosen.name, known = chosen.known, "connecting bluetooth indicator");

        let (link, inbound) = backend::connect(&chosen.id).await?;
        self.link = Some(link);
        Ok(inbound)
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match &self.link {
            Some(link) => link.write(bytes).await,
            None => Err(TransportError::Unavailable("bluetooth link not open".to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(not(feature = "bluetooth"))]
mod backend {
    use super::*;

    /// No radio backend: a link can never exist.
    pub(super) enum Link {}

    impl Link {
        pub(super) async fn write(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            match *self {}
        }

        pub(super) async fn shutdown(self) {
            match self {}
        }
    }

    fn unavailable() -> TransportError {
        TransportError::Unavailable(
            "bluetooth support not compiled in (enable the `bluetooth` feature)".to_string(),
        )
    }

    pub(super) async fn discover(_services: &[Uuid]) -> Result<Vec<DiscoveredDevice>, TransportError> {
        Err(unavailable())
    }

    pub(super) async fn connect(_id: &str) -> Result<(Link, Inbound), TransportError> {
        Err(unavailable())
    }
}

#[cfg(feature = "bluetooth")]
mod backend {
    use std::collections::HashSet;
    use std::time::Duration;

    use btleplug::api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    };
    use btleplug::platform::{Adapter, Manager, Peripheral};
    use futures_util::StreamExt;
    use tokio::task::JoinHandle;

    use tracing::{debug, warn};

    use super::*;
    use crate::transport::inbound_channel;

    const SCAN_WINDOW: Duration = Duration::from_secs(4);

    fn map_error(err: btleplug::Error) -> TransportError {
        match err {
            btleplug::Error::PermissionDenied => {
                TransportError::PermissionDenied("bluetooth permission denied".to_string())
            }
            btleplug::Error::DeviceNotFound => {
                TransportError::Unavailable("bluetooth device not found".to_string())
            }
            btleplug::Error::TimedOut(_) => TransportError::Timeout,
            btleplug::Error::NotSupported(what) => TransportError::Unavailable(what),
            other => TransportError::Unreachable(other.to_string()),
        }
    }

    pub(super) struct Link {
        peripheral: Peripheral,
        write_char: Characteristic,
        pump: JoinHandle<()>,
    }

    impl Link {
        pub(super) async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
            let write_type = if self
                .write_char
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
            {
                WriteType::WithoutResponse
            } else {
                WriteType::WithResponse
            };
            self.peripheral
                .write(&self.write_char, bytes, write_type)
                .await
                .map_err(map_error)
        }

        pub(super) async fn shutdown(self) {
            self.pump.abort();
            if let Err(e) = self.peripheral.disconnect().await {
                warn!(error = %e, "bluetooth disconnect failed");
            }
            info!("bluetooth link closed");
        }
    }

    async fn first_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await.map_err(map_error)?;
        manager
            .adapters()
            .await
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unavailable("no bluetooth adapter found".to_string()))
    }

    async fn describe(peripheral: &Peripheral, known: bool) -> Option<DiscoveredDevice> {
        let props = peripheral.properties().await.ok().flatten()?;
        let name = props.local_name?;
        Some(DiscoveredDevice {
            id: peripheral.id().to_string(),
            name,
            rssi: props.rssi,
            known,
        })
    }

    /// Peripherals the host already knows about are marked `known`; the
    /// rest come from a short filtered scan.
    pub(super) async fn discover(services: &[Uuid]) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let adapter = first_adapter().await?;
        let mut devices = Vec::new();
        let mut seen = HashSet::new();
        for p in adapter.peripherals().await.map_err(map_error)? {
            if let Some(d) = describe(&p, true).await {
                seen.insert(d.id.clone());
                devices.push(d);
            }
        }

        adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(map_error)?;
        tokio::time::sleep(SCAN_WINDOW).await;
        if let Err(e) = adapter.stop_scan().await {
            debug!(error = %e, "stop_scan failed");
        }

        for p in adapter.peripherals().await.map_err(map_error)? {
            if let Some(d) = describe(&p, false).await
                && seen.insert(d.id.clone())
            {
                devices.push(d);
            }
        }
        debug!(count = devices.len(), "bluetooth discovery finished");
        Ok(devices)
    }

    pub(super) async fn connect(id: &str) -> Result<(Link, Inbound), TransportError> {
        let peripheral = first_adapter()
            .await?
            .peripherals()
            .await
            .map_err(map_error)?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| TransportError::Unavailable(format!("bluetooth device {id} vanished")))?;

        if !peripheral.is_connected().await.map_err(map_error)? {
            peripheral.connect().await.map_err(map_error)?;
        }
        peripheral.discover_services().await.map_err(map_error)?;

        let table = peripheral.characteristics();
        let infos: Vec<CharacteristicInfo> = table
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                notify: c
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                write: c
                    .properties
                    .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
            })
            .collect();
        let channels = resolve_characteristics(&infos).ok_or_else(|| {
            TransportError::Unavailable("indicator exposes no UART characteristics".to_string())
        })?;

        let lookup = |uuid: Uuid| {
            table
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::Unavailable(format!("characteristic {uuid} missing")))
        };
        let notify_char = lookup(channels.notify_uuid())?;
        let write_char = lookup(channels.write_uuid())?;

        peripheral.subscribe(&notify_char).await.map_err(map_error)?;
        let mut notifications = peripheral.notifications().await.map_err(map_error)?;

        let (tx, rx) = inbound_channel();
        let notify_uuid = notify_char.uuid;
        let pump = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid != notify_uuid {
                    continue;
                }
                if tx.send(Ok(n.value)).await.is_err() {
                    break;
                }
            }
            debug!("bluetooth notification stream ended");
        });

        info!(device = id, ?channels, "bluetooth link open");
        Ok((
            Link {
                peripheral,
                write_char,
                pump,
            },
            rx,
        ))
    }
}
