use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Factory IP address of the XR5000 when attached as USB-Ethernet.
pub const DEFAULT_ADI_HOST: &str = "192.168.7.1";
/// Port the indicator's ADI REST server listens on.
pub const DEFAULT_ADI_PORT: u16 = 9000;
/// Baud rate used by the indicator's legacy USB-serial port.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

// ────────────────────────────────────────────────────────────────────────────
// Transport / protocol selection
// ────────────────────────────────────────────────────────────────────────────

/// Byte-level channel used to reach the indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Legacy USB-serial (virtual COM port).
    Serial,
    /// TCP socket (USB-as-Ethernet or Wi-Fi).
    Tcp,
    /// Bluetooth LE GATT UART-style service.
    Bluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" | "usb" => Ok(TransportKind::Serial),
            "tcp" | "wifi" | "socket" => Ok(TransportKind::Tcp),
            "bluetooth" | "ble" => Ok(TransportKind::Bluetooth),
            other => Err(ScaleError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

/// Device protocol spoken over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Animal Data Interface: HTTP REST with XML or JSON bodies.
    Adi,
    /// Serial Command Protocol: `{XX}` commands, bracketed replies.
    Scp,
    /// Free-form ASCII lines carrying weight / ID tokens.
    Ascii,
}

impl ProtocolKind {
    /// `true` when this protocol can run over `transport`.
    ///
    /// ADI is HTTP and therefore needs TCP; SCP and ASCII are line protocols
    /// that work over any byte channel.
    pub fn supports(self, transport: TransportKind) -> bool {
        match self {
            ProtocolKind::Adi => transport == TransportKind::Tcp,
            ProtocolKind::Scp | ProtocolKind::Ascii => true,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Adi => write!(f, "adi"),
            ProtocolKind::Scp => write!(f, "scp"),
            ProtocolKind::Ascii => write!(f, "ascii"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adi" | "rest" => Ok(ProtocolKind::Adi),
            "scp" => Ok(ProtocolKind::Scp),
            "ascii" | "raw" => Ok(ProtocolKind::Ascii),
            other => Err(ScaleError::Config(format!("unknown protocol '{other}'"))),
        }
    }
}

/// Transport-specific addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportEndpoint {
    Serial { port: String, baud_rate: u32 },
    Tcp { host: String, port: u16 },
    Bluetooth {
        /// Exact or prefix name of the indicator; `None` accepts any device
        /// of the XR family.
        device_name: Option<String>,
        /// Restrict discovery to this GATT service.
        service_uuid: Option<Uuid>,
    },
}

impl TransportEndpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportEndpoint::Serial { .. } => TransportKind::Serial,
            TransportEndpoint::Tcp { .. } => TransportKind::Tcp,
            TransportEndpoint::Bluetooth { .. } => TransportKind::Bluetooth,
        }
    }
}

impl fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEndpoint::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            TransportEndpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            TransportEndpoint::Bluetooth { device_name, .. } => {
                write!(f, "ble:{}", device_name.as_deref().unwrap_or("*"))
            }
        }
    }
}

/// User-selected connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub protocol: ProtocolKind,
    pub endpoint: TransportEndpoint,
}

impl ConnectionConfig {
    pub fn tcp(host: impl Into<String>, port: u16, protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            endpoint: TransportEndpoint::Tcp {
                host: host.into(),
                port,
            },
        }
    }

    pub fn serial(port: impl Into<String>, baud_rate: u32, protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            endpoint: TransportEndpoint::Serial {
                port: port.into(),
                baud_rate,
            },
        }
    }

    pub fn bluetooth(device_name: Option<String>, protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            endpoint: TransportEndpoint::Bluetooth {
                device_name,
                service_uuid: None,
            },
        }
    }

    /// ADI over the indicator's default USB-Ethernet address.
    pub fn default_adi() -> Self {
        Self::tcp(DEFAULT_ADI_HOST, DEFAULT_ADI_PORT, ProtocolKind::Adi)
    }

    pub fn transport(&self) -> TransportKind {
        self.endpoint.kind()
    }

    /// Check the protocol/transport pairing and the transport fields.
    pub fn validate(&self) -> Result<(), ScaleError> {
        if !self.protocol.supports(self.transport()) {
            return Err(ScaleError::Config(format!(
                "protocol {} cannot run over {} (ADI requires tcp)",
                self.protocol,
                self.transport()
            )));
        }
        match &self.endpoint {
            TransportEndpoint::Serial { port, baud_rate } => {
                if port.trim().is_empty() {
                    return Err(ScaleError::Config("serial port name is empty".to_string()));
                }
                if *baud_rate == 0 {
                    return Err(ScaleError::Config("baud rate must be non-zero".to_string()));
                }
            }
            TransportEndpoint::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(ScaleError::Config("tcp host is empty".to_string()));
                }
                if *port == 0 {
                    return Err(ScaleError::Config("tcp port must be non-zero".to_string()));
                }
            }
            TransportEndpoint::Bluetooth { .. } => {}
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} over {} ({})", self.protocol, self.transport(), self.endpoint)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Readings
// ────────────────────────────────────────────────────────────────────────────

/// A candidate reading as decoded from the wire, before validation.
///
/// Codecs produce these; only the normalizer turns them into a
/// [`ScaleReading`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub weight: Option<f64>,
    pub visual_id: Option<String>,
    pub electronic_id: Option<String>,
    pub stable: bool,
    pub source_raw: String,
}

impl RawReading {
    pub fn weight(weight: f64, stable: bool, source_raw: impl Into<String>) -> Self {
        Self {
            weight: Some(weight),
            stable,
            source_raw: source_raw.into(),
            ..Self::default()
        }
    }

    /// Electronic ID if present, otherwise the visual ID.
    pub fn animal_id(&self) -> Option<&str> {
        self.electronic_id.as_deref().or(self.visual_id.as_deref())
    }
}

/// One weighing event as reported by the indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleReading {
    /// Kilograms; always finite and > 0.
    pub weight: f64,
    pub visual_id: Option<String>,
    pub electronic_id: Option<String>,
    pub stable: bool,
    /// Receipt time on this side; the device clock is not trusted.
    pub timestamp: DateTime<Utc>,
    pub source_raw: String,
}

impl ScaleReading {
    /// Electronic ID if present, otherwise the visual ID.
    pub fn animal_id(&self) -> Option<&str> {
        self.electronic_id.as_deref().or(self.visual_id.as_deref())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection status
// ────────────────────────────────────────────────────────────────────────────

/// Connection Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Connected, but no data within the liveness window.
    Stale,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stale => "stale",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of the connection exposed to consumers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub protocol: Option<ProtocolKind>,
    pub last_response_raw: Option<String>,
    pub error: Option<String>,
    pub last_reading_at: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    /// The idle status every manager starts in and returns to on disconnect.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the delivery bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "scalelink-runtime::manager"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Reading(ScaleReading),
    StatusChanged(ConnectionStatus),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Failure of a transport adapter operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("timeout")]
    Timeout,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl TransportError {
    /// Map an I/O error onto the transport taxonomy.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::ConnectionRefused => TransportError::Refused(err.to_string()),
            ErrorKind::PermissionDenied => TransportError::PermissionDenied(err.to_string()),
            ErrorKind::NotFound | ErrorKind::Unsupported => {
                TransportError::Unavailable(err.to_string())
            }
            _ => TransportError::Unreachable(err.to_string()),
        }
    }
}

/// Device-side configuration problems the ADI server reports instead of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Misconfiguration {
    /// The API documentation (Swagger) page came back instead of data.
    #[serde(rename = "documentation-page-returned")]
    DocumentationPage,
    /// The indicator is set to serve HTTPS only.
    HttpsRequired,
    /// The indicator only accepts public URLs, not the local USB address.
    PublicUrlRequired,
}

impl Misconfiguration {
    /// What the operator has to change on the device.
    pub fn remedy(self) -> &'static str {
        match self {
            Misconfiguration::DocumentationPage => {
                "the device returned its API documentation page instead of data; check the ADI endpoint path"
            }
            Misconfiguration::HttpsRequired => {
                "the device requires HTTPS; disable HTTPS-only mode in the indicator's ADI settings"
            }
            Misconfiguration::PublicUrlRequired => {
                "the device is restricted to public URLs; allow local connections in the indicator's ADI settings"
            }
        }
    }
}

impl fmt::Display for Misconfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.remedy())
    }
}

/// Failure to understand or accept what the device said.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("device misconfigured: {0}")]
    DeviceMisconfigured(Misconfiguration),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}

impl ProtocolError {
    /// `true` when retrying cannot help; the device settings must change.
    pub fn is_actionable(&self) -> bool {
        matches!(self, ProtocolError::DeviceMisconfigured(_))
    }
}

/// A single reading rejected by the normalizer.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("reading has no weight")]
    MissingWeight,

    #[error("weight {0} is not a finite number")]
    NotFinite(f64),

    #[error("weight {0} kg is not positive")]
    NonPositiveWeight(f64),

    #[error("weight {weight} kg exceeds the {max} kg limit")]
    OutOfRange { weight: f64, max: f64 },

    #[error("reading carries neither a visual nor an electronic ID")]
    MissingIdentifier,
}

/// Umbrella error for the scale-communication stack.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScaleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("event bus error: {0}")]
    Channel(String),

    #[error("illegal connection state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
