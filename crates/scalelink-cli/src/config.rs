//! Reads/writes `~/.scalelink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use scalelink_runtime::{CaptureError, Farm, Lot, ManagerConfig, ReferenceSource};
use scalelink_types::{
    ConnectionConfig, DEFAULT_ADI_HOST, DEFAULT_ADI_PORT, DEFAULT_BAUD_RATE, ProtocolKind,
    TransportKind,
};
use serde::{Deserialize, Serialize};

/// Persisted operator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    #[serde(default = "default_protocol")]
    pub protocol: ProtocolKind,

    /// Indicator address for TCP transports.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_serial_port")]
    pub serial_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Bluetooth name (or prefix) to look for; empty accepts any XR device.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bluetooth_name: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// `/capture` writes stable readings only.
    #[serde(default = "default_true")]
    pub capture_stable_only: bool,

    /// Farms and lots `/capture` can tag readings with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub farms: Vec<Farm>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lots: Vec<Lot>,
}

fn default_transport() -> TransportKind {
    TransportKind::Tcp
}
fn default_protocol() -> ProtocolKind {
    ProtocolKind::Adi
}
fn default_host() -> String {
    DEFAULT_ADI_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_ADI_PORT
}
fn default_serial_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_connect_timeout_secs() -> u64 {
    8
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            bluetooth_name: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            capture_stable_only: default_true(),
            farms: Vec::new(),
            lots: Vec::new(),
        }
    }
}

impl Config {
    /// The connection these settings describe.
    pub fn connection(&self) -> ConnectionConfig {
        match self.transport {
            TransportKind::Tcp => ConnectionConfig::tcp(&self.host, self.port, self.protocol),
            TransportKind::Serial => {
                ConnectionConfig::serial(&self.serial_port, self.baud_rate, self.protocol)
            }
            TransportKind::Bluetooth => {
                let name = (!self.bluetooth_name.is_empty()).then(|| self.bluetooth_name.clone());
                ConnectionConfig::bluetooth(name, self.protocol)
            }
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            capture_stable_only: self.capture_stable_only,
            ..ManagerConfig::default()
        }
    }
}

/// The farm/lot catalog lives in the config file.
#[async_trait]
impl ReferenceSource for Config {
    async fn farms(&self) -> Result<Vec<Farm>, CaptureError> {
        Ok(self.farms.clone())
    }

    async fn lots(&self, farm_id: &str) -> Result<Vec<Lot>, CaptureError> {
        Ok(self
            .lots
            .iter()
            .filter(|l| l.farm_id == farm_id)
            .cloned()
            .collect())
    }
}

/// `~/.scalelink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".scalelink").join("config.toml")
}

/// `None` when no config file exists yet.  Environment overrides apply on
/// top of the file.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SCALELINK_*` environment overrides.
///
/// | Variable | Config field |
/// |---|---|
/// | `SCALELINK_TRANSPORT` | `transport` |
/// | `SCALELINK_PROTOCOL` | `protocol` |
/// | `SCALELINK_HOST` | `host` |
/// | `SCALELINK_PORT` | `port` |
/// | `SCALELINK_SERIAL_PORT` | `serial_port` |
/// | `SCALELINK_BAUD` | `baud_rate` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SCALELINK_TRANSPORT")
        && let Ok(kind) = v.parse::<TransportKind>()
    {
        cfg.transport = kind;
    }
    if let Ok(v) = std::env::var("SCALELINK_PROTOCOL")
        && let Ok(kind) = v.parse::<ProtocolKind>()
    {
        cfg.protocol = kind;
    }
    if let Ok(v) = std::env::var("SCALELINK_HOST")
        && !v.trim().is_empty()
    {
        cfg.host = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("SCALELINK_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Ok(v) = std::env::var("SCALELINK_SERIAL_PORT")
        && !v.trim().is_empty()
    {
        cfg.serial_port = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("SCALELINK_BAUD")
        && let Ok(baud) = v.parse::<u32>()
    {
        cfg.baud_rate = baud;
    }
}

pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Write `cfg`, owner-only on Unix (directory 0700, file 0600).
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scalelink_types::TransportEndpoint;

    #[test]
    fn default_config_targets_usb_ethernet_adi() {
        let cfg = Config::default();
        assert_eq!(
            cfg.connection(),
            ConnectionConfig::tcp("192.168.7.1", 9000, ProtocolKind::Adi)
        );
        assert_eq!(cfg.manager_config().connect_timeout, Duration::from_secs(8));
    }

    #[test]
    fn serial_and_bluetooth_connections() {
        let cfg = Config {
            transport: TransportKind::Serial,
            protocol: ProtocolKind::Scp,
            serial_port: "COM4".into(),
            ..Config::default()
        };
        assert_eq!(
            cfg.connection().endpoint,
            TransportEndpoint::Serial {
                port: "COM4".into(),
                baud_rate: 9600
            }
        );

        let cfg = Config {
            transport: TransportKind::Bluetooth,
            ..Config::default()
        };
        assert!(matches!(
            cfg.connection().endpoint,
            TransportEndpoint::Bluetooth {
                device_name: None,
                ..
            }
        ));
    }

    #[test]
    fn roundtrip_through_toml_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            transport: TransportKind::Serial,
            protocol: ProtocolKind::Ascii,
            bluetooth_name: "XR5000".into(),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.transport, TransportKind::Serial);
        assert_eq!(loaded.protocol, ProtocolKind::Ascii);
        assert_eq!(loaded.bluetooth_name, "XR5000");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "protocol = \"scp\"\n").expect("write");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.protocol, ProtocolKind::Scp);
        assert_eq!(loaded.port, 9000);
        assert!(loaded.capture_stable_only);
    }

    #[tokio::test]
    async fn farm_catalog_resolves_capture_context() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[[farms]]
id = "F1"
name = "Home Block"

[[lots]]
id = "L7"
farm_id = "F1"
name = "Weaners"

[[lots]]
id = "L8"
farm_id = "F2"
name = "Weaners"
"#,
        )?;
        let cfg = load_from(&path)?.ok_or("config missing")?;

        let ctx = scalelink_runtime::resolve_context(&cfg, "home block", Some("weaners")).await?;
        assert_eq!(ctx.farm_id.as_deref(), Some("F1"));
        assert_eq!(ctx.lot_id.as_deref(), Some("L7"));

        let err = scalelink_runtime::resolve_context(&cfg, "F2", None).await.unwrap_err();
        assert!(matches!(err, CaptureError::UnknownReference { kind: "farm", .. }));
        Ok(())
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_scalelink_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".scalelink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let parent = path.parent().expect("parent");
        let dir_mode = std::fs::metadata(parent).expect("meta").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    // Each override test uses its own variable so parallel tests do not race.

    #[test]
    fn env_override_changes_protocol() {
        // SAFETY: only this test touches SCALELINK_PROTOCOL.
        unsafe { std::env::set_var("SCALELINK_PROTOCOL", "scp") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.protocol, ProtocolKind::Scp);
        unsafe { std::env::remove_var("SCALELINK_PROTOCOL") };
    }

    #[test]
    fn env_override_changes_host() {
        // SAFETY: only this test touches SCALELINK_HOST.
        unsafe { std::env::set_var("SCALELINK_HOST", "10.1.1.20") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.host, "10.1.1.20");
        unsafe { std::env::remove_var("SCALELINK_HOST") };
    }

    #[test]
    fn env_override_ignores_invalid_baud() {
        // SAFETY: only this test touches SCALELINK_BAUD.
        unsafe { std::env::set_var("SCALELINK_BAUD", "fast") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.baud_rate, 9600);
        unsafe { std::env::remove_var("SCALELINK_BAUD") };
    }
}
