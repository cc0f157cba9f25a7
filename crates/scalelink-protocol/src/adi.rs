//! ADI – the indicator's Animal Data Interface, a small REST server.
//!
//! The indicator serves plain `http://` on its USB-Ethernet address
//! (`192.168.7.1:9000` by default).  Replies are JSON or XML depending on
//! firmware.  When the device's ADI settings are wrong it answers with a
//! page of its own instead of data: the API documentation (Swagger), an
//! "only https" notice, or an "only public URLs" notice.  Each of those is
//! turned into a distinct [`Misconfiguration`] so the operator knows which
//! setting to change.
//!
//! Redirects are never followed, so an `http://` request is never silently
//! upgraded to TLS.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use scalelink_types::{
    Misconfiguration, ProtocolError, ProtocolKind, RawReading, ScaleError, TransportError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::codec::{Codec, Decoded, parse_weight};
use crate::rules::RuleSet;

/// Endpoints tried by [`AdiClient::reach`], in order.
pub const STATUS_PATHS: [&str; 2] = ["/", "/api/v1/status"];
pub const DEVICE_INFO_PATH: &str = "/api/v1/device";
pub const SESSIONS_PATH: &str = "/api/v1/sessions";
pub const LIVE_WEIGHT_PATH: &str = "/api/v1/weight/live";

const KG_PER_LB: f64 = 0.453_592_37;

// ────────────────────────────────────────────────────────────────────────────
// Device error pages
// ────────────────────────────────────────────────────────────────────────────

/// Ordered rules recognising the device's own error pages.
pub fn misconfiguration_rules() -> RuleSet<Misconfiguration> {
    RuleSet::new()
        .with("https_required", |body: &str| {
            let body = body.to_ascii_lowercase();
            (body.contains("only https") || body.contains("https only"))
                .then_some(Misconfiguration::HttpsRequired)
        })
        .with("public_url_required", |body: &str| {
            body.to_ascii_lowercase()
                .contains("only public url")
                .then_some(Misconfiguration::PublicUrlRequired)
        })
        .with("documentation_page", |body: &str| {
            let body = body.to_ascii_lowercase();
            (body.contains("swagger") || body.contains("animal data transfer rest api"))
                .then_some(Misconfiguration::DocumentationPage)
        })
}

static MISCONFIGURATION_RULES: OnceLock<RuleSet<Misconfiguration>> = OnceLock::new();

/// Classify a response body; `None` means it is not a known error page.
pub fn classify_body(body: &str) -> Option<Misconfiguration> {
    MISCONFIGURATION_RULES
        .get_or_init(misconfiguration_rules)
        .evaluate(body)
        .map(|m| m.value)
}

// ────────────────────────────────────────────────────────────────────────────
// JSON / XML documents
// ────────────────────────────────────────────────────────────────────────────

/// A parsed ADI reply.  XML replies are folded into the same JSON value
/// shape, so both are queried one way.
#[derive(Debug, Clone, PartialEq)]
pub struct Document(Value);

fn xml_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<(/?)([A-Za-z_][\w:.-]*)[^>]*?(/?)>").expect("Invalid XML Tag Regex")
    })
}

/// Elements become object keys, leaf elements become strings, repeated
/// siblings become arrays.  Attributes are ignored.
fn xml_to_value(xml: &str) -> Value {
    fn attach(parent: &mut Map<String, Value>, name: String, value: Value) {
        match parent.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                parent.insert(name, value);
            }
        }
    }
    type Open = (String, Map<String, Value>, String);
    fn close(stack: &mut Vec<Open>) {
        if stack.len() > 1
            && let Some((name, children, text)) = stack.pop()
            && let Some(parent) = stack.last_mut()
        {
            let value = if children.is_empty() {
                Value::String(text.trim().to_string())
            } else {
                Value::Object(children)
            };
            attach(&mut parent.1, name, value);
        }
    }

    let mut stack: Vec<Open> = vec![Default::default()];
    let mut cursor = 0;
    for caps in xml_tag_regex().captures_iter(xml) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        if let Some(open) = stack.last_mut() {
            open.2.push_str(&xml[cursor..whole.start()]);
        }
        cursor = whole.end();
        let name = name.as_str().to_string();

        if !caps[1].is_empty() {
            close(&mut stack);
        } else if !caps[3].is_empty() {
            if let Some(parent) = stack.last_mut() {
                attach(&mut parent.1, name, Value::String(String::new()));
            }
        } else {
            stack.push((name, Map::new(), String::new()));
        }
    }
    // Unclosed elements are folded into their parents.
    while stack.len() > 1 {
        close(&mut stack);
    }
    stack
        .pop()
        .map(|(_, children, _)| Value::Object(children))
        .unwrap_or_default()
}

impl Document {
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        let trimmed = body.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return serde_json::from_str(trimmed)
                .map(Document)
                .map_err(|e| ProtocolError::MalformedResponse(format!("invalid JSON: {e}")));
        }
        if trimmed.starts_with('<') && trimmed.contains("</") {
            return Ok(Document(xml_to_value(trimmed)));
        }
        Err(ProtocolError::MalformedResponse(format!(
            "expected JSON or XML, got {:?}",
            trimmed.chars().take(40).collect::<String>()
        )))
    }

    /// First value under any of `names` (case-insensitive), searched depth
    /// first.
    pub fn field(&self, names: &[&str]) -> Option<String> {
        field(&self.0, names)
    }

    /// Child records: a top-level array, or the array (or single record)
    /// under one of `names`, descending through nested wrappers.
    pub fn items(&self, names: &[&str]) -> Vec<Document> {
        records(&self.0, names).into_iter().map(Document).collect()
    }
}

fn field(v: &Value, names: &[&str]) -> Option<String> {
    let Value::Object(map) = v else {
        return None;
    };
    for name in names {
        let found = map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v);
        match found {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            Some(Value::Bool(b)) => return Some(b.to_string()),
            _ => {}
        }
    }
    map.values().find_map(|child| field(child, names))
}

fn records(v: &Value, names: &[&str]) -> Vec<Value> {
    match v {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| names.iter().any(|n| k.eq_ignore_ascii_case(n)))
            .find_map(|(_, child)| match child {
                Value::Array(items) => Some(items.clone()),
                Value::Object(_) => {
                    let nested = records(child, names);
                    Some(if nested.is_empty() { vec![child.clone()] } else { nested })
                }
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "stable" | "steady"
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Typed replies
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware: Option<String>,
}

impl DeviceInfo {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            model: doc.field(&["model", "modelName", "deviceModel", "name"]),
            serial_number: doc.field(&["serialNumber", "serial_number", "serial"]),
            firmware: doc.field(&["firmware", "firmwareVersion", "version"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: Option<String>,
    pub record_count: Option<u32>,
}

/// Sessions listed by the device.  Entries without an id are skipped.
pub fn parse_sessions(doc: &Document) -> Vec<SessionSummary> {
    doc.items(&["sessions", "session", "items", "item", "data"])
        .iter()
        .filter_map(|item| {
            let id = item.field(&["id", "sessionId", "session_id"])?;
            Some(SessionSummary {
                id,
                name: item.field(&["name", "sessionName", "description"]),
                record_count: item
                    .field(&["recordCount", "records", "count"])
                    .and_then(|c| c.trim().parse().ok()),
            })
        })
        .collect()
}

/// Live weight reply; `None` when the device reports no value.
pub fn parse_live_weight(doc: &Document, source_raw: &str) -> Option<RawReading> {
    let value = doc
        .field(&["weight", "liveWeight", "live_weight", "value"])
        .and_then(|w| parse_weight(&w));
    let electronic_id = doc.field(&["eid", "electronicId", "electronic_id"]);
    let visual_id = doc.field(&["vid", "visualId", "visual_id", "animalId"]);
    if value.is_none() && electronic_id.is_none() && visual_id.is_none() {
        return None;
    }
    let is_lb = doc
        .field(&["unit", "units"])
        .is_some_and(|u| u.trim().to_ascii_lowercase().starts_with("lb"));
    let weight = value.map(|w| if is_lb { w * KG_PER_LB } else { w });
    Some(RawReading {
        weight,
        visual_id: visual_id.filter(|v| !v.trim().is_empty()),
        electronic_id: electronic_id.filter(|v| !v.trim().is_empty()),
        stable: doc
            .field(&["stable", "isStable", "steady"])
            .is_some_and(|s| truthy(&s)),
        source_raw: source_raw.to_string(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Error mapping
// ────────────────────────────────────────────────────────────────────────────

/// Map a `reqwest` failure onto the transport taxonomy, preferring the
/// underlying I/O error kind when there is one.
pub fn map_http_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return TransportError::from_io(io);
        }
        source = inner.source();
    }
    TransportError::Unreachable(err.to_string())
}

fn redirect_target(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ────────────────────────────────────────────────────────────────────────────
// AdiClient
// ────────────────────────────────────────────────────────────────────────────

/// Result of a successful [`AdiClient::reach`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reachability {
    pub path: String,
    pub status: u16,
    pub body: String,
}

/// Async client for one indicator's ADI server.
///
/// Every request carries the client's timeout.
///
/// ```rust,no_run
/// # async fn demo() -> Result<(), scalelink_types::ScaleError> {
/// use std::time::Duration;
/// use scalelink_protocol::adi::AdiClient;
///
/// let client = AdiClient::new("192.168.7.1", 9000, Duration::from_secs(8))?;
/// let reached = client.reach().await?;
/// println!("indicator answered on {}", reached.path);
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct AdiClient {
    base_url: String,
    client: reqwest::Client,
}

impl AdiClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, ScaleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| TransportError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            client,
        })
    }

    async fn fetch(&self, path: &str) -> Result<(StatusCode, Option<String>, String), ScaleError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "adi request");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| map_http_error(&e))?;
        let status = response.status();
        let location = redirect_target(&response);
        let body = response.text().await.map_err(|e| map_http_error(&e))?;
        Ok((status, location, body))
    }

    /// Classify one response.  `Ok(())` means usable data.
    fn check(status: StatusCode, location: Option<&str>, body: &str) -> Result<(), ProtocolError> {
        if status.is_redirection()
            && location.is_some_and(|l| l.trim().to_ascii_lowercase().starts_with("https://"))
        {
            return Err(ProtocolError::DeviceMisconfigured(
                Misconfiguration::HttpsRequired,
            ));
        }
        if let Some(m) = classify_body(body) {
            return Err(ProtocolError::DeviceMisconfigured(m));
        }
        if !status.is_success() {
            return Err(ProtocolError::UnexpectedStatus(status.as_u16()));
        }
        Ok(())
    }

    /// Confirm an ADI server is answering.
    ///
    /// Candidates in [`STATUS_PATHS`] are tried in order; the first 2xx reply
    /// that is not a device error page wins.  HTTPS-only and public-URL-only
    /// pages abort at once since every path will say the same.  A
    /// documentation page moves on to the next path and is what gets
    /// reported if none succeeds.
    pub async fn reach(&self) -> Result<Reachability, ScaleError> {
        let mut documentation_page = false;
        let mut last_error: Option<ProtocolError> = None;

        for path in STATUS_PATHS {
            let (status, location, body) = self.fetch(path).await?;
            match Self::check(status, location.as_deref(), &body) {
                Ok(()) => {
                    info!(path, status = status.as_u16(), "adi indicator reachable");
                    return Ok(Reachability {
                        path: path.to_string(),
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(ProtocolError::DeviceMisconfigured(Misconfiguration::DocumentationPage)) => {
                    warn!(path, "adi returned its documentation page; trying next endpoint");
                    documentation_page = true;
                }
                Err(err @ ProtocolError::DeviceMisconfigured(_)) => {
                    warn!(path, error = %err, "adi device misconfigured");
                    return Err(err.into());
                }
                Err(err) => {
                    debug!(path, error = %err, "adi status path rejected");
                    last_error = Some(err);
                }
            }
        }

        if documentation_page {
            return Err(
                ProtocolError::DeviceMisconfigured(Misconfiguration::DocumentationPage).into(),
            );
        }
        Err(last_error
            .unwrap_or_else(|| ProtocolError::MalformedResponse("no status endpoints".into()))
            .into())
    }

    /// GET `path` and parse it as a JSON/XML document.
    pub async fn get_document(&self, path: &str) -> Result<(Document, String), ScaleError> {
        let (status, location, body) = self.fetch(path).await?;
        Self::check(status, location.as_deref(), &body)?;
        let doc = Document::parse(&body)?;
        Ok((doc, body))
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, ScaleError> {
        let (doc, _) = self.get_document(DEVICE_INFO_PATH).await?;
        Ok(DeviceInfo::from_document(&doc))
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, ScaleError> {
        let (doc, _) = self.get_document(SESSIONS_PATH).await?;
        Ok(parse_sessions(&doc))
    }

    /// Current weight on the platform, if the device reports one.
    pub async fn live_weight(&self) -> Result<Option<RawReading>, ScaleError> {
        let (doc, body) = self.get_document(LIVE_WEIGHT_PATH).await?;
        Ok(parse_live_weight(&doc, body.trim()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Codec view
// ────────────────────────────────────────────────────────────────────────────

/// Decodes a whole ADI response body as one "line".
///
/// Used when ADI bodies reach the decoder through the generic codec path
/// rather than through [`AdiClient`].
#[derive(Debug, Default)]
pub struct AdiLineCodec;

impl AdiLineCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for AdiLineCodec {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Adi
    }

    fn decode(&mut self, body: &str) -> Result<Decoded, ProtocolError> {
        if let Some(m) = classify_body(body) {
            return Err(ProtocolError::DeviceMisconfigured(m));
        }
        let Ok(doc) = Document::parse(body) else {
            return Ok(Decoded::Unrecognized);
        };
        Ok(match parse_live_weight(&doc, body.trim()) {
            Some(r) => Decoded::Reading(r),
            None => Decoded::Unrecognized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering canned responses by path.
    async fn serve(routes: Vec<(&'static str, &'static str, String)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    loop {
                        let Ok(n) = socket.read(&mut buf[read..]).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status_line, body) = routes
                        .iter()
                        .find(|(p, _, _)| *p == path)
                        .map(|(_, s, b)| (s.to_string(), b.clone()))
                        .unwrap_or_else(|| ("404 Not Found".to_string(), String::new()));
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    fn client(port: u16) -> AdiClient {
        AdiClient::new("127.0.0.1", port, Duration::from_secs(3)).expect("client")
    }

    #[test]
    fn error_pages_are_classified_in_order() {
        assert_eq!(
            classify_body("<html>Swagger UI</html>"),
            Some(Misconfiguration::DocumentationPage)
        );
        assert_eq!(
            classify_body("Animal Data Transfer REST API v1"),
            Some(Misconfiguration::DocumentationPage)
        );
        assert_eq!(
            classify_body("Error: only HTTPS is supported"),
            Some(Misconfiguration::HttpsRequired)
        );
        assert_eq!(
            classify_body("only public URLs are supported"),
            Some(Misconfiguration::PublicUrlRequired)
        );
        // HTTPS notice outranks a documentation link on the same page.
        assert_eq!(
            classify_body("only https - see Swagger"),
            Some(Misconfiguration::HttpsRequired)
        );
        assert_eq!(classify_body(r#"{"status":"ok"}"#), None);
    }

    #[test]
    fn live_weight_from_json_and_xml() {
        let json = r#"{"liveWeight": 412.5, "stable": true, "eid": "982000123456789"}"#;
        let doc = Document::parse(json).expect("json");
        let r = parse_live_weight(&doc, json).expect("reading");
        assert_eq!(r.weight, Some(412.5));
        assert!(r.stable);
        assert_eq!(r.electronic_id.as_deref(), Some("982000123456789"));

        let xml = "<LiveWeight><Weight>900</Weight><Unit>lb</Unit><Stable>0</Stable><VID>A12</VID></LiveWeight>";
        let doc = Document::parse(xml).expect("xml");
        let r = parse_live_weight(&doc, xml).expect("reading");
        assert!((r.weight.expect("weight") - 408.233_133).abs() < 1e-3);
        assert!(!r.stable);
        assert_eq!(r.visual_id.as_deref(), Some("A12"));
    }

    #[test]
    fn empty_live_weight_is_none() {
        let doc = Document::parse(r#"{"status":"idle"}"#).expect("json");
        assert!(parse_live_weight(&doc, "").is_none());
    }

    #[test]
    fn sessions_from_json_and_xml() {
        let doc = Document::parse(
            r#"{"sessions":[{"id":"S1","name":"Spring","recordCount":42},{"name":"no id"}]}"#,
        )
        .expect("json");
        let sessions = parse_sessions(&doc);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "S1");
        assert_eq!(sessions[0].record_count, Some(42));

        let doc = Document::parse(
            "<Sessions><Session><Id>7</Id><Name>Weaners</Name></Session><Session><Id>8</Id></Session></Sessions>",
        )
        .expect("xml");
        let sessions = parse_sessions(&doc);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name.as_deref(), Some("Weaners"));
        assert_eq!(sessions[1].id, "8");

        let doc = Document::parse(
            r#"<?xml version="1.0"?><Sessions><Session id="x"><Id>9</Id><Count/></Session></Sessions>"#,
        )
        .expect("xml");
        let sessions = parse_sessions(&doc);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "9");
        assert_eq!(sessions[0].record_count, None);
    }

    #[test]
    fn xml_folds_into_json_shape() {
        let doc = Document::parse(
            "<Device><Model> XR5000 </Model><Ports><Port>1</Port><Port>2</Port></Ports></Device>",
        )
        .expect("xml");
        assert_eq!(
            doc,
            Document(serde_json::json!({
                "Device": {"Model": "XR5000", "Ports": {"Port": ["1", "2"]}}
            }))
        );
        assert_eq!(
            DeviceInfo::from_document(&doc).model.as_deref(),
            Some("XR5000")
        );
    }

    #[test]
    fn plain_text_is_malformed() {
        assert!(matches!(
            Document::parse("hello"),
            Err(ProtocolError::MalformedResponse(_))
        ));
    }

    #[test]
    fn line_codec_rejects_error_pages() {
        let mut codec = AdiLineCodec::new();
        assert_eq!(
            codec.decode("<title>Swagger UI</title>"),
            Err(ProtocolError::DeviceMisconfigured(
                Misconfiguration::DocumentationPage
            ))
        );
        assert!(codec.decode(r#"{"weight": 300}"#).expect("decode").is_reading());
    }

    #[tokio::test]
    async fn reach_accepts_any_2xx_body() -> Result<(), Box<dyn std::error::Error>> {
        let port = serve(vec![("/", "200 OK", "XR5000 ADI".to_string())]).await;
        let outcome = client(port).reach().await?;
        assert_eq!(outcome.path, "/");
        assert_eq!(outcome.status, 200);
        Ok(())
    }

    #[tokio::test]
    async fn reach_falls_through_to_status_path() -> Result<(), Box<dyn std::error::Error>> {
        let port = serve(vec![
            ("/", "200 OK", "<html>Swagger UI</html>".to_string()),
            ("/api/v1/status", "200 OK", r#"{"status":"ok"}"#.to_string()),
        ])
        .await;
        let outcome = client(port).reach().await?;
        assert_eq!(outcome.path, "/api/v1/status");
        Ok(())
    }

    #[tokio::test]
    async fn reach_reports_documentation_page_when_all_fail() {
        let port = serve(vec![(
            "/",
            "200 OK",
            "Animal Data Transfer REST API".to_string(),
        )])
        .await;
        let err = client(port).reach().await.unwrap_err();
        assert_eq!(
            err,
            ScaleError::Protocol(ProtocolError::DeviceMisconfigured(
                Misconfiguration::DocumentationPage
            ))
        );
    }

    #[tokio::test]
    async fn reach_aborts_on_https_only() {
        let port = serve(vec![
            ("/", "403 Forbidden", "Only HTTPS connections allowed".to_string()),
            ("/api/v1/status", "200 OK", "ok".to_string()),
        ])
        .await;
        let err = client(port).reach().await.unwrap_err();
        assert_eq!(
            err,
            ScaleError::Protocol(ProtocolError::DeviceMisconfigured(
                Misconfiguration::HttpsRequired
            ))
        );
    }

    #[tokio::test]
    async fn https_redirect_is_not_followed() {
        let port = serve(vec![(
            "/",
            "301 Moved Permanently\r\nLocation: https://192.168.7.1:9443/",
            String::new(),
        )])
        .await;
        let err = client(port).reach().await.unwrap_err();
        assert_eq!(
            err,
            ScaleError::Protocol(ProtocolError::DeviceMisconfigured(
                Misconfiguration::HttpsRequired
            ))
        );
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let err = client(port).reach().await.unwrap_err();
        assert!(
            matches!(
                err,
                ScaleError::Transport(TransportError::Refused(_) | TransportError::Unreachable(_))
            ),
            "got {err:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn typed_calls_parse_replies() -> Result<(), Box<dyn std::error::Error>> {
        let port = serve(vec![
            (
                DEVICE_INFO_PATH,
                "200 OK",
                r#"{"model":"XR5000","serialNumber":"123","firmware":"2.1"}"#.to_string(),
            ),
            (
                SESSIONS_PATH,
                "200 OK",
                r#"[{"id":"1","name":"Autumn"}]"#.to_string(),
            ),
            (
                LIVE_WEIGHT_PATH,
                "200 OK",
                r#"{"weight":"87.3","stable":false}"#.to_string(),
            ),
        ])
        .await;
        let c = client(port);

        let info = c.device_info().await?;
        assert_eq!(info.model.as_deref(), Some("XR5000"));
        assert_eq!(info.firmware.as_deref(), Some("2.1"));

        let sessions = c.sessions().await?;
        assert_eq!(sessions[0].name.as_deref(), Some("Autumn"));

        let live = c.live_weight().await?.expect("reading");
        assert_eq!(live.weight, Some(87.3));
        assert!(!live.stable);
        Ok(())
    }
}
