//! REPL – the operator shell around a [`ConnectionManager`].
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /ports [serial|tcp|ble]    – list connection targets
//!   /connect [protocol] [target] – connect (defaults from config)
//!   /disconnect                – close the current session
//!   /status                    – print the connection status
//!   /send <text>               – write raw text to the indicator
//!   /capture <file> [farm] [lot] | stop – append readings to a JSON-lines file
//!   /save                      – persist the current target to config
//!   /quit | /exit              – disconnect and exit
//!
//! Any other line is fed in as if the indicator had sent it, which is how a
//! serial session without a serial port is driven.

use colored::Colorize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use scalelink_runtime::{CaptureContext, ConnectionManager, SessionCapture, resolve_context};
use scalelink_transport::ManualFeed;
use scalelink_types::{ConnectionStatus, ProtocolKind, TransportKind};
use tokio::runtime::Runtime;

use crate::chooser::{Line, LineSource};
use crate::config::{self, Config};
use crate::sink::JsonLinesSink;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Ports(Option<TransportKind>),
    Connect(Vec<String>),
    Disconnect,
    Status,
    Send(String),
    CaptureStart {
        path: PathBuf,
        farm: Option<String>,
        lot: Option<String>,
    },
    CaptureStop,
    Save,
    Quit,
    /// Not a command: text for the manual input path.
    Feed(String),
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if !line.starts_with('/') {
        return Command::Feed(line.to_string());
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };
    match head {
        "/help" => Command::Help,
        "/ports" if rest.is_empty() => Command::Ports(None),
        "/ports" => match rest.parse::<TransportKind>() {
            Ok(kind) => Command::Ports(Some(kind)),
            Err(_) => Command::Invalid(format!("unknown transport '{rest}'")),
        },
        "/connect" => Command::Connect(rest.split_whitespace().map(str::to_string).collect()),
        "/disconnect" => Command::Disconnect,
        "/status" => Command::Status,
        "/send" if rest.is_empty() => Command::Invalid("usage: /send <text>".to_string()),
        "/send" => Command::Send(rest.to_string()),
        "/capture" if rest == "stop" => Command::CaptureStop,
        "/capture" => {
            let mut parts = rest.split_whitespace().map(str::to_string);
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(path), farm, lot, None) => Command::CaptureStart {
                    path: PathBuf::from(path),
                    farm,
                    lot,
                },
                _ => Command::Invalid(
                    "usage: /capture <file> [farm] [lot] | /capture stop".to_string(),
                ),
            }
        }
        "/save" => Command::Save,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command '{other}'")),
    }
}

/// Apply `/connect` arguments on top of `base`.
///
/// Arguments are an optional protocol followed by an optional target:
/// `host:port` for TCP, `ble` or `ble:NAME` for Bluetooth, anything else is
/// a serial port name with an optional `@baud` suffix.  The result must
/// describe a connection the manager would accept.
pub fn apply_connect_args(base: &Config, args: &[String]) -> Result<Config, String> {
    let mut cfg = base.clone();
    let mut rest = args.iter();
    let mut next = rest.next();

    if let Some(arg) = next
        && let Ok(protocol) = arg.parse::<ProtocolKind>()
    {
        cfg.protocol = protocol;
        next = rest.next();
    }

    if let Some(target) = next {
        apply_target(&mut cfg, target)?;
    }
    if let Some(extra) = rest.next() {
        return Err(format!("unexpected argument '{extra}'"));
    }
    cfg.connection().validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn apply_target(cfg: &mut Config, target: &str) -> Result<(), String> {
    let lower = target.to_ascii_lowercase();
    if lower == "ble" || lower == "bluetooth" {
        cfg.transport = TransportKind::Bluetooth;
        cfg.bluetooth_name.clear();
        return Ok(());
    }
    if let Some(name) = lower
        .strip_prefix("ble:")
        .map(|_| &target["ble:".len()..])
    {
        cfg.transport = TransportKind::Bluetooth;
        cfg.bluetooth_name = name.to_string();
        return Ok(());
    }
    if let Some((host, port)) = target.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
        && !host.is_empty()
    {
        cfg.transport = TransportKind::Tcp;
        cfg.host = host.to_string();
        cfg.port = port;
        return Ok(());
    }

    let (port, baud) = match target.split_once('@') {
        Some((port, baud)) => {
            let baud = baud
                .parse::<u32>()
                .map_err(|_| format!("invalid baud rate '{baud}'"))?;
            (port, Some(baud))
        }
        None => (target, None),
    };
    cfg.transport = TransportKind::Serial;
    cfg.serial_port = port.to_string();
    if let Some(baud) = baud {
        cfg.baud_rate = baud;
    }
    Ok(())
}

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Everything the loop needs between commands.
pub struct Shell<'rt> {
    runtime: &'rt Runtime,
    lines: Arc<LineSource>,
    manager: Arc<ConnectionManager>,
    feed: ManualFeed,
    config: Config,
    capture: Option<(SessionCapture, PathBuf)>,
}

impl<'rt> Shell<'rt> {
    pub fn new(
        runtime: &'rt Runtime,
        lines: Arc<LineSource>,
        manager: Arc<ConnectionManager>,
        feed: ManualFeed,
        config: Config,
    ) -> Self {
        Self {
            runtime,
            lines,
            manager,
            feed,
            config,
            capture: None,
        }
    }

    /// Entry point for the interactive REPL.
    ///
    /// `shutdown` is polled while waiting for input; when set the REPL
    /// exits cleanly.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        let mut stdout = io::stdout();

        'repl: loop {
            print!("{} ", "scalelink>".bold().cyan());
            stdout.flush().ok();

            let line = loop {
                if shutdown.load(Ordering::SeqCst) {
                    break 'repl;
                }
                match self.lines.next(SHUTDOWN_POLL) {
                    Line::Text(line) => break line,
                    Line::Idle => continue,
                    Line::Closed => break 'repl,
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_command(&line) {
                Command::Help => cmd_help(),
                Command::Ports(kind) => self.cmd_ports(kind),
                Command::Connect(args) => self.cmd_connect(&args),
                Command::Disconnect => self.runtime.block_on(self.manager.disconnect()),
                Command::Status => print_status_detail(&self.manager.status()),
                Command::Send(text) => self.cmd_send(text),
                Command::CaptureStart { path, farm, lot } => {
                    self.cmd_capture_start(path, farm.as_deref(), lot.as_deref())
                }
                Command::CaptureStop => self.cmd_capture_stop(),
                Command::Save => cmd_save(&self.config),
                Command::Feed(text) => self.cmd_feed(text),
                Command::Quit => {
                    println!("{}", "Goodbye.".green());
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                Command::Invalid(msg) => {
                    println!(
                        "{} {}. Type {} for available commands.",
                        "Error:".red(),
                        msg.yellow(),
                        "/help".bold()
                    );
                }
            }
        }

        self.cmd_capture_stop();
    }

    fn cmd_ports(&self, kind: Option<TransportKind>) {
        let kind = kind.unwrap_or(self.config.transport);
        match self.runtime.block_on(self.manager.list_endpoints(kind)) {
            Ok(endpoints) if endpoints.is_empty() => {
                println!("  No {} targets found.", kind);
            }
            Ok(endpoints) => {
                for ep in endpoints {
                    println!("  • {}  {}", ep.id.bold(), ep.label.dimmed());
                }
            }
            Err(e) => println!("{}: {}", "Listing failed".red(), e),
        }
    }

    fn cmd_connect(&mut self, args: &[String]) {
        let cfg = match apply_connect_args(&self.config, args) {
            Ok(cfg) => cfg,
            Err(e) => {
                println!("{}: {}", "Invalid target".red(), e);
                return;
            }
        };
        let connection = cfg.connection();
        println!(
            "  Connecting to {} ({}) …",
            connection.endpoint.to_string().bold(),
            connection.protocol
        );
        // Failures are reported by the status subscriber.
        if self.runtime.block_on(self.manager.connect(connection)) {
            self.config = cfg;
        }
    }

    fn cmd_send(&self, mut text: String) {
        if !text.ends_with('\n') {
            text.push_str("\r\n");
        }
        if let Err(e) = self
            .runtime
            .block_on(self.manager.send_raw(text.into_bytes()))
        {
            println!("{}: {}", "Send failed".red(), e);
        }
    }

    fn cmd_feed(&self, text: String) {
        if !self.feed.push(text) {
            println!(
                "  {} Manual input is only read by a serial session without a serial port. Type {} for commands.",
                "!".yellow(),
                "/help".bold()
            );
        }
    }

    fn cmd_capture_start(&mut self, path: PathBuf, farm: Option<&str>, lot: Option<&str>) {
        self.cmd_capture_stop();
        let context = match farm {
            None => CaptureContext::default(),
            Some(farm) => match self
                .runtime
                .block_on(resolve_context(&self.config, farm, lot))
            {
                Ok(context) => context,
                Err(e) => {
                    println!("{}: {}", "Capture failed".red(), e);
                    return;
                }
            },
        };
        let sink = match JsonLinesSink::open(&path) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                println!("{}: {}", "Capture failed".red(), e);
                return;
            }
        };
        let _enter = self.runtime.enter();
        let capture = SessionCapture::start(
            self.manager.bus(),
            sink.clone(),
            context.clone(),
            self.manager.config().capture_stable_only,
        );
        println!("  Capturing readings to {}", sink.path().display().to_string().bold());
        if let Some(farm) = &context.farm_id {
            println!(
                "  Tagged farm {}{}",
                farm.cyan(),
                context
                    .lot_id
                    .as_deref()
                    .map(|lot| format!(", lot {}", lot.cyan()))
                    .unwrap_or_default()
            );
        }
        self.capture = Some((capture, path));
    }

    fn cmd_capture_stop(&mut self) {
        if let Some((capture, path)) = self.capture.take() {
            let stats = capture.stop();
            println!(
                "  Capture to {} stopped: {} saved, {} unstable skipped, {} failed",
                path.display(),
                stats.persisted.to_string().green(),
                stats.skipped_unstable,
                stats.failed.to_string().red()
            );
        }
    }
}

fn cmd_save(cfg: &Config) {
    match config::save(cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Available commands:".bold());
    println!("  {}  – show this help", "/help".cyan());
    println!("  {}  – list targets (serial, tcp, bluetooth)", "/ports [kind]".cyan());
    println!(
        "  {}  – e.g. {}, {}, {}",
        "/connect [protocol] [target]".cyan(),
        "/connect adi 192.168.7.1:9000".dimmed(),
        "/connect scp COM4@9600".dimmed(),
        "/connect ascii ble:XR5000".dimmed()
    );
    println!("  {}  – close the current session", "/disconnect".cyan());
    println!("  {}  – show connection status", "/status".cyan());
    println!("  {}  – write raw text to the indicator", "/send <text>".cyan());
    println!(
        "  {}  – append readings to a JSON-lines file, tagged with a configured farm/lot",
        "/capture <file> [farm] [lot] | stop".cyan()
    );
    println!("  {}  – save the current target to config", "/save".cyan());
    println!("  {}  – disconnect and exit", "/quit".cyan());
    println!();
    println!("  Other lines are treated as data pasted from the indicator.");
    println!();
}

fn print_status_detail(status: &ConnectionStatus) {
    println!("  state:     {}", crate::state_label(status));
    if let Some(t) = status.transport {
        println!("  transport: {}", t);
    }
    if let Some(p) = status.protocol {
        println!("  protocol:  {}", p);
    }
    if let Some(at) = status.last_reading_at {
        println!("  last read: {}", at.format("%H:%M:%S"));
    }
    if let Some(raw) = &status.last_response_raw {
        println!("  response:  {}", raw.trim().dimmed());
    }
    if let Some(err) = &status.error {
        println!("  error:     {}", err.red());
    }
}
