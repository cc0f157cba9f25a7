//! `scalelink-cli` – operator shell for livestock weighing indicators.
//!
//! This binary:
//!
//! 1. Loads `~/.scalelink/config.toml`, running a **First-Run Wizard** when
//!    the file is absent.
//! 2. Starts a [`ConnectionManager`] on a Tokio runtime and prints every
//!    reading and status change it publishes.
//! 3. Drops the user into an **interactive REPL** (`/connect`, `/status`,
//!    `/capture`, `/help`, …).
//! 4. Intercepts **Ctrl-C**, then disconnects before exiting.

mod chooser;
mod config;
mod repl;
mod sink;

use colored::{ColoredString, Colorize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use scalelink_runtime::{ConnectionManager, init_tracing};
use scalelink_transport::{ManualFeed, SystemTransports};
use scalelink_types::{ConnectionState, ConnectionStatus, ProtocolKind, ScaleReading, TransportKind};

fn main() {
    // RUST_LOG filters (default "info"); SCALELINK_LOG_FORMAT=json switches
    // to JSON lines.  User-facing output still goes through println!.
    let _telemetry = init_tracing("scalelink");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – disconnecting …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Could not install Ctrl-C handler");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            std::process::exit(1);
        }
    };
    let _enter = runtime.enter();

    // From here on stdin is read by one thread and shared with the
    // Bluetooth picker.
    let lines = chooser::LineSource::stdin();
    let manager_config = cfg.manager_config();
    let feed = ManualFeed::new();
    let transports = SystemTransports::new(manager_config.connect_timeout)
        .with_manual_feed(feed.clone())
        .with_device_chooser(Arc::new(chooser::PromptChooser::new(
            lines.clone(),
            manager_config.connect_timeout,
        )));
    let manager = Arc::new(ConnectionManager::new(manager_config, Arc::new(transports)));
    let _readings = manager.on_reading(print_reading);
    let _status = manager.on_status_changed(print_status);

    println!(
        "  Target: {} over {}  (type {} for commands)",
        cfg.connection().endpoint.to_string().bold(),
        cfg.protocol.to_string().bold(),
        "/help".bold()
    );
    println!();

    repl::Shell::new(&runtime, lines, manager.clone(), feed, cfg).run(shutdown);

    runtime.block_on(manager.disconnect());
    println!("{}", "  ✓ Exiting scalelink.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Event output
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn state_label(status: &ConnectionStatus) -> ColoredString {
    let label = status.state.to_string();
    match status.state {
        ConnectionState::Connected => label.green().bold(),
        ConnectionState::Connecting => label.cyan(),
        ConnectionState::Stale => label.yellow().bold(),
        ConnectionState::Error => label.red().bold(),
        ConnectionState::Idle => label.dimmed(),
    }
}

fn print_status(status: ConnectionStatus) {
    match &status.error {
        Some(err) => println!("\n  ● {}  {}", state_label(&status), err.red()),
        None => println!("\n  ● {}", state_label(&status)),
    }
}

fn print_reading(reading: ScaleReading) {
    let stability = if reading.stable {
        "stable".green()
    } else {
        "moving".yellow()
    };
    let mut line = format!(
        "\n  ⚖  {} kg  {}",
        format!("{:.1}", reading.weight).bold(),
        stability
    );
    if let Some(eid) = &reading.electronic_id {
        line.push_str(&format!("  EID {}", eid.cyan()));
    }
    if let Some(vid) = &reading.visual_id {
        line.push_str(&format!("  VID {}", vid.cyan()));
    }
    println!("{line}");
}

// ─────────────────────────────────────────────────────────────────────────────
// First-run wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      ScaleLink First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's describe your indicator.\n");

    let mut cfg = config::Config::default();

    println!("  How is the indicator connected?");
    println!("    1) USB cable, shows up as a network adapter (default)");
    println!("    2) USB cable, shows up as a COM / tty port");
    println!("    3) Wi-Fi");
    println!("    4) Bluetooth");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    match choice.trim() {
        "2" => {
            cfg.transport = TransportKind::Serial;
            cfg.protocol = ProtocolKind::Scp;
            cfg.serial_port = prompt_line(
                &format!("  Serial port [{}]: ", cfg.serial_port),
                &cfg.serial_port,
            );
        }
        "3" => {
            cfg.transport = TransportKind::Tcp;
            cfg.host = prompt_line("  Indicator IP address: ", &cfg.host);
            let port_str = prompt_line(&format!("  Port [{}]: ", cfg.port), &cfg.port.to_string());
            if let Ok(p) = port_str.trim().parse::<u16>() {
                cfg.port = p;
            }
        }
        "4" => {
            cfg.transport = TransportKind::Bluetooth;
            cfg.protocol = ProtocolKind::Scp;
            cfg.bluetooth_name = prompt_line("  Device name (empty = any XR indicator): ", "");
        }
        _ => {}
    }

    if cfg.transport != TransportKind::Tcp {
        let proto = prompt_line(
            &format!("  Protocol (scp / ascii) [{}]: ", cfg.protocol),
            &cfg.protocol.to_string(),
        );
        match proto.parse::<ProtocolKind>() {
            Ok(ProtocolKind::Adi) => println!("  ADI needs a network connection; keeping {}.", cfg.protocol),
            Ok(p) => cfg.protocol = p,
            Err(e) => println!("  {}; keeping {}.", e, cfg.protocol),
        }
    }

    config::apply_env_overrides(&mut cfg);
    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____         __    __   _      __   "#.bold().cyan());
    println!("{}", r#"  / __/______ _/ /__ / /  (_)__  / /__ "#.bold().cyan());
    println!("{}", r#" _\ \/ __/ _ `/ / -_) /__/ / _ \/  '_/ "#.bold().cyan());
    println!("{}", r#"/___/\__/\_,_/_/\__/____/_/_//_/_/\_\  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "ScaleLink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Weighing indicator connection console");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
