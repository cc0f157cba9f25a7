//! Console input shared by the REPL and the Bluetooth device picker.
//!
//! A single thread owns stdin and forwards lines over a channel.  Whoever
//! waits next receives the next line, so a picker that gives up never
//! swallows a REPL command typed afterwards.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use colored::Colorize;
use scalelink_transport::{DeviceChooser, DiscoveredDevice};
use tracing::warn;

/// Invalid answers tolerated before the picker cancels.
const MAX_ATTEMPTS: usize = 3;

pub enum Line {
    Text(String),
    /// Nothing arrived within the wait.
    Idle,
    /// Input ended (EOF or read error).
    Closed,
}

pub struct LineSource {
    rx: Mutex<Receiver<String>>,
}

impl LineSource {
    /// Starts the stdin reader thread.
    pub fn stdin() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let stdin = io::stdin();
            loop {
                let mut line = String::new();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        });
        Arc::new(Self { rx: Mutex::new(rx) })
    }

    #[cfg(test)]
    pub fn scripted(lines: &[&str]) -> Self {
        let (tx, rx) = mpsc::channel();
        for line in lines {
            let _ = tx.send(format!("{line}\n"));
        }
        Self { rx: Mutex::new(rx) }
    }

    pub fn next(&self, wait: Duration) -> Line {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(wait) {
            Ok(line) => Line::Text(line),
            Err(RecvTimeoutError::Timeout) => Line::Idle,
            Err(RecvTimeoutError::Disconnected) => Line::Closed,
        }
    }
}

/// Asks the operator which indicator to pair with.
pub struct PromptChooser {
    lines: Arc<LineSource>,
    wait: Duration,
}

impl PromptChooser {
    /// `wait` bounds each answer; the connection attempt's own timeout
    /// still applies on top.
    pub fn new(lines: Arc<LineSource>, wait: Duration) -> Self {
        Self { lines, wait }
    }
}

impl DeviceChooser for PromptChooser {
    fn choose(&self, candidates: &[DiscoveredDevice]) -> Option<usize> {
        choose_from(candidates, &self.lines, self.wait, &mut io::stdout())
    }
}

/// Lists `candidates` and reads a 1-based choice.  An empty answer cancels.
pub fn choose_from(
    candidates: &[DiscoveredDevice],
    lines: &LineSource,
    wait: Duration,
    out: &mut impl Write,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let _ = writeln!(out, "\n  {}", "Bluetooth indicators in range:".bold());
    for (i, device) in candidates.iter().enumerate() {
        let signal = device
            .rssi
            .map(|rssi| format!("  ({rssi} dBm)"))
            .unwrap_or_default();
        let _ = writeln!(out, "    {}) {}{}", i + 1, device.name, signal.dimmed());
    }

    for _ in 0..MAX_ATTEMPTS {
        let _ = write!(out, "  Pair with [1-{}, empty cancels]: ", candidates.len());
        let _ = out.flush();
        let answer = match lines.next(wait) {
            Line::Text(text) => text,
            Line::Idle | Line::Closed => {
                let _ = writeln!(out, "\n  No answer; pairing cancelled.");
                return None;
            }
        };
        let answer = answer.trim();
        if answer.is_empty() {
            return None;
        }
        match answer.parse::<usize>() {
            Ok(n) if (1..=candidates.len()).contains(&n) => return Some(n - 1),
            _ => {
                let _ = writeln!(out, "  '{answer}' is not in the list.");
            }
        }
    }
    None
}
