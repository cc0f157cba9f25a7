//! [`LineFramer`] – turns inbound byte chunks into text frames.
//!
//! Transports deliver whatever the OS read returned: half a line, three
//! lines, or a line split across Bluetooth notifications.  The framer keeps
//! the unfinished tail between chunks and emits a frame on CR or LF.  In
//! bracket mode (SCP) a closing `]` also ends a frame, and a lone `^`
//! acknowledgement is emitted immediately, because some firmware sends
//! neither with a line terminator.

use scalelink_types::ProtocolKind;
use tracing::warn;

/// Maximum bytes held for an unterminated frame.
pub const MAX_FRAME_BUFFER: usize = 4096;

#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    bracket_mode: bool,
}

impl LineFramer {
    /// Plain CR/LF framing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Framing suited to `protocol`: bracket mode for SCP.
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        Self {
            buffer: Vec::new(),
            bracket_mode: protocol == ProtocolKind::Scp,
        }
    }

    /// Feed a chunk and collect every frame it completes.
    ///
    /// Frames are trimmed; empty frames are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        for &byte in chunk {
            match byte {
                b'\r' | b'\n' => self.flush_into(&mut frames),
                b']' if self.bracket_mode => {
                    self.buffer.push(byte);
                    self.flush_into(&mut frames);
                }
                b'^' if self.bracket_mode && self.is_blank() => {
                    self.buffer.clear();
                    frames.push("^".to_string());
                }
                _ => {
                    if self.buffer.len() >= MAX_FRAME_BUFFER {
                        warn!(
                            dropped = self.buffer.len(),
                            "frame exceeded buffer limit without a terminator; discarding"
                        );
                        self.buffer.clear();
                    }
                    self.buffer.push(byte);
                }
            }
        }
        frames
    }

    /// Emit whatever is buffered as a final frame (link closed).
    pub fn finish(&mut self) -> Option<String> {
        let mut frames = Vec::new();
        self.flush_into(&mut frames);
        frames.pop()
    }

    /// Bytes currently held for an unfinished frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn is_blank(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    fn flush_into(&mut self, frames: &mut Vec<String>) {
        if self.buffer.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if !text.is_empty() {
            frames.push(text);
        }
    }
}
