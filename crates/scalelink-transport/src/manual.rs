//! Paste-based input path.
//!
//! When the serial capability is missing (no port, no permission) the
//! operator can still copy lines off the indicator display or a terminal and
//! paste them in.  [`ManualFeed::push`] hands that text to whichever adapter
//! is currently forwarding the feed.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{InboundSender, inbound_channel, Inbound};

const FEED_CAPACITY: usize = 64;

/// Cloneable handle the UI pushes pasted text into.
#[derive(Clone, Debug)]
pub struct ManualFeed {
    sender: broadcast::Sender<String>,
}

impl ManualFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    /// Push pasted text.  A missing line terminator is added so the framer
    /// emits the line immediately.
    ///
    /// Returns `false` when no adapter is currently listening.
    pub fn push(&self, text: impl Into<String>) -> bool {
        let mut text = text.into();
        if !text.ends_with('\n') && !text.ends_with('\r') {
            text.push_str("\r\n");
        }
        self.sender.send(text).is_ok()
    }

    /// `true` while an adapter is forwarding this feed.
    pub fn is_active(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Start forwarding pasted text into a fresh inbound stream.
    pub(crate) fn attach(&self) -> (Inbound, JoinHandle<()>) {
        let (tx, rx) = inbound_channel();
        let receiver = self.sender.subscribe();
        let task = tokio::spawn(forward(receiver, tx));
        (rx, task)
    }
}

impl Default for ManualFeed {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward(mut receiver: broadcast::Receiver<String>, tx: InboundSender) {
    loop {
        match receiver.recv().await {
            Ok(text) => {
                if tx.send(Ok(text.into_bytes())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(dropped = n, "manual feed lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_without_listener_reports_false() {
        let feed = ManualFeed::new();
        assert!(!feed.is_active());
        assert!(!feed.push("[123.5]"));
    }

    #[tokio::test]
    async fn attached_feed_forwards_lines_with_terminator() {
        let feed = ManualFeed::new();
        let (mut inbound, task) = feed.attach();
        assert!(feed.is_active());

        assert!(feed.push("Weight:450,ID:BR1234,Stable:1"));
        let chunk = inbound.recv().await.expect("chunk").expect("ok chunk");
        assert_eq!(chunk, b"Weight:450,ID:BR1234,Stable:1\r\n");

        task.abort();
    }
}
