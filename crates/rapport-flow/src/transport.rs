//! Outbound transport seam.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rapport_types::{Message, RapportError, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// Hands signed messages to an in-process receiver.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| RapportError::SendFailure("receiver closed".into()))
    }
}

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// Records every send attempt. Optionally fails them all.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
    attempts: Mutex<usize>,
    fail: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every send fails after being counted.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Messages successfully sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: Message) -> Result<()> {
        *self.attempts.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if self.fail {
            return Err(RapportError::SendFailure("transport unavailable".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(Message::broadcast("hi")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().text(), "hi");
    }

    #[tokio::test]
    async fn channel_transport_fails_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let err = transport.send(Message::broadcast("hi")).await.unwrap_err();
        assert!(matches!(err, RapportError::SendFailure(_)));
    }

    #[tokio::test]
    async fn recording_transport_counts_attempts() {
        let ok = RecordingTransport::new();
        ok.send(Message::broadcast("a")).await.unwrap();
        assert_eq!(ok.sent().len(), 1);
        assert_eq!(ok.attempts(), 1);

        let failing = RecordingTransport::failing();
        assert!(failing.send(Message::broadcast("a")).await.is_err());
        assert!(failing.sent().is_empty());
        assert_eq!(failing.attempts(), 1);
    }
}
