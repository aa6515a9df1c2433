use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close { reason: String },
}

/// Push side of one WebSocket connection.
///
/// Sends never block: frames go into an unbounded queue drained by the socket's
/// writer task, so the hub can route while holding its lock. Once the writer
/// is gone every send returns [`RelayError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, payload: &Value) -> Result<()> {
        self.send_text(payload.to_string())
    }

    pub fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(Outbound::Frame(text))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    pub fn close(&self, reason: &str) -> Result<()> {
        self.tx
            .send(Outbound::Close {
                reason: reason.to_string(),
            })
            .map_err(|_| RelayError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
