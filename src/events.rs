use std::io::{self, IsTerminal, Write};

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Install the global subscriber. Human logs go to stderr so that stdout stays
/// free; colors only when stderr is a terminal.
pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|error| {
        eprintln!("invalid log filter {:?} ({error}); falling back to info", cfg.log_level);
        EnvFilter::new("info")
    });
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow!("failed to install tracing subscriber: {error}"))
}

/// Notices the hub and the HTTP layer hand to the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlNotice {
    AgentConnected {
        id: String,
        name: String,
    },
    AgentDisconnected {
        id: String,
        name: String,
        connected_for: chrono::Duration,
    },
    BroadcastText {
        text: String,
    },
    Document {
        source: String,
        filename: String,
        bytes: Vec<u8>,
    },
}

pub type NoticeSender = mpsc::UnboundedSender<ControlNotice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<ControlNotice>;

pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}

/// Machine-readable lifecycle lines on stderr, enabled by `--json-output`.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = json!({
            "at": Utc::now().to_rfc3339(),
            "service": "device-relay",
            "event": event_type,
            "data": payload,
        });
        let _ = writeln!(io::stderr().lock(), "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::{notice_channel, ControlNotice, EventEmitter};
    use serde_json::json;

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::new(false);
        emitter.emit("agent_connected", json!({"id": "a1"}));
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit("agent_connected", json!({"id": "a1", "name": "Pixel"}));
        emitter.emit("session_closed", "s1");
        emitter.emit("pending_expired", 3);
    }

    #[test]
    fn notices_survive_the_channel() {
        let (tx, mut rx) = notice_channel();
        tx.send(ControlNotice::BroadcastText {
            text: "hello".into(),
        })
        .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ControlNotice::BroadcastText {
                text: "hello".into()
            }
        );
    }
}
