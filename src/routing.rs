//! Per-socket frame dispatch.
//!
//! Each WebSocket gets a link object that remembers what the socket has become
//! (an announced agent, an open shell session, ...) and turns decoded frames
//! into hub calls. Links never touch the socket directly; everything they send
//! goes through the socket's [`ConnectionHandle`].

use uuid::Uuid;

use crate::{
    connection::ConnectionHandle,
    hub::Hub,
    protocol::{
        file_request_frame, parse_frame, session_opened_frame, shell_command_frame,
        target_gone_frame, InboundFrame,
    },
    registry::SessionKind,
};

pub trait Link {
    fn connection(&self) -> &ConnectionHandle;
    fn handle_text(&mut self, hub: &Hub, text: &str);
    fn closed(self, hub: &Hub);
}

fn decode(text: &str, socket: &'static str) -> Option<(InboundFrame, serde_json::Value)> {
    match parse_frame(text) {
        Ok(decoded) => Some(decoded),
        Err(error) => {
            tracing::warn!(
                target = "device_relay::routing",
                socket,
                error = %error,
                "dropping malformed frame"
            );
            None
        }
    }
}

fn unexpected(socket: &'static str, frame: &InboundFrame) {
    tracing::debug!(
        target = "device_relay::routing",
        socket,
        frame_type = frame.type_name(),
        "ignoring frame not valid on this socket"
    );
}

// ---------------------------------------------------------------------------
// Agent sockets
// ---------------------------------------------------------------------------

pub struct AgentLink {
    connection: ConnectionHandle,
    agent_id: Option<String>,
}

impl AgentLink {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            agent_id: None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }
}

impl Link for AgentLink {
    fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    fn handle_text(&mut self, hub: &Hub, text: &str) {
        let Some((frame, raw)) = decode(text, "agent") else {
            return;
        };
        match frame {
            InboundFrame::AgentAnnounce { id, name } => {
                // Announcing under a new id releases the old one.
                if let Some(previous) = self.agent_id.take().filter(|previous| *previous != id) {
                    hub.agent_connection_closed(&previous, self.connection.id());
                }
                let name = name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| id.clone());
                hub.register_agent(&id, &name, self.connection.clone());
                self.agent_id = Some(id);
            }
            InboundFrame::ControlBroadcastText { text } => hub.broadcast_text(&text),
            InboundFrame::ShellOutput { reply_to } => {
                relay_to_session(hub, &reply_to, SessionKind::Shell, &raw)
            }
            InboundFrame::FilebrowserResponse { reply_to } => {
                relay_to_session(hub, &reply_to, SessionKind::FileBrowser, &raw)
            }
            other => unexpected("agent", &other),
        }
    }

    fn closed(self, hub: &Hub) {
        if let Some(id) = self.agent_id {
            hub.agent_connection_closed(&id, self.connection.id());
        }
    }
}

fn relay_to_session(hub: &Hub, session_id: &str, kind: SessionKind, raw: &serde_json::Value) {
    match hub.send_to_session(session_id, kind, raw) {
        Ok(()) => {}
        Err(error) if error.is_not_found() => tracing::debug!(
            target = "device_relay::routing",
            session = %session_id,
            error = %error,
            "dropping agent reply for a session that is gone"
        ),
        Err(error) => tracing::warn!(
            target = "device_relay::routing",
            session = %session_id,
            error = %error,
            "failed to relay agent reply"
        ),
    }
}

// ---------------------------------------------------------------------------
// Shell and file-browser sockets
// ---------------------------------------------------------------------------

pub struct SessionLink {
    kind: SessionKind,
    connection: ConnectionHandle,
    session_id: String,
    opened: bool,
}

impl SessionLink {
    pub fn new(kind: SessionKind, connection: ConnectionHandle) -> Self {
        Self {
            kind,
            connection,
            session_id: Uuid::new_v4().to_string(),
            opened: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    fn open(&mut self, hub: &Hub, target: &str) {
        if self.opened {
            tracing::debug!(
                target = "device_relay::routing",
                session = %self.session_id,
                "session already bound; ignoring second open"
            );
            return;
        }
        match hub.open_session(self.kind, &self.session_id, target, self.connection.clone()) {
            Ok(agent_name) => {
                self.opened = true;
                let _ = self
                    .connection
                    .send(&session_opened_frame(&self.session_id, &agent_name));
            }
            Err(error) => {
                tracing::info!(
                    target = "device_relay::routing",
                    session = %self.session_id,
                    agent = %target,
                    error = %error,
                    "session open refused"
                );
                let _ = self.connection.send(&target_gone_frame(target));
                let _ = self.connection.close("target gone");
            }
        }
    }

    fn forward(&self, hub: &Hub, payload: serde_json::Value) {
        if !self.opened {
            tracing::debug!(
                target = "device_relay::routing",
                session = %self.session_id,
                "request before open; dropping"
            );
            return;
        }
        match hub.send_to_session_agent(&self.session_id, &payload) {
            Ok(()) => {}
            Err(error) if error.is_not_found() => tracing::debug!(
                target = "device_relay::routing",
                session = %self.session_id,
                error = %error,
                "bound agent unreachable; dropping request"
            ),
            Err(error) => tracing::warn!(
                target = "device_relay::routing",
                session = %self.session_id,
                error = %error,
                "failed to forward request"
            ),
        }
    }

    fn socket_name(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl Link for SessionLink {
    fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    fn handle_text(&mut self, hub: &Hub, text: &str) {
        let Some((frame, _)) = decode(text, self.socket_name()) else {
            return;
        };
        match (self.kind, frame) {
            (SessionKind::Shell, InboundFrame::ShellOpen { target })
            | (SessionKind::FileBrowser, InboundFrame::FilebrowserOpen { target }) => {
                self.open(hub, &target)
            }
            (SessionKind::Shell, InboundFrame::ShellCommand { command }) => {
                let payload = shell_command_frame(&command, &self.session_id);
                self.forward(hub, payload)
            }
            (SessionKind::FileBrowser, InboundFrame::FilebrowserRequest { action, path }) => {
                let payload = file_request_frame(action, &path, &self.session_id);
                self.forward(hub, payload)
            }
            (_, InboundFrame::ControlBroadcastText { text }) => hub.broadcast_text(&text),
            (_, other) => unexpected(self.socket_name(), &other),
        }
    }

    fn closed(self, hub: &Hub) {
        if self.opened {
            hub.close_session(&self.session_id);
        }
    }
}
