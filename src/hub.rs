//! Shared relay state.
//!
//! The [`Hub`] owns the agent registry, the session registry and the pending
//! command table behind one mutex. Every mutation (register, unregister, open,
//! close, wizard advance) takes that lock, which is what makes the cascade on
//! agent removal atomic with respect to a racing session open. Sends into
//! connections never block, so routing happens under the lock; anything that
//! waits on the control channel happens outside it.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    commands::CommandKind,
    connection::ConnectionHandle,
    correlator::{
        advance, complete_with_link, CommandDispatch, PendingCommand, PendingCommands,
        PromptToken, Reply, Transition,
    },
    error::{RelayError, Result},
    events::{ControlNotice, EventEmitter, NoticeSender},
    protocol::target_disconnected_frame,
    registry::{Agent, AgentRegistry, SessionKind, SessionRegistry},
};

#[derive(Debug)]
struct HubState {
    agents: AgentRegistry,
    sessions: SessionRegistry,
    pending: PendingCommands,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub display_name: String,
    pub original_name: String,
    pub connected_at: DateTime<Utc>,
}

impl From<&Agent> for AgentSummary {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            display_name: agent.display_name.clone(),
            original_name: agent.original_name.clone(),
            connected_at: agent.connected_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub agents: usize,
    pub shell_sessions: usize,
    pub file_sessions: usize,
    pub pending_commands: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The command takes no arguments and was sent straight away.
    Dispatched(CommandDispatch),
    /// The operator must be prompted with this text; the resulting prompt
    /// token is then handed to [`Hub::park_prompt`].
    Prompt(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Dispatched(CommandDispatch),
    NeedsPrompt {
        text: &'static str,
        next: PendingCommand,
    },
    NeedsAttachment {
        file_id: String,
        pending: PendingCommand,
    },
    /// The reply did not fit the step; the prompt stays outstanding.
    Retained,
}

pub struct Hub {
    state: Mutex<HubState>,
    notices: NoticeSender,
    events: EventEmitter,
}

impl Hub {
    pub fn new(pending_ttl: Option<Duration>, notices: NoticeSender, events: EventEmitter) -> Self {
        Self {
            state: Mutex::new(HubState {
                agents: AgentRegistry::new(),
                sessions: SessionRegistry::new(),
                pending: PendingCommands::new(pending_ttl),
            }),
            notices,
            events,
        }
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub fn register_agent(&self, id: &str, name: &str, connection: ConnectionHandle) {
        let connection_id = connection.id();
        let superseded = self
            .state
            .lock()
            .agents
            .register(id, connection, name, Utc::now());

        if let Some(previous) = superseded {
            tracing::warn!(
                target = "device_relay::hub",
                agent = %id,
                previous_connection = %previous.connection.id(),
                connection = %connection_id,
                "agent re-registered; previous connection is no longer addressable"
            );
        } else {
            tracing::info!(target = "device_relay::hub", agent = %id, name = %name, "agent connected");
        }

        self.events
            .emit("agent_connected", json!({"id": id, "name": name}));
        self.notify(ControlNotice::AgentConnected {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Remove the agent under `id` regardless of which socket owns it.
    pub fn unregister_agent(&self, id: &str) -> Option<AgentSummary> {
        let mut state = self.state.lock();
        let agent = state.agents.unregister(id)?;
        Some(self.finish_unregister(&mut state, agent))
    }

    /// Socket-close path: only unregisters if `connection_id` still owns the id.
    pub fn agent_connection_closed(&self, id: &str, connection_id: Uuid) -> bool {
        let mut state = self.state.lock();
        match state.agents.unregister_connection(id, connection_id) {
            Some(agent) => {
                self.finish_unregister(&mut state, agent);
                true
            }
            None => {
                tracing::debug!(
                    target = "device_relay::hub",
                    agent = %id,
                    connection = %connection_id,
                    "superseded agent socket closed"
                );
                false
            }
        }
    }

    fn finish_unregister(&self, state: &mut HubState, agent: Agent) -> AgentSummary {
        let connected_for = agent.connected_for(Utc::now());
        let closed_sessions = cascade(state, &agent.id);
        let dropped_prompts = state.pending.drop_for_agent(&agent.id);

        tracing::info!(
            target = "device_relay::hub",
            agent = %agent.id,
            closed_sessions,
            dropped_prompts,
            connected_secs = connected_for.num_seconds(),
            "agent disconnected"
        );
        self.events.emit(
            "agent_disconnected",
            json!({
                "id": agent.id,
                "closedSessions": closed_sessions,
                "connectedSecs": connected_for.num_seconds(),
            }),
        );
        self.notify(ControlNotice::AgentDisconnected {
            id: agent.id.clone(),
            name: agent.display_name.clone(),
            connected_for,
        });
        AgentSummary::from(&agent)
    }

    pub fn rename_agent(&self, id: &str, new_name: &str) -> bool {
        self.state.lock().agents.rename(id, new_name)
    }

    pub fn agent(&self, id: &str) -> Option<AgentSummary> {
        self.state.lock().agents.get(id).map(AgentSummary::from)
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        self.state
            .lock()
            .agents
            .list()
            .into_iter()
            .map(AgentSummary::from)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Sessions and relay
    // -----------------------------------------------------------------------

    /// Bind a session to `target_agent_id`. Returns the agent's display name.
    pub fn open_session(
        &self,
        kind: SessionKind,
        session_id: &str,
        target_agent_id: &str,
        connection: ConnectionHandle,
    ) -> Result<String> {
        let mut state = self.state.lock();
        let HubState {
            agents, sessions, ..
        } = &mut *state;
        sessions.open(agents, kind, session_id, target_agent_id, connection)?;
        let name = agents
            .get(target_agent_id)
            .map(|agent| agent.display_name.clone())
            .unwrap_or_else(|| target_agent_id.to_string());
        tracing::info!(
            target = "device_relay::hub",
            session = %session_id,
            kind = kind.as_str(),
            agent = %target_agent_id,
            "session opened"
        );
        Ok(name)
    }

    pub fn close_session(&self, session_id: &str) -> bool {
        let closed = self.state.lock().sessions.close(session_id);
        if let Some(session) = &closed {
            tracing::info!(
                target = "device_relay::hub",
                session = %session_id,
                kind = session.kind.as_str(),
                "session closed"
            );
        }
        closed.is_some()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.state.lock().sessions.get(session_id).is_some()
    }

    /// Push `payload` to the session's connection. The session must be of `kind`.
    pub fn send_to_session(&self, session_id: &str, kind: SessionKind, payload: &Value) -> Result<()> {
        let state = self.state.lock();
        let session = state
            .sessions
            .get(session_id)
            .filter(|session| session.kind == kind)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        session.connection.send(payload)
    }

    /// Push `payload` to the agent the session is bound to.
    pub fn send_to_session_agent(&self, session_id: &str, payload: &Value) -> Result<()> {
        let state = self.state.lock();
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        let agent = state
            .agents
            .get(&session.target_agent_id)
            .ok_or_else(|| RelayError::AgentNotFound(session.target_agent_id.clone()))?;
        agent.connection.send(payload)
    }

    pub fn broadcast_text(&self, text: &str) {
        self.notify(ControlNotice::BroadcastText {
            text: text.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Command wizards
    // -----------------------------------------------------------------------

    pub fn begin_command(&self, agent_id: &str, command: CommandKind) -> Result<BeginOutcome> {
        let mut state = self.state.lock();
        if !state.agents.contains(agent_id) {
            return Err(RelayError::AgentNotFound(agent_id.to_string()));
        }
        if command.fields().is_empty() {
            let dispatch = CommandDispatch::immediate(command, agent_id);
            dispatch_locked(&mut state, &dispatch)?;
            return Ok(BeginOutcome::Dispatched(dispatch));
        }
        Ok(BeginOutcome::Prompt(command.prompt(0)))
    }

    /// Park a wizard step under the token of the prompt just issued for it.
    pub fn park_prompt(&self, token: PromptToken, pending: PendingCommand) -> Result<()> {
        let mut state = self.state.lock();
        if !state.agents.contains(&pending.target_agent_id) {
            return Err(RelayError::AgentNotFound(pending.target_agent_id));
        }
        tracing::debug!(
            target = "device_relay::hub",
            token = %token,
            command = %pending.command,
            agent = %pending.target_agent_id,
            "prompt outstanding"
        );
        state.pending.park(token, pending);
        Ok(())
    }

    pub fn has_pending(&self, token: &PromptToken) -> bool {
        self.state.lock().pending.contains(token)
    }

    /// Apply an operator reply to the wizard parked under `token`.
    ///
    /// The token is consumed before anything else happens, so a duplicate
    /// reply finds nothing and yields [`RelayError::StaleToken`]. A reply of
    /// the wrong shape parks the same step back under the same token.
    pub fn resolve_reply(&self, token: &PromptToken, reply: &Reply) -> Result<ReplyOutcome> {
        self.resolve_reply_at(token, reply, Instant::now())
    }

    pub fn resolve_reply_at(
        &self,
        token: &PromptToken,
        reply: &Reply,
        now: Instant,
    ) -> Result<ReplyOutcome> {
        let mut state = self.state.lock();
        let pending = state
            .pending
            .take(token, now)
            .ok_or_else(|| RelayError::StaleToken(token.to_string()))?;
        if !state.agents.contains(&pending.target_agent_id) {
            return Err(RelayError::AgentNotFound(pending.target_agent_id));
        }

        match advance(pending, reply, now) {
            Transition::Dispatch(dispatch) => {
                dispatch_locked(&mut state, &dispatch)?;
                Ok(ReplyOutcome::Dispatched(dispatch))
            }
            Transition::Prompt { text, next } => Ok(ReplyOutcome::NeedsPrompt { text, next }),
            Transition::ResolveAttachment { file_id, pending } => {
                Ok(ReplyOutcome::NeedsAttachment { file_id, pending })
            }
            Transition::Retain(pending) => {
                tracing::debug!(
                    target = "device_relay::hub",
                    token = %token,
                    command = %pending.command,
                    "reply did not match the expected shape; prompt stays open"
                );
                state.pending.park(token.clone(), pending);
                Ok(ReplyOutcome::Retained)
            }
        }
    }

    /// Resume an attachment step once the link lookup has finished.
    pub fn complete_attachment(
        &self,
        pending: &PendingCommand,
        link: Result<String>,
    ) -> Result<CommandDispatch> {
        let link = link.map_err(|error| match error {
            RelayError::UpstreamResolution(message) => RelayError::UpstreamResolution(message),
            other => RelayError::UpstreamResolution(other.to_string()),
        })?;
        let dispatch = complete_with_link(pending, link);
        let mut state = self.state.lock();
        dispatch_locked(&mut state, &dispatch)?;
        Ok(dispatch)
    }

    /// Drop prompts older than the configured TTL.
    pub fn expire_pending(&self) -> usize {
        self.expire_pending_at(Instant::now())
    }

    pub fn expire_pending_at(&self, now: Instant) -> usize {
        let expired = self.state.lock().pending.expire(now);
        for (token, pending) in &expired {
            tracing::info!(
                target = "device_relay::hub",
                token = %token,
                command = %pending.command,
                agent = %pending.target_agent_id,
                "prompt expired without a reply"
            );
        }
        expired.len()
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        HubStats {
            agents: state.agents.len(),
            shell_sessions: state.sessions.count(SessionKind::Shell),
            file_sessions: state.sessions.count(SessionKind::FileBrowser),
            pending_commands: state.pending.len(),
        }
    }

    fn notify(&self, notice: ControlNotice) {
        if self.notices.send(notice).is_err() {
            tracing::debug!(target = "device_relay::hub", "control channel gone; notice dropped");
        }
    }
}

/// Close and remove every session bound to `agent_id`, telling each why.
fn cascade(state: &mut HubState, agent_id: &str) -> usize {
    let bound = state.sessions.bound_to(agent_id);
    let notice = target_disconnected_frame(agent_id);
    for session_id in &bound {
        let Some(session) = state.sessions.close(session_id) else {
            continue;
        };
        let sent = session
            .connection
            .send(&notice)
            .and_then(|()| session.connection.close("target disconnected"));
        if let Err(error) = sent {
            tracing::debug!(
                target = "device_relay::hub",
                session = %session_id,
                error = %error,
                "session already gone during cascade"
            );
        }
    }
    bound.len()
}

fn dispatch_locked(state: &mut HubState, dispatch: &CommandDispatch) -> Result<()> {
    let agent = state
        .agents
        .get(&dispatch.target_agent_id)
        .ok_or_else(|| RelayError::AgentNotFound(dispatch.target_agent_id.clone()))?;
    agent.connection.send(&dispatch.to_frame())?;

    if dispatch.command == CommandKind::SetDeviceName {
        if let Some(name) = dispatch.field("argument") {
            state.agents.rename(&dispatch.target_agent_id, name);
        }
    }
    tracing::info!(
        target = "device_relay::hub",
        agent = %dispatch.target_agent_id,
        command = %dispatch.command,
        "command dispatched"
    );
    Ok(())
}
