//! Connection and session registries.
//!
//! Both registries are plain owned maps. They hold no locks of their own; the
//! [`Hub`](crate::hub::Hub) serializes every mutation behind a single mutex so
//! that agent removal and session creation for the same id never interleave.

use std::collections::{hash_map::Entry, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    connection::ConnectionHandle,
    error::{RelayError, Result},
};

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub connection: ConnectionHandle,
    pub display_name: String,
    pub original_name: String,
    pub connected_at: DateTime<Utc>,
}

impl Agent {
    pub fn connected_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.connected_at)
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the agent under `id`. Returns the superseded record
    /// when a previous registration existed.
    pub fn register(
        &mut self,
        id: &str,
        connection: ConnectionHandle,
        name: &str,
        now: DateTime<Utc>,
    ) -> Option<Agent> {
        self.agents.insert(
            id.to_string(),
            Agent {
                id: id.to_string(),
                connection,
                display_name: name.to_string(),
                original_name: name.to_string(),
                connected_at: now,
            },
        )
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn unregister(&mut self, id: &str) -> Option<Agent> {
        self.agents.remove(id)
    }

    /// Remove the agent only if it is still bound to `connection_id`.
    ///
    /// A socket that was superseded by a re-registration must not evict the
    /// agent that replaced it when it finally closes.
    pub fn unregister_connection(&mut self, id: &str, connection_id: Uuid) -> Option<Agent> {
        match self.agents.get(id) {
            Some(agent) if agent.connection.id() == connection_id => self.agents.remove(id),
            _ => None,
        }
    }

    /// Returns `false` when no agent is registered under `id`.
    pub fn rename(&mut self, id: &str, new_name: &str) -> bool {
        match self.agents.get_mut(id) {
            Some(agent) => {
                agent.display_name = new_name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<&Agent> {
        self.agents.values().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Shell,
    FileBrowser,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Shell => "shell",
            SessionKind::FileBrowser => "file-browser",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub connection: ConnectionHandle,
    pub target_agent_id: String,
    pub kind: SessionKind,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new session to a live agent. Nothing is inserted when the
    /// target is not registered.
    pub fn open(
        &mut self,
        agents: &AgentRegistry,
        kind: SessionKind,
        session_id: &str,
        target_agent_id: &str,
        connection: ConnectionHandle,
    ) -> Result<&Session> {
        if !agents.contains(target_agent_id) {
            return Err(RelayError::AgentNotFound(target_agent_id.to_string()));
        }
        let session = Session {
            session_id: session_id.to_string(),
            connection,
            target_agent_id: target_agent_id.to_string(),
            kind,
        };
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(session);
                Ok(occupied.into_mut())
            }
            Entry::Vacant(vacant) => Ok(vacant.insert(session)),
        }
    }

    pub fn close(&mut self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Ids of every session (both kinds) bound to `agent_id`.
    pub fn bound_to(&self, agent_id: &str) -> Vec<String> {
        self.sessions
            .values()
            .filter(|session| session.target_agent_id == agent_id)
            .map(|session| session.session_id.clone())
            .collect()
    }

    pub fn count(&self, kind: SessionKind) -> usize {
        self.sessions
            .values()
            .filter(|session| session.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
