//! Pending-command correlation.
//!
//! A wizard collects a command's arguments from operator replies. Each
//! outstanding step is parked under the token of the prompt the operator is
//! expected to reply to. Taking a token removes it, so a token resolves at
//! most once no matter how many replies reference it.

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use serde_json::{json, Map, Value};

use crate::commands::CommandKind;

/// Opaque identity of an outbound prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromptToken(String);

impl PromptToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Token for a Telegram message, unique across chats.
    pub fn for_message(chat_id: i64, message_id: i64) -> Self {
        Self(format!("{chat_id}:{message_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PromptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardStep {
    /// The next reply completes the command (or, for two-step commands,
    /// supplies the first field).
    AwaitingArgument,
    AwaitingStepTwo { collected: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command: CommandKind,
    pub target_agent_id: String,
    pub step: WizardStep,
    pub created_at: Instant,
}

impl PendingCommand {
    pub fn new(command: CommandKind, target_agent_id: &str, now: Instant) -> Self {
        Self {
            command,
            target_agent_id: target_agent_id.to_string(),
            step: WizardStep::AwaitingArgument,
            created_at: now,
        }
    }

    /// Whether the next accepted reply produces a dispatchable command.
    pub fn is_final_step(&self) -> bool {
        match self.step {
            WizardStep::AwaitingArgument => self.command.fields().len() <= 1,
            WizardStep::AwaitingStepTwo { .. } => true,
        }
    }

    fn step_index(&self) -> usize {
        match self.step {
            WizardStep::AwaitingArgument => 0,
            WizardStep::AwaitingStepTwo { .. } => 1,
        }
    }

    fn collected(&self) -> Vec<String> {
        match &self.step {
            WizardStep::AwaitingArgument => Vec::new(),
            WizardStep::AwaitingStepTwo { collected } => vec![collected.clone()],
        }
    }

    /// Prompt text for the step this command is waiting on.
    pub fn prompt(&self) -> &'static str {
        self.command.prompt(self.step_index())
    }
}

/// Operator reply content relevant to a wizard step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: Option<String>,
    /// File id of an attached audio clip or document.
    pub file_id: Option<String>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            file_id: None,
        }
    }

    pub fn attachment(file_id: impl Into<String>) -> Self {
        Self {
            text: None,
            file_id: Some(file_id.into()),
        }
    }

    fn usable_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// A complete command ready to be pushed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDispatch {
    pub command: CommandKind,
    pub target_agent_id: String,
    pub fields: Vec<(String, String)>,
}

impl CommandDispatch {
    pub fn immediate(command: CommandKind, target_agent_id: &str) -> Self {
        Self {
            command,
            target_agent_id: target_agent_id.to_string(),
            fields: Vec::new(),
        }
    }

    fn from_values(pending: &PendingCommand, values: Vec<String>) -> Self {
        let fields = pending
            .command
            .fields()
            .iter()
            .zip(values)
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        Self {
            command: pending.command,
            target_agent_id: pending.target_agent_id.clone(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Wire frame sent to the agent.
    pub fn to_frame(&self) -> Value {
        let mut frame = Map::new();
        frame.insert("type".into(), json!("command"));
        frame.insert("command".into(), json!(self.command.name()));
        for (name, value) in &self.fields {
            frame.insert(name.clone(), json!(value));
        }
        Value::Object(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Dispatch(CommandDispatch),
    /// The reply carried the expected file; its download link must be
    /// resolved before the command can be dispatched.
    ResolveAttachment {
        file_id: String,
        pending: PendingCommand,
    },
    /// An intermediate field was captured; `next` must be parked under the
    /// token of a freshly issued prompt.
    Prompt {
        text: &'static str,
        next: PendingCommand,
    },
    /// The reply did not have the expected shape; nothing changes.
    Retain(PendingCommand),
}

/// Apply one operator reply to a pending command. A step that moves the
/// wizard forward starts a new prompt, so its age is counted from `now`.
pub fn advance(pending: PendingCommand, reply: &Reply, now: Instant) -> Transition {
    if !pending.is_final_step() {
        return match reply.usable_text() {
            Some(text) => {
                let next = PendingCommand {
                    step: WizardStep::AwaitingStepTwo {
                        collected: text.to_string(),
                    },
                    created_at: now,
                    ..pending
                };
                Transition::Prompt {
                    text: next.prompt(),
                    next,
                }
            }
            None => Transition::Retain(pending),
        };
    }

    if pending.command.expects_attachment() {
        return match &reply.file_id {
            Some(file_id) => Transition::ResolveAttachment {
                file_id: file_id.clone(),
                pending,
            },
            None => Transition::Retain(pending),
        };
    }

    match reply.usable_text() {
        Some(text) => {
            let mut values = pending.collected();
            values.push(text.to_string());
            Transition::Dispatch(CommandDispatch::from_values(&pending, values))
        }
        None => Transition::Retain(pending),
    }
}

/// Finish an attachment-bearing command once its link is known.
pub fn complete_with_link(pending: &PendingCommand, link: String) -> CommandDispatch {
    let mut values = pending.collected();
    values.push(link);
    CommandDispatch::from_values(pending, values)
}

/// Outstanding wizards keyed by prompt token.
#[derive(Debug, Default)]
pub struct PendingCommands {
    pending: HashMap<PromptToken, PendingCommand>,
    ttl: Option<Duration>,
}

impl PendingCommands {
    /// `ttl` of `None` keeps unanswered prompts forever.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    pub fn park(&mut self, token: PromptToken, pending: PendingCommand) {
        self.pending.insert(token, pending);
    }

    /// Remove and return the command parked under `token`. Expired entries
    /// are discarded and reported as absent.
    pub fn take(&mut self, token: &PromptToken, now: Instant) -> Option<PendingCommand> {
        let pending = self.pending.remove(token)?;
        if self.is_expired(&pending, now) {
            tracing::debug!(
                target = "device_relay::correlator",
                token = %token,
                command = %pending.command,
                "discarding expired pending command"
            );
            return None;
        }
        Some(pending)
    }

    pub fn contains(&self, token: &PromptToken) -> bool {
        self.pending.contains_key(token)
    }

    /// Drop every entry older than the TTL. Returns the dropped entries.
    pub fn expire(&mut self, now: Instant) -> Vec<(PromptToken, PendingCommand)> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let expired: Vec<PromptToken> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.created_at) >= ttl)
            .map(|(token, _)| token.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.pending.remove(&token).map(|pending| (token, pending)))
            .collect()
    }

    /// Drop every wizard bound to `agent_id`.
    pub fn drop_for_agent(&mut self, agent_id: &str) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| pending.target_agent_id != agent_id);
        before - self.pending.len()
    }

    fn is_expired(&self, pending: &PendingCommand, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(pending.created_at) >= ttl)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
