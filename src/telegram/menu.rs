//! Operator-facing vocabulary: callback data, keyboards and message text.

use reqwest::Url;

use super::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use crate::{
    commands::CommandKind, correlator::CommandDispatch, events::ControlNotice, hub::AgentSummary,
    registry::SessionKind,
};

/// Telegram rejects a whole keyboard if any button's `callback_data` is longer.
pub const MAX_CALLBACK_DATA: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    ListAgents,
    ShowAgent(String),
    Command { command: CommandKind, agent_id: String },
    OpenSession { kind: SessionKind, agent_id: String },
}

impl CallbackAction {
    /// Encoded form carried in a button's `callback_data`. Agent ids always
    /// come last so they may contain `:`.
    pub fn encode(&self) -> String {
        match self {
            CallbackAction::ListAgents => "agents".to_string(),
            CallbackAction::ShowAgent(id) => format!("agent:{id}"),
            CallbackAction::Command { command, agent_id } => format!("cmd:{command}:{agent_id}"),
            CallbackAction::OpenSession {
                kind: SessionKind::Shell,
                agent_id,
            } => format!("shell:{agent_id}"),
            CallbackAction::OpenSession {
                kind: SessionKind::FileBrowser,
                agent_id,
            } => format!("files:{agent_id}"),
        }
    }
}

/// Button for `action`, or `None` when its encoding would not fit in
/// `callback_data`.
fn action_button(label: impl Into<String>, action: CallbackAction) -> Option<InlineKeyboardButton> {
    let data = action.encode();
    if data.len() > MAX_CALLBACK_DATA {
        tracing::warn!(
            target = "device_relay::telegram",
            data = %data,
            len = data.len(),
            "agent id too long for a menu button; button omitted"
        );
        return None;
    }
    Some(InlineKeyboardButton::callback(label, data))
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    if data == "agents" {
        return Some(CallbackAction::ListAgents);
    }
    let (prefix, rest) = data.split_once(':')?;
    if rest.is_empty() {
        return None;
    }
    match prefix {
        "agent" => Some(CallbackAction::ShowAgent(rest.to_string())),
        "shell" => Some(CallbackAction::OpenSession {
            kind: SessionKind::Shell,
            agent_id: rest.to_string(),
        }),
        "files" => Some(CallbackAction::OpenSession {
            kind: SessionKind::FileBrowser,
            agent_id: rest.to_string(),
        }),
        "cmd" => {
            let (command, agent_id) = rest.split_once(':')?;
            if agent_id.is_empty() {
                return None;
            }
            Some(CallbackAction::Command {
                command: command.parse().ok()?,
                agent_id: agent_id.to_string(),
            })
        }
        _ => None,
    }
}

/// Text commands typed into the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCommand {
    Agents,
    Help,
}

pub fn parse_text_command(text: &str) -> Option<TextCommand> {
    let word = text.split_whitespace().next()?;
    // Group chats append the bot's username: /agents@my_relay_bot
    let word = word.split('@').next().unwrap_or(word);
    match word {
        "/start" | "/agents" | "/list" => Some(TextCommand::Agents),
        "/help" => Some(TextCommand::Help),
        _ => None,
    }
}

pub fn help_text() -> &'static str {
    "/agents - list connected devices\n\
     /help - this message\n\n\
     Pick a device to run a command or open a shell or file browser. \
     When a command needs input, answer the prompt using Telegram's reply."
}

pub fn agents_keyboard(agents: &[AgentSummary]) -> InlineKeyboardMarkup {
    let mut sorted: Vec<&AgentSummary> = agents.iter().collect();
    sorted.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
    InlineKeyboardMarkup {
        inline_keyboard: sorted
            .into_iter()
            .filter_map(|agent| {
                action_button(
                    agent.display_name.clone(),
                    CallbackAction::ShowAgent(agent.id.clone()),
                )
            })
            .map(|button| vec![button])
            .collect(),
    }
}

pub fn agents_text(agents: &[AgentSummary]) -> String {
    match agents.len() {
        0 => "No devices connected.".to_string(),
        1 => "1 device connected:".to_string(),
        n => format!("{n} devices connected:"),
    }
}

/// Action menu for one agent: session pages first, then commands two per row.
pub fn agent_menu(agent_id: &str) -> InlineKeyboardMarkup {
    let session = |label: &'static str, kind: SessionKind| {
        action_button(
            label,
            CallbackAction::OpenSession {
                kind,
                agent_id: agent_id.to_string(),
            },
        )
    };
    let mut rows = vec![[
        session("Shell", SessionKind::Shell),
        session("Files", SessionKind::FileBrowser),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()];
    for pair in CommandKind::ALL.chunks(2) {
        rows.push(
            pair.iter()
                .filter_map(|command| {
                    action_button(
                        command.label(),
                        CallbackAction::Command {
                            command: *command,
                            agent_id: agent_id.to_string(),
                        },
                    )
                })
                .collect(),
        );
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "« Devices",
        CallbackAction::ListAgents.encode(),
    )]);
    rows.retain(|row| !row.is_empty());
    InlineKeyboardMarkup {
        inline_keyboard: rows,
    }
}

pub fn agent_menu_text(agent: &AgentSummary) -> String {
    if agent.display_name == agent.original_name {
        format!("{} ({})", agent.display_name, agent.id)
    } else {
        format!(
            "{} ({}, announced as {})",
            agent.display_name, agent.id, agent.original_name
        )
    }
}

/// Link to the page served for a shell or file-browser session on `agent_id`.
pub fn session_page_url(public_base: &str, kind: SessionKind, agent_id: &str) -> Option<String> {
    let page = match kind {
        SessionKind::Shell => "shell.html",
        SessionKind::FileBrowser => "files.html",
    };
    let url = Url::parse_with_params(&format!("{public_base}/{page}"), [("target", agent_id)]).ok()?;
    Some(url.to_string())
}

pub fn session_link_keyboard(kind: SessionKind, url: String) -> InlineKeyboardMarkup {
    let label = match kind {
        SessionKind::Shell => "Open shell",
        SessionKind::FileBrowser => "Open file browser",
    };
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![InlineKeyboardButton::link(label, url)]],
    }
}

pub fn dispatch_text(dispatch: &CommandDispatch) -> String {
    let mut text = format!("{} sent to {}", dispatch.command, dispatch.target_agent_id);
    for (name, value) in &dispatch.fields {
        text.push_str(&format!("\n{name}: {value}"));
    }
    text
}

/// Chat text for a hub notice. Documents are posted as files instead.
pub fn notice_text(notice: &ControlNotice) -> Option<String> {
    match notice {
        ControlNotice::AgentConnected { id, name } => Some(format!("🟢 {name} connected ({id})")),
        ControlNotice::AgentDisconnected {
            id,
            name,
            connected_for,
        } => Some(format!(
            "🔴 {name} disconnected ({id}) after {}",
            format_duration(*connected_for)
        )),
        ControlNotice::BroadcastText { text } => Some(text.clone()),
        ControlNotice::Document { .. } => None,
    }
}

pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
