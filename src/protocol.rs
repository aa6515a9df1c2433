use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    List,
    Download,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::List => "list",
            FileAction::Download => "download",
        }
    }
}

/// Inbound WebSocket frames, discriminated by `type`.
///
/// Fields not named here are ignored while decoding; frames that are relayed
/// verbatim keep their full original JSON alongside the decoded variant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
    AgentAnnounce {
        id: String,
        #[serde(default)]
        name: Option<String>,
    },
    ControlBroadcastText {
        text: String,
    },
    ShellOpen {
        target: String,
    },
    ShellCommand {
        command: String,
    },
    ShellOutput {
        #[serde(rename = "replyTo")]
        reply_to: String,
    },
    FilebrowserOpen {
        target: String,
    },
    FilebrowserRequest {
        action: FileAction,
        path: String,
    },
    FilebrowserResponse {
        #[serde(rename = "replyTo")]
        reply_to: String,
    },
}

impl InboundFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundFrame::AgentAnnounce { .. } => "agent-announce",
            InboundFrame::ControlBroadcastText { .. } => "control-broadcast-text",
            InboundFrame::ShellOpen { .. } => "shell-open",
            InboundFrame::ShellCommand { .. } => "shell-command",
            InboundFrame::ShellOutput { .. } => "shell-output",
            InboundFrame::FilebrowserOpen { .. } => "filebrowser-open",
            InboundFrame::FilebrowserRequest { .. } => "filebrowser-request",
            InboundFrame::FilebrowserResponse { .. } => "filebrowser-response",
        }
    }
}

/// Decode a text frame into its typed variant plus the raw JSON.
pub fn parse_frame(text: &str) -> Result<(InboundFrame, Value)> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|error| RelayError::MalformedMessage(format!("invalid JSON: {error}")))?;
    if raw.get("type").and_then(Value::as_str).is_none() {
        return Err(RelayError::MalformedMessage(
            "missing `type` discriminator".into(),
        ));
    }
    let frame = InboundFrame::deserialize(&raw)
        .map_err(|error| RelayError::MalformedMessage(error.to_string()))?;
    Ok((frame, raw))
}

pub fn shell_command_frame(command: &str, session_id: &str) -> Value {
    json!({
        "type": "shell-command",
        "command": command,
        "replyTo": session_id,
    })
}

pub fn file_request_frame(action: FileAction, path: &str, session_id: &str) -> Value {
    json!({
        "type": action.as_str(),
        "path": path,
        "replyTo": session_id,
    })
}

pub fn session_opened_frame(session_id: &str, agent_name: &str) -> Value {
    json!({
        "type": "session-opened",
        "sessionId": session_id,
        "agent": agent_name,
    })
}

pub fn target_gone_frame(target: &str) -> Value {
    json!({
        "type": "target-gone",
        "target": target,
        "message": format!("agent {target} is not connected"),
    })
}

pub fn target_disconnected_frame(agent_id: &str) -> Value {
    json!({
        "type": "target-disconnected",
        "target": agent_id,
        "message": format!("agent {agent_id} disconnected"),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{file_request_frame, parse_frame, FileAction, InboundFrame};
    use crate::error::RelayError;

    #[test]
    fn parses_agent_announce() {
        let (frame, _) = parse_frame(r#"{"type":"agent-announce","id":"a1","name":"Pixel"}"#)
            .expect("announce should parse");
        assert_eq!(
            frame,
            InboundFrame::AgentAnnounce {
                id: "a1".into(),
                name: Some("Pixel".into()),
            }
        );
    }

    #[test]
    fn shell_output_keeps_raw_payload() {
        let text = r#"{"type":"shell-output","replyTo":"s1","output":"total 0\n","exit":0}"#;
        let (frame, raw) = parse_frame(text).unwrap();
        assert_eq!(
            frame,
            InboundFrame::ShellOutput {
                reply_to: "s1".into()
            }
        );
        assert_eq!(raw["output"], "total 0\n");
        assert_eq!(raw["exit"], 0);
    }

    #[test]
    fn filebrowser_request_action() {
        let (frame, _) =
            parse_frame(r#"{"type":"filebrowser-request","action":"download","path":"/a.txt"}"#)
                .unwrap();
        assert_eq!(
            frame,
            InboundFrame::FilebrowserRequest {
                action: FileAction::Download,
                path: "/a.txt".into(),
            }
        );
        assert_eq!(frame.type_name(), "filebrowser-request");
    }

    #[test]
    fn malformed_frames_are_classified() {
        for text in [
            "not json",
            r#"{"id":"a1"}"#,
            r#"{"type":"warp-drive"}"#,
            r#"{"type":"shell-open"}"#,
        ] {
            assert!(
                matches!(parse_frame(text), Err(RelayError::MalformedMessage(_))),
                "{text} should be malformed"
            );
        }
    }

    #[test]
    fn file_request_uses_action_as_type() {
        assert_eq!(
            file_request_frame(FileAction::List, "/sdcard", "s9"),
            json!({"type": "list", "path": "/sdcard", "replyTo": "s9"})
        );
    }
}
