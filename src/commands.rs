use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Operator-invokable agent commands.
///
/// The relay does not interpret these beyond collecting their arguments; the
/// agent decides what each one does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Ping,
    DeviceInfo,
    SetDeviceName,
    ShowToast,
    OpenUrl,
    PlayAudio,
    ShowNotification,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Ping,
        CommandKind::DeviceInfo,
        CommandKind::SetDeviceName,
        CommandKind::ShowToast,
        CommandKind::OpenUrl,
        CommandKind::PlayAudio,
        CommandKind::ShowNotification,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Ping => "Ping",
            CommandKind::DeviceInfo => "DeviceInfo",
            CommandKind::SetDeviceName => "SetDeviceName",
            CommandKind::ShowToast => "ShowToast",
            CommandKind::OpenUrl => "OpenUrl",
            CommandKind::PlayAudio => "PlayAudio",
            CommandKind::ShowNotification => "ShowNotification",
        }
    }

    /// Button text for the operator menu.
    pub fn label(self) -> &'static str {
        match self {
            CommandKind::Ping => "Ping",
            CommandKind::DeviceInfo => "Device info",
            CommandKind::SetDeviceName => "Rename",
            CommandKind::ShowToast => "Toast",
            CommandKind::OpenUrl => "Open URL",
            CommandKind::PlayAudio => "Play audio",
            CommandKind::ShowNotification => "Notification",
        }
    }

    /// Names of the arguments collected from operator replies, in reply order.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            CommandKind::Ping | CommandKind::DeviceInfo => &[],
            CommandKind::SetDeviceName
            | CommandKind::ShowToast
            | CommandKind::OpenUrl
            | CommandKind::PlayAudio => &["argument"],
            CommandKind::ShowNotification => &["title", "link"],
        }
    }

    /// The final reply must carry a file instead of text.
    pub fn expects_attachment(self) -> bool {
        matches!(self, CommandKind::PlayAudio)
    }

    /// Prompt text for the reply at `step` (0-based).
    pub fn prompt(self, step: usize) -> &'static str {
        match (self, step) {
            (CommandKind::SetDeviceName, _) => "Reply with the new device name.",
            (CommandKind::ShowToast, _) => "Reply with the toast text.",
            (CommandKind::OpenUrl, _) => "Reply with the URL to open.",
            (CommandKind::PlayAudio, _) => "Reply with an audio file to play.",
            (CommandKind::ShowNotification, 0) => "Reply with the notification title.",
            (CommandKind::ShowNotification, _) => "Reply with the link the notification opens.",
            (CommandKind::Ping | CommandKind::DeviceInfo, _) => "",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| format!("unknown command: {raw}"))
    }
}
