//! Telegram control channel.
//!
//! Operators drive agents from an allow-listed set of chats. Commands that need
//! arguments are collected through `force_reply` prompts: each prompt's
//! `<chat_id>:<message_id>` becomes the token the hub parks the wizard under,
//! and the operator's reply (which Telegram links back via
//! `reply_to_message`) resolves it.

pub mod api;
pub mod menu;
pub mod types;

use std::{collections::HashSet, sync::Arc, time::Duration, time::Instant};

use tokio::sync::watch;

use self::{
    api::TelegramApi,
    menu::{CallbackAction, TextCommand},
    types::{CallbackQuery, Message, Update},
};
use crate::{
    commands::CommandKind,
    correlator::{PendingCommand, PromptToken, Reply},
    error::RelayError,
    events::{ControlNotice, NoticeReceiver},
    hub::{BeginOutcome, Hub, ReplyOutcome},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct ControlChannel {
    api: Arc<TelegramApi>,
    hub: Arc<Hub>,
    allowed_chats: Arc<HashSet<i64>>,
    public_base_url: String,
}

impl ControlChannel {
    pub fn new(
        api: Arc<TelegramApi>,
        hub: Arc<Hub>,
        allowed_chats: impl IntoIterator<Item = i64>,
        public_base_url: String,
    ) -> Self {
        Self {
            api,
            hub,
            allowed_chats: Arc::new(allowed_chats.into_iter().collect()),
            public_base_url,
        }
    }

    fn is_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats.contains(&chat_id)
    }

    /// Poll for operator input until `cancel` flips. Hub notices are forwarded
    /// to every allowed chat and stale prompts swept from side tasks.
    pub async fn run(
        self,
        poll_timeout: u64,
        notices: NoticeReceiver,
        mut cancel: watch::Receiver<bool>,
    ) {
        let forwarder = tokio::spawn(forward_notices(
            self.api.clone(),
            self.allowed_chats.clone(),
            notices,
        ));
        let sweeper = tokio::spawn(sweep_pending(self.hub.clone()));

        let mut offset: Option<i64> = None;
        let mut backoff_secs = 1u64;
        tracing::info!(
            target = "device_relay::telegram",
            chats = self.allowed_chats.len(),
            "control channel started"
        );

        loop {
            if *cancel.borrow() {
                break;
            }
            let updates = tokio::select! {
                result = self.api.get_updates(offset, poll_timeout) => result,
                _ = cancel.changed() => break,
            };

            match updates {
                Ok(updates) => {
                    backoff_secs = 1;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "device_relay::telegram",
                        error = %error,
                        backoff_secs,
                        "getUpdates failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(60);
                }
            }
        }

        forwarder.abort();
        sweeper.abort();
        tracing::info!(target = "device_relay::telegram", "control channel stopped");
    }

    pub async fn handle_update(&self, update: Update) {
        if let Some(message) = update.message {
            self.handle_message(message).await;
        }
        if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        }
    }

    async fn handle_message(&self, message: Message) {
        let chat_id = message.chat.id;
        if !self.is_allowed(chat_id) {
            tracing::debug!(target = "device_relay::telegram", chat_id, "ignoring message from unauthorized chat");
            return;
        }

        if let Some(prompt) = &message.reply_to_message {
            let token = PromptToken::for_message(chat_id, prompt.message_id);
            // Replies to anything other than an open prompt read as plain text.
            if self.hub.has_pending(&token) {
                let reply = Reply {
                    text: message.text_or_caption().map(ToString::to_string),
                    file_id: message.attachment_file_id().map(ToString::to_string),
                };
                self.handle_reply(chat_id, token, reply).await;
                return;
            }
        }

        match message.text.as_deref().and_then(menu::parse_text_command) {
            Some(TextCommand::Agents) => self.post_agents(chat_id).await,
            Some(TextCommand::Help) | None => self.post(chat_id, menu::help_text()).await,
        }
    }

    async fn handle_callback(&self, callback: CallbackQuery) {
        let chat_id = callback.message.as_ref().map(|message| message.chat.id);
        let Some(chat_id) = chat_id.filter(|id| self.is_allowed(*id)) else {
            tracing::debug!(target = "device_relay::telegram", "ignoring callback from unauthorized chat");
            if let Err(error) = self.api.answer_callback_query(&callback.id, None).await {
                tracing::debug!(target = "device_relay::telegram", error = %error, "answerCallbackQuery failed");
            }
            return;
        };

        let action = callback.data.as_deref().and_then(menu::parse_callback);
        let ack = if action.is_some() { None } else { Some("Unknown action") };
        if let Err(error) = self.api.answer_callback_query(&callback.id, ack).await {
            tracing::debug!(target = "device_relay::telegram", error = %error, "answerCallbackQuery failed");
        }

        match action {
            Some(CallbackAction::ListAgents) => self.post_agents(chat_id).await,
            Some(CallbackAction::ShowAgent(agent_id)) => self.post_agent_menu(chat_id, &agent_id).await,
            Some(CallbackAction::Command { command, agent_id }) => {
                self.start_command(chat_id, &agent_id, command).await
            }
            Some(CallbackAction::OpenSession { kind, agent_id }) => {
                if self.hub.agent(&agent_id).is_none() {
                    self.post(chat_id, &not_connected(&agent_id)).await;
                    return;
                }
                match menu::session_page_url(&self.public_base_url, kind, &agent_id) {
                    Some(url) => {
                        let keyboard = menu::session_link_keyboard(kind, url.clone());
                        if let Err(error) = self.api.send_message(chat_id, &url, Some(&keyboard)).await {
                            tracing::warn!(target = "device_relay::telegram", error = %error, "failed to post session link");
                        }
                    }
                    None => {
                        tracing::warn!(
                            target = "device_relay::telegram",
                            base = %self.public_base_url,
                            "public URL is not a valid base for session links"
                        );
                    }
                }
            }
            None => {}
        }
    }

    async fn start_command(&self, chat_id: i64, agent_id: &str, command: CommandKind) {
        match self.hub.begin_command(agent_id, command) {
            Ok(BeginOutcome::Dispatched(dispatch)) => {
                self.post(chat_id, &menu::dispatch_text(&dispatch)).await
            }
            Ok(BeginOutcome::Prompt(text)) => {
                let pending = PendingCommand::new(command, agent_id, Instant::now());
                self.issue_prompt(chat_id, pending, text).await
            }
            Err(error) => self.report(chat_id, &error).await,
        }
    }

    /// Post `text` as a forced reply and park `pending` under its token.
    async fn issue_prompt(&self, chat_id: i64, pending: PendingCommand, text: &str) {
        let message_id = match self.api.send_prompt(chat_id, text).await {
            Ok(message_id) => message_id,
            Err(error) => {
                tracing::warn!(
                    target = "device_relay::telegram",
                    chat_id,
                    command = %pending.command,
                    error = %error,
                    "could not post prompt; wizard abandoned"
                );
                return;
            }
        };
        let token = PromptToken::for_message(chat_id, message_id);
        if let Err(error) = self.hub.park_prompt(token, pending) {
            self.report(chat_id, &error).await;
        }
    }

    async fn handle_reply(&self, chat_id: i64, token: PromptToken, reply: Reply) {
        match self.hub.resolve_reply(&token, &reply) {
            Ok(ReplyOutcome::Dispatched(dispatch)) => {
                self.post(chat_id, &menu::dispatch_text(&dispatch)).await
            }
            Ok(ReplyOutcome::NeedsPrompt { text, next }) => self.issue_prompt(chat_id, next, text).await,
            Ok(ReplyOutcome::NeedsAttachment { file_id, pending }) => {
                let link = self.api.file_link(&file_id).await;
                match self.hub.complete_attachment(&pending, link) {
                    Ok(dispatch) => self.post(chat_id, &menu::dispatch_text(&dispatch)).await,
                    Err(error) => self.report(chat_id, &error).await,
                }
            }
            Ok(ReplyOutcome::Retained) => {
                tracing::debug!(target = "device_relay::telegram", token = %token, "reply ignored; waiting for expected input");
            }
            Err(RelayError::StaleToken(_)) => {
                tracing::debug!(target = "device_relay::telegram", token = %token, "reply to a prompt that is no longer pending");
            }
            Err(error) => self.report(chat_id, &error).await,
        }
    }

    async fn post_agents(&self, chat_id: i64) {
        let agents = self.hub.agents();
        let keyboard = menu::agents_keyboard(&agents);
        let markup = (!agents.is_empty()).then_some(&keyboard);
        if let Err(error) = self
            .api
            .send_message(chat_id, &menu::agents_text(&agents), markup)
            .await
        {
            tracing::warn!(target = "device_relay::telegram", error = %error, "failed to post agent list");
        }
    }

    async fn post_agent_menu(&self, chat_id: i64, agent_id: &str) {
        let Some(agent) = self.hub.agent(agent_id) else {
            self.post(chat_id, &not_connected(agent_id)).await;
            return;
        };
        let keyboard = menu::agent_menu(agent_id);
        if let Err(error) = self
            .api
            .send_message(chat_id, &menu::agent_menu_text(&agent), Some(&keyboard))
            .await
        {
            tracing::warn!(target = "device_relay::telegram", error = %error, "failed to post agent menu");
        }
    }

    async fn report(&self, chat_id: i64, error: &RelayError) {
        let text = match error {
            RelayError::AgentNotFound(id) => not_connected(id),
            RelayError::UpstreamResolution(detail) => format!("Could not fetch the attachment: {detail}"),
            other if other.is_not_found() => format!("Device is no longer reachable: {other}"),
            other if other.is_upstream() => format!("Telegram request failed: {other}"),
            other => format!("Command failed: {other}"),
        };
        self.post(chat_id, &text).await;
    }

    async fn post(&self, chat_id: i64, text: &str) {
        if let Err(error) = self.api.send_message(chat_id, text, None).await {
            tracing::warn!(target = "device_relay::telegram", chat_id, error = %error, "sendMessage failed");
        }
    }
}

fn not_connected(agent_id: &str) -> String {
    format!("Device {agent_id} is not connected.")
}

async fn sweep_pending(hub: Arc<Hub>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        hub.expire_pending();
    }
}

/// Post every hub notice to each allowed chat until the hub side hangs up.
async fn forward_notices(
    api: Arc<TelegramApi>,
    allowed_chats: Arc<HashSet<i64>>,
    mut notices: NoticeReceiver,
) {
    while let Some(notice) = notices.recv().await {
        for &chat_id in allowed_chats.iter() {
            let sent = match &notice {
                ControlNotice::Document {
                    source,
                    filename,
                    bytes,
                } => api
                    .send_document(chat_id, filename, bytes.clone(), &format!("From {source}"))
                    .await,
                other => match menu::notice_text(other) {
                    Some(text) => api.send_message(chat_id, &text, None).await,
                    None => continue,
                },
            };
            if let Err(error) = sent {
                tracing::warn!(
                    target = "device_relay::telegram",
                    chat_id,
                    error = %error,
                    "failed to deliver notice"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use httpmock::prelude::*;
    use serde_json::{json, Value};

    use super::{types::Update, ControlChannel};
    use crate::{
        connection::{ConnectionHandle, Outbound},
        events::{notice_channel, EventEmitter},
        hub::Hub,
        telegram::api::TelegramApi,
    };

    const CHAT: i64 = 42;

    fn channel(server: &MockServer) -> (ControlChannel, Arc<Hub>) {
        let (tx, _rx) = notice_channel();
        let hub = Arc::new(Hub::new(None, tx, EventEmitter::new(false)));
        let api = Arc::new(TelegramApi::with_base_url("TOKEN", &server.base_url()));
        (
            ControlChannel::new(api, hub.clone(), [CHAT], "https://relay.example".into()),
            hub,
        )
    }

    fn update(value: Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    fn agent_frames(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn unauthorized_chat_is_ignored() {
        let server = MockServer::start_async().await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/sendMessage");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 1}}));
            })
            .await;
        let (control, _hub) = channel(&server);

        control
            .handle_update(update(json!({
                "update_id": 1,
                "message": {"message_id": 3, "chat": {"id": 777}, "text": "/agents"}
            })))
            .await;

        send.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn reply_to_a_notice_runs_the_text_command() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/botTOKEN/sendMessage")
                    .body_contains("1 device connected");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 2}}));
            })
            .await;
        let (control, hub) = channel(&server);
        let (conn, _rx) = ConnectionHandle::new();
        hub.register_agent("a1", "Pixel", conn);

        control
            .handle_update(update(json!({
                "update_id": 1,
                "message": {
                    "message_id": 8,
                    "chat": {"id": CHAT},
                    "text": "/agents",
                    "reply_to_message": {"message_id": 7, "chat": {"id": CHAT}}
                }
            })))
            .await;

        list.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_callback_is_still_answered() {
        let server = MockServer::start_async().await;
        let answer = server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/answerCallbackQuery");
                then.status(500);
            })
            .await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/sendMessage");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 1}}));
            })
            .await;
        let (control, _hub) = channel(&server);

        control
            .handle_update(update(json!({
                "update_id": 1,
                "callback_query": {
                    "id": "cb-9",
                    "message": {"message_id": 10, "chat": {"id": 777}},
                    "data": "agents"
                }
            })))
            .await;

        answer.assert_async().await;
        send.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn prompt_reply_dispatches_command() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/answerCallbackQuery");
                then.status(200).json_body(json!({"ok": true, "result": true}));
            })
            .await;
        let prompt = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/botTOKEN/sendMessage")
                    .body_contains("force_reply");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 500}}));
            })
            .await;
        let (control, hub) = channel(&server);
        let (conn, mut agent_rx) = ConnectionHandle::new();
        hub.register_agent("a1", "Pixel", conn);

        control
            .handle_update(update(json!({
                "update_id": 1,
                "callback_query": {
                    "id": "cb-1",
                    "message": {"message_id": 10, "chat": {"id": CHAT}},
                    "data": "cmd:ShowToast:a1"
                }
            })))
            .await;
        prompt.assert_async().await;
        assert_eq!(hub.stats().pending_commands, 1);

        let confirm = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/botTOKEN/sendMessage")
                    .body_contains("ShowToast sent to a1");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 502}}));
            })
            .await;
        control
            .handle_update(update(json!({
                "update_id": 2,
                "message": {
                    "message_id": 501,
                    "chat": {"id": CHAT},
                    "text": "hello there",
                    "reply_to_message": {"message_id": 500, "chat": {"id": CHAT}}
                }
            })))
            .await;

        confirm.assert_async().await;
        assert_eq!(
            agent_frames(&mut agent_rx),
            vec![json!({"type": "command", "command": "ShowToast", "argument": "hello there"})]
        );
        assert_eq!(hub.stats().pending_commands, 0);
    }

    #[tokio::test]
    async fn audio_reply_resolves_file_link() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/getFile");
                then.status(200).json_body(json!({
                    "ok": true,
                    "result": {"file_id": "AUD-1", "file_path": "music/a.mp3"}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/sendMessage");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 9}}));
            })
            .await;
        let (control, hub) = channel(&server);
        let (conn, mut agent_rx) = ConnectionHandle::new();
        hub.register_agent("a1", "Pixel", conn);
        hub.park_prompt(
            crate::correlator::PromptToken::for_message(CHAT, 70),
            crate::correlator::PendingCommand::new(
                crate::commands::CommandKind::PlayAudio,
                "a1",
                std::time::Instant::now(),
            ),
        )
        .unwrap();

        control
            .handle_update(update(json!({
                "update_id": 3,
                "message": {
                    "message_id": 71,
                    "chat": {"id": CHAT},
                    "audio": {"file_id": "AUD-1"},
                    "reply_to_message": {"message_id": 70, "chat": {"id": CHAT}}
                }
            })))
            .await;

        assert_eq!(
            agent_frames(&mut agent_rx),
            vec![json!({
                "type": "command",
                "command": "PlayAudio",
                "argument": format!("{}/file/botTOKEN/music/a.mp3", server.base_url()),
            })]
        );
    }
}
