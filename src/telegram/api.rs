//! Raw calls to the Telegram Bot API.

use reqwest::{multipart, Client};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::types::{ApiResponse, File, InlineKeyboardMarkup, SentMessage, Update};
use crate::error::{RelayError, Result};

pub struct TelegramApi {
    client: Client,
    base_url: String,
    file_base_url: String,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(bot_token, "https://api.telegram.org")
    }

    /// Point the client at another Bot API server (self-hosted or a test mock).
    pub fn with_base_url(bot_token: &str, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: Client::new(),
            base_url: format!("{base}/bot{bot_token}"),
            file_base_url: format!("{base}/file/bot{bot_token}"),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .await?;
        self.unwrap_response(method, resp.json().await?)
    }

    fn unwrap_response<T>(&self, method: &str, api_resp: ApiResponse<T>) -> Result<T> {
        if !api_resp.ok {
            let desc = api_resp.description.unwrap_or_default();
            tracing::warn!(target = "device_relay::telegram", method, error = %desc, "Bot API call failed");
            return Err(RelayError::Telegram(desc));
        }
        api_resp
            .result
            .ok_or_else(|| RelayError::Telegram(format!("{method} returned no result")))
    }

    /// Returns the sent message's id.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<i64> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = serde_json::to_value(markup)?;
        }
        tracing::debug!(target = "device_relay::telegram", chat_id, "sendMessage");
        let sent: SentMessage = self.call("sendMessage", &body).await?;
        Ok(sent.message_id)
    }

    /// Send a prompt that forces the client into reply mode. The returned
    /// message id is what the operator's answer will reference.
    pub async fn send_prompt(&self, chat_id: i64, text: &str) -> Result<i64> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": {"force_reply": true, "selective": true},
        });
        let sent: SentMessage = self.call("sendMessage", &body).await?;
        Ok(sent.message_id)
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        filename: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<i64> {
        let part = multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let resp = self
            .client
            .post(format!("{}/sendDocument", self.base_url))
            .multipart(form)
            .send()
            .await?;
        let sent: SentMessage = self.unwrap_response("sendDocument", resp.json().await?)?;
        Ok(sent.message_id)
    }

    /// Long-poll for updates. `offset` acknowledges everything before it.
    pub async fn get_updates(&self, offset: Option<i64>, timeout: u64) -> Result<Vec<Update>> {
        let mut body = json!({
            "timeout": timeout,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", &body).await
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = json!({"callback_query_id": callback_query_id});
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    /// Resolve an uploaded file to a direct download link.
    pub async fn file_link(&self, file_id: &str) -> Result<String> {
        let file: File = self
            .call("getFile", &json!({"file_id": file_id}))
            .await
            .map_err(|error| RelayError::UpstreamResolution(error.to_string()))?;
        let path = file.file_path.ok_or_else(|| {
            RelayError::UpstreamResolution(format!("file {} has no download path", file.file_id))
        })?;
        Ok(format!("{}/{path}", self.file_base_url))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::TelegramApi;
    use crate::{error::RelayError, telegram::types::InlineKeyboardMarkup};

    #[tokio::test]
    async fn send_message_returns_message_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/botTOKEN/sendMessage")
                    .body_contains("\"chat_id\":42");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 7}}));
            })
            .await;

        let api = TelegramApi::with_base_url("TOKEN", &server.base_url());
        let keyboard = InlineKeyboardMarkup {
            inline_keyboard: Vec::new(),
        };
        let id = api.send_message(42, "hello", Some(&keyboard)).await.unwrap();

        assert_eq!(id, 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn prompt_requests_force_reply() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/botTOKEN/sendMessage")
                    .body_contains("\"force_reply\":true");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"message_id": 99}}));
            })
            .await;

        let api = TelegramApi::with_base_url("TOKEN", &server.base_url());
        assert_eq!(api.send_prompt(42, "Reply with the URL to open.").await.unwrap(), 99);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_surfaces_description() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/getUpdates");
                then.status(200)
                    .json_body(json!({"ok": false, "description": "Unauthorized"}));
            })
            .await;

        let api = TelegramApi::with_base_url("TOKEN", &server.base_url());
        let err = api.get_updates(None, 0).await.unwrap_err();
        assert!(matches!(err, RelayError::Telegram(ref desc) if desc == "Unauthorized"));
    }

    #[tokio::test]
    async fn file_link_joins_file_path() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/getFile");
                then.status(200).json_body(json!({
                    "ok": true,
                    "result": {"file_id": "AUD-1", "file_path": "music/file_3.mp3"}
                }));
            })
            .await;

        let api = TelegramApi::with_base_url("TOKEN", &server.base_url());
        assert_eq!(
            api.file_link("AUD-1").await.unwrap(),
            format!("{}/file/botTOKEN/music/file_3.mp3", server.base_url())
        );
    }

    #[tokio::test]
    async fn file_without_path_is_upstream_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/getFile");
                then.status(200)
                    .json_body(json!({"ok": true, "result": {"file_id": "AUD-1"}}));
            })
            .await;

        let api = TelegramApi::with_base_url("TOKEN", &server.base_url());
        let err = api.file_link("AUD-1").await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamResolution(_)));
    }

    #[tokio::test]
    async fn updates_are_decoded() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/botTOKEN/getUpdates");
                then.status(200).json_body(json!({
                    "ok": true,
                    "result": [
                        {"update_id": 5, "message": {"message_id": 1, "chat": {"id": 42}, "text": "/agents"}}
                    ]
                }));
            })
            .await;

        let api = TelegramApi::with_base_url("TOKEN", &server.base_url());
        let updates = api.get_updates(Some(5), 0).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_id, 5);
    }
}
