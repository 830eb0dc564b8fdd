//! Slack connector: Socket Mode ingress over a `tokio-tungstenite`
//! WebSocket, REST egress via the Web API.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{download_to_cache, hub_cache_dir};
use crate::connector::{Connector, RemoteId};
use crate::hub::Hub;
use crate::message::{Attachment, Message};

const PLATFORM: &str = "slack";
const API_BASE: &str = "https://slack.com/api";

struct Inner {
    app_token: String,
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
    usernames: RwLock<HashMap<String, String>>,
    bot_user_id: OnceLock<String>,
}

pub struct SlackConnector {
    inner: Arc<Inner>,
}

impl SlackConnector {
    pub fn new(app_token: String, bot_token: String) -> Self {
        Self::with_api_base(app_token, bot_token, API_BASE.to_string())
    }

    fn with_api_base(app_token: String, bot_token: String, api_base: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                app_token,
                bot_token,
                api_base,
                client: reqwest::Client::new(),
                hubs: RwLock::new(HashMap::new()),
                usernames: RwLock::new(HashMap::new()),
                bot_user_id: OnceLock::new(),
            }),
        }
    }

    async fn post(&self, method: &str, body: &Value) -> anyhow::Result<Value> {
        let api_base = &self.inner.api_base;
        let resp: Value = self
            .inner
            .client
            .post(format!("{api_base}/{method}"))
            .bearer_auth(&self.inner.bot_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("calling slack {method}"))?
            .error_for_status()
            .with_context(|| format!("slack {method} returned an error status"))?
            .json()
            .await
            .with_context(|| format!("decoding slack {method} response"))?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            anyhow::bail!("slack {method} failed: {resp}");
        }
        Ok(resp)
    }

    async fn resolve_bot_user_id(&self) -> anyhow::Result<()> {
        if self.inner.bot_user_id.get().is_some() {
            return Ok(());
        }
        let resp = self.post("auth.test", &json!({})).await?;
        let user_id = resp
            .get("user_id")
            .and_then(Value::as_str)
            .context("auth.test response missing user_id")?
            .to_string();
        let _ = self.inner.bot_user_id.set(user_id);
        Ok(())
    }

    async fn username(&self, user_id: &str) -> String {
        if let Some(cached) = self.inner.usernames.read().await.get(user_id) {
            return cached.clone();
        }
        match self
            .post("users.info", &json!({ "user": user_id }))
            .await
        {
            Ok(resp) => {
                let name = resp
                    .get("user")
                    .and_then(|u| u.get("real_name").or_else(|| u.get("name")))
                    .and_then(Value::as_str)
                    .unwrap_or(user_id)
                    .to_string();
                self.inner
                    .usernames
                    .write()
                    .await
                    .insert(user_id.to_string(), name.clone());
                name
            }
            Err(e) => {
                warn!(error = %e, %user_id, "failed to resolve slack username");
                user_id.to_string()
            }
        }
    }

    async fn hub_for(&self, channel_id: &str) -> Option<Arc<Hub>> {
        self.inner.hubs.read().await.get(channel_id).cloned()
    }

    async fn open_socket_url(&self) -> anyhow::Result<String> {
        let resp: Value = self
            .inner
            .client
            .post(format!("{}/apps.connections.open", self.inner.api_base))
            .bearer_auth(&self.inner.app_token)
            .send()
            .await
            .context("opening slack socket-mode connection")?
            .error_for_status()
            .context("slack apps.connections.open returned an error status")?
            .json()
            .await
            .context("decoding apps.connections.open response")?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            anyhow::bail!("apps.connections.open failed: {resp}");
        }
        resp.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("apps.connections.open response missing url")
    }

    async fn handle_event(&self, event: &Value) {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        if event_type != "message" {
            debug!(event_type, "ignoring non-message slack event");
            return;
        }

        let Some(channel) = event.get("channel").and_then(Value::as_str) else {
            return;
        };
        let Some(hub) = self.hub_for(channel).await else {
            return;
        };
        let subtype = event.get("subtype").and_then(Value::as_str);

        if subtype == Some("message_deleted") {
            if let Some(ts) = event.get("deleted_ts").and_then(Value::as_str) {
                hub.on_delete(PLATFORM, ts.to_string()).await;
            }
            return;
        }

        let user_id = event.get("user").and_then(Value::as_str);
        if let Some(uid) = user_id {
            if self.inner.bot_user_id.get().map(String::as_str) == Some(uid) {
                return;
            }
        }

        match subtype {
            Some("message_changed") => {
                let Some(nested) = event.get("message") else {
                    return;
                };
                let text = nested
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let ts = nested
                    .get("ts")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let author = match nested.get("user").and_then(Value::as_str) {
                    Some(uid) => self.username(uid).await,
                    None => nested
                        .get("username")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                };
                let message = Message {
                    origin_platform: PLATFORM,
                    origin_channel_id: channel.to_string(),
                    origin_message_id: ts,
                    origin_reply_ref_id: None,
                    author_display_name: author,
                    text,
                    attachments: Vec::new(),
                };
                hub.on_edit(message).await;
            }
            Some("file_share") => {
                let author = match user_id {
                    Some(uid) => self.username(uid).await,
                    None => event
                        .get("username")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                };
                let attachments = self.download_files(event, &hub.name).await;
                let message = self.build_message(event, channel, author, attachments);
                hub.on_new_message(message).await;
            }
            None => {
                let author = match user_id {
                    Some(uid) => self.username(uid).await,
                    None => event
                        .get("username")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                };
                let message = self.build_message(event, channel, author, Vec::new());
                hub.on_new_message(message).await;
            }
            Some(other) => {
                debug!(subtype = other, "ignoring unhandled slack message subtype");
            }
        }
    }

    fn build_message(
        &self,
        event: &Value,
        channel: &str,
        author: String,
        attachments: Vec<Attachment>,
    ) -> Message {
        Message {
            origin_platform: PLATFORM,
            origin_channel_id: channel.to_string(),
            origin_message_id: event
                .get("ts")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            origin_reply_ref_id: event
                .get("thread_ts")
                .and_then(Value::as_str)
                .map(str::to_string),
            author_display_name: author,
            text: event
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            attachments,
        }
    }

    async fn download_files(&self, event: &Value, hub_name: &str) -> Vec<Attachment> {
        let mut out = Vec::new();
        let Some(files) = event.get("files").and_then(Value::as_array) else {
            return out;
        };
        let directory = hub_cache_dir(hub_name);
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", self.inner.bot_token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        for file in files {
            let Some(url) = file.get("url_private").and_then(Value::as_str) else {
                continue;
            };
            let id = file.get("id").and_then(Value::as_str).unwrap_or("file");
            let stem = format!("slack_{id}");
            match download_to_cache(&self.inner.client, url, &directory, &stem, Some(headers.clone()))
                .await
            {
                Ok(path) => out.push(Attachment {
                    name: file
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(id)
                        .to_string(),
                    mime_type: file
                        .get("mimetype")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    file_path: path,
                }),
                Err(e) => warn!(error = %e, %id, "failed to download slack attachment"),
            }
        }
        out
    }

    async fn upload_attachment(&self, remote_channel_id: &str, attachment: &Attachment) {
        let form = match reqwest::multipart::Form::new()
            .text("channels", remote_channel_id.to_string())
            .file("file", &attachment.file_path)
            .await
        {
            Ok(form) => form,
            Err(e) => {
                warn!(error = %e, path = %attachment.file_path.display(), "failed to build upload form");
                return;
            }
        };
        if let Err(e) = self
            .inner
            .client
            .post(format!("{}/files.upload", self.inner.api_base))
            .bearer_auth(&self.inner.bot_token)
            .multipart(form)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            warn!(error = %e, "slack files.upload failed");
        }
    }
}

#[async_trait]
impl Connector for SlackConnector {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn add_hub(&self, remote_channel_id: String, hub: Arc<Hub>) {
        self.inner.hubs.write().await.insert(remote_channel_id, hub);
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.resolve_bot_user_id().await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let url = match self.open_socket_url().await {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "failed to open slack socket-mode connection, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            let (ws, _) = match tokio_tungstenite::connect_async(&url).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to connect slack websocket, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            let (mut write, mut read) = ws.split();

            'inner: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Ok(());
                    }
                    frame = read.next() => {
                        let Some(frame) = frame else {
                            info!("slack websocket closed, reconnecting");
                            break 'inner;
                        };
                        let frame = match frame {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(error = %e, "slack websocket read error, reconnecting");
                                break 'inner;
                            }
                        };
                        let WsMessage::Text(text) = frame else { continue };
                        let Ok(envelope) = serde_json::from_str::<Value>(&text) else { continue };
                        match envelope.get("type").and_then(Value::as_str).unwrap_or("") {
                            "hello" => {}
                            "disconnect" => break 'inner,
                            "events_api" => {
                                if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                                    let ack = json!({ "envelope_id": envelope_id }).to_string();
                                    if let Err(e) = write.send(WsMessage::Text(ack)).await {
                                        warn!(error = %e, "failed to ack slack event");
                                    }
                                }
                                if let Some(event) = envelope.get("payload").and_then(|p| p.get("event")) {
                                    self.handle_event(event).await;
                                }
                            }
                            other => debug!(envelope_type = other, "ignoring slack envelope"),
                        }
                    }
                }
            }
        }
    }

    async fn send(
        &self,
        message: &Message,
        remote_channel_id: &str,
        reply_ref_id: Option<&str>,
    ) -> anyhow::Result<RemoteId> {
        let mut body = json!({
            "channel": remote_channel_id,
            "text": message.formatted_body(),
            "username": message.author_display_name,
        });
        if let Some(thread_ts) = reply_ref_id {
            body["thread_ts"] = json!(thread_ts);
        }
        let resp = self.post("chat.postMessage", &body).await?;
        for attachment in &message.attachments {
            self.upload_attachment(remote_channel_id, attachment).await;
        }
        resp.get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("chat.postMessage response missing ts")
    }

    async fn edit(
        &self,
        message: &Message,
        remote_channel_id: &str,
        remote_id: &str,
    ) -> anyhow::Result<RemoteId> {
        self.post(
            "chat.update",
            &json!({
                "channel": remote_channel_id,
                "ts": remote_id,
                "text": message.formatted_body(),
            }),
        )
        .await?;
        Ok(remote_id.to_string())
    }

    async fn delete(&self, remote_channel_id: &str, remote_id: &str) -> anyhow::Result<()> {
        self.post(
            "chat.delete",
            &json!({ "channel": remote_channel_id, "ts": remote_id }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(base: String) -> SlackConnector {
        SlackConnector::with_api_base("app-token".to_string(), "bot-token".to_string(), base)
    }

    #[tokio::test]
    async fn post_rejects_non_ok_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "ok": false, "error": "channel_not_found" })),
            )
            .mount(&server)
            .await;

        let connector = connector(server.uri());
        let err = connector
            .post("chat.postMessage", &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel_not_found"));
    }

    #[tokio::test]
    async fn send_returns_ts_from_post_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "ts": "123.456" })),
            )
            .mount(&server)
            .await;

        let connector = connector(server.uri());
        let message = Message {
            origin_platform: "discord",
            origin_channel_id: "c".to_string(),
            origin_message_id: "1".to_string(),
            origin_reply_ref_id: None,
            author_display_name: "alice".to_string(),
            text: "hi".to_string(),
            attachments: Vec::new(),
        };
        let id = connector.send(&message, "C123", None).await.unwrap();
        assert_eq!(id, "123.456");
    }
}
