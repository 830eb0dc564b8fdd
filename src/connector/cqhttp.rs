//! OneBot/CQHttp connector: raw WebSocket event stream ingress, HTTP action
//! API egress. Edits are implemented as delete-then-resend since the
//! protocol has no in-place edit action; the resend's new id is returned so
//! the hub can update the correspondence row.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{download_to_cache, hub_cache_dir};
use crate::connector::{Connector, RemoteId};
use crate::hub::Hub;
use crate::message::{Attachment, Message};

const PLATFORM: &str = "cqhttp";

struct Inner {
    ws_url: String,
    http_url: String,
    client: reqwest::Client,
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
    nicknames: RwLock<HashMap<String, HashMap<String, String>>>,
    self_id: OnceLock<String>,
}

pub struct CqHttpConnector {
    inner: Arc<Inner>,
}

impl CqHttpConnector {
    pub fn new(ws_url: String, http_url: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                ws_url,
                http_url,
                client: reqwest::Client::new(),
                hubs: RwLock::new(HashMap::new()),
                nicknames: RwLock::new(HashMap::new()),
                self_id: OnceLock::new(),
            }),
        }
    }

    async fn call_action(&self, action: &str, params: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/{action}", self.inner.http_url.trim_end_matches('/'));
        let resp: Value = self
            .inner
            .client
            .post(url)
            .json(params)
            .send()
            .await
            .with_context(|| format!("calling cqhttp action {action}"))?
            .error_for_status()
            .with_context(|| format!("cqhttp action {action} returned an error status"))?
            .json()
            .await
            .with_context(|| format!("decoding cqhttp action {action} response"))?;
        if resp.get("status").and_then(Value::as_str) == Some("failed") {
            anyhow::bail!("cqhttp action {action} failed: {resp}");
        }
        Ok(resp)
    }

    async fn refresh_nicknames(&self, group_id: &str) -> anyhow::Result<()> {
        let group_id_num: i64 = group_id
            .parse()
            .with_context(|| format!("group id {group_id:?} is not numeric"))?;
        let resp = self
            .call_action("get_group_member_list", &json!({ "group_id": group_id_num }))
            .await
            .context("listing cqhttp group members")?;
        let mut table = HashMap::new();
        if let Some(members) = resp.get("data").and_then(Value::as_array) {
            for member in members {
                let Some(user_id) = member.get("user_id").and_then(|v| {
                    v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string()))
                }) else {
                    continue;
                };
                let card = member.get("card").and_then(Value::as_str).unwrap_or("");
                let nickname = member.get("nickname").and_then(Value::as_str).unwrap_or("");
                let name = if !card.is_empty() { card } else { nickname };
                if !name.is_empty() {
                    table.insert(user_id, name.to_string());
                }
            }
        }
        self.inner
            .nicknames
            .write()
            .await
            .insert(group_id.to_string(), table);
        Ok(())
    }

    async fn display_name(&self, group_id: &str, user_id: &str) -> String {
        self.inner
            .nicknames
            .read()
            .await
            .get(group_id)
            .and_then(|t| t.get(user_id))
            .cloned()
            .unwrap_or_else(|| user_id.to_string())
    }

    async fn handle_event(&self, event: &Value) {
        if let Some(self_id) = event.get("self_id") {
            let id_str = self_id
                .as_str()
                .map(str::to_string)
                .or_else(|| self_id.as_i64().map(|n| n.to_string()));
            if let Some(id_str) = id_str {
                let _ = self.inner.self_id.set(id_str);
            }
        }

        match event.get("post_type").and_then(Value::as_str).unwrap_or("") {
            "message" => self.handle_message(event).await,
            "notice" => self.handle_notice(event).await,
            other => debug!(post_type = other, "ignoring cqhttp event"),
        }
    }

    async fn handle_message(&self, event: &Value) {
        let user_id = numeric_field(event, "user_id");
        if let (Some(self_id), Some(user_id)) = (self.inner.self_id.get(), &user_id) {
            if self_id == user_id {
                return;
            }
        }
        let Some(group_id) = numeric_field(event, "group_id") else {
            return;
        };
        let Some(hub) = self.inner.hubs.read().await.get(&group_id).cloned() else {
            return;
        };

        let author = match &user_id {
            Some(uid) => self.display_name(&group_id, uid).await,
            None => "unknown".to_string(),
        };

        let mut text = String::new();
        let mut reply_ref = None;
        let mut attachments = Vec::new();
        let cache_dir = hub_cache_dir(&hub.name);

        match event.get("message") {
            Some(Value::Array(segments)) => {
                for segment in segments {
                    let kind = segment.get("type").and_then(Value::as_str).unwrap_or("");
                    let data = segment.get("data").cloned().unwrap_or(Value::Null);
                    match kind {
                        "reply" => {
                            reply_ref = data.get("id").and_then(Value::as_str).map(str::to_string);
                        }
                        "text" => {
                            if let Some(t) = data.get("text").and_then(Value::as_str) {
                                text.push_str(t);
                            }
                        }
                        "image" => {
                            if let Some(url) = data.get("url").and_then(Value::as_str) {
                                let stem = format!(
                                    "cqhttp_{}",
                                    data.get("file").and_then(Value::as_str).unwrap_or("image")
                                );
                                match download_to_cache(&self.inner.client, url, &cache_dir, &stem, None)
                                    .await
                                {
                                    Ok(path) => attachments.push(Attachment {
                                        name: stem,
                                        mime_type: Some("image".to_string()),
                                        file_path: path,
                                    }),
                                    Err(e) => warn!(error = %e, "failed to download cqhttp image"),
                                }
                            }
                        }
                        other => debug!(segment_type = other, "ignoring unhandled cqhttp segment"),
                    }
                }
            }
            Some(Value::String(raw)) => text.push_str(raw),
            _ => {}
        }

        let message = Message {
            origin_platform: PLATFORM,
            origin_channel_id: group_id,
            origin_message_id: numeric_field(event, "message_id").unwrap_or_default(),
            origin_reply_ref_id: reply_ref,
            author_display_name: author,
            text,
            attachments,
        };
        hub.on_new_message(message).await;
    }

    async fn handle_notice(&self, event: &Value) {
        if event.get("notice_type").and_then(Value::as_str) != Some("group_recall") {
            return;
        }
        let user_id = numeric_field(event, "user_id");
        if let (Some(self_id), Some(user_id)) = (self.inner.self_id.get(), &user_id) {
            if self_id == user_id {
                return;
            }
        }
        let Some(group_id) = numeric_field(event, "group_id") else {
            return;
        };
        let Some(hub) = self.inner.hubs.read().await.get(&group_id).cloned() else {
            return;
        };
        if let Some(message_id) = numeric_field(event, "message_id") {
            hub.on_delete(PLATFORM, message_id).await;
        }
    }
}

fn numeric_field(event: &Value, key: &str) -> Option<String> {
    event
        .get(key)
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
}

#[async_trait]
impl Connector for CqHttpConnector {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn add_hub(&self, remote_channel_id: String, hub: Arc<Hub>) {
        self.inner
            .hubs
            .write()
            .await
            .insert(remote_channel_id.clone(), hub);
        if let Err(e) = self.refresh_nicknames(&remote_channel_id).await {
            warn!(error = %e, group_id = %remote_channel_id, "failed to fetch cqhttp group members");
        }
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let (ws, _) = match tokio_tungstenite::connect_async(&self.inner.ws_url).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to connect cqhttp websocket, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            let (_write, mut read) = ws.split();

            'inner: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Ok(());
                    }
                    frame = read.next() => {
                        let Some(frame) = frame else {
                            info!("cqhttp websocket closed, reconnecting");
                            break 'inner;
                        };
                        let frame = match frame {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(error = %e, "cqhttp websocket read error, reconnecting");
                                break 'inner;
                            }
                        };
                        let WsMessage::Text(text) = frame else { continue };
                        let Ok(event) = serde_json::from_str::<Value>(&text) else { continue };
                        self.handle_event(&event).await;
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
        let mut cq = String::new();
        for attachment in &message.attachments {
            let main_type = attachment
                .mime_type
                .as_deref()
                .and_then(|m| m.split('/').next())
                .unwrap_or("image");
            cq.push_str(&format!(
                "[CQ:{main_type},file=file:{}]",
                attachment.file_path.display()
            ));
        }
        if let Some(ref_id) = reply_ref_id {
            cq.push_str(&format!("[CQ:reply,id={ref_id}]"));
        }
        cq.push_str(&message.formatted_body());

        let group_id: i64 = remote_channel_id
            .parse()
            .with_context(|| format!("group id {remote_channel_id:?} is not numeric"))?;
        let resp = self
            .call_action("send_group_msg", &json!({ "group_id": group_id, "message": cq }))
            .await
            .context("sending cqhttp group message")?;
        resp.get("data")
            .and_then(|d| d.get("message_id"))
            .and_then(|v| v.as_i64().map(|n| n.to_string()).or_else(|| v.as_str().map(str::to_string)))
            .context("send_group_msg response missing message_id")
    }

    async fn edit(
        &self,
        message: &Message,
        remote_channel_id: &str,
        remote_id: &str,
    ) -> anyhow::Result<RemoteId> {
        self.delete(remote_channel_id, remote_id).await?;
        self.send(message, remote_channel_id, None).await
    }

    async fn delete(&self, _remote_channel_id: &str, remote_id: &str) -> anyhow::Result<()> {
        let message_id: i64 = remote_id
            .parse()
            .with_context(|| format!("message id {remote_id:?} is not numeric"))?;
        self.call_action("delete_msg", &json!({ "message_id": message_id }))
            .await
            .context("deleting cqhttp message")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_composes_cq_reply_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send_group_msg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "status": "ok", "retcode": 0, "data": { "message_id": 42 } }),
            ))
            .mount(&server)
            .await;

        let connector = CqHttpConnector::new("ws://unused".to_string(), server.uri());
        let message = Message {
            origin_platform: "discord",
            origin_channel_id: "c".to_string(),
            origin_message_id: "1".to_string(),
            origin_reply_ref_id: None,
            author_display_name: "alice".to_string(),
            text: "hi".to_string(),
            attachments: Vec::new(),
        };
        let id = connector.send(&message, "123", Some("7")).await.unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn edit_deletes_then_resends() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delete_msg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok", "retcode": 0 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/send_group_msg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "status": "ok", "retcode": 0, "data": { "message_id": 99 } }),
            ))
            .mount(&server)
            .await;

        let connector = CqHttpConnector::new("ws://unused".to_string(), server.uri());
        let message = Message {
            origin_platform: "discord",
            origin_channel_id: "c".to_string(),
            origin_message_id: "1".to_string(),
            origin_reply_ref_id: None,
            author_display_name: "alice".to_string(),
            text: "edited".to_string(),
            attachments: Vec::new(),
        };
        let new_id = connector.edit(&message, "123", "41").await.unwrap();
        assert_eq!(new_id, "99");
    }
}
