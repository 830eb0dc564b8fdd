//! Discord connector: ingress via serenity's gateway client, egress via its
//! `Http` REST surface. Custom emoji and sticker tokens are resolved to
//! downloaded attachments and stripped from the relayed text.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use serenity::all::{
    ChannelId, Context, CreateAttachment, CreateMessage, EditMessage, EventHandler, GatewayIntents,
    GuildId, Message as GatewayMessage, MessageId, MessageUpdateEvent, Ready, StickerFormatType,
};
use serenity::http::Http;
use serenity::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{download_to_cache, hub_cache_dir};
use crate::connector::{Connector, RemoteId};
use crate::hub::Hub;
use crate::message::{Attachment, Message};

const PLATFORM: &str = "discord";

fn custom_emoji_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(a)?:(\w+):(\d+)>").unwrap())
}

struct Inner {
    token: String,
    guild_id: String,
    http: Http,
    reqwest: reqwest::Client,
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
    nicknames: RwLock<HashMap<String, HashMap<String, String>>>,
    bot_user_id: OnceLock<u64>,
}

/// Discord platform adapter. Ingress runs on serenity's gateway client;
/// egress goes straight through `Http`.
pub struct DiscordConnector {
    inner: Arc<Inner>,
}

impl DiscordConnector {
    pub fn new(bot_token: String, guild_id: String) -> Self {
        let http = Http::new(&bot_token);
        Self {
            inner: Arc::new(Inner {
                token: bot_token,
                guild_id,
                http,
                reqwest: reqwest::Client::new(),
                hubs: RwLock::new(HashMap::new()),
                nicknames: RwLock::new(HashMap::new()),
                bot_user_id: OnceLock::new(),
            }),
        }
    }

    async fn refresh_nicknames(&self, channel_id: &str) -> anyhow::Result<()> {
        let guild_id: u64 = self
            .inner
            .guild_id
            .parse()
            .with_context(|| format!("guild_id {:?} is not numeric", self.inner.guild_id))?;
        let members = GuildId::new(guild_id)
            .members(&self.inner.http, Some(1000), None)
            .await
            .context("listing guild members")?;

        let mut table = HashMap::new();
        for member in members {
            if let Some(nick) = member.nick {
                table.insert(member.user.id.to_string(), nick);
            }
        }
        self.inner
            .nicknames
            .write()
            .await
            .insert(channel_id.to_string(), table);
        Ok(())
    }

}

/// Resolve and strip `<:name:id>` / `<a:name:id>` custom emoji tokens from
/// `text`, downloading each referenced emoji into `directory`.
async fn extract_custom_emoji(
    client: &reqwest::Client,
    text: &str,
    directory: &std::path::Path,
) -> (String, Vec<Attachment>) {
    let mut attachments = Vec::new();
    let mut stripped = text.to_string();

    for caps in custom_emoji_re().captures_iter(text) {
        let animated = caps.get(1).is_some();
        let id = &caps[3];
        let ext = if animated { "gif" } else { "png" };
        let url = format!("https://cdn.discordapp.com/emojis/{id}.{ext}");
        let stem = format!("discord_{id}");
        match download_to_cache(client, &url, directory, &stem, None).await {
            Ok(path) => attachments.push(Attachment {
                name: format!("{}.{ext}", &caps[2]),
                mime_type: Some(format!("image/{ext}")),
                file_path: path,
            }),
            Err(e) => warn!(error = %e, %id, "failed to download custom emoji"),
        }
        stripped = stripped.replace(&caps[0], "");
    }

    (stripped, attachments)
}

struct HandlerBridge {
    connector: Arc<Inner>,
}

impl HandlerBridge {
    async fn attachments_for(
        &self,
        msg: &GatewayMessage,
        cache_dir: &std::path::Path,
    ) -> Vec<Attachment> {
        let mut out = Vec::new();
        for native in &msg.attachments {
            let stem = format!("discord_{}", native.id);
            match download_to_cache(&self.connector.reqwest, &native.url, cache_dir, &stem, None)
                .await
            {
                Ok(path) => out.push(Attachment {
                    name: native.filename.clone(),
                    mime_type: native.content_type.clone(),
                    file_path: path,
                }),
                Err(e) => warn!(error = %e, id = %native.id, "failed to download native attachment"),
            }
        }
        for sticker in &msg.sticker_items {
            let ext = match sticker.format_type {
                StickerFormatType::Png => "png",
                StickerFormatType::Apng => "apng",
                _ => {
                    debug!(id = %sticker.id, "skipping unsupported sticker format");
                    continue;
                }
            };
            let url = format!("https://cdn.discordapp.com/stickers/{}.{ext}", sticker.id);
            let stem = format!("discord_{}", sticker.id);
            match download_to_cache(&self.connector.reqwest, &url, cache_dir, &stem, None).await {
                Ok(path) => out.push(Attachment {
                    name: format!("{}.{ext}", sticker.name),
                    mime_type: Some(format!("image/{ext}")),
                    file_path: path,
                }),
                Err(e) => warn!(error = %e, id = %sticker.id, "failed to download sticker"),
            }
        }
        out
    }
}

#[async_trait]
impl EventHandler for HandlerBridge {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        let id = ready.user.id.get();
        let _ = self.connector.bot_user_id.set(id);
        info!(bot_id = id, "discord gateway ready");
    }

    async fn message(&self, _ctx: Context, msg: GatewayMessage) {
        if self.connector.bot_user_id.get() == Some(&msg.author.id.get()) {
            return;
        }
        let channel_id = msg.channel_id.to_string();
        let hubs = self.connector.hubs.read().await;
        let Some(hub) = hubs.get(&channel_id).cloned() else {
            return;
        };
        drop(hubs);

        let cache_dir = hub_cache_dir(&hub.name);
        let (text, mut attachments) =
            extract_custom_emoji(&self.connector.reqwest, &msg.content, &cache_dir).await;
        attachments.extend(self.attachments_for(&msg, &cache_dir).await);

        let username = self
            .connector
            .nicknames
            .read()
            .await
            .get(&channel_id)
            .and_then(|t| t.get(&msg.author.id.to_string()))
            .cloned()
            .unwrap_or_else(|| msg.author.name.clone());

        let message = Message {
            origin_platform: PLATFORM,
            origin_channel_id: channel_id,
            origin_message_id: msg.id.to_string(),
            origin_reply_ref_id: msg.referenced_message.as_ref().map(|m| m.id.to_string()),
            author_display_name: username,
            text,
            attachments,
        };
        hub.on_new_message(message).await;
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old: Option<GatewayMessage>,
        _new: Option<GatewayMessage>,
        event: MessageUpdateEvent,
    ) {
        let Some(text) = event.content else {
            return;
        };
        let channel_id = event.channel_id.to_string();
        let Some(hub) = self.connector.hubs.read().await.get(&channel_id).cloned() else {
            return;
        };
        let Some(author) = event.author else {
            return;
        };
        if self.connector.bot_user_id.get() == Some(&author.id.get()) {
            return;
        }
        let username = self
            .connector
            .nicknames
            .read()
            .await
            .get(&channel_id)
            .and_then(|t| t.get(&author.id.to_string()))
            .cloned()
            .unwrap_or(author.name.clone());

        let message = Message {
            origin_platform: PLATFORM,
            origin_channel_id: channel_id,
            origin_message_id: event.id.to_string(),
            origin_reply_ref_id: None,
            author_display_name: username,
            text,
            attachments: Vec::new(),
        };
        hub.on_edit(message).await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        let Some(hub) = self
            .connector
            .hubs
            .read()
            .await
            .get(&channel_id.to_string())
            .cloned()
        else {
            return;
        };
        hub.on_delete(PLATFORM, deleted_message_id.to_string()).await;
    }
}

#[async_trait]
impl Connector for DiscordConnector {
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
            warn!(error = %e, channel = %remote_channel_id, "failed to fetch guild nicknames");
        }
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;
        let handler = HandlerBridge {
            connector: self.inner.clone(),
        };
        let mut client = Client::builder(&self.inner.token, intents)
            .event_handler(handler)
            .await
            .context("building discord gateway client")?;
        let shard_manager = client.shard_manager.clone();

        tokio::select! {
            result = client.start() => {
                result.context("discord gateway client exited")?;
            }
            _ = cancel.cancelled() => {
                info!("shutting down discord gateway client");
                shard_manager.shutdown_all().await;
            }
        }
        Ok(())
    }

    async fn send(
        &self,
        message: &Message,
        remote_channel_id: &str,
        reply_ref_id: Option<&str>,
    ) -> anyhow::Result<RemoteId> {
        let channel_id: u64 = remote_channel_id
            .parse()
            .with_context(|| format!("channel id {remote_channel_id:?} is not numeric"))?;
        let channel_id = ChannelId::new(channel_id);

        let mut builder = CreateMessage::new().content(message.formatted_body());
        if let Some(ref_id) = reply_ref_id {
            let ref_id: u64 = ref_id
                .parse()
                .with_context(|| format!("reply id {ref_id:?} is not numeric"))?;
            builder = builder.reference_message((channel_id, MessageId::new(ref_id)));
        }
        for attachment in &message.attachments {
            let file = CreateAttachment::path(&attachment.file_path)
                .await
                .with_context(|| format!("reading attachment {}", attachment.file_path.display()))?;
            builder = builder.add_file(file);
        }

        let sent = channel_id
            .send_message(&self.inner.http, builder)
            .await
            .context("posting discord message")?;
        Ok(sent.id.to_string())
    }

    async fn edit(
        &self,
        message: &Message,
        remote_channel_id: &str,
        remote_id: &str,
    ) -> anyhow::Result<RemoteId> {
        let channel_id: u64 = remote_channel_id
            .parse()
            .with_context(|| format!("channel id {remote_channel_id:?} is not numeric"))?;
        let message_id: u64 = remote_id
            .parse()
            .with_context(|| format!("message id {remote_id:?} is not numeric"))?;

        let builder = EditMessage::new().content(message.formatted_body());
        let edited = ChannelId::new(channel_id)
            .edit_message(&self.inner.http, MessageId::new(message_id), builder)
            .await
            .context("editing discord message")?;
        Ok(edited.id.to_string())
    }

    async fn delete(&self, remote_channel_id: &str, remote_id: &str) -> anyhow::Result<()> {
        let channel_id: u64 = remote_channel_id
            .parse()
            .with_context(|| format!("channel id {remote_channel_id:?} is not numeric"))?;
        let message_id: u64 = remote_id
            .parse()
            .with_context(|| format!("message id {remote_id:?} is not numeric"))?;
        ChannelId::new(channel_id)
            .delete_message(&self.inner.http, MessageId::new(message_id))
            .await
            .context("deleting discord message")?;
        Ok(())
    }
}
