//! Connector — the common contract every platform adapter implements.
//!
//! A connector owns a persistent ingress connection to one platform, decodes
//! incoming events into [`crate::message::Message`]s, and posts outgoing
//! send/edit/delete operations. It is registered with one [`crate::hub::Hub`]
//! per remote channel it participates in.

pub mod cqhttp;
pub mod discord;
pub mod slack;

use async_trait::async_trait;

use crate::message::Message;

/// Result of a successful egress send: the id the platform assigned to the
/// newly posted message.
pub type RemoteId = String;

/// Per-platform adapter. Implementations own their ingress socket, their
/// outgoing HTTP client, and their own notion of "remote channel id".
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable platform name; also the correspondence store's column key.
    fn platform(&self) -> &'static str;

    /// Register a remote channel as belonging to `hub`. Connectors may
    /// pre-fetch per-channel nickname tables here.
    async fn add_hub(&self, remote_channel_id: String, hub: std::sync::Arc<crate::hub::Hub>);

    /// Run the ingress loop until the process is shutting down. Implementors
    /// reconnect internally on unexpected socket closure; this only returns
    /// once `cancel` is triggered or the connection cannot be recovered.
    async fn start(&self, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()>;

    /// Post a new message to `remote_channel_id`, optionally as a reply to
    /// `reply_ref_id` (a native id on *this* platform). Returns the native
    /// id the platform assigned to the new message.
    async fn send(
        &self,
        message: &Message,
        remote_channel_id: &str,
        reply_ref_id: Option<&str>,
    ) -> anyhow::Result<RemoteId>;

    /// Edit an existing message. Most platforms edit in place and keep the
    /// same id; CQHttp deletes and resends, producing a new id — when that
    /// happens the returned id differs from `remote_id` and the caller must
    /// update the correspondence row.
    async fn edit(
        &self,
        message: &Message,
        remote_channel_id: &str,
        remote_id: &str,
    ) -> anyhow::Result<RemoteId>;

    /// Delete a message by its native id.
    async fn delete(&self, remote_channel_id: &str, remote_id: &str) -> anyhow::Result<()>;
}
