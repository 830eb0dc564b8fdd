//! Platform-agnostic message value types.
//!
//! A [`Message`] captures one observation made by a connector on its origin
//! platform. It carries everything a sibling connector needs to mirror the
//! message: the text, the author's display name, any downloaded attachments,
//! and (optionally) the origin id of the message it replies to.

use std::path::PathBuf;

/// A downloaded file accompanying a [`Message`].
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Logical filename as reported by the origin platform.
    pub name: String,
    /// MIME type, when the origin platform reported one.
    pub mime_type: Option<String>,
    /// Path to the downloaded copy inside the hub's cache directory.
    pub file_path: PathBuf,
}

/// A message observed on its origin platform, ready to be mirrored to
/// sibling connectors.
#[derive(Debug, Clone)]
pub struct Message {
    /// Platform name the message was observed on (the correspondence
    /// column key, e.g. `"discord"`).
    pub origin_platform: &'static str,
    /// Remote channel id on the origin platform.
    pub origin_channel_id: String,
    /// Remote message id assigned by the origin platform.
    pub origin_message_id: String,
    /// Origin id of the message this one replies to, if any.
    pub origin_reply_ref_id: Option<String>,
    /// Resolved display name (nickname, falling back to username).
    pub author_display_name: String,
    /// Message body. May be empty when only attachments are present.
    pub text: String,
    /// Downloaded attachments, in platform order.
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Render the body the way every connector's egress formats it:
    /// `"[<author>]: <text>"`.
    pub fn formatted_body(&self) -> String {
        format!("[{}]: {}", self.author_display_name, self.text)
    }
}
