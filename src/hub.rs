//! Hub — the coordination object for one logical conversation.
//!
//! A hub owns its correspondence [`Store`] and a set of *links*: each
//! registered [`Connector`], keyed by platform name, paired with the remote
//! channel id that connector should address when it posts to this hub.
//! Ingress events from any registered connector pass through `on_new_message`,
//! `on_edit`, or `on_delete`, which fan the operation out to every sibling
//! connector concurrently and keep the correspondence store in sync.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connector::Connector;
use crate::message::Message;
use crate::store::Store;

/// One platform's binding inside a hub: the connector plus the remote
/// channel id it should use when addressing this hub.
struct Link {
    connector: Arc<dyn Connector>,
    remote_channel_id: String,
}

/// Process-lifetime coordination object for a single logical conversation.
pub struct Hub {
    /// Hub name, used for the `<name>.db` file and the `cache/<name>/` dir.
    pub name: String,
    store: Arc<Store>,
    links: RwLock<HashMap<&'static str, Link>>,
}

impl Hub {
    /// Open (or create) the correspondence store for `name` and return an
    /// empty hub ready for connectors to register against. `platforms` is
    /// the fixed set of platform names participating in this hub, as
    /// determined from configuration.
    pub fn new(name: String, platforms: &[&'static str], keep_data: bool) -> anyhow::Result<Arc<Hub>> {
        let store = Store::open(&name, platforms, keep_data)?;
        Ok(Hub::from_store(name, store))
    }

    /// Build a hub around an already-opened store (used by tests that need
    /// an explicit on-disk path rather than the current working directory).
    pub fn from_store(name: String, store: Store) -> Arc<Hub> {
        Arc::new(Hub {
            name,
            store: Arc::new(store),
            links: RwLock::new(HashMap::new()),
        })
    }

    /// Register `connector` as handling `remote_channel_id` for this hub.
    /// Calls back into the connector's own `add_hub` so it can index
    /// `remote_channel_id -> hub` for ingress dispatch and pre-fetch any
    /// per-channel nickname table.
    pub async fn register(self: &Arc<Hub>, connector: Arc<dyn Connector>, remote_channel_id: String) {
        let platform = connector.platform();
        connector
            .add_hub(remote_channel_id.clone(), self.clone())
            .await;
        self.links.write().await.insert(
            platform,
            Link {
                connector,
                remote_channel_id,
            },
        );
    }

    /// Handle a freshly observed message from its origin connector.
    ///
    /// Inserts the origin row, then dispatches a `send` to every sibling
    /// connector on its own task. Each task reports its remote id back via
    /// `set_sibling` once the send completes.
    pub async fn on_new_message(self: &Arc<Hub>, message: Message) {
        let links = self.links.read().await;

        let translated_refs: HashMap<&'static str, Option<String>> =
            if let Some(ref_id) = &message.origin_reply_ref_id {
                let mut map = HashMap::new();
                for platform in links.keys() {
                    if *platform == message.origin_platform {
                        continue;
                    }
                    let translated = self
                        .store
                        .translate(message.origin_platform, ref_id, platform)
                        .unwrap_or_else(|e| {
                            warn!(error = %e, "correspondence lookup failed, sending without reply context");
                            None
                        });
                    map.insert(*platform, translated);
                }
                map
            } else {
                HashMap::new()
            };

        if let Err(e) = self
            .store
            .insert_origin(message.origin_platform, &message.origin_message_id)
        {
            warn!(error = %e, origin = %message.origin_platform, id = %message.origin_message_id, "failed to insert origin row");
        }

        let message = Arc::new(message);
        for (platform, link) in links.iter() {
            if *platform == message.origin_platform {
                continue;
            }
            let connector = link.connector.clone();
            let remote_channel_id = link.remote_channel_id.clone();
            let reply_ref = translated_refs.get(platform).cloned().flatten();
            let message = message.clone();
            let store = self.store.clone();
            let origin_platform = message.origin_platform;
            let origin_id = message.origin_message_id.clone();
            let sibling_platform = *platform;

            tokio::spawn(async move {
                match connector
                    .send(&message, &remote_channel_id, reply_ref.as_deref())
                    .await
                {
                    Ok(remote_id) => {
                        if let Err(e) =
                            store.set_sibling(origin_platform, &origin_id, sibling_platform, &remote_id)
                        {
                            warn!(error = %e, sibling = sibling_platform, "failed to record sibling mirror id");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, sibling = sibling_platform, "send to sibling failed");
                    }
                }
            });
        }
    }

    /// Handle an edit observed on the origin platform.
    pub async fn on_edit(self: &Arc<Hub>, message: Message) {
        let links = self.links.read().await;
        let message = Arc::new(message);

        for (platform, link) in links.iter() {
            if *platform == message.origin_platform {
                continue;
            }
            let sibling_id = match self.store.translate(
                message.origin_platform,
                &message.origin_message_id,
                platform,
            ) {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!(sibling = *platform, "no mirror recorded yet, skipping edit");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "correspondence lookup failed during edit");
                    continue;
                }
            };

            let connector = link.connector.clone();
            let remote_channel_id = link.remote_channel_id.clone();
            let message = message.clone();
            let store = self.store.clone();
            let origin_platform = message.origin_platform;
            let origin_id = message.origin_message_id.clone();
            let sibling_platform = *platform;

            tokio::spawn(async move {
                match connector.edit(&message, &remote_channel_id, &sibling_id).await {
                    Ok(new_remote_id) if new_remote_id != sibling_id => {
                        // Delete-and-resend connectors (CQHttp) return a new
                        // id; keep the correspondence row pointing at it.
                        if let Err(e) = store.set_sibling(
                            origin_platform,
                            &origin_id,
                            sibling_platform,
                            &new_remote_id,
                        ) {
                            warn!(error = %e, sibling = sibling_platform, "failed to update resent mirror id");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, sibling = sibling_platform, "edit on sibling failed");
                    }
                }
            });
        }
    }

    /// Handle a delete observed on the origin platform.
    pub async fn on_delete(self: &Arc<Hub>, origin_platform: &'static str, origin_id: String) {
        let links = self.links.read().await;

        for (platform, link) in links.iter() {
            if *platform == origin_platform {
                continue;
            }
            let sibling_id = match self.store.translate(origin_platform, &origin_id, platform) {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!(sibling = *platform, "no mirror recorded yet, skipping delete");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "correspondence lookup failed during delete");
                    continue;
                }
            };

            let connector = link.connector.clone();
            let remote_channel_id = link.remote_channel_id.clone();
            let sibling_platform = *platform;

            tokio::spawn(async move {
                if let Err(e) = connector.delete(&remote_channel_id, &sibling_id).await {
                    warn!(error = %e, sibling = sibling_platform, "delete on sibling failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    /// Records every send/edit/delete it receives so tests can assert on
    /// fan-out behaviour without a real platform on the other end.
    struct MockConnector {
        platform: &'static str,
        next_id: AtomicUsize,
        sends: StdMutex<Vec<(String, Option<String>)>>,
        edits: StdMutex<Vec<(String, String)>>,
        deletes: StdMutex<Vec<String>>,
    }

    impl MockConnector {
        fn new(platform: &'static str) -> Arc<Self> {
            Arc::new(Self {
                platform,
                next_id: AtomicUsize::new(1),
                sends: StdMutex::new(Vec::new()),
                edits: StdMutex::new(Vec::new()),
                deletes: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        fn platform(&self) -> &'static str {
            self.platform
        }

        async fn add_hub(&self, _remote_channel_id: String, _hub: Arc<Hub>) {}

        async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            message: &Message,
            _remote_channel_id: &str,
            reply_ref_id: Option<&str>,
        ) -> anyhow::Result<String> {
            self.sends
                .lock()
                .unwrap()
                .push((message.text.clone(), reply_ref_id.map(str::to_string)));
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}{id}", &self.platform[..1]))
        }

        async fn edit(
            &self,
            message: &Message,
            _remote_channel_id: &str,
            remote_id: &str,
        ) -> anyhow::Result<String> {
            self.edits
                .lock()
                .unwrap()
                .push((remote_id.to_string(), message.text.clone()));
            Ok(remote_id.to_string())
        }

        async fn delete(&self, _remote_channel_id: &str, remote_id: &str) -> anyhow::Result<()> {
            self.deletes.lock().unwrap().push(remote_id.to_string());
            Ok(())
        }
    }

    fn test_message(id: &str, text: &str, reply_ref: Option<&str>) -> Message {
        Message {
            origin_platform: "a",
            origin_channel_id: "chan-a".to_string(),
            origin_message_id: id.to_string(),
            origin_reply_ref_id: reply_ref.map(str::to_string),
            author_display_name: "alice".to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
        }
    }

    async fn two_platform_hub() -> (tempfile::TempDir, Arc<Hub>, Arc<MockConnector>, Arc<MockConnector>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_path(&dir.path().join("hub.db"), &["a", "b"], true).unwrap();
        let hub = Hub::from_store("test-hub".to_string(), store);
        let a = MockConnector::new("a");
        let b = MockConnector::new("b");
        hub.register(a.clone(), "chan-a".to_string()).await;
        hub.register(b.clone(), "chan-b".to_string()).await;
        (dir, hub, a, b)
    }

    #[tokio::test]
    async fn s1_new_message_mirrors_to_sibling() {
        let (_dir, hub, _a, b) = two_platform_hub().await;
        hub.on_new_message(test_message("a1", "hi", None)).await;

        // Give the spawned fan-out task a chance to run and record the id.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(b.sends.lock().unwrap()[0], ("hi".to_string(), None));
        assert_eq!(
            hub.store.translate("a", "a1", "b").unwrap(),
            Some("b1".to_string())
        );
    }

    #[tokio::test]
    async fn s2_reply_is_translated_to_sibling_id() {
        let (_dir, hub, _a, b) = two_platform_hub().await;
        hub.on_new_message(test_message("a1", "hi", None)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        hub.on_new_message(test_message("a2", "re", Some("a1"))).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let sends = b.sends.lock().unwrap();
        assert_eq!(sends[1], ("re".to_string(), Some("b1".to_string())));
    }

    #[tokio::test]
    async fn s3_reply_without_mirror_sends_with_no_ref() {
        let (_dir, hub, _a, b) = two_platform_hub().await;
        hub.on_new_message(test_message("a3", "orphan reply", Some("a0"))).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(
            b.sends.lock().unwrap()[0],
            ("orphan reply".to_string(), None)
        );
        assert!(hub.store.translate("a", "a3", "b").unwrap().is_some());
    }

    #[tokio::test]
    async fn s4_edit_dispatches_to_sibling_with_translated_id() {
        let (_dir, hub, _a, b) = two_platform_hub().await;
        hub.on_new_message(test_message("a1", "hi", None)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut edited = test_message("a1", "hi!", None);
        edited.text = "hi!".to_string();
        hub.on_edit(edited).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(b.edits.lock().unwrap()[0], ("b1".to_string(), "hi!".to_string()));
        // table unchanged
        assert_eq!(
            hub.store.translate("a", "a1", "b").unwrap(),
            Some("b1".to_string())
        );
    }

    #[tokio::test]
    async fn s5_delete_dispatches_to_sibling_with_translated_id() {
        let (_dir, hub, _a, b) = two_platform_hub().await;
        hub.on_new_message(test_message("a1", "hi", None)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        hub.on_delete("a", "a1".to_string()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(b.deletes.lock().unwrap()[0], "b1".to_string());
        assert_eq!(
            hub.store.translate("a", "a1", "b").unwrap(),
            Some("b1".to_string())
        );
    }

    #[tokio::test]
    async fn edit_with_no_mirror_is_skipped_without_error() {
        let (_dir, hub, _a, b) = two_platform_hub().await;
        // No prior on_new_message — no mirror id exists yet.
        hub.on_edit(test_message("unknown", "text", None)).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(b.edits.lock().unwrap().is_empty());
    }
}
