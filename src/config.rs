//! `bygeon.toml` configuration: per-platform client credentials and the set
//! of hubs (logical conversations) binding them together.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `bygeon.toml`.
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(rename = "Clients", default)]
    pub clients: ClientsConfig,
    #[serde(rename = "Hubs", default)]
    pub hubs: Vec<HubConfig>,
}

/// Per-platform connector credentials. A platform absent here cannot be
/// referenced by any hub.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ClientsConfig {
    #[serde(rename = "Discord", default)]
    pub discord: Option<DiscordClientConfig>,
    #[serde(rename = "Slack", default)]
    pub slack: Option<SlackClientConfig>,
    #[serde(rename = "CQHttp", default)]
    pub cqhttp: Option<CqHttpClientConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordClientConfig {
    pub bot_token: String,
    pub guild_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SlackClientConfig {
    pub app_token: String,
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CqHttpClientConfig {
    #[serde(default = "default_cqhttp_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_cqhttp_http_url")]
    pub http_url: String,
}

fn default_cqhttp_ws_url() -> String {
    "ws://localhost:8080/".to_string()
}

fn default_cqhttp_http_url() -> String {
    "http://localhost:5700/".to_string()
}

/// One logical conversation: a set of remote channels, one per connected
/// platform, to keep mirrored.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub keep_data: bool,
    #[serde(rename = "Discord", default)]
    pub discord: Option<HubDiscordBinding>,
    #[serde(rename = "Slack", default)]
    pub slack: Option<HubSlackBinding>,
    #[serde(rename = "CQHttp", default)]
    pub cqhttp: Option<HubCqHttpBinding>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubDiscordBinding {
    pub channel_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubSlackBinding {
    pub channel_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubCqHttpBinding {
    pub group_id: String,
}

impl HubConfig {
    /// The hub's name, falling back to `HUB-<index>` when unset.
    pub fn resolved_name(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("HUB-{index}"))
    }

    /// Platforms this hub participates in, as the fixed compiled-in column
    /// keys the correspondence store uses.
    pub fn platforms(&self) -> Vec<&'static str> {
        let mut platforms = Vec::new();
        if self.discord.is_some() {
            platforms.push("discord");
        }
        if self.slack.is_some() {
            platforms.push("slack");
        }
        if self.cqhttp.is_some() {
            platforms.push("cqhttp");
        }
        platforms
    }
}

impl Config {
    /// Read and parse `bygeon.toml`. Falls back to a `.bak` sibling file if
    /// the primary path is missing, matching the daemon's other ambient
    /// config-recovery behaviour.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bak_name = path.as_os_str().to_os_string();
                bak_name.push(".bak");
                let bak_path = PathBuf::from(bak_name);
                match tokio::fs::read_to_string(&bak_path).await {
                    Ok(c) => {
                        tracing::warn!(
                            path = %path.display(),
                            bak = %bak_path.display(),
                            "config file not found, falling back to .bak"
                        );
                        c
                    }
                    Err(_) => {
                        return Err(e)
                            .with_context(|| format!("failed to read config file: {}", path.display()));
                    }
                }
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        let config: Config = toml::from_str(&contents).context("failed to parse config TOML")?;
        config.validate()?;

        tracing::debug!(hubs = config.hubs.len(), "configuration loaded");
        Ok(config)
    }

    /// Validate semantic constraints `serde` cannot express: every hub's
    /// bound platforms must have a matching `[Clients.*]` entry, and
    /// resolved hub names must be unique.
    fn validate(&self) -> anyhow::Result<()> {
        use std::collections::HashSet;

        let mut names = HashSet::new();
        for (index, hub) in self.hubs.iter().enumerate() {
            let name = hub.resolved_name(index);
            if !names.insert(name.clone()) {
                anyhow::bail!("config: duplicate hub name '{name}'");
            }

            if hub.discord.is_some() && self.clients.discord.is_none() {
                anyhow::bail!("config: hub '{name}' binds Discord but [Clients.Discord] is absent");
            }
            if hub.slack.is_some() && self.clients.slack.is_none() {
                anyhow::bail!("config: hub '{name}' binds Slack but [Clients.Slack] is absent");
            }
            if hub.cqhttp.is_some() && self.clients.cqhttp.is_none() {
                anyhow::bail!("config: hub '{name}' binds CQHttp but [Clients.CQHttp] is absent");
            }
            if hub.platforms().len() < 2 {
                anyhow::bail!("config: hub '{name}' must bind at least two platforms to bridge anything");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_minimal_two_platform_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bygeon.toml");
        tokio::fs::write(
            &path,
            r#"
            [Clients.Discord]
            bot_token = "t"
            guild_id = "1"

            [Clients.Slack]
            app_token = "a"
            bot_token = "b"

            [[Hubs]]
            name = "general"

            [Hubs.Discord]
            channel_id = "111"

            [Hubs.Slack]
            channel_id = "C222"
            "#,
        )
        .await
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.hubs.len(), 1);
        assert_eq!(config.hubs[0].resolved_name(0), "general");
        assert_eq!(config.hubs[0].platforms(), vec!["discord", "slack"]);
    }

    #[tokio::test]
    async fn rejects_hub_referencing_unconfigured_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bygeon.toml");
        tokio::fs::write(
            &path,
            r#"
            [Clients.Discord]
            bot_token = "t"
            guild_id = "1"

            [[Hubs]]
            [Hubs.Discord]
            channel_id = "111"
            [Hubs.Slack]
            channel_id = "C222"
            "#,
        )
        .await
        .unwrap();

        let err = Config::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("Slack"));
    }

    #[tokio::test]
    async fn unnamed_hubs_default_to_index_based_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bygeon.toml");
        tokio::fs::write(
            &path,
            r#"
            [Clients.Discord]
            bot_token = "t"
            guild_id = "1"
            [Clients.Slack]
            app_token = "a"
            bot_token = "b"

            [[Hubs]]
            [Hubs.Discord]
            channel_id = "111"
            [Hubs.Slack]
            channel_id = "C1"

            [[Hubs]]
            [Hubs.Discord]
            channel_id = "222"
            [Hubs.Slack]
            channel_id = "C2"
            "#,
        )
        .await
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.hubs[0].resolved_name(0), "HUB-0");
        assert_eq!(config.hubs[1].resolved_name(1), "HUB-1");
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_bak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bygeon.toml");
        let bak = dir.path().join("bygeon.toml.bak");
        tokio::fs::write(
            &bak,
            r#"
            [Clients.Discord]
            bot_token = "t"
            guild_id = "1"
            [Clients.Slack]
            app_token = "a"
            bot_token = "b"

            [[Hubs]]
            [Hubs.Discord]
            channel_id = "111"
            [Hubs.Slack]
            channel_id = "C1"
            "#,
        )
        .await
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.hubs.len(), 1);
    }
}
