use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bygeon::config::Config;
use bygeon::connector::cqhttp::CqHttpConnector;
use bygeon::connector::discord::DiscordConnector;
use bygeon::connector::slack::SlackConnector;
use bygeon::connector::Connector;
use bygeon::hub::Hub;

#[derive(Parser, Debug)]
#[command(name = "bygeon", version, about = "Cross-platform chat bridge")]
struct Cli {
    /// Path to the bygeon.toml configuration file.
    #[arg(short, long, default_value = "bygeon.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let discord: Option<Arc<dyn Connector>> = config.clients.discord.as_ref().map(|c| {
        Arc::new(DiscordConnector::new(c.bot_token.clone(), c.guild_id.clone())) as Arc<dyn Connector>
    });
    let slack: Option<Arc<dyn Connector>> = config.clients.slack.as_ref().map(|c| {
        Arc::new(SlackConnector::new(c.app_token.clone(), c.bot_token.clone())) as Arc<dyn Connector>
    });
    let cqhttp: Option<Arc<dyn Connector>> = config.clients.cqhttp.as_ref().map(|c| {
        Arc::new(CqHttpConnector::new(c.ws_url.clone(), c.http_url.clone())) as Arc<dyn Connector>
    });

    let mut hubs = Vec::with_capacity(config.hubs.len());
    for (index, hub_cfg) in config.hubs.iter().enumerate() {
        let name = hub_cfg.resolved_name(index);
        let platforms = hub_cfg.platforms();
        let hub = Hub::new(name.clone(), &platforms, hub_cfg.keep_data)
            .with_context(|| format!("opening correspondence store for hub '{name}'"))?;

        if let Some(binding) = &hub_cfg.discord {
            let connector = discord
                .clone()
                .context("hub binds Discord but no Discord client is configured")?;
            hub.register(connector, binding.channel_id.clone()).await;
        }
        if let Some(binding) = &hub_cfg.slack {
            let connector = slack
                .clone()
                .context("hub binds Slack but no Slack client is configured")?;
            hub.register(connector, binding.channel_id.clone()).await;
        }
        if let Some(binding) = &hub_cfg.cqhttp {
            let connector = cqhttp
                .clone()
                .context("hub binds CQHttp but no CQHttp client is configured")?;
            hub.register(connector, binding.group_id.clone()).await;
        }

        info!(hub = %name, platforms = ?platforms, "hub ready");
        hubs.push(hub);
    }

    let cancel = CancellationToken::new();
    let mut ingress_tasks = Vec::new();
    for connector in [discord, slack, cqhttp].into_iter().flatten() {
        let cancel = cancel.clone();
        let platform = connector.platform();
        ingress_tasks.push(tokio::spawn(async move {
            if let Err(e) = connector.start(cancel).await {
                tracing::warn!(error = %e, platform, "connector ingress loop exited with an error");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down…");
    cancel.cancel();

    let drain = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        futures_util::future::join_all(ingress_tasks),
    );
    if drain.await.is_err() {
        tracing::warn!("connectors did not shut down within the drain timeout");
    }

    info!("shutdown complete");
    Ok(())
}
