//! The reference agent service: command endpoint, optional release host,
//! optional self-updating client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use basecamp_net::Commander;
use basecamp_runtime::{Service, ServiceHost};
use basecamp_update::{AutoUpdate, Releaser, ReleaseStore, Updater, UpdaterOptions};

#[derive(Default)]
pub struct AgentService {
    cmdr: Option<Commander>,
    releaser: Option<Releaser>,
    updater: Option<Updater>,
    auto_update: Option<AutoUpdate>,
}

impl AgentService {
    fn parse_host_port(value: &str) -> anyhow::Result<(String, u16)> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected host:port, got {value:?}"))?;
        Ok((host.to_string(), port.parse()?))
    }
}

#[async_trait]
impl Service for AgentService {
    async fn init(&mut self, host: &ServiceHost) -> anyhow::Result<()> {
        let cmdr = Commander::new();

        // liveness probe: peers can echo through us
        cmdr.register("echo", |cmdr, body, serial| async move {
            let message = body.get("message").cloned().unwrap_or(json!(null));
            cmdr.send_command("echo_response", json!({ "message": message }), serial)
                .await?;
            Ok(())
        })?;

        if let Ok(listen) = std::env::var("BASECAMPD_LISTEN") {
            let (addr, port) = Self::parse_host_port(&listen)?;
            cmdr.bind(&addr, port).await?;
            let store = ReleaseStore::create(host.release_path())?;
            self.releaser = Some(Releaser::attach(&cmdr, store)?);
            tracing::info!(%listen, "serving release catalog");
        }

        if let Ok(target) = std::env::var("BASECAMPD_RELEASER") {
            let (addr, port) = Self::parse_host_port(&target)?;
            let serial = cmdr.connect(&addr, port).await?;

            let options = UpdaterOptions {
                update_path: host.update_path(),
                config_path: host.config_path().to_path_buf(),
                current_version: host.version(),
                ..UpdaterOptions::new(host.root(), &host.version())
            };
            let updater = Updater::attach(&cmdr, Arc::new(host.clone()), options)?;
            self.auto_update = Some(AutoUpdate::new(updater.clone(), serial));
            self.updater = Some(updater);
            tracing::info!(%target, serial, "following releaser for updates");
        }

        self.cmdr = Some(cmdr);
        tracing::info!(version = %host.version(), "agent initialized");
        Ok(())
    }

    async fn run(&mut self, _host: &ServiceHost) -> anyhow::Result<()> {
        if let Some(auto_update) = &self.auto_update {
            auto_update.tick();
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        Ok(())
    }

    async fn destroy(&mut self, _host: &ServiceHost) -> anyhow::Result<()> {
        self.auto_update = None;
        self.updater = None;
        self.releaser = None;
        if let Some(cmdr) = self.cmdr.take() {
            cmdr.shutdown().await;
        }
        tracing::info!("agent shut down");
        Ok(())
    }
}
