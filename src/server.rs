//! Server supervisor: runs every bridge named in the aggregate config as
//! sibling tasks, collapsing when the first one finishes

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::kafka::bridge::KafkaBridge;
use crate::webhooks::WebhooksBridge;

/// Validate and launch all configured bridges. The first task to exit,
/// normally or with an error, resolves the supervisor with its result:
/// restart policy belongs to the deployment environment, not this layer.
pub async fn run_server(mut config: ServerConfig) -> Result<()> {
    if config.kafka.is_empty() && config.webhooks.is_empty() {
        return Err(BridgeError::Config("no bridges configured".into()));
    }

    // Validate everything before launching anything
    for (name, conf) in config.kafka.iter_mut() {
        conf.validate()
            .map_err(|e| BridgeError::Config(format!("kafka bridge \"{name}\": {e}")))?;
    }
    for (name, conf) in config.webhooks.iter_mut() {
        conf.validate()
            .map_err(|e| BridgeError::Config(format!("webhooks bridge \"{name}\": {e}")))?;
    }

    let mut bridges: JoinSet<(String, Result<()>)> = JoinSet::new();
    for (name, conf) in config.kafka {
        bridges.spawn(async move {
            info!(bridge = %name, "starting Kafka->Ethereum bridge");
            let result = KafkaBridge::new(conf).run().await;
            (name, result)
        });
    }
    for (name, conf) in config.webhooks {
        bridges.spawn(async move {
            info!(bridge = %name, "starting Webhooks->Kafka bridge");
            let result = WebhooksBridge::new(conf).run().await;
            (name, result)
        });
    }

    let result = match bridges.join_next().await {
        Some(Ok((name, Ok(())))) => {
            info!(bridge = %name, "bridge finished, shutting down");
            Ok(())
        }
        Some(Ok((name, Err(e)))) => {
            error!(bridge = %name, error = %e, "bridge failed, shutting down");
            Err(e)
        }
        Some(Err(join_err)) => Err(BridgeError::FatalInvariant(format!(
            "bridge task panicked: {join_err}"
        ))),
        None => Ok(()),
    };
    bridges.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_config_is_rejected() {
        let result = run_server(ServerConfig::default()).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn invalid_bridge_is_rejected_before_launch() {
        let mut config = ServerConfig::default();
        config
            .kafka
            .insert("broken".into(), Default::default());
        let result = run_server(config).await;
        match result {
            Err(BridgeError::Config(msg)) => assert!(msg.contains("broken")),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
