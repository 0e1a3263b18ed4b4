//! Configuration structures and loading
//!
//! The server reads a hierarchical YAML or JSON document mapping bridge
//! names to bridge configs. The single-bridge subcommands assemble the same
//! structures from flags and environment variables, with flags taking
//! precedence over the environment.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BridgeError;

/// Default in-flight ceiling when unset
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;
/// Floor for the per-transaction receipt wait
pub const MIN_TX_WAIT_SECONDS: u64 = 10;
/// Default cap on webhook POST bodies (bytes)
pub const DEFAULT_MAX_MSG_SIZE: usize = 1024 * 1024;

/// TLS settings for the Kafka client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaTlsConf {
    pub enabled: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub insecure_skip_verify: bool,
}

/// SASL/PLAIN credentials for the Kafka client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaSaslConf {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Kafka connection settings shared by consumers and producers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaCommonConf {
    /// Broker addresses, host:port
    pub brokers: Vec<String>,
    pub client_id: String,
    pub consumer_group: String,
    pub topic_in: String,
    pub topic_out: String,
    pub tls: KafkaTlsConf,
    pub sasl: KafkaSaslConf,
}

impl KafkaCommonConf {
    /// Reject configs that cannot possibly connect
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.is_empty()) {
            return Err(BridgeError::Config("no Kafka brokers configured".into()));
        }
        if self.sasl.username.is_some() != self.sasl.password.is_some() {
            return Err(BridgeError::Config(
                "Kafka SASL configuration requires both username and password".into(),
            ));
        }
        Ok(())
    }

    /// Fill TLS/SASL fields from the standard environment variables when
    /// the loaded config left them unset
    pub fn apply_env_defaults(&mut self) {
        if self.brokers.is_empty() {
            if let Some(brokers) = env_str("KAFKA_BROKERS") {
                self.brokers = brokers.split(',').map(|s| s.trim().to_string()).collect();
            }
        }
        if !self.tls.enabled {
            self.tls.enabled = env_bool("KAFKA_TLS_ENABLED").unwrap_or(false);
        }
        if self.tls.ca_cert.is_none() {
            self.tls.ca_cert = env_str("KAFKA_TLS_CA_CERTS");
        }
        if self.tls.client_cert.is_none() {
            self.tls.client_cert = env_str("KAFKA_TLS_CLIENT_CERT");
        }
        if self.tls.client_key.is_none() {
            self.tls.client_key = env_str("KAFKA_TLS_CLIENT_KEY");
        }
        if !self.tls.insecure_skip_verify {
            self.tls.insecure_skip_verify = env_bool("KAFKA_TLS_INSECURE").unwrap_or(false);
        }
        if self.sasl.username.is_none() {
            self.sasl.username = env_str("KAFKA_SASL_USERNAME");
        }
        if self.sasl.password.is_none() {
            self.sasl.password = env_str("KAFKA_SASL_PASSWORD");
        }
    }
}

/// JSON-RPC endpoint settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcConf {
    pub url: String,
}

/// Configuration for one Kafka->Ethereum bridge instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaBridgeConf {
    pub kafka: KafkaCommonConf,
    pub max_in_flight: usize,
    #[serde(rename = "maxTXWaitTime")]
    pub max_tx_wait_time: u64,
    pub always_manage_nonce: bool,
    pub rpc: RpcConf,
}

impl KafkaBridgeConf {
    /// Validate and normalize. Applies the documented defaults: an unset
    /// in-flight ceiling becomes 10, and the receipt wait is floored at 10
    /// seconds with a warning when it had to be raised.
    pub fn validate(&mut self) -> Result<(), BridgeError> {
        self.kafka.validate()?;
        if self.kafka.consumer_group.is_empty() {
            return Err(BridgeError::Config("no Kafka consumer group set".into()));
        }
        if self.kafka.topic_in.is_empty() || self.kafka.topic_out.is_empty() {
            return Err(BridgeError::Config(
                "both inbound and outbound Kafka topics must be set".into(),
            ));
        }
        if self.rpc.url.is_empty() {
            return Err(BridgeError::Config(
                "no JSON-RPC URL set for Ethereum node".into(),
            ));
        }
        if self.max_tx_wait_time < MIN_TX_WAIT_SECONDS {
            if self.max_tx_wait_time > 0 {
                warn!(
                    configured = self.max_tx_wait_time,
                    minimum = MIN_TX_WAIT_SECONDS,
                    "maximum transaction wait time raised to the minimum"
                );
            }
            self.max_tx_wait_time = MIN_TX_WAIT_SECONDS;
        }
        if self.max_in_flight == 0 {
            self.max_in_flight = DEFAULT_MAX_IN_FLIGHT;
        }
        Ok(())
    }
}

/// HTTP listener settings for the webhooks bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConf {
    pub local_addr: String,
    pub port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            local_addr: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Configuration for one Webhooks->Kafka bridge instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhooksBridgeConf {
    pub kafka: KafkaCommonConf,
    pub http: HttpConf,
    pub max_msg_size: usize,
}

impl WebhooksBridgeConf {
    pub fn validate(&mut self) -> Result<(), BridgeError> {
        self.kafka.validate()?;
        if self.kafka.topic_in.is_empty() {
            return Err(BridgeError::Config(
                "no inbound Kafka topic set for webhooks bridge".into(),
            ));
        }
        if self.max_msg_size == 0 {
            self.max_msg_size = DEFAULT_MAX_MSG_SIZE;
        }
        Ok(())
    }
}

/// The aggregate config driving the `server` subcommand: a set of named
/// bridges of each kind, all launched as sibling tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub kafka: HashMap<String, KafkaBridgeConf>,
    pub webhooks: HashMap<String, WebhooksBridgeConf>,
}

/// On-disk format of the server config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn parse(name: &str) -> Result<Self, BridgeError> {
        match name.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(BridgeError::Config(format!(
                "unknown config file type \"{other}\" (expected yaml or json)"
            ))),
        }
    }
}

/// Read and parse the aggregate server configuration
pub fn load_server_config(path: &Path, format: ConfigFormat) -> Result<ServerConfig, BridgeError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("unable to parse {} as YAML: {e}", path.display())))?,
        ConfigFormat::Json => serde_json::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("unable to parse {} as JSON: {e}", path.display())))?,
    };
    Ok(config)
}

/// Render any serializable config as a YAML snippet for --print-yaml-config
pub fn to_yaml_snippet<T: Serialize>(value: &T) -> Result<String, BridgeError> {
    serde_yaml::to_string(value).map_err(|e| BridgeError::Config(format!("YAML encoding failed: {e}")))
}

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_conf() -> KafkaBridgeConf {
        let mut conf = KafkaBridgeConf::default();
        conf.kafka.brokers = vec!["localhost:9092".into()];
        conf.kafka.consumer_group = "bridge".into();
        conf.kafka.topic_in = "req".into();
        conf.kafka.topic_out = "rep".into();
        conf.rpc.url = "http://localhost:8545".into();
        conf
    }

    #[test]
    fn validate_applies_defaults() {
        let mut conf = minimal_conf();
        conf.validate().unwrap();
        assert_eq!(conf.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(conf.max_tx_wait_time, MIN_TX_WAIT_SECONDS);
    }

    #[test]
    fn validate_floors_tx_wait() {
        let mut conf = minimal_conf();
        conf.max_tx_wait_time = 3;
        conf.validate().unwrap();
        assert_eq!(conf.max_tx_wait_time, MIN_TX_WAIT_SECONDS);

        conf.max_tx_wait_time = 120;
        conf.validate().unwrap();
        assert_eq!(conf.max_tx_wait_time, 120);
    }

    #[test]
    fn validate_requires_rpc_url() {
        let mut conf = minimal_conf();
        conf.rpc.url.clear();
        assert!(matches!(conf.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn validate_requires_brokers() {
        let mut conf = minimal_conf();
        conf.kafka.brokers.clear();
        assert!(matches!(conf.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn server_config_from_yaml() {
        let yaml = r#"
kafka:
  bridge-a:
    kafka:
      brokers: ["k1:9092", "k2:9092"]
      consumerGroup: grp
      topicIn: in
      topicOut: out
    maxInFlight: 25
    maxTXWaitTime: 60
    alwaysManageNonce: true
    rpc:
      url: http://geth:8545
webhooks:
  hooks-a:
    kafka:
      brokers: ["k1:9092"]
      topicIn: in
    http:
      port: 8081
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        let bridge = &config.kafka["bridge-a"];
        assert_eq!(bridge.max_in_flight, 25);
        assert_eq!(bridge.max_tx_wait_time, 60);
        assert!(bridge.always_manage_nonce);
        assert_eq!(bridge.kafka.brokers.len(), 2);
        assert_eq!(config.webhooks["hooks-a"].http.port, 8081);
    }

    #[test]
    fn config_format_parse() {
        assert_eq!(ConfigFormat::parse("YAML").unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::parse("json").unwrap(), ConfigFormat::Json);
        assert!(ConfigFormat::parse("toml").is_err());
    }
}
