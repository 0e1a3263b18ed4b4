use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, Level};

use ethconnect::config::{
    load_server_config, to_yaml_snippet, ConfigFormat, HttpConf, KafkaBridgeConf,
    WebhooksBridgeConf,
};
use ethconnect::server::run_server;
use ethconnect::{KafkaBridge, WebhooksBridge};

#[derive(Parser)]
#[command(name = "ethconnect")]
#[command(about = "Connectivity bridge for Ethereum permissioned chains", version)]
struct Cli {
    /// Log level: 0=error, 1=info, 2=debug
    #[arg(short, long, global = true, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    debug: u8,

    /// Print the resolved YAML config snippet and exit
    #[arg(short = 'Y', long = "print-yaml-config", global = true)]
    print_yaml_config: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs all of the bridges defined in a YAML/JSON config file
    Server(ServerArgs),
    /// Kafka->Ethereum (JSON-RPC) bridge
    Kafka(KafkaArgs),
    /// Webhooks->Kafka bridge
    Webhooks(WebhooksArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Configuration file
    #[arg(short, long, env = "ETHCONNECT_CONFIGFILE")]
    filename: Option<PathBuf>,

    /// File type (yaml/json)
    #[arg(short = 't', long = "type", env = "ETHCONNECT_CONFIGFILE_TYPE", default_value = "yaml")]
    file_type: String,
}

#[derive(Args)]
struct KafkaArgs {
    /// Kafka broker addresses (comma-separated)
    #[arg(short, long, env = "KAFKA_BROKERS", value_delimiter = ',')]
    brokers: Vec<String>,

    /// Client ID for the Kafka connection
    #[arg(short = 'i', long, env = "KAFKA_CLIENT_ID", default_value = "ethconnect")]
    clientid: String,

    /// Consumer group ID
    #[arg(short = 'g', long = "consumer-group", env = "KAFKA_CONSUMER_GROUP", default_value = "ethconnect")]
    consumer_group: String,

    /// Topic to consume requests from
    #[arg(long = "topic-in", env = "KAFKA_TOPIC_IN")]
    topic_in: Option<String>,

    /// Topic to produce replies to
    #[arg(long = "topic-out", env = "KAFKA_TOPIC_OUT")]
    topic_out: Option<String>,

    /// JSON-RPC URL for the Ethereum node
    #[arg(short = 'r', long = "rpc-url", env = "ETH_RPC_URL")]
    rpc_url: Option<String>,

    /// Maximum messages to hold in-flight
    #[arg(short = 'm', long = "maxinflight", env = "KAFKA_MAX_INFLIGHT", default_value_t = 0)]
    max_in_flight: usize,

    /// Maximum wait time for an individual transaction (seconds)
    #[arg(short = 'x', long = "tx-timeout", env = "ETH_TX_TIMEOUT", default_value_t = 0)]
    tx_timeout: u64,

    /// Predict the next nonce before sending (default=false for node-signed txns)
    #[arg(short = 'P', long = "predict-nonces")]
    predict_nonces: bool,
}

impl KafkaArgs {
    fn into_conf(self) -> KafkaBridgeConf {
        let mut conf = KafkaBridgeConf::default();
        conf.kafka.brokers = self.brokers;
        conf.kafka.client_id = self.clientid;
        conf.kafka.consumer_group = self.consumer_group;
        conf.kafka.topic_in = self.topic_in.unwrap_or_default();
        conf.kafka.topic_out = self.topic_out.unwrap_or_default();
        conf.rpc.url = self.rpc_url.unwrap_or_default();
        conf.max_in_flight = self.max_in_flight;
        conf.max_tx_wait_time = self.tx_timeout;
        conf.always_manage_nonce = self.predict_nonces;
        conf
    }
}

#[derive(Args)]
struct WebhooksArgs {
    /// Kafka broker addresses (comma-separated)
    #[arg(short, long, env = "KAFKA_BROKERS", value_delimiter = ',')]
    brokers: Vec<String>,

    /// Client ID for the Kafka connection
    #[arg(short = 'i', long, env = "KAFKA_CLIENT_ID", default_value = "ethconnect")]
    clientid: String,

    /// Topic to produce incoming webhook messages to
    #[arg(long = "topic-in", env = "KAFKA_TOPIC_IN")]
    topic_in: Option<String>,

    /// Local address to listen on
    #[arg(short = 'L', long = "listen-addr", default_value = "0.0.0.0")]
    listen_addr: String,

    /// Port to listen on
    #[arg(short = 'l', long = "listen-port", default_value_t = 8080)]
    listen_port: u16,

    /// Maximum message size accepted on the HTTP interface (bytes)
    #[arg(long = "max-msg-size", default_value_t = 1024 * 1024)]
    max_msg_size: usize,
}

impl WebhooksArgs {
    fn into_conf(self) -> WebhooksBridgeConf {
        let mut conf = WebhooksBridgeConf::default();
        conf.kafka.brokers = self.brokers;
        conf.kafka.client_id = self.clientid;
        conf.kafka.topic_in = self.topic_in.unwrap_or_default();
        conf.http = HttpConf {
            local_addr: self.listen_addr,
            port: self.listen_port,
        };
        conf.max_msg_size = self.max_msg_size;
        conf
    }
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => Level::ERROR,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Server(args) => {
            let filename = args
                .filename
                .ok_or_else(|| anyhow!("no configuration filename specified"))?;
            let format = ConfigFormat::parse(&args.file_type)?;
            let config = load_server_config(&filename, format)?;
            if cli.print_yaml_config {
                print!(
                    "# Full YAML configuration processed from supplied file\n{}",
                    to_yaml_snippet(&config)?
                );
                return Ok(());
            }
            run_server(config).await?;
        }
        Command::Kafka(args) => {
            let mut conf = args.into_conf();
            conf.kafka.apply_env_defaults();
            conf.validate()?;
            if cli.print_yaml_config {
                print!(
                    "# YAML configuration snippet for Kafka->Ethereum bridge\n{}",
                    to_yaml_snippet(&conf)?
                );
                return Ok(());
            }
            info!("starting Kafka->Ethereum bridge");
            KafkaBridge::new(conf).run().await?;
        }
        Command::Webhooks(args) => {
            let mut conf = args.into_conf();
            conf.kafka.apply_env_defaults();
            conf.validate()?;
            if cli.print_yaml_config {
                print!(
                    "# YAML configuration snippet for Webhooks->Kafka bridge\n{}",
                    to_yaml_snippet(&conf)?
                );
                return Ok(());
            }
            info!("starting Webhooks->Kafka bridge");
            WebhooksBridge::new(conf).run().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
