mod http;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use livecall_cluster::RelayBus;
use livecall_core::{
    config::{load_config, CacheMode},
    logging,
    service::{sink_from_config, Collaborators, RoomDirectory, RoomLogic, SnowflakeIdGenerator, StatCollector},
    KeyBuilder, LocalCache, RedisCache, SharedCache,
};
use livecall_sfu::{RtcService, SessionConfig, WebRtcTransport};

use server::{LiveCallServer, Services};

#[derive(Parser, Debug)]
#[command(name = "livecall")]
#[command(about = "LiveCall WebRTC signaling and relay server", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Public IP advertised as the ICE host candidate
    #[arg(long, env = "LIVECALL_NODE_IP")]
    node_ip: Option<String>,

    /// HTTP listen port (overrides the config file)
    #[arg(long)]
    http_port: Option<u16>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    use std::net::UdpSocket;

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let local_ip = UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.ip().to_string());

    let suffix = nanoid::nanoid!(6);

    format!("{hostname}_{local_ip}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = load_config(args.config.as_deref())?;
    if let Some(node_ip) = args.node_ip {
        config.rtc.node_ip = Some(node_ip);
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!("LiveCall server starting...");
    info!("Node ID: {}", node_id);
    info!("HTTP address: {}", config.http_address());

    // 3. Shared cache
    let keys = KeyBuilder::new(&config.cache.key_prefix);
    let (cache, redis): (Arc<dyn SharedCache>, Option<Arc<RedisCache>>) = match config.cache.mode {
        CacheMode::Standalone => {
            info!("Standalone mode, room state kept in process");
            (Arc::new(LocalCache::new()), None)
        }
        CacheMode::Cluster => {
            let redis = Arc::new(
                RedisCache::connect(
                    &config.cache.redis_url,
                    &keys,
                    Duration::from_secs(config.cache.connect_timeout_seconds),
                )
                .await?,
            );
            (redis.clone(), Some(redis))
        }
    };

    // 4. Telemetry
    let stats = StatCollector::start(sink_from_config(&config.stat)?, &config.stat);

    // 5. Room directory and relay bus
    let id_generator = SnowflakeIdGenerator::for_node(config.room.worker_id, &node_id);
    let bus = Arc::new(RelayBus::new(cache.clone(), keys.clone(), node_id));
    let directory = Arc::new(
        RoomDirectory::new(
            cache,
            keys,
            Arc::new(id_generator),
            config.room.clone(),
        )
        .with_events(bus.clone()),
    );

    // 6. RTC service
    let rtc = RtcService::new(
        Arc::new(WebRtcTransport::new(&config.rtc)),
        directory.clone(),
        bus,
        stats.clone(),
        SessionConfig::from(&config.rtc),
    );
    rtc.start().await?;

    // 7. Room logic
    let collaborators = Collaborators::from_config(&config.sdk)?;
    let logic = Arc::new(RoomLogic::new(directory, collaborators, config.sdk.call_timeout_seconds));

    let services = Services {
        logic,
        rtc,
        stats,
        redis,
    };
    LiveCallServer::new(config, services).start().await
}
