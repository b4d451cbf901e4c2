use crate::cache::{spawn_eviction, SessionCache};
use crate::config::Config;
use crate::content::HttpCatalog;
use crate::device::ConnectionSettings;
use crate::discovery::{Discover, SsdpDiscovery};
use crate::dispatch::{Dispatcher, Provisioner};
use crate::store::FileStore;
use crate::wake::MagicPacket;
use crate::webos::WebOsConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let command = args.next();

    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;

    match command.as_deref() {
        Some("discover") => return handle_discover(&config).await,
        Some("send") => {
            let raw = args.next().ok_or("usage: send '<message json>'")?;
            return handle_send(&config, &raw).await;
        }
        Some(other) => return Err(format!("unknown subcommand '{other}'").into()),
        None => {}
    }

    let addr = config.server_addr()?;
    let dispatcher = Arc::new(build_dispatcher(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        res = crate::server::start(addr, dispatcher.clone(), shutdown_rx) => {
            dispatcher.shutdown().await;
            res
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            dispatcher.shutdown().await;
            Ok(())
        }
    }
}

fn build_dispatcher(config: &Config) -> Result<Dispatcher, Box<dyn std::error::Error>> {
    let store = Arc::new(FileStore::new(config.store.resolved_path()));
    let discovery = Arc::new(SsdpDiscovery::from_config(&config.discovery)?);
    let broadcast: SocketAddr = config.wake.broadcast_addr.parse()?;
    let connector = Arc::new(WebOsConnector::new(config.device.port, store.clone()));
    let content = Arc::new(HttpCatalog::from_config(&config.content)?);

    let provisioner = Provisioner::new(
        config.device.name.clone(),
        store.clone(),
        discovery,
        config.discovery.timeout(),
        connector,
        Arc::new(MagicPacket::new(broadcast)),
        ConnectionSettings::from(&config.device),
    );

    let cache = Arc::new(SessionCache::new(Duration::from_secs(config.cache.idle_ttl_secs)));
    spawn_eviction(&cache, Duration::from_millis(config.cache.sweep_interval_ms));

    Ok(Dispatcher::new(cache, provisioner, store, content))
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_discover(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let discovery = SsdpDiscovery::from_config(&config.discovery)?;
    let mut device = discovery.discover_device(config.discovery.timeout()).await?;
    device.name = config.device.name.clone();
    println!("{}", serde_json::to_string_pretty(&device)?);
    Ok(())
}

async fn handle_send(config: &Config, raw: &str) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = build_dispatcher(config)?;
    let res = dispatcher.handle(raw).await;
    dispatcher.shutdown().await;
    res?;
    println!("ok");
    Ok(())
}
