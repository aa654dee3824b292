//! # ATRIUM Server
//!
//! The headless authoritative world. No GPU, no windowing: sockets in,
//! simulation at 50 Hz, persistence on an interval.

use std::sync::Arc;

use atrium::assets::{AssetCache, AssetFetcher};
use atrium::persistence::{MemoryStore, WorldStore};
use atrium::physics::AnalyticScene;
use atrium::world::{NetSink, World, WorldRole};
use atrium::{Settings, TickEngine};
use atrium_networking::{FramePacer, WsServer};
use atrium_shared::constants::GRAVITY;

/// Fetcher that serves `asset://` urls from a directory of content-addressed
/// files (the HTTP upload collaborator writes them there).
struct DirFetcher {
    root: std::path::PathBuf,
}

impl AssetFetcher for DirFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let Some(name) = url.strip_prefix("asset://") else {
            return Err(format!("unsupported url scheme: {url}"));
        };
        if name.contains('/') || name.contains("..") {
            return Err(format!("suspicious asset name: {name}"));
        }
        std::fs::read(self.root.join(name)).map_err(|err| err.to_string())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = match std::fs::read_to_string("atrium.toml") {
        Ok(doc) => match Settings::from_toml(&doc) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!(%err, "bad atrium.toml");
                std::process::exit(2);
            }
        },
        Err(_) => Settings::from_env(),
    };
    tracing::info!(world = %settings.world, bind = %settings.bind, "starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(%err, "tokio runtime failed to start");
            std::process::exit(2);
        }
    };

    let bind = match settings.bind.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%err, bind = %settings.bind, "bad bind address");
            std::process::exit(2);
        }
    };
    let (server, events) = match WsServer::spawn(runtime.handle(), bind) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::error!(%err, "listener failed to bind");
            std::process::exit(2);
        }
    };
    tracing::info!(addr = %server.local_addr(), "listening");

    let assets_dir = std::env::var("ATRIUM_ASSETS_DIR").unwrap_or_else(|_| "assets".to_owned());
    let fetcher = Arc::new(DirFetcher {
        root: assets_dir.into(),
    });
    // Servers skip avatar decoding; blueprint identity is what replicates.
    let cache = AssetCache::new(fetcher, false);

    // The disk/DB store is an external collaborator; out of the box the
    // world runs on the in-memory store.
    let store: Box<dyn WorldStore> = Box::new(MemoryStore::default());

    let tick_rate = settings.tick_rate;
    let mut world = World::new(
        settings,
        WorldRole::Server,
        Box::new(AnalyticScene::new(GRAVITY)),
        cache,
        Some(store),
    );
    world.attach_net(NetSink::Server(server), events);

    let mut engine = TickEngine::new(tick_rate);
    let mut pacer = FramePacer::new(tick_rate);
    let mut last_status = std::time::Instant::now();

    loop {
        let (start, dt) = pacer.begin_frame();
        engine.advance(&mut world, dt);
        pacer.end_frame(start);

        if last_status.elapsed().as_secs() >= 60 {
            last_status = std::time::Instant::now();
            let status = world.status();
            tracing::info!(
                sessions = status.sessions,
                entities = status.entities,
                fps = format!("{:.1}", status.achieved_fps),
                uptime = format!("{:.0}s", status.uptime_secs),
                "status"
            );
        }

        pacer.wait_for_next_frame();
    }
}
