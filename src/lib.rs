//! PortKnox - SSH port-forward manager
//!
//! Keeps local SSH forwards alive: supervised reconnection, restoration of
//! saved forwards on restart, and optional model registration with a LiteLLM
//! gateway for forwards that expose an OpenAI-compatible server.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (relay buffers, channel messages)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod api;
pub mod config;
pub mod forwarding;
pub mod model_bridge;
pub mod ssh;
pub mod state;
pub mod tunnel;

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::AppState;
use config::{ConfigStorage, ServiceConfig};
use model_bridge::{LiteLlmBridge, ModelBridge};
use state::{StateStore, TunnelPersistence, TunnelStore};
use tunnel::{ConnectionEstablisher, SshEstablisher, TunnelManager};

/// Write startup log to file (useful when the service runs without a terminal)
fn write_startup_log(message: &str) {
    if let Ok(log_dir) = config::log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);

        let log_file = log_dir.join("startup.log");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_file) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "[{}] {}", timestamp, message);
        }
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn load_config() -> ServiceConfig {
    let mut config = match ConfigStorage::new() {
        Ok(storage) => match storage.load_or_init().await {
            Ok(config) => config,
            Err(e) => {
                let msg = format!("Failed to load config from {:?}: {}", storage.path(), e);
                tracing::warn!("{}, using defaults", msg);
                write_startup_log(&msg);
                ServiceConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to locate config directory: {}, using defaults", e);
            ServiceConfig::default()
        }
    };
    config.apply_env();
    config
}

/// Open the tunnel store; the service keeps running without one
fn open_store(config: &ServiceConfig) -> Option<Arc<dyn TunnelStore>> {
    let path = match config.state_db.clone() {
        Some(path) => path,
        None => match config::state_db_file() {
            Ok(path) => path,
            Err(e) => {
                let msg = format!("Failed to get config directory: {}", e);
                tracing::error!("{}", msg);
                write_startup_log(&msg);
                return None;
            }
        },
    };

    write_startup_log(&format!("State DB path: {:?}", path));

    match StateStore::new(&path) {
        Ok(store) => {
            write_startup_log("State store initialized");
            Some(Arc::new(TunnelPersistence::new(Arc::new(store))))
        }
        Err(e) => {
            let msg = format!(
                "Failed to initialize state store at {:?}: {}. Persistence disabled.",
                path, e
            );
            tracing::error!("{}", msg);
            write_startup_log(&msg);
            None
        }
    }
}

fn build_bridge(config: &ServiceConfig) -> Option<Arc<dyn ModelBridge>> {
    let settings = &config.model_bridge;
    if !settings.enabled {
        tracing::info!("Model bridge disabled");
        return None;
    }

    match LiteLlmBridge::new(
        settings.base_url.clone(),
        settings.api_key.clone(),
        Duration::from_secs(settings.timeout_secs),
    ) {
        Ok(bridge) => {
            tracing::info!("Model bridge targeting {}", bridge.base_url());
            Some(Arc::new(bridge))
        }
        Err(e) => {
            tracing::warn!("Failed to build model bridge client: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Run the service until ctrl-c
pub async fn run() {
    write_startup_log("PortKnox starting...");

    init_logging();

    tracing::info!("Starting PortKnox...");
    write_startup_log("Logging initialized");

    let config = load_config().await;

    let addr: SocketAddr = match config.api.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            let msg = format!("Invalid API bind address {:?}: {}", config.api.bind, e);
            tracing::error!("{}", msg);
            write_startup_log(&msg);
            return;
        }
    };

    let store = open_store(&config);
    let bridge = build_bridge(&config);
    let establisher: Arc<dyn ConnectionEstablisher> = Arc::new(SshEstablisher::new(
        config.ssh.clone(),
        config.lifecycle.probe(),
    ));

    let manager = TunnelManager::new(
        establisher,
        store,
        bridge,
        config.lifecycle.reconnect(),
        config.lifecycle.restore(),
    );

    // Restoration runs alongside the API so saved forwards come back while
    // new requests are already served
    let restorer = manager.clone();
    tokio::spawn(async move {
        restorer.restore_saved().await;
    });

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });

    write_startup_log(&format!("Serving HTTP API on {}", addr));
    if let Err(e) = api::serve(addr, state, shutdown_signal()).await {
        let msg = format!("HTTP API failed on {}: {}", addr, e);
        tracing::error!("{}", msg);
        write_startup_log(&msg);
    }

    manager.shutdown().await;
    tracing::info!("PortKnox stopped");
}
