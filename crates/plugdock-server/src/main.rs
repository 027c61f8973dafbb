//! plugdock server binary.
//!
//! `plugdock [--port N] [--config PATH] MODULE` — loads MODULE into a
//! worker pool and serves `/status` and `/invoke/:func`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use plugdock_host::host::{HostConfig, PluginHost};
use plugdock_host::{PluginDescriptor, WasmConfig, WasmEngine};
use plugdock_server::api;

#[derive(Parser, Debug)]
#[command(name = "plugdock", version, about = "Sandboxed plugin-function host")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// JSON file merged into the plugin descriptor
    /// (`id`, `globals`, `concurrency`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Plugin module, as a path or file:// URI.
    module: String,
}

/// Optional descriptor overrides from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigOverlay {
    id: Option<String>,
    globals: Option<serde_json::Map<String, serde_json::Value>>,
    concurrency: Option<usize>,
}

/// Resolve MODULE to an absolute URI. Anything that is not already a
/// URI is taken as a filesystem path relative to the current directory.
fn resolve_module(module: &str) -> Result<String, String> {
    if let Ok(url) = Url::parse(module) {
        return Ok(url.to_string());
    }
    let cwd = std::env::current_dir().map_err(|e| format!("cannot resolve cwd: {e}"))?;
    let absolute = cwd.join(module);
    Url::from_file_path(&absolute)
        .map(|u| u.to_string())
        .map_err(|_| format!("cannot resolve module path: {module}"))
}

fn build_descriptor(args: &Args) -> Result<PluginDescriptor, String> {
    let module = resolve_module(&args.module)?;
    let mut descriptor = PluginDescriptor::new(module);

    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
        let overlay: ConfigOverlay = serde_json::from_str(&raw)
            .map_err(|e| format!("invalid config {}: {e}", path.display()))?;
        if let Some(id) = overlay.id {
            descriptor = descriptor.with_id(id);
        }
        if let Some(globals) = overlay.globals {
            descriptor.globals = globals;
        }
        if let Some(concurrency) = overlay.concurrency {
            descriptor = descriptor.with_concurrency(concurrency);
        }
    }

    Ok(descriptor)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let descriptor = match build_descriptor(&args) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        module = %descriptor.module,
        concurrency = descriptor.concurrency(),
        "launching plugin host"
    );

    let engine = Arc::new(WasmEngine::new(WasmConfig::from_env()));
    let host = PluginHost::launch(descriptor, engine, HostConfig::default());

    let app = api::router(host.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    tracing::info!(%addr, "plugdock listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(host))
        .await
        .expect("server error");
}

async fn shutdown_signal(host: PluginHost) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining invocations");
    if let Err(e) = host.shutdown().await {
        tracing::warn!("shutdown did not complete cleanly: {e}");
        host.terminate();
    }
}
