//! polystore server
//!
//! Serves a storage backend to remote adapters over a Unix socket. Each
//! client session names a namespace; the server opens one backend per
//! namespace from the configured template.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use polystore::transport::{ConfigProvider, RemoteServer};
use polystore::{BackendType, StorageConfig};

/// Server configuration
struct Config {
    /// Socket to listen on
    socket: PathBuf,
    backend: BackendType,
    /// Root directory for file and sqlite backends
    data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("./polystore.sock"),
            backend: BackendType::Sqlite,
            data_dir: PathBuf::from("./polystore-data"),
        }
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--socket" | "-s" => {
                let Some(value) = value else { usage_error("--socket requires a value") };
                config.socket = PathBuf::from(value);
                i += 2;
            }
            "--backend" | "-b" => {
                let Some(value) = value else { usage_error("--backend requires a value") };
                config.backend = value
                    .parse()
                    .unwrap_or_else(|e: polystore::ValidationError| usage_error(&e.to_string()));
                if config.backend == BackendType::Remote {
                    usage_error("the server cannot serve a remote backend");
                }
                i += 2;
            }
            "--data-dir" | "-d" => {
                let Some(value) = value else { usage_error("--data-dir requires a value") };
                config.data_dir = PathBuf::from(value);
                i += 2;
            }
            "--help" | "-h" => {
                println!("polystore-server - serve a polystore backend over a Unix socket");
                println!();
                println!("USAGE:");
                println!("    polystore-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -s, --socket <PATH>       Socket path [default: ./polystore.sock]");
                println!("    -b, --backend <TYPE>      memory | file | sqlite [default: sqlite]");
                println!("    -d, --data-dir <DIR>      Data directory [default: ./polystore-data]");
                println!("    -h, --help                Print help information");
                println!();
                println!("Logging is controlled with RUST_LOG (default: info).");
                std::process::exit(0);
            }
            arg => usage_error(&format!("unknown argument: {arg}")),
        }
    }

    config
}

fn template(config: &Config) -> std::io::Result<StorageConfig> {
    let base = StorageConfig::new(config.backend, "default");
    Ok(match config.backend {
        BackendType::Memory | BackendType::Remote => base,
        BackendType::File | BackendType::Sqlite => {
            std::fs::create_dir_all(&config.data_dir)?;
            base.option("path", config.data_dir.to_string_lossy().into_owned())
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args();
    let provider = Arc::new(ConfigProvider::new(template(&config)?));
    let listener = RemoteServer::bind(&config.socket)?;
    let server = Arc::new(RemoteServer::new(provider.clone()));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.socket.display(),
        backend = config.backend.as_str(),
        data_dir = %config.data_dir.display(),
        "polystore server listening"
    );

    server
        .serve(listener, async {
            let _ = signal::ctrl_c().await;
            info!("shutting down");
        })
        .await;

    provider.close_all().await;
    let _ = std::fs::remove_file(&config.socket);
    info!("shut down");
    Ok(())
}
