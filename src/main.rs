use std::sync::Arc;
use std::fs::File;
use std::io::{BufRead, BufReader};
use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

mod arbiter;
mod capture;
mod config;
mod config_store;
mod errors;
mod frame;
mod handlers;
mod hub;
mod mjpeg;
mod producer;
mod settings;
mod stream_manager;
mod supervisor;
mod utils;
#[cfg(test)]
mod testing;

use arbiter::{NoopArbiter, ResourceArbiter, SystemdArbiter};
use capture::{CaptureService, CommandStillCapture};
use config::Config;
use config_store::SqliteConfigStore;
use handlers::AppState;
use producer::CommandLauncher;
use stream_manager::StreamManager;

#[derive(Parser, Debug)]
#[command(name = "allsky-capture-server", about = "Live view and single-shot capture for an all-sky camera")]
struct Args {
    /// Configuration file (TOML, or JSON when the name ends in .json)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long, default_value = "allsky_capture_server=debug,info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_filter))
        .init();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {} ({}), using default configuration", args.config, e);
        Config::default()
    });
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("Starting allsky capture server on {}:{}", config.server.host, config.server.port);

    let arbiter: Arc<dyn ResourceArbiter> = if config.arbiter.enabled {
        info!("Camera shared with {} (sensor '{}')", config.arbiter.service, config.camera.sensor);
        Arc::new(SystemdArbiter::new(config.arbiter.clone(), &config.camera))
    } else {
        info!("No always-on capture service configured");
        Arc::new(NoopArbiter)
    };

    let manager = Arc::new(StreamManager::new(&config, Arc::new(CommandLauncher), arbiter));
    let still = Arc::new(CommandStillCapture::new(&config.camera, config.stream.diagnostic_bytes));
    let capture = Arc::new(CaptureService::new(&config, manager.clone(), still));

    let config_store = Arc::new(SqliteConfigStore::open(&config.allsky.database_path)?);
    info!("Slider settings stored in {}", config.allsky.database_path);

    let state = AppState {
        manager: manager.clone(),
        capture: capture.clone(),
        config_store,
        base_path: config.server.base_path.clone(),
        feed_wait: config.stream.feed_wait,
    };

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => {
                    tower_http::cors::CorsLayer::new()
                        .allow_origin(origin_header)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any)
                }
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = handlers::router(state, capture.images_directory()).layer(cors_layer);
    info!("Routes mounted under '{}', images served from {}",
          if config.server.base_path.is_empty() { "/" } else { config.server.base_path.as_str() },
          capture.images_directory().display());

    let addr = format!("{}:{}", config.server.host, config.server.port);

    match &config.server.tls {
        Some(tls_config) if tls_config.enabled => {
            info!("Starting HTTPS server on {}", addr);
            start_https_server(app, &addr, tls_config, manager).await
        }
        _ => {
            info!("Starting HTTP server on {}", addr);
            start_http_server(app, &addr, manager).await
        }
    }
}

// Ends every open MJPEG response and hands the camera back
async fn shutdown_signal(manager: Arc<StreamManager>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
    if manager.stop().await {
        info!("Stopped live stream during shutdown");
    }
}

async fn start_http_server(app: axum::Router, addr: &str, manager: Arc<StreamManager>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;
    Ok(())
}

async fn start_https_server(
    app: axum::Router,
    addr: &str,
    tls_cfg: &config::TlsConfig,
    manager: Arc<StreamManager>,
) -> Result<()> {
    let rustls_config = load_tls_config(tls_cfg)?;
    info!("HTTPS server listening on https://{} (certificate {})", addr, tls_cfg.cert_path);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal(manager).await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
    axum_server::bind_rustls(addr.parse()?, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;

    Ok(())
}

fn load_tls_config(tls_cfg: &config::TlsConfig) -> Result<rustls::ServerConfig> {
    let certs = read_pem(&tls_cfg.cert_path, "certificate", rustls_pemfile::certs)?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in '{}'", tls_cfg.cert_path);
    }

    // PKCS#8 first, then the older RSA form
    let mut keys = read_pem(&tls_cfg.key_path, "private key", rustls_pemfile::pkcs8_private_keys)?;
    if keys.is_empty() {
        keys = read_pem(&tls_cfg.key_path, "private key", rustls_pemfile::rsa_private_keys)?;
    }
    let key = keys.into_iter().next()
        .ok_or_else(|| anyhow::anyhow!("No private key found in '{}'", tls_cfg.key_path))?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs.into_iter().map(rustls::Certificate).collect(), rustls::PrivateKey(key))
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))
}

fn read_pem<F>(path: &str, what: &str, parse: F) -> Result<Vec<Vec<u8>>>
where
    F: FnOnce(&mut dyn BufRead) -> std::io::Result<Vec<Vec<u8>>>,
{
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open {} file '{}': {}", what, path, e))?;
    parse(&mut BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Failed to parse {} in '{}': {}", what, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls(dir: &std::path::Path, cert: &str, key: &str) -> config::TlsConfig {
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();
        config::TlsConfig {
            enabled: true,
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn test_tls_loading_names_the_bad_file() {
        let dir = tempfile::tempdir().unwrap();

        let missing = config::TlsConfig {
            enabled: true,
            cert_path: dir.path().join("absent.pem").to_string_lossy().into_owned(),
            key_path: dir.path().join("absent.key").to_string_lossy().into_owned(),
        };
        let err = load_tls_config(&missing).unwrap_err().to_string();
        assert!(err.starts_with("Failed to open certificate file"), "{}", err);
        assert!(err.contains("absent.pem"));

        let empty = tls(dir.path(), "", "");
        let err = load_tls_config(&empty).unwrap_err().to_string();
        assert!(err.starts_with("No certificate found"), "{}", err);

        let no_key = tls(dir.path(), "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n", "");
        let err = load_tls_config(&no_key).unwrap_err().to_string();
        assert!(err.starts_with("No private key found"), "{}", err);
    }
}
