//! Hive Gateway
//!
//! Authenticated reverse-proxy gateway for the i2b2 hive web client:
//! forwards browser XML envelopes to whitelisted backend cells and bridges
//! SAML single sign-on into backend session tokens.

mod config;
mod error;
mod issuance;
mod proxy;
mod saml;
mod server;
mod upstream;
mod xml;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use config::GatewayConfig;
use proxy::{Allowlist, HeaderSanitizer, ProxyEngine};
use saml::{SamaelVerifier, SamlBridge};
use server::RouterOptions;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "hive-gateway")]
#[command(about = "Authenticated reverse-proxy gateway and SAML session bridge for the hive web client")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "gateway.json", env = "GATEWAY_CONFIG")]
    config: PathBuf,

    /// Listen address, overrides the configuration file
    #[arg(long, env = "GATEWAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Enable verbose logging
    #[arg(short, long, env = "GATEWAY_VERBOSE")]
    verbose: bool,
}

/// Wire every configured component into one router.
fn build_app(config: &GatewayConfig) -> Result<axum::Router> {
    let allowlist = Arc::new(Allowlist::new(&config.load_allowlist()?));
    if allowlist.is_empty() {
        warn!("Allowlist is empty, every proxied destination will be refused");
    } else {
        info!(entries = allowlist.len(), "Allowlist ready");
    }

    let sanitizer = match config.issuance {
        Some(ref issuance) => HeaderSanitizer::new(issuance.identity_headers.names()),
        None => HeaderSanitizer::default(),
    };

    let client = upstream::build_client(config.proxy_to_self_signed_tls, None)?;
    let engine = ProxyEngine::new(config.proxy.clone(), Arc::clone(&allowlist), sanitizer, client)
        .context("Failed to configure proxy engine")?;
    info!(
        path = %engine.path(),
        max_body_size = config.proxy.max_body_size,
        self_signed_tls = config.proxy_to_self_signed_tls,
        "Proxy engine configured"
    );
    let proxy_router = proxy::router(Arc::new(engine));

    let saml_router = match (&config.saml, &config.issuance) {
        (Some(saml_config), Some(issuance_config)) => {
            let issuer = issuance::build_issuer(issuance_config, config.proxy_to_self_signed_tls)
                .context("Failed to configure session issuance")?;
            let verifier = Arc::new(SamaelVerifier::new(
                saml_config.clock_skew_secs,
                saml_config.allow_unsigned_assertions,
            ));
            let bridge = SamlBridge::new(saml_config.clone(), Arc::clone(&allowlist), verifier, issuer)
                .context("Failed to configure SAML bridge")?;
            info!(
                base_path = %bridge.base_path(),
                services = ?bridge.service_names(),
                "SAML bridge configured"
            );
            let base_path = bridge.base_path().to_string();
            Some((base_path, saml::router(Arc::new(bridge))))
        }
        _ => {
            info!("SAML bridge disabled");
            None
        }
    };

    let options = RouterOptions {
        use_cors: config.use_cors,
        hosting_dir: config.hosting_dir.clone(),
    };

    Ok(server::build_router(proxy_router, saml_router, &options))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={},tower_http=info", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting Hive Gateway");

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!(
        config = %args.config.display(),
        listen = %config.listen,
        saml = config.saml.is_some(),
        issuance = config.issuance.as_ref().map(|i| i.protocol.as_str()).unwrap_or("none"),
        cors = config.use_cors,
        "Configuration loaded"
    );

    let app = build_app(&config)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    tokio::select! {
        result = server::serve(listener, app) => result?,
        _ = shutdown_signal() => {},
    }

    info!("Hive Gateway stopped");
    Ok(())
}
