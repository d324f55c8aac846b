//! relayium gateway binary.
//!
//! ```bash
//! relayium --config relayium.yaml --bind 127.0.0.1:8088
//! RUST_LOG=relayium=debug relayium
//! ```

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use relayium::config::RelayConfig;
use relayium::server::{config_routes, Gateway};
use relayium::util::{build_http_client_from_env, cors_config_from_env, env_bind_addr, init_tracing};
use std::path::PathBuf;

/// Multi-provider LLM relay gateway
#[derive(Parser, Debug)]
#[command(name = "relayium", version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short = 'b', long, env = "RELAYIUM_BIND_ADDR", value_name = "ADDR")]
    bind: Option<String>,

    /// YAML or JSON configuration file
    #[arg(short = 'c', long, env = "RELAYIUM_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let cfg = RelayConfig::load(args.config.as_deref()).context("loading configuration")?;
    let bind = args
        .bind
        .or_else(|| cfg.bind_addr.clone())
        .unwrap_or_else(env_bind_addr);

    let gateway = Gateway::build(&cfg, build_http_client_from_env())
        .await
        .context("building gateway")?;
    let state = web::Data::new(gateway.state.clone());

    tracing::info!(bind = %bind, "starting relayium");
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&bind)
    .with_context(|| format!("binding {}", bind))?
    .run()
    .await
    .context("http server")?;

    tracing::info!("server stopped, draining");
    gateway.shutdown().await;
    Ok(())
}
