pub mod cli;
pub mod client;
pub mod engine;
pub mod error;
pub mod listing;
pub mod models;
pub mod registry;
pub mod server;
pub mod store;
pub mod unread;

use cli::Args;
use engine::ChatEngine;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP API Port: {}", args.http_port);
    info!("Store Type: {}", args.store_type);
    if args.store_type.to_lowercase() == "redis" {
        info!("Store URL: {}", args.store_url);
        info!("Store Key Prefix: {}", args.store_key_prefix);
    }
    info!("Listing Directory: {}", args.listing_directory);
    if args.listing_directory.to_lowercase() == "http" {
        info!("Listing API URL: {}", args.listing_api_url);
    }
    info!("Auth Secret Configured: {}", args.auth_secret.as_deref().map_or(false, |s| !s.is_empty()));
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let engine = Arc::new(ChatEngine::from_args(&args)?);
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, engine, args.clone());
    server.run().await?;

    Ok(())
}
