mod app;
mod auth;
mod campaign;
mod config;
mod gmail;
mod recipients;
mod template;

use anyhow::Context;
use app::RapidMailApp;
use auth::credentials::{CredentialStore, MemoryStore};
use config::AppConfig;
use eframe::egui;
use log::{error, info, warn};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    // Load .env before the config layer reads RAPIDMAIL__* variables
    let dotenv = dotenvy::dotenv();
    env_logger::init();
    match dotenv {
        Ok(path) => info!("Loaded .env file from: {:?}", path),
        Err(_) => info!("No .env file loaded; using config file and environment"),
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration, using defaults: {}", e);
            AppConfig::default()
        }
    };

    let credentials = match config.storage.open_backend().and_then(CredentialStore::open) {
        Ok(store) => store,
        Err(e) => {
            error!("Credential storage unavailable, keeping credentials for this session only: {}", e);
            CredentialStore::open(Box::new(MemoryStore::default()))?
        }
    };
    let credentials = Arc::new(credentials);

    let tokio_rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([960.0, 760.0])
            .with_min_inner_size([700.0, 540.0])
            .with_drag_and_drop(true),
        ..Default::default()
    };

    info!("Starting RapidMail");
    eframe::run_native(
        "RapidMail - Bulk Email Sender",
        options,
        Box::new(move |cc| Ok(Box::new(RapidMailApp::new(cc, config, credentials, tokio_rt)))),
    )
    .map_err(|e| anyhow::anyhow!("Failed to run the application: {}", e))
}
