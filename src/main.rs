use std::env;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use performance_engine::api::{self, AppState};
use performance_engine::{
    attach_feedback, load_attempts_from_path, load_feedback_from_path, EngineConfig,
};

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

fn load_config() -> Result<EngineConfig> {
    match env::var("PERFORMANCE_ENGINE_CONFIG") {
        Ok(path) => EngineConfig::from_path(&path)
            .with_context(|| format!("failed to load config from {path}")),
        Err(_) => Ok(EngineConfig::default()),
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = load_config()?;
    let mut state = AppState::new(config);

    // Attempts can also be posted after startup.
    if let Ok(path) = env::var("PERFORMANCE_ENGINE_DATA") {
        let mut rows = load_attempts_from_path(&path)
            .with_context(|| format!("failed to read attempts from {path}"))?;
        if let Ok(feedback_path) = env::var("PERFORMANCE_ENGINE_FEEDBACK") {
            let feedback = load_feedback_from_path(&feedback_path)
                .with_context(|| format!("failed to read feedback from {feedback_path}"))?;
            attach_feedback(&mut rows, &feedback);
        }
        let loaded = state.ingest(rows).context("failed to load attempts")?;
        info!(attempts = loaded.attempts, students = loaded.students, "preloaded attempts");
    } else {
        warn!("PERFORMANCE_ENGINE_DATA not set, starting with no attempts");
    }

    let addr = env::var("PERFORMANCE_ENGINE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let state = web::Data::new(RwLock::new(state));

    info!(%addr, "starting performance engine v{}", env!("CARGO_PKG_VERSION"));
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .run()
        .await
        .context("server error")?;

    Ok(())
}
