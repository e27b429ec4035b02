//! assessment-sync: headless sync runner
//!
//! Loads the engine configuration, reads PACS tables from a directory of JSON
//! fixtures, runs the configured job to a terminal state and prints the final
//! job state as JSON.
//!
//! ## Configuration
//! ```text
//! ASSESSMENT_SYNC_CONFIG=sync.yaml          # engine configuration
//! ASSESSMENT_SYNC_SOURCE_DIR=./pacs         # <table>.json per source table
//! ASSESSMENT_SYNC_SANITIZE_SECRET=...       # keyed sanitization secret
//! ASSESSMENT_SYNC_LOG=debug                 # tracing filter
//! ```

use std::sync::Arc;

use tracing::{error, info};

use assessment_sync::config::{EngineConfig, SOURCE_DIR_ENV_VAR};
use assessment_sync::connectors::MemorySource;
use assessment_sync::model::JobStatus;
use assessment_sync::utils::bootstrap::init_tracing;
use assessment_sync::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = EngineConfig::load(config_path.as_deref())?;
    let source_dir = std::env::var(SOURCE_DIR_ENV_VAR)
        .map_err(|_| format!("{} must name the source fixture directory", SOURCE_DIR_ENV_VAR))?;
    let source = Arc::new(MemorySource::from_dir(&source_dir)?);

    let engine = Engine::builder()
        .with_config(&config)?
        .with_source(source)
        .build()
        .await?;

    let job_id = engine.submit(config.job.clone()).await?;
    info!(%job_id, source_dir = %source_dir, "assessment-sync started");

    let state = engine.wait(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);

    if state.status != JobStatus::Completed {
        error!(%job_id, status = ?state.status, "Job did not complete");
        std::process::exit(1);
    }
    Ok(())
}
