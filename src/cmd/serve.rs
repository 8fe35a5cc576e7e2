//! Server and schema commands — `twinfix serve`, `twinfix init-db`.

use anyhow::{Context, Result};
use twinfix::config::TrackerConfig;
use twinfix::store::TrackerDb;

pub async fn cmd_serve(config: TrackerConfig) -> Result<()> {
    twinfix::server::start_server(config).await
}

pub fn cmd_init_db(config: &TrackerConfig) -> Result<()> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    TrackerDb::new(db_path)?;
    println!("Tracker database initialized at {}", db_path.display());
    Ok(())
}
