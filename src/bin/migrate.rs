use anyhow::{bail, Result};
use event_sync::config::load_config;
use event_sync::db::migrations;
use log::info;
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::path::PathBuf;

/// Usage: `migrate [--list | --only <name>] [config]`
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let mut only = None;
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--list" => {
                for name in migrations::migration_names() {
                    println!("{}", name);
                }
                return Ok(());
            }
            "--only" => match args.next() {
                Some(name) => only = Some(name),
                None => bail!("--only needs a migration name"),
            },
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    let config = load_config(config_path.as_deref())?;
    if config.database.is_memory() {
        bail!("The in-memory event store has nothing to migrate");
    }

    // Get database URL from environment variable or use the configured one
    let database_url = env::var("DATABASE_URL").unwrap_or(config.database.url);
    info!("Connecting to database");

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;

    match only {
        Some(name) => migrations::run_single_migration(&pool, &name).await?,
        None => migrations::run_migrations(&pool).await?,
    }

    info!("Migrations completed successfully");
    Ok(())
}
