use anyhow::{Context, Result};
use sqlx::{Executor, PgPool};
use tracing::info;

/// Migrations in the order they must be applied. Every script is
/// idempotent so the whole list is replayed on each start.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_create_events.sql",
        include_str!("sql/001_create_events.sql"),
    ),
    ("002_add_indexes.sql", include_str!("sql/002_add_indexes.sql")),
];

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        execute_migration(pool, name, sql).await?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}

/// Run a specific migration by file name
pub async fn run_single_migration(pool: &PgPool, migration_name: &str) -> Result<()> {
    let (name, sql) = MIGRATIONS
        .iter()
        .find(|(name, _)| *name == migration_name)
        .ok_or_else(|| anyhow::anyhow!("Migration {} not found", migration_name))?;

    execute_migration(pool, name, sql).await?;
    info!("Applied migration: {}", name);

    Ok(())
}

pub fn migration_names() -> impl Iterator<Item = &'static str> {
    MIGRATIONS.iter().map(|(name, _)| *name)
}

async fn execute_migration(pool: &PgPool, name: &str, sql: &str) -> Result<()> {
    pool.execute(sql)
        .await
        .with_context(|| format!("Failed to apply migration {}", name))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_by_prefix() {
        let names: Vec<_> = migration_names().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn events_table_enforces_key_uniqueness() {
        assert!(MIGRATIONS[0]
            .1
            .contains("UNIQUE (camera_id, native_key)"));
    }
}
