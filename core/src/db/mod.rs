use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::providers::config as provider_config;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn init_db(data_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("air.db");
    let mgr = SqliteConnectionManager::file(&db_path);
    let pool = Pool::new(mgr)?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
        provider_config::seed_defaults(&conn)?;
    }
    Ok(pool)
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_providers.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_providers.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

/// Single-connection in-memory pool used by the unit tests. The pool is
/// capped at one connection because each in-memory connection is its own
/// database.
#[cfg(test)]
pub(crate) fn memory_pool() -> DbPool {
    let mgr = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(mgr)
        .expect("failed to build in-memory pool");
    {
        let conn = pool.get().expect("failed to open in-memory connection");
        apply_migrations(&conn).expect("failed to apply migrations");
        provider_config::seed_defaults(&conn).expect("failed to seed providers");
    }
    pool
}
