use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::seeds::PROVIDER_SEEDS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub key: String,
    pub kind: String,
    pub display_name: String,
    pub description: Option<String>,
    pub base_url: Option<String>,
    pub default_model: String,
    pub requires_api_key: bool,
    pub has_credentials: bool,
}

/// Everything the gateway needs to issue one provider call.
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub info: ProviderInfo,
    pub model: String,
    pub secret: Option<String>,
}

/// Upsert the static provider registry and import credentials from the
/// environment for providers that do not have one stored yet.
pub fn seed_defaults(conn: &rusqlite::Connection) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for seed in PROVIDER_SEEDS {
        conn.execute(
            "INSERT INTO providers (id, kind, display_name, description, base_url, default_model, requires_api_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 display_name = excluded.display_name,
                 description = excluded.description,
                 base_url = excluded.base_url,
                 default_model = excluded.default_model,
                 requires_api_key = excluded.requires_api_key,
                 updated_at = excluded.updated_at",
            params![
                seed.id,
                seed.kind,
                seed.display,
                seed.description,
                seed.base_url,
                seed.default_model,
                seed.requires_api_key as i32,
                now,
            ],
        )?;

        if let Some(env_key) = seed.env_key {
            if load_secret(conn, seed.id)?.is_none() {
                if let Ok(value) = std::env::var(env_key) {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        store_credential(conn, seed.id, trimmed)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Enumerate providers in registry (seed) order.
pub fn list_providers(conn: &rusqlite::Connection) -> Result<Vec<ProviderInfo>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.kind, p.display_name, p.description, p.base_url, p.default_model, p.requires_api_key, \
                (SELECT COUNT(1) FROM provider_credentials c WHERE c.provider_id = p.id) as has_secret
         FROM providers p
         ORDER BY p.rowid",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(ProviderInfo {
            key: row.get(0)?,
            kind: row.get(1)?,
            display_name: row.get(2)?,
            description: row.get(3)?,
            base_url: row.get(4)?,
            default_model: row.get(5)?,
            requires_api_key: row.get::<_, i64>(6)? != 0,
            has_credentials: row.get::<_, i64>(7)? > 0,
        })
    })?;

    let mut providers = Vec::new();
    for row in rows {
        providers.push(row?);
    }
    Ok(providers)
}

pub fn get_provider(conn: &rusqlite::Connection, key: &str) -> Result<ProviderInfo> {
    conn.query_row(
        "SELECT p.id, p.kind, p.display_name, p.description, p.base_url, p.default_model, p.requires_api_key,
                (SELECT COUNT(1) FROM provider_credentials c WHERE c.provider_id = p.id) as has_secret
         FROM providers p WHERE p.id = ?1",
        params![key],
        |row| {
            Ok(ProviderInfo {
                key: row.get(0)?,
                kind: row.get(1)?,
                display_name: row.get(2)?,
                description: row.get(3)?,
                base_url: row.get(4)?,
                default_model: row.get(5)?,
                requires_api_key: row.get::<_, i64>(6)? != 0,
                has_credentials: row.get::<_, i64>(7)? > 0,
            })
        },
    )
    .map_err(|_| anyhow!("Unknown provider: {key}"))
}

/// Resolve the selection used for a call to the named provider.
pub fn resolve_selection(conn: &rusqlite::Connection, key: &str) -> Result<ProviderSelection> {
    let info = get_provider(conn, key)?;
    let model = info.default_model.clone();
    let secret = load_secret(conn, &info.key)?;
    Ok(ProviderSelection {
        info,
        model,
        secret,
    })
}

pub fn store_credential(conn: &rusqlite::Connection, key: &str, secret: &str) -> Result<()> {
    let encoded = B64_ENGINE.encode(secret.as_bytes());
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO provider_credentials (provider_id, secret, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(provider_id) DO UPDATE SET secret = excluded.secret, updated_at = excluded.updated_at",
        params![key, encoded, now],
    )?;
    Ok(())
}

pub fn load_secret(conn: &rusqlite::Connection, key: &str) -> Result<Option<String>> {
    let secret: Option<String> = conn
        .query_row(
            "SELECT secret FROM provider_credentials WHERE provider_id = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(s) = secret {
        let decoded = B64_ENGINE
            .decode(s.as_bytes())
            .map_err(|_| anyhow!("Failed to decode stored credential"))?;
        let value = String::from_utf8(decoded)
            .map_err(|_| anyhow!("Stored credential was not valid UTF-8"))?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}
