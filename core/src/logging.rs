use r2d2_sqlite::rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Structured runtime event surfaced through the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub module: String,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

/// Return the most recent events, newest first, optionally filtered by module.
pub fn recent_events(
    conn: &Connection,
    module: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<RuntimeEvent>> {
    let mut events = Vec::new();
    if let Some(module) = module {
        let mut stmt = conn.prepare(
            "SELECT id, ts, level, code, module, message, explain, data FROM event_log WHERE module = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![module, limit as i64], map_event)?;
        for row in rows {
            events.push(row?);
        }
        return Ok(events);
    }
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, code, module, message, explain, data FROM event_log ORDER BY ts DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], map_event)?;
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuntimeEvent> {
    let data_str: Option<String> = row.get(7)?;
    let data = data_str.and_then(|raw| serde_json::from_str(&raw).ok());
    Ok(RuntimeEvent {
        id: row.get(0)?,
        ts: row.get(1)?,
        level: row.get(2)?,
        code: row.get(3)?,
        module: row.get(4)?,
        message: row.get(5)?,
        explain: row.get(6)?,
        data,
    })
}
