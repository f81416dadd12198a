//! SQLite-backed row store: sync configs, per-config state, and run logs.

use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

use crate::config::SyncConfig;
use crate::models::outcome::SyncResult;
use crate::models::state::SyncState;
use crate::stores::{ConfigStore, LogSink, StateStore};

pub struct SyncDb {
    conn: Mutex<Connection>,
}

impl SyncDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_configs (
                id         TEXT PRIMARY KEY,
                enabled    INTEGER NOT NULL DEFAULT 1,
                config     TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                config_id  TEXT PRIMARY KEY REFERENCES sync_configs(id) ON DELETE CASCADE,
                state      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS sync_logs (
                id          TEXT PRIMARY KEY,
                config_id   TEXT NOT NULL,
                direction   TEXT NOT NULL,
                added       INTEGER NOT NULL,
                updated     INTEGER NOT NULL,
                deleted     INTEGER NOT NULL,
                total       INTEGER NOT NULL,
                conflicts   INTEGER NOT NULL DEFAULT 0,
                errors      TEXT NOT NULL DEFAULT '[]',
                warnings    TEXT NOT NULL DEFAULT '[]',
                started_at  TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_sync_logs_config ON sync_logs(config_id, created_at DESC);
            ",
        )?;
        Ok(())
    }

    pub fn upsert_config(&self, config: &SyncConfig, enabled: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_configs (id, enabled, config) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                config = excluded.config,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![config.id, enabled as i64, serde_json::to_string(config)?],
        )?;
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sync_configs SET enabled = ?2,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        Ok(n > 0)
    }

    /// Delete a config along with its state and logs.
    pub fn delete_config(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sync_state WHERE config_id = ?1", params![id])?;
        conn.execute("DELETE FROM sync_logs WHERE config_id = ?1", params![id])?;
        let n = conn.execute("DELETE FROM sync_configs WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn list_logs(&self, config_id: &str, limit: usize) -> anyhow::Result<Vec<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, direction, added, updated, deleted, total, conflicts,
                    errors, warnings, started_at, finished_at, duration_ms
             FROM sync_logs WHERE config_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![config_id, limit as i64], |row| {
                let errors: String = row.get(7)?;
                let warnings: String = row.get(8)?;
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "direction": row.get::<_, String>(1)?,
                    "added": row.get::<_, i64>(2)?,
                    "updated": row.get::<_, i64>(3)?,
                    "deleted": row.get::<_, i64>(4)?,
                    "total": row.get::<_, i64>(5)?,
                    "conflicts": row.get::<_, i64>(6)?,
                    "errors": serde_json::from_str::<serde_json::Value>(&errors)
                        .unwrap_or(serde_json::json!([])),
                    "warnings": serde_json::from_str::<serde_json::Value>(&warnings)
                        .unwrap_or(serde_json::json!([])),
                    "started_at": row.get::<_, String>(9)?,
                    "finished_at": row.get::<_, String>(10)?,
                    "duration_ms": row.get::<_, i64>(11)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ConfigStore for SyncDb {
    fn get(&self, id: &str) -> anyhow::Result<Option<SyncConfig>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT config FROM sync_configs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    fn list_enabled(&self) -> anyhow::Result<Vec<SyncConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT config FROM sync_configs WHERE enabled = 1 ORDER BY id")?;
        let raws = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raws.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }
}

impl StateStore for SyncDb {
    fn get(&self, config_id: &str) -> anyhow::Result<Option<SyncState>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM sync_state WHERE config_id = ?1",
                params![config_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    fn put(&self, config_id: &str, state: &SyncState) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_state (config_id, state) VALUES (?1, ?2)
             ON CONFLICT(config_id) DO UPDATE SET
                state = excluded.state,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![config_id, serde_json::to_string(state)?],
        )?;
        Ok(())
    }

    fn clear(&self, config_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sync_state WHERE config_id = ?1", params![config_id])?;
        Ok(())
    }
}

impl LogSink for SyncDb {
    fn write(&self, result: &SyncResult) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_logs
                (id, config_id, direction, added, updated, deleted, total, conflicts,
                 errors, warnings, started_at, finished_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                result.run_id,
                result.config_id,
                serde_json::to_string(&result.direction)?.trim_matches('"'),
                result.added as i64,
                result.updated as i64,
                result.deleted as i64,
                result.total as i64,
                result.conflicts as i64,
                serde_json::to_string(&result.errors)?,
                serde_json::to_string(&result.warnings)?,
                result.started_at,
                result.finished_at,
                result.duration_ms,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncDirection;
    use crate::models::outcome::RunReport;
    use crate::models::state::RecordState;

    fn config(id: &str) -> SyncConfig {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{id}",
                "user_id": "u1",
                "airtable_base_id": "appX",
                "airtable_table_id": "tblX",
                "spreadsheet_id": "ssX",
                "sheet": "Sheet1",
                "direction": "airtable_to_sheets"
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_config_round_trip() {
        let db = SyncDb::open_in_memory().unwrap();
        db.upsert_config(&config("cfg1"), true).unwrap();
        db.upsert_config(&config("cfg2"), false).unwrap();

        let loaded = ConfigStore::get(&db, "cfg1").unwrap().unwrap();
        assert_eq!(loaded.airtable_base_id, "appX");
        assert!(ConfigStore::get(&db, "missing").unwrap().is_none());

        let enabled = db.list_enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "cfg1");

        db.set_enabled("cfg2", true).unwrap();
        assert_eq!(db.list_enabled().unwrap().len(), 2);
    }

    #[test]
    fn test_state_round_trip_and_clear() {
        let db = SyncDb::open_in_memory().unwrap();
        db.upsert_config(&config("cfg1"), true).unwrap();

        let mut state = SyncState::new("cfg1");
        state.upsert(RecordState {
            record_id: "recA".into(),
            content_hash: "h1".into(),
            sheet_hash: None,
            airtable_modified_time: None,
            sheets_modified_time: None,
            captured_at: "2026-01-01T00:00:00Z".into(),
        });
        StateStore::put(&db, "cfg1", &state).unwrap();

        let loaded = StateStore::get(&db, "cfg1").unwrap().unwrap();
        assert_eq!(loaded.records.len(), 1);

        StateStore::clear(&db, "cfg1").unwrap();
        assert!(StateStore::get(&db, "cfg1").unwrap().is_none());
    }

    #[test]
    fn test_log_write_and_list() {
        let db = SyncDb::open_in_memory().unwrap();
        db.upsert_config(&config("cfg1"), true).unwrap();

        let mut report = RunReport::new("cfg1", SyncDirection::Bidirectional);
        report.added = 3;
        report.warn("one orphan row");
        LogSink::write(&db, &report.finish()).unwrap();

        let logs = db.list_logs("cfg1", 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["added"], 3);
        assert_eq!(logs[0]["direction"], "bidirectional");
    }

    #[test]
    fn test_delete_config_cascades() {
        let db = SyncDb::open_in_memory().unwrap();
        db.upsert_config(&config("cfg1"), true).unwrap();
        StateStore::put(&db, "cfg1", &SyncState::new("cfg1")).unwrap();
        assert!(db.delete_config("cfg1").unwrap());
        assert!(StateStore::get(&db, "cfg1").unwrap().is_none());
        assert!(ConfigStore::get(&db, "cfg1").unwrap().is_none());
    }
}
