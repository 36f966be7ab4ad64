use anyhow::{bail, Context};
use log::info;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::{Duration, Instant};

pub const DB_FILE: &str = "escola.sqlite3";

pub const ROLE_NAMES: [&str; 4] = ["Admin", "Diretor", "Secretaria", "Pedagogico"];

struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("migrations/0001_init.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("migrations/0002_exercises_activities.sql"),
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Opens (creating if needed) the workspace database, applies pending
/// migrations and seeds the fixed roles.
pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    let started = Instant::now();
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("create workspace dir {}", workspace.display()))?;
    let db_path = workspace.join(DB_FILE);
    let mut conn =
        Connection::open(&db_path).with_context(|| format!("open {}", db_path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    register_functions(&conn)?;

    apply_migrations(&mut conn)?;
    seed_roles(&conn)?;

    info!(
        "event=db_open module=db status=ok schema_version={} duration_ms={}",
        latest_version(),
        started.elapsed().as_millis()
    );
    Ok(conn)
}

pub fn apply_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    let current: u32 = conn.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
    let latest = latest_version();
    if current > latest {
        bail!(
            "database schema version {} is newer than supported version {}",
            current,
            latest
        );
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for m in MIGRATIONS.iter().filter(|m| m.version > current) {
        tx.execute_batch(m.sql)
            .with_context(|| format!("apply migration {}", m.version))?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", m.version))?;
    }
    tx.commit()?;
    info!(
        "event=db_migrate module=db status=ok from={} to={}",
        current, latest
    );
    Ok(())
}

/// `casefold(text)`: Unicode lowercase. SQLite's own `lower()` and `LIKE`
/// only fold ASCII, so name searches go through this.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "casefold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )
}

fn seed_roles(conn: &Connection) -> anyhow::Result<()> {
    for name in ROLE_NAMES {
        conn.execute("INSERT OR IGNORE INTO roles(name) VALUES(?)", [name])?;
    }
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_and_seed_roles() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        drop(conn);
        let conn = open_db(dir.path()).unwrap();

        let version: u32 = conn
            .query_row("PRAGMA user_version;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, latest_version());
        let roles: i64 = conn
            .query_row("SELECT COUNT(*) FROM roles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(roles, 4);
    }

    #[test]
    fn casefold_matches_accented_names() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        let hit: bool = conn
            .query_row("SELECT casefold('Ângela Silva') LIKE ?", ["%ângela%"], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(hit);
        let null: Option<String> = conn
            .query_row("SELECT casefold(NULL)", [], |r| r.get(0))
            .unwrap();
        assert!(null.is_none());
    }

    #[test]
    fn only_one_academic_year_can_be_active() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        conn.execute(
            "INSERT INTO academic_years(id, name, start_date, end_date, active)
             VALUES('a', '2024/2025', '2024-09-01', '2025-07-31', 1)",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO academic_years(id, name, start_date, end_date, active)
             VALUES('b', '2025/2026', '2025-09-01', '2026-07-31', 1)",
            [],
        );
        assert!(second.is_err());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        drop(open_db(dir.path()).unwrap());
        {
            let conn = Connection::open(dir.path().join(DB_FILE)).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }
        assert!(open_db(dir.path()).is_err());
    }

    #[test]
    fn settings_roundtrip_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        assert!(settings_get_json(&conn, "smtp").unwrap().is_none());
        settings_set_json(&conn, "smtp", &serde_json::json!({"port": 25})).unwrap();
        settings_set_json(&conn, "smtp", &serde_json::json!({"port": 587})).unwrap();
        let v = settings_get_json(&conn, "smtp").unwrap().unwrap();
        assert_eq!(v["port"], 587);
    }
}
