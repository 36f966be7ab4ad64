use crate::auth::Role;
use crate::billing;
use crate::error::{db_query, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{count, db_conn, session, today};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const RECENT_ACTIVITIES: i64 = 10;

fn counters(conn: &Connection, role: Role) -> AppResult<Map<String, Value>> {
    let queries: &[(&str, &str)] = match role {
        Role::Admin => &[
            ("students", "SELECT COUNT(*) FROM students"),
            (
                "pendingInvoices",
                "SELECT COUNT(*) FROM invoices WHERE status IN ('PENDENTE', 'VENCIDO')",
            ),
            ("activeStaff", "SELECT COUNT(*) FROM staff WHERE status = 'ATIVO'"),
        ],
        Role::Diretor => &[
            ("activeStaff", "SELECT COUNT(*) FROM staff WHERE status = 'ATIVO'"),
            (
                "payslipsWithoutNet",
                "SELECT COUNT(*) FROM payslips WHERE net IS NULL",
            ),
        ],
        Role::Pedagogico => &[
            ("classes", "SELECT COUNT(*) FROM classes"),
            (
                "gradesWithoutAverage",
                "SELECT COUNT(*) FROM grades WHERE partial_avg IS NULL",
            ),
        ],
        Role::Secretaria => &[
            (
                "activeStudents",
                "SELECT COUNT(*) FROM students WHERE status = 'ATIVO'",
            ),
            (
                "overdueInvoices",
                "SELECT COUNT(*) FROM invoices WHERE status = 'VENCIDO'",
            ),
        ],
    };
    let mut out = Map::new();
    for (key, sql) in queries {
        out.insert(key.to_string(), Value::from(count(conn, sql, [])?));
    }
    Ok(out)
}

fn recent_activities(conn: &Connection) -> AppResult<Vec<Value>> {
    let mut stmt = conn
        .prepare(
            "SELECT at, username, module, action, description FROM activities
             ORDER BY id DESC LIMIT ?",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([RECENT_ACTIVITIES], |r| {
            Ok(json!({
                "at": r.get::<_, String>(0)?,
                "username": r.get::<_, Option<String>>(1)?,
                "module": r.get::<_, String>(2)?,
                "action": r.get::<_, String>(3)?,
                "description": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

fn dashboard_get(state: &AppState) -> AppResult<Value> {
    let s = session(state)?;
    let conn = db_conn(state)?;
    // Overdue counters must reflect today's date.
    billing::mark_overdue(conn, today())?;
    Ok(json!({
        "role": s.role.as_str(),
        "home": s.role.home(),
        "counters": counters(conn, s.role)?,
        "recentActivities": recent_activities(conn)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "dashboard.get" => dashboard_get(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
