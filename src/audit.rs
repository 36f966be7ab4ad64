//! Append-only bookkeeping tables: access log, error log, activity feed.
//!
//! Writers here are best-effort: a failure is logged and swallowed so that
//! bookkeeping never turns a successful request into a failed one.

use chrono::Utc;
use log::warn;
use rusqlite::Connection;

use crate::logging::sanitize_message;

pub const ACCESS_LOGIN: &str = "LOGIN";
pub const ACCESS_LOGOUT: &str = "LOGOUT";
pub const ACCESS_TIMEOUT: &str = "TIMEOUT";

const MAX_TRACE_CHARS: usize = 4000;

pub fn record_access(conn: &Connection, user_id: Option<&str>, username: &str, action: &str) {
    if let Err(e) = conn.execute(
        "INSERT INTO access_logs(user_id, username, action, at) VALUES(?, ?, ?, ?)",
        (user_id, username, action, Utc::now().to_rfc3339()),
    ) {
        warn!(
            "event=access_log_write module=audit status=error action={} error={}",
            action, e
        );
    }
}

pub fn record_activity(
    conn: &Connection,
    username: Option<&str>,
    module: &str,
    action: &str,
    description: &str,
) {
    if let Err(e) = conn.execute(
        "INSERT INTO activities(at, username, module, action, description) VALUES(?, ?, ?, ?, ?)",
        (
            Utc::now().to_rfc3339(),
            username,
            module,
            action,
            sanitize_message(description, 300),
        ),
    ) {
        warn!(
            "event=activity_write module=audit status=error action={} error={}",
            action, e
        );
    }
}

pub fn record_error(
    conn: &Connection,
    username: Option<&str>,
    method: &str,
    message: &str,
    trace: Option<&str>,
) {
    let trace = trace.map(|t| {
        if t.chars().count() <= MAX_TRACE_CHARS {
            return t.to_string();
        }
        let mut cut: String = t.chars().take(MAX_TRACE_CHARS).collect();
        cut.push_str("...");
        cut
    });
    if let Err(e) = conn.execute(
        "INSERT INTO error_logs(at, username, method, message, trace) VALUES(?, ?, ?, ?, ?)",
        (
            Utc::now().to_rfc3339(),
            username,
            method,
            sanitize_message(message, 500),
            trace,
        ),
    ) {
        warn!(
            "event=error_log_write module=audit status=error method={} error={}",
            method, e
        );
    }
}

/// Domain label for a method name, used by the activity feed.
pub fn module_of(method: &str) -> &'static str {
    let family = method.split('.').next().unwrap_or("");
    match family {
        "auth" | "users" | "roles" | "accessLogs" => "accounts",
        "guardians" | "students" | "services" | "invoices" | "receipts" | "balances"
        | "preEnrollments" => "secretaria",
        "years" | "classes" | "subjects" | "classSubjects" | "enrollments" | "grades"
        | "reportCards" | "calendar" => "pedagogico",
        "staff" | "payroll" | "assets" | "ledgerAccounts" | "ledger" => "administrativo",
        "reports" => match method {
            "reports.year" => "pedagogico",
            "reports.payroll" => "administrativo",
            _ => "secretaria",
        },
        _ => "core",
    }
}

const MUTATING_ACTIONS: [&str; 13] = [
    "create",
    "update",
    "delete",
    "setPassword",
    "approve",
    "reject",
    "generate",
    "depreciate",
    "recompute",
    "run",
    "restore",
    "switch",
    "notifyOverdue",
];

pub fn is_mutating(method: &str) -> bool {
    method
        .rsplit('.')
        .next()
        .map(|action| MUTATING_ACTIONS.contains(&action))
        .unwrap_or(false)
        && method != "auth.bootstrap"
}

/// Short human description built from the method and the fields of its
/// result that identify the affected record.
pub fn describe(method: &str, result: &serde_json::Value) -> String {
    let label = ["number", "enrollmentNo", "username", "name", "code", "description", "id"]
        .iter()
        .find_map(|k| result.get(*k).and_then(|v| v.as_str()));
    match label {
        Some(l) => format!("{} {}", method, l),
        None => method.to_string(),
    }
}
