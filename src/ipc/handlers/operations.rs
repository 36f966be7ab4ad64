use crate::auth::{ADM, SEC};
use crate::backup;
use crate::config::{self, Section, ALL_SECTIONS};
use crate::db;
use crate::error::{db_query, AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{db_conn, require, today, workspace, Params};
use crate::ipc::types::{AppState, Request};
use crate::ops;
use log::info;
use rusqlite::OptionalExtension;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

fn section_param(p: &Params<'_>, key: &str) -> AppResult<Section> {
    let raw = p.req_str(key)?;
    Section::parse(&raw).ok_or_else(|| AppError::field(key, format!("unknown section: {}", raw)))
}

fn config_get(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    if p.has("section") {
        let section = section_param(&p, "section")?;
        let v = config::load_section(conn, section).map_err(db_query)?;
        return Ok(json!({ "section": section.name(), "values": config::mask_secrets(v) }));
    }
    let mut all = Map::new();
    for section in ALL_SECTIONS {
        let v = config::load_section(conn, section).map_err(db_query)?;
        all.insert(section.name().to_string(), config::mask_secrets(v));
    }
    Ok(json!({ "sections": all }))
}

fn config_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let section = section_param(&p, "section")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| AppError::BadParams("missing patch object".to_string()))?;

    let merged = config::update_section(conn, section, patch)
        .map_err(db_query)?
        .map_err(AppError::validation)?;
    info!(
        "event=config_update module=operations status=ok section={}",
        section.name()
    );
    Ok(json!({ "section": section.name(), "values": config::mask_secrets(merged) }))
}

fn backup_run(state: &AppState) -> AppResult<Value> {
    let user = require(state, ADM)?.username.clone();
    let conn = db_conn(state)?;
    let ws = workspace(state)?;
    let outcome = ops::run_backup(conn, ws, Some(&user))?;
    if !outcome.succeeded {
        return Err(AppError::Io(format!("backup failed: {}", outcome.details)));
    }
    Ok(outcome.to_json())
}

fn backup_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let limit = Params::of(params).limit(50, 500)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, executed_at, status, file_path, details, executed_by
             FROM backup_logs ORDER BY id DESC LIMIT ?",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "executedAt": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "filePath": r.get::<_, Option<String>>(3)?,
                "details": r.get::<_, Option<String>>(4)?,
                "executedBy": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "backups": rows }))
}

/// Replaces the workspace database. The connection is closed for the swap and
/// reopened (and migrated) afterwards; the session ends because the user
/// table changed underneath it.
fn backup_restore(state: &mut AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let ws = workspace(state)?.to_path_buf();
    let in_path = PathBuf::from(Params::of(params).req_str("inPath")?);
    if !in_path.is_file() {
        return Err(AppError::NotFound(format!(
            "backup file not found: {}",
            in_path.display()
        )));
    }

    state.db = None;
    let imported = backup::import_bundle(&in_path, &ws);
    let conn = db::open_db(&ws).map_err(|e| AppError::Db {
        code: "db_open_failed",
        message: format!("{e:#}"),
    })?;
    state.db = Some(conn);
    let imported = imported.map_err(|e| AppError::field("inPath", format!("{e:#}")))?;

    state.session = None;
    info!(
        "event=backup_restore module=operations status=ok format={}",
        imported.format_detected
    );
    Ok(json!({
        "formatDetected": imported.format_detected,
        "sha256": imported.sha256,
        "sessionClosed": true,
    }))
}

fn exercise_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "academicYearId": r.get::<_, String>(1)?,
        "academicYearName": r.get::<_, String>(2)?,
        "openedAt": r.get::<_, String>(3)?,
        "closedAt": r.get::<_, Option<String>>(4)?,
        "backupPath": r.get::<_, Option<String>>(5)?,
    }))
}

const EXERCISE_SELECT: &str =
    "SELECT e.id, e.academic_year_id, y.name, e.opened_at, e.closed_at, e.backup_path
     FROM exercises e JOIN academic_years y ON y.id = e.academic_year_id";

fn exercise_current(state: &AppState) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let current = conn
        .query_row(
            &format!("{} WHERE e.closed_at IS NULL", EXERCISE_SELECT),
            [],
            exercise_json,
        )
        .optional()
        .map_err(db_query)?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE e.closed_at IS NOT NULL ORDER BY e.closed_at DESC LIMIT 20",
            EXERCISE_SELECT
        ))
        .map_err(db_query)?;
    let history = stmt
        .query_map([], exercise_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "current": current, "history": history }))
}

fn exercise_switch(state: &AppState, params: &Value) -> AppResult<Value> {
    let user = require(state, ADM)?.username.clone();
    let conn = db_conn(state)?;
    let ws = workspace(state)?;
    let year_id = Params::of(params).req_str("yearId")?;
    let switched = ops::switch_exercise(conn, ws, &year_id, Some(&user))?;
    Ok(switched.to_json())
}

fn error_logs_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let limit = p.limit(100, 1000)?;
    let method = p.opt_str("method")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, at, username, method, message, trace FROM error_logs
             WHERE (?1 IS NULL OR method = ?1)
             ORDER BY id DESC LIMIT ?2",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map((method, limit), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "at": r.get::<_, String>(1)?,
                "username": r.get::<_, Option<String>>(2)?,
                "method": r.get::<_, String>(3)?,
                "message": r.get::<_, String>(4)?,
                "trace": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "logs": rows }))
}

fn notifications_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let limit = p.limit(100, 1000)?;
    let channel = p.opt_choice("channel", &["EMAIL", "WHATSAPP"])?;
    let status = p.opt_choice("status", &["SUCCESS", "FAILURE"])?;
    let mut stmt = conn
        .prepare(
            "SELECT id, at, channel, recipient, subject, status, details, guardian_id
             FROM notification_logs
             WHERE (?1 IS NULL OR channel = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY id DESC LIMIT ?3",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map((channel, status, limit), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "at": r.get::<_, String>(1)?,
                "channel": r.get::<_, String>(2)?,
                "recipient": r.get::<_, String>(3)?,
                "subject": r.get::<_, Option<String>>(4)?,
                "status": r.get::<_, String>(5)?,
                "details": r.get::<_, Option<String>>(6)?,
                "guardianId": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "notifications": rows }))
}

fn notify_overdue(state: &AppState) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    Ok(ops::notify_overdue(conn, today())?.to_json())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "config.get" => config_get(state, &req.params),
        "config.update" => config_update(state, &req.params),
        "backup.run" => backup_run(state),
        "backup.list" => backup_list(state, &req.params),
        "backup.restore" => backup_restore(state, &req.params),
        "exercise.current" => exercise_current(state),
        "exercise.switch" => exercise_switch(state, &req.params),
        "errorLogs.list" => error_logs_list(state, &req.params),
        "notifications.list" => notifications_list(state, &req.params),
        "notifications.notifyOverdue" => notify_overdue(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
