use crate::audit;
use crate::auth::{self, Role, Session, ADM};
use crate::db;
use crate::error::{db_insert, db_query, db_update, AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{db_conn, new_id, now_ts, require, session, Params};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use log::info;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use std::path::PathBuf;

fn health(state: &AppState) -> AppResult<Value> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "sessionOpen": state.session.is_some(),
    }))
}

fn workspace_select(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let path = PathBuf::from(Params::of(params).req_str("path")?);
    let conn = db::open_db(&path).map_err(|e| AppError::Db {
        code: "db_open_failed",
        message: format!("{e:#}"),
    })?;
    std::fs::create_dir_all(path.join("media"))?;

    let users: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(db_query)?;

    // A different database means a different user table.
    state.session = None;
    state.db = Some(conn);
    state.workspace = Some(path.clone());
    info!("event=workspace_select module=core status=ok");

    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "needsBootstrap": users == 0,
    }))
}

fn role_id(conn: &rusqlite::Connection, role: Role) -> AppResult<i64> {
    conn.query_row("SELECT id FROM roles WHERE name = ?", [role.as_str()], |r| {
        r.get(0)
    })
    .map_err(db_query)
}

fn auth_bootstrap(state: &AppState, params: &Value) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let username = p.req_str("username")?;
    let password = p.req_str("password")?;
    auth::validate_password(&password).map_err(|m| AppError::field("password", m))?;

    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(db_query)?;
    if existing > 0 {
        return Err(AppError::Conflict(
            "users already exist; log in as an administrator".to_string(),
        ));
    }

    let hash = auth::hash_password(&password).map_err(AppError::Internal)?;
    let id = new_id();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, first_name, last_name, email, role_id, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &username,
            &hash,
            p.opt_str("firstName")?.unwrap_or_else(|| "Administrador".to_string()),
            p.opt_str("lastName")?.unwrap_or_default(),
            p.opt_str("email")?,
            role_id(conn, Role::Admin)?,
            now_ts(),
        ),
    )
    .map_err(db_insert)?;
    info!("event=auth_bootstrap module=core status=ok");

    Ok(json!({ "id": id, "username": username, "role": Role::Admin.as_str() }))
}

fn auth_login(state: &mut AppState, params: &Value) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let username = p.req_str("username")?;
    let password = p.req_str("password")?;

    let row = conn
        .query_row(
            "SELECT u.id, u.password_hash, u.is_active, r.name, u.first_name, u.last_name
             FROM users u JOIN roles r ON r.id = u.role_id
             WHERE u.username = ?",
            [&username],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)? != 0,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(db_query)?;

    let Some((user_id, hash, active, role_name, first_name, last_name)) = row else {
        return Err(AppError::Unauthenticated);
    };
    if !auth::verify_password(&password, &hash) {
        info!("event=auth_login module=core status=denied");
        return Err(AppError::Unauthenticated);
    }
    if !active {
        return Err(AppError::Forbidden("account is disabled".to_string()));
    }
    let role = Role::parse(&role_name)
        .ok_or_else(|| AppError::Internal(format!("unknown role {}", role_name)))?;

    let now = Utc::now();
    conn.execute(
        "UPDATE users SET last_login_at = ? WHERE id = ?",
        (now.to_rfc3339(), &user_id),
    )
    .map_err(db_update)?;
    audit::record_access(conn, Some(&user_id), &username, audit::ACCESS_LOGIN);
    info!("event=auth_login module=core status=ok role={}", role.as_str());

    let result = json!({
        "user": {
            "id": user_id,
            "username": username,
            "firstName": first_name,
            "lastName": last_name,
        },
        "role": role.as_str(),
        "home": role.home(),
    });
    state.session = Some(Session::new(user_id, username, role, now));
    Ok(result)
}

fn auth_logout(state: &mut AppState) -> AppResult<Value> {
    let s = session(state)?.clone();
    if let Some(conn) = state.db.as_ref() {
        audit::record_access(conn, Some(&s.user_id), &s.username, audit::ACCESS_LOGOUT);
    }
    state.session = None;
    Ok(json!({ "loggedOut": true }))
}

fn auth_whoami(state: &AppState) -> AppResult<Value> {
    let s = session(state)?;
    Ok(json!({
        "userId": s.user_id,
        "username": s.username,
        "role": s.role.as_str(),
        "home": s.role.home(),
        "openedAt": s.opened_at.to_rfc3339(),
        "lastSeen": s.last_seen.to_rfc3339(),
    }))
}

fn access_logs_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, ADM)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let limit = p.limit(100, 1000)?;
    let username = p.opt_str("username")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, user_id, username, action, at FROM access_logs
             WHERE (?1 IS NULL OR username = ?1)
             ORDER BY id DESC LIMIT ?2",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map((username, limit), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "userId": r.get::<_, Option<String>>(1)?,
                "username": r.get::<_, String>(2)?,
                "action": r.get::<_, String>(3)?,
                "at": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "logs": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "health" => health(state),
        "workspace.select" => workspace_select(state, &req.params),
        "auth.bootstrap" => auth_bootstrap(state, &req.params),
        "auth.login" => auth_login(state, &req.params),
        "auth.logout" => auth_logout(state),
        "auth.whoami" => auth_whoami(state),
        "accessLogs.list" => access_logs_list(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
