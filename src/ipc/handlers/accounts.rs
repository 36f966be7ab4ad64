use crate::auth::{self, Role, DIR};
use crate::error::{db_commit, db_delete, db_insert, db_query, db_tx, db_update, AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{db_conn, new_id, now_ts, require, Params};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

struct UserRow {
    id: String,
    username: String,
    first_name: String,
    last_name: String,
    email: Option<String>,
    phone: Option<String>,
    role: String,
    is_active: bool,
    created_at: String,
    last_login_at: Option<String>,
}

impl UserRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "email": self.email,
            "phone": self.phone,
            "role": self.role,
            "isActive": self.is_active,
            "createdAt": self.created_at,
            "lastLoginAt": self.last_login_at,
        })
    }
}

const USER_SELECT: &str = "SELECT u.id, u.username, u.first_name, u.last_name, u.email, u.phone,
        r.name, u.is_active, u.created_at, u.last_login_at
     FROM users u JOIN roles r ON r.id = u.role_id";

fn map_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: r.get(0)?,
        username: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
        email: r.get(4)?,
        phone: r.get(5)?,
        role: r.get(6)?,
        is_active: r.get::<_, i64>(7)? != 0,
        created_at: r.get(8)?,
        last_login_at: r.get(9)?,
    })
}

fn load_user(conn: &Connection, user_id: &str) -> AppResult<UserRow> {
    conn.query_row(&format!("{} WHERE u.id = ?", USER_SELECT), [user_id], map_user)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("user not found".to_string()))
}

fn parse_role(p: &Params<'_>, key: &str) -> AppResult<Option<Role>> {
    match p.opt_str(key)? {
        None => Ok(None),
        Some(s) => Role::parse(&s).map(Some).ok_or_else(|| {
            AppError::field(key, "role must be one of: Admin, Diretor, Secretaria, Pedagogico")
        }),
    }
}

fn role_id(conn: &Connection, role: Role) -> AppResult<i64> {
    conn.query_row("SELECT id FROM roles WHERE name = ?", [role.as_str()], |r| {
        r.get(0)
    })
    .map_err(db_query)
}

fn active_admins_except(conn: &Connection, except: Option<&str>) -> AppResult<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM users u JOIN roles r ON r.id = u.role_id
         WHERE r.name = 'Admin' AND u.is_active = 1 AND (?1 IS NULL OR u.id <> ?1)",
        [except],
        |r| r.get(0),
    )
    .map_err(db_query)
}

fn validate_email(p: &Params<'_>, key: &str, current: Option<String>) -> AppResult<Option<String>> {
    let email = p.text_or(key, current)?;
    if let Some(e) = email.as_deref() {
        if !e.contains('@') || e.starts_with('@') || e.ends_with('@') {
            return Err(AppError::field(key, "email is not a valid address"));
        }
    }
    Ok(email)
}

fn roles_list(state: &AppState) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare("SELECT id, name FROM roles ORDER BY id")
        .map_err(db_query)?;
    let roles = stmt
        .query_map([], |r| {
            Ok(json!({ "id": r.get::<_, i64>(0)?, "name": r.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "roles": roles }))
}

fn users_list(state: &AppState) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY u.username", USER_SELECT))
        .map_err(db_query)?;
    let users = stmt
        .query_map([], map_user)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "users": users.iter().map(UserRow::to_json).collect::<Vec<_>>() }))
}

fn users_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);

    let username = p.req_str("username")?;
    if username.chars().count() > 150 || username.contains(char::is_whitespace) {
        return Err(AppError::field(
            "username",
            "username must be at most 150 characters without spaces",
        ));
    }
    let password = p.req_str("password")?;
    auth::validate_password(&password).map_err(|m| AppError::field("password", m))?;
    let first_name = p.req_str("firstName")?;
    let last_name = p.req_str("lastName")?;
    let email = validate_email(&p, "email", None)?;
    let phone = p.opt_str("phone")?;
    let role = parse_role(&p, "role")?
        .ok_or_else(|| AppError::BadParams("missing role".to_string()))?;
    let is_active = p.bool_or("isActive", true)?;

    let hash = auth::hash_password(&password).map_err(AppError::Internal)?;
    let id = new_id();

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    if role == Role::Admin && is_active && active_admins_except(&tx, None)? > 0 {
        return Err(AppError::Conflict(
            "there is already an active Admin user".to_string(),
        ));
    }
    tx.execute(
        "INSERT INTO users(id, username, password_hash, first_name, last_name, email, phone, role_id, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &username,
            &hash,
            &first_name,
            &last_name,
            &email,
            &phone,
            role_id(&tx, role)?,
            is_active as i64,
            now_ts(),
        ),
    )
    .map_err(db_insert)?;
    tx.commit().map_err(db_commit)?;

    Ok(load_user(conn, &id)?.to_json())
}

fn users_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let user_id = p.req_str("userId")?;
    let patch = p.object("patch")?;
    if patch.has("username") {
        return Err(AppError::field("username", "username cannot be changed"));
    }
    if patch.has("password") {
        return Err(AppError::field("password", "use users.setPassword"));
    }

    let current = load_user(conn, &user_id)?;
    let first_name = patch.str_or("firstName", current.first_name)?;
    let last_name = patch.str_or("lastName", current.last_name)?;
    let email = validate_email(&patch, "email", current.email)?;
    let phone = patch.text_or("phone", current.phone)?;
    let role = match parse_role(&patch, "role")? {
        Some(r) => r,
        None => Role::parse(&current.role)
            .ok_or_else(|| AppError::Internal(format!("unknown role {}", current.role)))?,
    };
    let is_active = patch.bool_or("isActive", current.is_active)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    if role == Role::Admin && is_active && active_admins_except(&tx, Some(&user_id))? > 0 {
        return Err(AppError::Conflict(
            "there is already an active Admin user".to_string(),
        ));
    }
    tx.execute(
        "UPDATE users SET first_name = ?, last_name = ?, email = ?, phone = ?, role_id = ?, is_active = ?
         WHERE id = ?",
        (
            &first_name,
            &last_name,
            &email,
            &phone,
            role_id(&tx, role)?,
            is_active as i64,
            &user_id,
        ),
    )
    .map_err(db_update)?;
    tx.commit().map_err(db_commit)?;

    Ok(load_user(conn, &user_id)?.to_json())
}

fn users_set_password(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let user_id = p.req_str("userId")?;
    let password = p.req_str("password")?;
    auth::validate_password(&password).map_err(|m| AppError::field("password", m))?;
    load_user(conn, &user_id)?;

    let hash = auth::hash_password(&password).map_err(AppError::Internal)?;
    conn.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (&hash, &user_id),
    )
    .map_err(db_update)?;
    Ok(json!({ "id": user_id, "passwordChanged": true }))
}

fn users_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    let me = require(state, DIR)?;
    let conn = db_conn(state)?;
    let user_id = Params::of(params).req_str("userId")?;
    if user_id == me.user_id {
        return Err(AppError::Forbidden(
            "you cannot delete your own account".to_string(),
        ));
    }
    let target = load_user(conn, &user_id)?;
    if target.role == Role::Admin.as_str() && active_admins_except(conn, None)? < 2 {
        return Err(AppError::Conflict(
            "deleting an Admin user requires at least 2 active Admins".to_string(),
        ));
    }

    conn.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(db_delete)?;
    Ok(json!({ "id": user_id, "username": target.username, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "roles.list" => roles_list(state),
        "users.list" => users_list(state),
        "users.create" => users_create(state, &req.params),
        "users.update" => users_update(state, &req.params),
        "users.setPassword" => users_set_password(state, &req.params),
        "users.delete" => users_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
