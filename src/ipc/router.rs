use chrono::Utc;
use log::{debug, warn};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use super::handlers;
use super::types::{AppState, Request};
use crate::audit;
use crate::config;
use crate::error::{is_internal_code, AppError};
use crate::ipc::error::err;
use crate::logging;

/// Methods callable without a session.
const PUBLIC_METHODS: [&str; 4] = ["health", "workspace.select", "auth.bootstrap", "auth.login"];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let started = Instant::now();

    if !PUBLIC_METHODS.contains(&req.method.as_str()) {
        if let Err(e) = gate_session(state) {
            return e.response(&req.id);
        }
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(state, &req)));
    let resp = match outcome {
        Ok(resp) => resp,
        Err(_) => {
            let trace = logging::take_last_panic();
            let message = format!("internal failure while handling {}", req.method);
            record_failure(state, &req.method, &message, trace.as_deref());
            return err(&req.id, "internal", message, None);
        }
    };

    let ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if ok {
        if audit::is_mutating(&req.method) {
            if let Some(conn) = state.db.as_ref() {
                let result = resp.get("result").cloned().unwrap_or_default();
                audit::record_activity(
                    conn,
                    state.session.as_ref().map(|s| s.username.as_str()),
                    audit::module_of(&req.method),
                    &req.method,
                    &audit::describe(&req.method, &result),
                );
            }
        }
    } else {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if is_internal_code(code) {
            let message = resp
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let details = resp.pointer("/error/details").map(|d| d.to_string());
            record_failure(state, &req.method, &message, details.as_deref());
        }
    }

    debug!(
        "event=request module=ipc status={} method={} duration_ms={}",
        if ok { "ok" } else { "error" },
        req.method,
        started.elapsed().as_millis()
    );
    resp
}

/// Enforces the idle timeout and refreshes the activity clock.
fn gate_session(state: &mut AppState) -> Result<(), AppError> {
    let now = Utc::now();
    let idle = match state.db.as_ref() {
        Some(conn) => config::session_idle_minutes(conn).unwrap_or(45),
        None => 45,
    };
    let Some(session) = state.session.as_mut() else {
        return Err(AppError::Unauthenticated);
    };
    if session.is_expired(now, idle) {
        let expired = session.clone();
        state.session = None;
        if let Some(conn) = state.db.as_ref() {
            audit::record_access(
                conn,
                Some(&expired.user_id),
                &expired.username,
                audit::ACCESS_TIMEOUT,
            );
        }
        warn!("event=session_timeout module=ipc status=expired idle_minutes={}", idle);
        return Err(AppError::SessionExpired { idle_minutes: idle });
    }
    session.touch(now);
    Ok(())
}

fn record_failure(state: &AppState, method: &str, message: &str, trace: Option<&str>) {
    warn!(
        "event=request_failed module=ipc status=error method={}",
        method
    );
    if let Some(conn) = state.db.as_ref() {
        audit::record_error(
            conn,
            state.session.as_ref().map(|s| s.username.as_str()),
            method,
            message,
            trace,
        );
    }
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::accounts::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::secretaria::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::pedagogico::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::administrativo::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::operations::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::dashboard::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
