use serde_json::Value;
use thiserror::Error;

use crate::ipc::error::err;

/// Failure of a request, carrying the stable wire code the UI switches on.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadParams(String),
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("not logged in")]
    Unauthenticated,
    #[error("session expired after {idle_minutes} idle minutes")]
    SessionExpired { idle_minutes: i64 },
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{message}")]
    Db { code: &'static str, message: String },
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

const INTERNAL_CODES: [&str; 9] = [
    "db_query_failed",
    "db_insert_failed",
    "db_update_failed",
    "db_delete_failed",
    "db_tx_failed",
    "db_commit_failed",
    "db_open_failed",
    "io_failed",
    "internal",
];

/// Wire codes for failures the caller cannot fix; these go to the error log.
pub fn is_internal_code(code: &str) -> bool {
    INTERNAL_CODES.contains(&code)
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn field(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            details: Some(serde_json::json!({ "field": field })),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadParams(_) => "bad_params",
            AppError::Validation { .. } => "validation_failed",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Forbidden(_) => "forbidden",
            AppError::Unauthenticated => "unauthenticated",
            AppError::SessionExpired { .. } => "session_expired",
            AppError::NoWorkspace => "no_workspace",
            AppError::Db { code, .. } => code,
            AppError::Io(_) => "io_failed",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::Validation { details, .. } => details.clone(),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> Value {
        err(id, self.code(), self.to_string(), self.details())
    }

    fn from_db(code: &'static str, e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(f, msg) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                return AppError::Conflict(
                    msg.clone()
                        .unwrap_or_else(|| "constraint violation".to_string()),
                );
            }
        }
        AppError::Db {
            code,
            message: e.to_string(),
        }
    }
}

pub fn db_query(e: rusqlite::Error) -> AppError {
    AppError::from_db("db_query_failed", e)
}

pub fn db_insert(e: rusqlite::Error) -> AppError {
    AppError::from_db("db_insert_failed", e)
}

pub fn db_update(e: rusqlite::Error) -> AppError {
    AppError::from_db("db_update_failed", e)
}

pub fn db_delete(e: rusqlite::Error) -> AppError {
    AppError::from_db("db_delete_failed", e)
}

pub fn db_tx(e: rusqlite::Error) -> AppError {
    AppError::from_db("db_tx_failed", e)
}

pub fn db_commit(e: rusqlite::Error) -> AppError {
    AppError::from_db("db_commit_failed", e)
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        db_query(e)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violations_become_conflicts() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(name TEXT UNIQUE); INSERT INTO t VALUES('a');")
            .unwrap();
        let e = conn
            .execute("INSERT INTO t VALUES('a')", [])
            .map_err(db_insert)
            .unwrap_err();
        assert_eq!(e.code(), "conflict");
        assert!(!is_internal_code(e.code()));
    }

    #[test]
    fn other_db_errors_keep_their_code() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let e = conn
            .execute("DELETE FROM missing_table", [])
            .map_err(db_delete)
            .unwrap_err();
        assert_eq!(e.code(), "db_delete_failed");
        assert!(is_internal_code(e.code()));
        assert!(is_internal_code("io_failed"));
    }

    #[test]
    fn validation_carries_field_details() {
        let e = AppError::field("dueDate", "dueDate must not precede issueDate");
        let resp = e.response("7");
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "validation_failed");
        assert_eq!(resp["error"]["details"]["field"], "dueDate");
    }
}
