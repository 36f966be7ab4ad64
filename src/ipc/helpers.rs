use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::auth::{Role, Session};
use crate::calc;
use crate::error::{db_query, AppError, AppResult};
use crate::ipc::types::AppState;

pub fn db_conn(state: &AppState) -> AppResult<&Connection> {
    state.db.as_ref().ok_or(AppError::NoWorkspace)
}

pub fn workspace(state: &AppState) -> AppResult<&Path> {
    state.workspace.as_deref().ok_or(AppError::NoWorkspace)
}

pub fn session(state: &AppState) -> AppResult<&Session> {
    state.session.as_ref().ok_or(AppError::Unauthenticated)
}

/// Session of a caller whose role is in `allowed`.
pub fn require<'a>(state: &'a AppState, allowed: &[Role]) -> AppResult<&'a Session> {
    let s = session(state)?;
    if !s.has_any(allowed) {
        return Err(AppError::Forbidden(format!(
            "role {} may not perform this operation",
            s.role.as_str()
        )));
    }
    Ok(s)
}

/// LIKE pattern for a case-insensitive substring search; pair it with
/// `casefold(column) LIKE ? ESCAPE '\'`.
pub fn search_pattern(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('%');
    for c in raw.trim().to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn money(d: Decimal) -> Value {
    Value::String(calc::round2(d).to_string())
}

pub fn parse_date(raw: &str, key: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::field(key, format!("{} must be a date (YYYY-MM-DD)", key)))
}

/// Reads a decimal stored as text.
pub fn dec_col(r: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = r.get(idx)?;
    calc::parse_decimal(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

pub fn opt_dec_col(r: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = r.get(idx)?;
    match s {
        None => Ok(None),
        Some(_) => dec_col(r, idx).map(Some),
    }
}

pub fn date_col(r: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = r.get(idx)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> AppResult<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_query)
}

pub fn ensure_exists(conn: &Connection, table: &str, id: &str, what: &str) -> AppResult<()> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("{} not found", what)))
    }
}

pub fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> AppResult<i64> {
    conn.query_row(sql, params, |r| r.get(0)).map_err(db_query)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// `format` param of the report operations; JSON unless "csv" is asked for.
pub fn export_format(p: &Params<'_>) -> AppResult<ExportFormat> {
    match p.opt_choice("format", &["json", "csv"])?.as_deref() {
        Some("csv") => Ok(ExportFormat::Csv),
        _ => Ok(ExportFormat::Json),
    }
}

/// `outPath` when given, otherwise `media/<subdir>/<stem>_<timestamp>.csv`.
pub fn export_path(state: &AppState, p: &Params<'_>, subdir: &str, stem: &str) -> AppResult<PathBuf> {
    if let Some(out) = p.opt_str("outPath")? {
        return Ok(PathBuf::from(out));
    }
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    Ok(workspace(state)?
        .join("media")
        .join(subdir)
        .join(format!("{}_{}.csv", stem, stamp)))
}

/// Typed access to request params (or a nested patch object).
#[derive(Clone, Copy)]
pub struct Params<'a> {
    v: &'a Value,
}

impl<'a> Params<'a> {
    pub fn of(v: &'a Value) -> Self {
        Self { v }
    }

    fn raw(&self, key: &str) -> Option<&'a Value> {
        self.v.get(key).filter(|x| !x.is_null())
    }

    pub fn has(&self, key: &str) -> bool {
        self.v.get(key).is_some()
    }

    pub fn object(&self, key: &str) -> AppResult<Params<'a>> {
        match self.v.get(key) {
            Some(o) if o.is_object() => Ok(Params::of(o)),
            _ => Err(AppError::BadParams(format!("missing {}", key))),
        }
    }

    pub fn req_str(&self, key: &str) -> AppResult<String> {
        self.opt_str(key)?
            .ok_or_else(|| AppError::BadParams(format!("missing {}", key)))
    }

    /// Missing, null and blank all read as `None`.
    pub fn opt_str(&self, key: &str) -> AppResult<Option<String>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::String(s)) => {
                let t = s.trim();
                Ok(if t.is_empty() { None } else { Some(t.to_string()) })
            }
            Some(_) => Err(AppError::BadParams(format!("{} must be a string", key))),
        }
    }

    /// Patch semantics for a nullable text column: absent keeps `current`,
    /// null or blank clears it.
    pub fn text_or(&self, key: &str, current: Option<String>) -> AppResult<Option<String>> {
        if !self.has(key) {
            return Ok(current);
        }
        self.opt_str(key)
    }

    pub fn str_or(&self, key: &str, current: String) -> AppResult<String> {
        if !self.has(key) {
            return Ok(current);
        }
        self.req_str(key)
    }

    pub fn opt_decimal(&self, key: &str) -> AppResult<Option<Decimal>> {
        let raw = match self.raw(key) {
            None => return Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(AppError::BadParams(format!("{} must be a decimal", key))),
        };
        calc::parse_decimal(&raw)
            .map(Some)
            .map_err(|e| AppError::field(key, format!("{}: {}", key, e)))
    }

    pub fn req_decimal(&self, key: &str) -> AppResult<Decimal> {
        self.opt_decimal(key)?
            .ok_or_else(|| AppError::BadParams(format!("missing {}", key)))
    }

    pub fn decimal_or(&self, key: &str, current: Decimal) -> AppResult<Decimal> {
        Ok(self.opt_decimal(key)?.unwrap_or(current))
    }

    pub fn opt_date(&self, key: &str) -> AppResult<Option<NaiveDate>> {
        match self.opt_str(key)? {
            None => Ok(None),
            Some(s) => parse_date(&s, key).map(Some),
        }
    }

    pub fn req_date(&self, key: &str) -> AppResult<NaiveDate> {
        self.opt_date(key)?
            .ok_or_else(|| AppError::BadParams(format!("missing {}", key)))
    }

    pub fn date_or(&self, key: &str, current: NaiveDate) -> AppResult<NaiveDate> {
        Ok(self.opt_date(key)?.unwrap_or(current))
    }

    pub fn opt_bool(&self, key: &str) -> AppResult<Option<bool>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(AppError::BadParams(format!("{} must be boolean", key))),
        }
    }

    pub fn bool_or(&self, key: &str, current: bool) -> AppResult<bool> {
        Ok(self.opt_bool(key)?.unwrap_or(current))
    }

    pub fn opt_i64(&self, key: &str) -> AppResult<Option<i64>> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| AppError::BadParams(format!("{} must be an integer", key))),
        }
    }

    pub fn req_i64(&self, key: &str) -> AppResult<i64> {
        self.opt_i64(key)?
            .ok_or_else(|| AppError::BadParams(format!("missing {}", key)))
    }

    /// Text restricted to `allowed`; matched exactly.
    pub fn opt_choice(&self, key: &str, allowed: &[&str]) -> AppResult<Option<String>> {
        match self.opt_str(key)? {
            None => Ok(None),
            Some(s) if allowed.contains(&s.as_str()) => Ok(Some(s)),
            Some(_) => Err(AppError::field(
                key,
                format!("{} must be one of: {}", key, allowed.join(", ")),
            )),
        }
    }

    pub fn req_choice(&self, key: &str, allowed: &[&str]) -> AppResult<String> {
        self.opt_choice(key, allowed)?
            .ok_or_else(|| AppError::BadParams(format!("missing {}", key)))
    }

    pub fn choice_or(&self, key: &str, allowed: &[&str], current: String) -> AppResult<String> {
        Ok(self.opt_choice(key, allowed)?.unwrap_or(current))
    }

    pub fn opt_array(&self, key: &str) -> AppResult<Option<&'a Vec<Value>>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::Array(a)) => Ok(Some(a)),
            Some(_) => Err(AppError::BadParams(format!("{} must be an array", key))),
        }
    }

    pub fn limit(&self, default: i64, max: i64) -> AppResult<i64> {
        let n = self.opt_i64("limit")?.unwrap_or(default);
        if n < 1 || n > max {
            return Err(AppError::BadParams(format!("limit must be in 1..={}", max)));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_pattern_folds_case_and_escapes_wildcards() {
        assert_eq!(search_pattern(" Ângela "), "%ângela%");
        assert_eq!(search_pattern("50%_a"), "%50\\%\\_a%");
    }

    #[test]
    fn blank_strings_read_as_absent() {
        let v = json!({"a": "  ", "b": " x ", "c": null});
        let p = Params::of(&v);
        assert_eq!(p.opt_str("a").unwrap(), None);
        assert_eq!(p.opt_str("b").unwrap().as_deref(), Some("x"));
        assert_eq!(p.opt_str("c").unwrap(), None);
        assert!(p.req_str("missing").is_err());
    }

    #[test]
    fn text_patch_keeps_or_clears() {
        let v = json!({"notes": null});
        let p = Params::of(&v);
        assert_eq!(p.text_or("notes", Some("old".into())).unwrap(), None);
        assert_eq!(
            p.text_or("address", Some("Rua 1".into())).unwrap().as_deref(),
            Some("Rua 1")
        );
    }

    #[test]
    fn decimals_accept_numbers_and_strings() {
        let v = json!({"a": 12.5, "b": "7.25", "c": "x"});
        let p = Params::of(&v);
        assert_eq!(p.req_decimal("a").unwrap(), Decimal::new(125, 1));
        assert_eq!(p.req_decimal("b").unwrap(), Decimal::new(725, 2));
        assert_eq!(p.req_decimal("c").unwrap_err().code(), "validation_failed");
    }

    #[test]
    fn choices_are_exact() {
        let v = json!({"gender": "m"});
        let p = Params::of(&v);
        assert!(p.opt_choice("gender", &["M", "F", "O"]).is_err());
    }
}
