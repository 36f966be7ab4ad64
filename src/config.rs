//! Workspace configuration stored as JSON sections in the `settings` table.
//!
//! Each section has defaults; saved values are merged over them field by
//! field, and every patch is validated before it is persisted.

use chrono::format::{Item, StrftimeItems};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

use crate::calc::{self, PayrollRates};
use crate::db;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Backup,
    Smtp,
    Whatsapp,
    Session,
    Grading,
    Payroll,
    Institution,
}

pub const ALL_SECTIONS: [Section; 7] = [
    Section::Backup,
    Section::Smtp,
    Section::Whatsapp,
    Section::Session,
    Section::Grading,
    Section::Payroll,
    Section::Institution,
];

const SECRET_FIELDS: [&str; 2] = ["password", "apiToken"];
const MASK: &str = "********";

impl Section {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(Self::Backup),
            "smtp" => Some(Self::Smtp),
            "whatsapp" => Some(Self::Whatsapp),
            "session" => Some(Self::Session),
            "grading" => Some(Self::Grading),
            "payroll" => Some(Self::Payroll),
            "institution" => Some(Self::Institution),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Smtp => "smtp",
            Self::Whatsapp => "whatsapp",
            Self::Session => "session",
            Self::Grading => "grading",
            Self::Payroll => "payroll",
            Self::Institution => "institution",
        }
    }

    fn key(self) -> String {
        format!("config.{}", self.name())
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::Backup => json!({
            "localPath": null,
            "filenamePattern": "backup_%Y%m%d_%H%M%S.zip",
            "dumpCommand": null
        }),
        Section::Smtp => json!({
            "host": null,
            "port": 587,
            "user": null,
            "password": null,
            "useTls": true,
            "fromAddress": null
        }),
        Section::Whatsapp => json!({
            "apiUrl": null,
            "apiToken": null
        }),
        Section::Session => json!({ "idleMinutes": 45 }),
        Section::Grading => json!({
            "passMark": "10",
            "weights": ["1", "1", "1"]
        }),
        Section::Payroll => json!({
            "hoursPerDay": "8",
            "workingDays": "22",
            "overtimeFactor": "1.5",
            "inssRate": "0.08",
            "irtRate": "0.15"
        }),
        Section::Institution => json!({ "name": "Escola" }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be an integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s))
}

/// Decimal given as JSON string or number, bounded; stored as a string.
fn parse_decimal_range(v: &Value, key: &str, min: Decimal, max: Decimal) -> Result<Value, String> {
    let raw = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(format!("{} must be a decimal", key)),
    };
    let d = calc::parse_decimal(&raw).map_err(|e| format!("{}: {}", key, e))?;
    if d < min || d > max {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(Value::String(d.normalize().to_string()))
}

fn parse_filename_pattern(v: &Value, key: &str) -> Result<Value, String> {
    let s = parse_string_max(v, key, 120)?;
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    if s.contains('/') || s.contains('\\') {
        return Err(format!("{} must be a file name, not a path", key));
    }
    if StrftimeItems::new(&s).any(|item| matches!(item, Item::Error)) {
        return Err(format!("{} is not a valid strftime pattern", key));
    }
    Ok(Value::String(s))
}

fn parse_command(v: &Value, key: &str) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings or null", key))?;
    if arr.is_empty() || arr.len() > 32 {
        return Err(format!("{} must have 1..=32 arguments", key));
    }
    let mut out = Vec::with_capacity(arr.len());
    for a in arr {
        out.push(Value::String(parse_string_max(a, key, 400)?));
    }
    if out[0].as_str().map(str::is_empty).unwrap_or(true) {
        return Err(format!("{} program must not be empty", key));
    }
    Ok(Value::Array(out))
}

fn as_object_mut(v: &mut Value) -> Result<&mut Map<String, Value>, String> {
    v.as_object_mut()
        .ok_or_else(|| "section must be an object".to_string())
}

pub fn merge_section_patch(
    section: Section,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        let value = match (section, k.as_str()) {
            (Section::Backup, "localPath") => {
                let p = parse_nullable_string_max(v, k, 400)?;
                if let Some(s) = p.as_str() {
                    if !Path::new(s).is_absolute() {
                        return Err("localPath must be an absolute path".into());
                    }
                }
                p
            }
            (Section::Backup, "filenamePattern") => parse_filename_pattern(v, k)?,
            (Section::Backup, "dumpCommand") => parse_command(v, k)?,

            (Section::Smtp, "host") | (Section::Smtp, "user") => {
                parse_nullable_string_max(v, k, 200)?
            }
            (Section::Smtp, "password") => parse_nullable_string_max(v, k, 200)?,
            (Section::Smtp, "port") => Value::from(parse_i64_range(v, k, 1, 65535)?),
            (Section::Smtp, "useTls") => Value::Bool(parse_bool(v, k)?),
            (Section::Smtp, "fromAddress") => {
                let a = parse_nullable_string_max(v, k, 200)?;
                if let Some(s) = a.as_str() {
                    if !s.contains('@') {
                        return Err("fromAddress must be an e-mail address".into());
                    }
                }
                a
            }

            (Section::Whatsapp, "apiUrl") => {
                let u = parse_nullable_string_max(v, k, 400)?;
                if let Some(s) = u.as_str() {
                    if !s.starts_with("http://") && !s.starts_with("https://") {
                        return Err("apiUrl must start with http:// or https://".into());
                    }
                }
                u
            }
            (Section::Whatsapp, "apiToken") => parse_nullable_string_max(v, k, 400)?,

            (Section::Session, "idleMinutes") => Value::from(parse_i64_range(v, k, 1, 24 * 60)?),

            (Section::Grading, "passMark") => {
                parse_decimal_range(v, k, Decimal::ZERO, calc::grade_max())?
            }
            (Section::Grading, "weights") => {
                let arr = v
                    .as_array()
                    .filter(|a| a.len() == 3)
                    .ok_or_else(|| "weights must be an array of 3 decimals".to_string())?;
                let mut out = Vec::with_capacity(3);
                for w in arr {
                    out.push(parse_decimal_range(w, k, Decimal::ZERO, Decimal::from(100))?);
                }
                let all_zero = out
                    .iter()
                    .all(|w| w.as_str().map(|s| s == "0").unwrap_or(false));
                if all_zero {
                    return Err("weights must not all be zero".into());
                }
                Value::Array(out)
            }

            (Section::Payroll, "hoursPerDay") => {
                parse_decimal_range(v, k, Decimal::ONE, Decimal::from(24))?
            }
            (Section::Payroll, "workingDays") => {
                parse_decimal_range(v, k, Decimal::ONE, Decimal::from(31))?
            }
            (Section::Payroll, "overtimeFactor") => {
                parse_decimal_range(v, k, Decimal::ONE, Decimal::from(5))?
            }
            (Section::Payroll, "inssRate") | (Section::Payroll, "irtRate") => {
                parse_decimal_range(v, k, Decimal::ZERO, Decimal::ONE)?
            }

            (Section::Institution, "name") => {
                let s = parse_string_max(v, k, 200)?;
                if s.is_empty() {
                    return Err("name must not be empty".into());
                }
                Value::String(s)
            }

            _ => return Err(format!("unknown {} field: {}", section.name(), k)),
        };
        obj.insert(k.clone(), value);
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: Section) -> rusqlite::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Validates and persists `patch`, returning the merged section.
pub fn update_section(
    conn: &Connection,
    section: Section,
    patch: &Map<String, Value>,
) -> Result<Result<Value, String>, rusqlite::Error> {
    let mut current = load_section(conn, section)?;
    if let Err(e) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(e));
    }
    db::settings_set_json(conn, &section.key(), &current)?;
    Ok(Ok(current))
}

pub fn mask_secrets(mut section: Value) -> Value {
    if let Some(obj) = section.as_object_mut() {
        for field in SECRET_FIELDS {
            if let Some(v) = obj.get_mut(field) {
                if !v.is_null() {
                    *v = Value::String(MASK.to_string());
                }
            }
        }
    }
    section
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn decimal_field(v: &Value, key: &str, fallback: Decimal) -> Decimal {
    v.get(key)
        .and_then(|x| x.as_str())
        .and_then(|s| calc::parse_decimal(s).ok())
        .unwrap_or(fallback)
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub local_path: PathBuf,
    pub filename_pattern: String,
    pub dump_command: Option<Vec<String>>,
}

pub fn backup_settings(conn: &Connection, workspace: &Path) -> rusqlite::Result<BackupSettings> {
    let v = load_section(conn, Section::Backup)?;
    let dump_command = v.get("dumpCommand").and_then(|c| c.as_array()).map(|a| {
        a.iter()
            .filter_map(|x| x.as_str().map(|s| s.to_string()))
            .collect::<Vec<_>>()
    });
    Ok(BackupSettings {
        local_path: str_field(&v, "localPath")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.join("backups")),
        filename_pattern: str_field(&v, "filenamePattern")
            .unwrap_or_else(|| "backup_%Y%m%d_%H%M%S.zip".to_string()),
        dump_command,
    })
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub from_address: Option<String>,
}

pub fn smtp_settings(conn: &Connection) -> rusqlite::Result<SmtpSettings> {
    let v = load_section(conn, Section::Smtp)?;
    Ok(SmtpSettings {
        host: str_field(&v, "host"),
        port: v
            .get("port")
            .and_then(|p| p.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(587),
        user: str_field(&v, "user"),
        password: str_field(&v, "password"),
        use_tls: v.get("useTls").and_then(|b| b.as_bool()).unwrap_or(true),
        from_address: str_field(&v, "fromAddress"),
    })
}

#[derive(Debug, Clone)]
pub struct WhatsappSettings {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
}

pub fn whatsapp_settings(conn: &Connection) -> rusqlite::Result<WhatsappSettings> {
    let v = load_section(conn, Section::Whatsapp)?;
    Ok(WhatsappSettings {
        api_url: str_field(&v, "apiUrl"),
        api_token: str_field(&v, "apiToken"),
    })
}

pub fn session_idle_minutes(conn: &Connection) -> rusqlite::Result<i64> {
    let v = load_section(conn, Section::Session)?;
    Ok(v.get("idleMinutes").and_then(|m| m.as_i64()).unwrap_or(45))
}

#[derive(Debug, Clone, Copy)]
pub struct GradingSettings {
    pub pass_mark: Decimal,
    pub weights: [Decimal; 3],
}

pub fn grading_settings(conn: &Connection) -> rusqlite::Result<GradingSettings> {
    let v = load_section(conn, Section::Grading)?;
    let mut weights = [Decimal::ONE; 3];
    if let Some(arr) = v.get("weights").and_then(|w| w.as_array()) {
        for (slot, w) in weights.iter_mut().zip(arr) {
            if let Some(d) = w.as_str().and_then(|s| calc::parse_decimal(s).ok()) {
                *slot = d;
            }
        }
    }
    Ok(GradingSettings {
        pass_mark: decimal_field(&v, "passMark", Decimal::from(10)),
        weights,
    })
}

pub fn payroll_rates(conn: &Connection) -> rusqlite::Result<PayrollRates> {
    let v = load_section(conn, Section::Payroll)?;
    let d = PayrollRates::default();
    Ok(PayrollRates {
        hours_per_day: decimal_field(&v, "hoursPerDay", d.hours_per_day),
        working_days: decimal_field(&v, "workingDays", d.working_days),
        overtime_factor: decimal_field(&v, "overtimeFactor", d.overtime_factor),
        inss_rate: decimal_field(&v, "inssRate", d.inss_rate),
        irt_rate: decimal_field(&v, "irtRate", d.irt_rate),
    })
}

pub fn institution_name(conn: &Connection) -> rusqlite::Result<String> {
    let v = load_section(conn, Section::Institution)?;
    Ok(str_field(&v, "name").unwrap_or_else(|| "Escola".to_string()))
}
