//! Operational jobs shared by the IPC handlers and the CLI subcommands:
//! backups, the academic exercise switch and overdue-invoice reminders.

use chrono::{Local, NaiveDate, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::backup;
use crate::billing;
use crate::calc;
use crate::config;
use crate::db::DB_FILE;
use crate::error::{db_commit, db_insert, db_query, db_tx, db_update, AppError, AppResult};
use crate::notify::{self, EmailChannel, WhatsappChannel};

pub const BACKUP_SUCCESS: &str = "SUCCESS";
pub const BACKUP_FAILURE: &str = "FAILURE";

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub log_id: i64,
    pub succeeded: bool,
    pub file_path: PathBuf,
    pub details: String,
}

impl BackupOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "logId": self.log_id,
            "status": if self.succeeded { BACKUP_SUCCESS } else { BACKUP_FAILURE },
            "filePath": self.file_path.to_string_lossy(),
            "details": self.details,
        })
    }
}

fn substitute(arg: &str, db: &Path, out: &Path) -> String {
    arg.replace("{db}", &db.to_string_lossy())
        .replace("{out}", &out.to_string_lossy())
}

/// Runs the configured dump program once. Exit code and stderr end up in the
/// error text on failure.
fn run_dump(argv: &[String], db: &Path, out: &Path) -> Result<String, String> {
    let Some((program, args)) = argv.split_first() else {
        return Err("dump command is empty".to_string());
    };
    let output = Command::new(substitute(program, db, out))
        .args(args.iter().map(|a| substitute(a, db, out)))
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("failed to start {}: {}", program, e))?;
    if output.status.success() {
        return Ok(format!("dump command {} completed", program));
    }
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Err(format!(
        "dump command {} exited with {}: {}",
        program,
        code,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

/// Writes one backup and always records the attempt in `backup_logs`.
pub fn run_backup(
    conn: &Connection,
    workspace: &Path,
    executed_by: Option<&str>,
) -> AppResult<BackupOutcome> {
    let settings = config::backup_settings(conn, workspace).map_err(db_query)?;
    let file_name = Local::now().format(&settings.filename_pattern).to_string();
    let out = settings.local_path.join(file_name);

    let result = std::fs::create_dir_all(&settings.local_path)
        .map_err(|e| {
            format!(
                "cannot create backup directory {}: {}",
                settings.local_path.display(),
                e
            )
        })
        .and_then(|_| match settings.dump_command.as_deref() {
            Some(argv) if !argv.is_empty() => run_dump(argv, &workspace.join(DB_FILE), &out),
            _ => backup::export_bundle(conn, workspace, &out)
                .map(|s| format!("bundle sha256={} dbBytes={}", s.sha256, s.db_bytes))
                .map_err(|e| format!("{e:#}")),
        });

    let (succeeded, details) = match result {
        Ok(d) => (true, d),
        Err(d) => (false, d),
    };
    conn.execute(
        "INSERT INTO backup_logs(executed_at, status, file_path, details, executed_by)
         VALUES(?, ?, ?, ?, ?)",
        (
            Utc::now().to_rfc3339(),
            if succeeded { BACKUP_SUCCESS } else { BACKUP_FAILURE },
            out.to_string_lossy(),
            &details,
            executed_by,
        ),
    )
    .map_err(db_insert)?;
    let log_id = conn.last_insert_rowid();

    if succeeded {
        info!("event=backup_run module=ops status=ok log_id={}", log_id);
    } else {
        warn!("event=backup_run module=ops status=error log_id={}", log_id);
    }
    Ok(BackupOutcome {
        log_id,
        succeeded,
        file_path: out,
        details,
    })
}

#[derive(Debug, Clone)]
pub struct ExerciseSwitch {
    pub exercise_id: String,
    pub academic_year_id: String,
    pub closed_exercise_id: Option<String>,
    pub backup: BackupOutcome,
}

impl ExerciseSwitch {
    pub fn to_json(&self) -> Value {
        json!({
            "exerciseId": self.exercise_id,
            "academicYearId": self.academic_year_id,
            "closedExerciseId": self.closed_exercise_id,
            "backup": self.backup.to_json(),
        })
    }
}

/// Backs up, closes the open exercise, activates `year_id` and opens a new
/// exercise for it. Nothing changes if the backup fails.
pub fn switch_exercise(
    conn: &Connection,
    workspace: &Path,
    year_id: &str,
    executed_by: Option<&str>,
) -> AppResult<ExerciseSwitch> {
    let known: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM academic_years WHERE id = ?",
            [year_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if known == 0 {
        return Err(AppError::NotFound("academic year not found".to_string()));
    }

    let backup = run_backup(conn, workspace, executed_by)?;
    if !backup.succeeded {
        return Err(AppError::Io(format!(
            "exercise switch aborted, backup failed: {}",
            backup.details
        )));
    }

    let now = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let closed_exercise_id: Option<String> = tx
        .query_row("SELECT id FROM exercises WHERE closed_at IS NULL", [], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query)?;
    if let Some(id) = &closed_exercise_id {
        tx.execute(
            "UPDATE exercises SET closed_at = ?, backup_path = ? WHERE id = ?",
            (&now, backup.file_path.to_string_lossy(), id),
        )
        .map_err(db_update)?;
    }
    tx.execute("UPDATE academic_years SET active = 0 WHERE active = 1", [])
        .map_err(db_update)?;
    tx.execute("UPDATE academic_years SET active = 1 WHERE id = ?", [year_id])
        .map_err(db_update)?;
    let exercise_id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO exercises(id, academic_year_id, opened_at) VALUES(?, ?, ?)",
        (&exercise_id, year_id, &now),
    )
    .map_err(db_insert)?;
    tx.commit().map_err(db_commit)?;

    info!("event=exercise_switch module=ops status=ok");
    Ok(ExerciseSwitch {
        exercise_id,
        academic_year_id: year_id.to_string(),
        closed_exercise_id,
        backup,
    })
}

#[derive(Debug, Clone, Default)]
pub struct OverdueSummary {
    pub guardians: usize,
    pub invoices: usize,
    pub emails_sent: usize,
    pub emails_failed: usize,
    pub whatsapp_sent: usize,
    pub whatsapp_failed: usize,
}

impl OverdueSummary {
    pub fn to_json(&self) -> Value {
        json!({
            "guardians": self.guardians,
            "invoices": self.invoices,
            "emailsSent": self.emails_sent,
            "emailsFailed": self.emails_failed,
            "whatsappSent": self.whatsapp_sent,
            "whatsappFailed": self.whatsapp_failed,
        })
    }
}

struct OverdueLine {
    student: String,
    number: String,
    due_date: String,
    amount: Decimal,
}

struct Debtor {
    name: String,
    phone: String,
    email: Option<String>,
    lines: Vec<OverdueLine>,
}

fn overdue_by_guardian(conn: &Connection, today: NaiveDate) -> AppResult<BTreeMap<String, Debtor>> {
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.name, g.phone, g.email, s.name, i.number, i.due_date, i.current_amount
             FROM invoices i
             JOIN students s ON s.id = i.student_id
             JOIN guardians g ON g.id = s.guardian_id
             WHERE i.status IN ('PENDENTE', 'VENCIDO') AND i.due_date < ? AND g.is_active = 1
             ORDER BY g.name, i.due_date, i.number",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([today.to_string()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                OverdueLine {
                    student: r.get(4)?,
                    number: r.get(5)?,
                    due_date: r.get(6)?,
                    amount: calc::parse_decimal(&r.get::<_, String>(7)?).unwrap_or_default(),
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut out: BTreeMap<String, Debtor> = BTreeMap::new();
    for (id, name, phone, email, line) in rows {
        out.entry(id)
            .or_insert_with(|| Debtor {
                name,
                phone,
                email: email.filter(|e| !e.trim().is_empty()),
                lines: Vec::new(),
            })
            .lines
            .push(line);
    }
    Ok(out)
}

fn reminder_text(institution: &str, debtor: &Debtor) -> String {
    let mut body = format!(
        "Caro(a) {},\n\nConstam em atraso as seguintes faturas na {}:\n",
        debtor.name, institution
    );
    let mut total = Decimal::ZERO;
    for l in &debtor.lines {
        total += l.amount;
        body.push_str(&format!(
            "- {} ({}), vencida em {}: {}\n",
            l.number,
            l.student,
            l.due_date,
            calc::round2(l.amount)
        ));
    }
    body.push_str(&format!(
        "\nTotal em atraso: {}\n\nPor favor regularize a situação junto da secretaria.\n",
        calc::round2(total)
    ));
    body
}

/// Flags overdue invoices, then sends one reminder per guardian on each
/// available channel.
pub fn notify_overdue(conn: &Connection, today: NaiveDate) -> AppResult<OverdueSummary> {
    billing::mark_overdue(conn, today)?;
    let debtors = overdue_by_guardian(conn, today)?;
    let institution = config::institution_name(conn).map_err(db_query)?;
    let email = EmailChannel::new(config::smtp_settings(conn).map_err(db_query)?);
    let whatsapp = WhatsappChannel::new(config::whatsapp_settings(conn).map_err(db_query)?);
    let subject = format!("Faturas em atraso - {}", institution);

    let mut summary = OverdueSummary {
        guardians: debtors.len(),
        ..OverdueSummary::default()
    };
    for (guardian_id, debtor) in &debtors {
        summary.invoices += debtor.lines.len();
        let body = reminder_text(&institution, debtor);
        if let Some(address) = &debtor.email {
            if notify::deliver(conn, &email, address, &subject, &body, Some(guardian_id)) {
                summary.emails_sent += 1;
            } else {
                summary.emails_failed += 1;
            }
        }
        if notify::deliver(conn, &whatsapp, &debtor.phone, &subject, &body, Some(guardian_id)) {
            summary.whatsapp_sent += 1;
        } else {
            summary.whatsapp_failed += 1;
        }
    }
    info!(
        "event=notify_overdue module=ops status=ok guardians={} invoices={}",
        summary.guardians, summary.invoices
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let s = substitute("--file={out}", Path::new("/w/escola.sqlite3"), Path::new("/b/x.sql"));
        assert_eq!(s, "--file=/b/x.sql");
        assert_eq!(
            substitute("{db}", Path::new("/w/escola.sqlite3"), Path::new("/b")),
            "/w/escola.sqlite3"
        );
    }

    #[test]
    fn reminder_lists_each_invoice_and_total() {
        let d = Debtor {
            name: "Maria".into(),
            phone: "923000000".into(),
            email: None,
            lines: vec![
                OverdueLine {
                    student: "Ana".into(),
                    number: "2026/0001".into(),
                    due_date: "2026-02-10".into(),
                    amount: Decimal::new(150000, 2),
                },
                OverdueLine {
                    student: "Rui".into(),
                    number: "2026/0004".into(),
                    due_date: "2026-03-10".into(),
                    amount: Decimal::new(50050, 2),
                },
            ],
        };
        let text = reminder_text("Escola Teste", &d);
        assert!(text.contains("2026/0001 (Ana)"));
        assert!(text.contains("2026/0004 (Rui)"));
        assert!(text.contains("Total em atraso: 2000.50"));
    }

    #[test]
    fn empty_dump_command_is_an_error() {
        assert!(run_dump(&[], Path::new("a"), Path::new("b")).is_err());
    }
}
