//! Invoice/receipt bookkeeping shared by the secretaria handlers and the
//! overdue-notification job.

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::calc::{self, BalanceTotals};
use crate::error::{db_query, db_update, AppError, AppResult};

pub const STATUS_PENDING: &str = "PENDENTE";
pub const STATUS_OVERDUE: &str = "VENCIDO";
pub const STATUS_PAID: &str = "PAGO";

/// Flags pending invoices whose due date has passed. Returns rows changed.
pub fn mark_overdue(conn: &Connection, today: NaiveDate) -> AppResult<usize> {
    conn.execute(
        "UPDATE invoices SET status = ?1 WHERE status = ?2 AND due_date < ?3",
        (STATUS_OVERDUE, STATUS_PENDING, today.to_string()),
    )
    .map_err(db_update)
}

fn decimals(conn: &Connection, sql: &str, student_id: &str) -> AppResult<Vec<Decimal>> {
    let mut stmt = conn.prepare(sql).map_err(db_query)?;
    let raw = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    raw.iter()
        .map(|s| {
            calc::parse_decimal(s).map_err(|e| {
                AppError::Internal(format!(
                    "corrupt amount {:?} for student {}: {}",
                    s, student_id, e
                ))
            })
        })
        .collect()
}

/// Rebuilds the student's running balance from scratch.
pub fn recompute_balance(conn: &Connection, student_id: &str) -> AppResult<BalanceTotals> {
    let debits = decimals(
        conn,
        "SELECT current_amount FROM invoices WHERE student_id = ?",
        student_id,
    )?;
    let credits = decimals(
        conn,
        "SELECT r.amount_paid FROM receipts r
         JOIN invoices i ON i.id = r.invoice_id
         WHERE i.student_id = ?",
        student_id,
    )?;
    let totals = calc::running_balance(debits, credits);

    conn.execute(
        "INSERT INTO balances(student_id, total_debit, total_credit, balance, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           total_debit = excluded.total_debit,
           total_credit = excluded.total_credit,
           balance = excluded.balance,
           updated_at = excluded.updated_at",
        (
            student_id,
            totals.total_debit.to_string(),
            totals.total_credit.to_string(),
            totals.balance.to_string(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(db_update)?;
    Ok(totals)
}

fn issued(conn: &Connection, sql: &str, prefix: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(db_query)?;
    let pattern = format!("{}%", prefix.replace('%', ""));
    stmt.query_map([pattern], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)
}

pub fn next_invoice_number(conn: &Connection, year: i32) -> AppResult<String> {
    let prefix = format!("{}/", year);
    let nums = issued(conn, "SELECT number FROM invoices WHERE number LIKE ?", &prefix)?;
    Ok(calc::next_invoice_no(year, nums.iter().map(String::as_str)))
}

pub fn next_receipt_number(conn: &Connection, year: i32) -> AppResult<String> {
    let prefix = format!("REC/{}/", year);
    let nums = issued(conn, "SELECT number FROM receipts WHERE number LIKE ?", &prefix)?;
    Ok(calc::next_receipt_no(year, nums.iter().map(String::as_str)))
}

pub fn next_enrollment_number(conn: &Connection, year: i32) -> AppResult<String> {
    let nums = issued(
        conn,
        "SELECT enrollment_no FROM students WHERE enrollment_no LIKE ?",
        &year.to_string(),
    )?;
    Ok(calc::next_enrollment_no(year, nums.iter().map(String::as_str)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db;

    fn seed(conn: &Connection, amounts: &[(&str, &str, &str)]) {
        conn.execute(
            "INSERT INTO students(id, enrollment_no, name, birth_date, gender, created_at)
             VALUES('s1', '20260001', 'Ana', '2010-01-01', 'F', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        for (i, (amount, due, status)) in amounts.iter().enumerate() {
            conn.execute(
                "INSERT INTO invoices(id, number, student_id, kind, issue_date, due_date,
                                      original_amount, current_amount, status, created_at)
                 VALUES(?1, ?2, 's1', 'MENSALIDADE', '2026-01-01', ?3, ?4, ?4, ?5, '2026-01-01')",
                (format!("i{}", i), format!("2026/{:04}", i + 1), due, amount, status),
            )
            .unwrap();
        }
    }

    #[test]
    fn only_pending_past_due_invoices_turn_overdue() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        seed(
            &conn,
            &[
                ("100", "2026-01-31", STATUS_PENDING),
                ("100", "2026-12-31", STATUS_PENDING),
                ("100", "2026-01-31", STATUS_PAID),
            ],
        );
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(mark_overdue(&conn, today).unwrap(), 1);
        let status: String = conn
            .query_row("SELECT status FROM invoices WHERE id = 'i0'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, STATUS_OVERDUE);
    }

    #[test]
    fn corrupt_amount_fails_the_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_db(dir.path()).unwrap();
        seed(
            &conn,
            &[
                ("150.50", "2099-01-31", STATUS_PENDING),
                ("12,5", "2099-01-31", STATUS_PENDING),
            ],
        );
        let e = recompute_balance(&conn, "s1").unwrap_err();
        assert_eq!(e.code(), "internal");
        assert!(e.to_string().contains("12,5"));

        conn.execute("UPDATE invoices SET current_amount = '49.50' WHERE id = 'i1'", [])
            .unwrap();
        let totals = recompute_balance(&conn, "s1").unwrap();
        assert_eq!(totals.balance, Decimal::new(200, 0));
    }
}
