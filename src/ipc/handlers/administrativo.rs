use crate::auth::DIR;
use crate::calc::{self, Depreciation, PayrollInput, PayslipAmounts};
use crate::config;
use crate::error::{
    db_commit, db_delete, db_insert, db_query, db_tx, db_update, AppError, AppResult,
};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    count, date_col, db_conn, dec_col, export_format, export_path, money, new_id, now_ts,
    opt_dec_col, require, search_pattern, today, workspace, ExportFormat, Params,
};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

const DEPARTMENTS: [&str; 8] = [
    "RH",
    "TESOURARIA",
    "PATRIMONIO",
    "CONTABILIDADE",
    "SUBDIRECAO PEDAGOGICA",
    "SUBDIRECAO ADMINISTRATIVA",
    "DIRECAO GERAL",
    "OUTRO",
];
const STAFF_STATUSES: [&str; 2] = ["ATIVO", "INATIVO"];
const ASSET_CATEGORIES: [&str; 5] = ["MOVEIS", "EQUIPAMENTOS", "VEICULOS", "IMÓVEIS", "OUTRO"];
const NATURES: [&str; 5] = ["ATIVO", "PASSIVO", "RECEITA", "DESPESA", "PATRIMONIO"];

fn collect<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    f: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> AppResult<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(db_query)?;
    let rows = stmt
        .query_map(params, f)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

fn non_negative(p: &Params<'_>, key: &str, current: Decimal) -> AppResult<Decimal> {
    let v = p.decimal_or(key, current)?;
    if v.is_sign_negative() {
        return Err(AppError::field(key, format!("{} must not be negative", key)));
    }
    Ok(calc::round2(v))
}

// ---------------------------------------------------------------------------
// Staff
// ---------------------------------------------------------------------------

struct Staff {
    id: String,
    name: String,
    document: String,
    position: String,
    department: String,
    hired_on: NaiveDate,
    base_salary: Decimal,
    phone: Option<String>,
    email: Option<String>,
    status: String,
}

const STAFF_SELECT: &str = "SELECT id, name, document, position, department, hired_on, base_salary,
        phone, email, status
     FROM staff";

impl Staff {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            document: r.get(2)?,
            position: r.get(3)?,
            department: r.get(4)?,
            hired_on: date_col(r, 5)?,
            base_salary: dec_col(r, 6)?,
            phone: r.get(7)?,
            email: r.get(8)?,
            status: r.get(9)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "document": self.document,
            "position": self.position,
            "department": self.department,
            "hiredOn": self.hired_on.to_string(),
            "baseSalary": money(self.base_salary),
            "phone": self.phone,
            "email": self.email,
            "status": self.status,
        })
    }
}

fn load_staff(conn: &Connection, id: &str) -> AppResult<Staff> {
    conn.query_row(&format!("{} WHERE id = ?", STAFF_SELECT), [id], Staff::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("staff member not found".to_string()))
}

fn staff_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let search = p.opt_str("search")?.map(|s| search_pattern(&s));
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR department = ?2)
               AND (?3 IS NULL OR casefold(name) LIKE ?3 ESCAPE '\\' OR casefold(document) LIKE ?3 ESCAPE '\\')
             ORDER BY name",
            STAFF_SELECT
        ),
        (
            p.opt_choice("status", &STAFF_STATUSES)?,
            p.opt_choice("department", &DEPARTMENTS)?,
            search,
        ),
        Staff::from_row,
    )?;
    Ok(json!({ "staff": rows.iter().map(Staff::to_json).collect::<Vec<_>>() }))
}

fn staff_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    if !p.has("baseSalary") {
        return Err(AppError::BadParams("missing baseSalary".to_string()));
    }
    let s = Staff {
        id: new_id(),
        name: p.req_str("name")?,
        document: p.req_str("document")?,
        position: p.req_str("position")?,
        department: p.req_choice("department", &DEPARTMENTS)?,
        hired_on: p.req_date("hiredOn")?,
        base_salary: non_negative(&p, "baseSalary", Decimal::ZERO)?,
        phone: p.opt_str("phone")?,
        email: p.opt_str("email")?,
        status: p
            .opt_choice("status", &STAFF_STATUSES)?
            .unwrap_or_else(|| "ATIVO".to_string()),
    };
    conn.execute(
        "INSERT INTO staff(id, name, document, position, department, hired_on, base_salary, phone, email, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &s.id,
            &s.name,
            &s.document,
            &s.position,
            &s.department,
            s.hired_on.to_string(),
            s.base_salary.to_string(),
            &s.phone,
            &s.email,
            &s.status,
        ),
    )
    .map_err(db_insert)?;
    Ok(s.to_json())
}

fn staff_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_staff(conn, &id)?;
    let s = Staff {
        id: cur.id,
        name: patch.str_or("name", cur.name)?,
        document: patch.str_or("document", cur.document)?,
        position: patch.str_or("position", cur.position)?,
        department: patch.choice_or("department", &DEPARTMENTS, cur.department)?,
        hired_on: patch.date_or("hiredOn", cur.hired_on)?,
        base_salary: non_negative(&patch, "baseSalary", cur.base_salary)?,
        phone: patch.text_or("phone", cur.phone)?,
        email: patch.text_or("email", cur.email)?,
        status: patch.choice_or("status", &STAFF_STATUSES, cur.status)?,
    };
    conn.execute(
        "UPDATE staff SET name = ?, document = ?, position = ?, department = ?, hired_on = ?, base_salary = ?,
            phone = ?, email = ?, status = ?
         WHERE id = ?",
        (
            &s.name,
            &s.document,
            &s.position,
            &s.department,
            s.hired_on.to_string(),
            s.base_salary.to_string(),
            &s.phone,
            &s.email,
            &s.status,
            &s.id,
        ),
    )
    .map_err(db_update)?;
    Ok(s.to_json())
}

fn staff_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let s = load_staff(conn, &id)?;
    let slips = count(conn, "SELECT COUNT(*) FROM payslips WHERE staff_id = ?", [&id])?;
    if slips > 0 {
        return Err(AppError::Conflict(format!(
            "staff member has {} payslip(s); set status INATIVO instead",
            slips
        )));
    }
    conn.execute("DELETE FROM staff WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "name": s.name, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Payroll
// ---------------------------------------------------------------------------

struct Payslip {
    id: String,
    staff_id: String,
    reference_month: String,
    reference_date: NaiveDate,
    input: PayrollInput,
    amounts: Option<PayslipAmounts>,
    file_path: Option<String>,
    created_at: String,
}

const PAYSLIP_SELECT: &str = "SELECT p.id, p.staff_id, p.reference_month, p.reference_date, p.base_salary,
        p.overtime_hours, p.deductions, p.bonuses, p.hourly_rate, p.overtime_pay, p.gross, p.inss,
        p.irt, p.net, p.file_path, p.created_at, s.name, s.department
     FROM payslips p JOIN staff s ON s.id = p.staff_id";

impl Payslip {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let amounts = match (
            opt_dec_col(r, 8)?,
            opt_dec_col(r, 9)?,
            opt_dec_col(r, 10)?,
            opt_dec_col(r, 11)?,
            opt_dec_col(r, 12)?,
            opt_dec_col(r, 13)?,
        ) {
            (Some(hourly_rate), Some(overtime_pay), Some(gross), Some(inss), Some(irt), Some(net)) => {
                Some(PayslipAmounts {
                    hourly_rate,
                    overtime_pay,
                    gross,
                    inss,
                    irt,
                    net,
                })
            }
            _ => None,
        };
        Ok(Self {
            id: r.get(0)?,
            staff_id: r.get(1)?,
            reference_month: r.get(2)?,
            reference_date: date_col(r, 3)?,
            input: PayrollInput {
                base_salary: dec_col(r, 4)?,
                overtime_hours: dec_col(r, 5)?,
                deductions: dec_col(r, 6)?,
                bonuses: dec_col(r, 7)?,
            },
            amounts,
            file_path: r.get(14)?,
            created_at: r.get(15)?,
        })
    }

    fn to_json(&self) -> Value {
        let a = self.amounts;
        json!({
            "id": self.id,
            "staffId": self.staff_id,
            "referenceMonth": self.reference_month,
            "referenceDate": self.reference_date.to_string(),
            "label": calc::month_label(&self.reference_month),
            "baseSalary": money(self.input.base_salary),
            "overtimeHours": calc::round2(self.input.overtime_hours).to_string(),
            "deductions": money(self.input.deductions),
            "bonuses": money(self.input.bonuses),
            "hourlyRate": a.map(|a| money(a.hourly_rate)),
            "overtimePay": a.map(|a| money(a.overtime_pay)),
            "gross": a.map(|a| money(a.gross)),
            "inss": a.map(|a| money(a.inss)),
            "irt": a.map(|a| money(a.irt)),
            "net": a.map(|a| money(a.net)),
            "filePath": self.file_path,
            "createdAt": self.created_at,
        })
    }
}

fn payslip_row_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let mut v = Payslip::from_row(r)?.to_json();
    v["staffName"] = json!(r.get::<_, String>(16)?);
    v["department"] = json!(r.get::<_, String>(17)?);
    Ok(v)
}

fn load_payslip(conn: &Connection, id: &str) -> AppResult<Payslip> {
    conn.query_row(&format!("{} WHERE p.id = ?", PAYSLIP_SELECT), [id], Payslip::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("payslip not found".to_string()))
}

fn load_payslip_json(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(&format!("{} WHERE p.id = ?", PAYSLIP_SELECT), [id], payslip_row_json)
        .map_err(db_query)
}

fn compute(conn: &Connection, input: PayrollInput) -> AppResult<PayslipAmounts> {
    let rates = config::payroll_rates(conn).map_err(db_query)?;
    calc::compute_payslip(input, rates).map_err(|m| {
        if m.starts_with("deductions") {
            AppError::field("deductions", m)
        } else {
            AppError::validation(m)
        }
    })
}

/// Writes the printable payslip model and returns its path.
fn write_payslip_model(
    conn: &Connection,
    ws: &Path,
    staff: &Staff,
    slip: &Payslip,
    amounts: &PayslipAmounts,
) -> AppResult<String> {
    let model = json!({
        "institution": config::institution_name(conn).map_err(db_query)?,
        "staff": {
            "name": staff.name,
            "document": staff.document,
            "position": staff.position,
            "department": staff.department,
        },
        "referenceMonth": slip.reference_month,
        "label": calc::month_label(&slip.reference_month),
        "earnings": [
            { "item": "Salário base", "amount": money(slip.input.base_salary) },
            { "item": "Horas extra", "hours": calc::round2(slip.input.overtime_hours).to_string(), "amount": money(amounts.overtime_pay) },
            { "item": "Bónus", "amount": money(slip.input.bonuses) },
        ],
        "deductions": [
            { "item": "Descontos", "amount": money(slip.input.deductions) },
            { "item": "INSS", "amount": money(amounts.inss) },
            { "item": "IRT", "amount": money(amounts.irt) },
        ],
        "hourlyRate": money(amounts.hourly_rate),
        "gross": money(amounts.gross),
        "net": money(amounts.net),
        "generatedAt": now_ts(),
    });
    let stem = format!(
        "holerite_{}_{}",
        reports::slug(&staff.name),
        slip.reference_month
    );
    let path = reports::write_render_model(ws, "administrativo/holerites", &stem, &model)?;
    Ok(path.to_string_lossy().to_string())
}

/// Saves the row, then writes the render model and records its path. The
/// file is only written once the row is in place; both land or neither does.
fn persist_payslip(
    conn: &Connection,
    ws: &Path,
    staff: &Staff,
    slip: &mut Payslip,
    amounts: &PayslipAmounts,
    insert: bool,
) -> AppResult<()> {
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    save_payslip(&tx, slip, insert)?;
    let path = write_payslip_model(&tx, ws, staff, slip, amounts)?;
    tx.execute(
        "UPDATE payslips SET file_path = ? WHERE id = ?",
        (&path, &slip.id),
    )
    .map_err(db_update)?;
    tx.commit().map_err(db_commit)?;
    slip.file_path = Some(path);
    Ok(())
}

fn month_taken(conn: &Connection, staff_id: &str, month: &str, except: &str) -> AppResult<()> {
    let n = count(
        conn,
        "SELECT COUNT(*) FROM payslips WHERE staff_id = ? AND reference_month = ? AND id <> ?",
        [staff_id, month, except],
    )?;
    if n > 0 {
        return Err(AppError::Conflict(format!(
            "a payslip for {} already exists",
            month
        )));
    }
    Ok(())
}

fn save_payslip(conn: &Connection, slip: &Payslip, insert: bool) -> AppResult<()> {
    let a = slip
        .amounts
        .ok_or_else(|| AppError::Internal("payslip saved without amounts".to_string()))?;
    let values = (
        &slip.reference_month,
        slip.reference_date.to_string(),
        slip.input.base_salary.to_string(),
        slip.input.overtime_hours.to_string(),
        slip.input.deductions.to_string(),
        slip.input.bonuses.to_string(),
        a.hourly_rate.to_string(),
        a.overtime_pay.to_string(),
        a.gross.to_string(),
        a.inss.to_string(),
        a.irt.to_string(),
        a.net.to_string(),
        &slip.file_path,
        &slip.id,
    );
    if insert {
        conn.execute(
            "INSERT INTO payslips(reference_month, reference_date, base_salary, overtime_hours, deductions, bonuses,
                hourly_rate, overtime_pay, gross, inss, irt, net, file_path, id, staff_id, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            rusqlite::params![
                values.0, values.1, values.2, values.3, values.4, values.5, values.6, values.7,
                values.8, values.9, values.10, values.11, values.12, values.13, &slip.staff_id,
                &slip.created_at,
            ],
        )
        .map_err(db_insert)?;
    } else {
        conn.execute(
            "UPDATE payslips SET reference_month = ?1, reference_date = ?2, base_salary = ?3,
                overtime_hours = ?4, deductions = ?5, bonuses = ?6, hourly_rate = ?7, overtime_pay = ?8,
                gross = ?9, inss = ?10, irt = ?11, net = ?12, file_path = ?13
             WHERE id = ?14",
            values,
        )
        .map_err(db_update)?;
    }
    Ok(())
}

fn payroll_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let year = p.opt_i64("year")?.map(|y| format!("{:04}-", y));
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR p.staff_id = ?1)
               AND (?2 IS NULL OR p.reference_month = ?2)
               AND (?3 IS NULL OR substr(p.reference_month, 1, 5) = ?3)
             ORDER BY p.reference_month DESC, s.name",
            PAYSLIP_SELECT
        ),
        (p.opt_str("staffId")?, p.opt_str("referenceMonth")?, year),
        payslip_row_json,
    )?;
    Ok(json!({ "payslips": rows }))
}

fn payroll_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let ws = workspace(state)?;
    let p = Params::of(params);
    let staff = load_staff(conn, &p.req_str("staffId")?)?;
    let reference_month = p.req_str("referenceMonth")?;
    let reference_date = calc::parse_reference_month(&reference_month)
        .map_err(|m| AppError::field("referenceMonth", m))?;

    let input = PayrollInput {
        base_salary: non_negative(&p, "baseSalary", staff.base_salary)?,
        overtime_hours: non_negative(&p, "overtimeHours", Decimal::ZERO)?,
        deductions: non_negative(&p, "deductions", Decimal::ZERO)?,
        bonuses: non_negative(&p, "bonuses", Decimal::ZERO)?,
    };
    let amounts = compute(conn, input)?;
    month_taken(conn, &staff.id, &reference_month, "")?;

    let mut slip = Payslip {
        id: new_id(),
        staff_id: staff.id.clone(),
        reference_month,
        reference_date,
        input,
        amounts: Some(amounts),
        file_path: None,
        created_at: now_ts(),
    };
    persist_payslip(conn, ws, &staff, &mut slip, &amounts, true)?;
    load_payslip_json(conn, &slip.id)
}

fn payroll_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let ws = workspace(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    if patch.has("staffId") {
        return Err(AppError::field("staffId", "staffId cannot be changed"));
    }
    let cur = load_payslip(conn, &id)?;
    let staff = load_staff(conn, &cur.staff_id)?;

    let reference_month = patch.str_or("referenceMonth", cur.reference_month.clone())?;
    let reference_date = calc::parse_reference_month(&reference_month)
        .map_err(|m| AppError::field("referenceMonth", m))?;
    month_taken(conn, &staff.id, &reference_month, &id)?;

    let input = PayrollInput {
        base_salary: non_negative(&patch, "baseSalary", cur.input.base_salary)?,
        overtime_hours: non_negative(&patch, "overtimeHours", cur.input.overtime_hours)?,
        deductions: non_negative(&patch, "deductions", cur.input.deductions)?,
        bonuses: non_negative(&patch, "bonuses", cur.input.bonuses)?,
    };
    let amounts = compute(conn, input)?;

    let mut slip = Payslip {
        reference_month,
        reference_date,
        input,
        amounts: Some(amounts),
        ..cur
    };
    persist_payslip(conn, ws, &staff, &mut slip, &amounts, false)?;
    load_payslip_json(conn, &slip.id)
}

fn payroll_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let slip = load_payslip(conn, &id)?;
    conn.execute("DELETE FROM payslips WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({
        "id": id,
        "referenceMonth": slip.reference_month,
        "deleted": true,
    }))
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

struct Asset {
    id: String,
    description: String,
    category: String,
    acquisition_value: Decimal,
    acquired_on: NaiveDate,
    useful_life_years: u32,
    location: Option<String>,
    depreciation: Depreciation,
    as_of: NaiveDate,
}

const ASSET_SELECT: &str = "SELECT id, description, category, acquisition_value, acquired_on, useful_life_years,
        location, months_elapsed, accumulated_depreciation, net_book_value, depreciated_as_of
     FROM assets";

impl Asset {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            description: r.get(1)?,
            category: r.get(2)?,
            acquisition_value: dec_col(r, 3)?,
            acquired_on: date_col(r, 4)?,
            useful_life_years: r.get(5)?,
            location: r.get(6)?,
            depreciation: Depreciation {
                months_elapsed: r.get(7)?,
                accumulated: dec_col(r, 8)?,
                net_book_value: dec_col(r, 9)?,
            },
            as_of: date_col(r, 10)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "description": self.description,
            "category": self.category,
            "acquisitionValue": money(self.acquisition_value),
            "acquiredOn": self.acquired_on.to_string(),
            "usefulLifeYears": self.useful_life_years,
            "location": self.location,
            "monthsElapsed": self.depreciation.months_elapsed,
            "accumulatedDepreciation": money(self.depreciation.accumulated),
            "netBookValue": money(self.depreciation.net_book_value),
            "depreciatedAsOf": self.as_of.to_string(),
        })
    }

    fn depreciate(&mut self, as_of: NaiveDate) {
        self.depreciation = calc::straight_line(
            self.acquisition_value,
            self.acquired_on,
            self.useful_life_years,
            as_of,
        );
        self.as_of = as_of;
    }
}

fn load_asset(conn: &Connection, id: &str) -> AppResult<Asset> {
    conn.query_row(&format!("{} WHERE id = ?", ASSET_SELECT), [id], Asset::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("asset not found".to_string()))
}

fn useful_life(p: &Params<'_>, current: Option<u32>) -> AppResult<u32> {
    let years = match (p.opt_i64("usefulLifeYears")?, current) {
        (Some(y), _) => y,
        (None, Some(c)) => return Ok(c),
        (None, None) => return Err(AppError::BadParams("missing usefulLifeYears".to_string())),
    };
    if !(1..=200).contains(&years) {
        return Err(AppError::field(
            "usefulLifeYears",
            "usefulLifeYears must be between 1 and 200",
        ));
    }
    Ok(years as u32)
}

fn store_asset(conn: &Connection, a: &Asset, insert: bool) -> AppResult<()> {
    let values = (
        &a.description,
        &a.category,
        a.acquisition_value.to_string(),
        a.acquired_on.to_string(),
        a.useful_life_years,
        &a.location,
        a.depreciation.months_elapsed,
        a.depreciation.accumulated.to_string(),
        a.depreciation.net_book_value.to_string(),
        a.as_of.to_string(),
        &a.id,
    );
    if insert {
        conn.execute(
            "INSERT INTO assets(description, category, acquisition_value, acquired_on, useful_life_years, location,
                months_elapsed, accumulated_depreciation, net_book_value, depreciated_as_of, id)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            values,
        )
        .map_err(db_insert)?;
    } else {
        conn.execute(
            "UPDATE assets SET description = ?1, category = ?2, acquisition_value = ?3, acquired_on = ?4,
                useful_life_years = ?5, location = ?6, months_elapsed = ?7, accumulated_depreciation = ?8,
                net_book_value = ?9, depreciated_as_of = ?10
             WHERE id = ?11",
            values,
        )
        .map_err(db_update)?;
    }
    Ok(())
}

fn assets_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let category = Params::of(params).opt_choice("category", &ASSET_CATEGORIES)?;
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR category = ?1) ORDER BY category, description",
            ASSET_SELECT
        ),
        [category],
        Asset::from_row,
    )?;
    let acquisition: Decimal = rows.iter().map(|a| a.acquisition_value).sum();
    let net: Decimal = rows.iter().map(|a| a.depreciation.net_book_value).sum();
    Ok(json!({
        "assets": rows.iter().map(Asset::to_json).collect::<Vec<_>>(),
        "totalAcquisitionValue": money(acquisition),
        "totalNetBookValue": money(net),
    }))
}

fn assets_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    if !p.has("acquisitionValue") {
        return Err(AppError::BadParams("missing acquisitionValue".to_string()));
    }
    let mut a = Asset {
        id: new_id(),
        description: p.req_str("description")?,
        category: p.req_choice("category", &ASSET_CATEGORIES)?,
        acquisition_value: non_negative(&p, "acquisitionValue", Decimal::ZERO)?,
        acquired_on: p.req_date("acquiredOn")?,
        useful_life_years: useful_life(&p, None)?,
        location: p.opt_str("location")?,
        depreciation: Depreciation {
            months_elapsed: 0,
            accumulated: Decimal::ZERO,
            net_book_value: Decimal::ZERO,
        },
        as_of: today(),
    };
    a.depreciate(today());
    store_asset(conn, &a, true)?;
    Ok(a.to_json())
}

fn assets_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_asset(conn, &id)?;
    let mut a = Asset {
        description: patch.str_or("description", cur.description)?,
        category: patch.choice_or("category", &ASSET_CATEGORIES, cur.category)?,
        acquisition_value: non_negative(&patch, "acquisitionValue", cur.acquisition_value)?,
        acquired_on: patch.date_or("acquiredOn", cur.acquired_on)?,
        useful_life_years: useful_life(&patch, Some(cur.useful_life_years))?,
        location: patch.text_or("location", cur.location)?,
        ..cur
    };
    a.depreciate(today());
    store_asset(conn, &a, false)?;
    Ok(a.to_json())
}

fn assets_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let a = load_asset(conn, &id)?;
    conn.execute("DELETE FROM assets WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "description": a.description, "deleted": true }))
}

/// Recomputes every asset as of `asOf` (default today).
fn assets_depreciate(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let as_of = Params::of(params).date_or("asOf", today())?;
    let mut assets = collect(conn, ASSET_SELECT, [], Asset::from_row)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for a in assets.iter_mut() {
        a.depreciate(as_of);
        store_asset(&tx, a, false)?;
    }
    tx.commit().map_err(db_commit)?;

    Ok(json!({
        "asOf": as_of.to_string(),
        "updated": assets.len(),
        "assets": assets.iter().map(Asset::to_json).collect::<Vec<_>>(),
    }))
}

// ---------------------------------------------------------------------------
// Chart of accounts and ledger
// ---------------------------------------------------------------------------

fn account_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "code": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "nature": r.get::<_, String>(3)?,
    }))
}

fn load_account(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(
        "SELECT id, code, name, nature FROM ledger_accounts WHERE id = ?",
        [id],
        account_json,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("ledger account not found".to_string()))
}

fn ledger_accounts_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let nature = Params::of(params).opt_choice("nature", &NATURES)?;
    let rows = collect(
        conn,
        "SELECT id, code, name, nature FROM ledger_accounts
         WHERE (?1 IS NULL OR nature = ?1) ORDER BY code",
        [nature],
        account_json,
    )?;
    Ok(json!({ "accounts": rows }))
}

fn ledger_accounts_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = new_id();
    conn.execute(
        "INSERT INTO ledger_accounts(id, code, name, nature) VALUES(?, ?, ?, ?)",
        (
            &id,
            p.req_str("code")?,
            p.req_str("name")?,
            p.req_choice("nature", &NATURES)?,
        ),
    )
    .map_err(db_insert)?;
    load_account(conn, &id)
}

fn ledger_accounts_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_account(conn, &id)?;
    let text = |k: &str| cur[k].as_str().unwrap_or_default().to_string();
    conn.execute(
        "UPDATE ledger_accounts SET code = ?, name = ?, nature = ? WHERE id = ?",
        (
            patch.str_or("code", text("code"))?,
            patch.str_or("name", text("name"))?,
            patch.choice_or("nature", &NATURES, text("nature"))?,
            &id,
        ),
    )
    .map_err(db_update)?;
    load_account(conn, &id)
}

fn ledger_accounts_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let cur = load_account(conn, &id)?;
    let used = count(
        conn,
        "SELECT COUNT(*) FROM ledger_entries WHERE debit_account_id = ?1 OR credit_account_id = ?1",
        [&id],
    )?;
    if used > 0 {
        return Err(AppError::Conflict(format!(
            "account has {} ledger entr(ies)",
            used
        )));
    }
    conn.execute("DELETE FROM ledger_accounts WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "code": cur["code"], "deleted": true }))
}

struct Entry {
    id: String,
    entry_date: NaiveDate,
    debit_account_id: String,
    credit_account_id: String,
    amount: Decimal,
    description: String,
    posted_by: Option<String>,
    created_at: String,
}

const ENTRY_SELECT: &str = "SELECT e.id, e.entry_date, e.debit_account_id, e.credit_account_id, e.amount,
        e.description, e.posted_by, e.created_at, d.code, d.name, c.code, c.name
     FROM ledger_entries e
     JOIN ledger_accounts d ON d.id = e.debit_account_id
     JOIN ledger_accounts c ON c.id = e.credit_account_id";

impl Entry {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            entry_date: date_col(r, 1)?,
            debit_account_id: r.get(2)?,
            credit_account_id: r.get(3)?,
            amount: dec_col(r, 4)?,
            description: r.get(5)?,
            posted_by: r.get(6)?,
            created_at: r.get(7)?,
        })
    }
}

fn entry_row_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let e = Entry::from_row(r)?;
    Ok(json!({
        "id": e.id,
        "entryDate": e.entry_date.to_string(),
        "debitAccountId": e.debit_account_id,
        "creditAccountId": e.credit_account_id,
        "amount": money(e.amount),
        "description": e.description,
        "postedBy": e.posted_by,
        "createdAt": e.created_at,
        "debitAccount": format!("{} {}", r.get::<_, String>(8)?, r.get::<_, String>(9)?),
        "creditAccount": format!("{} {}", r.get::<_, String>(10)?, r.get::<_, String>(11)?),
    }))
}

fn load_entry(conn: &Connection, id: &str) -> AppResult<Entry> {
    conn.query_row(&format!("{} WHERE e.id = ?", ENTRY_SELECT), [id], Entry::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("ledger entry not found".to_string()))
}

fn load_entry_json(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(&format!("{} WHERE e.id = ?", ENTRY_SELECT), [id], entry_row_json)
        .map_err(db_query)
}

fn check_entry(conn: &Connection, e: &Entry) -> AppResult<()> {
    if e.debit_account_id == e.credit_account_id {
        return Err(AppError::field(
            "creditAccountId",
            "debit and credit accounts must differ",
        ));
    }
    if e.amount <= Decimal::ZERO {
        return Err(AppError::field("amount", "amount must be greater than zero"));
    }
    load_account(conn, &e.debit_account_id)?;
    load_account(conn, &e.credit_account_id)?;
    Ok(())
}

fn ledger_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR e.entry_date >= ?1)
               AND (?2 IS NULL OR e.entry_date <= ?2)
               AND (?3 IS NULL OR e.debit_account_id = ?3 OR e.credit_account_id = ?3)
             ORDER BY e.entry_date DESC, e.created_at DESC",
            ENTRY_SELECT
        ),
        (
            p.opt_date("from")?.map(|d| d.to_string()),
            p.opt_date("to")?.map(|d| d.to_string()),
            p.opt_str("accountId")?,
        ),
        entry_row_json,
    )?;
    Ok(json!({ "entries": rows }))
}

fn ledger_create(state: &AppState, params: &Value) -> AppResult<Value> {
    let me = require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let e = Entry {
        id: new_id(),
        entry_date: p.date_or("entryDate", today())?,
        debit_account_id: p.req_str("debitAccountId")?,
        credit_account_id: p.req_str("creditAccountId")?,
        amount: calc::round2(p.req_decimal("amount")?),
        description: p.req_str("description")?,
        posted_by: Some(me.username.clone()),
        created_at: now_ts(),
    };
    check_entry(conn, &e)?;
    conn.execute(
        "INSERT INTO ledger_entries(id, entry_date, debit_account_id, credit_account_id, amount, description, posted_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &e.id,
            e.entry_date.to_string(),
            &e.debit_account_id,
            &e.credit_account_id,
            e.amount.to_string(),
            &e.description,
            &e.posted_by,
            &e.created_at,
        ),
    )
    .map_err(db_insert)?;
    load_entry_json(conn, &e.id)
}

fn ledger_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_entry(conn, &id)?;
    let e = Entry {
        entry_date: patch.date_or("entryDate", cur.entry_date)?,
        debit_account_id: patch.str_or("debitAccountId", cur.debit_account_id)?,
        credit_account_id: patch.str_or("creditAccountId", cur.credit_account_id)?,
        amount: calc::round2(patch.decimal_or("amount", cur.amount)?),
        description: patch.str_or("description", cur.description)?,
        ..cur
    };
    check_entry(conn, &e)?;
    conn.execute(
        "UPDATE ledger_entries SET entry_date = ?, debit_account_id = ?, credit_account_id = ?, amount = ?,
            description = ?
         WHERE id = ?",
        (
            e.entry_date.to_string(),
            &e.debit_account_id,
            &e.credit_account_id,
            e.amount.to_string(),
            &e.description,
            &e.id,
        ),
    )
    .map_err(db_update)?;
    load_entry_json(conn, &e.id)
}

fn ledger_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let e = load_entry(conn, &id)?;
    conn.execute("DELETE FROM ledger_entries WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "description": e.description, "deleted": true }))
}

/// Debit and credit totals per account over an optional date window.
fn ledger_trial_balance(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let from = p.opt_date("from")?.map(|d| d.to_string());
    let to = p.opt_date("to")?.map(|d| d.to_string());

    let accounts = collect(
        conn,
        "SELECT id, code, name, nature FROM ledger_accounts ORDER BY code",
        [],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        },
    )?;
    let entries = collect(
        conn,
        "SELECT debit_account_id, credit_account_id, amount FROM ledger_entries
         WHERE (?1 IS NULL OR entry_date >= ?1) AND (?2 IS NULL OR entry_date <= ?2)",
        (from, to),
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                dec_col(r, 2)?,
            ))
        },
    )?;

    let mut sums: BTreeMap<&str, (Decimal, Decimal)> = BTreeMap::new();
    for (debit, credit, amount) in &entries {
        sums.entry(debit.as_str()).or_default().0 += *amount;
        sums.entry(credit.as_str()).or_default().1 += *amount;
    }

    let mut total_debit = Decimal::ZERO;
    let mut total_credit = Decimal::ZERO;
    let lines: Vec<Value> = accounts
        .iter()
        .map(|(id, code, name, nature)| {
            let (d, c) = sums.get(id.as_str()).copied().unwrap_or_default();
            total_debit += d;
            total_credit += c;
            json!({
                "accountId": id,
                "code": code,
                "name": name,
                "nature": nature,
                "debit": money(d),
                "credit": money(c),
                "balance": money(d - c),
            })
        })
        .collect();

    Ok(json!({
        "accounts": lines,
        "totalDebit": money(total_debit),
        "totalCredit": money(total_credit),
        "balanced": total_debit == total_credit,
    }))
}

// ---------------------------------------------------------------------------
// Payroll report
// ---------------------------------------------------------------------------

fn reports_payroll(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, DIR)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let format = export_format(&p)?;
    let year = p.opt_i64("year")?;
    let prefix = year.map(|y| format!("{:04}-", y));

    let slips = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR substr(p.reference_month, 1, 5) = ?1)
             ORDER BY p.reference_month, s.name",
            PAYSLIP_SELECT
        ),
        [prefix],
        |r| {
            Ok((
                Payslip::from_row(r)?,
                r.get::<_, String>(16)?,
                r.get::<_, String>(17)?,
            ))
        },
    )?;

    let total_gross: Decimal = slips
        .iter()
        .filter_map(|(s, _, _)| s.amounts.map(|a| a.gross))
        .sum();
    let total_net: Decimal = slips
        .iter()
        .filter_map(|(s, _, _)| s.amounts.map(|a| a.net))
        .sum();

    match format {
        ExportFormat::Json => {
            let rows: Vec<Value> = slips
                .iter()
                .map(|(s, name, dept)| {
                    let mut v = s.to_json();
                    v["staffName"] = json!(name);
                    v["department"] = json!(dept);
                    v
                })
                .collect();
            Ok(json!({
                "year": year,
                "payslips": rows,
                "totalGross": money(total_gross),
                "totalNet": money(total_net),
            }))
        }
        ExportFormat::Csv => {
            let cell = |d: Option<Decimal>| d.map(|d| calc::round2(d).to_string()).unwrap_or_default();
            let rows: Vec<Vec<String>> = slips
                .iter()
                .map(|(s, name, dept)| {
                    let a = s.amounts;
                    vec![
                        s.reference_month.clone(),
                        name.clone(),
                        dept.clone(),
                        calc::round2(s.input.base_salary).to_string(),
                        cell(a.map(|a| a.overtime_pay)),
                        calc::round2(s.input.bonuses).to_string(),
                        calc::round2(s.input.deductions).to_string(),
                        cell(a.map(|a| a.gross)),
                        cell(a.map(|a| a.inss)),
                        cell(a.map(|a| a.irt)),
                        cell(a.map(|a| a.net)),
                    ]
                })
                .collect();
            let doc = reports::csv_document(
                &[
                    "month", "staff", "department", "base", "overtime", "bonuses", "deductions",
                    "gross", "inss", "irt", "net",
                ],
                &rows,
            );
            let stem = match year {
                Some(y) => format!("folha_{}", y),
                None => "folha".to_string(),
            };
            let out = export_path(state, &p, "administrativo/relatorios", &stem)?;
            reports::write_text(&out, &doc)?;
            Ok(json!({
                "path": out.to_string_lossy(),
                "rowsExported": rows.len(),
                "totalGross": money(total_gross),
                "totalNet": money(total_net),
            }))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let p = &req.params;
    let result = match req.method.as_str() {
        "staff.list" => staff_list(state, p),
        "staff.create" => staff_create(state, p),
        "staff.update" => staff_update(state, p),
        "staff.delete" => staff_delete(state, p),
        "payroll.list" => payroll_list(state, p),
        "payroll.create" => payroll_create(state, p),
        "payroll.update" => payroll_update(state, p),
        "payroll.delete" => payroll_delete(state, p),
        "assets.list" => assets_list(state, p),
        "assets.create" => assets_create(state, p),
        "assets.update" => assets_update(state, p),
        "assets.delete" => assets_delete(state, p),
        "assets.depreciate" => assets_depreciate(state, p),
        "ledgerAccounts.list" => ledger_accounts_list(state, p),
        "ledgerAccounts.create" => ledger_accounts_create(state, p),
        "ledgerAccounts.update" => ledger_accounts_update(state, p),
        "ledgerAccounts.delete" => ledger_accounts_delete(state, p),
        "ledger.list" => ledger_list(state, p),
        "ledger.create" => ledger_create(state, p),
        "ledger.update" => ledger_update(state, p),
        "ledger.delete" => ledger_delete(state, p),
        "ledger.trialBalance" => ledger_trial_balance(state, p),
        "reports.payroll" => reports_payroll(state, p),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
