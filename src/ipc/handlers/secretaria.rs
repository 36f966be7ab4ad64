use crate::auth::SEC;
use crate::billing::{self, STATUS_PAID, STATUS_PENDING};
use crate::calc;
use crate::error::{
    db_commit, db_delete, db_insert, db_query, db_tx, db_update, AppError, AppResult,
};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    count, date_col, db_conn, dec_col, ensure_exists, export_format, export_path, money, new_id,
    now_ts, require, search_pattern, today, ExportFormat, Params,
};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use chrono::{Datelike, NaiveDate};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row, ToSql};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

const RELATIONSHIPS: [&str; 7] = ["Pai", "Mãe", "Tio", "Tia", "Avô", "Avó", "Outro"];
const GENDERS: [&str; 3] = ["M", "F", "O"];
const STUDENT_STATUSES: [&str; 7] = [
    "ATIVO",
    "INATIVO",
    "SUSPENSO",
    "TRANCADO",
    "FORMADO",
    "TRANSFERIDO",
    "DESISTENTE",
];
const INVOICE_KINDS: [&str; 4] = ["MENSALIDADE", "MATRICULA", "MATERIAL", "OUTRO"];
const INVOICE_STATUSES: [&str; 3] = ["PENDENTE", "VENCIDO", "PAGO"];
const PAYMENT_METHODS: [&str; 4] = ["DINHEIRO", "TRANSFERÊNCIA", "CHEQUE", "OUTRO"];
const PRE_ENROLLMENT_STATUSES: [&str; 3] = ["PENDENTE", "APROVADA", "RECUSADA"];
const KIND_ITEMIZED: &str = "OUTRO";

fn check_phone(phone: &str) -> AppResult<()> {
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    let allowed = phone
        .chars()
        .all(|c| c.is_ascii_digit() || c == '+' || c == ' ' || c == '-');
    if !allowed || !(9..=15).contains(&digits) {
        return Err(AppError::field(
            "phone",
            "phone must have 9 to 15 digits (spaces, + and - allowed)",
        ));
    }
    Ok(())
}

fn check_email(email: Option<&str>) -> AppResult<()> {
    if let Some(e) = email {
        let Some((local, domain)) = e.split_once('@') else {
            return Err(AppError::field("email", "email is not a valid address"));
        };
        if local.is_empty() || !domain.contains('.') {
            return Err(AppError::field("email", "email is not a valid address"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Guardians
// ---------------------------------------------------------------------------

struct Guardian {
    id: String,
    name: String,
    phone: String,
    email: Option<String>,
    address: Option<String>,
    relationship: String,
    is_active: bool,
    created_at: String,
}

const GUARDIAN_COLS: &str =
    "id, name, phone, email, address, relationship, is_active, created_at";

impl Guardian {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            phone: r.get(2)?,
            email: r.get(3)?,
            address: r.get(4)?,
            relationship: r.get(5)?,
            is_active: r.get::<_, i64>(6)? != 0,
            created_at: r.get(7)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "phone": self.phone,
            "email": self.email,
            "address": self.address,
            "relationship": self.relationship,
            "isActive": self.is_active,
            "createdAt": self.created_at,
        })
    }
}

fn load_guardian(conn: &Connection, id: &str) -> AppResult<Guardian> {
    conn.query_row(
        &format!("SELECT {} FROM guardians WHERE id = ?", GUARDIAN_COLS),
        [id],
        Guardian::from_row,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("guardian not found".to_string()))
}

fn guardians_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let search = p.opt_str("search")?.map(|s| search_pattern(&s));
    let active = p.opt_bool("active")?.map(|b| b as i64);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM guardians
             WHERE (?1 IS NULL OR casefold(name) LIKE ?1 ESCAPE '\\' OR phone LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR is_active = ?2)
             ORDER BY name",
            GUARDIAN_COLS
        ))
        .map_err(db_query)?;
    let rows = stmt
        .query_map((search, active), Guardian::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "guardians": rows.iter().map(Guardian::to_json).collect::<Vec<_>>() }))
}

fn guardians_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let g = Guardian {
        id: new_id(),
        name: p.req_str("name")?,
        phone: p.req_str("phone")?,
        email: p.opt_str("email")?,
        address: p.opt_str("address")?,
        relationship: p.req_choice("relationship", &RELATIONSHIPS)?,
        is_active: p.bool_or("isActive", true)?,
        created_at: now_ts(),
    };
    check_phone(&g.phone)?;
    check_email(g.email.as_deref())?;

    conn.execute(
        "INSERT INTO guardians(id, name, phone, email, address, relationship, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &g.id,
            &g.name,
            &g.phone,
            &g.email,
            &g.address,
            &g.relationship,
            g.is_active as i64,
            &g.created_at,
        ),
    )
    .map_err(db_insert)?;
    Ok(g.to_json())
}

fn guardians_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_guardian(conn, &id)?;

    let g = Guardian {
        id: cur.id,
        name: patch.str_or("name", cur.name)?,
        phone: patch.str_or("phone", cur.phone)?,
        email: patch.text_or("email", cur.email)?,
        address: patch.text_or("address", cur.address)?,
        relationship: patch.choice_or("relationship", &RELATIONSHIPS, cur.relationship)?,
        is_active: patch.bool_or("isActive", cur.is_active)?,
        created_at: cur.created_at,
    };
    check_phone(&g.phone)?;
    check_email(g.email.as_deref())?;

    conn.execute(
        "UPDATE guardians SET name = ?, phone = ?, email = ?, address = ?, relationship = ?, is_active = ?
         WHERE id = ?",
        (
            &g.name,
            &g.phone,
            &g.email,
            &g.address,
            &g.relationship,
            g.is_active as i64,
            &g.id,
        ),
    )
    .map_err(db_update)?;
    Ok(g.to_json())
}

fn guardians_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let g = load_guardian(conn, &id)?;
    let students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE guardian_id = ?",
        [&id],
    )?;
    if students > 0 {
        return Err(AppError::Conflict(format!(
            "guardian is linked to {} student(s)",
            students
        )));
    }
    conn.execute("DELETE FROM guardians WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "name": g.name, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Students
// ---------------------------------------------------------------------------

struct Student {
    id: String,
    enrollment_no: String,
    name: String,
    birth_date: NaiveDate,
    gender: String,
    address: Option<String>,
    document: Option<String>,
    notes: Option<String>,
    guardian_id: Option<String>,
    status: String,
    created_at: String,
}

const STUDENT_COLS: &str = "s.id, s.enrollment_no, s.name, s.birth_date, s.gender, s.address, s.document,
     s.notes, s.guardian_id, s.status, s.created_at";

impl Student {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            enrollment_no: r.get(1)?,
            name: r.get(2)?,
            birth_date: date_col(r, 3)?,
            gender: r.get(4)?,
            address: r.get(5)?,
            document: r.get(6)?,
            notes: r.get(7)?,
            guardian_id: r.get(8)?,
            status: r.get(9)?,
            created_at: r.get(10)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "enrollmentNo": self.enrollment_no,
            "name": self.name,
            "birthDate": self.birth_date.to_string(),
            "gender": self.gender,
            "address": self.address,
            "document": self.document,
            "notes": self.notes,
            "guardianId": self.guardian_id,
            "status": self.status,
            "createdAt": self.created_at,
        })
    }
}

fn load_student(conn: &Connection, id: &str) -> AppResult<Student> {
    conn.query_row(
        &format!("SELECT {} FROM students s WHERE s.id = ?", STUDENT_COLS),
        [id],
        Student::from_row,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("student not found".to_string()))
}

fn check_student(conn: &Connection, s: &Student) -> AppResult<()> {
    if s.birth_date > today() {
        return Err(AppError::field("birthDate", "birthDate cannot be in the future"));
    }
    if let Some(gid) = s.guardian_id.as_deref() {
        ensure_exists(conn, "guardians", gid, "guardian")?;
    }
    Ok(())
}

fn students_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let search = p.opt_str("search")?.map(|s| search_pattern(&s));
    let status = p.opt_choice("status", &STUDENT_STATUSES)?;
    let guardian_id = p.opt_str("guardianId")?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}, g.name FROM students s
             LEFT JOIN guardians g ON g.id = s.guardian_id
             WHERE (?1 IS NULL OR casefold(s.name) LIKE ?1 ESCAPE '\\' OR s.enrollment_no LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR s.status = ?2)
               AND (?3 IS NULL OR s.guardian_id = ?3)
             ORDER BY s.name",
            STUDENT_COLS
        ))
        .map_err(db_query)?;
    let rows = stmt
        .query_map((search, status, guardian_id), |r| {
            let s = Student::from_row(r)?;
            let mut v = s.to_json();
            v["guardianName"] = json!(r.get::<_, Option<String>>(11)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "students": rows }))
}

fn students_get(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let s = load_student(conn, &id)?;
    let guardian = match s.guardian_id.as_deref() {
        Some(gid) => Some(load_guardian(conn, gid)?.to_json()),
        None => None,
    };
    let balance = balance_json(conn, &id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, number, kind, due_date, current_amount, status
             FROM invoices WHERE student_id = ? ORDER BY issue_date DESC, number DESC",
        )
        .map_err(db_query)?;
    let invoices = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "number": r.get::<_, String>(1)?,
                "kind": r.get::<_, String>(2)?,
                "dueDate": r.get::<_, String>(3)?,
                "currentAmount": money(dec_col(r, 4)?),
                "status": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.class_id, c.name, e.status, e.enrolled_on
             FROM enrollments e JOIN classes c ON c.id = e.class_id
             WHERE e.student_id = ? ORDER BY e.enrolled_on DESC",
        )
        .map_err(db_query)?;
    let enrollments = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "enrolledOn": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    Ok(json!({
        "student": s.to_json(),
        "guardian": guardian,
        "balance": balance,
        "invoices": invoices,
        "enrollments": enrollments,
    }))
}

fn students_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let mut s = Student {
        id: new_id(),
        enrollment_no: String::new(),
        name: p.req_str("name")?,
        birth_date: p.req_date("birthDate")?,
        gender: p.req_choice("gender", &GENDERS)?,
        address: p.opt_str("address")?,
        document: p.opt_str("document")?,
        notes: p.opt_str("notes")?,
        guardian_id: p.opt_str("guardianId")?,
        status: p
            .opt_choice("status", &STUDENT_STATUSES)?
            .unwrap_or_else(|| "ATIVO".to_string()),
        created_at: now_ts(),
    };
    check_student(conn, &s)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    s.enrollment_no = billing::next_enrollment_number(&tx, today().year())?;
    tx.execute(
        "INSERT INTO students(id, enrollment_no, name, birth_date, gender, address, document, notes, guardian_id, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &s.id,
            &s.enrollment_no,
            &s.name,
            s.birth_date.to_string(),
            &s.gender,
            &s.address,
            &s.document,
            &s.notes,
            &s.guardian_id,
            &s.status,
            &s.created_at,
        ),
    )
    .map_err(db_insert)?;
    billing::recompute_balance(&tx, &s.id)?;
    tx.commit().map_err(db_commit)?;

    Ok(s.to_json())
}

fn students_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    if patch.has("enrollmentNo") {
        return Err(AppError::field("enrollmentNo", "enrollmentNo is generated and read-only"));
    }
    let cur = load_student(conn, &id)?;
    let s = Student {
        id: cur.id,
        enrollment_no: cur.enrollment_no,
        name: patch.str_or("name", cur.name)?,
        birth_date: patch.date_or("birthDate", cur.birth_date)?,
        gender: patch.choice_or("gender", &GENDERS, cur.gender)?,
        address: patch.text_or("address", cur.address)?,
        document: patch.text_or("document", cur.document)?,
        notes: patch.text_or("notes", cur.notes)?,
        guardian_id: patch.text_or("guardianId", cur.guardian_id)?,
        status: patch.choice_or("status", &STUDENT_STATUSES, cur.status)?,
        created_at: cur.created_at,
    };
    check_student(conn, &s)?;

    conn.execute(
        "UPDATE students SET name = ?, birth_date = ?, gender = ?, address = ?, document = ?, notes = ?,
            guardian_id = ?, status = ?
         WHERE id = ?",
        (
            &s.name,
            s.birth_date.to_string(),
            &s.gender,
            &s.address,
            &s.document,
            &s.notes,
            &s.guardian_id,
            &s.status,
            &s.id,
        ),
    )
    .map_err(db_update)?;
    Ok(s.to_json())
}

fn students_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let s = load_student(conn, &id)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    // Dependency order; the schema has no ON DELETE CASCADE.
    let steps = [
        "DELETE FROM grades WHERE student_id = ?",
        "DELETE FROM enrollments WHERE student_id = ?",
        "DELETE FROM pre_enrollments WHERE student_id = ?",
        "DELETE FROM receipts WHERE invoice_id IN (SELECT id FROM invoices WHERE student_id = ?)",
        "DELETE FROM invoice_items WHERE invoice_id IN (SELECT id FROM invoices WHERE student_id = ?)",
        "DELETE FROM invoices WHERE student_id = ?",
        "DELETE FROM balances WHERE student_id = ?",
        "DELETE FROM students WHERE id = ?",
    ];
    for sql in steps {
        tx.execute(sql, [&id]).map_err(db_delete)?;
    }
    tx.commit().map_err(db_commit)?;

    Ok(json!({ "id": id, "enrollmentNo": s.enrollment_no, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

struct Service {
    id: String,
    code: String,
    description: String,
    price: Decimal,
    active: bool,
}

impl Service {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            code: r.get(1)?,
            description: r.get(2)?,
            price: dec_col(r, 3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "code": self.code,
            "description": self.description,
            "price": money(self.price),
            "active": self.active,
        })
    }
}

fn load_service(conn: &Connection, id: &str) -> AppResult<Service> {
    conn.query_row(
        "SELECT id, code, description, price, active FROM services WHERE id = ?",
        [id],
        Service::from_row,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("service not found".to_string()))
}

fn check_price(price: Decimal) -> AppResult<()> {
    if price.is_sign_negative() {
        return Err(AppError::field("price", "price must not be negative"));
    }
    Ok(())
}

fn services_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let active = Params::of(params).opt_bool("active")?.map(|b| b as i64);
    let mut stmt = conn
        .prepare(
            "SELECT id, code, description, price, active FROM services
             WHERE (?1 IS NULL OR active = ?1) ORDER BY code",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([active], Service::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "services": rows.iter().map(Service::to_json).collect::<Vec<_>>() }))
}

fn services_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let s = Service {
        id: new_id(),
        code: p.req_str("code")?,
        description: p.req_str("description")?,
        price: calc::round2(p.req_decimal("price")?),
        active: p.bool_or("active", true)?,
    };
    check_price(s.price)?;
    conn.execute(
        "INSERT INTO services(id, code, description, price, active) VALUES(?, ?, ?, ?, ?)",
        (&s.id, &s.code, &s.description, s.price.to_string(), s.active as i64),
    )
    .map_err(db_insert)?;
    Ok(s.to_json())
}

fn services_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_service(conn, &id)?;
    let s = Service {
        id: cur.id,
        code: patch.str_or("code", cur.code)?,
        description: patch.str_or("description", cur.description)?,
        price: calc::round2(patch.decimal_or("price", cur.price)?),
        active: patch.bool_or("active", cur.active)?,
    };
    check_price(s.price)?;
    conn.execute(
        "UPDATE services SET code = ?, description = ?, price = ?, active = ? WHERE id = ?",
        (&s.code, &s.description, s.price.to_string(), s.active as i64, &s.id),
    )
    .map_err(db_update)?;
    Ok(s.to_json())
}

fn services_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let s = load_service(conn, &id)?;
    let used = count(
        conn,
        "SELECT COUNT(*) FROM invoice_items WHERE service_id = ?",
        [&id],
    )?;
    if used > 0 {
        return Err(AppError::Conflict(format!(
            "service is billed on {} invoice(s)",
            used
        )));
    }
    conn.execute("DELETE FROM services WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "code": s.code, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Invoices
// ---------------------------------------------------------------------------

struct Invoice {
    id: String,
    number: String,
    student_id: String,
    kind: String,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    original_amount: Decimal,
    current_amount: Decimal,
    status: String,
    notes: Option<String>,
    created_at: String,
}

const INVOICE_COLS: &str = "i.id, i.number, i.student_id, i.kind, i.issue_date, i.due_date,
     i.original_amount, i.current_amount, i.status, i.notes, i.created_at";

impl Invoice {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            number: r.get(1)?,
            student_id: r.get(2)?,
            kind: r.get(3)?,
            issue_date: date_col(r, 4)?,
            due_date: date_col(r, 5)?,
            original_amount: dec_col(r, 6)?,
            current_amount: dec_col(r, 7)?,
            status: r.get(8)?,
            notes: r.get(9)?,
            created_at: r.get(10)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "number": self.number,
            "studentId": self.student_id,
            "kind": self.kind,
            "issueDate": self.issue_date.to_string(),
            "dueDate": self.due_date.to_string(),
            "originalAmount": money(self.original_amount),
            "currentAmount": money(self.current_amount),
            "status": self.status,
            "notes": self.notes,
            "createdAt": self.created_at,
        })
    }
}

struct ItemLine {
    service_id: String,
    quantity: i64,
    unit_price: Decimal,
}

fn load_invoice(conn: &Connection, id: &str) -> AppResult<Invoice> {
    conn.query_row(
        &format!("SELECT {} FROM invoices i WHERE i.id = ?", INVOICE_COLS),
        [id],
        Invoice::from_row,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("invoice not found".to_string()))
}

fn invoice_items_json(conn: &Connection, invoice_id: &str) -> AppResult<Vec<Value>> {
    let mut stmt = conn
        .prepare(
            "SELECT ii.service_id, s.code, s.description, ii.quantity, ii.unit_price
             FROM invoice_items ii JOIN services s ON s.id = ii.service_id
             WHERE ii.invoice_id = ? ORDER BY s.code",
        )
        .map_err(db_query)?;
    stmt.query_map([invoice_id], |r| {
        let qty: i64 = r.get(3)?;
        let unit = dec_col(r, 4)?;
        Ok(json!({
            "serviceId": r.get::<_, String>(0)?,
            "code": r.get::<_, String>(1)?,
            "description": r.get::<_, String>(2)?,
            "quantity": qty,
            "unitPrice": money(unit),
            "total": money(unit * Decimal::from(qty)),
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_query)
}

/// Parses `items` for an itemized invoice and prices them from the catalog.
fn parse_items(conn: &Connection, raw: &[Value]) -> AppResult<Vec<ItemLine>> {
    if raw.is_empty() {
        return Err(AppError::field("items", "at least one service is required"));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for (idx, item) in raw.iter().enumerate() {
        let ip = Params::of(item);
        let service_id = ip.req_str("serviceId")?;
        let quantity = ip.opt_i64("quantity")?.unwrap_or(1);
        if quantity < 1 {
            return Err(AppError::Validation {
                message: "quantity must be at least 1".to_string(),
                details: Some(json!({ "field": "items", "index": idx })),
            });
        }
        if !seen.insert(service_id.clone()) {
            return Err(AppError::Validation {
                message: "each service may appear only once".to_string(),
                details: Some(json!({ "field": "items", "index": idx })),
            });
        }
        let service = load_service(conn, &service_id)?;
        if !service.active {
            return Err(AppError::Validation {
                message: format!("service {} is inactive", service.code),
                details: Some(json!({ "field": "items", "index": idx })),
            });
        }
        out.push(ItemLine {
            service_id,
            quantity,
            unit_price: service.price,
        });
    }
    Ok(out)
}

fn items_total(items: &[ItemLine]) -> Decimal {
    calc::round2(
        items
            .iter()
            .map(|i| i.unit_price * Decimal::from(i.quantity))
            .sum(),
    )
}

fn replace_items(conn: &Connection, invoice_id: &str, items: &[ItemLine]) -> AppResult<()> {
    conn.execute("DELETE FROM invoice_items WHERE invoice_id = ?", [invoice_id])
        .map_err(db_delete)?;
    for i in items {
        conn.execute(
            "INSERT INTO invoice_items(id, invoice_id, service_id, quantity, unit_price)
             VALUES(?, ?, ?, ?, ?)",
            (
                new_id(),
                invoice_id,
                &i.service_id,
                i.quantity,
                i.unit_price.to_string(),
            ),
        )
        .map_err(db_insert)?;
    }
    Ok(())
}

fn positive_amount(p: &Params<'_>, key: &str) -> AppResult<Option<Decimal>> {
    match p.opt_decimal(key)? {
        Some(d) if d <= Decimal::ZERO => {
            Err(AppError::field(key, format!("{} must be greater than zero", key)))
        }
        other => Ok(other.map(calc::round2)),
    }
}

/// Status an invoice should carry given its receipt, if any.
fn settled_status(conn: &Connection, inv: &Invoice) -> AppResult<&'static str> {
    let paid: Option<String> = conn
        .query_row(
            "SELECT amount_paid FROM receipts WHERE invoice_id = ?",
            [&inv.id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let paid = paid.and_then(|s| calc::parse_decimal(&s).ok());
    match paid {
        Some(p) if p >= inv.current_amount => Ok(STATUS_PAID),
        _ => Ok(calc::unpaid_status(inv.due_date, today())),
    }
}

fn invoices_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let status = p.opt_choice("status", &INVOICE_STATUSES)?;
    let student = p.opt_str("student")?.map(|s| search_pattern(&s));
    let student_id = p.opt_str("studentId")?;

    billing::mark_overdue(conn, today())?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}, s.name, s.enrollment_no FROM invoices i
             JOIN students s ON s.id = i.student_id
             WHERE (?1 IS NULL OR i.status = ?1)
               AND (?2 IS NULL OR casefold(s.name) LIKE ?2 ESCAPE '\\')
               AND (?3 IS NULL OR i.student_id = ?3)
             ORDER BY i.issue_date DESC, i.number DESC",
            INVOICE_COLS
        ))
        .map_err(db_query)?;
    let rows = stmt
        .query_map((status, student, student_id), |r| {
            let mut v = Invoice::from_row(r)?.to_json();
            v["studentName"] = json!(r.get::<_, String>(11)?);
            v["enrollmentNo"] = json!(r.get::<_, String>(12)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "invoices": rows }))
}

fn invoices_get(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    billing::mark_overdue(conn, today())?;
    let inv = load_invoice(conn, &id)?;
    let student = load_student(conn, &inv.student_id)?;
    let receipt = conn
        .query_row(
            "SELECT id, number, payment_date, method, amount_paid FROM receipts WHERE invoice_id = ?",
            [&id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "number": r.get::<_, String>(1)?,
                    "paymentDate": r.get::<_, String>(2)?,
                    "method": r.get::<_, String>(3)?,
                    "amountPaid": money(dec_col(r, 4)?),
                }))
            },
        )
        .optional()
        .map_err(db_query)?;

    let mut v = inv.to_json();
    v["studentName"] = json!(student.name);
    v["enrollmentNo"] = json!(student.enrollment_no);
    v["items"] = json!(invoice_items_json(conn, &id)?);
    v["receipt"] = json!(receipt);
    Ok(v)
}

fn invoices_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);

    let student_id = p.req_str("studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let kind = p.req_choice("kind", &INVOICE_KINDS)?;
    let issue_date = p.date_or("issueDate", today())?;
    let due_date = p.req_date("dueDate")?;
    if due_date < issue_date {
        return Err(AppError::field("dueDate", "dueDate must not precede issueDate"));
    }

    let (amount, items) = if kind == KIND_ITEMIZED {
        let raw = p
            .opt_array("items")?
            .ok_or_else(|| AppError::field("items", "items are required for OUTRO invoices"))?;
        let items = parse_items(conn, raw)?;
        (items_total(&items), items)
    } else {
        if p.has("items") {
            return Err(AppError::field("items", "items are only allowed for OUTRO invoices"));
        }
        let amount = positive_amount(&p, "originalAmount")?.ok_or_else(|| {
            AppError::field("originalAmount", "originalAmount is required")
        })?;
        (amount, Vec::new())
    };

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let inv = Invoice {
        id: new_id(),
        number: billing::next_invoice_number(&tx, today().year())?,
        student_id,
        kind,
        issue_date,
        due_date,
        original_amount: amount,
        current_amount: amount,
        status: calc::unpaid_status(due_date, today()).to_string(),
        notes: p.opt_str("notes")?,
        created_at: now_ts(),
    };
    tx.execute(
        "INSERT INTO invoices(id, number, student_id, kind, issue_date, due_date, original_amount, current_amount, status, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &inv.id,
            &inv.number,
            &inv.student_id,
            &inv.kind,
            inv.issue_date.to_string(),
            inv.due_date.to_string(),
            inv.original_amount.to_string(),
            inv.current_amount.to_string(),
            &inv.status,
            &inv.notes,
            &inv.created_at,
        ),
    )
    .map_err(db_insert)?;
    replace_items(&tx, &inv.id, &items)?;
    billing::recompute_balance(&tx, &inv.student_id)?;
    tx.commit().map_err(db_commit)?;

    let mut v = inv.to_json();
    v["items"] = json!(invoice_items_json(conn, &inv.id)?);
    Ok(v)
}

fn invoices_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    for read_only in ["number", "studentId", "status"] {
        if patch.has(read_only) {
            return Err(AppError::field(read_only, format!("{} cannot be changed", read_only)));
        }
    }

    let cur = load_invoice(conn, &id)?;
    if cur.status == STATUS_PAID {
        return Err(AppError::Forbidden("a paid invoice cannot be edited".to_string()));
    }

    let kind = patch.choice_or("kind", &INVOICE_KINDS, cur.kind.clone())?;
    let issue_date = patch.date_or("issueDate", cur.issue_date)?;
    let due_date = patch.date_or("dueDate", cur.due_date)?;
    if due_date < issue_date {
        return Err(AppError::field("dueDate", "dueDate must not precede issueDate"));
    }

    // None keeps the stored items untouched.
    let (amount, items) = if kind == KIND_ITEMIZED {
        match patch.opt_array("items")? {
            Some(raw) => {
                let items = parse_items(conn, raw)?;
                (items_total(&items), Some(items))
            }
            None if cur.kind == KIND_ITEMIZED => (cur.original_amount, None),
            None => {
                return Err(AppError::field(
                    "items",
                    "items are required for OUTRO invoices",
                ))
            }
        }
    } else {
        if patch.has("items") {
            return Err(AppError::field("items", "items are only allowed for OUTRO invoices"));
        }
        let amount = match positive_amount(&patch, "originalAmount")? {
            Some(a) => a,
            None if cur.kind != KIND_ITEMIZED => cur.original_amount,
            None => {
                return Err(AppError::field(
                    "originalAmount",
                    "originalAmount is required",
                ))
            }
        };
        (amount, Some(Vec::new()))
    };

    let mut inv = Invoice {
        id: cur.id,
        number: cur.number,
        student_id: cur.student_id,
        kind,
        issue_date,
        due_date,
        original_amount: amount,
        current_amount: amount,
        status: cur.status,
        notes: patch.text_or("notes", cur.notes)?,
        created_at: cur.created_at,
    };

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    inv.status = settled_status(&tx, &inv)?.to_string();
    tx.execute(
        "UPDATE invoices SET kind = ?, issue_date = ?, due_date = ?, original_amount = ?, current_amount = ?,
            status = ?, notes = ?
         WHERE id = ?",
        (
            &inv.kind,
            inv.issue_date.to_string(),
            inv.due_date.to_string(),
            inv.original_amount.to_string(),
            inv.current_amount.to_string(),
            &inv.status,
            &inv.notes,
            &inv.id,
        ),
    )
    .map_err(db_update)?;
    if let Some(items) = items {
        replace_items(&tx, &inv.id, &items)?;
    }
    billing::recompute_balance(&tx, &inv.student_id)?;
    tx.commit().map_err(db_commit)?;

    let mut v = inv.to_json();
    v["items"] = json!(invoice_items_json(conn, &inv.id)?);
    Ok(v)
}

fn invoices_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    billing::mark_overdue(conn, today())?;
    let inv = load_invoice(conn, &id)?;
    if inv.status != STATUS_PENDING {
        return Err(AppError::Forbidden(format!(
            "only PENDENTE invoices can be deleted (this one is {})",
            inv.status
        )));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM receipts WHERE invoice_id = ?", [&id])
        .map_err(db_delete)?;
    tx.execute("DELETE FROM invoice_items WHERE invoice_id = ?", [&id])
        .map_err(db_delete)?;
    tx.execute("DELETE FROM invoices WHERE id = ?", [&id])
        .map_err(db_delete)?;
    billing::recompute_balance(&tx, &inv.student_id)?;
    tx.commit().map_err(db_commit)?;

    Ok(json!({ "id": id, "number": inv.number, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

fn receipt_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "number": r.get::<_, String>(1)?,
        "invoiceId": r.get::<_, String>(2)?,
        "paymentDate": r.get::<_, String>(3)?,
        "method": r.get::<_, String>(4)?,
        "amountPaid": money(dec_col(r, 5)?),
        "notes": r.get::<_, Option<String>>(6)?,
        "issuedBy": r.get::<_, Option<String>>(7)?,
        "createdAt": r.get::<_, String>(8)?,
        "invoiceNumber": r.get::<_, String>(9)?,
        "studentId": r.get::<_, String>(10)?,
        "studentName": r.get::<_, String>(11)?,
    }))
}

const RECEIPT_SELECT: &str = "SELECT r.id, r.number, r.invoice_id, r.payment_date, r.method, r.amount_paid,
        r.notes, r.issued_by, r.created_at, i.number, s.id, s.name
     FROM receipts r
     JOIN invoices i ON i.id = r.invoice_id
     JOIN students s ON s.id = i.student_id";

fn receipts_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let invoice_id = p.opt_str("invoiceId")?;
    let student_id = p.opt_str("studentId")?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE (?1 IS NULL OR r.invoice_id = ?1) AND (?2 IS NULL OR s.id = ?2)
             ORDER BY r.payment_date DESC, r.number DESC",
            RECEIPT_SELECT
        ))
        .map_err(db_query)?;
    let rows = stmt
        .query_map((invoice_id, student_id), receipt_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "receipts": rows }))
}

fn receipts_create(state: &AppState, params: &Value) -> AppResult<Value> {
    let me = require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let invoice_id = p.req_str("invoiceId")?;
    let payment_date = p.date_or("paymentDate", today())?;
    let method = p.req_choice("method", &PAYMENT_METHODS)?;
    let amount = positive_amount(&p, "amountPaid")?
        .ok_or_else(|| AppError::BadParams("missing amountPaid".to_string()))?;
    let notes = p.opt_str("notes")?;

    let inv = load_invoice(conn, &invoice_id)?;
    let existing = count(
        conn,
        "SELECT COUNT(*) FROM receipts WHERE invoice_id = ?",
        [&invoice_id],
    )?;
    if existing > 0 {
        return Err(AppError::Conflict("invoice already has a receipt".to_string()));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    let id = new_id();
    let number = billing::next_receipt_number(&tx, today().year())?;
    tx.execute(
        "INSERT INTO receipts(id, number, invoice_id, payment_date, method, amount_paid, notes, issued_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &number,
            &invoice_id,
            payment_date.to_string(),
            &method,
            amount.to_string(),
            &notes,
            &me.username,
            now_ts(),
        ),
    )
    .map_err(db_insert)?;
    let status = settled_status(&tx, &inv)?;
    tx.execute(
        "UPDATE invoices SET status = ? WHERE id = ?",
        (status, &invoice_id),
    )
    .map_err(db_update)?;
    let totals = billing::recompute_balance(&tx, &inv.student_id)?;
    tx.commit().map_err(db_commit)?;

    let mut v = conn
        .query_row(&format!("{} WHERE r.id = ?", RECEIPT_SELECT), [&id], receipt_json)
        .map_err(db_query)?;
    v["invoiceStatus"] = json!(status);
    v["balance"] = money(totals.balance);
    Ok(v)
}

fn receipts_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let (number, invoice_id): (String, String) = conn
        .query_row(
            "SELECT number, invoice_id FROM receipts WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("receipt not found".to_string()))?;
    let inv = load_invoice(conn, &invoice_id)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM receipts WHERE id = ?", [&id])
        .map_err(db_delete)?;
    let status = calc::unpaid_status(inv.due_date, today());
    tx.execute(
        "UPDATE invoices SET status = ? WHERE id = ?",
        (status, &invoice_id),
    )
    .map_err(db_update)?;
    billing::recompute_balance(&tx, &inv.student_id)?;
    tx.commit().map_err(db_commit)?;

    Ok(json!({ "id": id, "number": number, "invoiceStatus": status, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Running balances
// ---------------------------------------------------------------------------

fn balance_json(conn: &Connection, student_id: &str) -> AppResult<Value> {
    let row = conn
        .query_row(
            "SELECT total_debit, total_credit, balance, updated_at FROM balances WHERE student_id = ?",
            [student_id],
            |r| {
                Ok(json!({
                    "totalDebit": money(dec_col(r, 0)?),
                    "totalCredit": money(dec_col(r, 1)?),
                    "balance": money(dec_col(r, 2)?),
                    "updatedAt": r.get::<_, String>(3)?,
                }))
            },
        )
        .optional()
        .map_err(db_query)?;
    match row {
        Some(v) => Ok(v),
        None => {
            let t = billing::recompute_balance(conn, student_id)?;
            Ok(json!({
                "totalDebit": money(t.total_debit),
                "totalCredit": money(t.total_credit),
                "balance": money(t.balance),
                "updatedAt": now_ts(),
            }))
        }
    }
}

struct BalanceLine {
    student_id: String,
    enrollment_no: String,
    name: String,
    status: String,
    guardian: Option<String>,
    debit: Decimal,
    credit: Decimal,
    balance: Decimal,
}

impl BalanceLine {
    fn to_json(&self) -> Value {
        json!({
            "studentId": self.student_id,
            "enrollmentNo": self.enrollment_no,
            "studentName": self.name,
            "studentStatus": self.status,
            "guardianName": self.guardian,
            "totalDebit": money(self.debit),
            "totalCredit": money(self.credit),
            "balance": money(self.balance),
        })
    }
}

/// Students with a positive balance; `status` defaults to ATIVO, "" means any.
fn open_balances(conn: &Connection, p: &Params<'_>) -> AppResult<Vec<BalanceLine>> {
    let student = p.opt_str("student")?.map(|s| search_pattern(&s));
    let status = if p.has("status") {
        p.opt_choice("status", &STUDENT_STATUSES)?
    } else {
        Some("ATIVO".to_string())
    };
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.enrollment_no, s.name, s.status, g.name,
                    b.total_debit, b.total_credit, b.balance
             FROM balances b
             JOIN students s ON s.id = b.student_id
             LEFT JOIN guardians g ON g.id = s.guardian_id
             WHERE (?1 IS NULL OR casefold(s.name) LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR s.status = ?2)
             ORDER BY s.name",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map((student, status), |r| {
            Ok(BalanceLine {
                student_id: r.get(0)?,
                enrollment_no: r.get(1)?,
                name: r.get(2)?,
                status: r.get(3)?,
                guardian: r.get(4)?,
                debit: dec_col(r, 5)?,
                credit: dec_col(r, 6)?,
                balance: dec_col(r, 7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows
        .into_iter()
        .filter(|b| b.balance > Decimal::ZERO)
        .collect())
}

fn balances_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let rows = open_balances(conn, &Params::of(params))?;
    Ok(json!({ "balances": rows.iter().map(BalanceLine::to_json).collect::<Vec<_>>() }))
}

fn balances_get(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let student_id = Params::of(params).req_str("studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let mut v = balance_json(conn, &student_id)?;
    v["studentId"] = json!(student_id);
    Ok(v)
}

fn balances_recompute(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let ids: Vec<String> = match Params::of(params).opt_str("studentId")? {
        Some(id) => {
            ensure_exists(conn, "students", &id, "student")?;
            vec![id]
        }
        None => {
            let mut stmt = conn.prepare("SELECT id FROM students").map_err(db_query)?;
            let ids = stmt
                .query_map([], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_query)?;
            ids
        }
    };

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for id in &ids {
        billing::recompute_balance(&tx, id)?;
    }
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "recomputed": ids.len() }))
}

// ---------------------------------------------------------------------------
// Pre-enrollments
// ---------------------------------------------------------------------------

const PRE_ENROLLMENT_SELECT: &str = "SELECT p.id, p.student_id, s.name, p.class_id, c.name, p.status,
        p.requested_on, p.notes, p.decided_at, p.decided_by
     FROM pre_enrollments p
     JOIN students s ON s.id = p.student_id
     JOIN classes c ON c.id = p.class_id";

fn pre_enrollment_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "classId": r.get::<_, String>(3)?,
        "className": r.get::<_, String>(4)?,
        "status": r.get::<_, String>(5)?,
        "requestedOn": r.get::<_, String>(6)?,
        "notes": r.get::<_, Option<String>>(7)?,
        "decidedAt": r.get::<_, Option<String>>(8)?,
        "decidedBy": r.get::<_, Option<String>>(9)?,
    }))
}

fn load_pre_enrollment(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(
        &format!("{} WHERE p.id = ?", PRE_ENROLLMENT_SELECT),
        [id],
        pre_enrollment_json,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("pre-enrollment not found".to_string()))
}

fn ensure_pending(pre: &Value) -> AppResult<()> {
    if pre["status"] != STATUS_PENDING {
        return Err(AppError::Conflict(format!(
            "pre-enrollment is already {}",
            pre["status"].as_str().unwrap_or("decided")
        )));
    }
    Ok(())
}

fn pre_enrollments_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let status = Params::of(params).opt_choice("status", &PRE_ENROLLMENT_STATUSES)?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE (?1 IS NULL OR p.status = ?1) ORDER BY p.requested_on DESC, s.name",
            PRE_ENROLLMENT_SELECT
        ))
        .map_err(db_query)?;
    let rows = stmt
        .query_map([status], pre_enrollment_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "preEnrollments": rows }))
}

fn pre_enrollments_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let student_id = p.req_str("studentId")?;
    let class_id = p.req_str("classId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    ensure_exists(conn, "classes", &class_id, "class")?;
    let open = count(
        conn,
        "SELECT COUNT(*) FROM pre_enrollments WHERE student_id = ? AND class_id = ? AND status = 'PENDENTE'",
        [&student_id, &class_id],
    )?;
    if open > 0 {
        return Err(AppError::Conflict(
            "a pending pre-enrollment already exists for this class".to_string(),
        ));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO pre_enrollments(id, student_id, class_id, status, requested_on, notes)
         VALUES(?, ?, ?, 'PENDENTE', ?, ?)",
        (
            &id,
            &student_id,
            &class_id,
            p.date_or("requestedOn", today())?.to_string(),
            p.opt_str("notes")?,
        ),
    )
    .map_err(db_insert)?;
    load_pre_enrollment(conn, &id)
}

fn pre_enrollments_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_pre_enrollment(conn, &id)?;
    ensure_pending(&cur)?;

    let class_id = patch.str_or("classId", cur["classId"].as_str().unwrap_or_default().to_string())?;
    ensure_exists(conn, "classes", &class_id, "class")?;
    let notes = patch.text_or("notes", cur["notes"].as_str().map(|s| s.to_string()))?;
    conn.execute(
        "UPDATE pre_enrollments SET class_id = ?, notes = ? WHERE id = ?",
        (&class_id, &notes, &id),
    )
    .map_err(db_update)?;
    load_pre_enrollment(conn, &id)
}

fn pre_enrollments_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let cur = load_pre_enrollment(conn, &id)?;
    ensure_pending(&cur)?;
    conn.execute("DELETE FROM pre_enrollments WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "deleted": true }))
}

fn pre_enrollments_decide(state: &AppState, params: &Value, approve: bool) -> AppResult<Value> {
    let me = require(state, SEC)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let cur = load_pre_enrollment(conn, &id)?;
    ensure_pending(&cur)?;
    let student_id = cur["studentId"].as_str().unwrap_or_default();
    let class_id = cur["classId"].as_str().unwrap_or_default();

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "UPDATE pre_enrollments SET status = ?, decided_at = ?, decided_by = ? WHERE id = ?",
        (
            if approve { "APROVADA" } else { "RECUSADA" },
            now_ts(),
            &me.username,
            &id,
        ),
    )
    .map_err(db_update)?;
    if approve {
        tx.execute(
            "INSERT OR IGNORE INTO enrollments(id, student_id, class_id, status, enrolled_on)
             VALUES(?, ?, ?, 'ATIVO', ?)",
            (new_id(), student_id, class_id, today().to_string()),
        )
        .map_err(db_insert)?;
    }
    tx.commit().map_err(db_commit)?;
    load_pre_enrollment(conn, &id)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

fn reports_invoices(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let month = p.opt_i64("month")?;
    if let Some(m) = month {
        if !(1..=12).contains(&m) {
            return Err(AppError::field("month", "month must be in 1..=12"));
        }
    }
    let year = p.opt_i64("year")?;
    let status = p.opt_choice("status", &INVOICE_STATUSES)?;
    let student = p.opt_str("student")?.map(|s| search_pattern(&s));
    let format = export_format(&p)?;

    billing::mark_overdue(conn, today())?;

    let month_str = month.map(|m| format!("{:02}", m));
    let year_str = year.map(|y| format!("{:04}", y));
    let binds: Vec<&dyn ToSql> = vec![&month_str, &year_str, &status, &student];
    let mut stmt = conn
        .prepare(
            "SELECT i.id, i.number, s.name, g.name, i.issue_date, i.due_date,
                    i.original_amount, i.current_amount, i.status
             FROM invoices i
             JOIN students s ON s.id = i.student_id
             LEFT JOIN guardians g ON g.id = s.guardian_id
             WHERE (?1 IS NULL OR strftime('%m', i.issue_date) = ?1)
               AND (?2 IS NULL OR strftime('%Y', i.issue_date) = ?2)
               AND (?3 IS NULL OR i.status = ?3)
               AND (?4 IS NULL OR casefold(s.name) LIKE ?4 ESCAPE '\\')
             ORDER BY i.issue_date DESC, i.number DESC",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                dec_col(r, 6)?,
                dec_col(r, 7)?,
                r.get::<_, String>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let mut services: BTreeMap<String, Vec<String>> = BTreeMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT ii.invoice_id, s.description FROM invoice_items ii
                 JOIN services s ON s.id = ii.service_id ORDER BY s.code",
            )
            .map_err(db_query)?;
        let pairs = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?;
        for (inv, desc) in pairs {
            services.entry(inv).or_default().push(desc);
        }
    }

    let total: Decimal = rows.iter().map(|r| r.7).sum();
    match format {
        ExportFormat::Json => {
            let lines: Vec<Value> = rows
                .iter()
                .map(|(id, number, student, guardian, issue, due, original, current, status)| {
                    json!({
                        "id": id,
                        "number": number,
                        "studentName": student,
                        "guardianName": guardian,
                        "issueDate": issue,
                        "dueDate": due,
                        "originalAmount": money(*original),
                        "currentAmount": money(*current),
                        "status": status,
                        "services": services.get(id).cloned().unwrap_or_default(),
                    })
                })
                .collect();
            Ok(json!({ "invoices": lines, "total": money(total) }))
        }
        ExportFormat::Csv => {
            let csv_rows: Vec<Vec<String>> = rows
                .iter()
                .map(|(id, number, student, guardian, issue, due, original, current, status)| {
                    vec![
                        number.clone(),
                        student.clone(),
                        guardian.clone().unwrap_or_default(),
                        issue.clone(),
                        due.clone(),
                        calc::round2(*original).to_string(),
                        calc::round2(*current).to_string(),
                        status.clone(),
                        services.get(id).map(|v| v.join("; ")).unwrap_or_default(),
                    ]
                })
                .collect();
            let doc = reports::csv_document(
                &[
                    "number", "student", "guardian", "issue", "due", "original", "current",
                    "status", "services",
                ],
                &csv_rows,
            );
            let out = export_path(state, &p, "secretaria/relatorios", "faturas")?;
            reports::write_text(&out, &doc)?;
            Ok(json!({
                "path": out.to_string_lossy(),
                "rowsExported": csv_rows.len(),
                "total": money(total),
            }))
        }
    }
}

fn reports_balances(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, SEC)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let format = export_format(&p)?;
    let rows = open_balances(conn, &p)?;
    let total: Decimal = rows.iter().map(|b| b.balance).sum();

    match format {
        ExportFormat::Json => Ok(json!({
            "balances": rows.iter().map(BalanceLine::to_json).collect::<Vec<_>>(),
            "total": money(total),
        })),
        ExportFormat::Csv => {
            let csv_rows: Vec<Vec<String>> = rows
                .iter()
                .map(|b| {
                    vec![
                        b.enrollment_no.clone(),
                        b.name.clone(),
                        b.guardian.clone().unwrap_or_default(),
                        b.status.clone(),
                        calc::round2(b.debit).to_string(),
                        calc::round2(b.credit).to_string(),
                        calc::round2(b.balance).to_string(),
                    ]
                })
                .collect();
            let doc = reports::csv_document(
                &[
                    "enrollment", "student", "guardian", "status", "debit", "credit", "balance",
                ],
                &csv_rows,
            );
            let out = export_path(state, &p, "secretaria/relatorios", "conta_corrente")?;
            reports::write_text(&out, &doc)?;
            Ok(json!({
                "path": out.to_string_lossy(),
                "rowsExported": csv_rows.len(),
                "total": money(total),
            }))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let p = &req.params;
    let result = match req.method.as_str() {
        "guardians.list" => guardians_list(state, p),
        "guardians.create" => guardians_create(state, p),
        "guardians.update" => guardians_update(state, p),
        "guardians.delete" => guardians_delete(state, p),
        "students.list" => students_list(state, p),
        "students.get" => students_get(state, p),
        "students.create" => students_create(state, p),
        "students.update" => students_update(state, p),
        "students.delete" => students_delete(state, p),
        "services.list" => services_list(state, p),
        "services.create" => services_create(state, p),
        "services.update" => services_update(state, p),
        "services.delete" => services_delete(state, p),
        "invoices.list" => invoices_list(state, p),
        "invoices.get" => invoices_get(state, p),
        "invoices.create" => invoices_create(state, p),
        "invoices.update" => invoices_update(state, p),
        "invoices.delete" => invoices_delete(state, p),
        "receipts.list" => receipts_list(state, p),
        "receipts.create" => receipts_create(state, p),
        "receipts.delete" => receipts_delete(state, p),
        "balances.list" => balances_list(state, p),
        "balances.get" => balances_get(state, p),
        "balances.recompute" => balances_recompute(state, p),
        "preEnrollments.list" => pre_enrollments_list(state, p),
        "preEnrollments.create" => pre_enrollments_create(state, p),
        "preEnrollments.update" => pre_enrollments_update(state, p),
        "preEnrollments.delete" => pre_enrollments_delete(state, p),
        "preEnrollments.approve" => pre_enrollments_decide(state, p, true),
        "preEnrollments.reject" => pre_enrollments_decide(state, p, false),
        "reports.invoices" => reports_invoices(state, p),
        "reports.balances" => reports_balances(state, p),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
