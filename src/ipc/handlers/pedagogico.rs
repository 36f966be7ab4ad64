use crate::auth::PED;
use crate::calc;
use crate::config;
use crate::error::{
    db_commit, db_delete, db_insert, db_query, db_tx, db_update, AppError, AppResult,
};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    count, date_col, db_conn, ensure_exists, export_format, export_path, new_id, now_ts,
    opt_dec_col, require, today, workspace, ExportFormat, Params,
};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const LEVELS: [&str; 4] = ["10º Ano", "11º Ano", "12º Ano", "13º Ano"];
const SHIFTS: [&str; 3] = ["MANHÃ", "TARDE", "NOITE"];
const ENROLLMENT_STATUSES: [&str; 3] = ["ATIVO", "TRANSFERIDO", "DESLIGADO"];
const EVENT_KINDS: [&str; 5] = ["AULA", "FERIADO", "EXAME", "EVENTO", "OUTRO"];

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

fn active_year_id(conn: &Connection) -> AppResult<Option<String>> {
    conn.query_row(
        "SELECT id FROM academic_years WHERE active = 1",
        [],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query)
}

// ---------------------------------------------------------------------------
// Academic years
// ---------------------------------------------------------------------------

struct Year {
    id: String,
    name: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    active: bool,
}

impl Year {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            start_date: date_col(r, 2)?,
            end_date: date_col(r, 3)?,
            active: r.get::<_, i64>(4)? != 0,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "startDate": self.start_date.to_string(),
            "endDate": self.end_date.to_string(),
            "active": self.active,
        })
    }
}

const YEAR_SELECT: &str = "SELECT id, name, start_date, end_date, active FROM academic_years";

fn load_year(conn: &Connection, id: &str) -> AppResult<Year> {
    conn.query_row(&format!("{} WHERE id = ?", YEAR_SELECT), [id], Year::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("academic year not found".to_string()))
}

fn check_year(conn: &Connection, y: &Year) -> AppResult<()> {
    if y.start_date > y.end_date {
        return Err(AppError::field("endDate", "endDate must not precede startDate"));
    }
    if y.active {
        let others = count(
            conn,
            "SELECT COUNT(*) FROM academic_years WHERE active = 1 AND id <> ?",
            [&y.id],
        )?;
        if others > 0 {
            return Err(AppError::Conflict(
                "another academic year is already active".to_string(),
            ));
        }
    }
    Ok(())
}

fn years_list(state: &AppState) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let rows = collect(
        conn,
        &format!("{} ORDER BY start_date DESC", YEAR_SELECT),
        [],
        Year::from_row,
    )?;
    Ok(json!({ "years": rows.iter().map(Year::to_json).collect::<Vec<_>>() }))
}

fn years_active(state: &AppState) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let year = match active_year_id(conn)? {
        Some(id) => Some(load_year(conn, &id)?.to_json()),
        None => None,
    };
    Ok(json!({ "year": year }))
}

fn years_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let y = Year {
        id: new_id(),
        name: p.req_str("name")?,
        start_date: p.req_date("startDate")?,
        end_date: p.req_date("endDate")?,
        active: p.bool_or("active", false)?,
    };
    check_year(conn, &y)?;
    conn.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date, active) VALUES(?, ?, ?, ?, ?)",
        (
            &y.id,
            &y.name,
            y.start_date.to_string(),
            y.end_date.to_string(),
            y.active as i64,
        ),
    )
    .map_err(db_insert)?;
    Ok(y.to_json())
}

fn years_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_year(conn, &id)?;
    let y = Year {
        id: cur.id,
        name: patch.str_or("name", cur.name)?,
        start_date: patch.date_or("startDate", cur.start_date)?,
        end_date: patch.date_or("endDate", cur.end_date)?,
        active: patch.bool_or("active", cur.active)?,
    };
    check_year(conn, &y)?;
    conn.execute(
        "UPDATE academic_years SET name = ?, start_date = ?, end_date = ?, active = ? WHERE id = ?",
        (
            &y.name,
            y.start_date.to_string(),
            y.end_date.to_string(),
            y.active as i64,
            &y.id,
        ),
    )
    .map_err(db_update)?;
    Ok(y.to_json())
}

fn years_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let y = load_year(conn, &id)?;
    if y.active {
        return Err(AppError::Conflict(
            "the active academic year cannot be deleted".to_string(),
        ));
    }
    let classes = count(
        conn,
        "SELECT COUNT(*) FROM classes WHERE academic_year_id = ?",
        [&id],
    )?;
    let exercises = count(
        conn,
        "SELECT COUNT(*) FROM exercises WHERE academic_year_id = ?",
        [&id],
    )?;
    if classes > 0 || exercises > 0 {
        return Err(AppError::Conflict(
            "academic year still has classes or exercise history".to_string(),
        ));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM calendar_events WHERE academic_year_id = ?", [&id])
        .map_err(db_delete)?;
    tx.execute("DELETE FROM academic_years WHERE id = ?", [&id])
        .map_err(db_delete)?;
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "id": id, "name": y.name, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

struct Class {
    id: String,
    name: String,
    level: String,
    shift: String,
    head_teacher: Option<String>,
    academic_year_id: Option<String>,
}

const CLASS_SELECT: &str = "SELECT c.id, c.name, c.level, c.shift, c.head_teacher, c.academic_year_id,
        y.name,
        (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id AND e.status = 'ATIVO')
     FROM classes c LEFT JOIN academic_years y ON y.id = c.academic_year_id";

impl Class {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            level: r.get(2)?,
            shift: r.get(3)?,
            head_teacher: r.get(4)?,
            academic_year_id: r.get(5)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "level": self.level,
            "shift": self.shift,
            "headTeacher": self.head_teacher,
            "academicYearId": self.academic_year_id,
        })
    }
}

fn class_row_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let mut v = Class::from_row(r)?.to_json();
    v["academicYearName"] = json!(r.get::<_, Option<String>>(6)?);
    v["activeStudents"] = json!(r.get::<_, i64>(7)?);
    Ok(v)
}

fn load_class(conn: &Connection, id: &str) -> AppResult<Class> {
    conn.query_row(&format!("{} WHERE c.id = ?", CLASS_SELECT), [id], Class::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("class not found".to_string()))
}

fn load_class_json(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(&format!("{} WHERE c.id = ?", CLASS_SELECT), [id], class_row_json)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("class not found".to_string()))
}

fn classes_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let year_id = match p.opt_str("academicYearId")? {
        Some(id) => Some(id),
        None if p.bool_or("all", false)? => None,
        None => active_year_id(conn)?,
    };
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR c.academic_year_id = ?1) ORDER BY c.level, c.name",
            CLASS_SELECT
        ),
        [year_id],
        class_row_json,
    )?;
    Ok(json!({ "classes": rows }))
}

fn classes_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let academic_year_id = match p.opt_str("academicYearId")? {
        Some(id) => {
            ensure_exists(conn, "academic_years", &id, "academic year")?;
            Some(id)
        }
        None => active_year_id(conn)?,
    };
    let c = Class {
        id: new_id(),
        name: p.req_str("name")?,
        level: p.req_choice("level", &LEVELS)?,
        shift: p.req_choice("shift", &SHIFTS)?,
        head_teacher: p.opt_str("headTeacher")?,
        academic_year_id,
    };
    conn.execute(
        "INSERT INTO classes(id, name, level, shift, head_teacher, academic_year_id) VALUES(?, ?, ?, ?, ?, ?)",
        (&c.id, &c.name, &c.level, &c.shift, &c.head_teacher, &c.academic_year_id),
    )
    .map_err(db_insert)?;
    load_class_json(conn, &c.id)
}

fn classes_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_class(conn, &id)?;
    let c = Class {
        id: cur.id,
        name: patch.str_or("name", cur.name)?,
        level: patch.choice_or("level", &LEVELS, cur.level)?,
        shift: patch.choice_or("shift", &SHIFTS, cur.shift)?,
        head_teacher: patch.text_or("headTeacher", cur.head_teacher)?,
        academic_year_id: patch.text_or("academicYearId", cur.academic_year_id)?,
    };
    if let Some(y) = c.academic_year_id.as_deref() {
        ensure_exists(conn, "academic_years", y, "academic year")?;
    }
    conn.execute(
        "UPDATE classes SET name = ?, level = ?, shift = ?, head_teacher = ?, academic_year_id = ? WHERE id = ?",
        (&c.name, &c.level, &c.shift, &c.head_teacher, &c.academic_year_id, &c.id),
    )
    .map_err(db_update)?;
    load_class_json(conn, &c.id)
}

fn classes_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let c = load_class(conn, &id)?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for sql in [
        "DELETE FROM grades WHERE class_id = ?",
        "DELETE FROM enrollments WHERE class_id = ?",
        "DELETE FROM pre_enrollments WHERE class_id = ?",
        "DELETE FROM class_subjects WHERE class_id = ?",
        "DELETE FROM report_cards WHERE class_id = ?",
        "DELETE FROM classes WHERE id = ?",
    ] {
        tx.execute(sql, [&id]).map_err(db_delete)?;
    }
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "id": id, "name": c.name, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Subjects and class subjects
// ---------------------------------------------------------------------------

fn subject_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "workloadHours": r.get::<_, i64>(2)?,
    }))
}

fn load_subject(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(
        "SELECT id, name, workload_hours FROM subjects WHERE id = ?",
        [id],
        subject_json,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("subject not found".to_string()))
}

fn workload(p: &Params<'_>, current: i64) -> AppResult<i64> {
    let hours = p.opt_i64("workloadHours")?.unwrap_or(current);
    if hours < 0 {
        return Err(AppError::field("workloadHours", "workloadHours must not be negative"));
    }
    Ok(hours)
}

fn subjects_list(state: &AppState) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let rows = collect(
        conn,
        "SELECT id, name, workload_hours FROM subjects ORDER BY name",
        [],
        subject_json,
    )?;
    Ok(json!({ "subjects": rows }))
}

fn subjects_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = new_id();
    conn.execute(
        "INSERT INTO subjects(id, name, workload_hours) VALUES(?, ?, ?)",
        (&id, p.req_str("name")?, workload(&p, 0)?),
    )
    .map_err(db_insert)?;
    load_subject(conn, &id)
}

fn subjects_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_subject(conn, &id)?;
    let name = patch.str_or("name", cur["name"].as_str().unwrap_or_default().to_string())?;
    let hours = workload(&patch, cur["workloadHours"].as_i64().unwrap_or(0))?;
    conn.execute(
        "UPDATE subjects SET name = ?, workload_hours = ? WHERE id = ?",
        (&name, hours, &id),
    )
    .map_err(db_update)?;
    load_subject(conn, &id)
}

fn subjects_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let cur = load_subject(conn, &id)?;
    let graded = count(conn, "SELECT COUNT(*) FROM grades WHERE subject_id = ?", [&id])?;
    if graded > 0 {
        return Err(AppError::Conflict(format!(
            "subject has {} grade(s) recorded",
            graded
        )));
    }
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute("DELETE FROM class_subjects WHERE subject_id = ?", [&id])
        .map_err(db_delete)?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&id])
        .map_err(db_delete)?;
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "id": id, "name": cur["name"], "deleted": true }))
}

const CLASS_SUBJECT_SELECT: &str = "SELECT cs.id, cs.class_id, c.name, cs.subject_id, s.name, s.workload_hours
     FROM class_subjects cs
     JOIN classes c ON c.id = cs.class_id
     JOIN subjects s ON s.id = cs.subject_id";

fn class_subject_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "classId": r.get::<_, String>(1)?,
        "className": r.get::<_, String>(2)?,
        "subjectId": r.get::<_, String>(3)?,
        "subjectName": r.get::<_, String>(4)?,
        "workloadHours": r.get::<_, i64>(5)?,
    }))
}

fn class_subjects_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let class_id = Params::of(params).opt_str("classId")?;
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR cs.class_id = ?1) ORDER BY c.name, s.name",
            CLASS_SUBJECT_SELECT
        ),
        [class_id],
        class_subject_json,
    )?;
    Ok(json!({ "classSubjects": rows }))
}

fn class_subjects_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let class_id = p.req_str("classId")?;
    let subject_id = p.req_str("subjectId")?;
    ensure_exists(conn, "classes", &class_id, "class")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO class_subjects(id, class_id, subject_id) VALUES(?, ?, ?)",
        (&id, &class_id, &subject_id),
    )
    .map_err(db_insert)?;
    conn.query_row(
        &format!("{} WHERE cs.id = ?", CLASS_SUBJECT_SELECT),
        [&id],
        class_subject_json,
    )
    .map_err(db_query)
}

fn class_subjects_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let n = conn
        .execute("DELETE FROM class_subjects WHERE id = ?", [&id])
        .map_err(db_delete)?;
    if n == 0 {
        return Err(AppError::NotFound("class subject not found".to_string()));
    }
    Ok(json!({ "id": id, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Enrollments
// ---------------------------------------------------------------------------

const ENROLLMENT_SELECT: &str = "SELECT e.id, e.student_id, s.name, s.enrollment_no, e.class_id, c.name,
        e.status, e.enrolled_on
     FROM enrollments e
     JOIN students s ON s.id = e.student_id
     JOIN classes c ON c.id = e.class_id";

fn enrollment_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "enrollmentNo": r.get::<_, String>(3)?,
        "classId": r.get::<_, String>(4)?,
        "className": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "enrolledOn": r.get::<_, String>(7)?,
    }))
}

fn load_enrollment(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(
        &format!("{} WHERE e.id = ?", ENROLLMENT_SELECT),
        [id],
        enrollment_json,
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| AppError::NotFound("enrollment not found".to_string()))
}

fn enrollments_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let class_id = p.opt_str("classId")?;
    let student_id = p.opt_str("studentId")?;
    let status = p.opt_choice("status", &ENROLLMENT_STATUSES)?;
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR e.class_id = ?1)
               AND (?2 IS NULL OR e.student_id = ?2)
               AND (?3 IS NULL OR e.status = ?3)
             ORDER BY c.name, s.name",
            ENROLLMENT_SELECT
        ),
        (class_id, student_id, status),
        enrollment_json,
    )?;
    Ok(json!({ "enrollments": rows }))
}

fn enrollments_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let student_id = p.req_str("studentId")?;
    let class_id = p.req_str("classId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    ensure_exists(conn, "classes", &class_id, "class")?;
    let status = p
        .opt_choice("status", &ENROLLMENT_STATUSES)?
        .unwrap_or_else(|| "ATIVO".to_string());
    let enrolled_on = p.date_or("enrolledOn", today())?;

    let id = new_id();
    conn.execute(
        "INSERT INTO enrollments(id, student_id, class_id, status, enrolled_on) VALUES(?, ?, ?, ?, ?)",
        (&id, &student_id, &class_id, &status, enrolled_on.to_string()),
    )
    .map_err(db_insert)?;
    load_enrollment(conn, &id)
}

fn enrollments_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_enrollment(conn, &id)?;
    let status = patch.choice_or(
        "status",
        &ENROLLMENT_STATUSES,
        cur["status"].as_str().unwrap_or("ATIVO").to_string(),
    )?;
    let enrolled_on = match patch.opt_date("enrolledOn")? {
        Some(d) => d.to_string(),
        None => cur["enrolledOn"].as_str().unwrap_or_default().to_string(),
    };
    conn.execute(
        "UPDATE enrollments SET status = ?, enrolled_on = ? WHERE id = ?",
        (&status, &enrolled_on, &id),
    )
    .map_err(db_update)?;
    load_enrollment(conn, &id)
}

fn enrollments_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let cur = load_enrollment(conn, &id)?;
    let n = conn
        .execute("DELETE FROM enrollments WHERE id = ?", [&id])
        .map_err(db_delete)?;
    if n == 0 {
        return Err(AppError::NotFound("enrollment not found".to_string()));
    }
    Ok(json!({ "id": id, "studentName": cur["studentName"], "deleted": true }))
}

// ---------------------------------------------------------------------------
// Grades
// ---------------------------------------------------------------------------

struct Grade {
    id: String,
    student_id: String,
    class_id: String,
    subject_id: String,
    marks: [Decimal; 3],
    summary: Option<calc::GradeSummary>,
    remark: Option<String>,
    updated_at: String,
}

impl Grade {
    fn to_json(&self) -> Value {
        let fmt = |d: Decimal| calc::round2(d).to_string();
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "classId": self.class_id,
            "subjectId": self.subject_id,
            "n1": fmt(self.marks[0]),
            "n2": fmt(self.marks[1]),
            "n3": fmt(self.marks[2]),
            "partialAvg": self.summary.map(|s| fmt(s.partial_avg)),
            "finalAvg": self.summary.map(|s| fmt(s.final_avg)),
            "outcome": self.summary.map(|s| s.outcome.as_str()),
            "remark": self.remark,
            "updatedAt": self.updated_at,
        })
    }
}

const GRADE_SELECT: &str = "SELECT g.id, g.student_id, g.class_id, g.subject_id, g.n1, g.n2, g.n3,
        g.partial_avg, g.final_avg, g.outcome, g.remark, g.updated_at, st.name, su.name
     FROM grades g
     JOIN students st ON st.id = g.student_id
     JOIN subjects su ON su.id = g.subject_id";

fn grade_from_row(r: &Row<'_>) -> rusqlite::Result<Grade> {
    let mark = |idx: usize| -> rusqlite::Result<Decimal> {
        Ok(opt_dec_col(r, idx)?.unwrap_or(Decimal::ZERO))
    };
    let partial = opt_dec_col(r, 7)?;
    let final_avg = opt_dec_col(r, 8)?;
    let outcome: Option<String> = r.get(9)?;
    let summary = match (partial, final_avg, outcome.as_deref()) {
        (Some(partial_avg), Some(final_avg), Some(o)) => Some(calc::GradeSummary {
            partial_avg,
            final_avg,
            outcome: if o == calc::Outcome::Approved.as_str() {
                calc::Outcome::Approved
            } else {
                calc::Outcome::Failed
            },
        }),
        _ => None,
    };
    Ok(Grade {
        id: r.get(0)?,
        student_id: r.get(1)?,
        class_id: r.get(2)?,
        subject_id: r.get(3)?,
        marks: [mark(4)?, mark(5)?, mark(6)?],
        summary,
        remark: r.get(10)?,
        updated_at: r.get(11)?,
    })
}

fn grade_row_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let mut v = grade_from_row(r)?.to_json();
    v["studentName"] = json!(r.get::<_, String>(12)?);
    v["subjectName"] = json!(r.get::<_, String>(13)?);
    Ok(v)
}

fn load_grade(conn: &Connection, id: &str) -> AppResult<Grade> {
    conn.query_row(&format!("{} WHERE g.id = ?", GRADE_SELECT), [id], grade_from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("grade not found".to_string()))
}

fn load_grade_json(conn: &Connection, id: &str) -> AppResult<Value> {
    conn.query_row(&format!("{} WHERE g.id = ?", GRADE_SELECT), [id], grade_row_json)
        .map_err(db_query)
}

/// Recomputes averages and outcome from the marks with the workspace's
/// grading settings.
fn summarize(conn: &Connection, marks: [Decimal; 3]) -> AppResult<calc::GradeSummary> {
    let g = config::grading_settings(conn).map_err(db_query)?;
    calc::grade_summary(marks, g.weights, g.pass_mark).map_err(|m| {
        let field = m.split_whitespace().next().unwrap_or("grades").to_string();
        AppError::field(&field, m)
    })
}

fn save_grade(conn: &Connection, g: &Grade, insert: bool) -> AppResult<()> {
    let summary = g
        .summary
        .ok_or_else(|| AppError::Internal("grade saved without averages".to_string()))?;
    let values = (
        g.marks[0].to_string(),
        g.marks[1].to_string(),
        g.marks[2].to_string(),
        summary.partial_avg.to_string(),
        summary.final_avg.to_string(),
        summary.outcome.as_str(),
        &g.remark,
        &g.updated_at,
        &g.id,
    );
    if insert {
        conn.execute(
            "INSERT INTO grades(n1, n2, n3, partial_avg, final_avg, outcome, remark, updated_at, id, student_id, class_id, subject_id)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            (
                values.0,
                values.1,
                values.2,
                values.3,
                values.4,
                values.5,
                values.6,
                values.7,
                values.8,
                &g.student_id,
                &g.class_id,
                &g.subject_id,
            ),
        )
        .map_err(db_insert)?;
    } else {
        conn.execute(
            "UPDATE grades SET n1 = ?1, n2 = ?2, n3 = ?3, partial_avg = ?4, final_avg = ?5, outcome = ?6,
                remark = ?7, updated_at = ?8
             WHERE id = ?9",
            values,
        )
        .map_err(db_update)?;
    }
    Ok(())
}

fn grades_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR g.class_id = ?1)
               AND (?2 IS NULL OR g.student_id = ?2)
               AND (?3 IS NULL OR g.subject_id = ?3)
             ORDER BY st.name, su.name",
            GRADE_SELECT
        ),
        (
            p.opt_str("classId")?,
            p.opt_str("studentId")?,
            p.opt_str("subjectId")?,
        ),
        grade_row_json,
    )?;
    Ok(json!({ "grades": rows }))
}

fn grades_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let student_id = p.req_str("studentId")?;
    let class_id = p.req_str("classId")?;
    let subject_id = p.req_str("subjectId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    ensure_exists(conn, "classes", &class_id, "class")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let enrolled = count(
        conn,
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ? AND class_id = ?",
        [&student_id, &class_id],
    )?;
    if enrolled == 0 {
        return Err(AppError::validation("student is not enrolled in this class"));
    }

    let marks = [p.req_decimal("n1")?, p.req_decimal("n2")?, p.req_decimal("n3")?];
    let g = Grade {
        id: new_id(),
        student_id,
        class_id,
        subject_id,
        marks,
        summary: Some(summarize(conn, marks)?),
        remark: p.opt_str("remark")?,
        updated_at: now_ts(),
    };
    save_grade(conn, &g, true)?;
    load_grade_json(conn, &g.id)
}

fn grades_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    for fixed in ["studentId", "classId", "subjectId"] {
        if patch.has(fixed) {
            return Err(AppError::field(fixed, format!("{} cannot be changed", fixed)));
        }
    }
    let cur = load_grade(conn, &id)?;
    let marks = [
        patch.decimal_or("n1", cur.marks[0])?,
        patch.decimal_or("n2", cur.marks[1])?,
        patch.decimal_or("n3", cur.marks[2])?,
    ];
    let g = Grade {
        summary: Some(summarize(conn, marks)?),
        marks,
        remark: patch.text_or("remark", cur.remark)?,
        updated_at: now_ts(),
        ..cur
    };
    save_grade(conn, &g, false)?;
    load_grade_json(conn, &g.id)
}

fn grades_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    load_grade(conn, &id)?;
    conn.execute("DELETE FROM grades WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "deleted": true }))
}

// ---------------------------------------------------------------------------
// Report cards
// ---------------------------------------------------------------------------

fn report_card_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "classId": r.get::<_, String>(1)?,
        "className": r.get::<_, String>(2)?,
        "term": r.get::<_, i64>(3)?,
        "filePath": r.get::<_, String>(4)?,
        "generatedBy": r.get::<_, Option<String>>(5)?,
        "generatedAt": r.get::<_, String>(6)?,
    }))
}

const REPORT_CARD_SELECT: &str = "SELECT rc.id, rc.class_id, c.name, rc.term, rc.file_path, rc.generated_by, rc.generated_at
     FROM report_cards rc JOIN classes c ON c.id = rc.class_id";

fn report_cards_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let class_id = Params::of(params).opt_str("classId")?;
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR rc.class_id = ?1) ORDER BY c.name, rc.term",
            REPORT_CARD_SELECT
        ),
        [class_id],
        report_card_json,
    )?;
    Ok(json!({ "reportCards": rows }))
}

/// Render model for one class and term: every active student with one line
/// per class subject.
fn report_card_model(conn: &Connection, class_id: &str, term: i64) -> AppResult<Value> {
    let class = load_class_json(conn, class_id)?;
    let subjects = collect(
        conn,
        "SELECT s.id, s.name FROM class_subjects cs JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ? ORDER BY s.name",
        [class_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )?;
    let students = collect(
        conn,
        "SELECT s.id, s.enrollment_no, s.name FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.class_id = ? AND e.status = 'ATIVO' ORDER BY s.name",
        [class_id],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        },
    )?;
    let mut grades: BTreeMap<(String, String), Grade> = BTreeMap::new();
    for g in collect(
        conn,
        &format!("{} WHERE g.class_id = ?", GRADE_SELECT),
        [class_id],
        grade_from_row,
    )? {
        grades.insert((g.student_id.clone(), g.subject_id.clone()), g);
    }

    let mut lines = Vec::with_capacity(students.len());
    for (student_id, enrollment_no, name) in &students {
        let mut finals = Vec::new();
        let mut all_approved = true;
        let rows: Vec<Value> = subjects
            .iter()
            .map(|(subject_id, subject_name)| {
                let g = grades.get(&(student_id.clone(), subject_id.clone()));
                let summary = g.and_then(|g| g.summary);
                match summary {
                    Some(s) => {
                        finals.push(s.final_avg);
                        all_approved &= s.outcome == calc::Outcome::Approved;
                    }
                    None => all_approved = false,
                }
                let mut v = match g {
                    Some(g) => g.to_json(),
                    None => json!({ "n1": null, "n2": null, "n3": null, "partialAvg": null, "finalAvg": null, "outcome": null }),
                };
                v["subject"] = json!(subject_name);
                v
            })
            .collect();
        let average = if finals.is_empty() {
            None
        } else {
            let sum: Decimal = finals.iter().copied().sum();
            Some(calc::round2(sum / Decimal::from(finals.len() as u64)).to_string())
        };
        let outcome = if !subjects.is_empty() && all_approved {
            calc::Outcome::Approved
        } else {
            calc::Outcome::Failed
        };
        lines.push(json!({
            "studentId": student_id,
            "enrollmentNo": enrollment_no,
            "name": name,
            "subjects": rows,
            "average": average,
            "outcome": outcome.as_str(),
        }));
    }

    Ok(json!({
        "institution": config::institution_name(conn).map_err(db_query)?,
        "class": class,
        "term": term,
        "generatedAt": now_ts(),
        "subjects": subjects.iter().map(|(_, n)| n).collect::<Vec<_>>(),
        "students": lines,
    }))
}

fn report_cards_generate(state: &AppState, params: &Value) -> AppResult<Value> {
    let me = require(state, PED)?;
    let conn = db_conn(state)?;
    let ws = workspace(state)?;
    let p = Params::of(params);
    let class_id = p.req_str("classId")?;
    let term = p.req_i64("term")?;
    if !(1..=3).contains(&term) {
        return Err(AppError::field("term", "term must be 1, 2 or 3"));
    }
    let class = load_class(conn, &class_id)?;

    let model = report_card_model(conn, &class_id, term)?;
    let stem = format!("boletim_{}_{}", reports::slug(&class.name), term);
    let path = reports::write_render_model(ws, "pedagogico/boletins", &stem, &model)?;
    let path_str = path.to_string_lossy().to_string();

    let generated_at = now_ts();
    conn.execute(
        "INSERT INTO report_cards(id, class_id, term, file_path, generated_by, generated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, term) DO UPDATE SET
           file_path = excluded.file_path,
           generated_by = excluded.generated_by,
           generated_at = excluded.generated_at",
        (new_id(), &class_id, term, &path_str, &me.username, &generated_at),
    )
    .map_err(db_insert)?;

    Ok(json!({
        "classId": class_id,
        "name": class.name,
        "term": term,
        "filePath": path_str,
        "generatedAt": generated_at,
        "students": model["students"].as_array().map(|a| a.len()).unwrap_or(0),
    }))
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

struct Event {
    id: String,
    academic_year_id: String,
    event_date: NaiveDate,
    title: String,
    kind: String,
    description: Option<String>,
}

const EVENT_SELECT: &str = "SELECT id, academic_year_id, event_date, title, kind, description FROM calendar_events";

impl Event {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            academic_year_id: r.get(1)?,
            event_date: date_col(r, 2)?,
            title: r.get(3)?,
            kind: r.get(4)?,
            description: r.get(5)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "academicYearId": self.academic_year_id,
            "date": self.event_date.to_string(),
            "title": self.title,
            "kind": self.kind,
            "description": self.description,
        })
    }
}

fn load_event(conn: &Connection, id: &str) -> AppResult<Event> {
    conn.query_row(&format!("{} WHERE id = ?", EVENT_SELECT), [id], Event::from_row)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| AppError::NotFound("calendar event not found".to_string()))
}

fn check_event(conn: &Connection, e: &Event) -> AppResult<()> {
    let y = load_year(conn, &e.academic_year_id)?;
    if e.event_date < y.start_date || e.event_date > y.end_date {
        return Err(AppError::field(
            "date",
            format!("date must fall within academic year {}", y.name),
        ));
    }
    Ok(())
}

fn year_or_active(conn: &Connection, p: &Params<'_>) -> AppResult<String> {
    match p.opt_str("academicYearId")? {
        Some(id) => Ok(id),
        None => active_year_id(conn)?
            .ok_or_else(|| AppError::validation("no active academic year; pass academicYearId")),
    }
}

fn calendar_list(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let year_id = p.opt_str("academicYearId")?;
    let from = p.opt_date("from")?.map(|d| d.to_string());
    let to = p.opt_date("to")?.map(|d| d.to_string());
    let rows = collect(
        conn,
        &format!(
            "{} WHERE (?1 IS NULL OR academic_year_id = ?1)
               AND (?2 IS NULL OR event_date >= ?2)
               AND (?3 IS NULL OR event_date <= ?3)
             ORDER BY event_date, title",
            EVENT_SELECT
        ),
        (year_id, from, to),
        Event::from_row,
    )?;
    Ok(json!({ "events": rows.iter().map(Event::to_json).collect::<Vec<_>>() }))
}

fn calendar_create(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let e = Event {
        id: new_id(),
        academic_year_id: year_or_active(conn, &p)?,
        event_date: p.req_date("date")?,
        title: p.req_str("title")?,
        kind: p.req_choice("kind", &EVENT_KINDS)?,
        description: p.opt_str("description")?,
    };
    check_event(conn, &e)?;
    conn.execute(
        "INSERT INTO calendar_events(id, academic_year_id, event_date, title, kind, description)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &e.id,
            &e.academic_year_id,
            e.event_date.to_string(),
            &e.title,
            &e.kind,
            &e.description,
        ),
    )
    .map_err(db_insert)?;
    Ok(e.to_json())
}

fn calendar_update(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let id = p.req_str("id")?;
    let patch = p.object("patch")?;
    let cur = load_event(conn, &id)?;
    let e = Event {
        id: cur.id,
        academic_year_id: patch.str_or("academicYearId", cur.academic_year_id)?,
        event_date: patch.date_or("date", cur.event_date)?,
        title: patch.str_or("title", cur.title)?,
        kind: patch.choice_or("kind", &EVENT_KINDS, cur.kind)?,
        description: patch.text_or("description", cur.description)?,
    };
    check_event(conn, &e)?;
    conn.execute(
        "UPDATE calendar_events SET academic_year_id = ?, event_date = ?, title = ?, kind = ?, description = ?
         WHERE id = ?",
        (
            &e.academic_year_id,
            e.event_date.to_string(),
            &e.title,
            &e.kind,
            &e.description,
            &e.id,
        ),
    )
    .map_err(db_update)?;
    Ok(e.to_json())
}

fn calendar_delete(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let id = Params::of(params).req_str("id")?;
    let e = load_event(conn, &id)?;
    conn.execute("DELETE FROM calendar_events WHERE id = ?", [&id])
        .map_err(db_delete)?;
    Ok(json!({ "id": id, "title": e.title, "deleted": true }))
}

/// Events of one month grouped by day.
fn calendar_month(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let year = p.req_i64("year")?;
    let month = p.req_i64("month")?;
    let reference = format!("{:04}-{:02}", year, month);
    let first = calc::parse_reference_month(&reference).map_err(|m| AppError::field("month", m))?;
    let year_id = p.opt_str("academicYearId")?;

    let events = collect(
        conn,
        &format!(
            "{} WHERE substr(event_date, 1, 7) = ?1 AND (?2 IS NULL OR academic_year_id = ?2)
             ORDER BY event_date, title",
            EVENT_SELECT
        ),
        (&reference, year_id),
        Event::from_row,
    )?;
    let mut days: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for e in &events {
        days.entry(e.event_date.to_string())
            .or_default()
            .push(e.to_json());
    }
    let days: Vec<Value> = days
        .into_iter()
        .map(|(date, events)| json!({ "date": date, "events": events }))
        .collect();

    Ok(json!({
        "year": year,
        "month": month,
        "label": calc::month_label(&reference),
        "firstDay": first.to_string(),
        "days": days,
    }))
}

// ---------------------------------------------------------------------------
// Year report
// ---------------------------------------------------------------------------

fn reports_year(state: &AppState, params: &Value) -> AppResult<Value> {
    require(state, PED)?;
    let conn = db_conn(state)?;
    let p = Params::of(params);
    let year_id = year_or_active(conn, &p)?;
    let year = load_year(conn, &year_id)?;
    let format = export_format(&p)?;

    let classes = collect(
        conn,
        "SELECT c.id, c.name, c.level, c.shift,
            (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id AND e.status = 'ATIVO'),
            (SELECT COUNT(*) FROM grades g WHERE g.class_id = c.id),
            (SELECT COUNT(*) FROM grades g WHERE g.class_id = c.id AND g.outcome = 'APROVADO'),
            (SELECT COUNT(*) FROM grades g WHERE g.class_id = c.id AND g.outcome = 'REPROVADO')
         FROM classes c WHERE c.academic_year_id = ? ORDER BY c.level, c.name",
        [&year_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, String>(2)?,
                "shift": r.get::<_, String>(3)?,
                "activeStudents": r.get::<_, i64>(4)?,
                "grades": r.get::<_, i64>(5)?,
                "approved": r.get::<_, i64>(6)?,
                "failed": r.get::<_, i64>(7)?,
            }))
        },
    )?;

    let grade_rows = collect(
        conn,
        "SELECT c.name, st.enrollment_no, st.name, su.name, g.n1, g.n2, g.n3,
                g.partial_avg, g.final_avg, g.outcome
         FROM grades g
         JOIN classes c ON c.id = g.class_id
         JOIN students st ON st.id = g.student_id
         JOIN subjects su ON su.id = g.subject_id
         WHERE c.academic_year_id = ?
         ORDER BY c.name, st.name, su.name",
        [&year_id],
        |r| {
            let mut cells = Vec::with_capacity(10);
            for idx in 0..10 {
                cells.push(r.get::<_, Option<String>>(idx)?.unwrap_or_default());
            }
            Ok(cells)
        },
    )?;

    match format {
        ExportFormat::Json => Ok(json!({
            "year": year.to_json(),
            "classes": classes,
            "gradesRecorded": grade_rows.len(),
        })),
        ExportFormat::Csv => {
            let doc = reports::csv_document(
                &[
                    "class", "enrollment", "student", "subject", "n1", "n2", "n3", "partial",
                    "final", "outcome",
                ],
                &grade_rows,
            );
            let out = export_path(
                state,
                &p,
                "pedagogico/relatorios",
                &format!("ano_{}", reports::slug(&year.name)),
            )?;
            reports::write_text(&out, &doc)?;
            Ok(json!({
                "path": out.to_string_lossy(),
                "rowsExported": grade_rows.len(),
            }))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let p = &req.params;
    let result = match req.method.as_str() {
        "years.list" => years_list(state),
        "years.active" => years_active(state),
        "years.create" => years_create(state, p),
        "years.update" => years_update(state, p),
        "years.delete" => years_delete(state, p),
        "classes.list" => classes_list(state, p),
        "classes.create" => classes_create(state, p),
        "classes.update" => classes_update(state, p),
        "classes.delete" => classes_delete(state, p),
        "subjects.list" => subjects_list(state),
        "subjects.create" => subjects_create(state, p),
        "subjects.update" => subjects_update(state, p),
        "subjects.delete" => subjects_delete(state, p),
        "classSubjects.list" => class_subjects_list(state, p),
        "classSubjects.create" => class_subjects_create(state, p),
        "classSubjects.delete" => class_subjects_delete(state, p),
        "enrollments.list" => enrollments_list(state, p),
        "enrollments.create" => enrollments_create(state, p),
        "enrollments.update" => enrollments_update(state, p),
        "enrollments.delete" => enrollments_delete(state, p),
        "grades.list" => grades_list(state, p),
        "grades.create" => grades_create(state, p),
        "grades.update" => grades_update(state, p),
        "grades.delete" => grades_delete(state, p),
        "reportCards.list" => report_cards_list(state, p),
        "reportCards.generate" => report_cards_generate(state, p),
        "calendar.list" => calendar_list(state, p),
        "calendar.create" => calendar_create(state, p),
        "calendar.update" => calendar_update(state, p),
        "calendar.delete" => calendar_delete(state, p),
        "calendar.month" => calendar_month(state, p),
        "reports.year" => reports_year(state, p),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
