use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn spawn() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_escolad"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn escolad");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let payload = json!({ "id": self.next_id.to_string(), "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        serde_json::from_str(line.trim()).expect("parse response json")
    }

    fn ok(&mut self, method: &str, params: Value) -> Value {
        let resp = self.call(method, params);
        assert_eq!(resp["ok"], json!(true), "{} failed: {}", method, resp);
        resp["result"].clone()
    }

    fn err(&mut self, method: &str, params: Value) -> Value {
        let resp = self.call(method, params);
        assert_eq!(resp["ok"], json!(false), "{} unexpectedly succeeded: {}", method, resp);
        resp["error"].clone()
    }

    fn open_as_admin(workspace: &PathBuf) -> Self {
        let mut sc = Self::spawn();
        sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        sc.ok(
            "auth.bootstrap",
            json!({ "username": "admin", "password": "admin-pass-1" }),
        );
        sc.ok(
            "auth.login",
            json!({ "username": "admin", "password": "admin-pass-1" }),
        );
        sc
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn id_of(v: &Value) -> String {
    v["id"].as_str().unwrap_or_else(|| panic!("no id in {}", v)).to_string()
}

#[test]
fn only_one_academic_year_is_active() {
    let workspace = temp_dir("escola-years");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let current = sc.ok(
        "years.create",
        json!({ "name": "2026/2027", "startDate": "2026-09-01", "endDate": "2027-07-31", "active": true }),
    );
    let e = sc.err(
        "years.create",
        json!({ "name": "2027/2028", "startDate": "2027-09-01", "endDate": "2028-07-31", "active": true }),
    );
    assert_eq!(e["code"], json!("conflict"));
    let next = sc.ok(
        "years.create",
        json!({ "name": "2027/2028", "startDate": "2027-09-01", "endDate": "2028-07-31" }),
    );
    let e = sc.err(
        "years.create",
        json!({ "name": "bad", "startDate": "2027-09-01", "endDate": "2027-01-01" }),
    );
    assert_eq!(e["details"]["field"], json!("endDate"));

    assert_eq!(sc.ok("years.active", json!({}))["year"]["id"], json!(id_of(&current)));
    assert_eq!(
        sc.err("years.update", json!({ "id": id_of(&next), "patch": { "active": true } }))["code"],
        json!("conflict")
    );
    assert_eq!(
        sc.err("years.delete", json!({ "id": id_of(&current) }))["code"],
        json!("conflict")
    );
    sc.ok("years.delete", json!({ "id": id_of(&next) }));
}

#[test]
fn grades_report_cards_and_calendar() {
    let workspace = temp_dir("escola-grades");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let year = sc.ok(
        "years.create",
        json!({ "name": "2026/2027", "startDate": "2026-09-01", "endDate": "2027-07-31", "active": true }),
    );
    let class = sc.ok(
        "classes.create",
        json!({ "name": "10A", "level": "10º Ano", "shift": "MANHÃ" }),
    );
    assert_eq!(class["academicYearId"], json!(id_of(&year)));
    let math = sc.ok("subjects.create", json!({ "name": "Matemática", "workloadHours": 4 }));
    sc.ok(
        "classSubjects.create",
        json!({ "classId": id_of(&class), "subjectId": id_of(&math) }),
    );
    let student = sc.ok(
        "students.create",
        json!({ "name": "Ana Silva", "birthDate": "2010-04-02", "gender": "F" }),
    );

    let marks = json!({
        "studentId": id_of(&student), "classId": id_of(&class), "subjectId": id_of(&math),
        "n1": "12", "n2": "14", "n3": "15"
    });
    assert_eq!(sc.err("grades.create", marks.clone())["code"], json!("validation_failed"));
    sc.ok(
        "enrollments.create",
        json!({ "studentId": id_of(&student), "classId": id_of(&class) }),
    );

    let mut out_of_range = marks.clone();
    out_of_range["n1"] = json!("21");
    assert_eq!(sc.err("grades.create", out_of_range)["details"]["field"], json!("n1"));

    let grade = sc.ok("grades.create", marks.clone());
    assert_eq!(grade["partialAvg"], json!("13.67"));
    assert_eq!(grade["finalAvg"], json!("13.67"));
    assert_eq!(grade["outcome"], json!("APROVADO"));
    assert_eq!(sc.err("grades.create", marks)["code"], json!("conflict"));

    let failed = sc.ok(
        "grades.update",
        json!({ "id": id_of(&grade), "patch": { "n1": "2", "n2": "3" } }),
    );
    assert_eq!(failed["partialAvg"], json!("6.67"));
    assert_eq!(failed["outcome"], json!("REPROVADO"));

    sc.ok(
        "config.update",
        json!({ "section": "grading", "patch": { "passMark": "6" } }),
    );
    let lenient = sc.ok(
        "grades.update",
        json!({ "id": id_of(&grade), "patch": { "remark": "recuperou" } }),
    );
    assert_eq!(lenient["outcome"], json!("APROVADO"));

    assert_eq!(
        sc.err("subjects.delete", json!({ "id": id_of(&math) }))["code"],
        json!("conflict")
    );

    assert_eq!(
        sc.err("reportCards.generate", json!({ "classId": id_of(&class), "term": 4 }))["code"],
        json!("validation_failed")
    );
    let card = sc.ok(
        "reportCards.generate",
        json!({ "classId": id_of(&class), "term": 1 }),
    );
    assert_eq!(card["students"], json!(1));
    let model: Value = serde_json::from_str(
        &std::fs::read_to_string(card["filePath"].as_str().expect("filePath")).expect("read model"),
    )
    .expect("model json");
    assert_eq!(model["students"][0]["outcome"], json!("APROVADO"));
    assert_eq!(model["students"][0]["subjects"][0]["subject"], json!("Matemática"));
    sc.ok("reportCards.generate", json!({ "classId": id_of(&class), "term": 1 }));
    let cards = sc.ok("reportCards.list", json!({ "classId": id_of(&class) }));
    assert_eq!(cards["reportCards"].as_array().map(|a| a.len()), Some(1));

    assert_eq!(
        sc.err(
            "calendar.create",
            json!({ "date": "2028-01-10", "title": "Fora", "kind": "EVENTO" })
        )["code"],
        json!("validation_failed")
    );
    sc.ok(
        "calendar.create",
        json!({ "date": "2026-10-05", "title": "Dia do Professor", "kind": "FERIADO" }),
    );
    sc.ok(
        "calendar.create",
        json!({ "date": "2026-10-20", "title": "Prova", "kind": "EXAME" }),
    );
    let month = sc.ok("calendar.month", json!({ "year": 2026, "month": 10 }));
    assert_eq!(month["days"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(month["firstDay"], json!("2026-10-01"));

    let dash = sc.ok("dashboard.get", json!({}));
    assert_eq!(dash["counters"]["students"], json!(1));

    sc.ok("classes.delete", json!({ "id": id_of(&class) }));
    assert_eq!(
        sc.ok("grades.list", json!({}))["grades"].as_array().map(|a| a.len()),
        Some(0)
    );
}
