use chrono::Datelike;
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

    fn err_code(&mut self, method: &str, params: Value) -> String {
        let resp = self.call(method, params);
        assert_eq!(resp["ok"], json!(false), "{} unexpectedly succeeded: {}", method, resp);
        resp["error"]["code"].as_str().unwrap_or("").to_string()
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

fn amount(v: &Value) -> f64 {
    v.as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or_else(|| panic!("not a decimal string: {}", v))
}

fn str_of(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_else(|| panic!("missing {} in {}", key, v)).to_string()
}

fn seed_family(sc: &mut Sidecar) -> (String, String) {
    let guardian = sc.ok(
        "guardians.create",
        json!({
            "name": "Maria Silva", "phone": "+244 923 456 789",
            "email": "maria@familia.ao", "relationship": "Mãe"
        }),
    );
    let student = sc.ok(
        "students.create",
        json!({
            "name": "Ana Silva", "birthDate": "2010-04-02", "gender": "F",
            "guardianId": str_of(&guardian, "id")
        }),
    );
    (str_of(&guardian, "id"), str_of(&student, "id"))
}

#[test]
fn invoices_receipts_and_running_balance() {
    let workspace = temp_dir("escola-billing");
    let mut sc = Sidecar::open_as_admin(&workspace);
    let year = chrono::Local::now().year();
    let due = format!("{}-12-31", year + 1);

    let (_, student_id) = seed_family(&mut sc);
    let second = sc.ok(
        "students.create",
        json!({ "name": "Rui Silva", "birthDate": "2012-01-20", "gender": "M" }),
    );
    assert_eq!(str_of(&second, "enrollmentNo"), format!("{}0002", year));

    let first = sc.ok(
        "invoices.create",
        json!({
            "studentId": student_id, "kind": "MENSALIDADE",
            "originalAmount": "15000", "dueDate": due
        }),
    );
    assert_eq!(str_of(&first, "number"), format!("{}/0001", year));
    assert_eq!(first["status"], json!("PENDENTE"));

    let second_inv = sc.ok(
        "invoices.create",
        json!({
            "studentId": student_id, "kind": "MATERIAL",
            "originalAmount": "10000.50", "dueDate": due
        }),
    );
    assert_eq!(str_of(&second_inv, "number"), format!("{}/0002", year));

    let balance = sc.ok("balances.get", json!({ "studentId": student_id }));
    assert_eq!(amount(&balance["totalDebit"]), 25000.50);
    assert_eq!(amount(&balance["balance"]), 25000.50);

    let receipt = sc.ok(
        "receipts.create",
        json!({
            "invoiceId": str_of(&first, "id"), "method": "DINHEIRO", "amountPaid": "15000"
        }),
    );
    assert_eq!(str_of(&receipt, "number"), format!("REC/{}/0001", year));
    assert_eq!(receipt["invoiceStatus"], json!("PAGO"));
    assert_eq!(receipt["issuedBy"], json!("admin"));
    assert_eq!(amount(&receipt["balance"]), 10000.50);

    assert_eq!(
        sc.err_code(
            "receipts.create",
            json!({ "invoiceId": str_of(&first, "id"), "method": "DINHEIRO", "amountPaid": "1" })
        ),
        "conflict"
    );
    assert_eq!(
        sc.err_code(
            "invoices.update",
            json!({ "id": str_of(&first, "id"), "patch": { "notes": "x" } })
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("invoices.delete", json!({ "id": str_of(&first, "id") })),
        "forbidden"
    );

    sc.ok("receipts.delete", json!({ "id": str_of(&receipt, "id") }));
    let reverted = sc.ok("invoices.get", json!({ "id": str_of(&first, "id") }));
    assert_eq!(reverted["status"], json!("PENDENTE"));
    let balance = sc.ok("balances.get", json!({ "studentId": student_id }));
    assert_eq!(amount(&balance["balance"]), 25000.50);

    sc.ok("invoices.delete", json!({ "id": str_of(&second_inv, "id") }));
    let balance = sc.ok("balances.get", json!({ "studentId": student_id }));
    assert_eq!(amount(&balance["balance"]), 15000.0);
}

#[test]
fn itemized_and_overdue_invoices() {
    let workspace = temp_dir("escola-billing-items");
    let mut sc = Sidecar::open_as_admin(&workspace);
    let (guardian_id, student_id) = seed_family(&mut sc);

    let uniform = sc.ok(
        "services.create",
        json!({ "code": "UNI", "description": "Uniforme", "price": "2500" }),
    );
    let books = sc.ok(
        "services.create",
        json!({ "code": "LIV", "description": "Livros", "price": "1200.25" }),
    );

    assert_eq!(
        sc.err_code(
            "invoices.create",
            json!({ "studentId": student_id, "kind": "OUTRO", "dueDate": "2099-01-31" })
        ),
        "validation_failed"
    );
    assert_eq!(
        sc.err_code(
            "invoices.create",
            json!({
                "studentId": student_id, "kind": "OUTRO", "dueDate": "2099-01-31",
                "items": [
                    { "serviceId": str_of(&uniform, "id") },
                    { "serviceId": str_of(&uniform, "id"), "quantity": 2 }
                ]
            })
        ),
        "validation_failed"
    );

    let itemized = sc.ok(
        "invoices.create",
        json!({
            "studentId": student_id, "kind": "OUTRO", "dueDate": "2099-01-31",
            "items": [
                { "serviceId": str_of(&uniform, "id"), "quantity": 2 },
                { "serviceId": str_of(&books, "id") }
            ]
        }),
    );
    assert_eq!(amount(&itemized["originalAmount"]), 6200.25);
    assert_eq!(itemized["items"].as_array().map(|a| a.len()), Some(2));

    assert_eq!(
        sc.err_code("services.delete", json!({ "id": str_of(&uniform, "id") })),
        "conflict"
    );

    let late = sc.ok(
        "invoices.create",
        json!({
            "studentId": student_id, "kind": "MENSALIDADE", "originalAmount": "9000",
            "issueDate": "2020-01-01", "dueDate": "2020-01-31"
        }),
    );
    assert_eq!(late["status"], json!("VENCIDO"));

    let overdue = sc.ok("invoices.list", json!({ "status": "VENCIDO" }));
    assert_eq!(overdue["invoices"].as_array().map(|a| a.len()), Some(1));

    assert_eq!(
        sc.err_code("guardians.delete", json!({ "id": guardian_id })),
        "conflict"
    );
    assert_eq!(
        sc.err_code(
            "students.update",
            json!({ "id": student_id, "patch": { "enrollmentNo": "19990001" } })
        ),
        "validation_failed"
    );

    let sent = sc.ok("notifications.notifyOverdue", json!({}));
    assert_eq!(sent["guardians"], json!(1));
    assert_eq!(sent["invoices"], json!(1));
    assert_eq!(sent["emailsFailed"], json!(1));
    assert_eq!(sent["whatsappFailed"], json!(1));

    let logs = sc.ok("notifications.list", json!({ "status": "FAILURE" }));
    let channels: Vec<&str> = logs["notifications"]
        .as_array()
        .expect("notifications")
        .iter()
        .filter_map(|n| n["channel"].as_str())
        .collect();
    assert!(channels.contains(&"EMAIL"));
    assert!(channels.contains(&"WHATSAPP"));

    let csv_path = workspace.join("exports").join("faturas.csv");
    let report = sc.ok(
        "reports.invoices",
        json!({ "format": "csv", "outPath": csv_path.to_string_lossy() }),
    );
    assert_eq!(report["rowsExported"], json!(2));
    let text = std::fs::read_to_string(&csv_path).expect("read csv");
    assert!(text.starts_with("number,student,guardian"));
    assert!(text.contains("Uniforme; Livros") || text.contains("Livros; Uniforme"));

    let balances = sc.ok("reports.balances", json!({}));
    assert_eq!(amount(&balances["total"]), 15200.25);
}

#[test]
fn student_deletion_cascades_billing() {
    let workspace = temp_dir("escola-billing-cascade");
    let mut sc = Sidecar::open_as_admin(&workspace);
    let (guardian_id, student_id) = seed_family(&mut sc);
    let inv = sc.ok(
        "invoices.create",
        json!({
            "studentId": student_id, "kind": "MATRICULA",
            "originalAmount": "5000", "dueDate": "2099-02-01"
        }),
    );
    sc.ok(
        "receipts.create",
        json!({ "invoiceId": str_of(&inv, "id"), "method": "CHEQUE", "amountPaid": "5000" }),
    );

    sc.ok("students.delete", json!({ "id": student_id }));
    assert_eq!(sc.err_code("students.get", json!({ "id": student_id })), "not_found");
    assert_eq!(
        sc.ok("receipts.list", json!({}))["receipts"].as_array().map(|a| a.len()),
        Some(0)
    );
    sc.ok("guardians.delete", json!({ "id": guardian_id }));
}

fn names(v: &Value, key: &str) -> Vec<String> {
    v[key]
        .as_array()
        .unwrap_or_else(|| panic!("no {} in {}", key, v))
        .iter()
        .filter_map(|r| r["name"].as_str().or_else(|| r["studentName"].as_str()))
        .map(|s| s.to_string())
        .collect()
}

#[test]
fn name_searches_fold_accents_and_case() {
    let workspace = temp_dir("escola-search");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let guardian = sc.ok(
        "guardians.create",
        json!({ "name": "Conceição Gonçalves", "phone": "923111222", "relationship": "Avó" }),
    );
    let angela = sc.ok(
        "students.create",
        json!({
            "name": "Ângela Silva", "birthDate": "2011-05-06", "gender": "F",
            "guardianId": str_of(&guardian, "id")
        }),
    );
    sc.ok(
        "students.create",
        json!({ "name": "Ana Silva", "birthDate": "2012-07-08", "gender": "F" }),
    );

    for query in ["Ângela", "ângela", "ÂNGELA", "gela sil"] {
        let found = sc.ok("students.list", json!({ "search": query }));
        assert_eq!(names(&found, "students"), vec!["Ângela Silva"], "search {}", query);
    }
    let ana = sc.ok("students.list", json!({ "search": "ana" }));
    assert_eq!(names(&ana, "students"), vec!["Ana Silva"]);
    let both = sc.ok("students.list", json!({ "search": "SILVA" }));
    assert_eq!(names(&both, "students").len(), 2);
    let literal = sc.ok("students.list", json!({ "search": "%" }));
    assert_eq!(names(&literal, "students").len(), 0);

    let guardians = sc.ok("guardians.list", json!({ "search": "GONÇALVES" }));
    assert_eq!(names(&guardians, "guardians"), vec!["Conceição Gonçalves"]);

    sc.ok(
        "invoices.create",
        json!({
            "studentId": str_of(&angela, "id"), "kind": "MENSALIDADE",
            "originalAmount": "7000", "dueDate": "2099-03-31"
        }),
    );
    let invoices = sc.ok("invoices.list", json!({ "student": "âng" }));
    assert_eq!(invoices["invoices"].as_array().map(|a| a.len()), Some(1));
    let balances = sc.ok("balances.list", json!({ "student": "ÂNGELA" }));
    assert_eq!(balances["balances"].as_array().map(|a| a.len()), Some(1));
    let report = sc.ok("reports.invoices", json!({ "student": "ângela silva" }));
    assert_eq!(amount(&report["total"]), 7000.0);
}
