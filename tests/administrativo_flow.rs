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

fn id_of(v: &Value) -> String {
    v["id"].as_str().unwrap_or_else(|| panic!("no id in {}", v)).to_string()
}

#[test]
fn payroll_computes_and_renders_payslips() {
    let workspace = temp_dir("escola-payroll");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let staff = sc.ok(
        "staff.create",
        json!({
            "name": "João Neto", "document": "004567LA041", "position": "Contabilista",
            "department": "TESOURARIA", "hiredOn": "2022-02-01", "baseSalary": "17600"
        }),
    );

    let slip = sc.ok(
        "payroll.create",
        json!({
            "staffId": id_of(&staff), "referenceMonth": "2026-03",
            "overtimeHours": "10", "bonuses": "500", "deductions": "100"
        }),
    );
    assert_eq!(amount(&slip["baseSalary"]), 17600.0);
    assert_eq!(amount(&slip["hourlyRate"]), 100.0);
    assert_eq!(amount(&slip["overtimePay"]), 1500.0);
    assert_eq!(amount(&slip["gross"]), 19500.0);
    assert_eq!(amount(&slip["inss"]), 1560.0);
    assert_eq!(amount(&slip["irt"]), 2925.0);
    assert_eq!(amount(&slip["net"]), 15015.0);
    let file = slip["filePath"].as_str().expect("filePath");
    assert!(std::path::Path::new(file).is_file());

    assert_eq!(
        sc.err_code(
            "payroll.create",
            json!({ "staffId": id_of(&staff), "referenceMonth": "2026-03" })
        ),
        "conflict"
    );
    let holerites = workspace.join("media").join("administrativo").join("holerites");
    assert_eq!(std::fs::read_dir(&holerites).expect("holerites").count(), 1);
    assert_eq!(
        sc.err_code(
            "payroll.create",
            json!({ "staffId": id_of(&staff), "referenceMonth": "2026-13" })
        ),
        "validation_failed"
    );
    let overdrawn = sc.call(
        "payroll.create",
        json!({ "staffId": id_of(&staff), "referenceMonth": "2026-04", "deductions": "20000" }),
    );
    assert_eq!(overdrawn["error"]["code"], json!("validation_failed"));
    assert_eq!(overdrawn["error"]["details"]["field"], json!("deductions"));
    assert_eq!(std::fs::read_dir(&holerites).expect("holerites").count(), 1);

    let updated = sc.ok(
        "payroll.update",
        json!({ "id": id_of(&slip), "patch": { "overtimeHours": "0", "bonuses": "0", "deductions": "0" } }),
    );
    assert_eq!(amount(&updated["gross"]), 17600.0);
    assert_eq!(amount(&updated["net"]), 13552.0);

    assert_eq!(sc.err_code("staff.delete", json!({ "id": id_of(&staff) })), "conflict");

    let csv = workspace.join("out").join("folha.csv");
    let report = sc.ok(
        "reports.payroll",
        json!({ "year": 2026, "format": "csv", "outPath": csv.to_string_lossy() }),
    );
    assert_eq!(report["rowsExported"], json!(1));
    assert!(std::fs::read_to_string(&csv).expect("csv").contains("João Neto"));
}

#[test]
fn assets_depreciate_to_zero() {
    let workspace = temp_dir("escola-assets");
    let mut sc = Sidecar::open_as_admin(&workspace);

    assert_eq!(
        sc.err_code(
            "assets.create",
            json!({
                "description": "Carrinha", "category": "VEICULOS", "acquisitionValue": "12000",
                "acquiredOn": "2024-01-15", "usefulLifeYears": 0
            })
        ),
        "validation_failed"
    );
    sc.ok(
        "assets.create",
        json!({
            "description": "Carrinha", "category": "VEICULOS", "acquisitionValue": "12000",
            "acquiredOn": "2024-01-15", "usefulLifeYears": 5
        }),
    );

    let run = sc.ok("assets.depreciate", json!({ "asOf": "2025-01-15" }));
    assert_eq!(run["updated"], json!(1));
    let asset = &run["assets"][0];
    assert_eq!(asset["monthsElapsed"], json!(12));
    assert_eq!(amount(&asset["accumulatedDepreciation"]), 2400.0);
    assert_eq!(amount(&asset["netBookValue"]), 9600.0);

    let later = sc.ok("assets.depreciate", json!({ "asOf": "2035-06-01" }));
    assert_eq!(amount(&later["assets"][0]["netBookValue"]), 0.0);

    let list = sc.ok("assets.list", json!({}));
    assert_eq!(amount(&list["totalAcquisitionValue"]), 12000.0);
    assert_eq!(amount(&list["totalNetBookValue"]), 0.0);
}

#[test]
fn ledger_trial_balance_is_balanced() {
    let workspace = temp_dir("escola-ledger");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let cash = sc.ok(
        "ledgerAccounts.create",
        json!({ "code": "11", "name": "Caixa", "nature": "ATIVO" }),
    );
    let fees = sc.ok(
        "ledgerAccounts.create",
        json!({ "code": "61", "name": "Propinas", "nature": "RECEITA" }),
    );
    assert_eq!(
        sc.err_code(
            "ledgerAccounts.create",
            json!({ "code": "11", "name": "Duplicada", "nature": "ATIVO" })
        ),
        "conflict"
    );

    assert_eq!(
        sc.err_code(
            "ledger.create",
            json!({
                "debitAccountId": id_of(&cash), "creditAccountId": id_of(&cash),
                "amount": "100", "description": "inválido"
            })
        ),
        "validation_failed"
    );
    assert_eq!(
        sc.err_code(
            "ledger.create",
            json!({
                "debitAccountId": id_of(&cash), "creditAccountId": id_of(&fees),
                "amount": "0", "description": "zero"
            })
        ),
        "validation_failed"
    );
    let entry = sc.ok(
        "ledger.create",
        json!({
            "entryDate": "2026-03-10", "debitAccountId": id_of(&cash),
            "creditAccountId": id_of(&fees), "amount": "5000", "description": "Propinas de março"
        }),
    );
    assert_eq!(entry["postedBy"], json!("admin"));

    sc.ok(
        "users.create",
        json!({
            "username": "diretora", "password": "diretora-1", "firstName": "Luísa",
            "lastName": "Pinto", "role": "Diretor"
        }),
    );
    sc.ok("auth.logout", json!({}));
    sc.ok(
        "auth.login",
        json!({ "username": "diretora", "password": "diretora-1" }),
    );
    let edited = sc.ok(
        "ledger.update",
        json!({ "id": id_of(&entry), "patch": { "description": "Propinas de março (corrigido)" } }),
    );
    assert_eq!(edited["postedBy"], json!("admin"));
    assert_eq!(edited["description"], json!("Propinas de março (corrigido)"));

    let tb = sc.ok("ledger.trialBalance", json!({}));
    assert_eq!(tb["balanced"], json!(true));
    assert_eq!(amount(&tb["totalDebit"]), 5000.0);
    let cash_line = tb["accounts"]
        .as_array()
        .expect("accounts")
        .iter()
        .find(|a| a["code"] == json!("11"))
        .expect("cash line")
        .clone();
    assert_eq!(amount(&cash_line["balance"]), 5000.0);

    assert_eq!(
        sc.err_code("ledgerAccounts.delete", json!({ "id": id_of(&fees) })),
        "conflict"
    );
}
