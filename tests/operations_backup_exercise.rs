use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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

    fn login(&mut self) {
        self.ok(
            "auth.login",
            json!({ "username": "admin", "password": "admin-pass-1" }),
        );
    }

    fn open_as_admin(workspace: &Path) -> Self {
        let mut sc = Self::spawn();
        sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        sc.ok(
            "auth.bootstrap",
            json!({ "username": "admin", "password": "admin-pass-1" }),
        );
        sc.login();
        sc
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn run_cli(args: &[&str]) -> (bool, Value) {
    let out = Command::new(env!("CARGO_BIN_EXE_escolad"))
        .args(args)
        .stderr(Stdio::null())
        .output()
        .expect("run escolad");
    let text = String::from_utf8_lossy(&out.stdout).to_string();
    let value = serde_json::from_str(text.trim()).unwrap_or(Value::Null);
    (out.status.success(), value)
}

#[test]
fn config_sections_mask_secrets_and_validate() {
    let workspace = temp_dir("escola-config");
    let mut sc = Sidecar::open_as_admin(&workspace);

    sc.ok(
        "config.update",
        json!({ "section": "smtp", "patch": { "host": "smtp.escola.ao", "password": "segredo" } }),
    );
    let smtp = sc.ok("config.get", json!({ "section": "smtp" }));
    assert_eq!(smtp["values"]["host"], json!("smtp.escola.ao"));
    assert_eq!(smtp["values"]["password"], json!("********"));

    let all = sc.ok("config.get", json!({}));
    assert_eq!(all["sections"]["session"]["idleMinutes"], json!(45));
    assert_eq!(all["sections"]["institution"]["name"], json!("Escola"));

    assert_eq!(
        sc.err_code(
            "config.update",
            json!({ "section": "backup", "patch": { "localPath": "relative/dir" } })
        ),
        "validation_failed"
    );
    assert_eq!(
        sc.err_code(
            "config.update",
            json!({ "section": "smtp", "patch": { "colour": "blue" } })
        ),
        "validation_failed"
    );
    assert_eq!(
        sc.err_code("config.update", json!({ "section": "nope", "patch": {} })),
        "validation_failed"
    );
}

#[test]
fn backup_runs_restores_and_logs_failures() {
    let workspace = temp_dir("escola-backup");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let run = sc.ok("backup.run", json!({}));
    assert_eq!(run["status"], json!("SUCCESS"));
    let bundle = run["filePath"].as_str().expect("filePath").to_string();
    assert!(Path::new(&bundle).is_file());
    assert!(bundle.starts_with(&*workspace.join("backups").to_string_lossy()));

    sc.ok(
        "guardians.create",
        json!({ "name": "Depois", "phone": "923000111", "relationship": "Pai" }),
    );
    let restored = sc.ok("backup.restore", json!({ "inPath": bundle }));
    assert_eq!(restored["formatDetected"], json!("escola-workspace-v1"));
    assert_eq!(sc.err_code("guardians.list", json!({})), "unauthenticated");
    sc.login();
    let guardians = sc.ok("guardians.list", json!({}));
    assert_eq!(guardians["guardians"].as_array().map(|a| a.len()), Some(0));

    sc.ok(
        "config.update",
        json!({ "section": "backup", "patch": {
            "dumpCommand": ["sh", "-c", "echo boom >&2; exit 3"]
        } }),
    );
    assert_eq!(sc.err_code("backup.run", json!({})), "io_failed");
    let logs = sc.ok("backup.list", json!({}));
    let latest = &logs["backups"][0];
    assert_eq!(latest["status"], json!("FAILURE"));
    assert_eq!(latest["executedBy"], json!("admin"));
    let details = latest["details"].as_str().unwrap_or("");
    assert!(details.contains("exited with 3"), "{}", details);
    assert!(details.contains("boom"), "{}", details);
    let errors = sc.ok("errorLogs.list", json!({ "method": "backup.run" }));
    assert_eq!(errors["logs"].as_array().map(|a| a.len()), Some(1));

    sc.ok(
        "config.update",
        json!({ "section": "backup", "patch": {
            "dumpCommand": ["cp", "{db}", "{out}"],
            "filenamePattern": "dump_%Y%m%d_%H%M%S.sqlite3"
        } }),
    );
    let dumped = sc.ok("backup.run", json!({}));
    assert_eq!(dumped["status"], json!("SUCCESS"));
    assert!(Path::new(dumped["filePath"].as_str().expect("filePath")).is_file());
    let restored = sc.ok("backup.restore", json!({ "inPath": dumped["filePath"] }));
    assert_eq!(restored["formatDetected"], json!("sqlite3"));

    assert_eq!(
        sc.err_code(
            "backup.restore",
            json!({ "inPath": workspace.join("missing.zip").to_string_lossy() })
        ),
        "not_found"
    );
}

#[test]
fn exercise_switch_backs_up_and_rotates_years() {
    let workspace = temp_dir("escola-exercise");
    let mut sc = Sidecar::open_as_admin(&workspace);

    let first = sc.ok(
        "years.create",
        json!({ "name": "2025/2026", "startDate": "2025-09-01", "endDate": "2026-07-31", "active": true }),
    );
    let second = sc.ok(
        "years.create",
        json!({ "name": "2026/2027", "startDate": "2026-09-01", "endDate": "2027-07-31" }),
    );
    let first_id = first["id"].as_str().expect("id").to_string();
    let second_id = second["id"].as_str().expect("id").to_string();

    assert_eq!(
        sc.err_code("exercise.switch", json!({ "yearId": "missing" })),
        "not_found"
    );

    let opened = sc.ok("exercise.switch", json!({ "yearId": first_id }));
    assert!(opened["closedExerciseId"].is_null());
    assert_eq!(opened["backup"]["status"], json!("SUCCESS"));

    let rotated = sc.ok("exercise.switch", json!({ "yearId": second_id }));
    assert_eq!(rotated["closedExerciseId"], opened["exerciseId"]);
    assert_eq!(sc.ok("years.active", json!({}))["year"]["id"], json!(second_id));

    let current = sc.ok("exercise.current", json!({}));
    assert_eq!(current["current"]["academicYearId"], json!(second_id));
    let history = current["history"].as_array().expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0]["backupPath"].is_string());

    let activities = sc.ok("dashboard.get", json!({}))["recentActivities"].clone();
    assert!(activities
        .as_array()
        .expect("activities")
        .iter()
        .any(|a| a["action"] == json!("exercise.switch")));
}

#[test]
fn cli_subcommands_share_the_workspace() {
    let workspace = temp_dir("escola-cli");
    let year_id;
    {
        let mut sc = Sidecar::open_as_admin(&workspace);
        let year = sc.ok(
            "years.create",
            json!({ "name": "2026/2027", "startDate": "2026-09-01", "endDate": "2027-07-31" }),
        );
        year_id = year["id"].as_str().expect("id").to_string();
    }
    let ws = workspace.to_string_lossy().to_string();

    let (ok, out) = run_cli(&["backup", "--workspace", &ws, "--user", "cron"]);
    assert!(ok, "{}", out);
    assert_eq!(out["status"], json!("SUCCESS"));

    let (ok, out) = run_cli(&["exercise-switch", "--workspace", &ws, "--year", &year_id]);
    assert!(ok, "{}", out);
    assert_eq!(out["academicYearId"], json!(year_id));

    let (ok, out) = run_cli(&["notify-overdue", "--workspace", &ws]);
    assert!(ok, "{}", out);
    assert_eq!(out["guardians"], json!(0));

    let (ok, _) = run_cli(&["exercise-switch", "--workspace", &ws, "--year", "missing"]);
    assert!(!ok);

    let mut sc = Sidecar::spawn();
    sc.ok("workspace.select", json!({ "path": ws }));
    sc.login();
    let logs = sc.ok("backup.list", json!({}));
    let by: Vec<&str> = logs["backups"]
        .as_array()
        .expect("backups")
        .iter()
        .filter_map(|b| b["executedBy"].as_str())
        .collect();
    assert!(by.contains(&"cron"));
}
