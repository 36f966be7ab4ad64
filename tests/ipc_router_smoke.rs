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

    fn read_line(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response");
        serde_json::from_str(line.trim()).expect("parse response json")
    }

    fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let value = self.read_line();
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
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
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn session_gate_bootstrap_and_login() {
    let workspace = temp_dir("escola-router-smoke");
    let mut sc = Sidecar::spawn();

    let health = sc.ok("health", json!({}));
    assert_eq!(health["sessionOpen"], json!(false));
    assert!(health["workspacePath"].is_null());

    assert_eq!(sc.err_code("guardians.list", json!({})), "unauthenticated");

    let selected = sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    assert_eq!(selected["needsBootstrap"], json!(true));
    assert!(workspace.join("escola.sqlite3").is_file());
    assert!(workspace.join("media").is_dir());

    assert_eq!(
        sc.err_code("auth.bootstrap", json!({ "username": "admin", "password": "1234" })),
        "validation_failed"
    );
    let admin = sc.ok(
        "auth.bootstrap",
        json!({ "username": "admin", "password": "admin-pass-1" }),
    );
    assert_eq!(admin["role"], json!("Admin"));
    assert_eq!(
        sc.err_code(
            "auth.bootstrap",
            json!({ "username": "other", "password": "admin-pass-2" })
        ),
        "conflict"
    );

    assert_eq!(
        sc.err_code("auth.login", json!({ "username": "admin", "password": "wrong-pass" })),
        "unauthenticated"
    );
    let login = sc.ok(
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass-1" }),
    );
    assert_eq!(login["home"], json!("admin"));
    assert_eq!(sc.ok("auth.whoami", json!({}))["username"], json!("admin"));

    assert_eq!(sc.err_code("nothing.here", json!({})), "not_implemented");
    assert_eq!(sc.err_code("users.create", json!({ "username": "x" })), "bad_params");

    writeln!(sc.stdin, "{{not json").expect("write garbage");
    sc.stdin.flush().expect("flush");
    let garbage = sc.read_line();
    assert_eq!(garbage["error"]["code"], json!("bad_json"));
}

#[test]
fn roles_gate_operations_and_access_is_logged() {
    let workspace = temp_dir("escola-router-roles");
    let mut sc = Sidecar::spawn();
    sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    sc.ok(
        "auth.bootstrap",
        json!({ "username": "admin", "password": "admin-pass-1" }),
    );
    sc.ok(
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass-1" }),
    );

    assert_eq!(
        sc.err_code(
            "users.create",
            json!({
                "username": "admin2", "password": "second-admin", "firstName": "B",
                "lastName": "C", "role": "Admin"
            })
        ),
        "conflict"
    );
    let retired = sc.ok(
        "users.create",
        json!({
            "username": "old", "password": "retired-admin", "firstName": "Rui",
            "lastName": "Mendes", "role": "Admin", "isActive": false
        }),
    );
    assert_eq!(
        sc.err_code("users.delete", json!({ "userId": retired["id"] })),
        "conflict"
    );
    sc.ok(
        "users.create",
        json!({
            "username": "sec", "password": "secretaria-1", "firstName": "Sara",
            "lastName": "Costa", "role": "Secretaria", "email": "sara@escola.ao"
        }),
    );
    sc.ok("auth.logout", json!({}));
    assert_eq!(sc.err_code("auth.whoami", json!({})), "unauthenticated");

    let login = sc.ok(
        "auth.login",
        json!({ "username": "sec", "password": "secretaria-1" }),
    );
    assert_eq!(login["home"], json!("secretaria"));
    assert_eq!(sc.err_code("staff.list", json!({})), "forbidden");
    assert_eq!(sc.err_code("config.get", json!({})), "forbidden");
    sc.ok("guardians.list", json!({}));

    let dash = sc.ok("dashboard.get", json!({}));
    assert_eq!(dash["role"], json!("Secretaria"));
    assert_eq!(dash["counters"]["activeStudents"], json!(0));
    assert!(dash["counters"].get("activeStaff").is_none());

    sc.ok("auth.logout", json!({}));
    sc.ok(
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass-1" }),
    );
    let logs = sc.ok("accessLogs.list", json!({}))["logs"].clone();
    let actions: Vec<&str> = logs
        .as_array()
        .expect("logs array")
        .iter()
        .filter_map(|l| l["action"].as_str())
        .collect();
    assert!(actions.contains(&"LOGIN"));
    assert!(actions.contains(&"LOGOUT"));

    let dash = sc.ok("dashboard.get", json!({}));
    let recent = dash["recentActivities"].as_array().expect("activities");
    assert!(recent
        .iter()
        .any(|a| a["action"] == json!("users.create") && a["module"] == json!("accounts")));
}
