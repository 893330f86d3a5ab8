use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::{json, Value};

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Worker {
    fn spawn() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_mathcell"))
            .arg("worker")
            .env_remove("MATHCELL_POLICY")
            .env_remove("MATHCELL_PRELOAD")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn worker");
        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Self {
            child,
            stdin,
            stdout,
        }
    }

    fn send_raw(&mut self, line: &str) {
        writeln!(self.stdin, "{line}").unwrap();
        self.stdin.flush().unwrap();
    }

    fn recv(&mut self) -> Value {
        let mut line = String::new();
        self.stdout.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn request(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string());
        self.recv()
    }
}

#[test]
fn malformed_line_does_not_stop_the_worker() {
    let mut worker = Worker::spawn();
    worker.send_raw("{not json");
    let reply = worker.recv();
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"]["type"], json!("ProtocolError"));
    assert!(reply.get("id").is_none());

    let reply = worker.request(json!({"id": "1", "type": "execute", "code": "6 * 7"}));
    assert_eq!(reply["id"], json!("1"));
    assert_eq!(reply["result"], json!("42"));

    let reply = worker.request(json!({"id": "2", "type": "shutdown"}));
    assert_eq!(reply, json!({"id": "2", "ok": true}));
    assert!(worker.child.wait().unwrap().success());
}

#[test]
fn namespace_persists_between_requests() {
    let mut worker = Worker::spawn();
    worker.request(json!({"id": "a", "type": "execute", "code": "def sq(v):\n    return v * v\n"}));
    let reply = worker.request(json!({"id": "b", "type": "execute", "code": "sq(12)"}));
    assert_eq!(reply["result"], json!("144"));
    assert_eq!(reply["result_type"], json!("expression"));
    assert!(reply["elapsed_ms"].as_f64().unwrap() >= 0.0);
}

#[test]
fn unknown_request_types_are_reported() {
    let mut worker = Worker::spawn();
    let reply = worker.request(json!({"id": "q", "type": "interrupt"}));
    assert_eq!(reply["id"], json!("q"));
    assert_eq!(reply["error"]["type"], json!("UnsupportedRequest"));
    let reply = worker.request(json!({"id": "r", "type": "reset"}));
    assert_eq!(reply, json!({"id": "r", "ok": true}));
}

#[test]
fn end_of_input_exits_cleanly() {
    let Worker {
        mut child, stdin, ..
    } = Worker::spawn();
    drop(stdin);
    assert!(child.wait().unwrap().success());
}

#[test]
fn policy_comes_from_the_environment() {
    let policy = json!({"allow_imports": false, "forbidden_call_names": ["abs"]});
    let mut child = Command::new(env!("CARGO_BIN_EXE_mathcell"))
        .arg("worker")
        .env("MATHCELL_POLICY", policy.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    writeln!(
        stdin,
        "{}",
        json!({"id": "p", "type": "execute", "code": "abs(-1)"})
    )
    .unwrap();
    stdin.flush().unwrap();
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["error"]["type"], json!("SecurityViolation"));
    drop(stdin);
    child.wait().unwrap();
}
