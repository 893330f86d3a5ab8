//! The worker side: a child process that validates and executes cells against
//! a namespace it keeps between requests.

pub mod builtins;
pub mod interp;
pub mod protocol;
pub mod value;

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::lang::{self, ast::StmtKind};
use crate::sandbox::{self, ResourceLimits};
use crate::security::{self, SecurityPolicy};

use interp::{Interpreter, RuntimeError};
use protocol::{
    Request, Response, ResultKind, WireError, DEFAULT_PRELOAD, POLICY_ENV, PRELOAD_ENV,
    PURE_FALLBACK_ENV,
};

/// Guest recursion runs on the interpreter thread's stack.
pub(crate) const INTERPRETER_STACK_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Stop,
}

pub struct Harness {
    policy: SecurityPolicy,
    preload: String,
    interp: Interpreter,
}

impl Harness {
    pub fn new(policy: SecurityPolicy, preload: impl Into<String>) -> Self {
        let preload = preload.into();
        let interp = fresh_namespace(&preload);
        Self {
            policy,
            preload,
            interp,
        }
    }

    /// Policy and preload from the environment the supervising session set.
    pub fn from_env() -> Result<Self, serde_json::Error> {
        let policy = match std::env::var(POLICY_ENV) {
            Ok(json) if !json.trim().is_empty() => serde_json::from_str(&json)?,
            _ => SecurityPolicy::default(),
        };
        let pure_fallback = std::env::var(PURE_FALLBACK_ENV)
            .map(|value| is_truthy(&value))
            .unwrap_or(false);
        let preload = if pure_fallback {
            DEFAULT_PRELOAD.to_string()
        } else {
            std::env::var(PRELOAD_ENV).unwrap_or_else(|_| DEFAULT_PRELOAD.to_string())
        };
        Ok(Self::new(policy, preload))
    }

    /// Read requests until `shutdown` or end of input, answering each with
    /// exactly one flushed line.
    pub fn serve<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> io::Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                debug!("stdin closed, worker exiting");
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            let (response, next) = self.handle_line(&line);
            serde_json::to_writer(&mut output, &response)?;
            output.write_all(b"\n")?;
            output.flush()?;
            if next == Next::Stop {
                return Ok(());
            }
        }
    }

    pub fn handle_line(&mut self, line: &str) -> (Response, Next) {
        let value: serde_json::Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(err) => {
                warn!("undecodable request line: {err}");
                return (
                    Response::failed(None, "ProtocolError", format!("invalid JSON: {err}")),
                    Next::Continue,
                );
            }
        };
        let Some(object) = value.as_object() else {
            return (
                Response::failed(None, "ProtocolError", "request must be a JSON object"),
                Next::Continue,
            );
        };
        let id = object.get("id").and_then(|id| id.as_str()).map(str::to_string);
        let kind = object
            .get("type")
            .and_then(|kind| kind.as_str())
            .unwrap_or_default()
            .to_owned();
        if !matches!(kind.as_str(), "execute" | "reset" | "shutdown") {
            return (
                Response::failed(
                    id,
                    "UnsupportedRequest",
                    format!("unsupported request type '{kind}'"),
                ),
                Next::Continue,
            );
        }
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return (
                    Response::failed(id, "ProtocolError", format!("malformed {kind} request: {err}")),
                    Next::Continue,
                )
            }
        };
        self.handle(request)
    }

    pub fn handle(&mut self, request: Request) -> (Response, Next) {
        match request {
            Request::Execute {
                id,
                code,
                want_alt_format,
                capture_output,
            } => (
                self.execute(id, &code, want_alt_format, capture_output),
                Next::Continue,
            ),
            Request::Reset { id } => {
                self.interp = fresh_namespace(&self.preload);
                debug!(request = %id, "namespace reset");
                (Response::ack(id), Next::Continue)
            }
            Request::Shutdown { id } => {
                info!(request = %id, "worker shutting down");
                (Response::ack(id), Next::Stop)
            }
        }
    }

    fn execute(&mut self, id: String, code: &str, want_alt_format: bool, capture_output: bool) -> Response {
        if self.policy.enabled {
            if let Err(violation) = security::check_length(code, &self.policy) {
                return Response::failed(Some(id), "SecurityViolation", violation.message);
            }
        }
        let module = match lang::parse(code) {
            Ok(module) => module,
            Err(err) => return Response::failed(Some(id), "SyntaxError", err.to_string()),
        };
        if let Err(violation) = security::validate_module(&module, code, &self.policy) {
            return Response::failed(Some(id), "SecurityViolation", violation.message);
        }

        let (prefix, tail) = match module.body.split_last() {
            Some((last, rest)) => match &last.kind {
                StmtKind::Expr(expr) => (rest, Some((expr, last.line))),
                _ => (module.body.as_slice(), None),
            },
            None => (module.body.as_slice(), None),
        };

        self.interp.begin_capture(capture_output);
        let started = Instant::now();
        let outcome = self.interp.run_statements(prefix).and_then(|()| match tail {
            Some((expr, line)) => self.interp.eval_at(expr, line).map(Some),
            None => Ok(None),
        });
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let stdout = self.interp.take_output();

        match outcome {
            Ok(value) => {
                let value = value.filter(|value| !value.is_none());
                let alt_format = if want_alt_format {
                    value.as_ref().and_then(|value| value.latex())
                } else {
                    None
                };
                Response::Executed {
                    id,
                    ok: true,
                    result_type: if tail.is_some() {
                        ResultKind::Expression
                    } else {
                        ResultKind::Statement
                    },
                    result: value.map(|value| value.repr()),
                    alt_format,
                    stdout,
                    elapsed_ms,
                }
            }
            Err(err) => guest_failure(id, err, stdout),
        }
    }
}

fn guest_failure(id: String, err: RuntimeError, stdout: String) -> Response {
    Response::Failed {
        id: Some(id),
        ok: false,
        error: WireError {
            kind: err.kind.to_string(),
            message: err.message.clone(),
            traceback: Some(err.traceback()),
        },
        stdout: Some(stdout),
    }
}

fn fresh_namespace(preload: &str) -> Interpreter {
    let mut interp = Interpreter::new();
    if preload.trim().is_empty() {
        return interp;
    }
    let loaded = lang::parse(preload)
        .map_err(|err| err.to_string())
        .and_then(|module| interp.run_module(&module).map_err(|err| err.to_string()));
    if let Err(err) = loaded {
        warn!(preload, "preload failed, starting with an empty namespace: {err}");
        return Interpreter::new();
    }
    interp
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Entry point for `mathcell worker`: serve stdin/stdout until shutdown.
pub fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = thread::Builder::new()
        .name("mathcell-worker".to_string())
        .stack_size(INTERPRETER_STACK_BYTES)
        .spawn(|| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            // The stack above is already mapped when the address-space cap
            // goes on.
            let limits = ResourceLimits::from_env();
            if let Err(err) = sandbox::apply(&limits) {
                warn!("failed to apply worker resource limits: {err}");
            }
            let mut harness = Harness::from_env()?;
            let stdin = io::stdin();
            let stdout = io::stdout();
            harness.serve(stdin.lock(), stdout.lock())?;
            Ok(())
        })?;
    handle
        .join()
        .map_err(|_| "worker interpreter thread panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};

    fn harness() -> Harness {
        Harness::new(SecurityPolicy::default(), DEFAULT_PRELOAD)
    }

    fn send(harness: &mut Harness, request: Json) -> Json {
        let (response, _) = harness.handle_line(&request.to_string());
        serde_json::to_value(response).unwrap()
    }

    fn execute(harness: &mut Harness, code: &str) -> Json {
        send(harness, json!({"id": "t", "type": "execute", "code": code}))
    }

    #[test]
    fn trailing_expression_is_the_result() {
        let mut h = harness();
        let reply = execute(&mut h, "x = 6\nx * 7");
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["result_type"], json!("expression"));
        assert_eq!(reply["result"], json!("42"));
        assert_eq!(reply["alt_format"], Json::Null);
        assert_eq!(execute(&mut h, "x")["result"], json!("6"));
    }

    #[test]
    fn statements_and_none_have_no_result() {
        let mut h = harness();
        let reply = execute(&mut h, "y = 1");
        assert_eq!(reply["result_type"], json!("statement"));
        assert_eq!(reply["result"], Json::Null);
        let reply = execute(&mut h, "print('hi')");
        assert_eq!(reply["result_type"], json!("expression"));
        assert_eq!(reply["result"], Json::Null);
        assert_eq!(reply["stdout"], json!("hi\n"));
    }

    #[test]
    fn output_can_be_discarded() {
        let mut h = harness();
        let reply = send(
            &mut h,
            json!({"id": "q", "type": "execute", "code": "print(1)", "capture_output": false}),
        );
        assert_eq!(reply["stdout"], json!(""));
    }

    #[test]
    fn latex_only_when_requested() {
        let mut h = harness();
        let reply = send(
            &mut h,
            json!({"id": "l", "type": "execute", "code": "[1, 2.5]", "want_alt_format": true}),
        );
        assert_eq!(reply["alt_format"], json!("\\left[1, 2.5\\right]"));
        let reply = send(
            &mut h,
            json!({"id": "l", "type": "execute", "code": "sqrt", "want_alt_format": true}),
        );
        assert_eq!(reply["alt_format"], Json::Null);
        assert_eq!(reply["result"], json!("<built-in function sqrt>"));
    }

    #[test]
    fn preload_populates_the_namespace() {
        let mut h = harness();
        assert_eq!(execute(&mut h, "floor(pi)")["result"], json!("3"));
    }

    #[test]
    fn reset_rebuilds_from_preload() {
        let mut h = harness();
        execute(&mut h, "x = 1");
        let reply = send(&mut h, json!({"id": "r", "type": "reset"}));
        assert_eq!(reply, json!({"id": "r", "ok": true}));
        let reply = execute(&mut h, "x");
        assert_eq!(reply["error"]["type"], json!("NameError"));
        assert_eq!(execute(&mut h, "sqrt(4)")["result"], json!("2.0"));
    }

    #[test]
    fn guest_errors_keep_committed_effects_and_output() {
        let mut h = harness();
        let reply = execute(&mut h, "a = 5\nprint('before')\n1 / 0\nb = 2");
        assert_eq!(reply["ok"], json!(false));
        assert_eq!(reply["id"], json!("t"));
        assert_eq!(reply["error"]["type"], json!("ZeroDivisionError"));
        assert_eq!(reply["stdout"], json!("before\n"));
        assert!(reply["error"]["traceback"]
            .as_str()
            .unwrap()
            .contains("line 3, in <cell>"));
        assert_eq!(execute(&mut h, "a")["result"], json!("5"));
        assert_eq!(execute(&mut h, "b")["error"]["type"], json!("NameError"));
    }

    #[test]
    fn syntax_and_security_failures() {
        let mut h = harness();
        assert_eq!(execute(&mut h, "x = (")["error"]["type"], json!("SyntaxError"));
        let reply = execute(&mut h, "import os");
        assert_eq!(reply["error"]["type"], json!("SecurityViolation"));
        assert!(reply.get("stdout").is_none());
        let huge = "1".repeat(9_000);
        assert_eq!(execute(&mut h, &huge)["error"]["type"], json!("SecurityViolation"));
    }

    #[test]
    fn protocol_errors_recover_the_id_when_possible() {
        let mut h = harness();
        let (reply, next) = h.handle_line("not json");
        assert_eq!(next, Next::Continue);
        let reply = serde_json::to_value(reply).unwrap();
        assert_eq!(reply["error"]["type"], json!("ProtocolError"));
        assert!(reply.get("id").is_none());

        let reply = send(&mut h, json!({"id": "m", "type": "execute"}));
        assert_eq!(reply["id"], json!("m"));
        assert_eq!(reply["error"]["type"], json!("ProtocolError"));
        assert!(reply["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("malformed execute request"));

        let reply = send(&mut h, json!({"id": "u", "type": "compile"}));
        assert_eq!(reply["id"], json!("u"));
        assert_eq!(reply["error"]["type"], json!("UnsupportedRequest"));
    }

    #[test]
    fn serve_answers_each_line_and_stops_on_shutdown() {
        let mut h = harness();
        let input = concat!(
            "{\"id\":\"1\",\"type\":\"execute\",\"code\":\"2 + 2\"}\n",
            "\n",
            "garbage\n",
            "{\"id\":\"2\",\"type\":\"shutdown\"}\n",
            "{\"id\":\"3\",\"type\":\"execute\",\"code\":\"1\"}\n",
        );
        let mut output = Vec::new();
        h.serve(input.as_bytes(), &mut output).unwrap();
        let lines: Vec<Json> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["result"], json!("4"));
        assert_eq!(lines[1]["error"]["type"], json!("ProtocolError"));
        assert_eq!(lines[2], json!({"id": "2", "ok": true}));
    }

    #[test]
    fn run_entry_builds_the_harness_on_the_interpreter_thread() {
        let reply = thread::Builder::new()
            .stack_size(INTERPRETER_STACK_BYTES)
            .spawn(|| {
                let mut h = Harness::from_env().unwrap();
                let (reply, _) = h.handle_line(r#"{"id": "t", "type": "reset"}"#);
                serde_json::to_value(reply).unwrap()
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(reply, json!({"id": "t", "ok": true}));
    }

    #[test]
    fn failed_preload_starts_empty() {
        let mut h = Harness::new(SecurityPolicy::default(), "from nowhere import *");
        assert_eq!(execute(&mut h, "sqrt")["error"]["type"], json!("NameError"));
        assert_eq!(execute(&mut h, "1 + 1")["result"], json!("2"));
    }
}
