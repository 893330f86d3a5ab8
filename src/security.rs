//! Static safety gate for cell source.
//!
//! Every submission is parsed and walked before it reaches the interpreter.
//! Rejection is cheap and final; a false positive costs the caller a rewrite,
//! a false negative would hand the guest a process or filesystem primitive.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::lang::ast::{Alias, Expr, Module, Stmt, StmtKind};
use crate::lang::visit::{walk_expr, walk_module, walk_stmt, Visitor};
use crate::lang::{self, ParseError, TreeStats};

/// Declarative rules for acceptable guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub enabled: bool,
    pub max_source_chars: usize,
    pub max_ast_nodes: usize,
    pub max_ast_depth: usize,
    pub allow_imports: bool,
    pub forbid_global_stmt: bool,
    pub forbid_nonlocal_stmt: bool,
    pub forbidden_call_names: Vec<String>,
    pub forbidden_attribute_parents: Vec<String>,
    pub forbidden_attribute_names: Vec<String>,
    pub allowed_import_modules: Vec<String>,
    pub allowed_import_prefixes: Vec<String>,
    pub log_violations: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_source_chars: 8_000,
            max_ast_nodes: 2_500,
            max_ast_depth: 75,
            allow_imports: false,
            forbid_global_stmt: true,
            forbid_nonlocal_stmt: true,
            forbidden_call_names: strings(&[
                "eval",
                "exec",
                "compile",
                "__import__",
                "open",
                "input",
                "globals",
                "locals",
                "vars",
            ]),
            forbidden_attribute_parents: strings(&[
                "os",
                "sys",
                "pathlib",
                "subprocess",
                "shutil",
                "socket",
                "builtins",
            ]),
            forbidden_attribute_names: strings(&[
                "system", "popen", "popen2", "popen3", "remove", "rmdir", "unlink", "rmtree",
                "walk", "spawnl", "spawnlp", "spawnv", "spawnvp", "execv", "execvp", "execvpe",
                "fork", "forkpty",
            ]),
            allowed_import_modules: strings(&["math", "cmath", "sage", "sage.all"]),
            allowed_import_prefixes: strings(&["sage."]),
            log_violations: true,
        }
    }
}

impl SecurityPolicy {
    fn is_allowed_import(&self, module: &str) -> bool {
        self.allowed_import_modules.iter().any(|m| m == module)
            || self
                .allowed_import_prefixes
                .iter()
                .any(|prefix| module.starts_with(prefix.as_str()))
    }
}

/// Source that parsed but is not permitted by the policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SecurityViolation {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Violation(#[from] SecurityViolation),
}

/// Aggregate figures for a submission that passed validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub source_chars: usize,
    pub nodes: usize,
    pub depth: usize,
}

/// Parse `source` and check it against `policy`.
pub fn validate(source: &str, policy: &SecurityPolicy) -> Result<ValidationStats, ValidationError> {
    if policy.enabled {
        check_length(source, policy)?;
    }
    let module = lang::parse(source)?;
    Ok(validate_module(&module, source, policy)?)
}

/// Check an already parsed module. `source` is the text it was parsed from and
/// is used for the length limit and diagnostics.
pub fn validate_module(
    module: &Module,
    source: &str,
    policy: &SecurityPolicy,
) -> Result<ValidationStats, SecurityViolation> {
    if !policy.enabled {
        return Ok(ValidationStats::default());
    }
    let source_chars = check_length(source, policy)?;

    let stats = TreeStats::of(module);
    if stats.nodes > policy.max_ast_nodes {
        return Err(reject(
            format!(
                "code exceeds maximum syntax tree node count ({} > {})",
                stats.nodes, policy.max_ast_nodes
            ),
            source,
            policy,
        ));
    }
    if stats.max_depth > policy.max_ast_depth {
        return Err(reject(
            format!(
                "code exceeds maximum syntax tree depth ({} > {})",
                stats.max_depth, policy.max_ast_depth
            ),
            source,
            policy,
        ));
    }

    let mut checker = PolicyChecker { policy };
    if let ControlFlow::Break(message) = walk_module(&mut checker, module) {
        return Err(reject(message, source, policy));
    }

    if policy.log_violations {
        debug!(
            length = source_chars,
            nodes = stats.nodes,
            depth = stats.max_depth,
            "cell passed security validation"
        );
    }
    Ok(ValidationStats {
        source_chars,
        nodes: stats.nodes,
        depth: stats.max_depth,
    })
}

/// Length limit alone, for callers that want it enforced before parsing.
pub fn check_length(source: &str, policy: &SecurityPolicy) -> Result<usize, SecurityViolation> {
    let length = source.chars().count();
    if length > policy.max_source_chars {
        return Err(reject(
            format!(
                "code exceeds maximum length ({length} > {})",
                policy.max_source_chars
            ),
            source,
            policy,
        ));
    }
    Ok(length)
}

fn reject(message: String, source: &str, policy: &SecurityPolicy) -> SecurityViolation {
    if policy.log_violations {
        warn!("blocked cell code: {}", diagnostic(&message, source));
    }
    SecurityViolation { message }
}

const SNIPPET_LINES: usize = 3;
const SNIPPET_LINE_CHARS: usize = 120;

/// Violation message with the first few non-empty source lines appended.
fn diagnostic(message: &str, source: &str) -> String {
    let snippet: Vec<String> = source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(SNIPPET_LINES)
        .map(|line| line.chars().take(SNIPPET_LINE_CHARS).collect())
        .collect();
    if snippet.is_empty() {
        message.to_string()
    } else {
        format!("{message} [snippet: {}]", snippet.join(" / "))
    }
}

struct PolicyChecker<'a> {
    policy: &'a SecurityPolicy,
}

impl PolicyChecker<'_> {
    fn check_imports(&self, modules: &[&str]) -> ControlFlow<String> {
        if self.policy.allow_imports {
            return ControlFlow::Continue(());
        }
        if !modules.iter().all(|m| self.policy.is_allowed_import(m)) {
            return ControlFlow::Break("import statements are disabled for cell executions".into());
        }
        ControlFlow::Continue(())
    }
}

impl Visitor for PolicyChecker<'_> {
    type Break = String;

    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<String> {
        match &stmt.kind {
            StmtKind::Import(names) => {
                let modules: Vec<&str> = names.iter().map(|a: &Alias| a.name.as_str()).collect();
                self.check_imports(&modules)?;
            }
            StmtKind::ImportFrom { module, level, .. } => {
                if !self.policy.allow_imports {
                    match module {
                        Some(module) if *level == 0 => self.check_imports(&[module.as_str()])?,
                        _ => {
                            return ControlFlow::Break(
                                "relative imports are disabled for cell executions".into(),
                            )
                        }
                    }
                }
            }
            StmtKind::Global(_) if self.policy.forbid_global_stmt => {
                return ControlFlow::Break(
                    "global statements are not permitted in cell executions".into(),
                );
            }
            StmtKind::Nonlocal(_) if self.policy.forbid_nonlocal_stmt => {
                return ControlFlow::Break(
                    "nonlocal statements are not permitted in cell executions".into(),
                );
            }
            _ => {}
        }
        walk_stmt(self, stmt)
    }

    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<String> {
        if let Expr::Call { func, .. } = expr {
            match func.as_ref() {
                Expr::Name(name) if self.policy.forbidden_call_names.contains(name) => {
                    return ControlFlow::Break(format!(
                        "call to forbidden function '{name}' is blocked"
                    ));
                }
                // Only a bare, unaliased parent is recognised; `import os as o`
                // followed by `o.system()` relies on the import gate instead.
                Expr::Attribute { value, attr } => {
                    if let Expr::Name(parent) = value.as_ref() {
                        if self.policy.forbidden_attribute_parents.contains(parent)
                            && self.policy.forbidden_attribute_names.contains(attr)
                        {
                            return ControlFlow::Break(format!(
                                "call to forbidden attribute '{parent}.{attr}' is blocked"
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        walk_expr(self, expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(source: &str, policy: &SecurityPolicy) -> String {
        match validate(source, policy) {
            Err(ValidationError::Violation(v)) => v.message,
            other => panic!("expected violation for {source:?}, got {other:?}"),
        }
    }

    #[test]
    fn blocks_forbidden_import() {
        let msg = violation("import os\nos.system('echo hi')", &SecurityPolicy::default());
        assert!(msg.contains("import"));
    }

    #[test]
    fn allows_whitelisted_imports() {
        let policy = SecurityPolicy::default();
        assert!(validate("from sage.all import sin", &policy).is_ok());
        assert!(validate("import math", &policy).is_ok());
        assert!(validate("from sage.rings.integer import Integer", &policy).is_ok());
    }

    #[test]
    fn one_disallowed_module_spoils_the_import() {
        violation("import math, os", &SecurityPolicy::default());
    }

    #[test]
    fn relative_imports_are_always_rejected_when_imports_are_disabled() {
        let policy = SecurityPolicy::default();
        violation("from . import x", &policy);
        violation("from .sage import x", &policy);
    }

    #[test]
    fn blocks_global_and_nonlocal() {
        let policy = SecurityPolicy::default();
        assert!(violation("global x\nx = 1", &policy).contains("global"));
        let code = "def outer():\n    value = 0\n    def inner():\n        nonlocal value\n        value = 1\n    inner()\n";
        assert!(violation(code, &policy).contains("nonlocal"));
    }

    #[test]
    fn scope_escape_toggles() {
        let policy = SecurityPolicy {
            forbid_global_stmt: false,
            ..SecurityPolicy::default()
        };
        assert!(validate("def f():\n    global x\n    x = 1\n", &policy).is_ok());
    }

    #[test]
    fn blocks_forbidden_attribute_call() {
        let msg = violation("os.system('shutdown')", &SecurityPolicy::default());
        assert_eq!(msg, "call to forbidden attribute 'os.system' is blocked");
    }

    #[test]
    fn attribute_access_without_call_is_allowed() {
        assert!(validate("f = os.system", &SecurityPolicy::default()).is_ok());
    }

    #[test]
    fn blocks_forbidden_function_anywhere_in_the_tree() {
        let policy = SecurityPolicy::default();
        violation("result = eval('2 + 2')", &policy);
        violation("def f():\n    return [1, open('x')]\n", &policy);
        violation("g = lambda: exec('x')", &policy);
    }

    #[test]
    fn custom_policy_allows_imports() {
        let policy = SecurityPolicy {
            allow_imports: true,
            ..SecurityPolicy::default()
        };
        assert!(validate("import math\nmath.sqrt(4)", &policy).is_ok());
        assert!(validate("from . import x", &policy).is_ok());
    }

    #[test]
    fn oversize_source_is_rejected_before_parsing() {
        let policy = SecurityPolicy {
            max_source_chars: 10,
            ..SecurityPolicy::default()
        };
        // Not even valid syntax; the length gate still wins.
        let msg = violation("((((((((((((", &policy);
        assert!(msg.contains("maximum length"));
        assert!(validate("x = 1", &policy).is_ok());
    }

    #[test]
    fn node_and_depth_limits() {
        let nodes = SecurityPolicy {
            max_ast_nodes: 10,
            ..SecurityPolicy::default()
        };
        assert!(violation("[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]", &nodes).contains("node count"));

        let depth = SecurityPolicy {
            max_ast_depth: 5,
            ..SecurityPolicy::default()
        };
        assert!(violation("x = -(-(-(-(-(1)))))", &depth).contains("depth"));
    }

    #[test]
    fn syntax_errors_are_not_violations() {
        let result = validate("x = = 1", &SecurityPolicy::default());
        assert!(matches!(result, Err(ValidationError::Parse(_))));
    }

    #[test]
    fn disabled_policy_only_parses() {
        let policy = SecurityPolicy {
            enabled: false,
            ..SecurityPolicy::default()
        };
        assert!(validate("import os\nos.system('x')", &policy).is_ok());
        assert!(matches!(
            validate("import", &policy),
            Err(ValidationError::Parse(_))
        ));
    }

    #[test]
    fn stats_are_reported() {
        let stats = validate("x = 1", &SecurityPolicy::default()).unwrap();
        assert_eq!(stats.source_chars, 5);
        assert_eq!(stats.nodes, 3);
        assert_eq!(stats.depth, 2);
    }

    #[test]
    fn diagnostic_includes_a_trimmed_snippet() {
        let text = diagnostic("blocked", "  import os\n\n  a\n  b\n  c\n");
        assert_eq!(text, "blocked [snippet: import os / a / b]");
        assert_eq!(diagnostic("blocked", "   \n"), "blocked");
    }

    #[test]
    fn policy_round_trips_through_json_with_defaults() {
        let policy: SecurityPolicy = serde_json::from_str(r#"{"allow_imports": true}"#).unwrap();
        assert!(policy.allow_imports);
        assert_eq!(policy.max_source_chars, 8_000);
    }
}
