//! Runtime settings, from flags or `MATHCELL_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::ArgAction;

use crate::sandbox::MIN_MEMORY_MB;
use crate::security::SecurityPolicy;
use crate::worker::protocol::DEFAULT_PRELOAD;

pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_CULL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_STDOUT_CHARS: usize = 100_000;

/// Shortest per-request timeout a caller may ask for.
pub const MIN_EVAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything a session needs to launch and supervise its worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Executable started with the `worker` subcommand. Defaults to the
    /// running binary.
    pub worker_binary: Option<PathBuf>,
    /// Statement run to seed every fresh namespace.
    pub preload: String,
    pub pure_fallback: bool,
    pub max_memory_mb: Option<u64>,
    pub eval_timeout: Duration,
    pub idle_ttl: Duration,
    pub shutdown_grace: Duration,
    pub max_stdout_chars: usize,
    pub cull_interval: Duration,
    pub policy: SecurityPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_binary: None,
            preload: DEFAULT_PRELOAD.to_string(),
            pure_fallback: false,
            max_memory_mb: None,
            eval_timeout: DEFAULT_EVAL_TIMEOUT,
            idle_ttl: DEFAULT_IDLE_TTL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_stdout_chars: DEFAULT_MAX_STDOUT_CHARS,
            cull_interval: DEFAULT_CULL_INTERVAL,
            policy: SecurityPolicy::default(),
        }
    }
}

impl Settings {
    pub fn worker_binary(&self) -> std::io::Result<PathBuf> {
        match &self.worker_binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe(),
        }
    }
}

/// Seconds as a non-negative float, e.g. `30` or `0.5`.
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("'{value}' must be a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Validate a caller-supplied evaluation timeout.
pub fn parse_timeout(seconds: f64) -> Result<Duration, String> {
    if !seconds.is_finite() || seconds < MIN_EVAL_TIMEOUT.as_secs_f64() {
        return Err(format!(
            "timeout must be a finite number of seconds >= {}",
            MIN_EVAL_TIMEOUT.as_secs_f64()
        ));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_eval_timeout(value: &str) -> Result<Duration, String> {
    parse_seconds(value).and_then(|d| parse_timeout(d.as_secs_f64()))
}

#[derive(clap::Args, Debug, Clone)]
pub struct SettingsArgs {
    /// Worker executable (defaults to this binary)
    #[arg(long, env = "MATHCELL_WORKER_BINARY")]
    pub worker_binary: Option<PathBuf>,

    /// Statement executed to seed each namespace
    #[arg(long, env = "MATHCELL_PRELOAD", default_value = DEFAULT_PRELOAD)]
    pub preload: String,

    /// Ignore --preload and seed namespaces with the math module only
    #[arg(
        long,
        env = "MATHCELL_PURE_FALLBACK",
        default_value = "false",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub pure_fallback: bool,

    /// Worker address-space cap in MiB (linux only; raised to the worker's minimum)
    #[arg(long, env = "MATHCELL_MAX_MEMORY_MB")]
    pub max_memory_mb: Option<u64>,

    /// Default evaluation timeout in seconds
    #[arg(long, env = "MATHCELL_EVAL_TIMEOUT", default_value = "30", value_parser = parse_eval_timeout)]
    pub eval_timeout: Duration,

    /// Seconds of inactivity after which a session is culled
    #[arg(long, env = "MATHCELL_IDLE_TTL", default_value = "900", value_parser = parse_seconds)]
    pub idle_ttl: Duration,

    /// Seconds a worker gets to exit after a shutdown request
    #[arg(long, env = "MATHCELL_SHUTDOWN_GRACE", default_value = "2", value_parser = parse_seconds)]
    pub shutdown_grace: Duration,

    /// Captured output beyond this many characters is truncated
    #[arg(long = "max-stdout", env = "MATHCELL_MAX_STDOUT", default_value_t = DEFAULT_MAX_STDOUT_CHARS)]
    pub max_stdout_chars: usize,

    /// Seconds between idle-session sweeps
    #[arg(long, env = "MATHCELL_CULL_INTERVAL", default_value = "60", value_parser = parse_seconds)]
    pub cull_interval: Duration,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

impl SettingsArgs {
    pub fn into_settings(self) -> Settings {
        Settings {
            worker_binary: self.worker_binary,
            preload: self.preload,
            pure_fallback: self.pure_fallback,
            max_memory_mb: self
                .max_memory_mb
                .filter(|mb| *mb > 0)
                .map(|mb| mb.max(MIN_MEMORY_MB)),
            eval_timeout: self.eval_timeout,
            idle_ttl: self.idle_ttl,
            shutdown_grace: self.shutdown_grace,
            max_stdout_chars: self.max_stdout_chars,
            cull_interval: self.cull_interval,
            policy: self.policy.into_policy(),
        }
    }
}

/// Overrides applied on top of [`SecurityPolicy::default`]. Lists are
/// comma separated.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct PolicyArgs {
    /// Enable static validation of submitted code
    #[arg(long = "security-enabled", env = "MATHCELL_SECURITY_ENABLED", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub enabled: Option<bool>,

    #[arg(long = "security-max-source-chars", env = "MATHCELL_SECURITY_MAX_SOURCE_CHARS")]
    pub max_source_chars: Option<usize>,

    #[arg(long = "security-max-ast-nodes", env = "MATHCELL_SECURITY_MAX_AST_NODES")]
    pub max_ast_nodes: Option<usize>,

    #[arg(long = "security-max-ast-depth", env = "MATHCELL_SECURITY_MAX_AST_DEPTH")]
    pub max_ast_depth: Option<usize>,

    #[arg(long = "security-allow-imports", env = "MATHCELL_SECURITY_ALLOW_IMPORTS", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub allow_imports: Option<bool>,

    #[arg(long = "security-forbid-global", env = "MATHCELL_SECURITY_FORBID_GLOBAL", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub forbid_global_stmt: Option<bool>,

    #[arg(long = "security-forbid-nonlocal", env = "MATHCELL_SECURITY_FORBID_NONLOCAL", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub forbid_nonlocal_stmt: Option<bool>,

    #[arg(long = "security-forbidden-calls", env = "MATHCELL_SECURITY_FORBIDDEN_CALLS", value_delimiter = ',')]
    pub forbidden_call_names: Option<Vec<String>>,

    #[arg(long = "security-forbidden-parents", env = "MATHCELL_SECURITY_FORBIDDEN_PARENTS", value_delimiter = ',')]
    pub forbidden_attribute_parents: Option<Vec<String>>,

    #[arg(long = "security-forbidden-attributes", env = "MATHCELL_SECURITY_FORBIDDEN_ATTRIBUTES", value_delimiter = ',')]
    pub forbidden_attribute_names: Option<Vec<String>>,

    #[arg(long = "security-allowed-imports", env = "MATHCELL_SECURITY_ALLOWED_IMPORTS", value_delimiter = ',')]
    pub allowed_import_modules: Option<Vec<String>>,

    #[arg(long = "security-allowed-prefixes", env = "MATHCELL_SECURITY_ALLOWED_PREFIXES", value_delimiter = ',')]
    pub allowed_import_prefixes: Option<Vec<String>>,

    #[arg(long = "security-log-violations", env = "MATHCELL_SECURITY_LOG_VIOLATIONS", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub log_violations: Option<bool>,
}

fn clean(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

impl PolicyArgs {
    pub fn into_policy(self) -> SecurityPolicy {
        let mut policy = SecurityPolicy::default();
        if let Some(v) = self.enabled {
            policy.enabled = v;
        }
        if let Some(v) = self.max_source_chars {
            policy.max_source_chars = v;
        }
        if let Some(v) = self.max_ast_nodes {
            policy.max_ast_nodes = v;
        }
        if let Some(v) = self.max_ast_depth {
            policy.max_ast_depth = v;
        }
        if let Some(v) = self.allow_imports {
            policy.allow_imports = v;
        }
        if let Some(v) = self.forbid_global_stmt {
            policy.forbid_global_stmt = v;
        }
        if let Some(v) = self.forbid_nonlocal_stmt {
            policy.forbid_nonlocal_stmt = v;
        }
        if let Some(v) = self.forbidden_call_names {
            policy.forbidden_call_names = clean(v);
        }
        if let Some(v) = self.forbidden_attribute_parents {
            policy.forbidden_attribute_parents = clean(v);
        }
        if let Some(v) = self.forbidden_attribute_names {
            policy.forbidden_attribute_names = clean(v);
        }
        if let Some(v) = self.allowed_import_modules {
            policy.allowed_import_modules = clean(v);
        }
        if let Some(v) = self.allowed_import_prefixes {
            policy.allowed_import_prefixes = clean(v);
        }
        if let Some(v) = self.log_violations {
            policy.log_violations = v;
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        settings: SettingsArgs,
    }

    #[test]
    fn seconds_accept_fractions_and_reject_garbage() {
        assert_eq!(parse_seconds("1.5"), Ok(Duration::from_millis(1500)));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("inf").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn request_timeouts_have_a_floor() {
        assert!(parse_timeout(0.05).is_err());
        assert!(parse_timeout(f64::NAN).is_err());
        assert_eq!(parse_timeout(0.1), Ok(Duration::from_millis(100)));
    }

    #[test]
    fn flags_override_policy_defaults() {
        let cli = Cli::try_parse_from([
            "mathcell",
            "--eval-timeout",
            "5",
            "--security-allow-imports",
            "true",
            "--security-forbidden-calls",
            "eval, exec",
            "--security-max-ast-depth",
            "10",
        ])
        .unwrap();
        let settings = cli.settings.into_settings();
        assert_eq!(settings.eval_timeout, Duration::from_secs(5));
        assert!(settings.policy.allow_imports);
        assert_eq!(settings.policy.forbidden_call_names, vec!["eval", "exec"]);
        assert_eq!(settings.policy.max_ast_depth, 10);
        assert_eq!(settings.policy.max_ast_nodes, SecurityPolicy::default().max_ast_nodes);
    }

    #[test]
    fn memory_cap_has_a_floor() {
        let cli = Cli::try_parse_from(["mathcell", "--max-memory-mb", "64"]).unwrap();
        assert_eq!(cli.settings.into_settings().max_memory_mb, Some(MIN_MEMORY_MB));
        let cli = Cli::try_parse_from(["mathcell", "--max-memory-mb", "0"]).unwrap();
        assert_eq!(cli.settings.into_settings().max_memory_mb, None);
    }

    #[test]
    fn defaults_match_settings_default() {
        let cli = Cli::try_parse_from(["mathcell"]).unwrap();
        let mut settings = cli.settings.into_settings();
        // The environment of the test process may carry overrides.
        settings.worker_binary = None;
        if std::env::vars().all(|(key, _)| !key.starts_with("MATHCELL_")) {
            assert_eq!(settings, Settings::default());
        }
    }
}
